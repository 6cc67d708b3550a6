use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use signal_hook::{
    consts::signal::*,
    flag::{register, register_conditional_default},
};

/// Cooperative shutdown flag set by SIGINT/SIGTERM. The first signal asks
/// loops to drain and stop; a second one falls through to the default
/// handler and kills the process.
#[derive(Clone, Debug)]
pub struct Termination {
    terminating: Arc<AtomicBool>,
}

impl Termination {
    pub fn install() -> Result<Self, std::io::Error> {
        let terminating = Arc::new(AtomicBool::new(false));

        for signal in [SIGINT, SIGTERM] {
            register_conditional_default(signal, terminating.clone())?;
            register(signal, terminating.clone())?;
        }

        Ok(Self { terminating })
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}
