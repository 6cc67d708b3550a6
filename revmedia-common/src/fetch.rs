use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DOWNLOAD_ATTEMPTS: u32 = 3;

const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.7; rv:19.0) Gecko/20100101 Firefox/19.0";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP{code} from {url}")]
    Status {
        code: u16,
        url: String,
        body_mentions_404: bool,
    },
    #[error("transport error")]
    Transport(#[from] reqwest::Error),
}

impl FetchError {
    /// Dead links are noise, not errors. The upstream hosts are sloppy about
    /// status codes, so a 200-ish body containing "404" counts too.
    pub fn is_not_found(&self) -> bool {
        match self {
            FetchError::Status {
                code,
                body_mentions_404,
                ..
            } => *code == 404 || *body_mentions_404,
            FetchError::Transport(_) => false,
        }
    }
}

/// Downloads media through the outbound proxy. Each worker thread owns its
/// own `Fetcher` so connection pools are never shared.
pub struct Fetcher {
    client: reqwest::blocking::Client,
}

impl Fetcher {
    pub fn new(proxy: Option<&str>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(DEFAULT_TIMEOUT)
            // The targets are heterogeneous third-party hosts, many with
            // broken chains; the proxy is the trust boundary.
            .danger_accept_invalid_certs(true);

        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// GET the URL and return the body bytes. Transport truncations are
    /// retried a few times; every other failure is returned as-is.
    pub fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 1;
        loop {
            match self.download_once(url) {
                Err(FetchError::Transport(e))
                    if attempt < DOWNLOAD_ATTEMPTS && is_truncation(&e) =>
                {
                    log::debug!("Retrying truncated transfer ({attempt}) of {url}: {e}");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn download_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send()?;
        let code = response.status().as_u16();
        if code == 200 {
            return Ok(response.bytes()?.to_vec());
        }

        let body_mentions_404 = response
            .text()
            .map(|body| body.contains("404"))
            .unwrap_or(false);
        Err(FetchError::Status {
            code,
            url: url.to_string(),
            body_mentions_404,
        })
    }
}

fn is_truncation(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        let text = e.to_string();
        if text.contains("transfer closed") || text.contains("connection closed") {
            return true;
        }
        source = e.source();
    }
    false
}
