use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{self, Context};

use revmedia_common::bin_common::termination::Termination;

/// Uploads are data-url encoded images; anything bigger than this is not a
/// search request.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Arc<Vec<u8>>,
}

impl Response {
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: Arc::new(body),
        }
    }

    pub fn bytes(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type,
            body: Arc::new(body),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain",
            body: Arc::new(b"not found".to_vec()),
        }
    }

    pub fn bad_request() -> Self {
        Self {
            status: 400,
            content_type: "text/plain",
            body: Arc::new(b"bad request".to_vec()),
        }
    }
}

/// Accept loop plus a fixed pool of handler threads. Each handler owns its
/// own state (`make_handler` runs once per thread), connections are one
/// request, one response, close.
pub fn serve<H>(
    addr: &str,
    handlers: Vec<H>,
    termination: &Termination,
) -> eyre::Result<()>
where
    H: FnMut(&Request) -> Response + Send,
{
    let listener = TcpListener::bind(addr).wrap_err_with(|| format!("failed to bind {addr}"))?;
    listener
        .set_nonblocking(true)
        .wrap_err("failed to make the listener nonblocking")?;
    log::info!("Listening on {addr}");

    let (tx, rx) = crossbeam_channel::bounded::<TcpStream>(handlers.len() * 2);

    std::thread::scope(|s| {
        for (i, mut handler) in handlers.into_iter().enumerate() {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("H{i:02}"))
                .spawn_scoped(s, move || {
                    while let Ok(stream) = rx.recv() {
                        handle_connection(stream, &mut handler);
                    }
                })
                .expect("failed to spawn a handler thread");
        }
        drop(rx);

        loop {
            if termination.is_terminating() {
                log::info!("Termination requested, closing the listener");
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    if tx.send(stream).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
        drop(tx);
    });

    Ok(())
}

fn handle_connection<H>(mut stream: TcpStream, handler: &mut H)
where
    H: FnMut(&Request) -> Response,
{
    // the listener is nonblocking, this socket must not be
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(READ_TIMEOUT));

    let response = match read_request(&mut stream) {
        Ok(request) => handler(&request),
        Err(e) => {
            log::warn!("Rejecting a request: {e}");
            Response::bad_request()
        }
    };
    if let Err(e) = write_response(&mut stream, &response) {
        log::debug!("Could not write a response: {e}");
    }
}

pub fn read_request<R: Read>(reader: R) -> eyre::Result<Request> {
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .wrap_err("failed to read the request line")?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| eyre::eyre!("empty request line"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| eyre::eyre!("no request target"))?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    };

    let mut content_length = 0usize;
    let mut content_type = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).wrap_err("failed to read a header")?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            match name.to_ascii_lowercase().as_str() {
                "content-length" => {
                    content_length = value.trim().parse().unwrap_or(0);
                }
                "content-type" => content_type = value.trim().to_string(),
                _ => (),
            }
        }
    }

    if content_length > MAX_BODY_BYTES {
        eyre::bail!("request body of {content_length} bytes is too large");
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader
            .read_exact(&mut body)
            .wrap_err("failed to read the request body")?;
    }

    Ok(Request {
        method,
        path,
        query,
        content_type,
        body,
    })
}

pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> std::io::Result<()> {
    let reason = match response.status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    write!(
        writer,
        "HTTP/1.1 {} {reason}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.content_type,
        response.body.len()
    )?;
    writer.write_all(&response.body)?;
    writer.flush()
}
