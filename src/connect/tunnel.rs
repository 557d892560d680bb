//! HTTP `CONNECT` tunnels through HTTP proxies.
//!
//! A tunnel is established on a freshly connected proxy socket before any TLS
//! handshake. When the proxy challenges for credentials the route's
//! [`Authenticator`][crate::address::Authenticator] is asked for a follow up request,
//! which is sent on the same connection unless the proxy asked to close it.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;

use http::header::{self, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use tracing::{debug, trace};

use super::ConnectError;
use crate::address::Address;
use crate::route::Route;

/// How many `CONNECT` requests may be sent to establish a single tunnel, counted
/// across every proxy connection opened for it.
pub const MAX_TUNNEL_ATTEMPTS: usize = 21;

const USER_AGENT: &str = concat!("hyperdial/", env!("CARGO_PKG_VERSION"));

// Bound on header lines, so a misbehaving proxy can't stall us forever.
const MAX_HEADERS: usize = 100;

// Bound on a single status, header or chunk size line.
const MAX_LINE: usize = 8 * 1024;

/// The initial `CONNECT` request for `address`.
///
/// The request is sent before any authentication challenge, so it carries no
/// credentials.
pub fn request(address: &Address) -> Result<Request<()>, ConnectError> {
    let authority = match address.url().authority() {
        Some(authority) => authority.as_str().to_owned(),
        None => format!("{}:{}", address.host(), address.port()),
    };

    Request::builder()
        .method(Method::CONNECT)
        .uri(authority.as_str())
        .header(header::HOST, authority.as_str())
        .header(
            HeaderName::from_static("proxy-connection"),
            HeaderValue::from_static("Keep-Alive"),
        )
        .header(header::USER_AGENT, USER_AGENT)
        .body(())
        .map_err(|error| ConnectError::Protocol(format!("invalid tunnel request: {error}")))
}

/// Establish a tunnel on `stream`, starting with `request`.
///
/// Returns `Ok(None)` once the tunnel is open. Returns `Ok(Some(request))` when the
/// proxy demanded credentials and the connection can't carry another request: the
/// caller should connect again and retry with the returned request.
///
/// `attempts` counts the requests sent for this tunnel and is shared by every
/// connection the caller opens, so the total never exceeds [`MAX_TUNNEL_ATTEMPTS`].
#[tracing::instrument(skip_all, level = "debug", fields(route = %route))]
pub fn establish(
    stream: &TcpStream,
    mut request: Request<()>,
    route: &Route,
    attempts: &mut usize,
) -> Result<Option<Request<()>>, ConnectError> {
    let mut reader = BufReader::new(stream);

    while *attempts < MAX_TUNNEL_ATTEMPTS {
        *attempts += 1;
        write_request(reader.get_ref(), &request)?;
        let response = read_response(&mut reader)?;
        trace!(status = %response.status(), attempts = *attempts, "tunnel response");

        match response.status() {
            StatusCode::OK => {
                // Anything beyond the response belongs to a TLS server that spoke first.
                if !reader.buffer().is_empty() {
                    return Err(ConnectError::Protocol(
                        "TLS tunnel buffered too many bytes".into(),
                    ));
                }
                debug!("tunnel established");
                return Ok(None);
            }
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let reusable = discard_body(&mut reader, &response)?;
                let next = route
                    .address()
                    .proxy_authenticator()
                    .authenticate(Some(route), &response)
                    .ok_or_else(|| {
                        ConnectError::Protocol("failed to authenticate with proxy".into())
                    })?;

                if !reusable || connection_close(&response) {
                    return Ok(Some(next));
                }
                request = next;
            }
            status => {
                return Err(ConnectError::Protocol(format!(
                    "unexpected response code for CONNECT: {}",
                    status.as_u16()
                )));
            }
        }
    }

    Err(too_many_attempts())
}

pub(crate) fn too_many_attempts() -> ConnectError {
    ConnectError::Protocol(format!(
        "too many tunnel connections attempted: {MAX_TUNNEL_ATTEMPTS}"
    ))
}

fn write_request(mut stream: &TcpStream, request: &Request<()>) -> io::Result<()> {
    let mut buf = format!("{} {} HTTP/1.1\r\n", request.method(), request.uri()).into_bytes();
    for (name, value) in request.headers() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");

    stream.write_all(&buf)?;
    stream.flush()
}

/// Read a response head. The body, if any, is left in `reader`.
fn read_response<R: BufRead>(reader: &mut R) -> Result<Response<()>, ConnectError> {
    let head = read_head(reader)?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ConnectError::Protocol("incomplete tunnel response".into()));
        }
        Err(httparse::Error::Version | httparse::Error::Status) => {
            return Err(unexpected_status_line(&head));
        }
        Err(error) => {
            return Err(ConnectError::Protocol(format!(
                "invalid tunnel response: {error}"
            )));
        }
    }

    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| unexpected_status_line(&head))?;

    let mut response = Response::builder().status(status);
    for header in parsed.headers.iter() {
        response = response.header(header.name, header.value);
    }
    response
        .body(())
        .map_err(|error| ConnectError::Protocol(format!("invalid tunnel response: {error}")))
}

/// Read the status line and headers, through the blank line which ends them.
fn read_head<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, ConnectError> {
    let mut head = Vec::new();

    // The status line, the headers and the blank line.
    for _ in 0..MAX_HEADERS + 2 {
        let line = read_line(reader)?;
        let done = !head.is_empty() && is_blank(&line);
        head.extend_from_slice(&line);
        if done {
            return Ok(head);
        }
    }

    Err(ConnectError::Protocol(
        "too many headers in tunnel response".into(),
    ))
}

/// Read one line, including its terminator.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, ConnectError> {
    let mut line = Vec::new();
    reader
        .by_ref()
        .take(MAX_LINE as u64)
        .read_until(b'\n', &mut line)?;

    if line.ends_with(b"\n") {
        Ok(line)
    } else if line.len() >= MAX_LINE {
        Err(ConnectError::Protocol(format!(
            "line longer than {MAX_LINE} bytes in tunnel response"
        )))
    } else {
        Err(ConnectError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "proxy closed the connection",
        )))
    }
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn unexpected_status_line(head: &[u8]) -> ConnectError {
    let line = head.split(|&b| b == b'\n').next().unwrap_or_default();
    ConnectError::Protocol(format!(
        "unexpected status line: {}",
        String::from_utf8_lossy(line).trim_end()
    ))
}

/// Discard a challenge body so the connection can carry the next request.
///
/// Returns `false` when the body has no framing and so runs until the proxy closes
/// the connection.
fn discard_body<R: BufRead>(reader: &mut R, response: &Response<()>) -> Result<bool, ConnectError> {
    if is_chunked(response) {
        discard_chunks(reader)?;
        return Ok(true);
    }

    match content_length(response)? {
        Some(length) => {
            skip(reader, length)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn discard_chunks<R: BufRead>(reader: &mut R) -> Result<(), ConnectError> {
    loop {
        let line = read_line(reader)?;
        let size = match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => size,
            _ => {
                return Err(ConnectError::Protocol(format!(
                    "invalid chunk size in tunnel response: {}",
                    String::from_utf8_lossy(&line).trim_end()
                )));
            }
        };
        if size == 0 {
            break;
        }

        skip(reader, size)?;
        if !is_blank(&read_line(reader)?) {
            return Err(ConnectError::Protocol(
                "invalid chunk in tunnel response".into(),
            ));
        }
    }

    // Trailers.
    for _ in 0..=MAX_HEADERS {
        if is_blank(&read_line(reader)?) {
            return Ok(());
        }
    }
    Err(ConnectError::Protocol(
        "too many trailers in tunnel response".into(),
    ))
}

fn skip<R: BufRead>(reader: &mut R, length: u64) -> Result<(), ConnectError> {
    let skipped = io::copy(&mut reader.by_ref().take(length), &mut io::sink())?;
    if skipped < length {
        return Err(ConnectError::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}

fn is_chunked(response: &Response<()>) -> bool {
    response
        .headers()
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(response: &Response<()>) -> Result<Option<u64>, ConnectError> {
    let Some(value) = response.headers().get(header::CONTENT_LENGTH) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| ConnectError::Protocol("invalid content-length in tunnel response".into()))
}

fn connection_close(response: &Response<()>) -> bool {
    response
        .headers()
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("close"))
}
