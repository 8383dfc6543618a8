use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest request head accepted before the switch.
pub const MAX_HEAD: usize = 8 * 1024;

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    /// Value of the `Upgrade` header.
    pub protocol: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("incomplete request head")]
    Incomplete,
    #[error("malformed request line")]
    InvalidRequest,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("request does not ask for an upgrade")]
    MissingUpgrade,
    #[error("request head exceeds {} bytes", MAX_HEAD)]
    TooLarge,
}

/// Parse a request head that ends with the blank line.
pub fn parse_upgrade_head(buf: &[u8]) -> Result<UpgradeRequest, HandshakeError> {
    let headers_end = find_headers_end(buf).ok_or(HandshakeError::Incomplete)?;
    let head = std::str::from_utf8(&buf[..headers_end]).map_err(|_| HandshakeError::InvalidRequest)?;

    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(HandshakeError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(HandshakeError::InvalidRequest)?;
    let path = parts.next().ok_or(HandshakeError::InvalidRequest)?;
    let version = parts.next().ok_or(HandshakeError::InvalidRequest)?;
    if parts.next().is_some() || !version.starts_with("HTTP/1.") {
        return Err(HandshakeError::InvalidRequest);
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':').ok_or(HandshakeError::InvalidHeader)?;
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let protocol = headers
        .get("upgrade")
        .filter(|p| !p.is_empty())
        .cloned()
        .ok_or(HandshakeError::MissingUpgrade)?;

    Ok(UpgradeRequest {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
        protocol,
        headers,
    })
}

pub fn switching_protocols(protocol: &str) -> String {
    format!("HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: {protocol}\r\n\r\n")
}

/// Read one request head and answer it.
///
/// The head is read a byte at a time so nothing past the blank line is
/// consumed; those bytes belong to the upgraded stream. Returns `None` if
/// the peer leaves before sending anything.
pub async fn accept<S>(stream: &mut S) -> anyhow::Result<Option<UpgradeRequest>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return reject(stream, HandshakeError::TooLarge).await;
        }
        if stream.read(&mut byte).await? == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(HandshakeError::Incomplete.into());
        }
        head.push(byte[0]);
    }

    match parse_upgrade_head(&head) {
        Ok(request) => {
            stream
                .write_all(switching_protocols(&request.protocol).as_bytes())
                .await?;
            stream.flush().await?;
            Ok(Some(request))
        }
        Err(e) => reject(stream, e).await,
    }
}

async fn reject<S>(stream: &mut S, err: HandshakeError) -> anyhow::Result<Option<UpgradeRequest>>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(BAD_REQUEST).await?;
    stream.flush().await?;
    Err(err.into())
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
