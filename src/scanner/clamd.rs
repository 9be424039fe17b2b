use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ScanVerdict, Scanner};
use crate::config::ConfigError;

/// Chunk size for INSTREAM uploads
const CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound on the reply we are willing to buffer
const MAX_REPLY_LEN: usize = 4 * 1024;

#[derive(Debug, Error)]
enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Reply too long")]
    ReplyTooLong,
}

/// Where clamd listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClamdAddress {
    Tcp(String),
    Unix(PathBuf),
}

impl ClamdAddress {
    /// Parse `unix:///path/to/socket` or `tcp://host:port`.
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        if let Some(path) = address.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ConfigError::ValidationError(
                    "CLAMD_ADDRESS unix socket path cannot be empty".to_string(),
                ));
            }
            return Ok(ClamdAddress::Unix(PathBuf::from(path)));
        }
        if let Some(host_port) = address.strip_prefix("tcp://") {
            if !host_port.contains(':') {
                return Err(ConfigError::ValidationError(format!(
                    "CLAMD_ADDRESS '{address}' must include a port"
                )));
            }
            return Ok(ClamdAddress::Tcp(host_port.to_string()));
        }
        Err(ConfigError::ValidationError(format!(
            "CLAMD_ADDRESS '{address}' must start with unix:// or tcp://"
        )))
    }
}

/// Scanner backed by a clamd daemon, using the `zINSTREAM` command.
pub struct ClamdScanner {
    address: ClamdAddress,
    timeout: Duration,
}

impl ClamdScanner {
    pub fn new(address: ClamdAddress, timeout: Duration) -> Self {
        Self { address, timeout }
    }

    async fn scan_inner(&self, data: &[u8]) -> Result<String, ScanError> {
        match &self.address {
            ClamdAddress::Tcp(addr) => {
                let mut stream = tokio::net::TcpStream::connect(addr).await?;
                instream(&mut stream, data).await
            }
            #[cfg(unix)]
            ClamdAddress::Unix(path) => {
                let mut stream = tokio::net::UnixStream::connect(path).await?;
                instream(&mut stream, data).await
            }
            #[cfg(not(unix))]
            ClamdAddress::Unix(_) => Err(ScanError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            ))),
        }
    }
}

#[async_trait]
impl Scanner for ClamdScanner {
    async fn scan(&self, data: &[u8]) -> ScanVerdict {
        let reply = tokio::time::timeout(self.timeout, self.scan_inner(data))
            .await
            .unwrap_or(Err(ScanError::Timeout(self.timeout)));

        match reply {
            Ok(reply) => {
                let verdict = parse_reply(&reply);
                if verdict == ScanVerdict::Unavailable {
                    tracing::warn!(reply = %reply, "Unexpected clamd reply");
                }
                verdict
            }
            Err(e) => {
                tracing::warn!(address = ?self.address, error = %e, "clamd scan failed");
                ScanVerdict::Unavailable
            }
        }
    }
}

/// Stream `data` to clamd and return its NUL-terminated reply.
async fn instream<S>(stream: &mut S, data: &[u8]) -> Result<String, ScanError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(b"zINSTREAM\0").await?;
    for chunk in data.chunks(CHUNK_SIZE) {
        stream.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
        stream.write_all(chunk).await?;
    }
    stream.write_all(&0u32.to_be_bytes()).await?;
    stream.flush().await?;

    let mut reply = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
        if let Some(end) = reply.iter().position(|&b| b == 0) {
            reply.truncate(end);
            break;
        }
        if reply.len() > MAX_REPLY_LEN {
            return Err(ScanError::ReplyTooLong);
        }
    }

    Ok(String::from_utf8_lossy(&reply).trim().to_string())
}

/// Interpret a clamd reply such as `stream: OK` or `stream: Eicar-Signature FOUND`.
fn parse_reply(reply: &str) -> ScanVerdict {
    let body = reply.strip_prefix("stream:").unwrap_or(reply).trim();
    if body == "OK" {
        return ScanVerdict::Clean;
    }
    match body.strip_suffix("FOUND") {
        Some(signature) => {
            let signature = signature.trim();
            if signature.is_empty() {
                ScanVerdict::Infected("unknown".to_string())
            } else {
                ScanVerdict::Infected(signature.to_string())
            }
        }
        None => ScanVerdict::Unavailable,
    }
}
