mod clamd;

pub use clamd::{ClamdAddress, ClamdScanner};

use async_trait::async_trait;

/// Result of scanning a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    /// Carries the signature or reason reported by the scanner.
    Infected(String),
    /// The scanner could not be reached or gave no usable answer.
    Unavailable,
}

/// Abstraction over virus scanners.
/// Timeouts and retries are the implementation's concern; callers treat
/// `Unavailable` as a failed scan.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, data: &[u8]) -> ScanVerdict;
}
