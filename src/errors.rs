//! Error types surfaced by the SDS driver, split between transport and acquisition concerns.
use std::io;
use thiserror::Error;

/// Top-level acquisition errors surfaced to callers.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("config read failed: {0}")]
    /// Malformed or missing response while refreshing the device configuration.
    ConfigRead(String),
    #[error("timeout: {0}")]
    /// A wait predicate exceeded its time budget.
    Timeout(String),
    #[error("transport error: {0}")]
    /// Link failures outside the retryable envelope.
    Transport(#[from] TransportError),
    #[error("empty waveform on {0}")]
    /// The scope promised a waveform but returned only the terminator.
    EmptyWaveform(String),
    #[error("malformed waveform header: {0}")]
    /// Descriptor with no data, or a block without its terminator.
    MalformedHeader(String),
    #[error("protocol error: {0}")]
    /// Violations of the expected SCPI exchange.
    Protocol(String),
}

/// Link-level failures separated from acquisition-state issues.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    /// I/O failures from the underlying connection.
    Io(#[from] io::Error),
    #[error("send failed: {0}")]
    /// The command could not be written to the device.
    Send(String),
    #[error("malformed reply to {query}: {reply:?}")]
    /// The reply to a query did not parse as the requested type.
    Parse { query: String, reply: String },
    #[error("read error: {0}")]
    /// The response block could not be read.
    Read(String),
}

/// Convenience result alias for driver operations.
pub type Result<T> = std::result::Result<T, AcquisitionError>;
