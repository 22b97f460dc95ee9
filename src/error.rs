//! Error types.

/// Boxed error used for request bodies and the per-request error list.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error type returned by kiln's fallible infrastructure operations.
///
/// Application-level failures (404, 500, etc.) are expressed as HTTP
/// responses, not as `Error`s. This type surfaces binding to a port or
/// accepting a connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Conditions reported by the body-capture layer.
///
/// None of these are logged automatically; the caller decides.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// No capture was installed on this request.
    #[error("capture buffer not found")]
    NotFound,

    /// A capture is installed but nothing has been written yet.
    #[error("capture buffer empty")]
    Empty,

    /// The transport body failed while being buffered.
    #[error("reading request body: {0}")]
    Read(#[source] BoxError),
}

/// The error value recorded for a recovered handler panic.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Panic(pub String);
