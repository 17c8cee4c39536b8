/// Error types shared by all canopy crates
use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The raster engine reported a hard error
    #[error("raster engine error: {0}")]
    Raster(#[from] gdal::errors::GdalError),

    /// Malformed GeoJSON, CSV or JSON input
    #[error("schema error: {0}")]
    Schema(String),

    /// Transport failure or non-2xx response
    #[error("network error: {0}")]
    Network(String),

    /// OAuth token exchange failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Stored checksum does not match the payload
    #[error("integrity check failed for cache key {0}")]
    Integrity(String),

    /// State machine reached an impossible state; this is a programmer bug
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Requested tile or weather day does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad user-supplied flag or empty input file
    #[error("invalid input: {0}")]
    InputDomain(String),
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Schema(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Schema(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

/// Type alias for Results using the shared Error
pub type Result<T> = std::result::Result<T, Error>;
