use crate::Port;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Everything that can go wrong while serving one broker connection.
///
/// None of these is fatal to the broker; the worst outcome is the end of the
/// connection that hit an `Io` error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no port allocated within {0:?}")]
    AllocationTimeout(Duration),

    #[error("no free port: {0}")]
    NoFreePort(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("no route to port {0}")]
    MissingRoute(Port),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("forward to port {port} failed: {source}")]
    Forward {
        port: Port,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RelayError>;
