use cluster::HaError;

/// Error type for server configuration and startup errors
#[derive(Debug)]
pub enum ServerError {
    InvalidPort(String),
    IoError(std::io::Error),
    Ha(HaError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::InvalidPort(msg) => write!(f, "Invalid port: {}", msg),
            ServerError::IoError(e) => write!(f, "IO error: {}", e),
            ServerError::Ha(e) => write!(f, "HA error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::IoError(err)
    }
}

impl From<HaError> for ServerError {
    fn from(err: HaError) -> Self {
        ServerError::Ha(err)
    }
}
