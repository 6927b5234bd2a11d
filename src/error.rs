use thiserror::Error;

#[derive(Error, Debug)]
pub enum WarrenError {
    #[error("Failed to bind {role} endpoint {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WarrenError>;
