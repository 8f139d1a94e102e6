use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Out of memory: {reason}")]
    OutOfMemory { reason: String },

    #[error("Invalid request size: {size} bytes - {reason}")]
    InvalidSize { size: usize, reason: String },

    #[error("Invalid alignment: {alignment} - {reason}")]
    InvalidAlignment { alignment: usize, reason: String },

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

pub type Result<T> = std::result::Result<T, PoolError>;
