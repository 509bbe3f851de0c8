use thiserror::Error;

pub type Result<T> = std::result::Result<T, GroveError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroveError {
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}
