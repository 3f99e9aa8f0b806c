use std::fmt;

use crate::config::ConfigError;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Store(sled::Error),
    Metadata(serde_json::Error),
    Config(ConfigError),
    Corrupt(&'static str),
    InvalidTopic(String),
    EmptyQueue,
    Closed,
}

impl Error {
    /// Pop found nothing ready. Callers usually treat this as "try later".
    pub fn is_empty_queue(&self) -> bool {
        matches!(self, Error::EmptyQueue)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Store(err) => write!(f, "store error: {err}"),
            Error::Metadata(err) => write!(f, "metadata error: {err}"),
            Error::Config(err) => write!(f, "{err}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::InvalidTopic(name) => write!(f, "invalid topic name: {name:?}"),
            Error::EmptyQueue => write!(f, "queue is empty"),
            Error::Closed => write!(f, "queue is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Store(err) => Some(err),
            Error::Metadata(err) => Some(err),
            Error::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<sled::Error> for Error {
    fn from(value: sled::Error) -> Self {
        Error::Store(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Metadata(value)
    }
}

impl From<ConfigError> for Error {
    fn from(value: ConfigError) -> Self {
        Error::Config(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
