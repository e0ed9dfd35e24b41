//! Crate error type

use thiserror::Error;

use crate::buffer::PoolId;
use crate::frame::EntityState;
use crate::pipeline::PipeId;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers to decide between retry, error-notify and abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ResourceExhaustion,
    StageFailure,
    SelectionTimeout,
    Fatal,
    Other,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("allocation failed for {pool}: {reason}")]
    Allocation { pool: String, reason: String },

    #[error("no buffer available in {0}")]
    NoBufferAvailable(String),

    #[error("buffer index {index} is not valid for {pool:?}")]
    InvalidBuffer { pool: PoolId, index: usize },

    #[error("{pipe:?}: illegal state transition {from:?} -> {to:?}")]
    InvalidTransition {
        pipe: PipeId,
        from: EntityState,
        to: EntityState,
    },

    #[error("{pipe:?}: no {slot} buffer bound")]
    NoBufferBound { pipe: PipeId, slot: &'static str },

    #[error("{0:?} is not a stage of this graph")]
    NoSuchStage(PipeId),

    #[error("frame factory {0} is not ready")]
    FactoryNotReady(String),

    #[error("frame arena is full ({0} frames live)")]
    OutOfMemory(usize),

    #[error("no request bound to frame count {0}")]
    RequestNotFound(u32),

    #[error("no held frame satisfies frame count {0}")]
    SelectionTimeout(u32),

    #[error("pipe {0:?} is stopped")]
    PipeStopped(PipeId),

    #[error("{pipe:?} failed: {reason}")]
    Stage { pipe: PipeId, reason: String },

    #[error("device is in a fatal state: {0}")]
    DeviceFatal(String),

    #[error("flush in progress")]
    Flushing,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Settings(#[from] config::ConfigError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::Settings(_) | Error::InvalidBuffer { .. } => {
                ErrorKind::Configuration
            }
            Error::Allocation { .. }
            | Error::NoBufferAvailable(_)
            | Error::OutOfMemory(_)
            | Error::FactoryNotReady(_) => ErrorKind::ResourceExhaustion,
            Error::Stage { .. } | Error::PipeStopped(_) => ErrorKind::StageFailure,
            Error::SelectionTimeout(_) => ErrorKind::SelectionTimeout,
            Error::DeviceFatal(_) => ErrorKind::Fatal,
            _ => ErrorKind::Other,
        }
    }

    /// True when the immediate caller may back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoBufferAvailable(_) | Error::OutOfMemory(_) | Error::SelectionTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_retryable_but_fatal_is_not() {
        assert!(Error::NoBufferAvailable("bayer".into()).is_retryable());
        assert!(Error::SelectionTimeout(3).is_retryable());
        assert!(!Error::DeviceFatal("stall".into()).is_retryable());
        assert_eq!(Error::DeviceFatal("stall".into()).kind(), ErrorKind::Fatal);
        assert_eq!(
            Error::Config("bad".into()).kind(),
            ErrorKind::Configuration
        );
    }
}
