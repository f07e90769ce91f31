//! Error and cancellation types.

use std::fmt;

/// Which loop level a callback asked to abandon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cancel {
    Batch,
    Epoch,
    Fit,
}

impl fmt::Display for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cancel::Batch => "batch",
            Cancel::Epoch => "epoch",
            Cancel::Fit => "fit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cooperative cancellation raised by a callback. Only the matching loop level catches it.
    #[error("{0} cancelled")]
    Cancelled(Cancel),

    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An event was dispatched to a callback that is already running, i.e. from inside a hook.
    #[error("cannot dispatch {0} while a callback is running")]
    Reentrant(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn cancel_batch() -> Self {
        Self::Cancelled(Cancel::Batch)
    }

    pub fn cancel_epoch() -> Self {
        Self::Cancelled(Cancel::Epoch)
    }

    pub fn cancel_fit() -> Self {
        Self::Cancelled(Cancel::Fit)
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Msg(msg.into())
    }

    pub fn cancel_kind(&self) -> Option<Cancel> {
        match self {
            Self::Cancelled(kind) => Some(*kind),
            _ => None,
        }
    }

    pub fn is_cancelled(&self, kind: Cancel) -> bool {
        self.cancel_kind() == Some(kind)
    }
}
