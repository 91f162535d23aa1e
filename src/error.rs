use thiserror::Error;

use crate::ast::DocumentError;
use crate::cache::{ContractError, PatchError};
use crate::config::ConfigError;
use crate::transport::{TransportError, TransportPhase};

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
///
/// A failed mutation has already applied its optimistic pass; a failed
/// query has touched nothing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (the cache or server changed).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the per-boundary errors; nothing is ever
/// constructed directly as `Error`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Config(_) | Error::Contract(_) | Error::Document(_) => Transience::Permanent,
            Error::Transport(_) => Transience::Retryable,
            Error::Patch(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Config(_) | Error::Contract(_) | Error::Document(_) => Effect::None,
            // A mutation's optimistic pass has already run by the time the
            // transport can fail; a query error leaves every cache intact.
            Error::Transport(e) => match e.phase {
                TransportPhase::Query | TransportPhase::Subscription => Effect::None,
                TransportPhase::Mutation => Effect::Some,
            },
            Error::Patch(_) => Effect::None,
        }
    }
}
