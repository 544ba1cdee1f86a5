//! Top level error of the nursery.
//!
//! Wraps the errors of every subsystem the nursery drives:
//! - Counterparty API and websocket (ApiError)
//! - Swap trees, MuSig2 and transaction construction (ProtocolError)
//! - Amount checks (FeeError)
//! - Persistence (StoreError)
//! - Chain backends, wallets and the Lightning node

use std::sync::{MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    api::error::ApiError, fees::FeeError, lightning::LightningError, onchain::OnchainError,
    protocol::error::ProtocolError, store::StoreError,
};

/// Represents errors that can occur while driving swaps.
#[derive(Debug)]
pub enum NurseryError {
    /// Errors talking to the counterparty.
    Api(ApiError),
    /// Errors building or signing swap spends.
    Protocol(ProtocolError),
    /// The counterparty asked for more fees than tolerated.
    Fee(FeeError),
    /// Errors of the swap store.
    Store(StoreError),
    /// Errors of the chain backends and wallets.
    Onchain(OnchainError),
    /// Errors of the Lightning node.
    Lightning(LightningError),
    /// Standard IO errors.
    IO(std::io::Error),
    /// Human readable error not covered by other variants.
    General(String),
    /// Threading error when a mutex is poisoned due to a thread panic.
    MutexPoison,
}

impl std::fmt::Display for NurseryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::General(message) => f.write_str(message),
            Self::Api(e) => write!(f, "{e}"),
            Self::Fee(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Onchain(e) => write!(f, "{e}"),
            Self::Lightning(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
            _ => write!(f, "{self:?}"),
        }
    }
}

impl std::error::Error for NurseryError {}

impl NurseryError {
    /// Short name of the subsystem the error comes from.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Api(ApiError::Counterparty(_)) => "counterparty",
            Self::Api(_) => "api",
            Self::Protocol(_) => "protocol",
            Self::Fee(_) => "fee",
            Self::Store(_) => "store",
            Self::Onchain(_) => "onchain",
            Self::Lightning(_) => "lightning",
            Self::IO(_) => "io",
            Self::General(_) => "general",
            Self::MutexPoison => "mutex",
        }
    }

    /// Whether the counterparty itself rejected a request.
    pub fn is_counterparty(&self) -> bool {
        match self {
            Self::Api(e) => e.is_counterparty(),
            Self::Protocol(ProtocolError::Api(e)) => e.is_counterparty(),
            _ => false,
        }
    }
}

impl From<ApiError> for NurseryError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl From<ProtocolError> for NurseryError {
    fn from(value: ProtocolError) -> Self {
        Self::Protocol(value)
    }
}

impl From<FeeError> for NurseryError {
    fn from(value: FeeError) -> Self {
        Self::Fee(value)
    }
}

impl From<StoreError> for NurseryError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<OnchainError> for NurseryError {
    fn from(value: OnchainError) -> Self {
        Self::Onchain(value)
    }
}

impl From<LightningError> for NurseryError {
    fn from(value: LightningError) -> Self {
        Self::Lightning(value)
    }
}

impl From<std::io::Error> for NurseryError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl<'a, T> From<PoisonError<MutexGuard<'a, T>>> for NurseryError {
    fn from(_: PoisonError<MutexGuard<'a, T>>) -> Self {
        Self::MutexPoison
    }
}

impl<'a, T> From<PoisonError<RwLockReadGuard<'a, T>>> for NurseryError {
    fn from(_: PoisonError<RwLockReadGuard<'a, T>>) -> Self {
        Self::MutexPoison
    }
}

impl<'a, T> From<PoisonError<RwLockWriteGuard<'a, T>>> for NurseryError {
    fn from(_: PoisonError<RwLockWriteGuard<'a, T>>) -> Self {
        Self::MutexPoison
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_display() {
        let err = NurseryError::from(ApiError::Counterparty("could not find swap".to_string()));
        assert_eq!(err.kind(), "counterparty");
        assert!(err.is_counterparty());
        assert_eq!(err.to_string(), "counterparty error: could not find swap");

        let err = NurseryError::General("no address or wallet set".to_string());
        assert_eq!(err.kind(), "general");
        assert!(!err.is_counterparty());
        assert_eq!(err.to_string(), "no address or wallet set");

        let err = NurseryError::from(FeeError::InvalidOnchainFee {
            actual: 4525,
            expected: 302,
            tolerance: 1500,
        });
        assert_eq!(err.kind(), "fee");
    }
}
