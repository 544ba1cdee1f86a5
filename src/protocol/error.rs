//! Errors of the taproot swap tree, MuSig2 signing and transaction construction.

use crate::api::error::ApiError;

/// Represents errors encountered while building, signing or finalizing swap spends.
#[derive(Debug)]
pub enum ProtocolError {
    /// Represents an error in Taproot Script handling.
    Script(bitcoin::taproot::TaprootBuilderError),
    /// Represents an error in building a Taproot Tree.
    Builder(bitcoin::taproot::TaprootBuilder),
    /// General error not covered by other variants.
    General(&'static str),
    /// Represents an error related to secp256k1 musig operations.
    Secp(secp256k1::Error),
    /// Represents an error related to bitcoin::secp256k1 operations.
    BitcoinSecp(bitcoin::secp256k1::Error),
    /// Represents an error with secp256k1::scalar conversion.
    Scalar(secp256k1::scalar::OutOfRangeError),
    /// Represents an error with tweaking the aggregated key.
    Tweak(secp256k1::musig::InvalidTweakErr),
    /// A nonce or partial signature could not be parsed.
    MusigParse(secp256k1::musig::ParseError),
    /// Error computing a taproot signature hash.
    Sighash(bitcoin::sighash::TaprootError),
    /// Error computing a sighash for a mismatched prevout index.
    Prevouts(bitcoin::sighash::PrevoutsIndexError),
    /// Transaction (de)serialization failure.
    Encode(bitcoin::consensus::encode::Error),
    /// Invalid address string.
    Address(bitcoin::address::ParseError),
    /// Hash has the wrong length. Sighashes must be 32 bytes.
    InvalidHashLength(usize),
    /// Public nonce has the wrong length. Nonces must be 66 bytes.
    InvalidNonceLength(usize),
    /// The counterparty partial signature did not verify.
    InvalidPartialSignature,
    /// The combined signature does not verify against the tweaked key.
    InvalidAggregatedSignature,
    /// The derived taproot address differs from the expected one.
    AddressMismatch {
        /// Address derived from the tree.
        expected: String,
        /// Address reported by the counterparty.
        found: String,
    },
    /// The preimage does not hash to the committed payment hash.
    PreimageMismatch,
    /// Spending on this currency is not supported.
    UnsupportedCurrency(String),
    /// The lockup output index does not exist.
    MissingOutput(u32),
    /// The output cannot pay its share of the fee.
    ValueBelowFee {
        /// Value of the spent output.
        value: u64,
        /// Assigned fee share.
        fee: u64,
    },
    /// Every output of a construction was rejected.
    AllOutputsInvalid,
    /// The counterparty could not provide a cooperative signature.
    Api(ApiError),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllOutputsInvalid => write!(f, "all outputs invalid"),
            Self::PreimageMismatch => write!(f, "wrong preimage"),
            Self::ValueBelowFee { value, fee } => write!(f, "value less than fee: {value} < {fee}"),
            Self::InvalidHashLength(len) => write!(f, "invalid hash length {len}"),
            Self::InvalidNonceLength(len) => write!(f, "invalid nonce length {len}"),
            _ => write!(f, "{self:?}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<bitcoin::taproot::TaprootBuilderError> for ProtocolError {
    fn from(value: bitcoin::taproot::TaprootBuilderError) -> Self {
        Self::Script(value)
    }
}

impl From<bitcoin::taproot::TaprootBuilder> for ProtocolError {
    fn from(value: bitcoin::taproot::TaprootBuilder) -> Self {
        Self::Builder(value)
    }
}

impl From<bitcoin::sighash::TaprootError> for ProtocolError {
    fn from(value: bitcoin::sighash::TaprootError) -> Self {
        Self::Sighash(value)
    }
}

impl From<bitcoin::sighash::PrevoutsIndexError> for ProtocolError {
    fn from(value: bitcoin::sighash::PrevoutsIndexError) -> Self {
        Self::Prevouts(value)
    }
}

impl From<secp256k1::Error> for ProtocolError {
    fn from(value: secp256k1::Error) -> Self {
        Self::Secp(value)
    }
}

impl From<bitcoin::secp256k1::Error> for ProtocolError {
    fn from(value: bitcoin::secp256k1::Error) -> Self {
        Self::BitcoinSecp(value)
    }
}

impl From<secp256k1::scalar::OutOfRangeError> for ProtocolError {
    fn from(value: secp256k1::scalar::OutOfRangeError) -> Self {
        Self::Scalar(value)
    }
}

impl From<secp256k1::musig::InvalidTweakErr> for ProtocolError {
    fn from(value: secp256k1::musig::InvalidTweakErr) -> Self {
        Self::Tweak(value)
    }
}

impl From<secp256k1::musig::ParseError> for ProtocolError {
    fn from(value: secp256k1::musig::ParseError) -> Self {
        Self::MusigParse(value)
    }
}

impl From<bitcoin::consensus::encode::Error> for ProtocolError {
    fn from(value: bitcoin::consensus::encode::Error) -> Self {
        Self::Encode(value)
    }
}

impl From<bitcoin::address::ParseError> for ProtocolError {
    fn from(value: bitcoin::address::ParseError) -> Self {
        Self::Address(value)
    }
}

impl From<ApiError> for ProtocolError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}
