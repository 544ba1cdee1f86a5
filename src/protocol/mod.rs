//! Taproot swap trees, MuSig2 signing and claim/refund transaction construction.
pub mod error;
pub mod musig2;
pub mod swap_tree;
pub mod transaction;
