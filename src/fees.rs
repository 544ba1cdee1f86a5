//! Fee model and amount checks.
//!
//! The counterparty quotes send and receive amounts. [`check_amounts`] compares the network fee
//! those amounts imply with the fee modeled from fixed transaction sizes and the current fee
//! estimations, and fails closed when the counterparty asks for too much.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::swap::{Currency, Pair, SwapType};

/// Fee rate estimations in sat/vbyte per currency.
pub type FeeEstimations = HashMap<Currency, f64>;

/// Relative fee tolerance in percent of the modeled fee.
pub const RELATIVE_FEE_TOLERANCE: Percentage = Percentage(25.0);
/// Absolute fee tolerance in sat.
pub const ABSOLUTE_FEE_TOLERANCE_SAT: u64 = 1500;
/// Lower bound of a Lightning payment fee limit in sat.
pub const MIN_PAYMENT_FEE_LIMIT_SAT: u64 = 5;

/// A percentage, e.g. `0.5` for 0.5 %.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Percentage(pub f64);

impl Percentage {
    /// `ceil(value * p / 100)`.
    pub fn calculate(&self, value: u64) -> u64 {
        (value as f64 * self.0 / 100.0).ceil() as u64
    }
}

impl std::fmt::Display for Percentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Virtual sizes of the transactions a swap needs.
#[derive(Debug, Clone, Copy)]
pub struct TxSizes {
    /// Claim of a submarine lockup.
    pub normal_claim: u64,
    /// Lockup of a reverse swap.
    pub reverse_lockup: u64,
    /// Claim of a reverse lockup.
    pub reverse_claim: u64,
}

impl TxSizes {
    /// Sizes for `currency`.
    pub fn of(currency: Currency) -> Self {
        match currency {
            Currency::Btc => TxSizes {
                normal_claim: 151,
                reverse_lockup: 154,
                reverse_claim: 111,
            },
            Currency::Liquid => TxSizes {
                normal_claim: 1337,
                reverse_lockup: 2503,
                reverse_claim: 1309,
            },
        }
    }
}

/// Represents errors of the amount checks.
#[derive(Debug, Clone, PartialEq)]
pub enum FeeError {
    /// The implied network fee exceeds the modeled fee plus tolerance.
    InvalidOnchainFee {
        /// Network fee implied by the quoted amounts.
        actual: i64,
        /// Modeled network fee.
        expected: u64,
        /// Allowed deviation.
        tolerance: u64,
    },
    /// A required fee estimation is missing.
    MissingEstimation(Currency),
}

impl std::fmt::Display for FeeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeeError::InvalidOnchainFee {
                actual,
                expected,
                tolerance,
            } => write!(
                f,
                "onchain fee way above expectation: {actual} > {expected}+{tolerance}"
            ),
            FeeError::MissingEstimation(currency) => {
                write!(f, "no estimation for currency {currency}")
            }
        }
    }
}

impl std::error::Error for FeeError {}

/// Modeled network fee of a swap. `include_claim` adds our claim of a reverse lockup.
pub fn calculate_network_fee(
    swap_type: SwapType,
    pair: Pair,
    estimations: &FeeEstimations,
    include_claim: bool,
) -> u64 {
    let rate = |currency: Currency| estimations.get(&currency).copied().unwrap_or(0.0);
    match swap_type {
        SwapType::Submarine => {
            (TxSizes::of(pair.from).normal_claim as f64 * rate(pair.from)).ceil() as u64
        }
        SwapType::Reverse => {
            let sizes = TxSizes::of(pair.to);
            let mut size = sizes.reverse_lockup;
            if include_claim {
                size += sizes.reverse_claim;
            }
            (size as f64 * rate(pair.to)).ceil() as u64
        }
        SwapType::Chain => {
            calculate_network_fee(SwapType::Submarine, pair, estimations, include_claim)
                + calculate_network_fee(SwapType::Reverse, pair, estimations, include_claim)
        }
    }
}

/// Currencies whose estimation a swap type needs.
pub fn required_estimations(swap_type: SwapType, pair: Pair) -> Vec<Currency> {
    match swap_type {
        SwapType::Submarine => vec![pair.from],
        SwapType::Reverse => vec![pair.to],
        SwapType::Chain => vec![pair.from, pair.to],
    }
}

fn check_tolerance(expected: u64, actual: i64) -> Result<(), FeeError> {
    let tolerance = ABSOLUTE_FEE_TOLERANCE_SAT.max(RELATIVE_FEE_TOLERANCE.calculate(expected));
    if actual > (expected + tolerance) as i64 {
        return Err(FeeError::InvalidOnchainFee {
            actual,
            expected,
            tolerance,
        });
    }
    Ok(())
}

/// Fails when the network fee implied by `send_amount - receive_amount - service fee` is above
/// the modeled fee plus tolerance.
pub fn check_amounts(
    swap_type: SwapType,
    pair: Pair,
    send_amount: u64,
    receive_amount: u64,
    service_fee: Percentage,
    estimations: &FeeEstimations,
    include_claim: bool,
) -> Result<(), FeeError> {
    let total_fees = send_amount as i64 - receive_amount as i64;
    let service = match swap_type {
        SwapType::Submarine => service_fee.calculate(receive_amount),
        _ => service_fee.calculate(send_amount),
    };
    let network_fees = total_fees - service as i64;

    for currency in required_estimations(swap_type, pair) {
        if !estimations.contains_key(&currency) {
            return Err(FeeError::MissingEstimation(currency));
        }
    }

    let expected = calculate_network_fee(swap_type, pair, estimations, include_claim);
    log::debug!(
        "Checking {swap_type} amounts {send_amount} -> {receive_amount}: network fee {network_fees}, expected {expected}"
    );
    check_tolerance(expected, network_fees)
}

/// Invoice expiry in seconds for a swap that times out in `blocks` blocks.
pub fn calculate_invoice_expiry(blocks: u32, currency: Currency) -> u64 {
    (blocks as u64 + 1) * currency.block_time_minutes() * 60
}

/// Maximum routing fee in sat for paying `amount_sat` with a limit of `ppm`.
pub fn payment_fee_limit(amount_sat: u64, ppm: u64) -> u64 {
    (amount_sat * ppm / 1_000_000).max(MIN_PAYMENT_FEE_LIMIT_SAT)
}
