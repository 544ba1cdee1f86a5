//! Claim and refund outputs handed to the transaction constructor.
//!
//! An [`Output`] pairs what the constructor needs with an [`OutputHandler`] that writes the
//! outcome back to the swap record. Every output is resolved exactly once: either its handler
//! sees the broadcast transaction or the reason it was dropped.

use std::collections::HashMap;

use bitcoin::{address::NetworkUnchecked, Address};

use super::Nursery;
use crate::{
    error::NurseryError,
    onchain::{OnchainError, OutputArgs, WalletId},
    protocol::transaction::{construct_transaction, Fee, LockupTree, OutputDetails},
    swap::{Currency, SwapType},
};

/// Writes the outcome of one output back to its swap.
pub(crate) trait OutputHandler: Send {
    /// The output was spent by `txid`, paying `fee` of it.
    fn on_success(&self, nursery: &Nursery, txid: &str, fee: u64) -> Result<(), NurseryError>;

    /// The output could not be spent.
    fn on_failure(&self, nursery: &Nursery, err: &str);
}

/// A swap output to claim or refund.
pub(crate) struct Output {
    pub swap_id: String,
    pub swap_type: SwapType,
    /// Destination. Empty to derive one from `wallet_id`.
    pub address: String,
    pub wallet_id: Option<WalletId>,
    pub tree: LockupTree,
    pub user_lockup_tree: Option<LockupTree>,
    /// Set for refunds of a funding address outside of any swap.
    pub funding_address_id: Option<String>,
    /// Empty for refunds.
    pub preimage: Vec<u8>,
    pub timeout_block_height: u32,
    pub cooperative: bool,
    /// Where to find the lockup.
    pub args: OutputArgs,
    pub handler: Box<dyn OutputHandler>,
}

impl Output {
    fn is_refund(&self) -> bool {
        self.preimage.is_empty()
    }

    fn fail(&self, nursery: &Nursery, err: &str) {
        self.handler.on_failure(nursery, err);
    }
}

impl Nursery {
    /// Resolves destinations and lockups. Outputs that fail are handed their error and dropped.
    fn populate_outputs(&self, outputs: Vec<Output>) -> Vec<(Output, OutputDetails)> {
        let mut addresses: HashMap<WalletId, String> = HashMap::new();
        let mut valid = Vec::with_capacity(outputs.len());

        for output in outputs {
            match self.output_details(&output, &mut addresses) {
                Ok(details) => valid.push((output, details)),
                Err(e) => {
                    let verb = if output.is_refund() { "refund" } else { "claim" };
                    log::warn!(
                        "swap {} can not be {verb}ed automatically: {e}",
                        output.swap_id
                    );
                    output.fail(self, &e.to_string());
                }
            }
        }
        valid
    }

    fn output_details(
        &self,
        output: &Output,
        addresses: &mut HashMap<WalletId, String>,
    ) -> Result<OutputDetails, NurseryError> {
        let address = if !output.address.is_empty() {
            output.address.clone()
        } else {
            let wallet_id = output
                .wallet_id
                .ok_or_else(|| NurseryError::General("no address or wallet set".to_string()))?;
            match addresses.get(&wallet_id) {
                Some(address) => address.clone(),
                None => {
                    let wallet = self.onchain.get_wallet(wallet_id).map_err(|_| {
                        NurseryError::General(format!(
                            "wallet with id {wallet_id} could not be found"
                        ))
                    })?;
                    let address = wallet.new_address().map_err(|e| {
                        NurseryError::General(format!(
                            "could not get address from wallet {}: {e}",
                            wallet.info().name
                        ))
                    })?;
                    addresses.insert(wallet_id, address.clone());
                    address
                }
            }
        };
        let address = address
            .parse::<Address<NetworkUnchecked>>()
            .map_err(OnchainError::from)?
            .require_network(self.network)
            .map_err(OnchainError::from)?;

        let lockup = self.onchain.find_output(&output.args)?;
        Ok(OutputDetails {
            swap_id: output.swap_id.clone(),
            swap_type: output.swap_type,
            lockup_transaction: lockup.transaction,
            vout: lockup.vout,
            address,
            tree: output.tree.clone(),
            preimage: output.preimage.clone(),
            timeout_block_height: output.timeout_block_height,
            cooperative: output.cooperative,
            user_lockup_tree: output.user_lockup_tree.clone(),
            funding_address_id: output.funding_address_id.clone(),
        })
    }

    /// Spends `outputs` in one transaction on `currency` and broadcasts it.
    ///
    /// Every output is resolved through its handler. The error returned covers the transaction as
    /// a whole.
    pub(crate) fn create_transaction(
        &self,
        currency: Currency,
        outputs: Vec<Output>,
    ) -> Result<String, NurseryError> {
        log::debug!("Creating tx for {currency} and {} outputs", outputs.len());

        let (outputs, details): (Vec<Output>, Vec<OutputDetails>) =
            self.populate_outputs(outputs).into_iter().unzip();
        if details.is_empty() {
            return Err(NurseryError::General("all outputs invalid".to_string()));
        }
        log::debug!("Got {} valid outputs", outputs.len());

        let fail_all = |err: String| -> Result<String, NurseryError> {
            for output in &outputs {
                output.fail(self, &err);
            }
            Err(NurseryError::General(err))
        };

        let fee = match self.onchain.estimate_fee(currency) {
            Ok(fee) => fee,
            Err(e) => return fail_all(format!("could not get fee estimation: {e}")),
        };
        log::info!("Using fee of {fee} sat/vbyte for transaction");

        let (transaction, results) = match construct_transaction(
            currency,
            details,
            Fee::SatsPerVbyte(fee),
            Some(self.api.as_ref()),
        ) {
            Ok(constructed) => constructed,
            Err(e) => return fail_all(format!("construct: {e}")),
        };

        let txid = match self.onchain.broadcast_transaction(currency, &transaction) {
            Ok(txid) => txid,
            Err(e) => return fail_all(format!("broadcast: {e}")),
        };
        log::info!("Broadcast transaction: {txid}");

        for output in &outputs {
            match results.get(&output.swap_id) {
                Some(Ok(fee)) => {
                    if let Err(e) = output.handler.on_success(self, &txid, *fee) {
                        log::error!(
                            "Could not set transaction id for {} swap {}: {e}",
                            output.swap_type,
                            output.swap_id
                        );
                    }
                }
                Some(Err(e)) => output.fail(self, &e.to_string()),
                None => output.fail(self, "output is not part of the transaction"),
            }
        }

        Ok(txid)
    }
}
