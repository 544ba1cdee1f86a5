//! Chain swaps: both sides lock on-chain. We lock the `From` leg and claim the `To` leg.

use super::{is_duplicate, output::Output, output::OutputHandler, Handled, Nursery};
use crate::{
    api::SwapStatusUpdate,
    error::NurseryError,
    onchain::OutputArgs,
    protocol::transaction::LockupTree,
    swap::{ChainSwap, ChainSwapData, Leg, SwapState, SwapStatus, SwapType},
};

/// Our spend of one leg of a chain swap: the claim of `To` or the refund of `From`.
pub(super) struct ChainSpend {
    id: String,
    leg: Leg,
}

impl OutputHandler for ChainSpend {
    fn on_success(&self, nursery: &Nursery, txid: &str, fee: u64) -> Result<(), NurseryError> {
        let mut swap = nursery.store.get_chain_swap(&self.id)?;
        nursery
            .store
            .set_chain_swap_transaction_id(&mut swap, self.leg, txid)?;
        if self.leg == Leg::From {
            nursery
                .store
                .update_chain_swap_state(&mut swap, SwapState::Refunded, "")?;
            log::info!("Refunded chain swap {} in {txid}", self.id);
        } else {
            log::info!("Claimed chain swap {} in {txid}", self.id);
        }
        nursery.store.add_chain_swap_onchain_fee(&mut swap, fee)?;
        Ok(())
    }

    fn on_failure(&self, nursery: &Nursery, err: &str) {
        log::error!("Chain swap {} error: {err}", self.id);
        let updated = nursery.store.get_chain_swap(&self.id).and_then(|mut swap| {
            nursery
                .store
                .update_chain_swap_state(&mut swap, SwapState::Error, err)
        });
        if let Err(e) = updated {
            log::error!("Could not update state of chain swap {}: {e}", self.id);
        }
    }
}

fn chain_output_args(data: &ChainSwapData) -> OutputArgs {
    OutputArgs {
        transaction_id: data.lockup_transaction_id.clone(),
        currency: data.currency,
        address: data.lockup_address.clone(),
        expected_amount: 0,
    }
}

impl Nursery {
    /// Registers a new chain swap for status updates.
    pub fn register_chain_swap(&self, swap: &ChainSwap) -> Result<(), NurseryError> {
        self.register_swaps(&[swap.id.clone()])?;
        self.send_update(swap.clone().into());
        Ok(())
    }

    /// Tree of the user lockup: the funding tree when the lockup was paid from one of our
    /// funding addresses, the swap tree otherwise.
    fn user_lockup_tree(&self, swap: &ChainSwap) -> Result<LockupTree, NurseryError> {
        let funding_address = self
            .store
            .query_funding_addresses()?
            .into_iter()
            .find(|funding_address| funding_address.swap_id == swap.id);
        Ok(match funding_address {
            Some(funding_address) => {
                log::debug!(
                    "User lockup of chain swap {} sits in funding address {}",
                    swap.id,
                    funding_address.id
                );
                funding_address.funding_tree()?.into()
            }
            None => swap.from_tree()?.into(),
        })
    }

    pub(super) fn chain_claim_output(&self, swap: &ChainSwap) -> Result<Output, NurseryError> {
        let mut args = chain_output_args(&swap.to_data);
        args.expected_amount = swap.to_data.amount;
        Ok(Output {
            swap_id: swap.id.clone(),
            swap_type: SwapType::Chain,
            address: swap.to_data.address.clone(),
            wallet_id: swap.to_data.wallet_id,
            tree: swap.to_tree()?.into(),
            user_lockup_tree: Some(self.user_lockup_tree(swap)?),
            funding_address_id: None,
            preimage: swap.preimage.clone(),
            timeout_block_height: swap.to_data.timeout_block_height,
            cooperative: true,
            args,
            handler: Box::new(ChainSpend {
                id: swap.id.clone(),
                leg: Leg::To,
            }),
        })
    }

    pub(super) fn chain_refund_output(&self, swap: &ChainSwap) -> Result<Output, NurseryError> {
        Ok(Output {
            swap_id: swap.id.clone(),
            swap_type: SwapType::Chain,
            address: swap.from_data.address.clone(),
            wallet_id: swap.from_data.wallet_id,
            tree: swap.from_tree()?.into(),
            user_lockup_tree: None,
            funding_address_id: None,
            preimage: Vec::new(),
            timeout_block_height: swap.from_data.timeout_block_height,
            cooperative: true,
            args: chain_output_args(&swap.from_data),
            handler: Box::new(ChainSpend {
                id: swap.id.clone(),
                leg: Leg::From,
            }),
        })
    }

    fn set_chain_swap_lockup(
        &self,
        swap: &mut ChainSwap,
        leg: Leg,
        txid: &str,
    ) -> Result<(), NurseryError> {
        let mut args = chain_output_args(swap.data(leg));
        args.transaction_id = txid.to_string();
        let output = self.resolve_lockup(&args)?;

        self.store.set_chain_swap_lockup_transaction_id(swap, leg, txid)?;

        if leg == Leg::To || swap.data(leg).wallet_id.is_some() {
            if let Some(output) = output {
                let fee = self.onchain.get_transaction_fee(&output.transaction).map_err(|e| {
                    NurseryError::General(format!("could not get lockup transaction fee: {e}"))
                })?;
                self.store.add_chain_swap_onchain_fee(swap, fee)?;
            }
        }
        Ok(())
    }

    /// Asks for a new quote after the user lockup did not match the agreed amount.
    ///
    /// Returns whether the counterparty refused to quote.
    fn renegotiate_chain_swap(&self, swap: &mut ChainSwap) -> Result<bool, NurseryError> {
        let quote = match self.api.get_chain_swap_quote(&swap.id) {
            Ok(quote) => quote,
            Err(e) if e.is_counterparty() => {
                log::warn!("Counterparty did not give us a new quote for chain swap {}: {e}", swap.id);
                return Ok(true);
            }
            Err(e) => return Err(NurseryError::General(format!("could not get quote: {e}"))),
        };

        let lockup = self
            .onchain
            .find_output(&chain_output_args(&swap.from_data))
            .map_err(|e| NurseryError::General(format!("could not find lockup vout: {e}")))?;
        self.check_amounts(
            SwapType::Chain,
            swap.pair,
            lockup.value,
            quote,
            swap.service_fee_percent,
        )
        .map_err(|e| NurseryError::General(format!("quote amounts not correct: {e}")))?;
        self.api.accept_chain_swap_quote(&swap.id, quote)?;
        log::info!(
            "Accepted quote of {quote} sat for {} sat locked in chain swap {}",
            lockup.value,
            swap.id
        );

        let snapshot = swap.clone();
        self.store.run_tx(&mut || {
            *swap = snapshot.clone();
            self.store.set_chain_swap_amount(swap, Leg::To, quote)?;
            self.store.set_chain_swap_amount(swap, Leg::From, lockup.value)?;
            Ok(())
        })?;
        Ok(false)
    }

    pub(super) fn handle_chain_swap_status(
        &self,
        mut swap: ChainSwap,
        status: SwapStatus,
        update: &SwapStatusUpdate,
    ) -> Result<Handled, NurseryError> {
        if is_duplicate(
            &swap.status,
            status,
            &swap.from_data.lockup_transaction_id,
            update,
        ) {
            log::debug!("Status of chain swap {} is {status} already", swap.id);
            return Ok(Handled::Unchanged);
        }
        log::info!("Status of chain swap {} changed to: {status}", swap.id);

        let replaced = status.is_repeatable() && !swap.from_data.lockup_transaction_id.is_empty();
        if swap.from_data.lockup_transaction_id.is_empty()
            || swap.to_data.lockup_transaction_id.is_empty()
            || replaced
        {
            match self.api.get_chain_swap_transactions(&swap.id) {
                Ok(lockups) => {
                    if let Some(user_lock) = lockups.user_lock {
                        let txid = user_lock.transaction.id;
                        if swap.from_data.lockup_transaction_id != txid {
                            self.set_chain_swap_lockup(&mut swap, Leg::From, &txid)?;
                            log::info!("Found user lockup {txid} of chain swap {}", swap.id);
                        }
                    }
                    if let Some(server_lock) = lockups.server_lock {
                        let txid = server_lock.transaction.id;
                        if swap.to_data.lockup_transaction_id.is_empty() {
                            self.set_chain_swap_lockup(&mut swap, Leg::To, &txid)?;
                            log::info!("Found server lockup {txid} of chain swap {}", swap.id);
                        }
                    }
                }
                Err(e) if e.is_counterparty() => {
                    log::debug!("No lockups of chain swap {} known yet: {e}", swap.id)
                }
                Err(e) => {
                    return Err(NurseryError::General(format!(
                        "get lockup tx from counterparty: {e}"
                    )))
                }
            }
        }

        let mut quote_refused = false;
        match status {
            SwapStatus::TransactionLockupFailed | SwapStatus::TransactionMempool => {
                if swap.from_data.amount == 0 || status == SwapStatus::TransactionLockupFailed {
                    quote_refused = self.renegotiate_chain_swap(&mut swap)?;
                }
            }
            SwapStatus::TransactionServerConfirmed | SwapStatus::TransactionServerMempool => {
                let zero_conf_refused =
                    status == SwapStatus::TransactionServerMempool && !swap.accept_zero_conf;
                if !zero_conf_refused && swap.to_data.transaction_id.is_empty() {
                    let output = self.chain_claim_output(&swap)?;
                    self.create_transaction(swap.pair.to, vec![output])
                        .map_err(|e| {
                            NurseryError::General(format!("could not claim chain swap output: {e}"))
                        })?;
                    swap = self.store.get_chain_swap(&swap.id)?;
                }
            }
            _ => {}
        }

        log::debug!("Updating status of chain swap {} to {status}", swap.id);
        self.store.update_chain_swap_status(&mut swap, status)?;

        if status.is_completed() {
            let service_fee = swap.service_fee_percent.calculate(swap.from_data.amount);
            log::info!(
                "Chain swap {} service fee: {service_fee} sat, onchain fee: {} sat",
                swap.id,
                swap.onchain_fee.unwrap_or(0)
            );
            self.store
                .set_chain_swap_service_fee(&mut swap, service_fee as i64)?;
            self.store
                .update_chain_swap_state(&mut swap, SwapState::Successful, "")?;
        } else if status.is_failed()
            && (status != SwapStatus::TransactionLockupFailed || quote_refused)
        {
            log::info!("Chain swap {} failed", swap.id);
            if swap.state == SwapState::Pending {
                self.store
                    .update_chain_swap_state(&mut swap, SwapState::ServerError, "")?;
            }
            if !swap.from_data.lockup_transaction_id.is_empty() {
                self.refund(swap.pair.from, &[], &[swap])
                    .map_err(|e| NurseryError::General(format!("could not refund swap: {e}")))?;
            }
        }

        Ok(Handled::Updated)
    }
}
