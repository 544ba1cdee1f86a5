//! Batched refunds and claims, driven by new blocks or by the user.

use std::sync::Arc;

use super::{output::Output, Nursery};
use crate::{
    error::NurseryError,
    swap::{ChainSwap, Currency, ReverseSwap, SomeSwap, Swap},
};

impl Nursery {
    /// Refunds `swaps` and `chain_swaps` locked on `currency` in one transaction.
    ///
    /// Swaps without refund address or wallet are skipped. Returns an empty id when nothing was
    /// left to refund.
    pub(super) fn refund(
        &self,
        currency: Currency,
        swaps: &[Swap],
        chain_swaps: &[ChainSwap],
    ) -> Result<String, NurseryError> {
        let height = self.onchain.get_block_height(currency).map_err(|e| {
            NurseryError::General(format!("could not get block height: {e}"))
        })?;

        let mut outputs = Vec::new();
        for swap in swaps {
            if swap.refund_address.is_empty() && swap.wallet_id.is_none() {
                log::info!(
                    "Swap {} has no refund address or wallet set, has to be refunded manually",
                    swap.id
                );
                continue;
            }
            outputs.push(self.swap_refund_output(swap)?);
        }
        for swap in chain_swaps {
            if swap.from_data.address.is_empty() && swap.from_data.wallet_id.is_none() {
                log::info!(
                    "Swap {} has no refund address or wallet set, has to be refunded manually",
                    swap.id
                );
                continue;
            }
            outputs.push(self.chain_refund_output(swap)?);
        }

        for output in outputs.iter_mut() {
            output.cooperative = output.timeout_block_height > height;
            log::debug!(
                "Output for swap {} cooperative: {} ({} > {height})",
                output.swap_id,
                output.cooperative,
                output.timeout_block_height
            );
        }

        if outputs.is_empty() {
            log::info!("Did not find any outputs to refund");
            return Ok(String::new());
        }
        self.create_transaction(currency, outputs)
    }

    /// Claims the lockups of `reverse_swaps` and `chain_swaps` paying out on `currency`.
    pub(super) fn claim(
        &self,
        currency: Currency,
        reverse_swaps: &[ReverseSwap],
        chain_swaps: &[ChainSwap],
    ) -> Result<String, NurseryError> {
        let mut outputs: Vec<Output> = Vec::new();
        for swap in reverse_swaps {
            outputs.push(self.reverse_claim_output(swap)?);
        }
        for swap in chain_swaps {
            outputs.push(self.chain_claim_output(swap)?);
        }
        if outputs.is_empty() {
            return Ok(String::new());
        }
        self.create_transaction(currency, outputs)
    }

    /// Refunds the swaps `ids` locked on `currency` now, cooperatively while their timeout has
    /// not passed.
    pub fn refund_swaps(&self, currency: Currency, ids: &[String]) -> Result<String, NurseryError> {
        let mut swaps = Vec::new();
        let mut chain_swaps = Vec::new();
        for id in ids {
            match self.store.get_any_swap(id)? {
                SomeSwap::Submarine(swap) => swaps.push(swap),
                SomeSwap::Chain(swap) => chain_swaps.push(swap),
                SomeSwap::Reverse(_) => {
                    return Err(NurseryError::General(format!(
                        "reverse swap {id} can not be refunded"
                    )))
                }
            }
        }

        let txid = self.refund(currency, &swaps, &chain_swaps)?;
        for id in ids {
            self.publish(id);
        }
        Ok(txid)
    }

    /// Claims the swaps `ids` paying out on `currency` now.
    pub fn claim_swaps(&self, currency: Currency, ids: &[String]) -> Result<String, NurseryError> {
        let _guard = self.update_lock.lock()?;

        let mut reverse_swaps = Vec::new();
        let mut chain_swaps = Vec::new();
        for id in ids {
            match self.store.get_any_swap(id)? {
                SomeSwap::Reverse(swap) => reverse_swaps.push(swap),
                SomeSwap::Chain(swap) => chain_swaps.push(swap),
                SomeSwap::Submarine(_) => {
                    return Err(NurseryError::General(format!(
                        "submarine swap {id} can not be claimed"
                    )))
                }
            }
        }

        let txid = self.claim(currency, &reverse_swaps, &chain_swaps)?;
        for id in ids {
            self.publish(id);
        }
        Ok(txid)
    }

    /// Reverse and chain swaps on `currency` we can claim now.
    ///
    /// Without zero-conf, the lockup has to be confirmed.
    fn query_claimable(
        &self,
        currency: Currency,
    ) -> Result<(Vec<ReverseSwap>, Vec<ChainSwap>), NurseryError> {
        let (mut reverse_swaps, mut chain_swaps) = self.store.query_claimable(currency)?;

        let confirmed = |id: &str, txid: &str| -> bool {
            match self.onchain.is_transaction_confirmed(currency, txid) {
                Ok(confirmed) => confirmed,
                Err(e) => {
                    log::error!("Could not check if lockup of swap {id} is confirmed: {e}");
                    false
                }
            }
        };
        reverse_swaps.retain(|swap| {
            swap.accept_zero_conf || confirmed(&swap.id, &swap.lockup_transaction_id)
        });
        chain_swaps.retain(|swap| {
            swap.accept_zero_conf || confirmed(&swap.id, &swap.to_data.lockup_transaction_id)
        });

        Ok((reverse_swaps, chain_swaps))
    }

    /// Refunds what expired at `height` and claims what became claimable.
    fn on_block(&self, currency: Currency, height: u32) {
        log::debug!("New {currency} block at height {height}");

        match self.store.query_refundable(currency, height) {
            Ok((swaps, chain_swaps)) if !swaps.is_empty() || !chain_swaps.is_empty() => {
                log::info!(
                    "Found {} swaps and {} chain swaps to refund at height {height}",
                    swaps.len(),
                    chain_swaps.len()
                );
                if let Err(e) = self.refund(currency, &swaps, &chain_swaps) {
                    log::error!("Could not refund Swaps: {e}");
                }
                for id in swaps.iter().map(|s| &s.id).chain(chain_swaps.iter().map(|s| &s.id)) {
                    self.publish(id);
                }
            }
            Ok(_) => {}
            Err(e) => log::error!("Could not query refundable Swaps: {e}"),
        }

        if let Err(e) = self.check_external_reverse_swaps(currency) {
            log::error!("Could not check external reverse swaps: {e}");
        }

        let Ok(_guard) = self.update_lock.lock() else {
            log::error!("Update lock poisoned, not claiming");
            return;
        };
        match self.query_claimable(currency) {
            Ok((reverse_swaps, chain_swaps))
                if !reverse_swaps.is_empty() || !chain_swaps.is_empty() =>
            {
                if let Err(e) = self.claim(currency, &reverse_swaps, &chain_swaps) {
                    log::error!("Could not claim Swaps: {e}");
                }
                for id in reverse_swaps
                    .iter()
                    .map(|s| &s.id)
                    .chain(chain_swaps.iter().map(|s| &s.id))
                {
                    self.publish(id);
                }
            }
            Ok(_) => {}
            Err(e) => log::error!("Could not query claimable Swaps: {e}"),
        }
    }

    /// Starts one block listener per currency with a chain backend.
    pub(super) fn start_block_listeners(self: &Arc<Self>) -> Result<(), NurseryError> {
        for currency in [Currency::Btc, Currency::Liquid] {
            if !self.onchain.has_provider(currency) {
                continue;
            }
            let nursery = self.clone();
            self.tasks
                .spawn(&format!("blocks-{currency}"), move |cancellation| {
                    let interval = nursery.onchain.block_poll_interval(currency);
                    let mut last = 0;
                    log::info!("Listening for {currency} blocks every {interval:?}");
                    loop {
                        match nursery.onchain.poll_block(currency, last) {
                            Ok(Some(epoch)) => {
                                last = epoch.height;
                                nursery.on_block(currency, epoch.height);
                            }
                            Ok(None) => {}
                            Err(e) => log::warn!("Could not poll {currency} block height: {e}"),
                        }
                        if !cancellation.sleep(interval) {
                            break;
                        }
                    }
                    log::debug!("Stopped {currency} block listener");
                })?;
        }
        Ok(())
    }
}
