//! Refunds of funding addresses whose funds never went into a swap.

use super::{output::Output, output::OutputHandler, Nursery};
use crate::{
    error::NurseryError,
    onchain::OutputArgs,
    swap::{FundingAddress, FundingStatus, SwapType},
};

struct FundingRefund {
    id: String,
}

impl OutputHandler for FundingRefund {
    fn on_success(&self, nursery: &Nursery, txid: &str, fee: u64) -> Result<(), NurseryError> {
        let mut funding_address = nursery.store.get_funding_address(&self.id)?;
        nursery
            .store
            .update_funding_address_status(&mut funding_address, FundingStatus::REFUNDED)?;
        log::info!(
            "Refunded funding address {} in {txid} paying {fee} sat fee",
            self.id
        );
        nursery.funding_updates.send(funding_address);
        nursery.events.unsubscribe_funding(&self.id);
        Ok(())
    }

    fn on_failure(&self, _: &Nursery, err: &str) {
        log::error!("Could not refund funding address {}: {err}", self.id);
    }
}

impl Nursery {
    fn funding_refund_output(
        &self,
        funding_address: &FundingAddress,
        address: &str,
    ) -> Result<Output, NurseryError> {
        Ok(Output {
            swap_id: funding_address.id.clone(),
            swap_type: SwapType::Submarine,
            address: address.to_string(),
            wallet_id: None,
            tree: funding_address.funding_tree()?.into(),
            user_lockup_tree: None,
            funding_address_id: Some(funding_address.id.clone()),
            preimage: Vec::new(),
            timeout_block_height: funding_address.timeout_block_height,
            cooperative: true,
            args: OutputArgs {
                transaction_id: funding_address.lockup_transaction_id.clone(),
                currency: funding_address.currency,
                address: funding_address.address.clone(),
                expected_amount: 0,
            },
            handler: Box::new(FundingRefund {
                id: funding_address.id.clone(),
            }),
        })
    }

    /// Sends the funds of funding address `id` to `address`.
    ///
    /// Before the timeout the counterparty has to co-sign, afterwards the refund leaf is used.
    pub fn refund_funding_address(&self, id: &str, address: &str) -> Result<String, NurseryError> {
        let funding_address = self.store.get_funding_address(id)?;
        if FundingStatus::is_final(&funding_address.status) {
            return Err(NurseryError::General(format!(
                "funding address {id} is already {}",
                funding_address.status
            )));
        }
        if funding_address.lockup_transaction_id.is_empty() {
            return Err(NurseryError::General(format!(
                "funding address {id} has no lockup transaction"
            )));
        }

        let height = self
            .onchain
            .get_block_height(funding_address.currency)
            .map_err(|e| NurseryError::General(format!("could not get block height: {e}")))?;
        let mut output = self.funding_refund_output(&funding_address, address)?;
        output.cooperative = funding_address.timeout_block_height > height;
        log::debug!(
            "Refunding funding address {id} cooperatively: {} ({} > {height})",
            output.cooperative,
            funding_address.timeout_block_height
        );

        self.create_transaction(funding_address.currency, vec![output])
    }
}
