//! Swap persistence.
//!
//! [`Storage`] is what the nursery needs from a database. The required methods load, save and
//! query whole records. The provided methods mutate the caller's copy of a record and write it
//! back, so the in-memory record and the persisted one never diverge.
//!
//! [`FileStore`] keeps every record in `{data_dir}/swaps.cbor` using atomic writes (write-to-tmp
//! then rename).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::NurseryError,
    swap::{
        ChainSwap, Currency, FundingAddress, FundingStatus, Leg, ReverseSwap, SomeSwap, Swap,
        SwapState, SwapStatus,
    },
    utill::now_secs,
};

/// Represents errors of the swap store.
#[derive(Debug)]
pub enum StoreError {
    /// Standard IO errors during file operations.
    IO(std::io::Error),
    /// The store file could not be encoded or decoded.
    Cbor(serde_cbor::Error),
    /// No record with this id.
    NotFound(String),
    /// Threading error when a mutex is poisoned due to a thread panic.
    MutexPoison,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "could not find swap with id {id}"),
            _ => write!(f, "{self:?}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_cbor::Error> for StoreError {
    fn from(value: serde_cbor::Error) -> Self {
        Self::Cbor(value)
    }
}

impl<'a, T> From<PoisonError<MutexGuard<'a, T>>> for StoreError {
    fn from(_: PoisonError<MutexGuard<'a, T>>) -> Self {
        Self::MutexPoison
    }
}

/// Storage backend of the nursery.
pub trait Storage: Send + Sync {
    /// Inserts or replaces a submarine swap.
    fn save_swap(&self, swap: &Swap) -> Result<(), StoreError>;
    /// Inserts or replaces a reverse swap.
    fn save_reverse_swap(&self, swap: &ReverseSwap) -> Result<(), StoreError>;
    /// Inserts or replaces a chain swap.
    fn save_chain_swap(&self, swap: &ChainSwap) -> Result<(), StoreError>;
    /// Inserts or replaces a funding address.
    fn save_funding_address(&self, funding_address: &FundingAddress) -> Result<(), StoreError>;

    /// Submarine swap `id`.
    fn get_swap(&self, id: &str) -> Result<Swap, StoreError>;
    /// Reverse swap `id`.
    fn get_reverse_swap(&self, id: &str) -> Result<ReverseSwap, StoreError>;
    /// Chain swap `id`.
    fn get_chain_swap(&self, id: &str) -> Result<ChainSwap, StoreError>;
    /// Funding address `id`.
    fn get_funding_address(&self, id: &str) -> Result<FundingAddress, StoreError>;

    /// Submarine swaps in any of `states`.
    fn query_swaps(&self, states: &[SwapState]) -> Result<Vec<Swap>, StoreError>;
    /// Reverse swaps in any of `states`.
    fn query_reverse_swaps(&self, states: &[SwapState]) -> Result<Vec<ReverseSwap>, StoreError>;
    /// Chain swaps in any of `states`.
    fn query_chain_swaps(&self, states: &[SwapState]) -> Result<Vec<ChainSwap>, StoreError>;
    /// All funding addresses.
    fn query_funding_addresses(&self) -> Result<Vec<FundingAddress>, StoreError>;

    /// Runs `f` as one atomic unit: when it fails, every write it made is undone.
    ///
    /// Nested calls on the same thread join the outer unit. Writes from other threads wait until
    /// the unit is done.
    fn run_tx(
        &self,
        f: &mut dyn FnMut() -> Result<(), NurseryError>,
    ) -> Result<(), NurseryError>;

    /// The swap with `id`, whatever its kind.
    fn get_any_swap(&self, id: &str) -> Result<SomeSwap, StoreError> {
        if let Ok(swap) = self.get_swap(id) {
            return Ok(swap.into());
        }
        if let Ok(swap) = self.get_reverse_swap(id) {
            return Ok(swap.into());
        }
        self.get_chain_swap(id).map(SomeSwap::from)
    }

    /// Sets state and error message of a submarine swap.
    fn update_swap_state(
        &self,
        swap: &mut Swap,
        state: SwapState,
        error: &str,
    ) -> Result<(), StoreError> {
        swap.state = state;
        swap.error = error.to_string();
        self.save_swap(swap)
    }

    /// Last counterparty status.
    fn update_swap_status(&self, swap: &mut Swap, status: SwapStatus) -> Result<(), StoreError> {
        swap.status = status.to_string();
        self.save_swap(swap)
    }

    /// Invoice handed to the counterparty.
    fn set_swap_invoice(&self, swap: &mut Swap, invoice: &str) -> Result<(), StoreError> {
        swap.invoice = invoice.to_string();
        self.save_swap(swap)
    }

    /// Stores the preimage of a swap. A known preimage is never replaced.
    fn set_swap_preimage(&self, swap: &mut Swap, preimage: &[u8]) -> Result<(), StoreError> {
        if !swap.preimage.is_empty() {
            return Ok(());
        }
        swap.preimage = preimage.to_vec();
        self.save_swap(swap)
    }

    /// Our lockup.
    fn set_swap_lockup_transaction_id(
        &self,
        swap: &mut Swap,
        txid: &str,
    ) -> Result<(), StoreError> {
        swap.lockup_transaction_id = txid.to_string();
        self.save_swap(swap)
    }

    /// Overrides the expected amount with what the lockup actually pays.
    fn set_swap_expected_amount(&self, swap: &mut Swap, amount: u64) -> Result<(), StoreError> {
        swap.expected_amount = amount;
        self.save_swap(swap)
    }

    /// Fee of our lockup.
    fn set_swap_onchain_fee(&self, swap: &mut Swap, fee: u64) -> Result<(), StoreError> {
        swap.onchain_fee = Some(fee);
        self.save_swap(swap)
    }

    /// Records our refund and marks the swap refunded.
    fn set_swap_refund_transaction_id(
        &self,
        swap: &mut Swap,
        txid: &str,
        fee: u64,
    ) -> Result<(), StoreError> {
        swap.state = SwapState::Refunded;
        swap.refund_transaction_id = txid.to_string();
        swap.onchain_fee = Some(swap.onchain_fee.unwrap_or(0) + fee);
        self.save_swap(swap)
    }

    /// Final fees of a completed submarine swap.
    fn set_swap_service_fee(
        &self,
        swap: &mut Swap,
        service_fee: i64,
        onchain_fee: u64,
    ) -> Result<(), StoreError> {
        swap.service_fee = Some(service_fee);
        swap.onchain_fee = Some(swap.onchain_fee.unwrap_or(0) + onchain_fee);
        self.save_swap(swap)
    }

    /// Sets state and error message of a reverse swap.
    fn update_reverse_swap_state(
        &self,
        swap: &mut ReverseSwap,
        state: SwapState,
        error: &str,
    ) -> Result<(), StoreError> {
        swap.state = state;
        swap.error = error.to_string();
        self.save_reverse_swap(swap)
    }

    /// Last counterparty status.
    fn update_reverse_swap_status(
        &self,
        swap: &mut ReverseSwap,
        status: SwapStatus,
    ) -> Result<(), StoreError> {
        swap.status = status.to_string();
        self.save_reverse_swap(swap)
    }

    /// Lockup of the counterparty.
    fn set_reverse_swap_lockup_transaction_id(
        &self,
        swap: &mut ReverseSwap,
        txid: &str,
    ) -> Result<(), StoreError> {
        swap.lockup_transaction_id = txid.to_string();
        self.save_reverse_swap(swap)
    }

    /// Records our claim. `fee` replaces the on-chain fee.
    fn set_reverse_swap_claim_transaction_id(
        &self,
        swap: &mut ReverseSwap,
        txid: &str,
        fee: u64,
    ) -> Result<(), StoreError> {
        swap.claim_transaction_id = txid.to_string();
        swap.onchain_fee = Some(fee);
        self.save_reverse_swap(swap)
    }

    /// Records the invoice payment at the current time.
    fn set_reverse_swap_paid_at(&self, swap: &mut ReverseSwap) -> Result<(), StoreError> {
        swap.paid_at = Some(now_secs());
        self.save_reverse_swap(swap)
    }

    /// Lightning routing fee of the invoice payment.
    fn set_reverse_swap_routing_fee(
        &self,
        swap: &mut ReverseSwap,
        fee_msat: u64,
    ) -> Result<(), StoreError> {
        swap.routing_fee_msat = Some(fee_msat);
        self.save_reverse_swap(swap)
    }

    /// Sets the service fee and adds `onchain_fee` to the fee of our claim.
    fn set_reverse_swap_service_fee(
        &self,
        swap: &mut ReverseSwap,
        service_fee: i64,
        onchain_fee: u64,
    ) -> Result<(), StoreError> {
        swap.service_fee = Some(service_fee);
        swap.onchain_fee = Some(swap.onchain_fee.unwrap_or(0) + onchain_fee);
        self.save_reverse_swap(swap)
    }

    /// Sets state and error message of a chain swap.
    fn update_chain_swap_state(
        &self,
        swap: &mut ChainSwap,
        state: SwapState,
        error: &str,
    ) -> Result<(), StoreError> {
        swap.state = state;
        swap.error = error.to_string();
        self.save_chain_swap(swap)
    }

    /// Last counterparty status.
    fn update_chain_swap_status(
        &self,
        swap: &mut ChainSwap,
        status: SwapStatus,
    ) -> Result<(), StoreError> {
        swap.status = status.to_string();
        self.save_chain_swap(swap)
    }

    /// Lockup of one leg.
    fn set_chain_swap_lockup_transaction_id(
        &self,
        swap: &mut ChainSwap,
        leg: Leg,
        txid: &str,
    ) -> Result<(), StoreError> {
        swap.data_mut(leg).lockup_transaction_id = txid.to_string();
        self.save_chain_swap(swap)
    }

    /// Records our claim (`To`) or refund (`From`) of a leg.
    fn set_chain_swap_transaction_id(
        &self,
        swap: &mut ChainSwap,
        leg: Leg,
        txid: &str,
    ) -> Result<(), StoreError> {
        swap.data_mut(leg).transaction_id = txid.to_string();
        self.save_chain_swap(swap)
    }

    /// Amount of one leg, after a renegotiated quote.
    fn set_chain_swap_amount(
        &self,
        swap: &mut ChainSwap,
        leg: Leg,
        amount: u64,
    ) -> Result<(), StoreError> {
        swap.data_mut(leg).amount = amount;
        self.save_chain_swap(swap)
    }

    /// Adds `fee` to the on-chain fees paid so far.
    fn add_chain_swap_onchain_fee(&self, swap: &mut ChainSwap, fee: u64) -> Result<(), StoreError> {
        swap.onchain_fee = Some(swap.onchain_fee.unwrap_or(0) + fee);
        self.save_chain_swap(swap)
    }

    /// Service fee of a completed chain swap.
    fn set_chain_swap_service_fee(
        &self,
        swap: &mut ChainSwap,
        service_fee: i64,
    ) -> Result<(), StoreError> {
        swap.service_fee = Some(service_fee);
        self.save_chain_swap(swap)
    }

    /// Last counterparty status.
    fn update_funding_address_status(
        &self,
        funding_address: &mut FundingAddress,
        status: &str,
    ) -> Result<(), StoreError> {
        funding_address.status = status.to_string();
        self.save_funding_address(funding_address)
    }

    /// Transaction funding the address.
    fn set_funding_address_lockup_transaction_id(
        &self,
        funding_address: &mut FundingAddress,
        txid: &str,
    ) -> Result<(), StoreError> {
        funding_address.lockup_transaction_id = txid.to_string();
        self.save_funding_address(funding_address)
    }

    /// Swap the funds were spent into.
    fn set_funding_address_swap_id(
        &self,
        funding_address: &mut FundingAddress,
        swap_id: &str,
    ) -> Result<(), StoreError> {
        funding_address.swap_id = swap_id.to_string();
        self.save_funding_address(funding_address)
    }

    /// Funding addresses whose lifecycle has not ended.
    fn query_pending_funding_addresses(&self) -> Result<Vec<FundingAddress>, StoreError> {
        let mut addresses = self.query_funding_addresses()?;
        addresses.retain(|fa| !FundingStatus::is_final(&fa.status));
        Ok(addresses)
    }

    /// Swaps locked on `currency` whose lockup we have to take back at `height`.
    ///
    /// A submarine swap qualifies once the counterparty failed it or its timeout has passed
    /// without success. A chain swap qualifies once its user lockup failed or its timeout has
    /// passed without success.
    fn query_refundable(
        &self,
        currency: Currency,
        height: u32,
    ) -> Result<(Vec<Swap>, Vec<ChainSwap>), StoreError> {
        let mut swaps = self.query_swaps(&SwapState::ALL)?;
        swaps.retain(|swap| {
            swap.pair.from == currency
                && !swap.lockup_transaction_id.is_empty()
                && swap.refund_transaction_id.is_empty()
                && (matches!(swap.state, SwapState::ServerError | SwapState::Error)
                    || (swap.state != SwapState::Successful && swap.timeout_block_height < height))
        });

        let failed = [
            SwapStatus::TransactionLockupFailed.as_str(),
            SwapStatus::TransactionFailed.as_str(),
        ];
        let mut chain_swaps = self.query_chain_swaps(&SwapState::ALL)?;
        chain_swaps.retain(|swap| {
            let from = &swap.from_data;
            from.currency == currency
                && !from.lockup_transaction_id.is_empty()
                && from.transaction_id.is_empty()
                && (failed.contains(&swap.status.as_str())
                    || (swap.state != SwapState::Successful && from.timeout_block_height < height))
        });

        Ok((swaps, chain_swaps))
    }

    /// Swaps paying out on `currency` whose lockup is known but not claimed yet.
    fn query_claimable(
        &self,
        currency: Currency,
    ) -> Result<(Vec<ReverseSwap>, Vec<ChainSwap>), StoreError> {
        let mut reverse_swaps = self.query_reverse_swaps(&SwapState::ALL)?;
        reverse_swaps.retain(|swap| {
            swap.pair.to == currency
                && !swap.lockup_transaction_id.is_empty()
                && swap.claim_transaction_id.is_empty()
        });

        let mut chain_swaps = self.query_chain_swaps(&SwapState::ALL)?;
        chain_swaps.retain(|swap| {
            let to = &swap.to_data;
            to.currency == currency
                && !to.lockup_transaction_id.is_empty()
                && to.transaction_id.is_empty()
                && swap.state != SwapState::Refunded
        });

        Ok((reverse_swaps, chain_swaps))
    }

    /// The reverse swap our transaction `txid` claimed, if any.
    fn query_reverse_swap_by_claim_transaction(
        &self,
        txid: &str,
    ) -> Result<Option<ReverseSwap>, StoreError> {
        Ok(self
            .query_reverse_swaps(&SwapState::ALL)?
            .into_iter()
            .find(|swap| swap.claim_transaction_id == txid))
    }
}

/// Internal storage format of the store file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Records {
    swaps: HashMap<String, Swap>,
    reverse_swaps: HashMap<String, ReverseSwap>,
    chain_swaps: HashMap<String, ChainSwap>,
    funding_addresses: HashMap<String, FundingAddress>,
}

/// Reentrant gate serializing [`Storage::run_tx`] units against writes of other threads.
#[derive(Default)]
struct TxGate {
    owner: Mutex<Option<(ThreadId, usize)>>,
    released: Condvar,
}

struct GateGuard<'a> {
    gate: &'a TxGate,
    depth: usize,
}

impl TxGate {
    fn enter(&self) -> Result<GateGuard<'_>, StoreError> {
        let me = thread::current().id();
        let mut owner = self.owner.lock()?;
        loop {
            match owner.as_mut() {
                None => {
                    *owner = Some((me, 1));
                    return Ok(GateGuard {
                        gate: self,
                        depth: 1,
                    });
                }
                Some((id, depth)) if *id == me => {
                    *depth += 1;
                    return Ok(GateGuard {
                        gate: self,
                        depth: *depth,
                    });
                }
                Some(_) => owner = self.released.wait(owner)?,
            }
        }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut owner = self
            .gate
            .owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((_, depth)) = owner.as_mut() {
            *depth -= 1;
            if *depth == 0 {
                *owner = None;
                self.gate.released.notify_all();
            }
        }
    }
}

/// Persistent swap store backed by a CBOR file with atomic writes.
pub struct FileStore {
    path: PathBuf,
    records: Mutex<Records>,
    gate: TxGate,
}

impl FileStore {
    /// Load the store from disk or create a new empty one.
    pub fn load_or_create(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join("swaps.cbor");
        let records = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_cbor::from_slice(&bytes)?
        } else {
            Records::default()
        };
        log::info!(
            "Loaded {} swaps, {} reverse swaps, {} chain swaps from {:?}",
            records.swaps.len(),
            records.reverse_swaps.len(),
            records.chain_swaps.len(),
            path
        );

        Ok(Self {
            path,
            records: Mutex::new(records),
            gate: TxGate::default(),
        })
    }

    /// Atomic flush: write to tmp file, then rename over original.
    fn flush(&self, records: &Records) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("cbor.tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = serde_cbor::to_vec(records)?;
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }

    fn write(&self, f: impl FnOnce(&mut Records)) -> Result<(), StoreError> {
        let _guard = self.gate.enter()?;
        let mut records = self.records.lock()?;
        f(&mut records);
        self.flush(&records)
    }

    fn read<T>(&self, f: impl FnOnce(&Records) -> T) -> Result<T, StoreError> {
        Ok(f(&*self.records.lock()?))
    }
}

fn get_cloned<T: Clone>(map: &HashMap<String, T>, id: &str) -> Result<T, StoreError> {
    map.get(id)
        .cloned()
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

impl Storage for FileStore {
    fn save_swap(&self, swap: &Swap) -> Result<(), StoreError> {
        self.write(|records| {
            records.swaps.insert(swap.id.clone(), swap.clone());
        })
    }

    fn save_reverse_swap(&self, swap: &ReverseSwap) -> Result<(), StoreError> {
        self.write(|records| {
            records.reverse_swaps.insert(swap.id.clone(), swap.clone());
        })
    }

    fn save_chain_swap(&self, swap: &ChainSwap) -> Result<(), StoreError> {
        self.write(|records| {
            records.chain_swaps.insert(swap.id.clone(), swap.clone());
        })
    }

    fn save_funding_address(&self, funding_address: &FundingAddress) -> Result<(), StoreError> {
        self.write(|records| {
            records
                .funding_addresses
                .insert(funding_address.id.clone(), funding_address.clone());
        })
    }

    fn get_swap(&self, id: &str) -> Result<Swap, StoreError> {
        self.read(|records| get_cloned(&records.swaps, id))?
    }

    fn get_reverse_swap(&self, id: &str) -> Result<ReverseSwap, StoreError> {
        self.read(|records| get_cloned(&records.reverse_swaps, id))?
    }

    fn get_chain_swap(&self, id: &str) -> Result<ChainSwap, StoreError> {
        self.read(|records| get_cloned(&records.chain_swaps, id))?
    }

    fn get_funding_address(&self, id: &str) -> Result<FundingAddress, StoreError> {
        self.read(|records| get_cloned(&records.funding_addresses, id))?
    }

    fn query_swaps(&self, states: &[SwapState]) -> Result<Vec<Swap>, StoreError> {
        self.read(|records| {
            records
                .swaps
                .values()
                .filter(|swap| states.contains(&swap.state))
                .cloned()
                .collect()
        })
    }

    fn query_reverse_swaps(&self, states: &[SwapState]) -> Result<Vec<ReverseSwap>, StoreError> {
        self.read(|records| {
            records
                .reverse_swaps
                .values()
                .filter(|swap| states.contains(&swap.state))
                .cloned()
                .collect()
        })
    }

    fn query_chain_swaps(&self, states: &[SwapState]) -> Result<Vec<ChainSwap>, StoreError> {
        self.read(|records| {
            records
                .chain_swaps
                .values()
                .filter(|swap| states.contains(&swap.state))
                .cloned()
                .collect()
        })
    }

    fn query_funding_addresses(&self) -> Result<Vec<FundingAddress>, StoreError> {
        self.read(|records| records.funding_addresses.values().cloned().collect())
    }

    fn run_tx(
        &self,
        f: &mut dyn FnMut() -> Result<(), NurseryError>,
    ) -> Result<(), NurseryError> {
        let guard = self.gate.enter()?;
        if guard.depth > 1 {
            return f();
        }

        let snapshot = self.read(Records::clone)?;
        let result = f();
        if let Err(e) = &result {
            log::debug!("Rolling back store transaction: {e}");
            let mut records = self.records.lock()?;
            *records = snapshot;
            self.flush(&records)?;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{records::tests::reverse_swap, Pair};
    use bitcoind::tempfile::TempDir;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::load_or_create(dir.path()).unwrap();
            let mut swap = reverse_swap("swap1");
            store.save_reverse_swap(&swap).unwrap();
            store
                .set_reverse_swap_lockup_transaction_id(&mut swap, "lockup")
                .unwrap();
        }

        let store = FileStore::load_or_create(dir.path()).unwrap();
        let swap = store.get_reverse_swap("swap1").unwrap();
        assert_eq!(swap.lockup_transaction_id, "lockup");
        assert!(matches!(
            store.get_any_swap("swap1").unwrap(),
            SomeSwap::Reverse(_)
        ));
        assert!(matches!(
            store.get_any_swap("other"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_atomic_write_creates_no_tmp_on_success() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::load_or_create(dir.path()).unwrap();
        store.save_reverse_swap(&reverse_swap("swap1")).unwrap();

        assert!(dir.path().join("swaps.cbor").exists());
        assert!(
            !dir.path().join("swaps.cbor.tmp").exists(),
            "tmp file should be removed after rename"
        );
    }

    #[test]
    fn test_run_tx_rolls_back_on_error() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::load_or_create(dir.path()).unwrap();
        let mut swap = reverse_swap("swap1");
        store.save_reverse_swap(&swap).unwrap();

        let result = store.run_tx(&mut || {
            store.set_reverse_swap_claim_transaction_id(&mut swap, "claim", 100)?;
            store.run_tx(&mut || {
                store.set_reverse_swap_paid_at(&mut swap)?;
                Ok(())
            })?;
            Err(NurseryError::General("late failure".to_string()))
        });
        assert!(result.is_err());

        let reloaded = store.get_reverse_swap("swap1").unwrap();
        assert!(reloaded.claim_transaction_id.is_empty());
        assert!(reloaded.paid_at.is_none());

        let reloaded = FileStore::load_or_create(dir.path())
            .unwrap()
            .get_reverse_swap("swap1")
            .unwrap();
        assert!(reloaded.claim_transaction_id.is_empty());

        let mut swap = reloaded;
        store
            .run_tx(&mut || {
                store.set_reverse_swap_claim_transaction_id(&mut swap, "claim", 100)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            store.get_reverse_swap("swap1").unwrap().claim_transaction_id,
            "claim"
        );
    }

    #[test]
    fn test_run_tx_blocks_other_writers() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::load_or_create(dir.path()).unwrap());

        let mut writer = None;
        let result = store.run_tx(&mut || {
            let other = store.clone();
            writer = Some(thread::spawn(move || {
                other.save_reverse_swap(&reverse_swap("swap2")).unwrap()
            }));
            thread::sleep(Duration::from_millis(50));
            assert!(store.get_reverse_swap("swap2").is_err());
            Err(NurseryError::General("rollback".to_string()))
        });
        assert!(result.is_err());

        // The blocked write lands after the rollback.
        writer.unwrap().join().unwrap();
        assert!(store.get_reverse_swap("swap2").is_ok());
    }

    #[test]
    fn test_refundable_and_claimable() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::load_or_create(dir.path()).unwrap();

        let mut pending = reverse_swap("pending");
        pending.lockup_transaction_id = "lockup".to_string();
        store.save_reverse_swap(&pending).unwrap();

        let mut claimed = reverse_swap("claimed");
        claimed.lockup_transaction_id = "lockup".to_string();
        claimed.claim_transaction_id = "claim".to_string();
        store.save_reverse_swap(&claimed).unwrap();

        let mut liquid = reverse_swap("liquid");
        liquid.pair = Pair::new(Currency::Btc, Currency::Liquid);
        liquid.lockup_transaction_id = "lockup".to_string();
        store.save_reverse_swap(&liquid).unwrap();

        let (reverse, chain) = store.query_claimable(Currency::Btc).unwrap();
        assert_eq!(reverse.len(), 1);
        assert_eq!(reverse[0].id, "pending");
        assert!(chain.is_empty());

        let found = store
            .query_reverse_swap_by_claim_transaction("claim")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "claimed");

        let (swaps, chain) = store.query_refundable(Currency::Btc, 1_000).unwrap();
        assert!(swaps.is_empty() && chain.is_empty());
    }
}
