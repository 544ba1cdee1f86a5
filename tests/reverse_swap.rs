#![cfg(feature = "integration-test")]
use std::time::Duration;

use bitcoin::consensus::encode::serialize_hex;
use swap_nursery::{
    api::TransactionInfo,
    store::Storage,
    swap::{SomeSwap, SwapState, SwapStatus},
};

mod test_framework;
use test_framework::*;

use log::info;

/// A reverse swap pushed through the websocket: we pay the invoice, claim the confirmed lockup
/// through the script path after the counterparty refused to co-sign, and settle with the fees
/// the amounts imply.
#[test]
fn test_reverse_swap_end_to_end() {
    let framework = TestFramework::init(100);
    let swap = reverse_swap("reverse", 100_000, 98_500, 250);

    framework.store.save_reverse_swap(&swap).unwrap();
    framework.nursery.register_reverse_swap(&swap).unwrap();
    assert!(framework.ws.swap_subscriptions().contains("reverse"));
    let updates = framework.listen("reverse");

    assert!(wait_until(Duration::from_secs(10), || {
        framework.lightning.paid_invoices() == vec![INVOICE.to_string()]
    }));

    info!("Counterparty locks up");
    let lockup = fund(&framework.chain, &reverse_lockup_address(&swap), 98_500);
    let lockup_txid = lockup.compute_txid().to_string();
    framework.ws.push_update(&status_update(
        "reverse",
        SwapStatus::TransactionConfirmed,
        Some(&lockup_txid),
    ));

    let update = next_update(&updates);
    assert!(!update.is_final);
    let SomeSwap::Reverse(claimed) = update.swap else {
        panic!("not a reverse swap");
    };
    assert_eq!(claimed.state, SwapState::Pending);
    assert_eq!(claimed.status, "transaction.confirmed");
    assert_eq!(claimed.lockup_transaction_id, lockup_txid);
    assert!(!claimed.claim_transaction_id.is_empty());

    let broadcasts = framework.chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let claim = &broadcasts[0];
    assert_eq!(claim.compute_txid().to_string(), claimed.claim_transaction_id);
    assert!(spends_script_path(claim));
    assert_eq!(
        framework.api.state().refused_signatures,
        vec!["reverse".to_string()]
    );
    let claim_fee = 98_500 - claim.output[0].value.to_sat();
    assert_eq!(claimed.onchain_fee, Some(claim_fee));

    // The amounts imply a counterparty network fee of 100_000 - 98_500 - 500 sat. It is added
    // to the fee of our claim, so the total reported is the claim fee plus 1_000, not 1_000
    // alone.

    info!("Invoice settles");
    framework.lightning.settle(swap.payment_hash(), 1_234);
    framework
        .ws
        .push_update(&status_update("reverse", SwapStatus::InvoiceSettled, None));

    let update = next_update(&updates);
    assert!(update.is_final);
    let SomeSwap::Reverse(settled) = update.swap else {
        panic!("not a reverse swap");
    };
    assert_eq!(settled.state, SwapState::Successful);
    assert_eq!(settled.service_fee, Some(500));
    assert_eq!(settled.onchain_fee, Some(claim_fee + 1_000));
    assert_eq!(settled.routing_fee_msat, Some(1_234));

    // The listener ends with the final update.
    assert!(updates.recv_timeout(Duration::from_secs(1)).is_err());
    assert!(framework.nursery.swap_updates("reverse").is_none());
    assert_eq!(framework.store.get_reverse_swap("reverse").unwrap(), settled);
}

/// The same status twice is handled once. A repeated mempool status announcing another lockup
/// is handled again.
#[test]
fn test_repeated_status_is_idempotent() {
    let framework = TestFramework::init(100);
    let mut swap = reverse_swap("repeat", 100_000, 98_500, 250);
    swap.external_pay = true;
    framework.store.save_reverse_swap(&swap).unwrap();
    framework.nursery.register_swaps(&["repeat".to_string()]).unwrap();
    let updates = framework.listen("repeat");

    let lockup = fund(&framework.chain, &reverse_lockup_address(&swap), 98_500);
    let lockup_txid = lockup.compute_txid().to_string();
    framework.chain.set_confirmed(&lockup_txid, false);

    let mempool = status_update("repeat", SwapStatus::TransactionMempool, Some(&lockup_txid));
    framework.nursery.process_update(&mempool);
    framework.nursery.process_update(&mempool);
    let update = next_update(&updates);
    assert_eq!(update.swap.status(), "transaction.mempool");
    assert!(updates.try_recv().is_err());

    let replacement = fund(&framework.chain, &reverse_lockup_address(&swap), 98_500);
    let replacement_txid = replacement.compute_txid().to_string();
    framework.chain.set_confirmed(&replacement_txid, false);
    framework.nursery.process_update(&status_update(
        "repeat",
        SwapStatus::TransactionMempool,
        Some(&replacement_txid),
    ));
    next_update(&updates);
    let stored = framework.store.get_reverse_swap("repeat").unwrap();
    assert_eq!(stored.lockup_transaction_id, replacement_txid);
    assert!(stored.paid_at.is_some());

    let confirmed =
        status_update("repeat", SwapStatus::TransactionConfirmed, Some(&replacement_txid));
    framework.chain.set_confirmed(&replacement_txid, true);
    framework.nursery.process_update(&confirmed);
    framework.nursery.process_update(&confirmed);
    next_update(&updates);
    assert!(updates.try_recv().is_err());
    assert_eq!(framework.chain.broadcasts().len(), 1);
}

/// Without zero-conf a lockup seen in the mempool is claimed by the block listener once it
/// confirmed.
#[test]
fn test_unconfirmed_lockup_claimed_on_block() {
    let framework = TestFramework::init(100);
    let mut swap = reverse_swap("blocks", 100_000, 98_500, 250);
    swap.external_pay = true;
    framework.store.save_reverse_swap(&swap).unwrap();
    framework.nursery.register_swaps(&["blocks".to_string()]).unwrap();
    let updates = framework.listen("blocks");

    let lockup = fund(&framework.chain, &reverse_lockup_address(&swap), 98_500);
    let lockup_txid = lockup.compute_txid().to_string();
    framework.chain.set_confirmed(&lockup_txid, false);
    framework.nursery.process_update(&status_update(
        "blocks",
        SwapStatus::TransactionMempool,
        Some(&lockup_txid),
    ));
    next_update(&updates);
    assert!(framework.chain.broadcasts().is_empty());

    framework.chain.set_confirmed(&lockup_txid, true);
    framework.chain.set_height(101);

    let update = next_update(&updates);
    let SomeSwap::Reverse(claimed) = update.swap else {
        panic!("not a reverse swap");
    };
    assert!(!claimed.claim_transaction_id.is_empty());
    assert_eq!(framework.chain.broadcasts().len(), 1);
}

/// A failed reverse swap ends as a counterparty error. It is not final, so its listener stays open.
#[test]
fn test_expired_reverse_swap() {
    let framework = TestFramework::init(100);
    let mut swap = reverse_swap("expired", 100_000, 98_500, 250);
    swap.external_pay = true;
    framework.store.save_reverse_swap(&swap).unwrap();
    framework.nursery.register_swaps(&["expired".to_string()]).unwrap();
    let updates = framework.listen("expired");

    framework
        .nursery
        .process_update(&status_update("expired", SwapStatus::SwapExpired, None));

    let update = next_update(&updates);
    assert!(!update.is_final);
    assert_eq!(update.swap.state(), SwapState::ServerError);
    assert!(framework.nursery.swap_updates("expired").is_some());
    assert_eq!(
        framework.store.query_reverse_swaps(&[SwapState::ServerError]).unwrap().len(),
        1
    );
}

/// The counterparty may pay the claim address directly. The payment settles the swap once it
/// confirmed.
#[test]
fn test_direct_payment_settles_once_confirmed() {
    let framework = TestFramework::init(100);
    let mut swap = reverse_swap("direct", 100_000, 98_500, 250);
    swap.external_pay = true;
    framework.store.save_reverse_swap(&swap).unwrap();
    framework.nursery.register_swaps(&["direct".to_string()]).unwrap();
    let updates = framework.listen("direct");

    let payment = fund(&framework.chain, &swap.claim_address, 98_500);
    let payment_txid = payment.compute_txid().to_string();
    framework.chain.set_confirmed(&payment_txid, false);
    let mut direct = status_update("direct", SwapStatus::TransactionDirect, None);
    direct.transaction = Some(TransactionInfo {
        id: payment_txid.clone(),
        hex: Some(serialize_hex(&payment)),
    });

    framework.nursery.process_update(&direct);
    let update = next_update(&updates);
    assert!(!update.is_final);
    assert_eq!(update.swap.state(), SwapState::Pending);
    assert_eq!(update.swap.status(), "transaction.direct.mempool");
    assert_eq!(framework.chain.broadcasts(), vec![payment.clone()]);

    info!("Direct payment confirms");
    framework.chain.set_confirmed(&payment_txid, true);
    framework.nursery.process_update(&direct);
    let update = next_update(&updates);
    assert!(update.is_final);
    let SomeSwap::Reverse(settled) = update.swap else {
        panic!("not a reverse swap");
    };
    assert_eq!(settled.state, SwapState::Successful);
    assert_eq!(settled.status, "transaction.direct");
    assert_eq!(settled.claim_transaction_id, payment_txid);
    assert!(settled.paid_at.is_some());
}
