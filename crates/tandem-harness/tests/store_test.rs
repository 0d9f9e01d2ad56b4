//! Row store behavior under real contention.
//!
//! The blocking tests use the interleaving harness itself to place each
//! transaction's statements, so the expected block is proven by an
//! [`OrderWitness`] rather than inferred from timing.

use std::time::Duration;

use tandem_core::{HarnessConfig, OrderWitness, SequencedActionList, StepError};
use tandem_harness::{
    Isolation, Row, RowStore, StoreConfig, StoreError, TransactionalRunner, TxSlot, expect_failure,
    is_duplicate_key,
};

fn fast() -> HarnessConfig {
    HarnessConfig::default().with_probe_delay(Duration::from_millis(30))
}

fn ok() -> Result<(), StepError> {
    Ok(())
}

#[test]
fn exclusive_lock_blocks_until_commit() {
    let store = RowStore::new();
    store.seed(1, Row::new("counter", 0));
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());
    let witness = OrderWitness::new();

    let runner_a = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    SequencedActionList::with_config(fast())
        .add_for_a(|| slot_a.with(|tx| tx.select_for_update(1)).map(drop))
        .unwrap()
        .add_blocking_probe_for_b(|| {
            let row = slot_b.with(|tx| tx.select_for_update(1))?;
            witness.mark_potential_block_point();
            assert_eq!(row.unwrap().value, 0);
            Ok::<_, StoreError>(())
        })
        .unwrap()
        .add_for_a(|| {
            witness.mark_ran_first();
            ok()
        })
        .unwrap()
        .execute(|steps, ctx| runner_a.run(steps, ctx), |steps, ctx| runner_b.run(steps, ctx))
        .unwrap();

    assert!(witness.was_correct_order());
}

#[test]
fn rollback_unblocks_waiter_without_publishing() {
    let store = RowStore::new();
    store.seed(1, Row::new("counter", 10));
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());
    let witness = OrderWitness::new();

    let runner_a = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    let err = SequencedActionList::with_config(fast())
        .add_for_a(|| slot_a.with(|tx| tx.update(1, |row| row.value = 99)).map(drop))
        .unwrap()
        .add_blocking_probe_for_b(|| {
            slot_b.with(|tx| tx.update(1, |row| row.value += 1))?;
            witness.mark_potential_block_point();
            Ok::<_, StoreError>(())
        })
        .unwrap()
        .add_for_a(|| {
            witness.mark_ran_first();
            Err::<(), _>("abort")
        })
        .unwrap()
        .execute(|steps, ctx| runner_a.run(steps, ctx), |steps, ctx| runner_b.run(steps, ctx))
        .unwrap_err();

    assert!(err.to_string().contains("abort"));
    assert!(witness.was_correct_order());
    assert_eq!(store.get(1).unwrap().value, 11, "A's write was rolled back before B incremented");
}

#[test]
fn pending_insert_blocks_then_duplicate() {
    let store = RowStore::new();
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());

    let runner_a = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    let report = SequencedActionList::with_config(fast())
        .add_for_a(|| slot_a.with(|tx| tx.insert(7, Row::new("first", 1))))
        .unwrap()
        .add_blocking_probe_for_b(|| slot_b.with(|tx| tx.insert(7, Row::new("second", 2))))
        .unwrap()
        .add_for_a(ok)
        .unwrap()
        .execute(
            |steps, ctx| runner_a.run(steps, ctx),
            expect_failure(|steps, ctx| runner_b.run(steps, ctx), is_duplicate_key),
        )
        .unwrap();

    assert_eq!(report.probes_scheduled, [0, 1]);
    assert_eq!(store.get(7).unwrap().name, "first");
}

#[test]
fn expect_failure_rejects_success() {
    let store = RowStore::new();
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());

    let runner_a = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    let err = SequencedActionList::new()
        .add_for_a(|| slot_a.with(|tx| tx.insert(1, Row::new("a", 1))))
        .unwrap()
        .add_for_b(|| slot_b.with(|tx| tx.insert(2, Row::new("b", 2))))
        .unwrap()
        .execute(
            |steps, ctx| runner_a.run(steps, ctx),
            expect_failure(|steps, ctx| runner_b.run(steps, ctx), is_duplicate_key),
        )
        .unwrap_err();

    assert_eq!(err.to_string(), "party B failed: party B was expected to fail but succeeded");
    assert_eq!(store.len(), 2, "B committed before its runner reported the unexpected success");
}

#[test]
fn expect_failure_passes_through_other_errors() {
    let store = RowStore::new();
    store.seed(1, Row::new("taken", 0));
    let slot = TxSlot::new();
    let runner = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot);

    let err = SequencedActionList::new()
        .add_for_a(ok)
        .unwrap()
        .add_for_b(|| slot.with(|tx| tx.update(42, |row| row.value = 1)).map(drop))
        .unwrap()
        .execute(
            |steps, _| steps.run_all(),
            expect_failure(|steps, ctx| runner.run(steps, ctx), is_duplicate_key),
        )
        .unwrap_err();

    assert_eq!(err.to_string(), "party B failed: row 42 not found");
}

#[test]
fn operation_outside_runner_sees_closed_transaction() {
    let slot = TxSlot::new();

    let err = SequencedActionList::new()
        .add_for_a(|| slot.with(|tx| tx.select_for_share(1)).map(drop))
        .unwrap()
        .execute(|steps, _| steps.run_all(), |steps, _| steps.run_all())
        .unwrap_err();

    assert_eq!(err.to_string(), "party A failed: transaction is closed");
}

#[test]
fn lock_timeout_surfaces_as_party_failure() {
    let store = RowStore::with_config(StoreConfig::default().with_lock_timeout(Duration::from_millis(20)));
    store.seed(1, Row::new("row", 0));
    let (slot_a, slot_b) = (TxSlot::new(), TxSlot::new());

    let runner_a = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_a);
    let runner_b = TransactionalRunner::new(store.clone(), Isolation::ReadCommitted, &slot_b);

    // Without a probe B times out while A still waits for its turn
    let err = SequencedActionList::new()
        .add_for_a(|| slot_a.with(|tx| tx.select_for_update(1)).map(drop))
        .unwrap()
        .add_for_b(|| slot_b.with(|tx| tx.select_for_update(1)).map(drop))
        .unwrap()
        .add_for_a(ok)
        .unwrap()
        .execute(|steps, ctx| runner_a.run(steps, ctx), |steps, ctx| runner_b.run(steps, ctx))
        .unwrap_err();

    assert!(matches!(err.party(), Some(tandem_core::Party::B)));
    assert!(err.to_string().contains("timed out"));
}
