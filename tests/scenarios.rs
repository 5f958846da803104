//! End-to-end coverage for the concrete scenarios walked through in
//! spec.md §8, exercised through the public `Database`/`RecoveryManager`
//! surface rather than any single module's internals.

use std::sync::Arc;

use txcore::database::{Database, DatabaseConfig};
use txcore::disk::DiskSpaceManager;
use txcore::lock::LockMode;
use txcore::recovery::{CheckpointCapacity, LogManager, LogRecord, RecoveryManager};
use txcore::transaction::Transaction;

#[test]
fn promotion_to_six_cleans_up_redundant_descendant_locks() {
    let db = Database::new(DatabaseConfig::default());
    let tx = db.begin_transaction();

    let schema = db.locks.root.child("db");
    let table = schema.child("table17");
    let page1 = table.child("page1");
    let page2 = table.child("page2");

    db.locks.root.acquire(&tx, LockMode::IX).unwrap();
    schema.acquire(&tx, LockMode::IX).unwrap();
    table.acquire(&tx, LockMode::IS).unwrap();
    page1.acquire(&tx, LockMode::S).unwrap();
    page2.acquire(&tx, LockMode::IS).unwrap();

    table.promote(&tx, LockMode::SIX).unwrap();

    assert_eq!(table.explicit_mode(&tx), LockMode::SIX);
    assert_eq!(page1.explicit_mode(&tx), LockMode::NL);
    assert_eq!(page2.explicit_mode(&tx), LockMode::NL);
    // SIX at the table still implies S for anything below it.
    assert_eq!(page1.effective_mode(&tx), LockMode::S);
    assert_eq!(page2.effective_mode(&tx), LockMode::S);
}

#[test]
fn escalation_chooses_exclusive_over_a_held_exclusive_descendant() {
    let db = Database::new(DatabaseConfig::default());
    let tx = db.begin_transaction();

    let schema = db.locks.root.child("db");
    let table = schema.child("t");
    let p1 = table.child("p1");
    let p2 = table.child("p2");
    let p3 = table.child("p3");

    db.locks.root.acquire(&tx, LockMode::IX).unwrap();
    schema.acquire(&tx, LockMode::IX).unwrap();
    table.acquire(&tx, LockMode::IX).unwrap();
    p1.acquire(&tx, LockMode::S).unwrap();
    p3.acquire(&tx, LockMode::X).unwrap();
    p2.acquire(&tx, LockMode::IS).unwrap();

    table.escalate(&tx).unwrap();

    assert_eq!(table.explicit_mode(&tx), LockMode::X);
    for p in [&p1, &p2, &p3] {
        assert_eq!(p.explicit_mode(&tx), LockMode::NL);
    }
}

#[test]
fn ensure_sufficient_upgrades_ix_plus_s_to_six() {
    let db = Database::new(DatabaseConfig::default());
    let tx = db.begin_transaction();

    let schema = db.locks.root.child("db");
    let table = schema.child("t");

    txcore::lock::LockFacade::ensure_sufficient(&schema, &tx, LockMode::IX).unwrap();
    txcore::lock::LockFacade::ensure_sufficient(&table, &tx, LockMode::IX).unwrap();

    txcore::lock::LockFacade::ensure_sufficient(&table, &tx, LockMode::S).unwrap();

    assert_eq!(table.explicit_mode(&tx), LockMode::SIX);
}

#[test]
fn rollback_to_savepoint_undoes_only_writes_after_it() {
    let db = Database::new(DatabaseConfig::default());
    let tx = db.begin_transaction();

    let p1 = DiskSpaceManager::page_num(1, 1);
    let p2 = DiskSpaceManager::page_num(1, 2);

    let l1 = db.recovery.log_page_write(&tx, p1, 0, vec![0; 4], vec![1; 4]).unwrap();
    db.buffer.fetch_page(p1).write(0, &[1; 4]);
    db.buffer.fetch_page(p1).set_page_lsn(l1);

    let l2 = db.recovery.log_page_write(&tx, p2, 0, vec![0; 4], vec![9; 4]).unwrap();
    db.buffer.fetch_page(p2).write(0, &[9; 4]);
    db.buffer.fetch_page(p2).set_page_lsn(l2);

    db.recovery.savepoint(&tx, "s");

    let l3 = db.recovery.log_page_write(&tx, p1, 0, vec![1; 4], vec![2; 4]).unwrap();
    db.buffer.fetch_page(p1).write(0, &[2; 4]);
    db.buffer.fetch_page(p1).set_page_lsn(l3);

    db.recovery.rollback_to_savepoint(&tx, "s").unwrap();

    assert_eq!(db.buffer.fetch_page(p1).read(0, 4), vec![1, 1, 1, 1]);
    assert_eq!(db.buffer.fetch_page(p2).read(0, 4), vec![9, 9, 9, 9]);
}

#[test]
fn restart_redoes_the_committed_transaction_and_undoes_the_uncommitted_one() {
    let buffer = Arc::new(txcore::buffer::BufferManager::new());
    let disk = Arc::new(DiskSpaceManager::new());
    let log = Arc::new(LogManager::new(buffer.clone()));
    let capacity = CheckpointCapacity { max_dpt_entries_per_record: 10, max_txn_entries_per_record: 10 };
    let recovery = RecoveryManager::new(log.clone(), buffer.clone(), disk.clone(), capacity);

    let t1 = Arc::new(Transaction::new());
    let t2 = Arc::new(Transaction::new());
    recovery.start(&t1);
    recovery.start(&t2);

    let p1 = DiskSpaceManager::page_num(1, 1);
    let p2 = DiskSpaceManager::page_num(1, 2);

    let l1 = recovery.log_page_write(&t1, p1, 0, vec![0; 4], vec![1; 4]).unwrap();
    buffer.fetch_page(p1).write(0, &[1; 4]);
    buffer.fetch_page(p1).set_page_lsn(l1);

    let l2 = recovery.log_page_write(&t2, p2, 0, vec![0; 4], vec![2; 4]).unwrap();
    buffer.fetch_page(p2).write(0, &[2; 4]);
    buffer.fetch_page(p2).set_page_lsn(l2);

    recovery.commit(&t1).unwrap();
    // crash here: T1 never appended END, T2 never committed or aborted.

    // Reopen: a fresh in-memory transaction table over the same durable
    // log, buffer, and disk, as if the process restarted.
    let fresh = RecoveryManager::new(log.clone(), buffer.clone(), disk.clone(), capacity);
    fresh.restart().unwrap();

    // T1's write survives (it committed); T2's write is rolled back to
    // its before-image.
    assert_eq!(buffer.fetch_page(p1).read(0, 4), vec![1, 1, 1, 1]);
    assert_eq!(buffer.fetch_page(p2).read(0, 4), vec![0, 0, 0, 0]);

    // Restart resolves every transaction: T1 commits to completion, T2
    // aborts via a CLR and reaches END too.
    let records = log.scan_from(1).unwrap();
    let t2_num = t2.get_transaction_num();
    assert!(records.iter().any(|r| matches!(r, LogRecord::Abort { transaction_num, .. } if *transaction_num == t2_num)));
    assert!(records
        .iter()
        .filter(|r| matches!(r, LogRecord::End { transaction_num, .. } if *transaction_num == t1.get_transaction_num()
            || *transaction_num == t2_num))
        .count()
        == 2);
}

#[test]
fn fuzzy_checkpoint_packs_into_ceil_sum_of_end_records() {
    let db = Database::new(DatabaseConfig {
        max_dpt_entries_per_record: 3,
        max_txn_entries_per_record: 2,
        ..DatabaseConfig::default()
    });

    for i in 0..7u64 {
        db.recovery.dirty_page(DiskSpaceManager::page_num(1, i), i + 1);
    }
    // Keep the transactions alive (and thus in the transaction table) for
    // the duration of the checkpoint.
    let _txs: Vec<_> = (0..5).map(|_| db.begin_transaction()).collect();

    db.checkpoint().unwrap();

    let end_checkpoints = db
        .log_manager
        .scan_from(1)
        .unwrap()
        .into_iter()
        .filter(|r| matches!(r, LogRecord::EndCheckpoint { .. }))
        .count();
    // ceil(7/3) + ceil(5/2) = 3 + 3 = 6.
    assert_eq!(end_checkpoints, 6);
}
