//! Multi-version scenarios through the full engine: wound-wait under
//! MV2PL, cascading abort under MVTO, and the snapshot-isolation commit
//! policies

use minitx::types::{
    ColumnDef, CompareOp, Condition, DataRetrieval, DataType, RowData, TableSchema, Value,
};
use minitx::{AlgorithmKind, Config, Database, MinitxError, MvccVariant, Session, Statement};
use tempfile::tempdir;

fn accounts_schema() -> TableSchema {
    TableSchema::new(
        "accounts",
        vec![
            ColumnDef::new("id", DataType::Integer, false),
            ColumnDef::new("balance", DataType::Integer, false),
        ],
        vec!["id".into()],
    )
}

fn account_row(id: i64, balance: i64) -> RowData {
    let mut row = RowData::new();
    row.insert("id".into(), Value::Integer(id));
    row.insert("balance".into(), Value::Integer(balance));
    row
}

fn open_db(dir: &std::path::Path, variant: MvccVariant) -> Database {
    let config = Config {
        cc_algorithm: AlgorithmKind::Mvcc(variant),
        ..Config::with_data_dir(dir)
    };
    Database::open(config).unwrap()
}

fn setup(db: &Database, ids: &[i64]) {
    let mut session = Session::new();
    db.execute(&mut session, Statement::CreateTable(accounts_schema()))
        .unwrap();
    for &id in ids {
        db.execute(
            &mut session,
            Statement::Insert {
                table: "accounts".into(),
                row: account_row(id, 0),
            },
        )
        .unwrap();
    }
}

fn update_balance(
    db: &Database,
    session: &mut Session,
    id: i64,
    balance: i64,
) -> minitx::Result<minitx::StatementResult> {
    db.execute(
        session,
        Statement::Update {
            table: "accounts".into(),
            assignments: vec![("balance".into(), Value::Integer(balance))],
            conditions: vec![Condition::new("id", CompareOp::Eq, Value::Integer(id))],
        },
    )
}

fn balance(db: &Database, id: i64) -> i64 {
    let rows = db
        .storage()
        .read(&DataRetrieval {
            table: "accounts".into(),
            columns: vec![],
            conditions: vec![Condition::new("id", CompareOp::Eq, Value::Integer(id))],
        })
        .unwrap();
    match rows[0].get("balance") {
        Some(Value::Integer(balance)) => *balance,
        other => panic!("unexpected balance {:?}", other),
    }
}

fn assert_aborted(result: minitx::Result<minitx::StatementResult>) {
    match result.unwrap_err() {
        MinitxError::Transaction(msg) => {
            assert!(msg.to_lowercase().contains("aborted"), "{}", msg)
        }
        other => panic!("expected transaction error, got {}", other),
    }
}

#[test]
fn test_mv2pl_wound_wait_cascade() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), MvccVariant::Mv2pl);
    setup(&db, &[1]);

    // A pool of sessions so the contenders carry distinct ages
    let mut sessions: Vec<Session> = (0..8).map(|_| Session::new()).collect();
    for session in sessions.iter_mut() {
        db.execute(session, Statement::Begin).unwrap();
    }
    let youngest_tid = sessions[7].txn_id.unwrap();
    let oldest_tid = sessions[0].txn_id.unwrap();
    assert!(oldest_tid < youngest_tid);

    // The youngest writes X first; the oldest then wounds it
    update_balance(&db, &mut sessions[7], 1, 80).unwrap();
    update_balance(&db, &mut sessions[0], 1, 10).unwrap();

    // The wounded transaction finds itself torn down on its next statement
    let result = update_balance(&db, &mut sessions[7], 1, 81);
    assert!(result.is_err());
    assert!(sessions[7].txn_id.is_none(), "wounded session must restart");

    // The old transaction commits its write
    db.execute(&mut sessions[0], Statement::Commit).unwrap();
    assert_eq!(balance(&db, 1), 10);

    // The wounded transaction restarts and commits last: its write wins
    db.execute(&mut sessions[7], Statement::Begin).unwrap();
    update_balance(&db, &mut sessions[7], 1, 88).unwrap();
    db.execute(&mut sessions[7], Statement::Commit).unwrap();
    assert_eq!(balance(&db, 1), 88);
}

#[test]
fn test_mvto_cascading_abort() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), MvccVariant::Mvto);
    setup(&db, &[1, 2]);

    let mut s1 = Session::new();
    let mut s2 = Session::new();
    db.execute(&mut s1, Statement::Begin).unwrap();
    db.execute(&mut s2, Statement::Begin).unwrap();

    // T1 writes A (commit deferred); T2 reads T1's uncommitted version
    // of A and writes B on the strength of it
    update_balance(&db, &mut s1, 1, 10).unwrap();
    let rows = match db
        .execute(
            &mut s2,
            Statement::Select(DataRetrieval {
                table: "accounts".into(),
                columns: vec![],
                conditions: vec![Condition::new("id", CompareOp::Eq, Value::Integer(1))],
            }),
        )
        .unwrap()
    {
        minitx::StatementResult::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    };
    assert_eq!(rows[0].get("balance"), Some(&Value::Integer(10)));
    update_balance(&db, &mut s2, 2, 20).unwrap();

    // T1's second write of A arrives behind T2's read: T1 rolls back,
    // and T2 - having observed the disappearing version - cascades
    let result = update_balance(&db, &mut s1, 1, 11);
    assert_aborted(result);
    assert!(s1.txn_id.is_none());

    // T2 is gone too; its next statement fails and its staged write of B
    // never commits
    let result = update_balance(&db, &mut s2, 2, 21);
    assert!(result.is_err());
    assert!(s2.txn_id.is_none());
    assert_eq!(balance(&db, 2), 0);

    // Both restart cleanly
    db.execute(&mut s1, Statement::Begin).unwrap();
    update_balance(&db, &mut s1, 1, 12).unwrap();
    db.execute(&mut s1, Statement::Commit).unwrap();
    assert_eq!(balance(&db, 1), 12);
}

#[test]
fn test_si_fcw_second_committer_loses() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), MvccVariant::SnapshotFcw);
    setup(&db, &[1]);

    let mut s1 = Session::new();
    let mut s2 = Session::new();
    db.execute(&mut s1, Statement::Begin).unwrap();
    db.execute(&mut s2, Statement::Begin).unwrap();

    // Both read X = 0 from their snapshots
    for session in [&mut s1, &mut s2] {
        let rows = match db
            .execute(session, Statement::Select(DataRetrieval::all("accounts")))
            .unwrap()
        {
            minitx::StatementResult::Rows(rows) => rows,
            other => panic!("expected rows, got {:?}", other),
        };
        assert_eq!(rows[0].get("balance"), Some(&Value::Integer(0)));
    }

    update_balance(&db, &mut s1, 1, 1).unwrap();
    update_balance(&db, &mut s2, 1, 2).unwrap();

    // First committer wins; the second aborts at commit
    db.execute(&mut s1, Statement::Commit).unwrap();
    let result = db.execute(&mut s2, Statement::Commit);
    match result.unwrap_err() {
        MinitxError::Transaction(msg) => {
            assert!(msg.to_lowercase().contains("aborted"), "{}", msg)
        }
        other => panic!("expected transaction error, got {}", other),
    }
    assert!(s2.txn_id.is_none());
    assert_eq!(balance(&db, 1), 1);
}

#[test]
fn test_si_fuw_second_updater_loses_immediately() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), MvccVariant::SnapshotFuw);
    setup(&db, &[1]);

    let mut s1 = Session::new();
    let mut s2 = Session::new();
    db.execute(&mut s1, Statement::Begin).unwrap();
    db.execute(&mut s2, Statement::Begin).unwrap();

    update_balance(&db, &mut s1, 1, 1).unwrap();

    // The second updater aborts at write time, not commit time
    let result = update_balance(&db, &mut s2, 1, 2);
    assert_aborted(result);
    assert!(s2.txn_id.is_none());

    db.execute(&mut s1, Statement::Commit).unwrap();
    assert_eq!(balance(&db, 1), 1);
}

#[test]
fn test_snapshot_reads_are_stable_across_concurrent_commits() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), MvccVariant::SnapshotFcw);
    setup(&db, &[1]);

    let mut reader = Session::new();
    let mut writer = Session::new();
    db.execute(&mut reader, Statement::Begin).unwrap();

    // The reader's snapshot predates the writer's commit
    let before = match db
        .execute(&mut reader, Statement::Select(DataRetrieval::all("accounts")))
        .unwrap()
    {
        minitx::StatementResult::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    };
    assert_eq!(before[0].get("balance"), Some(&Value::Integer(0)));

    db.execute(&mut writer, Statement::Begin).unwrap();
    update_balance(&db, &mut writer, 1, 99).unwrap();
    db.execute(&mut writer, Statement::Commit).unwrap();

    let after = match db
        .execute(&mut reader, Statement::Select(DataRetrieval::all("accounts")))
        .unwrap()
    {
        minitx::StatementResult::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    };
    assert_eq!(
        after[0].get("balance"),
        Some(&Value::Integer(0)),
        "the snapshot must not move"
    );
    db.execute(&mut reader, Statement::Commit).unwrap();
}

#[test]
fn test_mv2pl_younger_writer_waits_for_older() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), MvccVariant::Mv2pl);
    setup(&db, &[1]);

    let mut s1 = Session::new();
    let mut s2 = Session::new();
    db.execute(&mut s1, Statement::Begin).unwrap();
    db.execute(&mut s2, Statement::Begin).unwrap();

    // The older transaction holds the lock; the younger one waits
    update_balance(&db, &mut s1, 1, 10).unwrap();
    let blocked = update_balance(&db, &mut s2, 1, 20).unwrap_err();
    match blocked {
        MinitxError::Transaction(msg) => assert!(msg.contains("must wait"), "{}", msg),
        other => panic!("expected transaction error, got {}", other),
    }
    assert!(s2.txn_id.is_some(), "waiting is retriable");

    db.execute(&mut s1, Statement::Commit).unwrap();
    assert_eq!(balance(&db, 1), 10);
}
