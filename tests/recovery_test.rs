// Crash-recovery tests: the WAL is forced at commit, pages are not, and a
// process death in between must lose nothing that committed.

use latticedb::execution::executor::Session;
use latticedb::types::value::Value;
use latticedb::{Config, Engine};
use tempfile::TempDir;

fn config(dir: &TempDir) -> Config {
    Config {
        data_file: dir.path().join("t.db").display().to_string(),
        log_file: dir.path().join("t.log").display().to_string(),
        buffer_pool_size: 64,
        ..Config::default()
    }
}

#[test]
fn test_thousand_rows_survive_crash_before_page_flush() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);

    {
        let engine = Engine::open(cfg.clone()).unwrap();
        let mut session = Session::default();
        engine
            .execute_sql(
                "CREATE TABLE t(id INT PRIMARY KEY, payload TEXT);",
                &mut session,
            )
            .unwrap();
        // Ten batched inserts of one hundred rows each; every commit forces
        // the log, no checkpoint ever flushes the data pages.
        for batch in 0..10 {
            let mut stmt = String::from("INSERT INTO t VALUES");
            for i in 0..100 {
                let id = batch * 100 + i;
                if i > 0 {
                    stmt.push(',');
                }
                stmt.push_str(&format!("({}, 'row-{}')", id, id));
            }
            stmt.push(';');
            engine.execute_sql(&stmt, &mut session).unwrap();
        }
        engine.crash();
    }

    let engine = Engine::open(cfg).unwrap();
    let mut session = Session::default();
    let results = engine
        .execute_sql("SELECT COUNT(*) FROM t;", &mut session)
        .unwrap();
    assert_eq!(results[0].rows, vec![vec![Value::BigInt(1000)]]);

    // Spot-check contents, not just the count.
    let results = engine
        .execute_sql("SELECT payload FROM t WHERE id = 999;", &mut session)
        .unwrap();
    assert_eq!(
        results[0].rows,
        vec![vec![Value::Text("row-999".to_string())]]
    );
}

#[test]
fn test_updates_and_deletes_replay() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    {
        let engine = Engine::open(cfg.clone()).unwrap();
        let mut session = Session::default();
        engine
            .execute_sql(
                "CREATE TABLE t(id INT PRIMARY KEY, v INT); \
                 INSERT INTO t VALUES(1, 10), (2, 20), (3, 30); \
                 UPDATE t SET v = 21 WHERE id = 2; \
                 DELETE FROM t WHERE id = 3;",
                &mut session,
            )
            .unwrap();
        engine.crash();
    }
    let engine = Engine::open(cfg).unwrap();
    let mut session = Session::default();
    let results = engine
        .execute_sql("SELECT id, v FROM t ORDER BY id;", &mut session)
        .unwrap();
    assert_eq!(
        results[0].rows,
        vec![
            vec![Value::Integer(1), Value::Integer(10)],
            vec![Value::Integer(2), Value::Integer(21)],
        ]
    );
}

#[test]
fn test_graceful_shutdown_then_reopen() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    {
        let engine = Engine::open(cfg.clone()).unwrap();
        let mut session = Session::default();
        engine
            .execute_sql(
                "CREATE TABLE t(id INT PRIMARY KEY, v TEXT); \
                 INSERT INTO t VALUES(1, 'persisted');",
                &mut session,
            )
            .unwrap();
        engine.close().unwrap();
    }
    let engine = Engine::open(cfg).unwrap();
    let mut session = Session::default();
    let results = engine
        .execute_sql("SELECT v FROM t;", &mut session)
        .unwrap();
    assert_eq!(
        results[0].rows,
        vec![vec![Value::Text("persisted".to_string())]]
    );
}

#[test]
fn test_repeated_crash_recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    {
        let engine = Engine::open(cfg.clone()).unwrap();
        let mut session = Session::default();
        engine
            .execute_sql(
                "CREATE TABLE t(id INT PRIMARY KEY, v INT); INSERT INTO t VALUES(1, 1);",
                &mut session,
            )
            .unwrap();
        engine.crash();
    }
    // Crash again immediately after recovery, before any new work.
    {
        let engine = Engine::open(cfg.clone()).unwrap();
        engine.crash();
    }
    let engine = Engine::open(cfg).unwrap();
    let mut session = Session::default();
    let results = engine
        .execute_sql("SELECT COUNT(*) FROM t;", &mut session)
        .unwrap();
    assert_eq!(results[0].rows, vec![vec![Value::BigInt(1)]]);
}

#[test]
fn test_crdt_state_survives_crash() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    {
        let engine = Engine::open(cfg.clone()).unwrap();
        let mut session = Session::default();
        engine
            .execute_sql(
                "CREATE TABLE people(id TEXT PRIMARY KEY, tags SET<TEXT> MERGE gset); \
                 INSERT INTO people VALUES('u1', {'a'}); \
                 INSERT INTO people VALUES('u1', {'b'}) ON CONFLICT MERGE;",
                &mut session,
            )
            .unwrap();
        engine.crash();
    }
    let engine = Engine::open(cfg).unwrap();
    let mut session = Session::default();
    let results = engine
        .execute_sql("SELECT tags FROM people;", &mut session)
        .unwrap();
    assert_eq!(
        results[0].rows,
        vec![vec![Value::canonical_set(vec![
            Value::Text("a".to_string()),
            Value::Text("b".to_string()),
        ])]]
    );
}
