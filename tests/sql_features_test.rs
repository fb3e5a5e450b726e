// End-to-end SQL feature tests: temporal reads, CRDT merges, vector
// predicates, aggregates, joins, and the save/load round trip.

use latticedb::execution::executor::{QueryResult, Session};
use latticedb::types::value::Value;
use latticedb::{Config, DbError, Engine};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Engine {
    let config = Config {
        data_file: dir.path().join("t.db").display().to_string(),
        log_file: dir.path().join("t.log").display().to_string(),
        buffer_pool_size: 64,
        ..Config::default()
    };
    Engine::open(config).unwrap()
}

fn run(engine: &Engine, session: &mut Session, sql: &str) -> Vec<QueryResult> {
    engine.execute_sql(sql, session).unwrap()
}

fn last_rows(results: Vec<QueryResult>) -> Vec<Vec<Value>> {
    results.into_iter().last().unwrap().rows
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

#[test]
fn test_temporal_read_sees_first_commit() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();

    run(
        &engine,
        &mut session,
        "CREATE TABLE t(id TEXT PRIMARY KEY, v INT); \
         INSERT INTO t VALUES('a', 1); \
         UPDATE t SET v = 2 WHERE id = 'a';",
    );

    let rows = last_rows(run(
        &engine,
        &mut session,
        "SELECT id, v FROM t FOR SYSTEM_TIME AS OF TX 1;",
    ));
    assert_eq!(rows, vec![vec![text("a"), Value::Integer(1)]]);

    // The current state reflects the update.
    let rows = last_rows(run(&engine, &mut session, "SELECT id, v FROM t;"));
    assert_eq!(rows, vec![vec![text("a"), Value::Integer(2)]]);

    // AS OF TX 2 includes the second commit.
    let rows = last_rows(run(
        &engine,
        &mut session,
        "SELECT id, v FROM t FOR SYSTEM_TIME AS OF TX 2;",
    ));
    assert_eq!(rows, vec![vec![text("a"), Value::Integer(2)]]);
}

#[test]
fn test_crdt_merge_lww_gset_sum_bounded() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();

    run(
        &engine,
        &mut session,
        "CREATE TABLE people(id TEXT PRIMARY KEY, name TEXT MERGE lww, \
         tags SET<TEXT> MERGE gset, credits INT MERGE sum_bounded(0, 1000000)); \
         INSERT INTO people VALUES('u1', 'Ada', {'engineer','math'}, 10);",
    );
    run(
        &engine,
        &mut session,
        "INSERT INTO people VALUES('u1', 'Ada Lovelace', {'leader'}, 15) ON CONFLICT MERGE;",
    );

    let rows = last_rows(run(
        &engine,
        &mut session,
        "SELECT id, name, tags, credits FROM people;",
    ));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], text("u1"));
    assert_eq!(rows[0][1], text("Ada Lovelace"));
    assert_eq!(
        rows[0][2],
        Value::canonical_set(vec![text("engineer"), text("leader"), text("math")])
    );
    assert_eq!(rows[0][3], Value::Integer(25));
}

#[test]
fn test_sum_bounded_clamps() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE acct(id TEXT PRIMARY KEY, bal INT MERGE sum_bounded(0, 100)); \
         INSERT INTO acct VALUES('a', 90);",
    );
    run(
        &engine,
        &mut session,
        "INSERT INTO acct VALUES('a', 50) ON CONFLICT MERGE;",
    );
    let rows = last_rows(run(&engine, &mut session, "SELECT bal FROM acct;"));
    assert_eq!(rows, vec![vec![Value::Integer(100)]]);
}

#[test]
fn test_conflict_without_merge_clause_is_unique_violation() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE t(id TEXT PRIMARY KEY, v INT); INSERT INTO t VALUES('a', 1);",
    );
    let err = engine
        .execute_sql("INSERT INTO t VALUES('a', 2);", &mut session)
        .unwrap_err();
    assert_eq!(err.sqlstate(), "23505");
    // The failed statement rolled back; the row is unchanged.
    let rows = last_rows(run(&engine, &mut session, "SELECT v FROM t;"));
    assert_eq!(rows, vec![vec![Value::Integer(1)]]);
}

#[test]
fn test_vector_distance_predicate() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE vecs(id TEXT PRIMARY KEY, v VECTOR<3>); \
         INSERT INTO vecs VALUES('a', [0.1, 0, 0]), ('b', [0.3, 0, 0]);",
    );
    let rows = last_rows(run(
        &engine,
        &mut session,
        "SELECT id FROM vecs WHERE DISTANCE(v, [0, 0, 0]) < 0.2;",
    ));
    assert_eq!(rows, vec![vec![text("a")]]);
}

#[test]
fn test_vector_dimension_mismatch_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE vecs(id TEXT PRIMARY KEY, v VECTOR<3>);",
    );
    let err = engine
        .execute_sql("INSERT INTO vecs VALUES('a', [0.1, 0]);", &mut session)
        .unwrap_err();
    assert!(matches!(err, DbError::DataType(_)));
}

#[test]
fn test_aggregates_group_by_and_join() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE users(id INT PRIMARY KEY, name TEXT); \
         CREATE TABLE orders(id INT PRIMARY KEY, uid INT, amount INT); \
         INSERT INTO users VALUES(1, 'ada'), (2, 'grace'); \
         INSERT INTO orders VALUES(10, 1, 5), (11, 1, 7), (12, 2, 3);",
    );

    let rows = last_rows(run(
        &engine,
        &mut session,
        "SELECT COUNT(*), SUM(amount), MIN(amount), MAX(amount) FROM orders;",
    ));
    assert_eq!(
        rows,
        vec![vec![
            Value::BigInt(3),
            Value::BigInt(15),
            Value::Integer(3),
            Value::Integer(7),
        ]]
    );

    let rows = last_rows(run(
        &engine,
        &mut session,
        "SELECT uid, SUM(amount) FROM orders GROUP BY uid;",
    ));
    assert_eq!(
        rows,
        vec![
            vec![Value::Integer(1), Value::BigInt(12)],
            vec![Value::Integer(2), Value::BigInt(3)],
        ]
    );

    let rows = last_rows(run(
        &engine,
        &mut session,
        "SELECT u.name, o.amount FROM orders o INNER JOIN users u ON o.uid = u.id \
         WHERE o.amount > 4 ORDER BY o.amount DESC;",
    ));
    assert_eq!(
        rows,
        vec![
            vec![text("ada"), Value::Integer(7)],
            vec![text("ada"), Value::Integer(5)],
        ]
    );
}

#[test]
fn test_order_by_and_limit() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE t(id INT PRIMARY KEY, v INT); \
         INSERT INTO t VALUES(1, 30), (2, 10), (3, 20);",
    );
    let rows = last_rows(run(
        &engine,
        &mut session,
        "SELECT id FROM t ORDER BY v ASC LIMIT 2;",
    ));
    assert_eq!(rows, vec![vec![Value::Integer(2)], vec![Value::Integer(3)]]);
}

#[test]
fn test_delete_and_count() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE t(id INT PRIMARY KEY, v INT); \
         INSERT INTO t VALUES(1, 1), (2, 2), (3, 3); \
         DELETE FROM t WHERE v >= 2;",
    );
    let rows = last_rows(run(&engine, &mut session, "SELECT COUNT(*) FROM t;"));
    assert_eq!(rows, vec![vec![Value::BigInt(1)]]);
}

#[test]
fn test_save_and_load_database_round_trip() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let backup = dir.path().join("backup.db").display().to_string();
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE t(id INT PRIMARY KEY, v TEXT); \
         INSERT INTO t VALUES(1, 'one'), (2, 'two');",
    );
    let before = last_rows(run(
        &engine,
        &mut session,
        "SELECT id, v FROM t ORDER BY id;",
    ));
    run(
        &engine,
        &mut session,
        &format!("SAVE DATABASE '{}';", backup),
    );
    // Mutate past the save point, then restore it.
    run(&engine, &mut session, "DELETE FROM t WHERE id = 2;");
    run(
        &engine,
        &mut session,
        &format!("LOAD DATABASE '{}';", backup),
    );
    let after = last_rows(run(
        &engine,
        &mut session,
        "SELECT id, v FROM t ORDER BY id;",
    ));
    assert_eq!(before, after);
}

#[test]
fn test_valid_period_reports_unsupported() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE t(id INT PRIMARY KEY);",
    );
    let err = engine
        .execute_sql(
            "INSERT INTO t VALUES(1) VALID PERIOD ['2024-01-01', '2025-01-01'];",
            &mut session,
        )
        .unwrap_err();
    assert!(matches!(err, DbError::Unsupported(_)));
}

#[test]
fn test_index_ddl_is_catalog_only() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE t(id INT PRIMARY KEY, v INT); \
         CREATE UNIQUE INDEX t_v ON t(v); \
         INSERT INTO t VALUES(1, 10); \
         DROP INDEX t_v;",
    );
    let rows = last_rows(run(&engine, &mut session, "SELECT v FROM t;"));
    assert_eq!(rows, vec![vec![Value::Integer(10)]]);
}

#[test]
fn test_vacuum_trims_old_versions() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut session = Session::default();
    run(
        &engine,
        &mut session,
        "CREATE TABLE t(id INT PRIMARY KEY, v INT); \
         INSERT INTO t VALUES(1, 1); \
         UPDATE t SET v = 2 WHERE id = 1; \
         DELETE FROM t WHERE id = 1;",
    );
    let results = run(&engine, &mut session, "VACUUM;");
    assert!(results[0].message.contains("1 dead row"));
    let rows = last_rows(run(&engine, &mut session, "SELECT COUNT(*) FROM t;"));
    assert_eq!(rows, vec![vec![Value::BigInt(0)]]);
}
