//! Session behaviour against a recording fake engine.

use std::time::Duration;

use txlock_sim::classify::Statement;
use txlock_sim::models::{ResourceKey, SessionStatus};
use txlock_sim::session::{Session, SessionOptions};
use txlock_sim::AppError;

use super::test_helpers::{services, session, wait_for_status, FakeConnector, CLOSE, CONNECT};

fn row(id: i64) -> ResourceKey {
    ResourceKey::row("accounts", id)
}

// ── Connection lease ─────────────────────────────────────────

#[tokio::test]
async fn connection_opens_lazily_and_closes_after_autocommit() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector.clone());
    let mut a = session("A", &services);

    assert!(!a.has_connection());
    assert!(connector.log().is_empty(), "nothing opened at creation");

    a.execute("SELECT 1").await.expect("select");
    assert!(!a.has_connection());
    assert_eq!(connector.log(), vec![CONNECT, "SELECT 1", CLOSE]);
}

#[tokio::test]
async fn connection_is_held_for_the_whole_transaction() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector.clone());
    let mut a = session("A", &services);

    a.execute("BEGIN").await.expect("begin");
    a.execute("INSERT INTO accounts VALUES (9, 0)").await.expect("insert");
    assert!(a.has_connection());
    assert_eq!(connector.count(CONNECT), 1);

    a.execute("COMMIT").await.expect("commit");
    assert!(!a.has_connection());
    assert_eq!(connector.count(CLOSE), 1);
}

#[tokio::test]
async fn initialize_opens_and_closes_once() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector.clone());
    let mut a = session("A", &services);

    a.initialize().await.expect("initialize");
    assert_eq!(connector.log(), vec![CONNECT, CLOSE]);
    assert!(!a.has_connection());
}

// ── Transactions ─────────────────────────────────────────────

#[tokio::test]
async fn each_begin_mints_a_fresh_transaction() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector);
    let mut a = session("A", &services);

    a.execute("BEGIN").await.expect("begin");
    let first = a.transaction_id().expect("tx open");
    assert!(a.state().in_transaction);
    assert_eq!(a.state().transaction_id, Some(first));
    a.execute("COMMIT").await.expect("commit");
    assert!(a.transaction_id().is_none());

    a.execute("BEGIN").await.expect("begin");
    let second = a.transaction_id().expect("tx open");
    assert_ne!(first, second);
}

#[tokio::test]
async fn nested_begin_is_ignored() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector.clone());
    let mut a = session("A", &services);

    a.execute("BEGIN").await.expect("begin");
    let tx = a.transaction_id();
    let nested = a.execute("BEGIN").await.expect("nested begin is not an error");

    assert_eq!(nested.statement, Statement::Begin);
    assert_eq!(a.transaction_id(), tx);
    assert_eq!(connector.statements(), vec!["BEGIN"], "second BEGIN never forwarded");
}

#[tokio::test]
async fn rollback_releases_row_locks() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector);
    let mut a = session("A", &services);

    a.execute("BEGIN").await.expect("begin");
    a.execute("UPDATE accounts SET balance = 0 WHERE id = 1").await.expect("update");
    assert_eq!(services.locks.holder(&row(1)), a.transaction_id());

    a.execute("ROLLBACK").await.expect("rollback");
    assert_eq!(services.locks.holder(&row(1)), None);
    assert_eq!(a.state().status, SessionStatus::Idle);
}

// ── Locking ──────────────────────────────────────────────────

#[tokio::test]
async fn locking_write_in_transaction_holds_row_until_commit() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector);
    let mut a = session("A", &services);

    a.execute("BEGIN").await.expect("begin");
    let execution = a
        .execute("UPDATE accounts SET balance = 1 WHERE id = 1")
        .await
        .expect("update");

    assert_eq!(execution.statement.resource(), Some(row(1)));
    assert_eq!(services.locks.holder(&row(1)), a.transaction_id());
    assert_eq!(a.state().status, SessionStatus::Acquired);

    a.execute("COMMIT").await.expect("commit");
    assert_eq!(services.locks.holder(&row(1)), None);
    assert_eq!(a.state().status, SessionStatus::Idle);
}

#[tokio::test]
async fn repeated_locking_statements_are_reentrant() {
    let connector = FakeConnector::new(true);
    let (services, timeline) = services(connector);
    let mut a = session("A", &services);

    a.execute("BEGIN").await.expect("begin");
    a.execute("SELECT * FROM accounts WHERE id = 3 FOR UPDATE").await.expect("read");
    a.execute("UPDATE accounts SET balance = 3 WHERE id = 3").await.expect("write");

    let tx = a.transaction_id().expect("tx");
    assert_eq!(services.locks.held_by(tx), vec![row(3)]);
    assert!(timeline.entries().iter().all(|e| !e.content.starts_with("waiting")));
}

#[tokio::test]
async fn locking_read_outside_transaction_takes_no_lock() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector.clone());
    let mut a = session("A", &services);
    let mut b = session("B", &services);

    a.execute("BEGIN").await.expect("begin");
    a.execute("UPDATE accounts SET balance = 1 WHERE id = 1").await.expect("update");

    let read = tokio::time::timeout(
        Duration::from_secs(2),
        b.execute("SELECT * FROM accounts WHERE id = 1 FOR UPDATE"),
    )
    .await
    .expect("autocommit locking read never waits")
    .expect("read");

    assert_eq!(read.statement.kind(), "locking_read");
    assert_eq!(services.locks.queue_len(&row(1)), 0);
    assert_eq!(b.state().status, SessionStatus::Idle);
    assert!(connector
        .statements()
        .contains(&"SELECT * FROM accounts WHERE id = 1 FOR UPDATE".to_owned()));
}

#[tokio::test]
async fn locking_clause_is_stripped_for_engines_without_support() {
    let connector = FakeConnector::new(false);
    let (services, _) = services(connector.clone());
    let mut a = session("A", &services);

    a.execute("BEGIN").await.expect("begin");
    a.execute("SELECT * FROM accounts WHERE id = 2 FOR UPDATE").await.expect("read");

    assert_eq!(
        connector.statements(),
        vec!["BEGIN", "SELECT * FROM accounts WHERE id = 2"]
    );
    assert_eq!(services.locks.holder(&row(2)), a.transaction_id());
}

#[tokio::test]
async fn contended_write_waits_then_acquires() {
    let connector = FakeConnector::new(true);
    let (services, timeline) = services(connector);
    let mut a = session("A", &services);
    let mut b = session("B", &services);

    a.execute("BEGIN").await.expect("begin");
    a.execute("UPDATE accounts SET balance = 1 WHERE id = 1").await.expect("update");
    b.execute("BEGIN").await.expect("begin");
    let b_tx = b.transaction_id().expect("tx");

    let mut b_state = b.subscribe();
    let blocked = tokio::spawn(async move {
        let outcome = b.execute("UPDATE accounts SET balance = 2 WHERE id = 1").await;
        (b, outcome)
    });

    wait_for_status(&mut b_state, SessionStatus::Waiting).await;
    assert!(!blocked.is_finished());
    assert_eq!(services.locks.holder(&row(1)), a.transaction_id());

    a.execute("COMMIT").await.expect("commit");
    let (b, outcome) = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("b resumed")
        .expect("task ok");
    outcome.expect("b update");

    assert_eq!(services.locks.holder(&row(1)), Some(b_tx));
    assert_eq!(b.state().status, SessionStatus::Acquired);

    let b_events: Vec<String> = timeline
        .entries()
        .into_iter()
        .filter(|e| e.session_label == "B")
        .map(|e| e.content)
        .collect();
    let waits = b_events.iter().filter(|c| c.starts_with("waiting for accounts:1")).count();
    let acquires = b_events.iter().filter(|c| *c == "acquired accounts:1").count();
    assert_eq!((waits, acquires), (1, 1));
}

#[tokio::test]
async fn autocommit_write_holds_statement_scoped_lock() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector);
    let mut a = session("A", &services);
    let mut b = session("B", &services);

    a.execute("BEGIN").await.expect("begin");
    a.execute("UPDATE accounts SET balance = 1 WHERE id = 1").await.expect("update");

    let mut b_state = b.subscribe();
    let blocked = tokio::spawn(async move {
        let outcome = b.execute("UPDATE accounts SET balance = 2 WHERE id = 1").await;
        (b, outcome)
    });
    wait_for_status(&mut b_state, SessionStatus::Waiting).await;

    a.execute("COMMIT").await.expect("commit");
    let (b, outcome) = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("b resumed")
        .expect("task ok");
    outcome.expect("b update");

    assert_eq!(services.locks.holder(&row(1)), None, "released after the statement");
    assert_eq!(b.state().status, SessionStatus::Idle);
    assert!(!b.in_transaction());
}

#[tokio::test]
async fn autocommit_write_skips_lock_when_disabled() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector);
    let mut a = session("A", &services);
    let mut b = Session::new(
        "B",
        services.clone(),
        SessionOptions {
            autocommit_write_locks: false,
        },
    );

    a.execute("BEGIN").await.expect("begin");
    a.execute("UPDATE accounts SET balance = 1 WHERE id = 1").await.expect("update");

    tokio::time::timeout(
        Duration::from_secs(2),
        b.execute("UPDATE accounts SET balance = 2 WHERE id = 1"),
    )
    .await
    .expect("no wait")
    .expect("update");
    assert_eq!(services.locks.queue_len(&row(1)), 0);
}

// ── Errors and timeline ──────────────────────────────────────

#[tokio::test]
async fn engine_error_keeps_transaction_and_locks() {
    let connector = FakeConnector::new(true);
    let (services, timeline) = services(connector);
    let mut a = session("A", &services);

    a.execute("BEGIN").await.expect("begin");
    a.execute("UPDATE accounts SET balance = 1 WHERE id = 1").await.expect("update");
    let err = a.execute("UPDATE accounts SET FAIL").await.expect_err("engine rejects");

    assert!(matches!(&err, AppError::Engine(msg) if msg.contains("syntax error")));
    assert!(a.in_transaction());
    assert_eq!(services.locks.holder(&row(1)), a.transaction_id());
    assert!(!a.state().busy);

    let last = timeline.entries().pop().expect("error recorded");
    assert_eq!(last.session_label, "A");
    assert!(last.content.starts_with("UPDATE accounts SET FAIL -- engine:"));
}

#[tokio::test]
async fn every_statement_lands_on_the_timeline_in_order() {
    let connector = FakeConnector::new(true);
    let (services, timeline) = services(connector);
    let mut a = session("A", &services);
    let mut b = session("B", &services);

    a.execute("BEGIN").await.expect("begin");
    b.execute("SELECT 1").await.expect("select");
    a.execute("COMMIT").await.expect("commit");

    let seen: Vec<(String, String)> = timeline
        .entries()
        .into_iter()
        .map(|e| (e.session_label, e.content))
        .collect();
    assert_eq!(
        seen,
        vec![
            ("A".to_owned(), "BEGIN".to_owned()),
            ("B".to_owned(), "SELECT 1".to_owned()),
            ("A".to_owned(), "COMMIT".to_owned()),
        ]
    );
}

#[tokio::test]
async fn close_discards_transaction_and_releases_locks() {
    let connector = FakeConnector::new(true);
    let (services, _) = services(connector.clone());
    let mut a = session("A", &services);

    a.execute("BEGIN").await.expect("begin");
    a.execute("UPDATE accounts SET balance = 1 WHERE id = 4").await.expect("update");
    a.close().await;

    assert!(!a.has_connection());
    assert!(!a.in_transaction());
    assert_eq!(services.locks.holder(&row(4)), None);
    assert_eq!(connector.count(CLOSE), 1);
}

#[tokio::test]
async fn read_table_does_not_touch_timeline() {
    let connector = FakeConnector::new(true);
    let (services, timeline) = services(connector.clone());
    let mut a = session("A", &services);

    a.read_table("accounts").await.expect("read");
    assert!(timeline.is_empty());
    assert_eq!(connector.statements(), vec!["SELECT * FROM accounts"]);
    assert!(!a.has_connection());
}
