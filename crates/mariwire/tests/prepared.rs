mod common;

use std::sync::{Arc, Mutex};

use common::{ScriptedTransport, WireLog, column, err, ok, prepare_ok, run};
use mariwire::protocol::capabilities::CLIENT_DEPRECATE_EOF;
use mariwire::protocol::writer::frame;
use mariwire::stream::{Conduit, InboundBuffer};
use mariwire::{Client, ConnectionConfig, Discipline, MariaDbConnection, ProtocolContext};
use mariwire_core::{Cx, Outcome, Value};

const PREPARE: u8 = 0x16;
const EXECUTE: u8 = 0x17;
const CLOSE: u8 = 0x19;

/// Replies are framed at sequence 1; the dispatcher does not check ids.
fn connection(replies: &[Vec<u8>], cache_size: usize) -> (MariaDbConnection, Arc<Mutex<WireLog>>) {
    let mut inbound = Vec::new();
    for reply in replies {
        inbound.extend(frame(reply, 1));
    }
    let (transport, log) = ScriptedTransport::new(inbound);
    let context = ProtocolContext {
        capabilities: CLIENT_DEPRECATE_EOF,
        ..ProtocolContext::default()
    };
    let client = Client::new(
        Discipline::Pipelined,
        Conduit::new(Box::new(transport)),
        InboundBuffer::new(),
        context,
    );
    let config = ConnectionConfig::new()
        .host("db", 3306)
        .prepare_cache_size(cache_size);
    (MariaDbConnection::from_client(client, &config), log)
}

fn closed_ids(log: &WireLog) -> Vec<u32> {
    log.sent_payloads()
        .iter()
        .filter(|p| p[0] == CLOSE)
        .map(|p| u32::from_le_bytes([p[1], p[2], p[3], p[4]]))
        .collect()
}

fn expect_ok<T>(outcome: Outcome<T, mariwire::Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        _ => panic!("operation did not complete"),
    }
}

#[test]
fn capacity_three_evicts_two_oldest_over_five_statements() {
    let mut replies = Vec::new();
    for id in 1..=5 {
        replies.push(prepare_ok(id, 0, 0));
        replies.push(ok(0x0002));
    }
    let (conn, log) = connection(&replies, 3);
    let cx = Cx::for_testing();

    run(async {
        for i in 1..=5 {
            expect_ok(conn.execute_prepared(&cx, &format!("DO {i}"), &[]).await);
        }
    });

    let log = log.lock().unwrap();
    assert_eq!(closed_ids(&log), vec![1, 2]);
    assert_eq!(
        log.commands(),
        vec![
            PREPARE, EXECUTE, PREPARE, EXECUTE, PREPARE, EXECUTE, PREPARE, CLOSE, EXECUTE, PREPARE,
            CLOSE, EXECUTE
        ]
    );
    let cached: Vec<u32> = conn.cache().snapshot().iter().map(|e| e.statement_id).collect();
    assert_eq!(cached, vec![3, 4, 5]);
    assert_eq!(conn.cache().stats().evictions, 2);
}

#[test]
fn repeated_statement_is_prepared_once() {
    // one parameter definition follows the prepare OK
    let replies = vec![prepare_ok(7, 0, 1), column("?"), ok(0x0002), ok(0x0002)];
    let (conn, log) = connection(&replies, 8);
    let cx = Cx::for_testing();
    let sql = "UPDATE items SET seen = 1 WHERE id = ?";

    run(async {
        expect_ok(conn.execute_prepared(&cx, sql, &[Value::BigInt(1)]).await);
        expect_ok(conn.execute_prepared(&cx, sql, &[Value::BigInt(2)]).await);
    });

    let log = log.lock().unwrap();
    assert_eq!(log.commands(), vec![PREPARE, EXECUTE, EXECUTE]);
    let executes: Vec<Vec<u8>> = log
        .sent_payloads()
        .into_iter()
        .filter(|p| p[0] == EXECUTE)
        .collect();
    assert!(executes.iter().all(|p| p[1..5] == 7u32.to_le_bytes()));
    assert_eq!(conn.cache().stats().hits, 1);
}

#[test]
fn busy_handle_close_waits_for_release() {
    let replies = vec![prepare_ok(1, 0, 0), prepare_ok(2, 0, 0), ok(0x0002)];
    let (conn, log) = connection(&replies, 1);
    let cx = Cx::for_testing();

    let held = run(async {
        let held = expect_ok(conn.prepare(&cx, "SELECT 1").await);
        expect_ok(conn.execute_prepared(&cx, "SELECT 2", &[]).await);
        held
    });

    assert!(closed_ids(&log.lock().unwrap()).is_empty());
    let detached = conn.cache().detached();
    assert_eq!(detached.len(), 1);
    assert!(detached[0].closing);

    run(async { expect_ok(conn.release(&cx, &held).await) });

    assert_eq!(closed_ids(&log.lock().unwrap()), vec![1]);
    assert!(conn.cache().detached().is_empty());
}

#[test]
fn disabled_cache_closes_after_every_execution() {
    let replies = vec![prepare_ok(1, 0, 0), ok(0x0002), prepare_ok(2, 0, 0), ok(0x0002)];
    let (conn, log) = connection(&replies, 0);
    let cx = Cx::for_testing();

    run(async {
        for _ in 0..2 {
            expect_ok(conn.execute_prepared(&cx, "DO 1", &[Value::Null]).await);
        }
    });

    let log = log.lock().unwrap();
    assert_eq!(
        log.commands(),
        vec![PREPARE, EXECUTE, CLOSE, PREPARE, EXECUTE, CLOSE]
    );
    assert_eq!(closed_ids(&log), vec![1, 2]);
    assert!(conn.cache().is_empty());
}

#[test]
fn failed_execution_still_releases_the_handle() {
    let replies = vec![
        prepare_ok(4, 0, 0),
        err(1062, "23000", "Duplicate entry '1' for key 'PRIMARY'"),
    ];
    let (conn, _) = connection(&replies, 4);
    let cx = Cx::for_testing();

    let outcome = run(conn.execute_prepared(&cx, "INSERT INTO items VALUES (1)", &[]));

    match outcome {
        Outcome::Err(e) => assert_eq!(e.error_code(), Some(1062)),
        _ => panic!("expected a server error"),
    }
    let entries = conn.cache().snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].use_count, 0);
}

#[test]
fn prepare_error_is_returned_and_not_cached() {
    let replies = vec![err(1064, "42000", "You have an error in your SQL syntax")];
    let (conn, _) = connection(&replies, 4);
    let cx = Cx::for_testing();

    let outcome = run(conn.prepare(&cx, "SELEC 1"));

    match outcome {
        Outcome::Err(e) => assert_eq!(e.error_code(), Some(1064)),
        _ => panic!("expected a server error"),
    }
    assert!(conn.cache().is_empty());
    assert!(!conn.is_closed());
}
