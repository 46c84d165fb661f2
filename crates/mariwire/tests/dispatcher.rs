mod common;

use std::sync::{Arc, Mutex};

use common::{ScriptedTransport, WireLog, column, err, ok, result_end, row, run};
use mariwire::protocol::capabilities::CLIENT_DEPRECATE_EOF;
use mariwire::protocol::writer::frame;
use mariwire::stream::{Conduit, InboundBuffer};
use mariwire::{Client, Discipline, ProtocolContext, Request};
use mariwire_core::Cx;

const FIRST: &str = "SELECT id, name FROM items";
const THIRD: &str = "SELECT * FROM missing";

/// Reply frames for FIRST: two columns, two rows.
fn first_reply() -> Vec<Vec<u8>> {
    vec![
        vec![0x02],
        column("id"),
        column("name"),
        row(&["1", "apple"]),
        row(&["2", "pear"]),
        result_end(0x0002),
    ]
}

fn framed(replies: &[Vec<Vec<u8>>]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for reply in replies {
        for (i, payload) in reply.iter().enumerate() {
            bytes.extend(frame(payload, u8::try_from(i + 1).unwrap()));
        }
    }
    bytes
}

fn client(discipline: Discipline, inbound: Vec<u8>) -> (Client, Arc<Mutex<WireLog>>) {
    let (transport, log) = ScriptedTransport::new(inbound);
    let transport = transport.chunk(3).yielding();
    let context = ProtocolContext {
        capabilities: CLIENT_DEPRECATE_EOF,
        status_flags: 0x0002,
        ..ProtocolContext::default()
    };
    let client = Client::new(
        discipline,
        Conduit::new(Box::new(transport)),
        InboundBuffer::new(),
        context,
    );
    (client, log)
}

fn three_replies() -> (Vec<u8>, usize) {
    let first = framed(&[first_reply()]);
    let first_len = first.len();
    let mut bytes = first;
    bytes.extend(framed(&[vec![ok(0x0002)]]));
    bytes.extend(framed(&[vec![err(1146, "42S02", "Table 'shop.missing' doesn't exist")]]));
    (bytes, first_len)
}

#[test]
fn pipelined_replies_are_attributed_in_send_order() {
    let (inbound, first_len) = three_replies();
    let (client, log) = client(Discipline::Pipelined, inbound);
    let cx = Cx::for_testing();

    let (r1, r2, r3) = run(async {
        futures::join!(
            client.send(&cx, Request::Query(FIRST)),
            client.send(&cx, Request::Ping),
            client.send(&cx, Request::Query(THIRD)),
        )
    });

    let r1 = r1.unwrap();
    assert_eq!(r1.frames(), first_reply().as_slice());
    assert_eq!(r1.status_flags(), Some(0x0002));

    let r2 = r2.unwrap();
    assert!(r2.ok_packet().is_some());

    let r3 = r3.unwrap();
    assert!(r3.is_error());
    assert_eq!(r3.into_result().unwrap_err().error_code(), Some(1146));

    let log = log.lock().unwrap();
    assert_eq!(log.commands(), vec![0x03, 0x0e, 0x03]);
    // later commands went out before the first reply had been read
    assert_eq!(log.writes.len(), 3);
    assert!(log.writes[1].0 < first_len);
    assert!(log.writes[2].0 < first_len);
    assert_eq!(client.pending_len(), 0);
}

#[test]
fn sequential_waits_for_each_reply_before_sending() {
    let (inbound, first_len) = three_replies();
    let total = inbound.len();
    let (client, log) = client(Discipline::Sequential, inbound);
    let cx = Cx::for_testing();

    let (r1, r2, r3) = run(async {
        futures::join!(
            client.send(&cx, Request::Query(FIRST)),
            client.send(&cx, Request::Ping),
            client.send(&cx, Request::Query(THIRD)),
        )
    });

    assert_eq!(r1.unwrap().frames().len(), 6);
    assert!(!r2.unwrap().is_error());
    assert!(r3.unwrap().is_error());

    let log = log.lock().unwrap();
    assert_eq!(log.writes[0].0, 0);
    assert!(log.writes[1].0 >= first_len);
    assert!(log.writes[2].0 > log.writes[1].0);
    assert_eq!(log.delivered, total);
}

#[test]
fn transport_failure_fails_every_queued_command() {
    // the first reply is cut off after its column definitions
    let mut inbound = Vec::new();
    for (i, payload) in first_reply()[..3].iter().enumerate() {
        inbound.extend(frame(payload, u8::try_from(i + 1).unwrap()));
    }
    let (client, _) = client(Discipline::Pipelined, inbound);
    let cx = Cx::for_testing();

    let (r1, r2, r3) = run(async {
        futures::join!(
            client.send(&cx, Request::Query(FIRST)),
            client.send(&cx, Request::Ping),
            client.send(&cx, Request::Query(THIRD)),
        )
    });

    for result in [r1, r2, r3] {
        let e = result.unwrap_err();
        assert!(e.is_connection_error(), "{e}");
    }
    assert!(client.is_closed());
    assert_eq!(client.pending_len(), 0);

    let e = run(client.send(&cx, Request::Ping)).unwrap_err();
    assert!(e.to_string().contains("connection closed"));
}

#[test]
fn abandoned_wait_still_consumes_its_reply() {
    let mut inbound = framed(&[first_reply()]);
    inbound.extend(framed(&[vec![ok(0x0003)]]));
    let (client, log) = client(Discipline::Pipelined, inbound);
    let cx = Cx::for_testing();

    let ping = run(async {
        let mut first = Box::pin(client.send(&cx, Request::Query(FIRST)));
        assert!(futures::poll!(first.as_mut()).is_pending());
        drop(first);
        client.send(&cx, Request::Ping).await
    })
    .unwrap();

    // the ping got its own OK, not a frame of the abandoned result set
    assert_eq!(ping.frames().len(), 1);
    assert_eq!(ping.status_flags(), Some(0x0003));
    assert!(client.context().in_transaction());
    assert_eq!(log.lock().unwrap().commands(), vec![0x03, 0x0e]);
    assert!(!client.is_closed());
}

#[test]
fn close_fails_waiters_and_releases_transport() {
    let (client, log) = client(Discipline::Pipelined, Vec::new());
    let cx = Cx::for_testing();

    run(client.close(&cx));
    run(client.close(&cx));

    assert!(client.is_closed());
    let log = log.lock().unwrap();
    assert!(log.dropped);
    assert_eq!(log.commands(), vec![0x01]);
}
