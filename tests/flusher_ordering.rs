//! Flusher behavior: submission ordering, PING prepending, window
//! parking and release, stream id allocation under concurrency.

mod common;

use common::{wait_frames, wait_until, MockEndpoint};
use h2mux::callback::Callback;
use h2mux::frames::*;
use h2mux::session::SessionBuilder;
use h2mux::ErrorCode;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn frames_are_emitted_in_submission_order() {
    let endpoint = MockEndpoint::new();
    let session = SessionBuilder::client().build(endpoint.clone());

    session.settings(
        h2mux::SettingsFrame::new(h2mux::Settings::new()),
        Callback::noop(),
    );
    let stream = session
        .new_stream(
            HeadersFrame::new(0, vec![(":method".into(), "GET".into())], false),
            Arc::new(()),
            Callback::noop(),
        )
        .unwrap();
    session.data(
        &stream,
        DataFrame::new(stream.id(), Bytes::from_static(b"payload"), true),
        Callback::noop(),
    );

    let frames = wait_frames(&endpoint, 3, "settings, headers, data");
    assert!(matches!(frames[0], Frame::Settings(_)));
    assert!(matches!(frames[1], Frame::Headers(_)));
    assert!(matches!(frames[2], Frame::Data(_)));
}

#[test]
fn ping_overtakes_queued_data() {
    let endpoint = MockEndpoint::new();
    let session = SessionBuilder::client().build(endpoint.clone());

    let stream = session
        .new_stream(
            HeadersFrame::new(0, vec![(":method".into(), "POST".into())], false),
            Arc::new(()),
            Callback::noop(),
        )
        .unwrap();

    // Let the HEADERS flush on its own, then park the writer inside
    // the next write so a backlog builds up behind it.
    wait_frames(&endpoint, 1, "headers flushed");
    endpoint.set_block_writes(true);
    session.data(
        &stream,
        DataFrame::new(stream.id(), Bytes::from(vec![1u8; 1_000]), false),
        Callback::noop(),
    );
    endpoint.wait_writes_started(2, Duration::from_secs(5));

    session.data(
        &stream,
        DataFrame::new(stream.id(), Bytes::from(vec![2u8; 1_000]), false),
        Callback::noop(),
    );
    session.ping(PingFrame::new([8; 8]), Callback::noop());
    endpoint.set_block_writes(false);

    let frames = wait_frames(&endpoint, 3, "headers+data, ping, data");
    let ping_pos = frames
        .iter()
        .position(|f| matches!(f, Frame::Ping(_)))
        .expect("ping frame");
    let last_data_pos = frames
        .iter()
        .rposition(|f| matches!(f, Frame::Data(_)))
        .expect("data frame");
    // The PING was submitted after the second DATA but is written
    // ahead of it.
    assert!(ping_pos < last_data_pos);
}

#[test]
fn data_parks_on_exhausted_window_and_resumes_on_update() {
    let endpoint = MockEndpoint::new();
    let session = SessionBuilder::client().build(endpoint.clone());

    let stream = session
        .new_stream(
            HeadersFrame::new(0, vec![(":method".into(), "POST".into())], false),
            Arc::new(()),
            Callback::noop(),
        )
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    // 70000 bytes against 65535 of session (and stream) window.
    session.data(
        &stream,
        DataFrame::new(stream.id(), Bytes::from(vec![9u8; 70_000]), true),
        Callback::non_blocking(move |r| {
            assert!(r.is_ok());
            flag.store(true, Ordering::SeqCst);
        }),
    );

    let flushed = |endpoint: &Arc<MockEndpoint>| -> usize {
        endpoint
            .frames()
            .iter()
            .filter_map(|f| match f {
                Frame::Data(d) => Some(d.data.len()),
                _ => None,
            })
            .sum()
    };

    wait_until(
        || flushed(&endpoint) == 65_535,
        Duration::from_secs(5),
        "window-limited flush",
    );
    assert!(!done.load(Ordering::SeqCst));
    assert_eq!(session.send_window(), 0);
    assert_eq!(stream.send_window(), 0);

    // Credit both windows; the parked remainder goes out.
    session.on_frame(Frame::WindowUpdate(WindowUpdateFrame::new(0, 10_000)));
    session.on_frame(Frame::WindowUpdate(WindowUpdateFrame::new(
        stream.id(),
        10_000,
    )));

    wait_until(
        || flushed(&endpoint) == 70_000,
        Duration::from_secs(5),
        "remainder flush",
    );
    wait_until(
        || done.load(Ordering::SeqCst),
        Duration::from_secs(5),
        "data callback",
    );
    assert_eq!(session.send_window(), 10_000 - 4_465);

    // END_STREAM rides on the final slice only.
    let end_flags: Vec<bool> = endpoint
        .frames()
        .iter()
        .filter_map(|f| match f {
            Frame::Data(d) => Some(d.end_stream),
            _ => None,
        })
        .collect();
    assert_eq!(end_flags.last(), Some(&true));
    assert_eq!(end_flags.iter().filter(|e| **e).count(), 1);
}

#[test]
fn session_window_overflow_from_update_is_connection_error() {
    let endpoint = MockEndpoint::new();
    let session = SessionBuilder::client().build(endpoint.clone());

    session.on_frame(Frame::WindowUpdate(WindowUpdateFrame::new(0, 0x7FFF_FFFF)));

    wait_until(
        || session.is_closed(),
        Duration::from_secs(5),
        "connection error",
    );
    let frames = wait_frames(&endpoint, 1, "goaway");
    let goaway = frames
        .iter()
        .find_map(|f| match f {
            Frame::GoAway(g) => Some(g.clone()),
            _ => None,
        })
        .expect("goaway");
    assert_eq!(goaway.error_code, ErrorCode::FlowControlError);
}

#[test]
fn stream_ids_are_monotone_under_concurrent_allocation() {
    let endpoint = MockEndpoint::new();
    let session = SessionBuilder::client().build(endpoint.clone());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let session = session.clone();
        handles.push(std::thread::spawn(move || {
            let mut ids = Vec::new();
            for _ in 0..10 {
                let stream = session
                    .new_stream(
                        HeadersFrame::new(0, vec![(":method".into(), "GET".into())], true),
                        Arc::new(()),
                        Callback::noop(),
                    )
                    .unwrap();
                ids.push(stream.id());
            }
            ids
        }));
    }

    let mut all_ids: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(all_ids.len(), 80);
    all_ids.sort_unstable();
    all_ids.dedup();
    assert_eq!(all_ids.len(), 80, "stream ids must be unique");
    assert!(all_ids.iter().all(|id| id % 2 == 1), "client ids are odd");

    // The wire order of HEADERS matches the numeric order of ids.
    let frames = wait_frames(&endpoint, 80, "all headers flushed");
    let wire_ids: Vec<u32> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Headers(h) => Some(h.stream_id),
            _ => None,
        })
        .collect();
    assert_eq!(wire_ids.len(), 80);
    assert!(
        wire_ids.windows(2).all(|w| w[0] < w[1]),
        "headers must be written in id order"
    );
}

#[test]
fn multi_frame_submission_completes_once_after_last_frame() {
    let endpoint = MockEndpoint::new();
    let session = SessionBuilder::client().build(endpoint.clone());

    let completions = Arc::new(Mutex::new(Vec::new()));
    let sink = completions.clone();
    session.frames(
        None,
        vec![
            Frame::Settings(h2mux::SettingsFrame::new(h2mux::Settings::new())),
            Frame::Ping(PingFrame::new([1; 8])),
            Frame::WindowUpdate(WindowUpdateFrame::new(0, 100)),
        ],
        Callback::non_blocking(move |r| {
            sink.lock().unwrap().push(r.is_ok());
        }),
    );

    wait_frames(&endpoint, 3, "three control frames");
    wait_until(
        || !completions.lock().unwrap().is_empty(),
        Duration::from_secs(5),
        "aggregate completion",
    );
    assert_eq!(completions.lock().unwrap().as_slice(), &[true]);
}

#[test]
fn push_promise_reserves_local_stream() {
    let endpoint = MockEndpoint::new();
    let session = SessionBuilder::server().build(endpoint.clone());

    // Peer opens a request stream.
    session.on_frame(Frame::Headers(HeadersFrame::new(
        1,
        vec![(":method".into(), "GET".into())],
        false,
    )));

    let promised = session
        .push(
            PushPromiseFrame::new(1, 0, vec![(":path".into(), "/style.css".into())]),
            Arc::new(()),
            Callback::noop(),
        )
        .unwrap();
    assert_eq!(promised.id() % 2, 0, "server-promised ids are even");

    wait_until(
        || {
            endpoint
                .frames()
                .iter()
                .any(|f| matches!(f, Frame::PushPromise(_)))
        },
        Duration::from_secs(5),
        "push promise on wire",
    );
    // Pushed streams are implicitly remotely closed once promised.
    wait_until(
        || promised.is_remotely_closed(),
        Duration::from_secs(5),
        "promised stream remote-closed",
    );
    let frame = endpoint
        .frames()
        .into_iter()
        .find_map(|f| match f {
            Frame::PushPromise(p) => Some(p),
            _ => None,
        })
        .unwrap();
    assert_eq!(frame.stream_id, 1);
    assert_eq!(frame.promised_stream_id, promised.id());
}

#[test]
fn data_on_locally_closed_stream_is_rejected() {
    let endpoint = MockEndpoint::new();
    let session = SessionBuilder::client().build(endpoint.clone());

    let stream = session
        .new_stream(
            HeadersFrame::new(0, vec![(":method".into(), "GET".into())], true),
            Arc::new(()),
            Callback::noop(),
        )
        .unwrap();

    wait_until(
        || stream.is_locally_closed(),
        Duration::from_secs(5),
        "end-stream headers flushed",
    );

    let rejected = Arc::new(AtomicBool::new(false));
    let flag = rejected.clone();
    session.data(
        &stream,
        DataFrame::new(stream.id(), Bytes::from_static(b"late"), true),
        Callback::non_blocking(move |r| {
            assert!(r.is_err());
            flag.store(true, Ordering::SeqCst);
        }),
    );
    assert!(rejected.load(Ordering::SeqCst));
}

#[test]
fn local_stream_cap_fails_stream_creation() {
    let endpoint = MockEndpoint::new();
    let session = SessionBuilder::client()
        .max_local_streams(1)
        .build(endpoint.clone());

    let first = session.new_stream(
        HeadersFrame::new(0, vec![(":method".into(), "GET".into())], false),
        Arc::new(()),
        Callback::noop(),
    );
    assert!(first.is_ok());

    let failed = Arc::new(AtomicBool::new(false));
    let flag = failed.clone();
    let second = session.new_stream(
        HeadersFrame::new(0, vec![(":method".into(), "GET".into())], false),
        Arc::new(()),
        Callback::non_blocking(move |r| {
            assert!(r.is_err());
            flag.store(true, Ordering::SeqCst);
        }),
    );
    assert!(second.is_err());
    assert!(failed.load(Ordering::SeqCst));
    assert_eq!(session.stream_count(), 1);
}

#[test]
fn stream_opening_priority_allocates_an_id() {
    let endpoint = MockEndpoint::new();
    let session = SessionBuilder::client().build(endpoint.clone());

    let id = session.priority(
        PriorityFrame::new(0, PrioritySpec::new(0, false, 15)),
        Callback::noop(),
    );
    assert_eq!(id, 1);

    // The next opened stream takes the following odd id.
    let stream = session
        .new_stream(
            HeadersFrame::new(0, vec![(":method".into(), "GET".into())], false),
            Arc::new(()),
            Callback::noop(),
        )
        .unwrap();
    assert_eq!(stream.id(), 3);

    let frames = wait_frames(&endpoint, 2, "priority then headers");
    assert!(matches!(frames[0], Frame::Priority(p) if p.stream_id == 1));
}
