use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rchat_core::testing::RecordingContext;
use rchat_core::{
    ArqConfig, DownloadResponse, Notice, Operation, PollResponse, SegmentKind, SendResponse,
    Session, SessionError, TimerToken, TransportError, UploadChunkResponse, WireMessage,
};

fn connect(ctx: &mut RecordingContext, config: ArqConfig) -> Session {
    let mut session = Session::connect(ctx, "alice", config).unwrap();
    session.select_peer("bob");
    ctx.take_notices();
    session
}

/// Fire every timer due up to `until`, in deadline order.
fn run_timers(session: &mut Session, ctx: &mut RecordingContext, until: u64) {
    while let Some(token) = ctx.next_timer(until) {
        session.on_timer(ctx, token);
    }
    ctx.timers.advance_to(until);
}

fn text_message(seq: u64, body: &str) -> WireMessage {
    WireMessage {
        sender: "bob".into(),
        seq,
        message: body.into(),
        kind: SegmentKind::Text,
        timestamp: 0,
        file_name: None,
        chunk_index: None,
        total_chunks: None,
    }
}

fn chunk_message(seq: u64, index: u32, total: u32, data: &[u8]) -> WireMessage {
    WireMessage {
        sender: "bob".into(),
        seq,
        message: STANDARD.encode(data),
        kind: SegmentKind::FileChunk,
        timestamp: 0,
        file_name: Some("a.txt".into()),
        chunk_index: Some(index),
        total_chunks: Some(total),
    }
}

fn poll_with(messages: Vec<WireMessage>, ack: Option<i64>) -> Result<PollResponse, TransportError> {
    Ok(PollResponse { messages, ack })
}

#[test]
fn connect_arms_poll_and_fetches_users() {
    let mut ctx = RecordingContext::new();
    let session = Session::connect(&mut ctx, " alice ", ArqConfig::default()).unwrap();

    assert_eq!(session.user(), "alice");
    assert_eq!(ctx.user_lists, 1);
    assert_eq!(ctx.timers.next_deadline(), Some(2000));
    assert_eq!(
        ctx.notices,
        vec![Notice::Connected {
            user: "alice".into()
        }]
    );

    let mut ctx = RecordingContext::new();
    assert!(matches!(
        Session::connect(&mut ctx, "  ", ArqConfig::default()),
        Err(SessionError::InvalidUser)
    ));
}

#[test]
fn text_requires_peer_and_content() {
    let mut ctx = RecordingContext::new();
    let mut session = Session::connect(&mut ctx, "alice", ArqConfig::default()).unwrap();
    assert_eq!(
        session.send_text(&mut ctx, "hi").unwrap_err(),
        SessionError::NoPeer
    );
    session.select_peer("bob");
    assert_eq!(
        session.send_text(&mut ctx, "   ").unwrap_err(),
        SessionError::EmptyMessage
    );
    assert_eq!(session.send_text(&mut ctx, " hi ").unwrap(), 0);
    assert_eq!(ctx.sent[0].message, "hi");
    assert_eq!(ctx.sent[0].sender, "alice");
}

#[test]
fn window_of_five_refuses_sixth_message() {
    let mut ctx = RecordingContext::new();
    let mut session = connect(&mut ctx, ArqConfig::default());
    for expected in 0..5 {
        assert_eq!(session.send_text(&mut ctx, "m").unwrap(), expected);
    }
    assert!(matches!(
        session.send_text(&mut ctx, "m"),
        Err(SessionError::WindowFull {
            in_flight: 5,
            capacity: 5
        })
    ));
    assert_eq!(session.status().next, 5);
}

#[test]
fn inline_ack_releases_window() {
    let mut ctx = RecordingContext::new();
    let mut session = connect(&mut ctx, ArqConfig::default());
    for _ in 0..3 {
        session.send_text(&mut ctx, "m").unwrap();
    }
    session.on_send_response(&mut ctx, 2, Ok(SendResponse { ack: Some(2) }));

    let status = session.status();
    assert_eq!(status.base, 3);
    assert_eq!(status.buffered, 0);
    assert_eq!(ctx.timers.armed_count(), 1); // only the poll timer
}

#[test]
fn poll_cycle_reports_high_water_and_applies_ack() {
    let mut ctx = RecordingContext::new();
    let mut session = connect(&mut ctx, ArqConfig::default());
    session.send_text(&mut ctx, "hello").unwrap();

    run_timers(&mut session, &mut ctx, 2000);
    assert_eq!(ctx.polls.len(), 1);
    assert_eq!(ctx.polls[0].last_ack, -1);
    assert_eq!(ctx.polls[0].user, "alice");

    session.on_poll_response(
        &mut ctx,
        poll_with(vec![text_message(0, "hey"), text_message(1, "you")], Some(0)),
    );
    assert_eq!(session.receive_log().high_water(), 1);
    assert_eq!(session.status().base, 1);
    let received: Vec<_> = ctx
        .take_notices()
        .into_iter()
        .filter(|n| matches!(n, Notice::MessageReceived(_)))
        .collect();
    assert_eq!(received.len(), 2);

    run_timers(&mut session, &mut ctx, 4000);
    assert_eq!(ctx.polls.len(), 2);
    assert_eq!(ctx.polls[1].last_ack, 1);
}

#[test]
fn polling_continues_while_window_is_full() {
    let mut ctx = RecordingContext::new();
    let config = ArqConfig {
        window_size: 1,
        retransmit_timeout_ms: 60_000,
        ..Default::default()
    };
    let mut session = connect(&mut ctx, config);
    session.send_text(&mut ctx, "m").unwrap();
    run_timers(&mut session, &mut ctx, 10_000);
    assert_eq!(ctx.polls.len(), 5);
}

#[test]
fn unacknowledged_segment_fails_after_three_retries() {
    let mut ctx = RecordingContext::new();
    let config = ArqConfig {
        window_size: 10,
        poll_interval_ms: 1_000_000,
        ..Default::default()
    };
    let mut session = connect(&mut ctx, config);
    for _ in 0..7 {
        session.send_text(&mut ctx, "old").unwrap();
    }
    session.on_send_response(&mut ctx, 6, Ok(SendResponse { ack: Some(6) }));
    let seq = session.send_text(&mut ctx, "lost").unwrap();
    assert_eq!(seq, 7);

    for retry in 1..=3u32 {
        run_timers(&mut session, &mut ctx, 3000 * retry as u64);
        assert_eq!(
            session.window().segment(7).unwrap().retry_count,
            retry,
            "after timeout {retry}"
        );
    }
    run_timers(&mut session, &mut ctx, 12_000);
    assert!(session.window().segment(7).is_none());

    let failures: Vec<_> = ctx
        .take_notices()
        .into_iter()
        .filter(|n| matches!(n, Notice::PermanentSendFailure { .. }))
        .collect();
    assert_eq!(
        failures,
        vec![Notice::PermanentSendFailure { seq: 7, retries: 3 }]
    );
    let copies = ctx.sent.iter().filter(|r| r.seq == 7).count();
    assert_eq!(copies, 4);
    assert!(ctx.sent.iter().filter(|r| r.seq == 7).all(|r| r.message == "lost"));

    // Nothing else fires for the failed seq.
    run_timers(&mut session, &mut ctx, 100_000);
    assert!(ctx.take_notices().is_empty());
    assert_eq!(session.status().base, 7);
}

#[test]
fn transport_error_does_not_retransmit_early() {
    let mut ctx = RecordingContext::new();
    let mut session = connect(&mut ctx, ArqConfig::default());
    session.send_text(&mut ctx, "m").unwrap();
    session.on_send_response(
        &mut ctx,
        0,
        Err(TransportError::Unreachable("connection refused".into())),
    );

    assert_eq!(ctx.sent.len(), 1);
    assert!(session.window().has_timer(0));
    assert!(matches!(
        ctx.take_notices().as_slice(),
        [Notice::TransportError {
            operation: Operation::Send,
            seq: Some(0),
            ..
        }]
    ));
}

#[test]
fn file_upload_waits_for_window_slots() {
    let mut ctx = RecordingContext::new();
    let config = ArqConfig {
        window_size: 2,
        chunk_size: 4,
        ..Default::default()
    };
    let mut session = connect(&mut ctx, config);
    let count = session.send_file(&mut ctx, "f.bin", b"0123456789abcdefghij").unwrap();
    assert_eq!(count, 5);
    assert_eq!(ctx.uploads.len(), 2);
    assert_eq!(session.status().queued_chunks, 3);

    session.on_upload_response(&mut ctx, 0, Ok(UploadChunkResponse { ack: Some(0), status: None }));
    assert_eq!(ctx.uploads.len(), 3);
    session.on_upload_response(&mut ctx, 2, Ok(UploadChunkResponse { ack: Some(2), status: None }));
    assert_eq!(ctx.uploads.len(), 5);

    let indices: Vec<u32> = ctx.uploads.iter().map(|u| u.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    let seqs: Vec<u64> = ctx.uploads.iter().map(|u| u.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    assert!(ctx.uploads.iter().all(|u| u.total_chunks == 5 && u.receiver == "bob"));

    assert_eq!(
        session.send_file(&mut ctx, "empty", b"").unwrap_err(),
        SessionError::EmptyFile("empty".into())
    );
}

#[test]
fn queued_chunks_survive_redundant_acks() {
    let mut ctx = RecordingContext::new();
    let config = ArqConfig {
        window_size: 2,
        chunk_size: 4,
        ..Default::default()
    };
    let mut session = connect(&mut ctx, config);
    session.send_file(&mut ctx, "f.bin", b"0123456789abcdefghij").unwrap();
    let accounted = |session: &Session, ctx: &RecordingContext| {
        ctx.uploads.len() + session.status().queued_chunks
    };
    assert_eq!(accounted(&session, &ctx), 5);

    // Nothing released, nothing flushed, nothing lost.
    session.on_upload_response(&mut ctx, 1, Ok(UploadChunkResponse { ack: Some(-1), status: None }));
    assert_eq!((ctx.uploads.len(), session.status().queued_chunks), (2, 3));

    session.on_upload_response(&mut ctx, 0, Ok(UploadChunkResponse { ack: Some(0), status: None }));
    session.on_poll_response(&mut ctx, poll_with(vec![], Some(0)));
    assert_eq!((ctx.uploads.len(), session.status().queued_chunks), (3, 2));
    assert_eq!(accounted(&session, &ctx), 5);

    session.on_poll_response(&mut ctx, poll_with(vec![], Some(2)));
    assert_eq!((ctx.uploads.len(), session.status().queued_chunks), (5, 0));
    let indices: Vec<u32> = ctx.uploads.iter().map(|u| u.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

#[test]
fn out_of_order_chunks_announce_file_once() {
    let mut ctx = RecordingContext::new();
    let mut session = connect(&mut ctx, ArqConfig::default());

    session.on_poll_response(&mut ctx, poll_with(vec![chunk_message(0, 2, 3, b"!")], None));
    session.on_poll_response(
        &mut ctx,
        poll_with(vec![chunk_message(1, 0, 3, b"hel")], None),
    );
    assert!(matches!(
        session.assemble("a.txt", "bob"),
        Err(SessionError::Reassembly(_))
    ));
    session.on_poll_response(&mut ctx, poll_with(vec![chunk_message(2, 1, 3, b"lo")], None));
    // A duplicate after completion must not re-announce.
    session.on_poll_response(&mut ctx, poll_with(vec![chunk_message(2, 1, 3, b"lo")], None));

    let ready: Vec<_> = ctx
        .take_notices()
        .into_iter()
        .filter(|n| matches!(n, Notice::FileReady { .. }))
        .collect();
    assert_eq!(
        ready,
        vec![Notice::FileReady {
            file_name: "a.txt".into(),
            sender: "bob".into(),
            total_chunks: 3
        }]
    );
    assert_eq!(&session.assemble("a.txt", "bob").unwrap()[..], b"hello!");
}

#[test]
fn download_decodes_chunks() {
    let mut ctx = RecordingContext::new();
    let mut session = connect(&mut ctx, ArqConfig::default());
    session.download(&mut ctx, "a.txt").unwrap();
    assert_eq!(ctx.downloads[0].receiver, "alice");

    session.on_download_response(
        &mut ctx,
        "a.txt",
        Ok(DownloadResponse {
            file_name: Some("a.txt".into()),
            chunks: vec![STANDARD.encode("ab"), STANDARD.encode("cd")],
        }),
    );
    assert_eq!(
        ctx.take_notices(),
        vec![Notice::FileDownloaded {
            file_name: "a.txt".into(),
            bytes: b"abcd".to_vec()
        }]
    );

    session.on_download_response(&mut ctx, "b.txt", Ok(DownloadResponse::default()));
    assert!(matches!(
        ctx.take_notices().as_slice(),
        [Notice::TransportError {
            operation: Operation::DownloadFile,
            ..
        }]
    ));
}

#[test]
fn user_directory_excludes_self() {
    let mut ctx = RecordingContext::new();
    let mut session = connect(&mut ctx, ArqConfig::default());
    session.on_users_response(
        &mut ctx,
        Ok(vec!["alice".into(), "bob".into(), "carol".into()]),
    );
    assert_eq!(session.users(), ["bob".to_string(), "carol".to_string()]);
}

#[test]
fn disconnect_cancels_everything_and_ignores_late_events() {
    let mut ctx = RecordingContext::new();
    let mut session = connect(&mut ctx, ArqConfig::default());
    for _ in 0..3 {
        session.send_text(&mut ctx, "m").unwrap();
    }
    let token = session.cancel_token();
    assert_eq!(ctx.timers.armed_count(), 4);

    session.disconnect(&mut ctx);
    assert!(token.is_cancelled());
    assert_eq!(ctx.timers.armed_count(), 0);
    assert_eq!(ctx.take_notices(), vec![Notice::Disconnected]);

    let sent = ctx.sent.len();
    run_timers(&mut session, &mut ctx, 1_000_000);
    session.on_send_response(&mut ctx, 0, Ok(SendResponse { ack: Some(2) }));
    session.on_poll_response(&mut ctx, poll_with(vec![text_message(0, "late")], Some(2)));
    session.on_timer(&mut ctx, TimerToken::Retransmit(1));

    assert_eq!(ctx.sent.len(), sent);
    assert!(ctx.polls.is_empty());
    assert!(ctx.take_notices().is_empty());
    assert!(session.receive_log().is_empty());
    assert_eq!(
        session.send_text(&mut ctx, "again").unwrap_err(),
        SessionError::Closed
    );
}
