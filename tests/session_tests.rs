//! Session and streaming-loop behaviour against the software backend.

use std::sync::Arc;
use std::time::Duration;

use pathstream::render::{CpuBackend, EnvironmentImage, InvokerState, RenderInvoker, RenderParameters};
use pathstream::stream::{LoopOptions, LoopOutcome, ServerMessage, Session, SessionState};
use tokio::sync::{mpsc, Mutex};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 8;

fn invoker(seed: u64) -> Arc<Mutex<RenderInvoker>> {
    Arc::new(Mutex::new(RenderInvoker::new(
        Box::new(CpuBackend::new()),
        EnvironmentImage::default_sky(),
        WIDTH,
        HEIGHT,
        seed,
    )))
}

fn options(samples_per_tick: u32) -> LoopOptions {
    LoopOptions {
        samples_per_tick,
        tick_interval: Duration::from_millis(1),
        jpeg_quality: 80,
    }
}

fn session(
    invoker: Arc<Mutex<RenderInvoker>>,
    samples_per_tick: u32,
) -> (Session<mpsc::Sender<Vec<u8>>>, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel(64);
    let session = Session::new(invoker, tx, options(samples_per_tick), WIDTH, HEIGHT);
    (session, rx)
}

fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        out.push(ServerMessage::decode(&bytes).unwrap());
    }
    out
}

fn sample_counts(messages: &[ServerMessage]) -> Vec<u32> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::SampleCount(n) => Some(*n),
            ServerMessage::Frame(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn test_finite_budget_schedule() {
    let (mut session, mut rx) = session(invoker(1), 4);
    session.handle_message(r#"{"maxSpp": 10}"#).unwrap();

    let outcome = session.join_active().await.unwrap();
    assert!(matches!(outcome, LoopOutcome::Completed { samples: 10, ticks: 3 }));

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 6);
    for pair in messages.chunks(2) {
        match &pair[0] {
            ServerMessage::Frame(jpeg) => assert_eq!(&jpeg[..2], &[0xFF, 0xD8]),
            other => panic!("expected frame first, got {other:?}"),
        }
        assert!(matches!(pair[1], ServerMessage::SampleCount(_)));
    }
    assert_eq!(sample_counts(&messages), [4, 8, 10]);
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_superseded_loop_sends_nothing() {
    let (mut session, mut rx) = session(invoker(2), 4);
    let g1 = session.handle_message(r#"{"maxSpp": 8, "phi": 0.5}"#).unwrap();
    let g2 = session.handle_message(r#"{"theta": 1.0}"#).unwrap();
    assert_eq!(g2, g1 + 1);

    let outcome = session.join_active().await.unwrap();
    assert!(matches!(outcome, LoopOutcome::Completed { samples: 8, ticks: 2 }));

    let retired = session.drain_retired().await;
    assert_eq!(retired.len(), 1);
    assert!(retired[0].is_cancelled());

    // only the second generation's two ticks reach the client
    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 4);
    assert_eq!(sample_counts(&messages), [4, 8]);
}

#[tokio::test]
async fn test_partial_merge() {
    let (mut session, _rx) = session(invoker(0), 4);
    session.handle_message(r#"{"phi": 2}"#).unwrap();
    session.handle_message(r#"{"theta": 1}"#).unwrap();

    let params = session.parameters();
    assert_eq!(params.phi, 2.0);
    assert_eq!(params.theta, 1.0);
    assert_eq!(params.max_spp, 0);
    session.close().await;
}

#[tokio::test]
async fn test_malformed_message_is_ignored() {
    let (mut session, mut rx) = session(invoker(0), 4);
    assert!(session.handle_message("not json").is_err());
    assert!(session.handle_message("[1, 2]").is_err());
    assert!(session.handle_message(r#"{"width": 0}"#).is_err());

    assert_eq!(session.generation(), 0);
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.live_loops(), 0);
    assert_eq!(session.parameters(), RenderParameters::new(WIDTH, HEIGHT));
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_unbounded_until_close() {
    let invoker = invoker(3);
    let (mut session, mut rx) = session(Arc::clone(&invoker), 2);
    session.handle_message(r#"{"maxSpp": ""}"#).unwrap();

    let mut counts = Vec::new();
    while counts.len() < 3 {
        let bytes = rx.recv().await.unwrap();
        if let ServerMessage::SampleCount(n) = ServerMessage::decode(&bytes).unwrap() {
            counts.push(n);
        }
    }
    assert_eq!(counts, [2, 4, 6]);
    assert_eq!(session.state(), SessionState::Rendering);

    session.close().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.live_loops(), 0);
    assert_eq!(session.parameters(), RenderParameters::new(WIDTH, HEIGHT));
    assert_eq!(invoker.lock().await.state(), InvokerState::Released);

    // nothing new arrives once the session is closed
    drain(&mut rx);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_setup_again_after_close() {
    let invoker = invoker(4);
    let (mut session, mut rx) = session(Arc::clone(&invoker), 4);
    session.handle_message(r#"{"maxSpp": 4}"#).unwrap();
    assert!(session.join_active().await.unwrap().is_completed());
    session.close().await;
    drain(&mut rx);

    session.handle_message(r#"{"maxSpp": 4, "width": 8, "height": 4}"#).unwrap();
    assert!(session.join_active().await.unwrap().is_completed());
    assert_eq!(invoker.lock().await.state(), InvokerState::Ready);
    assert_eq!(invoker.lock().await.dimensions(), (8, 4));
    assert_eq!(sample_counts(&drain(&mut rx)), [4]);
}

#[tokio::test]
async fn test_same_seed_same_frames() {
    async fn frames(seed: u64) -> Vec<Vec<u8>> {
        let (mut session, mut rx) = session(invoker(seed), 2);
        session.handle_message(r#"{"maxSpp": 6, "phi": 0.3}"#).unwrap();
        assert!(session.join_active().await.unwrap().is_completed());
        drain(&mut rx)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Frame(jpeg) => Some(jpeg),
                ServerMessage::SampleCount(_) => None,
            })
            .collect()
    }

    let a = frames(11).await;
    assert_eq!(a.len(), 3);
    assert_eq!(a, frames(11).await);
}

async fn next_count(rx: &mut mpsc::Receiver<Vec<u8>>) -> u32 {
    loop {
        let bytes = rx.recv().await.unwrap();
        if let ServerMessage::SampleCount(n) = ServerMessage::decode(&bytes).unwrap() {
            return n;
        }
    }
}

#[tokio::test]
async fn test_oversized_frame_is_rejected() {
    let invoker = invoker(0);
    let (mut session, mut rx) = session(Arc::clone(&invoker), 4);
    assert!(session
        .handle_message(r#"{"maxSpp": 1, "width": 60000, "height": 60000}"#)
        .is_err());
    assert!(session.handle_message(r#"{"width": 8193}"#).is_err());

    assert_eq!(session.generation(), 0);
    assert_eq!(session.live_loops(), 0);
    assert_eq!(session.parameters(), RenderParameters::new(WIDTH, HEIGHT));
    assert!(drain(&mut rx).is_empty());

    // the session still renders normally afterwards
    session.handle_message(r#"{"maxSpp": 4}"#).unwrap();
    assert!(session.join_active().await.unwrap().is_completed());
    assert_eq!(invoker.lock().await.dimensions(), (WIDTH, HEIGHT));
    assert_eq!(sample_counts(&drain(&mut rx)), [4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_while_streaming_restarts_counts() {
    let (mut session, mut rx) = session(invoker(6), 1);
    let g1 = session.handle_message(r#"{"maxSpp": 0}"#).unwrap();

    let mut messages = Vec::new();
    loop {
        let message = ServerMessage::decode(&rx.recv().await.unwrap()).unwrap();
        let is_count = matches!(message, ServerMessage::SampleCount(_));
        messages.push(message);
        if is_count {
            break;
        }
    }

    let g2 = session.handle_message(r#"{"maxSpp": 2}"#).unwrap();
    assert_eq!(g2, g1 + 1);
    let outcome = session.join_active().await.unwrap();
    assert!(matches!(outcome, LoopOutcome::Completed { samples: 2, ticks: 2 }));
    let retired = session.drain_retired().await;
    assert!(retired.iter().all(|o| o.is_cancelled()));

    drop(session);
    while let Some(bytes) = rx.recv().await {
        messages.push(ServerMessage::decode(&bytes).unwrap());
    }

    // frame and count stay paired across the handoff
    for pair in messages.chunks(2) {
        assert!(matches!(pair[0], ServerMessage::Frame(_)), "unpaired message: {pair:?}");
        assert!(matches!(pair[1], ServerMessage::SampleCount(_)), "unpaired message: {pair:?}");
    }

    let counts = sample_counts(&messages);
    assert!(counts.len() >= 3, "counts: {counts:?}");
    let (first, last) = counts.split_at(counts.len() - 2);
    assert_eq!(last, [1, 2]);
    let expected: Vec<u32> = (1..=first.len() as u32).collect();
    assert_eq!(first, expected.as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_message_keeps_loop_running() {
    let (mut session, mut rx) = session(invoker(7), 1);
    let g1 = session.handle_message(r#"{"maxSpp": ""}"#).unwrap();
    let before = next_count(&mut rx).await;

    assert!(session.handle_message("{not json").is_err());
    assert!(session.handle_message(r#"{"keyValue": "bright"}"#).is_err());
    assert_eq!(session.generation(), g1);
    assert_eq!(session.live_loops(), 1);
    assert_eq!(session.state(), SessionState::Rendering);

    // the same generation keeps accumulating
    let after = next_count(&mut rx).await;
    assert_eq!(after, before + 1);
    let later = next_count(&mut rx).await;
    assert_eq!(later, after + 1);

    session.close().await;
    assert_eq!(session.live_loops(), 0);
}
