//! Speech playback queue tests
//!
//! Drives an open session with chat-stream events and inspects what the fake
//! speaker played. Time is paused so synthesis delays and backoff are exact.

use std::time::Duration;

use tokio::sync::broadcast;

use voxline::engine::{ChatStreamEvent, InterruptReason, ResponseId, SessionEvent};

mod common;

use common::{FakeSynth, Harness, HarnessOptions, wait_for};

const LONG: Duration = Duration::from_secs(30);

fn start(id: &str) -> ChatStreamEvent {
    ChatStreamEvent::Start {
        response_id: id.into(),
    }
}

fn chunk(id: &str, text: &str) -> ChatStreamEvent {
    ChatStreamEvent::Chunk {
        response_id: id.into(),
        text: text.to_string(),
    }
}

fn finish(id: &str) -> ChatStreamEvent {
    ChatStreamEvent::Finish {
        response_id: id.into(),
    }
}

fn stream(h: &Harness, id: &str, fragments: &[&str]) {
    h.session.dispatch_chat_event(start(id));
    for text in fragments {
        h.session.dispatch_chat_event(chunk(id, text));
    }
    h.session.dispatch_chat_event(finish(id));
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

async fn drained(h: &Harness) -> bool {
    wait_for(
        || !h.session.is_assistant_speaking() && h.session.pending_responses() == 0,
        LONG,
    )
    .await
}

#[tokio::test(start_paused = true)]
async fn test_plays_in_arrival_order_not_synthesis_order() {
    let synth = FakeSynth::new()
        .with_delay("A", Duration::from_millis(300))
        .with_delay("B", Duration::from_millis(500))
        .with_delay("C", Duration::from_millis(10));
    let h = Harness::with(HarnessOptions {
        synth: Some(synth),
        ..HarnessOptions::default()
    });
    h.session.open().await.unwrap();

    stream(&h, "r1", &["A", "B", "C"]);

    assert!(wait_for(|| h.sink.finished().len() == 3, LONG).await);
    assert_eq!(h.sink.finished(), vec!["A", "B", "C"]);
    assert!(drained(&h).await);
}

#[tokio::test(start_paused = true)]
async fn test_speaking_flag_follows_worker() {
    let h = Harness::new();
    let mut events = h.session.subscribe();
    h.session.open().await.unwrap();

    h.session.dispatch_chat_event(start("r1"));
    h.session.dispatch_chat_event(chunk("r1", "Hello."));
    assert!(wait_for(|| h.session.is_assistant_speaking(), LONG).await);

    // Queue empty but not finished: worker keeps polling
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.session.pending_responses(), 1);

    h.session.dispatch_chat_event(finish("r1"));
    assert!(drained(&h).await);

    let speaking: Vec<bool> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::AssistantSpeaking(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(speaking, vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_fragment_frees_output() {
    let h = Harness::with(HarnessOptions {
        play_duration: Duration::from_secs(5),
        ..HarnessOptions::default()
    });
    let mut events = h.session.subscribe();
    h.session.open().await.unwrap();

    stream(&h, "r1", &["A", "B", "C"]);
    assert!(wait_for(|| h.sink.is_active(), LONG).await);

    assert!(h.session.tap_avatar());
    assert!(!h.sink.is_active(), "output released before tap returns");
    assert!(!h.session.is_assistant_speaking());
    assert_eq!(h.chat.stopped(), vec![ResponseId::from("r1")]);

    // Idempotent
    assert!(!h.session.tap_avatar());
    assert_eq!(h.chat.stopped().len(), 1);

    // Late chunks for the cancelled response are dropped
    h.session.dispatch_chat_event(chunk("r1", "D"));

    tokio::time::sleep(LONG).await;
    assert_eq!(h.sink.started(), vec!["A"]);
    assert!(h.sink.finished().is_empty());

    assert!(drain(&mut events).contains(&SessionEvent::Interrupted {
        response_id: "r1".into(),
        reason: InterruptReason::AvatarTap,
    }));

    // The next response plays normally
    stream(&h, "r2", &["E"]);
    assert!(wait_for(|| h.sink.finished() == vec!["E"], LONG).await);
}

#[tokio::test(start_paused = true)]
async fn test_identical_fragments_synthesized_once() {
    let h = Harness::new();
    h.session.open().await.unwrap();

    stream(&h, "r1", &["Okay.", "Okay."]);
    assert!(wait_for(|| h.sink.finished().len() == 2, LONG).await);
    assert!(drained(&h).await);

    stream(&h, "r2", &["Okay."]);
    assert!(wait_for(|| h.sink.finished().len() == 3, LONG).await);

    assert_eq!(h.synth().call_count("Okay."), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_backend_speaks_locally() {
    let h = Harness::with(HarnessOptions {
        synth: None,
        ..HarnessOptions::default()
    });
    h.session.open().await.unwrap();

    stream(&h, "r1", &["Hi.", "There."]);
    assert!(wait_for(|| h.local_voice.spoken().len() == 2, LONG).await);

    assert_eq!(h.local_voice.spoken(), vec!["Hi.", "There."]);
    assert!(h.sink.started().is_empty());
    assert!(drained(&h).await);
}

#[tokio::test(start_paused = true)]
async fn test_failed_synthesis_falls_back_per_fragment() {
    let h = Harness::with(HarnessOptions {
        synth: Some(FakeSynth::new().failing_on("B")),
        ..HarnessOptions::default()
    });
    h.session.open().await.unwrap();

    stream(&h, "r1", &["A", "B", "C"]);
    assert!(drained(&h).await);

    assert_eq!(h.sink.finished(), vec!["A", "C"]);
    assert_eq!(h.local_voice.spoken(), vec!["B"]);
}

#[tokio::test(start_paused = true)]
async fn test_chunk_without_start_begins_response() {
    let h = Harness::new();
    h.session.open().await.unwrap();

    h.session.dispatch_chat_event(chunk("r9", "Hello."));
    h.session.dispatch_chat_event(finish("r9"));

    assert!(wait_for(|| h.sink.finished() == vec!["Hello."], LONG).await);
    assert!(drained(&h).await);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_start_keeps_queue() {
    let h = Harness::new();
    h.session.open().await.unwrap();

    h.session.dispatch_chat_event(start("r1"));
    h.session.dispatch_chat_event(chunk("r1", "A"));
    h.session.dispatch_chat_event(start("r1"));
    h.session.dispatch_chat_event(chunk("r1", "B"));
    h.session.dispatch_chat_event(finish("r1"));

    assert!(drained(&h).await);
    assert_eq!(h.sink.finished(), vec!["A", "B"]);
}

#[tokio::test(start_paused = true)]
async fn test_drained_response_is_never_recreated() {
    let h = Harness::new();
    h.session.open().await.unwrap();

    stream(&h, "r1", &["A"]);
    assert!(wait_for(|| h.sink.finished().len() == 1, LONG).await);
    assert!(drained(&h).await);

    h.session.dispatch_chat_event(chunk("r1", "late"));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.sink.started(), vec!["A"]);
    assert_eq!(h.session.pending_responses(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_new_response_cancels_previous() {
    let h = Harness::with(HarnessOptions {
        play_duration: Duration::from_secs(5),
        ..HarnessOptions::default()
    });
    h.session.open().await.unwrap();

    stream(&h, "r1", &["A", "B"]);
    assert!(wait_for(|| h.sink.is_active(), LONG).await);

    stream(&h, "r2", &["C"]);
    assert!(wait_for(|| h.sink.finished() == vec!["C"], LONG).await);

    assert_eq!(h.sink.started(), vec!["A", "C"]);
    assert!(drained(&h).await);
}

#[tokio::test(start_paused = true)]
async fn test_events_ignored_while_closed() {
    let h = Harness::new();

    stream(&h, "r1", &["A"]);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(h.sink.started().is_empty());
    assert!(h.synth().calls().is_empty());
    assert!(!h.session.tap_avatar());
}
