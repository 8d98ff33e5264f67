// ABOUTME: Tests for the long-poll session state machine and the dispatch loop
// ABOUTME: Drives LongPollSession with scripted poll-server sources and poll transports

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vkbot::api::{ApiError, TransportError};
use vkbot::config::LongPollConfig;
use vkbot::longpoll::{
    EventDispatchLoop, LongPollError, LongPollSession, NegotiateMode, PollServer,
    PollServerSource, PollTransport, SessionState, MAX_BAD_RESPONSES,
};
use vkbot::events::LongPollEvent;
use vkbot::traits::Dispatcher;

#[derive(Default)]
struct ScriptedSource {
    servers: Mutex<VecDeque<PollServer>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    fn new(servers: Vec<PollServer>) -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(servers.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollServerSource for ScriptedSource {
    async fn poll_server(&self) -> Result<PollServer, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.servers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ApiError::Transport("poll server unavailable".to_string()))
    }
}

#[derive(Default)]
struct ScriptedPoll {
    replies: Mutex<VecDeque<Result<String, TransportError>>>,
    requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl ScriptedPoll {
    fn new(replies: Vec<Result<String, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PollTransport for ScriptedPoll {
    async fn fetch(&self, url: &str, query: &[(String, String)]) -> Result<String, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), query.to_vec()));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connection("script exhausted".to_string())))
    }
}

fn server(host: &str, key: &str, ts: i64) -> PollServer {
    PollServer {
        server: host.to_string(),
        key: key.to_string(),
        ts,
    }
}

fn param<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn ok(body: Value) -> Result<String, TransportError> {
    Ok(body.to_string())
}

fn session(source: Arc<ScriptedSource>, poll: Arc<ScriptedPoll>) -> LongPollSession {
    LongPollSession::new(source, poll, LongPollConfig::default())
}

#[tokio::test]
async fn test_first_poll_negotiates_and_returns_updates() {
    let source = ScriptedSource::new(vec![server("im.vk.com/nim1", "k1", 100)]);
    let poll = ScriptedPoll::new(vec![ok(
        json!({"ts": 101, "updates": [[4, 1, 0, 5, 100, "", "hi", {}], [8, -5, 0]]}),
    )]);
    let mut session = session(source.clone(), poll.clone());
    assert_eq!(session.state(), SessionState::Uninitialized);

    let updates = session.poll().await.unwrap();

    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0][0], json!(4));
    assert_eq!(updates[1][0], json!(8));
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.server(), "https://im.vk.com/nim1");
    assert_eq!(session.ts(), 101);
    assert_eq!(source.calls(), 1);

    let requests = poll.requests();
    assert_eq!(requests[0].0, "https://im.vk.com/nim1");
    let query = &requests[0].1;
    assert_eq!(param(query, "act"), Some("a_check"));
    assert_eq!(param(query, "key"), Some("k1"));
    assert_eq!(param(query, "ts"), Some("100"));
    assert_eq!(param(query, "wait"), Some("25"));
}

#[tokio::test]
async fn test_failed_1_moves_ts_without_renegotiating() {
    let source = ScriptedSource::new(vec![server("https://lp", "k1", 10)]);
    let poll = ScriptedPoll::new(vec![
        ok(json!({"failed": 1, "ts": 50})),
        ok(json!({"ts": 51, "updates": []})),
    ]);
    let mut session = session(source.clone(), poll.clone());

    session.poll().await.unwrap();

    assert_eq!(source.calls(), 1);
    assert_eq!(session.key(), "k1");
    assert_eq!(session.server(), "https://lp");
    assert_eq!(param(&poll.requests()[1].1, "ts"), Some("50"));
    assert_eq!(session.ts(), 51);
}

#[tokio::test]
async fn test_failed_2_replaces_only_the_key() {
    let source = ScriptedSource::new(vec![
        server("https://lp", "k1", 10),
        server("https://other", "k2", 999),
    ]);
    let poll = ScriptedPoll::new(vec![
        ok(json!({"failed": 2})),
        ok(json!({"ts": 11, "updates": []})),
    ]);
    let mut session = session(source.clone(), poll.clone());

    session.poll().await.unwrap();

    assert_eq!(source.calls(), 2);
    let retry = &poll.requests()[1];
    assert_eq!(retry.0, "https://lp");
    assert_eq!(param(&retry.1, "key"), Some("k2"));
    assert_eq!(param(&retry.1, "ts"), Some("10"));
}

#[tokio::test]
async fn test_failed_3_replaces_everything() {
    let source = ScriptedSource::new(vec![
        server("https://lp", "k1", 10),
        server("https://other", "k2", 70),
    ]);
    let poll = ScriptedPoll::new(vec![
        ok(json!({"failed": 3})),
        ok(json!({"ts": 71, "updates": []})),
    ]);
    let mut session = session(source.clone(), poll.clone());

    session.poll().await.unwrap();

    let retry = &poll.requests()[1];
    assert_eq!(retry.0, "https://other");
    assert_eq!(param(&retry.1, "key"), Some("k2"));
    assert_eq!(param(&retry.1, "ts"), Some("70"));
    assert_eq!(session.ts(), 71);
}

#[tokio::test]
async fn test_transport_failure_renegotiates() {
    let source = ScriptedSource::new(vec![
        server("https://lp", "k1", 10),
        server("https://lp2", "k2", 12),
    ]);
    let poll = ScriptedPoll::new(vec![
        Err(TransportError::Timeout),
        ok(json!({"ts": 13, "updates": [[61, 5, 1]]})),
    ]);
    let mut session = session(source.clone(), poll.clone());

    let updates = session.poll().await.unwrap();

    assert_eq!(updates.len(), 1);
    assert_eq!(source.calls(), 2);
    assert_eq!(session.server(), "https://lp2");
}

#[tokio::test(start_paused = true)]
async fn test_malformed_body_is_skipped() {
    let source = ScriptedSource::new(vec![server("https://lp", "k1", 10)]);
    let poll = ScriptedPoll::new(vec![
        Ok("<html>bad gateway</html>".to_string()),
        ok(json!({"ts": 11, "updates": [[80, 0, 0]]})),
    ]);
    let mut session = session(source.clone(), poll.clone());

    let updates = session.poll().await.unwrap();

    assert_eq!(updates.len(), 1);
    assert_eq!(source.calls(), 1);
    assert_eq!(poll.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_bad_bodies_back_off_then_renegotiate() {
    let source = ScriptedSource::new(vec![
        server("https://lp", "k1", 10),
        server("https://lp2", "k2", 20),
    ]);
    let poll = ScriptedPoll::new(vec![
        Ok("not json".to_string()),
        ok(json!({"updates": []})),
        Ok("not json".to_string()),
        ok(json!({"ts": 21, "updates": []})),
    ]);
    let mut session = session(source.clone(), poll.clone());

    let started = tokio::time::Instant::now();
    session.poll().await.unwrap();

    let requests = poll.requests();
    assert_eq!(requests.len(), MAX_BAD_RESPONSES as usize + 1);
    assert_eq!(source.calls(), 2);
    assert_eq!(requests[3].0, "https://lp2");
    // One pause after each bad body that did not trigger renegotiation
    assert!(started.elapsed() >= Duration::from_secs(u64::from(MAX_BAD_RESPONSES - 1)));
}

#[tokio::test(start_paused = true)]
async fn test_bad_body_streak_resets_on_good_response() {
    let source = ScriptedSource::new(vec![server("https://lp", "k1", 10)]);
    let poll = ScriptedPoll::new(vec![
        Ok("not json".to_string()),
        Ok("not json".to_string()),
        ok(json!({"ts": 11, "updates": []})),
        Ok("not json".to_string()),
        Ok("not json".to_string()),
        ok(json!({"ts": 12, "updates": []})),
    ]);
    let mut session = session(source.clone(), poll);

    session.poll().await.unwrap();
    session.poll().await.unwrap();

    assert_eq!(source.calls(), 1);
    assert_eq!(session.ts(), 12);
}

#[tokio::test]
async fn test_failed_1_without_ts_resyncs_ts_only() {
    let source = ScriptedSource::new(vec![
        server("https://lp", "k1", 10),
        server("https://other", "k2", 44),
    ]);
    let poll = ScriptedPoll::new(vec![
        ok(json!({"failed": 1})),
        ok(json!({"ts": 45, "updates": []})),
    ]);
    let mut session = session(source.clone(), poll.clone());

    session.poll().await.unwrap();

    assert_eq!(source.calls(), 2);
    let retry = &poll.requests()[1];
    assert_eq!(retry.0, "https://lp");
    assert_eq!(param(&retry.1, "key"), Some("k1"));
    assert_eq!(param(&retry.1, "ts"), Some("44"));
}

#[tokio::test]
async fn test_failed_4_renegotiates_everything() {
    let source = ScriptedSource::new(vec![
        server("https://lp", "k1", 10),
        server("https://other", "k2", 30),
    ]);
    let poll = ScriptedPoll::new(vec![
        ok(json!({"failed": 4, "min_version": 0, "max_version": 3})),
        ok(json!({"ts": 31, "updates": []})),
    ]);
    let mut session = session(source.clone(), poll.clone());

    session.poll().await.unwrap();

    let retry = &poll.requests()[1];
    assert_eq!(retry.0, "https://other");
    assert_eq!(param(&retry.1, "key"), Some("k2"));
    assert_eq!(param(&retry.1, "ts"), Some("30"));
}

#[tokio::test]
async fn test_ts_never_moves_backwards_on_success() {
    let source = ScriptedSource::new(vec![server("https://lp", "k1", 40)]);
    let poll = ScriptedPoll::new(vec![ok(json!({"ts": 30, "updates": []}))]);
    let mut session = session(source, poll);

    session.poll().await.unwrap();

    assert_eq!(session.ts(), 40);
}

#[tokio::test]
async fn test_partial_negotiate_without_server_becomes_full() {
    let source = ScriptedSource::new(vec![server("lp.vk.com", "k1", 5)]);
    let poll = ScriptedPoll::new(Vec::new());
    let mut session = session(source, poll);

    session.negotiate(NegotiateMode::Key).await.unwrap();

    assert_eq!(session.server(), "https://lp.vk.com");
    assert_eq!(session.key(), "k1");
    assert_eq!(session.ts(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_after_two_bursts() {
    let source = ScriptedSource::new(Vec::new());
    let poll = ScriptedPoll::new(Vec::new());
    let mut session = session(source.clone(), poll.clone());

    let started = tokio::time::Instant::now();
    let result = session.poll().await;

    assert_eq!(result, Err(LongPollError::Unreachable { attempts: 20 }));
    assert_eq!(source.calls(), 20);
    assert!(poll.requests().is_empty());
    // 9 gaps per burst plus the pause between bursts
    assert!(started.elapsed() >= Duration::from_secs(48));
}

#[derive(Default)]
struct RecordingDispatcher {
    codes: Mutex<Vec<i64>>,
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, event: LongPollEvent) -> bool {
        self.codes.lock().unwrap().push(event.code());
        matches!(event, LongPollEvent::NewMessage(_))
    }
}

#[tokio::test]
async fn test_dispatch_loop_spawns_one_task_per_event() {
    let source = ScriptedSource::new(vec![server("https://lp", "k1", 1)]);
    let poll = ScriptedPoll::new(vec![ok(json!({
        "ts": 2,
        "updates": [
            [4, 10, 1, 7, 1000, "", "hello", {}],
            "not an update",
            [80, 3, 0]
        ]
    }))]);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let mut dispatch_loop = EventDispatchLoop::new(session(source, poll), dispatcher.clone());

    let spawned = dispatch_loop.run_once().await.unwrap();
    assert_eq!(spawned, 2);

    for _ in 0..50 {
        if dispatcher.codes.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let mut codes = dispatcher.codes.lock().unwrap().clone();
    codes.sort();
    assert_eq!(codes, vec![4, 80]);
    assert_eq!(dispatch_loop.session().ts(), 2);
}

/// Handlers block until the test hands out permits
struct GatedDispatcher {
    gate: tokio::sync::Semaphore,
    started: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl Dispatcher for GatedDispatcher {
    async fn dispatch(&self, _event: LongPollEvent) -> bool {
        self.started.fetch_add(1, Ordering::SeqCst);
        let Ok(_permit) = self.gate.acquire().await else {
            return false;
        };
        self.finished.fetch_add(1, Ordering::SeqCst);
        true
    }
}

async fn wait_for(counter: &AtomicUsize, expected: usize) {
    for _ in 0..100 {
        if counter.load(Ordering::SeqCst) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_slow_handler_does_not_block_next_poll() {
    let source = ScriptedSource::new(vec![server("https://lp", "k1", 1)]);
    let poll = ScriptedPoll::new(vec![
        ok(json!({"ts": 2, "updates": [[4, 10, 1, 7, 1000, "", "first", {}]]})),
        ok(json!({"ts": 3, "updates": [[4, 11, 1, 7, 1001, "", "second", {}]]})),
    ]);
    let dispatcher = Arc::new(GatedDispatcher {
        gate: tokio::sync::Semaphore::new(0),
        started: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
    });
    let mut dispatch_loop =
        EventDispatchLoop::new(session(source, poll.clone()), dispatcher.clone());

    assert_eq!(dispatch_loop.run_once().await.unwrap(), 1);
    wait_for(&dispatcher.started, 1).await;

    // First handler is still blocked while the second batch is fetched
    assert_eq!(dispatch_loop.run_once().await.unwrap(), 1);
    assert_eq!(poll.requests().len(), 2);
    wait_for(&dispatcher.started, 2).await;
    assert_eq!(dispatcher.started.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.finished.load(Ordering::SeqCst), 0);

    dispatcher.gate.add_permits(2);
    wait_for(&dispatcher.finished, 2).await;
    assert_eq!(dispatcher.finished.load(Ordering::SeqCst), 2);
}
