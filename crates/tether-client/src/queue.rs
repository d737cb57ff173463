//! Ordered outgoing queue with delayed release and disconnect recovery.
//!
//! Entries are either *ready* (eligible, kept in the order they became
//! eligible) or *held* (waiting for a delay or a tool-call release, kept in
//! enqueue order). One drain pass at a time moves ready entries to the
//! transport; a disconnect leaves the failed entry at the head and disables
//! the queue until [`OutgoingMessageQueue::enable`] is called.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tether_core::envelope::WebSocketMessage;
use tether_core::ids::ToolCallId;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportError};

const EVENT_CAPACITY: usize = 256;

/// Messages the queue can carry.
pub trait QueueMessage: Send + Sync + 'static {
    /// Control messages never reach the transport.
    fn is_control(&self) -> bool;
}

impl QueueMessage for WebSocketMessage {
    fn is_control(&self) -> bool {
        self.message_type.is_control()
    }
}

impl QueueMessage for Value {
    fn is_control(&self) -> bool {
        self.get("type").and_then(Value::as_str) == Some("system")
    }
}

#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    /// Hold the message this long before it becomes eligible.
    pub delay: Option<Duration>,
    /// Releasing any of these makes the message eligible at once.
    pub tool_call_ids: Vec<ToolCallId>,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            tool_call_ids: Vec::new(),
        }
    }

    pub fn with_tool_call(mut self, id: ToolCallId) -> Self {
        self.tool_call_ids.push(id);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    Sent { seq: u64 },
    SendError { seq: u64, error: TransportError },
    Disabled,
    Enabled,
}

struct Entry<M> {
    seq: u64,
    message: M,
    tool_call_ids: HashSet<ToolCallId>,
    timer: Option<CancellationToken>,
}

struct State<M> {
    ready: VecDeque<Entry<M>>,
    held: Vec<Entry<M>>,
    next_seq: u64,
    disabled: bool,
    destroyed: bool,
}

impl<M> State<M> {
    fn len(&self) -> usize {
        self.ready.len() + self.held.len()
    }

    /// Move matching held entries to the ready tail, in enqueue order.
    fn promote(&mut self, pred: impl Fn(&Entry<M>) -> bool) -> usize {
        let mut moved = 0;
        let mut i = 0;
        while i < self.held.len() {
            if pred(&self.held[i]) {
                let entry = self.held.remove(i);
                if let Some(timer) = &entry.timer {
                    timer.cancel();
                }
                self.ready.push_back(entry);
                moved += 1;
            } else {
                i += 1;
            }
        }
        moved
    }
}

struct Inner<M> {
    state: Mutex<State<M>>,
    transport: Arc<dyn Transport<M>>,
    events: broadcast::Sender<QueueEvent>,
    shutdown: CancellationToken,
}

impl<M: QueueMessage> Inner<M> {
    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    /// Send ready entries head-first until the queue empties or disables.
    fn drain(&self, state: &mut State<M>) {
        while !state.disabled && !state.destroyed {
            let Some(entry) = state.ready.front() else {
                break;
            };
            let seq = entry.seq;
            match self.transport.send(&entry.message) {
                Ok(()) => {
                    let _ = state.ready.pop_front();
                    debug!(seq, "message sent");
                    self.emit(QueueEvent::Sent { seq });
                }
                Err(error) if error.is_disconnect() => {
                    state.disabled = true;
                    warn!(seq, error = %error, pending = state.len(), "transport disconnected, queue disabled");
                    self.emit(QueueEvent::SendError { seq, error });
                    self.emit(QueueEvent::Disabled);
                }
                Err(error) => {
                    let _ = state.ready.pop_front();
                    warn!(seq, error = %error, "message rejected, dropping");
                    self.emit(QueueEvent::SendError { seq, error });
                }
            }
        }
    }

    async fn release_where(&self, pred: impl Fn(&Entry<M>) -> bool) -> usize {
        let mut state = self.state.lock().await;
        if state.destroyed {
            return 0;
        }
        let moved = state.promote(pred);
        if moved > 0 {
            self.drain(&mut state);
        }
        moved
    }
}

/// Single-writer outgoing queue. Cloning shares the same queue.
pub struct OutgoingMessageQueue<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for OutgoingMessageQueue<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: QueueMessage> OutgoingMessageQueue<M> {
    pub fn new(transport: Arc<dyn Transport<M>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    ready: VecDeque::new(),
                    held: Vec::new(),
                    next_seq: 0,
                    disabled: false,
                    destroyed: false,
                }),
                transport,
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Append `message`; returns its sequence number.
    ///
    /// Returns `None` for control messages and after [`destroy`](Self::destroy).
    /// Messages without a delay are sent before this returns unless the
    /// queue is disabled.
    pub async fn enqueue(&self, message: M, options: EnqueueOptions) -> Option<u64> {
        if message.is_control() {
            debug!("dropping control message");
            return None;
        }
        let mut state = self.inner.state.lock().await;
        if state.destroyed {
            return None;
        }
        let seq = state.next_seq;
        state.next_seq += 1;

        let mut entry = Entry {
            seq,
            message,
            tool_call_ids: options.tool_call_ids.into_iter().collect(),
            timer: None,
        };
        match options.delay.filter(|d| !d.is_zero()) {
            None => {
                state.ready.push_back(entry);
                self.inner.drain(&mut state);
            }
            Some(delay) => {
                let timer = self.inner.shutdown.child_token();
                entry.timer = Some(timer.clone());
                state.held.push(entry);
                spawn_timer(Arc::downgrade(&self.inner), seq, delay, timer);
            }
        }
        Some(seq)
    }

    /// Make every held entry waiting on `tool_call_id` eligible now.
    pub async fn release_tool_call(&self, tool_call_id: &ToolCallId) -> usize {
        let released = self
            .inner
            .release_where(|e| e.tool_call_ids.contains(tool_call_id))
            .await;
        debug!(%tool_call_id, released, "tool call released");
        released
    }

    /// Clear the disabled state and resume from the oldest pending entry.
    /// No-op while already enabled.
    pub async fn enable(&self) {
        let mut state = self.inner.state.lock().await;
        if state.destroyed || !state.disabled {
            return;
        }
        state.disabled = false;
        info!(pending = state.len(), "queue enabled");
        self.inner.emit(QueueEvent::Enabled);
        self.inner.drain(&mut state);
    }

    /// Make everything eligible and attempt delivery now.
    ///
    /// Never fails; errors surface as [`QueueEvent::SendError`]. While
    /// disabled nothing is sent.
    pub async fn flush(&self) {
        let _ = self.inner.release_where(|_| true).await;
    }

    /// Stop all timers and drop pending entries. Later calls do nothing.
    pub async fn destroy(&self) {
        let mut state = self.inner.state.lock().await;
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        self.inner.shutdown.cancel();
        let dropped = state.len();
        state.ready.clear();
        state.held.clear();
        info!(dropped, "queue destroyed");
    }

    pub async fn is_disabled(&self) -> bool {
        self.inner.state.lock().await.disabled
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.state.lock().await.len()
    }
}

fn spawn_timer<M: QueueMessage>(inner: Weak<Inner<M>>, seq: u64, delay: Duration, timer: CancellationToken) {
    let _ = tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                if let Some(inner) = inner.upgrade() {
                    let _ = inner.release_where(|e| e.seq == seq).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::time::sleep;

    /// Records `n` of every message; fails while offline or for rejected `n`.
    #[derive(Default)]
    struct Recorder {
        sent: SyncMutex<Vec<u64>>,
        attempts: SyncMutex<Vec<u64>>,
        offline: AtomicBool,
        reject: SyncMutex<HashSet<u64>>,
    }

    impl Recorder {
        fn sent(&self) -> Vec<u64> {
            self.sent.lock().clone()
        }
    }

    impl Transport<Value> for Recorder {
        fn send(&self, message: &Value) -> Result<(), TransportError> {
            let n = message["n"].as_u64().unwrap_or_default();
            self.attempts.lock().push(n);
            if self.offline.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected("socket closed".into()));
            }
            if self.reject.lock().contains(&n) {
                return Err(TransportError::Rejected("too large".into()));
            }
            self.sent.lock().push(n);
            Ok(())
        }
    }

    fn setup() -> (OutgoingMessageQueue<Value>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let queue = OutgoingMessageQueue::new(Arc::clone(&recorder) as Arc<dyn Transport<Value>>);
        (queue, recorder)
    }

    fn msg(n: u64) -> Value {
        json!({"type": "update", "n": n})
    }

    fn tool(id: &str) -> ToolCallId {
        ToolCallId::from_raw(id)
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_messages_go_out_in_order() {
        let (queue, rec) = setup();
        for n in 1..=3 {
            let _ = queue.enqueue(msg(n), EnqueueOptions::default()).await;
        }
        assert_eq!(rec.sent(), vec![1, 2, 3]);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn control_messages_are_filtered() {
        let (queue, rec) = setup();
        let seq = queue
            .enqueue(json!({"type": "system", "n": 9}), EnqueueOptions::default())
            .await;
        assert!(seq.is_none());
        assert!(rec.attempts.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_message_waits_for_its_delay() {
        let (queue, rec) = setup();
        let _ = queue
            .enqueue(msg(1), EnqueueOptions::delayed(Duration::from_millis(250)))
            .await;

        sleep(Duration::from_millis(100)).await;
        assert!(rec.sent().is_empty());
        assert_eq!(queue.pending_len().await, 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(rec.sent(), vec![1]);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_release_beats_the_delay() {
        let (queue, rec) = setup();
        let _ = queue
            .enqueue(
                msg(1),
                EnqueueOptions::delayed(Duration::from_millis(250)).with_tool_call(tool("t1")),
            )
            .await;

        sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.release_tool_call(&tool("t1")).await, 1);
        assert_eq!(rec.sent(), vec![1]);

        // The cancelled timer must not send it again.
        sleep(Duration::from_millis(500)).await;
        assert_eq!(rec.sent(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tool_call_releases_nothing() {
        let (queue, rec) = setup();
        let _ = queue
            .enqueue(msg(1), EnqueueOptions::delayed(Duration::from_secs(1)).with_tool_call(tool("t1")))
            .await;
        assert_eq!(queue.release_tool_call(&tool("t2")).await, 0);
        assert!(rec.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn eligible_entries_pass_held_ones() {
        let (queue, rec) = setup();
        let _ = queue
            .enqueue(msg(1), EnqueueOptions::delayed(Duration::from_millis(100)))
            .await;
        let _ = queue.enqueue(msg(2), EnqueueOptions::default()).await;
        assert_eq!(rec.sent(), vec![2]);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(rec.sent(), vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn release_of_shared_tool_call_keeps_enqueue_order() {
        let (queue, rec) = setup();
        let _ = queue
            .enqueue(msg(1), EnqueueOptions::delayed(Duration::from_secs(3)).with_tool_call(tool("t1")))
            .await;
        let _ = queue
            .enqueue(msg(2), EnqueueOptions::delayed(Duration::from_secs(2)).with_tool_call(tool("t9")))
            .await;
        let _ = queue
            .enqueue(msg(3), EnqueueOptions::delayed(Duration::from_secs(1)).with_tool_call(tool("t1")))
            .await;

        assert_eq!(queue.release_tool_call(&tool("t1")).await, 2);
        assert_eq!(rec.sent(), vec![1, 3]);
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_disables_and_enable_resends_in_order() {
        let (queue, rec) = setup();
        let mut events = queue.subscribe();

        let _ = queue.enqueue(msg(1), EnqueueOptions::default()).await;
        rec.offline.store(true, Ordering::SeqCst);
        let _ = queue.enqueue(msg(2), EnqueueOptions::default()).await;
        let _ = queue.enqueue(msg(3), EnqueueOptions::default()).await;

        assert_eq!(rec.sent(), vec![1]);
        assert!(queue.is_disabled().await);
        assert_eq!(queue.pending_len().await, 2);
        // Message 3 was accepted but never attempted.
        assert_eq!(*rec.attempts.lock(), vec![1, 2]);

        assert_eq!(events.recv().await.unwrap(), QueueEvent::Sent { seq: 0 });
        assert!(matches!(
            events.recv().await.unwrap(),
            QueueEvent::SendError { seq: 1, error: TransportError::Disconnected(_) }
        ));
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Disabled);

        rec.offline.store(false, Ordering::SeqCst);
        queue.enable().await;
        assert!(!queue.is_disabled().await);
        assert_eq!(rec.sent(), vec![1, 2, 3]);
        assert_eq!(*rec.attempts.lock(), vec![1, 2, 2, 3]);
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn enable_while_enabled_is_a_noop() {
        let (queue, _rec) = setup();
        let mut events = queue.subscribe();
        queue.enable().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_firing_while_disabled_does_not_send() {
        let (queue, rec) = setup();
        rec.offline.store(true, Ordering::SeqCst);
        let _ = queue.enqueue(msg(1), EnqueueOptions::default()).await;
        let _ = queue
            .enqueue(msg(2), EnqueueOptions::delayed(Duration::from_millis(100)))
            .await;

        sleep(Duration::from_millis(200)).await;
        assert_eq!(*rec.attempts.lock(), vec![1]);

        rec.offline.store(false, Ordering::SeqCst);
        queue.enable().await;
        assert_eq!(rec.sent(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_message_is_dropped_and_drain_continues() {
        let (queue, rec) = setup();
        let _ = rec.reject.lock().insert(1);
        let mut events = queue.subscribe();

        let _ = queue.enqueue(msg(1), EnqueueOptions::default()).await;
        let _ = queue.enqueue(msg(2), EnqueueOptions::default()).await;

        assert_eq!(rec.sent(), vec![2]);
        assert!(!queue.is_disabled().await);
        assert_eq!(queue.pending_len().await, 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            QueueEvent::SendError { seq: 0, error: TransportError::Rejected(_) }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_ignores_remaining_delay() {
        let (queue, rec) = setup();
        let _ = queue
            .enqueue(msg(1), EnqueueOptions::delayed(Duration::from_secs(10)))
            .await;
        let _ = queue
            .enqueue(msg(2), EnqueueOptions::delayed(Duration::from_secs(5)))
            .await;
        queue.flush().await;
        assert_eq!(rec.sent(), vec![1, 2]);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(rec.sent(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_while_disabled_keeps_entries() {
        let (queue, rec) = setup();
        rec.offline.store(true, Ordering::SeqCst);
        let _ = queue.enqueue(msg(1), EnqueueOptions::default()).await;
        let _ = queue
            .enqueue(msg(2), EnqueueOptions::delayed(Duration::from_secs(5)))
            .await;

        queue.flush().await;
        assert!(queue.is_disabled().await);
        assert_eq!(queue.pending_len().await, 2);
        assert_eq!(*rec.attempts.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_stops_timers_and_intake() {
        let (queue, rec) = setup();
        let _ = queue
            .enqueue(msg(1), EnqueueOptions::delayed(Duration::from_millis(100)))
            .await;
        queue.destroy().await;

        sleep(Duration::from_millis(500)).await;
        assert!(rec.attempts.lock().is_empty());
        assert!(queue.enqueue(msg(2), EnqueueOptions::default()).await.is_none());
        assert_eq!(queue.pending_len().await, 0);
        assert_eq!(queue.release_tool_call(&tool("t1")).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_is_immediate() {
        let (queue, rec) = setup();
        let _ = queue
            .enqueue(msg(1), EnqueueOptions::delayed(Duration::ZERO))
            .await;
        assert_eq!(rec.sent(), vec![1]);
    }

    /// Fails every seventh attempt with a disconnect and panics if two
    /// sends ever overlap.
    #[derive(Default)]
    struct Exclusive {
        in_flight: AtomicBool,
        attempts: AtomicU64,
        sent: SyncMutex<Vec<u64>>,
    }

    impl Transport<Value> for Exclusive {
        fn send(&self, message: &Value) -> Result<(), TransportError> {
            assert!(!self.in_flight.swap(true, Ordering::SeqCst), "transport re-entered");
            std::thread::sleep(Duration::from_micros(50));
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let result = if attempt % 7 == 0 {
                Err(TransportError::Disconnected("flaky link".into()))
            } else {
                self.sent.lock().push(message["n"].as_u64().unwrap_or_default());
                Ok(())
            };
            self.in_flight.store(false, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_overlap_sends() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 50;

        let transport = Arc::new(Exclusive::default());
        let queue = OutgoingMessageQueue::new(Arc::clone(&transport) as Arc<dyn Transport<Value>>);
        let mut tasks = Vec::new();

        for p in 0..PRODUCERS {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..PER_PRODUCER {
                    let n = p * 1_000 + i;
                    let options = if i % 2 == 0 {
                        EnqueueOptions::default()
                    } else {
                        EnqueueOptions::delayed(Duration::from_secs(10)).with_tool_call(tool(&format!("t{n}")))
                    };
                    let _ = queue.enqueue(msg(n), options).await;
                    tokio::task::yield_now().await;
                }
            }));
        }
        for p in 0..PRODUCERS {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                for i in (1..PER_PRODUCER).step_by(2) {
                    let _ = queue.release_tool_call(&tool(&format!("t{}", p * 1_000 + i))).await;
                    tokio::task::yield_now().await;
                }
            }));
        }
        for _ in 0..2 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..200 {
                    queue.enable().await;
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.expect("task panicked");
        }

        // Releases that raced ahead of their enqueue leave entries held.
        for _ in 0..1_000 {
            if queue.pending_len().await == 0 {
                break;
            }
            queue.enable().await;
            queue.flush().await;
        }
        assert_eq!(queue.pending_len().await, 0);

        let mut sent = transport.sent.lock().clone();
        sent.sort_unstable();
        let mut expected: Vec<u64> = (0..PRODUCERS)
            .flat_map(|p| (0..PER_PRODUCER).map(move |i| p * 1_000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(sent, expected);
        queue.destroy().await;
    }

    #[test]
    fn websocket_control_types_are_filtered() {
        use tether_core::envelope::MessageType;
        assert!(WebSocketMessage::new(MessageType::System, None).is_control());
        assert!(!WebSocketMessage::new(MessageType::Update, None).is_control());
    }
}
