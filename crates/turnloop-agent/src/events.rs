//! The event taxonomy a turn emits, and the pub/sub fan-out that delivers
//! it to subscribers without ever blocking the session actor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use turnloop_core::{ContentBlock, ErrorKind, Message, Usage};
use turnloop_llm::{PartialToolCall, ToolCall};

/// The incremental pieces of an in-flight Assistant message, mirroring a
/// `StreamFn`'s producer-order content-block events.
#[derive(Debug, Clone)]
pub enum MessageDelta {
    TextStart { idx: usize },
    TextDelta { idx: usize, chunk: String },
    TextEnd { idx: usize },
    ThinkingStart { idx: usize },
    ThinkingDelta { idx: usize, chunk: String },
    ThinkingEnd { idx: usize },
    ToolCallStart { idx: usize, partial_tool_call: PartialToolCall },
    ToolCallEnd { idx: usize, tool_call: ToolCall },
    Usage { usage: Usage },
}

/// External event taxonomy (§6 of the contract this runtime implements):
/// the names here are the wire contract subscribers depend on.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    AgentStart,
    TurnStart,
    MessageStart { message: Message },
    MessageUpdate { message: Message, delta: MessageDelta },
    MessageEnd { message: Message },
    ToolExecutionStart { call_id: String, name: String, arguments: Value },
    ToolExecutionUpdate { call_id: String, content: Vec<ContentBlock>, details: Option<Value> },
    ToolExecutionEnd { call_id: String, name: String, is_error: bool, content: Vec<ContentBlock> },
    TurnEnd { message: Option<Message>, messages: Vec<Message> },
    AgentEnd { messages: Vec<Message> },
    Error { kind: ErrorKind, partial_message: Option<Message> },
    Canceled { reason: String },
}

/// One published event, addressed to its originating session and stamped
/// with a per-session monotonic sequence number so every subscriber that
/// sees two events sees them in the same relative order.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub session_id: String,
    pub sequence: u64,
    pub event: SessionEvent,
}

struct MailboxSub {
    id: u64,
    tx: mpsc::Sender<Envelope>,
    dropped_events: Arc<AtomicU64>,
}

struct StreamInner {
    queue: Mutex<VecDeque<Envelope>>,
    max_queue: usize,
    notify: Notify,
    dropped_events: AtomicU64,
}

struct StreamSub {
    id: u64,
    inner: Arc<StreamInner>,
}

/// A pull handle returned by `EventFanOut::subscribe_stream`. Overflow
/// policy is drop-oldest: once `max_queue` events are buffered, publishing
/// a new one evicts the oldest and increments `dropped_events`.
pub struct StreamSubscription {
    id: u64,
    inner: Arc<StreamInner>,
}

impl StreamSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped_events.load(Ordering::SeqCst)
    }

    /// Waits for and returns the next queued event.
    pub async fn next(&self) -> Envelope {
        loop {
            {
                let mut queue = self.inner.queue.lock().unwrap();
                if let Some(envelope) = queue.pop_front() {
                    return envelope;
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

/// A mailbox handle returned by `EventFanOut::subscribe_mailbox`. Delivery
/// is one-shot and non-backpressuring: a saturated mailbox drops the event
/// for that subscriber only, visible via `dropped_events`.
pub struct MailboxSubscription {
    id: u64,
    rx: mpsc::Receiver<Envelope>,
    dropped_events: Arc<AtomicU64>,
}

impl MailboxSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::SeqCst)
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// Session-scoped pub/sub over the event taxonomy above. Every `publish`
/// call is synchronous and non-blocking: mailbox sends use `try_send`,
/// stream pushes take a brief `std::sync::Mutex` lock, matching the rest
/// of this crate's cheap-lock style for in-memory shared state.
pub struct EventFanOut {
    session_id: String,
    next_sub_id: AtomicU64,
    next_sequence: AtomicU64,
    mailboxes: Mutex<Vec<MailboxSub>>,
    streams: Mutex<Vec<StreamSub>>,
}

impl EventFanOut {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            next_sub_id: AtomicU64::new(1),
            next_sequence: AtomicU64::new(0),
            mailboxes: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn publish(&self, event: SessionEvent) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            session_id: self.session_id.clone(),
            sequence,
            event,
        };

        {
            let mut mailboxes = self.mailboxes.lock().unwrap();
            mailboxes.retain_mut(|sub| match sub.tx.try_send(envelope.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    sub.dropped_events.fetch_add(1, Ordering::SeqCst);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }

        {
            let streams = self.streams.lock().unwrap();
            for sub in streams.iter() {
                let mut queue = sub.inner.queue.lock().unwrap();
                if queue.len() >= sub.inner.max_queue {
                    queue.pop_front();
                    sub.inner.dropped_events.fetch_add(1, Ordering::SeqCst);
                }
                queue.push_back(envelope.clone());
                drop(queue);
                sub.inner.notify.notify_waiters();
            }
        }
    }

    pub fn subscribe_mailbox(&self, max_queue: usize) -> MailboxSubscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(max_queue.max(1));
        let dropped_events = Arc::new(AtomicU64::new(0));
        self.mailboxes.lock().unwrap().push(MailboxSub {
            id,
            tx,
            dropped_events: dropped_events.clone(),
        });
        MailboxSubscription { id, rx, dropped_events }
    }

    pub fn subscribe_stream(&self, max_queue: usize) -> StreamSubscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::new(StreamInner {
            queue: Mutex::new(VecDeque::new()),
            max_queue: max_queue.max(1),
            notify: Notify::new(),
            dropped_events: AtomicU64::new(0),
        });
        self.streams.lock().unwrap().push(StreamSub { id, inner: inner.clone() });
        StreamSubscription { id, inner }
    }

    /// Idempotent: unsubscribing an id that isn't present is a no-op.
    pub fn unsubscribe_mailbox(&self, id: u64) {
        self.mailboxes.lock().unwrap().retain(|sub| sub.id != id);
    }

    pub fn unsubscribe_stream(&self, id: u64) {
        self.streams.lock().unwrap().retain(|sub| sub.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // mailbox mode
    // =========================================================================

    #[tokio::test]
    async fn mailbox_subscriber_receives_published_events_in_order() {
        let fan_out = EventFanOut::new("s1");
        let mut sub = fan_out.subscribe_mailbox(8);
        fan_out.publish(SessionEvent::AgentStart);
        fan_out.publish(SessionEvent::TurnStart);

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert!(first.sequence < second.sequence);
    }

    #[tokio::test]
    async fn mailbox_overflow_drops_for_that_subscriber_only() {
        let fan_out = EventFanOut::new("s1");
        let mut small = fan_out.subscribe_mailbox(1);
        let mut big = fan_out.subscribe_mailbox(8);

        for _ in 0..4 {
            fan_out.publish(SessionEvent::TurnStart);
        }

        assert!(small.dropped_events() > 0);
        assert_eq!(big.dropped_events(), 0);

        // drain so the test doesn't depend on channel capacity beyond this
        while small.rx.try_recv().is_ok() {}
        while big.rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn unsubscribe_mailbox_is_idempotent_and_stops_delivery() {
        let fan_out = EventFanOut::new("s1");
        let sub = fan_out.subscribe_mailbox(8);
        let id = sub.id();
        fan_out.unsubscribe_mailbox(id);
        fan_out.unsubscribe_mailbox(id);
        assert_eq!(fan_out.mailboxes.lock().unwrap().len(), 0);
    }

    // =========================================================================
    // stream mode
    // =========================================================================

    #[tokio::test]
    async fn stream_subscriber_pulls_events_in_order() {
        let fan_out = EventFanOut::new("s1");
        let sub = fan_out.subscribe_stream(8);
        fan_out.publish(SessionEvent::AgentStart);
        fan_out.publish(SessionEvent::TurnStart);

        let first = sub.next().await;
        let second = sub.next().await;
        assert!(first.sequence < second.sequence);
    }

    #[tokio::test]
    async fn stream_overflow_drops_oldest() {
        let fan_out = EventFanOut::new("s1");
        let sub = fan_out.subscribe_stream(2);
        fan_out.publish(SessionEvent::AgentStart); // will be dropped
        fan_out.publish(SessionEvent::TurnStart);
        fan_out.publish(SessionEvent::AgentEnd { messages: Vec::new() });

        assert_eq!(sub.dropped_events(), 1);
        let first = sub.next().await;
        assert!(matches!(first.event, SessionEvent::TurnStart));
    }

    #[tokio::test]
    async fn unsubscribe_stream_is_idempotent() {
        let fan_out = EventFanOut::new("s1");
        let sub = fan_out.subscribe_stream(8);
        let id = sub.id();
        fan_out.unsubscribe_stream(id);
        fan_out.unsubscribe_stream(id);
        assert_eq!(fan_out.streams.lock().unwrap().len(), 0);
    }
}
