//! Progress broadcaster
//!
//! Each export owns one [`Session`]. Listeners register a sink with the
//! session, and every event published to it fans out to the sinks that are
//! still connected. Sessions are keyed by id in a [`ProgressHub`] so
//! concurrent exports never see each other's events.
//!
//! Sink channels are bounded. A sink that falls behind loses progress frames,
//! but the terminal event and the end marker always have room.
//!
//! Frames render as server-sent events:
//!
//! ```text
//! event: <tag>
//! data: <json>
//!
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::export::event::{EventReceiver, TransferEvent};

/// Export session identifier
pub type SessionId = String;

/// Sink identifier within one session
pub type SinkId = u64;

/// Tag of the frame that ends every stream
pub const END_TAG: &str = "end";

/// Frames buffered per sink before progress frames are dropped
pub const SINK_CAPACITY: usize = 256;

/// Slots held back for the terminal event and the end marker
const TERMINAL_SLOTS: usize = 2;

/// One unit delivered to a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Event(TransferEvent),
    /// Terminal marker, sent once before the sink is severed
    End { message: Option<String> },
}

impl Frame {
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Event(event) => event.tag(),
            Frame::End { .. } => END_TAG,
        }
    }

    /// JSON payload of the `data:` line
    pub fn data(&self) -> String {
        match self {
            Frame::Event(event) => event.payload().to_string(),
            Frame::End { message } => json!({ "message": message }).to_string(),
        }
    }

    /// Full SSE text for this frame
    pub fn to_sse_text(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.tag(), self.data())
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Frame::End { .. })
    }

    /// Whether the frame must reach the sink even when it lags
    fn is_final(&self) -> bool {
        match self {
            Frame::Event(event) => event.is_terminal(),
            Frame::End { .. } => true,
        }
    }
}

/// Sending half held by a session for one listener
pub type FrameSender = mpsc::Sender<Frame>;

/// Receiving half drained by one listener
pub type FrameReceiver = mpsc::Receiver<Frame>;

/// Outcome of offering one frame to a sink
enum Delivery {
    Sent,
    Dropped,
    Gone,
}

/// Offer a frame without waiting
///
/// Progress frames leave the last slots free, so at most the terminal event
/// and the end marker ever fill them. Only the session sends on a sink, and
/// always under its lock, so the capacity check cannot race.
fn deliver(sink: &FrameSender, frame: Frame) -> Delivery {
    if sink.is_closed() {
        return Delivery::Gone;
    }
    if !frame.is_final() && sink.capacity() <= TERMINAL_SLOTS {
        return Delivery::Dropped;
    }
    match sink.try_send(frame) {
        Ok(()) => Delivery::Sent,
        Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
        Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
    }
}

/// Event fan-out for one export session
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    sinks: Mutex<Vec<(SinkId, FrameSender)>>,
    next_sink: AtomicU64,
    closed: AtomicBool,
}

impl Session {
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self {
            id: id.into(),
            sinks: Mutex::new(Vec::new()),
            next_sink: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a sink
    ///
    /// A sink opened on a closed session only receives the end marker.
    pub fn open(&self, sink: FrameSender) -> SinkId {
        let id = self.next_sink.fetch_add(1, Ordering::Relaxed);
        let mut sinks = self.lock();
        if self.is_closed() {
            deliver(&sink, Frame::End { message: None });
            return id;
        }
        sinks.push((id, sink));
        debug!(session = %self.id, sink = id, "Sink registered");
        id
    }

    /// Register a new channel sink and return its receiving half
    pub fn subscribe(&self) -> (SinkId, FrameReceiver) {
        self.subscribe_with_capacity(SINK_CAPACITY)
    }

    /// Register a channel sink buffering at most `capacity` frames
    ///
    /// The capacity never drops below the slots held for terminal frames.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> (SinkId, FrameReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(TERMINAL_SLOTS + 1));
        (self.open(tx), rx)
    }

    /// Fan an event out to every connected sink
    ///
    /// Disconnected sinks are dropped. A lagging sink skips progress frames.
    /// Returns the number of sinks reached.
    pub fn publish(&self, event: TransferEvent) -> usize {
        let mut sinks = self.lock();
        if self.is_closed() {
            return 0;
        }
        let mut reached = 0;
        sinks.retain(|(id, sink)| match deliver(sink, Frame::Event(event.clone())) {
            Delivery::Sent => {
                reached += 1;
                true
            }
            Delivery::Dropped => {
                trace!(session = %self.id, sink = id, "Sink lagging, frame dropped");
                true
            }
            Delivery::Gone => {
                trace!(session = %self.id, sink = id, "Sink gone, deregistering");
                false
            }
        });
        reached
    }

    /// Send the end marker to every sink and sever all registrations
    pub fn close(&self, final_message: Option<String>) {
        let mut sinks = self.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, sink) in sinks.drain(..) {
            deliver(
                &sink,
                Frame::End {
                    message: final_message.clone(),
                },
            );
        }
        debug!(session = %self.id, "Session closed");
    }

    /// Deregister one sink
    pub fn detach(&self, sink: SinkId) {
        self.lock().retain(|(id, _)| *id != sink);
    }

    pub fn sink_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SinkId, FrameSender)>> {
        self.sinks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Deregisters a sink when dropped
pub struct SinkGuard {
    session: Arc<Session>,
    sink: SinkId,
}

impl SinkGuard {
    pub fn new(session: Arc<Session>, sink: SinkId) -> Self {
        Self { session, sink }
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.session.detach(self.sink);
    }
}

/// Registry of live sessions
#[derive(Debug, Default)]
pub struct ProgressHub {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a session, creating it on first use
    pub fn session(&self, id: &str) -> Arc<Session> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Session::new(id)))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Forward an export's events into its session until the terminal event
    ///
    /// The session is then closed and removed from the hub.
    pub async fn pump(&self, session: Arc<Session>, mut events: EventReceiver) {
        let mut final_message = None;
        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            if let TransferEvent::FatalError { reason } = &event {
                final_message = Some(reason.clone());
            }
            session.publish(event);
            if terminal {
                break;
            }
        }
        session.close(final_message);
        self.remove(session.id());
    }
}
