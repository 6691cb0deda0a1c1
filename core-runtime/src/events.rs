//! # Event Bus System
//!
//! Progress reporting for sync passes using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: [`PassEvent`] for pass-level milestones, [`SongEvent`]
//!   for per-song progress
//! - **EventBus**: Central broadcast channel the engine publishes to
//! - **EventStream**: Receiver wrapper with optional filtering
//!
//! ```text
//! ┌───────────────┐   emit   ┌──────────┐  subscribe  ┌─────────────┐
//! │ Sync workers  ├─────────>│          ├────────────>│ CLI / GUI   │
//! └───────────────┘          │ EventBus │             └─────────────┘
//! ┌───────────────┐   emit   │          │  subscribe  ┌─────────────┐
//! │ Engine facade ├─────────>│          ├────────────>│ Log sink    │
//! └───────────────┘          └──────────┘             └─────────────┘
//! ```
//!
//! Events for a single song are emitted by the one worker that owns the
//! song, so subscribers see them in order. Events of different songs
//! interleave.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, PassEvent};
//!
//! let bus = EventBus::new(100);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(CoreEvent::Pass(PassEvent::Cancelled {
//!     pass_id: "p-1".to_string(),
//! }))
//! .ok();
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; it can keep
//!   receiving.
//! - **`RecvError::Closed`**: every sender is gone; the engine shut down.
//!
//! Emitting with no subscribers returns an error that publishers ignore with
//! `.ok()`; progress reporting is never allowed to fail a pass.

use core_library::{AssetKind, SongId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// A pass emits several events per song; subscribers slower than this fall
/// behind with `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Pass(PassEvent),
    Song(SongEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Pass(e) => e.description(),
            CoreEvent::Song(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Pass(PassEvent::Aborted { .. }) => EventSeverity::Error,
            CoreEvent::Pass(PassEvent::ScanWarning { .. }) => EventSeverity::Warning,
            CoreEvent::Pass(PassEvent::Finished { .. }) => EventSeverity::Info,
            CoreEvent::Song(SongEvent {
                outcome: Some(outcome),
                ..
            }) => outcome.severity(),
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Pass Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PassEvent {
    /// A pass began; the catalog fetch is next.
    Started { pass_id: String, root: String },
    /// A song directory was skipped by the library scan.
    ScanWarning {
        pass_id: String,
        song_id: Option<SongId>,
        message: String,
    },
    /// Reconciliation produced a plan.
    Planned {
        pass_id: String,
        creates: usize,
        updates: usize,
        removes: usize,
        skips: usize,
        deferred_removals: usize,
    },
    /// The pass stopped before planning (catalog unavailable).
    Aborted { pass_id: String, message: String },
    /// Cancellation was requested.
    Cancelled { pass_id: String },
    /// Every job reached a terminal state.
    Finished {
        pass_id: String,
        created: usize,
        updated: usize,
        removed: usize,
        skipped: usize,
        failed: usize,
        cancelled: usize,
    },
}

impl PassEvent {
    fn description(&self) -> &str {
        match self {
            PassEvent::Started { .. } => "Sync pass started",
            PassEvent::ScanWarning { .. } => "Song directory skipped by scan",
            PassEvent::Planned { .. } => "Sync plan ready",
            PassEvent::Aborted { .. } => "Sync pass aborted",
            PassEvent::Cancelled { .. } => "Sync pass cancelled",
            PassEvent::Finished { .. } => "Sync pass finished",
        }
    }

    pub fn pass_id(&self) -> &str {
        match self {
            PassEvent::Started { pass_id, .. }
            | PassEvent::ScanWarning { pass_id, .. }
            | PassEvent::Planned { pass_id, .. }
            | PassEvent::Aborted { pass_id, .. }
            | PassEvent::Cancelled { pass_id }
            | PassEvent::Finished { pass_id, .. } => pass_id,
        }
    }
}

// ============================================================================
// Song Events
// ============================================================================

/// Where a song job currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SongPhase {
    Queued,
    Running,
    Fetching,
    Staged,
    Committing,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SongOutcome {
    Created,
    Updated,
    Removed,
    Skipped,
    /// An optional asset failed; the rest of the song still commits.
    AssetFailed { error: String },
    Failed { error: String },
    Cancelled,
}

impl SongOutcome {
    fn severity(&self) -> EventSeverity {
        match self {
            SongOutcome::Failed { .. } => EventSeverity::Error,
            SongOutcome::AssetFailed { .. } => EventSeverity::Warning,
            SongOutcome::Created | SongOutcome::Updated | SongOutcome::Removed => {
                EventSeverity::Info
            }
            SongOutcome::Skipped | SongOutcome::Cancelled => EventSeverity::Debug,
        }
    }
}

/// Progress of one song job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongEvent {
    pub song_id: SongId,
    pub phase: SongPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SongOutcome>,
}

impl SongEvent {
    pub fn new(song_id: SongId, phase: SongPhase) -> Self {
        Self {
            song_id,
            phase,
            asset: None,
            outcome: None,
        }
    }

    pub fn with_asset(mut self, asset: AssetKind) -> Self {
        self.asset = Some(asset);
        self
    }

    pub fn with_outcome(mut self, outcome: SongOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    fn description(&self) -> &str {
        match (&self.phase, &self.outcome) {
            (_, Some(SongOutcome::Failed { .. })) => "Song failed",
            (_, Some(SongOutcome::AssetFailed { .. })) => "Optional asset failed",
            (_, Some(SongOutcome::Cancelled)) => "Song cancelled",
            (SongPhase::Queued, _) => "Song queued",
            (SongPhase::Running, _) => "Song started",
            (SongPhase::Fetching, _) => "Fetching asset",
            (SongPhase::Staged, _) => "Asset staged",
            (SongPhase::Committing, _) => "Committing song",
            (SongPhase::Finished, _) => "Song finished",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast hub shared by every component of a pass.
///
/// Cloning is cheap; all clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Shorthand for `emit(CoreEvent::Song(..))` that ignores a missing audience.
    pub fn song(&self, event: SongEvent) {
        self.emit(CoreEvent::Song(event)).ok();
    }

    /// Shorthand for `emit(CoreEvent::Pass(..))` that ignores a missing audience.
    pub fn pass(&self, event: PassEvent) {
        self.emit(CoreEvent::Pass(event)).ok();
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A `broadcast::Receiver` with an optional filter.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventSeverity, EventStream};
///
/// let bus = EventBus::default();
/// let problems = EventStream::new(bus.subscribe())
///     .filter(|event| event.severity() >= EventSeverity::Warning);
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |f| f(event))
    }

    /// Receives the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking receive; `None` when nothing matching is buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> SongId {
        SongId::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_emission_no_subscribers() {
        let bus = EventBus::default();
        let result = bus.emit(CoreEvent::Pass(PassEvent::Cancelled {
            pass_id: "p".to_string(),
        }));
        assert!(result.is_err());

        // The shorthand swallows the error
        bus.song(SongEvent::new(id(1), SongPhase::Queued));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let event = SongEvent::new(id(7), SongPhase::Finished).with_outcome(SongOutcome::Created);
        bus.song(event.clone());

        assert_eq!(rx1.recv().await.unwrap(), CoreEvent::Song(event.clone()));
        assert_eq!(rx2.recv().await.unwrap(), CoreEvent::Song(event));
    }

    #[tokio::test]
    async fn test_stream_filter_by_severity() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| event.severity() >= EventSeverity::Warning);

        bus.song(SongEvent::new(id(1), SongPhase::Running));
        bus.song(
            SongEvent::new(id(1), SongPhase::Staged)
                .with_asset(AssetKind::Cover)
                .with_outcome(SongOutcome::AssetFailed {
                    error: "404".to_string(),
                }),
        );

        let event = stream.recv().await.unwrap();
        assert_eq!(event.description(), "Optional asset failed");
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for n in 0..5 {
            bus.song(SongEvent::new(id(n), SongPhase::Queued));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_severity() {
        let failed = CoreEvent::Song(
            SongEvent::new(id(1), SongPhase::Finished).with_outcome(SongOutcome::Failed {
                error: "Malformed".to_string(),
            }),
        );
        assert_eq!(failed.severity(), EventSeverity::Error);

        let aborted = CoreEvent::Pass(PassEvent::Aborted {
            pass_id: "p".to_string(),
            message: "catalog unreachable".to_string(),
        });
        assert_eq!(aborted.severity(), EventSeverity::Error);

        let queued = CoreEvent::Song(SongEvent::new(id(1), SongPhase::Queued));
        assert_eq!(queued.severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Song(
            SongEvent::new(id(42), SongPhase::Staged).with_asset(AssetKind::Audio),
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "Song");
        assert_eq!(json["payload"]["song_id"], 42);
        assert_eq!(json["payload"]["phase"], "staged");
        assert_eq!(json["payload"]["asset"], "audio");
        assert!(json["payload"].get("outcome").is_none());

        let back: CoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);

        let pass = CoreEvent::Pass(PassEvent::Cancelled {
            pass_id: "p-1".to_string(),
        });
        let json = serde_json::to_value(&pass).unwrap();
        assert_eq!(json["payload"]["event"], "Cancelled");
    }
}
