//! Realtime channel lifecycle
//!
//! A channel is a subscription scope (table + optional filter) on the
//! backend's realtime service. Providers drive a `ChannelStatus` through the
//! state machine below and hand the caller a `ChannelHandle`; dropping the
//! handle unsubscribes.
//!
//! ```text
//! Unsubscribed -> Subscribing -> Active <-> Reconnecting
//!        \             \            \            \
//!         `-------------`------------`------------`--> Terminated
//! ```

use std::fmt;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::models::ListName;
use crate::provider::EventType;

/// Channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, join not sent yet
    Unsubscribed,
    /// Join sent, waiting for the server to acknowledge
    Subscribing,
    /// Receiving events
    Active,
    /// Connection lost, retrying with backoff
    Reconnecting,
    /// Closed for good
    Terminated,
}

impl ChannelState {
    /// Check if moving to `next` is a legal transition
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Unsubscribed, Subscribing)
                | (Subscribing, Active)
                | (Subscribing, Reconnecting)
                | (Active, Reconnecting)
                | (Reconnecting, Active)
                | (Unsubscribed | Subscribing | Active | Reconnecting, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ChannelState::Terminated
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Unsubscribed => "unsubscribed",
            ChannelState::Subscribing => "subscribing",
            ChannelState::Active => "active",
            ChannelState::Reconnecting => "reconnecting",
            ChannelState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Row filter supported by realtime channels (`column=eq.value`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
    pub column: String,
    pub value: String,
}

impl ChannelFilter {
    pub fn eq(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ChannelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// What a channel listens to and where its events are merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Unique channel name, e.g. `posts-realtime`
    pub name: String,
    pub schema: String,
    pub table: String,
    pub filter: Option<ChannelFilter>,
    /// Event kinds to receive; empty means all
    pub events: Vec<EventType>,
    /// Store list the events are merged into
    pub list: ListName,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, list: ListName) -> Self {
        Self {
            name: name.into(),
            schema: "public".to_string(),
            table: list.table().to_string(),
            filter: None,
            events: Vec::new(),
            list,
        }
    }

    pub fn with_filter(mut self, filter: ChannelFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_events(mut self, events: &[EventType]) -> Self {
        self.events = events.to_vec();
        self
    }

    /// Check if an event kind is delivered on this channel
    pub fn wants(&self, event: EventType) -> bool {
        self.events.is_empty() || self.events.contains(&event)
    }

    /// Event filter in wire form (`*` or `INSERT`)
    pub fn event_filter(&self) -> String {
        match self.events.as_slice() {
            [single] => single.to_string(),
            _ => "*".to_string(),
        }
    }

    /// Realtime topic for this channel
    pub fn topic(&self) -> String {
        format!("realtime:{}", self.name)
    }
}

/// Commands sent from a handle to the provider's channel task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCommand {
    Unsubscribe,
}

/// Provider-side state publisher enforcing the transition rules
#[derive(Debug)]
pub struct ChannelStatus {
    name: String,
    tx: watch::Sender<ChannelState>,
}

impl ChannelStatus {
    /// Create a status publisher and its receiver
    pub fn new(name: &str) -> (Self, watch::Receiver<ChannelState>) {
        let (tx, rx) = watch::channel(ChannelState::Unsubscribed);
        (
            Self {
                name: name.to_string(),
                tx,
            },
            rx,
        )
    }

    /// Current state
    pub fn get(&self) -> ChannelState {
        *self.tx.borrow()
    }

    /// Move to `next`; illegal transitions are ignored and return false
    pub fn advance(&self, next: ChannelState) -> bool {
        let current = self.get();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(
                "Channel {}: ignoring transition {} -> {}",
                self.name, current, next
            );
            return false;
        }
        debug!("Channel {}: {} -> {}", self.name, current, next);
        self.tx.send_replace(next);
        true
    }
}

/// Caller-side handle of an open channel
///
/// Unsubscribes when dropped, so a handle that goes out of scope on any path
/// (including a failed setup) releases the channel.
#[derive(Debug)]
pub struct ChannelHandle {
    name: String,
    command_tx: mpsc::Sender<ChannelCommand>,
    state_rx: watch::Receiver<ChannelState>,
}

impl ChannelHandle {
    pub fn new(
        name: &str,
        command_tx: mpsc::Sender<ChannelCommand>,
        state_rx: watch::Receiver<ChannelState>,
    ) -> Self {
        Self {
            name: name.to_string(),
            command_tx,
            state_rx,
        }
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current channel state
    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Watch state changes
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Ask the provider to leave the channel
    pub fn unsubscribe(&self) {
        if self.state().is_terminal() {
            return;
        }
        // The task may already be gone; a closed channel means it is.
        let _ = self.command_tx.try_send(ChannelCommand::Unsubscribe);
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use ChannelState::*;
        assert!(Unsubscribed.can_transition_to(Subscribing));
        assert!(Subscribing.can_transition_to(Active));
        assert!(Active.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Active));
        assert!(Reconnecting.can_transition_to(Terminated));
        assert!(Unsubscribed.can_transition_to(Terminated));
    }

    #[test]
    fn test_illegal_transitions() {
        use ChannelState::*;
        assert!(!Unsubscribed.can_transition_to(Active));
        assert!(!Terminated.can_transition_to(Subscribing));
        assert!(!Terminated.can_transition_to(Active));
        assert!(!Active.can_transition_to(Subscribing));
    }

    #[test]
    fn test_status_ignores_illegal_transition() {
        let (status, rx) = ChannelStatus::new("posts");
        assert!(!status.advance(ChannelState::Active));
        assert_eq!(*rx.borrow(), ChannelState::Unsubscribed);
        assert!(status.advance(ChannelState::Subscribing));
        assert!(status.advance(ChannelState::Active));
        assert!(status.advance(ChannelState::Terminated));
        assert!(!status.advance(ChannelState::Active));
        assert_eq!(*rx.borrow(), ChannelState::Terminated);
    }

    #[test]
    fn test_spec_defaults() {
        let spec = ChannelSpec::new("posts-realtime", ListName::Feed);
        assert_eq!(spec.table, "posts");
        assert_eq!(spec.topic(), "realtime:posts-realtime");
        assert_eq!(spec.event_filter(), "*");
        assert!(spec.wants(EventType::Delete));

        let spec = spec.with_events(&[EventType::Insert]);
        assert_eq!(spec.event_filter(), "INSERT");
        assert!(!spec.wants(EventType::Update));
    }

    #[test]
    fn test_filter_display() {
        let f = ChannelFilter::eq("receiver_id", "u1");
        assert_eq!(f.to_string(), "receiver_id=eq.u1");
    }

    #[tokio::test]
    async fn test_drop_sends_unsubscribe() {
        let (tx, mut rx) = mpsc::channel(1);
        let (_status, state_rx) = ChannelStatus::new("posts");
        let handle = ChannelHandle::new("posts", tx, state_rx);
        drop(handle);
        assert_eq!(rx.recv().await, Some(ChannelCommand::Unsubscribe));
    }
}
