//! Event and chat sinks
//!
//! The engine reports what happens on the server through an `EventSink`:
//! connection and presence events on one stream, broadcast chat lines on the
//! other. Appends are fire-and-forget; a sink never fails the caller.

use tokio::sync::mpsc;
use tracing::info;

// ----------------------------------------------------------------------------
// Sink Trait
// ----------------------------------------------------------------------------

/// Destination for server events and chat lines
pub trait EventSink: Send + Sync {
    /// Record a connection or presence event
    fn append_event(&self, text: &str);

    /// Record a broadcast chat line
    fn append_chat(&self, text: &str);
}

// ----------------------------------------------------------------------------
// Tracing Sink
// ----------------------------------------------------------------------------

/// Sink that forwards to `tracing`, the default for a headless server
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn append_event(&self, text: &str) {
        info!(target: "securechat::events", "{}", text);
    }

    fn append_chat(&self, text: &str) {
        info!(target: "securechat::chat", "{}", text);
    }
}

// ----------------------------------------------------------------------------
// Channel Sink
// ----------------------------------------------------------------------------

/// An item produced by a `ChannelEventSink`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Event(String),
    Chat(String),
}

/// Sink that forwards every append over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl ChannelEventSink {
    /// Create a sink together with the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn append_event(&self, text: &str) {
        // A dropped receiver just means nobody is watching
        let _ = self.sender.send(ServerEvent::Event(text.to_string()));
    }

    fn append_chat(&self, text: &str) {
        let _ = self.sender.send(ServerEvent::Chat(text.to_string()));
    }
}
