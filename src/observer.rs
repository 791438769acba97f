//! The traits through which applications plug into the registry: frame
//! production, lifecycle notifications, and the packet capture hook.

use std::sync::Arc;

use crate::pusher::Pusher;

/// Produces pixel data at the start of each frame.
///
/// The registry calls [`FrameDelegate::render_start`] on the frame task
/// once per tick. Returning `true` means rendering is complete and the
/// flush may proceed immediately (synchronous mode). Returning `false`
/// means the delegate will call `Registry::render_finished` when its
/// writes are done; the frame task blocks until then (asynchronous mode).
///
/// All pixel writes for a frame must be finished before `render_start`
/// returns `true` or before `render_finished` is called. The callback
/// runs on the frame task and must not block it indefinitely.
pub trait FrameDelegate: Send + Sync {
    fn render_start(&self) -> bool;
}

/// Why a pusher left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisappearReason {
    /// No beacon was received within the expiry threshold.
    Expired,
    /// A beacon arrived whose immutable capability fields differed; the
    /// pusher was closed and recreated.
    CapabilityChanged,
    /// Three consecutive socket send errors.
    SocketFailed,
    /// The registry was stopped with the kill-on-stop policy enabled, or
    /// shut down.
    Stopped,
}

/// Observes pusher lifecycle events.
///
/// All methods are invoked from the frame task, in the order the events
/// occurred. Keep implementations quick; a slow observer delays the next
/// frame.
pub trait RegistryObserver: Send + Sync {
    /// Called when a beacon from an unknown MAC address created a new
    /// pusher.
    fn pusher_appeared(&self, pusher: &Arc<Pusher>);

    /// Called when an existing pusher's drifting fields changed
    /// noticeably.
    fn pusher_updated(&self, pusher: &Arc<Pusher>);

    /// Called when a pusher was removed; it is closed by the time this
    /// fires.
    fn pusher_disappeared(&self, mac: &str, reason: DisappearReason);
}

/// Receives a copy of every outbound datagram, for capture or recording.
///
/// Called on the flushing task after each successful socket send; keep
/// implementations quick.
pub trait PacketSink: Send + Sync {
    fn packet_sent(&self, pusher_mac: &str, datagram: &[u8]);
}
