//! State machine contract shared by the hub session and the connector.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Whole milliseconds of `d` as sent on the wire, saturating at `u64::MAX`.
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Protocol state of a control engine.
///
/// `Unregistered → Active → Silent → Borrowed → Active …`, and `Terminated`
/// from any state once the physical stream is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unregistered,
    /// Control read loop owns the stream.
    Active,
    /// Control loop stopped, waiting for the channel clear handshake.
    Silent,
    /// A borrowed connection relays raw data over the stream.
    Borrowed,
    Terminated,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Unregistered => "unregistered",
            EngineState::Active => "active",
            EngineState::Silent => "silent",
            EngineState::Borrowed => "borrowed",
            EngineState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Implemented by both ends of a hub connection.
pub trait ControlEngine {
    /// Peer id this engine speaks for, once registered.
    fn peer_id(&self) -> Option<String>;

    fn engine_state(&self) -> EngineState;

    fn is_active(&self) -> bool {
        self.engine_state() == EngineState::Active
    }
}

/// Cancellation token for the workers of one session.
///
/// Once stopped it stays stopped; [`StopSignal::stopped`] resolves immediately
/// for every later waiter.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, wait_for cannot see a closed channel
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
