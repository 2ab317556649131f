//! Borrowed connection: a temporary lease of a hub stream for raw data relay.
//!
//! The lease takes the stream's [`PduReader`] and a clone of its [`PduWriter`],
//! and copies bytes between the stream and an in-memory endpoint handed to the
//! application. It ends when the application closes its endpoint, when no byte
//! crossed in either direction for `max_idle`, or when the stream fails. The
//! reader is given back in the [`BorrowOutcome`] so the control engine can
//! resume. The physical stream is never shut down by a lease.

use crate::engine::{duration_ms, StopSignal};
use crate::error::{Error, Result};
use crate::stream::{PduReader, PduWriter};
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

const RELAY_BUF: usize = 16 * 1024;
const APP_PIPE_SIZE: usize = 64 * 1024;
// stands in for an idle limit too large to add to an instant
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Application endpoint closed, or `close()` called.
    Closed,
    IdleTimeout,
    TransportError(String),
}

pub struct BorrowOutcome {
    pub reader: PduReader,
    /// Idle limit in force when the lease ended.
    pub max_idle: Duration,
    pub reason: ReleaseReason,
}

pub struct BorrowedConnection {
    label: String,
    max_idle_ms: Arc<AtomicU64>,
    closer: StopSignal,
    worker: JoinHandle<BorrowOutcome>,
}

impl BorrowedConnection {
    /// Start relaying. Returns the lease and the application's endpoint.
    pub fn start<S: Into<String>>(
        label: S,
        reader: PduReader,
        writer: PduWriter,
        max_idle: Duration,
    ) -> (Self, DuplexStream) {
        let label = label.into();
        let (app_side, relay_side) = duplex(APP_PIPE_SIZE);
        let max_idle_ms = Arc::new(AtomicU64::new(duration_ms(max_idle)));
        let closer = StopSignal::new();

        log::debug!("{}: borrow stream, max idle {:?}", label, max_idle);

        let worker = tokio::spawn(relay(
            label.clone(),
            reader,
            writer,
            relay_side,
            max_idle_ms.clone(),
            closer.clone(),
        ));

        (
            Self {
                label,
                max_idle_ms,
                closer,
                worker,
            },
            app_side,
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn max_idle(&self) -> Duration {
        idle_limit(&self.max_idle_ms)
    }

    /// Replace the idle limit of the running lease.
    pub fn set_max_idle(&self, max_idle: Duration) {
        self.max_idle_ms.store(duration_ms(max_idle), Relaxed);
    }

    pub fn close(&self) {
        self.closer.stop();
    }

    /// Token that ends the lease when stopped.
    pub fn closer(&self) -> StopSignal {
        self.closer.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait until the relay worker has fully stopped and take the stream back.
    pub async fn join(self) -> Result<BorrowOutcome> {
        let label = self.label;
        self.worker.await.map_err(|e| {
            Error::HubConnectionLost(format!("{}: borrow worker failed: {}", label, e))
        })
    }
}

fn idle_limit(max_idle_ms: &AtomicU64) -> Duration {
    Duration::from_millis(max_idle_ms.load(Relaxed))
}

async fn relay(
    label: String,
    mut reader: PduReader,
    writer: PduWriter,
    app: DuplexStream,
    max_idle_ms: Arc<AtomicU64>,
    closer: StopSignal,
) -> BorrowOutcome {
    let (mut app_rx, mut app_tx) = split(app);
    let mut from_stream = vec![0u8; RELAY_BUF];
    let mut from_app = vec![0u8; RELAY_BUF];
    // read but not yet delivered; a side only reads again once drained
    let mut to_app = BytesMut::new();
    let mut to_stream = BytesMut::new();
    let mut last_transfer = Instant::now();

    let reason = loop {
        let idle_at = last_transfer
            .checked_add(idle_limit(&max_idle_ms))
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        select! {
            _ = closer.stopped() => break ReleaseReason::Closed,

            _ = sleep_until(idle_at) => {
                // limit may have been raised while sleeping
                if last_transfer.elapsed() >= idle_limit(&max_idle_ms) {
                    break ReleaseReason::IdleTimeout;
                }
            }

            r = reader.read_raw(&mut from_stream), if to_app.is_empty() => match r {
                Ok(0) => break ReleaseReason::TransportError("stream closed by remote".into()),
                Ok(n) => {
                    to_app.extend_from_slice(&from_stream[..n]);
                    last_transfer = Instant::now();
                }
                Err(e) => break ReleaseReason::TransportError(e.to_string()),
            },

            r = app_tx.write(&to_app), if !to_app.is_empty() => match r {
                Ok(0) => break ReleaseReason::Closed,
                Ok(n) => {
                    to_app.advance(n);
                    last_transfer = Instant::now();
                }
                Err(e) => {
                    log::debug!("{}: application endpoint gone: {}", label, e);
                    break ReleaseReason::Closed;
                }
            },

            r = app_rx.read(&mut from_app), if to_stream.is_empty() => match r {
                Ok(0) => break ReleaseReason::Closed,
                Ok(n) => {
                    to_stream.extend_from_slice(&from_app[..n]);
                    last_transfer = Instant::now();
                }
                Err(e) => {
                    log::debug!("{}: application endpoint failed: {}", label, e);
                    break ReleaseReason::Closed;
                }
            },

            r = writer.write_some(&to_stream), if !to_stream.is_empty() => match r {
                Ok(0) => break ReleaseReason::TransportError("stream refuses data".into()),
                Ok(n) => {
                    to_stream.advance(n);
                    last_transfer = Instant::now();
                    if to_stream.is_empty() {
                        if let Err(e) = writer.flush().await {
                            break ReleaseReason::TransportError(e.to_string());
                        }
                    }
                }
                Err(e) => break ReleaseReason::TransportError(e.to_string()),
            },
        }
    };

    log::debug!(
        "{}: borrowed connection released: {:?}, {} / {} bytes undelivered",
        label,
        reason,
        to_app.len(),
        to_stream.len()
    );

    BorrowOutcome {
        reader,
        max_idle: idle_limit(&max_idle_ms),
        reason,
    }
}
