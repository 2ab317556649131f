//! Peer side of a hub connection.
//!
//! A [`Connector`] registers with the hub over an already open stream and keeps a
//! control engine running on it. When the hub asks for silence the engine hands
//! the stream to a [`BorrowedConnection`] and the listener receives the other
//! end as a [`PeerConnection`]. Once the data session is over the engine comes
//! back and sends whatever requests were queued in the meantime.
//!
//! # example
//! ```no_run
//! use hubrelay::connector::{Connector, PeerConnection};
//! use hubrelay::stream::StreamPair;
//! use std::sync::Arc;
//! use tokio::net::TcpStream;
//! use tokio::sync::mpsc::unbounded_channel;
//!
//! # async fn run() -> hubrelay::Result<()> {
//! let (tx, mut rx) = unbounded_channel::<PeerConnection>();
//! let stream = TcpStream::connect("hub:8888").await?;
//! let c = Connector::new(StreamPair::from_tcp(stream), Arc::new(tx));
//! c.connect("alice").await?;
//! c.connect_peer("bob").await?;
//! let conn = rx.recv().await.unwrap();
//! # Ok(())
//! # }
//! ```

use crate::borrow::{BorrowedConnection, FAR_FUTURE};
use crate::engine::{ControlEngine, EngineState, StopSignal};
use crate::error::{Error, Result};
use crate::pdu::HubPdu;
use crate::stream::{PduReader, PduWriter, StreamPair};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::select;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep_until, Instant};

/// Raw data channel to another peer, relayed through the hub.
pub struct PeerConnection {
    pub remote_peer_id: String,
    pub stream: DuplexStream,
}

/// Application side of a connector.
pub trait ConnectionListener: Send + Sync {
    fn notify_peer_connected(&self, conn: PeerConnection);

    fn notify_hub_connection_lost(&self, _err: &Error) {}
}

impl ConnectionListener for UnboundedSender<PeerConnection> {
    fn notify_peer_connected(&self, conn: PeerConnection) {
        if self.send(conn).is_err() {
            log::debug!("connection listener gone, drop peer connection");
        }
    }
}

struct State {
    phase: EngineState,
    local_peer_id: Option<String>,
    peer_ids: BTreeSet<String>,
    pending: VecDeque<HubPdu>,
    /// Reader parked until `connect` starts the engine.
    reader: Option<PduReader>,
    silent_until: Option<Instant>,
    last_max_idle: Option<Duration>,
    borrow_closer: Option<StopSignal>,
}

struct Inner {
    writer: PduWriter,
    state: Mutex<State>,
    listener: Arc<dyn ConnectionListener>,
    stop: StopSignal,
}

pub struct Connector {
    inner: Arc<Inner>,
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl Connector {
    pub fn new(stream: StreamPair, listener: Arc<dyn ConnectionListener>) -> Self {
        let state = State {
            phase: EngineState::Unregistered,
            local_peer_id: None,
            peer_ids: BTreeSet::new(),
            pending: VecDeque::new(),
            reader: Some(stream.reader),
            silent_until: None,
            last_max_idle: None,
            borrow_closer: None,
        };

        Self {
            inner: Arc::new(Inner {
                writer: stream.writer,
                state: Mutex::new(state),
                listener,
                stop: StopSignal::new(),
            }),
        }
    }

    /// Register with the hub and start the control engine.
    pub async fn connect(&self, local_peer_id: &str) -> Result<()> {
        let mut w = self.inner.writer.lock().await;

        let reader = {
            let mut st = self.inner.state();
            if let Some(id) = &st.local_peer_id {
                return Err(Error::AlreadyConnected(id.clone()));
            }
            match st.reader.take() {
                Some(reader) if st.phase == EngineState::Unregistered => reader,
                _ => {
                    return Err(Error::HubConnectionLost(
                        "connector already torn down".into(),
                    ))
                }
            }
        };

        let register = HubPdu::Register {
            peer_id: local_peer_id.to_string(),
        };
        if let Err(e) = w.write_pdu(&register).await {
            self.inner.state().phase = EngineState::Terminated;
            return Err(e);
        }

        {
            let mut st = self.inner.state();
            st.local_peer_id = Some(local_peer_id.to_string());
            st.phase = EngineState::Active;
        }
        drop(w);

        log::info!("registered at hub as {}", local_peer_id);
        start_engine(self.inner.clone(), reader);
        Ok(())
    }

    /// Ask the hub for the current peer list.
    pub async fn sync_hub_information(&self) -> Result<()> {
        self.inner.send_or_queue(HubPdu::HubStatusRq).await
    }

    /// Ask the hub to bridge this peer with `target_peer_id`.
    pub async fn connect_peer(&self, target_peer_id: &str) -> Result<()> {
        self.inner
            .send_or_queue(HubPdu::ConnectPeerRq {
                target_peer_id: target_peer_id.to_string(),
            })
            .await
    }

    /// Peers known from the last status reply.
    pub fn peer_ids(&self) -> Result<BTreeSet<String>> {
        let st = self.inner.state();
        check_connected(&st)?;
        Ok(st.peer_ids.clone())
    }

    /// Requests waiting for the control engine to come back.
    pub fn pending_pdus(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Idle limit of the most recent data session, if any.
    pub fn last_max_idle(&self) -> Option<Duration> {
        self.inner.state().last_max_idle
    }

    /// Stop the control engine and any running data session.
    pub fn disconnect(&self) -> Result<()> {
        {
            let st = self.inner.state();
            if st.local_peer_id.is_none() {
                return Err(Error::NotConnected);
            }
        }
        log::info!("{}: disconnect from hub", self.inner);
        self.inner.shutdown();
        Ok(())
    }
}

impl ControlEngine for Connector {
    fn peer_id(&self) -> Option<String> {
        self.inner.state().local_peer_id.clone()
    }

    fn engine_state(&self) -> EngineState {
        self.inner.state().phase
    }
}

fn check_connected(st: &State) -> Result<()> {
    if st.local_peer_id.is_none() || st.phase == EngineState::Terminated {
        return Err(Error::NotConnected);
    }
    Ok(())
}

impl fmt::Display for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state().local_peer_id {
            Some(id) => write!(f, "peer {}", id),
            None => f.write_str("peer <unregistered>"),
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn local_peer_id(&self) -> String {
        self.state().local_peer_id.clone().unwrap_or_default()
    }

    async fn send_or_queue(&self, pdu: HubPdu) -> Result<()> {
        // holding the writer keeps the engine from going silent under us
        let mut w = self.writer.lock().await;
        {
            let mut st = self.state();
            check_connected(&st)?;
            if st.phase != EngineState::Active {
                log::debug!("engine {}, postpone {}", st.phase, pdu.name());
                st.pending.push_back(pdu);
                return Ok(());
            }
        }
        w.write_pdu(&pdu).await
    }

    fn shutdown(&self) {
        let closer = {
            let mut st = self.state();
            st.local_peer_id = None;
            st.phase = EngineState::Terminated;
            st.pending.clear();
            st.reader = None;
            st.borrow_closer.take()
        };
        self.stop.stop();
        if let Some(closer) = closer {
            closer.stop();
        }
    }

    /// End the connector after an unrecoverable failure and tell the listener.
    fn terminate(&self, err: Error) {
        let (was, closer) = {
            let mut st = self.state();
            let was = st.phase;
            st.phase = EngineState::Terminated;
            (was, st.borrow_closer.take())
        };
        self.stop.stop();
        if let Some(closer) = closer {
            closer.stop();
        }

        if was != EngineState::Terminated {
            log::warn!("{}: connection to hub lost: {}", self, err);
            let lost = match err {
                Error::HubConnectionLost(_) => err,
                e => Error::HubConnectionLost(e.to_string()),
            };
            self.listener.notify_hub_connection_lost(&lost);
        }
    }

    async fn borrow_stream(
        &self,
        reader: PduReader,
        source_peer_id: String,
        target_peer_id: String,
        max_idle_ms: u64,
    ) -> Option<PduReader> {
        let max_idle = Duration::from_millis(max_idle_ms);
        let local = self.local_peer_id();
        let remote = if source_peer_id == local {
            target_peer_id
        } else {
            source_peer_id
        };
        log::debug!(
            "{}: channel clear, bridged with {}, max idle {:?}",
            self,
            remote,
            max_idle
        );

        let (borrow, stream) = BorrowedConnection::start(
            format!("peer {} => hub", local),
            reader,
            self.writer.clone(),
            max_idle,
        );
        {
            let mut st = self.state();
            st.phase = EngineState::Borrowed;
            st.last_max_idle = Some(max_idle);
            st.borrow_closer = Some(borrow.closer());
        }
        if self.stop.is_stopped() {
            borrow.close();
        }

        self.listener.notify_peer_connected(PeerConnection {
            remote_peer_id: remote,
            stream,
        });

        match borrow.join().await {
            Ok(outcome) => {
                log::debug!("{}: data session ended: {:?}", self, outcome.reason);
                let mut st = self.state();
                st.borrow_closer = None;
                st.last_max_idle = Some(outcome.max_idle);
                Some(outcome.reader)
            }
            Err(e) => {
                self.terminate(e);
                None
            }
        }
    }
}

fn start_engine(inner: Arc<Inner>, reader: PduReader) {
    tokio::spawn(read_loop(inner, reader));
}

async fn read_loop(inner: Arc<Inner>, mut reader: PduReader) {
    log::debug!("{}: hub protocol engine running", inner);

    loop {
        let pdu = select! {
            _ = inner.stop.stopped() => {
                log::debug!("{}: hub protocol engine stopped", inner);
                return;
            }
            r = reader.read_pdu() => r,
        };

        match pdu {
            Ok(HubPdu::HubStatusRply { peer_ids }) => {
                log::debug!("{}: hub status, {} peers", inner, peer_ids.len());
                inner.state().peer_ids = peer_ids;
            }
            Ok(HubPdu::SilentRq { wait_duration_ms }) => {
                log::debug!("{}: silent request for {} ms", inner, wait_duration_ms);
                {
                    // wait for a send in progress to complete
                    let _w = inner.writer.lock().await;
                    let mut st = inner.state();
                    st.phase = EngineState::Silent;
                    let window = Duration::from_millis(wait_duration_ms);
                    st.silent_until = Some(
                        Instant::now()
                            .checked_add(window)
                            .unwrap_or_else(|| Instant::now() + FAR_FUTURE),
                    );
                }
                tokio::spawn(hand_off(inner, reader, wait_duration_ms));
                return;
            }
            Ok(HubPdu::ConnectPeerNewConnectionRply { port, peer_id }) => {
                log::debug!(
                    "{}: new connection reply for {} on port {} not supported, ignored",
                    inner,
                    peer_id,
                    port
                );
            }
            Ok(other) => {
                inner.terminate(Error::protocol(format!(
                    "unexpected {} from hub",
                    other.name()
                )));
                return;
            }
            Err(e) => {
                inner.terminate(e);
                return;
            }
        }
    }
}

/// Runs while the engine is silent: confirm the silence, wait for the channel
/// clear, lend the stream out, then resume the engine.
async fn hand_off(inner: Arc<Inner>, mut reader: PduReader, wait_duration_ms: u64) {
    let deadline = inner.state().silent_until.unwrap_or_else(Instant::now);

    if Instant::now() <= deadline {
        log::debug!(
            "{}: send silent reply, remain silent for {} ms",
            inner,
            wait_duration_ms
        );
        let reply = HubPdu::SilentRply { wait_duration_ms };
        if let Err(e) = inner.writer.write_pdu(&reply).await {
            inner.terminate(e);
            return;
        }

        let pdu = select! {
            _ = inner.stop.stopped() => return,
            _ = sleep_until(deadline) => None,
            r = reader.read_pdu() => Some(r),
        };

        match pdu {
            Some(Ok(HubPdu::ChannelClear {
                source_peer_id,
                target_peer_id,
                max_idle_ms,
            })) => {
                reader = match inner
                    .borrow_stream(reader, source_peer_id, target_peer_id, max_idle_ms)
                    .await
                {
                    Some(reader) => reader,
                    None => return,
                };
            }
            Some(Ok(other)) => {
                log::warn!(
                    "{}: expected channel clear, discard {}",
                    inner,
                    other.name()
                );
            }
            Some(Err(e)) => {
                inner.terminate(e);
                return;
            }
            None => log::debug!("{}: silence window passed without channel clear", inner),
        }
    }

    restart(inner, reader).await;
}

/// Flush postponed PDUs in order, then let the engine read again.
async fn restart(inner: Arc<Inner>, reader: PduReader) {
    if inner.stop.is_stopped() {
        return;
    }
    log::debug!("{}: restart hub protocol engine", inner);

    let mut w = inner.writer.lock().await;
    loop {
        let next = {
            let mut st = inner.state();
            match st.pending.pop_front() {
                Some(pdu) => pdu,
                None => {
                    st.phase = EngineState::Active;
                    st.silent_until = None;
                    break;
                }
            }
        };

        log::debug!("{}: send postponed {}", inner, next.name());
        if let Err(e) = w.write_pdu(&next).await {
            drop(w);
            inner.terminate(Error::HubConnectionLost(format!(
                "cannot send postponed pdus: {}",
                e
            )));
            return;
        }
    }
    drop(w);

    start_engine(inner, reader);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::time::{sleep, timeout};

    struct TestListener {
        conns: UnboundedSender<PeerConnection>,
        lost: Mutex<Vec<String>>,
    }

    impl ConnectionListener for TestListener {
        fn notify_peer_connected(&self, conn: PeerConnection) {
            let _ = self.conns.send(conn);
        }

        fn notify_hub_connection_lost(&self, err: &Error) {
            self.lost.lock().unwrap().push(err.to_string());
        }
    }

    struct Fixture {
        connector: Connector,
        hub: StreamPair,
        listener: Arc<TestListener>,
        conns: UnboundedReceiver<PeerConnection>,
    }

    fn fixture() -> Fixture {
        let (a, b) = duplex(64 * 1024);
        let (tx, rx) = unbounded_channel();
        let listener = Arc::new(TestListener {
            conns: tx,
            lost: Mutex::new(vec![]),
        });
        Fixture {
            connector: Connector::new(StreamPair::split(a), listener.clone()),
            hub: StreamPair::split(b),
            listener,
            conns: rx,
        }
    }

    async fn wait_until<F: Fn() -> bool>(f: F) {
        timeout(Duration::from_secs(3), async {
            while !f() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn register(f: &mut Fixture, id: &str) {
        f.connector.connect(id).await.unwrap();
        assert_eq!(
            f.hub.reader.read_pdu().await.unwrap(),
            HubPdu::Register { peer_id: id.into() }
        );
    }

    #[tokio::test]
    async fn test_not_connected() {
        let f = fixture();
        assert!(matches!(
            f.connector.sync_hub_information().await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            f.connector.connect_peer("bob").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(f.connector.peer_ids(), Err(Error::NotConnected)));
        assert!(matches!(f.connector.disconnect(), Err(Error::NotConnected)));
        assert_eq!(f.connector.engine_state(), EngineState::Unregistered);
    }

    #[tokio::test]
    async fn test_connect_and_status() {
        let mut f = fixture();
        register(&mut f, "alice").await;
        assert_eq!(f.connector.peer_id().as_deref(), Some("alice"));
        assert!(f.connector.is_active());

        assert!(matches!(
            f.connector.connect("alice").await,
            Err(Error::AlreadyConnected(_))
        ));

        f.hub
            .writer
            .write_pdu(&HubPdu::HubStatusRply {
                peer_ids: ["bob".to_string(), "carol".to_string()].into(),
            })
            .await
            .unwrap();
        wait_until(|| f.connector.peer_ids().unwrap().len() == 2).await;

        // latest reply replaces the cache
        f.hub
            .writer
            .write_pdu(&HubPdu::HubStatusRply {
                peer_ids: ["dave".to_string()].into(),
            })
            .await
            .unwrap();
        wait_until(|| f.connector.peer_ids().unwrap().contains("dave")).await;
        assert_eq!(f.connector.peer_ids().unwrap().len(), 1);

        f.connector.connect_peer("bob").await.unwrap();
        f.connector.sync_hub_information().await.unwrap();
        assert_eq!(
            f.hub.reader.read_pdu().await.unwrap(),
            HubPdu::ConnectPeerRq {
                target_peer_id: "bob".into()
            }
        );
        assert_eq!(f.hub.reader.read_pdu().await.unwrap(), HubPdu::HubStatusRq);
    }

    #[tokio::test]
    async fn test_silence_borrow_and_replay() {
        let mut f = fixture();
        register(&mut f, "alice").await;

        f.hub
            .writer
            .write_pdu(&HubPdu::SilentRq {
                wait_duration_ms: 500,
            })
            .await
            .unwrap();
        assert_eq!(
            f.hub.reader.read_pdu().await.unwrap(),
            HubPdu::SilentRply {
                wait_duration_ms: 500
            }
        );
        assert_eq!(f.connector.engine_state(), EngineState::Silent);

        // requests made while silent are postponed
        f.connector.sync_hub_information().await.unwrap();
        f.connector.connect_peer("carol").await.unwrap();
        assert_eq!(f.connector.pending_pdus(), 2);

        f.hub
            .writer
            .write_pdu(&HubPdu::ChannelClear {
                source_peer_id: "alice".into(),
                target_peer_id: "bob".into(),
                max_idle_ms: 5000,
            })
            .await
            .unwrap();

        let mut conn = timeout(Duration::from_secs(2), f.conns.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.remote_peer_id, "bob");
        assert_eq!(f.connector.engine_state(), EngineState::Borrowed);
        assert_eq!(f.connector.last_max_idle(), Some(Duration::from_millis(5000)));

        f.hub.writer.write_raw(b"hi bob").await.unwrap();
        let mut buf = [0u8; 6];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi bob");

        conn.stream.write_all(b"yo").await.unwrap();
        let mut raw = [0u8; 2];
        let mut got = 0;
        while got < 2 {
            got += f.hub.reader.read_raw(&mut raw[got..]).await.unwrap();
        }
        assert_eq!(&raw, b"yo");
        assert_eq!(f.connector.pending_pdus(), 2);

        // application closes the data session, queued requests follow in order
        drop(conn);
        assert_eq!(f.hub.reader.read_pdu().await.unwrap(), HubPdu::HubStatusRq);
        assert_eq!(
            f.hub.reader.read_pdu().await.unwrap(),
            HubPdu::ConnectPeerRq {
                target_peer_id: "carol".into()
            }
        );
        wait_until(|| f.connector.is_active()).await;
        assert_eq!(f.connector.pending_pdus(), 0);

        // and the engine reads again
        f.hub
            .writer
            .write_pdu(&HubPdu::HubStatusRply {
                peer_ids: ["bob".to_string()].into(),
            })
            .await
            .unwrap();
        wait_until(|| f.connector.peer_ids().unwrap().contains("bob")).await;
    }

    #[tokio::test]
    async fn test_remote_id_when_target() {
        let mut f = fixture();
        register(&mut f, "bob").await;

        f.hub
            .writer
            .write_pdu(&HubPdu::SilentRq {
                wait_duration_ms: 500,
            })
            .await
            .unwrap();
        f.hub.reader.read_pdu().await.unwrap();
        f.hub
            .writer
            .write_pdu(&HubPdu::ChannelClear {
                source_peer_id: "alice".into(),
                target_peer_id: "bob".into(),
                max_idle_ms: 100,
            })
            .await
            .unwrap();

        let conn = f.conns.recv().await.unwrap();
        assert_eq!(conn.remote_peer_id, "alice");

        // idle release brings the engine back
        wait_until(|| f.connector.is_active()).await;
        drop(conn);
    }

    #[tokio::test]
    async fn test_hand_off_discards_other_pdu() {
        let mut f = fixture();
        register(&mut f, "alice").await;

        f.hub
            .writer
            .write_pdu(&HubPdu::SilentRq {
                wait_duration_ms: 1000,
            })
            .await
            .unwrap();
        f.hub.reader.read_pdu().await.unwrap();
        f.hub
            .writer
            .write_pdu(&HubPdu::HubStatusRply {
                peer_ids: ["x".to_string()].into(),
            })
            .await
            .unwrap();

        wait_until(|| f.connector.is_active()).await;
        assert!(f.connector.peer_ids().unwrap().is_empty());
        assert!(f.listener.lost.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_silence_window_expires() {
        let mut f = fixture();
        register(&mut f, "alice").await;

        f.hub
            .writer
            .write_pdu(&HubPdu::SilentRq {
                wait_duration_ms: 50,
            })
            .await
            .unwrap();
        f.hub.reader.read_pdu().await.unwrap();
        f.connector.sync_hub_information().await.unwrap();

        assert_eq!(f.hub.reader.read_pdu().await.unwrap(), HubPdu::HubStatusRq);
        wait_until(|| f.connector.is_active()).await;
    }

    #[tokio::test]
    async fn test_postponed_flush_failure_terminates() {
        let mut f = fixture();
        register(&mut f, "alice").await;

        f.hub
            .writer
            .write_pdu(&HubPdu::SilentRq {
                wait_duration_ms: 500,
            })
            .await
            .unwrap();
        f.hub.reader.read_pdu().await.unwrap();
        f.connector.sync_hub_information().await.unwrap();
        f.connector.connect_peer("bob").await.unwrap();
        assert_eq!(f.connector.pending_pdus(), 2);

        f.hub
            .writer
            .write_pdu(&HubPdu::ChannelClear {
                source_peer_id: "alice".into(),
                target_peer_id: "bob".into(),
                max_idle_ms: 5000,
            })
            .await
            .unwrap();
        let _conn = timeout(Duration::from_secs(2), f.conns.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.connector.engine_state(), EngineState::Borrowed);

        // hub gone while borrowed: the lease ends and the queued pdus cannot go out
        drop(f.hub);
        wait_until(|| f.connector.engine_state() == EngineState::Terminated).await;

        let lost = f.listener.lost.lock().unwrap().clone();
        assert_eq!(lost.len(), 1);
        assert!(lost[0].contains("postponed"), "{}", lost[0]);
        assert!(matches!(
            f.connector.sync_hub_information().await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(f.connector.peer_ids(), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_unexpected_pdu_terminates() {
        let mut f = fixture();
        register(&mut f, "alice").await;

        f.hub
            .writer
            .write_pdu(&HubPdu::Register {
                peer_id: "mallory".into(),
            })
            .await
            .unwrap();

        wait_until(|| f.connector.engine_state() == EngineState::Terminated).await;
        assert_eq!(f.listener.lost.lock().unwrap().len(), 1);
        assert!(matches!(
            f.connector.sync_hub_information().await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_transport_lost() {
        let mut f = fixture();
        register(&mut f, "alice").await;
        drop(f.hub);

        wait_until(|| f.connector.engine_state() == EngineState::Terminated).await;
        assert_eq!(f.listener.lost.lock().unwrap().len(), 1);
        assert!(matches!(f.connector.peer_ids(), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect() {
        let mut f = fixture();
        register(&mut f, "alice").await;

        f.connector.disconnect().unwrap();
        assert_eq!(f.connector.engine_state(), EngineState::Terminated);
        assert!(matches!(
            f.connector.connect_peer("bob").await,
            Err(Error::NotConnected)
        ));
        assert!(f.listener.lost.lock().unwrap().is_empty());
    }
}
