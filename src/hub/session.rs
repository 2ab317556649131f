use super::registry::Registry;
use crate::borrow::BorrowedConnection;
use crate::engine::{duration_ms, ControlEngine, EngineState, StopSignal};
use crate::error::{Error, Result};
use crate::pdu::HubPdu;
use crate::stream::{PduReader, PduWriter, StreamPair};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct State {
    phase: EngineState,
    /// Parked here while the engine is not reading.
    reader: Option<PduReader>,
    silence_requested: bool,
    silent_rq_during_borrow: Option<u64>,
    resume_timer: Option<JoinHandle<()>>,
}

/// Hub side of one registered peer.
///
/// Owns the peer's stream for the whole registration. The control engine reads
/// from it while active; during a data session a [`BorrowedConnection`] does.
pub struct HubSession {
    peer_id: String,
    writer: PduWriter,
    registry: Arc<dyn Registry>,
    state: Mutex<State>,
    stop: StopSignal,
}

impl fmt::Display for HubSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hub session {}", self.peer_id)
    }
}

impl HubSession {
    /// Read the peer's registration and answer with the hub status.
    ///
    /// The session is not visible to the registry until [`HubSession::start`].
    pub async fn accept(stream: StreamPair, registry: Arc<dyn Registry>) -> Result<Arc<Self>> {
        let StreamPair { mut reader, writer } = stream;

        let peer_id = match reader.read_pdu().await? {
            HubPdu::Register { peer_id } => peer_id,
            other => {
                return Err(Error::protocol(format!(
                    "expected register, got {}",
                    other.name()
                )))
            }
        };
        log::debug!("new connector: {}", peer_id);

        if registry.is_registered(&peer_id) {
            log::info!("already connected: {}", peer_id);
            return Err(Error::AlreadyRegistered(peer_id));
        }

        let session = Arc::new(Self {
            peer_id,
            writer,
            registry,
            state: Mutex::new(State {
                phase: EngineState::Unregistered,
                reader: Some(reader),
                silence_requested: false,
                silent_rq_during_borrow: None,
                resume_timer: None,
            }),
            stop: StopSignal::new(),
        });

        session.send_hub_status().await?;
        Ok(session)
    }

    /// Announce the session to the registry and launch the control engine.
    ///
    /// Fails with [`Error::AlreadyRegistered`] when another session took the
    /// peer id since [`HubSession::accept`]; the engine is not started then.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let reader = {
            let mut st = self.state();
            if st.phase != EngineState::Unregistered {
                return Ok(());
            }
            match st.reader.take() {
                Some(reader) => reader,
                None => return Ok(()),
            }
        };

        if !self.registry.session_started(&self.peer_id, self.clone()) {
            let err = Error::AlreadyRegistered(self.peer_id.clone());
            self.end_session(&err);
            return Err(err);
        }

        {
            let mut st = self.state();
            if st.phase != EngineState::Unregistered {
                // closed while registering
                drop(st);
                self.registry.session_ended(&self.peer_id, self);
                return Err(Error::HubConnectionLost(format!("{} closed", self)));
            }
            st.phase = EngineState::Active;
        }
        start_engine(self.clone(), reader);
        Ok(())
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_silent(&self) -> bool {
        self.state().phase == EngineState::Silent
    }

    /// Ask the connector to go silent for `wait_duration_ms`.
    ///
    /// Only one request is in flight per silence cycle; a request made during a
    /// data session is replayed once control resumes.
    pub async fn silent_rq(self: &Arc<Self>, wait_duration_ms: u64) -> Result<()> {
        let mut w = self.writer.lock().await;
        {
            let mut st = self.state();
            match st.phase {
                EngineState::Borrowed => {
                    log::debug!("{}: data connection running, remember silent request", self);
                    st.silent_rq_during_borrow = Some(wait_duration_ms);
                    return Ok(());
                }
                EngineState::Silent => {
                    log::debug!("{}: already silent", self);
                    return Ok(());
                }
                EngineState::Active if st.silence_requested => {
                    log::debug!("{}: silent request already sent", self);
                    return Ok(());
                }
                EngineState::Active => st.silence_requested = true,
                EngineState::Unregistered | EngineState::Terminated => {
                    return Err(Error::NotConnected)
                }
            }
        }

        log::debug!("{}: send silent request, {} ms", self, wait_duration_ms);
        w.write_pdu(&HubPdu::SilentRq { wait_duration_ms }).await
    }

    /// Send the channel clear and lend the stream to a new borrowed connection.
    ///
    /// The session must be silent.
    pub async fn create_data_connection(
        self: &Arc<Self>,
        remote_peer_id: &str,
        max_idle: Duration,
    ) -> Result<(BorrowedConnection, DuplexStream)> {
        let mut w = self.writer.lock().await;

        let reader = {
            let mut st = self.state();
            if st.phase != EngineState::Silent {
                return Err(Error::NotSilent(self.peer_id.clone()));
            }
            if let Some(timer) = st.resume_timer.take() {
                timer.abort();
            }
            st.phase = EngineState::Borrowed;
            st.reader.take()
        };
        let reader = reader.ok_or_else(|| Error::NotSilent(self.peer_id.clone()))?;

        let clear = HubPdu::ChannelClear {
            source_peer_id: self.peer_id.clone(),
            target_peer_id: remote_peer_id.to_string(),
            max_idle_ms: duration_ms(max_idle),
        };
        log::debug!("{}: send channel clear for {}", self, remote_peer_id);
        if let Err(e) = w.write_pdu(&clear).await {
            drop(w);
            self.end_session(&e);
            return Err(e);
        }
        drop(w);

        Ok(BorrowedConnection::start(
            format!("hub session {} => peer", self.peer_id),
            reader,
            self.writer.clone(),
            max_idle,
        ))
    }

    /// Called when the relay over `borrow` is over. Waits for the borrowed
    /// connection to stop completely, then resumes the control engine.
    pub async fn data_session_ended(self: &Arc<Self>, borrow: BorrowedConnection) -> Result<()> {
        log::debug!("{}: data session ended", self);
        borrow.close();

        let outcome = match borrow.join().await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.end_session(&e);
                return Err(e);
            }
        };
        log::debug!(
            "{}: borrowed connection finished: {:?}",
            self,
            outcome.reason
        );

        let replay = {
            let mut st = self.state();
            if st.phase != EngineState::Borrowed {
                return Ok(());
            }
            st.phase = EngineState::Active;
            st.silence_requested = false;
            st.silent_rq_during_borrow.take()
        };
        start_engine(self.clone(), outcome.reader);

        if let Some(wait_duration_ms) = replay {
            log::debug!("{}: replay silent request from data session", self);
            self.silent_rq(wait_duration_ms).await?;
        }
        Ok(())
    }

    /// Stop the engine, shut the stream down and leave the registry.
    pub async fn close(self: &Arc<Self>) {
        self.end_session(&Error::HubConnectionLost("closed by hub".into()));
        if let Err(e) = self.writer.lock().await.shutdown().await {
            log::debug!("{}: shutdown: {}", self, e);
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    async fn send_hub_status(&self) -> Result<()> {
        // the only place peer ids are compared without case
        let peer_ids: BTreeSet<String> = self
            .registry
            .registered_peer_ids()
            .into_iter()
            .filter(|id| !id.eq_ignore_ascii_case(&self.peer_id))
            .collect();

        log::debug!("{}: send hub status, {} peers", self, peer_ids.len());
        self.writer
            .write_pdu(&HubPdu::HubStatusRply { peer_ids })
            .await
    }

    fn enter_silence(self: &Arc<Self>, reader: PduReader, wait_duration_ms: u64) {
        {
            let mut st = self.state();
            st.phase = EngineState::Silent;
            st.reader = Some(reader);
            st.silence_requested = false;

            let session = self.clone();
            st.resume_timer = Some(tokio::spawn(async move {
                sleep(Duration::from_millis(wait_duration_ms)).await;
                session.resume_after_silence();
            }));
        }
        self.registry.notify_silent(self.clone());
    }

    fn resume_after_silence(self: &Arc<Self>) {
        let reader = {
            let mut st = self.state();
            if st.phase != EngineState::Silent {
                return;
            }
            st.phase = EngineState::Active;
            st.resume_timer = None;
            st.reader.take()
        };

        if let Some(reader) = reader {
            log::debug!("{}: silence ended, restart protocol engine", self);
            start_engine(self.clone(), reader);
        }
        self.registry.silence_expired(self);
    }

    fn end_session(self: &Arc<Self>, err: &Error) {
        let was = {
            let mut st = self.state();
            let was = st.phase;
            st.phase = EngineState::Terminated;
            st.reader = None;
            if let Some(timer) = st.resume_timer.take() {
                timer.abort();
            }
            was
        };
        self.stop.stop();

        if was != EngineState::Terminated {
            log::info!("{}: connection lost: {}", self, err);
            if was != EngineState::Unregistered {
                self.registry.session_ended(&self.peer_id, self);
            }
        }
    }
}

impl ControlEngine for HubSession {
    fn peer_id(&self) -> Option<String> {
        Some(self.peer_id.clone())
    }

    fn engine_state(&self) -> EngineState {
        self.state().phase
    }
}

fn start_engine(session: Arc<HubSession>, reader: PduReader) {
    tokio::spawn(read_loop(session, reader));
}

async fn read_loop(session: Arc<HubSession>, mut reader: PduReader) {
    log::debug!("{}: protocol engine running", session);

    loop {
        let pdu = select! {
            _ = session.stop.stopped() => return,
            r = reader.read_pdu() => r,
        };

        match pdu {
            Ok(HubPdu::HubStatusRq) => {
                if let Err(e) = session.send_hub_status().await {
                    session.end_session(&e);
                    return;
                }
            }
            Ok(HubPdu::ConnectPeerRq { target_peer_id }) => {
                log::debug!("{}: connect request for {}", session, target_peer_id);
                session
                    .registry
                    .connection_request(&target_peer_id, session.clone());
            }
            Ok(HubPdu::SilentRply { wait_duration_ms }) => {
                log::debug!("{}: silent reply, {} ms", session, wait_duration_ms);
                session.enter_silence(reader, wait_duration_ms);
                return;
            }
            Ok(other) => log::warn!("{}: unexpected {}, ignored", session, other.name()),
            Err(e) => {
                session.end_session(&e);
                return;
            }
        }
    }
}
