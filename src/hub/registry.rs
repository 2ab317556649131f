use super::session::HubSession;
use crate::engine::duration_ms;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::copy_bidirectional;

/// What a hub session needs from the rest of the hub.
///
/// Sessions call these from their own tasks, implementations must not block.
pub trait Registry: Send + Sync {
    fn is_registered(&self, peer_id: &str) -> bool;

    /// Register `session` under `peer_id`. Returns false, and keeps the
    /// registry unchanged, when the id is taken already.
    fn session_started(&self, peer_id: &str, session: Arc<HubSession>) -> bool;

    fn session_ended(&self, peer_id: &str, session: &Arc<HubSession>);

    fn registered_peer_ids(&self) -> BTreeSet<String>;

    /// `requester` wants a data channel to `target_peer_id`.
    fn connection_request(&self, target_peer_id: &str, requester: Arc<HubSession>);

    /// `session` confirmed silence, its stream may be borrowed now.
    fn notify_silent(&self, session: Arc<HubSession>);

    /// The silence window of `session` passed without a data connection.
    fn silence_expired(&self, _session: &Arc<HubSession>) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectionRequest {
    requester: String,
    target: String,
}

impl ConnectionRequest {
    fn involves(&self, a: &str, b: &str) -> bool {
        (self.requester == a && self.target == b) || (self.requester == b && self.target == a)
    }

    fn other(&self, peer_id: &str) -> Option<&str> {
        if self.requester == peer_id {
            Some(&self.target)
        } else if self.target == peer_id {
            Some(&self.requester)
        } else {
            None
        }
    }
}

type PeerMap = Mutex<HashMap<String, Arc<HubSession>>>;

/// In-memory registry and matcher.
///
/// A connection request silences both peers; once both sessions report silence
/// their streams are borrowed and spliced together until either side releases.
pub struct PeerRegistry {
    peers: PeerMap,
    requests: Mutex<Vec<ConnectionRequest>>,
    max_idle: Duration,
    silence: Duration,
}

impl PeerRegistry {
    pub fn new(max_idle: Duration, silence: Duration) -> Self {
        Self {
            peers: Default::default(),
            requests: Default::default(),
            max_idle,
            silence,
        }
    }

    pub fn session(&self, peer_id: &str) -> Option<Arc<HubSession>> {
        self.peers.lock().unwrap().get(peer_id).cloned()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn log_status(&self) {
        let peers = self.registered_peer_ids();
        log::info!("registered peers: {:?}", peers);
        let requests = self.requests.lock().unwrap();
        if !requests.is_empty() {
            log::info!(
                "connection requests: {}",
                requests
                    .iter()
                    .map(|r| format!("{} -> {}", r.requester, r.target))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }
}

impl Registry for PeerRegistry {
    fn is_registered(&self, peer_id: &str) -> bool {
        self.peers.lock().unwrap().contains_key(peer_id)
    }

    fn session_started(&self, peer_id: &str, session: Arc<HubSession>) -> bool {
        match self.peers.lock().unwrap().entry(peer_id.to_string()) {
            Entry::Occupied(_) => {
                log::info!("peer {} registered twice, keep first session", peer_id);
                false
            }
            Entry::Vacant(slot) => {
                log::info!("new peer {}", peer_id);
                slot.insert(session);
                true
            }
        }
    }

    fn session_ended(&self, peer_id: &str, session: &Arc<HubSession>) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(p) = peers.get(peer_id) {
            if Arc::ptr_eq(p, session) {
                peers.remove(peer_id);
                log::info!("peer {} gone", peer_id);
            }
        }
        self.requests
            .lock()
            .unwrap()
            .retain(|r| r.requester != peer_id && r.target != peer_id);
    }

    fn registered_peer_ids(&self) -> BTreeSet<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    fn connection_request(&self, target_peer_id: &str, requester: Arc<HubSession>) {
        let source = requester.peer_id().to_string();
        log::debug!("{} wants to connect {}", source, target_peer_id);

        if source == target_peer_id {
            log::debug!("{} asked for itself, ignored", source);
            return;
        }
        let target = match self.session(target_peer_id) {
            Some(s) => s,
            None => {
                log::debug!("target {} not found", target_peer_id);
                return;
            }
        };

        {
            let mut requests = self.requests.lock().unwrap();
            if !requests.iter().any(|r| r.involves(&source, target_peer_id)) {
                requests.push(ConnectionRequest {
                    requester: source,
                    target: target_peer_id.to_string(),
                });
            }
        }

        let silence_ms = duration_ms(self.silence);
        tokio::spawn(async move {
            for session in [requester, target] {
                if let Err(e) = session.silent_rq(silence_ms).await {
                    log::debug!("{}: silent request failed: {}", session, e);
                }
            }
        });
    }

    fn notify_silent(&self, session: Arc<HubSession>) {
        let other = {
            let peers = self.peers.lock().unwrap();
            let mut requests = self.requests.lock().unwrap();

            let found = requests.iter().enumerate().find_map(|(i, r)| {
                r.other(session.peer_id())
                    .and_then(|o| peers.get(o))
                    .filter(|s| s.is_silent())
                    .map(|s| (i, s.clone()))
            });
            found.map(|(i, s)| {
                requests.remove(i);
                s
            })
        };

        if let Some(other) = other {
            tokio::spawn(bridge(session, other, self.max_idle));
        }
    }

    fn silence_expired(&self, session: &Arc<HubSession>) {
        let peer_id = session.peer_id();
        let mut requests = self.requests.lock().unwrap();
        let before = requests.len();
        requests.retain(|r| r.other(peer_id).is_none());
        if requests.len() != before {
            log::debug!(
                "{} silent in vain, drop {} connection request(s)",
                peer_id,
                before - requests.len()
            );
        }
    }
}

/// Splice the streams of two silent sessions until the data session ends.
async fn bridge(a: Arc<HubSession>, b: Arc<HubSession>, max_idle: Duration) {
    log::info!("bridge {} <-> {}", a.peer_id(), b.peer_id());

    let (borrow_a, mut stream_a) = match a.create_data_connection(b.peer_id(), max_idle).await {
        Ok(x) => x,
        Err(e) => {
            log::warn!("cannot open data connection to {}: {}", a.peer_id(), e);
            return;
        }
    };
    let (borrow_b, mut stream_b) = match b.create_data_connection(a.peer_id(), max_idle).await {
        Ok(x) => x,
        Err(e) => {
            log::warn!("cannot open data connection to {}: {}", b.peer_id(), e);
            drop(stream_a);
            if let Err(e) = a.data_session_ended(borrow_a).await {
                log::warn!("{}: {}", a, e);
            }
            return;
        }
    };

    match copy_bidirectional(&mut stream_a, &mut stream_b).await {
        Ok((ab, ba)) => log::debug!(
            "data session {} <-> {} done, {} / {} bytes",
            a.peer_id(),
            b.peer_id(),
            ab,
            ba
        ),
        Err(e) => log::debug!(
            "data session {} <-> {} ended: {}",
            a.peer_id(),
            b.peer_id(),
            e
        ),
    }
    drop(stream_a);
    drop(stream_b);

    let (ra, rb) = tokio::join!(a.data_session_ended(borrow_a), b.data_session_ended(borrow_b));
    for (session, r) in [(&a, ra), (&b, rb)] {
        if let Err(e) = r {
            log::warn!("{}: {}", session, e);
        }
    }
}
