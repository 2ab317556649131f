//! Hub side.
//!
//! use [`Hub`] to run a tcp hub with the in-memory [`PeerRegistry`].
//!
//! use [`HubSession`] directly to serve connectors over any other transport.

mod registry;
mod session;

pub use registry::{PeerRegistry, Registry};
pub use session::HubSession;

use crate::error::Result;
use crate::stream::StreamPair;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::{task, time::timeout};

/// Default idle limit of a data session.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);

/// Default silence window negotiated before a data session.
pub const DEFAULT_SILENCE: Duration = Duration::from_secs(5);

const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen_addr: SocketAddr,
    pub max_idle: Duration,
    pub silence: Duration,
    /// Period of the registered peers log line, zero turns it off.
    pub status_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8888).into(),
            max_idle: DEFAULT_MAX_IDLE,
            silence: DEFAULT_SILENCE,
            status_interval: Duration::from_secs(30),
        }
    }
}

/// Tcp hub
///
/// accepts connectors, keeps one [`HubSession`] per registered peer, and bridges
/// peers on request.
pub struct Hub {
    listener: TcpListener,
    registry: Arc<PeerRegistry>,
    config: HubConfig,
}

impl Hub {
    pub async fn new(config: HubConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;

        Ok(Self {
            listener,
            registry: Arc::new(PeerRegistry::new(config.max_idle, config.silence)),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    pub async fn run(self) -> Result<()> {
        log::info!(
            "hub listening on {}, max idle {:?}",
            self.listener.local_addr()?,
            self.config.max_idle
        );

        if !self.config.status_interval.is_zero() {
            let registry = Arc::downgrade(&self.registry);
            let period = self.config.status_interval;
            task::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match registry.upgrade() {
                        Some(r) => r.log_status(),
                        None => break,
                    }
                }
            });
        }

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    log::warn!("cannot accept tcp connections, give up: {}", e);
                    return Err(e.into());
                }
            };
            log::debug!("new tcp connection from {}", addr);

            if let Err(e) = enable_keepalive(&stream) {
                log::debug!("keepalive on {}: {}", addr, e);
            }

            let registry: Arc<dyn Registry> = self.registry.clone();
            task::spawn(async move {
                let accepted = timeout(
                    REGISTER_TIMEOUT,
                    HubSession::accept(StreamPair::from_tcp(stream), registry),
                )
                .await;

                match accepted {
                    Ok(Ok(session)) => {
                        if let Err(e) = session.start() {
                            log::info!("connector {} rejected: {}", addr, e);
                            session.close().await;
                        }
                    }
                    Ok(Err(e)) => log::info!("connector {} rejected: {}", addr, e),
                    Err(_) => log::info!("connector {} did not register in time", addr),
                }
            });
        }
    }
}

fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::HubPdu;

    #[tokio::test]
    async fn test_hub_accepts_registration() {
        let hub = Hub::new(HubConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();
        let addr = hub.local_addr().unwrap();
        let registry = hub.registry();
        tokio::spawn(hub.run());

        let mut peer = StreamPair::from_tcp(TcpStream::connect(addr).await.unwrap());
        peer.writer
            .write_pdu(&HubPdu::Register {
                peer_id: "alice".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            peer.reader.read_pdu().await.unwrap(),
            HubPdu::HubStatusRply {
                peer_ids: Default::default()
            }
        );

        while !registry.is_registered("alice") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(peer);
        while registry.is_registered("alice") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_default_config() {
        let c = HubConfig::default();
        assert_eq!(c.listen_addr.port(), 8888);
        assert_eq!(c.max_idle, DEFAULT_MAX_IDLE);
        assert_eq!(c.silence, DEFAULT_SILENCE);
    }
}
