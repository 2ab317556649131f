use hubrelay::connector::{ConnectionListener, Connector, PeerConnection};
use hubrelay::hub::{Hub, HubConfig};
use hubrelay::stream::StreamPair;
use hubrelay::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

#[derive(StructOpt, Debug)]
#[structopt(name = "hubrelay")]
enum Opt {
    Hub(HubOpt),
    Peer(PeerOpt),
}

#[derive(StructOpt, Debug)]
struct HubOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:8888")]
    listen_addr: SocketAddr,

    #[structopt(long = "max-idle-secs", default_value = "60")]
    max_idle_secs: u64,

    #[structopt(long = "silence-ms", default_value = "5000")]
    silence_ms: u64,
}

#[derive(StructOpt, Debug)]
struct PeerOpt {
    #[structopt(long = "id")]
    id: String,

    #[structopt(long = "hub-addr")]
    hub_addr: String,

    #[structopt(long = "remote-peer")]
    remote_peer: Option<String>,
}

enum Event {
    Connected(PeerConnection),
    Lost(String),
}

struct PeerListener {
    events: UnboundedSender<Event>,
}

impl ConnectionListener for PeerListener {
    fn notify_peer_connected(&self, conn: PeerConnection) {
        let _ = self.events.send(Event::Connected(conn));
    }

    fn notify_hub_connection_lost(&self, err: &Error) {
        let _ = self.events.send(Event::Lost(err.to_string()));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Hub(opt) => run_hub(opt).await,
        Opt::Peer(opt) => run_peer(opt).await,
    }
}

async fn run_hub(opt: HubOpt) -> Result<()> {
    let config = HubConfig {
        listen_addr: opt.listen_addr,
        max_idle: Duration::from_secs(opt.max_idle_secs),
        silence: Duration::from_millis(opt.silence_ms),
        ..Default::default()
    };
    Hub::new(config).await?.run().await
}

async fn run_peer(opt: PeerOpt) -> Result<()> {
    let stream = TcpStream::connect(opt.hub_addr.as_str()).await?;
    let (tx, mut rx) = unbounded_channel();
    let c = Connector::new(
        StreamPair::from_tcp(stream),
        Arc::new(PeerListener { events: tx }),
    );

    c.connect(&opt.id).await?;
    c.sync_hub_information().await?;
    if let Some(peer) = opt.remote_peer.as_deref() {
        c.connect_peer(peer).await?;
    }

    let mut status = tokio::time::interval(Duration::from_secs(30));
    loop {
        select! {
            _ = status.tick() => {
                c.sync_hub_information().await?;
                println!("peers: {:?}", c.peer_ids()?);
            }
            event = rx.recv() => match event {
                Some(Event::Connected(mut conn)) => {
                    println!("connected with {}", conn.remote_peer_id);
                    let greeting = format!("hello from {}\n", opt.id);
                    tokio::spawn(async move {
                        if let Err(e) = conn.stream.write_all(greeting.as_bytes()).await {
                            log::debug!("write to {}: {}", conn.remote_peer_id, e);
                            return;
                        }
                        let mut out = tokio::io::stdout();
                        if let Err(e) = tokio::io::copy(&mut conn.stream, &mut out).await {
                            log::debug!("read from {}: {}", conn.remote_peer_id, e);
                        }
                        println!("data session with {} ended", conn.remote_peer_id);
                    });
                }
                Some(Event::Lost(reason)) => {
                    return Err(Error::HubConnectionLost(reason));
                }
                None => return Ok(()),
            },
        }
    }
}
