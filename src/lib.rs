//!A rendezvous hub that bridges peers over the connection they already hold.
//!
//!Peers behind NAT, firewalls or an anonymity network often can open exactly one outbound
//!connection, to the hub. This crate lets that single connection carry both the hub's control
//!protocol and, on demand, a raw data channel to another peer.
//!
//!## How it works
//!Each peer runs a [`connector::Connector`] on its hub connection and registers with a peer id.
//!The hub keeps one [`hub::HubSession`] per registered peer.
//!
//!When a peer asks to be connected to another, the hub's registry asks both sessions to become
//!silent. Each connector confirms, stops reading control messages, and waits for a channel clear.
//!The hub then sends the channel clear to both and from that moment the stream carries raw bytes:
//!both ends lend it to a [`borrow::BorrowedConnection`], and the hub splices the two peers
//!together. After no byte crossed for the negotiated idle time, or when the application closes
//!its endpoint, the lease ends and the control protocol resumes on the very same stream.
//!Requests made in the meantime are queued and sent once control is back.
//!
//!Only one party ever reads a stream at a time, the [`stream::PduReader`] is moved between
//!the control engine and the borrowed connection.
//!
//!## Feature flags
//!The crate includes both the connector and the hub by default.
//!
//!```toml
//!hubrelay = { version = "0.1", default-features=false, features=["connector"]}
//!```
//!
//!- `connector`: peer side
//!- `hub`: hub sessions, in-memory registry and tcp hub

pub mod borrow;
#[cfg(feature = "connector")]
pub mod connector;
pub mod engine;
mod error;
#[cfg(feature = "hub")]
pub mod hub;
pub mod pdu;
pub mod stream;

pub use error::{Error, Result};
