//! Sessions that survive the loss of their underlying TCP connection.
//!
//! A session carries ordered, acknowledged application payloads between a
//! client and a gateway. The connection under it (a *line*) may drop at any
//! time; the client rebinds a fresh line, both sides resend whatever the peer
//! has not acknowledged, and the application sees one uninterrupted stream.
//!
//! ## Features
//!
//! - **Create / Rebind handshakes**: one request/response pair per line
//! - **Reliable delivery**: message ids, cumulative acks, resend on rebind
//! - **Graceful close**: FIN / FIN-ACK with TIME-WAIT
//! - **Liveness**: PING/PONG with smoothed RTT, offline timeout, rebind pacing
//! - **Gateway**: session registry and single-use binding tokens
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use channel_session::{ChannelEvent, ClientSettings, Gateway, GatewayEvent, GatewaySettings, SessionClient};
//! use channel_wire::PacketCodec;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (gateway, mut events) = Gateway::start(GatewaySettings::default(), PacketCodec::default()).await?;
//! tokio::spawn(async move {
//!     while let Some(GatewayEvent::SessionOpened { mut channel, .. }) = events.recv().await {
//!         tokio::spawn(async move {
//!             while let Some(ChannelEvent::Received(payload)) = channel.recv().await {
//!                 let _ = channel.send(payload);
//!             }
//!         });
//!     }
//! });
//!
//! let client = SessionClient::new(PacketCodec::default(), ClientSettings::default());
//! let mut channel = client.connect(gateway.local_addr(), "").await?;
//! channel.send(Bytes::from_static(b"hello"))?;
//! if let Some(ChannelEvent::Received(echo)) = channel.recv().await {
//!     println!("echo: {:?}", echo);
//! }
//! channel.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod client;
pub mod close;
pub mod error;
pub mod gateway;
pub mod keepalive;
pub mod line;
pub mod liveness;
pub mod registry;
pub mod reliability;
pub mod session;
pub mod settings;
pub mod timer;
pub mod transport;

// Re-export main types
pub use channel::{Channel, ChannelEvent, ChannelStatus};
pub use client::SessionClient;
pub use close::{CloseAction, CloseMachine, CloseState};
pub use error::{Result, SessionError};
pub use gateway::{Gateway, GatewayEvent, GatewayHandle};
pub use keepalive::{now_ticks, rtt_from_ticks, smooth_rtt, Keepalive};
pub use line::{Handshake, Line, LineCloseReason, LineEvent, LineHandle, LineId};
pub use liveness::{Liveness, LivenessEvent};
pub use registry::SessionRegistry;
pub use reliability::{Receipt, RecvState, ReliableState, SendState};
pub use session::{CloseReason, Phase, Role, SessionCore, SessionOutput};
pub use settings::{ClientSettings, GatewaySettings, RebindLimits, SessionSettings};
pub use transport::{connect_tcp, listen_tcp};
