//! Connecting side of a session channel.

use crate::channel::{Channel, Driver};
use crate::error::{Result, SessionError};
use crate::line::{spawn_client_line, Handshake};
use crate::session::SessionCore;
use crate::settings::ClientSettings;
use channel_wire::{PacketCodec, PayloadCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Opens sessions to a gateway
#[derive(Debug, Clone)]
pub struct SessionClient<C> {
    codec: Arc<PacketCodec<C>>,
    settings: ClientSettings,
}

impl<C: PayloadCodec> SessionClient<C> {
    /// Client using `codec` for every session it opens
    pub fn new(codec: PacketCodec<C>, settings: ClientSettings) -> Self {
        Self {
            codec: Arc::new(codec),
            settings,
        }
    }

    /// Settings in use
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Create a session at `addr`.
    ///
    /// Resolves once the server answers the create request. Fails with
    /// [`SessionError::ConnectFailed`] if the creating line closes first or
    /// the handshake exceeds `connect_timeout`.
    pub async fn connect(&self, addr: SocketAddr, token: &str) -> Result<Channel<C::Payload>> {
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let line = spawn_client_line(
            addr,
            Handshake::Create {
                token: token.to_string(),
            },
            Arc::clone(&self.codec),
            line_tx.clone(),
        );

        let core = SessionCore::initiator(self.settings.clone(), line);
        let (driver, channel) = Driver::new(
            core,
            Arc::clone(&self.codec),
            Some(addr),
            self.settings.session.tick_interval,
            line_tx,
            line_rx,
        );
        let (connected_tx, connected_rx) = oneshot::channel();
        tokio::spawn(driver.notify_connected(connected_tx).run());

        let session_id = match tokio::time::timeout(self.settings.connect_timeout, connected_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(SessionError::ChannelClosed),
            Err(_) => {
                warn!(%addr, timeout = ?self.settings.connect_timeout, "Create handshake timed out");
                channel.abort();
                return Err(SessionError::ConnectFailed("handshake timed out".to_string()));
            }
        };

        info!(%addr, session_id, "Session channel connected");
        Ok(channel)
    }
}
