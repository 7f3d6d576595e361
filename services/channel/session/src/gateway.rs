//! Accepting side: listener, handshake dispatch and the session registry.
//!
//! The gateway runs as one task that owns the [`SessionRegistry`]. Accepted
//! connections read their first packet in their own task and are then handed
//! back to the gateway, which either creates a session or routes the line to
//! the session it rebinds.

use crate::channel::{Channel, Driver};
use crate::error::{Result, SessionError};
use crate::line::{read_handshake, spawn_server_line, Handshake, LineEvent};
use crate::registry::SessionRegistry;
use crate::session::{CloseReason, SessionCore};
use crate::settings::GatewaySettings;
use crate::transport::{configure_stream, listen_tcp};
use anyhow::Context;
use bytes::BytesMut;
use channel_wire::{PacketCodec, PayloadCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Notifications from the gateway to the application
#[derive(Debug)]
pub enum GatewayEvent<P> {
    /// A client created a session
    SessionOpened {
        /// Issued session id
        session_id: u32,
        /// Tag of the binding token the client presented, if any
        tag: Option<String>,
        /// Channel for the new session
        channel: Channel<P>,
    },
    /// A session ended
    SessionClosed {
        /// Session id
        session_id: u32,
        /// Why it ended
        reason: CloseReason,
    },
    /// A binding token expired unused
    BindingTimedOut {
        /// Tag the token was opened for
        tag: String,
    },
}

enum GatewayCommand {
    Handshake {
        stream: TcpStream,
        peer: SocketAddr,
        buffer: BytesMut,
        handshake: Handshake,
    },
    SessionEnded {
        session_id: u32,
        reason: CloseReason,
    },
    OpenBinding {
        tag: String,
        reply: oneshot::Sender<String>,
    },
    Stop {
        listen_only: bool,
    },
}

/// Control handle for a running gateway
#[derive(Debug)]
pub struct GatewayHandle {
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<GatewayCommand>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Issue a binding token for `tag`
    pub async fn open_binding(&self, tag: impl Into<String>) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(GatewayCommand::OpenBinding {
                tag: tag.into(),
                reply,
            })
            .map_err(|_| SessionError::ChannelClosed)?;
        rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    /// Stop accepting; unless `listen_only`, close every session gracefully
    pub fn stop(&self, listen_only: bool) {
        let _ = self.commands.send(GatewayCommand::Stop { listen_only });
    }

    /// Wait for the gateway to finish after [`GatewayHandle::stop`]
    pub async fn join(self) -> anyhow::Result<()> {
        self.task.await.context("gateway task failed")
    }
}

struct SessionEntry<P> {
    line_tx: mpsc::UnboundedSender<LineEvent<P>>,
}

/// Gateway task state
pub struct Gateway<C: PayloadCodec> {
    settings: GatewaySettings,
    codec: Arc<PacketCodec<C>>,
    registry: SessionRegistry<SessionEntry<C::Payload>>,
    listener: Option<TcpListener>,
    commands_tx: mpsc::UnboundedSender<GatewayCommand>,
    events: mpsc::UnboundedSender<GatewayEvent<C::Payload>>,
    shutdown: watch::Sender<bool>,
    stopping: bool,
}

impl<C: PayloadCodec> Gateway<C> {
    /// Bind the listener and start the gateway task
    pub async fn start(
        settings: GatewaySettings,
        codec: PacketCodec<C>,
    ) -> anyhow::Result<(GatewayHandle, mpsc::UnboundedReceiver<GatewayEvent<C::Payload>>)> {
        let listener = listen_tcp(settings.listen)
            .await
            .with_context(|| format!("failed to bind gateway listener on {}", settings.listen))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, token_required = settings.token_required, "Gateway listening");

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let gateway = Self {
            settings,
            codec: Arc::new(codec),
            registry: SessionRegistry::new(),
            listener: Some(listener),
            commands_tx: commands_tx.clone(),
            events: events_tx,
            shutdown,
            stopping: false,
        };
        let task = tokio::spawn(gateway.run(commands_rx));

        let handle = GatewayHandle {
            local_addr,
            commands: commands_tx,
            task,
        };
        Ok((handle, events_rx))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<GatewayCommand>) {
        let sweep_enabled = !self.settings.token_timeout.is_zero();
        let mut sweep = time::interval(self.settings.token_timeout.max(Duration::from_millis(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.stopping && self.registry.is_empty() {
                break;
            }

            tokio::select! {
                result = accept(&self.listener) => match result {
                    Ok((stream, peer)) => self.spawn_handshake(stream, peer),
                    Err(e) => warn!(error = %e, "Accept failed"),
                },

                Some(command) = commands.recv() => self.on_command(command),

                _ = sweep.tick(), if sweep_enabled => {
                    let expired = self
                        .registry
                        .sweep_bindings(Instant::now(), self.settings.token_timeout);
                    for tag in expired {
                        debug!(%tag, "Binding token expired");
                        let _ = self.events.send(GatewayEvent::BindingTimedOut { tag });
                    }
                }
            }
        }

        info!("Gateway stopped");
    }

    fn spawn_handshake(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = configure_stream(&stream) {
            warn!(%peer, error = %e, "Failed to configure accepted stream");
        }
        debug!(%peer, "Accepted connection");

        let codec = Arc::clone(&self.codec);
        let commands = self.commands_tx.clone();
        let timeout = self.settings.handshake_timeout;

        tokio::spawn(async move {
            let mut stream = stream;
            let mut buffer = BytesMut::with_capacity(8 * 1024);
            match time::timeout(timeout, read_handshake(&mut stream, &*codec, &mut buffer)).await {
                Ok(Ok(handshake)) => {
                    let _ = commands.send(GatewayCommand::Handshake {
                        stream,
                        peer,
                        buffer,
                        handshake,
                    });
                }
                Ok(Err(e)) => debug!(%peer, error = %e, "Handshake failed"),
                Err(_) => debug!(%peer, ?timeout, "Handshake timed out"),
            }
        });
    }

    fn on_command(&mut self, command: GatewayCommand) {
        match command {
            GatewayCommand::Handshake {
                stream,
                peer,
                buffer,
                handshake,
            } => match handshake {
                Handshake::Create { .. } => self.create_session(stream, peer, buffer, handshake),
                Handshake::Rebind { session_id, .. } => match self.registry.get(session_id) {
                    Some(entry) => {
                        debug!(%peer, session_id, line_index = handshake.line_index(), "Routing rebind");
                        spawn_server_line(
                            stream,
                            buffer,
                            handshake,
                            Arc::clone(&self.codec),
                            entry.line_tx.clone(),
                        );
                    }
                    None => {
                        debug!(%peer, session_id, "Rebind for unknown session; closing line");
                    }
                },
            },
            GatewayCommand::SessionEnded { session_id, reason } => {
                self.registry.unregister(session_id);
                info!(session_id, %reason, remaining = self.registry.len(), "Session unregistered");
                let _ = self
                    .events
                    .send(GatewayEvent::SessionClosed { session_id, reason });
            }
            GatewayCommand::OpenBinding { tag, reply } => {
                let token = self.registry.open_binding(tag, Instant::now());
                let _ = reply.send(token);
            }
            GatewayCommand::Stop { listen_only } => {
                info!(listen_only, sessions = self.registry.len(), "Gateway stopping");
                self.listener = None;
                self.stopping = true;
                if !listen_only {
                    self.shutdown.send_replace(true);
                }
            }
        }
    }

    fn create_session(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        buffer: BytesMut,
        handshake: Handshake,
    ) {
        if self.stopping {
            debug!(%peer, "Gateway stopping; refusing create");
            return;
        }

        let tag = match &handshake {
            Handshake::Create { token } => self.registry.take_binding(token),
            Handshake::Rebind { .. } => None,
        };
        if self.settings.token_required && tag.is_none() {
            warn!(%peer, "Create with unknown token; closing line");
            return;
        }

        let session_id = self.registry.issue_session_id();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let core = SessionCore::responder(session_id, self.settings.session.clone());
        let (driver, channel) = Driver::new(
            core,
            Arc::clone(&self.codec),
            None,
            self.settings.session.tick_interval,
            line_tx.clone(),
            line_rx,
        );
        let driver = driver.close_on(self.shutdown.subscribe());

        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let reason = driver.run().await;
            if commands
                .send(GatewayCommand::SessionEnded { session_id, reason })
                .is_err()
            {
                error!(session_id, "Gateway gone before session ended");
            }
        });

        spawn_server_line(stream, buffer, handshake, Arc::clone(&self.codec), line_tx.clone());
        self.registry.register(session_id, SessionEntry { line_tx });
        info!(%peer, session_id, tag = ?tag, "Session opened");

        let _ = self.events.send(GatewayEvent::SessionOpened {
            session_id,
            tag,
            channel,
        });
    }
}

async fn accept(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
