//! Application-facing channel and the task that drives one session.
//!
//! Every session runs in a single [`Driver`] task that owns its
//! [`SessionCore`]. Line tasks, the tick timer and the application all reach
//! the session only through the driver's mailboxes, so session state is
//! never shared across tasks.

use crate::close::CloseState;
use crate::error::{Result, SessionError};
use crate::line::{spawn_client_line, Handshake, LineCloseReason, LineEvent, LineHandle};
use crate::session::{CloseReason, SessionCore, SessionOutput};
use channel_wire::{CodecError, PacketCodec, PayloadCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Notifications delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent<P> {
    /// In-order payload from the peer
    Received(P),
    /// Close state moved
    CloseStateChanged(CloseState),
    /// The session ended; no events follow
    Closed(CloseReason),
}

/// Snapshot of a session's observable state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Session id, 0 until created
    pub session_id: u32,
    /// Whether a session was established
    pub connected: bool,
    /// Close machine state
    pub close_state: CloseState,
    /// Smoothed round-trip time
    pub srtt: Option<Duration>,
    /// Set once the session has ended
    pub closed: Option<CloseReason>,
}

pub(crate) enum ChannelCommand<P> {
    Send(P),
    Close,
    Abort,
}

type PayloadCheck<P> = Arc<dyn Fn(&P) -> std::result::Result<(), CodecError> + Send + Sync>;

/// Handle to one session.
///
/// Dropping the channel closes the session gracefully.
pub struct Channel<P> {
    check: PayloadCheck<P>,
    commands: mpsc::UnboundedSender<ChannelCommand<P>>,
    events: mpsc::UnboundedReceiver<ChannelEvent<P>>,
    status: watch::Receiver<ChannelStatus>,
}

impl<P> std::fmt::Debug for Channel<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl<P> Channel<P> {
    /// Session id
    pub fn session_id(&self) -> u32 {
        self.status.borrow().session_id
    }

    /// Current status snapshot
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Smoothed round-trip time, once a probe has completed
    pub fn srtt(&self) -> Option<Duration> {
        self.status.borrow().srtt
    }

    /// Close machine state
    pub fn close_state(&self) -> CloseState {
        self.status.borrow().close_state
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.status.borrow().closed.is_some()
    }

    /// Queue a payload for reliable delivery.
    ///
    /// Fails with [`SessionError::ChannelClosed`] once the session has ended,
    /// and with [`SessionError::Codec`] for a payload the codec cannot fit in
    /// one packet. Payloads sent after a local close has started are dropped.
    pub fn send(&self, payload: P) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::ChannelClosed);
        }
        (self.check)(&payload)?;
        self.commands
            .send(ChannelCommand::Send(payload))
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Start the graceful close handshake
    pub fn close(&self) {
        let _ = self.commands.send(ChannelCommand::Close);
    }

    /// Next event; `None` once the session task is gone and every event was read
    pub async fn recv(&mut self) -> Option<ChannelEvent<P>> {
        self.events.recv().await
    }

    /// Wait until the session has ended
    pub async fn closed(&mut self) -> Option<CloseReason> {
        let status = self
            .status
            .wait_for(|s| s.closed.is_some())
            .await
            .ok()?;
        status.closed
    }

    pub(crate) fn abort(&self) {
        let _ = self.commands.send(ChannelCommand::Abort);
    }
}

/// Task owning one [`SessionCore`]
pub(crate) struct Driver<C: PayloadCodec> {
    core: SessionCore<C::Payload, LineHandle<C::Payload>>,
    codec: Arc<PacketCodec<C>>,
    remote: Option<SocketAddr>,
    tick_interval: Duration,
    line_tx: mpsc::UnboundedSender<LineEvent<C::Payload>>,
    line_rx: mpsc::UnboundedReceiver<LineEvent<C::Payload>>,
    commands: mpsc::UnboundedReceiver<ChannelCommand<C::Payload>>,
    events: mpsc::UnboundedSender<ChannelEvent<C::Payload>>,
    status: watch::Sender<ChannelStatus>,
    connected: Option<oneshot::Sender<Result<u32>>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<C: PayloadCodec> Driver<C> {
    /// Wrap `core`; `remote` is where rebinding lines dial, initiators only
    pub(crate) fn new(
        core: SessionCore<C::Payload, LineHandle<C::Payload>>,
        codec: Arc<PacketCodec<C>>,
        remote: Option<SocketAddr>,
        tick_interval: Duration,
        line_tx: mpsc::UnboundedSender<LineEvent<C::Payload>>,
        line_rx: mpsc::UnboundedReceiver<LineEvent<C::Payload>>,
    ) -> (Self, Channel<C::Payload>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus {
            session_id: core.session_id(),
            ..ChannelStatus::default()
        });

        let check_codec = Arc::clone(&codec);
        let driver = Self {
            core,
            codec,
            remote,
            tick_interval: tick_interval.max(Duration::from_millis(1)),
            line_tx,
            line_rx,
            commands: commands_rx,
            events: events_tx,
            status: status_tx,
            connected: None,
            shutdown: None,
        };
        let channel = Channel {
            check: Arc::new(move |payload: &C::Payload| check_codec.check_payload(payload)),
            commands: commands_tx,
            events: events_rx,
            status: status_rx,
        };
        (driver, channel)
    }

    /// Report the outcome of the create handshake on `tx`
    pub(crate) fn notify_connected(mut self, tx: oneshot::Sender<Result<u32>>) -> Self {
        self.connected = Some(tx);
        self
    }

    /// Close gracefully once `shutdown` turns true
    pub(crate) fn close_on(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Run until the session is closed
    pub(crate) async fn run(mut self) -> CloseReason {
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();
        let mut commands_open = true;

        loop {
            if let Some(reason) = self.drain_outputs() {
                return reason;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.core.update(now.duration_since(last_tick));
                    last_tick = now;
                }

                Some(event) = self.line_rx.recv() => self.on_line_event(event),

                command = self.commands.recv(), if commands_open => match command {
                    Some(ChannelCommand::Send(payload)) => {
                        if let Err(e) = self.core.send(payload) {
                            debug!(session_id = self.core.session_id(), error = %e, "Send after close");
                        }
                    }
                    Some(ChannelCommand::Close) => self.core.close(),
                    Some(ChannelCommand::Abort) => self.core.close_immediately(CloseReason::Aborted),
                    None => {
                        debug!(session_id = self.core.session_id(), "Channel dropped; closing");
                        commands_open = false;
                        self.core.close();
                    }
                },

                _ = shutdown_requested(&mut self.shutdown) => {
                    debug!(session_id = self.core.session_id(), "Shutdown requested; closing");
                    self.shutdown = None;
                    self.core.close();
                }
            }
        }
    }

    fn on_line_event(&mut self, event: LineEvent<C::Payload>) {
        match event {
            LineEvent::Accepted { line, handshake } => match handshake {
                Handshake::Create { .. } => self.core.attach_created(line),
                Handshake::Rebind { client_ack, .. } => self.core.attach_rebind(line, client_ack),
            },
            LineEvent::Created { line, session_id } => self.core.on_line_created(line, session_id),
            LineEvent::Rebound { line, server_ack } => self.core.on_line_rebound(line, server_ack),
            LineEvent::Received { line, packet } => self.core.on_packet(line, packet),
            LineEvent::Closed { line, reason } => {
                debug!(session_id = self.core.session_id(), line = %line, %reason, "Line closed");
                self.core.on_line_closed(line);
                // Resending on the next line would fail the same way
                if let LineCloseReason::Unencodable(e) = reason {
                    warn!(session_id = self.core.session_id(), error = %e, "Closing session with unencodable packet");
                    self.core.close_immediately(CloseReason::Unencodable);
                }
            }
        }
    }

    fn drain_outputs(&mut self) -> Option<CloseReason> {
        while let Some(output) = self.core.poll_output() {
            match output {
                SessionOutput::Connected { session_id } => {
                    self.status.send_modify(|s| {
                        s.session_id = session_id;
                        s.connected = true;
                    });
                    if let Some(tx) = self.connected.take() {
                        let _ = tx.send(Ok(session_id));
                    }
                }
                SessionOutput::Delivered(payload) => {
                    let _ = self.events.send(ChannelEvent::Received(payload));
                }
                SessionOutput::CloseStateChanged(state) => {
                    self.status.send_modify(|s| s.close_state = state);
                    let _ = self.events.send(ChannelEvent::CloseStateChanged(state));
                }
                SessionOutput::RttUpdated(srtt) => {
                    trace!(session_id = self.core.session_id(), ?srtt, "SRTT updated");
                    self.status.send_modify(|s| s.srtt = Some(srtt));
                }
                SessionOutput::OpenRebindLine {
                    session_id,
                    line_index,
                    client_ack,
                } => {
                    if let Some(addr) = self.remote {
                        let line = spawn_client_line(
                            addr,
                            Handshake::Rebind {
                                session_id,
                                line_index,
                                client_ack,
                            },
                            Arc::clone(&self.codec),
                            self.line_tx.clone(),
                        );
                        self.core.bind_pending(line);
                    }
                }
                SessionOutput::Closed(reason) => {
                    self.status.send_modify(|s| s.closed = Some(reason));
                    if let Some(tx) = self.connected.take() {
                        let _ = tx.send(Err(SessionError::ConnectFailed(reason.to_string())));
                    }
                    let _ = self.events.send(ChannelEvent::Closed(reason));
                    return Some(reason);
                }
            }
        }
        None
    }
}

async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        if rx.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::{recv_packet, spawn_server_line};
    use crate::settings::SessionSettings;
    use bytes::{Bytes, BytesMut};
    use channel_wire::{RawPayloadCodec, ReliableBody, ReliablePacket, SessionPacket};
    use tokio::io::AsyncWriteExt;

    fn responder(
        session_id: u32,
    ) -> (
        Driver<RawPayloadCodec>,
        Channel<Bytes>,
        mpsc::UnboundedSender<LineEvent<Bytes>>,
        Arc<PacketCodec<RawPayloadCodec>>,
    ) {
        responder_with(session_id, PacketCodec::default())
    }

    fn responder_with<C: PayloadCodec>(
        session_id: u32,
        codec: PacketCodec<C>,
    ) -> (
        Driver<C>,
        Channel<C::Payload>,
        mpsc::UnboundedSender<LineEvent<C::Payload>>,
        Arc<PacketCodec<C>>,
    ) {
        let codec = Arc::new(codec);
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let core = SessionCore::responder(session_id, SessionSettings::default());
        let (driver, channel) = Driver::new(
            core,
            Arc::clone(&codec),
            None,
            Duration::from_millis(10),
            line_tx.clone(),
            line_rx,
        );
        (driver, channel, line_tx, codec)
    }

    /// Payloads starting with `!` pass the estimate but fail to encode
    struct RefusingCodec;

    impl PayloadCodec for RefusingCodec {
        type Payload = Bytes;

        fn estimate_len(&self, payload: &Bytes) -> usize {
            RawPayloadCodec.estimate_len(payload)
        }

        fn encode(&self, payload: &Bytes, buf: &mut BytesMut) -> std::result::Result<(), CodecError> {
            if payload.starts_with(b"!") {
                return Err(CodecError::Payload("refused".to_string()));
            }
            RawPayloadCodec.encode(payload, buf)
        }

        fn decode(&self, buf: &mut Bytes) -> std::result::Result<Bytes, CodecError> {
            RawPayloadCodec.decode(buf)
        }
    }

    #[tokio::test]
    async fn test_responder_delivers_and_acks() {
        let (driver, mut channel, line_tx, codec) = responder(7);
        tokio::spawn(driver.run());
        assert_eq!(channel.session_id(), 7);

        let (client, server) = tokio::io::duplex(4096);
        spawn_server_line(
            server,
            BytesMut::new(),
            Handshake::Create {
                token: "T".to_string(),
            },
            Arc::clone(&codec),
            line_tx,
        );

        let (mut reader, mut writer) = tokio::io::split(client);
        let mut buffer = BytesMut::new();
        assert_eq!(
            recv_packet(&mut reader, &*codec, &mut buffer).await.unwrap(),
            Some(SessionPacket::CreateResponse { session_id: 7 })
        );

        let data = SessionPacket::Reliable(ReliablePacket::new(
            1,
            ReliableBody::Data(Bytes::from_static(b"hi")),
        ));
        writer.write_all(&codec.encode_to_bytes(&data).unwrap()).await.unwrap();

        match channel.recv().await {
            Some(ChannelEvent::Received(payload)) => assert_eq!(&payload[..], b"hi"),
            other => panic!("Expected payload, got {:?}", other),
        }
        assert_eq!(
            recv_packet(&mut reader, &*codec, &mut buffer).await.unwrap(),
            Some(SessionPacket::Ack { ack: 1 })
        );

        channel.send(Bytes::from_static(b"yo")).unwrap();
        let expected = SessionPacket::Reliable(ReliablePacket {
            message_id: 1,
            ack: 1,
            body: ReliableBody::Data(Bytes::from_static(b"yo")),
        });
        assert_eq!(
            recv_packet(&mut reader, &*codec, &mut buffer).await.unwrap(),
            Some(expected)
        );
        assert!(channel.status().connected);
    }

    #[tokio::test]
    async fn test_dropping_channel_sends_fin() {
        let (driver, channel, line_tx, codec) = responder(3);
        tokio::spawn(driver.run());

        let (client, server) = tokio::io::duplex(4096);
        spawn_server_line(
            server,
            BytesMut::new(),
            Handshake::Create {
                token: String::new(),
            },
            Arc::clone(&codec),
            line_tx,
        );

        let (mut reader, _writer) = tokio::io::split(client);
        let mut buffer = BytesMut::new();
        recv_packet(&mut reader, &*codec, &mut buffer).await.unwrap();

        drop(channel);
        assert_eq!(
            recv_packet(&mut reader, &*codec, &mut buffer).await.unwrap(),
            Some(SessionPacket::Reliable(ReliablePacket::new(1, ReliableBody::Fin)))
        );
    }

    #[tokio::test]
    async fn test_abort_ends_driver() {
        let (driver, mut channel, _line_tx, _codec) = responder(9);
        let task = tokio::spawn(driver.run());

        channel.abort();
        assert_eq!(task.await.unwrap(), CloseReason::Aborted);
        assert_eq!(channel.recv().await, Some(ChannelEvent::Closed(CloseReason::Aborted)));
        assert!(channel.is_closed());
        assert!(matches!(
            channel.send(Bytes::new()),
            Err(SessionError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected_without_spending_an_id() {
        let (driver, channel, line_tx, codec) =
            responder_with(3, PacketCodec::default().with_max_packet_size(64));
        tokio::spawn(driver.run());

        let (client, server) = tokio::io::duplex(4096);
        spawn_server_line(
            server,
            BytesMut::new(),
            Handshake::Create { token: String::new() },
            Arc::clone(&codec),
            line_tx,
        );
        let (mut reader, _writer) = tokio::io::split(client);
        let mut buffer = BytesMut::new();
        assert_eq!(
            recv_packet(&mut reader, &*codec, &mut buffer).await.unwrap(),
            Some(SessionPacket::CreateResponse { session_id: 3 })
        );

        let result = channel.send(Bytes::from(vec![1u8; 1024]));
        assert!(matches!(result, Err(SessionError::Codec(_))));

        channel.send(Bytes::from_static(b"small")).unwrap();
        assert_eq!(
            recv_packet(&mut reader, &*codec, &mut buffer).await.unwrap(),
            Some(SessionPacket::Reliable(ReliablePacket::new(
                1,
                ReliableBody::Data(Bytes::from_static(b"small")),
            )))
        );
        assert!(channel.status().closed.is_none());
    }

    #[tokio::test]
    async fn test_unencodable_packet_closes_session() {
        let (driver, mut channel, line_tx, codec) = responder_with(4, PacketCodec::new(RefusingCodec));
        let run = tokio::spawn(driver.run());

        let (_client, server) = tokio::io::duplex(4096);
        spawn_server_line(
            server,
            BytesMut::new(),
            Handshake::Create { token: String::new() },
            codec,
            line_tx,
        );

        channel.send(Bytes::from_static(b"!refused")).unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(3), channel.recv()).await {
                Ok(Some(ChannelEvent::Closed(reason))) => {
                    assert_eq!(reason, CloseReason::Unencodable);
                    break;
                }
                Ok(Some(_)) => continue,
                other => panic!("Expected close, got {:?}", other),
            }
        }
        assert_eq!(run.await.unwrap(), CloseReason::Unencodable);
        assert!(matches!(
            channel.send(Bytes::from_static(b"late")),
            Err(SessionError::ChannelClosed)
        ));
    }
}
