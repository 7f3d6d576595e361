//! Session lines: one physical connection bound to a session.
//!
//! A line performs exactly one handshake exchange and then becomes a pipe
//! for reliable, ack and ping packets. Each line runs as its own task and
//! reports to its owner through [`LineEvent`]s on an mpsc channel, so the
//! owner never mutates session state from inside the I/O task.
//!
//! Lines are identified by a process-unique [`LineId`]. The owner compares
//! the id on every event with the line it currently tracks, which makes
//! events from superseded lines harmless.

use crate::error::{Result, SessionError};
use crate::transport::connect_tcp;
use bytes::{Buf, BytesMut};
use channel_wire::{CodecError, PacketCodec, PayloadCodec, SessionPacket};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, trace, warn};

static NEXT_LINE_ID: AtomicU64 = AtomicU64::new(1);

/// How long a graceful close waits for queued bytes to drain
const GRACEFUL_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Generational identity of one line instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId(u64);

impl LineId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        LineId(NEXT_LINE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// What a session needs from a line
pub trait Line<P> {
    /// Identity of this line instance
    fn id(&self) -> LineId;

    /// Client-assigned index, 0 for the creating line
    fn line_index(&self) -> u32;

    /// Queue a packet; silently dropped once the line is closed
    fn send(&self, packet: SessionPacket<P>);

    /// Start closing; `graceful` flushes queued packets first.
    ///
    /// A closed event is reported exactly once however often this is called.
    fn close(&self, graceful: bool);
}

/// First packet of a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Create a new session
    Create {
        /// Binding token
        token: String,
    },
    /// Bind this line to an existing session
    Rebind {
        /// Session to rebind
        session_id: u32,
        /// Index of this line
        line_index: u32,
        /// Last message id the client received
        client_ack: u32,
    },
}

impl Handshake {
    /// Index of the line carrying this handshake
    pub fn line_index(&self) -> u32 {
        match self {
            Handshake::Create { .. } => 0,
            Handshake::Rebind { line_index, .. } => *line_index,
        }
    }

    /// Request packet for this handshake
    pub fn to_packet<P>(&self) -> SessionPacket<P> {
        match self {
            Handshake::Create { token } => SessionPacket::CreateRequest {
                token: token.clone(),
            },
            Handshake::Rebind {
                session_id,
                line_index,
                client_ack,
            } => SessionPacket::RebindRequest {
                session_id: *session_id,
                line_index: *line_index,
                client_ack: *client_ack,
            },
        }
    }

    /// Interpret the first packet of an accepted connection
    pub fn from_packet<P>(packet: SessionPacket<P>) -> Result<Self> {
        match packet {
            SessionPacket::CreateRequest { token } => Ok(Handshake::Create { token }),
            SessionPacket::RebindRequest {
                session_id,
                line_index,
                client_ack,
            } => Ok(Handshake::Rebind {
                session_id,
                line_index,
                client_ack,
            }),
            other => Err(SessionError::ProtocolViolation(format!(
                "{:?} as first packet",
                other.packet_type()
            ))),
        }
    }
}

/// Why a line closed
#[derive(Debug)]
pub enum LineCloseReason {
    /// Closed by its owner
    Local,
    /// The peer closed the connection
    Remote,
    /// Transport, codec or handshake failure
    Failed(SessionError),
    /// A queued packet could not be encoded
    Unencodable(CodecError),
}

impl fmt::Display for LineCloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineCloseReason::Local => write!(f, "closed locally"),
            LineCloseReason::Remote => write!(f, "closed by peer"),
            LineCloseReason::Failed(e) => write!(f, "{}", e),
            LineCloseReason::Unencodable(e) => write!(f, "cannot encode packet: {}", e),
        }
    }
}

/// Notifications from line tasks to their owner
#[derive(Debug)]
pub enum LineEvent<P> {
    /// An accepted connection sent its handshake and is handed to the session
    Accepted {
        /// Handle to the new line
        line: LineHandle<P>,
        /// The handshake it carried
        handshake: Handshake,
    },
    /// The creating line got its `CreateResponse`
    Created {
        /// Line that completed
        line: LineId,
        /// Session id issued by the server
        session_id: u32,
    },
    /// The rebinding line got its `RebindResponse`
    Rebound {
        /// Line that completed
        line: LineId,
        /// Last message id the server received
        server_ack: u32,
    },
    /// Post-handshake packet
    Received {
        /// Line it arrived on
        line: LineId,
        /// The packet
        packet: SessionPacket<P>,
    },
    /// The line is gone; sent exactly once per line
    Closed {
        /// Line that closed
        line: LineId,
        /// Why
        reason: LineCloseReason,
    },
}

enum LineCommand<P> {
    Send(SessionPacket<P>),
    Close { graceful: bool },
}

/// Owner's handle to a line task; dropping it closes the line
pub struct LineHandle<P> {
    id: LineId,
    line_index: u32,
    commands: mpsc::UnboundedSender<LineCommand<P>>,
}

impl<P> fmt::Debug for LineHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineHandle")
            .field("id", &self.id)
            .field("line_index", &self.line_index)
            .finish()
    }
}

impl<P> Line<P> for LineHandle<P> {
    fn id(&self) -> LineId {
        self.id
    }

    fn line_index(&self) -> u32 {
        self.line_index
    }

    fn send(&self, packet: SessionPacket<P>) {
        let _ = self.commands.send(LineCommand::Send(packet));
    }

    fn close(&self, graceful: bool) {
        let _ = self.commands.send(LineCommand::Close { graceful });
    }
}

/// Read one packet, decoding buffered bytes before reading more.
///
/// Returns `Ok(None)` on a clean end of stream.
pub async fn recv_packet<R, C>(
    reader: &mut R,
    codec: &PacketCodec<C>,
    buffer: &mut BytesMut,
) -> Result<Option<SessionPacket<C::Payload>>>
where
    R: AsyncRead + Unpin,
    C: PayloadCodec,
{
    loop {
        if let Some(packet) = codec.decode(buffer)? {
            return Ok(Some(packet));
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF while reading packet",
            )));
        }

        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

/// Read the handshake packet of an accepted connection
pub async fn read_handshake<R, C>(
    reader: &mut R,
    codec: &PacketCodec<C>,
    buffer: &mut BytesMut,
) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
    C: PayloadCodec,
{
    match recv_packet(reader, codec, buffer).await? {
        Some(packet) => Handshake::from_packet(packet),
        None => Err(SessionError::HandshakeRejected(
            "connection closed before handshake".to_string(),
        )),
    }
}

/// Dial `addr`, send `handshake` and report the outcome as [`LineEvent`]s
pub fn spawn_client_line<C: PayloadCodec>(
    addr: SocketAddr,
    handshake: Handshake,
    codec: Arc<PacketCodec<C>>,
    events: mpsc::UnboundedSender<LineEvent<C::Payload>>,
) -> LineHandle<C::Payload> {
    let id = LineId::next();
    let line_index = handshake.line_index();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let reason = run_client_line(id, addr, handshake, codec, commands_rx, &events).await;
        debug!(line = %id, %reason, "Line closed");
        let _ = events.send(LineEvent::Closed { line: id, reason });
    });

    LineHandle {
        id,
        line_index,
        commands: commands_tx,
    }
}

/// Hand an accepted, handshaken connection to a session
pub fn spawn_server_line<S, C>(
    stream: S,
    buffer: BytesMut,
    handshake: Handshake,
    codec: Arc<PacketCodec<C>>,
    events: mpsc::UnboundedSender<LineEvent<C::Payload>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: PayloadCodec,
{
    let id = LineId::next();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let line = LineHandle {
        id,
        line_index: handshake.line_index(),
        commands: commands_tx,
    };

    // Queued ahead of anything the line task reports
    if events.send(LineEvent::Accepted { line, handshake }).is_err() {
        debug!(line = %id, "Session gone before line was accepted");
        return;
    }

    tokio::spawn(async move {
        let reason = run_line(id, stream, buffer, codec, commands_rx, &events).await;
        debug!(line = %id, %reason, "Line closed");
        let _ = events.send(LineEvent::Closed { line: id, reason });
    });
}

async fn wait_for_close<P>(commands: &mut mpsc::UnboundedReceiver<LineCommand<P>>) {
    loop {
        match commands.recv().await {
            Some(LineCommand::Send(packet)) => {
                trace!(packet_type = ?packet.packet_type(), "Dropping packet on unbound line");
            }
            Some(LineCommand::Close { .. }) | None => return,
        }
    }
}

async fn run_client_line<C: PayloadCodec>(
    id: LineId,
    addr: SocketAddr,
    handshake: Handshake,
    codec: Arc<PacketCodec<C>>,
    mut commands: mpsc::UnboundedReceiver<LineCommand<C::Payload>>,
    events: &mpsc::UnboundedSender<LineEvent<C::Payload>>,
) -> LineCloseReason {
    let exchange = async {
        let mut stream = connect_tcp(addr).await?;
        debug!(line = %id, %addr, ?handshake, "Line connected; sending handshake");

        let request = codec.encode_to_bytes(&handshake.to_packet())?;
        stream.write_all(&request).await?;

        let mut buffer = BytesMut::with_capacity(8 * 1024);
        let response = match recv_packet(&mut stream, &*codec, &mut buffer).await? {
            Some(response) => response,
            None => {
                return Err(SessionError::HandshakeRejected(
                    "connection closed during handshake".to_string(),
                ))
            }
        };
        Ok::<_, SessionError>((stream, buffer, response))
    };

    let (stream, buffer, response) = tokio::select! {
        result = exchange => match result {
            Ok(parts) => parts,
            Err(e) => return LineCloseReason::Failed(e),
        },
        _ = wait_for_close(&mut commands) => return LineCloseReason::Local,
    };

    let event = match (&handshake, response) {
        (Handshake::Create { .. }, SessionPacket::CreateResponse { session_id }) => {
            LineEvent::Created { line: id, session_id }
        }
        (Handshake::Rebind { .. }, SessionPacket::RebindResponse { server_ack }) => {
            LineEvent::Rebound { line: id, server_ack }
        }
        (_, other) => {
            warn!(line = %id, packet_type = ?other.packet_type(), "Unexpected handshake response");
            return LineCloseReason::Failed(SessionError::HandshakeRejected(format!(
                "unexpected {:?}",
                other.packet_type()
            )));
        }
    };
    if events.send(event).is_err() {
        return LineCloseReason::Local;
    }

    run_line(id, stream, buffer, codec, commands, events).await
}

async fn run_line<S, C>(
    id: LineId,
    stream: S,
    buffer: BytesMut,
    codec: Arc<PacketCodec<C>>,
    commands: mpsc::UnboundedReceiver<LineCommand<C::Payload>>,
    events: &mpsc::UnboundedSender<LineEvent<C::Payload>>,
) -> LineCloseReason
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    C: PayloadCodec,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader_task = tokio::spawn(read_loop(
        id,
        reader,
        buffer,
        Arc::clone(&codec),
        events.clone(),
    ));

    let finished = tokio::select! {
        reason = write_loop(id, writer, &*codec, commands) => LineHalf::Writer(reason),
        joined = &mut reader_task => LineHalf::Reader(joined),
    };

    match finished {
        LineHalf::Writer(reason) => {
            reader_task.abort();
            let _ = reader_task.await;
            reason
        }
        LineHalf::Reader(Ok(reason)) => reason,
        LineHalf::Reader(Err(e)) => LineCloseReason::Failed(SessionError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            e,
        ))),
    }
}

enum LineHalf {
    Writer(LineCloseReason),
    Reader(std::result::Result<LineCloseReason, tokio::task::JoinError>),
}

async fn read_loop<R, C>(
    id: LineId,
    mut reader: R,
    mut buffer: BytesMut,
    codec: Arc<PacketCodec<C>>,
    events: mpsc::UnboundedSender<LineEvent<C::Payload>>,
) -> LineCloseReason
where
    R: AsyncRead + Unpin,
    C: PayloadCodec,
{
    loop {
        match recv_packet(&mut reader, &*codec, &mut buffer).await {
            Ok(Some(packet)) => {
                trace!(line = %id, packet_type = ?packet.packet_type(), "Received packet");
                if events.send(LineEvent::Received { line: id, packet }).is_err() {
                    return LineCloseReason::Local;
                }
            }
            Ok(None) => return LineCloseReason::Remote,
            Err(e) => {
                warn!(line = %id, error = %e, "Line read failed");
                return LineCloseReason::Failed(e);
            }
        }
    }
}

enum WriteStep<P> {
    Command(Option<LineCommand<P>>),
    Wrote(std::io::Result<usize>),
}

/// Encode queued packets and write them out, staying responsive to `Close`
/// while a write is blocked on the peer
async fn write_loop<W, C>(
    id: LineId,
    mut writer: W,
    codec: &PacketCodec<C>,
    mut commands: mpsc::UnboundedReceiver<LineCommand<C::Payload>>,
) -> LineCloseReason
where
    W: AsyncWrite + Unpin,
    C: PayloadCodec,
{
    let mut pending = BytesMut::with_capacity(8 * 1024);

    loop {
        let step = tokio::select! {
            biased;
            command = commands.recv() => WriteStep::Command(command),
            result = writer.write(&pending), if !pending.is_empty() => WriteStep::Wrote(result),
        };

        match step {
            WriteStep::Command(Some(LineCommand::Send(packet))) => {
                if let Err(e) = codec.encode(&packet, &mut pending) {
                    warn!(line = %id, packet_type = ?packet.packet_type(), error = %e, "Cannot encode packet; closing line");
                    return LineCloseReason::Unencodable(e);
                }
            }
            WriteStep::Command(Some(LineCommand::Close { graceful: true })) => {
                let flush = async {
                    writer.write_all(&pending).await?;
                    writer.shutdown().await
                };
                match time::timeout(GRACEFUL_FLUSH_TIMEOUT, flush).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(line = %id, error = %e, "Flush on close failed"),
                    Err(_) => debug!(line = %id, unsent = pending.len(), "Flush on close timed out"),
                }
                return LineCloseReason::Local;
            }
            WriteStep::Command(Some(LineCommand::Close { graceful: false })) | WriteStep::Command(None) => {
                return LineCloseReason::Local;
            }
            WriteStep::Wrote(Ok(0)) => {
                return LineCloseReason::Failed(SessionError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            WriteStep::Wrote(Ok(written)) => {
                pending.advance(written);
                trace!(line = %id, written, queued = pending.len(), "Wrote packets");
            }
            WriteStep::Wrote(Err(e)) => return LineCloseReason::Failed(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use channel_wire::{RawPayloadCodec, ReliableBody, ReliablePacket};
    use std::time::Duration;
    use tokio::time::timeout;

    fn codec() -> PacketCodec<RawPayloadCodec> {
        PacketCodec::default()
    }

    #[tokio::test]
    async fn test_recv_packet_handles_coalesced_packets() {
        let codec = codec();
        let mut wire = BytesMut::new();
        codec.encode(&SessionPacket::Ack { ack: 1 }, &mut wire).unwrap();
        codec.encode(&SessionPacket::Ack { ack: 2 }, &mut wire).unwrap();

        let mut reader = &wire[..];
        let mut buffer = BytesMut::new();
        let first = recv_packet(&mut reader, &codec, &mut buffer).await.unwrap();
        let second = recv_packet(&mut reader, &codec, &mut buffer).await.unwrap();
        let end = recv_packet(&mut reader, &codec, &mut buffer).await.unwrap();

        assert_eq!(first, Some(SessionPacket::Ack { ack: 1 }));
        assert_eq!(second, Some(SessionPacket::Ack { ack: 2 }));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_recv_packet_truncated_stream() {
        let codec = codec();
        let mut reader = &[9u8, 0, 0, 0, 5][..];
        let mut buffer = BytesMut::new();
        assert!(matches!(
            recv_packet(&mut reader, &codec, &mut buffer).await,
            Err(SessionError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_read_handshake_rejects_other_packets() {
        let codec = codec();
        let bytes = codec.encode_to_bytes(&SessionPacket::PingRequest { ticks: 1 }).unwrap();
        let mut reader = &bytes[..];
        let mut buffer = BytesMut::new();
        assert!(matches!(
            read_handshake(&mut reader, &codec, &mut buffer).await,
            Err(SessionError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_server_line_pipes_packets() {
        let codec = codec();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (local, mut remote) = tokio::io::duplex(64 * 1024);

        spawn_server_line(
            local,
            BytesMut::new(),
            Handshake::Create { token: String::new() },
            Arc::new(codec.clone()),
            events_tx,
        );

        let line = match events_rx.recv().await {
            Some(LineEvent::Accepted { line, handshake }) => {
                assert_eq!(handshake, Handshake::Create { token: String::new() });
                line
            }
            other => panic!("Expected accepted line, got {:?}", other),
        };
        assert_eq!(line.line_index(), 0);

        // Outbound
        line.send(SessionPacket::CreateResponse { session_id: 9 });
        let mut buffer = BytesMut::new();
        let packet = recv_packet(&mut remote, &codec, &mut buffer).await.unwrap();
        assert_eq!(packet, Some(SessionPacket::CreateResponse { session_id: 9 }));

        // Inbound
        let data = SessionPacket::Reliable(ReliablePacket {
            message_id: 1,
            ack: 0,
            body: ReliableBody::Data(Bytes::from_static(b"hello")),
        });
        remote.write_all(&codec.encode_to_bytes(&data).unwrap()).await.unwrap();
        match events_rx.recv().await {
            Some(LineEvent::Received { line: id, packet }) => {
                assert_eq!(id, line.id());
                assert_eq!(packet, data);
            }
            other => panic!("Expected packet, got {:?}", other),
        }

        // Closing twice reports once
        line.close(true);
        line.close(false);
        match timeout(Duration::from_secs(2), events_rx.recv()).await.unwrap() {
            Some(LineEvent::Closed { line: id, reason }) => {
                assert_eq!(id, line.id());
                assert!(matches!(reason, LineCloseReason::Local));
            }
            other => panic!("Expected close, got {:?}", other),
        }
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_client_line_connect_failure_is_reported() {
        let codec = codec();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        // Grab a free port and release it so nothing is listening
        let listener = crate::transport::listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let line = spawn_client_line(
            addr,
            Handshake::Create { token: "T".into() },
            Arc::new(codec),
            events_tx,
        );
        match timeout(Duration::from_secs(5), events_rx.recv()).await.unwrap() {
            Some(LineEvent::Closed { line: id, reason }) => {
                assert_eq!(id, line.id());
                assert!(matches!(reason, LineCloseReason::Failed(_)));
            }
            other => panic!("Expected close, got {:?}", other),
        }
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

    fn accept<C: PayloadCodec>(
        stream: tokio::io::DuplexStream,
        codec: Arc<PacketCodec<C>>,
    ) -> (mpsc::UnboundedReceiver<LineEvent<C::Payload>>, LineHandle<C::Payload>) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        spawn_server_line(
            stream,
            BytesMut::new(),
            Handshake::Create { token: String::new() },
            codec,
            events_tx,
        );
        let line = match events_rx.try_recv() {
            Ok(LineEvent::Accepted { line, .. }) => line,
            other => panic!("Expected accepted line, got {:?}", other),
        };
        (events_rx, line)
    }

    async fn wait_closed<P: fmt::Debug>(
        events: &mut mpsc::UnboundedReceiver<LineEvent<P>>,
        id: LineId,
    ) -> LineCloseReason {
        loop {
            match timeout(Duration::from_secs(3), events.recv()).await {
                Ok(Some(LineEvent::Closed { line, reason })) => {
                    assert_eq!(line, id);
                    return reason;
                }
                Ok(Some(_)) => continue,
                other => panic!("Expected close of {}, got {:?}", id, other),
            }
        }
    }

    fn big_data(len: usize) -> SessionPacket<Bytes> {
        SessionPacket::Reliable(ReliablePacket::new(1, ReliableBody::Data(Bytes::from(vec![0u8; len]))))
    }

    #[tokio::test]
    async fn test_lines_writing_past_transport_buffer_still_close() {
        let codec = Arc::new(codec());
        let (a, b) = tokio::io::duplex(1024);
        let (mut events_a, line_a) = accept(a, Arc::clone(&codec));
        let (mut events_b, line_b) = accept(b, Arc::clone(&codec));

        line_a.send(big_data(64 * 1024));
        line_b.send(big_data(64 * 1024));
        tokio::task::yield_now().await;
        line_a.close(false);
        line_b.close(false);

        wait_closed(&mut events_a, line_a.id()).await;
        wait_closed(&mut events_b, line_b.id()).await;
    }

    #[tokio::test]
    async fn test_close_cancels_write_blocked_on_peer() {
        let codec = Arc::new(codec());
        // The peer end is held but never read
        let (local, _peer) = tokio::io::duplex(1024);
        let (mut events, line) = accept(local, codec);

        line.send(big_data(64 * 1024));
        tokio::task::yield_now().await;
        line.close(true);

        let reason = wait_closed(&mut events, line.id()).await;
        assert!(matches!(reason, LineCloseReason::Local));
    }

    #[tokio::test]
    async fn test_unencodable_packet_closes_line() {
        let codec = Arc::new(PacketCodec::new(RefusingCodec));
        let (local, mut remote) = tokio::io::duplex(4096);
        let (mut events, line) = accept(local, Arc::clone(&codec));

        line.send(SessionPacket::Reliable(ReliablePacket::new(
            1,
            ReliableBody::Data(Bytes::from_static(b"!no")),
        )));
        line.send(SessionPacket::Ack { ack: 0 });

        let reason = wait_closed(&mut events, line.id()).await;
        assert!(matches!(
            reason,
            LineCloseReason::Unencodable(CodecError::Payload(_))
        ));

        // Nothing after the refused packet went out
        let mut buffer = BytesMut::new();
        assert_eq!(recv_packet(&mut remote, &*codec, &mut buffer).await.unwrap(), None);
    }
}
