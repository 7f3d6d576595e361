//! TCP transport for session lines.

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    debug!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    configure_stream(&stream)?;
    Ok(stream)
}

/// Apply per-connection socket options
pub fn configure_stream(stream: &TcpStream) -> tokio::io::Result<()> {
    // Session packets are small and latency-bound
    stream.set_nodelay(true)
}
