//! UDP reader pool.
//!
//! Several sockets bind the same port with SO_REUSEPORT so the kernel
//! spreads inbound datagrams across them; one reader task owns each
//! socket and replies on it, keeping the whole packet path off any
//! shared send lock.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use slipstream_core::wire::MAX_PACKET_BYTES;

use crate::dispatch;
use crate::state::BackendState;

/// Bind `count` sockets to the same address, one per reader task.
pub fn bind_reader_sockets(
    bind_address: &str,
    port: u16,
    count: usize,
    recv_buffer_bytes: usize,
) -> Result<Vec<UdpSocket>> {
    let addr: SocketAddr = format!("{bind_address}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind_address}:{port}"))?;

    let mut sockets = Vec::with_capacity(count);
    for _ in 0..count {
        sockets.push(make_reader_socket(addr, recv_buffer_bytes)?);
    }
    Ok(sockets)
}

fn make_reader_socket(addr: SocketAddr, recv_buffer_bytes: usize) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    socket.set_recv_buffer_size(recv_buffer_bytes).context("SO_RCVBUF")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).context("bind()")?;

    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}

/// One reader task: receive, handle, reply on the same socket.
pub struct PacketReader {
    socket: Arc<UdpSocket>,
    state: Arc<BackendState>,
    shutdown: broadcast::Receiver<()>,
}

impl PacketReader {
    pub fn new(socket: UdpSocket, state: Arc<BackendState>, shutdown: broadcast::Receiver<()>) -> Self {
        Self { socket: Arc::new(socket), state, shutdown }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET_BYTES];

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };

                    dispatch::handle_datagram(&self.state, &self.socket, &buf[..len], from).await;
                }
            }
        }
    }
}
