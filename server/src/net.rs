//! Dual-transport plumbing: a TCP listener for reliable frames and a UDP
//! socket for fast-path datagrams, both funneled into one event channel the
//! game loop drains.
//!
//! The UDP socket binds the configured port; the TCP listener binds the port
//! directly above it.

use log::{debug, info, warn};
use serde_json::Value;
use shared::codec::{
    decode_payload, encode_frame, pack_datagrams, FrameAssembler, END_OF_MESSAGE,
    RECORD_SEPARATOR,
};
use shared::protocol::CMD_REGISTER_UDP;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Everything the game loop can observe from the network.
#[derive(Debug)]
pub enum NetEvent {
    StreamConnected { conn: u64 },
    StreamClosed { conn: u64 },
    /// A record that arrived on a TCP stream.
    Reliable { conn: u64, command: String, data: Value },
    /// A record from a datagram whose source address is bound to a user.
    Datagram { user_id: i64, command: String, data: Value },
    /// A `register_udp` datagram. The game loop validates the claimed id
    /// against its sessions before binding.
    UdpBindRequest { addr: SocketAddr, claimed_id: i64 },
}

struct StreamHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Owns the sockets and the per-connection tasks.
pub struct Transport {
    udp: Arc<UdpSocket>,
    streams: Arc<RwLock<HashMap<u64, StreamHandle>>>,
    udp_by_user: Arc<RwLock<HashMap<i64, SocketAddr>>>,
    user_by_addr: Arc<RwLock<HashMap<SocketAddr, i64>>>,
    accept_task: JoinHandle<()>,
    udp_task: JoinHandle<()>,
}

impl Transport {
    /// Binds both sockets and starts the accept and datagram tasks. `port` is
    /// the UDP port; TCP listens on `port + 1`.
    pub async fn start(
        host: &str,
        port: u16,
        max_connections: usize,
    ) -> Result<(Transport, mpsc::UnboundedReceiver<NetEvent>), Box<dyn std::error::Error>> {
        let udp = Arc::new(UdpSocket::bind(format!("{}:{}", host, port)).await?);
        let listener = TcpListener::bind(format!("{}:{}", host, port + 1)).await?;
        info!(
            "listening on udp {} / tcp {}",
            udp.local_addr()?,
            listener.local_addr()?
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let streams: Arc<RwLock<HashMap<u64, StreamHandle>>> = Arc::new(RwLock::new(HashMap::new()));
        let udp_by_user: Arc<RwLock<HashMap<i64, SocketAddr>>> = Arc::new(RwLock::new(HashMap::new()));
        let user_by_addr: Arc<RwLock<HashMap<SocketAddr, i64>>> = Arc::new(RwLock::new(HashMap::new()));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            streams.clone(),
            events_tx.clone(),
            max_connections,
        ));
        let udp_task = tokio::spawn(udp_loop(udp.clone(), user_by_addr.clone(), events_tx));

        Ok((
            Transport {
                udp,
                streams,
                udp_by_user,
                user_by_addr,
                accept_task,
                udp_task,
            },
            events_rx,
        ))
    }

    /// Frames the records and queues them on one connection's stream.
    pub async fn send_reliable(&self, conn: u64, records: &[String]) {
        if records.is_empty() {
            return;
        }
        let frame = encode_frame(records);
        let streams = self.streams.read().await;
        if let Some(handle) = streams.get(&conn) {
            if handle.tx.send(frame).is_err() {
                debug!("conn {}: writer already gone", conn);
            }
        }
    }

    /// Packs the records into datagrams for the user's bound address. Records
    /// to unbound users are silently dropped.
    pub async fn send_unreliable(&self, user_id: i64, records: &[String], packet_size: usize) {
        if records.is_empty() {
            return;
        }
        let addr = match self.udp_by_user.read().await.get(&user_id) {
            Some(addr) => *addr,
            None => return,
        };
        for datagram in pack_datagrams(records, packet_size) {
            if let Err(e) = self.udp.send_to(&datagram, addr).await {
                warn!("udp send to {} failed: {}", addr, e);
            }
        }
    }

    pub async fn bind_udp(&self, user_id: i64, addr: SocketAddr) {
        let mut by_user = self.udp_by_user.write().await;
        let mut by_addr = self.user_by_addr.write().await;
        if let Some(stale_addr) = by_user.insert(user_id, addr) {
            by_addr.remove(&stale_addr);
        }
        // An address changing hands (same client socket, new login) must also
        // drop the previous owner's forward entry.
        if let Some(stale_user) = by_addr.insert(addr, user_id) {
            if stale_user != user_id {
                by_user.remove(&stale_user);
            }
        }
        debug!("user {} bound to udp {}", user_id, addr);
    }

    pub async fn unbind_udp(&self, user_id: i64) {
        let mut by_user = self.udp_by_user.write().await;
        if let Some(addr) = by_user.remove(&user_id) {
            self.user_by_addr.write().await.remove(&addr);
        }
    }

    pub async fn udp_bound(&self, user_id: i64) -> bool {
        self.udp_by_user.read().await.contains_key(&user_id)
    }

    /// Tears down one connection. The writer drains anything already queued
    /// (its channel sender drops with the handle) so a final notice still
    /// flushes. The reader's close event may still be in flight; callers
    /// treat duplicate closes as no-ops.
    pub async fn close_conn(&self, conn: u64) {
        if let Some(handle) = self.streams.write().await.remove(&conn) {
            handle.reader.abort();
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// The id→addr and addr→id tables must stay mutual inverses.
    #[cfg(test)]
    pub(crate) async fn binding_tables_are_inverse(&self) -> bool {
        let by_user = self.udp_by_user.read().await;
        let by_addr = self.user_by_addr.read().await;
        by_user.len() == by_addr.len()
            && by_user
                .iter()
                .all(|(user, addr)| by_addr.get(addr) == Some(user))
    }

    pub async fn stop(self) {
        self.accept_task.abort();
        self.udp_task.abort();
        let mut streams = self.streams.write().await;
        for (_, handle) in streams.drain() {
            handle.reader.abort();
            handle.writer.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    streams: Arc<RwLock<HashMap<u64, StreamHandle>>>,
    events: mpsc::UnboundedSender<NetEvent>,
    max_connections: usize,
) {
    let next_conn = AtomicU64::new(1);
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        if streams.read().await.len() >= max_connections {
            warn!("rejecting {}: server full ({})", addr, max_connections);
            continue;
        }
        let conn = next_conn.fetch_add(1, Ordering::Relaxed);
        debug!("conn {}: accepted from {}", conn, addr);
        spawn_stream_tasks(conn, socket, &streams, &events).await;
        let _ = events.send(NetEvent::StreamConnected { conn });
    }
}

async fn spawn_stream_tasks(
    conn: u64,
    socket: TcpStream,
    streams: &Arc<RwLock<HashMap<u64, StreamHandle>>>,
    events: &mpsc::UnboundedSender<NetEvent>,
) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        let mut assembler = FrameAssembler::new();
        let mut buf = [0u8; 4096];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for frame in assembler.push(&buf[..n]) {
                        for record in frame {
                            match decode_payload(&record) {
                                Ok((command, data)) => {
                                    let _ = reader_events.send(NetEvent::Reliable {
                                        conn,
                                        command,
                                        data,
                                    });
                                }
                                Err(e) => {
                                    warn!("conn {}: dropping record: {}", conn, e);
                                }
                            }
                        }
                    }
                }
            }
        }
        let _ = reader_events.send(NetEvent::StreamClosed { conn });
    });

    streams
        .write()
        .await
        .insert(conn, StreamHandle { tx, reader, writer });
}

async fn udp_loop(
    udp: Arc<UdpSocket>,
    user_by_addr: Arc<RwLock<HashMap<SocketAddr, i64>>>,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    let mut buf = [0u8; 65536];
    loop {
        let (n, addr) = match udp.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("udp recv failed: {}", e);
                continue;
            }
        };
        let bound_user = user_by_addr.read().await.get(&addr).copied();
        // A datagram is a self-contained frame: separated records plus the
        // end-of-message terminator.
        let body = match buf[..n].strip_suffix(&[END_OF_MESSAGE]) {
            Some(body) => body,
            None => {
                debug!("udp from {}: missing terminator, dropping datagram", addr);
                continue;
            }
        };
        for chunk in body.split(|b| *b == RECORD_SEPARATOR) {
            if chunk.is_empty() {
                continue;
            }
            let record = match std::str::from_utf8(chunk) {
                Ok(s) => s,
                Err(_) => {
                    warn!("udp from {}: invalid utf-8 record", addr);
                    continue;
                }
            };
            let (command, data) = match decode_payload(record) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("udp from {}: dropping record: {}", addr, e);
                    continue;
                }
            };
            if command == CMD_REGISTER_UDP {
                if let Some(claimed_id) = data.as_i64() {
                    let _ = events.send(NetEvent::UdpBindRequest { addr, claimed_id });
                }
                continue;
            }
            match bound_user {
                Some(user_id) => {
                    let _ = events.send(NetEvent::Datagram { user_id, command, data });
                }
                // Datagrams from unbound addresses carry no identity.
                None => debug!("udp from unbound {}: ignoring {}", addr, command),
            }
        }
    }
}
