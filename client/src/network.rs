//! Client side of the dual transport: a reliable stream for session traffic
//! and a connected datagram socket for the fast path.

use log::{debug, info, warn};
use serde_json::{json, Value};
use shared::codec::{
    decode_payload, encode_frame, encode_payload, pack_datagrams, FrameAssembler, END_OF_MESSAGE,
    RECORD_SEPARATOR,
};
use shared::protocol::{outcome, CMD_CONNECTED_ELSEWHERE, CMD_LOGIN, CMD_REGISTER, CMD_REGISTER_OUTCOME, CMD_REGISTER_UDP};
use shared::DEFAULT_PACKET_SIZE;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
enum Inbound {
    Record(String, Value),
    Closed,
}

/// One client connection. `session_id` follows the outcome codes: zero until
/// authenticated, the user id afterwards, negative after a failure or close.
pub struct Connection {
    session_id: i64,
    packet_size: usize,
    tcp_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    udp: Arc<UdpSocket>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    udp_reader: JoinHandle<()>,
}

impl Connection {
    /// Dials the server: stream on `port + 1`, datagrams to `port`.
    pub async fn connect(host: &str, port: u16) -> Result<Connection, Box<dyn std::error::Error>> {
        let udp = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        udp.connect(format!("{}:{}", host, port)).await?;
        let tcp = TcpStream::connect(format!("{}:{}", host, port + 1)).await?;
        info!("connected to {}:{}", host, port);

        let (read_half, mut write_half) = tcp.into_split();
        let (tcp_tx, mut tcp_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(bytes) = tcp_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let reader_tx = inbound_tx.clone();
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
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
                                        let _ = reader_tx.send(Inbound::Record(command, data));
                                    }
                                    Err(e) => warn!("dropping record: {}", e),
                                }
                            }
                        }
                    }
                }
            }
            let _ = reader_tx.send(Inbound::Closed);
        });

        let udp_socket = udp.clone();
        let udp_reader = tokio::spawn(async move {
            let mut buf = [0u8; 65536];
            loop {
                let n = match udp_socket.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(_) => break,
                };
                let body = match buf[..n].strip_suffix(&[END_OF_MESSAGE]) {
                    Some(body) => body,
                    None => continue,
                };
                for chunk in body.split(|b| *b == RECORD_SEPARATOR) {
                    if chunk.is_empty() {
                        continue;
                    }
                    let Ok(record) = std::str::from_utf8(chunk) else {
                        continue;
                    };
                    match decode_payload(record) {
                        Ok((command, data)) => {
                            let _ = inbound_tx.send(Inbound::Record(command, data));
                        }
                        Err(e) => warn!("dropping datagram record: {}", e),
                    }
                }
            }
        });

        Ok(Connection {
            session_id: outcome::UNAUTHENTICATED,
            packet_size: DEFAULT_PACKET_SIZE,
            tcp_tx,
            inbound,
            udp,
            reader,
            writer,
            udp_reader,
        })
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.session_id > 0
    }

    pub fn is_closed(&self) -> bool {
        self.session_id == outcome::FORCE_CLOSED
    }

    /// Queues one payload on the reliable stream.
    pub fn send_reliable(&self, command: &str, data: &Value) {
        let frame = encode_frame(&[encode_payload(command, data)]);
        if self.tcp_tx.send(frame).is_err() {
            debug!("stream writer is gone");
        }
    }

    /// Caps the datagram size; match this to the server's configuration.
    pub fn set_packet_size(&mut self, bytes: usize) {
        self.packet_size = bytes;
    }

    /// Fires one payload on the datagram path. Loss is acceptable here, and
    /// payloads over the packet-size cap never leave the socket.
    pub async fn send_unreliable(&self, command: &str, data: &Value) {
        for datagram in pack_datagrams(&[encode_payload(command, data)], self.packet_size) {
            if let Err(e) = self.udp.send(&datagram).await {
                debug!("datagram send failed: {}", e);
            }
        }
    }

    pub fn register(&self, username: &str, password: &str) {
        self.send_reliable(CMD_REGISTER, &json!([username, password]));
    }

    pub fn login(&self, username: &str, password: &str) {
        self.send_reliable(CMD_LOGIN, &json!([username, password]));
    }

    /// Drains everything received since the last poll. Session lifecycle
    /// records are absorbed here; the rest is handed to the caller in
    /// arrival order.
    pub async fn poll(&mut self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        loop {
            let event = match self.inbound.try_recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            match event {
                Inbound::Closed => {
                    info!("server closed the connection");
                    self.session_id = outcome::FORCE_CLOSED;
                }
                Inbound::Record(command, data) => match command.as_str() {
                    CMD_REGISTER_OUTCOME => {
                        let id = data.as_i64().unwrap_or(outcome::UNAUTHENTICATED);
                        self.session_id = id;
                        if id > 0 {
                            // Claim our datagram address now that we have an
                            // identity to claim it with.
                            self.send_unreliable(CMD_REGISTER_UDP, &json!(id)).await;
                            info!("authenticated as user {}", id);
                        } else {
                            warn!("authentication failed with code {}", id);
                        }
                    }
                    CMD_CONNECTED_ELSEWHERE => {
                        warn!("logged in from another location");
                        self.session_id = outcome::FORCE_CLOSED;
                    }
                    _ => out.push((command, data)),
                },
            }
        }
        out
    }

    pub fn close(self) {
        self.reader.abort();
        self.writer.abort();
        self.udp_reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn oversized_datagrams_never_leave_the_socket() {
        let receiver = UdpSocket::bind("127.0.0.1:47370").await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:47371").await.unwrap();
        tokio::spawn(async move {
            // Accept and hold the stream open for the duration of the test.
            let _stream = listener.accept().await;
            std::future::pending::<()>().await;
        });

        let connection = Connection::connect("127.0.0.1", 47370).await.unwrap();
        let mut buf = [0u8; 65536];

        connection.send_unreliable("ping", &json!(1)).await;
        let (n, _) = timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().contains("ping"));

        // A payload over the cap is dropped; the next small one still flows.
        let blob = "x".repeat(DEFAULT_PACKET_SIZE * 2);
        connection.send_unreliable("blob", &json!(blob)).await;
        connection.send_unreliable("ping", &json!(2)).await;
        let (n, _) = timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let record = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(record.contains("ping"));
        assert!(!record.contains("blob"));

        connection.close();
    }
}
