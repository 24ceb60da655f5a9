//! Inter-member TCP transport implementation.
//!
//! Every member listens on its own address. Outbound frames to a peer go
//! through a dedicated writer task owning one outgoing connection; inbound
//! connections are served by reader tasks that forward frames to the inbox.
//! Each connection starts with the connecting member's listen address so the
//! receiver can tag frames with their origin. A writer that cannot connect,
//! or whose connection breaks, reports its peer on the failure stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cluster::{
    to_data, to_object, Address, Inbox, PeerFailures, Transport,
};
use crate::utils::GridError;

use async_trait::async_trait;

use bytes::Bytes;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Maximum accepted frame length.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// TCP transport module of one member.
pub struct TcpTransport {
    /// My listen address.
    me: Address,

    /// Number of connect attempts before a peer is declared unreachable.
    connect_retries: u8,

    /// Map from peer address -> sender side of its writer channel.
    tx_sends: Arc<Mutex<HashMap<Address, mpsc::UnboundedSender<Bytes>>>>,

    /// Sender side of the inbox, cloned into reader tasks.
    tx_recv: mpsc::UnboundedSender<(Address, Bytes)>,

    /// Sender side of the failure stream, cloned into writer tasks.
    tx_fail: mpsc::UnboundedSender<(Address, String)>,

    /// Receiver side of the failure stream until taken.
    rx_fail: Mutex<Option<PeerFailures>>,

    /// Join handle of the acceptor task.
    acceptor_handle: JoinHandle<()>,

    /// Join handles of peer writer tasks.
    writer_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Binds the listener at `me` and spawns the acceptor task. Returns the
    /// transport and its inbox.
    pub async fn new_and_setup(
        me: Address,
        connect_retries: u8,
    ) -> Result<(Self, Inbox), GridError> {
        let listener = TcpListener::bind(me).await?;
        let me = listener.local_addr()?;
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_fail, rx_fail) = mpsc::unbounded_channel();

        let acceptor_handle =
            tokio::spawn(Self::acceptor_thread(me, listener, tx_recv.clone()));
        pf_info!(me; "accepting peers on '{}'", me);

        Ok((
            TcpTransport {
                me,
                connect_retries,
                tx_sends: Arc::new(Mutex::new(HashMap::new())),
                tx_recv,
                tx_fail,
                rx_fail: Mutex::new(Some(rx_fail)),
                acceptor_handle,
                writer_handles: Mutex::new(vec![]),
            },
            rx_recv,
        ))
    }

    /// Writes a length-prefixed frame through given connection.
    async fn write_frame(
        frame: &[u8],
        conn_write: &mut OwnedWriteHalf,
    ) -> Result<(), GridError> {
        conn_write.write_u64(frame.len() as u64).await?; // send length first
        conn_write.write_all(frame).await?;
        Ok(())
    }

    /// Reads a length-prefixed frame from given connection.
    async fn read_frame(
        conn_read: &mut OwnedReadHalf,
    ) -> Result<Bytes, GridError> {
        let frame_len = conn_read.read_u64().await?; // receive length first
        if frame_len > MAX_FRAME_LEN {
            return Err(GridError::msg(format!(
                "frame length {} exceeds limit",
                frame_len
            )));
        }
        let mut frame_buf: Vec<u8> = vec![0; frame_len as usize];
        conn_read.read_exact(&mut frame_buf[..]).await?;
        Ok(Bytes::from(frame_buf))
    }

    /// Acceptor task function.
    async fn acceptor_thread(
        me: Address,
        listener: TcpListener,
        tx_recv: mpsc::UnboundedSender<(Address, Bytes)>,
    ) {
        pf_debug!(me; "acceptor thread spawned");

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!(me; "error accepting peer connection: {}", e);
                    continue;
                }
            };
            tokio::spawn(Self::reader_thread(me, addr, stream, tx_recv.clone()));
        }
    }

    /// Peer reader task function.
    async fn reader_thread(
        me: Address,
        conn_addr: Address,
        stream: TcpStream,
        tx_recv: mpsc::UnboundedSender<(Address, Bytes)>,
    ) {
        let (mut conn_read, _conn_write) = stream.into_split();

        // first frame is the peer's listen address
        let peer = match Self::read_frame(&mut conn_read).await {
            Ok(frame) => match to_object::<Address>(&frame) {
                Ok(peer) => peer,
                Err(e) => {
                    pf_error!(me; "bad handshake from {}: {}", conn_addr, e);
                    return;
                }
            },
            Err(e) => {
                pf_error!(me; "error reading handshake from {}: {}", conn_addr, e);
                return;
            }
        };
        pf_debug!(me; "reader thread for {} ({}) spawned", peer, conn_addr);

        loop {
            match Self::read_frame(&mut conn_read).await {
                Ok(frame) => {
                    if tx_recv.send((peer, frame)).is_err() {
                        break; // inbox dropped
                    }
                }
                Err(e) => {
                    pf_debug!(me; "connection from {} closed: {}", peer, e);
                    break;
                }
            }
        }

        pf_debug!(me; "reader thread for {} exitted", peer);
    }

    /// Connects to `peer` with retry, sends the handshake, then drains the
    /// send channel onto the connection. Returns the failure cause if the
    /// peer could not be reached or the connection broke.
    async fn pump_to_peer(
        me: Address,
        peer: Address,
        connect_retries: u8,
        rx_send: &mut mpsc::UnboundedReceiver<Bytes>,
    ) -> Result<(), String> {
        let mut stream = None;
        let mut last_err = String::new();
        for attempt in 0..connect_retries.max(1) {
            match TcpStream::connect(peer).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    pf_debug!(me; "connect to {} attempt {} failed: {}",
                                  peer, attempt, e);
                    last_err = e.to_string();
                    if attempt + 1 < connect_retries {
                        sleep(Duration::from_millis(50 << attempt.min(5))).await;
                    }
                }
            }
        }
        let stream = stream.ok_or_else(|| {
            format!("no connection after {} attempts: {}", connect_retries.max(1), last_err)
        })?;

        let (_conn_read, mut conn_write) = stream.into_split();
        let handshake = to_data(&me).map_err(|e| e.to_string())?;
        Self::write_frame(&handshake, &mut conn_write)
            .await
            .map_err(|e| format!("handshake failed: {}", e))?;
        while let Some(frame) = rx_send.recv().await {
            Self::write_frame(&frame, &mut conn_write)
                .await
                .map_err(|e| format!("write failed: {}", e))?;
        }
        Ok(())
    }

    /// Peer writer task function.
    async fn writer_thread(
        me: Address,
        peer: Address,
        connect_retries: u8,
        mut rx_send: mpsc::UnboundedReceiver<Bytes>,
        tx_sends: Arc<Mutex<HashMap<Address, mpsc::UnboundedSender<Bytes>>>>,
        tx_fail: mpsc::UnboundedSender<(Address, String)>,
    ) {
        pf_debug!(me; "writer thread for {} spawned", peer);

        let outcome =
            Self::pump_to_peer(me, peer, connect_retries, &mut rx_send).await;

        // refuse further frames, then forget this writer so that the next
        // send spawns a fresh one
        rx_send.close();
        let mut lost = 0;
        while rx_send.try_recv().is_ok() {
            lost += 1;
        }
        {
            let mut tx_sends = tx_sends.lock().unwrap_or_else(|e| e.into_inner());
            if tx_sends.get(&peer).map_or(false, |tx| tx.is_closed()) {
                tx_sends.remove(&peer);
            }
        }

        if let Err(cause) = outcome {
            pf_warn!(me; "peer {} unreachable, {} queued frames lost: {}",
                         peer, lost, cause);
            // nobody listening is fine
            let _ = tx_fail.send((peer, cause));
        }
        pf_debug!(me; "writer thread for {} exitted", peer);
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> Address {
        self.me
    }

    fn send(&self, to: Address, frame: Bytes) -> Result<(), GridError> {
        if to == self.me {
            // loopback without touching the network
            return self.tx_recv.send((self.me, frame)).map_err(|e| {
                GridError::Unreachable {
                    target: to,
                    cause: e.to_string(),
                }
            });
        }

        let mut tx_sends =
            self.tx_sends.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx_send) = tx_sends.get(&to) {
            if tx_send.send(frame.clone()).is_ok() {
                return Ok(());
            }
            tx_sends.remove(&to);
        }

        // no live writer for this peer yet, spawn one
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_send.send(frame).map_err(|e| GridError::Unreachable {
            target: to,
            cause: e.to_string(),
        })?;
        tx_sends.insert(to, tx_send);
        let handle = tokio::spawn(Self::writer_thread(
            self.me,
            to,
            self.connect_retries,
            rx_send,
            self.tx_sends.clone(),
            self.tx_fail.clone(),
        ));
        self.writer_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        Ok(())
    }

    fn take_failures(&self) -> Option<PeerFailures> {
        self.rx_fail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    async fn shutdown(&self) {
        self.acceptor_handle.abort();
        self.tx_sends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        for handle in self
            .writer_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
        pf_debug!(self.me; "tcp transport shut down");
    }
}
