//! The two socket kinds a peer connection can ride on, behind one trait.
//!
//! The encrypted layer and everything above it never care whether bytes
//! travel over a direct TCP connection or the UDP tunnel.

use std::{io, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
};

use tether_transport::TouConnection;

/// Which transport carries this link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    TcpDirect,
    UdpTunnel,
}

/// A bidirectional, reliable, unencrypted byte stream to one peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Write all of `data`.
    async fn send(&self, data: &[u8]) -> io::Result<()>;
    /// Read some bytes; 0 means EOF.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Begin teardown. Idempotent.
    fn close(&self);
    fn kind(&self) -> LinkKind;
}

/// Direct TCP link.
pub struct TcpLink {
    reader: Mutex<OwnedReadHalf>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl TcpLink {
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

#[async_trait]
impl PeerLink for TcpLink {
    async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    fn close(&self) {
        // Shutdown the write half so the peer's pending reads see EOF.
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let _ = writer.lock().await.shutdown().await;
        });
    }

    fn kind(&self) -> LinkKind {
        LinkKind::TcpDirect
    }
}

/// In-memory link pair for tests and local loopback wiring.
pub struct MemoryLink {
    tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<(tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>, Vec<u8>)>,
}

/// Two connected [`MemoryLink`]s.
pub fn memory_pair() -> (Arc<MemoryLink>, Arc<MemoryLink>) {
    let (tx_a, rx_a) = tokio::sync::mpsc::unbounded_channel();
    let (tx_b, rx_b) = tokio::sync::mpsc::unbounded_channel();
    let a = Arc::new(MemoryLink {
        tx: tx_a,
        rx: Mutex::new((rx_b, Vec::new())),
    });
    let b = Arc::new(MemoryLink {
        tx: tx_b,
        rx: Mutex::new((rx_a, Vec::new())),
    });
    (a, b)
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn send(&self, data: &[u8]) -> io::Result<()> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.rx.lock().await;
        if guard.1.is_empty() {
            match guard.0.recv().await {
                Some(chunk) => guard.1 = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(guard.1.len());
        buf[..n].copy_from_slice(&guard.1[..n]);
        guard.1.drain(..n);
        Ok(n)
    }

    fn close(&self) {}

    fn kind(&self) -> LinkKind {
        LinkKind::UdpTunnel
    }
}

/// UDP-tunneled link over the shared socket.
pub struct TouLink {
    conn: Arc<TouConnection>,
}

impl TouLink {
    pub fn new(conn: Arc<TouConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl PeerLink for TouLink {
    async fn send(&self, data: &[u8]) -> io::Result<()> {
        self.conn.write(data).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.read(buf).await
    }

    fn close(&self) {
        self.conn.close();
    }

    fn kind(&self) -> LinkKind {
        LinkKind::UdpTunnel
    }
}
