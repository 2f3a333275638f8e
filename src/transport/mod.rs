//! Transport abstraction.
//!
//! The engine owns a duplex byte stream but not its construction: TLS,
//! QUIC, accept/connect, and certificate handling live outside the crate.
//! Anything async-readable and -writable can carry a tunnel; transports
//! that can export keying material (the TLS exporter) additionally enable
//! channel-bound authentication proofs.
//!
//! An in-memory pair built on `tokio::io::duplex` ships here for tests and
//! loopback wiring.

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use rand::RngCore;
use std::pin::Pin;
use std::task::{Context, Poll};

/// ALPN protocol name for TLS/QUIC transports.
pub const ALPN: &str = "rabbit/1";

/// Default TCP/QUIC port.
pub const DEFAULT_PORT: u16 = 7443;

/// A duplex byte stream that can carry one tunnel.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Keying material exported from the underlying secure channel.
    ///
    /// Returns `None` when the transport cannot export (the handshake then
    /// falls back to single-use server nonces).
    fn exported_keying_material(&self, label: &str, len: usize) -> Option<Vec<u8>> {
        let _ = (label, len);
        None
    }
}

/// In-memory transport half, for tests and same-process tunnels.
///
/// Both halves of a pair report the same synthetic keying material, so the
/// channel-binding path is exercisable without a TLS stack.
pub struct MemoryTransport {
    inner: DuplexStream,
    keying_material: Vec<u8>,
}

/// Create a connected pair of in-memory transports.
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a, b) = tokio::io::duplex(capacity);
    let mut keying_material = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut keying_material);
    (
        MemoryTransport { inner: a, keying_material: keying_material.clone() },
        MemoryTransport { inner: b, keying_material },
    )
}

impl Transport for MemoryTransport {
    fn exported_keying_material(&self, label: &str, len: usize) -> Option<Vec<u8>> {
        // Derive per-label material from the shared secret so distinct
        // labels do not collide.
        let mut out = Vec::with_capacity(len);
        let label = label.as_bytes();
        let mut i = 0usize;
        while out.len() < len {
            let k = self.keying_material[i % self.keying_material.len()];
            let l = label[i % label.len().max(1)];
            out.push(k ^ l ^ (i as u8));
            i += 1;
        }
        Some(out)
    }
}

impl AsyncRead for MemoryTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
