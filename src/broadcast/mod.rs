//! UDP broadcast to downstream consumers
//!
//! Every spill is announced on a datagram socket. In notification mode the
//! announcement is a small metadata packet (see
//! [`crate::output::OutputFile::send_packet`]); in chunked mode the spill
//! payload itself is split into datagrams of at most [`SPILL_CHUNK_WORDS`]
//! words, framed as `[chunk_index, total_chunks, payload…]` with 1-based
//! indices. Lifecycle control messages keep the legacy wire sizes.

use crate::common::Word;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::debug;

/// Maximum payload words per chunked-spill datagram.
pub const SPILL_CHUNK_WORDS: usize = 4050;

/// Sent when an output file opens. 12 bytes on the wire: the historical
/// sender declared 12 while the string has 10 characters, and downstream
/// consumers depend on the padded layout.
pub const OPEN_FILE_MSG: &[u8; 12] = b"$OPEN_FILE\0\0";

/// Sent when the output file closes (11 characters + NUL).
pub const CLOSE_FILE_MSG: &[u8; 12] = b"$CLOSE_FILE\0";

/// Sent once at teardown (12 characters + NUL).
pub const KILL_SOCKET_MSG: &[u8; 13] = b"$KILL_SOCKET\0";

/// Datagram sender bound to an ephemeral local port.
pub struct BroadcastClient {
    socket: UdpSocket,
    endpoint: SocketAddr,
}

impl BroadcastClient {
    /// Create a client targeting `endpoint` (e.g. `127.0.0.1:5555`).
    pub fn new(endpoint: &str) -> std::io::Result<Self> {
        let endpoint = endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::other("endpoint resolved to no address"))?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self { socket, endpoint })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Send one datagram.
    pub fn send_message(&self, payload: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(payload, self.endpoint)
    }

    /// Broadcast a spill as a sequence of chunked datagrams.
    ///
    /// `ceil(words / 4050)` datagrams are sent; the final one carries the
    /// remainder. A 1 µs pause between datagrams paces the receiver.
    pub fn send_spill(&self, words: &[Word]) -> std::io::Result<()> {
        let total_chunks = words.len().div_ceil(SPILL_CHUNK_WORDS).max(1) as u32;
        debug!(
            words = words.len(),
            chunks = total_chunks,
            fragment = words.len() % SPILL_CHUNK_WORDS,
            "splitting spill into network chunks"
        );

        let mut frame = Vec::with_capacity(8 + SPILL_CHUNK_WORDS * 4);
        for (index, chunk) in words.chunks(SPILL_CHUNK_WORDS).enumerate() {
            frame.clear();
            frame.extend_from_slice(&(index as u32 + 1).to_le_bytes());
            frame.extend_from_slice(&total_chunks.to_le_bytes());
            for word in chunk {
                frame.extend_from_slice(&word.to_le_bytes());
            }
            self.send_message(&frame)?;
            std::thread::sleep(Duration::from_micros(1));
        }
        Ok(())
    }
}
