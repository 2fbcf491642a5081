//! In-memory byte pipes between two endpoints.
//!
//! A [`Pipe`] is a bounded FIFO of bytes that never blocks: writes into a
//! full pipe and reads from an empty one report "would block" instead. Two
//! pipes form a [`PipePair`], the only transport between a client and a
//! server endpoint. Endpoints never own pipes; they borrow both directions
//! for the duration of one step through a [`Link`].
//!
//! `Pipe` also implements [`io::Read`] and [`io::Write`], mapping the
//! would-block case onto [`io::ErrorKind::WouldBlock`], so libraries that
//! speak `std::io` can be bound to it directly.

use std::{collections::VecDeque, io};

/// Default capacity of each direction, in bytes.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Bounded, non-blocking byte queue.
#[derive(Debug, Clone)]
pub struct Pipe {
    buf: VecDeque<u8>,
    capacity: usize,
    written: u64,
}

impl Pipe {
    /// Create an empty pipe holding at most `capacity` bytes (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { buf: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)), capacity, written: 0 }
    }

    /// Bytes written but not yet read.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Maximum number of bytes the pipe holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free space left before writes start to block.
    pub fn room(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Total bytes ever accepted by [`Pipe::push`].
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Append as much of `bytes` as fits.
    ///
    /// Returns the number of bytes accepted, or `None` when the pipe is full
    /// and `bytes` is non-empty.
    pub fn push(&mut self, bytes: &[u8]) -> Option<usize> {
        if bytes.is_empty() {
            return Some(0);
        }

        let n = bytes.len().min(self.room());
        if n == 0 {
            return None;
        }

        self.buf.extend(&bytes[..n]);
        self.written += n as u64;
        Some(n)
    }

    /// Move up to `out.len()` bytes into `out`.
    ///
    /// Returns the number of bytes moved, or `None` when the pipe is empty
    /// and `out` is non-empty.
    pub fn pull(&mut self, out: &mut [u8]) -> Option<usize> {
        if out.is_empty() {
            return Some(0);
        }
        if self.buf.is_empty() {
            return None;
        }

        let n = out.len().min(self.buf.len());
        for (slot, byte) in out.iter_mut().zip(self.buf.drain(..n)) {
            *slot = byte;
        }
        Some(n)
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl io::Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pull(buf).ok_or_else(|| io::ErrorKind::WouldBlock.into())
    }
}

impl io::Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf).ok_or_else(|| io::ErrorKind::WouldBlock.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The two directions of one simulated connection.
#[derive(Debug, Clone, Default)]
pub struct PipePair {
    /// Bytes produced by the client, consumed by the server.
    pub client_to_server: Pipe,
    /// Bytes produced by the server, consumed by the client.
    pub server_to_client: Pipe,
}

impl PipePair {
    /// Create a pair whose directions each hold `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self { client_to_server: Pipe::new(capacity), server_to_client: Pipe::new(capacity) }
    }

    /// Borrow the pipes as seen from the client.
    pub fn client_link(&mut self) -> Link<'_> {
        Link { inbound: &mut self.server_to_client, outbound: &mut self.client_to_server }
    }

    /// Borrow the pipes as seen from the server.
    pub fn server_link(&mut self) -> Link<'_> {
        Link { inbound: &mut self.client_to_server, outbound: &mut self.server_to_client }
    }
}

/// One endpoint's view of a pipe pair for the duration of a step.
#[derive(Debug)]
pub struct Link<'a> {
    /// Pipe this endpoint reads from.
    pub inbound: &'a mut Pipe,
    /// Pipe this endpoint writes to.
    pub outbound: &'a mut Pipe,
}

impl Link<'_> {
    /// Bytes waiting to be read by this endpoint.
    pub fn pending(&self) -> usize {
        self.inbound.pending()
    }
}
