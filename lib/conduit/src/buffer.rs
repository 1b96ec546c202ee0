//! The single caller-sized receive buffer with its restartable reassembly
//! cursor, and the pool of staging buffers used to build outgoing packets.

use crate::error::{ErrorKind, Fault, NetError, NetResult};
use crate::frame::LENGTH_SIZE;
use byteorder::{BigEndian, ByteOrder};
use std::io;
use std::io::Read;

/// Reassembles one length-prefixed packet at a time. `bytes_left == 0`
/// means no packet is in flight; otherwise that many bytes remain to
/// complete either the 2-byte length prefix or the body it announced.
pub struct PacketBuffer {
    data: Box<[u8]>,
    bytes_received: usize,
    bytes_left: usize,
}

impl PacketBuffer {
    #[inline]
    pub fn new(size: usize) -> PacketBuffer {
        PacketBuffer {
            data: vec![0u8; size].into_boxed_slice(),
            bytes_received: 0,
            bytes_left: 0,
        }
    }

    /// Total capacity of the buffer.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// True when no packet is being assembled.
    #[inline]
    pub fn idle(&self) -> bool {
        self.bytes_left == 0
    }

    /// Reads until the current packet is complete. Returns the full packet
    /// length (including the length prefix) once assembled; `Wait` parks
    /// the cursor for the next readiness event. A frame whose announced
    /// length cannot fit the buffer fails before any payload is read.
    pub fn read_packet<R: Read>(&mut self, stream: &mut R) -> NetResult<usize> {
        if self.bytes_left == 0 {
            // Every packet is prefixed with its length, read that first
            self.bytes_received = 0;
            self.bytes_left = LENGTH_SIZE;
        }

        self.fill(stream)?;

        if self.bytes_received == LENGTH_SIZE {
            let size = BigEndian::read_u16(&self.data[..LENGTH_SIZE]) as usize;

            if size + LENGTH_SIZE > self.data.len() {
                return Err(NetError::Fatal(Fault::new(ErrorKind::BufferExceeded)));
            }

            self.bytes_left = size;
            self.fill(stream)?;
        }

        Ok(self.bytes_received)
    }

    /// The assembled packet.
    #[inline]
    pub fn packet(&mut self) -> &mut [u8] {
        &mut self.data[..self.bytes_received]
    }

    fn fill<R: Read>(&mut self, stream: &mut R) -> NetResult<()> {
        while self.bytes_left > 0 {
            let start = self.bytes_received;
            let end = start + self.bytes_left;

            match stream.read(&mut self.data[start..end]) {
                // An orderly shutdown mid-frame is a failure for this
                // protocol; the dying path never reaches the reader.
                Ok(0) => return Err(NetError::Fatal(Fault::new(ErrorKind::Socket))),
                Ok(count) => {
                    self.bytes_received += count;
                    self.bytes_left -= count;
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(())
    }
}

/// Stack of staging buffers for outgoing packets, all sized to the caller's
/// buffer size. Ownership of a buffer moves out on `get` and back on `put`;
/// at most one outgoing frame occupies a buffer at a time.
pub struct BufferPool {
    size: usize,
    free: Vec<Box<[u8]>>,
}

impl BufferPool {
    #[inline]
    pub fn new(size: usize) -> BufferPool {
        BufferPool {
            size,
            free: Vec::new(),
        }
    }

    #[inline]
    pub fn get(&mut self) -> Box<[u8]> {
        self.free
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size].into_boxed_slice())
    }

    #[inline]
    pub fn put(&mut self, buffer: Box<[u8]>) {
        debug_assert_eq!(buffer.len(), self.size);
        self.free.push(buffer);
    }
}
