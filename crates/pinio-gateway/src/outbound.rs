//! Outbound chunk chain.
//!
//! Holds the bytes a pin has accepted from `send` but not yet handed to
//! the socket port. The chunk currently being sent is owned by its
//! operation, not by the chain; it comes back through [`Outbound::complete`]
//! and returns to the front if anything is left in it.

use crate::frame::{decode_header, encode_header, frame_len, max_payload, FRAME_HEADER};

use pinio_core::buffer::{Chunk, ChunkProvider, CHUNK_SIZE};
use pinio_core::entry::SocketKind;
use pinio_core::error::{Error, Result};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::Range;

/// One send ready for the socket port.
#[derive(Debug)]
pub struct PendingSend {
    pub chunk: Chunk,
    pub span: Range<usize>,
    pub to: Option<SocketAddr>,
}

#[derive(Debug)]
pub struct Outbound {
    kind: SocketKind,
    chunks: VecDeque<Chunk>,
}

impl Outbound {
    pub fn new(kind: SocketKind) -> Self {
        Self {
            kind,
            chunks: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks held (excluding one in flight).
    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Unsent bytes held, frame headers included.
    pub fn pending_bytes(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    /// Index of the first chunk new bytes go into, after `fresh` pages
    /// were appended to a chain that had `before` chunks.
    fn fill_start(&self, before: usize) -> usize {
        match before {
            0 => 0,
            n if self.chunks[n - 1].spare() > 0 => n - 1,
            n => n,
        }
    }

    /// Append stream bytes. Every page needed is taken up front, so on
    /// `Err(NoMemory)` the chain is unchanged.
    pub fn push_stream(&mut self, bufs: &[&[u8]], pages: &dyn ChunkProvider) -> Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Ok(0);
        }
        let spare = self.chunks.back().map_or(0, Chunk::spare);
        let need = total.saturating_sub(spare).div_ceil(CHUNK_SIZE);
        let fresh = pages.alloc_many(need).ok_or(Error::NoMemory)?;

        let before = self.chunks.len();
        self.chunks.extend(fresh);
        let mut idx = self.fill_start(before);
        for buf in bufs {
            let mut rest = *buf;
            while !rest.is_empty() {
                let chunk = &mut self.chunks[idx];
                if chunk.spare() == 0 {
                    idx += 1;
                    continue;
                }
                let n = chunk.append(rest);
                rest = &rest[n..];
            }
        }
        Ok(total)
    }

    /// Append one framed datagram per buffer, all to `to`. A frame never
    /// spans pages. All-or-nothing like [`push_stream`](Self::push_stream).
    pub fn push_datagrams(
        &mut self,
        bufs: &[&[u8]],
        to: SocketAddr,
        pages: &dyn ChunkProvider,
    ) -> Result<usize> {
        let limit = max_payload(&to);
        if let Some(big) = bufs.iter().find(|b| b.len() > limit) {
            return Err(Error::TooLarge(big.len()));
        }
        if bufs.is_empty() {
            return Ok(0);
        }

        let mut spare = self.chunks.back().map_or(0, Chunk::spare);
        let mut need = 0;
        for buf in bufs {
            let len = frame_len(buf.len());
            if len > spare {
                need += 1;
                spare = CHUNK_SIZE;
            }
            spare -= len;
        }
        let fresh = pages.alloc_many(need).ok_or(Error::NoMemory)?;

        let before = self.chunks.len();
        self.chunks.extend(fresh);
        let mut idx = self.fill_start(before);
        let mut total = 0;
        for buf in bufs {
            if self.chunks[idx].spare() < frame_len(buf.len()) {
                idx += 1;
            }
            let chunk = &mut self.chunks[idx];
            encode_header(chunk.unfilled_mut(), to, buf.len());
            chunk.commit(FRAME_HEADER);
            chunk.append(buf);
            total += buf.len();
        }
        Ok(total)
    }

    /// Take the next send off the front of the chain: the whole head
    /// chunk for TCP, the head frame's payload for UDP. A chunk whose
    /// head frame does not decode is dropped and draining moves on.
    pub fn next_send(&mut self) -> Option<PendingSend> {
        loop {
            let chunk = self.chunks.pop_front()?;
            if self.kind != SocketKind::Udp {
                return Some(PendingSend {
                    span: chunk.begin()..chunk.end(),
                    to: None,
                    chunk,
                });
            }
            match decode_header(chunk.filled()) {
                Some((to, len)) if FRAME_HEADER + len <= chunk.len() => {
                    let start = chunk.begin() + FRAME_HEADER;
                    return Some(PendingSend {
                        span: start..start + len,
                        to: Some(to),
                        chunk,
                    });
                }
                _ => tracing::error!(?chunk, "corrupt datagram frame dropped"),
            }
        }
    }

    /// Account for a finished send of `bytes` from `chunk`. A datagram
    /// counts as fully sent. Drained chunks are dropped.
    pub fn complete(&mut self, mut chunk: Chunk, bytes: usize) {
        let consumed = match self.kind {
            SocketKind::Udp => decode_header(chunk.filled())
                .map_or(chunk.len(), |(_, len)| frame_len(len)),
            _ => bytes,
        };
        chunk.advance(consumed.min(chunk.len()));
        if !chunk.is_empty() {
            self.chunks.push_front(chunk);
        }
    }

    /// Drop everything not yet sent. Returns the bytes discarded.
    pub fn clear(&mut self) -> usize {
        let bytes = self.pending_bytes();
        self.chunks.clear();
        bytes
    }
}
