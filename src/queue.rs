//! Reliable packet queues
//!
//! The tunnel only ever has one request in flight, so reliability comes from
//! repetition: the sender keeps offering the head of its [`OutQueue`] until
//! the peer acknowledges it, and the receiver's [`InQueue`] drops duplicates
//! and buffers packets that arrive ahead of the next expected sequence
//! number.

use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};

use crate::error::{Result, TunnelError};

/// Bound on every acknowledgement and reordering window
pub const WINDOW_SIZE: usize = 128;

/// Furthest ahead of the expected sequence number a packet may arrive
const MAX_AHEAD: u16 = WINDOW_SIZE as u16 - 1;

/// Unit of reliable transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: u16,
    pub data: Vec<u8>,
}

/// Bounded set of recently acknowledged sequence numbers, oldest evicted first
#[derive(Debug, Default)]
pub struct AckWindow {
    seqs: VecDeque<u16>,
}

impl AckWindow {
    pub fn contains(&self, seq: u16) -> bool {
        self.seqs.contains(&seq)
    }

    /// Record `seq`; returns false if it was already present
    pub fn insert(&mut self, seq: u16) -> bool {
        if self.contains(seq) {
            return false;
        }
        if self.seqs.len() == WINDOW_SIZE {
            self.seqs.pop_front();
        }
        self.seqs.push_back(seq);
        true
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }
}

#[derive(Debug, Default)]
struct OutState {
    next_seq: u16,
    pending: VecDeque<Packet>,
    acked: AckWindow,
    closed: bool,
}

/// Chunks waiting for acknowledgement by the peer
#[derive(Debug, Default)]
pub struct OutQueue {
    state: Mutex<OutState>,
    drained: Notify,
    chunk_ready: Notify,
}

impl OutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `data` in chunks of at most `mtu` bytes and wait until the peer
    /// has acknowledged all pending chunks
    pub async fn write(&self, data: &[u8], mtu: usize, deadline: Option<Instant>) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if mtu == 0 {
            return Err(TunnelError::PayloadTooLarge {
                len: data.len(),
                max: 0,
            });
        }

        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(TunnelError::Closed);
            }
            for chunk in data.chunks(mtu) {
                let seq = state.next_seq;
                state.next_seq = seq.wrapping_add(1);
                state.pending.push_back(Packet {
                    seq,
                    data: chunk.to_vec(),
                });
            }
        }
        self.chunk_ready.notify_one();

        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            {
                let state = self.state.lock().await;
                if state.pending.is_empty() {
                    return Ok(data.len());
                }
                if state.closed {
                    return Err(TunnelError::Closed);
                }
            }

            match deadline {
                Some(deadline) => timeout_at(deadline, drained)
                    .await
                    .map_err(|_| TunnelError::DeadlineExceeded)?,
                None => drained.await,
            }
        }
    }

    /// Earliest unacknowledged chunk, left in place
    pub async fn next_chunk(&self) -> Option<Packet> {
        self.state.lock().await.pending.front().cloned()
    }

    /// Up to `n` earliest unacknowledged chunks, left in place
    pub async fn next_chunks(&self, n: usize) -> Vec<Packet> {
        self.state.lock().await.pending.iter().take(n).cloned().collect()
    }

    /// Mark `seq` acknowledged. Unknown or repeated acks are ignored.
    pub async fn update_acked(&self, seq: u16) {
        let mut state = self.state.lock().await;
        if !state.acked.insert(seq) {
            return;
        }
        if let Some(pos) = state.pending.iter().position(|p| p.seq == seq) {
            state.pending.remove(pos);
        }
        if state.pending.is_empty() {
            self.drained.notify_waiters();
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    /// Resolves when a writer has queued new chunks
    pub async fn chunk_ready(&self) {
        self.chunk_ready.notified().await
    }

    /// Wake the poller without queueing anything
    pub fn nudge(&self) {
        self.chunk_ready.notify_one();
    }

    /// Fail pending and future writes
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.drained.notify_waiters();
        self.chunk_ready.notify_waiters();
    }
}

#[derive(Debug, Default)]
struct InState {
    next_seq: u16,
    buffer: VecDeque<u8>,
    future: VecDeque<Packet>,
    acked: AckWindow,
    last_acked: Option<u16>,
    closed: bool,
}

/// Reassembles received packets into an ordered byte stream
#[derive(Debug, Default)]
pub struct InQueue {
    state: Mutex<InState>,
    readable: Notify,
}

impl InQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a packet from the peer. Duplicates are ignored; a packet more
    /// than 127 ahead of the next expected one is a desynchronisation.
    pub async fn append(&self, packet: Option<Packet>) -> Result<()> {
        let Some(packet) = packet else {
            return Ok(());
        };
        let mut state = self.state.lock().await;

        if state.acked.contains(packet.seq) {
            state.last_acked = Some(packet.seq);
            return Ok(());
        }

        let ahead = packet.seq.wrapping_sub(state.next_seq);
        if ahead == 0 {
            let seq = packet.seq;
            state.buffer.extend(packet.data);
            state.next_seq = seq.wrapping_add(1);
            state.acked.insert(seq);
            state.last_acked = Some(seq);

            while let Some(pos) = state.future.iter().position(|p| p.seq == state.next_seq) {
                if let Some(next) = state.future.remove(pos) {
                    state.buffer.extend(next.data);
                    state.next_seq = state.next_seq.wrapping_add(1);
                }
            }
            drop(state);
            self.readable.notify_waiters();
        } else if ahead <= MAX_AHEAD {
            state.acked.insert(packet.seq);
            state.last_acked = Some(packet.seq);
            if state.future.len() == WINDOW_SIZE {
                state.future.pop_front();
            }
            state.future.push_back(packet);
        } else {
            return Err(TunnelError::SequenceDesync {
                expected: state.next_seq,
                got: packet.seq,
            });
        }
        Ok(())
    }

    /// Sequence number to acknowledge in the next request
    pub async fn last_acked(&self) -> Option<u16> {
        self.state.lock().await.last_acked
    }

    /// Wait for buffered bytes and copy as many as fit into `buf`. Returns 0
    /// once the queue is closed and drained.
    pub async fn read(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if !state.buffer.is_empty() {
                    let n = buf.len().min(state.buffer.len());
                    for (dst, src) in buf.iter_mut().zip(state.buffer.drain(..n)) {
                        *dst = src;
                    }
                    return Ok(n);
                }
                if state.closed {
                    return Ok(0);
                }
            }

            match deadline {
                Some(deadline) => timeout_at(deadline, readable)
                    .await
                    .map_err(|_| TunnelError::DeadlineExceeded)?,
                None => readable.await,
            }
        }
    }

    /// Bytes ready to be read
    pub async fn buffered(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.readable.notify_waiters();
    }
}
