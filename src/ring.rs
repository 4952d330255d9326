// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Circular staging of variable-length packets inside one buffer.
//!
//! Reservations never straddle the end of the buffer: when the contiguous
//! run at the write position is too short the reservation starts again at
//! offset zero and the skipped tail is accounted as a gap until the
//! reservation is released. Releases are strictly FIFO.

use crate::{
    buffer::BufRef,
    error::{Error, Result},
};
use std::collections::VecDeque;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
struct Pending {
    seq: u64,
    start: usize,
    size: usize,
    gap: usize,
}

/// A client view of one reservation.
#[derive(Debug)]
pub struct RingBuf {
    seq: u64,
    start_offset: usize,
    r_pos: usize,
    use_len: usize,
    size: usize,
    cir_flag: bool,
}

impl RingBuf {
    /// Offset of the reservation inside the pool buffer.
    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    /// Consumer cursor.
    pub fn r_pos(&self) -> usize {
        self.r_pos
    }

    /// Bytes produced so far.
    pub fn use_len(&self) -> usize {
        self.use_len
    }

    /// Reserved size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The reservation wrapped to the start of the buffer.
    pub fn cir_flag(&self) -> bool {
        self.cir_flag
    }
}

/// Ring allocator over one buffer.
pub struct RingBufPool {
    buf: BufRef,
    len: usize,
    r_pos: usize,
    w_pos: usize,
    use_len: usize,
    min_buf_size: usize,
    l_r_pos: usize,
    l_w_pos: usize,
    max_use_len: usize,
    seq: u64,
    pending: VecDeque<Pending>,
}

impl RingBufPool {
    /// Takes ownership of one buffer reference. Reservations are rounded up
    /// to `min_buf_size`.
    pub fn new(buf: BufRef, min_buf_size: usize) -> Result<Self> {
        let len = buf.size();
        if len == 0 || min_buf_size > len {
            return Err(Error::state(format!(
                "ring of {len} bytes with minimum {min_buf_size}"
            )));
        }
        debug!("ring on buffer {} len {len}", buf.uid());
        Ok(Self {
            buf,
            len,
            r_pos: 0,
            w_pos: 0,
            use_len: 0,
            min_buf_size,
            l_r_pos: 0,
            l_w_pos: 0,
            max_use_len: 0,
            seq: 0,
            pending: VecDeque::new(),
        })
    }

    pub fn buffer(&self) -> &BufRef {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.use_len == 0
    }

    pub fn use_len(&self) -> usize {
        self.use_len
    }

    pub fn free_len(&self) -> usize {
        self.len - self.use_len
    }

    /// Highest `use_len` seen since creation or the last reset.
    pub fn max_use_len(&self) -> usize {
        self.max_use_len
    }

    pub fn r_pos(&self) -> usize {
        self.r_pos
    }

    pub fn w_pos(&self) -> usize {
        self.w_pos
    }

    /// Start of the last released reservation.
    pub fn last_r_pos(&self) -> usize {
        self.l_r_pos
    }

    /// Start of the last reservation.
    pub fn last_w_pos(&self) -> usize {
        self.l_w_pos
    }

    /// Reserves `size` bytes, wrapping to the start when the tail is too
    /// short.
    pub fn reserve(&mut self, size: usize) -> Result<RingBuf> {
        let size = size.max(self.min_buf_size);
        let free = self.free_len();
        if size > free {
            return Err(Error::BufferFull {
                requested: size,
                available: free,
            });
        }
        if self.use_len == 0 {
            self.r_pos = 0;
            self.w_pos = 0;
        }

        let (start, gap) = if self.w_pos >= self.r_pos && self.use_len < self.len {
            let tail = self.len - self.w_pos;
            if size <= tail {
                (self.w_pos, 0)
            } else if size <= self.r_pos {
                (0, tail)
            } else {
                return Err(Error::BufferFull {
                    requested: size,
                    available: tail.max(self.r_pos),
                });
            }
        } else {
            (self.w_pos, 0)
        };

        if gap > 0 {
            debug!("ring wraps at {} leaving {gap} bytes", self.w_pos);
        }
        self.use_len += gap + size;
        self.w_pos = (start + size) % self.len;
        self.l_w_pos = start;
        self.max_use_len = self.max_use_len.max(self.use_len);
        self.seq += 1;
        self.pending.push_back(Pending {
            seq: self.seq,
            start,
            size,
            gap,
        });
        trace!("ring reserve {size} at {start} use {}", self.use_len);
        Ok(RingBuf {
            seq: self.seq,
            start_offset: start,
            r_pos: 0,
            use_len: 0,
            size,
            cir_flag: gap > 0,
        })
    }

    /// Appends produced bytes to a reservation.
    pub fn write(&self, ring: &mut RingBuf, data: &[u8]) -> Result<()> {
        let available = ring.size - ring.use_len;
        if data.len() > available {
            return Err(Error::BufferFull {
                requested: data.len(),
                available,
            });
        }
        self.buf.write(ring.start_offset + ring.use_len, data)?;
        ring.use_len += data.len();
        Ok(())
    }

    /// Reads produced bytes from the consumer cursor. Returns the number of
    /// bytes read.
    pub fn read(&self, ring: &mut RingBuf, out: &mut [u8]) -> Result<usize> {
        let len = out.len().min(ring.use_len - ring.r_pos);
        self.buf
            .read(ring.start_offset + ring.r_pos, &mut out[..len])?;
        ring.r_pos += len;
        Ok(len)
    }

    /// Shrinks the latest reservation to what was produced.
    pub fn commit(&mut self, ring: &mut RingBuf) -> Result<()> {
        let last = self
            .pending
            .back_mut()
            .filter(|p| p.seq == ring.seq)
            .ok_or_else(|| Error::state("commit of a reservation that is not the latest"))?;
        let used = ring.use_len.max(self.min_buf_size).min(last.size);
        let unused = last.size - used;
        last.size = used;
        self.use_len -= unused;
        self.w_pos = (last.start + used) % self.len;
        ring.size = used;
        Ok(())
    }

    /// Releases the oldest reservation.
    pub fn release(&mut self, ring: RingBuf) -> Result<()> {
        let first = self
            .pending
            .front()
            .copied()
            .filter(|p| p.seq == ring.seq)
            .ok_or_else(|| Error::state("ring release out of order"))?;
        self.pending.pop_front();
        self.use_len -= first.gap + first.size;
        self.r_pos = (first.start + first.size) % self.len;
        self.l_r_pos = first.start;
        if self.use_len == 0 {
            self.r_pos = self.w_pos;
        }
        trace!("ring release {} at {} use {}", first.size, first.start, self.use_len);
        Ok(())
    }

    /// Drops every reservation.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.r_pos = 0;
        self.w_pos = 0;
        self.use_len = 0;
        self.l_r_pos = 0;
        self.l_w_pos = 0;
        self.max_use_len = 0;
    }
}
