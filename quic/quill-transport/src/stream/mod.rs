// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-stream state: out-of-order reassembly on receive, a byte queue on
//! send, and the FIN / RESET / STOP_SENDING signalling flags.
//!
//! Streams are long-lived and few, so the table is a flat vector probed
//! linearly.

use bytes::Bytes;
use quill_core::{sack::SackList, stream::StreamId, transport::Error};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Stream condition flags, mirroring the signalling lifecycle of FIN,
/// RESET and STOP_SENDING on both directions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamFlags(u32);

macro_rules! stream_flag {
    ($get:ident, $set:ident, $bit:expr) => {
        #[inline]
        pub fn $get(self) -> bool {
            self.0 & $bit != 0
        }

        #[inline]
        pub fn $set(&mut self) {
            self.0 |= $bit;
        }
    };
}

impl StreamFlags {
    stream_flag!(fin_received, set_fin_received, 0x0001);
    stream_flag!(fin_signalled, set_fin_signalled, 0x0002);
    stream_flag!(fin_notified, set_fin_notified, 0x0004);
    stream_flag!(fin_sent, set_fin_sent, 0x0008);
    stream_flag!(reset_requested, set_reset_requested, 0x0010);
    stream_flag!(reset_sent, set_reset_sent, 0x0020);
    stream_flag!(reset_received, set_reset_received, 0x0040);
    stream_flag!(reset_signalled, set_reset_signalled, 0x0080);
    stream_flag!(stop_sending_requested, set_stop_sending_requested, 0x0100);
    stream_flag!(stop_sending_sent, set_stop_sending_sent, 0x0200);
    stream_flag!(stop_sending_received, set_stop_sending_received, 0x0400);
    stream_flag!(stop_sending_signalled, set_stop_sending_signalled, 0x0800);
}

/// A contiguous run of received data ready for the application
#[derive(Debug, PartialEq, Eq)]
pub struct Deliverable {
    pub offset: u64,
    pub data: Vec<u8>,
    pub fin: bool,
}

#[derive(Debug)]
pub struct StreamHead {
    pub id: StreamId,
    pub consumed_offset: u64,
    pub fin_offset: Option<u64>,
    /// Receive window we granted the peer
    pub maxdata_local: u64,
    /// Send window the peer granted us
    pub maxdata_remote: u64,
    pub flags: StreamFlags,
    pub local_error: u16,
    pub remote_error: u16,
    pub local_stop_error: u16,
    pub remote_stop_error: u16,
    /// Offset-keyed, non-overlapping segments awaiting delivery
    reassembly: BTreeMap<u64, Vec<u8>>,
    /// Which receive offsets have been seen, for duplicate clipping
    received: SackList,
    pub sent_offset: u64,
    send_queue: Vec<Bytes>,
    /// Offset into the front entry of `send_queue`
    send_queue_offset: usize,
    /// FIN requested by the local application
    pub fin_requested: bool,
    /// Send offset at which a STREAM_BLOCKED hint was last emitted
    pub blocked_at: Option<u64>,
}

impl StreamHead {
    pub fn new(id: StreamId, maxdata_local: u64, maxdata_remote: u64) -> Self {
        Self {
            id,
            consumed_offset: 0,
            fin_offset: None,
            maxdata_local,
            maxdata_remote,
            flags: StreamFlags::default(),
            local_error: 0,
            remote_error: 0,
            local_stop_error: 0,
            remote_stop_error: 0,
            reassembly: BTreeMap::new(),
            received: SackList::new(),
            sent_offset: 0,
            send_queue: Vec::new(),
            send_queue_offset: 0,
            fin_requested: false,
            blocked_at: None,
        }
    }

    /// Highest receive offset seen so far (exclusive)
    #[inline]
    pub fn highest_received(&self) -> u64 {
        self.received.largest().map(|end| end + 1).unwrap_or(0)
    }

    /// Accepts stream data from the network.
    ///
    /// Overlapping octets are clipped in favor of the copy already stored.
    /// Returns the count of genuinely new octets, for connection-level
    /// flow accounting.
    pub fn network_input(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<u64, Error> {
        let end = offset + data.len() as u64;

        if fin {
            match self.fin_offset {
                Some(previous) if previous != end => {
                    return Err(Error::FINAL_OFFSET_ERROR.with_reason("conflicting final offset"))
                }
                _ => self.fin_offset = Some(end),
            }
            self.flags.set_fin_received();
        }

        if let Some(fin_offset) = self.fin_offset {
            if end > fin_offset {
                return Err(Error::FINAL_OFFSET_ERROR.with_reason("data beyond final offset"));
            }
        }

        if self.flags.reset_received() || data.is_empty() {
            // data after a reset is discarded; an empty FIN frame only
            // needed the offset bookkeeping above
            return Ok(0);
        }

        // clip against every octet seen before, keeping the stored copy
        let mut new_octets = 0;
        let mut cursor = offset;
        while cursor < end {
            if self.received.contains(cursor) {
                cursor += 1;
                continue;
            }
            let mut run_end = cursor + 1;
            while run_end < end && !self.received.contains(run_end) {
                run_end += 1;
            }

            let slice = &data[(cursor - offset) as usize..(run_end - offset) as usize];
            self.insert_segment(cursor, slice.to_vec());
            self.received.insert(cursor, run_end - 1);
            new_octets += run_end - cursor;
            cursor = run_end;
        }

        Ok(new_octets)
    }

    /// Inserts a non-overlapping segment, merging with direct neighbors
    fn insert_segment(&mut self, offset: u64, data: Vec<u8>) {
        if offset + (data.len() as u64) <= self.consumed_offset {
            return;
        }

        // merge with a segment ending exactly at our start
        let adjacent_prev = self
            .reassembly
            .range(..offset)
            .next_back()
            .and_then(|(&prev_offset, prev)| {
                (prev_offset + prev.len() as u64 == offset).then_some(prev_offset)
            });
        if let Some(prev_offset) = adjacent_prev {
            let mut merged = self.reassembly.remove(&prev_offset).expect("present");
            merged.extend_from_slice(&data);
            // the merged block may now touch its successor
            self.insert_segment(prev_offset, merged);
            return;
        }

        // merge with a segment starting exactly at our end
        let end = offset + data.len() as u64;
        if let Some(next) = self.reassembly.remove(&end) {
            let mut data = data;
            data.extend_from_slice(&next);
            self.reassembly.insert(offset, data);
            return;
        }

        self.reassembly.insert(offset, data);
    }

    #[inline]
    fn fin_reached(&self) -> bool {
        self.fin_offset == Some(self.consumed_offset) && !self.flags.fin_signalled()
    }

    /// Pops the next contiguous run starting at `consumed_offset`, if any.
    /// The FIN marker is delivered exactly once, after the last octet.
    pub fn deliverable(&mut self) -> Option<Deliverable> {
        if let Some(data) = self.reassembly.remove(&self.consumed_offset) {
            let offset = self.consumed_offset;
            self.consumed_offset += data.len() as u64;
            let fin = self.fin_reached();
            if fin {
                self.flags.set_fin_signalled();
            }
            return Some(Deliverable { offset, data, fin });
        }

        // a bare FIN with no data pending
        if self.fin_reached() {
            self.flags.set_fin_signalled();
            return Some(Deliverable {
                offset: self.consumed_offset,
                data: Vec::new(),
                fin: true,
            });
        }

        None
    }

    /// Discards reassembly state after a peer RESET
    pub fn discard_receive_state(&mut self) {
        self.reassembly.clear();
    }

    /// Appends application data to the send queue. The FIN flag is set
    /// atomically with the last enqueue.
    pub fn enqueue_send(&mut self, data: &[u8], fin: bool) -> Result<(), Error> {
        if self.fin_requested || self.flags.reset_requested() {
            return Err(Error::STREAM_STATE_ERROR.with_reason("stream already finished"));
        }
        if !data.is_empty() {
            self.send_queue.push(Bytes::copy_from_slice(data));
        }
        if fin {
            self.fin_requested = true;
        }
        Ok(())
    }

    /// Total octets queued and not yet handed to the packetizer
    pub fn send_queue_len(&self) -> u64 {
        let queued: usize = self.send_queue.iter().map(Bytes::len).sum();
        (queued - self.send_queue_offset) as u64
    }

    /// Copies up to `limit` queued octets without consuming them
    pub fn peek_send(&self, limit: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(limit.min(64));
        let mut skip = self.send_queue_offset;
        for chunk in &self.send_queue {
            if out.len() >= limit {
                break;
            }
            let chunk = &chunk[skip.min(chunk.len())..];
            skip = 0;
            let take = chunk.len().min(limit - out.len());
            out.extend_from_slice(&chunk[..take]);
        }
        out
    }

    /// Consumes `count` octets from the send queue and advances
    /// `sent_offset`
    pub fn consume_send(&mut self, count: usize) {
        let mut remaining = count;
        while remaining > 0 {
            let front_len = self.send_queue[0].len() - self.send_queue_offset;
            if remaining < front_len {
                self.send_queue_offset += remaining;
                remaining = 0;
            } else {
                remaining -= front_len;
                self.send_queue.remove(0);
                self.send_queue_offset = 0;
            }
        }
        self.sent_offset += count as u64;
    }

    /// Whether the prepare path owes this stream any frame
    pub fn is_send_ready(&self) -> bool {
        if self.flags.reset_requested() && !self.flags.reset_sent() {
            return true;
        }
        if self.flags.stop_sending_requested() && !self.flags.stop_sending_sent() {
            return true;
        }
        if self.flags.reset_sent() || self.flags.reset_received() {
            return false;
        }
        if self.send_queue_len() > 0 && self.sent_offset < self.maxdata_remote {
            return true;
        }
        // a FIN still owed to the peer
        self.fin_requested && !self.flags.fin_sent()
    }
}

/// The per-connection stream table. Stream 0 is created at connection
/// establishment and carries the handshake.
#[derive(Debug, Default)]
pub struct StreamSet {
    streams: SmallVec<[StreamHead; 8]>,
}

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table pre-seeded with stream 0, which carries the handshake and
    /// is exempt from flow control
    pub fn new_with_handshake() -> Self {
        let mut set = Self::default();
        set.streams
            .push(StreamHead::new(StreamId::HANDSHAKE, u64::MAX, u64::MAX));
        set
    }

    pub fn find(&mut self, id: StreamId) -> Option<&mut StreamHead> {
        self.streams.iter_mut().find(|stream| stream.id == id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.iter().any(|stream| stream.id == id)
    }

    /// Looks up a stream, creating it when allowed.
    ///
    /// `max_stream_id` is the limit applying to the stream's initiator
    /// class from the perspective of this endpoint.
    pub fn find_or_create(
        &mut self,
        id: StreamId,
        max_stream_id: impl FnOnce(StreamId) -> u64,
        maxdata_local: u64,
        maxdata_remote: u64,
    ) -> Result<&mut StreamHead, Error> {
        if let Some(index) = self.streams.iter().position(|stream| stream.id == id) {
            return Ok(&mut self.streams[index]);
        }

        if id.as_u64() > max_stream_id(id) {
            return Err(Error::STREAM_ID_ERROR.with_reason("stream id above advertised maximum"));
        }

        self.streams
            .push(StreamHead::new(id, maxdata_local, maxdata_remote));
        Ok(self.streams.last_mut().expect("just pushed"))
    }

    /// The lowest-id stream owing data to the wire. In `restricted` mode
    /// (during the handshake) only stream 0 is eligible.
    pub fn find_ready(&mut self, restricted: bool) -> Option<&mut StreamHead> {
        let mut best: Option<usize> = None;
        for (index, stream) in self.streams.iter().enumerate() {
            if restricted && !stream.id.is_handshake() {
                continue;
            }
            if !stream.is_send_ready() {
                continue;
            }
            match best {
                Some(current) if self.streams[current].id <= stream.id => {}
                _ => best = Some(index),
            }
        }
        best.map(move |index| &mut self.streams[index])
    }

    /// Non-consuming version of [`StreamSet::find_ready`]
    pub fn has_ready(&self, restricted: bool) -> bool {
        self.streams.iter().any(|stream| {
            (!restricted || stream.id.is_handshake()) && stream.is_send_ready()
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StreamHead> {
        self.streams.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamHead> {
        self.streams.iter()
    }

    /// Retrofits remote flow-control limits after transport parameters
    /// arrive
    pub fn update_initial_remote(&mut self, maxdata_remote: u64) {
        for stream in &mut self.streams {
            if !stream.id.is_handshake() {
                stream.maxdata_remote = stream.maxdata_remote.max(maxdata_remote);
            }
        }
    }

    /// Removes the handshake stream's buffered state for a restart
    pub fn wipe_handshake_stream(&mut self, maxdata_local: u64, maxdata_remote: u64) {
        if let Some(index) = self
            .streams
            .iter()
            .position(|stream| stream.id.is_handshake())
        {
            self.streams[index] = StreamHead::new(StreamId::HANDSHAKE, maxdata_local, maxdata_remote);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;

    fn stream() -> StreamHead {
        StreamHead::new(StreamId::new(4), 1 << 20, 1 << 20)
    }

    #[test]
    fn in_order_delivery_test() {
        let mut stream = stream();
        assert_eq!(stream.network_input(0, b"hello ", false).unwrap(), 6);
        assert_eq!(stream.network_input(6, b"world", true).unwrap(), 5);

        let chunk = stream.deliverable().unwrap();
        assert_eq!(chunk.offset, 0);
        assert_eq!(chunk.data, b"hello world");
        assert!(chunk.fin);
        assert!(stream.deliverable().is_none());
    }

    #[test]
    fn out_of_order_delivery_test() {
        let mut stream = stream();
        stream.network_input(6, b"world", false).unwrap();
        assert!(stream.deliverable().is_none());

        stream.network_input(0, b"hello ", false).unwrap();
        let chunk = stream.deliverable().unwrap();
        assert_eq!(chunk.data, b"hello world");
        assert!(!chunk.fin);
    }

    #[test]
    fn overlap_prefers_stored_test() {
        let mut stream = stream();
        stream.network_input(0, b"AAAA", false).unwrap();
        // overlapping bytes must not overwrite the stored copy
        let new = stream.network_input(2, b"BBBB", false).unwrap();
        assert_eq!(new, 2);

        let chunk = stream.deliverable().unwrap();
        assert_eq!(chunk.data, b"AAAABB");
    }

    #[test]
    fn duplicate_is_not_new_test() {
        let mut stream = stream();
        assert_eq!(stream.network_input(0, b"data", false).unwrap(), 4);
        assert_eq!(stream.network_input(0, b"data", false).unwrap(), 0);
    }

    #[test]
    fn fin_exactly_once_test() {
        let mut stream = stream();
        stream.network_input(0, b"x", true).unwrap();
        assert!(stream.deliverable().unwrap().fin);
        // replayed FIN frame does not signal again
        stream.network_input(0, b"x", true).unwrap();
        assert!(stream.deliverable().is_none());
    }

    #[test]
    fn conflicting_fin_test() {
        let mut stream = stream();
        stream.network_input(0, b"abcd", true).unwrap();
        assert!(stream.network_input(0, b"ab", true).is_err());
        assert!(stream.network_input(4, b"z", false).is_err());
    }

    #[test]
    fn bare_fin_test() {
        let mut stream = stream();
        stream.network_input(0, b"ab", false).unwrap();
        let chunk = stream.deliverable().unwrap();
        assert!(!chunk.fin);

        stream.network_input(2, b"", true).unwrap();
        let chunk = stream.deliverable().unwrap();
        assert!(chunk.data.is_empty());
        assert!(chunk.fin);
    }

    #[test]
    fn send_queue_test() {
        let mut stream = stream();
        stream.enqueue_send(b"hello ", false).unwrap();
        stream.enqueue_send(b"world", true).unwrap();
        assert!(stream.enqueue_send(b"more", false).is_err());

        assert_eq!(stream.send_queue_len(), 11);
        assert_eq!(stream.peek_send(8), b"hello wo");
        stream.consume_send(8);
        assert_eq!(stream.sent_offset, 8);
        assert_eq!(stream.peek_send(16), b"rld");
    }

    /// Random out-of-order chunks must reproduce the original stream with
    /// one FIN after the last byte
    #[test]
    fn reassembly_model_test() {
        check!().with_type::<u64>().cloned().for_each(|seed| {
            let original: Vec<u8> = (0u16..600).map(|i| (i as u8).wrapping_mul(31)) .collect();
            let mut order: Vec<usize> = (0..original.len() / 40).collect();
            // cheap deterministic shuffle
            let mut state = seed | 1;
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                order.swap(i, (state % (i as u64 + 1)) as usize);
            }

            let mut stream = StreamHead::new(StreamId::new(4), 1 << 20, 1 << 20);
            let mut delivered = Vec::new();
            let mut fin_count = 0;

            for chunk_index in order {
                let start = chunk_index * 40;
                let end = (start + 40).min(original.len());
                let fin = end == original.len();
                stream
                    .network_input(start as u64, &original[start..end], fin)
                    .unwrap();
                while let Some(chunk) = stream.deliverable() {
                    delivered.extend_from_slice(&chunk.data);
                    if chunk.fin {
                        fin_count += 1;
                    }
                }
            }

            assert_eq!(delivered, original);
            assert_eq!(fin_count, 1);
        });
    }
}
