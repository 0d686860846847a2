// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet preparation: timers, loss handling, frame assembly and sealing.

use super::*;
use quill_core::packet::number::PnLen;

/// Encodes a frame into `payload` if it fits within `budget`
fn push_frame(frame: &Frame, payload: &mut Vec<u8>, budget: usize) -> bool {
    let size = frame.encoding_size();
    if payload.len() + size > budget {
        return false;
    }
    let mut scratch = [0u8; recovery::MAX_PACKET_SIZE as usize];
    let mut encoder = EncoderBuffer::new(&mut scratch);
    encoder.encode(frame);
    let len = encoder.len();
    payload.extend_from_slice(&scratch[..len]);
    true
}

impl Connection {
    /// Produces at most one datagram; returns its length, 0 when the
    /// connection has nothing to transmit right now
    pub fn prepare_packet(&mut self, now: Timestamp, buf: &mut [u8]) -> usize {
        if self.state.is_disconnected() {
            return 0;
        }
        self.check_timeouts(now);
        if self.state.is_disconnected() {
            self.next_wake_time = Timestamp::from_micros(u64::MAX);
            return 0;
        }

        let written = if self.state.is_closing() {
            self.prepare_closing_packet(now, buf)
        } else {
            // declare losses before deciding what to send
            let lost = self.recovery.detect_loss(now);
            for packet in lost {
                self.requeue_lost_payload(&packet);
            }

            if self.state.is_almost_ready() {
                // stream-0 stragglers and cleartext acks first, then the
                // 1-RTT data path opens without waiting for confirmation
                let written = self.prepare_handshake_packet(now, buf);
                if written > 0 {
                    written
                } else {
                    self.prepare_ready_packet(now, buf)
                }
            } else if self.state.is_handshaking() {
                self.prepare_handshake_packet(now, buf)
            } else {
                self.prepare_ready_packet(now, buf)
            }
        };

        self.reschedule(now);
        written
    }

    /// Expired-timer bookkeeping shared by the prepare path and the
    /// context's wake loop
    pub(crate) fn check_timeouts(&mut self, now: Timestamp) {
        if self.state == State::HandshakeFailure {
            self.state = State::Disconnected;
            return;
        }

        if self.state.is_closing() {
            if let Some(end) = self.end_of_closing {
                if now >= end {
                    debug!("closing period elapsed");
                    self.state = State::Disconnected;
                }
            }
            return;
        }
        if self.state.is_disconnected() {
            return;
        }

        if now.saturating_duration_since(self.latest_progress_time) >= self.effective_idle_timeout()
        {
            debug!("idle timeout, dropping connection without close exchange");
            self.state = State::Disconnected;
            self.handler.borrow_mut().on_close(CloseReason::IdleTimeout);
            return;
        }

        if self.state.is_handshaking()
            && now.saturating_duration_since(self.start_time) >= MICROSEC_WAIT_MAX
        {
            debug!("handshake took too long");
            self.state = State::HandshakeFailure;
            self.handler
                .borrow_mut()
                .on_close(CloseReason::HandshakeFailure);
        }
    }

    fn prepare_closing_packet(&mut self, now: Timestamp, buf: &mut [u8]) -> usize {
        let send_now = match self.state {
            State::Disconnecting | State::ClosingReceived => true,
            State::Closing => self.close_respond_needed,
            _ => false,
        };
        if !send_now {
            return 0;
        }

        let Some(close_frame) = self.close_frame.clone() else {
            return 0;
        };

        let ptype = if self.one_rtt.is_some() {
            PacketType::OneRttPhi0
        } else if self.role.is_client() {
            PacketType::ClientCleartext
        } else {
            PacketType::ServerCleartext
        };

        let written = self.seal_and_record(ptype, &close_frame, None, false, true, false, buf, now);
        if written == 0 {
            return 0;
        }

        match self.state {
            State::Disconnecting => {
                self.state = State::Closing;
                self.end_of_closing
                    .get_or_insert(now + self.recovery.rtt.retransmit_timer() * 3);
            }
            State::ClosingReceived => {
                self.state = State::Draining;
            }
            State::Closing => {
                self.close_respond_needed = false;
            }
            _ => {}
        }
        written
    }

    fn prepare_handshake_packet(&mut self, now: Timestamp, buf: &mut [u8]) -> usize {
        let ptype = match (self.role, self.state) {
            (
                endpoint::Type::Client,
                State::ClientInit | State::ClientHrrReceived | State::ClientInitResent,
            ) => PacketType::ClientInitial,
            (endpoint::Type::Client, _) => PacketType::ClientCleartext,
            (endpoint::Type::Server, _) => PacketType::ServerCleartext,
        };

        let Some(keys) = self.keys_for(Epoch::Cleartext) else {
            return 0;
        };
        let tag_len = keys.sealer.tag_len();
        let header_len = 17;
        let budget = self
            .send_mtu
            .min(buf.len())
            .saturating_sub(header_len + tag_len);

        let will_send_data = !self.retransmit_ready.is_empty() || self.streams.has_ready(true);

        let mut payload = Vec::new();
        if self.is_ack_needed(now) || (will_send_data && !self.sack.is_empty()) {
            self.build_ack_frame(now, budget, &mut payload);
        }
        let ack_len = payload.len();

        while let Some(frame_bytes) = self.retransmit_ready.front() {
            if payload.len() + frame_bytes.len() > budget {
                break;
            }
            let frame_bytes = self.retransmit_ready.pop_front().expect("front checked");
            payload.extend_from_slice(&frame_bytes);
        }

        let contains_crypto = self.build_stream_frames(true, budget, &mut payload);

        if payload.is_empty() {
            return self.prepare_zero_rtt_packet(now, buf);
        }

        let pad_to = (ptype == PacketType::ClientInitial).then_some(ENFORCED_INITIAL_MIN_SIZE);
        let is_pure_ack = payload.len() == ack_len && ack_len > 0 && !contains_crypto;
        let written = self.seal_and_record(
            ptype,
            &payload,
            pad_to,
            contains_crypto,
            is_pure_ack,
            true,
            buf,
            now,
        );

        if written > 0 && self.state == State::ClientInit {
            self.state = State::ClientInitSent;
        }
        written
    }

    /// Client-side 0-RTT data, sent between the initial and the
    /// handshake completion
    fn prepare_zero_rtt_packet(&mut self, now: Timestamp, buf: &mut [u8]) -> usize {
        if !self.role.is_client() || self.one_rtt.is_some() {
            return 0;
        }
        let Some(keys) = self.keys_for(Epoch::ZeroRtt) else {
            return 0;
        };
        if !self.streams.has_ready(false) {
            return 0;
        }

        let tag_len = keys.sealer.tag_len();
        let header_len = 17;
        let budget = self
            .send_mtu
            .min(buf.len())
            .saturating_sub(header_len + tag_len);

        let mut payload = Vec::new();
        let contains_crypto = self.build_stream_frames(false, budget, &mut payload);
        debug_assert!(!contains_crypto, "stream 0 must not ride 0-RTT");
        if payload.is_empty() {
            return 0;
        }

        self.seal_and_record(
            PacketType::ZeroRttProtected,
            &payload,
            None,
            false,
            false,
            true,
            buf,
            now,
        )
    }

    fn prepare_ready_packet(&mut self, now: Timestamp, buf: &mut [u8]) -> usize {
        let Some(keys) = self.keys_for(Epoch::OneRtt) else {
            return 0;
        };
        let tag_len = keys.sealer.tag_len();
        let pn_len = PnLen::for_range(
            self.send_sequence,
            self.recovery.highest_acknowledged.unwrap_or(0),
        );
        let header_len = 1
            + if self.omit_cnx_id() {
                0
            } else {
                ConnectionId::LEN
            }
            + match pn_len {
                PnLen::One => 1,
                PnLen::Two => 2,
                PnLen::Four => 4,
            };
        let budget = self
            .send_mtu
            .min(buf.len())
            .saturating_sub(header_len + tag_len);

        let ack_due = self.is_ack_needed(now);
        let has_data = !self.retransmit_ready.is_empty()
            || !self.misc_frames.is_empty()
            || self.streams.has_ready(false);
        // stream data is congestion- and pacing-gated; acks are not
        let data_allowed = has_data
            && self.recovery.window_allows_send()
            && self.recovery.pacer.can_send(now);

        if !ack_due && !data_allowed {
            return 0;
        }

        let mut payload = Vec::new();
        if !self.sack.is_empty() && (ack_due || data_allowed) {
            self.build_ack_frame(now, budget, &mut payload);
        }
        let ack_len = payload.len();
        let mut contains_crypto = false;

        if data_allowed {
            while let Some(frame_bytes) = self.retransmit_ready.front() {
                if payload.len() + frame_bytes.len() > budget {
                    break;
                }
                let frame_bytes = self.retransmit_ready.pop_front().expect("front checked");
                payload.extend_from_slice(&frame_bytes);
            }

            while let Some(frame_bytes) = self.misc_frames.front() {
                if payload.len() + frame_bytes.len() > budget {
                    break;
                }
                let frame_bytes = self.misc_frames.pop_front().expect("front checked");
                payload.extend_from_slice(&frame_bytes);
            }

            self.build_flow_updates(budget, &mut payload);
            contains_crypto = self.build_stream_frames(false, budget, &mut payload);
        }

        if payload.is_empty() {
            return 0;
        }

        let is_pure_ack = payload.len() == ack_len && ack_len > 0;
        self.seal_and_record(
            PacketType::OneRttPhi0,
            &payload,
            None,
            contains_crypto,
            is_pure_ack,
            true,
            buf,
            now,
        )
    }

    /// Snapshots the receive ledger into an ACK frame and updates the
    /// bookkeeping that drives the ack-needed policy
    fn build_ack_frame(&mut self, now: Timestamp, budget: usize, payload: &mut Vec<u8>) {
        let delay = now
            .saturating_duration_since(self.time_largest_received)
            .min(self.ack_delay_local);
        let scaled = (delay.as_micros() as u64) >> self.local_parameters.ack_delay_exponent;
        let Some(scaled) = VarInt::new(scaled).ok() else {
            return;
        };
        let Some(mut ack) = frame::Ack::from_sack(&self.sack, scaled) else {
            return;
        };
        let capacity = budget.saturating_sub(payload.len());
        if !ack.trim_to_fit(capacity) {
            return;
        }

        if push_frame(&Frame::Ack(ack), payload, budget) {
            self.highest_ack_sent = self.largest_received.unwrap_or(0);
            self.highest_ack_time = now;
            self.ack_needed = false;
            self.eliciting_since_ack = 0;
            self.out_of_order_seen = false;
        }
    }

    /// MAX_DATA / MAX_STREAM_DATA raises and the BLOCKED hint family
    fn build_flow_updates(&mut self, budget: usize, payload: &mut Vec<u8>) {
        let window = self.local_parameters.initial_max_data as u64;
        if self.maxdata_local - self.data_received < window / 2 {
            let raised = self.data_received + window;
            let frame = Frame::MaxData(frame::MaxData {
                maximum_data: VarInt::new(raised).unwrap_or(VarInt::MAX),
            });
            if push_frame(&frame, payload, budget) {
                self.maxdata_local = raised;
            }
        }

        let stream_window = self.local_parameters.initial_max_stream_data as u64;
        for stream in self.streams.iter_mut() {
            if stream.id.is_handshake() || stream.flags.reset_received() {
                continue;
            }
            if stream.maxdata_local.saturating_sub(stream.highest_received()) < stream_window / 2 {
                let raised = stream.consumed_offset + stream_window;
                if raised > stream.maxdata_local {
                    let frame = Frame::MaxStreamData(frame::MaxStreamData {
                        stream_id: VarInt::new(stream.id.as_u64()).unwrap_or(VarInt::ZERO),
                        maximum_stream_data: VarInt::new(raised).unwrap_or(VarInt::MAX),
                    });
                    if push_frame(&frame, payload, budget) {
                        stream.maxdata_local = raised;
                    }
                }
            }

            // per-stream send starvation hint
            if stream.send_queue_len() > 0
                && stream.sent_offset >= stream.maxdata_remote
                && stream.blocked_at != Some(stream.sent_offset)
            {
                let frame = Frame::StreamBlocked(frame::StreamBlocked {
                    stream_id: VarInt::new(stream.id.as_u64()).unwrap_or(VarInt::ZERO),
                });
                if push_frame(&frame, payload, budget) {
                    stream.blocked_at = Some(stream.sent_offset);
                }
            }
        }

        // connection-level starvation hint
        if self.maxdata_remote <= self.data_sent
            && self.streams.has_ready(false)
            && self.conn_blocked_at != Some(self.data_sent)
            && push_frame(&Frame::Blocked(frame::Blocked {}), payload, budget)
        {
            self.conn_blocked_at = Some(self.data_sent);
        }
    }

    /// Emits RESET_STREAM / STOP_SENDING and STREAM frames for the
    /// lowest-id ready streams until the budget runs out.
    ///
    /// Returns whether any emitted frame carried stream-0 data.
    fn build_stream_frames(&mut self, restricted: bool, budget: usize, payload: &mut Vec<u8>) -> bool {
        let mut contains_crypto = false;
        let mut flow_bytes = 0u64;

        loop {
            let remaining = budget.saturating_sub(payload.len());
            if remaining < 8 {
                break;
            }
            let conn_window = self
                .maxdata_remote
                .saturating_sub(self.data_sent + flow_bytes);

            let Some(stream) = self.streams.find_ready(restricted) else {
                break;
            };
            let id = stream.id;

            if stream.flags.reset_requested() && !stream.flags.reset_sent() {
                let frame = Frame::ResetStream(frame::ResetStream {
                    stream_id: VarInt::new(id.as_u64()).unwrap_or(VarInt::ZERO),
                    error_code: stream.local_error,
                    final_offset: VarInt::new(stream.sent_offset).unwrap_or(VarInt::ZERO),
                });
                if !push_frame(&frame, payload, budget) {
                    break;
                }
                let stream = self.streams.find(id).expect("stream exists");
                stream.flags.set_reset_sent();
                continue;
            }

            if stream.flags.stop_sending_requested() && !stream.flags.stop_sending_sent() {
                let frame = Frame::StopSending(frame::StopSending {
                    stream_id: VarInt::new(id.as_u64()).unwrap_or(VarInt::ZERO),
                    error_code: stream.local_stop_error,
                });
                if !push_frame(&frame, payload, budget) {
                    break;
                }
                let stream = self.streams.find(id).expect("stream exists");
                stream.flags.set_stop_sending_sent();
                continue;
            }

            let stream_window = stream.maxdata_remote.saturating_sub(stream.sent_offset);
            let window = if id.is_handshake() {
                u64::MAX
            } else {
                stream_window.min(conn_window)
            };
            let queued = stream.send_queue_len();
            let want = queued.min(window) as usize;
            let fin_pending = stream.fin_requested && !stream.flags.fin_sent();

            if want == 0 && !(fin_pending && queued == 0) {
                // ready but gated by the connection window
                break;
            }

            let data = stream.peek_send(want.min(remaining));
            let sent_offset = stream.sent_offset;

            let mut frame = frame::Stream {
                stream_id: VarInt::new(id.as_u64()).unwrap_or(VarInt::ZERO),
                offset: VarInt::new(sent_offset).unwrap_or(VarInt::ZERO),
                is_last_frame: false,
                is_fin: false,
                data: &data,
            };
            let Ok(fitted) = frame.try_fit(remaining) else {
                break;
            };
            let fitted = fitted.min(data.len());
            let fin = fin_pending && fitted as u64 == queued && fitted as u64 <= window;
            frame.is_fin = fin;
            frame.data = &data[..fitted];
            let is_last_frame = frame.is_last_frame;

            let mut scratch = [0u8; recovery::MAX_PACKET_SIZE as usize];
            let mut encoder = EncoderBuffer::new(&mut scratch);
            encoder.encode(&Frame::Stream(frame));
            let len = encoder.len();
            payload.extend_from_slice(&scratch[..len]);

            let stream = self.streams.find(id).expect("stream exists");
            stream.consume_send(fitted);
            if fin {
                stream.flags.set_fin_sent();
            }
            if id.is_handshake() {
                contains_crypto = true;
            } else {
                flow_bytes += fitted as u64;
            }

            if is_last_frame {
                break;
            }
        }

        self.data_sent += flow_bytes;
        contains_crypto
    }

    /// Requeues the retransmittable frames of a lost packet. Stream
    /// frames are re-framed with an explicit length so they can be
    /// repacked with other frames.
    pub(crate) fn requeue_lost_payload(&mut self, packet: &SentPacket) {
        if self.state.is_closing() {
            return;
        }
        trace!(pn = packet.pn, "queueing lost packet for retransmission");

        for frame in frame::FrameIter::new(&packet.payload) {
            let Ok(frame) = frame else {
                debug_assert!(false, "sent payload must re-parse");
                return;
            };
            if frame.is_pure_ack() {
                continue;
            }

            let frame = match frame {
                Frame::Stream(mut stream) => {
                    stream.is_last_frame = false;
                    Frame::Stream(stream)
                }
                other => other,
            };

            let mut scratch = [0u8; recovery::MAX_PACKET_SIZE as usize];
            let mut encoder = EncoderBuffer::new(&mut scratch);
            encoder.encode(&frame);
            let len = encoder.len();
            self.retransmit_ready.push_back(scratch[..len].to_vec());
        }
    }

    /// Seals one packet into `buf` and, unless it is fire-and-forget,
    /// records it with the reliability engine
    #[allow(clippy::too_many_arguments)]
    fn seal_and_record(
        &mut self,
        ptype: PacketType,
        plaintext: &[u8],
        pad_to: Option<usize>,
        contains_crypto: bool,
        is_pure_ack: bool,
        record: bool,
        buf: &mut [u8],
        now: Timestamp,
    ) -> usize {
        let Some(keys) = self.keys_for(ptype.epoch()) else {
            return 0;
        };
        let tag_len = keys.sealer.tag_len();
        let pn = self.send_sequence;

        let mut header = [0u8; 17];
        let mut encoder = EncoderBuffer::new(&mut header);
        if ptype.is_long() {
            let cnx_id = match ptype {
                PacketType::ClientInitial | PacketType::ZeroRttProtected => self.initial_cnx_id,
                _ => self.send_cnx_id(),
            };
            packet::encode_long(ptype, cnx_id, pn as u32, self.negotiated_version(), &mut encoder);
        } else {
            let pn_len = PnLen::for_range(pn, self.recovery.highest_acknowledged.unwrap_or(0));
            let cnx_id = if self.omit_cnx_id() {
                None
            } else {
                Some(self.send_cnx_id())
            };
            let key_phase = ptype == PacketType::OneRttPhi1;
            packet::encode_short(cnx_id, key_phase, pn_len, pn, &mut encoder);
        }
        let header_len = encoder.len();

        let padded;
        let plaintext = match pad_to {
            Some(total) if plaintext.len() + header_len + tag_len < total => {
                let mut grown = plaintext.to_vec();
                grown.resize(total - header_len - tag_len, frame::TAG_PADDING);
                padded = grown;
                &padded[..]
            }
            _ => plaintext,
        };

        if buf.len() < header_len + plaintext.len() + tag_len {
            return 0;
        }
        buf[..header_len].copy_from_slice(&header[..header_len]);
        let (aad, ciphertext) = buf.split_at_mut(header_len);
        let Ok(sealed) = keys.sealer.encrypt(pn, aad, plaintext, ciphertext) else {
            return 0;
        };
        let total = header_len + sealed;

        // the mirror key opens our own traffic, so logging can show what
        // actually went on the wire
        if tracing::enabled!(tracing::Level::TRACE) {
            let mut echoed = vec![0u8; sealed];
            let opened = keys
                .mirror
                .decrypt(pn, &buf[..header_len], &buf[header_len..total], &mut echoed)
                .is_ok();
            trace!(pn, ptype = ?ptype, len = total, mirror_ok = opened, "packet sent");
        }
        self.send_sequence += 1;

        if record {
            self.recovery.on_packet_sent(
                SentPacket {
                    pn,
                    ptype,
                    send_time: now,
                    length: total,
                    payload: plaintext.to_vec(),
                    is_pure_ack,
                    contains_crypto,
                },
                now,
            );
        }
        total
    }

    /// Recomputes `next_wake_time` from every pending obligation
    pub(crate) fn reschedule(&mut self, now: Timestamp) {
        if self.state.is_disconnected() {
            self.next_wake_time = Timestamp::from_micros(u64::MAX);
            return;
        }
        if self.state == State::HandshakeFailure {
            self.next_wake_time = now;
            return;
        }

        let mut wake = self.latest_progress_time + self.effective_idle_timeout();

        if self.state.is_handshaking() {
            wake = wake.min(self.start_time + MICROSEC_WAIT_MAX);
        }

        if self.state.is_closing() {
            let close_pending = matches!(
                self.state,
                State::Disconnecting | State::ClosingReceived
            ) || self.close_respond_needed;
            if close_pending {
                wake = now;
            } else if let Some(end) = self.end_of_closing {
                wake = wake.min(end);
            }
            self.next_wake_time = wake;
            return;
        }

        let restricted = self.state.is_handshaking() && !self.state.is_almost_ready();
        let has_data = !self.retransmit_ready.is_empty()
            || !self.misc_frames.is_empty()
            || self.streams.has_ready(restricted)
            || (restricted
                && self.zero_rtt.is_some()
                && self.role.is_client()
                && self.streams.has_ready(false));

        if has_data {
            if restricted || self.recovery.window_allows_send() {
                wake = wake.min(self.recovery.pacer.next_time().max(now));
            }
            // a closed congestion window reopens on acks or the
            // retransmit timer, both already tracked below
        }

        if self.is_ack_needed(now) {
            wake = now;
        } else if !self.sack.is_empty()
            && self
                .largest_received
                .map_or(false, |largest| {
                    largest > self.highest_ack_sent || self.eliciting_since_ack > 0
                })
        {
            wake = wake.min(self.highest_ack_time + self.ack_delay_local / 2);
        }

        if let Some(timer) = self.recovery.next_timer() {
            wake = wake.min(timer);
        }

        self.next_wake_time = wake;
    }
}
