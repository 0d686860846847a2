// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet receive and prepare paths of the connection.

use super::*;

impl Connection {
    // === receive path ===

    /// Processes one packet already routed to this connection
    pub fn incoming_packet(&mut self, datagram: &[u8], header: Header, now: Timestamp) {
        if self.state.is_disconnected() {
            return;
        }

        match header.ptype {
            PacketType::VersionNegotiation => self.process_version_negotiation(datagram, &header, now),
            PacketType::ServerStateless => self.process_stateless_retry(datagram, header, now),
            _ => self.process_protected(datagram, header, now),
        }

        self.reschedule(now);
    }

    /// Version negotiation is unprotected: only honor it in the window
    /// where the client has sent nothing but initials
    fn process_version_negotiation(&mut self, datagram: &[u8], header: &Header, now: Timestamp) {
        if !self.role.is_client()
            || header.cnx_id != self.initial_cnx_id
            || !matches!(self.state, State::ClientInitSent)
        {
            return;
        }

        let mut buffer = DecoderBuffer::new(&datagram[header.offset..]);
        let mut chosen = None;
        while !buffer.is_empty() {
            let Ok((offered, remaining)) = buffer.decode::<u32>() else {
                return;
            };
            buffer = remaining;
            if offered == self.proposed_version || offered == self.negotiated_version() {
                // the packet lists what we already proposed: a stray or
                // forged negotiation, ignore it
                return;
            }
            if chosen.is_none() {
                if let Some(index) = version::get_version_index(offered) {
                    chosen = Some(index);
                }
            }
        }

        let Some(index) = chosen else {
            debug!("version negotiation with no acceptable overlap");
            self.state = State::HandshakeFailure;
            self.local_error = Some(Error::VERSION_NEGOTIATION_ERROR);
            self.handler
                .borrow_mut()
                .on_close(CloseReason::HandshakeFailure);
            return;
        };

        if let Err(error) = self.reset_cnx_version(index, now) {
            self.connection_error(error, now);
        }
    }

    /// Restarts the handshake under a new version: wipe stream 0 and the
    /// reliability state, re-derive cleartext keys with the new salt, and
    /// rebuild the TLS first flight. The send sequence deliberately keeps
    /// counting: a packet number is never reused on a connection.
    fn reset_cnx_version(&mut self, version_index: usize, now: Timestamp) -> Result<(), Error> {
        self.state = State::ClientRenegotiate;
        self.version_index = version_index;
        debug!(version = self.negotiated_version(), "restarting with negotiated version");

        self.streams.wipe_handshake_stream(u64::MAX, u64::MAX);
        self.recovery.reset();
        self.retransmit_ready.clear();
        self.sack = SackList::new();
        self.largest_received = None;

        let salt = version::SUPPORTED_VERSIONS[version_index].salt;
        self.cleartext = Some(
            crypto::cleartext_phase(
                self.provider.as_ref(),
                salt,
                self.initial_cnx_id,
                self.role,
            )
            .map_err(|_| Error::INTERNAL_ERROR.with_reason("cleartext key derivation failed"))?,
        );

        // a fresh TLS session produces the new client hello
        let mut tp = [0u8; quill_core::transport::parameters::MAX_ENCODED_LEN + 8];
        let mut encoder = EncoderBuffer::new(&mut tp);
        self.local_parameters
            .encode_client(self.negotiated_version(), &mut encoder);
        let tp_len = encoder.len();
        self.tls = self.tls_context.new_session(tls::SessionParams {
            role: endpoint::Type::Client,
            server_name: self.sni.as_deref(),
            alpn: self.alpn.as_deref(),
            transport_parameters: &tp[..tp_len],
            session_ticket: self.offered_ticket.as_deref(),
            cookie: Default::default(),
        })?;

        self.state = State::ClientInit;
        self.drive_tls(&[], now)
    }

    /// A stateless retry resets the handshake but keeps the version; it
    /// must not occur twice
    fn process_stateless_retry(&mut self, datagram: &[u8], mut header: Header, now: Timestamp) {
        if !self.role.is_client() || !self.state.is_handshaking() {
            return;
        }
        if self.retry_received {
            self.connection_error(
                Error::PROTOCOL_VIOLATION.with_reason("second stateless retry"),
                now,
            );
            return;
        }

        let Some(plaintext) = self.open_packet(&mut header, datagram) else {
            return;
        };

        // collect the handshake bytes the retry carries
        let mut hrr = Vec::new();
        for frame in frame::FrameIter::new(&plaintext) {
            match frame {
                Ok(Frame::Stream(stream)) if stream.stream_id == 0u64 => {
                    hrr.extend_from_slice(stream.data);
                }
                Ok(Frame::Padding(_)) | Ok(Frame::Ack(_)) => {}
                _ => {
                    self.connection_error(
                        Error::PROTOCOL_VIOLATION.with_reason("unexpected frame in retry"),
                        now,
                    );
                    return;
                }
            }
        }

        debug!("stateless retry received, resending initial");
        self.retry_received = true;
        self.streams.wipe_handshake_stream(u64::MAX, u64::MAX);
        self.recovery.reset();
        self.retransmit_ready.clear();
        self.state = State::ClientHrrReceived;

        if let Err(error) = self.drive_tls(&hrr, now) {
            self.connection_error(error, now);
            return;
        }
        self.state = State::ClientInitResent;
        self.latest_progress_time = now;
    }

    /// Removes packet protection; on failure the packet is dropped
    /// silently apart from the stateless-reset token check
    fn open_packet(&mut self, header: &mut Header, datagram: &[u8]) -> Option<Vec<u8>> {
        let epoch = header.ptype.epoch();
        let keys = self.keys_for(epoch)?;

        header.decode_packet_number(self.largest_received.unwrap_or(0));
        let aad = &datagram[..header.offset];
        let payload = &datagram[header.offset..];
        let mut plaintext = vec![0u8; payload.len()];

        match keys.opener.decrypt(header.pn, aad, payload, &mut plaintext) {
            Ok(len) => {
                plaintext.truncate(len);
                Some(plaintext)
            }
            Err(_) => {
                trace!(pn = header.pn, "packet failed authentication");
                None
            }
        }
    }

    fn process_protected(&mut self, datagram: &[u8], mut header: Header, now: Timestamp) {
        let Some(plaintext) = self.open_packet(&mut header, datagram) else {
            // an undecryptable short-header packet may be a stateless
            // reset for an id the peer has abandoned
            if header.ptype.epoch() == Epoch::OneRtt {
                self.check_stateless_reset(datagram, now);
            }
            return;
        };
        let pn = header.pn;

        if self.sack.contains(pn) {
            trace!(pn, "duplicate packet");
            return;
        }

        if self.state.is_closing() {
            self.process_frames_closing(&plaintext, now);
            return;
        }

        self.on_decrypted_packet(header.ptype, &header, now);

        let eliciting = match self.process_frames(&plaintext, header.ptype.epoch(), now) {
            Ok(eliciting) => eliciting,
            Err(error) => {
                self.connection_error(error, now);
                return;
            }
        };

        self.record_pn_received(pn, eliciting, now);
        self.latest_progress_time = now;
    }

    /// State transitions keyed on which epoch the peer proved keys for
    fn on_decrypted_packet(&mut self, ptype: PacketType, header: &Header, now: Timestamp) {
        let _ = now;
        match (self.role, ptype) {
            (endpoint::Type::Client, PacketType::ServerCleartext) => {
                if self.server_cnx_id.is_zero() && header.cnx_id_present {
                    self.server_cnx_id = header.cnx_id;
                }
                match self.state {
                    State::ClientInitSent | State::ClientInitResent => {
                        self.state = State::ClientHandshakeStart;
                    }
                    State::ClientHandshakeStart => {
                        self.state = State::ClientHandshakeProgress;
                    }
                    _ => {}
                }
            }
            (endpoint::Type::Client, PacketType::OneRttPhi0 | PacketType::OneRttPhi1) => {
                if self.state == State::ClientAlmostReady {
                    debug!("1-RTT keys confirmed, client ready");
                    self.state = State::ClientReady;
                }
            }
            (endpoint::Type::Server, PacketType::OneRttPhi0 | PacketType::OneRttPhi1) => {
                if self.state == State::ServerAlmostReady {
                    debug!("client 1-RTT data received, server ready");
                    self.state = State::ServerReady;
                }
            }
            _ => {}
        }
    }

    fn record_pn_received(&mut self, pn: u64, eliciting: bool, now: Timestamp) {
        self.sack.insert(pn, pn);

        match self.largest_received {
            Some(largest) if pn > largest => {
                self.largest_received = Some(pn);
                self.time_largest_received = now;
            }
            Some(_) => {
                self.out_of_order_seen = true;
            }
            None => {
                self.largest_received = Some(pn);
                self.time_largest_received = now;
            }
        }

        if eliciting {
            self.eliciting_since_ack += 1;
            if self.out_of_order_seen || self.eliciting_since_ack >= 2 {
                self.ack_needed = true;
            }
        }
    }

    /// Whether an acknowledgement is owed right now
    pub(crate) fn is_ack_needed(&self, now: Timestamp) -> bool {
        let Some(largest) = self.largest_received else {
            return false;
        };
        if largest < self.highest_ack_sent || self.sack.is_empty() {
            return false;
        }
        if largest == self.highest_ack_sent && self.eliciting_since_ack == 0 {
            return false;
        }
        if self.ack_needed {
            return true;
        }
        now.saturating_duration_since(self.highest_ack_time) >= self.ack_delay_local / 2
    }

    fn process_frames(
        &mut self,
        plaintext: &[u8],
        epoch: Epoch,
        now: Timestamp,
    ) -> Result<bool, Error> {
        let restricted = epoch == Epoch::Cleartext;
        let mut eliciting = false;

        let mut iter = frame::FrameIter::new(plaintext);
        while let Some(frame) = iter.next() {
            let frame = frame?;

            // epoch admission policy
            match &frame {
                Frame::Padding(_)
                | Frame::Ack(_)
                | Frame::ConnectionClose(_)
                | Frame::ApplicationClose(_) => {}
                Frame::Stream(stream) => {
                    let is_handshake = stream.stream_id == 0u64;
                    if restricted && !is_handshake {
                        return Err(Error::PROTOCOL_VIOLATION
                            .with_reason("application stream in handshake packet"));
                    }
                    if !restricted && is_handshake && epoch == Epoch::ZeroRtt {
                        return Err(
                            Error::PROTOCOL_VIOLATION.with_reason("stream 0 in 0-RTT packet")
                        );
                    }
                }
                _ if restricted => {
                    return Err(
                        Error::PROTOCOL_VIOLATION.with_reason("frame not allowed in handshake")
                    );
                }
                _ => {}
            }

            eliciting |= frame.is_ack_eliciting();
            self.handle_frame(frame, now)?;
        }

        Ok(eliciting)
    }

    fn handle_frame(&mut self, frame: Frame, now: Timestamp) -> Result<(), Error> {
        match frame {
            Frame::Padding(_) => {}
            Frame::Ping(ping) => {
                // answer through the misc queue
                let pong = Frame::Pong(frame::Pong { data: ping.data });
                let mut bytes = [0u8; 300];
                let mut encoder = EncoderBuffer::new(&mut bytes);
                encoder.encode(&pong);
                let len = encoder.len();
                self.misc_frames.push_back(bytes[..len].to_vec());
            }
            Frame::Pong(_) => {}
            Frame::Ack(ack) => self.process_ack_frame(ack, now),
            Frame::Stream(stream) => self.process_stream_frame(&stream, now)?,
            Frame::ResetStream(reset) => self.process_reset_stream(&reset)?,
            Frame::StopSending(stop) => self.process_stop_sending(&stop)?,
            Frame::MaxData(max_data) => {
                self.maxdata_remote = self.maxdata_remote.max(max_data.maximum_data.as_u64());
                self.conn_blocked_at = None;
            }
            Frame::MaxStreamData(max_stream_data) => {
                let id = StreamId::new(max_stream_data.stream_id.as_u64());
                if let Some(stream) = self.streams.find(id) {
                    stream.maxdata_remote = stream
                        .maxdata_remote
                        .max(max_stream_data.maximum_stream_data.as_u64());
                    stream.blocked_at = None;
                }
            }
            Frame::MaxStreamId(max_stream_id) => {
                let id = StreamId::new(max_stream_id.maximum_stream_id.as_u64());
                let limit = max_stream_id.maximum_stream_id.as_u64();
                if id.is_bidirectional() {
                    self.max_stream_id_bidir_remote = self.max_stream_id_bidir_remote.max(limit);
                } else {
                    self.max_stream_id_unidir_remote = self.max_stream_id_unidir_remote.max(limit);
                }
            }
            Frame::NewConnectionId(new_id) => {
                trace!(cnx_id = %new_id.cnx_id, "peer announced alternate connection id");
                self.peer_reset_tokens
                    .push(ResetToken::new(new_id.reset_token));
            }
            Frame::Blocked(_) | Frame::StreamBlocked(_) | Frame::StreamIdNeeded(_) => {
                trace!("peer reported blocked");
            }
            Frame::ConnectionClose(close) => self.process_remote_close(
                CloseReason::Transport(close.error_code),
                close.error_code,
                false,
                now,
            ),
            Frame::ApplicationClose(close) => self.process_remote_close(
                CloseReason::Application(close.error_code),
                close.error_code,
                true,
                now,
            ),
        }
        Ok(())
    }

    fn process_remote_close(
        &mut self,
        reason: CloseReason,
        code: u16,
        is_application: bool,
        now: Timestamp,
    ) {
        if is_application {
            self.remote_application_error = Some(code);
        } else {
            self.remote_error = Some(code);
        }
        debug!(code, "peer closed the connection");

        if self.close_frame.is_none() {
            // echo a plain close so the peer's draining logic converges
            self.queue_close_frame(Frame::ConnectionClose(frame::ConnectionClose {
                error_code: Error::NO_ERROR.code,
                reason: b"",
            }));
        }

        let was_closing = self.state.is_closing();
        self.state = if was_closing {
            State::Draining
        } else {
            State::ClosingReceived
        };
        self.end_of_closing
            .get_or_insert(now + self.recovery.rtt.retransmit_timer() * 3);

        if !was_closing {
            self.handler.borrow_mut().on_close(reason);
        }
    }

    /// In the closing states only the peer's close matters; anything else
    /// just triggers a re-send of our close frame
    fn process_frames_closing(&mut self, plaintext: &[u8], now: Timestamp) {
        let mut closing_received = false;
        for frame in frame::FrameIter::new(plaintext) {
            match frame {
                Ok(Frame::ConnectionClose(_)) | Ok(Frame::ApplicationClose(_)) => {
                    closing_received = true;
                }
                _ => {}
            }
        }

        if closing_received {
            self.state = State::Draining;
            self.end_of_closing
                .get_or_insert(now + self.recovery.rtt.retransmit_timer() * 3);
        } else if self.state == State::Closing {
            self.close_respond_needed = true;
        }
    }

    fn process_ack_frame(&mut self, ack: frame::Ack, now: Timestamp) {
        let exponent = self
            .remote_parameters
            .map(|parameters| parameters.ack_delay_exponent)
            .unwrap_or(3);
        let ack_delay = Duration::from_micros(ack.ack_delay.as_u64() << exponent);

        let outcome = self
            .recovery
            .process_ack(ack.largest.as_u64(), ack_delay, &ack.ranges, now);

        for packet in &outcome.newly_acked {
            // ack of ack: ranges the peer has seen acknowledged stop
            // being advertised
            for frame in frame::FrameIter::new(&packet.payload) {
                if let Ok(Frame::Ack(sent_ack)) = frame {
                    for (start, end) in sent_ack.ranges {
                        self.sack.remove(start, end);
                    }
                }
            }
        }

        if !outcome.newly_acked.is_empty() {
            self.latest_progress_time = now;
        }
    }

    fn process_stream_frame(&mut self, stream: &frame::Stream, now: Timestamp) -> Result<(), Error> {
        let id = StreamId::new(stream.stream_id.as_u64());
        let offset = stream.offset.as_u64();

        if id.is_handshake() {
            let head = self.streams.find(id).expect("handshake stream exists");
            head.network_input(offset, stream.data, stream.is_fin)?;
            self.drain_stream_zero_to_tls(now)?;
            return Ok(());
        }

        if id.initiator() == self.role && !self.streams.contains(id) {
            return Err(Error::STREAM_STATE_ERROR
                .with_reason("peer sent data on a stream we never opened"));
        }

        let limit = self.stream_id_limit_for(id);
        let maxdata_local = self.local_parameters.initial_max_stream_data as u64;
        let maxdata_remote = self
            .remote_parameters
            .map(|parameters| parameters.initial_max_stream_data as u64)
            .unwrap_or(0);

        let newly_created = !self.streams.contains(id);
        let head = self
            .streams
            .find_or_create(id, |_| limit, maxdata_local, maxdata_remote)
            .map_err(|_| Error::FLOW_CONTROL_ERROR.with_reason("stream id above maximum"))?;

        let new_octets = head.network_input(offset, stream.data, stream.is_fin)?;
        if head.highest_received() > head.maxdata_local {
            return Err(Error::FLOW_CONTROL_ERROR.with_reason("stream window exceeded"));
        }

        let discard = head.flags.reset_received() || head.flags.stop_sending_requested();
        let handler = self.handler.clone();
        if !discard {
            let head = self.streams.find(id).expect("just created");
            while let Some(chunk) = head.deliverable() {
                let event = if chunk.fin {
                    StreamEvent::Fin(&chunk.data)
                } else {
                    StreamEvent::Data(&chunk.data)
                };
                handler.borrow_mut().on_stream_data(id, event);
            }
        }

        self.data_received += new_octets;
        if self.data_received > self.maxdata_local {
            return Err(Error::FLOW_CONTROL_ERROR.with_reason("connection window exceeded"));
        }

        // raise the stream-id horizon when the peer nears it
        if newly_created && id.initiator() != self.role {
            let initial = if id.is_bidirectional() {
                self.local_parameters.initial_max_stream_id_bidir as u64
            } else {
                self.local_parameters.initial_max_stream_id_unidir as u64
            };
            let limit = if id.is_bidirectional() {
                &mut self.max_stream_id_bidir_local
            } else {
                &mut self.max_stream_id_unidir_local
            };
            if *limit - id.as_u64() < 8 {
                *limit += initial;
                let frame = Frame::MaxStreamId(frame::MaxStreamId {
                    maximum_stream_id: VarInt::new(*limit).unwrap_or(VarInt::MAX),
                });
                let mut bytes = [0u8; 16];
                let mut encoder = EncoderBuffer::new(&mut bytes);
                encoder.encode(&frame);
                let len = encoder.len();
                self.misc_frames.push_back(bytes[..len].to_vec());
            }
        }

        Ok(())
    }

    fn process_reset_stream(&mut self, reset: &frame::ResetStream) -> Result<(), Error> {
        let id = StreamId::new(reset.stream_id.as_u64());
        if id.is_handshake() {
            return Err(Error::PROTOCOL_VIOLATION.with_reason("reset of stream 0"));
        }

        let limit = self.stream_id_limit_for(id);
        let maxdata_local = self.local_parameters.initial_max_stream_data as u64;
        let head = self
            .streams
            .find_or_create(id, |_| limit, maxdata_local, 0)
            .map_err(|_| Error::FLOW_CONTROL_ERROR.with_reason("stream id above maximum"))?;

        let final_offset = reset.final_offset.as_u64();
        if final_offset < head.highest_received() {
            return Err(
                Error::FINAL_OFFSET_ERROR.with_reason("reset below delivered offset")
            );
        }
        // the unreceived remainder still consumes the connection window
        let shortfall = final_offset - head.highest_received();

        head.remote_error = reset.error_code;
        head.flags.set_reset_received();
        head.discard_receive_state();

        let signal = !head.flags.reset_signalled();
        head.flags.set_reset_signalled();

        self.data_received += shortfall;
        if self.data_received > self.maxdata_local {
            return Err(Error::FLOW_CONTROL_ERROR.with_reason("connection window exceeded"));
        }

        if signal {
            self.handler
                .borrow_mut()
                .on_stream_data(id, StreamEvent::ResetReceived(reset.error_code));
        }
        Ok(())
    }

    fn process_stop_sending(&mut self, stop: &frame::StopSending) -> Result<(), Error> {
        let id = StreamId::new(stop.stream_id.as_u64());
        if id.is_handshake() {
            return Err(Error::PROTOCOL_VIOLATION.with_reason("stop_sending on stream 0"));
        }

        let limit = self.stream_id_limit_for(id);
        let maxdata_local = self.local_parameters.initial_max_stream_data as u64;
        let head = self
            .streams
            .find_or_create(id, |_| limit, maxdata_local, 0)
            .map_err(|_| Error::FLOW_CONTROL_ERROR.with_reason("stream id above maximum"))?;

        head.remote_stop_error = stop.error_code;
        head.flags.set_stop_sending_received();

        // the sender is obliged to reset the stream back
        if !head.flags.reset_requested() {
            head.local_error = stop.error_code;
            head.flags.set_reset_requested();
        }

        let signal = !head.flags.stop_sending_signalled();
        head.flags.set_stop_sending_signalled();
        if signal {
            self.handler
                .borrow_mut()
                .on_stream_data(id, StreamEvent::StopSendingReceived(stop.error_code));
        }
        Ok(())
    }

    /// An undecryptable short-header packet ending in a known reset token
    /// kills the connection without a close exchange
    fn check_stateless_reset(&mut self, datagram: &[u8], now: Timestamp) {
        let Some(tail) = datagram.len().checked_sub(ResetToken::LEN) else {
            return;
        };
        let mut token = [0u8; ResetToken::LEN];
        token.copy_from_slice(&datagram[tail..]);
        let token = ResetToken::new(token);

        if self.peer_reset_tokens.iter().any(|known| *known == token) {
            debug!("stateless reset matched, dropping connection");
            self.state = State::Disconnected;
            self.handler.borrow_mut().on_close(CloseReason::StatelessReset);
            let _ = now;
        }
    }

    // === TLS plumbing ===

    fn drain_stream_zero_to_tls(&mut self, now: Timestamp) -> Result<(), Error> {
        loop {
            let chunk = match self
                .streams
                .find(StreamId::HANDSHAKE)
                .and_then(StreamHead::deliverable)
            {
                Some(chunk) => chunk,
                None => break,
            };
            self.drive_tls(&chunk.data, now)?;
        }
        Ok(())
    }

    /// Feeds handshake input to the TLS provider and routes its output
    pub(crate) fn drive_tls(&mut self, input: &[u8], now: Timestamp) -> Result<(), Error> {
        let mut sendbuf = Vec::new();
        let status = self.tls.handshake(input, &mut sendbuf)?;

        match status {
            tls::HandshakeStatus::HelloRetryRequest => {
                // the retry rides a stateless packet; the connection
                // itself is forgotten right after
                debug_assert!(self.role.is_server());
                self.build_stateless_retry(&sendbuf, now);
                self.state = State::Disconnected;
                return Ok(());
            }
            tls::HandshakeStatus::InProgress => {}
            tls::HandshakeStatus::Complete => {}
        }

        if !sendbuf.is_empty() {
            let head = self.streams.find(StreamId::HANDSHAKE).expect("stream 0");
            head.enqueue_send(&sendbuf, false)?;
        }

        if status == tls::HandshakeStatus::Complete && self.one_rtt.is_none() {
            self.on_tls_complete(now)?;
        }
        Ok(())
    }

    fn on_tls_complete(&mut self, now: Timestamp) -> Result<(), Error> {
        let raw = self
            .tls
            .peer_transport_parameters()
            .ok_or(Error::TRANSPORT_PARAMETER_ERROR.with_reason("missing transport parameters"))?;

        match self.role {
            endpoint::Type::Client => {
                let (info, parameters) = Parameters::decode_server(&raw)?;
                if info.negotiated_version != self.negotiated_version() {
                    return Err(Error::VERSION_NEGOTIATION_ERROR
                        .with_reason("negotiated version mismatch"));
                }
                self.apply_remote_parameters(parameters);
            }
            endpoint::Type::Server => {
                let (_initial_version, parameters) = Parameters::decode_client(&raw)?;
                self.apply_remote_parameters(parameters);
            }
        }

        // install the 1-RTT contexts from the exporter secrets
        let (local_label, remote_label) = match self.role {
            endpoint::Type::Client => (
                crypto::label::EXPORTER_1RTT_CLIENT,
                crypto::label::EXPORTER_1RTT_SERVER,
            ),
            endpoint::Type::Server => (
                crypto::label::EXPORTER_1RTT_SERVER,
                crypto::label::EXPORTER_1RTT_CLIENT,
            ),
        };
        let local = self
            .tls
            .export_secret(local_label, false)
            .map_err(|_| Error::INTERNAL_ERROR.with_reason("1-RTT exporter failed"))?;
        let remote = self
            .tls
            .export_secret(remote_label, false)
            .map_err(|_| Error::INTERNAL_ERROR.with_reason("1-RTT exporter failed"))?;
        self.one_rtt = Some(
            KeyPhase::from_secrets(self.provider.as_ref(), &local, &remote)
                .map_err(|_| Error::INTERNAL_ERROR.with_reason("1-RTT key install failed"))?,
        );

        // resolve 0-RTT
        match self.role {
            endpoint::Type::Client => {
                self.zero_rtt_accepted = self.tls.early_data_accepted();
                if !self.zero_rtt_accepted {
                    // rejected early data is recovered through normal
                    // loss handling in the 1-RTT epoch
                    self.zero_rtt = None;
                }
            }
            endpoint::Type::Server => {
                if self.tls.early_data_accepted() {
                    let secret = self
                        .tls
                        .export_secret(crypto::label::EXPORTER_0RTT, true)
                        .map_err(|_| Error::INTERNAL_ERROR.with_reason("0-RTT exporter failed"))?;
                    self.zero_rtt =
                        KeyPhase::from_shared_secret(self.provider.as_ref(), &secret).ok();
                    self.zero_rtt_accepted = true;
                }
            }
        }

        if self.sni.is_none() {
            self.sni = self.tls.server_name();
        }
        if self.alpn.is_none() {
            self.alpn = self.tls.negotiated_alpn();
        }
        if let Some(ticket) = self.tls.take_new_ticket() {
            self.harvested_ticket = Some(ticket);
        }

        self.state = match self.role {
            endpoint::Type::Client => State::ClientAlmostReady,
            endpoint::Type::Server => State::ServerAlmostReady,
        };
        debug!(state = %self.state, "handshake complete");
        self.latest_progress_time = now;
        Ok(())
    }

    fn apply_remote_parameters(&mut self, parameters: Parameters) {
        self.remote_parameters = Some(parameters);
        self.maxdata_remote = parameters.initial_max_data as u64;
        self.max_stream_id_bidir_remote = parameters.initial_max_stream_id_bidir as u64;
        self.max_stream_id_unidir_remote = parameters.initial_max_stream_id_unidir as u64;
        self.send_mtu = (parameters.max_packet_size as usize)
            .min(recovery::MAX_PACKET_SIZE as usize)
            .max(ENFORCED_INITIAL_MIN_SIZE);
        self.streams
            .update_initial_remote(parameters.initial_max_stream_data as u64);
    }

    /// Builds the AEAD-sealed stateless retry datagram handed to the
    /// context queue
    fn build_stateless_retry(&mut self, hrr: &[u8], now: Timestamp) {
        let frame = frame::Stream {
            stream_id: VarInt::ZERO,
            offset: VarInt::ZERO,
            is_last_frame: true,
            is_fin: false,
            data: hrr,
        };
        let mut scratch = vec![0u8; hrr.len() + 16];
        let mut encoder = EncoderBuffer::new(&mut scratch);
        encoder.encode(&frame);
        let len = encoder.len();
        let plaintext = scratch[..len].to_vec();

        let mut datagram = vec![0u8; plaintext.len() + 64];
        let pn = self.send_sequence;
        let mut header = [0u8; 17];
        let mut header_encoder = EncoderBuffer::new(&mut header);
        packet::encode_long(
            PacketType::ServerStateless,
            self.initial_cnx_id,
            pn as u32,
            self.negotiated_version(),
            &mut header_encoder,
        );
        let header_len = header_encoder.len();
        datagram[..header_len].copy_from_slice(&header[..header_len]);

        let keys = self.cleartext.as_ref().expect("cleartext keys");
        let (aad, ciphertext) = datagram.split_at_mut(header_len);
        let Ok(sealed) = keys.sealer.encrypt(pn, aad, &plaintext, ciphertext) else {
            return;
        };
        datagram.truncate(header_len + sealed);

        self.send_sequence += 1;
        self.pending_stateless = Some(datagram);
        let _ = now;
    }
}
