//! Per-transaction IAX2 state machine
//!
//! One transaction is a call leg, a registration exchange or a poke. Received
//! full frames are sequence checked and queued; outgoing full frames are kept
//! for retransmission with exponential backoff until acknowledged. The owner
//! polls [`IaxTransaction::get_event`].

use super::frame::{self, FrameOut, FullFrame, MiniFrame};
use super::ies::{auth, ie, IeList};
use super::{control, ctl, format, FrameKind};
use crate::config::IaxConfig;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Transaction types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransType {
    /// Call leg
    New,
    /// Registration request
    RegReq,
    /// Registration release
    RegRel,
    /// Keepalive probe
    Poke,
}

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    /// Initial state
    Unknown,
    /// Sent the initial request
    NewLocalInvite,
    /// Auth request received for our invite
    NewLocalInviteAuthRecv,
    /// Auth reply sent for our invite
    NewLocalInviteRepSent,
    /// Received an initial request
    NewRemoteInvite,
    /// Auth request sent for a remote invite
    NewRemoteInviteAuthSent,
    /// Auth reply received for a remote invite
    NewRemoteInviteRepRecv,
    /// Call leg established
    Connected,
    /// Waiting for the final acknowledgement or timeout
    Terminating,
    /// Terminal; no further frames accepted
    Terminated,
}

/// Application-visible transaction events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IaxEventKind {
    Invalid,
    Terminated,
    Timeout,
    NotImplemented,
    New,
    AuthReq,
    AuthRep,
    Accept,
    Hangup,
    Reject,
    Busy,
    Text,
    Dtmf,
    Noise,
    Answer,
    Ringing,
    Progressing,
    Quelch,
    Unquelch,
    /// Incoming media payload
    Media,
}

/// An event raised by a transaction
#[derive(Debug, Clone)]
pub struct IaxEvent {
    pub kind: IaxEventKind,
    /// Locally generated (timeouts, local terminations)
    pub local: bool,
    /// Final event: the transaction is gone afterwards
    pub final_event: bool,
    pub call_no: u16,
    pub ies: IeList,
    /// Media payload for Media events
    pub data: Vec<u8>,
    pub ts: u32,
    pub fmt: u32,
}

impl IaxEvent {
    fn simple(kind: IaxEventKind, local: bool, final_event: bool, call_no: u16) -> Self {
        Self { kind, local, final_event, call_no, ies: IeList::new(), data: Vec::new(), ts: 0, fmt: 0 }
    }

    fn with_frame(kind: IaxEventKind, local: bool, final_event: bool, call_no: u16, frame: &FullFrame) -> Self {
        let ies = frame.ie_list().unwrap_or_default();
        Self { kind, local, final_event, call_no, ies, data: Vec::new(), ts: frame.ts, fmt: 0 }
    }
}

/// Parameters for an outgoing transaction
#[derive(Debug, Clone, Default)]
pub struct OutgoingParams {
    pub username: String,
    pub password: String,
    pub calling_no: String,
    pub calling_name: String,
    pub called_no: String,
    pub called_context: String,
    /// Preferred format bit; engine default when zero
    pub format: u32,
    /// Capability bitmask; engine default when zero
    pub capability: u32,
}

pub struct IaxTransaction {
    trans_type: TransType,
    state: TransState,
    local_init: bool,
    /// We requested the termination and await its acknowledgement
    local_req_end: bool,
    lcall: u16,
    rcall: u16,
    addr: SocketAddr,
    oseq: u8,
    iseq: u8,
    start_ms: u64,
    /// Absolute deadline while Terminating on a remote request
    timeout_at_ms: u64,
    out_frames: Vec<FrameOut>,
    in_frames: VecDeque<FullFrame>,
    cfg: IaxConfig,
    next_ping_ms: u64,
    pending_event: Option<IaxEvent>,
    pub username: String,
    password: String,
    pub calling_no: String,
    pub calling_name: String,
    pub called_no: String,
    pub called_context: String,
    format: u32,
    capability: u32,
    challenge: String,
    /// MD5 response received from the peer (incoming auth)
    pub auth_data: String,
    expire: u32,
    /// Transaction participates in outbound trunking
    pub trunked: bool,
    // Incoming media bookkeeping
    last_in_ts: u32,
    last_out_media_ts: u32,
    out_media_format: u32,
    dropped_frames: u32,
    out_of_order: u32,
    // Timestamp reconstruction for trunk entries without timestamps
    trunk_last_derived: u32,
    trunk_last_arrival: u64,
    tx: UnboundedSender<(Vec<u8>, SocketAddr)>,
}

impl IaxTransaction {
    fn base(
        cfg: IaxConfig,
        trans_type: TransType,
        lcall: u16,
        addr: SocketAddr,
        local_init: bool,
        now_ms: u64,
        tx: UnboundedSender<(Vec<u8>, SocketAddr)>,
    ) -> Self {
        Self {
            trans_type,
            state: TransState::Unknown,
            local_init,
            local_req_end: false,
            lcall,
            rcall: 0,
            addr,
            oseq: 0,
            iseq: 0,
            start_ms: now_ms,
            timeout_at_ms: 0,
            out_frames: Vec::new(),
            in_frames: VecDeque::new(),
            next_ping_ms: now_ms + cfg.ping_interval_ms,
            pending_event: None,
            username: String::new(),
            password: String::new(),
            calling_no: String::new(),
            calling_name: String::new(),
            called_no: String::new(),
            called_context: String::new(),
            format: cfg.format,
            capability: cfg.capability,
            challenge: String::new(),
            auth_data: String::new(),
            expire: 60,
            trunked: false,
            last_in_ts: 0,
            last_out_media_ts: 0,
            out_media_format: 0,
            dropped_frames: 0,
            out_of_order: 0,
            trunk_last_derived: 0,
            trunk_last_arrival: 0,
            cfg,
            tx,
        }
    }

    /// Create a transaction for a received initiating full frame
    pub fn incoming(
        cfg: IaxConfig,
        frame: FullFrame,
        lcall: u16,
        addr: SocketAddr,
        now_ms: u64,
        tx: UnboundedSender<(Vec<u8>, SocketAddr)>,
    ) -> Option<Self> {
        let trans_type = match frame.subclass {
            ctl::NEW => TransType::New,
            ctl::REGREQ => TransType::RegReq,
            ctl::REGREL => TransType::RegRel,
            ctl::POKE => TransType::Poke,
            other => {
                info!(subclass = other, "unsupported incoming transaction type");
                return None;
            }
        };
        let mut t = Self::base(cfg, trans_type, lcall, addr, false, now_ms, tx);
        t.rcall = frame.src_call;
        debug!(lcall, rcall = t.rcall, ?trans_type, "incoming transaction");
        t.increment_iseq(&frame);
        t.in_frames.push_back(frame);
        Some(t)
    }

    /// Create and start an outgoing transaction
    pub fn outgoing(
        cfg: IaxConfig,
        trans_type: TransType,
        lcall: u16,
        addr: SocketAddr,
        params: OutgoingParams,
        now_ms: u64,
        tx: UnboundedSender<(Vec<u8>, SocketAddr)>,
    ) -> Self {
        let mut t = Self::base(cfg, trans_type, lcall, addr, true, now_ms, tx);
        t.username = params.username;
        t.password = params.password;
        t.calling_no = params.calling_no;
        t.calling_name = params.calling_name;
        t.called_no = params.called_no;
        t.called_context = params.called_context;
        if params.format != 0 {
            t.format = params.format;
        }
        if params.capability != 0 {
            t.capability = params.capability;
        }
        debug!(lcall, ?trans_type, "outgoing transaction");
        let mut ies = IeList::new();
        let subclass = match trans_type {
            TransType::New => {
                ies.insert_version();
                ies.append_string(ie::USERNAME, &t.username);
                ies.append_string(ie::CALLING_NUMBER, &t.calling_no);
                ies.append_string(ie::CALLING_NAME, &t.calling_name);
                ies.append_string(ie::CALLED_NUMBER, &t.called_no);
                ies.append_string(ie::CALLED_CONTEXT, &t.called_context);
                ies.append_numeric(ie::FORMAT, t.format, 4);
                ies.append_numeric(ie::CAPABILITY, t.capability, 4);
                ctl::NEW
            }
            TransType::RegReq | TransType::RegRel => {
                ies.append_string(ie::USERNAME, &t.username);
                ies.append_numeric(ie::REFRESH, t.expire, 2);
                if trans_type == TransType::RegReq { ctl::REGREQ } else { ctl::REGREL }
            }
            TransType::Poke => ctl::POKE,
        };
        t.post_frame(FrameKind::Iax, subclass, ies.to_bytes().to_vec(), 0, false, now_ms);
        t.change_state(TransState::NewLocalInvite);
        t
    }

    pub fn trans_type(&self) -> TransType {
        self.trans_type
    }

    pub fn state(&self) -> TransState {
        self.state
    }

    pub fn local_call(&self) -> u16 {
        self.lcall
    }

    pub fn remote_call(&self) -> u16 {
        self.rcall
    }

    /// Learned from the first response to an outgoing request
    pub fn set_remote_call(&mut self, rcall: u16) {
        self.rcall = rcall;
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn outgoing_trans(&self) -> bool {
        self.local_init
    }

    pub fn selected_format(&self) -> u32 {
        self.format
    }

    fn change_state(&mut self, new_state: TransState) -> bool {
        if self.state == new_state {
            return true;
        }
        match self.state {
            TransState::Terminated => return false,
            TransState::Terminating if new_state != TransState::Terminated => return false,
            _ => {}
        }
        debug!(lcall = self.lcall, ?new_state, "state change");
        self.state = new_state;
        true
    }

    fn elapsed(&self, now_ms: u64) -> u32 {
        now_ms.saturating_sub(self.start_ms) as u32
    }

    fn send(&self, data: Vec<u8>) {
        let _ = self.tx.send((data, self.addr));
    }

    // Outbound sequence numbers do not advance for meta frames
    fn seq_exempt(kind: FrameKind, subclass: u32) -> bool {
        kind == FrameKind::Iax
            && matches!(subclass, ctl::ACK | ctl::INVAL | ctl::VNAK)
    }

    fn increment_iseq(&mut self, frame: &FullFrame) {
        if !Self::seq_exempt(frame.kind, frame.subclass) {
            self.iseq = self.iseq.wrapping_add(1);
        }
    }

    /// Build, transmit and queue an outgoing full frame
    fn post_frame(
        &mut self,
        kind: FrameKind,
        subclass: u32,
        payload: Vec<u8>,
        ts: u32,
        ack_only: bool,
        now_ms: u64,
    ) {
        if self.state == TransState::Terminated {
            return;
        }
        let mut ts = ts;
        if ts == 0 {
            ts = self.elapsed(now_ms).max(1);
        }
        let frame = FullFrame::new(kind, subclass, self.lcall, self.rcall, self.oseq, self.iseq, ts, payload);
        if !Self::seq_exempt(kind, subclass) {
            self.oseq = self.oseq.wrapping_add(1);
        }
        let mut out = FrameOut::new(
            frame,
            self.cfg.retrans_count,
            self.cfg.retrans_interval_ms,
            now_ms,
            ack_only,
        );
        self.send(out.data().to_vec());
        out.mark_transmitted();
        self.out_frames.push(out);
    }

    fn post_frame_ies(&mut self, subclass: u32, ies: IeList, ack_only: bool, now_ms: u64) {
        self.post_frame(FrameKind::Iax, subclass, ies.to_bytes().to_vec(), 0, ack_only, now_ms);
    }

    // Immediate unqueued frames: never retransmitted, no sequence consumed
    fn send_meta(&self, subclass: u32, ts: u32, iseq: u8) {
        let frame =
            FullFrame::new(FrameKind::Iax, subclass, self.lcall, self.rcall, self.oseq, iseq, ts, Vec::new());
        self.send(frame.to_bytes());
    }

    fn send_ack(&self, frame: &FullFrame) {
        self.send_meta(ctl::ACK, frame.ts, self.iseq);
    }

    pub fn send_inval(&self) {
        self.send_meta(ctl::INVAL, 0, self.iseq);
    }

    /// Negative acknowledgement: ask the peer to retransmit from our
    /// expected sequence number
    fn send_vnak(&self) {
        self.send_meta(ctl::VNAK, 0, self.iseq);
    }

    /// Sequence acceptance: a full frame is acceptable only when its outbound
    /// sequence number matches our expected inbound one
    fn is_frame_acceptable(&mut self, frame: &FullFrame) -> bool {
        let delta = frame.oseq as i32 - self.iseq as i32;
        if delta == 0 {
            return true;
        }
        if delta > 0 {
            info!(
                lcall = self.lcall,
                oseq = frame.oseq,
                expected = self.iseq,
                "frame out of order, sending VNAK"
            );
            self.send_vnak();
            self.out_of_order += 1;
            return false;
        }
        debug!(lcall = self.lcall, oseq = frame.oseq, expected = self.iseq, "late frame, re-acknowledged");
        self.send_ack(frame);
        false
    }

    /// Feed a received full frame into the transaction.
    /// Media full frames surface immediately as Media events.
    pub fn process_frame(&mut self, frame: FullFrame, now_ms: u64) -> Option<IaxEvent> {
        if self.state == TransState::Terminated {
            self.send_inval();
            return None;
        }
        if self.state == TransState::Terminating {
            // Local terminate: accept only the final Ack; remote: nothing
            if !(self.local_req_end && frame.is_iax(ctl::ACK)) {
                return None;
            }
        }
        if frame.is_iax(ctl::VNAK) {
            self.retransmit_on_vnak(frame.iseq);
            return None;
        }
        // Bounded incoming queue: drop and request a resend once drained
        if self.in_frames.len() >= self.cfg.max_in_frames as usize {
            warn!(lcall = self.lcall, "incoming frame queue overrun");
            self.dropped_frames += 1;
            self.send_vnak();
            return None;
        }
        let is_ack = frame.is_iax(ctl::ACK);
        if !is_ack && !self.is_frame_acceptable(&frame) {
            return None;
        }
        self.increment_iseq(&frame);
        // Media full frames carry the concrete format in their subclass
        if self.trans_type == TransType::New
            && matches!(frame.kind, FrameKind::Voice | FrameKind::Video)
        {
            self.send_ack(&frame);
            if frame.subclass != 0 && frame.subclass & self.capability == 0 {
                info!(lcall = self.lcall, fmt = frame.subclass, "media format outside capability");
                return None;
            }
            let data = frame.payload.clone();
            return self.deliver_media(data, frame.ts, frame.subclass);
        }
        if frame.is_iax(ctl::PING) {
            self.post_frame(FrameKind::Iax, ctl::PONG, Vec::new(), frame.ts, true, now_ms);
            return None;
        }
        if frame.is_iax(ctl::LAGRQ) {
            self.post_frame(FrameKind::Iax, ctl::LAGRP, Vec::new(), frame.ts, true, now_ms);
            return None;
        }
        if !is_ack {
            self.send_ack(&frame);
        }
        self.in_frames.push_back(frame);
        None
    }

    /// Incoming media payload from a mini frame or trunk entry. Timestamps of
    /// trunk entries without one are reconstructed from arrival time.
    pub fn process_media(&mut self, mini: MiniFrame, now_ms: u64) -> Option<IaxEvent> {
        if matches!(self.state, TransState::Terminated | TransState::Terminating) {
            return None;
        }
        let ts16 = match mini.ts {
            Some(ts) => ts,
            None => self.reconstruct_trunk_ts(now_ms),
        };
        // Rebuild the full timestamp from its truncated 16 bits
        let mask = 0xffffu32;
        let ts16 = ts16 as u32 & mask;
        let last = self.last_in_ts;
        let delta = ts16 as i64 - (last & mask) as i64;
        let mut ts = ts16 | (last & !mask);
        if delta < 0 {
            if (-delta as u32) < mask / 2 {
                // Stale packet from before the last delivered one
                self.out_of_order += 1;
                return None;
            }
            // Timestamp wrapped around
            ts += mask + 1;
        }
        if ts <= last && last != 0 {
            self.out_of_order += 1;
            return None;
        }
        self.deliver_media(mini.data, ts, 0)
    }

    fn deliver_media(&mut self, data: Vec<u8>, ts: u32, fmt: u32) -> Option<IaxEvent> {
        if ts <= self.last_in_ts && self.last_in_ts != 0 {
            self.out_of_order += 1;
            return None;
        }
        self.last_in_ts = ts;
        let mut ev = IaxEvent::simple(IaxEventKind::Media, false, false, self.lcall);
        ev.data = data;
        ev.ts = ts;
        ev.fmt = if fmt != 0 { fmt } else { self.format };
        Some(ev)
    }

    // Derive a timestamp for a trunk entry without one. The trunk's running
    // timestamp advances by the nominal voice frame interval; when it drifts
    // from the arrival-derived value beyond the configured threshold the
    // generator restarts from arrival time, discarding the accumulated drift.
    fn reconstruct_trunk_ts(&mut self, now_ms: u64) -> u16 {
        const NOMINAL_INTERVAL_MS: u32 = 20;
        let derived = self.elapsed(now_ms);
        let expected = self.trunk_last_derived.wrapping_add(NOMINAL_INTERVAL_MS);
        let chosen = if self.trunk_last_arrival == 0
            || expected.abs_diff(derived) > self.cfg.trunk_ts_resync_threshold_ms
        {
            debug!(lcall = self.lcall, derived, expected, "trunk timestamp resync");
            derived
        } else {
            expected
        };
        self.trunk_last_derived = chosen;
        self.trunk_last_arrival = now_ms;
        chosen as u16
    }

    /// Send outgoing media. Full frames flag format changes; continuation
    /// payloads use mini frames, or are handed to the trunk when enabled.
    pub fn send_media(&mut self, data: &[u8], fmt: u32, now_ms: u64) -> MediaOut {
        if data.is_empty() || matches!(self.state, TransState::Terminated | TransState::Terminating) {
            return MediaOut::Dropped;
        }
        let mut ts = self.elapsed(now_ms);
        if self.last_out_media_ts != 0 && ts == self.last_out_media_ts {
            ts += 1;
        }
        let mask = 0xffffu32;
        let full = self.out_media_format != fmt
            || self.last_out_media_ts == 0
            || (ts & mask) < (self.last_out_media_ts & mask)
            || ts - self.last_out_media_ts > mask;
        if full && self.out_media_format != fmt {
            info!(lcall = self.lcall, old = self.out_media_format, new = fmt, "outgoing media format changed");
        }
        self.out_media_format = fmt;
        self.last_out_media_ts = ts;
        if full {
            self.post_frame(FrameKind::Voice, fmt, data.to_vec(), ts, true, now_ms);
            MediaOut::SentFull
        } else if self.trunked {
            MediaOut::Trunk { call_no: self.lcall, ts, data: data.to_vec() }
        } else {
            self.send(frame::build_mini(self.lcall, ts as u16, data));
            MediaOut::SentMini
        }
    }

    /// Retransmit queued frames from the peer's expected sequence number on
    pub fn retransmit_on_vnak(&mut self, seq: u8) {
        info!(lcall = self.lcall, seq, "VNAK received, retransmitting");
        let mut packets = Vec::new();
        for f in &self.out_frames {
            let delta = f.frame.oseq as i32 - seq as i32;
            if delta >= 0 {
                packets.push(f.data().to_vec());
            }
        }
        for p in packets {
            self.send(p);
        }
    }

    fn find_in(&self, kind: FrameKind, subclass: u32) -> Option<usize> {
        self.in_frames.iter().position(|f| f.kind == kind && f.subclass == subclass)
    }

    // Take a queued frame matching (kind, subclass) as the response to an
    // outgoing frame; the outgoing frame is acknowledged by it
    fn take_response(&mut self, out_idx: usize, kind: FrameKind, subclass: u32) -> Option<FullFrame> {
        let pos = self.find_in(kind, subclass)?;
        self.out_frames[out_idx].set_acked();
        self.in_frames.remove(pos)
    }

    // An incoming Ack for the given outgoing frame: matching timestamp and a
    // sequence number past the frame's own
    fn find_ack(&self, frame: &FullFrame) -> bool {
        self.in_frames.iter().any(|f| {
            f.is_iax(ctl::ACK) && f.ts == frame.ts && f.iseq == frame.oseq.wrapping_add(1)
        })
    }

    fn terminate(&mut self, kind: IaxEventKind, local: bool, frame: Option<&FullFrame>) -> IaxEvent {
        info!(lcall = self.lcall, rcall = self.rcall, ?kind, "transaction terminated");
        self.change_state(TransState::Terminated);
        match frame {
            Some(f) => IaxEvent::with_frame(kind, local, true, self.lcall, f),
            None => IaxEvent::simple(kind, local, true, self.lcall),
        }
    }

    fn wait_for_terminate(&mut self, kind: IaxEventKind, local: bool, frame: Option<&FullFrame>, now_ms: u64) -> IaxEvent {
        self.change_state(TransState::Terminating);
        self.timeout_at_ms = now_ms + self.cfg.trans_timeout_secs as u64 * 1000;
        match frame {
            Some(f) => IaxEvent::with_frame(kind, local, true, self.lcall, f),
            None => IaxEvent::simple(kind, local, true, self.lcall),
        }
    }

    /// Poll the transaction: acknowledgements, retransmissions, timeouts and
    /// queued requests. Non-blocking.
    pub fn get_event(&mut self, now_ms: u64) -> Option<IaxEvent> {
        if let Some(ev) = self.pending_event.take() {
            return Some(ev);
        }
        if self.state == TransState::Terminated {
            return None;
        }
        // Remote cleanup wait
        if self.state == TransState::Terminating && !self.local_req_end && now_ms >= self.timeout_at_ms {
            return Some(self.terminate(IaxEventKind::Terminated, false, None));
        }
        // Keepalive
        if self.state == TransState::Connected && now_ms >= self.next_ping_ms {
            self.next_ping_ms = now_ms + self.cfg.ping_interval_ms;
            self.post_frame(FrameKind::Iax, ctl::PING, Vec::new(), 0, false, now_ms);
        }
        // Outgoing frames: acks, responses, timeouts, retransmissions
        let mut ev = None;
        let mut i = 0;
        while i < self.out_frames.len() {
            if self.find_ack(&self.out_frames[i].frame) {
                self.out_frames[i].set_acked();
                if self.state == TransState::Terminating && self.local_req_end {
                    // Our termination request was acknowledged
                    return Some(self.terminate(IaxEventKind::Terminated, true, None));
                }
            }
            if self.out_frames[i].acked() && self.out_frames[i].ack_only {
                self.out_frames.remove(i);
                continue;
            }
            // Internal keepalives are satisfied by their counterpart
            let keepalive = match &self.out_frames[i].frame {
                f if f.is_iax(ctl::PING) => Some(ctl::PONG),
                f if f.is_iax(ctl::LAGRQ) => Some(ctl::LAGRP),
                _ => None,
            };
            if let Some(reply) = keepalive {
                if self.take_response(i, FrameKind::Iax, reply).is_some() {
                    self.out_frames.remove(i);
                    continue;
                }
            } else if !self.out_frames[i].ack_only {
                ev = self.check_response(i, now_ms);
                if ev.is_some() {
                    self.out_frames.remove(i);
                    break;
                }
            }
            // Acknowledged auth frames wait on the peer's reply, not on
            // further retransmissions
            if self.state == TransState::NewRemoteInviteAuthSent && self.out_frames[i].acked() {
                self.out_frames[i].set_timeout(now_ms + self.cfg.auth_timeout_secs as u64 * 1000);
            }
            if self.out_frames[i].timed_out(now_ms) {
                let frame_info = self.out_frames[i].frame.clone();
                self.out_frames.remove(i);
                warn!(lcall = self.lcall, "no response, transaction timed out");
                return Some(self.terminate(IaxEventKind::Timeout, true, Some(&frame_info)));
            }
            if self.out_frames[i].time_for_retrans(now_ms) {
                if self.out_frames[i].acked() {
                    self.out_frames[i].transmitted();
                } else {
                    debug!(
                        lcall = self.lcall,
                        oseq = self.out_frames[i].frame.oseq,
                        "retransmitting frame"
                    );
                    let data = self.out_frames[i].data().to_vec();
                    self.send(data);
                    self.out_frames[i].mark_transmitted();
                }
            }
            i += 1;
        }
        if ev.is_some() {
            return ev;
        }
        // Incoming requests
        while let Some(frame) = self.next_request() {
            let ev = if self.state == TransState::Unknown {
                self.start_transaction(&frame, now_ms)
            } else {
                self.process_request(&frame, now_ms)
            };
            if ev.is_some() {
                return ev;
            }
        }
        None
    }

    fn next_request(&mut self) -> Option<FullFrame> {
        while let Some(frame) = self.in_frames.pop_front() {
            if frame.is_iax(ctl::ACK) {
                continue;
            }
            return Some(frame);
        }
        None
    }

    // Response matching for our outstanding request frames
    fn check_response(&mut self, idx: usize, now_ms: u64) -> Option<IaxEvent> {
        let (kind, subclass) = {
            let f = &self.out_frames[idx].frame;
            (f.kind, f.subclass)
        };
        if kind != FrameKind::Iax {
            return None;
        }
        match self.trans_type {
            TransType::New => self.check_response_new(idx, subclass, now_ms),
            TransType::RegReq | TransType::RegRel => self.check_response_reg(idx, subclass, now_ms),
            TransType::Poke => {
                if self.state == TransState::NewLocalInvite && subclass == ctl::POKE {
                    if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::PONG) {
                        self.send_ack(&f);
                        return Some(self.terminate(IaxEventKind::Terminated, false, Some(&f)));
                    }
                }
                None
            }
        }
    }

    fn check_response_new(&mut self, idx: usize, subclass: u32, now_ms: u64) -> Option<IaxEvent> {
        match self.state {
            TransState::NewLocalInvite if subclass == ctl::NEW => {
                if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::AUTHREQ) {
                    self.change_state(TransState::NewLocalInviteAuthRecv);
                    return Some(self.process_auth_req(&f));
                }
                if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::ACCEPT) {
                    return Some(self.process_accept(&f));
                }
                if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::REJECT) {
                    let ev = self.wait_for_terminate(IaxEventKind::Reject, false, Some(&f), now_ms);
                    return Some(ev);
                }
                if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::HANGUP) {
                    let ev = self.wait_for_terminate(IaxEventKind::Hangup, false, Some(&f), now_ms);
                    return Some(ev);
                }
                None
            }
            TransState::NewLocalInviteRepSent if subclass == ctl::AUTHREP => {
                if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::ACCEPT) {
                    return Some(self.process_accept(&f));
                }
                if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::REJECT) {
                    let ev = self.wait_for_terminate(IaxEventKind::Reject, false, Some(&f), now_ms);
                    return Some(ev);
                }
                None
            }
            TransState::NewRemoteInviteAuthSent if subclass == ctl::AUTHREQ => {
                if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::AUTHREP) {
                    self.change_state(TransState::NewRemoteInviteRepRecv);
                    if let Ok(ies) = f.ie_list() {
                        self.auth_data = ies.get_string(ie::MD5_RESULT).unwrap_or_default();
                    }
                    return Some(IaxEvent::with_frame(IaxEventKind::AuthRep, false, false, self.lcall, &f));
                }
                None
            }
            _ => None,
        }
    }

    fn check_response_reg(&mut self, idx: usize, subclass: u32, now_ms: u64) -> Option<IaxEvent> {
        match self.state {
            TransState::NewLocalInvite | TransState::NewLocalInviteRepSent
                if matches!(subclass, ctl::REGREQ | ctl::REGREL) =>
            {
                if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::REGACK) {
                    if let Ok(ies) = f.ie_list() {
                        if let Some(exp) = ies.get_numeric(ie::REFRESH) {
                            self.expire = exp;
                        }
                    }
                    self.send_ack(&f);
                    let ev = self.wait_for_terminate(IaxEventKind::Accept, false, Some(&f), now_ms);
                    self.local_req_end = false;
                    return Some(ev);
                }
                if self.state == TransState::NewLocalInvite {
                    if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::REGAUTH) {
                        self.change_state(TransState::NewLocalInviteAuthRecv);
                        return Some(self.process_auth_req(&f));
                    }
                }
                if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::REGREJ) {
                    let ev = self.wait_for_terminate(IaxEventKind::Reject, false, Some(&f), now_ms);
                    return Some(ev);
                }
                None
            }
            TransState::NewRemoteInviteAuthSent if subclass == ctl::REGAUTH => {
                let reply = if self.trans_type == TransType::RegReq { ctl::REGREQ } else { ctl::REGREL };
                if let Some(f) = self.take_response(idx, FrameKind::Iax, reply) {
                    self.change_state(TransState::NewRemoteInviteRepRecv);
                    if let Ok(ies) = f.ie_list() {
                        self.auth_data = ies.get_string(ie::MD5_RESULT).unwrap_or_default();
                    }
                    return Some(IaxEvent::with_frame(IaxEventKind::AuthRep, false, false, self.lcall, &f));
                }
                if let Some(f) = self.take_response(idx, FrameKind::Iax, ctl::REGREJ) {
                    let ev = self.wait_for_terminate(IaxEventKind::Reject, false, Some(&f), now_ms);
                    return Some(ev);
                }
                None
            }
            _ => None,
        }
    }

    // Validate a received auth request: supported method plus a challenge
    fn process_auth_req(&mut self, frame: &FullFrame) -> IaxEvent {
        debug!(lcall = self.lcall, "auth request received");
        let ies = frame.ie_list().unwrap_or_default();
        let method_ok = ies.get_numeric(ie::AUTHMETHODS).map(|m| m & auth::MD5 != 0).unwrap_or(false);
        match ies.get_string(ie::CHALLENGE) {
            Some(c) if method_ok => {
                self.challenge = c;
                IaxEvent::with_frame(IaxEventKind::AuthReq, false, false, self.lcall, frame)
            }
            _ => {
                warn!(lcall = self.lcall, "unsupported or missing authentication method or challenge");
                self.internal_reject("Unsupported or missing authentication method or missing challenge")
            }
        }
    }

    // Accept received: intersect the offered format against our capability
    // and pick exactly one concrete format
    fn process_accept(&mut self, frame: &FullFrame) -> IaxEvent {
        debug!(lcall = self.lcall, "accept received");
        let ies = frame.ie_list().unwrap_or_default();
        let offered = ies.get_numeric(ie::FORMAT).unwrap_or(0);
        let caps = self.capability & format::AUDIO_MASK;
        let selected = if offered & caps != 0 && offered.count_ones() == 1 {
            offered
        } else {
            format::pick(caps, self.format)
        };
        if selected == 0 {
            warn!(lcall = self.lcall, offered, caps, "no common media format");
            return self.internal_reject("Unsupported or missing media format or capability");
        }
        self.format = selected;
        info!(lcall = self.lcall, format = format::name(selected), "media format selected");
        self.change_state(TransState::Connected);
        let mut ev = IaxEvent::with_frame(IaxEventKind::Accept, false, false, self.lcall, frame);
        ev.fmt = selected;
        ev
    }

    fn internal_reject(&mut self, cause: &str) -> IaxEvent {
        let mut ies = IeList::new();
        ies.append_string(ie::CAUSE, cause);
        let data = ies.to_bytes().to_vec();
        let subclass = match self.trans_type {
            TransType::New => ctl::REJECT,
            _ => ctl::REGREJ,
        };
        // Best effort: the transaction is failing locally
        let frame = FullFrame::new(FrameKind::Iax, subclass, self.lcall, self.rcall, self.oseq, self.iseq, 1, data);
        self.send(frame.to_bytes());
        self.terminate(IaxEventKind::Reject, true, None)
    }

    // First frame of an incoming transaction
    fn start_transaction(&mut self, frame: &FullFrame, now_ms: u64) -> Option<IaxEvent> {
        match self.trans_type {
            TransType::New => {
                if !frame.is_iax(ctl::NEW) {
                    return None;
                }
                let ies = match frame.ie_list() {
                    Ok(l) => l,
                    Err(_) => {
                        self.send_inval();
                        return Some(self.wait_for_terminate(IaxEventKind::Invalid, false, None, now_ms));
                    }
                };
                if !ies.valid_version() {
                    self.send_reject("Unsupported or missing protocol version", 0, now_ms);
                    return Some(self.terminate(IaxEventKind::Reject, true, None));
                }
                self.init_from_ies(&ies);
                self.change_state(TransState::NewRemoteInvite);
                if self.username.is_empty() && self.cfg.auth_required {
                    warn!(lcall = self.lcall, "username is missing");
                    return Some(self.internal_reject("Username is missing"));
                }
                Some(IaxEvent::with_frame(IaxEventKind::New, false, false, self.lcall, frame))
            }
            TransType::RegReq | TransType::RegRel => {
                if !(frame.is_iax(ctl::REGREQ) || frame.is_iax(ctl::REGREL)) {
                    return None;
                }
                if let Ok(ies) = frame.ie_list() {
                    self.init_from_ies(&ies);
                }
                self.change_state(TransState::NewRemoteInvite);
                Some(IaxEvent::with_frame(IaxEventKind::New, false, false, self.lcall, frame))
            }
            TransType::Poke => {
                if !frame.is_iax(ctl::POKE) {
                    return None;
                }
                self.post_frame(FrameKind::Iax, ctl::PONG, Vec::new(), frame.ts, true, now_ms);
                let ev = self.wait_for_terminate(IaxEventKind::Terminated, false, None, now_ms);
                self.local_req_end = true;
                Some(ev)
            }
        }
    }

    fn init_from_ies(&mut self, ies: &IeList) {
        if let Some(u) = ies.get_string(ie::USERNAME) {
            self.username = u;
        }
        if let Some(v) = ies.get_string(ie::CALLING_NUMBER) {
            self.calling_no = v;
        }
        if let Some(v) = ies.get_string(ie::CALLING_NAME) {
            self.calling_name = v;
        }
        if let Some(v) = ies.get_string(ie::CALLED_NUMBER) {
            self.called_no = v;
        }
        if let Some(v) = ies.get_string(ie::CALLED_CONTEXT) {
            self.called_context = v;
        }
        if let Some(c) = ies.get_numeric(ie::CAPABILITY) {
            self.capability &= c;
        }
        if let Some(f) = ies.get_numeric(ie::FORMAT) {
            let f = f & self.capability;
            if f != 0 {
                self.format = f;
            }
        }
        if let Some(e) = ies.get_numeric(ie::REFRESH) {
            self.expire = e;
        }
    }

    // Mid-transaction requests
    fn process_request(&mut self, frame: &FullFrame, now_ms: u64) -> Option<IaxEvent> {
        if frame.kind == FrameKind::Iax && !frame.payload.is_empty() && frame.ie_list().is_err() {
            warn!(lcall = self.lcall, "invalid information element list");
            self.send_inval();
            return Some(self.wait_for_terminate(IaxEventKind::Invalid, false, None, now_ms));
        }
        if frame.is_iax(ctl::INVAL) {
            info!(lcall = self.lcall, "INVAL received, terminating");
            return Some(self.terminate(IaxEventKind::Invalid, false, Some(frame)));
        }
        match self.trans_type {
            TransType::New => self.process_request_new(frame, now_ms),
            _ => match self.state {
                TransState::NewLocalInviteAuthRecv
                | TransState::NewRemoteInvite
                | TransState::NewRemoteInviteRepRecv => self.remote_reject(frame, now_ms),
                _ => None,
            },
        }
    }

    fn process_request_new(&mut self, frame: &FullFrame, now_ms: u64) -> Option<IaxEvent> {
        match self.state {
            TransState::Connected => match frame.kind {
                FrameKind::Control => self.process_mid_call_control(frame, now_ms),
                FrameKind::Iax => self.process_mid_call_iax(frame, now_ms),
                FrameKind::Dtmf => {
                    Some(IaxEvent::with_frame(IaxEventKind::Dtmf, false, false, self.lcall, frame))
                }
                FrameKind::Text => {
                    Some(IaxEvent::with_frame(IaxEventKind::Text, false, false, self.lcall, frame))
                }
                FrameKind::Noise => {
                    Some(IaxEvent::with_frame(IaxEventKind::Noise, false, false, self.lcall, frame))
                }
                FrameKind::Image | FrameKind::Html | FrameKind::Video => {
                    Some(IaxEvent::with_frame(IaxEventKind::NotImplemented, false, false, self.lcall, frame))
                }
                _ => None,
            },
            TransState::NewLocalInviteAuthRecv
            | TransState::NewRemoteInvite
            | TransState::NewRemoteInviteRepRecv => self.remote_reject(frame, now_ms),
            _ => None,
        }
    }

    fn process_mid_call_control(&mut self, frame: &FullFrame, now_ms: u64) -> Option<IaxEvent> {
        let kind = match frame.subclass {
            control::ANSWER => IaxEventKind::Answer,
            control::RINGING => IaxEventKind::Ringing,
            control::PROGRESSING | control::PROCEEDING => IaxEventKind::Progressing,
            control::BUSY | control::CONGESTION => {
                let ev = self.wait_for_terminate(IaxEventKind::Busy, false, Some(frame), now_ms);
                return Some(ev);
            }
            control::HANGUP => {
                let ev = self.wait_for_terminate(IaxEventKind::Hangup, false, Some(frame), now_ms);
                return Some(ev);
            }
            control::FLASH_HOOK | control::OPTION | control::KEY_RADIO | control::UNKEY_RADIO
            | control::HOLD | control::UNHOLD => {
                debug!(lcall = self.lcall, subclass = frame.subclass, "unhandled control subclass");
                return None;
            }
            other => {
                debug!(lcall = self.lcall, subclass = other, "unknown control subclass");
                return None;
            }
        };
        Some(IaxEvent::with_frame(kind, false, false, self.lcall, frame))
    }

    fn process_mid_call_iax(&mut self, frame: &FullFrame, now_ms: u64) -> Option<IaxEvent> {
        match frame.subclass {
            ctl::HANGUP => {
                let ev = self.wait_for_terminate(IaxEventKind::Hangup, false, Some(frame), now_ms);
                Some(ev)
            }
            ctl::QUELCH => Some(IaxEvent::with_frame(IaxEventKind::Quelch, false, false, self.lcall, frame)),
            ctl::UNQUELCH => {
                Some(IaxEvent::with_frame(IaxEventKind::Unquelch, false, false, self.lcall, frame))
            }
            ctl::PONG => None,
            other => {
                debug!(lcall = self.lcall, subclass = other, "unsupported mid-call IAX subclass");
                self.send_meta(ctl::UNSUPPORT, 0, self.iseq);
                None
            }
        }
    }

    fn remote_reject(&mut self, frame: &FullFrame, now_ms: u64) -> Option<IaxEvent> {
        let reject = match self.trans_type {
            TransType::New => frame.is_iax(ctl::REJECT) || frame.is_iax(ctl::HANGUP),
            _ => frame.is_iax(ctl::REGREJ),
        };
        if reject {
            let ev = self.wait_for_terminate(IaxEventKind::Reject, false, Some(frame), now_ms);
            return Some(ev);
        }
        None
    }

    /// Accept an incoming transaction. Calls pick the negotiated format and
    /// become Connected; registrations acknowledge and terminate.
    pub fn send_accept(&mut self, now_ms: u64) -> bool {
        let valid = matches!(
            (self.trans_type, self.state),
            (TransType::New, TransState::NewRemoteInvite)
                | (TransType::New, TransState::NewRemoteInviteRepRecv)
                | (TransType::RegReq, TransState::NewRemoteInvite)
                | (TransType::RegReq, TransState::NewRemoteInviteRepRecv)
                | (TransType::RegRel, TransState::NewRemoteInviteRepRecv)
        );
        if !valid {
            return false;
        }
        if self.trans_type == TransType::New {
            let caps = self.capability & format::AUDIO_MASK;
            let selected = format::pick(caps, self.format);
            if selected == 0 {
                warn!(lcall = self.lcall, "no common media format, rejecting");
                self.send_reject("Unsupported or missing media format or capability", 0, now_ms);
                self.pending_event = Some(self.terminate(IaxEventKind::Reject, true, None));
                return false;
            }
            self.format = selected;
            let mut ies = IeList::new();
            ies.append_numeric(ie::FORMAT, self.format, 4);
            ies.append_numeric(ie::CAPABILITY, self.capability, 4);
            self.post_frame_ies(ctl::ACCEPT, ies, true, now_ms);
            self.change_state(TransState::Connected);
        } else {
            let mut ies = IeList::new();
            ies.append_string(ie::USERNAME, &self.username);
            if self.trans_type == TransType::RegReq {
                ies.append_numeric(ie::REFRESH, self.expire, 2);
            }
            if let SocketAddr::V4(v4) = self.addr {
                let mut data = Vec::with_capacity(6);
                data.extend_from_slice(&v4.ip().octets());
                data.extend_from_slice(&v4.port().to_be_bytes());
                ies.append_binary(ie::APPARENT_ADDR, &data);
            }
            self.post_frame_ies(ctl::REGACK, ies, true, now_ms);
            self.change_state(TransState::Terminating);
            self.local_req_end = true;
        }
        true
    }

    /// Request authentication for an incoming transaction (MD5 challenge)
    pub fn send_auth(&mut self, now_ms: u64) -> bool {
        if self.state != TransState::NewRemoteInvite {
            return false;
        }
        self.challenge = format!("{}", rand::random::<u32>());
        let subclass = match self.trans_type {
            TransType::New => ctl::AUTHREQ,
            TransType::RegReq | TransType::RegRel => ctl::REGAUTH,
            TransType::Poke => return false,
        };
        let mut ies = IeList::new();
        ies.append_string(ie::USERNAME, &self.username);
        ies.append_numeric(ie::AUTHMETHODS, auth::MD5, 2);
        ies.append_string(ie::CHALLENGE, &self.challenge);
        self.post_frame_ies(subclass, ies, false, now_ms);
        self.change_state(TransState::NewRemoteInviteAuthSent);
        true
    }

    /// Answer a received auth challenge with the MD5 digest
    pub fn send_auth_reply(&mut self, md5_result: &str, now_ms: u64) -> bool {
        if self.state != TransState::NewLocalInviteAuthRecv {
            return false;
        }
        let mut ies = IeList::new();
        let subclass = match self.trans_type {
            TransType::New => ctl::AUTHREP,
            TransType::RegReq => {
                ies.append_string(ie::USERNAME, &self.username);
                ies.append_numeric(ie::REFRESH, self.expire, 2);
                ctl::REGREQ
            }
            TransType::RegRel => {
                ies.append_string(ie::USERNAME, &self.username);
                ctl::REGREL
            }
            TransType::Poke => return false,
        };
        ies.append_string(ie::MD5_RESULT, md5_result);
        self.post_frame_ies(subclass, ies, false, now_ms);
        self.change_state(TransState::NewLocalInviteRepSent);
        true
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn password(&self) -> &str {
        if self.password.is_empty() {
            &self.cfg.secret
        } else {
            &self.password
        }
    }

    /// Hang up an established or establishing call
    pub fn send_hangup(&mut self, cause: &str, code: u8, now_ms: u64) -> bool {
        if self.trans_type != TransType::New
            || matches!(self.state, TransState::Terminated | TransState::Terminating)
        {
            return false;
        }
        let mut ies = IeList::new();
        ies.append_string(ie::CAUSE, cause);
        if code != 0 {
            ies.append_numeric(ie::CAUSECODE, code as u32, 1);
        }
        self.post_frame_ies(ctl::HANGUP, ies, true, now_ms);
        self.change_state(TransState::Terminating);
        self.local_req_end = true;
        info!(lcall = self.lcall, cause, "hangup sent");
        true
    }

    /// Reject an incoming request
    pub fn send_reject(&mut self, cause: &str, code: u8, now_ms: u64) -> bool {
        if matches!(self.state, TransState::Terminated | TransState::Terminating) {
            return false;
        }
        let subclass = match self.trans_type {
            TransType::New => ctl::REJECT,
            TransType::RegReq | TransType::RegRel => ctl::REGREJ,
            TransType::Poke => return false,
        };
        let mut ies = IeList::new();
        ies.append_string(ie::CAUSE, cause);
        if code != 0 {
            ies.append_numeric(ie::CAUSECODE, code as u32, 1);
        }
        self.post_frame_ies(subclass, ies, true, now_ms);
        self.change_state(TransState::Terminating);
        self.local_req_end = true;
        info!(lcall = self.lcall, cause, "reject sent");
        true
    }

    fn send_connected(&mut self, subclass: u32, now_ms: u64) -> bool {
        if self.state != TransState::Connected {
            return false;
        }
        self.post_frame(FrameKind::Control, subclass, Vec::new(), 0, true, now_ms);
        true
    }

    pub fn send_answer(&mut self, now_ms: u64) -> bool {
        self.send_connected(control::ANSWER, now_ms)
    }

    pub fn send_ringing(&mut self, now_ms: u64) -> bool {
        self.send_connected(control::RINGING, now_ms)
    }

    pub fn send_progressing(&mut self, now_ms: u64) -> bool {
        self.send_connected(control::PROGRESSING, now_ms)
    }

    pub fn send_dtmf(&mut self, digit: char, now_ms: u64) -> bool {
        if self.state != TransState::Connected {
            return false;
        }
        self.post_frame(FrameKind::Dtmf, digit as u32, Vec::new(), 0, true, now_ms);
        true
    }

    pub fn send_text(&mut self, text: &str, now_ms: u64) -> bool {
        if self.state != TransState::Connected {
            return false;
        }
        self.post_frame(FrameKind::Text, 0, text.as_bytes().to_vec(), 0, true, now_ms);
        true
    }

    /// (out of order, dropped) frame counters
    pub fn stats(&self) -> (u32, u32) {
        (self.out_of_order, self.dropped_frames)
    }
}

/// Outcome of an outgoing media send
#[derive(Debug)]
pub enum MediaOut {
    /// Sent as a full frame (format change or timestamp discontinuity)
    SentFull,
    /// Sent as a mini frame
    SentMini,
    /// Handed to the caller for trunk batching
    Trunk { call_no: u16, ts: u32, data: Vec<u8> },
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iax::frame::{parse, ParsedFrame};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    type OutRx = UnboundedReceiver<(Vec<u8>, SocketAddr)>;

    fn addr() -> SocketAddr {
        "10.0.0.1:4569".parse().unwrap()
    }

    fn cfg() -> IaxConfig {
        IaxConfig::default().validated()
    }

    fn outgoing_call(now: u64) -> (IaxTransaction, OutRx) {
        let (tx, rx) = unbounded_channel();
        let params = OutgoingParams {
            username: "alice".into(),
            called_no: "123".into(),
            format: format::ALAW,
            capability: format::ALAW | format::MULAW,
            ..Default::default()
        };
        let t = IaxTransaction::outgoing(cfg(), TransType::New, 42, addr(), params, now, tx);
        (t, rx)
    }

    fn recv_full(rx: &mut OutRx) -> FullFrame {
        loop {
            let (data, _) = rx.try_recv().expect("expected an outgoing frame");
            if let ParsedFrame::Full(f) = parse(&data).unwrap() {
                return f;
            }
        }
    }

    fn ack_for(frame: &FullFrame, src_call: u16) -> FullFrame {
        FullFrame::new(
            FrameKind::Iax,
            ctl::ACK,
            src_call,
            frame.src_call,
            frame.iseq,
            frame.oseq.wrapping_add(1),
            frame.ts,
            Vec::new(),
        )
    }

    fn response(frame: &FullFrame, src_call: u16, subclass: u32, ies: &IeList) -> FullFrame {
        FullFrame::new(
            FrameKind::Iax,
            subclass,
            src_call,
            frame.src_call,
            frame.iseq,
            frame.oseq.wrapping_add(1),
            frame.ts + 1,
            ies.to_bytes().to_vec(),
        )
    }

    #[test]
    fn test_outgoing_new_sends_invite() {
        let (t, mut rx) = outgoing_call(0);
        assert_eq!(t.state(), TransState::NewLocalInvite);
        let f = recv_full(&mut rx);
        assert!(f.is_iax(ctl::NEW));
        assert_eq!(f.src_call, 42);
        assert_eq!(f.dest_call, 0);
        let ies = f.ie_list().unwrap();
        assert!(ies.valid_version());
        assert_eq!(ies.get_string(ie::CALLED_NUMBER).as_deref(), Some("123"));
        assert_eq!(ies.get_numeric(ie::CAPABILITY), Some(format::ALAW | format::MULAW));
    }

    #[test]
    fn test_accept_negotiates_format() {
        let (mut t, mut rx) = outgoing_call(0);
        let invite = recv_full(&mut rx);
        t.set_remote_call(7);
        let mut ies = IeList::new();
        ies.append_numeric(ie::FORMAT, format::MULAW, 4);
        let accept = response(&invite, 7, ctl::ACCEPT, &ies);
        assert!(t.process_frame(accept, 100).is_none());
        let ev = t.get_event(100).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Accept);
        assert_eq!(ev.fmt, format::MULAW);
        assert_eq!(t.state(), TransState::Connected);
    }

    #[test]
    fn test_incompatible_offer_rejected() {
        let (mut t, mut rx) = outgoing_call(0);
        let invite = recv_full(&mut rx);
        t.set_remote_call(7);
        let mut ies = IeList::new();
        // Offer outside our audio capability
        ies.append_numeric(ie::FORMAT, format::G729, 4);
        ies.append_numeric(ie::CAPABILITY, format::G729, 4);
        // Shrink our capability to the offer intersection first
        t.capability = format::G729 & (format::ALAW | format::MULAW);
        let accept = response(&invite, 7, ctl::ACCEPT, &ies);
        let _ = t.process_frame(accept, 100);
        let ev = t.get_event(100).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Reject);
        assert!(ev.local);
        assert!(ev.final_event);
        assert_eq!(t.state(), TransState::Terminated);
    }

    #[test]
    fn test_sequence_acceptance() {
        let (mut t, mut rx) = outgoing_call(0);
        let invite = recv_full(&mut rx);
        t.set_remote_call(7);
        // Frame with oseq ahead of expected: rejected, VNAK sent
        let mut ies = IeList::new();
        ies.append_numeric(ie::FORMAT, format::ALAW, 4);
        let mut accept = response(&invite, 7, ctl::ACCEPT, &ies);
        accept.oseq = 5;
        assert!(t.process_frame(accept.clone(), 50).is_none());
        assert!(t.get_event(50).is_none());
        let vnak = recv_full(&mut rx);
        assert!(vnak.is_iax(ctl::VNAK));
        // Nothing received yet: the VNAK names sequence 0
        assert_eq!(vnak.iseq, 0);
        // Frame with the expected sequence is accepted
        accept.oseq = t.iseq;
        assert!(t.process_frame(accept, 60).is_none());
        assert_eq!(t.get_event(60).unwrap().kind, IaxEventKind::Accept);
    }

    #[test]
    fn test_retransmission_then_timeout() {
        let (mut t, mut rx) = outgoing_call(0);
        let _invite = recv_full(&mut rx);
        let interval = cfg().retrans_interval_ms;
        // First retransmission fires at interval
        assert!(t.get_event(interval).is_none());
        let retrans = recv_full(&mut rx);
        assert!(retrans.is_iax(ctl::NEW));
        assert!(retrans.retrans);
        // Burn through the remaining budget: 4 retransmissions total
        let mut now = interval;
        for _ in 0..3 {
            now += 16 * interval;
            assert!(t.get_event(now).is_none());
        }
        now += 16 * interval;
        let ev = t.get_event(now).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Timeout);
        assert!(ev.final_event);
        assert_eq!(t.state(), TransState::Terminated);
    }

    #[test]
    fn test_backoff_lower_bound() {
        // Property: the Nth retransmission fires no earlier than T * 2^(N-1)
        let (mut t, mut rx) = outgoing_call(0);
        let _ = recv_full(&mut rx);
        let t0 = cfg().retrans_interval_ms;
        assert!(t.get_event(t0 - 1).is_none());
        assert!(rx.try_recv().is_err(), "retransmitted too early");
        assert!(t.get_event(t0).is_none());
        let _first = recv_full(&mut rx);
        // Second retransmission not before T + 2T
        assert!(t.get_event(3 * t0 - 1).is_none());
        assert!(rx.try_recv().is_err(), "second retransmission too early");
        assert!(t.get_event(3 * t0).is_none());
        let _second = recv_full(&mut rx);
    }

    #[test]
    fn test_incoming_new_and_accept() {
        let (tx, mut rx) = unbounded_channel();
        let mut ies = IeList::new();
        ies.insert_version();
        ies.append_string(ie::USERNAME, "bob");
        ies.append_string(ie::CALLED_NUMBER, "99");
        ies.append_numeric(ie::FORMAT, format::ALAW, 4);
        ies.append_numeric(ie::CAPABILITY, format::ALAW | format::GSM, 4);
        let invite = FullFrame::with_ies(FrameKind::Iax, ctl::NEW, 9, 0, 0, 0, 10, &ies);
        let mut t = IaxTransaction::incoming(cfg(), invite, 42, addr(), 0, tx).unwrap();
        let ev = t.get_event(1).unwrap();
        assert_eq!(ev.kind, IaxEventKind::New);
        assert_eq!(t.state(), TransState::NewRemoteInvite);
        assert_eq!(t.username, "bob");
        assert_eq!(t.called_no, "99");
        // Application accepts: ACCEPT goes out, state Connected
        assert!(t.send_accept(5));
        let accept = recv_full(&mut rx);
        assert!(accept.is_iax(ctl::ACCEPT));
        assert_eq!(t.state(), TransState::Connected);
        let out_ies = accept.ie_list().unwrap();
        assert_eq!(out_ies.get_numeric(ie::FORMAT), Some(format::ALAW));
    }

    #[test]
    fn test_unacked_accept_times_out() {
        // End to end scenario: incoming NEW, accept sent, never acked
        let (tx, mut rx) = unbounded_channel();
        let mut ies = IeList::new();
        ies.insert_version();
        ies.append_string(ie::USERNAME, "bob");
        ies.append_numeric(ie::FORMAT, format::ALAW, 4);
        ies.append_numeric(ie::CAPABILITY, format::ALAW, 4);
        let invite = FullFrame::with_ies(FrameKind::Iax, ctl::NEW, 9, 0, 0, 0, 10, &ies);
        let mut t = IaxTransaction::incoming(cfg(), invite, 42, addr(), 0, tx).unwrap();
        let _ = t.get_event(1);
        assert!(t.send_accept(5));
        let _accept = recv_full(&mut rx);
        // Default: 4 retransmissions at 500ms initial interval, doubling
        let mut now = 5u64;
        let mut ev = None;
        for _ in 0..16 {
            now += 8_000;
            if let Some(e) = t.get_event(now) {
                ev = Some(e);
                break;
            }
        }
        let ev = ev.expect("expected a timeout event");
        assert_eq!(ev.kind, IaxEventKind::Timeout);
        assert_eq!(t.state(), TransState::Terminated);
    }

    #[test]
    fn test_md5_auth_flow() {
        let (mut t, mut rx) = outgoing_call(0);
        let invite = recv_full(&mut rx);
        t.set_remote_call(7);
        // Peer requests MD5 auth
        let mut ies = IeList::new();
        ies.append_numeric(ie::AUTHMETHODS, auth::MD5, 2);
        ies.append_string(ie::CHALLENGE, "12345");
        let authreq = response(&invite, 7, ctl::AUTHREQ, &ies);
        let _ = t.process_frame(authreq, 50);
        let ev = t.get_event(50).unwrap();
        assert_eq!(ev.kind, IaxEventKind::AuthReq);
        assert_eq!(t.state(), TransState::NewLocalInviteAuthRecv);
        assert_eq!(t.challenge(), "12345");
        // Application computes the digest and replies
        assert!(t.send_auth_reply("abcdef", 60));
        let rep = recv_full(&mut rx);
        assert!(rep.is_iax(ctl::AUTHREP));
        assert_eq!(rep.ie_list().unwrap().get_string(ie::MD5_RESULT).as_deref(), Some("abcdef"));
        assert_eq!(t.state(), TransState::NewLocalInviteRepSent);
        // Accept completes the call
        let mut ok = IeList::new();
        ok.append_numeric(ie::FORMAT, format::ALAW, 4);
        let accept = response(&rep, 7, ctl::ACCEPT, &ok);
        let _ = t.process_frame(accept, 70);
        assert_eq!(t.get_event(70).unwrap().kind, IaxEventKind::Accept);
    }

    #[test]
    fn test_auth_bad_method_rejected() {
        let (mut t, mut rx) = outgoing_call(0);
        let invite = recv_full(&mut rx);
        t.set_remote_call(7);
        let mut ies = IeList::new();
        ies.append_numeric(ie::AUTHMETHODS, auth::RSA, 2);
        ies.append_string(ie::CHALLENGE, "x");
        let authreq = response(&invite, 7, ctl::AUTHREQ, &ies);
        let _ = t.process_frame(authreq, 50);
        let ev = t.get_event(50).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Reject);
        assert!(ev.local);
    }

    #[test]
    fn test_hangup_waits_for_ack() {
        let (mut t, mut rx) = outgoing_call(0);
        let invite = recv_full(&mut rx);
        t.set_remote_call(7);
        let mut ies = IeList::new();
        ies.append_numeric(ie::FORMAT, format::ALAW, 4);
        let accept = response(&invite, 7, ctl::ACCEPT, &ies);
        let _ = t.process_frame(accept, 10);
        let _ = t.get_event(10);
        assert_eq!(t.state(), TransState::Connected);
        // Hang up: the transaction waits for the peer's ack
        assert!(t.send_hangup("normal", 16, 20));
        let hangup = recv_full(&mut rx);
        assert!(hangup.is_iax(ctl::HANGUP));
        assert_eq!(t.state(), TransState::Terminating);
        assert!(t.get_event(25).is_none());
        // Peer acks the hangup: terminated event
        let ack = ack_for(&hangup, 7);
        let _ = t.process_frame(ack, 30);
        let ev = t.get_event(30).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Terminated);
        assert!(ev.local);
        assert_eq!(t.state(), TransState::Terminated);
    }

    #[test]
    fn test_remote_hangup() {
        let (mut t, mut rx) = outgoing_call(0);
        let invite = recv_full(&mut rx);
        t.set_remote_call(7);
        let mut ies = IeList::new();
        ies.append_numeric(ie::FORMAT, format::ALAW, 4);
        let accept = response(&invite, 7, ctl::ACCEPT, &ies);
        let _ = t.process_frame(accept, 10);
        let _ = t.get_event(10);
        // Remote hangs up mid call
        let mut cause = IeList::new();
        cause.append_string(ie::CAUSE, "busy here");
        let mut hangup = FullFrame::with_ies(FrameKind::Iax, ctl::HANGUP, 7, 42, 1, 2, 50, &cause);
        hangup.oseq = t.iseq;
        let _ = t.process_frame(hangup, 60);
        let ev = t.get_event(60).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Hangup);
        assert_eq!(ev.ies.get_string(ie::CAUSE).as_deref(), Some("busy here"));
        assert_eq!(t.state(), TransState::Terminating);
        // No ack ever comes: terminates on the transaction timeout
        let ev = t.get_event(60 + cfg().trans_timeout_secs as u64 * 1000 + 1).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Terminated);
    }

    #[test]
    fn test_queue_overrun_sends_vnak() {
        let (tx, mut rx) = unbounded_channel();
        let mut c = cfg();
        c.max_in_frames = 2;
        let mut ies = IeList::new();
        ies.insert_version();
        ies.append_numeric(ie::FORMAT, format::ALAW, 4);
        ies.append_numeric(ie::CAPABILITY, format::ALAW, 4);
        let invite = FullFrame::with_ies(FrameKind::Iax, ctl::NEW, 9, 0, 0, 0, 10, &ies);
        let mut t = IaxTransaction::incoming(c, invite, 42, addr(), 0, tx).unwrap();
        // Two more frames fill and overrun the queue
        for oseq in [1u8, 2, 3] {
            let f = FullFrame::new(FrameKind::Iax, ctl::PONG, 9, 42, oseq, 0, 20, Vec::new());
            let mut f = f;
            f.oseq = t.iseq; // keep the sequence acceptable
            let _ = t.process_frame(f, 30 + oseq as u64);
        }
        // The NEW plus one accepted frame; the rest were dropped
        assert_eq!(t.in_frames.len(), 2);
        // Drain transmissions; the last must be a VNAK
        let mut last = None;
        while let Ok((data, _)) = rx.try_recv() {
            if let ParsedFrame::Full(f) = parse(&data).unwrap() {
                last = Some(f);
            }
        }
        assert!(last.unwrap().is_iax(ctl::VNAK));
    }

    #[test]
    fn test_vnak_triggers_retransmission() {
        let (mut t, mut rx) = outgoing_call(0);
        let invite = recv_full(&mut rx);
        t.set_remote_call(7);
        // Peer claims it expects sequence 0 again
        let vnak = FullFrame::new(FrameKind::Iax, ctl::VNAK, 7, 42, 0, 0, 0, Vec::new());
        let _ = t.process_frame(vnak, 50);
        let re = recv_full(&mut rx);
        assert!(re.is_iax(ctl::NEW));
        assert_eq!(re.oseq, invite.oseq);
    }

    #[test]
    fn test_poke_flow() {
        let (tx, mut rx) = unbounded_channel();
        let t = IaxTransaction::outgoing(
            cfg(),
            TransType::Poke,
            5,
            addr(),
            OutgoingParams::default(),
            0,
            tx,
        );
        let mut t = t;
        let poke = recv_full(&mut rx);
        assert!(poke.is_iax(ctl::POKE));
        t.set_remote_call(3);
        let pong = response(&poke, 3, ctl::PONG, &IeList::new());
        let _ = t.process_frame(pong, 10);
        let ev = t.get_event(10).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Terminated);
    }

    #[test]
    fn test_media_ordering() {
        let (mut t, mut rx) = outgoing_call(0);
        let invite = recv_full(&mut rx);
        t.set_remote_call(7);
        let mut ies = IeList::new();
        ies.append_numeric(ie::FORMAT, format::ALAW, 4);
        let accept = response(&invite, 7, ctl::ACCEPT, &ies);
        let _ = t.process_frame(accept, 10);
        let _ = t.get_event(10);
        let mini = |ts: u16, data: &[u8]| MiniFrame {
            src_call: 7,
            ts: Some(ts),
            video: false,
            mark: false,
            retrans: false,
            data: data.to_vec(),
        };
        let ev = t.process_media(mini(100, &[1]), 100).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Media);
        assert_eq!(ev.ts, 100);
        // Stale timestamp dropped
        assert!(t.process_media(mini(90, &[2]), 110).is_none());
        // Newer timestamp delivered
        let ev = t.process_media(mini(140, &[3]), 140).unwrap();
        assert_eq!(ev.ts, 140);
    }

    #[test]
    fn test_trunk_ts_reconstruction_resync() {
        let (mut t, mut rx) = outgoing_call(0);
        let invite = recv_full(&mut rx);
        t.set_remote_call(7);
        let mut ies = IeList::new();
        ies.append_numeric(ie::FORMAT, format::ALAW, 4);
        let accept = response(&invite, 7, ctl::ACCEPT, &ies);
        let _ = t.process_frame(accept, 10);
        let _ = t.get_event(10);
        let mini = |data: &[u8]| MiniFrame {
            src_call: 7,
            ts: None,
            video: false,
            mark: false,
            retrans: false,
            data: data.to_vec(),
        };
        // First trunk entry: timestamp derived from arrival
        let ev = t.process_media(mini(&[1]), 1_000).unwrap();
        assert_eq!(ev.ts, 1_000);
        // Steady arrival: expected progression kept
        let ev = t.process_media(mini(&[2]), 1_020).unwrap();
        assert_eq!(ev.ts, 1_020);
        // A gap beyond the resync threshold restarts from arrival time
        let ev = t.process_media(mini(&[3]), 10_000).unwrap();
        assert_eq!(ev.ts, 10_000);
    }
}
