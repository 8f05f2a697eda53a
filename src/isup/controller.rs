//! ISUP controller: call list ownership and link maintenance
//!
//! Decoded messages are dispatched either to the owning call (by circuit code)
//! or to the controller's maintenance handling: circuit reset, group
//! block/unblock, user part testing and confusion replies. Outbound messages
//! are encoded here and handed to the transmit sink; the sink is drained by
//! the transport glue outside this crate.

use super::call::{cnf_message, rlc_message, CallEvent, CallEventKind, CallState, IsupCall};
use super::message::{self, IsupMessage};
use super::params::DecodeCtx;
use super::MsgType;
use crate::circuit::{lock, parse_circuit_list, CircuitGroup, CircuitStatus, Strategy};
use crate::config::IsupConfig;
use crate::errors::{CircuitError, IsupError};
use crate::types::{ParamList, PointCode, ProtocolVariant, RoutingLabel, SigTimer};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// An encoded message handed to the transport layer
#[derive(Debug, Clone)]
pub struct TransmitRequest {
    pub label: RoutingLabel,
    pub msg_name: String,
    pub cic: u32,
    pub data: Vec<u8>,
}

// One request kept alive until acknowledged: short timer retransmits, the
// global timer raises a maintenance alert and keeps the operation running
struct PendingMsg {
    msg: IsupMessage,
    timer: SigTimer,
    global: SigTimer,
    hw_fail: bool,
    alerted: bool,
}

struct Inner {
    calls: HashMap<u32, IsupCall>,
    pending: Vec<PendingMsg>,
    events: VecDeque<CallEvent>,
    lock_timer: SigTimer,
    rsc_timer: SigTimer,
    rsc_cic: Option<u32>,
    upt_timer: SigTimer,
    upt_cic: u32,
    user_part_avail: bool,
    verify_event: bool,
}

/// The ISUP call controller
pub struct IsupController {
    cfg: IsupConfig,
    variant: ProtocolVariant,
    local: PointCode,
    remote: PointCode,
    group: Arc<CircuitGroup>,
    tx: UnboundedSender<TransmitRequest>,
    ctx: DecodeCtx,
    inner: Mutex<Inner>,
}

impl IsupController {
    pub fn new(
        cfg: IsupConfig,
        group: Arc<CircuitGroup>,
        tx: UnboundedSender<TransmitRequest>,
    ) -> Result<Self, IsupError> {
        let cfg = cfg.validated();
        let local = PointCode::parse(&cfg.point_code)?;
        let remote = PointCode::parse(&cfg.remote_point_code)?;
        let ctx = DecodeCtx { ignore_unknown_digits: cfg.ignore_unknown_digits };
        let mut inner = Inner {
            calls: HashMap::new(),
            pending: Vec::new(),
            events: VecDeque::new(),
            lock_timer: SigTimer::new(cfg.lock_check_ms),
            rsc_timer: SigTimer::new(cfg.channel_sync_ms),
            rsc_cic: None,
            upt_timer: SigTimer::new(cfg.user_part_test_ms),
            upt_cic: 0,
            user_part_avail: cfg.user_part_test_ms == 0,
            verify_event: false,
        };
        if inner.user_part_avail {
            inner.lock_timer.start(0);
        }
        info!(
            variant = cfg.variant.name(),
            local = %local,
            remote = %remote,
            "ISUP call controller created"
        );
        Ok(Self { variant: cfg.variant, cfg, local, remote, group, tx, ctx, inner: Mutex::new(inner) })
    }

    pub fn circuits(&self) -> &Arc<CircuitGroup> {
        &self.group
    }

    pub fn user_part_available(&self) -> bool {
        self.inner.lock().unwrap().user_part_avail
    }

    fn strategy(&self) -> Strategy {
        Strategy::parse(&self.cfg.strategy)
    }

    fn label_for(&self, cic: u32) -> RoutingLabel {
        RoutingLabel::new(self.variant, self.remote, self.local, (cic & 0x0f) as u8)
    }

    fn transmit(&self, msg: &IsupMessage, label: RoutingLabel) {
        match message::encode_message(msg, self.variant) {
            Ok(data) => {
                debug!(msg = %msg.name(), cic = msg.cic, %label, "sending message");
                let _ = self.tx.send(TransmitRequest {
                    label,
                    msg_name: msg.name(),
                    cic: msg.cic,
                    data,
                });
            }
            Err(e) => warn!(msg = %msg.name(), cic = msg.cic, error = %e, "failed to encode message"),
        }
    }

    fn transmit_all(&self, msgs: Vec<IsupMessage>, label: RoutingLabel) {
        for m in msgs {
            self.transmit(&m, label);
        }
    }

    /// Start an outgoing call. `params` carries the request: `called`,
    /// `caller`, optionally `circuits` (an explicit preferred circuit list).
    pub fn call(&self, params: &ParamList, now_ms: u64) -> Result<u32, IsupError> {
        if !self.user_part_available() {
            info!("denying outgoing call, remote user part unavailable");
            return Err(IsupError::UserPartUnavailable);
        }
        let list = params.get("circuits").map(parse_circuit_list).unwrap_or_default();
        let mandatory = params.get_bool("circuits_mandatory", false);
        let mut inner = self.inner.lock().unwrap();
        let mut cic = None;
        // A freshly reserved circuit may still host a terminating call
        for _ in 0..3 {
            let reserved = if list.is_empty() {
                self.group.reserve(lock::LOCKED_BUSY, Some(self.strategy()), None)
            } else {
                self.group.reserve_list(&list, mandatory, lock::LOCKED_BUSY, false)
            };
            match reserved {
                Ok(code) if !inner.calls.contains_key(&code) => {
                    cic = Some(code);
                    break;
                }
                Ok(code) => {
                    warn!(code, "reserved circuit is used by a call, retrying");
                    self.group.release(code);
                }
                Err(_) => break,
            }
        }
        let Some(cic) = cic else {
            info!("no circuit available for outgoing call");
            return Err(CircuitError::NoCircuit.into());
        };
        let label = self.label_for(cic);
        let (call, out) =
            IsupCall::new_outgoing(cic, label, params, params.get("range").map(str::to_string), &self.cfg, now_ms);
        inner.calls.insert(cic, call);
        if self.cfg.channel_sync_ms != 0 && inner.rsc_cic.is_none() {
            inner.rsc_timer.start(now_ms);
        }
        drop(inner);
        self.transmit_all(out, label);
        Ok(cic)
    }

    /// Hand an application request to an existing call
    pub fn send_call_event(&self, cic: u32, kind: CallEventKind, params: &ParamList, now_ms: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(call) = inner.calls.get_mut(&cic) else { return false };
        let label = call.label();
        let (ok, out) = call.send_event(kind, params, now_ms);
        drop(inner);
        self.transmit_all(out, label);
        ok
    }

    /// Process a received wire message
    pub fn receive(&self, data: &[u8], now_ms: u64) -> Result<(), IsupError> {
        let msg = message::decode_message(data, self.variant, &self.ctx)?;
        debug!(msg = %msg.name(), cic = msg.cic, "received message");
        if !self.group.exists(msg.cic) && msg.cic != 0 {
            info!(msg = %msg.name(), cic = msg.cic, "received message for unknown circuit");
            return Ok(());
        }
        self.note_user_part_available(&msg, now_ms);
        match msg.msg_type {
            Some(
                MsgType::Iam
                | MsgType::Sam
                | MsgType::Acm
                | MsgType::Exm
                | MsgType::Cpr
                | MsgType::Anm
                | MsgType::Con
                | MsgType::Rel
                | MsgType::Sgm
                | MsgType::Apm
                | MsgType::Sus
                | MsgType::Res,
            ) => self.process_call_msg(msg, now_ms),
            Some(MsgType::Rlc) => {
                // RLC may answer a pending circuit reset instead of a call
                let reset = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.rsc_cic == Some(msg.cic)
                        || remove_pending(&mut inner.pending, MsgType::Rsc, msg.cic).is_some()
                };
                if reset {
                    debug!(cic = msg.cic, "reset confirmed");
                    self.reset_circuit(msg.cic, false, false, now_ms);
                    Ok(())
                } else {
                    self.process_call_msg(msg, now_ms)
                }
            }
            _ => self.process_controller_msg(msg, now_ms),
        }
    }

    // A recognized response while probing ends the user part test
    fn note_user_part_available(&self, msg: &IsupMessage, _now_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.user_part_avail && inner.upt_timer.started() {
            inner.upt_timer.stop();
            inner.user_part_avail = true;
            inner.lock_timer.start(0);
            info!("remote user part is available");
            if msg.cic == inner.upt_cic
                && matches!(msg.msg_type, Some(MsgType::Upa | MsgType::Cnf | MsgType::Uec | MsgType::Cvr))
            {
                inner.upt_cic = 0;
            }
        }
    }

    /// Dispatch a call-scoped message (spec: processCallMsg)
    fn process_call_msg(&self, msg: IsupMessage, now_ms: u64) -> Result<(), IsupError> {
        let label = self.label_for(msg.cic);
        if msg.cic == 0 {
            info!(msg = %msg.name(), "dropping message with invalid CIC");
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        let t = msg.msg_type.unwrap_or(MsgType::Cnf);
        if t != MsgType::Iam {
            if let Some(call) = inner.calls.get_mut(&msg.cic) {
                call.enqueue(msg);
                return Ok(());
            }
            match t {
                MsgType::Rel => {
                    // Answer so the peer's state machine does not stall
                    info!(cic = msg.cic, "REL with no call, answering with RLC");
                    drop(inner);
                    self.transmit(&rlc_message(msg.cic, None, None, None), label);
                }
                MsgType::Rlc => {
                    debug!(cic = msg.cic, "RLC with no call, dropped");
                }
                _ => {
                    info!(msg = %msg.name(), cic = msg.cic, "no call for this circuit, resetting");
                    drop(inner);
                    self.start_circuit_reset(msg.cic, now_ms);
                }
            }
            return Ok(());
        }
        // IAM: check for a collision with an existing call (Q.764 2.9.1.4)
        let existing = inner
            .calls
            .get(&msg.cic)
            .map(|c| (c.outgoing(), c.state(), c.range().map(str::to_string)));
        if let Some((outgoing, state, range)) = existing {
            if !outgoing {
                info!(cic = msg.cic, "dropping repeated IAM for incoming call");
                return Ok(());
            }
            info!(cic = msg.cic, "incoming IAM collides with existing outgoing call");
            if state > CallState::Setup {
                info!(cic = msg.cic, "collision: outgoing call already responded, dropping");
                drop(inner);
                self.transmit(&rlc_message(msg.cic, None, None, None), label);
                return Ok(());
            }
            // The greater point code controls the even circuits; the
            // controlling side keeps the circuit, the other side yields
            let dpc = self.local.pack(self.variant);
            let opc = self.remote.pack(self.variant);
            let controlling = dpc > opc;
            let even = msg.cic % 2 == 0;
            if controlling == even {
                info!(cic = msg.cic, "collision: we control this circuit, dropping request");
                drop(inner);
                self.transmit(&rlc_message(msg.cic, None, None, None), label);
                return Ok(());
            }
            // Yield: move the outgoing call onto a fresh circuit
            let replacement =
                self.group.reserve(lock::LOCKED_BUSY, Some(self.strategy()), range.as_deref());
            let can_replace = inner.calls.get_mut(&msg.cic).map(|c| c.can_replace_circuit()).unwrap_or(false);
            match (replacement, can_replace) {
                (Ok(new_cic), true) => {
                    let mut call = inner.calls.remove(&msg.cic).unwrap();
                    self.group.release(msg.cic);
                    let out = call.replace_circuit(new_cic, now_ms);
                    let new_label = call.label();
                    inner.calls.insert(new_cic, call);
                    drop(inner);
                    self.transmit_all(out, new_label);
                    inner = self.inner.lock().unwrap();
                }
                (replacement, can_replace) => {
                    // Replacement not possible: the outgoing attempt fails
                    // with congestion and the incoming request takes over
                    if let (Ok(new_cic), false) = (&replacement, can_replace) {
                        self.group.release(*new_cic);
                    }
                    inner.calls.remove(&msg.cic);
                    self.group.release(msg.cic);
                    let mut params = ParamList::new();
                    params.set("reason", "congestion");
                    inner.events.push_back(CallEvent {
                        kind: CallEventKind::Release,
                        cic: msg.cic,
                        params,
                    });
                }
            }
        }
        // Q.764 2.8.2.3 (xiv): an IAM implicitly unblocks the remote side
        let test_call = msg.params.get("CallingPartyCategory") == Some("test");
        if !test_call && self.group.locked(msg.cic, lock::REMOTE) != 0 {
            info!(cic = msg.cic, "unblocking remote circuit on IAM request");
            let hw = self.group.locked(msg.cic, lock::REMOTE_HW_FAIL) != 0;
            let maint = self.group.locked(msg.cic, lock::REMOTE_MAINT) != 0;
            self.group.hw_lock(msg.cic, false, true, hw, false);
            self.group.maint_lock(msg.cic, false, true, maint, false);
            inner.verify_event = true;
        }
        let check = if test_call { 0 } else { lock::LOCKED_BUSY };
        match self.group.reserve_list(&[msg.cic], true, check, false) {
            Ok(_) => {
                let mut call = IsupCall::new_incoming(msg.cic, label, &self.cfg);
                call.enqueue(msg);
                inner.calls.insert(call.cic(), call);
                Ok(())
            }
            Err(_) => {
                info!(cic = msg.cic, "cannot reserve circuit for incoming call, congestion");
                drop(inner);
                let mut rel = IsupMessage::new(MsgType::Rel, msg.cic);
                rel.params.add("CauseIndicators", "congestion");
                self.transmit(&rel, label);
                Ok(())
            }
        }
    }

    /// Handle link-level operations not tied to a specific call
    /// (spec: processControllerMsg)
    fn process_controller_msg(&self, msg: IsupMessage, now_ms: u64) -> Result<(), IsupError> {
        let label = self.label_for(msg.cic);
        let mut reason: Option<&'static str> = None;
        match msg.msg_type {
            Some(MsgType::Cnf) => {
                info!(
                    cic = msg.cic,
                    cause = msg.params.get_or("CauseIndicators", "").as_str(),
                    diagnostic = msg.params.get_or("CauseIndicators.diagnostic", "").as_str(),
                    "received confusion"
                );
                self.stop_segment_wait(msg.cic);
            }
            Some(MsgType::Rlc) => {
                // Response to RSC: clear local lock state
                self.reset_circuit(msg.cic, false, false, now_ms);
            }
            Some(MsgType::Rsc) => {
                let was_reset = self.reset_circuit(msg.cic, true, true, now_ms);
                if was_reset {
                    // Re-signal a persisting local maintenance block (Q.764 2.9.3.1 c)
                    if self.group.locked(msg.cic, lock::LOCAL_MAINT) != 0
                        && self.group.locked(msg.cic, lock::LOCKING_MAINT) == 0
                    {
                        self.group.set_lock(msg.cic, lock::LOCAL_MAINT_CHG);
                        let mut inner = self.inner.lock().unwrap();
                        inner.lock_timer.start(now_ms);
                    }
                    self.transmit(&rlc_message(msg.cic, None, None, None), label);
                } else {
                    reason = Some("unknown-channel");
                }
                self.stop_segment_wait(msg.cic);
            }
            Some(MsgType::Grs) => {
                self.stop_segment_wait(msg.cic);
                // Q.763 3.43: GRS range must be 1..=31
                let range = msg.params.get_int("RangeAndStatus", 0);
                if !(1..=31).contains(&range) {
                    info!(cic = msg.cic, range, "GRS with invalid range");
                } else {
                    let mut map = String::new();
                    for i in 0..range as u32 {
                        let ok = self.reset_circuit(msg.cic + i, true, true, now_ms);
                        map.push(if ok { '0' } else { '1' });
                    }
                    let mut m = IsupMessage::new(MsgType::Gra, msg.cic);
                    m.params.add("RangeAndStatus", range.to_string());
                    m.params.add("RangeAndStatus.map", map);
                    self.transmit(&m, label);
                }
            }
            Some(MsgType::Ubl) => {
                if self.block_circuit(msg.cic, false, true, false, true, true, false).is_some() {
                    self.transmit(&IsupMessage::new(MsgType::Uba, msg.cic), label);
                } else {
                    reason = Some("unknown-channel");
                }
            }
            Some(MsgType::Blk) => {
                if self.block_circuit(msg.cic, true, true, false, true, true, false).is_some() {
                    self.transmit(&IsupMessage::new(MsgType::Bla, msg.cic), label);
                    self.replace_or_drop_calls(msg.cic, &[true], false, now_ms);
                } else {
                    reason = Some("unknown-channel");
                }
            }
            Some(t @ (MsgType::Bla | MsgType::Uba)) => {
                let block = t == MsgType::Bla;
                let req = if block { MsgType::Blk } else { MsgType::Ubl };
                let removed = {
                    let mut inner = self.inner.lock().unwrap();
                    remove_pending(&mut inner.pending, req, msg.cic)
                };
                match removed {
                    Some(p) => {
                        debug!(cic = msg.cic, msg = t.name(), "acknowledged pending request");
                        let _ = self.block_circuit(msg.cic, block, false, p.hw_fail, true, false, true);
                        self.send_local_lock(now_ms);
                    }
                    None => reason = Some("wrong-state-message"),
                }
            }
            Some(t @ (MsgType::Cga | MsgType::Cua)) => {
                let block = t == MsgType::Cga;
                let Some(hw_fail) = group_type_hw(&msg) else {
                    info!(cic = msg.cic, msg = t.name(), "unsupported group supervision type");
                    return Ok(());
                };
                let Some(src_map) = valid_range_map(&msg, 256, 32) else {
                    info!(cic = msg.cic, msg = t.name(), "invalid range or status map");
                    return Ok(());
                };
                // The acknowledgement must match the pending request: same
                // type indicator and a map that does not exceed ours
                let req = if block { MsgType::Cgb } else { MsgType::Cgu };
                let matched = {
                    let mut inner = self.inner.lock().unwrap();
                    let gst = msg.params.get_or("GroupSupervisionTypeIndicator", "");
                    let pos = inner.pending.iter().position(|p| {
                        p.msg.is(req)
                            && p.msg.cic == msg.cic
                            && p.msg.params.get_or("GroupSupervisionTypeIndicator", "") == gst
                            && map_covers(&p.msg.params.get_or("RangeAndStatus.map", ""), &src_map)
                    });
                    pos.map(|i| inner.pending.remove(i))
                };
                match matched {
                    Some(p) => {
                        let map = p.msg.params.get_or("RangeAndStatus.map", "");
                        for (i, c) in map.chars().enumerate() {
                            if c != '0' {
                                let _ = self
                                    .block_circuit(msg.cic + i as u32, block, false, hw_fail, true, false, true);
                            }
                        }
                        self.send_local_lock(now_ms);
                    }
                    None => {
                        info!(cic = msg.cic, msg = t.name(), "no matching request for acknowledgement");
                    }
                }
            }
            Some(t @ (MsgType::Cgb | MsgType::Cgu)) => {
                self.stop_segment_wait(msg.cic);
                let block = t == MsgType::Cgb;
                let Some(hw_fail) = group_type_hw(&msg) else {
                    info!(cic = msg.cic, msg = t.name(), "unsupported group supervision type");
                    return Ok(());
                };
                let Some(src_map) = valid_range_map(&msg, 256, 32) else {
                    info!(cic = msg.cic, msg = t.name(), "invalid range or status map");
                    return Ok(());
                };
                let mut ack_map = String::new();
                let mut changed = Vec::new();
                for (i, c) in src_map.chars().enumerate() {
                    if c == '0' {
                        ack_map.push('0');
                        changed.push(false);
                        continue;
                    }
                    let code = msg.cic + i as u32;
                    let ok = self
                        .block_circuit(code, block, true, hw_fail, true, true, false)
                        .unwrap_or(false);
                    ack_map.push(if ok { '1' } else { '0' });
                    changed.push(ok);
                }
                let mut m = IsupMessage::new(if block { MsgType::Cga } else { MsgType::Cua }, msg.cic);
                m.params.add(
                    "GroupSupervisionTypeIndicator",
                    msg.params.get_or("GroupSupervisionTypeIndicator", "maintenance"),
                );
                m.params.add("RangeAndStatus", src_map.len().to_string());
                m.params.add("RangeAndStatus.map", &ack_map);
                self.transmit(&m, label);
                if block {
                    self.replace_or_drop_calls(msg.cic, &changed, hw_fail, now_ms);
                }
            }
            Some(MsgType::Uec) => {
                warn!(cic = msg.cic, "circuit unequipped on remote side");
                let _ = self.block_circuit(msg.cic, true, true, false, true, true, false);
            }
            Some(MsgType::Upt) => {
                self.transmit(&IsupMessage::new(MsgType::Upa, msg.cic), label);
            }
            Some(MsgType::Upa) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.upt_cic != 0 && inner.upt_cic == msg.cic {
                    debug!(cic = msg.cic, "received valid UPA");
                    inner.upt_cic = 0;
                }
            }
            Some(MsgType::Gra) => {
                reason = Some("wrong-state-message");
            }
            Some(MsgType::Cvt) => {
                if self.group.exists(msg.cic) {
                    let mut m = IsupMessage::new(MsgType::Cvr, msg.cic);
                    m.params.add("CircuitValidationRespIndicator", "success");
                    self.transmit(&m, label);
                } else {
                    reason = Some("unknown-channel");
                }
            }
            Some(MsgType::Cqm) => {
                let range = msg.params.get_int("RangeAndStatus", 0);
                if !(1..=31).contains(&range) {
                    reason = Some("invalid-ie");
                } else {
                    let mut states = Vec::with_capacity(range as usize);
                    for i in 0..range as u32 {
                        states.push(self.circuit_state_octet(msg.cic + i));
                    }
                    let mut m = IsupMessage::new(MsgType::Cqr, msg.cic);
                    m.params.add("RangeAndStatus", range.to_string());
                    m.params.add("CircuitStateIndicator", crate::types::to_hex(&states));
                    self.transmit(&m, label);
                }
            }
            Some(MsgType::Ccr) => {
                // Continuity test request: only the loopback is confirmed
                self.transmit(&IsupMessage::new(MsgType::Lpa, msg.cic), label);
            }
            Some(MsgType::Cqr | MsgType::Cvr | MsgType::Lpa | MsgType::Cot) => {
                debug!(msg = %msg.name(), cic = msg.cic, "known response, ignored");
            }
            _ => return self.process_unknown_msg(msg, now_ms),
        }
        if let Some(r) = reason {
            info!(msg = %msg.name(), cic = msg.cic, reason = r, "maintenance message refused");
            self.transmit(&cnf_message(msg.cic, r, None, &self.cfg.location), label);
        }
        Ok(())
    }

    // Unknown or unsupported message: Q.764 2.9.5.1 for calls in setup,
    // otherwise follow the message compatibility instructions
    fn process_unknown_msg(&self, msg: IsupMessage, now_ms: u64) -> Result<(), IsupError> {
        let label = self.label_for(msg.cic);
        let mut inner = self.inner.lock().unwrap();
        let early = inner
            .calls
            .get(&msg.cic)
            .map(|c| (c.early_state(), c.outgoing()))
            .filter(|(early, _)| *early);
        if let Some((_, outgoing)) = early {
            info!(msg = %msg.name(), cic = msg.cic, "unexpected message for call in initial state");
            if outgoing {
                drop(inner);
                self.replace_or_drop_calls(msg.cic, &[true], false, now_ms);
            } else {
                let call = inner.calls.get_mut(&msg.cic).unwrap();
                call.set_terminate(false, "normal", None, Some(&self.cfg.location));
                drop(inner);
                self.start_circuit_reset(msg.cic, now_ms);
            }
            return Ok(());
        }
        // Compatibility instructions: release, discard+cnf or pass-on rules
        let (release, cnf) = msg_compat_decision(&msg);
        let diagnostic = crate::types::to_hex(&[msg.code]);
        if release {
            match inner.calls.get_mut(&msg.cic) {
                Some(call) => {
                    call.set_terminate(true, "unknown-message", Some(&diagnostic), Some(&self.cfg.location));
                }
                None => {
                    drop(inner);
                    self.transmit(
                        &rlc_message(msg.cic, Some("unknown-message"), Some(&diagnostic), Some(&self.cfg.location)),
                        label,
                    );
                }
            }
        } else if cnf {
            drop(inner);
            info!(msg = %msg.name(), cic = msg.cic, "unknown message, sending confusion");
            self.transmit(
                &cnf_message(msg.cic, "unknown-message", Some(&diagnostic), &self.cfg.location),
                label,
            );
        } else {
            debug!(msg = %msg.name(), cic = msg.cic, "unknown message discarded");
        }
        Ok(())
    }

    fn stop_segment_wait(&self, cic: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(call) = inner.calls.get_mut(&cic) {
            call.stop_wait_segment(false);
        }
    }

    // Circuit state octet for CQR (Q.763 3.14)
    fn circuit_state_octet(&self, cic: u32) -> u8 {
        if !self.group.exists(cic) || self.group.status(cic) == CircuitStatus::Missing {
            return 0x03; // unequipped
        }
        let mut state = 0u8;
        let maint = self.group.locked(cic, lock::LOCAL_MAINT | lock::REMOTE_MAINT);
        if maint & lock::LOCAL_MAINT != 0 {
            state |= 0x01;
        }
        if maint & lock::REMOTE_MAINT != 0 {
            state |= 0x02;
        }
        let hw = self.group.locked(cic, lock::LOCAL_HW_FAIL | lock::REMOTE_HW_FAIL);
        if hw != 0 {
            if hw & lock::LOCAL_HW_FAIL != 0 {
                state |= 0x1c;
            }
            if hw & lock::REMOTE_HW_FAIL != 0 {
                state |= 0x2c;
            }
            return state;
        }
        match self.group.status(cic) {
            CircuitStatus::Connected => state | 0x04,
            CircuitStatus::Idle => state | 0x0c,
            _ => state | 0x08,
        }
    }

    /// Reset a circuit (Q.764 2.9.3.1). With `check_call` an affected outgoing
    /// call in setup is moved to another circuit, any other call terminated.
    pub fn reset_circuit(&self, cic: u32, remote: bool, check_call: bool, now_ms: u64) -> bool {
        if !self.group.exists(cic) {
            return false;
        }
        debug!(cic, "resetting circuit");
        if check_call {
            self.replace_or_drop_calls(cic, &[true], false, now_ms);
        }
        if remote && self.group.locked(cic, lock::REMOTE) != 0 {
            info!(cic, "unblocking remote circuit on reset request");
            let hw = self.group.locked(cic, lock::REMOTE_HW_FAIL) != 0;
            let maint = self.group.locked(cic, lock::REMOTE_MAINT) != 0;
            self.group.hw_lock(cic, false, true, hw, false);
            self.group.maint_lock(cic, false, true, maint, false);
            self.inner.lock().unwrap().verify_event = true;
        }
        let mut inner = self.inner.lock().unwrap();
        remove_pending(&mut inner.pending, MsgType::Rsc, cic);
        self.group.reset_lock(cic, lock::RESETTING);
        if inner.rsc_cic == Some(cic) {
            inner.rsc_cic = None;
            self.group.release(cic);
        } else if inner.calls.get(&cic).is_none() {
            self.group.set_status(cic, CircuitStatus::Idle);
        }
        true
    }

    /// Start an outgoing circuit reset with its reply-wait timer
    pub fn start_circuit_reset(&self, cic: u32, now_ms: u64) {
        // A locally locked circuit must not be reset: the reset would clear
        // our lock state at the remote side (Q.764 2.9.3.1)
        if self.group.locked(cic, lock::LOCAL) != 0 {
            info!(cic, "not resetting locally locked circuit");
            self.group.release(cic);
            return;
        }
        if self.group.locked(cic, lock::BUSY) != 0 {
            return;
        }
        if self.group.reserve_list(&[cic], true, lock::LOCKED_BUSY, false).is_err() {
            return;
        }
        self.group.set_lock(cic, lock::RESETTING);
        let msg = IsupMessage::new(MsgType::Rsc, cic);
        let mut pending = PendingMsg {
            msg: msg.clone(),
            timer: SigTimer::new(self.cfg.t16_ms),
            global: SigTimer::new(self.cfg.t17_ms),
            hw_fail: false,
            alerted: false,
        };
        pending.timer.start(now_ms);
        pending.global.start(now_ms);
        self.inner.lock().unwrap().pending.push(pending);
        self.transmit(&msg, self.label_for(cic));
    }

    /// Toggle a circuit lock bit. Returns None for unknown circuits, otherwise
    /// whether the blocked state actually changed (idempotence check).
    #[allow(clippy::too_many_arguments)]
    fn block_circuit(
        &self,
        cic: u32,
        block: bool,
        remote: bool,
        hw_fail: bool,
        changed: bool,
        changed_state: bool,
        reset_locking: bool,
    ) -> Option<bool> {
        if !self.group.exists(cic) {
            return None;
        }
        let something = if hw_fail {
            self.group.hw_lock(cic, block, remote, changed, changed_state)
        } else {
            self.group.maint_lock(cic, block, remote, changed, changed_state)
        };
        if reset_locking && !remote {
            self.group
                .reset_lock(cic, if hw_fail { lock::LOCKING_HW_FAIL } else { lock::LOCKING_MAINT });
        }
        if something {
            info!(
                cic,
                block,
                remote,
                hw_fail,
                flags = self.group.locked(cic, u32::MAX),
                "circuit lock state changed"
            );
            self.inner.lock().unwrap().verify_event = true;
        }
        Some(something)
    }

    // Replace circuits for outgoing calls still in setup; with `hw` terminate
    // every other affected call
    fn replace_or_drop_calls(&self, first_cic: u32, map: &[bool], hw: bool, now_ms: u64) {
        for (i, &bit) in map.iter().enumerate() {
            if !bit {
                continue;
            }
            let cic = first_cic + i as u32;
            let mut inner = self.inner.lock().unwrap();
            let Some(call) = inner.calls.get_mut(&cic) else { continue };
            if call.outgoing() && call.state() <= CallState::Setup && call.can_replace_circuit() {
                let range = call.range().map(str::to_string);
                match self.group.reserve(lock::LOCKED_BUSY, Some(self.strategy()), range.as_deref()) {
                    Ok(new_cic) => {
                        let mut call = inner.calls.remove(&cic).unwrap();
                        self.group.release(cic);
                        let out = call.replace_circuit(new_cic, now_ms);
                        let label = call.label();
                        inner.calls.insert(new_cic, call);
                        drop(inner);
                        self.transmit_all(out, label);
                        continue;
                    }
                    Err(_) => call.replace_failed(),
                }
            } else if hw {
                call.set_terminate(false, "temporary-failure", None, Some(&self.cfg.location));
            }
        }
    }

    /// Request a local block/unblock of circuits; the resulting signaling is
    /// batched by `send_local_lock`
    pub fn control_block(&self, cics: &[u32], block: bool, hw_fail: bool, now_ms: u64) -> bool {
        let mut any = false;
        for &cic in cics {
            if !self.group.exists(cic) {
                return false;
            }
            if self.group.locked(cic, lock::BUSY) != 0 {
                info!(cic, "circuit busy locking or resetting");
                return false;
            }
            any |= self.block_circuit(cic, block, false, hw_fail, true, true, false).unwrap_or(false);
        }
        let _ = any;
        self.send_local_lock(now_ms);
        true
    }

    /// Send blocking/unblocking requests for every pending local lock change.
    /// Contiguous circuits of one span with the same pending operation are
    /// grouped into one CGB/CGU; single changes use BLK/UBL.
    pub fn send_local_lock(&self, now_ms: u64) -> bool {
        let codes = self.group.codes();
        let mut sent = false;
        let mut need_more = false;
        loop {
            // Pick the first circuit with a pending, not in-progress change
            let mut start = None;
            for &code in &codes {
                let (can_hw, can_maint) = self.can_lock(code);
                if can_hw || can_maint {
                    let hw = can_hw;
                    let flag = if hw { lock::LOCAL_HW_FAIL } else { lock::LOCAL_MAINT };
                    let lock_req = self.group.locked(code, flag) != 0;
                    start = Some((code, hw, lock_req));
                    break;
                }
                if self.group.locked(code, lock::LOCAL_CHG) != 0 {
                    need_more = true;
                }
            }
            let Some((code, hw, lock_req)) = start else { break };
            let span = self.group.span_of(code);
            let locking = if hw { lock::LOCKING_HW_FAIL } else { lock::LOCKING_MAINT };
            self.group.set_lock(code, locking);
            let mut map = String::from("1");
            let mut cics = 1u32;
            if self.cfg.lock_group {
                // Extend over following circuits in the same span with the
                // same operation pending (Q.763 3.43: at most 32 affected)
                let flag = if hw { lock::LOCAL_HW_FAIL } else { lock::LOCAL_MAINT };
                for &other in codes.iter().filter(|&&c| c > code) {
                    if cics >= 32 || map.len() >= 256 {
                        break;
                    }
                    if self.group.span_of(other) != span {
                        break;
                    }
                    let offset = (other - code) as usize;
                    if offset >= 256 {
                        break;
                    }
                    while map.len() < offset {
                        map.push('0');
                    }
                    let (can_hw, can_maint) = self.can_lock(other);
                    let can = if hw { can_hw } else { can_maint };
                    if can && (self.group.locked(other, flag) != 0) == lock_req {
                        self.group.set_lock(other, locking);
                        map.push('1');
                        cics += 1;
                    } else {
                        if self.group.locked(other, lock::LOCAL_CHG) != 0 {
                            need_more = true;
                        }
                        map.push('0');
                    }
                }
                while map.ends_with('0') {
                    map.pop();
                }
            }
            let (msg, timer, global) = if self.cfg.lock_group && (map.len() > 1 || hw) {
                let mut m = IsupMessage::new(if lock_req { MsgType::Cgb } else { MsgType::Cgu }, code);
                m.params.add(
                    "GroupSupervisionTypeIndicator",
                    if hw { "hw-failure" } else { "maintenance" },
                );
                m.params.add("RangeAndStatus", map.len().to_string());
                m.params.add("RangeAndStatus.map", &map);
                let (t, g) = if lock_req {
                    (self.cfg.t18_ms, self.cfg.t19_ms)
                } else {
                    (self.cfg.t20_ms, self.cfg.t21_ms)
                };
                (m, t, g)
            } else {
                let m = IsupMessage::new(if lock_req { MsgType::Blk } else { MsgType::Ubl }, code);
                let (t, g) = if lock_req {
                    (self.cfg.t12_ms, self.cfg.t13_ms)
                } else {
                    (self.cfg.t14_ms, self.cfg.t15_ms)
                };
                (m, t, g)
            };
            let mut pending = PendingMsg {
                msg: msg.clone(),
                timer: SigTimer::new(timer),
                global: SigTimer::new(global),
                hw_fail: hw,
                alerted: false,
            };
            pending.timer.start(now_ms);
            pending.global.start(now_ms);
            self.inner.lock().unwrap().pending.push(pending);
            if self.cfg.duplicate_cgb && msg.is(MsgType::Cgb) {
                self.transmit(&msg, self.label_for(code));
            }
            self.transmit(&msg, self.label_for(code));
            sent = true;
        }
        let mut inner = self.inner.lock().unwrap();
        if need_more {
            inner.lock_timer.start(now_ms);
        } else {
            inner.lock_timer.stop();
        }
        sent
    }

    // A circuit is ready to signal a (hw, maintenance) lock change
    fn can_lock(&self, code: u32) -> (bool, bool) {
        let hw = self.group.locked(code, lock::LOCAL_HW_FAIL_CHG) != 0
            && self.group.locked(code, lock::LOCKING_HW_FAIL | lock::RESETTING) == 0;
        let maint = self.group.locked(code, lock::LOCAL_MAINT_CHG) != 0
            && self.group.locked(code, lock::LOCKING_MAINT | lock::RESETTING) == 0;
        (hw, maint)
    }

    /// Report a hardware alarm state change on a circuit
    pub fn hw_alarm(&self, cic: u32, alarm: bool, now_ms: u64) {
        let blocked = self.group.locked(cic, lock::LOCAL_HW_FAIL) != 0;
        if alarm == blocked {
            return;
        }
        self.group.hw_lock(cic, alarm, false, true, true);
        let mut inner = self.inner.lock().unwrap();
        inner.verify_event = true;
        if !inner.lock_timer.started() {
            inner.lock_timer.start(now_ms);
        }
        drop(inner);
        if alarm {
            self.replace_or_drop_calls(cic, &[true], true, now_ms);
        }
    }

    /// Pull the next application event. Non-blocking.
    pub fn get_event(&self, now_ms: u64) -> Option<CallEvent> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(ev) = inner.events.pop_front() {
                return Some(ev);
            }
            if inner.verify_event {
                inner.verify_event = false;
                return Some(CallEvent { kind: CallEventKind::Verify, cic: 0, params: ParamList::new() });
            }
        }
        let cics: Vec<u32> = {
            let inner = self.inner.lock().unwrap();
            inner.calls.keys().copied().collect()
        };
        for cic in cics {
            let mut inner = self.inner.lock().unwrap();
            let polled = match inner.calls.get_mut(&cic) {
                Some(call) => {
                    let label = call.label();
                    let (ev, out) = call.get_event(now_ms);
                    let released = call.state() == CallState::Released;
                    (ev, out, label, released)
                }
                None => continue,
            };
            let (ev, out, label, released) = polled;
            if released {
                inner.calls.remove(&cic);
                self.group.release(cic);
            }
            drop(inner);
            self.transmit_all(out, label);
            if let Some(ev) = ev {
                return Some(ev);
            }
        }
        None
    }

    /// Drive the controller's timers: user part test, local lock batching,
    /// pending message retransmission and the periodic circuit reset.
    pub fn timer_tick(&self, now_ms: u64) {
        // Remote user part test
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.user_part_avail && inner.upt_timer.interval() != 0 {
                if inner.upt_timer.started() && !inner.upt_timer.timed_out(now_ms) {
                    return;
                }
                if inner.upt_timer.started() {
                    debug!("user part test timed out, retransmitting");
                }
                let cic = self.group.codes().first().copied().unwrap_or(1);
                inner.upt_cic = cic;
                inner.upt_timer.start(now_ms);
                drop(inner);
                self.transmit(&IsupMessage::new(MsgType::Upt, cic), self.label_for(cic));
                return;
            }
        }
        // Local lock re-check
        let fire_lock = {
            let mut inner = self.inner.lock().unwrap();
            if inner.lock_timer.timed_out(now_ms) {
                inner.lock_timer.stop();
                true
            } else {
                false
            }
        };
        if fire_lock {
            self.send_local_lock(now_ms);
        }
        // Pending maintenance message retransmission
        let due: Vec<(IsupMessage, bool)> = {
            let mut inner = self.inner.lock().unwrap();
            let mut due = Vec::new();
            let mut keep = Vec::new();
            for mut p in inner.pending.drain(..) {
                if !p.timer.timed_out(now_ms) {
                    keep.push(p);
                    continue;
                }
                if p.global.timed_out(now_ms) && !p.alerted {
                    warn!(msg = %p.msg.name(), cic = p.msg.cic, "pending operation exceeded its global timer");
                    p.alerted = true;
                }
                if !self.pending_still_needed(&p) {
                    debug!(msg = %p.msg.name(), cic = p.msg.cic, "pending operation no longer needed");
                    self.clear_pending_locking(&p);
                    continue;
                }
                p.timer.start(now_ms);
                due.push((p.msg.clone(), p.msg.is(MsgType::Cgb) && self.cfg.duplicate_cgb));
                keep.push(p);
            }
            inner.pending = keep;
            due
        };
        for (msg, duplicate) in due {
            if duplicate {
                self.transmit(&msg, self.label_for(msg.cic));
            }
            self.transmit(&msg, self.label_for(msg.cic));
        }
        // Periodic circuit reset
        if self.cfg.channel_sync_ms == 0 {
            return;
        }
        let start_reset = {
            let mut inner = self.inner.lock().unwrap();
            if inner.rsc_timer.started() && !inner.rsc_timer.timed_out(now_ms) {
                return;
            }
            if inner.rsc_timer.started() {
                inner.rsc_timer.stop();
                if let Some(cic) = inner.rsc_cic.take() {
                    info!(cic, "circuit reset timed out");
                    self.group.reset_lock(cic, lock::RESETTING);
                    self.group.release(cic);
                    return;
                }
            }
            inner.rsc_timer.start(now_ms);
            true
        };
        if start_reset {
            if let Ok(cic) = self.group.reserve(lock::LOCAL | lock::BUSY, None, None) {
                let has_pending = {
                    let inner = self.inner.lock().unwrap();
                    inner.pending.iter().any(|p| p.msg.is(MsgType::Rsc) && p.msg.cic == cic)
                };
                if has_pending {
                    self.group.release(cic);
                    return;
                }
                self.group.set_lock(cic, lock::RESETTING);
                self.inner.lock().unwrap().rsc_cic = Some(cic);
                debug!(cic, "periodic restart");
                self.transmit(&IsupMessage::new(MsgType::Rsc, cic), self.label_for(cic));
            }
        }
    }

    // Verify a pending request is still in use: circuits still waiting to
    // reach the requested state
    fn pending_still_needed(&self, p: &PendingMsg) -> bool {
        match p.msg.msg_type {
            Some(MsgType::Blk | MsgType::Ubl) => {
                let flag = if p.hw_fail { lock::LOCAL_HW_FAIL } else { lock::LOCAL_MAINT };
                let want = p.msg.is(MsgType::Blk);
                self.group.exists(p.msg.cic) && (self.group.locked(p.msg.cic, flag) != 0) == want
            }
            Some(MsgType::Cgb | MsgType::Cgu) => {
                let flag = if p.hw_fail { lock::LOCAL_HW_FAIL } else { lock::LOCAL_MAINT };
                let want = p.msg.is(MsgType::Cgb);
                let map = p.msg.params.get_or("RangeAndStatus.map", "");
                map.chars().enumerate().any(|(i, c)| {
                    c != '0' && (self.group.locked(p.msg.cic + i as u32, flag) != 0) == want
                })
            }
            Some(MsgType::Rsc) => true,
            _ => false,
        }
    }

    fn clear_pending_locking(&self, p: &PendingMsg) {
        let locking = if p.hw_fail { lock::LOCKING_HW_FAIL } else { lock::LOCKING_MAINT };
        match p.msg.msg_type {
            Some(MsgType::Blk | MsgType::Ubl) => self.group.reset_lock(p.msg.cic, locking),
            Some(MsgType::Cgb | MsgType::Cgu) => {
                let map = p.msg.params.get_or("RangeAndStatus.map", "");
                for (i, c) in map.chars().enumerate() {
                    if c != '0' {
                        self.group.reset_lock(p.msg.cic + i as u32, locking);
                    }
                }
            }
            _ => {}
        }
    }
}

fn remove_pending(pending: &mut Vec<PendingMsg>, t: MsgType, cic: u32) -> Option<PendingMsg> {
    let pos = pending.iter().position(|p| p.msg.is(t) && p.msg.cic == cic)?;
    Some(pending.remove(pos))
}

// Maintenance vs hardware-failure distinction; None for unsupported values
fn group_type_hw(msg: &IsupMessage) -> Option<bool> {
    match msg.params.get("GroupSupervisionTypeIndicator") {
        Some(v) if v.contains("hw-failure") => Some(true),
        Some(v) if v.contains("maintenance") => Some(false),
        _ => None,
    }
}

// Validate RangeAndStatus: range within bounds, map present, at most
// `max_ones` circuits affected. Returns the map.
fn valid_range_map(msg: &IsupMessage, max_range: i64, max_ones: usize) -> Option<String> {
    let range = msg.params.get_int("RangeAndStatus", 0);
    if range < 1 || range > max_range {
        return None;
    }
    let map = msg.params.get("RangeAndStatus.map")?;
    if map.len() < range as usize || map.len() > max_range as usize {
        return None;
    }
    if map.chars().filter(|c| *c == '1').count() > max_ones {
        return None;
    }
    Some(map.to_string())
}

// An acknowledgement map may only confirm circuits we requested
fn map_covers(ours: &str, theirs: &str) -> bool {
    if ours.is_empty() || ours.len() != theirs.len() {
        return false;
    }
    theirs
        .chars()
        .zip(ours.chars())
        .all(|(t, o)| t == '0' || o != '0')
}

// Decide release/cnf from MessageCompatInformation (Q.763 3.33); with no
// instructions present confusion is the default
fn msg_compat_decision(msg: &IsupMessage) -> (bool, bool) {
    let Some(compat) = msg.params.get("MessageCompatInformation") else {
        return (false, true);
    };
    let flags: Vec<&str> = compat.split(',').map(str::trim).collect();
    if flags.contains(&"release") {
        return (true, false);
    }
    if flags.contains(&"discard") {
        return (false, flags.contains(&"cnf"));
    }
    let release = flags.contains(&"nopass-release");
    (release, !release && flags.contains(&"cnf"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Parity;
    use crate::isup::message::{decode_message, encode_message};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn setup(circuits: u32) -> (IsupController, UnboundedReceiver<TransmitRequest>) {
        setup_with(circuits, IsupConfig::default())
    }

    fn setup_with(circuits: u32, cfg: IsupConfig) -> (IsupController, UnboundedReceiver<TransmitRequest>) {
        let group = Arc::new(CircuitGroup::new(
            Strategy::parse(&cfg.strategy),
            Parity::parse(&cfg.strategy_restrict),
        ));
        group.insert_span("span1", 1, circuits);
        let (tx, rx) = unbounded_channel();
        let ctrl = IsupController::new(cfg, group, tx).unwrap();
        (ctrl, rx)
    }

    fn next_msg(rx: &mut UnboundedReceiver<TransmitRequest>) -> IsupMessage {
        let req = rx.try_recv().expect("expected a transmitted message");
        decode_message(&req.data, ProtocolVariant::Itu, &DecodeCtx::default()).unwrap()
    }

    fn wire(msg: &IsupMessage) -> Vec<u8> {
        encode_message(msg, ProtocolVariant::Itu).unwrap()
    }

    #[test]
    fn test_outgoing_call_explicit_circuits() {
        let (ctrl, mut rx) = setup(16);
        // 5 and 9 busy
        for c in [5u32, 9] {
            ctrl.circuits().reserve_list(&[c], true, lock::LOCKED_BUSY, false).unwrap();
        }
        let mut req = ParamList::new();
        req.add("called", "123456");
        req.add("circuits", "5,7,9");
        let cic = ctrl.call(&req, 0).unwrap();
        assert_eq!(cic, 7);
        let iam = next_msg(&mut rx);
        assert!(iam.is(MsgType::Iam));
        assert_eq!(iam.cic, 7);
        assert_eq!(iam.params.get("CalledPartyNumber"), Some("123456"));
        // Configured default capability threaded into the IAM
        assert_eq!(iam.params.get("UserServiceInformation"), Some("alaw"));
    }

    #[test]
    fn test_end_to_end_call_scenario() {
        let (ctrl, mut rx) = setup(16);
        let mut req = ParamList::new();
        req.add("called", "123456");
        req.add("circuits", "7");
        let cic = ctrl.call(&req, 0).unwrap();
        assert_eq!(cic, 7);
        let _iam = next_msg(&mut rx);

        // ACM arrives: Accept event
        let acm = IsupMessage::new(MsgType::Acm, 7);
        ctrl.receive(&wire(&acm), 10).unwrap();
        let ev = ctrl.get_event(10).unwrap();
        assert_eq!(ev.kind, CallEventKind::Accept);

        // ANM arrives: Answer event
        let anm = IsupMessage::new(MsgType::Anm, 7);
        ctrl.receive(&wire(&anm), 20).unwrap();
        let ev = ctrl.get_event(20).unwrap();
        assert_eq!(ev.kind, CallEventKind::Answer);

        // Local release: REL goes out with the configured reason
        let mut rel = ParamList::new();
        rel.add("reason", "normal-clearing");
        assert!(ctrl.send_call_event(7, CallEventKind::Release, &rel, 30));
        let rel_out = next_msg(&mut rx);
        assert!(rel_out.is(MsgType::Rel));
        assert_eq!(rel_out.params.get("CauseIndicators"), Some("normal-clearing"));

        // RLC completes; circuit back to idle
        let rlc = IsupMessage::new(MsgType::Rlc, 7);
        ctrl.receive(&wire(&rlc), 40).unwrap();
        let ev = ctrl.get_event(40).unwrap();
        assert_eq!(ev.kind, CallEventKind::Release);
        assert_eq!(ctrl.circuits().status(7), CircuitStatus::Idle);
        assert!(ctrl.get_event(50).is_none());
    }

    #[test]
    fn test_incoming_iam_creates_call() {
        let (ctrl, mut rx) = setup(8);
        let mut iam = IsupMessage::new(MsgType::Iam, 3);
        iam.params.add("CalledPartyNumber", "555");
        ctrl.receive(&wire(&iam), 0).unwrap();
        let ev = ctrl.get_event(0).unwrap();
        assert_eq!(ev.kind, CallEventKind::NewCall);
        assert_eq!(ev.cic, 3);
        assert_eq!(ctrl.circuits().status(3), CircuitStatus::Reserved);
        // Accept and answer
        assert!(ctrl.send_call_event(3, CallEventKind::Accept, &ParamList::new(), 1));
        assert!(next_msg(&mut rx).is(MsgType::Acm));
    }

    #[test]
    fn test_congestion_release_when_no_circuit() {
        let (ctrl, mut rx) = setup(2);
        // Block both circuits locally
        for c in [1u32, 2] {
            ctrl.circuits().maint_lock(c, true, false, false, false);
        }
        let mut iam = IsupMessage::new(MsgType::Iam, 1);
        iam.params.add("CalledPartyNumber", "1");
        ctrl.receive(&wire(&iam), 0).unwrap();
        let rel = next_msg(&mut rx);
        assert!(rel.is(MsgType::Rel));
        assert_eq!(rel.params.get("CauseIndicators"), Some("congestion"));
    }

    #[test]
    fn test_collision_tie_break() {
        // Local 1-1-1 < remote 1-1-2: remote controls the even circuits.
        // On an even circuit our outgoing call yields; on odd we keep it.
        for (cic, yields) in [(4u32, true), (5u32, false)] {
            let (ctrl, mut rx) = setup(16);
            let mut req = ParamList::new();
            req.add("called", "123");
            req.add("circuits", cic.to_string().as_str());
            assert_eq!(ctrl.call(&req, 0).unwrap(), cic);
            let _iam = next_msg(&mut rx);
            let mut iam = IsupMessage::new(MsgType::Iam, cic);
            iam.params.add("CalledPartyNumber", "555");
            ctrl.receive(&wire(&iam), 10).unwrap();
            if yields {
                // Our call moved to a new circuit and retransmitted its IAM;
                // the incoming call proceeds on the contested circuit
                let retrans = next_msg(&mut rx);
                assert!(retrans.is(MsgType::Iam), "cic {}", cic);
                assert_ne!(retrans.cic, cic);
                let ev = ctrl.get_event(20).unwrap();
                assert_eq!(ev.kind, CallEventKind::NewCall);
                assert_eq!(ev.cic, cic);
            } else {
                // Incoming request dropped, RLC synthesized
                let rlc = next_msg(&mut rx);
                assert!(rlc.is(MsgType::Rlc), "cic {}", cic);
                assert!(ctrl.get_event(20).is_none());
            }
        }
    }

    #[test]
    fn test_unexpected_rel_gets_rlc() {
        let (ctrl, mut rx) = setup(4);
        let mut rel = IsupMessage::new(MsgType::Rel, 2);
        rel.params.add("CauseIndicators", "normal-clearing");
        ctrl.receive(&wire(&rel), 0).unwrap();
        let rlc = next_msg(&mut rx);
        assert!(rlc.is(MsgType::Rlc));
        assert_eq!(rlc.cic, 2);
    }

    #[test]
    fn test_stray_acm_triggers_reset() {
        let (ctrl, mut rx) = setup(4);
        let acm = IsupMessage::new(MsgType::Acm, 2);
        ctrl.receive(&wire(&acm), 0).unwrap();
        let rsc = next_msg(&mut rx);
        assert!(rsc.is(MsgType::Rsc));
        assert_eq!(rsc.cic, 2);
    }

    #[test]
    fn test_group_blocking_bitmap_scenario() {
        let (ctrl, mut rx) = setup(16);
        // Circuit 13 already remotely blocked
        ctrl.circuits().maint_lock(13, true, true, false, false);
        let mut cgb = IsupMessage::new(MsgType::Cgb, 10);
        cgb.params.add("GroupSupervisionTypeIndicator", "maintenance");
        cgb.params.add("RangeAndStatus", "4");
        cgb.params.add("RangeAndStatus.map", "1011");
        ctrl.receive(&wire(&cgb), 0).unwrap();
        let cga = next_msg(&mut rx);
        assert!(cga.is(MsgType::Cga));
        assert_eq!(cga.params.get("GroupSupervisionTypeIndicator"), Some("maintenance"));
        // 13 was already blocked: excluded from the changed map
        assert_eq!(cga.params.get("RangeAndStatus.map"), Some("1010"));
        assert_ne!(ctrl.circuits().locked(10, lock::REMOTE_MAINT), 0);
        assert_ne!(ctrl.circuits().locked(12, lock::REMOTE_MAINT), 0);
        assert_eq!(ctrl.circuits().locked(11, lock::REMOTE_MAINT), 0);

        // Second identical request: blocked circuits are now idempotent
        ctrl.receive(&wire(&cgb), 10).unwrap();
        let cga2 = next_msg(&mut rx);
        assert_eq!(cga2.params.get("RangeAndStatus.map"), Some("0000"));
    }

    #[test]
    fn test_group_unblock() {
        let (ctrl, mut rx) = setup(8);
        for c in [2u32, 3] {
            ctrl.circuits().maint_lock(c, true, true, false, false);
        }
        let mut cgu = IsupMessage::new(MsgType::Cgu, 2);
        cgu.params.add("GroupSupervisionTypeIndicator", "maintenance");
        cgu.params.add("RangeAndStatus", "2");
        cgu.params.add("RangeAndStatus.map", "11");
        ctrl.receive(&wire(&cgu), 0).unwrap();
        let cua = next_msg(&mut rx);
        assert!(cua.is(MsgType::Cua));
        assert_eq!(cua.params.get("RangeAndStatus.map"), Some("11"));
        assert_eq!(ctrl.circuits().locked(2, lock::REMOTE_MAINT), 0);
    }

    #[test]
    fn test_group_reset() {
        let (ctrl, mut rx) = setup(8);
        ctrl.circuits().maint_lock(3, true, true, false, false);
        let mut grs = IsupMessage::new(MsgType::Grs, 2);
        grs.params.add("RangeAndStatus", "3");
        grs.params.add("RangeAndStatus.map", "111");
        ctrl.receive(&wire(&grs), 0).unwrap();
        let gra = next_msg(&mut rx);
        assert!(gra.is(MsgType::Gra));
        assert_eq!(gra.params.get("RangeAndStatus"), Some("3"));
        // Remote locks cleared by the reset
        assert_eq!(ctrl.circuits().locked(3, lock::REMOTE_MAINT), 0);
    }

    #[test]
    fn test_local_block_batching() {
        let (ctrl, mut rx) = setup(8);
        assert!(ctrl.control_block(&[2, 3, 4], true, false, 0));
        let cgb = next_msg(&mut rx);
        assert!(cgb.is(MsgType::Cgb));
        assert_eq!(cgb.cic, 2);
        assert_eq!(cgb.params.get("RangeAndStatus.map"), Some("111"));
        // Acknowledge: locks settle, changed flags cleared
        let mut cga = IsupMessage::new(MsgType::Cga, 2);
        cga.params.add("GroupSupervisionTypeIndicator", "maintenance");
        cga.params.add("RangeAndStatus", "3");
        cga.params.add("RangeAndStatus.map", "111");
        ctrl.receive(&wire(&cga), 10).unwrap();
        for c in [2u32, 3, 4] {
            assert_ne!(ctrl.circuits().locked(c, lock::LOCAL_MAINT), 0);
            assert_eq!(ctrl.circuits().locked(c, lock::LOCAL_MAINT_CHG), 0);
        }
    }

    #[test]
    fn test_single_block_uses_blk() {
        let (ctrl, mut rx) = setup(8);
        assert!(ctrl.control_block(&[5], true, false, 0));
        let blk = next_msg(&mut rx);
        assert!(blk.is(MsgType::Blk));
        assert_eq!(blk.cic, 5);
        // BLA clears the pending request
        let bla = IsupMessage::new(MsgType::Bla, 5);
        ctrl.receive(&wire(&bla), 10).unwrap();
        assert_ne!(ctrl.circuits().locked(5, lock::LOCAL_MAINT), 0);
        assert_eq!(ctrl.circuits().locked(5, lock::LOCKING_MAINT), 0);
    }

    #[test]
    fn test_blk_retransmission() {
        let cfg = IsupConfig::default();
        let t12 = cfg.t12_ms;
        let (ctrl, mut rx) = setup_with(8, cfg);
        assert!(ctrl.control_block(&[5], true, false, 0));
        let _blk = next_msg(&mut rx);
        ctrl.timer_tick(t12 + 1);
        let retrans = next_msg(&mut rx);
        assert!(retrans.is(MsgType::Blk));
        assert_eq!(retrans.cic, 5);
    }

    #[test]
    fn test_wrong_state_block_ack_rejected() {
        let (ctrl, mut rx) = setup(8);
        // BLA with no pending BLK: answered with confusion
        let bla = IsupMessage::new(MsgType::Bla, 5);
        ctrl.receive(&wire(&bla), 0).unwrap();
        let cnf = next_msg(&mut rx);
        assert!(cnf.is(MsgType::Cnf));
        assert_eq!(cnf.params.get("CauseIndicators"), Some("wrong-state-message"));
    }

    #[test]
    fn test_cga_with_wrong_map_ignored() {
        let (ctrl, mut rx) = setup(8);
        assert!(ctrl.control_block(&[2, 3], true, false, 0));
        let _cgb = next_msg(&mut rx);
        // Ack claims a circuit we never requested
        let mut cga = IsupMessage::new(MsgType::Cga, 2);
        cga.params.add("GroupSupervisionTypeIndicator", "maintenance");
        cga.params.add("RangeAndStatus", "3");
        cga.params.add("RangeAndStatus.map", "101");
        ctrl.receive(&wire(&cga), 10).unwrap();
        // Still locking: the request remains pending
        assert_ne!(ctrl.circuits().locked(2, lock::LOCKING_MAINT), 0);
    }

    #[test]
    fn test_upt_reply() {
        let (ctrl, mut rx) = setup(4);
        let upt = IsupMessage::new(MsgType::Upt, 1);
        ctrl.receive(&wire(&upt), 0).unwrap();
        let upa = next_msg(&mut rx);
        assert!(upa.is(MsgType::Upa));
    }

    #[test]
    fn test_user_part_probe_retry_until_response() {
        let mut cfg = IsupConfig::default();
        cfg.user_part_test_ms = 10_000;
        let (ctrl, mut rx) = setup_with(4, cfg);
        assert!(!ctrl.user_part_available());
        // Outgoing calls denied while unavailable
        let mut req = ParamList::new();
        req.add("called", "1");
        assert!(ctrl.call(&req, 0).is_err());
        ctrl.timer_tick(1);
        let upt = next_msg(&mut rx);
        assert!(upt.is(MsgType::Upt));
        // No response: retransmitted
        ctrl.timer_tick(10_002);
        assert!(next_msg(&mut rx).is(MsgType::Upt));
        // Any recognized response marks the user part available
        let upa = IsupMessage::new(MsgType::Upa, 1);
        ctrl.receive(&wire(&upa), 10_010).unwrap();
        assert!(ctrl.user_part_available());
    }

    #[test]
    fn test_cqm_gets_cqr() {
        let (ctrl, mut rx) = setup(8);
        ctrl.circuits().maint_lock(2, true, false, false, false);
        let mut cqm = IsupMessage::new(MsgType::Cqm, 1);
        cqm.params.add("RangeAndStatus", "3");
        ctrl.receive(&wire(&cqm), 0).unwrap();
        let cqr = next_msg(&mut rx);
        assert!(cqr.is(MsgType::Cqr));
        let states = crate::types::from_hex(cqr.params.get("CircuitStateIndicator").unwrap()).unwrap();
        assert_eq!(states.len(), 3);
        // Circuit 1 idle, circuit 2 locally maintenance blocked
        assert_eq!(states[0], 0x0c);
        assert_eq!(states[1] & 0x01, 0x01);
    }

    #[test]
    fn test_unknown_message_gets_confusion() {
        let (ctrl, mut rx) = setup(4);
        // Unknown message code 0x7a on a known circuit
        let wire_msg = vec![2u8, 0, 0x7a, 0];
        ctrl.receive(&wire_msg, 0).unwrap();
        let cnf = next_msg(&mut rx);
        assert!(cnf.is(MsgType::Cnf));
        assert_eq!(cnf.params.get("CauseIndicators"), Some("unknown-message"));
        assert_eq!(cnf.params.get("CauseIndicators.diagnostic"), Some("7a"));
    }

    #[test]
    fn test_unknown_message_release_instruction() {
        let (ctrl, mut rx) = setup(4);
        // Unknown message carrying MessageCompatInformation with release:
        // type 0x7a, optional pointer, compat IE (0x38) value 0x82 | 0x80 ext
        let wire_msg = vec![2u8, 0, 0x7a, 1, 0x38, 1, 0x82, 0];
        ctrl.receive(&wire_msg, 0).unwrap();
        let rlc = next_msg(&mut rx);
        assert!(rlc.is(MsgType::Rlc));
        assert_eq!(rlc.params.get("CauseIndicators"), Some("unknown-message"));
    }

    #[test]
    fn test_uec_blocks_circuit() {
        let (ctrl, _rx) = setup(4);
        let uec = IsupMessage::new(MsgType::Uec, 2);
        ctrl.receive(&wire(&uec), 0).unwrap();
        assert_ne!(ctrl.circuits().locked(2, lock::REMOTE_MAINT), 0);
    }

    #[test]
    fn test_hw_alarm_sends_group_block() {
        let (ctrl, mut rx) = setup(8);
        ctrl.hw_alarm(3, true, 0);
        ctrl.timer_tick(IsupConfig::default().lock_check_ms + 1);
        let msg = next_msg(&mut rx);
        // Hardware failures always use the group form
        assert!(msg.is(MsgType::Cgb));
        assert_eq!(msg.params.get("GroupSupervisionTypeIndicator"), Some("hw-failure"));
    }

    #[test]
    fn test_remote_block_skipped_on_reserve_and_cleared_by_iam() {
        let (ctrl, mut rx) = setup(4);
        let blk = IsupMessage::new(MsgType::Blk, 2);
        ctrl.receive(&wire(&blk), 0).unwrap();
        assert!(next_msg(&mut rx).is(MsgType::Bla));
        assert_ne!(ctrl.circuits().locked(2, lock::REMOTE_MAINT), 0);
        // An IAM for the blocked circuit implicitly unblocks it
        let mut iam = IsupMessage::new(MsgType::Iam, 2);
        iam.params.add("CalledPartyNumber", "1");
        ctrl.receive(&wire(&iam), 10).unwrap();
        assert_eq!(ctrl.circuits().locked(2, lock::REMOTE_MAINT), 0);
        let ev = ctrl.get_event(10).unwrap();
        // The lock change surfaces a verify event before the call event
        assert_eq!(ev.kind, CallEventKind::Verify);
        let ev = ctrl.get_event(11).unwrap();
        assert_eq!(ev.kind, CallEventKind::NewCall);
    }
}
