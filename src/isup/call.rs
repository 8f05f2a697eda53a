//! Per-call ISUP state machine
//!
//! One [`IsupCall`] tracks a single call attempt bound to one circuit. The
//! controller owns every call, feeds received messages into its queue and
//! polls [`IsupCall::get_event`]; both directions may emit messages, returned
//! to the controller for transmission.

use super::message::IsupMessage;
use super::MsgType;
use crate::config::IsupConfig;
use crate::types::{ParamList, RoutingLabel, SigTimer};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Call lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    Null,
    Setup,
    Ringing,
    Accepted,
    Answered,
    Releasing,
    Released,
}

impl CallState {
    pub fn name(self) -> &'static str {
        match self {
            CallState::Null => "Null",
            CallState::Setup => "Setup",
            CallState::Ringing => "Ringing",
            CallState::Accepted => "Accepted",
            CallState::Answered => "Answered",
            CallState::Releasing => "Releasing",
            CallState::Released => "Released",
        }
    }
}

/// Application-visible call events; also used to request operations on a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEventKind {
    NewCall,
    Accept,
    Progress,
    Ringing,
    Answer,
    Suspend,
    Resume,
    Info,
    Charge,
    Generic,
    Release,
    /// Controller notification: lock state changed, worth persisting
    Verify,
}

/// An event raised by a call towards the application
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub kind: CallEventKind,
    pub cic: u32,
    pub params: ParamList,
}

impl CallEvent {
    fn new(kind: CallEventKind, cic: u32, params: ParamList) -> Self {
        Self { kind, cic, params }
    }
}

// Parameters copied from a segmentation message into the buffered message
// (Q.763 Table 49, Q.764 2.1.12)
const SGM_COPY_PARAMS: &[&str] = &[
    "AccessTransport",
    "UserToUserInformation",
    "MessageCompatInformation",
    "GenericDigits",
    "GenericNotification",
    "GenericNumber",
];

/// One ISUP call attempt
pub struct IsupCall {
    cic: u32,
    state: CallState,
    outgoing: bool,
    label: RoutingLabel,
    /// Range preference used when the circuit must be replaced
    range: Option<String>,
    reason: Option<String>,
    diagnostic: Option<String>,
    location: Option<String>,
    terminate: bool,
    gracefully: bool,
    circuit_changed: bool,
    replace_counter: u8,
    overlap: bool,
    sam_digits: String,
    sent_sam_digits: usize,
    max_called_digits: usize,
    early_acm: bool,
    iam_msg: Option<IsupMessage>,
    sgm_msg: Option<IsupMessage>,
    rel_msg: Option<IsupMessage>,
    in_queue: VecDeque<IsupMessage>,
    /// Q.764 T5: release-wait
    rel_timer: SigTimer,
    /// Q.764 T7 while in Setup, T1 while Releasing
    iam_timer: SigTimer,
    /// Q.764 T34: segmentation-wait
    sgm_timer: SigTimer,
    /// Q.764 T9: answer-wait, optional
    anm_timer: SigTimer,
    t1_ms: u64,
    t5_ms: u64,
}

impl IsupCall {
    fn base(cic: u32, label: RoutingLabel, outgoing: bool, cfg: &IsupConfig) -> Self {
        Self {
            cic,
            state: CallState::Null,
            outgoing,
            label,
            range: None,
            reason: None,
            diagnostic: None,
            location: None,
            terminate: false,
            gracefully: true,
            circuit_changed: false,
            replace_counter: cfg.max_replaces,
            overlap: false,
            sam_digits: String::new(),
            sent_sam_digits: 0,
            max_called_digits: cfg.max_called_digits,
            early_acm: cfg.early_acm,
            iam_msg: None,
            sgm_msg: None,
            rel_msg: None,
            in_queue: VecDeque::new(),
            rel_timer: SigTimer::new(cfg.t5_ms),
            iam_timer: SigTimer::new(cfg.t7_ms),
            sgm_timer: SigTimer::new(cfg.t34_ms),
            anm_timer: SigTimer::new(cfg.t9_ms),
            t1_ms: cfg.t1_ms,
            t5_ms: cfg.t5_ms,
        }
    }

    /// Create an outgoing call and build its IAM from the request parameters.
    /// Returns the call and the messages to transmit.
    pub fn new_outgoing(
        cic: u32,
        label: RoutingLabel,
        request: &ParamList,
        range: Option<String>,
        cfg: &IsupConfig,
        now_ms: u64,
    ) -> (Self, Vec<IsupMessage>) {
        let mut call = Self::base(cic, label, true, cfg);
        call.range = range;
        let mut iam = IsupMessage::new(MsgType::Iam, cic);
        copy_param_iam_outgoing(&mut iam.params, request, cfg);
        // A called number longer than the IAM limit continues in SAM messages
        let called = iam.params.get_or("CalledPartyNumber", "");
        if called.len() > call.max_called_digits {
            call.sam_digits = called[call.max_called_digits..].to_string();
            iam.params.set("CalledPartyNumber", &called[..call.max_called_digits]);
            call.overlap = true;
        } else {
            // A number without the ST signal may still be continued in SAM
            call.overlap = !called.ends_with('.');
        }
        call.iam_msg = Some(iam);
        let out = call.transmit_iam(now_ms);
        (call, out)
    }

    /// Create a call for a received initiating message
    pub fn new_incoming(cic: u32, label: RoutingLabel, cfg: &IsupConfig) -> Self {
        Self::base(cic, label, false, cfg)
    }

    pub fn cic(&self) -> u32 {
        self.cic
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn label(&self) -> RoutingLabel {
        self.label
    }

    pub fn range(&self) -> Option<&str> {
        self.range.as_deref()
    }

    /// Call has not progressed past setup (Q.764 2.9.5.1)
    pub fn early_state(&self) -> bool {
        self.state <= CallState::Setup
    }

    /// Queue a received message for processing in `get_event`
    pub fn enqueue(&mut self, msg: IsupMessage) {
        self.in_queue.push_back(msg);
    }

    /// Request termination. Graceful termination sends REL, otherwise the call
    /// is completed locally with RLC.
    pub fn set_terminate(&mut self, gracefully: bool, reason: &str, diagnostic: Option<&str>, location: Option<&str>) {
        if self.state == CallState::Released {
            return;
        }
        self.set_reason(Some(reason), None, diagnostic, location);
        self.terminate = true;
        self.gracefully = gracefully;
    }

    /// Stop waiting for a segmentation continuation
    pub fn stop_wait_segment(&mut self, discard: bool) {
        self.sgm_timer.stop();
        if discard {
            self.sgm_msg = None;
        }
    }

    /// True while the circuit may still be swapped: outgoing call, no response
    /// seen, replacement budget not exhausted
    pub fn can_replace_circuit(&mut self) -> bool {
        if !self.outgoing || self.state > CallState::Setup || self.replace_counter == 0 {
            return false;
        }
        self.replace_counter -= 1;
        true
    }

    /// Swap the reserved circuit and retransmit the IAM on the new one
    pub fn replace_circuit(&mut self, new_cic: u32, now_ms: u64) -> Vec<IsupMessage> {
        self.in_queue.clear();
        let old = self.cic;
        self.cic = new_cic;
        if let Some(iam) = &mut self.iam_msg {
            iam.cic = new_cic;
        }
        self.circuit_changed = true;
        info!(old, new = new_cic, "call circuit replaced");
        self.transmit_iam(now_ms)
    }

    /// Mark the call as failed to replace its circuit: terminate with congestion
    pub fn replace_failed(&mut self) {
        self.iam_timer.stop();
        self.set_terminate(false, "congestion", None, None);
    }

    fn set_reason(
        &mut self,
        reason: Option<&str>,
        msg: Option<&IsupMessage>,
        diagnostic: Option<&str>,
        location: Option<&str>,
    ) {
        if self.reason.is_some() {
            return;
        }
        if let Some(r) = reason {
            self.reason = Some(r.to_string());
            self.diagnostic = diagnostic.map(str::to_string);
            self.location = location.map(str::to_string);
        } else if let Some(m) = msg {
            self.reason = m
                .params
                .get("CauseIndicators")
                .or_else(|| m.params.get("reason"))
                .map(str::to_string);
            self.diagnostic = m.params.get("CauseIndicators.diagnostic").map(str::to_string);
            self.location = m.params.get("CauseIndicators.location").map(str::to_string);
        }
    }

    /// Accept send/receive of a message type in the current state and direction
    pub fn valid_msg_state(&self, send: bool, msg: MsgType, has_bkw_ind: bool) -> bool {
        let ok = match msg {
            MsgType::Iam => self.state == CallState::Null && send == self.outgoing,
            MsgType::Acm | MsgType::Exm => self.state == CallState::Setup && send != self.outgoing,
            MsgType::Cpr => {
                let floor = if has_bkw_ind { CallState::Setup } else { CallState::Accepted };
                self.state >= floor && self.state < CallState::Releasing
            }
            MsgType::Con => self.state == CallState::Setup && send != self.outgoing,
            MsgType::Anm => {
                let floor = if has_bkw_ind { CallState::Setup } else { CallState::Accepted };
                self.state >= floor && self.state < CallState::Answered && send != self.outgoing
            }
            MsgType::Sam => self.state == CallState::Setup && self.overlap && send == self.outgoing,
            MsgType::Rel => {
                if send && self.state >= CallState::Releasing {
                    false
                } else {
                    self.state != CallState::Null && self.state != CallState::Released
                }
            }
            MsgType::Rlc | MsgType::Crg => {
                self.state != CallState::Null && self.state != CallState::Released
            }
            MsgType::Sus | MsgType::Res => self.state == CallState::Answered,
            MsgType::Sgm | MsgType::Apm => true,
            _ => {
                debug!(msg = msg.name(), state = self.state.name(), "unhandled message state check");
                return false;
            }
        };
        if !ok {
            info!(
                cic = self.cic,
                msg = msg.name(),
                state = self.state.name(),
                send,
                "message not valid in this state"
            );
        }
        ok
    }

    /// Pull the next event from this call; also runs the call's timers.
    /// Returns the event (if any) and messages to transmit.
    pub fn get_event(&mut self, now_ms: u64) -> (Option<CallEvent>, Vec<IsupMessage>) {
        let mut out = Vec::new();
        if self.state == CallState::Released {
            return (None, out);
        }
        if self.terminate {
            self.terminate = false;
            let ev = if self.state > CallState::Null && self.state < CallState::Releasing {
                if self.gracefully {
                    self.release(None, now_ms, &mut out)
                } else {
                    self.release_complete(None, None, false, &mut out)
                }
            } else {
                self.gracefully = false;
                self.release_complete(None, None, false, &mut out)
            };
            return (ev, out);
        }
        // Waiting for a segmentation continuation: consume only SGM or time out
        if self.sgm_msg.is_some() {
            let timeout = self.sgm_timer.timed_out(now_ms);
            let is_sgm = self.in_queue.front().map(|m| m.is(MsgType::Sgm)).unwrap_or(false);
            if !is_sgm && !timeout && self.sgm_timer.started() {
                return (None, out);
            }
            let sgm = if is_sgm { self.in_queue.pop_front() } else { None };
            let ev = self.process_segmented(sgm, timeout, now_ms);
            return (ev, out);
        }
        if let Some(msg) = self.in_queue.pop_front() {
            if let Some(t) = msg.msg_type {
                let has_bkw = msg.params.get("BackwardCallIndicators").is_some();
                if self.valid_msg_state(false, t, has_bkw) {
                    let ev = self.process_message(t, msg, now_ms, &mut out);
                    if ev.is_some() || !out.is_empty() {
                        return (ev, out);
                    }
                }
            }
        }
        // No events: check the timers
        let ev = self.check_timers(now_ms, &mut out);
        if self.state > CallState::Setup {
            self.overlap = false;
        }
        (ev, out)
    }

    fn process_message(
        &mut self,
        t: MsgType,
        msg: IsupMessage,
        now_ms: u64,
        out: &mut Vec<IsupMessage>,
    ) -> Option<CallEvent> {
        match t {
            MsgType::Iam | MsgType::Acm | MsgType::Exm | MsgType::Cpr | MsgType::Anm
            | MsgType::Con | MsgType::Crg => {
                let sgm_param = if t == MsgType::Iam {
                    "OptionalForwardCallIndicators"
                } else {
                    "OptionalBackwardCallIndicators"
                };
                let segmented = msg.params.has_flag(sgm_param, "segmentation");
                self.sgm_msg = Some(msg);
                if segmented {
                    // More optional parameters follow in a SGM message
                    self.sgm_timer.start(now_ms);
                    return None;
                }
                self.process_segmented(None, false, now_ms)
            }
            MsgType::Sam => {
                let mut params = msg.params;
                let number = params.get_or("SubsequentNumber", "");
                self.overlap = !number.ends_with('.');
                params.add("tone", &number);
                params.add("dialing", "true");
                Some(CallEvent::new(CallEventKind::Info, self.cic, params))
            }
            MsgType::Rlc => {
                self.gracefully = false;
                if self.state < CallState::Releasing {
                    self.set_reason(None, Some(&msg), None, None);
                    self.release(Some(msg), now_ms, out)
                } else {
                    self.rel_timer.stop();
                    self.release_complete(Some(msg), None, false, out)
                }
            }
            MsgType::Rel => {
                if self.state < CallState::Releasing {
                    self.rel_timer.stop();
                    self.release_complete(Some(msg), None, false, out)
                } else {
                    out.push(rlc_message(self.cic, None, None, None));
                    None
                }
            }
            MsgType::Sgm => {
                debug!(cic = self.cic, "received late SGM");
                None
            }
            MsgType::Sus => Some(CallEvent::new(CallEventKind::Suspend, self.cic, msg.params)),
            MsgType::Res => Some(CallEvent::new(CallEventKind::Resume, self.cic, msg.params)),
            MsgType::Apm => Some(CallEvent::new(CallEventKind::Generic, self.cic, msg.params)),
            _ => {
                debug!(cic = self.cic, msg = %msg.name(), "unhandled message in get_event");
                None
            }
        }
    }

    fn check_timers(&mut self, now_ms: u64, out: &mut Vec<IsupMessage>) -> Option<CallEvent> {
        match self.state {
            CallState::Setup => {
                if self.iam_timer.timed_out(now_ms) {
                    self.iam_timer.stop();
                    warn!(cic = self.cic, "IAM acknowledgement timed out");
                    self.set_reason(Some("timeout"), None, None, None);
                    return self.release(None, now_ms, out);
                }
                None
            }
            CallState::Releasing => {
                if self.rel_timer.timed_out(now_ms) {
                    warn!(cic = self.cic, "release timed out, forcing release complete");
                    return self.release_complete(None, Some("noresponse"), true, out);
                }
                if self.iam_timer.timed_out(now_ms) {
                    // T1: retransmit REL
                    self.iam_timer.stop();
                    self.iam_timer.start(now_ms);
                    if let Some(rel) = &self.rel_msg {
                        out.push(rel.clone());
                    }
                }
                None
            }
            s if self.outgoing
                && self.anm_timer.started()
                && s >= CallState::Accepted
                && s < CallState::Answered
                && self.anm_timer.timed_out(now_ms) =>
            {
                self.anm_timer.stop();
                warn!(cic = self.cic, "answer wait timed out");
                self.set_reason(Some("noresponse"), None, None, None);
                self.release(None, now_ms, out)
            }
            _ => None,
        }
    }

    /// Process the buffered message, merging any segmentation continuation
    fn process_segmented(
        &mut self,
        sgm: Option<IsupMessage>,
        timeout: bool,
        now_ms: u64,
    ) -> Option<CallEvent> {
        let Some(mut msg) = self.sgm_msg.take() else { return None };
        if let Some(sgm) = sgm {
            if sgm.is(MsgType::Sgm) {
                for name in SGM_COPY_PARAMS {
                    msg.params.copy_subtree(&sgm.params, name);
                }
            }
        } else if timeout {
            warn!(cic = self.cic, msg = %msg.name(), "segment wait timed out, processing without continuation");
        }
        self.sgm_timer.stop();
        self.iam_timer.stop();
        let t = msg.msg_type?;
        match t {
            MsgType::Iam => {
                self.state = CallState::Setup;
                copy_param_iam_incoming(&mut msg.params, self.label.sls);
                self.overlap = !msg.params.get_or("CalledPartyNumber", "").ends_with('.');
                msg.params.set("overlapped", if self.overlap { "true" } else { "false" });
                if self.circuit_changed {
                    msg.params.set("circuit-change", "true");
                    self.circuit_changed = false;
                }
                Some(CallEvent::new(CallEventKind::NewCall, self.cic, msg.params))
            }
            MsgType::Acm | MsgType::Exm => {
                self.state = CallState::Accepted;
                if self.anm_timer.interval() != 0 {
                    self.anm_timer.start(now_ms);
                }
                let inband = msg.params.has_flag("OptionalBackwardCallIndicators", "inband");
                msg.params.set("earlymedia", if inband { "true" } else { "false" });
                if self.early_acm {
                    // Called party known free reports ringing, may-become-free progress
                    let ring = msg.params.has_flag("BackwardCallIndicators", "called-free");
                    let conn = msg.params.has_flag("BackwardCallIndicators", "called-conn");
                    if ring || conn || inband {
                        let kind = if ring { CallEventKind::Ringing } else { CallEventKind::Progress };
                        return Some(CallEvent::new(kind, self.cic, msg.params));
                    }
                }
                Some(CallEvent::new(CallEventKind::Accept, self.cic, msg.params))
            }
            MsgType::Cpr => {
                self.state = CallState::Ringing;
                let inband = msg.params.has_flag("OptionalBackwardCallIndicators", "inband")
                    || msg.params.has_flag("EventInformation", "inband");
                msg.params.set("earlymedia", if inband { "true" } else { "false" });
                let kind = if msg.params.has_flag("EventInformation", "ringing") {
                    CallEventKind::Ringing
                } else {
                    CallEventKind::Progress
                };
                Some(CallEvent::new(kind, self.cic, msg.params))
            }
            MsgType::Anm | MsgType::Con => {
                self.state = CallState::Answered;
                self.anm_timer.stop();
                Some(CallEvent::new(CallEventKind::Answer, self.cic, msg.params))
            }
            MsgType::Crg => Some(CallEvent::new(CallEventKind::Charge, self.cic, msg.params)),
            _ => {
                debug!(cic = self.cic, msg = %msg.name(), "unexpected buffered message");
                None
            }
        }
    }

    /// Application request entry point. Validates the request against the
    /// current state, transmits the mapped message and advances the state.
    pub fn send_event(
        &mut self,
        kind: CallEventKind,
        params: &ParamList,
        now_ms: u64,
    ) -> (bool, Vec<IsupMessage>) {
        let mut out = Vec::new();
        if self.terminate || self.state == CallState::Released {
            return (false, out);
        }
        let ok = match kind {
            CallEventKind::Progress | CallEventKind::Ringing => {
                if !self.valid_msg_state(true, MsgType::Cpr, false) {
                    false
                } else {
                    let mut m = IsupMessage::new(MsgType::Cpr, self.cic);
                    m.params.add(
                        "EventInformation",
                        if kind == CallEventKind::Ringing { "ringing" } else { "progress" },
                    );
                    m.params.copy_wire_params(params);
                    if params.get_bool("earlymedia", false) && !self.outgoing {
                        m.params.append_flag("OptionalBackwardCallIndicators", "inband");
                    }
                    self.state = CallState::Ringing;
                    out.push(m);
                    true
                }
            }
            CallEventKind::Accept => {
                if !self.valid_msg_state(true, MsgType::Acm, false) {
                    false
                } else {
                    let mut m = IsupMessage::new(MsgType::Acm, self.cic);
                    m.params.copy_wire_params(params);
                    if params.get_bool("earlymedia", false) && !self.outgoing {
                        m.params.append_flag("OptionalBackwardCallIndicators", "inband");
                    }
                    self.state = CallState::Accepted;
                    out.push(m);
                    true
                }
            }
            CallEventKind::Answer => {
                if !self.valid_msg_state(true, MsgType::Anm, false) {
                    false
                } else {
                    let mut m = IsupMessage::new(MsgType::Anm, self.cic);
                    m.params.copy_wire_params(params);
                    self.state = CallState::Answered;
                    out.push(m);
                    true
                }
            }
            CallEventKind::Release => {
                if !self.valid_msg_state(true, MsgType::Rel, false) {
                    false
                } else {
                    if self.reason.is_none() {
                        self.reason = params
                            .get("reason")
                            .or_else(|| params.get("CauseIndicators"))
                            .map(str::to_string)
                            .or(Some("normal-clearing".to_string()));
                    }
                    self.start_release(Some(params), now_ms, &mut out);
                    true
                }
            }
            CallEventKind::Info => {
                if !self.valid_msg_state(true, MsgType::Sam, false) {
                    false
                } else {
                    let tone = params.get_or("tone", "");
                    self.transmit_sam(&tone, &mut out);
                    true
                }
            }
            CallEventKind::Suspend | CallEventKind::Resume => {
                let t = if kind == CallEventKind::Suspend { MsgType::Sus } else { MsgType::Res };
                if !self.valid_msg_state(true, t, false) {
                    false
                } else {
                    let mut m = IsupMessage::new(t, self.cic);
                    m.params.copy_wire_params(params);
                    out.push(m);
                    true
                }
            }
            CallEventKind::Charge => {
                if !self.valid_msg_state(true, MsgType::Crg, false) {
                    false
                } else {
                    let mut m = IsupMessage::new(MsgType::Crg, self.cic);
                    m.params.copy_wire_params(params);
                    out.push(m);
                    true
                }
            }
            CallEventKind::Generic => {
                if !self.valid_msg_state(true, MsgType::Apm, false) {
                    false
                } else {
                    let mut m = IsupMessage::new(MsgType::Apm, self.cic);
                    m.params.copy_wire_params(params);
                    out.push(m);
                    true
                }
            }
            CallEventKind::NewCall | CallEventKind::Verify => {
                warn!(cic = self.cic, kind = ?kind, "not a call request");
                false
            }
        };
        if self.state > CallState::Setup {
            self.overlap = false;
        }
        (ok, out)
    }

    /// (Re)transmit the retained IAM, starting the acknowledgement timer
    fn transmit_iam(&mut self, now_ms: u64) -> Vec<IsupMessage> {
        let mut out = Vec::new();
        if !self.iam_timer.started() {
            self.iam_timer.start(now_ms);
        }
        let Some(iam) = &self.iam_msg else { return out };
        self.state = CallState::Setup;
        self.sent_sam_digits = 0;
        out.push(iam.clone());
        if self.overlap {
            let digits = self.sam_digits.clone();
            self.sam_digits.clear();
            self.transmit_sam(&digits, &mut out);
        }
        out
    }

    /// Send pending overlap digits in SAM messages
    fn transmit_sam(&mut self, extra: &str, out: &mut Vec<IsupMessage>) {
        if !self.overlap {
            return;
        }
        self.sam_digits.push_str(extra);
        while self.sam_digits.len() > self.sent_sam_digits {
            let mut send = self.sam_digits.len() - self.sent_sam_digits;
            if send > self.max_called_digits {
                send = self.max_called_digits;
            }
            let number =
                self.sam_digits[self.sent_sam_digits..self.sent_sam_digits + send].to_string();
            // The ST signal marks the number complete and ends overlap sending
            let complete = number.ends_with('.');
            let mut m = IsupMessage::new(MsgType::Sam, self.cic);
            m.params.add("SubsequentNumber", &number);
            out.push(m);
            self.sent_sam_digits += send;
            if complete {
                self.overlap = false;
                break;
            }
        }
    }

    /// Enter Releasing: send REL and start T1/T5
    fn start_release(&mut self, params: Option<&ParamList>, now_ms: u64, out: &mut Vec<IsupMessage>) {
        self.iam_timer.stop();
        self.stop_wait_segment(true);
        self.iam_timer.set_interval(self.t1_ms);
        self.rel_timer.set_interval(self.t5_ms);
        self.iam_timer.start(now_ms);
        self.rel_timer.start(now_ms);
        self.state = CallState::Releasing;
        if self.rel_msg.is_none() {
            let mut m = IsupMessage::new(MsgType::Rel, self.cic);
            m.params.add(
                "CauseIndicators",
                self.reason.as_deref().unwrap_or("normal-clearing"),
            );
            if let Some(d) = &self.diagnostic {
                m.params.add_non_empty("CauseIndicators.diagnostic", d.clone());
            }
            if let Some(l) = &self.location {
                m.params.add_non_empty("CauseIndicators.location", l.clone());
            }
            if let Some(p) = params {
                m.params.copy_wire_params(p);
            }
            self.rel_msg = Some(m);
        }
        if let Some(rel) = &self.rel_msg {
            out.push(rel.clone());
        }
    }

    /// Send REL (remote cleared or local failure) and raise the Release event
    fn release(
        &mut self,
        msg: Option<IsupMessage>,
        now_ms: u64,
        out: &mut Vec<IsupMessage>,
    ) -> Option<CallEvent> {
        if let Some(m) = &msg {
            self.set_reason(None, Some(m), None, None);
        }
        if self.reason.is_none() {
            self.reason = Some("interworking".to_string());
        }
        if self.state >= CallState::Releasing {
            self.terminate = true;
            return None;
        }
        self.start_release(None, now_ms, out);
        let mut params = msg.map(|m| m.params).unwrap_or_default();
        params.set("reason", self.reason.as_deref().unwrap_or(""));
        Some(CallEvent::new(CallEventKind::Release, self.cic, params))
    }

    /// Terminal release: optionally send RLC, move to Released, raise Release
    fn release_complete(
        &mut self,
        msg: Option<IsupMessage>,
        reason: Option<&str>,
        timeout: bool,
        out: &mut Vec<IsupMessage>,
    ) -> Option<CallEvent> {
        if timeout {
            self.gracefully = false;
        }
        self.iam_timer.stop();
        self.rel_timer.stop();
        if let Some(r) = reason {
            self.set_reason(Some(r), None, None, None);
        } else if let Some(m) = &msg {
            self.set_reason(None, Some(m), None, None);
        }
        self.stop_wait_segment(true);
        if self.state == CallState::Released {
            return None;
        }
        if self.gracefully {
            out.push(rlc_message(self.cic, None, None, None));
        }
        self.state = CallState::Released;
        let mut params = msg.map(|m| m.params).unwrap_or_default();
        params.set("reason", self.reason.as_deref().unwrap_or(""));
        info!(cic = self.cic, reason = self.reason.as_deref().unwrap_or(""), "call released");
        Some(CallEvent::new(CallEventKind::Release, self.cic, params))
    }
}

/// Build an RLC, optionally carrying a release cause
pub fn rlc_message(cic: u32, reason: Option<&str>, diagnostic: Option<&str>, location: Option<&str>) -> IsupMessage {
    let mut m = IsupMessage::new(MsgType::Rlc, cic);
    if let Some(r) = reason {
        m.params.add("CauseIndicators", r);
        if let Some(l) = location {
            m.params.add_non_empty("CauseIndicators.location", l);
        }
        if let Some(d) = diagnostic {
            m.params.add_non_empty("CauseIndicators.diagnostic", d);
        }
    }
    m
}

/// Build a CNF (confusion) response
pub fn cnf_message(cic: u32, reason: &str, diagnostic: Option<&str>, location: &str) -> IsupMessage {
    let mut m = IsupMessage::new(MsgType::Cnf, cic);
    m.params.add("CauseIndicators", reason);
    m.params.add_non_empty("CauseIndicators.location", location);
    if let Some(d) = diagnostic {
        m.params.add_non_empty("CauseIndicators.diagnostic", d);
    }
    m
}

// Map an outgoing call request into IAM wire parameters
fn copy_param_iam_outgoing(dest: &mut ParamList, src: &ParamList, cfg: &IsupConfig) {
    dest.copy_wire_params(src);
    let set_default = |dest: &mut ParamList, wire: &str, req: &str, def: &str| {
        let v = src.get(req).map(str::to_string).unwrap_or_else(|| def.to_string());
        if dest.get(wire).is_none() || src.get(req).is_some() {
            dest.set(wire, v);
        }
    };
    set_default(dest, "CalledPartyNumber", "called", "");
    set_default(dest, "CalledPartyNumber.inn", "inn", if cfg.inn { "true" } else { "false" });
    set_default(dest, "CalledPartyNumber.nature", "callednumtype", &cfg.number_type);
    set_default(dest, "CalledPartyNumber.plan", "callednumplan", &cfg.number_plan);
    set_default(dest, "CallingPartyCategory", "callercategory", &cfg.caller_category);
    set_default(dest, "CallingPartyNumber", "caller", "");
    set_default(dest, "CallingPartyNumber.nature", "callernumtype", &cfg.number_type);
    set_default(dest, "CallingPartyNumber.plan", "callernumplan", &cfg.number_plan);
    set_default(dest, "CallingPartyNumber.restrict", "callerpres", &cfg.presentation);
    set_default(dest, "CallingPartyNumber.screened", "callerscreening", &cfg.screening);
    set_default(dest, "CallingPartyNumber.complete", "complete", "true");
    let format = src.get("format").unwrap_or(&cfg.format);
    dest.set("UserServiceInformation", format);
}

// Expose IAM wire parameters as call parameters for the application
fn copy_param_iam_incoming(params: &mut ParamList, sls: u8) {
    let copy = |params: &mut ParamList, dst: &str, src: &str| {
        if let Some(v) = params.get(src).map(str::to_string) {
            params.set(dst, v);
        }
    };
    copy(params, "format", "UserServiceInformation");
    copy(params, "caller", "CallingPartyNumber");
    copy(params, "callernumtype", "CallingPartyNumber.nature");
    copy(params, "callernumplan", "CallingPartyNumber.plan");
    copy(params, "callerpres", "CallingPartyNumber.restrict");
    copy(params, "callerscreening", "CallingPartyNumber.screened");
    copy(params, "called", "CalledPartyNumber");
    copy(params, "callednumtype", "CalledPartyNumber.nature");
    copy(params, "callednumplan", "CalledPartyNumber.plan");
    copy(params, "inn", "CalledPartyNumber.inn");
    if sls != 0xff {
        params.set("sls", sls.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PointCode, ProtocolVariant};

    fn cfg() -> IsupConfig {
        IsupConfig::default().validated()
    }

    fn label() -> RoutingLabel {
        RoutingLabel::new(
            ProtocolVariant::Itu,
            PointCode::new(1, 1, 2),
            PointCode::new(1, 1, 1),
            0,
        )
    }

    fn outgoing_call(cic: u32) -> (IsupCall, Vec<IsupMessage>) {
        let mut req = ParamList::new();
        req.add("called", "123456");
        req.add("caller", "777");
        IsupCall::new_outgoing(cic, label(), &req, None, &cfg(), 0)
    }

    fn msg(t: MsgType, cic: u32) -> IsupMessage {
        IsupMessage::new(t, cic)
    }

    #[test]
    fn test_outgoing_call_lifecycle() {
        let (mut call, out) = outgoing_call(7);
        assert_eq!(out.len(), 1);
        assert!(out[0].is(MsgType::Iam));
        assert_eq!(out[0].params.get("CalledPartyNumber"), Some("123456"));
        assert_eq!(call.state(), CallState::Setup);

        // ACM: Accept event
        call.enqueue(msg(MsgType::Acm, 7));
        let (ev, out) = call.get_event(100);
        assert!(out.is_empty());
        assert_eq!(ev.unwrap().kind, CallEventKind::Accept);
        assert_eq!(call.state(), CallState::Accepted);

        // ANM: Answer event
        call.enqueue(msg(MsgType::Anm, 7));
        let (ev, _) = call.get_event(200);
        assert_eq!(ev.unwrap().kind, CallEventKind::Answer);
        assert_eq!(call.state(), CallState::Answered);

        // Local release sends REL
        let mut rel = ParamList::new();
        rel.add("reason", "normal-clearing");
        let (ok, out) = call.send_event(CallEventKind::Release, &rel, 300);
        assert!(ok);
        assert!(out[0].is(MsgType::Rel));
        assert_eq!(out[0].params.get("CauseIndicators"), Some("normal-clearing"));
        assert_eq!(call.state(), CallState::Releasing);

        // RLC completes the release
        call.enqueue(msg(MsgType::Rlc, 7));
        let (ev, out) = call.get_event(400);
        assert!(out.is_empty());
        assert_eq!(ev.unwrap().kind, CallEventKind::Release);
        assert_eq!(call.state(), CallState::Released);
    }

    #[test]
    fn test_early_acm_ringing() {
        let (mut call, _) = outgoing_call(3);
        let mut acm = msg(MsgType::Acm, 3);
        acm.params.add("BackwardCallIndicators", "called-free");
        call.enqueue(acm);
        let (ev, _) = call.get_event(10);
        assert_eq!(ev.unwrap().kind, CallEventKind::Ringing);
        assert_eq!(call.state(), CallState::Accepted);
    }

    #[test]
    fn test_incoming_iam_new_call() {
        let mut call = IsupCall::new_incoming(9, label(), &cfg());
        let mut iam = msg(MsgType::Iam, 9);
        iam.params.add("CalledPartyNumber", "555");
        iam.params.add("CallingPartyNumber", "666");
        call.enqueue(iam);
        let (ev, _) = call.get_event(0);
        let ev = ev.unwrap();
        assert_eq!(ev.kind, CallEventKind::NewCall);
        assert_eq!(ev.params.get("called"), Some("555"));
        assert_eq!(ev.params.get("caller"), Some("666"));
        assert_eq!(call.state(), CallState::Setup);

        // Answer from our side
        let (ok, out) = call.send_event(CallEventKind::Accept, &ParamList::new(), 10);
        assert!(ok);
        assert!(out[0].is(MsgType::Acm));
        let (ok, out) = call.send_event(CallEventKind::Answer, &ParamList::new(), 20);
        assert!(ok);
        assert!(out[0].is(MsgType::Anm));
        assert_eq!(call.state(), CallState::Answered);
    }

    #[test]
    fn test_send_iam_only_by_initiator() {
        let mut call = IsupCall::new_incoming(9, label(), &cfg());
        // Incoming call may not send ANM before the IAM arrived
        let (ok, _) = call.send_event(CallEventKind::Answer, &ParamList::new(), 0);
        assert!(!ok);
        // ANM is never valid from the initiating side
        let (mut call, _) = outgoing_call(4);
        call.enqueue(msg(MsgType::Acm, 4));
        let _ = call.get_event(0);
        let (ok, _) = call.send_event(CallEventKind::Answer, &ParamList::new(), 1);
        assert!(!ok);
    }

    #[test]
    fn test_iam_timeout_releases() {
        let (mut call, _) = outgoing_call(5);
        let t7 = cfg().t7_ms;
        let (ev, out) = call.get_event(t7 + 1);
        let ev = ev.unwrap();
        assert_eq!(ev.kind, CallEventKind::Release);
        assert_eq!(ev.params.get("reason"), Some("timeout"));
        assert!(out.iter().any(|m| m.is(MsgType::Rel)));
        assert_eq!(call.state(), CallState::Releasing);
    }

    #[test]
    fn test_rel_retransmission_and_t5() {
        let (mut call, _) = outgoing_call(5);
        let (_, _) = call.send_event(CallEventKind::Release, &ParamList::new(), 1_000);
        // T1 fires: REL retransmitted
        let t1 = cfg().t1_ms;
        let (ev, out) = call.get_event(1_000 + t1 + 1);
        assert!(ev.is_none());
        assert!(out.iter().any(|m| m.is(MsgType::Rel)));
        // T5 fires: forced local completion, not graceful
        let t5 = cfg().t5_ms;
        let (ev, out) = call.get_event(1_000 + t5 + 1);
        assert_eq!(ev.unwrap().kind, CallEventKind::Release);
        assert!(out.is_empty());
        assert_eq!(call.state(), CallState::Released);
    }

    #[test]
    fn test_unexpected_rel_answered_with_rlc() {
        let mut call = IsupCall::new_incoming(2, label(), &cfg());
        let mut iam = msg(MsgType::Iam, 2);
        iam.params.add("CalledPartyNumber", "1");
        call.enqueue(iam);
        let _ = call.get_event(0);
        // Remote releases before we answered
        let mut rel = msg(MsgType::Rel, 2);
        rel.params.add("CauseIndicators", "busy");
        call.enqueue(rel);
        let (ev, out) = call.get_event(10);
        let ev = ev.unwrap();
        assert_eq!(ev.kind, CallEventKind::Release);
        assert_eq!(ev.params.get("reason"), Some("busy"));
        // Release complete acknowledged with RLC
        assert!(out.iter().any(|m| m.is(MsgType::Rlc)));
        assert_eq!(call.state(), CallState::Released);
    }

    #[test]
    fn test_segmentation_wait_and_merge() {
        let (mut call, _) = outgoing_call(11);
        let mut acm = msg(MsgType::Acm, 11);
        acm.params.add("OptionalBackwardCallIndicators", "segmentation");
        call.enqueue(acm);
        // Buffered: no event until the continuation arrives
        let (ev, _) = call.get_event(100);
        assert!(ev.is_none());
        let mut sgm = msg(MsgType::Sgm, 11);
        sgm.params.add("UserToUserInformation", "01 02");
        call.enqueue(sgm);
        let (ev, _) = call.get_event(200);
        let ev = ev.unwrap();
        assert_eq!(ev.kind, CallEventKind::Accept);
        assert_eq!(ev.params.get("UserToUserInformation"), Some("01 02"));
    }

    #[test]
    fn test_segmentation_timeout_processes_buffered() {
        let (mut call, _) = outgoing_call(11);
        let mut acm = msg(MsgType::Acm, 11);
        acm.params.add("OptionalBackwardCallIndicators", "segmentation");
        call.enqueue(acm);
        let (ev, _) = call.get_event(100);
        assert!(ev.is_none());
        // T34 expires: the buffered ACM is processed without its continuation
        let t34 = cfg().t34_ms;
        let (ev, _) = call.get_event(100 + t34 + 1);
        assert_eq!(ev.unwrap().kind, CallEventKind::Accept);
    }

    #[test]
    fn test_overlap_sam_sending() {
        let mut req = ParamList::new();
        // 20 digits with a 16 digit IAM limit
        req.add("called", "12345678901234567890");
        let (call, out) = IsupCall::new_outgoing(8, label(), &req, None, &cfg(), 0);
        assert!(out[0].is(MsgType::Iam));
        assert_eq!(out[0].params.get("CalledPartyNumber"), Some("1234567890123456"));
        let sam: Vec<_> = out.iter().filter(|m| m.is(MsgType::Sam)).collect();
        assert_eq!(sam.len(), 1);
        assert_eq!(sam[0].params.get("SubsequentNumber"), Some("7890"));
        assert_eq!(call.state(), CallState::Setup);
    }

    #[test]
    fn test_circuit_replacement_retransmits_iam() {
        let (mut call, _) = outgoing_call(6);
        assert!(call.can_replace_circuit());
        let out = call.replace_circuit(12, 50);
        assert!(out[0].is(MsgType::Iam));
        assert_eq!(out[0].cic, 12);
        assert_eq!(call.cic(), 12);
    }

    #[test]
    fn test_replace_counter_bounded() {
        let (mut call, _) = outgoing_call(6);
        for _ in 0..3 {
            assert!(call.can_replace_circuit());
        }
        assert!(!call.can_replace_circuit());
    }

    #[test]
    fn test_terminate_not_graceful() {
        let (mut call, _) = outgoing_call(6);
        call.set_terminate(false, "temporary-failure", None, None);
        let (ev, out) = call.get_event(10);
        let ev = ev.unwrap();
        assert_eq!(ev.kind, CallEventKind::Release);
        assert_eq!(ev.params.get("reason"), Some("temporary-failure"));
        assert!(out.is_empty());
        assert_eq!(call.state(), CallState::Released);
    }
}
