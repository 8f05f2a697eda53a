//! IAX2 engine: transaction table, call number allocation and trunking
//!
//! The engine owns every transaction, keyed by local call number with a
//! remote (call number, address) index for full frames and a per-destination
//! meta trunk frame for batched media. Raw datagrams come in through
//! [`IaxEngine::add_frame`]; outgoing datagrams leave through the transmit
//! sink handed to the constructor.

use super::frame::{self, MetaTrunkFrame, MiniFrame, ParsedFrame};
use super::transaction::{IaxEvent, IaxTransaction, MediaOut, OutgoingParams, TransType};
use super::{ctl, FrameKind, MAX_CALL_NO, MIN_CALL_NO};
use crate::config::IaxConfig;
use crate::errors::IaxError;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

struct CallNos {
    used: HashSet<u16>,
    next: u16,
}

/// The IAX2 engine
pub struct IaxEngine {
    cfg: IaxConfig,
    transactions: DashMap<u16, IaxTransaction>,
    by_remote: DashMap<(u16, SocketAddr), u16>,
    /// Outgoing transactions whose remote call number is still unknown
    incomplete: Mutex<Vec<u16>>,
    call_nos: Mutex<CallNos>,
    trunks: Mutex<HashMap<SocketAddr, MetaTrunkFrame>>,
    events: Mutex<VecDeque<IaxEvent>>,
    tx: UnboundedSender<(Vec<u8>, SocketAddr)>,
    started: Instant,
}

impl IaxEngine {
    pub fn new(cfg: IaxConfig, tx: UnboundedSender<(Vec<u8>, SocketAddr)>) -> Self {
        let cfg = cfg.validated();
        let start_call = MIN_CALL_NO + (rand::random::<u16>() % (MAX_CALL_NO - MIN_CALL_NO));
        info!(
            port = cfg.port,
            retrans_count = cfg.retrans_count,
            retrans_interval = cfg.retrans_interval_ms,
            "IAX engine created"
        );
        Self {
            cfg,
            transactions: DashMap::new(),
            by_remote: DashMap::new(),
            incomplete: Mutex::new(Vec::new()),
            call_nos: Mutex::new(CallNos { used: HashSet::new(), next: start_call }),
            trunks: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            tx,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &IaxConfig {
        &self.cfg
    }

    /// Monotonic engine time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    fn generate_call_no(&self) -> Result<u16, IaxError> {
        let mut nos = self.call_nos.lock().unwrap();
        for _ in MIN_CALL_NO..=MAX_CALL_NO {
            let candidate = nos.next;
            nos.next = if nos.next >= MAX_CALL_NO { MIN_CALL_NO } else { nos.next + 1 };
            if nos.used.insert(candidate) {
                return Ok(candidate);
            }
        }
        warn!(count = self.transactions.len(), "unable to generate a call number");
        Err(IaxError::NoCallNumber)
    }

    fn release_call_no(&self, lcall: u16) {
        self.call_nos.lock().unwrap().used.remove(&lcall);
    }

    /// Start an outgoing transaction (call, registration or poke)
    pub fn start_transaction(
        &self,
        trans_type: TransType,
        addr: SocketAddr,
        params: OutgoingParams,
        now_ms: u64,
    ) -> Result<u16, IaxError> {
        let lcall = self.generate_call_no()?;
        let trans = IaxTransaction::outgoing(
            self.cfg.clone(),
            trans_type,
            lcall,
            addr,
            params,
            now_ms,
            self.tx.clone(),
        );
        self.incomplete.lock().unwrap().push(lcall);
        self.transactions.insert(lcall, trans);
        Ok(lcall)
    }

    /// Feed one received datagram into the engine
    pub fn add_frame(&self, addr: SocketAddr, buf: &[u8], now_ms: u64) -> Result<(), IaxError> {
        match frame::parse(buf)? {
            ParsedFrame::Full(full) => self.route_full(addr, full, now_ms),
            ParsedFrame::Mini(mini) => {
                self.route_mini(addr, mini, now_ms);
                Ok(())
            }
            ParsedFrame::Trunk(minis) => {
                for mini in minis {
                    self.route_mini(addr, mini, now_ms);
                }
                Ok(())
            }
        }
    }

    fn queue_event(&self, ev: IaxEvent) {
        self.events.lock().unwrap().push_back(ev);
    }

    fn route_mini(&self, addr: SocketAddr, mini: MiniFrame, now_ms: u64) {
        let Some(lcall) = self.by_remote.get(&(mini.src_call, addr)).map(|e| *e) else {
            debug!(rcall = mini.src_call, %addr, "mini frame for unknown transaction");
            return;
        };
        if let Some(mut trans) = self.transactions.get_mut(&lcall) {
            if let Some(ev) = trans.process_media(mini, now_ms) {
                self.queue_event(ev);
            }
        }
    }

    fn route_full(&self, addr: SocketAddr, full: frame::FullFrame, now_ms: u64) -> Result<(), IaxError> {
        // Frames towards a known local call number
        if full.dest_call != 0 {
            if let Some(mut trans) = self.transactions.get_mut(&full.dest_call) {
                let lcall = trans.local_call();
                if trans.remote_call() == 0 && trans.remote_addr() == addr {
                    // First response to an outgoing request completes the pair
                    trans.set_remote_call(full.src_call);
                    self.by_remote.insert((full.src_call, addr), lcall);
                    self.incomplete.lock().unwrap().retain(|c| *c != lcall);
                    debug!(lcall, rcall = full.src_call, "transaction completed");
                } else if trans.remote_call() != full.src_call || trans.remote_addr() != addr {
                    debug!(lcall, src = full.src_call, "full frame does not match the transaction");
                    return Ok(());
                }
                if let Some(ev) = trans.process_frame(full, now_ms) {
                    self.queue_event(ev);
                }
                return Ok(());
            }
            debug!(dest = full.dest_call, "frame for unknown local call");
            return Ok(());
        }
        // Destination zero: either a retransmitted initial frame or a new
        // incoming transaction
        if let Some(lcall) = self.by_remote.get(&(full.src_call, addr)).map(|e| *e) {
            if let Some(mut trans) = self.transactions.get_mut(&lcall) {
                if let Some(ev) = trans.process_frame(full, now_ms) {
                    self.queue_event(ev);
                }
            }
            return Ok(());
        }
        if full.kind != FrameKind::Iax {
            return Ok(());
        }
        match full.subclass {
            ctl::NEW | ctl::REGREQ | ctl::REGREL | ctl::POKE => {}
            ctl::INVAL => {
                // Often used as a keepalive
                return Ok(());
            }
            other => {
                debug!(subclass = other, src = full.src_call, "unsupported incoming transaction frame");
                return Ok(());
            }
        }
        let lcall = self.generate_call_no()?;
        let src_call = full.src_call;
        match IaxTransaction::incoming(self.cfg.clone(), full, lcall, addr, now_ms, self.tx.clone()) {
            Some(trans) => {
                info!(lcall, rcall = src_call, %addr, "new incoming transaction");
                self.by_remote.insert((src_call, addr), lcall);
                self.transactions.insert(lcall, trans);
                Ok(())
            }
            None => {
                self.release_call_no(lcall);
                Ok(())
            }
        }
    }

    /// Pull the next event from any transaction. Final events reap their
    /// transaction. Non-blocking.
    pub fn get_event(&self, now_ms: u64) -> Option<IaxEvent> {
        if let Some(ev) = self.events.lock().unwrap().pop_front() {
            return Some(ev);
        }
        let lcalls: Vec<u16> = self.transactions.iter().map(|e| *e.key()).collect();
        for lcall in lcalls {
            let ev = self.transactions.get_mut(&lcall).and_then(|mut t| t.get_event(now_ms));
            if let Some(ev) = ev {
                if ev.final_event {
                    self.remove_transaction(lcall);
                }
                return Some(ev);
            }
        }
        None
    }

    fn remove_transaction(&self, lcall: u16) {
        if let Some((_, trans)) = self.transactions.remove(&lcall) {
            debug!(lcall, rcall = trans.remote_call(), "transaction removed");
            self.by_remote.remove(&(trans.remote_call(), trans.remote_addr()));
        }
        self.incomplete.lock().unwrap().retain(|c| *c != lcall);
        self.release_call_no(lcall);
    }

    /// Run a closure against one transaction
    pub fn with_transaction<R>(&self, lcall: u16, f: impl FnOnce(&mut IaxTransaction) -> R) -> Option<R> {
        self.transactions.get_mut(&lcall).map(|mut t| f(&mut t))
    }

    /// Accept an incoming transaction; calls join the trunk when enabled
    pub fn accept(&self, lcall: u16, now_ms: u64) -> bool {
        let trunking = self.cfg.trunking;
        self.with_transaction(lcall, |t| {
            let ok = t.send_accept(now_ms);
            if ok && trunking && t.trans_type() == TransType::New {
                t.trunked = true;
            }
            ok
        })
        .unwrap_or(false)
    }

    pub fn reject(&self, lcall: u16, cause: &str, code: u8, now_ms: u64) -> bool {
        self.with_transaction(lcall, |t| t.send_reject(cause, code, now_ms)).unwrap_or(false)
    }

    pub fn hangup(&self, lcall: u16, cause: &str, code: u8, now_ms: u64) -> bool {
        self.with_transaction(lcall, |t| t.send_hangup(cause, code, now_ms)).unwrap_or(false)
    }

    /// Request authentication for an incoming transaction
    pub fn request_auth(&self, lcall: u16, now_ms: u64) -> bool {
        self.with_transaction(lcall, |t| t.send_auth(now_ms)).unwrap_or(false)
    }

    /// Answer a received MD5 challenge using the transaction's credentials
    pub fn answer_auth(&self, lcall: u16, now_ms: u64) -> bool {
        self.with_transaction(lcall, |t| {
            let digest = md5_from_challenge(t.challenge(), t.password());
            t.send_auth_reply(&digest, now_ms)
        })
        .unwrap_or(false)
    }

    /// Verify the MD5 reply received on an incoming transaction
    pub fn check_auth(&self, lcall: u16) -> bool {
        self.with_transaction(lcall, |t| {
            !t.auth_data.is_empty()
                && is_md5_challenge_correct(&t.auth_data, t.challenge(), t.password())
        })
        .unwrap_or(false)
    }

    /// Send media on an established call, batching into the destination's
    /// trunk when the transaction is trunked
    pub fn send_media(&self, lcall: u16, data: &[u8], fmt: u32, now_ms: u64) -> bool {
        let out = match self.with_transaction(lcall, |t| t.send_media(data, fmt, now_ms)) {
            Some(out) => out,
            None => return false,
        };
        match out {
            MediaOut::SentFull | MediaOut::SentMini => true,
            MediaOut::Dropped => false,
            MediaOut::Trunk { call_no, ts, data } => {
                let addr = match self.with_transaction(lcall, |t| t.remote_addr()) {
                    Some(a) => a,
                    None => return false,
                };
                let mut trunks = self.trunks.lock().unwrap();
                let trunk = trunks
                    .entry(addr)
                    .or_insert_with(|| MetaTrunkFrame::new(self.cfg.max_full_frame_data_len as usize));
                if let Some(flushed) = trunk.add(call_no, &data, ts, now_ms) {
                    let _ = self.tx.send((flushed, addr));
                }
                true
            }
        }
    }

    /// Flush trunk frames older than the send interval. Returns whether
    /// anything was sent.
    pub fn process_trunk_frames(&self, now_ms: u64) -> bool {
        let mut sent = false;
        let mut trunks = self.trunks.lock().unwrap();
        for (addr, trunk) in trunks.iter_mut() {
            if trunk.is_empty() {
                continue;
            }
            let age = (now_ms as u32).wrapping_sub(trunk.timestamp());
            if age as u64 >= self.cfg.trunk_send_interval_ms {
                if let Some(data) = trunk.flush(now_ms as u32) {
                    let _ = self.tx.send((data, *addr));
                    sent = true;
                }
            }
        }
        sent
    }

    /// Read datagrams from the socket and write queued output, forever.
    /// Protocol state is still driven by `get_event`/`process_trunk_frames`
    /// from the owner's polling loop.
    pub async fn drive_socket(
        &self,
        socket: UdpSocket,
        mut out_rx: UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    ) -> Result<(), IaxError> {
        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                recv = socket.recv_from(&mut buf) => {
                    let (len, addr) = recv?;
                    if let Err(e) = self.add_frame(addr, &buf[..len], self.now_ms()) {
                        debug!(%addr, error = %e, "dropping invalid datagram");
                    }
                }
                send = out_rx.recv() => {
                    match send {
                        Some((data, addr)) => {
                            if let Err(e) = socket.send_to(&data, addr).await {
                                warn!(%addr, error = %e, "socket write error");
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// MD5 digest over challenge + password, hex encoded
pub fn md5_from_challenge(challenge: &str, password: &str) -> String {
    let digest = md5::compute(format!("{}{}", challenge, password));
    format!("{:x}", digest)
}

/// Verify a received MD5 digest
pub fn is_md5_challenge_correct(md5_data: &str, challenge: &str, password: &str) -> bool {
    md5_data == md5_from_challenge(challenge, password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iax::format;
    use crate::iax::frame::FullFrame;
    use crate::iax::ies::{auth, ie, IeList};
    use crate::iax::{IaxEventKind, TransState};
    use tokio::sync::mpsc::unbounded_channel;

    fn addr() -> SocketAddr {
        "10.0.0.2:4569".parse().unwrap()
    }

    fn engine() -> (IaxEngine, UnboundedReceiver<(Vec<u8>, SocketAddr)>) {
        let (tx, rx) = unbounded_channel();
        (IaxEngine::new(IaxConfig::default(), tx), rx)
    }

    fn recv_full(rx: &mut UnboundedReceiver<(Vec<u8>, SocketAddr)>) -> FullFrame {
        loop {
            let (data, _) = rx.try_recv().expect("expected outgoing data");
            if let ParsedFrame::Full(f) = frame::parse(&data).unwrap() {
                return f;
            }
        }
    }

    fn new_invite(src_call: u16) -> Vec<u8> {
        let mut ies = IeList::new();
        ies.insert_version();
        ies.append_string(ie::USERNAME, "bob");
        ies.append_string(ie::CALLED_NUMBER, "100");
        ies.append_numeric(ie::FORMAT, format::ALAW, 4);
        ies.append_numeric(ie::CAPABILITY, format::ALAW | format::MULAW, 4);
        FullFrame::with_ies(FrameKind::Iax, ctl::NEW, src_call, 0, 0, 0, 5, &ies).to_bytes()
    }

    #[test]
    fn test_incoming_new_allocates_local_call() {
        let (eng, _rx) = engine();
        eng.add_frame(addr(), &new_invite(77), 0).unwrap();
        assert_eq!(eng.transaction_count(), 1);
        let ev = eng.get_event(1).unwrap();
        assert_eq!(ev.kind, IaxEventKind::New);
        assert!(ev.call_no >= MIN_CALL_NO);
        let state = eng.with_transaction(ev.call_no, |t| t.state()).unwrap();
        assert_eq!(state, TransState::NewRemoteInvite);
    }

    #[test]
    fn test_scenario_accept_never_acked_times_out() {
        // Incoming NEW; accept transmitted with the default retransmission
        // budget; the peer never acks: Terminated with a timeout reason
        let (eng, mut rx) = engine();
        eng.add_frame(addr(), &new_invite(77), 0).unwrap();
        let ev = eng.get_event(1).unwrap();
        let lcall = ev.call_no;
        assert!(eng.accept(lcall, 2));
        let accept = recv_full(&mut rx);
        assert!(accept.is_iax(ctl::ACCEPT));
        let mut now = 2;
        let mut last = None;
        for _ in 0..24 {
            now += 4_000;
            if let Some(ev) = eng.get_event(now) {
                last = Some(ev);
                break;
            }
        }
        let ev = last.expect("expected timeout event");
        assert_eq!(ev.kind, IaxEventKind::Timeout);
        assert!(ev.final_event);
        // Transaction reaped, call number reusable
        assert_eq!(eng.transaction_count(), 0);
    }

    #[test]
    fn test_outgoing_transaction_completion() {
        let (eng, mut rx) = engine();
        let params = OutgoingParams {
            username: "alice".into(),
            called_no: "200".into(),
            ..Default::default()
        };
        let lcall = eng.start_transaction(TransType::New, addr(), params, 0).unwrap();
        let invite = recv_full(&mut rx);
        assert_eq!(invite.src_call, lcall);
        // Remote answers from call number 9: the pair completes
        let mut ies = IeList::new();
        ies.append_numeric(ie::FORMAT, format::ALAW, 4);
        let accept = FullFrame::with_ies(
            FrameKind::Iax,
            ctl::ACCEPT,
            9,
            lcall,
            invite.iseq,
            invite.oseq.wrapping_add(1),
            20,
            &ies,
        );
        eng.add_frame(addr(), &accept.to_bytes(), 20).unwrap();
        let ev = eng.get_event(21).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Accept);
        assert_eq!(eng.with_transaction(lcall, |t| t.remote_call()), Some(9));
    }

    #[test]
    fn test_md5_digest() {
        let d = md5_from_challenge("12345", "secret");
        assert_eq!(d.len(), 32);
        assert!(is_md5_challenge_correct(&d, "12345", "secret"));
        assert!(!is_md5_challenge_correct(&d, "12345", "other"));
    }

    #[test]
    fn test_incoming_auth_round() {
        let mut cfg = IaxConfig::default();
        cfg.auth_required = true;
        cfg.secret = "shared".into();
        let (tx, mut out) = unbounded_channel();
        let eng = IaxEngine::new(cfg, tx);
        eng.add_frame(addr(), &new_invite(50), 0).unwrap();
        let ev = eng.get_event(1).unwrap();
        assert_eq!(ev.kind, IaxEventKind::New);
        let lcall = ev.call_no;
        // Challenge the caller
        assert!(eng.request_auth(lcall, 2));
        let authreq = recv_full(&mut out);
        assert!(authreq.is_iax(ctl::AUTHREQ));
        let req_ies = authreq.ie_list().unwrap();
        assert_eq!(req_ies.get_numeric(ie::AUTHMETHODS), Some(auth::MD5));
        let challenge = req_ies.get_string(ie::CHALLENGE).unwrap();
        // Peer replies with the correct digest
        let mut rep = IeList::new();
        rep.append_string(ie::MD5_RESULT, &md5_from_challenge(&challenge, "shared"));
        let reply = FullFrame::with_ies(
            FrameKind::Iax,
            ctl::AUTHREP,
            50,
            lcall,
            authreq.iseq,
            authreq.oseq.wrapping_add(1),
            30,
            &rep,
        );
        eng.add_frame(addr(), &reply.to_bytes(), 30).unwrap();
        let ev = eng.get_event(31).unwrap();
        assert_eq!(ev.kind, IaxEventKind::AuthRep);
        assert!(eng.check_auth(lcall));
    }

    #[test]
    fn test_trunk_flush_on_interval() {
        let (tx, mut out) = unbounded_channel();
        let mut cfg = IaxConfig::default();
        cfg.trunking = true;
        let eng = IaxEngine::new(cfg, tx);
        eng.add_frame(addr(), &new_invite(60), 0).unwrap();
        let ev = eng.get_event(1).unwrap();
        let lcall = ev.call_no;
        assert!(eng.accept(lcall, 2));
        let _accept = recv_full(&mut out);
        // First media goes out as a full frame announcing the format
        assert!(eng.send_media(lcall, &[1, 2, 3], format::ALAW, 100));
        let full = recv_full(&mut out);
        assert_eq!(full.kind, FrameKind::Voice);
        // Continuation media lands in the trunk
        assert!(eng.send_media(lcall, &[4, 5, 6], format::ALAW, 120));
        assert!(out.try_recv().is_err(), "media unexpectedly sent directly");
        // Interval elapses: the trunk is flushed towards the peer
        assert!(eng.process_trunk_frames(120 + eng.config().trunk_send_interval_ms));
        let (data, to) = out.try_recv().unwrap();
        assert_eq!(to, addr());
        match frame::parse(&data).unwrap() {
            ParsedFrame::Trunk(minis) => {
                assert_eq!(minis.len(), 1);
                assert_eq!(minis[0].src_call, lcall & 0x7fff);
                assert_eq!(minis[0].data, vec![4, 5, 6]);
            }
            other => panic!("expected trunk frame, got {:?}", other),
        }
    }

    #[test]
    fn test_mini_routed_by_remote_call() {
        let (eng, mut rx) = engine();
        eng.add_frame(addr(), &new_invite(70), 0).unwrap();
        let ev = eng.get_event(1).unwrap();
        let lcall = ev.call_no;
        assert!(eng.accept(lcall, 2));
        let _ = recv_full(&mut rx);
        // Mini frame from remote call 70 reaches the transaction
        let mini = frame::build_mini(70, 100, &[9, 8, 7]);
        eng.add_frame(addr(), &mini, 100).unwrap();
        let ev = eng.get_event(101).unwrap();
        assert_eq!(ev.kind, IaxEventKind::Media);
        assert_eq!(ev.data, vec![9, 8, 7]);
        assert_eq!(ev.fmt, format::ALAW);
    }

    #[test]
    fn test_call_numbers_unique_and_released() {
        let (eng, _rx) = engine();
        let a = eng.start_transaction(TransType::Poke, addr(), OutgoingParams::default(), 0).unwrap();
        let b = eng.start_transaction(TransType::Poke, addr(), OutgoingParams::default(), 0).unwrap();
        assert_ne!(a, b);
        eng.remove_transaction(a);
        assert_eq!(eng.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_drive_socket_loopback() {
        let (tx, out_rx) = unbounded_channel();
        let eng = std::sync::Arc::new(IaxEngine::new(IaxConfig::default(), tx));
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let driver = eng.clone();
        tokio::spawn(async move {
            let _ = driver.drive_socket(server, out_rx).await;
        });
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&new_invite(31), server_addr).await.unwrap();
        let mut ev = None;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Some(e) = eng.get_event(eng.now_ms()) {
                ev = Some(e);
                break;
            }
        }
        assert_eq!(ev.expect("expected an event").kind, IaxEventKind::New);
    }

    #[test]
    fn test_unknown_full_frame_ignored() {
        let (eng, _rx) = engine();
        // ACCEPT towards an unknown local call: ignored, no transaction
        let f = FullFrame::new(FrameKind::Iax, ctl::ACCEPT, 5, 1234, 0, 0, 0, Vec::new());
        eng.add_frame(addr(), &f.to_bytes(), 0).unwrap();
        assert_eq!(eng.transaction_count(), 0);
    }
}
