//! IAX2 frame codec
//!
//! Wire units, by increasing header richness: mini frames (4-byte header),
//! full frames (12-byte header, sequence numbered, retransmitted until
//! acknowledged) and meta trunk frames batching many mini frames towards one
//! peer. Subclass bytes above 0x7f encode a power of two as `0x80 | log2`.

use super::ies::IeList;
use super::FrameKind;
use crate::errors::IaxError;
use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

/// Pack a 32-bit subclass into its wire byte
pub fn pack_subclass(value: u32) -> u8 {
    if value < 0x80 {
        return value as u8;
    }
    if value.is_power_of_two() {
        return 0x80 | value.trailing_zeros() as u8;
    }
    warn!(value, "cannot pack subclass");
    0
}

/// Unpack a wire subclass byte
pub fn unpack_subclass(value: u8) -> u32 {
    if value > 0x9f {
        debug!(value, "nonstandard subclass");
        return 0;
    }
    if value & 0x80 != 0 {
        1u32 << (value & 0x7f)
    } else {
        value as u32
    }
}

/// A mini frame: truncated timestamp plus media payload
#[derive(Debug, Clone)]
pub struct MiniFrame {
    pub src_call: u16,
    /// Truncated timestamp; trunk entries without timestamps carry None
    pub ts: Option<u16>,
    pub video: bool,
    pub mark: bool,
    pub retrans: bool,
    pub data: Vec<u8>,
}

/// A full frame with both sequence numbers
#[derive(Debug, Clone)]
pub struct FullFrame {
    pub kind: FrameKind,
    pub subclass: u32,
    pub src_call: u16,
    pub dest_call: u16,
    pub oseq: u8,
    pub iseq: u8,
    pub ts: u32,
    pub retrans: bool,
    pub mark: bool,
    pub payload: Vec<u8>,
}

impl FullFrame {
    pub fn new(
        kind: FrameKind,
        subclass: u32,
        src_call: u16,
        dest_call: u16,
        oseq: u8,
        iseq: u8,
        ts: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self { kind, subclass, src_call, dest_call, oseq, iseq, ts, retrans: false, mark: false, payload }
    }

    pub fn with_ies(
        kind: FrameKind,
        subclass: u32,
        src_call: u16,
        dest_call: u16,
        oseq: u8,
        iseq: u8,
        ts: u32,
        ies: &IeList,
    ) -> Self {
        Self::new(kind, subclass, src_call, dest_call, oseq, iseq, ts, ies.to_bytes().to_vec())
    }

    pub fn is_iax(&self, subclass: u32) -> bool {
        self.kind == FrameKind::Iax && self.subclass == subclass
    }

    /// Parse the payload as an information element list
    pub fn ie_list(&self) -> Result<IeList, IaxError> {
        IeList::parse(&self.payload)
    }

    /// Serialize header and payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(12 + self.payload.len());
        // Full frame flag + source call number
        buf.put_u16(0x8000 | (self.src_call & 0x7fff));
        // Retransmission flag + destination call number
        let mut dcn = self.dest_call & 0x7fff;
        if self.retrans {
            dcn |= 0x8000;
        }
        buf.put_u16(dcn);
        buf.put_u32(self.ts);
        buf.put_u8(self.oseq);
        buf.put_u8(self.iseq);
        buf.put_u8(self.kind as u8);
        let mut sc = pack_subclass(self.subclass);
        if self.mark {
            sc |= 0x40;
        }
        buf.put_u8(sc);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }
}

/// A parsed datagram
#[derive(Debug)]
pub enum ParsedFrame {
    Full(FullFrame),
    Mini(MiniFrame),
    /// Batched trunk entries, in arrival order
    Trunk(Vec<MiniFrame>),
}

/// Parse one received datagram
pub fn parse(buf: &[u8]) -> Result<ParsedFrame, IaxError> {
    if buf.len() < 4 {
        return Err(IaxError::InvalidFrame("short datagram".into()));
    }
    let scn = u16::from_be_bytes([buf[0], buf[1]]);
    let dcn = u16::from_be_bytes([buf[2], buf[3]]);
    // Full frame?
    if scn & 0x8000 != 0 {
        if buf.len() < 12 {
            return Err(IaxError::InvalidFrame("short full frame".into()));
        }
        let kind = FrameKind::from_code(buf[10])
            .ok_or_else(|| IaxError::InvalidFrame(format!("unknown frame type {}", buf[10])))?;
        let (subclass, mark) = if kind == FrameKind::Video {
            (unpack_subclass(buf[11] & 0xbf), buf[11] & 0x40 != 0)
        } else {
            (unpack_subclass(buf[11]), false)
        };
        let mut frame = FullFrame::new(
            kind,
            subclass,
            scn & 0x7fff,
            dcn & 0x7fff,
            buf[8],
            buf[9],
            u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            buf[12..].to_vec(),
        );
        frame.retrans = dcn & 0x8000 != 0;
        frame.mark = mark;
        return Ok(ParsedFrame::Full(frame));
    }
    // Meta frame?
    if scn == 0 {
        if dcn & 0x8000 != 0 {
            // Meta video frame: 15-bit call number, 15-bit timestamp + mark
            if buf.len() < 6 {
                return Err(IaxError::InvalidFrame("short meta video frame".into()));
            }
            let ts = (((buf[4] & 0x7f) as u16) << 8) | buf[5] as u16;
            return Ok(ParsedFrame::Mini(MiniFrame {
                src_call: dcn & 0x7fff,
                ts: Some(ts),
                video: true,
                mark: buf[4] & 0x80 != 0,
                retrans: false,
                data: buf[6..].to_vec(),
            }));
        }
        // Meta trunk frame
        if buf.len() < 8 {
            return Err(IaxError::InvalidFrame("short trunk frame".into()));
        }
        if buf[2] != 1 {
            return Err(IaxError::InvalidFrame(format!("unknown meta command {}", buf[2])));
        }
        let timestamps = buf[3] & 1 != 0;
        let mut rest = &buf[8..];
        let mut out = Vec::new();
        if timestamps {
            // [len][call number][timestamp] per entry
            while rest.len() >= 6 {
                let dlen = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                if dlen + 6 > rest.len() {
                    return Err(IaxError::InvalidFrame("truncated trunk entry".into()));
                }
                let mut call = u16::from_be_bytes([rest[2], rest[3]]);
                let retrans = call & 0x8000 != 0;
                call &= 0x7fff;
                let ts = u16::from_be_bytes([rest[4], rest[5]]);
                out.push(MiniFrame {
                    src_call: call,
                    ts: Some(ts),
                    video: false,
                    mark: false,
                    retrans,
                    data: rest[6..6 + dlen].to_vec(),
                });
                rest = &rest[6 + dlen..];
            }
        } else {
            // [call number][len] per entry, no per-entry timestamps
            while rest.len() >= 4 {
                let dlen = u16::from_be_bytes([rest[2], rest[3]]) as usize;
                if dlen + 4 > rest.len() {
                    return Err(IaxError::InvalidFrame("truncated trunk entry".into()));
                }
                let mut call = u16::from_be_bytes([rest[0], rest[1]]);
                let retrans = call & 0x8000 != 0;
                call &= 0x7fff;
                out.push(MiniFrame {
                    src_call: call,
                    ts: None,
                    video: false,
                    mark: false,
                    retrans,
                    data: rest[4..4 + dlen].to_vec(),
                });
                rest = &rest[4 + dlen..];
            }
        }
        return Ok(ParsedFrame::Trunk(out));
    }
    // Mini frame
    Ok(ParsedFrame::Mini(MiniFrame {
        src_call: scn,
        ts: Some(dcn),
        video: false,
        mark: false,
        retrans: false,
        data: buf[4..].to_vec(),
    }))
}

/// Build a voice mini frame
pub fn build_mini(src_call: u16, ts: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u16(src_call & 0x7fff);
    buf.put_u16(ts);
    buf.put_slice(data);
    buf.to_vec()
}

/// An outgoing full frame with retransmission state
#[derive(Debug)]
pub struct FrameOut {
    pub frame: FullFrame,
    data: Vec<u8>,
    /// Remaining retransmissions before the frame times out
    retrans_count: u8,
    /// Current retransmission interval, doubled on every retransmission
    interval_ms: u64,
    /// Absolute time of the next retransmission
    next_at_ms: u64,
    /// Frame is satisfied by a plain ACK (no higher-level response expected)
    pub ack_only: bool,
    acked: bool,
    transmitted_once: bool,
}

impl FrameOut {
    pub fn new(frame: FullFrame, retrans_count: u8, interval_ms: u64, now_ms: u64, ack_only: bool) -> Self {
        let data = frame.to_bytes();
        Self {
            frame,
            data,
            retrans_count,
            interval_ms,
            next_at_ms: now_ms + interval_ms,
            ack_only,
            acked: false,
            transmitted_once: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn acked(&self) -> bool {
        self.acked
    }

    pub fn set_acked(&mut self) {
        self.acked = true;
    }

    /// Mark the wire image as a retransmission after the first send
    pub fn mark_transmitted(&mut self) {
        if !self.transmitted_once {
            self.transmitted_once = true;
            self.frame.retrans = true;
            self.data[2] |= 0x80;
        } else {
            self.transmitted();
        }
    }

    /// Consume one retransmission: double the interval, move the deadline
    pub fn transmitted(&mut self) {
        if self.retrans_count > 0 {
            self.retrans_count -= 1;
            self.interval_ms *= 2;
            self.next_at_ms += self.interval_ms;
        }
    }

    pub fn time_for_retrans(&self, now_ms: u64) -> bool {
        now_ms >= self.next_at_ms
    }

    /// Retransmission budget exhausted and the final deadline passed
    pub fn timed_out(&self, now_ms: u64) -> bool {
        self.retrans_count == 0 && now_ms >= self.next_at_ms
    }

    /// Convert the pending retransmissions into a single hard deadline; used
    /// once an authentication frame has been acknowledged and only the final
    /// reply is awaited
    pub fn set_timeout(&mut self, at_ms: u64) {
        self.retrans_count = 1;
        self.next_at_ms = at_ms;
    }
}

const TRUNK_HEADER_LEN: usize = 8;
const TRUNK_ENTRY_HEADER_LEN: usize = 6;

/// A meta trunk frame accumulating mini frames towards one destination
#[derive(Debug)]
pub struct MetaTrunkFrame {
    buf: Vec<u8>,
    max_len: usize,
    /// Timestamp of the first queued mini frame, zero while empty
    timestamp: u32,
}

impl MetaTrunkFrame {
    pub fn new(max_len: usize) -> Self {
        let mut buf = Vec::with_capacity(max_len);
        // Meta indicator, command 1 (trunk), command data 1 (timestamps)
        buf.extend_from_slice(&[0, 0, 1, 1, 0, 0, 0, 0]);
        Self { buf, max_len, timestamp: 0 }
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == TRUNK_HEADER_LEN
    }

    /// Append one mini frame. When the trunk is full it is flushed first and
    /// the flushed datagram returned.
    pub fn add(&mut self, src_call: u16, data: &[u8], ts: u32, now_ms: u64) -> Option<Vec<u8>> {
        if data.is_empty() {
            return None;
        }
        let mut flushed = None;
        if self.buf.len() + data.len() + TRUNK_ENTRY_HEADER_LEN > self.max_len {
            flushed = self.flush(now_ms as u32);
        }
        if self.is_empty() {
            self.timestamp = now_ms as u32;
        }
        self.buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(&(src_call & 0x7fff).to_be_bytes());
        self.buf.extend_from_slice(&(ts as u16).to_be_bytes());
        self.buf.extend_from_slice(data);
        flushed
    }

    /// Take the accumulated datagram, stamping the shared coarse timestamp
    pub fn flush(&mut self, ts: u32) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        self.buf[4..8].copy_from_slice(&ts.to_be_bytes());
        let out = std::mem::replace(&mut self.buf, {
            let mut b = Vec::with_capacity(self.max_len);
            b.extend_from_slice(&[0, 0, 1, 1, 0, 0, 0, 0]);
            b
        });
        self.timestamp = 0;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iax::{ctl, ies::ie};

    #[test]
    fn test_subclass_packing() {
        assert_eq!(pack_subclass(0x05), 0x05);
        assert_eq!(unpack_subclass(0x05), 0x05);
        assert_eq!(pack_subclass(1 << 10), 0x80 | 10);
        assert_eq!(unpack_subclass(0x80 | 10), 1 << 10);
        // Values above 0x9f are nonstandard
        assert_eq!(unpack_subclass(0xa0), 0);
    }

    #[test]
    fn test_full_frame_round_trip() {
        let mut ies = IeList::new();
        ies.insert_version();
        ies.append_string(ie::USERNAME, "bob");
        let frame = FullFrame::with_ies(FrameKind::Iax, ctl::NEW, 0x123, 0, 0, 0, 1000, &ies);
        let wire = frame.to_bytes();
        match parse(&wire).unwrap() {
            ParsedFrame::Full(f) => {
                assert_eq!(f.kind, FrameKind::Iax);
                assert_eq!(f.subclass, ctl::NEW);
                assert_eq!(f.src_call, 0x123);
                assert_eq!(f.dest_call, 0);
                assert_eq!(f.ts, 1000);
                assert!(!f.retrans);
                let list = f.ie_list().unwrap();
                assert!(list.valid_version());
                assert_eq!(list.get_string(ie::USERNAME).as_deref(), Some("bob"));
            }
            other => panic!("expected full frame, got {:?}", other),
        }
    }

    #[test]
    fn test_mini_frame_round_trip() {
        let wire = build_mini(0x42, 0x1234, &[9, 9, 9]);
        match parse(&wire).unwrap() {
            ParsedFrame::Mini(m) => {
                assert_eq!(m.src_call, 0x42);
                assert_eq!(m.ts, Some(0x1234));
                assert_eq!(m.data, vec![9, 9, 9]);
                assert!(!m.video);
            }
            other => panic!("expected mini frame, got {:?}", other),
        }
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(parse(&[0x80, 0, 0]).is_err());
        // Full frame flag with a truncated header
        assert!(parse(&[0x80, 1, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_retransmission_flag() {
        let frame = FullFrame::new(FrameKind::Iax, ctl::PING, 5, 7, 1, 1, 0, Vec::new());
        let mut out = FrameOut::new(frame, 4, 500, 0, false);
        assert!(!out.frame.retrans);
        out.mark_transmitted();
        assert!(out.frame.retrans);
        match parse(out.data()).unwrap() {
            ParsedFrame::Full(f) => assert!(f.retrans),
            _ => panic!("expected full frame"),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let frame = FullFrame::new(FrameKind::Iax, ctl::ACCEPT, 5, 7, 0, 0, 0, Vec::new());
        let mut out = FrameOut::new(frame, 3, 500, 0, false);
        // First retransmission due at T+500
        assert!(!out.time_for_retrans(499));
        assert!(out.time_for_retrans(500));
        out.mark_transmitted(); // first send
        out.transmitted(); // 1st retransmission: interval 1000, next 1500
        assert!(!out.time_for_retrans(1499));
        assert!(out.time_for_retrans(1500));
        out.transmitted(); // 2nd: interval 2000, next 3500
        assert!(out.time_for_retrans(3500));
        out.transmitted(); // 3rd: budget exhausted
        assert!(out.timed_out(7500));
        assert!(!out.timed_out(7499));
    }

    #[test]
    fn test_trunk_batch_round_trip() {
        let mut trunk = MetaTrunkFrame::new(1400);
        assert!(trunk.add(10, &[1, 1], 100, 50).is_none());
        assert!(trunk.add(11, &[2, 2, 2], 101, 51).is_none());
        let wire = trunk.flush(60).unwrap();
        match parse(&wire).unwrap() {
            ParsedFrame::Trunk(minis) => {
                assert_eq!(minis.len(), 2);
                assert_eq!(minis[0].src_call, 10);
                assert_eq!(minis[0].ts, Some(100));
                assert_eq!(minis[0].data, vec![1, 1]);
                assert_eq!(minis[1].src_call, 11);
                assert_eq!(minis[1].data, vec![2, 2, 2]);
            }
            other => panic!("expected trunk frame, got {:?}", other),
        }
        assert!(trunk.is_empty());
    }

    #[test]
    fn test_trunk_flush_when_full() {
        let mut trunk = MetaTrunkFrame::new(64);
        let payload = [0u8; 30];
        assert!(trunk.add(1, &payload, 0, 0).is_none());
        // Second entry overflows the 64 byte budget: first batch flushed
        let flushed = trunk.add(2, &payload, 1, 1);
        assert!(flushed.is_some());
        assert!(!trunk.is_empty());
    }

    #[test]
    fn test_trunk_without_timestamps_parse() {
        // Hand-built trunk with the timestamps bit clear
        let mut wire = vec![0u8, 0, 1, 0, 0, 0, 0, 42];
        wire.extend_from_slice(&5u16.to_be_bytes()); // call number
        wire.extend_from_slice(&2u16.to_be_bytes()); // length
        wire.extend_from_slice(&[7, 7]);
        match parse(&wire).unwrap() {
            ParsedFrame::Trunk(minis) => {
                assert_eq!(minis.len(), 1);
                assert_eq!(minis[0].src_call, 5);
                assert_eq!(minis[0].ts, None);
                assert_eq!(minis[0].data, vec![7, 7]);
            }
            other => panic!("expected trunk frame, got {:?}", other),
        }
    }
}
