//! IAX2 (Inter-Asterisk eXchange, version 2) transaction engine
//!
//! - [`ies`] holds information elements and IE lists
//! - [`frame`] is the mini/full/meta-trunk wire codec
//! - [`transaction`] runs the per-call-leg state machine
//! - [`engine`] owns the transaction table, call numbers and trunking

pub mod engine;
pub mod frame;
pub mod ies;
pub mod transaction;

pub use engine::{is_md5_challenge_correct, md5_from_challenge, IaxEngine};
pub use transaction::{IaxEvent, IaxEventKind, TransState, TransType};

/// Protocol version carried in the VERSION IE
pub const IAX_PROTOCOL_VERSION: u32 = 2;

/// Highest assignable call number (15 bits)
pub const MAX_CALL_NO: u16 = 0x7fff;

/// Lowest call number assigned to local transactions
pub const MIN_CALL_NO: u16 = 1;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Dtmf = 0x01,
    Voice = 0x02,
    Video = 0x03,
    Control = 0x04,
    Null = 0x05,
    Iax = 0x06,
    Text = 0x07,
    Image = 0x08,
    Html = 0x09,
    Noise = 0x0a,
}

impl FrameKind {
    pub fn from_code(code: u8) -> Option<FrameKind> {
        use FrameKind::*;
        Some(match code {
            0x01 => Dtmf,
            0x02 => Voice,
            0x03 => Video,
            0x04 => Control,
            0x05 => Null,
            0x06 => Iax,
            0x07 => Text,
            0x08 => Image,
            0x09 => Html,
            0x0a => Noise,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use FrameKind::*;
        match self {
            Dtmf => "DTMF",
            Voice => "VOICE",
            Video => "VIDEO",
            Control => "CONTROL",
            Null => "NULL",
            Iax => "IAX",
            Text => "TEXT",
            Image => "IMAGE",
            Html => "HTML",
            Noise => "NOISE",
        }
    }
}

/// Subclasses of frames of type IAX
pub mod ctl {
    pub const NEW: u32 = 0x01;
    pub const PING: u32 = 0x02;
    pub const PONG: u32 = 0x03;
    pub const ACK: u32 = 0x04;
    pub const HANGUP: u32 = 0x05;
    pub const REJECT: u32 = 0x06;
    pub const ACCEPT: u32 = 0x07;
    pub const AUTHREQ: u32 = 0x08;
    pub const AUTHREP: u32 = 0x09;
    pub const INVAL: u32 = 0x0a;
    pub const LAGRQ: u32 = 0x0b;
    pub const LAGRP: u32 = 0x0c;
    pub const REGREQ: u32 = 0x0d;
    pub const REGAUTH: u32 = 0x0e;
    pub const REGACK: u32 = 0x0f;
    pub const REGREJ: u32 = 0x10;
    pub const REGREL: u32 = 0x11;
    pub const VNAK: u32 = 0x12;
    pub const DPREQ: u32 = 0x13;
    pub const DPREP: u32 = 0x14;
    pub const DIAL: u32 = 0x15;
    pub const QUELCH: u32 = 0x1c;
    pub const UNQUELCH: u32 = 0x1d;
    pub const POKE: u32 = 0x1e;
    pub const MWI: u32 = 0x20;
    pub const UNSUPPORT: u32 = 0x21;
    pub const TRANSFER: u32 = 0x22;
    pub const CALLTOKEN: u32 = 0x28;
}

/// Subclasses of frames of type Control
pub mod control {
    pub const HANGUP: u32 = 0x01;
    pub const RINGING: u32 = 0x03;
    pub const ANSWER: u32 = 0x04;
    pub const BUSY: u32 = 0x05;
    pub const CONGESTION: u32 = 0x08;
    pub const FLASH_HOOK: u32 = 0x09;
    pub const OPTION: u32 = 0x0b;
    pub const KEY_RADIO: u32 = 0x0c;
    pub const UNKEY_RADIO: u32 = 0x0d;
    pub const PROGRESSING: u32 = 0x0e;
    pub const PROCEEDING: u32 = 0x0f;
    pub const HOLD: u32 = 0x10;
    pub const UNHOLD: u32 = 0x11;
}

/// Media format bits and helpers
pub mod format {
    pub const G723_1: u32 = 1 << 0;
    pub const GSM: u32 = 1 << 1;
    pub const MULAW: u32 = 1 << 2;
    pub const ALAW: u32 = 1 << 3;
    pub const G726: u32 = 1 << 4;
    pub const ADPCM: u32 = 1 << 5;
    pub const SLIN: u32 = 1 << 6;
    pub const LPC10: u32 = 1 << 7;
    pub const G729: u32 = 1 << 8;
    pub const SPEEX: u32 = 1 << 9;
    pub const ILBC: u32 = 1 << 10;
    pub const G726_AAL2: u32 = 1 << 11;
    pub const G722: u32 = 1 << 12;
    pub const JPEG: u32 = 1 << 16;
    pub const PNG: u32 = 1 << 17;
    pub const H261: u32 = 1 << 18;
    pub const H263: u32 = 1 << 19;
    pub const H263P: u32 = 1 << 20;
    pub const H264: u32 = 1 << 21;

    /// Audio format mask
    pub const AUDIO_MASK: u32 = 0x0000ffff;
    /// Video format mask
    pub const VIDEO_MASK: u32 = 0x00fc0000 | H261 | H263;

    /// Pick exactly one concrete format from a capability intersection.
    /// Prefers `preferred` when it is part of the capability, otherwise the
    /// lowest set bit (the conventional codec ordering).
    pub fn pick(capability: u32, preferred: u32) -> u32 {
        if capability == 0 {
            return 0;
        }
        if preferred != 0 && capability & preferred == preferred {
            return preferred;
        }
        1 << capability.trailing_zeros()
    }

    pub fn name(fmt: u32) -> &'static str {
        match fmt {
            G723_1 => "g723.1",
            GSM => "gsm",
            MULAW => "mulaw",
            ALAW => "alaw",
            G726 => "g726",
            ADPCM => "adpcm",
            SLIN => "slin",
            LPC10 => "lpc10",
            G729 => "g729",
            SPEEX => "speex",
            ILBC => "ilbc",
            G722 => "g722",
            H261 => "h261",
            H263 => "h263",
            _ => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_format() {
        let caps = format::ALAW | format::MULAW | format::GSM;
        assert_eq!(format::pick(caps, format::MULAW), format::MULAW);
        // Preferred not in capability: lowest common bit wins
        assert_eq!(format::pick(caps, format::G729), format::GSM);
        // Empty capability picks nothing
        assert_eq!(format::pick(0, format::ALAW), 0);
    }

    #[test]
    fn test_frame_kind_round_trip() {
        for code in 1u8..=0x0a {
            assert_eq!(FrameKind::from_code(code).unwrap() as u8, code);
        }
        assert_eq!(FrameKind::from_code(0x0b), None);
    }
}
