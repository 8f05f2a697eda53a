//! IAX2 information elements
//!
//! IEs are `[1-byte type][1-byte length][value]` units appended to full
//! frames. The list preserves insertion order for serialization and supports
//! lookup/removal by type. Numeric IEs are 1, 2 or 4 bytes wide on the wire.

use crate::errors::IaxError;
use bytes::{BufMut, BytesMut};

/// IE type codes
pub mod ie {
    pub const CALLED_NUMBER: u8 = 0x01;
    pub const CALLING_NUMBER: u8 = 0x02;
    pub const CALLING_ANI: u8 = 0x03;
    pub const CALLING_NAME: u8 = 0x04;
    pub const CALLED_CONTEXT: u8 = 0x05;
    pub const USERNAME: u8 = 0x06;
    pub const PASSWORD: u8 = 0x07;
    pub const CAPABILITY: u8 = 0x08;
    pub const FORMAT: u8 = 0x09;
    pub const LANGUAGE: u8 = 0x0a;
    pub const VERSION: u8 = 0x0b;
    pub const ADSICPE: u8 = 0x0c;
    pub const DNID: u8 = 0x0d;
    pub const AUTHMETHODS: u8 = 0x0e;
    pub const CHALLENGE: u8 = 0x0f;
    pub const MD5_RESULT: u8 = 0x10;
    pub const RSA_RESULT: u8 = 0x11;
    pub const APPARENT_ADDR: u8 = 0x12;
    pub const REFRESH: u8 = 0x13;
    pub const DPSTATUS: u8 = 0x14;
    pub const CALLNO: u8 = 0x15;
    pub const CAUSE: u8 = 0x16;
    pub const IAX_UNKNOWN: u8 = 0x17;
    pub const MSGCOUNT: u8 = 0x18;
    pub const AUTOANSWER: u8 = 0x19;
    pub const MUSICONHOLD: u8 = 0x1a;
    pub const TRANSFERID: u8 = 0x1b;
    pub const RDNIS: u8 = 0x1c;
    pub const DATETIME: u8 = 0x1f;
    pub const CALLINGPRES: u8 = 0x26;
    pub const CALLINGTON: u8 = 0x27;
    pub const CALLINGTNS: u8 = 0x28;
    pub const SAMPLINGRATE: u8 = 0x29;
    pub const CAUSECODE: u8 = 0x2a;
    pub const ENCRYPTION: u8 = 0x2b;
    pub const CODEC_PREFS: u8 = 0x2d;
    pub const RR_JITTER: u8 = 0x2e;
    pub const RR_LOSS: u8 = 0x2f;
    pub const RR_PKTS: u8 = 0x30;
    pub const RR_DELAY: u8 = 0x31;
    pub const RR_DROPPED: u8 = 0x32;
    pub const RR_OOO: u8 = 0x33;
    pub const CALLTOKEN: u8 = 0x36;
}

/// Authentication method bits carried in AUTHMETHODS
pub mod auth {
    pub const TEXT: u32 = 0x01;
    pub const MD5: u32 = 0x02;
    pub const RSA: u32 = 0x04;
}

// Wire width of each known IE; unknown types are kept as binary
#[derive(Clone, Copy, PartialEq, Eq)]
enum IeKind {
    Text,
    Num1,
    Num2,
    Num4,
    Binary,
    Null,
}

fn kind_of(code: u8) -> IeKind {
    use ie::*;
    match code {
        CALLED_NUMBER | CALLING_NUMBER | CALLING_ANI | CALLING_NAME | CALLED_CONTEXT
        | USERNAME | PASSWORD | LANGUAGE | DNID | CHALLENGE | MD5_RESULT | RSA_RESULT
        | MUSICONHOLD | RDNIS | CODEC_PREFS | CAUSE => IeKind::Text,
        CAPABILITY | FORMAT | TRANSFERID | DATETIME | SAMPLINGRATE | RR_JITTER | RR_LOSS
        | RR_PKTS | RR_DROPPED | RR_OOO => IeKind::Num4,
        VERSION | ADSICPE | AUTHMETHODS | REFRESH | DPSTATUS | CALLNO | MSGCOUNT
        | CALLINGTNS | RR_DELAY => IeKind::Num2,
        IAX_UNKNOWN | CALLINGPRES | CALLINGTON | CAUSECODE | ENCRYPTION => IeKind::Num1,
        AUTOANSWER => IeKind::Null,
        _ => IeKind::Binary,
    }
}

/// A single typed information element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IeValue {
    Null,
    Numeric { value: u32, width: u8 },
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoElement {
    pub code: u8,
    pub value: IeValue,
}

impl InfoElement {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code);
        match &self.value {
            IeValue::Null => buf.put_u8(0),
            IeValue::Numeric { value, width } => {
                buf.put_u8(*width);
                match width {
                    1 => buf.put_u8(*value as u8),
                    2 => buf.put_u16(*value as u16),
                    _ => buf.put_u32(*value),
                }
            }
            IeValue::Text(t) => {
                buf.put_u8(t.len() as u8);
                buf.put_slice(t.as_bytes());
            }
            IeValue::Binary(b) => {
                buf.put_u8(b.len() as u8);
                buf.put_slice(b);
            }
        }
    }
}

/// Ordered, type-keyed information element list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IeList {
    elements: Vec<InfoElement>,
}

impl IeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InfoElement> {
        self.elements.iter()
    }

    /// Insert the protocol VERSION element
    pub fn insert_version(&mut self) {
        self.append_numeric(ie::VERSION, super::IAX_PROTOCOL_VERSION, 2);
    }

    pub fn append(&mut self, element: InfoElement) {
        self.elements.push(element);
    }

    pub fn append_null(&mut self, code: u8) {
        self.elements.push(InfoElement { code, value: IeValue::Null });
    }

    /// Append a text element; empty strings are skipped
    pub fn append_string(&mut self, code: u8, text: &str) {
        if !text.is_empty() {
            self.elements.push(InfoElement { code, value: IeValue::Text(text.to_string()) });
        }
    }

    pub fn append_numeric(&mut self, code: u8, value: u32, width: u8) {
        self.elements.push(InfoElement { code, value: IeValue::Numeric { value, width } });
    }

    pub fn append_binary(&mut self, code: u8, data: &[u8]) {
        self.elements.push(InfoElement { code, value: IeValue::Binary(data.to_vec()) });
    }

    /// First element with the given type
    pub fn get(&self, code: u8) -> Option<&InfoElement> {
        self.elements.iter().find(|e| e.code == code)
    }

    /// Remove all elements with the given type, returning the first
    pub fn remove(&mut self, code: u8) -> Option<InfoElement> {
        let first = self.get(code).cloned();
        self.elements.retain(|e| e.code != code);
        first
    }

    pub fn get_string(&self, code: u8) -> Option<String> {
        match &self.get(code)?.value {
            IeValue::Text(t) => Some(t.clone()),
            IeValue::Binary(b) => String::from_utf8(b.clone()).ok(),
            _ => None,
        }
    }

    pub fn get_numeric(&self, code: u8) -> Option<u32> {
        match &self.get(code)?.value {
            IeValue::Numeric { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn get_binary(&self, code: u8) -> Option<Vec<u8>> {
        match &self.get(code)?.value {
            IeValue::Binary(b) => Some(b.clone()),
            _ => None,
        }
    }

    /// The VERSION element is present and carries the supported version
    pub fn valid_version(&self) -> bool {
        self.get_numeric(ie::VERSION) == Some(super::IAX_PROTOCOL_VERSION)
    }

    /// Serialize all elements in insertion order
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.elements.len() * 8);
        for e in &self.elements {
            e.write(&mut buf);
        }
        buf
    }

    /// Parse an element list from a frame payload. Any truncated or
    /// wrong-width element invalidates the whole list.
    pub fn parse(mut data: &[u8]) -> Result<IeList, IaxError> {
        let mut list = IeList::new();
        while !data.is_empty() {
            if data.len() < 2 {
                return Err(IaxError::InvalidIeList);
            }
            let code = data[0];
            let len = data[1] as usize;
            data = &data[2..];
            if data.len() < len {
                return Err(IaxError::InvalidIeList);
            }
            let raw = &data[..len];
            data = &data[len..];
            let value = match kind_of(code) {
                IeKind::Null => {
                    if len != 0 {
                        return Err(IaxError::InvalidIeList);
                    }
                    IeValue::Null
                }
                IeKind::Num1 => {
                    if len != 1 {
                        return Err(IaxError::InvalidIeList);
                    }
                    IeValue::Numeric { value: raw[0] as u32, width: 1 }
                }
                IeKind::Num2 => {
                    if len != 2 {
                        return Err(IaxError::InvalidIeList);
                    }
                    IeValue::Numeric { value: u16::from_be_bytes([raw[0], raw[1]]) as u32, width: 2 }
                }
                IeKind::Num4 => {
                    if len != 4 {
                        return Err(IaxError::InvalidIeList);
                    }
                    IeValue::Numeric {
                        value: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
                        width: 4,
                    }
                }
                IeKind::Text => IeValue::Text(String::from_utf8_lossy(raw).into_owned()),
                IeKind::Binary => IeValue::Binary(raw.to_vec()),
            };
            list.elements.push(InfoElement { code, value });
        }
        Ok(list)
    }
}
