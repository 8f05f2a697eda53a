//! Shared types: point codes, routing labels, parameter lists

use crate::errors::IsupError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol variant selecting per-message parameter tables and point code layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    /// ITU-T Q.763/Q.764, 14-bit point codes
    Itu,
    /// ANSI T1.113, 24-bit point codes
    Ansi,
}

impl ProtocolVariant {
    /// Circuit identification code width on the wire
    pub fn cic_len(self) -> usize {
        2
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Itu => "itu-t",
            Self::Ansi => "ansi",
        }
    }
}

/// SS7 signaling point code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointCode {
    pub network: u8,
    pub cluster: u8,
    pub member: u8,
}

impl PointCode {
    pub fn new(network: u8, cluster: u8, member: u8) -> Self {
        Self { network, cluster, member }
    }

    /// Pack into the numeric wire representation for the given variant.
    /// ITU: 3-8-3 bits, ANSI: 8-8-8 bits.
    pub fn pack(&self, variant: ProtocolVariant) -> u32 {
        match variant {
            ProtocolVariant::Itu => {
                (((self.network & 0x07) as u32) << 11)
                    | ((self.cluster as u32) << 3)
                    | ((self.member & 0x07) as u32)
            }
            ProtocolVariant::Ansi => {
                ((self.network as u32) << 16) | ((self.cluster as u32) << 8) | (self.member as u32)
            }
        }
    }

    /// Parse a "network-cluster-member" string
    pub fn parse(s: &str) -> Result<Self, IsupError> {
        let mut it = s.split('-').map(str::trim);
        let mut next = || -> Result<u8, IsupError> {
            it.next()
                .and_then(|p| p.parse::<u8>().ok())
                .ok_or_else(|| IsupError::InvalidPointCode(s.to_string()))
        };
        let network = next()?;
        let cluster = next()?;
        let member = next()?;
        Ok(Self { network, cluster, member })
    }
}

impl fmt::Display for PointCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.network, self.cluster, self.member)
    }
}

/// Routing label carried by every transmitted ISUP message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingLabel {
    pub variant: ProtocolVariant,
    /// Destination point code
    pub dpc: PointCode,
    /// Originating point code
    pub opc: PointCode,
    /// Signaling link selector
    pub sls: u8,
}

impl RoutingLabel {
    pub fn new(variant: ProtocolVariant, dpc: PointCode, opc: PointCode, sls: u8) -> Self {
        Self { variant, dpc, opc, sls }
    }

    /// Label with source and destination swapped, used to answer a received message
    pub fn reversed(&self) -> Self {
        Self { variant: self.variant, dpc: self.opc, opc: self.dpc, sls: self.sls }
    }
}

impl fmt::Display for RoutingLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.opc, self.dpc, self.sls)
    }
}

/// Ordered name/value parameter list.
///
/// Decoded ISUP messages are flat property bags: a parameter name maps to a
/// string value and structured sub-fields use dotted names
/// ("CalledPartyNumber.nature"). Insertion order is preserved so encoding is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamList {
    entries: Vec<(String, String)>,
}

impl ParamList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Append an entry, keeping any existing entry with the same name
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Append only if the value is non-empty
    pub fn add_non_empty(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.entries.push((name.into(), value));
        }
    }

    /// Append under a unique name: "name", then "name.1", "name.2", ...
    pub fn add_unique(&mut self, name: &str, value: impl Into<String>) -> String {
        let mut candidate = name.to_string();
        let mut idx = 0u32;
        while self.get(&candidate).is_some() {
            idx += 1;
            candidate = format!("{}.{}", name, idx);
        }
        self.entries.push((candidate.clone(), value.into()));
        candidate
    }

    /// Replace the first entry with this name or append a new one
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(e) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            e.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// First value stored under this name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn get_or(&self, name: &str, def: &'static str) -> String {
        self.get(name).unwrap_or(def).to_string()
    }

    /// Remove all entries with this name, returning the first removed value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let first = self.get(name).map(str::to_string);
        self.entries.retain(|(n, _)| n != name);
        first
    }

    pub fn get_bool(&self, name: &str, def: bool) -> bool {
        match self.get(name) {
            Some("true") | Some("yes") | Some("on") => true,
            Some("false") | Some("no") | Some("off") => false,
            _ => def,
        }
    }

    pub fn get_int(&self, name: &str, def: i64) -> i64 {
        self.get(name).and_then(|v| v.parse().ok()).unwrap_or(def)
    }

    /// Check a comma-separated flag list value for a given flag
    pub fn has_flag(&self, name: &str, flag: &str) -> bool {
        self.get(name)
            .map(|v| v.split(',').any(|f| f.trim() == flag))
            .unwrap_or(false)
    }

    /// Append a flag to a comma-separated flag list value
    pub fn append_flag(&mut self, name: &str, flag: &str) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(e) if !e.1.is_empty() => {
                if !e.1.split(',').any(|f| f.trim() == flag) {
                    e.1.push(',');
                    e.1.push_str(flag);
                }
            }
            Some(e) => e.1 = flag.to_string(),
            None => self.entries.push((name.to_string(), flag.to_string())),
        }
    }

    /// Copy the named entry and all its dotted sub-fields from another list
    pub fn copy_subtree(&mut self, src: &ParamList, name: &str) {
        let prefix = format!("{}.", name);
        for (n, v) in src.iter() {
            if n == name || n.starts_with(&prefix) {
                self.set(n, v);
            }
        }
    }

    /// Copy entries whose name starts with an uppercase letter (wire parameters)
    pub fn copy_wire_params(&mut self, src: &ParamList) {
        for (n, v) in src.iter() {
            if n.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false) {
                self.set(n, v);
            }
        }
    }
}

/// Lookup a value in a name/value dictionary
pub fn dict_lookup(dict: &[(&'static str, u32)], value: u32) -> Option<&'static str> {
    dict.iter().find(|(_, v)| *v == value).map(|(n, _)| *n)
}

/// Lookup a keyword in a name/value dictionary
pub fn dict_value(dict: &[(&'static str, u32)], name: &str) -> Option<u32> {
    dict.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

/// Parse a keyword or plain number against a dictionary
pub fn dict_parse(dict: &[(&'static str, u32)], text: &str, def: u32) -> u32 {
    dict_value(dict, text)
        .or_else(|| text.parse::<u32>().ok())
        .unwrap_or(def)
}

/// Render a numeric value as its keyword, falling back to the number itself
pub fn dict_name(dict: &[(&'static str, u32)], value: u32) -> String {
    dict_lookup(dict, value)
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Millisecond timer in the style of the signaling timers: an interval plus an
/// optional absolute fire time. Timers are polled from `timer_tick`.
#[derive(Debug, Clone, Default)]
pub struct SigTimer {
    interval: u64,
    fires_at: Option<u64>,
}

impl SigTimer {
    pub fn new(interval_ms: u64) -> Self {
        Self { interval: interval_ms, fires_at: None }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.interval = interval_ms;
    }

    pub fn start(&mut self, now_ms: u64) {
        self.fires_at = Some(now_ms.saturating_add(self.interval));
    }

    pub fn stop(&mut self) {
        self.fires_at = None;
    }

    pub fn started(&self) -> bool {
        self.fires_at.is_some()
    }

    /// True when started and the deadline has passed
    pub fn timed_out(&self, now_ms: u64) -> bool {
        matches!(self.fires_at, Some(t) if now_ms >= t)
    }
}

/// Hex dump helpers used by raw parameter fallbacks
pub fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    for part in text.split_ascii_whitespace() {
        if part.len() % 2 != 0 {
            return None;
        }
        for i in (0..part.len()).step_by(2) {
            out.push(u8::from_str_radix(&part[i..i + 2], 16).ok()?);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_code_pack_itu() {
        let pc = PointCode::new(2, 150, 4);
        // 3-8-3 layout
        assert_eq!(pc.pack(ProtocolVariant::Itu), (2 << 11) | (150 << 3) | 4);
    }

    #[test]
    fn test_point_code_parse() {
        let pc = PointCode::parse("1-20-3").unwrap();
        assert_eq!(pc, PointCode::new(1, 20, 3));
        assert!(PointCode::parse("1-20").is_err());
    }

    #[test]
    fn test_param_list_flags() {
        let mut p = ParamList::new();
        p.append_flag("BackwardCallIndicators", "charge");
        p.append_flag("BackwardCallIndicators", "called-free");
        assert!(p.has_flag("BackwardCallIndicators", "called-free"));
        assert!(!p.has_flag("BackwardCallIndicators", "inband"));
    }

    #[test]
    fn test_param_list_unique() {
        let mut p = ParamList::new();
        assert_eq!(p.add_unique("GenericNumber", "123"), "GenericNumber");
        assert_eq!(p.add_unique("GenericNumber", "456"), "GenericNumber.1");
    }

    #[test]
    fn test_hex_round_trip() {
        let data = [0x00u8, 0x7f, 0xff];
        assert_eq!(from_hex(&to_hex(&data)).unwrap(), data);
    }

    #[test]
    fn test_timer() {
        let mut t = SigTimer::new(100);
        assert!(!t.timed_out(1000));
        t.start(1000);
        assert!(!t.timed_out(1099));
        assert!(t.timed_out(1100));
        t.stop();
        assert!(!t.timed_out(5000));
    }
}
