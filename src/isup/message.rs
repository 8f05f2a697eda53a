//! ISUP message assembly and parsing
//!
//! A message is `[CIC][message type][mandatory fixed][mandatory variable
//! pointers + values][optional pointer][optional type+length+value..., 0]`.
//! The mandatory layout comes from a per-(variant, type) parameter table;
//! messages without a table but known to carry only optional parameters fall
//! back to a generic optional-only table.

use super::params::{self, DecodeCtx};
use super::{MsgType, Param};
use crate::errors::{CodecError, IsupError};
use crate::types::{to_hex, ParamList, ProtocolVariant};
use tracing::{debug, warn};

/// A typed ISUP message bound to a circuit with a flat parameter bag
#[derive(Debug, Clone)]
pub struct IsupMessage {
    /// Wire message type code
    pub code: u8,
    /// Recognized type, None for unknown codes decoded via the fallback table
    pub msg_type: Option<MsgType>,
    /// Circuit identification code
    pub cic: u32,
    pub params: ParamList,
}

impl IsupMessage {
    pub fn new(msg_type: MsgType, cic: u32) -> Self {
        Self { code: msg_type.code(), msg_type: Some(msg_type), cic, params: ParamList::new() }
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.add(name, value);
        self
    }

    pub fn name(&self) -> String {
        match self.msg_type {
            Some(t) => t.name().to_string(),
            None => format!("Message_{:02x}", self.code),
        }
    }

    pub fn is(&self, t: MsgType) -> bool {
        self.msg_type == Some(t)
    }
}

struct MsgTable {
    msg: MsgType,
    optional: bool,
    fixed: &'static [Param],
    variable: &'static [Param],
}

// Messages common across standards
static COMMON_TABLES: &[MsgTable] = &[
    // call progress and release messages
    MsgTable { msg: MsgType::Acm, optional: true, fixed: &[Param::BackwardCallIndicators], variable: &[] },
    MsgTable { msg: MsgType::Con, optional: true, fixed: &[Param::BackwardCallIndicators], variable: &[] },
    MsgTable { msg: MsgType::Anm, optional: true, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Rel, optional: true, fixed: &[], variable: &[Param::CauseIndicators] },
    MsgTable { msg: MsgType::Rlc, optional: true, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Sam, optional: true, fixed: &[], variable: &[Param::SubsequentNumber] },
    MsgTable { msg: MsgType::Cpr, optional: true, fixed: &[Param::EventInformation], variable: &[] },
    MsgTable { msg: MsgType::Cnf, optional: true, fixed: &[], variable: &[Param::CauseIndicators] },
    MsgTable { msg: MsgType::Sus, optional: true, fixed: &[Param::SuspendResumeIndicators], variable: &[] },
    MsgTable { msg: MsgType::Res, optional: true, fixed: &[Param::SuspendResumeIndicators], variable: &[] },
    MsgTable { msg: MsgType::Inr, optional: true, fixed: &[Param::InformationRequestIndicators], variable: &[] },
    MsgTable { msg: MsgType::Inf, optional: true, fixed: &[Param::InformationIndicators], variable: &[] },
    // circuit group reset, query, blocking and acknowledgements
    MsgTable { msg: MsgType::Grs, optional: false, fixed: &[], variable: &[Param::RangeAndStatus] },
    MsgTable { msg: MsgType::Gra, optional: false, fixed: &[], variable: &[Param::RangeAndStatus] },
    MsgTable { msg: MsgType::Cqm, optional: false, fixed: &[], variable: &[Param::RangeAndStatus] },
    MsgTable {
        msg: MsgType::Cqr,
        optional: false,
        fixed: &[],
        variable: &[Param::RangeAndStatus, Param::CircuitStateIndicator],
    },
    MsgTable {
        msg: MsgType::Cgb,
        optional: false,
        fixed: &[Param::GroupSupervisionTypeIndicator],
        variable: &[Param::RangeAndStatus],
    },
    MsgTable {
        msg: MsgType::Cga,
        optional: false,
        fixed: &[Param::GroupSupervisionTypeIndicator],
        variable: &[Param::RangeAndStatus],
    },
    MsgTable {
        msg: MsgType::Cgu,
        optional: false,
        fixed: &[Param::GroupSupervisionTypeIndicator],
        variable: &[Param::RangeAndStatus],
    },
    MsgTable {
        msg: MsgType::Cua,
        optional: false,
        fixed: &[Param::GroupSupervisionTypeIndicator],
        variable: &[Param::RangeAndStatus],
    },
    // circuit related messages, most carry only the CIC
    MsgTable { msg: MsgType::Blk, optional: false, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Bla, optional: false, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Ubl, optional: false, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Uba, optional: false, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Ccr, optional: false, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Lpa, optional: false, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Olm, optional: false, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Rsc, optional: false, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Uec, optional: false, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Cot, optional: false, fixed: &[Param::ContinuityIndicators], variable: &[] },
    // user part test and response
    MsgTable { msg: MsgType::Upt, optional: true, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Upa, optional: true, fixed: &[], variable: &[] },
    // application transport
    MsgTable { msg: MsgType::Apm, optional: true, fixed: &[], variable: &[] },
    // facility
    MsgTable { msg: MsgType::Facr, optional: true, fixed: &[Param::FacilityIndicator], variable: &[] },
    MsgTable { msg: MsgType::Faa, optional: true, fixed: &[Param::FacilityIndicator], variable: &[] },
    MsgTable {
        msg: MsgType::Frj,
        optional: true,
        fixed: &[Param::FacilityIndicator],
        variable: &[Param::CauseIndicators],
    },
    // miscellaneous
    MsgTable { msg: MsgType::Usr, optional: true, fixed: &[], variable: &[Param::UserToUserInformation] },
];

// ITU-T specific messages
static ITU_TABLES: &[MsgTable] = &[MsgTable {
    msg: MsgType::Iam,
    optional: true,
    fixed: &[
        Param::NatureOfConnectionIndicators,
        Param::ForwardCallIndicators,
        Param::CallingPartyCategory,
        Param::TransmissionMediumRequirement,
    ],
    variable: &[Param::CalledPartyNumber],
}];

// ANSI specific messages
static ANSI_TABLES: &[MsgTable] = &[
    MsgTable {
        msg: MsgType::Iam,
        optional: true,
        fixed: &[
            Param::NatureOfConnectionIndicators,
            Param::ForwardCallIndicators,
            Param::CallingPartyCategory,
        ],
        variable: &[Param::UserServiceInformation, Param::CalledPartyNumber],
    },
    MsgTable { msg: MsgType::Rlc, optional: false, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Exm, optional: true, fixed: &[], variable: &[] },
    MsgTable { msg: MsgType::Cvt, optional: false, fixed: &[], variable: &[] },
    MsgTable {
        msg: MsgType::Cvr,
        optional: true,
        fixed: &[Param::CircuitValidationRespIndicator, Param::CircuitGroupCharactIndicator],
        variable: &[],
    },
];

// Fallback for unsupported messages carrying only optional parameters
static COMPAT_TABLE: MsgTable =
    MsgTable { msg: MsgType::Cnf, optional: true, fixed: &[], variable: &[] };

fn table_for(variant: ProtocolVariant, msg: MsgType) -> Option<&'static MsgTable> {
    let specific = match variant {
        ProtocolVariant::Itu => ITU_TABLES,
        ProtocolVariant::Ansi => ANSI_TABLES,
    };
    specific
        .iter()
        .find(|t| t.msg == msg)
        .or_else(|| COMMON_TABLES.iter().find(|t| t.msg == msg))
}

/// Build the wire form of a message: CIC + type + parameters.
pub fn encode_message(
    msg: &IsupMessage,
    variant: ProtocolVariant,
) -> Result<Vec<u8>, IsupError> {
    let msg_type = match msg.msg_type {
        Some(t) => t,
        None => return Err(IsupError::NoMessageTable("unknown")),
    };
    let table = match table_for(variant, msg_type) {
        Some(t) => t,
        None if msg_type.optional_only_fallback() => &COMPAT_TABLE,
        None => {
            warn!(msg = msg_type.name(), "no parameter table for message type");
            return Err(IsupError::NoMessageTable(msg_type.name()));
        }
    };
    let mut buf = Vec::with_capacity(64);
    let cic_len = variant.cic_len();
    let mut cic = msg.cic;
    for _ in 0..cic_len {
        buf.push((cic & 0xff) as u8);
        cic >>= 8;
    }
    buf.push(msg_type.code());

    let mut consumed: Vec<&'static str> = Vec::new();
    // Mandatory fixed parameters at their fixed offsets
    for &p in table.fixed {
        let desc = params::desc_by_param(p)
            .ok_or(IsupError::MandatoryFixed("missing parameter description"))?;
        consumed.push(desc.name);
        match params::encode_param(desc, desc.name, &msg.params) {
            Ok(data) => buf.extend_from_slice(&data),
            Err(e) => {
                warn!(param = desc.name, error = %e, "could not encode fixed parameter");
                buf.extend(std::iter::repeat(0u8).take(desc.size as usize));
            }
        }
    }
    // One pointer slot per mandatory variable parameter plus the optional pointer
    let ptr_base = buf.len();
    let n_var = table.variable.len();
    let n_slots = n_var + usize::from(table.optional);
    buf.extend(std::iter::repeat(0u8).take(n_slots));
    for (i, &p) in table.variable.iter().enumerate() {
        let desc = params::desc_by_param(p)
            .ok_or(IsupError::MandatoryFixed("missing parameter description"))?;
        consumed.push(desc.name);
        let data = params::encode_param(desc, desc.name, &msg.params).map_err(IsupError::Codec)?;
        let slot = ptr_base + i;
        let offset = buf.len() - slot;
        if offset > 255 {
            return Err(IsupError::Codec(CodecError::InvalidValue("pointer overflow".into())));
        }
        buf[slot] = offset as u8;
        buf.push(data.len() as u8);
        buf.extend_from_slice(&data);
    }
    if table.optional {
        let slot = ptr_base + n_var;
        let mut wrote_any = false;
        let names: Vec<String> = msg.params.iter().map(|(n, _)| n.to_string()).collect();
        for name in names {
            // Only wire parameters: base names, optionally with a ".<n>" suffix
            let base = match name.rsplit_once('.') {
                Some((head, tail)) if tail.chars().all(|c| c.is_ascii_digit()) => head,
                Some(_) => continue,
                None => name.as_str(),
            };
            if consumed.iter().any(|c| *c == base) {
                continue;
            }
            let (code, payload) = if let Some(desc) = params::desc_by_name(base) {
                match params::encode_param(desc, &name, &msg.params) {
                    Ok(p) => (desc.param.code(), p),
                    Err(e) => {
                        debug!(param = base, error = %e, "skipping optional parameter");
                        continue;
                    }
                }
            } else if let Some(code) = base.strip_prefix("Param_").and_then(|c| c.parse::<u8>().ok()) {
                match msg.params.get(&name).and_then(crate::types::from_hex) {
                    Some(raw) if !raw.is_empty() && raw.len() <= 254 => (code, raw),
                    _ => continue,
                }
            } else {
                continue;
            };
            if !wrote_any {
                buf[slot] = (buf.len() - slot) as u8;
                wrote_any = true;
            }
            buf.push(code);
            buf.push(payload.len() as u8);
            buf.extend_from_slice(&payload);
        }
        if wrote_any {
            buf.push(0);
        }
    }
    Ok(buf)
}

/// Parse a received message: CIC + type + parameters.
///
/// Out-of-bounds offsets or lengths fail the whole message. Per-parameter
/// decode failures are recoverable: the raw value is kept and the parameter
/// name recorded in `parameters-unsupported`.
pub fn decode_message(
    buf: &[u8],
    variant: ProtocolVariant,
    ctx: &DecodeCtx,
) -> Result<IsupMessage, IsupError> {
    let cic_len = variant.cic_len();
    if buf.len() < cic_len + 1 {
        return Err(IsupError::Truncated);
    }
    let mut cic: u32 = 0;
    for i in (0..cic_len).rev() {
        cic = (cic << 8) | buf[i] as u32;
    }
    let code = buf[cic_len];
    let msg_type = MsgType::from_code(code);
    let mut msg = IsupMessage { code, msg_type, cic, params: ParamList::new() };
    msg.params.add("protocol-type", variant.name());
    msg.params.add("message-type", msg.name());

    let table = match msg_type {
        Some(t) => match table_for(variant, t) {
            Some(table) => table,
            None if t.optional_only_fallback() => {
                debug!(msg = t.name(), "unsupported message, decoding compatibility");
                &COMPAT_TABLE
            }
            None if t == MsgType::Pam => {
                // Pass-along payload is kept opaque
                msg.params.add("PassAlong", to_hex(&buf[cic_len + 1..]));
                return Ok(msg);
            }
            None => {
                warn!(msg = t.name(), "unsupported message type");
                return Err(IsupError::NoMessageTable(t.name()));
            }
        },
        // Unknown code: decode optional-only so it can be answered with CNF
        None => &COMPAT_TABLE,
    };

    let area = &buf[cic_len + 1..];
    let len = area.len();
    let mut unsupported: Vec<String> = Vec::new();
    let mut i = 0usize;
    // Mandatory fixed section: layout is unrecoverable on truncation
    for &p in table.fixed {
        let desc = params::desc_by_param(p).ok_or(IsupError::MandatoryFixed("no description"))?;
        let size = desc.size as usize;
        if size == 0 {
            return Err(IsupError::MandatoryFixed(desc.name));
        }
        if i + size > len {
            warn!(msg = %msg.name(), param = desc.name, "truncated mandatory fixed section");
            return Err(IsupError::Truncated);
        }
        if let Err(e) = params::decode_param(desc, &area[i..i + size], &mut msg.params, ctx) {
            warn!(param = desc.name, error = %e, "could not decode fixed parameter");
            let _ = params::decode_raw_unknown(desc.param.code(), &area[i..i + size], &mut msg.params);
            unsupported.push(desc.name.to_string());
        }
        i += size;
    }
    // Mandatory variable section: one pointer byte per parameter
    for &p in table.variable {
        let desc = params::desc_by_param(p).ok_or(IsupError::MandatoryFixed("no description"))?;
        if i >= len {
            return Err(IsupError::Truncated);
        }
        let offs = area[i] as usize;
        if offs < 1 || i + offs >= len {
            warn!(msg = %msg.name(), param = desc.name, offs, "invalid parameter offset");
            return Err(IsupError::Codec(CodecError::InvalidOffset { offset: offs, remaining: len - i }));
        }
        let size = area[i + offs] as usize;
        let start = i + offs + 1;
        if size < 1 || start + size > len {
            warn!(msg = %msg.name(), param = desc.name, size, "invalid parameter size");
            return Err(IsupError::Codec(CodecError::InvalidOffset { offset: start, remaining: len }));
        }
        if let Err(e) = params::decode_param(desc, &area[start..start + size], &mut msg.params, ctx) {
            warn!(param = desc.name, error = %e, "could not decode variable parameter");
            let _ = params::decode_raw_unknown(desc.param.code(), &area[start..start + size], &mut msg.params);
            unsupported.push(desc.name.to_string());
        }
        i += 1;
    }
    // Optional section: type+length+value triples, zero byte terminated
    if table.optional && i < len {
        let offs = area[i] as usize;
        if offs >= len - i {
            warn!(msg = %msg.name(), offs, "invalid optional section offset");
            return Err(IsupError::Codec(CodecError::InvalidOffset { offset: offs, remaining: len - i }));
        }
        if offs > 0 {
            let mut p = i + offs;
            while p < len {
                let code = area[p];
                p += 1;
                if code == 0 {
                    break;
                }
                if p + 1 >= len {
                    warn!(msg = %msg.name(), code, "truncated optional parameter");
                    return Err(IsupError::Truncated);
                }
                let size = area[p] as usize;
                p += 1;
                if size < 1 || p + size > len {
                    warn!(msg = %msg.name(), code, size, "invalid optional parameter size");
                    return Err(IsupError::Codec(CodecError::InvalidOffset { offset: p, remaining: len }));
                }
                match params::desc_by_code(code) {
                    Some(desc) => {
                        if let Err(e) = params::decode_param(desc, &area[p..p + size], &mut msg.params, ctx) {
                            debug!(param = desc.name, error = %e, "could not decode optional parameter");
                            let _ = params::decode_raw_unknown(code, &area[p..p + size], &mut msg.params);
                            unsupported.push(desc.name.to_string());
                        }
                    }
                    None => {
                        // Unknown optional parameters are preserved, not dropped
                        debug!(code, size, "unknown optional parameter");
                        let _ = params::decode_raw_unknown(code, &area[p..p + size], &mut msg.params);
                        unsupported.push(code.to_string());
                    }
                }
                p += size;
            }
        }
    }
    if !unsupported.is_empty() {
        msg.params.add("parameters-unsupported", unsupported.join(","));
    }
    collect_param_compat(&mut msg.params);
    Ok(msg)
}

// Summarize ParameterCompatInformation instructions into the lists consumed
// by the controller when deciding between call release and CNF.
fn collect_param_compat(params: &mut ParamList) {
    const PREFIX: &str = "ParameterCompatInformation.";
    let mut release = Vec::new();
    let mut cnf = Vec::new();
    let mut nopass_release = Vec::new();
    for (name, value) in params.iter() {
        let Some(rest) = name.strip_prefix(PREFIX) else { continue };
        if rest.ends_with(".more") || rest.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        for flag in value.split(',') {
            match flag.trim() {
                "release" => {
                    release.push(rest.to_string());
                    break;
                }
                "cnf" => cnf.push(rest.to_string()),
                "nopass-release" => nopass_release.push(rest.to_string()),
                _ => {}
            }
        }
    }
    if !release.is_empty() {
        params.set("parameters-unhandled-release", release.join(","));
    }
    if !cnf.is_empty() {
        params.set("parameters-unhandled-cnf", cnf.join(","));
    }
    if !nopass_release.is_empty() {
        params.set("parameters-nopass-release", nopass_release.join(","));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DecodeCtx {
        DecodeCtx::default()
    }

    fn build_iam(cic: u32) -> IsupMessage {
        let mut m = IsupMessage::new(MsgType::Iam, cic);
        m.params.add("CalledPartyNumber", "123456");
        m.params.add("CalledPartyNumber.nature", "national");
        m.params.add("CallingPartyNumber", "98765");
        m.params.add("CallingPartyCategory", "ordinary");
        m.params.add("ForwardCallIndicators", "international,isup-path");
        m.params.add("NatureOfConnectionIndicators", "1sat");
        m.params.add("TransmissionMediumRequirement", "speech");
        m
    }

    #[test]
    fn test_iam_round_trip_itu() {
        let msg = build_iam(7);
        let wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
        // CIC little endian + type
        assert_eq!(&wire[..3], &[7, 0, 0x01]);
        let out = decode_message(&wire, ProtocolVariant::Itu, &ctx()).unwrap();
        assert_eq!(out.cic, 7);
        assert!(out.is(MsgType::Iam));
        assert_eq!(out.params.get("CalledPartyNumber"), Some("123456"));
        assert_eq!(out.params.get("CalledPartyNumber.nature"), Some("national"));
        assert_eq!(out.params.get("CallingPartyNumber"), Some("98765"));
        assert_eq!(out.params.get("CallingPartyCategory"), Some("ordinary"));
        assert!(out.params.get("ForwardCallIndicators").unwrap().contains("international"));
        assert_eq!(out.params.get("parameters-unsupported"), None);
    }

    #[test]
    fn test_iam_round_trip_ansi() {
        let mut msg = build_iam(300);
        msg.params.add("UserServiceInformation", "mulaw");
        let wire = encode_message(&msg, ProtocolVariant::Ansi).unwrap();
        let out = decode_message(&wire, ProtocolVariant::Ansi, &ctx()).unwrap();
        assert_eq!(out.cic, 300);
        assert_eq!(out.params.get("UserServiceInformation"), Some("mulaw"));
        assert_eq!(out.params.get("CalledPartyNumber"), Some("123456"));
    }

    #[test]
    fn test_rel_round_trip() {
        let mut msg = IsupMessage::new(MsgType::Rel, 12);
        msg.params.add("CauseIndicators", "normal-clearing");
        msg.params.add("CauseIndicators.location", "LN");
        let wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
        let out = decode_message(&wire, ProtocolVariant::Itu, &ctx()).unwrap();
        assert!(out.is(MsgType::Rel));
        assert_eq!(out.params.get("CauseIndicators"), Some("normal-clearing"));
        assert_eq!(out.params.get("CauseIndicators.location"), Some("LN"));
    }

    #[test]
    fn test_rlc_minimal() {
        let msg = IsupMessage::new(MsgType::Rlc, 5);
        let wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
        // CIC + type + optional pointer left zero
        assert_eq!(wire, vec![5, 0, 0x10, 0]);
        let out = decode_message(&wire, ProtocolVariant::Itu, &ctx()).unwrap();
        assert!(out.is(MsgType::Rlc));
    }

    #[test]
    fn test_ansi_rlc_has_no_optional() {
        let msg = IsupMessage::new(MsgType::Rlc, 5);
        let wire = encode_message(&msg, ProtocolVariant::Ansi).unwrap();
        assert_eq!(wire, vec![5, 0, 0x10]);
    }

    #[test]
    fn test_cgb_round_trip() {
        let mut msg = IsupMessage::new(MsgType::Cgb, 10);
        msg.params.add("GroupSupervisionTypeIndicator", "maintenance");
        msg.params.add("RangeAndStatus", "4");
        msg.params.add("RangeAndStatus.map", "1011");
        let wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
        let out = decode_message(&wire, ProtocolVariant::Itu, &ctx()).unwrap();
        assert_eq!(out.params.get("GroupSupervisionTypeIndicator"), Some("maintenance"));
        assert_eq!(out.params.get("RangeAndStatus"), Some("4"));
        assert_eq!(out.params.get("RangeAndStatus.map"), Some("1011"));
    }

    #[test]
    fn test_acm_with_optional() {
        let mut msg = IsupMessage::new(MsgType::Acm, 9);
        msg.params.add("BackwardCallIndicators", "charge,called-free");
        msg.params.add("OptionalBackwardCallIndicators", "inband");
        let wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
        let out = decode_message(&wire, ProtocolVariant::Itu, &ctx()).unwrap();
        assert!(out.params.get("BackwardCallIndicators").unwrap().contains("called-free"));
        assert!(out.params.has_flag("OptionalBackwardCallIndicators", "inband"));
    }

    #[test]
    fn test_unknown_optional_preserved() {
        let mut msg = IsupMessage::new(MsgType::Anm, 3);
        msg.params.add("Param_153", "de ad be ef");
        let wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
        let out = decode_message(&wire, ProtocolVariant::Itu, &ctx()).unwrap();
        assert_eq!(out.params.get("Param_153"), Some("de ad be ef"));
        assert_eq!(out.params.get("parameters-unsupported"), Some("153"));
    }

    #[test]
    fn test_unknown_message_code_fallback() {
        // Type 0x7a is not recognized; decodes through the optional-only table
        let wire = vec![1u8, 0, 0x7a, 0];
        let out = decode_message(&wire, ProtocolVariant::Itu, &ctx()).unwrap();
        assert_eq!(out.msg_type, None);
        assert_eq!(out.code, 0x7a);
        assert_eq!(out.params.get("message-type"), Some("Message_7a"));
    }

    #[test]
    fn test_truncated_fixed_section_fatal() {
        let msg = build_iam(7);
        let wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
        // Chop inside the mandatory fixed section
        let err = decode_message(&wire[..5], ProtocolVariant::Itu, &ctx());
        assert!(err.is_err());
    }

    #[test]
    fn test_bad_pointer_fatal() {
        let msg = IsupMessage::new(MsgType::Grs, 2)
            .with_param("RangeAndStatus", "8");
        let mut wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
        // Corrupt the variable pointer so it lands outside the buffer
        wire[3] = 0xff;
        assert!(decode_message(&wire, ProtocolVariant::Itu, &ctx()).is_err());
    }

    #[test]
    fn test_no_table_rejected() {
        // COT requires a fixed parameter table entry; truncating to an
        // unknown dialect is not possible, so check a message with a
        // mandatory section has no optional-only fallback
        assert!(!MsgType::Cot.optional_only_fallback());
        let msg = IsupMessage::new(MsgType::Cot, 2);
        // Missing ContinuityIndicators value encodes as default flags
        let wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
        let out = decode_message(&wire, ProtocolVariant::Itu, &ctx()).unwrap();
        assert!(out.is(MsgType::Cot));
    }

    #[test]
    fn test_param_compat_release_summary() {
        let mut msg = IsupMessage::new(MsgType::Anm, 3);
        // ParameterCompatInformation: CallingPartyNumber (0x0a) with release
        msg.params.add("ParameterCompatInformation", "0a 82");
        let wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
        let out = decode_message(&wire, ProtocolVariant::Itu, &ctx()).unwrap();
        assert_eq!(out.params.get("parameters-unhandled-release"), Some("CallingPartyNumber"));
    }

    #[test]
    fn test_message_round_trip_all_tables() {
        // Every message type with a defined table survives an empty-parameter
        // round trip (mandatory parameters encode their defaults)
        for table in COMMON_TABLES.iter().chain(ITU_TABLES.iter()) {
            let mut msg = IsupMessage::new(table.msg, 19);
            // RangeAndStatus has no default; give it one
            if table.variable.contains(&Param::RangeAndStatus) {
                msg.params.add("RangeAndStatus", "1");
                msg.params.add("RangeAndStatus.map", "1");
            }
            if table.variable.contains(&Param::UserToUserInformation) {
                msg.params.add("UserToUserInformation", "01 02");
            }
            if table.variable.contains(&Param::CircuitStateIndicator) {
                msg.params.add("CircuitStateIndicator", "0c");
            }
            let wire = encode_message(&msg, ProtocolVariant::Itu).unwrap();
            let out = decode_message(&wire, ProtocolVariant::Itu, &ctx()).unwrap();
            assert_eq!(out.code, table.msg.code(), "message {}", table.msg.name());
            assert_eq!(out.cic, 19);
            assert_eq!(out.params.get("parameters-unsupported"), None, "message {}", table.msg.name());
        }
    }
}
