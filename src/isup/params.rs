//! Per-parameter binary codec for ISUP information elements
//!
//! Each parameter type is described by a [`ParamDesc`] giving its wire code,
//! fixed size (0 for variable length) and codec kind. Decoders produce entries
//! in a flat [`ParamList`]; structured fields use dotted sub-names. Encoders
//! mirror the decoders. Bit positions follow Q.763/Q.931 tables.

use super::Param;
use crate::errors::CodecError;
use crate::types::{dict_name, dict_parse, from_hex, to_hex, ParamList};
use tracing::debug;

pub type Dict = [(&'static str, u32)];

/// One indicator bit-field: value matched under mask maps to a flag name
#[derive(Debug, Clone, Copy)]
pub struct FlagDef {
    pub mask: u32,
    pub value: u32,
    pub name: &'static str,
}

macro_rules! flags {
    ($($mask:expr, $value:expr, $name:expr;)*) => {
        &[$(FlagDef { mask: $mask, value: $value, name: $name }),*]
    };
}

/// Codec kind selecting the decoder/encoder pair
#[derive(Debug, Clone, Copy)]
pub enum ParamKind {
    /// Hex dump fallback
    Raw,
    /// Big-endian integer with optional keyword dictionary
    Int(Option<&'static Dict>),
    /// Little-endian assembled indicator flags
    Flags(&'static [FlagDef]),
    /// Nibble-packed digit string with address sub-fields
    Digits,
    /// Nibble-packed digit string, odd/even bit only
    Subsequent,
    /// Circuit group range and status bitmap (Q.763 3.43)
    RangeStatus,
    /// 7-bit values terminated by a set high bit (Q.763 3.25)
    Notification(&'static Dict),
    /// Cause indicators (Q.850 2.1)
    Cause,
    /// User service information / bearer capability (Q.931 4.5.5)
    Usi,
    /// Message/parameter compatibility instructions (Q.763 3.33/3.41)
    Compat,
    /// Redirection information (Q.763 3.45)
    Redirection,
    /// Generic name
    Name,
}

/// Description of one ISUP parameter
#[derive(Debug, Clone, Copy)]
pub struct ParamDesc {
    pub param: Param,
    /// Size in octets, zero for variable
    pub size: u8,
    pub name: &'static str,
    pub kind: ParamKind,
}

/// Decoder context carried through every decode call
#[derive(Debug, Clone, Copy)]
pub struct DecodeCtx {
    /// Skip address signals with no digit mapping instead of mapping A-E
    pub ignore_unknown_digits: bool,
}

impl Default for DecodeCtx {
    fn default() -> Self {
        Self { ignore_unknown_digits: true }
    }
}

// Nature of Address Indicator
pub static DICT_NAI: &Dict = &[
    ("subscriber", 1),
    ("unknown", 2),
    ("national", 3),
    ("international", 4),
    ("network-specific", 5),
    ("national-routing", 6),
    ("specific-routing", 7),
    ("routing-with-cdn", 8),
];

// Numbering Plan Indicator
pub static DICT_NUM_PLAN: &Dict = &[
    ("unknown", 0),
    ("isdn", 1),
    ("data", 3),
    ("telex", 4),
    ("private", 5),
    ("national", 6),
];

// Address Presentation
pub static DICT_PRESENTATION: &Dict = &[("allowed", 0), ("restricted", 1), ("unavailable", 2)];

// Screening Indicator
pub static DICT_SCREENING: &Dict = &[
    ("user-provided", 0),
    ("user-provided-passed", 1),
    ("user-provided-failed", 2),
    ("network-provided", 3),
];

// Generic number qualifier
pub static DICT_QUAL: &Dict = &[
    ("dialed-digits", 0),
    ("called-additional", 1),
    ("caller-failed", 2),
    ("caller-not-screened", 3),
    ("terminating", 4),
    ("connected-additional", 5),
    ("caller-additional", 6),
    ("called-original", 7),
    ("redirecting", 8),
    ("redirection", 9),
];

// Generic name qualifier
pub static DICT_QUAL_NAME: &Dict =
    &[("caller", 0x20), ("called", 0x40), ("redirecting", 0x60), ("connected", 0x80)];

// Calling Party Category (Q.763 3.11)
pub static DICT_CALLER_CAT: &Dict = &[
    ("unknown", 0),
    ("operator-FR", 1),
    ("operator-EN", 2),
    ("operator-DE", 3),
    ("operator-RU", 4),
    ("operator-ES", 5),
    ("ordinary", 10),
    ("priority", 11),
    ("data", 12),
    ("test", 13),
    ("payphone", 15),
];

// Transmission Medium Requirement (Q.763 3.54)
pub static DICT_MEDIUM_REQ: &Dict = &[
    ("speech", 0),
    ("64kbit", 2),
    ("3.1khz-audio", 3),
    ("64kb-preferred", 6),
    ("2x64kbit", 7),
    ("384kbit", 8),
    ("1536kbit", 9),
    ("1920kbit", 10),
];

// Generic Notification Indicator (Q.763 3.25)
pub static DICT_NOTIFICATIONS: &Dict = &[
    ("user-suspended", 0x00),
    ("user-resumed", 0x01),
    ("bearer-service-change", 0x02),
    ("call-completion-delay", 0x04),
    ("conf-established", 0x42),
    ("conf-disconnected", 0x43),
    ("party-added", 0x44),
    ("isolated", 0x45),
    ("reattached", 0x46),
    ("party-isolated", 0x47),
    ("party-reattached", 0x48),
    ("party-split", 0x49),
    ("party-disconnected", 0x4a),
    ("conf-floating", 0x4b),
    ("call-waiting", 0x60),
    ("call-diversion", 0x68),
    ("call-transfer-alerting", 0x69),
    ("call-transfer-active", 0x6a),
    ("remote-hold", 0x79),
    ("remote-retrieval", 0x7a),
    ("call-diverting", 0x7b),
];

// Redirection Information (Q.763 3.45) bits CBA
pub static DICT_REDIR_MAIN: &Dict = &[
    ("none", 0),
    ("rerouted", 1),
    ("rerouted-restrict-all", 2),
    ("diverted", 3),
    ("diverted-restrict-all", 4),
    ("rerouted-restrict-number", 5),
    ("diverted-restrict-number", 6),
];

// Redirection Information (Q.763 3.45) bits HGFE or PONM
pub static DICT_REDIR_REASON: &Dict = &[
    ("busy", 1),
    ("noanswer", 2),
    ("always", 3),
    ("deflected", 4),
    ("diverted", 5),
    ("offline", 6),
];

// ANSI Originating Line Info
pub static DICT_OLI: &Dict = &[
    ("normal", 0),
    ("multiparty", 1),
    ("ani-failure", 2),
    ("hotel-room-id", 6),
    ("coinless", 7),
    ("restricted", 8),
    ("test-call-1", 10),
    ("aiod-listed-dn", 20),
    ("identified-line", 23),
    ("800-call", 24),
    ("coin-line", 27),
    ("restricted-hotel", 68),
    ("test-call-2", 95),
];

// Coding standard (Q.931/Q.850)
pub static DICT_CODING: &Dict =
    &[("CCITT", 0x00), ("ISO/IEC", 0x01), ("national", 0x02), ("network specific", 0x03)];

// Locations (Q.850)
pub static DICT_LOCATION: &Dict = &[
    ("U", 0x00),
    ("LPN", 0x01),
    ("LN", 0x02),
    ("TN", 0x03),
    ("RLN", 0x04),
    ("RPN", 0x05),
    ("INTL", 0x07),
    ("BI", 0x0a),
];

// Cause values for the CCITT coding standard (Q.850 Table 1)
pub static DICT_CAUSE_CCITT: &Dict = &[
    ("normal-event", 0x00),
    ("unallocated", 0x01),
    ("noroute-to-network", 0x02),
    ("noroute", 0x03),
    ("send-info-tone", 0x04),
    ("misdialed-trunk-prefix", 0x05),
    ("channel-unacceptable", 0x06),
    ("call-delivered", 0x07),
    ("preemption", 0x08),
    ("preemption-circuit-reserved", 0x09),
    ("excess-digits", 0x0e),
    ("normal-clearing", 0x10),
    ("busy", 0x11),
    ("noresponse", 0x12),
    ("noanswer", 0x13),
    ("offline", 0x14),
    ("rejected", 0x15),
    ("moved", 0x16),
    ("redirection", 0x17),
    ("looping", 0x19),
    ("answered", 0x1a),
    ("out-of-order", 0x1b),
    ("invalid-number", 0x1c),
    ("facility-rejected", 0x1d),
    ("normal", 0x1f),
    ("resource-unavailable", 0x20),
    ("congestion", 0x22),
    ("net-out-of-order", 0x26),
    ("temporary-failure", 0x29),
    ("switch-congestion", 0x2a),
    ("access-info-discarded", 0x2b),
    ("channel-unavailable", 0x2c),
    ("noresource", 0x2f),
    ("service-unavailable", 0x30),
    ("facility-not-subscribed", 0x32),
    ("forbidden-out", 0x35),
    ("forbidden-in", 0x37),
    ("bearer-cap-not-auth", 0x39),
    ("bearer-cap-not-available", 0x3a),
    ("bearer-cap-not-implemented", 0x41),
    ("channel-type-not-implemented", 0x42),
    ("facility-not-implemented", 0x45),
    ("service-not-implemented", 0x4f),
    ("invalid-callref", 0x51),
    ("unknown-channel", 0x52),
    ("incompatible-dest", 0x58),
    ("invalid-message", 0x5f),
    ("missing-mandatory-ie", 0x60),
    ("unknown-message", 0x61),
    ("wrong-message", 0x62),
    ("unknown-ie", 0x63),
    ("invalid-ie", 0x64),
    ("wrong-state-message", 0x65),
    ("timeout", 0x66),
    ("protocol-error", 0x6f),
    ("interworking", 0x7f),
];

// Q.931 4.5.5 information transfer capability
pub static DICT_TRANSFER_CAP: &Dict = &[
    ("speech", 0x00),
    ("udi", 0x08),
    ("rdi", 0x09),
    ("3.1khz-audio", 0x10),
    ("udi-ta", 0x11),
    ("video", 0x18),
];

// Q.931 4.5.5 transfer mode
pub static DICT_TRANSFER_MODE: &Dict = &[("circuit", 0x00), ("packet", 0x02)];

// Q.931 4.5.5 transfer rate
pub static DICT_TRANSFER_RATE: &Dict = &[
    ("packet", 0x00),
    ("64kbit", 0x10),
    ("2x64kbit", 0x11),
    ("384kbit", 0x13),
    ("1536kbit", 0x15),
    ("1920kbit", 0x17),
    ("multirate", 0x18),
];

// Q.931 4.5.5 user information layer 1 protocol
pub static DICT_FORMAT: &Dict = &[
    ("v110", 0x01),
    ("mulaw", 0x02),
    ("alaw", 0x03),
    ("g721", 0x04),
    ("h221", 0x05),
    ("h223", 0x06),
    ("non-CCITT", 0x07),
    ("v120", 0x08),
    ("x31", 0x09),
];

// Message Compatibility Information (Q.763 3.33)
static FLAGS_MSGCOMPAT: &[FlagDef] = flags! {
    0x01, 0x00, "transit";
    0x01, 0x01, "end-node";
    0x02, 0x02, "release";
    0x04, 0x04, "cnf";
    0x08, 0x08, "discard";
    0x10, 0x00, "nopass-release";
    0x10, 0x10, "nopass-discard";
};

// Parameter Compatibility Information (Q.763 3.41)
static FLAGS_PARAMCOMPAT: &[FlagDef] = flags! {
    0x01, 0x00, "transit";
    0x01, 0x01, "end-node";
    0x02, 0x02, "release";
    0x04, 0x04, "cnf";
    0x08, 0x08, "discard-msg";
    0x18, 0x10, "discard-param";
    0x60, 0x00, "nopass-release";
    0x60, 0x20, "nopass-msg";
    0x60, 0x40, "nopass-param";
};

// Nature of Connection Indicators (Q.763 3.35)
static FLAGS_NACI: &[FlagDef] = flags! {
    0x03, 0x00, "0sat";
    0x03, 0x01, "1sat";
    0x03, 0x02, "2sat";
    0x0c, 0x00, "cont-check-none";
    0x0c, 0x04, "cont-check-this";
    0x0c, 0x08, "cont-check-prev";
    0x10, 0x10, "echodev";
};

// Forward Call Indicators (Q.763 3.23)
static FLAGS_FWCALLIND: &[FlagDef] = flags! {
    0x0001, 0x0000, "national";
    0x0001, 0x0001, "international";
    0x0006, 0x0000, "e2e-none";
    0x0006, 0x0002, "e2e-pass";
    0x0006, 0x0004, "e2e-sccp";
    0x0006, 0x0006, "e2e-pass-sccp";
    0x0008, 0x0008, "interworking";
    0x0010, 0x0010, "e2e-info";
    0x0020, 0x0020, "isup-path";
    0x00c0, 0x0000, "isup-pref";
    0x00c0, 0x0040, "isup-notreq";
    0x00c0, 0x0080, "isup-req";
    0x0100, 0x0100, "isdn-orig";
    0x0600, 0x0000, "sccp-none";
    0x0600, 0x0200, "sccp-less";
    0x0600, 0x0400, "sccp-conn";
    0x0600, 0x0600, "sccp-less-conn";
    0x1000, 0x1000, "translated";
    0x2000, 0x2000, "qor-routing";
};

// Backward Call Indicators (Q.763 3.5)
static FLAGS_BKCALLIND: &[FlagDef] = flags! {
    0x0003, 0x0001, "no-charge";
    0x0003, 0x0002, "charge";
    0x000c, 0x0004, "called-free";
    0x000c, 0x0008, "called-conn";
    0x0030, 0x0010, "called-ordinary";
    0x0030, 0x0020, "called-payphone";
    0x00c0, 0x0000, "e2e-none";
    0x00c0, 0x0040, "e2e-pass";
    0x00c0, 0x0080, "e2e-sccp";
    0x00c0, 0x00c0, "e2e-pass-sccp";
    0x0100, 0x0100, "interworking";
    0x0200, 0x0200, "e2e-info";
    0x0400, 0x0400, "isup-path";
    0x0800, 0x0800, "hold-req";
    0x1000, 0x1000, "isdn-end";
    0x2000, 0x2000, "echodev";
    0xc000, 0x0000, "sccp-none";
    0xc000, 0x4000, "sccp-less";
    0xc000, 0x8000, "sccp-conn";
    0xc000, 0xc000, "sccp-less-conn";
};

// Call Diversion Information (Q.763 3.6)
static FLAGS_CALLDIVINFO: &[FlagDef] = flags! {
    0x07, 0x01, "presentation-not-allowed";
    0x07, 0x02, "presentation-with-number";
    0x07, 0x03, "presentation-without-number";
    0x78, 0x08, "busy";
    0x78, 0x10, "noanswer";
    0x78, 0x18, "always";
    0x78, 0x20, "deflected-alerting";
    0x78, 0x28, "deflected-immediate";
    0x78, 0x30, "offline";
};

// Optional Forward Call Indicators (Q.763 3.38)
static FLAGS_OPTFWCALLIND: &[FlagDef] = flags! {
    0x03, 0x00, "non-CUG";
    0x03, 0x02, "CUG+out";
    0x03, 0x03, "CUG";
    0x04, 0x04, "segmentation";
    0x80, 0x80, "CLIR-requested";
};

// Optional Backward Call Indicators (Q.763 3.37)
static FLAGS_OPTBKCALLIND: &[FlagDef] = flags! {
    0x01, 0x01, "inband";
    0x02, 0x02, "diversion-possible";
    0x04, 0x04, "segmentation";
    0x08, 0x08, "MLPP-user";
};

// Event Information (Q.763 3.21)
static FLAGS_EVENTINFO: &[FlagDef] = flags! {
    0x7f, 0x01, "ringing";
    0x7f, 0x02, "progress";
    0x7f, 0x03, "inband";
    0x7f, 0x04, "forward-busy";
    0x7f, 0x05, "forward-noanswer";
    0x7f, 0x06, "forward-always";
    0x80, 0x80, "restricted";
};

// Continuity Indicators (Q.763 3.18)
static FLAGS_CONTINUITY: &[FlagDef] = flags! {
    0x01, 0x00, "failed";
    0x01, 0x01, "success";
};

// Group Supervision Type Indicator (Q.763 3.13)
static FLAGS_GRPTYPEIND: &[FlagDef] = flags! {
    0x03, 0x00, "maintenance";
    0x03, 0x01, "hw-failure";
    0x03, 0x02, "national";
};

// Access Delivery Information (Q.763 3.2)
static FLAGS_ACCDELINFO: &[FlagDef] = flags! {
    0x01, 0x00, "setup-generated";
    0x01, 0x01, "no-setup";
};

// MCID Request or Response Indicators (Q.763 3.31 and 3.32)
static FLAGS_MCID: &[FlagDef] = flags! {
    0x01, 0x01, "MCID";
    0x02, 0x02, "holding";
};

// ANSI Circuit Validation Response Indicator
static FLAGS_ANSI_CVRI: &[FlagDef] = flags! {
    0x03, 0x00, "failed";
    0x03, 0x01, "success";
};

// ANSI Circuit Group Characteristics Indicator
static FLAGS_ANSI_CGCI: &[FlagDef] = flags! {
    0x03, 0x00, "carrier-unknown";
    0x03, 0x01, "carrier-analog";
    0x03, 0x02, "carrier-digital";
    0x03, 0x03, "carrier-mixed";
    0x0c, 0x00, "seize-none";
    0x0c, 0x04, "seize-odd";
    0x0c, 0x08, "seize-even";
    0x0c, 0x0c, "seize-all";
    0x30, 0x00, "alarm-default";
    0x30, 0x10, "alarm-software";
    0x30, 0x20, "alarm-hardware";
    0xc0, 0x00, "continuity-unknown";
    0xc0, 0x40, "continuity-none";
    0xc0, 0x80, "continuity-statistical";
    0xc0, 0xc0, "continuity-call";
};

macro_rules! param_desc {
    ($($param:ident, $size:expr, $kind:expr;)*) => {
        &[$(ParamDesc { param: Param::$param, size: $size, name: stringify!($param), kind: $kind }),*]
    };
}

/// Description of each supported ISUP parameter, references to ITU Q.763
pub static PARAM_DEFS: &[ParamDesc] = param_desc! {
    AccessDeliveryInformation,      1, ParamKind::Flags(FLAGS_ACCDELINFO);       // 3.2
    AccessTransport,                0, ParamKind::Raw;                           // 3.3
    AutomaticCongestionLevel,       1, ParamKind::Int(None);                     // 3.4
    BackwardCallIndicators,         2, ParamKind::Flags(FLAGS_BKCALLIND);        // 3.5
    CallDiversionInformation,       1, ParamKind::Flags(FLAGS_CALLDIVINFO);      // 3.6
    CallHistoryInformation,         2, ParamKind::Int(None);                     // 3.7
    CallReference,                  0, ParamKind::Raw;                           // 3.8
    CalledPartyNumber,              0, ParamKind::Digits;                        // 3.9
    CallingPartyNumber,             0, ParamKind::Digits;                        // 3.10
    CallingPartyCategory,           1, ParamKind::Int(Some(DICT_CALLER_CAT));    // 3.11
    CauseIndicators,                0, ParamKind::Cause;                         // 3.12, Q.850 2.1
    GroupSupervisionTypeIndicator,  1, ParamKind::Flags(FLAGS_GRPTYPEIND);       // 3.13
    CircuitStateIndicator,          0, ParamKind::Raw;                           // 3.14
    ConnectedNumber,                0, ParamKind::Digits;                        // 3.16
    ContinuityIndicators,           1, ParamKind::Flags(FLAGS_CONTINUITY);       // 3.18
    EventInformation,               1, ParamKind::Flags(FLAGS_EVENTINFO);        // 3.21
    FacilityIndicator,              1, ParamKind::Raw;                           // 3.22
    ForwardCallIndicators,          2, ParamKind::Flags(FLAGS_FWCALLIND);        // 3.23
    GenericDigits,                  0, ParamKind::Raw;                           // 3.24
    GenericNotification,            0, ParamKind::Notification(DICT_NOTIFICATIONS); // 3.25
    GenericNumber,                  0, ParamKind::Digits;                        // 3.26
    InformationIndicators,          2, ParamKind::Raw;                           // 3.28
    InformationRequestIndicators,   2, ParamKind::Raw;                           // 3.29
    LocationNumber,                 0, ParamKind::Digits;                        // 3.30
    McidRequestIndicator,           1, ParamKind::Flags(FLAGS_MCID);             // 3.31
    McidResponseIndicator,          1, ParamKind::Flags(FLAGS_MCID);             // 3.32
    MessageCompatInformation,       0, ParamKind::Compat;                        // 3.33
    NatureOfConnectionIndicators,   1, ParamKind::Flags(FLAGS_NACI);             // 3.35
    OptionalBackwardCallIndicators, 1, ParamKind::Flags(FLAGS_OPTBKCALLIND);     // 3.37
    OptionalForwardCallIndicators,  1, ParamKind::Flags(FLAGS_OPTFWCALLIND);     // 3.38
    OriginalCalledNumber,           0, ParamKind::Digits;                        // 3.39
    ParameterCompatInformation,     0, ParamKind::Compat;                        // 3.41
    PropagationDelayCounter,        2, ParamKind::Int(None);                     // 3.42
    RangeAndStatus,                 0, ParamKind::RangeStatus;                   // 3.43
    RedirectingNumber,              0, ParamKind::Digits;                        // 3.44
    RedirectionInformation,         0, ParamKind::Redirection;                   // 3.45
    RedirectionNumber,              0, ParamKind::Digits;                        // 3.46
    SubsequentNumber,               0, ParamKind::Subsequent;                    // 3.51
    SuspendResumeIndicators,        1, ParamKind::Raw;                           // 3.52
    TransmissionMediumRequirement,  1, ParamKind::Int(Some(DICT_MEDIUM_REQ));    // 3.54
    TransMediumRequirementPrime,    1, ParamKind::Int(Some(DICT_MEDIUM_REQ));    // 3.55
    TransmissionMediumUsed,         1, ParamKind::Int(Some(DICT_MEDIUM_REQ));    // 3.56
    UserServiceInformation,         0, ParamKind::Usi;                           // 3.57, Q.931 4.5.5
    UserServiceInformationPrime,    0, ParamKind::Raw;                           // 3.58
    UserToUserInformation,          0, ParamKind::Raw;                           // 3.61
    HopCounter,                     1, ParamKind::Int(None);                     // 3.80
    ApplicationTransport,           0, ParamKind::Raw;                           // 3.82
    GenericName,                    0, ParamKind::Name;
    CircuitGroupCharactIndicator,   1, ParamKind::Flags(FLAGS_ANSI_CGCI);        // T1.113
    CircuitValidationRespIndicator, 1, ParamKind::Flags(FLAGS_ANSI_CVRI);        // T1.113
    OriginatingLineInformation,     1, ParamKind::Int(Some(DICT_OLI));
};

/// Locate a parameter description by type
pub fn desc_by_param(param: Param) -> Option<&'static ParamDesc> {
    PARAM_DEFS.iter().find(|d| d.param == param)
}

/// Locate a parameter description by wire code
pub fn desc_by_code(code: u8) -> Option<&'static ParamDesc> {
    PARAM_DEFS.iter().find(|d| d.param.code() == code)
}

/// Locate a parameter description by name
pub fn desc_by_name(name: &str) -> Option<&'static ParamDesc> {
    PARAM_DEFS.iter().find(|d| d.name == name)
}

fn add_keyword(list: &mut ParamList, name: String, dict: &Dict, value: u32) {
    list.add(name, dict_name(dict, value));
}

fn flags_to_text(defs: &[FlagDef], value: u32) -> String {
    let mut out = String::new();
    for d in defs {
        if value & d.mask == d.value {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(d.name);
        }
    }
    out
}

fn flags_from_text(defs: &[FlagDef], text: &str) -> u32 {
    let mut v = 0u32;
    for flag in text.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        if let Some(d) = defs.iter().find(|d| d.name == flag) {
            v = (v & !d.mask) | d.value;
        }
    }
    v
}

// Extract digits from nibble-packed address signals
fn get_digits(odd: bool, buf: &[u8], ignore_unknown: bool) -> String {
    const DIGITS_STRICT: &[u8; 16] = b"0123456789\0BC\0\0.";
    const DIGITS_ALL: &[u8; 16] = b"0123456789ABCDE.";
    let table = if ignore_unknown { DIGITS_STRICT } else { DIGITS_ALL };
    let mut out = String::new();
    for (i, b) in buf.iter().enumerate() {
        let lo = table[(b & 0x0f) as usize];
        if lo != 0 {
            out.push(lo as char);
        }
        if odd && i + 1 == buf.len() {
            break;
        }
        let hi = table[(b >> 4) as usize];
        if hi != 0 {
            out.push(hi as char);
        }
    }
    out
}

// Pack a digit string into address signals; returns (odd, packed)
fn set_digits(text: &str) -> (bool, Vec<u8>) {
    let mut out = Vec::new();
    let mut odd = false;
    for c in text.chars() {
        let n: u8 = match c {
            '0'..='9' => c as u8 - b'0',
            'A' => 10,
            'B' => 11,
            'C' => 12,
            'D' => 13,
            'E' => 14,
            '.' => 15,
            _ => continue,
        };
        odd = !odd;
        if odd {
            out.push(n);
        } else {
            *out.last_mut().unwrap() |= n << 4;
        }
    }
    (odd, out)
}

/// Decode a single parameter into the list. A size mismatch for fixed-size
/// parameters fails here; the caller decides whether that is fatal.
pub fn decode_param(
    desc: &ParamDesc,
    buf: &[u8],
    list: &mut ParamList,
    ctx: &DecodeCtx,
) -> Result<(), CodecError> {
    if desc.size != 0 && desc.size as usize != buf.len() {
        return Err(CodecError::FixedSizeMismatch { expected: desc.size, got: buf.len() });
    }
    match desc.kind {
        ParamKind::Raw => decode_raw(desc.name, buf, list),
        ParamKind::Int(dict) => decode_int(desc, buf, list, dict),
        ParamKind::Flags(defs) => decode_flags(desc.name, buf, list, defs),
        ParamKind::Digits => decode_digits(desc, buf, list, ctx),
        ParamKind::Subsequent => decode_subseq(desc, buf, list, ctx),
        ParamKind::RangeStatus => decode_range_status(desc, buf, list),
        ParamKind::Notification(dict) => decode_notification(desc, buf, list, dict),
        ParamKind::Cause => decode_cause(desc, buf, list),
        ParamKind::Usi => decode_usi(desc, buf, list),
        ParamKind::Compat => decode_compat(desc, buf, list),
        ParamKind::Redirection => decode_redir(desc, buf, list),
        ParamKind::Name => decode_name(desc, buf, list),
    }
}

/// Raw fallback for unknown parameter codes
pub fn decode_raw_unknown(code: u8, buf: &[u8], list: &mut ParamList) -> Result<(), CodecError> {
    decode_raw(&format!("Param_{}", code), buf, list)
}

fn decode_raw(name: &str, buf: &[u8], list: &mut ParamList) -> Result<(), CodecError> {
    if buf.is_empty() {
        return Err(CodecError::BufferTooShort);
    }
    list.add_unique(name, to_hex(buf));
    Ok(())
}

fn decode_int(
    desc: &ParamDesc,
    buf: &[u8],
    list: &mut ParamList,
    dict: Option<&'static Dict>,
) -> Result<(), CodecError> {
    let mut val: u32 = 0;
    for b in buf {
        val = (val << 8) | *b as u32;
    }
    let name = list.add_unique(desc.name, "");
    let text = match dict {
        Some(d) => dict_name(d, val),
        None => val.to_string(),
    };
    list.set(name, text);
    Ok(())
}

fn decode_flags(
    name: &str,
    buf: &[u8],
    list: &mut ParamList,
    defs: &[FlagDef],
) -> Result<(), CodecError> {
    if buf.is_empty() || buf.len() > 4 {
        return Err(CodecError::BufferTooShort);
    }
    // Indicator octets assemble little-endian
    let mut val = 0u32;
    for (i, b) in buf.iter().enumerate() {
        val |= (*b as u32) << (8 * i);
    }
    let name = list.add_unique(name, "");
    list.set(name, flags_to_text(defs, val));
    Ok(())
}

fn decode_digits(
    desc: &ParamDesc,
    buf: &[u8],
    list: &mut ParamList,
    ctx: &DecodeCtx,
) -> Result<(), CodecError> {
    let mut buf = buf;
    let mut qualifier = 0u8;
    if desc.param == Param::GenericNumber {
        if buf.len() < 3 {
            return Err(CodecError::BufferTooShort);
        }
        qualifier = buf[0];
        buf = &buf[1..];
    }
    if buf.len() < 2 {
        return Err(CodecError::BufferTooShort);
    }
    let nai = buf[0] & 0x7f;
    let odd = buf[0] & 0x80 != 0;
    let plan = (buf[1] >> 4) & 7;
    let pres = (buf[1] >> 2) & 3;
    let scrn = buf[1] & 3;
    let digits = get_digits(odd, &buf[2..], ctx.ignore_unknown_digits);
    debug!(param = desc.name, digits, nai, plan, "decoded digit string");
    let base = list.add_unique(desc.name, digits);
    if desc.param == Param::GenericNumber {
        add_keyword(list, format!("{}.qualifier", base), DICT_QUAL, qualifier as u32);
    }
    add_keyword(list, format!("{}.nature", base), DICT_NAI, nai as u32);
    add_keyword(list, format!("{}.plan", base), DICT_NUM_PLAN, plan as u32);
    match desc.param {
        Param::CalledPartyNumber | Param::RedirectionNumber | Param::LocationNumber => {
            list.add(format!("{}.inn", base), (buf[1] & 0x80 == 0).to_string());
        }
        Param::CallingPartyNumber | Param::GenericNumber => {
            list.add(format!("{}.complete", base), (buf[1] & 0x80 == 0).to_string());
        }
        _ => {}
    }
    if matches!(
        desc.param,
        Param::CallingPartyNumber
            | Param::RedirectingNumber
            | Param::OriginalCalledNumber
            | Param::LocationNumber
            | Param::ConnectedNumber
            | Param::GenericNumber
    ) {
        add_keyword(list, format!("{}.restrict", base), DICT_PRESENTATION, pres as u32);
    }
    if matches!(
        desc.param,
        Param::CallingPartyNumber | Param::LocationNumber | Param::ConnectedNumber | Param::GenericNumber
    ) {
        add_keyword(list, format!("{}.screened", base), DICT_SCREENING, scrn as u32);
    }
    Ok(())
}

fn decode_subseq(
    desc: &ParamDesc,
    buf: &[u8],
    list: &mut ParamList,
    ctx: &DecodeCtx,
) -> Result<(), CodecError> {
    if buf.is_empty() {
        return Err(CodecError::BufferTooShort);
    }
    let odd = buf[0] & 0x80 != 0;
    let digits = get_digits(odd, &buf[1..], ctx.ignore_unknown_digits);
    list.add_unique(desc.name, digits);
    Ok(())
}

fn decode_range_status(desc: &ParamDesc, buf: &[u8], list: &mut ParamList) -> Result<(), CodecError> {
    if buf.is_empty() {
        return Err(CodecError::BufferTooShort);
    }
    // 1st octet is the range code (range - 1)
    let range = buf[0] as u32 + 1;
    let status = &buf[1..];
    let base = list.add_unique(desc.name, range.to_string());
    if !status.is_empty() {
        let mut map = String::new();
        for bit in 0..range {
            let octet = (bit / 8) as usize;
            if octet >= status.len() {
                break;
            }
            let mask = 1u8 << (bit % 8);
            map.push(if status[octet] & mask != 0 { '1' } else { '0' });
        }
        list.add(format!("{}.map", base), map);
    }
    Ok(())
}

fn decode_notification(
    desc: &ParamDesc,
    buf: &[u8],
    list: &mut ParamList,
    dict: &'static Dict,
) -> Result<(), CodecError> {
    if buf.is_empty() {
        return Err(CodecError::BufferTooShort);
    }
    let mut flags = String::new();
    for b in buf {
        let val = (b & 0x7f) as u32;
        if !flags.is_empty() {
            flags.push(',');
        }
        flags.push_str(&dict_name(dict, val));
        if b & 0x80 != 0 {
            break;
        }
    }
    list.add_unique(desc.name, flags);
    Ok(())
}

fn decode_cause(desc: &ParamDesc, buf: &[u8], list: &mut ParamList) -> Result<(), CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::BufferTooShort);
    }
    let base = list.add_unique(desc.name, "");
    // Byte 0: coding standard (bits 5-6), location (bits 0-3)
    let coding = (buf[0] & 0x60) >> 5;
    add_keyword(list, format!("{}.coding", base), DICT_CODING, coding as u32);
    add_keyword(list, format!("{}.location", base), DICT_LOCATION, (buf[0] & 0x0f) as u32);
    let mut crt = 1usize;
    if buf[0] & 0x80 == 0 {
        // Extension bit clear: a recommendation octet follows (not expected for ISUP)
        let rec = buf[1] & 0x7f;
        if rec != 0 {
            list.add(format!("{}.rec", base), rec.to_string());
        }
        crt = 2;
    }
    if crt >= buf.len() {
        return Err(CodecError::BufferTooShort);
    }
    let value = (buf[crt] & 0x7f) as u32;
    let text = if coding == 0 { dict_name(DICT_CAUSE_CCITT, value) } else { value.to_string() };
    list.set(base.clone(), text);
    crt += 1;
    if crt < buf.len() {
        list.add(format!("{}.diagnostic", base), to_hex(&buf[crt..]));
    }
    Ok(())
}

fn decode_usi(desc: &ParamDesc, buf: &[u8], list: &mut ParamList) -> Result<(), CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::BufferTooShort);
    }
    let base = list.add_unique(desc.name, "");
    // Byte 0: coding standard (bits 5-6), transfer capability (bits 0-4)
    // Byte 1: transfer mode (bits 5-6), transfer rate (bits 0-4)
    let coding = (buf[0] & 0x60) >> 5;
    add_keyword(list, format!("{}.coding", base), DICT_CODING, coding as u32);
    add_keyword(list, format!("{}.transfercap", base), DICT_TRANSFER_CAP, (buf[0] & 0x1f) as u32);
    add_keyword(list, format!("{}.transfermode", base), DICT_TRANSFER_MODE, ((buf[1] & 0x60) >> 5) as u32);
    let rate = buf[1] & 0x1f;
    add_keyword(list, format!("{}.transferrate", base), DICT_TRANSFER_RATE, rate as u32);
    let mut crt = 2usize;
    if rate == 0x18 {
        // Multirate carries a rate multiplier octet
        if buf.len() < 3 {
            return Err(CodecError::BufferTooShort);
        }
        list.add(format!("{}.multiplier", base), (buf[2] & 0x7f).to_string());
        crt = 3;
    }
    if crt < buf.len() {
        let ident = (buf[crt] & 0x60) >> 5;
        if ident == 1 {
            let text = dict_name(DICT_FORMAT, (buf[crt] & 0x1f) as u32);
            list.set(base, text);
        } else {
            debug!(param = desc.name, ident, "unexpected layer identifier in bearer capability");
        }
    }
    Ok(())
}

fn decode_compat(desc: &ParamDesc, buf: &[u8], list: &mut ParamList) -> Result<(), CodecError> {
    if buf.is_empty() {
        return Err(CodecError::BufferTooShort);
    }
    match desc.param {
        Param::MessageCompatInformation => {
            let base = list.add_unique(desc.name, flags_to_text(FLAGS_MSGCOMPAT, buf[0] as u32));
            if buf[0] & 0x80 != 0 {
                if buf.len() == 1 {
                    return Ok(());
                }
                return Err(CodecError::InvalidValue(
                    "extension bit set with trailing data".to_string(),
                ));
            }
            // Extension octets up to and including the first with the high bit set
            let ext = &buf[1..];
            let count = ext.iter().position(|b| b & 0x80 != 0).map(|p| p + 1);
            match count {
                Some(n) => {
                    list.add(format!("{}.more", base), to_hex(&ext[..n]));
                    Ok(())
                }
                None => Err(CodecError::InvalidValue("missing extension terminator".to_string())),
            }
        }
        Param::ParameterCompatInformation => {
            let base = "ParameterCompatInformation".to_string();
            let mut i = 0usize;
            while i < buf.len() {
                let code = buf[i];
                i += 1;
                if i >= buf.len() {
                    return Err(CodecError::BufferTooShort);
                }
                let sub = match desc_by_code(code) {
                    Some(d) => format!("{}.{}", base, d.name),
                    None => format!("{}.{}", base, code),
                };
                list.add(sub.clone(), flags_to_text(FLAGS_PARAMCOMPAT, buf[i] as u32));
                let ext_set = buf[i] & 0x80 != 0;
                i += 1;
                if ext_set {
                    continue;
                }
                let ext = &buf[i..];
                let count = ext
                    .iter()
                    .position(|b| b & 0x80 != 0)
                    .map(|p| p + 1)
                    .ok_or_else(|| CodecError::InvalidValue("missing extension terminator".to_string()))?;
                list.add(format!("{}.more", sub), to_hex(&ext[..count]));
                i += count;
            }
            // Raw copy kept so the parameter can be re-encoded verbatim
            decode_raw(desc.name, buf, list)
        }
        _ => Err(CodecError::InvalidValue("not a compatibility parameter".to_string())),
    }
}

fn decode_redir(desc: &ParamDesc, buf: &[u8], list: &mut ParamList) -> Result<(), CodecError> {
    if buf.is_empty() {
        return Err(CodecError::BufferTooShort);
    }
    let base = list.add_unique(desc.name, dict_name(DICT_REDIR_MAIN, (buf[0] & 0x07) as u32));
    let reason = buf[0] >> 4;
    if reason != 0 {
        add_keyword(list, format!("{}.reason_original", base), DICT_REDIR_REASON, reason as u32);
    }
    if buf.len() > 1 {
        let cnt = buf[1] & 0x07;
        if cnt != 0 {
            list.add(format!("{}.counter", base), cnt.to_string());
        }
        let reason = buf[1] >> 4;
        if reason != 0 {
            add_keyword(list, format!("{}.reason", base), DICT_REDIR_REASON, reason as u32);
        }
    }
    Ok(())
}

fn decode_name(desc: &ParamDesc, buf: &[u8], list: &mut ParamList) -> Result<(), CodecError> {
    if buf.is_empty() {
        return Err(CodecError::BufferTooShort);
    }
    let text = String::from_utf8_lossy(&buf[1..]).into_owned();
    let base = list.add_unique(desc.name, text);
    list.add(format!("{}.available", base), (buf[0] & 0x10 == 0).to_string());
    add_keyword(list, format!("{}.qualifier", base), DICT_QUAL_NAME, (buf[0] & 0xe0) as u32);
    add_keyword(list, format!("{}.restrict", base), DICT_PRESENTATION, (buf[0] & 0x03) as u32);
    Ok(())
}

/// Encode a parameter value to its wire payload (no type or length prefix).
///
/// `name` is the entry name in the list, usually `desc.name`. Fixed-size
/// parameters always produce exactly `desc.size` octets, defaulting missing
/// values; variable-size parameters fail on missing/invalid values.
pub fn encode_param(desc: &ParamDesc, name: &str, list: &ParamList) -> Result<Vec<u8>, CodecError> {
    let out = match desc.kind {
        ParamKind::Raw => encode_raw(desc, name, list)?,
        ParamKind::Int(dict) => encode_int(desc, name, list, dict)?,
        ParamKind::Flags(defs) => encode_flags(desc, name, list, defs)?,
        ParamKind::Digits => encode_digits(desc, name, list)?,
        ParamKind::Subsequent => encode_subseq(name, list)?,
        ParamKind::RangeStatus => encode_range_status(name, list)?,
        ParamKind::Notification(dict) => encode_notification(name, list, dict)?,
        ParamKind::Cause => encode_cause(name, list)?,
        ParamKind::Usi => encode_usi(name, list)?,
        ParamKind::Compat => encode_raw(desc, name, list)?,
        ParamKind::Redirection => encode_redir(name, list)?,
        ParamKind::Name => encode_name(name, list)?,
    };
    if desc.size != 0 && out.len() != desc.size as usize {
        return Err(CodecError::FixedSizeMismatch { expected: desc.size, got: out.len() });
    }
    if out.is_empty() || out.len() > 254 {
        return Err(CodecError::InvalidValue(format!("{} payload length {}", desc.name, out.len())));
    }
    Ok(out)
}

fn encode_raw(desc: &ParamDesc, name: &str, list: &ParamList) -> Result<Vec<u8>, CodecError> {
    let text = list.get(name).ok_or(CodecError::InvalidValue(format!("{} missing", name)))?;
    let raw = from_hex(text).ok_or_else(|| CodecError::InvalidValue(format!("{} not hex", name)))?;
    if desc.size != 0 && raw.len() != desc.size as usize {
        return Err(CodecError::FixedSizeMismatch { expected: desc.size, got: raw.len() });
    }
    Ok(raw)
}

fn encode_int(
    desc: &ParamDesc,
    name: &str,
    list: &ParamList,
    dict: Option<&'static Dict>,
) -> Result<Vec<u8>, CodecError> {
    let val = match list.get(name) {
        Some(text) => match dict {
            Some(d) => dict_parse(d, text, 0),
            None => text.parse::<u32>().unwrap_or(0),
        },
        None => 0,
    };
    let n = desc.size.max(1) as usize;
    let mut out = vec![0u8; n];
    let mut v = val;
    for i in (0..n).rev() {
        out[i] = (v & 0xff) as u8;
        v >>= 8;
    }
    Ok(out)
}

fn encode_flags(
    desc: &ParamDesc,
    name: &str,
    list: &ParamList,
    defs: &[FlagDef],
) -> Result<Vec<u8>, CodecError> {
    let val = list.get(name).map(|t| flags_from_text(defs, t)).unwrap_or(0);
    let n = desc.size.max(1) as usize;
    let mut out = Vec::with_capacity(n);
    let mut v = val;
    for _ in 0..n {
        out.push((v & 0xff) as u8);
        v >>= 8;
    }
    Ok(out)
}

fn encode_digits(desc: &ParamDesc, name: &str, list: &ParamList) -> Result<Vec<u8>, CodecError> {
    let digits = list.get(name).unwrap_or("");
    let nai = dict_parse(DICT_NAI, &list.get_or(&format!("{}.nature", name), "unknown"), 2) as u8;
    let plan = dict_parse(DICT_NUM_PLAN, &list.get_or(&format!("{}.plan", name), "isdn"), 1) as u8;
    let mut b2 = (plan & 7) << 4;
    match desc.param {
        Param::CalledPartyNumber | Param::RedirectionNumber | Param::LocationNumber => {
            if !list.get_bool(&format!("{}.inn", name), true) {
                b2 |= 0x80;
            }
        }
        Param::CallingPartyNumber | Param::GenericNumber => {
            if !list.get_bool(&format!("{}.complete", name), true) {
                b2 |= 0x80;
            }
        }
        _ => {}
    }
    if matches!(
        desc.param,
        Param::CallingPartyNumber
            | Param::RedirectingNumber
            | Param::OriginalCalledNumber
            | Param::LocationNumber
            | Param::ConnectedNumber
            | Param::GenericNumber
    ) {
        let pres = dict_parse(DICT_PRESENTATION, &list.get_or(&format!("{}.restrict", name), "allowed"), 0);
        b2 |= ((pres & 3) as u8) << 2;
    }
    if matches!(
        desc.param,
        Param::CallingPartyNumber | Param::LocationNumber | Param::ConnectedNumber | Param::GenericNumber
    ) {
        let scrn = dict_parse(DICT_SCREENING, &list.get_or(&format!("{}.screened", name), "user-provided"), 0);
        b2 |= (scrn & 3) as u8;
    }
    let (odd, packed) = set_digits(digits);
    let mut out = Vec::with_capacity(packed.len() + 3);
    if desc.param == Param::GenericNumber {
        let qual = dict_parse(DICT_QUAL, &list.get_or(&format!("{}.qualifier", name), "dialed-digits"), 0);
        out.push(qual as u8);
    }
    out.push(if odd { nai | 0x80 } else { nai & 0x7f });
    out.push(b2);
    out.extend_from_slice(&packed);
    Ok(out)
}

fn encode_subseq(name: &str, list: &ParamList) -> Result<Vec<u8>, CodecError> {
    let digits = list.get(name).unwrap_or("");
    let (odd, packed) = set_digits(digits);
    let mut out = Vec::with_capacity(packed.len() + 1);
    out.push(if odd { 0x80 } else { 0 });
    out.extend_from_slice(&packed);
    Ok(out)
}

fn encode_range_status(name: &str, list: &ParamList) -> Result<Vec<u8>, CodecError> {
    let range: u32 = list
        .get(name)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| CodecError::InvalidValue(format!("{} missing range", name)))?;
    // Q.763 3.43: sent range value must be in 1..=256
    if !(1..=256).contains(&range) {
        return Err(CodecError::InvalidValue(format!("range {}", range)));
    }
    let mut out = vec![(range - 1) as u8];
    if let Some(map) = list.get(&format!("{}.map", name)) {
        if !map.is_empty() {
            let bits = map.len().min(256);
            let mut octet = 0u8;
            for (i, c) in map.chars().take(bits).enumerate() {
                if c != '0' {
                    octet |= 1 << (i % 8);
                }
                if i % 8 == 7 {
                    out.push(octet);
                    octet = 0;
                }
            }
            if bits % 8 != 0 {
                out.push(octet);
            }
        }
    }
    Ok(out)
}

fn encode_notification(name: &str, list: &ParamList, dict: &'static Dict) -> Result<Vec<u8>, CodecError> {
    let text = list.get(name).ok_or(CodecError::InvalidValue(format!("{} missing", name)))?;
    let mut out = Vec::new();
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let v = crate::types::dict_value(dict, part)
            .or_else(|| part.parse::<u32>().ok())
            .filter(|v| *v < 0x80);
        if let Some(v) = v {
            out.push(v as u8);
        }
    }
    if out.is_empty() {
        return Err(CodecError::InvalidValue(format!("{} has no valid notifications", name)));
    }
    *out.last_mut().unwrap() |= 0x80;
    Ok(out)
}

fn encode_cause(name: &str, list: &ParamList) -> Result<Vec<u8>, CodecError> {
    let coding = dict_parse(DICT_CODING, &list.get_or(&format!("{}.coding", name), "CCITT"), 0) & 0x03;
    // Missing location defaults to "BI" (beyond interworking)
    let loc = dict_parse(DICT_LOCATION, &list.get_or(&format!("{}.location", name), "BI"), 0x0a);
    let default = if coding == 0 { 0x10 } else { 0 };
    let val = list
        .get(name)
        .map(|t| {
            if coding == 0 {
                dict_parse(DICT_CAUSE_CCITT, t, default)
            } else {
                t.parse::<u32>().unwrap_or(default)
            }
        })
        .unwrap_or(default);
    let mut out = vec![
        0x80 | ((coding as u8) << 5) | (loc as u8 & 0x0f),
        0x80 | (val as u8 & 0x7f),
    ];
    if let Some(diag) = list.get(&format!("{}.diagnostic", name)) {
        if let Some(bytes) = from_hex(diag) {
            out.extend_from_slice(&bytes);
        }
    }
    Ok(out)
}

fn encode_usi(name: &str, list: &ParamList) -> Result<Vec<u8>, CodecError> {
    let coding = dict_parse(DICT_CODING, &list.get_or(&format!("{}.coding", name), "CCITT"), 0) & 0x03;
    let cap = dict_parse(DICT_TRANSFER_CAP, &list.get_or(&format!("{}.transfercap", name), "speech"), 0);
    let mode = dict_parse(DICT_TRANSFER_MODE, &list.get_or(&format!("{}.transfermode", name), "circuit"), 0) & 0x03;
    let rate = dict_parse(DICT_TRANSFER_RATE, &list.get_or(&format!("{}.transferrate", name), "64kbit"), 0x10);
    let mut out = vec![
        0x80 | ((coding as u8) << 5) | (cap as u8 & 0x1f),
        0x80 | ((mode as u8) << 5) | (rate as u8 & 0x1f),
    ];
    if rate == 0x18 {
        let mult = list.get_int(&format!("{}.multiplier", name), 0);
        out.push(0x80 | (mult as u8 & 0x7f));
    }
    if let Some(fmt) = list.get(name) {
        if let Some(v) = crate::types::dict_value(DICT_FORMAT, fmt).or_else(|| fmt.parse().ok()) {
            // Layer 1 identifier (bits 5-6 = 01) plus the protocol value
            out.push(0x80 | 0x20 | (v as u8 & 0x1f));
        }
    }
    Ok(out)
}

fn encode_redir(name: &str, list: &ParamList) -> Result<Vec<u8>, CodecError> {
    let main = dict_parse(DICT_REDIR_MAIN, &list.get_or(name, "none"), 0) & 0x07;
    let orig = dict_parse(DICT_REDIR_REASON, &list.get_or(&format!("{}.reason_original", name), ""), 0) & 0x0f;
    let counter = (list.get_int(&format!("{}.counter", name), 0) & 0x07) as u32;
    let reason = dict_parse(DICT_REDIR_REASON, &list.get_or(&format!("{}.reason", name), ""), 0) & 0x0f;
    Ok(vec![(main | (orig << 4)) as u8, (counter | (reason << 4)) as u8])
}

fn encode_name(name: &str, list: &ParamList) -> Result<Vec<u8>, CodecError> {
    let text = list.get(name).ok_or(CodecError::InvalidValue(format!("{} missing", name)))?;
    if text.len() >= 127 {
        return Err(CodecError::InvalidValue(format!("name too long: {}", text.len())));
    }
    let mut b0 = 3u8;
    if !list.get_bool(&format!("{}.available", name), true) {
        b0 |= 0x10;
    }
    b0 = (b0 & 0x1f)
        | (dict_parse(DICT_QUAL_NAME, &list.get_or(&format!("{}.qualifier", name), ""), (b0 & 0xe0) as u32) as u8 & 0xe0);
    b0 = (b0 & 0xfc)
        | (dict_parse(DICT_PRESENTATION, &list.get_or(&format!("{}.restrict", name), ""), (b0 & 0x03) as u32) as u8 & 0x03);
    let mut out = Vec::with_capacity(text.len() + 1);
    out.push(b0);
    out.extend_from_slice(text.as_bytes());
    Ok(out)
}
