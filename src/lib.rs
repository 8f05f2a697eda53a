//! # Trunksig
//!
//! Production-ready SS7 ISUP and IAX2 trunk signaling stack:
//!
//! - **ISUP** - ISDN User Part call control (Q.763/Q.764, ANSI T1.113)
//! - **Circuits** - trunk circuit groups with reservation strategies
//! - **IAX2** - Inter-Asterisk eXchange transaction engine
//!
//! Both protocol cores are synchronous state machines polled through
//! non-blocking `get_event` calls; socket pumps and timer ticks drive them
//! from tokio tasks. Outbound traffic leaves through transmit sinks so the
//! transport stays outside the protocol core.
//!
//! ## Example
//! ```rust,ignore
//! use trunksig::{SignalingConfig, IsupController, CircuitGroup};
//!
//! let cfg = SignalingConfig::from_file("signaling.json")?;
//! let group = std::sync::Arc::new(CircuitGroup::new(
//!     trunksig::Strategy::Increment, trunksig::Parity::Any));
//! group.insert_span("span1", 1, 31);
//! let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//! let isup = IsupController::new(cfg.isup, group, tx)?;
//! ```

pub mod circuit;
pub mod config;
pub mod errors;
pub mod iax;
pub mod isup;
pub mod types;

// Re-exports
pub use circuit::{CircuitGroup, CircuitStatus, Parity, Strategy};
pub use config::{IaxConfig, IsupConfig, SignalingConfig};
pub use errors::{CircuitError, CodecError, IaxError, IsupError, Result, SignalingError};
pub use iax::{IaxEngine, IaxEvent, IaxEventKind, TransState, TransType};
pub use isup::{CallEvent, CallState, IsupCall, IsupController, IsupMessage};
pub use types::{ParamList, PointCode, ProtocolVariant, RoutingLabel};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default UDP port for IAX2
pub const DEFAULT_IAX_PORT: u16 = 4569;
