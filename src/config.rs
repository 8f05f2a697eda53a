//! Stack configuration

use crate::types::ProtocolVariant;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete signaling stack configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// ISUP call control configuration
    pub isup: IsupConfig,
    /// IAX2 engine configuration
    pub iax: IaxConfig,
}

/// ISUP layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsupConfig {
    /// Protocol variant (parameter tables, point code packing)
    pub variant: ProtocolVariant,
    /// Local (default) point code, "network-cluster-member"
    pub point_code: String,
    /// Remote point code
    pub remote_point_code: String,
    /// Circuit selection strategy
    pub strategy: String,
    /// Strategy parity restriction: "", "odd", "even", "odd-fallback", "even-fallback"
    pub strategy_restrict: String,
    /// Location sent in cause indicators
    pub location: String,
    /// Default numbering plan for built addresses
    pub number_plan: String,
    /// Default nature of address for built addresses
    pub number_type: String,
    /// Default address presentation
    pub presentation: String,
    /// Default address screening
    pub screening: String,
    /// Default calling party category
    pub caller_category: String,
    /// Default bearer format (UserServiceInformation layer 1)
    pub format: String,
    /// Default "internal network number" allowed indicator
    pub inn: bool,
    /// Report Ringing/Progress from early ACM backward indicators
    pub early_acm: bool,
    /// Maximum called digits sent in IAM before overlap sending takes over
    pub max_called_digits: usize,
    /// Maximum circuit replacements for one call attempt (clamped to 0..=31)
    pub max_replaces: u8,
    /// Ignore unknown address signals in received digit strings
    pub ignore_unknown_digits: bool,
    /// T1: REL retransmission (ms)
    pub t1_ms: u64,
    /// T5: release-wait, forces local release complete (ms)
    pub t5_ms: u64,
    /// T7: IAM acknowledgement wait (ms, clamped to 20000..=30000)
    pub t7_ms: u64,
    /// T9: answer wait (ms, 0 disables, otherwise clamped to 90000..=180000)
    pub t9_ms: u64,
    /// T12/T13: BLK retransmit / alert (ms)
    pub t12_ms: u64,
    pub t13_ms: u64,
    /// T14/T15: UBL retransmit / alert (ms)
    pub t14_ms: u64,
    pub t15_ms: u64,
    /// T16/T17: RSC retransmit / alert (ms)
    pub t16_ms: u64,
    pub t17_ms: u64,
    /// T18/T19: CGB retransmit / alert (ms)
    pub t18_ms: u64,
    pub t19_ms: u64,
    /// T20/T21: CGU retransmit / alert (ms)
    pub t20_ms: u64,
    pub t21_ms: u64,
    /// T27: continuity recheck wait (ms, clamped to 30000..=300000)
    pub t27_ms: u64,
    /// T34: segmentation wait (ms, clamped to 2000..=4000)
    pub t34_ms: u64,
    /// Local lock batch re-check interval (ms)
    pub lock_check_ms: u64,
    /// Periodic idle circuit reset interval (ms, 0 disables)
    pub channel_sync_ms: u64,
    /// Remote user part test interval (ms, 0 assumes remote available)
    pub user_part_test_ms: u64,
    /// Send group block/unblock requests when more than one circuit changed
    pub lock_group: bool,
    /// Duplicate CGB requests (ANSI behavior)
    pub duplicate_cgb: bool,
}

impl Default for IsupConfig {
    fn default() -> Self {
        Self {
            variant: ProtocolVariant::Itu,
            point_code: "1-1-1".to_string(),
            remote_point_code: "1-1-2".to_string(),
            strategy: "increment".to_string(),
            strategy_restrict: String::new(),
            location: "LN".to_string(),
            number_plan: "isdn".to_string(),
            number_type: "national".to_string(),
            presentation: "allowed".to_string(),
            screening: "user-provided".to_string(),
            caller_category: "ordinary".to_string(),
            format: "alaw".to_string(),
            inn: false,
            early_acm: true,
            max_called_digits: 16,
            max_replaces: 3,
            ignore_unknown_digits: true,
            t1_ms: 15_000,
            t5_ms: 300_000,
            t7_ms: 20_000,
            t9_ms: 0,
            t12_ms: 20_000,
            t13_ms: 300_000,
            t14_ms: 20_000,
            t15_ms: 300_000,
            t16_ms: 20_000,
            t17_ms: 300_000,
            t18_ms: 20_000,
            t19_ms: 300_000,
            t20_ms: 20_000,
            t21_ms: 300_000,
            t27_ms: 240_000,
            t34_ms: 3_000,
            lock_check_ms: 2_000,
            channel_sync_ms: 0,
            user_part_test_ms: 0,
            lock_group: true,
            duplicate_cgb: false,
        }
    }
}

impl IsupConfig {
    /// Apply the Q.764 min/max bounds once, at construction time
    pub fn validated(mut self) -> Self {
        self.t7_ms = self.t7_ms.clamp(20_000, 30_000);
        if self.t9_ms != 0 {
            self.t9_ms = self.t9_ms.clamp(90_000, 180_000);
        }
        self.t27_ms = self.t27_ms.clamp(30_000, 300_000);
        self.t34_ms = self.t34_ms.clamp(2_000, 4_000);
        self.max_replaces = self.max_replaces.min(31);
        if self.max_called_digits == 0 {
            self.max_called_digits = 16;
        }
        self
    }
}

/// IAX2 engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IaxConfig {
    /// Local bind address
    pub bind_address: String,
    /// Local UDP port (default 4569)
    pub port: u16,
    /// Full frame retransmission count (clamped to 1..=10)
    pub retrans_count: u8,
    /// Initial retransmission interval in ms (clamped to 200..=5000)
    pub retrans_interval_ms: u64,
    /// Incoming full frame queue cap per transaction (clamped to 1..=127)
    pub max_in_frames: u8,
    /// Maximum full frame payload length
    pub max_full_frame_data_len: u16,
    /// Authentication timeout (seconds)
    pub auth_timeout_secs: u16,
    /// Terminating transaction timeout (seconds)
    pub trans_timeout_secs: u16,
    /// Keepalive ping interval (ms)
    pub ping_interval_ms: u64,
    /// Preferred audio format bit
    pub format: u32,
    /// Audio capability bitmask
    pub capability: u32,
    /// Require authentication on incoming calls
    pub auth_required: bool,
    /// Shared secret for MD5 challenges
    pub secret: String,
    /// Trunk frame flush interval (ms)
    pub trunk_send_interval_ms: u64,
    /// Enable outbound trunking
    pub trunking: bool,
    /// Resync threshold for reconstructed trunk timestamps (ms)
    pub trunk_ts_resync_threshold_ms: u32,
}

impl Default for IaxConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 4569,
            retrans_count: 4,
            retrans_interval_ms: 500,
            max_in_frames: 100,
            max_full_frame_data_len: 1400,
            auth_timeout_secs: 30,
            trans_timeout_secs: 10,
            ping_interval_ms: 20_000,
            format: crate::iax::format::ALAW,
            capability: crate::iax::format::ALAW | crate::iax::format::MULAW | crate::iax::format::GSM,
            auth_required: false,
            secret: String::new(),
            trunk_send_interval_ms: 20,
            trunking: false,
            trunk_ts_resync_threshold_ms: 3_000,
        }
    }
}

impl IaxConfig {
    /// Apply retransmission and queue bounds once, at construction time
    pub fn validated(mut self) -> Self {
        self.retrans_count = self.retrans_count.clamp(1, 10);
        self.retrans_interval_ms = self.retrans_interval_ms.clamp(200, 5_000);
        self.max_in_frames = self.max_in_frames.clamp(1, 127);
        if self.max_full_frame_data_len < 96 {
            self.max_full_frame_data_len = 96;
        }
        if self.trunk_send_interval_ms == 0 {
            self.trunk_send_interval_ms = 20;
        }
        self
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs as u64)
    }

    pub fn trans_timeout(&self) -> Duration {
        Duration::from_secs(self.trans_timeout_secs as u64)
    }
}

impl SignalingConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> Result<Self, crate::SignalingError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::SignalingError::Config(e.to_string()))?;
        let cfg: Self = serde_json::from_str(&content)
            .map_err(|e| crate::SignalingError::Config(e.to_string()))?;
        Ok(cfg.validated())
    }

    pub fn validated(self) -> Self {
        Self { isup: self.isup.validated(), iax: self.iax.validated() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isup_timer_clamps() {
        let cfg = IsupConfig { t7_ms: 5, t27_ms: 1, t34_ms: 60_000, max_replaces: 99, ..Default::default() };
        let cfg = cfg.validated();
        assert_eq!(cfg.t7_ms, 20_000);
        assert_eq!(cfg.t27_ms, 30_000);
        assert_eq!(cfg.t34_ms, 4_000);
        assert_eq!(cfg.max_replaces, 31);
    }

    #[test]
    fn test_iax_retrans_clamps() {
        let cfg = IaxConfig { retrans_count: 0, retrans_interval_ms: 10, max_in_frames: 200, ..Default::default() };
        let cfg = cfg.validated();
        assert_eq!(cfg.retrans_count, 1);
        assert_eq!(cfg.retrans_interval_ms, 200);
        assert_eq!(cfg.max_in_frames, 127);
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = SignalingConfig::default().validated();
        assert_eq!(cfg.iax.retrans_count, 4);
        assert_eq!(cfg.iax.retrans_interval_ms, 500);
        assert_eq!(cfg.isup.t7_ms, 20_000);
    }
}
