// Link configuration.
//
// One struct carries every tunable the protocol engine uses, with the
// defaults matching the deployed hub firmware. All fields have serde
// defaults so a partial JSON config deserializes cleanly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Discard a partially assembled frame if no fragment arrives for this long.
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    /// Primary scan deadline - `finish` runs when a scan reaches this age.
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Minimum spacing between consecutive discovery broadcasts.
    #[serde(default = "default_ping_spacing_ms")]
    pub ping_spacing_ms: u64,
    /// Discovery broadcasts per scan. The broadcast medium drops packets,
    /// so the same ping goes out multiple times.
    #[serde(default = "default_redundancy_count")]
    pub redundancy_count: u32,
    /// Expected quiet period between scans. Not enforced by `start_scan` -
    /// callers are expected to wait this long between scans.
    #[serde(default = "default_scan_cooldown_ms")]
    pub scan_cooldown_ms: u64,
    /// Delay after stopping the read loop before an exclusive operation
    /// may start reading, letting the transport release its read lock.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Deadline for observing a REPL mode-change marker.
    #[serde(default = "default_marker_timeout_ms")]
    pub marker_timeout_ms: u64,
    /// Output is considered complete once no new bytes arrive for this long.
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,
    /// Ceiling on total execute-capture time.
    #[serde(default = "default_execute_timeout_ms")]
    pub execute_timeout_ms: u64,
    /// Break signals sent when interrupting, spaced `interrupt_spacing_ms` apart.
    #[serde(default = "default_interrupt_attempts")]
    pub interrupt_attempts: u32,
    #[serde(default = "default_interrupt_spacing_ms")]
    pub interrupt_spacing_ms: u64,
    /// How long to drain stale output after an interrupt.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Per-iteration read timeout for the continuous read loop.
    #[serde(default = "default_read_poll_ms")]
    pub read_poll_ms: u64,
    /// Largest payload the transport can carry in one write. `None` selects
    /// the unframed newline-JSON wire shape; `Some(n)` selects `MSG:` framing
    /// and slices writes to `n` bytes.
    #[serde(default)]
    pub mtu_payload_ceiling: Option<usize>,
}

fn default_frame_timeout_ms() -> u64 { 2_000 }
fn default_scan_timeout_ms() -> u64 { 5_000 }
fn default_ping_spacing_ms() -> u64 { 1_000 }
fn default_redundancy_count() -> u32 { 3 }
fn default_scan_cooldown_ms() -> u64 { 2_000 }
fn default_settle_delay_ms() -> u64 { 150 }
fn default_marker_timeout_ms() -> u64 { 3_000 }
fn default_quiescence_ms() -> u64 { 300 }
fn default_execute_timeout_ms() -> u64 { 10_000 }
fn default_interrupt_attempts() -> u32 { 3 }
fn default_interrupt_spacing_ms() -> u64 { 50 }
fn default_drain_timeout_ms() -> u64 { 1_000 }
fn default_read_poll_ms() -> u64 { 50 }

impl Default for LinkConfig {
    fn default() -> Self {
        // Round-trips through serde so the field defaults are the single
        // source of truth.
        serde_json::from_str("{}").expect("empty LinkConfig must deserialize")
    }
}

impl LinkConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
    pub fn ping_spacing(&self) -> Duration {
        Duration::from_millis(self.ping_spacing_ms)
    }
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
    pub fn marker_timeout(&self) -> Duration {
        Duration::from_millis(self.marker_timeout_ms)
    }
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }
    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }
    pub fn interrupt_spacing(&self) -> Duration {
        Duration::from_millis(self.interrupt_spacing_ms)
    }
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.frame_timeout_ms, 2_000);
        assert_eq!(cfg.scan_timeout_ms, 5_000);
        assert_eq!(cfg.redundancy_count, 3);
        assert_eq!(cfg.ping_spacing_ms, 1_000);
        assert!(cfg.mtu_payload_ceiling.is_none());
    }

    #[test]
    fn test_partial_config_deserializes() {
        let cfg: LinkConfig =
            serde_json::from_str(r#"{"scan_timeout_ms": 8000, "mtu_payload_ceiling": 20}"#)
                .unwrap();
        assert_eq!(cfg.scan_timeout_ms, 8_000);
        assert_eq!(cfg.mtu_payload_ceiling, Some(20));
        // Untouched fields keep their defaults
        assert_eq!(cfg.redundancy_count, 3);
    }
}
