// Redundant-broadcast device discovery.
//
// The radio is shared between advertising and discovery, and the broadcast
// medium drops packets, so a scan pauses advertising, sends the same
// discovery ping several times spaced apart, collects replies for a fixed
// window, then resumes advertising and reports the deduplicated list. All
// timing is injected through `Instant` parameters; nothing in here sleeps.

use std::collections::HashMap;
use std::time::Instant;

use crate::config::LinkConfig;
use crate::error::ScanBusyError;
use crate::protocol::{DeviceRecord, RssiThreshold};

// ============================================================================
// Radio seam
// ============================================================================

/// The hub's shared broadcast radio. One implementation sits on the real
/// radio; tests substitute a recorder.
pub trait BroadcastRadio: Send {
    /// Broadcast one discovery ping.
    fn send_discovery(&mut self);

    /// Forward an opaque command to the peripherals. Returns whether the
    /// radio accepted the transmission (delivery is never guaranteed).
    fn send_command(&mut self, command: &str) -> bool;

    /// Stop advertising while a scan owns the radio.
    fn pause_advertising(&mut self);

    fn resume_advertising(&mut self);
}

// ============================================================================
// Coordinator
// ============================================================================

/// How a scan ended.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanOutcome {
    /// Normal completion: the filtered, deduplicated device list.
    Complete(Vec<DeviceRecord>),
    /// The watchdog found the scan wedged and forced a reset. No list is
    /// produced; stale results are worse than none.
    WatchdogReset,
}

struct ScanSession {
    threshold: RssiThreshold,
    started_at: Instant,
    last_ping_at: Instant,
    pings_sent: u32,
    devices: HashMap<String, DeviceRecord>,
}

pub struct DeviceScanCoordinator {
    config: LinkConfig,
    session: Option<ScanSession>,
}

impl DeviceScanCoordinator {
    pub fn new(config: &LinkConfig) -> Self {
        DeviceScanCoordinator {
            config: config.clone(),
            session: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    /// Begin a scan: pause advertising, clear stale state, and send the
    /// first ping immediately. Rejected while a scan is already running -
    /// the running scan is left completely untouched.
    pub fn start_scan(
        &mut self,
        threshold: RssiThreshold,
        radio: &mut dyn BroadcastRadio,
        now: Instant,
    ) -> Result<(), ScanBusyError> {
        if self.session.is_some() {
            return Err(ScanBusyError);
        }

        radio.pause_advertising();
        radio.send_discovery();
        self.session = Some(ScanSession {
            threshold,
            started_at: now,
            last_ping_at: now,
            pings_sent: 1,
            devices: HashMap::new(),
        });
        tlog!("[scan] Scan started (threshold: {threshold})");
        Ok(())
    }

    /// Record a discovery reply. Replies outside a scan window are stale
    /// echoes and are dropped. Duplicate ids keep the strongest signal.
    pub fn handle_response(&mut self, record: DeviceRecord) {
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return,
        };
        match session.devices.get_mut(&record.id) {
            Some(existing) => {
                if record.rssi > existing.rssi {
                    *existing = record;
                }
            }
            None => {
                session.devices.insert(record.id.clone(), record);
            }
        }
    }

    /// Advance the scan clock: send redundant pings while they are due,
    /// finish at the scan deadline, and force a reset if the clock says
    /// the scan has been wedged past twice the deadline.
    pub fn tick(&mut self, radio: &mut dyn BroadcastRadio, now: Instant) -> Option<ScanOutcome> {
        let session = self.session.as_mut()?;

        // Watchdog first: a tick arriving this late means the driver
        // stalled, and the collected results are no longer trustworthy.
        if now.duration_since(session.started_at) > self.config.scan_timeout() * 2 {
            self.session = None;
            radio.resume_advertising();
            tlog!("[scan] Watchdog reset: scan exceeded twice its deadline");
            return Some(ScanOutcome::WatchdogReset);
        }

        if now.duration_since(session.started_at) > self.config.scan_timeout() {
            return Some(self.finish(radio));
        }

        if session.pings_sent < self.config.redundancy_count
            && now.duration_since(session.last_ping_at) >= self.config.ping_spacing()
        {
            radio.send_discovery();
            session.pings_sent += 1;
            session.last_ping_at = now;
        }

        None
    }

    /// Close out the session: resume advertising, apply the threshold
    /// filter, and hand back the final list.
    fn finish(&mut self, radio: &mut dyn BroadcastRadio) -> ScanOutcome {
        let session = match self.session.take() {
            Some(s) => s,
            None => return ScanOutcome::Complete(Vec::new()),
        };
        radio.resume_advertising();

        let mut list: Vec<DeviceRecord> = session
            .devices
            .into_values()
            .filter(|d| session.threshold.accepts(d.rssi))
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));

        tlog!(
            "[scan] Scan complete: {} device(s) after filter {}",
            list.len(),
            session.threshold
        );
        ScanOutcome::Complete(list)
    }
}
