// Hub-side command loop.
//
// One JSON document in, zero or more JSON documents out. The discovery
// trigger starts a scan; every other command is opaque to the hub and is
// forwarded straight onto the broadcast radio with an acknowledgement back
// to the client. Garbled input gets an error message and the loop keeps
// running - a malformed line from the client must never take the hub down.

use std::time::Instant;

use crate::config::LinkConfig;
use crate::protocol::{
    parse_request, AckStatus, DeviceRecord, HubMessage, DISCOVERY_COMMAND,
};
use crate::scan::{BroadcastRadio, DeviceScanCoordinator, ScanOutcome};

pub struct HubService<R: BroadcastRadio> {
    scan: DeviceScanCoordinator,
    radio: R,
    mode: String,
    mac: String,
    ready_sent: bool,
}

impl<R: BroadcastRadio> HubService<R> {
    pub fn new(config: &LinkConfig, radio: R, mode: &str, mac: &str) -> Self {
        HubService {
            scan: DeviceScanCoordinator::new(config),
            radio,
            mode: mode.to_string(),
            mac: mac.to_string(),
            ready_sent: false,
        }
    }

    /// The one-time startup announcement. `None` once it has been taken.
    pub fn startup(&mut self) -> Option<HubMessage> {
        if self.ready_sent {
            return None;
        }
        self.ready_sent = true;
        tlog!("[hub] Ready ({} / {})", self.mode, self.mac);
        Some(HubMessage::Ready {
            mode: self.mode.clone(),
            mac: self.mac.clone(),
        })
    }

    /// Handle one line from the client. Replies that can be produced
    /// immediately (acks, errors) come back; scan results arrive later
    /// through `tick`.
    pub fn handle_line(&mut self, line: &str, now: Instant) -> Vec<HubMessage> {
        let request = match parse_request(line) {
            Ok(req) => req,
            Err(e) => {
                tlog!("[hub] Dropping garbled line: {}", e.detail);
                return vec![HubMessage::Error { message: e.detail }];
            }
        };

        if request.cmd == DISCOVERY_COMMAND {
            return match self.scan.start_scan(request.rssi, &mut self.radio, now) {
                Ok(()) => Vec::new(),
                Err(e) => vec![HubMessage::Error {
                    message: e.to_string(),
                }],
            };
        }

        // Opaque command: the hub only relays it
        let status = if self.radio.send_command(&request.cmd) {
            AckStatus::Sent
        } else {
            AckStatus::Failed
        };
        vec![HubMessage::Ack {
            command: request.cmd,
            status,
            rssi: request.rssi,
        }]
    }

    /// A discovery reply picked up off the radio.
    pub fn handle_discovery_reply(&mut self, record: DeviceRecord) {
        self.scan.handle_response(record);
    }

    /// Advance time-driven work. Returns any messages that became due.
    pub fn tick(&mut self, now: Instant) -> Vec<HubMessage> {
        match self.scan.tick(&mut self.radio, now) {
            Some(ScanOutcome::Complete(list)) => vec![HubMessage::Devices { list }],
            Some(ScanOutcome::WatchdogReset) => vec![HubMessage::Error {
                message: "scan reset by watchdog".to_string(),
            }],
            None => Vec::new(),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_scanning()
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_hub_message, RssiThreshold};
    use std::time::Duration;

    #[derive(Default)]
    struct RadioLog {
        discoveries: u32,
        commands: Vec<String>,
        accept: bool,
    }

    impl BroadcastRadio for RadioLog {
        fn send_discovery(&mut self) {
            self.discoveries += 1;
        }
        fn send_command(&mut self, command: &str) -> bool {
            self.commands.push(command.to_string());
            self.accept
        }
        fn pause_advertising(&mut self) {}
        fn resume_advertising(&mut self) {}
    }

    fn service(accept: bool) -> HubService<RadioLog> {
        let radio = RadioLog {
            accept,
            ..RadioLog::default()
        };
        HubService::new(
            &LinkConfig::default(),
            radio,
            "espnow",
            "aa:bb:cc:dd:ee:ff",
        )
    }

    #[test]
    fn test_startup_announces_ready_once() {
        let mut hub = service(true);
        let first = hub.startup().unwrap();
        assert_eq!(
            encode_hub_message(&first),
            r#"{"type":"ready","mode":"espnow","mac":"aa:bb:cc:dd:ee:ff"}"#
        );
        assert!(hub.startup().is_none());
    }

    #[test]
    fn test_ping_to_devices_end_to_end() {
        let mut hub = service(true);
        let t0 = Instant::now();

        // PING starts the scan; no immediate reply
        let replies = hub.handle_line(r#"{"cmd":"PING","rssi":"-70"}"#, t0);
        assert!(replies.is_empty());
        assert!(hub.is_scanning());
        assert_eq!(hub.radio_mut().discoveries, 1);

        // Redundant pings go out as the window advances
        hub.tick(t0 + Duration::from_millis(1000));
        hub.tick(t0 + Duration::from_millis(2000));
        assert_eq!(hub.radio_mut().discoveries, 3);

        // Replies trickle in, one of them a weaker duplicate
        hub.handle_discovery_reply(DeviceRecord {
            id: "p1".into(),
            mac: "11:22:33:44:55:66".into(),
            rssi: -55,
            battery: 80,
            kind: "plushie".into(),
        });
        hub.handle_discovery_reply(DeviceRecord {
            id: "p1".into(),
            mac: "11:22:33:44:55:66".into(),
            rssi: -72,
            battery: 80,
            kind: "plushie".into(),
        });
        hub.handle_discovery_reply(DeviceRecord {
            id: "weak".into(),
            mac: "99:99:99:99:99:99".into(),
            rssi: -90,
            battery: 10,
            kind: "plushie".into(),
        });

        // Window closes: one devices message, filtered and deduplicated
        let due = hub.tick(t0 + Duration::from_millis(5001));
        assert_eq!(due.len(), 1);
        match &due[0] {
            HubMessage::Devices { list } => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].id, "p1");
                assert_eq!(list[0].rssi, -55);
            }
            other => panic!("expected devices, got {other:?}"),
        }
        assert!(!hub.is_scanning());
    }

    #[test]
    fn test_opaque_command_forwarded_and_acked() {
        let mut hub = service(true);
        let replies = hub.handle_line(r#"{"cmd":"Notes","rssi":"all"}"#, Instant::now());
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0],
            HubMessage::Ack {
                command: "Notes".into(),
                status: AckStatus::Sent,
                rssi: RssiThreshold::All,
            }
        );
        assert_eq!(hub.radio_mut().commands, vec!["Notes"]);
    }

    #[test]
    fn test_radio_refusal_acks_failed() {
        let mut hub = service(false);
        let replies = hub.handle_line(r#"{"cmd":"Sleep","rssi":"-60"}"#, Instant::now());
        assert_eq!(
            replies[0],
            HubMessage::Ack {
                command: "Sleep".into(),
                status: AckStatus::Failed,
                rssi: RssiThreshold::Min(-60),
            }
        );
    }

    #[test]
    fn test_garbled_line_is_error_and_loop_survives() {
        let mut hub = service(true);
        let t = Instant::now();
        let replies = hub.handle_line("{{{nonsense", t);
        assert!(matches!(replies[0], HubMessage::Error { .. }));

        // Still fully operational afterwards
        let replies = hub.handle_line(r#"{"cmd":"PING"}"#, t);
        assert!(replies.is_empty());
        assert!(hub.is_scanning());
    }

    #[test]
    fn test_second_ping_during_scan_is_error() {
        let mut hub = service(true);
        let t0 = Instant::now();
        hub.handle_line(r#"{"cmd":"PING"}"#, t0);
        let replies = hub.handle_line(r#"{"cmd":"PING"}"#, t0 + Duration::from_millis(100));
        assert!(matches!(replies[0], HubMessage::Error { .. }));
        // The first scan is unharmed
        assert!(hub.is_scanning());
        assert_eq!(hub.radio_mut().discoveries, 1);
    }
}
