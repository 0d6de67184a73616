// BLE transport over the Nordic UART service.
//
// The hub exposes the usual NUS layout: one characteristic the host
// subscribes to for device->host notifications, one the host writes for
// host->device traffic. Notifications land in an internal byte channel
// that `read` drains, so the Transport contract looks the same as serial.
//
// Service UUID: 6e400001-b5a3-f393-e0a9-e50e24dcca9e
// TX (notify):  6e400003-b5a3-f393-e0a9-e50e24dcca9e (device -> host)
// RX (write):   6e400002-b5a3-f393-e0a9-e50e24dcca9e (host -> device)

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::Transport;
use crate::error::TransportError;

// ============================================================================
// Constants
// ============================================================================

/// Build a 128-bit UUID from the same 5-field encoding used by Zephyr's
/// BT_UUID_128_ENCODE macro.
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

/// Nordic UART service
const UART_SERVICE_UUID: Uuid =
    uuid_from_fields(0x6e400001, 0xb5a3, 0xf393, 0xe0a9, 0xe50e24dcca9e);

/// Device -> host notifications
const UART_TX_CHAR_UUID: Uuid =
    uuid_from_fields(0x6e400003, 0xb5a3, 0xf393, 0xe0a9, 0xe50e24dcca9e);

/// Host -> device writes
const UART_RX_CHAR_UUID: Uuid =
    uuid_from_fields(0x6e400002, 0xb5a3, 0xf393, 0xe0a9, 0xe50e24dcca9e);

/// Conservative notify/write payload ceiling. BLE links below a negotiated
/// MTU carry 20 data bytes per write, hence the framed wire shape.
const BLE_PAYLOAD_CEILING: usize = 20;

// ============================================================================
// Shared adapter state
// ============================================================================

struct BleAdapterState {
    manager: Option<Manager>,
    adapter: Option<Adapter>,
}

static BLE_ADAPTER: Lazy<Arc<Mutex<BleAdapterState>>> = Lazy::new(|| {
    Arc::new(Mutex::new(BleAdapterState {
        manager: None,
        adapter: None,
    }))
});

/// Initialise the BLE manager and adapter if not already done.
async fn ensure_adapter() -> Result<Adapter, TransportError> {
    let mut state = BLE_ADAPTER.lock().await;
    if let Some(adapter) = state.adapter.clone() {
        return Ok(adapter);
    }
    let manager = Manager::new()
        .await
        .map_err(|e| TransportError::Io(format!("BLE manager init failed: {e}")))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| TransportError::Io(format!("Failed to list BLE adapters: {e}")))?;
    let adapter = adapters
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::Io("No BLE adapter found".into()))?;
    state.adapter = Some(adapter.clone());
    state.manager = Some(manager);
    Ok(adapter)
}

// ============================================================================
// Configuration
// ============================================================================

/// BLE link configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BleLinkConfig {
    /// Device name prefix to match when the UART service is not in the
    /// advertisement (CoreBluetooth does not reliably surface 128-bit
    /// UUIDs in scan response data).
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// How long to scan before giving up.
    #[serde(default = "default_scan_ms")]
    pub scan_ms: u64,
}

fn default_name_prefix() -> String {
    "ESP32".to_string()
}

fn default_scan_ms() -> u64 {
    10_000
}

impl Default for BleLinkConfig {
    fn default() -> Self {
        BleLinkConfig {
            name_prefix: default_name_prefix(),
            scan_ms: default_scan_ms(),
        }
    }
}

// ============================================================================
// Transport implementation
// ============================================================================

pub struct BleTransport {
    peripheral: Option<Peripheral>,
    write_char: Characteristic,
    notify_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl BleTransport {
    /// Scan for a hub advertising the UART service (or matching the name
    /// prefix), connect, and subscribe to notifications.
    pub async fn open(config: &BleLinkConfig) -> Result<Self, TransportError> {
        let adapter = ensure_adapter().await?;

        // Unfiltered scan, application-side matching - CoreBluetooth does
        // not reliably match 128-bit UUIDs in scan response data.
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::Io(format!("Failed to start BLE scan: {e}")))?;

        let peripheral = find_peripheral(&adapter, config).await;
        let _ = adapter.stop_scan().await;
        let peripheral = peripheral?;

        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Io(format!("BLE connect failed: {e}")))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::Io(format!("Service discovery failed: {e}")))?;

        let chars = peripheral.characteristics();
        let notify_char = chars
            .iter()
            .find(|c| c.uuid == UART_TX_CHAR_UUID)
            .cloned()
            .ok_or_else(|| TransportError::Io("UART notify characteristic not found".into()))?;
        let write_char = chars
            .iter()
            .find(|c| c.uuid == UART_RX_CHAR_UUID)
            .cloned()
            .ok_or_else(|| TransportError::Io("UART write characteristic not found".into()))?;

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| TransportError::Io(format!("Subscribe failed: {e}")))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Io(format!("Notification stream failed: {e}")))?;

        // Forward notification payloads into the read channel. The stream
        // ends when the peripheral disconnects, which closes the channel
        // and surfaces as Disconnected on the next read.
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != UART_TX_CHAR_UUID {
                    continue;
                }
                if notify_tx.send(notification.value).is_err() {
                    break;
                }
            }
            tlog!("[ble] Notification stream ended");
        });

        tlog!("[ble] Connected to hub over UART service");

        Ok(BleTransport {
            peripheral: Some(peripheral),
            write_char,
            notify_rx,
        })
    }
}

/// Poll the adapter's peripheral list until a match shows up or the scan
/// window closes.
async fn find_peripheral(
    adapter: &Adapter,
    config: &BleLinkConfig,
) -> Result<Peripheral, TransportError> {
    let deadline = std::time::Instant::now() + Duration::from_millis(config.scan_ms);

    while std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(500)).await;

        let peripherals = match adapter.peripherals().await {
            Ok(p) => p,
            Err(e) => return Err(TransportError::Io(format!("BLE scan failed: {e}"))),
        };

        for peripheral in peripherals {
            let props = match peripheral.properties().await.ok().flatten() {
                Some(p) => p,
                None => continue,
            };

            let has_uart = props.services.contains(&UART_SERVICE_UUID);
            let name_match = props
                .local_name
                .as_deref()
                .map(|n| n.starts_with(&config.name_prefix))
                .unwrap_or(false);

            if has_uart || name_match {
                tlog!(
                    "[ble] Matched hub: {} (RSSI: {:?})",
                    props.local_name.as_deref().unwrap_or("<unnamed>"),
                    props.rssi
                );
                return Ok(peripheral);
            }
        }
    }

    Err(TransportError::Io(format!(
        "No hub found within {}ms",
        config.scan_ms
    )))
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let peripheral = self
            .peripheral
            .as_ref()
            .ok_or_else(|| TransportError::Io("transport closed".into()))?;

        // MTU-sized slices; the framer's length prefix reassembles them
        for chunk in bytes.chunks(BLE_PAYLOAD_CEILING) {
            peripheral
                .write(&self.write_char, chunk, WriteType::WithoutResponse)
                .await
                .map_err(|e| {
                    TransportError::Disconnected(format!("BLE write failed: {e}"))
                })?;
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.peripheral.is_none() {
            return Err(TransportError::Io("transport closed".into()));
        }
        match tokio::time::timeout(timeout, self.notify_rx.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(TransportError::Disconnected(
                "BLE notification stream closed".into(),
            )),
            Err(_) => Ok(Vec::new()), // idle timeout
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(peripheral) = self.peripheral.take() {
            let _ = peripheral.disconnect().await;
            tlog!("[ble] Disconnected");
        }
        self.notify_rx.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.peripheral.is_some()
    }

    fn payload_ceiling(&self) -> Option<usize> {
        Some(BLE_PAYLOAD_CEILING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_from_fields_matches_uart_service() {
        assert_eq!(
            UART_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            UART_TX_CHAR_UUID.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            UART_RX_CHAR_UUID.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_config_defaults() {
        let cfg = BleLinkConfig::default();
        assert_eq!(cfg.name_prefix, "ESP32");
        assert_eq!(cfg.scan_ms, 10_000);
    }
}
