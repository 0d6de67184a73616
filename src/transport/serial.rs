// USB serial transport.
//
// Wraps a blocking serialport handle behind the async Transport trait.
// Opened at 115200 baud 8N1 by default, matching the hub firmware's
// console. Open failures are classified so a port held by another program
// (an IDE, a serial monitor) reports Busy rather than a generic I/O error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;

use super::Transport;
use crate::error::TransportError;

/// Serial link configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerialLinkConfig {
    /// Port path (e.g. "/dev/cu.usbmodem1101", "COM3").
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    115_200
}

pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    port_name: String,
}

impl SerialTransport {
    /// Open the configured port.
    pub fn open(config: &SerialLinkConfig) -> Result<Self, TransportError> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(|e| classify_open_error(&config.port, &e))?;

        tlog!(
            "[serial] Opened {} at {} baud",
            config.port,
            config.baud_rate
        );

        Ok(SerialTransport {
            port: Some(port),
            port_name: config.port.clone(),
        })
    }

    /// List candidate serial ports.
    ///
    /// On macOS, only /dev/cu.* (calling unit) devices are returned - the
    /// /dev/tty.* variants block on open waiting for carrier detect.
    pub fn list_ports() -> Result<Vec<String>, TransportError> {
        let ports = serialport::available_ports()
            .map_err(|e| TransportError::Io(format!("Failed to enumerate ports: {}", e)))?;

        Ok(ports
            .into_iter()
            .filter(|_p| {
                #[cfg(target_os = "macos")]
                {
                    !_p.port_name.starts_with("/dev/tty.")
                }
                #[cfg(not(target_os = "macos"))]
                {
                    true
                }
            })
            .map(|p| p.port_name)
            .collect())
    }
}

/// Map a serialport open failure onto the transport error taxonomy.
fn classify_open_error(port: &str, e: &serialport::Error) -> TransportError {
    let msg = e.to_string().to_lowercase();
    if msg.contains("busy") || msg.contains("in use") || msg.contains("resource busy") {
        return TransportError::Busy;
    }
    if msg.contains("denied") || msg.contains("permission") {
        return TransportError::Denied;
    }
    TransportError::Io(format!("Failed to open {}: {}", port, e))
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::Io("port closed".into()))?;
        let result = tokio::task::block_in_place(|| {
            use std::io::Write;
            port.write_all(bytes).and_then(|_| port.flush())
        });
        result.map_err(|e| classify_io_error(e))
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port_name = self.port_name.clone();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::Io("port closed".into()))?;

        // The handle keeps its minimal 1ms timeout for byte-level latency;
        // the requested timeout is honoured by polling until the deadline.
        let deadline = std::time::Instant::now() + timeout;
        let mut buf = [0u8; 256];
        let mut out = Vec::new();

        loop {
            let result = tokio::task::block_in_place(|| port.read(&mut buf));
            match result {
                Ok(0) => {
                    // EOF - device unplugged
                    return Err(TransportError::Disconnected(format!(
                        "{} reported end of stream",
                        port_name
                    )));
                }
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    // Keep draining whatever arrived together, then return
                    if n < buf.len() {
                        return Ok(out);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if !out.is_empty() || std::time::Instant::now() >= deadline {
                        return Ok(out);
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => return Err(classify_io_error(e)),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            tlog!("[serial] Closed {}", self.port_name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

/// Map a runtime I/O failure onto the transport error taxonomy. Anything
/// that suggests the device vanished classifies as a disconnect.
fn classify_io_error(e: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => {
            TransportError::Disconnected(e.to_string())
        }
        _ => {
            let msg = e.to_string().to_lowercase();
            if msg.contains("device") || msg.contains("no such file") || msg.contains("lost") {
                TransportError::Disconnected(e.to_string())
            } else {
                TransportError::Io(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_classification() {
        let busy = serialport::Error::new(
            serialport::ErrorKind::Io(std::io::ErrorKind::Other),
            "Resource busy",
        );
        assert!(matches!(
            classify_open_error("/dev/x", &busy),
            TransportError::Busy
        ));

        let denied = serialport::Error::new(
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
            "Permission denied",
        );
        assert!(matches!(
            classify_open_error("/dev/x", &denied),
            TransportError::Denied
        ));

        let other = serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad baud");
        assert!(matches!(
            classify_open_error("/dev/x", &other),
            TransportError::Io(_)
        ));
    }

    #[test]
    fn test_io_error_classification() {
        let gone = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(classify_io_error(gone).is_disconnect());

        let vanished = std::io::Error::new(std::io::ErrorKind::Other, "No such device");
        assert!(classify_io_error(vanished).is_disconnect());

        let plain = std::io::Error::new(std::io::ErrorKind::Other, "scrambled");
        assert!(!classify_io_error(plain).is_disconnect());
    }

    #[test]
    fn test_default_baud() {
        let cfg: SerialLinkConfig = serde_json::from_str(r#"{"port":"/dev/cu.usbmodem1"}"#).unwrap();
        assert_eq!(cfg.baud_rate, 115_200);
    }
}
