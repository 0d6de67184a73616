// hublink - protocol engine bridging a control application to a wireless
// hub microcontroller over USB serial or BLE, and through it to a fleet of
// broadcast-radio peripherals.
//
// The crate has two halves. The firmware-control side (`repl`, `upload`)
// drives the hub's MicroPython interpreter for identity queries and file
// pushes. The runtime side (`framing`, `protocol`, `scan`, `hub`,
// `supervisor`) frames messages on MTU-limited links, dispatches the JSON
// command channel, and coordinates redundant-broadcast device discovery.
// Consumers open a transport, hand it to a `ConnectionSupervisor`, and
// work with typed requests and `HubEvent`s from there.

#[macro_use]
pub mod logging;

pub mod config;
pub mod error;
pub mod framing;
pub mod hub;
pub mod protocol;
pub mod repl;
pub mod scan;
pub mod supervisor;
pub mod transport;
pub mod upload;

pub use config::LinkConfig;
pub use error::{
    LinkError, OperationBusyError, ProtocolStateError, ScanBusyError, TransportError,
};
pub use framing::{HubFramer, WireShape};
pub use hub::HubService;
pub use protocol::{
    AckStatus, DeviceRecord, HubMessage, HubRequest, RssiThreshold, DISCOVERY_COMMAND,
};
pub use repl::{DeviceIdentity, DeviceState, ReplController};
pub use scan::{BroadcastRadio, DeviceScanCoordinator, ScanOutcome};
pub use supervisor::{ConnectionSupervisor, HubEvent, LinkMode};
pub use transport::{share, SharedTransport, Transport};
pub use upload::{FileSpec, FileUploadCoordinator, UploadPhase, UploadResult};
