//! scape-services: device registry, security, request correlation and the
//! two device front-ends (IoTScape JSON services, RoboScape binary robots).
//! The daemon owns the sockets; everything here works against a
//! [`DatagramSink`] so it can be driven without a network.

pub mod access;
pub mod catalog;
pub mod correlator;
pub mod device;
pub mod guard;
pub mod interpreter;
pub mod iotscape;
pub mod listeners;
pub mod registry;
pub mod roboscape;
pub mod store;
pub mod transport;

pub use access::{AccessControl, AllowAll, AllowList};
pub use catalog::{Catalog, ValidationError};
pub use correlator::{Correlator, PreparedCall, Reply};
pub use device::{DeviceKey, DeviceSnapshot, Family};
pub use guard::Guard;
pub use iotscape::IotScape;
pub use listeners::{ClientHandle, ClientIdentity, ClientMessage, Listeners};
pub use registry::DeviceRegistry;
pub use roboscape::{RoboScape, RobotMethod, RobotReply};
pub use store::{JsonFileStore, MemoryStore, ServiceRecord, ServiceStore, StoreError};
pub use transport::DatagramSink;

#[cfg(any(test, feature = "test-util"))]
pub use listeners::MemoryClient;
#[cfg(any(test, feature = "test-util"))]
pub use transport::MemorySink;
