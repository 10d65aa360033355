//! scape-core: shared types for the Scape device protocol layer.
//! Cipher contract, wire formats for both device families, configuration,
//! and the error taxonomy. All other Scape crates depend on this one.

pub mod cipher;
pub mod config;
pub mod error;
pub mod message;
pub mod wire;

pub use cipher::{Cipher, CipherSuite};
pub use config::ScapeConfig;
pub use error::ScapeError;
