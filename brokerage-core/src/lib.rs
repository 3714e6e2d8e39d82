// brokerage-core/src/lib.rs

//! Distributed Build Worker Brokerage - Core Library
//!
//! This crate provides the rendezvous mechanism by which idle build workers
//! advertise themselves and build clients discover which remote machines may
//! be used to offload compilation:
//!
//! - A typed wire protocol and framed TCP transport for talking to the
//!   coordinator service
//! - The brokerage client used by both workers and clients, with a
//!   coordinator (TCP) transport and a shared-folder transport
//! - Presence file handling for the folder transport

pub mod brokerage;
pub mod config;
pub mod error;
pub mod net;
pub mod presence;
pub mod protocol;
pub mod transport;

// Re-export commonly used types for convenience
pub use brokerage::{BrokerageTimings, WorkerBrokerage};
pub use config::BrokerageConfig;
pub use error::{BrokerageError, Result};
pub use net::HostIdentity;
pub use presence::{WorkerDescriptor, WorkerMode};
pub use protocol::{Message, Platform, COORDINATOR_PORT, PROTOCOL_VERSION_MAJOR};
pub use transport::Connection;
