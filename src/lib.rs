//! FROST Threshold-Signature Coordinator
//!
//! Orchestrates distributed key generation and threshold signing across
//! hardware signing devices reached over virtualized serial ports. The
//! coordinator holds no key shares itself: it validates, sequences and
//! combines contributions that devices produce.
//!
//! # Architecture
//!
//! - [`transport`] - request/completion bridge over virtualized ports, the
//!   wire codec and per-port drivers
//! - [`registry`] - connected-device tracking and the naming handshake
//! - [`keystore`] - completed keys and pre-committed nonce inventories
//! - [`session`] - keygen, signing and firmware-upgrade state machines
//! - [`storage`] - sqlite and in-memory persistence
//! - [`events`] - lossy broadcast of observable state to frontends
//! - [`coordinator`] - the single-owner actor tying it all together

pub mod config;
pub mod coordinator;
pub mod events;
pub mod frost;
pub mod keystore;
pub mod logging;
pub mod registry;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorHandle};
pub use events::EventBus;
pub use frost::{FrostCombiner, ShareCombiner};
pub use keystore::KeyStore;
pub use registry::DeviceRegistry;
pub use session::{SessionCoordinator, SessionStatus};
pub use storage::{CoordinatorStore, MemoryStore, SqliteStore};
pub use transport::bridge::TransportBridge;
pub use types::{DeviceId, FrostKey, KeyId, PortId, SessionId, SignTask};
