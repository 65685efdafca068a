//! Virtualized Device Transport
//!
//! The coordinator never touches hardware ports directly. Every port
//! operation becomes a [`PortRequest`] registered with the
//! [`TransportBridge`]; whichever executor has real hardware access (an
//! in-process [`PortBackend`] task or a host across an FFI boundary) consumes
//! the request stream and delivers exactly one completion per request.
//!
//! Both executor modes share the same contract: one single-shot completion
//! slot per request id, cancellation by closing the port. There is no
//! behavioral divergence between them because both resolve through the same
//! completion table.

pub mod bridge;
pub mod link;
pub mod wire;

pub use bridge::{
    PendingRequest, PortActivity, PortDirection, PortRequest, PortRequestKind, PortResponse,
    TransportBridge,
};
pub use link::{run_executor, MemoryBackend, PortBackend, PortDriver};
pub use wire::{encode_frame, CoordinatorToDevice, DeviceToCoordinator, FrameCodec, WireError};

use crate::types::{PortId, RequestId};
use thiserror::Error;

/// Transport-level errors, reported to the caller that issued the request
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("port I/O failed: {0}")]
    Io(String),
    #[error("request {0} was cancelled because its port closed")]
    Cancelled(RequestId),
    #[error("request {0} already received its completion")]
    DuplicateCompletion(RequestId),
    #[error("no outstanding request with id {0}")]
    UnknownRequest(RequestId),
    #[error("port {0} is not open")]
    PortClosed(PortId),
    #[error("completion payload did not match request kind {0}")]
    PayloadMismatch(&'static str),
    #[error("request stream was dropped by the executor")]
    ExecutorGone,
}
