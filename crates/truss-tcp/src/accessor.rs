//! Cross-core accessor for the client's synchronous surface.
//!
//! `connect` and `status` must run on the networking core under the
//! context lock. The accessor is a [`SyncBridge`] specialization that gets
//! them there from any core and hands the result back: callers on the
//! networking core take the bridge's same-core fast path, everyone else
//! blocks on the bridge's semaphore while a one-shot worker runs the
//! operation in context.

use std::net::SocketAddr;
use std::sync::Arc;

use truss_bridge::SyncBridge;

use crate::client::ClientInner;
use crate::error::TcpError;
use crate::stack::PcbState;

/// Operations the accessor can ship across cores.
#[derive(Debug, Clone, Copy)]
enum AccessorOp {
    Status,
    Connect(SocketAddr),
}

/// Result envelope; defaults to the zeroed reading a dead connection gives.
#[derive(Debug, Clone, Copy)]
enum AccessorReply {
    Status(PcbState),
    Connect(Result<(), TcpError>),
}

impl Default for AccessorReply {
    fn default() -> Self {
        AccessorReply::Status(PcbState::Closed)
    }
}

/// Blocking, thread-safe access to `status()` and `connect()`.
pub struct SyncAccessor {
    bridge: SyncBridge<AccessorOp, AccessorReply>,
}

impl SyncAccessor {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        let bridge = SyncBridge::new(Arc::clone(inner.net_ctx()));
        bridge.initialise(move |op| match op {
            AccessorOp::Status => AccessorReply::Status(inner.ts_status()),
            AccessorOp::Connect(addr) => AccessorReply::Connect(inner.ts_connect(addr)),
        });
        SyncAccessor { bridge }
    }

    /// PCB state exactly as a same-core observer would read it inside the
    /// lock at this instant.
    pub fn status(&self) -> PcbState {
        match self.bridge.execute(AccessorOp::Status) {
            Ok(AccessorReply::Status(state)) => state,
            Ok(AccessorReply::Connect(_)) | Err(_) => PcbState::Closed,
        }
    }

    /// Dispatch a connect onto the networking core and return its verdict.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), TcpError> {
        match self.bridge.execute(AccessorOp::Connect(addr)) {
            Ok(AccessorReply::Connect(result)) => result,
            Ok(AccessorReply::Status(_)) => Err(TcpError::Generic),
            Err(_) => Err(TcpError::InvalidState),
        }
    }
}
