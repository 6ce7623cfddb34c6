use thiserror::Error;

/// Failures surfaced by the bridge layer itself.
///
/// Worker handlers report their own domain errors through their payloads;
/// these variants cover only the bridge machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The bridge was used before `initialise` wired its handler or worker.
    #[error("bridge has not been initialised")]
    InvalidState,
    /// The target context has been shut down and accepts no new workers.
    #[error("async context is closed")]
    ContextClosed,
}
