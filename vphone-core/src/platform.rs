//! Platform-level services consumed by the core.
//!
//! The core never restarts itself. Process-fatal conditions are reported
//! through [`RestartHandler::restart_request`] and supervision takes over.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

/// Why a restart was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    /// A callback panicked inside an event loop.
    EventLoopPanic { queue: String },
    /// The signaling layer reached a state it cannot recover from.
    SignalingFault(String),
    /// An operator or remote supervisor asked for it.
    Requested,
}

impl RestartReason {
    /// Numeric code reported to the supervisor.
    pub fn code(&self) -> u32 {
        match self {
            RestartReason::EventLoopPanic { .. } => 10,
            RestartReason::SignalingFault(_) => 20,
            RestartReason::Requested => 1,
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::EventLoopPanic { queue } => {
                write!(f, "event loop panic in {queue}")
            }
            RestartReason::SignalingFault(what) => write!(f, "signaling fault: {what}"),
            RestartReason::Requested => write!(f, "restart requested"),
        }
    }
}

/// Receives process-fatal restart requests.
pub trait RestartHandler: Send + Sync {
    fn restart_request(&self, reason: RestartReason);
}

/// The platform abstraction handed to components through the context.
pub trait Platform: RestartHandler {
    /// Human readable product / build identifier.
    fn product_name(&self) -> String {
        "vphone".to_string()
    }
}

/// A platform that only records and logs restart requests.
///
/// Used by tests and as the fallback when no supervisor is attached.
#[derive(Debug, Default)]
pub struct LoggingPlatform {
    requests: Mutex<Vec<RestartReason>>,
}

impl LoggingPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Restart requests received so far.
    pub fn restart_requests(&self) -> Vec<RestartReason> {
        self.requests.lock().clone()
    }
}

impl RestartHandler for LoggingPlatform {
    fn restart_request(&self, reason: RestartReason) {
        error!(code = reason.code(), "restart request: {reason}");
        self.requests.lock().push(reason);
    }
}

impl Platform for LoggingPlatform {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_platform_records_requests() {
        let platform = LoggingPlatform::new();
        platform.restart_request(RestartReason::EventLoopPanic {
            queue: "cm".into(),
        });
        let seen = platform.restart_requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].code(), 10);
        assert!(seen[0].to_string().contains("cm"));
    }
}
