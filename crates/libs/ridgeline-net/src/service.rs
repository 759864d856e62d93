//! Service status lifecycle shared by long-lived components.

use std::fmt;

/// Lifecycle of a managed service (port I/O bindings, the interface
/// feed, the daemon itself).
///
/// Legal transitions move forward only:
/// `Starting -> Running -> ShuttingDown -> Shutdown`, with `Failed`
/// reachable from any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Starting,
    Running,
    ShuttingDown,
    Shutdown,
    Failed,
}

impl ServiceStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Running)
    }

    pub fn can_transition_to(&self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match (self, next) {
            (Starting, Running) => true,
            (Starting, ShuttingDown) | (Running, ShuttingDown) => true,
            (ShuttingDown, Shutdown) => true,
            (Starting, Failed) | (Running, Failed) | (ShuttingDown, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::ShuttingDown => "shutting-down",
            ServiceStatus::Shutdown => "shutdown",
            ServiceStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}
