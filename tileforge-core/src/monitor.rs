//! Health and cluster-registration interfaces.

use std::sync::atomic::{AtomicU8, Ordering};

/// Serving state reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Maintenance,
}

impl Status {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Maintenance => "maintenance",
        }
    }
}

/// Process-wide serving status, flipped by the signal path and read on every
/// health probe.
#[derive(Debug, Default)]
pub struct StatusMonitor(AtomicU8);

const STATUS_OK: u8 = 0;
const STATUS_MAINTENANCE: u8 = 1;

impl StatusMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(&self) -> Status {
        decode(self.0.load(Ordering::Acquire))
    }

    /// Stores the new status, returning the previous one.
    pub fn exchange(&self, status: Status) -> Status {
        decode(self.0.swap(encode(status), Ordering::AcqRel))
    }
}

fn encode(status: Status) -> u8 {
    match status {
        Status::Ok => STATUS_OK,
        Status::Maintenance => STATUS_MAINTENANCE,
    }
}

fn decode(raw: u8) -> Status {
    if raw == STATUS_MAINTENANCE {
        Status::Maintenance
    } else {
        Status::Ok
    }
}

/// Registration against an external cluster registry. The concrete client is
/// an external collaborator; servers drive this on start and stop.
pub trait NodesMonitor: Send + Sync {
    fn register(&self);
    fn unregister(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_exchange_returns_previous() {
        let monitor = StatusMonitor::new();
        assert_eq!(monitor.status(), Status::Ok);
        assert_eq!(monitor.exchange(Status::Maintenance), Status::Ok);
        assert_eq!(monitor.exchange(Status::Maintenance), Status::Maintenance);
        assert_eq!(monitor.status(), Status::Maintenance);
        assert_eq!(monitor.status().as_str(), "maintenance");
    }
}
