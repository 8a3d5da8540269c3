//! Channel Access Manager
//!
//! Grants the right to transmit for a period of time. Licensed operation
//! uses [`AlwaysOnAccessManager`], which grants immediately.

use common::sim::SimTime;
use std::fmt::Debug;
use tracing::trace;

/// Outcome of an access request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessResponse {
    /// Access granted for the given duration
    Granted(SimTime),
    Denied,
    /// Decision will come later (listen-before-talk in progress)
    Pending,
}

pub trait ChannelAccessManager: Debug + Send {
    fn request_access(&mut self, now: SimTime) -> AccessResponse;

    /// Abandon an ongoing request or grant
    fn cancel(&mut self);

    fn grant_duration(&self) -> SimTime;
}

/// Access manager that always grants synchronously
#[derive(Debug, Clone)]
pub struct AlwaysOnAccessManager {
    grant_duration: SimTime,
    grants: u64,
}

impl AlwaysOnAccessManager {
    pub const DEFAULT_GRANT: SimTime = SimTime::from_millis(1000);

    pub fn new(grant_duration: SimTime) -> Self {
        Self { grant_duration, grants: 0 }
    }

    pub fn grants(&self) -> u64 {
        self.grants
    }
}

impl Default for AlwaysOnAccessManager {
    fn default() -> Self {
        Self::new(Self::DEFAULT_GRANT)
    }
}

impl ChannelAccessManager for AlwaysOnAccessManager {
    fn request_access(&mut self, now: SimTime) -> AccessResponse {
        self.grants += 1;
        trace!("Channel access granted at {} for {}", now, self.grant_duration);
        AccessResponse::Granted(self.grant_duration)
    }

    fn cancel(&mut self) {}

    fn grant_duration(&self) -> SimTime {
        self.grant_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_on_grants() {
        let mut cam = AlwaysOnAccessManager::new(SimTime::from_millis(5));
        assert_eq!(
            cam.request_access(SimTime::ZERO),
            AccessResponse::Granted(SimTime::from_millis(5))
        );
        cam.cancel();
        assert_eq!(cam.request_access(SimTime::from_micros(1)), AccessResponse::Granted(SimTime::from_millis(5)));
        assert_eq!(cam.grants(), 2);
        assert_eq!(AlwaysOnAccessManager::default().grant_duration(), SimTime::from_millis(1000));
    }
}
