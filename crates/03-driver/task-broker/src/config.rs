use std::time::Duration;

use transport::DEFAULT_CONTROL_BYTES;

/// How long the broker sleeps between rounds while async work is outstanding.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Size of the control region, header included.
    pub control_bytes: usize,
    pub poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            control_bytes: DEFAULT_CONTROL_BYTES,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// How the broker waits for its next round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerMode {
    /// Nothing outstanding: park on the control region until a message lands.
    Blocking,
    /// Async work in flight: poll again after a short sleep so it can progress.
    Cooperative,
}

impl SchedulerMode {
    pub fn for_outstanding(outstanding: usize) -> Self {
        if outstanding == 0 {
            SchedulerMode::Blocking
        } else {
            SchedulerMode::Cooperative
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_follows_outstanding_work() {
        assert_eq!(SchedulerMode::for_outstanding(0), SchedulerMode::Blocking);
        assert_eq!(SchedulerMode::for_outstanding(3), SchedulerMode::Cooperative);
        assert_eq!(BrokerConfig::default().control_bytes, DEFAULT_CONTROL_BYTES);
    }
}
