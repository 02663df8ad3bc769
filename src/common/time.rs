use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(test)]
use std::{sync::Arc, time::Duration};

#[cfg(test)]
use parking_lot::RwLock;

/// A wall-clock source producing absolute Unix timestamps in whole seconds.
///
/// Expiration deadlines are stored in the shared arena and compared by every
/// process attached to it, so the clock must be the system wall clock rather
/// than a per-process monotonic one.
#[derive(Clone, Default)]
pub(crate) struct Clock {
    ty: ClockType,
}

#[derive(Clone)]
enum ClockType {
    /// The operating system wall clock.
    System,
    #[cfg(test)]
    /// A clock that uses a mocked source of time.
    Mocked { mock: Arc<Mock> },
}

impl Default for ClockType {
    fn default() -> Self {
        ClockType::System
    }
}

impl Clock {
    #[cfg(test)]
    /// Creates a new `Clock` with a mocked source of time.
    pub(crate) fn mock() -> (Clock, Arc<Mock>) {
        let mock = Arc::new(Mock::default());
        let clock = Clock {
            ty: ClockType::Mocked {
                mock: Arc::clone(&mock),
            },
        };
        (clock, mock)
    }

    /// Returns the current time in seconds since the Unix epoch.
    pub(crate) fn now_secs(&self) -> i64 {
        match &self.ty {
            ClockType::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            #[cfg(test)]
            ClockType::Mocked { mock } => mock.now_secs(),
        }
    }
}

/// A mocked time source. The fixed origin keeps test timelines fully
/// deterministic.
#[cfg(test)]
pub(crate) struct Mock {
    origin: i64,
    advanced: RwLock<Duration>,
}

#[cfg(test)]
impl Default for Mock {
    fn default() -> Self {
        Self {
            origin: 1_600_000_000,
            advanced: RwLock::new(Duration::ZERO),
        }
    }
}

#[cfg(test)]
impl Mock {
    pub(crate) fn increment(&self, amount: Duration) {
        *self.advanced.write() += amount;
    }

    fn now_secs(&self) -> i64 {
        self.origin + self.advanced.read().as_secs() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_advances_in_whole_seconds() {
        let (clock, mock) = Clock::mock();
        let start = clock.now_secs();

        mock.increment(Duration::from_millis(1500));
        assert_eq!(clock.now_secs(), start + 1);

        mock.increment(Duration::from_millis(500));
        assert_eq!(clock.now_secs(), start + 2);
    }

    #[test]
    fn system_clock_is_past_the_epoch() {
        let clock = Clock::default();
        assert!(clock.now_secs() > 1_500_000_000);
    }
}
