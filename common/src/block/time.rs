//! Local and network-adjusted time.
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Allowed median time offset, in seconds, before a peer's clock is considered
/// invalid. Peers reporting a time further than this from our own are ignored
/// when adjusting our network time.
pub const MAX_TIME_ADJUSTMENT: i64 = 70 * 60;

/// Maximum number of samples used to compute the network-adjusted time offset.
pub const MAX_TIME_SAMPLES: usize = 200;

/// A monotonic point in time, measured in milliseconds since the Unix epoch.
///
/// Used in place of [`std::time::Instant`] so that state machines can be
/// driven deterministically in tests with a simulated clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LocalTime(u64);

impl LocalTime {
    /// Create a local time from milliseconds since the Unix epoch.
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(ms)
    }

    /// Milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Seconds since the Unix epoch.
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// The duration elapsed between an earlier time and this one.
    pub fn duration_since(&self, earlier: LocalTime) -> LocalDuration {
        LocalDuration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, rhs: LocalDuration) -> Self::Output {
        LocalTime(self.0 + rhs.as_millis())
    }
}

impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, rhs: LocalDuration) -> Self::Output {
        LocalTime(self.0.saturating_sub(rhs.as_millis()))
    }
}

impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, rhs: LocalTime) -> Self::Output {
        self.duration_since(rhs)
    }
}

/// A span of time, measured in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LocalDuration(u64);

impl LocalDuration {
    /// The largest possible duration.
    pub const MAX: Self = Self(u64::MAX);

    /// Build a duration from a count of milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Build a duration from a count of seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// Build a duration from a count of minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// The number of milliseconds in this duration.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// The number of whole seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1000
    }
}

impl From<Duration> for LocalDuration {
    fn from(d: Duration) -> Self {
        Self(d.as_millis() as u64)
    }
}

impl From<LocalDuration> for Duration {
    fn from(d: LocalDuration) -> Self {
        Duration::from_millis(d.0)
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, rhs: u64) -> Self::Output {
        LocalDuration(self.0 * rhs)
    }
}

/// A clock that knows the current local time.
pub trait Clock: Clone {
    /// The current local time.
    fn local_time(&self) -> LocalTime;
}

impl Clock for () {
    fn local_time(&self) -> LocalTime {
        LocalTime::now()
    }
}

/// A clock that can be adjusted by samples gathered from peers, keyed by peer
/// identifier `K`. Mirrors the classic "network-adjusted time" used to guard
/// against a single malicious or misconfigured peer skewing our view of
/// consensus-critical timestamps.
pub trait AdjustedClock<K>: Clock {
    /// Add a time sample received from the given peer.
    fn add_sample(&mut self, source: K, sample: LocalTime);
    /// Set the local wall-clock time. Used to seed the clock at startup and in
    /// tests with a simulated time source.
    fn set(&mut self, time: LocalTime);
}

/// A clock that tracks samples from multiple peers and computes a
/// median-adjusted offset from the local wall-clock.
#[derive(Debug, Clone)]
pub struct AdjustedTime<K> {
    /// Time offset samples, by peer.
    samples: HashMap<K, i64>,
    /// Current local offset, in seconds, applied on top of the local wall-clock.
    offset: i64,
    /// The local wall-clock time, as last set via [`AdjustedClock::set`].
    local_time: LocalTime,
}

impl<K: Hash + Eq> Default for AdjustedTime<K> {
    fn default() -> Self {
        Self::new(LocalTime::now())
    }
}

impl<K: Hash + Eq> AdjustedTime<K> {
    /// Create a new adjusted time instance, seeded with the given local time.
    pub fn new(local_time: LocalTime) -> Self {
        Self {
            samples: HashMap::new(),
            offset: 0,
            local_time,
        }
    }

    /// The current offset, in seconds, from the local wall-clock.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Recompute the offset from the current sample set.
    fn recalculate(&mut self) {
        if self.samples.is_empty() {
            self.offset = 0;
            return;
        }

        let mut offsets: Vec<i64> = self.samples.values().copied().collect();
        offsets.sort_unstable();

        let median = offsets[offsets.len() / 2];

        // Ignore adjustments that would push our clock too far from the
        // unadjusted wall-clock; a handful of misbehaving peers shouldn't be
        // able to desynchronize us from the rest of the network.
        if median.unsigned_abs() as i64 <= MAX_TIME_ADJUSTMENT {
            self.offset = median;
        } else {
            self.offset = 0;
        }
    }
}

impl<K: Hash + Eq + Clone> Clock for AdjustedTime<K> {
    fn local_time(&self) -> LocalTime {
        if self.offset >= 0 {
            self.local_time + LocalDuration::from_secs(self.offset as u64)
        } else {
            self.local_time - LocalDuration::from_secs((-self.offset) as u64)
        }
    }
}

impl<K: Hash + Eq + Clone> AdjustedClock<K> for AdjustedTime<K> {
    fn add_sample(&mut self, source: K, sample: LocalTime) {
        if self.samples.len() >= MAX_TIME_SAMPLES {
            // Drop an arbitrary existing sample to make room; peers that
            // reconnect will naturally refresh their entry.
            if let Some(key) = self.samples.keys().next().cloned() {
                self.samples.remove(&key);
            }
        }
        let delta = sample.as_secs() as i64 - self.local_time.as_secs() as i64;
        self.samples.insert(source, delta);
        self.recalculate();
    }

    fn set(&mut self, time: LocalTime) {
        self.local_time = time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unadjusted_clock_matches_local_time() {
        let time = LocalTime::from_millis(1_000_000);
        let clock: AdjustedTime<u32> = AdjustedTime::new(time);

        assert_eq!(clock.local_time(), time);
    }

    #[test]
    fn test_adjustment_rejects_outlier() {
        let time = LocalTime::from_millis(1_000_000);
        let mut clock: AdjustedTime<u32> = AdjustedTime::new(time);

        clock.add_sample(1, time + LocalDuration::from_secs(3 * 60 * 60));
        assert_eq!(clock.offset(), 0, "single far-off sample shouldn't move the clock");
    }

    #[test]
    fn test_adjustment_uses_median() {
        let time = LocalTime::from_millis(1_000_000);
        let mut clock: AdjustedTime<u32> = AdjustedTime::new(time);

        clock.add_sample(1, time + LocalDuration::from_secs(10));
        clock.add_sample(2, time + LocalDuration::from_secs(20));
        clock.add_sample(3, time + LocalDuration::from_secs(30));

        assert_eq!(clock.offset(), 20);
    }
}
