//! Utilities for messing with time at millisecond precision
//!
//! Session machinery lives and dies by short timers: refresh lead times,
//! liveness heartbeats, and coordination pulses that exist for a few tens of
//! milliseconds. The types here keep that arithmetic in plain integers and
//! allow the wall clock to be mocked out wherever a component takes a
//! [`Clock`].

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix time in milliseconds
///
/// The number of milliseconds elapsed since the beginning of the Unix epoch
/// on 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct UnixMillis(pub u64);

impl UnixMillis {
    /// The duration elapsed since `earlier`, or zero if `earlier` is in the
    /// future of `self`
    #[inline]
    #[must_use]
    pub fn saturating_since(self, earlier: UnixMillis) -> DurationMillis {
        DurationMillis(self.0.saturating_sub(earlier.0))
    }
}

impl From<SystemTime> for UnixMillis {
    #[inline]
    fn from(t: SystemTime) -> Self {
        let time = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("times before Unix epoch are not expected")
            .as_millis() as u64;

        UnixMillis(time)
    }
}

impl ops::Add<DurationMillis> for UnixMillis {
    type Output = UnixMillis;

    #[inline]
    fn add(self, rhs: DurationMillis) -> Self::Output {
        UnixMillis(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub<DurationMillis> for UnixMillis {
    type Output = UnixMillis;

    #[inline]
    fn sub(self, rhs: DurationMillis) -> Self::Output {
        UnixMillis(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Sub<UnixMillis> for UnixMillis {
    type Output = DurationMillis;

    #[inline]
    fn sub(self, rhs: UnixMillis) -> Self::Output {
        self.saturating_since(rhs)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for UnixMillis {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for UnixMillis {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Self(ms))
    }
}

/// A duration in milliseconds
///
/// Subtraction saturates at zero rather than wrapping; timer arithmetic on
/// nearly-expired credentials routinely produces "negative" remainders, and
/// those must clamp instead of exploding into distant deadlines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct DurationMillis(pub u64);

impl DurationMillis {
    /// A zero-length duration
    pub const ZERO: DurationMillis = DurationMillis(0);

    /// The duration remaining after removing `rhs`, or zero
    #[inline]
    #[must_use]
    pub fn saturating_sub(self, rhs: DurationMillis) -> DurationMillis {
        DurationMillis(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Add for DurationMillis {
    type Output = DurationMillis;

    #[inline]
    fn add(self, rhs: DurationMillis) -> Self::Output {
        DurationMillis(self.0.saturating_add(rhs.0))
    }
}

impl ops::Div<u64> for DurationMillis {
    type Output = DurationMillis;

    #[inline]
    fn div(self, rhs: u64) -> Self::Output {
        DurationMillis(self.0 / rhs)
    }
}

impl From<Duration> for DurationMillis {
    #[inline]
    fn from(d: Duration) -> Self {
        DurationMillis(d.as_millis() as u64)
    }
}

impl From<DurationMillis> for Duration {
    #[inline]
    fn from(d: DurationMillis) -> Self {
        Duration::from_millis(d.0)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for DurationMillis {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for DurationMillis {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Self(ms))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixMillis;
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixMillis {
        UnixMillis::from(SystemTime::now())
    }
}

/// A test clock which shares its current time among clones
///
/// Unlike a clock held by value, every clone observes the same instant, so a
/// test can hand a clone to the component under test and advance time from
/// the outside.
#[derive(Clone, Debug, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> UnixMillis {
        UnixMillis(self.0.load(Ordering::Acquire))
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    #[must_use]
    pub fn new(time: UnixMillis) -> Self {
        Self(Arc::new(AtomicU64::new(time.0)))
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: UnixMillis) {
        self.0.store(val.0, Ordering::Release);
    }

    /// Advances the clock's current time by `inc`
    pub fn advance(&self, inc: DurationMillis) {
        self.0.fetch_add(inc.0, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtraction_saturates_at_zero() {
        let earlier = UnixMillis(1_000);
        let later = UnixMillis(4_500);

        assert_eq!(later - earlier, DurationMillis(3_500));
        assert_eq!(earlier - later, DurationMillis::ZERO);
        assert_eq!(earlier - DurationMillis(2_000), UnixMillis(0));
    }

    #[test]
    fn duration_round_trips_through_std() {
        let d = DurationMillis(1_250);
        let std: Duration = d.into();
        assert_eq!(std, Duration::from_millis(1_250));
        assert_eq!(DurationMillis::from(std), d);
    }

    #[test]
    fn test_clock_clones_share_time() {
        let clock = TestClock::new(UnixMillis(10));
        let observer = clock.clone();

        clock.advance(DurationMillis(90));
        assert_eq!(observer.now(), UnixMillis(100));

        observer.set(UnixMillis(7));
        assert_eq!(clock.now(), UnixMillis(7));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn times_serialize_as_bare_integers() {
        let json = serde_json::to_string(&UnixMillis(1_234)).unwrap();
        assert_eq!(json, "1234");
        let back: UnixMillis = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UnixMillis(1_234));
    }
}
