/*! Time structures.

Two clocks drive the engines:

 - [Tick] counts the periodic TCP timer ticks. It is a 32-bit counter that is compared in wrapping
   arithmetic so that a long running engine never observes a discontinuity.
 - [Instant] is an absolute millisecond timestamp supplied by the caller of the IKE engine, paired
   with [Expiration] for timers that may be disarmed.

[Tick]: struct.Tick.html
[Instant]: struct.Instant.html
[Expiration]: enum.Expiration.html
*/
use core::{cmp, fmt, ops};
pub use core::time::Duration;

/// A point on the periodic timer scale of the TCP engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Tick(pub u32);

impl Tick {
    /// Number of ticks elapsed from `earlier` to `self`, in wrapping arithmetic.
    pub fn since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// The signed distance to a later tick, negative if `later` already passed.
    pub fn until(self, later: Tick) -> i32 {
        later.0.wrapping_sub(self.0) as i32
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl ops::Add<u32> for Tick {
    type Output = Tick;

    fn add(self, rhs: u32) -> Tick {
        Tick(self.0.wrapping_add(rhs))
    }
}

impl ops::AddAssign<u32> for Tick {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl cmp::PartialOrd for Tick {
    fn partial_cmp(&self, other: &Tick) -> Option<cmp::Ordering> {
        (self.0.wrapping_sub(other.0) as i32).partial_cmp(&0)
    }
}

/// A representation of an absolute time value.
///
/// The `Instant` type is a wrapper around a `i64` value that
/// represents a number of milliseconds, monotonically increasing
/// since an arbitrary moment in time, such as system startup.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant {
    pub millis: i64,
}

/// An expiration time, inversion of `Option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    When(Instant),
    Never,
}

use Expiration::{When, Never};

impl Instant {
    /// Create a new `Instant` from a number of milliseconds.
    pub fn from_millis<T: Into<i64>>(millis: T) -> Instant {
        Instant { millis: millis.into() }
    }

    /// Create a new `Instant` from a number of seconds.
    pub fn from_secs<T: Into<i64>>(secs: T) -> Instant {
        Instant { millis: secs.into() * 1000 }
    }

    /// The number of whole seconds that have passed since the
    /// beginning of time.
    pub fn secs(&self) -> i64 {
        self.millis / 1000
    }

    /// The total number of milliseconds that have passed since
    /// the beginning of time.
    pub fn total_millis(&self) -> i64 {
        self.millis
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}s", self.secs(), self.millis % 1000)
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis + rhs.as_millis() as i64)
    }
}

impl ops::Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        Duration::from_millis((self.millis - rhs.millis).abs() as u64)
    }
}

impl Expiration {
    /// Arm an expiration `after` the instant `now`.
    pub fn after(now: Instant, after: Duration) -> Self {
        When(now + after)
    }

    /// Check if the expiration lies at or before `now`.
    pub fn is_due(self, now: Instant) -> bool {
        match self {
            When(instant) => instant <= now,
            Never => false,
        }
    }
}

impl Default for Expiration {
    fn default() -> Self {
        Expiration::Never
    }
}

impl From<Option<Instant>> for Expiration {
    fn from(opt: Option<Instant>) -> Self {
        match opt {
            Some(instant) => When(instant),
            None => Never,
        }
    }
}

impl cmp::PartialOrd<Self> for Expiration {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl cmp::Ord for Expiration {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match (*self, *other) {
            (Never, Never) => cmp::Ordering::Equal,
            (Never, When(_)) => cmp::Ordering::Greater,
            (When(_), Never) => cmp::Ordering::Less,
            (When(ref a), When(ref b)) => a.cmp(b),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tick_wraps() {
        let before = Tick(u32::max_value() - 1);
        let after = before + 4;
        assert_eq!(after, Tick(2));
        assert!(before < after);
        assert_eq!(after.since(before), 4);
        assert_eq!(before.until(after), 4);
        assert_eq!(after.until(before), -4);
    }

    #[test]
    fn instant_display() {
        assert_eq!(format!("{}", Instant::from_millis(5674)), "5.674s");
        assert_eq!(format!("{}", Instant::from_millis(5000)), "5.000s");
    }

    #[test]
    fn expiration_due() {
        let now = Instant::from_secs(10);
        let timer = Expiration::after(now, Duration::from_secs(2));
        assert!(!timer.is_due(now));
        assert!(timer.is_due(Instant::from_secs(12)));
        assert!(!Expiration::Never.is_due(Instant::from_secs(1i64 << 40)));
        assert!(timer < Expiration::Never);
    }
}
