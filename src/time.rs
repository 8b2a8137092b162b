//! Monotonic time as a 64-bit tick count.
//!
//! All deadlines in the scheduler are absolute [`MonoTime`] values and zero
//! encodes "unset", so the type doubles as both an instant and a duration
//! (a deadline is `now + duration`). Ticks are microseconds by default and
//! nanoseconds with the `nanotime` feature.

use std::ops::{Add, Sub};

#[cfg(not(feature = "nanotime"))]
const TICKS_PER_MILLISEC: i64 = 1_000;
#[cfg(feature = "nanotime")]
const TICKS_PER_MILLISEC: i64 = 1_000_000;

/// A monotonic instant (or span) in clock ticks; zero means "unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonoTime(i64);

impl MonoTime {
    /// The "unset" value.
    pub const ZERO: MonoTime = MonoTime(0);

    /// Sample the monotonic clock.
    pub fn now() -> MonoTime {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC with a valid timespec pointer cannot fail
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        debug_assert_eq!(0, rc);
        #[cfg(not(feature = "nanotime"))]
        let ticks = ts.tv_sec as i64 * 1_000_000 + ts.tv_nsec as i64 / 1_000;
        #[cfg(feature = "nanotime")]
        let ticks = ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64;
        MonoTime(ticks)
    }

    pub fn from_millis(millisecs: u32) -> MonoTime {
        MonoTime(i64::from(millisecs) * TICKS_PER_MILLISEC)
    }

    pub fn as_millis(self) -> i64 {
        self.0 / TICKS_PER_MILLISEC
    }

    /// Does this carry a time at all?
    pub fn is_set(self) -> bool {
        self.0 != 0
    }

    /// The earlier of two times, ignoring unset ones.
    pub fn min_set(self, other: MonoTime) -> MonoTime {
        if !self.is_set() {
            other
        } else if !other.is_set() {
            self
        } else {
            MonoTime(self.0.min(other.0))
        }
    }

    /// Milliseconds from `now` until this deadline, zero if already due.
    /// Rounds up so a wait never wakes before the deadline.
    pub fn millis_after(self, now: MonoTime) -> u64 {
        if self <= now {
            0
        } else {
            let ticks = self.0 - now.0;
            ((ticks + TICKS_PER_MILLISEC - 1) / TICKS_PER_MILLISEC) as u64
        }
    }
}

impl Add for MonoTime {
    type Output = MonoTime;
    fn add(self, rhs: MonoTime) -> MonoTime {
        MonoTime(self.0 + rhs.0)
    }
}

impl Sub for MonoTime {
    type Output = MonoTime;
    fn sub(self, rhs: MonoTime) -> MonoTime {
        MonoTime(self.0 - rhs.0)
    }
}
