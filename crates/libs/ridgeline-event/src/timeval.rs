//! Second/microsecond time values used for scheduling.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

const ONE_MILLION: i64 = 1_000_000;

/// A time value with microsecond resolution.
///
/// Values taken from the loop clock are monotonic offsets, not wall-clock
/// times. The representation is always normalized so that
/// `0 <= usec < 1_000_000` and the sign lives in the seconds field.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeVal {
    sec: i64,
    usec: i32,
}

impl TimeVal {
    pub const ZERO: TimeVal = TimeVal { sec: 0, usec: 0 };

    /// The greatest representable time; stands in for "no deadline".
    pub const MAXIMUM: TimeVal = TimeVal {
        sec: i64::MAX,
        usec: (ONE_MILLION - 1) as i32,
    };

    pub fn new(sec: i64, usec: i64) -> TimeVal {
        let sec = sec + usec.div_euclid(ONE_MILLION);
        let usec = usec.rem_euclid(ONE_MILLION);
        TimeVal {
            sec,
            usec: usec as i32,
        }
    }

    pub fn from_secs(sec: i64) -> TimeVal {
        TimeVal { sec, usec: 0 }
    }

    pub fn from_ms(ms: i64) -> TimeVal {
        TimeVal::new(ms / 1000, (ms % 1000) * 1000)
    }

    pub fn sec(&self) -> i64 {
        self.sec
    }

    pub fn usec(&self) -> i32 {
        self.usec
    }

    pub fn to_ms(&self) -> i64 {
        self.sec
            .saturating_mul(1000)
            .saturating_add(i64::from(self.usec) / 1000)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + f64::from(self.usec) / ONE_MILLION as f64
    }

    pub fn from_secs_f64(secs: f64) -> TimeVal {
        let sec = secs.floor();
        let usec = ((secs - sec) * ONE_MILLION as f64).round() as i64;
        TimeVal::new(sec as i64, usec)
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    pub fn saturating_add(self, rhs: TimeVal) -> TimeVal {
        if self == TimeVal::MAXIMUM || rhs == TimeVal::MAXIMUM {
            return TimeVal::MAXIMUM;
        }
        match self.sec.checked_add(rhs.sec) {
            Some(_) => self + rhs,
            None => TimeVal::MAXIMUM,
        }
    }
}

impl Add for TimeVal {
    type Output = TimeVal;

    fn add(self, rhs: TimeVal) -> TimeVal {
        TimeVal::new(
            self.sec + rhs.sec,
            i64::from(self.usec) + i64::from(rhs.usec),
        )
    }
}

impl AddAssign for TimeVal {
    fn add_assign(&mut self, rhs: TimeVal) {
        *self = *self + rhs;
    }
}

impl Sub for TimeVal {
    type Output = TimeVal;

    fn sub(self, rhs: TimeVal) -> TimeVal {
        TimeVal::new(
            self.sec - rhs.sec,
            i64::from(self.usec) - i64::from(rhs.usec),
        )
    }
}

impl SubAssign for TimeVal {
    fn sub_assign(&mut self, rhs: TimeVal) {
        *self = *self - rhs;
    }
}

impl fmt::Debug for TimeVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

impl fmt::Display for TimeVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_usec_overflow() {
        let t = TimeVal::new(1, 2_500_000);
        assert_eq!(t.sec(), 3);
        assert_eq!(t.usec(), 500_000);
    }

    #[test]
    fn subtraction_borrows() {
        let a = TimeVal::new(2, 100_000);
        let b = TimeVal::new(1, 900_000);
        assert_eq!(a - b, TimeVal::new(0, 200_000));
    }

    #[test]
    fn from_ms_roundtrip() {
        assert_eq!(TimeVal::from_ms(1250), TimeVal::new(1, 250_000));
        assert_eq!(TimeVal::from_ms(1250).to_ms(), 1250);
    }

    #[test]
    fn ordering() {
        assert!(TimeVal::ZERO < TimeVal::from_ms(1));
        assert!(TimeVal::from_secs(10) < TimeVal::MAXIMUM);
    }

    #[test]
    fn saturating_add_caps_at_maximum() {
        let t = TimeVal::from_secs(5);
        assert_eq!(t.saturating_add(TimeVal::MAXIMUM), TimeVal::MAXIMUM);
    }
}
