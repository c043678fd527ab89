//! 17.14 fixed-point arithmetic for the MLFQ scheduler statistics.

use core::ops::{Add, AddAssign, Sub};

const SHIFT: u32 = 14;
const F: i32 = 1 << SHIFT;

/// A signed 17.14 fixed-point number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);

    pub fn from_int(n: i32) -> Fixed {
        Fixed(n * F)
    }

    /// n/d as a fixed-point value.
    pub fn from_ratio(n: i32, d: i32) -> Fixed {
        Fixed((n as i64 * F as i64 / d as i64) as i32)
    }

    /// Truncate toward zero.
    pub fn to_int(self) -> i32 {
        self.0 / F
    }

    /// Round to the nearest integer.
    pub fn to_int_nearest(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    pub fn add_int(self, n: i32) -> Fixed {
        Fixed(self.0 + n * F)
    }

    pub fn sub_int(self, n: i32) -> Fixed {
        Fixed(self.0 - n * F)
    }

    pub fn mul(self, other: Fixed) -> Fixed {
        Fixed((self.0 as i64 * other.0 as i64 >> SHIFT) as i32)
    }

    pub fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n)
    }

    pub fn div(self, other: Fixed) -> Fixed {
        Fixed(((self.0 as i64) * F as i64 / other.0 as i64) as i32)
    }

    pub fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n)
    }
}

impl Add for Fixed {
    type Output = Fixed;
    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 + rhs.0)
    }
}

impl AddAssign for Fixed {
    fn add_assign(&mut self, rhs: Fixed) {
        self.0 += rhs.0;
    }
}

impl Sub for Fixed {
    type Output = Fixed;
    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 - rhs.0)
    }
}
