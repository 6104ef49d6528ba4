//! Physical address primitives.
//!
//! [`Addr`] is the single address type used by the device layer. Its width is
//! compiled in: 64-bit by default, 128-bit with the `wide-addr` feature. No
//! arithmetic on it truncates silently; every operation that can overflow is
//! checked, and narrowing to `u64` either succeeds or reports overflow.
//!
//! The free functions in [`wide`] give the 128-bit helpers the trajectory
//! engine needs regardless of the compiled address width.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Hn4Error, Hn4Result};

#[cfg(feature = "wide-addr")]
type Repr = u128;
#[cfg(not(feature = "wide-addr"))]
type Repr = u64;

/// Physical address (sector or block index) of the compiled width.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Addr(Repr);

impl Addr {
    /// Address zero.
    pub const ZERO: Addr = Addr(0);
    /// All-ones sentinel, also the result of division by zero.
    pub const MAX: Addr = Addr(Repr::MAX);
    /// Width of the address in bits.
    pub const BITS: u32 = Repr::BITS;

    /// Creates an address from a native integer (zero-extended).
    pub fn from_u64(value: u64) -> Self {
        Addr(Repr::from(value))
    }

    /// Narrows to `u64`, returning `None` if any high bit is set.
    pub fn try_to_u64(self) -> Option<u64> {
        u64::try_from(self.0).ok()
    }

    /// Narrows to `u64`, reporting overflow as an error and logging it.
    pub fn to_u64(self, context: &'static str) -> Hn4Result<u64> {
        match self.try_to_u64() {
            Some(v) => Ok(v),
            None => {
                warn!(addr = %self, context, "address does not fit in 64 bits");
                Err(Hn4Error::AddressOverflow { context })
            }
        }
    }

    /// Adds two addresses, returning `None` on carry out of the top bit.
    pub fn checked_add(self, rhs: Addr) -> Option<Addr> {
        self.0.checked_add(rhs.0).map(Addr)
    }

    /// Adds a native integer.
    pub fn checked_add_u64(self, rhs: u64) -> Option<Addr> {
        self.checked_add(Addr::from_u64(rhs))
    }

    /// Subtracts, returning `None` on borrow.
    pub fn checked_sub(self, rhs: Addr) -> Option<Addr> {
        self.0.checked_sub(rhs.0).map(Addr)
    }

    /// Multiplies by a 64-bit factor, returning `None` if the product does
    /// not fit the compiled width.
    pub fn checked_mul_u64(self, rhs: u64) -> Option<Addr> {
        self.0.checked_mul(Repr::from(rhs)).map(Addr)
    }

    /// Divides by a 64-bit divisor. Division by zero yields [`Addr::MAX`].
    pub fn div_u64(self, rhs: u64) -> Addr {
        if rhs == 0 {
            return Addr::MAX;
        }
        Addr(self.0 / Repr::from(rhs))
    }

    /// Remainder by a 64-bit divisor. Division by zero yields [`Addr::MAX`].
    pub fn rem_u64(self, rhs: u64) -> Addr {
        if rhs == 0 {
            return Addr::MAX;
        }
        Addr(self.0 % Repr::from(rhs))
    }

    /// Returns whether this is the all-ones sentinel.
    pub fn is_sentinel(self) -> bool {
        self == Addr::MAX
    }
}

impl From<u32> for Addr {
    fn from(value: u32) -> Self {
        Addr::from_u64(u64::from(value))
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Addr::from_u64(value)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 128-bit helpers independent of the compiled address width.
pub mod wide {
    /// Full 64×64→128 product split into `(high, low)` words.
    pub fn mul_64x64(a: u64, b: u64) -> (u64, u64) {
        let p = u128::from(a) * u128::from(b);
        ((p >> 64) as u64, p as u64)
    }

    /// 128-bit subtraction returning the difference and a borrow flag.
    pub fn sub_borrow(a: u128, b: u128) -> (u128, bool) {
        a.overflowing_sub(b)
    }

    /// 128-bit addition returning the sum and a carry flag.
    pub fn add_carry(a: u128, b: u128) -> (u128, bool) {
        a.overflowing_add(b)
    }

    /// Divides a 128-bit value by a 64-bit divisor.
    /// Division by zero yields the all-ones sentinel instead of trapping.
    pub fn div_128_by_64(n: u128, d: u64) -> u128 {
        if d == 0 {
            return u128::MAX;
        }
        n / u128::from(d)
    }

    /// Computes `(a * b) mod m` without intermediate overflow.
    /// A zero modulus yields `u64::MAX`.
    pub fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
        if m == 0 {
            return u64::MAX;
        }
        ((u128::from(a) * u128::from(b)) % u128::from(m)) as u64
    }

    /// Narrows a 128-bit value, `None` if the high word is nonzero.
    pub fn narrow(v: u128) -> Option<u64> {
        if v >> 64 != 0 {
            None
        } else {
            Some(v as u64)
        }
    }
}
