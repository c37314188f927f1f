use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a decimal string cannot be read as a fixed-point value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} value '{input}'")]
pub struct ParseAmountError {
    kind: &'static str,
    input: String,
}

/// Money in minor currency units (cents).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cents(i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);
    const SCALE: i64 = 100;

    pub const fn new(cents: i64) -> Self {
        Cents(cents)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, rhs: Cents) -> Option<Cents> {
        self.0.checked_add(rhs.0).map(Cents)
    }

    pub fn checked_sub(self, rhs: Cents) -> Option<Cents> {
        self.0.checked_sub(rhs.0).map(Cents)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / Self::SCALE as u64;
        let frac = abs % Self::SCALE as u64;
        write!(f, "{sign}{whole}.{frac:02}")
    }
}

impl FromStr for Cents {
    type Err = ParseAmountError;

    /// Parses `"100"`, `"100.5"` or `"100.50"` as currency units.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed(s, 2)
            .map(Cents)
            .ok_or_else(|| ParseAmountError {
                kind: "amount",
                input: s.to_string(),
            })
    }
}

impl std::ops::Add for Cents {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Cents(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Cents {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Cents(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Cents {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Cents {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Self {
        Cents(iter.map(|c| c.0).sum())
    }
}

/// A dispensed volume with one decimal place, stored as deciliters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Liters(u32);

impl Liters {
    const SCALE: u32 = 10;

    pub const fn from_deciliters(dl: u32) -> Self {
        Liters(dl)
    }

    pub const fn whole(liters: u32) -> Self {
        Liters(liters * Self::SCALE)
    }

    pub const fn deciliters(self) -> u32 {
        self.0
    }

    /// `whole_liters / divisor`, rounded half-up to one decimal.
    pub fn fraction_of(whole_liters: u32, divisor: u32) -> Self {
        let scaled = whole_liters as u64 * Self::SCALE as u64;
        let divisor = divisor as u64;
        Liters(((scaled * 2 + divisor) / (divisor * 2)) as u32)
    }

    /// Total price of this volume, rounded half-up to the cent.
    pub fn price(self, price_per_liter: Cents) -> Cents {
        let scale = Self::SCALE as i64;
        let raw = self.0 as i64 * price_per_liter.get();
        Cents((raw * 2 + scale) / (scale * 2))
    }
}

impl fmt::Display for Liters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 / Self::SCALE, self.0 % Self::SCALE)
    }
}

impl FromStr for Liters {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAmountError {
            kind: "liters",
            input: s.to_string(),
        };
        let dl = parse_fixed(s, 1).ok_or_else(err)?;
        u32::try_from(dl).map(Liters).map_err(|_| err())
    }
}

/// Reads a non-negative decimal string into an integer scaled by `10^places`.
/// Extra fractional digits beyond `places` are rejected rather than rounded.
fn parse_fixed(s: &str, places: u32) -> Option<i64> {
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() || frac.len() > places as usize {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let scale = 10i64.pow(places);
    let whole: i64 = whole.parse().ok()?;
    let mut frac_value: i64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    for _ in frac.len()..places as usize {
        frac_value *= 10;
    }
    whole.checked_mul(scale)?.checked_add(frac_value)
}
