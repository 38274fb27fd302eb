//! Clamped cart line quantity.

use serde::{Deserialize, Serialize};

/// A cart line quantity, always within `[Quantity::MIN, Quantity::MAX]`.
///
/// Every constructor clamps, so a `Quantity` can never hold an out-of-range
/// value. Deserialization clamps too, which keeps corrupt cached carts and
/// sloppy server payloads from smuggling in zero or negative quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "i64", into = "u32")]
pub struct Quantity(u32);

impl Quantity {
    /// Smallest quantity a line may hold.
    pub const MIN: u32 = 1;
    /// Largest quantity a line may hold.
    pub const MAX: u32 = 99;

    /// Clamp an arbitrary requested quantity into range.
    ///
    /// Requests of zero or below become `MIN`; anything above `MAX` is capped.
    #[must_use]
    pub fn clamped(requested: i64) -> Self {
        let value = requested.clamp(i64::from(Self::MIN), i64::from(Self::MAX));
        // The clamp above keeps the value within u32 range.
        Self(u32::try_from(value).unwrap_or(Self::MIN))
    }

    /// Get the underlying value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Add `extra` units, clamping the result.
    #[must_use]
    pub fn saturating_add(self, extra: Self) -> Self {
        Self::clamped(i64::from(self.0) + i64::from(extra.0))
    }
}

impl Default for Quantity {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl From<i64> for Quantity {
    fn from(requested: i64) -> Self {
        Self::clamped(requested)
    }
}

impl From<Quantity> for u32 {
    fn from(quantity: Quantity) -> Self {
        quantity.0
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps_low_values_to_one() {
        for requested in [0, -1, -99, i64::MIN] {
            assert_eq!(Quantity::clamped(requested).get(), 1, "requested {requested}");
        }
    }

    #[test]
    fn test_clamps_high_values_to_ninety_nine() {
        for requested in [100, 150, 10_000, i64::MAX] {
            assert_eq!(Quantity::clamped(requested).get(), 99, "requested {requested}");
        }
    }

    #[test]
    fn test_in_range_values_pass_through() {
        assert_eq!(Quantity::clamped(1).get(), 1);
        assert_eq!(Quantity::clamped(42).get(), 42);
        assert_eq!(Quantity::clamped(99).get(), 99);
    }

    #[test]
    fn test_saturating_add_caps() {
        let q = Quantity::clamped(90).saturating_add(Quantity::clamped(20));
        assert_eq!(q.get(), 99);
    }

    #[test]
    fn test_deserialize_clamps() {
        let q: Quantity = serde_json::from_str("0").unwrap();
        assert_eq!(q.get(), 1);
        let q: Quantity = serde_json::from_str("250").unwrap();
        assert_eq!(q.get(), 99);
        assert_eq!(serde_json::to_string(&Quantity::clamped(7)).unwrap(), "7");
    }
}
