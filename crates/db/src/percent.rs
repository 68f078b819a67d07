//! Fixed-point percentage type for traffic weights.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A percentage in [0.00, 100.00] carried as integer hundredths.
///
/// Weight arithmetic happens on the integer representation so cumulative
/// sums across variants never accumulate float drift; floats appear only at
/// the JSON boundary. Out-of-range and over-precise inputs are clamped and
/// rounded to two decimal places before they reach storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct Percent(i64);

impl Percent {
    pub const ZERO: Percent = Percent(0);
    pub const FULL: Percent = Percent(10_000);

    /// Clamp into [0, 100] and round to two decimal places.
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return Self::ZERO;
        }
        Self(((value * 100.0).round().clamp(0.0, 10_000.0)) as i64)
    }

    pub fn from_hundredths(hundredths: i64) -> Self {
        Self(hundredths.clamp(0, 10_000))
    }

    pub fn hundredths(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Percent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Percent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Ok(Self::from_f64(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range_values() {
        assert_eq!(Percent::from_f64(-3.0), Percent::ZERO);
        assert_eq!(Percent::from_f64(250.0), Percent::FULL);
        assert_eq!(Percent::from_f64(f64::NAN), Percent::ZERO);
    }

    #[test]
    fn rounds_to_two_decimal_places() {
        assert_eq!(Percent::from_f64(33.333).hundredths(), 3333);
        assert_eq!(Percent::from_f64(33.335).hundredths(), 3334);
        assert_eq!(Percent::from_f64(50.0).hundredths(), 5000);
    }

    #[test]
    fn displays_with_two_decimals() {
        assert_eq!(Percent::from_hundredths(5000).to_string(), "50.00");
        assert_eq!(Percent::from_hundredths(7).to_string(), "0.07");
        assert_eq!(Percent::from_hundredths(10_000).to_string(), "100.00");
    }

    #[test]
    fn serde_round_trip() {
        let p = Percent::from_f64(12.34);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "12.34");
        let back: Percent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn deserializes_integers() {
        let p: Percent = serde_json::from_str("70").unwrap();
        assert_eq!(p.hundredths(), 7000);
    }
}
