//! Denomination arithmetic.
//!
//! All monetary math inside the engine is carried out in integer base units
//! (satoshis, drops, ..). Conversion to and from the human-facing main
//! denomination only happens at contract boundaries, through arbitrary
//! precision decimals.

use std::{fmt, str::FromStr};

use bigdecimal::{
    num_bigint::{BigInt, Sign},
    BigDecimal, RoundingMode, ToPrimitive,
};

/// An error when converting between denominations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    /// Not a decimal number.
    Malformed(String),
    /// Negative where a non-negative value is required.
    Negative(String),
    /// A fractional part finer than one base unit.
    PrecisionLoss(String, u8),
    /// Out of range for base-unit integers.
    Overflow(String),
}

impl fmt::Display for AmountError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(s) => write!(f, "Invalid decimal amount '{}'.", s),
            Self::Negative(s) => write!(f, "Negative amount '{}' where a non-negative one is required.", s),
            Self::PrecisionLoss(s, decimals) => write!(
                f,
                "Amount '{}' has a fractional part finer than one base unit ({} decimals).",
                s, decimals
            ),
            Self::Overflow(s) => write!(f, "Amount '{}' does not fit in base units.", s),
        }
    }
}

impl std::error::Error for AmountError {}

/// The conversion factor between an asset's main and base denominations.
///
/// A `Denomination` never performs lossy conversions: a main value finer than
/// one base unit is rejected, not rounded. Fee derivation uses the explicit
/// directed rounding helpers instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denomination {
    decimals: u8,
}

impl Denomination {
    pub fn new(decimals: u8) -> Denomination {
        Denomination { decimals }
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    /// `10^decimals` as a decimal.
    fn scale_factor(&self) -> BigDecimal {
        BigDecimal::new(BigInt::from(1), -i64::from(self.decimals))
    }

    /// Parse a main-denomination decimal string.
    pub fn parse_main(&self, main: &str) -> Result<BigDecimal, AmountError> {
        BigDecimal::from_str(main.trim()).map_err(|_| AmountError::Malformed(main.to_string()))
    }

    /// Convert a main-denomination decimal string to integer base units.
    ///
    /// Fails if the value is negative or has a fractional part finer than one
    /// base unit.
    pub fn main_to_base(&self, main: &str) -> Result<u64, AmountError> {
        let parsed = self.parse_main(main)?;
        if parsed.sign() == Sign::Minus {
            return Err(AmountError::Negative(main.to_string()));
        }
        let scaled = &parsed * self.scale_factor();
        if !scaled.is_integer() {
            return Err(AmountError::PrecisionLoss(main.to_string(), self.decimals));
        }
        scaled
            .to_u64()
            .ok_or_else(|| AmountError::Overflow(main.to_string()))
    }

    /// Convert integer base units into a normalized main-denomination string.
    pub fn base_to_main(&self, base: u64) -> String {
        let dec = BigDecimal::new(BigInt::from(base), i64::from(self.decimals));
        dec.normalized().to_plain_string()
    }

    /// Convert signed base units into a main-denomination string, keeping the
    /// sign. Used for balance activity amounts, where outbound movements are
    /// negative.
    pub fn signed_base_to_main(&self, base: i128) -> String {
        let dec = BigDecimal::new(BigInt::from(base), i64::from(self.decimals));
        dec.normalized().to_plain_string()
    }

    /// Round a non-negative decimal value, already expressed in base units,
    /// up to the next integer.
    pub fn ceil_base_units(&self, value: &BigDecimal) -> Result<u64, AmountError> {
        if value.sign() == Sign::Minus {
            return Err(AmountError::Negative(value.to_string()));
        }
        value
            .with_scale_round(0, RoundingMode::Ceiling)
            .to_u64()
            .ok_or_else(|| AmountError::Overflow(value.to_string()))
    }

    /// Round a non-negative decimal value, already expressed in base units,
    /// down to the previous integer.
    pub fn floor_base_units(&self, value: &BigDecimal) -> Result<u64, AmountError> {
        if value.sign() == Sign::Minus {
            return Err(AmountError::Negative(value.to_string()));
        }
        value
            .with_scale_round(0, RoundingMode::Floor)
            .to_u64()
            .ok_or_else(|| AmountError::Overflow(value.to_string()))
    }

    /// Scale a main-denomination decimal into (unrounded) base units.
    pub fn main_to_base_decimal(&self, main: &BigDecimal) -> BigDecimal {
        main * self.scale_factor()
    }
}

/// Sum base-unit values, failing on overflow rather than wrapping.
pub fn checked_sum<I: IntoIterator<Item = u64>>(values: I) -> Result<u64, AmountError> {
    let mut total: u64 = 0;
    for v in values {
        total = total
            .checked_add(v)
            .ok_or_else(|| AmountError::Overflow(format!("{} + {}", total, v)))?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_to_base_conversions() {
        let btc = Denomination::new(8);
        assert_eq!(btc.main_to_base("1").unwrap(), 100_000_000);
        assert_eq!(btc.main_to_base("0.00000001").unwrap(), 1);
        assert_eq!(btc.main_to_base("0").unwrap(), 0);
        assert_eq!(btc.main_to_base("21000000").unwrap(), 2_100_000_000_000_000);
        assert_eq!(btc.main_to_base(" 0.5 ").unwrap(), 50_000_000);

        let xrp = Denomination::new(6);
        assert_eq!(xrp.main_to_base("12.345678").unwrap(), 12_345_678);
    }

    #[test]
    fn main_to_base_rejects_sub_base_unit_fractions() {
        let btc = Denomination::new(8);
        assert_eq!(
            btc.main_to_base("0.000000001"),
            Err(AmountError::PrecisionLoss("0.000000001".to_string(), 8))
        );
        // Trailing zeroes beyond the base unit are not a precision loss.
        assert_eq!(btc.main_to_base("0.000000010000").unwrap(), 1);
    }

    #[test]
    fn main_to_base_rejects_garbage_and_negatives() {
        let d = Denomination::new(8);
        assert_eq!(d.main_to_base("12..3"), Err(AmountError::Malformed("12..3".to_string())));
        assert_eq!(d.main_to_base(""), Err(AmountError::Malformed("".to_string())));
        assert_eq!(d.main_to_base("-1"), Err(AmountError::Negative("-1".to_string())));
    }

    #[test]
    fn base_to_main_is_normalized() {
        let d = Denomination::new(8);
        assert_eq!(d.base_to_main(100_000_000), "1");
        assert_eq!(d.base_to_main(150_000_000), "1.5");
        assert_eq!(d.base_to_main(1), "0.00000001");
        assert_eq!(d.base_to_main(0), "0");
    }

    #[test]
    fn signed_formatting() {
        let d = Denomination::new(6);
        assert_eq!(d.signed_base_to_main(-1_500_000), "-1.5");
        assert_eq!(d.signed_base_to_main(1), "0.000001");
        assert_eq!(d.signed_base_to_main(-2_000_000), "-2");
    }

    #[test]
    fn directed_rounding() {
        let d = Denomination::new(8);
        let v = BigDecimal::from_str("1919.2").unwrap();
        assert_eq!(d.ceil_base_units(&v).unwrap(), 1920);
        assert_eq!(d.floor_base_units(&v).unwrap(), 1919);
        let exact = BigDecimal::from_str("42").unwrap();
        assert_eq!(d.ceil_base_units(&exact).unwrap(), 42);
        assert_eq!(d.floor_base_units(&exact).unwrap(), 42);
    }

    #[test]
    fn checked_sum_overflows() {
        assert_eq!(checked_sum(vec![1, 2, 3]).unwrap(), 6);
        assert!(checked_sum(vec![u64::MAX, 1]).is_err());
    }
}
