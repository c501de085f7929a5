//! Fixed-point money.
//!
//! Every amount is an integer count of the currency's minor unit (cents for MXN, USD,
//! EUR, ...). Decimal strings only exist at the API boundary, where they are parsed
//! exactly with `bigdecimal`; nothing in the ledger ever touches a float.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::error::MoneyError;

/// ISO 4217 alphabetic code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

impl Currency {
    pub const MXN: Currency = Currency(*b"MXN");

    /// Number of decimal digits of the minor unit.
    pub fn minor_digits(&self) -> u32 {
        match self.as_str() {
            "JPY" | "KRW" | "CLP" | "VND" | "ISK" => 0,
            "BHD" | "KWD" | "JOD" | "OMR" | "TND" => 3,
            _ => 2,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(MoneyError::InvalidCurrency(s.to_string()));
        }
        Ok(Currency([
            bytes[0].to_ascii_uppercase(),
            bytes[1].to_ascii_uppercase(),
            bytes[2].to_ascii_uppercase(),
        ]))
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signed amount of minor units in one currency.
///
/// Shares and payments are never negative; balances are, which is why the type is
/// signed and `checked_sub` is the non-negative variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    minor: i64,
    currency: Currency,
}

impl Money {
    pub fn new(minor: i64, currency: Currency) -> Self {
        Self { minor, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(0, currency)
    }

    pub fn minor(&self) -> i64 {
        self.minor
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.minor == 0
    }

    pub fn is_positive(&self) -> bool {
        self.minor > 0
    }

    pub fn is_negative(&self) -> bool {
        self.minor < 0
    }

    fn same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }

    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        self.same_currency(&other)?;
        let minor = self
            .minor
            .checked_add(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, self.currency))
    }

    /// Subtraction for quantities that must stay non-negative.
    pub fn checked_sub(self, other: Money) -> Result<Money, MoneyError> {
        let result = self.signed_sub(other)?;
        if result.is_negative() {
            return Err(MoneyError::NegativeResult {
                minuend: self,
                subtrahend: other,
            });
        }
        Ok(result)
    }

    /// Subtraction that may go below zero (balances).
    pub fn signed_sub(self, other: Money) -> Result<Money, MoneyError> {
        self.same_currency(&other)?;
        let minor = self
            .minor
            .checked_sub(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, self.currency))
    }

    pub fn negated(self) -> Money {
        Money::new(-self.minor, self.currency)
    }

    pub fn compare(&self, other: &Money) -> Result<Ordering, MoneyError> {
        self.same_currency(other)?;
        Ok(self.minor.cmp(&other.minor))
    }

    /// Splits into `parts` amounts that add up to `self` exactly.
    ///
    /// Everyone gets `floor(total / parts)`; the `total % parts` leftover minor units go
    /// one each to the parts starting at index `first` and wrapping around.
    pub fn split_even(self, parts: usize, first: usize) -> Result<Vec<Money>, MoneyError> {
        if parts == 0 {
            return Err(MoneyError::ZeroParts);
        }
        if self.is_negative() {
            return Err(MoneyError::InvalidAmount(format!(
                "cannot split negative amount {self}"
            )));
        }
        let n = i64::try_from(parts).map_err(|_| MoneyError::Overflow)?;
        let base = self.minor / n;
        let remainder = usize::try_from(self.minor % n).map_err(|_| MoneyError::Overflow)?;
        let first = first % parts;

        Ok((0..parts)
            .map(|idx| {
                let offset = (idx + parts - first) % parts;
                let extra = if offset < remainder { 1 } else { 0 };
                Money::new(base + extra, self.currency)
            })
            .collect())
    }

    pub fn sum<I>(currency: Currency, amounts: I) -> Result<Money, MoneyError>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::zero(currency), Money::checked_add)
    }

    /// Parses a decimal string such as `"33.34"`. More decimal places than the currency
    /// has are rejected rather than rounded.
    pub fn parse(input: &str, currency: Currency) -> Result<Money, MoneyError> {
        Money::from_decimal(&parse_decimal(input)?, currency)
    }

    pub fn from_decimal(value: &BigDecimal, currency: Currency) -> Result<Money, MoneyError> {
        check_magnitude(value)?;
        let scaled = value * Self::minor_factor(currency);
        if !scaled.is_integer() {
            return Err(MoneyError::InvalidAmount(format!(
                "{value} has more than {} decimal places",
                currency.minor_digits()
            )));
        }
        let minor = scaled.to_i64().ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, currency))
    }

    /// Converts an external decimal, rounding half-to-even to the minor unit.
    pub fn from_decimal_rounded(
        value: &BigDecimal,
        currency: Currency,
    ) -> Result<Money, MoneyError> {
        check_magnitude(value)?;
        let scaled =
            (value * Self::minor_factor(currency)).with_scale_round(0, RoundingMode::HalfEven);
        let minor = scaled.to_i64().ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, currency))
    }

    fn minor_factor(currency: Currency) -> BigDecimal {
        BigDecimal::from(10_i64.pow(currency.minor_digits()))
    }

    /// The amount without the currency code, e.g. `"-12.05"`.
    pub fn to_decimal_string(&self) -> String {
        let digits = self.currency.minor_digits();
        if digits == 0 {
            return self.minor.to_string();
        }
        let factor = 10_u64.pow(digits);
        let abs = self.minor.unsigned_abs();
        let sign = if self.minor < 0 { "-" } else { "" };
        format!(
            "{sign}{}.{:0width$}",
            abs / factor,
            abs % factor,
            width = digits as usize
        )
    }
}

/// Longest decimal string accepted from the outside, sign and point included.
const MAX_AMOUNT_LEN: usize = 40;

/// Widest exponent a decimal may carry before it reaches the minor-unit conversion.
const MAX_EXPONENT: u64 = 40;

/// Parses plain `[+-]digits[.digits]` text. Exponent notation is refused so a short
/// string can never describe a number with millions of digits.
pub fn parse_decimal(input: &str) -> Result<BigDecimal, MoneyError> {
    let text = input.trim();
    let unsigned = text.strip_prefix(['+', '-']).unwrap_or(text);
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let plain = text.len() <= MAX_AMOUNT_LEN
        && !(whole.is_empty() && fraction.is_empty())
        && whole.bytes().all(|b| b.is_ascii_digit())
        && fraction.bytes().all(|b| b.is_ascii_digit());
    if !plain {
        return Err(MoneyError::InvalidAmount(input.to_string()));
    }
    BigDecimal::from_str(text).map_err(|_| MoneyError::InvalidAmount(input.to_string()))
}

fn check_magnitude(value: &BigDecimal) -> Result<(), MoneyError> {
    let (digits, exponent) = value.as_bigint_and_exponent();
    if digits.bits() > 128 || exponent.unsigned_abs() > MAX_EXPONENT {
        return Err(MoneyError::Overflow);
    }
    Ok(())
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_decimal_string(), self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mxn() -> Currency {
        "MXN".parse().unwrap()
    }

    fn minors(values: &[Money]) -> Vec<i64> {
        values.iter().map(Money::minor).collect()
    }

    #[test]
    fn currency_codes_are_normalized() {
        let code: Currency = "mxn".parse().unwrap();
        assert_eq!(code.as_str(), "MXN");
        assert!("MX".parse::<Currency>().is_err());
        assert!("M1N".parse::<Currency>().is_err());
    }

    #[test]
    fn parse_is_exact() {
        assert_eq!(Money::parse("100.01", mxn()).unwrap().minor(), 10001);
        assert_eq!(Money::parse("5", mxn()).unwrap().minor(), 500);
        assert_eq!(Money::parse("0.50", mxn()).unwrap().minor(), 50);
        assert!(matches!(
            Money::parse("1.005", mxn()),
            Err(MoneyError::InvalidAmount(_))
        ));
        assert!(Money::parse("abc", mxn()).is_err());
    }

    #[test]
    fn parse_respects_zero_digit_currencies() {
        let jpy: Currency = "JPY".parse().unwrap();
        assert_eq!(Money::parse("1500", jpy).unwrap().minor(), 1500);
        assert!(Money::parse("1500.5", jpy).is_err());
    }

    #[test]
    fn rounded_conversion_uses_half_even() {
        let value = BigDecimal::from_str("12.345").unwrap();
        assert_eq!(Money::from_decimal_rounded(&value, mxn()).unwrap().minor(), 1234);
        let value = BigDecimal::from_str("12.355").unwrap();
        assert_eq!(Money::from_decimal_rounded(&value, mxn()).unwrap().minor(), 1236);
    }

    #[test]
    fn exponent_notation_is_refused_before_expansion() {
        for input in ["1e9223372036854775807", "1e30000000", "1E2", "5e-3"] {
            assert!(
                matches!(Money::parse(input, mxn()), Err(MoneyError::InvalidAmount(_))),
                "{input} should be rejected"
            );
        }
        let long = "1".repeat(MAX_AMOUNT_LEN + 1);
        assert!(Money::parse(&long, mxn()).is_err());
        assert!(Money::parse(".", mxn()).is_err());
        assert!(Money::parse("--5", mxn()).is_err());
        assert_eq!(Money::parse(" +12.5 ", mxn()).unwrap().minor(), 1250);
    }

    #[test]
    fn huge_exponents_fail_fast_in_decimal_conversion() {
        let huge = BigDecimal::from_str("1e30000000").unwrap();
        assert_eq!(Money::from_decimal(&huge, mxn()), Err(MoneyError::Overflow));
        assert_eq!(Money::from_decimal_rounded(&huge, mxn()), Err(MoneyError::Overflow));

        let tiny = BigDecimal::from_str("1e-30000000").unwrap();
        assert_eq!(Money::from_decimal_rounded(&tiny, mxn()), Err(MoneyError::Overflow));
    }

    #[test]
    fn display_pads_minor_units() {
        assert_eq!(Money::new(3334, mxn()).to_string(), "33.34 MXN");
        assert_eq!(Money::new(5, mxn()).to_decimal_string(), "0.05");
        assert_eq!(Money::new(-1205, mxn()).to_decimal_string(), "-12.05");
    }

    #[test]
    fn checked_sub_refuses_negative_results() {
        let err = Money::new(100, mxn())
            .checked_sub(Money::new(101, mxn()))
            .unwrap_err();
        assert!(matches!(err, MoneyError::NegativeResult { .. }));
        assert_eq!(
            Money::new(100, mxn())
                .signed_sub(Money::new(101, mxn()))
                .unwrap()
                .minor(),
            -1
        );
    }

    #[test]
    fn arithmetic_checks_currency() {
        let usd: Currency = "USD".parse().unwrap();
        let err = Money::new(1, mxn()).checked_add(Money::new(1, usd)).unwrap_err();
        assert!(matches!(err, MoneyError::CurrencyMismatch { .. }));
        assert!(Money::new(1, mxn()).compare(&Money::new(1, usd)).is_err());
    }

    #[test]
    fn split_even_gives_remainder_from_first_index() {
        let parts = Money::new(10001, mxn()).split_even(3, 0).unwrap();
        assert_eq!(minors(&parts), vec![3334, 3334, 3333]);

        let parts = Money::new(10001, mxn()).split_even(3, 2).unwrap();
        assert_eq!(minors(&parts), vec![3334, 3333, 3334]);

        let parts = Money::new(10000, mxn()).split_even(3, 1).unwrap();
        assert_eq!(minors(&parts), vec![3333, 3334, 3333]);
    }

    #[test]
    fn split_even_rejects_zero_parts() {
        assert_eq!(
            Money::new(100, mxn()).split_even(0, 0),
            Err(MoneyError::ZeroParts)
        );
    }

    proptest! {
        #[test]
        fn split_even_preserves_total(
            total in 0i64..=10_000_000,
            parts in 1usize..=60,
            first in 0usize..60,
        ) {
            let split = Money::new(total, mxn()).split_even(parts, first).unwrap();
            prop_assert_eq!(split.len(), parts);
            let sum: i64 = split.iter().map(Money::minor).sum();
            prop_assert_eq!(sum, total);
            let max = split.iter().map(Money::minor).max().unwrap();
            let min = split.iter().map(Money::minor).min().unwrap();
            prop_assert!(max - min <= 1);
        }
    }
}
