//! Exact fixed-point arithmetic for the three precisions used by the
//! collateral-debt system: 18 decimal digits ([`Wad`]), 27 ([`Ray`]) and 45
//! ([`Rad`]). All three are thin wrappers around [`U256`]; products are
//! computed through 512-bit intermediates so they cannot silently truncate.
//!
//! Multiplication and division floor towards zero, matching the on-chain
//! `mul`/`div` semantics the auction contracts enforce their increment checks
//! with.

use {
    alloy_primitives::{uint, U256, U512},
    bigdecimal::{BigDecimal, RoundingMode},
    num::bigint::Sign,
    std::{fmt, ops, str::FromStr},
};

pub use alloy_primitives::U256 as Uint256;

const WAD: U256 = uint!(1_000_000_000_000_000_000_U256);
const RAY: U256 = uint!(1_000_000_000_000_000_000_000_000_000_U256);
const RAD: U256 = uint!(1_000_000_000_000_000_000_000_000_000_000_000_000_000_000_000_U256);

/// 10^9, the gap between the `Wad` and `Ray` precisions.
const GAP_WAD_RAY: U256 = uint!(1_000_000_000_U256);
/// 10^27, the gap between the `Wad` and `Rad` precisions.
const GAP_WAD_RAD: U256 = RAY;

/// Narrows a 512-bit intermediate back to 256 bits.
///
/// Panics when the value does not fit. All call sites multiply quantities
/// whose product only exceeds 2^256 far outside the representable range of
/// the underlying ledger, so this is an arithmetic invariant, not a
/// recoverable error.
fn narrow(wide: U512) -> U256 {
    let limbs = wide.as_limbs();
    assert!(
        limbs[4..].iter().all(|limb| *limb == 0),
        "fixed-point product exceeds 256 bits"
    );
    U256::from_limbs(limbs[..4].try_into().unwrap())
}

fn mul_div(a: U256, b: U256, denominator: U256) -> U256 {
    narrow(U512::from(a) * U512::from(b) / U512::from(denominator))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidDecimal {
    #[error("not a decimal number")]
    Malformed,
    #[error("negative amounts are not representable")]
    Negative,
    #[error("amount exceeds 256 bits")]
    Overflow,
}

macro_rules! fixed_point {
    ($name:ident, $scale:ident, $digits:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub U256);

        impl $name {
            pub const ZERO: Self = Self(U256::ZERO);
            pub const ONE: Self = Self($scale);

            /// Wraps an already-scaled raw integer.
            pub const fn from_raw(raw: U256) -> Self {
                Self(raw)
            }

            /// Scales a whole number of units up to this precision.
            pub fn from_integer(units: u64) -> Self {
                Self(U256::from(units) * $scale)
            }

            pub fn is_zero(&self) -> bool {
                self.0.is_zero()
            }

            pub fn min(self, other: Self) -> Self {
                if self <= other { self } else { other }
            }

            pub fn max(self, other: Self) -> Self {
                if self >= other { self } else { other }
            }
        }

        impl ops::Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl ops::Sub for $name {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self {
                Self(self.0 - rhs.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let int = self.0 / $scale;
                let frac = self.0 % $scale;
                if frac.is_zero() {
                    return write!(f, "{int}");
                }
                let frac = format!("{:0>width$}", frac.to_string(), width = $digits);
                write!(f, "{int}.{}", frac.trim_end_matches('0'))
            }
        }

        impl FromStr for $name {
            type Err = InvalidDecimal;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let decimal: BigDecimal =
                    s.trim().parse().map_err(|_| InvalidDecimal::Malformed)?;
                if decimal.sign() == Sign::Minus {
                    return Err(InvalidDecimal::Negative);
                }
                // Digits beyond this precision are truncated, mirroring how
                // the ledger itself floors sub-unit remainders.
                let (int, _) = decimal
                    .with_scale_round($digits, RoundingMode::Down)
                    .into_bigint_and_exponent();
                let bytes = int
                    .to_biguint()
                    .ok_or(InvalidDecimal::Negative)?
                    .to_bytes_be();
                if bytes.len() > 32 {
                    return Err(InvalidDecimal::Overflow);
                }
                Ok(Self(U256::from_be_slice(&bytes)))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct Visitor;

                impl serde::de::Visitor<'_> for Visitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                        write!(f, "a decimal string or number")
                    }

                    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<$name, E> {
                        v.parse().map_err(E::custom)
                    }

                    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<$name, E> {
                        Ok($name::from_integer(v))
                    }

                    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<$name, E> {
                        // Models are expected to send strings; tolerate JSON
                        // numbers by going through their shortest decimal
                        // representation.
                        format!("{v}").parse().map_err(E::custom)
                    }
                }

                deserializer.deserialize_any(Visitor)
            }
        }
    };
}

fixed_point!(Wad, WAD, 18, "A token quantity with 18 decimal digits.");
fixed_point!(Ray, RAY, 27, "A rate or price with 27 decimal digits.");
fixed_point!(
    Rad,
    RAD,
    45,
    "A ledger-internal stablecoin balance with 45 decimal digits."
);

impl ops::Mul for Wad {
    type Output = Wad;

    fn mul(self, rhs: Self) -> Wad {
        Wad(mul_div(self.0, rhs.0, WAD))
    }
}

impl ops::Div for Wad {
    type Output = Wad;

    fn div(self, rhs: Self) -> Wad {
        Wad(mul_div(self.0, WAD, rhs.0))
    }
}

impl ops::Mul for Ray {
    type Output = Ray;

    fn mul(self, rhs: Self) -> Ray {
        Ray(mul_div(self.0, rhs.0, RAY))
    }
}

impl ops::Div for Ray {
    type Output = Ray;

    fn div(self, rhs: Self) -> Ray {
        Ray(mul_div(self.0, RAY, rhs.0))
    }
}

/// `Rad · Wad → Rad`, used for increment checks like `bid · beg`.
impl ops::Mul<Wad> for Rad {
    type Output = Rad;

    fn mul(self, rhs: Wad) -> Rad {
        Rad(mul_div(self.0, rhs.0, WAD))
    }
}

/// `Wad · Ray → Rad` is exact: the scales multiply out to 45 digits.
impl ops::Mul<Ray> for Wad {
    type Output = Rad;

    fn mul(self, rhs: Ray) -> Rad {
        Rad(narrow(U512::from(self.0) * U512::from(rhs.0)))
    }
}

impl Wad {
    pub fn to_ray(self) -> Ray {
        Ray(self.0 * GAP_WAD_RAY)
    }

    pub fn to_rad(self) -> Rad {
        Rad(narrow(U512::from(self.0) * U512::from(GAP_WAD_RAD)))
    }
}

impl Ray {
    /// Floors away the 9 extra digits.
    pub fn to_wad(self) -> Wad {
        Wad(self.0 / GAP_WAD_RAY)
    }
}

impl Rad {
    /// Floors away the 27 extra digits.
    pub fn to_wad(self) -> Wad {
        Wad(self.0 / GAP_WAD_RAD)
    }

    /// Rounds the 27 extra digits up, for callers that must cover this
    /// amount in full.
    pub fn to_wad_up(self) -> Wad {
        let floored = self.0 / GAP_WAD_RAD;
        if (self.0 % GAP_WAD_RAD).is_zero() {
            Wad(floored)
        } else {
            Wad(floored + U256::from(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wad(s: &str) -> Wad {
        s.parse().unwrap()
    }

    fn rad(s: &str) -> Rad {
        s.parse().unwrap()
    }

    #[test]
    fn multiplication_floors() {
        assert_eq!(wad("1.5") * wad("1.5"), wad("2.25"));
        // 1 wei-sized remainder is floored away.
        assert_eq!(
            Wad(U256::from(3)) * wad("0.5"),
            Wad(U256::from(1)),
        );
    }

    #[test]
    fn division_floors() {
        // 50000 / 110 = 454.5454…, the surplus digits truncate.
        let lot = wad("50000") / wad("110");
        assert_eq!(lot.to_string(), "454.545454545454545454");
    }

    #[test]
    fn surplus_auction_bid_arithmetic() {
        // lot / price with a 50 000 stablecoin lot priced at 10.
        let lot = rad("50000");
        let price = wad("10");
        assert_eq!(lot.to_wad() / price, wad("5000"));
    }

    #[test]
    fn increment_check_arithmetic() {
        let bid = rad("100");
        let beg = wad("1.05");
        assert_eq!(bid * beg, rad("105"));
    }

    #[test]
    fn wad_times_ray_is_exact() {
        let lot = wad("2");
        let price: Ray = "150.5".parse().unwrap();
        assert_eq!(lot * price, rad("301"));
    }

    #[test]
    fn conversions_round_trip() {
        let amount = wad("123.456");
        assert_eq!(amount.to_ray().to_wad(), amount);
        assert_eq!(amount.to_rad().to_wad(), amount);
    }

    #[test]
    fn to_wad_up_covers_remainders() {
        let amount = Rad(rad("1").0 + U256::from(1));
        assert_eq!(amount.to_wad(), Wad::from_integer(1));
        assert_eq!(amount.to_wad_up(), Wad(WAD + U256::from(1)));
        assert_eq!(rad("1").to_wad_up(), Wad::from_integer(1));
    }

    #[test]
    fn parses_and_formats() {
        assert_eq!(wad("0").to_string(), "0");
        assert_eq!(wad("5000").to_string(), "5000");
        assert_eq!(wad("0.625").to_string(), "0.625");
        assert_eq!(wad("00012.500").to_string(), "12.5");
        // Digits beyond the precision truncate.
        assert_eq!(
            wad("1.0000000000000000019"),
            Wad(WAD + U256::from(1)),
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!("nope".parse::<Wad>(), Err(InvalidDecimal::Malformed));
        assert_eq!("-1".parse::<Wad>(), Err(InvalidDecimal::Negative));
        assert!("1e100".parse::<Rad>().is_err());
    }

    #[test]
    fn serde_accepts_strings_and_numbers() {
        #[derive(serde::Deserialize)]
        struct Holder {
            price: Wad,
        }
        let from_string: Holder = serde_json::from_str(r#"{"price": "10.5"}"#).unwrap();
        let from_float: Holder = serde_json::from_str(r#"{"price": 10.5}"#).unwrap();
        let from_int: Holder = serde_json::from_str(r#"{"price": 10}"#).unwrap();
        assert_eq!(from_string.price, wad("10.5"));
        assert_eq!(from_float.price, wad("10.5"));
        assert_eq!(from_int.price, wad("10"));

        assert_eq!(serde_json::to_string(&wad("10.5")).unwrap(), r#""10.5""#);
    }

    #[test]
    #[should_panic(expected = "fixed-point product exceeds 256 bits")]
    fn oversized_products_panic() {
        let huge = Wad(U256::MAX);
        let _ = huge * huge;
    }
}
