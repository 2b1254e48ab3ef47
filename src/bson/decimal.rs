//! IEEE 754-2008 decimal128 values in the binary integer decimal layout.

use std::fmt;
use std::str::FromStr;

use super::BsonError;

const EXPONENT_BIAS: i32 = 6176;
const EXPONENT_MIN: i32 = -6176;
const EXPONENT_MAX: i32 = 6111;
const MAX_DIGITS: usize = 34;
/// 10^34 - 1, the largest coefficient a canonical value may carry.
const MAX_COEFFICIENT: u128 = 9_999_999_999_999_999_999_999_999_999_999_999;

/// A decimal128 value, stored as its 16 little-endian wire bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal128([u8; 16]);

enum Kind {
    Finite {
        negative: bool,
        coefficient: u128,
        exponent: i32,
    },
    Infinite {
        negative: bool,
    },
    NaN,
}

impl Decimal128 {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 16] {
        self.0
    }

    fn high_low(&self) -> (u64, u64) {
        let mut low = [0u8; 8];
        let mut high = [0u8; 8];
        low.copy_from_slice(&self.0[0..8]);
        high.copy_from_slice(&self.0[8..16]);
        (u64::from_le_bytes(high), u64::from_le_bytes(low))
    }

    fn from_parts(negative: bool, coefficient: u128, exponent: i32) -> Self {
        let biased = (exponent + EXPONENT_BIAS) as u64;
        let mut high = ((coefficient >> 64) as u64) & 0x0001_FFFF_FFFF_FFFF;
        high |= (biased & 0x3FFF) << 49;
        if negative {
            high |= 1 << 63;
        }
        let low = coefficient as u64;
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&low.to_le_bytes());
        bytes[8..16].copy_from_slice(&high.to_le_bytes());
        Self(bytes)
    }

    fn kind(&self) -> Kind {
        let (high, low) = self.high_low();
        let negative = high >> 63 == 1;
        let combination = (high >> 58) & 0x1F;

        if combination >> 3 == 0b11 {
            if combination == 0x1E {
                return Kind::Infinite { negative };
            }
            if combination == 0x1F {
                return Kind::NaN;
            }
            // Implied leading bits push the coefficient past 10^34; such
            // values are non-canonical and read as zero.
            let exponent = ((high >> 47) & 0x3FFF) as i32 - EXPONENT_BIAS;
            return Kind::Finite {
                negative,
                coefficient: 0,
                exponent,
            };
        }

        let exponent = ((high >> 49) & 0x3FFF) as i32 - EXPONENT_BIAS;
        let mut coefficient = (((high & 0x0001_FFFF_FFFF_FFFF) as u128) << 64) | low as u128;
        if coefficient > MAX_COEFFICIENT {
            coefficient = 0;
        }
        Kind::Finite {
            negative,
            coefficient,
            exponent,
        }
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind(), Kind::NaN)
    }

    /// Nearest f64.
    pub fn to_f64(&self) -> f64 {
        match self.kind() {
            Kind::NaN => f64::NAN,
            Kind::Infinite { negative: true } => f64::NEG_INFINITY,
            Kind::Infinite { negative: false } => f64::INFINITY,
            Kind::Finite { .. } => self.to_string().parse().unwrap_or(f64::NAN),
        }
    }

    /// Exact integral value, if there is one that fits in an i64.
    pub fn to_i64_exact(&self) -> Option<i64> {
        let Kind::Finite {
            negative,
            mut coefficient,
            mut exponent,
        } = self.kind()
        else {
            return None;
        };
        while exponent < 0 {
            if coefficient % 10 != 0 {
                return None;
            }
            coefficient /= 10;
            exponent += 1;
        }
        while exponent > 0 {
            coefficient = coefficient.checked_mul(10)?;
            exponent -= 1;
        }
        let value = i128::try_from(coefficient).ok()?;
        let value = if negative { -value } else { value };
        i64::try_from(value).ok()
    }

    pub fn from_i64(value: i64) -> Self {
        Self::from_parts(value < 0, value.unsigned_abs() as u128, 0)
    }
}

impl fmt::Display for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (negative, coefficient, exponent) = match self.kind() {
            Kind::NaN => return f.write_str("NaN"),
            Kind::Infinite { negative } => {
                return f.write_str(if negative { "-Infinity" } else { "Infinity" })
            }
            Kind::Finite {
                negative,
                coefficient,
                exponent,
            } => (negative, coefficient, exponent),
        };

        let mut out = String::new();
        if negative {
            out.push('-');
        }
        let digits = coefficient.to_string();
        let adjusted = digits.len() as i32 - 1 + exponent;

        if exponent > 0 || adjusted < -6 {
            out.push_str(&digits[..1]);
            if digits.len() > 1 {
                out.push('.');
                out.push_str(&digits[1..]);
            }
            out.push('E');
            if adjusted >= 0 {
                out.push('+');
            }
            out.push_str(&adjusted.to_string());
        } else if exponent == 0 {
            out.push_str(&digits);
        } else {
            let point = digits.len() as i32 + exponent;
            if point > 0 {
                let point = point as usize;
                out.push_str(&digits[..point]);
                out.push('.');
                out.push_str(&digits[point..]);
            } else {
                out.push_str("0.");
                for _ in 0..(-point) {
                    out.push('0');
                }
                out.push_str(&digits);
            }
        }
        f.write_str(&out)
    }
}

impl fmt::Debug for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal128({})", self)
    }
}

impl FromStr for Decimal128 {
    type Err = BsonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BsonError::InvalidEncoding(format!("invalid decimal128 string '{}'", s));

        let (negative, body) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };

        let lower = body.to_ascii_lowercase();
        if lower == "infinity" || lower == "inf" {
            let mut bytes = [0u8; 16];
            bytes[15] = if negative { 0xF8 } else { 0x78 };
            return Ok(Self(bytes));
        }
        if lower == "nan" {
            let mut bytes = [0u8; 16];
            bytes[15] = 0x7C;
            return Ok(Self(bytes));
        }

        let (mantissa, exp_part) = match body.find(['e', 'E']) {
            Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
            None => (body, None),
        };
        let mut exponent: i64 = match exp_part {
            Some(e) if !e.is_empty() => e.parse::<i64>().map_err(|_| bad())?,
            Some(_) => return Err(bad()),
            None => 0,
        };

        let (int_part, frac_part) = match mantissa.find('.') {
            Some(pos) => (&mantissa[..pos], &mantissa[pos + 1..]),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(bad());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(bad());
        }
        exponent -= frac_part.len() as i64;

        let all_digits = format!("{}{}", int_part, frac_part);
        let mut digits = all_digits.trim_start_matches('0').to_string();

        // Drop trailing zeros only while the value stays exact.
        while digits.len() > MAX_DIGITS && digits.ends_with('0') {
            digits.pop();
            exponent += 1;
        }
        if digits.len() > MAX_DIGITS {
            return Err(bad());
        }
        let mut coefficient: u128 = if digits.is_empty() {
            0
        } else {
            digits.parse().map_err(|_| bad())?
        };

        if coefficient == 0 {
            exponent = exponent.clamp(EXPONENT_MIN as i64, EXPONENT_MAX as i64);
        }
        while exponent > EXPONENT_MAX as i64 {
            match coefficient.checked_mul(10) {
                Some(c) if c <= MAX_COEFFICIENT => {
                    coefficient = c;
                    exponent -= 1;
                }
                _ => return Err(bad()),
            }
        }
        while exponent < EXPONENT_MIN as i64 {
            if coefficient % 10 != 0 {
                return Err(bad());
            }
            coefficient /= 10;
            exponent += 1;
        }

        Ok(Self::from_parts(negative, coefficient, exponent as i32))
    }
}
