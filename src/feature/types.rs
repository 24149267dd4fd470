use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, SecondsFormat};

/// A value travelling through the feature graph.
///
/// The graph is dynamically typed only at this level; everything below it
/// (packet fields, node state) is concretely typed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Bytes(Vec<u8>),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    DateTimeNanos(i64),
    List(Vec<FeatureValue>),
}

impl FeatureValue {
    pub fn as_number(&self) -> Option<Number> {
        match *self {
            FeatureValue::Signed(v) => Some(Number::Signed(v)),
            FeatureValue::Unsigned(v) => Some(Number::Unsigned(v)),
            FeatureValue::Float(v) => Some(Number::Float(v)),
            FeatureValue::Bool(v) => Some(Number::Unsigned(v as u64)),
            FeatureValue::DateTimeNanos(v) => Some(Number::Signed(v)),
            _ => None,
        }
    }

    /// Canonical textual form, shared by `concatenate` and the text/CSV
    /// exporters: integers in decimal, floats in shortest round-trip
    /// form, addresses in their conventional notation, timestamps in
    /// RFC 3339, octet arrays appended verbatim.
    pub fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            FeatureValue::Bool(v) => out.extend_from_slice(if *v { b"true" } else { b"false" }),
            FeatureValue::Signed(v) => out.extend_from_slice(v.to_string().as_bytes()),
            FeatureValue::Unsigned(v) => out.extend_from_slice(v.to_string().as_bytes()),
            FeatureValue::Float(v) => out.extend_from_slice(v.to_string().as_bytes()),
            FeatureValue::Bytes(b) => out.extend_from_slice(b),
            FeatureValue::Ipv4(a) => out.extend_from_slice(a.to_string().as_bytes()),
            FeatureValue::Ipv6(a) => out.extend_from_slice(a.to_string().as_bytes()),
            FeatureValue::DateTimeNanos(v) => {
                let rendered = DateTime::from_timestamp_nanos(*v)
                    .to_rfc3339_opts(SecondsFormat::Nanos, true);
                out.extend_from_slice(rendered.as_bytes());
            }
            FeatureValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    item.write_canonical(out);
                }
            }
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Vec::new();
        self.write_canonical(&mut buf);
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

impl From<Number> for FeatureValue {
    fn from(n: Number) -> Self {
        match n {
            Number::Signed(v) => FeatureValue::Signed(v),
            Number::Unsigned(v) => FeatureValue::Unsigned(v),
            Number::Float(v) => FeatureValue::Float(v),
        }
    }
}

/// Polymorphic number with the graph's up-conversion rule: Float64 wins,
/// then Signed64, then Unsigned64. Integer arithmetic wraps mod 2^64.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl Number {
    pub fn to_f64(self) -> f64 {
        match self {
            Number::Signed(v) => v as f64,
            Number::Unsigned(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    pub fn to_i64(self) -> i64 {
        match self {
            Number::Signed(v) => v,
            Number::Unsigned(v) => v as i64,
            Number::Float(v) => v as i64,
        }
    }

    /// Brings both operands to their common type.
    pub fn up_convert(a: Number, b: Number) -> (Number, Number) {
        use Number::*;
        match (a, b) {
            (Float(_), _) | (_, Float(_)) => (Float(a.to_f64()), Float(b.to_f64())),
            (Signed(_), _) | (_, Signed(_)) => (Signed(a.to_i64()), Signed(b.to_i64())),
            (Unsigned(x), Unsigned(y)) => (Unsigned(x), Unsigned(y)),
        }
    }

    pub fn add(self, other: Number) -> Number {
        match Number::up_convert(self, other) {
            (Number::Float(a), Number::Float(b)) => Number::Float(a + b),
            (Number::Signed(a), Number::Signed(b)) => Number::Signed(a.wrapping_add(b)),
            (Number::Unsigned(a), Number::Unsigned(b)) => Number::Unsigned(a.wrapping_add(b)),
            _ => unreachable!("up_convert returns matching variants"),
        }
    }

    pub fn mul(self, other: Number) -> Number {
        match Number::up_convert(self, other) {
            (Number::Float(a), Number::Float(b)) => Number::Float(a * b),
            (Number::Signed(a), Number::Signed(b)) => Number::Signed(a.wrapping_mul(b)),
            (Number::Unsigned(a), Number::Unsigned(b)) => Number::Unsigned(a.wrapping_mul(b)),
            _ => unreachable!("up_convert returns matching variants"),
        }
    }

    /// Division; integer division by zero yields `None`.
    pub fn div(self, other: Number) -> Option<Number> {
        match Number::up_convert(self, other) {
            (Number::Float(a), Number::Float(b)) => Some(Number::Float(a / b)),
            (Number::Signed(a), Number::Signed(b)) => {
                if b == 0 {
                    None
                } else {
                    Some(Number::Signed(a.wrapping_div(b)))
                }
            }
            (Number::Unsigned(a), Number::Unsigned(b)) => {
                if b == 0 {
                    None
                } else {
                    Some(Number::Unsigned(a / b))
                }
            }
            _ => unreachable!("up_convert returns matching variants"),
        }
    }

    pub fn less(self, other: Number) -> bool {
        match Number::up_convert(self, other) {
            (Number::Float(a), Number::Float(b)) => a < b,
            (Number::Signed(a), Number::Signed(b)) => a < b,
            (Number::Unsigned(a), Number::Unsigned(b)) => a < b,
            _ => unreachable!("up_convert returns matching variants"),
        }
    }

    pub fn geq(self, other: Number) -> bool {
        !self.less(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_conversion_prefers_float_then_signed() {
        let (a, b) = Number::up_convert(Number::Unsigned(3), Number::Float(1.5));
        assert_eq!(a, Number::Float(3.0));
        assert_eq!(b, Number::Float(1.5));

        let (a, b) = Number::up_convert(Number::Unsigned(3), Number::Signed(-1));
        assert_eq!(a, Number::Signed(3));
        assert_eq!(b, Number::Signed(-1));

        let (a, b) = Number::up_convert(Number::Unsigned(3), Number::Unsigned(4));
        assert_eq!(a, Number::Unsigned(3));
        assert_eq!(b, Number::Unsigned(4));
    }

    #[test]
    fn integer_arithmetic_wraps() {
        assert_eq!(
            Number::Unsigned(u64::MAX).add(Number::Unsigned(2)),
            Number::Unsigned(1)
        );
        assert_eq!(
            Number::Unsigned(u64::MAX).mul(Number::Unsigned(2)),
            Number::Unsigned(u64::MAX.wrapping_mul(2))
        );
    }

    #[test]
    fn integer_division_by_zero_is_none() {
        assert_eq!(Number::Unsigned(7).div(Number::Unsigned(0)), None);
        assert_eq!(Number::Signed(7).div(Number::Signed(0)), None);
        // float division by zero is inf, not an error
        assert!(matches!(
            Number::Float(1.0).div(Number::Float(0.0)),
            Some(Number::Float(v)) if v.is_infinite()
        ));
    }

    #[test]
    fn comparisons_after_up_conversion() {
        assert!(Number::Unsigned(2).less(Number::Float(2.5)));
        assert!(Number::Signed(-1).less(Number::Unsigned(0)));
        assert!(Number::Unsigned(100).geq(Number::Unsigned(100)));
    }
}
