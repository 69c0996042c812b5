//! Runtime values and round-trippable textual forms for scalars.
//!
//! Every cell of a batch decodes to a [`Value`]. Scalar parsing and
//! formatting are inverses for duration, timestamp, IP, and subnet, which is
//! what allows string columns to upgrade to richer types during ingest and
//! still print back losslessly.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};

use crate::errors::EngineError;
use crate::types::TypeKind;

/// An IP subnet in CIDR form. Host bits are always masked off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    addr: IpAddr,
    prefix: u8,
}

impl Subnet {
    /// Create a subnet, masking host bits of `addr` beyond `prefix`.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, EngineError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(EngineError::parse(format!(
                "subnet prefix {prefix} exceeds maximum of {max}"
            )));
        }
        let addr = match addr {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4);
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
                IpAddr::V4(Ipv4Addr::from(bits & mask))
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6);
                let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) };
                IpAddr::V6(Ipv6Addr::from(bits & mask))
            }
        };
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `ip` falls inside this subnet.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                u32::from(ip) & mask == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                u128::from(ip) & mask == u128::from(net)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| EngineError::parse(format!("`{s}` is not in CIDR form")))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| EngineError::parse(format!("`{addr}` is not an IP address")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| EngineError::parse(format!("`{prefix}` is not a prefix length")))?;
        Self::new(addr, prefix)
    }
}

/// A single runtime value.
///
/// `Double` follows IEEE semantics: NaN never compares equal, so deduplication
/// and equality checks treat NaN cells as distinct.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    Blob(Vec<u8>),
    Duration(TimeDelta),
    Timestamp(DateTime<Utc>),
    Ip(IpAddr),
    Subnet(Subnet),
    List(Vec<Value>),
    Record(Vec<(String, Value)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int64",
            Value::UInt(_) => "uint64",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Blob(_) => "blob",
            Value::Duration(_) => "duration",
            Value::Timestamp(_) => "timestamp",
            Value::Ip(_) => "ip",
            Value::Subnet(_) => "subnet",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    /// Numeric view of the value, if it has one. NaN is preserved.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Total order used by `sort`: values order by kind first, numerics
    /// compare across int/uint/double, NaN orders after finite doubles, and
    /// null orders last.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Bool(_) => 0,
                Value::Int(_) | Value::UInt(_) | Value::Double(_) => 1,
                Value::String(_) => 2,
                Value::Blob(_) => 3,
                Value::Duration(_) => 4,
                Value::Timestamp(_) => 5,
                Value::Ip(_) => 6,
                Value::Subnet(_) => 7,
                Value::List(_) => 8,
                Value::Record(_) => 9,
                Value::Null => 10,
            }
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::UInt(a), Value::UInt(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (a, b) if rank(a) == 1 && rank(b) == 1 => {
                // Mixed numeric kinds: compare through f64's total order,
                // which places NaN after all finite values.
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (Value::Duration(a), Value::Duration(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Ip(a), Value::Ip(b)) => a.cmp(b),
            (Value::Subnet(a), Value::Subnet(b)) => {
                (a.addr(), a.prefix()).cmp(&(b.addr(), b.prefix()))
            }
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.total_cmp(y) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Record(a), Value::Record(b)) => {
                for ((an, av), (bn, bv)) in a.iter().zip(b.iter()) {
                    match an.cmp(bn).then_with(|| av.total_cmp(bv)) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }

    /// Checked addition. Integer overflow and kind mismatches are type
    /// errors; mixed numeric kinds widen to double.
    pub fn checked_add(&self, other: &Value) -> Result<Value, EngineError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| EngineError::type_error("integer overflow in addition")),
            (Value::UInt(a), Value::UInt(b)) => a
                .checked_add(*b)
                .map(Value::UInt)
                .ok_or_else(|| EngineError::type_error("integer overflow in addition")),
            (Value::Double(a), Value::Double(b)) => Ok(Value::Double(a + b)),
            (Value::Duration(a), Value::Duration(b)) => a
                .checked_add(b)
                .map(Value::Duration)
                .ok_or_else(|| EngineError::type_error("duration overflow in addition")),
            (Value::Timestamp(a), Value::Duration(b)) => a
                .checked_add_signed(*b)
                .map(Value::Timestamp)
                .ok_or_else(|| EngineError::type_error("timestamp overflow in addition")),
            (a, b) if a.as_f64().is_some() && b.as_f64().is_some() => {
                Ok(Value::Double(a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN)))
            }
            (a, b) => Err(EngineError::type_error(format!(
                "cannot add {} and {}",
                a.kind_name(),
                b.kind_name()
            ))),
        }
    }

    /// Checked division. Division by zero is a type error.
    pub fn checked_div(&self, other: &Value) -> Result<Value, EngineError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err(EngineError::type_error("division by zero"));
                }
                a.checked_div(*b)
                    .map(Value::Int)
                    .ok_or_else(|| EngineError::type_error("integer overflow in division"))
            }
            (Value::UInt(a), Value::UInt(b)) => {
                if *b == 0 {
                    return Err(EngineError::type_error("division by zero"));
                }
                Ok(Value::UInt(a / b))
            }
            (Value::Double(a), Value::Double(b)) => {
                if *b == 0.0 {
                    return Err(EngineError::type_error("division by zero"));
                }
                Ok(Value::Double(a / b))
            }
            (a, b) if a.as_f64().is_some() && b.as_f64().is_some() => {
                let divisor = b.as_f64().unwrap_or(f64::NAN);
                if divisor == 0.0 {
                    return Err(EngineError::type_error("division by zero"));
                }
                Ok(Value::Double(a.as_f64().unwrap_or(f64::NAN) / divisor))
            }
            (a, b) => Err(EngineError::type_error(format!(
                "cannot divide {} by {}",
                a.kind_name(),
                b.kind_name()
            ))),
        }
    }
}

/// Sum a sequence of numeric values. Null and NaN cells are skipped; an
/// all-null input sums to null. Integer overflow fails.
pub fn sum<'a>(values: impl IntoIterator<Item = &'a Value>) -> Result<Value, EngineError> {
    let mut acc: Option<Value> = None;
    for value in values {
        if value.is_null() {
            continue;
        }
        if let Value::Double(d) = value {
            if d.is_nan() {
                continue;
            }
        }
        acc = Some(match acc {
            None => value.clone(),
            Some(prev) => prev.checked_add(value)?,
        });
    }
    Ok(acc.unwrap_or(Value::Null))
}

/// Median of the numeric values in a sequence, skipping null and NaN. An
/// even-sized input yields the mean of the two middle values.
pub fn median<'a>(values: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut doubles: Vec<f64> = values
        .into_iter()
        .filter_map(Value::as_f64)
        .filter(|d| !d.is_nan())
        .collect();
    if doubles.is_empty() {
        return Value::Null;
    }
    doubles.sort_by(f64::total_cmp);
    let mid = doubles.len() / 2;
    if doubles.len() % 2 == 1 {
        Value::Double(doubles[mid])
    } else {
        Value::Double((doubles[mid - 1] + doubles[mid]) / 2.0)
    }
}

const NANOS_PER_UNIT: &[(&str, i64)] = &[
    ("d", 86_400_000_000_000),
    ("h", 3_600_000_000_000),
    ("min", 60_000_000_000),
    ("s", 1_000_000_000),
    ("ms", 1_000_000),
    ("us", 1_000),
    ("ns", 1),
];

/// Format a duration with the largest unit that divides it evenly, e.g.
/// `90s`, `2min`, `1500ms`. The inverse of [`parse_duration`].
pub fn format_duration(d: TimeDelta) -> String {
    let nanos = d.num_nanoseconds().unwrap_or(i64::MAX);
    if nanos == 0 {
        return "0s".into();
    }
    let (sign, magnitude) = if nanos < 0 {
        ("-", nanos.unsigned_abs())
    } else {
        ("", nanos.unsigned_abs())
    };
    for (unit, per) in NANOS_PER_UNIT {
        let per = *per as u64;
        if magnitude % per == 0 {
            return format!("{sign}{}{unit}", magnitude / per);
        }
    }
    format!("{sign}{magnitude}ns")
}

/// Parse a duration of the form `<number><unit>` with units
/// `ns`, `us`, `ms`, `s`, `min`, `h`, `d`. Fractional numbers are accepted.
pub fn parse_duration(s: &str) -> Option<TimeDelta> {
    let s = s.trim();
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = s.split_at(split);
    let number = number.trim();
    if number.is_empty() {
        return None;
    }
    let per = NANOS_PER_UNIT
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, per)| *per)?;
    if let Ok(whole) = number.parse::<i64>() {
        return whole.checked_mul(per).map(TimeDelta::nanoseconds);
    }
    let fraction: f64 = number.parse().ok()?;
    let nanos = fraction * per as f64;
    if !nanos.is_finite() || nanos.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(TimeDelta::nanoseconds(nanos.round() as i64))
}

/// Format a timestamp as RFC 3339 in UTC with the shortest sub-second form
/// that preserves precision. The inverse of [`parse_timestamp`].
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse an RFC 3339 timestamp or a plain `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(DateTime::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0)?, Utc))
}

/// Attempt to upgrade a string to a richer scalar: duration, timestamp,
/// subnet, then IP, in that order. Returns the string unchanged when nothing
/// matches.
pub fn parse_scalar(s: &str) -> Value {
    if let Some(d) = parse_duration(s) {
        return Value::Duration(d);
    }
    if let Some(ts) = parse_timestamp(s) {
        return Value::Timestamp(ts);
    }
    if let Ok(subnet) = s.parse::<Subnet>() {
        return Value::Subnet(subnet);
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Value::Ip(ip);
    }
    Value::String(s.to_string())
}

/// Parse a string as a specific type. Used for deferred cells once the
/// column type has been resolved.
pub fn parse_as(s: &str, kind: &TypeKind) -> Result<Value, EngineError> {
    let fail = || EngineError::parse(format!("`{s}` is not a valid {kind}"));
    match kind {
        TypeKind::String => Ok(Value::String(s.to_string())),
        TypeKind::Bool => match s {
            "true" | "T" => Ok(Value::Bool(true)),
            "false" | "F" => Ok(Value::Bool(false)),
            _ => Err(fail()),
        },
        TypeKind::Int64 => s.parse().map(Value::Int).map_err(|_| fail()),
        TypeKind::UInt64 => s.parse().map(Value::UInt).map_err(|_| fail()),
        TypeKind::Double => s.parse().map(Value::Double).map_err(|_| fail()),
        TypeKind::Duration => parse_duration(s).map(Value::Duration).ok_or_else(fail),
        TypeKind::Timestamp => parse_timestamp(s).map(Value::Timestamp).ok_or_else(fail),
        TypeKind::Ip => s.parse().map(Value::Ip).map_err(|_| fail()),
        TypeKind::Subnet => s.parse().map(Value::Subnet).map_err(|_| fail()),
        TypeKind::Blob => Ok(Value::Blob(s.as_bytes().to_vec())),
        TypeKind::Enumeration(variants) => {
            if variants.iter().any(|v| v == s) {
                Ok(Value::String(s.to_string()))
            } else {
                Err(EngineError::parse(format!(
                    "`{s}` is not a variant of the enumeration"
                )))
            }
        }
        TypeKind::List(_) | TypeKind::Record(_) => Err(EngineError::type_error(format!(
            "cannot parse a string as {kind}"
        ))),
    }
}

/// Render the canonical textual form of a scalar, the inverse of
/// [`parse_scalar`] for the types it can produce.
pub fn format_scalar(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(b) => b.to_string(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::String(s) => s.clone(),
        Value::Blob(b) => format!("{} bytes", b.len()),
        Value::Duration(d) => format_duration(*d),
        Value::Timestamp(ts) => format_timestamp(*ts),
        Value::Ip(ip) => ip.to_string(),
        Value::Subnet(subnet) => subnet.to_string(),
        Value::List(items) => {
            let inner: Vec<String> = items.iter().map(format_scalar).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Record(fields) => {
            let inner: Vec<String> = fields
                .iter()
                .map(|(name, value)| format!("{name}: {}", format_scalar(value)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
