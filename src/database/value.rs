//! Typed column values.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Column type declared in a table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Integer,
    Count,
    Double,
    Text,
    Address,
    Time,
    Interval,
}

impl ValueType {
    /// Whether a query literal can be compared against a column of this type.
    pub fn accepts_literal(&self, literal: &Value) -> bool {
        match (self, literal) {
            (_, Value::Null) => true,
            (ValueType::Bool, Value::Bool(_)) => true,
            (
                ValueType::Integer | ValueType::Count | ValueType::Double,
                Value::Integer(_) | Value::Count(_) | Value::Double(_),
            ) => true,
            (ValueType::Text, Value::Text(_)) => true,
            (ValueType::Address, Value::Address(_)) => true,
            (ValueType::Address, Value::Text(s)) => s.parse::<IpAddr>().is_ok(),
            (
                ValueType::Time | ValueType::Interval,
                Value::Integer(_) | Value::Count(_) | Value::Double(_),
            ) => true,
            (ValueType::Time, Value::Time(_)) => true,
            (ValueType::Interval, Value::Interval(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::Integer => "int",
            ValueType::Count => "count",
            ValueType::Double => "double",
            ValueType::Text => "text",
            ValueType::Address => "addr",
            ValueType::Time => "time",
            ValueType::Interval => "interval",
        };
        f.write_str(name)
    }
}

/// A single cell of a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Count(u64),
    Double(f64),
    Text(String),
    Address(IpAddr),
    Time(SystemTime),
    Interval(Duration),
}

/// An ordered sequence of values matching a table schema.
pub type Row = Vec<Value>;

impl Value {
    /// Type of a non-null value.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Integer(_) => Some(ValueType::Integer),
            Value::Count(_) => Some(ValueType::Count),
            Value::Double(_) => Some(ValueType::Double),
            Value::Text(_) => Some(ValueType::Text),
            Value::Address(_) => Some(ValueType::Address),
            Value::Time(_) => Some(ValueType::Time),
            Value::Interval(_) => Some(ValueType::Interval),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Build a text value from an optional string, mapping `None` to null.
    pub fn optional_text<S: Into<String>>(s: Option<S>) -> Value {
        s.map(|s| Value::Text(s.into())).unwrap_or(Value::Null)
    }

    /// Compare two values. `None` when they are not comparable, which
    /// includes any comparison involving null.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;

        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Count(a), Count(b)) => Some(a.cmp(b)),
            (Integer(a), Count(b)) => Some((*a as i128).cmp(&(*b as i128))),
            (Count(a), Integer(b)) => Some((*a as i128).cmp(&(*b as i128))),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Address(a), Address(b)) => Some(a.cmp(b)),
            (Address(a), Text(b)) => b.parse::<IpAddr>().ok().map(|b| a.cmp(&b)),
            (Text(a), Address(b)) => a.parse::<IpAddr>().ok().map(|a| a.cmp(b)),
            (Time(a), Time(b)) => Some(a.cmp(b)),
            (Interval(a), Interval(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Numeric view used for cross-type comparisons. Times are seconds
    /// since the epoch, intervals are seconds.
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Count(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Time(t) => Some(epoch_secs(*t)),
            Value::Interval(d) => Some(d.as_secs_f64()),
            _ => None,
        }
    }
}

fn epoch_secs(t: SystemTime) -> f64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Count(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
            Value::Address(v) => write!(f, "{}", v),
            Value::Time(t) => write!(f, "{:.3}", epoch_secs(*t)),
            Value::Interval(d) => write!(f, "{:.3}s", d.as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_cross_type_comparison() {
        assert_eq!(Value::Integer(-1).compare(&Value::Count(0)), Some(Ordering::Less));
        assert_eq!(Value::Count(5).compare(&Value::Double(5.0)), Some(Ordering::Equal));
        assert_eq!(Value::Double(2.5).compare(&Value::Integer(2)), Some(Ordering::Greater));
    }

    #[test]
    fn null_is_never_comparable() {
        assert_eq!(Value::Null.compare(&Value::Null), None);
        assert_eq!(Value::Integer(1).compare(&Value::Null), None);
    }

    #[test]
    fn time_compares_with_epoch_seconds() {
        let t = UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(Value::Time(t).compare(&Value::Integer(50)), Some(Ordering::Greater));
        assert_eq!(Value::Time(t).compare(&Value::Integer(100)), Some(Ordering::Equal));
    }

    #[test]
    fn address_compares_with_text() {
        let addr = Value::Address("127.0.0.1".parse().unwrap());
        assert_eq!(addr.compare(&Value::Text("127.0.0.1".into())), Some(Ordering::Equal));
        assert_eq!(addr.compare(&Value::Text("not an address".into())), None);
    }

    #[test]
    fn literal_acceptance() {
        assert!(ValueType::Integer.accepts_literal(&Value::Double(1.0)));
        assert!(ValueType::Address.accepts_literal(&Value::Text("::1".into())));
        assert!(!ValueType::Integer.accepts_literal(&Value::Text("1".into())));
        assert!(!ValueType::Text.accepts_literal(&Value::Integer(1)));
    }

    #[test]
    fn serializes_with_type_tags() {
        let json = serde_json::to_string(&vec![Value::Integer(3), Value::Null]).unwrap();
        assert_eq!(json, r#"[{"integer":3},"null"]"#);
    }
}
