use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use aqsql_core::{Error, Result};

/// A single bound parameter or decoded column value.
///
/// Everything crosses the wire in PostgreSQL's text format: every `Value`
/// other than `Null` is sent and received as its textual representation.
/// That costs a little on numeric round-trips but sidesteps a per-type
/// binary codec for each of Postgres's OIDs, which the driver has no need
/// to get exactly right to honor the pool/pipeline/cache behavior this
/// crate is actually about.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i64),
    Float8(f64),
    Text(String),
    Bytes(Vec<u8>),
}

// `f64` has no total order, but parameter lists are only ever compared
// and hashed as a cache key (`spec.md`'s coalescing key), never sorted,
// so bit-pattern equality for `Float8` is exactly the behavior we want:
// two dispatches with literally the same bits coalesce, NaN does not
// spuriously collide with anything else's NaN-as-sentinel usage.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int8(i) => i.hash(state),
            Value::Float8(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
        }
    }
}

impl Value {
    pub(crate) fn encode_text(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { b"t".to_vec() } else { b"f".to_vec() }),
            Value::Int8(i) => Some(i.to_string().into_bytes()),
            Value::Float8(f) => Some(f.to_string().into_bytes()),
            Value::Text(s) => Some(s.clone().into_bytes()),
            Value::Bytes(b) => Some(b.clone()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int8(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int8(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float8(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One row of a query result: column names (shared with every other row
/// from the same `RowDescription`) paired with this row's decoded values.
#[derive(Debug, Clone)]
pub struct Row {
    pub(crate) columns: Arc<Vec<String>>,
    pub(crate) values: Vec<Value>,
}

impl Row {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == name)?;
        self.values.get(index)
    }

    /// Decodes a column by index. `Value::Null` decodes to `None`;
    /// anything else is parsed from its text representation.
    pub fn try_get<T: FromValue>(&self, index: usize) -> Result<Option<T>> {
        match self.values.get(index) {
            None => Err(Error::protocol(format!("column index {index} out of range"))),
            Some(Value::Null) => Ok(None),
            Some(value) => T::from_value(value).map(Some),
        }
    }
}

/// Parses a [`Value`] into a concrete Rust type. Implemented for the
/// handful of scalar types the driver's text-format wire encoding can
/// round-trip losslessly.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

macro_rules! from_value_via_parse {
    ($ty:ty) => {
        impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self> {
                let text = value_as_text(value)?;
                text.parse::<$ty>()
                    .map_err(|e| Error::protocol(format!("invalid {}: {e}", stringify!($ty))))
            }
        }
    };
}

from_value_via_parse!(i64);
from_value_via_parse!(i32);
from_value_via_parse!(f64);

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Text(s) => match s.as_str() {
                "t" | "true" => Ok(true),
                "f" | "false" => Ok(false),
                other => Err(Error::protocol(format!("invalid bool: {other:?}"))),
            },
            other => Err(Error::protocol(format!("cannot decode {other:?} as bool"))),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value_as_text(value)?.to_owned())
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.clone().into_bytes()),
            other => Err(Error::protocol(format!("cannot decode {other:?} as bytes"))),
        }
    }
}

fn value_as_text(value: &Value) -> Result<&str> {
    match value {
        Value::Text(s) => Ok(s.as_str()),
        other => Err(Error::protocol(format!("cannot decode {other:?} as text"))),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int8(i) => write!(f, "{i}"),
            Value::Float8(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn row(values: Vec<Value>) -> Row {
        let columns = Arc::new((0..values.len()).map(|i| format!("c{i}")).collect());
        Row { columns, values }
    }

    #[test]
    fn try_get_parses_text_into_typed_values() {
        let row = row(vec![Value::Text("42".into()), Value::Text("3.5".into()), Value::Null]);
        assert_eq!(row.try_get::<i64>(0).unwrap(), Some(42));
        assert_eq!(row.try_get::<f64>(1).unwrap(), Some(3.5));
        assert_eq!(row.try_get::<String>(2).unwrap(), None);
    }

    #[test]
    fn get_by_name_finds_matching_column() {
        let columns = Arc::new(vec!["id".to_owned(), "name".to_owned()]);
        let row = Row { columns, values: vec![Value::Int8(1), Value::Text("a".into())] };
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("a".into())));
        assert_eq!(row.get_by_name("missing"), None);
    }

    #[test]
    fn values_are_usable_as_hash_map_keys() {
        let mut map = HashMap::new();
        map.insert((Arc::<str>::from("SELECT 1"), vec![Value::Int8(1), Value::Float8(2.5)]), "hit");
        assert_eq!(map.get(&(Arc::<str>::from("SELECT 1"), vec![Value::Int8(1), Value::Float8(2.5)])), Some(&"hit"));
        assert_eq!(map.get(&(Arc::<str>::from("SELECT 1"), vec![Value::Int8(1), Value::Float8(2.6)])), None);
    }

    #[test]
    fn bool_accepts_text_and_native_forms() {
        assert_eq!(bool::from_value(&Value::Bool(true)).unwrap(), true);
        assert_eq!(bool::from_value(&Value::Text("f".into())).unwrap(), false);
        assert!(bool::from_value(&Value::Text("nope".into())).is_err());
    }
}
