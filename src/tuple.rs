//! The tuple value type carried on streams and across the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A typed sum carried as the payload of a stream tuple.
///
/// This is deliberately not generic: the cluster never interprets tuple contents (that's the
/// operator's job), it only needs a value type it can clone, buffer, and serialize uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bytes(Vec<u8>),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Null,
}

/// Alias kept for readability at call sites that talk about "tuples" rather than "values".
pub type Tuple = Value;

macro_rules! impl_from {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        }
    };
}

impl_from!(Str, String);
impl_from!(Str, &str);
impl_from!(Int, i64);
impl_from!(Float, f64);
impl_from!(Bool, bool);
impl_from!(Bytes, Vec<u8>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_conversions_round_trip_through_encode() {
        let v: Value = "hello".into();
        assert_eq!(v, Value::Str("hello".to_string()));

        let encoded = bincode::serde::encode_to_vec(&v, bincode::config::standard()).unwrap();
        let (decoded, _): (Value, usize) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn nested_map_round_trips() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::Int(1));
        map.insert("b".to_string(), Value::List(vec![Value::Bool(true), Value::Null]));
        let v = Value::Map(map);

        let encoded = bincode::serde::encode_to_vec(&v, bincode::config::standard()).unwrap();
        let (decoded, _): (Value, usize) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(decoded, v);
    }
}
