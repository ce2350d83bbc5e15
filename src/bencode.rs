//! Bencode value helpers
//!
//! Accessors over `serde_bencode::value::Value` shared by the metadata
//! parser and the DHT message codec.

use std::collections::HashMap;

use serde_bencode::value::Value;

/// Typed accessors over a decoded bencode tree
pub trait ValueExt {
    fn as_int(&self) -> Option<i64>;
    fn as_bytes(&self) -> Option<&[u8]>;
    fn as_list(&self) -> Option<&[Value]>;
    fn as_dict(&self) -> Option<&HashMap<Vec<u8>, Value>>;

    /// Look up `key` when this value is a dictionary
    fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.get(key).and_then(ValueExt::as_bytes)
    }

    fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key).and_then(ValueExt::as_int)
    }

    fn get_str(&self, key: &[u8]) -> Option<String> {
        self.get_bytes(key).map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

impl ValueExt for Value {
    fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    fn as_dict(&self) -> Option<&HashMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Build a dictionary from `(key, value)` pairs
pub fn dict<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (&'static [u8], Value)>,
{
    Value::Dict(entries.into_iter().map(|(k, v)| (k.to_vec(), v)).collect())
}

/// Byte-string value
pub fn bytes(data: impl Into<Vec<u8>>) -> Value {
    Value::Bytes(data.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let value = dict([(&b"a"[..], Value::Int(3)), (&b"b"[..], bytes("xy"))]);
        assert_eq!(value.get_int(b"a"), Some(3));
        assert_eq!(value.get_bytes(b"b"), Some(&b"xy"[..]));
        assert_eq!(value.get_str(b"b").as_deref(), Some("xy"));
        assert!(value.get(b"c").is_none());
        assert!(Value::Int(1).get(b"a").is_none());
    }

    #[test]
    fn test_dict_encodes_sorted() {
        let value = dict([(&b"z"[..], Value::Int(1)), (&b"a"[..], Value::Int(2))]);
        let encoded = serde_bencode::to_bytes(&value).unwrap();
        assert_eq!(encoded, b"d1:ai2e1:zi1ee");
    }
}
