//! Value model and binary codec.
//!
//! Values are trees of primitives, byte strings, sequences, and
//! string-keyed mappings. The wire format is MessagePack, bridged through
//! [`rmpv`], so shard files remain readable by other MessagePack
//! implementations. Keys are identified by their SHA-256 digest.

use crate::errdata;
use crate::error::Result;

use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;

/// A dynamically typed value, as stored in the database.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Converts the value to its JSON form, for the textual surfaces
    /// (change log lines, shell envelopes). Byte strings become arrays of
    /// numbers, since JSON has no byte literal; non-finite floats become
    /// null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Nil => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::Array(b.iter().map(|b| (*b).into()).collect())
            }
            Value::Seq(seq) => serde_json::Value::Array(seq.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Converts a JSON value into a Value. Integral numbers become Int,
    /// all other numbers Float.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(seq) => {
                Value::Seq(seq.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect(),
            ),
        }
    }
}

/// Strings display bare (the shell echoes them as-is), everything else
/// displays as its JSON form.
impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            value => write!(f, "{}", value.to_json()),
        }
    }
}

/// Encodes a value to MessagePack bytes.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &to_rmpv(value))?;
    Ok(buf)
}

/// Decodes a value from MessagePack bytes. Errors on truncated or
/// malformed input, and on trailing bytes after the value.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut reader = std::io::Cursor::new(bytes);
    let value = rmpv::decode::read_value(&mut reader)?;
    if (reader.position() as usize) < bytes.len() {
        return errdata!("trailing bytes after encoded value");
    }
    from_rmpv(value)
}

/// Computes the 256-bit SHA-256 digest of the given key bytes.
pub fn digest(key: &[u8]) -> [u8; 32] {
    Sha256::digest(key).into()
}

fn to_rmpv(value: &Value) -> rmpv::Value {
    match value {
        Value::Nil => rmpv::Value::Nil,
        Value::Bool(b) => rmpv::Value::Boolean(*b),
        Value::Int(i) => rmpv::Value::Integer((*i).into()),
        Value::Float(f) => rmpv::Value::F64(*f),
        Value::Str(s) => rmpv::Value::String(s.clone().into()),
        Value::Bytes(b) => rmpv::Value::Binary(b.clone()),
        Value::Seq(seq) => rmpv::Value::Array(seq.iter().map(to_rmpv).collect()),
        Value::Map(map) => rmpv::Value::Map(
            map.iter()
                .map(|(k, v)| (rmpv::Value::String(k.clone().into()), to_rmpv(v)))
                .collect(),
        ),
    }
}

fn from_rmpv(value: rmpv::Value) -> Result<Value> {
    Ok(match value {
        rmpv::Value::Nil => Value::Nil,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(i) => match i.as_i64() {
            Some(i) => Value::Int(i),
            None => return errdata!("integer {i:?} out of range"),
        },
        rmpv::Value::F32(f) => Value::Float(f as f64),
        rmpv::Value::F64(f) => Value::Float(f),
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => Value::Str(s),
            None => return errdata!("string is not valid UTF-8"),
        },
        rmpv::Value::Binary(b) => Value::Bytes(b),
        rmpv::Value::Array(seq) => {
            Value::Seq(seq.into_iter().map(from_rmpv).collect::<Result<_>>()?)
        }
        rmpv::Value::Map(pairs) => {
            let mut map = BTreeMap::new();
            for (k, v) in pairs {
                let rmpv::Value::String(k) = k else {
                    return errdata!("map key is not a string");
                };
                let Some(k) = k.into_str() else {
                    return errdata!("map key is not valid UTF-8");
                };
                map.insert(k, from_rmpv(v)?);
            }
            Value::Map(map)
        }
        rmpv::Value::Ext(tag, _) => return errdata!("unsupported extension type {tag}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use test_case::test_case;

    fn map(pairs: &[(&str, Value)]) -> Value {
        Value::Map(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    /// Encoding must produce canonical MessagePack, byte for byte.
    #[test_case(Value::Nil, &[0xc0]; "nil")]
    #[test_case(Value::Bool(true), &[0xc3]; "bool_true")]
    #[test_case(Value::Bool(false), &[0xc2]; "bool_false")]
    #[test_case(Value::Int(1), &[0x01]; "fixint")]
    #[test_case(Value::Int(-1), &[0xff]; "negative fixint")]
    #[test_case(Value::Int(128), &[0xcc, 0x80]; "uint8")]
    #[test_case(Value::Float(1.5), &[0xcb, 0x3f, 0xf8, 0, 0, 0, 0, 0, 0]; "float64")]
    #[test_case(Value::Str("foo".into()), &[0xa3, b'f', b'o', b'o']; "fixstr")]
    #[test_case(Value::Bytes(vec![1, 2]), &[0xc4, 0x02, 0x01, 0x02]; "bin8")]
    #[test_case(
        Value::Seq(vec![Value::Int(1), Value::Str("a".into())]),
        &[0x92, 0x01, 0xa1, b'a'];
        "fixarray"
    )]
    fn encode_wire(value: Value, expect: &[u8]) {
        assert_eq!(encode(&value).unwrap(), expect);
    }

    #[test]
    fn encode_map_wire() {
        let value = map(&[("a", Value::Int(1))]);
        assert_eq!(encode(&value).unwrap(), vec![0x81, 0xa1, b'a', 0x01]);
    }

    #[test_case(Value::Nil; "nil")]
    #[test_case(Value::Bool(true); "bool")]
    #[test_case(Value::Int(i64::MIN); "int min")]
    #[test_case(Value::Int(i64::MAX); "int max")]
    #[test_case(Value::Float(0.25); "float")]
    #[test_case(Value::Str("hello world".into()); "str")]
    #[test_case(Value::Bytes(b"\x00\xff".to_vec()); "bytes")]
    #[test_case(Value::Seq(vec![Value::Nil, Value::Int(7)]); "seq")]
    fn roundtrip(value: Value) {
        assert_eq!(decode(&encode(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn roundtrip_nested() {
        let value = map(&[
            ("list", Value::Seq(vec![Value::Int(1), Value::Float(2.5)])),
            ("name", Value::Str("sfdb".into())),
            ("inner", map(&[("ok", Value::Bool(true))])),
        ]);
        assert_eq!(decode(&encode(&value).unwrap()).unwrap(), value);
    }

    #[test_case(&[0xa3, b'f', b'o']; "truncated string")]
    #[test_case(&[]; "empty input")]
    #[test_case(&[0xc0, 0x00]; "trailing bytes")]
    #[test_case(&[0xd4, 0x01, 0x00]; "extension type")]
    #[test_case(&[0x81, 0x01, 0x01]; "non-string map key")]
    #[test_case(&[0xcf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]; "uint64 overflow")]
    fn decode_errors(bytes: &[u8]) {
        assert!(matches!(decode(bytes), Err(Error::InvalidData(_))));
    }

    #[test]
    fn digests() {
        assert_eq!(
            hex::encode(digest(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hex::encode(digest(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn json_bridge() {
        let value = map(&[
            ("n", Value::Nil),
            ("i", Value::Int(-3)),
            ("f", Value::Float(0.5)),
            ("s", Value::Str("x".into())),
            ("seq", Value::Seq(vec![Value::Bool(false)])),
        ]);
        let json = value.to_json();
        assert_eq!(
            json.to_string(),
            r#"{"f":0.5,"i":-3,"n":null,"s":"x","seq":[false]}"#
        );
        assert_eq!(Value::from_json(json), value);

        // Bytes degrade to a sequence of numbers through JSON.
        let json = Value::Bytes(vec![1, 2]).to_json();
        assert_eq!(Value::from_json(json), Value::Seq(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn display() {
        assert_eq!(Value::Str("plain".into()).to_string(), "plain");
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Nil.to_string(), "null");
        assert_eq!(
            Value::Seq(vec![Value::Int(1), Value::Str("a".into())]).to_string(),
            r#"[1,"a"]"#
        );
    }
}
