// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The typed-data converter used for generic calls: coerces a raw decoded
//! value into the `Value` variant its Java type name implies.
//!
//! Generic-call payload mapping to domain objects beyond this primitive
//! set is out of scope; unrecognised type names fail rather than guess.

use crate::hessian::Value;
use crate::ProtocolError;

/// Converts `data`, as decoded off the wire, into the `Value` shape that
/// `type_name` calls for. Numeric/string/bool values are coerced by
/// reading through whichever concrete variant `data` already holds; no
/// attempt is made to parse strings as numbers or vice versa.
pub fn convert(type_name: &str, data: &Value) -> Result<Value, ProtocolError> {
    match type_name {
        "boolean" | "java.lang.Boolean" => Ok(Value::Bool(as_bool(data))),
        "short" | "int" | "java.lang.Short" | "java.lang.Integer" => {
            Ok(Value::Int(as_i64(data) as i32))
        }
        "float" | "double" | "java.lang.Float" | "java.lang.Double" => {
            Ok(Value::Double(as_f64(data)))
        }
        "java.lang.Long" => Ok(Value::Long(as_i64(data))),
        "java.lang.String" => Ok(Value::String(as_string(data))),
        other => Err(ProtocolError::UnsupportedGenericType(other.to_string())),
    }
}

fn as_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Int(n) => *n != 0,
        Value::Long(n) => *n != 0,
        _ => false,
    }
}

fn as_i64(v: &Value) -> i64 {
    match v {
        Value::Int(n) => *n as i64,
        Value::Long(n) => *n,
        Value::Double(d) => *d as i64,
        _ => 0,
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Double(d) => *d,
        Value::Int(n) => *n as f64,
        Value::Long(n) => *n as f64,
        _ => 0.0,
    }
}

fn as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_mappings() {
        assert_eq!(convert("boolean", &Value::Bool(true)).unwrap(), Value::Bool(true));
        assert_eq!(convert("int", &Value::Int(7)).unwrap(), Value::Int(7));
        assert_eq!(convert("short", &Value::Int(7)).unwrap(), Value::Int(7));
        assert_eq!(
            convert("java.lang.Long", &Value::Long(42)).unwrap(),
            Value::Long(42)
        );
        assert_eq!(
            convert("double", &Value::Double(1.5)).unwrap(),
            Value::Double(1.5)
        );
        assert_eq!(
            convert("java.lang.String", &Value::String("hi".into())).unwrap(),
            Value::String("hi".into())
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = convert("com.example.Widget", &Value::Null).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnsupportedGenericType("com.example.Widget".to_string())
        );
    }
}
