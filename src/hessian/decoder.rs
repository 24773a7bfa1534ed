// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Tag-dispatched Hessian-2 reader.
//!
//! A `Decoder` is always built over a bounded in-memory buffer, the exact
//! `body length` bytes of one Dubbo frame (see `crate::frame`), so a
//! malformed or truncated value can never read past a frame boundary. Any
//! attempt becomes [`ProtocolError::Truncated`] instead of blocking on the
//! live socket or bleeding into the next frame.

use std::io::Read;

use crate::hessian::{ClassDef, Instance, ListValue, Value};
use crate::primitive::{read_char, read_exact, read_f64, read_i16, read_i64, read_u16, read_u8};
use crate::ProtocolError;

pub struct Decoder<R: Read> {
    stream: R,
    /// Class-definition table: appended to by tag `C`, consulted by the
    /// compact instance tags `0x60..0x6f`. Scoped to this decode.
    class_defs: Vec<ClassDef>,
    /// Object-reference table: appended to every time a list, map, or
    /// instance finishes decoding, consulted by tag `Q`. Scoped to this
    /// decode, like `class_defs`.
    object_refs: Vec<Value>,
}

impl<R: Read> Decoder<R> {
    pub fn new(stream: R) -> Self {
        Decoder {
            stream,
            class_defs: Vec::new(),
            object_refs: Vec::new(),
        }
    }

    fn track(&mut self, value: Value) -> Value {
        self.object_refs.push(value.clone());
        value
    }

    /// Reads one Hessian-2 value, dispatching on its leading tag byte.
    pub fn decode_value(&mut self) -> Result<Value, ProtocolError> {
        let tag = read_u8(&mut self.stream)?;
        self.decode_value_with_tag(tag)
    }

    fn decode_value_with_tag(&mut self, tag: u8) -> Result<Value, ProtocolError> {
        match tag {
            0x4e => Ok(Value::Null),                 // N
            0x54 => Ok(Value::Bool(true)),            // T
            0x46 => Ok(Value::Bool(false)),           // F
            0x80..=0xbf => Ok(Value::Int(tag as i32 - 0x90)),
            0xc0..=0xcf => {
                let lo = read_u8(&mut self.stream)? as i32;
                Ok(Value::Int(((tag as i32 - 0xc8) << 8) + lo))
            }
            0xd0..=0xd7 => {
                let lo = read_u16(&mut self.stream)? as i32;
                Ok(Value::Int(((tag as i32 - 0xd4) << 16) + lo))
            }
            0x49 | 0x59 => Ok(Value::Int(crate::primitive::read_i32(&mut self.stream)?)), // 'I', 0x59
            0xd8..=0xef => Ok(Value::Long(tag as i64 - 0xe0)),
            0xf0..=0xff => {
                let lo = read_u8(&mut self.stream)? as i64;
                Ok(Value::Long((tag as i64 - 0xf8) * 256 + lo))
            }
            0x38..=0x3f => {
                let lo = read_u16(&mut self.stream)? as i64;
                Ok(Value::Long(((tag as i64 - 0x3c) << 16) + lo))
            }
            0x4c => Ok(Value::Long(read_i64(&mut self.stream)?)), // 'L'
            0x5b => Ok(Value::Double(0.0)),
            0x5c => Ok(Value::Double(1.0)),
            0x5d => {
                let b = read_u8(&mut self.stream)? as i8;
                Ok(Value::Double(b as f64))
            }
            0x5e => {
                let s = read_i16(&mut self.stream)?;
                Ok(Value::Double(s as f64))
            }
            0x5f => {
                let i = crate::primitive::read_i32(&mut self.stream)?;
                Ok(Value::Double(0.001 * i as f64))
            }
            0x44 => Ok(Value::Double(read_f64(&mut self.stream)?)), // 'D'
            0x4a => Ok(Value::Date(read_i64(&mut self.stream)?)),
            0x4b => {
                let minutes = crate::primitive::read_i32(&mut self.stream)?;
                Ok(Value::Date(minutes as i64 * 60 * 1000))
            }
            0x00..=0x1f | 0x30..=0x33 | 0x53 | 0x52 => {
                Ok(Value::String(self.decode_string(tag)?))
            }
            0x20..=0x2f | 0x34..=0x37 | 0x41 | 0x42 => {
                Ok(Value::Bytes(self.decode_binary(tag)?))
            }
            0x56 => {
                // typed list, length-prefixed
                let type_name = self.decode_type_name()?;
                let length = self.decode_int()? as usize;
                let items = self.decode_n_values(length)?;
                Ok(self.track(Value::List(ListValue {
                    type_name: Some(type_name),
                    items,
                })))
            }
            0x58 => {
                let length = self.decode_int()? as usize;
                let items = self.decode_n_values(length)?;
                Ok(self.track(Value::List(ListValue {
                    type_name: None,
                    items,
                })))
            }
            0x70..=0x77 => {
                let type_name = self.decode_type_name()?;
                let length = (tag - 0x70) as usize;
                let items = self.decode_n_values(length)?;
                Ok(self.track(Value::List(ListValue {
                    type_name: Some(type_name),
                    items,
                })))
            }
            0x78..=0x7f => {
                let length = (tag - 0x78) as usize;
                let items = self.decode_n_values(length)?;
                Ok(self.track(Value::List(ListValue {
                    type_name: None,
                    items,
                })))
            }
            0x48 => Ok(self.track(Value::Map(self.decode_map_pairs()?))), // 'H'
            0x4d => {
                // 'M': typed map, type name read-and-discarded
                let _type_name = self.decode_type_name()?;
                Ok(self.track(Value::Map(self.decode_map_pairs()?)))
            }
            0x43 => {
                // 'C': class definition, immediately followed by its instance
                let def = self.decode_class_def()?;
                self.class_defs.push(def);
                self.decode_value()
            }
            0x60..=0x6f => {
                let idx = (tag - 0x60) as usize;
                let field_names = self
                    .class_defs
                    .get(idx)
                    .ok_or(ProtocolError::ClassRefMissing(idx))?
                    .field_names
                    .clone();
                let type_name = self.class_defs[idx].type_name.clone();
                let mut fields = Vec::with_capacity(field_names.len());
                for name in field_names {
                    fields.push((name, self.decode_value()?));
                }
                Ok(self.track(Value::Instance(Instance { type_name, fields })))
            }
            0x51 => {
                // 'Q': value back-reference. Returns the materialised
                // previously-decoded object, not the raw ref record.
                let idx = self.decode_int()? as usize;
                self.object_refs
                    .get(idx)
                    .cloned()
                    .ok_or(ProtocolError::ObjectRefMissing(idx))
            }
            0x55 | 0x57 => Err(ProtocolError::Unimplemented(tag)),
            0x5a => Err(ProtocolError::Eof), // 'Z'
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    fn decode_n_values(&mut self, n: usize) -> Result<Vec<Value>, ProtocolError> {
        (0..n).map(|_| self.decode_value()).collect()
    }

    fn decode_type_name(&mut self) -> Result<String, ProtocolError> {
        match self.decode_value()? {
            Value::String(s) => Ok(s),
            _ => Ok(String::new()),
        }
    }

    fn decode_string(&mut self, first_tag: u8) -> Result<String, ProtocolError> {
        let mut bytes = Vec::new();
        let mut tag = first_tag;
        loop {
            let (len, is_final) = match tag {
                0x00..=0x1f => (tag as usize, true),
                0x30..=0x33 => {
                    let lo = read_u8(&mut self.stream)? as usize;
                    ((tag as usize - 0x30) * 256 + lo, true)
                }
                0x53 => (read_u16(&mut self.stream)? as usize, true), // 'S'
                0x52 => (read_u16(&mut self.stream)? as usize, false), // 'R'
                other => return Err(ProtocolError::UnknownTag(other)),
            };
            for _ in 0..len {
                bytes.extend(read_char(&mut self.stream)?);
            }
            if is_final {
                break;
            }
            tag = read_u8(&mut self.stream)?;
        }
        String::from_utf8(bytes).map_err(|_| ProtocolError::MalformedChar)
    }

    fn decode_binary(&mut self, first_tag: u8) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = Vec::new();
        let mut tag = first_tag;
        loop {
            let (len, is_final) = match tag {
                0x20..=0x2f => ((tag - 0x20) as usize, true),
                0x34..=0x37 => {
                    let lo = read_u8(&mut self.stream)? as usize;
                    ((tag as usize - 0x34) * 256 + lo, true)
                }
                0x41 => (read_u16(&mut self.stream)? as usize, false), // 'A'
                0x42 => (read_u16(&mut self.stream)? as usize, true),  // 'B'
                other => return Err(ProtocolError::UnknownTag(other)),
            };
            bytes.extend(read_exact(&mut self.stream, len)?);
            if is_final {
                break;
            }
            tag = read_u8(&mut self.stream)?;
        }
        Ok(bytes)
    }

    fn decode_class_def(&mut self) -> Result<ClassDef, ProtocolError> {
        let type_name = self.decode_bytes_field_as_string()?;
        let count = self.decode_int()? as usize;
        let mut field_names = Vec::with_capacity(count);
        for _ in 0..count {
            field_names.push(self.decode_bytes_field_as_string()?);
        }
        Ok(ClassDef {
            type_name,
            field_names,
        })
    }

    fn decode_map_pairs(&mut self) -> Result<Vec<(Value, Value)>, ProtocolError> {
        let mut pairs = Vec::new();
        loop {
            let tag = read_u8(&mut self.stream)?;
            if tag == 0x5a {
                break;
            }
            let key = self.decode_value_with_tag(tag)?;
            let value = self.decode_value()?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    /// Reuses the tag-dispatched decoder but coerces everything to a plain
    /// `i32`: `null`/`false` -> 0, `true` -> 1, `long`/`double` -> truncated
    /// int.
    pub fn decode_int(&mut self) -> Result<i32, ProtocolError> {
        let tag = read_u8(&mut self.stream)?;
        match tag {
            0x4e | 0x46 => Ok(0), // N, F
            0x54 => Ok(1),        // T
            0x80..=0xbf => Ok(tag as i32 - 0x90),
            0xc0..=0xcf => {
                let lo = read_u8(&mut self.stream)? as i32;
                Ok(((tag as i32 - 0xc8) << 8) + lo)
            }
            0xd0..=0xd7 => {
                let lo = read_u16(&mut self.stream)? as i32;
                Ok(((tag as i32 - 0xd4) << 16) + lo)
            }
            0x49 | 0x59 => crate::primitive::read_i32(&mut self.stream),
            0xd8..=0xef => Ok(tag as i32 - 0xe0),
            0xf0..=0xff => {
                let lo = read_u8(&mut self.stream)? as i32;
                Ok((tag as i32 - 0xf8) * 256 + lo)
            }
            0x38..=0x3f => {
                let lo = read_u16(&mut self.stream)? as i32;
                Ok(((tag as i32 - 0x3c) << 16) + lo)
            }
            0x4c => Ok(read_i64(&mut self.stream)? as i32),
            0x5b => Ok(0),
            0x5c => Ok(1),
            0x5d => Ok(read_u8(&mut self.stream)? as i8 as i32),
            0x5e => Ok(read_i16(&mut self.stream)? as i32),
            0x5f => {
                let i = crate::primitive::read_i32(&mut self.stream)?;
                Ok((0.001 * i as f64) as i32)
            }
            0x44 => Ok(read_f64(&mut self.stream)? as i32),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    /// Reads whatever Hessian-2 value follows and returns its byte
    /// representation, used for the request header fields (dubbo version,
    /// service name, ...) and class-definition type/field names, which are
    /// always plain strings on a well-formed wire but are read
    /// generically here for robustness against a peer that sends
    /// something else.
    pub fn decode_bytes_field(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let tag = read_u8(&mut self.stream)?;
        match tag {
            0x4e => Ok(Vec::new()), // N -> absent, represented as empty
            0x54 => Ok(b"true".to_vec()),
            0x46 => Ok(b"false".to_vec()),
            0x00..=0x1f | 0x30..=0x33 | 0x53 | 0x52 => {
                Ok(self.decode_string(tag)?.into_bytes())
            }
            0x20..=0x2f | 0x34..=0x37 | 0x41 | 0x42 => self.decode_binary(tag),
            _ => {
                // Numeric/other tags: fall back to the general decoder and
                // render a textual byte form, so any value can stand in
                // for a bytes field rather than only the string/binary
                // tags.
                let value = self.decode_value_with_tag(tag)?;
                Ok(format!("{value:?}").into_bytes())
            }
        }
    }

    fn decode_bytes_field_as_string(&mut self) -> Result<String, ProtocolError> {
        String::from_utf8(self.decode_bytes_field()?).map_err(|_| ProtocolError::MalformedChar)
    }

    /// Returns true if the underlying buffer has been fully consumed.
    pub fn into_inner(self) -> R {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode(bytes: &[u8]) -> Value {
        Decoder::new(Cursor::new(bytes.to_vec()))
            .decode_value()
            .unwrap()
    }

    #[test]
    fn short_list() {
        assert_eq!(
            decode(&[0x79, 0x92]),
            Value::List(ListValue {
                type_name: None,
                items: vec![Value::Int(2)]
            })
        );
    }

    #[test]
    fn long_untyped_list() {
        let mut bytes = vec![0x58, 0x98];
        bytes.extend(std::iter::repeat(0x92u8).take(8));
        assert_eq!(
            decode(&bytes),
            Value::List(ListValue {
                type_name: None,
                items: vec![Value::Int(2); 8]
            })
        );
    }

    #[test]
    fn typed_list() {
        let mut bytes = vec![0x71, 0x0e];
        bytes.extend(b"java.util.List");
        bytes.push(0xe2);
        assert_eq!(
            decode(&bytes),
            Value::List(ListValue {
                type_name: Some("java.util.List".to_string()),
                items: vec![Value::Long(2)]
            })
        );
    }

    #[test]
    fn doubles() {
        assert_eq!(decode(&[0x5b]), Value::Double(0.0));
        assert_eq!(decode(&[0x5c]), Value::Double(1.0));
        assert_eq!(decode(&[0x5d, 0x7f]), Value::Double(127.0));
        assert_eq!(decode(&[0x5d, 0x81]), Value::Double(-127.0));
        assert_eq!(decode(&[0x5e, 0x00, 0x80]), Value::Double(128.0));
        assert_eq!(decode(&[0x5f, 0x00, 0x00, 0x04, 0x63]), Value::Double(1.123));
        assert_eq!(
            decode(&[0x5f, 0xff, 0xff, 0xfb, 0x9d]),
            Value::Double(-1.123)
        );
        assert_eq!(
            decode(&[0x44, 0x3f, 0xbf, 0x9a, 0x6b, 0x50, 0xb0, 0xf2, 0x7c]),
            Value::Double(0.12345)
        );
    }

    #[test]
    fn long_int() {
        assert_eq!(
            decode(&[0x59, 0x49, 0x96, 0x02, 0xd2]),
            Value::Long(1234567890)
        );
    }

    #[test]
    fn class_def_and_ref() {
        let bytes = b"C\x06parent\x91\x01a\x60C\x05child\x91\x01ba\xe2";
        let expected = Value::Instance(Instance {
            type_name: "parent".to_string(),
            fields: vec![(
                "a".to_string(),
                Value::Instance(Instance {
                    type_name: "child".to_string(),
                    fields: vec![("b".to_string(), Value::Long(2))],
                }),
            )],
        });
        assert_eq!(decode(bytes), expected);
    }

    #[test]
    fn object_ref_returns_materialised_value() {
        // [1, 2] then a back-reference (Q 0) to that same list.
        let mut bytes = vec![0x7a, 0x91, 0x92]; // compact untyped list [1, 2]
        let first = Decoder::new(Cursor::new(bytes.clone()))
            .decode_value()
            .unwrap();
        bytes.push(0x51); // Q
        bytes.push(0x90); // int 0
        let mut d = Decoder::new(Cursor::new(bytes));
        let list_again = d.decode_value().unwrap();
        assert_eq!(list_again, first);
        let referenced = d.decode_value().unwrap();
        assert_eq!(referenced, first);
    }

    #[test]
    fn map_decode_empty() {
        assert_eq!(decode(b"H\x5a"), Value::Map(vec![]));
    }

    #[test]
    fn unimplemented_list_tags() {
        let mut d = Decoder::new(Cursor::new(vec![0x55u8]));
        assert_eq!(d.decode_value(), Err(ProtocolError::Unimplemented(0x55)));
        let mut d = Decoder::new(Cursor::new(vec![0x57u8]));
        assert_eq!(d.decode_value(), Err(ProtocolError::Unimplemented(0x57)));
    }

    #[test]
    fn truncated_read() {
        let mut d = Decoder::new(Cursor::new(vec![0x49u8, 0x00])); // 'I' wants 4 bytes, only 1 given
        assert_eq!(d.decode_value(), Err(ProtocolError::Truncated));
    }
}
