// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The Dubbo v2 frame codec: the 16-byte header, the hessian-serialised
//! body, and the telnet side channel a provider's port also answers on.

use std::io::{Cursor, Read};

use crate::descriptor::descriptor_to_type_names;
use crate::generic;
use crate::hessian::{ClassTable, Decoder, Encoder, Value};
use crate::{status, Error, ProtocolError, HESSIAN2_SERIALIZATION_ID};

const DUBBO_MAGIC: [u8; 2] = [0xda, 0xbb];
const TELNET_PROMPT_SUFFIX: &[u8] = b"\r\ndubbo>";

const FLAG_REQUEST: u8 = 0x80;
const FLAG_RESPONSE: u8 = 0x00;
const FLAG_TWOWAY: u8 = 0x40;
const FLAG_EVENT: u8 = 0x20;
const SERIALIZATION_MASK: u8 = 0x1f;

/// A decoded frame, or a line captured from the plain-text telnet side
/// channel when the stream didn't start with the Dubbo magic.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    HeartbeatRequest(HeartbeatRequest),
    HeartbeatResponse(HeartbeatResponse),
    TelnetLine(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub twoway: bool,
    pub dubbo_version: String,
    pub service_name: String,
    pub service_version: String,
    pub method_name: String,
    pub args: Vec<Value>,
    pub attachment: Vec<(Value, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub status: u8,
    pub data: Option<Value>,
    pub error: Option<Value>,
}

impl Response {
    pub fn ok(&self) -> bool {
        self.status == status::OK
    }

    /// Renders the error payload as text, for callers that only care that
    /// it's a message (it always is one, when this crate builds the
    /// response itself).
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            other => format!("{other:?}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatRequest {
    pub id: u64,
    pub data: Option<Value>,
    pub twoway: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatResponse {
    pub id: u64,
    pub data: Option<Value>,
}

fn encode_header(flag: u8, status: u8, id: u64) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0..2].copy_from_slice(&DUBBO_MAGIC);
    header[2] = flag;
    header[3] = status;
    header[4..12].copy_from_slice(&id.to_be_bytes());
    header
}

fn encode_frame(flag: u8, status: u8, id: u64, body: Vec<u8>) -> Vec<u8> {
    let mut out = encode_header(flag, status, id).to_vec();
    out.extend((body.len() as u32).to_be_bytes());
    out.extend(body);
    out
}

fn encode_value(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    Encoder::encode(value, 0, &mut ClassTable::new())
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut flag = FLAG_REQUEST | HESSIAN2_SERIALIZATION_ID;
        if self.twoway {
            flag |= FLAG_TWOWAY;
        }
        let mut body = Vec::new();
        body.extend(encode_value(&Value::String(self.dubbo_version.clone()))?);
        body.extend(encode_value(&Value::String(self.service_name.clone()))?);
        body.extend(encode_value(&Value::String(self.service_version.clone()))?);
        body.extend(encode_value(&Value::String(self.method_name.clone()))?);

        let type_names: Vec<String> = self.args.iter().map(type_name_of).collect();
        let desc = crate::descriptor::type_names_to_descriptor(&type_names);
        body.extend(encode_value(&Value::String(desc))?);

        // Argument values share one class table across the whole list,
        // each keyed by its own positional index.
        let mut table = ClassTable::new();
        for (idx, arg) in self.args.iter().enumerate() {
            body.extend(Encoder::encode(arg, idx, &mut table)?);
        }
        body.extend(encode_value(&Value::Map(self.attachment.clone()))?);

        Ok(encode_frame(flag, 0, self.id, body))
    }
}

fn type_name_of(value: &Value) -> String {
    match value {
        Value::Null => "void".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Int(_) => "int".to_string(),
        Value::Long(_) => "long".to_string(),
        Value::Double(_) => "double".to_string(),
        Value::Date(_) => "java.util.Date".to_string(),
        Value::String(_) => "java.lang.String".to_string(),
        Value::Bytes(_) => "byte".to_string(),
        Value::List(_) => "java.util.List".to_string(),
        Value::Map(_) => "java.util.Map".to_string(),
        Value::Instance(inst) => inst.type_name.clone(),
    }
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let flag = FLAG_RESPONSE | HESSIAN2_SERIALIZATION_ID;
        let body = if let Some(error) = &self.error {
            encode_value(error)?
        } else {
            // The inner status byte always precedes the encoded data, even
            // when the data is null. The decoder for the null case never
            // reads it back, which is why leftover trailing bytes on a
            // response body are tolerated rather than rejected.
            let inner_status = if self.data.is_none() { 2 } else { 1 };
            let mut body = encode_value(&Value::Int(inner_status))?;
            body.extend(encode_value(self.data.as_ref().unwrap_or(&Value::Null))?);
            body
        };
        Ok(encode_frame(flag, self.status, self.id, body))
    }
}

impl HeartbeatRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut flag = FLAG_REQUEST | FLAG_EVENT | HESSIAN2_SERIALIZATION_ID;
        if self.twoway {
            flag |= FLAG_TWOWAY;
        }
        let body = encode_value(self.data.as_ref().unwrap_or(&Value::Null))?;
        Ok(encode_frame(flag, 0, self.id, body))
    }
}

impl HeartbeatResponse {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let flag = FLAG_RESPONSE | FLAG_EVENT | HESSIAN2_SERIALIZATION_ID;
        let body = encode_value(self.data.as_ref().unwrap_or(&Value::Null))?;
        Ok(encode_frame(flag, 0, self.id, body))
    }
}

/// Reads and decodes exactly one frame (or telnet line) from `stream`.
pub fn decode_message(stream: &mut impl Read) -> Result<Message, Error> {
    let mut lead = [0u8; 2];
    read_fill(stream, &mut lead)?;
    if lead != DUBBO_MAGIC {
        let mut buf = lead.to_vec();
        read_until_prompt(stream, &mut buf)?;
        return Ok(Message::TelnetLine(buf));
    }

    let mut rest = [0u8; 14];
    read_fill(stream, &mut rest)?;
    let flag = rest[0];
    let status_byte = rest[1];
    let id = u64::from_be_bytes(rest[2..10].try_into().unwrap());
    let body_length = u32::from_be_bytes(rest[10..14].try_into().unwrap()) as usize;

    let proto = flag & SERIALIZATION_MASK;
    if proto != HESSIAN2_SERIALIZATION_ID {
        // Still have to drain the body so the stream stays frame-aligned.
        let mut sink = vec![0u8; body_length];
        read_fill(stream, &mut sink)?;
        return Err(Error::Protocol(ProtocolError::UnsupportedSerialization(
            proto,
        )));
    }

    let mut body = vec![0u8; body_length];
    read_fill(stream, &mut body)?;
    let twoway = flag & FLAG_TWOWAY != 0;
    let mut decoder = Decoder::new(Cursor::new(body));

    let message = if flag & FLAG_REQUEST != 0 {
        if flag & FLAG_EVENT != 0 {
            let data = decoder.decode_value()?;
            Message::HeartbeatRequest(HeartbeatRequest {
                id,
                data: none_if_null(data),
                twoway,
            })
        } else {
            Message::Request(decode_request_body(id, twoway, &mut decoder)?)
        }
    } else if flag & FLAG_EVENT != 0 {
        let data = decoder.decode_value()?;
        Message::HeartbeatResponse(HeartbeatResponse {
            id,
            data: none_if_null(data),
        })
    } else {
        Message::Response(decode_response_body(id, status_byte, &mut decoder)?)
    };

    let cursor = decoder.into_inner();
    let consumed = cursor.position() as usize;
    let total = cursor.into_inner().len();
    if consumed < total {
        log::warn!("{} undecoded bytes left in frame body", total - consumed);
    }

    Ok(message)
}

fn none_if_null(v: Value) -> Option<Value> {
    match v {
        Value::Null => None,
        other => Some(other),
    }
}

fn decode_request_body(
    id: u64,
    twoway: bool,
    decoder: &mut Decoder<Cursor<Vec<u8>>>,
) -> Result<Request, ProtocolError> {
    let dubbo_version = decoder.decode_bytes_field_as_string()?;
    let service_name = decoder.decode_bytes_field_as_string()?;
    let service_version = decoder.decode_bytes_field_as_string()?;
    let mut method_name = decoder.decode_bytes_field_as_string()?;
    let desc = decoder.decode_bytes_field_as_string()?;
    let arg_types = descriptor_to_type_names(&desc);

    let mut args = Vec::with_capacity(arg_types.len());
    for _ in &arg_types {
        args.push(decoder.decode_value()?);
    }

    let attachment = match decoder.decode_value()? {
        Value::Map(pairs) => pairs,
        _ => Vec::new(),
    };

    let is_generic = matches!(
        attachment.iter().find(|(k, _)| k.as_str() == Some("generic")).map(|(_, v)| v),
        Some(Value::String(s)) if s == "true"
    ) || matches!(
        attachment.iter().find(|(k, _)| k.as_str() == Some("generic")).map(|(_, v)| v),
        Some(Value::Bool(true))
    );

    if is_generic && args.len() >= 3 {
        let new_method_name = value_as_text(&args[0]);
        let raw_type_names = list_items(&args[1]);
        let raw_values = list_items(&args[2]);
        let mut converted = Vec::with_capacity(raw_type_names.len());
        for (type_name, value) in raw_type_names.iter().zip(raw_values.iter()) {
            let name = value_as_text(type_name);
            converted.push(generic::convert(&name, value)?);
        }
        method_name = new_method_name;
        return Ok(Request {
            id,
            twoway,
            dubbo_version,
            service_name,
            service_version,
            method_name,
            args: converted,
            attachment,
        });
    }

    Ok(Request {
        id,
        twoway,
        dubbo_version,
        service_name,
        service_version,
        method_name,
        args,
        attachment,
    })
}

fn list_items(v: &Value) -> Vec<Value> {
    match v {
        Value::List(list) => list.items.clone(),
        _ => Vec::new(),
    }
}

fn value_as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        other => format!("{other:?}"),
    }
}

fn decode_response_body(
    id: u64,
    status_byte: u8,
    decoder: &mut Decoder<Cursor<Vec<u8>>>,
) -> Result<Response, ProtocolError> {
    if status_byte == status::OK {
        let inner_status = decoder.decode_int()?;
        let data = if inner_status == 1 || inner_status == 0 {
            Some(decoder.decode_value()?)
        } else {
            None
        };
        Ok(Response {
            id,
            status: status_byte,
            data,
            error: None,
        })
    } else {
        let error = decoder.decode_value()?;
        Ok(Response {
            id,
            status: status_byte,
            data: None,
            error: Some(error),
        })
    }
}

fn read_fill(stream: &mut impl Read, buf: &mut [u8]) -> Result<(), Error> {
    stream
        .read_exact(buf)
        .map_err(|_| Error::ConnectionClosed)
}

fn read_until_prompt(stream: &mut impl Read, buf: &mut Vec<u8>) -> Result<(), Error> {
    let mut byte = [0u8; 1];
    while !buf.ends_with(TELNET_PROMPT_SUFFIX) {
        stream
            .read_exact(&mut byte)
            .map_err(|_| Error::ConnectionClosed)?;
        buf.push(byte[0]);
    }
    Ok(())
}

/// Splits a decoded telnet reply into its output lines, dropping the final
/// empty segment left by the trailing prompt.
pub fn telnet_lines(raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines: Vec<String> = text.split("\r\n").map(str::to_string).collect();
    lines.pop();
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_response_golden_bytes() {
        let hb = HeartbeatResponse { id: 570, data: None };
        assert_eq!(
            hb.encode().unwrap(),
            vec![
                0xda, 0xbb, 0x22, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x3a, 0x00,
                0x00, 0x00, 0x01, 0x4e
            ]
        );
    }

    #[test]
    fn heartbeat_request_golden_bytes_twoway() {
        let hb = HeartbeatRequest {
            id: 570,
            data: None,
            twoway: true,
        };
        assert_eq!(
            hb.encode().unwrap(),
            vec![
                0xda, 0xbb, 0xe2, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x3a, 0x00,
                0x00, 0x00, 0x01, 0x4e
            ]
        );
    }

    #[test]
    fn heartbeat_request_roundtrip() {
        let hb = HeartbeatRequest {
            id: 570,
            data: None,
            twoway: true,
        };
        let bytes = hb.encode().unwrap();
        let mut cursor = Cursor::new(bytes);
        match decode_message(&mut cursor).unwrap() {
            Message::HeartbeatRequest(decoded) => assert_eq!(decoded, hb),
            other => panic!("expected heartbeat request, got {other:?}"),
        }
    }

    #[test]
    fn response_decode_empty_map() {
        let bytes: Vec<u8> = vec![
            0xda, 0xbb, 0x02, 0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00,
            0x00, 0x03, 0x91, 0x48, 0x5a,
        ];
        let mut cursor = Cursor::new(bytes);
        match decode_message(&mut cursor).unwrap() {
            Message::Response(resp) => {
                assert_eq!(resp.id, 7);
                assert_eq!(resp.status, status::OK);
                assert_eq!(resp.data, Some(Value::Map(vec![])));
                assert!(resp.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn response_encode_matches_decode_golden_bytes() {
        let resp = Response {
            id: 7,
            status: status::OK,
            data: Some(Value::Map(vec![])),
            error: None,
        };
        assert_eq!(
            resp.encode().unwrap(),
            vec![
                0xda, 0xbb, 0x02, 0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00,
                0x00, 0x00, 0x03, 0x91, 0x48, 0x5a,
            ]
        );
    }

    #[test]
    fn bad_response_decode_reads_string_error() {
        let mut bytes: Vec<u8> = vec![
            0xda, 0xbb, 0x02, 0x28, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04,
        ];
        let message = "Fail to decode request due to: RpcInvocation [methodName=listMenu]";
        let mut body = vec![0x30, message.len() as u8];
        body.extend(message.as_bytes());
        bytes.extend((body.len() as u32).to_be_bytes());
        bytes.extend(body);
        let mut cursor = Cursor::new(bytes);
        match decode_message(&mut cursor).unwrap() {
            Message::Response(resp) => {
                assert_eq!(resp.status, 40);
                assert!(resp.data.is_none());
                assert_eq!(resp.error_message().unwrap(), message);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn telnet_line_split_drops_trailing_prompt_segment() {
        let raw = b"calc\r\nfoo\r\n".to_vec();
        assert_eq!(telnet_lines(&raw), vec!["calc".to_string(), "foo".to_string()]);
    }

    #[test]
    fn request_roundtrip_with_args_and_attachment() {
        let req = Request {
            id: 42,
            twoway: true,
            dubbo_version: "2.5.3".to_string(),
            service_name: "calc".to_string(),
            service_version: "1.0".to_string(),
            method_name: "exp".to_string(),
            args: vec![Value::Int(4)],
            attachment: vec![],
        };
        let bytes = req.encode().unwrap();
        let mut cursor = Cursor::new(bytes);
        match decode_message(&mut cursor).unwrap() {
            Message::Request(decoded) => assert_eq!(decoded, req),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn non_hessian_serialization_id_is_rejected() {
        let bytes: Vec<u8> = vec![
            0xda, 0xbb, 0x81, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
            0x00, 0x01, 0x4e,
        ];
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            decode_message(&mut cursor),
            Err(Error::Protocol(ProtocolError::UnsupportedSerialization(1)))
        ));
    }
}
