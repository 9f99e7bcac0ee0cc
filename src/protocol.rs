// Copyright 2020 Joyent, Inc.

//! Fast message framing for remote calls and their replies.
//!
//! A call is a single `Data` message whose name is the method and whose data
//! is the array of positional arguments. The reply is a single `Data` message
//! carrying a one-element array with the return value, or a single `Error`
//! message carrying a [`Fault`]. The server transport terminates every reply
//! stream with an `End` message.

use std::fmt;
use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicU32, Ordering};
use std::{io, str};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use chrono::Utc;
use crc16::*;
use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::codec::Decoder;

use crate::error;

/*
 * Message IDs: each Fast message has a message id, which is scoped to the Fast
 * connection.  We allocate these sequentially from a circular 31-bit space.
 */
const FP_MSGID_MAX: u32 = i32::max_value() as u32;

const FP_OFF_VERSION: usize = 0x0;
const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_STATUS: usize = 0x2;
const FP_OFF_MSGID: usize = 0x3;
const FP_OFF_CRC: usize = 0x7;
const FP_OFF_DATALEN: usize = 0xb;
const FP_OFF_DATA: usize = 0xf;

pub const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

/// Fault code for any error raised by a handler that is not a protocol error.
pub const FAULT_SERVICE: &str = "ServiceException";
/// Fault code for a method the target does not implement.
pub const FAULT_NO_METHOD: &str = "NoMethod";

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FastMessageType {
    Json = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FastMessageStatus {
    Data = 1,
    End = 2,
    Error = 3,
}

#[derive(Debug)]
pub enum FastParseError {
    NotEnoughBytes(usize),
    IOError(Error),
}

impl From<io::Error> for FastParseError {
    fn from(error: io::Error) -> Self {
        FastParseError::IOError(error)
    }
}

impl From<FastParseError> for io::Error {
    fn from(pe: FastParseError) -> Self {
        match pe {
            FastParseError::NotEnoughBytes(_) => {
                let msg = "Unable to parse message: not enough bytes";
                Error::new(ErrorKind::UnexpectedEof, msg)
            }
            FastParseError::IOError(e) => e,
        }
    }
}

struct FastMessageHeader {
    msg_type: FastMessageType,
    status: FastMessageStatus,
    id: u32,
    crc: u32,
    data_len: usize,
}

/// Allocates message ids from the circular 31-bit space. Shared by every
/// call made through one proxy.
#[derive(Debug, Default)]
pub struct FastMessageId(AtomicU32);

impl FastMessageId {
    pub fn new() -> FastMessageId {
        FastMessageId(AtomicU32::new(0))
    }

    pub fn next(&self) -> u32 {
        let prev = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some((id + 1) % FP_MSGID_MAX)
            })
            .unwrap_or(0);
        (prev + 1) % FP_MSGID_MAX
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FastMessageMetaData {
    pub uts: u64,
    pub name: String,
}

impl FastMessageMetaData {
    pub fn new(n: String) -> FastMessageMetaData {
        let now = Utc::now();
        let now_micros = now.timestamp() as u64 * 1_000_000
            + u64::from(now.timestamp_subsec_micros());

        FastMessageMetaData {
            uts: now_micros,
            name: n,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FastMessageData {
    pub m: FastMessageMetaData,
    pub d: Value,
}

impl FastMessageData {
    pub fn new(n: String, d: Value) -> FastMessageData {
        FastMessageData {
            m: FastMessageMetaData::new(n),
            d,
        }
    }
}

/// A structured error returned by a peer in place of a reply value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Fault {
    #[serde(rename = "name")]
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// The remote error's own causes, kept as text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl Fault {
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M) -> Fault {
        Fault {
            code: code.into(),
            message: message.into(),
            detail: None,
            cause: None,
        }
    }

    /// The generic fault written for an unanticipated handler error.
    pub fn service_exception(err: &error::Error) -> Fault {
        Fault {
            code: String::from(FAULT_SERVICE),
            message: err.to_string(),
            detail: Some(err.to_detail()),
            cause: err.cause_chain(),
        }
    }

    pub fn no_method(method: &str) -> Fault {
        Fault::new(FAULT_NO_METHOD, format!("no such method: {}", method))
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(String::from("name"), Value::String(self.code.clone()));
        obj.insert(
            String::from("message"),
            Value::String(self.message.clone()),
        );
        if let Some(detail) = &self.detail {
            obj.insert(String::from("detail"), detail.clone());
        }
        if let Some(cause) = &self.cause {
            obj.insert(String::from("cause"), Value::String(cause.clone()));
        }
        Value::Object(obj)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct FastMessage {
    pub msg_type: FastMessageType,
    pub status: FastMessageStatus,
    pub id: u32,
    pub msg_size: Option<usize>,
    pub data: FastMessageData,
}

impl FastMessage {
    pub fn parse(buf: &[u8]) -> Result<FastMessage, FastParseError> {
        FastMessage::check_buffer_size(buf)?;
        let header = FastMessage::parse_header(buf)?;

        FastMessage::validate_data_length(buf, header.data_len)?;
        let raw_data = &buf[FP_OFF_DATA..FP_OFF_DATA + header.data_len];
        FastMessage::validate_crc(raw_data, header.crc)?;
        let data = FastMessage::parse_data(raw_data)?;

        Ok(FastMessage {
            msg_type: header.msg_type,
            status: header.status,
            id: header.id,
            msg_size: Some(FP_HEADER_SZ + header.data_len),
            data,
        })
    }

    fn check_buffer_size(buf: &[u8]) -> Result<(), FastParseError> {
        if buf.len() < FP_HEADER_SZ {
            Err(FastParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn parse_header(buf: &[u8]) -> Result<FastMessageHeader, FastParseError> {
        if buf[FP_OFF_VERSION] != FP_VERSION_CURRENT {
            let msg = format!(
                "Unsupported protocol version: {}",
                buf[FP_OFF_VERSION]
            );
            return Err(FastParseError::IOError(Error::new(
                ErrorKind::InvalidData,
                msg,
            )));
        }
        let msg_type = FromPrimitive::from_u8(buf[FP_OFF_TYPE])
            .ok_or_else(|| {
                let msg = "Failed to parse message type";
                FastParseError::IOError(Error::new(ErrorKind::InvalidData, msg))
            })?;
        let status = FromPrimitive::from_u8(buf[FP_OFF_STATUS])
            .ok_or_else(|| {
                let msg = "Failed to parse message status";
                FastParseError::IOError(Error::new(ErrorKind::InvalidData, msg))
            })?;
        let msg_id = BigEndian::read_u32(&buf[FP_OFF_MSGID..FP_OFF_MSGID + 4]);
        let expected_crc = BigEndian::read_u32(&buf[FP_OFF_CRC..FP_OFF_CRC + 4]);
        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4])
                as usize;

        Ok(FastMessageHeader {
            msg_type,
            status,
            id: msg_id,
            crc: expected_crc,
            data_len,
        })
    }

    fn validate_data_length(
        buf: &[u8],
        data_length: usize,
    ) -> Result<(), FastParseError> {
        if buf.len() < (FP_HEADER_SZ + data_length) {
            Err(FastParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn validate_crc(data_buf: &[u8], crc: u32) -> Result<(), FastParseError> {
        let calculated_crc = u32::from(State::<ARC>::calculate(data_buf));
        if crc != calculated_crc {
            // node-fast uses an old version of a crc lib with a bug, so a
            // mismatch is ignored until both sides agree on the calculation.
            //
            // let msg = "Calculated CRC does not match the provided CRC";
            // Err(FastParseError::IOError(Error::new(ErrorKind::Other, msg)))
            Ok(())
        } else {
            Ok(())
        }
    }

    fn parse_data(data_buf: &[u8]) -> Result<FastMessageData, FastParseError> {
        match str::from_utf8(data_buf) {
            Ok(data_str) => serde_json::from_str(data_str).map_err(|_e| {
                let msg = "Failed to parse data payload as JSON";
                FastParseError::IOError(Error::new(ErrorKind::InvalidData, msg))
            }),
            Err(_) => {
                let msg = "Failed to parse data payload as UTF-8";
                Err(FastParseError::IOError(Error::new(
                    ErrorKind::InvalidData,
                    msg,
                )))
            }
        }
    }

    pub fn data(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Data,
            id: msg_id,
            msg_size: None,
            data,
        }
    }

    pub fn end(msg_id: u32) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::End,
            id: msg_id,
            msg_size: None,
            data: FastMessageData::new(String::from("end"), Value::Null),
        }
    }

    pub fn error(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Error,
            id: msg_id,
            msg_size: None,
            data,
        }
    }

    /// The call frame: method name plus positional arguments.
    pub fn call(msg_id: u32, method: &str, args: Vec<Value>) -> FastMessage {
        FastMessage::data(
            msg_id,
            FastMessageData::new(String::from(method), Value::Array(args)),
        )
    }

    pub fn value_reply(msg_id: u32, method: &str, value: Value) -> FastMessage {
        FastMessage::data(
            msg_id,
            FastMessageData::new(String::from(method), Value::Array(vec![value])),
        )
    }

    pub fn fault_reply(msg_id: u32, method: &str, fault: &Fault) -> FastMessage {
        FastMessage::error(
            msg_id,
            FastMessageData::new(String::from(method), fault.to_value()),
        )
    }

    pub fn method(&self) -> &str {
        &self.data.m.name
    }

    /// Turn a reply frame into the call's return value or its fault.
    pub fn into_reply(self) -> Result<Value, error::Error> {
        match self.status {
            FastMessageStatus::Data => match self.data.d {
                Value::Array(mut values) if values.len() <= 1 => {
                    Ok(values.pop().unwrap_or(Value::Null))
                }
                other => Ok(other),
            },
            FastMessageStatus::Error => {
                let fault: Fault = serde_json::from_value(self.data.d)
                    .map_err(|e| {
                        error::Error::Marshal(format!(
                            "malformed fault reply: {}",
                            e
                        ))
                    })?;
                Err(error::Error::Fault(fault))
            }
            FastMessageStatus::End => Err(error::Error::Marshal(String::from(
                "reply stream ended without a value",
            ))),
        }
    }
}

pub struct FastRpc;

impl Decoder for FastRpc {
    type Item = FastMessage;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, io::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        match FastMessage::parse(&buf[..]) {
            Ok(msg) => {
                if let Some(size) = msg.msg_size {
                    buf.advance(size);
                }
                Ok(Some(msg))
            }
            Err(FastParseError::NotEnoughBytes(_)) => Ok(None),
            Err(FastParseError::IOError(e)) => Err(e),
        }
    }
}

pub fn encode_msg(msg: &FastMessage, buf: &mut BytesMut) -> Result<(), io::Error> {
    let m_msg_type_u8 = ToPrimitive::to_u8(&msg.msg_type);
    let m_status_u8 = ToPrimitive::to_u8(&msg.status);
    match (m_msg_type_u8, m_status_u8) {
        (Some(msg_type_u8), Some(status_u8)) => {
            let data_str = serde_json::to_string(&msg.data)
                .map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
            let data_len = data_str.len();
            buf.reserve(FP_HEADER_SZ + data_len);
            buf.put_u8(FP_VERSION_CURRENT);
            buf.put_u8(msg_type_u8);
            buf.put_u8(status_u8);
            buf.put_u32(msg.id);
            buf.put_u32(u32::from(State::<ARC>::calculate(data_str.as_bytes())));
            buf.put_u32(data_len as u32);
            buf.put_slice(data_str.as_bytes());
            Ok(())
        }
        (None, Some(_)) => {
            Err(Error::new(ErrorKind::InvalidInput, "Invalid message type"))
        }
        (Some(_), None) => {
            Err(Error::new(ErrorKind::InvalidInput, "Invalid status"))
        }
        (None, None) => Err(Error::new(
            ErrorKind::InvalidInput,
            "Invalid message type and status",
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    fn encoded(msg: &FastMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_msg(msg, &mut buf).expect("encode failed");
        buf
    }

    #[test]
    fn parse_reports_missing_bytes() {
        let buf = encoded(&FastMessage::call(7, "add", vec![json!(2), json!(3)]));

        match FastMessage::parse(&buf[..FP_HEADER_SZ - 1]) {
            Err(FastParseError::NotEnoughBytes(n)) => {
                assert_eq!(n, FP_HEADER_SZ - 1)
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
        match FastMessage::parse(&buf[..buf.len() - 1]) {
            Err(FastParseError::NotEnoughBytes(_)) => (),
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn parse_call_frame() {
        let buf = encoded(&FastMessage::call(7, "add", vec![json!(2), json!(3)]));
        let msg = FastMessage::parse(&buf).expect("parse failed");

        assert_eq!(msg.id, 7);
        assert_eq!(msg.status, FastMessageStatus::Data);
        assert_eq!(msg.method(), "add");
        assert_eq!(msg.data.d, json!([2, 3]));
        assert_eq!(msg.msg_size, Some(buf.len()));
    }

    #[test]
    fn parse_rejects_unknown_version() {
        let mut buf = encoded(&FastMessage::end(1));
        buf[FP_OFF_VERSION] = 9;

        match FastMessage::parse(&buf) {
            Err(FastParseError::IOError(e)) => {
                assert_eq!(e.kind(), ErrorKind::InvalidData)
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn fault_reply_becomes_fault_error() {
        let mut fault = Fault::new("Custom", "went wrong");
        fault.detail = Some(json!({"at": 3}));
        let buf = encoded(&FastMessage::fault_reply(2, "explode", &fault));
        let msg = FastMessage::parse(&buf).expect("parse failed");

        match msg.into_reply() {
            Err(error::Error::Fault(decoded)) => assert_eq!(decoded, fault),
            other => panic!("expected a fault, got {:?}", other),
        }
    }

    #[test]
    fn value_reply_unwraps_single_value() {
        let buf = encoded(&FastMessage::value_reply(2, "add", json!(5)));
        let msg = FastMessage::parse(&buf).expect("parse failed");

        assert_eq!(msg.into_reply().expect("reply"), json!(5));
    }

    #[test]
    fn decoder_splits_back_to_back_frames() {
        let mut buf = encoded(&FastMessage::value_reply(4, "add", json!(5)));
        buf.extend_from_slice(&encoded(&FastMessage::end(4)));

        let first = FastRpc.decode(&mut buf).expect("decode").expect("frame");
        let second = FastRpc.decode(&mut buf).expect("decode").expect("frame");

        assert_eq!(first.status, FastMessageStatus::Data);
        assert_eq!(second.status, FastMessageStatus::End);
        assert!(buf.is_empty());
        assert!(FastRpc.decode(&mut buf).expect("decode").is_none());
    }

    #[test]
    fn message_ids_wrap_in_31_bits() {
        let ids = FastMessageId(AtomicU32::new(FP_MSGID_MAX - 1));

        assert_eq!(ids.next(), 0);
        assert_eq!(ids.next(), 1);
    }
}
