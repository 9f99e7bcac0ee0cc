// Copyright 2020 Joyent, Inc.

//! Client side of a single call: write the call frame, read back the reply.

use std::io::{Error, ErrorKind, Read};

use bytes::BytesMut;
use serde_json::Value;

use crate::protocol::{self, FastMessage, FastParseError};
use crate::transport::Connection;

/// Encode and send one call frame. Returns the number of bytes written.
pub fn send(
    method: &str,
    args: Vec<Value>,
    msg_id: u32,
    conn: &mut dyn Connection,
) -> Result<usize, Error> {
    let msg = FastMessage::call(msg_id, method, args);
    let mut write_buf = BytesMut::new();
    protocol::encode_msg(&msg, &mut write_buf)?;
    conn.send(write_buf.as_ref())?;
    Ok(write_buf.len())
}

/// Read until one complete reply frame has arrived. The frame must answer
/// `msg_id`.
pub fn receive<R: Read + ?Sized>(
    stream: &mut R,
    msg_id: u32,
) -> Result<FastMessage, Error> {
    let mut msg_buf: Vec<u8> = Vec::new();

    loop {
        match FastMessage::parse(&msg_buf) {
            Ok(msg) if msg.id != msg_id => {
                let msg = format!(
                    "reply id {} does not match request id {}",
                    msg.id, msg_id
                );
                return Err(Error::new(ErrorKind::InvalidData, msg));
            }
            Ok(msg) => return Ok(msg),
            Err(FastParseError::NotEnoughBytes(_)) => (),
            Err(FastParseError::IOError(e)) => return Err(e),
        }

        let mut read_buf = [0; 4096];
        let byte_count = stream.read(&mut read_buf)?;
        if byte_count == 0 {
            let msg = "connection closed before a complete reply";
            return Err(Error::new(ErrorKind::UnexpectedEof, msg));
        }
        msg_buf.extend_from_slice(&read_buf[0..byte_count]);
    }
}

/// The rest of the stream as text, for non-success statuses.
pub fn drain_text<R: Read + ?Sized>(stream: &mut R) -> Result<String, Error> {
    let mut body = Vec::new();
    stream.read_to_end(&mut body)?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    fn frame(msg: &FastMessage) -> Vec<u8> {
        let mut buf = BytesMut::new();
        protocol::encode_msg(msg, &mut buf).unwrap();
        buf.to_vec()
    }

    /// Hands out a few bytes per read.
    struct Trickle(Vec<u8>, usize);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = (self.0.len() - self.1).min(3).min(buf.len());
            buf[..n].copy_from_slice(&self.0[self.1..self.1 + n]);
            self.1 += n;
            Ok(n)
        }
    }

    #[test]
    fn receive_assembles_partial_reads() {
        let mut bytes = frame(&FastMessage::value_reply(9, "add", json!(5)));
        bytes.extend(frame(&FastMessage::end(9)));
        let mut stream = Trickle(bytes, 0);

        let msg = receive(&mut stream, 9).unwrap();
        assert_eq!(msg.into_reply().unwrap(), json!(5));
    }

    #[test]
    fn receive_rejects_foreign_reply() {
        let bytes = frame(&FastMessage::value_reply(3, "add", json!(5)));

        let err = receive(&mut &bytes[..], 9).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn receive_reports_truncation() {
        let bytes = frame(&FastMessage::value_reply(9, "add", json!(5)));

        let err = receive(&mut &bytes[..bytes.len() - 2], 9).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn drain_text_is_lossy() {
        let mut body = &b"bad \xff gateway"[..];

        assert_eq!(drain_text(&mut body).unwrap(), "bad \u{fffd} gateway");
    }
}
