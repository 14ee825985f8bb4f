// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{BufMut, Bytes, BytesMut};

use crate::service::MAX_BODY_SIZE;
use crate::{AppError, AppResult};

/// Size of the length header that precedes every frame body.
pub const HEADER_SIZE: usize = 2;
/// Initial capacity of an outbound packet, sized to stay within one TCP segment.
pub const PACKET_BUFFER_SIZE: usize = 1440;
/// Longest string or byte array a 2-byte length prefix can carry.
pub const MAX_FIELD_LEN: usize = i16::MAX as usize;

///
/// A positional little-endian codec over one frame.
///
/// Wire layout: `[i16 body length][i16 protocol id][fields...]`.
/// Fields carry no type tags, so they must be popped in exactly the order they
/// were pushed; the protocol id tells the reader which schema applies.
/// The write cursor is the end of the buffer, the read cursor is `position`.
///
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    protocol_id: i16,
    buffer: BytesMut,
    position: usize,
}

impl Packet {
    /// Starts an outbound packet: a zeroed header placeholder followed by the id.
    pub fn create(protocol_id: i16) -> Packet {
        let mut buffer = BytesMut::with_capacity(PACKET_BUFFER_SIZE);
        buffer.put_i16_le(0);
        buffer.put_i16_le(protocol_id);
        Packet {
            protocol_id,
            buffer,
            position: HEADER_SIZE,
        }
    }

    /// Wraps one complete inbound frame (header included).
    ///
    /// The protocol id is decoded up front, the read cursor is left right after
    /// the header so the first pop is still the protocol id.
    pub fn from_frame(frame: BytesMut) -> AppResult<Packet> {
        if frame.len() < HEADER_SIZE + 2 {
            return Err(AppError::MalformedProtocol(format!(
                "frame of {} bytes has no protocol id",
                frame.len()
            )));
        }
        let protocol_id = i16::from_le_bytes([frame[HEADER_SIZE], frame[HEADER_SIZE + 1]]);
        Ok(Packet {
            protocol_id,
            buffer: frame,
            position: HEADER_SIZE,
        })
    }

    pub fn protocol_id(&self) -> i16 {
        self.protocol_id
    }

    /// Rewrites the protocol id in place, e.g. to forward a message under another id.
    pub fn set_protocol(&mut self, protocol_id: i16) {
        self.protocol_id = protocol_id;
        self.buffer[HEADER_SIZE..HEADER_SIZE + 2].copy_from_slice(&protocol_id.to_le_bytes());
    }

    /// Current read cursor.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Logical size: header plus everything written so far.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn body_size(&self) -> usize {
        self.buffer.len().saturating_sub(HEADER_SIZE)
    }

    /// Bytes left for the reader.
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Hands the encoded frame over for transmission.
    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }

    pub fn copy_to(&self, target: &mut Packet) {
        target.protocol_id = self.protocol_id;
        target.buffer.clear();
        target.buffer.extend_from_slice(&self.buffer);
        target.position = self.position;
    }

    /// Stamps the body length into the header. Must run after the last push.
    pub fn record_size(&mut self) -> AppResult<()> {
        let body_size = self.body_size();
        if body_size > MAX_BODY_SIZE {
            return Err(AppError::PacketTooLarge(format!(
                "body of {} bytes exceeds {}",
                body_size, MAX_BODY_SIZE
            )));
        }
        self.buffer[..HEADER_SIZE].copy_from_slice(&(body_size as i16).to_le_bytes());
        Ok(())
    }

    fn take(&mut self, len: usize, what: &str) -> AppResult<&[u8]> {
        let start = self.position;
        let end = start + len;
        if end > self.buffer.len() {
            return Err(AppError::MalformedProtocol(format!(
                "can not read a {} of {} bytes at {}, packet size {}",
                what,
                len,
                start,
                self.buffer.len()
            )));
        }
        self.position = end;
        Ok(&self.buffer[start..end])
    }

    fn take_len_prefixed(&mut self, what: &str) -> AppResult<&[u8]> {
        let len = self.pop_i16()?;
        if len < 0 {
            return Err(AppError::MalformedProtocol(format!(
                "can not read a {}, length {} is negative",
                what, len
            )));
        }
        self.take(len as usize, what)
    }

    pub fn pop_protocol_id(&mut self) -> AppResult<i16> {
        self.pop_i16()
    }

    pub fn pop_bool(&mut self) -> AppResult<bool> {
        Ok(self.pop_i16()? == 1)
    }

    pub fn pop_i16(&mut self) -> AppResult<i16> {
        let bytes = self.take(2, "i16")?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn pop_i32(&mut self) -> AppResult<i32> {
        let bytes = self.take(4, "i32")?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn pop_f32(&mut self) -> AppResult<f32> {
        let bytes = self.take(4, "f32")?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn pop_byte(&mut self) -> AppResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    pub fn pop_string(&mut self) -> AppResult<String> {
        let bytes = self.take_len_prefixed("string")?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| AppError::MalformedProtocol(format!("string is not utf-8: {}", e)))
    }

    pub fn pop_bytes(&mut self) -> AppResult<Vec<u8>> {
        Ok(self.take_len_prefixed("byte array")?.to_vec())
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push_i16(if value { 1 } else { 0 });
    }

    pub fn push_i16(&mut self, value: i16) {
        self.buffer.put_i16_le(value);
    }

    pub fn push_i32(&mut self, value: i32) {
        self.buffer.put_i32_le(value);
    }

    pub fn push_f32(&mut self, value: f32) {
        self.buffer.put_f32_le(value);
    }

    pub fn push_byte(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    pub fn push_string(&mut self, value: &str) -> AppResult<()> {
        self.push_len_prefixed(value.as_bytes(), "string")
    }

    /// `None` encodes exactly like an empty string.
    pub fn push_opt_string(&mut self, value: Option<&str>) -> AppResult<()> {
        self.push_string(value.unwrap_or_default())
    }

    pub fn push_bytes(&mut self, value: &[u8]) -> AppResult<()> {
        self.push_len_prefixed(value, "byte array")
    }

    fn push_len_prefixed(&mut self, value: &[u8], what: &str) -> AppResult<()> {
        if value.len() > MAX_FIELD_LEN {
            return Err(AppError::PacketTooLarge(format!(
                "{} of {} bytes exceeds {}",
                what,
                value.len(),
                MAX_FIELD_LEN
            )));
        }
        self.buffer.put_i16_le(value.len() as i16);
        self.buffer.put_slice(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn reopen(mut packet: Packet) -> Packet {
        packet.record_size().unwrap();
        Packet::from_frame(BytesMut::from(packet.as_bytes())).unwrap()
    }

    #[test]
    fn test_set_protocol_rewrites_header_field() {
        let mut packet = Packet::create(5);
        packet.push_i32(42);
        packet.set_protocol(-7);
        assert_eq!(packet.protocol_id(), -7);

        let mut reopened = reopen(packet);
        assert_eq!(reopened.protocol_id(), -7);
        assert_eq!(reopened.pop_protocol_id().unwrap(), -7);
        assert_eq!(reopened.pop_i32().unwrap(), 42);
    }

    #[test]
    fn test_all_field_types_in_order() {
        let mut packet = Packet::create(7);
        packet.push_bool(true);
        packet.push_bool(false);
        packet.push_i16(i16::MIN);
        packet.push_i16(i16::MAX);
        packet.push_i32(i32::MIN);
        packet.push_i32(-1);
        packet.push_i32(i32::MAX);
        packet.push_f32(f32::MAX);
        packet.push_f32(f32::MIN_POSITIVE);
        packet.push_f32(-0.5);
        packet.push_string("").unwrap();
        packet.push_string("안녕 hello").unwrap();
        packet.push_bytes(&[]).unwrap();
        packet.push_bytes(&[0, 255, 7]).unwrap();
        packet.push_byte(u8::MAX);

        let mut packet = reopen(packet);
        assert_eq!(packet.protocol_id(), 7);
        assert_eq!(packet.pop_protocol_id().unwrap(), 7);
        assert!(packet.pop_bool().unwrap());
        assert!(!packet.pop_bool().unwrap());
        assert_eq!(packet.pop_i16().unwrap(), i16::MIN);
        assert_eq!(packet.pop_i16().unwrap(), i16::MAX);
        assert_eq!(packet.pop_i32().unwrap(), i32::MIN);
        assert_eq!(packet.pop_i32().unwrap(), -1);
        assert_eq!(packet.pop_i32().unwrap(), i32::MAX);
        assert_eq!(packet.pop_f32().unwrap(), f32::MAX);
        assert_eq!(packet.pop_f32().unwrap(), f32::MIN_POSITIVE);
        assert_eq!(packet.pop_f32().unwrap(), -0.5);
        assert_eq!(packet.pop_string().unwrap(), "");
        assert_eq!(packet.pop_string().unwrap(), "안녕 hello");
        assert!(packet.pop_bytes().unwrap().is_empty());
        assert_eq!(packet.pop_bytes().unwrap(), vec![0, 255, 7]);
        assert_eq!(packet.pop_byte().unwrap(), u8::MAX);
        assert_eq!(packet.remaining(), 0);
    }

    #[test]
    fn test_record_size_writes_body_length() {
        let mut packet = Packet::create(0);
        packet.push_string("Hello, Server!").unwrap();
        packet.record_size().unwrap();

        let bytes = packet.as_bytes();
        let body = i16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        // protocol id + length prefix + 14 bytes
        assert_eq!(body, 2 + 2 + 14);
        assert_eq!(body + HEADER_SIZE, bytes.len());
        assert_eq!(&bytes[2..4], &0i16.to_le_bytes());
    }

    #[test]
    fn test_absent_string_encodes_as_empty() {
        let mut packet = Packet::create(1);
        packet.push_opt_string(None).unwrap();
        let mut packet = reopen(packet);
        packet.pop_protocol_id().unwrap();
        assert_eq!(packet.pop_string().unwrap(), "");
    }

    #[rstest]
    #[case::i16(1)]
    #[case::i32(3)]
    #[case::string(2)]
    fn test_pop_past_end_is_rejected(#[case] written: usize) {
        let mut packet = Packet::create(3);
        for _ in 0..written {
            packet.push_byte(1);
        }
        let mut packet = reopen(packet);
        packet.pop_protocol_id().unwrap();
        let result = match written {
            1 => packet.pop_i16().map(|_| ()),
            3 => packet.pop_i32().map(|_| ()),
            _ => packet.pop_string().map(|_| ()),
        };
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
    }

    #[test]
    fn test_oversized_string_is_rejected() {
        let mut packet = Packet::create(3);
        let big = "x".repeat(MAX_FIELD_LEN + 1);
        assert!(matches!(
            packet.push_string(&big),
            Err(AppError::PacketTooLarge(_))
        ));
        // nothing was written
        assert_eq!(packet.size(), HEADER_SIZE + 2);
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let mut packet = Packet::create(3);
        packet.push_bytes(&vec![0u8; MAX_FIELD_LEN]).unwrap();
        assert!(matches!(
            packet.record_size(),
            Err(AppError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_copy_to() {
        let mut source = Packet::create(9);
        source.push_i32(42);
        let mut target = Packet::create(0);
        source.copy_to(&mut target);
        assert_eq!(target.protocol_id(), 9);
        assert_eq!(target, source);
    }

    #[test]
    fn test_short_frame_has_no_protocol_id() {
        let result = Packet::from_frame(BytesMut::from(&[1u8, 0, 5][..]));
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
    }
}
