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

use bytes::BytesMut;

use super::packet::{HEADER_SIZE, PACKET_BUFFER_SIZE};
use crate::service::MAX_BODY_SIZE;
use crate::{AppError, AppResult};

/// Reassembles `[i16 body length][body]` frames from an arbitrary byte stream.
///
/// One resolver belongs to one session and is only fed by that session's
/// receive loop. A single call may complete any number of frames and leave a
/// trailing partial frame buffered for the next call.
#[derive(Debug)]
pub struct FrameResolver {
    /// Bytes of the frame in progress. Its length is the read cursor.
    buffer: BytesMut,
    /// Either `HEADER_SIZE` or `HEADER_SIZE + message_size`.
    position_to_read: usize,
    /// Declared body length of the frame in progress, 0 while in the header phase.
    message_size: usize,
    max_body_size: usize,
}

impl Default for FrameResolver {
    fn default() -> Self {
        FrameResolver::new(MAX_BODY_SIZE)
    }
}

impl FrameResolver {
    pub fn new(max_body_size: usize) -> Self {
        FrameResolver {
            buffer: BytesMut::with_capacity(PACKET_BUFFER_SIZE),
            position_to_read: HEADER_SIZE,
            message_size: 0,
            max_body_size: max_body_size.min(MAX_BODY_SIZE),
        }
    }

    /// Bytes of an unfinished frame currently held back.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feeds one receive worth of bytes, calling `on_frame` once per completed
    /// frame in stream order. Returns how many frames were completed.
    ///
    /// A declared body length of zero, negative, or above the limit makes the
    /// stream unreadable: state is cleared, the rest of `data` is discarded and
    /// `CorruptFrame` is returned after any frames completed earlier in `data`
    /// have been delivered.
    pub fn on_receive<F>(&mut self, mut data: &[u8], mut on_frame: F) -> AppResult<usize>
    where
        F: FnMut(BytesMut),
    {
        let mut completed = 0;
        while !data.is_empty() {
            if self.buffer.len() < HEADER_SIZE {
                self.position_to_read = HEADER_SIZE;
                if !self.read_until(&mut data) {
                    return Ok(completed);
                }

                let declared = i16::from_le_bytes([self.buffer[0], self.buffer[1]]);
                if declared <= 0 || declared as usize > self.max_body_size {
                    self.clear_buffer();
                    return Err(AppError::CorruptFrame(format!(
                        "declared body length {} outside 1..={}",
                        declared, self.max_body_size
                    )));
                }
                self.message_size = declared as usize;
                self.position_to_read = HEADER_SIZE + self.message_size;

                if data.is_empty() {
                    return Ok(completed);
                }
            }

            if self.read_until(&mut data) {
                // split_to hands the frame off; the working buffer keeps only
                // its spare capacity, so a delivered frame is never overwritten
                let frame = self.buffer.split_to(self.position_to_read);
                self.clear_buffer();
                completed += 1;
                on_frame(frame);
            }
        }
        Ok(completed)
    }

    /// Copies from `data` up to the current target. True once the target is reached.
    fn read_until(&mut self, data: &mut &[u8]) -> bool {
        let wanted = self.position_to_read - self.buffer.len();
        let copy_size = wanted.min(data.len());
        self.buffer.extend_from_slice(&data[..copy_size]);
        *data = &data[copy_size..];
        self.buffer.len() >= self.position_to_read
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.position_to_read = HEADER_SIZE;
        self.message_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut bytes = (body.len() as i16).to_le_bytes().to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    fn collect(resolver: &mut FrameResolver, data: &[u8]) -> AppResult<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        resolver.on_receive(data, |f| frames.push(f.to_vec()))?;
        Ok(frames)
    }

    #[test]
    fn test_header_then_body_in_separate_receives() {
        let mut resolver = FrameResolver::default();
        let bytes = frame(b"\x00\x00abc");

        assert!(collect(&mut resolver, &bytes[..2]).unwrap().is_empty());
        assert_eq!(resolver.buffered(), 2);
        let frames = collect(&mut resolver, &bytes[2..]).unwrap();
        assert_eq!(frames, vec![bytes.clone()]);
        assert_eq!(resolver.buffered(), 0);
    }

    #[test]
    fn test_complete_frames_delivered_before_partial_remainder() {
        let mut resolver = FrameResolver::default();
        let first = frame(b"\x01\x00one");
        let second = frame(b"\x02\x00second");
        let mut data = first.clone();
        data.extend_from_slice(&second[..5]);

        let frames = collect(&mut resolver, &data).unwrap();
        assert_eq!(frames, vec![first]);
        assert_eq!(resolver.buffered(), 5);

        let frames = collect(&mut resolver, &second[5..]).unwrap();
        assert_eq!(frames, vec![second]);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::negative(-4)]
    #[case::above_limit(65)]
    fn test_corrupt_length_resets_state(#[case] declared: i16) {
        let mut resolver = FrameResolver::new(64);
        let mut data = declared.to_le_bytes().to_vec();
        data.extend_from_slice(&[1, 2, 3, 4]);

        let mut delivered = 0;
        let result = resolver.on_receive(&data, |_| delivered += 1);
        assert!(matches!(result, Err(AppError::CorruptFrame(_))));
        assert_eq!(delivered, 0);
        assert_eq!(resolver.buffered(), 0);

        // the resolver is usable again from a frame boundary
        let good = frame(b"\x05\x00ok");
        assert_eq!(collect(&mut resolver, &good).unwrap(), vec![good]);
    }

    #[test]
    fn test_frames_before_corrupt_header_are_kept() {
        let mut resolver = FrameResolver::default();
        let good = frame(b"\x01\x00hi");
        let mut data = good.clone();
        data.extend_from_slice(&0i16.to_le_bytes());

        let mut frames = Vec::new();
        let result = resolver.on_receive(&data, |f| frames.push(f.to_vec()));
        assert!(result.is_err());
        assert_eq!(frames, vec![good]);
    }

    #[test]
    fn test_delivered_frame_survives_buffer_reuse() {
        let mut resolver = FrameResolver::default();
        let first = frame(b"\x01\x00aaaa");
        let second = frame(b"\x01\x00bbbb");
        let mut held = Vec::new();
        resolver.on_receive(&first, |f| held.push(f)).unwrap();
        resolver.on_receive(&second, |f| held.push(f)).unwrap();
        assert_eq!(&held[0][..], &first[..]);
        assert_eq!(&held[1][..], &second[..]);
    }
}
