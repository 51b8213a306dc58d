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

use std::fmt::Debug;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::AppError::{Incomplete, InvalidMagicNumber, MessageTooLarge, UnexpectedEof};
use crate::AppResult;

/// Protocol version marker written at the start of every frame.
pub const MAGIC_NUMBER: u32 = 0x0012_3456;
/// magic (4 bytes) + payload length (2 bytes)
pub const HEADER_LEN: usize = 6;
/// The length field is 16 bits wide, so this is a hard protocol limit.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Converts payloads to frames and back, and finds frame boundaries in a byte stream.
///
/// The client uses `wrap`; the server uses `split` to cut frames off its read buffer and
/// `unwrap` to get at the payload.
pub trait PacketCodec: Debug + Send + Sync + 'static {
    fn wrap(&self, payload: &[u8]) -> AppResult<Bytes>;

    fn unwrap(&self, frame: Bytes) -> Bytes;

    /// Looks for a complete frame at the start of `buffer`.
    ///
    /// Returns `Ok(Some(n))` when the first `n` bytes form a frame, and `Ok(None)` when more
    /// data is needed. `at_eof` tells the splitter no more bytes will arrive, so an
    /// incomplete remainder is an error.
    fn split(&self, buffer: &[u8], at_eof: bool) -> AppResult<Option<usize>>;
}

/// The default codec: `magic (u32 BE) | length (u16 BE) | payload`.
#[derive(Debug, Clone, Copy)]
pub struct LengthValueCodec {
    magic_number: u32,
}

impl Default for LengthValueCodec {
    fn default() -> Self {
        LengthValueCodec::new(MAGIC_NUMBER)
    }
}

impl LengthValueCodec {
    pub fn new(magic_number: u32) -> Self {
        LengthValueCodec { magic_number }
    }

    pub fn magic_number(&self) -> u32 {
        self.magic_number
    }

    /// Returns the total frame length if a whole frame is buffered, `Incomplete` if not.
    pub fn check(&self, buffer: &[u8]) -> AppResult<usize> {
        if buffer.len() < HEADER_LEN {
            return Err(Incomplete);
        }
        let mut header = &buffer[..HEADER_LEN];
        let magic_number = header.get_u32();
        if magic_number != self.magic_number {
            return Err(InvalidMagicNumber(magic_number));
        }
        let frame_len = header.get_u16() as usize + HEADER_LEN;
        if buffer.len() < frame_len {
            return Err(Incomplete);
        }
        Ok(frame_len)
    }
}

impl PacketCodec for LengthValueCodec {
    fn wrap(&self, payload: &[u8]) -> AppResult<Bytes> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(MessageTooLarge(payload.len()));
        }
        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
        frame.put_u32(self.magic_number);
        frame.put_u16(payload.len() as u16);
        frame.put_slice(payload);
        Ok(frame.freeze())
    }

    fn unwrap(&self, mut frame: Bytes) -> Bytes {
        frame.advance(HEADER_LEN.min(frame.len()));
        frame
    }

    fn split(&self, buffer: &[u8], at_eof: bool) -> AppResult<Option<usize>> {
        match self.check(buffer) {
            Ok(frame_len) => Ok(Some(frame_len)),
            Err(Incomplete) if at_eof && !buffer.is_empty() => Err(UnexpectedEof),
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
