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

use bytes::{BufMut, BytesMut};
use rstest::rstest;
use tcpframe::network::{HEADER_LEN, MAGIC_NUMBER};
use tcpframe::{AppError, LengthValueCodec, PacketCodec};

/// Feeds `stream` to the splitter one byte at a time, the way a slow socket would.
fn split_incrementally(codec: &LengthValueCodec, stream: &[u8]) -> Vec<Vec<u8>> {
    let mut buffer = BytesMut::new();
    let mut payloads = Vec::new();
    for byte in stream {
        buffer.put_u8(*byte);
        while let Some(frame_len) = codec.split(&buffer, false).unwrap() {
            let frame = buffer.split_to(frame_len).freeze();
            payloads.push(codec.unwrap(frame).to_vec());
        }
    }
    assert!(buffer.is_empty());
    assert_eq!(codec.split(&buffer, true).unwrap(), None);
    payloads
}

#[rstest]
#[case(vec![b"hello".to_vec()])]
#[case(vec![Vec::new(), b"a".to_vec(), Vec::new()])]
#[case(vec![vec![0xab; 300], b"tail".to_vec()])]
fn test_frames_survive_byte_by_byte_delivery(#[case] payloads: Vec<Vec<u8>>) {
    let codec = LengthValueCodec::default();
    let mut stream = Vec::new();
    for payload in &payloads {
        stream.extend_from_slice(&codec.wrap(payload).unwrap());
    }
    assert_eq!(split_incrementally(&codec, &stream), payloads);
}

#[test]
fn test_header_layout() {
    let codec = LengthValueCodec::default();
    let frame = codec.wrap(&[1, 2, 3]).unwrap();
    assert_eq!(frame.len(), HEADER_LEN + 3);
    assert_eq!(&frame[..4], &MAGIC_NUMBER.to_be_bytes());
    assert_eq!(&frame[4..6], &[0, 3]);
}

#[rstest]
#[case(&[0x00, 0x12, 0x34, 0x57, 0x00, 0x00], 0x0012_3457)]
#[case(&[0xff, 0xff, 0xff, 0xff, 0x00, 0x01, 0x00], 0xffff_ffff)]
fn test_corrupt_magic_rejected(#[case] buffer: &[u8], #[case] magic: u32) {
    let codec = LengthValueCodec::default();
    match codec.split(buffer, false) {
        Err(AppError::InvalidMagicNumber(found)) => assert_eq!(found, magic),
        other => panic!("unexpected split result: {:?}", other),
    }
}

#[test]
fn test_truncated_frame_at_eof() {
    let codec = LengthValueCodec::default();
    let frame = codec.wrap(b"truncated").unwrap();
    for cut in 1..frame.len() {
        assert_eq!(codec.split(&frame[..cut], false).unwrap(), None);
        assert!(matches!(
            codec.split(&frame[..cut], true),
            Err(AppError::UnexpectedEof)
        ));
    }
}

#[test]
fn test_custom_magic_number() {
    let codec = LengthValueCodec::new(0xcafe_babe);
    let frame = codec.wrap(b"x").unwrap();
    assert_eq!(codec.split(&frame, false).unwrap(), Some(HEADER_LEN + 1));
    assert!(matches!(
        LengthValueCodec::default().split(&frame, false),
        Err(AppError::InvalidMagicNumber(0xcafe_babe))
    ));
}
