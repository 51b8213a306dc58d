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

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::network::{BoxedStream, PacketCodec};
use crate::AppResult;

/// One decoded frame, as handed to a server handler.
///
/// `data` is split off the connection's read buffer without copying; it is reference
/// counted, so a handler may hold on to it after returning.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub local_addr: String,
    pub remote_addr: String,
}

/// The read side of an accepted connection.
///
/// Bytes are read into `buffer` and frames are cut off its front with the codec's splitter.
pub struct Connection {
    reader: ReadHalf<BoxedStream>,
    buffer: BytesMut,
    codec: Arc<dyn PacketCodec>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("buffered", &self.buffer.len())
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a `Connection` with a 4KB read buffer.
    pub fn new(reader: ReadHalf<BoxedStream>, codec: Arc<dyn PacketCodec>) -> Connection {
        Connection {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            codec,
        }
    }

    /// Reads the next frame and returns its unwrapped payload.
    ///
    /// Returns `None` when the peer closed the connection between frames. A corrupt header,
    /// or a peer closing in the middle of a frame, is an error and the connection should be
    /// closed.
    pub async fn read_packet(&mut self) -> AppResult<Option<Bytes>> {
        loop {
            if let Some(frame_len) = self.codec.split(&self.buffer, false)? {
                return Ok(Some(self.take_frame(frame_len)));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return match self.codec.split(&self.buffer, true)? {
                    Some(frame_len) => Ok(Some(self.take_frame(frame_len))),
                    None => Ok(None),
                };
            }
        }
    }

    fn take_frame(&mut self, frame_len: usize) -> Bytes {
        let frame = self.buffer.split_to(frame_len).freeze();
        self.codec.unwrap(frame)
    }
}

/// The write side of an accepted connection, handed to handlers as their response sink.
///
/// Implements [`AsyncWrite`], so handlers can use any `AsyncWriteExt` method; `reply`
/// writes and flushes in one go.
pub struct ResponseWriter {
    writer: WriteHalf<BoxedStream>,
}

impl ResponseWriter {
    pub fn new(writer: WriteHalf<BoxedStream>) -> ResponseWriter {
        ResponseWriter { writer }
    }

    pub async fn reply(&mut self, data: &[u8]) -> AppResult<usize> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(data.len())
    }
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter").finish_non_exhaustive()
    }
}

impl AsyncWrite for ResponseWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LengthValueCodec;
    use crate::AppError;

    fn connection_pair() -> (Connection, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let stream: BoxedStream = Box::new(local);
        let (reader, _writer) = tokio::io::split(stream);
        (
            Connection::new(reader, Arc::new(LengthValueCodec::default())),
            remote,
        )
    }

    #[tokio::test]
    async fn test_read_packets_in_order() -> AppResult<()> {
        let codec = LengthValueCodec::default();
        let (mut connection, mut remote) = connection_pair();
        let mut bytes = codec.wrap(b"one")?.to_vec();
        bytes.extend_from_slice(&codec.wrap(b"")?);
        bytes.extend_from_slice(&codec.wrap(b"three")?);
        remote.write_all(&bytes).await?;
        drop(remote);

        assert_eq!(connection.read_packet().await?.unwrap(), "one");
        assert_eq!(connection.read_packet().await?.unwrap(), "");
        assert_eq!(connection.read_packet().await?.unwrap(), "three");
        assert!(connection.read_packet().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_truncated_frame() -> AppResult<()> {
        let codec = LengthValueCodec::default();
        let (mut connection, mut remote) = connection_pair();
        let frame = codec.wrap(b"truncated")?;
        remote.write_all(&frame[..frame.len() - 2]).await?;
        drop(remote);

        assert!(matches!(
            connection.read_packet().await,
            Err(AppError::UnexpectedEof)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_magic() -> AppResult<()> {
        let (mut connection, mut remote) = connection_pair();
        remote.write_all(&[0xff, 0xff, 0xff, 0xff, 0, 1, b'x']).await?;

        assert!(matches!(
            connection.read_packet().await,
            Err(AppError::InvalidMagicNumber(0xffff_ffff))
        ));
        Ok(())
    }
}
