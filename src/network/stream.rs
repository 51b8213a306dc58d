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

use std::io::{self, ErrorKind};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream the transport can run over: plain TCP, TLS over TCP, or
/// an in-memory duplex in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

// EMFILE / ENFILE
const TOO_MANY_OPEN_FILES: i32 = 24;
const FILE_TABLE_OVERFLOW: i32 = 23;

/// Whether an error is expected to clear up on its own, so the operation can be retried
/// after a pause instead of abandoning the socket or listener.
pub fn is_temporary(err: &io::Error) -> bool {
    if matches!(
        err.raw_os_error(),
        Some(TOO_MANY_OPEN_FILES) | Some(FILE_TABLE_OVERFLOW)
    ) {
        return true;
    }
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

/// Whether a read failed because the peer went away without answering.
pub fn is_end_of_stream(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(is_temporary(&io::Error::from(ErrorKind::ConnectionAborted)));
        assert!(is_temporary(&io::Error::from_raw_os_error(TOO_MANY_OPEN_FILES)));
        assert!(!is_temporary(&io::Error::from(ErrorKind::AddrInUse)));

        assert!(is_end_of_stream(&io::Error::from(ErrorKind::ConnectionReset)));
        assert!(!is_end_of_stream(&io::Error::from(ErrorKind::TimedOut)));
    }
}
