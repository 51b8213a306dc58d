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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// client errors
    #[error("closed")]
    ClosedPool,

    #[error("timeout")]
    Timeout,

    /// server errors
    #[error("server closed")]
    ServerClosed,

    #[error("accept error: {0}")]
    Accept(String),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// protocol errors
    #[error("invalid magic number: 0x{0:08x}")]
    InvalidMagicNumber(u32),

    #[error("unexpected EOF")]
    UnexpectedEof,

    #[error("packet of length {0} is too large")]
    MessageTooLarge(usize),

    /// marker error
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Whether the error came from a deadline expiring, either while waiting for a pooled
    /// connection or during the I/O itself.
    pub fn is_timeout(&self) -> bool {
        match self {
            AppError::Timeout => true,
            AppError::IoError(err) => err.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Protocol violations terminate the stream they were read from.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidMagicNumber(_) | AppError::UnexpectedEof | AppError::MessageTooLarge(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(AppError::Timeout.is_timeout());
        assert!(AppError::IoError(io::Error::from(io::ErrorKind::TimedOut)).is_timeout());
        assert!(!AppError::IoError(io::Error::from(io::ErrorKind::BrokenPipe)).is_timeout());
        assert!(!AppError::ClosedPool.is_timeout());
    }

    #[test]
    fn test_magic_number_message() {
        let err = AppError::InvalidMagicNumber(0xdead_beef);
        assert_eq!(err.to_string(), "invalid magic number: 0xdeadbeef");
        assert!(err.is_protocol_error());
    }
}
