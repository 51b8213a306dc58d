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

//! Network Module Implementation
//!
//! Wire-level building blocks shared by the client and the server.
//!
//! # Wire format
//!
//! Every packet travels as one frame, all integers big-endian:
//!
//! ```text
//! offset 0..4    magic number (protocol version marker)
//! offset 4..6    payload length L (u16, 0..=65535)
//! offset 6..6+L  payload
//! ```
//!
//! Payloads longer than 65535 bytes cannot be expressed and are rejected when wrapped.
//!
//! # Components
//!
//! - `PacketCodec` / `LengthValueCodec`: wrapping, unwrapping and stream splitting
//! - `Connection`: the read side of an accepted connection, yielding packets in order
//! - `ResponseWriter`: the write side, handed to handlers
//! - `AsyncStream`: the stream abstraction plain TCP and TLS both satisfy

pub use connection::{Connection, Packet, ResponseWriter};
pub use frame::{LengthValueCodec, PacketCodec, HEADER_LEN, MAGIC_NUMBER, MAX_PAYLOAD_LEN};
pub use stream::{is_end_of_stream, is_temporary, AsyncStream, BoxedStream};
mod connection;
mod frame;
mod stream;
