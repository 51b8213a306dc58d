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

//! Length-prefixed packet transport over TCP.
//!
//! [`Server`] accepts connections and hands every complete packet to a [`Handler`] together
//! with a writer back to the peer. [`Client`] keeps a bounded pool of connections to one
//! server, refilled in the background, and retries requests on broken connections until the
//! caller's deadline.

pub mod client;
pub mod network;
pub mod service;
pub mod utils;

pub use client::Client;
pub use network::{LengthValueCodec, Packet, PacketCodec, ResponseWriter};
pub use service::{
    handler_fn, setup_local_tracing, setup_tracing, AppConfig, AppError, AppResult, ClientConfig,
    Handler, Server, ServerConfig, Shutdown,
};
