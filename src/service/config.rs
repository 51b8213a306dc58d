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

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::{LengthValueCodec, PacketCodec};

use super::{AppError, AppResult};

pub const DEFAULT_NETWORK: &str = "tcp";
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 3000;

/// Networks a client can dial and a server can listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn parse(network: &str) -> AppResult<Network> {
        match network {
            "" | "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(AppError::InvalidValue(format!("unknown network: {}", other))),
        }
    }

    pub fn accepts(&self, addr: &std::net::SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub network: String,
    pub remote_addr: String,
    /// pool size; values <= 0 fall back to 1
    pub max_conn_count: i32,
    pub dial_timeout_ms: u64,
    /// SNI name used for TLS; defaults to the host part of `remote_addr`
    pub tls_server_name: Option<String>,
    #[serde(skip)]
    pub tls: Option<Arc<rustls::ClientConfig>>,
    #[serde(skip)]
    pub codec: Option<Arc<dyn PacketCodec>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            network: DEFAULT_NETWORK.to_string(),
            remote_addr: String::new(),
            max_conn_count: 1,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            tls_server_name: None,
            tls: None,
            codec: None,
        }
    }
}

impl ClientConfig {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        ClientConfig {
            remote_addr: remote_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_max_conn_count(mut self, max_conn_count: i32) -> Self {
        self.max_conn_count = max_conn_count;
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout_ms = dial_timeout.as_millis() as u64;
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn PacketCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Fills in defaults and rejects settings the client cannot run with.
    pub fn validate(&mut self) -> AppResult<()> {
        if self.network.is_empty() {
            self.network = DEFAULT_NETWORK.to_string();
        }
        Network::parse(&self.network)?;
        if self.remote_addr.is_empty() {
            return Err(AppError::InvalidValue(
                "client's remote_addr is empty".to_string(),
            ));
        }
        if self.max_conn_count <= 0 {
            self.max_conn_count = 1;
        }
        if self.dial_timeout_ms == 0 {
            self.dial_timeout_ms = DEFAULT_DIAL_TIMEOUT_MS;
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn pool_size(&self) -> usize {
        self.max_conn_count.max(1) as usize
    }

    pub fn codec(&self) -> Arc<dyn PacketCodec> {
        self.codec
            .clone()
            .unwrap_or_else(|| Arc::new(LengthValueCodec::default()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: String,
    pub addr: String,
    #[serde(skip)]
    pub tls: Option<Arc<rustls::ServerConfig>>,
    #[serde(skip)]
    pub codec: Option<Arc<dyn PacketCodec>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            network: DEFAULT_NETWORK.to_string(),
            addr: String::new(),
            tls: None,
            codec: None,
        }
    }
}

impl ServerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        ServerConfig {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn PacketCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn validate(&mut self) -> AppResult<()> {
        if self.network.is_empty() {
            self.network = DEFAULT_NETWORK.to_string();
        }
        Network::parse(&self.network)?;
        if self.addr.is_empty() {
            return Err(AppError::InvalidValue("server's addr is empty".to_string()));
        }
        Ok(())
    }

    pub fn codec(&self) -> Arc<dyn PacketCodec> {
        self.codec
            .clone()
            .unwrap_or_else(|| Arc::new(LengthValueCodec::default()))
    }
}

/// Load generator settings used by the `bench` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub workers: usize,
    pub duration_secs: u64,
    pub request_timeout_ms: u64,
    pub latency_start_ms: u64,
    pub latency_buckets: usize,
    pub payload: String,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            workers: num_cpus::get() * 8,
            duration_secs: 30,
            request_timeout_ms: 1000,
            latency_start_ms: 5,
            latency_buckets: 6,
            payload: "Hello".to_string(),
        }
    }
}

/// Liveness probing settings used by the `ping` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub payload: String,
    pub max_retry: u32,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for PingConfig {
    fn default() -> Self {
        PingConfig {
            payload: "ping".to_string(),
            max_retry: 10,
            interval_ms: 1000,
            timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub bench: BenchConfig,
    pub ping: PingConfig,
}

impl AppConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<AppConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("TCPFRAME").separator("__"))
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }
}
