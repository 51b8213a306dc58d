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

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::network::{is_temporary, BoxedStream};
use crate::service::{ClientConfig, Network};
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What the pool should do with a connection once the caller is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Reusable,
    Dead,
}

impl Liveness {
    /// Only transient failures leave the connection usable. A timeout does not: the frame
    /// may be half written, or a late response may still arrive and confuse the next user.
    pub fn of_error(err: &AppError) -> Liveness {
        match err {
            AppError::IoError(io_err) if is_temporary(io_err) && !is_reset(io_err) => {
                Liveness::Reusable
            }
            _ => Liveness::Dead,
        }
    }
}

fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// The result of one I/O call together with the connection's fate.
#[derive(Debug)]
#[must_use]
pub struct Outcome<T> {
    pub result: AppResult<T>,
    pub liveness: Liveness,
}

impl<T> Outcome<T> {
    fn from_result(result: AppResult<T>) -> Self {
        let liveness = match &result {
            Ok(_) => Liveness::Reusable,
            Err(err) => Liveness::of_error(err),
        };
        Outcome { result, liveness }
    }
}

/// A pooled connection. Owned by the pool while idle, by exactly one caller while in use.
///
/// Every I/O method returns an [`Outcome`]; the caller hands its `liveness` back to the pool
/// on release.
pub struct PooledConn {
    id: u64,
    stream: BoxedStream,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").field("id", &self.id).finish()
    }
}

impl PooledConn {
    pub fn new(stream: BoxedStream) -> PooledConn {
        PooledConn {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            stream,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Writes all of `data`, giving up at `deadline`.
    pub async fn write_by(&mut self, deadline: Instant, data: &[u8]) -> Outcome<usize> {
        let result = match timeout_at(deadline, async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(data.len()),
            Ok(Err(e)) => Err(AppError::IoError(e)),
            Err(_) => Err(AppError::Timeout),
        };
        Outcome::from_result(result)
    }

    /// Reads whatever the peer sent next into `buf`, giving up at `deadline`.
    ///
    /// A peer that closed the connection yields `Ok(0)` for a non-empty `buf`; such a
    /// connection is reported dead.
    pub async fn read_by(&mut self, deadline: Instant, buf: &mut [u8]) -> Outcome<usize> {
        let result = match timeout_at(deadline, self.stream.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(AppError::IoError(e)),
            Err(_) => Err(AppError::Timeout),
        };
        let mut outcome = Outcome::from_result(result);
        if matches!(outcome.result, Ok(0)) && !buf.is_empty() {
            outcome.liveness = Liveness::Dead;
        }
        outcome
    }
}

pub type DialFuture<'a> = Pin<Box<dyn Future<Output = AppResult<BoxedStream>> + Send + 'a>>;

/// Opens new connections for the pool.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self) -> DialFuture<'_>;

    /// Human readable target, for logs.
    fn target(&self) -> String;
}

/// Dials `remote_addr` over TCP, optionally upgrading to TLS.
pub struct TcpDialer {
    network: Network,
    remote_addr: String,
    dial_timeout: Duration,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl std::fmt::Debug for TcpDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpDialer")
            .field("network", &self.network)
            .field("remote_addr", &self.remote_addr)
            .field("dial_timeout", &self.dial_timeout)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl TcpDialer {
    pub fn new(config: &ClientConfig) -> AppResult<TcpDialer> {
        let network = Network::parse(&config.network)?;
        let tls = match &config.tls {
            Some(tls_config) => {
                let name = match &config.tls_server_name {
                    Some(name) => name.clone(),
                    None => host_of(&config.remote_addr).to_string(),
                };
                let server_name = ServerName::try_from(name.clone()).map_err(|e| {
                    AppError::InvalidValue(format!("tls server name {}: {}", name, e))
                })?;
                Some((TlsConnector::from(tls_config.clone()), server_name))
            }
            None => None,
        };
        Ok(TcpDialer {
            network,
            remote_addr: config.remote_addr.clone(),
            dial_timeout: config.dial_timeout(),
            tls,
        })
    }

    async fn connect(&self) -> AppResult<BoxedStream> {
        let mut last_err = None;
        for addr in lookup_host(&self.remote_addr).await? {
            if !self.network.accepts(&addr) {
                continue;
            }
            match TcpStream::connect(addr).await {
                Ok(socket) => {
                    socket.set_nodelay(true)?;
                    trace!("dialed {} from {:?}", addr, socket.local_addr());
                    return match &self.tls {
                        Some((connector, server_name)) => {
                            let stream = connector.connect(server_name.clone(), socket).await?;
                            Ok(Box::new(stream))
                        }
                        None => Ok(Box::new(socket)),
                    };
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => AppError::IoError(e),
            None => AppError::InvalidValue(format!(
                "no {:?} address found for {}",
                self.network, self.remote_addr
            )),
        })
    }
}

impl Dialer for TcpDialer {
    fn dial(&self) -> DialFuture<'_> {
        Box::pin(async move {
            match timeout(self.dial_timeout, self.connect()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::IoError(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {} timed out", self.remote_addr),
                ))),
            }
        })
    }

    fn target(&self) -> String {
        self.remote_addr.clone()
    }
}

impl<D: Dialer> Dialer for Arc<D> {
    fn dial(&self) -> DialFuture<'_> {
        self.as_ref().dial()
    }

    fn target(&self) -> String {
        self.as_ref().target()
    }
}

/// `"host:port"` -> `"host"`, `"[::1]:80"` -> `"::1"`
fn host_of(addr: &str) -> &str {
    let host = match addr.rfind(':') {
        Some(idx) => &addr[..idx],
        None => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
