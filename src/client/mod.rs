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

//! Client Module Implementation
//!
//! A [`Client`] talks to one remote address through a [`ConnPool`]. Every operation takes an
//! absolute deadline and keeps retrying on fresh connections until it succeeds, the deadline
//! passes, or the pool is closed.
//!
//! # Retry rules
//!
//! - waiting for a connection past the deadline: `Timeout`
//! - pool closed while waiting: `ClosedPool`
//! - write failed with a timeout: returned as is
//! - write failed otherwise: connection discarded, exchange retried
//! - read hit end of stream (peer closed without answering): connection discarded, exchange
//!   retried
//! - any other read outcome: returned as is

pub use conn::{DialFuture, Dialer, Liveness, Outcome, PooledConn, TcpDialer};
pub use pool::{ConnPool, POLL_INTERVAL};

mod conn;
mod pool;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::network::{is_end_of_stream, PacketCodec};
use crate::service::ClientConfig;
use crate::{AppError, AppResult};

/// Largest response `ping` reads.
pub const PING_RESP_MAX_SIZE: usize = 1024;
/// Pause between two attempts of the same operation.
pub const RETRY_PAUSE: Duration = Duration::from_millis(5);

/// A handle to one remote address. Clones share the same pool.
///
/// Call [`Client::close`] when done: it stops the pool's background dialer at once and fails
/// pending operations with `ClosedPool`. Dropping every clone without closing also stops the
/// dialer and closes idle connections, but only once it wakes up, within a poll interval.
#[derive(Debug, Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    codec: Arc<dyn PacketCodec>,
    pool: Arc<ConnPool>,
}

impl Client {
    /// Validates `config`, fills in defaults and starts the connection pool.
    ///
    /// Must be called within a tokio runtime. Connections are dialed in the background; this
    /// returns before any of them is established.
    pub fn connect(mut config: ClientConfig) -> AppResult<Client> {
        config.validate()?;
        let dialer = TcpDialer::new(&config)?;
        Self::connect_with(config, dialer)
    }

    /// Like [`Client::connect`] but opens connections through a custom [`Dialer`].
    pub fn connect_with<D: Dialer>(mut config: ClientConfig, dialer: D) -> AppResult<Client> {
        config.validate()?;
        let codec = config.codec();
        let pool = ConnPool::start(dialer, config.pool_size());
        debug!(
            "client connecting to {} with {} connections",
            config.remote_addr,
            pool.max_size()
        );
        Ok(Client {
            config: Arc::new(config),
            codec,
            pool,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnPool {
        &self.pool
    }

    /// Wraps `data` into a packet and writes it to the server.
    pub async fn write(&self, deadline: Instant, data: &[u8]) -> AppResult<usize> {
        let packet = self.codec.wrap(data)?;
        self.write_raw(deadline, &packet).await
    }

    /// Writes `packet` as is, retrying on fresh connections until `deadline`.
    pub async fn write_raw(&self, deadline: Instant, packet: &[u8]) -> AppResult<usize> {
        loop {
            let mut conn = self.acquire_by(deadline).await?;
            let written = conn.write_by(deadline, packet).await;
            let conn_id = conn.id();
            self.pool.release(conn, written.liveness);
            match written.result {
                Err(err) if !err.is_timeout() => {
                    debug!("write on connection {} failed: {}; retrying", conn_id, err);
                    self.pause_before_retry(deadline).await;
                }
                result => return result,
            }
        }
    }

    /// Wraps `data` into a packet, writes it and reads the response into `buf`.
    pub async fn write_read(
        &self,
        deadline: Instant,
        data: &[u8],
        buf: &mut [u8],
    ) -> AppResult<usize> {
        let packet = self.codec.wrap(data)?;
        self.write_read_raw(deadline, &packet, buf).await
    }

    /// Writes `packet` as is and reads one response into `buf` on the same connection,
    /// retrying on fresh connections until `deadline`.
    ///
    /// Returns the number of bytes read. Responses are not framed: this is whatever a single
    /// read returns.
    pub async fn write_read_raw(
        &self,
        deadline: Instant,
        packet: &[u8],
        buf: &mut [u8],
    ) -> AppResult<usize> {
        loop {
            let mut conn = self.acquire_by(deadline).await?;
            let conn_id = conn.id();

            let written = conn.write_by(deadline, packet).await;
            if let Err(err) = written.result {
                self.pool.release(conn, written.liveness);
                if err.is_timeout() {
                    return Err(err);
                }
                debug!("write on connection {} failed: {}; retrying", conn_id, err);
                self.pause_before_retry(deadline).await;
                continue;
            }

            let read = conn.read_by(deadline, buf).await;
            self.pool.release(conn, read.liveness);
            let peer_gone = match &read.result {
                Ok(0) => !buf.is_empty(),
                Err(AppError::IoError(err)) => is_end_of_stream(err),
                _ => false,
            };
            if !peer_gone {
                return read.result;
            }
            debug!("connection {} closed by peer before responding; retrying", conn_id);
            self.pause_before_retry(deadline).await;
        }
    }

    /// Probes the server forever: one `write_read` per `interval`, each bounded by `timeout`.
    ///
    /// Failures are logged with the number of consecutive failures so far; a success resets
    /// the count. `max_retry` does not stop the loop, it only raises the log level once the
    /// count goes past it. Returns when the client is closed.
    pub async fn ping(
        &self,
        data: &[u8],
        max_retry: u32,
        interval: Duration,
        timeout: Duration,
    ) -> AppResult<()> {
        let packet = self.codec.wrap(data)?;
        self.ping_raw(&packet, max_retry, interval, timeout).await
    }

    pub async fn ping_raw(
        &self,
        packet: &[u8],
        max_retry: u32,
        interval: Duration,
        timeout: Duration,
    ) -> AppResult<()> {
        let mut buf = vec![0u8; PING_RESP_MAX_SIZE];
        let mut retry: u32 = 0;
        loop {
            match self
                .write_read_raw(Instant::now() + timeout, packet, &mut buf)
                .await
            {
                Ok(_) => retry = 0,
                Err(AppError::ClosedPool) => {
                    debug!("ping to {} stopped: client closed", self.config.remote_addr);
                    return Ok(());
                }
                Err(err) if retry >= max_retry => {
                    error!("ping {} error: {}; retry={}", self.config.remote_addr, err, retry);
                    retry = retry.saturating_add(1);
                }
                Err(err) => {
                    warn!("ping {} error: {}; retry={}", self.config.remote_addr, err, retry);
                    retry += 1;
                }
            }
            sleep(interval).await;
        }
    }

    /// Closes the pool. Pending and future operations fail with `ClosedPool`.
    pub fn close(&self) {
        self.pool.close();
    }

    async fn acquire_by(&self, deadline: Instant) -> AppResult<PooledConn> {
        if Instant::now() >= deadline {
            return Err(AppError::Timeout);
        }
        match timeout_at(deadline, self.pool.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout),
        }
    }

    async fn pause_before_retry(&self, deadline: Instant) {
        sleep_until((Instant::now() + RETRY_PAUSE).min(deadline)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::network::{BoxedStream, LengthValueCodec};

    /// How the far end of the next dialed connection behaves.
    #[derive(Debug, Clone, Copy)]
    enum Peer {
        /// answers every frame with "echo:" + payload
        Echo,
        /// already gone: writes fail with a broken pipe
        Broken,
        /// reads one frame, then hangs up without answering
        HangUp,
        /// never reads, never answers
        Silent,
    }

    #[derive(Default)]
    struct ScriptedDialer {
        script: parking_lot::Mutex<VecDeque<Peer>>,
        dials: AtomicUsize,
        silent: parking_lot::Mutex<Vec<DuplexStream>>,
    }

    impl ScriptedDialer {
        fn new(script: &[Peer]) -> Arc<Self> {
            Arc::new(ScriptedDialer {
                script: parking_lot::Mutex::new(script.iter().copied().collect()),
                ..Default::default()
            })
        }

        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    async fn serve_peer(mut remote: DuplexStream, hang_up: bool) {
        let codec = LengthValueCodec::default();
        let mut buffer = BytesMut::new();
        loop {
            while let Ok(Some(frame_len)) = codec.split(&buffer, false) {
                let frame = buffer.split_to(frame_len).freeze();
                if hang_up {
                    return;
                }
                let mut response = b"echo:".to_vec();
                response.extend_from_slice(&codec.unwrap(frame));
                if remote.write_all(&response).await.is_err() {
                    return;
                }
            }
            match remote.read_buf(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    impl Dialer for ScriptedDialer {
        fn dial(&self) -> DialFuture<'_> {
            Box::pin(async move {
                self.dials.fetch_add(1, Ordering::SeqCst);
                let peer = self.script.lock().pop_front().unwrap_or(Peer::Echo);
                // a silent peer gets a tiny buffer so writes to it block
                let capacity = if matches!(peer, Peer::Silent) { 8 } else { 1024 };
                let (local, remote) = tokio::io::duplex(capacity);
                match peer {
                    Peer::Echo => {
                        tokio::spawn(serve_peer(remote, false));
                    }
                    Peer::HangUp => {
                        tokio::spawn(serve_peer(remote, true));
                    }
                    Peer::Broken => drop(remote),
                    Peer::Silent => self.silent.lock().push(remote),
                }
                let stream: BoxedStream = Box::new(local);
                Ok(stream)
            })
        }

        fn target(&self) -> String {
            "scripted".to_string()
        }
    }

    fn client(dialer: Arc<ScriptedDialer>, pool_size: i32) -> Client {
        let config = ClientConfig::new("scripted:0").with_max_conn_count(pool_size);
        Client::connect_with(config, dialer).unwrap()
    }

    fn after(millis: u64) -> Instant {
        Instant::now() + Duration::from_millis(millis)
    }

    #[tokio::test]
    async fn test_write_read_echo() -> AppResult<()> {
        let client = client(ScriptedDialer::new(&[]), 1);
        let mut buf = [0u8; 64];
        let n = client.write_read(after(1000), b"hi", &mut buf).await?;
        assert_eq!(&buf[..n], b"echo:hi");
        client.close();
        Ok(())
    }

    #[tokio::test]
    async fn test_write_retried_on_broken_connection() -> AppResult<()> {
        let dialer = ScriptedDialer::new(&[Peer::Broken]);
        let client = client(dialer.clone(), 1);
        let n = client.write(after(1000), b"hello").await?;
        assert_eq!(n, 6 + 5);
        assert_eq!(dialer.dials(), 2);
        client.close();
        Ok(())
    }

    #[tokio::test]
    async fn test_write_timeout_not_retried() {
        let dialer = ScriptedDialer::new(&[Peer::Silent]);
        let client = client(dialer.clone(), 1);
        // wait for the pool so the deadline only covers the write
        let conn = client.pool().acquire().await.unwrap();
        client.pool().release(conn, Liveness::Reusable);

        let started = Instant::now();
        let result = client.write(after(100), &[0u8; 256]).await;
        assert!(matches!(result, Err(AppError::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(dialer.dials(), 1);
        client.close();
    }

    #[tokio::test]
    async fn test_write_read_retried_when_peer_hangs_up() -> AppResult<()> {
        let dialer = ScriptedDialer::new(&[Peer::HangUp]);
        let client = client(dialer.clone(), 1);
        let mut buf = [0u8; 64];
        let n = client.write_read(after(2000), b"again", &mut buf).await?;
        assert_eq!(&buf[..n], b"echo:again");
        assert_eq!(dialer.dials(), 2);
        client.close();
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_waiting_for_connection() {
        let dialer = ScriptedDialer::new(&[Peer::Echo]);
        let client = client(dialer, 1);
        let held = client.pool().acquire().await.unwrap();
        let mut buf = [0u8; 16];
        let result = client.write_read(after(50), b"x", &mut buf).await;
        assert!(matches!(result, Err(AppError::Timeout)));
        client.pool().release(held, Liveness::Reusable);
        client.close();
    }

    #[tokio::test]
    async fn test_closed_client() {
        let client = client(ScriptedDialer::new(&[]), 2);
        client.close();
        assert!(matches!(
            client.write(after(1000), b"late").await,
            Err(AppError::ClosedPool)
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_not_sent() {
        let dialer = ScriptedDialer::new(&[]);
        let client = client(dialer, 1);
        let payload = vec![0u8; 70_000];
        assert!(matches!(
            client.write(after(1000), &payload).await,
            Err(AppError::MessageTooLarge(70_000))
        ));
        client.close();
    }

    #[tokio::test]
    async fn test_ping_stops_when_closed() {
        let dialer = ScriptedDialer::new(&[Peer::HangUp, Peer::Broken]);
        let client = client(dialer.clone(), 1);
        let pinger = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .ping(b"ping", 2, Duration::from_millis(10), Duration::from_millis(200))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dialer.dials() >= 3);
        client.close();
        let result = tokio::time::timeout(Duration::from_secs(1), pinger)
            .await
            .expect("ping loop did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
