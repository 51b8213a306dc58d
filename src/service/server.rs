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

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::network::{is_temporary, BoxedStream, Connection, Packet, PacketCodec, ResponseWriter};
use crate::utils::Backoff;
use crate::{AppError, AppResult};

use super::{Network, ServerConfig, Shutdown};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Serves packets.
///
/// Invoked once per packet, in arrival order, and awaited before the next packet of the same
/// connection is read. `writer` is the connection the packet came in on; whatever the handler
/// writes to it goes straight back to the peer. Transport errors are never reported to the
/// handler: it simply stops being called for a broken connection. A handler still running
/// when the server closes is dropped along with its connection.
pub trait Handler: Send + Sync + 'static {
    fn serve_tcp<'a>(&'a self, writer: &'a mut ResponseWriter, packet: Packet)
        -> HandlerFuture<'a>;
}

/// A [`Handler`] made from a closure, see [`handler_fn`].
pub struct HandlerFn<F>(F);

impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut ResponseWriter, Packet) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    fn serve_tcp<'a>(
        &'a self,
        writer: &'a mut ResponseWriter,
        packet: Packet,
    ) -> HandlerFuture<'a> {
        (self.0)(writer, packet)
    }
}

/// ```ignore
/// let echo = handler_fn(|writer, packet| {
///     Box::pin(async move {
///         let _ = writer.reply(&packet.data).await;
///     })
/// });
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(&'a mut ResponseWriter, Packet) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    HandlerFn(f)
}

#[derive(Debug)]
struct TrackedConnection {
    remote_addr: String,
    shutdown: Shutdown,
}

/// Accepts connections and dispatches their packets to a [`Handler`].
///
/// `listen` binds the address; `listen_and_serve` binds if needed and then accepts until the
/// listener fails for good or `close` is called. Every accepted connection gets its own task,
/// so a slow handler only stalls its own connection.
pub struct Server<H: Handler> {
    addr: String,
    network: Network,
    handler: Arc<H>,
    codec: Arc<dyn PacketCodec>,
    tls: Option<TlsAcceptor>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    shutdown: Shutdown,
    connections: Arc<Mutex<HashMap<u64, TrackedConnection>>>,
}

impl<H: Handler> std::fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("network", &self.network)
            .field("tls", &self.tls.is_some())
            .field("codec", &self.codec)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl<H: Handler> Server<H> {
    pub fn new(mut config: ServerConfig, handler: H) -> AppResult<Server<H>> {
        config.validate()?;
        Ok(Server {
            network: Network::parse(&config.network)?,
            codec: config.codec(),
            tls: config.tls.clone().map(TlsAcceptor::from),
            addr: config.addr,
            handler: Arc::new(handler),
            listener: Mutex::new(None),
            shutdown: Shutdown::new(),
            connections: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Binds the listen address and returns the bound socket address.
    ///
    /// Calling it on a listening server returns the existing address; on a closed one it
    /// fails with `ServerClosed`.
    pub async fn listen(&self) -> AppResult<SocketAddr> {
        if self.shutdown.is_shutdown() {
            return Err(AppError::ServerClosed);
        }
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener = self.bind().await?;
        let local_addr = listener.local_addr()?;
        info!(
            "tcp server binding to {} for listening{}",
            local_addr,
            if self.tls.is_some() { " (tls)" } else { "" }
        );
        *self.listener.lock() = Some(Arc::new(listener));
        Ok(local_addr)
    }

    async fn bind(&self) -> AppResult<TcpListener> {
        let mut last_err = None;
        for addr in lookup_host(&self.addr).await? {
            if !self.network.accepts(&addr) {
                continue;
            }
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) => last_err = Some(e),
            }
        }
        let error_msg = match last_err {
            Some(e) => format!("Failed to bind server to address: {} - Error: {}", self.addr, e),
            None => format!("no {:?} address found for {}", self.network, self.addr),
        };
        error!("{}", error_msg);
        Err(AppError::IllegalStateError(error_msg))
    }

    /// Accepts connections until `close` is called (`ServerClosed`) or the listener fails
    /// with a non-temporary error, which is returned.
    ///
    /// Temporary accept errors back off from 5ms up to 1s.
    pub async fn listen_and_serve(&self) -> AppResult<()> {
        if self.current_listener().is_none() {
            self.listen().await?;
        }
        let listener = self.current_listener().ok_or(AppError::ServerClosed)?;
        let mut backoff = Backoff::default();

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.recv() => return Err(AppError::ServerClosed),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, _)) => {
                    backoff.reset();
                    if let Err(err) = self.spawn_connection(socket) {
                        warn!("failed to set up accepted connection: {}", err);
                    }
                }
                Err(err) if is_temporary(&err) => {
                    let delay = backoff.next_delay();
                    warn!("accept error: {}; retrying in {:?}", err, delay);
                    tokio::select! {
                        _ = self.shutdown.recv() => return Err(AppError::ServerClosed),
                        _ = time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    error!("accept error: {}", err);
                    return Err(AppError::Accept(err.to_string()));
                }
            }
        }
    }

    fn spawn_connection(&self, socket: TcpStream) -> AppResult<()> {
        let local_addr = socket.local_addr()?.to_string();
        let remote_addr = socket.peer_addr()?.to_string();
        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        // born fired if `close` already ran
        let shutdown = self.shutdown.child();
        self.connections.lock().insert(
            connection_id,
            TrackedConnection {
                remote_addr: remote_addr.clone(),
                shutdown: shutdown.clone(),
            },
        );
        debug!("new connection {}->{}", remote_addr, local_addr);

        let dispatcher = Dispatcher {
            handler: self.handler.clone(),
            codec: self.codec.clone(),
            shutdown,
            local_addr,
            remote_addr,
        };
        let tls = self.tls.clone();
        let connections = self.connections.clone();
        tokio::spawn(async move {
            let (local_addr, remote_addr) =
                (dispatcher.local_addr.clone(), dispatcher.remote_addr.clone());
            if let Err(err) = dispatcher.run(socket, tls).await {
                if err.is_protocol_error() {
                    warn!("connection {}->{}: {}", remote_addr, local_addr, err);
                } else {
                    debug!("connection {}->{}: {}", remote_addr, local_addr, err);
                }
            }
            connections.lock().remove(&connection_id);
            debug!("closed connection {}->{}", remote_addr, local_addr);
        });
        Ok(())
    }

    /// Stops accepting, releases the listener and closes every tracked connection.
    pub fn close(&self) {
        self.shutdown.trigger();
        let listener = self.listener.lock().take();
        let connections = self.connections.lock();
        for connection in connections.values() {
            debug!("evicting connection from {}", connection.remote_addr);
            connection.shutdown.trigger();
        }
        info!(
            "tcp server {} closed, {} connections evicted",
            listener
                .and_then(|l| l.local_addr().ok())
                .map_or_else(|| self.addr.clone(), |a| a.to_string()),
            connections.len()
        );
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_listener().and_then(|l| l.local_addr().ok())
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    fn current_listener(&self) -> Option<Arc<TcpListener>> {
        self.listener.lock().clone()
    }
}

/// Per connection packet dispatch loop.
struct Dispatcher<H: Handler> {
    handler: Arc<H>,
    codec: Arc<dyn PacketCodec>,
    shutdown: Shutdown,
    local_addr: String,
    remote_addr: String,
}

impl<H: Handler> Dispatcher<H> {
    async fn run(self, socket: TcpStream, tls: Option<TlsAcceptor>) -> AppResult<()> {
        let stream: BoxedStream = match tls {
            Some(acceptor) => {
                let handshake = time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(socket));
                let stream = tokio::select! {
                    _ = self.shutdown.recv() => return Ok(()),
                    res = handshake => res.map_err(|_| AppError::Timeout)??,
                };
                Box::new(stream)
            }
            None => Box::new(socket),
        };
        let (reader, writer) = tokio::io::split(stream);
        let mut connection = Connection::new(reader, self.codec.clone());
        let mut writer = ResponseWriter::new(writer);

        loop {
            let maybe_data = tokio::select! {
                res = connection.read_packet() => res?,
                _ = self.shutdown.recv() => {
                    debug!("connection handler exit read loop after recv shutdown signal");
                    return Ok(());
                }
            };
            let data = match maybe_data {
                Some(data) => data,
                // peer closed the connection gracefully
                None => return Ok(()),
            };
            let packet = Packet {
                data,
                local_addr: self.local_addr.clone(),
                remote_addr: self.remote_addr.clone(),
            };
            // eviction drops a running handler together with the connection
            tokio::select! {
                _ = self.handler.serve_tcp(&mut writer, packet) => {}
                _ = self.shutdown.recv() => {
                    debug!("connection handler interrupted by shutdown signal");
                    return Ok(());
                }
            }
        }
    }
}

impl<H: Handler> Drop for Server<H> {
    fn drop(&mut self) {
        self.shutdown.trigger();
        debug!("tcp server dropped");
    }
}
