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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::conn::{Dialer, Liveness, PooledConn};
use crate::utils::Backoff;
use crate::{AppError, AppResult, Shutdown};

/// How long the refill task sleeps once the pool is full before checking again.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A bounded, self-healing pool of connections to one remote address.
///
/// Idle connections sit in a bounded channel of capacity `max_size`. A background task keeps
/// dialing until `live_count` reaches `max_size`, backing off on failures. Callers take a
/// connection with `acquire`, which waits while every live connection is checked out, and
/// hand it back with `release`.
///
/// `live_count` counts idle and checked out connections. It is incremented before a new
/// connection is published and decremented after a connection is dropped, so it never
/// exceeds `max_size` and never underflows.
#[derive(Debug)]
pub struct ConnPool {
    max_size: usize,
    live_count: AtomicUsize,
    idle_tx: async_channel::Sender<PooledConn>,
    idle_rx: async_channel::Receiver<PooledConn>,
    shutdown: Shutdown,
    // woken when a connection is discarded, so the refill task does not wait a full poll
    refill: Notify,
}

impl ConnPool {
    /// Creates the pool and spawns its refill task on the current tokio runtime.
    pub fn start<D: Dialer>(dialer: D, max_size: usize) -> Arc<ConnPool> {
        let max_size = max_size.max(1);
        let (idle_tx, idle_rx) = async_channel::bounded(max_size);
        let pool = Arc::new(ConnPool {
            max_size,
            live_count: AtomicUsize::new(0),
            idle_tx,
            idle_rx,
            shutdown: Shutdown::new(),
            refill: Notify::new(),
        });
        tokio::spawn(Self::refill_loop(Arc::downgrade(&pool), dialer));
        pool
    }

    /// Dials until the pool is full, then naps; repeats until the pool closes or is dropped.
    ///
    /// Level triggered: connections may disappear at any time through `release`, the loop
    /// only ever compares `live_count` with `max_size`. The loop holds the pool only for one
    /// round, so dropping every handle without `close` still stops it within a poll interval.
    async fn refill_loop<D: Dialer>(weak_pool: Weak<ConnPool>, dialer: D) {
        let target = dialer.target();
        let mut backoff = Backoff::default();
        debug!("connection pool for {} started", target);

        'refill: loop {
            let Some(pool) = weak_pool.upgrade() else {
                debug!("connection pool for {} dropped", target);
                break 'refill;
            };
            if pool.shutdown.is_shutdown() {
                break 'refill;
            }

            if pool.live_count() < pool.max_size {
                let dialed = tokio::select! {
                    _ = pool.shutdown.recv() => break 'refill,
                    dialed = dialer.dial() => dialed,
                };
                match dialed {
                    Ok(stream) => {
                        backoff.reset();
                        let conn = PooledConn::new(stream);
                        trace!("dialed connection {} to {}", conn.id(), target);
                        pool.live_count.fetch_add(1, Ordering::AcqRel);
                        if pool.idle_tx.try_send(conn).is_err() {
                            // closed while dialing
                            pool.live_count.fetch_sub(1, Ordering::AcqRel);
                            break 'refill;
                        }
                    }
                    Err(err) => {
                        let delay = backoff.next_delay();
                        warn!(
                            "dial {} error: {}; retrying in {:?}",
                            target, err, delay
                        );
                        tokio::select! {
                            _ = pool.shutdown.recv() => break 'refill,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                _ = pool.shutdown.recv() => break 'refill,
                _ = pool.refill.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
        debug!("connection pool for {} stopped refilling", target);
    }

    /// Waits for an idle connection.
    ///
    /// Returns `ClosedPool` once the pool is closed. Never times out on its own; callers
    /// bound it with their deadline.
    pub async fn acquire(&self) -> AppResult<PooledConn> {
        let conn = tokio::select! {
            biased;
            _ = self.shutdown.recv() => return Err(AppError::ClosedPool),
            conn = self.idle_rx.recv() => conn.map_err(|_| AppError::ClosedPool)?,
        };
        if self.shutdown.is_shutdown() {
            self.discard(conn);
            return Err(AppError::ClosedPool);
        }
        Ok(conn)
    }

    /// Hands a connection back. Dead connections, and any connection once the pool is
    /// closed, are closed and stop counting towards `live_count`.
    pub fn release(&self, conn: PooledConn, liveness: Liveness) {
        if liveness == Liveness::Dead || self.shutdown.is_shutdown() {
            trace!("discarding connection {} ({:?})", conn.id(), liveness);
            self.discard(conn);
            return;
        }
        if let Err(err) = self.idle_tx.try_send(conn) {
            self.discard(err.into_inner());
        }
    }

    fn discard(&self, conn: PooledConn) {
        drop(conn);
        self.live_count.fetch_sub(1, Ordering::AcqRel);
        self.refill.notify_one();
    }

    /// Stops refilling, wakes every waiting `acquire` with `ClosedPool` and closes all idle
    /// connections. Connections still checked out are closed when released.
    ///
    /// Calling it again is a no-op.
    pub fn close(&self) {
        if self.shutdown.is_shutdown() {
            return;
        }
        self.shutdown.trigger();
        self.idle_tx.close();
        let mut drained = 0;
        while let Ok(conn) = self.idle_rx.try_recv() {
            drop(conn);
            self.live_count.fetch_sub(1, Ordering::AcqRel);
            drained += 1;
        }
        debug!("connection pool closed, {} idle connections closed", drained);
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    pub fn live_count(&self) -> usize {
        self.live_count.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle_rx.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Drop for ConnPool {
    fn drop(&mut self) {
        debug!("connection pool dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::{timeout, Instant};

    use super::*;
    use crate::client::conn::DialFuture;
    use crate::network::BoxedStream;

    /// Hands out in-memory streams and keeps their far ends, so tests can break them.
    #[derive(Default)]
    struct MockDialer {
        dials: AtomicUsize,
        failing: AtomicBool,
        peers: parking_lot::Mutex<Vec<DuplexStream>>,
    }

    impl Dialer for MockDialer {
        fn dial(&self) -> DialFuture<'_> {
            Box::pin(async move {
                self.dials.fetch_add(1, Ordering::SeqCst);
                if self.failing.load(Ordering::SeqCst) {
                    return Err(AppError::IoError(std::io::Error::from(
                        std::io::ErrorKind::ConnectionRefused,
                    )));
                }
                let (local, remote) = tokio::io::duplex(1024);
                self.peers.lock().push(remote);
                let stream: BoxedStream = Box::new(local);
                Ok(stream)
            })
        }

        fn target(&self) -> String {
            "mock".to_string()
        }
    }

    async fn wait_for_live(pool: &ConnPool, count: usize) {
        timeout(Duration::from_secs(3), async {
            while pool.live_count() != count || pool.idle_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool did not fill up");
    }

    #[tokio::test]
    async fn test_fills_to_max_size() {
        let dialer = Arc::new(MockDialer::default());
        let pool = ConnPool::start(dialer.clone(), 3);
        wait_for_live(&pool, 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 3);
        pool.close();
    }

    #[tokio::test]
    async fn test_never_exceeds_max_size() {
        let pool = ConnPool::start(MockDialer::default(), 2);
        wait_for_live(&pool, 2).await;
        let checked_out = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let checked_out = checked_out.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let conn = pool.acquire().await.unwrap();
                    let now = checked_out.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    assert!(pool.live_count() <= 2);
                    tokio::task::yield_now().await;
                    checked_out.fetch_sub(1, Ordering::SeqCst);
                    pool.release(conn, Liveness::Reusable);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.live_count(), 2);
        pool.close();
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_connection_replaced() {
        let dialer = Arc::new(MockDialer::default());
        let pool = ConnPool::start(dialer.clone(), 1);
        wait_for_live(&pool, 1).await;

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, Liveness::Dead);
        assert_eq!(pool.live_count(), 0);

        // woken by the discard, not by the poll interval
        let conn = timeout(Duration::from_millis(500), pool.acquire())
            .await
            .expect("no replacement connection")
            .unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        pool.release(conn, Liveness::Reusable);
        pool.close();
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_acquire() {
        let pool = ConnPool::start(MockDialer::default(), 1);
        wait_for_live(&pool, 1).await;
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.close();
        let result = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire still blocked after close")
            .unwrap();
        assert!(matches!(result, Err(AppError::ClosedPool)));

        // released after close: closed rather than pooled
        pool.release(held, Liveness::Reusable);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count(), 0);

        // second close is harmless
        pool.close();
        assert!(matches!(pool.acquire().await, Err(AppError::ClosedPool)));
    }

    #[tokio::test]
    async fn test_dial_failures_back_off_and_recover() {
        let dialer = Arc::new(MockDialer::default());
        dialer.failing.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let pool = ConnPool::start(dialer.clone(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // 5 + 10 + 20 + 40 + 80 ms of backoff fit in 200ms, so only a handful of attempts
        let attempts = dialer.dials.load(Ordering::SeqCst);
        assert!((2..=7).contains(&attempts), "attempts: {}", attempts);
        assert_eq!(pool.live_count(), 0);

        dialer.failing.store(false, Ordering::SeqCst);
        wait_for_live(&pool, 1).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        pool.close();
    }

    #[tokio::test]
    async fn test_dropped_pool_stops_refilling() {
        let dialer = Arc::new(MockDialer::default());
        let pool = ConnPool::start(dialer.clone(), 2);
        wait_for_live(&pool, 2).await;
        drop(pool);

        // the refill task owns the only other dialer handle
        timeout(POLL_INTERVAL * 3, async {
            while Arc::strong_count(&dialer) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("refill task still running after the pool was dropped");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);

        // idle connections went away with the pool
        let mut peers = std::mem::take(&mut *dialer.peers.lock());
        for peer in peers.iter_mut() {
            let mut buf = [0u8; 4];
            assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_heals_after_connections_break() {
        let dialer = Arc::new(MockDialer::default());
        let pool = ConnPool::start(dialer.clone(), 3);
        wait_for_live(&pool, 3).await;

        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(pool.acquire().await.unwrap());
        }
        // break every connection from the far side
        dialer.peers.lock().clear();
        for mut conn in conns {
            let mut buf = [0u8; 8];
            let outcome = conn
                .read_by(Instant::now() + Duration::from_secs(1), &mut buf)
                .await;
            pool.release(conn, outcome.liveness);
        }

        wait_for_live(&pool, 3).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 6);
        pool.close();
    }
}
