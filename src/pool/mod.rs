mod upstream;

pub use upstream::{ConnectError, Upstream};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use smol::lock::{Mutex, MutexGuardArc};

pub const IDLE_TTL: Duration = Duration::from_secs(30);

/// Shared pool of upstream sockets, one per `"{host}:{port}"` origin.
///
/// The map mutex is held only for O(1) bookkeeping, never across network
/// IO. Serialized reuse comes from the per-entry socket mutex, which a
/// worker holds for the whole request/response cycle. The lock order rule:
/// never block on an entry lock while holding the map lock.
pub struct ConnPool {
    records: Mutex<HashMap<String, Arc<PoolEntry>>>,
}

pub struct PoolEntry {
    key: String,
    socket: Arc<Mutex<Upstream>>,
    last_access: std::sync::Mutex<Instant>,
    bytes: AtomicU64,
    closed: AtomicBool,
}

impl PoolEntry {
    fn new(key: String, socket: Upstream) -> Self {
        log::debug!("pool: opening connection to {key}");
        Self {
            key,
            socket: Arc::new(Mutex::new(socket)),
            last_access: std::sync::Mutex::new(Instant::now()),
            bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.last_access.lock().expect("last_access lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access
            .lock()
            .expect("last_access lock poisoned")
            .elapsed()
    }

    /// Flushes the byte counter to stdout, at most once per accumulation.
    fn emit(&self) -> Option<(String, u64)> {
        let bytes = self.bytes.swap(0, Ordering::AcqRel);
        if bytes == 0 {
            return None;
        }
        println!("{}, {}", self.key, bytes);
        Some((self.key.clone(), bytes))
    }
}

/// Exclusive hold on a pooled socket. Dropping the lease releases the
/// entry's exclusion lock; while it lives, eviction cannot touch the entry.
pub struct Lease {
    entry: Arc<PoolEntry>,
    guard: MutexGuardArc<Upstream>,
}

impl Lease {
    pub fn socket(&mut self) -> &mut Upstream {
        &mut self.guard
    }

    pub fn key(&self) -> &str {
        &self.entry.key
    }

    #[cfg(test)]
    pub(crate) fn entry(&self) -> &Arc<PoolEntry> {
        &self.entry
    }
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnPool {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn origin_key(host: &str, port: u16) -> String {
        format!("{host}:{port}")
    }

    /// Returns the origin's pooled socket, connecting on a miss. Blocks
    /// until no other worker holds the entry; an entry that was closed while
    /// we waited restarts the lookup, so acquisition stays the authoritative
    /// liveness check.
    pub async fn acquire(&self, host: &str, port: u16) -> Result<Lease, ConnectError> {
        let key = Self::origin_key(host, port);
        loop {
            let existing = self.records.lock().await.get(&key).cloned();
            let Some(entry) = existing else {
                let socket = Upstream::connect(host, port).await?;
                let entry = Arc::new(PoolEntry::new(key.clone(), socket));
                let Some(guard) = entry.socket.try_lock_arc() else {
                    continue;
                };
                let mut records = self.records.lock().await;
                if records.contains_key(&key) {
                    // another worker connected first; retry against its entry
                    continue;
                }
                records.insert(key.clone(), entry.clone());
                drop(records);
                return Ok(Lease { entry, guard });
            };

            let guard = entry.socket.lock_arc().await;
            if entry.closed.load(Ordering::Acquire) {
                continue;
            }
            entry.touch();
            return Ok(Lease { entry, guard });
        }
    }

    /// Hands the socket back for reuse, charging `bytes` to the entry.
    pub fn release(&self, lease: Lease, bytes: u64) {
        lease.entry.bytes.fetch_add(bytes, Ordering::Relaxed);
        lease.entry.touch();
    }

    /// Replaces a broken pooled socket in place. The caller keeps holding
    /// the exclusion lock throughout, so no other worker can observe the
    /// swap.
    pub async fn reset(
        &self,
        lease: &mut Lease,
        host: &str,
        port: u16,
    ) -> Result<(), ConnectError> {
        let fresh = Upstream::connect(host, port).await?;
        let old = std::mem::replace(&mut *lease.guard, fresh);
        old.shutdown();
        log::debug!("pool: reset connection to {}", lease.entry.key);
        Ok(())
    }

    /// Retires the leased entry: removes it from the map, flushes its byte
    /// counter, closes the socket.
    pub async fn close(&self, lease: Lease, bytes: u64) -> Option<(String, u64)> {
        let Lease { entry, guard } = lease;
        {
            let mut records = self.records.lock().await;
            if records
                .get(&entry.key)
                .is_some_and(|current| Arc::ptr_eq(current, &entry))
            {
                records.remove(&entry.key);
            }
        }
        entry.closed.store(true, Ordering::Release);
        entry.bytes.fetch_add(bytes, Ordering::Relaxed);
        let emitted = entry.emit();
        guard.shutdown();
        log::debug!("pool: closed connection to {}", entry.key);
        emitted
    }

    pub async fn evict_idle(&self) {
        self.evict_older_than(IDLE_TTL).await;
    }

    /// Retires every entry that is both unheld and idle longer than `ttl`.
    /// The try-lock makes eviction lose every race against a worker that
    /// already holds or is about to hold the entry.
    pub async fn evict_older_than(&self, ttl: Duration) {
        let entries: Vec<Arc<PoolEntry>> =
            self.records.lock().await.values().cloned().collect();

        for entry in entries {
            let Some(guard) = entry.socket.try_lock_arc() else {
                continue;
            };
            if entry.closed.load(Ordering::Acquire) || entry.idle_for() <= ttl {
                continue;
            }
            {
                let mut records = self.records.lock().await;
                if records
                    .get(&entry.key)
                    .is_some_and(|current| Arc::ptr_eq(current, &entry))
                {
                    records.remove(&entry.key);
                }
            }
            entry.closed.store(true, Ordering::Release);
            let _ = entry.emit();
            guard.shutdown();
            log::debug!("pool: evicted idle connection to {}", entry.key);
        }
    }

    /// Shutdown path: empties the map, then takes each entry's lock in turn
    /// (waiting out any straggler), flushes and closes.
    pub async fn drain(&self) -> Vec<(String, u64)> {
        let entries: Vec<Arc<PoolEntry>> = {
            let mut records = self.records.lock().await;
            records.drain().map(|(_, entry)| entry).collect()
        };

        let mut emitted = Vec::new();
        for entry in entries {
            let guard = entry.socket.lock_arc().await;
            entry.closed.store(true, Ordering::Release);
            if let Some(line) = entry.emit() {
                emitted.push(line);
            }
            guard.shutdown();
        }
        emitted
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::future;
    use smol::net::TcpListener;

    async fn stub_listener() -> (TcpListener, String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, "127.0.0.1".to_string(), port)
    }

    #[test]
    fn test_acquire_miss_then_reuse() {
        smol::block_on(async {
            let (_listener, host, port) = stub_listener().await;
            let pool = ConnPool::new();

            let lease = pool.acquire(&host, port).await.unwrap();
            assert_eq!(lease.key(), format!("{host}:{port}"));
            assert_eq!(pool.len().await, 1);
            let first = lease.entry().clone();
            pool.release(lease, 5);

            let lease = pool.acquire(&host, port).await.unwrap();
            assert!(Arc::ptr_eq(lease.entry(), &first));
            assert_eq!(pool.len().await, 1);
            pool.release(lease, 0);
        });
    }

    #[test]
    fn test_acquire_serializes_per_origin() {
        smol::block_on(async {
            let (_listener, host, port) = stub_listener().await;
            let pool = ConnPool::new();

            let lease = pool.acquire(&host, port).await.unwrap();
            // second acquire must block while the lease is held
            assert!(future::poll_once(pool.acquire(&host, port)).await.is_none());

            pool.release(lease, 0);
            let lease = pool.acquire(&host, port).await.unwrap();
            pool.release(lease, 0);
        });
    }

    #[test]
    fn test_close_emits_accumulated_bytes() {
        smol::block_on(async {
            let (_listener, host, port) = stub_listener().await;
            let pool = ConnPool::new();

            let lease = pool.acquire(&host, port).await.unwrap();
            pool.release(lease, 5);
            let lease = pool.acquire(&host, port).await.unwrap();
            let emitted = pool.close(lease, 3).await;

            assert_eq!(emitted, Some((format!("{host}:{port}"), 8)));
            assert_eq!(pool.len().await, 0);
        });
    }

    #[test]
    fn test_close_without_bytes_is_silent() {
        smol::block_on(async {
            let (_listener, host, port) = stub_listener().await;
            let pool = ConnPool::new();
            let lease = pool.acquire(&host, port).await.unwrap();
            assert_eq!(pool.close(lease, 0).await, None);
        });
    }

    #[test]
    fn test_eviction_skips_held_entries() {
        smol::block_on(async {
            let (_listener, host, port) = stub_listener().await;
            let pool = ConnPool::new();

            let lease = pool.acquire(&host, port).await.unwrap();
            pool.evict_older_than(Duration::ZERO).await;
            assert_eq!(pool.len().await, 1, "held entry must survive eviction");

            pool.release(lease, 0);
            pool.evict_older_than(Duration::ZERO).await;
            assert_eq!(pool.len().await, 0);

            // a fresh entry is not idle yet at the real TTL
            let lease = pool.acquire(&host, port).await.unwrap();
            pool.release(lease, 0);
            pool.evict_idle().await;
            assert_eq!(pool.len().await, 1);
        });
    }

    #[test]
    fn test_drain_empties_pool() {
        smol::block_on(async {
            let (_listener_a, host_a, port_a) = stub_listener().await;
            let (_listener_b, host_b, port_b) = stub_listener().await;
            let pool = ConnPool::new();

            let lease = pool.acquire(&host_a, port_a).await.unwrap();
            pool.release(lease, 7);
            let lease = pool.acquire(&host_b, port_b).await.unwrap();
            pool.release(lease, 0);

            let emitted = pool.drain().await;
            assert_eq!(emitted, vec![(format!("{host_a}:{port_a}"), 7)]);
            assert_eq!(pool.len().await, 0);
        });
    }

    #[test]
    fn test_reset_replaces_socket_under_held_lease() {
        smol::block_on(async {
            use smol::io::{AsyncReadExt, AsyncWriteExt};

            let (listener, host, port) = stub_listener().await;
            let pool = ConnPool::new();
            let mut lease = pool.acquire(&host, port).await.unwrap();
            let (mut first_conn, _) = listener.accept().await.unwrap();

            pool.reset(&mut lease, &host, port).await.unwrap();
            let (mut second_conn, _) = listener.accept().await.unwrap();

            lease.socket().write_all(b"ping").await.unwrap();
            lease.socket().flush().await.unwrap();
            let mut buf = [0u8; 4];
            second_conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");

            let mut probe = [0u8; 1];
            let n = first_conn.read(&mut probe).await.unwrap();
            assert_eq!(n, 0, "old socket should be shut down");

            pool.release(lease, 0);
        });
    }

    #[test]
    fn test_resolve_failure() {
        smol::block_on(async {
            let pool = ConnPool::new();
            match pool.acquire("does.not.resolve.invalid", 80).await {
                Err(ConnectError::Resolve(_)) => {}
                other => panic!("expected resolve failure, got {:?}", other.is_ok()),
            }
        });
    }
}
