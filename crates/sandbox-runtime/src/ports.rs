//! Port reservation with cross-process advisory locks
//!
//! Every sandbox on a host draws its ports from the same ranges. A port is
//! claimed by holding an exclusive `flock` on `<lock_dir>/port_<N>.lock` for
//! as long as the owning instance lives. When the lock files cannot be used
//! (or every port in the range is locked) the allocator degrades to a plain
//! bind test, which races with any other process picking the same port.

use std::fs::{File, OpenOptions};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info, warn};

use crate::config::{PortRange, RuntimeConfig};
use crate::error::RuntimeError;
use crate::Result;

const PASS_PAUSE: Duration = Duration::from_millis(50);

/// An exclusive advisory lock on one port's lock file.
pub struct PortLock {
    port: u16,
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl std::fmt::Debug for PortLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLock")
            .field("port", &self.port)
            .field("path", &self.path)
            .field("held", &self.lock.is_some())
            .finish()
    }
}

impl PortLock {
    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(None)` when another holder already has it.
    pub fn try_acquire(lock_dir: &Path, port: u16) -> std::io::Result<Option<PortLock>> {
        let path = lock_dir.join(format!("port_{port}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(PortLock {
                port,
                path,
                lock: Some(lock),
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(std::io::Error::from(errno)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_some()
    }

    /// Unlock. Returns `false` if the lock was already released.
    pub fn release(&mut self) -> bool {
        let Some(lock) = self.lock.take() else {
            return false;
        };
        match lock.unlock() {
            Ok(_file) => debug!(port = self.port, "Released port lock"),
            Err((_lock, errno)) => {
                // Closing the descriptor drops the lock anyway.
                warn!(port = self.port, error = %errno, "Failed to unlock port lock file");
            }
        }
        true
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive use of one TCP port.
///
/// Without a lock this is a best-effort reservation: nothing stops another
/// process from binding the port before the sandbox does.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    range: PortRange,
    lock: Option<PortLock>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Whether the reservation is backed by a held cross-process lock.
    pub fn is_locked(&self) -> bool {
        self.lock.as_ref().is_some_and(PortLock::is_held)
    }

    /// Release the lock, if any. Safe to call repeatedly.
    pub fn release(&mut self) -> bool {
        match self.lock.as_mut() {
            Some(lock) => lock.release(),
            None => false,
        }
    }
}

/// Hands out port reservations from inclusive ranges.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    lock_dir: PathBuf,
    bind_address: String,
    lock_timeout: Duration,
}

impl PortAllocator {
    pub fn new(lock_dir: impl Into<PathBuf>, bind_address: &str, lock_timeout: Duration) -> Self {
        PortAllocator {
            lock_dir: lock_dir.into(),
            bind_address: bind_address.to_string(),
            lock_timeout,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.resolved_lock_dir(),
            &config.bind_address,
            config.lock_timeout(),
        )
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Reserve a port in `range`.
    ///
    /// Prefers a lock-backed port; falls back to a lock-less bind test when no
    /// lock could be obtained within the lock timeout.
    pub fn allocate(&self, range: PortRange) -> Result<PortReservation> {
        if range.is_empty() {
            return Err(RuntimeError::Configuration(format!(
                "empty port range {range}"
            )));
        }

        match self.allocate_locked(range) {
            Ok(Some(reservation)) => {
                debug!(port = reservation.port, %range, "Reserved port with lock");
                return Ok(reservation);
            }
            Ok(None) => {
                warn!(%range, "No lockable port within {:?}; using degraded lock-less allocation", self.lock_timeout);
            }
            Err(e) => {
                warn!(%range, error = %e, lock_dir = ?self.lock_dir, "Port lock infrastructure unavailable; using degraded lock-less allocation");
            }
        }

        let port = range
            .ports()
            .find(|port| self.is_bindable(*port))
            .ok_or(RuntimeError::PortsExhausted {
                min: range.min,
                max: range.max,
            })?;

        info!(port, %range, "Reserved port without lock (degraded)");
        Ok(PortReservation {
            port,
            range,
            lock: None,
        })
    }

    /// Release a reservation. No-op for lock-less or already released ones.
    pub fn release(&self, reservation: &mut PortReservation) -> bool {
        reservation.release()
    }

    /// [`allocate`](Self::allocate) on the blocking thread pool.
    pub async fn allocate_async(&self, range: PortRange) -> Result<PortReservation> {
        let allocator = self.clone();
        tokio::task::spawn_blocking(move || allocator.allocate(range))
            .await
            .map_err(|e| {
                RuntimeError::Io(std::io::Error::other(format!(
                    "port allocation task failed: {e}"
                )))
            })?
    }

    fn allocate_locked(&self, range: PortRange) -> std::io::Result<Option<PortReservation>> {
        std::fs::create_dir_all(&self.lock_dir)?;
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            for port in range.ports() {
                let Some(mut lock) = PortLock::try_acquire(&self.lock_dir, port)? else {
                    continue;
                };
                if self.is_bindable(port) {
                    return Ok(Some(PortReservation {
                        port,
                        range,
                        lock: Some(lock),
                    }));
                }
                lock.release();

                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }

            if Instant::now() + PASS_PAUSE >= deadline {
                return Ok(None);
            }
            std::thread::sleep(PASS_PAUSE);
        }
    }

    fn is_bindable(&self, port: u16) -> bool {
        TcpListener::bind((self.bind_address.as_str(), port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn allocator(dir: &Path) -> PortAllocator {
        PortAllocator::new(dir, "0.0.0.0", Duration::from_millis(200))
    }

    #[test]
    fn test_lock_is_exclusive_until_released() {
        let dir = tempdir().unwrap();
        let mut first = PortLock::try_acquire(dir.path(), 41111).unwrap().unwrap();
        assert!(PortLock::try_acquire(dir.path(), 41111).unwrap().is_none());

        assert!(first.release());
        assert!(!first.release());
        assert!(PortLock::try_acquire(dir.path(), 41111).unwrap().is_some());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let _held = PortLock::try_acquire(dir.path(), 41112).unwrap().unwrap();
        }
        assert!(PortLock::try_acquire(dir.path(), 41112).unwrap().is_some());
    }

    #[test]
    fn test_allocate_returns_locked_reservation() {
        let dir = tempdir().unwrap();
        let range = PortRange::new(47311, 47320);
        let reservation = allocator(dir.path()).allocate(range).unwrap();
        assert!(range.contains(reservation.port()));
        assert!(reservation.is_locked());
        assert_eq!(reservation.range(), range);
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempdir().unwrap();
        let alloc = allocator(dir.path());
        let mut reservation = alloc.allocate(PortRange::new(47321, 47330)).unwrap();
        assert!(alloc.release(&mut reservation));
        assert!(!alloc.release(&mut reservation));
        assert!(!reservation.is_locked());
    }

    #[test]
    fn test_lockless_release_is_noop() {
        let mut reservation = PortReservation {
            port: 1,
            range: PortRange::new(1, 1),
            lock: None,
        };
        assert!(!reservation.release());
        assert!(!reservation.is_locked());
    }

    #[test]
    fn test_empty_range_is_configuration_error() {
        let dir = tempdir().unwrap();
        let err = allocator(dir.path())
            .allocate(PortRange::new(10, 9))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }

    #[test]
    fn test_bound_port_is_never_handed_out() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();

        let err = allocator(dir.path())
            .allocate(PortRange::new(busy, busy))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::PortsExhausted { .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_async_allocation_leaves_executor_free() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let range = PortRange::new(47341, 47342);
        let _held: Vec<PortLock> = range
            .ports()
            .map(|port| PortLock::try_acquire(dir.path(), port).unwrap().unwrap())
            .collect();

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let reservation = PortAllocator::new(dir.path(), "0.0.0.0", Duration::from_millis(300))
            .allocate_async(range)
            .await
            .unwrap();
        ticker.abort();

        assert!(!reservation.is_locked());
        assert!(range.contains(reservation.port()));
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn test_unusable_lock_dir_degrades() {
        let dir = tempdir().unwrap();
        let not_a_dir = dir.path().join("file");
        std::fs::write(&not_a_dir, b"x").unwrap();

        let reservation = allocator(&not_a_dir)
            .allocate(PortRange::new(47331, 47340))
            .unwrap();
        assert!(!reservation.is_locked());
    }
}
