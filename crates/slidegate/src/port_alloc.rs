use std::{
    collections::HashSet,
    io::ErrorKind,
    net::TcpListener,
    ops::RangeInclusive,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::error::PreviewError;

#[derive(Debug)]
struct PortPool {
    leased: HashSet<u16>,
    // Next port to try; allocation walks the range round-robin so a port
    // that was just released is not handed out again immediately.
    cursor: u16,
}

/// Leases local TCP ports from a fixed range. A port stays leased until
/// `release` is called, which the supervisor does only after the owning
/// process has exited.
#[derive(Clone, Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    os_probe: bool,
    pool: Arc<Mutex<PortPool>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, os_probe: bool) -> Self {
        let cursor = *range.start();
        Self {
            range,
            os_probe,
            pool: Arc::new(Mutex::new(PortPool {
                leased: HashSet::new(),
                cursor,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allocate(&self) -> Result<u16, PreviewError> {
        let (lo, hi) = (*self.range.start(), *self.range.end());
        let span = u32::from(hi - lo) + 1;

        let mut pool = self.lock();
        let start = u32::from(pool.cursor.clamp(lo, hi) - lo);
        for step in 0..span {
            let port = lo + ((start + step) % span) as u16;
            if pool.leased.contains(&port) {
                continue;
            }
            if self.os_probe && !port_is_free(port) {
                tracing::debug!(port, "skipping port held outside the pool");
                continue;
            }
            pool.leased.insert(port);
            pool.cursor = if port == hi { lo } else { port + 1 };
            return Ok(port);
        }

        Err(PreviewError::PoolExhausted(format!(
            "all ports in {lo}-{hi} are in use ({} leased)",
            pool.leased.len()
        )))
    }

    /// Returns `false` when the port was not leased.
    pub fn release(&self, port: u16) -> bool {
        self.lock().leased.remove(&port)
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.lock().leased.contains(&port)
    }

    pub fn leased_count(&self) -> usize {
        self.lock().leased.len()
    }
}

fn port_is_free(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            drop(l);
            true
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            tracing::debug!(port, error = %e, "port probe failed");
            false
        }
    }
}
