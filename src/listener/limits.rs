//! Resource bounds shared by every listener

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Timeouts and size caps applied to untrusted peers
#[derive(Debug, Clone)]
pub struct Limits {
    /// Longest silence tolerated between reads
    pub idle_timeout: Duration,
    /// Hard cap on a connection's lifetime
    pub max_session: Duration,
    pub max_sessions_per_ip: usize,
    pub max_sessions: usize,
    pub max_line_bytes: usize,
    pub max_data_bytes: usize,
    pub max_http_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            max_session: Duration::from_secs(300),
            max_sessions_per_ip: 16,
            max_sessions: 1024,
            max_line_bytes: 2048,
            max_data_bytes: 1024 * 1024,
            max_http_body_bytes: 1024 * 1024,
        }
    }
}

/// Counts live sessions per source address and overall
#[derive(Clone)]
pub struct SessionLimiter {
    per_ip: Arc<DashMap<IpAddr, usize>>,
    max_per_ip: usize,
    global: Arc<Semaphore>,
}

impl SessionLimiter {
    pub fn new(max_per_ip: usize, max_total: usize) -> Self {
        Self {
            per_ip: Arc::new(DashMap::new()),
            max_per_ip: max_per_ip.max(1),
            global: Arc::new(Semaphore::new(max_total.max(1))),
        }
    }

    /// Claims a session slot for `ip`, or `None` when a bound is reached
    pub fn try_acquire(&self, ip: IpAddr) -> Option<SessionPermit> {
        let global = match Arc::clone(&self.global).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Global session limit reached, refusing {}", ip);
                return None;
            }
        };

        {
            let mut count = self.per_ip.entry(ip).or_insert(0);
            if *count >= self.max_per_ip {
                debug!("Per-source session limit reached for {}", ip);
                return None;
            }
            *count += 1;
        }

        Some(SessionPermit {
            ip,
            per_ip: Arc::clone(&self.per_ip),
            _global: global,
        })
    }

    /// Live sessions currently held by `ip`
    pub fn active(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).map_or(0, |c| *c)
    }
}

/// Releases its slot when dropped
pub struct SessionPermit {
    ip: IpAddr,
    per_ip: Arc<DashMap<IpAddr, usize>>,
    _global: OwnedSemaphorePermit,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        if let Some(mut count) = self.per_ip.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
        }
        self.per_ip.remove_if(&self.ip, |_, count| *count == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_ip_bound() {
        let limiter = SessionLimiter::new(2, 10);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let a = limiter.try_acquire(ip);
        let b = limiter.try_acquire(ip);
        assert!(a.is_some() && b.is_some());
        assert!(limiter.try_acquire(ip).is_none());
        assert!(limiter.try_acquire("10.0.0.2".parse().unwrap()).is_some());

        drop(a);
        assert_eq!(limiter.active(ip), 1);
        assert!(limiter.try_acquire(ip).is_some());
    }

    #[test]
    fn test_global_bound() {
        let limiter = SessionLimiter::new(5, 1);
        let held = limiter.try_acquire("10.0.0.1".parse().unwrap());
        assert!(held.is_some());
        assert!(limiter.try_acquire("10.0.0.2".parse().unwrap()).is_none());
        drop(held);
        assert!(limiter.try_acquire("10.0.0.2".parse().unwrap()).is_some());
    }
}
