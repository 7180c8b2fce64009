use crate::error::LimitError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

#[derive(Default)]
struct Counts {
    by_ip: HashMap<IpAddr, usize>,
    by_user: HashMap<String, usize>,
}

/// Concurrent connection caps per source address and per user. A slot taken
/// by `try_acquire` has to be handed back with exactly one `release`.
pub struct ConnectionLimiter {
    per_ip: usize,
    per_user: usize,
    counts: Mutex<Counts>,
}

impl ConnectionLimiter {
    pub fn new(per_ip: usize, per_user: usize) -> Self {
        ConnectionLimiter {
            per_ip,
            per_user,
            counts: Mutex::new(Counts::default()),
        }
    }

    /// Both counters move together or not at all.
    pub fn try_acquire(&self, ip: IpAddr, user_id: &str) -> Result<(), LimitError> {
        let mut c = self.counts.lock();
        if c.by_ip.get(&ip).copied().unwrap_or(0) >= self.per_ip {
            return Err(LimitError::Ip);
        }
        if c.by_user.get(user_id).copied().unwrap_or(0) >= self.per_user {
            return Err(LimitError::User);
        }
        *c.by_ip.entry(ip).or_insert(0) += 1;
        *c.by_user.entry(user_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    pub fn release(&self, ip: IpAddr, user_id: &str) {
        let mut c = self.counts.lock();
        if let Some(n) = c.by_ip.get_mut(&ip) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                c.by_ip.remove(&ip);
            }
        }
        if let Some(n) = c.by_user.get_mut(user_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                c.by_user.remove(user_id);
            }
        }
    }

    pub fn ip_count(&self, ip: IpAddr) -> usize {
        self.counts.lock().by_ip.get(&ip).copied().unwrap_or(0)
    }

    pub fn user_count(&self, user_id: &str) -> usize {
        self.counts.lock().by_user.get(user_id).copied().unwrap_or(0)
    }
}

/// Token bucket for inbound frames on one connection.
#[derive(Debug, Clone)]
pub struct MessageBudget {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl MessageBudget {
    pub fn new(per_second: u32, burst: u32) -> Self {
        MessageBudget {
            rate: per_second as f64,
            burst: burst.max(1) as f64,
            tokens: burst.max(1) as f64,
            last: Instant::now(),
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn eleventh_connection_from_one_ip_is_refused() {
        let lim = ConnectionLimiter::new(10, 100);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for i in 0..10 {
            lim.try_acquire(ip, &format!("u{i}")).unwrap();
        }
        assert_eq!(lim.try_acquire(ip, "u99"), Err(LimitError::Ip));
        assert_eq!(lim.ip_count(ip), 10);
        // the refused attempt left no trace
        assert_eq!(lim.user_count("u99"), 0);

        lim.release(ip, "u0");
        assert!(lim.try_acquire(ip, "u99").is_ok());
    }

    #[test]
    fn user_cap_spans_addresses() {
        let lim = ConnectionLimiter::new(10, 2);
        lim.try_acquire("10.0.0.1".parse().unwrap(), "ann").unwrap();
        lim.try_acquire("10.0.0.2".parse().unwrap(), "ann").unwrap();
        let third: IpAddr = "10.0.0.3".parse().unwrap();
        assert_eq!(lim.try_acquire(third, "ann"), Err(LimitError::User));
        assert_eq!(lim.ip_count(third), 0);
    }

    #[test]
    fn release_returns_to_zero() {
        let lim = ConnectionLimiter::new(1, 1);
        let ip: IpAddr = "::1".parse().unwrap();
        lim.try_acquire(ip, "ann").unwrap();
        lim.release(ip, "ann");
        lim.release(ip, "ann");
        assert_eq!(lim.ip_count(ip), 0);
        assert_eq!(lim.user_count("ann"), 0);
    }

    #[test]
    fn budget_refills_over_time() {
        let mut b = MessageBudget::new(2, 3);
        let t0 = Instant::now();
        assert!(b.allow(t0));
        assert!(b.allow(t0));
        assert!(b.allow(t0));
        assert!(!b.allow(t0));
        assert!(b.allow(t0 + Duration::from_millis(600)));
        assert!(!b.allow(t0 + Duration::from_millis(600)));
    }
}
