//! Per-credential request pacing.
//!
//! Every credential owns a slot holding the earliest instant its next request
//! may start. `acquire` reserves a start time while holding the state lock, so
//! concurrent callers can never book the same slot twice, then sleeps outside
//! the lock until the reservation begins.
//!
//! Selection is round-robin: the scan starts after the last credential handed
//! out and takes the first one that is already free. When none is free the
//! soonest-free credential is booked (ties resolved in round-robin order), so
//! the caller waits instead of failing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ProcessingError, Result};
use crate::utils::constants::{MAX_BACKOFF_FACTOR, RATE_LIMIT_COOLDOWN_SECS};

#[derive(Clone)]
pub struct Credential {
    /// Printable identifier; never the secret itself
    pub key_id: String,
    pub api_key: String,
    pub requests_per_minute: u32,
}

impl Credential {
    pub fn new(key_id: &str, api_key: &str, requests_per_minute: u32) -> Self {
        Self {
            key_id: key_id.to_string(),
            api_key: api_key.to_string(),
            requests_per_minute,
        }
    }

    /// Build numbered credentials key1..keyN from raw API keys
    pub fn pool_from_keys(keys: &[String], requests_per_minute: u32) -> Vec<Credential> {
        keys.iter()
            .enumerate()
            .map(|(i, key)| Credential::new(&format!("key{}", i + 1), key, requests_per_minute))
            .collect()
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60) / self.requests_per_minute.max(1)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("key_id", &self.key_id)
            .field("requests_per_minute", &self.requests_per_minute)
            .finish()
    }
}

/// Permission to issue exactly one request with `credential`
#[derive(Debug, Clone)]
pub struct Permit {
    pub index: usize,
    pub credential: Arc<Credential>,
}

#[derive(Debug)]
struct Slot {
    base_interval: Duration,
    interval: Duration,
    next_free: Instant,
    issued: u64,
}

#[derive(Debug)]
struct GateState {
    slots: Vec<Slot>,
    cursor: usize,
}

pub struct RateGate {
    credentials: Vec<Arc<Credential>>,
    state: Mutex<GateState>,
    cooldown: Duration,
}

impl RateGate {
    pub fn new(credentials: Vec<Credential>) -> Result<Self> {
        if credentials.is_empty() {
            return Err(ProcessingError::Config(
                "At least one credential is required".to_string(),
            ));
        }
        if let Some(c) = credentials.iter().find(|c| c.requests_per_minute == 0) {
            return Err(ProcessingError::Config(format!(
                "Credential {} has a zero request budget",
                c.key_id
            )));
        }

        let now = Instant::now();
        let slots = credentials
            .iter()
            .map(|c| Slot {
                base_interval: c.interval(),
                interval: c.interval(),
                next_free: now,
                issued: 0,
            })
            .collect();

        Ok(Self {
            credentials: credentials.into_iter().map(Arc::new).collect(),
            state: Mutex::new(GateState { slots, cursor: 0 }),
            cooldown: Duration::from_secs(RATE_LIMIT_COOLDOWN_SECS),
        })
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Sum of per-credential budgets
    pub fn aggregate_budget(&self) -> u64 {
        self.credentials
            .iter()
            .map(|c| c.requests_per_minute as u64)
            .sum()
    }

    /// Wait for any credential in the pool
    pub async fn acquire(&self) -> Permit {
        let (index, start) = self.reserve_any(Instant::now());
        tokio::time::sleep_until(start).await;
        self.permit(index)
    }

    /// Provider rejected a request: cool the credential down and widen its spacing
    pub fn report_rate_limited(&self, index: usize, retry_after: Option<Duration>) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            let ceiling = slot.base_interval * MAX_BACKOFF_FACTOR;
            slot.interval = (slot.interval * 2).min(ceiling);
            let resume_at = Instant::now() + retry_after.unwrap_or(self.cooldown);
            slot.next_free = slot.next_free.max(resume_at);
            warn!(
                credential = %self.credentials[index].key_id,
                spacing_ms = slot.interval.as_millis() as u64,
                "Rate limit hit; backing off"
            );
        }
    }

    /// Request went through: relax spacing back toward the base budget
    pub fn report_success(&self, index: usize) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            if slot.interval > slot.base_interval {
                slot.interval = (slot.interval / 2).max(slot.base_interval);
                debug!(
                    credential = %self.credentials[index].key_id,
                    spacing_ms = slot.interval.as_millis() as u64,
                    "Relaxed request spacing"
                );
            }
        }
    }

    /// Requests issued per credential, in pool order
    pub fn usage(&self) -> Vec<(String, u64)> {
        let state = self.lock();
        self.credentials
            .iter()
            .zip(state.slots.iter())
            .map(|(c, s)| (c.key_id.clone(), s.issued))
            .collect()
    }

    fn reserve_any(&self, now: Instant) -> (usize, Instant) {
        let mut state = self.lock();
        let n = state.slots.len();
        let cursor = state.cursor;
        let order = (0..n).map(|offset| (cursor + offset) % n);

        let chosen = order
            .clone()
            .find(|&i| state.slots[i].next_free <= now)
            .or_else(|| order.min_by_key(|&i| state.slots[i].next_free))
            .unwrap_or(0);

        let start = Self::book(&mut state.slots[chosen], now);
        state.cursor = (chosen + 1) % n;
        (chosen, start)
    }

    fn book(slot: &mut Slot, now: Instant) -> Instant {
        let start = slot.next_free.max(now);
        slot.next_free = start + slot.interval;
        slot.issued += 1;
        start
    }

    fn permit(&self, index: usize) -> Permit {
        Permit {
            index,
            credential: Arc::clone(&self.credentials[index]),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool(n: usize, rpm: u32) -> RateGate {
        let keys: Vec<String> = (0..n).map(|i| format!("secret-{}", i)).collect();
        RateGate::new(Credential::pool_from_keys(&keys, rpm)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_credential_spacing() {
        let gate = pool(1, 60);
        let start = Instant::now();
        for _ in 0..5 {
            gate.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4));
        assert!(elapsed < Duration::from_millis(4100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_multiplies_throughput() {
        let gate = pool(3, 60);
        let start = Instant::now();
        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(gate.acquire().await.index);
        }
        // two rounds of three credentials: one spacing interval
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_respects_each_budget() {
        let gate = Arc::new(pool(2, 60));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                let permit = gate.acquire().await;
                (permit.index, Instant::now())
            }));
        }

        let mut per_key: HashMap<usize, Vec<Instant>> = HashMap::new();
        for handle in handles {
            let (index, at) = handle.await.unwrap();
            per_key.entry(index).or_default().push(at);
        }

        assert_eq!(per_key.len(), 2);
        for times in per_key.values_mut() {
            assert_eq!(times.len(), 5);
            times.sort();
            for pair in times.windows(2) {
                assert!(pair[1] - pair[0] >= Duration::from_secs(1));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_credential_starves() {
        let gate = pool(4, 600);
        for _ in 0..40 {
            gate.acquire().await;
        }
        for (_, issued) in gate.usage() {
            assert_eq!(issued, 10);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_credential_backs_off() {
        let gate = pool(1, 60).with_cooldown(Duration::from_secs(5));
        gate.acquire().await;
        gate.report_rate_limited(0, None);

        let before = Instant::now();
        gate.acquire().await;
        assert!(before.elapsed() >= Duration::from_secs(5));

        // spacing doubled to 2s until a success relaxes it
        let before = Instant::now();
        gate.acquire().await;
        assert!(before.elapsed() >= Duration::from_secs(2));

        gate.report_success(0);
        let before = Instant::now();
        gate.acquire().await;
        assert!(before.elapsed() < Duration::from_millis(2100));
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(RateGate::new(Vec::new()).is_err());
        assert!(RateGate::new(vec![Credential::new("k", "s", 0)]).is_err());
    }
}
