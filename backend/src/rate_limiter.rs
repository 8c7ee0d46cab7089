//! C1: per-indexer rate limiter.
//!
//! Fully synchronous and lock-protected (`parking_lot::Mutex`), matching
//! §5's requirement that this component run no internal tasks — callers
//! sleep for whatever `next_wait` returns.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::db::IndexerRepository;

/// Search priority. The scheduler's heap orders by this; the rate
/// limiter scales its minimum interval by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Background,
    Completion,
    Rss,
    Interactive,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitOptions {
    pub min_interval: Duration,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
        }
    }
}

impl Priority {
    /// Multiplier applied to the configured min-interval.
    pub fn interval_multiplier(self) -> f64 {
        match self {
            Priority::Interactive => 0.1,
            Priority::Rss => 0.5,
            Priority::Completion => 0.75,
            Priority::Background => 1.0,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct IndexerState {
    last_request_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
}

pub struct RateLimiter {
    state: Mutex<HashMap<i64, IndexerState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Called once at startup by the owning service after reading
    /// `torznab_indexer_cooldowns` rows.
    pub fn load_cooldowns(&self, cooldowns: HashMap<i64, DateTime<Utc>>) {
        let mut state = self.state.lock();
        for (indexer_id, resume_at) in cooldowns {
            state.entry(indexer_id).or_default().cooldown_until = Some(resume_at);
        }
    }

    pub async fn load_cooldowns_from(
        &self,
        cancel: &CancellationToken,
        repo: &IndexerRepository,
    ) -> anyhow::Result<()> {
        let cooldowns = repo.load_cooldowns(cancel).await?;
        self.load_cooldowns(cooldowns);
        Ok(())
    }

    /// Returns zero if the indexer is ready; otherwise the remaining wait.
    /// The larger of the cooldown remainder and the priority-scaled
    /// interval remainder.
    pub fn next_wait(&self, indexer_id: i64, priority: Priority, opts: RateLimitOptions) -> Duration {
        let now = Utc::now();
        let state = self.state.lock();
        let entry = state.get(&indexer_id);

        let cooldown_wait = entry
            .and_then(|s| s.cooldown_until)
            .filter(|&until| until > now)
            .map(|until| (until - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);

        let scaled_interval = opts
            .min_interval
            .mul_f64(priority.interval_multiplier());

        let interval_wait = entry
            .and_then(|s| s.last_request_at)
            .map(|last| {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                scaled_interval.saturating_sub(elapsed)
            })
            .unwrap_or(Duration::ZERO);

        cooldown_wait.max(interval_wait)
    }

    /// Empty `at` means "now".
    pub fn record_request(&self, indexer_id: i64, at: Option<DateTime<Utc>>) {
        let mut state = self.state.lock();
        state.entry(indexer_id).or_default().last_request_at = Some(at.unwrap_or_else(Utc::now));
    }

    pub fn set_cooldown(&self, indexer_id: i64, resume_at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.entry(indexer_id).or_default().cooldown_until = Some(resume_at);
    }

    pub fn clear_cooldown(&self, indexer_id: i64) {
        let mut state = self.state.lock();
        if let Some(s) = state.get_mut(&indexer_id) {
            s.cooldown_until = None;
        }
    }

    pub fn is_in_cooldown(&self, indexer_id: i64) -> (bool, Option<DateTime<Utc>>) {
        let now = Utc::now();
        let state = self.state.lock();
        match state.get(&indexer_id).and_then(|s| s.cooldown_until) {
            Some(until) if until > now => (true, Some(until)),
            _ => (false, None),
        }
    }

    /// Expired entries are filtered out by the getter.
    pub fn cooldown_indexers(&self) -> HashMap<i64, DateTime<Utc>> {
        let now = Utc::now();
        let state = self.state.lock();
        state
            .iter()
            .filter_map(|(id, s)| s.cooldown_until.filter(|&u| u > now).map(|u| (*id, u)))
            .collect()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_indexer_has_no_wait() {
        let rl = RateLimiter::new();
        assert_eq!(rl.next_wait(1, Priority::Background, RateLimitOptions::default()), Duration::ZERO);
    }

    #[test]
    fn cooldown_is_honored_until_it_expires() {
        let rl = RateLimiter::new();
        let now = Utc::now();
        rl.set_cooldown(1, now + chrono::Duration::seconds(5));
        assert!(rl.next_wait(1, Priority::Interactive, RateLimitOptions::default()) > Duration::ZERO);
        let (in_cooldown, _) = rl.is_in_cooldown(1);
        assert!(in_cooldown);
    }

    #[test]
    fn clearing_cooldown_releases_the_indexer() {
        let rl = RateLimiter::new();
        rl.set_cooldown(1, Utc::now() + chrono::Duration::seconds(5));
        rl.clear_cooldown(1);
        let (in_cooldown, _) = rl.is_in_cooldown(1);
        assert!(!in_cooldown);
    }

    #[test]
    fn priority_scales_the_minimum_interval() {
        let rl = RateLimiter::new();
        let opts = RateLimitOptions {
            min_interval: Duration::from_millis(1000),
        };
        rl.record_request(1, Some(Utc::now()));
        let interactive_wait = rl.next_wait(1, Priority::Interactive, opts);
        let background_wait = rl.next_wait(1, Priority::Background, opts);
        assert!(interactive_wait < background_wait);
    }

    #[test]
    fn cooldown_getter_filters_expired_entries() {
        let rl = RateLimiter::new();
        rl.set_cooldown(1, Utc::now() - chrono::Duration::seconds(5));
        rl.set_cooldown(2, Utc::now() + chrono::Duration::seconds(5));
        let cooldowns = rl.cooldown_indexers();
        assert!(!cooldowns.contains_key(&1));
        assert!(cooldowns.contains_key(&2));
    }
}
