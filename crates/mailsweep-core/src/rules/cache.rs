use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::owner::OwnerId;

use super::rule_set::RuleSet;

/// Invalidated owners tracked before the per-owner stamps are folded into the
/// floor, which flushes the whole cache.
const MAX_TRACKED_OWNERS: usize = 10_000;

/// Per-owner rule sets shared between the mutation engine, which invalidates
/// after every commit, and the classifier, which reads through it.
///
/// Every invalidation takes a new value from one monotonic clock. An owner's
/// generation is the later of its own last invalidation and the floor that
/// [`RuleSetCache::invalidate_all`] raises. A loader records the generation
/// before reading the store and [`RuleSetCache::insert`] drops the result if
/// either moved in between, so a stale snapshot can never overwrite a fresh
/// invalidation.
#[derive(Debug)]
pub struct RuleSetCache {
    ttl: Duration,
    state: RwLock<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<OwnerId, CachedRuleSet>,
    generations: HashMap<OwnerId, u64>,
    clock: u64,
    floor: u64,
}

impl CacheState {
    fn generation(&self, owner: &OwnerId) -> u64 {
        self.generations
            .get(owner)
            .copied()
            .unwrap_or(0)
            .max(self.floor)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn reset(&mut self) {
        self.floor = self.tick();
        self.generations.clear();
        self.entries.clear();
    }
}

#[derive(Debug)]
struct CachedRuleSet {
    loaded_at: Instant,
    generation: u64,
    rules: Arc<RuleSet>,
}

impl RuleSetCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Cache that never holds anything; every lookup goes to the store.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub async fn get(&self, owner: &OwnerId) -> Option<Arc<RuleSet>> {
        if !self.is_enabled() {
            return None;
        }
        let state = self.state.read().await;
        let entry = state.entries.get(owner)?;
        if entry.generation != state.generation(owner) || entry.loaded_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.rules.clone())
    }

    /// Generation to pass to [`RuleSetCache::insert`] once loading finishes.
    pub async fn generation(&self, owner: &OwnerId) -> u64 {
        self.state.read().await.generation(owner)
    }

    /// Store a freshly loaded rule set unless the owner was invalidated since
    /// `generation` was read. Always returns the shared snapshot.
    pub async fn insert(&self, owner: &OwnerId, generation: u64, rules: RuleSet) -> Arc<RuleSet> {
        let rules = Arc::new(rules);
        if !self.is_enabled() {
            return rules;
        }
        let mut state = self.state.write().await;
        if state.generation(owner) == generation {
            state.entries.insert(
                owner.clone(),
                CachedRuleSet {
                    loaded_at: Instant::now(),
                    generation,
                    rules: rules.clone(),
                },
            );
        }
        rules
    }

    pub async fn invalidate(&self, owner: &OwnerId) {
        let mut state = self.state.write().await;
        if !state.generations.contains_key(owner) && state.generations.len() >= MAX_TRACKED_OWNERS {
            state.reset();
            return;
        }
        let stamp = state.tick();
        state.entries.remove(owner);
        state.generations.insert(owner.clone(), stamp);
    }

    /// Drop every entry and fence off loads already in flight for any owner,
    /// including owners with nothing cached yet.
    pub async fn invalidate_all(&self) {
        self.state.write().await.reset();
    }

    #[cfg(test)]
    async fn tracked_owners(&self) -> usize {
        self.state.read().await.generations.len()
    }
}

impl Default for RuleSetCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
