//! Simulation result cache.
//!
//! Trial arrays are keyed by a blake3 [`Fingerprint`] of everything that
//! determines them. Storage is a `moka` cache with TTL and LRU eviction; an
//! in-flight table on top of it guarantees at most one computation per
//! fingerprint while concurrent callers wait for the leader's result.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use moka::Expiry;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::engine::SimulationResult;
use super::error::{GoalError, Result};
use super::market::{MODEL_VERSION, MarketAssumptions};
use super::types::{Allocation, FinancialProfile, Goal, RiskTolerance, resolve_profile_defaults};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The inputs a trial array depends on, in canonical form.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintInput<'a> {
    pub model_version: &'static str,
    pub goal: GoalSignature<'a>,
    pub profile: ProfileSignature,
    pub trials: u32,
    pub seed: u64,
    pub as_of: NaiveDate,
    pub projection_years: u32,
    pub assumptions: &'a MarketAssumptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSignature<'a> {
    pub id: &'a str,
    pub target_amount: f64,
    pub current_amount: f64,
    pub target_date: Option<NaiveDate>,
    pub monthly_contribution: f64,
    pub allocation: &'a Allocation,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSignature {
    pub annual_income: f64,
    pub annual_expenses: f64,
    pub risk_tolerance: RiskTolerance,
}

impl<'a> FingerprintInput<'a> {
    pub fn new(
        goal: &'a Goal,
        profile: &FinancialProfile,
        trials: u32,
        seed: u64,
        as_of: NaiveDate,
        projection_years: u32,
        assumptions: &'a MarketAssumptions,
    ) -> Self {
        Self {
            model_version: MODEL_VERSION,
            goal: GoalSignature {
                id: &goal.id,
                target_amount: goal.target_amount,
                current_amount: goal.current_amount,
                target_date: goal.target_date,
                monthly_contribution: goal.monthly_contribution,
                allocation: &goal.asset_allocation,
            },
            profile: ProfileSignature {
                annual_income: profile.annual_income,
                annual_expenses: profile.annual_expenses,
                risk_tolerance: resolve_profile_defaults(profile).risk_tolerance,
            },
            trials,
            seed,
            as_of,
            projection_years,
            assumptions,
        }
    }

    pub fn fingerprint(&self) -> Result<Fingerprint> {
        let canonical = serde_json::to_vec(self)
            .map_err(|e| GoalError::computation(format!("cannot fingerprint inputs: {e}")))?;
        Ok(Fingerprint(blake3::hash(&canonical).to_hex().to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEntry {
    pub fingerprint: Fingerprint,
    pub stored_at: DateTime<Utc>,
    pub result: SimulationResult,
}

/// Durable backing store for cache snapshots.
pub trait CacheStore: Send + Sync {
    fn persist(&self, entries: &[PersistedEntry]) -> Result<()>;
    fn load(&self) -> Result<Vec<PersistedEntry>>;
}

/// Snapshot store writing one JSON document, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CacheStore for JsonFileStore {
    fn persist(&self, entries: &[PersistedEntry]) -> Result<()> {
        let body = serde_json::to_vec(entries)
            .map_err(|e| GoalError::Storage(format!("cannot encode cache snapshot: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                GoalError::Storage(format!("cannot write {}: {e}", self.path.display()))
            })
    }

    fn load(&self) -> Result<Vec<PersistedEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read(&self.path).map_err(|e| {
            GoalError::Storage(format!("cannot read {}: {e}", self.path.display()))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| GoalError::Storage(format!("corrupt cache snapshot: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub max_entries: u64,
    pub flight_timeout: Duration,
    pub flush_interval: Duration,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl(),
            max_entries: config.max_entries.max(1),
            flight_timeout: config.flight_timeout(),
            flush_interval: config.flush_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub computations: u64,
}

#[derive(Debug, Clone)]
struct CachedEntry {
    stored_at: DateTime<Utc>,
    /// Time left before expiry, measured from insertion.
    lifetime: Duration,
    result: Arc<SimulationResult>,
}

/// Expires each entry `lifetime` after it was inserted, so restored entries
/// keep only what is left of their original TTL.
struct EntryExpiry;

impl Expiry<Fingerprint, CachedEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.lifetime)
    }

    fn expire_after_update(
        &self,
        _key: &Fingerprint,
        value: &CachedEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.lifetime)
    }
}

type Outcome = Result<Arc<SimulationResult>>;

#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

enum Role {
    Leader(Arc<Flight>),
    Follower(Arc<Flight>),
}

pub struct SimulationCache {
    entries: Cache<Fingerprint, CachedEntry>,
    in_flight: Mutex<HashMap<Fingerprint, Arc<Flight>>>,
    settings: CacheSettings,
    store: Option<Arc<dyn CacheStore>>,
    last_flush: Mutex<Instant>,
    flushing: Arc<AtomicBool>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    computations: AtomicU64,
}

fn poisoned<T>(_: PoisonError<T>) -> GoalError {
    GoalError::Concurrency("simulation cache lock poisoned".to_string())
}

impl SimulationCache {
    pub fn new(settings: CacheSettings) -> Self {
        let entries = Cache::builder()
            .max_capacity(settings.max_entries)
            .expire_after(EntryExpiry)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            entries,
            in_flight: Mutex::new(HashMap::new()),
            settings,
            store: None,
            last_flush: Mutex::new(Instant::now()),
            flushing: Arc::new(AtomicBool::new(false)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            computations: AtomicU64::new(0),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Returns the cached array for `fingerprint`, or runs `compute` once.
    ///
    /// Concurrent callers with the same fingerprint wait for the first
    /// caller's outcome instead of computing again. Failed or abandoned
    /// computations are reported to every waiter and nothing is stored.
    pub fn get_or_compute<F>(&self, fingerprint: &Fingerprint, compute: F) -> Outcome
    where
        F: FnOnce() -> Result<SimulationResult>,
    {
        let role = {
            let mut in_flight = self.in_flight.lock().map_err(poisoned)?;
            if let Some(entry) = self.entries.get(fingerprint) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.result);
            }
            match in_flight.get(fingerprint) {
                Some(flight) => Role::Follower(Arc::clone(flight)),
                None => {
                    let flight = Arc::new(Flight::default());
                    in_flight.insert(fingerprint.clone(), Arc::clone(&flight));
                    Role::Leader(flight)
                }
            }
        };

        match role {
            Role::Follower(flight) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(%fingerprint, "waiting for in-flight simulation");
                self.wait_for(&flight)
            }
            Role::Leader(flight) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let mut guard = FlightGuard {
                    cache: self,
                    fingerprint,
                    flight,
                    published: false,
                };
                let outcome = compute().map(Arc::new);
                if let Ok(result) = &outcome {
                    self.entries.insert(
                        fingerprint.clone(),
                        CachedEntry {
                            stored_at: Utc::now(),
                            lifetime: self.settings.ttl,
                            result: Arc::clone(result),
                        },
                    );
                    self.computations.fetch_add(1, Ordering::Relaxed);
                }
                guard.publish(outcome.clone());
                if outcome.is_ok() {
                    self.maybe_flush();
                }
                outcome
            }
        }
    }

    fn wait_for(&self, flight: &Flight) -> Outcome {
        let outcome = flight.outcome.lock().map_err(poisoned)?;
        let (outcome, _) = flight
            .ready
            .wait_timeout_while(outcome, self.settings.flight_timeout, |o| o.is_none())
            .map_err(poisoned)?;
        match outcome.as_ref() {
            Some(result) => result.clone(),
            None => Err(GoalError::Concurrency(format!(
                "timed out after {:?} waiting for in-flight simulation",
                self.settings.flight_timeout
            ))),
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<SimulationResult>> {
        self.entries.get(fingerprint).map(|entry| entry.result)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
        }
    }

    /// Shared handles to the live entries; trial arrays are not copied.
    fn snapshot(&self) -> Vec<(Fingerprint, CachedEntry)> {
        self.entries
            .iter()
            .map(|(fingerprint, entry)| ((*fingerprint).clone(), entry))
            .collect()
    }

    /// Starts a background flush when the interval has elapsed and no other
    /// flush is running. Failures are logged only.
    fn maybe_flush(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        {
            let Ok(mut last) = self.last_flush.lock() else {
                return;
            };
            if last.elapsed() < self.settings.flush_interval {
                return;
            }
            if self
                .flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            *last = Instant::now();
        }

        let snapshot = self.snapshot();
        let flushing = Arc::clone(&self.flushing);
        let spawned = thread::Builder::new()
            .name("sim-cache-flush".to_string())
            .spawn(move || {
                let entries = materialize(snapshot);
                match store.persist(&entries) {
                    Ok(()) => debug!(entries = entries.len(), "simulation cache flushed"),
                    Err(e) => warn!(error = %e, "simulation cache flush failed"),
                }
                flushing.store(false, Ordering::Release);
            });
        if let Err(e) = spawned {
            warn!(error = %e, "could not start cache flush thread");
            self.flushing.store(false, Ordering::Release);
        }
    }

    /// Synchronous flush, used on shutdown.
    pub fn flush_now(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let entries = materialize(self.snapshot());
        store.persist(&entries)?;
        if let Ok(mut last) = self.last_flush.lock() {
            *last = Instant::now();
        }
        Ok(entries.len())
    }

    /// Loads persisted entries that are still inside the TTL. Returns the
    /// number of entries restored.
    pub fn warm_from_store(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let now = Utc::now();
        let mut restored = 0;
        for entry in store.load()? {
            let age = now
                .signed_duration_since(entry.stored_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let lifetime = self.settings.ttl.saturating_sub(age);
            if lifetime.is_zero() {
                continue;
            }
            self.entries.insert(
                entry.fingerprint,
                CachedEntry {
                    stored_at: entry.stored_at,
                    lifetime,
                    result: Arc::new(entry.result),
                },
            );
            restored += 1;
        }
        debug!(restored, "simulation cache warmed from store");
        Ok(restored)
    }
}

/// Copies snapshot handles into persistable entries, ordered by fingerprint.
fn materialize(snapshot: Vec<(Fingerprint, CachedEntry)>) -> Vec<PersistedEntry> {
    let mut entries: Vec<PersistedEntry> = snapshot
        .into_iter()
        .map(|(fingerprint, entry)| PersistedEntry {
            fingerprint,
            stored_at: entry.stored_at,
            result: (*entry.result).clone(),
        })
        .collect();
    entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    entries
}

/// Publishes the leader's outcome and clears the in-flight slot, also when
/// the computation unwinds.
struct FlightGuard<'a> {
    cache: &'a SimulationCache,
    fingerprint: &'a Fingerprint,
    flight: Arc<Flight>,
    published: bool,
}

impl FlightGuard<'_> {
    fn publish(&mut self, outcome: Outcome) {
        self.published = true;
        {
            let mut in_flight = self
                .cache
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if in_flight
                .get(self.fingerprint)
                .is_some_and(|f| Arc::ptr_eq(f, &self.flight))
            {
                in_flight.remove(self.fingerprint);
            }
        }
        let mut slot = self
            .flight
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(outcome);
        self.flight.ready.notify_all();
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.published {
            warn!(fingerprint = %self.fingerprint, "simulation abandoned before completion");
            self.publish(Err(GoalError::computation(
                "simulation abandoned before completion",
            )));
        }
    }
}
