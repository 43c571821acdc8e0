use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fg_config::KeyPoolSettings;
use fg_types::{ApiKey, KeyId, KeyTier, SelectedKey, TenantKey};

use crate::background::{BackgroundWriter, WriteJob};
use crate::store::KeyStore;
use crate::utils::WeightedRing;

/// Operator view of one pool credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyStatus {
    pub id: String,
    pub priority: u32,
    pub weight: u64,
    pub requests_today: i64,
    pub rate_limit_hits: i64,
    pub cooldown_remaining: Option<Duration>,
}

struct CachedKeys {
    keys: Vec<ApiKey>,
    loaded_at: Instant,
}

struct CachedTenant {
    key: Option<TenantKey>,
    loaded_at: Instant,
}

#[derive(Default)]
struct PoolState {
    cache: HashMap<String, CachedKeys>,
    cursors: HashMap<String, u64>,
    tenants: HashMap<(String, String), CachedTenant>,
    /// Authoritative in-process cooldowns; the store copy may lag behind.
    key_cooldowns: HashMap<String, DateTime<Utc>>,
    tenant_cooldowns: HashMap<String, DateTime<Utc>>,
    fallback_cooldown: Option<DateTime<Utc>>,
}

impl PoolState {
    fn key_cooling(&self, key: &ApiKey, now: DateTime<Utc>) -> bool {
        key.is_cooling_down(now) || self.key_cooldowns.get(&key.id).is_some_and(|u| *u > now)
    }

    fn tenant_cooling(&self, key: &TenantKey, now: DateTime<Utc>) -> bool {
        key.cooldown_until.is_some_and(|u| u > now)
            || self
                .tenant_cooldowns
                .get(&key.tenant_id)
                .is_some_and(|u| *u > now)
    }
}

/// Tiered credential selection: tenant key, then the shared weighted pool,
/// then the operator fallback.
pub struct KeyPool {
    settings: KeyPoolSettings,
    store: Arc<dyn KeyStore>,
    writer: BackgroundWriter,
    state: Mutex<PoolState>,
}

impl KeyPool {
    /// Must be called from within a tokio runtime (spawns the write drain).
    pub fn new(store: Arc<dyn KeyStore>, settings: KeyPoolSettings) -> Self {
        let writer = BackgroundWriter::new(store.clone(), settings.writer_queue_size);
        Self {
            settings,
            store,
            writer,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Pick the credential for one call, or None when no tier has one.
    ///
    /// A cooling fallback is still returned, flagged `on_cooldown`, so the
    /// caller can degrade instead of calling.
    pub async fn get_available_key(
        &self,
        provider: &str,
        tenant_id: Option<&str>,
    ) -> Option<SelectedKey> {
        let now = Utc::now();

        if let Some(tenant) = tenant_id {
            if let Some(key) = self.tenant_key(tenant, provider).await {
                let state = self.state.lock().await;
                if !state.tenant_cooling(&key, now) {
                    debug!(tenant, provider, "Using tenant key");
                    return Some(SelectedKey {
                        secret: key.secret,
                        id: KeyId::Tenant(tenant.to_string()),
                        tier: KeyTier::Tenant,
                        on_cooldown: false,
                    });
                }
                debug!(tenant, provider, "Tenant key cooling down, falling through");
            }
        }

        let keys = self.pool_keys(provider).await;
        let mut state = self.state.lock().await;

        let candidates: Vec<&ApiKey> = keys.iter().filter(|k| !state.key_cooling(k, now)).collect();
        let ring = WeightedRing::new(candidates.iter().map(|k| k.weight()));
        let cursor = state.cursors.entry(provider.to_string()).or_insert(0);
        if let Some(idx) = ring.pick(*cursor) {
            *cursor = cursor.wrapping_add(1);
            let key = candidates[idx];
            let selected = SelectedKey {
                secret: key.secret.clone(),
                id: KeyId::Pool(key.id.clone()),
                tier: KeyTier::Pool,
                on_cooldown: false,
            };
            note_usage(&mut state, provider, &key.id, now);
            drop(state);

            self.writer.submit(WriteJob::KeyUsage {
                key_id: key.id.clone(),
                day: now.date_naive(),
            });
            return Some(selected);
        }

        let secret = self.settings.fallback_api_key.as_ref()?;
        let on_cooldown = state.fallback_cooldown.is_some_and(|u| u > now);
        if on_cooldown {
            debug!(provider, "Fallback key cooling down");
        }
        Some(SelectedKey {
            secret: secret.clone(),
            id: KeyId::Fallback,
            tier: KeyTier::Fallback,
            on_cooldown,
        })
    }

    /// Put the credential that was used on cooldown.
    pub async fn mark_rate_limited(&self, id: &KeyId, cooldown: Duration) {
        let until = Utc::now()
            + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::days(1));
        let mut state = self.state.lock().await;

        match id {
            KeyId::Pool(key_id) => {
                state.key_cooldowns.insert(key_id.clone(), until);
                state
                    .cache
                    .retain(|_, cached| !cached.keys.iter().any(|k| &k.id == key_id));
                drop(state);
                self.writer.submit(WriteJob::KeyCooldown {
                    key_id: key_id.clone(),
                    until,
                });
            }
            KeyId::Tenant(tenant_id) => {
                state.tenant_cooldowns.insert(tenant_id.clone(), until);
                state.tenants.retain(|(tenant, _), _| tenant != tenant_id);
                drop(state);
                self.writer.submit(WriteJob::TenantCooldown {
                    tenant_id: tenant_id.clone(),
                    until,
                });
            }
            KeyId::Fallback => state.fallback_cooldown = Some(until),
        }

        info!(key = %id, cooldown_secs = cooldown.as_secs_f64(), "Key marked rate limited");
    }

    /// Whether a call for this provider could get a usable credential
    /// without a tenant key.
    pub async fn has_available_keys(&self, provider: &str) -> bool {
        let now = Utc::now();
        let keys = self.pool_keys(provider).await;
        let state = self.state.lock().await;
        if keys.iter().any(|k| !state.key_cooling(k, now)) {
            return true;
        }
        self.settings.fallback_api_key.is_some() && !state.fallback_cooldown.is_some_and(|u| u > now)
    }

    /// Drop expired cooldown entries and stale tenant lookups. Returns how
    /// many cooldowns were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let before = state.key_cooldowns.len() + state.tenant_cooldowns.len();
        state.key_cooldowns.retain(|_, until| *until > now);
        state.tenant_cooldowns.retain(|_, until| *until > now);
        let mut removed = before - state.key_cooldowns.len() - state.tenant_cooldowns.len();
        if state.fallback_cooldown.is_some_and(|u| u <= now) {
            state.fallback_cooldown = None;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "Expired key cooldowns swept");
        }

        let ttl = self.settings.cache_ttl;
        let cached = state.tenants.len();
        state.tenants.retain(|_, t| t.loaded_at.elapsed() < ttl);
        let evicted = cached - state.tenants.len();
        if evicted > 0 {
            debug!(evicted, "Stale tenant lookups evicted");
        }
        removed
    }

    pub async fn pool_status(&self, provider: &str) -> Vec<KeyStatus> {
        let now = Utc::now();
        let keys = self.pool_keys(provider).await;
        let state = self.state.lock().await;

        keys.iter()
            .map(|k| {
                let until = [k.cooldown_until, state.key_cooldowns.get(&k.id).copied()]
                    .into_iter()
                    .flatten()
                    .max();
                KeyStatus {
                    id: k.id.clone(),
                    priority: k.priority,
                    weight: k.weight(),
                    requests_today: k.requests_today,
                    rate_limit_hits: k.rate_limit_hits,
                    cooldown_remaining: until
                        .filter(|u| *u > now)
                        .and_then(|u| (u - now).to_std().ok()),
                }
            })
            .collect()
    }

    /// Forget cached pool rows so the next selection reloads them.
    pub async fn refresh(&self, provider: &str) {
        self.state.lock().await.cache.remove(provider);
    }

    /// Wait for queued usage and cooldown writes to land.
    pub async fn flush_writes(&self) {
        self.writer.sync().await;
    }

    async fn pool_keys(&self, provider: &str) -> Vec<ApiKey> {
        {
            let state = self.state.lock().await;
            if let Some(cached) = state.cache.get(provider) {
                if cached.loaded_at.elapsed() < self.settings.cache_ttl {
                    return cached.keys.clone();
                }
            }
        }

        match self.store.active_keys(provider).await {
            Ok(keys) => {
                let mut state = self.state.lock().await;
                state.cache.insert(
                    provider.to_string(),
                    CachedKeys {
                        keys: keys.clone(),
                        loaded_at: Instant::now(),
                    },
                );
                keys
            }
            Err(e) => {
                warn!(provider, error = %e, "Failed to load pool keys, using cached rows");
                let state = self.state.lock().await;
                state
                    .cache
                    .get(provider)
                    .map(|c| c.keys.clone())
                    .unwrap_or_default()
            }
        }
    }

    async fn tenant_key(&self, tenant_id: &str, provider: &str) -> Option<TenantKey> {
        let cache_key = (tenant_id.to_string(), provider.to_string());
        {
            let state = self.state.lock().await;
            if let Some(cached) = state.tenants.get(&cache_key) {
                if cached.loaded_at.elapsed() < self.settings.cache_ttl {
                    return cached.key.clone();
                }
            }
        }

        match self.store.tenant_key(tenant_id, provider).await {
            Ok(key) => {
                let mut state = self.state.lock().await;
                state.tenants.insert(
                    cache_key,
                    CachedTenant {
                        key: key.clone(),
                        loaded_at: Instant::now(),
                    },
                );
                key
            }
            Err(e) => {
                warn!(tenant = tenant_id, provider, error = %e, "Failed to load tenant key");
                let state = self.state.lock().await;
                state.tenants.get(&cache_key).and_then(|c| c.key.clone())
            }
        }
    }
}

/// Mirror the usage write in the cached row so status reads stay current.
fn note_usage(state: &mut PoolState, provider: &str, key_id: &str, now: DateTime<Utc>) {
    let today = now.date_naive();
    if let Some(key) = state
        .cache
        .get_mut(provider)
        .and_then(|c| c.keys.iter_mut().find(|k| k.id == key_id))
    {
        if key.last_request_date == Some(today) {
            key.requests_today += 1;
        } else {
            key.requests_today = 1;
            key.last_request_date = Some(today);
        }
    }
}
