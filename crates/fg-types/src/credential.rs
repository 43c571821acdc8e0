use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::KeyTier;

/// Shared-pool API credential row.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub provider: String,
    #[serde(skip_serializing)]
    pub secret: String,
    /// Higher priority keys get proportionally more turns (weight = priority + 1).
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requests_today: i64,
    #[serde(default)]
    pub last_request_date: Option<NaiveDate>,
    #[serde(default)]
    pub rate_limit_hits: i64,
}

fn default_active() -> bool {
    true
}

impl ApiKey {
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        secret: impl Into<String>,
        priority: u32,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            secret: secret.into(),
            priority,
            is_active: true,
            cooldown_until: None,
            requests_today: 0,
            last_request_date: None,
            rate_limit_hits: 0,
        }
    }

    /// Selection weight in the rotation.
    pub fn weight(&self) -> u64 {
        u64::from(self.priority) + 1
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("secret", &redact(&self.secret))
            .field("priority", &self.priority)
            .field("is_active", &self.is_active)
            .field("cooldown_until", &self.cooldown_until)
            .field("requests_today", &self.requests_today)
            .finish()
    }
}

/// Credential dedicated to a single tenant.
#[derive(Clone, Serialize, Deserialize)]
pub struct TenantKey {
    pub tenant_id: String,
    pub provider: String,
    #[serde(skip_serializing)]
    pub secret: String,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantKey")
            .field("tenant_id", &self.tenant_id)
            .field("provider", &self.provider)
            .field("secret", &redact(&self.secret))
            .field("cooldown_until", &self.cooldown_until)
            .finish()
    }
}

/// Identity of the credential used for a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyId {
    Tenant(String),
    Pool(String),
    Fallback,
}

impl KeyId {
    pub fn tier(&self) -> KeyTier {
        match self {
            Self::Tenant(_) => KeyTier::Tenant,
            Self::Pool(_) => KeyTier::Pool,
            Self::Fallback => KeyTier::Fallback,
        }
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tenant(tenant) => write!(f, "tenant:{tenant}"),
            Self::Pool(id) => write!(f, "pool:{id}"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Credential handed out for one call.
#[derive(Clone, PartialEq, Eq)]
pub struct SelectedKey {
    pub secret: String,
    pub id: KeyId,
    pub tier: KeyTier,
    /// Only ever true for the fallback tier.
    pub on_cooldown: bool,
}

impl std::fmt::Debug for SelectedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedKey")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("secret", &redact(&self.secret))
            .field("on_cooldown", &self.on_cooldown)
            .finish()
    }
}

/// Keep the last four characters of a secret for log correlation.
pub fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn weight_is_priority_plus_one() {
        assert_eq!(ApiKey::new("k0", "anthropic", "s", 0).weight(), 1);
        assert_eq!(ApiKey::new("k2", "anthropic", "s", 2).weight(), 3);
    }

    #[test]
    fn cooling_down_only_in_future() {
        let now = Utc::now();
        let mut key = ApiKey::new("k", "anthropic", "s", 0);
        assert!(!key.is_cooling_down(now));

        key.cooldown_until = Some(now + Duration::seconds(30));
        assert!(key.is_cooling_down(now));

        key.cooldown_until = Some(now - Duration::seconds(1));
        assert!(!key.is_cooling_down(now));
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let key = ApiKey::new("k", "anthropic", "sk-ant-very-secret-1234", 0);
        let dbg = format!("{key:?}");
        assert!(!dbg.contains("very-secret"));
        assert!(dbg.contains("****1234"));
    }

    #[test]
    fn secret_not_serialized() {
        let key = ApiKey::new("k", "anthropic", "sk-secret", 1);
        let json = serde_json::to_string(&key).unwrap();
        assert!(!json.contains("sk-secret"));
    }

    #[test]
    fn key_id_display_and_tier() {
        assert_eq!(KeyId::Tenant("acme".into()).to_string(), "tenant:acme");
        assert_eq!(KeyId::Pool("k1".into()).to_string(), "pool:k1");
        assert_eq!(KeyId::Fallback.to_string(), "fallback");
        assert_eq!(KeyId::Pool("k1".into()).tier(), KeyTier::Pool);
    }

    #[test]
    fn redact_short_secrets() {
        assert_eq!(redact("abc"), "****");
        assert_eq!(redact("abcdefgh"), "****efgh");
    }
}
