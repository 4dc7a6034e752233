//! Caller identity and per-source access control.
//!
//! Every agent is bound to at most one source. The binding comes from the
//! `[access.agents]` table, overlaid by a JSON object in
//! `SHADOW_SYNC_AGENT_MAPPING` (`{"agent-id": "source-id"}`). A caller with
//! no binding is refused unless `unrestricted_dev_mode` is on.

use std::collections::HashMap;

use axum::http::HeaderMap;
use serde::Serialize;

use crate::config::AccessConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::CallerIdentity;
use crate::registry::{DiscoverySnapshot, ShadowTarget};

pub const MAPPING_ENV: &str = "SHADOW_SYNC_AGENT_MAPPING";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Restricted,
    UnrestrictedDev,
}

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    agents: HashMap<String, String>,
    default_agent: Option<String>,
    dev_mode: bool,
    id_header: String,
    name_header: String,
}

impl AccessPolicy {
    /// Build from config plus the mapping environment variable.
    pub fn from_config(config: &AccessConfig) -> SyncResult<Self> {
        let overrides = std::env::var(MAPPING_ENV).ok();
        Self::with_overrides(config, overrides.as_deref())
    }

    pub fn with_overrides(config: &AccessConfig, mapping_json: Option<&str>) -> SyncResult<Self> {
        let mut agents = config.agents.clone();

        if let Some(raw) = mapping_json.filter(|s| !s.trim().is_empty()) {
            let extra: HashMap<String, String> = serde_json::from_str(raw).map_err(|e| {
                SyncError::Configuration(format!("{} is not a JSON string map: {}", MAPPING_ENV, e))
            })?;
            agents.extend(extra);
        }

        Ok(Self {
            agents,
            default_agent: config.default_agent.clone().filter(|a| !a.is_empty()),
            dev_mode: config.unrestricted_dev_mode,
            id_header: config.id_header.to_ascii_lowercase(),
            name_header: config.name_header.to_ascii_lowercase(),
        })
    }

    pub fn mode(&self) -> AccessMode {
        if self.dev_mode {
            AccessMode::UnrestrictedDev
        } else {
            AccessMode::Restricted
        }
    }

    /// Identity from request headers, falling back to the process default.
    pub fn resolve_identity(&self, headers: &HeaderMap) -> CallerIdentity {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        self.identity_for(header(&self.id_header), header(&self.name_header))
    }

    pub fn identity_for(&self, agent_id: Option<&str>, name: Option<&str>) -> CallerIdentity {
        let id = agent_id
            .map(str::to_string)
            .or_else(|| self.default_agent.clone());
        let allowed_source = id.as_ref().and_then(|id| self.agents.get(id)).cloned();

        CallerIdentity {
            id,
            name: name.map(str::to_string),
            allowed_source,
        }
    }

    /// The discovered target the caller is bound to, if any.
    pub fn allowed_target<'a>(
        &self,
        caller: &CallerIdentity,
        snapshot: &'a DiscoverySnapshot,
    ) -> Option<&'a ShadowTarget> {
        snapshot.resolve(caller.allowed_source.as_deref()?)
    }

    /// Resolve `requested` (source id, title, or shadow database name) to a
    /// target and check it against the caller's binding.
    ///
    /// Both the request and the binding go through
    /// [`DiscoverySnapshot::resolve`], and the two targets must share a source
    /// id. A bound caller asking for anything else, including a name that
    /// resolves to nothing, is denied. `Ok(None)` is only returned to
    /// unrestricted callers and means the name is unknown.
    pub fn authorize<'a>(
        &self,
        caller: &CallerIdentity,
        requested: &str,
        snapshot: &'a DiscoverySnapshot,
    ) -> SyncResult<Option<&'a ShadowTarget>> {
        let target = snapshot.resolve(requested);

        match &caller.allowed_source {
            Some(_) => match (self.allowed_target(caller, snapshot), target) {
                (Some(allowed), Some(target)) if allowed.source.id == target.source.id => {
                    Ok(Some(target))
                }
                _ => Err(SyncError::AccessDenied(format!(
                    "agent '{}' may not read '{}'",
                    caller.id.as_deref().unwrap_or("unknown"),
                    requested
                ))),
            },
            None if self.dev_mode => Ok(target),
            None => Err(SyncError::AccessDenied(match &caller.id {
                Some(id) => format!("no source configured for agent '{}'", id),
                None => "caller identity could not be resolved".to_string(),
            })),
        }
    }

    /// Whether `target` shows up in the caller's listings.
    pub fn visible(
        &self,
        caller: &CallerIdentity,
        target: &ShadowTarget,
        snapshot: &DiscoverySnapshot,
    ) -> bool {
        match &caller.allowed_source {
            Some(_) => self
                .allowed_target(caller, snapshot)
                .is_some_and(|allowed| allowed.source.id == target.source.id),
            None => self.dev_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;
    use axum::http::HeaderValue;

    fn config(dev: bool) -> AccessConfig {
        let mut config = AccessConfig::default();
        config.unrestricted_dev_mode = dev;
        config.agents.insert("sales-bot".into(), "p_sales".into());
        config
    }

    fn snapshot() -> DiscoverySnapshot {
        let target = |id: &str, title: &str| ShadowTarget {
            source: Source {
                id: id.into(),
                title: title.into(),
                connection: None,
            },
            database: format!("shadow_{}", title.to_lowercase()),
            tables: Vec::new(),
        };
        DiscoverySnapshot::new(vec![target("p_sales", "Sales"), target("p_hr", "HR")])
    }

    #[test]
    fn test_identity_from_headers() {
        let policy = AccessPolicy::with_overrides(&config(false), None).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-agent-id", HeaderValue::from_static("sales-bot"));
        headers.insert("x-agent-name", HeaderValue::from_static("Sales Bot"));

        let caller = policy.resolve_identity(&headers);
        assert_eq!(caller.id.as_deref(), Some("sales-bot"));
        assert_eq!(caller.name.as_deref(), Some("Sales Bot"));
        assert_eq!(caller.allowed_source.as_deref(), Some("p_sales"));
    }

    #[test]
    fn test_default_agent_fallback() {
        let mut cfg = config(false);
        cfg.default_agent = Some("sales-bot".into());
        let policy = AccessPolicy::with_overrides(&cfg, None).unwrap();
        let caller = policy.resolve_identity(&HeaderMap::new());
        assert_eq!(caller.allowed_source.as_deref(), Some("p_sales"));
    }

    #[test]
    fn test_env_mapping_overrides_config() {
        let policy =
            AccessPolicy::with_overrides(&config(false), Some(r#"{"sales-bot": "p_hr"}"#)).unwrap();
        let caller = policy.identity_for(Some("sales-bot"), None);
        assert_eq!(caller.allowed_source.as_deref(), Some("p_hr"));

        assert!(AccessPolicy::with_overrides(&config(false), Some("[1, 2]")).is_err());
    }

    #[test]
    fn test_authorize_accepts_any_name_of_allowed_source() {
        let policy = AccessPolicy::with_overrides(&config(false), None).unwrap();
        let caller = policy.identity_for(Some("sales-bot"), None);
        let snap = snapshot();

        for name in ["p_sales", "Sales", "shadow_sales"] {
            let target = policy.authorize(&caller, name, &snap).unwrap().unwrap();
            assert_eq!(target.source.id, "p_sales");
        }
        let err = policy.authorize(&caller, "shadow_hr", &snap).unwrap_err();
        assert_eq!(err.code(), "access_denied");
        let err = policy.authorize(&caller, "shadow_nowhere", &snap).unwrap_err();
        assert_eq!(err.code(), "access_denied");
    }

    #[test]
    fn test_title_shadowing_another_id_is_denied() {
        let target = |id: &str, title: &str, database: &str| ShadowTarget {
            source: Source {
                id: id.into(),
                title: title.into(),
                connection: None,
            },
            database: database.into(),
            tables: Vec::new(),
        };
        // The sales base is titled with the HR base's id.
        let snap = DiscoverySnapshot::new(vec![
            target("p_sales", "p_hr", "shadow_p_hr"),
            target("p_hr", "HR", "shadow_hr"),
        ]);
        let policy = AccessPolicy::with_overrides(&config(false), None).unwrap();
        let sales = policy.identity_for(Some("sales-bot"), None);

        let err = policy.authorize(&sales, "p_hr", &snap).unwrap_err();
        assert_eq!(err.code(), "access_denied");
        assert!(policy.authorize(&sales, "shadow_p_hr", &snap).is_ok());
        assert!(policy.visible(&sales, &snap.targets[0], &snap));
        assert!(!policy.visible(&sales, &snap.targets[1], &snap));
    }

    #[test]
    fn test_unbound_caller_needs_dev_mode() {
        let snap = snapshot();
        let strict = AccessPolicy::with_overrides(&config(false), None).unwrap();
        let anonymous = strict.identity_for(None, None);
        assert!(strict.authorize(&anonymous, "p_hr", &snap).is_err());
        assert!(!strict.visible(&anonymous, &snap.targets[0], &snap));

        let dev = AccessPolicy::with_overrides(&config(true), None).unwrap();
        assert!(dev.authorize(&anonymous, "p_hr", &snap).unwrap().is_some());
        assert!(dev.authorize(&anonymous, "p_nowhere", &snap).unwrap().is_none());
        assert!(dev.visible(&anonymous, &snap.targets[1], &snap));
        assert_eq!(dev.mode(), AccessMode::UnrestrictedDev);
    }
}
