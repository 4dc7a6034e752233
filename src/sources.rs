//! Source discovery and eligibility.
//!
//! Decides which of the source system's bases get a shadow. Used by the sync
//! orchestrator and by the `shadowctl sources` command.
//!
//! # Policy
//!
//! Checked in order; the first matching rule wins:
//!
//! | Rule | Verdict |
//! |------|---------|
//! | title starts with the mirror prefix (a shadow registered back) | exclude |
//! | title is a reserved/system name (case-insensitive) | exclude |
//! | connection host is local (`localhost`, loopback, `*.local`, `*.internal`, single-label hostname) | exclude |
//! | connection host is anything else (IP literal, dotted domain) | include |
//! | no external connection (native to the source system) | include |

use std::net::IpAddr;

use serde::Serialize;

use crate::config::Config;
use crate::error::SyncResult;
use crate::models::Source;
use crate::source::SourceSystem;
use crate::store::database_name;

/// Eligibility status of a single source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub title: String,
    pub eligible: bool,
    pub reason: String,
    /// Shadow database the source maps to.
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct EligibilityPolicy {
    title_prefix: String,
    reserved: Vec<String>,
}

impl EligibilityPolicy {
    pub fn new(title_prefix: impl Into<String>, reserved: &[String]) -> Self {
        Self {
            title_prefix: title_prefix.into(),
            reserved: reserved.iter().map(|r| r.trim().to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.mirror.title_prefix.clone(), &config.sync.reserved_names)
    }

    /// `(eligible, reason)`.
    pub fn evaluate(&self, source: &Source) -> (bool, String) {
        let title = source.title.trim();

        if !self.title_prefix.is_empty() && title.starts_with(self.title_prefix.as_str()) {
            return (false, "already a shadow mirror".to_string());
        }

        if self.reserved.contains(&title.to_lowercase()) {
            return (false, "reserved system name".to_string());
        }

        match &source.connection {
            Some(target) if is_local_host(&target.host) => (
                false,
                format!("connection targets local host '{}'", target.host),
            ),
            Some(target) => (true, format!("external database at '{}'", target.host)),
            None => (true, "native base".to_string()),
        }
    }
}

/// Same-network / local-host heuristic for connection targets.
pub fn is_local_host(host: &str) -> bool {
    let host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase();

    if host.is_empty() {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    if host == "localhost"
        || host.ends_with(".localhost")
        || host.ends_with(".local")
        || host.ends_with(".internal")
    {
        return true;
    }

    // Bare container/service names ("postgres", "shadow-db").
    !host.contains('.')
}

/// Status of every source the source system reports.
pub async fn get_sources(
    system: &dyn SourceSystem,
    policy: &EligibilityPolicy,
    database_prefix: &str,
) -> SyncResult<Vec<SourceStatus>> {
    let sources = system.list_sources().await?;
    Ok(sources
        .iter()
        .map(|source| {
            let (eligible, reason) = policy.evaluate(source);
            SourceStatus {
                id: source.id.clone(),
                title: source.title.clone(),
                eligible,
                reason,
                database: database_name(database_prefix, &source.title),
            }
        })
        .collect())
}

/// Sources that should be shadowed, together with the full source list
/// (needed for mirror de-duplication).
pub async fn eligible_sources(
    system: &dyn SourceSystem,
    policy: &EligibilityPolicy,
) -> SyncResult<(Vec<Source>, Vec<Source>)> {
    let all = system.list_sources().await?;
    let eligible = all
        .iter()
        .filter(|s| policy.evaluate(s).0)
        .cloned()
        .collect();
    Ok((eligible, all))
}

/// Print the eligibility table for `shadowctl sources`.
pub async fn list_sources(config: &Config, system: &dyn SourceSystem) -> anyhow::Result<()> {
    let policy = EligibilityPolicy::from_config(config);
    let statuses = get_sources(system, &policy, &config.shadow.database_prefix).await?;

    println!(
        "{:<24} {:<28} {:<9} {:<32} REASON",
        "ID", "TITLE", "ELIGIBLE", "DATABASE"
    );
    for s in statuses {
        println!(
            "{:<24} {:<28} {:<9} {:<32} {}",
            s.id, s.title, s.eligible, s.database, s.reason
        );
    }

    Ok(())
}
