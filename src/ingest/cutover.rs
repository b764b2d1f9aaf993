//! Routing between the queued core path and inline processing
//!
//! Producers routed to the core have their events enqueued for the worker
//! pool; everyone else is processed inline on the request.

use std::collections::BTreeSet;
use std::fmt;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CutoverStrategy {
    AlwaysCore,
    NeverCore,
    /// Only the listed actors use the core
    AllowList(BTreeSet<String>),
    /// Actors whose bucket (0-99) falls below `percent`
    PercentRollout { percent: u8, salt: String },
}

impl Default for CutoverStrategy {
    fn default() -> Self {
        Self::AlwaysCore
    }
}

impl CutoverStrategy {
    pub fn should_route_to_core(&self, actor: &str) -> bool {
        match self {
            Self::AlwaysCore => true,
            Self::NeverCore => false,
            Self::AllowList(actors) => actors.contains(actor),
            Self::PercentRollout { percent, salt } => bucket(salt, actor) < *percent,
        }
    }

    /// Build from `CUTOVER_STRATEGY` and its companion settings
    pub fn parse(
        strategy: &str,
        percent: Option<&str>,
        salt: Option<&str>,
        allow_list: Option<&str>,
    ) -> Result<Self, String> {
        match strategy.trim().to_ascii_lowercase().as_str() {
            "" | "always" | "always_core" | "core" => Ok(Self::AlwaysCore),
            "never" | "never_core" | "inline" => Ok(Self::NeverCore),
            "allowlist" | "allow_list" => {
                let actors: BTreeSet<String> = allow_list
                    .unwrap_or_default()
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                Ok(Self::AllowList(actors))
            }
            "percent" | "percent_rollout" => {
                let percent: u8 = percent
                    .unwrap_or("0")
                    .trim()
                    .parse()
                    .map_err(|_| "CUTOVER_PERCENT must be an integer 0-100".to_string())?;
                if percent > 100 {
                    return Err("CUTOVER_PERCENT must be an integer 0-100".to_string());
                }
                Ok(Self::PercentRollout {
                    percent,
                    salt: salt.unwrap_or("booking-ingest").to_string(),
                })
            }
            other => Err(format!("unknown cutover strategy: {other}")),
        }
    }
}

impl fmt::Display for CutoverStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlwaysCore => write!(f, "always_core"),
            Self::NeverCore => write!(f, "never_core"),
            Self::AllowList(actors) => write!(f, "allow_list({})", actors.len()),
            Self::PercentRollout { percent, .. } => write!(f, "percent_rollout({percent}%)"),
        }
    }
}

/// Deterministic 0-99 bucket for `actor` under `salt`
pub fn bucket(salt: &str, actor: &str) -> u8 {
    let digest = Sha256::digest(format!("{salt}:{actor}").as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}
