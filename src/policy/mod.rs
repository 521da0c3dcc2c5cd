//! Resource Policy (C3): resolves a user's tier into the resource/security
//! bundle C2 hands to C1 at container-create time.
//!
//! Pure and static, the same way the old daemon's [`ResourceLimits`]/
//! [`BuildConfig`] defaults were pure data with no side effects — the only
//! difference is the table is keyed by tier instead of read from the panel.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::docker::traits::{ResourceLimits, SecurityOptions};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("override widens limit: {0}")]
    OverrideWidensLimit(&'static str),
    #[error("unknown tier: {0}")]
    UnknownTier(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn parse(s: &str) -> Result<Self, PolicyError> {
        match s {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(PolicyError::UnknownTier(other.to_string())),
        }
    }
}

const GIB: i64 = 1024 * 1024 * 1024;
const CPU_PERIOD: i64 = 100_000;

/// A caller-supplied narrowing of a tier's default bundle. Any field left
/// `None` falls back to the tier default; any field set must not exceed it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceOverride {
    #[serde(default)]
    pub memory_bytes: Option<i64>,
    #[serde(default)]
    pub cpu_quota: Option<i64>,
}

fn tier_limits(tier: Tier) -> ResourceLimits {
    match tier {
        Tier::Free => ResourceLimits {
            memory_bytes: GIB,
            cpu_quota: CPU_PERIOD / 2,
            cpu_period: CPU_PERIOD,
            pids_limit: 256,
        },
        Tier::Pro => ResourceLimits {
            memory_bytes: 4 * GIB,
            cpu_quota: CPU_PERIOD * 2,
            cpu_period: CPU_PERIOD,
            pids_limit: 512,
        },
        Tier::Enterprise => ResourceLimits {
            memory_bytes: 8 * GIB,
            cpu_quota: CPU_PERIOD * 4,
            cpu_period: CPU_PERIOD,
            pids_limit: 1024,
        },
    }
}

/// Profile paths/names are read from configuration and are identical across
/// tiers — the tier only governs the numeric limits.
#[derive(Debug, Clone, Default)]
pub struct SecurityProfile {
    pub seccomp_profile: Option<PathBuf>,
    pub apparmor_profile: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResourceBundle {
    pub limits: ResourceLimits,
    pub security: SecurityOptions,
}

pub struct ResourcePolicy {
    profile: SecurityProfile,
}

impl ResourcePolicy {
    pub fn new(profile: SecurityProfile) -> Self {
        Self { profile }
    }

    /// Resolves `tier`, applying `overrides` if present. Overrides may only
    /// narrow the tier's default bundle, never widen it.
    pub fn resolve(
        &self,
        tier: Tier,
        overrides: &ResourceOverride,
    ) -> Result<ResourceBundle, PolicyError> {
        let mut limits = tier_limits(tier);

        if let Some(mem) = overrides.memory_bytes {
            if mem > limits.memory_bytes {
                return Err(PolicyError::OverrideWidensLimit("memory_bytes"));
            }
            limits.memory_bytes = mem;
        }

        if let Some(cpu) = overrides.cpu_quota {
            if cpu > limits.cpu_quota {
                return Err(PolicyError::OverrideWidensLimit("cpu_quota"));
            }
            limits.cpu_quota = cpu;
        }

        let security = SecurityOptions {
            seccomp_profile: self.profile.seccomp_profile.clone(),
            apparmor_profile: self.profile.apparmor_profile.clone(),
            no_new_privileges: true,
            cap_drop: Vec::new(),
        };

        Ok(ResourceBundle { limits, security })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ResourcePolicy {
        ResourcePolicy::new(SecurityProfile {
            seccomp_profile: Some(PathBuf::from("/etc/warden/seccomp.json")),
            apparmor_profile: Some("warden-agent".to_string()),
        })
    }

    #[test]
    fn resolves_each_tier_to_its_documented_bundle() {
        let p = policy();

        let free = p.resolve(Tier::Free, &ResourceOverride::default()).unwrap();
        assert_eq!(free.limits.memory_bytes, GIB);
        assert_eq!(free.limits.cpu_quota, CPU_PERIOD / 2);

        let pro = p.resolve(Tier::Pro, &ResourceOverride::default()).unwrap();
        assert_eq!(pro.limits.memory_bytes, 4 * GIB);
        assert_eq!(pro.limits.cpu_quota, 2 * CPU_PERIOD);

        let ent = p.resolve(Tier::Enterprise, &ResourceOverride::default()).unwrap();
        assert_eq!(ent.limits.memory_bytes, 8 * GIB);
        assert_eq!(ent.limits.cpu_quota, 4 * CPU_PERIOD);
    }

    #[test]
    fn override_may_narrow() {
        let p = policy();
        let overrides = ResourceOverride { memory_bytes: Some(512 * 1024 * 1024), cpu_quota: None };
        let bundle = p.resolve(Tier::Free, &overrides).unwrap();
        assert_eq!(bundle.limits.memory_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn override_cannot_widen() {
        let p = policy();
        let overrides = ResourceOverride { memory_bytes: Some(2 * GIB), cpu_quota: None };
        let err = p.resolve(Tier::Free, &overrides).unwrap_err();
        assert_eq!(err, PolicyError::OverrideWidensLimit("memory_bytes"));
    }

    #[test]
    fn unknown_tier_string_is_rejected() {
        assert!(matches!(Tier::parse("legendary"), Err(PolicyError::UnknownTier(_))));
    }
}
