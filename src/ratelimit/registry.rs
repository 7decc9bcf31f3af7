//! Preconfigured limiters.
//!
//! The registry is a static table: every row names a limiter and its
//! development and production numbers. Configuration may override individual
//! rows; the result is validated once, at startup.
//!
//! Each limiter scopes its counter keys by its own name, so a client's traffic
//! on one limiter never spends another limiter's budget.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::policy::{Policy, SkipRule};
use crate::config::{Environment, PolicyOverride};
use crate::error::{Result, TollgateError};

/// Path every preconfigured limiter leaves uncounted.
pub const HEALTH_PATH: &str = "/health";

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Names of the preconfigured limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterKind {
    General,
    Auth,
    Upload,
    Write,
    Strict,
    Email,
}

impl LimiterKind {
    pub const ALL: [LimiterKind; 6] = [
        LimiterKind::General,
        LimiterKind::Auth,
        LimiterKind::Upload,
        LimiterKind::Write,
        LimiterKind::Strict,
        LimiterKind::Email,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::General => "general",
            LimiterKind::Auth => "auth",
            LimiterKind::Upload => "upload",
            LimiterKind::Write => "write",
            LimiterKind::Strict => "strict",
            LimiterKind::Email => "email",
        }
    }
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimiterKind {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        LimiterKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TollgateError::Config(format!("unknown limiter '{}'", s)))
    }
}

/// One row of the limiter table.
#[derive(Debug, Clone, Copy)]
pub struct PolicySpec {
    pub kind: LimiterKind,
    pub development_limit: u64,
    pub production_limit: u64,
    pub window_ms: u64,
    pub message: &'static str,
}

impl PolicySpec {
    pub fn limit_for(&self, environment: Environment) -> u64 {
        match environment {
            Environment::Development => self.development_limit,
            Environment::Production => self.production_limit,
        }
    }
}

pub const POLICY_TABLE: [PolicySpec; 6] = [
    PolicySpec {
        kind: LimiterKind::General,
        development_limit: 1000,
        production_limit: 100,
        window_ms: 15 * MINUTE_MS,
        message: "Too many requests from this client, please try again later.",
    },
    PolicySpec {
        kind: LimiterKind::Auth,
        development_limit: 50,
        production_limit: 5,
        window_ms: 15 * MINUTE_MS,
        message: "Too many authentication attempts, please try again later.",
    },
    PolicySpec {
        kind: LimiterKind::Upload,
        development_limit: 50,
        production_limit: 20,
        window_ms: HOUR_MS,
        message: "Too many uploads, please try again later.",
    },
    PolicySpec {
        kind: LimiterKind::Write,
        development_limit: 300,
        production_limit: 60,
        window_ms: MINUTE_MS,
        message: "Too many write operations, please slow down.",
    },
    PolicySpec {
        kind: LimiterKind::Strict,
        development_limit: 10,
        production_limit: 3,
        window_ms: HOUR_MS,
        message: "Too many attempts for this sensitive operation, please try again later.",
    },
    PolicySpec {
        kind: LimiterKind::Email,
        development_limit: 20,
        production_limit: 3,
        window_ms: HOUR_MS,
        message: "Too many email requests, please try again later.",
    },
];

/// The preconfigured limiters for one environment.
#[derive(Debug, Clone)]
pub struct Registry {
    environment: Environment,
    policies: HashMap<LimiterKind, Arc<Policy>>,
}

impl Registry {
    /// Build the registry straight from [`POLICY_TABLE`].
    pub fn for_environment(environment: Environment) -> Result<Self> {
        Self::with_overrides(environment, &HashMap::new())
    }

    /// Build the registry, replacing table values with any matching override.
    pub fn with_overrides(
        environment: Environment,
        overrides: &HashMap<String, PolicyOverride>,
    ) -> Result<Self> {
        for name in overrides.keys() {
            name.parse::<LimiterKind>()?;
        }

        let mut policies = HashMap::with_capacity(POLICY_TABLE.len());
        for row in POLICY_TABLE.iter() {
            let policy = match overrides.get(row.kind.as_str()) {
                Some(over) => {
                    info!(limiter = %row.kind, ?over, "Applying limiter override");
                    build_policy(row, environment, Some(over))?
                }
                None => build_policy(row, environment, None)?,
            };
            policies.insert(row.kind, Arc::new(policy));
        }

        Ok(Self {
            environment,
            policies,
        })
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn get(&self, kind: LimiterKind) -> Arc<Policy> {
        // Every kind has a table row, so construction always fills the map.
        self.policies[&kind].clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LimiterKind, &Arc<Policy>)> {
        LimiterKind::ALL
            .iter()
            .filter_map(move |kind| self.policies.get(kind).map(|p| (*kind, p)))
    }
}

fn build_policy(
    row: &PolicySpec,
    environment: Environment,
    over: Option<&PolicyOverride>,
) -> Result<Policy> {
    let limit = over
        .and_then(|o| o.limit)
        .unwrap_or_else(|| row.limit_for(environment));
    let window_ms = over.and_then(|o| o.window_ms).unwrap_or(row.window_ms);
    let message = over
        .and_then(|o| o.message.clone())
        .unwrap_or_else(|| row.message.to_string());
    let skip = match over.and_then(|o| o.skip_paths.as_ref()) {
        Some(paths) => paths.iter().cloned().map(SkipRule::Path).collect(),
        None => vec![SkipRule::Path(HEALTH_PATH.to_string())],
    };

    Ok(Policy::new(row.kind.as_str(), limit, Duration::from_millis(window_ms), message)?
        .with_scope(row.kind.as_str())
        .with_skip(skip))
}
