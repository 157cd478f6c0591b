//! Projects, rules and the store interface consulted on every admission check.
//!
//! The admission path only needs two exact-match lookups, captured by
//! [`RuleStore`]. Anything that can answer them (a SQL database, a remote
//! configuration service, the bundled [`InMemoryStore`]) can back the resolver.

mod memory;

pub use memory::{InMemoryStore, ProjectSeed, SeedFile};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Internal project identifier.
pub type ProjectId = u64;

/// Internal rule identifier.
pub type RuleId = u64;

/// Errors raised by a project/rule store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or failed mid-query.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The lookup did not complete within the allotted time.
    #[error("store lookup timed out after {0:?}")]
    Timeout(Duration),

    /// A project or rule failed validation.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The API key is already issued to another project.
    #[error("API key already in use")]
    DuplicateApiKey,

    /// The project already has a rule for this endpoint.
    #[error("project {project_id} already has a rule for endpoint {endpoint}")]
    DuplicateRule {
        project_id: ProjectId,
        endpoint: String,
    },

    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),

    #[error("rule {0} not found")]
    RuleNotFound(RuleId),

    /// A seed file could not be read or parsed.
    #[error("failed to load seed data: {0}")]
    Seed(String),
}

/// A tenant project, identified externally by its API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Issued once and never changed.
    pub api_key: String,
    pub created_at: DateTime<Utc>,
}

/// Counting algorithm requested by a rule.
///
/// Opaque to the admission path; it is handed to the limiter engine as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

/// Which part of a request discriminates callers within a tenant's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyBy {
    ApiKey,
    Ip,
    UserId,
    Token,
}

impl KeyBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyBy::ApiKey => "api_key",
            KeyBy::Ip => "ip",
            KeyBy::UserId => "user_id",
            KeyBy::Token => "token",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Strategy::FixedWindow => "fixed_window",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::TokenBucket => "token_bucket",
        };
        f.write_str(tag)
    }
}

impl fmt::Display for KeyBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The writable fields of a rule, as supplied on create and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Endpoint this rule covers, matched exactly
    pub endpoint: String,
    pub strategy: Strategy,
    pub key_by: KeyBy,
    /// Requests allowed per window
    pub limit: u64,
    pub window_seconds: u64,
}

impl RuleSpec {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.endpoint.is_empty() {
            return Err(StoreError::Validation("endpoint must not be empty".into()));
        }
        if self.limit == 0 {
            return Err(StoreError::Validation("limit must be positive".into()));
        }
        if self.window_seconds == 0 {
            return Err(StoreError::Validation("window_seconds must be positive".into()));
        }
        Ok(())
    }
}

/// A rate limit rule binding one endpoint of a project to a quota.
///
/// At most one rule exists per `(project_id, endpoint)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub id: RuleId,
    pub project_id: ProjectId,
    pub endpoint: String,
    pub strategy: Strategy,
    pub key_by: KeyBy,
    pub limit: u64,
    pub window: Duration,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    pub(crate) fn from_spec(
        id: RuleId,
        project_id: ProjectId,
        spec: RuleSpec,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            project_id,
            endpoint: spec.endpoint,
            strategy: spec.strategy,
            key_by: spec.key_by,
            limit: spec.limit,
            window: Duration::from_secs(spec.window_seconds),
            created_at,
        }
    }
}

/// Exact-match lookups needed to resolve an admission check.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Find the project owning `api_key`. Comparison is case-sensitive.
    async fn find_project_id_by_api_key(&self, api_key: &str)
        -> Result<Option<ProjectId>, StoreError>;

    /// Find the rule for exactly `endpoint` within a project.
    async fn find_rule(
        &self,
        project_id: ProjectId,
        endpoint: &str,
    ) -> Result<Option<Rule>, StoreError>;
}
