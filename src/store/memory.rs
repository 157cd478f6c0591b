//! In-process project and rule store.
//!
//! Holds projects and rules in memory, issues API keys, and can be seeded
//! from a YAML file at startup:
//!
//! ```yaml
//! projects:
//!   - name: storefront
//!     api_key: 3f9c...        # optional, generated when absent
//!     rules:
//!       - endpoint: /v1/checkout
//!         strategy: fixed_window
//!         key_by: ip
//!         limit: 100
//!         window_seconds: 60
//! ```

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use std::path::Path;
use tracing::{debug, info};

use super::{Project, ProjectId, Rule, RuleId, RuleSpec, RuleStore, StoreError};

/// Length of an issued API key in bytes (256 bits).
const API_KEY_BYTES: usize = 32;

/// Top-level layout of a seed file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub projects: Vec<ProjectSeed>,
}

/// A project and its rules as written in a seed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSeed {
    pub name: String,
    /// Fixed API key. A fresh key is issued when omitted.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Default)]
struct State {
    projects: HashMap<ProjectId, Project>,
    by_api_key: HashMap<String, ProjectId>,
    rules: HashMap<RuleId, Rule>,
    by_endpoint: HashMap<(ProjectId, String), RuleId>,
    next_project_id: ProjectId,
    next_rule_id: RuleId,
}

impl State {
    fn project_exists(&self, project_id: ProjectId) -> Result<(), StoreError> {
        if self.projects.contains_key(&project_id) {
            Ok(())
        } else {
            Err(StoreError::ProjectNotFound(project_id))
        }
    }
}

/// A thread-safe in-memory [`RuleStore`] with explicit project and rule
/// management.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a YAML seed file.
    pub fn from_seed_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading project seed file");

        let contents = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Seed(format!("{}: {}", path.display(), e)))?;
        Self::from_seed_yaml(&contents)
    }

    /// Load a store from a YAML seed document.
    pub fn from_seed_yaml(yaml: &str) -> Result<Self, StoreError> {
        let seed: SeedFile =
            serde_yaml::from_str(yaml).map_err(|e| StoreError::Seed(e.to_string()))?;

        let store = Self::new();
        store.apply_seed(seed)?;
        Ok(store)
    }

    /// Insert every project and rule from `seed`.
    pub fn apply_seed(&self, seed: SeedFile) -> Result<(), StoreError> {
        for project_seed in seed.projects {
            let project = match project_seed.api_key {
                Some(api_key) => self.register_project_with_key(&project_seed.name, &api_key)?,
                None => self.register_project(&project_seed.name)?,
            };

            for rule in project_seed.rules {
                self.add_rule(project.id, rule)?;
            }

            info!(
                project = %project.name,
                project_id = project.id,
                "Seeded project"
            );
        }
        Ok(())
    }

    /// Register a project under a freshly issued 256-bit API key.
    pub fn register_project(&self, name: &str) -> Result<Project, StoreError> {
        loop {
            match self.register_project_with_key(name, &generate_api_key()) {
                Err(StoreError::DuplicateApiKey) => continue,
                other => return other,
            }
        }
    }

    /// Register a project under a caller-chosen API key.
    pub fn register_project_with_key(
        &self,
        name: &str,
        api_key: &str,
    ) -> Result<Project, StoreError> {
        if name.is_empty() {
            return Err(StoreError::Validation("project name must not be empty".into()));
        }
        if api_key.is_empty() {
            return Err(StoreError::Validation("API key must not be empty".into()));
        }

        let mut state = self.state.write();
        if state.by_api_key.contains_key(api_key) {
            return Err(StoreError::DuplicateApiKey);
        }

        state.next_project_id += 1;
        let project = Project {
            id: state.next_project_id,
            name: name.to_string(),
            api_key: api_key.to_string(),
            created_at: Utc::now(),
        };

        state.by_api_key.insert(project.api_key.clone(), project.id);
        state.projects.insert(project.id, project.clone());

        debug!(project_id = project.id, "Registered project");
        Ok(project)
    }

    pub fn project(&self, project_id: ProjectId) -> Option<Project> {
        self.state.read().projects.get(&project_id).cloned()
    }

    /// Delete a project together with all of its rules.
    pub fn delete_project(&self, project_id: ProjectId) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let project = state
            .projects
            .remove(&project_id)
            .ok_or(StoreError::ProjectNotFound(project_id))?;

        state.by_api_key.remove(&project.api_key);
        state.rules.retain(|_, rule| rule.project_id != project_id);
        state.by_endpoint.retain(|(owner, _), _| *owner != project_id);

        debug!(project_id, "Deleted project");
        Ok(())
    }

    /// Attach a new rule to a project.
    pub fn add_rule(&self, project_id: ProjectId, spec: RuleSpec) -> Result<Rule, StoreError> {
        spec.validate()?;

        let mut state = self.state.write();
        state.project_exists(project_id)?;

        let index_key = (project_id, spec.endpoint.clone());
        if state.by_endpoint.contains_key(&index_key) {
            return Err(StoreError::DuplicateRule {
                project_id,
                endpoint: spec.endpoint,
            });
        }

        state.next_rule_id += 1;
        let rule = Rule::from_spec(state.next_rule_id, project_id, spec, Utc::now());

        state.by_endpoint.insert(index_key, rule.id);
        state.rules.insert(rule.id, rule.clone());

        debug!(
            project_id,
            rule_id = rule.id,
            endpoint = %rule.endpoint,
            "Added rule"
        );
        Ok(rule)
    }

    /// Replace the writable fields of an existing rule.
    ///
    /// Limiters already built for the old quota or window are not touched;
    /// subsequent checks resolve to a new limiter.
    pub fn update_rule(
        &self,
        project_id: ProjectId,
        rule_id: RuleId,
        spec: RuleSpec,
    ) -> Result<Rule, StoreError> {
        spec.validate()?;

        let mut state = self.state.write();
        let existing = match state.rules.get(&rule_id) {
            Some(rule) if rule.project_id == project_id => rule.clone(),
            _ => return Err(StoreError::RuleNotFound(rule_id)),
        };

        if existing.endpoint != spec.endpoint {
            let new_key = (project_id, spec.endpoint.clone());
            if state.by_endpoint.contains_key(&new_key) {
                return Err(StoreError::DuplicateRule {
                    project_id,
                    endpoint: spec.endpoint,
                });
            }
            state.by_endpoint.remove(&(project_id, existing.endpoint.clone()));
            state.by_endpoint.insert(new_key, rule_id);
        }

        let updated = Rule::from_spec(rule_id, project_id, spec, existing.created_at);
        state.rules.insert(rule_id, updated.clone());

        debug!(project_id, rule_id, "Updated rule");
        Ok(updated)
    }

    pub fn delete_rule(&self, project_id: ProjectId, rule_id: RuleId) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let endpoint = match state.rules.get(&rule_id) {
            Some(rule) if rule.project_id == project_id => rule.endpoint.clone(),
            _ => return Err(StoreError::RuleNotFound(rule_id)),
        };

        state.rules.remove(&rule_id);
        state.by_endpoint.remove(&(project_id, endpoint));

        debug!(project_id, rule_id, "Deleted rule");
        Ok(())
    }

    /// Rules of a project, newest first.
    pub fn list_rules(&self, project_id: ProjectId) -> Result<Vec<Rule>, StoreError> {
        let state = self.state.read();
        state.project_exists(project_id)?;

        let mut rules: Vec<Rule> = state
            .rules
            .values()
            .filter(|rule| rule.project_id == project_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rules)
    }

    pub fn project_count(&self) -> usize {
        self.state.read().projects.len()
    }

    pub fn rule_count(&self) -> usize {
        self.state.read().rules.len()
    }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn find_project_id_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<ProjectId>, StoreError> {
        Ok(self.state.read().by_api_key.get(api_key).copied())
    }

    async fn find_rule(
        &self,
        project_id: ProjectId,
        endpoint: &str,
    ) -> Result<Option<Rule>, StoreError> {
        let state = self.state.read();
        let rule = state
            .by_endpoint
            .get(&(project_id, endpoint.to_string()))
            .and_then(|rule_id| state.rules.get(rule_id))
            .cloned();
        Ok(rule)
    }
}

/// Issue a random 256-bit API key rendered as lowercase hex.
fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);

    bytes.iter().fold(String::with_capacity(API_KEY_BYTES * 2), |mut out, byte| {
        let _ = write!(out, "{:02x}", byte);
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyBy, Strategy};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn spec(endpoint: &str, limit: u64, window_seconds: u64) -> RuleSpec {
        RuleSpec {
            endpoint: endpoint.to_string(),
            strategy: Strategy::SlidingWindow,
            key_by: KeyBy::ApiKey,
            limit,
            window_seconds,
        }
    }

    #[test]
    fn test_generated_api_keys_are_256_bit_hex() {
        let key = generate_api_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(key, generate_api_key());
    }

    #[test]
    fn test_register_project_issues_unique_keys() {
        let store = InMemoryStore::new();
        let a = store.register_project("alpha").unwrap();
        let b = store.register_project("beta").unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(a.api_key, b.api_key);
        assert_eq!(store.project_count(), 2);
    }

    #[test]
    fn test_duplicate_api_key_rejected() {
        let store = InMemoryStore::new();
        assert_ok!(store.register_project_with_key("alpha", "k1"));
        assert_eq!(
            store.register_project_with_key("beta", "k1"),
            Err(StoreError::DuplicateApiKey)
        );
    }

    #[test]
    fn test_one_rule_per_endpoint() {
        let store = InMemoryStore::new();
        let project = store.register_project("alpha").unwrap();

        assert_ok!(store.add_rule(project.id, spec("/v1/x", 10, 60)));
        let err = store.add_rule(project.id, spec("/v1/x", 20, 60)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRule { .. }));

        // Same endpoint under another project is fine
        let other = store.register_project("beta").unwrap();
        assert_ok!(store.add_rule(other.id, spec("/v1/x", 20, 60)));
    }

    #[test]
    fn test_add_rule_requires_project_and_valid_spec() {
        let store = InMemoryStore::new();
        assert_eq!(
            store.add_rule(99, spec("/v1/x", 10, 60)),
            Err(StoreError::ProjectNotFound(99))
        );

        let project = store.register_project("alpha").unwrap();
        assert_err!(store.add_rule(project.id, spec("/v1/x", 0, 60)));
        assert_eq!(store.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_lookups_are_exact() {
        let store = InMemoryStore::new();
        let project = store.register_project_with_key("alpha", "Key-1").unwrap();
        store.add_rule(project.id, spec("/v1/items", 10, 60)).unwrap();

        assert_eq!(store.find_project_id_by_api_key("Key-1").await, Ok(Some(project.id)));
        assert_eq!(store.find_project_id_by_api_key("key-1").await, Ok(None));

        assert!(store.find_rule(project.id, "/v1/items").await.unwrap().is_some());
        assert!(store.find_rule(project.id, "/v1/items/").await.unwrap().is_none());
        assert!(store.find_rule(project.id, "/v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_rule_changes_quota_and_endpoint() {
        let store = InMemoryStore::new();
        let project = store.register_project("alpha").unwrap();
        let rule = store.add_rule(project.id, spec("/v1/a", 10, 60)).unwrap();

        let updated = store
            .update_rule(project.id, rule.id, spec("/v1/b", 5, 30))
            .unwrap();
        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.limit, 5);
        assert_eq!(updated.window, Duration::from_secs(30));
        assert_eq!(updated.created_at, rule.created_at);

        assert!(store.find_rule(project.id, "/v1/a").await.unwrap().is_none());
        assert_eq!(store.find_rule(project.id, "/v1/b").await.unwrap(), Some(updated));
    }

    #[test]
    fn test_update_rule_cannot_collide_or_cross_projects() {
        let store = InMemoryStore::new();
        let project = store.register_project("alpha").unwrap();
        let a = store.add_rule(project.id, spec("/v1/a", 10, 60)).unwrap();
        store.add_rule(project.id, spec("/v1/b", 10, 60)).unwrap();

        let err = store.update_rule(project.id, a.id, spec("/v1/b", 1, 1)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRule { .. }));

        let other = store.register_project("beta").unwrap();
        assert_eq!(
            store.update_rule(other.id, a.id, spec("/v1/c", 1, 1)),
            Err(StoreError::RuleNotFound(a.id))
        );
    }

    #[tokio::test]
    async fn test_delete_rule_and_list_order() {
        let store = InMemoryStore::new();
        let project = store.register_project("alpha").unwrap();
        let first = store.add_rule(project.id, spec("/v1/a", 10, 60)).unwrap();
        let second = store.add_rule(project.id, spec("/v1/b", 10, 60)).unwrap();

        let ids: Vec<RuleId> = store.list_rules(project.id).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);

        store.delete_rule(project.id, first.id).unwrap();
        assert!(store.find_rule(project.id, "/v1/a").await.unwrap().is_none());
        assert_eq!(store.delete_rule(project.id, first.id), Err(StoreError::RuleNotFound(first.id)));
    }

    #[tokio::test]
    async fn test_delete_project_cascades() {
        let store = InMemoryStore::new();
        let project = store.register_project_with_key("alpha", "k1").unwrap();
        store.add_rule(project.id, spec("/v1/a", 10, 60)).unwrap();
        store.add_rule(project.id, spec("/v1/b", 10, 60)).unwrap();

        store.delete_project(project.id).unwrap();

        assert_eq!(store.rule_count(), 0);
        assert_eq!(store.find_project_id_by_api_key("k1").await, Ok(None));
        assert!(store.project(project.id).is_none());
    }

    #[tokio::test]
    async fn test_seed_yaml() {
        let yaml = r#"
projects:
  - name: storefront
    api_key: k1
    rules:
      - endpoint: /v1/x
        strategy: fixed_window
        key_by: ip
        limit: 2
        window_seconds: 60
      - endpoint: /v1/y
        strategy: token_bucket
        key_by: token
        limit: 50
        window_seconds: 1
  - name: generated
"#;
        let store = InMemoryStore::from_seed_yaml(yaml).unwrap();
        assert_eq!(store.project_count(), 2);
        assert_eq!(store.rule_count(), 2);

        let project_id = store.find_project_id_by_api_key("k1").await.unwrap().unwrap();
        let rule = store.find_rule(project_id, "/v1/x").await.unwrap().unwrap();
        assert_eq!(rule.strategy, Strategy::FixedWindow);
        assert_eq!(rule.key_by, KeyBy::Ip);
        assert_eq!(rule.limit, 2);
        assert_eq!(rule.window, Duration::from_secs(60));
    }

    #[test]
    fn test_seed_rejects_invalid_rules() {
        let yaml = r#"
projects:
  - name: broken
    rules:
      - endpoint: /v1/x
        strategy: fixed_window
        key_by: ip
        limit: 0
        window_seconds: 60
"#;
        assert!(matches!(
            InMemoryStore::from_seed_yaml(yaml),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            InMemoryStore::from_seed_yaml("projects: [[["),
            Err(StoreError::Seed(_))
        ));
    }

    #[test]
    fn test_seed_file_round_trip_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.yaml");
        std::fs::write(&path, "projects:\n  - name: alpha\n    api_key: abc\n").unwrap();

        let store = InMemoryStore::from_seed_file(&path).unwrap();
        assert_eq!(store.project_count(), 1);

        assert!(matches!(
            InMemoryStore::from_seed_file(dir.path().join("missing.yaml")),
            Err(StoreError::Seed(_))
        ));
    }
}
