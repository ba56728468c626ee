//! Job definitions loaded from TOML and replayed into the registry.
//!
//! ```toml
//! [[jobs]]
//! project = "app1"
//! token = "s3cret"
//! parameters = [{ name = "BRANCH", default = "develop" }]
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use tracing::{info, warn};

use ktrigger_core::{ParameterDefinition, Subscriber};

use crate::registry::SubscriberRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobDefinition {
    pub project: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
}

impl JobDefinition {
    pub fn to_subscriber(&self) -> Subscriber {
        Subscriber::new(self.project.trim(), self.token.as_deref(), self.parameters.clone())
    }
}

/// Counts from one registry sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobCatalog {
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl JobCatalog {
    pub fn new(jobs: Vec<JobDefinition>) -> Self {
        Self { jobs }
    }

    /// One subscriber per named project, ordered by project. When a project
    /// is defined twice the later definition wins.
    pub fn to_subscribers(&self) -> Vec<Subscriber> {
        let mut by_project = BTreeMap::new();
        for job in &self.jobs {
            if job.project.trim().is_empty() {
                warn!("skipping job definition without a project name");
                continue;
            }
            let subscriber = job.to_subscriber();
            if by_project.contains_key(&subscriber.project) {
                warn!(project = %subscriber.project, "project defined more than once, using the last definition");
            }
            by_project.insert(subscriber.project.clone(), subscriber);
        }
        by_project.into_values().collect()
    }

    /// Bring `registry` in line with the catalog: register every job and
    /// unregister projects the catalog no longer defines.
    pub fn sync_registry(&self, registry: &SubscriberRegistry) -> SyncReport {
        let before = registry.snapshot();
        let mut report = SyncReport::default();
        let subscribers = self.to_subscribers();
        let defined: BTreeSet<String> = subscribers.iter().map(|s| s.project.clone()).collect();

        for subscriber in subscribers {
            if !subscriber.has_token() {
                warn!(project = %subscriber.project, "job has no token; it will never be triggered");
            }
            match before.get(&subscriber.project) {
                Some(existing) if **existing == subscriber => {}
                Some(_) => report.updated += 1,
                None => report.added += 1,
            }
            registry.add(subscriber);
        }

        for project in before.projects().filter(|p| !defined.contains(*p)) {
            registry.remove(project);
            report.removed += 1;
        }

        info!(
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            total = registry.len(),
            "job catalog synced"
        );
        report
    }
}
