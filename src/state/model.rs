use std::collections::HashSet;
use std::sync::OnceLock;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::user_error_hint;

/// The whole persistent document. One JSON file, loaded and saved atomically
/// as a unit; every accessor on the store works against this in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub version: String,
    pub initialized_at: DateTime<Utc>,
    pub zfs_pool: String,
    pub zfs_dataset_base: String,
    pub projects: Vec<Project>,
    pub snapshots: Vec<SnapshotRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub docker_image: String,
    pub ssl_cert_dir: String,
    pub created_at: DateTime<Utc>,
    pub credentials: Credentials,
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: Uuid,
    /// Namespaced `<project>/<branch>`.
    pub name: String,
    pub project_name: String,
    pub parent_branch_id: Option<Uuid>,
    pub is_primary: bool,
    /// Fully-qualified origin snapshot. None only for the primary branch.
    pub snapshot_name: Option<String>,
    /// Dataset leaf name `<project>-<branch>`.
    pub zfs_dataset: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub status: BranchStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Running,
    Stopped,
}

impl BranchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub branch_name: String,
    pub project_name: String,
    /// Fully-qualified `<pool>/<base>/<dataset>@<stamp>[-<label>]`.
    pub zfs_snapshot: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub size_bytes: u64,
}

impl State {
    pub fn new(zfs_pool: &str, zfs_dataset_base: &str) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            initialized_at: Utc::now(),
            zfs_pool: zfs_pool.to_string(),
            zfs_dataset_base: zfs_dataset_base.to_string(),
            projects: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Check every structural invariant. Runs on every load; a violation
    /// means the document cannot be trusted and the caller must refuse it.
    pub fn validate(&self) -> Result<()> {
        let mut project_names = HashSet::new();
        let mut branch_names = HashSet::new();
        let mut dataset_names = HashSet::new();

        for project in &self.projects {
            if !project_names.insert(project.name.as_str()) {
                bail!("duplicate project name '{}'", project.name);
            }

            let mut primaries = 0;
            let ids: HashSet<Uuid> = project.branches.iter().map(|b| b.id).collect();

            for branch in &project.branches {
                if !branch_names.insert(branch.name.as_str()) {
                    bail!("duplicate branch name '{}'", branch.name);
                }

                let ns = Namespace::parse(&branch.name)?;
                if ns.project != project.name || branch.project_name != project.name {
                    bail!(
                        "branch '{}' does not belong to project '{}'",
                        branch.name,
                        project.name
                    );
                }

                if !dataset_names.insert(branch.zfs_dataset.as_str()) {
                    bail!("duplicate dataset name '{}'", branch.zfs_dataset);
                }
                let expected = crate::config::dataset_name(&ns.project, &ns.branch);
                if branch.zfs_dataset != expected {
                    bail!(
                        "branch '{}' has dataset '{}', expected '{}'",
                        branch.name,
                        branch.zfs_dataset,
                        expected
                    );
                }

                if branch.is_primary {
                    primaries += 1;
                    if branch.parent_branch_id.is_some() {
                        bail!("primary branch '{}' must not have a parent", branch.name);
                    }
                } else {
                    match branch.parent_branch_id {
                        Some(parent_id) if ids.contains(&parent_id) => {}
                        Some(_) => bail!(
                            "branch '{}' has a parent outside project '{}'",
                            branch.name,
                            project.name
                        ),
                        None => bail!("non-primary branch '{}' has no parent", branch.name),
                    }
                }
            }

            if primaries != 1 {
                bail!(
                    "project '{}' has {} primary branches, expected exactly 1",
                    project.name,
                    primaries
                );
            }
        }

        Ok(())
    }
}

impl Project {
    pub fn primary_branch(&self) -> Option<&Branch> {
        self.branches.iter().find(|b| b.is_primary)
    }

    pub fn branch_by_id(&self, id: Uuid) -> Option<&Branch> {
        self.branches.iter().find(|b| b.id == id)
    }

    /// Direct children of the given branch.
    pub fn children_of(&self, id: Uuid) -> Vec<&Branch> {
        self.branches
            .iter()
            .filter(|b| b.parent_branch_id == Some(id))
            .collect()
    }

    /// The subtree rooted at `id` in post-order: children before parents,
    /// ending with the root itself. Supplies both the deletion order and the
    /// tree display order.
    pub fn subtree_post_order(&self, id: Uuid) -> Vec<&Branch> {
        let mut out = Vec::new();
        self.collect_post_order(id, &mut out);
        out
    }

    fn collect_post_order<'a>(&'a self, id: Uuid, out: &mut Vec<&'a Branch>) {
        for child in self.children_of(id) {
            self.collect_post_order(child.id, out);
        }
        if let Some(branch) = self.branch_by_id(id) {
            out.push(branch);
        }
    }
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[A-Za-z0-9_-]+$").unwrap())
}

/// Validate a bare project or branch name.
pub fn validate_name(name: &str, kind: &str) -> Result<()> {
    if name_regex().is_match(name) {
        return Ok(());
    }
    Err(user_error_hint(
        format!("invalid {kind} name '{name}'"),
        "names may only contain letters, digits, '_' and '-'",
    ))
}

/// A parsed `<project>/<branch>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub project: String,
    pub branch: String,
}

impl Namespace {
    pub fn parse(name: &str) -> Result<Self> {
        let mut parts = name.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(project), Some(branch), None) if !project.is_empty() && !branch.is_empty() => {
                validate_name(project, "project")?;
                validate_name(branch, "branch")?;
                Ok(Self {
                    project: project.to_string(),
                    branch: branch.to_string(),
                })
            }
            _ => Err(user_error_hint(
                format!("invalid branch reference '{name}'"),
                "expected '<project>/<branch>', e.g. 'demo/dev'",
            )),
        }
    }

    pub fn full(&self) -> String {
        format!("{}/{}", self.project, self.branch)
    }
}
