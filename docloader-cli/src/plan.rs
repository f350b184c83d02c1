//! TOML load plans.
//!
//! A plan names one backend connection and an ordered list of tasks that run
//! inside a single request, so later tasks see the mutations of earlier ones.
//!
//! ```toml
//! [settings]
//! max_threads = 4
//!
//! [connection]
//! db_type = "memory"
//! conn_str = "memory://local"
//!
//! [[task]]
//! operation = "create"
//! start = 0
//! end = 1000
//! extras = { collection = "users" }
//!
//! [[task]]
//! operation = "update"
//! start = 0
//! end = 500
//! fields_to_change = ["email"]
//!
//! [[task]]
//! operation = "validate"
//! start = 0
//! end = 1000
//! exceptions = { retry_attempts = 2 }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use docloader::{ConnectionInfo, EngineSettings, Extras, OperationConfig, OperationKind, TaskSpec};

#[derive(Debug, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub settings: Option<EngineSettings>,
    pub connection: PlanConnection,
    #[serde(default)]
    pub task: Vec<PlanTask>,
}

#[derive(Debug, Deserialize)]
pub struct PlanConnection {
    pub db_type: String,
    pub conn_str: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlanTask {
    pub operation: OperationKind,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub extras: Extras,
    #[serde(flatten)]
    pub config: OperationConfig,
}

impl Plan {
    pub fn from_toml(content: &str) -> Result<Self> {
        let plan: Self = toml::from_str(content)?;
        if plan.task.is_empty() {
            anyhow::bail!("plan defines no [[task]] blocks");
        }
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan '{}'", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid plan '{}'", path.display()))
    }

    fn connection_info(&self) -> ConnectionInfo {
        let c = &self.connection;
        ConnectionInfo {
            conn_str: c.conn_str.clone(),
            username: c.username.clone(),
            password: c.password.clone(),
        }
    }

    /// Task specs in plan order.
    pub fn task_specs(&self) -> Vec<TaskSpec> {
        let connection = self.connection_info();
        self.task
            .iter()
            .map(|t| TaskSpec {
                operation: t.operation,
                db_type: self.connection.db_type.clone(),
                connection: connection.clone(),
                extras: t.extras.clone(),
                config: t.config.clone(),
                seed: t.seed,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PLAN: &str = r#"
        [settings]
        max_threads = 4

        [connection]
        db_type = "memory"
        conn_str = "memory://plan"

        [[task]]
        operation = "bulk-create"
        start = 0
        end = 100
        bulk_batch_size = 10
        extras = { collection = "users" }

        [[task]]
        operation = "validate"
        start = 0
        end = 100
        exceptions = { retry_exceptions = ["timeout"], retry_attempts = 2 }
    "#;

    #[test]
    fn test_parse_plan() {
        let plan = Plan::from_toml(PLAN).unwrap();
        assert_eq!(plan.settings.as_ref().unwrap().max_threads, 4);
        assert_eq!(plan.settings.as_ref().unwrap().pool_size, EngineSettings::default().pool_size);

        let specs = plan.task_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].operation, OperationKind::BulkCreate);
        assert_eq!(specs[0].config.end, 100);
        assert_eq!(specs[0].config.bulk_batch_size, Some(10));
        assert_eq!(specs[0].extras.collection, "users");
        assert_eq!(specs[1].config.exceptions.retry_attempts, 2);
        assert_eq!(specs[1].connection.conn_str, "memory://plan");
    }

    #[test]
    fn test_plan_without_tasks_is_rejected() {
        let err = Plan::from_toml("[connection]\ndb_type = \"memory\"\nconn_str = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("no [[task]]"));
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        let plan = "[connection]\ndb_type = \"memory\"\nconn_str = \"x\"\n[[task]]\noperation = \"increment\"\n";
        assert!(Plan::from_toml(plan).is_err());
    }
}
