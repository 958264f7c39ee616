//! Postgres-backed process definition store.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use flowforge_core::{DeploymentId, ProcessDefinitionId};

use super::DefinitionError;
use super::model::{ProcessDefinition, ProcessOutline};
use super::store::ProcessDefinitionStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flowforge_process_definitions (
    id            UUID PRIMARY KEY,
    key           TEXT NOT NULL,
    version       INTEGER NOT NULL,
    name          TEXT,
    deployment_id UUID NOT NULL,
    resource_name TEXT NOT NULL,
    resource      TEXT NOT NULL,
    outline       JSONB NOT NULL,
    deployed_at   TIMESTAMPTZ NOT NULL,
    UNIQUE (key, version)
);
"#;

const COLUMNS: &str =
    "id, key, version, name, deployment_id, resource_name, resource, outline, deployed_at";

#[derive(Debug, Clone)]
pub struct PostgresDefinitionStore {
    pool: Arc<PgPool>,
}

impl PostgresDefinitionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), DefinitionError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl ProcessDefinitionStore for PostgresDefinitionStore {
    #[instrument(skip(self, definition), fields(key = %definition.key), err)]
    async fn deploy(&self, mut definition: ProcessDefinition) -> Result<ProcessDefinition, DefinitionError> {
        let outline = serde_json::to_value(&definition.outline)
            .map_err(|e| DefinitionError::Invalid(e.to_string()))?;

        // Concurrent deploys of one key collide on UNIQUE (key, version).
        let version: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO flowforge_process_definitions (
                id, key, version, name, deployment_id, resource_name, resource, outline, deployed_at
            )
            SELECT $1, $2, COALESCE(MAX(version), 0) + 1, $3, $4, $5, $6, $7, $8
            FROM flowforge_process_definitions WHERE key = $2
            RETURNING version
            "#,
        )
        .bind(definition.id.as_uuid())
        .bind(&definition.key)
        .bind(&definition.name)
        .bind(definition.deployment_id.as_uuid())
        .bind(&definition.resource_name)
        .bind(&definition.resource)
        .bind(outline)
        .bind(definition.deployed_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("deploy", e))?;

        definition.version = version.max(1) as u32;
        Ok(definition)
    }

    async fn get(&self, id: ProcessDefinitionId) -> Result<Option<ProcessDefinition>, DefinitionError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM flowforge_process_definitions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(definition_from_row).transpose()
    }

    async fn latest_by_key(&self, key: &str) -> Result<Option<ProcessDefinition>, DefinitionError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM flowforge_process_definitions WHERE key = $1 \
             ORDER BY version DESC LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_by_key", e))?;

        row.as_ref().map(definition_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<ProcessDefinition>, DefinitionError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM flowforge_process_definitions ORDER BY key, version"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(definition_from_row).collect()
    }

    async fn delete(&self, id: ProcessDefinitionId) -> Result<(), DefinitionError> {
        let result = sqlx::query("DELETE FROM flowforge_process_definitions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        if result.rows_affected() == 0 {
            return Err(DefinitionError::NotFound(id));
        }
        Ok(())
    }
}

fn definition_from_row(row: &PgRow) -> Result<ProcessDefinition, DefinitionError> {
    let invalid = |e: sqlx::Error| DefinitionError::Storage(format!("invalid definition row: {e}"));

    let outline: serde_json::Value = row.try_get("outline").map_err(invalid)?;
    let outline: ProcessOutline = serde_json::from_value(outline)
        .map_err(|e| DefinitionError::Storage(format!("invalid definition outline: {e}")))?;

    Ok(ProcessDefinition {
        id: ProcessDefinitionId::from_uuid(row.try_get("id").map_err(invalid)?),
        key: row.try_get("key").map_err(invalid)?,
        version: row.try_get::<i32, _>("version").map_err(invalid)?.max(0) as u32,
        name: row.try_get("name").map_err(invalid)?,
        deployment_id: DeploymentId::from_uuid(row.try_get("deployment_id").map_err(invalid)?),
        resource_name: row.try_get("resource_name").map_err(invalid)?,
        resource: row.try_get("resource").map_err(invalid)?,
        outline,
        deployed_at: row.try_get("deployed_at").map_err(invalid)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DefinitionError {
    match err {
        sqlx::Error::Database(db_err) => {
            DefinitionError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => DefinitionError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
