//! PostgreSQL implementation of `ProcessRepository`.
//!
//! Production persistence:
//! - multi-row mutations inside transactions
//! - takeover and operation claiming as conditional UPDATEs checked via
//!   `rows_affected`
//! - node checkpoints written to the runtime row and its instance twin in
//!   one transaction

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use opsflow_models::{
    DataBindingRow, DefinitionBundle, InstanceDetail, InstanceNodeDetail, NewOperation,
    NodeStatus, OperationRow, OperationStatus, ProcDef, ProcDefLink, ProcDefNode,
    ProcDefNodeParam, ProcDefStatus, ProcInstance, ProcInstanceNode, ProcInstanceStatus,
    WorkflowBundle, WorkflowLinkRow, WorkflowNodeRow, WorkflowRow, WorkflowStatus,
};

use crate::repository::{
    CallbackTarget, CreateInstanceRequest, CreatedInstance, ProcessRepository, StoreError,
};

/// PostgreSQL-backed repository.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_dsn(dsn: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(dsn).await.map_err(db_err)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_definition_rows(
        &self,
        proc_def_id: Uuid,
    ) -> Result<DefinitionBundle, StoreError> {
        let def = sqlx::query_as::<_, ProcDef>(
            r#"
            SELECT id, key, name, version, root_entity, status, created_by, created_at, updated_at
            FROM proc_def
            WHERE id = $1
            "#,
        )
        .bind(proc_def_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::DefinitionNotFound(proc_def_id.to_string()))?;

        self.load_definition_children(def).await
    }

    async fn load_definition_children(
        &self,
        def: ProcDef,
    ) -> Result<DefinitionBundle, StoreError> {
        let nodes = sqlx::query_as::<_, ProcDefNode>(
            r#"
            SELECT id, proc_def_id, node_id, name, node_type, service_name, routine_expression,
                   dynamic_bind, bind_node_id, risk_check, timeout_seconds, ordered_no,
                   context_param_nodes
            FROM proc_def_node
            WHERE proc_def_id = $1
            ORDER BY node_id
            "#,
        )
        .bind(def.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let links = sqlx::query_as::<_, ProcDefLink>(
            r#"
            SELECT id, proc_def_id, link_id, source, target, guard
            FROM proc_def_link
            WHERE proc_def_id = $1
            ORDER BY link_id
            "#,
        )
        .bind(def.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let params = sqlx::query_as::<_, ProcDefNodeParam>(
            r#"
            SELECT p.id, p.proc_def_node_id, p.param_id, p.name, p.bind_type, p.value,
                   p.ctx_bind_node, p.ctx_bind_type, p.ctx_bind_name, p.entity_attr, p.required
            FROM proc_def_node_param p
            JOIN proc_def_node n ON n.id = p.proc_def_node_id
            WHERE n.proc_def_id = $1
            "#,
        )
        .bind(def.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(DefinitionBundle {
            def,
            nodes,
            links,
            params,
        })
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {}", e);
    StoreError::Database(e.to_string())
}

#[async_trait]
impl ProcessRepository for PostgresRepository {
    #[instrument(skip(self))]
    async fn load_definition(&self, proc_def_id: Uuid) -> Result<DefinitionBundle, StoreError> {
        self.load_definition_rows(proc_def_id).await
    }

    #[instrument(skip(self))]
    async fn latest_deployed_definition(&self, key: &str) -> Result<DefinitionBundle, StoreError> {
        let def = sqlx::query_as::<_, ProcDef>(
            r#"
            SELECT id, key, name, version, root_entity, status, created_by, created_at, updated_at
            FROM proc_def
            WHERE key = $1 AND status = 'deployed'
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::DefinitionNotFound(key.to_string()))?;

        self.load_definition_children(def).await
    }

    #[instrument(skip(self, req), fields(proc_def_id = %req.proc_def_id))]
    async fn create_process_instance(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<CreatedInstance, StoreError> {
        let bundle = self.load_definition_rows(req.proc_def_id).await?;

        // Validate before any write.
        if bundle.def.status != ProcDefStatus::Deployed.to_string() {
            return Err(StoreError::Validation(format!(
                "definition {} is {}, not deployed",
                bundle.def.id, bundle.def.status
            )));
        }
        let start_count = bundle
            .nodes
            .iter()
            .filter(|n| n.node_type == "start")
            .count();
        if start_count != 1 {
            return Err(StoreError::Validation(format!(
                "definition {} has {} start nodes",
                bundle.def.id, start_count
            )));
        }

        let now = Utc::now();
        let proc_ins_id = Uuid::now_v7();
        let workflow_id = Uuid::now_v7();

        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO proc_ins (id, proc_def_id, proc_def_name, entity_data_id, entity_type_id,
                                  entity_data_name, status, operator, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            "#,
        )
        .bind(proc_ins_id)
        .bind(bundle.def.id)
        .bind(&bundle.def.name)
        .bind(&req.entity_data_id)
        .bind(&bundle.def.root_entity)
        .bind(&req.entity_data_name)
        .bind(ProcInstanceStatus::NotStarted.to_string())
        .bind(&req.operator)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut work_nodes = Vec::with_capacity(bundle.nodes.len());
        let mut ins_node_ids = std::collections::HashMap::new();
        for def_node in &bundle.nodes {
            let ins_node_id = Uuid::now_v7();
            ins_node_ids.insert(def_node.node_id.clone(), ins_node_id);
            sqlx::query(
                r#"
                INSERT INTO proc_ins_node (id, proc_ins_id, proc_def_node_id, node_id, name,
                                           node_type, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(ins_node_id)
            .bind(proc_ins_id)
            .bind(def_node.id)
            .bind(&def_node.node_id)
            .bind(&def_node.name)
            .bind(&def_node.node_type)
            .bind(NodeStatus::NotStarted.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            let work_node = WorkflowNodeRow {
                id: Uuid::now_v7(),
                workflow_id,
                proc_ins_node_id: ins_node_id,
                node_id: def_node.node_id.clone(),
                name: def_node.name.clone(),
                node_type: def_node.node_type.clone(),
                status: NodeStatus::NotStarted.to_string(),
                input: None,
                output: None,
                error_message: None,
                timeout_seconds: def_node.timeout_seconds,
            };
            sqlx::query(
                r#"
                INSERT INTO proc_run_node (id, workflow_id, proc_ins_node_id, node_id, name,
                                           node_type, status, timeout_seconds)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(work_node.id)
            .bind(workflow_id)
            .bind(ins_node_id)
            .bind(&work_node.node_id)
            .bind(&work_node.name)
            .bind(&work_node.node_type)
            .bind(&work_node.status)
            .bind(work_node.timeout_seconds)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            work_nodes.push(work_node);
        }

        for binding in &req.bindings {
            let Some(ins_node_id) = ins_node_ids.get(&binding.node_id) else {
                return Err(StoreError::Validation(format!(
                    "binding references unknown node {}",
                    binding.node_id
                )));
            };
            sqlx::query(
                r#"
                INSERT INTO proc_data_binding (id, proc_ins_id, proc_ins_node_id, entity_data_id,
                                               entity_type_id, entity_data_name, full_data_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(proc_ins_id)
            .bind(ins_node_id)
            .bind(&binding.entity_data_id)
            .bind(&binding.entity_type_id)
            .bind(&binding.entity_data_name)
            .bind(&binding.full_data_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let mut work_links = Vec::with_capacity(bundle.links.len());
        for link in &bundle.links {
            let work_link = WorkflowLinkRow {
                id: Uuid::now_v7(),
                workflow_id,
                link_id: link.link_id.clone(),
                source: link.source.clone(),
                target: link.target.clone(),
                guard: link.guard.clone(),
            };
            sqlx::query(
                r#"
                INSERT INTO proc_run_link (id, workflow_id, link_id, source, target, guard)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(work_link.id)
            .bind(workflow_id)
            .bind(&work_link.link_id)
            .bind(&work_link.source)
            .bind(&work_link.target)
            .bind(&work_link.guard)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            work_links.push(work_link);
        }

        let workflow = WorkflowRow {
            id: workflow_id,
            proc_ins_id,
            name: bundle.def.name.clone(),
            status: WorkflowStatus::Running.to_string(),
            host: req.host.clone(),
            sleep: false,
            stop: false,
            last_alive_at: now,
            error_message: None,
        };
        sqlx::query(
            r#"
            INSERT INTO proc_run_workflow (id, proc_ins_id, name, status, host, sleep, stop,
                                           last_alive_at)
            VALUES ($1, $2, $3, $4, $5, false, false, $6)
            "#,
        )
        .bind(workflow_id)
        .bind(proc_ins_id)
        .bind(&workflow.name)
        .bind(&workflow.status)
        .bind(&workflow.host)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let start_operation_id: i64 = sqlx::query(
            r#"
            INSERT INTO proc_run_operation (workflow_id, operation, status, created_by, created_at)
            VALUES ($1, 'start', 'wait', $2, $3)
            RETURNING id
            "#,
        )
        .bind(workflow_id)
        .bind(&req.operator)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .get("id");

        tx.commit().await.map_err(db_err)?;
        debug!(%proc_ins_id, %workflow_id, "created process instance");

        Ok(CreatedInstance {
            proc_ins_id,
            bundle: WorkflowBundle {
                workflow,
                nodes: work_nodes,
                links: work_links,
            },
            start_operation_id,
        })
    }

    #[instrument(skip(self))]
    async fn get_instance_detail(&self, proc_ins_id: Uuid) -> Result<InstanceDetail, StoreError> {
        let instance = sqlx::query_as::<_, ProcInstance>(
            r#"
            SELECT id, proc_def_id, proc_def_name, entity_data_id, entity_type_id,
                   entity_data_name, status, operator, created_at, updated_at
            FROM proc_ins
            WHERE id = $1
            "#,
        )
        .bind(proc_ins_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::InstanceNotFound(proc_ins_id))?;

        let nodes = sqlx::query_as::<_, ProcInstanceNode>(
            r#"
            SELECT id, proc_ins_id, proc_def_node_id, node_id, name, node_type, status,
                   request_id, input, output, error_message, risk_check_result
            FROM proc_ins_node
            WHERE proc_ins_id = $1
            ORDER BY node_id
            "#,
        )
        .bind(proc_ins_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(InstanceDetail {
            id: instance.id,
            proc_def_id: instance.proc_def_id,
            proc_def_name: instance.proc_def_name,
            entity_data_id: instance.entity_data_id,
            entity_data_name: instance.entity_data_name,
            status: instance
                .status
                .parse()
                .unwrap_or(ProcInstanceStatus::NotStarted),
            operator: instance.operator,
            created_at: instance.created_at,
            nodes: nodes
                .into_iter()
                .map(|n| InstanceNodeDetail {
                    id: n.id,
                    node_id: n.node_id,
                    name: n.name,
                    node_type: n.node_type,
                    status: n.status.parse().unwrap_or(NodeStatus::NotStarted),
                    error_message: n.error_message,
                    risk_check_result: n.risk_check_result,
                })
                .collect(),
        })
    }

    #[instrument(skip(self))]
    async fn list_instances(&self) -> Result<Vec<ProcInstance>, StoreError> {
        sqlx::query_as::<_, ProcInstance>(
            r#"
            SELECT id, proc_def_id, proc_def_name, entity_data_id, entity_type_id,
                   entity_data_name, status, operator, created_at, updated_at
            FROM proc_ins
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self))]
    async fn update_instance_status(
        &self,
        proc_ins_id: Uuid,
        status: ProcInstanceStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE proc_ins SET status = $2, updated_at = NOW() WHERE id = $1
            "#,
        )
        .bind(proc_ins_id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_workflow_bundle(&self, workflow_id: Uuid) -> Result<WorkflowBundle, StoreError> {
        let workflow = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, proc_ins_id, name, status, host, sleep, stop, last_alive_at, error_message
            FROM proc_run_workflow
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let nodes = sqlx::query_as::<_, WorkflowNodeRow>(
            r#"
            SELECT id, workflow_id, proc_ins_node_id, node_id, name, node_type, status, input,
                   output, error_message, timeout_seconds
            FROM proc_run_node
            WHERE workflow_id = $1
            ORDER BY node_id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let links = sqlx::query_as::<_, WorkflowLinkRow>(
            r#"
            SELECT id, workflow_id, link_id, source, target, guard
            FROM proc_run_link
            WHERE workflow_id = $1
            ORDER BY link_id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(WorkflowBundle {
            workflow,
            nodes,
            links,
        })
    }

    #[instrument(skip(self))]
    async fn list_local_running_workflows(&self, host: &str) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM proc_run_workflow
            WHERE host = $1 AND status = 'running' AND stop = false AND sleep = false
            "#,
        )
        .bind(host)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn list_stale_workflows(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM proc_run_workflow
            WHERE sleep = false AND status = 'running' AND last_alive_at <= $1
            "#,
        )
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn claim_workflow(
        &self,
        workflow_id: Uuid,
        new_host: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE proc_run_workflow
            SET host = $2, last_alive_at = NOW()
            WHERE id = $1 AND last_alive_at < $3
            "#,
        )
        .bind(workflow_id)
        .bind(new_host)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE proc_run_workflow SET status = $2, error_message = $3 WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(status.to_string())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_workflow_sleep(&self, workflow_id: Uuid, sleep: bool) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE proc_run_workflow SET sleep = $2 WHERE id = $1"#)
            .bind(workflow_id)
            .bind(sleep)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_workflow_stop(&self, workflow_id: Uuid, stop: bool) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE proc_run_workflow SET stop = $2 WHERE id = $1"#)
            .bind(workflow_id)
            .bind(stop)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn heartbeat(&self, workflow_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE proc_run_workflow SET last_alive_at = $2 WHERE id = $1"#)
            .bind(workflow_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, input, output))]
    async fn update_node_status(
        &self,
        workflow_node_id: Uuid,
        status: NodeStatus,
        input: Option<serde_json::Value>,
        output: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let ins_node_id: Uuid = sqlx::query(
            r#"
            UPDATE proc_run_node
            SET status = $2,
                input = COALESCE($3, input),
                output = COALESCE($4, output),
                error_message = $5
            WHERE id = $1
            RETURNING proc_ins_node_id
            "#,
        )
        .bind(workflow_node_id)
        .bind(status.to_string())
        .bind(&input)
        .bind(&output)
        .bind(error_message)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NodeNotFound(workflow_node_id.to_string()))?
        .get("proc_ins_node_id");

        sqlx::query(
            r#"
            UPDATE proc_ins_node
            SET status = $2,
                input = COALESCE($3, input),
                output = COALESCE($4, output),
                error_message = $5
            WHERE id = $1
            "#,
        )
        .bind(ins_node_id)
        .bind(status.to_string())
        .bind(&input)
        .bind(&output)
        .bind(error_message)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn update_node_request_id(
        &self,
        workflow_node_id: Uuid,
        request_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE proc_ins_node
            SET request_id = $2
            WHERE id = (SELECT proc_ins_node_id FROM proc_run_node WHERE id = $1)
            "#,
        )
        .bind(workflow_node_id)
        .bind(request_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_node_risk_result(
        &self,
        workflow_node_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE proc_ins_node
            SET risk_check_result = $2
            WHERE id = (SELECT proc_ins_node_id FROM proc_run_node WHERE id = $1)
            "#,
        )
        .bind(workflow_node_id)
        .bind(&result)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_node_bindings(
        &self,
        proc_ins_node_id: Uuid,
    ) -> Result<Vec<DataBindingRow>, StoreError> {
        sqlx::query_as::<_, DataBindingRow>(
            r#"
            SELECT id, proc_ins_id, proc_ins_node_id, entity_data_id, entity_type_id,
                   entity_data_name, full_data_id
            FROM proc_data_binding
            WHERE proc_ins_node_id = $1
            "#,
        )
        .bind(proc_ins_node_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self))]
    async fn copy_dynamic_bindings(
        &self,
        proc_ins_id: Uuid,
        source_node_id: &str,
        target_ins_node_id: Uuid,
    ) -> Result<Vec<DataBindingRow>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing = sqlx::query_as::<_, DataBindingRow>(
            r#"
            SELECT id, proc_ins_id, proc_ins_node_id, entity_data_id, entity_type_id,
                   entity_data_name, full_data_id
            FROM proc_data_binding
            WHERE proc_ins_node_id = $1
            "#,
        )
        .bind(target_ins_node_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        if !existing.is_empty() {
            tx.commit().await.map_err(db_err)?;
            return Ok(existing);
        }

        let copies = sqlx::query_as::<_, DataBindingRow>(
            r#"
            INSERT INTO proc_data_binding (id, proc_ins_id, proc_ins_node_id, entity_data_id,
                                           entity_type_id, entity_data_name, full_data_id)
            SELECT gen_random_uuid(), b.proc_ins_id, $3, b.entity_data_id, b.entity_type_id,
                   b.entity_data_name, b.full_data_id
            FROM proc_data_binding b
            JOIN proc_ins_node n ON n.id = b.proc_ins_node_id
            WHERE b.proc_ins_id = $1 AND n.node_id = $2
            RETURNING id, proc_ins_id, proc_ins_node_id, entity_data_id, entity_type_id,
                      entity_data_name, full_data_id
            "#,
        )
        .bind(proc_ins_id)
        .bind(source_node_id)
        .bind(target_ins_node_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(copies)
    }

    #[instrument(skip(self, op))]
    async fn append_operation(&self, op: NewOperation) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO proc_run_operation (workflow_id, node_id, operation, message, status,
                                            created_by, created_at)
            VALUES ($1, $2, $3, $4, 'wait', $5, NOW())
            RETURNING id
            "#,
        )
        .bind(op.workflow_id)
        .bind(&op.node_id)
        .bind(op.operation.to_string())
        .bind(&op.message)
        .bind(&op.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get("id"))
    }

    #[instrument(skip(self, workflow_ids))]
    async fn list_pending_operations(
        &self,
        workflow_ids: &[Uuid],
    ) -> Result<Vec<OperationRow>, StoreError> {
        if workflow_ids.is_empty() {
            return Ok(vec![]);
        }
        sqlx::query_as::<_, OperationRow>(
            r#"
            SELECT id, workflow_id, node_id, operation, message, status, handled_by, created_by,
                   created_at, started_at, ended_at
            FROM proc_run_operation
            WHERE status = 'wait' AND workflow_id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(workflow_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self))]
    async fn claim_operation(&self, operation_id: i64, host: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE proc_run_operation
            SET status = 'doing', handled_by = $2, started_at = NOW()
            WHERE id = $1 AND status = 'wait'
            "#,
        )
        .bind(operation_id)
        .bind(host)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish_operation(&self, operation_id: i64, ok: bool) -> Result<(), StoreError> {
        let status = if ok {
            OperationStatus::Done
        } else {
            OperationStatus::Fail
        };
        sqlx::query(
            r#"
            UPDATE proc_run_operation SET status = $2, ended_at = NOW() WHERE id = $1
            "#,
        )
        .bind(operation_id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn workflow_for_instance(
        &self,
        proc_ins_id: Uuid,
        proc_ins_node_id: Option<Uuid>,
    ) -> Result<(Uuid, Option<String>), StoreError> {
        let workflow_id: Uuid = sqlx::query(
            r#"
            SELECT id FROM proc_run_workflow WHERE proc_ins_id = $1
            "#,
        )
        .bind(proc_ins_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::InstanceNotFound(proc_ins_id))?
        .get("id");

        let node_id = match proc_ins_node_id {
            Some(ins_node_id) => Some(
                sqlx::query(
                    r#"
                    SELECT node_id FROM proc_run_node WHERE proc_ins_node_id = $1
                    "#,
                )
                .bind(ins_node_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .ok_or_else(|| StoreError::NodeNotFound(ins_node_id.to_string()))?
                .get("node_id"),
            ),
            None => None,
        };

        Ok((workflow_id, node_id))
    }

    #[instrument(skip(self))]
    async fn find_node_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<CallbackTarget, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT r.workflow_id, r.node_id, i.status
            FROM proc_ins_node i
            JOIN proc_run_node r ON r.proc_ins_node_id = i.id
            WHERE i.request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::RequestNotFound(request_id.to_string()))?;

        let status: String = row.get("status");
        Ok(CallbackTarget {
            workflow_id: row.get("workflow_id"),
            node_id: row.get("node_id"),
            is_completed: status == NodeStatus::Completed.to_string(),
        })
    }

    #[instrument(skip(self, rows, graph))]
    async fn save_preview(
        &self,
        rows: Vec<opsflow_models::PreviewRow>,
        graph: Vec<opsflow_models::GraphNodeRow>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for row in &rows {
            sqlx::query(
                r#"
                INSERT INTO proc_data_preview (id, proc_session_id, proc_def_id, bind_type,
                                               proc_def_node_id, ordered_no, entity_data_id,
                                               entity_type_id, entity_data_name, full_data_id,
                                               is_bound, created_by, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(row.id)
            .bind(&row.proc_session_id)
            .bind(row.proc_def_id)
            .bind(&row.bind_type)
            .bind(&row.proc_def_node_id)
            .bind(&row.ordered_no)
            .bind(&row.entity_data_id)
            .bind(&row.entity_type_id)
            .bind(&row.entity_data_name)
            .bind(&row.full_data_id)
            .bind(row.is_bound)
            .bind(&row.created_by)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for node in &graph {
            sqlx::query(
                r#"
                INSERT INTO proc_ins_graph_node (id, proc_session_id, graph_node_id, data_id,
                                                 display_name, package_name, entity_name,
                                                 prev_ids, succ_ids, full_data_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(node.id)
            .bind(&node.proc_session_id)
            .bind(&node.graph_node_id)
            .bind(&node.data_id)
            .bind(&node.display_name)
            .bind(&node.package_name)
            .bind(&node.entity_name)
            .bind(&node.prev_ids)
            .bind(&node.succ_ids)
            .bind(&node.full_data_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}
