//! `EntityResolver`: translates entity-model expressions into hop lists and
//! fetches instance data from the external CMDB plugin.

mod expression;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use opsflow_models::PreviewEntityNode;

pub use expression::{analyze_expression, split_data_expressions, ExpressionHop, HopFilter};

/// Error type for expression analysis and data fetch.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid entity expression: {0}")]
    BadExpression(String),

    /// An expression analyzed to zero hops.
    #[error("expression `{0}` produced no hops")]
    EmptyHops(String),

    /// Root query matched a number of rows other than one.
    #[error("root entity match returned {count} rows, expected exactly 1")]
    RootMatch { count: usize },

    /// The CMDB data service failed.
    #[error("entity query failed: {0}")]
    Upstream(String),
}

/// Attribute filter applied to the root hop of a query.
#[derive(Debug, Clone)]
pub struct EntityFilter {
    pub attr: String,
    pub op: String,
    pub value: String,
}

impl EntityFilter {
    /// The standard `id eq <value>` root filter.
    pub fn id_eq(value: impl Into<String>) -> Self {
        Self {
            attr: "id".to_string(),
            op: "eq".to_string(),
            value: value.into(),
        }
    }
}

/// Collaborator contract: the engine consumes hop lists and entity trees
/// only; how the CMDB is reached is the implementation's business.
#[async_trait]
pub trait EntityResolver: Send + Sync + 'static {
    /// Analyze an expression into its ordered hop list.
    async fn analyze(&self, expression: &str) -> Result<Vec<ExpressionHop>, ResolveError>;

    /// Query the hop chain, returning the flattened entity tree. With a
    /// root filter of `id eq <value>` the root must match exactly one row.
    async fn query(
        &self,
        hops: &[ExpressionHop],
        root_filter: Option<&EntityFilter>,
    ) -> Result<Vec<PreviewEntityNode>, ResolveError>;

    /// Fetch the attribute map of one entity instance.
    async fn fetch_attributes(
        &self,
        package: &str,
        entity: &str,
        data_id: &str,
    ) -> Result<Value, ResolveError>;
}

/// HTTP resolver against the CMDB plugin's data-model service.
pub struct HttpEntityResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEntityResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn query_entity_rows(
        &self,
        package: &str,
        entity: &str,
        filters: &[(String, String, Value)],
    ) -> Result<Vec<Value>, ResolveError> {
        let url = format!("{}/{}/entities/{}/query", self.base_url, package, entity);
        let body = serde_json::json!({
            "additionalFilters": filters
                .iter()
                .map(|(attr, op, value)| serde_json::json!({
                    "attrName": attr,
                    "op": op,
                    "condition": value,
                }))
                .collect::<Vec<_>>(),
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ResolveError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ResolveError::Upstream(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ResolveError::Upstream(e.to_string()))?;
        Ok(payload
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl EntityResolver for HttpEntityResolver {
    async fn analyze(&self, expression: &str) -> Result<Vec<ExpressionHop>, ResolveError> {
        analyze_expression(expression)
    }

    #[instrument(skip(self, hops, root_filter))]
    async fn query(
        &self,
        hops: &[ExpressionHop],
        root_filter: Option<&EntityFilter>,
    ) -> Result<Vec<PreviewEntityNode>, ResolveError> {
        let Some(root_hop) = hops.first() else {
            return Err(ResolveError::EmptyHops(String::new()));
        };

        // Root rows: inline hop filter plus the caller's root filter.
        let mut filters: Vec<(String, String, Value)> = Vec::new();
        if let Some(f) = &root_hop.filter {
            filters.push((f.attr.clone(), f.op.clone(), Value::String(f.value.clone())));
        }
        if let Some(f) = root_filter {
            filters.push((f.attr.clone(), f.op.clone(), Value::String(f.value.clone())));
        }
        let root_rows = self
            .query_entity_rows(&root_hop.package, &root_hop.entity, &filters)
            .await?;

        let expects_single_root = root_filter.map(|f| f.op == "eq").unwrap_or(false)
            || root_hop
                .filter
                .as_ref()
                .map(|f| f.attr == "id" && f.op == "eq")
                .unwrap_or(false);
        if expects_single_root && root_rows.len() != 1 {
            return Err(ResolveError::RootMatch {
                count: root_rows.len(),
            });
        }

        let last_hop = hops.len() - 1;
        let mut nodes: Vec<PreviewEntityNode> = Vec::new();
        // (node index, row) pairs of the previous hop.
        let mut frontier: Vec<(usize, Value)> = Vec::new();

        for row in root_rows {
            let node = node_from_row(&root_hop.package, &root_hop.entity, &row, None, last_hop == 0);
            nodes.push(node);
            frontier.push((nodes.len() - 1, row));
        }

        for (hop_index, hop) in hops.iter().enumerate().skip(1) {
            let relation = hop.relation.as_deref().unwrap_or_default();
            let mut next_frontier = Vec::new();

            for (parent_index, parent_row) in &frontier {
                let related_ids = relation_ids(parent_row, relation);
                if related_ids.is_empty() {
                    continue;
                }
                let mut filters: Vec<(String, String, Value)> = vec![(
                    "id".to_string(),
                    "in".to_string(),
                    Value::Array(related_ids.into_iter().map(Value::String).collect()),
                )];
                if let Some(f) = &hop.filter {
                    filters.push((f.attr.clone(), f.op.clone(), Value::String(f.value.clone())));
                }
                let rows = self
                    .query_entity_rows(&hop.package, &hop.entity, &filters)
                    .await?;

                for row in rows {
                    let id = synthetic_id(&hop.package, &hop.entity, &row);
                    let parent_id = nodes[*parent_index].id.clone();
                    let parent_full = nodes[*parent_index].full_data_id.clone();
                    let node = node_from_row(
                        &hop.package,
                        &hop.entity,
                        &row,
                        Some((&parent_id, &parent_full)),
                        hop_index == last_hop,
                    );
                    // Same entity reached twice merges instead of duplicating.
                    let node_index = match nodes.iter().position(|n| n.id == id) {
                        Some(existing) => {
                            nodes[existing].merge(&node);
                            existing
                        }
                        None => {
                            nodes.push(node);
                            nodes.len() - 1
                        }
                    };
                    if !nodes[*parent_index].succeeding_ids.contains(&id) {
                        nodes[*parent_index].succeeding_ids.push(id);
                    }
                    next_frontier.push((node_index, row));
                }
            }
            frontier = next_frontier;
        }

        debug!(count = nodes.len(), "entity query resolved");
        Ok(nodes)
    }

    async fn fetch_attributes(
        &self,
        package: &str,
        entity: &str,
        data_id: &str,
    ) -> Result<Value, ResolveError> {
        let rows = self
            .query_entity_rows(
                package,
                entity,
                &[(
                    "id".to_string(),
                    "eq".to_string(),
                    Value::String(data_id.to_string()),
                )],
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or(ResolveError::RootMatch { count: 0 })
    }
}

fn synthetic_id(package: &str, entity: &str, row: &Value) -> String {
    let data_id = row.get("id").and_then(Value::as_str).unwrap_or_default();
    PreviewEntityNode::synthetic_id(package, entity, data_id)
}

fn node_from_row(
    package: &str,
    entity: &str,
    row: &Value,
    parent: Option<(&str, &str)>,
    last_flag: bool,
) -> PreviewEntityNode {
    let data_id = row
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let display_name = row
        .get("displayName")
        .or_else(|| row.get("key_name"))
        .or_else(|| row.get("name"))
        .and_then(Value::as_str)
        .unwrap_or(&data_id)
        .to_string();
    let (previous_ids, full_data_id) = match parent {
        Some((parent_id, parent_full)) => (
            vec![parent_id.to_string()],
            format!("{}__{}", parent_full, data_id),
        ),
        None => (vec![], data_id.clone()),
    };

    PreviewEntityNode {
        id: PreviewEntityNode::synthetic_id(package, entity, &data_id),
        package_name: package.to_string(),
        entity_name: entity.to_string(),
        data_id,
        display_name,
        full_data_id,
        last_flag,
        previous_ids,
        succeeding_ids: vec![],
        entity_data: Some(row.clone()),
    }
}

/// Relation attribute values may be a single id or an id array.
fn relation_ids(row: &Value, relation: &str) -> Vec<String> {
    match row.get(relation) {
        Some(Value::String(id)) if !id.is_empty() => vec![id.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_ids_handles_scalar_and_array() {
        let row = serde_json::json!({
            "host": "h1",
            "disks": ["d1", "d2", ""],
            "empty": "",
        });
        assert_eq!(relation_ids(&row, "host"), vec!["h1"]);
        assert_eq!(relation_ids(&row, "disks"), vec!["d1", "d2"]);
        assert!(relation_ids(&row, "empty").is_empty());
        assert!(relation_ids(&row, "missing").is_empty());
    }

    #[test]
    fn node_from_row_builds_full_data_id_path() {
        let row = serde_json::json!({"id": "u1", "displayName": "unit-1"});
        let node = node_from_row("wecmdb", "unit", &row, Some(("root-id", "sys-1")), true);
        assert_eq!(node.id, "wecmdb:unit:u1");
        assert_eq!(node.full_data_id, "sys-1__u1");
        assert_eq!(node.previous_ids, vec!["root-id".to_string()]);
        assert!(node.last_flag);
    }
}
