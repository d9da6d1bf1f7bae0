//! Preview read-model: the entity graph a user inspects before starting an
//! instance.
//!
//! Graph back-references are kept as id lists on a flat node vector; nodes
//! never hold owning pointers to each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// One entity in the preview tree.
///
/// `id` is the synthetic graph id `package:entity:dataId`; two query paths
/// reaching the same entity merge into one node by unioning their
/// `previous_ids` / `succeeding_ids`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEntityNode {
    pub id: String,
    pub package_name: String,
    pub entity_name: String,
    pub data_id: String,
    pub display_name: String,
    /// Composite root→node data-id path.
    pub full_data_id: String,
    /// True iff this node terminates some expression path.
    pub last_flag: bool,
    pub previous_ids: Vec<String>,
    pub succeeding_ids: Vec<String>,
    /// Raw attribute map, populated only when the caller asked for it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_data: Option<serde_json::Value>,
}

impl PreviewEntityNode {
    pub fn synthetic_id(package: &str, entity: &str, data_id: &str) -> String {
        format!("{}:{}:{}", package, entity, data_id)
    }

    /// Merge another occurrence of the same entity into this node.
    pub fn merge(&mut self, other: &PreviewEntityNode) {
        self.previous_ids.extend(other.previous_ids.iter().cloned());
        self.succeeding_ids
            .extend(other.succeeding_ids.iter().cloned());
        self.last_flag = self.last_flag || other.last_flag;
    }
}

/// The preview graph for one session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreviewData {
    pub process_session_id: String,
    pub entity_tree_nodes: Vec<PreviewEntityNode>,
}

impl PreviewData {
    /// Deduplicate the prev/succ reference lists after all merges, keeping
    /// first-seen order.
    pub fn analyze_ref_ids(&mut self) {
        for node in &mut self.entity_tree_nodes {
            dedup_keep_order(&mut node.previous_ids);
            dedup_keep_order(&mut node.succeeding_ids);
            node.previous_ids.retain(|id| id != &node.id);
            node.succeeding_ids.retain(|id| id != &node.id);
        }
    }
}

fn dedup_keep_order(ids: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}

/// Persisted preview binding row, one per bound entity per definition node.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PreviewRow {
    pub id: Uuid,
    pub proc_session_id: String,
    pub proc_def_id: Uuid,
    /// `process` for the root entity, `taskNode` for node-bound data.
    pub bind_type: String,
    pub proc_def_node_id: Option<String>,
    pub ordered_no: Option<String>,
    pub entity_data_id: String,
    pub entity_type_id: String,
    pub entity_data_name: String,
    pub full_data_id: String,
    pub is_bound: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted preview graph node; prev/succ id lists are joined with commas
/// in storage.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GraphNodeRow {
    pub id: Uuid,
    pub proc_session_id: String,
    pub graph_node_id: String,
    pub data_id: String,
    pub display_name: String,
    pub package_name: String,
    pub entity_name: String,
    pub prev_ids: String,
    pub succ_ids: String,
    pub full_data_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> PreviewEntityNode {
        PreviewEntityNode {
            id: id.to_string(),
            package_name: "cmdb".into(),
            entity_name: "host".into(),
            data_id: id.to_string(),
            display_name: id.to_string(),
            full_data_id: id.to_string(),
            last_flag: false,
            previous_ids: vec![],
            succeeding_ids: vec![],
            entity_data: None,
        }
    }

    #[test]
    fn merge_unions_refs_and_keeps_last_flag() {
        let mut a = node("cmdb:host:h1");
        a.previous_ids = vec!["p1".into()];
        let mut b = node("cmdb:host:h1");
        b.previous_ids = vec!["p2".into()];
        b.last_flag = true;
        a.merge(&b);
        assert_eq!(a.previous_ids, vec!["p1".to_string(), "p2".to_string()]);
        assert!(a.last_flag);
    }

    #[test]
    fn analyze_ref_ids_dedups_and_drops_self_refs() {
        let mut n = node("x");
        n.previous_ids = vec!["a".into(), "a".into(), "x".into(), "b".into()];
        let mut data = PreviewData {
            process_session_id: "proc_session_1".into(),
            entity_tree_nodes: vec![n],
        };
        data.analyze_ref_ids();
        assert_eq!(
            data.entity_tree_nodes[0].previous_ids,
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
