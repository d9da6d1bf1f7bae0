//! Preview expansion: build the entity graph a user inspects before
//! starting an instance.
//!
//! From the root entity, every definition node carrying an ordered-no and a
//! routine expression contributes its resolved entities; nodes reached by
//! more than one path merge by synthetic id, unioning their references.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

use opsflow_models::{GraphNodeRow, PreviewData, PreviewEntityNode, PreviewRow, ProcDefNode};

use crate::resolver::{split_data_expressions, EntityFilter, ExpressionHop};
use crate::service::EngineDeps;
use crate::EngineError;

#[instrument(skip(deps), fields(proc_def_id = %proc_def_id))]
pub async fn build_preview(
    deps: &Arc<EngineDeps>,
    proc_def_id: Uuid,
    entity_data_id: &str,
    operator: &str,
    persist: bool,
) -> Result<PreviewData, EngineError> {
    let definition = deps.repo.load_definition(proc_def_id).await?;
    let root_filter = EntityFilter::id_eq(entity_data_id);

    // The root entity is the final hop of the root expression.
    let root_hops = deps.resolver.analyze(&definition.def.root_entity).await?;
    let root_hop = root_hops
        .last()
        .cloned()
        .map(|hop| ExpressionHop {
            relation: None,
            ..hop
        })
        .ok_or_else(|| EngineError::Validation("root expression has no hops".to_string()))?;
    let root_nodes = deps.resolver.query(&[root_hop], Some(&root_filter)).await?;
    let mut root_node = root_nodes
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::NotFound(format!("root entity {}", entity_data_id)))?;
    root_node.last_flag = true;
    root_node.full_data_id = root_node.data_id.clone();

    let session_id = format!("proc_session_{}", Uuid::now_v7().simple());
    let now = Utc::now();

    let mut preview_rows = vec![PreviewRow {
        id: Uuid::now_v7(),
        proc_session_id: session_id.clone(),
        proc_def_id,
        bind_type: "process".to_string(),
        proc_def_node_id: None,
        ordered_no: None,
        entity_data_id: root_node.data_id.clone(),
        entity_type_id: definition.def.root_entity.clone(),
        entity_data_name: root_node.display_name.clone(),
        full_data_id: root_node.full_data_id.clone(),
        is_bound: true,
        created_by: operator.to_string(),
        created_at: now,
    }];

    let mut node_index: HashMap<String, usize> = HashMap::new();
    let mut tree: Vec<PreviewEntityNode> = Vec::new();
    node_index.insert(root_node.id.clone(), 0);
    tree.push(root_node.clone());

    for def_node in expansion_order(&definition.nodes) {
        let expressions = node_expressions(def_node);
        let mut resolved: Vec<PreviewEntityNode> = Vec::new();
        for expression in expressions {
            if expression == definition.def.root_entity {
                resolved.push(root_node.clone());
                continue;
            }
            let hops = deps.resolver.analyze(expression).await?;
            resolved.extend(deps.resolver.query(&hops, Some(&root_filter)).await?);
        }
        debug!(node = %def_node.node_id, count = resolved.len(), "preview node data");

        for entity in resolved {
            if entity.last_flag {
                preview_rows.push(PreviewRow {
                    id: Uuid::now_v7(),
                    proc_session_id: session_id.clone(),
                    proc_def_id,
                    bind_type: "taskNode".to_string(),
                    proc_def_node_id: Some(def_node.node_id.clone()),
                    ordered_no: def_node.ordered_no.clone(),
                    entity_data_id: entity.data_id.clone(),
                    entity_type_id: format!("{}:{}", entity.package_name, entity.entity_name),
                    entity_data_name: entity.display_name.clone(),
                    full_data_id: entity.full_data_id.clone(),
                    is_bound: true,
                    created_by: operator.to_string(),
                    created_at: now,
                });
            }
            match node_index.get(&entity.id) {
                Some(&existing) => tree[existing].merge(&entity),
                None => {
                    node_index.insert(entity.id.clone(), tree.len());
                    tree.push(entity);
                }
            }
        }
    }

    let mut data = PreviewData {
        process_session_id: session_id.clone(),
        entity_tree_nodes: tree,
    };
    data.analyze_ref_ids();

    if persist {
        let graph_rows: Vec<GraphNodeRow> = data
            .entity_tree_nodes
            .iter()
            .map(|n| GraphNodeRow {
                id: Uuid::now_v7(),
                proc_session_id: session_id.clone(),
                graph_node_id: n.id.clone(),
                data_id: n.data_id.clone(),
                display_name: n.display_name.clone(),
                package_name: n.package_name.clone(),
                entity_name: n.entity_name.clone(),
                prev_ids: n.previous_ids.join(","),
                succ_ids: n.succeeding_ids.join(","),
                full_data_id: n.full_data_id.clone(),
            })
            .collect();
        deps.repo.save_preview(preview_rows, graph_rows).await?;
    }

    Ok(data)
}

/// Nodes that contribute preview data, ordered-no ascending; equal keys
/// keep input order.
fn expansion_order(nodes: &[ProcDefNode]) -> Vec<&ProcDefNode> {
    let mut contributing: Vec<&ProcDefNode> = nodes
        .iter()
        .filter(|n| {
            n.ordered_no.as_deref().is_some_and(|o| !o.is_empty())
                && n.routine_expression
                    .as_deref()
                    .is_some_and(|r| !r.is_empty())
        })
        .collect();
    contributing.sort_by_key(|n| ordered_no_key(n.ordered_no.as_deref().unwrap_or_default()));
    contributing
}

/// Numeric ordered-no values compare numerically, anything else lexically.
fn ordered_no_key(ordered_no: &str) -> (i64, String) {
    match ordered_no.parse::<i64>() {
        Ok(n) => (n, String::new()),
        Err(_) => (i64::MAX, ordered_no.to_string()),
    }
}

fn node_expressions(def_node: &ProcDefNode) -> Vec<&str> {
    let routine = def_node.routine_expression.as_deref().unwrap_or_default();
    if def_node.node_type == "data" {
        split_data_expressions(routine)
    } else {
        vec![routine]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def_node(node_id: &str, ordered_no: Option<&str>, routine: Option<&str>) -> ProcDefNode {
        ProcDefNode {
            id: Uuid::now_v7(),
            proc_def_id: Uuid::now_v7(),
            node_id: node_id.into(),
            name: node_id.into(),
            node_type: "auto".into(),
            service_name: None,
            routine_expression: routine.map(str::to_string),
            dynamic_bind: false,
            bind_node_id: None,
            risk_check: false,
            timeout_seconds: 0,
            ordered_no: ordered_no.map(str::to_string),
            context_param_nodes: None,
        }
    }

    #[test]
    fn expansion_skips_nodes_without_order_or_expression() {
        let nodes = vec![
            def_node("a", Some("2"), Some("p:e")),
            def_node("b", None, Some("p:e")),
            def_node("c", Some("1"), Some("p:e")),
            def_node("d", Some("3"), None),
        ];
        let order: Vec<&str> = expansion_order(&nodes)
            .iter()
            .map(|n| n.node_id.as_str())
            .collect();
        assert_eq!(order, vec!["c", "a"]);
    }

    #[test]
    fn ordered_no_sorts_numerically_then_lexically() {
        let nodes = vec![
            def_node("ten", Some("10"), Some("p:e")),
            def_node("two", Some("2"), Some("p:e")),
            def_node("alpha", Some("x1"), Some("p:e")),
        ];
        let order: Vec<&str> = expansion_order(&nodes)
            .iter()
            .map(|n| n.node_id.as_str())
            .collect();
        assert_eq!(order, vec!["two", "ten", "alpha"]);
    }

    #[test]
    fn equal_ordered_no_keeps_input_order() {
        let nodes = vec![
            def_node("first", Some("1"), Some("p:e")),
            def_node("second", Some("1"), Some("p:e")),
        ];
        let order: Vec<&str> = expansion_order(&nodes)
            .iter()
            .map(|n| n.node_id.as_str())
            .collect();
        assert_eq!(order, vec!["first", "second"]);
    }
}
