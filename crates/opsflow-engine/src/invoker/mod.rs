//! `PluginInvoker`: marshals inputs, performs the optional risk-assessment
//! callout, invokes the target plugin and correlates asynchronous callbacks
//! back to the waiting node.

mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use opsflow_models::{
    DataBindingRow, InputParamData, ParamBindType, PluginInvocation, PluginResult,
    ProcDefNodeParam, RiskCheckFinding,
};

pub use http::HttpPluginInvoker;

/// Error type for plugin dispatch.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// A required input parameter resolved to null. Validation; never sent.
    #[error("required parameter `{0}` resolved to null")]
    MissingParam(String),

    /// Transport-level failure after the retry budget was exhausted.
    #[error("plugin transport failure: {0}")]
    Http(String),

    /// Structured plugin failure (`status != OK`).
    #[error("plugin returned {code}: {message}")]
    Plugin { code: String, message: String },

    /// The risk-assessment service itself failed.
    #[error("risk check failed: {0}")]
    Risk(String),
}

/// Outcome of one plugin dispatch.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    /// Synchronous plugin returned its outputs inline.
    Completed(PluginResult),

    /// Asynchronous plugin accepted the request; a callback carrying the
    /// request id arrives later.
    Pending { request_id: String },

    /// Risk findings put the node on hold pending human approval.
    RiskHold(Vec<RiskCheckFinding>),
}

/// One dispatch, risk-check decision included.
#[derive(Debug, Clone)]
pub struct PluginCall {
    pub invocation: PluginInvocation,
    pub risk_check: bool,
    /// Approval token from a previous risk hold; its presence skips the
    /// risk callout.
    pub continue_token: Option<String>,
}

/// Collaborator contract consumed by the node runtime.
#[async_trait]
pub trait PluginInvoker: Send + Sync + 'static {
    async fn execute(&self, call: PluginCall) -> Result<ExecOutcome, InvokeError>;
}

/// Mint a fresh request token. The same token is never resent unless the
/// previous attempt is known lost.
pub fn new_request_id() -> String {
    format!("flowexec_{}", Uuid::now_v7().simple())
}

/// In-memory requestId → (workflow, node) index for asynchronous callbacks.
///
/// The durable `proc_ins_node.request_id` column is the source of truth
/// across restarts; this map is the fast path for callbacks landing on the
/// worker that dispatched the request.
#[derive(Default)]
pub struct CorrelationIndex {
    entries: DashMap<String, (Uuid, String)>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str, workflow_id: Uuid, node_id: &str) {
        self.entries
            .insert(request_id.to_string(), (workflow_id, node_id.to_string()));
    }

    pub fn lookup(&self, request_id: &str) -> Option<(Uuid, String)> {
        self.entries.get(request_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, request_id: &str) {
        self.entries.remove(request_id);
    }
}

/// Resolve declared input parameters against their bind sources, one input
/// row per bound entity instance.
///
/// - `constant` takes the authored literal
/// - `context` looks up the producing node's structured output by name
/// - `entity` reads an attribute of the target entity instance
///
/// A required parameter resolving to null fails before invocation.
pub fn materialize_inputs(
    params: &[&ProcDefNodeParam],
    bindings: &[DataBindingRow],
    upstream_outputs: &HashMap<String, Value>,
    entity_attrs: &HashMap<String, Value>,
) -> Result<Vec<InputParamData>, InvokeError> {
    let mut rows = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let mut row = InputParamData::new();
        for param in params {
            let bind_type: ParamBindType = param
                .bind_type
                .parse()
                .map_err(|_| InvokeError::MissingParam(param.param_id.clone()))?;
            let value = match bind_type {
                ParamBindType::Constant => param
                    .value
                    .as_ref()
                    .map(|v| Value::String(v.clone()))
                    .unwrap_or(Value::Null),
                ParamBindType::Context => lookup_context_value(param, upstream_outputs),
                ParamBindType::Entity => param
                    .entity_attr
                    .as_deref()
                    .and_then(|attr| {
                        entity_attrs
                            .get(&binding.entity_data_id)
                            .and_then(|attrs| attrs.get(attr))
                    })
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            if value.is_null() && param.required {
                return Err(InvokeError::MissingParam(param.param_id.clone()));
            }
            row.insert(param.param_id.clone(), value);
        }
        row.insert(
            "callbackParameter".to_string(),
            Value::String(binding.entity_data_id.clone()),
        );
        rows.push(row);
    }
    Ok(rows)
}

fn lookup_context_value(
    param: &ProcDefNodeParam,
    upstream_outputs: &HashMap<String, Value>,
) -> Value {
    let Some(source_node) = param.ctx_bind_node.as_deref() else {
        return Value::Null;
    };
    let Some(output) = upstream_outputs.get(source_node) else {
        return Value::Null;
    };
    let name = param.ctx_bind_name.as_deref().unwrap_or(&param.param_id);
    match output {
        // Aggregate outputs: take the named field of the first row.
        Value::Array(rows) => rows
            .first()
            .and_then(|row| row.get(name))
            .cloned()
            .unwrap_or(Value::Null),
        Value::Object(map) => {
            // Service nodes store `{"outputs": [...], "raw": ...}`.
            if let Some(Value::Array(rows)) = map.get("outputs") {
                rows.first()
                    .and_then(|row| row.get(name))
                    .cloned()
                    .unwrap_or(Value::Null)
            } else {
                map.get(name).cloned().unwrap_or(Value::Null)
            }
        }
        _ => Value::Null,
    }
}

/// Reshape raw plugin outputs into flat string-keyed rows: scalars are kept,
/// numbers and booleans coerce to their canonical string form, nested values
/// stay as JSON. The raw response is retained on the instance node
/// separately.
pub fn shape_outputs(outputs: &[Value]) -> Vec<Value> {
    outputs
        .iter()
        .map(|row| match row {
            Value::Object(fields) => {
                let shaped: serde_json::Map<String, Value> = fields
                    .iter()
                    .map(|(key, value)| {
                        let coerced = match value {
                            Value::Number(n) => Value::String(n.to_string()),
                            Value::Bool(b) => Value::String(b.to_string()),
                            other => other.clone(),
                        };
                        (key.clone(), coerced)
                    })
                    .collect();
                Value::Object(shaped)
            }
            other => other.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(
        param_id: &str,
        bind_type: &str,
        value: Option<&str>,
        required: bool,
    ) -> ProcDefNodeParam {
        ProcDefNodeParam {
            id: Uuid::now_v7(),
            proc_def_node_id: Uuid::now_v7(),
            param_id: param_id.into(),
            name: param_id.into(),
            bind_type: bind_type.into(),
            value: value.map(str::to_string),
            ctx_bind_node: None,
            ctx_bind_type: None,
            ctx_bind_name: None,
            entity_attr: None,
            required,
        }
    }

    fn binding(data_id: &str) -> DataBindingRow {
        DataBindingRow {
            id: Uuid::now_v7(),
            proc_ins_id: Uuid::now_v7(),
            proc_ins_node_id: Uuid::now_v7(),
            entity_data_id: data_id.into(),
            entity_type_id: "wecmdb:host".into(),
            entity_data_name: data_id.into(),
            full_data_id: data_id.into(),
        }
    }

    #[test]
    fn constant_params_take_the_literal() {
        let p = param("env", "constant", Some("prod"), true);
        let rows = materialize_inputs(
            &[&p],
            &[binding("h1")],
            &HashMap::new(),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["env"], Value::String("prod".into()));
        assert_eq!(rows[0]["callbackParameter"], Value::String("h1".into()));
    }

    #[test]
    fn context_params_read_upstream_output() {
        let mut p = param("version", "context", None, true);
        p.ctx_bind_node = Some("build".into());
        p.ctx_bind_name = Some("artifactVersion".into());
        let mut upstream = HashMap::new();
        upstream.insert(
            "build".to_string(),
            serde_json::json!([{"artifactVersion": "1.4.2"}]),
        );
        let rows =
            materialize_inputs(&[&p], &[binding("h1")], &upstream, &HashMap::new()).unwrap();
        assert_eq!(rows[0]["version"], Value::String("1.4.2".into()));
    }

    #[test]
    fn entity_params_read_instance_attributes() {
        let mut p = param("ip", "entity", None, true);
        p.entity_attr = Some("ip_address".into());
        let mut attrs = HashMap::new();
        attrs.insert("h1".to_string(), serde_json::json!({"ip_address": "10.0.0.8"}));
        let rows = materialize_inputs(&[&p], &[binding("h1")], &HashMap::new(), &attrs).unwrap();
        assert_eq!(rows[0]["ip"], Value::String("10.0.0.8".into()));
    }

    #[test]
    fn required_null_fails_before_invocation() {
        let p = param("env", "constant", None, true);
        let err = materialize_inputs(&[&p], &[binding("h1")], &HashMap::new(), &HashMap::new());
        assert!(matches!(err, Err(InvokeError::MissingParam(id)) if id == "env"));
    }

    #[test]
    fn optional_null_is_sent_as_null() {
        let p = param("env", "constant", None, false);
        let rows =
            materialize_inputs(&[&p], &[binding("h1")], &HashMap::new(), &HashMap::new()).unwrap();
        assert_eq!(rows[0]["env"], Value::Null);
    }

    #[test]
    fn shape_outputs_coerces_scalars() {
        let shaped = shape_outputs(&[serde_json::json!({"retCode": 0, "ok": true, "msg": "x"})]);
        assert_eq!(shaped[0]["retCode"], Value::String("0".into()));
        assert_eq!(shaped[0]["ok"], Value::String("true".into()));
        assert_eq!(shaped[0]["msg"], Value::String("x".into()));
    }

    #[test]
    fn correlation_index_round_trip() {
        let index = CorrelationIndex::new();
        let wf = Uuid::now_v7();
        index.register("flowexec_1", wf, "n2");
        assert_eq!(index.lookup("flowexec_1"), Some((wf, "n2".to_string())));
        index.remove("flowexec_1");
        assert!(index.lookup("flowexec_1").is_none());
    }
}
