//! HTTP plugin invoker.
//!
//! Dispatch order: risk check (when armed), then the plugin interface call.
//! Transport failures are retried with exponential backoff inside this
//! layer; structured plugin failures surface immediately.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use opsflow_models::{PluginResult, RiskCheckFinding};

use crate::retry::RetryPolicy;

use super::{ExecOutcome, InvokeError, PluginCall, PluginInvoker};

/// Invoker against the plugin gateway.
pub struct HttpPluginInvoker {
    client: reqwest::Client,
    base_url: String,
    /// Risk-assessment service; `None` when no risk plugin instance is
    /// running, which disarms the check entirely.
    risk_url: Option<String>,
    retry: RetryPolicy,
}

impl HttpPluginInvoker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            risk_url: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_risk_url(mut self, risk_url: impl Into<String>) -> Self {
        self.risk_url = Some(risk_url.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, InvokeError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.client.post(url).json(body).send().await;
            let retryable = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(_) => true,
            };
            match result {
                Ok(response) if !retryable => {
                    if !response.status().is_success() {
                        return Err(InvokeError::Plugin {
                            code: response.status().to_string(),
                            message: response.text().await.unwrap_or_default(),
                        });
                    }
                    return response
                        .json()
                        .await
                        .map_err(|e| InvokeError::Http(e.to_string()));
                }
                Ok(response) => {
                    if !self.retry.has_attempts_remaining(attempt) {
                        return Err(InvokeError::Http(format!(
                            "{} returned {} after {} attempts",
                            url,
                            response.status(),
                            attempt
                        )));
                    }
                    warn!(%url, status = %response.status(), attempt, "transient plugin failure, retrying");
                }
                Err(e) => {
                    if !self.retry.has_attempts_remaining(attempt) {
                        return Err(InvokeError::Http(e.to_string()));
                    }
                    warn!(%url, attempt, "plugin transport error, retrying: {}", e);
                }
            }
            tokio::time::sleep(self.retry.delay_for_attempt(attempt + 1)).await;
        }
    }

    async fn risk_check(&self, call: &PluginCall) -> Result<Vec<RiskCheckFinding>, InvokeError> {
        let Some(risk_url) = &self.risk_url else {
            return Ok(vec![]);
        };
        let url = format!("{}/workflow/check", risk_url);
        let body = serde_json::json!({
            "operator": call.invocation.operator,
            "serviceName": call.invocation.service_name,
            "servicePath": call.invocation.service_path,
            "entityInstances": call.invocation.entity_instances,
            "inputParams": call.invocation.inputs,
        });
        let payload = self
            .post_json(&url, &body)
            .await
            .map_err(|e| InvokeError::Risk(e.to_string()))?;
        let findings = payload
            .get("data")
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        serde_json::from_value(findings).map_err(|e| InvokeError::Risk(e.to_string()))
    }
}

#[async_trait]
impl PluginInvoker for HttpPluginInvoker {
    #[instrument(skip(self, call), fields(request_id = %call.invocation.request_id, service = %call.invocation.service_name))]
    async fn execute(&self, call: PluginCall) -> Result<ExecOutcome, InvokeError> {
        // A continuation token means a human already approved the findings.
        if call.risk_check && call.continue_token.is_none() {
            let findings = self.risk_check(&call).await?;
            if !findings.is_empty() {
                debug!(count = findings.len(), "risk findings hold the node");
                return Ok(ExecOutcome::RiskHold(findings));
            }
        }

        let url = format!(
            "{}/{}",
            self.base_url,
            call.invocation.service_name.replace(':', "/")
        );
        let body = serde_json::to_value(&call.invocation)
            .map_err(|e| InvokeError::Http(e.to_string()))?;
        let payload = self.post_json(&url, &body).await?;

        let result: PluginResult = serde_json::from_value(payload.clone()).map_err(|_| {
            InvokeError::Plugin {
                code: "MALFORMED".to_string(),
                message: format!("unparseable plugin response: {}", payload),
            }
        })?;

        match result.status.as_str() {
            "OK" => Ok(ExecOutcome::Completed(result)),
            // Asynchronous plugins acknowledge with a tracking response and
            // POST the callback later.
            "PENDING" => Ok(ExecOutcome::Pending {
                request_id: result.request_id,
            }),
            code => Err(InvokeError::Plugin {
                code: code.to_string(),
                message: result.message,
            }),
        }
    }
}
