//! Builtin tool set
//!
//! Small tools registered at startup so the gateway is usable and testable
//! out of the box. External systems register their own tools through the
//! public [`ToolRegistry`] API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Tool, ToolError, ToolRegistry, ToolResult};

/// Register every builtin tool
pub fn register_all(registry: &ToolRegistry) {
    registry.register(Arc::new(Echo));
    registry.register(Arc::new(WordStats));
    registry.register(Arc::new(JsonExtract));
    registry.register(Arc::new(HttpRequest::new()));
}

/// Returns its params unchanged
pub struct Echo;

#[async_trait]
impl Tool for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, params: Value) -> ToolResult<Value> {
        Ok(params)
    }
}

/// Word and character counts over `params.text`
pub struct WordStats;

#[async_trait]
impl Tool for WordStats {
    fn name(&self) -> &str {
        "word_stats"
    }

    async fn invoke(&self, params: Value) -> ToolResult<Value> {
        let text = params
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_params("word_stats", "missing string 'text'"))?;

        let words: Vec<&str> = text.split_whitespace().collect();
        Ok(json!({
            "count": words.len(),
            "chars": text.chars().count(),
            "words": words,
        }))
    }
}

/// Dotted-path lookup into `params.value`
pub struct JsonExtract;

#[async_trait]
impl Tool for JsonExtract {
    fn name(&self) -> &str {
        "json_extract"
    }

    async fn invoke(&self, params: Value) -> ToolResult<Value> {
        let path = params
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_params("json_extract", "missing string 'path'"))?;
        let mut current = params
            .get("value")
            .ok_or_else(|| ToolError::invalid_params("json_extract", "missing 'value'"))?;

        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i))
                    .unwrap_or(&Value::Null),
                _ => &Value::Null,
            };
        }
        Ok(json!({"value": current.clone()}))
    }
}

/// Outbound HTTP request: `{url, method?, headers?, body?, timeout_secs?}`
pub struct HttpRequest {
    client: reqwest::Client,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequest {
    fn name(&self) -> &str {
        "http_request"
    }

    async fn invoke(&self, params: Value) -> ToolResult<Value> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_params("http_request", "missing string 'url'"))?;
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let timeout = params
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(10);

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            other => {
                return Err(ToolError::invalid_params(
                    "http_request",
                    format!("unsupported method '{other}'"),
                ));
            }
        }
        .timeout(Duration::from_secs(timeout));

        if let Some(Value::Object(headers)) = params.get("headers") {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    request = request.header(k, v);
                }
            }
        }
        if let Some(body) = params.get("body") {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::failed("http_request", e))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::failed("http_request", e))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(json!({"status": status, "body": body}))
    }
}
