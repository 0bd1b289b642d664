//! Trigger context construction
//!
//! Every pipeline invocation starts from a fresh context map describing what
//! triggered it. Namespaces are fixed: `webhook.*` for HTTP requests,
//! `websocket.*` for socket events, `url.*` for path parameters extracted
//! from HTML route patterns, `query.*` for query parameters.

use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// The inbound HTTP request described by the `webhook.*` namespace
#[derive(Debug)]
pub struct WebhookRequest<'a> {
    pub endpoint: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub remote_addr: &'a str,
    pub headers: &'a [(String, String)],
    pub query: &'a [(String, String)],
    pub body: Value,
    /// Auth outcome snapshot (`method` and `verified`)
    pub auth: Value,
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Builds the base context for one pipeline invocation.
///
/// Each invocation gets its own map; nothing here is shared or cached.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    map: Map<String, Value>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an arbitrary namespace
    pub fn namespace(mut self, name: &str, value: Value) -> Self {
        self.map.insert(name.to_string(), value);
        self
    }

    /// `webhook.*`: the inbound HTTP request, including where it came from,
    /// which endpoint received it, how auth went and when it arrived
    pub fn webhook(self, request: WebhookRequest<'_>) -> Self {
        let headers: Map<String, Value> = request
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let query_map: Map<String, Value> = request
            .query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        self.namespace(
            "webhook",
            json!({
                "endpoint": request.endpoint,
                "method": request.method,
                "path": request.path,
                "remote_addr": request.remote_addr,
                "headers": headers,
                "query": query_map,
                "body": request.body,
                "auth": request.auth,
                "received_at": timestamp(),
            }),
        )
    }

    /// `websocket.*`: the connection and, for message events, the payload.
    ///
    /// `message` is the parsed JSON body when the frame parses, otherwise
    /// the raw text as a string. `timestamp` is the event time, distinct
    /// from the connection's `connected_at`.
    pub fn websocket(self, client: Value, message: Option<&str>) -> Self {
        let mut ws = Map::new();
        if let Value::Object(fields) = client {
            ws.extend(fields);
        }
        ws.insert("timestamp".to_string(), Value::String(timestamp()));
        if let Some(text) = message {
            let parsed = serde_json::from_str::<Value>(text)
                .unwrap_or_else(|_| Value::String(text.to_string()));
            ws.insert("message".to_string(), parsed);
        }
        self.namespace("websocket", Value::Object(ws))
    }

    /// `url.*`: named path segments matched by an HTML route pattern
    pub fn url_params<'a>(self, params: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let map: Map<String, Value> = params
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        self.namespace("url", Value::Object(map))
    }

    /// `query.*`: query parameters as a top-level namespace
    pub fn query(self, pairs: &[(String, String)]) -> Self {
        let map: Map<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        self.namespace("query", Value::Object(map))
    }

    pub fn build(self) -> Map<String, Value> {
        self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_namespace() {
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        let query = vec![("v".to_string(), "1".to_string())];
        let ctx = ContextBuilder::new()
            .webhook(WebhookRequest {
                endpoint: "hooks",
                method: "POST",
                path: "/hooks",
                remote_addr: "10.0.0.7:51000",
                headers: &headers,
                query: &query,
                body: json!({"message": "hi"}),
                auth: json!({"method": "bearer_token", "verified": true}),
            })
            .build();

        assert_eq!(ctx["webhook"]["endpoint"], json!("hooks"));
        assert_eq!(ctx["webhook"]["method"], json!("POST"));
        assert_eq!(ctx["webhook"]["path"], json!("/hooks"));
        assert_eq!(ctx["webhook"]["remote_addr"], json!("10.0.0.7:51000"));
        assert_eq!(ctx["webhook"]["headers"]["content-type"], json!("application/json"));
        assert_eq!(ctx["webhook"]["query"]["v"], json!("1"));
        assert_eq!(ctx["webhook"]["body"]["message"], json!("hi"));
        assert_eq!(ctx["webhook"]["auth"]["verified"], json!(true));
        assert!(!ctx["webhook"]["received_at"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_websocket_message_parsed_when_json() {
        let client = json!({"client_id": "c1", "remote_addr": "127.0.0.1:9"});
        let ctx = ContextBuilder::new()
            .websocket(client.clone(), Some(r#"{"kind":"ping"}"#))
            .build();
        assert_eq!(ctx["websocket"]["client_id"], json!("c1"));
        assert_eq!(ctx["websocket"]["message"]["kind"], json!("ping"));
        // Event time rides along with the connection metadata
        assert!(!ctx["websocket"]["timestamp"].as_str().unwrap().is_empty());

        let ctx = ContextBuilder::new()
            .websocket(client, Some("plain text"))
            .build();
        assert_eq!(ctx["websocket"]["message"], json!("plain text"));
    }

    #[test]
    fn test_url_and_query_namespaces() {
        let ctx = ContextBuilder::new()
            .url_params([("room", "lobby")])
            .query(&[("page".to_string(), "2".to_string())])
            .build();
        assert_eq!(ctx["url"]["room"], json!("lobby"));
        assert_eq!(ctx["query"]["page"], json!("2"));
    }
}
