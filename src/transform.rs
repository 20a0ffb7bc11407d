//! Cache-control injection for chat request bodies.
//!
//! Bodies are handled as `serde_json::Value` trees so fields this module does
//! not know about survive untouched. Only `messages[*].cache_control`,
//! `messages[*].content[*].cache_control` and the shape of the last message's
//! content are ever rewritten. Everything here is pure (no I/O).

use crate::error::{ProxyError, Result};
use serde_json::{Map, Value};

const CACHE_CONTROL: &str = "cache_control";
const EPHEMERAL: &str = "ephemeral";

/// The annotation attached to the last content block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheControl {
    pub ttl: Option<String>,
}

impl CacheControl {
    /// `{"type": "ephemeral"}`
    #[must_use]
    pub fn ephemeral() -> Self {
        Self { ttl: None }
    }

    /// `{"type": "ephemeral", "ttl": <ttl>}`
    #[must_use]
    pub fn with_ttl(ttl: impl Into<String>) -> Self {
        Self {
            ttl: Some(ttl.into()),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut marker = Map::new();
        marker.insert("type".to_string(), Value::String(EPHEMERAL.to_string()));
        if let Some(ref ttl) = self.ttl {
            marker.insert("ttl".to_string(), Value::String(ttl.clone()));
        }
        Value::Object(marker)
    }
}

/// An inbound chat body whose `messages` shape has been checked.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    body: Map<String, Value>,
}

impl ChatRequest {
    /// Decode and validate a raw request body.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProxyError::malformed(format!("Invalid JSON in request body: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(body) = value else {
            return Err(ProxyError::malformed("Request body must be a JSON object"));
        };

        let messages = body
            .get("messages")
            .ok_or_else(|| ProxyError::malformed("Missing required field: messages"))?;
        let Value::Array(messages) = messages else {
            return Err(ProxyError::malformed("messages must be an array"));
        };

        for (i, message) in messages.iter().enumerate() {
            let Value::Object(message) = message else {
                return Err(ProxyError::malformed(format!(
                    "messages[{i}] must be an object"
                )));
            };
            if !matches!(message.get("role"), Some(Value::String(_))) {
                return Err(ProxyError::malformed(format!(
                    "messages[{i}] must have a string role"
                )));
            }
            if !matches!(
                message.get("content"),
                None | Some(Value::Null | Value::String(_) | Value::Array(_))
            ) {
                return Err(ProxyError::malformed(format!(
                    "messages[{i}].content must be a string or an array of content blocks"
                )));
            }
        }

        Ok(Self { body })
    }

    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.body.get("model").and_then(Value::as_str)
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn messages(&self) -> &[Value] {
        self.body
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Remove the named top-level fields, returning the ones that were present.
    pub fn drop_params(&mut self, names: &[String]) -> Vec<String> {
        let mut dropped = Vec::new();
        self.body.retain(|key, _| {
            if names.iter().any(|n| n == key) {
                dropped.push(key.clone());
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Apply the cache-control rewrite in place.
    pub fn apply_cache_control(&mut self, marker: &CacheControl) {
        let Some(Value::Array(messages)) = self.body.get_mut("messages") else {
            return;
        };
        if messages.is_empty() {
            return;
        }

        for message in messages.iter_mut() {
            if let Value::Object(message) = message {
                strip_cache_control(message);
            }
        }

        if let Some(Value::Object(last)) = messages.last_mut() {
            annotate_last_block(last, marker.to_value());
        }
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

/// Rewrite a request body so exactly one cache marker sits on the last
/// content block of the last message.
///
/// Bodies with an empty `messages` array come back unchanged.
pub fn transform(body: Value, marker: &CacheControl) -> Result<Value> {
    let mut request = ChatRequest::from_value(body)?;
    request.apply_cache_control(marker);
    Ok(request.into_value())
}

fn strip_cache_control(message: &mut Map<String, Value>) {
    message.retain(|key, _| key != CACHE_CONTROL);

    if let Some(Value::Array(blocks)) = message.get_mut("content") {
        for block in blocks.iter_mut() {
            if let Value::Object(block) = block {
                block.retain(|key, _| key != CACHE_CONTROL);
            }
        }
    }
}

fn annotate_last_block(message: &mut Map<String, Value>, marker: Value) {
    let content = message
        .get_mut("content")
        .map(Value::take)
        .unwrap_or(Value::Null);

    let mut blocks = match content {
        Value::String(text) => vec![text_block(text)],
        Value::Array(blocks) => blocks,
        _ => Vec::new(),
    };

    match blocks.last_mut() {
        Some(Value::Object(_)) => {}
        Some(last) => {
            let text = match last.take() {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            *last = text_block(text);
        }
        None => blocks.push(text_block(String::new())),
    }

    if let Some(Value::Object(block)) = blocks.last_mut() {
        block.insert(CACHE_CONTROL.to_string(), marker);
    }

    message.insert("content".to_string(), Value::Array(blocks));
}

fn text_block(text: String) -> Value {
    let mut block = Map::new();
    block.insert("type".to_string(), Value::String("text".to_string()));
    block.insert("text".to_string(), Value::String(text));
    Value::Object(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn marker() -> CacheControl {
        CacheControl::with_ttl("1h")
    }

    /// Paths of every `cache_control` found in `messages`.
    fn annotations(body: &Value) -> Vec<(usize, Option<usize>)> {
        let mut found = Vec::new();
        for (i, msg) in body["messages"].as_array().unwrap().iter().enumerate() {
            if msg.get(CACHE_CONTROL).is_some() {
                found.push((i, None));
            }
            if let Some(blocks) = msg["content"].as_array() {
                for (j, block) in blocks.iter().enumerate() {
                    if block.get(CACHE_CONTROL).is_some() {
                        found.push((i, Some(j)));
                    }
                }
            }
        }
        found
    }

    fn conversation() -> Value {
        json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "temperature": 0.2,
            "system": [{"type": "text", "text": "be brief", "cache_control": {"type": "ephemeral"}}],
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "first", "cache_control": {"type": "ephemeral"}},
                    {"type": "text", "text": "second"}
                ]},
                {"role": "assistant", "content": "ok", "cache_control": {"type": "ephemeral"}},
                {"role": "user", "content": [
                    {"type": "text", "text": "third"},
                    {"type": "image", "source": {"type": "base64", "data": "AAAA"}}
                ]}
            ]
        })
    }

    #[test]
    fn test_single_annotation_on_last_block() {
        let out = transform(conversation(), &marker()).unwrap();

        assert_eq!(annotations(&out), vec![(2, Some(1))]);
        assert_eq!(
            out["messages"][2]["content"][1][CACHE_CONTROL],
            json!({"type": "ephemeral", "ttl": "1h"})
        );
    }

    #[test]
    fn test_idempotent() {
        let once = transform(conversation(), &marker()).unwrap();
        let twice = transform(once.clone(), &marker()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(
            serde_json::to_string(&once).unwrap(),
            serde_json::to_string(&twice).unwrap()
        );
    }

    #[test]
    fn test_empty_messages_passthrough() {
        let body = json!({"model": "m", "messages": [], "top_k": 3});
        let out = transform(body.clone(), &marker()).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn test_string_content_normalized() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "hello"}
            ]
        });
        let out = transform(body, &CacheControl::ephemeral()).unwrap();

        assert_eq!(out["messages"][0]["content"], "sys");
        assert_eq!(
            out["messages"][1]["content"],
            json!([{"type": "text", "text": "hello", "cache_control": {"type": "ephemeral"}}])
        );
    }

    #[test]
    fn test_null_and_empty_content() {
        for content in [json!(null), json!([])] {
            let body = json!({"messages": [{"role": "assistant", "content": content}]});
            let out = transform(body, &marker()).unwrap();
            assert_eq!(
                out["messages"][0]["content"],
                json!([{"type": "text", "text": "", "cache_control": {"type": "ephemeral", "ttl": "1h"}}])
            );
        }

        let missing = json!({"messages": [{"role": "assistant"}]});
        let out = transform(missing, &marker()).unwrap();
        assert_eq!(annotations(&out), vec![(0, Some(0))]);
    }

    #[test]
    fn test_bare_string_block_becomes_text_block() {
        let body = json!({"messages": [{"role": "user", "content": ["a", "b"]}]});
        let out = transform(body, &CacheControl::ephemeral()).unwrap();
        assert_eq!(out["messages"][0]["content"][0], "a");
        assert_eq!(
            out["messages"][0]["content"][1],
            json!({"type": "text", "text": "b", "cache_control": {"type": "ephemeral"}})
        );
    }

    #[test]
    fn test_tool_result_last_block_annotated() {
        let body = json!({"messages": [
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "t1", "name": "lookup", "input": {}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "42"}
            ]}
        ]});
        let out = transform(body, &marker()).unwrap();
        assert_eq!(annotations(&out), vec![(1, Some(0))]);
        assert_eq!(out["messages"][1]["content"][0]["type"], "tool_result");
    }

    #[test]
    fn test_other_fields_untouched() {
        let input = conversation();
        let out = transform(input.clone(), &marker()).unwrap();
        for key in ["model", "max_tokens", "temperature", "system"] {
            assert_eq!(out[key], input[key], "field {key}");
        }
        let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
        assert_eq!(
            keys,
            vec!["model", "max_tokens", "temperature", "system", "messages"]
        );
    }

    #[test]
    fn test_malformed_bodies() {
        assert!(matches!(
            ChatRequest::parse(b"not json"),
            Err(ProxyError::MalformedRequest { .. })
        ));
        assert!(matches!(
            ChatRequest::parse(br#"["array"]"#),
            Err(ProxyError::MalformedRequest { .. })
        ));
        assert!(matches!(
            ChatRequest::parse(br#"{"model": "m", "messages": "hello"}"#),
            Err(ProxyError::MalformedRequest { .. })
        ));
        assert!(matches!(
            ChatRequest::parse(br#"{"model": "m"}"#),
            Err(ProxyError::MalformedRequest { .. })
        ));
        assert!(matches!(
            ChatRequest::parse(br#"{"messages": [{"content": "x"}]}"#),
            Err(ProxyError::MalformedRequest { .. })
        ));
        assert!(matches!(
            transform(json!({"messages": 3}), &marker()),
            Err(ProxyError::MalformedRequest { .. })
        ));
    }

    #[test]
    fn test_non_block_content_rejected_not_rewritten() {
        for content in [
            json!({"type": "text", "text": "keep me"}),
            json!(42),
            json!(true),
        ] {
            let body = json!({"messages": [
                {"role": "user", "content": "earlier"},
                {"role": "user", "content": content}
            ]});
            let err = transform(body, &marker()).unwrap_err();
            assert!(matches!(err, ProxyError::MalformedRequest { .. }), "content {content}");
            assert!(err.to_string().contains("messages[1].content"));
        }

        let earlier = json!({"messages": [
            {"role": "user", "content": {"type": "text", "text": "keep me"}},
            {"role": "user", "content": "latest"}
        ]});
        assert!(transform(earlier, &marker()).is_err());
    }

    #[test]
    fn test_request_accessors_and_drop_params() {
        let mut req = ChatRequest::parse(
            br#"{"model": "m", "stream": true, "top_p": 0.9, "messages": [{"role": "user", "content": "hi"}]}"#,
        )
        .unwrap();
        assert_eq!(req.model(), Some("m"));
        assert!(req.is_streaming());
        assert_eq!(req.messages().len(), 1);

        let dropped = req.drop_params(&["top_p".to_string(), "betas".to_string()]);
        assert_eq!(dropped, vec!["top_p".to_string()]);
        assert!(req.into_value().get("top_p").is_none());
    }
}
