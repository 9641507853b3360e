// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Redaction of values before they are written to the audit log.

use serde_json::{Map, Value};

const MASK: &str = "[REDACTED]";
const MAX_STRING_LEN: usize = 256;
const MAX_ARRAY_ITEMS: usize = 50;
const MAX_DEPTH: usize = 4;

/// Key fragments whose values are never logged (matched case-insensitively).
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "authorization",
    "api_key",
    "apikey",
    "private_key",
    "credential",
    "cookie",
    "session",
];

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|fragment| key.contains(fragment))
}

/// Copy of `value` with secrets masked, long strings truncated and deep
/// nesting collapsed.
pub fn redact(value: &Value) -> Value {
    redact_at(value, 0)
}

fn redact_at(value: &Value, depth: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s)),
        Value::Array(items) => {
            if depth >= MAX_DEPTH {
                return Value::String(format!("[array of {}]", items.len()));
            }
            let mut out: Vec<Value> = items
                .iter()
                .take(MAX_ARRAY_ITEMS)
                .map(|item| redact_at(item, depth + 1))
                .collect();
            if items.len() > MAX_ARRAY_ITEMS {
                out.push(Value::String(format!(
                    "[{} more]",
                    items.len() - MAX_ARRAY_ITEMS
                )));
            }
            Value::Array(out)
        }
        Value::Object(fields) => {
            if depth >= MAX_DEPTH {
                return Value::String(format!("[object with {} fields]", fields.len()));
            }
            let mut out = Map::with_capacity(fields.len());
            for (key, field) in fields {
                let redacted = if is_sensitive(key) {
                    Value::String(MASK.to_string())
                } else {
                    redact_at(field, depth + 1)
                };
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_STRING_LEN {
        return s.to_string();
    }
    let kept: String = s.chars().take(MAX_STRING_LEN).collect();
    format!("{kept}…")
}
