// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token extraction from dissected frames.
//!
//! Protocol-agnostic: works over frame fields, so one walk covers HTTP
//! headers, gRPC metadata, JSON bodies, and plaintext payloads alike.

use libdd_stream_common::{FieldValue, Frame};
use serde::Serialize;

/// Where a token value was observed. The class set a token accumulates over
/// a session drives the leakage checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextClass {
    Header,
    Cookie,
    UrlQuery,
    Referer,
    Body,
    LogPayload,
}

impl ContextClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextClass::Header => "header",
            ContextClass::Cookie => "cookie",
            ContextClass::UrlQuery => "url_query",
            ContextClass::Referer => "referer",
            ContextClass::Body => "body",
            ContextClass::LogPayload => "log_payload",
        }
    }

    /// Contexts a secret has no business appearing in.
    pub fn is_unsafe(&self) -> bool {
        matches!(
            self,
            ContextClass::UrlQuery | ContextClass::Referer | ContextClass::LogPayload
        )
    }
}

#[derive(Debug, Clone)]
pub struct TokenObservation {
    /// bearer, api_key, basic_auth, cookie, custom_header.
    pub token_type: &'static str,
    pub value: String,
    pub context: ContextClass,
}

/// Relative sensitivity of a token type, used to scale severity.
pub fn token_weight(token_type: &str) -> u8 {
    match token_type {
        "bearer" | "api_key" => 3,
        "basic_auth" => 3,
        "cookie" => 2,
        _ => 1,
    }
}

const QUERY_TOKEN_KEYS: [&str; 6] = [
    "token",
    "access_token",
    "api_key",
    "apikey",
    "auth",
    "bearer",
];

/// Collect every token-looking value in a frame, tagged with its context.
pub fn extract(frame: &Frame) -> Vec<TokenObservation> {
    let mut found = Vec::new();

    if let Some(FieldValue::Map(headers)) = frame.field("headers") {
        for (name, value) in headers {
            let Some(value) = value.as_str() else { continue };
            match name.as_str() {
                "authorization" => {
                    if let Some(token) = strip_scheme(value, "bearer ") {
                        found.push(TokenObservation {
                            token_type: "bearer",
                            value: token.to_string(),
                            context: ContextClass::Header,
                        });
                    } else if let Some(token) = strip_scheme(value, "basic ") {
                        found.push(TokenObservation {
                            token_type: "basic_auth",
                            value: token.to_string(),
                            context: ContextClass::Header,
                        });
                    }
                }
                "referer" => {
                    for (key, token) in query_pairs(value) {
                        if QUERY_TOKEN_KEYS.contains(&key.as_str()) {
                            found.push(TokenObservation {
                                token_type: "bearer",
                                value: token,
                                context: ContextClass::Referer,
                            });
                        }
                    }
                }
                _ => {
                    if name.contains("api-key") || name.contains("api_key") {
                        found.push(TokenObservation {
                            token_type: "api_key",
                            value: value.to_string(),
                            context: ContextClass::Header,
                        });
                    } else if name.starts_with("x-") && name.contains("token") {
                        found.push(TokenObservation {
                            token_type: "custom_header",
                            value: value.to_string(),
                            context: ContextClass::Header,
                        });
                    }
                }
            }
        }
    }

    if let Some(FieldValue::Map(cookies)) = frame.field("cookies") {
        for value in cookies.values() {
            if let Some(value) = value.as_str() {
                if !value.is_empty() {
                    found.push(TokenObservation {
                        token_type: "cookie",
                        value: value.to_string(),
                        context: ContextClass::Cookie,
                    });
                }
            }
        }
    }

    if let Some(path) = frame.field_str("path") {
        if let Some((_, query)) = path.split_once('?') {
            for (key, value) in query_pairs(query) {
                if QUERY_TOKEN_KEYS.contains(&key.as_str()) && !value.is_empty() {
                    found.push(TokenObservation {
                        token_type: "bearer",
                        value,
                        context: ContextClass::UrlQuery,
                    });
                }
            }
        }
    }

    if let Some(FieldValue::Map(metadata)) = frame.field("metadata") {
        for (name, value) in metadata {
            let Some(value) = value.as_str() else { continue };
            if name.contains("token") || name.contains("key") || name.contains("secret") {
                found.push(TokenObservation {
                    token_type: "api_key",
                    value: value.to_string(),
                    context: ContextClass::Header,
                });
            }
        }
    }

    if let Some(document) = frame.field("document") {
        walk_document(document, &mut found);
    }

    // Unstructured output: a token in a log line is a leak context itself.
    if let Some(text) = frame.field_str("text") {
        for (key, value) in kv_pairs(text) {
            if QUERY_TOKEN_KEYS.contains(&key.as_str()) && !value.is_empty() {
                found.push(TokenObservation {
                    token_type: "bearer",
                    value,
                    context: ContextClass::LogPayload,
                });
            }
        }
    }

    found
}

fn walk_document(value: &FieldValue, found: &mut Vec<TokenObservation>) {
    match value {
        FieldValue::Map(map) => {
            for (key, item) in map {
                if let FieldValue::Str(s) = item {
                    let lowered = key.to_ascii_lowercase();
                    if (QUERY_TOKEN_KEYS.contains(&lowered.as_str())
                        || lowered == "access_key"
                        || lowered == "x_api_key")
                        && !s.is_empty()
                    {
                        found.push(TokenObservation {
                            token_type: "api_key",
                            value: s.clone(),
                            context: ContextClass::Body,
                        });
                    }
                }
                walk_document(item, found);
            }
        }
        FieldValue::Seq(items) => {
            for item in items {
                walk_document(item, found);
            }
        }
        _ => {}
    }
}

fn strip_scheme<'a>(value: &'a str, scheme: &str) -> Option<&'a str> {
    if value.len() >= scheme.len() && value[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(value[scheme.len()..].trim())
    } else {
        None
    }
}

fn query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

fn kv_pairs(text: &str) -> Vec<(String, String)> {
    text.split_whitespace()
        .filter_map(|word| {
            let (key, value) = word.split_once('=')?;
            Some((key.to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}
