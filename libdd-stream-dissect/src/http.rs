// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP/1.x dissector.
//!
//! Records usually arrive one line at a time, so a message head is
//! accumulated per stream until the blank line, then parsed with `httparse`.
//! Bodies are bounded by `Content-Length` or chunked framing, both
//! accumulated across records of the same stream.

use crate::pattern::GuardedPattern;
use crate::{Dissection, Dissector, RecordContext, SessionId};
use libdd_stream_common::{
    short_hash, EngineConfig, EngineError, FieldValue, Finding, FindingKind, Frame, MutexExt,
    Protocol, Severity,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Session-bearing cookie names, matched case-insensitively.
const SESSION_COOKIES: [&str; 6] = [
    "session",
    "sessionid",
    "jsessionid",
    "phpsessid",
    "connect.sid",
    "sid",
];

const METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

#[derive(Debug, Default)]
struct Accum {
    buf: Vec<u8>,
    /// Byte length of the head once the blank line has been seen.
    head_len: Option<usize>,
    /// Body bytes still expected (`Content-Length` mode).
    body_remaining: Option<usize>,
    chunked: bool,
}

pub struct HttpDissector {
    max_frame_size: usize,
    state: Mutex<HashMap<RecordContext, Accum>>,
    query_credential: GuardedPattern,
    body_credential: GuardedPattern,
    api_key_value: GuardedPattern,
    server_version: GuardedPattern,
}

impl HttpDissector {
    // Patterns are literals; construction happens once, before capture.
    #[allow(clippy::unwrap_used)]
    pub fn new(config: &EngineConfig) -> Self {
        let budget = config.regex_timeout;
        HttpDissector {
            max_frame_size: config.max_frame_size,
            state: Mutex::new(HashMap::new()),
            query_credential: GuardedPattern::new(
                "http_query_credential",
                r"(?i)(password|passwd|pwd|secret|token|api_?key|auth)=([^&\s]+)",
                budget,
            )
            .unwrap(),
            body_credential: GuardedPattern::new(
                "http_body_credential",
                r#"(?i)["']?(password|passwd|pwd|secret|api_?key)["']?\s*[=:]\s*["']?([^&\s"',}]+)"#,
                budget,
            )
            .unwrap(),
            api_key_value: GuardedPattern::new(
                "http_api_key_value",
                r"^[A-Za-z0-9\-._~+/=]{8,512}$",
                budget,
            )
            .unwrap(),
            server_version: GuardedPattern::new(
                "http_server_version",
                r"^[A-Za-z\-_/ ]+/\d+[\d.]*",
                budget,
            )
            .unwrap(),
        }
    }


    fn looks_like_request_line(window: &[u8]) -> bool {
        let text = match std::str::from_utf8(&window[..window.len().min(256)]) {
            Ok(t) => t,
            Err(_) => return false,
        };
        let mut parts = text.split(' ');
        let method = parts.next().unwrap_or("");
        if !METHODS.contains(&method) {
            return false;
        }
        let target = parts.next().unwrap_or("");
        if target.is_empty() {
            return false;
        }
        parts
            .next()
            .map(|v| v.starts_with("HTTP/1."))
            .unwrap_or(false)
    }

    fn looks_like_status_line(window: &[u8]) -> bool {
        let text = match std::str::from_utf8(&window[..window.len().min(64)]) {
            Ok(t) => t,
            Err(_) => return false,
        };
        if !text.starts_with("HTTP/1.") {
            return false;
        }
        text.as_bytes().len() > 9
            && text.as_bytes().get(7).map(|b| *b == b'0' || *b == b'1') == Some(true)
            && text
                .get(9..12)
                .map(|s| s.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
    }

    fn head_complete(buf: &[u8]) -> Option<usize> {
        buf.windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p + 4)
            .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
    }

    /// Parse a complete head (and whatever body followed it) into a frame.
    fn parse_message(&self, ctx: &RecordContext, buf: &[u8], head_len: usize) -> Result<Frame, EngineError> {
        let mut frame = Frame::new(Protocol::Http, ctx.pid, ctx.stream, buf.to_vec());
        let head = &buf[..head_len];
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let parsed_headers: Vec<(String, String)>;

        if Self::looks_like_status_line(head) {
            let mut resp = httparse::Response::new(&mut headers);
            match resp.parse(head) {
                Ok(httparse::Status::Complete(_)) => {}
                _ => {
                    return Err(EngineError::Format {
                        protocol: "HTTP",
                        reason: "unparseable response head".into(),
                    })
                }
            }
            frame.set("type", "response");
            if let Some(code) = resp.code {
                frame.set("status", code as i64);
            }
            if let Some(reason) = resp.reason {
                frame.set("reason", reason);
            }
            frame.set(
                "version",
                format!("1.{}", resp.version.unwrap_or(1)),
            );
            parsed_headers = resp
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(h.value).to_string(),
                    )
                })
                .collect();
        } else {
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(head) {
                Ok(httparse::Status::Complete(_)) => {}
                _ => {
                    return Err(EngineError::Format {
                        protocol: "HTTP",
                        reason: "unparseable request head".into(),
                    })
                }
            }
            frame.set("type", "request");
            if let Some(method) = req.method {
                frame.set("method", method);
            }
            if let Some(path) = req.path {
                frame.set("path", path);
            }
            frame.set(
                "version",
                format!("1.{}", req.version.unwrap_or(1)),
            );
            parsed_headers = req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(h.value).to_string(),
                    )
                })
                .collect();
        }

        let mut header_map = BTreeMap::new();
        let mut set_cookies = Vec::new();
        let mut cookies = BTreeMap::new();
        for (name, value) in &parsed_headers {
            if name == "set-cookie" {
                set_cookies.push(FieldValue::Str(value.clone()));
                if let Some((ck_name, ck_value)) = split_cookie_pair(value) {
                    cookies.insert(ck_name, FieldValue::Str(ck_value));
                }
            } else if name == "cookie" {
                for pair in value.split(';') {
                    if let Some((ck_name, ck_value)) = split_cookie_pair(pair) {
                        cookies.insert(ck_name, FieldValue::Str(ck_value));
                    }
                }
            }
            header_map
                .entry(name.clone())
                .and_modify(|existing: &mut FieldValue| {
                    if let FieldValue::Str(s) = existing {
                        s.push_str(", ");
                        s.push_str(value);
                    }
                })
                .or_insert_with(|| FieldValue::Str(value.clone()));
        }
        if !set_cookies.is_empty() {
            frame.set("set_cookie", FieldValue::Seq(set_cookies));
        }
        if !cookies.is_empty() {
            frame.set("cookies", FieldValue::Map(cookies));
        }

        let connection_close = header_map
            .get("connection")
            .and_then(FieldValue::as_str)
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
        if connection_close {
            frame.set("connection_close", true);
        }
        if let Some(upgrade) = header_map.get("upgrade").and_then(FieldValue::as_str) {
            if upgrade.eq_ignore_ascii_case("websocket") {
                frame.set("upgrade", "websocket");
                if let Some(key) = header_map.get("sec-websocket-key").and_then(FieldValue::as_str)
                {
                    frame.set("websocket_key", key.to_string());
                }
            }
        }
        frame.set("headers", FieldValue::Map(header_map));

        let body = &buf[head_len..];
        if !body.is_empty() {
            let decoded = if self.is_chunked(&parsed_headers) {
                decode_chunked(body)
            } else {
                // Trailing delimiter restoration can overshoot the declared
                // length; the declared length wins.
                let take = Self::content_length(&parsed_headers)
                    .unwrap_or(body.len())
                    .min(body.len());
                body[..take].to_vec()
            };
            frame.set("body_size", decoded.len() as i64);
            frame.set(
                "body",
                String::from_utf8_lossy(&decoded[..decoded.len().min(4096)]).to_string(),
            );
        }

        Ok(frame)
    }

    fn is_chunked(&self, headers: &[(String, String)]) -> bool {
        headers.iter().any(|(name, value)| {
            name == "transfer-encoding" && value.to_ascii_lowercase().contains("chunked")
        })
    }

    fn content_length(headers: &[(String, String)]) -> Option<usize> {
        headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .and_then(|(_, value)| value.trim().parse().ok())
    }

    /// Re-parse just enough of a complete head to plan body accumulation.
    fn body_plan(buf: &[u8], head_len: usize) -> (Option<usize>, bool) {
        let head = &buf[..head_len];
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let parsed: Vec<(String, String)> = if Self::looks_like_status_line(head) {
            let mut resp = httparse::Response::new(&mut headers);
            if !matches!(resp.parse(head), Ok(httparse::Status::Complete(_))) {
                return (None, false);
            }
            resp.headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(h.value).to_string(),
                    )
                })
                .collect()
        } else {
            let mut req = httparse::Request::new(&mut headers);
            if !matches!(req.parse(head), Ok(httparse::Status::Complete(_))) {
                return (None, false);
            }
            req.headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(h.value).to_string(),
                    )
                })
                .collect()
        };
        let chunked = parsed.iter().any(|(name, value)| {
            name == "transfer-encoding" && value.to_ascii_lowercase().contains("chunked")
        });
        (Self::content_length(&parsed), chunked)
    }

    fn scan_query(&self, frame: &Frame, findings: &mut Vec<Finding>) {
        let Some(path) = frame.field_str("path") else {
            return;
        };
        let Some((_, query)) = path.split_once('?') else {
            return;
        };
        for caps in self.query_credential.captures_all(query) {
            let key = caps.get(1).map(|m| m.as_str().to_ascii_lowercase());
            let value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let subtype = match key.as_deref() {
                Some("password") | Some("passwd") | Some("pwd") => "password_in_url",
                Some("token") | Some("auth") => "token_in_url",
                _ => "credential_in_url",
            };
            findings.push(Finding::frame_scoped(
                FindingKind::Credential,
                subtype,
                Severity::High,
                0.9,
                value,
                "url query string",
            ));
        }
    }

    fn scan_body(&self, frame: &Frame, findings: &mut Vec<Finding>) {
        let Some(body) = frame.field_str("body") else {
            return;
        };
        for caps in self.body_credential.captures_all(body) {
            let value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            findings.push(Finding::frame_scoped(
                FindingKind::Credential,
                "credential_in_body",
                Severity::High,
                0.8,
                value,
                "message body",
            ));
        }
    }

    fn scan_headers(&self, frame: &Frame, findings: &mut Vec<Finding>) {
        let Some(FieldValue::Map(headers)) = frame.field("headers") else {
            return;
        };
        if let Some(auth) = headers.get("authorization").and_then(FieldValue::as_str) {
            if let Some(b64) = strip_prefix_ignore_case(auth, "basic ") {
                findings.push(Finding::frame_scoped(
                    FindingKind::Credential,
                    "basic_auth_header",
                    Severity::High,
                    0.95,
                    b64.trim(),
                    "authorization header",
                ));
            } else if let Some(token) = strip_prefix_ignore_case(auth, "bearer ") {
                findings.push(Finding::frame_scoped(
                    FindingKind::Credential,
                    "bearer_token",
                    Severity::High,
                    0.9,
                    token.trim(),
                    "authorization header",
                ));
            }
        }
        for (name, value) in headers {
            if !(name.contains("api-key") || name.contains("api_key") || name == "x-auth-token") {
                continue;
            }
            if let Some(value) = value.as_str() {
                if self.api_key_value.is_match(value) {
                    findings.push(Finding::frame_scoped(
                        FindingKind::Credential,
                        "api_key_in_header",
                        Severity::High,
                        0.85,
                        value,
                        &format!("{name} header"),
                    ));
                }
            }
        }
        if let Some(server) = headers.get("server").and_then(FieldValue::as_str) {
            if self.server_version.is_match(server) {
                findings.push(Finding::frame_scoped(
                    FindingKind::Configuration,
                    "verbose_server_banner",
                    Severity::Low,
                    0.7,
                    server,
                    "server header",
                ));
            }
        }
    }

    fn scan_cookies(&self, frame: &Frame, findings: &mut Vec<Finding>) {
        let Some(FieldValue::Seq(set_cookies)) = frame.field("set_cookie") else {
            return;
        };
        for raw in set_cookies {
            let Some(raw) = raw.as_str() else { continue };
            let lower = raw.to_ascii_lowercase();
            let mut missing = Vec::new();
            if !lower.contains("secure") {
                missing.push("Secure");
            }
            if !lower.contains("httponly") {
                missing.push("HttpOnly");
            }
            if !lower.contains("samesite") {
                missing.push("SameSite");
            }
            if missing.is_empty() {
                continue;
            }
            let value = split_cookie_pair(raw).map(|(_, v)| v).unwrap_or_default();
            findings.push(Finding::frame_scoped(
                FindingKind::Configuration,
                "insecure_cookie",
                Severity::Medium,
                0.9,
                &value,
                &format!("set-cookie missing {}", missing.join("/")),
            ));
        }
    }
}

fn split_cookie_pair(pair: &str) -> Option<(String, String)> {
    // Only the leading name=value of a Set-Cookie line; attributes follow ';'.
    let first = pair.split(';').next()?;
    let (name, value) = first.split_once('=')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Decode a chunked transfer-coded body; on framing errors the bytes seen so
/// far are returned as-is rather than lost.
fn decode_chunked(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let Some(line_end) = rest.windows(2).position(|w| w == b"\r\n") else {
            return if out.is_empty() { body.to_vec() } else { out };
        };
        let size_line = String::from_utf8_lossy(&rest[..line_end]);
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_str, 16) else {
            return if out.is_empty() { body.to_vec() } else { out };
        };
        rest = &rest[line_end + 2..];
        if size == 0 {
            return out;
        }
        if rest.len() < size {
            out.extend_from_slice(rest);
            return out;
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[size..];
        if rest.starts_with(b"\r\n") {
            rest = &rest[2..];
        }
    }
}

fn chunked_body_complete(body: &[u8]) -> bool {
    // Terminal zero-size chunk.
    body.windows(5).any(|w| w == b"0\r\n\r\n") || body.ends_with(b"0\n\n")
}

impl Dissector for HttpDissector {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn priority(&self) -> u8 {
        80
    }

    fn identify(&self, window: &[u8]) -> f64 {
        if Self::looks_like_request_line(window) || Self::looks_like_status_line(window) {
            0.95
        } else {
            0.0
        }
    }

    fn dissect(&self, ctx: &RecordContext, raw: &[u8]) -> Result<Dissection, EngineError> {
        let mut state = self.state.lock_or_panic();
        let accum = state.entry(*ctx).or_default();
        if accum.buf.is_empty()
            && !(Self::looks_like_request_line(raw) || Self::looks_like_status_line(raw))
        {
            state.remove(ctx);
            return Err(EngineError::Format {
                protocol: "HTTP",
                reason: "record is not an HTTP message start".into(),
            });
        }

        let fresh = accum.buf.is_empty();
        accum.buf.extend_from_slice(raw);
        // Restore the delimiter the ring consumed. A first record that
        // already carries a complete head was fed whole and keeps its bytes
        // as-is.
        if !(fresh && Self::head_complete(&accum.buf).is_some()) {
            accum.buf.push(b'\n');
        }

        if accum.buf.len() > self.max_frame_size {
            state.remove(ctx);
            return Err(EngineError::Resource(format!(
                "HTTP message exceeds max frame size ({} bytes)",
                self.max_frame_size
            )));
        }

        if accum.head_len.is_none() {
            if let Some(head_len) = Self::head_complete(&accum.buf) {
                accum.head_len = Some(head_len);
                let (content_length, chunked) = Self::body_plan(&accum.buf, head_len);
                accum.chunked = chunked;
                accum.body_remaining = content_length;
            }
        }

        let Some(head_len) = accum.head_len else {
            return Ok(Dissection::NeedMore);
        };

        let body_len = accum.buf.len() - head_len;
        let complete = if accum.chunked {
            chunked_body_complete(&accum.buf[head_len..])
        } else {
            match accum.body_remaining {
                Some(expected) => body_len >= expected,
                None => true,
            }
        };
        if !complete {
            return Ok(Dissection::NeedMore);
        }

        let buf = std::mem::take(&mut accum.buf);
        state.remove(ctx);
        drop(state);
        let frame = self.parse_message(ctx, &buf, head_len)?;
        Ok(Dissection::Frames(vec![frame]))
    }

    fn find_vulnerabilities(&self, frame: &Frame) -> Vec<Finding> {
        let mut findings = Vec::new();
        self.scan_query(frame, &mut findings);
        self.scan_body(frame, &mut findings);
        self.scan_headers(frame, &mut findings);
        self.scan_cookies(frame, &mut findings);
        if frame.field_str("method") == Some("TRACE") {
            findings.push(Finding::frame_scoped(
                FindingKind::Configuration,
                "trace_method_enabled",
                Severity::Medium,
                0.8,
                "TRACE",
                "request method",
            ));
        }
        findings
    }

    fn session_id(&self, frame: &Frame) -> Result<SessionId, EngineError> {
        // Precedence: session cookie, bearer token, X-Session-* header, URL
        // sid, then a stable per-stream hash.
        if let Some(FieldValue::Map(cookies)) = frame.field("cookies") {
            for (name, value) in cookies {
                let lowered = name.to_ascii_lowercase();
                if SESSION_COOKIES.contains(&lowered.as_str()) {
                    if let Some(value) = value.as_str() {
                        let mut id = SessionId::with_raw(
                            format!("http_cookie_{}", short_hash(value)),
                            value.to_string(),
                        );
                        id.aliases.push(format!("{lowered}={value}"));
                        return Ok(id);
                    }
                }
            }
        }
        if let Some(FieldValue::Map(headers)) = frame.field("headers") {
            if let Some(auth) = headers.get("authorization").and_then(FieldValue::as_str) {
                if let Some(token) = strip_prefix_ignore_case(auth, "bearer ") {
                    let token = token.trim();
                    return Ok(SessionId::with_raw(
                        format!("http_bearer_{}", short_hash(token)),
                        token.to_string(),
                    ));
                }
            }
            for (name, value) in headers {
                if name.starts_with("x-session") {
                    if let Some(value) = value.as_str() {
                        return Ok(SessionId::with_raw(
                            format!("http_header_{}", short_hash(value)),
                            value.to_string(),
                        ));
                    }
                }
            }
        }
        if let Some(path) = frame.field_str("path") {
            if let Some((_, query)) = path.split_once('?') {
                for pair in query.split('&') {
                    let Some((key, value)) = pair.split_once('=') else {
                        continue;
                    };
                    let key = key.to_ascii_lowercase();
                    if (key == "sid" || key == "session_id") && !value.is_empty() {
                        return Ok(SessionId::with_raw(
                            format!("http_url_{}", short_hash(value)),
                            value.to_string(),
                        ));
                    }
                }
            }
        }
        let ctx = RecordContext::new(frame.pid, frame.stream);
        Ok(SessionId::new(format!(
            "http_conn_{}",
            short_hash(&ctx.endpoint())
        )))
    }

    fn mid_record(&self, ctx: &RecordContext) -> bool {
        self.state.lock_or_panic().contains_key(ctx)
    }

    fn forget(&self, ctx: &RecordContext) {
        self.state.lock_or_panic().remove(ctx);
    }
}
