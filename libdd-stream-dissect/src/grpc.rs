// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! gRPC dissector: HTTP/2 framing only.
//!
//! Parses the connection preface and the frame layer (HEADERS, DATA,
//! RST_STREAM, PING, GOAWAY, WINDOW_UPDATE), decodes HPACK header blocks
//! with the static table, dynamic table, and plain literals, and aggregates
//! DATA lengths per stream. Protobuf payloads are never decoded.
//! Huffman-coded header strings are kept as opaque hex rather than decoded;
//! framing and metadata detection do not depend on them.

use crate::{Dissection, Dissector, RecordContext, SessionId};
use libdd_stream_common::{
    short_hash, EngineConfig, EngineError, FieldValue, Finding, FindingKind, Frame, MutexExt,
    Protocol, Severity,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;

const TYPE_DATA: u8 = 0x0;
const TYPE_HEADERS: u8 = 0x1;
const TYPE_PRIORITY: u8 = 0x2;
const TYPE_RST_STREAM: u8 = 0x3;
const TYPE_SETTINGS: u8 = 0x4;
const TYPE_PING: u8 = 0x6;
const TYPE_GOAWAY: u8 = 0x7;
const TYPE_WINDOW_UPDATE: u8 = 0x8;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// Per-connection accumulation: byte buffer, preface state, HPACK dynamic
/// table, and per-stream DATA/status counters.
#[derive(Default)]
struct ConnState {
    buf: Vec<u8>,
    preface_seen: bool,
    hpack: HpackTable,
    stream_bytes: HashMap<u32, u64>,
    statuses_total: u32,
    statuses_error: u32,
    status_anomaly_reported: bool,
}

pub struct GrpcDissector {
    max_frame_size: usize,
    state: Mutex<HashMap<RecordContext, ConnState>>,
}

impl GrpcDissector {
    pub fn new(config: &EngineConfig) -> Self {
        GrpcDissector {
            max_frame_size: config.max_frame_size,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn parse_frames(
        &self,
        ctx: &RecordContext,
        conn: &mut ConnState,
    ) -> Result<Vec<Frame>, EngineError> {
        let mut frames = Vec::new();
        loop {
            if !conn.preface_seen {
                if conn.buf.len() < PREFACE.len() {
                    break;
                }
                if conn.buf.starts_with(PREFACE) {
                    conn.buf.drain(..PREFACE.len());
                }
                // Either direction of the connection: the server side never
                // sends a preface.
                conn.preface_seen = true;
                continue;
            }
            if conn.buf.len() < FRAME_HEADER_LEN {
                break;
            }
            let len =
                ((conn.buf[0] as usize) << 16) | ((conn.buf[1] as usize) << 8) | conn.buf[2] as usize;
            if len > self.max_frame_size {
                conn.buf.clear();
                return Err(EngineError::Resource(format!(
                    "HTTP/2 frame length {len} exceeds max frame size"
                )));
            }
            if conn.buf.len() < FRAME_HEADER_LEN + len {
                break;
            }
            let frame_type = conn.buf[3];
            let flags = conn.buf[4];
            let stream_id = u32::from_be_bytes([
                conn.buf[5] & 0x7f,
                conn.buf[6],
                conn.buf[7],
                conn.buf[8],
            ]);
            let payload: Vec<u8> =
                conn.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
            conn.buf.drain(..FRAME_HEADER_LEN + len);

            if let Some(frame) =
                self.build_frame(ctx, conn, frame_type, flags, stream_id, &payload)?
            {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    fn build_frame(
        &self,
        ctx: &RecordContext,
        conn: &mut ConnState,
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) -> Result<Option<Frame>, EngineError> {
        let mut frame = Frame::new(Protocol::Grpc, ctx.pid, ctx.stream, payload.to_vec());
        frame.set("stream_id", stream_id as i64);
        match frame_type {
            TYPE_HEADERS => {
                frame.set("h2_type", "HEADERS");
                frame.set("end_stream", flags & FLAG_END_STREAM != 0);
                let mut block = payload;
                if flags & FLAG_PADDED != 0 && !block.is_empty() {
                    let pad = block[0] as usize;
                    block = &block[1..];
                    block = &block[..block.len().saturating_sub(pad)];
                }
                if flags & FLAG_PRIORITY != 0 && block.len() >= 5 {
                    block = &block[5..];
                }
                let headers = conn.hpack.decode(block).map_err(|reason| {
                    EngineError::Format {
                        protocol: "gRPC",
                        reason,
                    }
                })?;
                let mut header_map = BTreeMap::new();
                for (name, value) in &headers {
                    match name.as_str() {
                        ":method" => frame.set("method", value.clone()),
                        ":path" => frame.set("path", value.clone()),
                        ":authority" => frame.set("authority", value.clone()),
                        ":status" => frame.set("status", value.clone()),
                        "grpc-status" => {
                            frame.set("grpc_status", value.clone());
                            conn.statuses_total += 1;
                            if value.trim() != "0" {
                                conn.statuses_error += 1;
                            }
                        }
                        "grpc-message" => frame.set("grpc_message", value.clone()),
                        _ => {
                            header_map
                                .insert(name.clone(), FieldValue::Str(value.clone()));
                        }
                    }
                }
                if !header_map.is_empty() {
                    frame.set("metadata", FieldValue::Map(header_map));
                }
                if conn.statuses_total >= 10
                    && conn.statuses_error * 2 > conn.statuses_total
                    && !conn.status_anomaly_reported
                {
                    conn.status_anomaly_reported = true;
                    frame.set("status_anomaly", true);
                }
            }
            TYPE_DATA => {
                frame.set("h2_type", "DATA");
                frame.set("end_stream", flags & FLAG_END_STREAM != 0);
                let mut data_len = payload.len();
                if flags & FLAG_PADDED != 0 && !payload.is_empty() {
                    data_len = data_len.saturating_sub(1 + payload[0] as usize);
                }
                let total = conn.stream_bytes.entry(stream_id).or_insert(0);
                *total += data_len as u64;
                frame.set("data_len", data_len as i64);
                frame.set("stream_bytes", *total as i64);
            }
            TYPE_RST_STREAM => {
                frame.set("h2_type", "RST_STREAM");
                if payload.len() >= 4 {
                    let code =
                        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    frame.set("error_code", code as i64);
                }
            }
            TYPE_PING => {
                frame.set("h2_type", "PING");
                frame.set("ack", flags & FLAG_ACK != 0);
            }
            TYPE_GOAWAY => {
                frame.set("h2_type", "GOAWAY");
                if payload.len() >= 8 {
                    let last = u32::from_be_bytes([
                        payload[0] & 0x7f,
                        payload[1],
                        payload[2],
                        payload[3],
                    ]);
                    let code =
                        u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                    frame.set("last_stream_id", last as i64);
                    frame.set("error_code", code as i64);
                }
            }
            TYPE_WINDOW_UPDATE => {
                frame.set("h2_type", "WINDOW_UPDATE");
                if payload.len() >= 4 {
                    let increment = u32::from_be_bytes([
                        payload[0] & 0x7f,
                        payload[1],
                        payload[2],
                        payload[3],
                    ]);
                    frame.set("increment", increment as i64);
                }
            }
            // SETTINGS and PRIORITY are consumed for framing continuity but
            // carry nothing this engine reports on.
            TYPE_SETTINGS | TYPE_PRIORITY => return Ok(None),
            _ => return Ok(None),
        }
        Ok(Some(frame))
    }
}

impl Dissector for GrpcDissector {
    fn protocol(&self) -> Protocol {
        Protocol::Grpc
    }

    fn priority(&self) -> u8 {
        90
    }

    fn identify(&self, window: &[u8]) -> f64 {
        if window.starts_with(b"PRI * HTTP/2.0") {
            return 0.95;
        }
        // A continuation window of an already-identified connection.
        if window
            .windows(16)
            .any(|w| w.eq_ignore_ascii_case(b"application/grpc"))
        {
            return 0.85;
        }
        0.0
    }

    fn dissect(&self, ctx: &RecordContext, raw: &[u8]) -> Result<Dissection, EngineError> {
        let mut state = self.state.lock_or_panic();
        let conn = state.entry(*ctx).or_default();
        conn.buf.extend_from_slice(raw);
        if conn.buf.len() > self.max_frame_size {
            state.remove(ctx);
            return Err(EngineError::Resource(
                "HTTP/2 accumulation exceeds max frame size".into(),
            ));
        }
        let frames = self.parse_frames(ctx, conn)?;
        if frames.is_empty() {
            Ok(Dissection::NeedMore)
        } else {
            Ok(Dissection::Frames(frames))
        }
    }

    fn find_vulnerabilities(&self, frame: &Frame) -> Vec<Finding> {
        let mut findings = Vec::new();
        if let Some(FieldValue::Map(metadata)) = frame.field("metadata") {
            for (name, value) in metadata {
                let Some(value) = value.as_str() else { continue };
                if name == "authorization" {
                    let token = value
                        .strip_prefix("Bearer ")
                        .or_else(|| value.strip_prefix("bearer "))
                        .unwrap_or(value);
                    findings.push(Finding::frame_scoped(
                        FindingKind::Credential,
                        "bearer_token",
                        Severity::High,
                        0.9,
                        token,
                        "grpc authorization metadata in cleartext",
                    ));
                } else if name.contains("token") || name.contains("key") || name.contains("secret")
                {
                    findings.push(Finding::frame_scoped(
                        FindingKind::Credential,
                        "metadata_token",
                        Severity::Medium,
                        0.7,
                        value,
                        &format!("grpc metadata {name}"),
                    ));
                }
            }
        }
        if frame.field("status_anomaly").is_some() {
            findings.push(Finding::frame_scoped(
                FindingKind::Configuration,
                "grpc_status_anomaly",
                Severity::Medium,
                0.6,
                "",
                "majority of observed grpc-status values are errors",
            ));
        }
        findings
    }

    fn session_id(&self, frame: &Frame) -> Result<SessionId, EngineError> {
        let stream_id = frame
            .field("stream_id")
            .and_then(FieldValue::as_int)
            .ok_or_else(|| EngineError::Format {
                protocol: "gRPC",
                reason: "frame carries no stream id".into(),
            })?;
        if stream_id == 0 {
            // Connection-level frames (PING, GOAWAY, WINDOW_UPDATE on the
            // connection) belong to the connection session.
            let ctx = RecordContext::new(frame.pid, frame.stream);
            return Ok(SessionId::new(format!(
                "grpc_conn_{}",
                short_hash(&ctx.endpoint())
            )));
        }
        Ok(SessionId::new(format!("grpc_stream_{stream_id}")))
    }

    fn mid_record(&self, ctx: &RecordContext) -> bool {
        self.state
            .lock_or_panic()
            .get(ctx)
            .map(|conn| conn.preface_seen || !conn.buf.is_empty())
            .unwrap_or(false)
    }

    // HTTP/2 is binary from the first byte; once this dissector owns the
    // stream it needs unsplit data.
    fn wants_raw(&self, ctx: &RecordContext) -> bool {
        self.mid_record(ctx)
    }

    fn forget(&self, ctx: &RecordContext) {
        self.state.lock_or_panic().remove(ctx);
    }
}

/// HPACK static table, RFC 7541 appendix A.
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Minimal HPACK decoder: static table, dynamic table, integer and string
/// primitives. Huffman-coded strings are preserved as hex rather than
/// decoded.
#[derive(Default)]
struct HpackTable {
    dynamic: Vec<(String, String)>,
    max_size: Option<usize>,
}

impl HpackTable {
    fn lookup(&self, index: usize) -> Result<(String, String), String> {
        if index == 0 {
            return Err("hpack index 0".into());
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_string(), value.to_string()));
        }
        self.dynamic
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or_else(|| format!("hpack index {index} out of range"))
    }

    fn insert(&mut self, name: String, value: String) {
        self.dynamic.insert(0, (name, value));
        let max = self.max_size.unwrap_or(4096);
        let mut size: usize = self
            .dynamic
            .iter()
            .map(|(n, v)| n.len() + v.len() + 32)
            .sum();
        while size > max {
            if let Some((n, v)) = self.dynamic.pop() {
                size -= n.len() + v.len() + 32;
            } else {
                break;
            }
        }
    }

    fn decode(&mut self, mut block: &[u8]) -> Result<Vec<(String, String)>, String> {
        let mut headers = Vec::new();
        while !block.is_empty() {
            let byte = block[0];
            if byte & 0x80 != 0 {
                // Indexed header field.
                let (index, rest) = decode_int(block, 7)?;
                block = rest;
                headers.push(self.lookup(index)?);
            } else if byte & 0xc0 == 0x40 {
                // Literal with incremental indexing.
                let (name, value, rest) = self.decode_literal(block, 6)?;
                block = rest;
                self.insert(name.clone(), value.clone());
                headers.push((name, value));
            } else if byte & 0xe0 == 0x20 {
                // Dynamic table size update.
                let (size, rest) = decode_int(block, 5)?;
                self.max_size = Some(size);
                block = rest;
            } else {
                // Literal without indexing / never indexed (prefix 4).
                let (name, value, rest) = self.decode_literal(block, 4)?;
                block = rest;
                headers.push((name, value));
            }
        }
        Ok(headers)
    }

    fn decode_literal<'a>(
        &self,
        block: &'a [u8],
        prefix: u8,
    ) -> Result<(String, String, &'a [u8]), String> {
        let (name_index, rest) = decode_int(block, prefix)?;
        let (name, rest) = if name_index == 0 {
            decode_string(rest)?
        } else {
            (self.lookup(name_index)?.0, rest)
        };
        let (value, rest) = decode_string(rest)?;
        Ok((name, value, rest))
    }
}

fn decode_int(block: &[u8], prefix: u8) -> Result<(usize, &[u8]), String> {
    if block.is_empty() {
        return Err("hpack integer on empty block".into());
    }
    let mask = (1u16 << prefix) - 1;
    let mut value = (block[0] as u16 & mask) as usize;
    if value < mask as usize {
        return Ok((value, &block[1..]));
    }
    let mut shift = 0u32;
    for (i, byte) in block[1..].iter().enumerate() {
        value += ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if shift > 28 {
            return Err("hpack integer overflow".into());
        }
        if byte & 0x80 == 0 {
            return Ok((value, &block[i + 2..]));
        }
    }
    Err("hpack integer truncated".into())
}

fn decode_string(block: &[u8]) -> Result<(String, &[u8]), String> {
    if block.is_empty() {
        return Err("hpack string on empty block".into());
    }
    let huffman = block[0] & 0x80 != 0;
    let (len, rest) = decode_int(block, 7)?;
    if rest.len() < len {
        return Err("hpack string truncated".into());
    }
    let (bytes, rest) = rest.split_at(len);
    let value = if huffman {
        // Framing-only decoder: Huffman payloads stay opaque.
        format!("0x{}", hex::encode(bytes))
    } else {
        String::from_utf8_lossy(bytes).to_string()
    };
    Ok((value, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use libdd_stream_common::StreamKind;

    fn dissector() -> GrpcDissector {
        GrpcDissector::new(&EngineConfig::default())
    }

    fn ctx() -> RecordContext {
        RecordContext::new(42, StreamKind::Stdout)
    }

    fn h2_frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        let len = payload.len() as u32;
        out.extend_from_slice(&len.to_be_bytes()[1..]);
        out.push(frame_type);
        out.push(flags);
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn hpack_literal(name: &str, value: &str) -> Vec<u8> {
        // Literal without indexing, literal name, no Huffman.
        let mut out = vec![0x00];
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(value.len() as u8);
        out.extend_from_slice(value.as_bytes());
        out
    }

    #[test]
    fn test_identify_preface() {
        let d = dissector();
        assert!(d.identify(PREFACE) >= 0.9);
        assert_eq!(d.identify(b"GET / HTTP/1.1"), 0.0);
    }

    #[test]
    fn test_headers_frame_decoded_with_metadata_leak() {
        let d = dissector();
        let mut block = Vec::new();
        block.extend_from_slice(&hpack_literal(":method", "POST"));
        block.extend_from_slice(&hpack_literal(":path", "/svc/Call"));
        block.extend_from_slice(&hpack_literal(
            "authorization",
            "Bearer sk_live_abcd1234efgh5678",
        ));
        let mut bytes = PREFACE.to_vec();
        bytes.extend_from_slice(&h2_frame(TYPE_HEADERS, FLAG_END_STREAM, 1, &block));

        let Dissection::Frames(frames) = d.dissect(&ctx(), &bytes).unwrap() else {
            panic!("expected frames");
        };
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.field_str("method"), Some("POST"));
        assert_eq!(frame.field_str("path"), Some("/svc/Call"));
        assert_eq!(frame.field("stream_id").unwrap().as_int(), Some(1));

        let id = d.session_id(frame).unwrap();
        assert_eq!(id.canonical, "grpc_stream_1");

        let findings = d.find_vulnerabilities(frame);
        let bearer = findings
            .iter()
            .find(|f| f.subtype == "bearer_token")
            .expect("bearer finding");
        assert_eq!(bearer.kind, FindingKind::Credential);
        assert_eq!(bearer.evidence(), "sk_***678");
    }

    #[test]
    fn test_data_frames_aggregate_per_stream() {
        let d = dissector();
        let c = ctx();
        let mut bytes = PREFACE.to_vec();
        bytes.extend_from_slice(&h2_frame(TYPE_DATA, 0, 3, &[0u8; 16]));
        bytes.extend_from_slice(&h2_frame(TYPE_DATA, FLAG_END_STREAM, 3, &[0u8; 8]));
        let Dissection::Frames(frames) = d.dissect(&c, &bytes).unwrap() else {
            panic!("expected frames");
        };
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].field("stream_bytes").unwrap().as_int(), Some(24));
        assert_eq!(
            d.session_id(&frames[1]).unwrap().canonical,
            "grpc_stream_3"
        );
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let d = dissector();
        let c = ctx();
        let full = h2_frame(TYPE_PING, 0, 0, &[0u8; 8]);
        let mut bytes = PREFACE.to_vec();
        bytes.extend_from_slice(&full[..4]);
        assert!(matches!(d.dissect(&c, &bytes).unwrap(), Dissection::NeedMore));
        let Dissection::Frames(frames) = d.dissect(&c, &full[4..]).unwrap() else {
            panic!("expected frames");
        };
        assert_eq!(frames[0].field_str("h2_type"), Some("PING"));
    }

    #[test]
    fn test_goaway_and_rst_parsed() {
        let d = dissector();
        let mut bytes = PREFACE.to_vec();
        let mut goaway = 7u32.to_be_bytes().to_vec();
        goaway.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&h2_frame(TYPE_GOAWAY, 0, 0, &goaway));
        bytes.extend_from_slice(&h2_frame(TYPE_RST_STREAM, 0, 5, &8u32.to_be_bytes()));
        let Dissection::Frames(frames) = d.dissect(&ctx(), &bytes).unwrap() else {
            panic!("expected frames");
        };
        assert_eq!(frames[0].field_str("h2_type"), Some("GOAWAY"));
        assert_eq!(frames[0].field("last_stream_id").unwrap().as_int(), Some(7));
        assert_eq!(frames[1].field_str("h2_type"), Some("RST_STREAM"));
        assert_eq!(frames[1].field("error_code").unwrap().as_int(), Some(8));
    }

    #[test]
    fn test_hpack_indexed_and_incremental() {
        let mut table = HpackTable::default();
        // 0x82 = indexed, static 2 (:method GET); 0x41 = literal with
        // incremental indexing, name = static 1 (:authority).
        let mut block = vec![0x82, 0x41];
        block.push(7);
        block.extend_from_slice(b"svc.int");
        let headers = table.decode(&block).unwrap();
        assert_eq!(headers[0], (":method".to_string(), "GET".to_string()));
        assert_eq!(headers[1], (":authority".to_string(), "svc.int".to_string()));
        // The incremental literal is now dynamic index 62.
        let headers = table.decode(&[0x80 | 62]).unwrap();
        assert_eq!(headers[0].1, "svc.int");
    }

    #[test]
    fn test_hpack_malformed_is_format_error() {
        let d = dissector();
        let mut bytes = PREFACE.to_vec();
        // HEADERS whose block claims a longer string than present.
        bytes.extend_from_slice(&h2_frame(TYPE_HEADERS, 0, 1, &[0x00, 0x7f]));
        let err = d.dissect(&ctx(), &bytes).unwrap_err();
        assert!(matches!(err, EngineError::Format { protocol: "gRPC", .. }));
    }

    #[test]
    fn test_oversized_h2_frame_is_resource_error() {
        let config = EngineConfig {
            max_frame_size: 32,
            ..Default::default()
        };
        let d = GrpcDissector::new(&config);
        let mut bytes = PREFACE.to_vec();
        bytes.extend_from_slice(&h2_frame(TYPE_DATA, 0, 1, &[0u8; 64]));
        // Either the declared length or the accumulation cap trips first.
        assert!(d.dissect(&ctx(), &bytes).is_err());
    }
}
