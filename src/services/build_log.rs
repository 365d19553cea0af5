//! Normalizes the two build response formats into [`BuildLogEvent`]s.
//!
//! The format is picked once per build from [`BuildLogFormat`]; each record is
//! then handed to one of two pure decoders. Records that match neither shape
//! are skipped.

use crate::domain::BuildLogFormat;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildLogEvent {
    /// Human-readable step or status line.
    Step(String),
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub struct BuildLogDecoder {
    format: BuildLogFormat,
}

impl BuildLogDecoder {
    pub fn new(format: BuildLogFormat) -> Self {
        Self { format }
    }

    pub fn decode(&self, record: &[u8]) -> Option<BuildLogEvent> {
        match self.format {
            BuildLogFormat::Classic => decode_classic(record),
            BuildLogFormat::Trace => decode_trace(record),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ClassicRecord {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "errorDetail")]
    error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

const STATUS_VERBS: [&str; 4] = ["pulling", "building", "running", "executing"];

/// Decodes one line of the legacy builder's JSON stream.
pub fn decode_classic(record: &[u8]) -> Option<BuildLogEvent> {
    let record: ClassicRecord = serde_json::from_slice(trim_bytes(record)).ok()?;

    let detail = record
        .error_detail
        .and_then(|d| d.message)
        .filter(|m| !m.trim().is_empty());
    let error = record.error.filter(|m| !m.trim().is_empty());
    if let Some(message) = error.or(detail) {
        return Some(BuildLogEvent::Error(message.trim().to_string()));
    }

    [record.stream, record.status]
        .into_iter()
        .flatten()
        .find_map(|line| step_line(&line))
        .map(BuildLogEvent::Step)
}

fn step_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with("Step ") {
        return Some(line.to_string());
    }

    let body = line.trim_start_matches("--->").trim_start();
    let lower = body.to_ascii_lowercase();
    STATUS_VERBS
        .iter()
        .any(|verb| lower.starts_with(verb))
        .then(|| line.to_string())
}

#[derive(Debug, Deserialize, Default)]
struct TraceRecord {
    #[serde(default)]
    vertexes: Vec<Vertex>,
}

#[derive(Debug, Deserialize, Default)]
struct Vertex {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    started: Option<DateTime<Utc>>,
    #[serde(default)]
    completed: Option<DateTime<Utc>>,
    #[serde(default)]
    error: Option<String>,
}

impl Vertex {
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.completed.max(self.started)
    }
}

/// Decodes one BuildKit progress record (vertex graph).
pub fn decode_trace(record: &[u8]) -> Option<BuildLogEvent> {
    let record: TraceRecord = serde_json::from_slice(trim_bytes(record)).ok()?;

    if let Some(message) = record
        .vertexes
        .iter()
        .filter_map(|v| v.error.as_deref())
        .find(|e| !e.trim().is_empty())
    {
        return Some(BuildLogEvent::Error(message.trim().to_string()));
    }

    // Latest timestamp wins; ties and missing timestamps fall back to list order.
    let mut latest: Option<&Vertex> = None;
    for vertex in record
        .vertexes
        .iter()
        .filter(|v| v.name.as_deref().is_some_and(|n| !n.trim().is_empty()))
    {
        latest = match latest {
            Some(current) if current.updated_at() > vertex.updated_at() => Some(current),
            _ => Some(vertex),
        };
    }

    latest
        .and_then(|v| v.name.as_deref())
        .map(|name| BuildLogEvent::Step(name.trim().to_string()))
}

fn trim_bytes(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classic_error_record() {
        let event = decode_classic(
            br#"{"errorDetail":{"message":"COPY failed: no such file"},"error":"COPY failed: no such file"}"#,
        );
        assert_eq!(event, Some(BuildLogEvent::Error("COPY failed: no such file".into())));
    }

    #[test]
    fn test_classic_error_detail_only() {
        let event = decode_classic(br#"{"errorDetail":{"message":"exit code 2"}}"#);
        assert_eq!(event, Some(BuildLogEvent::Error("exit code 2".into())));
    }

    #[test]
    fn test_classic_error_wins_over_stream() {
        let event = decode_classic(br#"{"stream":"Step 2/4 : RUN make","error":"make failed"}"#);
        assert_eq!(event, Some(BuildLogEvent::Error("make failed".into())));
    }

    #[test]
    fn test_classic_step_line() {
        let event = decode_classic(br#"{"stream":"Step 3/7 : RUN go mod download\n"}"#);
        assert_eq!(
            event,
            Some(BuildLogEvent::Step("Step 3/7 : RUN go mod download".into()))
        );
    }

    #[test]
    fn test_classic_status_verbs() {
        assert_eq!(
            decode_classic(br#"{"status":"Pulling from library/golang","id":"1.22"}"#),
            Some(BuildLogEvent::Step("Pulling from library/golang".into()))
        );
        assert_eq!(
            decode_classic(br#"{"stream":" ---> Running in 3f2a1c\n"}"#),
            Some(BuildLogEvent::Step("---> Running in 3f2a1c".into()))
        );
    }

    #[test]
    fn test_classic_noise_is_skipped() {
        assert_eq!(decode_classic(br#"{"stream":"go: downloading example.com v1\n"}"#), None);
        assert_eq!(decode_classic(br#"{"aux":{"ID":"sha256:abc"}}"#), None);
        assert_eq!(decode_classic(b"not json"), None);
        assert_eq!(decode_classic(b"   \n"), None);
    }

    #[test]
    fn test_trace_vertex_error() {
        let record = br#"{"vertexes":[
            {"digest":"sha256:1","name":"[build 1/4] FROM golang","started":"2024-05-01T10:00:00Z","completed":"2024-05-01T10:00:01Z"},
            {"digest":"sha256:2","name":"[build 4/4] RUN go build","started":"2024-05-01T10:00:02Z","error":"process did not complete successfully: exit code: 1"}
        ]}"#;
        assert_eq!(
            decode_trace(record),
            Some(BuildLogEvent::Error(
                "process did not complete successfully: exit code: 1".into()
            ))
        );
    }

    #[test]
    fn test_trace_latest_vertex_is_the_step() {
        let record = br#"{"vertexes":[
            {"digest":"sha256:2","name":"[build 2/4] RUN go mod download","started":"2024-05-01T10:00:05Z"},
            {"digest":"sha256:1","name":"[build 1/4] FROM golang","started":"2024-05-01T10:00:00Z","completed":"2024-05-01T10:00:01Z"}
        ],"statuses":[],"logs":[]}"#;
        assert_eq!(
            decode_trace(record),
            Some(BuildLogEvent::Step("[build 2/4] RUN go mod download".into()))
        );
    }

    #[test]
    fn test_trace_without_timestamps_uses_list_order() {
        let record = br#"{"vertexes":[{"name":"first"},{"name":""},{"name":"second"}]}"#;
        assert_eq!(decode_trace(record), Some(BuildLogEvent::Step("second".into())));
    }

    #[test]
    fn test_trace_logs_only_record_is_skipped() {
        assert_eq!(decode_trace(br#"{"logs":[{"vertex":"sha256:1","data":"aGk="}]}"#), None);
        assert_eq!(decode_trace(b"{broken"), None);
    }

    #[test]
    fn test_decoder_dispatches_on_format() {
        let line = br#"{"stream":"Step 1/2 : FROM scratch"}"#;
        assert!(BuildLogDecoder::new(BuildLogFormat::Classic).decode(line).is_some());
        assert!(BuildLogDecoder::new(BuildLogFormat::Trace).decode(line).is_none());
    }
}
