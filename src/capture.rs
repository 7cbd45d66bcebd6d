// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Flow log written as JSON lines. Serves as the proxy's view: completed
//! flows and display duplicates of sub-requests land here.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::flow::{Flow, SubRequestKind};

#[derive(Clone)]
pub struct CaptureWriter {
    file: Arc<Mutex<tokio::fs::File>>,
}

impl CaptureWriter {
    pub async fn new<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub async fn write_record(&self, record: &CaptureRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Read back a capture log. Malformed lines are skipped with a warning; a
/// missing file reads as empty.
pub async fn load_captures<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<CaptureRecord>> {
    use tokio::io::AsyncBufReadExt;

    let path = path.as_ref();
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(Vec::new());
    }

    let file = tokio::fs::File::open(path).await?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut records = Vec::new();
    let mut line_num = 0;

    while let Some(line) = lines.next_line().await? {
        line_num += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CaptureRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(line = line_num, error = %e, "failed to parse capture record, skipping");
            }
        }
    }
    Ok(records)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub timestamp: String,
    pub method: String,
    pub uri: String,
    /// `None` for display duplicates and failed flows.
    pub status: Option<u16>,
    pub kind: Option<SubRequestKind>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl CaptureRecord {
    /// Record of a flow that reached its response or error hook.
    pub fn completed(flow: &Flow, duration_ms: u64) -> Self {
        Self {
            status: flow.response.as_ref().map(|r| r.status),
            error: flow.error.clone(),
            duration_ms,
            ..Self::display_duplicate(flow)
        }
    }

    /// Placeholder shown when a sub-request is synthesized, before it runs.
    pub fn display_duplicate(flow: &Flow) -> Self {
        Self {
            id: flow.id.to_string(),
            parent: flow
                .metadata
                .get("parent_flow")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            timestamp: flow.timestamp.to_rfc3339(),
            method: flow.request.method.to_string(),
            uri: flow.request.uri.to_string(),
            status: None,
            kind: flow.subrequest,
            error: None,
            duration_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ResponseInfo;
    use crate::test_helpers::make_flow;
    use bytes::Bytes;
    use hyper::HeaderMap;
    use serde_json::Value;
    use tokio::fs;
    use uuid::Uuid;

    fn tmp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("jswzl_capture_{}_{}.jsonl", tag, Uuid::new_v4()))
    }

    #[tokio::test]
    async fn completed_flow_is_written_as_jsonl() -> anyhow::Result<()> {
        let tmp = tmp_path("write");
        let writer = CaptureWriter::new(&tmp).await?;

        let mut flow = make_flow("GET", "http://example.test/app.js")?;
        flow.response = Some(ResponseInfo::new(200, HeaderMap::new(), Bytes::new()));
        writer.write_record(&CaptureRecord::completed(&flow, 12)).await?;

        let s = fs::read_to_string(&tmp).await?;
        let v: Value = serde_json::from_str(s.trim())?;
        assert_eq!(v["method"], "GET");
        assert_eq!(v["uri"], "http://example.test/app.js");
        assert_eq!(v["status"], 200);
        assert_eq!(v["kind"], Value::Null);
        assert_eq!(v["duration_ms"], 12);
        assert!(v.get("parent").is_none());

        fs::remove_file(&tmp).await?;
        Ok(())
    }

    #[tokio::test]
    async fn display_duplicate_carries_kind_and_parent() -> anyhow::Result<()> {
        let tmp = tmp_path("dup");
        let writer = CaptureWriter::new(&tmp).await?;

        let parent = Uuid::new_v4();
        let mut flow = make_flow("GET", "http://example.test/app.js.map")?;
        flow.subrequest = Some(SubRequestKind::SourceMap);
        flow.metadata
            .insert("parent_flow".into(), Value::String(parent.to_string()));
        writer
            .write_record(&CaptureRecord::display_duplicate(&flow))
            .await?;

        let records = load_captures(&tmp).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, None);
        assert_eq!(records[0].kind, Some(SubRequestKind::SourceMap));
        assert_eq!(records[0].parent, Some(parent.to_string()));

        fs::remove_file(&tmp).await?;
        Ok(())
    }

    #[tokio::test]
    async fn load_skips_malformed_lines() -> anyhow::Result<()> {
        let tmp = tmp_path("malformed");
        let content = r#"{"id":"1","timestamp":"2024-01-01T00:00:00Z","method":"GET","uri":"http://example/","status":200,"kind":null,"error":null,"duration_ms":0}
invalid json line
{"id":"2","timestamp":"2024-01-01T00:00:01Z","method":"GET","uri":"http://example/1.js","status":null,"kind":"chunk","error":"killed","duration_ms":5}
"#;
        fs::write(&tmp, content).await?;

        let records = load_captures(&tmp).await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].kind, Some(SubRequestKind::Chunk));
        assert_eq!(records[1].error.as_deref(), Some("killed"));

        fs::remove_file(&tmp).await?;
        Ok(())
    }

    #[tokio::test]
    async fn load_missing_file_is_empty() -> anyhow::Result<()> {
        assert!(load_captures(tmp_path("missing")).await?.is_empty());
        Ok(())
    }
}
