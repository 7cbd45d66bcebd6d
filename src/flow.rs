// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Canonical flow struct: one intercepted request and its response or error.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::{GzDecoder, ZlibDecoder};
use hyper::header::{CONTENT_ENCODING, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Uri, Version};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::snapshot::OriginalRequest;

/// Marks a flow synthesized by the proxy itself rather than sent by a client.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubRequestKind {
    SourceMap,
    Chunk,
}

/// Lifecycle of a flow as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    New,
    HeadersSeen,
    BodyBuffered,
    ResponseReceived,
    Enriching,
    Done,
    Skipped,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Done | FlowState::Skipped)
    }

    pub fn can_advance_to(self, next: FlowState) -> bool {
        use FlowState::*;
        match (self, next) {
            (New, HeadersSeen) | (New, Skipped) => true,
            (HeadersSeen, BodyBuffered) => true,
            (BodyBuffered, ResponseReceived) => true,
            (ResponseReceived, Enriching) => true,
            (from, Done) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Decoded body passed the size limit. Carries the number of bytes seen,
/// which for compressed bodies stops one past the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyTooLarge(pub usize);

#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: u16,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseInfo {
    pub fn new(status: u16, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            body,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Body with `content-encoding` removed. Unknown encodings and corrupt
    /// payloads yield the raw bytes.
    pub fn decoded_body(&self) -> Bytes {
        match self.decoded_body_within(usize::MAX) {
            Ok(body) => body,
            Err(_) => self.body.clone(),
        }
    }

    /// Like [`decoded_body`](Self::decoded_body), but stops inflating once
    /// the output passes `limit` bytes.
    pub fn decoded_body_within(&self, limit: usize) -> Result<Bytes, BodyTooLarge> {
        let encoding = self
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_ascii_lowercase());

        let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
        let mut out = Vec::new();
        let decoded = match encoding.as_deref() {
            Some("gzip") | Some("x-gzip") => {
                GzDecoder::new(&self.body[..]).take(cap).read_to_end(&mut out)
            }
            Some("deflate") => ZlibDecoder::new(&self.body[..]).take(cap).read_to_end(&mut out),
            _ => return self.raw_within(limit),
        };
        match decoded {
            Ok(_) if out.len() > limit => Err(BodyTooLarge(out.len())),
            Ok(_) => Ok(Bytes::from(out)),
            Err(e) => {
                tracing::debug!(%e, "failed to decode response body, using raw bytes");
                self.raw_within(limit)
            }
        }
    }

    fn raw_within(&self, limit: usize) -> Result<Bytes, BodyTooLarge> {
        if self.body.len() > limit {
            Err(BodyTooLarge(self.body.len()))
        } else {
            Ok(self.body.clone())
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.decoded_body()).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct Flow {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub client_addr: Option<SocketAddr>,

    pub request: RequestInfo,
    pub response: Option<ResponseInfo>,
    pub error: Option<String>,

    /// Free-form annotations; never consulted for control decisions.
    pub metadata: HashMap<String, serde_json::Value>,

    pub snapshot: Option<Arc<OriginalRequest>>,
    /// Set on flows synthesized by the proxy. Source-map sub-requests are never enriched.
    pub subrequest: Option<SubRequestKind>,
    pub skip: bool,

    state: FlowState,
}

impl Flow {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            client_addr: None,
            request: RequestInfo {
                method,
                uri,
                version: Version::HTTP_11,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            },
            response: None,
            error: None,
            metadata: HashMap::new(),
            snapshot: None,
            subrequest: None,
            skip: false,
            state: FlowState::New,
        }
    }

    /// Synthesize a sub-request from `snapshot`, replacing only the trailing
    /// path segment with `target`.
    pub fn sub_request(
        parent: Uuid,
        snapshot: &OriginalRequest,
        target: &str,
        kind: SubRequestKind,
    ) -> anyhow::Result<Self> {
        let uri = snapshot.with_last_segment(target)?;
        let mut flow = Flow::new(snapshot.method().clone(), uri);
        flow.request.headers = snapshot.headers().clone();
        flow.request.body = snapshot.body();
        flow.subrequest = Some(kind);
        flow.metadata.insert(
            "parent_flow".to_string(),
            serde_json::Value::String(parent.to_string()),
        );
        Ok(flow)
    }

    /// Canonical identity of the resource this flow fetches.
    pub fn resource_key(&self) -> String {
        self.request.uri.to_string()
    }

    pub fn is_source_map_request(&self) -> bool {
        self.subrequest == Some(SubRequestKind::SourceMap)
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Move to `next` if the transition is legal. Illegal transitions are
    /// logged and ignored.
    pub fn advance(&mut self, next: FlowState) -> bool {
        if self.state.can_advance_to(next) {
            tracing::trace!(flow = %self.id, from = ?self.state, to = ?next, "flow state");
            self.state = next;
            true
        } else {
            tracing::debug!(flow = %self.id, from = ?self.state, to = ?next, "ignoring illegal flow transition");
            false
        }
    }
}
