// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shared test utilities to reduce duplication across test modules.

use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::flow::{Flow, FlowState, RequestInfo, ResponseInfo};
use crate::pipeline::Pipeline;
use crate::snapshot::OriginalRequest;

/// Build a HeaderMap from pairs, appending repeated names.
pub fn make_headers_from_pairs(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut hm = HeaderMap::new();
    for (k, v) in pairs {
        let name = HeaderName::from_bytes(k.as_bytes()).expect("valid header name");
        let value = HeaderValue::from_str(v).expect("valid header value");
        hm.append(name, value);
    }
    hm
}

pub fn make_request(method: &str, uri: &str) -> anyhow::Result<RequestInfo> {
    Ok(make_flow(method, uri)?.request)
}

pub fn make_flow(method: &str, uri: &str) -> anyhow::Result<Flow> {
    Ok(Flow::new(method.parse()?, uri.parse()?))
}

/// A flow that has passed the request stages and received a response, with
/// its snapshot attached the way the orchestrator would.
pub fn make_response_flow(
    method: &str,
    uri: &str,
    content_type: Option<&str>,
    status: u16,
    body: &str,
) -> anyhow::Result<Flow> {
    let mut flow = make_flow(method, uri)?;
    let snapshot = OriginalRequest::capture(&flow.request);
    snapshot.fill_body(Bytes::new());
    flow.snapshot = Some(Arc::new(snapshot));
    flow.advance(FlowState::HeadersSeen);
    flow.advance(FlowState::BodyBuffered);

    let headers = match content_type {
        Some(ct) => make_headers_from_pairs(&[("content-type", ct)]),
        None => HeaderMap::new(),
    };
    flow.response = Some(ResponseInfo::new(
        status,
        headers,
        Bytes::copy_from_slice(body.as_bytes()),
    ));
    Ok(flow)
}

pub fn make_script_flow(uri: &str, body: &str) -> anyhow::Result<Flow> {
    make_response_flow("GET", uri, Some("application/javascript"), 200, body)
}

/// Pipeline fake that records every command and streams replays to the test.
pub struct RecordingPipeline {
    replayed: Mutex<Vec<Flow>>,
    killed: Mutex<Vec<Uuid>>,
    displayed: Mutex<Vec<Uuid>>,
    tx: mpsc::UnboundedSender<Flow>,
}

impl RecordingPipeline {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Flow>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(Self {
            replayed: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            displayed: Mutex::new(Vec::new()),
            tx,
        });
        (pipeline, rx)
    }

    pub fn replayed(&self) -> Vec<Flow> {
        self.replayed.lock().expect("lock").clone()
    }

    pub fn replayed_urls(&self) -> Vec<String> {
        self.replayed().iter().map(Flow::resource_key).collect()
    }

    pub fn killed(&self) -> Vec<Uuid> {
        self.killed.lock().expect("lock").clone()
    }

    pub fn displayed(&self) -> Vec<Uuid> {
        self.displayed.lock().expect("lock").clone()
    }
}

impl Pipeline for RecordingPipeline {
    fn replay(&self, flow: Flow) {
        self.replayed.lock().expect("lock").push(flow.clone());
        let _ = self.tx.send(flow);
    }

    fn kill(&self, flow_id: Uuid) {
        self.killed.lock().expect("lock").push(flow_id);
    }

    fn duplicate_for_display(&self, flow: &Flow) {
        self.displayed.lock().expect("lock").push(flow.id);
    }
}
