// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Hook handlers sequencing snapshot, source-map resolution, analysis and
//! chunk dispatch for every flow the host intercepts.
//!
//! The host calls, in order, `on_request_headers`, `on_request`, then
//! `on_response` or `on_error`. Enrichment of an eligible response runs in a
//! detached task so delivery to the client is never delayed.

use hyper::Method;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::analysis::{AnalysisClient, AnalysisError, AnalysisRequest, ScopeFlags};
use crate::classify::{classify, should_skip, AssetKind};
use crate::config::EnrichConfig;
use crate::dispatch::ChunkDispatcher;
use crate::flow::{BodyTooLarge, Flow, FlowState};
use crate::pending::{PendingWaits, SubRequestOutcome};
use crate::pipeline::Pipeline;
use crate::registry::DedupRegistry;
use crate::resolver::SourceMapResolver;
use crate::snapshot::OriginalRequest;

/// Why a completed flow is not enriched. Not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    Skipped,
    SourceMapRequest,
    Method(Method),
    NoResponse,
    EmptyBody,
    TooLarge(usize),
    NoSnapshot,
    Kind(AssetKind),
}

impl fmt::Display for Ineligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligible::Skipped => write!(f, "skip-marked"),
            Ineligible::SourceMapRequest => write!(f, "source map sub-request"),
            Ineligible::Method(m) => write!(f, "method {}", m),
            Ineligible::NoResponse => write!(f, "no response"),
            Ineligible::EmptyBody => write!(f, "empty body"),
            Ineligible::TooLarge(n) => write!(f, "body of {} bytes over limit", n),
            Ineligible::NoSnapshot => write!(f, "no request snapshot"),
            Ineligible::Kind(k) => write!(f, "mimetype {}", k),
        }
    }
}

pub struct Orchestrator {
    max_response_size: usize,
    scope: Vec<String>,
    waits: Arc<PendingWaits>,
    resolver: SourceMapResolver,
    analysis: AnalysisClient,
    dispatcher: ChunkDispatcher,
}

impl Orchestrator {
    pub fn new(
        cfg: &EnrichConfig,
        pipeline: Arc<dyn Pipeline>,
        registry: Arc<DedupRegistry>,
    ) -> anyhow::Result<Self> {
        let waits = Arc::new(PendingWaits::new());
        Ok(Self {
            max_response_size: cfg.max_response_size,
            scope: cfg.scope.clone(),
            resolver: SourceMapResolver::new(pipeline.clone(), registry.clone(), waits.clone()),
            analysis: AnalysisClient::new(&cfg.api_url)?,
            dispatcher: ChunkDispatcher::new(pipeline, registry),
            waits,
        })
    }

    pub fn with_source_map_timeout(mut self, timeout: Duration) -> Self {
        self.resolver = self.resolver.with_timeout(timeout);
        self
    }

    pub fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis = self.analysis.with_timeout(timeout);
        self
    }

    /// Headers received: skip-mark reserved paths, otherwise snapshot the request.
    pub fn on_request_headers(&self, flow: &mut Flow) {
        if flow.state() != FlowState::New {
            return;
        }
        if should_skip(flow.request.uri.path()) {
            debug!(url = %flow.request.uri, "reserved path, skipping");
            flow.skip = true;
            flow.advance(FlowState::Skipped);
            return;
        }
        if flow.snapshot.is_none() {
            flow.snapshot = Some(Arc::new(OriginalRequest::capture(&flow.request)));
        }
        flow.advance(FlowState::HeadersSeen);
    }

    /// Body complete: record the finalized body in the snapshot.
    pub fn on_request(&self, flow: &mut Flow) {
        if flow.skip {
            return;
        }
        if let Some(snapshot) = &flow.snapshot {
            snapshot.fill_body(flow.request.body.clone());
        }
        flow.advance(FlowState::BodyBuffered);
    }

    /// Response complete. Wakes a waiting resolver for source-map
    /// sub-requests, otherwise spawns enrichment when the flow is eligible.
    pub fn on_response(self: &Arc<Self>, flow: &mut Flow) -> Option<JoinHandle<()>> {
        if flow.skip {
            return None;
        }
        flow.advance(FlowState::ResponseReceived);

        if flow.is_source_map_request() {
            if let Some(resp) = &flow.response {
                self.waits
                    .fulfill(flow.id, SubRequestOutcome::Response(resp.clone()));
            }
            self.finish(flow);
            return None;
        }

        let kind = match self.eligibility(flow) {
            Ok(kind) => kind,
            Err(reason) => {
                trace!(url = %flow.request.uri, %reason, "not enriching");
                self.finish(flow);
                return None;
            }
        };

        flow.advance(FlowState::Enriching);
        let job = flow.clone();
        // The enrichment task now holds the only needed reference.
        flow.snapshot = None;

        let this = self.clone();
        Some(tokio::spawn(async move { this.enrich(job, kind).await }))
    }

    /// Transport failure or kill.
    pub fn on_error(&self, flow: &mut Flow) {
        if flow.is_source_map_request() {
            let reason = flow.error.clone().unwrap_or_else(|| "unknown error".to_string());
            self.waits.fulfill(flow.id, SubRequestOutcome::Failed(reason));
        }
        self.finish(flow);
    }

    /// Decide whether a completed flow is worth analysing.
    pub fn eligibility(&self, flow: &Flow) -> Result<AssetKind, Ineligible> {
        if flow.skip {
            return Err(Ineligible::Skipped);
        }
        if flow.is_source_map_request() {
            return Err(Ineligible::SourceMapRequest);
        }
        if flow.request.method != Method::GET {
            return Err(Ineligible::Method(flow.request.method.clone()));
        }
        let response = flow.response.as_ref().ok_or(Ineligible::NoResponse)?;
        if response.body.is_empty() {
            return Err(Ineligible::EmptyBody);
        }
        if let Err(BodyTooLarge(seen)) = response.decoded_body_within(self.max_response_size) {
            return Err(Ineligible::TooLarge(seen));
        }
        if flow.snapshot.is_none() {
            return Err(Ineligible::NoSnapshot);
        }
        let kind = classify(response.content_type(), &flow.request.uri);
        if !kind.is_enrichable() {
            return Err(Ineligible::Kind(kind));
        }
        Ok(kind)
    }

    async fn enrich(&self, mut flow: Flow, kind: AssetKind) {
        match self.run_enrichment(&flow, kind).await {
            Ok(replayed) => {
                debug!(url = %flow.request.uri, %kind, replayed, "enrichment finished")
            }
            Err(e) => error!(url = %flow.request.uri, %e, "enrichment aborted"),
        }
        self.finish(&mut flow);
    }

    /// Resolve the source map (scripts only), ask the analysis service for
    /// related chunks and replay them. Returns the number of chunks replayed.
    pub async fn run_enrichment(&self, flow: &Flow, kind: AssetKind) -> Result<usize, AnalysisError> {
        let (Some(snapshot), Some(response)) = (flow.snapshot.as_ref(), flow.response.as_ref())
        else {
            return Ok(0);
        };

        let body = match response.decoded_body_within(self.max_response_size) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(BodyTooLarge(seen)) => {
                debug!(url = %snapshot.uri(), seen, "decoded body over limit, not analysed");
                return Ok(0);
            }
        };
        let sourcemap = match kind {
            AssetKind::Script => self.resolver.resolve(flow, &body).await,
            _ => None,
        };
        if sourcemap.is_some() {
            info!(url = %snapshot.uri(), "source map found");
        }

        let payload = AnalysisRequest::build(
            snapshot,
            response,
            kind,
            body,
            sourcemap,
            ScopeFlags::evaluate(&self.scope, snapshot),
        );
        let chunks = self.analysis.analyze(&payload).await?;
        Ok(self.dispatcher.dispatch(flow.id, snapshot, &chunks))
    }

    fn finish(&self, flow: &mut Flow) {
        flow.snapshot = None;
        flow.advance(FlowState::Done);
    }
}
