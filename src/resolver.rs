// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Source-map discovery for script responses.
//!
//! The map location comes from the last `//# sourceMappingURL=` directive in
//! the script, or else from the `<script>.map` naming convention. The map is
//! fetched by replaying a synthesized sub-request through the host and waiting
//! for its response hook, bounded by [`SOURCE_MAP_TIMEOUT`].

use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::flow::{Flow, SubRequestKind};
use crate::pending::{PendingWaits, SubRequestOutcome, WaitResult};
use crate::pipeline::Pipeline;
use crate::registry::DedupRegistry;
use crate::snapshot::OriginalRequest;

pub const SOURCE_MAP_TIMEOUT: Duration = Duration::from_secs(10);

static SOURCE_MAPPING_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^//.*sourceMappingURL=(.*)$").expect("valid sourceMappingURL pattern")
});

/// Value of the last source-mapping directive in `body`, if any.
pub fn find_source_mapping_url(body: &str) -> Option<&str> {
    SOURCE_MAPPING_URL
        .captures_iter(body)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .last()
}

/// Where the source map for this script lives, relative to its directory.
///
/// Inline `data:` maps have nothing to fetch, and directives naming another
/// origin cannot be expressed as a trailing segment. Without a directive, a
/// script requested at a directory path (`/` included) has no name to derive
/// from.
pub fn source_map_location(body: &str, snapshot: &OriginalRequest) -> Option<String> {
    match find_source_mapping_url(body) {
        Some(url) if url.starts_with("data:") => None,
        Some(url) if url.contains("://") || url.starts_with("//") => {
            debug!(%url, "source map on another origin, not fetched");
            None
        }
        Some(url) => Some(url.to_string()),
        None => snapshot.last_segment().map(|s| format!("{}.map", s)),
    }
}

/// Accept only a 200 response whose body parses as JSON.
///
/// Single-page apps commonly answer unknown paths with their HTML shell, so
/// the status alone proves nothing.
pub fn validate_source_map(outcome: SubRequestOutcome) -> Option<String> {
    match outcome {
        SubRequestOutcome::Failed(e) => {
            debug!(error = %e, "source map sub-request failed");
            None
        }
        SubRequestOutcome::Response(resp) if resp.status == 200 => {
            let text = resp.text();
            match serde_json::from_str::<serde::de::IgnoredAny>(&text) {
                Ok(_) => Some(text),
                Err(e) => {
                    debug!(%e, "source map response is not JSON");
                    None
                }
            }
        }
        SubRequestOutcome::Response(resp) => {
            debug!(status = resp.status, "source map not available");
            None
        }
    }
}

pub struct SourceMapResolver {
    pipeline: Arc<dyn Pipeline>,
    registry: Arc<DedupRegistry>,
    waits: Arc<PendingWaits>,
    timeout: Duration,
}

impl SourceMapResolver {
    pub fn new(
        pipeline: Arc<dyn Pipeline>,
        registry: Arc<DedupRegistry>,
        waits: Arc<PendingWaits>,
    ) -> Self {
        Self {
            pipeline,
            registry,
            waits,
            timeout: SOURCE_MAP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch and validate the source map for a script flow. `body` is the
    /// decoded response text.
    pub async fn resolve(&self, flow: &Flow, body: &str) -> Option<String> {
        if flow.is_source_map_request() {
            return None;
        }
        let snapshot = flow.snapshot.as_ref()?;

        let Some(location) = source_map_location(body, snapshot) else {
            debug!(url = %snapshot.uri(), "no source map location");
            return None;
        };

        let sub = match Flow::sub_request(flow.id, snapshot, &location, SubRequestKind::SourceMap)
        {
            Ok(sub) => sub,
            Err(e) => {
                debug!(%location, %e, "cannot build source map request");
                return None;
            }
        };

        let key = sub.resource_key();
        if !self.registry.try_claim(&key) {
            warn!(url = %key, "source map already fetched, skipping");
            return None;
        }

        // Registered before replay so a fast response cannot slip past.
        let wait = self.waits.register(sub.id);
        let sub_id = sub.id;
        self.pipeline.duplicate_for_display(&sub);
        self.pipeline.replay(sub);

        match wait.wait(self.timeout).await {
            WaitResult::Delivered(outcome) => validate_source_map(outcome),
            WaitResult::TimedOut => {
                self.waits.cancel(sub_id);
                warn!(url = %key, timeout = ?self.timeout, "source map request timed out, killing");
                self.pipeline.kill(sub_id);
                None
            }
            WaitResult::Abandoned => None,
        }
    }
}
