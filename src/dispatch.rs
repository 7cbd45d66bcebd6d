// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Replays chunk files reported by the analysis service.

use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::flow::{Flow, SubRequestKind};
use crate::pipeline::Pipeline;
use crate::registry::DedupRegistry;
use crate::snapshot::OriginalRequest;

/// Final path segment of a reported chunk path.
///
/// The service sometimes prefixes chunk names with directories that do not
/// exist relative to the script (`static/chunks/517.js` for a script that
/// already lives in `static/chunks/`), so only the basename is used.
pub fn chunk_basename(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}

pub struct ChunkDispatcher {
    pipeline: Arc<dyn Pipeline>,
    registry: Arc<DedupRegistry>,
}

impl ChunkDispatcher {
    pub fn new(pipeline: Arc<dyn Pipeline>, registry: Arc<DedupRegistry>) -> Self {
        Self { pipeline, registry }
    }

    /// Replay one sub-request per chunk not fetched before. Fire-and-forget;
    /// returns how many were replayed.
    pub fn dispatch(&self, parent: Uuid, snapshot: &OriginalRequest, chunk_paths: &[String]) -> usize {
        let mut replayed = 0;
        for path in chunk_paths {
            let Some(name) = chunk_basename(path) else {
                debug!(%path, "ignoring chunk path without a file name");
                continue;
            };

            let sub = match Flow::sub_request(parent, snapshot, name, SubRequestKind::Chunk) {
                Ok(sub) => sub,
                Err(e) => {
                    debug!(%path, %e, "cannot build chunk request");
                    continue;
                }
            };

            let key = sub.resource_key();
            if !self.registry.try_claim(&key) {
                warn!(url = %key, "chunk already fetched, skipping");
                continue;
            }

            debug!(url = %key, "replaying chunk");
            self.pipeline.duplicate_for_display(&sub);
            self.pipeline.replay(sub);
            replayed += 1;
        }
        replayed
    }
}
