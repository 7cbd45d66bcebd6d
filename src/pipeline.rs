// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Commands the enrichment core needs from the interception host.

use uuid::Uuid;

use crate::flow::Flow;

/// Host-side operations on synthesized flows.
///
/// A replayed flow goes through the same hook sequence as client traffic and
/// eventually reaches `Orchestrator::on_response` or `Orchestrator::on_error`.
pub trait Pipeline: Send + Sync {
    /// Perform the network request for `flow`. Returns immediately.
    fn replay(&self, flow: Flow);

    /// Abort an in-flight replay. Unknown or finished ids are ignored.
    fn kill(&self, flow_id: Uuid);

    /// Show a synthesized flow in the host's view, if one is active.
    fn duplicate_for_display(&self, flow: &Flow);
}
