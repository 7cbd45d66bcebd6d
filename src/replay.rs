// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Replay channel between the enrichment core and the proxy.
//!
//! [`ReplayHandle`] is the [`Pipeline`] given to the orchestrator. Commands
//! travel over an unbounded channel to [`run_replay_worker`], which executes
//! each synthesized flow on its own task and aborts it on kill.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capture::{CaptureRecord, CaptureWriter};
use crate::flow::Flow;
use crate::pipeline::Pipeline;

/// Error recorded on a replayed flow that was killed before it completed.
pub const KILLED: &str = "killed";

#[derive(Debug)]
pub enum ReplayCommand {
    Replay(Flow),
    Kill(Uuid),
}

#[derive(Clone)]
pub struct ReplayHandle {
    tx: mpsc::UnboundedSender<ReplayCommand>,
    view: Option<CaptureWriter>,
}

impl ReplayHandle {
    /// Create a handle and the receiving end to hand to [`run_replay_worker`].
    /// Display duplicates go to `view` when one is configured.
    pub fn channel(view: Option<CaptureWriter>) -> (Self, mpsc::UnboundedReceiver<ReplayCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, view }, rx)
    }

    fn send(&self, cmd: ReplayCommand) {
        if let Err(e) = self.tx.send(cmd) {
            warn!(command = ?e.0, "replay worker is gone, dropping command");
        }
    }
}

impl Pipeline for ReplayHandle {
    fn replay(&self, flow: Flow) {
        self.send(ReplayCommand::Replay(flow));
    }

    fn kill(&self, flow_id: Uuid) {
        self.send(ReplayCommand::Kill(flow_id));
    }

    fn duplicate_for_display(&self, flow: &Flow) {
        let Some(view) = self.view.clone() else {
            return;
        };
        let record = CaptureRecord::display_duplicate(flow);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = view.write_record(&record).await {
                        debug!(%e, "failed to write display duplicate");
                    }
                });
            }
            Err(e) => debug!(%e, "no runtime for display duplicate"),
        }
    }
}

/// Runs a replayed flow through the host's hook sequence.
pub trait FlowExecutor: Send + Sync + 'static {
    /// Forward the flow and deliver its response or error hook.
    fn execute(&self, flow: Flow) -> impl Future<Output = ()> + Send;

    /// Deliver the error hook for a flow that will never complete.
    fn fail(&self, flow: Flow, reason: &str) -> impl Future<Output = ()> + Send;
}

/// Consume replay commands until every [`ReplayHandle`] is dropped, then wait
/// for flows still running.
pub async fn run_replay_worker<E: FlowExecutor>(
    executor: Arc<E>,
    mut rx: mpsc::UnboundedReceiver<ReplayCommand>,
) {
    let mut tasks: JoinSet<Uuid> = JoinSet::new();
    let mut running: HashMap<Uuid, (Flow, AbortHandle)> = HashMap::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(ReplayCommand::Replay(flow)) => {
                    let id = flow.id;
                    debug!(flow = %id, url = %flow.request.uri, "replaying");
                    let pending = flow.clone();
                    let exec = executor.clone();
                    let abort = tasks.spawn(async move {
                        exec.execute(flow).await;
                        id
                    });
                    running.insert(id, (pending, abort));
                }
                Some(ReplayCommand::Kill(id)) => {
                    kill_running(executor.as_ref(), &mut running, id).await
                }
                None => break,
            },
            Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                if let Ok(id) = done {
                    running.remove(&id);
                }
            }
        }
    }

    while tasks.join_next().await.is_some() {}
}

/// Abort a running replay and deliver its error hook. A task that already
/// completed but has not been reaped yet is left alone.
async fn kill_running<E: FlowExecutor>(
    executor: &E,
    running: &mut HashMap<Uuid, (Flow, AbortHandle)>,
    id: Uuid,
) {
    match running.remove(&id) {
        Some((_, abort)) if abort.is_finished() => {
            debug!(flow = %id, "kill for a flow that already completed")
        }
        Some((mut flow, abort)) => {
            abort.abort();
            flow.error = Some(KILLED.to_string());
            executor.fail(flow, KILLED).await;
        }
        None => debug!(flow = %id, "kill for a flow that is not running"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::load_captures;
    use crate::flow::SubRequestKind;
    use crate::test_helpers::make_flow;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeExecutor {
        executed: Mutex<Vec<String>>,
        failed: Mutex<Vec<(Uuid, String, Option<String>)>>,
        started: Notify,
    }

    impl FlowExecutor for FakeExecutor {
        async fn execute(&self, flow: Flow) {
            self.started.notify_one();
            if flow.request.uri.path().contains("hang") {
                std::future::pending::<()>().await;
            }
            if let Ok(mut v) = self.executed.lock() {
                v.push(flow.resource_key());
            }
        }

        async fn fail(&self, flow: Flow, reason: &str) {
            if let Ok(mut v) = self.failed.lock() {
                v.push((flow.id, reason.to_string(), flow.error.clone()));
            }
        }
    }

    #[tokio::test]
    async fn replays_run_and_worker_drains_on_close() -> anyhow::Result<()> {
        let (handle, rx) = ReplayHandle::channel(None);
        let exec = Arc::new(FakeExecutor::default());
        let worker = tokio::spawn(run_replay_worker(exec.clone(), rx));

        handle.replay(make_flow("GET", "http://example.test/a.js")?);
        handle.replay(make_flow("GET", "http://example.test/b.js")?);
        drop(handle);
        tokio::time::timeout(Duration::from_secs(2), worker).await??;

        let mut executed = exec.executed.lock().map_err(|e| anyhow::anyhow!("{e}"))?.clone();
        executed.sort();
        assert_eq!(
            executed,
            vec!["http://example.test/a.js", "http://example.test/b.js"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn kill_aborts_and_fails_the_flow_once() -> anyhow::Result<()> {
        let (handle, rx) = ReplayHandle::channel(None);
        let exec = Arc::new(FakeExecutor::default());
        let worker = tokio::spawn(run_replay_worker(exec.clone(), rx));

        let flow = make_flow("GET", "http://example.test/hang.js.map")?;
        let id = flow.id;
        handle.replay(flow);
        exec.started.notified().await;

        handle.kill(id);
        handle.kill(id);
        drop(handle);
        tokio::time::timeout(Duration::from_secs(2), worker).await??;

        let failed = exec.failed.lock().map_err(|e| anyhow::anyhow!("{e}"))?.clone();
        assert_eq!(failed, vec![(id, KILLED.to_string(), Some(KILLED.to_string()))]);
        assert!(exec.executed.lock().map_err(|e| anyhow::anyhow!("{e}"))?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn kill_after_completion_does_not_fail_the_flow() -> anyhow::Result<()> {
        let exec = FakeExecutor::default();
        let flow = make_flow("GET", "http://example.test/done.js")?;
        let id = flow.id;

        let mut tasks: JoinSet<Uuid> = JoinSet::new();
        let abort = tasks.spawn(async move { id });
        let mut running = HashMap::from([(id, (flow, abort.clone()))]);
        while !abort.is_finished() {
            tokio::task::yield_now().await;
        }

        kill_running(&exec, &mut running, id).await;
        assert!(running.is_empty());
        assert!(exec.failed.lock().map_err(|e| anyhow::anyhow!("{e}"))?.is_empty());
        assert_eq!(tasks.join_next().await.transpose()?, Some(id));
        Ok(())
    }

    #[tokio::test]
    async fn kill_of_unknown_flow_is_ignored() -> anyhow::Result<()> {
        let (handle, rx) = ReplayHandle::channel(None);
        let exec = Arc::new(FakeExecutor::default());
        let worker = tokio::spawn(run_replay_worker(exec.clone(), rx));

        handle.kill(Uuid::new_v4());
        drop(handle);
        tokio::time::timeout(Duration::from_secs(2), worker).await??;
        assert!(exec.failed.lock().map_err(|e| anyhow::anyhow!("{e}"))?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn display_duplicate_is_written_to_view() -> anyhow::Result<()> {
        let tmp = std::env::temp_dir().join(format!("jswzl_replay_view_{}.jsonl", Uuid::new_v4()));
        let view = CaptureWriter::new(&tmp).await?;
        let (handle, _rx) = ReplayHandle::channel(Some(view));

        let mut flow = make_flow("GET", "http://example.test/1.js")?;
        flow.subrequest = Some(SubRequestKind::Chunk);
        handle.duplicate_for_display(&flow);

        let mut records = Vec::new();
        for _ in 0..40 {
            records = load_captures(&tmp).await?;
            if !records.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, flow.id.to_string());
        assert_eq!(records[0].kind, Some(SubRequestKind::Chunk));
        assert_eq!(records[0].status, None);

        tokio::fs::remove_file(&tmp).await?;
        Ok(())
    }

    #[test]
    fn duplicate_without_view_is_a_no_op() -> anyhow::Result<()> {
        let (handle, _rx) = ReplayHandle::channel(None);
        handle.duplicate_for_display(&make_flow("GET", "http://example.test/1.js")?);
        Ok(())
    }
}
