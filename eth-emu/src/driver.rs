//! Dual-channel driver: runs an endpoint's two duties as tokio tasks.
//!
//! ```text
//!   Endpoint::start()
//!        │
//!        ├── spawn ──▶ outbound task   (stimulus → sink)
//!        └── spawn ──▶ inbound task    (source → hook, ACKs → sink)
//!                           │
//!   RunningEndpoint::join() ┘  awaits both, disconnects sink and source
//! ```
//!
//! A passive TCP endpoint has no outbound duty; only its inbound task is
//! spawned.

use std::sync::Arc;

use tokio::task::{AbortHandle, JoinHandle, JoinSet};

use crate::bus::{WordSink, WordSource};
use crate::endpoint::{inbound_duty, outbound_duty, Duty, Endpoint, Role};
use crate::error::EndpointError;

type DutyTask = JoinHandle<Result<usize, EndpointError>>;

/// What an endpoint did once both of its duties finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointReport {
    pub name: String,
    /// Frames sent; `None` when the role has no outbound duty.
    pub sent: Option<usize>,
    pub received: usize,
}

/// How [`join_all`] reacts to a failed endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Stop every endpoint and return the first error.
    #[default]
    Abort,
    /// Log the error, let the other endpoints finish, then fail.
    Continue,
}

// ---------------------------------------------------------------------------
// RunningEndpoint
// ---------------------------------------------------------------------------

/// Handle to an endpoint whose duties are running.
///
/// The inbound task holds the source lock for its whole run, so the lock
/// only frees up once that task has finished or been dropped.
pub struct RunningEndpoint<S, R> {
    name: String,
    outbound: Option<DutyTask>,
    inbound: DutyTask,
    sink: Arc<tokio::sync::Mutex<S>>,
    source: Arc<tokio::sync::Mutex<R>>,
}

impl<S, R> Endpoint<S, R>
where
    S: WordSink,
    R: WordSource,
{
    /// Spawn the outbound and inbound duties. Must be called within a tokio
    /// runtime.
    pub fn start(self) -> RunningEndpoint<S, R> {
        let Endpoint {
            link,
            source,
            receive_limit,
            mut stimulus,
            mut hook,
        } = self;
        let name = link.name.clone();
        let sink = Arc::clone(&link.sink);

        let outbound = if link.role == Role::TcpPassive {
            let unsupported = EndpointError::UnsupportedDuty {
                role: link.role,
                duty: Duty::Outbound,
            };
            log::info!("[{name}] {unsupported}; not started");
            None
        } else {
            let link = link.clone();
            Some(tokio::spawn(async move {
                outbound_duty(&link, &mut stimulus).await
            }))
        };

        let source = Arc::new(tokio::sync::Mutex::new(source));
        let held = Arc::clone(&source);
        let inbound = tokio::spawn(async move {
            let mut source = held.lock_owned().await;
            inbound_duty(&link, &mut *source, receive_limit, hook.as_mut()).await
        });

        RunningEndpoint {
            name,
            outbound,
            inbound,
            sink,
            source,
        }
    }
}

impl<S, R> RunningEndpoint<S, R>
where
    S: WordSink,
    R: WordSource,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    fn abort_handles(&self) -> Vec<AbortHandle> {
        self.outbound
            .iter()
            .map(JoinHandle::abort_handle)
            .chain(std::iter::once(self.inbound.abort_handle()))
            .collect()
    }

    /// Wait for both duties. If one fails the other is aborted. Both channels
    /// are disconnected before returning, also when the duties were aborted
    /// from outside.
    pub async fn join(self) -> Result<EndpointReport, EndpointError> {
        let aborts = self.abort_handles();
        let Self {
            name,
            outbound,
            inbound,
            sink,
            source,
        } = self;

        let result = tokio::try_join!(await_outbound(outbound), await_inbound(inbound));
        if result.is_err() {
            for handle in &aborts {
                handle.abort();
            }
        }
        sink.lock().await.disconnect().await;
        source.lock().await.disconnect().await;

        let (sent, received) = result?;
        log::info!(
            "[{name}] finished: sent {}, received {received}",
            sent.map_or_else(|| "-".to_owned(), |n| n.to_string())
        );
        Ok(EndpointReport {
            name,
            sent,
            received,
        })
    }
}

async fn await_outbound(task: Option<DutyTask>) -> Result<Option<usize>, EndpointError> {
    match task {
        Some(handle) => Ok(Some(handle.await??)),
        None => Ok(None),
    }
}

async fn await_inbound(task: DutyTask) -> Result<usize, EndpointError> {
    task.await?
}

// ---------------------------------------------------------------------------
// join_all
// ---------------------------------------------------------------------------

/// Join every endpoint under `policy`. Reports come back in input order.
pub async fn join_all<S, R>(
    endpoints: Vec<RunningEndpoint<S, R>>,
    policy: FailurePolicy,
) -> Result<Vec<EndpointReport>, EndpointError>
where
    S: WordSink,
    R: WordSource,
{
    let aborts: Vec<AbortHandle> = endpoints
        .iter()
        .flat_map(RunningEndpoint::abort_handles)
        .collect();
    let mut reports: Vec<Option<EndpointReport>> = vec![None; endpoints.len()];
    let mut set = JoinSet::new();
    for (index, endpoint) in endpoints.into_iter().enumerate() {
        let name = endpoint.name().to_owned();
        set.spawn(async move { (index, name, endpoint.join().await) });
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        let (index, name, result) = joined?;
        match result {
            Ok(report) => reports[index] = Some(report),
            Err(e) => match policy {
                FailurePolicy::Abort => {
                    log::error!("[{name}] failed: {e}; aborting remaining endpoints");
                    for handle in &aborts {
                        handle.abort();
                    }
                    // Each join still disconnects its channels once its
                    // duties are gone.
                    while let Some(joined) = set.join_next().await {
                        if let Ok((_, name, Err(e))) = joined {
                            log::debug!("[{name}] stopped: {e}");
                        }
                    }
                    return Err(e);
                }
                FailurePolicy::Continue => {
                    log::error!("[{name}] failed: {e}");
                    first_error.get_or_insert(e);
                }
            },
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(reports.into_iter().flatten().collect()),
    }
}
