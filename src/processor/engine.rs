use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::Call;
use super::CallHandle;
use super::TemplateResourceProcessor;
use crate::constants::DISPATCH_IDLE_MS;
use crate::constants::PROBE_KEY;
use crate::constants::PROBE_TIMEOUT_MS;
use crate::list_template_resource;
use crate::utils::async_task::sleep_or_cancelled;
use crate::BackendClient;
use crate::BackoffPolicy;
use crate::Config;
use crate::Error;
use crate::Result;
use crate::RunMode;
use crate::SyncError;

/// Scheduling engine.
///
/// Calls submitted through [`go`](Self::go) wait in a queue until the
/// dispatcher hands each one to its own worker task. The worker runs the
/// call in the mode its configuration selects and completes it.
///
/// Must be created inside a tokio runtime.
pub struct Processor {
    pending: Arc<Mutex<VecDeque<Call>>>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl Processor {
    pub fn new() -> Self {
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(dispatch_loop(pending.clone(), stop.clone(), tracker.clone()));
        Self { pending, stop, tracker }
    }

    /// Submits a call and returns its completion handle.
    ///
    /// # Errors
    /// Invalid configurations are rejected here. A processor that is
    /// closing still returns a handle, which resolves with
    /// [`Error::ProcessorShutdown`].
    pub async fn go(
        &self,
        config: Config,
        client: Arc<dyn BackendClient>,
    ) -> Result<CallHandle> {
        config.validate()?;
        probe(client.as_ref()).await;

        let (call, handle) = Call::new(config, client);
        let rejected = {
            let mut pending = self.pending.lock();
            if self.stop.is_cancelled() {
                Some(call)
            } else {
                debug!(call = %call.id(), "call queued");
                pending.push_back(call);
                None
            }
        };
        if let Some(call) = rejected {
            call.done(Err(Error::ProcessorShutdown));
        }
        Ok(handle)
    }

    /// Submits a call and waits for its completion.
    ///
    /// In interval and watch mode this only returns once the processor closes.
    pub async fn run(
        &self,
        config: Config,
        client: Arc<dyn BackendClient>,
    ) -> Result<()> {
        self.go(config, client).await?.wait().await
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stops every worker and watcher and fails the calls still queued.
    ///
    /// Returns once all tasks exited. Safe to call more than once.
    pub async fn close(&self) {
        if !self.stop.is_cancelled() {
            info!("closing processor");
            self.stop.cancel();
        }

        let drained: Vec<Call> = self.pending.lock().drain(..).collect();
        for call in drained {
            debug!(call = %call.id(), "dropping queued call");
            call.done(Err(Error::ProcessorShutdown));
        }

        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn probe(client: &dyn BackendClient) {
    let keys = [PROBE_KEY.to_string()];
    match tokio::time::timeout(Duration::from_millis(PROBE_TIMEOUT_MS), client.get_values(&keys)).await {
        Ok(Ok(_)) => debug!(backend = client.backend_type(), "backend reachable"),
        Ok(Err(e)) => warn!(backend = client.backend_type(), "backend probe failed: {}", e),
        Err(_) => warn!(backend = client.backend_type(), "backend probe timed out"),
    }
}

async fn dispatch_loop(
    pending: Arc<Mutex<VecDeque<Call>>>,
    stop: CancellationToken,
    tracker: TaskTracker,
) {
    let idle = Duration::from_millis(DISPATCH_IDLE_MS);
    loop {
        if stop.is_cancelled() {
            break;
        }
        let next = pending.lock().pop_front();
        match next {
            Some(call) => {
                if stop.is_cancelled() {
                    call.done(Err(Error::ProcessorShutdown));
                    break;
                }
                debug!(call = %call.id(), "dispatching call");
                tracker.spawn(run_call(call, stop.clone()));
            }
            None => {
                if !sleep_or_cancelled(idle, &stop).await {
                    break;
                }
            }
        }
    }
    debug!("dispatcher stopped");
}

async fn run_call(
    call: Call,
    stop: CancellationToken,
) {
    let mode = call.config.mode();
    info!(call = %call.id(), ?mode, backend = call.client.backend_type(), "call started");
    let result = match mode {
        RunMode::Once => run_once(&call).await,
        RunMode::Interval => run_interval(&call, &stop).await,
        RunMode::Watch if call.client.watch_enabled() => run_watch(&call, &stop).await,
        RunMode::Watch => {
            warn!(
                backend = call.client.backend_type(),
                "backend does not support watch, polling every {}s", call.config.interval
            );
            run_interval(&call, &stop).await
        }
    };
    match &result {
        Ok(()) => info!(call = %call.id(), "call completed"),
        Err(e) => error!(call = %call.id(), "call failed: {}", e),
    }
    call.done(result);
}

/// Processors for every loadable resource, plus the errors of the others
fn build_processors(call: &Call) -> Result<(Vec<TemplateResourceProcessor>, Vec<Error>)> {
    let config = &call.config;
    let loaded = list_template_resource(&config.conf_d_dir(), &config.confdir)?;
    let key = config.decryption_key()?;

    let mut errors = Vec::new();
    for (path, e) in loaded.errors {
        warn!("skipping descriptor {:?}: {}", path, e);
        errors.push(e);
    }

    let mut processors = Vec::with_capacity(loaded.resources.len());
    for mut resource in loaded.resources {
        if resource.private_key.is_none() {
            resource.private_key = key.clone();
        }
        let dest = resource.dest.clone();
        match TemplateResourceProcessor::new(resource, config.clone(), call.client.clone()) {
            Ok(p) => processors.push(p),
            Err(e) => {
                warn!(dest = %dest, "cannot set up resource: {}", e);
                errors.push(e);
            }
        }
    }
    debug!("{} resources loaded, {} rejected", processors.len(), errors.len());
    Ok((processors, errors))
}

async fn process_all(processors: &[TemplateResourceProcessor]) -> Vec<Error> {
    let mut errors = Vec::new();
    for p in processors {
        if let Err(e) = p.process().await {
            errors.push(e);
        }
    }
    errors
}

/// A single failure is returned as is, several are summarized.
pub(super) fn aggregate(
    mut errors: Vec<Error>,
    total: usize,
) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        failed => Err(SyncError::Resources {
            failed,
            total,
            first: errors[0].to_string(),
        }
        .into()),
    }
}

async fn run_once(call: &Call) -> Result<()> {
    let (processors, mut errors) = build_processors(call)?;
    let total = processors.len() + errors.len();
    errors.extend(process_all(&processors).await);
    aggregate(errors, total)
}

async fn run_interval(
    call: &Call,
    stop: &CancellationToken,
) -> Result<()> {
    let (processors, _) = build_processors(call)?;
    let interval = Duration::from_secs(call.config.interval);
    loop {
        let errors = process_all(&processors).await;
        if !errors.is_empty() {
            warn!("{} of {} resources failed this pass", errors.len(), processors.len());
        }
        if !sleep_or_cancelled(interval, stop).await {
            break;
        }
    }
    Ok(())
}

async fn run_watch(
    call: &Call,
    stop: &CancellationToken,
) -> Result<()> {
    let (processors, _) = build_processors(call)?;
    let mut watchers = JoinSet::new();
    for p in processors {
        watchers.spawn(watch_resource(p, stop.child_token(), call.config.retry));
    }
    while let Some(joined) = watchers.join_next().await {
        if let Err(e) = joined {
            error!("watcher task failed: {}", e);
        }
    }
    Ok(())
}

/// Watch, process, repeat, until `stop` fires or retries run out.
async fn watch_resource(
    mut processor: TemplateResourceProcessor,
    stop: CancellationToken,
    policy: BackoffPolicy,
) {
    let dest = processor.dest().display().to_string();
    let mut failures = 0usize;
    while !stop.is_cancelled() {
        match processor.wait_for_change(stop.clone()).await {
            Ok(false) => break,
            Ok(true) => {
                failures = 0;
                // failures are logged by the pass and retried on the next change
                let _ = processor.process().await;
            }
            Err(e) => {
                failures += 1;
                if !policy.allows(failures) {
                    error!(dest = %dest, "giving up watch after {} failures: {}", failures, e);
                    break;
                }
                let delay = policy.delay_for(failures - 1);
                warn!(dest = %dest, "watch failed, retrying in {:?}: {}", delay, e);
                if !sleep_or_cancelled(delay, &stop).await {
                    break;
                }
            }
        }
    }
    debug!(dest = %dest, "watcher stopped");
}
