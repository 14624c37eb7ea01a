//! The worker loop (`spec.md` §4.6): slot allocation, poll/notify race, the
//! three-phase attempt (prepare/process/finalize), lease renewal, the reaper, and
//! error routing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, instrument, warn};

use crate::backoff::{jittered, LeaseConfig, RetryConfig};
use crate::chain::ContinueWith;
use crate::client::Engine;
use crate::error::{CancellationReason, QueuertError, Result};
use crate::job::{Job, JobId, JobStatus, Schedule};
use crate::notify::{NotifyAdapter, NotifyReceiver};
use crate::registry::Registry;
use crate::state::StateAdapter;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Whether a handler's business reads/writes share one transaction with the
/// eventual `completeJob` write (`Atomic`), or are split into a short read
/// transaction released before long external work, with a fresh transaction opened
/// at finalize time (`Staged`, the default when `prepare` is never called).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMode {
    Atomic,
    Staged,
}

/// The decision an attempt handler reaches - the explicit sum type the design notes
/// (`SPEC_FULL.md`/`spec.md` §9) prescribe in place of exceptions-as-control-flow.
pub enum AttemptDecision {
    Completed {
        output: serde_json::Value,
    },
    Continued {
        output: serde_json::Value,
        continue_with: ContinueWith,
    },
    /// An explicit reschedule request distinct from a handler error, e.g. "try
    /// again in 5 minutes", with its own recorded reason.
    Reschedule {
        schedule: Schedule,
        reason: String,
    },
}

/// A live, tagged-reason cancellation signal shared by the attempt handler, the
/// lease-renewal ticker, and (optionally) an ownership-loss listener (`spec.md` §9).
#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<Option<CancellationReason>>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancellationReason> {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&mut self) {
        while self.rx.borrow().is_none() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct CancellationSource(watch::Sender<Option<CancellationReason>>);

impl CancellationSource {
    fn new() -> Self {
        Self(watch::channel(None).0)
    }

    fn cancel(&self, reason: CancellationReason) {
        let _ = self.0.send(Some(reason));
    }

    fn token(&self) -> CancellationToken {
        CancellationToken {
            rx: self.0.subscribe(),
        }
    }
}

/// Everything an attempt handler sees: the frozen job snapshot, a cancellation
/// token, and (via `prepare`/`with_transaction`) access to a transaction for staged
/// business writes.
pub struct AttemptContext<A: StateAdapter, N: NotifyAdapter, R: Registry> {
    engine: Engine<A, N, R>,
    job: Job,
    worker_id: String,
    cancellation: CancellationToken,
    mode: tokio::sync::Mutex<Option<PrepareMode>>,
    held_tx: tokio::sync::Mutex<Option<A::Transaction>>,
}

impl<A: StateAdapter, N: NotifyAdapter, R: Registry> AttemptContext<A, N, R> {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn engine(&self) -> &Engine<A, N, R> {
        &self.engine
    }

    /// Called at most once by the handler. `Atomic` opens a transaction immediately
    /// and holds it for the rest of the attempt (see `with_transaction`); `Staged`
    /// defers transaction use to finalize time.
    pub async fn prepare(&self, mode: PrepareMode) -> Result<()> {
        *self.mode.lock().await = Some(mode);
        if mode == PrepareMode::Atomic {
            let tx = self.engine.state().begin().await?;
            *self.held_tx.lock().await = Some(tx);
        }
        Ok(())
    }

    /// Access the transaction opened by `prepare(PrepareMode::Atomic)` for staged
    /// business writes that must commit atomically with the eventual completion.
    /// Panics if `prepare(Atomic)` was never called - call it first.
    pub async fn with_transaction<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut A::Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = self.held_tx.lock().await;
        let tx = guard
            .as_mut()
            .expect("call prepare(PrepareMode::Atomic) before with_transaction");
        f(tx).await
    }

    async fn mode(&self) -> PrepareMode {
        self.mode.lock().await.unwrap_or(PrepareMode::Staged)
    }

    async fn take_held_tx(&self) -> Option<A::Transaction> {
        self.held_tx.lock().await.take()
    }
}

/// One registered job type's processing logic.
#[async_trait]
pub trait JobTypeHandler<A: StateAdapter, N: NotifyAdapter, R: Registry>: Send + Sync + 'static {
    async fn handle(&self, ctx: &AttemptContext<A, N, R>) -> anyhow::Result<AttemptDecision>;
}

/// `next()` resumes the rest of the middleware chain, terminating in the handler.
pub type MiddlewareNext<'a> = Box<dyn FnOnce() -> BoxFuture<'a, anyhow::Result<AttemptDecision>> + Send + 'a>;

/// Wraps every attempt in onion order: the first middleware registered is
/// outermost (`spec.md` §4.6 "Middleware").
#[async_trait]
pub trait JobAttemptMiddleware<A: StateAdapter, N: NotifyAdapter, R: Registry>:
    Send + Sync + 'static
{
    async fn call(
        &self,
        ctx: &AttemptContext<A, N, R>,
        next: MiddlewareNext<'_>,
    ) -> anyhow::Result<AttemptDecision>;
}

fn run_chain<'a, A: StateAdapter, N: NotifyAdapter, R: Registry>(
    middlewares: &'a [Arc<dyn JobAttemptMiddleware<A, N, R>>],
    handler: &'a dyn JobTypeHandler<A, N, R>,
    ctx: &'a AttemptContext<A, N, R>,
) -> BoxFuture<'a, anyhow::Result<AttemptDecision>> {
    match middlewares.split_first() {
        None => Box::pin(handler.handle(ctx)),
        Some((first, rest)) => {
            let next: MiddlewareNext<'a> = Box::new(move || run_chain(rest, handler, ctx));
            Box::pin(first.call(ctx, next))
        }
    }
}

/// Worker construction and runtime options (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub max_slots: usize,
    pub poll_interval: Duration,
    pub default_lease: LeaseConfig,
    pub default_retry: RetryConfig,
    pub worker_loop_retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            max_slots: 4,
            poll_interval: Duration::from_secs(5),
            default_lease: LeaseConfig::default(),
            default_retry: RetryConfig::default(),
            worker_loop_retry: RetryConfig::default(),
        }
    }
}

/// Accumulates job type handlers and middlewares before `start()` spawns the loop.
pub struct WorkerBuilder<A: StateAdapter, N: NotifyAdapter, R: Registry> {
    engine: Engine<A, N, R>,
    handlers: HashMap<String, Arc<dyn JobTypeHandler<A, N, R>>>,
    middlewares: Vec<Arc<dyn JobAttemptMiddleware<A, N, R>>>,
}

impl<A: StateAdapter, N: NotifyAdapter, R: Registry> WorkerBuilder<A, N, R> {
    pub fn new(engine: Engine<A, N, R>) -> Self {
        Self {
            engine,
            handlers: HashMap::new(),
            middlewares: Vec::new(),
        }
    }

    pub fn implement_job_type<H>(mut self, type_name: impl Into<String>, handler: H) -> Self
    where
        H: JobTypeHandler<A, N, R>,
    {
        self.handlers.insert(type_name.into(), Arc::new(handler));
        self
    }

    pub fn with_middleware<M>(mut self, middleware: M) -> Self
    where
        M: JobAttemptMiddleware<A, N, R>,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn start(self, config: WorkerConfig) -> Worker {
        let type_names: Vec<String> = self.handlers.keys().cloned().collect();
        let (stop_tx, stop_rx) = watch::channel(false);
        let inflight = Arc::new(DashSet::<JobId>::new());

        let loop_state = LoopState {
            engine: self.engine,
            handlers: self.handlers,
            middlewares: self.middlewares,
            type_names,
            config,
            stop_rx,
            inflight,
        };

        let join = tokio::spawn(run_loop(loop_state));

        Worker {
            stop_tx,
            join: Some(join),
        }
    }
}

/// Handle returned by `WorkerBuilder::start`; `stop()` signals the loop to drain
/// in-flight attempts and return.
pub struct Worker {
    stop_tx: watch::Sender<bool>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl Worker {
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

struct LoopState<A: StateAdapter, N: NotifyAdapter, R: Registry> {
    engine: Engine<A, N, R>,
    handlers: HashMap<String, Arc<dyn JobTypeHandler<A, N, R>>>,
    middlewares: Vec<Arc<dyn JobAttemptMiddleware<A, N, R>>>,
    type_names: Vec<String>,
    config: WorkerConfig,
    stop_rx: watch::Receiver<bool>,
    inflight: Arc<DashSet<JobId>>,
}

#[instrument(skip(state), fields(worker_id = %state.config.worker_id))]
async fn run_loop<A: StateAdapter, N: NotifyAdapter, R: Registry>(mut state: LoopState<A, N, R>) {
    let semaphore = Arc::new(Semaphore::new(state.config.max_slots));
    let mut receiver = subscribe(&state).await;

    loop {
        if *state.stop_rx.borrow() {
            break;
        }

        reap_once(&state).await;

        if receiver.is_none() {
            receiver = subscribe(&state).await;
        }

        let wait = next_wait(&state).await;

        tokio::select! {
            _ = async {
                match receiver.as_mut() {
                    Some(receiver) => { let _ = receiver.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
            _ = tokio::time::sleep(wait) => {}
            _ = state.stop_rx.changed() => {}
        }

        if *state.stop_rx.borrow() {
            break;
        }

        acquire_and_dispatch(&state, &semaphore).await;
    }

    drain(&state).await;
}

/// Open a fresh `jobScheduled` subscription, falling back to `None` (pure polling)
/// if the adapter can't provide one right now. Called once before the loop starts
/// and again only when the held subscription is lost, not on every tick.
async fn subscribe<A: StateAdapter, N: NotifyAdapter, R: Registry>(
    state: &LoopState<A, N, R>,
) -> Option<NotifyReceiver> {
    match state
        .engine
        .notify_adapter()
        .subscribe_job_scheduled(&state.type_names)
        .await
    {
        Ok(receiver) => Some(receiver),
        Err(err) => {
            warn!(error = %err, "notify subscription failed; falling back to polling");
            None
        }
    }
}

async fn next_wait<A: StateAdapter, N: NotifyAdapter, R: Registry>(
    state: &LoopState<A, N, R>,
) -> Duration {
    let mut tx = match state.engine.state().begin().await {
        Ok(tx) => tx,
        Err(err) => {
            warn!(error = %err, "failed to open transaction for availability check");
            return jittered(state.config.poll_interval);
        }
    };
    let available = state
        .engine
        .state()
        .get_next_job_available_in_ms(&mut tx, &state.type_names)
        .await;
    let _ = state.engine.state().commit(tx).await;

    match available {
        Ok(Some(ms)) => jittered(Duration::from_millis(ms.max(0) as u64)),
        Ok(None) => jittered(state.config.poll_interval),
        Err(err) => {
            warn!(error = %err, "get_next_job_available_in_ms failed");
            let backoff_ms = state.config.worker_loop_retry.delay_ms(1).max(0) as u64;
            jittered(Duration::from_millis(backoff_ms))
        }
    }
}

async fn reap_once<A: StateAdapter, N: NotifyAdapter, R: Registry>(state: &LoopState<A, N, R>) {
    let ignored: Vec<JobId> = state.inflight.iter().map(|id| *id).collect();
    let mut tx = match state.engine.state().begin().await {
        Ok(tx) => tx,
        Err(err) => {
            warn!(error = %err, "reaper: failed to open transaction");
            return;
        }
    };
    match state
        .engine
        .state()
        .remove_expired_job_lease(&mut tx, &state.type_names, &ignored)
        .await
    {
        Ok(Some(job)) => {
            let _ = state.engine.state().commit(tx).await;
            info!(job_id = %job.id, type_name = %job.type_name, "reaped expired lease");
        }
        Ok(None) => {
            let _ = state.engine.state().commit(tx).await;
        }
        Err(err) => {
            let _ = state.engine.state().rollback(tx).await;
            warn!(error = %err, "reaper: remove_expired_job_lease failed");
        }
    }
}

async fn acquire_and_dispatch<A: StateAdapter, N: NotifyAdapter, R: Registry>(
    state: &LoopState<A, N, R>,
    semaphore: &Arc<Semaphore>,
) {
    loop {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let mut tx = match state.engine.state().begin().await {
            Ok(tx) => tx,
            Err(err) => {
                warn!(error = %err, "acquire: failed to open transaction");
                drop(permit);
                break;
            }
        };

        let acquired = state
            .engine
            .state()
            .acquire_job(&mut tx, &state.type_names)
            .await;

        let acquired = match acquired {
            Ok(acquired) => {
                let _ = state.engine.state().commit(tx).await;
                acquired
            }
            Err(err) => {
                let _ = state.engine.state().rollback(tx).await;
                error!(error = %err, "acquire_job failed");
                drop(permit);
                break;
            }
        };

        let Some(acquired) = acquired else {
            drop(permit);
            break;
        };

        let has_more = acquired.has_more;
        let job = acquired.job;
        let handler = state.handlers.get(&job.type_name).cloned();
        state.inflight.insert(job.id);

        let Some(handler) = handler else {
            warn!(job_id = %job.id, type_name = %job.type_name, "acquired job with no registered handler");
            state.inflight.remove(&job.id);
            drop(permit);
            if !has_more {
                break;
            }
            continue;
        };

        let engine = state.engine.clone();
        let middlewares = state.middlewares.clone();
        let worker_id = state.config.worker_id.clone();
        let lease = state.config.default_lease;
        let retry = state.config.default_retry;
        let inflight = state.inflight.clone();
        let dispatched_job_id = job.id;

        tokio::spawn(async move {
            let _permit = permit;
            run_attempt(engine, handler, middlewares, job, worker_id, lease, retry).await;
            inflight.remove(&dispatched_job_id);
        });

        if !has_more {
            break;
        }
    }
}

#[instrument(skip(engine, handler, middlewares), fields(job_id = %job.id, type_name = %job.type_name, attempt = job.attempt))]
async fn run_attempt<A: StateAdapter, N: NotifyAdapter, R: Registry>(
    engine: Engine<A, N, R>,
    handler: Arc<dyn JobTypeHandler<A, N, R>>,
    middlewares: Vec<Arc<dyn JobAttemptMiddleware<A, N, R>>>,
    job: Job,
    worker_id: String,
    lease: LeaseConfig,
    retry: RetryConfig,
) {
    let job_id = job.id;
    let type_name = job.type_name.clone();

    // Establish the lease the acquisition set the job running under.
    if let Err(err) = renew_once(engine.state().as_ref(), job_id, &worker_id, lease.lease_ms).await
    {
        warn!(error = %err, job_id = %job_id, "initial lease renewal failed");
        return;
    }

    let source = CancellationSource::new();
    let cancellation = source.token();

    let ticker_state = engine.clone();
    let ticker_worker_id = worker_id.clone();
    let ticker_job_id = job_id;
    let renew_interval = lease.renew_interval();
    let ticker_source = Arc::new(source);
    let ticker_source_for_task = ticker_source.clone();

    let ticker = tokio::spawn(async move {
        loop {
            tokio::time::sleep(renew_interval).await;
            match renew_once(
                ticker_state.state().as_ref(),
                ticker_job_id,
                &ticker_worker_id,
                lease.lease_ms,
            )
            .await
            {
                Ok(RenewOutcome::Renewed) => {}
                Ok(RenewOutcome::Lost(reason)) => {
                    ticker_source_for_task.cancel(reason);
                    if let Err(err) = ticker_state
                        .notify_adapter()
                        .publish_job_ownership_lost(ticker_job_id)
                        .await
                    {
                        warn!(error = %err, job_id = %ticker_job_id, "failed to publish ownership-lost notification");
                    }
                    break;
                }
                Err(err) => {
                    warn!(error = %err, job_id = %ticker_job_id, "lease renewal failed");
                }
            }
        }
    });

    let ctx = AttemptContext {
        engine: engine.clone(),
        job: job.clone(),
        worker_id: worker_id.clone(),
        cancellation: cancellation.clone(),
        mode: tokio::sync::Mutex::new(None),
        held_tx: tokio::sync::Mutex::new(None),
    };

    let mut cancel_watch = cancellation.clone();
    let decision = tokio::select! {
        result = run_chain(&middlewares, handler.as_ref(), &ctx) => Some(result),
        _ = cancel_watch.cancelled() => None,
    };

    ticker.abort();

    let reason = ctx.cancellation.reason();
    if let Some(reason) = reason {
        match reason {
            CancellationReason::TakenByAnotherWorker => {
                info!(job_id = %job_id, "attempt aborted: taken by another worker");
            }
            CancellationReason::AlreadyCompleted => {
                info!(job_id = %job_id, "attempt aborted: already completed");
            }
            CancellationReason::Stopped => {}
        }
        return;
    }

    let Some(decision) = decision else {
        return;
    };

    let mode = ctx.mode().await;
    let held_tx = ctx.take_held_tx().await;

    match decision {
        Ok(AttemptDecision::Completed { output }) => {
            finalize_attempt(&engine, mode, held_tx, job_id, &type_name, output, None, Some(&worker_id)).await;
        }
        Ok(AttemptDecision::Continued {
            output,
            continue_with,
        }) => {
            finalize_attempt(
                &engine,
                mode,
                held_tx,
                job_id,
                &type_name,
                output,
                Some(continue_with),
                Some(&worker_id),
            )
            .await;
        }
        Ok(AttemptDecision::Reschedule { schedule, reason }) => {
            reschedule_attempt(&engine, job_id, schedule, &reason).await;
        }
        Err(err) => {
            let schedule = Schedule::AfterMs(retry.delay_ms(job.attempt));
            warn!(job_id = %job_id, error = %err, "attempt failed, rescheduling with backoff");
            reschedule_attempt(&engine, job_id, schedule, &err.to_string()).await;
        }
    }
}

enum RenewOutcome {
    Renewed,
    Lost(CancellationReason),
}

async fn renew_once<A: StateAdapter>(
    state: &A,
    job_id: JobId,
    worker_id: &str,
    lease_ms: i64,
) -> Result<RenewOutcome> {
    let mut tx = state.begin().await?;
    let current = state.get_job_for_update(&mut tx, job_id).await?;

    let outcome = match current {
        None | Some(Job { status: JobStatus::Completed, .. }) => {
            RenewOutcome::Lost(CancellationReason::AlreadyCompleted)
        }
        Some(job)
            if job.leased_by.is_some() && job.leased_by.as_deref() != Some(worker_id) =>
        {
            RenewOutcome::Lost(CancellationReason::TakenByAnotherWorker)
        }
        Some(_) => {
            state.renew_job_lease(&mut tx, job_id, worker_id, lease_ms).await?;
            RenewOutcome::Renewed
        }
    };

    state.commit(tx).await?;
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn finalize_attempt<A: StateAdapter, N: NotifyAdapter, R: Registry>(
    engine: &Engine<A, N, R>,
    mode: PrepareMode,
    held_tx: Option<A::Transaction>,
    job_id: JobId,
    type_name: &str,
    output: serde_json::Value,
    continuation: Option<ContinueWith>,
    worker_id: Option<&str>,
) {
    let mut tx = match (mode, held_tx) {
        (PrepareMode::Atomic, Some(tx)) => tx,
        _ => match engine.state().begin().await {
            Ok(tx) => tx,
            Err(err) => {
                error!(job_id = %job_id, error = %err, "finalize: failed to open transaction");
                return;
            }
        },
    };

    match engine
        .finalize(&mut tx, None, job_id, type_name, output, continuation, worker_id)
        .await
    {
        Ok(_) => {
            if let Err(err) = engine.state().commit(tx).await {
                error!(job_id = %job_id, error = %err, "finalize: commit failed");
            }
        }
        Err(QueuertError::AlreadyCompleted(_)) | Err(QueuertError::TakenByAnotherWorker(_)) => {
            let _ = engine.state().rollback(tx).await;
            info!(job_id = %job_id, "finalize skipped: ownership lost");
        }
        Err(err) => {
            let _ = engine.state().rollback(tx).await;
            error!(job_id = %job_id, error = %err, "finalize failed");
        }
    }
}

async fn reschedule_attempt<A: StateAdapter, N: NotifyAdapter, R: Registry>(
    engine: &Engine<A, N, R>,
    job_id: JobId,
    schedule: Schedule,
    error_message: &str,
) {
    let mut tx = match engine.state().begin().await {
        Ok(tx) => tx,
        Err(err) => {
            error!(job_id = %job_id, error = %err, "reschedule: failed to open transaction");
            return;
        }
    };
    match engine
        .state()
        .reschedule_job(&mut tx, job_id, schedule, error_message)
        .await
    {
        Ok(_) => {
            if let Err(err) = engine.state().commit(tx).await {
                error!(job_id = %job_id, error = %err, "reschedule: commit failed");
            }
        }
        Err(err) => {
            let _ = engine.state().rollback(tx).await;
            error!(job_id = %job_id, error = %err, "reschedule_job failed");
        }
    }
}

async fn drain<A: StateAdapter, N: NotifyAdapter, R: Registry>(state: &LoopState<A, N, R>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !state.inflight.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
