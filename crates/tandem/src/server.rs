//! The server dispatch engine.
//!
//! A [`Server`] owns one channel. A single reader task parses inbound
//! records and dispatches their requests; handlers execute on worker tasks
//! bounded by a concurrency semaphore (acquiring a permit blocks the
//! dispatch loop, which is the engine's backpressure); a single writer task
//! owns the channel's send half and drains a queue of rendered frames, so
//! responses and pushes are serialized without a lock around the stream.
//!
//! Batch responses are collected into an ordinal-slot aggregator and emitted
//! as one record in request order once every call in the batch has resolved.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use tandem_channel::{is_closed, Channel};
use tandem_wire::{parse_inbound, Request, RequestId, Response, RpcError};

use crate::assign::Assigner;
use crate::context::Context;
use crate::metrics::Metrics;

/// Hook applied to each inbound request's context and params before the
/// handler runs, letting the server recover caller metadata (see
/// [`crate::jctx`]).
pub type DecodeContext =
    Arc<dyn Fn(Context, Option<Value>) -> Result<(Context, Option<Value>), RpcError> + Send + Sync>;

/// Server behaviour switches. The default is a strict, push-less server
/// with builtins enabled and one worker per CPU.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Tolerate requests missing the `"jsonrpc":"2.0"` marker.
    pub allow_v1: bool,
    /// Permit server-initiated notifications via [`Server::push`] and
    /// [`ServerContext::push`].
    pub allow_push: bool,
    /// Suppress the built-in `rpc.*` methods.
    pub disable_builtin: bool,
    /// Maximum simultaneously executing handlers; 0 uses the number of CPUs.
    pub concurrency: usize,
    /// Transform `(ctx, params)` for each inbound request.
    pub decode_context: Option<DecodeContext>,
    /// Record counters here instead of a per-server bag; shared across all
    /// servers constructed with the same value.
    pub metrics: Option<Arc<Metrics>>,
}

/// Errors reported by server operations and by [`Server::wait`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(String),
    #[error("server pushes are disabled")]
    PushDisabled,
    #[error("server is not running")]
    NotRunning,
    #[error("push params are not an object or array")]
    InvalidPush,
}

/// The payload answered by the built-in `rpc.serverInfo` method.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub methods: Vec<String>,
    pub counters: BTreeMap<String, i64>,
    pub uptime_sec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Running,
    Stopping,
    Done,
}

/// The per-request context handed to handlers: the request's cancellation
/// and deadline carrier plus the push hook.
#[derive(Clone)]
pub struct ServerContext {
    ctx: Context,
    push_tx: Option<mpsc::Sender<Vec<u8>>>,
    metrics: Arc<Metrics>,
}

impl ServerContext {
    /// The underlying deadline/metadata/cancellation carrier.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }

    /// Wait for this request to be cancelled (via `rpc.cancel` or server
    /// shutdown).
    pub async fn cancelled(&self) {
        self.ctx.cancelled().await
    }

    /// Emit a server-initiated notification to the peer. Fails unless the
    /// server was built with `allow_push`.
    pub async fn push(&self, method: &str, params: Option<Value>) -> Result<(), ServerError> {
        let Some(tx) = &self.push_tx else {
            return Err(ServerError::PushDisabled);
        };
        let frame = render_push(method, params)?;
        tx.send(frame).await.map_err(|_| ServerError::NotRunning)?;
        self.metrics.count("rpc.pushes", 1);
        Ok(())
    }

    /// A context wired to nothing, for exercising handlers in isolation.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            ctx: Context::new(),
            push_tx: None,
            metrics: Arc::new(Metrics::new()),
        }
    }
}

fn render_push(method: &str, params: Option<Value>) -> Result<Vec<u8>, ServerError> {
    if let Some(p) = &params {
        if !tandem_wire::request::params_are_structured(p) {
            return Err(ServerError::InvalidPush);
        }
    }
    let value = Request::notification(method, params).to_value();
    serde_json::to_vec(&value).map_err(|e| ServerError::Io(e.to_string()))
}

/// A JSON-RPC server bound to one channel.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    assigner: Arc<dyn Assigner>,
    allow_v1: bool,
    allow_push: bool,
    disable_builtin: bool,
    decode_context: Option<DecodeContext>,
    metrics: Arc<Metrics>,
    sem: Arc<Semaphore>,

    lifecycle: Mutex<Lifecycle>,
    inflight: Mutex<HashMap<RequestId, Context>>,
    out_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    fault: Mutex<Option<ServerError>>,
    started_at: Mutex<Option<Instant>>,

    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<Option<Result<(), ServerError>>>,
}

impl Server {
    /// Build a server dispatching through the given assigner. The server
    /// does nothing until [`start`](Server::start) hands it a channel.
    pub fn new(assigner: impl Assigner + 'static, opts: ServerOptions) -> Self {
        let concurrency = if opts.concurrency == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            opts.concurrency
        };
        let (stop_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(ServerInner {
                assigner: Arc::new(assigner),
                allow_v1: opts.allow_v1,
                allow_push: opts.allow_push,
                disable_builtin: opts.disable_builtin,
                decode_context: opts.decode_context,
                metrics: opts.metrics.unwrap_or_default(),
                sem: Arc::new(Semaphore::new(concurrency)),
                lifecycle: Mutex::new(Lifecycle::New),
                inflight: Mutex::new(HashMap::new()),
                out_tx: Mutex::new(None),
                writer: Mutex::new(None),
                fault: Mutex::new(None),
                started_at: Mutex::new(None),
                stop_tx,
                done_tx,
            }),
        }
    }

    /// Begin serving the channel. Non-blocking: spawns the reader/dispatch
    /// task and the writer task and returns immediately.
    pub fn start(&self, channel: Channel) -> &Self {
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            if *lifecycle != Lifecycle::New {
                warn!(target: "tandem::server", "start called on a server that already ran");
                return self;
            }
            *lifecycle = Lifecycle::Running;
        }
        *self.inner.started_at.lock().unwrap() = Some(Instant::now());

        let (tx_half, rx_half) = channel.split();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
        *self.inner.out_tx.lock().unwrap() = Some(out_tx);

        // Subscribe before the tasks start so no stop signal can be missed.
        let stop_rx = self.inner.stop_tx.subscribe();

        let writer = tokio::spawn(write_loop(out_rx, tx_half, Arc::clone(&self.inner)));
        *self.inner.writer.lock().unwrap() = Some(writer);

        tokio::spawn(run_loop(Arc::clone(&self.inner), rx_half, stop_rx));
        self
    }

    /// Close the channel and wait for the engine to wind down. In-flight
    /// handlers are cancelled and drained first.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            match *lifecycle {
                Lifecycle::New => {
                    *lifecycle = Lifecycle::Done;
                    let _ = self.inner.done_tx.send(Some(Ok(())));
                    return;
                }
                Lifecycle::Done => return,
                _ => {}
            }
        }
        let _ = self.inner.stop_tx.send(true);
        let _ = self.wait().await;
    }

    /// Block until the run loop exits and report its terminating error.
    /// Peer EOF and an explicit [`stop`](Server::stop) are clean exits.
    pub async fn wait(&self) -> Result<(), ServerError> {
        let mut done_rx = self.inner.done_tx.subscribe();
        loop {
            if let Some(result) = done_rx.borrow_and_update().clone() {
                return result;
            }
            if done_rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Emit a server-initiated notification to the peer. Fails unless the
    /// server was built with `allow_push` and is currently running.
    pub async fn push(&self, method: &str, params: Option<Value>) -> Result<(), ServerError> {
        if !self.inner.allow_push {
            return Err(ServerError::PushDisabled);
        }
        let tx = self
            .inner
            .out_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(ServerError::NotRunning)?;
        let frame = render_push(method, params)?;
        tx.send(frame).await.map_err(|_| ServerError::NotRunning)?;
        self.inner.metrics.count("rpc.pushes", 1);
        Ok(())
    }

    /// The metrics bag this server records into.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }
}

async fn write_loop(
    mut queue: mpsc::Receiver<Vec<u8>>,
    mut tx: Box<dyn tandem_channel::Sender>,
    inner: Arc<ServerInner>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(err) = tx.send(&frame).await {
            if !is_closed(&err) {
                warn!(target: "tandem::server", error = %err, "write failed, shutting down");
                *inner.fault.lock().unwrap() = Some(ServerError::Io(err.to_string()));
            }
            let _ = inner.stop_tx.send(true);
            break;
        }
    }
    let _ = tx.close().await;
}

async fn run_loop(
    inner: Arc<ServerInner>,
    mut rx: Box<dyn tandem_channel::Receiver>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut workers = JoinSet::new();

    let mut result = loop {
        let record = tokio::select! {
            _ = stop_rx.changed() => break Ok(()),
            record = rx.recv() => record,
        };
        match record {
            Ok(Some(record)) => {
                if dispatch_record(&inner, record, &mut workers, &mut stop_rx)
                    .await
                    .is_err()
                {
                    break Ok(()); // stop requested mid-dispatch
                }
            }
            Ok(None) => break Ok(()),
            Err(err) if is_closed(&err) => break Ok(()),
            Err(err) => break Err(ServerError::Io(err.to_string())),
        }
    };

    *inner.lifecycle.lock().unwrap() = Lifecycle::Stopping;
    drop(rx);

    // Cancel whatever is still running, then let every worker finish so no
    // handler outlives wait().
    for ctx in inner.inflight.lock().unwrap().values() {
        ctx.cancel();
    }
    while workers.join_next().await.is_some() {}
    inner.inflight.lock().unwrap().clear();

    // Closing the queue lets the writer flush the tail and shut the stream.
    drop(inner.out_tx.lock().unwrap().take());
    let writer = inner.writer.lock().unwrap().take();
    if let Some(writer) = writer {
        let _ = writer.await;
    }

    if let Some(fault) = inner.fault.lock().unwrap().take() {
        result = Err(fault);
    }
    *inner.lifecycle.lock().unwrap() = Lifecycle::Done;
    let _ = inner.done_tx.send(Some(result));
}

/// Dispatch every request in one inbound record. Reports `Err(())` only if
/// a stop was requested while waiting for worker capacity.
async fn dispatch_record(
    inner: &Arc<ServerInner>,
    record: Vec<u8>,
    workers: &mut JoinSet<()>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<(), ()> {
    let inbound = match parse_inbound(&record, inner.allow_v1) {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!(target: "tandem::server", error = %err, "rejecting unparseable record");
            inner.metrics.count("rpc.errors", 1);
            inner
                .send_frame(Response::error(None, err.to_rpc_error()).to_value())
                .await;
            return Ok(());
        }
    };

    let out_tx = inner.out_tx.lock().unwrap().clone();
    let Some(out_tx) = out_tx else {
        return Err(()); // already tearing down
    };
    let agg = Aggregator::new(inbound.reply_count(), inbound.batch, out_tx);

    let mut slot = 0;
    for item in inbound.items {
        match item {
            Err(err) => {
                inner.metrics.count("rpc.errors", 1);
                agg.fill(slot, Response::error(None, err).to_value()).await;
                slot += 1;
            }
            Ok(req) if req.is_notification() => {
                dispatch_notification(inner, req, workers, stop_rx).await?;
            }
            Ok(req) => {
                dispatch_call(inner, req, slot, agg.clone(), workers, stop_rx).await?;
                slot += 1;
            }
        }
    }
    Ok(())
}

async fn dispatch_notification(
    inner: &Arc<ServerInner>,
    req: Request,
    workers: &mut JoinSet<()>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<(), ()> {
    inner.metrics.count("rpc.notifications", 1);

    // User dispatch first; builtins only when it declines.
    let Some(handler) = inner.assigner.assign(&req.method) else {
        if !inner.disable_builtin && req.method == "rpc.cancel" {
            inner.handle_cancel(&req);
        } else {
            debug!(target: "tandem::server", method = %req.method, "dropping notification for unknown method");
        }
        return Ok(());
    };

    let permit = acquire_or_stop(inner, stop_rx).await?;
    let sctx = inner.server_context(Context::new());
    let method = req.method.clone();
    workers.spawn(async move {
        let _permit = permit;
        let outcome = AssertUnwindSafe(handler.handle(sctx, req)).catch_unwind().await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                debug!(target: "tandem::server", %method, error = %err, "notification handler failed")
            }
            Err(panic) => {
                warn!(target: "tandem::server", %method, panic = %panic_message(panic), "notification handler panicked")
            }
        }
    });
    Ok(())
}

async fn dispatch_call(
    inner: &Arc<ServerInner>,
    mut req: Request,
    slot: usize,
    agg: Aggregator,
    workers: &mut JoinSet<()>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<(), ()> {
    let Some(id) = req.id.clone() else {
        return Ok(());
    };
    inner.metrics.count("rpc.requests", 1);

    // User dispatch first; builtins only when it declines.
    let handler = match inner.assigner.assign(&req.method) {
        Some(handler) => handler,
        None => {
            if !inner.disable_builtin && req.method == "rpc.serverInfo" {
                let info = inner.server_info();
                let value = serde_json::to_value(info).unwrap_or(Value::Null);
                agg.fill(slot, Response::success(id, value).to_value()).await;
                return Ok(());
            }
            debug!(target: "tandem::server", method = %req.method, %id, "method not found");
            inner.metrics.count("rpc.errors", 1);
            agg.fill(
                slot,
                Response::error(Some(id), RpcError::method_not_found()).to_value(),
            )
            .await;
            return Ok(());
        }
    };

    let mut ctx = Context::new();
    if let Some(hook) = &inner.decode_context {
        match hook(ctx.clone(), req.params.take()) {
            Ok((decoded_ctx, params)) => {
                ctx = decoded_ctx;
                req.params = params;
            }
            Err(err) => {
                debug!(target: "tandem::server", %id, error = %err, "context decode failed");
                inner.metrics.count("rpc.errors", 1);
                agg.fill(slot, Response::error(Some(id), err).to_value()).await;
                return Ok(());
            }
        }
    }

    if inner
        .inflight
        .lock()
        .unwrap()
        .insert(id.clone(), ctx.clone())
        .is_some()
    {
        warn!(target: "tandem::server", %id, "replacing duplicate inflight id");
    }

    let permit = acquire_or_stop(inner, stop_rx).await?;
    let sctx = inner.server_context(ctx);
    let inner = Arc::clone(inner);
    workers.spawn(async move {
        let _permit = permit;
        let outcome = AssertUnwindSafe(handler.handle(sctx, req)).catch_unwind().await;
        let response = match outcome {
            Ok(Ok(value)) => Response::success(id.clone(), value),
            Ok(Err(err)) => {
                inner.metrics.count("rpc.errors", 1);
                Response::error(Some(id.clone()), err)
            }
            Err(panic) => {
                let message = panic_message(panic);
                warn!(target: "tandem::server", %id, panic = %message, "handler panicked");
                inner.metrics.count("rpc.errors", 1);
                Response::error(
                    Some(id.clone()),
                    RpcError::internal_error("internal error").with_data(Value::String(message)),
                )
            }
        };
        inner.inflight.lock().unwrap().remove(&id);
        agg.fill(slot, response.to_value()).await;
    });
    Ok(())
}

/// Acquire one worker permit, yielding to a stop request. This is where the
/// dispatch loop exerts backpressure on the peer.
async fn acquire_or_stop(
    inner: &Arc<ServerInner>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<tokio::sync::OwnedSemaphorePermit, ()> {
    tokio::select! {
        permit = Arc::clone(&inner.sem).acquire_owned() => permit.map_err(|_| ()),
        _ = stop_rx.changed() => Err(()),
    }
}

impl ServerInner {
    fn server_context(&self, ctx: Context) -> ServerContext {
        ServerContext {
            ctx,
            push_tx: if self.allow_push {
                self.out_tx.lock().unwrap().clone()
            } else {
                None
            },
            metrics: Arc::clone(&self.metrics),
        }
    }

    fn server_info(&self) -> ServerInfo {
        let uptime = self
            .started_at
            .lock()
            .unwrap()
            .map_or(0, |at| at.elapsed().as_secs());
        ServerInfo {
            methods: self.assigner.names(),
            counters: self.metrics.snapshot(),
            uptime_sec: uptime,
        }
    }

    /// `rpc.cancel`: signal every named inflight request. No reply.
    fn handle_cancel(&self, req: &Request) {
        let ids: Vec<RequestId> = match req.decode_params() {
            Ok(ids) => ids,
            Err(err) => {
                debug!(target: "tandem::server", error = %err, "malformed rpc.cancel params");
                return;
            }
        };
        let inflight = self.inflight.lock().unwrap();
        for id in ids {
            match inflight.get(&id) {
                Some(ctx) => {
                    debug!(target: "tandem::server", %id, "cancelling inflight request");
                    self.metrics.count("rpc.cancellations", 1);
                    ctx.cancel();
                }
                None => {
                    debug!(target: "tandem::server", %id, "rpc.cancel for unknown id")
                }
            }
        }
    }

    async fn send_frame(&self, value: Value) {
        let tx = self.out_tx.lock().unwrap().clone();
        let Some(tx) = tx else { return };
        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                let _ = tx.send(bytes).await;
            }
            Err(err) => warn!(target: "tandem::server", error = %err, "failed to render frame"),
        }
    }
}

/// Collects the responses of one inbound record into request-ordered slots
/// and emits them as a single frame once the last slot fills. A record whose
/// members are all notifications has zero slots and emits nothing.
#[derive(Clone)]
struct Aggregator {
    shared: Arc<AggregatorShared>,
}

struct AggregatorShared {
    state: Mutex<AggregatorState>,
    batch: bool,
    out_tx: mpsc::Sender<Vec<u8>>,
}

struct AggregatorState {
    slots: Vec<Option<Value>>,
    remaining: usize,
}

impl Aggregator {
    fn new(count: usize, batch: bool, out_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            shared: Arc::new(AggregatorShared {
                state: Mutex::new(AggregatorState {
                    slots: vec![None; count],
                    remaining: count,
                }),
                batch,
                out_tx,
            }),
        }
    }

    async fn fill(&self, slot: usize, value: Value) {
        let payload = {
            let mut state = self.shared.state.lock().unwrap();
            debug_assert!(state.slots[slot].is_none(), "slot filled twice");
            state.slots[slot] = Some(value);
            state.remaining -= 1;
            if state.remaining > 0 {
                return;
            }
            let values: Vec<Value> = state
                .slots
                .drain(..)
                .map(|v| v.unwrap_or(Value::Null))
                .collect();
            if self.shared.batch {
                Value::Array(values)
            } else {
                values.into_iter().next().unwrap_or(Value::Null)
            }
        };
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                // A send failure means the engine is tearing down; the frame
                // has nowhere to go.
                let _ = self.shared.out_tx.send(bytes).await;
            }
            Err(err) => warn!(target: "tandem::server", error = %err, "failed to render batch"),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + std::marker::Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
