//! Tool-call dispatch.
//!
//! Every call in an inbound batch is answered exactly once: by its handler's
//! result, by a failure payload when the handler errors, panics, misses its
//! time budget or does not exist, or by a schema-violation failure when the
//! arguments do not match the tool's declaration. Responses that are ready
//! within the debounce window go out together; stragglers follow one by one.

use crate::config::DispatcherConfig;
use crate::error::{LiveError, Result};
use crate::events::{EventKind, SessionEvent, SubscriptionId};
use crate::protocol::{ToolCall, ToolCallBatch, ToolResponse};
use crate::session::{ConnectionState, SessionClient, WeakSessionClient};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Handler for tool calls from the remote peer.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute a tool call and return the result.
    async fn execute(&self, call: &ToolCall) -> Result<Value>;
}

/// A simple function-based tool handler.
pub struct FnToolHandler<F>
where
    F: Fn(&ToolCall) -> Result<Value> + Send + Sync,
{
    handler: F,
}

impl<F> FnToolHandler<F>
where
    F: Fn(&ToolCall) -> Result<Value> + Send + Sync,
{
    /// Create a new function-based tool handler.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> ToolHandler for FnToolHandler<F>
where
    F: Fn(&ToolCall) -> Result<Value> + Send + Sync,
{
    async fn execute(&self, call: &ToolCall) -> Result<Value> {
        (self.handler)(call)
    }
}

/// Async function-based tool handler.
pub struct AsyncToolHandler<F, Fut>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    handler: F,
}

impl<F, Fut> AsyncToolHandler<F, Fut>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    /// Create a new async tool handler.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for AsyncToolHandler<F, Fut>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    async fn execute(&self, call: &ToolCall) -> Result<Value> {
        (self.handler)(call.clone()).await
    }
}

/// Routes the session's tool calls to registered handlers.
pub struct ToolCallDispatcher {
    shared: Arc<DispatchShared>,
    subscriptions: Vec<SubscriptionId>,
}

struct DispatchShared {
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
    session: WeakSessionClient,
    config: DispatcherConfig,
    /// Cancelled and replaced whenever the session leaves `Connected`.
    epoch: Mutex<CancellationToken>,
}

/// Aborts a spawned handler when its result is no longer wanted.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ToolCallDispatcher {
    /// Create a dispatcher answering `session`'s tool calls.
    pub fn new(session: &SessionClient, config: DispatcherConfig) -> Self {
        let shared = Arc::new(DispatchShared {
            handlers: RwLock::new(HashMap::new()),
            session: session.downgrade(),
            config,
            epoch: Mutex::new(CancellationToken::new()),
        });

        let on_call = {
            let shared = shared.clone();
            session.on(EventKind::ToolCall, move |event| {
                let SessionEvent::ToolCall(batch) = event else {
                    return;
                };
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        // bound to the session the batch arrived in
                        let epoch = shared.epoch.lock().clone();
                        runtime.spawn(shared.clone().dispatch(batch.clone(), epoch));
                    }
                    Err(_) => tracing::error!(
                        ids = ?batch.ids(),
                        "Tool call batch arrived outside a Tokio runtime; cannot dispatch"
                    ),
                }
            })
        };
        let on_state = {
            let shared = shared.clone();
            session.on(EventKind::StateChanged, move |event| {
                if let SessionEvent::StateChanged { from: ConnectionState::Connected, .. } = event {
                    let previous = std::mem::replace(&mut *shared.epoch.lock(), CancellationToken::new());
                    previous.cancel();
                }
            })
        };

        Self { shared, subscriptions: vec![on_call, on_state] }
    }

    /// Bind `name` to `handler`, replacing any previous binding.
    pub fn register(&self, name: impl Into<String>, handler: impl ToolHandler + 'static) {
        let name = name.into();
        if self.shared.handlers.write().insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(tool = %name, "Replaced tool handler");
        }
    }

    /// Bind `name` to a synchronous function.
    pub fn register_fn<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&ToolCall) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, FnToolHandler::new(handler));
    }

    /// Remove a binding. Returns `false` if `name` was not bound.
    pub fn unregister(&self, name: &str) -> bool {
        self.shared.handlers.write().remove(name).is_some()
    }

    /// Whether `name` has a handler.
    pub fn has_handler(&self, name: &str) -> bool {
        self.shared.handlers.read().contains_key(name)
    }

    /// Answer every call in `batch`. Returns once all responses were handed to
    /// the session or the session left `Connected`.
    pub async fn dispatch(&self, batch: ToolCallBatch) {
        let epoch = self.shared.epoch.lock().clone();
        self.shared.clone().dispatch(batch, epoch).await;
    }
}

impl Drop for ToolCallDispatcher {
    fn drop(&mut self) {
        self.shared.epoch.lock().cancel();
        if let Some(session) = self.shared.session.upgrade() {
            for id in &self.subscriptions {
                session.off(*id);
            }
        }
    }
}

impl std::fmt::Debug for ToolCallDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tools: Vec<String> = self.shared.handlers.read().keys().cloned().collect();
        tools.sort_unstable();
        f.debug_struct("ToolCallDispatcher").field("tools", &tools).field("config", &self.shared.config).finish()
    }
}

impl DispatchShared {
    async fn dispatch(self: Arc<Self>, batch: ToolCallBatch, epoch: CancellationToken) {
        if batch.is_empty() {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let catalog = session.tool_catalog();
        let budget = self.config.handler_timeout();

        let mut ready = Vec::with_capacity(batch.len());
        let mut pending = FuturesUnordered::new();
        for call in batch.calls {
            if let Some(catalog) = &catalog {
                if let Err(error) = catalog.validate(&call) {
                    self.report(&session, &error);
                    ready.push(ToolResponse::failure(&call, error.to_string()));
                    continue;
                }
            }
            let handler = self.handlers.read().get(&call.name).cloned();
            match handler {
                Some(handler) => pending.push(run_handler(handler, call, budget)),
                None => {
                    tracing::warn!(tool = %call.name, call_id = %call.id, "No handler registered for tool");
                    let reason = format!("no handler registered for tool '{}'", call.name);
                    ready.push(ToolResponse::failure(&call, reason));
                }
            }
        }

        let window = tokio::time::sleep(self.config.debounce());
        tokio::pin!(window);
        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = epoch.cancelled() => return,
                _ = &mut window => break,
                Some((response, error)) = pending.next() => {
                    if let Some(error) = error {
                        self.report(&session, &error);
                    }
                    ready.push(response);
                }
            }
        }
        self.flush(&session, ready).await;

        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = epoch.cancelled() => return,
                Some((response, error)) = pending.next() => {
                    if let Some(error) = error {
                        self.report(&session, &error);
                    }
                    tracing::debug!(call_id = %response.id, "Sending late tool response");
                    self.flush(&session, vec![response]).await;
                }
            }
        }
    }

    async fn flush(&self, session: &SessionClient, responses: Vec<ToolResponse>) {
        if responses.is_empty() {
            return;
        }
        let count = responses.len();
        match session.send_tool_response(responses).await {
            Ok(()) => tracing::debug!(count, "Flushed tool responses"),
            Err(error) => tracing::warn!(error = %error, count, "Could not deliver tool responses"),
        }
    }

    fn report(&self, session: &SessionClient, error: &LiveError) {
        tracing::warn!(error = %error, "Tool call failed");
        session.publish(SessionEvent::from_error(error));
    }
}

/// Run one handler on its own task under `budget`, always yielding a response.
async fn run_handler(
    handler: Arc<dyn ToolHandler>,
    call: ToolCall,
    budget: std::time::Duration,
) -> (ToolResponse, Option<LiveError>) {
    let task = {
        let call = call.clone();
        tokio::spawn(async move { handler.execute(&call).await })
    };
    let _guard = AbortOnDrop(task.abort_handle());

    match tokio::time::timeout(budget, task).await {
        Ok(Ok(Ok(output))) => (ToolResponse::success(&call, output), None),
        Ok(Ok(Err(error))) => (ToolResponse::failure(&call, error.to_string()), Some(error)),
        Ok(Err(join_error)) => {
            let error = LiveError::tool(format!("handler for '{}' panicked: {}", call.name, join_error));
            (ToolResponse::failure(&call, error.to_string()), Some(error))
        }
        Err(_) => {
            let error = LiveError::ToolTimeout { name: call.name.clone(), timeout_ms: budget.as_millis() as u64 };
            (ToolResponse::failure(&call, error.to_string()), Some(error))
        }
    }
}
