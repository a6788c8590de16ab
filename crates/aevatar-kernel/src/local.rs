//! In-process host: one mailbox task per agent.
//!
//! Each agent lives inside its own tokio task and only ever sees one command
//! at a time, which is what keeps `GAgent`'s `&mut self` handling sound across
//! tasks. Hops between agents go through [`LocalTransport`], which returns as
//! soon as the target mailbox has accepted the envelope.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use aevatar_events::EventStreamHub;
use aevatar_protocol::{
    AgentEvent, AgentId, Direction, EventEnvelope, EventId, EventLogStore, KernelError,
    KernelObserver, KernelResult, StateStore, Transport,
};
use aevatar_runtime::{AgentBehavior, GAgent, MetricsSnapshot, RuntimeConfig, TypeRegistry};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

type Job<A> = Box<dyn for<'a> FnOnce(&'a mut GAgent<A>) -> BoxFuture<'a, ()> + Send>;

fn job<A, F>(run: F) -> Job<A>
where
    A: AgentBehavior,
    F: for<'a> FnOnce(&'a mut GAgent<A>) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(run)
}

enum Command<A: AgentBehavior> {
    Deliver(EventEnvelope),
    Run(Job<A>),
    Stop(oneshot::Sender<KernelResult<()>>),
}

/// Counts queued and running commands so callers can wait for quiescence.
#[derive(Debug, Default)]
struct Activity {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Activity {
    fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

trait Mailbox: Send + Sync {
    fn deliver(&self, envelope: EventEnvelope) -> KernelResult<()>;
    fn stop(&self) -> Option<oneshot::Receiver<KernelResult<()>>>;
}

struct AgentMailbox<A: AgentBehavior> {
    id: AgentId,
    tx: mpsc::UnboundedSender<Command<A>>,
    activity: Arc<Activity>,
}

impl<A: AgentBehavior> Mailbox for AgentMailbox<A> {
    fn deliver(&self, envelope: EventEnvelope) -> KernelResult<()> {
        self.activity.begin();
        if self.tx.send(Command::Deliver(envelope)).is_err() {
            self.activity.finish();
            return Err(KernelError::Transport(format!(
                "mailbox of agent {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn stop(&self) -> Option<oneshot::Receiver<KernelResult<()>>> {
        let (reply, receiver) = oneshot::channel();
        self.tx.send(Command::Stop(reply)).ok()?;
        Some(receiver)
    }
}

pub(crate) struct RuntimeInner {
    mailboxes: RwLock<HashMap<AgentId, Arc<dyn Mailbox>>>,
    activity: Arc<Activity>,
    config: RuntimeConfig,
    state_store: Option<Arc<dyn StateStore>>,
    event_log: Option<Arc<dyn EventLogStore>>,
    registry: Arc<TypeRegistry>,
    hub: EventStreamHub,
    cancel: CancellationToken,
}

impl RuntimeInner {
    fn deliver(&self, target: &AgentId, envelope: EventEnvelope) -> KernelResult<()> {
        let mailbox = self
            .mailboxes
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| KernelError::UnknownAgent(target.to_string()))?;
        mailbox.deliver(envelope)
    }
}

/// Transport between agents of one [`LocalRuntime`].
#[derive(Clone)]
pub struct LocalTransport {
    inner: Weak<RuntimeInner>,
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("live", &(self.inner.strong_count() > 0))
            .finish()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn deliver_to_agent(
        &self,
        target: &AgentId,
        envelope: EventEnvelope,
    ) -> KernelResult<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| KernelError::Transport("local runtime has shut down".to_owned()))?;
        inner.deliver(target, envelope)
    }
}

async fn run_mailbox<A: AgentBehavior>(
    mut agent: GAgent<A>,
    mut rx: mpsc::UnboundedReceiver<Command<A>>,
    activity: Arc<Activity>,
    runtime: Weak<RuntimeInner>,
    cancel: CancellationToken,
) {
    let id = agent.id().clone();
    while let Some(command) = rx.recv().await {
        match command {
            Command::Deliver(envelope) => {
                if let Err(error) = agent.handle_incoming(envelope, &cancel).await {
                    warn!(agent_id = %id, error = %error, "envelope handling failed");
                }
                activity.finish();
            }
            Command::Run(run) => {
                run(&mut agent).await;
                activity.finish();
            }
            Command::Stop(reply) => {
                if let Some(runtime) = runtime.upgrade() {
                    runtime.mailboxes.write().remove(&id);
                }
                let _ = reply.send(agent.deactivate(&cancel).await);
                break;
            }
        }
    }

    rx.close();
    while let Ok(command) = rx.try_recv() {
        match command {
            Command::Deliver(_) | Command::Run(_) => activity.finish(),
            Command::Stop(reply) => {
                let _ = reply.send(Ok(()));
            }
        }
    }
    debug!(agent_id = %id, "mailbox closed");
}

/// Owner-side handle to one running agent.
pub struct AgentHandle<A: AgentBehavior> {
    id: AgentId,
    tx: mpsc::UnboundedSender<Command<A>>,
    activity: Arc<Activity>,
    cancel: CancellationToken,
}

impl<A: AgentBehavior> Clone for AgentHandle<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            tx: self.tx.clone(),
            activity: Arc::clone(&self.activity),
            cancel: self.cancel.clone(),
        }
    }
}

impl<A: AgentBehavior> fmt::Debug for AgentHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("agent_type", &A::agent_type())
            .finish()
    }
}

impl<A: AgentBehavior> AgentHandle<A> {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    fn not_running(&self) -> KernelError {
        KernelError::Transport(format!("agent {} is not running", self.id))
    }

    /// Runs `f` inside the agent's task, in mailbox order, and returns its result.
    pub async fn with_agent<R, F>(&self, f: F) -> KernelResult<R>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut GAgent<A>) -> BoxFuture<'a, R> + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let run = job::<A, _>(move |agent| {
            Box::pin(async move {
                let _ = reply.send(f(agent).await);
            })
        });
        self.activity.begin();
        if self.tx.send(Command::Run(run)).is_err() {
            self.activity.finish();
            return Err(self.not_running());
        }
        receiver.await.map_err(|_| self.not_running())
    }

    pub async fn publish<E: AgentEvent>(
        &self,
        event: E,
        direction: Direction,
    ) -> KernelResult<EventId> {
        let cancel = self.cancel.clone();
        self.with_agent(move |agent| {
            Box::pin(async move { agent.publish(&event, direction, &cancel).await })
        })
        .await?
    }

    pub async fn state(&self) -> KernelResult<A::State> {
        self.with_agent(|agent| Box::pin(async move { agent.state().clone() }))
            .await
    }

    pub async fn version(&self) -> KernelResult<u64> {
        self.with_agent(|agent| Box::pin(async move { agent.version() }))
            .await
    }

    pub async fn metrics(&self) -> KernelResult<MetricsSnapshot> {
        self.with_agent(|agent| Box::pin(async move { agent.metrics() }))
            .await
    }

    pub async fn children(&self) -> KernelResult<Vec<AgentId>> {
        self.with_agent(|agent| Box::pin(async move { agent.children() }))
            .await
    }

    pub async fn add_child(&self, child: AgentId) -> KernelResult<bool> {
        let cancel = self.cancel.clone();
        self.with_agent(move |agent| Box::pin(async move { agent.add_child(child, &cancel).await }))
            .await?
    }

    pub async fn remove_child(&self, child: AgentId) -> KernelResult<bool> {
        let cancel = self.cancel.clone();
        self.with_agent(move |agent| {
            Box::pin(async move { agent.remove_child(&child, &cancel).await })
        })
        .await?
    }

    pub async fn set_parent(&self, parent: AgentId) -> KernelResult<Option<AgentId>> {
        let cancel = self.cancel.clone();
        self.with_agent(move |agent| {
            Box::pin(async move { agent.set_parent(parent, &cancel).await })
        })
        .await?
    }

    pub async fn clear_parent(&self) -> KernelResult<Option<AgentId>> {
        let cancel = self.cancel.clone();
        self.with_agent(move |agent| Box::pin(async move { agent.clear_parent(&cancel).await }))
            .await?
    }

    /// Deactivates the agent after everything already queued for it.
    pub async fn stop(&self) -> KernelResult<()> {
        let (reply, receiver) = oneshot::channel();
        self.tx
            .send(Command::Stop(reply))
            .map_err(|_| self.not_running())?;
        receiver.await.map_err(|_| self.not_running())?
    }
}

/// A set of agents wired together by an in-process transport.
#[derive(Clone)]
pub struct LocalRuntime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("agents", &self.inner.mailboxes.read().len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl LocalRuntime {
    pub(crate) fn new(
        config: RuntimeConfig,
        state_store: Option<Arc<dyn StateStore>>,
        event_log: Option<Arc<dyn EventLogStore>>,
        registry: Arc<TypeRegistry>,
        hub: EventStreamHub,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                mailboxes: RwLock::new(HashMap::new()),
                activity: Arc::new(Activity::default()),
                config,
                state_store,
                event_log,
                registry,
                hub,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn transport(&self) -> LocalTransport {
        LocalTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Builds, activates and starts an agent. Ids are unique per runtime.
    #[instrument(skip(self, id, behavior), fields(agent_type = A::agent_type()))]
    pub async fn spawn<A: AgentBehavior>(
        &self,
        id: impl Into<AgentId>,
        behavior: A,
    ) -> KernelResult<AgentHandle<A>> {
        let id = id.into();
        if self.is_running(&id) {
            return Err(already_running(&id));
        }
        let mut builder = GAgent::builder(
            id.clone(),
            behavior,
            Arc::new(self.transport()) as Arc<dyn Transport>,
        )
        .runtime_config(self.inner.config.clone())
        .registry(Arc::clone(&self.inner.registry))
        .observer(Arc::new(self.inner.hub.clone()) as Arc<dyn KernelObserver>);
        if let Some(store) = &self.inner.state_store {
            builder = builder.state_store(Arc::clone(store));
        }
        if let Some(log) = &self.inner.event_log {
            builder = builder.event_log(Arc::clone(log));
        }
        let mut agent = builder.build();
        let cancel = self.inner.cancel.child_token();
        agent.activate(&cancel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mailbox = AgentMailbox {
            id: id.clone(),
            tx: tx.clone(),
            activity: Arc::clone(&self.inner.activity),
        };
        {
            let mut mailboxes = self.inner.mailboxes.write();
            if mailboxes.contains_key(&id) {
                return Err(already_running(&id));
            }
            mailboxes.insert(id.clone(), Arc::new(mailbox) as Arc<dyn Mailbox>);
        }
        tokio::spawn(run_mailbox(
            agent,
            rx,
            Arc::clone(&self.inner.activity),
            Arc::downgrade(&self.inner),
            cancel.clone(),
        ));
        info!(agent_id = %id, "agent spawned");
        Ok(AgentHandle {
            id,
            tx,
            activity: Arc::clone(&self.inner.activity),
            cancel,
        })
    }

    /// Records `child` under `parent` on both sides.
    pub async fn link<P: AgentBehavior, C: AgentBehavior>(
        &self,
        parent: &AgentHandle<P>,
        child: &AgentHandle<C>,
    ) -> KernelResult<()> {
        parent.add_child(child.id().clone()).await?;
        child.set_parent(parent.id().clone()).await?;
        debug!(parent = %parent.id(), child = %child.id(), "agents linked");
        Ok(())
    }

    /// Injects an envelope from outside the hierarchy.
    pub fn deliver(&self, target: &AgentId, envelope: EventEnvelope) -> KernelResult<()> {
        self.inner.deliver(target, envelope)
    }

    /// Resolves once every queued envelope and job has been handled.
    pub async fn wait_idle(&self) {
        self.inner.activity.wait_idle().await;
    }

    pub fn is_running(&self, id: &AgentId) -> bool {
        self.inner.mailboxes.read().contains_key(id)
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.inner.mailboxes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.hub.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<EventEnvelope> {
        self.inner.hub.subscribe_stream()
    }

    /// Stops every agent, then cancels whatever is still in flight.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> KernelResult<()> {
        let mailboxes: Vec<Arc<dyn Mailbox>> =
            self.inner.mailboxes.read().values().cloned().collect();
        let mut first_error = None;
        for mailbox in mailboxes {
            let Some(reply) = mailbox.stop() else {
                continue;
            };
            if let Ok(Err(error)) = reply.await {
                warn!(error = %error, "agent did not stop cleanly");
                first_error.get_or_insert(error);
            }
        }
        self.inner.cancel.cancel();
        info!("local runtime shut down");
        first_error.map_or(Ok(()), Err)
    }
}

fn already_running(id: &AgentId) -> KernelError {
    KernelError::PreconditionViolation(format!("agent {id} is already running"))
}
