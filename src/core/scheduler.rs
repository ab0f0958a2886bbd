//! Executes a task graph.
//!
//! The scheduler starts from one root job, runs every node whose ordering
//! constraints are met on the tokio runtime, and lets running bodies extend
//! the graph through their [`NodeContext`]. Node transitions are appended to
//! the run's event log when one is configured.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::adapters::{ToolAdapter, ToolError};
use crate::config::PipelineConfig;
use crate::domain::{
    ArtifactId, ErrorKind, Event, EventType, NodeFailure, NodeId, NodeStatus, ResourceHint,
    RunReport,
};

use super::event_store::EventStore;
use super::graph::{Attach, Failure, GraphError, NodeState, TaskGraph};
use super::job::{Job, NodeHandle};
use super::store::{ArtifactStore, StoreError};
use super::workspace::{StagedInputs, Workspace, WorkspaceError};

/// Everything a node body may use
pub struct Services {
    pub store: Arc<dyn ArtifactStore>,
    pub tools: Arc<dyn ToolAdapter>,
    pub config: Arc<PipelineConfig>,

    /// Parent directory for per-node workspaces
    pub work_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound on concurrently running bodies (0 = unbounded)
    pub max_parallel: usize,

    /// Deadline for nodes that do not set their own
    pub default_deadline: Option<Duration>,

    /// Where to write the run's event log, if anywhere
    pub runs_dir: Option<PathBuf>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            default_deadline: None,
            runs_dir: None,
        }
    }
}

impl SchedulerOptions {
    /// Options taken from the pipeline config
    pub fn from_config(config: &PipelineConfig, runs_dir: Option<PathBuf>) -> Self {
        let defaults = Self::default();
        Self {
            max_parallel: config.max_parallel_nodes.unwrap_or(defaults.max_parallel),
            default_deadline: config.node_timeout_seconds.map(Duration::from_secs),
            runs_dir,
        }
    }
}

#[derive(Debug, Clone)]
enum Control {
    Cancel(NodeId),
    CancelAll,
    /// Already cancelled in the graph; only the events are outstanding
    Cancelled(Vec<NodeId>),
}

/// Cancels nodes of a running graph from outside
#[derive(Clone)]
pub struct CancelHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl CancelHandle {
    /// Cancel a node and its descendants that have not started
    pub fn cancel(&self, node: NodeId) {
        let _ = self.tx.send(Control::Cancel(node));
    }

    /// Cancel everything that has not started
    pub fn cancel_all(&self) {
        let _ = self.tx.send(Control::CancelAll);
    }
}

/// Result of a finished run
#[derive(Debug)]
pub struct RunOutput<T> {
    pub report: RunReport,

    /// The root's output, if the root completed
    pub value: Option<T>,
}

fn lock(graph: &Mutex<TaskGraph>) -> MutexGuard<'_, TaskGraph> {
    graph.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handed to every node body
#[derive(Clone)]
pub struct NodeContext {
    id: NodeId,
    name: String,
    run_id: Uuid,
    graph: Arc<Mutex<TaskGraph>>,
    services: Arc<Services>,
    control: mpsc::UnboundedSender<Control>,
    staged: StagedInputs,
}

impl NodeContext {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.services.config
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.services.store
    }

    pub fn tools(&self) -> &Arc<dyn ToolAdapter> {
        &self.services.tools
    }

    /// Fresh workspace for this node; staged ids are kept for failure reports
    pub async fn workspace(&self) -> Result<Workspace, WorkspaceError> {
        let root = self.services.work_root.join(self.run_id.to_string());
        let workspace = Workspace::create(&root, Arc::clone(&self.services.store)).await?;
        Ok(workspace.with_recorder(Arc::clone(&self.staged)))
    }

    /// Resource hint scaled from the total size of `ids`
    pub async fn resources_for(&self, ids: &[ArtifactId], factor: u64) -> Result<ResourceHint, StoreError> {
        let mut total = 0u64;
        for &id in ids {
            total = total.saturating_add(self.services.store.size_of(id).await?);
        }
        Ok(ResourceHint::scaled(total, factor))
    }

    /// Add a node that starts once this body returns
    pub fn add_child<T>(&self, job: Job<T>) -> Result<NodeHandle<T>, GraphError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attach(self.id, Attach::Child, job)
    }

    /// Add a node that starts after this node's whole subtree
    pub fn add_follow_on<T>(&self, job: Job<T>) -> Result<NodeHandle<T>, GraphError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attach(self.id, Attach::FollowOn, job)
    }

    /// Add a child under a pending descendant of this node
    pub fn add_child_to<T>(&self, target: NodeId, job: Job<T>) -> Result<NodeHandle<T>, GraphError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attach(target, Attach::Child, job)
    }

    /// Add a follow-on under a pending descendant of this node
    pub fn add_follow_on_to<T>(
        &self,
        target: NodeId,
        job: Job<T>,
    ) -> Result<NodeHandle<T>, GraphError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attach(target, Attach::FollowOn, job)
    }

    /// Cancel a node (and whatever hangs off it) that has not started.
    ///
    /// The graph is updated before this returns, so a cancelled node can no
    /// longer be picked up by the scheduler.
    pub fn cancel(&self, node: NodeId) {
        let ids = {
            let mut graph = lock(&self.graph);
            if graph.node(node).is_err() {
                warn!(node = %node, "Cancel requested for unknown node");
                return;
            }
            graph.cancel(node)
        };
        let _ = self.control.send(Control::Cancelled(ids));
    }

    fn attach<T>(&self, target: NodeId, attach: Attach, job: Job<T>) -> Result<NodeHandle<T>, GraphError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (erased, slot) = job.into_parts();
        let name = erased.name.clone();

        let mut graph = lock(&self.graph);
        graph.check_target(self.id, target)?;
        let id = graph.insert(target, attach, erased)?;

        debug!(node = %id, %name, under = %target, ?attach, "Added node");
        Ok(NodeHandle::new(id, slot))
    }
}

/// Map a body's error chain onto the closed error classification
pub fn classify(error: &anyhow::Error) -> ErrorKind {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<WorkspaceError>() {
            match e {
                WorkspaceError::DuplicateName { .. } => return ErrorKind::DuplicateName,
                WorkspaceError::StageFailed { .. } => return ErrorKind::StageFailed,
                _ => {}
            }
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            match e {
                StoreError::NotFound(_) => return ErrorKind::NotFound,
                StoreError::MissingArtifact(_) => return ErrorKind::MissingArtifact,
                _ => {}
            }
        }
        if let Some(e) = cause.downcast_ref::<ToolError>() {
            match e {
                ToolError::Spawn { .. } | ToolError::Failed { .. } => return ErrorKind::ToolFailed,
                ToolError::Io { .. } => {}
            }
        }
        if let Some(e) = cause.downcast_ref::<GraphError>() {
            match e {
                GraphError::PromiseOutOfScope { .. } | GraphError::PromiseUnresolved(_) => {
                    return ErrorKind::PromiseUnresolved
                }
                _ => {}
            }
        }
    }
    ErrorKind::Other
}

enum Outcome {
    Done(anyhow::Result<()>),
    Panicked(String),
    TimedOut(Duration),
}

impl Outcome {
    fn from_join(joined: Result<anyhow::Result<()>, JoinError>) -> Self {
        match joined {
            Ok(result) => Outcome::Done(result),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Outcome::Panicked(message)
            }
            Err(e) => Outcome::Panicked(e.to_string()),
        }
    }
}

struct Finished {
    id: NodeId,
    outcome: Outcome,
    elapsed: Duration,
}

/// Optional event log; append failures are logged, not fatal
struct EventLog {
    store: Option<EventStore>,
}

impl EventLog {
    async fn emit(&self, event: Event) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append(&event).await {
                warn!(error = %e, "Failed to append event");
            }
        }
    }
}

/// Runs one task graph
pub struct Scheduler {
    run_id: Uuid,
    services: Arc<Services>,
    options: SchedulerOptions,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Scheduler {
    pub fn new(services: Arc<Services>, options: SchedulerOptions) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            run_id: Uuid::new_v4(),
            services,
            options,
            control_tx,
            control_rx,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Handle for cancelling nodes while [`Scheduler::run`] is in progress
    pub fn canceller(&self) -> CancelHandle {
        CancelHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Run `root` and everything it spawns to completion
    #[instrument(skip(self, root), fields(run_id = %self.run_id, root = %root.name()))]
    pub async fn run<T>(self, root: Job<T>) -> Result<RunOutput<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let Scheduler {
            run_id,
            services,
            options,
            control_tx,
            mut control_rx,
        } = self;

        let log = EventLog {
            store: match &options.runs_dir {
                Some(dir) => Some(EventStore::open_in(dir, run_id).await?),
                None => None,
            },
        };

        let started_at = Utc::now();
        let (erased, slot) = root.into_parts();
        let root_name = erased.name.clone();
        let graph = Arc::new(Mutex::new(TaskGraph::new()));
        let root_id = lock(&graph).insert_root(erased)?;
        let root_handle = NodeHandle::new(root_id, slot);

        info!("Starting run");
        log.emit(Event::run(
            run_id,
            EventType::RunStarted,
            format!("Run started with root '{}'", root_name),
            NodeStatus::Running,
        ))
        .await;

        let limit = if options.max_parallel == 0 {
            usize::MAX
        } else {
            options.max_parallel
        };

        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        let mut staged: HashMap<NodeId, StagedInputs> = HashMap::new();
        let mut failures: Vec<NodeFailure> = Vec::new();
        let mut execution_order: Vec<NodeId> = Vec::new();
        let mut run_cancelled = false;

        loop {
            // Apply pending cancels before anything else can start
            let cancelled = {
                let mut g = lock(&graph);
                let mut cancelled = Vec::new();
                while let Ok(control) = control_rx.try_recv() {
                    cancelled.extend(apply_control(&mut g, root_id, control, &mut run_cancelled));
                }
                cancelled
            };
            emit_cancelled(&log, run_id, cancelled).await;

            // Settle nodes that can no longer run, then queue the ready ones
            let blocked = {
                let mut g = lock(&graph);
                let blocked: Vec<(NodeId, String, NodeState)> = g
                    .propagate()
                    .into_iter()
                    .filter_map(|id| g.node(id).ok().map(|n| (id, n.name.clone(), n.state.clone())))
                    .collect();
                for id in g.ready_nodes() {
                    if let Ok(node) = g.node_mut(id) {
                        node.state = NodeState::Runnable;
                        queue.push_back(id);
                    }
                }
                blocked
            };
            for (id, name, state) in blocked {
                log.emit(blocked_event(run_id, id, &name, &state)).await;
            }

            while tasks.len() < limit {
                let Some(id) = queue.pop_front() else {
                    break;
                };

                let start = {
                    let mut g = lock(&graph);
                    let Ok(node) = g.node_mut(id) else {
                        continue;
                    };
                    if node.state != NodeState::Runnable {
                        continue;
                    }
                    node.state = NodeState::Running;
                    node.started_at = Some(Utc::now());
                    (
                        node.name.clone(),
                        node.body.take(),
                        node.deadline.or(options.default_deadline),
                        node.resources,
                    )
                };
                let (name, body, deadline, resources) = start;

                execution_order.push(id);
                info!(node = %id, %name, "Node started");
                debug!(
                    node = %id,
                    memory = resources.memory,
                    disk = resources.disk,
                    cores = resources.cores,
                    "Resource hint"
                );
                log.emit(Event::node(
                    run_id,
                    id,
                    &name,
                    EventType::NodeStarted,
                    format!("Node '{}' started", name),
                    NodeStatus::Running,
                ))
                .await;

                let recorder = StagedInputs::default();
                staged.insert(id, Arc::clone(&recorder));

                let ctx = NodeContext {
                    id,
                    name: name.clone(),
                    run_id,
                    graph: Arc::clone(&graph),
                    services: Arc::clone(&services),
                    control: control_tx.clone(),
                    staged: recorder,
                };

                let span = info_span!("node", id = %id, name = %name);
                tasks.spawn(async move {
                    let clock = Instant::now();
                    let outcome = match body {
                        None => Outcome::Done(Err(anyhow::anyhow!("node body already taken"))),
                        Some(body) => {
                            let handle = tokio::spawn(body(ctx).instrument(span));
                            match deadline {
                                Some(limit) => {
                                    let abort = handle.abort_handle();
                                    match tokio::time::timeout(limit, handle).await {
                                        Ok(joined) => Outcome::from_join(joined),
                                        Err(_) => {
                                            abort.abort();
                                            Outcome::TimedOut(limit)
                                        }
                                    }
                                }
                                None => Outcome::from_join(handle.await),
                            }
                        }
                    };
                    Finished {
                        id,
                        outcome,
                        elapsed: clock.elapsed(),
                    }
                });
            }

            if tasks.is_empty() {
                // Nothing running and nothing ready: whatever is left can never start
                let stalled: Vec<(NodeId, String)> = {
                    let mut g = lock(&graph);
                    let ids = g.unfinished();
                    ids.into_iter()
                        .filter_map(|id| {
                            let node = g.node_mut(id).ok()?;
                            node.state = NodeState::Failed(Failure::Error {
                                kind: ErrorKind::Other,
                                message: "never became runnable".to_string(),
                            });
                            node.body = None;
                            node.finished_at = Some(Utc::now());
                            Some((id, node.name.clone()))
                        })
                        .collect()
                };
                for (id, name) in stalled {
                    error!(node = %id, %name, "Node never became runnable");
                    failures.push(NodeFailure {
                        node: id,
                        name: name.clone(),
                        kind: ErrorKind::Other,
                        message: "never became runnable".to_string(),
                        inputs: Vec::new(),
                    });
                    log.emit(
                        Event::node(
                            run_id,
                            id,
                            &name,
                            EventType::NodeFailed,
                            format!("Node '{}' never became runnable", name),
                            NodeStatus::Failed,
                        )
                        .with_error(ErrorKind::Other, "never became runnable".to_string()),
                    )
                    .await;
                }
                break;
            }

            tokio::select! {
                biased;

                Some(control) = control_rx.recv() => {
                    let cancelled = {
                        let mut g = lock(&graph);
                        apply_control(&mut g, root_id, control, &mut run_cancelled)
                    };
                    emit_cancelled(&log, run_id, cancelled).await;
                }
                Some(joined) = tasks.join_next() => {
                    let finished = match joined {
                        Ok(finished) => finished,
                        Err(e) => {
                            error!(error = %e, "Node supervisor task failed");
                            continue;
                        }
                    };
                    let inputs = staged
                        .remove(&finished.id)
                        .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).clone())
                        .unwrap_or_default();
                    let (event, failure) = finish_node(&graph, run_id, finished, inputs);
                    if let Some(failure) = failure {
                        failures.push(failure);
                    }
                    if let Some(event) = event {
                        log.emit(event).await;
                    }
                }
            }
        }

        let finished_at = Utc::now();
        let nodes = lock(&graph).report_nodes();
        let report = RunReport {
            run_id,
            started_at,
            finished_at,
            nodes,
            failures,
            execution_order,
            cancelled: run_cancelled,
        };

        let value = root_handle.output().cloned();

        if report.cancelled && report.failures.is_empty() {
            warn!(nodes = report.nodes.len(), "Run cancelled");
            log.emit(Event::run(
                run_id,
                EventType::RunCancelled,
                "Run cancelled before every node had run".to_string(),
                NodeStatus::Cancelled,
            ))
            .await;
        } else if report.succeeded() {
            info!(nodes = report.nodes.len(), "Run completed");
            log.emit(Event::run(
                run_id,
                EventType::RunCompleted,
                format!("Run completed with {} nodes", report.nodes.len()),
                NodeStatus::Completed,
            ))
            .await;
        } else {
            let summary = report
                .failures
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            error!(failed = report.failures.len(), "Run failed");
            let kind = report.failures[0].kind;
            log.emit(
                Event::run(
                    run_id,
                    EventType::RunFailed,
                    format!("Run failed: {} node(s) failed", report.failures.len()),
                    NodeStatus::Failed,
                )
                .with_error(kind, summary),
            )
            .await;
        }

        if let Some(store) = &log.store {
            if let Err(e) = store.store_report(&report).await {
                warn!(error = %e, "Failed to write run report");
            }
        }

        Ok(RunOutput { report, value })
    }
}

/// Apply one control message; returns the nodes it cancelled with their names
fn apply_control(
    g: &mut TaskGraph,
    root_id: NodeId,
    control: Control,
    run_cancelled: &mut bool,
) -> Vec<(NodeId, String)> {
    let ids = match control {
        Control::Cancel(id) if g.node(id).is_ok() => g.cancel(id),
        Control::Cancel(id) => {
            warn!(node = %id, "Cancel requested for unknown node");
            Vec::new()
        }
        Control::CancelAll => {
            if !g.unfinished().is_empty() {
                *run_cancelled = true;
            }
            g.cancel(root_id)
        }
        Control::Cancelled(ids) => ids,
    };
    ids.into_iter()
        .filter_map(|id| g.node(id).ok().map(|n| (id, n.name.clone())))
        .collect()
}

async fn emit_cancelled(log: &EventLog, run_id: Uuid, cancelled: Vec<(NodeId, String)>) {
    for (id, name) in cancelled {
        info!(node = %id, %name, "Node cancelled");
        log.emit(Event::node(
            run_id,
            id,
            &name,
            EventType::NodeCancelled,
            format!("Node '{}' cancelled", name),
            NodeStatus::Cancelled,
        ))
        .await;
    }
}

/// Record a body's outcome in the graph
fn finish_node(
    graph: &Mutex<TaskGraph>,
    run_id: Uuid,
    finished: Finished,
    inputs: Vec<ArtifactId>,
) -> (Option<Event>, Option<NodeFailure>) {
    let Finished {
        id,
        outcome,
        elapsed,
    } = finished;
    let duration_ms = elapsed.as_millis() as u64;

    let mut g = lock(graph);
    let Ok(node) = g.node_mut(id) else {
        return (None, None);
    };
    node.finished_at = Some(Utc::now());
    let name = node.name.clone();

    let (kind, message) = match outcome {
        Outcome::Done(Ok(())) => {
            if node.cancel_requested {
                node.state = NodeState::Cancelled;
                info!(node = %id, %name, duration_ms, "Node finished after cancel request");
                let event = Event::node(
                    run_id,
                    id,
                    &name,
                    EventType::NodeCancelled,
                    format!("Node '{}' cancelled while running", name),
                    NodeStatus::Cancelled,
                )
                .with_duration(duration_ms);
                return (Some(event), None);
            }
            node.state = NodeState::Completed;
            info!(node = %id, %name, duration_ms, "Node completed");
            let event = Event::node(
                run_id,
                id,
                &name,
                EventType::NodeCompleted,
                format!("Node '{}' completed in {}ms", name, duration_ms),
                NodeStatus::Completed,
            )
            .with_duration(duration_ms);
            return (Some(event), None);
        }
        Outcome::Done(Err(e)) => (classify(&e), format!("{:#}", e)),
        Outcome::Panicked(message) => (ErrorKind::Panicked, message),
        Outcome::TimedOut(limit) => (
            ErrorKind::Timeout,
            format!("exceeded deadline of {}s", limit.as_secs_f64()),
        ),
    };

    node.state = NodeState::Failed(Failure::Error {
        kind,
        message: message.clone(),
    });
    error!(node = %id, %name, %kind, error = %message, "Node failed");

    let event = Event::node(
        run_id,
        id,
        &name,
        EventType::NodeFailed,
        format!("Node '{}' failed: {}", name, message),
        NodeStatus::Failed,
    )
    .with_duration(duration_ms)
    .with_error(kind, message.clone());

    let failure = NodeFailure {
        node: id,
        name,
        kind,
        message,
        inputs,
    };
    (Some(event), Some(failure))
}

fn blocked_event(run_id: Uuid, id: NodeId, name: &str, state: &NodeState) -> Event {
    match state {
        NodeState::Failed(Failure::Upstream(cause)) => {
            warn!(node = %id, %name, upstream = %cause, "Node skipped after upstream failure");
            Event::node(
                run_id,
                id,
                name,
                EventType::NodeFailed,
                format!("Node '{}' skipped: upstream {} failed", name, cause),
                NodeStatus::Failed,
            )
            .with_error(ErrorKind::Upstream, format!("upstream {} failed", cause))
        }
        _ => {
            info!(node = %id, %name, "Node cancelled");
            Event::node(
                run_id,
                id,
                name,
                EventType::NodeCancelled,
                format!("Node '{}' cancelled", name),
                NodeStatus::Cancelled,
            )
        }
    }
}
