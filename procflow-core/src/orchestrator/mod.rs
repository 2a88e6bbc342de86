//! Process orchestrator: starts instances, completes tasks, reacts to fired
//! triggers and applies lifecycle transitions.
//!
//! Every mutating operation runs under the instance's lock:
//! load → verify → step → commit → registry effects. Throw events publish
//! after the lock is released so a delivery can re-enter the orchestrator.

mod locks;
mod step;

use crate::auth::AuthorizationCheck;
use crate::condition::ConditionEvaluator;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::gateway::GatewayResolver;
use crate::graph::ProcessGraph;
use crate::provider::GraphProvider;
use crate::store::{ProcessStore, VersionConflict};
use crate::triggers::{TriggerRegistry, TriggerSink};
use crate::types::*;
use async_trait::async_trait;
use chrono::Utc;
use locks::InstanceLocks;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use step::{Effect, Outcome, Step};
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct Orchestrator {
    graphs: Arc<dyn GraphProvider>,
    store: Arc<dyn ProcessStore>,
    auth: Arc<dyn AuthorizationCheck>,
    triggers: Arc<TriggerRegistry>,
    resolver: GatewayResolver,
    conditions: ConditionEvaluator,
    locks: InstanceLocks,
    config: EngineConfig,
}

impl Orchestrator {
    /// Build an orchestrator with its own trigger registry, attached as the
    /// registry's callback target.
    pub fn new(
        graphs: Arc<dyn GraphProvider>,
        store: Arc<dyn ProcessStore>,
        auth: Arc<dyn AuthorizationCheck>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let conditions = ConditionEvaluator::new();
        let orchestrator = Arc::new(Self {
            graphs,
            store,
            auth,
            triggers: Arc::new(TriggerRegistry::new()),
            resolver: GatewayResolver::new(conditions),
            conditions,
            locks: InstanceLocks::default(),
            config,
        });
        let weak: Weak<Self> = Arc::downgrade(&orchestrator);
        let sink: Weak<dyn TriggerSink> = weak;
        orchestrator.triggers.attach(sink);
        orchestrator
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Periodically drop inactive subscriptions until `shutdown` flips to true.
    pub fn spawn_compactor(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.triggers.spawn_compactor(self.config.compaction_interval(), shutdown)
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    pub async fn start(
        &self,
        definition_id: &str,
        initiator: &str,
        variables: Variables,
        business_key: Option<String>,
    ) -> EngineResult<ProcessInstance> {
        let graph = self.graph(definition_id).await?;
        let start = graph.start_node().ok_or_else(|| {
            EngineError::InvalidGraph(format!("{definition_id}: no start node"))
        })?;

        let now = Utc::now();
        let instance = ProcessInstance {
            id: Uuid::now_v7(),
            definition_id: graph.id().to_string(),
            graph_fingerprint: graph.fingerprint(),
            business_key,
            initiator: initiator.to_string(),
            status: InstanceStatus::Active,
            current_nodes: Vec::new(),
            join_arrivals: BTreeMap::new(),
            variables,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: now,
            ended_at: None,
        };
        let record = ExecutionRecord::new(
            instance.id,
            start,
            ExecutionStatus::Completed,
            initiator,
            "process started",
        )
        .with_input(&instance.variables);

        let guard = self.locks.acquire(instance.id).await;
        let mut step = self.step(&graph, initiator, instance);
        step.push_record(record);
        step.enter(start)?;
        let instance = self.persist(step.finish(), guard).await?;

        tracing::info!(
            instance_id = %instance.id,
            definition_id,
            start_node = %start.id,
            initiator,
            "Process instance started"
        );
        Ok(instance)
    }

    pub async fn complete_task(
        &self,
        instance_id: Uuid,
        node_id: &str,
        actor: &Actor,
        output: Variables,
    ) -> EngineResult<ProcessInstance> {
        let guard = self.locks.acquire(instance_id).await;
        let instance = self.load(instance_id).await?;
        if !instance.is_at(node_id) {
            return Err(EngineError::NotCurrentNode {
                instance_id,
                node_id: node_id.to_string(),
            });
        }
        if !instance.is_active() {
            return Err(EngineError::InvalidTransition {
                from: instance.status,
                operation: "complete a task of",
            });
        }
        let graph = self.graph_for(&instance).await?;
        let node = graph.require(node_id)?;
        if !node.is_completable() {
            return Err(EngineError::NotCompletable {
                node_id: node_id.to_string(),
            });
        }
        if !self.auth.is_authorized(node_id, actor).await? {
            tracing::warn!(
                instance_id = %instance_id,
                node_id,
                actor = %actor.id,
                "Task completion refused"
            );
            return Err(EngineError::Unauthorized {
                node_id: node_id.to_string(),
                actor: actor.id.clone(),
            });
        }

        let mut step = self.step(&graph, &actor.id, instance);
        step.instance.merge_variables(&output);
        step.push_record(
            ExecutionRecord::new(
                instance_id,
                node,
                ExecutionStatus::Completed,
                &actor.id,
                "task completed",
            )
            .with_input(&output),
        );
        if let Err(err) = step.advance_from(node) {
            self.record_failure(&graph, instance_id, &actor.id, &err).await;
            return Err(err);
        }
        let instance = self.persist(step.finish(), guard).await?;

        tracing::info!(
            instance_id = %instance_id,
            node_id,
            actor = %actor.id,
            status = ?instance.status,
            current = ?instance.current_nodes,
            "Task completed"
        );
        Ok(instance)
    }

    /// Advance an instance waiting at `node_id`. Returns `false` for stale
    /// triggers: the instance is not active, or no token waits on the node.
    pub async fn trigger_event(
        &self,
        instance_id: Uuid,
        node_id: &str,
        variables: Variables,
    ) -> EngineResult<bool> {
        let guard = self.locks.acquire(instance_id).await;
        let instance = self.load(instance_id).await?;
        if !instance.is_active() {
            tracing::debug!(
                instance_id = %instance_id,
                node_id,
                status = ?instance.status,
                "trigger ignored; instance not active"
            );
            return Ok(false);
        }
        let graph = self.graph_for(&instance).await?;
        let Some(node) = graph.node(node_id) else {
            tracing::debug!(instance_id = %instance_id, node_id, "trigger for unknown node");
            return Ok(false);
        };

        let waits_here = instance.is_at(node_id)
            && (node.event_kind().is_some() || node.kind == NodeKind::Task(TaskKind::Receive));
        let race = if waits_here {
            None
        } else {
            match race_for(&graph, &instance, node_id) {
                Some(gateway) => Some(gateway),
                None => {
                    tracing::debug!(
                        instance_id = %instance_id,
                        node_id,
                        "stale trigger; instance moved on"
                    );
                    return Ok(false);
                }
            }
        };

        let actor = self.config.system_actor.as_str();
        let mut step = self.step(&graph, actor, instance);
        step.instance.merge_variables(&variables);
        step.push_record(
            ExecutionRecord::new(
                instance_id,
                node,
                ExecutionStatus::Completed,
                actor,
                "event triggered",
            )
            .with_input(&variables),
        );
        let advanced = match race {
            Some(gateway) => step.win_race(gateway, node),
            None => step.advance_from(node),
        };
        if let Err(err) = advanced {
            self.record_failure(&graph, instance_id, actor, &err).await;
            return Err(err);
        }
        let instance = self.persist(step.finish(), guard).await?;

        tracing::info!(
            instance_id = %instance_id,
            node_id,
            status = ?instance.status,
            current = ?instance.current_nodes,
            "Event triggered"
        );
        Ok(true)
    }

    pub async fn suspend(&self, instance_id: Uuid) -> EngineResult<ProcessInstance> {
        let guard = self.locks.acquire(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        if instance.status != InstanceStatus::Active {
            return Err(EngineError::InvalidTransition {
                from: instance.status,
                operation: "suspend",
            });
        }
        instance.status = InstanceStatus::Suspended;
        let instance = self.persist(Outcome::new(instance, Vec::new()), guard).await?;
        tracing::info!(instance_id = %instance_id, "Process instance suspended");
        Ok(instance)
    }

    /// Reactivate a suspended instance. Waits whose trigger was spent while
    /// suspended are registered again.
    pub async fn resume(&self, instance_id: Uuid) -> EngineResult<ProcessInstance> {
        let guard = self.locks.acquire(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        if instance.status != InstanceStatus::Suspended {
            return Err(EngineError::InvalidTransition {
                from: instance.status,
                operation: "resume",
            });
        }
        instance.status = InstanceStatus::Active;

        let armed: HashSet<String> = self
            .triggers
            .timers_for_instance(instance_id)
            .into_iter()
            .map(|t| t.node_id)
            .chain(
                self.triggers
                    .subscriptions_for_instance(instance_id)
                    .into_iter()
                    .map(|s| s.node_id),
            )
            .collect();
        let graph = self.graph_for(&instance).await?;
        let mut step = self.step(&graph, &self.config.system_actor, instance);
        step.rearm(&armed)?;
        let instance = self.persist(step.finish(), guard).await?;
        tracing::info!(instance_id = %instance_id, "Process instance resumed");
        Ok(instance)
    }

    pub async fn terminate(&self, instance_id: Uuid) -> EngineResult<ProcessInstance> {
        let guard = self.locks.acquire(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: instance.status,
                operation: "terminate",
            });
        }
        instance.close(InstanceStatus::Terminated, Utc::now());
        let instance = self
            .persist(Outcome::new(instance, vec![Effect::CancelAll]), guard)
            .await?;
        tracing::info!(instance_id = %instance_id, "Process instance terminated");
        Ok(instance)
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub async fn get_instance(&self, instance_id: Uuid) -> EngineResult<ProcessInstance> {
        self.load(instance_id).await
    }

    pub async fn executions(&self, instance_id: Uuid) -> EngineResult<Vec<ExecutionRecord>> {
        Ok(self.store.load_executions(instance_id).await?)
    }

    pub async fn active_instances(
        &self,
        definition_id: Option<&str>,
    ) -> EngineResult<Vec<ProcessInstance>> {
        Ok(self.store.find_active_instances(definition_id).await?)
    }

    /// Active instances waiting at a task assigned to `user_id`.
    pub async fn tasks_for_user(&self, user_id: &str) -> EngineResult<Vec<ProcessInstance>> {
        self.waiting_at(self.auth.assigned_to_user(user_id)).await
    }

    /// Active instances waiting at a task open to `group`.
    pub async fn tasks_for_group(&self, group: &str) -> EngineResult<Vec<ProcessInstance>> {
        self.waiting_at(self.auth.assigned_to_group(group)).await
    }

    async fn waiting_at(&self, node_ids: Vec<String>) -> EngineResult<Vec<ProcessInstance>> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.find_active_at_nodes(&node_ids).await?)
    }

    // ─── Publishing ──────────────────────────────────────────────

    /// Returns the number of instances the message advanced.
    pub async fn publish_message(
        &self,
        message_name: &str,
        correlation_key: Option<&str>,
        variables: Variables,
    ) -> usize {
        self.triggers
            .publish_message(message_name, correlation_key, variables)
            .await
    }

    /// Returns the number of instances the signal advanced.
    pub async fn publish_signal(&self, signal_name: &str, variables: Variables) -> usize {
        self.triggers.publish_signal(signal_name, variables, None).await
    }

    // ─── Internals ───────────────────────────────────────────────

    fn step<'a>(
        &'a self,
        graph: &'a ProcessGraph,
        actor: &'a str,
        instance: ProcessInstance,
    ) -> Step<'a> {
        Step::new(
            graph,
            &self.resolver,
            self.conditions,
            actor,
            self.config.max_steps_per_advance,
            instance,
        )
    }

    async fn graph(&self, definition_id: &str) -> EngineResult<Arc<ProcessGraph>> {
        self.graphs
            .load_graph(definition_id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_id.to_string()))
    }

    async fn graph_for(&self, instance: &ProcessInstance) -> EngineResult<Arc<ProcessGraph>> {
        let graph = self.graph(&instance.definition_id).await?;
        if graph.fingerprint() != instance.graph_fingerprint {
            tracing::warn!(
                instance_id = %instance.id,
                definition_id = %instance.definition_id,
                "definition changed since the instance started"
            );
        }
        Ok(graph)
    }

    async fn load(&self, instance_id: Uuid) -> EngineResult<ProcessInstance> {
        self.store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    /// Commit a finished step, apply its registry effects while still locked,
    /// then unlock and publish its throws.
    async fn persist(
        &self,
        outcome: Outcome,
        guard: OwnedMutexGuard<()>,
    ) -> EngineResult<ProcessInstance> {
        let Outcome {
            mut instance,
            records,
            effects,
        } = outcome;
        instance.updated_at = Utc::now();
        instance.version = self
            .store
            .commit(&instance, &records)
            .await
            .map_err(commit_error)?;

        let publishes = self.apply_effects(&instance, effects);
        drop(guard);
        if instance.status.is_terminal() {
            self.locks.forget(instance.id);
        }
        self.publish(&instance, publishes).await;
        Ok(instance)
    }

    fn apply_effects(&self, instance: &ProcessInstance, effects: Vec<Effect>) -> Vec<Effect> {
        let mut publishes = Vec::new();
        for effect in effects {
            match effect {
                Effect::RegisterTimer {
                    node_id,
                    fire_at,
                    race,
                } => {
                    self.triggers.schedule_at(instance.id, &node_id, fire_at, race);
                }
                Effect::SubscribeMessage {
                    node_id,
                    name,
                    race,
                } => {
                    self.triggers.subscribe_message(
                        instance.id,
                        &node_id,
                        &name,
                        instance.business_key.clone(),
                        race,
                    );
                }
                Effect::SubscribeSignal {
                    node_id,
                    name,
                    race,
                } => {
                    self.triggers.subscribe_signal(instance.id, &node_id, &name, race);
                }
                Effect::CancelRace { race } => {
                    let cancelled = self.triggers.cancel_race(instance.id, &race);
                    tracing::debug!(
                        instance_id = %instance.id,
                        race = %race,
                        cancelled,
                        "race losers cancelled"
                    );
                }
                Effect::CancelNode { node_id } => {
                    let cancelled = self.triggers.cancel_node(instance.id, &node_id);
                    tracing::debug!(
                        instance_id = %instance.id,
                        node_id = %node_id,
                        cancelled,
                        "wait triggers released"
                    );
                }
                Effect::CancelAll => {
                    self.triggers.cancel_all_for_instance(instance.id);
                }
                publish @ (Effect::PublishSignal { .. } | Effect::PublishMessage { .. }) => {
                    publishes.push(publish)
                }
            }
        }
        publishes
    }

    async fn publish(&self, instance: &ProcessInstance, publishes: Vec<Effect>) {
        for effect in publishes {
            match effect {
                Effect::PublishSignal { name } => {
                    let delivered = self
                        .triggers
                        .publish_signal(&name, Variables::new(), Some(instance.id))
                        .await;
                    tracing::debug!(
                        instance_id = %instance.id,
                        signal = %name,
                        delivered,
                        "signal thrown"
                    );
                }
                Effect::PublishMessage { name } => {
                    let delivered = self
                        .triggers
                        .publish_message(
                            &name,
                            instance.business_key.as_deref(),
                            Variables::new(),
                        )
                        .await;
                    tracing::debug!(
                        instance_id = %instance.id,
                        message = %name,
                        delivered,
                        "message thrown"
                    );
                }
                _ => {}
            }
        }
    }

    /// A gateway with no viable branch leaves a Failed record; the instance itself is untouched.
    async fn record_failure(
        &self,
        graph: &ProcessGraph,
        instance_id: Uuid,
        actor: &str,
        err: &EngineError,
    ) {
        let EngineError::NoViableBranch { gateway_id } = err else {
            return;
        };
        let Some(gateway) = graph.node(gateway_id) else {
            return;
        };
        let record = ExecutionRecord::new(
            instance_id,
            gateway,
            ExecutionStatus::Failed,
            actor,
            err.to_string(),
        );
        if let Err(e) = self.store.append_execution(&record).await {
            tracing::error!(
                instance_id = %instance_id,
                gateway_id = %gateway_id,
                error = %e,
                "failed to record gateway failure"
            );
        }
    }
}

#[async_trait]
impl TriggerSink for Orchestrator {
    async fn on_trigger_fired(
        &self,
        instance_id: Uuid,
        node_id: &str,
        variables: Variables,
    ) -> anyhow::Result<bool> {
        Ok(self.trigger_event(instance_id, node_id, variables).await?)
    }
}

/// Event-based gateway holding a token whose race includes `node_id`.
fn race_for<'g>(
    graph: &'g ProcessGraph,
    instance: &ProcessInstance,
    node_id: &str,
) -> Option<&'g Node> {
    instance
        .current_nodes
        .iter()
        .filter_map(|id| graph.node(id))
        .filter(|n| n.gateway_kind() == Some(GatewayKind::EventBased))
        .find(|gateway| {
            graph
                .outgoing(&gateway.id)
                .iter()
                .any(|e| e.target == node_id)
        })
}

fn commit_error(err: anyhow::Error) -> EngineError {
    match err.downcast_ref::<VersionConflict>() {
        Some(conflict) => EngineError::ConcurrentModification(conflict.instance_id),
        None => EngineError::Store(err),
    }
}
