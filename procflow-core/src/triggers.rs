//! Trigger registry: pending timers and message/signal subscriptions.
//!
//! Subscriptions live in an arena keyed by id with secondary indexes by
//! `(kind, name)` and by instance, all behind one lock so the indexes never
//! disagree with the arena. A publish claims every matching subscription
//! (Active → Delivering) in a single write-locked step, delivers outside the
//! lock, then settles each one: a successful delivery deactivates it, anything
//! else returns it to Active.
//!
//! Timers are one-shot tokio tasks. The firing task removes its own entry
//! before calling back, so a cancel that loses that race returns `false`.

use crate::error::EngineResult;
use crate::timer::TimerSpec;
use crate::types::Variables;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Receives fired triggers. Implemented by the orchestrator.
#[async_trait]
pub trait TriggerSink: Send + Sync {
    /// Returns `Ok(true)` when the trigger advanced the instance, `Ok(false)`
    /// when it was stale (instance inactive or already past the node).
    async fn on_trigger_fired(
        &self,
        instance_id: Uuid,
        node_id: &str,
        variables: Variables,
    ) -> anyhow::Result<bool>;
}

// ─── Entries ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    Message,
    Signal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    Active,
    /// Claimed by an in-flight publish.
    Delivering,
    Inactive,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub kind: SubscriptionKind,
    pub name: String,
    /// Messages only. `None` matches any published key.
    pub correlation_key: Option<String>,
    /// Event-based gateway this subscription races under.
    pub race: Option<String>,
    pub state: SubscriptionState,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Active
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerHandle {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub fire_at: DateTime<Utc>,
    pub race: Option<String>,
}

struct PendingTimer {
    handle: TimerHandle,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState {
    subscriptions: HashMap<Uuid, Subscription>,
    by_name: HashMap<(SubscriptionKind, String), Vec<Uuid>>,
    by_instance: HashMap<Uuid, HashSet<Uuid>>,
    timers: HashMap<Uuid, PendingTimer>,
}

impl RegistryState {
    fn insert(&mut self, sub: Subscription) {
        self.by_name
            .entry((sub.kind, sub.name.clone()))
            .or_default()
            .push(sub.id);
        self.by_instance
            .entry(sub.instance_id)
            .or_default()
            .insert(sub.id);
        self.subscriptions.insert(sub.id, sub);
    }

    fn remove(&mut self, id: Uuid) {
        let Some(sub) = self.subscriptions.remove(&id) else {
            return;
        };
        let key = (sub.kind, sub.name);
        if let Some(ids) = self.by_name.get_mut(&key) {
            ids.retain(|s| *s != id);
            if ids.is_empty() {
                self.by_name.remove(&key);
            }
        }
        if let Some(ids) = self.by_instance.get_mut(&sub.instance_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_instance.remove(&sub.instance_id);
            }
        }
    }

    fn deactivate(&mut self, id: Uuid) -> bool {
        match self.subscriptions.get_mut(&id) {
            Some(sub) if sub.state != SubscriptionState::Inactive => {
                sub.state = SubscriptionState::Inactive;
                true
            }
            _ => false,
        }
    }

    /// Claim every active subscription of `(kind, name)` accepted by `accept`.
    fn claim(
        &mut self,
        kind: SubscriptionKind,
        name: &str,
        accept: impl Fn(&Subscription) -> bool,
    ) -> Vec<Subscription> {
        let Some(ids) = self.by_name.get(&(kind, name.to_string())) else {
            return Vec::new();
        };
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(sub) = self.subscriptions.get_mut(id) {
                if sub.is_active() && accept(sub) {
                    sub.state = SubscriptionState::Delivering;
                    claimed.push(sub.clone());
                }
            }
        }
        claimed
    }

    fn take_timers(&mut self, pred: impl Fn(&TimerHandle) -> bool) -> Vec<PendingTimer> {
        let ids: Vec<Uuid> = self
            .timers
            .values()
            .filter(|t| pred(&t.handle))
            .map(|t| t.handle.id)
            .collect();
        ids.iter().filter_map(|id| self.timers.remove(id)).collect()
    }
}

// ─── Registry ─────────────────────────────────────────────────

pub struct TriggerRegistry {
    state: RwLock<RegistryState>,
    sink: OnceLock<Weak<dyn TriggerSink>>,
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            sink: OnceLock::new(),
        }
    }

    /// Attach the callback target. Only the first attachment takes effect.
    pub fn attach(&self, sink: Weak<dyn TriggerSink>) -> bool {
        self.sink.set(sink).is_ok()
    }

    fn sink(&self) -> Option<Arc<dyn TriggerSink>> {
        self.sink.get().and_then(Weak::upgrade)
    }

    // Every mutation leaves the state consistent, so a poisoned lock is still usable.
    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Timers ──

    /// Schedule a one-shot timer. Cyclic specs fail with `UnsupportedTrigger`,
    /// fire times out of range with `MalformedTriggerSpec`.
    pub fn schedule_timer(
        self: &Arc<Self>,
        instance_id: Uuid,
        node_id: &str,
        spec: &TimerSpec,
        race: Option<String>,
    ) -> EngineResult<TimerHandle> {
        let fire_at = spec.fire_at(Utc::now())?;
        Ok(self.schedule_at(instance_id, node_id, fire_at, race))
    }

    /// Schedule a one-shot timer due at `fire_at`. Instants already past fire at once.
    pub fn schedule_at(
        self: &Arc<Self>,
        instance_id: Uuid,
        node_id: &str,
        fire_at: DateTime<Utc>,
        race: Option<String>,
    ) -> TimerHandle {
        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let handle = TimerHandle {
            id: Uuid::now_v7(),
            instance_id,
            node_id: node_id.to_string(),
            fire_at,
            race,
        };

        let mut state = self.write();
        let registry = Arc::downgrade(self);
        let timer_id = handle.id;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(registry) = registry.upgrade() {
                registry.fire_timer(timer_id).await;
            }
        });
        state.timers.insert(
            timer_id,
            PendingTimer {
                handle: handle.clone(),
                task,
            },
        );

        tracing::debug!(
            instance_id = %instance_id,
            node_id,
            timer_id = %timer_id,
            fire_at = %handle.fire_at,
            "timer scheduled"
        );
        handle
    }

    async fn fire_timer(&self, timer_id: Uuid) {
        let pending = self.write().timers.remove(&timer_id);
        let Some(pending) = pending else {
            return;
        };
        let handle = pending.handle;
        let Some(sink) = self.sink() else {
            tracing::warn!(timer_id = %timer_id, "timer fired with no sink attached");
            return;
        };
        match sink
            .on_trigger_fired(handle.instance_id, &handle.node_id, Variables::new())
            .await
        {
            Ok(true) => tracing::debug!(
                instance_id = %handle.instance_id,
                node_id = %handle.node_id,
                "timer delivered"
            ),
            Ok(false) => tracing::debug!(
                instance_id = %handle.instance_id,
                node_id = %handle.node_id,
                "timer fired for an instance that moved on"
            ),
            Err(e) => tracing::warn!(
                instance_id = %handle.instance_id,
                node_id = %handle.node_id,
                error = %e,
                "timer delivery failed"
            ),
        }
    }

    /// Returns whether a pending timer was cancelled. Fired or unknown timers give `false`.
    pub fn cancel_timer(&self, timer_id: Uuid) -> bool {
        match self.write().timers.remove(&timer_id) {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn timers_for_instance(&self, instance_id: Uuid) -> Vec<TimerHandle> {
        self.read()
            .timers
            .values()
            .filter(|t| t.handle.instance_id == instance_id)
            .map(|t| t.handle.clone())
            .collect()
    }

    // ── Subscriptions ──

    fn subscribe(
        &self,
        kind: SubscriptionKind,
        instance_id: Uuid,
        node_id: &str,
        name: &str,
        correlation_key: Option<String>,
        race: Option<String>,
    ) -> Uuid {
        let sub = Subscription {
            id: Uuid::now_v7(),
            instance_id,
            node_id: node_id.to_string(),
            kind,
            name: name.to_string(),
            correlation_key,
            race,
            state: SubscriptionState::Active,
            created_at: Utc::now(),
        };
        let id = sub.id;
        self.write().insert(sub);
        tracing::debug!(
            instance_id = %instance_id,
            node_id,
            kind = ?kind,
            name,
            subscription_id = %id,
            "subscription registered"
        );
        id
    }

    pub fn subscribe_message(
        &self,
        instance_id: Uuid,
        node_id: &str,
        message_name: &str,
        correlation_key: Option<String>,
        race: Option<String>,
    ) -> Uuid {
        self.subscribe(
            SubscriptionKind::Message,
            instance_id,
            node_id,
            message_name,
            correlation_key,
            race,
        )
    }

    pub fn subscribe_signal(
        &self,
        instance_id: Uuid,
        node_id: &str,
        signal_name: &str,
        race: Option<String>,
    ) -> Uuid {
        self.subscribe(
            SubscriptionKind::Signal,
            instance_id,
            node_id,
            signal_name,
            None,
            race,
        )
    }

    /// Deactivate a subscription. Returns `false` if it was unknown or already inactive.
    pub fn cancel_subscription(&self, subscription_id: Uuid) -> bool {
        self.write().deactivate(subscription_id)
    }

    /// Active subscription by id.
    pub fn subscription(&self, subscription_id: Uuid) -> Option<Subscription> {
        self.read()
            .subscriptions
            .get(&subscription_id)
            .filter(|s| s.is_active())
            .cloned()
    }

    pub fn active_subscriptions(&self, kind: SubscriptionKind, name: &str) -> Vec<Subscription> {
        let state = self.read();
        state
            .by_name
            .get(&(kind, name.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| state.subscriptions.get(id))
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    pub fn subscriptions_for_instance(&self, instance_id: Uuid) -> Vec<Subscription> {
        let state = self.read();
        let mut subs: Vec<Subscription> = state
            .by_instance
            .get(&instance_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.subscriptions.get(id))
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        subs
    }

    // ── Publishing ──

    /// Deliver a message to every active subscription with this name whose
    /// correlation key matches. Returns the number of successful deliveries.
    pub async fn publish_message(
        &self,
        message_name: &str,
        correlation_key: Option<&str>,
        variables: Variables,
    ) -> usize {
        let claimed = self
            .write()
            .claim(SubscriptionKind::Message, message_name, |sub| {
                match sub.correlation_key.as_deref() {
                    None => true,
                    Some(key) => correlation_key == Some(key),
                }
            });
        tracing::debug!(
            message_name,
            correlation_key = correlation_key.unwrap_or_default(),
            matched = claimed.len(),
            "message published"
        );
        self.deliver(claimed, variables).await
    }

    /// Broadcast a signal to every active subscription with this name, except
    /// those owned by `source_instance`.
    pub async fn publish_signal(
        &self,
        signal_name: &str,
        variables: Variables,
        source_instance: Option<Uuid>,
    ) -> usize {
        let claimed = self
            .write()
            .claim(SubscriptionKind::Signal, signal_name, |sub| {
                Some(sub.instance_id) != source_instance
            });
        tracing::debug!(
            signal_name,
            matched = claimed.len(),
            "signal published"
        );
        self.deliver(claimed, variables).await
    }

    async fn deliver(&self, claimed: Vec<Subscription>, variables: Variables) -> usize {
        if claimed.is_empty() {
            return 0;
        }
        let Some(sink) = self.sink() else {
            tracing::warn!(
                count = claimed.len(),
                "no sink attached; releasing claimed subscriptions"
            );
            for sub in &claimed {
                self.settle(sub.id, false);
            }
            return 0;
        };

        let mut delivered = 0;
        for sub in claimed {
            let outcome = sink
                .on_trigger_fired(sub.instance_id, &sub.node_id, variables.clone())
                .await;
            let advanced = match outcome {
                Ok(advanced) => advanced,
                Err(e) => {
                    tracing::warn!(
                        instance_id = %sub.instance_id,
                        node_id = %sub.node_id,
                        subscription_id = %sub.id,
                        error = %e,
                        "trigger delivery failed"
                    );
                    false
                }
            };
            self.settle(sub.id, advanced);
            if advanced {
                delivered += 1;
            }
        }
        delivered
    }

    fn settle(&self, subscription_id: Uuid, delivered: bool) {
        let mut state = self.write();
        if let Some(sub) = state.subscriptions.get_mut(&subscription_id) {
            if sub.state == SubscriptionState::Delivering {
                sub.state = if delivered {
                    SubscriptionState::Inactive
                } else {
                    SubscriptionState::Active
                };
            }
        }
    }

    // ── Bulk cancellation ──

    /// Deactivate every subscription and cancel every timer of an instance.
    pub fn cancel_all_for_instance(&self, instance_id: Uuid) -> usize {
        self.cancel_where(instance_id, |_, _| true)
    }

    /// Cancel the remaining arms of an event-based gateway race.
    pub fn cancel_race(&self, instance_id: Uuid, race: &str) -> usize {
        self.cancel_where(instance_id, |_, r| r == Some(race))
    }

    /// Cancel the triggers a node armed outside any race.
    pub fn cancel_node(&self, instance_id: Uuid, node_id: &str) -> usize {
        self.cancel_where(instance_id, |n, r| n == node_id && r.is_none())
    }

    fn cancel_where(
        &self,
        instance_id: Uuid,
        filter: impl Fn(&str, Option<&str>) -> bool,
    ) -> usize {
        let mut state = self.write();
        let sub_ids: Vec<Uuid> = state
            .by_instance
            .get(&instance_id)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        let mut cancelled = 0;
        for id in sub_ids {
            let matches = state
                .subscriptions
                .get(&id)
                .is_some_and(|s| filter(&s.node_id, s.race.as_deref()));
            if matches && state.deactivate(id) {
                cancelled += 1;
            }
        }
        for pending in state.take_timers(|t| {
            t.instance_id == instance_id && filter(&t.node_id, t.race.as_deref())
        }) {
            pending.task.abort();
            cancelled += 1;
        }
        cancelled
    }

    // ── Compaction ──

    /// Physically drop inactive subscriptions. Claimed ones are left alone.
    pub fn compact(&self) -> usize {
        let mut state = self.write();
        let inactive: Vec<Uuid> = state
            .subscriptions
            .values()
            .filter(|s| s.state == SubscriptionState::Inactive)
            .map(|s| s.id)
            .collect();
        for id in &inactive {
            state.remove(*id);
        }
        inactive.len()
    }

    /// Number of stored subscriptions, inactive ones included.
    pub fn subscription_count(&self) -> usize {
        self.read().subscriptions.len()
    }

    /// Run `compact` every `interval` until `shutdown` flips to true or the
    /// registry is dropped.
    pub fn spawn_compactor(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.compact();
                if removed > 0 {
                    tracing::debug!(removed, "compacted inactive subscriptions");
                }
            }
            tracing::debug!("trigger compactor stopped");
        })
    }
}
