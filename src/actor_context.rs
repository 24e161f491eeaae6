use crate::{
    actor_id::ActorId,
    actor_ref::ActorRef,
    scheduler::{self, Scheduler},
    state::StateAccessor,
    ActorKey,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    task::{self, JoinHandle},
    time,
};
use tracing::debug;

/// Contextual methods for a given actor, provided as hook parameter.
pub struct ActorContext<M> {
    key: ActorKey,
    self_ref: ActorRef<M>,
    state: StateAccessor,
    scheduler: Scheduler,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl<M> ActorContext<M>
where
    M: Send + 'static,
{
    /// The ID of the instance this context belongs to.
    pub fn id(&self) -> &ActorId {
        &self.key.id
    }

    /// The reference for the actor itself.
    pub fn self_ref(&self) -> &ActorRef<M> {
        &self.self_ref
    }

    /// This instance's private slice of the state store.
    pub fn state(&self) -> &StateAccessor {
        &self.state
    }

    /// Register a timer: after `due`, and then every `period`, the message
    /// built by `tick` is delivered through the regular mailbox, so timer
    /// callbacks obey the same turn-based ordering as every other message.
    /// Timers live only as long as the activation; a zero period fires once.
    /// Re-registering a name replaces the earlier timer.
    pub fn register_timer<F>(&self, name: &str, due: Duration, period: Duration, tick: F)
    where
        F: Fn() -> M + Send + 'static,
    {
        let self_ref = self.self_ref.clone();
        let handle = task::spawn(async move {
            time::sleep(due).await;
            loop {
                if self_ref.tell(tick()).await.is_err() {
                    break;
                }
                if period.is_zero() {
                    break;
                }
                time::sleep(period).await;
            }
        });
        debug!("Registered timer {name} for actor {}", self.key);
        if let Some(previous) = self.lock_timers().insert(name.to_string(), handle) {
            previous.abort();
        }
    }

    /// Cancel a timer. Unknown names are ignored.
    pub fn unregister_timer(&self, name: &str) {
        if let Some(timer) = self.lock_timers().remove(name) {
            timer.abort();
        }
    }

    /// Register a durable reminder: first fire after `due`, then every
    /// `period`; a zero period fires once. Completes once the registration is
    /// persisted and armed. Unlike timers, reminders outlive the activation
    /// and re-activate the actor when they fire.
    pub async fn register_reminder<T>(
        &self,
        name: &str,
        state: &T,
        due: Duration,
        period: Duration,
    ) -> Result<(), scheduler::Error>
    where
        T: Serialize + Sync,
    {
        self.scheduler
            .register(&self.key, name, state, due, period)
            .await
    }

    /// Remove a reminder registration and stop future fires.
    pub async fn unregister_reminder(&self, name: &str) -> Result<(), scheduler::Error> {
        self.scheduler.unregister(&self.key, name).await
    }

    pub(crate) fn new(
        key: ActorKey,
        self_ref: ActorRef<M>,
        state: StateAccessor,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            key,
            self_ref,
            state,
            scheduler,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn cancel_timers(&self) {
        for (_, timer) in self.lock_timers().drain() {
            timer.abort();
        }
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
