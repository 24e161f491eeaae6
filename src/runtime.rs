use crate::{
    actor_context::ActorContext,
    actor_ref::ActorRef,
    config::CONFIG,
    scheduler::{Deliver, ReminderFired, Scheduler},
    state::{StateAccessor, StateStore},
    Actor, ActorError, ActorId, ActorKey, MsgOrSignal,
};
use futures::{future::BoxFuture, FutureExt};
use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task, time,
};
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
/// Errors for this module.
pub enum Error {
    /// The kind was never registered with this runtime.
    #[error("actor kind {kind} is not registered")]
    KindNotRegistered { kind: &'static str },
    /// The kind was registered twice.
    #[error("actor kind {kind} is already registered")]
    KindAlreadyRegistered { kind: &'static str },
    /// Reminder recovery during kind registration failed.
    #[error("cannot recover reminders for actor kind {kind}")]
    RecoverReminders {
        kind: &'static str,
        source: crate::scheduler::Error,
    },
    /// The activation under this key belongs to a different actor type.
    #[error("activation {key} is not of the requested type")]
    WrongType { key: String },
}

/// Hosts virtual actors: activation on demand, one mailbox task per
/// activation (turn-based execution), idle deactivation, durable reminders.
#[derive(Clone)]
pub struct ActorRuntime {
    inner: Arc<RuntimeInner>,
}

impl ActorRuntime {
    /// Create a runtime over the given state backend.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_idle_timeout(store, CONFIG.idle_timeout)
    }

    /// Like [`ActorRuntime::new`], with a custom idle deactivation timeout:
    /// an activation that receives nothing for this long is evicted.
    pub fn with_idle_timeout(store: Arc<dyn StateStore>, idle_timeout: Duration) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| {
            let deliver: Deliver = {
                let weak = weak.clone();
                Arc::new(move |kind, id, fired| {
                    let weak = weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            RuntimeInner::deliver_reminder(&inner, kind, id, fired).await;
                        }
                    }
                    .boxed()
                })
            };
            RuntimeInner {
                kinds: Mutex::new(HashMap::new()),
                activations: Mutex::new(HashMap::new()),
                store: store.clone(),
                scheduler: Scheduler::new(store.clone(), deliver),
                idle_timeout,
            }
        });
        Self { inner }
    }

    /// Make an actor kind known to the runtime and re-arm its persisted
    /// reminders.
    pub async fn register<A: Actor>(&self) -> Result<(), Error> {
        {
            let mut kinds = self.inner.lock_kinds();
            if kinds.contains_key(A::KIND) {
                return Err(Error::KindAlreadyRegistered { kind: A::KIND });
            }
            kinds.insert(
                A::KIND,
                Kind {
                    deliver: Arc::new(|inner, id, fired| deliver_to::<A>(inner, id, fired).boxed()),
                },
            );
        }
        let recovered = self
            .inner
            .scheduler
            .recover(A::KIND)
            .await
            .map_err(|source| Error::RecoverReminders {
                kind: A::KIND,
                source,
            })?;
        if recovered > 0 {
            debug!("Re-armed {recovered} persisted reminders for actor kind {}", A::KIND);
        }
        Ok(())
    }

    /// Reference to the instance with the given ID, activating it if needed.
    /// The same ID always resolves to the same live activation.
    pub fn actor_ref<A: Actor>(&self, id: impl Into<ActorId>) -> Result<ActorRef<A::Msg>, Error> {
        RuntimeInner::activation::<A>(&self.inner, id.into())
    }

    /// Stop every activation and every armed reminder task. Activations get
    /// up to the configured drain timeout to finish their current turn and
    /// run their deactivation hook.
    pub async fn shutdown(&self) {
        self.inner.scheduler.shutdown();
        let activations: Vec<Activation> = {
            let mut activations = self.inner.lock_activations();
            activations.drain().map(|(_, activation)| activation).collect()
        };
        for activation in &activations {
            (activation.stop)();
        }
        for mut activation in activations {
            let drained = time::timeout(CONFIG.drain_timeout, async {
                while !*activation.stopped.borrow() {
                    if activation.stopped.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!("Activation did not stop within the drain timeout");
            }
        }
    }
}

struct Kind {
    deliver: Arc<
        dyn Fn(Arc<RuntimeInner>, ActorId, ReminderFired) -> BoxFuture<'static, ()> + Send + Sync,
    >,
}

struct Activation {
    actor_ref: Box<dyn Any + Send + Sync>,
    stop: Box<dyn Fn() + Send + Sync>,
    stopped: watch::Receiver<bool>,
}

struct RuntimeInner {
    kinds: Mutex<HashMap<&'static str, Kind>>,
    activations: Mutex<HashMap<ActorKey, Activation>>,
    store: Arc<dyn StateStore>,
    scheduler: Scheduler,
    idle_timeout: Duration,
}

impl RuntimeInner {
    fn activation<A: Actor>(inner: &Arc<Self>, id: ActorId) -> Result<ActorRef<A::Msg>, Error> {
        if !inner.lock_kinds().contains_key(A::KIND) {
            return Err(Error::KindNotRegistered { kind: A::KIND });
        }
        let key = ActorKey::new::<A>(id);
        let mut activations = inner.lock_activations();
        if let Some(activation) = activations.get(&key) {
            let actor_ref = activation
                .actor_ref
                .downcast_ref::<ActorRef<A::Msg>>()
                .ok_or_else(|| Error::WrongType {
                    key: key.to_string(),
                })?;
            return Ok(actor_ref.clone());
        }

        let (mailbox_in, mailbox_out) =
            mpsc::channel::<MsgOrSignal<A::Msg>>(CONFIG.default_mailbox_size);
        let (stopped_in, stopped_out) = watch::channel(false);
        let actor_ref = ActorRef::new(key.id.clone(), mailbox_in, stopped_out.clone());
        let ctx = ActorContext::new(
            key.clone(),
            actor_ref.clone(),
            StateAccessor::new(inner.store.clone(), key.state_prefix()),
            inner.scheduler.clone(),
        );
        let stop_ref = actor_ref.clone();
        activations.insert(
            key.clone(),
            Activation {
                actor_ref: Box::new(actor_ref.clone()),
                stop: Box::new(move || stop_ref.stop()),
                stopped: stopped_out,
            },
        );
        drop(activations);

        task::spawn(run_actor::<A>(
            inner.clone(),
            key,
            ctx,
            mailbox_out,
            stopped_in,
        ));
        Ok(actor_ref)
    }

    async fn deliver_reminder(
        inner: &Arc<Self>,
        kind: &'static str,
        id: ActorId,
        fired: ReminderFired,
    ) {
        let deliver = inner
            .lock_kinds()
            .get(kind)
            .map(|entry| entry.deliver.clone());
        match deliver {
            Some(deliver) => deliver(inner.clone(), id, fired).await,
            None => warn!("Dropping reminder {} for unregistered actor kind {kind}", fired.name),
        }
    }

    fn lock_kinds(&self) -> MutexGuard<'_, HashMap<&'static str, Kind>> {
        self.kinds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_activations(&self) -> MutexGuard<'_, HashMap<ActorKey, Activation>> {
        self.activations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_actor<A: Actor>(
    inner: Arc<RuntimeInner>,
    key: ActorKey,
    ctx: ActorContext<A::Msg>,
    mut mailbox: mpsc::Receiver<MsgOrSignal<A::Msg>>,
    stopped: watch::Sender<bool>,
) {
    debug!("Activating actor {key}");
    let mut actor = match A::activate(&ctx).await {
        Ok(actor) => actor,
        Err(e) => {
            error!("Cannot activate actor {key}: {e}");
            drop(mailbox);
            remove_if_closed::<A>(&inner, &key);
            let _ = stopped.send(true);
            return;
        }
    };

    let mut clean = true;
    let reason = loop {
        let msg = match time::timeout(inner.idle_timeout, mailbox.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break "all references dropped",
            Err(_) => break "idle",
        };
        match msg {
            MsgOrSignal::Stop => break "stopped",
            MsgOrSignal::Msg(msg) => {
                if !run_turn(&key, actor.receive(&ctx, msg)).await {
                    clean = false;
                    break "handler panicked";
                }
            }
            MsgOrSignal::Reminder(reminder) => {
                if !run_turn(&key, actor.receive_reminder(&ctx, reminder)).await {
                    clean = false;
                    break "handler panicked";
                }
            }
        }
    };

    debug!("Deactivating actor {key}: {reason}");
    if clean {
        match AssertUnwindSafe(actor.deactivate(&ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Deactivation hook for actor {key} failed: {e}"),
            Err(e) => error!("Deactivation hook for actor {key} panicked: {e:?}"),
        }
    }
    ctx.cancel_timers();
    // Closing the mailbox before dropping the registry entry keeps a racing
    // lookup from resurrecting a reference to this dying activation.
    drop(mailbox);
    remove_if_closed::<A>(&inner, &key);
    let _ = stopped.send(true);
}

async fn run_turn(
    key: &ActorKey,
    hook: impl Future<Output = Result<(), ActorError>>,
) -> bool {
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Handler for actor {key} failed: {e}");
            true
        }
        Err(e) => {
            error!("Stopping actor {key}, because handler panicked: {e:?}");
            false
        }
    }
}

async fn deliver_to<A: Actor>(inner: Arc<RuntimeInner>, id: ActorId, fired: ReminderFired) {
    let key = ActorKey::new::<A>(id.clone());
    for _ in 0..2 {
        let actor_ref = match RuntimeInner::activation::<A>(&inner, id.clone()) {
            Ok(actor_ref) => actor_ref,
            Err(e) => {
                error!("Cannot activate actor {key} for reminder {}: {e}", fired.name);
                return;
            }
        };
        if actor_ref.remind(fired.clone()).await.is_ok() {
            return;
        }
        // The registry entry was stale; drop it and try once more against a
        // fresh activation.
        remove_if_closed::<A>(&inner, &key);
    }
    warn!("Dropping reminder {} for actor {key}", fired.name);
}

/// Remove the registry entry for `key`, but only if its mailbox is already
/// closed: a live entry under the same key belongs to a newer activation.
fn remove_if_closed<A: Actor>(inner: &RuntimeInner, key: &ActorKey) {
    let mut activations = inner.lock_activations();
    if let Some(activation) = activations.get(key) {
        let closed = activation
            .actor_ref
            .downcast_ref::<ActorRef<A::Msg>>()
            .map(|actor_ref| actor_ref.mailbox.is_closed())
            .unwrap_or(true);
        if closed {
            activations.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use async_trait::async_trait;
    use tokio::{
        sync::oneshot,
        time::{sleep, timeout},
    };

    struct Probe {
        hits: i64,
    }

    enum ProbeMsg {
        Bump,
        SlowBump,
        Hits(oneshot::Sender<Result<i64, ActorError>>),
        ArmTimer {
            due: Duration,
            period: Duration,
        },
        ArmReminder {
            payload: i64,
            due: Duration,
            period: Duration,
            reply: oneshot::Sender<Result<(), ActorError>>,
        },
        DisarmReminder(oneshot::Sender<Result<(), ActorError>>),
    }

    #[async_trait]
    impl Actor for Probe {
        type Msg = ProbeMsg;

        const KIND: &'static str = "probe";

        async fn activate(ctx: &ActorContext<ProbeMsg>) -> Result<Self, ActorError> {
            let hits = ctx.state().get("hits").await?.unwrap_or(0);
            Ok(Self { hits })
        }

        async fn receive(
            &mut self,
            ctx: &ActorContext<ProbeMsg>,
            msg: ProbeMsg,
        ) -> Result<(), ActorError> {
            match msg {
                ProbeMsg::Bump => self.hits += 1,
                ProbeMsg::SlowBump => {
                    let hits = self.hits;
                    sleep(Duration::from_millis(2)).await;
                    self.hits = hits + 1;
                }
                ProbeMsg::Hits(reply) => {
                    let _ = reply.send(Ok(self.hits));
                }
                ProbeMsg::ArmTimer { due, period } => {
                    ctx.register_timer("tick", due, period, || ProbeMsg::Bump);
                }
                ProbeMsg::ArmReminder {
                    payload,
                    due,
                    period,
                    reply,
                } => {
                    let result = ctx.register_reminder("probe", &payload, due, period).await;
                    let _ = reply.send(result.map_err(ActorError::from));
                }
                ProbeMsg::DisarmReminder(reply) => {
                    let result = ctx.unregister_reminder("probe").await;
                    let _ = reply.send(result.map_err(ActorError::from));
                }
            }
            Ok(())
        }

        async fn receive_reminder(
            &mut self,
            ctx: &ActorContext<ProbeMsg>,
            reminder: ReminderFired,
        ) -> Result<(), ActorError> {
            self.hits += 1;
            let fires: i64 = ctx.state().get("fires").await?.unwrap_or(0);
            ctx.state().set("fires", &(fires + 1)).await?;
            ctx.state().set("last_state", &reminder.state).await?;
            Ok(())
        }

        async fn deactivate(&mut self, ctx: &ActorContext<ProbeMsg>) -> Result<(), ActorError> {
            ctx.state().set("hits", &self.hits).await?;
            Ok(())
        }
    }

    async fn probe_runtime(idle_timeout: Duration) -> (Arc<MemoryStore>, ActorRuntime) {
        let store = Arc::new(MemoryStore::default());
        let runtime = ActorRuntime::with_idle_timeout(store.clone(), idle_timeout);
        runtime.register::<Probe>().await.unwrap();
        (store, runtime)
    }

    async fn hits(actor_ref: &ActorRef<ProbeMsg>) -> i64 {
        actor_ref.ask(ProbeMsg::Hits).await.unwrap()
    }

    fn probe_state(store: &Arc<MemoryStore>) -> StateAccessor {
        StateAccessor::new(store.clone(), "probe/p1/".to_string())
    }

    #[tokio::test]
    async fn test_same_id_resolves_to_same_activation() {
        let (_store, runtime) = probe_runtime(Duration::from_secs(60)).await;

        let first = runtime.actor_ref::<Probe>("p1").unwrap();
        first.tell(ProbeMsg::Bump).await.unwrap();
        let second = runtime.actor_ref::<Probe>("p1").unwrap();
        second.tell(ProbeMsg::Bump).await.unwrap();
        assert_eq!(hits(&second).await, 2);

        let other = runtime.actor_ref::<Probe>("p2").unwrap();
        assert_eq!(hits(&other).await, 0);
    }

    #[tokio::test]
    async fn test_turns_are_serialized() {
        let (_store, runtime) = probe_runtime(Duration::from_secs(60)).await;
        let actor_ref = runtime.actor_ref::<Probe>("p1").unwrap();

        for _ in 0..32 {
            actor_ref.tell(ProbeMsg::SlowBump).await.unwrap();
        }
        assert_eq!(hits(&actor_ref).await, 32);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_rejected() {
        let runtime = ActorRuntime::new(Arc::new(MemoryStore::default()));
        let result = runtime.actor_ref::<Probe>("p1");
        assert!(matches!(result, Err(Error::KindNotRegistered { .. })));
    }

    #[tokio::test]
    async fn test_double_registration_is_rejected() {
        let (_store, runtime) = probe_runtime(Duration::from_secs(60)).await;
        let result = runtime.register::<Probe>().await;
        assert!(matches!(result, Err(Error::KindAlreadyRegistered { .. })));
    }

    #[tokio::test]
    async fn test_idle_deactivation_flushes_state() {
        let (_store, runtime) = probe_runtime(Duration::from_millis(50)).await;

        let actor_ref = runtime.actor_ref::<Probe>("p1").unwrap();
        actor_ref.tell(ProbeMsg::Bump).await.unwrap();
        timeout(Duration::from_secs(1), actor_ref.terminated())
            .await
            .unwrap();
        assert!(actor_ref.tell(ProbeMsg::Bump).await.is_err());

        // A fresh lookup re-activates and finds the flushed state.
        let actor_ref = runtime.actor_ref::<Probe>("p1").unwrap();
        assert_eq!(hits(&actor_ref).await, 1);
    }

    #[tokio::test]
    async fn test_timer_delivers_ticks() {
        let (_store, runtime) = probe_runtime(Duration::from_secs(60)).await;
        let actor_ref = runtime.actor_ref::<Probe>("p1").unwrap();

        actor_ref
            .tell(ProbeMsg::ArmTimer {
                due: Duration::from_millis(10),
                period: Duration::from_millis(15),
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(hits(&actor_ref).await >= 2);
    }

    #[tokio::test]
    async fn test_reminder_fires_with_payload() {
        let (store, runtime) = probe_runtime(Duration::from_secs(60)).await;
        let actor_ref = runtime.actor_ref::<Probe>("p1").unwrap();

        actor_ref
            .ask(|reply| ProbeMsg::ArmReminder {
                payload: 7,
                due: Duration::from_millis(10),
                period: Duration::from_millis(20),
                reply,
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(120)).await;
        assert!(hits(&actor_ref).await >= 2);
        assert_eq!(
            probe_state(&store).get::<i64>("last_state").await.unwrap(),
            Some(7)
        );
    }

    #[tokio::test]
    async fn test_reminder_reactivates_idle_actor() {
        let (store, runtime) = probe_runtime(Duration::from_millis(30)).await;
        let actor_ref = runtime.actor_ref::<Probe>("p1").unwrap();

        actor_ref
            .ask(|reply| ProbeMsg::ArmReminder {
                payload: 1,
                due: Duration::from_millis(150),
                period: Duration::from_millis(60),
                reply,
            })
            .await
            .unwrap();
        // The actor idles out well before the first fire.
        timeout(Duration::from_secs(1), actor_ref.terminated())
            .await
            .unwrap();

        sleep(Duration::from_millis(250)).await;
        let fires = probe_state(&store).get::<i64>("fires").await.unwrap();
        assert!(fires.unwrap_or(0) >= 1);
    }

    #[tokio::test]
    async fn test_reminders_recover_across_runtimes() {
        let (store, runtime) = probe_runtime(Duration::from_secs(60)).await;
        let actor_ref = runtime.actor_ref::<Probe>("p1").unwrap();
        actor_ref
            .ask(|reply| ProbeMsg::ArmReminder {
                payload: 3,
                due: Duration::from_millis(200),
                period: Duration::from_millis(60),
                reply,
            })
            .await
            .unwrap();
        runtime.shutdown().await;

        let runtime = ActorRuntime::new(store.clone() as Arc<dyn StateStore>);
        runtime.register::<Probe>().await.unwrap();
        sleep(Duration::from_millis(350)).await;
        let fires = probe_state(&store).get::<i64>("fires").await.unwrap();
        assert!(fires.unwrap_or(0) >= 1);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_reminder_stops_fires() {
        let (store, runtime) = probe_runtime(Duration::from_secs(60)).await;
        let actor_ref = runtime.actor_ref::<Probe>("p1").unwrap();

        actor_ref
            .ask(|reply| ProbeMsg::ArmReminder {
                payload: 1,
                due: Duration::from_millis(10),
                period: Duration::from_millis(25),
                reply,
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(80)).await;
        actor_ref.ask(ProbeMsg::DisarmReminder).await.unwrap();

        sleep(Duration::from_millis(50)).await;
        let fires = probe_state(&store).get::<i64>("fires").await.unwrap();
        sleep(Duration::from_millis(150)).await;
        assert_eq!(probe_state(&store).get::<i64>("fires").await.unwrap(), fires);
    }

    #[tokio::test]
    async fn test_shutdown_stops_activations() {
        let (_store, runtime) = probe_runtime(Duration::from_secs(60)).await;
        let actor_ref = runtime.actor_ref::<Probe>("p1").unwrap();
        actor_ref.tell(ProbeMsg::Bump).await.unwrap();

        runtime.shutdown().await;
        assert!(actor_ref.tell(ProbeMsg::Bump).await.is_err());
    }
}
