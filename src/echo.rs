use crate::{
    actor_ref::{self, ActorRef},
    Actor, ActorContext, ActorError, ActorId, ReminderFired,
};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::info;

/// Wire format of the timestamps [`EchoMsg::Say`] replies with.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const LAST_MESSAGE_KEY: &str = "lastmessage";
const COUNTER_KEY: &str = "counter";
const CLOCK_TIMER: &str = "clock";
const TIMER_DUE: Duration = Duration::from_secs(2);
const TIMER_PERIOD: Duration = Duration::from_secs(1);
const REMINDER_NAME: &str = "myremind";
const REMINDER_DUE: Duration = Duration::from_secs(5);
const REMINDER_PERIOD: Duration = Duration::from_secs(2);

/// The echo actor's method contract; replies travel on the embedded
/// channels.
pub enum EchoMsg {
    /// Echo `text`: log it, persist it as the last message, reply with the
    /// formatted current UTC time.
    Say {
        text: String,
        reply: oneshot::Sender<Result<String, ActorError>>,
    },
    /// Add `delta` to the persistent counter and reply with the new value.
    IncrementAndGet {
        delta: i64,
        reply: oneshot::Sender<Result<i64, ActorError>>,
    },
    /// Timer callback: log `message` with the current time. No state change.
    Clock { message: String },
    /// Arm the clock timer with `state` as its tick message; replies once the
    /// timer is armed.
    RegisterTimer {
        state: String,
        reply: oneshot::Sender<Result<(), ActorError>>,
    },
    /// Arm the durable reminder with `index` as its payload; replies once the
    /// registration is persisted.
    RegisterReminder {
        index: i64,
        reply: oneshot::Sender<Result<(), ActorError>>,
    },
}

/// Holds no in-process state: the counter and the last message live in the
/// state store.
pub struct EchoActor;

#[async_trait]
impl Actor for EchoActor {
    type Msg = EchoMsg;

    const KIND: &'static str = "echo";

    async fn activate(_ctx: &ActorContext<EchoMsg>) -> Result<Self, ActorError> {
        Ok(Self)
    }

    async fn receive(
        &mut self,
        ctx: &ActorContext<EchoMsg>,
        msg: EchoMsg,
    ) -> Result<(), ActorError> {
        match msg {
            EchoMsg::Say { text, reply } => {
                let _ = reply.send(self.say(ctx, text).await);
            }
            EchoMsg::IncrementAndGet { delta, reply } => {
                let _ = reply.send(self.increment_and_get(ctx, delta).await);
            }
            EchoMsg::Clock { message } => {
                info!(
                    "Timer triggered with state {message} for actor {} @ {}",
                    ctx.id(),
                    utc_now_string()
                );
            }
            EchoMsg::RegisterTimer { state, reply } => {
                ctx.register_timer(CLOCK_TIMER, TIMER_DUE, TIMER_PERIOD, move || {
                    EchoMsg::Clock {
                        message: state.clone(),
                    }
                });
                let _ = reply.send(Ok(()));
            }
            EchoMsg::RegisterReminder { index, reply } => {
                let result = ctx
                    .register_reminder(REMINDER_NAME, &index, REMINDER_DUE, REMINDER_PERIOD)
                    .await;
                let _ = reply.send(result.map_err(ActorError::from));
            }
        }
        Ok(())
    }

    async fn receive_reminder(
        &mut self,
        ctx: &ActorContext<EchoMsg>,
        reminder: ReminderFired,
    ) -> Result<(), ActorError> {
        info!(
            "Reminder {} with state {{{}}} triggered for actor {} @ {}",
            reminder.name,
            reminder.state,
            ctx.id(),
            utc_now_string()
        );
        Ok(())
    }
}

impl EchoActor {
    async fn say(&self, ctx: &ActorContext<EchoMsg>, text: String) -> Result<String, ActorError> {
        let now = utc_now_string();
        info!("Say for actor {}: {text} @ {now}", ctx.id());
        ctx.state().set(LAST_MESSAGE_KEY, &text).await?;
        Ok(now)
    }

    async fn increment_and_get(
        &self,
        ctx: &ActorContext<EchoMsg>,
        delta: i64,
    ) -> Result<i64, ActorError> {
        let counter: i64 = ctx.state().get(COUNTER_KEY).await?.unwrap_or(0);
        let counter = counter + delta;
        ctx.state().set(COUNTER_KEY, &counter).await?;
        Ok(counter)
    }
}

fn utc_now_string() -> String {
    Utc::now().format(TIME_FORMAT).to_string()
}

/// Typed client for [`EchoMsg`] — the contract the way a remote caller sees
/// it.
#[derive(Clone)]
pub struct EchoClient {
    actor_ref: ActorRef<EchoMsg>,
}

impl EchoClient {
    pub fn new(actor_ref: ActorRef<EchoMsg>) -> Self {
        Self { actor_ref }
    }

    pub fn id(&self) -> &ActorId {
        self.actor_ref.id()
    }

    /// Echo `text`, getting back the formatted time the actor saw it.
    pub async fn say(&self, text: impl Into<String>) -> Result<String, actor_ref::Error> {
        let text = text.into();
        self.actor_ref.ask(|reply| EchoMsg::Say { text, reply }).await
    }

    /// Add `delta` to the persistent counter, getting back the new value.
    pub async fn increment_and_get(&self, delta: i64) -> Result<i64, actor_ref::Error> {
        self.actor_ref
            .ask(|reply| EchoMsg::IncrementAndGet { delta, reply })
            .await
    }

    /// Arm the clock timer; completes once the timer is armed.
    pub async fn register_timer(&self, state: impl Into<String>) -> Result<(), actor_ref::Error> {
        let state = state.into();
        self.actor_ref
            .ask(|reply| EchoMsg::RegisterTimer { state, reply })
            .await
    }

    /// Arm the durable reminder; completes once the registration is
    /// persisted and armed.
    pub async fn register_reminder(&self, index: i64) -> Result<(), actor_ref::Error> {
        self.actor_ref
            .ask(|reply| EchoMsg::RegisterReminder { index, reply })
            .await
    }
}
