//! A minimal virtual actor runtime and a demo actor on top of it.
//!
//! Actors are addressed by an opaque [`ActorId`] and activated on first use;
//! the runtime runs each activation off its own mailbox, so no two hooks of
//! the same instance ever execute concurrently. Per-instance state lives
//! behind a [`StateStore`], and reminders registered through the
//! [`ActorContext`] are persisted there too, surviving deactivation. See
//! [`echo`] for the demo actor and [`client`] for the driver loop.

pub mod actor_context;
pub mod actor_id;
pub mod actor_ref;
pub mod client;
pub mod config;
pub mod echo;
pub mod runtime;
pub mod scheduler;
pub mod state;

pub use actor_context::ActorContext;
pub use actor_id::ActorId;
pub use actor_ref::ActorRef;
pub use runtime::ActorRuntime;
pub use scheduler::ReminderFired;
pub use state::{MemoryStore, StateAccessor, StateStore};

use async_trait::async_trait;
use std::fmt::{self, Display};
use thiserror::Error;

/// Errors actor hooks can fail with. [`ActorRef::ask`] hands them back to the
/// caller; for one-way messages they are logged by the runtime.
#[derive(Debug, Error)]
pub enum ActorError {
    /// State access failed.
    #[error("state access failed")]
    State(#[from] state::Error),
    /// A reminder registration failed.
    #[error("scheduling failed")]
    Scheduler(#[from] scheduler::Error),
}

/// The behavior of a virtual actor.
///
/// One value of the implementing type exists per activated instance. The
/// runtime activates instances on demand and guarantees turn-based execution:
/// each hook runs to completion before the next one starts.
#[async_trait]
pub trait Actor: Sized + Send + 'static {
    /// The messages this actor understands, i.e. its wire-visible contract.
    type Msg: Send + 'static;

    /// Name under which instances of this type are addressed; also namespaces
    /// their state keys. Must not contain slashes.
    const KIND: &'static str;

    /// Build the instance for `ctx.id()`, e.g. by loading persisted state.
    async fn activate(ctx: &ActorContext<Self::Msg>) -> Result<Self, ActorError>;

    /// Handle one message within the instance's single-threaded turn.
    async fn receive(
        &mut self,
        ctx: &ActorContext<Self::Msg>,
        msg: Self::Msg,
    ) -> Result<(), ActorError>;

    /// Handle a fired reminder. The default does nothing.
    async fn receive_reminder(
        &mut self,
        ctx: &ActorContext<Self::Msg>,
        reminder: ReminderFired,
    ) -> Result<(), ActorError> {
        let _ = (ctx, reminder);
        Ok(())
    }

    /// Called before the instance is evicted, e.g. to flush state. The
    /// default does nothing.
    async fn deactivate(&mut self, ctx: &ActorContext<Self::Msg>) -> Result<(), ActorError> {
        let _ = ctx;
        Ok(())
    }
}

/// What an activation's mailbox carries: user messages or runtime signals.
pub(crate) enum MsgOrSignal<M> {
    Msg(M),
    Reminder(ReminderFired),
    Stop,
}

/// Fully qualified instance key: actor kind plus instance ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ActorKey {
    pub kind: &'static str,
    pub id: ActorId,
}

impl ActorKey {
    pub fn new<A: Actor>(id: ActorId) -> Self {
        Self { kind: A::KIND, id }
    }

    pub fn state_prefix(&self) -> String {
        format!("{}/{}/", self.kind, self.id)
    }

    pub fn reminder_prefix(&self) -> String {
        format!("reminders/{}/{}/", self.kind, self.id)
    }
}

impl Display for ActorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}
