use crate::{ActorError, ActorId, MsgOrSignal};
use std::fmt::{self, Debug};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Error)]
/// Errors for this module.
pub enum Error {
    /// The target activation is gone and its mailbox closed.
    #[error("actor {id} is not running")]
    MailboxClosed { id: ActorId },
    /// The actor dropped the reply channel without answering.
    #[error("actor {id} did not reply")]
    NoReply { id: ActorId },
    /// The actor answered the call with a failure of its own.
    #[error("call to actor {id} failed")]
    Call { id: ActorId, source: ActorError },
}

/// A shareable reference to one activation, allowing to access its ID and
/// send messages to it.
///
/// A reference does not pin its activation: after an idle deactivation it
/// fails with [`Error::MailboxClosed`] and a fresh lookup through the runtime
/// re-activates the instance.
pub struct ActorRef<M> {
    id: ActorId,
    pub(crate) mailbox: mpsc::Sender<MsgOrSignal<M>>,
    pub(crate) stopped: watch::Receiver<bool>,
}

impl<M> ActorRef<M>
where
    M: Send + 'static,
{
    /// The ID of the actor instance represented by this `ActorRef`.
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// Send a message without waiting for an answer.
    pub async fn tell(&self, msg: M) -> Result<(), Error> {
        self.mailbox
            .send(MsgOrSignal::Msg(msg))
            .await
            .map_err(|_| Error::MailboxClosed {
                id: self.id.clone(),
            })
    }

    /// Send the message built around a fresh reply channel and await the
    /// answer, e.g. `actor_ref.ask(|reply| Msg::Get { reply })`.
    pub async fn ask<R, F>(&self, make_msg: F) -> Result<R, Error>
    where
        R: Send + 'static,
        F: FnOnce(oneshot::Sender<Result<R, ActorError>>) -> M,
    {
        let (reply_in, reply_out) = oneshot::channel();
        self.mailbox
            .send(MsgOrSignal::Msg(make_msg(reply_in)))
            .await
            .map_err(|_| Error::MailboxClosed {
                id: self.id.clone(),
            })?;
        match reply_out.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(Error::Call {
                id: self.id.clone(),
                source,
            }),
            Err(_) => Err(Error::NoReply {
                id: self.id.clone(),
            }),
        }
    }

    /// Completes once the activation behind this reference has stopped.
    pub async fn terminated(&self) {
        let mut stopped = self.stopped.clone();
        while !*stopped.borrow() {
            if stopped.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn new(
        id: ActorId,
        mailbox: mpsc::Sender<MsgOrSignal<M>>,
        stopped: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            mailbox,
            stopped,
        }
    }

    pub(crate) async fn remind(&self, reminder: crate::ReminderFired) -> Result<(), Error> {
        self.mailbox
            .send(MsgOrSignal::Reminder(reminder))
            .await
            .map_err(|_| Error::MailboxClosed {
                id: self.id.clone(),
            })
    }

    /// Ask the activation to stop. Best effort: a full mailbox drops the
    /// signal and the caller falls back to its drain timeout.
    pub(crate) fn stop(&self) {
        let _ = self.mailbox.try_send(MsgOrSignal::Stop);
    }
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            mailbox: self.mailbox.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<M> Debug for ActorRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef").field("id", &self.id).finish()
    }
}
