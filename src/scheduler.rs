use crate::{
    actor_id::ActorId,
    state::{self, StateStore},
    ActorKey,
};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    task::{self, JoinHandle},
    time,
};
use tracing::{debug, warn};

#[derive(Debug, Error)]
/// Errors for this module.
pub enum Error {
    /// The reminder's state payload could not be encoded.
    #[error("cannot encode state of reminder {name}")]
    Encode {
        name: String,
        source: serde_json::Error,
    },
    /// The backing store rejected the registration change.
    #[error("cannot persist reminder {name}")]
    Persist { name: String, source: state::Error },
    /// Loading persisted registrations failed.
    #[error("cannot load persisted reminders for actor kind {kind}")]
    Recover {
        kind: &'static str,
        source: state::Error,
    },
}

/// A reminder delivery, as passed to `Actor::receive_reminder`.
#[derive(Debug, Clone)]
pub struct ReminderFired {
    /// Name given at registration.
    pub name: String,
    /// State payload given at registration.
    pub state: Value,
    /// Due time given at registration.
    pub due: Duration,
    /// Period given at registration.
    pub period: Duration,
}

/// Durable registration, kept in the state store until unregistered.
#[derive(Debug, Serialize, Deserialize)]
struct ReminderRecord {
    name: String,
    state: Value,
    due: Duration,
    period: Duration,
}

pub(crate) type Deliver =
    Arc<dyn Fn(&'static str, ActorId, ReminderFired) -> BoxFuture<'static, ()> + Send + Sync>;

/// Arms reminder tasks and keeps their registrations durable. Registrations
/// outlive activations: firing a reminder for a deactivated actor goes
/// through the runtime's delivery hook, which re-activates it.
#[derive(Clone)]
pub(crate) struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Arc<dyn StateStore>,
    deliver: Deliver,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(store: Arc<dyn StateStore>, deliver: Deliver) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                deliver,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Persist and arm a reminder: first fire after `due`, then every
    /// `period`; a zero period fires once. Re-registering under the same name
    /// replaces the earlier registration.
    pub(crate) async fn register<T>(
        &self,
        key: &ActorKey,
        name: &str,
        state: &T,
        due: Duration,
        period: Duration,
    ) -> Result<(), Error>
    where
        T: Serialize + Sync,
    {
        let state = serde_json::to_value(state).map_err(|source| Error::Encode {
            name: name.to_string(),
            source,
        })?;
        let record = ReminderRecord {
            name: name.to_string(),
            state,
            due,
            period,
        };
        let value = serde_json::to_value(&record).map_err(|source| Error::Encode {
            name: name.to_string(),
            source,
        })?;
        let store_key = format!("{}{name}", key.reminder_prefix());
        self.inner
            .store
            .set(&store_key, value)
            .await
            .map_err(|source| Error::Persist {
                name: name.to_string(),
                source,
            })?;
        debug!("Registered reminder {name} for actor {key}");
        self.arm(key.kind, key.id.clone(), store_key, record);
        Ok(())
    }

    /// Drop the registration and stop future fires. Unknown names are not an
    /// error.
    pub(crate) async fn unregister(&self, key: &ActorKey, name: &str) -> Result<(), Error> {
        let store_key = format!("{}{name}", key.reminder_prefix());
        self.inner
            .store
            .remove(&store_key)
            .await
            .map_err(|source| Error::Persist {
                name: name.to_string(),
                source,
            })?;
        if let Some(task) = self.lock_tasks().remove(&store_key) {
            task.abort();
        }
        debug!("Unregistered reminder {name} for actor {key}");
        Ok(())
    }

    /// Re-arm whatever registrations the store still holds for `kind`,
    /// returning how many. Recovered reminders measure their due time from
    /// recovery, not from the original registration.
    pub(crate) async fn recover(&self, kind: &'static str) -> Result<usize, Error> {
        let prefix = format!("reminders/{kind}/");
        let entries = self
            .inner
            .store
            .list(&prefix)
            .await
            .map_err(|source| Error::Recover { kind, source })?;
        let mut recovered = 0;
        for (store_key, value) in entries {
            let record = match serde_json::from_value::<ReminderRecord>(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping undecodable reminder record under {store_key}: {e}");
                    continue;
                }
            };
            // Key layout is reminders/{kind}/{id}/{name}.
            let Some(id) = store_key
                .strip_prefix(&prefix)
                .and_then(|rest| rest.split_once('/'))
                .map(|(id, _)| ActorId::from(id))
            else {
                warn!("Skipping reminder record under malformed key {store_key}");
                continue;
            };
            self.arm(kind, id, store_key, record);
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Abort every armed task. Registrations stay in the store for the next
    /// recovery.
    pub(crate) fn shutdown(&self) {
        for (_, task) in self.lock_tasks().drain() {
            task.abort();
        }
    }

    fn arm(&self, kind: &'static str, id: ActorId, store_key: String, record: ReminderRecord) {
        let deliver = self.inner.deliver.clone();
        let handle = task::spawn(async move {
            time::sleep(record.due).await;
            loop {
                let fired = ReminderFired {
                    name: record.name.clone(),
                    state: record.state.clone(),
                    due: record.due,
                    period: record.period,
                };
                deliver(kind, id.clone(), fired).await;
                if record.period.is_zero() {
                    break;
                }
                time::sleep(record.period).await;
            }
        });
        if let Some(previous) = self.lock_tasks().insert(store_key, handle) {
            previous.abort();
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
