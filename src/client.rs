use crate::{actor_ref, echo::EchoClient};
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
/// Errors for this module.
pub enum Error {
    /// A call into the actor failed; the loop does not retry.
    #[error("echo call for client {index} failed")]
    Call {
        index: usize,
        source: actor_ref::Error,
    },
}

/// Drive the echo actor until `shutdown` is cancelled: register the reminder
/// and the timer once, then keep incrementing the counter, echoing a message
/// built from the new value and sleeping up to a second between iterations.
/// Cancellation is cooperative: it is observed during the sleep or at the top
/// of the next iteration, and no further calls are made afterwards.
pub async fn call_actor_forever(
    client: EchoClient,
    index: usize,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let call = |source| Error::Call { index, source };

    // One-shot setup: first the reminder, then the timer.
    client.register_reminder(index as i64).await.map_err(call)?;
    client
        .register_timer(format!("ping! {{{index}}} "))
        .await
        .map_err(call)?;

    while !shutdown.is_cancelled() {
        let message_number = client.increment_and_get(1).await.map_err(call)?;
        let message = format!(
            "Message #{message_number} received from actor at index {index} with ID {}",
            client.id()
        );
        let reply = client.say(message).await.map_err(call)?;
        info!(
            "Reply {reply} received from actor at index {index} with ID {}",
            client.id()
        );

        let pause = Duration::from_millis(rand::rng().random_range(0..1000));
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = time::sleep(pause) => {}
        }
    }
    Ok(())
}
