//! Automatic reconnect: backoff cycle driven by connection-lost events.
//!
//! The controller owns its delay state and sees the client only through a
//! narrow handle, so nothing here can reach into session internals.

use crate::core::error::MqttResult;
use crate::core::time::Clock;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// The slice of the client the reconnect cycle is allowed to touch.
pub(crate) trait ReconnectTarget: Send + Sync + 'static {
    fn automatic_reconnect(&self) -> bool;
    fn max_reconnect_delay(&self) -> Duration;
    /// One full reconnect attempt: handshake, replay, buffer drain.
    fn reconnect(&self) -> Pin<Box<dyn Future<Output = MqttResult<()>> + Send + '_>>;
}

/// Signal from the comms teardown path.
pub(crate) struct ConnectionLostEvent;

/// Run the reconnect cycle until the event channel closes. Each lost
/// connection starts a fresh cycle: sleep, attempt, double the delay on
/// failure up to the configured cap.
pub(crate) fn spawn<C: Clock>(
    clock: C,
    target: Arc<dyn ReconnectTarget>,
    mut lost_events: mpsc::UnboundedReceiver<ConnectionLostEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while lost_events.recv().await.is_some() {
            if !target.automatic_reconnect() {
                continue;
            }
            let mut delay = INITIAL_DELAY;
            loop {
                debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect attempt");
                clock.sleep(delay).await;
                match target.reconnect().await {
                    Ok(()) => {
                        info!("automatic reconnect succeeded");
                        // Absorb events raised while this cycle was running.
                        while lost_events.try_recv().is_ok() {}
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "reconnect attempt failed");
                        delay = (delay * 2).min(target.max_reconnect_delay());
                    }
                }
            }
        }
    })
}
