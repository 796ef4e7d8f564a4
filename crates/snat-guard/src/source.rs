//! Container event feeds.
//!
//! An [`EventSource`] hands out one [`EventSubscription`]: a forwarding task
//! that reads the runtime's feed and pushes [`ContainerEvent`]s into a
//! bounded channel, in arrival order. The task stops when the cancellation
//! token fires, when the feed ends or fails, or when the subscription is
//! dropped.
//!
//! ```text
//! Docker /events ──► forwarder task ──mpsc──► EventSubscription::next()
//!                          ▲
//!                  CancellationToken
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SnatGuardError;
use crate::event::ContainerEvent;

/// Item carried by a subscription. An `Err` is the last item before the feed closes.
pub type EventItem = Result<ContainerEvent, SnatGuardError>;

/// Source of container lifecycle events.
pub trait EventSource: Send + Sync + 'static {
    /// Starts the feed. The forwarder stops when `cancel` fires.
    fn subscribe(&mut self, cancel: CancellationToken) -> Result<EventSubscription, SnatGuardError>;
}

/// Live feed of container events owned by one consumer.
///
/// Dropping the subscription aborts its forwarding task.
pub struct EventSubscription {
    rx: mpsc::Receiver<EventItem>,
    task: Option<JoinHandle<()>>,
}

impl EventSubscription {
    fn new(rx: mpsc::Receiver<EventItem>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Waits for the next event. `None` once the feed has closed.
    pub async fn next(&mut self) -> Option<EventItem> {
        self.rx.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Feed from the Docker daemon's `/events` endpoint, filtered to container
/// `start` and `die`.
///
/// The request asks for events since the time `subscribe` was called, so
/// events that happen before the HTTP stream is connected are replayed
/// rather than lost.
pub struct DockerEventSource {
    docker: Arc<bollard::Docker>,
    capacity: usize,
}

impl DockerEventSource {
    pub fn new(docker: Arc<bollard::Docker>, capacity: usize) -> Self {
        Self { docker, capacity }
    }
}

impl EventSource for DockerEventSource {
    fn subscribe(&mut self, cancel: CancellationToken) -> Result<EventSubscription, SnatGuardError> {
        use bollard::system::EventsOptions;

        let (tx, rx) = mpsc::channel(self.capacity);
        let docker = Arc::clone(&self.docker);
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();

        let task = tokio::spawn(async move {
            let options = EventsOptions::<String> {
                since: Some(since.to_string()),
                filters: HashMap::from([
                    ("type".to_owned(), vec!["container".to_owned()]),
                    (
                        "event".to_owned(),
                        vec!["start".to_owned(), "die".to_owned()],
                    ),
                ]),
                ..Default::default()
            };
            let mut stream = std::pin::pin!(docker.events(Some(options)));

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("docker event feed cancelled");
                        break;
                    }
                    next = stream.next() => match next {
                        Some(Ok(message)) => {
                            let Some(event) = to_event(message) else {
                                continue;
                            };
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "docker event stream failed");
                            let _ = tx
                                .send(Err(SnatGuardError::DockerApi(format!(
                                    "event stream failed: {e}"
                                ))))
                                .await;
                            break;
                        }
                        None => {
                            warn!("docker event stream ended");
                            break;
                        }
                    }
                }
            }
        });

        Ok(EventSubscription::new(rx, task))
    }
}

/// Extracts name and action. Messages without either are dropped.
fn to_event(message: bollard::models::EventMessage) -> Option<ContainerEvent> {
    let action = message.action?;
    let name = message.actor?.attributes?.remove("name")?;
    Some(ContainerEvent::from_status(name, &action))
}

/// In-process source fed through a channel.
///
/// Used to drive a guard without a Docker daemon. Sending `Err` simulates a
/// failed feed; dropping every sender simulates a closed one.
pub struct ChannelEventSource {
    input: Option<mpsc::Receiver<EventItem>>,
    capacity: usize,
}

impl ChannelEventSource {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<EventItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                input: Some(rx),
                capacity,
            },
            tx,
        )
    }
}

impl EventSource for ChannelEventSource {
    fn subscribe(&mut self, cancel: CancellationToken) -> Result<EventSubscription, SnatGuardError> {
        let mut input = self
            .input
            .take()
            .ok_or_else(|| SnatGuardError::Channel("event source already subscribed".to_owned()))?;
        let (tx, rx) = mpsc::channel(self.capacity);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    item = input.recv() => match item {
                        Some(item) => {
                            let failed = item.is_err();
                            if tx.send(item).await.is_err() || failed {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(EventSubscription::new(rx, task))
    }
}
