//! Online/offline tracking.
//!
//! [`Connectivity`] is the single source of truth for whether the remote farm
//! API is reachable. Anything can flip it (a platform network callback, the CLI,
//! tests); [`spawn_health_probe`] flips it by polling the server's `/health`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::transport::check_server;

#[derive(Debug, Clone)]
pub struct Connectivity {
    sender: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Sets the state. Returns true if this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Polls `GET {base_url}/health` every `interval` and mirrors the result into
/// `connectivity`. Runs until the handle is aborted.
pub fn spawn_health_probe(
    connectivity: Connectivity,
    base_url: String,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let online = check_server(&base_url, timeout).await;
            if connectivity.set_online(online) {
                if online {
                    tracing::info!("Farm API at {} is reachable", base_url);
                } else {
                    tracing::warn!("Farm API at {} is unreachable, working offline", base_url);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_online_reports_transitions() {
        let connectivity = Connectivity::new(false);
        assert!(!connectivity.is_online());

        assert!(connectivity.set_online(true));
        assert!(connectivity.is_online());
        assert!(!connectivity.set_online(true));
        assert!(connectivity.set_online(false));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());

        // a no-op set does not wake subscribers
        connectivity.set_online(false);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_health_probe_marks_unreachable_server_offline() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        let handle = spawn_health_probe(
            connectivity.clone(),
            "http://127.0.0.1:9".to_string(),
            Duration::from_millis(50),
            Duration::from_millis(200),
        );

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!connectivity.is_online());
        handle.abort();
    }
}
