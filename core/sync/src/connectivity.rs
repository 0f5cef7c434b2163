//! Connectivity tracking and replay triggering.
//!
//! Connectivity changes arrive on a `watch` channel. Whoever owns the sender
//! (the [`ConnectivityProbe`], a platform hook, a test) publishes the
//! current [`ConnectivityState`]; the [`ConnectivityMonitor`] starts exactly
//! one replay pass for every Offline to Online transition and does nothing
//! otherwise.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};
use url::Url;

use harbor_common::HttpRequest;
use harbor_net::Fetcher;

use crate::processor::SyncProcessor;

/// Whether the network is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

/// Effect of a new connectivity observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
    Unchanged,
}

/// Starts a replay pass whenever the network comes back.
pub struct ConnectivityMonitor {
    processor: Arc<SyncProcessor>,
    state: Mutex<ConnectivityState>,
}

impl ConnectivityMonitor {
    /// Create a monitor starting from `initial`.
    pub fn new(processor: Arc<SyncProcessor>, initial: ConnectivityState) -> Self {
        Self {
            processor,
            state: Mutex::new(initial),
        }
    }

    /// Last observed state.
    pub fn state(&self) -> ConnectivityState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a new observation and report what changed.
    pub fn observe(&self, next: ConnectivityState) -> Transition {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let previous = std::mem::replace(&mut *state, next);

        match (previous, next) {
            (ConnectivityState::Offline, ConnectivityState::Online) => Transition::CameOnline,
            (ConnectivityState::Online, ConnectivityState::Offline) => Transition::WentOffline,
            _ => Transition::Unchanged,
        }
    }

    /// Follow `signals` until every sender is dropped.
    ///
    /// Passes run in the background so later signals are observed while a
    /// pass is in flight; a trigger arriving mid-pass is ignored by the
    /// processor. Returns once the channel closes and started passes finish.
    pub async fn run(&self, mut signals: watch::Receiver<ConnectivityState>) {
        let mut passes = JoinSet::new();
        info!("Connectivity monitor started ({:?})", self.state());

        while signals.changed().await.is_ok() {
            let next = *signals.borrow_and_update();
            match self.observe(next) {
                Transition::CameOnline => {
                    info!("Network reachable, replaying queued mutations");
                    let processor = self.processor.clone();
                    passes.spawn(async move { processor.run_pass().await });
                }
                Transition::WentOffline => info!("Network unreachable"),
                Transition::Unchanged => debug!("Connectivity unchanged ({:?})", next),
            }

            // Reap finished passes.
            while let Some(result) = passes.try_join_next() {
                if let Err(e) = result {
                    error!("Replay pass task failed: {}", e);
                }
            }
        }

        while let Some(result) = passes.join_next().await {
            if let Err(e) = result {
                error!("Replay pass task failed: {}", e);
            }
        }
        info!("Connectivity monitor stopped");
    }
}

/// Polls a URL and publishes the resulting connectivity state.
///
/// Any HTTP answer counts as online; only transport failures and timeouts
/// count as offline.
pub struct ConnectivityProbe {
    fetcher: Arc<dyn Fetcher>,
    url: Url,
    interval: Duration,
    timeout: Duration,
}

impl ConnectivityProbe {
    /// Create a probe for `url`.
    pub fn new(fetcher: Arc<dyn Fetcher>, url: Url) -> Self {
        Self {
            fetcher,
            url,
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the polling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the timeout for a single check.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check connectivity once.
    pub async fn check(&self) -> ConnectivityState {
        let request = HttpRequest::new(http::Method::HEAD, self.url.clone());
        match self.fetcher.fetch_within(&request, self.timeout).await {
            Ok(_) => ConnectivityState::Online,
            Err(e) => {
                debug!("Probe of {} failed: {}", self.url, e);
                ConnectivityState::Offline
            }
        }
    }

    /// Poll in the background, publishing changes on `tx`.
    ///
    /// The task ends once every receiver is dropped.
    pub fn spawn(self, tx: watch::Sender<ConnectivityState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                let observed = self.check().await;
                tx.send_if_modified(|current| {
                    if *current == observed {
                        false
                    } else {
                        *current = observed;
                        true
                    }
                });
            }
            debug!("Connectivity probe for {} stopped", self.url);
        })
    }
}
