//! Connectivity tracking.
//!
//! The host application reports online/offline transitions; everything
//! else in the crate observes them through a watch channel. An
//! offline → online edge is what triggers automatic queue replay.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::info;

use crate::metrics;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectivityStats {
    pub online: bool,
    pub last_online: Option<DateTime<Utc>>,
    pub last_offline: Option<DateTime<Utc>>,
    /// Offline → online edges seen
    pub reconnects: u64,
}

pub struct Connectivity {
    tx: watch::Sender<bool>,
    stats: RwLock<ConnectivityStats>,
}

impl Connectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        metrics::set_online(online);
        Self {
            tx,
            stats: RwLock::new(ConnectivityStats {
                online,
                ..Default::default()
            }),
        }
    }

    /// Report the current network state. Repeating the current state is a
    /// no-op and wakes nobody.
    pub fn set_online(&self, online: bool) {
        // Stats are written before subscribers wake so they observe the edge.
        let mut stats = self.stats.write();
        if stats.online == online {
            return;
        }

        let now = Utc::now();
        stats.online = online;
        if online {
            stats.last_online = Some(now);
            stats.reconnects += 1;
            info!("Network online");
        } else {
            stats.last_offline = Some(now);
            info!("Network offline, serving from local cache");
        }
        self.tx.send_replace(online);
        drop(stats);
        metrics::set_online(online);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> ConnectivityStats {
        *self.stats.read()
    }

    /// Resolve once online. Returns at once if already online.
    pub async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|online| *online).await;
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
