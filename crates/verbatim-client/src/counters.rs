//! Dashboard badge counters.
//!
//! Counters are never incremented locally: any event that could move one
//! marks the set dirty and the service refetches the authoritative values.
//! Duplicate or missed deliveries therefore cost at most an extra fetch.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use verbatim_api::ApiClient;
use verbatim_channel::{ChannelHandle, ChannelStatus, EventSubscription};
use verbatim_types::api::CountsResponse;
use verbatim_types::events::RealtimeEvent;

pub struct BadgeCounters {
    counts_rx: watch::Receiver<CountsResponse>,
    task: JoinHandle<()>,
}

impl BadgeCounters {
    /// Start the refresh loop against an established channel session.
    /// The first fetch happens immediately; afterwards the loop refetches
    /// whenever relevant traffic or a reconnect says the values may have
    /// moved.
    pub fn spawn(api: Arc<ApiClient>, handle: &ChannelHandle) -> Self {
        let events = handle.events();
        let mut status = handle.status();
        status.mark_unchanged();

        let (counts_tx, counts_rx) = watch::channel(CountsResponse::default());
        let task = tokio::spawn(run(api, events, status, counts_tx));

        Self { counts_rx, task }
    }

    /// Last values fetched from the server; starts at all zeroes.
    pub fn counts(&self) -> watch::Receiver<CountsResponse> {
        self.counts_rx.clone()
    }
}

impl Drop for BadgeCounters {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    api: Arc<ApiClient>,
    mut events: EventSubscription,
    mut status: watch::Receiver<ChannelStatus>,
    counts_tx: watch::Sender<CountsResponse>,
) {
    fetch_into(&api, &counts_tx).await;

    loop {
        let mut dirty = false;
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => dirty = affects_counts(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => dirty = true,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                if *status.borrow_and_update() == ChannelStatus::Connected {
                    dirty = true;
                }
            }
        }
        if !dirty {
            continue;
        }

        // Coalesce the rest of the burst into this one fetch.
        loop {
            match events.try_recv() {
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => break,
            }
        }

        fetch_into(&api, &counts_tx).await;
    }
}

async fn fetch_into(api: &ApiClient, counts_tx: &watch::Sender<CountsResponse>) {
    match api.counts().await {
        Ok(counts) => {
            counts_tx.send_replace(counts);
        }
        // Keep showing the last good values.
        Err(e) => warn!("Failed to refresh dashboard counters: {}", e),
    }
}

fn affects_counts(event: &RealtimeEvent) -> bool {
    !matches!(event, RealtimeEvent::Ready { .. })
}
