//! Periodic catalog refresh and reconnection

use super::ProviderManager;
use crate::error::{MeshError, MeshResult};
use crate::transport::{ClientStatus, TransportClient};
use futures::future::join_all;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl ProviderManager {
    /// Spawn the background refresh task
    ///
    /// Returns `false` when it is already running or the manager has been
    /// shut down.
    pub fn start_refresh_loop(&self) -> bool {
        let mut task = self.refresh_task.lock();
        if task.is_some() || self.is_stopped() {
            return false;
        }
        let period = self.settings.refresh_interval();
        info!("Refreshing provider catalogs every {:?}", period);
        *task = Some(tokio::spawn(refresh_loop(
            self.weak_self.clone(),
            self.shutdown.clone(),
            period,
        )));
        true
    }

    /// One refresh pass over every enabled provider
    ///
    /// Connected providers are re-listed; a failed listing keeps the
    /// previous catalog. Enabled providers that lost their link or failed
    /// to connect get a new start attempt. Returns the number of catalogs
    /// refreshed.
    pub async fn refresh_all(&self) -> usize {
        let enabled: Vec<String> = self
            .configs
            .read()
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(name, _)| name.clone())
            .collect();

        let mut live = Vec::new();
        for name in enabled {
            match self.status_of(&name) {
                ClientStatus::Connected => {
                    if let Some(slot) = self.slot(&name) {
                        live.push((name, slot));
                    }
                }
                ClientStatus::Connecting => {}
                ClientStatus::Disconnected | ClientStatus::Error => {
                    debug!("Reconnecting provider {}", name);
                    if let Err(e) = self.start_client(&name) {
                        warn!("Reconnect of {} failed: {}", name, e);
                    }
                }
            }
        }

        let results = join_all(live.iter().map(|(name, slot)| async move {
            (name, self.refresh_catalog(name, &slot.client, slot.epoch).await)
        }))
        .await;

        let mut refreshed = 0;
        for (name, result) in results {
            match result {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(
                    "Refresh of {} failed, keeping {} cached tools: {}",
                    name,
                    self.cache.count(name).unwrap_or(0),
                    e
                ),
            }
        }
        refreshed
    }

    /// List a provider's tools and cache them if its client is still current
    pub(super) async fn refresh_catalog(
        &self,
        name: &str,
        client: &Arc<dyn TransportClient>,
        epoch: u64,
    ) -> MeshResult<usize> {
        let cancel = self.shutdown.child_token();
        let tools = client.list_tools(&cancel).await?;
        if !self.is_current(name, epoch) {
            return Err(MeshError::provider_unavailable(name, "client was replaced"));
        }
        Ok(self.cache.store(name, tools))
    }
}

async fn refresh_loop(manager: Weak<ProviderManager>, shutdown: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; connects already fetch catalogs
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(strong) = manager.upgrade() else {
            break;
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            refreshed = strong.refresh_all() => debug!("Refreshed {} provider catalogs", refreshed),
        }
    }
    debug!("Refresh loop stopped");
}

