//! External provider supervision
//!
//! [`ProviderManager`] owns one transport client per configured provider,
//! connects them in the background, and merges their catalogs into a
//! single namespace of `<provider>::<tool>` names. The last good catalog
//! of every provider is cached so that a provider which is merely
//! disconnected or still connecting keeps contributing its tools. A
//! provider in `error` never does.

mod cache;
mod refresh;
mod types;


pub use cache::CachedCatalog;
pub use types::{ManagerStats, ProviderSummary, QUALIFIER, qualify, split_qualified};

use crate::config::{ManagerSettings, MeshConfig, ProviderConfig};
use crate::error::{MeshError, MeshResult};
use crate::execution::{ExecutionLog, ExecutionStore, Retention, ToolExecution, ToolStats};
use crate::protocol::{CallToolResult, ToolDefinition};
use crate::transport::{ClientFactory, ClientStatus, TransportClient, TransportFactory};
use cache::ToolCache;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A live client and the start attempt that created it
#[derive(Clone)]
struct Slot {
    client: Arc<dyn TransportClient>,
    epoch: u64,
}

/// Supervisor for every external provider
pub struct ProviderManager {
    weak_self: Weak<Self>,
    configs: RwLock<BTreeMap<String, ProviderConfig>>,
    clients: RwLock<HashMap<String, Slot>>,
    /// Failure causes, kept until the next successful start
    errors: RwLock<HashMap<String, String>>,
    /// Start attempts still connecting, by epoch
    connecting: RwLock<HashMap<String, u64>>,
    connect_done: Notify,
    next_epoch: AtomicU64,
    cache: ToolCache,
    executions: Arc<ExecutionLog>,
    settings: ManagerSettings,
    factory: Arc<dyn ClientFactory>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderManager {
    /// Manager building clients by declared transport
    pub fn new(settings: ManagerSettings) -> Arc<Self> {
        Self::with_factory(settings, Arc::new(TransportFactory), None)
    }

    /// Same as [`Self::new`], persisting executions to `storage`
    pub fn with_storage(settings: ManagerSettings, storage: Arc<dyn ExecutionStore>) -> Arc<Self> {
        Self::with_factory(settings, Arc::new(TransportFactory), Some(storage))
    }

    pub fn with_factory(
        settings: ManagerSettings,
        factory: Arc<dyn ClientFactory>,
        storage: Option<Arc<dyn ExecutionStore>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            configs: RwLock::new(BTreeMap::new()),
            clients: RwLock::new(HashMap::new()),
            errors: RwLock::new(HashMap::new()),
            connecting: RwLock::new(HashMap::new()),
            connect_done: Notify::new(),
            next_epoch: AtomicU64::new(1),
            cache: ToolCache::default(),
            executions: Arc::new(ExecutionLog::new(
                settings.max_executions,
                storage,
                Retention::KeepBounded,
            )),
            settings,
            factory,
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            refresh_task: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    // ==========================================================================
    // Configuration
    // ==========================================================================

    /// Add a provider or replace its configuration
    ///
    /// A changed configuration closes the running client and drops the
    /// cached catalog. Enabled providers without a live client are started.
    pub async fn add_or_update_config(&self, name: &str, config: ProviderConfig) -> MeshResult<()> {
        config.validate(name)?;
        let enabled = config.enabled;
        let previous = self
            .configs
            .write()
            .insert(name.to_string(), config.clone());

        let changed = previous.as_ref() != Some(&config);
        if previous.is_some() && changed {
            info!("Provider {} reconfigured", name);
            self.drop_client(name).await;
            self.cache.invalidate(name);
            self.errors.write().remove(name);
        }

        if enabled && (changed || self.slot(name).is_none()) {
            self.start_client(name)?;
        }
        Ok(())
    }

    /// Forget a provider entirely
    pub async fn remove_config(&self, name: &str) -> MeshResult<()> {
        if self.configs.write().remove(name).is_none() {
            return Err(MeshError::provider_not_configured(name));
        }
        self.drop_client(name).await;
        self.cache.invalidate(name);
        self.errors.write().remove(name);
        info!("Provider {} removed", name);
        Ok(())
    }

    /// Replace the provider set with the one in `config`
    ///
    /// Providers missing from `config` are removed. A provider whose client
    /// cannot be built is logged and reported through its status. Returns
    /// the number of configured providers.
    pub async fn load_config(&self, config: &MeshConfig) -> MeshResult<usize> {
        config.validate()?;

        let stale: Vec<String> = self
            .configs
            .read()
            .keys()
            .filter(|name| !config.providers.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            self.remove_config(&name).await?;
        }

        for (name, provider) in &config.providers {
            if let Err(e) = self.add_or_update_config(name, provider.clone()).await {
                error!("Failed to start provider {}: {}", name, e);
            }
        }
        Ok(self.configs.read().len())
    }

    pub fn provider_config(&self, name: &str) -> Option<ProviderConfig> {
        self.configs.read().get(name).cloned()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.configs.read().keys().cloned().collect()
    }

    // ==========================================================================
    // Lifecycle
    // ==========================================================================

    /// Enable a provider and connect it in the background
    ///
    /// A connected client is left alone. Otherwise a fresh client is built,
    /// reported as connecting before any I/O, and connected on its own task.
    pub fn start_client(&self, name: &str) -> MeshResult<()> {
        let config = {
            let mut configs = self.configs.write();
            let config = configs
                .get_mut(name)
                .ok_or_else(|| MeshError::provider_not_configured(name))?;
            config.enabled = true;
            config.clone()
        };

        let manager = match self.weak_self.upgrade() {
            Some(manager) if !self.is_stopped() => manager,
            _ => return Err(MeshError::provider_unavailable(name, "manager is shut down")),
        };
        if self.slot(name).is_some_and(|slot| slot.client.is_connected()) {
            debug!("Provider {} already connected", name);
            return Ok(());
        }
        if self.status_of(name) == ClientStatus::Error {
            // Keep the failure on record so the reconnect serves no cache
            let cause = self
                .last_error_of(name)
                .unwrap_or_else(|| "provider reported an error".to_string());
            self.errors.write().entry(name.to_string()).or_insert(cause);
        }

        let client = self.factory.create(name, &config).map_err(|e| {
            error!("Failed to create client for provider {}: {}", name, e);
            self.errors.write().insert(name.to_string(), e.to_string());
            e
        })?;

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        {
            let mut connecting = self.connecting.write();
            if connecting.contains_key(name) {
                debug!("Provider {} is already connecting", name);
                return Ok(());
            }
            connecting.insert(name.to_string(), epoch);
        }
        let previous = self.clients.write().insert(
            name.to_string(),
            Slot {
                client: client.clone(),
                epoch,
            },
        );

        let name = name.to_string();
        tokio::spawn(async move {
            if let Some(old) = previous {
                if let Err(e) = old.client.close().await {
                    debug!("Closing replaced client for {}: {}", name, e);
                }
            }
            manager.connect(name, client, epoch).await;
        });
        Ok(())
    }

    /// Handshake, first catalog, then a follow-up refresh once settled
    async fn connect(&self, name: String, client: Arc<dyn TransportClient>, epoch: u64) {
        info!("Connecting provider {} over {}", name, client.transport());
        let cancel = self.shutdown.child_token();
        let outcome = client.initialize(&cancel).await;
        let current = self.is_current(&name, epoch);

        let connected = match outcome {
            Ok(info) if current => {
                self.errors.write().remove(&name);
                info!(
                    "Provider {} connected ({} {})",
                    name, info.name, info.version
                );
                if let Err(e) = self.refresh_catalog(&name, &client, epoch).await {
                    warn!("Initial catalog fetch for {} failed: {}", name, e);
                }
                true
            }
            Err(e) if current => {
                error!("Failed to connect provider {}: {}", name, e);
                self.errors.write().insert(name.clone(), e.to_string());
                false
            }
            _ => {
                debug!("Provider {} was replaced while connecting", name);
                false
            }
        };

        {
            let mut connecting = self.connecting.write();
            if connecting.get(&name) == Some(&epoch) {
                connecting.remove(&name);
            }
        }
        self.connect_done.notify_waiters();

        if !connected {
            return;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.settings.settle_delay()) => {}
        }
        if self.is_current(&name, epoch) {
            match self.refresh_catalog(&name, &client, epoch).await {
                Ok(count) => debug!("Provider {} settled with {} tools", name, count),
                Err(e) => debug!("Settle refresh for {} failed: {}", name, e),
            }
        }
    }

    /// Close a provider's client and disable it; its cached catalog stays
    pub async fn stop_client(&self, name: &str) -> MeshResult<()> {
        {
            let mut configs = self.configs.write();
            let config = configs
                .get_mut(name)
                .ok_or_else(|| MeshError::provider_not_configured(name))?;
            config.enabled = false;
        }
        self.drop_client(name).await;
        info!("Provider {} stopped", name);
        Ok(())
    }

    /// Wait until no provider is connecting, up to `timeout`
    ///
    /// Returns whether every start attempt finished in time.
    pub async fn wait_for_connections(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.connect_done.notified();
            if self.connecting.read().is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.connecting.read().is_empty();
            }
        }
    }

    /// Stop background work and close every client; safe to call twice
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down provider manager");
        self.shutdown.cancel();

        let task = self.refresh_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!("Refresh task ended abnormally: {}", e);
            }
        }

        let clients: Vec<(String, Slot)> = self.clients.write().drain().collect();
        self.connecting.write().clear();
        self.connect_done.notify_waiters();

        join_all(clients.iter().map(|(name, slot)| async move {
            if let Err(e) = slot.client.close().await {
                warn!("Failed to close provider {}: {}", name, e);
            }
        }))
        .await;
        info!("Closed {} provider clients", clients.len());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn drop_client(&self, name: &str) {
        let slot = self.clients.write().remove(name);
        if self.connecting.write().remove(name).is_some() {
            self.connect_done.notify_waiters();
        }
        if let Some(slot) = slot {
            if let Err(e) = slot.client.close().await {
                warn!("Failed to close provider {}: {}", name, e);
            }
        }
    }

    fn slot(&self, name: &str) -> Option<Slot> {
        self.clients.read().get(name).cloned()
    }

    fn is_current(&self, name: &str, epoch: u64) -> bool {
        self.clients
            .read()
            .get(name)
            .is_some_and(|slot| slot.epoch == epoch)
    }

    // ==========================================================================
    // Status
    // ==========================================================================

    /// Status of a configured provider; `None` when unknown
    pub fn provider_status(&self, name: &str) -> Option<ClientStatus> {
        if !self.configs.read().contains_key(name) {
            return None;
        }
        Some(self.status_of(name))
    }

    fn status_of(&self, name: &str) -> ClientStatus {
        if self.connecting.read().contains_key(name) {
            return ClientStatus::Connecting;
        }
        let client_status = self.slot(name).map(|slot| slot.client.status());
        match client_status {
            Some(ClientStatus::Connected) => ClientStatus::Connected,
            Some(ClientStatus::Error) => ClientStatus::Error,
            _ if self.errors.read().contains_key(name) => ClientStatus::Error,
            Some(status) => status,
            None => ClientStatus::Disconnected,
        }
    }

    fn last_error_of(&self, name: &str) -> Option<String> {
        self.errors
            .read()
            .get(name)
            .cloned()
            .or_else(|| self.slot(name).and_then(|slot| slot.client.last_error()))
    }

    /// Tools in each provider's last good catalog
    pub fn get_tool_counts(&self) -> BTreeMap<String, usize> {
        self.configs
            .read()
            .keys()
            .map(|name| (name.clone(), self.cache.count(name).unwrap_or(0)))
            .collect()
    }

    /// Provider summaries plus call counters
    pub fn get_stats(&self) -> ManagerStats {
        let configs: Vec<(String, ProviderConfig)> = self
            .configs
            .read()
            .iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();

        let providers: Vec<ProviderSummary> = configs
            .into_iter()
            .map(|(name, config)| {
                let catalog = self.cache.get(&name);
                ProviderSummary {
                    status: self.status_of(&name),
                    last_error: self.last_error_of(&name),
                    tool_count: catalog.as_ref().map_or(0, |c| c.tools.len()),
                    catalog_refreshed_at: catalog.map(|c| c.refreshed_at),
                    transport: config.transport,
                    enabled: config.enabled,
                    endpoint: config.endpoint(),
                    name,
                }
            })
            .collect();

        ManagerStats {
            total_tools: providers.iter().map(|p| p.tool_count).sum(),
            connected: providers
                .iter()
                .filter(|p| p.status == ClientStatus::Connected)
                .count(),
            running_executions: self.executions.running(),
            tool_stats: self.executions.stats(),
            providers,
        }
    }

    // ==========================================================================
    // Tools
    // ==========================================================================

    /// Merged catalog of every enabled provider, sorted by qualified name
    ///
    /// Providers are asked concurrently, each under the fast-fail budget.
    /// Connected providers are listed live and fall back to their cached
    /// catalog on failure; disconnected and connecting ones are served from
    /// cache; providers in error contribute nothing, and neither do they
    /// while reconnecting from that error.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn get_all_tools(&self, cancel: &CancellationToken) -> Vec<ToolDefinition> {
        let names: Vec<String> = self
            .configs
            .read()
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(name, _)| name.clone())
            .collect();

        let catalogs = join_all(names.iter().map(|name| self.provider_tools(name, cancel))).await;
        let mut tools: Vec<ToolDefinition> = catalogs.into_iter().flatten().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    async fn provider_tools(&self, name: &str, cancel: &CancellationToken) -> Vec<ToolDefinition> {
        let tools = match self.status_of(name) {
            ClientStatus::Error => {
                debug!("Provider {} is in error, not serving its tools", name);
                return Vec::new();
            }
            ClientStatus::Connecting if self.errors.read().contains_key(name) => {
                debug!("Provider {} is reconnecting after an error", name);
                return Vec::new();
            }
            ClientStatus::Disconnected | ClientStatus::Connecting => self.cached_tools(name),
            ClientStatus::Connected => self.live_tools(name, cancel).await,
        };
        tools
            .iter()
            .map(|tool| types::qualified_definition(name, tool))
            .collect()
    }

    async fn live_tools(&self, name: &str, cancel: &CancellationToken) -> Vec<ToolDefinition> {
        let Some(slot) = self.slot(name) else {
            return self.cached_tools(name);
        };

        let budget = self.settings.fast_fail_timeout();
        match tokio::time::timeout(budget, slot.client.list_tools(cancel)).await {
            Ok(Ok(tools)) => {
                if self.is_current(name, slot.epoch) {
                    self.cache.store(name, tools.clone());
                }
                tools
            }
            Ok(Err(e)) => {
                warn!("Listing tools of {} failed, serving cache: {}", name, e);
                self.cached_tools(name)
            }
            Err(_) => {
                warn!(
                    "Listing tools of {} exceeded {:?}, serving cache",
                    name, budget
                );
                self.cached_tools(name)
            }
        }
    }

    fn cached_tools(&self, name: &str) -> Vec<ToolDefinition> {
        self.cache
            .get(name)
            .map(|catalog| catalog.tools)
            .unwrap_or_default()
    }

    /// Call `<provider>::<tool>` on its provider
    #[instrument(skip(self, cancel, arguments), level = "debug")]
    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        qualified_name: &str,
        arguments: Value,
    ) -> MeshResult<CallToolResult> {
        let (provider, tool) = split_qualified(qualified_name)?;
        if !self.configs.read().contains_key(provider) {
            return Err(MeshError::provider_not_configured(provider));
        }

        let status = self.status_of(provider);
        let client = match self.slot(provider) {
            Some(slot) if status == ClientStatus::Connected => slot.client,
            _ => {
                let reason = self
                    .last_error_of(provider)
                    .unwrap_or_else(|| status.to_string());
                return Err(MeshError::provider_unavailable(provider, reason));
            }
        };

        let execution_id = self.executions.begin(qualified_name, arguments.clone());
        // The outcome is recorded on its own task so that a caller which
        // stops waiting never leaves the execution running
        let supervisor = {
            let executions = Arc::clone(&self.executions);
            let execution_id = execution_id.clone();
            let cancel = cancel.clone();
            let tool = tool.to_string();
            tokio::spawn(async move {
                let outcome = client.call_tool(&cancel, &tool, arguments).await;
                executions.complete(&execution_id, &outcome).await;
                outcome
            })
        };

        let outcome = match supervisor.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let err = MeshError::other(format!("Provider call task failed: {}", join_err));
                self.executions.complete(&execution_id, &Err(err.clone())).await;
                Err(err)
            }
        };

        if let Err(e) = &outcome {
            warn!(
                retryable = e.is_retryable(),
                "Call to {} failed: {}", qualified_name, e
            );
        }
        outcome
    }

    /// Most recent provider calls first
    pub async fn executions(&self, limit: usize) -> MeshResult<Vec<ToolExecution>> {
        self.executions.recent(limit).await
    }

    pub fn tool_stats(&self) -> HashMap<String, ToolStats> {
        self.executions.stats()
    }
}

impl Drop for ProviderManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.refresh_task.get_mut().take() {
            task.abort();
        }
    }
}
