use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Integration;
use super::integration::ToIntegrationSender;
use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use super::state::ItemValue;
use super::state::State;
use crate::engine::IntegrationContext;

/// egond engine
///
/// This structure is the in-process event bus: it receives item updates from
/// integrations, maintains a view of the world with State, and routes bus
/// commands to the integration that owns the item.
pub struct Engine {
    /// Centralized state snapshot (readers load the Arc, writer stores a new one)
    state: ArcSwap<State>,

    /// Map of item_name -> integration name for routing messages
    item_integration_map: std::sync::Mutex<HashMap<String, String>>,

    /// Communication channels to integrations (for commands)
    integration_channels: std::sync::Mutex<HashMap<String, ToIntegrationSender>>,

    /// Receive messages from integrations (events)
    message_rx: Mutex<FromIntegrationReceiver>,

    /// Sender for integrations to report events back to the engine
    message_tx: FromIntegrationSender,

    /// Handles for integration tasks
    integration_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Capacity for the integration→engine message channel
/// Provides backpressure when integrations send faster than the engine can process
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

fn routing_error(kind: std::io::ErrorKind, message: String) -> Box<dyn Error + Send> {
    Box::new(std::io::Error::new(kind, message))
}

impl Engine {
    /// Create a new Engine instance
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        Self {
            state: ArcSwap::new(Arc::default()),
            item_integration_map: std::sync::Mutex::new(HashMap::new()),
            integration_channels: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
            integration_handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register integrations from configuration
    ///
    /// Runs every factory in the integration registry; factories return
    /// `Ok(None)` when their section is not configured.
    pub fn register_integrations_from_config(&self, cfg: &crate::config::Config) {
        let ctx = IntegrationContext { config: cfg };
        for constr in super::integration::REGISTRY {
            let integration = match constr(&ctx) {
                Ok(Some(i)) => i,
                Err(e) => {
                    error!("failed to setup integration: {:#}", e);
                    continue;
                }
                Ok(None) => continue,
            };
            let name = integration.name().to_string();
            self.register_integration(name, integration);
        }
    }

    /// Register an integration with the engine
    ///
    /// This spawns the integration in a background task, wires up channels,
    /// and starts its setup process.
    pub fn register_integration(&self, name: String, mut integration: Box<dyn Integration>) {
        let (to_integration_tx, mut to_integration_rx) = mpsc::unbounded_channel();
        let from_integration_tx = self.message_tx.clone();

        if let Ok(mut channels) = self.integration_channels.lock() {
            channels.insert(name.clone(), to_integration_tx);
        }

        // Spawn integration task
        let handle = tokio::spawn(async move {
            // Setup integration (gives it the sender for events)
            if let Err(e) = integration.setup(from_integration_tx).await {
                warn!("Integration '{}' setup failed: {}", name, e);
                return;
            }

            // Process commands from engine
            while let Some(msg) = to_integration_rx.recv().await {
                if let Err(e) = integration.handle_message(msg).await {
                    warn!("Integration '{}' failed to handle message: {}", name, e);
                }
            }

            if let Err(e) = integration.shutdown().await {
                warn!("Integration '{}' shutdown failed: {}", name, e);
            }
        });

        if let Ok(mut handles) = self.integration_handles.lock() {
            handles.push(handle);
        }
    }

    /// Name of the integration that announced `item_name`
    pub fn integration_for(&self, item_name: &str) -> Option<String> {
        self.item_integration_map
            .lock()
            .ok()
            .and_then(|map| map.get(item_name).cloned())
    }

    /// Route an item message to the integration that owns its item
    pub fn route(&self, msg: ToIntegrationMessage) -> Result<(), Box<dyn Error + Send>> {
        let item_name = msg.item_name().ok_or_else(|| {
            routing_error(
                std::io::ErrorKind::InvalidInput,
                "Broadcast messages cannot be routed to one item".to_string(),
            )
        })?;
        let integration_name = self.integration_for(item_name).ok_or_else(|| {
            routing_error(
                std::io::ErrorKind::NotFound,
                format!("No integration found for item: {}", item_name),
            )
        })?;

        let channels = self
            .integration_channels
            .lock()
            .map_err(|e| routing_error(std::io::ErrorKind::Other, e.to_string()))?;
        let tx = channels.get(&integration_name).ok_or_else(|| {
            routing_error(
                std::io::ErrorKind::NotFound,
                format!("Integration channel not found: {}", integration_name),
            )
        })?;

        tx.send(msg)
            .map_err(|e| -> Box<dyn Error + Send> { Box::new(e) })
    }

    /// Issue a command for an item on the bus
    pub fn send_command(
        &self,
        item_name: String,
        command: String,
    ) -> Result<(), Box<dyn Error + Send>> {
        self.route(ToIntegrationMessage::Command { item_name, command })
    }

    /// Post a state update for an item on the bus
    pub fn post_update(
        &self,
        item_name: String,
        value: ItemValue,
    ) -> Result<(), Box<dyn Error + Send>> {
        self.route(ToIntegrationMessage::Update { item_name, value })
    }

    /// Remove an item from the bus
    ///
    /// The owning integration drops its binding and answers with
    /// `ItemRemoved`, which clears the item from routing and state.
    pub fn remove_item(&self, item_name: String) -> Result<(), Box<dyn Error + Send>> {
        self.route(ToIntegrationMessage::Remove { item_name })
    }

    /// Hand a reloaded configuration to every running integration
    pub fn reconfigure(&self, config: crate::config::Config) {
        let config = Arc::new(config);
        let Ok(channels) = self.integration_channels.lock() else {
            return;
        };
        for (name, tx) in channels.iter() {
            let msg = ToIntegrationMessage::Reconfigure {
                config: config.clone(),
            };
            if tx.send(msg).is_err() {
                warn!("Integration '{}' is gone, cannot reconfigure it", name);
            }
        }
    }

    /// Run the engine's main event loop
    ///
    /// Processes incoming events from integrations and updates state.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send>> {
        info!("Engine starting");

        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            self.handle_event(msg);
        }

        info!("Engine shutting down");
        Ok(())
    }

    /// Stop every integration and wait for its task to finish
    ///
    /// Dropping the command channels ends each integration's message loop,
    /// which then runs its `shutdown`.
    pub async fn shutdown(&self) {
        if let Ok(mut channels) = self.integration_channels.lock() {
            channels.clear();
        }

        let handles: Vec<_> = match self.integration_handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Integration task failed: {}", e);
            }
        }
    }

    /// Get a snapshot of the current engine state.
    ///
    /// Clones the `Arc` (atomic refcount bump), essentially free.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Handle an event from an integration
    pub(crate) fn handle_event(&self, msg: FromIntegrationMessage) {
        match msg {
            FromIntegrationMessage::ItemDiscovered {
                item_name,
                integration_name,
            } => {
                info!("Item discovered: {} (from {})", item_name, integration_name);

                // State is not populated until the first state-change message arrives.
                if let Ok(mut map) = self.item_integration_map.lock() {
                    map.insert(item_name, integration_name);
                }
            }
            FromIntegrationMessage::ItemRemoved { item_name } => {
                info!("Item removed: {}", item_name);

                {
                    let mut state = State::clone(&self.state.load());
                    state.items.remove(&item_name);
                    self.state.store(Arc::new(state));
                }

                if let Ok(mut map) = self.item_integration_map.lock() {
                    map.remove(&item_name);
                }
            }
            FromIntegrationMessage::ItemStateChanged { item_name, value } => {
                debug!("Item state changed: {} -> {}", item_name, value);

                let mut state = State::clone(&self.state.load());
                state.items.insert(item_name, value);
                self.state.store(Arc::new(state));
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
