use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::binding::BindingError;
use super::binding::BindingRegistry;
use super::binding::ItemBindings;
use super::bridge;
use super::bridge::BridgeHandle;
use super::client::Transport;
use crate::config::EgonConfig;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::Integration;
use crate::engine::ToIntegrationMessage;

pub const INTEGRATION_NAME: &str = "egon";

/// ABB Ego-n integration for egond
///
/// Polls one controller for element states and forwards item commands to it.
pub struct EgonIntegration<T: Transport> {
    config: EgonConfig,
    bindings: Arc<ItemBindings>,
    /// Handed to the bridge in setup()
    transport: Option<T>,
    handle: Option<BridgeHandle<T>>,
    to_engine: Option<FromIntegrationSender>,
}

impl<T: Transport + 'static> EgonIntegration<T> {
    /// Create a new Ego-n integration
    pub fn new(transport: T, config: &EgonConfig, bindings: ItemBindings) -> Self {
        Self {
            config: config.clone(),
            bindings: Arc::new(bindings),
            transport: Some(transport),
            handle: None,
            to_engine: None,
        }
    }

    async fn notify(&self, msg: FromIntegrationMessage) {
        let Some(to_engine) = &self.to_engine else {
            return;
        };
        if let Err(e) = to_engine.send(msg).await {
            warn!("Failed to send message to engine: {}", e);
        }
    }

    async fn announce_item(&self, item_name: &str) {
        self.notify(FromIntegrationMessage::ItemDiscovered {
            item_name: item_name.to_string(),
            integration_name: INTEGRATION_NAME.to_string(),
        })
        .await;
        info!("Registered item: {}", item_name);
    }

    async fn retract_item(&self, item_name: &str) {
        self.notify(FromIntegrationMessage::ItemRemoved {
            item_name: item_name.to_string(),
        })
        .await;
        info!("Unregistered item: {}", item_name);
    }

    /// Drop the binding of an item the host removed
    async fn remove_item(&self, item_name: &str) {
        match self.bindings.unbind(item_name) {
            Some(binding) => {
                debug!("Unbound {} from element {}", item_name, binding.element_id());
                self.retract_item(item_name).await;
            }
            None => debug!("Item {} has no Ego-n binding", item_name),
        }
    }

    /// Apply a reloaded `[integrations.egon]` section
    ///
    /// Bindings are reloaded first so the restarted poll loop sees them.
    pub async fn reconfigure(&mut self, config: &EgonConfig) -> Result<(), BindingError> {
        let changes = self.bindings.reload(&config.items)?;
        for item_name in &changes.removed {
            self.retract_item(item_name).await;
        }
        for item_name in &changes.added {
            self.announce_item(item_name).await;
        }

        if let Some(handle) = self.handle.as_mut() {
            handle.reconfigure(config).await;
        }
        self.config = config.clone();
        Ok(())
    }
}

#[async_trait]
impl<T: Transport + 'static> Integration for EgonIntegration<T> {
    fn name(&self) -> &str {
        INTEGRATION_NAME
    }

    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), Box<dyn Error + Send>> {
        let transport = self.transport.take().ok_or_else(|| -> Box<dyn Error + Send> {
            Box::new(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "Ego-n integration is already set up",
            ))
        })?;

        self.to_engine = Some(tx.clone());
        for item_name in self.bindings.item_names() {
            self.announce_item(&item_name).await;
        }

        info!("Connecting to ABB Ego-n controller at {}", self.config.host());
        let registries: Vec<Arc<dyn BindingRegistry>> = vec![self.bindings.clone()];
        let handle = bridge::start(&self.config, transport, registries, tx).await;
        info!(
            "Ego-n integration is {}",
            handle.bridge().lifecycle().await
        );

        self.handle = Some(handle);
        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        let handle = self.handle.as_ref().ok_or_else(|| -> Box<dyn Error + Send> {
            Box::new(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "Ego-n integration not set up. Call setup() first.",
            ))
        })?;

        match msg {
            ToIntegrationMessage::Command { item_name, command } => {
                handle.bridge().dispatch_command(&item_name, &command).await;
            }
            ToIntegrationMessage::Update { item_name, value } => {
                handle.bridge().receive_update(&item_name, &value);
            }
            ToIntegrationMessage::Remove { item_name } => {
                self.remove_item(&item_name).await;
            }
            ToIntegrationMessage::Reconfigure { config } => match &config.integrations.egon {
                Some(egon) => self
                    .reconfigure(egon)
                    .await
                    .map_err(|e| -> Box<dyn Error + Send> { Box::new(e) })?,
                None => warn!(
                    "[integrations.egon] removed from configuration; restart egond to disable it"
                ),
            },
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
        info!("Ego-n integration shutting down");
        if let Some(handle) = self.handle.take() {
            handle.stop().await;
        }
        Ok(())
    }
}
