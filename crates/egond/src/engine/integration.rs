use std::error::Error;

use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::sync::mpsc;

use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use crate::config::Config;

/// Item events flowing into the engine; bounded so a chatty poll loop waits
/// for the engine instead of growing the queue
pub type FromIntegrationSender = mpsc::Sender<FromIntegrationMessage>;
pub type FromIntegrationReceiver = mpsc::Receiver<FromIntegrationMessage>;

/// Bus commands, updates and reloads flowing out of the engine; unbounded so
/// routing never blocks an API request
pub type ToIntegrationSender = mpsc::UnboundedSender<ToIntegrationMessage>;

/// `Ok(None)` when the integration's config section is absent
pub type IntegrationFactoryResult = anyhow::Result<Option<Box<dyn Integration>>>;

/// What a factory sees when the engine builds integrations
pub struct IntegrationContext<'a> {
    pub config: &'a Config,
}

/// Factories for every integration compiled into this binary
#[distributed_slice]
pub static REGISTRY: [fn(&IntegrationContext) -> IntegrationFactoryResult];

/// A device bridge owning some of the bus items
///
/// Each integration runs on its own task: `setup` once, then
/// `handle_message` for everything routed to it, then `shutdown` when the
/// engine drops its channel.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Name items are registered under, e.g. `egon`
    fn name(&self) -> &str;

    /// Connect to the device and announce owned items with `ItemDiscovered`
    ///
    /// `tx` stays valid for the integration's lifetime and carries state
    /// changes and item removals as well.
    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), Box<dyn Error + Send>>;

    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>>;

    /// Stop background work; called once after the last message
    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>>;
}
