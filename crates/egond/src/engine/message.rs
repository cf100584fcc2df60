//! Type-safe message system for egond
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `FromIntegrationMessage`: Events from integrations to the engine
//! - `ToIntegrationMessage`: Commands and bus updates from the engine to integrations

use std::sync::Arc;

use super::state::ItemValue;
use crate::config::Config;

/// Messages FROM integrations TO the engine (events/state updates)
#[derive(Debug, Clone, PartialEq)]
pub enum FromIntegrationMessage {
    /// An item was bound to an integration
    ItemDiscovered {
        item_name: String,
        integration_name: String,
    },

    /// An item binding was removed; the engine stops routing to it
    ItemRemoved { item_name: String },

    /// An item's state changed on the device side
    ItemStateChanged { item_name: String, value: ItemValue },
}

/// Messages FROM the engine TO integrations
#[derive(Debug, Clone, PartialEq)]
pub enum ToIntegrationMessage {
    /// Command issued on the bus for an item (e.g. "ON", "UP", "STOP")
    Command { item_name: String, command: String },

    /// State update posted on the bus for an item
    Update { item_name: String, value: ItemValue },

    /// The host removed an item; its binding must go
    Remove { item_name: String },

    /// Configuration was reloaded; sent to every integration
    Reconfigure { config: Arc<Config> },
}

impl ToIntegrationMessage {
    /// Name of the item this message targets, `None` for broadcasts
    pub fn item_name(&self) -> Option<&str> {
        match self {
            ToIntegrationMessage::Command { item_name, .. }
            | ToIntegrationMessage::Update { item_name, .. }
            | ToIntegrationMessage::Remove { item_name } => Some(item_name),
            ToIntegrationMessage::Reconfigure { .. } => None,
        }
    }
}
