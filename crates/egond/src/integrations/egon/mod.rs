mod binding;
mod bridge;
mod client;
mod integration;
mod state;

use anyhow::Context;
use linkme::distributed_slice;

pub use binding::BindingChanges;
pub use binding::BindingError;
pub use binding::BindingRegistry;
pub use binding::ItemBinding;
pub use binding::ItemBindings;
pub use bridge::start;
pub use bridge::Bridge;
pub use bridge::BridgeHandle;
pub use bridge::Lifecycle;
pub use client::DeviceClient;
pub use client::DeviceError;
pub use client::Endpoint;
pub use client::ReqwestTransport;
pub use client::Session;
pub use client::Transport;
pub use integration::EgonIntegration;
pub use state::extract_value;
pub use state::to_item_value;
pub use state::StateSnapshot;
pub use state::UNKNOWN_VALUE;

use crate::engine;

#[distributed_slice(engine::INTEGRATION_REGISTRY)]
fn init_egon(ctx: &engine::IntegrationContext) -> engine::IntegrationFactoryResult {
    let egon_config = if let Some(c) = &ctx.config.integrations.egon {
        c
    } else {
        return Ok(None);
    };

    let bindings =
        ItemBindings::from_config(&egon_config.items).context("Invalid Ego-n item binding")?;
    let transport = ReqwestTransport::new(egon_config.request_timeout())
        .context("Failed to create Ego-n HTTP client")?;
    Ok(Some(Box::new(EgonIntegration::new(
        transport,
        egon_config,
        bindings,
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_factory_skips_unconfigured() {
        let config = Config::default();
        let ctx = engine::IntegrationContext { config: &config };
        assert!(init_egon(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_factory_builds_integration() {
        let config = Config::from_toml(
            r#"
            [integrations.egon]
            ip = "10.0.0.2"

            [integrations.egon.items]
            Kitchen_Light = "5"
            "#,
        )
        .unwrap();
        let ctx = engine::IntegrationContext { config: &config };

        let integration = init_egon(&ctx).unwrap().unwrap();
        assert_eq!(integration.name(), "egon");
    }
}
