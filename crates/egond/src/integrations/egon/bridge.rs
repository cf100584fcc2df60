use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::binding::BindingRegistry;
use super::client::DeviceClient;
use super::client::DeviceError;
use super::client::Session;
use super::client::Transport;
use super::state::StateSnapshot;
use super::state::UNKNOWN_VALUE;
use super::state::to_item_value;
use crate::config::EgonConfig;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::ItemValue;

/// Whether the controller accepted our login at activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    Unconfigured,
    Active,
}

/// Poll/command loop between the engine and one Ego-n controller
///
/// The poll task writes the session's device id on every re-login while
/// command dispatch reads it; a stale id only costs a failed action.
pub struct Bridge<T> {
    client: DeviceClient<T>,
    session: RwLock<Session>,
    lifecycle: RwLock<Lifecycle>,
    registries: Vec<Arc<dyn BindingRegistry>>,
    to_engine: FromIntegrationSender,
}

impl<T: Transport> Bridge<T> {
    pub fn new(
        client: DeviceClient<T>,
        session: Session,
        registries: Vec<Arc<dyn BindingRegistry>>,
        to_engine: FromIntegrationSender,
    ) -> Self {
        Self {
            client,
            session: RwLock::new(session),
            lifecycle: RwLock::new(Lifecycle::Unconfigured),
            registries,
            to_engine,
        }
    }

    #[cfg(test)]
    pub fn client(&self) -> &DeviceClient<T> {
        &self.client
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    pub async fn session(&self) -> Session {
        self.session.read().await.clone()
    }

    /// Log in once and decide whether the integration is usable
    ///
    /// A device id of `0` means the controller knows no device for these
    /// credentials.
    pub async fn activate(&self) -> Lifecycle {
        let session = self.session().await;
        let lifecycle = match self.client.login(&session).await {
            Ok(device_id) => {
                let lifecycle = if device_id == "0" {
                    warn!("ABB Ego-n controller at {} reported no device", session.host);
                    Lifecycle::Unconfigured
                } else {
                    info!("Detected ABB Ego-n device: {}", device_id);
                    Lifecycle::Active
                };
                self.session.write().await.device_id = device_id;
                lifecycle
            }
            Err(e) => {
                error!("Cannot get ABB Ego-n user device: {}", e);
                Lifecycle::Unconfigured
            }
        };

        *self.lifecycle.write().await = lifecycle;
        lifecycle
    }

    /// Replace connection settings; the next `activate` decides the lifecycle
    ///
    /// A timeout the HTTP client rejects is logged and the old one kept.
    pub async fn apply_config(&self, config: &EgonConfig) {
        if let Err(e) = self.client.set_timeout(config.request_timeout()) {
            error!("Cannot apply ABB Ego-n request timeout: {}", e);
        }
        *self.session.write().await = Session::from_config(config);
        *self.lifecycle.write().await = Lifecycle::Unconfigured;
    }

    /// One poll cycle: re-login, fetch the snapshot, publish changed items
    ///
    /// Returns the number of updates published.
    pub async fn poll_once(&self) -> Result<usize, DeviceError> {
        let mut session = self.session().await;
        session.device_id = self.client.login(&session).await?;
        self.session.write().await.device_id = session.device_id.clone();

        let xml = self.client.fetch_state(&session).await?;
        let snapshot = StateSnapshot::parse(&xml)?;

        let mut published = 0;
        for registry in &self.registries {
            for item_name in registry.item_names() {
                let Some(element_id) = registry.element_id(&item_name) else {
                    continue;
                };

                let state = snapshot.value(&element_id);
                debug!("ABB Ego-n id: {} value: {}", element_id, state);

                if state == UNKNOWN_VALUE
                    || registry.last_state(&item_name).as_deref() == Some(state.as_str())
                {
                    continue;
                }

                registry.set_last_state(&item_name, &state);
                self.publish(&item_name, to_item_value(&state)).await;
                published += 1;
            }
        }

        Ok(published)
    }

    /// Run one poll cycle, logging instead of returning failures
    pub async fn run_cycle(&self) {
        match self.poll_once().await {
            Ok(published) => debug!("Ego-n poll cycle published {} update(s)", published),
            Err(e) => error!("Ego-n poll cycle failed: {}", e),
        }
    }

    /// Forward a bus command for `item_name` to the controller
    ///
    /// Failures are logged, never retried and never reported to the caller.
    pub async fn dispatch_command(&self, item_name: &str, command: &str) {
        debug!("Ego-n command for {}: {}", item_name, command);

        // Without a device id from activation the action URL would be
        // rejected by the controller, so nothing is sent.
        if self.lifecycle().await != Lifecycle::Active {
            warn!(
                "Dropping command {} for {}: Ego-n integration is not configured",
                command, item_name
            );
            return;
        }

        let Some(element_id) = self.resolve_element_id(item_name) else {
            warn!("No Ego-n element bound to item {}", item_name);
            return;
        };

        let session = self.session().await;
        if let Err(e) = self
            .client
            .send_action(&session, &element_id, command)
            .await
        {
            error!("Cannot send ABB Ego-n action: {}", e);
        }
    }

    /// Bus updates carry no work for the controller
    pub fn receive_update(&self, item_name: &str, value: &ItemValue) {
        debug!("Ignoring bus update for {}: {}", item_name, value);
    }

    /// Ask the controller to refresh its element states
    pub async fn refresh(&self) {
        let session = self.session().await;
        if let Err(e) = self.client.refresh(&session).await {
            error!("Cannot send ABB Ego-n refresh: {}", e);
        }
    }

    /// First registry holding a binding for the item wins
    fn resolve_element_id(&self, item_name: &str) -> Option<String> {
        self.registries
            .iter()
            .find_map(|registry| registry.element_id(item_name))
    }

    async fn publish(&self, item_name: &str, value: ItemValue) {
        let msg = FromIntegrationMessage::ItemStateChanged {
            item_name: item_name.to_string(),
            value,
        };
        if let Err(e) = self.to_engine.send(msg).await {
            warn!("Failed to send ItemStateChanged message: {}", e);
        }
    }
}

/// Running bridge: the shared loop state plus its poll task
pub struct BridgeHandle<T> {
    bridge: Arc<Bridge<T>>,
    poll_task: Option<JoinHandle<()>>,
}

/// Build a bridge for `config`, activate it and start polling when active
pub async fn start<T: Transport + 'static>(
    config: &EgonConfig,
    transport: T,
    registries: Vec<Arc<dyn BindingRegistry>>,
    to_engine: FromIntegrationSender,
) -> BridgeHandle<T> {
    let bridge = Bridge::new(
        DeviceClient::new(transport),
        Session::from_config(config),
        registries,
        to_engine,
    );
    let mut handle = BridgeHandle {
        bridge: Arc::new(bridge),
        poll_task: None,
    };
    handle.activate(config.refresh_interval()).await;
    handle
}

impl<T: Transport + 'static> BridgeHandle<T> {
    pub fn bridge(&self) -> &Arc<Bridge<T>> {
        &self.bridge
    }

    pub fn is_polling(&self) -> bool {
        self.poll_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop polling, apply new settings and activate again
    pub async fn reconfigure(&mut self, config: &EgonConfig) {
        info!("Reconfiguring ABB Ego-n integration for {}", config.host());
        self.halt().await;
        self.bridge.apply_config(config).await;
        self.activate(config.refresh_interval()).await;
    }

    pub async fn stop(mut self) {
        self.halt().await;
        info!("ABB Ego-n polling stopped");
    }

    async fn activate(&mut self, refresh: Duration) {
        if self.bridge.activate().await == Lifecycle::Active {
            self.poll_task = Some(spawn_poll_loop(self.bridge.clone(), refresh));
        }
    }

    async fn halt(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
            // Cancellation is the expected outcome
            let _ = task.await;
        }
    }
}

impl<T> Drop for BridgeHandle<T> {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

fn spawn_poll_loop<T: Transport + 'static>(
    bridge: Arc<Bridge<T>>,
    refresh: Duration,
) -> JoinHandle<()> {
    let refresh = refresh.max(Duration::from_millis(1));
    info!("Polling ABB Ego-n every {:?}", refresh);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh);
        // A slow cycle delays the next one instead of bunching them up
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            bridge.run_cycle().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::egon::binding::ItemBindings;
    use crate::integrations::egon::client::MockTransport;
    use tokio::sync::mpsc;

    const XML_HEAD: &str = r#"<?xml version="1.0"?>"#;

    fn snapshot(states: &[(&str, &str)]) -> String {
        let nodes: String = states
            .iter()
            .map(|(id, value)| format!(r#"<element_state id="{}" value="{}"/>"#, id, value))
            .collect();
        format!(
            "{}<egon_data><element_states>{}</element_states></egon_data>",
            XML_HEAD, nodes
        )
    }

    fn session() -> Session {
        Session {
            host: "http://10.0.0.2:80".to_string(),
            user: "admin".to_string(),
            password: "secret".to_string(),
            device_id: String::new(),
        }
    }

    struct Fixture {
        bridge: Bridge<MockTransport>,
        transport: MockTransport,
        bindings: Arc<ItemBindings>,
        rx: mpsc::Receiver<FromIntegrationMessage>,
    }

    fn fixture(items: &[(&str, &str)]) -> Fixture {
        let transport = MockTransport::new();
        let bindings = Arc::new(ItemBindings::new());
        for (item, element) in items {
            bindings.bind(item, element).unwrap();
        }
        let (tx, rx) = mpsc::channel(64);
        let bridge = Bridge::new(
            DeviceClient::new(transport.clone()),
            session(),
            vec![bindings.clone() as Arc<dyn BindingRegistry>],
            tx,
        );
        Fixture {
            bridge,
            transport,
            bindings,
            rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<FromIntegrationMessage>) -> Vec<FromIntegrationMessage> {
        let mut msgs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    fn changed(item: &str, value: ItemValue) -> FromIntegrationMessage {
        FromIntegrationMessage::ItemStateChanged {
            item_name: item.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn test_device_zero_stays_unconfigured() {
        let f = fixture(&[]);
        f.transport.respond("/authorize.html", "device=0\n");

        assert_eq!(f.bridge.activate().await, Lifecycle::Unconfigured);
        assert_eq!(f.bridge.lifecycle().await, Lifecycle::Unconfigured);
    }

    #[tokio::test]
    async fn test_device_id_activates() {
        let f = fixture(&[]);
        f.transport.respond("/authorize.html", "device=12\n");

        assert_eq!(f.bridge.activate().await, Lifecycle::Active);
        assert_eq!(f.bridge.session().await.device_id, "12");
    }

    #[tokio::test]
    async fn test_failed_login_stays_unconfigured() {
        let f = fixture(&[]);
        f.transport.respond("/authorize.html", "Wrong password\n");
        assert_eq!(f.bridge.activate().await, Lifecycle::Unconfigured);

        f.transport.fail("/authorize.html", "connection refused");
        assert_eq!(f.bridge.activate().await, Lifecycle::Unconfigured);
    }

    #[tokio::test]
    async fn test_shutter_scenario() {
        let mut f = fixture(&[("Blind", "3")]);
        f.bindings.set_last_state("Blind", "DOWN");
        f.transport.respond("/authorize.html", "device=12\n");
        f.transport.respond(
            "/state.html",
            r#"<?xml version="1.0"?><egon_data><element_states><element_state id="3" value="up"/></element_states></egon_data>"#,
        );

        assert_eq!(f.bridge.poll_once().await.unwrap(), 1);
        assert_eq!(f.bindings.last_state("Blind").as_deref(), Some("UP"));
        assert_eq!(drain(&mut f.rx), vec![changed("Blind", ItemValue::Percent(0))]);
        assert_eq!(
            f.transport.requests(),
            vec![
                "/authorize.html?user=admin&password=secret",
                "/state.html?device=12",
            ]
        );
    }

    #[tokio::test]
    async fn test_decision_table() {
        let mut f = fixture(&[
            ("Up", "1"),
            ("Down", "2"),
            ("Temperature", "3"),
            ("Light", "4"),
            ("Missing", "99"),
        ]);
        f.transport.respond("/authorize.html", "device=12\n");
        f.transport.respond(
            "/state.html",
            &snapshot(&[("1", "up"), ("2", "down"), ("3", "21.5"), ("4", "on")]),
        );

        assert_eq!(f.bridge.poll_once().await.unwrap(), 4);

        let msgs = drain(&mut f.rx);
        assert_eq!(msgs.len(), 4);
        assert!(msgs.contains(&changed("Up", ItemValue::Percent(0))));
        assert!(msgs.contains(&changed("Down", ItemValue::Percent(100))));
        assert!(msgs.contains(&changed(
            "Temperature",
            ItemValue::Decimal("21.5".parse().unwrap())
        )));
        assert!(msgs.contains(&changed("Light", ItemValue::String("ON".to_string()))));
        assert_eq!(f.bindings.last_state("Missing"), None);
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_publishes_nothing() {
        let mut f = fixture(&[("Light", "4")]);
        f.transport.respond("/authorize.html", "device=12\n");
        f.transport.respond("/state.html", &snapshot(&[("4", "on")]));

        assert_eq!(f.bridge.poll_once().await.unwrap(), 1);
        drain(&mut f.rx);

        assert_eq!(f.bridge.poll_once().await.unwrap(), 0);
        assert!(drain(&mut f.rx).is_empty());

        f.transport.respond("/state.html", &snapshot(&[("4", "off")]));
        assert_eq!(f.bridge.poll_once().await.unwrap(), 1);
        assert_eq!(
            drain(&mut f.rx),
            vec![changed("Light", ItemValue::String("OFF".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_login_failure_aborts_cycle() {
        let mut f = fixture(&[("Light", "4")]);
        f.transport.respond("/authorize.html", "Unauthorized\n");
        f.transport.respond("/state.html", &snapshot(&[("4", "on")]));

        let err = f.bridge.poll_once().await.unwrap_err();
        assert!(matches!(err, DeviceError::Protocol { .. }));
        assert_eq!(f.transport.requests().len(), 1);
        assert!(drain(&mut f.rx).is_empty());

        // Logged, not propagated
        f.bridge.run_cycle().await;
    }

    #[tokio::test]
    async fn test_non_xml_state_aborts_cycle() {
        let mut f = fixture(&[("Light", "4")]);
        f.transport.respond("/authorize.html", "device=12\n");
        f.transport.respond("/state.html", "Internal error\n");

        assert!(f.bridge.poll_once().await.is_err());
        assert!(drain(&mut f.rx).is_empty());
        assert_eq!(f.bindings.last_state("Light"), None);
    }

    #[tokio::test]
    async fn test_poll_updates_device_id() {
        let f = fixture(&[]);
        f.transport.respond("/authorize.html", "device=12\n");
        f.bridge.activate().await;

        f.transport.respond("/authorize.html", "device=13\n");
        f.transport.respond("/state.html", &snapshot(&[]));
        f.bridge.poll_once().await.unwrap();

        assert_eq!(f.bridge.session().await.device_id, "13");
        assert_eq!(
            f.transport.requests().last().map(String::as_str),
            Some("/state.html?device=13")
        );
    }

    #[tokio::test]
    async fn test_dispatch_command_sends_action() {
        let f = fixture(&[("Kitchen_Light", "5")]);
        f.transport.respond("/authorize.html", "device=12\n");
        f.bridge.activate().await;
        f.transport.clear_requests();

        f.transport.respond("/action.html", "OK\n");
        f.bridge.dispatch_command("Kitchen_Light", "ON").await;

        assert_eq!(
            f.transport.requests(),
            vec!["/action.html?action=ON&device=12&id=5"]
        );
    }

    #[tokio::test]
    async fn test_dispatch_command_failure_is_swallowed() {
        let f = fixture(&[("Kitchen_Light", "5")]);
        f.transport.respond("/authorize.html", "device=12\n");
        f.bridge.activate().await;
        f.transport.clear_requests();

        f.transport.respond("/action.html", "ERROR\n");
        f.bridge.dispatch_command("Kitchen_Light", "ON").await;
        f.transport.fail("/action.html", "timed out");
        f.bridge.dispatch_command("Kitchen_Light", "OFF").await;

        // Never retried
        assert_eq!(f.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_command_requires_active() {
        let f = fixture(&[("Kitchen_Light", "5")]);
        f.transport.respond("/authorize.html", "device=0\n");
        f.bridge.activate().await;
        f.transport.clear_requests();

        f.bridge.dispatch_command("Kitchen_Light", "ON").await;
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_command_unbound_item() {
        let f = fixture(&[]);
        f.transport.respond("/authorize.html", "device=12\n");
        f.bridge.activate().await;
        f.transport.clear_requests();

        f.bridge.dispatch_command("Ghost", "ON").await;
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_command_resolved_across_registries() {
        let transport = MockTransport::new();
        let first = Arc::new(ItemBindings::new());
        first.bind("Hall", "1").unwrap();
        let second = Arc::new(ItemBindings::new());
        second.bind("Porch", "2").unwrap();
        let (tx, _rx) = mpsc::channel(8);

        let bridge = Bridge::new(
            DeviceClient::new(transport.clone()),
            session(),
            vec![
                first as Arc<dyn BindingRegistry>,
                second as Arc<dyn BindingRegistry>,
            ],
            tx,
        );
        transport.respond("/authorize.html", "device=12\n");
        transport.respond("/action.html", "OK\n");
        bridge.activate().await;
        transport.clear_requests();

        bridge.dispatch_command("Porch", "OFF").await;
        assert_eq!(
            transport.requests(),
            vec!["/action.html?action=OFF&device=12&id=2"]
        );
    }

    #[tokio::test]
    async fn test_updates_are_discarded() {
        let mut f = fixture(&[("Light", "4")]);
        f.bridge
            .receive_update("Light", &ItemValue::String("ON".to_string()));

        assert!(f.transport.requests().is_empty());
        assert!(drain(&mut f.rx).is_empty());
    }

    #[tokio::test]
    async fn test_refresh_sends_request() {
        let f = fixture(&[]);
        f.transport.respond("/refresh.html", "anything");
        f.bridge.refresh().await;

        assert_eq!(f.bridge.client().transport().requests(), vec!["/refresh.html?device="]);
    }

    fn config(ip: &str) -> EgonConfig {
        EgonConfig {
            ip: ip.to_string(),
            user: Some("admin".to_string()),
            password: Some("secret".to_string()),
            ..EgonConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_polls_until_stopped() {
        let transport = MockTransport::new();
        transport.respond("/authorize.html", "device=12\n");
        transport.respond("/state.html", &snapshot(&[("4", "on")]));
        let bindings = Arc::new(ItemBindings::new());
        bindings.bind("Light", "4").unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = start(
            &config("10.0.0.2"),
            transport.clone(),
            vec![bindings.clone() as Arc<dyn BindingRegistry>],
            tx,
        )
        .await;
        assert_eq!(handle.bridge().lifecycle().await, Lifecycle::Active);
        assert!(handle.is_polling());

        // The first tick fires immediately
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(msg, Some(changed("Light", ItemValue::String("ON".to_string()))));

        handle.stop().await;
        assert_eq!(bindings.last_state("Light").as_deref(), Some("ON"));
    }

    #[tokio::test]
    async fn test_start_unconfigured_does_not_poll() {
        let transport = MockTransport::new();
        transport.respond("/authorize.html", "device=0\n");
        let (tx, _rx) = mpsc::channel(8);

        let handle = start(&config("10.0.0.2"), transport.clone(), Vec::new(), tx).await;
        assert_eq!(handle.bridge().lifecycle().await, Lifecycle::Unconfigured);
        assert!(!handle.is_polling());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_reconfigure_switches_host() {
        let transport = MockTransport::new();
        transport.respond("/authorize.html", "device=0\n");
        let (tx, _rx) = mpsc::channel(8);

        let mut handle = start(&config("10.0.0.2"), transport.clone(), Vec::new(), tx).await;
        assert!(!handle.is_polling());

        transport.respond("/authorize.html", "device=7\n");
        transport.respond("/state.html", &snapshot(&[]));
        handle.reconfigure(&config("10.0.0.3")).await;

        assert_eq!(handle.bridge().lifecycle().await, Lifecycle::Active);
        let session = handle.bridge().session().await;
        assert_eq!(session.host, "http://10.0.0.3:80");
        assert_eq!(session.device_id, "7");
        assert!(handle.is_polling());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_reconfigure_applies_request_timeout() {
        let transport = MockTransport::new();
        transport.respond("/authorize.html", "device=0
");
        let (tx, _rx) = mpsc::channel(8);

        let mut handle = start(&config("10.0.0.2"), transport.clone(), Vec::new(), tx).await;
        assert_eq!(transport.timeout(), None);

        let mut next = config("10.0.0.2");
        next.request_timeout_ms = Some(5);
        handle.reconfigure(&next).await;
        assert_eq!(transport.timeout(), Some(Duration::from_millis(5)));

        handle.reconfigure(&config("10.0.0.2")).await;
        assert_eq!(transport.timeout(), None);

        handle.stop().await;
    }
}
