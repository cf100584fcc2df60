use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::Url;
use tracing::debug;

use crate::config::EgonConfig;

/// HTTP endpoints exposed by the Ego-n controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Endpoint {
    Authorize,
    State,
    Action,
    Refresh,
}

impl Endpoint {
    pub fn path(self) -> String {
        let name: &'static str = self.into();
        format!("/{}.html", name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Malformed URL, connection failure or non-2xx status
    #[error("request to {path} failed: {message}")]
    Transport { path: String, message: String },

    /// The controller answered with a body we do not understand
    #[error("unexpected {endpoint} response: {body:?}")]
    Protocol { endpoint: Endpoint, body: String },

    #[error("malformed state snapshot: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Connection settings and the device id handed out by the last login
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub host: String,
    pub user: String,
    pub password: String,
    pub device_id: String,
}

impl Session {
    /// Session for the given config; no device id until the first login
    pub fn from_config(config: &EgonConfig) -> Self {
        Self {
            host: config.host(),
            user: config.user().to_string(),
            password: config.password().to_string(),
            device_id: String::new(),
        }
    }
}

/// Trait for the raw HTTP GET the controller protocol is built on
///
/// This trait allows for mocking the controller for testing purposes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url` and return the response body
    async fn get(&self, url: &Url) -> Result<String, DeviceError>;

    /// Apply a new per-request timeout; `None` means no timeout
    fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), DeviceError>;
}

/// Real transport implementation using reqwest
///
/// The client is swapped as a whole when the timeout changes; requests in
/// flight finish on the client they started with.
pub struct ReqwestTransport {
    http: ArcSwap<reqwest::Client>,
}

fn build_client(timeout: Option<Duration>) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build()
}

impl ReqwestTransport {
    pub fn new(timeout: Option<Duration>) -> anyhow::Result<Self> {
        let http = build_client(timeout).context("Failed to build HTTP client")?;
        Ok(Self {
            http: ArcSwap::from_pointee(http),
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &Url) -> Result<String, DeviceError> {
        // The query string carries credentials, keep it out of errors
        let transport_error = |e: reqwest::Error| DeviceError::Transport {
            path: url.path().to_string(),
            message: e.without_url().to_string(),
        };

        let http = self.http.load_full();
        let response = http
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(transport_error)?;

        response.text().await.map_err(transport_error)
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), DeviceError> {
        let http = build_client(timeout).map_err(|e| DeviceError::Client(e.to_string()))?;
        self.http.store(std::sync::Arc::new(http));
        Ok(())
    }
}

/// Mock transport for testing
///
/// Answers by URL path and records every request as `path?query`.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: std::sync::Arc<std::sync::Mutex<MockState>>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MockState {
    responses: std::collections::HashMap<String, Result<String, String>>,
    requests: Vec<String>,
    timeout: Option<Duration>,
}

#[cfg(test)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests to `path` with `body`
    pub fn respond(&self, path: &str, body: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .responses
            .insert(path.to_string(), Ok(body.to_string()));
    }

    /// Fail requests to `path` at the transport level
    pub fn fail(&self, path: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .responses
            .insert(path.to_string(), Err(message.to_string()));
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    /// Timeout from the last `set_timeout` call
    pub fn timeout(&self) -> Option<Duration> {
        self.state.lock().unwrap().timeout
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, url: &Url) -> Result<String, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state
            .requests
            .push(format!("{}?{}", url.path(), url.query().unwrap_or("")));

        match state.responses.get(url.path()) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(message)) => Err(DeviceError::Transport {
                path: url.path().to_string(),
                message: message.clone(),
            }),
            None => Err(DeviceError::Transport {
                path: url.path().to_string(),
                message: "connection refused".to_string(),
            }),
        }
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), DeviceError> {
        self.state.lock().unwrap().timeout = timeout;
        Ok(())
    }
}

/// Bodies are compared line by line, each line terminated by `\n`, so `OK`
/// and `OK\r\n` both read as `OK\n`.
fn normalize_body(body: &str) -> String {
    body.lines().map(|line| format!("{}\n", line)).collect()
}

/// Client for the controller's login, state, action and refresh endpoints
pub struct DeviceClient<T> {
    transport: T,
}

impl<T: Transport> DeviceClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), DeviceError> {
        self.transport.set_timeout(timeout)
    }

    async fn get(
        &self,
        host: &str,
        endpoint: Endpoint,
        params: &[(&str, &str)],
    ) -> Result<String, DeviceError> {
        let raw = format!("{}{}", host, endpoint.path());
        let url = Url::parse_with_params(&raw, params).map_err(|e| DeviceError::Transport {
            path: endpoint.path(),
            message: format!("the URL '{}' is malformed: {}", raw, e),
        })?;

        let body = normalize_body(&self.transport.get(&url).await?);
        debug!("Ego-n {} response: {:?}", endpoint, body);
        Ok(body)
    }

    /// Log in and return the device id for this session
    pub async fn login(&self, session: &Session) -> Result<String, DeviceError> {
        let body = self
            .get(
                &session.host,
                Endpoint::Authorize,
                &[("user", session.user.as_str()), ("password", session.password.as_str())],
            )
            .await?;

        let device_id = body.replace("device=", "").replace('\n', "");
        if device_id.parse::<i32>().is_err() {
            return Err(DeviceError::Protocol {
                endpoint: Endpoint::Authorize,
                body,
            });
        }

        Ok(device_id)
    }

    /// Fetch the XML state snapshot
    pub async fn fetch_state(&self, session: &Session) -> Result<String, DeviceError> {
        let body = self
            .get(
                &session.host,
                Endpoint::State,
                &[("device", session.device_id.as_str())],
            )
            .await?;

        if !body.starts_with("<?xml ") {
            return Err(DeviceError::Protocol {
                endpoint: Endpoint::State,
                body,
            });
        }

        Ok(body)
    }

    /// Ask the controller to apply `command` to one element
    pub async fn send_action(
        &self,
        session: &Session,
        element_id: &str,
        command: &str,
    ) -> Result<(), DeviceError> {
        let body = self
            .get(
                &session.host,
                Endpoint::Action,
                &[
                    ("action", command),
                    ("device", session.device_id.as_str()),
                    ("id", element_id),
                ],
            )
            .await?;

        if body != "OK\n" {
            return Err(DeviceError::Protocol {
                endpoint: Endpoint::Action,
                body,
            });
        }

        Ok(())
    }

    /// Ask the controller to refresh its element states. The body is only logged.
    pub async fn refresh(&self, session: &Session) -> Result<(), DeviceError> {
        self.get(
            &session.host,
            Endpoint::Refresh,
            &[("device", session.device_id.as_str())],
        )
        .await
        .map(|_| ())
    }
}
