//! Webhook registry and delivery.
//!
//! Webhooks subscribe to named events. [`WebhookRegistry::notify`] posts a
//! `{event, timestamp, data}` JSON body to every active subscriber in the
//! background; delivery failures are logged and never reach the caller.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

pub const EVENT_SCRAPE_COMPLETE: &str = "scrape_complete";
pub const EVENT_SCRAPE_ERROR: &str = "scrape_error";
pub const EVENT_BATCH_COMPLETE: &str = "batch_complete";
pub const EVENT_PROFILE_CHANGED: &str = "profile_changed";

/// Events a webhook receives when registered without an explicit list.
pub const DEFAULT_EVENTS: [&str; 4] = [
    EVENT_SCRAPE_COMPLETE,
    EVENT_SCRAPE_ERROR,
    EVENT_BATCH_COMPLETE,
    EVENT_PROFILE_CHANGED,
];

const USER_AGENT: &str = "Bumi-Webhook/1.0";
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// A registered webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub active: bool,
}

impl Webhook {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.active && self.events.iter().any(|e| e == event)
    }
}

/// Body posted to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Outcome of one delivery attempt.
#[derive(Debug)]
pub struct Delivery {
    pub webhook_id: String,
    pub url: String,
    /// HTTP status on success.
    pub result: Result<u16>,
}

/// Thread-safe set of webhooks keyed by id. Clones share the same set.
#[derive(Clone)]
pub struct WebhookRegistry {
    client: reqwest::Client,
    hooks: Arc<RwLock<BTreeMap<String, Webhook>>>,
    /// Background deliveries started by `notify` that may still be running.
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WebhookRegistry {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| Error::config("webhook.client", e.to_string()))?;

        Ok(Self {
            client,
            hooks: Arc::new(RwLock::new(BTreeMap::new())),
            pending: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Webhook>> {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Webhook>> {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) a webhook. A missing id is generated, missing
    /// events default to [`DEFAULT_EVENTS`]. Returns the webhook id.
    pub fn register(
        &self,
        id: Option<&str>,
        url: &str,
        events: Option<Vec<String>>,
        headers: BTreeMap<String, String>,
    ) -> Result<String> {
        let parsed = Url::parse(url).map_err(|e| Error::Webhook {
            url: url.to_string(),
            message: format!("invalid URL: {}", e),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Webhook {
                url: url.to_string(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let id = match id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => format!("webhook_{}", uuid::Uuid::new_v4().simple()),
        };
        let events = events
            .filter(|events| !events.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENTS.iter().map(|e| e.to_string()).collect());

        debug!("Registered webhook {} -> {} for {:?}", id, url, events);
        self.write().insert(
            id.clone(),
            Webhook {
                url: url.to_string(),
                events,
                headers,
                active: true,
            },
        );
        Ok(id)
    }

    /// Remove a webhook. Returns whether it existed.
    pub fn unregister(&self, id: &str) -> bool {
        self.write().remove(id).is_some()
    }

    /// Pause or resume deliveries to a webhook. Returns whether it exists.
    pub fn set_active(&self, id: &str, active: bool) -> bool {
        match self.write().get_mut(id) {
            Some(hook) => {
                hook.active = active;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Webhook> {
        self.read().get(id).cloned()
    }

    pub fn list(&self) -> BTreeMap<String, Webhook> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn subscribers(&self, event: &str) -> Vec<(String, Webhook)> {
        self.read()
            .iter()
            .filter(|(_, hook)| hook.subscribes_to(event))
            .map(|(id, hook)| (id.clone(), hook.clone()))
            .collect()
    }

    /// Send `event` to every subscriber in the background. Returns how many
    /// deliveries were started. Outside a tokio runtime nothing is sent.
    pub fn notify(&self, event: &str, data: Value) -> usize {
        let targets = self.subscribers(event);
        if targets.is_empty() {
            return 0;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No async runtime, dropping {} notification for {} webhook(s)",
                event,
                targets.len()
            );
            return 0;
        };

        let payload = Arc::new(payload(event, data));
        let count = targets.len();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|handle| !handle.is_finished());
        for (id, hook) in targets {
            let client = self.client.clone();
            let payload = Arc::clone(&payload);
            pending.push(runtime.spawn(async move {
                deliver(&client, id, hook, &payload).await;
            }));
        }
        count
    }

    /// Wait for every background delivery started by [`notify`](Self::notify)
    /// so far. Call before exiting so queued notifications are not dropped.
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.drain(..).collect()
        };
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Webhook delivery task failed: {}", e);
            }
        }
    }

    /// Send `event` to every subscriber and wait for all deliveries.
    pub async fn notify_and_wait(&self, event: &str, data: Value) -> Vec<Delivery> {
        let targets = self.subscribers(event);
        let payload = payload(event, data);
        join_all(
            targets
                .into_iter()
                .map(|(id, hook)| deliver(&self.client, id, hook, &payload)),
        )
        .await
    }
}

impl std::fmt::Debug for WebhookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookRegistry")
            .field("hooks", &self.read().len())
            .finish()
    }
}

fn payload(event: &str, data: Value) -> WebhookPayload {
    WebhookPayload {
        event: event.to_string(),
        timestamp: Utc::now(),
        data,
    }
}

async fn deliver(
    client: &reqwest::Client,
    webhook_id: String,
    hook: Webhook,
    payload: &WebhookPayload,
) -> Delivery {
    let mut request = client.post(&hook.url).json(payload);
    for (name, value) in &hook.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let result = match request.send().await {
        Ok(response) if response.status().is_success() => {
            debug!(
                "Webhook {}: sent {} to {}, status {}",
                webhook_id,
                payload.event,
                hook.url,
                response.status()
            );
            Ok(response.status().as_u16())
        }
        Ok(response) => Err(Error::Webhook {
            url: hook.url.clone(),
            message: format!("HTTP {}", response.status()),
        }),
        Err(e) => Err(Error::Webhook {
            url: hook.url.clone(),
            message: e.to_string(),
        }),
    };

    if let Err(e) = &result {
        warn!("Webhook {}: {} ({})", webhook_id, e, payload.event);
    }

    Delivery {
        webhook_id,
        url: hook.url,
        result,
    }
}
