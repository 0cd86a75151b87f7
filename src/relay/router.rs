use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::message::RelayMessage;
use crate::storage::StorageBridge;

/// A context that can attach to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// Outer content surface (toolbar UI)
    Surface,
    /// Nested sandboxed frame running the proxied page
    Frame,
    /// Panel host
    Host,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Surface => "surface",
            Endpoint::Frame => "frame",
            Endpoint::Host => "host",
        }
    }
}

impl std::str::FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "surface" => Ok(Endpoint::Surface),
            "frame" => Ok(Endpoint::Frame),
            "host" => Ok(Endpoint::Host),
            other => Err(format!("unknown endpoint '{}'", other)),
        }
    }
}

/// One outgoing message produced by routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: Endpoint,
    pub message: RelayMessage,
}

impl Delivery {
    fn new(to: Endpoint, message: RelayMessage) -> Self {
        Self { to, message }
    }
}

struct Attachment {
    id: u64,
    tx: mpsc::UnboundedSender<RelayMessage>,
}

/// Message bus between the surface, the nested frame and the host.
///
/// Storage commands are answered here from the [`StorageBridge`]; everything
/// else is forwarded according to its command tag. Messages for an endpoint
/// that is not attached are dropped.
pub struct FrameMessageRouter {
    storage: Arc<StorageBridge>,
    endpoints: RwLock<HashMap<Endpoint, Attachment>>,
    next_id: AtomicU64,
}

impl FrameMessageRouter {
    pub fn new(storage: Arc<StorageBridge>) -> Self {
        Self {
            storage,
            endpoints: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn storage(&self) -> &Arc<StorageBridge> {
        &self.storage
    }

    /// Attach `endpoint`, replacing any previous attachment. The returned id
    /// is needed to detach.
    pub fn attach(&self, endpoint: Endpoint) -> (u64, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(endpoint, Attachment { id, tx });
        if previous.is_some() {
            tracing::debug!("{} re-attached, previous connection replaced", endpoint.as_str());
        }
        (id, rx)
    }

    /// Detach `endpoint` if `id` is still its current attachment.
    pub fn detach(&self, endpoint: Endpoint, id: u64) {
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if endpoints.get(&endpoint).is_some_and(|a| a.id == id) {
            endpoints.remove(&endpoint);
        }
    }

    /// Decide where a message goes, performing any storage side effect.
    pub fn route(&self, from: Endpoint, message: RelayMessage) -> Vec<Delivery> {
        use Endpoint::*;
        use RelayMessage as M;

        match (&message, from) {
            (M::TogglePicker { enabled }, Surface | Host) => {
                let mut out = Vec::with_capacity(2);
                if *enabled {
                    out.push(Delivery::new(Surface, M::ToggleSnipper { enabled: false }));
                }
                out.push(Delivery::new(Frame, message));
                out
            }
            (M::ToggleSnipper { enabled }, Surface | Host) => {
                let mut out = Vec::with_capacity(2);
                if *enabled {
                    out.push(Delivery::new(Surface, M::TogglePicker { enabled: false }));
                }
                out.push(Delivery::new(Frame, message));
                out
            }
            (M::TogglePicker { .. } | M::ToggleSnipper { .. }, Frame) => {
                vec![Delivery::new(Surface, message)]
            }

            // A pick ends picking, so the surface resets its toggle too
            (M::ElementPicked { .. }, Frame) => vec![
                Delivery::new(Host, message),
                Delivery::new(Surface, M::TogglePicker { enabled: false }),
            ],
            (M::ElementPicked { .. } | M::ScreenshotCaptured { .. }, Surface | Frame) => {
                vec![Delivery::new(Host, message)]
            }

            (M::StorageRequest { scope }, _) => {
                let data = self.storage.read(*scope);
                vec![Delivery::new(from, M::StorageData { scope: *scope, data })]
            }
            (M::StorageUpdate { scope, action, key, value }, _) => {
                match self.storage.write(*scope, *action, key.as_deref(), value.as_deref()) {
                    Ok(data) => {
                        let reply = M::StorageData { scope: *scope, data };
                        vec![
                            Delivery::new(Surface, reply.clone()),
                            Delivery::new(Frame, reply),
                        ]
                    }
                    Err(e) => {
                        tracing::debug!("storageUpdate from {} rejected: {}", from.as_str(), e);
                        Vec::new()
                    }
                }
            }

            (M::ToggleInternalDevTools { .. } | M::UpdateChiiUrl { .. }, Host | Frame) => {
                vec![Delivery::new(Surface, message)]
            }
            (M::PickerEligibility { .. } | M::UpdateUrl { .. } | M::DevToolsStatus { .. }, Host) => {
                vec![Delivery::new(Surface, message)]
            }
            (M::OpenDevTools | M::LoadUrl { .. }, Surface | Frame) => {
                vec![Delivery::new(Host, message)]
            }

            _ => {
                tracing::debug!("No route for {} from {}", message.command(), from.as_str());
                Vec::new()
            }
        }
    }

    /// Route and deliver a message. Returns how many endpoints received it.
    pub fn dispatch(&self, from: Endpoint, message: RelayMessage) -> usize {
        let deliveries = self.route(from, message);
        let endpoints = self
            .endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        deliveries
            .into_iter()
            .filter(|d| match endpoints.get(&d.to) {
                Some(attachment) => attachment.tx.send(d.message.clone()).is_ok(),
                None => {
                    tracing::debug!(
                        "Dropping {} for detached {}",
                        d.message.command(),
                        d.to.as_str()
                    );
                    false
                }
            })
            .count()
    }
}
