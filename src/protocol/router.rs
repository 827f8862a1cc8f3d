// src/protocol/router.rs
//
// Routes incoming messages to the settings model, to listeners and to awaited
// requests. Correlation is by op name: at most one awaited request per op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::oneshot;

use super::device::Device;
use super::message::{Message, MessageType, Op, Payload, Route};
use crate::io::error::LinkError;
use crate::io::subscribers::{SubscriptionId, Subscribers};

/// Owner of the device data model.
///
/// Receives every device snapshot read from the device and produces the snapshot
/// sent on commit.
pub trait SettingsModel: Send + Sync {
    fn on_device_snapshot(&self, device: Device);

    /// Snapshot to send with write.device, or `None` when there is nothing to write
    fn build_write_request(&self) -> Option<Device>;
}

/// Response future for an awaited request
pub struct PendingResponse {
    op: Op,
    rx: oneshot::Receiver<Message>,
}

impl PendingResponse {
    /// Wait for the response. Fails with `Disconnected` if the connection is torn
    /// down first.
    pub async fn wait(self) -> Result<Message, LinkError> {
        match self.rx.await {
            Ok(message) => Ok(message),
            Err(_) => {
                tlog!("[router] Pending {} abandoned", self.op);
                Err(LinkError::Disconnected)
            }
        }
    }
}

/// Dispatch table for decoded messages
pub struct MessageRouter {
    model: RwLock<Option<Arc<dyn SettingsModel>>>,
    listeners: Subscribers<Message>,
    pending: Mutex<HashMap<Op, oneshot::Sender<Message>>>,
}

impl MessageRouter {
    pub fn new(model: Option<Arc<dyn SettingsModel>>) -> Self {
        MessageRouter {
            model: RwLock::new(model),
            listeners: Subscribers::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_model(&self, model: Option<Arc<dyn SettingsModel>>) {
        if let Ok(mut guard) = self.model.write() {
            *guard = model;
        }
    }

    pub fn model(&self) -> Option<Arc<dyn SettingsModel>> {
        self.model.read().ok().and_then(|m| m.clone())
    }

    /// Listen for messages, optionally only those on one route.
    pub fn subscribe<F>(&self, route: Option<Route>, callback: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.listeners.subscribe(move |message: &Message| {
            if route.map_or(true, |r| r == message.route()) {
                callback(message);
            }
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Reserve the response slot for `op`.
    pub fn register_pending(&self, op: Op) -> Result<PendingResponse, LinkError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = pending.get(&op) {
            if !existing.is_closed() {
                return Err(LinkError::RequestInFlight(op.as_str().to_string()));
            }
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(op, tx);
        Ok(PendingResponse { op, rx })
    }

    /// Release the slot for `op` without completing it.
    pub fn cancel_pending(&self, op: Op) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&op);
        }
    }

    /// Fail every awaited request with `Disconnected`.
    pub fn fail_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if !pending.is_empty() {
                tlog!("[router] Dropping {} pending request(s)", pending.len());
            }
            pending.clear();
        }
    }

    pub fn has_pending(&self, op: Op) -> bool {
        self.pending
            .lock()
            .map(|p| p.get(&op).is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Deliver one message.
    ///
    /// A read.device response goes to the settings model (or to listeners when no
    /// model is installed). Everything else goes to listeners. Any response also
    /// completes the awaited request for its op.
    pub fn dispatch(&self, message: Message) {
        if message.kind == MessageType::Response {
            let waiter = self.pending.lock().ok().and_then(|mut p| p.remove(&message.op));
            if let Some(tx) = waiter {
                let _ = tx.send(message.clone());
            }
        }

        if let (Op::ReadDevice, MessageType::Response, Payload::Device(device)) =
            (message.op, message.kind, &message.payload)
        {
            if let Some(model) = self.model() {
                tlog!(
                    "[router] Device snapshot: {} module(s), {} setting(s)",
                    device.modules.len(),
                    device.settings().count()
                );
                model.on_device_snapshot(device.clone());
                return;
            }
        }

        self.listeners.emit(&message);
    }
}
