// src/connection.rs
//
// Connection manager: the public surface of the crate.
//
// Drives a transport through request -> open -> read loop -> close, wires the byte
// pump into the frame decoder and the decoder into the message router, and reports
// link failures once per connection.
//
//   Disconnected --open--> ConnectedIdle --start--> ConnectedReading --close--> Disconnected

use futures::StreamExt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::io::error::LinkError;
use crate::io::framer::decode;
use crate::io::pump::{BytePump, RawChunk};
use crate::io::serial::SerialProvider;
use crate::io::subscribers::{SubscriptionId, Subscribers};
use crate::io::transport::{Transport, TransportKind, TransportProvider};
use crate::io::usb::UsbProvider;
use crate::io::ConnectionState;
use crate::logging::hexdump;
use crate::protocol::codec::{encode, to_message};
use crate::protocol::device::{Device, WriteResult};
use crate::protocol::message::{Message, Op, Payload, Route};
use crate::protocol::router::{MessageRouter, SettingsModel};
use crate::settings::LinkSettings;

/// Bytes shown per write in logs
const LOG_HEXDUMP_LEN: usize = 32;

/// Everything tied to the current physical link
#[derive(Default)]
struct LinkSlot {
    /// Device handle; kept after close so connect() can reopen it
    transport: Option<Arc<dyn Transport>>,
    /// Bumped on every successful open so stale failure reports are ignored
    generation: u64,
    pump: Option<Arc<BytePump>>,
    decode_task: Option<JoinHandle<()>>,
    watch_task: Option<JoinHandle<()>>,
}

struct Inner {
    providers: Vec<Arc<dyn TransportProvider>>,
    settings: RwLock<LinkSettings>,
    state: watch::Sender<ConnectionState>,
    slot: Mutex<LinkSlot>,
    write_lock: Mutex<()>,
    router: MessageRouter,
    raw_tap: Arc<Subscribers<RawChunk>>,
    failures: Subscribers<LinkError>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        if let Some(task) = slot.watch_task.take() {
            task.abort();
        }
        if let Some(task) = slot.decode_task.take() {
            task.abort();
        }
        // BytePump's own Drop cancels the read loop
        slot.pump.take();
    }
}

/// Handle to one device connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connection using the host's serial and USB providers.
    pub fn new(settings: LinkSettings) -> Self {
        Self::with_providers(
            settings,
            vec![
                Arc::new(SerialProvider) as Arc<dyn TransportProvider>,
                Arc::new(UsbProvider),
            ],
        )
    }

    pub fn with_providers(
        settings: LinkSettings,
        providers: Vec<Arc<dyn TransportProvider>>,
    ) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        Connection {
            inner: Arc::new(Inner {
                providers,
                settings: RwLock::new(settings),
                state,
                slot: Mutex::new(LinkSlot::default()),
                write_lock: Mutex::new(()),
                router: MessageRouter::new(None),
                raw_tap: Arc::new(Subscribers::new()),
                failures: Subscribers::new(),
            }),
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn settings(&self) -> LinkSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the link settings. Takes effect on the next open.
    pub fn set_settings(&self, settings: LinkSettings) -> Result<(), LinkError> {
        settings.validate()?;
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
        Ok(())
    }

    pub fn set_settings_model(&self, model: Option<Arc<dyn SettingsModel>>) {
        self.inner.router.set_model(model);
    }

    fn provider(&self, kind: TransportKind) -> Result<Arc<dyn TransportProvider>, LinkError> {
        let provider = self
            .inner
            .providers
            .iter()
            .find(|p| p.kind() == kind)
            .cloned()
            .ok_or_else(|| LinkError::Unsupported(format!("no {} transport available", kind)))?;
        if !provider.is_supported() {
            return Err(LinkError::Unsupported(format!(
                "{} access is not available on this host",
                kind
            )));
        }
        Ok(provider)
    }

    /// Whether any transport kind can be used on this host
    pub fn is_supported(&self) -> bool {
        self.inner.providers.iter().any(|p| p.is_supported())
    }

    /// Whether `kind` can be used on this host
    pub fn is_kind_supported(&self, kind: TransportKind) -> bool {
        self.provider(kind).is_ok()
    }

    /// Transport kinds usable on this host
    pub fn available_kinds(&self) -> Vec<TransportKind> {
        self.inner
            .providers
            .iter()
            .filter(|p| p.is_supported())
            .map(|p| p.kind())
            .collect()
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.inner.state.send_replace(next);
        if prev != next {
            tlog!("[link] {} -> {}", prev, next);
        }
    }

    /// Description of the retained device handle, if any
    pub async fn device(&self) -> Option<String> {
        self.inner
            .slot
            .lock()
            .await
            .transport
            .as_ref()
            .map(|t| t.describe())
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Receive every raw chunk read from the device, before framing.
    pub fn on_data<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&RawChunk) + Send + Sync + 'static,
    {
        self.inner.raw_tap.subscribe(callback)
    }

    pub fn off_data(&self, id: SubscriptionId) -> bool {
        self.inner.raw_tap.unsubscribe(id)
    }

    /// Receive decoded messages, optionally only those on one route.
    pub fn subscribe<F>(&self, route: Option<Route>, callback: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(route, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.router.unsubscribe(id)
    }

    /// Called once for each connection that ends because of an error or unplug.
    pub fn on_failure<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LinkError) + Send + Sync + 'static,
    {
        self.inner.failures.subscribe(callback)
    }

    pub fn off_failure(&self, id: SubscriptionId) -> bool {
        self.inner.failures.unsubscribe(id)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Request a device (unless one is retained) and open it.
    pub async fn open(&self) -> Result<(), LinkError> {
        let mut slot = self.inner.slot.lock().await;
        if self.state().is_connected() {
            return Ok(());
        }

        let settings = self.settings();
        settings.validate()?;

        let transport = match slot.transport.clone() {
            Some(t) if t.kind() == settings.kind => t,
            _ => {
                slot.transport = None;
                self.set_state(ConnectionState::Requesting);
                let requested = match self.provider(settings.kind) {
                    Ok(provider) => provider.request(&settings.filters).await,
                    Err(e) => Err(e),
                };
                match requested {
                    Ok(t) => t,
                    Err(e) => {
                        tlog!("[link] Request failed: {}", e);
                        self.set_state(ConnectionState::Disconnected);
                        return Err(e);
                    }
                }
            }
        };

        self.set_state(ConnectionState::Opening);
        if let Err(e) = transport.open(&settings.transport_config()).await {
            tlog!("[link] Open failed: {}", e);
            // Next connect asks for a device again
            slot.transport = None;
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        slot.generation += 1;
        slot.transport = Some(transport.clone());
        slot.watch_task = Some(spawn_status_watch(
            Arc::downgrade(&self.inner),
            slot.generation,
            transport.status(),
        ));
        tlog!("[link] Opened {}", transport.describe());
        self.set_state(ConnectionState::ConnectedIdle);
        Ok(())
    }

    /// Start the read loop and decoder on an open link.
    pub async fn start(&self) -> Result<(), LinkError> {
        let mut slot = self.inner.slot.lock().await;
        match self.state() {
            ConnectionState::ConnectedReading => return Ok(()),
            ConnectionState::ConnectedIdle => {}
            _ => return Err(LinkError::NotConnected),
        }
        let transport = slot.transport.clone().ok_or(LinkError::NotConnected)?;
        let settings = self.settings();

        let pump = Arc::new(BytePump::new(settings.channel_capacity));
        let source = pump.start(transport, self.inner.raw_tap.clone())?;
        slot.decode_task = Some(tokio::spawn(run_decoder(
            Arc::downgrade(&self.inner),
            slot.generation,
            decode(source, settings.max_frame_len),
        )));
        slot.pump = Some(pump);

        self.set_state(ConnectionState::ConnectedReading);
        Ok(())
    }

    /// Open, start reading and ask the device for its settings. No-op when
    /// already connected.
    pub async fn connect(&self) -> Result<(), LinkError> {
        if self.state() == ConnectionState::ConnectedReading {
            return Ok(());
        }
        self.open().await?;
        let started = match self.start().await {
            Ok(()) => self.send_request(Op::ReadDevice, Payload::Empty).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            tlog!("[link] Connect failed: {}", e);
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop reading and close the device. Never fails; safe to call repeatedly.
    pub async fn close(&self) {
        let mut slot = self.inner.slot.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.teardown(&mut slot).await;
    }

    pub async fn disconnect(&self) {
        self.close().await
    }

    /// Close if connected, otherwise connect. Returns whether the link is now up.
    pub async fn toggle(&self) -> Result<bool, LinkError> {
        if self.is_connected() {
            self.close().await;
            Ok(false)
        } else {
            self.connect().await?;
            Ok(true)
        }
    }

    /// Close and drop the device handle so the next connect requests a new one.
    pub async fn forget(&self) {
        let mut slot = self.inner.slot.lock().await;
        if self.state() != ConnectionState::Disconnected {
            self.teardown(&mut slot).await;
        }
        if let Some(t) = slot.transport.take() {
            tlog!("[link] Forgot {}", t.describe());
        }
    }

    /// Stop the pump, then close the handle. Caller holds the slot lock.
    async fn teardown(&self, slot: &mut LinkSlot) {
        self.set_state(ConnectionState::Closing);

        if let Some(task) = slot.watch_task.take() {
            task.abort();
        }
        if let Some(pump) = slot.pump.take() {
            pump.stop().await;
        }
        if let Some(task) = slot.decode_task.take() {
            task.abort();
        }
        if let Some(transport) = slot.transport.as_ref() {
            if let Err(e) = transport.close().await {
                tlog!("[link] Ignoring close error on {}: {}", transport.describe(), e);
            }
        }

        self.inner.router.fail_pending();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Tear down after a transport, pump or decoder failure and report it once.
    async fn link_lost(&self, generation: u64, error: LinkError) {
        {
            let mut slot = self.inner.slot.lock().await;
            if slot.generation != generation || !self.state().is_connected() {
                return;
            }
            tlog!("[link] Connection lost: {}", error);
            self.teardown(&mut slot).await;
        }
        self.inner.failures.emit(&error);
    }

    /// Run `link_lost` on its own task so it can abort the task reporting it.
    fn report_link_lost(&self, generation: u64, error: LinkError) {
        let conn = self.clone();
        tokio::spawn(async move { conn.link_lost(generation, error).await });
    }

    // ========================================================================
    // Writing
    // ========================================================================

    async fn current_link(&self) -> Result<(Arc<dyn Transport>, u64), LinkError> {
        let slot = self.inner.slot.lock().await;
        if !self.state().is_connected() {
            return Err(LinkError::NotConnected);
        }
        let transport = slot.transport.clone().ok_or(LinkError::NotConnected)?;
        Ok((transport, slot.generation))
    }

    /// Write raw bytes. Concurrent writes never interleave.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let (transport, generation) = self.current_link().await?;

        let _guard = self.inner.write_lock.lock().await;
        match transport.write_chunk(bytes).await {
            Ok(()) => {
                tlog!(
                    "[link] TX {} bytes: {}",
                    bytes.len(),
                    hexdump(bytes, LOG_HEXDUMP_LEN)
                );
                Ok(())
            }
            Err(e) => {
                tlog!("[link] Write failed: {}", e);
                self.report_link_lost(generation, e.clone());
                Err(e)
            }
        }
    }

    /// Encode and write a message.
    pub async fn write(&self, message: &Message) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let bytes = encode(message)?;
        self.write_bytes(&bytes).await
    }

    /// Send a request without waiting for its response.
    pub async fn send_request(&self, op: Op, payload: Payload) -> Result<(), LinkError> {
        self.write(&Message::request(op, payload)).await
    }

    /// Send a request and wait for the response to the same op.
    ///
    /// Fails with `RequestInFlight` if another awaited request for `op` is pending
    /// and with `Disconnected` if the connection goes down first.
    pub async fn request(&self, op: Op, payload: Payload) -> Result<Message, LinkError> {
        if self.state() != ConnectionState::ConnectedReading {
            return Err(LinkError::NotConnected);
        }
        let pending = self.inner.router.register_pending(op)?;
        if let Err(e) = self.send_request(op, payload).await {
            self.inner.router.cancel_pending(op);
            return Err(e);
        }
        pending.wait().await
    }

    /// Read the device's settings tree.
    pub async fn read_device(&self) -> Result<Device, LinkError> {
        let reply = self.request(Op::ReadDevice, Payload::Empty).await?;
        reply
            .device()
            .cloned()
            .ok_or_else(|| LinkError::unrecognized("read.device response without a device"))
    }

    /// Write a settings tree and wait for the device's verdict.
    pub async fn write_device(&self, device: Device) -> Result<WriteResult, LinkError> {
        let reply = self
            .request(Op::WriteDevice, Payload::Device(device))
            .await?;
        reply
            .write_result()
            .cloned()
            .ok_or_else(|| LinkError::unrecognized("write.device response without a result"))
    }

    /// Send the settings model's pending edits as a write.device request.
    /// Returns `false` when the model has nothing to write.
    pub async fn commit(&self) -> Result<bool, LinkError> {
        let model = self
            .inner
            .router
            .model()
            .ok_or_else(|| LinkError::Config("no settings model installed".to_string()))?;
        match model.build_write_request() {
            Some(device) => {
                self.send_request(Op::WriteDevice, Payload::Device(device))
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Watch the transport's open flag and report the link lost when it drops.
fn spawn_status_watch(
    inner: Weak<Inner>,
    generation: u64,
    mut status: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // A dropped sender means the transport is gone as well
        let _ = status.wait_for(|open| !*open).await;
        if let Some(inner) = inner.upgrade() {
            Connection { inner }.report_link_lost(generation, LinkError::Disconnected);
        }
    })
}

/// Turn decoded values into messages and dispatch them in arrival order.
async fn run_decoder<S>(inner: Weak<Inner>, generation: u64, values: S)
where
    S: futures::Stream<Item = Result<ciborium::Value, LinkError>> + Send,
{
    tokio::pin!(values);

    while let Some(item) = values.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match item {
            Ok(value) => match to_message(value) {
                Ok(message) => inner.router.dispatch(message),
                Err(e) => tlog!("[link] Dropping message: {}", e),
            },
            Err(e) => {
                tlog!("[link] Decoder stopped: {}", e);
                Connection { inner }.report_link_lost(generation, e);
                return;
            }
        }
    }

    // Source closed: the device ended the stream or the pump was stopped
    if let Some(inner) = inner.upgrade() {
        Connection { inner }.report_link_lost(generation, LinkError::Disconnected);
    }
}
