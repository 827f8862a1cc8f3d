// tests/connection.rs
//
// End-to-end connection behaviour against in-memory transports.

use async_trait::async_trait;
use ciborium::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use devlink::io::serial::SerialConfig;
use devlink::io::transport::{
    LinkStatus, ReadOutcome, Transport, TransportConfig, TransportProvider,
};
use devlink::io::CborFramer;
use devlink::protocol::{encode, to_message, Group, Module};
use devlink::{
    Connection, ConnectionState, Device, DeviceFilter, LinkError, LinkSettings, Message, Op,
    Payload, Setting, SettingKind, SettingsModel, TransportKind, WriteResult,
};

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Fakes
// ============================================================================

/// Serial-like transport fed from a channel. Writes are recorded byte by byte with
/// a yield between bytes so unsynchronized writers would interleave.
struct FakeTransport {
    status: LinkStatus,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: Mutex<Vec<u8>>,
    opened_with: Mutex<Vec<TransportConfig>>,
    closes: AtomicUsize,
    /// Reads never complete, even after close
    stuck_reads: bool,
}

impl FakeTransport {
    fn new(stuck_reads: bool) -> (Arc<Self>, mpsc::UnboundedSender<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport {
            status: LinkStatus::new(),
            incoming: tokio::sync::Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            opened_with: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            stuck_reads,
        });
        (transport, tx)
    }

    fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// Decode every complete message written so far
    fn written_messages(&self) -> Vec<Message> {
        let mut framer = CborFramer::new();
        framer.feed(&self.written()).unwrap();
        std::iter::from_fn(|| framer.pop())
            .map(|v| to_message(v).unwrap())
            .collect()
    }

    fn unplug(&self) {
        self.status.set(false);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn describe(&self) -> String {
        "fake(/dev/ttyFAKE0)".to_string()
    }

    fn is_open(&self) -> bool {
        self.status.get()
    }

    fn status(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    async fn open(&self, config: &TransportConfig) -> Result<(), LinkError> {
        self.opened_with.lock().unwrap().push(config.clone());
        self.status.set(true);
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.status.set(false);
        Ok(())
    }

    async fn read_chunk(&self) -> Result<ReadOutcome, LinkError> {
        if self.stuck_reads {
            return std::future::pending().await;
        }
        let mut status = self.status.subscribe();
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            chunk = incoming.recv() => Ok(match chunk {
                Some(bytes) => ReadOutcome::Chunk(bytes),
                None => ReadOutcome::EndOfStream,
            }),
            _ = status.wait_for(|open| !*open) => Ok(ReadOutcome::EndOfStream),
        }
    }

    async fn write_chunk(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.status.get() {
            return Err(LinkError::WriteFailed("fake: not open".to_string()));
        }
        for b in bytes {
            self.written.lock().unwrap().push(*b);
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

struct FakeProvider {
    transport: Arc<FakeTransport>,
    requests: AtomicUsize,
}

#[async_trait]
impl TransportProvider for FakeProvider {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn request(&self, _filters: &[DeviceFilter]) -> Result<Arc<dyn Transport>, LinkError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.transport.clone())
    }
}

#[derive(Default)]
struct RecordingModel {
    snapshots: Mutex<Vec<Device>>,
    edits: Mutex<Option<Device>>,
}

impl SettingsModel for RecordingModel {
    fn on_device_snapshot(&self, device: Device) {
        self.snapshots.lock().unwrap().push(device);
    }

    fn build_write_request(&self) -> Option<Device> {
        self.edits.lock().unwrap().take()
    }
}

struct Harness {
    conn: Connection,
    transport: Arc<FakeTransport>,
    provider: Arc<FakeProvider>,
    device_tx: mpsc::UnboundedSender<Vec<u8>>,
    model: Arc<RecordingModel>,
    failures: Arc<Mutex<Vec<LinkError>>>,
}

fn harness(stuck_reads: bool) -> Harness {
    let (transport, device_tx) = FakeTransport::new(stuck_reads);
    let provider = Arc::new(FakeProvider {
        transport: transport.clone(),
        requests: AtomicUsize::new(0),
    });
    let conn = Connection::with_providers(
        LinkSettings::default(),
        vec![provider.clone() as Arc<dyn TransportProvider>],
    );

    let model = Arc::new(RecordingModel::default());
    conn.set_settings_model(Some(model.clone() as Arc<dyn SettingsModel>));

    let failures = Arc::new(Mutex::new(Vec::new()));
    let f = failures.clone();
    conn.on_failure(move |e| f.lock().unwrap().push(e.clone()));

    Harness {
        conn,
        transport,
        provider,
        device_tx,
        model,
        failures,
    }
}

fn sample_device() -> Device {
    let mut rate = Setting::new("uart.baud", "Baud", SettingKind::Options, 115200i64);
    rate.options = Some(vec![9600i64.into(), 115200i64.into()]);
    Device {
        device_info: None,
        modules: vec![Module {
            id: "io".to_string(),
            label: "IO".to_string(),
            groups: vec![Group {
                id: "uart".to_string(),
                label: "UART".to_string(),
                settings: vec![
                    rate,
                    Setting::new("uart.echo", "Echo", SettingKind::Bool, false),
                ],
            }],
        }],
    }
}

async fn wait_for_state(conn: &Connection, want: ConnectionState) {
    let mut rx = conn.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_connect_with_serial_defaults_and_split_response() {
    let h = harness(false);
    h.conn.connect().await.unwrap();
    assert_eq!(h.conn.state(), ConnectionState::ConnectedReading);

    let opened = h.transport.opened_with.lock().unwrap().clone();
    assert_eq!(opened, vec![TransportConfig::Serial(SerialConfig::default())]);
    if let TransportConfig::Serial(cfg) = &opened[0] {
        assert_eq!(cfg.baud_rate, 115200);
        assert_eq!(cfg.buffer_size, 255);
        assert_eq!(cfg.describe(), "115200 8N1");
    }

    // connect sends the initial read request
    assert_eq!(h.transport.written_messages(), vec![Message::read_device_request()]);

    let response = encode(&Message::read_device_response(sample_device())).unwrap();
    let (head, tail) = response.split_at(response.len() / 3);
    h.device_tx.send(head.to_vec()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.model.snapshots.lock().unwrap().is_empty());

    h.device_tx.send(tail.to_vec()).unwrap();
    wait_until(|| !h.model.snapshots.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let snapshots = h.model.snapshots.lock().unwrap().clone();
    assert_eq!(snapshots, vec![sample_device()]);
    assert!(h.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_is_noop_when_connected() {
    let h = harness(false);
    h.conn.connect().await.unwrap();
    h.conn.connect().await.unwrap();

    assert_eq!(h.provider.requests.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.written_messages().len(), 1);
}

#[tokio::test]
async fn test_concurrent_writes_do_not_interleave() {
    let h = harness(false);
    h.conn.open().await.unwrap();

    let mut first = sample_device();
    first.modules[0].id = "first".to_string();
    let second = sample_device();

    let first_request = Message::write_device_request(first.clone());
    let second_request = Message::write_device_request(second.clone());
    let (a, b) = tokio::join!(h.conn.write(&first_request), h.conn.write(&second_request));
    a.unwrap();
    b.unwrap();

    let mut framer = CborFramer::new();
    framer.feed(&h.transport.written()).unwrap();
    assert_eq!(framer.pending(), 0);

    let messages = h.transport.written_messages();
    assert_eq!(messages.len(), 2);
    assert!(messages.contains(&Message::write_device_request(first)));
    assert!(messages.contains(&Message::write_device_request(second)));
}

#[tokio::test]
async fn test_close_is_idempotent_and_retains_handle() {
    let h = harness(false);
    h.conn.connect().await.unwrap();

    h.conn.close().await;
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    h.conn.close().await;
    h.conn.disconnect().await;
    assert_eq!(h.transport.closes.load(Ordering::SeqCst), 1);
    assert!(h.failures.lock().unwrap().is_empty());

    assert_eq!(
        h.conn.write(&Message::read_device_request()).await,
        Err(LinkError::NotConnected)
    );

    // Reconnect reuses the retained handle
    h.conn.connect().await.unwrap();
    assert_eq!(h.provider.requests.load(Ordering::SeqCst), 1);

    // forget drops it
    h.conn.forget().await;
    h.conn.connect().await.unwrap();
    assert_eq!(h.provider.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_close_aborts_blocked_read() {
    let h = harness(true);
    h.conn.connect().await.unwrap();

    tokio::time::timeout(WAIT, h.conn.close())
        .await
        .expect("close hung on a blocked read");
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert_eq!(h.transport.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_toggle() {
    let h = harness(false);
    assert!(h.conn.toggle().await.unwrap());
    assert!(h.conn.is_connected());
    assert!(!h.conn.toggle().await.unwrap());
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_external_disconnect_reported_once() {
    let h = harness(false);
    h.conn.connect().await.unwrap();

    h.transport.unplug();
    wait_for_state(&h.conn, ConnectionState::Disconnected).await;
    wait_until(|| !h.failures.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*h.failures.lock().unwrap(), vec![LinkError::Disconnected]);
    assert_eq!(
        h.conn.write_bytes(&[0x01]).await,
        Err(LinkError::NotConnected)
    );
}

#[tokio::test]
async fn test_malformed_bytes_terminate_connection() {
    let h = harness(false);
    h.conn.connect().await.unwrap();

    h.device_tx.send(vec![0x1c]).unwrap();
    wait_for_state(&h.conn, ConnectionState::Disconnected).await;
    wait_until(|| !h.failures.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let failures = h.failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0], LinkError::DecodeError(_)));
    assert!(h.model.snapshots.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unrecognized_message_is_dropped() {
    let h = harness(false);
    h.conn.connect().await.unwrap();

    let mut junk = Vec::new();
    ciborium::ser::into_writer(
        &Value::Map(vec![(Value::Text("op".into()), Value::Text("reboot".into()))]),
        &mut junk,
    )
    .unwrap();
    h.device_tx.send(junk).unwrap();
    h.device_tx
        .send(encode(&Message::read_device_response(sample_device())).unwrap())
        .unwrap();

    wait_until(|| h.model.snapshots.lock().unwrap().len() == 1).await;
    assert_eq!(h.conn.state(), ConnectionState::ConnectedReading);
    assert!(h.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_raw_data_and_message_subscribers() {
    let h = harness(false);
    let raw = Arc::new(Mutex::new(Vec::new()));
    let r = raw.clone();
    let raw_id = h.conn.on_data(move |chunk| r.lock().unwrap().extend_from_slice(&chunk.bytes));

    let events = Arc::new(AtomicUsize::new(0));
    let e = events.clone();
    h.conn.subscribe(
        Some(devlink::Route::new(Op::WriteDevice, devlink::MessageType::Event)),
        move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        },
    );

    h.conn.connect().await.unwrap();
    let bytes = encode(&Message::event(Op::WriteDevice, Some(Value::Bool(true)))).unwrap();
    h.device_tx.send(bytes.clone()).unwrap();

    wait_until(|| events.load(Ordering::SeqCst) == 1).await;
    assert_eq!(*raw.lock().unwrap(), bytes);
    assert!(h.conn.off_data(raw_id));
}

#[tokio::test]
async fn test_awaited_requests() {
    let h = harness(false);
    h.conn.connect().await.unwrap();

    let conn = h.conn.clone();
    let write = tokio::spawn(async move { conn.write_device(sample_device()).await });

    wait_until(|| h.transport.written_messages().len() == 2).await;
    assert_eq!(
        h.conn
            .request(Op::WriteDevice, Payload::Device(sample_device()))
            .await
            .err(),
        Some(LinkError::RequestInFlight("write.device".to_string()))
    );

    h.device_tx
        .send(encode(&Message::write_device_response(WriteResult::failed("read-only"))).unwrap())
        .unwrap();
    let result = write.await.unwrap().unwrap();
    assert_eq!(result, WriteResult::failed("read-only"));
}

#[tokio::test]
async fn test_pending_request_fails_on_disconnect() {
    let h = harness(false);
    h.conn.connect().await.unwrap();

    let conn = h.conn.clone();
    let read = tokio::spawn(async move { conn.read_device().await });
    wait_until(|| h.transport.written_messages().len() == 2).await;

    h.conn.close().await;
    assert_eq!(read.await.unwrap().err(), Some(LinkError::Disconnected));
}

#[tokio::test]
async fn test_commit_sends_model_edits() {
    let h = harness(false);
    h.conn.connect().await.unwrap();

    assert!(!h.conn.commit().await.unwrap());

    let mut edited = sample_device();
    edited.modules[0].groups[0].settings[1].value = true.into();
    *h.model.edits.lock().unwrap() = Some(edited.clone());
    assert!(h.conn.commit().await.unwrap());

    let messages = h.transport.written_messages();
    assert_eq!(messages.last(), Some(&Message::write_device_request(edited)));
}
