// src/io/serial/transport.rs
//
// Serial port transport on top of the blocking serialport crate.
// Blocking calls run on tokio's blocking pool with a short port timeout,
// so an abandoned read returns within one poll interval.

use async_trait::async_trait;
use serde::Serialize;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::utils::{
    to_serialport_data_bits, to_serialport_flow_control, to_serialport_parity,
    to_serialport_stop_bits,
};
use crate::io::error::LinkError;
use crate::io::transport::{
    DeviceFilter, LinkStatus, ReadOutcome, Transport, TransportConfig, TransportKind,
    TransportProvider,
};

/// Port read timeout. Bounds how long a cancelled read keeps the port locked.
const READ_POLL: Duration = Duration::from_millis(20);

/// How often the port list is checked for an unplugged device
const PRESENCE_POLL: Duration = Duration::from_millis(500);

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

// ============================================================================
// Port Enumeration
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    fn matches(&self, filter: &DeviceFilter) -> bool {
        if let Some(ref path) = filter.path {
            if &self.port_name != path {
                return false;
            }
        }
        filter.matches_ids(self.vid, self.pid, self.serial_number.as_deref())
    }
}

/// List available serial ports
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, LinkError> {
    let ports = serialport::available_ports()
        .map_err(|e| LinkError::Unsupported(format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        // On macOS, filter out /dev/tty.* devices - only show /dev/cu.* (calling unit)
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => ("PCI".to_string(), None, None, None, None, None),
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

/// Pick the first port matching any filter. No filters means any port.
pub fn select_port(ports: &[SerialPortInfo], filters: &[DeviceFilter]) -> Option<SerialPortInfo> {
    ports
        .iter()
        .find(|p| filters.is_empty() || filters.iter().any(|f| p.matches(f)))
        .cloned()
}

// ============================================================================
// Provider
// ============================================================================

/// Hands out [`SerialTransport`]s for ports found on this host
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialProvider;

#[async_trait]
impl TransportProvider for SerialProvider {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn is_supported(&self) -> bool {
        serialport::available_ports().is_ok()
    }

    async fn request(&self, filters: &[DeviceFilter]) -> Result<Arc<dyn Transport>, LinkError> {
        let ports = tokio::task::spawn_blocking(list_serial_ports)
            .await
            .map_err(|e| LinkError::Unsupported(format!("port enumeration task failed: {}", e)))??;

        let Some(info) = select_port(&ports, filters) else {
            tlog!(
                "[serial] No port matched {} filter(s) among {} port(s)",
                filters.len(),
                ports.len()
            );
            return Err(LinkError::NoSelection);
        };

        tlog!("[serial] Selected {} ({})", info.port_name, info.port_type);
        Ok(Arc::new(SerialTransport::new(info)))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// What one blocking read produced
enum PortRead {
    Data(Vec<u8>),
    Idle,
    Closed,
    Eof,
    Failed(String),
}

/// A serial port. The read and write sides hold separate handles so writes do not
/// wait behind a pending read.
pub struct SerialTransport {
    info: SerialPortInfo,
    reader: SharedPort,
    writer: SharedPort,
    buffer_size: AtomicUsize,
    status: Arc<LinkStatus>,
    presence_task: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    pub fn new(info: SerialPortInfo) -> Self {
        SerialTransport {
            info,
            reader: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(None)),
            buffer_size: AtomicUsize::new(255),
            status: Arc::new(LinkStatus::new()),
            presence_task: Mutex::new(None),
        }
    }

    pub fn info(&self) -> &SerialPortInfo {
        &self.info
    }

    fn stop_presence_task(&self) {
        if let Ok(mut guard) = self.presence_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn describe(&self) -> String {
        format!("serial({})", self.info.port_name)
    }

    fn is_open(&self) -> bool {
        self.status.get()
    }

    fn status(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    async fn open(&self, config: &TransportConfig) -> Result<(), LinkError> {
        if self.is_open() {
            return Ok(());
        }
        let device = self.describe();
        let TransportConfig::Serial(cfg) = config else {
            return Err(LinkError::open_failed(&device, "expected a serial configuration"));
        };
        cfg.validate()?;

        let path = self.info.port_name.clone();
        let line = cfg.clone();
        let (reader, writer) = tokio::task::spawn_blocking(move || {
            let port = serialport::new(&path, line.baud_rate)
                .data_bits(to_serialport_data_bits(line.data_bits))
                .stop_bits(to_serialport_stop_bits(line.stop_bits))
                .parity(to_serialport_parity(line.parity))
                .flow_control(to_serialport_flow_control(line.flow_control))
                .timeout(READ_POLL)
                .open()
                .map_err(|e| e.to_string())?;
            let _ = port.clear(serialport::ClearBuffer::All);
            let writer = port.try_clone().map_err(|e| format!("clone handle: {}", e))?;
            Ok::<_, String>((port, writer))
        })
        .await
        .map_err(|e| LinkError::open_failed(&device, e))?
        .map_err(|e| LinkError::open_failed(&device, e))?;

        {
            let mut guard = self
                .reader
                .lock()
                .map_err(|e| LinkError::open_failed(&device, format!("mutex poisoned: {}", e)))?;
            *guard = Some(reader);
        }
        {
            let mut guard = self
                .writer
                .lock()
                .map_err(|e| LinkError::open_failed(&device, format!("mutex poisoned: {}", e)))?;
            *guard = Some(writer);
        }
        self.buffer_size.store(cfg.buffer_size, Ordering::Relaxed);
        self.status.set(true);

        let handle = spawn_presence_watch(self.info.port_name.clone(), self.status.clone());
        if let Ok(mut guard) = self.presence_task.lock() {
            if let Some(old) = guard.replace(handle) {
                old.abort();
            }
        }

        tlog!(
            "[serial:{}] Opened at {} (flow control: {:?})",
            self.info.port_name,
            cfg.describe(),
            cfg.flow_control
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        let was_open = self.status.get();
        self.status.set(false);
        self.stop_presence_task();

        let reader = self.reader.clone();
        let writer = self.writer.clone();
        // Taking the reader waits for an in-flight read to hit its timeout
        tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = writer.lock() {
                guard.take();
            }
            if let Ok(mut guard) = reader.lock() {
                guard.take();
            }
        })
        .await
        .map_err(|e| LinkError::read_failed(&self.describe(), format!("close task failed: {}", e)))?;

        if was_open {
            tlog!("[serial:{}] Closed", self.info.port_name);
        }
        Ok(())
    }

    async fn read_chunk(&self) -> Result<ReadOutcome, LinkError> {
        let size = self.buffer_size.load(Ordering::Relaxed).max(1);
        loop {
            if !self.status.get() {
                return Ok(ReadOutcome::EndOfStream);
            }

            let reader = self.reader.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = match reader.lock() {
                    Ok(g) => g,
                    Err(e) => return PortRead::Failed(format!("port mutex poisoned: {}", e)),
                };
                let Some(port) = guard.as_mut() else {
                    return PortRead::Closed;
                };
                let mut buf = vec![0u8; size];
                match port.read(&mut buf) {
                    Ok(0) => PortRead::Eof,
                    Ok(n) => {
                        buf.truncate(n);
                        PortRead::Data(buf)
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => PortRead::Idle,
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => PortRead::Idle,
                    Err(e) => PortRead::Failed(e.to_string()),
                }
            })
            .await
            .map_err(|e| LinkError::read_failed(&self.describe(), format!("read task failed: {}", e)))?;

            match result {
                PortRead::Data(bytes) => return Ok(ReadOutcome::Chunk(bytes)),
                PortRead::Idle => continue,
                PortRead::Closed => return Ok(ReadOutcome::EndOfStream),
                PortRead::Eof => {
                    tlog!("[serial:{}] End of stream", self.info.port_name);
                    self.status.set(false);
                    return Ok(ReadOutcome::EndOfStream);
                }
                PortRead::Failed(e) => {
                    self.status.set(false);
                    return Err(LinkError::read_failed(&self.describe(), e));
                }
            }
        }
    }

    async fn write_chunk(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let device = self.describe();
        if !self.status.get() {
            return Err(LinkError::write_failed(&device, "port is not open"));
        }

        let writer = self.writer.clone();
        let data = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().map_err(|e| format!("port mutex poisoned: {}", e))?;
            let port = guard.as_mut().ok_or_else(|| "port is not open".to_string())?;
            port.write_all(&data)
                .and_then(|_| port.flush())
                .map_err(|e| format!("Serial write error: {}", e))
        })
        .await
        .map_err(|e| LinkError::write_failed(&device, format!("write task failed: {}", e)))?
        .map_err(|e| LinkError::write_failed(&device, e))
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop_presence_task();
    }
}

/// Poll the port list and drop the open flag once the port disappears.
fn spawn_presence_watch(port_name: String, status: Arc<LinkStatus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(PRESENCE_POLL).await;
            if !status.get() {
                break;
            }
            let name = port_name.clone();
            let present = tokio::task::spawn_blocking(move || {
                // Enumeration failures are not treated as an unplug
                match serialport::available_ports() {
                    Ok(ports) => ports.iter().any(|p| p.port_name == name),
                    Err(_) => true,
                }
            })
            .await
            .unwrap_or(true);

            if !present {
                tlog!("[serial:{}] Port disappeared, marking closed", port_name);
                status.set(false);
                break;
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
