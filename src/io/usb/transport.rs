// src/io/usb/transport.rs
//
// nusb-backed bulk transport. Reads keep one IN transfer queued; writes submit one
// OUT transfer per chunk and wait for its completion.

use async_trait::async_trait;
use futures::StreamExt;
use nusb::transfer::{Bulk, In, Out, TransferError};
use nusb::{Endpoint, Interface, MaybeFuture};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{select_device, UsbConfig, UsbDeviceInfo};
use crate::io::error::LinkError;
use crate::io::transport::{
    DeviceFilter, LinkStatus, ReadOutcome, Transport, TransportConfig, TransportKind,
    TransportProvider,
};

// ============================================================================
// Device Enumeration
// ============================================================================

fn describe_device(dev: &nusb::DeviceInfo) -> UsbDeviceInfo {
    UsbDeviceInfo {
        bus_id: dev.bus_id().to_string(),
        address: dev.device_address(),
        vendor_id: dev.vendor_id(),
        product_id: dev.product_id(),
        manufacturer: dev.manufacturer_string().map(|s| s.to_string()),
        product: dev.product_string().map(|s| s.to_string()),
        serial_number: dev.serial_number().map(|s| s.to_string()),
        interface_classes: dev.interfaces().map(|i| i.class()).collect(),
    }
}

/// List all USB devices on the system
pub fn list_usb_devices() -> Result<Vec<UsbDeviceInfo>, LinkError> {
    // nusb 0.2 list_devices() returns MaybeFuture - use .wait() for sync blocking
    let devices = nusb::list_devices()
        .wait()
        .map_err(|e| LinkError::Unsupported(format!("Failed to list USB devices: {}", e)))?;
    Ok(devices.map(|d| describe_device(&d)).collect())
}

// ============================================================================
// Provider
// ============================================================================

/// Hands out [`UsbTransport`]s for devices found on this host
#[derive(Debug, Default, Clone, Copy)]
pub struct UsbProvider;

#[async_trait]
impl TransportProvider for UsbProvider {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn is_supported(&self) -> bool {
        nusb::list_devices().wait().is_ok()
    }

    async fn request(&self, filters: &[DeviceFilter]) -> Result<Arc<dyn Transport>, LinkError> {
        let devices: Vec<nusb::DeviceInfo> = nusb::list_devices()
            .await
            .map_err(|e| LinkError::Unsupported(format!("Failed to list USB devices: {}", e)))?
            .collect();
        let described: Vec<UsbDeviceInfo> = devices.iter().map(describe_device).collect();

        let Some(idx) = select_device(&described, filters) else {
            tlog!(
                "[usb] No device matched {} filter(s) among {} device(s)",
                filters.len(),
                devices.len()
            );
            return Err(LinkError::NoSelection);
        };

        let chosen = devices.into_iter().nth(idx).ok_or(LinkError::NoSelection)?;
        let summary = described[idx].clone();
        tlog!(
            "[usb] Selected {} ({})",
            summary.describe(),
            summary.product.as_deref().unwrap_or("unknown product")
        );
        Ok(Arc::new(UsbTransport::new(chosen, summary)))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// A claimed USB interface with its bulk endpoint pair
pub struct UsbTransport {
    device_info: nusb::DeviceInfo,
    summary: UsbDeviceInfo,
    interface: Mutex<Option<Interface>>,
    bulk_in: tokio::sync::Mutex<Option<Endpoint<Bulk, In>>>,
    bulk_out: tokio::sync::Mutex<Option<Endpoint<Bulk, Out>>>,
    transfer_size: AtomicUsize,
    status: Arc<LinkStatus>,
    hotplug_task: Mutex<Option<JoinHandle<()>>>,
}

impl UsbTransport {
    pub fn new(device_info: nusb::DeviceInfo, summary: UsbDeviceInfo) -> Self {
        UsbTransport {
            device_info,
            summary,
            interface: Mutex::new(None),
            bulk_in: tokio::sync::Mutex::new(None),
            bulk_out: tokio::sync::Mutex::new(None),
            transfer_size: AtomicUsize::new(64),
            status: Arc::new(LinkStatus::new()),
            hotplug_task: Mutex::new(None),
        }
    }

    pub fn info(&self) -> &UsbDeviceInfo {
        &self.summary
    }

    fn stop_hotplug_task(&self) {
        if let Ok(mut guard) = self.hotplug_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    async fn claim(&self, cfg: &UsbConfig) -> Result<(), LinkError> {
        let device_name = self.describe();

        let device = self
            .device_info
            .open()
            .await
            .map_err(|e| LinkError::open_failed(&device_name, format!("Failed to open device: {}", e)))?;

        let active = device
            .active_configuration()
            .ok()
            .map(|c| c.configuration_value());
        if active != Some(cfg.configuration) {
            device.set_configuration(cfg.configuration).await.map_err(|e| {
                LinkError::open_failed(
                    &device_name,
                    format!("Failed to select configuration {}: {}", cfg.configuration, e),
                )
            })?;
        }

        let interface = device.claim_interface(cfg.interface).await.map_err(|e| {
            LinkError::open_failed(
                &device_name,
                format!("Failed to claim interface {}: {}", cfg.interface, e),
            )
        })?;

        let bulk_in = interface
            .endpoint::<Bulk, In>(cfg.in_address())
            .map_err(|e| {
                LinkError::open_failed(
                    &device_name,
                    format!("Failed to open bulk IN endpoint 0x{:02x}: {}", cfg.in_address(), e),
                )
            })?;
        let bulk_out = interface
            .endpoint::<Bulk, Out>(cfg.out_address())
            .map_err(|e| {
                LinkError::open_failed(
                    &device_name,
                    format!("Failed to open bulk OUT endpoint 0x{:02x}: {}", cfg.out_address(), e),
                )
            })?;

        // IN transfers must be a whole number of packets
        let packet = bulk_in.max_packet_size().max(1);
        let size = cfg.transfer_size.max(1).div_ceil(packet) * packet;
        self.transfer_size.store(size, Ordering::Relaxed);

        *self.bulk_in.lock().await = Some(bulk_in);
        *self.bulk_out.lock().await = Some(bulk_out);
        if let Ok(mut guard) = self.interface.lock() {
            *guard = Some(interface);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn describe(&self) -> String {
        self.summary.describe()
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
        let TransportConfig::Usb(cfg) = config else {
            return Err(LinkError::open_failed(&self.describe(), "expected a USB configuration"));
        };

        self.claim(cfg).await?;
        self.status.set(true);

        let handle = spawn_hotplug_watch(self.device_info.id(), self.status.clone(), self.describe());
        if let Ok(mut guard) = self.hotplug_task.lock() {
            if let Some(old) = std::mem::replace(&mut *guard, handle) {
                old.abort();
            }
        }

        tlog!(
            "[usb:{}] Opened (configuration {}, interface {}, IN 0x{:02x}, OUT 0x{:02x}, transfer {} bytes)",
            self.describe(),
            cfg.configuration,
            cfg.interface,
            cfg.in_address(),
            cfg.out_address(),
            self.transfer_size.load(Ordering::Relaxed)
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        let was_open = self.status.get();
        // Wakes a pending read so it releases the IN endpoint
        self.status.set(false);
        self.stop_hotplug_task();

        if let Some(mut ep) = self.bulk_in.lock().await.take() {
            ep.cancel_all();
        }
        if let Some(mut ep) = self.bulk_out.lock().await.take() {
            ep.cancel_all();
        }
        if let Ok(mut guard) = self.interface.lock() {
            guard.take();
        }

        if was_open {
            tlog!("[usb:{}] Closed", self.describe());
        }
        Ok(())
    }

    async fn read_chunk(&self) -> Result<ReadOutcome, LinkError> {
        let mut guard = self.bulk_in.lock().await;
        let Some(ep) = guard.as_mut() else {
            return Ok(ReadOutcome::EndOfStream);
        };
        if !self.status.get() {
            return Ok(ReadOutcome::EndOfStream);
        }

        // A read abandoned mid-flight leaves its transfer queued; reuse it
        if ep.pending() == 0 {
            let buffer = ep.allocate(self.transfer_size.load(Ordering::Relaxed));
            ep.submit(buffer);
        }

        let mut status = self.status.subscribe();
        let completion = tokio::select! {
            completion = ep.next_complete() => completion,
            _ = status.wait_for(|open| !*open) => return Ok(ReadOutcome::EndOfStream),
        };

        match completion.status {
            Ok(()) => Ok(ReadOutcome::Chunk(
                completion.buffer[..completion.actual_len].to_vec(),
            )),
            Err(TransferError::Cancelled) => Ok(ReadOutcome::EndOfStream),
            Err(TransferError::Disconnected) => {
                tlog!("[usb:{}] Device disconnected during read", self.describe());
                self.status.set(false);
                Ok(ReadOutcome::EndOfStream)
            }
            Err(e) => {
                self.status.set(false);
                Err(LinkError::read_failed(
                    &self.describe(),
                    format!("Bulk transfer error: {:?}", e),
                ))
            }
        }
    }

    async fn write_chunk(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let device = self.describe();
        if !self.status.get() {
            return Err(LinkError::write_failed(&device, "device is not open"));
        }
        let mut guard = self.bulk_out.lock().await;
        let ep = guard
            .as_mut()
            .ok_or_else(|| LinkError::write_failed(&device, "device is not open"))?;

        ep.submit(bytes.to_vec().into());
        let completion = ep.next_complete().await;
        completion
            .status
            .map_err(|e| LinkError::write_failed(&device, format!("Bulk transfer error: {:?}", e)))
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.stop_hotplug_task();
    }
}

/// Follow hotplug events and drop the open flag when this device goes away.
fn spawn_hotplug_watch(
    id: nusb::DeviceId,
    status: Arc<LinkStatus>,
    device_name: String,
) -> Option<JoinHandle<()>> {
    let mut events = match nusb::watch_devices() {
        Ok(w) => w,
        Err(e) => {
            tlog!(
                "[usb:{}] Hotplug events unavailable, unplug detection limited to transfer errors: {}",
                device_name,
                e
            );
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let nusb::hotplug::HotplugEvent::Disconnected(gone) = event {
                if gone == id {
                    tlog!("[usb:{}] Device unplugged", device_name);
                    status.set(false);
                    break;
                }
            }
        }
    }))
}
