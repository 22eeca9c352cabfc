//! btleplug-backed GATT transport.
//!
//! btleplug is async; the transport owns a private tokio runtime and blocks
//! on it so the session thread stays synchronous. Control point
//! notifications are forwarded by a background task into a channel that
//! `recv_notification` drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::traits::{Channel, DfuTransport, ReceivedPacket, TransportError};
use crate::peripheral::{DfuVariant, DiscoveredPeripherals, PeripheralRef};
use crate::protocol::{
    ATT_HEADER_SIZE, DEFAULT_MTU, DEFAULT_RESPONSE_TIMEOUT_MS, HEART_RATE_SERVICE_UUID,
    LEGACY_DFU_SERVICE_UUID, SECURE_DFU_SERVICE_UUID,
};

const SCAN_POLL: Duration = Duration::from_millis(250);

/// GATT transport for one peripheral.
pub struct BleTransport {
    runtime: Runtime,
    peripheral: Peripheral,
    target: PeripheralRef,
    control: Characteristic,
    packet: Characteristic,
    inbox: Mutex<Option<Receiver<Vec<u8>>>>,
    subscribed: AtomicBool,
    mtu: usize,
    write_timeout: Duration,
}

impl BleTransport {
    /// Find `target` and connect to it.
    ///
    /// btleplug does not report the negotiated MTU, so the caller supplies
    /// it; `None` falls back to the ATT minimum.
    pub fn open(
        target: &PeripheralRef,
        mtu: Option<usize>,
        scan_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let runtime = new_runtime()?;

        let (peripheral, control, packet) = runtime.block_on(async {
            let adapter = first_adapter().await?;
            adapter
                .start_scan(dfu_scan_filter())
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

            let peripheral = wait_for_peripheral(&adapter, &target.id, scan_timeout).await;
            let _ = adapter.stop_scan().await;
            let peripheral = peripheral?;

            info!(id = %target.id, "Connecting");
            if !peripheral.is_connected().await.unwrap_or(false) {
                peripheral
                    .connect()
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            }
            peripheral
                .discover_services()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

            let chars = peripheral.characteristics();
            let find = |uuid: uuid::Uuid| {
                chars
                    .iter()
                    .find(|c| c.uuid == uuid)
                    .cloned()
                    .ok_or_else(|| TransportError::CharacteristicNotFound(uuid.to_string()))
            };
            let control = find(target.variant.control_point_uuid())?;
            let packet = find(target.variant.packet_uuid())?;

            Ok::<_, TransportError>((peripheral, control, packet))
        })?;

        Ok(Self {
            runtime,
            peripheral,
            target: target.clone(),
            control,
            packet,
            inbox: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            mtu: mtu.unwrap_or(DEFAULT_MTU),
            write_timeout: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
        })
    }

    /// Bound every GATT write. A write that is not acknowledged in time
    /// fails with `TransportError::Timeout`.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn target(&self) -> &PeripheralRef {
        &self.target
    }

    fn write(&self, channel: Channel, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let max = self.mtu.saturating_sub(ATT_HEADER_SIZE);
        if data.len() > max {
            return Err(TransportError::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }

        let (characteristic, write_type) = match channel {
            Channel::Control => (&self.control, WriteType::WithResponse),
            Channel::Data => (&self.packet, WriteType::WithoutResponse),
        };
        self.runtime.block_on(bounded(
            self.write_timeout,
            self.peripheral.write(characteristic, data, write_type),
        ))
    }
}

impl DfuTransport for BleTransport {
    fn connect(&self) -> Result<usize, TransportError> {
        if self.subscribed.load(Ordering::Acquire) {
            return Ok(self.mtu);
        }

        let (tx, rx) = mpsc::channel();
        let control_uuid = self.control.uuid;
        let peripheral = self.peripheral.clone();
        let control = self.control.clone();

        self.runtime.block_on(async {
            if !peripheral.is_connected().await.unwrap_or(false) {
                peripheral
                    .connect()
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            }
            peripheral
                .subscribe(&control)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
        })?;

        let stream_source = self.peripheral.clone();
        self.runtime.spawn(async move {
            let mut stream = match stream_source.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Notification stream unavailable");
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                if notification.uuid == control_uuid && tx.send(notification.value).is_err() {
                    break;
                }
            }
            debug!("Notification stream closed");
        });

        *self.inbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
        self.subscribed.store(true, Ordering::Release);
        debug!(mtu = self.mtu, "Control point subscribed");
        Ok(self.mtu)
    }

    fn is_connected(&self) -> bool {
        self.runtime
            .block_on(self.peripheral.is_connected())
            .unwrap_or(false)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn write_control(&self, data: &[u8]) -> Result<(), TransportError> {
        self.write(Channel::Control, data)
    }

    fn write_data(&self, data: &[u8]) -> Result<(), TransportError> {
        self.write(Channel::Data, data)
    }

    fn recv_notification(&self, timeout: Duration) -> Result<ReceivedPacket, TransportError> {
        let inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        let rx = inbox.as_ref().ok_or(TransportError::NotConnected)?;

        match rx.recv_timeout(timeout) {
            Ok(data) => Ok(ReceivedPacket {
                channel: Channel::Control,
                data,
            }),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::NotConnected),
        }
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.subscribed.store(false, Ordering::Release);
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.runtime
            .block_on(self.peripheral.disconnect())
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    fn variant(&self) -> DfuVariant {
        self.target.variant
    }
}

/// Scan for DFU-capable peripherals for `duration`.
pub fn scan(duration: Duration) -> Result<DiscoveredPeripherals, TransportError> {
    let runtime = new_runtime()?;

    runtime.block_on(async {
        let adapter = first_adapter().await?;
        adapter
            .start_scan(dfu_scan_filter())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        info!(seconds = duration.as_secs_f32(), "Scanning");

        let mut found = DiscoveredPeripherals::new();
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            tokio::time::sleep(SCAN_POLL).await;

            let peripherals = adapter
                .peripherals()
                .await
                .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
            for peripheral in peripherals {
                let Some(props) = peripheral.properties().await.ok().flatten() else {
                    continue;
                };
                let Some(variant) = DfuVariant::from_services(&props.services) else {
                    continue;
                };

                let mut entry = PeripheralRef::new(peripheral.id().to_string(), variant);
                entry.name = props.local_name;
                entry.rssi = props.rssi;
                if found.insert(entry.clone()) {
                    debug!(peripheral = %entry, "Discovered");
                }
            }
        }

        let _ = adapter.stop_scan().await;
        Ok(found)
    })
}

/// Run a GATT write, giving up after `window`.
async fn bounded<F>(window: Duration, write: F) -> Result<(), TransportError>
where
    F: std::future::Future<Output = btleplug::Result<()>>,
{
    match tokio::time::timeout(window, write).await {
        Ok(result) => result.map_err(|e| TransportError::WriteFailed(e.to_string())),
        Err(_) => Err(TransportError::Timeout {
            timeout_ms: window.as_millis() as u64,
        }),
    }
}

fn new_runtime() -> Result<Runtime, TransportError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .map_err(|e| TransportError::ConnectionFailed(format!("tokio runtime: {e}")))
}

fn dfu_scan_filter() -> ScanFilter {
    ScanFilter {
        services: vec![
            SECURE_DFU_SERVICE_UUID,
            LEGACY_DFU_SERVICE_UUID,
            HEART_RATE_SERVICE_UUID,
        ],
    }
}

async fn first_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new()
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("Bluetooth unavailable: {e}")))?;
    manager
        .adapters()
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::ConnectionFailed("no Bluetooth adapter".into()))
}

async fn wait_for_peripheral(
    adapter: &Adapter,
    id: &str,
    timeout: Duration,
) -> Result<Peripheral, TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        if let Some(p) = peripherals.into_iter().find(|p| p.id().to_string() == id) {
            return Ok(p);
        }
        if Instant::now() >= deadline {
            return Err(TransportError::ConnectionFailed(format!(
                "peripheral {id} not found"
            )));
        }
        tokio::time::sleep(SCAN_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stalled_write_times_out() {
        let runtime = new_runtime().unwrap();
        let result = runtime.block_on(bounded(
            Duration::from_millis(20),
            std::future::pending::<btleplug::Result<()>>(),
        ));

        assert!(matches!(
            result,
            Err(TransportError::Timeout { timeout_ms: 20 })
        ));
    }

    #[test]
    fn test_write_error_is_reported() {
        let runtime = new_runtime().unwrap();
        let result = runtime.block_on(bounded(Duration::from_secs(1), async {
            Err(btleplug::Error::NotConnected)
        }));

        assert!(matches!(result, Err(TransportError::WriteFailed(_))));
    }
}
