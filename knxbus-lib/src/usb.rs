//! KNX USB HID interface access.
//!
//! KNX USB interfaces expose a HID class interface with one interrupt IN
//! and one interrupt OUT endpoint moving fixed 64-byte reports. The
//! reports carry the KNX USB Transfer Protocol (see [`crate::usbtransfer`])
//! which in turn carries cEMI.

use std::time::Duration;

use bytes::Bytes;
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::Interrupt;
use nusb::Interface;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::bus::{BusEvent, EVENT_CHANNEL_CAPACITY};
use crate::cemi::{CemiFrame, MessageCode, PropertyFrame};
use crate::error::{KnxError, Result};
use crate::usbtransfer::{EmiId, ProtocolId, ReportAssembler, TransferFrame, REPORT_SIZE};

/// cEMI server interface object, hosting the communication-mode property.
const CEMI_SERVER_OBJECT: u16 = 0x0008;
/// PID_COMM_MODE on the cEMI server object.
const PID_COMM_MODE: u8 = 52;
const COMM_MODE_LINK_LAYER: u8 = 0x00;
const COMM_MODE_BUSMONITOR: u8 = 0x01;

/// Pause between init frames; common interfaces need the settling time.
const INIT_DELAY: Duration = Duration::from_millis(100);
/// How long to wait for the comm-mode write confirmation before giving up
/// on it. Not every interface confirms the write.
const COMM_MODE_CON_WINDOW: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Recognized KNX USB interface vendor/product ids. Devices not in the
/// table are still matched when their product string mentions KNX.
const KNOWN_DEVICES: &[(u16, u16)] = &[
    (0x0681, 0x0014), // Siemens
    (0x0e77, 0x0104), // Weinzierl KNX-USB
    (0x135e, 0x0026), // Insta
    (0x16d0, 0x0490), // MDT
];

type PropKey = (u16, u8, u8, u16);

/// USB interface parameters.
#[derive(Debug, Clone)]
pub struct UsbConfig {
    /// Open in busmonitor mode (receive-only).
    pub busmonitor: bool,
    /// Select a specific device: `bus:addr` or a product-string substring.
    /// `None` picks the first recognized KNX interface.
    pub device: Option<String>,
    pub interface: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    /// Timeout for property `.con` responses.
    pub response_timeout: Duration,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            busmonitor: false,
            device: None,
            interface: 0,
            endpoint_in: 0x81,
            endpoint_out: 0x01,
            response_timeout: Duration::from_secs(5),
        }
    }
}

enum Command {
    Send {
        cemi: Bytes,
        done: oneshot::Sender<Result<()>>,
    },
    Property {
        cemi: Bytes,
        expect: MessageCode,
        key: PropKey,
        done: oneshot::Sender<Result<Vec<u8>>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to an open KNX USB interface.
pub struct UsbInterface {
    cmd: mpsc::Sender<Command>,
    events: mpsc::Receiver<BusEvent>,
    busmonitor: bool,
    task: JoinHandle<()>,
    closed: bool,
}

impl UsbInterface {
    /// Find, open and initialize a KNX USB interface.
    pub async fn open(config: UsbConfig) -> Result<Self> {
        info!("searching for a KNX USB interface");
        let selector = config.device.as_deref().map(str::to_ascii_lowercase);
        let device_info = nusb::list_devices()
            .await?
            .find(|d| match &selector {
                Some(wanted) => {
                    format!("{}:{}", d.bus_id(), d.device_address()) == *wanted
                        || d.product_string()
                            .is_some_and(|s| s.to_ascii_lowercase().contains(wanted))
                }
                None => {
                    KNOWN_DEVICES.contains(&(d.vendor_id(), d.product_id()))
                        || d.product_string()
                            .is_some_and(|s| s.to_ascii_lowercase().contains("knx"))
                }
            })
            .ok_or(KnxError::DeviceNotFound)?;
        info!(
            "found {:04x}:{:04x} on bus {} addr {}",
            device_info.vendor_id(),
            device_info.product_id(),
            device_info.bus_id(),
            device_info.device_address()
        );

        let device = device_info.open().await?;
        // The HID class driver owns the interface on Linux until detached.
        if let Err(e) = device.detach_kernel_driver(config.interface) {
            trace!("could not detach kernel driver: {e}");
        }
        let interface = device.claim_interface(config.interface).await?;
        debug!(interface = config.interface, "interface claimed");

        let ep_in = interface.endpoint::<Interrupt, _>(config.endpoint_in)?;
        let ep_out = interface.endpoint::<Interrupt, _>(config.endpoint_out)?;
        let reader = ep_in.reader(REPORT_SIZE).with_num_transfers(4);
        let writer = ep_out.writer(REPORT_SIZE).with_num_transfers(4);

        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut actor = UsbActor {
            _interface: interface,
            reader,
            writer,
            assembler: ReportAssembler::new(),
            response_timeout: config.response_timeout,
            events: event_tx,
        };
        actor.initialize(config.busmonitor).await?;
        info!(busmonitor = config.busmonitor, "KNX USB interface ready");

        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let task = tokio::spawn(actor.run(cmd_rx));

        Ok(Self {
            cmd: cmd_tx,
            events,
            busmonitor: config.busmonitor,
            task,
            closed: false,
        })
    }

    /// Send a cEMI frame to the bus. Rejected in busmonitor mode.
    pub async fn send(&self, frame: &CemiFrame) -> Result<()> {
        if self.busmonitor {
            return Err(KnxError::InvalidMode("send is not available in busmonitor mode"));
        }
        let (done, written) = oneshot::channel();
        self.cmd
            .send(Command::Send {
                cemi: frame.to_bytes(),
                done,
            })
            .await
            .map_err(|_| KnxError::ConnectionLost)?;
        written.await.map_err(|_| KnxError::ConnectionLost)?
    }

    /// Read an interface-object property through the EMI tunnel.
    pub async fn read_property(
        &mut self,
        object_type: u16,
        object_instance: u8,
        property_id: u8,
        count: u8,
        start_index: u16,
    ) -> Result<Vec<u8>> {
        let prop = PropertyFrame::new(
            object_type,
            object_instance,
            property_id,
            count,
            start_index,
            Vec::new(),
        );
        let key = prop.key();
        self.property_transaction(
            CemiFrame::new_property(MessageCode::MPropReadReq, prop),
            MessageCode::MPropReadCon,
            key,
        )
        .await
    }

    /// Write an interface-object property through the EMI tunnel.
    pub async fn write_property(
        &mut self,
        object_type: u16,
        object_instance: u8,
        property_id: u8,
        count: u8,
        start_index: u16,
        data: Vec<u8>,
    ) -> Result<()> {
        let prop = PropertyFrame::new(
            object_type,
            object_instance,
            property_id,
            count,
            start_index,
            data,
        );
        let key = prop.key();
        self.property_transaction(
            CemiFrame::new_property(MessageCode::MPropWriteReq, prop),
            MessageCode::MPropWriteCon,
            key,
        )
        .await
        .map(|_| ())
    }

    async fn property_transaction(
        &mut self,
        frame: CemiFrame,
        expect: MessageCode,
        key: PropKey,
    ) -> Result<Vec<u8>> {
        let (done, resolved) = oneshot::channel();
        self.cmd
            .send(Command::Property {
                cemi: frame.to_bytes(),
                expect,
                key,
                done,
            })
            .await
            .map_err(|_| KnxError::ConnectionLost)?;
        resolved.await.map_err(|_| KnxError::ConnectionLost)?
    }

    /// Next bus event; `None` once the interface is closed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }

    /// Close the device. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let (done, finished) = oneshot::channel();
        if self.cmd.send(Command::Close { done }).await.is_ok() {
            let _ = finished.await;
        }
        Ok(())
    }
}

impl Drop for UsbInterface {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct UsbActor {
    _interface: Interface,
    reader: EndpointRead<Interrupt>,
    writer: EndpointWrite<Interrupt>,
    assembler: ReportAssembler,
    response_timeout: Duration,
    events: mpsc::Sender<BusEvent>,
}

impl UsbActor {
    /// Init batch: link-layer reset, select cEMI as active EMI, then set
    /// the communication mode property.
    async fn initialize(&mut self, busmonitor: bool) -> Result<()> {
        self.write_frame(&TransferFrame::cemi(&CemiFrame::reset_request().to_bytes()))
            .await?;
        sleep(INIT_DELAY).await;

        self.write_frame(&TransferFrame::feature_set(
            crate::usbtransfer::feature::ACTIVE_EMI,
            EmiId::Cemi.into(),
        ))
        .await?;
        sleep(INIT_DELAY).await;

        let mode = if busmonitor {
            COMM_MODE_BUSMONITOR
        } else {
            COMM_MODE_LINK_LAYER
        };
        let prop = PropertyFrame::new(CEMI_SERVER_OBJECT, 1, PID_COMM_MODE, 1, 1, vec![mode]);
        let frame = CemiFrame::new_property(MessageCode::MPropWriteReq, prop);
        self.write_frame(&TransferFrame::cemi(&frame.to_bytes())).await?;

        match timeout(COMM_MODE_CON_WINDOW, self.wait_comm_mode_con()).await {
            Ok(result) => result?,
            Err(_) => debug!("no M_PropWrite.con for comm mode, continuing without it"),
        }
        Ok(())
    }

    async fn wait_comm_mode_con(&mut self) -> Result<()> {
        loop {
            let frame = self.read_transfer_frame().await?;
            if frame.protocol != ProtocolId::KnxTunnel {
                continue;
            }
            let Ok(cemi) = CemiFrame::parse(&frame.body) else {
                continue;
            };
            if cemi.code != MessageCode::MPropWriteCon {
                // reset indications and feature chatter are expected here
                continue;
            }
            if let Some(prop) = cemi.property() {
                if prop.property_id == PID_COMM_MODE {
                    if let Some(code) = prop.return_code() {
                        return Err(KnxError::PropertyError(code));
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn read_transfer_frame(&mut self) -> Result<TransferFrame> {
        let mut buf = [0u8; REPORT_SIZE];
        loop {
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Err(KnxError::ConnectionLost);
            }
            trace!("report in: {:02x?}", &buf[..n]);
            if let Some(packet) = self.assembler.feed(&buf[..n]) {
                match TransferFrame::parse(&packet) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => debug!("dropping unparseable transfer frame: {e}"),
                }
            }
        }
    }

    async fn write_frame(&mut self, frame: &TransferFrame) -> Result<()> {
        for report in frame.to_reports() {
            let raw = report.to_bytes();
            timeout(WRITE_TIMEOUT, self.writer.write_all(&raw)).await??;
        }
        timeout(WRITE_TIMEOUT, self.writer.flush_end_async()).await??;
        Ok(())
    }

    async fn run(mut self, mut cmd: mpsc::Receiver<Command>) {
        let mut buf = [0u8; REPORT_SIZE];
        loop {
            tokio::select! {
                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => {
                        let _ = self.events.send(BusEvent::Disconnected).await;
                        break;
                    }
                    Ok(n) => {
                        let raw = buf[..n].to_vec();
                        self.handle_report(&raw, None).await;
                    }
                    Err(e) => {
                        let _ = self
                            .events
                            .send(BusEvent::Error(format!("USB read failed: {e}")))
                            .await;
                        break;
                    }
                },
                command = cmd.recv() => match command {
                    Some(Command::Send { cemi, done }) => {
                        let _ = done.send(self.write_frame(&TransferFrame::cemi(&cemi)).await);
                    }
                    Some(Command::Property { cemi, expect, key, done }) => {
                        let result = self.do_property(&cemi, expect, key).await;
                        let _ = done.send(result);
                    }
                    Some(Command::Close { done }) => {
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                },
            }
        }
        info!("KNX USB interface closed");
    }

    async fn do_property(
        &mut self,
        cemi: &[u8],
        expect: MessageCode,
        key: PropKey,
    ) -> Result<Vec<u8>> {
        self.write_frame(&TransferFrame::cemi(cemi)).await?;
        let deadline = Instant::now() + self.response_timeout;
        let mut buf = [0u8; REPORT_SIZE];
        loop {
            let n = match timeout_at(deadline, self.reader.read(&mut buf)).await {
                Err(_) => return Err(KnxError::ConnectionTimeout),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(n)) => n,
            };
            if n == 0 {
                return Err(KnxError::ConnectionLost);
            }
            let raw = buf[..n].to_vec();
            if let Some(matched) = self.handle_report(&raw, Some((expect, key))).await {
                return matched;
            }
        }
    }

    /// Dispatch one inbound report. When `pending` names an outstanding
    /// property transaction a matching `.con` resolves it instead of going
    /// to the event channel.
    async fn handle_report(
        &mut self,
        raw: &[u8],
        pending: Option<(MessageCode, PropKey)>,
    ) -> Option<Result<Vec<u8>>> {
        let packet = self.assembler.feed(raw)?;
        let frame = match TransferFrame::parse(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping unparseable transfer frame: {e}");
                return None;
            }
        };
        match frame.protocol {
            ProtocolId::KnxTunnel => {
                let cemi = match CemiFrame::parse(&frame.body) {
                    Ok(cemi) => cemi,
                    Err(e) => {
                        let _ = self
                            .events
                            .send(BusEvent::Error(format!("bad cEMI frame: {e}")))
                            .await;
                        return None;
                    }
                };
                match cemi.code {
                    MessageCode::LDataInd | MessageCode::LBusmonInd | MessageCode::LDataCon => {
                        if cemi.is_valid() {
                            let _ = self.events.send(BusEvent::Frame(cemi)).await;
                        } else {
                            let _ = self
                                .events
                                .send(BusEvent::Error("invalid cEMI frame dropped".into()))
                                .await;
                        }
                    }
                    MessageCode::MResetInd => {
                        let _ = self.events.send(BusEvent::Reset).await;
                    }
                    MessageCode::MPropReadCon | MessageCode::MPropWriteCon => {
                        if let (Some((expect, key)), Some(prop)) = (pending, cemi.property()) {
                            if cemi.code == expect && prop.key() == key {
                                return Some(match prop.return_code() {
                                    Some(code) => Err(KnxError::PropertyError(code)),
                                    None => Ok(prop.data.clone()),
                                });
                            }
                        }
                        debug!(code = ?cemi.code, "property confirmation without waiter");
                    }
                    other => debug!(?other, "unhandled EMI message code"),
                }
            }
            ProtocolId::BusAccessServer => {
                debug!(service = frame.emi_id, "feature frame: {:02x?}", &frame.body[..]);
            }
            ProtocolId::Unknown(id) => {
                warn!(protocol = id, "unknown transfer protocol id");
            }
        }
        None
    }
}
