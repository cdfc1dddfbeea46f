//! KNXnet/IP device management: the tunnelling lifecycle with
//! DEVICE_CONFIGURATION frames carrying cEMI property services.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::ControlFlow;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::bus::{BusEvent, EVENT_CHANNEL_CAPACITY};
use crate::cemi::{CemiFrame, MessageCode, PropertyFrame};
use crate::error::{KnxError, Result};
use crate::knxnet::{self, status, ConnectResponse, ConnectionHeader, Cri, Hpai, ServiceType};

const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Correlation key of a property transaction:
/// `{object type, instance, property id, start index}`.
type PropKey = (u16, u8, u8, u16);

/// Management connection parameters.
#[derive(Debug, Clone)]
pub struct MgmtConfig {
    pub server: SocketAddrV4,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Timeout for the correlating `.con` after the ACK arrived.
    pub response_timeout: Duration,
}

impl MgmtConfig {
    pub fn new(server: SocketAddrV4) -> Self {
        Self {
            server,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
            response_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

enum Command {
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

/// Handle to an open device-management connection.
pub struct MgmtConnection {
    cmd: mpsc::Sender<Command>,
    events: mpsc::Receiver<BusEvent>,
    channel: u8,
    task: JoinHandle<()>,
    closed: bool,
}

impl MgmtConnection {
    pub async fn open(config: MgmtConfig) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let local_port = socket.local_addr()?.port();
        let local = Hpai::new(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port));
        let request = knxnet::connect_request(local, local, Cri::DeviceManagement);
        socket
            .send_to(&request, SocketAddr::V4(config.server))
            .await?;

        let deadline = Instant::now() + config.connect_timeout;
        let mut buf = [0u8; 512];
        let (response, from) = loop {
            let (len, from) = timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| KnxError::ConnectionTimeout)??;
            match knxnet::parse_frame(&buf[..len]) {
                Ok((ServiceType::ConnectResponse, body)) => {
                    break (ConnectResponse::parse(body)?, from)
                }
                Ok((service, _)) => debug!(?service, "ignoring while connecting"),
                Err(e) => debug!("dropping invalid datagram: {e}"),
            }
        };
        if response.status != status::NO_ERROR {
            return Err(KnxError::ConnectionRefused(response.status));
        }
        let data_endpoint = response.data_endpoint.or_observed(from);
        info!(channel = response.channel, %data_endpoint, "management connection established");

        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let actor = MgmtActor {
            socket,
            server: config.server,
            data_endpoint,
            control: local,
            channel: response.channel,
            tx_seq: 0,
            rx_seq: None,
            ack_timeout: config.connect_timeout,
            response_timeout: config.response_timeout,
            expected: None,
            matched: None,
            events: event_tx,
        };
        let task = tokio::spawn(actor.run(cmd_rx, config.heartbeat_interval));

        Ok(Self {
            cmd: cmd_tx,
            events,
            channel: response.channel,
            task,
            closed: false,
        })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Read interface-object property data. Resolves with the payload of
    /// the correlating `M_PropRead.con`.
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

    /// Write interface-object property data; resolves once a matching
    /// non-error `M_PropWrite.con` arrives.
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

    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }

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

impl Drop for MgmtConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct MgmtActor {
    socket: UdpSocket,
    server: SocketAddrV4,
    data_endpoint: SocketAddrV4,
    control: Hpai,
    channel: u8,
    tx_seq: u8,
    rx_seq: Option<u8>,
    ack_timeout: Duration,
    response_timeout: Duration,
    expected: Option<(MessageCode, PropKey)>,
    matched: Option<Result<Vec<u8>>>,
    events: mpsc::Sender<BusEvent>,
}

impl MgmtActor {
    async fn run(mut self, mut cmd: mpsc::Receiver<Command>, heartbeat_interval: Duration) {
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; 512];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if self.handle_datagram(&buf[..len], from).await.is_break() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = self
                            .events
                            .send(BusEvent::Error(format!("socket receive failed: {e}")))
                            .await;
                        break;
                    }
                },
                command = cmd.recv() => match command {
                    Some(Command::Property { cemi, expect, key, done }) => {
                        let result = self.do_property(&cemi, expect, key).await;
                        let fatal = matches!(result, Err(KnxError::ConnectionLost));
                        let _ = done.send(result);
                        if fatal {
                            break;
                        }
                    }
                    Some(Command::Close { done }) => {
                        self.do_close().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.do_close().await;
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.do_heartbeat().await {
                        warn!(channel = self.channel, "heartbeat failed: {e}");
                        let _ = self.events.send(BusEvent::Disconnected).await;
                        break;
                    }
                }
            }
        }
    }

    /// Send one DEVICE_CONFIGURATION_REQUEST, wait for its ACK, then for
    /// the correlating `.con` property frame.
    async fn do_property(
        &mut self,
        cemi: &[u8],
        expect: MessageCode,
        key: PropKey,
    ) -> Result<Vec<u8>> {
        // Register the correlation before sending; some servers emit the
        // .con before the ACK.
        self.expected = Some((expect, key));
        self.matched = None;
        let result = self.property_exchange(cemi).await;
        self.expected = None;
        result
    }

    async fn property_exchange(&mut self, cemi: &[u8]) -> Result<Vec<u8>> {
        let seq = self.tx_seq;
        let request = knxnet::device_configuration_request(self.channel, seq, cemi);
        self.socket
            .send_to(&request, SocketAddr::V4(self.data_endpoint))
            .await?;
        trace!(seq, "configuration request sent");

        // Phase 1: the ACK for our sequence number.
        let deadline = Instant::now() + self.ack_timeout;
        let mut buf = [0u8; 512];
        loop {
            let (len, from) = match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Err(KnxError::ConnectionTimeout),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(received)) => received,
            };
            if let Ok((ServiceType::DeviceConfigurationAck, body)) =
                knxnet::parse_frame(&buf[..len])
            {
                if let Ok((header, _)) = ConnectionHeader::parse(body) {
                    if header.channel == self.channel && header.seq == seq {
                        if header.status != status::NO_ERROR {
                            return Err(KnxError::AckStatus(header.status));
                        }
                        self.tx_seq = self.tx_seq.wrapping_add(1);
                        break;
                    }
                }
                continue;
            }
            if self.handle_datagram(&buf[..len], from).await.is_break() {
                return Err(KnxError::ConnectionLost);
            }
        }

        // Phase 2: the .con carried in a server-side configuration request.
        let deadline = Instant::now() + self.response_timeout;
        loop {
            if let Some(matched) = self.matched.take() {
                return matched;
            }
            let (len, from) = match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Err(KnxError::ConnectionTimeout),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(received)) => received,
            };
            if self.handle_datagram(&buf[..len], from).await.is_break() {
                return Err(KnxError::ConnectionLost);
            }
        }
    }

    async fn handle_datagram(&mut self, raw: &[u8], from: SocketAddr) -> ControlFlow<()> {
        let (service, body) = match knxnet::parse_frame(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = self
                    .events
                    .send(BusEvent::Error(format!("dropped datagram from {from}: {e}")))
                    .await;
                return ControlFlow::Continue(());
            }
        };
        match service {
            ServiceType::DeviceConfigurationRequest => {
                let Ok((header, cemi)) = ConnectionHeader::parse(body) else {
                    let _ = self
                        .events
                        .send(BusEvent::Error("malformed configuration request".into()))
                        .await;
                    return ControlFlow::Continue(());
                };
                if header.channel != self.channel {
                    return ControlFlow::Continue(());
                }
                let ack = knxnet::device_configuration_ack(
                    self.channel,
                    header.seq,
                    status::NO_ERROR,
                );
                let _ = self
                    .socket
                    .send_to(&ack, SocketAddr::V4(self.data_endpoint))
                    .await;
                if self.rx_seq == Some(header.seq) {
                    trace!(seq = header.seq, "duplicate sequence, not re-delivered");
                    return ControlFlow::Continue(());
                }
                self.rx_seq = Some(header.seq);
                self.dispatch_cemi(cemi).await;
                ControlFlow::Continue(())
            }
            ServiceType::ConnectionstateRequest => {
                if let Ok(channel) = knxnet::parse_channel_request(body) {
                    if channel == self.channel {
                        let response =
                            knxnet::connectionstate_response(self.channel, status::NO_ERROR);
                        let _ = self.socket.send_to(&response, from).await;
                    }
                }
                ControlFlow::Continue(())
            }
            ServiceType::DisconnectRequest => {
                if let Ok(channel) = knxnet::parse_channel_request(body) {
                    if channel == self.channel {
                        let response = knxnet::disconnect_response(self.channel, status::NO_ERROR);
                        let _ = self.socket.send_to(&response, from).await;
                        info!(channel = self.channel, "server closed the connection");
                        let _ = self.events.send(BusEvent::Disconnected).await;
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            }
            other => {
                debug!(?other, "unhandled service type");
                ControlFlow::Continue(())
            }
        }
    }

    /// Route a property `.con` to the outstanding transaction when its
    /// identifiers match; everything else goes to the event channel.
    async fn dispatch_cemi(&mut self, cemi: &[u8]) {
        let frame = match CemiFrame::parse(cemi) {
            Ok(frame) if frame.is_valid() => frame,
            Ok(_) => {
                let _ = self
                    .events
                    .send(BusEvent::Error("invalid cEMI frame dropped".into()))
                    .await;
                return;
            }
            Err(e) => {
                let _ = self
                    .events
                    .send(BusEvent::Error(format!("bad cEMI frame: {e}")))
                    .await;
                return;
            }
        };
        if let (Some((expect, key)), Some(prop)) = (self.expected, frame.property()) {
            if frame.code == expect && prop.key() == key {
                self.matched = Some(match prop.return_code() {
                    Some(code) => Err(KnxError::PropertyError(code)),
                    None => Ok(prop.data.clone()),
                });
                return;
            }
        }
        let _ = self.events.send(BusEvent::Frame(frame)).await;
    }

    async fn do_heartbeat(&mut self) -> Result<()> {
        let request = knxnet::connectionstate_request(self.channel, self.control);
        self.socket
            .send_to(&request, SocketAddr::V4(self.server))
            .await?;
        let deadline = Instant::now() + self.ack_timeout;
        let mut buf = [0u8; 512];
        loop {
            let (len, from) = match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Err(KnxError::ConnectionTimeout),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(received)) => received,
            };
            if let Ok((ServiceType::ConnectionstateResponse, body)) =
                knxnet::parse_frame(&buf[..len])
            {
                let (channel, state) = knxnet::parse_channel_status(body)?;
                if channel != self.channel {
                    continue;
                }
                if state != status::NO_ERROR {
                    return Err(KnxError::ConnectionLost);
                }
                return Ok(());
            }
            if self.handle_datagram(&buf[..len], from).await.is_break() {
                return Err(KnxError::ConnectionLost);
            }
        }
    }

    async fn do_close(&mut self) {
        let request = knxnet::disconnect_request(self.channel, self.control);
        let _ = self
            .socket
            .send_to(&request, SocketAddr::V4(self.server))
            .await;
        let deadline = Instant::now() + DISCONNECT_GRACE;
        let mut buf = [0u8; 512];
        while let Ok(Ok((len, _))) = timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
            if let Ok((ServiceType::DisconnectResponse, _)) = knxnet::parse_frame(&buf[..len]) {
                break;
            }
        }
        info!(channel = self.channel, "management connection closed");
    }
}
