//! Connection-oriented KNXnet/IP tunnelling (link layer or busmonitor).
//!
//! One instance owns one UDP socket and one server connection. All socket
//! traffic, timers and user commands run on a single spawned task, so the
//! state machine needs no locking:
//!
//! ```text
//! Idle --open--> Connecting --CONNECT_RESPONSE(ok)--> Open
//! Open --send--> AwaitAck(seq) --TUNNELLING_ACK(ok, seq)--> Open
//! Open --heartbeat failure--> Lost
//! Open --close--> Closing --> Idle
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::ControlFlow;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::bus::{BusEvent, Layer, EVENT_CHANNEL_CAPACITY};
use crate::cemi::CemiFrame;
use crate::error::{KnxError, Result};
use crate::knxnet::{self, status, ConnectResponse, ConnectionHeader, Cri, Hpai, ServiceType};

/// Grace window for the DISCONNECT_RESPONSE before the socket closes
/// regardless.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Tunnelling connection parameters.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub server: SocketAddrV4,
    pub layer: Layer,
    /// Timeout for CONNECT_RESPONSE, TUNNELLING_ACK and heartbeat replies.
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl TunnelConfig {
    pub fn new(server: SocketAddrV4) -> Self {
        Self {
            server,
            layer: Layer::LinkLayer,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
        }
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

enum Command {
    Send {
        cemi: Bytes,
        done: oneshot::Sender<Result<()>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to an open tunnelling connection.
#[derive(Debug)]
pub struct TunnelConnection {
    cmd: mpsc::Sender<Command>,
    events: mpsc::Receiver<BusEvent>,
    channel: u8,
    layer: Layer,
    task: JoinHandle<()>,
    closed: bool,
}

impl TunnelConnection {
    /// Connect to the server and start the receive loop.
    pub async fn open(config: TunnelConfig) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let local_port = socket.local_addr()?.port();
        // NAT form: the server takes IP and port from the datagram source.
        let local = Hpai::new(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port));
        let request = knxnet::connect_request(local, local, Cri::Tunnel { layer: config.layer });
        socket
            .send_to(&request, SocketAddr::V4(config.server))
            .await?;
        debug!(server = %config.server, ?config.layer, "connect request sent");

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
        info!(
            channel = response.channel,
            %data_endpoint,
            "tunnel established"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let actor = TunnelActor {
            socket,
            server: config.server,
            data_endpoint,
            control: local,
            channel: response.channel,
            tx_seq: 0,
            rx_seq: None,
            ack_timeout: config.connect_timeout,
            events: event_tx,
        };
        let task = tokio::spawn(actor.run(cmd_rx, config.heartbeat_interval));

        Ok(Self {
            cmd: cmd_tx,
            events,
            channel: response.channel,
            layer: config.layer,
            task,
            closed: false,
        })
    }

    /// Connection id assigned by the server.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Send a cEMI frame and wait for its TUNNELLING_ACK. Sends are
    /// serialised: at most one request is outstanding at a time.
    pub async fn send(&self, frame: &CemiFrame) -> Result<()> {
        if self.layer == Layer::Busmonitor {
            return Err(KnxError::InvalidMode("send is not available in busmonitor layer"));
        }
        let (done, acked) = oneshot::channel();
        self.cmd
            .send(Command::Send {
                cemi: frame.to_bytes(),
                done,
            })
            .await
            .map_err(|_| KnxError::ConnectionLost)?;
        acked.await.map_err(|_| KnxError::ConnectionLost)?
    }

    /// Next bus event; `None` once the connection is closed or lost.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }

    /// Disconnect and release the socket. Idempotent.
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

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct TunnelActor {
    socket: UdpSocket,
    server: SocketAddrV4,
    data_endpoint: SocketAddrV4,
    control: Hpai,
    channel: u8,
    tx_seq: u8,
    rx_seq: Option<u8>,
    ack_timeout: Duration,
    events: mpsc::Sender<BusEvent>,
}

impl TunnelActor {
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
                    Some(Command::Send { cemi, done }) => {
                        let result = self.do_send(&cemi).await;
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
            ServiceType::TunnellingRequest => {
                let Ok((header, cemi)) = ConnectionHeader::parse(body) else {
                    let _ = self
                        .events
                        .send(BusEvent::Error("malformed tunnelling request".into()))
                        .await;
                    return ControlFlow::Continue(());
                };
                if header.channel != self.channel {
                    debug!(channel = header.channel, "request for foreign channel");
                    return ControlFlow::Continue(());
                }
                // ACK first, even for duplicates; deliver after.
                let ack = knxnet::tunnelling_ack(self.channel, header.seq, status::NO_ERROR);
                if let Err(e) = self
                    .socket
                    .send_to(&ack, SocketAddr::V4(self.data_endpoint))
                    .await
                {
                    let _ = self
                        .events
                        .send(BusEvent::Error(format!("ack send failed: {e}")))
                        .await;
                }
                if self.rx_seq == Some(header.seq) {
                    trace!(seq = header.seq, "duplicate sequence, not re-delivered");
                    return ControlFlow::Continue(());
                }
                self.rx_seq = Some(header.seq);
                match CemiFrame::parse(cemi) {
                    Ok(frame) if frame.is_valid() => {
                        let _ = self.events.send(BusEvent::Frame(frame)).await;
                    }
                    Ok(_) => {
                        let _ = self
                            .events
                            .send(BusEvent::Error("invalid cEMI frame dropped".into()))
                            .await;
                    }
                    Err(e) => {
                        let _ = self
                            .events
                            .send(BusEvent::Error(format!("bad cEMI frame: {e}")))
                            .await;
                    }
                }
                ControlFlow::Continue(())
            }
            ServiceType::ConnectionstateRequest => {
                // Server-initiated heartbeat.
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

    /// Send one TUNNELLING_REQUEST and wait for its ACK, still answering
    /// inbound traffic meanwhile.
    async fn do_send(&mut self, cemi: &[u8]) -> Result<()> {
        let seq = self.tx_seq;
        let request = knxnet::tunnelling_request(self.channel, seq, cemi);
        self.socket
            .send_to(&request, SocketAddr::V4(self.data_endpoint))
            .await?;
        trace!(seq, "tunnelling request sent");

        let deadline = Instant::now() + self.ack_timeout;
        let mut buf = [0u8; 512];
        loop {
            let (len, from) = match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Err(KnxError::ConnectionTimeout),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(received)) => received,
            };
            if let Ok((ServiceType::TunnellingAck, body)) = knxnet::parse_frame(&buf[..len]) {
                if let Ok((header, _)) = ConnectionHeader::parse(body) {
                    if header.channel == self.channel && header.seq == seq {
                        if header.status != status::NO_ERROR {
                            return Err(KnxError::AckStatus(header.status));
                        }
                        self.tx_seq = self.tx_seq.wrapping_add(1);
                        return Ok(());
                    }
                    debug!(seq = header.seq, "stale ack ignored");
                }
                continue;
            }
            if self.handle_datagram(&buf[..len], from).await.is_break() {
                return Err(KnxError::ConnectionLost);
            }
        }
    }

    async fn do_heartbeat(&mut self) -> Result<()> {
        let request = knxnet::connectionstate_request(self.channel, self.control);
        self.socket
            .send_to(&request, SocketAddr::V4(self.server))
            .await?;
        trace!(channel = self.channel, "heartbeat sent");

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
        info!(channel = self.channel, "tunnel closed");
    }
}
