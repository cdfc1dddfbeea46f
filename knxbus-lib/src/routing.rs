//! Stateless KNXnet/IP routing transport: multicast push of bus traffic.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bus::{BusEvent, Layer, EVENT_CHANNEL_CAPACITY};
use crate::cemi::CemiFrame;
use crate::error::{KnxError, Result};
use crate::knxnet::{self, RoutingBusy, RoutingLost, ServiceType, DEFAULT_PORT, MULTICAST_GROUP};

/// Routing transport parameters.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub multicast_group: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
    /// Local interface to join the group on; unspecified picks the default.
    pub local_ip: Ipv4Addr,
    pub layer: Layer,
    /// Window after which the busy counter decays back to zero.
    pub busy_window: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            multicast_group: MULTICAST_GROUP,
            port: DEFAULT_PORT,
            ttl: 16,
            local_ip: Ipv4Addr::UNSPECIFIED,
            layer: Layer::LinkLayer,
            busy_window: Duration::from_secs(10),
        }
    }
}

/// Counts ROUTING_BUSY frames within a decay window. Routers repeat the
/// busy notification; the counter tells the consumer how congested the
/// backbone currently is.
#[derive(Debug)]
pub(crate) struct BusyTracker {
    window: Duration,
    counter: u8,
    last: Option<Instant>,
}

impl BusyTracker {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            counter: 0,
            last: None,
        }
    }

    pub(crate) fn record(&mut self, now: Instant) -> u8 {
        if let Some(last) = self.last {
            if now.duration_since(last) > self.window {
                self.counter = 0;
            }
        }
        self.counter = self.counter.saturating_add(1);
        self.last = Some(now);
        self.counter
    }
}

/// Frames with hop count zero carry the "don't route" marker and must not
/// be forwarded to the consumer.
pub(crate) fn routable(frame: &CemiFrame) -> bool {
    frame.ldata().map_or(true, |l| l.hop_count() != 0)
}

/// Multicast routing transport.
///
/// Sends are fire-and-forget; there is no ACK and no retry. Busmonitor
/// mode is rejected, routers do not propagate monitor frames.
pub struct RoutingTransport {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    events: mpsc::Receiver<BusEvent>,
    task: JoinHandle<()>,
}

impl RoutingTransport {
    pub async fn open(config: RoutingConfig) -> Result<Self> {
        if config.layer == Layer::Busmonitor {
            return Err(KnxError::InvalidMode("busmonitor is not available over routing"));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)).into())?;
        socket.set_multicast_ttl_v4(config.ttl)?;
        socket.join_multicast_v4(&config.multicast_group, &config.local_ip)?;
        socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(StdUdpSocket::from(socket))?);

        let target = SocketAddr::V4(SocketAddrV4::new(config.multicast_group, config.port));
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(recv_loop(
            Arc::clone(&socket),
            event_tx,
            BusyTracker::new(config.busy_window),
        ));
        info!(group = %config.multicast_group, port = config.port, "routing transport open");

        Ok(Self {
            socket,
            target,
            events,
            task,
        })
    }

    /// Multicast a cEMI frame as a ROUTING_INDICATION.
    pub async fn send(&self, frame: &CemiFrame) -> Result<()> {
        let datagram = knxnet::routing_indication(&frame.to_bytes());
        self.socket.send_to(&datagram, self.target).await?;
        Ok(())
    }

    /// Next bus event; `None` once the transport is closed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }

    pub fn close(self) {
        self.task.abort();
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<BusEvent>,
    mut busy: BusyTracker,
) {
    let mut buf = [0u8; 512];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                let _ = events
                    .send(BusEvent::Error(format!("socket receive failed: {e}")))
                    .await;
                return;
            }
        };
        let (service, body) = match knxnet::parse_frame(&buf[..len]) {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = events
                    .send(BusEvent::Error(format!("dropped datagram from {from}: {e}")))
                    .await;
                continue;
            }
        };
        let event = match service {
            ServiceType::RoutingIndication => match CemiFrame::parse(body) {
                Ok(frame) if frame.is_valid() => {
                    if routable(&frame) {
                        BusEvent::Frame(frame)
                    } else {
                        debug!("dropping frame with hop count 0");
                        continue;
                    }
                }
                Ok(_) => BusEvent::Error(format!("invalid cEMI frame from {from}")),
                Err(e) => BusEvent::Error(format!("bad cEMI frame from {from}: {e}")),
            },
            ServiceType::RoutingLostMessage => match RoutingLost::parse(body) {
                Ok(lost) => BusEvent::LostMessage {
                    device_state: lost.device_state,
                    lost: lost.lost,
                },
                Err(e) => BusEvent::Error(format!("bad lost-message frame: {e}")),
            },
            ServiceType::RoutingBusy => match RoutingBusy::parse(body) {
                Ok(info) => BusEvent::Busy {
                    wait_time: info.wait_time,
                    control: info.control,
                    busy_counter: busy.record(Instant::now()),
                },
                Err(e) => BusEvent::Error(format!("bad busy frame: {e}")),
            },
            other => {
                debug!(?other, "unhandled service type");
                continue;
            }
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}
