//! Transport-agnostic bus interface types shared by all transports.

use crate::cemi::CemiFrame;

/// KNX layer selected when opening a connection-oriented transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Layer {
    /// Tunnelling on the data link layer (normal operation).
    LinkLayer = 0x02,
    /// Raw frames.
    Raw = 0x04,
    /// Busmonitor: receive-only feed of everything on the bus.
    Busmonitor = 0x80,
}

/// Events emitted by a transport on its event channel.
///
/// After `close` the channel yields `None`; no further events are
/// delivered.
#[derive(Debug)]
pub enum BusEvent {
    /// An accepted cEMI frame.
    Frame(CemiFrame),
    /// A contained, non-fatal error the caller should log.
    Error(String),
    /// ROUTING_LOST_MESSAGE notification (routing only).
    LostMessage { device_state: u8, lost: u16 },
    /// ROUTING_BUSY notification (routing only). `busy_counter` counts
    /// busy frames seen within the current decay window.
    Busy {
        wait_time: u16,
        control: u16,
        busy_counter: u8,
    },
    /// Bus reset indication (USB only).
    Reset,
    /// The connection was torn down, by either side.
    Disconnected,
}

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;
