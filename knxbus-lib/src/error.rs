use std::io;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, KnxError>;

/// The primary error type for `knxbus-lib`.
#[derive(Error, Debug)]
pub enum KnxError {
    #[error("invalid KNXnet/IP header")]
    BadHeader,

    #[error("unsupported KNXnet/IP protocol version {0:#04x}")]
    BadVersion(u8),

    #[error("KNXnet/IP length mismatch: header says {expected}, datagram has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid cEMI frame: {0}")]
    BadCemi(&'static str),

    #[error("unknown KNXnet/IP service type {0:#06x}")]
    UnknownServiceType(u16),

    #[error("timed out waiting for the peer response")]
    ConnectionTimeout,

    #[error("connection refused by server (status {0:#04x})")]
    ConnectionRefused(u8),

    #[error("connection lost")]
    ConnectionLost,

    #[error("request not acknowledged (status {0:#04x})")]
    AckStatus(u8),

    #[error("not connected")]
    NotConnected,

    #[error("operation not allowed in this mode: {0}")]
    InvalidMode(&'static str),

    #[error("invalid KNX address: {0}")]
    InvalidAddress(String),

    #[error("property service failed with return code {0:#04x}")]
    PropertyError(u8),

    #[error("KNX USB interface not found")]
    DeviceNotFound,

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("USB interface initialization failed: {0}")]
    UsbInit(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timeout: {0}")]
    Elapsed(#[from] tokio::time::error::Elapsed),
}
