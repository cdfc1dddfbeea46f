//! Common test utilities and shared fixtures

// Not every helper is used by every test file.
#[allow(unused_imports)]
pub use knxbus_lib::addr::{GroupAddress, IndividualAddress};
#[allow(unused_imports)]
pub use knxbus_lib::cemi::{CemiFrame, LData, MessageCode, Priority};
#[allow(unused_imports)]
pub use knxbus_lib::error::KnxError;

/// Decode a hex string to bytes for fixtures.
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Vec<u8> {
    hex::decode(hex_data).expect("Failed to decode hex")
}

/// Standard L_Data.ind: source 13.0.17, individual destination 0.4.1,
/// low priority, hop count 0, no application payload.
#[allow(dead_code)]
pub const LDATA_IND_STANDARD: &str = "2900bcd0110401000081";

/// Same frame preceded by one additional-information entry
/// `{type 0x03, len 2, data 12 34}`.
#[allow(dead_code)]
pub const LDATA_IND_ADD_INFO: &str = "290403021234bcd01104010081";

/// Group-destination variant: merged CTRL2/length octet 0x81.
#[allow(dead_code)]
pub const LDATA_IND_GROUP: &str = "2900fcd0110401810080";

use std::net::{SocketAddr, SocketAddrV4};

use bytes::{BufMut, BytesMut};
use knxbus_lib::knxnet::{self, Hpai, ServiceType};
use tokio::net::UdpSocket;

/// Scripted KNXnet/IP server half for connection tests. Binds a plain UDP
/// socket on localhost and answers whatever the test tells it to.
#[allow(dead_code)]
pub struct MockGateway {
    pub socket: UdpSocket,
    pub client: Option<SocketAddr>,
    pub channel: u8,
}

#[allow(dead_code)]
impl MockGateway {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self {
            socket,
            client: None,
            channel: 0x07,
        }
    }

    pub fn addr(&self) -> SocketAddrV4 {
        match self.socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected local address {other}"),
        }
    }

    /// Receive one datagram, remembering the client endpoint.
    pub async fn recv(&mut self) -> (ServiceType, Vec<u8>) {
        let mut buf = [0u8; 512];
        let (len, from) = self.socket.recv_from(&mut buf).await.unwrap();
        self.client = Some(from);
        let (service, body) = knxnet::parse_frame(&buf[..len]).expect("client sent a bad frame");
        (service, body.to_vec())
    }

    pub async fn send(&self, datagram: &[u8]) {
        self.socket
            .send_to(datagram, self.client.expect("no client yet"))
            .await
            .unwrap();
    }

    /// Answer a CONNECT_REQUEST with the given status. The data endpoint
    /// is sent unspecified, so the client has to fall back to the datagram
    /// source address.
    pub async fn accept(&mut self, status: u8) -> Vec<u8> {
        let (service, request) = self.recv().await;
        assert_eq!(service, ServiceType::ConnectRequest);
        let mut body = BytesMut::new();
        body.put_u8(self.channel);
        body.put_u8(status);
        Hpai::unspecified().write(&mut body);
        body.put_slice(&[0x04, 0x04, 0x11, 0x01]); // CRD with a bus address
        self.send(&knxnet::build_frame(ServiceType::ConnectResponse, &body))
            .await;
        request
    }
}
