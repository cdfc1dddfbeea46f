//! HID report framing and USB Transfer Protocol tests.

mod common;

use bytes::Bytes;
use common::*;
use knxbus_lib::usbtransfer::{
    feature, EmiId, HidReport, ProtocolId, ReportAssembler, TransferFrame, MAX_REPORT_BODY,
    PACKET_END, PACKET_PARTIAL, PACKET_START, REPORT_SIZE,
};

#[test]
fn single_report_round_trip() {
    let cemi = hex_to_bytes(LDATA_IND_STANDARD);
    let frame = TransferFrame::cemi(&cemi);
    let reports = frame.to_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].info.packet_type(), PACKET_START | PACKET_END);

    let raw = reports[0].to_bytes();
    assert_eq!(raw.len(), REPORT_SIZE);
    assert_eq!(raw[0], 0x01);

    let mut assembler = ReportAssembler::new();
    let packet = assembler.feed(&raw).expect("one report should complete");
    let parsed = TransferFrame::parse(&packet).unwrap();
    assert_eq!(parsed, frame);
    assert_eq!(parsed.emi_message_code(), Some(0x29));
}

#[test]
fn transfer_header_layout() {
    let frame = TransferFrame::cemi(&[0x29, 0x00]);
    let bytes = frame.to_bytes();
    assert_eq!(
        bytes.as_ref(),
        &[0x00, 0x08, 0x00, 0x02, 0x01, 0x03, 0x00, 0x00, 0x29, 0x00]
    );
    assert_eq!(frame.protocol, ProtocolId::KnxTunnel);
    assert_eq!(EmiId::from(frame.emi_id), EmiId::Cemi);
}

#[test]
fn multi_report_packet_reassembles() {
    // A body larger than one report's capacity.
    let body: Vec<u8> = (0..100u8).collect();
    let frame = TransferFrame {
        protocol: ProtocolId::KnxTunnel,
        emi_id: EmiId::Cemi.into(),
        manufacturer: 0,
        body: Bytes::from(body),
    };
    let reports = frame.to_reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].info.packet_type(), PACKET_START);
    assert_eq!(reports[0].body.len(), MAX_REPORT_BODY);
    assert_eq!(reports[1].info.packet_type(), PACKET_PARTIAL | PACKET_END);

    let mut assembler = ReportAssembler::new();
    assert!(assembler.push(&reports[0]).is_none());
    let packet = assembler.push(&reports[1]).unwrap();
    assert_eq!(TransferFrame::parse(&packet).unwrap(), frame);
}

#[test]
fn start_bit_mid_stream_discards_partial_buffer() {
    let mut assembler = ReportAssembler::new();
    // A start-only report leaves a partial buffer behind.
    let partial = HidReport::new(1, PACKET_START, Bytes::from_static(&[0xAA; 10]));
    assert!(assembler.push(&partial).is_none());

    // A fresh single-report packet must not inherit those bytes.
    let frame = TransferFrame::cemi(&hex_to_bytes(LDATA_IND_STANDARD));
    let single = &frame.to_reports()[0];
    let packet = assembler.push(single).unwrap();
    assert_eq!(TransferFrame::parse(&packet).unwrap(), frame);
}

#[test]
fn foreign_report_ids_are_ignored() {
    let mut assembler = ReportAssembler::new();
    let mut raw = [0u8; REPORT_SIZE];
    raw[0] = 0x02; // not a KNX report
    raw[1] = (1 << 4) | (PACKET_START | PACKET_END);
    raw[2] = 2;
    assert!(assembler.feed(&raw).is_none());
}

#[test]
fn truncated_transfer_frames_are_rejected() {
    assert!(TransferFrame::parse(&[0x00, 0x08, 0x00]).is_err());
    // Declared body length exceeds the packet.
    assert!(TransferFrame::parse(&[0x00, 0x08, 0x00, 0x10, 0x01, 0x03, 0x00, 0x00]).is_err());
    // Unsupported header.
    assert!(TransferFrame::parse(&[0x01, 0x08, 0x00, 0x00, 0x01, 0x03, 0x00, 0x00]).is_err());
}

#[test]
fn feature_service_frames() {
    let set = TransferFrame::feature_set(feature::ACTIVE_EMI, EmiId::Cemi.into());
    assert_eq!(
        set.to_bytes().as_ref(),
        &[0x00, 0x08, 0x00, 0x02, 0x0F, 0x03, 0x00, 0x00, 0x05, 0x03]
    );

    let get = TransferFrame::feature_get(feature::ACTIVE_EMI);
    assert_eq!(get.protocol, ProtocolId::BusAccessServer);
    assert_eq!(get.emi_id, feature::SERVICE_GET);
    assert_eq!(get.body.as_ref(), &[feature::ACTIVE_EMI]);
}

#[test]
fn report_sequence_counters_increment() {
    let body: Vec<u8> = (0..150u8).collect();
    let frame = TransferFrame {
        protocol: ProtocolId::KnxTunnel,
        emi_id: EmiId::Cemi.into(),
        manufacturer: 0,
        body: Bytes::from(body),
    };
    let reports = frame.to_reports();
    assert_eq!(reports.len(), 3);
    let seqs: Vec<u8> = reports.iter().map(|r| r.info.sequence()).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(reports[1].info.packet_type(), PACKET_PARTIAL);
}
