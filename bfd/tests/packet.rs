//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use bfd::packet::{DecodeError, Packet, PacketFlags, State};

fn test_encode_packet(bytes_expected: &[u8], packet: &Packet) {
    let bytes_actual = packet.encode();
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_packet(bytes: &[u8], packet_expected: &Result<Packet, DecodeError>) {
    let packet_actual = Packet::decode(bytes);
    assert_eq!(*packet_expected, packet_actual);
}

// A Down/Up-state control packet carrying the defaults (300ms tx/rx,
// 50ms echo, detect-mult 3).
fn packet1() -> (Vec<u8>, Packet) {
    (
        vec![
            0x20, 0xc0, 0x03, 0x18, 0x9f, 0xb2, 0x05, 0xd6, 0x4a, 0x23, 0x57, 0xdc, 0x00, 0x04,
            0x93, 0xe0, 0x00, 0x04, 0x93, 0xe0, 0x00, 0x00, 0xc3, 0x50,
        ],
        Packet {
            version: 1,
            diag: 0,
            state: State::Up,
            flags: PacketFlags::empty(),
            detect_mult: 3,
            my_discr: 0x9fb205d6,
            your_discr: 0x4a2357dc,
            desired_min_tx: 300000,
            req_min_rx: 300000,
            req_min_echo_rx: 50000,
        },
    )
}

#[test]
fn test_encode_packet1() {
    let (bytes, packet) = packet1();
    test_encode_packet(&bytes, &packet);
}

#[test]
fn test_decode_packet1() {
    let (bytes, packet) = packet1();
    test_decode_packet(&bytes, &Ok(packet));
}

#[test]
fn test_decode_packet_with_poll_and_final_bits() {
    // State Down (0b00), P and F flags set (bits 5 and 4 of the second
    // byte), everything else as packet1.
    let mut bytes = packet1().0;
    bytes[1] = (bytes[1] & 0xc0) | PacketFlags::P.bits() | PacketFlags::F.bits();
    let decoded = Packet::decode(&bytes).unwrap();
    assert!(decoded.flags.contains(PacketFlags::P));
    assert!(decoded.flags.contains(PacketFlags::F));
}

#[test]
fn test_decode_rejects_incomplete_packet() {
    let bytes = &packet1().0[..23];
    assert_eq!(Packet::decode(bytes), Err(DecodeError::IncompletePacket));
}

#[test]
fn test_decode_rejects_version_mismatch() {
    let mut bytes = packet1().0;
    // Clear the version field (top 3 bits of the first byte) to 0.
    bytes[0] &= 0x1f;
    assert_eq!(Packet::decode(&bytes), Err(DecodeError::InvalidVersion(0)));
}

#[test]
fn test_decode_rejects_zero_detect_mult() {
    let mut bytes = packet1().0;
    bytes[2] = 0;
    assert_eq!(
        Packet::decode(&bytes),
        Err(DecodeError::InvalidDetectMult(0))
    );
}

#[test]
fn test_decode_rejects_reserved_m_flag() {
    let mut bytes = packet1().0;
    bytes[1] = (bytes[1] & 0xc0) | PacketFlags::M.bits();
    assert_eq!(
        Packet::decode(&bytes),
        Err(DecodeError::InvalidFlags(PacketFlags::M))
    );
}

#[test]
fn test_decode_rejects_zero_my_discriminator() {
    let mut bytes = packet1().0;
    bytes[4..8].copy_from_slice(&0u32.to_be_bytes());
    assert_eq!(
        Packet::decode(&bytes),
        Err(DecodeError::InvalidMyDiscriminator(0))
    );
}

#[test]
fn test_decode_rejects_undersized_length_field() {
    let mut bytes = packet1().0;
    bytes[3] = 20;
    assert_eq!(Packet::decode(&bytes), Err(DecodeError::InvalidPacketLength(20)));
}
