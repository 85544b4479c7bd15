//! Ethernet/EtherCAT wire-level constants and header views (spec §6 "Wire").

use bitfield::bitfield;

pub const ETHERTYPE_ECAT: u16 = 0x88A4;

/// Destination is always broadcast (spec §6).
pub const DST_MAC: u64 = 0xFFFF_FFFF_FFFF;

/// Source MAC used on the primary link. The second 16-bit word (bytes 2-3,
/// `0x10_10`) is the link discriminator the Port records from the second MAC
/// word of a received frame (spec §4.1 redundant mode, §6).
pub const PRIMARY_MAC: u64 = 0x1010_1010_1010;
/// Source MAC used on the secondary link in redundant mode.
pub const SECONDARY_MAC: u64 = 0x1210_1010_1010;

/// The second 16-bit word of a MAC address, used to tell primary/secondary
/// replies apart once a frame has looped the ring.
pub fn mac_word1(mac: u64) -> u16 {
    ((mac >> 16) & 0xFFFF) as u16
}

pub const PRIMARY_MARKER: u16 = 0x1010;
pub const SECONDARY_MARKER: u16 = 0x1210;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const ECAT_HEADER_LEN: usize = 2;
pub const PDU_HEADER_LEN: usize = 10;
pub const WKC_LEN: usize = 2;

bitfield! {
    /// 14-byte Ethernet II header: dst MAC, src MAC, ethertype.
    #[derive(Clone)]
    pub struct EthernetHeader(MSB0 [u8]);
    u64;
    pub destination, set_destination: 47, 0;
    pub source, set_source: 48 + 47, 48;
    u16;
    pub ethertype, set_ethertype: 48 + 47 + 1 + 15, 48 + 47 + 1;
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> EthernetHeader<T> {
    pub fn set_ecat_defaults(&mut self, source_mac: u64) {
        self.set_destination(DST_MAC);
        self.set_source(source_mac);
        self.set_ethertype(ETHERTYPE_ECAT);
    }
}

bitfield! {
    /// 2-byte EtherCAT frame header: 11-bit length, 1 reserved bit, 4-bit type (1 = PDU).
    #[derive(Clone)]
    pub struct EthercatHeader([u8]);
    u16;
    pub length, set_length: 10, 0;
    u8;
    pub frame_type, set_frame_type: 15, 12;
}

pub const ECAT_FRAME_TYPE_PDU: u8 = 1;

bitfield! {
    /// 10-byte per-datagram header, little-endian on the wire.
    #[derive(Clone)]
    pub struct PduHeader([u8]);
    u8;
    pub command, set_command: 7, 0;
    pub index, set_index: 15, 8;
    u16;
    pub address_low, set_address_low: 31, 16;
    pub address_high, set_address_high: 47, 32;
    pub length, set_length: 58, 48;
    u8;
    pub round_trip, set_round_trip: 62;
    pub more, set_more: 63;
    u16;
    pub irq, set_irq: 64 + 15, 64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_header_roundtrip() {
        let mut buf = [0u8; PDU_HEADER_LEN];
        let mut hdr = PduHeader(&mut buf[..]);
        hdr.set_command(5);
        hdr.set_index(0x42);
        hdr.set_address_low(0x1000);
        hdr.set_address_high(0x0130);
        hdr.set_length(8);
        hdr.set_more(true);
        hdr.set_irq(0);

        let hdr = PduHeader(&buf[..]);
        assert_eq!(hdr.command(), 5);
        assert_eq!(hdr.index(), 0x42);
        assert_eq!(hdr.address_low(), 0x1000);
        assert_eq!(hdr.address_high(), 0x0130);
        assert_eq!(hdr.length(), 8);
        assert!(hdr.more());
    }

    #[test]
    fn mac_word1_extracts_discriminator() {
        assert_eq!(mac_word1(PRIMARY_MAC), PRIMARY_MARKER);
        assert_eq!(mac_word1(SECONDARY_MAC), SECONDARY_MARKER);
    }
}
