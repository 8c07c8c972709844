use super::IgmpError;

use std::fmt::Debug;
use std::net::Ipv4Addr;

pub const IPPROTO_IGMP: u8 = 2;
pub const IPPROTO_UDP: u8 = 17;

pub const IPV4_HEADER_LEN: usize = 20;

/// Router Alert option (RFC 2113): type 148, length 4, value 0.
pub const ROUTER_ALERT_OPTION: [u8; 4] = [148, 4, 0, 0];

/// Header plus Router Alert option, as emitted for every IGMP message.
pub const IGMP_IP_HEADER_LEN: usize = IPV4_HEADER_LEN + ROUTER_ALERT_OPTION.len();

/// Largest datagram the writer produces (Ethernet MTU).
pub const MAX_PACKET_LEN: usize = 1500;

/// Internet checksum (RFC 1071) over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// An IPv4 datagram as handed to or produced by the engines.
///
/// Only the header fields the engines look at are decoded; `data` keeps the
/// whole datagram so forwarding does not re-serialize anything.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    header_len: usize,
}

impl Packet {
    /// Validates the IPv4 header and trims trailing link-layer padding.
    pub fn parse(data: &[u8]) -> Result<Self, IgmpError> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(IgmpError::new("IPv4 packet too short"));
        }
        if data[0] >> 4 != 4 {
            return Err(IgmpError::new("not an IPv4 packet"));
        }
        let header_len = ((data[0] & 0x0f) as usize) * 4;
        if header_len < IPV4_HEADER_LEN || header_len > data.len() {
            return Err(IgmpError::new("IPv4 header length out of range"));
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < header_len || total_len > data.len() {
            return Err(IgmpError::new("IPv4 total length out of range"));
        }

        Ok(Self {
            data: data[..total_len].to_vec(),
            header_len,
        })
    }

    /// Builds a datagram with no fragmentation, computing the header checksum.
    pub fn build(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: u8,
        ttl: u8,
        identification: u16,
        options: &[u8],
        payload: &[u8],
    ) -> Result<Self, IgmpError> {
        if options.len() % 4 != 0 || options.len() > 40 {
            return Err(IgmpError::new("IPv4 options must be 32-bit aligned"));
        }
        let header_len = IPV4_HEADER_LEN + options.len();
        let total_len = header_len + payload.len();
        if total_len > MAX_PACKET_LEN {
            return Err(IgmpError::new("IPv4 packet too long"));
        }

        let mut data = vec![0u8; total_len];
        data[0] = 0x40 | (header_len / 4) as u8;
        data[1] = 0;
        data[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        data[4..6].copy_from_slice(&identification.to_be_bytes());
        // flags and fragment offset stay zero
        data[8] = ttl;
        data[9] = protocol;
        data[12..16].copy_from_slice(&source.octets());
        data[16..20].copy_from_slice(&destination.octets());
        data[IPV4_HEADER_LEN..header_len].copy_from_slice(options);

        let sum = checksum(&data[..header_len]);
        data[10..12].copy_from_slice(&sum.to_be_bytes());

        data[header_len..].copy_from_slice(payload);

        Ok(Self { data, header_len })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    pub fn options(&self) -> &[u8] {
        &self.data[IPV4_HEADER_LEN..self.header_len]
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_len..]
    }

    pub fn has_router_alert(&self) -> bool {
        let options = self.options();
        let mut i = 0;
        while i < options.len() {
            match options[i] {
                // end of option list
                0 => break,
                // no-op
                1 => i += 1,
                kind => {
                    if i + 1 >= options.len() {
                        break;
                    }
                    let len = options[i + 1] as usize;
                    if len < 2 || i + len > options.len() {
                        break;
                    }
                    if kind == ROUTER_ALERT_OPTION[0] {
                        return true;
                    }
                    i += len;
                }
            }
        }
        false
    }

    pub fn is_header_checksum_valid(&self) -> bool {
        checksum(&self.data[..self.header_len]) == 0
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("source", &self.source())
            .field("destination", &self.destination())
            .field("protocol", &self.protocol())
            .field("ttl", &self.ttl())
            .field("data_len", &self.data.len())
            .finish()
    }
}
