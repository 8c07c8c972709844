pub mod code;
pub mod message;
pub mod packet;
pub mod socket;

pub use message::*;
pub use packet::Packet;
pub use socket::AsyncIgmpSocket;
pub use socket::RawIgmpSocket;

use packet::{checksum, IPPROTO_IGMP, MAX_PACKET_LEN, ROUTER_ALERT_OPTION};

use std::net::Ipv4Addr;

/// All-systems group, destination of General Queries.
pub const ALL_SYSTEMS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// All IGMPv3-capable routers, destination of Reports.
pub const ALL_IGMPV3_ROUTERS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

/// IGMP messages are link-local.
pub const IGMP_TTL: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgmpError {
    message: &'static str,
}

impl IgmpError {
    pub fn new(message: &'static str) -> Self {
        Self {
            message,
        }
    }
}

impl std::fmt::Display for IgmpError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IgmpError {}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IgmpMessage {
    /// type 0x11
    Query(MembershipQuery),

    /// type 0x22
    Report(MembershipReport),

    /// type (v1/v2 messages land here too)
    Unknown(u8),
}

fn read_addr(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
}

/// Decodes the IGMP message carried by `packet`.
///
/// Every length field is checked against the buffer before it is trusted.
pub fn decode(packet: &Packet) -> Result<IgmpMessage, IgmpError> {
    if packet.protocol() != IPPROTO_IGMP {
        return Err(IgmpError::new("not an IGMP packet"));
    }
    if packet.ttl() != IGMP_TTL {
        return Err(IgmpError::new("IGMP packet TTL != 1"));
    }

    let data = packet.payload();
    if data.len() < 8 {
        return Err(IgmpError::new("IGMP packet too short"));
    }
    if checksum(data) != 0 {
        return Err(IgmpError::new("IGMP checksum mismatch"));
    }

    match data[0] {
        IGMP_TYPE_MEMBERSHIP_QUERY => {
            if data.len() < QUERY_LEN {
                // an 8-byte query is IGMPv1/v2
                return Ok(IgmpMessage::Unknown(data[0]));
            }
            let max_resp_code = data[1];
            let group_address = read_addr(data, 4);
            let suppress_router_processing = data[8] & S_FLAG_MASK != 0;
            let qrv = data[8] & QRV_MASK;
            let qqic = data[9];
            let num_sources = u16::from_be_bytes([data[10], data[11]]) as usize;

            if QUERY_LEN + 4 * num_sources > data.len() {
                return Err(IgmpError::new("IGMP query source list truncated"));
            }
            let source_addresses = (0..num_sources)
                .map(|i| read_addr(data, QUERY_LEN + 4 * i))
                .collect();

            Ok(IgmpMessage::Query(MembershipQuery {
                max_resp_code,
                group_address,
                suppress_router_processing,
                qrv,
                qqic,
                source_addresses,
            }))
        }

        IGMP_TYPE_MEMBERSHIP_REPORT => {
            let num_records = u16::from_be_bytes([data[6], data[7]]);
            let mut records = Vec::new();

            let mut offset = REPORT_HEADER_LEN;
            for _ in 0..num_records {
                if offset + GROUP_RECORD_LEN > data.len() {
                    return Err(IgmpError::new("IGMP report truncated"));
                }

                let record_type = data[offset];
                let aux_data_len = data[offset + 1] as usize;
                let num_sources = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
                let multicast_address = read_addr(data, offset + 4);

                // sources and auxiliary data are skipped, not interpreted
                let end_offset = offset + GROUP_RECORD_LEN + 4 * num_sources + 4 * aux_data_len;
                if end_offset > data.len() {
                    return Err(IgmpError::new("IGMP group record truncated"));
                }

                match RecordType::from_u8(record_type) {
                    Some(record_type) => records.push(GroupRecord {
                        record_type,
                        multicast_address,
                    }),
                    None => {
                        log::debug!("skipping group record of unknown type {}", record_type);
                    }
                }

                offset = end_offset;
            }

            Ok(IgmpMessage::Report(MembershipReport {
                records,
            }))
        }

        other => Ok(IgmpMessage::Unknown(other)),
    }
}

fn finish_igmp(data: &mut [u8]) {
    data[2] = 0;
    data[3] = 0;
    let sum = checksum(data);
    data[2..4].copy_from_slice(&sum.to_be_bytes());
}

/// Builds an IGMPv3 Membership Query datagram.
pub fn encode_query(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    query: &MembershipQuery,
    identification: u16,
) -> Result<Packet, IgmpError> {
    if !query.source_addresses.is_empty() {
        return Err(IgmpError::new("IGMP query source lists are not supported"));
    }

    let mut data = [0u8; QUERY_LEN];
    data[0] = IGMP_TYPE_MEMBERSHIP_QUERY;
    data[1] = query.max_resp_code;
    data[4..8].copy_from_slice(&query.group_address.octets());
    data[8] = query.s_qrv();
    data[9] = query.qqic;
    // data[10..12]: number of sources, always zero
    finish_igmp(&mut data);

    Packet::build(source, destination, IPPROTO_IGMP, IGMP_TTL, identification, &ROUTER_ALERT_OPTION, &data)
}

/// Builds an IGMPv3 Membership Report datagram addressed to 224.0.0.22.
pub fn encode_report(
    source: Ipv4Addr,
    report: &MembershipReport,
    identification: u16,
) -> Result<Packet, IgmpError> {
    let len = REPORT_HEADER_LEN + GROUP_RECORD_LEN * report.records.len();
    if len + packet::IGMP_IP_HEADER_LEN > MAX_PACKET_LEN {
        return Err(IgmpError::new("IGMP report too long"));
    }

    let mut data = vec![0u8; len];
    data[0] = IGMP_TYPE_MEMBERSHIP_REPORT;
    data[6..8].copy_from_slice(&(report.records.len() as u16).to_be_bytes());

    for (i, record) in report.records.iter().enumerate() {
        let offset = REPORT_HEADER_LEN + GROUP_RECORD_LEN * i;
        data[offset] = record.record_type.into();
        // aux data length and number of sources stay zero
        data[offset + 4..offset + 8].copy_from_slice(&record.multicast_address.octets());
    }
    finish_igmp(&mut data);

    Packet::build(source, ALL_IGMPV3_ROUTERS_GROUP, IPPROTO_IGMP, IGMP_TTL, identification, &ROUTER_ALERT_OPTION, &data)
}

/// Serializes outgoing messages for one engine, numbering the datagrams.
#[derive(Debug, Clone)]
pub struct IgmpWriter {
    source: Ipv4Addr,
    identification: u16,
}

impl IgmpWriter {
    pub fn new(source: Ipv4Addr) -> Self {
        Self {
            source,
            identification: 1,
        }
    }

    pub fn source(&self) -> Ipv4Addr {
        self.source
    }

    fn next_identification(&mut self) -> u16 {
        let id = self.identification;
        self.identification = self.identification.wrapping_add(1);
        id
    }

    /// General queries go to 224.0.0.1, group-specific ones to the group itself.
    pub fn query(&mut self, query: &MembershipQuery) -> Result<Packet, IgmpError> {
        let destination = if query.is_group_specific() {
            query.group_address
        } else {
            ALL_SYSTEMS_GROUP
        };
        let id = self.next_identification();
        encode_query(self.source, destination, query, id)
    }

    pub fn report(&mut self, records: Vec<GroupRecord>) -> Result<Packet, IgmpError> {
        let id = self.next_identification();
        encode_report(self.source, &MembershipReport::new(records), id)
    }
}
