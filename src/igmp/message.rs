use std::net::Ipv4Addr;

pub const IGMP_TYPE_MEMBERSHIP_QUERY: u8 = 0x11;
pub const IGMP_TYPE_MEMBERSHIP_REPORT: u8 = 0x22;

pub const S_FLAG_MASK: u8 = 0x08;
pub const QRV_MASK: u8 = 0x07;

/// Fixed part of a query: type, code, checksum, group, S/QRV, QQIC, source count.
pub const QUERY_LEN: usize = 12;

/// Fixed part of a report: type, reserved, checksum, reserved, record count.
pub const REPORT_HEADER_LEN: usize = 8;

/// Group record without sources or auxiliary data.
pub const GROUP_RECORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    ModeIsInclude = 1,
    ModeIsExclude = 2,
    ChangeToInclude = 3,
    ChangeToExclude = 4,
    AllowNewSources = 5,
    BlockOldSources = 6,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::ModeIsInclude),
            2 => Some(RecordType::ModeIsExclude),
            3 => Some(RecordType::ChangeToInclude),
            4 => Some(RecordType::ChangeToExclude),
            5 => Some(RecordType::AllowNewSources),
            6 => Some(RecordType::BlockOldSources),
            _ => None,
        }
    }
}

impl From<RecordType> for u8 {
    fn from(value: RecordType) -> Self {
        value as u8
    }
}

/// IGMPv3 group record. Source lists are never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupRecord {
    pub record_type: RecordType,
    pub multicast_address: Ipv4Addr,
}

impl GroupRecord {
    pub fn new(record_type: RecordType, multicast_address: Ipv4Addr) -> Self {
        Self {
            record_type,
            multicast_address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipQuery {
    pub max_resp_code: u8,
    pub group_address: Ipv4Addr,
    pub suppress_router_processing: bool,
    pub qrv: u8,
    pub qqic: u8,
    pub source_addresses: Vec<Ipv4Addr>,
}

impl MembershipQuery {
    pub fn general(max_resp_code: u8, qrv: u8, qqic: u8) -> Self {
        Self {
            max_resp_code,
            group_address: Ipv4Addr::UNSPECIFIED,
            suppress_router_processing: false,
            qrv,
            qqic,
            source_addresses: Vec::new(),
        }
    }

    pub fn group_specific(group: Ipv4Addr, max_resp_code: u8, qrv: u8, qqic: u8) -> Self {
        Self {
            group_address: group,
            ..Self::general(max_resp_code, qrv, qqic)
        }
    }

    pub fn is_general(&self) -> bool {
        self.group_address.is_unspecified() && self.source_addresses.is_empty()
    }

    pub fn is_group_specific(&self) -> bool {
        !self.group_address.is_unspecified()
    }

    /// The S/QRV byte: reserved bits, Suppress flag, QRV.
    pub fn s_qrv(&self) -> u8 {
        let s = if self.suppress_router_processing { S_FLAG_MASK } else { 0 };
        s | (self.qrv & QRV_MASK)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipReport {
    pub records: Vec<GroupRecord>,
}

impl MembershipReport {
    pub fn new(records: Vec<GroupRecord>) -> Self {
        Self { records }
    }
}
