//! Host side of IGMPv3.
//!
//! Tracks the groups this host listens to, announces joins and leaves with
//! unsolicited reports, and answers queries after a random delay. Answers to
//! several queries that arrive before the delay elapses go out as one report.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ResponderConfig;
use crate::daemon::Engine;
use crate::igmp::code::code_to_millis;
use crate::igmp::packet::{IGMP_IP_HEADER_LEN, IPPROTO_IGMP, IPPROTO_UDP, MAX_PACKET_LEN};
use crate::igmp::{
    self, GroupRecord, IgmpMessage, IgmpWriter, MembershipQuery, Packet, RecordType, GROUP_RECORD_LEN,
    REPORT_HEADER_LEN,
};
use crate::timer::{Millis, TimerHandle, TimerQueue};

const MAX_RECORDS_PER_REPORT: usize = (MAX_PACKET_LEN - IGMP_IP_HEADER_LEN - REPORT_HEADER_LEN) / GROUP_RECORD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderError {
    AlreadyMember(Ipv4Addr),
    NotMember(Ipv4Addr),
    NotMulticast(Ipv4Addr),
}

impl std::fmt::Display for ResponderError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResponderError::AlreadyMember(group) => write!(f, "already a member of {}", group),
            ResponderError::NotMember(group) => write!(f, "not a member of {}", group),
            ResponderError::NotMulticast(group) => write!(f, "{} is not a multicast group", group),
        }
    }
}

impl std::error::Error for ResponderError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponderTimer {
    Response,
    Retransmit(Ipv4Addr),
}

/// Remaining copies of an unsolicited report.
#[derive(Debug, Clone, Copy)]
struct Burst {
    record_type: RecordType,
    remaining: u32,
    timer: TimerHandle,
}

#[derive(Debug)]
pub struct Responder<R: Rng = StdRng> {
    config: ResponderConfig,
    writer: IgmpWriter,
    rng: R,
    timers: TimerQueue<ResponderTimer>,
    last_seen_qrv: u8,
    members: BTreeSet<Ipv4Addr>,
    leaving: BTreeSet<Ipv4Addr>,
    bursts: HashMap<Ipv4Addr, Burst>,
    pending: BTreeMap<Ipv4Addr, GroupRecord>,
    response_timer: Option<TimerHandle>,
}

impl Responder<StdRng> {
    pub fn with_entropy(config: ResponderConfig) -> Self {
        Self::new(config, StdRng::from_entropy())
    }
}

impl<R: Rng> Responder<R> {
    pub fn new(config: ResponderConfig, rng: R) -> Self {
        Self {
            writer: IgmpWriter::new(config.source),
            last_seen_qrv: config.robustness,
            config,
            rng,
            timers: TimerQueue::new(),
            members: BTreeSet::new(),
            leaving: BTreeSet::new(),
            bursts: HashMap::new(),
            pending: BTreeMap::new(),
            response_timer: None,
        }
    }

    pub fn config(&self) -> &ResponderConfig {
        &self.config
    }

    pub fn is_member(&self, group: Ipv4Addr) -> bool {
        self.members.contains(&group)
    }

    pub fn members(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.members.iter().copied()
    }

    pub fn is_leaving(&self, group: Ipv4Addr) -> bool {
        self.leaving.contains(&group)
    }

    pub fn last_seen_qrv(&self) -> u8 {
        self.last_seen_qrv
    }

    /// Records waiting for the response timer.
    pub fn pending_records(&self) -> Vec<GroupRecord> {
        self.pending.values().copied().collect()
    }

    pub fn response_deadline(&self) -> Option<Millis> {
        self.response_timer.and_then(|handle| self.timers.deadline(handle))
    }

    pub fn next_deadline(&mut self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    pub fn join(&mut self, now: Millis, group: Ipv4Addr) -> Result<Vec<Packet>, ResponderError> {
        if !group.is_multicast() {
            log::warn!("refusing to join {}: not a multicast group", group);
            return Err(ResponderError::NotMulticast(group));
        }
        if self.members.contains(&group) {
            log::warn!("already a member of {}", group);
            return Err(ResponderError::AlreadyMember(group));
        }

        self.members.insert(group);
        self.leaving.remove(&group);
        log::info!("joined {}", group);

        self.start_burst(now, group, RecordType::ChangeToExclude);
        Ok(self.report(vec![GroupRecord::new(RecordType::ChangeToExclude, group)]))
    }

    pub fn leave(&mut self, now: Millis, group: Ipv4Addr) -> Result<Vec<Packet>, ResponderError> {
        if !self.members.remove(&group) {
            log::warn!("not a member of {}", group);
            return Err(ResponderError::NotMember(group));
        }
        self.pending.remove(&group);
        log::info!("left {}", group);

        if self.start_burst(now, group, RecordType::ChangeToInclude) {
            self.leaving.insert(group);
        }
        Ok(self.report(vec![GroupRecord::new(RecordType::ChangeToInclude, group)]))
    }

    /// Takes one inbound IPv4 datagram; returns the datagram itself if it is
    /// multicast data for a joined group. Query answers come out of
    /// [`Responder::handle_timers`].
    pub fn handle_message(&mut self, now: Millis, data: &[u8]) -> Vec<Packet> {
        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("dropping malformed packet: {}", e);
                return Vec::new();
            }
        };

        match packet.protocol() {
            IPPROTO_IGMP => {
                match igmp::decode(&packet) {
                    Ok(IgmpMessage::Query(query)) => self.handle_query(now, &query),
                    Ok(IgmpMessage::Report(_)) => {
                        log::trace!("ignoring report from {}", packet.source());
                    }
                    Ok(IgmpMessage::Unknown(igmp_type)) => {
                        log::debug!("ignoring IGMP type {:#04x} from {}", igmp_type, packet.source());
                    }
                    Err(e) => {
                        log::debug!("dropping IGMP packet from {}: {}", packet.source(), e);
                    }
                }
                Vec::new()
            }

            IPPROTO_UDP => {
                let dst = packet.destination();
                if dst.is_multicast() && self.members.contains(&dst) {
                    vec![packet]
                } else {
                    log::trace!("dropping UDP datagram to {}", dst);
                    Vec::new()
                }
            }

            protocol => {
                log::trace!("dropping packet with protocol {}", protocol);
                Vec::new()
            }
        }
    }

    /// Fires every timer due at `now`.
    pub fn handle_timers(&mut self, now: Millis) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some((handle, timer)) = self.timers.pop_expired(now) {
            log::debug!("responder timer fired: {:?}", timer);
            match timer {
                ResponderTimer::Response => out.extend(self.send_pending(handle)),
                ResponderTimer::Retransmit(group) => out.extend(self.retransmit(handle, now, group)),
            }
        }
        out
    }

    fn handle_query(&mut self, now: Millis, query: &MembershipQuery) {
        self.last_seen_qrv = if query.qrv == 0 {
            self.config.robustness
        } else {
            query.qrv
        };

        let records: Vec<GroupRecord> = if query.is_general() {
            self.members
                .iter()
                .map(|&group| GroupRecord::new(RecordType::ModeIsExclude, group))
                .collect()
        } else if self.members.contains(&query.group_address) {
            vec![GroupRecord::new(RecordType::ModeIsExclude, query.group_address)]
        } else {
            Vec::new()
        };

        if records.is_empty() {
            log::trace!("nothing to report for query on {}", query.group_address);
            return;
        }

        for record in records {
            self.pending.insert(record.multicast_address, record);
        }

        if self.response_timer.map(|handle| self.timers.is_pending(handle)).unwrap_or(false) {
            return;
        }
        let max_delay = code_to_millis(query.max_resp_code);
        let delay = self.rng.gen_range(0..=max_delay);
        self.response_timer = Some(self.timers.schedule(now, delay, ResponderTimer::Response));
        log::debug!("answering query on {} in {} ms", query.group_address, delay);
    }

    fn send_pending(&mut self, handle: TimerHandle) -> Vec<Packet> {
        if self.response_timer != Some(handle) {
            return Vec::new();
        }
        self.response_timer = None;

        let records: Vec<GroupRecord> = std::mem::take(&mut self.pending).into_values().collect();
        records
            .chunks(MAX_RECORDS_PER_REPORT)
            .flat_map(|chunk| self.report(chunk.to_vec()))
            .collect()
    }

    /// Returns `false` when no copies are due.
    fn start_burst(&mut self, now: Millis, group: Ipv4Addr, record_type: RecordType) -> bool {
        if let Some(burst) = self.bursts.remove(&group) {
            self.timers.cancel(burst.timer);
        }
        if self.last_seen_qrv <= 1 {
            return false;
        }

        let delay = self.rng.gen_range(0..=self.config.unsolicited_report_interval);
        let timer = self.timers.schedule(now, delay, ResponderTimer::Retransmit(group));
        self.bursts.insert(group, Burst {
            record_type,
            remaining: self.last_seen_qrv as u32 - 1,
            timer,
        });
        true
    }

    fn retransmit(&mut self, handle: TimerHandle, now: Millis, group: Ipv4Addr) -> Vec<Packet> {
        let burst = match self.bursts.get_mut(&group) {
            Some(burst) if burst.timer == handle => burst,
            _ => return Vec::new(),
        };

        let record_type = burst.record_type;
        burst.remaining -= 1;
        if burst.remaining > 0 {
            let delay = self.rng.gen_range(0..=self.config.unsolicited_report_interval);
            burst.timer = self.timers.schedule(now, delay, ResponderTimer::Retransmit(group));
        } else {
            self.bursts.remove(&group);
            if record_type == RecordType::ChangeToInclude {
                self.leaving.remove(&group);
            }
        }

        self.report(vec![GroupRecord::new(record_type, group)])
    }

    fn report(&mut self, records: Vec<GroupRecord>) -> Vec<Packet> {
        match self.writer.report(records) {
            Ok(packet) => vec![packet],
            Err(e) => {
                log::warn!("failed to build report: {}", e);
                Vec::new()
            }
        }
    }
}

impl<R: Rng + Send> Engine for Responder<R> {
    fn handle_message(&mut self, now: Millis, data: &[u8]) -> Vec<Packet> {
        Responder::handle_message(self, now, data)
    }

    fn handle_timers(&mut self, now: Millis) -> Vec<Packet> {
        Responder::handle_timers(self, now)
    }

    fn next_deadline(&mut self) -> Option<Millis> {
        Responder::next_deadline(self)
    }
}
