//! Router side of IGMPv3.
//!
//! Sends General Queries, learns which groups have listeners on the link from
//! Membership Reports and confirms leaves with Group-Specific Queries.
//!
//! | Timer | Fires after | Effect |
//! |-------|-------------|--------|
//! | general query | SQI during startup, then QI | next General Query |
//! | group membership | GMI, or LMQT after a leave | group removed |
//! | last member probe | LMQI | next Group-Specific Query |

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::config::QuerierConfig;
use crate::daemon::Engine;
use crate::igmp::code::{interval_to_qqic, millis_to_code};
use crate::igmp::packet::{IPPROTO_IGMP, IPPROTO_UDP};
use crate::igmp::{self, IgmpMessage, IgmpWriter, MembershipQuery, MembershipReport, Packet, RecordType};
use crate::timer::{Millis, TimerHandle, TimerQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuerierTimer {
    GeneralQuery,
    GroupMembership(Ipv4Addr),
    LastMemberProbe(Ipv4Addr),
}

/// Only EXCLUDE groups are kept; an INCLUDE group without sources has no listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupState {
    pub group_addr: Ipv4Addr,
    pub filter_mode: FilterMode,
    pub membership_timer: TimerHandle,
}

#[derive(Debug, Clone, Copy)]
struct LastMemberQuery {
    remaining: u32,
    probe_timer: TimerHandle,
}

#[derive(Debug)]
pub struct Querier {
    config: QuerierConfig,
    writer: IgmpWriter,
    timers: TimerQueue<QuerierTimer>,
    query_timer: TimerHandle,
    queries_sent: u32,
    groups: HashMap<Ipv4Addr, GroupState>,
    leaving: HashMap<Ipv4Addr, LastMemberQuery>,
}

impl Querier {
    /// The first General Query is due immediately.
    pub fn new(config: QuerierConfig, now: Millis) -> Self {
        let mut timers = TimerQueue::new();
        let query_timer = timers.schedule(now, 0, QuerierTimer::GeneralQuery);
        Self {
            writer: IgmpWriter::new(config.source),
            config,
            timers,
            query_timer,
            queries_sent: 0,
            groups: HashMap::new(),
            leaving: HashMap::new(),
        }
    }

    pub fn config(&self) -> &QuerierConfig {
        &self.config
    }

    pub fn queries_sent(&self) -> u32 {
        self.queries_sent
    }

    pub fn group(&self, group: Ipv4Addr) -> Option<&GroupState> {
        self.groups.get(&group)
    }

    /// Groups with listeners, in address order.
    pub fn groups(&self) -> Vec<Ipv4Addr> {
        let mut groups: Vec<_> = self.groups.keys().copied().collect();
        groups.sort();
        groups
    }

    pub fn is_leaving(&self, group: Ipv4Addr) -> bool {
        self.leaving.contains_key(&group)
    }

    /// When the group will be removed unless a report refreshes it.
    pub fn membership_deadline(&self, group: Ipv4Addr) -> Option<Millis> {
        self.groups.get(&group).and_then(|state| self.timers.deadline(state.membership_timer))
    }

    /// When the next General Query is due.
    pub fn next_query_at(&self) -> Option<Millis> {
        self.timers.deadline(self.query_timer)
    }

    pub fn next_deadline(&mut self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    /// Fires every timer due at `now`.
    pub fn handle_timers(&mut self, now: Millis) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some((handle, timer)) = self.timers.pop_expired(now) {
            log::debug!("querier timer fired: {:?}", timer);
            match timer {
                QuerierTimer::GeneralQuery => out.extend(self.on_tick(now)),
                QuerierTimer::GroupMembership(group) => self.handle_group_timeout(handle, group),
                QuerierTimer::LastMemberProbe(group) => out.extend(self.handle_last_member_probe(handle, now, group)),
            }
        }
        out
    }

    /// Takes one inbound IPv4 datagram; returns queries to send and the
    /// datagram itself if it is multicast data that should be forwarded.
    pub fn handle_message(&mut self, now: Millis, data: &[u8]) -> Vec<Packet> {
        match Packet::parse(data) {
            Ok(packet) => self.handle_packet(now, packet),
            Err(e) => {
                log::debug!("dropping malformed packet: {}", e);
                Vec::new()
            }
        }
    }

    pub fn handle_packet(&mut self, now: Millis, packet: Packet) -> Vec<Packet> {
        match packet.protocol() {
            IPPROTO_IGMP => match igmp::decode(&packet) {
                Ok(IgmpMessage::Report(report)) => self.handle_report(now, &report),
                Ok(IgmpMessage::Query(query)) => {
                    log::debug!("ignoring query from {} for {}", packet.source(), query.group_address);
                    Vec::new()
                }
                Ok(IgmpMessage::Unknown(igmp_type)) => {
                    log::debug!("ignoring IGMP type {:#04x} from {}", igmp_type, packet.source());
                    Vec::new()
                }
                Err(e) => {
                    log::debug!("dropping IGMP packet from {}: {}", packet.source(), e);
                    Vec::new()
                }
            },

            IPPROTO_UDP => {
                let dst = packet.destination();
                if dst.is_multicast() && self.groups.contains_key(&dst) {
                    vec![packet]
                } else {
                    log::trace!("dropping UDP datagram to {}: no listeners", dst);
                    Vec::new()
                }
            }

            protocol => {
                log::trace!("dropping packet with protocol {}", protocol);
                Vec::new()
            }
        }
    }

    fn general_query(&mut self) -> Option<Packet> {
        let query = MembershipQuery::general(
            millis_to_code(self.config.query_response_interval),
            self.config.qrv(),
            interval_to_qqic(self.config.query_interval),
        );
        match self.writer.query(&query) {
            Ok(packet) => Some(packet),
            Err(e) => {
                log::warn!("failed to build general query: {}", e);
                None
            }
        }
    }

    fn group_query(&mut self, group: Ipv4Addr, suppress_router_processing: bool) -> Option<Packet> {
        let mut query = MembershipQuery::group_specific(
            group,
            millis_to_code(self.config.last_member_query_interval),
            self.config.qrv(),
            interval_to_qqic(self.config.query_interval),
        );
        query.suppress_router_processing = suppress_router_processing;
        match self.writer.query(&query) {
            Ok(packet) => Some(packet),
            Err(e) => {
                log::warn!("failed to build group-specific query for {}: {}", group, e);
                None
            }
        }
    }

    fn on_tick(&mut self, now: Millis) -> Option<Packet> {
        let packet = self.general_query();
        if packet.is_some() {
            self.queries_sent += 1;
        }

        let interval = if self.queries_sent < self.config.startup_query_count() {
            self.config.startup_query_interval()
        } else {
            self.config.query_interval
        };
        self.query_timer = self.timers.schedule(now, interval, QuerierTimer::GeneralQuery);
        packet
    }

    fn handle_report(&mut self, now: Millis, report: &MembershipReport) -> Vec<Packet> {
        let mut out = Vec::new();
        for record in &report.records {
            let group = record.multicast_address;
            if !group.is_multicast() || group == igmp::ALL_SYSTEMS_GROUP {
                log::debug!("ignoring record for {}", group);
                continue;
            }

            match record.record_type {
                RecordType::ChangeToExclude | RecordType::ModeIsExclude => {
                    self.refresh_group(now, group);
                }

                RecordType::ChangeToInclude => {
                    out.extend(self.start_last_member_query(now, group));
                }

                RecordType::ModeIsInclude | RecordType::AllowNewSources | RecordType::BlockOldSources => {
                    log::trace!("no action for {:?} record for {}", record.record_type, group);
                }
            }
        }
        out
    }

    fn refresh_group(&mut self, now: Millis, group: Ipv4Addr) {
        let gmi = self.config.group_membership_interval();
        match self.groups.get(&group) {
            Some(state) => {
                self.timers.reschedule(state.membership_timer, now, gmi);
            }
            None => {
                let membership_timer = self.timers.schedule(now, gmi, QuerierTimer::GroupMembership(group));
                self.groups.insert(group, GroupState {
                    group_addr: group,
                    filter_mode: FilterMode::Exclude,
                    membership_timer,
                });
                log::info!("listener present for {}", group);
            }
        }
    }

    fn start_last_member_query(&mut self, now: Millis, group: Ipv4Addr) -> Option<Packet> {
        let membership_timer = match self.groups.get(&group) {
            Some(state) => state.membership_timer,
            None => {
                log::debug!("leave for unknown group {}", group);
                return None;
            }
        };
        if self.leaving.contains_key(&group) {
            log::debug!("leave for {} already being confirmed", group);
            return None;
        }

        self.timers.reschedule(membership_timer, now, self.config.last_member_query_time());
        let probe_timer = self.timers.schedule(now, self.config.last_member_query_interval, QuerierTimer::LastMemberProbe(group));
        self.leaving.insert(group, LastMemberQuery {
            remaining: self.config.last_member_query_count() - 1,
            probe_timer,
        });
        log::info!("confirming leave for {}", group);

        self.group_query(group, false)
    }

    fn handle_group_timeout(&mut self, handle: TimerHandle, group: Ipv4Addr) {
        match self.groups.get(&group) {
            Some(state) if state.membership_timer == handle => {}
            _ => return,
        }

        self.groups.remove(&group);
        if let Some(lmq) = self.leaving.remove(&group) {
            self.timers.cancel(lmq.probe_timer);
        }
        log::info!("no listeners left for {}", group);
    }

    fn handle_last_member_probe(&mut self, handle: TimerHandle, now: Millis, group: Ipv4Addr) -> Option<Packet> {
        let lmq = self.leaving.get_mut(&group)?;
        if lmq.probe_timer != handle {
            return None;
        }
        if lmq.remaining == 0 {
            self.leaving.remove(&group);
            log::debug!("last member queries for {} done", group);
            return None;
        }

        lmq.remaining -= 1;
        lmq.probe_timer = self.timers.schedule(now, self.config.last_member_query_interval, QuerierTimer::LastMemberProbe(group));

        // a report raised the group timer again; routers only need to refresh
        let lmqt = self.config.last_member_query_time();
        let suppress = self
            .membership_deadline(group)
            .map(|deadline| deadline > now + lmqt)
            .unwrap_or(false);
        self.group_query(group, suppress)
    }
}

impl Engine for Querier {
    fn handle_message(&mut self, now: Millis, data: &[u8]) -> Vec<Packet> {
        Querier::handle_message(self, now, data)
    }

    fn handle_timers(&mut self, now: Millis) -> Vec<Packet> {
        Querier::handle_timers(self, now)
    }

    fn next_deadline(&mut self) -> Option<Millis> {
        Querier::next_deadline(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::igmp::{encode_report, GroupRecord, ALL_SYSTEMS_GROUP};

    const ROUTER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);

    fn config() -> QuerierConfig {
        QuerierConfig::new(ROUTER)
    }

    fn report(record_type: RecordType, group: Ipv4Addr) -> Vec<u8> {
        let report = MembershipReport::new(vec![GroupRecord::new(record_type, group)]);
        encode_report(HOST, &report, 1).unwrap().into_data()
    }

    fn udp(dst: Ipv4Addr) -> Vec<u8> {
        Packet::build(HOST, dst, IPPROTO_UDP, 8, 1, &[], &[0u8; 16]).unwrap().into_data()
    }

    fn queries(packets: &[Packet]) -> Vec<MembershipQuery> {
        packets
            .iter()
            .filter_map(|p| match igmp::decode(p) {
                Ok(IgmpMessage::Query(q)) => Some(q),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_startup_then_steady_queries() {
        let mut querier = Querier::new(config(), 0);
        assert_eq!(querier.next_deadline(), Some(0));

        let out = querier.handle_timers(0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination(), ALL_SYSTEMS_GROUP);
        let query = &queries(&out)[0];
        assert!(query.is_general());
        assert_eq!(query.max_resp_code, 100);
        assert_eq!(query.qrv, 2);
        assert_eq!(query.qqic, 125);

        // SQC startup queries, QI/4 apart
        assert_eq!(querier.next_deadline(), Some(31_250));
        assert_eq!(querier.handle_timers(31_250).len(), 1);
        assert_eq!(querier.next_query_at(), Some(156_250));
        assert_eq!(querier.queries_sent(), 2);
        assert!(querier.handle_timers(156_249).is_empty());
        assert_eq!(querier.handle_timers(156_250).len(), 1);
        assert_eq!(querier.next_deadline(), Some(281_250));
    }

    #[test]
    fn test_udp_dropped_without_listeners() {
        let mut querier = Querier::new(config(), 0);
        assert!(querier.handle_message(0, &udp(GROUP)).is_empty());
    }

    #[test]
    fn test_exclude_report_creates_group() {
        let mut querier = Querier::new(config(), 0);
        let out = querier.handle_message(100, &report(RecordType::ChangeToExclude, GROUP));
        assert!(out.is_empty());

        let state = querier.group(GROUP).unwrap();
        assert_eq!(state.filter_mode, FilterMode::Exclude);
        assert_eq!(querier.membership_deadline(GROUP), Some(260_100));

        let forwarded = querier.handle_message(200, &udp(GROUP));
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].data(), &udp(GROUP)[..]);
        assert!(querier.handle_message(200, &udp(Ipv4Addr::new(224, 2, 2, 2))).is_empty());
    }

    #[test]
    fn test_reports_refresh_membership() {
        let mut querier = Querier::new(config(), 0);
        querier.handle_message(0, &report(RecordType::ChangeToExclude, GROUP));
        querier.handle_message(100_000, &report(RecordType::ChangeToExclude, GROUP));
        assert_eq!(querier.membership_deadline(GROUP), Some(360_000));
        querier.handle_message(200_000, &report(RecordType::ModeIsExclude, GROUP));
        assert_eq!(querier.membership_deadline(GROUP), Some(460_000));

        querier.handle_timers(459_999);
        assert!(querier.group(GROUP).is_some());
        querier.handle_timers(460_000);
        assert!(querier.group(GROUP).is_none());
    }

    #[test]
    fn test_mode_is_exclude_for_unknown_group() {
        let mut querier = Querier::new(config(), 0);
        querier.handle_message(0, &report(RecordType::ModeIsExclude, GROUP));
        assert!(querier.group(GROUP).is_some());
    }

    #[test]
    fn test_include_records_do_not_create_state() {
        let mut querier = Querier::new(config(), 0);
        querier.handle_message(0, &report(RecordType::ModeIsInclude, GROUP));
        assert!(querier.handle_message(0, &report(RecordType::ChangeToInclude, GROUP)).is_empty());
        assert!(querier.groups().is_empty());
        assert!(!querier.is_leaving(GROUP));
    }

    #[test]
    fn test_leave_sends_last_member_queries() {
        let mut querier = Querier::new(config(), 0);
        querier.handle_timers(0);
        querier.handle_message(1_000, &report(RecordType::ChangeToExclude, GROUP));

        let out = querier.handle_message(2_000, &report(RecordType::ChangeToInclude, GROUP));
        let sent = queries(&out);
        assert_eq!(sent.len(), 1);
        assert_eq!(out[0].destination(), GROUP);
        assert_eq!(sent[0].group_address, GROUP);
        assert_eq!(sent[0].max_resp_code, 10);
        assert!(querier.is_leaving(GROUP));
        assert_eq!(querier.membership_deadline(GROUP), Some(4_000));

        // duplicate leave is ignored
        assert!(querier.handle_message(2_500, &report(RecordType::ChangeToInclude, GROUP)).is_empty());

        let out = querier.handle_timers(3_000);
        assert_eq!(queries(&out).len(), 1);
        assert!(querier.is_leaving(GROUP));

        let out = querier.handle_timers(4_000);
        assert!(out.is_empty());
        assert!(querier.group(GROUP).is_none());
        assert!(!querier.is_leaving(GROUP));
        assert!(querier.handle_message(4_000, &udp(GROUP)).is_empty());
    }

    #[test]
    fn test_report_during_leave_keeps_group() {
        let mut querier = Querier::new(config(), 0);
        querier.handle_timers(0);
        querier.handle_message(0, &report(RecordType::ChangeToExclude, GROUP));
        querier.handle_message(1_000, &report(RecordType::ChangeToInclude, GROUP));

        // another host is still listening
        querier.handle_message(1_500, &report(RecordType::ModeIsExclude, GROUP));
        assert_eq!(querier.membership_deadline(GROUP), Some(261_500));

        let out = querier.handle_timers(2_000);
        let sent = queries(&out);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].suppress_router_processing);

        querier.handle_timers(3_000);
        assert!(!querier.is_leaving(GROUP));
        assert!(querier.group(GROUP).is_some());
    }

    #[test]
    fn test_single_last_member_query() {
        let mut config = config();
        config.last_member_query_count = Some(1);
        let mut querier = Querier::new(config, 0);
        querier.handle_timers(0);
        querier.handle_message(0, &report(RecordType::ChangeToExclude, GROUP));
        assert_eq!(queries(&querier.handle_message(0, &report(RecordType::ChangeToInclude, GROUP))).len(), 1);
        assert!(querier.handle_timers(1_000).is_empty());
        assert!(querier.group(GROUP).is_none());
    }

    #[test]
    fn test_malformed_packets_dropped() {
        let mut querier = Querier::new(config(), 0);
        assert!(querier.handle_message(0, &[0x45, 0, 0]).is_empty());

        let mut data = report(RecordType::ChangeToExclude, GROUP);
        // record count no longer matches the checksum
        data[24 + 7] = 9;
        assert!(querier.handle_message(0, &data).is_empty());
        assert!(querier.group(GROUP).is_none());
    }

    #[test]
    fn test_ignores_non_multicast_records() {
        let mut querier = Querier::new(config(), 0);
        querier.handle_message(0, &report(RecordType::ChangeToExclude, Ipv4Addr::new(10, 1, 1, 1)));
        querier.handle_message(0, &report(RecordType::ChangeToExclude, ALL_SYSTEMS_GROUP));
        assert!(querier.groups().is_empty());
    }
}
