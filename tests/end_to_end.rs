//! A querier and a responder sharing one simulated link.

use igmpd::config::{QuerierConfig, ResponderConfig};
use igmpd::igmp::code::{code_to_millis, millis_to_code};
use igmpd::igmp::packet::IPPROTO_UDP;
use igmpd::igmp::{self, GroupRecord, IgmpMessage, MembershipQuery, MembershipReport, Packet, RecordType, ALL_SYSTEMS_GROUP};
use igmpd::querier::Querier;
use igmpd::responder::{Responder, ResponderError};
use igmpd::timer::Millis;

use rand::rngs::StdRng;
use rand::SeedableRng;

use std::net::Ipv4Addr;

const ROUTER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);

struct Link {
    querier: Querier,
    responder: Responder,
    now: Millis,
    /// drop everything the responder sends
    responder_muted: bool,
    querier_sent: Vec<(Millis, Packet)>,
    responder_sent: Vec<(Millis, Packet)>,
}

impl Link {
    fn new(querier: Querier, responder: Responder, now: Millis) -> Self {
        Self {
            querier,
            responder,
            now,
            responder_muted: false,
            querier_sent: Vec::new(),
            responder_sent: Vec::new(),
        }
    }

    fn from_querier(&mut self, packets: Vec<Packet>) {
        for packet in packets {
            let out = self.responder.handle_message(self.now, packet.data());
            assert!(out.is_empty());
            self.querier_sent.push((self.now, packet));
        }
    }

    fn from_responder(&mut self, packets: Vec<Packet>) {
        if self.responder_muted {
            return;
        }
        for packet in packets {
            let out = self.querier.handle_message(self.now, packet.data());
            self.responder_sent.push((self.now, packet));
            self.from_querier(out);
        }
    }

    /// Fires every timer of both engines up to and including `until`.
    fn run_until(&mut self, until: Millis) {
        loop {
            let next = [self.querier.next_deadline(), self.responder.next_deadline()]
                .into_iter()
                .flatten()
                .min();
            match next {
                Some(deadline) if deadline <= until => {
                    self.now = self.now.max(deadline);
                    let out = self.querier.handle_timers(self.now);
                    self.from_querier(out);
                    let out = self.responder.handle_timers(self.now);
                    self.from_responder(out);
                }
                _ => break,
            }
        }
        self.now = until;
    }

    fn join(&mut self, group: Ipv4Addr) {
        let out = self.responder.join(self.now, group).unwrap();
        self.from_responder(out);
    }

    fn leave(&mut self, group: Ipv4Addr) {
        let out = self.responder.leave(self.now, group).unwrap();
        self.from_responder(out);
    }
}

fn responder() -> Responder {
    Responder::new(ResponderConfig::new(HOST), StdRng::seed_from_u64(42))
}

fn reports(sent: &[(Millis, Packet)]) -> Vec<(Millis, MembershipReport)> {
    sent.iter()
        .filter_map(|(at, packet)| match igmp::decode(packet) {
            Ok(IgmpMessage::Report(report)) => Some((*at, report)),
            _ => None,
        })
        .collect()
}

fn queries(sent: &[(Millis, Packet)]) -> Vec<(Millis, MembershipQuery)> {
    sent.iter()
        .filter_map(|(at, packet)| match igmp::decode(packet) {
            Ok(IgmpMessage::Query(query)) => Some((*at, query)),
            _ => None,
        })
        .collect()
}

#[test]
fn general_query_gets_one_report_and_creates_group() {
    // the responder joined before the querier came up
    let mut responder = responder();
    responder.join(0, GROUP).unwrap();
    while let Some(deadline) = responder.next_deadline() {
        responder.handle_timers(deadline);
    }

    let querier = Querier::new(QuerierConfig::new(ROUTER), 10_000);
    let mut link = Link::new(querier, responder, 10_000);
    link.run_until(10_000);

    assert_eq!(link.querier_sent.len(), 1);
    assert_eq!(link.querier_sent[0].1.destination(), ALL_SYSTEMS_GROUP);
    let (_, query) = &queries(&link.querier_sent)[0];
    assert!(query.is_general());
    assert_eq!(query.max_resp_code, millis_to_code(10_000));

    link.run_until(10_000 + code_to_millis(query.max_resp_code));

    let sent = reports(&link.responder_sent);
    assert_eq!(sent.len(), 1);
    let (at, report) = &sent[0];
    assert!((10_000..=20_000).contains(at));
    assert_eq!(report.records, vec![GroupRecord::new(RecordType::ModeIsExclude, GROUP)]);

    let state = link.querier.group(GROUP).unwrap();
    assert_eq!(state.group_addr, GROUP);
    assert_eq!(link.querier.membership_deadline(GROUP), Some(at + 260_000));
}

#[test]
fn udp_before_any_report_is_dropped() {
    let mut querier = Querier::new(QuerierConfig::new(ROUTER), 0);
    querier.handle_timers(0);
    let udp = Packet::build(HOST, GROUP, IPPROTO_UDP, 16, 1, &[], &[1, 2, 3, 4]).unwrap();
    assert!(querier.handle_message(0, udp.data()).is_empty());
}

#[test]
fn membership_survives_while_reports_keep_coming() {
    let mut link = Link::new(Querier::new(QuerierConfig::new(ROUTER), 0), responder(), 0);
    link.join(GROUP);

    let mut t = 0;
    while t < 1_000_000 {
        t += 10_000;
        link.run_until(t);
        assert!(link.querier.group(GROUP).is_some(), "group lost at {}", t);
    }

    link.responder_muted = true;
    let last_report = reports(&link.responder_sent).last().map(|(at, _)| *at).unwrap();
    let expiry = last_report + 260_000;
    assert_eq!(link.querier.membership_deadline(GROUP), Some(expiry));

    link.run_until(expiry - 1);
    assert!(link.querier.group(GROUP).is_some());
    link.run_until(expiry);
    assert!(link.querier.group(GROUP).is_none());
}

#[test]
fn leave_is_confirmed_with_last_member_queries() {
    let mut link = Link::new(Querier::new(QuerierConfig::new(ROUTER), 0), responder(), 0);
    link.join(GROUP);
    link.run_until(20_000);
    assert!(link.querier.group(GROUP).is_some());

    link.leave(GROUP);
    assert!(link.querier.is_leaving(GROUP));
    link.run_until(30_000);

    let group_queries: Vec<_> = queries(&link.querier_sent)
        .into_iter()
        .filter(|(_, query)| query.group_address == GROUP)
        .collect();
    assert_eq!(group_queries.len(), 2);
    assert_eq!(group_queries[0].0, 20_000);
    assert_eq!(group_queries[1].0, 21_000);
    assert!(link.querier.group(GROUP).is_none());
    assert!(!link.querier.is_leaving(GROUP));

    // nothing answered the group-specific queries
    assert!(reports(&link.responder_sent)
        .iter()
        .all(|(at, report)| *at < 20_000 || report.records.iter().all(|r| r.record_type == RecordType::ChangeToInclude)));
}

#[test]
fn quick_leave_is_not_reported_to_general_queries() {
    let mut link = Link::new(Querier::new(QuerierConfig::new(ROUTER), 0), responder(), 0);
    link.join(GROUP);
    link.now = 10;
    link.leave(GROUP);
    assert!(link.responder.is_leaving(GROUP));

    link.run_until(200_000);
    assert!(!link.responder.is_leaving(GROUP));
    for (_, report) in reports(&link.responder_sent) {
        assert!(!report.records.contains(&GroupRecord::new(RecordType::ModeIsExclude, GROUP)));
    }
    assert!(link.querier.group(GROUP).is_none());
}

#[test]
fn second_join_is_rejected() {
    let mut link = Link::new(Querier::new(QuerierConfig::new(ROUTER), 0), responder(), 0);
    link.join(GROUP);
    assert_eq!(link.responder.join(5, GROUP), Err(ResponderError::AlreadyMember(GROUP)));
    assert_eq!(link.responder.members().collect::<Vec<_>>(), vec![GROUP]);
}
