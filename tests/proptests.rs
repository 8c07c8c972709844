//! Property tests for the wire codec.
//!
//! - Max Resp Code / QQIC encoding never undershoots the requested interval.
//! - Nothing decoded from arbitrary bytes panics, whether the bytes arrive as
//!   a whole datagram or as an IGMP payload behind a valid IPv4 header.

use igmpd::igmp::code::{code_to_millis, millis_to_code, MAX_CODE};
use igmpd::igmp::packet::{IPPROTO_IGMP, ROUTER_ALERT_OPTION};
use igmpd::igmp::{self, Packet};

use proptest::prelude::*;

use std::net::Ipv4Addr;

proptest! {
    #[test]
    fn test_encode_never_undershoots(ms in 0u64..=code_to_millis(MAX_CODE)) {
        let code = millis_to_code(ms);
        prop_assert!(code_to_millis(code) >= ms);
        if code > 0 {
            // smallest code that covers the interval
            prop_assert!(code_to_millis(code - 1) < ms);
        }
    }

    #[test]
    fn test_encode_saturates(ms in code_to_millis(MAX_CODE)..u64::MAX) {
        prop_assert_eq!(millis_to_code(ms), MAX_CODE);
    }

    #[test]
    fn test_code_round_trip(code in any::<u8>()) {
        prop_assert!(code_to_millis(millis_to_code(code_to_millis(code))) >= code_to_millis(code));
    }

    #[test]
    fn test_parse_does_not_panic(input in any::<Vec<u8>>()) {
        if let Ok(packet) = Packet::parse(&input) {
            let _ = igmp::decode(&packet);
        }
    }

    #[test]
    fn test_decode_payload_does_not_panic(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
        let packet = Packet::build(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(224, 0, 0, 22),
            IPPROTO_IGMP,
            1,
            1,
            &ROUTER_ALERT_OPTION,
            &payload,
        ).unwrap();
        let _ = igmp::decode(&packet);
    }
}
