
use igmpd::igmp::socket::RawIgmpSocket;
use igmpd::igmp::{self, IgmpMessage, Packet, ALL_IGMPV3_ROUTERS_GROUP};

use std::net::Ipv4Addr;

fn main() -> std::io::Result<()> {
    env_logger::init();
    let socket = RawIgmpSocket::new()?;
    socket.set_multicast_all(true)?;
    socket.join_multicast(ALL_IGMPV3_ROUTERS_GROUP, Ipv4Addr::UNSPECIFIED)?;

    let mut buf = vec![0u8; 65536];
    loop {
        let len = socket.recv(&mut buf)?;
        let packet = match Packet::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                println!("<malformed IPv4 packet: {}>", e);
                continue;
            }
        };

        print!("{} -> {} (ttl: {}, router alert: {})", packet.source(), packet.destination(), packet.ttl(), packet.has_router_alert());

        match igmp::decode(&packet) {
            Ok(IgmpMessage::Query(query)) => {
                print!(" {:?}", query);
            }

            Ok(IgmpMessage::Report(report)) => {
                print!(" {:?}", report);
            }

            Ok(parsed) => {
                print!(" {:?}", parsed);
            }

            Err(e) => {
                print!(" IGMP <err: {}>", e);
            }
        }
        println!();
    }
}
