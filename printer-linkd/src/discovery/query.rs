//! Direct multicast DNS address queries.
//!
//! mdns-sd only resolves `.local.` hostnames, so names under other suffixes
//! such as `.home` are asked for with a plain A/AAAA query sent to the mDNS
//! group from an ephemeral port. Responders answer such legacy queries by
//! unicast to the sender.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use tokio::net::UdpSocket;
use crate::error::Result;

pub const MDNS_ADDRESS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

pub fn mdns_group() -> SocketAddr {
    SocketAddr::from((MDNS_ADDRESS, MDNS_PORT))
}

/// Encode an A and AAAA query for `name`
pub fn build_query(name: &Name, id: u16) -> Result<Vec<u8>> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false)
        .add_query(Query::query(name.clone(), RecordType::A))
        .add_query(Query::query(name.clone(), RecordType::AAAA));
    Ok(message.to_vec()?)
}

/// Addresses for `name` carried in a response packet
pub fn parse_answers(packet: &[u8], name: &Name) -> Result<Vec<IpAddr>> {
    let message = Message::from_vec(packet)?;
    if message.message_type() != MessageType::Response {
        return Ok(Vec::new());
    }

    let addresses = message
        .answers()
        .iter()
        .chain(message.additionals())
        .filter(|record| record.name() == name)
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();
    Ok(addresses)
}

/// Ask `target` for the addresses of `fqdn` and return the first non-empty
/// answer. Runs until an answer arrives; callers bound it with a timeout.
pub async fn query_addresses(fqdn: &str, target: SocketAddr) -> Result<Vec<IpAddr>> {
    let name = Name::from_ascii(fqdn)?;
    let bind = if target.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    let id = socket.local_addr()?.port();
    socket.send_to(&build_query(&name, id)?, target).await?;
    tracing::debug!("Sent multicast address query for {} to {}", fqdn, target);

    let mut buffer = [0u8; 1500];
    loop {
        let (size, from) = socket.recv_from(&mut buffer).await?;
        match parse_answers(&buffer[..size], &name) {
            Ok(addresses) if !addresses.is_empty() => {
                tracing::debug!("{} answered for {}: {:?}", from, fqdn, addresses);
                return Ok(addresses);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Ignoring malformed mDNS packet from {}: {}", from, e),
        }
    }
}
