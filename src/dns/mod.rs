// DNS plumbing shared by client and server
//
// Messages, records and EDNS0 come from hickory-proto. Tunnel names carry
// Base128 and Raw text that is not valid UTF-8, so names are handled as
// dotted octet strings here and converted to hickory names label by label.

pub mod name;

pub use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
pub use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NULL, SRV, TXT};
pub use hickory_proto::rr::{Name, RData, Record, RecordType};
pub use name::{dotify, undotify, MAX_LABEL_LEN, MAX_NAME_LEN};

use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

use crate::error::Result;

/// UDP payload size advertised when EDNS0 is in use
pub const EDNS0_PAYLOAD_SIZE: u16 = 4096;

/// Classic DNS over UDP message ceiling
pub const MAX_UDP_SIZE: usize = 512;

/// Private-use record type carrying opaque tunnel data
pub const PRIVATE_TYPE: RecordType = RecordType::Unknown(0xFFA0);

/// Convert a dotted octet string into a fully qualified name
pub fn to_name(name: &[u8]) -> Result<Name> {
    let name = name.strip_suffix(b".").unwrap_or(name);
    if name.is_empty() {
        return Ok(Name::root());
    }
    Ok(Name::from_labels(name.split(|&c| c == b'.'))?)
}

/// Raw labels of `name` joined with `.`, without the root
pub fn name_bytes(name: &Name) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len());
    for label in name.iter() {
        if !out.is_empty() {
            out.push(b'.');
        }
        out.extend_from_slice(label);
    }
    out
}

/// Recursive query carrying one question per name
pub fn build_query(id: u16, names: Vec<Name>, qtype: RecordType) -> Message {
    let mut query = Message::new();
    query
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    for name in names {
        query.add_query(Query::query(name, qtype));
    }
    query
}

/// Empty response echoing the query's id, questions and EDNS0 record
pub fn response_to(query: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true);
    for question in query.queries() {
        response.add_query(question.clone());
    }
    if let Some(edns) = query.extensions() {
        response.set_edns(edns.clone());
    }
    response
}

/// Advertise `payload_size` octets through an OPT record
pub fn set_edns0(message: &mut Message, payload_size: u16) {
    let mut edns = Edns::new();
    edns.set_max_payload(payload_size);
    message.set_edns(edns);
}

/// Largest response the sender of `query` accepts over UDP
pub fn udp_limit(query: &Message) -> usize {
    query
        .extensions()
        .as_ref()
        .map_or(MAX_UDP_SIZE, |edns| (edns.max_payload() as usize).max(MAX_UDP_SIZE))
}

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(message.to_bytes()?)
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
    Ok(Message::from_bytes(bytes)?)
}

/// Serialize for a UDP path carrying at most `limit` octets. Oversized
/// responses lose their answers and get the TC bit, as a server would send
/// them.
pub fn encode_within(message: &Message, limit: usize) -> Result<Vec<u8>> {
    let bytes = encode(message)?;
    if bytes.len() <= limit {
        return Ok(bytes);
    }
    let mut truncated = message.clone();
    truncated.take_answers();
    truncated.set_truncated(true);
    encode(&truncated)
}
