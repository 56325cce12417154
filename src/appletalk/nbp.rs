//! NBP (Name Binding Protocol) registry (spec §4.6): up to 16 registered
//! names, glob-style tuple matching, and batched lookup replies.

use super::LLAP_HOST_NODE;
use crate::error::{CoreError, CoreResult};

pub const MAX_ENTRIES: usize = 16;
const MAX_TUPLES_PER_REPLY: usize = 8;

/// Wildcard byte ("≈" in Inside AppleTalk's NBP description): matches zero
/// or more bytes within a field pattern (spec §4.6).
const WILDCARD: u8 = 0xC5;

const FUNC_BR_RQ: u8 = 1;
const FUNC_LOOKUP: u8 = 2;
const FUNC_LOOKUP_REPLY: u8 = 3;
const FUNC_FWD_REQ: u8 = 4;

/// A registered name (spec §4.6).
#[derive(Debug, Clone)]
pub struct Entry {
    pub object: Vec<u8>,
    pub type_: Vec<u8>,
    pub zone: Vec<u8>,
    pub socket: u8,
    pub node: u8,
    pub net: u16,
    pub enumerator: u8,
}

/// Caller-supplied description for [`Registry::register`] (spec §4.6).
#[derive(Debug, Clone)]
pub struct Registration {
    pub object: Vec<u8>,
    pub type_: Vec<u8>,
    pub zone: Option<Vec<u8>>,
    pub socket: u8,
    pub node: Option<u8>,
    pub net: Option<u16>,
}

/// A parsed NBP tuple (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub net: u16,
    pub node: u8,
    pub socket: u8,
    pub enumerator: u8,
    pub object: Vec<u8>,
    pub type_: Vec<u8>,
    pub zone: Vec<u8>,
}

/// A flat, fixed-size table of registered names.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn next_enumerator(&self, socket: u8) -> u8 {
        let used: std::collections::BTreeSet<u8> =
            self.entries.iter().filter(|e| e.socket == socket).map(|e| e.enumerator).collect();
        let mut candidate: u8 = 1;
        while used.contains(&candidate) {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 1;
            }
        }
        candidate
    }

    /// Register a name (spec §4.6). Rejects an empty object or type and
    /// any `(object, type, zone)` collision (case-insensitive).
    pub fn register(&mut self, desc: Registration) -> CoreResult<()> {
        if desc.object.is_empty() || desc.type_.is_empty() {
            return Err(CoreError::invalid_argument("NBP object/type must be non-empty"));
        }
        if desc.socket == 0 {
            return Err(CoreError::invalid_argument("NBP socket must be non-zero"));
        }
        let zone = desc.zone.unwrap_or_else(|| b"*".to_vec());
        if self.entries.iter().any(|e| {
            ascii_eq_fold(&e.object, &desc.object) && ascii_eq_fold(&e.type_, &desc.type_) && ascii_eq_fold(&e.zone, &zone)
        }) {
            return Err(CoreError::invalid_argument("NBP name already registered"));
        }
        if self.entries.len() >= MAX_ENTRIES {
            return Err(CoreError::capacity_exhausted("NBP registry full"));
        }
        let socket = desc.socket;
        let enumerator = self.next_enumerator(socket);
        self.entries.push(Entry {
            object: desc.object,
            type_: desc.type_,
            zone,
            socket,
            node: desc.node.unwrap_or(LLAP_HOST_NODE),
            net: desc.net.unwrap_or(0),
            enumerator,
        });
        Ok(())
    }

    fn matching_entries(&self, tuple: &Tuple) -> Vec<&Entry> {
        self.entries
            .iter()
            .filter(|e| {
                field_matches(&e.object, &tuple.object)
                    && field_matches(&e.type_, &tuple.type_)
                    && zone_matches(&tuple.zone, &e.zone)
            })
            .collect()
    }

    /// Process an inbound NBP packet, returning `(src_socket_unused, reply
    /// payload)` pairs ready to be wrapped in a DDP frame. The caller
    /// supplies the reply destination socket separately (spec routes NBP
    /// replies back to the tuple's requesting socket, which is embedded in
    /// each tuple, not the packet header).
    pub fn handle_packet(&mut self, _src_node: u8, _src_socket: u8, data: &[u8]) -> CoreResult<Vec<(u8, Vec<u8>)>> {
        if data.len() < 2 {
            return Err(CoreError::invalid_argument("NBP packet shorter than header"));
        }
        let function = data[0] >> 4;
        let tuple_count = data[0] & 0x0F;
        let id = data[1];
        let mut cursor = 2usize;
        let mut tuples = Vec::with_capacity(tuple_count as usize);
        for _ in 0..tuple_count {
            let (tuple, consumed) = parse_tuple(&data[cursor..])?;
            cursor += consumed;
            tuples.push(tuple);
        }

        if !matches!(function, FUNC_BR_RQ | FUNC_LOOKUP | FUNC_FWD_REQ) {
            return Ok(Vec::new());
        }

        let mut all_matches: Vec<Tuple> = Vec::new();
        for tuple in &tuples {
            for entry in self.matching_entries(tuple) {
                all_matches.push(Tuple {
                    net: entry.net,
                    node: entry.node,
                    socket: entry.socket,
                    enumerator: entry.enumerator,
                    object: entry.object.clone(),
                    type_: entry.type_.clone(),
                    zone: entry.zone.clone(),
                });
            }
        }

        if all_matches.is_empty() {
            return Ok(Vec::new());
        }

        let reply_socket = tuples.first().map(|t| t.socket).unwrap_or(0);
        let mut replies = Vec::new();
        for batch in all_matches.chunks(MAX_TUPLES_PER_REPLY) {
            let payload = encode_reply(id, batch);
            replies.push((reply_socket, payload));
        }
        Ok(replies)
    }
}

fn ascii_fold_byte(b: u8) -> u8 {
    if b.is_ascii_uppercase() {
        b.to_ascii_lowercase()
    } else {
        b
    }
}

fn ascii_eq_fold(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| ascii_fold_byte(*x) == ascii_fold_byte(*y))
}

/// Match `value` (from an inbound tuple) against `pattern` (a registered
/// field): `"="` matches anything, `0xC5` is a zero-or-more wildcard, other
/// bytes compare case-insensitively (spec §4.6).
fn field_matches(value: &[u8], pattern: &[u8]) -> bool {
    if pattern == b"=" {
        return true;
    }
    glob_match(pattern, value)
}

fn zone_matches(query_zone: &[u8], entry_zone: &[u8]) -> bool {
    if query_zone.is_empty() || query_zone == b"*" {
        return true;
    }
    if entry_zone == b"*" {
        return true;
    }
    field_matches(entry_zone, query_zone)
}

fn glob_match(pattern: &[u8], value: &[u8]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some((&WILDCARD, rest)) => {
            if rest.is_empty() {
                return true;
            }
            for i in 0..=value.len() {
                if glob_match(rest, &value[i..]) {
                    return true;
                }
            }
            false
        }
        Some((&p, rest)) => match value.split_first() {
            Some((&v, vrest)) if ascii_fold_byte(p) == ascii_fold_byte(v) => glob_match(rest, vrest),
            _ => false,
        },
    }
}

fn read_pascal_string(data: &[u8]) -> CoreResult<(Vec<u8>, usize)> {
    let len = *data.first().ok_or_else(|| CoreError::invalid_argument("truncated NBP pascal string"))? as usize;
    let end = 1 + len;
    if data.len() < end {
        return Err(CoreError::invalid_argument("truncated NBP pascal string"));
    }
    Ok((data[1..end].to_vec(), end))
}

fn parse_tuple(data: &[u8]) -> CoreResult<(Tuple, usize)> {
    if data.len() < 5 {
        return Err(CoreError::invalid_argument("truncated NBP tuple"));
    }
    let net = u16::from_be_bytes([data[0], data[1]]);
    let node = data[2];
    let socket = data[3];
    let enumerator = data[4];
    let mut cursor = 5;
    let (object, used) = read_pascal_string(&data[cursor..])?;
    cursor += used;
    let (type_, used) = read_pascal_string(&data[cursor..])?;
    cursor += used;
    let (zone, used) = read_pascal_string(&data[cursor..])?;
    cursor += used;
    Ok((Tuple { net, node, socket, enumerator, object, type_, zone }, cursor))
}

fn encode_pascal_string(out: &mut Vec<u8>, s: &[u8]) {
    out.push(s.len() as u8);
    out.extend_from_slice(s);
}

fn encode_reply(id: u8, tuples: &[Tuple]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push((FUNC_LOOKUP_REPLY << 4) | (tuples.len() as u8 & 0x0F));
    out.push(id);
    for tuple in tuples {
        out.extend_from_slice(&tuple.net.to_be_bytes());
        out.push(tuple.node);
        out.push(tuple.socket);
        out.push(tuple.enumerator);
        encode_pascal_string(&mut out, &tuple.object);
        encode_pascal_string(&mut out, &tuple.type_);
        encode_pascal_string(&mut out, &tuple.zone);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_request(function: u8, id: u8, tuples: &[(u16, u8, u8, u8, &[u8], &[u8], &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push((function << 4) | (tuples.len() as u8 & 0x0F));
        out.push(id);
        for &(net, node, socket, enumerator, object, type_, zone) in tuples {
            out.extend_from_slice(&net.to_be_bytes());
            out.push(node);
            out.push(socket);
            out.push(enumerator);
            encode_pascal_string(&mut out, object);
            encode_pascal_string(&mut out, type_);
            encode_pascal_string(&mut out, zone);
        }
        out
    }

    fn registration(object: &str, type_: &str) -> Registration {
        Registration {
            object: object.as_bytes().to_vec(),
            type_: type_.as_bytes().to_vec(),
            zone: None,
            socket: 4,
            node: None,
            net: None,
        }
    }

    #[test]
    fn register_rejects_empty_object() {
        let mut registry = Registry::new();
        let mut desc = registration("Printer", "LaserWriter");
        desc.object.clear();
        assert!(registry.register(desc).is_err());
    }

    #[test]
    fn register_rejects_duplicate_case_insensitive() {
        let mut registry = Registry::new();
        registry.register(registration("Printer", "LaserWriter")).unwrap();
        let err = registry.register(registration("PRINTER", "laserwriter")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn enumerators_avoid_collision_and_never_zero() {
        let mut registry = Registry::new();
        registry.register(registration("A", "T")).unwrap();
        registry.register(registration("B", "T")).unwrap();
        let enumerators: Vec<u8> = registry.entries.iter().map(|e| e.enumerator).collect();
        assert!(!enumerators.contains(&0));
        assert_eq!(enumerators.len(), 2);
        assert_ne!(enumerators[0], enumerators[1]);
    }

    #[test]
    fn registry_full_reports_capacity_exhausted() {
        let mut registry = Registry::new();
        for i in 0..MAX_ENTRIES {
            registry.register(registration(&format!("obj{i}"), "T")).unwrap();
        }
        let err = registry.register(registration("overflow", "T")).unwrap_err();
        assert!(matches!(err, CoreError::CapacityExhausted(_)));
    }

    #[test]
    fn wildcard_matches_any_length_including_empty() {
        assert!(glob_match(&[WILDCARD], b""));
        assert!(glob_match(&[WILDCARD], b"anything"));
        assert!(glob_match(b"La", &[b'L', b'a']));
        let mut pattern = vec![b'L'];
        pattern.push(WILDCARD);
        pattern.push(b'r');
        assert!(glob_match(&pattern, b"LaserWriter"));
        assert!(!glob_match(&pattern, b"Laser"));
    }

    #[test]
    fn equals_sign_matches_everything() {
        assert!(field_matches(b"anything at all", b"="));
        assert!(field_matches(b"", b"="));
    }

    #[test]
    fn lookup_matches_registered_entry_and_replies_batched() {
        let mut registry = Registry::new();
        for i in 0..10 {
            registry
                .register(Registration {
                    object: format!("Printer{i}").into_bytes(),
                    type_: b"LaserWriter".to_vec(),
                    zone: None,
                    socket: 4,
                    node: None,
                    net: None,
                })
                .unwrap();
        }

        let request = encode_request(FUNC_LOOKUP, 7, &[(0, 0, 99, 0, b"=", b"LaserWriter", b"*")]);
        let replies = registry.handle_packet(10, 99, &request).unwrap();
        let total_tuples: usize = replies
            .iter()
            .map(|(_, payload)| (payload[0] & 0x0F) as usize)
            .sum();
        assert_eq!(total_tuples, 10);
        assert!(replies.iter().all(|(_, payload)| (payload[0] & 0x0F) as usize <= MAX_TUPLES_PER_REPLY));
        assert!(replies.iter().all(|(_, payload)| payload[1] == 7));
    }

    #[test]
    fn zone_star_query_matches_any_entry_zone() {
        let mut registry = Registry::new();
        registry
            .register(Registration {
                object: b"Srv".to_vec(),
                type_: b"AFPServer".to_vec(),
                zone: Some(b"Engineering".to_vec()),
                socket: 8,
                node: None,
                net: None,
            })
            .unwrap();
        let request = encode_request(FUNC_LOOKUP, 1, &[(0, 0, 99, 0, b"=", b"=", b"*")]);
        let replies = registry.handle_packet(10, 99, &request).unwrap();
        assert_eq!(replies.len(), 1);
    }
}
