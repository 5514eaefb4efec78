//! Minimal STUN binding (RFC 5389) for server-reflexive discovery.
//!
//! Only what the UDP agent needs: build a Binding Request, recognise STUN
//! traffic on a shared socket, and pull the mapped address out of a Binding
//! Success Response. No authentication attributes are sent or checked.

use crate::error::{ProbeError, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// STUN magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const HEADER_SIZE: usize = 20;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Transaction id
pub type TransactionId = [u8; 12];

/// Encode a Binding Request with a fresh transaction id
#[must_use]
pub fn binding_request() -> (TransactionId, Vec<u8>) {
    let transaction_id: TransactionId = rand::random();
    let mut bytes = Vec::with_capacity(HEADER_SIZE);
    bytes.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    bytes.extend_from_slice(&0u16.to_be_bytes());
    bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    bytes.extend_from_slice(&transaction_id);
    (transaction_id, bytes)
}

/// Encode a Binding Success Response carrying XOR-MAPPED-ADDRESS
#[must_use]
pub fn binding_success(transaction_id: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
    let mut value = vec![0u8, if mapped.is_ipv4() { 0x01 } else { 0x02 }];
    let xor_port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
    value.extend_from_slice(&xor_port.to_be_bytes());
    let key = xor_key(transaction_id);
    match mapped.ip() {
        IpAddr::V4(ip) => value.extend(ip.octets().iter().zip(key.iter()).map(|(a, k)| a ^ k)),
        IpAddr::V6(ip) => value.extend(ip.octets().iter().zip(key.iter()).map(|(a, k)| a ^ k)),
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + 4 + value.len());
    bytes.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    bytes.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    bytes.extend_from_slice(transaction_id);
    bytes.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
    bytes.extend_from_slice(&value);
    bytes
}

/// Whether a datagram looks like STUN (leading zero bits plus magic cookie)
#[must_use]
pub fn is_stun(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_SIZE
        && bytes[0] & 0xC0 == 0
        && u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) == MAGIC_COOKIE
}

/// Transaction id of a STUN message
#[must_use]
pub fn transaction_id(bytes: &[u8]) -> Option<TransactionId> {
    if !is_stun(bytes) {
        return None;
    }
    let mut id = [0u8; 12];
    id.copy_from_slice(&bytes[8..20]);
    Some(id)
}

/// Whether a datagram is a Binding Request
#[must_use]
pub fn is_binding_request(bytes: &[u8]) -> bool {
    is_stun(bytes) && u16::from_be_bytes([bytes[0], bytes[1]]) == BINDING_REQUEST
}

/// Extract the mapped address from a Binding Success Response
///
/// # Errors
///
/// Returns [`ProbeError::Stun`] for non-success responses or a missing
/// address attribute.
pub fn parse_binding_success(bytes: &[u8]) -> Result<(TransactionId, SocketAddr)> {
    let id = transaction_id(bytes).ok_or_else(|| ProbeError::Stun("not a STUN message".into()))?;
    let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(ProbeError::Stun(format!("unexpected message type {msg_type:#06x}")));
    }

    let msg_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let end = (HEADER_SIZE + msg_len).min(bytes.len());
    let mut offset = HEADER_SIZE;
    let mut plain = None;

    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        let attr_len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > end {
            break;
        }
        let value = &bytes[offset..offset + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, Some(&id)) {
                    return Ok((id, addr));
                }
            }
            ATTR_MAPPED_ADDRESS => plain = decode_address(value, None),
            _ => {}
        }
        offset += attr_len + (4 - attr_len % 4) % 4;
    }

    plain
        .map(|addr| (id, addr))
        .ok_or_else(|| ProbeError::Stun("response carries no mapped address".into()))
}

fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn decode_address(value: &[u8], xor_with: Option<&TransactionId>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let key = xor_with.map(xor_key).unwrap_or([0u8; 16]);
    let port_mask = if xor_with.is_some() { (MAGIC_COOKIE >> 16) as u16 } else { 0 };
    let port = u16::from_be_bytes([value[2], value[3]]) ^ port_mask;

    match value[1] {
        0x01 if value.len() >= 8 => {
            let mut octets = [0u8; 4];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}
