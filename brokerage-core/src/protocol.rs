// brokerage-core/src/protocol.rs

//! Wire protocol between brokerage clients and the coordinator.
//!
//! Three message kinds govern registration and discovery. Each message is a
//! fixed-layout header, optionally followed by a variable-size payload. All
//! integers are little-endian fixed-width; the kind tag is the first byte of
//! every header.
//!
//! ```text
//! RequestWorkerList  header: [kind u8][protocol_version u32][platform u8]
//! WorkerList         header: [kind u8]
//!                    payload: [count u32][count x address u32]
//! SetWorkerStatus    header: [kind u8][available u8][protocol_version u32][platform u8]
//! ```

use std::net::Ipv4Addr;

use crate::error::{BrokerageError, Result};

/// Well-known coordinator listen port.
pub const COORDINATOR_PORT: u16 = 31392;

/// Protocol major version. Carried in every registration and query and used
/// as a strict compatibility filter; also embedded in the folder-transport
/// path so incompatible peers never see each other.
pub const PROTOCOL_VERSION_MAJOR: u32 = 22;

/// Message kind tags.
pub const MSG_REQUEST_WORKER_LIST: u8 = 1;
pub const MSG_WORKER_LIST: u8 = 2;
pub const MSG_SET_WORKER_STATUS: u8 = 3;

/// OS family tag used for strict matchmaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Platform {
    Windows = 0,
    MacOs = 1,
    Linux = 2,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        #[cfg(target_os = "windows")]
        {
            Platform::Windows
        }
        #[cfg(target_os = "macos")]
        {
            Platform::MacOs
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            Platform::Linux
        }
    }

    /// Directory name component used by the folder transport.
    pub fn os_tag(self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::MacOs => "osx",
            Platform::Linux => "linux",
        }
    }

    pub fn as_wire(self) -> u8 {
        self as u8
    }
}

/// Converts an IPv4 address to its wire representation.
///
/// The wire value preserves octet order under little-endian encoding, so
/// `10.0.0.5` becomes `0x0500_000A` and serializes as the bytes
/// `0A 00 00 05`.
pub fn ipv4_to_wire(ip: Ipv4Addr) -> u32 {
    u32::from_le_bytes(ip.octets())
}

/// Converts a wire address back to an IPv4 address.
pub fn wire_to_ipv4(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(addr.to_le_bytes())
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client asks the coordinator for workers matching its version/platform.
    RequestWorkerList {
        protocol_version: u32,
        platform: u8,
    },
    /// Coordinator's reply: wire addresses of matching workers.
    WorkerList {
        workers: Vec<u32>,
    },
    /// Worker advertises or withdraws its availability.
    SetWorkerStatus {
        available: bool,
        protocol_version: u32,
        platform: u8,
    },
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Message::RequestWorkerList { .. } => MSG_REQUEST_WORKER_LIST,
            Message::WorkerList { .. } => MSG_WORKER_LIST,
            Message::SetWorkerStatus { .. } => MSG_SET_WORKER_STATUS,
        }
    }

    /// Whether a payload frame follows the header frame for this kind.
    pub fn kind_has_payload(kind: u8) -> Result<bool> {
        match kind {
            MSG_REQUEST_WORKER_LIST | MSG_SET_WORKER_STATUS => Ok(false),
            MSG_WORKER_LIST => Ok(true),
            other => Err(BrokerageError::protocol(format!(
                "unknown message kind {other}"
            ))),
        }
    }

    /// Encodes the fixed-layout header.
    pub fn encode_header(&self) -> Vec<u8> {
        match self {
            Message::RequestWorkerList {
                protocol_version,
                platform,
            } => {
                let mut bytes = Vec::with_capacity(6);
                bytes.push(MSG_REQUEST_WORKER_LIST);
                bytes.extend_from_slice(&protocol_version.to_le_bytes());
                bytes.push(*platform);
                bytes
            }
            Message::WorkerList { .. } => vec![MSG_WORKER_LIST],
            Message::SetWorkerStatus {
                available,
                protocol_version,
                platform,
            } => {
                let mut bytes = Vec::with_capacity(7);
                bytes.push(MSG_SET_WORKER_STATUS);
                bytes.push(u8::from(*available));
                bytes.extend_from_slice(&protocol_version.to_le_bytes());
                bytes.push(*platform);
                bytes
            }
        }
    }

    /// Encodes the payload frame, if this kind carries one.
    pub fn encode_payload(&self) -> Option<Vec<u8>> {
        match self {
            Message::WorkerList { workers } => {
                let mut bytes = Vec::with_capacity(4 + workers.len() * 4);
                bytes.extend_from_slice(&(workers.len() as u32).to_le_bytes());
                for worker in workers {
                    bytes.extend_from_slice(&worker.to_le_bytes());
                }
                Some(bytes)
            }
            _ => None,
        }
    }

    /// Decodes a message from its header frame and optional payload frame.
    pub fn decode(header: &[u8], payload: Option<&[u8]>) -> Result<Self> {
        let kind = *header
            .first()
            .ok_or_else(|| BrokerageError::protocol("empty message header"))?;

        match kind {
            MSG_REQUEST_WORKER_LIST => {
                if header.len() != 6 {
                    return Err(BrokerageError::protocol(format!(
                        "bad RequestWorkerList header length {}",
                        header.len()
                    )));
                }
                let protocol_version =
                    u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
                Ok(Message::RequestWorkerList {
                    protocol_version,
                    platform: header[5],
                })
            }
            MSG_WORKER_LIST => {
                if header.len() != 1 {
                    return Err(BrokerageError::protocol(format!(
                        "bad WorkerList header length {}",
                        header.len()
                    )));
                }
                let payload = payload
                    .ok_or_else(|| BrokerageError::protocol("WorkerList missing payload"))?;
                Ok(Message::WorkerList {
                    workers: decode_worker_list_payload(payload)?,
                })
            }
            MSG_SET_WORKER_STATUS => {
                if header.len() != 7 {
                    return Err(BrokerageError::protocol(format!(
                        "bad SetWorkerStatus header length {}",
                        header.len()
                    )));
                }
                let protocol_version =
                    u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
                Ok(Message::SetWorkerStatus {
                    available: header[1] != 0,
                    protocol_version,
                    platform: header[6],
                })
            }
            other => Err(BrokerageError::protocol(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

fn decode_worker_list_payload(payload: &[u8]) -> Result<Vec<u32>> {
    if payload.len() < 4 {
        return Err(BrokerageError::protocol(format!(
            "WorkerList payload too short ({} bytes)",
            payload.len()
        )));
    }

    let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let expected = 4 + count * 4;
    if payload.len() != expected {
        return Err(BrokerageError::protocol(format!(
            "WorkerList payload length {} does not match count {count}",
            payload.len()
        )));
    }

    let mut workers = Vec::with_capacity(count);
    for chunk in payload[4..].chunks_exact(4) {
        workers.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(workers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_wire_order() {
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        assert_eq!(ipv4_to_wire(ip), 0x0500_000A);
        assert_eq!(wire_to_ipv4(0x0500_000A), ip);

        let localhost: Ipv4Addr = "127.0.0.1".parse().unwrap();
        assert_eq!(ipv4_to_wire(localhost), 0x0100_007F);
        assert_eq!(wire_to_ipv4(ipv4_to_wire(localhost)), localhost);
    }

    #[test]
    fn test_request_worker_list_roundtrip() {
        let msg = Message::RequestWorkerList {
            protocol_version: 42,
            platform: 1,
        };
        let header = msg.encode_header();
        assert_eq!(header, vec![MSG_REQUEST_WORKER_LIST, 42, 0, 0, 0, 1]);
        assert!(msg.encode_payload().is_none());

        let decoded = Message::decode(&header, None).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_set_worker_status_roundtrip() {
        let msg = Message::SetWorkerStatus {
            available: true,
            protocol_version: 42,
            platform: 2,
        };
        let header = msg.encode_header();
        assert_eq!(header, vec![MSG_SET_WORKER_STATUS, 1, 42, 0, 0, 0, 2]);
        assert_eq!(Message::decode(&header, None).unwrap(), msg);

        let withdraw = Message::SetWorkerStatus {
            available: false,
            protocol_version: 0,
            platform: 0,
        };
        let header = withdraw.encode_header();
        assert_eq!(Message::decode(&header, None).unwrap(), withdraw);
    }

    #[test]
    fn test_worker_list_payload_bytes() {
        // Two workers at 10.0.0.5 and 10.0.0.6.
        let msg = Message::WorkerList {
            workers: vec![0x0500_000A, 0x0600_000A],
        };
        assert_eq!(msg.encode_header(), vec![MSG_WORKER_LIST]);

        let payload = msg.encode_payload().unwrap();
        assert_eq!(
            payload,
            vec![
                2, 0, 0, 0, // count
                0x0A, 0x00, 0x00, 0x05, // 10.0.0.5
                0x0A, 0x00, 0x00, 0x06, // 10.0.0.6
            ]
        );

        let decoded = Message::decode(&[MSG_WORKER_LIST], Some(&payload)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_empty_worker_list() {
        let msg = Message::WorkerList { workers: vec![] };
        let payload = msg.encode_payload().unwrap();
        assert_eq!(payload, vec![0, 0, 0, 0]);
        assert_eq!(Message::decode(&[MSG_WORKER_LIST], Some(&payload)).unwrap(), msg);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Message::decode(&[0xAA, 0, 0], None).unwrap_err();
        assert!(matches!(err, BrokerageError::Protocol { .. }));
        assert!(Message::kind_has_payload(0xAA).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        // count says 2 but only one address follows
        let payload = vec![2, 0, 0, 0, 0x0A, 0x00, 0x00, 0x05];
        let err = Message::decode(&[MSG_WORKER_LIST], Some(&payload)).unwrap_err();
        assert!(matches!(err, BrokerageError::Protocol { .. }));
    }

    #[test]
    fn test_bad_header_length_rejected() {
        let err = Message::decode(&[MSG_REQUEST_WORKER_LIST, 42], None).unwrap_err();
        assert!(matches!(err, BrokerageError::Protocol { .. }));
    }
}
