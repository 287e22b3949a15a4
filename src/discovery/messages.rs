//! UDP discovery messages: `KAD_PING`, `KAD_PONG`, `KAD_FIND_NODE`, `KAD_NEIGHBORS`.
//!
//! One message per datagram; datagrams outside `[MIN_PACKET_SIZE,
//! MAX_PACKET_SIZE]` are dropped silently by the caller before reaching this
//! module's decoder.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::identity::{Node, NodeId, NODE_ID_LEN};
use crate::wire::{CodecError, CodecResult, Reader, Serializer, Writer};

use super::error::{DiscoveryError, DiscoveryResult};

pub const MIN_PACKET_SIZE: usize = 2;
pub const MAX_PACKET_SIZE: usize = 2047;

pub const MAX_NEIGHBORS: usize = 16;

pub mod message_code {
    pub const KAD_PING: u8 = 1;
    pub const KAD_PONG: u8 = 2;
    pub const KAD_FIND_NODE: u8 = 3;
    pub const KAD_NEIGHBORS: u8 = 4;
}

/// `string id? || string ipv4? || string ipv6? || i32 port || i8 network_id || i16 network_version`.
impl Serializer for Node {
    fn read(reader: &mut Reader) -> CodecResult<Self> {
        let id = match reader.read_optional_string()? {
            Some(hex_id) => {
                let bytes = hex::decode(&hex_id).map_err(|_| CodecError::InvalidValue)?;
                Some(NodeId::from_slice(&bytes).map_err(|_| CodecError::InvalidValue)?)
            }
            None => None,
        };
        let ipv4 = match reader.read_optional_string()? {
            Some(s) => Some(s.parse::<Ipv4Addr>().map_err(|_| CodecError::InvalidValue)?),
            None => None,
        };
        let ipv6 = match reader.read_optional_string()? {
            Some(s) => Some(s.parse::<Ipv6Addr>().map_err(|_| CodecError::InvalidValue)?),
            None => None,
        };
        let port = reader.read_i32()?;
        if !(0..=u16::MAX as i32).contains(&port) {
            return Err(CodecError::InvalidValue);
        }
        let network_id = reader.read_u8()?;
        let network_version = reader.read_i16()?;

        Node::new(id, ipv4, ipv6, port as u16, network_id, network_version)
            .map_err(|_| CodecError::InvalidValue)
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_optional_string(self.id.map(|id| id.to_string()).as_deref());
        writer.write_optional_string(self.ipv4.map(|ip| ip.to_string()).as_deref());
        writer.write_optional_string(self.ipv6.map(|ip| ip.to_string()).as_deref());
        writer.write_i32(self.port as i32);
        writer.write_u8(self.network_id);
        writer.write_i16(self.network_version);
    }

    fn size(&self) -> usize {
        let id_len = self.id.map(|_| 4 + NODE_ID_LEN * 2).unwrap_or(4);
        let ipv4_len = self.ipv4.map(|ip| 4 + ip.to_string().len()).unwrap_or(4);
        let ipv6_len = self.ipv6.map(|ip| 4 + ip.to_string().len()).unwrap_or(4);
        id_len + ipv4_len + ipv6_len + 4 + 1 + 2
    }
}

#[derive(Debug, Clone)]
pub struct KadPing {
    pub from_node: Node,
    pub to_node: Node,
    pub network_id: u8,
    pub network_version: i16,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct KadPong {
    pub network_id: u8,
    pub network_version: i16,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct KadFindNode {
    pub from_node: Node,
    pub target_id: NodeId,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct KadNeighbors {
    pub from_node: Node,
    pub neighbors: Vec<Node>,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub enum DiscoveryMessage {
    Ping(KadPing),
    Pong(KadPong),
    FindNode(KadFindNode),
    Neighbors(KadNeighbors),
}

impl DiscoveryMessage {
    pub fn code(&self) -> u8 {
        match self {
            DiscoveryMessage::Ping(_) => message_code::KAD_PING,
            DiscoveryMessage::Pong(_) => message_code::KAD_PONG,
            DiscoveryMessage::FindNode(_) => message_code::KAD_FIND_NODE,
            DiscoveryMessage::Neighbors(_) => message_code::KAD_NEIGHBORS,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.code()];
        let mut writer = Writer::new(&mut bytes);
        match self {
            DiscoveryMessage::Ping(ping) => {
                ping.from_node.write(&mut writer);
                ping.to_node.write(&mut writer);
                writer.write_u8(ping.network_id);
                writer.write_i16(ping.network_version);
                writer.write_i64(ping.timestamp);
            }
            DiscoveryMessage::Pong(pong) => {
                writer.write_u8(pong.network_id);
                writer.write_i16(pong.network_version);
                writer.write_i64(pong.timestamp);
            }
            DiscoveryMessage::FindNode(find_node) => {
                find_node.from_node.write(&mut writer);
                writer.write_bytes(find_node.target_id.as_bytes());
                writer.write_i64(find_node.timestamp);
            }
            DiscoveryMessage::Neighbors(neighbors) => {
                neighbors.from_node.write(&mut writer);
                writer.write_u8(neighbors.neighbors.len() as u8);
                for node in &neighbors.neighbors {
                    node.write(&mut writer);
                }
                writer.write_i64(neighbors.timestamp);
            }
        }
        bytes
    }

    pub fn decode(datagram: &[u8]) -> DiscoveryResult<Self> {
        if datagram.len() < MIN_PACKET_SIZE || datagram.len() > MAX_PACKET_SIZE {
            return Err(DiscoveryError::InvalidPacketSize(
                MIN_PACKET_SIZE,
                datagram.len(),
            ));
        }
        let code = datagram[0];
        let mut reader = Reader::new(&datagram[1..]);

        let message = match code {
            message_code::KAD_PING => {
                let from_node = Node::read(&mut reader)?;
                let to_node = Node::read(&mut reader)?;
                let network_id = reader.read_u8()?;
                let network_version = reader.read_i16()?;
                let timestamp = reader.read_i64()?;
                DiscoveryMessage::Ping(KadPing {
                    from_node,
                    to_node,
                    network_id,
                    network_version,
                    timestamp,
                })
            }
            message_code::KAD_PONG => {
                let network_id = reader.read_u8()?;
                let network_version = reader.read_i16()?;
                let timestamp = reader.read_i64()?;
                DiscoveryMessage::Pong(KadPong {
                    network_id,
                    network_version,
                    timestamp,
                })
            }
            message_code::KAD_FIND_NODE => {
                let from_node = Node::read(&mut reader)?;
                let target_bytes = reader.read_bytes(NODE_ID_LEN)?;
                let target_id = NodeId::from_slice(target_bytes)?;
                let timestamp = reader.read_i64()?;
                DiscoveryMessage::FindNode(KadFindNode {
                    from_node,
                    target_id,
                    timestamp,
                })
            }
            message_code::KAD_NEIGHBORS => {
                let from_node = Node::read(&mut reader)?;
                let count = reader.read_u8()? as usize;
                if count > MAX_NEIGHBORS {
                    return Err(DiscoveryError::InvalidPacketSize(0, count));
                }
                let mut neighbors = Vec::with_capacity(count);
                for _ in 0..count {
                    neighbors.push(Node::read(&mut reader)?);
                }
                let timestamp = reader.read_i64()?;
                DiscoveryMessage::Neighbors(KadNeighbors {
                    from_node,
                    neighbors,
                    timestamp,
                })
            }
            other => return Err(DiscoveryError::InvalidMessageType(other)),
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id_byte: u8, port: u16) -> Node {
        let mut id = [0u8; NODE_ID_LEN];
        id[0] = id_byte;
        Node::new(
            Some(NodeId::new(id)),
            Some(Ipv4Addr::new(127, 0, 0, 1)),
            None,
            port,
            1,
            1,
        )
        .unwrap()
    }

    #[test]
    fn ping_roundtrip() {
        let msg = DiscoveryMessage::Ping(KadPing {
            from_node: node(1, 30301),
            to_node: node(2, 30302),
            network_id: 1,
            network_version: 7,
            timestamp: 123456,
        });
        let bytes = msg.encode();
        let decoded = DiscoveryMessage::decode(&bytes).unwrap();
        match decoded {
            DiscoveryMessage::Ping(ping) => {
                assert_eq!(ping.from_node, node(1, 30301));
                assert_eq!(ping.to_node, node(2, 30302));
                assert_eq!(ping.network_id, 1);
                assert_eq!(ping.network_version, 7);
                assert_eq!(ping.timestamp, 123456);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn pong_roundtrip() {
        let msg = DiscoveryMessage::Pong(KadPong {
            network_id: 2,
            network_version: 1,
            timestamp: 42,
        });
        let bytes = msg.encode();
        let decoded = DiscoveryMessage::decode(&bytes).unwrap();
        assert!(matches!(decoded, DiscoveryMessage::Pong(_)));
    }

    #[test]
    fn find_node_roundtrip() {
        let target = NodeId::new([9u8; NODE_ID_LEN]);
        let msg = DiscoveryMessage::FindNode(KadFindNode {
            from_node: node(1, 30301),
            target_id: target,
            timestamp: 7,
        });
        let bytes = msg.encode();
        let decoded = DiscoveryMessage::decode(&bytes).unwrap();
        match decoded {
            DiscoveryMessage::FindNode(find_node) => assert_eq!(find_node.target_id, target),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn neighbors_roundtrip_dual_stack_and_no_id() {
        let mut dual_stack = node(3, 30303);
        dual_stack.ipv6 = Some(Ipv6Addr::LOCALHOST);
        let no_id = Node::new(None, Some(Ipv4Addr::new(1, 2, 3, 4)), None, 40000, 1, 1).unwrap();

        let msg = DiscoveryMessage::Neighbors(KadNeighbors {
            from_node: node(1, 30301),
            neighbors: vec![node(2, 30302), dual_stack.clone(), no_id.clone()],
            timestamp: 99,
        });
        let bytes = msg.encode();
        let decoded = DiscoveryMessage::decode(&bytes).unwrap();
        match decoded {
            DiscoveryMessage::Neighbors(neighbors) => {
                assert_eq!(neighbors.neighbors.len(), 3);
                assert_eq!(neighbors.neighbors[1], dual_stack);
                assert_eq!(neighbors.neighbors[2], no_id);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn neighbors_over_max_is_rejected() {
        let mut reader_bytes = vec![message_code::KAD_NEIGHBORS];
        let mut writer = Writer::new(&mut reader_bytes);
        node(1, 30301).write(&mut writer);
        writer.write_u8((MAX_NEIGHBORS + 1) as u8);
        let err = DiscoveryMessage::decode(&reader_bytes).unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidPacketSize(_, _)));
    }

    #[test]
    fn packet_size_boundaries() {
        // Below MIN_PACKET_SIZE.
        assert!(DiscoveryMessage::decode(&[0u8; 1]).is_err());
        // Above MAX_PACKET_SIZE.
        assert!(DiscoveryMessage::decode(&vec![0u8; MAX_PACKET_SIZE + 1]).is_err());
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let err = DiscoveryMessage::decode(&[0xEE, 0x00]).unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidMessageType(0xEE)));
    }
}
