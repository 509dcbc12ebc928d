//! On-disk node frames.
//!
//! Every node is written exactly once as a self-describing frame:
//!
//! ```text
//! [tag: u8][payload length: u32 BE][payload][crc32: u32 BE]
//! ```
//!
//! The checksum covers tag, length, and payload. Leaf and branch payloads are
//! bincode-encoded entry lists; value payloads are the raw encoded value
//! bytes; tombstones have an empty payload. Header frames carry the commit
//! record and are written at block-aligned offsets so recovery can scan the
//! file tail backwards at fixed strides.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::encoding;
use crate::error::{Error, Result};
use crate::store::Store;

/// Alignment stride for header frames.
pub const BLOCK_SIZE: u64 = 1024;

/// Marks a committed header frame.
pub const MAGIC: u32 = 0x454d_4252;

const TAG_VALUE: u8 = 1;
const TAG_LEAF: u8 = 2;
const TAG_BRANCH: u8 = 3;
const TAG_DELETED: u8 = 4;
const TAG_HEADER: u8 = 5;

const PREFIX_LEN: usize = 5; // tag + payload length
const CRC_LEN: usize = 4;
const HEADER_PAYLOAD_LEN: usize = 28; // magic + root + size + dirt
const HEADER_FRAME_LEN: usize = PREFIX_LEN + HEADER_PAYLOAD_LEN + CRC_LEN;

/// Upper bound on a single node payload, to reject garbage lengths before
/// allocating.
const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The commit record. A tree is durable once a header referencing its root
/// has been written after a sync of all prior appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub root: u64,
    pub size: u64,
    pub dirt: u64,
}

/// An entry in a leaf or branch: the encoded key (for branches, the smallest
/// key of the subtree) and the child frame offset.
pub type Entry = (Vec<u8>, u64);

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Encoded value bytes, stored out of line from the leaf.
    Value(Vec<u8>),
    /// Ordered `(key, value offset)` entries.
    Leaf(Vec<Entry>),
    /// Ordered `(min key, child offset)` entries.
    Branch(Vec<Entry>),
    /// Tombstone: the key at this leaf position is logically absent.
    Deleted,
    /// Commit record.
    Header(Header),
}

impl Node {
    fn tag(&self) -> u8 {
        match self {
            Node::Value(_) => TAG_VALUE,
            Node::Leaf(_) => TAG_LEAF,
            Node::Branch(_) => TAG_BRANCH,
            Node::Deleted => TAG_DELETED,
            Node::Header(_) => TAG_HEADER,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Node::Value(bytes) => bytes.clone(),
            Node::Leaf(entries) | Node::Branch(entries) => encoding::bincode::serialize(entries),
            Node::Deleted => Vec::new(),
            Node::Header(header) => {
                let mut buf = Vec::with_capacity(HEADER_PAYLOAD_LEN);
                buf.write_u32::<BigEndian>(MAGIC).expect("vec write");
                buf.write_u64::<BigEndian>(header.root).expect("vec write");
                buf.write_u64::<BigEndian>(header.size).expect("vec write");
                buf.write_u64::<BigEndian>(header.dirt).expect("vec write");
                buf
            }
        }
    }

    /// Encodes the node as a framed byte string.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len() + CRC_LEN);
        frame.push(self.tag());
        frame
            .write_u32::<BigEndian>(payload.len() as u32)
            .expect("vec write");
        frame.extend_from_slice(&payload);
        let crc = CRC32.checksum(&frame);
        frame.write_u32::<BigEndian>(crc).expect("vec write");
        frame
    }

    fn decode(tag: u8, payload: &[u8]) -> Result<Node> {
        match tag {
            TAG_VALUE => Ok(Node::Value(payload.to_vec())),
            TAG_LEAF => Ok(Node::Leaf(encoding::bincode::deserialize(payload)?)),
            TAG_BRANCH => Ok(Node::Branch(encoding::bincode::deserialize(payload)?)),
            TAG_DELETED => Ok(Node::Deleted),
            TAG_HEADER => {
                if payload.len() != HEADER_PAYLOAD_LEN {
                    return Err(Error::Corrupted(format!(
                        "header payload must be {HEADER_PAYLOAD_LEN} bytes, got {}",
                        payload.len()
                    )));
                }
                let magic = BigEndian::read_u32(&payload[0..4]);
                if magic != MAGIC {
                    return Err(Error::Corrupted(format!("bad header magic {magic:#010x}")));
                }
                Ok(Node::Header(Header {
                    root: BigEndian::read_u64(&payload[4..12]),
                    size: BigEndian::read_u64(&payload[12..20]),
                    dirt: BigEndian::read_u64(&payload[20..28]),
                }))
            }
            tag => Err(Error::Corrupted(format!("unknown node tag {tag:#04x}"))),
        }
    }
}

/// Appends a node frame and returns its offset. Header frames are
/// block-aligned so the recovery scan can find them.
pub fn write_node(store: &Store, node: &Node) -> Result<u64> {
    let frame = node.encode();
    match node {
        Node::Header(_) => store.append_aligned(&frame, BLOCK_SIZE),
        _ => store.append(&frame),
    }
}

/// Reads and validates the node frame at `offset`.
pub fn read_node(store: &Store, offset: u64) -> Result<Node> {
    let prefix = store.read_at(offset, PREFIX_LEN)?;
    let tag = prefix[0];
    let payload_len = BigEndian::read_u32(&prefix[1..5]);
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::Corrupted(format!(
            "implausible node payload length {payload_len} at offset {offset}"
        )));
    }

    let rest = store.read_at(
        offset + PREFIX_LEN as u64,
        payload_len as usize + CRC_LEN,
    )?;
    let (payload, crc_bytes) = rest.split_at(payload_len as usize);

    let mut digest = CRC32.digest();
    digest.update(&prefix);
    digest.update(payload);
    let computed = digest.finalize();
    let stored = BigEndian::read_u32(crc_bytes);
    if computed != stored {
        return Err(Error::Corrupted(format!(
            "checksum mismatch at offset {offset}: computed {computed:#010x}, stored {stored:#010x}"
        )));
    }

    Node::decode(tag, payload)
}

/// Scans backwards from the end of the file at block boundaries for the most
/// recent valid header. Returns its offset and contents, or `None` when the
/// file holds no committed tree.
pub fn latest_header(store: &Store) -> Result<Option<(u64, Header)>> {
    let len = store.len();
    if len < HEADER_FRAME_LEN as u64 {
        return Ok(None);
    }

    let mut offset = (len - HEADER_FRAME_LEN as u64) / BLOCK_SIZE * BLOCK_SIZE;
    loop {
        // A torn or garbage frame fails validation and is skipped.
        if let Ok(Node::Header(header)) = read_node(store, offset) {
            return Ok(Some((offset, header)));
        }
        if offset == 0 {
            return Ok(None);
        }
        offset -= BLOCK_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("0.cub")).unwrap();
        (dir, store)
    }

    #[test]
    fn node_round_trips() {
        let (_dir, store) = temp_store();

        let nodes = vec![
            Node::Value(b"some value".to_vec()),
            Node::Leaf(vec![(b"a".to_vec(), 7), (b"b".to_vec(), 42)]),
            Node::Branch(vec![(b"a".to_vec(), 0), (b"m".to_vec(), 1024)]),
            Node::Deleted,
            Node::Header(Header { root: 99, size: 3, dirt: 5 }),
        ];

        let offsets: Vec<u64> = nodes
            .iter()
            .map(|n| write_node(&store, n).unwrap())
            .collect();

        for (node, offset) in nodes.iter().zip(&offsets) {
            assert_eq!(read_node(&store, *offset).unwrap(), *node);
        }
    }

    #[test]
    fn corrupted_frame_is_rejected() {
        let (_dir, store) = temp_store();
        let offset = write_node(&store, &Node::Value(b"payload".to_vec())).unwrap();

        // A frame whose payload no longer matches its checksum
        let frame = Node::Value(b"payload".to_vec()).encode();
        let mut mangled = frame.clone();
        mangled[PREFIX_LEN] ^= 0xff;
        let bad_offset = store.append(&mangled).unwrap();

        assert!(read_node(&store, offset).is_ok());
        assert!(matches!(
            read_node(&store, bad_offset),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn header_frames_are_block_aligned() {
        let (_dir, store) = temp_store();
        store.append(b"unaligned data").unwrap();

        let header = Node::Header(Header { root: 1, size: 2, dirt: 3 });
        let offset = write_node(&store, &header).unwrap();
        assert_eq!(offset % BLOCK_SIZE, 0);
    }

    #[test]
    fn latest_header_finds_newest_valid() {
        let (_dir, store) = temp_store();
        assert_eq!(latest_header(&store).unwrap(), None);

        let first = Node::Header(Header { root: 10, size: 1, dirt: 0 });
        write_node(&store, &first).unwrap();

        let second = Node::Header(Header { root: 20, size: 2, dirt: 1 });
        let second_offset = write_node(&store, &second).unwrap();

        let (offset, header) = latest_header(&store).unwrap().unwrap();
        assert_eq!(offset, second_offset);
        assert_eq!(header.root, 20);

        // A torn tail write is ignored; recovery lands on the last good one.
        store.append(&vec![0xabu8; 700]).unwrap();
        let (offset, header) = latest_header(&store).unwrap().unwrap();
        assert_eq!(offset, second_offset);
        assert_eq!(header.dirt, 1);
    }
}
