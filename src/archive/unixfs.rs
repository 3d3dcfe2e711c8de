//! UnixFS nodes encoded as dag-pb blocks.
//!
//! Files up to [`CHUNK_SIZE`] become a single raw leaf. Larger files are split
//! into raw leaves under one `File` node. A rendition is wrapped in a single
//! `Directory` node whose links are sorted by name.

use super::blockstore::BlockStore;
use super::cid::{CODEC_DAG_PB, CODEC_RAW, Cid, encode_varint};

pub const CHUNK_SIZE: usize = 1024 * 1024;

const UNIXFS_DIRECTORY: u64 = 1;
const UNIXFS_FILE: u64 = 2;

/// A named edge from a dag-pb node to a child block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PbLink {
    pub cid: Cid,
    pub name: String,
    /// Size of the child block plus everything below it.
    pub tsize: u64,
}

fn put_tag(field: u64, wire_type: u64, out: &mut Vec<u8>) {
    encode_varint((field << 3) | wire_type, out);
}

fn put_bytes_field(field: u64, bytes: &[u8], out: &mut Vec<u8>) {
    put_tag(field, 2, out);
    encode_varint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn put_varint_field(field: u64, value: u64, out: &mut Vec<u8>) {
    put_tag(field, 0, out);
    encode_varint(value, out);
}

/// Serialize a dag-pb `PBNode`. Links precede `Data`, as the codec requires.
pub fn encode_node(links: &[PbLink], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for link in links {
        let mut encoded = Vec::new();
        put_bytes_field(1, &link.cid.to_bytes(), &mut encoded);
        put_bytes_field(2, link.name.as_bytes(), &mut encoded);
        put_varint_field(3, link.tsize, &mut encoded);
        put_bytes_field(2, &encoded, &mut out);
    }
    put_bytes_field(1, data, &mut out);
    out
}

/// Serialize a UnixFS `Data` message.
pub fn encode_unixfs(kind: u64, filesize: Option<u64>, blocksizes: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    put_varint_field(1, kind, &mut out);
    if let Some(size) = filesize {
        put_varint_field(3, size, &mut out);
    }
    for size in blocksizes {
        put_varint_field(4, *size, &mut out);
    }
    out
}

/// Store one file's blocks and return its root CID and cumulative size.
pub fn put_file(store: &mut BlockStore, data: &[u8]) -> (Cid, u64) {
    if data.len() <= CHUNK_SIZE {
        let cid = Cid::hash(CODEC_RAW, data);
        store.put(cid, data.to_vec());
        return (cid, data.len() as u64);
    }

    let mut links = Vec::new();
    let mut blocksizes = Vec::new();
    for leaf in data.chunks(CHUNK_SIZE) {
        let cid = Cid::hash(CODEC_RAW, leaf);
        store.put(cid, leaf.to_vec());
        links.push(PbLink {
            cid,
            name: String::new(),
            tsize: leaf.len() as u64,
        });
        blocksizes.push(leaf.len() as u64);
    }

    let unixfs = encode_unixfs(UNIXFS_FILE, Some(data.len() as u64), &blocksizes);
    let block = encode_node(&links, &unixfs);
    let cid = Cid::hash(CODEC_DAG_PB, &block);
    let cumulative = block.len() as u64 + links.iter().map(|l| l.tsize).sum::<u64>();
    store.put(cid, block);
    (cid, cumulative)
}

/// Store a directory node over already-stored entries.
pub fn put_directory(store: &mut BlockStore, mut entries: Vec<PbLink>) -> (Cid, u64) {
    entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    let unixfs = encode_unixfs(UNIXFS_DIRECTORY, None, &[]);
    let block = encode_node(&entries, &unixfs);
    let cid = Cid::hash(CODEC_DAG_PB, &block);
    let cumulative = block.len() as u64 + entries.iter().map(|l| l.tsize).sum::<u64>();
    store.put(cid, block);
    (cid, cumulative)
}
