use super::blockstore::BlockStore;
use super::cid::{Cid, encode_varint};

/// dag-cbor `{"roots": [root], "version": 1}`.
fn encode_header(root: &Cid) -> Vec<u8> {
    let cid_bytes = root.to_bytes();
    let mut out = Vec::with_capacity(cid_bytes.len() + 24);
    // map(2), keys in length-first order
    out.push(0xa2);
    out.push(0x65);
    out.extend_from_slice(b"roots");
    out.push(0x81);
    // tag 42 wraps a CID as a byte string with a leading identity-multibase zero
    out.extend_from_slice(&[0xd8, 0x2a]);
    push_cbor_bytes_len(cid_bytes.len() + 1, &mut out);
    out.push(0x00);
    out.extend_from_slice(&cid_bytes);
    out.push(0x67);
    out.extend_from_slice(b"version");
    out.push(0x01);
    out
}

fn push_cbor_bytes_len(len: usize, out: &mut Vec<u8>) {
    match len {
        0..=23 => out.push(0x40 | len as u8),
        24..=0xff => {
            out.push(0x58);
            out.push(len as u8);
        }
        _ => {
            out.push(0x59);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
    }
}

/// Serialize every block of `store` as a CARv1 stream rooted at `root`.
pub fn write_car(root: &Cid, store: &BlockStore) -> Vec<u8> {
    let header = encode_header(root);
    let mut out = Vec::with_capacity(store.total_bytes() + store.len() * 40 + header.len() + 2);
    encode_varint(header.len() as u64, &mut out);
    out.extend_from_slice(&header);

    for (cid, block) in store.iter() {
        let cid_bytes = cid.to_bytes();
        encode_varint((cid_bytes.len() + block.len()) as u64, &mut out);
        out.extend_from_slice(&cid_bytes);
        out.extend_from_slice(block);
    }
    out
}
