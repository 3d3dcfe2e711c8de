use super::cid::Cid;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::debug;

/// In-memory staging area for the blocks of one archive.
///
/// Blocks keep their first insertion order so the serialized archive is
/// deterministic. A store must be closed once the archive has been uploaded;
/// dropping an open store closes it as well.
#[derive(Default)]
pub struct BlockStore {
    blocks: HashMap<Cid, Bytes>,
    order: Vec<Cid>,
    closed: bool,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the block was already present.
    pub fn put(&mut self, cid: Cid, block: impl Into<Bytes>) -> bool {
        if self.closed || self.blocks.contains_key(&cid) {
            return false;
        }
        self.blocks.insert(cid, block.into());
        self.order.push(cid);
        true
    }

    #[cfg(test)]
    pub fn get(&self, cid: &Cid) -> Option<&Bytes> {
        self.blocks.get(cid)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.blocks.values().map(Bytes::len).sum()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Blocks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Cid, &Bytes)> {
        self.order
            .iter()
            .filter_map(|cid| self.blocks.get(cid).map(|block| (cid, block)))
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!(
            blocks = self.order.len(),
            bytes = self.total_bytes(),
            "Releasing block store"
        );
        self.blocks.clear();
        self.order.clear();
        self.closed = true;
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        self.close();
    }
}
