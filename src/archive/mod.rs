//! Content-addressed packaging of one rendition into a CARv1 archive.

pub mod blockstore;
pub mod car;
pub mod cid;
pub mod unixfs;

use crate::error::{PipelineError, PipelineResult};
use crate::types::RenditionFile;
use blockstore::BlockStore;
use bytes::Bytes;
use cid::Cid;
use std::collections::HashSet;
use tracing::info;
use unixfs::PbLink;

/// A packaged rendition: the directory root, its serialized archive and the
/// block store the archive was built from.
pub struct ContentArchive {
    root: Cid,
    car: Bytes,
    store: BlockStore,
}

impl ContentArchive {
    /// Content identifier of the rendition directory.
    pub fn content_id(&self) -> String {
        self.root.to_string()
    }

    #[cfg(test)]
    pub fn root(&self) -> &Cid {
        &self.root
    }

    pub fn bytes(&self) -> &Bytes {
        &self.car
    }

    pub fn len(&self) -> usize {
        self.car.len()
    }

    pub fn block_count(&self) -> usize {
        self.store.len()
    }

    /// Close the backing block store. The archive bytes stay readable until drop.
    pub fn release(mut self) -> Bytes {
        self.store.close();
        self.car
    }
}

fn check_names(files: &[RenditionFile]) -> PipelineResult<()> {
    let mut seen = HashSet::new();
    for file in files {
        if file.name.is_empty() {
            return Err(PipelineError::Packaging(
                "rendition file has an empty name".to_string(),
            ));
        }
        if file.name.contains('/') {
            return Err(PipelineError::Packaging(format!(
                "rendition file '{}' must not contain a path separator",
                file.name
            )));
        }
        if !seen.insert(file.name.as_str()) {
            return Err(PipelineError::Packaging(format!(
                "rendition file '{}' appears more than once",
                file.name
            )));
        }
    }
    Ok(())
}

/// Build the UnixFS directory for `files` and serialize it as a CAR.
///
/// The result depends only on file names and contents, never on input order.
pub fn package(files: &[RenditionFile]) -> PipelineResult<ContentArchive> {
    check_names(files)?;

    let mut sorted: Vec<&RenditionFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

    let mut store = BlockStore::new();
    let mut links = Vec::with_capacity(sorted.len());
    for file in sorted {
        let (cid, tsize) = unixfs::put_file(&mut store, &file.data);
        links.push(PbLink {
            cid,
            name: file.name.clone(),
            tsize,
        });
    }
    let (root, _) = unixfs::put_directory(&mut store, links);
    let car = Bytes::from(car::write_car(&root, &store));

    info!(
        root = %root,
        digest = %root.digest_hex(),
        files = files.len(),
        blocks = store.len(),
        bytes = car.len(),
        "Packaged rendition archive"
    );

    Ok(ContentArchive { root, car, store })
}
