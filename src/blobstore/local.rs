//! Local directory backend.
//!
//! Parts are read sequentially with the same chunk arithmetic as the S3
//! backend, so both sides agree on part boundaries for the same size.

use crate::chunk::part::Part;
use crate::chunk::policy::{ChunkPolicy, TransferDescriptor};
use crate::config::TransferConfig;
use crate::error::{BlobStoreError, Result};
use crate::transfer::{ensure_complete, ensure_in_range};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;
use walkdir::WalkDir;

pub struct LocalBlobStore {
    root: PathBuf,
    config: TransferConfig,
}

impl LocalBlobStore {
    pub fn new(root: impl AsRef<Path>, config: TransferConfig) -> Result<Self> {
        Ok(Self {
            root: std::path::absolute(root.as_ref())?,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys of all files below `root/prefix`, relative to `root`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let start = self.root.join(prefix);
        tokio::task::spawn_blocking(move || walk(&root, &start)).await?
    }

    pub fn blob(&self, key: &str) -> LocalBlob {
        LocalBlob {
            path: self.root.join(key),
            key: key.to_owned(),
            config: self.config.clone(),
        }
    }
}

fn walk(root: &Path, start: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in WalkDir::new(start).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(io::Error::kind) == Some(ErrorKind::NotFound) => continue,
            Err(e) => return Err(io::Error::from(e).into()),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            keys.push(relative.to_string_lossy().into_owned());
        }
    }
    Ok(keys)
}

fn not_found_as(key: &str) -> impl FnOnce(io::Error) -> BlobStoreError + '_ {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            BlobStoreError::not_found(key)
        } else {
            e.into()
        }
    }
}

/// Staging path used until a write is finalized.
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

pub(crate) async fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    Ok(())
}

pub struct LocalBlob {
    path: PathBuf,
    key: String,
    config: TransferConfig,
}

impl LocalBlob {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> String {
        self.path.display().to_string()
    }

    pub(crate) fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub async fn get(&self) -> Result<Bytes> {
        let data = fs::read(&self.path).await.map_err(not_found_as(&self.key))?;
        Ok(data.into())
    }

    pub async fn put(&self, data: Bytes) -> Result<()> {
        ensure_parent(&self.path).await?;
        let mut f = File::create(&self.path).await?;
        f.write_all(&data).await?;
        f.flush().await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        fs::remove_file(&self.path)
            .await
            .map_err(not_found_as(&self.key))
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.path).await?)
    }

    pub async fn size(&self) -> Result<u64> {
        let meta = fs::metadata(&self.path)
            .await
            .map_err(not_found_as(&self.key))?;
        Ok(meta.len())
    }

    /// S3-compatible ETag over the part boundaries the chunk policy gives for
    /// this file: the md5 of the content for one part, otherwise the md5 of
    /// the concatenated part digests suffixed with the part count.
    pub async fn checksum(&self) -> Result<String> {
        let mut parts = self.parts().await?;
        let count = parts.len();
        let mut digests = vec![[0u8; 16]; count];
        while let Some(part) = parts.next_part().await {
            let part = part?;
            digests[part.number as usize] = md5::compute(&part.data).0;
        }
        if count == 1 {
            return Ok(hex::encode(digests[0]));
        }
        let joined = digests.concat();
        Ok(format!("{}-{count}", hex::encode(md5::compute(joined).0)))
    }

    pub async fn put_tags(&self, _tags: &BTreeMap<String, String>) -> Result<()> {
        Err(BlobStoreError::Unsupported {
            operation: "put_tags",
        })
    }

    pub async fn get_tags(&self) -> Result<BTreeMap<String, String>> {
        Err(BlobStoreError::Unsupported {
            operation: "get_tags",
        })
    }

    pub async fn download(&self, dest: &Path) -> Result<()> {
        ensure_parent(dest).await?;
        fs::copy(&self.path, dest)
            .await
            .map_err(not_found_as(&self.key))?;
        Ok(())
    }

    pub async fn parts(&self) -> Result<LocalPartReader> {
        LocalPartReader::open(&self.path, self.config.policy).await
    }

    pub fn multipart_writer(&self) -> LocalMultipartWriter {
        LocalMultipartWriter::new(&self.path)
    }
}

/// Sequential part reader over a local file. The handle is held until the
/// last part is read, [`LocalPartReader::close`] is called, or the reader is
/// dropped.
pub struct LocalPartReader {
    path: PathBuf,
    descriptor: TransferDescriptor,
    handle: Option<File>,
    next_number: u32,
}

impl LocalPartReader {
    pub async fn open(path: impl Into<PathBuf>, policy: ChunkPolicy) -> Result<Self> {
        let path = path.into();
        let key = path.display().to_string();
        let handle = File::open(&path).await.map_err(not_found_as(&key))?;
        let size = handle.metadata().await?.len();
        Ok(Self {
            path,
            descriptor: policy.describe(size),
            handle: Some(handle),
            next_number: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.descriptor.part_count as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn chunk_size(&self) -> u64 {
        self.descriptor.chunk_size
    }

    pub fn descriptor(&self) -> TransferDescriptor {
        self.descriptor
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Parts in order; the last one reads whatever remains of the file.
    pub async fn next_part(&mut self) -> Option<Result<Part>> {
        if u64::from(self.next_number) >= self.descriptor.part_count {
            self.close();
            return None;
        }
        let handle = self.handle.as_mut()?;
        let number = self.next_number;
        self.next_number += 1;
        match read_part(handle, number, self.descriptor.chunk_size).await {
            Ok(part) => {
                debug!("Read part {number} of {}", self.path.display());
                Some(Ok(part))
            }
            Err(e) => {
                self.close();
                Some(Err(BlobStoreError::transfer(number, e.into())))
            }
        }
    }

    pub fn close(&mut self) {
        self.handle = None;
    }
}

async fn read_part(handle: &mut File, number: u32, chunk_size: u64) -> io::Result<Part> {
    handle
        .seek(SeekFrom::Start(u64::from(number) * chunk_size))
        .await?;
    let mut data = Vec::new();
    (&mut *handle).take(chunk_size).read_to_end(&mut data).await?;
    Ok(Part::new(number, data))
}

/// Writer for the local backend. There is no multipart protocol on a
/// filesystem: parts are collected and written out in order on close, via a
/// staging file renamed over the target.
pub struct LocalMultipartWriter {
    path: PathBuf,
    parts: BTreeMap<u32, Bytes>,
    expected_parts: Option<u64>,
    closed: bool,
}

impl LocalMultipartWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            parts: BTreeMap::new(),
            expected_parts: None,
            closed: false,
        }
    }

    pub fn expect_part_count(&mut self, count: u64) {
        self.expected_parts = Some(count);
    }

    pub async fn put_part(&mut self, part: Part) -> Result<()> {
        if self.closed {
            return Err(BlobStoreError::WriterClosed {
                key: self.path.display().to_string(),
            });
        }
        if let Some(count) = self.expected_parts {
            ensure_in_range(part.number, count)?;
        }
        if self.parts.contains_key(&part.number) {
            return Err(BlobStoreError::DuplicatePart {
                number: part.number,
            });
        }
        self.parts.insert(part.number, part.data);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        ensure_complete(self.parts.keys(), self.expected_parts)?;

        let staging = partial_path(&self.path);
        ensure_parent(&staging).await?;
        let mut f = File::create(&staging).await?;
        for data in self.parts.values() {
            f.write_all(data).await?;
        }
        f.flush().await?;
        drop(f);
        fs::rename(&staging, &self.path).await?;
        self.closed = true;
        self.parts.clear();
        debug!("Wrote {}", self.path.display());
        Ok(())
    }

    pub async fn abort(mut self) -> Result<()> {
        self.closed = true;
        self.parts.clear();
        match fs::remove_file(partial_path(&self.path)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> TransferConfig {
        TransferConfig {
            policy: ChunkPolicy::new(4, 100),
            ..TransferConfig::default()
        }
    }

    #[tokio::test]
    async fn test_parts_cover_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path(), small_config()).unwrap();
        let blob = store.blob("dir/file.bin");
        blob.put(Bytes::from_static(b"abcdefghij")).await.unwrap();

        let mut parts = blob.parts().await.unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.chunk_size(), 4);
        let mut got = Vec::new();
        while let Some(part) = parts.next_part().await {
            got.push(part.unwrap());
        }
        assert!(parts.is_closed());
        let numbers: Vec<u32> = got.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        assert_eq!(&got[2].data[..], b"ij");
    }

    #[tokio::test]
    async fn test_empty_file_is_one_empty_part() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path(), TransferConfig::default()).unwrap();
        let blob = store.blob("empty");
        blob.put(Bytes::new()).await.unwrap();
        let mut parts = blob.parts().await.unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts.next_part().await.unwrap().unwrap().is_empty());
        assert!(parts.next_part().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path(), TransferConfig::default()).unwrap();
        let blob = store.blob("missing");
        assert!(blob.parts().await.err().unwrap().is_not_found());
        assert!(blob.get().await.unwrap_err().is_not_found());
        assert!(blob.size().await.unwrap_err().is_not_found());
        assert!(!blob.exists().await.unwrap());
        assert!(matches!(
            blob.get_tags().await,
            Err(BlobStoreError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_explicit_close_releases_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path(), small_config()).unwrap();
        let blob = store.blob("f");
        blob.put(Bytes::from_static(b"0123456789")).await.unwrap();
        let mut parts = blob.parts().await.unwrap();
        parts.next_part().await.unwrap().unwrap();
        parts.close();
        assert!(parts.is_closed());
        assert!(parts.next_part().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_out_of_order_and_atomic() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path(), small_config()).unwrap();
        let blob = store.blob("out/obj");
        let mut w = blob.multipart_writer();
        w.put_part(Part::new(1, &b"5678"[..])).await.unwrap();
        w.put_part(Part::new(0, &b"1234"[..])).await.unwrap();
        assert!(!blob.exists().await.unwrap());
        w.close().await.unwrap();
        w.close().await.unwrap();
        assert_eq!(&blob.get().await.unwrap()[..], b"12345678");
        assert!(!partial_path(blob.path()).exists());
    }

    #[tokio::test]
    async fn test_writer_with_gap_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path(), small_config()).unwrap();
        let blob = store.blob("gap");
        let mut w = blob.multipart_writer();
        w.put_part(Part::new(1, &b"5678"[..])).await.unwrap();
        assert!(matches!(
            w.close().await,
            Err(BlobStoreError::MissingParts { .. })
        ));
        assert!(!blob.exists().await.unwrap());

        w.put_part(Part::new(0, &b"1234"[..])).await.unwrap();
        w.close().await.unwrap();
        assert_eq!(&blob.get().await.unwrap()[..], b"12345678");
    }

    #[tokio::test]
    async fn test_writer_rejects_parts_past_declared_count() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path(), small_config()).unwrap();
        let mut w = store.blob("obj").multipart_writer();
        w.expect_part_count(1);
        assert!(matches!(
            w.put_part(Part::new(1, &b"x"[..])).await,
            Err(BlobStoreError::PartOutOfRange { number: 1, limit: 1 })
        ));
        w.put_part(Part::new(0, &b"x"[..])).await.unwrap();
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_relative_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path(), small_config()).unwrap();
        store.blob("a/1").put(Bytes::from_static(b"x")).await.unwrap();
        store.blob("a/b/2").put(Bytes::from_static(b"y")).await.unwrap();
        store.blob("c/3").put(Bytes::from_static(b"z")).await.unwrap();
        assert_eq!(store.list("a").await.unwrap(), vec!["a/1", "a/b/2"]);
        assert_eq!(store.list("").await.unwrap().len(), 3);
        assert!(store.list("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checksum_matches_s3_etag_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path(), small_config()).unwrap();
        let blob = store.blob("sum");
        blob.put(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(
            blob.checksum().await.unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );

        blob.put(Bytes::from_static(b"abcdefgh")).await.unwrap();
        let mut digests = md5::compute(b"abcd").0.to_vec();
        digests.extend_from_slice(&md5::compute(b"efgh").0);
        let expected = format!("{}-2", hex::encode(md5::compute(&digests).0));
        assert_eq!(blob.checksum().await.unwrap(), expected);
    }
}
