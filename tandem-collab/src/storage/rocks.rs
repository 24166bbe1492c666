//! RocksDB-backed file and change-log store.
//!
//! Column families:
//! - `files`: canonical file text (LZ4 compressed), keyed by file id
//! - `metadata`: per-file metadata (bincode), keyed by file id
//! - `changes`: relayed change log entries (bincode), keyed by
//!   `<project_id:16><seq:8 BE>` so a prefix scan returns a project's log in
//!   relay order

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use tandem_core::{now_millis, LogEntry};

use super::{ContentStore, StoreError};

const CF_FILES: &str = "files";
const CF_METADATA: &str = "metadata";
const CF_CHANGES: &str = "changes";

const COLUMN_FAMILIES: &[&str] = &[CF_FILES, CF_METADATA, CF_CHANGES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-chosen directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Metadata stored next to each file body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: Uuid,
    pub project_id: Uuid,
    /// Number of saves so far
    pub revision: u64,
    /// Uncompressed size in bytes
    pub size: u64,
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl FileMetadata {
    fn new(file_id: Uuid, project_id: Uuid) -> Self {
        let now = now_millis();
        Self {
            file_id,
            project_id,
            revision: 0,
            size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// RocksDB store used by the relay and by embedded single-host setups.
///
/// Connection tasks share one handle behind a mutex; every call is a short
/// point operation or prefix scan.
pub struct FileStore {
    db: Mutex<DBWithThreadMode<SingleThreaded>>,
    config: StoreConfig,
    /// Next change-log sequence number
    sequence: AtomicU64,
}

impl FileStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened file store at {} (next change seq {sequence})",
            config.path.display()
        );

        Ok(Self {
            db: Mutex::new(db),
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_FILES => {
                // Bodies are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CHANGES => {
                // Many small appends
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    /// The highest sequence number in use, plus one.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let Some(cf) = db.cf_handle(CF_CHANGES) else {
            return Ok(0);
        };
        let mut max = None;
        // Keys are project-prefixed, so the last key is not the newest entry.
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(seq) = change_seq(&key) {
                max = Some(max.map_or(seq, |m: u64| m.max(seq)));
            }
        }
        Ok(max.map_or(0, |m| m + 1))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn db(&self) -> std::sync::MutexGuard<'_, DBWithThreadMode<SingleThreaded>> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Files ────────────────────────────────────────────────────────

    /// Overwrite a file's text. Body and metadata are written in one batch.
    pub fn save_file(
        &self,
        project_id: Uuid,
        file_id: Uuid,
        content: &str,
    ) -> Result<FileMetadata, StoreError> {
        let mut meta = match self.load_metadata(file_id) {
            Ok(meta) if meta.project_id != project_id => {
                return Err(StoreError::WrongProject {
                    file_id,
                    project_id: meta.project_id,
                })
            }
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => FileMetadata::new(file_id, project_id),
            Err(e) => return Err(e),
        };
        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());
        meta.revision += 1;
        meta.size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_millis();

        let db = self.db();
        let cf_files = cf(&db, CF_FILES)?;
        let cf_meta = cf(&db, CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_files, file_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, file_id.as_bytes(), encode(&meta)?);
        db.write_opt(batch, &self.write_opts())?;

        log::debug!(
            "Saved file {file_id} rev {} ({} → {} bytes)",
            meta.revision,
            meta.size,
            meta.compressed_size
        );
        Ok(meta)
    }

    pub fn load_file(&self, file_id: Uuid) -> Result<String, StoreError> {
        let db = self.db();
        let compressed = db
            .get_cf(cf(&db, CF_FILES)?, file_id.as_bytes())?
            .ok_or(StoreError::NotFound(file_id))?;
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    pub fn file_exists(&self, file_id: Uuid) -> Result<bool, StoreError> {
        let db = self.db();
        Ok(db.get_cf(cf(&db, CF_METADATA)?, file_id.as_bytes())?.is_some())
    }

    pub fn load_metadata(&self, file_id: Uuid) -> Result<FileMetadata, StoreError> {
        let db = self.db();
        match db.get_cf(cf(&db, CF_METADATA)?, file_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(file_id)),
        }
    }

    /// Ids of every stored file belonging to `project_id`.
    pub fn list_files(&self, project_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let db = self.db();
        let mut files = Vec::new();
        for item in db.iterator_cf(cf(&db, CF_METADATA)?, IteratorMode::Start) {
            let (_, value) = item?;
            let meta: FileMetadata = decode(&value)?;
            if meta.project_id == project_id {
                files.push(meta.file_id);
            }
        }
        Ok(files)
    }

    pub fn delete_file(&self, file_id: Uuid) -> Result<(), StoreError> {
        let db = self.db();
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf(&db, CF_FILES)?, file_id.as_bytes());
        batch.delete_cf(cf(&db, CF_METADATA)?, file_id.as_bytes());
        db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    // ─── Change log ───────────────────────────────────────────────────

    /// Append a relayed change to its project's log. Returns the storage
    /// sequence number assigned.
    pub fn append_change(&self, project_id: Uuid, entry: &LogEntry) -> Result<u64, StoreError> {
        let value = encode(entry)?;
        let db = self.db();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        db.put_cf_opt(
            cf(&db, CF_CHANGES)?,
            change_key(project_id, seq),
            value,
            &self.write_opts(),
        )?;
        Ok(seq)
    }

    /// A project's change log in append order.
    pub fn load_changes(&self, project_id: Uuid) -> Result<Vec<LogEntry>, StoreError> {
        let db = self.db();
        let start = change_key(project_id, 0);
        let mut entries = Vec::new();
        for item in db.iterator_cf(cf(&db, CF_CHANGES)?, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != project_id.as_bytes() {
                break;
            }
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db().flush()?;
        Ok(())
    }

    pub fn change_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl ContentStore for FileStore {
    /// A file stored under another project reads as missing.
    async fn fetch_content(&self, project_id: Uuid, file_id: Uuid) -> Result<String, StoreError> {
        if self.load_metadata(file_id)?.project_id != project_id {
            return Err(StoreError::NotFound(file_id));
        }
        self.load_file(file_id)
    }

    async fn save_content(
        &self,
        project_id: Uuid,
        file_id: Uuid,
        content: String,
    ) -> Result<(), StoreError> {
        self.save_file(project_id, file_id, &content).map(|_| ())
    }

    async fn fetch_change_log(&self, project_id: Uuid) -> Result<Vec<LogEntry>, StoreError> {
        self.load_changes(project_id)
    }
}

fn cf<'a>(
    db: &'a DBWithThreadMode<SingleThreaded>,
    name: &str,
) -> Result<&'a rocksdb::ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
}

/// `<project_id:16><seq:8 BE>`
fn change_key(project_id: Uuid, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(project_id.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn change_seq(key: &[u8]) -> Option<u64> {
    let tail: [u8; 8] = key.get(16..24)?.try_into().ok()?;
    Some(u64::from_be_bytes(tail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{ChangeRecord, Origin, Position};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn entry(file: Uuid, ts: u64) -> LogEntry {
        LogEntry::relayed(
            ts,
            ChangeRecord {
                file_id: file,
                author_id: Uuid::new_v4(),
                origin: Origin::Input,
                from: Position::ZERO,
                to: Position::ZERO,
                removed_text: String::new(),
                inserted_text: format!("edit {ts}"),
                timestamp: ts,
            },
        )
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert_eq!(store.change_sequence(), 0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = open_temp();
        let project = Uuid::new_v4();
        let file = Uuid::new_v4();
        let text = "fn main() {\n    println!(\"héllo\");\n}\n";

        let meta = store.save_file(project, file, text).unwrap();
        assert_eq!(meta.revision, 1);
        assert_eq!(meta.size, text.len() as u64);
        assert_eq!(store.load_file(file).unwrap(), text);
    }

    #[test]
    fn test_save_overwrites_and_bumps_revision() {
        let (_dir, store) = open_temp();
        let project = Uuid::new_v4();
        let file = Uuid::new_v4();
        store.save_file(project, file, "first").unwrap();
        let meta = store.save_file(project, file, "second").unwrap();

        assert_eq!(meta.revision, 2);
        assert_eq!(store.load_file(file).unwrap(), "second");
        assert_eq!(store.load_metadata(file).unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_content_is_scoped_to_its_project() {
        let (_dir, store) = open_temp();
        let (owner, stranger) = (Uuid::new_v4(), Uuid::new_v4());
        let file = Uuid::new_v4();
        store.save_content(owner, file, "owned".into()).await.unwrap();

        assert_eq!(
            store.fetch_content(stranger, file).await.unwrap_err(),
            StoreError::NotFound(file)
        );
        assert_eq!(
            store.save_content(stranger, file, "hijack".into()).await.unwrap_err(),
            StoreError::WrongProject {
                file_id: file,
                project_id: owner
            }
        );
        assert_eq!(store.fetch_content(owner, file).await.unwrap(), "owned");
        assert_eq!(store.load_metadata(file).unwrap().revision, 1);
    }

    #[test]
    fn test_empty_content_roundtrip() {
        let (_dir, store) = open_temp();
        let file = Uuid::new_v4();
        store.save_file(Uuid::new_v4(), file, "").unwrap();
        assert_eq!(store.load_file(file).unwrap(), "");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let (_dir, store) = open_temp();
        let file = Uuid::new_v4();
        assert_eq!(store.load_file(file).unwrap_err(), StoreError::NotFound(file));
        assert!(!store.file_exists(file).unwrap());
    }

    #[test]
    fn test_list_and_delete_files() {
        let (_dir, store) = open_temp();
        let project = Uuid::new_v4();
        let other = Uuid::new_v4();
        let f1 = Uuid::new_v4();
        let f2 = Uuid::new_v4();
        store.save_file(project, f1, "a").unwrap();
        store.save_file(project, f2, "b").unwrap();
        store.save_file(other, Uuid::new_v4(), "c").unwrap();

        let mut listed = store.list_files(project).unwrap();
        listed.sort();
        let mut expected = vec![f1, f2];
        expected.sort();
        assert_eq!(listed, expected);

        store.delete_file(f1).unwrap();
        assert!(!store.file_exists(f1).unwrap());
        assert_eq!(store.list_files(project).unwrap(), vec![f2]);
    }

    #[test]
    fn test_change_log_is_per_project_and_ordered() {
        let (_dir, store) = open_temp();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let file = Uuid::new_v4();

        store.append_change(p1, &entry(file, 1)).unwrap();
        store.append_change(p2, &entry(file, 2)).unwrap();
        store.append_change(p1, &entry(file, 3)).unwrap();

        let log = store.load_changes(p1).unwrap();
        let stamps: Vec<u64> = log.iter().map(|e| e.change.timestamp).collect();
        assert_eq!(stamps, vec![1, 3]);
        assert_eq!(store.load_changes(p2).unwrap().len(), 1);
        assert!(store.load_changes(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_sequence_recovered_on_reopen() {
        let dir = TempDir::new().unwrap();
        let project = Uuid::new_v4();
        {
            let store = FileStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            for ts in 0..5 {
                store.append_change(project, &entry(Uuid::new_v4(), ts)).unwrap();
            }
            store.sync().unwrap();
        }

        let store = FileStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.change_sequence(), 5);
        store.append_change(project, &entry(Uuid::new_v4(), 99)).unwrap();
        assert_eq!(store.load_changes(project).unwrap().len(), 6);
        assert_eq!(store.load_changes(project).unwrap()[5].change.timestamp, 99);
    }

    #[test]
    fn test_content_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let file = Uuid::new_v4();
        {
            let store = FileStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_file(Uuid::new_v4(), file, "persisted").unwrap();
        }
        let store = FileStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_file(file).unwrap(), "persisted");
    }

    #[test]
    fn test_compression_on_repetitive_source() {
        let (_dir, store) = open_temp();
        let text = "let x = 1;\n".repeat(2_000);
        let meta = store.save_file(Uuid::new_v4(), Uuid::new_v4(), &text).unwrap();
        assert!(meta.compressed_size * 5 < meta.size);
    }

    #[tokio::test]
    async fn test_content_store_impl() {
        let (_dir, store) = open_temp();
        let project = Uuid::new_v4();
        let file = Uuid::new_v4();

        store.save_content(project, file, "via trait".into()).await.unwrap();
        assert_eq!(store.fetch_content(project, file).await.unwrap(), "via trait");

        store.append_change(project, &entry(file, 7)).unwrap();
        assert_eq!(store.fetch_change_log(project).await.unwrap().len(), 1);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("tandem_data"));
        assert!(!config.sync_writes);
    }
}
