// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable storage for persisted failure records.
//!
//! Every record is fully written or absent. [`FileRecordStore`] writes to a
//! temporary name, flushes and syncs, then renames into place, so a reader
//! (this process after a crash, or another process) never sees a partial
//! record.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use loom_telemetry_core::EncodeResult;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;

const RECORD_EXTENSION: &str = ".json";
const TMP_EXTENSION: &str = ".json.tmp";
const SEQUENCE_MODULUS: u64 = 10_000_000_000;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifier of a persisted record.
///
/// Formatted as `{unix_millis:013}_{sequence:010}_{uuid}`, so sorting ids
/// lexicographically yields capture order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
	pub fn generate() -> Self {
		let millis = Utc::now().timestamp_millis().max(0);
		let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed) % SEQUENCE_MODULUS;
		Self(format!(
			"{millis:013}_{sequence:010}_{}",
			Uuid::now_v7().simple()
		))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// When the record was captured, from the id's timestamp prefix.
	pub fn captured_at(&self) -> Option<DateTime<Utc>> {
		let millis: i64 = self.0.get(..13)?.parse().ok()?;
		Utc.timestamp_millis_opt(millis).single()
	}
}

impl fmt::Display for RecordId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RecordId {
	type Err = StoreError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut parts = s.split('_');
		let valid = matches!(
			(parts.next(), parts.next(), parts.next(), parts.next()),
			(Some(millis), Some(sequence), Some(uuid), None)
				if millis.len() == 13
					&& millis.bytes().all(|b| b.is_ascii_digit())
					&& sequence.len() == 10
					&& sequence.bytes().all(|b| b.is_ascii_digit())
					&& Uuid::try_parse(uuid).is_ok()
		);
		if valid {
			Ok(Self(s.to_string()))
		} else {
			Err(StoreError::InvalidRecordId(s.to_string()))
		}
	}
}

/// Storage for persisted records, keyed by [`RecordId`].
pub trait RecordStore: Send + Sync {
	/// Writes a record through `write`. The record becomes visible only if
	/// `write` succeeds and the content is durably stored.
	fn persist(
		&self,
		id: &RecordId,
		write: &mut dyn FnMut(&mut dyn Write) -> EncodeResult<()>,
	) -> Result<(), StoreError>;

	/// All visible records, oldest first.
	fn list(&self) -> Result<Vec<RecordId>, StoreError>;

	fn read(&self, id: &RecordId) -> Result<Vec<u8>, StoreError>;

	/// Removes a record. Removing a missing record is not an error.
	fn remove(&self, id: &RecordId) -> Result<(), StoreError>;
}

/// One `{id}.json` file per record in a dedicated directory.
#[derive(Debug)]
pub struct FileRecordStore {
	dir: PathBuf,
}

impl FileRecordStore {
	/// Opens (creating if needed) the store in `dir`.
	///
	/// Temporary files left by a writer that died mid-persist are removed.
	pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let dir = dir.into();
		fs::create_dir_all(&dir)?;

		let mut stale = 0usize;
		for entry in fs::read_dir(&dir)? {
			let path = entry?.path();
			if path.to_string_lossy().ends_with(TMP_EXTENSION) {
				match fs::remove_file(&path) {
					Ok(()) => stale += 1,
					Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale record"),
				}
			}
		}

		info!(dir = %dir.display(), stale_removed = stale, "Opened telemetry record store");
		Ok(Self { dir })
	}

	/// Opens the store under the platform data directory.
	pub fn from_xdg() -> Result<Self, StoreError> {
		let data_dir = dirs::data_dir().ok_or_else(|| {
			StoreError::Io(io::Error::new(
				io::ErrorKind::NotFound,
				"could not determine XDG data directory",
			))
		})?;
		Self::open(data_dir.join("loom").join("telemetry"))
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	fn record_path(&self, id: &RecordId) -> PathBuf {
		self.dir.join(format!("{id}{RECORD_EXTENSION}"))
	}

	fn tmp_path(&self, id: &RecordId) -> PathBuf {
		self.dir.join(format!("{id}{TMP_EXTENSION}"))
	}

	fn write_atomically(
		&self,
		tmp_path: &Path,
		path: &Path,
		write: &mut dyn FnMut(&mut dyn Write) -> EncodeResult<()>,
	) -> Result<(), StoreError> {
		let mut writer = BufWriter::new(File::create(tmp_path)?);
		write(&mut writer)?;
		writer.flush()?;
		let file = writer.into_inner().map_err(|e| e.into_error())?;
		file.sync_all()?;
		drop(file);

		fs::rename(tmp_path, path)?;
		sync_dir(&self.dir);
		Ok(())
	}
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
	if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
		debug!(dir = %dir.display(), error = %e, "Failed to sync record directory");
	}
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

impl RecordStore for FileRecordStore {
	fn persist(
		&self,
		id: &RecordId,
		write: &mut dyn FnMut(&mut dyn Write) -> EncodeResult<()>,
	) -> Result<(), StoreError> {
		let path = self.record_path(id);
		let tmp_path = self.tmp_path(id);

		if let Err(e) = self.write_atomically(&tmp_path, &path, write) {
			let _ = fs::remove_file(&tmp_path);
			return Err(e);
		}

		debug!(record_id = %id, path = %path.display(), "Persisted record to disk");
		Ok(())
	}

	fn list(&self) -> Result<Vec<RecordId>, StoreError> {
		let mut ids = Vec::new();

		for entry in fs::read_dir(&self.dir)? {
			let entry = entry?;
			let name = entry.file_name();
			let Some(name) = name.to_str() else {
				continue;
			};
			let Some(stem) = name.strip_suffix(RECORD_EXTENSION) else {
				continue;
			};
			match stem.parse::<RecordId>() {
				Ok(id) => ids.push(id),
				Err(_) => debug!(file = %name, "Ignoring foreign file in record store"),
			}
		}

		ids.sort();
		Ok(ids)
	}

	fn read(&self, id: &RecordId) -> Result<Vec<u8>, StoreError> {
		fs::read(self.record_path(id)).map_err(|e| {
			if e.kind() == io::ErrorKind::NotFound {
				StoreError::NotFound(id.to_string())
			} else {
				StoreError::Io(e)
			}
		})
	}

	fn remove(&self, id: &RecordId) -> Result<(), StoreError> {
		match fs::remove_file(self.record_path(id)) {
			Ok(()) => {
				debug!(record_id = %id, "Removed record from disk");
				Ok(())
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

/// In-memory store for tests and embedders without a writable disk.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
	records: Mutex<BTreeMap<RecordId, Vec<u8>>>,
}

impl MemoryRecordStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts raw bytes as a record, bypassing encoding.
	pub fn insert(&self, id: RecordId, bytes: Vec<u8>) {
		self.records.lock().insert(id, bytes);
	}

	pub fn len(&self) -> usize {
		self.records.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.lock().is_empty()
	}
}

impl RecordStore for MemoryRecordStore {
	fn persist(
		&self,
		id: &RecordId,
		write: &mut dyn FnMut(&mut dyn Write) -> EncodeResult<()>,
	) -> Result<(), StoreError> {
		let mut buf = Vec::new();
		write(&mut buf)?;
		self.records.lock().insert(id.clone(), buf);
		Ok(())
	}

	fn list(&self) -> Result<Vec<RecordId>, StoreError> {
		Ok(self.records.lock().keys().cloned().collect())
	}

	fn read(&self, id: &RecordId) -> Result<Vec<u8>, StoreError> {
		self.records
			.lock()
			.get(id)
			.cloned()
			.ok_or_else(|| StoreError::NotFound(id.to_string()))
	}

	fn remove(&self, id: &RecordId) -> Result<(), StoreError> {
		self.records.lock().remove(id);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_telemetry_core::EncodeError;
	use proptest::prelude::*;
	use tempfile::TempDir;

	fn write_bytes(bytes: &'static [u8]) -> impl FnMut(&mut dyn Write) -> EncodeResult<()> {
		move |out: &mut dyn Write| {
			out.write_all(bytes)?;
			Ok(())
		}
	}

	fn create_test_store() -> (FileRecordStore, TempDir) {
		let tmp = TempDir::new().unwrap();
		let store = FileRecordStore::open(tmp.path()).unwrap();
		(store, tmp)
	}

	#[test]
	fn test_generated_ids_sort_in_creation_order() {
		let ids: Vec<RecordId> = (0..100).map(|_| RecordId::generate()).collect();
		let mut sorted = ids.clone();
		sorted.sort();
		assert_eq!(ids, sorted);
	}

	#[test]
	fn test_generated_id_parses() {
		let id = RecordId::generate();
		let parsed: RecordId = id.as_str().parse().unwrap();
		assert_eq!(parsed, id);
		assert!(id.captured_at().is_some());
	}

	#[test]
	fn test_malformed_ids_are_rejected() {
		for bad in ["", "abc", "123_456_789", "0000000000001_000000000x_0", "a_b_c_d"] {
			assert!(bad.parse::<RecordId>().is_err(), "{bad} should be rejected");
		}
	}

	#[test]
	fn test_persist_read_remove() {
		let (store, _tmp) = create_test_store();
		let id = RecordId::generate();

		store.persist(&id, &mut write_bytes(b"{\"a\":1}")).unwrap();
		assert_eq!(store.list().unwrap(), vec![id.clone()]);
		assert_eq!(store.read(&id).unwrap(), b"{\"a\":1}");

		store.remove(&id).unwrap();
		assert!(store.list().unwrap().is_empty());
		assert!(store.read(&id).unwrap_err().is_not_found());
	}

	#[test]
	fn test_remove_missing_is_ok() {
		let (store, _tmp) = create_test_store();
		store.remove(&RecordId::generate()).unwrap();
	}

	#[test]
	fn test_failed_write_leaves_nothing_visible() {
		let (store, tmp) = create_test_store();
		let id = RecordId::generate();

		let result = store.persist(&id, &mut |out: &mut dyn Write| -> EncodeResult<()> {
			out.write_all(b"{\"partial\":")?;
			Err(EncodeError::Io(io::Error::new(io::ErrorKind::Other, "disk full")))
		});

		assert!(result.is_err());
		assert!(store.list().unwrap().is_empty());
		assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
	}

	#[test]
	fn test_list_ignores_tmp_and_foreign_files() {
		let (store, tmp) = create_test_store();
		let id = RecordId::generate();
		store.persist(&id, &mut write_bytes(b"{}")).unwrap();

		let pending = RecordId::generate();
		fs::write(tmp.path().join(format!("{pending}.json.tmp")), b"{").unwrap();
		fs::write(tmp.path().join("notes.json"), b"{}").unwrap();

		assert_eq!(store.list().unwrap(), vec![id]);
	}

	#[test]
	fn test_open_removes_stale_tmp_files() {
		let tmp = TempDir::new().unwrap();
		let stale = tmp.path().join(format!("{}.json.tmp", RecordId::generate()));
		fs::write(&stale, b"{\"half").unwrap();

		FileRecordStore::open(tmp.path()).unwrap();
		assert!(!stale.exists());
	}

	#[test]
	fn test_records_survive_reopen() {
		let tmp = TempDir::new().unwrap();
		let id = RecordId::generate();
		{
			let store = FileRecordStore::open(tmp.path()).unwrap();
			store.persist(&id, &mut write_bytes(b"{}")).unwrap();
		}

		let reopened = FileRecordStore::open(tmp.path()).unwrap();
		assert_eq!(reopened.list().unwrap(), vec![id]);
	}

	#[test]
	fn test_memory_store_lists_oldest_first() {
		let store = MemoryRecordStore::new();
		let first = RecordId::generate();
		let second = RecordId::generate();
		store.insert(second.clone(), b"{}".to_vec());
		store.insert(first.clone(), b"{}".to_vec());

		assert_eq!(store.list().unwrap(), vec![first, second]);
	}

	proptest! {
		#[test]
		fn record_id_timestamp_prefix_orders_ids(a in 0i64..9_999_999_999_999, b in 0i64..9_999_999_999_999) {
			let id_a: RecordId = format!("{a:013}_0000000000_{}", Uuid::nil().simple()).parse().unwrap();
			let id_b: RecordId = format!("{b:013}_0000000000_{}", Uuid::nil().simple()).parse().unwrap();
			prop_assert_eq!(a.cmp(&b), id_a.cmp(&id_b));
		}
	}
}
