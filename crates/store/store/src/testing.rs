use std::path::Path;

use bytes::Bytes;
use futures::TryStreamExt;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use tether_core::{ArchiveRef, SessionId};

use crate::archive::{ArchiveStore, ArchiveUpload};
use crate::error::{BlobError, LedgerError, PersistError};
use crate::ledger::SessionLedger;
use crate::store::SessionStore;

fn test_id(id: &str) -> SessionId {
    SessionId::parse(id).unwrap_or_default()
}

/// Deterministic pseudo-random payload of `len` bytes.
#[must_use]
pub fn random_payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}

async fn collect(store: &dyn ArchiveStore, archive_ref: &ArchiveRef) -> Result<Vec<u8>, BlobError> {
    let chunks: Vec<Bytes> = store.get(archive_ref).await?.try_collect().await?;
    Ok(chunks.concat())
}

// ---------------------------------------------------------------------------
// Archive store
// ---------------------------------------------------------------------------

/// Run the archive store conformance test suite.
///
/// Call this from your backend's test module with a fresh, empty store.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_archive_conformance_tests(store: &dyn ArchiveStore) -> Result<(), BlobError> {
    test_archive_get_missing(store).await?;
    test_archive_round_trip(store).await?;
    test_archive_multi_chunk(store).await?;
    test_archive_empty(store).await?;
    test_archive_get_restarts(store).await?;
    test_archive_remove(store).await?;
    test_archive_list(store).await?;
    Ok(())
}

async fn test_archive_get_missing(store: &dyn ArchiveStore) -> Result<(), BlobError> {
    let missing = ArchiveRef::from("does-not-exist");
    assert!(
        matches!(store.get(&missing).await, Err(BlobError::NotFound(_))),
        "get on missing archive should return NotFound"
    );
    assert!(store.stat(&missing).await?.is_none());
    Ok(())
}

async fn test_archive_round_trip(store: &dyn ArchiveStore) -> Result<(), BlobError> {
    let data = b"small archive body".to_vec();
    let upload = ArchiveUpload::new("small.zip").with_metadata("session_id", "small");
    let header = store.put(upload, &mut data.as_slice()).await?;

    assert_eq!(header.length, data.len() as u64);
    assert_eq!(header.filename, "small.zip");
    assert_eq!(header.meta("session_id"), Some("small"));

    let stat = store.stat(&header.id).await?;
    assert_eq!(stat.as_ref().map(|h| h.length), Some(header.length));
    assert_eq!(collect(store, &header.id).await?, data);
    Ok(())
}

async fn test_archive_multi_chunk(store: &dyn ArchiveStore) -> Result<(), BlobError> {
    let len = store.chunk_size() * 3 + 17;
    let data = random_payload(len, 1);
    let header = store
        .put(ArchiveUpload::new("multi.zip"), &mut data.as_slice())
        .await?;

    assert_eq!(header.length, len as u64);
    assert_eq!(header.chunk_count(), 4, "three full chunks plus a tail");

    let chunks: Vec<Bytes> = store.get(&header.id).await?.try_collect().await?;
    assert_eq!(chunks.len(), 4);
    assert!(chunks[..3].iter().all(|c| c.len() == store.chunk_size()));
    assert_eq!(chunks[3].len(), 17);
    assert_eq!(chunks.concat(), data, "chunks must come back in order");
    Ok(())
}

async fn test_archive_empty(store: &dyn ArchiveStore) -> Result<(), BlobError> {
    let header = store
        .put(ArchiveUpload::new("empty.zip"), &mut &b""[..])
        .await?;
    assert_eq!(header.length, 0);
    assert!(collect(store, &header.id).await?.is_empty());
    Ok(())
}

async fn test_archive_get_restarts(store: &dyn ArchiveStore) -> Result<(), BlobError> {
    let data = random_payload(store.chunk_size() + 5, 2);
    let header = store
        .put(ArchiveUpload::new("again.zip"), &mut data.as_slice())
        .await?;
    assert_eq!(collect(store, &header.id).await?, data);
    assert_eq!(
        collect(store, &header.id).await?,
        data,
        "every get should start from the first chunk"
    );
    Ok(())
}

async fn test_archive_remove(store: &dyn ArchiveStore) -> Result<(), BlobError> {
    let data = random_payload(store.chunk_size() * 2, 3);
    let header = store
        .put(ArchiveUpload::new("gone.zip"), &mut data.as_slice())
        .await?;

    assert!(store.remove(&header.id).await?, "remove should report existing archive");
    assert!(store.stat(&header.id).await?.is_none());
    assert!(matches!(store.get(&header.id).await, Err(BlobError::NotFound(_))));
    assert!(
        !store.remove(&header.id).await?,
        "second remove should return false"
    );
    Ok(())
}

async fn test_archive_list(store: &dyn ArchiveStore) -> Result<(), BlobError> {
    let a = store
        .put(ArchiveUpload::new("list-a.zip"), &mut &b"a"[..])
        .await?;
    let b = store
        .put(ArchiveUpload::new("list-b.zip"), &mut &b"bb"[..])
        .await?;

    let listed = store.list().await?;
    let pos_a = listed.iter().position(|h| h.id == a.id);
    let pos_b = listed.iter().position(|h| h.id == b.id);
    assert!(pos_a.is_some() && pos_b.is_some(), "list should include new archives");
    assert!(pos_a < pos_b, "list should be oldest first");
    Ok(())
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Run the session ledger conformance test suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_ledger_conformance_tests(ledger: &dyn SessionLedger) -> Result<(), LedgerError> {
    test_ledger_find_missing(ledger).await?;
    test_ledger_upsert_insert(ledger).await?;
    test_ledger_upsert_replace(ledger).await?;
    test_ledger_delete(ledger).await?;
    test_ledger_list_ordered(ledger).await?;
    Ok(())
}

async fn test_ledger_find_missing(ledger: &dyn SessionLedger) -> Result<(), LedgerError> {
    assert!(ledger.find(&test_id("ledger-missing")).await?.is_none());
    Ok(())
}

async fn test_ledger_upsert_insert(ledger: &dyn SessionLedger) -> Result<(), LedgerError> {
    let id = test_id("ledger-insert");
    let record = ledger.upsert(&id, &ArchiveRef::from("ref-1"), 42).await?;
    assert_eq!(record.id, id);
    assert_eq!(record.size_bytes, 42);

    let found = ledger.find(&id).await?;
    assert_eq!(found.map(|r| r.archive_ref), Some(ArchiveRef::from("ref-1")));
    Ok(())
}

async fn test_ledger_upsert_replace(ledger: &dyn SessionLedger) -> Result<(), LedgerError> {
    let id = test_id("ledger-replace");
    let first = ledger.upsert(&id, &ArchiveRef::from("old"), 1).await?;
    let second = ledger.upsert(&id, &ArchiveRef::from("new"), 2).await?;

    assert_eq!(second.archive_ref, ArchiveRef::from("new"));
    assert_eq!(second.size_bytes, 2);
    assert_eq!(
        second.created_at.timestamp_micros(),
        first.created_at.timestamp_micros(),
        "created_at should survive a replace"
    );
    assert!(second.updated_at >= first.updated_at);

    let count = ledger.list().await?.iter().filter(|r| r.id == id).count();
    assert_eq!(count, 1, "at most one record per id");
    Ok(())
}

async fn test_ledger_delete(ledger: &dyn SessionLedger) -> Result<(), LedgerError> {
    let id = test_id("ledger-delete");
    ledger.upsert(&id, &ArchiveRef::from("x"), 3).await?;
    assert!(ledger.delete(&id).await?);
    assert!(ledger.find(&id).await?.is_none());
    assert!(!ledger.delete(&id).await?, "delete on missing record should return false");
    Ok(())
}

async fn test_ledger_list_ordered(ledger: &dyn SessionLedger) -> Result<(), LedgerError> {
    ledger.upsert(&test_id("ledger-z"), &ArchiveRef::from("z"), 1).await?;
    ledger.upsert(&test_id("ledger-a"), &ArchiveRef::from("a"), 1).await?;
    let ids: Vec<String> = ledger
        .list()
        .await?
        .into_iter()
        .map(|r| r.id.to_string())
        .collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted, "list should be ordered by id");
    Ok(())
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

/// Run the session store conformance test suite.
///
/// `scratch` must be an empty, writable directory.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_session_store_conformance_tests(
    store: &SessionStore,
    scratch: &Path,
) -> Result<(), PersistError> {
    test_session_round_trip(store, scratch).await?;
    test_session_save_missing_file(store, scratch).await?;
    test_session_extract_unknown(store, scratch).await?;
    test_session_double_save(store, scratch).await?;
    test_session_delete_idempotent(store, scratch).await?;
    test_session_extract_overwrites(store, scratch).await?;
    Ok(())
}

async fn write_archive(path: &Path, data: &[u8]) -> Result<(), PersistError> {
    tokio::fs::write(path, data)
        .await
        .map_err(|e| PersistError::ArchiveUnavailable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

async fn read_back(path: &Path) -> Result<Vec<u8>, PersistError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| PersistError::ReadFailure(e.to_string()))
}

async fn test_session_round_trip(store: &SessionStore, scratch: &Path) -> Result<(), PersistError> {
    let id = test_id("main");
    let source = scratch.join("main.zip");
    let data = random_payload(2 * 1024 * 1024, 42);
    write_archive(&source, &data).await?;

    assert!(!store.exists(&id).await, "exists should be false before save");
    assert!(store.save(&id, &source).await, "save should succeed");
    assert!(store.exists(&id).await, "exists should be true after save");

    let record = store.record(&id).await?;
    assert_eq!(record.map(|r| r.size_bytes), Some(data.len() as u64));

    let restored = scratch.join("restored").join("main.zip");
    assert!(store.extract(&id, &restored).await, "extract should succeed");
    assert_eq!(read_back(&restored).await?, data, "extracted bytes must match");

    assert!(store.delete(&id).await, "delete should succeed");
    assert!(!store.exists(&id).await, "exists should be false after delete");
    Ok(())
}

async fn test_session_save_missing_file(
    store: &SessionStore,
    scratch: &Path,
) -> Result<(), PersistError> {
    let id = test_id("ghost");
    assert!(!store.save(&id, &scratch.join("missing.zip")).await);
    assert!(!store.exists(&id).await, "failed save must not create a record");
    assert!(matches!(
        store.try_save(&id, &scratch.join("missing.zip")).await,
        Err(PersistError::ArchiveUnavailable { .. })
    ));
    Ok(())
}

async fn test_session_extract_unknown(
    store: &SessionStore,
    scratch: &Path,
) -> Result<(), PersistError> {
    let id = test_id("unknown");
    let dest = scratch.join("unknown.zip");
    assert!(!store.extract(&id, &dest).await);
    assert!(!dest.exists(), "extract of unknown session must not create a file");
    assert!(matches!(
        store.try_extract(&id, &dest).await,
        Err(PersistError::NotFound(_))
    ));
    Ok(())
}

async fn test_session_double_save(store: &SessionStore, scratch: &Path) -> Result<(), PersistError> {
    let id = test_id("twice");
    let source = scratch.join("twice.zip");

    write_archive(&source, b"first").await?;
    let first = store.try_save(&id, &source).await?;
    write_archive(&source, b"second version").await?;
    let second = store.try_save(&id, &source).await?;

    assert_ne!(first.archive_ref, second.archive_ref);

    let inventory = store.inventory().await?;
    let live: Vec<_> = inventory
        .archives
        .iter()
        .filter(|h| h.meta("session_id") == Some(id.as_str()))
        .collect();
    assert_eq!(live.len(), 1, "exactly one archive per session after re-save");
    assert_eq!(live[0].id, second.archive_ref);
    assert!(
        inventory.stray_chunks.is_empty(),
        "completed uploads must not leave headerless chunks"
    );

    let dest = scratch.join("twice-out.zip");
    store.try_extract(&id, &dest).await?;
    assert_eq!(read_back(&dest).await?, b"second version");

    store.try_delete(&id).await?;
    Ok(())
}

async fn test_session_delete_idempotent(
    store: &SessionStore,
    scratch: &Path,
) -> Result<(), PersistError> {
    let id = test_id("idem");
    let source = scratch.join("idem.zip");
    write_archive(&source, b"bytes").await?;
    assert!(store.save(&id, &source).await);

    assert!(store.delete(&id).await, "first delete should return true");
    assert!(!store.delete(&id).await, "second delete should return false");
    assert!(!store.try_delete(&id).await?);
    Ok(())
}

async fn test_session_extract_overwrites(
    store: &SessionStore,
    scratch: &Path,
) -> Result<(), PersistError> {
    let id = test_id("overwrite");
    let source = scratch.join("overwrite.zip");
    let dest = scratch.join("overwrite-out.zip");
    write_archive(&source, b"fresh archive").await?;
    write_archive(&dest, b"stale local copy that is longer").await?;

    assert!(store.save(&id, &source).await);
    assert!(store.extract(&id, &dest).await);
    assert_eq!(read_back(&dest).await?, b"fresh archive");

    let mut partial = dest.as_os_str().to_owned();
    partial.push(".partial");
    assert!(!Path::new(&partial).exists(), "partial file should be renamed away");

    store.try_delete(&id).await?;
    Ok(())
}
