use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use tether_core::{ArchiveRef, SessionId, SessionRecord, StoreEvent};
use tether_store::archive::{
    ArchiveHeader, ArchiveStore, ArchiveStream, ArchiveUpload, StrayChunks, read_chunk,
};
use tether_store::error::{BlobError, LedgerError, PersistError};
use tether_store::ledger::SessionLedger;
use tether_store::store::SessionStore;
use tether_store::testing::{random_payload, run_session_store_conformance_tests};
use tether_store_memory::{MemoryArchiveStore, MemorySessionLedger};

fn id(s: &str) -> SessionId {
    SessionId::parse(s).unwrap()
}

fn memory_store(chunk_size: usize) -> SessionStore {
    SessionStore::new(
        Arc::new(MemoryArchiveStore::with_chunk_size(chunk_size)),
        Arc::new(MemorySessionLedger::new()),
    )
}

/// Archive store that can be told to reject writes after the first chunk or
/// to fail removals, and that can pretend an upload died mid-way.
struct FlakyArchives {
    inner: MemoryArchiveStore,
    fail_writes: AtomicBool,
    fail_removes: AtomicBool,
    stray: AtomicU64,
}

impl FlakyArchives {
    fn new(chunk_size: usize) -> Self {
        Self {
            inner: MemoryArchiveStore::with_chunk_size(chunk_size),
            fail_writes: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
            stray: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ArchiveStore for FlakyArchives {
    fn chunk_size(&self) -> usize {
        self.inner.chunk_size()
    }

    async fn put(
        &self,
        upload: ArchiveUpload,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ArchiveHeader, BlobError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            read_chunk(reader, self.chunk_size())
                .await
                .map_err(|e| BlobError::Write(e.to_string()))?;
            return Err(BlobError::Write("chunk 1 rejected".into()));
        }
        self.inner.put(upload, reader).await
    }

    async fn get(&self, archive_ref: &ArchiveRef) -> Result<ArchiveStream, BlobError> {
        self.inner.get(archive_ref).await
    }

    async fn stat(&self, archive_ref: &ArchiveRef) -> Result<Option<ArchiveHeader>, BlobError> {
        self.inner.stat(archive_ref).await
    }

    async fn remove(&self, archive_ref: &ArchiveRef) -> Result<bool, BlobError> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(BlobError::Connection("connection reset".into()));
        }
        self.inner.remove(archive_ref).await
    }

    async fn list(&self) -> Result<Vec<ArchiveHeader>, BlobError> {
        self.inner.list().await
    }

    async fn stray_chunks(&self) -> Result<Vec<StrayChunks>, BlobError> {
        let chunks = self.stray.load(Ordering::SeqCst);
        if chunks == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![StrayChunks {
            files_id: ArchiveRef::new("crashed-upload"),
            chunks,
            bytes: chunks * self.chunk_size() as u64,
        }])
    }

    async fn discard_stray_chunks(&self) -> Result<u64, BlobError> {
        Ok(self.stray.swap(0, Ordering::SeqCst))
    }
}

/// Ledger whose lookups or upserts can be made to fail.
struct FlakyLedger {
    inner: MemorySessionLedger,
    fail_finds: AtomicBool,
    fail_upserts: AtomicBool,
}

impl FlakyLedger {
    fn new() -> Self {
        Self {
            inner: MemorySessionLedger::new(),
            fail_finds: AtomicBool::new(false),
            fail_upserts: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SessionLedger for FlakyLedger {
    async fn find(&self, id: &SessionId) -> Result<Option<SessionRecord>, LedgerError> {
        if self.fail_finds.load(Ordering::SeqCst) {
            return Err(LedgerError::Connection("ledger unreachable".into()));
        }
        self.inner.find(id).await
    }

    async fn upsert(
        &self,
        id: &SessionId,
        archive_ref: &ArchiveRef,
        size_bytes: u64,
    ) -> Result<SessionRecord, LedgerError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(LedgerError::Backend("write conflict".into()));
        }
        self.inner.upsert(id, archive_ref, size_bytes).await
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, LedgerError> {
        self.inner.delete(id).await
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, LedgerError> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn conformance_small_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = memory_store(4096);
    run_session_store_conformance_tests(&store, dir.path())
        .await
        .expect("conformance tests should pass");
}

#[tokio::test]
async fn conformance_default_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(
        Arc::new(MemoryArchiveStore::new()),
        Arc::new(MemorySessionLedger::new()),
    );
    run_session_store_conformance_tests(&store, dir.path())
        .await
        .expect("conformance tests should pass");
}

#[tokio::test]
async fn failed_chunk_write_leaves_no_header_and_no_record() {
    let dir = tempfile::tempdir().unwrap();
    let archives = Arc::new(FlakyArchives::new(1024));
    archives.fail_writes.store(true, Ordering::SeqCst);
    let store = SessionStore::new(archives.clone(), Arc::new(MemorySessionLedger::new()));

    let source = dir.path().join("main.zip");
    tokio::fs::write(&source, random_payload(10 * 1024, 9)).await.unwrap();

    assert!(!store.save(&id("main"), &source).await);
    assert!(matches!(
        store.try_save(&id("main"), &source).await,
        Err(PersistError::WriteFailure(_))
    ));
    assert!(!store.exists(&id("main")).await);
    assert!(archives.list().await.unwrap().is_empty());

    // The next periodic save succeeds once the backend recovers.
    archives.fail_writes.store(false, Ordering::SeqCst);
    assert!(store.save(&id("main"), &source).await);
    assert!(store.exists(&id("main")).await);

    // A failed re-save drops the old session instead of leaving a record
    // that points at the already removed archive.
    archives.fail_writes.store(true, Ordering::SeqCst);
    assert!(!store.save(&id("main"), &source).await);
    assert!(!store.exists(&id("main")).await);
    assert!(archives.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_record_write_removes_fresh_archive() {
    let dir = tempfile::tempdir().unwrap();
    let archives = Arc::new(MemoryArchiveStore::new());
    let ledger = Arc::new(FlakyLedger::new());
    ledger.fail_upserts.store(true, Ordering::SeqCst);
    let store = SessionStore::new(archives.clone(), ledger);

    let source = dir.path().join("main.zip");
    tokio::fs::write(&source, b"archive").await.unwrap();

    assert!(matches!(
        store.try_save(&id("main"), &source).await,
        Err(PersistError::WriteFailure(_))
    ));
    assert!(archives.is_empty(), "uploaded archive should be cleaned up");
    assert!(!store.exists(&id("main")).await);
}

#[tokio::test]
async fn failed_removal_of_previous_archive_keeps_old_session() {
    let dir = tempfile::tempdir().unwrap();
    let archives = Arc::new(FlakyArchives::new(1024));
    let store = SessionStore::new(archives.clone(), Arc::new(MemorySessionLedger::new()));

    let source = dir.path().join("main.zip");
    tokio::fs::write(&source, b"first").await.unwrap();
    let first = store.try_save(&id("main"), &source).await.unwrap();

    archives.fail_removes.store(true, Ordering::SeqCst);
    tokio::fs::write(&source, b"second").await.unwrap();
    assert!(!store.save(&id("main"), &source).await);
    assert!(matches!(
        store.try_save(&id("main"), &source).await,
        Err(PersistError::WriteFailure(_))
    ));

    let inventory = store.inventory().await.unwrap();
    assert_eq!(inventory.archives.len(), 1, "no second archive uploaded");
    assert!(inventory.orphans.is_empty());
    let record = store.record(&id("main")).await.unwrap().unwrap();
    assert_eq!(record.archive_ref, first.archive_ref);

    let dest = dir.path().join("out.zip");
    assert!(store.extract(&id("main"), &dest).await);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"first");

    archives.fail_removes.store(false, Ordering::SeqCst);
    assert!(store.save(&id("main"), &source).await);
    let inventory = store.inventory().await.unwrap();
    assert_eq!(inventory.archives.len(), 1);
    assert!(inventory.orphans.is_empty());
}

#[tokio::test]
async fn ledger_lookup_failure_reads_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let archives = Arc::new(MemoryArchiveStore::new());
    let ledger = Arc::new(FlakyLedger::new());
    let store = SessionStore::new(archives.clone(), ledger.clone());

    let source = dir.path().join("main.zip");
    tokio::fs::write(&source, b"archive").await.unwrap();
    assert!(store.save(&id("main"), &source).await);

    ledger.fail_finds.store(true, Ordering::SeqCst);
    let dest = dir.path().join("restore").join("main.zip");

    assert!(!store.exists(&id("main")).await);
    assert!(!store.extract(&id("main"), &dest).await);
    assert!(!store.delete(&id("main")).await);

    assert!(matches!(
        store.try_exists(&id("main")).await,
        Err(PersistError::Ledger(_))
    ));
    assert!(!dest.exists(), "extract must not write when the lookup fails");
    assert!(!dir.path().join("restore").join("main.zip.partial").exists());

    // Nothing was touched while the ledger was down.
    ledger.fail_finds.store(false, Ordering::SeqCst);
    assert!(store.exists(&id("main")).await);
    assert_eq!(archives.len(), 1);
}

#[tokio::test]
async fn save_replaces_and_keeps_created_at() {
    let dir = tempfile::tempdir().unwrap();
    let store = memory_store(1024);
    let source = dir.path().join("main.zip");

    tokio::fs::write(&source, b"v1").await.unwrap();
    let first = store.try_save(&id("main"), &source).await.unwrap();
    tokio::fs::write(&source, b"version two").await.unwrap();
    let second = store.try_save(&id("main"), &source).await.unwrap();

    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at >= first.updated_at);
    assert_eq!(second.size_bytes, 11);
    assert!(store.archives().stat(&first.archive_ref).await.unwrap().is_none());
}

#[tokio::test]
async fn extract_with_missing_archive_reports_read_failure() {
    let dir = tempfile::tempdir().unwrap();
    let archives = Arc::new(MemoryArchiveStore::new());
    let ledger = Arc::new(MemorySessionLedger::new());
    let store = SessionStore::new(archives.clone(), ledger.clone());

    let source = dir.path().join("main.zip");
    tokio::fs::write(&source, b"archive").await.unwrap();
    let record = store.try_save(&id("main"), &source).await.unwrap();
    archives.remove(&record.archive_ref).await.unwrap();

    let dest = dir.path().join("out.zip");
    assert!(matches!(
        store.try_extract(&id("main"), &dest).await,
        Err(PersistError::ReadFailure(_))
    ));
    assert!(!dest.exists());

    let inventory = store.inventory().await.unwrap();
    assert_eq!(inventory.dangling, vec![id("main")]);

    // Delete still clears the record even though the archive is gone.
    assert!(store.delete(&id("main")).await);
    assert!(ledger.find(&id("main")).await.unwrap().is_none());
}

#[tokio::test]
async fn events_follow_successful_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let store = memory_store(1024);
    let mut events = store.subscribe();

    let source = dir.path().join("main.zip");
    tokio::fs::write(&source, b"archive").await.unwrap();

    assert!(store.save(&id("main"), &source).await);
    assert!(store.extract(&id("main"), &dir.path().join("out.zip")).await);
    assert!(store.delete(&id("main")).await);
    assert!(!store.delete(&id("main")).await);

    match events.recv().await.unwrap() {
        StoreEvent::ArchivePersisted { size_bytes, .. } => assert_eq!(size_bytes, 7),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        events.recv().await.unwrap(),
        StoreEvent::ArchiveRestored { size_bytes: 7, .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        StoreEvent::ArchiveDeleted { .. }
    ));
    assert!(events.try_recv().is_err(), "no event for a no-op delete");
}

#[tokio::test]
async fn inventory_and_purge() {
    let dir = tempfile::tempdir().unwrap();
    let archives = Arc::new(MemoryArchiveStore::new());
    let store = SessionStore::new(archives.clone(), Arc::new(MemorySessionLedger::new()));

    for name in ["alpha", "beta"] {
        let source = dir.path().join(format!("{name}.zip"));
        tokio::fs::write(&source, name.as_bytes()).await.unwrap();
        assert!(store.save(&id(name), &source).await);
    }
    let orphan = archives
        .put(ArchiveUpload::new("stray.zip"), &mut &b"stray"[..])
        .await
        .unwrap();

    let inventory = store.inventory().await.unwrap();
    assert_eq!(inventory.records.len(), 2);
    assert_eq!(inventory.archives.len(), 3);
    assert_eq!(inventory.orphans.len(), 1);
    assert_eq!(inventory.orphans[0].id, orphan.id);
    assert_eq!(inventory.total_bytes, 5 + 4 + 5);

    assert_eq!(store.purge().await.unwrap(), 3);
    assert!(archives.is_empty());
    assert!(!store.exists(&id("alpha")).await);
    assert!(!store.exists(&id("beta")).await);
}

#[tokio::test]
async fn inventory_reports_and_purge_clears_stray_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let archives = Arc::new(FlakyArchives::new(1024));
    let store = SessionStore::new(archives.clone(), Arc::new(MemorySessionLedger::new()));

    let source = dir.path().join("main.zip");
    tokio::fs::write(&source, b"archive").await.unwrap();
    assert!(store.save(&id("main"), &source).await);
    archives.stray.store(3, Ordering::SeqCst);

    let inventory = store.inventory().await.unwrap();
    assert_eq!(inventory.stray_chunks.len(), 1);
    assert_eq!(inventory.stray_chunks[0].chunks, 3);
    assert_eq!(inventory.stray_chunks[0].bytes, 3 * 1024);
    assert!(inventory.orphans.is_empty(), "stray chunks are not orphaned archives");

    assert_eq!(store.purge().await.unwrap(), 1);
    let inventory = store.inventory().await.unwrap();
    assert!(inventory.stray_chunks.is_empty());
    assert!(inventory.archives.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_saves_and_deletes_never_leak_archives() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(memory_store(512));

    let mut tasks = Vec::new();
    for i in 0..16u64 {
        let store = Arc::clone(&store);
        let source = dir.path().join(format!("main-{i}.zip"));
        tokio::fs::write(&source, random_payload(2048, i)).await.unwrap();
        tasks.push(tokio::spawn(async move {
            if i % 3 == 0 {
                store.delete(&id("main")).await;
            } else {
                assert!(store.save(&id("main"), &source).await);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let inventory = store.inventory().await.unwrap();
    assert!(inventory.orphans.is_empty(), "no archive may be orphaned");
    assert!(inventory.dangling.is_empty());
    assert!(inventory.archives.len() <= 1);
    assert_eq!(inventory.records.len(), inventory.archives.len());
}
