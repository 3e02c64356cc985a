//! End-to-end tests of the base processors on the in-process backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio_test::assert_ok;

use basejobs_models::{ErrorCategory, EventData, Job, JobId, JobStatus, JobType};
use basejobs_queue::{
    FallbackBackend, JobCore, JobLogSink, JobProcessor, LocalEventBus, MemoryJobStore,
    MemoryLogStore, ProcessorError, ProcessorRegistry, ProgressHandle, QueueBackend, QueueConfig,
    QueueError, ValidationError,
};
use basejobs_worker::{
    build_registry, BaseRepository, BaseSnapshot, ColumnDef, ExportDocument, FileBaseRepository,
    LocalFileStorage, TableData,
};

struct Harness {
    backend: FallbackBackend,
    store: Arc<MemoryJobStore>,
    bases: Arc<FileBaseRepository>,
    _dir: TempDir,
}

fn backend_with(registry: ProcessorRegistry) -> (FallbackBackend, Arc<MemoryJobStore>) {
    backend_with_config(QueueConfig::default(), registry)
}

fn backend_with_config(
    config: QueueConfig,
    registry: ProcessorRegistry,
) -> (FallbackBackend, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::new());
    let logs = Arc::new(JobLogSink::new(
        Arc::new(MemoryLogStore::new()),
        Duration::from_millis(50),
    ));
    let core = JobCore::new(registry, store.clone(), Arc::new(LocalEventBus::new()), logs);
    (FallbackBackend::with_core(config, core), store)
}

fn harness() -> Harness {
    harness_with(QueueConfig::default())
}

fn harness_with(config: QueueConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let bases = Arc::new(FileBaseRepository::new(dir.path().join("bases")));
    let storage = Arc::new(LocalFileStorage::new(dir.path().join("exports"), None));
    let (backend, store) = backend_with_config(config, build_registry(bases.clone(), storage));

    Harness {
        backend,
        store,
        bases,
        _dir: dir,
    }
}

fn table(name: &str, rows: usize) -> TableData {
    TableData {
        name: name.to_string(),
        columns: vec![ColumnDef {
            name: "Title".to_string(),
            uidt: "SingleLineText".to_string(),
        }],
        rows: (0..rows)
            .map(|i| {
                let mut row = Map::new();
                row.insert("Title".to_string(), json!(format!("{} {}", name, i)));
                row
            })
            .collect(),
    }
}

async fn seed(bases: &FileBaseRepository, id: &str) -> BaseSnapshot {
    let mut base = BaseSnapshot::new(id, "Project tracker");
    base.merge_table(table("Tasks", 3));
    base.merge_table(table("People", 2));
    bases.save(&base).await.unwrap();
    base
}

async fn wait_terminal(backend: &FallbackBackend, id: &JobId) -> Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = backend.get_status(id).await.unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

#[tokio::test]
async fn test_export_completes_with_file_url() {
    let h = harness();
    seed(&h.bases, "b1").await;

    let id = assert_ok!(h.backend.enqueue("export", json!({"baseId": "b1"})).await);
    assert_eq!(h.backend.get_status(&id).await.unwrap().status, JobStatus::Waiting);

    h.backend.start().await.unwrap();
    let job = wait_terminal(&h.backend, &id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 1.0);
    assert!(job.error.is_none());
    let result = job.result.unwrap();
    assert_eq!(result["tables"], 2);
    assert_eq!(result["rows"], 5);

    let url = result["fileUrl"].as_str().unwrap();
    let path = url.strip_prefix("file://").unwrap();
    let document: ExportDocument = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(document.version, 1);
    assert_eq!(document.base.id, "b1");

    let logs = h.backend.get_logs(&id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("Exported table Tasks")));

    h.backend.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_exports_get_their_own_files() {
    let h = harness_with(QueueConfig {
        concurrency: 4,
        ..QueueConfig::default()
    });
    seed(&h.bases, "b1").await;
    h.backend.start().await.unwrap();

    let mut jobs = Vec::new();
    for i in 0..40 {
        let table = if i % 2 == 0 { "Tasks" } else { "People" };
        let id = h
            .backend
            .enqueue("export", json!({"baseId": "b1", "tables": [table]}))
            .await
            .unwrap();
        jobs.push((id, table));
    }

    let mut urls = std::collections::HashSet::new();
    for (id, table) in &jobs {
        let job = wait_terminal(&h.backend, id).await;
        assert_eq!(job.status, JobStatus::Completed);

        let url = job.result.unwrap()["fileUrl"].as_str().unwrap().to_string();
        let path = url.strip_prefix("file://").unwrap();
        let document: ExportDocument = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        let names: Vec<_> = document.base.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec![*table]);
        assert!(urls.insert(url));
    }
    assert_eq!(urls.len(), jobs.len());

    h.backend.shutdown().await;
}

#[tokio::test]
async fn test_export_of_selected_tables_and_import_round_trip() {
    let h = harness();
    seed(&h.bases, "b1").await;
    h.backend.start().await.unwrap();

    let export = h
        .backend
        .enqueue("export", json!({"baseId": "b1", "tables": ["Tasks"]}))
        .await
        .unwrap();
    let job = wait_terminal(&h.backend, &export).await;
    let url = job.result.unwrap()["fileUrl"].as_str().unwrap().to_string();
    let file = std::fs::read_to_string(url.strip_prefix("file://").unwrap()).unwrap();

    let import = h
        .backend
        .enqueue("import", json!({"baseId": "b2", "file": file}))
        .await
        .unwrap();
    let job = wait_terminal(&h.backend, &import).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"baseId": "b2", "tables": 1, "rows": 3})));

    let imported = h.bases.load("b2").await.unwrap();
    assert_eq!(imported.tables.len(), 1);
    assert_eq!(imported.tables[0].name, "Tasks");

    h.backend.shutdown().await;
}

#[tokio::test]
async fn test_malformed_import_fails_with_processor_error() {
    let h = harness();
    h.backend.start().await.unwrap();

    let id = h
        .backend
        .enqueue("import", json!({"baseId": "b1", "file": "{not json"}))
        .await
        .unwrap();
    let job = wait_terminal(&h.backend, &id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.result.is_none());
    let error = job.error.unwrap();
    assert_eq!(error.category, ErrorCategory::ProcessorError);
    assert!(error.message.contains("Malformed export document"));

    let logs = h.backend.get_logs(&id).await.unwrap();
    assert!(logs.last().unwrap().message.starts_with("Job failed"));

    h.backend.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_without_data() {
    let h = harness();
    seed(&h.bases, "b1").await;
    h.backend.start().await.unwrap();

    let id = h
        .backend
        .enqueue("duplicate", json!({"baseId": "b1", "excludeData": true, "title": "Empty copy"}))
        .await
        .unwrap();
    let job = wait_terminal(&h.backend, &id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let result = job.result.unwrap();
    assert_eq!(result["sourceBaseId"], "b1");
    let copy = h.bases.load(result["baseId"].as_str().unwrap()).await.unwrap();
    assert_eq!(copy.title, "Empty copy");
    assert_eq!(copy.tables.len(), 2);
    assert_eq!(copy.row_count(), 0);

    h.backend.shutdown().await;
}

#[tokio::test]
async fn test_rejected_enqueues_create_no_records() {
    let h = harness();

    let err = h.backend.enqueue("compress", json!({"baseId": "b1"})).await.unwrap_err();
    assert!(matches!(err, QueueError::UnknownJobType(_)));

    let err = h.backend.enqueue("export", json!({"tables": ["Tasks"]})).await.unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));

    let err = h
        .backend
        .enqueue("duplicate", json!({"baseId": "b1", "excludeData": "no"}))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));

    assert!(h.store.is_empty().await);

    let err = h.backend.get_status(&JobId::from_string("missing")).await.unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(_)));
}

/// Reports fixed progress steps and records the order jobs ran in.
struct SteppingProcessor {
    ran: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobProcessor for SteppingProcessor {
    fn job_type(&self) -> JobType {
        JobType::Export
    }

    fn validate(&self, _payload: &Value) -> Result<(), ValidationError> {
        Ok(())
    }

    async fn run(&self, payload: Value, progress: ProgressHandle) -> Result<Value, ProcessorError> {
        self.ran
            .lock()
            .unwrap()
            .push(payload["baseId"].as_str().unwrap_or_default().to_string());
        for step in [0.1, 0.5, 0.9] {
            progress.progress(step).await;
            tokio::task::yield_now().await;
        }
        Ok(json!({"ok": true}))
    }
}

fn stepping_backend() -> (FallbackBackend, Arc<Mutex<Vec<String>>>) {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let registry = ProcessorRegistry::new().register(Arc::new(SteppingProcessor { ran: ran.clone() }));
    let (backend, _store) = backend_with(registry);
    (backend, ran)
}

#[tokio::test]
async fn test_progress_events_precede_terminal_event() {
    let (backend, _ran) = stepping_backend();
    let mut events = backend.subscribe_events(Box::new(|_| true)).await.unwrap();

    let id = backend.enqueue("export", json!({"baseId": "b1"})).await.unwrap();
    backend.start().await.unwrap();

    let mut progress = Vec::new();
    let mut statuses = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job_id, id);
        match event.data {
            EventData::Progress { value } => progress.push(value),
            EventData::Status => statuses.push(event.status),
            EventData::Completed { .. } => break,
            other => panic!("unexpected event data: {:?}", other),
        }
    }

    assert_eq!(progress, vec![0.1, 0.5, 0.9]);
    assert_eq!(statuses, vec![JobStatus::Waiting, JobStatus::Active]);

    backend.shutdown().await;
}

#[tokio::test]
async fn test_room_subscription_only_sees_its_jobs() {
    let (backend, _ran) = stepping_backend();
    let mut room_a = backend
        .subscribe_events(Box::new(|e| e.owner_context.as_str() == "a"))
        .await
        .unwrap();

    let b = backend.enqueue("export", json!({"baseId": "b"})).await.unwrap();
    let a = backend.enqueue("export", json!({"baseId": "a"})).await.unwrap();
    backend.start().await.unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), room_a.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job_id, a);
        assert_ne!(event.job_id, b);
        if event.is_terminal() {
            break;
        }
    }

    room_a.close();
    backend.shutdown().await;
}

#[tokio::test]
async fn test_single_worker_runs_jobs_in_enqueue_order() {
    let (backend, ran) = stepping_backend();

    let mut ids = Vec::new();
    for base in ["first", "second", "third"] {
        ids.push(backend.enqueue("export", json!({"baseId": base})).await.unwrap());
    }
    backend.start().await.unwrap();

    for id in &ids {
        wait_terminal(&backend, id).await;
    }
    assert_eq!(*ran.lock().unwrap(), vec!["first", "second", "third"]);

    backend.shutdown().await;
}
