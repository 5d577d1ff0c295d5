use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cslb_adapters::load_lookup_tables;
use cslb_core::{CanonicalRecord, Phase, ProgressReporter, RunStatus, RunSummary};
use cslb_storage::{
    DecodeError, FetchError, LocalSnapshot, MemoryUpsertSink, SinkError, SnapshotSource,
    UpsertSink,
};
use cslb_sync::{CollectError, Collector, CollectorConfig};
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

const HEADER: &str = "LicenseNo,ZIPCode,FullBusinessName,BusinessName,MailingAddress,City,State,IssueDate,BusinessPhone,ExpirationDate,PrimaryStatus,Classifications(s)";

const ROWS: &[&str] = &[
    "A100,94101-1234,Acme Builders,,1 Main St,San Francisco,CA,01/02/2000,4155550100,01/31/2027,Active,B",
    "A101,94102,,Bolt Electric,2 Market St,San Francisco,CA,03/04/2010,4155550101,03/31/2026,Active,C10",
    "A102,90001,Coast Roofing,,3 Pier Rd,Los Angeles,CA,05/06/2015,3105550102,05/31/2026,Expired,C39",
    "A103,99999,Nowhere Inc,,4 Lost Ln,Somewhere,CA,07/08/2018,,07/31/2026,Active,B",
    ",94101,No License LLC,,5 Blank Ave,San Francisco,CA,,,,Active,B",
];

#[derive(Default)]
struct RecordingReporter {
    phases: Mutex<Vec<Phase>>,
    errors: Mutex<Vec<String>>,
    processed: AtomicUsize,
    summaries: Mutex<Vec<RunSummary>>,
}

impl RecordingReporter {
    fn phases(&self) -> Vec<Phase> {
        self.phases.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn phase(&self, phase: Phase, _detail: &str) {
        self.phases.lock().unwrap().push(phase);
    }

    fn record_processed(&self, n: usize) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    fn error(&self, error: &(dyn std::error::Error + 'static), context: &str) {
        self.errors
            .lock()
            .unwrap()
            .push(format!("{context}: {error}"));
    }

    fn summary(&self, summary: &RunSummary) {
        self.summaries.lock().unwrap().push(summary.clone());
    }
}

/// Memory sink that can be told to fail one staging batch, the merge, or the ping.
#[derive(Default)]
struct FlakySink {
    inner: MemoryUpsertSink,
    fail_batch: Option<usize>,
    fail_merge: bool,
    fail_ping: bool,
    batches: AtomicUsize,
}

#[async_trait]
impl UpsertSink for FlakySink {
    async fn ping(&self) -> Result<(), SinkError> {
        if self.fail_ping {
            return Err(SinkError::Rejected("connection refused".into()));
        }
        self.inner.ping().await
    }

    async fn clear_staging(&self) -> Result<(), SinkError> {
        self.inner.clear_staging().await
    }

    async fn stage_batch(&self, batch: &[CanonicalRecord]) -> Result<u64, SinkError> {
        let index = self.batches.fetch_add(1, Ordering::SeqCst);
        if self.fail_batch == Some(index) {
            return Err(SinkError::Rejected(format!("value too long in batch {index}")));
        }
        self.inner.stage_batch(batch).await
    }

    async fn merge(&self) -> Result<u64, SinkError> {
        if self.fail_merge {
            return Err(SinkError::Rejected("deadlock detected".into()));
        }
        self.inner.merge().await
    }

    async fn close(&self) {}
}

/// Memory sink that requests cancellation while staging its first batch.
struct CancellingSink {
    inner: MemoryUpsertSink,
    cancel: CancellationToken,
    batches: AtomicUsize,
    merges: AtomicUsize,
}

#[async_trait]
impl UpsertSink for CancellingSink {
    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn clear_staging(&self) -> Result<(), SinkError> {
        self.inner.clear_staging().await
    }

    async fn stage_batch(&self, batch: &[CanonicalRecord]) -> Result<u64, SinkError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        self.inner.stage_batch(batch).await
    }

    async fn merge(&self) -> Result<u64, SinkError> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        self.inner.merge().await
    }

    async fn close(&self) {}
}

struct BrokenSource {
    fetches: Arc<AtomicUsize>,
    error: fn() -> FetchError,
}

#[async_trait]
impl SnapshotSource for BrokenSource {
    fn describe(&self) -> String {
        "broken source".to_string()
    }

    async fn fetch_snapshot(&self) -> Result<PathBuf, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

struct Fixture {
    dir: TempDir,
    config: CollectorConfig,
    snapshot: PathBuf,
}

impl Fixture {
    fn new(rows: &[&str]) -> Self {
        let dir = tempdir().unwrap();
        let mut config = CollectorConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.batch_size = 2;

        let zips = config.postal_map_path();
        let agencies = config.agency_map_path();
        fs::create_dir_all(zips.parent().unwrap()).unwrap();
        fs::create_dir_all(agencies.parent().unwrap()).unwrap();
        fs::write(&zips, "94101,1116\n94102,1116\n90001,1216\n").unwrap();
        fs::write(&agencies, "\u{feff}1116,117\n1216,118\n").unwrap();

        let snapshot = dir.path().join("master.csv");
        let mut body = String::from(HEADER);
        for row in rows {
            body.push('\n');
            body.push_str(row);
        }
        body.push('\n');
        fs::write(&snapshot, body).unwrap();

        Self {
            dir,
            config,
            snapshot,
        }
    }

    fn collector(
        &self,
        sink: Arc<dyn UpsertSink>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Collector {
        self.collector_with_source(Box::new(LocalSnapshot::new(&self.snapshot)), sink, reporter)
    }

    fn collector_with_source(
        &self,
        source: Box<dyn SnapshotSource>,
        sink: Arc<dyn UpsertSink>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Collector {
        let tables = load_lookup_tables(
            &self.config.postal_map_path(),
            &self.config.agency_map_path(),
        )
        .unwrap();
        Collector::new(self.config.clone(), tables, source, sink, reporter)
    }

    fn output(&self) -> &Path {
        self.dir.path()
    }
}

#[tokio::test]
async fn full_run_resolves_stages_and_merges() {
    let fixture = Fixture::new(ROWS);
    let sink = Arc::new(MemoryUpsertSink::new());
    let reporter = Arc::new(RecordingReporter::default());

    let summary = fixture
        .collector(sink.clone(), reporter.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rows_seen, 5);
    assert_eq!(summary.valid_records, 3);
    assert_eq!(summary.skipped.no_affiliate, 1);
    assert_eq!(summary.skipped.invalid_license, 1);
    assert_eq!(summary.unresolved_postal_codes, vec!["99999".to_string()]);
    assert_eq!(summary.staged, 3);
    assert_eq!(summary.merged, 3);
    assert!(summary.failed_batches.is_empty());
    assert_eq!(reporter.processed.load(Ordering::Relaxed), 5);

    let acme = sink.get("117A100").unwrap();
    assert_eq!(acme.business_name, "Acme Builders");
    assert_eq!(acme.zip, "94101-1234");
    assert_eq!(acme.affiliate_id, "1116");
    assert_eq!(
        acme.source_url,
        "https://www2.cslb.ca.gov/OnlineServices/CheckLicenseII/LicenseDetail.aspx?LicNum=A100"
    );
    assert_eq!(sink.get("117A101").unwrap().business_name, "Bolt Electric");
    assert_eq!(sink.get("118A102").unwrap().agency_id, "118");

    assert_eq!(
        reporter.phases(),
        vec![
            Phase::Config,
            Phase::Collect,
            Phase::Process,
            Phase::Upload,
            Phase::Merge,
            Phase::Cleanup,
            Phase::Complete,
        ]
    );
    assert_eq!(reporter.summaries.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn run_writes_unknown_postal_codes_and_summary() {
    let fixture = Fixture::new(ROWS);
    let summary = fixture
        .collector(
            Arc::new(MemoryUpsertSink::new()),
            Arc::new(RecordingReporter::default()),
        )
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let output = fixture.output().join("output");
    let unknown = fs::read_to_string(output.join("unknown_zips.txt")).unwrap();
    assert_eq!(unknown, "99999");

    let written = fs::read(output.join("runs").join(format!("{}.json", summary.run_id))).unwrap();
    let parsed: RunSummary = serde_json::from_slice(&written).unwrap();
    assert_eq!(parsed.status, RunStatus::Completed);
    assert_eq!(parsed.merged, 3);
    assert_eq!(
        parsed.snapshot_path.as_deref(),
        Some(fixture.snapshot.display().to_string().as_str())
    );
}

#[tokio::test]
async fn rerunning_the_same_snapshot_leaves_the_same_rows() {
    let fixture = Fixture::new(ROWS);
    let sink = Arc::new(MemoryUpsertSink::new());

    for _ in 0..2 {
        fixture
            .collector(sink.clone(), Arc::new(RecordingReporter::default()))
            .run(&CancellationToken::new())
            .await
            .unwrap();
    }
    let twice = sink.permanent_records();

    let fresh = Arc::new(MemoryUpsertSink::new());
    fixture
        .collector(fresh.clone(), Arc::new(RecordingReporter::default()))
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(twice, fresh.permanent_records());
    assert_eq!(twice.len(), 3);
}

#[tokio::test]
async fn failed_batch_is_recorded_and_the_rest_merges() {
    let fixture = Fixture::new(ROWS);
    let sink = Arc::new(FlakySink {
        fail_batch: Some(1),
        ..Default::default()
    });
    let reporter = Arc::new(RecordingReporter::default());

    let summary = fixture
        .collector(sink.clone(), reporter.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::PartiallyCompleted);
    assert_eq!(summary.staged, 2);
    assert_eq!(summary.failed_records, 1);
    assert_eq!(summary.failed_batches.len(), 1);
    let failure = &summary.failed_batches[0];
    assert_eq!((failure.index, failure.offset, failure.len), (1, 2, 1));
    assert!(failure.error.contains("value too long"));
    assert_eq!(summary.merged, 2);
    assert_eq!(sink.inner.permanent_len(), 2);

    let errors = reporter.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("staging batch 1"));
}

#[tokio::test]
async fn failed_merge_is_fatal_and_clears_staging() {
    let fixture = Fixture::new(ROWS);
    let sink = Arc::new(FlakySink {
        fail_merge: true,
        ..Default::default()
    });
    let reporter = Arc::new(RecordingReporter::default());

    let err = fixture
        .collector(sink.clone(), reporter.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CollectError::Merge(_)));
    assert_eq!(sink.inner.staged_len(), 0);
    assert_eq!(sink.inner.permanent_len(), 0);
    assert_eq!(reporter.phases().last(), Some(&Phase::Error));
    assert!(reporter.summaries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_database_stops_before_fetching() {
    let fixture = Fixture::new(ROWS);
    let fetches = Arc::new(AtomicUsize::new(0));
    let source = BrokenSource {
        fetches: fetches.clone(),
        error: || FetchError::HttpStatus {
            status: 500,
            url: "http://unused.test".into(),
        },
    };
    let sink = Arc::new(FlakySink {
        fail_ping: true,
        ..Default::default()
    });

    let err = fixture
        .collector_with_source(
            Box::new(source),
            sink,
            Arc::new(RecordingReporter::default()),
        )
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CollectError::Sink(_)));
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn transport_and_decode_failures_are_distinguished() {
    let fixture = Fixture::new(ROWS);

    let transport = fixture
        .collector_with_source(
            Box::new(BrokenSource {
                fetches: Arc::default(),
                error: || FetchError::HttpStatus {
                    status: 503,
                    url: "http://cslb.test".into(),
                },
            }),
            Arc::new(MemoryUpsertSink::new()),
            Arc::new(RecordingReporter::default()),
        )
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(transport, CollectError::Transport(_)));

    let sink = Arc::new(MemoryUpsertSink::new());
    let reporter = Arc::new(RecordingReporter::default());
    let decode = fixture
        .collector_with_source(
            Box::new(BrokenSource {
                fetches: Arc::default(),
                error: || FetchError::Decode(DecodeError::EnvelopeMismatch("prefix")),
            }),
            sink.clone(),
            reporter.clone(),
        )
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(decode, CollectError::Decode(_)));
    assert_eq!(sink.permanent_len(), 0);
    assert_eq!(reporter.errors().len(), 1);
}

#[tokio::test]
async fn cancelled_run_stages_nothing_and_skips_the_merge() {
    let fixture = Fixture::new(ROWS);
    let sink = Arc::new(MemoryUpsertSink::new());
    let reporter = Arc::new(RecordingReporter::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = fixture
        .collector(sink.clone(), reporter.clone())
        .run(&cancel)
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.valid_records, 3);
    assert_eq!(summary.staged, 0);
    assert_eq!(summary.merged, 0);
    assert_eq!(sink.permanent_len(), 0);
    assert_eq!(reporter.phases().last(), Some(&Phase::Cancelled));
    assert!(!reporter.phases().contains(&Phase::Merge));
}

#[tokio::test]
async fn snapshot_with_no_valid_rows_completes_without_uploading() {
    let fixture = Fixture::new(&[ROWS[3], ROWS[4]]);
    let sink = Arc::new(MemoryUpsertSink::new());
    let reporter = Arc::new(RecordingReporter::default());

    let summary = fixture
        .collector(sink.clone(), reporter.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.valid_records, 0);
    assert_eq!(summary.skipped.total(), 2);
    assert_eq!(summary.merged, 0);
    assert!(!reporter.phases().contains(&Phase::Upload));
}

#[tokio::test]
async fn cancellation_during_a_batch_stops_before_the_next_one() {
    let fixture = Fixture::new(ROWS);
    let cancel = CancellationToken::new();
    let sink = Arc::new(CancellingSink {
        inner: MemoryUpsertSink::new(),
        cancel: cancel.clone(),
        batches: AtomicUsize::new(0),
        merges: AtomicUsize::new(0),
    });
    let reporter = Arc::new(RecordingReporter::default());

    let summary = fixture
        .collector(sink.clone(), reporter.clone())
        .run(&cancel)
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(sink.batches.load(Ordering::SeqCst), 1);
    assert_eq!(summary.staged, 2);
    assert_eq!(sink.inner.staged_len(), 2);
    assert_eq!(sink.merges.load(Ordering::SeqCst), 0);
    assert_eq!(summary.merged, 0);
    assert_eq!(sink.inner.permanent_len(), 0);
    assert!(reporter.phases().contains(&Phase::Upload));
    assert!(!reporter.phases().contains(&Phase::Merge));
    assert_eq!(reporter.phases().last(), Some(&Phase::Cancelled));
}

#[tokio::test]
async fn unwritable_summary_file_does_not_fail_a_merged_run() {
    let fixture = Fixture::new(ROWS);
    let output = fixture.output().join("output");
    fs::create_dir_all(&output).unwrap();
    fs::write(output.join("runs"), "not a directory").unwrap();

    let sink = Arc::new(MemoryUpsertSink::new());
    let reporter = Arc::new(RecordingReporter::default());
    let summary = fixture
        .collector(sink.clone(), reporter.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.merged, 3);
    assert_eq!(sink.permanent_len(), 3);
    assert_eq!(reporter.phases().last(), Some(&Phase::Complete));
    assert_eq!(reporter.summaries.lock().unwrap().len(), 1);

    let errors = reporter.errors();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].starts_with("writing run summary file"));
}
