use crate::{
    AuditSink, BatchAllocator, Error, IdentifierSource, IdentifierSourceService, IdentifierType,
    LogEntry, MemoryAuditLog, MemoryStore, PoolConfig, PoolStatus, RemoteConfig, RemoteError,
    Result, RetryPolicy, SequentialConfig, SourceId, SourceKind, SourceStore,
    remote::tests::ScriptedClient,
};
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc};

/// Fails the first `failures` records, then behaves like a memory log.
struct FlakyAudit {
    failures: Mutex<usize>,
    inner: MemoryAuditLog,
}

impl FlakyAudit {
    fn new(failures: usize) -> Self {
        Self {
            failures: Mutex::new(failures),
            inner: MemoryAuditLog::new(),
        }
    }
}

#[async_trait]
impl AuditSink for FlakyAudit {
    async fn record(&self, entry: &LogEntry) -> Result<()> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Storage("disk full".into()));
            }
        }
        self.inner.record(entry).await
    }

    fn entries(&self, source: SourceId) -> Result<Vec<LogEntry>> {
        self.inner.entries(source)
    }
}

struct Harness {
    service: IdentifierSourceService,
    store: Arc<MemoryStore>,
    remote: Arc<ScriptedClient>,
}

impl Harness {
    fn new() -> Self {
        Self::with(Arc::new(MemoryAuditLog::new()), ScriptedClient::default())
    }

    fn with(audit: Arc<dyn AuditSink>, remote: ScriptedClient) -> Self {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(remote);
        let allocator = BatchAllocator::new(store.clone(), audit, remote.clone())
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
                backoff_factor: 2,
                max_backoff: Duration::from_millis(4),
            })
            .with_max_batch_size(10_000);
        Self {
            service: IdentifierSourceService::new(Arc::new(allocator)),
            store,
            remote,
        }
    }

    fn save(&self, name: &str, kind: SourceKind) -> SourceId {
        self.service
            .save_identifier_source(IdentifierSource::new(name, IdentifierType::new("MRN"), kind))
            .unwrap()
            .id
            .unwrap()
    }

    fn sequential(&self, first: &str) -> SourceId {
        self.save("generator", SourceKind::Sequential(SequentialConfig::decimal(first)))
    }

    fn pool(&self, config: PoolConfig) -> SourceId {
        self.save("pool", SourceKind::Pool(config))
    }

    fn remote(&self) -> SourceId {
        self.save(
            "remote",
            SourceKind::Remote(RemoteConfig {
                url: "http://ids.example.org/generate".into(),
                user: None,
                password: None,
            }),
        )
    }
}

fn strings(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| (*s).to_string()).collect()
}

fn assert_distinct(ids: &[String]) {
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len(), "duplicates in {ids:?}");
}

#[tokio::test]
async fn sequential_batches_are_exact_and_never_repeat() {
    let h = Harness::new();
    let source = h.sequential("0001");

    let mut all = Vec::new();
    for count in [1, 5, 17, 3] {
        let batch = h.service.generate_identifiers(source, count, "").await.unwrap();
        assert_eq!(batch.len(), count);
        all.extend(batch);
    }
    assert_eq!(all.first().map(String::as_str), Some("0001"));
    assert_eq!(all.last().map(String::as_str), Some("0026"));
    assert_distinct(&all);
}

#[tokio::test]
async fn every_batch_is_audited_with_a_comment() {
    let h = Harness::new();
    let source = h.sequential("1");

    let first = h.service.generate_identifiers(source, 2, "").await.unwrap();
    let single = h.service.generate_identifier(source, "walk-in").await.unwrap();

    let log = h.service.log_entries(source).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].comment, "Batch Export of 2 to file");
    assert_eq!(log[0].identifiers, first);
    assert_eq!(log[1].comment, "walk-in");
    assert_eq!(log[1].identifiers, vec![single]);
}

#[tokio::test]
async fn rejects_bad_requests_and_retired_sources() {
    let h = Harness::new();
    let source = h.sequential("1");

    let err = h.service.generate_identifiers(source, 0, "").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = h
        .service
        .generate_identifiers(source, 10_001, "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = h
        .service
        .generate_identifiers(SourceId(404), 1, "")
        .await
        .unwrap_err();
    assert_eq!(err, Error::SourceNotFound(SourceId(404)));

    h.service.retire_identifier_source(source, "replaced").unwrap();
    let err = h.service.generate_identifiers(source, 1, "").await.unwrap_err();
    assert!(matches!(err, Error::InvalidSource { source_id, .. } if source_id == source));

    h.service.unretire_identifier_source(source).unwrap();
    assert_eq!(
        h.service.generate_identifier(source, "").await.unwrap(),
        "1"
    );
}

#[tokio::test]
async fn exhausted_generator_reports_insufficient_capacity() {
    let h = Harness::new();
    let source = h.save(
        "tiny",
        SourceKind::Sequential(SequentialConfig {
            max_length: Some(1),
            ..SequentialConfig::decimal("7")
        }),
    );
    let err = h.service.generate_identifiers(source, 4, "").await.unwrap_err();
    assert!(matches!(err, Error::InsufficientCapacity { available: 3, .. }));
    assert!(h.service.log_entries(source).unwrap().is_empty());
}

#[tokio::test]
async fn crash_after_reservation_never_reuses_numbers() {
    let audit = Arc::new(FlakyAudit::new(1));
    let h = Harness::with(audit.clone(), ScriptedClient::default());
    let source = h.sequential("100");

    // The counter is advanced, then issuance fails before the batch is
    // handed out.
    let err = h.service.generate_identifiers(source, 3, "").await.unwrap_err();
    assert_eq!(err, Error::Storage("disk full".into()));
    assert_eq!(h.store.next_sequence_value(source), Some(103));

    let next = h.service.generate_identifiers(source, 2, "").await.unwrap();
    assert_eq!(next, strings(&["103", "104"]));
    assert_eq!(audit.entries(source).unwrap().len(), 1);
}

#[tokio::test]
async fn pool_issues_uploaded_identifiers_once() {
    let h = Harness::new();
    let pool = h.pool(PoolConfig::default());
    h.service
        .add_identifiers_to_pool(pool, strings(&["P1", "P2", "P3"]))
        .await
        .unwrap();

    let first = h.service.generate_identifiers(pool, 2, "").await.unwrap();
    assert_eq!(first, strings(&["P1", "P2"]));

    // P1 was issued and P3 is still pending
    let err = h
        .service
        .add_identifiers_to_pool(pool, strings(&["P1", "P4", "P3"]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::DuplicateIdentifier {
            identifiers: strings(&["P1", "P3"])
        }
    );

    let rest = h.service.generate_identifiers(pool, 1, "").await.unwrap();
    assert_eq!(rest, strings(&["P3"]));
    let err = h.service.generate_identifiers(pool, 1, "").await.unwrap_err();
    assert!(matches!(err, Error::InsufficientCapacity { .. }));
}

#[tokio::test]
async fn pool_operations_require_a_pool() {
    let h = Harness::new();
    let generator = h.sequential("1");
    let err = h
        .service
        .add_identifiers_to_pool(generator, strings(&["X"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSource { .. }));
    let err = h.service.pool_status(generator).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSource { .. }));
}

#[tokio::test]
async fn replenished_pool_serves_beyond_old_buffer() {
    let h = Harness::new();
    let upstream = h.sequential("500");
    let pool = h.pool(PoolConfig {
        refill_source: Some(upstream),
        refill_batch_size: 4,
        min_pool_size: 3,
    });
    h.service
        .add_identifiers_to_pool(pool, strings(&["A"]))
        .await
        .unwrap();

    // Below the low-water mark: tops up by max(3 - 1, 4)
    let report = h.service.replenish_pools().await.unwrap();
    assert_eq!(report.added, 4);
    assert!(report.failures.is_empty());
    assert_eq!(
        h.service.pool_status(pool).await.unwrap(),
        PoolStatus {
            pending: 5,
            issued: 0
        }
    );

    // Exceeds the buffer as it was before replenishment and after it
    let batch = h.service.generate_identifiers(pool, 8, "").await.unwrap();
    assert_eq!(
        batch,
        strings(&["A", "500", "501", "502", "503", "504", "505", "506"])
    );
    assert_distinct(&batch);

    // The upstream generator audits its own batches.
    let upstream_log = h.service.log_entries(upstream).unwrap();
    assert_eq!(upstream_log.len(), 2);
    assert_eq!(upstream_log[1].comment, format!("Replenishing pool {pool}"));
}

#[tokio::test]
async fn explicit_refill_from_source() {
    let h = Harness::new();
    let upstream = h.sequential("1");
    let pool = h.pool(PoolConfig {
        refill_source: Some(upstream),
        ..PoolConfig::default()
    });

    assert_eq!(h.service.add_identifiers_from_source(pool, 25).await.unwrap(), 25);
    assert_eq!(h.service.pool_status(pool).await.unwrap().pending, 25);
}

#[tokio::test]
async fn pool_chains_refill_through_each_other() {
    let h = Harness::new();
    let generator = h.sequential("1");
    let regional = h.pool(PoolConfig {
        refill_source: Some(generator),
        refill_batch_size: 10,
        min_pool_size: 0,
    });
    let clinic = h.pool(PoolConfig {
        refill_source: Some(regional),
        refill_batch_size: 3,
        min_pool_size: 0,
    });

    let ids = h.service.generate_identifiers(clinic, 2, "").await.unwrap();
    assert_eq!(ids, strings(&["1", "2"]));
    assert_eq!(h.service.pool_status(clinic).await.unwrap().pending, 1);
    assert_eq!(h.service.pool_status(regional).await.unwrap().pending, 7);
}

#[tokio::test]
async fn remote_failure_issues_nothing() {
    let h = Harness::with(
        Arc::new(MemoryAuditLog::new()),
        ScriptedClient::new([
            Err(RemoteError::Transport("timeout".into())),
            Ok(strings(&["R1"])), // partial
            Err(RemoteError::Malformed("not json".into())),
        ]),
    );
    let source = h.remote();

    let err = h.service.generate_identifiers(source, 2, "").await.unwrap_err();
    assert!(matches!(err, Error::UpstreamUnavailable { attempts: 3, .. }));
    assert_eq!(h.remote.calls(), 3);
    assert!(h.service.log_entries(source).unwrap().is_empty());
}

#[tokio::test]
async fn remote_success_is_audited() {
    let h = Harness::with(
        Arc::new(MemoryAuditLog::new()),
        ScriptedClient::new([Ok(strings(&["R1", "R2"]))]),
    );
    let source = h.remote();
    let ids = h.service.generate_identifiers(source, 2, "import").await.unwrap();
    assert_eq!(ids, strings(&["R1", "R2"]));
    assert_eq!(h.service.log_entries(source).unwrap()[0].comment, "import");
}

#[tokio::test]
async fn failing_remote_refill_leaves_pool_untouched() {
    let h = Harness::new();
    let remote = h.remote();
    let pool = h.pool(PoolConfig {
        refill_source: Some(remote),
        refill_batch_size: 5,
        min_pool_size: 0,
    });
    h.service
        .add_identifiers_to_pool(pool, strings(&["A"]))
        .await
        .unwrap();

    let err = h.service.generate_identifiers(pool, 3, "").await.unwrap_err();
    assert!(matches!(err, Error::UpstreamUnavailable { .. }));
    assert_eq!(
        h.service.pool_status(pool).await.unwrap(),
        PoolStatus {
            pending: 1,
            issued: 0
        }
    );
}

#[tokio::test]
async fn refill_larger_than_batch_limit_is_split() {
    let h = Harness::new();
    let generator = h.sequential("1");
    let pool = h.pool(PoolConfig {
        refill_source: Some(generator),
        refill_batch_size: 1,
        min_pool_size: 50,
    });

    let ids = h.service.generate_identifiers(pool, 10_000, "").await.unwrap();
    assert_eq!(ids.len(), 10_000);
    assert_distinct(&ids);
    assert_eq!(h.service.pool_status(pool).await.unwrap().pending, 50);

    let refills: Vec<usize> = h
        .service
        .log_entries(generator)
        .unwrap()
        .iter()
        .map(|e| e.count)
        .collect();
    assert_eq!(refills, vec![10_000, 50]);

    assert_eq!(
        h.service.add_identifiers_from_source(pool, 25_000).await.unwrap(),
        25_000
    );
    assert_eq!(h.service.pool_status(pool).await.unwrap().pending, 25_050);
    assert_eq!(h.service.log_entries(generator).unwrap().len(), 5);
}

#[tokio::test]
async fn split_refill_keeps_batches_issued_before_a_failure() {
    let first: Vec<String> = (0..10_000).map(|n| format!("R{n}")).collect();
    let h = Harness::with(
        Arc::new(MemoryAuditLog::new()),
        ScriptedClient::new([Ok(first.clone())]),
    );
    let remote = h.remote();
    let pool = h.pool(PoolConfig {
        refill_source: Some(remote),
        refill_batch_size: 1,
        min_pool_size: 50,
    });

    // The 50 above the batch limit never arrive; the first batch still
    // covers the request.
    let ids = h.service.generate_identifiers(pool, 10_000, "").await.unwrap();
    assert_eq!(ids, first);
    assert_eq!(h.remote.calls(), 4);
    assert_eq!(h.service.log_entries(remote).unwrap().len(), 1);
    assert_eq!(
        h.service.pool_status(pool).await.unwrap(),
        PoolStatus {
            pending: 0,
            issued: 10_000
        }
    );
}

#[tokio::test]
async fn refill_cycle_fails_instead_of_recursing() {
    let h = Harness::new();
    let refill = |from| PoolConfig {
        refill_source: from,
        refill_batch_size: 1,
        min_pool_size: 1,
    };
    let a = h.pool(refill(None));
    let b = h.pool(refill(Some(a)));

    // Close the loop behind the validator's back.
    let mut looped = h.service.get_identifier_source(a).unwrap();
    looped.kind = SourceKind::Pool(refill(Some(b)));
    h.store.save_identifier_source(looped).unwrap();

    let err = h.service.generate_identifiers(a, 1, "").await.unwrap_err();
    assert_eq!(
        err,
        Error::InvalidSource {
            source_id: a,
            reason: "refill sources form a cycle".into()
        }
    );
    assert!(h.service.log_entries(a).unwrap().is_empty());
    assert!(h.service.log_entries(b).unwrap().is_empty());

    let report = h.service.replenish_pools().await.unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(h.service.add_identifiers_from_source(b, 5).await.ok(), None);
}

#[test]
fn concurrent_saves_cannot_close_a_refill_cycle() {
    for _ in 0..50 {
        let h = Harness::new();
        let a = h.pool(PoolConfig::default());
        let b = h.pool(PoolConfig::default());
        let refill_from = |pool: SourceId, from: SourceId| {
            let mut source = h.service.get_identifier_source(pool).unwrap();
            source.kind = SourceKind::Pool(PoolConfig {
                refill_source: Some(from),
                ..PoolConfig::default()
            });
            source
        };
        let (a_from_b, b_from_a) = (refill_from(a, b), refill_from(b, a));

        let barrier = std::sync::Barrier::new(2);
        let outcomes: Vec<Result<IdentifierSource>> = std::thread::scope(|scope| {
            [a_from_b, b_from_a]
                .map(|source| {
                    let (service, barrier) = (&h.service, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        service.save_identifier_source(source)
                    })
                })
                .map(|saver| saver.join().unwrap())
                .into_iter()
                .collect()
        });

        let saved = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(saved, 1, "{outcomes:?}");
        assert!(
            outcomes
                .iter()
                .any(|o| matches!(o, Err(Error::Validation(e)) if e.fields()[0].field == "refill_source"))
        );
    }
}

#[tokio::test]
async fn remote_never_reissues_across_batches() {
    let h = Harness::with(
        Arc::new(MemoryAuditLog::new()),
        ScriptedClient::new([
            Ok(strings(&["R1", "R2"])),
            Ok(strings(&["R2", "R3"])),
            Ok(strings(&["R3", "R4"])),
            Ok(strings(&["R4", "R1"])),
            Ok(strings(&["R3", "R5"])),
            Ok(strings(&["R5", "R2"])),
        ]),
    );
    let source = h.remote();

    assert_eq!(
        h.service.generate_identifiers(source, 2, "").await.unwrap(),
        strings(&["R1", "R2"])
    );
    assert_eq!(
        h.service.generate_identifiers(source, 2, "").await.unwrap(),
        strings(&["R3", "R4"])
    );
    assert_eq!(h.remote.calls(), 3);

    // Every remaining response repeats an issued identifier.
    let err = h.service.generate_identifiers(source, 2, "").await.unwrap_err();
    match err {
        Error::UpstreamUnavailable { attempts, reason, .. } => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("already issued"), "{reason}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(h.service.log_entries(source).unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_pool_callers_never_overlap() {
    const CALLERS: usize = 16;
    const PER_CALL: usize = 25;
    const ROUNDS: usize = 4;

    let h = Harness::new();
    let upstream = h.sequential("1");
    let pool = h.pool(PoolConfig {
        refill_source: Some(upstream),
        refill_batch_size: 30,
        min_pool_size: 10,
    });

    let mut handles = Vec::with_capacity(CALLERS);
    for _ in 0..CALLERS {
        let service = h.service.clone();
        handles.push(tokio::spawn(async move {
            let mut got = Vec::new();
            for _ in 0..ROUNDS {
                got.extend(service.generate_identifiers(pool, PER_CALL, "").await.unwrap());
            }
            got
        }));
    }

    let mut all = Vec::with_capacity(CALLERS * PER_CALL * ROUNDS);
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    assert_eq!(all.len(), CALLERS * PER_CALL * ROUNDS);
    assert_distinct(&all);

    let status = h.service.pool_status(pool).await.unwrap();
    assert_eq!(status.issued, CALLERS * PER_CALL * ROUNDS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_sequential_callers_never_overlap() {
    let h = Harness::new();
    let source = h.sequential("1");

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let service = h.service.clone();
            tokio::spawn(async move { service.generate_identifiers(source, 50, "").await })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap().unwrap());
    }
    assert_eq!(all.len(), 32 * 50);
    assert_distinct(&all);
    assert_eq!(h.store.next_sequence_value(source), Some(1 + 32 * 50));
}

#[tokio::test]
async fn purge_removes_source_and_pool_state() {
    let h = Harness::new();
    let pool = h.pool(PoolConfig::default());
    h.service
        .add_identifiers_to_pool(pool, strings(&["A"]))
        .await
        .unwrap();

    h.service.purge_identifier_source(pool).await.unwrap();
    assert_eq!(
        h.service.get_identifier_source(pool).unwrap_err(),
        Error::SourceNotFound(pool)
    );
    assert_eq!(h.service.allocator().pools().status(pool).await, PoolStatus::default());
}

#[test]
fn compatible_sources_share_type_and_exclude_self() {
    let h = Harness::new();
    let a = h.sequential("1");
    let b = h.pool(PoolConfig::default());
    h.service
        .save_identifier_source(IdentifierSource::new(
            "other",
            IdentifierType::new("NID"),
            SourceKind::Sequential(SequentialConfig::decimal("1")),
        ))
        .unwrap();

    let source = h.service.get_identifier_source(a).unwrap();
    let compatible: Vec<_> = h
        .service
        .compatible_sources(&source)
        .unwrap()
        .into_iter()
        .filter_map(|s| s.id)
        .collect();
    assert_eq!(compatible, vec![b]);

    let by_type = h.service.get_identifier_sources_by_type(false).unwrap();
    assert_eq!(by_type.len(), 2);
    assert_eq!(h.service.get_identifier_source_types().len(), 3);
}

#[test]
fn invalid_definitions_are_not_saved() {
    let h = Harness::new();
    let err = h
        .service
        .save_identifier_source(IdentifierSource::new(
            "",
            IdentifierType::new("MRN"),
            SourceKind::Sequential(SequentialConfig::decimal("")),
        ))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(h.service.get_all_identifier_sources(true).unwrap().is_empty());
}
