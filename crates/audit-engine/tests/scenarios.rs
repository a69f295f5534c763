// End-to-end audits against scripted network doubles and a manual clock.

use async_trait::async_trait;
use audit_core::collab::{
    AiAnalysis, AiAnalyzer, Caller, CertificateIssuer, CreditManager, DebitOutcome, NotificationKind, Notifier, PdfRenderer,
};
use audit_core::fingerprint::{event_key, payload_hash};
use audit_core::score::compute_score;
use audit_core::{
    AuditConfig, AuditError, AuditStatus, AugmentationMode, Clock, DetectorOutcome, ErrorKind, Finding, Grade, ManualClock,
    NewFinding, Priority, RuntimeClass, ScanDepth, Severity, Stage, TaskStatus,
};
use audit_engine::local::{HeuristicAnalyzer, LedgerCredits};
use audit_engine::{DownloadTarget, Engine, EngineBuilder, SubmitRequest};
use audit_store::Db;
use crawler::ScriptedFetcher;
use detectors::probes::{CertSummary, StaticDns, StaticTls, TlsReport};
use detectors::{AuditCtx, Catalog, Detector, DetectorError, DetectorSpec};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use target_policy::StaticResolver;

const T0: i64 = 1_760_000_000_000;
const ROOT: &str = "https://example.com/";
const ROOT_HTML: &str = r#"<html><head><title>Example</title></head>
<body><a href="/about">About</a><a href="https://cdn.other.net/x.js">cdn</a>
<form action="/login" method="post"><input type="password" name="pw"></form></body></html>"#;

struct StaticPdf;

#[async_trait]
impl PdfRenderer for StaticPdf {
    async fn render(&self, audit_id: &str) -> Option<String> {
        Some(format!("https://reports.test/{audit_id}.pdf"))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, NotificationKind)>>,
}

impl RecordingNotifier {
    fn kinds(&self) -> Vec<NotificationKind> {
        self.sent.lock().unwrap().iter().map(|(_, k)| *k).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_email: &str, kind: NotificationKind, _payload: serde_json::Value) -> Result<(), String> {
        self.sent.lock().unwrap().push((user_email.to_string(), kind));
        Ok(())
    }
}

/// Returns fixed findings, after failing `failures` times with `error`.
struct Stub {
    spec: DetectorSpec,
    findings: Vec<(&'static str, Severity)>,
    failures: u32,
    error: DetectorError,
    calls: AtomicU32,
}

impl Stub {
    fn ok(spec: DetectorSpec, findings: &[(&'static str, Severity)]) -> Arc<dyn Detector> {
        Arc::new(Stub {
            spec,
            findings: findings.to_vec(),
            failures: 0,
            error: DetectorError::Transient("unused".into()),
            calls: AtomicU32::new(0),
        })
    }

    fn failing(spec: DetectorSpec, failures: u32, error: DetectorError) -> Arc<dyn Detector> {
        Arc::new(Stub { spec, findings: vec![("late_result", Severity::Low)], failures, error, calls: AtomicU32::new(0) })
    }
}

#[async_trait]
impl Detector for Stub {
    fn spec(&self) -> DetectorSpec {
        self.spec
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(self.error.clone());
        }
        Ok(self
            .findings
            .iter()
            .map(|(ty, sev)| NewFinding::new(self.spec.name, ty, *sev, ctx.target.as_str()))
            .collect())
    }
}

fn dns_stub() -> Arc<dyn Detector> {
    Stub::ok(DetectorSpec::new("dns_stub", Stage::DnsResolution, Priority::Low), &[("spf_missing", Severity::Low)])
}

fn headers_stub() -> Arc<dyn Detector> {
    Stub::ok(
        DetectorSpec::new("headers_stub", Stage::HeaderAnalysis, Priority::Normal),
        &[("missing_csp", Severity::Medium), ("missing_hsts", Severity::Medium)],
    )
}

/// Signals once it starts, then takes far longer than any test waits.
struct Slow {
    spec: DetectorSpec,
    started: Arc<Notify>,
}

#[async_trait]
impl Detector for Slow {
    fn spec(&self) -> DetectorSpec {
        self.spec
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(120)).await;
        Ok(vec![NewFinding::new(self.spec.name, "late_result", Severity::High, ctx.target.as_str())])
    }
}

/// Heuristic analysis behind a delay, counting calls.
#[derive(Default)]
struct SlowAnalyzer {
    calls: AtomicU32,
}

#[async_trait]
impl AiAnalyzer for SlowAnalyzer {
    async fn analyze(&self, findings: &[Finding]) -> Result<AiAnalysis, AuditError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        HeuristicAnalyzer.analyze(findings).await
    }
}

#[derive(Default)]
struct CountingIssuer {
    issued: AtomicU32,
}

#[async_trait]
impl CertificateIssuer for CountingIssuer {
    async fn issue(&self, _audit_id: &str) -> Result<String, AuditError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("ABCDEFGHJK{n:05}"))
    }
}

/// Applies the debit, then reports a failure as a lost response would.
struct FlakyCredits(LedgerCredits);

#[async_trait]
impl CreditManager for FlakyCredits {
    async fn debit(&self, user_id: &str, amount: u32, audit_id: &str) -> Result<DebitOutcome, AuditError> {
        self.0.debit(user_id, amount, audit_id).await?;
        Err(AuditError::Internal("credit service connection reset".into()))
    }

    async fn refund(&self, user_id: &str, amount: u32, audit_id: &str) -> Result<bool, AuditError> {
        self.0.refund(user_id, amount, audit_id).await
    }

    async fn balance(&self, user_id: &str) -> Result<i64, AuditError> {
        self.0.balance(user_id).await
    }
}

fn small_catalog(extra: Vec<Arc<dyn Detector>>) -> Catalog {
    let mut all = vec![dns_stub(), headers_stub()];
    all.extend(extra);
    Catalog::new(all)
}

struct Harness {
    engine: Engine,
    db: Arc<Db>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
}

fn config() -> AuditConfig {
    let mut cfg = AuditConfig::default();
    cfg.worker.poll_interval_ms = 10;
    cfg.worker.lease_secs = 30;
    cfg.report.signing_secret = "scenario-secret".into();
    cfg
}

fn harness(catalog: Option<Catalog>) -> Harness {
    harness_with(catalog, |b, _, _| b)
}

fn harness_with(
    catalog: Option<Catalog>,
    customize: impl FnOnce(EngineBuilder, &Arc<Db>, &Arc<ManualClock>) -> EngineBuilder,
) -> Harness {
    let db = Arc::new(Db::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(T0));
    let notifier = Arc::new(RecordingNotifier::default());
    let tls = StaticTls::new(TlsReport {
        protocol: Some("TLSv1_3".into()),
        certificate: Some(CertSummary {
            subject_cn: Some("example.com".into()),
            issuer_cn: Some("Example CA".into()),
            not_before_ms: 1_600_000_000_000,
            not_after_ms: 4_102_444_800_000,
            dns_names: vec!["example.com".into()],
            self_signed: false,
        }),
        ..TlsReport::default()
    });
    let mut builder = Engine::builder(db.clone(), config())
        .clock(clock.clone())
        .resolver(Arc::new(StaticResolver::new().with("example.com", &["93.184.216.34"])))
        .fetcher(Arc::new(ScriptedFetcher::new().html(ROOT, ROOT_HTML)))
        .dns(Arc::new(StaticDns::new()))
        .tls(Arc::new(tls))
        .pdf(Arc::new(StaticPdf))
        .notifier(notifier.clone())
        .ai(Some(Arc::new(HeuristicAnalyzer)));
    if let Some(c) = catalog {
        builder = builder.catalog(c);
    }
    let engine = customize(builder, &db, &clock).build().unwrap();
    Harness { engine, db, clock, notifier }
}

fn request(user: &str, mode: AugmentationMode) -> SubmitRequest {
    let mut req = SubmitRequest::new("https://example.com", user);
    req.user_email = Some(format!("{user}@example.org"));
    req.scan_depth = ScanDepth::Quick;
    req.augmentation_mode = mode;
    req
}

/// Drain the queue, stepping the clock past retry backoff, until the audit
/// is terminal.
async fn run_to_rest(h: &Harness, audit_id: &str) -> AuditStatus {
    for _ in 0..20 {
        h.engine.drain().await.unwrap();
        let a = h.db.require_audit(audit_id).unwrap();
        if a.is_terminal() {
            return a.status;
        }
        h.clock.advance_secs(60);
    }
    h.db.require_audit(audit_id).unwrap().status
}

#[tokio::test]
async fn full_audit_completes_and_spends_the_credit() {
    let h = harness(None);
    h.db.grant_credits("u1", 1).unwrap();

    let resp = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap();
    assert_eq!(resp.status, AuditStatus::Running);
    assert_eq!(h.db.credit_balance("u1").unwrap(), 0);

    assert_eq!(run_to_rest(&h, &resp.audit_id).await, AuditStatus::Completed);
    let view = h.engine.get_audit_status(&Caller::user("u1"), &resp.audit_id).unwrap();
    let score = view.security_score.unwrap();
    assert!((0.0..=10.0).contains(&score));
    assert!(matches!(view.grade, Some(Grade::APlus | Grade::A | Grade::B | Grade::C | Grade::D | Grade::F)));
    assert!(view.certificate_number.is_some());
    assert_eq!(view.progress, 100.0);
    assert_eq!(view.eta_seconds, 0);
    assert!(view.attack_chains.is_some());
    assert_eq!(h.db.credit_balance("u1").unwrap(), 0);
    assert_eq!(h.notifier.kinds(), vec![NotificationKind::AuditCompleted]);

    let report = h.db.get_report(&resp.audit_id).unwrap().unwrap();
    assert_eq!(report.security_score, score);
    assert!(report.report.get("attack_chains").is_some());
}

#[tokio::test]
async fn private_target_is_rejected_without_charge() {
    let h = harness(Some(small_catalog(vec![])));
    h.db.grant_credits("u1", 1).unwrap();

    let mut req = request("u1", AugmentationMode::ParallelAugment);
    req.target_url = "https://192.168.1.1/admin".into();
    let resp = h.engine.submit_audit(req).await.unwrap();

    assert_eq!(resp.status, AuditStatus::Failed);
    assert_eq!(resp.error_kind, Some(ErrorKind::ValidationError));
    assert_eq!(h.db.credit_balance("u1").unwrap(), 1);
    let v = serde_json::to_value(&resp).unwrap();
    assert_eq!(v["status"], "failed");
    assert_eq!(v["error_kind"], "validation_error");
    assert!(h.db.tasks_for_audit(&resp.audit_id).unwrap().is_empty());
}

#[tokio::test]
async fn no_credit_no_audit() {
    let h = harness(Some(small_catalog(vec![])));
    let err = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientCredits);
    assert!(h.db.list_user_audits("u1", 10, 0).unwrap().is_empty());
}

#[tokio::test]
async fn replayed_completion_is_recorded_once() {
    let h = harness(Some(small_catalog(vec![])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap().audit_id;

    let task = h.db.tasks_for_audit(&id).unwrap().into_iter().find(|t| t.detector_name == "dns_stub").unwrap();
    let findings = || vec![NewFinding::new("dns_stub", "spf_missing", Severity::Low, "https://example.com/")];

    let first = h.engine.deliver_completion(&task.task_id, findings()).await.unwrap();
    assert_eq!(first, DetectorOutcome::Succeeded { produced: 1, inserted: 1 });
    let after_first = h.db.count_findings(&id).unwrap();

    let second = h.engine.deliver_completion(&task.task_id, findings()).await.unwrap();
    assert_eq!(second, DetectorOutcome::Duplicate);
    assert_eq!(h.db.count_findings(&id).unwrap(), after_first);

    let key = event_key(&id, "detector_completed", &task.idempotency_key, &payload_hash(&task.inputs));
    let ev = h.db.get_processed_event(&key).unwrap().unwrap();
    assert_eq!(ev.audit_id, id);
    let done = h.db.get_task(&task.task_id).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);

    assert_eq!(run_to_rest(&h, &id).await, AuditStatus::Completed);
    assert_eq!(h.db.count_findings_by_detector(&id, "dns_stub").unwrap(), 1);
}

#[tokio::test]
async fn redelivered_task_yields_the_same_findings() {
    let clean = harness(Some(small_catalog(vec![])));
    clean.db.grant_credits("u1", 1).unwrap();
    let clean_id = clean.engine.submit_audit(request("u1", AugmentationMode::LegacyOnly)).await.unwrap().audit_id;
    assert_eq!(run_to_rest(&clean, &clean_id).await, AuditStatus::Completed);
    let expected = clean.db.count_findings(&clean_id).unwrap();
    let expected_pages = clean.db.count_pages(&clean_id).unwrap();

    let h = harness(Some(small_catalog(vec![])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::LegacyOnly)).await.unwrap().audit_id;

    // A worker claims the crawl and dies; the lease runs out and it is redelivered.
    let lost = h.db.claim_next_task(h.clock.now_ms(), 30_000).unwrap().unwrap();
    assert_eq!(lost.detector_name, "crawler");
    assert_eq!(run_to_rest(&h, &id).await, AuditStatus::Completed);

    let crawl = h.db.get_task(&lost.task_id).unwrap().unwrap();
    assert_eq!(crawl.status, TaskStatus::Succeeded);
    assert_eq!(crawl.attempts, 2);
    assert_eq!(h.db.count_findings(&id).unwrap(), expected);
    assert_eq!(h.db.count_pages(&id).unwrap(), expected_pages);
}

#[tokio::test]
async fn legacy_mode_scores_raw_findings_without_chains() {
    let h = harness(Some(small_catalog(vec![])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::LegacyOnly)).await.unwrap().audit_id;
    assert_eq!(run_to_rest(&h, &id).await, AuditStatus::Completed);

    let view = h.engine.get_audit_status(&Caller::user("u1"), &id).unwrap();
    assert!(view.attack_chains.is_none());
    assert!(serde_json::to_value(&view).unwrap().get("attack_chains").is_none());
    assert!(h.db.list_chains(&id).unwrap().is_empty());

    let raw = compute_score(h.db.list_findings(&id).unwrap().iter().map(|f| f.severity), std::iter::empty());
    assert_eq!(view.security_score, Some(raw));
    let report = h.db.get_report(&id).unwrap().unwrap();
    assert!(report.report.get("attack_chains").is_none());
}

#[tokio::test]
async fn poisoned_high_priority_detector_fails_and_refunds() {
    let tls = DetectorSpec::new("tls_stub", Stage::SslAnalysis, Priority::High).runtime(RuntimeClass::Fast);
    let h = harness(Some(small_catalog(vec![Stub::failing(tls, u32::MAX, DetectorError::Transient("refused".into()))])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap().audit_id;
    assert_eq!(h.db.credit_balance("u1").unwrap(), 0);

    assert_eq!(run_to_rest(&h, &id).await, AuditStatus::Failed);
    let view = h.engine.get_audit_status(&Caller::user("u1"), &id).unwrap();
    assert_eq!(view.error_kind, Some(ErrorKind::DetectorPoisonedHigh));
    assert!(view.credit_refunded);
    assert_eq!(view.poisoned_detectors.len(), 1);
    assert_eq!(view.poisoned_detectors[0].detector, "tls_stub");
    assert_eq!(h.db.credit_balance("u1").unwrap(), 1);
    assert_eq!(h.notifier.kinds(), vec![NotificationKind::AuditFailed]);

    let task = h.db.tasks_for_audit(&id).unwrap().into_iter().find(|t| t.detector_name == "tls_stub").unwrap();
    assert_eq!(task.status, TaskStatus::Poisoned);
    assert_eq!(task.attempts, task.max_attempts);
}

#[tokio::test]
async fn poisoned_low_priority_detector_degrades_gracefully() {
    let broken = DetectorSpec::new("broken_stub", Stage::FormAnalysis, Priority::Low);
    let h = harness(Some(small_catalog(vec![Stub::failing(broken, u32::MAX, DetectorError::Fatal("parser bug".into()))])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap().audit_id;

    assert_eq!(run_to_rest(&h, &id).await, AuditStatus::Completed);
    let note = h
        .db
        .list_findings(&id)
        .unwrap()
        .into_iter()
        .find(|f| f.finding_type == "detector_unavailable")
        .unwrap();
    assert_eq!(note.severity, Severity::Info);
    assert_eq!(note.evidence["detector"], "broken_stub");
    assert_eq!(note.evidence["status"], "poisoned");
    assert!(!h.db.require_audit(&id).unwrap().credit_refunded);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let flaky = DetectorSpec::new("flaky_stub", Stage::CookieAnalysis, Priority::Normal);
    let h = harness(Some(small_catalog(vec![Stub::failing(flaky, 2, DetectorError::Transient("503".into()))])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap().audit_id;

    assert_eq!(run_to_rest(&h, &id).await, AuditStatus::Completed);
    let task = h.db.tasks_for_audit(&id).unwrap().into_iter().find(|t| t.detector_name == "flaky_stub").unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempts, 3);
    assert!(h.db.list_findings(&id).unwrap().iter().any(|f| f.finding_type == "late_result"));
}

#[tokio::test]
async fn cancel_stops_work_and_keeps_the_credit() {
    let h = harness(Some(small_catalog(vec![])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap().audit_id;

    let err = h.engine.cancel_audit(&Caller::user("u2"), &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let resp = h.engine.cancel_audit(&Caller::user("u1"), &id).unwrap();
    assert_eq!(resp.status, AuditStatus::Cancelled);
    assert_eq!(h.engine.drain().await.unwrap(), 0);
    assert!(h.db.tasks_for_audit(&id).unwrap().iter().all(|t| t.status.is_terminal()));
    assert_eq!(h.db.credit_balance("u1").unwrap(), 0);

    let again = h.engine.cancel_audit(&Caller::user("u1"), &id).unwrap_err();
    assert!(matches!(again, AuditError::AlreadyTerminal(AuditStatus::Cancelled)));
}

#[tokio::test]
async fn report_download_and_certificate_lookup() {
    let h = harness(Some(small_catalog(vec![])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap().audit_id;

    let early = h.engine.download_report(&Caller::user("u1"), &DownloadTarget::Audit(id.clone())).unwrap_err();
    assert_eq!(early.kind(), ErrorKind::NotReady);

    assert_eq!(run_to_rest(&h, &id).await, AuditStatus::Completed);
    let link = h.engine.download_report(&Caller::user("u1"), &DownloadTarget::Audit(id.clone())).unwrap();
    assert!(link.url.starts_with(&format!("https://reports.test/{id}.pdf?expires=")));
    assert!(link.url.contains("signature="));

    let cert = h.db.require_audit(&id).unwrap().certificate_number.unwrap();
    let by_cert = h.engine.download_report(&Caller::admin(), &DownloadTarget::Certificate(cert.clone())).unwrap();
    assert_eq!(by_cert.audit_id, id);
    let other = h.engine.download_report(&Caller::user("u2"), &DownloadTarget::Audit(id.clone())).unwrap_err();
    assert_eq!(other.kind(), ErrorKind::Forbidden);

    let v = h.engine.verify_certificate(&cert).unwrap();
    assert!(v.valid);
    assert_eq!(v.domain, "example.com");
    assert_eq!(v.vulnerability_counts.total(), h.db.count_findings(&id).unwrap());
    assert!(v.scan_date.is_some());
    assert_eq!(h.engine.verify_certificate("NOPE").unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn progress_never_moves_backwards() {
    let h = harness(Some(small_catalog(vec![])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::OrchestratedAugment)).await.unwrap().audit_id;

    let mut seen = vec![h.db.require_audit(&id).unwrap().progress];
    while h.engine.run_once().await.unwrap().is_some() {
        seen.push(h.db.require_audit(&id).unwrap().progress);
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {seen:?}");
    assert_eq!(seen.last().copied(), Some(100.0));

    let items = h.engine.get_audit_status(&Caller::user("u1"), &id).unwrap().audit_items;
    assert!(items.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(items.last().map(|i| i.item.as_str()), Some("report"));

    let checkpoints = h.db.list_checkpoints(&id).unwrap();
    assert!(checkpoints.iter().any(|c| c.stage == Stage::Crawling && c.done));
    assert!(checkpoints.iter().all(|c| c.done), "open checkpoints: {checkpoints:?}");
}

#[tokio::test]
async fn inflight_limit_refuses_without_charging() {
    let h = harness(Some(small_catalog(vec![])));
    h.db.grant_credits("u1", 4).unwrap();
    for _ in 0..3 {
        h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap();
    }
    let err = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert_eq!(h.db.credit_balance("u1").unwrap(), 1);
    assert_eq!(h.engine.list_user_audits(&Caller::user("u1"), "u1", 500, 0).unwrap().len(), 3);
}

#[tokio::test]
async fn sweep_times_out_stalled_audits_and_refunds() {
    let h = harness(Some(small_catalog(vec![])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap().audit_id;

    h.clock.advance_secs(3_601);
    let report = h.engine.sweep().await.unwrap();
    assert_eq!(report.timed_out, 1);

    let a = h.db.require_audit(&id).unwrap();
    assert_eq!(a.status, AuditStatus::TimedOut);
    assert_eq!(a.error_kind, Some(ErrorKind::AuditTimeout));
    assert!(a.credit_refunded);
    assert_eq!(h.db.credit_balance("u1").unwrap(), 1);
    assert!(h.db.tasks_for_audit(&id).unwrap().iter().all(|t| t.status.is_terminal()));

    assert_eq!(h.engine.sweep().await.unwrap().timed_out, 0);
}

#[tokio::test]
async fn concurrent_sweeps_leave_finalization_to_one_owner() {
    let ai = Arc::new(SlowAnalyzer::default());
    let certs = Arc::new(CountingIssuer::default());
    let h = harness_with(Some(small_catalog(vec![])), |b, _, _| {
        b.ai(Some(ai.clone() as Arc<dyn AiAnalyzer>)).certificates(certs.clone())
    });
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap().audit_id;

    let done = Arc::new(AtomicBool::new(false));
    let sweeper = {
        let engine = h.engine.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut sweeps = 0u32;
            while !done.load(Ordering::SeqCst) {
                engine.sweep().await.unwrap();
                sweeps += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            sweeps
        })
    };
    h.engine.drain().await.unwrap();
    done.store(true, Ordering::SeqCst);
    assert!(sweeper.await.unwrap() > 1);

    let a = h.db.require_audit(&id).unwrap();
    assert_eq!(a.status, AuditStatus::Completed);
    assert_eq!(ai.calls.load(Ordering::SeqCst), 1);
    assert_eq!(certs.issued.load(Ordering::SeqCst), 1);
    let report = h.db.get_report(&id).unwrap().unwrap();
    assert_eq!(Some(report.certificate_number), a.certificate_number);
    assert_eq!(h.notifier.kinds(), vec![NotificationKind::AuditCompleted]);
}

#[tokio::test]
async fn cancel_interrupts_a_running_detector() {
    let started = Arc::new(Notify::new());
    let slow: Arc<dyn Detector> = Arc::new(Slow {
        spec: DetectorSpec::new("slow_stub", Stage::DnsResolution, Priority::Normal),
        started: started.clone(),
    });
    let h = harness(Some(small_catalog(vec![slow])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap().audit_id;

    let worker = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.drain().await })
    };
    tokio::time::timeout(Duration::from_secs(10), started.notified()).await.unwrap();
    let resp = h.engine.cancel_audit(&Caller::user("u1"), &id).unwrap();
    assert_eq!(resp.status, AuditStatus::Cancelled);
    tokio::time::timeout(Duration::from_secs(10), worker).await.unwrap().unwrap().unwrap();

    let a = h.db.require_audit(&id).unwrap();
    assert_eq!(a.status, AuditStatus::Cancelled);
    assert!(a.certificate_number.is_none());
    assert!(h.db.get_report(&id).unwrap().is_none());
    let task = h.db.tasks_for_audit(&id).unwrap().into_iter().find(|t| t.detector_name == "slow_stub").unwrap();
    assert!(task.status.is_terminal());
    assert_ne!(task.status, TaskStatus::Succeeded);
    assert_eq!(h.db.count_findings_by_detector(&id, "slow_stub").unwrap(), 0);
    // Cancellation is the customer's call; the credit stays spent.
    assert!(!a.credit_refunded);
    assert_eq!(h.db.credit_balance("u1").unwrap(), 0);
}

#[tokio::test]
async fn debit_applied_before_a_failed_response_is_refunded() {
    let h = harness_with(Some(small_catalog(vec![])), |b, db, clock| {
        b.credits(Arc::new(FlakyCredits(LedgerCredits::new(db.clone(), clock.clone()))))
    });
    h.db.grant_credits("u1", 1).unwrap();

    let err = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InternalError);
    let audits = h.db.list_user_audits("u1", 10, 0).unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].status, AuditStatus::Failed);
    assert!(audits[0].credit_refunded);
    assert_eq!(h.db.credit_balance("u1").unwrap(), 1);
    assert!(h.db.tasks_for_audit(&audits[0].audit_id).unwrap().is_empty());
}

#[tokio::test]
async fn submission_stalled_after_the_debit_is_failed_and_refunded() {
    let h = harness(Some(small_catalog(vec![])));
    h.db.grant_credits("u1", 1).unwrap();
    let id = h.engine.submit_audit(request("u1", AugmentationMode::ParallelAugment)).await.unwrap().audit_id;
    // The same ledger debit, held by a second audit that stopped before its
    // debit transition landed.
    let mut stalled = h.db.require_audit(&id).unwrap();
    stalled.audit_id = "stalled".into();
    stalled.status = AuditStatus::Validating;
    stalled.credit_used = false;
    stalled.certificate_number = None;
    stalled.updated_at_ms = h.clock.now_ms();
    h.db.insert_audit(&stalled).unwrap();
    h.db.grant_credits("u1", 1).unwrap();
    h.db.debit_credits("u1", 1, "stalled", h.clock.now_ms()).unwrap();
    assert_eq!(h.db.credit_balance("u1").unwrap(), 0);

    h.clock.advance_secs(301);
    let report = h.engine.sweep().await.unwrap();
    assert_eq!(report.failed_stale, 1);
    let a = h.db.require_audit("stalled").unwrap();
    assert_eq!(a.status, AuditStatus::Failed);
    assert!(a.credit_refunded);
    assert_eq!(h.db.credit_balance("u1").unwrap(), 1);
}
