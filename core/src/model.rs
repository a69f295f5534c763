//! Domain entities: audits, findings, chains, tasks and their small enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ErrorKind;
use crate::stage::Stage;
use crate::status::AuditStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [Severity::Critical, Severity::High, Severity::Medium, Severity::Low, Severity::Info];

    /// Higher is worse. Used for ordering findings and chains.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    pub fn from_rank(rank: u8) -> Severity {
        match rank {
            4.. => Severity::Critical,
            3 => Severity::High,
            2 => Severity::Medium,
            1 => Severity::Low,
            _ => Severity::Info,
        }
    }

    /// Score deduction per distinct finding.
    pub fn penalty(self) -> f64 {
        match self {
            Severity::Critical => 2.5,
            Severity::High => 1.2,
            Severity::Medium => 0.4,
            Severity::Low => 0.1,
            Severity::Info => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" | "informational" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDepth {
    Quick,
    Standard,
    Deep,
}

impl ScanDepth {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanDepth::Quick => "quick",
            ScanDepth::Standard => "standard",
            ScanDepth::Deep => "deep",
        }
    }
}

impl FromStr for ScanDepth {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(ScanDepth::Quick),
            "standard" => Ok(ScanDepth::Standard),
            "deep" => Ok(ScanDepth::Deep),
            other => Err(format!("unknown scan depth: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AugmentationMode {
    #[serde(rename = "legacy-only")]
    LegacyOnly,
    #[serde(rename = "parallel-augment")]
    ParallelAugment,
    #[serde(rename = "orchestrated-augment")]
    OrchestratedAugment,
}

impl AugmentationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AugmentationMode::LegacyOnly => "legacy-only",
            AugmentationMode::ParallelAugment => "parallel-augment",
            AugmentationMode::OrchestratedAugment => "orchestrated-augment",
        }
    }

    pub fn synthesizes_chains(self) -> bool {
        !matches!(self, AugmentationMode::LegacyOnly)
    }
}

impl FromStr for AugmentationMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy-only" => Ok(AugmentationMode::LegacyOnly),
            "parallel-augment" => Ok(AugmentationMode::ParallelAugment),
            "orchestrated-augment" => Ok(AugmentationMode::OrchestratedAugment),
            other => Err(format!("unknown augmentation mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Expected runtime of a detector; sets its wall-clock budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeClass {
    Fast,
    Moderate,
    Slow,
}

impl RuntimeClass {
    pub fn timeout_secs(self) -> u64 {
        match self {
            RuntimeClass::Fast => 30,
            RuntimeClass::Moderate => 120,
            RuntimeClass::Slow => 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A+" => Ok(Grade::APlus),
            "A" => Ok(Grade::A),
            "B" => Ok(Grade::B),
            "C" => Ok(Grade::C),
            "D" => Ok(Grade::D),
            "F" => Ok(Grade::F),
            other => Err(format!("unknown grade: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    pub audit_id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub target_url: String,
    pub normalized_url: String,
    pub scan_region: String,
    pub scan_depth: ScanDepth,
    pub augmentation_mode: AugmentationMode,
    pub status: AuditStatus,
    pub progress: f64,
    pub current_stage: Stage,
    pub current_item: Option<String>,
    pub total_items: u32,
    pub findings_count: u32,
    pub security_score: Option<f64>,
    pub grade: Option<Grade>,
    pub certificate_number: Option<String>,
    pub pdf_report_url: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub running_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub credit_used: bool,
    pub credit_refunded: bool,
    pub cancel_requested: bool,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub audit_metadata: serde_json::Value,
}

impl Audit {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A finding as produced by a detector, before the store assigns identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFinding {
    pub detector_name: String,
    pub finding_type: String,
    pub severity: Severity,
    pub confidence: f64,
    pub url: String,
    pub evidence: serde_json::Value,
    pub remediation: String,
    pub cwe_id: Option<String>,
    pub owasp_category: Option<String>,
}

impl NewFinding {
    pub fn new(detector: &str, finding_type: &str, severity: Severity, url: impl Into<String>) -> Self {
        NewFinding {
            detector_name: detector.to_string(),
            finding_type: finding_type.to_string(),
            severity,
            confidence: 1.0,
            url: url.into(),
            evidence: serde_json::Value::Object(Default::default()),
            remediation: String::new(),
            cwe_id: None,
            owasp_category: None,
        }
    }

    pub fn confidence(mut self, c: f64) -> Self {
        self.confidence = c.clamp(0.0, 1.0);
        self
    }

    pub fn evidence(mut self, evidence: serde_json::Value) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn remediation(mut self, text: impl Into<String>) -> Self {
        self.remediation = text.into();
        self
    }

    pub fn cwe(mut self, cwe: &str) -> Self {
        self.cwe_id = Some(cwe.to_string());
        self
    }

    pub fn owasp(mut self, category: &str) -> Self {
        self.owasp_category = Some(category.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: String,
    pub audit_id: String,
    pub detector_name: String,
    pub finding_type: String,
    pub severity: Severity,
    pub confidence: f64,
    pub url: String,
    pub evidence: serde_json::Value,
    pub remediation: String,
    pub cwe_id: Option<String>,
    pub owasp_category: Option<String>,
    pub dedupe_fingerprint: String,
    pub detected_at_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub info: u32,
}

impl SeverityCounts {
    pub fn add(&mut self, severity: Severity, n: u32) {
        match severity {
            Severity::Critical => self.critical += n,
            Severity::High => self.high += n,
            Severity::Medium => self.medium += n,
            Severity::Low => self.low += n,
            Severity::Info => self.info += n,
        }
    }

    pub fn get(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Info => self.info,
        }
    }

    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low + self.info
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainSource {
    Rules,
    AiHint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackChain {
    pub chain_id: String,
    pub audit_id: String,
    pub name: String,
    /// Ordered finding ids.
    pub steps: Vec<String>,
    pub exploitability_score: f64,
    pub impact: String,
    pub remediation_priority: u32,
    pub severity: Severity,
    pub source: ChainSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub idempotency_key: String,
    pub audit_id: String,
    pub event_type: String,
    pub payload_hash: String,
    pub first_seen_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub audit_id: String,
    pub stage: Stage,
    pub completed_items: Vec<String>,
    pub done: bool,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Poisoned,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Poisoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Poisoned => "poisoned",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "poisoned" => Ok(TaskStatus::Poisoned),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorTask {
    pub task_id: String,
    pub audit_id: String,
    pub detector_name: String,
    pub stage: Stage,
    pub priority: Priority,
    pub inputs: serde_json::Value,
    pub idempotency_key: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub not_before_ms: i64,
    pub lease_until_ms: Option<i64>,
    pub deadline_ms: Option<i64>,
    pub last_error: Option<String>,
}

/// How one execution of a detector task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOutcome {
    Succeeded { produced: usize, inserted: usize },
    /// Transient failure that will be retried.
    Retrying { attempt: u32, error: String },
    Failed { error: String },
    Poisoned { error: String },
    /// Idempotency hit: the work was already done.
    Duplicate,
    /// The audit is terminal or cancelled; the task was dropped.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditItem {
    pub seq: i64,
    pub stage: Stage,
    pub item: String,
    pub status: String,
    pub findings_count: u32,
    pub at_ms: i64,
}

/// One fetched page of the crawl frontier, as detectors consume it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    /// Lowercased header names, in response order.
    pub headers: Vec<(String, String)>,
    pub body_hash: String,
    /// Body text, truncated to the crawler's content cap.
    pub body: String,
    pub links: Vec<String>,
}

impl PageRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers.iter().filter(move |(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn is_html(&self) -> bool {
        self.content_type.as_deref().map(|c| c.contains("html")).unwrap_or(false)
            || self.body.trim_start().get(..15).map(|s| s.to_ascii_lowercase().starts_with("<!doctype html")).unwrap_or(false)
    }

    pub fn is_javascript(&self) -> bool {
        self.content_type.as_deref().map(|c| c.contains("javascript") || c.contains("ecmascript")).unwrap_or(false)
            || self.url.split(['?', '#']).next().map(|p| p.ends_with(".js") || p.ends_with(".mjs")).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoisonRecord {
    pub audit_id: String,
    pub task_id: String,
    pub detector_name: String,
    pub priority: Priority,
    pub error: String,
    pub at_ms: i64,
}
