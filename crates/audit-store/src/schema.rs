pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE audits (
  audit_id            TEXT PRIMARY KEY,
  user_id             TEXT NOT NULL,
  user_email          TEXT,
  target_url          TEXT NOT NULL,
  normalized_url      TEXT NOT NULL,
  scan_region         TEXT NOT NULL,
  scan_depth          TEXT NOT NULL CHECK (scan_depth IN ('quick','standard','deep')),
  augmentation_mode   TEXT NOT NULL,
  status              TEXT NOT NULL,
  progress            REAL NOT NULL DEFAULT 0.0,
  current_stage       TEXT NOT NULL,
  current_item        TEXT,
  total_items         INTEGER NOT NULL DEFAULT 0,
  findings_count      INTEGER NOT NULL DEFAULT 0,
  security_score      REAL,
  grade               TEXT,
  certificate_number  TEXT UNIQUE,
  pdf_report_url      TEXT,
  created_at_ms       INTEGER NOT NULL,
  updated_at_ms       INTEGER NOT NULL,
  running_at_ms       INTEGER,
  completed_at_ms     INTEGER,
  credit_used         INTEGER NOT NULL DEFAULT 0 CHECK (credit_used IN (0,1)),
  credit_refunded     INTEGER NOT NULL DEFAULT 0 CHECK (credit_refunded IN (0,1)),
  cancel_requested    INTEGER NOT NULL DEFAULT 0 CHECK (cancel_requested IN (0,1)),
  error_kind          TEXT,
  error               TEXT,
  audit_metadata_json TEXT NOT NULL DEFAULT '{}',
  finalize_owner      TEXT,
  finalize_lease_until_ms INTEGER
);

CREATE TABLE audit_transitions (
  transition_id   INTEGER PRIMARY KEY AUTOINCREMENT,
  audit_id        TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
  from_status     TEXT NOT NULL,
  to_status       TEXT NOT NULL,
  event           TEXT NOT NULL,
  at_ms           INTEGER NOT NULL
);

CREATE TABLE audit_items (
  seq             INTEGER PRIMARY KEY AUTOINCREMENT,
  audit_id        TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
  stage           TEXT NOT NULL,
  item            TEXT NOT NULL,
  status          TEXT NOT NULL,
  findings_count  INTEGER NOT NULL DEFAULT 0,
  at_ms           INTEGER NOT NULL
);

CREATE TABLE findings (
  audit_id        TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
  fingerprint     TEXT NOT NULL,
  finding_id      TEXT NOT NULL UNIQUE,
  detector_name   TEXT NOT NULL,
  finding_type    TEXT NOT NULL,
  severity        TEXT NOT NULL CHECK (severity IN ('critical','high','medium','low','info')),
  severity_rank   INTEGER NOT NULL,
  confidence      REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  url             TEXT NOT NULL,
  evidence_json   TEXT NOT NULL,
  remediation     TEXT NOT NULL,
  cwe_id          TEXT,
  owasp_category  TEXT,
  detected_at_ms  INTEGER NOT NULL,
  PRIMARY KEY (audit_id, fingerprint)
);

CREATE TABLE processed_events (
  idempotency_key   TEXT PRIMARY KEY,
  audit_id          TEXT NOT NULL,
  event_type        TEXT NOT NULL,
  payload_hash      TEXT NOT NULL,
  first_seen_at_ms  INTEGER NOT NULL
);

CREATE TABLE checkpoints (
  audit_id              TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
  stage                 TEXT NOT NULL,
  completed_items_json  TEXT NOT NULL DEFAULT '[]',
  done                  INTEGER NOT NULL DEFAULT 0 CHECK (done IN (0,1)),
  updated_at_ms         INTEGER NOT NULL,
  PRIMARY KEY (audit_id, stage)
);

CREATE TABLE detector_tasks (
  task_id          TEXT PRIMARY KEY,
  audit_id         TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
  detector_name    TEXT NOT NULL,
  stage            TEXT NOT NULL,
  priority         TEXT NOT NULL CHECK (priority IN ('high','normal','low')),
  priority_rank    INTEGER NOT NULL,
  inputs_json      TEXT NOT NULL,
  idempotency_key  TEXT NOT NULL UNIQUE,
  attempts         INTEGER NOT NULL DEFAULT 0,
  max_attempts     INTEGER NOT NULL,
  status           TEXT NOT NULL CHECK (status IN ('queued','running','succeeded','failed','poisoned')),
  not_before_ms    INTEGER NOT NULL,
  lease_until_ms   INTEGER,
  deadline_ms      INTEGER,
  last_error       TEXT,
  created_at_ms    INTEGER NOT NULL,
  updated_at_ms    INTEGER NOT NULL
);

CREATE TABLE dead_letters (
  task_id         TEXT PRIMARY KEY,
  audit_id        TEXT NOT NULL,
  detector_name   TEXT NOT NULL,
  attempts        INTEGER NOT NULL,
  last_error      TEXT NOT NULL,
  at_ms           INTEGER NOT NULL
);

CREATE TABLE poison_records (
  task_id         TEXT PRIMARY KEY,
  audit_id        TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
  detector_name   TEXT NOT NULL,
  priority        TEXT NOT NULL,
  error           TEXT NOT NULL,
  at_ms           INTEGER NOT NULL
);

CREATE TABLE attack_chains (
  chain_id              TEXT PRIMARY KEY,
  audit_id              TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
  name                  TEXT NOT NULL,
  steps_json            TEXT NOT NULL,
  exploitability_score  REAL NOT NULL CHECK (exploitability_score BETWEEN 0.0 AND 10.0),
  impact                TEXT NOT NULL,
  remediation_priority  INTEGER NOT NULL,
  severity              TEXT NOT NULL,
  source                TEXT NOT NULL
);

CREATE TABLE crawl_pages (
  audit_id        TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
  url             TEXT NOT NULL,
  seq             INTEGER NOT NULL,
  status          INTEGER NOT NULL,
  content_type    TEXT,
  headers_json    TEXT NOT NULL,
  body_hash       TEXT NOT NULL,
  body            TEXT NOT NULL,
  links_json      TEXT NOT NULL,
  fetched_at_ms   INTEGER NOT NULL,
  PRIMARY KEY (audit_id, url)
);

CREATE TABLE reports (
  audit_id              TEXT PRIMARY KEY REFERENCES audits(audit_id) ON DELETE CASCADE,
  certificate_number    TEXT NOT NULL UNIQUE,
  security_score        REAL NOT NULL,
  grade                 TEXT NOT NULL,
  ssl_grade             TEXT,
  severity_counts_json  TEXT NOT NULL,
  report_json           TEXT NOT NULL,
  created_at_ms         INTEGER NOT NULL
);

CREATE TABLE credit_balances (
  user_id         TEXT PRIMARY KEY,
  balance         INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0)
);

CREATE TABLE credit_ledger (
  audit_id        TEXT NOT NULL,
  kind            TEXT NOT NULL CHECK (kind IN ('debit','refund')),
  user_id         TEXT NOT NULL,
  amount          INTEGER NOT NULL,
  at_ms           INTEGER NOT NULL,
  PRIMARY KEY (audit_id, kind)
);

CREATE TABLE certificates (
  certificate_number  TEXT PRIMARY KEY,
  audit_id            TEXT NOT NULL UNIQUE,
  issued_at_ms        INTEGER NOT NULL
);

CREATE INDEX idx_audits_user ON audits(user_id, created_at_ms);
CREATE INDEX idx_audits_status ON audits(status);
CREATE INDEX idx_transitions_audit ON audit_transitions(audit_id);
CREATE INDEX idx_items_audit ON audit_items(audit_id);
CREATE INDEX idx_findings_order ON findings(audit_id, severity_rank DESC, detected_at_ms ASC, finding_id ASC);
CREATE INDEX idx_events_seen ON processed_events(first_seen_at_ms);
CREATE INDEX idx_tasks_claim ON detector_tasks(status, not_before_ms, priority_rank);
CREATE INDEX idx_tasks_audit ON detector_tasks(audit_id);
CREATE INDEX idx_chains_audit ON attack_chains(audit_id);
CREATE INDEX idx_pages_audit ON crawl_pages(audit_id, seq);

COMMIT;
"#
;
