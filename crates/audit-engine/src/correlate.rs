//! Attack-chain synthesis over a findings snapshot.
//!
//! A rule is an ordered list of steps; each step is a set of alternative
//! finding types. A rule matches when every step has at least one finding,
//! and the chain takes the worst finding for each step. Rules that share an
//! anchor (first-step) finding conflict: the higher-severity chain wins, then
//! the lower remediation priority, then the earlier rule.

use audit_core::collab::ChainHint;
use audit_core::fingerprint::sha256_hex;
use audit_core::{AttackChain, ChainSource, Finding, Severity};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: &'static str,
    pub steps: &'static [&'static [&'static str]],
    pub severity: Severity,
    pub impact: &'static str,
    /// Lower is fixed first.
    pub remediation_priority: u32,
}

const XSS_SOURCES: &[&str] = &["reflected_xss", "dom_xss_sink"];
const CSP_GAPS: &[&str] = &["missing_csp", "csp_unsafe_inline", "csp_missing_script_src"];
const CORS_GAPS: &[&str] = &["cors_origin_reflection", "cors_null_origin", "cors_wildcard_with_credentials"];

const STANDARD_RULES: &[Rule] = &[
    Rule {
        name: "xss_escalation_chain",
        steps: &[XSS_SOURCES, CSP_GAPS],
        severity: Severity::High,
        impact: "Injected script runs unhindered in visitors' browsers",
        remediation_priority: 1,
    },
    Rule {
        name: "session_hijack_chain",
        steps: &[&["cookie_missing_httponly", "jwt_cookie_script_readable"], XSS_SOURCES],
        severity: Severity::High,
        impact: "Session tokens readable by injected script can be stolen",
        remediation_priority: 1,
    },
    Rule {
        name: "credential_interception_chain",
        steps: &[
            &["password_form_over_http"],
            &["https_not_used", "http_served_without_redirect", "missing_hsts", "http_redirect_not_https"],
        ],
        severity: Severity::High,
        impact: "Passwords can be captured on the network path",
        remediation_priority: 1,
    },
    Rule {
        name: "cloud_account_takeover_chain",
        steps: &[&["exposed_secret"], &["public_bucket_listing", "cloud_storage_reference"]],
        severity: Severity::Critical,
        impact: "Leaked credentials reach cloud storage tied to the site",
        remediation_priority: 1,
    },
    Rule {
        name: "secret_leak_chain",
        steps: &[&["source_map_exposed", "sensitive_file_exposed"], &["exposed_secret"]],
        severity: Severity::Critical,
        impact: "Publicly served files disclose working secrets",
        remediation_priority: 1,
    },
    Rule {
        name: "api_data_exfiltration_chain",
        steps: &[&["api_docs_exposed", "graphql_introspection_enabled", "api_endpoints_discovered"], CORS_GAPS],
        severity: Severity::High,
        impact: "Mapped API endpoints are readable cross-origin",
        remediation_priority: 2,
    },
    Rule {
        name: "subdomain_takeover_chain",
        steps: &[
            &["subdomain_takeover", "dangling_cname"],
            &["cookie_missing_samesite", "cors_origin_reflection", "missing_csp"],
        ],
        severity: Severity::High,
        impact: "A claimable subdomain can act with the site's trust",
        remediation_priority: 2,
    },
    Rule {
        name: "ssrf_pivot_chain",
        steps: &[&["ssrf_parameter"], &["cloud_storage_reference", "internal_ip_disclosure"]],
        severity: Severity::High,
        impact: "Server-side requests can be steered at internal services",
        remediation_priority: 2,
    },
    Rule {
        name: "clickjacking_csrf_chain",
        steps: &[&["missing_x_frame_options"], &["missing_csrf_token"]],
        severity: Severity::Medium,
        impact: "Framed forms can be submitted on a user's behalf",
        remediation_priority: 3,
    },
    Rule {
        name: "vulnerable_library_chain",
        steps: &[&["vulnerable_js_library"], &["missing_sri", "missing_csp", "csp_unsafe_inline"]],
        severity: Severity::Medium,
        impact: "Known library flaws are exploitable without script restrictions",
        remediation_priority: 3,
    },
    Rule {
        name: "phishing_chain",
        steps: &[&["open_redirect"], &["missing_dmarc", "spf_allows_all", "missing_spf"]],
        severity: Severity::Medium,
        impact: "Spoofed mail can link through the site's own redirect",
        remediation_priority: 3,
    },
    Rule {
        name: "recon_chain",
        steps: &[
            &["debug_mode_enabled", "stack_trace_disclosure", "sql_error_disclosure"],
            &["version_disclosure", "vulnerable_js_library"],
        ],
        severity: Severity::Medium,
        impact: "Error output and version banners speed up targeted attacks",
        remediation_priority: 4,
    },
];

/// Chains built from AI hints rank after every rule chain.
const HINT_PRIORITY: u32 = 5;

#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        RuleSet { rules }
    }

    pub fn standard() -> Self {
        RuleSet::new(STANDARD_RULES.to_vec())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        RuleSet::standard()
    }
}

fn step_weight(s: Severity) -> f64 {
    match s {
        Severity::Critical => 4.0,
        Severity::High => 3.0,
        Severity::Medium => 2.0,
        Severity::Low => 1.0,
        Severity::Info => 0.5,
    }
}

/// Severity-weighted, confidence-scaled sum over the steps, capped at 10.
pub fn exploitability(steps: &[&Finding]) -> f64 {
    let sum: f64 = steps.iter().map(|f| step_weight(f.severity) * f.confidence).sum();
    audit_core::score::round_one_decimal(sum.min(10.0))
}

/// Worst finding of any of `types`: highest severity, then confidence, then earliest.
fn worst_of<'f>(findings: &'f [Finding], types: &[&str]) -> Option<&'f Finding> {
    findings.iter().filter(|f| types.contains(&f.finding_type.as_str())).min_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(b.confidence.total_cmp(&a.confidence))
            .then(a.detected_at_ms.cmp(&b.detected_at_ms))
            .then(a.finding_id.cmp(&b.finding_id))
    })
}

fn chain_id(audit_id: &str, name: &str, steps: &[String]) -> String {
    let mut s = sha256_hex(format!("{audit_id}\u{1f}{name}\u{1f}{}", steps.join(",")).as_bytes());
    s.truncate(32);
    s
}

fn build(audit_id: &str, name: &str, picked: &[&Finding], severity: Severity, impact: &str, priority: u32, source: ChainSource) -> AttackChain {
    let steps: Vec<String> = picked.iter().map(|f| f.finding_id.clone()).collect();
    AttackChain {
        chain_id: chain_id(audit_id, name, &steps),
        audit_id: audit_id.to_string(),
        name: name.to_string(),
        exploitability_score: exploitability(picked),
        impact: impact.to_string(),
        remediation_priority: priority,
        severity,
        source,
        steps,
    }
}

/// Chains for one audit. Deterministic for a given snapshot and hint list.
pub fn correlate(audit_id: &str, findings: &[Finding], rules: &RuleSet, hints: &[ChainHint]) -> Vec<AttackChain> {
    let mut candidates: Vec<(usize, AttackChain)> = Vec::new();
    for (idx, rule) in rules.rules().iter().enumerate() {
        let picked: Option<Vec<&Finding>> = rule.steps.iter().map(|types| worst_of(findings, types)).collect();
        let Some(picked) = picked else { continue };
        let distinct: HashSet<&str> = picked.iter().map(|f| f.finding_id.as_str()).collect();
        if distinct.len() != picked.len() {
            continue;
        }
        candidates.push((
            idx,
            build(audit_id, rule.name, &picked, rule.severity, rule.impact, rule.remediation_priority, ChainSource::Rules),
        ));
    }
    candidates.sort_by(|(ia, a), (ib, b)| {
        b.severity.cmp(&a.severity).then(a.remediation_priority.cmp(&b.remediation_priority)).then(ia.cmp(ib))
    });

    let mut anchors: HashSet<String> = HashSet::new();
    let mut chains: Vec<AttackChain> = Vec::new();
    for (_, chain) in candidates {
        if anchors.insert(chain.steps[0].clone()) {
            chains.push(chain);
        } else {
            tracing::debug!(audit_id, chain = %chain.name, "chain dropped: anchor already claimed");
        }
    }

    let mut seen_steps: HashSet<Vec<String>> = chains.iter().map(|c| c.steps.clone()).collect();
    for hint in hints {
        let picked: Vec<&Finding> = hint.finding_types.iter().filter_map(|t| worst_of(findings, &[t.as_str()])).collect();
        if picked.len() < 2 {
            continue;
        }
        let severity = picked.iter().map(|f| f.severity).max().unwrap_or(Severity::Info);
        let chain = build(audit_id, &hint.name, &picked, severity, &hint.impact, HINT_PRIORITY, ChainSource::AiHint);
        if seen_steps.insert(chain.steps.clone()) {
            chains.push(chain);
        }
    }

    chains.sort_by(|a, b| {
        a.remediation_priority
            .cmp(&b.remediation_priority)
            .then(b.exploitability_score.total_cmp(&a.exploitability_score))
            .then(a.name.cmp(&b.name))
    });
    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finding(id: &str, ty: &str, sev: Severity, confidence: f64) -> Finding {
        Finding {
            finding_id: id.into(),
            audit_id: "a1".into(),
            detector_name: "test".into(),
            finding_type: ty.into(),
            severity: sev,
            confidence,
            url: "https://example.com/".into(),
            evidence: json!({}),
            remediation: String::new(),
            cwe_id: None,
            owasp_category: None,
            dedupe_fingerprint: id.into(),
            detected_at_ms: 0,
        }
    }

    #[test]
    fn xss_with_missing_csp_makes_a_chain() {
        let f = vec![
            finding("f1", "reflected_xss", Severity::High, 0.9),
            finding("f2", "missing_csp", Severity::Medium, 1.0),
        ];
        let chains = correlate("a1", &f, &RuleSet::standard(), &[]);
        assert_eq!(chains.len(), 1);
        let c = &chains[0];
        assert_eq!(c.name, "xss_escalation_chain");
        assert_eq!(c.steps, vec!["f1", "f2"]);
        // 3 × 0.9 + 2 × 1.0
        assert_eq!(c.exploitability_score, 4.7);
        assert_eq!(c.source, ChainSource::Rules);
    }

    #[test]
    fn one_step_alone_is_not_a_chain() {
        let f = vec![finding("f1", "missing_csp", Severity::Medium, 1.0)];
        assert!(correlate("a1", &f, &RuleSet::standard(), &[]).is_empty());
    }

    #[test]
    fn shared_anchor_goes_to_the_more_severe_rule() {
        let low = Rule {
            name: "weak",
            steps: &[&["x"], &["y"]],
            severity: Severity::Low,
            impact: "",
            remediation_priority: 1,
        };
        let high = Rule { name: "strong", severity: Severity::High, remediation_priority: 9, ..low.clone() };
        let f = vec![finding("f1", "x", Severity::Medium, 1.0), finding("f2", "y", Severity::Low, 1.0)];
        let chains = correlate("a1", &f, &RuleSet::new(vec![low, high]), &[]);
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].name, "strong");
    }

    #[test]
    fn equal_severity_prefers_lower_priority() {
        let a = Rule { name: "later", steps: &[&["x"], &["y"]], severity: Severity::High, impact: "", remediation_priority: 3 };
        let b = Rule { name: "sooner", remediation_priority: 1, ..a.clone() };
        let f = vec![finding("f1", "x", Severity::Medium, 1.0), finding("f2", "y", Severity::Low, 1.0)];
        let chains = correlate("a1", &f, &RuleSet::new(vec![a, b]), &[]);
        assert_eq!(chains[0].name, "sooner");
    }

    #[test]
    fn steps_pick_the_worst_candidate() {
        let f = vec![
            finding("f1", "dom_xss_sink", Severity::Low, 0.5),
            finding("f2", "reflected_xss", Severity::High, 0.8),
            finding("f3", "csp_unsafe_inline", Severity::Medium, 1.0),
        ];
        let chains = correlate("a1", &f, &RuleSet::standard(), &[]);
        assert_eq!(chains[0].steps, vec!["f2", "f3"]);
    }

    #[test]
    fn exploitability_is_capped() {
        let f: Vec<Finding> = (0..5).map(|i| finding(&format!("f{i}"), "x", Severity::Critical, 1.0)).collect();
        let refs: Vec<&Finding> = f.iter().collect();
        assert_eq!(exploitability(&refs), 10.0);
    }

    #[test]
    fn hints_need_two_present_types() {
        let f = vec![
            finding("f1", "missing_hsts", Severity::Medium, 1.0),
            finding("f2", "cookie_missing_httponly", Severity::Low, 1.0),
        ];
        let hints = vec![
            ChainHint { name: "session_exposure".into(), finding_types: vec!["missing_hsts".into(), "cookie_missing_httponly".into()], impact: "x".into() },
            ChainHint { name: "absent".into(), finding_types: vec!["missing_hsts".into(), "open_redirect".into()], impact: "y".into() },
        ];
        let chains = correlate("a1", &f, &RuleSet::new(Vec::new()), &hints);
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].source, ChainSource::AiHint);
        assert_eq!(chains[0].severity, Severity::Medium);
        assert_eq!(chains[0].remediation_priority, HINT_PRIORITY);
    }

    #[test]
    fn chain_ids_are_stable() {
        let f = vec![
            finding("f1", "open_redirect", Severity::Medium, 1.0),
            finding("f2", "missing_dmarc", Severity::Low, 1.0),
        ];
        let a = correlate("a1", &f, &RuleSet::standard(), &[]);
        let b = correlate("a1", &f, &RuleSet::standard(), &[]);
        assert_eq!(a, b);
        assert_eq!(a[0].chain_id.len(), 32);
    }
}
