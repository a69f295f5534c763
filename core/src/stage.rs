//! Fixed scan stages, their cumulative progress percentages and ETA math.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::model::ScanDepth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    ValidatingTarget,
    DnsResolution,
    SslAnalysis,
    Crawling,
    HeaderAnalysis,
    CookieAnalysis,
    FormAnalysis,
    JavascriptAnalysis,
    SensitiveFiles,
    ApiDiscovery,
    VulnerabilityDetection,
    AiAnalysis,
    Completed,
}

impl Stage {
    pub const ORDER: [Stage; 14] = [
        Stage::Init,
        Stage::ValidatingTarget,
        Stage::DnsResolution,
        Stage::SslAnalysis,
        Stage::Crawling,
        Stage::HeaderAnalysis,
        Stage::CookieAnalysis,
        Stage::FormAnalysis,
        Stage::JavascriptAnalysis,
        Stage::SensitiveFiles,
        Stage::ApiDiscovery,
        Stage::VulnerabilityDetection,
        Stage::AiAnalysis,
        Stage::Completed,
    ];

    /// Nominal cumulative progress at the start of this stage.
    pub fn base_percent(self) -> f64 {
        match self {
            Stage::Init => 0.0,
            Stage::ValidatingTarget => 3.0,
            Stage::DnsResolution => 8.0,
            Stage::SslAnalysis => 15.0,
            Stage::Crawling => 30.0,
            Stage::HeaderAnalysis => 40.0,
            Stage::CookieAnalysis => 45.0,
            Stage::FormAnalysis => 55.0,
            Stage::JavascriptAnalysis => 65.0,
            Stage::SensitiveFiles => 72.0,
            Stage::ApiDiscovery => 80.0,
            Stage::VulnerabilityDetection => 88.0,
            Stage::AiAnalysis => 95.0,
            Stage::Completed => 100.0,
        }
    }

    pub fn next(self) -> Option<Stage> {
        let idx = self.index();
        Stage::ORDER.get(idx + 1).copied()
    }

    pub fn index(self) -> usize {
        Stage::ORDER.iter().position(|s| *s == self).unwrap_or(0)
    }

    /// Width of this stage in percent points.
    pub fn span(self) -> f64 {
        match self.next() {
            Some(n) => n.base_percent() - self.base_percent(),
            None => 0.0,
        }
    }

    pub fn progress_at(self, fraction_within_stage: f64) -> f64 {
        let f = if fraction_within_stage.is_nan() { 0.0 } else { fraction_within_stage.clamp(0.0, 1.0) };
        (self.base_percent() + f * self.span()).min(100.0)
    }

    pub fn description(self) -> &'static str {
        match self {
            Stage::Init => "Queued for scanning",
            Stage::ValidatingTarget => "Validating target URL",
            Stage::DnsResolution => "Resolving DNS and checking mail/CAA records",
            Stage::SslAnalysis => "Analyzing SSL/TLS configuration",
            Stage::Crawling => "Crawling pages and assets",
            Stage::HeaderAnalysis => "Analyzing HTTP security headers",
            Stage::CookieAnalysis => "Analyzing cookies and session tokens",
            Stage::FormAnalysis => "Analyzing forms",
            Stage::JavascriptAnalysis => "Analyzing JavaScript libraries and client code",
            Stage::SensitiveFiles => "Checking for exposed sensitive files",
            Stage::ApiDiscovery => "Discovering APIs and cloud exposure",
            Stage::VulnerabilityDetection => "Detecting vulnerabilities",
            Stage::AiAnalysis => "Correlating findings and scoring",
            Stage::Completed => "Audit complete",
        }
    }

    /// Nominal duration of the stage for a standard-depth scan.
    fn nominal_secs(self) -> f64 {
        match self {
            Stage::Init | Stage::Completed => 0.0,
            Stage::ValidatingTarget => 2.0,
            Stage::DnsResolution => 5.0,
            Stage::SslAnalysis => 8.0,
            Stage::Crawling => 90.0,
            Stage::HeaderAnalysis => 4.0,
            Stage::CookieAnalysis => 3.0,
            Stage::FormAnalysis => 4.0,
            Stage::JavascriptAnalysis => 15.0,
            Stage::SensitiveFiles => 30.0,
            Stage::ApiDiscovery => 20.0,
            Stage::VulnerabilityDetection => 40.0,
            Stage::AiAnalysis => 15.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::ValidatingTarget => "validating_target",
            Stage::DnsResolution => "dns_resolution",
            Stage::SslAnalysis => "ssl_analysis",
            Stage::Crawling => "crawling",
            Stage::HeaderAnalysis => "header_analysis",
            Stage::CookieAnalysis => "cookie_analysis",
            Stage::FormAnalysis => "form_analysis",
            Stage::JavascriptAnalysis => "javascript_analysis",
            Stage::SensitiveFiles => "sensitive_files",
            Stage::ApiDiscovery => "api_discovery",
            Stage::VulnerabilityDetection => "vulnerability_detection",
            Stage::AiAnalysis => "ai_analysis",
            Stage::Completed => "completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ORDER
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

fn depth_factor(depth: ScanDepth) -> f64 {
    match depth {
        ScanDepth::Quick => 0.4,
        ScanDepth::Standard => 1.0,
        ScanDepth::Deep => 4.0,
    }
}

/// Remaining seconds, from elapsed time and the nominal weight of the
/// remaining stages. The observed pace (elapsed vs. nominal elapsed) scales
/// the remaining nominal time, so a slow target stretches the estimate for
/// the stages still ahead instead of the percent curve.
pub fn eta_seconds(stage: Stage, fraction_within_stage: f64, elapsed_secs: f64, depth: ScanDepth) -> u64 {
    if stage == Stage::Completed {
        return 0;
    }
    let f = fraction_within_stage.clamp(0.0, 1.0);
    let factor = depth_factor(depth);
    let mut done = 0.0;
    let mut remaining = 0.0;
    for s in Stage::ORDER {
        let w = s.nominal_secs() * factor;
        if s < stage {
            done += w;
        } else if s == stage {
            done += w * f;
            remaining += w * (1.0 - f);
        } else {
            remaining += w;
        }
    }
    let pace = if done > 0.0 && elapsed_secs > 0.0 { (elapsed_secs / done).clamp(0.25, 4.0) } else { 1.0 };
    (remaining * pace).round().max(0.0) as u64
}
