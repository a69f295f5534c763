use anyhow::{Context, Result};
use audit_core::AuditConfig;
use std::fs;
use std::path::Path;

const DEFAULT_PATH: &str = "auditctl.yaml";

/// An explicit `--config` must exist and parse. Without one, `./auditctl.yaml`
/// is used when present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<AuditConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_PATH);
            if p.exists() { p.to_path_buf() } else { return Ok(AuditConfig::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    parse_config(&s).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_config(yaml: &str) -> Result<AuditConfig> {
    if yaml.trim().is_empty() {
        return Ok(AuditConfig::default());
    }
    Ok(serde_yaml::from_str(yaml)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg = parse_config(
            "database:\n  path: /tmp/a.sqlite\nworker:\n  workers: 2\nreport:\n  signing_secret: s3cret\n",
        )
        .unwrap();
        assert_eq!(cfg.database.path, "/tmp/a.sqlite");
        assert_eq!(cfg.worker.workers, 2);
        assert_eq!(cfg.worker.lease_secs, 900);
        assert_eq!(cfg.limits.audit_wall_clock_secs, 3600);
        assert_eq!(cfg.report.signing_secret, "s3cret");
    }

    #[test]
    fn empty_file_is_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.crawler.max_pages_quick, 50);
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(parse_config("worker:\n  workers: many\n").is_err());
    }
}
