use async_trait::async_trait;
use audit_core::collab::PdfRenderer;
use audit_core::config::ReportConfig;
use audit_store::Db;
use std::path::PathBuf;
use std::sync::Arc;

/// Writes a one-page summary PDF per report into `report.output_dir` and
/// serves it under `report.public_base_url`.
pub struct LocalPdfRenderer {
    db: Arc<Db>,
    dir: PathBuf,
    base_url: String,
}

impl LocalPdfRenderer {
    pub fn new(db: Arc<Db>, cfg: &ReportConfig) -> Self {
        LocalPdfRenderer {
            db,
            dir: PathBuf::from(&cfg.output_dir),
            base_url: cfg.public_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn lines(&self, audit_id: &str) -> Option<Vec<String>> {
        let audit = self.db.get_audit(audit_id).ok()??;
        let report = self.db.get_report(audit_id).ok()??;
        let c = report.severity_counts;
        let mut lines = vec![
            "Website Security Audit".to_string(),
            format!("Target: {}", audit.normalized_url),
            format!("Certificate: {}", report.certificate_number),
            format!("Security score: {:.1} / 10  Grade: {}", report.security_score, report.grade),
            format!("SSL grade: {}", report.ssl_grade.as_deref().unwrap_or("n/a")),
            format!(
                "Findings: {} critical, {} high, {} medium, {} low, {} info",
                c.critical, c.high, c.medium, c.low, c.info
            ),
        ];
        if let Some(summary) = report.report.get("executive_summary").and_then(|v| v.as_str()) {
            lines.push(summary.chars().take(110).collect());
        }
        if let Some(chains) = report.report.get("attack_chains").and_then(|v| v.as_array()) {
            for chain in chains.iter().take(10) {
                if let Some(name) = chain.get("name").and_then(|v| v.as_str()) {
                    lines.push(format!("Attack chain: {name}"));
                }
            }
        }
        Some(lines)
    }
}

#[async_trait]
impl PdfRenderer for LocalPdfRenderer {
    async fn render(&self, audit_id: &str) -> Option<String> {
        let Some(lines) = self.lines(audit_id) else {
            tracing::warn!(audit_id, "no report to render");
            return None;
        };
        let file = format!("{audit_id}.pdf");
        let written = std::fs::create_dir_all(&self.dir).and_then(|_| std::fs::write(self.dir.join(&file), minimal_pdf(&lines)));
        match written {
            Ok(()) => Some(format!("{}/{file}", self.base_url)),
            Err(e) => {
                tracing::warn!(audit_id, dir = %self.dir.display(), error = %e, "pdf write failed");
                None
            }
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

/// A single-page PDF 1.4 document with one line of Helvetica per entry.
pub fn minimal_pdf(lines: &[String]) -> Vec<u8> {
    let mut content = String::from("BT /F1 11 Tf 50 780 Td 14 TL\n");
    for line in lines {
        content.push_str(&format!("({}) Tj T*\n", escape(line)));
    }
    content.push_str("ET");

    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 842] /Resources << /Font << /F1 4 0 R >> >> /Contents 5 0 R >>"
            .to_string(),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
        format!("<< /Length {} >>\nstream\n{content}\nendstream", content.len()),
    ];

    let mut out = String::from("%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.push_str(&format!("{} 0 obj\n{body}\nendobj\n", i + 1));
    }
    let xref = out.len();
    out.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1));
    for off in offsets {
        out.push_str(&format!("{off:010} 00000 n \n"));
    }
    out.push_str(&format!("trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref}\n%%EOF\n", objects.len() + 1));
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_structure() {
        let pdf = String::from_utf8(minimal_pdf(&["Score (8.1)".to_string(), "naïve".to_string()])).unwrap();
        assert!(pdf.starts_with("%PDF-1.4"));
        assert!(pdf.trim_end().ends_with("%%EOF"));
        assert!(pdf.contains("(Score \\(8.1\\)) Tj"));
        assert!(pdf.contains("(na?ve) Tj"));
        let xref_at: usize = pdf.lines().rev().nth(1).unwrap().parse().unwrap();
        assert!(pdf[xref_at..].starts_with("xref"));
    }

    #[tokio::test]
    async fn missing_report_renders_nothing() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let cfg = ReportConfig { output_dir: std::env::temp_dir().join(audit_core::new_id()).display().to_string(), ..ReportConfig::default() };
        let r = LocalPdfRenderer::new(db, &cfg);
        assert_eq!(r.render("nope").await, None);
    }
}
