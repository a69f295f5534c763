//! DNS posture: zone hygiene, mail authentication, CAA and dangling CNAMEs.

use async_trait::async_trait;
use audit_core::{NewFinding, Priority, RuntimeClass, Severity, Stage};
use crawler::FetchRequest;
use serde_json::json;
use std::sync::Arc;
use url::Url;

use crate::probes::RecordKind;
use crate::{AuditCtx, Detector, DetectorError, DetectorSpec};

pub(crate) fn detectors() -> Vec<Arc<dyn Detector>> {
    vec![Arc::new(DnsSecurity), Arc::new(EmailSecurity), Arc::new(CaaRecords), Arc::new(SubdomainTakeover)]
}

pub struct DnsSecurity;

#[async_trait]
impl Detector for DnsSecurity {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("dns_security", Stage::DnsResolution, Priority::Normal).weight(2).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let domain = ctx.root_domain();
        let url = format!("dns://{domain}/");
        let mut out = Vec::new();

        ctx.ensure_active()?;
        let ns = ctx.dns.records(&domain, RecordKind::Ns).await?;
        if ns.len() == 1 {
            out.push(
                NewFinding::new(name, "single_nameserver", Severity::Low, &url)
                    .evidence(json!({"nameservers": ns}))
                    .remediation("Delegate the zone to at least two nameservers on separate networks."),
            );
        }

        ctx.ensure_active()?;
        if ctx.dns.records(&domain, RecordKind::Dnskey).await?.is_empty() {
            out.push(
                NewFinding::new(name, "dnssec_not_enabled", Severity::Low, &url)
                    .remediation("Sign the zone with DNSSEC and publish the DS record at the registrar.")
                    .cwe("CWE-350"),
            );
        }

        ctx.ensure_active()?;
        let probe = format!("wildcard-check-7f3a.{domain}");
        if !ctx.dns.records(&probe, RecordKind::A).await?.is_empty() {
            out.push(
                NewFinding::new(name, "wildcard_dns", Severity::Info, &url)
                    .remediation("Avoid wildcard records unless every name they answer for is intended to be served."),
            );
        }
        Ok(out)
    }
}

pub struct EmailSecurity;

#[async_trait]
impl Detector for EmailSecurity {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("email_security", Stage::DnsResolution, Priority::Low).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let domain = ctx.root_domain();
        let url = format!("dns://{domain}/");
        let mut out = Vec::new();

        ctx.ensure_active()?;
        let txt = ctx.dns.records(&domain, RecordKind::Txt).await?;
        let spf: Vec<&String> = txt.iter().filter(|t| t.to_ascii_lowercase().starts_with("v=spf1")).collect();
        match spf.as_slice() {
            [] => out.push(
                NewFinding::new(name, "missing_spf", Severity::Medium, &url)
                    .remediation("Publish an SPF record listing the hosts allowed to send mail for the domain, ending in -all.")
                    .cwe("CWE-290")
                    .owasp("A05:2021"),
            ),
            [record] => {
                let terms: Vec<String> = record.split_whitespace().map(|t| t.to_ascii_lowercase()).collect();
                if terms.iter().any(|t| t == "+all" || t == "all") {
                    out.push(
                        NewFinding::new(name, "spf_allows_all", Severity::High, &url)
                            .evidence(json!({"record": record}))
                            .remediation("Replace +all with -all (or ~all while migrating).")
                            .cwe("CWE-290")
                            .owasp("A05:2021"),
                    );
                } else if terms.iter().any(|t| t == "?all") {
                    out.push(
                        NewFinding::new(name, "spf_neutral_all", Severity::Low, &url)
                            .evidence(json!({"record": record}))
                            .remediation("End the SPF record with -all or ~all."),
                    );
                }
            }
            many => out.push(
                NewFinding::new(name, "multiple_spf_records", Severity::Low, &url)
                    .evidence(json!({"count": many.len()}))
                    .remediation("Merge the SPF records into one; multiple records make SPF evaluation fail."),
            ),
        }

        ctx.ensure_active()?;
        let dmarc = ctx.dns.records(&format!("_dmarc.{domain}"), RecordKind::Txt).await?;
        match dmarc.iter().find(|t| t.to_ascii_lowercase().starts_with("v=dmarc1")) {
            None => out.push(
                NewFinding::new(name, "missing_dmarc", Severity::Medium, &url)
                    .remediation("Publish a DMARC record, starting with p=none and reporting, then move to quarantine or reject.")
                    .cwe("CWE-290")
                    .owasp("A05:2021"),
            ),
            Some(record) => {
                let policy = record
                    .split(';')
                    .map(str::trim)
                    .find_map(|kv| kv.strip_prefix("p="))
                    .map(|p| p.trim().to_ascii_lowercase())
                    .unwrap_or_default();
                if policy == "none" || policy.is_empty() {
                    out.push(
                        NewFinding::new(name, "dmarc_policy_none", Severity::Low, &url)
                            .evidence(json!({"record": record}))
                            .remediation("Move the DMARC policy to quarantine or reject once reports look clean."),
                    );
                }
            }
        }
        Ok(out)
    }
}

pub struct CaaRecords;

#[async_trait]
impl Detector for CaaRecords {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("caa_records", Stage::DnsResolution, Priority::Low).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        ctx.ensure_active()?;
        let domain = ctx.root_domain();
        if !ctx.dns.records(&domain, RecordKind::Caa).await?.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![NewFinding::new(self.spec().name, "missing_caa", Severity::Low, format!("dns://{domain}/"))
            .remediation("Publish CAA records naming the certificate authorities allowed to issue for the domain.")
            .cwe("CWE-295")])
    }
}

/// Hosting services whose unclaimed resources answer with a recognizable page.
const TAKEOVER_SERVICES: &[(&str, &str, &str)] = &[
    ("github.io", "GitHub Pages", "There isn't a GitHub Pages site here"),
    ("herokuapp.com", "Heroku", "No such app"),
    ("herokudns.com", "Heroku", "No such app"),
    ("s3.amazonaws.com", "AWS S3", "NoSuchBucket"),
    ("s3-website", "AWS S3", "NoSuchBucket"),
    ("azurewebsites.net", "Azure App Service", "404 Web Site not found"),
    ("trafficmanager.net", "Azure Traffic Manager", "404 Web Site not found"),
    ("blob.core.windows.net", "Azure Blob Storage", "The specified container does not exist"),
    ("myshopify.com", "Shopify", "Sorry, this shop is currently unavailable"),
    ("fastly.net", "Fastly", "Fastly error: unknown domain"),
    ("ghost.io", "Ghost", "The thing you were looking for is no longer here"),
    ("surge.sh", "Surge", "project not found"),
    ("bitbucket.io", "Bitbucket", "Repository not found"),
    ("pantheonsite.io", "Pantheon", "The gods are wise"),
    ("zendesk.com", "Zendesk", "Help Center Closed"),
    ("readme.io", "ReadMe", "Project doesnt exist"),
    ("netlify.app", "Netlify", "Not Found - Request ID"),
    ("wpengine.com", "WP Engine", "The site you were looking for couldn't be found"),
];

const COMMON_PREFIXES: &[&str] =
    &["www", "api", "app", "blog", "shop", "dev", "staging", "test", "docs", "help", "status", "cdn", "assets", "mail", "admin"];

pub struct SubdomainTakeover;

#[async_trait]
impl Detector for SubdomainTakeover {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("subdomain_takeover", Stage::DnsResolution, Priority::Normal)
            .weight(3)
            .runtime(RuntimeClass::Moderate)
            .network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let domain = ctx.root_domain();
        let mut hosts = vec![ctx.host().to_string()];
        for p in COMMON_PREFIXES.iter().take(ctx.probe_budget()) {
            let h = format!("{p}.{domain}");
            if !hosts.contains(&h) {
                hosts.push(h);
            }
        }

        let mut out = Vec::new();
        for host in hosts {
            ctx.ensure_active()?;
            let cnames = match ctx.dns.records(&host, RecordKind::Cname).await {
                Ok(c) => c,
                Err(DetectorError::Cancelled) => return Err(DetectorError::Cancelled),
                Err(e) => {
                    tracing::debug!(audit_id = %ctx.audit_id, %host, error = %e, "cname lookup failed");
                    continue;
                }
            };
            let Some(cname) = cnames.first().map(|c| c.to_ascii_lowercase()) else { continue };
            let Some((_, service, signature)) = TAKEOVER_SERVICES.iter().find(|(pat, _, _)| cname.contains(pat)) else {
                continue;
            };
            let site = format!("https://{host}/");

            ctx.ensure_active()?;
            if ctx.dns.records(&cname, RecordKind::A).await.map(|a| a.is_empty()).unwrap_or(false) {
                out.push(
                    NewFinding::new(name, "dangling_cname", Severity::Medium, &site)
                        .evidence(json!({"host": host, "cname": cname, "service": service}))
                        .remediation("Remove the CNAME or reclaim the resource it points to.")
                        .cwe("CWE-672")
                        .owasp("A05:2021"),
                );
            }

            let Ok(u) = Url::parse(&site) else { continue };
            if let Some(resp) = ctx.probe(FetchRequest::get(u)).await? {
                if resp.text().contains(signature) {
                    out.push(
                        NewFinding::new(name, "subdomain_takeover", Severity::High, &site)
                            .confidence(0.9)
                            .evidence(json!({"host": host, "cname": cname, "service": service}))
                            .remediation(format!("Claim the {service} resource the CNAME points to, or delete the record."))
                            .cwe("CWE-284")
                            .owasp("A05:2021"),
                    );
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{ctx_with, types};
    use crate::probes::{StaticDns, StaticTls};
    use crawler::ScriptedFetcher;

    fn run_ctx(dns: StaticDns, fetcher: ScriptedFetcher) -> AuditCtx {
        ctx_with("https://www.example.com/", fetcher, Vec::new(), dns, StaticTls::default())
    }

    #[tokio::test]
    async fn zone_hygiene() {
        let dns = StaticDns::new().with("example.com", RecordKind::Ns, &["ns1.host.net"]);
        let f = DnsSecurity.run(&run_ctx(dns, ScriptedFetcher::new()), &json!({})).await.unwrap();
        assert_eq!(types(&f), ["dnssec_not_enabled", "single_nameserver"]);

        let dns = StaticDns::new()
            .with("example.com", RecordKind::Ns, &["ns1.host.net", "ns2.host.net"])
            .with("example.com", RecordKind::Dnskey, &["257 3 13 abc"]);
        assert!(DnsSecurity.run(&run_ctx(dns, ScriptedFetcher::new()), &json!({})).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mail_auth() {
        let f = EmailSecurity.run(&run_ctx(StaticDns::new(), ScriptedFetcher::new()), &json!({})).await.unwrap();
        assert_eq!(types(&f), ["missing_dmarc", "missing_spf"]);

        let dns = StaticDns::new()
            .with("example.com", RecordKind::Txt, &["v=spf1 include:_spf.google.com +all"])
            .with("_dmarc.example.com", RecordKind::Txt, &["v=DMARC1; p=none; rua=mailto:d@example.com"]);
        let f = EmailSecurity.run(&run_ctx(dns, ScriptedFetcher::new()), &json!({})).await.unwrap();
        assert_eq!(types(&f), ["dmarc_policy_none", "spf_allows_all"]);

        let dns = StaticDns::new()
            .with("example.com", RecordKind::Txt, &["v=spf1 mx -all"])
            .with("_dmarc.example.com", RecordKind::Txt, &["v=DMARC1; p=reject"]);
        assert!(EmailSecurity.run(&run_ctx(dns, ScriptedFetcher::new()), &json!({})).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolver_failure_is_transient() {
        let dns = StaticDns::new().failing("example.com");
        let e = CaaRecords.run(&run_ctx(dns, ScriptedFetcher::new()), &json!({})).await.unwrap_err();
        assert!(e.is_transient());
    }

    #[tokio::test]
    async fn takeover_needs_signature() {
        let dns = StaticDns::new()
            .with("blog.example.com", RecordKind::Cname, &["acme.github.io"])
            .with("acme.github.io", RecordKind::A, &["185.199.108.153"]);
        let fetcher = ScriptedFetcher::new().page(
            "https://blog.example.com/",
            404,
            "text/html",
            &[],
            "<h1>404</h1><p>There isn't a GitHub Pages site here.</p>",
        );
        let f = SubdomainTakeover.run(&run_ctx(dns, fetcher), &json!({})).await.unwrap();
        assert_eq!(types(&f), ["subdomain_takeover"]);
        assert_eq!(f[0].url, "https://blog.example.com/");

        let dns = StaticDns::new().with("shop.example.com", RecordKind::Cname, &["gone.myshopify.com"]);
        let f = SubdomainTakeover.run(&run_ctx(dns, ScriptedFetcher::new()), &json!({})).await.unwrap();
        assert_eq!(types(&f), ["dangling_cname"]);
    }

    #[tokio::test]
    async fn cancelled_before_lookup() {
        let c = run_ctx(StaticDns::new(), ScriptedFetcher::new());
        c.cancel.cancel();
        assert_eq!(DnsSecurity.run(&c, &json!({})).await.unwrap_err(), DetectorError::Cancelled);
    }
}
