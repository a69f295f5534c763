//! API surface: published schemas, GraphQL introspection, cloud storage.

use async_trait::async_trait;
use audit_core::{NewFinding, Priority, RuntimeClass, Severity, Stage};
use crawler::FetchRequest;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use url::Url;

use crate::support::crawl_urls;
use crate::{AuditCtx, Detector, DetectorError, DetectorSpec};

pub(crate) fn detectors() -> Vec<Arc<dyn Detector>> {
    vec![Arc::new(ApiDiscovery), Arc::new(GraphQl), Arc::new(CloudPosture)]
}

const DOC_PATHS: &[&str] = &[
    "/swagger.json",
    "/openapi.json",
    "/v3/api-docs",
    "/v2/api-docs",
    "/swagger-ui.html",
    "/swagger-ui/",
    "/api-docs",
    "/api/swagger.json",
    "/api/openapi.json",
    "/.well-known/openapi.json",
];

fn is_api_doc(body: &str) -> bool {
    let head: String = body.chars().take(2048).collect();
    head.contains("\"swagger\"") || head.contains("\"openapi\"") || head.contains("swagger-ui") || head.starts_with("openapi:")
}

pub struct ApiDiscovery;

#[async_trait]
impl Detector for ApiDiscovery {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("api_discovery", Stage::ApiDiscovery, Priority::Normal).weight(2).runtime(RuntimeClass::Moderate).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        for path in DOC_PATHS.iter().take(ctx.probe_budget()) {
            let Some(url) = ctx.url_for(path) else { continue };
            let Some(resp) = ctx.probe(FetchRequest::get(url.clone()).no_redirects()).await? else { continue };
            if resp.status == 200 && is_api_doc(&resp.text()) {
                out.push(
                    NewFinding::new(name, "api_docs_exposed", Severity::Medium, url.as_str())
                        .evidence(json!({"path": path}))
                        .remediation("Serve API documentation only to authenticated developers.")
                        .cwe("CWE-200")
                        .owasp("A05:2021"),
                );
            }
        }
        let endpoints: BTreeSet<String> = crawl_urls(ctx)
            .into_iter()
            .filter(|u| u.path().starts_with("/api/") || u.path().contains("/rest/") || u.path().ends_with(".json"))
            .map(|mut u| {
                u.set_query(None);
                u.to_string()
            })
            .collect();
        if !endpoints.is_empty() {
            out.push(
                NewFinding::new(name, "api_endpoints_discovered", Severity::Info, ctx.target.as_str())
                    .evidence(json!({"endpoints": endpoints}))
                    .remediation("Check each endpoint enforces authentication and rate limits."),
            );
        }
        Ok(out)
    }
}

const INTROSPECTION: &str = "{__schema{queryType{name}types{name}}}";

pub struct GraphQl;

#[async_trait]
impl Detector for GraphQl {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("graphql", Stage::ApiDiscovery, Priority::Normal).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut candidates: Vec<Url> = ["/graphql", "/api/graphql", "/graphql/v1", "/v1/graphql"].iter().filter_map(|p| ctx.url_for(p)).collect();
        for u in crawl_urls(ctx) {
            if u.path().to_ascii_lowercase().contains("graphql") {
                let mut u = u;
                u.set_query(None);
                if !candidates.contains(&u) {
                    candidates.push(u);
                }
            }
        }
        let mut out = Vec::new();
        for endpoint in candidates.into_iter().take(ctx.probe_budget()) {
            let mut probe = endpoint.clone();
            probe.query_pairs_mut().append_pair("query", INTROSPECTION);
            let req = FetchRequest::get(probe).header("Accept", "application/json").no_redirects();
            let Some(resp) = ctx.probe(req).await? else { continue };
            if resp.status != 200 {
                continue;
            }
            let Ok(body) = serde_json::from_slice::<serde_json::Value>(&resp.body) else { continue };
            let types = body.pointer("/data/__schema/types").and_then(|t| t.as_array()).map(|t| t.len());
            if let Some(count) = types {
                out.push(
                    NewFinding::new(name, "graphql_introspection_enabled", Severity::Medium, endpoint.as_str())
                        .evidence(json!({"types": count}))
                        .remediation("Disable introspection in production and enforce query depth and cost limits.")
                        .cwe("CWE-200")
                        .owasp("A05:2021"),
                );
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Bucket {
    S3(String),
    Gcs(String),
    Azure(String),
}

impl Bucket {
    fn provider(&self) -> &'static str {
        match self {
            Bucket::S3(_) => "aws_s3",
            Bucket::Gcs(_) => "gcs",
            Bucket::Azure(_) => "azure_blob",
        }
    }

    fn name(&self) -> &str {
        match self {
            Bucket::S3(n) | Bucket::Gcs(n) | Bucket::Azure(n) => n,
        }
    }

    /// Where an anonymous listing would be served. Azure needs a container name.
    fn listing_url(&self) -> Option<Url> {
        match self {
            Bucket::S3(n) if !n.contains('.') => Url::parse(&format!("https://{n}.s3.amazonaws.com/")).ok(),
            Bucket::S3(n) => Url::parse(&format!("https://s3.amazonaws.com/{n}/")).ok(),
            Bucket::Gcs(n) => Url::parse(&format!("https://storage.googleapis.com/{n}/")).ok(),
            Bucket::Azure(_) => None,
        }
    }
}

fn bucket_res() -> &'static [(Regex, fn(String) -> Bucket)] {
    static RE: OnceLock<Vec<(Regex, fn(String) -> Bucket)>> = OnceLock::new();
    RE.get_or_init(|| {
        let table: [(&str, fn(String) -> Bucket); 4] = [
            (r"([a-z0-9][a-z0-9.-]{1,61}[a-z0-9])\.s3(?:[.-][a-z0-9-]+)?\.amazonaws\.com", Bucket::S3),
            (r"//s3(?:[.-][a-z0-9-]+)?\.amazonaws\.com/([a-z0-9][a-z0-9.-]{1,61}[a-z0-9])", Bucket::S3),
            (r"storage\.googleapis\.com/([a-z0-9][a-z0-9._-]{1,61}[a-z0-9])", Bucket::Gcs),
            (r"([a-z0-9]{3,24})\.blob\.core\.windows\.net", Bucket::Azure),
        ];
        table.into_iter().map(|(p, f)| (Regex::new(p).expect("bucket regex"), f)).collect()
    })
}

fn buckets_in(body: &str) -> BTreeSet<Bucket> {
    let mut out = BTreeSet::new();
    for (re, make) in bucket_res() {
        for c in re.captures_iter(body) {
            out.insert(make(c[1].to_string()));
        }
    }
    out
}

/// Cloud storage the site links to, and whether it lists anonymously.
pub struct CloudPosture;

#[async_trait]
impl Detector for CloudPosture {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("cloud_posture", Stage::ApiDiscovery, Priority::Low).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut found: Vec<(String, Bucket)> = Vec::new();
        for p in ctx.pages.iter() {
            for b in buckets_in(&p.body) {
                if !found.iter().any(|(_, f)| *f == b) {
                    found.push((p.url.clone(), b));
                }
            }
        }
        let mut out = Vec::new();
        for (i, (at, bucket)) in found.into_iter().enumerate() {
            out.push(
                NewFinding::new(name, "cloud_storage_reference", Severity::Info, &at)
                    .evidence(json!({"provider": bucket.provider(), "bucket": bucket.name()}))
                    .remediation("Keep buckets private and serve public assets through a CDN with explicit object ACLs."),
            );
            if i >= ctx.probe_budget() {
                continue;
            }
            let Some(listing) = bucket.listing_url() else { continue };
            let Some(resp) = ctx.probe(FetchRequest::get(listing.clone()).no_redirects()).await? else { continue };
            if resp.status == 200 && resp.text().contains("<ListBucketResult") {
                out.push(
                    NewFinding::new(name, "public_bucket_listing", Severity::High, listing.as_str())
                        .evidence(json!({"provider": bucket.provider(), "bucket": bucket.name(), "referenced_from": at}))
                        .remediation("Block public listing on the bucket and review object ACLs.")
                        .cwe("CWE-284")
                        .owasp("A01:2021"),
                );
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{ctx, html, types};
    use crawler::ScriptedFetcher;

    #[tokio::test]
    async fn swagger_and_endpoints() {
        let fetcher = ScriptedFetcher::new()
            .page("https://example.com/v3/api-docs", 200, "application/json", &[], r#"{"openapi":"3.0.1","paths":{}}"#)
            .html("https://example.com/swagger-ui.html", "<html>Not here</html>");
        let mut home = html("https://example.com/", &[], "");
        home.links = vec!["https://example.com/api/users?page=2".into(), "https://example.com/about".into()];
        let c = ctx("https://example.com/", fetcher, vec![home]);
        let f = ApiDiscovery.run(&c, &json!({})).await.unwrap();
        assert_eq!(types(&f), ["api_docs_exposed", "api_endpoints_discovered"]);
        let eps = f.iter().find(|x| x.finding_type == "api_endpoints_discovered").unwrap();
        assert_eq!(eps.evidence["endpoints"], json!(["https://example.com/api/users"]));
    }

    #[tokio::test]
    async fn introspection_answered() {
        let probe = format!("https://example.com/graphql?query={}", url::form_urlencoded::byte_serialize(INTROSPECTION.as_bytes()).collect::<String>());
        let fetcher = ScriptedFetcher::new().page(
            &probe,
            200,
            "application/json",
            &[],
            r#"{"data":{"__schema":{"queryType":{"name":"Query"},"types":[{"name":"Query"},{"name":"User"}]}}}"#,
        );
        let c = ctx("https://example.com/", fetcher, Vec::new());
        let f = GraphQl.run(&c, &json!({})).await.unwrap();
        assert_eq!(types(&f), ["graphql_introspection_enabled"]);
        assert_eq!(f[0].url, "https://example.com/graphql");
        assert_eq!(f[0].evidence["types"], 2);
    }

    #[test]
    fn bucket_references() {
        let body = r#"<img src="https://assets-prod.s3.amazonaws.com/a.png">
            <a href="https://s3.us-east-1.amazonaws.com/media.example.com/x">x</a>
            <script src="https://storage.googleapis.com/static-bkt/app.js"></script>
            <img src="https://acct01.blob.core.windows.net/c/x.png">"#;
        let b: Vec<Bucket> = buckets_in(body).into_iter().collect();
        assert_eq!(
            b,
            [
                Bucket::S3("assets-prod".into()),
                Bucket::S3("media.example.com".into()),
                Bucket::Gcs("static-bkt".into()),
                Bucket::Azure("acct01".into()),
            ]
        );
        assert_eq!(b[1].listing_url().unwrap().as_str(), "https://s3.amazonaws.com/media.example.com/");
    }

    #[tokio::test]
    async fn open_bucket() {
        let page = html("https://example.com/", &[], r#"<img src="https://open-bkt.s3.amazonaws.com/logo.png">"#);
        let fetcher = ScriptedFetcher::new().page(
            "https://open-bkt.s3.amazonaws.com/",
            200,
            "application/xml",
            &[],
            "<?xml version=\"1.0\"?><ListBucketResult><Name>open-bkt</Name></ListBucketResult>",
        );
        let c = ctx("https://example.com/", fetcher, vec![page]);
        let f = CloudPosture.run(&c, &json!({})).await.unwrap();
        assert_eq!(types(&f), ["cloud_storage_reference", "public_bucket_listing"]);
    }
}
