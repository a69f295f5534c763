//! Technology hints from response headers, title and body.

use audit_core::PageRecord;

use crate::links::extract_title;

pub fn fingerprint_page(page: &PageRecord) -> Vec<String> {
    let title = if page.is_html() { extract_title(&page.body) } else { None };
    compute_fingerprints(&page.headers, title.as_deref(), &page.body)
}

pub fn compute_fingerprints(headers: &[(String, String)], title: Option<&str>, body: &str) -> Vec<String> {
    let header = |name: &str| headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.to_lowercase());
    let mut fps: Vec<String> = Vec::new();
    if let Some(l) = header("server") {
        for (needle, tag) in [
            ("nginx", "server:nginx"),
            ("apache", "server:apache"),
            ("iis", "server:iis"),
            ("cloudflare", "cdn:cloudflare"),
            ("caddy", "server:caddy"),
            ("litespeed", "server:litespeed"),
            ("openresty", "server:openresty"),
        ] {
            if l.contains(needle) {
                fps.push(tag.into());
            }
        }
    }
    if let Some(l) = header("x-powered-by") {
        for (needle, tag) in [
            ("php", "lang:php"),
            ("express", "framework:express"),
            ("asp.net", "framework:aspnet"),
            ("django", "framework:django"),
            ("next.js", "framework:nextjs"),
        ] {
            if l.contains(needle) {
                fps.push(tag.into());
            }
        }
    }
    if header("x-aspnet-version").is_some() {
        fps.push("framework:aspnet".into());
    }
    if header("x-jenkins").is_some() {
        fps.push("product:jenkins".into());
    }
    if header("x-drupal-cache").is_some() {
        fps.push("cms:drupal".into());
    }
    if header("x-amz-cf-id").is_some() {
        fps.push("cdn:cloudfront".into());
    }

    if let Some(t) = title.map(str::to_lowercase) {
        for (needle, tag) in [
            ("index of /", "feature:dir-listing"),
            ("wordpress", "cms:wordpress"),
            ("grafana", "product:grafana"),
            ("kibana", "product:kibana"),
            ("jenkins", "product:jenkins"),
            ("phpmyadmin", "product:phpmyadmin"),
        ] {
            if t.contains(needle) {
                fps.push(tag.into());
            }
        }
    }

    let bl = body.to_lowercase();
    for (needle, tag) in [
        ("wp-content/", "cms:wordpress"),
        ("joomla!", "cms:joomla"),
        ("/sites/default/files", "cms:drupal"),
        ("ng-app", "js:angular"),
        ("react-dom", "js:react"),
        ("data-reactroot", "js:react"),
        ("__next_data__", "framework:nextjs"),
        ("window.__nuxt", "framework:nuxt"),
        ("cdn.shopify.com", "platform:shopify"),
    ] {
        if bl.contains(needle) {
            fps.push(tag.into());
        }
    }
    fps.sort();
    fps.dedup();
    fps
}
