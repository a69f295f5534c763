//! Link and title extraction from HTML bodies.

use scraper::{Html, Selector};
use std::sync::OnceLock;
use url::Url;

const LINK_ATTRS: [&str; 3] = ["href", "src", "action"];

fn link_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("[href], [src], [action]").expect("link selector"))
}

fn title_sel() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("title").expect("title selector"))
}

/// Absolute http(s) links found in `body`, resolved against `base`, in
/// document order with duplicates removed. Fragments are dropped.
pub fn extract_links(base: &Url, body: &str) -> Vec<Url> {
    let doc = Html::parse_document(body);
    let mut out: Vec<Url> = Vec::new();
    let raws = doc.select(link_sel()).flat_map(|el| LINK_ATTRS.iter().filter_map(move |a| el.value().attr(a)));
    for raw in raws {
        let raw = raw.trim();
        let lower = raw.to_ascii_lowercase();
        if raw.is_empty()
            || raw.starts_with('#')
            || ["javascript:", "mailto:", "data:", "tel:"].iter().any(|p| lower.starts_with(p))
        {
            continue;
        }
        let Ok(mut u) = base.join(raw) else { continue };
        if !matches!(u.scheme(), "http" | "https") {
            continue;
        }
        u.set_fragment(None);
        if !out.contains(&u) {
            out.push(u);
        }
    }
    out
}

pub fn extract_title(body: &str) -> Option<String> {
    let doc = Html::parse_document(body);
    let t: String = doc.select(title_sel()).next()?.text().collect();
    let t = t.trim();
    (!t.is_empty()).then(|| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_and_filters_links() {
        let base = Url::parse("https://example.com/dir/page").unwrap();
        let body = r##"<a href="/a">A</a> <a href='b#frag'>B</a> <script src="https://cdn.example.com/x.js"></script>
            <a href="mailto:x@example.com">m</a> <a href="javascript:void(0)">j</a> <a href="#top">t</a>
            <form action="/login"></form> <a href="/a">again</a>"##;
        let got: Vec<String> = extract_links(&base, body).into_iter().map(|u| u.to_string()).collect();
        assert_eq!(
            got,
            [
                "https://example.com/a",
                "https://example.com/dir/b",
                "https://cdn.example.com/x.js",
                "https://example.com/login",
            ]
        );
    }

    #[test]
    fn commented_out_markup_is_not_followed() {
        let base = Url::parse("https://example.com/").unwrap();
        let body = r#"<!-- <a href="/old-admin">x</a> --><p data-x='href="/nope"'>t</p><A HREF=/shop>s</A>"#;
        let got: Vec<String> = extract_links(&base, body).into_iter().map(|u| u.to_string()).collect();
        assert_eq!(got, ["https://example.com/shop"]);
    }

    #[test]
    fn title() {
        assert_eq!(extract_title("<html><head><TITLE> Shop </TITLE></head>").as_deref(), Some("Shop"));
        assert_eq!(extract_title("<html></html>"), None);
    }
}
