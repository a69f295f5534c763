use audit_core::PageRecord;
use rusqlite::params;

use crate::codec::json;
use crate::{Db, StoreError};

impl Db {
    /// Persist a crawled page. Returns false if the URL was already stored
    /// for this audit (a resumed crawl refetching its frontier).
    pub fn put_page(&self, audit_id: &str, page: &PageRecord, now_ms: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM crawl_pages WHERE audit_id=?",
            [audit_id],
            |r| r.get(0),
        )?;
        let n = tx.execute(
            "INSERT OR IGNORE INTO crawl_pages(audit_id,url,seq,status,content_type,headers_json,body_hash,body,links_json,fetched_at_ms)
             VALUES (?,?,?,?,?,?,?,?,?,?)",
            params![
                audit_id,
                page.url,
                seq,
                page.status,
                page.content_type,
                serde_json::to_string(&page.headers)?,
                page.body_hash,
                page.body,
                serde_json::to_string(&page.links)?,
                now_ms,
            ],
        )?;
        tx.commit()?;
        Ok(n > 0)
    }

    /// Pages in fetch order.
    pub fn list_pages(&self, audit_id: &str) -> Result<Vec<PageRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT url,status,content_type,headers_json,body_hash,body,links_json FROM crawl_pages WHERE audit_id=? ORDER BY seq",
        )?;
        let rows = stmt.query_map([audit_id], |r| {
            Ok(PageRecord {
                url: r.get(0)?,
                status: r.get(1)?,
                content_type: r.get(2)?,
                headers: json(3, r.get(3)?)?,
                body_hash: r.get(4)?,
                body: r.get(5)?,
                links: json(6, r.get(6)?)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn page_urls(&self, audit_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT url FROM crawl_pages WHERE audit_id=? ORDER BY seq")?;
        let rows = stmt.query_map([audit_id], |r| r.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn count_pages(&self, audit_id: &str) -> Result<u32, StoreError> {
        let n: u32 =
            self.conn()?.query_row("SELECT COUNT(1) FROM crawl_pages WHERE audit_id=?", [audit_id], |r| r.get(0))?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audits::tests::sample_audit;

    fn page(url: &str) -> PageRecord {
        PageRecord {
            url: url.into(),
            status: 200,
            content_type: Some("text/html".into()),
            headers: vec![("server".into(), "nginx".into())],
            body_hash: "h".into(),
            body: "<html></html>".into(),
            links: vec!["https://example.com/b".into()],
        }
    }

    #[test]
    fn pages_keep_fetch_order_and_dedupe() {
        let db = Db::open_in_memory().unwrap();
        db.insert_audit(&sample_audit("a1", "u1", 0)).unwrap();
        assert!(db.put_page("a1", &page("https://example.com/"), 1).unwrap());
        assert!(db.put_page("a1", &page("https://example.com/b"), 2).unwrap());
        assert!(!db.put_page("a1", &page("https://example.com/"), 3).unwrap());
        let pages = db.list_pages("a1").unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0], page("https://example.com/"));
        assert_eq!(db.page_urls("a1").unwrap()[1], "https://example.com/b");
    }
}
