use audit_core::{AttackChain, ChainSource};
use rusqlite::params;

use crate::codec::{json, parse};
use crate::{Db, StoreError};

fn source_str(s: ChainSource) -> &'static str {
    match s {
        ChainSource::Rules => "rules",
        ChainSource::AiHint => "ai_hint",
    }
}

fn parse_source(s: &str) -> Result<ChainSource, String> {
    match s {
        "rules" => Ok(ChainSource::Rules),
        "ai_hint" => Ok(ChainSource::AiHint),
        other => Err(format!("unknown chain source: {other}")),
    }
}

impl Db {
    /// Replace the audit's chains. Correlation is re-runnable; the last run wins.
    pub fn replace_chains(&self, audit_id: &str, chains: &[AttackChain]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM attack_chains WHERE audit_id=?", [audit_id])?;
        for c in chains {
            tx.execute(
                "INSERT INTO attack_chains(chain_id,audit_id,name,steps_json,exploitability_score,impact,remediation_priority,severity,source)
                 VALUES (?,?,?,?,?,?,?,?,?)",
                params![
                    c.chain_id,
                    audit_id,
                    c.name,
                    serde_json::to_string(&c.steps)?,
                    c.exploitability_score.clamp(0.0, 10.0),
                    c.impact,
                    c.remediation_priority,
                    c.severity.as_str(),
                    source_str(c.source),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Ordered by remediation priority (1 first), then exploitability.
    pub fn list_chains(&self, audit_id: &str) -> Result<Vec<AttackChain>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT chain_id,audit_id,name,steps_json,exploitability_score,impact,remediation_priority,severity,source
             FROM attack_chains WHERE audit_id=? ORDER BY remediation_priority, exploitability_score DESC, chain_id",
        )?;
        let rows = stmt.query_map([audit_id], |r| {
            let source: String = r.get(8)?;
            Ok(AttackChain {
                chain_id: r.get(0)?,
                audit_id: r.get(1)?,
                name: r.get(2)?,
                steps: json(3, r.get(3)?)?,
                exploitability_score: r.get(4)?,
                impact: r.get(5)?,
                remediation_priority: r.get(6)?,
                severity: parse(7, r.get(7)?)?,
                source: parse_source(&source).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, e.into())
                })?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
