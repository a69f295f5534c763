//! Column <-> domain conversions shared by the table modules.

use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use std::str::FromStr;

pub(crate) fn parse<T: FromStr<Err = String>>(idx: usize, s: String) -> rusqlite::Result<T> {
    s.parse::<T>().map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

pub(crate) fn parse_opt<T: FromStr<Err = String>>(idx: usize, s: Option<String>) -> rusqlite::Result<Option<T>> {
    s.map(|v| parse(idx, v)).transpose()
}

pub(crate) fn json<T: DeserializeOwned>(idx: usize, s: String) -> rusqlite::Result<T> {
    serde_json::from_str(&s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn flag(b: bool) -> i64 {
    if b { 1 } else { 0 }
}
