//! Database query functions for the `run_data` table.
//!
//! Run-data search is the one genuinely dynamic query in the schema: key
//! filters (exact / set / prefix / glob) are OR-combined, tag filters are
//! AND-combined on top, and the default "latest per key" mode collapses
//! revisions before sorting and paginating.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::models::{now_millis, RunData, SortOrder};

/// Sort key for run-data queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunDataSortBy {
    CreatedAt,
    UpdatedAt,
    Key,
}

impl RunDataSortBy {
    /// The column this key sorts on.
    pub fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Key => "key",
        }
    }
}

impl fmt::Display for RunDataSortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for RunDataSortBy {
    type Err = RunDataSortByParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(Self::CreatedAt),
            "updated_at" => Ok(Self::UpdatedAt),
            "key" => Ok(Self::Key),
            other => Err(RunDataSortByParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunDataSortBy`] string.
#[derive(Debug, Clone)]
pub struct RunDataSortByParseError(pub String);

impl fmt::Display for RunDataSortByParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run data sort key: {:?}", self.0)
    }
}

impl std::error::Error for RunDataSortByParseError {}

// ---------------------------------------------------------------------------

/// How multiple tag filters combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMode {
    /// At least one of the given tags (or prefixes) must match.
    #[default]
    Any,
    /// Every given tag (or prefix) must match. An empty list is trivially
    /// satisfied.
    All,
}

impl fmt::Display for TagMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Any => "any",
            Self::All => "all",
        };
        f.write_str(s)
    }
}

impl FromStr for TagMode {
    type Err = TagModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            other => Err(TagModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TagMode`] string.
#[derive(Debug, Clone)]
pub struct TagModeParseError(pub String);

impl fmt::Display for TagModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid tag mode: {:?}", self.0)
    }
}

impl std::error::Error for TagModeParseError {}

// ---------------------------------------------------------------------------
// LIKE-pattern helpers
// ---------------------------------------------------------------------------

/// Escape LIKE metacharacters so `s` matches literally.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("\\%"),
            '_' => out.push_str("\\_"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

/// Translate a glob pattern (`*` any run, `?` exactly one character) into a
/// LIKE pattern. Only `*` and `?` are wildcards; everything else, including
/// LIKE's own metacharacters, matches literally.
pub fn glob_to_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' => out.push_str("\\%"),
            '_' => out.push_str("\\_"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Parameters for inserting a new run-data row.
#[derive(Debug, Clone)]
pub struct NewRunData {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub org_id: String,
    pub key: String,
    pub value: Value,
    pub metadata: Option<Value>,
    /// Already deduplicated by the caller.
    pub tags: Vec<String>,
}

/// Insert a new run-data row. Never overwrites: every `(run_id, key)` write
/// is an independent revision.
pub async fn insert_run_data(conn: &mut PgConnection, new: &NewRunData) -> Result<RunData> {
    let now = now_millis();
    let data = sqlx::query_as::<_, RunData>(
        "INSERT INTO run_data \
         (id, run_id, task_id, org_id, key, value, metadata, tags, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.run_id)
    .bind(new.task_id)
    .bind(&new.org_id)
    .bind(&new.key)
    .bind(&new.value)
    .bind(&new.metadata)
    .bind(&new.tags)
    .bind(now)
    .fetch_one(conn)
    .await
    .context("failed to insert run data")?;

    Ok(data)
}

/// Fetch a run-data row and take a row lock for the remainder of the
/// transaction.
pub async fn get_run_data_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<RunData>> {
    let data = sqlx::query_as::<_, RunData>("SELECT * FROM run_data WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
        .context("failed to lock run data")?;

    Ok(data)
}

/// Replace the tag sequence on a row, bumping `updated_at`.
pub async fn update_tags(conn: &mut PgConnection, id: Uuid, tags: &[String]) -> Result<RunData> {
    let now = now_millis();
    let data = sqlx::query_as::<_, RunData>(
        "UPDATE run_data SET tags = $2, updated_at = $3 WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(tags)
    .bind(now)
    .fetch_one(conn)
    .await
    .context("failed to update run data tags")?;

    Ok(data)
}

/// Delete every revision of a key within a run. Returns the number of rows
/// deleted.
pub async fn delete_by_key(conn: &mut PgConnection, run_id: Uuid, key: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM run_data WHERE run_id = $1 AND key = $2")
        .bind(run_id)
        .bind(key)
        .execute(conn)
        .await
        .context("failed to delete run data by key")?;

    Ok(result.rows_affected())
}

/// Delete a single run-data row by id within a run. Returns the number of
/// rows deleted (0 or 1).
pub async fn delete_by_id(conn: &mut PgConnection, run_id: Uuid, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM run_data WHERE run_id = $1 AND id = $2")
        .bind(run_id)
        .bind(id)
        .execute(conn)
        .await
        .context("failed to delete run data by id")?;

    Ok(result.rows_affected())
}

/// Search filter over one run's data. Key clauses are OR-combined with each
/// other; tag clauses are AND-combined on top.
#[derive(Debug, Clone)]
pub struct RunDataFilter {
    pub run_id: Uuid,
    pub key: Option<String>,
    pub keys: Vec<String>,
    pub key_starts_with: Vec<String>,
    pub key_pattern: Option<String>,
    pub tags: Vec<String>,
    pub tag_starts_with: Vec<String>,
    pub tag_mode: TagMode,
}

impl RunDataFilter {
    fn has_key_clause(&self) -> bool {
        self.key.is_some()
            || !self.keys.is_empty()
            || !self.key_starts_with.is_empty()
            || self.key_pattern.is_some()
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &RunDataFilter) {
    qb.push("run_id = ").push_bind(filter.run_id);

    if filter.has_key_clause() {
        qb.push(" AND (");
        let mut first = true;
        if let Some(key) = &filter.key {
            qb.push("key = ").push_bind(key.clone());
            first = false;
        }
        if !filter.keys.is_empty() {
            if !first {
                qb.push(" OR ");
            }
            qb.push("key = ANY(").push_bind(filter.keys.clone()).push(")");
            first = false;
        }
        if !filter.key_starts_with.is_empty() {
            if !first {
                qb.push(" OR ");
            }
            let patterns: Vec<String> = filter
                .key_starts_with
                .iter()
                .map(|p| format!("{}%", escape_like(p)))
                .collect();
            qb.push("key LIKE ANY(").push_bind(patterns).push(")");
            first = false;
        }
        if let Some(pattern) = &filter.key_pattern {
            if !first {
                qb.push(" OR ");
            }
            qb.push("key LIKE ").push_bind(glob_to_like(pattern));
        }
        qb.push(")");
    }

    if !filter.tags.is_empty() {
        match filter.tag_mode {
            TagMode::Any => qb.push(" AND tags && "),
            TagMode::All => qb.push(" AND tags @> "),
        };
        qb.push_bind(filter.tags.clone()).push("::text[]");
    }

    if !filter.tag_starts_with.is_empty() {
        let patterns: Vec<String> = filter
            .tag_starts_with
            .iter()
            .map(|p| format!("{}%", escape_like(p)))
            .collect();
        match filter.tag_mode {
            TagMode::Any => {
                qb.push(" AND EXISTS (SELECT 1 FROM unnest(tags) AS t(tag) WHERE tag LIKE ANY(")
                    .push_bind(patterns)
                    .push("))");
            }
            TagMode::All => {
                for pattern in patterns {
                    qb.push(" AND EXISTS (SELECT 1 FROM unnest(tags) AS t(tag) WHERE tag LIKE ")
                        .push_bind(pattern)
                        .push(")");
                }
            }
        }
    }
}

/// Count matching rows. In latest-per-key mode (`include_all = false`) this
/// counts distinct keys, matching what the collapsed result set contains.
pub async fn count_run_data(
    conn: &mut PgConnection,
    filter: &RunDataFilter,
    include_all: bool,
) -> Result<i64> {
    let mut qb = QueryBuilder::new(if include_all {
        "SELECT COUNT(*) FROM run_data WHERE "
    } else {
        "SELECT COUNT(DISTINCT key) FROM run_data WHERE "
    });
    push_filter(&mut qb, filter);

    let count: i64 = qb
        .build_query_scalar()
        .fetch_one(conn)
        .await
        .context("failed to count run data")?;

    Ok(count)
}

/// Search a run's data.
///
/// With `include_all = false` (the default mode), revisions collapse to the
/// row with the greatest `created_at` per key (ties broken by `id`) before
/// sorting and pagination are applied.
pub async fn query_run_data(
    conn: &mut PgConnection,
    filter: &RunDataFilter,
    include_all: bool,
    sort_by: RunDataSortBy,
    sort_order: SortOrder,
    limit: i64,
    offset: i64,
) -> Result<Vec<RunData>> {
    let mut qb = QueryBuilder::new(if include_all {
        "SELECT * FROM run_data WHERE "
    } else {
        "SELECT * FROM (SELECT DISTINCT ON (key) * FROM run_data WHERE "
    });
    push_filter(&mut qb, filter);
    if !include_all {
        qb.push(" ORDER BY key, created_at DESC, id DESC) AS latest");
    }
    qb.push(" ORDER BY ")
        .push(sort_by.column())
        .push(" ")
        .push(sort_order.sql())
        .push(", id ")
        .push(sort_order.sql());
    qb.push(" LIMIT ").push_bind(limit);
    qb.push(" OFFSET ").push_bind(offset);

    let rows = qb
        .build_query_as::<RunData>()
        .fetch_all(conn)
        .await
        .context("failed to query run data")?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_becomes_percent() {
        assert_eq!(glob_to_like("a.*"), "a.%");
        assert_eq!(glob_to_like("*"), "%");
        assert_eq!(glob_to_like("*.end"), "%.end");
    }

    #[test]
    fn glob_question_becomes_underscore() {
        assert_eq!(glob_to_like("v?"), "v_");
        assert_eq!(glob_to_like("?a?"), "_a_");
    }

    #[test]
    fn glob_escapes_like_metacharacters() {
        assert_eq!(glob_to_like("100%"), "100\\%");
        assert_eq!(glob_to_like("a_b"), "a\\_b");
        assert_eq!(glob_to_like("a\\b"), "a\\\\b");
        assert_eq!(glob_to_like("a_b*"), "a\\_b%");
    }

    #[test]
    fn escape_like_is_literal() {
        assert_eq!(escape_like("sensor.temp"), "sensor.temp");
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
    }

    #[test]
    fn tag_mode_roundtrip() {
        for v in [TagMode::Any, TagMode::All] {
            let parsed: TagMode = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
        assert!("some".parse::<TagMode>().is_err());
        assert_eq!(TagMode::default(), TagMode::Any);
    }

    #[test]
    fn sort_by_roundtrip() {
        for v in [RunDataSortBy::CreatedAt, RunDataSortBy::UpdatedAt, RunDataSortBy::Key] {
            let parsed: RunDataSortBy = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
        assert!("value".parse::<RunDataSortBy>().is_err());
    }
}
