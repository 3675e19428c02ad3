//! Run-data store: append-oriented tagged key/value artifacts scoped to a
//! run.

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use foreman_db::models::{RunData, SortOrder};
use foreman_db::queries::run_data::{self, NewRunData, RunDataFilter, RunDataSortBy, TagMode};
use foreman_db::queries::{runs, tasks};
use foreman_db::{Db, TenantContext};

use crate::error::Error;
use crate::page::{validate_page, Page};

/// Maximum page size for run-data queries.
pub const MAX_QUERY_LIMIT: i64 = 1000;

/// Request to write a run-data entry.
#[derive(Debug, Clone)]
pub struct CreateRunData {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub key: String,
    pub value: Value,
    pub tags: Vec<String>,
    pub metadata: Option<Value>,
}

/// Query parameters for searching a run's data.
#[derive(Debug, Clone)]
pub struct QueryRunData {
    pub key: Option<String>,
    pub keys: Vec<String>,
    pub key_starts_with: Vec<String>,
    pub key_pattern: Option<String>,
    pub tags: Vec<String>,
    pub tag_starts_with: Vec<String>,
    pub tag_mode: TagMode,
    pub include_all: bool,
    pub limit: i64,
    pub offset: i64,
    pub sort_by: RunDataSortBy,
    pub sort_order: SortOrder,
}

impl Default for QueryRunData {
    fn default() -> Self {
        Self {
            key: None,
            keys: Vec::new(),
            key_starts_with: Vec::new(),
            key_pattern: None,
            tags: Vec::new(),
            tag_starts_with: Vec::new(),
            tag_mode: TagMode::Any,
            include_all: false,
            limit: 100,
            offset: 0,
            sort_by: RunDataSortBy::CreatedAt,
            sort_order: SortOrder::Desc,
        }
    }
}

/// Tag edit request: removals are applied before additions.
#[derive(Debug, Clone, Default)]
pub struct UpdateTags {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// Deletion selector: exactly one of `key` or `id` must be given.
#[derive(Debug, Clone, Default)]
pub struct DeleteRunData {
    pub key: Option<String>,
    pub id: Option<Uuid>,
}

/// Deduplicate tags preserving first-occurrence order.
fn dedup_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(tags.len());
    for tag in tags {
        if !seen.contains(&tag) {
            seen.push(tag);
        }
    }
    seen
}

/// Apply a tag edit to an existing sequence: remove first, then append any
/// added tags not already present.
fn apply_tag_edit(current: &[String], edit: &UpdateTags) -> Vec<String> {
    let mut tags: Vec<String> = current
        .iter()
        .filter(|t| !edit.remove.contains(t))
        .cloned()
        .collect();
    for tag in &edit.add {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    tags
}

/// Write a run-data entry. Never overwrites: each write is an independent
/// revision of its key.
pub async fn create_run_data(
    db: &Db,
    ctx: &TenantContext,
    req: CreateRunData,
) -> Result<RunData, Error> {
    let org_id = ctx.org_id().ok_or_else(|| {
        Error::Forbidden("run data creation requires an organization context".into())
    })?;
    if req.key.is_empty() {
        return Err(Error::InvalidInput("key is required".into()));
    }
    if req.key.len() > 255 {
        return Err(Error::InvalidInput("key exceeds 255 characters".into()));
    }
    if req.value.is_null() {
        return Err(Error::InvalidInput("value is required".into()));
    }

    let mut tx = ctx.begin(db).await?;

    runs::get_run(&mut tx, req.run_id)
        .await?
        .ok_or_else(|| Error::not_found("run", req.run_id))?;
    let task = tasks::get_task(&mut tx, req.task_id)
        .await?
        .ok_or_else(|| Error::not_found("task", req.task_id))?;
    if task.run_id != req.run_id {
        return Err(Error::InvalidInput(format!(
            "task {} does not belong to run {}",
            req.task_id, req.run_id
        )));
    }

    let new = NewRunData {
        run_id: req.run_id,
        task_id: req.task_id,
        org_id: org_id.to_owned(),
        key: req.key,
        value: req.value,
        metadata: req.metadata,
        tags: dedup_tags(req.tags),
    };
    let data = run_data::insert_run_data(&mut tx, &new).await?;
    tx.commit()
        .await
        .context("failed to commit run data creation")?;

    info!(data_id = %data.id, run_id = %data.run_id, key = %data.key, "run data created");
    Ok(data)
}

/// Search a run's data.
///
/// By default only the latest revision per key is returned; `include_all`
/// returns the full history. Pagination applies after the latest-per-key
/// collapse.
pub async fn query_run_data(
    db: &Db,
    ctx: &TenantContext,
    run_id: Uuid,
    params: QueryRunData,
) -> Result<Page<RunData>, Error> {
    validate_page(params.limit, params.offset, MAX_QUERY_LIMIT)?;

    let mut tx = ctx.begin(db).await?;

    runs::get_run(&mut tx, run_id)
        .await?
        .ok_or_else(|| Error::not_found("run", run_id))?;

    let filter = RunDataFilter {
        run_id,
        key: params.key,
        keys: params.keys,
        key_starts_with: params.key_starts_with,
        key_pattern: params.key_pattern,
        tags: params.tags,
        tag_starts_with: params.tag_starts_with,
        tag_mode: params.tag_mode,
    };
    let total = run_data::count_run_data(&mut tx, &filter, params.include_all).await?;
    let items = run_data::query_run_data(
        &mut tx,
        &filter,
        params.include_all,
        params.sort_by,
        params.sort_order,
        params.limit,
        params.offset,
    )
    .await?;
    tx.commit()
        .await
        .context("failed to commit run data query")?;

    Ok(Page {
        items,
        total,
        limit: params.limit,
        offset: params.offset,
    })
}

/// Edit the tag sequence of a run-data row.
///
/// Removals apply first, then additions (skipping tags already present), so
/// adding an existing tag is idempotent. `updated_at` is bumped even when
/// the resulting sequence is unchanged.
pub async fn update_run_data_tags(
    db: &Db,
    ctx: &TenantContext,
    data_id: Uuid,
    edit: UpdateTags,
) -> Result<RunData, Error> {
    let mut tx = ctx.begin(db).await?;
    let current = run_data::get_run_data_for_update(&mut tx, data_id)
        .await?
        .ok_or_else(|| Error::not_found("run data", data_id))?;

    let tags = apply_tag_edit(&current.tags, &edit);
    let data = run_data::update_tags(&mut tx, data_id, &tags).await?;
    tx.commit()
        .await
        .context("failed to commit run data tag update")?;

    debug!(data_id = %data_id, tags = ?data.tags, "run data tags updated");
    Ok(data)
}

/// Delete run-data rows by key (all revisions) or by id.
///
/// Returns the number of rows deleted; zero matches is `NotFound`.
pub async fn delete_run_data(
    db: &Db,
    ctx: &TenantContext,
    run_id: Uuid,
    selector: DeleteRunData,
) -> Result<u64, Error> {
    let deleted = match (&selector.key, &selector.id) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(Error::InvalidInput(
                "exactly one of key or id must be supplied".into(),
            ));
        }
        (Some(key), None) => {
            let mut tx = ctx.begin(db).await?;
            let n = run_data::delete_by_key(&mut tx, run_id, key).await?;
            tx.commit()
                .await
                .context("failed to commit run data deletion")?;
            n
        }
        (None, Some(id)) => {
            let mut tx = ctx.begin(db).await?;
            let n = run_data::delete_by_id(&mut tx, run_id, *id).await?;
            tx.commit()
                .await
                .context("failed to commit run data deletion")?;
            n
        }
    };

    if deleted == 0 {
        return Err(Error::NotFound(format!(
            "no run data matched in run {run_id}"
        )));
    }

    info!(run_id = %run_id, deleted, "run data deleted");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn dedup_preserves_first_occurrence_order() {
        let result = dedup_tags(tags(&["b", "a", "b", "c", "a"]));
        assert_eq!(result, tags(&["b", "a", "c"]));
    }

    #[test]
    fn tag_edit_removes_before_adding() {
        let current = tags(&["x", "y"]);
        let edit = UpdateTags {
            add: tags(&["x", "z"]),
            remove: tags(&["x"]),
        };
        // "x" is removed, then re-added at the end.
        assert_eq!(apply_tag_edit(&current, &edit), tags(&["y", "x", "z"]));
    }

    #[test]
    fn tag_add_is_idempotent() {
        let current = tags(&["a", "b"]);
        let edit = UpdateTags {
            add: tags(&["a"]),
            remove: Vec::new(),
        };
        assert_eq!(apply_tag_edit(&current, &edit), tags(&["a", "b"]));
    }

    #[test]
    fn tag_remove_of_absent_tags_is_noop() {
        let current = tags(&["a", "b"]);
        let edit = UpdateTags {
            add: Vec::new(),
            remove: tags(&["c", "d"]),
        };
        assert_eq!(apply_tag_edit(&current, &edit), tags(&["a", "b"]));
    }
}
