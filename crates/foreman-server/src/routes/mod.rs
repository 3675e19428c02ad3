//! HTTP route handlers, grouped per resource.

pub mod config;
pub mod health;
pub mod run_data;
pub mod runs;
pub mod tasks;

use serde::Serialize;

use foreman_core::Page;

/// Listing envelope: `{ data, pagination: { total, limit, offset } }`.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

impl<T> From<Page<T>> for ListResponse<T> {
    fn from(page: Page<T>) -> Self {
        Self {
            data: page.items,
            pagination: Pagination {
                total: page.total,
                limit: page.limit,
                offset: page.offset,
            },
        }
    }
}

/// Split a comma-separated query value into trimmed, non-empty parts.
pub(crate) fn split_csv(value: Option<String>) -> Vec<String> {
    value
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
