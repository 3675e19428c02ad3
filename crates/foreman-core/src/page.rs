//! Pagination envelope shared by every list operation.

use serde::Serialize;

use crate::error::Error;

/// One page of results plus the total match count under the same filter.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Validate limit/offset against a per-endpoint maximum.
pub fn validate_page(limit: i64, offset: i64, max_limit: i64) -> Result<(), Error> {
    if limit < 1 || limit > max_limit {
        return Err(Error::InvalidInput(format!(
            "limit must be between 1 and {max_limit}, got {limit}"
        )));
    }
    if offset < 0 {
        return Err(Error::InvalidInput(format!(
            "offset must be non-negative, got {offset}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_bounds_enforced() {
        assert!(validate_page(1, 0, 100).is_ok());
        assert!(validate_page(100, 0, 100).is_ok());
        assert!(validate_page(0, 0, 100).is_err());
        assert!(validate_page(101, 0, 100).is_err());
        assert!(validate_page(1000, 0, 1000).is_ok());
        assert!(validate_page(1001, 0, 1000).is_err());
    }

    #[test]
    fn negative_offset_rejected() {
        assert!(validate_page(20, -1, 100).is_err());
        assert!(validate_page(20, 0, 100).is_ok());
    }
}
