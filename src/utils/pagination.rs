use serde::{Deserialize, Serialize};

use crate::utils::constants::{DEFAULT_LIMIT, DEFAULT_PAGE, MAX_LIMIT};

/// Query-string parameters accepted by the listing endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaginationQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl PaginationQuery {
    pub fn resolve(&self, total: usize) -> Pagination {
        Pagination::new(
            self.page.unwrap_or(DEFAULT_PAGE),
            self.limit.unwrap_or(DEFAULT_LIMIT),
            total,
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
    pub has_prev: bool,
    pub has_next: bool,
}

impl Pagination {
    /// Pages are 1-based; a zero page or limit is clamped to 1.
    pub fn new(page: usize, limit: usize, total: usize) -> Self {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_LIMIT);
        let total_pages = total.div_ceil(limit).max(1);

        Self {
            page,
            limit,
            total,
            total_pages,
            has_prev: page > 1,
            has_next: page < total_pages,
        }
    }

    /// A single page covering everything up to `limit` rows.
    pub fn first(limit: usize) -> Self {
        Self::new(1, limit, limit)
    }

    pub fn offset(&self) -> usize {
        (self.page - 1) * self.limit
    }
}
