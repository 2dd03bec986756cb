use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
}

impl Pagination {
    pub fn new(page: u32, limit: u32, total: i64) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            (total + limit as i64 - 1) / limit as i64
        };
        Self {
            page,
            limit,
            total,
            total_pages,
        }
    }
}

/// Shape of every list response: `{data, pagination}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Paginated<T> {
    pub fn new(data: Vec<T>, page: u32, limit: u32, total: i64) -> Self {
        Self {
            data,
            pagination: Pagination::new(page, limit, total),
        }
    }
}

/// Page request after clamping. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, limit: Option<u32>, default_limit: u32, max_limit: u32) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(default_limit).clamp(1, max_limit.max(1)),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page as usize - 1) * self.limit as usize
    }
}
