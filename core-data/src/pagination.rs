//! Pagination helper types for repository queries

use serde::{Deserialize, Serialize};

/// Rows per page when a request does not ask for a usable limit
pub const DEFAULT_LIMIT: i64 = 30;

/// Offset/limit window over a result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Number of rows to skip, never negative
    pub offset: i64,
    /// Number of rows to return, at least 1
    pub limit: i64,
}

impl PageRequest {
    /// Create a page request, clamping a negative offset to `0` and replacing
    /// a limit below `1` with [`DEFAULT_LIMIT`].
    ///
    /// # Examples
    ///
    /// ```
    /// use core_data::pagination::PageRequest;
    ///
    /// let request = PageRequest::new(-5, 0);
    /// assert_eq!(request.offset, 0);
    /// assert_eq!(request.limit, 30);
    /// ```
    pub fn new(offset: i64, limit: i64) -> Self {
        Self {
            offset: offset.max(0),
            limit: if limit < 1 { DEFAULT_LIMIT } else { limit },
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_LIMIT)
    }
}

/// One window of a result set plus the size of the whole set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items in the current window
    pub items: Vec<T>,
    /// Total number of items across all pages
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
    /// Total number of pages, `0` for an empty result set
    pub pages: i64,
}

impl<T> Page<T> {
    /// Create a page
    ///
    /// # Examples
    ///
    /// ```
    /// use core_data::pagination::{Page, PageRequest};
    ///
    /// let page = Page::new(vec![1, 2, 3], 25, PageRequest::new(0, 10));
    ///
    /// assert_eq!(page.total, 25);
    /// assert_eq!(page.pages, 3);
    /// ```
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        let pages = if total <= 0 {
            0
        } else {
            (total - 1) / request.limit + 1
        };

        Self {
            items,
            total,
            offset: request.offset,
            limit: request.limit,
            pages,
        }
    }

    /// Check if there are rows after this window
    pub fn has_next(&self) -> bool {
        self.offset.saturating_add(self.limit) < self.total
    }

    /// Check if there are rows before this window
    pub fn has_previous(&self) -> bool {
        self.offset > 0
    }

    /// Map the items to a different type
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            offset: self.offset,
            limit: self.limit,
            pages: self.pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_default() {
        let request = PageRequest::default();
        assert_eq!(request.offset, 0);
        assert_eq!(request.limit, DEFAULT_LIMIT);
    }

    #[test]
    fn test_page_request_clamps() {
        assert_eq!(PageRequest::new(-1, -1), PageRequest::new(0, 30));
        assert_eq!(PageRequest::new(40, 20).offset, 40);
        assert_eq!(PageRequest::new(0, 1).limit, 1);
    }

    #[test]
    fn test_page_count() {
        let page = Page::new(vec![1, 2, 3], 25, PageRequest::new(0, 10));
        assert_eq!(page.pages, 3);

        let page = Page::new(vec![1; 10], 20, PageRequest::new(0, 10));
        assert_eq!(page.pages, 2);

        let page: Page<i32> = Page::new(vec![], 0, PageRequest::new(0, 10));
        assert_eq!(page.pages, 0);
    }

    #[test]
    fn test_page_has_next_and_previous() {
        let page = Page::new(vec![1, 2, 3], 25, PageRequest::new(0, 10));
        assert!(page.has_next());
        assert!(!page.has_previous());

        let page = Page::new(vec![1, 2, 3], 25, PageRequest::new(20, 10));
        assert!(!page.has_next());
        assert!(page.has_previous());
    }

    #[test]
    fn test_page_bounds_do_not_overflow() {
        let page = Page::new(vec![1, 2, 3], 3, PageRequest::new(0, i64::MAX));
        assert_eq!(page.pages, 1);
        assert!(!page.has_next());

        let page = Page::new(vec![1], i64::MAX, PageRequest::new(0, 1));
        assert_eq!(page.pages, i64::MAX);

        let page: Page<i32> = Page::new(vec![], 3, PageRequest::new(i64::MAX, 10));
        assert!(!page.has_next());
        assert!(page.has_previous());
    }

    #[test]
    fn test_page_map() {
        let page = Page::new(vec![1, 2, 3], 25, PageRequest::new(0, 10));
        let mapped = page.map(|x| x * 2);

        assert_eq!(mapped.items, vec![2, 4, 6]);
        assert_eq!(mapped.total, 25);
        assert_eq!(mapped.pages, 3);
    }
}
