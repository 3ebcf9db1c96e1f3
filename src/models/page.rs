//! Offset pagination shared by the list and search endpoints.

use serde::Serialize;

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_LIMIT: i64 = 10;

/// A clamped page request. Non-positive or missing values fall back to the
/// defaults instead of being rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub limit: i64,
}

impl PageRequest {
    pub fn new(page: Option<i64>, limit: Option<i64>) -> Self {
        Self {
            page: page.filter(|p| *p > 0).unwrap_or(DEFAULT_PAGE),
            limit: limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIMIT),
        }
    }

    /// Strict integer parsing: anything that is not a whole integer is treated
    /// as missing.
    pub fn parse(page: Option<&str>, limit: Option<&str>) -> Self {
        let parse = |raw: Option<&str>| raw.and_then(|s| s.trim().parse::<i64>().ok());
        Self::new(parse(page), parse(limit))
    }

    /// Saturates instead of overflowing for huge page numbers.
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageMetadata {
    pub current_page: i64,
    pub page_size: i64,
    pub total_page: i64,
    pub total_item: i64,
    pub has_next: bool,
    pub has_previous: bool,
}

impl PageMetadata {
    pub fn new(page: PageRequest, total_item: i64) -> Self {
        let total_page = if total_item > 0 {
            (total_item - 1) / page.limit + 1
        } else {
            0
        };
        Self {
            current_page: page.page,
            page_size: page.limit,
            total_page,
            total_item,
            has_next: page.page < total_page,
            has_previous: page.page > 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_values_clamp_to_defaults() {
        let page = PageRequest::new(Some(0), Some(0));
        assert_eq!(page, PageRequest::new(Some(1), Some(10)));
        assert_eq!(page.offset(), 0);

        let page = PageRequest::new(Some(-4), Some(-1));
        assert_eq!(page, PageRequest::default());
    }

    #[test]
    fn offset_is_page_minus_one_times_limit() {
        assert_eq!(PageRequest::new(Some(3), Some(25)).offset(), 50);
    }

    #[test]
    fn strict_parse_falls_back_on_garbage() {
        let page = PageRequest::parse(Some("2x"), Some("abc"));
        assert_eq!(page, PageRequest::default());
        assert_eq!(PageRequest::parse(Some("2"), Some("5")).offset(), 5);
    }

    #[test]
    fn extreme_values_saturate_instead_of_overflowing() {
        let page = PageRequest::parse(Some("9223372036854775807"), Some("10"));
        assert_eq!(page.page, i64::MAX);
        assert_eq!(page.offset(), i64::MAX);

        let page = PageRequest::parse(Some("1"), Some("9223372036854775807"));
        assert_eq!(page.offset(), 0);
        let meta = PageMetadata::new(page, 5);
        assert_eq!(meta.total_page, 1);
        assert!(!meta.has_next);

        let meta = PageMetadata::new(PageRequest::new(Some(i64::MAX), Some(i64::MAX)), i64::MAX);
        assert_eq!(meta.total_page, 1);
        assert!(meta.has_previous);
    }

    #[test]
    fn metadata_rounds_total_pages_up() {
        let meta = PageMetadata::new(PageRequest::new(Some(2), Some(10)), 21);
        assert_eq!(meta.total_page, 3);
        assert!(meta.has_next);
        assert!(meta.has_previous);

        let meta = PageMetadata::new(PageRequest::default(), 0);
        assert_eq!(meta.total_page, 0);
        assert!(!meta.has_next);
        assert!(!meta.has_previous);
    }
}
