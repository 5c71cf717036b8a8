//! Page size and alignment helpers.

/// System page size in bytes.
#[inline]
pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Round `size` up to a multiple of the page size.
#[inline]
pub fn page_align(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

/// Round `size` down to a multiple of the page size.
#[inline]
pub fn page_align_down(size: usize) -> usize {
    size - size % page_size()
}

/// Returns true if `value` is a multiple of the page size.
#[inline]
pub fn is_page_aligned(value: usize) -> bool {
    value % page_size() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
        assert_eq!(page_align_down(page + 1), page);
        assert!(is_page_aligned(3 * page));
        assert!(!is_page_aligned(page - 1));
    }
}
