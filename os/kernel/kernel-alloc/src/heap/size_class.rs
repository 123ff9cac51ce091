use crate::MemoryError;
use kernel_info::memory::PAGE_SIZE;

/// Object sizes served from slabs, smallest first.
pub const SIZE_CLASSES: [usize; 16] = [
    8, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048,
];

/// Requests of this many bytes (half a page) or more bypass the slabs.
#[allow(clippy::cast_possible_truncation)]
pub const LARGE_THRESHOLD: usize = PAGE_SIZE as usize / 2;

/// Every object of a class is aligned to the largest power of two dividing
/// its size, since slabs are page aligned.
#[inline]
#[must_use]
pub const fn class_align(size: usize) -> usize {
    1 << size.trailing_zeros()
}

/// Index into [`SIZE_CLASSES`] for a request, or `None` if it takes the
/// large path.
///
/// # Errors
/// [`MemoryError::InvalidArgument`] for a zero size, or an alignment that is
/// not a power of two or exceeds a page.
pub fn class_for(size: usize, align: usize) -> Result<Option<usize>, MemoryError> {
    if size == 0 {
        return Err(MemoryError::InvalidArgument("zero-sized heap allocation"));
    }
    if !align.is_power_of_two() || align as u64 > PAGE_SIZE {
        return Err(MemoryError::InvalidArgument("unsupported alignment"));
    }
    if size >= LARGE_THRESHOLD {
        return Ok(None);
    }
    Ok(SIZE_CLASSES
        .iter()
        .position(|&class| class >= size && class_align(class) >= align))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_fitting_class_is_chosen() {
        assert_eq!(class_for(1, 1), Ok(Some(0)));
        assert_eq!(class_for(8, 8), Ok(Some(0)));
        assert_eq!(class_for(9, 1), Ok(Some(1)));
        assert_eq!(class_for(20, 8), Ok(Some(2)));
        assert_eq!(class_for(1025, 1), Ok(Some(14)));
        assert_eq!(class_for(LARGE_THRESHOLD - 1, 1), Ok(Some(15)));
    }

    #[test]
    fn alignment_can_bump_the_class() {
        // 24 is only 8-aligned.
        assert_eq!(class_for(20, 16), Ok(Some(3)));
        assert_eq!(class_for(90, 64), Ok(Some(7)));
        assert_eq!(class_for(8, 4096), Ok(None));
    }

    #[test]
    fn half_a_page_or_more_is_large() {
        assert_eq!(class_for(LARGE_THRESHOLD, 1), Ok(None));
        assert_eq!(class_for(1 << 20, 8), Ok(None));
    }

    #[test]
    fn bad_requests_are_rejected() {
        assert!(matches!(class_for(0, 8), Err(MemoryError::InvalidArgument(_))));
        assert!(matches!(class_for(8, 3), Err(MemoryError::InvalidArgument(_))));
        assert!(matches!(class_for(8, 8192), Err(MemoryError::InvalidArgument(_))));
    }

    #[test]
    fn class_alignment_follows_the_size() {
        let aligns: Vec<usize> = SIZE_CLASSES.iter().map(|&c| class_align(c)).collect();
        assert_eq!(
            aligns,
            [8, 16, 8, 32, 16, 64, 32, 128, 64, 256, 128, 512, 256, 1024, 512, 2048]
        );
    }
}
