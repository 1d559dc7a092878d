//! Shape and geometry validation shared by the kernels.
//!
//! Every kernel runs these checks before it touches a destination buffer, so
//! an `Err` from a kernel always means "not executed" rather than "partially
//! executed".

use crate::error::{Axis, KernelError, KernelResult};

/// Validate buffer length matches expected.
#[inline]
pub fn validate_len(actual: usize, expected: usize, name: &'static str) -> KernelResult<()> {
    if actual != expected {
        log::error!("{} len {} != expected {}", name, actual, expected);
        return Err(KernelError::ShapeMismatch { name, actual, expected });
    }
    Ok(())
}

/// Validate a scratch buffer holds at least `required` elements.
#[inline]
pub fn validate_capacity(actual: usize, required: usize, name: &'static str) -> KernelResult<()> {
    if actual < required {
        log::error!("{} len {} < required {}", name, actual, required);
        return Err(KernelError::ShapeMismatch {
            name,
            actual,
            expected: required,
        });
    }
    Ok(())
}

/// Multiply extents with an overflow check.
#[inline]
pub fn checked_volume(dims: &[usize], name: &'static str) -> KernelResult<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| KernelError::InvalidConfig(format!("{} overflow", name)))
}

/// Number of output positions along one axis for a padded, strided window.
///
/// Requires `(input - kernel + pad_lo + pad_hi + stride)` to be an exact
/// multiple of `stride`; anything else is a configuration error.
pub fn output_extent(
    axis: Axis,
    input: usize,
    kernel: usize,
    pad_lo: usize,
    pad_hi: usize,
    stride: usize,
) -> KernelResult<usize> {
    if stride == 0 {
        return Err(KernelError::InvalidConfig(format!("{} stride must be > 0", axis)));
    }
    if kernel == 0 {
        return Err(KernelError::InvalidConfig(format!("{} kernel extent must be > 0", axis)));
    }
    let padded = input + pad_lo + pad_hi;
    if kernel > padded {
        return Err(KernelError::InvalidConfig(format!(
            "{} kernel {} larger than padded input {}",
            axis, kernel, padded
        )));
    }
    let span = padded - kernel + stride;
    let remainder = span % stride;
    if remainder > 0 {
        log::error!(
            "Invalid {axis} stride (non multiple {axis} sizes): have {axis}_in={input}, \
             {axis}_ker={kernel}, pad_lo={pad_lo}, pad_hi={pad_hi}, {axis}_stride={stride}, \
             remainder={remainder}"
        );
        return Err(KernelError::InvalidGeometry {
            axis,
            input,
            kernel,
            pad_lo,
            pad_hi,
            stride,
            remainder,
        });
    }
    Ok(span / stride)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_extent_valid() {
        assert_eq!(output_extent(Axis::Height, 4, 3, 0, 0, 1).unwrap(), 2);
        assert_eq!(output_extent(Axis::Height, 4, 3, 1, 0, 1).unwrap(), 3);
        assert_eq!(output_extent(Axis::Width, 5, 3, 1, 1, 2).unwrap(), 3);
        assert_eq!(output_extent(Axis::Width, 7, 1, 0, 0, 2).unwrap(), 4);
    }

    #[test]
    fn test_output_extent_non_divisible() {
        let err = output_extent(Axis::Height, 4, 3, 0, 0, 2).unwrap_err();
        match err {
            KernelError::InvalidGeometry { axis, remainder, .. } => {
                assert_eq!(axis, Axis::Height);
                assert_eq!(remainder, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_output_extent_degenerate() {
        assert!(output_extent(Axis::Width, 4, 3, 0, 0, 0).is_err());
        assert!(output_extent(Axis::Width, 4, 0, 0, 0, 1).is_err());
        assert!(output_extent(Axis::Width, 2, 3, 0, 0, 1).is_err());
    }

    #[test]
    fn test_validate_len() {
        assert!(validate_len(4, 4, "buf").is_ok());
        assert!(validate_len(3, 4, "buf").is_err());
        assert!(validate_capacity(8, 4, "scratch").is_ok());
        assert!(validate_capacity(3, 4, "scratch").is_err());
    }

    #[test]
    fn test_checked_volume() {
        assert_eq!(checked_volume(&[2, 3, 4], "vol").unwrap(), 24);
        assert!(checked_volume(&[usize::MAX, 2], "vol").is_err());
    }
}
