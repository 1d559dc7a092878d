use std::fmt::Debug;

use half::f16;

use crate::kernel_types::FloatType;

/// Core element trait for the training kernels.
///
/// Provides a unified interface for scalar operations across the two storage
/// precisions (f32, f16). Kernels are written once against this trait and
/// monomorphized per precision.
///
/// Arithmetic stays in the storage precision: every `f16` operation rounds
/// its result back to `f16`, so a running sum accumulated in `T` carries the
/// same rounding the hardware would.
pub trait Element:
    Debug + Clone + Copy + Send + Sync + Default + 'static
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
    + std::ops::Neg<Output = Self>
    + std::ops::AddAssign
    + PartialOrd
{
    const ZERO: Self;
    const ONE: Self;
    /// Compile-time type identifier for kernel selection and footprint sizing.
    const TYPE_ID: FloatType;

    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;

    #[inline(always)]
    fn from_f64(v: f64) -> Self {
        Self::from_f32(v as f32)
    }

    #[inline(always)]
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }

    fn exp(self) -> Self;
    fn max(self, other: Self) -> Self;
}

impl Element for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const TYPE_ID: FloatType = FloatType::F32;

    #[inline(always)] fn from_f32(v: f32) -> Self { v }
    #[inline(always)] fn to_f32(self) -> f32 { self }
    #[inline(always)] fn from_f64(v: f64) -> Self { v as f32 }

    #[inline(always)] fn exp(self) -> Self { f32::exp(self) }
    #[inline(always)] fn max(self, other: Self) -> Self { f32::max(self, other) }
}

impl Element for f16 {
    const ZERO: Self = f16::ZERO;
    const ONE: Self = f16::ONE;
    const TYPE_ID: FloatType = FloatType::F16;

    #[inline(always)] fn from_f32(v: f32) -> Self { f16::from_f32(v) }
    #[inline(always)] fn to_f32(self) -> f32 { f16::to_f32(self) }
    #[inline(always)] fn from_f64(v: f64) -> Self { f16::from_f64(v) }

    #[inline(always)] fn exp(self) -> Self { f16::from_f32(self.to_f32().exp()) }
    #[inline(always)]
    fn max(self, other: Self) -> Self {
        if self.to_f32() >= other.to_f32() { self } else { other }
    }
}
