//! Running sums that honour the configured [`Accumulation`] precision.
//!
//! With `Accumulation::Storage` every addition rounds to the element type, which
//! for `f16` reproduces the cluster's native half-precision accumulation. With
//! `Accumulation::Widened` the sum is carried in f64 and rounded once when read.

use crate::kernel_types::Accumulation;
use crate::traits::Element;

#[derive(Debug, Clone, Copy)]
pub struct SumAccumulator<T: Element> {
    mode: Accumulation,
    narrow: T,
    wide: f64,
}

impl<T: Element> SumAccumulator<T> {
    #[inline]
    pub fn new(mode: Accumulation) -> Self {
        Self {
            mode,
            narrow: T::ZERO,
            wide: 0.0,
        }
    }

    #[inline(always)]
    pub fn add(&mut self, x: T) {
        match self.mode {
            Accumulation::Storage => self.narrow += x,
            Accumulation::Widened => self.wide += x.to_f64(),
        }
    }

    /// Accumulate `a · b`.
    #[inline(always)]
    pub fn add_product(&mut self, a: T, b: T) {
        match self.mode {
            Accumulation::Storage => self.narrow += a * b,
            Accumulation::Widened => self.wide += a.to_f64() * b.to_f64(),
        }
    }

    /// Fold another partial sum into this one.
    #[inline]
    pub fn merge(&mut self, other: &SumAccumulator<T>) {
        match self.mode {
            Accumulation::Storage => self.narrow += other.value(),
            Accumulation::Widened => {
                self.wide += match other.mode {
                    Accumulation::Storage => other.narrow.to_f64(),
                    Accumulation::Widened => other.wide,
                }
            }
        }
    }

    /// The sum rounded to the element type.
    #[inline]
    pub fn value(&self) -> T {
        match self.mode {
            Accumulation::Storage => self.narrow,
            Accumulation::Widened => T::from_f64(self.wide),
        }
    }
}
