// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capability flags for resources and instance creation.
//!
//! A closed bitmask covering precision, synchrony, device class, and SIMD
//! extensions. The same type describes what a resource can do and what a
//! caller prefers or requires at instance creation: requirement bits are
//! hard (every bit must be present on the resource), preference bits are
//! soft (resources matching more of them win).

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Capability bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(pub u64);

impl Flags {
    /// Double-precision computation.
    pub const DOUBLE: Self = Self(1 << 0);
    /// Single-precision computation.
    pub const SINGLE: Self = Self(1 << 1);
    /// Asynchronous execution (kernels may enqueue and return).
    pub const ASYNCH: Self = Self(1 << 2);
    /// Synchronous execution (kernels complete before returning).
    pub const SYNCH: Self = Self(1 << 3);
    /// Host CPU device.
    pub const CPU: Self = Self(1 << 16);
    /// GPU device.
    pub const GPU: Self = Self(1 << 17);
    /// FPGA device.
    pub const FPGA: Self = Self(1 << 18);
    /// SSE vector extensions.
    pub const SSE: Self = Self(1 << 19);
    /// Cell processor.
    pub const CELL: Self = Self(1 << 20);

    /// The empty flag set.
    pub const NONE: Self = Self(0);

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Number of bits shared with `other` (preference match score).
    #[must_use]
    pub const fn matching_bits(self, other: Self) -> u32 {
        (self.0 & other.0).count_ones()
    }

    /// Whether no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LABELS: [(Flags, &str); 9] = [
            (Flags::DOUBLE, "double"),
            (Flags::SINGLE, "single"),
            (Flags::ASYNCH, "async"),
            (Flags::SYNCH, "sync"),
            (Flags::CPU, "cpu"),
            (Flags::GPU, "gpu"),
            (Flags::FPGA, "fpga"),
            (Flags::SSE, "sse"),
            (Flags::CELL, "cell"),
        ];
        let mut first = true;
        for (bit, label) in LABELS {
            if self.contains(bit) {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{label}")?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_values_are_stable() {
        assert_eq!(Flags::DOUBLE.0, 1);
        assert_eq!(Flags::SINGLE.0, 2);
        assert_eq!(Flags::ASYNCH.0, 4);
        assert_eq!(Flags::SYNCH.0, 8);
        assert_eq!(Flags::CPU.0, 1 << 16);
        assert_eq!(Flags::GPU.0, 1 << 17);
        assert_eq!(Flags::FPGA.0, 1 << 18);
        assert_eq!(Flags::SSE.0, 1 << 19);
        assert_eq!(Flags::CELL.0, 1 << 20);
    }

    #[test]
    fn contains_requires_all_bits() {
        let caps = Flags::CPU | Flags::DOUBLE | Flags::SYNCH;
        assert!(caps.contains(Flags::CPU));
        assert!(caps.contains(Flags::CPU | Flags::DOUBLE));
        assert!(!caps.contains(Flags::CPU | Flags::GPU));
        assert!(caps.contains(Flags::NONE));
    }

    #[test]
    fn matching_bits_counts_overlap() {
        let caps = Flags::CPU | Flags::DOUBLE | Flags::SSE;
        assert_eq!(caps.matching_bits(Flags::DOUBLE | Flags::SSE), 2);
        assert_eq!(caps.matching_bits(Flags::GPU), 0);
    }

    #[test]
    fn display_lists_labels() {
        let caps = Flags::CPU | Flags::DOUBLE | Flags::SYNCH;
        let s = caps.to_string();
        assert!(s.contains("cpu"));
        assert!(s.contains("double"));
        assert!(s.contains("sync"));
        assert_eq!(Flags::NONE.to_string(), "none");
    }
}
