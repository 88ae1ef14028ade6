//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    fmt::{self, Display, Formatter},
    iter::Sum,
    ops::{Add, AddAssign, Div},
};

use crate::common::time::Duration;

#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd)]
pub struct DataSize {
    bits: u64,
}

impl Default for DataSize {
    fn default() -> Self {
        Self::ZERO
    }
}

impl std::fmt::Debug for DataSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (unit, bits) in [
            ("gbits", 1_000_000_000),
            ("mbits", 1_000_000),
            ("kbits", 1_000),
        ] {
            if self.bits > bits {
                return write!(f, "{}{}", self.bits / bits, unit);
            }
        }
        write!(f, "{}bits", self.bits)
    }
}

impl DataSize {
    pub const ZERO: Self = Self::from_bits(0);
    const BITS_PER_BYTE: u64 = 8;
    const BITS_PER_KILO_BIT: u64 = 1000;
    const BITS_PER_MEGA_BIT: u64 = Self::BITS_PER_KILO_BIT * Self::BITS_PER_KILO_BIT;

    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    pub const fn as_bits(&self) -> u64 {
        self.bits
    }

    pub const fn as_bytes(&self) -> u64 {
        self.bits / Self::BITS_PER_BYTE
    }

    pub const fn from_bytes(bytes: u64) -> Self {
        Self::from_bits(bytes * Self::BITS_PER_BYTE)
    }
}

impl Add<DataSize> for DataSize {
    type Output = DataSize;

    fn add(self, other: DataSize) -> DataSize {
        DataSize::from_bits(self.bits + other.bits)
    }
}

impl AddAssign<DataSize> for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        *self = *self + rhs;
    }
}

impl Sum for DataSize {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self::from_bits(iter.map(|size| size.bits).sum())
    }
}

#[derive(Debug, Copy, Clone, Eq, Ord, PartialEq, PartialOrd)]
pub struct DataRate {
    size_per_second: DataSize,
}

impl Default for DataRate {
    fn default() -> Self {
        Self::ZERO
    }
}

impl DataRate {
    pub const ZERO: Self = Self::per_second(DataSize::ZERO);

    pub const fn per_second(size_per_second: DataSize) -> Self {
        Self { size_per_second }
    }

    pub const fn from_bps(bps: u64) -> Self {
        Self::per_second(DataSize::from_bits(bps))
    }

    pub const fn as_bps(&self) -> u64 {
        self.size_per_second.as_bits()
    }

    pub fn as_mbps(&self) -> f64 {
        self.as_bps() as f64 / DataSize::BITS_PER_MEGA_BIT as f64
    }
}

impl Display for DataRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let bits = self.size_per_second.bits;
        if bits < DataSize::BITS_PER_KILO_BIT {
            write!(f, "{} bps", bits)
        } else if bits < DataSize::BITS_PER_MEGA_BIT {
            write!(
                f,
                "{:.1} Kbps",
                (bits * 10 / DataSize::BITS_PER_KILO_BIT) as f64 / 10f64
            )
        } else {
            write!(
                f,
                "{:.1} Mbps",
                (bits * 10 / DataSize::BITS_PER_MEGA_BIT) as f64 / 10f64
            )
        }
    }
}

impl Div<Duration> for DataSize {
    type Output = DataRate;

    fn div(self, duration: Duration) -> DataRate {
        DataRate::from_bps((self.as_bits() as f64 / duration.as_secs_f64()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default() {
        assert_eq!(DataSize::from_bits(0), DataSize::default());
        assert_eq!(DataRate::from_bps(0), DataRate::default());
    }

    #[test]
    fn size_conversions() {
        assert_eq!(8, DataSize::from_bytes(1).as_bits());
        assert_eq!(0, DataSize::from_bits(7).as_bytes());
        assert_eq!(1, DataSize::from_bits(8).as_bytes());
        assert_eq!(2, DataSize::from_bits(16).as_bytes());
    }

    #[test]
    fn size_addition() {
        let mut size = DataSize::from_bytes(1);
        size += DataSize::from_bits(2);
        assert_eq!(DataSize::from_bits(10), size);
        assert_eq!(
            DataSize::from_bits(10),
            [DataSize::from_bytes(1), DataSize::from_bits(2)]
                .into_iter()
                .sum()
        );
    }

    #[test]
    fn size_over_duration_gives_rate() {
        assert_eq!(
            DataRate::from_bps(8),
            DataSize::from_bits(56) / Duration::from_secs(7)
        );
        assert_eq!(
            DataRate::from_bps(u64::MAX),
            DataSize::from_bytes(60) / Duration::ZERO
        );
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn as_mbps() {
        assert_eq!(1.0, DataRate::from_bps(1_000_000).as_mbps());
        assert_eq!(2.5, DataRate::from_bps(2_500_000).as_mbps());
    }

    #[test]
    fn display_rounds_down_to_1_decimal_point() {
        assert_eq!("0 bps", format!("{}", DataRate::ZERO));
        assert_eq!("999 bps", format!("{}", DataRate::from_bps(999)));
        assert_eq!("1.5 Kbps", format!("{}", DataRate::from_bps(1_550)));
        assert_eq!("2.3 Mbps", format!("{}", DataRate::from_bps(2_350_000)));
    }
}
