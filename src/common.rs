//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common functionality for the packet codec, FEC engine, monitor, and pipeline.

mod data_rate;
mod ring_buffer;
mod time;

use std::convert::TryInto;

pub use data_rate::*;
pub use ring_buffer::*;
pub use time::*;

// It's (value, rest)
pub type ReadOption<'a, T> = Option<(T, &'a [u8])>;

// Returns (read, rest)
pub fn read_bytes(input: &[u8], len: usize) -> ReadOption<&[u8]> {
    let bytes = input.get(0..len)?;
    let rest = &input[len..];
    Some((bytes, rest))
}

pub fn read_u16_le(input: &[u8]) -> ReadOption<u16> {
    let (bytes, rest) = read_bytes(input, 2)?;
    Some((parse_u16_le(bytes), rest))
}

pub fn read_u32_le(input: &[u8]) -> ReadOption<u32> {
    let (bytes, rest) = read_bytes(input, 4)?;
    Some((parse_u32_le(bytes), rest))
}

pub fn read_u64_le(input: &[u8]) -> ReadOption<u64> {
    let (bytes, rest) = read_bytes(input, 8)?;
    Some((parse_u64_le(bytes), rest))
}

pub fn parse_u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes(bytes[0..2].try_into().unwrap())
}

pub fn parse_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[0..4].try_into().unwrap())
}

pub fn parse_u64_le(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[0..8].try_into().unwrap())
}

pub trait CheckedSplitAt {
    fn checked_split_at(&self, mid: usize) -> Option<(&[u8], &[u8])>;
}

impl CheckedSplitAt for [u8] {
    fn checked_split_at(&self, mid: usize) -> Option<(&[u8], &[u8])> {
        if self.len() < mid {
            None
        } else {
            Some(self.split_at(mid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_little_endian() {
        assert_eq!(0x0201, parse_u16_le(&[1, 2]));
        assert_eq!(0x04030201, parse_u32_le(&[1, 2, 3, 4]));
        assert_eq!(0x0807060504030201, parse_u64_le(&[1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn read_chain() {
        let input = [0x7Bu8, 0, 0, 0, 9, 0];
        let (seq, rest) = read_u32_le(&input).unwrap();
        assert_eq!(123, seq);
        let (size, rest) = read_u16_le(rest).unwrap();
        assert_eq!(9, size);
        assert!(rest.is_empty());

        assert_eq!(None, read_u32_le(&[1, 2, 3]));
        assert_eq!(None, read_u64_le(&[1, 2, 3, 4, 5, 6, 7]));
    }

    #[test]
    fn test_checked_split_at() {
        assert_eq!(Some((&b""[..], &b"ab"[..])), b"ab".checked_split_at(0));
        assert_eq!(Some((&b"a"[..], &b"b"[..])), b"ab".checked_split_at(1));
        assert_eq!(Some((&b"ab"[..], &b""[..])), b"ab".checked_split_at(2));
        assert_eq!(None, b"ab".checked_split_at(3));
        assert_eq!(None, b"ab".checked_split_at(30));
    }
}
