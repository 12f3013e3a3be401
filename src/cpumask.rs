// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A dense bit-set over CPU numbers, with the textual encodings the kernel
//! uses in cpuset and cpufreq interface files.
//!
//! The canonical encoding is the *cpulist* form: a comma-separated sequence
//! of decimals and inclusive ranges, e.g. `0-2,4,6-7,9`. The empty string is
//! the empty mask. [`Cpumask::from_cpulist`] parses a complete string;
//! [`Cpumask::from_cpulist_prefix`] parses a leading cpulist and hands back
//! the unconsumed rest, which is what you want for interface files that
//! append a newline or other trailing content. `affected_cpus`-style
//! whitespace-separated lists are handled by [`Cpumask::from_cpu_words`].

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;
use std::ops::BitXorAssign;

lazy_static::lazy_static! {
    /// The number of CPU IDs the kernel can manage, read once from
    /// /sys/devices/system/cpu/kernel_max. The kernel's cpu_set_t manpage
    /// guarantees 1024, so that is both the fallback and the floor.
    pub static ref NR_CPU_IDS: usize = read_kernel_max();
}

const KERNEL_MAX_PATH: &str = "/sys/devices/system/cpu/kernel_max";
const NR_CPU_IDS_FALLBACK: usize = 1024;

fn read_kernel_max() -> usize {
    match std::fs::read_to_string(KERNEL_MAX_PATH) {
        Ok(val) => match val.trim().parse::<usize>() {
            Ok(n) => n.max(NR_CPU_IDS_FALLBACK),
            Err(_) => NR_CPU_IDS_FALLBACK,
        },
        Err(_) => NR_CPU_IDS_FALLBACK,
    }
}

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(cpu: usize) -> Result<()> {
        if cpu >= *NR_CPU_IDS {
            bail!("Invalid CPU {} passed, max {}", cpu, *NR_CPU_IDS);
        }

        Ok(())
    }

    /// Build a new empty Cpumask object.
    pub fn new() -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; *NR_CPU_IDS],
        }
    }

    /// Parse a complete cpulist string. The empty string is the empty mask.
    pub fn from_cpulist(cpulist: &str) -> Result<Cpumask> {
        let (mask, rest) = Self::from_cpulist_prefix(cpulist)?;
        if !rest.is_empty() {
            bail!(
                "Unexpected character '{}' in cpulist '{}'",
                rest.chars().next().unwrap(),
                cpulist
            );
        }

        Ok(mask)
    }

    /// Parse a leading cpulist from `input`, stopping at (and returning) the
    /// first character that cannot continue the list. Leading whitespace is
    /// skipped; all-whitespace input is the empty mask. Input that ends in
    /// the middle of a construct (`0-`, `0,`) is an error, even when the
    /// offending character would otherwise terminate the list.
    pub fn from_cpulist_prefix(input: &str) -> Result<(Cpumask, &str)> {
        let mut mask = Cpumask::new();
        let bytes = input.as_bytes();

        let mut pos = 0;
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos == bytes.len() {
            return Ok((mask, &input[pos..]));
        }

        let mut start: Option<usize> = None;
        loop {
            let digits = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            if digits == pos {
                match start {
                    Some(_) => bail!("Missing end of range in cpulist '{}'", input.trim_end()),
                    None => bail!("Missing CPU number in cpulist '{}'", input.trim_end()),
                }
            }
            let cpu = input[digits..pos]
                .parse::<usize>()
                .with_context(|| format!("Invalid CPU number '{}'", &input[digits..pos]))?;
            Self::check_cpu(cpu)?;

            match bytes.get(pos).copied() {
                Some(b'-') if start.is_none() => {
                    start = Some(cpu);
                    pos += 1;
                }
                Some(b'-') => {
                    bail!("Invalid syntax in cpulist '{}'", input.trim_end());
                }
                sep => {
                    match start.take() {
                        Some(first) => {
                            if first > cpu {
                                bail!("Invalid CPU range {}-{} in cpulist", first, cpu);
                            }
                            for id in first..=cpu {
                                mask.mask.set(id, true);
                            }
                        }
                        None => mask.mask.set(cpu, true),
                    }

                    match sep {
                        Some(b',') => pos += 1,
                        _ => return Ok((mask, &input[pos..])),
                    }
                }
            }
        }
    }

    /// Parse a whitespace-separated list of CPU numbers, the format used by
    /// cpufreq's `affected_cpus` and friends.
    pub fn from_cpu_words(words: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new();
        for word in words.split_whitespace() {
            let cpu = word
                .parse::<usize>()
                .with_context(|| format!("Invalid CPU number '{}' in CPU list", word))?;
            mask.set_cpu(cpu)?;
        }

        Ok(mask)
    }

    /// Format the mask in cpulist form, collapsing consecutive CPUs into
    /// ranges. The empty mask formats as the empty string.
    pub fn to_cpulist(&self) -> String {
        let mut result = String::new();

        let mut iter = self.iter().peekable();
        while let Some(first) = iter.next() {
            let mut last = first;
            while iter.peek() == Some(&(last + 1)) {
                last = iter.next().unwrap();
            }

            if !result.is_empty() {
                result.push(',');
            }
            result += &first.to_string();
            if last != first {
                result.push('-');
                result += &last.to_string();
            }
        }

        result
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        Self::check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        Self::check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. If the CPU
    /// exceeds the number of possible CPUs on the host, false is returned.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.count_ones() == 0
    }

    /// The total size of the cpumask.
    pub fn len(&self) -> usize {
        *NR_CPU_IDS
    }

    /// Index of the lowest set bit, if any.
    pub fn first(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// Index of the highest set bit, if any.
    pub fn last(&self) -> Option<usize> {
        self.mask.last_one()
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= other.mask.clone();
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= other.mask.clone();
        new
    }

    /// Create a Cpumask that is the XOR of the current Cpumask and another.
    pub fn xor(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask ^= other.mask.clone();
        new
    }

    /// True if every CPU in this mask is also in `other`.
    pub fn is_subset_of(&self, other: &Cpumask) -> bool {
        self.and(other) == *self
    }

    /// Iterate over each element of a Cpumask, and return the indices with
    /// bits set.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }
}

impl Default for Cpumask {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < *NR_CPU_IDS {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cpulist())
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        self.mask &= &rhs.mask;
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        self.mask |= &rhs.mask;
    }
}

impl BitXorAssign<&Self> for Cpumask {
    fn bitxor_assign(&mut self, rhs: &Self) {
        self.mask ^= &rhs.mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(cpulist: &str) -> Cpumask {
        Cpumask::from_cpulist(cpulist).unwrap()
    }

    #[test]
    fn test_parse_empty() {
        let m = mask("");
        assert_eq!(m.weight(), 0);
        assert!(m.is_empty());
    }

    #[test]
    fn test_parse_basic() {
        let m = mask("0-2,4,6-7,9");
        assert_eq!(m.weight(), 7);
        for cpu in [0, 1, 2, 4, 6, 7, 9] {
            assert!(m.test_cpu(cpu), "CPU {} should be set", cpu);
        }
        for cpu in [3, 5, 8, 10] {
            assert!(!m.test_cpu(cpu), "CPU {} should not be set", cpu);
        }
        assert_eq!(m.first(), Some(0));
        assert_eq!(m.last(), Some(9));
    }

    #[test]
    fn test_parse_high_cpus() {
        // NR_CPU_IDS is always at least 1024.
        let m = mask("0,2-3,1022-1023");
        assert_eq!(m.weight(), 5);
        assert!(m.test_cpu(1022));
        assert!(m.test_cpu(1023));
        assert!(!m.test_cpu(1021));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Cpumask::from_cpulist("-1").is_err());
        assert!(Cpumask::from_cpulist(",").is_err());
        assert!(Cpumask::from_cpulist("0,").is_err());
        assert!(Cpumask::from_cpulist("0-").is_err());
        assert!(Cpumask::from_cpulist("0-,1").is_err());
        assert!(Cpumask::from_cpulist("0-1,").is_err());
        assert!(Cpumask::from_cpulist("0-1-").is_err());
        assert!(Cpumask::from_cpulist("0x2").is_err());
        assert!(Cpumask::from_cpulist("1-0").is_err());
    }

    #[test]
    fn test_parse_reversed_range() {
        let err = Cpumask::from_cpulist("1-0").unwrap_err();
        assert!(err.to_string().contains("Invalid CPU range 1-0"));
    }

    #[test]
    fn test_parse_out_of_range() {
        let over = *NR_CPU_IDS;
        assert!(Cpumask::from_cpulist(&over.to_string()).is_err());

        let m = mask(&(over - 1).to_string());
        assert_eq!(m.weight(), 1);
        assert!(m.test_cpu(over - 1));
    }

    #[test]
    fn test_format() {
        assert_eq!(mask("").to_cpulist(), "");
        assert_eq!(mask("0").to_cpulist(), "0");
        assert_eq!(mask("1").to_cpulist(), "1");
        assert_eq!(mask("0-2,4,6-7,9").to_cpulist(), "0-2,4,6-7,9");

        let top = *NR_CPU_IDS - 1;
        let mut m = mask("0,2-3");
        m.set_cpu(top).unwrap();
        assert_eq!(m.to_cpulist(), format!("0,2-3,{}", top));
        m.set_cpu(top - 1).unwrap();
        assert_eq!(m.to_cpulist(), format!("0,2-3,{}-{}", top - 1, top));
    }

    #[test]
    fn test_format_canonicalizes() {
        // Adjacent singletons and ranges collapse.
        assert_eq!(mask("0,1,2").to_cpulist(), "0-2");
        assert_eq!(mask("0-1,2-3").to_cpulist(), "0-3");
        assert_eq!(mask("0,2,4").to_cpulist(), "0,2,4");
    }

    #[test]
    fn test_parse_format_roundtrip() {
        for list in ["", "0", "0-3", "0-2,4,6-7,9", "1,3,5,7", "0-1023"] {
            let m = mask(list);
            assert_eq!(Cpumask::from_cpulist(&m.to_cpulist()).unwrap(), m);
            assert_eq!(m.to_cpulist(), list);
        }
    }

    #[test]
    fn test_prefix_parse() {
        let (m, rest) = Cpumask::from_cpulist_prefix("0-2,4,6-7,9\nGarbage").unwrap();
        assert_eq!(m, mask("0-2,4,6-7,9"));
        assert_eq!(rest, "\nGarbage");

        let (m, rest) = Cpumask::from_cpulist_prefix("0-3\n").unwrap();
        assert_eq!(m, mask("0-3"));
        assert_eq!(rest, "\n");

        let (m, rest) = Cpumask::from_cpulist_prefix("5").unwrap();
        assert_eq!(m, mask("5"));
        assert_eq!(rest, "");
    }

    #[test]
    fn test_prefix_parse_whitespace() {
        // Leading whitespace is skipped; all-whitespace input is empty.
        let (m, rest) = Cpumask::from_cpulist_prefix("\n").unwrap();
        assert!(m.is_empty());
        assert_eq!(rest, "");

        let (m, rest) = Cpumask::from_cpulist_prefix("  0-1\n").unwrap();
        assert_eq!(m, mask("0-1"));
        assert_eq!(rest, "\n");
    }

    #[test]
    fn test_prefix_parse_errors() {
        // A dangling '-' or ',' is an error even at end of input or when
        // followed by a character that would otherwise stop the parse.
        assert!(Cpumask::from_cpulist_prefix("0-").is_err());
        assert!(Cpumask::from_cpulist_prefix("0-\n").is_err());
        assert!(Cpumask::from_cpulist_prefix("0,\nGarbage").is_err());
        assert!(Cpumask::from_cpulist_prefix("-1").is_err());
        assert!(Cpumask::from_cpulist_prefix("Garbage").is_err());
    }

    #[test]
    fn test_cpu_words() {
        let m = Cpumask::from_cpu_words("0 1 2 3\n").unwrap();
        assert_eq!(m, mask("0-3"));

        let m = Cpumask::from_cpu_words("").unwrap();
        assert!(m.is_empty());

        assert!(Cpumask::from_cpu_words("0 x").is_err());
        assert!(Cpumask::from_cpu_words("-1").is_err());
    }

    #[test]
    fn test_algebra() {
        let a = mask("0-3");
        let b = mask("2-5");

        assert_eq!(a.or(&b), mask("0-5"));
        assert_eq!(a.and(&b), mask("2-3"));
        assert_eq!(a.xor(&b), mask("0-1,4-5"));

        // Commutativity and idempotence.
        assert_eq!(a.or(&b), b.or(&a));
        assert_eq!(a.and(&b), b.and(&a));
        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.or(&a), a);
        assert_eq!(a.and(&a), a);
        assert!(a.xor(&a).is_empty());
    }

    #[test]
    fn test_release_identity() {
        // (L ^ m) & L == L \ m, the ledger release computation.
        let ledger = mask("0-7");
        let reservation = mask("2-3");
        let released = ledger.xor(&reservation).and(&ledger);
        assert_eq!(released, mask("0-1,4-7"));
        assert_eq!(released.to_cpulist(), "0-1,4-7");
    }

    #[test]
    fn test_assign_ops() {
        let mut m = mask("0-3");
        m |= &mask("6");
        assert_eq!(m, mask("0-3,6"));
        m &= &mask("2-7");
        assert_eq!(m, mask("2-3,6"));
        m ^= &mask("3-4");
        assert_eq!(m, mask("2,4,6"));
    }

    #[test]
    fn test_subset() {
        assert!(mask("1-2").is_subset_of(&mask("0-3")));
        assert!(mask("").is_subset_of(&mask("0-3")));
        assert!(!mask("1-4").is_subset_of(&mask("0-3")));
    }
}
