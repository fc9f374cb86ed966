//! Deterministic bit patterns for memory stability tests
//!
//! Every pattern is a pure function of the word address and the pass number,
//! so the expected contents of any chunk can be regenerated on read-back
//! without keeping a copy of the whole region.

use memsweep_core::{Error, Result};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitPattern {
    /// 0x00000000
    AllZeros,
    /// 0xFFFFFFFF
    AllOnes,
    /// 0xAAAAAAAA
    Checkerboard,
    /// 0x55555555
    InverseCheckerboard,
    /// A single set bit walking across the word, shifted per address and pass
    WalkingOnes,
    /// Each word holds its own address, inverted on odd passes
    AddressInAddress,
    /// Seeded pseudo-random words
    Random { seed: u64 },
}

impl BitPattern {
    /// The full pattern set, in run order
    pub fn defaults(seed: u64) -> Vec<BitPattern> {
        vec![
            BitPattern::AllZeros,
            BitPattern::AllOnes,
            BitPattern::Checkerboard,
            BitPattern::InverseCheckerboard,
            BitPattern::WalkingOnes,
            BitPattern::AddressInAddress,
            BitPattern::Random { seed },
        ]
    }

    /// Parse configured pattern names; `random` takes `seed`
    pub fn parse_list<S: AsRef<str>>(names: &[S], seed: u64) -> Result<Vec<BitPattern>> {
        names
            .iter()
            .map(|name| {
                name.as_ref()
                    .parse::<BitPattern>()
                    .map(|pattern| match pattern {
                        BitPattern::Random { .. } => BitPattern::Random { seed },
                        other => other,
                    })
                    .map_err(Error::config)
            })
            .collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            BitPattern::AllZeros => "zeros",
            BitPattern::AllOnes => "ones",
            BitPattern::Checkerboard => "checkerboard",
            BitPattern::InverseCheckerboard => "inverse_checkerboard",
            BitPattern::WalkingOnes => "walking_ones",
            BitPattern::AddressInAddress => "address",
            BitPattern::Random { .. } => "random",
        }
    }

    /// Fill `out` with the words for addresses `base..base + out.len()`
    pub fn fill(&self, base: u64, pass: u32, out: &mut [u32]) {
        match self {
            BitPattern::AllZeros => out.fill(0x0000_0000),
            BitPattern::AllOnes => out.fill(0xFFFF_FFFF),
            BitPattern::Checkerboard => out.fill(0xAAAA_AAAA),
            BitPattern::InverseCheckerboard => out.fill(0x5555_5555),
            BitPattern::WalkingOnes => {
                for (i, word) in out.iter_mut().enumerate() {
                    let shift = (base + i as u64 + pass as u64) % 32;
                    *word = 1u32 << shift;
                }
            }
            BitPattern::AddressInAddress => {
                let invert = pass % 2 == 1;
                for (i, word) in out.iter_mut().enumerate() {
                    let value = (base + i as u64) as u32;
                    *word = if invert { !value } else { value };
                }
            }
            BitPattern::Random { seed } => {
                // One stream per (chunk base, pass); chunks are regenerated on read-back
                let chunk_seed = seed ^ base.rotate_left(17) ^ ((pass as u64) << 48);
                let mut rng = StdRng::seed_from_u64(chunk_seed);
                for word in out.iter_mut() {
                    *word = rng.next_u32();
                }
            }
        }
    }
}

impl fmt::Display for BitPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BitPattern {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zeros" | "all_zeros" => Ok(BitPattern::AllZeros),
            "ones" | "all_ones" => Ok(BitPattern::AllOnes),
            "checkerboard" | "0xaa" => Ok(BitPattern::Checkerboard),
            "inverse_checkerboard" | "0x55" => Ok(BitPattern::InverseCheckerboard),
            "walking_ones" | "walking_1" => Ok(BitPattern::WalkingOnes),
            "address" | "address_in_address" => Ok(BitPattern::AddressInAddress),
            "random" => Ok(BitPattern::Random { seed: 0 }),
            _ => Err(format!("Unknown bit pattern: {}", s)),
        }
    }
}
