//! Parsing for massif heap profiles.
//!
//! Massif writes a line-oriented text file: a short header (`desc:`, `cmd:`,
//! `time_unit:`), then one block per snapshot introduced by `snapshot=N` and
//! carrying `key=value` measurements. Detailed snapshots are followed by an
//! indented allocation tree, which is skipped here.

use std::str::FromStr;

use thiserror::Error;

/// Errors reading a massif profile.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    /// A measurement was not a number.
    #[error("line {line}: invalid number in {key:?}: {value:?}")]
    InvalidNumber {
        line: usize,
        key: String,
        value: String,
    },

    /// A measurement appeared before the first `snapshot=` line.
    #[error("line {line}: {key:?} outside of a snapshot")]
    OutsideSnapshot { line: usize, key: String },

    #[error("profile has no snapshots")]
    Empty,

    /// The profile file could not be read.
    #[error("failed to read profile: {0}")]
    Read(String),
}

/// How much allocation detail a snapshot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapTree {
    #[default]
    Empty,
    Detailed,
    Peak,
}

/// One point-in-time measurement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Position of the snapshot in the profile.
    pub index: u64,
    /// When the snapshot was taken, in the profile's `time_unit`.
    pub time: u64,
    /// Useful heap bytes.
    pub heap_bytes: u64,
    /// Allocator overhead and alignment padding.
    pub heap_extra_bytes: u64,
    /// Stack bytes, only measured with `--stacks=yes`.
    pub stack_bytes: u64,
    pub tree: HeapTree,
}

impl Snapshot {
    /// Heap, heap overhead and stack bytes together, saturating at `u64::MAX`.
    pub fn total_bytes(&self) -> u64 {
        self.heap_bytes
            .saturating_add(self.heap_extra_bytes)
            .saturating_add(self.stack_bytes)
    }
}

/// A parsed massif output file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MassifProfile {
    /// The `desc:` header line.
    pub description: String,
    /// The profiled command line.
    pub command: String,
    pub time_unit: String,
    pub snapshots: Vec<Snapshot>,
}

impl MassifProfile {
    /// The snapshot massif marked as the peak, or the one with the largest
    /// heap if none was marked.
    pub fn peak(&self) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .find(|s| s.tree == HeapTree::Peak)
            .or_else(|| self.snapshots.iter().max_by_key(|s| s.heap_bytes))
    }

    /// The largest heap size seen in any snapshot.
    pub fn peak_heap_bytes(&self) -> u64 {
        self.snapshots.iter().map(|s| s.heap_bytes).max().unwrap_or(0)
    }
}

impl FromStr for MassifProfile {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut profile = MassifProfile::default();

        for (idx, raw) in s.lines().enumerate() {
            let line = idx + 1;
            // comments, separators, and allocation tree nodes
            if raw.starts_with('#') || raw.starts_with(' ') || raw.starts_with('n') {
                continue;
            }

            if let Some((key, value)) = raw.split_once(": ") {
                match key {
                    "desc" => profile.description = value.to_string(),
                    "cmd" => profile.command = value.to_string(),
                    "time_unit" => profile.time_unit = value.to_string(),
                    _ => {}
                }
                continue;
            }

            let Some((key, value)) = raw.split_once('=') else {
                continue;
            };

            if key == "snapshot" {
                profile.snapshots.push(Snapshot {
                    index: number(line, key, value)?,
                    ..Default::default()
                });
                continue;
            }

            let snapshot = profile
                .snapshots
                .last_mut()
                .ok_or_else(|| ProfileError::OutsideSnapshot {
                    line,
                    key: key.to_string(),
                })?;

            match key {
                "time" => snapshot.time = number(line, key, value)?,
                "mem_heap_B" => snapshot.heap_bytes = number(line, key, value)?,
                "mem_heap_extra_B" => snapshot.heap_extra_bytes = number(line, key, value)?,
                "mem_stacks_B" => snapshot.stack_bytes = number(line, key, value)?,
                "heap_tree" => {
                    snapshot.tree = match value {
                        "peak" => HeapTree::Peak,
                        "detailed" => HeapTree::Detailed,
                        _ => HeapTree::Empty,
                    }
                }
                _ => {}
            }
        }

        if profile.snapshots.is_empty() {
            return Err(ProfileError::Empty);
        }
        Ok(profile)
    }
}

fn number(line: usize, key: &str, value: &str) -> Result<u64, ProfileError> {
    value.trim().parse().map_err(|_| ProfileError::InvalidNumber {
        line,
        key: key.to_string(),
        value: value.to_string(),
    })
}
