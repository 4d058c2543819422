//! Local Partition Table
//!
//! Source of device names the local OS already knows about.

use crate::error::Result;
use std::fs;
use std::path::PathBuf;

/// Default location of the kernel partition table
pub const PROC_PARTITIONS: &str = "/proc/partitions";

/// Lists the device names visible in the local partition table
pub trait PartitionSource: Send + Sync {
    fn partitions(&self) -> Result<Vec<String>>;
}

/// Reads `/proc/partitions`
#[derive(Debug, Clone)]
pub struct ProcPartitions {
    path: PathBuf,
}

impl Default for ProcPartitions {
    fn default() -> Self {
        Self {
            path: PathBuf::from(PROC_PARTITIONS),
        }
    }
}

impl ProcPartitions {
    /// Read a partition table at a non-default path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse the table: two header lines, then `major minor #blocks name`
    pub fn parse(contents: &str) -> Vec<String> {
        contents
            .lines()
            .skip(2)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                (fields.len() == 4).then(|| fields[3].to_string())
            })
            .collect()
    }
}

impl PartitionSource for ProcPartitions {
    fn partitions(&self) -> Result<Vec<String>> {
        let contents = fs::read_to_string(&self.path)?;
        Ok(Self::parse(&contents))
    }
}

/// Fixed partition list
#[derive(Debug, Clone, Default)]
pub struct StaticPartitions(pub Vec<String>);

impl PartitionSource for StaticPartitions {
    fn partitions(&self) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}
