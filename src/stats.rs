//! /proc/diskstats ingestion for the `stats` verb.
use std::fs;
use std::path::Path;

use crate::errors::CoreResult;

pub const PROCFS_DISKSTATS: &str = "/proc/diskstats";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskStats {
	pub major: u32,
	pub minor: u32,
	pub name: String,
	pub reads: u64,
	pub sectors_read: u64,
	pub writes: u64,
	pub sectors_written: u64,
}

fn parse_line(line: &str) -> Option<DiskStats> {
	let mut it = line.split_whitespace();
	Some(DiskStats {
		major: it.next()?.parse().ok()?,
		minor: it.next()?.parse().ok()?,
		name: it.next()?.to_owned(),
		reads: it.next()?.parse().ok()?,
		// merges
		sectors_read: it.nth(1)?.parse().ok()?,
		// ms reading, then writes
		writes: it.nth(1)?.parse().ok()?,
		sectors_written: it.nth(1)?.parse().ok()?,
	})
}

pub fn read_diskstats(path: &Path) -> CoreResult<Vec<DiskStats>> {
	let content = fs::read_to_string(path)?;
	Ok(content.lines().filter_map(parse_line).collect())
}

pub fn read_proc_diskstats() -> CoreResult<Vec<DiskStats>> {
	read_diskstats(Path::new(PROCFS_DISKSTATS))
}

/// Per-device deltas between two snapshots, keyed by name.
pub fn delta(prev: &[DiskStats], cur: &[DiskStats]) -> Vec<DiskStats> {
	cur.iter()
		.map(|c| {
			let p = prev.iter().find(|p| p.name == c.name);
			DiskStats {
				major: c.major,
				minor: c.minor,
				name: c.name.clone(),
				reads: c.reads - p.map(|p| p.reads).unwrap_or(0),
				sectors_read: c.sectors_read - p.map(|p| p.sectors_read).unwrap_or(0),
				writes: c.writes - p.map(|p| p.writes).unwrap_or(0),
				sectors_written: c.sectors_written
					- p.map(|p| p.sectors_written).unwrap_or(0),
			}
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = "   8       0 sda 12735 4587 1380170 10853 30371 17363 1229086 42873 0 29268 53727 0 0 0 0\n   8       1 sda1 12000 4000 1300000 10000 30000 17000 1200000 42000 0 29000 53000 0 0 0 0\n";

	#[test]
	fn test_parse() {
		let stats: Vec<DiskStats> = SAMPLE.lines().filter_map(parse_line).collect();
		assert_eq!(stats.len(), 2);
		assert_eq!(stats[0].name, "sda");
		assert_eq!(stats[0].major, 8);
		assert_eq!(stats[0].reads, 12735);
		assert_eq!(stats[0].sectors_read, 1_380_170);
		assert_eq!(stats[0].writes, 30371);
		assert_eq!(stats[0].sectors_written, 1_229_086);
	}

	#[test]
	fn test_delta() {
		let prev: Vec<DiskStats> = SAMPLE.lines().filter_map(parse_line).collect();
		let mut cur = prev.clone();
		cur[0].reads += 10;
		cur[0].sectors_read += 80;
		let d = delta(&prev, &cur);
		assert_eq!(d[0].reads, 10);
		assert_eq!(d[0].sectors_read, 80);
		assert_eq!(d[1].reads, 0);
	}
}
