//! Target-root planner: the set of future mounts an installer is
//! preparing, kept topologically ordered so a mount's path is never a
//! proper prefix of any earlier mount's path (`/` first, then
//! descendants).
use std::io::{self, Write};

use crate::errors::{CoreError, CoreResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
	pub dev: String,
	pub path: String,
	pub fs: String,
	pub ops: String,
}

#[derive(Default)]
pub struct TargetPlan {
	mounts: Vec<Mount>,
}

impl TargetPlan {
	pub fn new() -> Self {
		TargetPlan { mounts: Vec::new() }
	}

	pub fn is_empty(&self) -> bool {
		self.mounts.is_empty()
	}

	pub fn len(&self) -> usize {
		self.mounts.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Mount> {
		self.mounts.iter()
	}

	/// Map a device to a future mount point. The first mapping must be
	/// the root; later ones slot in after their ancestors.
	pub fn prepare(&mut self, dev: &str, path: &str, fs: &str, ops: &str) -> CoreResult<()> {
		if !path.starts_with('/') {
			return Err(CoreError::BadArgument(format!(
				"target path must be absolute: {}",
				path
			)));
		}
		if self.mounts.is_empty() && path != "/" {
			return Err(CoreError::BadArgument(format!(
				"need a root ('/') before mapping {}",
				path
			)));
		}
		if let Some(m) = self.mounts.iter().find(|m| m.path == path) {
			return Err(CoreError::BadArgument(format!(
				"already have {} at {}",
				m.dev, path
			)));
		}
		let m = Mount {
			dev: dev.to_owned(),
			path: path.to_owned(),
			fs: fs.to_owned(),
			ops: ops.to_owned(),
		};
		// Shorter paths come first; among equals, lexicographic. An
		// earlier entry can then never have a later one as a proper
		// prefix.
		let at = self
			.mounts
			.partition_point(|e| (e.path.len(), e.path.as_str()) < (m.path.len(), m.path.as_str()));
		self.mounts.insert(at, m);
		Ok(())
	}

	/// Unmap by path or by device name.
	pub fn remove(&mut self, what: &str) -> CoreResult<Mount> {
		let Some(z) = self
			.mounts
			.iter()
			.position(|m| m.path == what || m.dev == what)
		else {
			return Err(CoreError::NotFound(what.to_owned()));
		};
		// The root cannot leave while descendants remain.
		if self.mounts[z].path == "/" && self.mounts.len() > 1 {
			return Err(CoreError::BadArgument(
				"remove descendant mounts before the root".to_owned(),
			));
		}
		Ok(self.mounts.remove(z))
	}

	pub fn clear(&mut self) {
		self.mounts.clear();
	}

	/// fstab form: device, path, fs, opts, dump 0, fsck pass (1 for
	/// the root, 0 for swap, 2 otherwise). `/` always leads.
	pub fn finalize(&self, w: &mut impl Write) -> io::Result<()> {
		for m in &self.mounts {
			let passno = if m.fs == "swap" {
				0
			} else if m.path == "/" {
				1
			} else {
				2
			};
			let ops = if m.ops.is_empty() { "defaults" } else { &m.ops };
			writeln!(
				w,
				"/dev/{}\t{}\t{}\t{}\t{}\t{}",
				m.dev, m.path, m.fs, ops, 0, passno
			)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_root_must_come_first() {
		let mut plan = TargetPlan::new();
		assert!(matches!(
			plan.prepare("sda2", "/home", "ext4", ""),
			Err(CoreError::BadArgument(_))
		));
		plan.prepare("sda1", "/", "ext4", "").unwrap();
		plan.prepare("sda2", "/home", "ext4", "").unwrap();
		assert_eq!(plan.len(), 2);
	}

	#[test]
	fn test_prefix_order() {
		let mut plan = TargetPlan::new();
		plan.prepare("sda1", "/", "ext4", "").unwrap();
		plan.prepare("sda4", "/home/shared/media", "xfs", "").unwrap();
		plan.prepare("sda3", "/home", "ext4", "").unwrap();
		plan.prepare("sda2", "/boot", "vfat", "").unwrap();
		let paths: Vec<&str> = plan.iter().map(|m| m.path.as_str()).collect();
		assert_eq!(paths[0], "/");
		// No entry is a proper prefix of any earlier entry.
		for (i, a) in paths.iter().enumerate() {
			for b in &paths[..i] {
				assert!(
					!(b.len() > a.len() && b.starts_with(*a)),
					"{} precedes its ancestor {}",
					b,
					a
				);
			}
		}
	}

	#[test]
	fn test_duplicate_and_removal() {
		let mut plan = TargetPlan::new();
		plan.prepare("sda1", "/", "ext4", "").unwrap();
		plan.prepare("sda2", "/var", "ext4", "").unwrap();
		assert!(matches!(
			plan.prepare("sdb1", "/var", "btrfs", ""),
			Err(CoreError::BadArgument(_))
		));
		// Root is pinned while /var is mapped.
		assert!(matches!(plan.remove("/"), Err(CoreError::BadArgument(_))));
		plan.remove("sda2").unwrap();
		plan.remove("/").unwrap();
		assert!(plan.is_empty());
		assert!(matches!(plan.remove("/var"), Err(CoreError::NotFound(_))));
	}

	#[test]
	fn test_finalize_format() {
		let mut plan = TargetPlan::new();
		plan.prepare("sda2", "/", "ext4", "noatime").unwrap();
		plan.prepare("sda1", "/boot/efi", "vfat", "").unwrap();
		plan.prepare("sda3", "/swapfile-part", "swap", "sw").unwrap();
		let mut out = Vec::new();
		plan.finalize(&mut out).unwrap();
		let text = String::from_utf8(out).unwrap();
		let lines: Vec<&str> = text.lines().collect();
		assert_eq!(lines[0], "/dev/sda2\t/\text4\tnoatime\t0\t1");
		assert!(lines.contains(&"/dev/sda1\t/boot/efi\tvfat\tdefaults\t0\t2"));
		assert!(lines.contains(&"/dev/sda3\t/swapfile-part\tswap\tsw\t0\t0"));
		// Root leads.
		assert!(lines[0].contains("\t/\t"));
	}
}
