//! Filesystem creation and checking, delegated to the mkfs.*/fsck.*
//! family.
use std::process::Command;

use crate::context::GraphState;
use crate::diag::diag;
use crate::errors::{CoreError, CoreResult};
use crate::exec;

/// Filesystems we know how to create.
pub const FS_TYPES: &[&str] = &["ext4", "ext3", "ext2", "btrfs", "xfs", "vfat", "f2fs"];

pub fn fs_supported(fstype: &str) -> bool {
	FS_TYPES.contains(&fstype)
}

/// Assemble the mkfs invocation. FAT labels ride -n; everyone else
/// takes -L.
fn mkfs_cmdline(node: &std::path::Path, fstype: &str, label: Option<&str>) -> CoreResult<Command> {
	if !fs_supported(fstype) {
		return Err(CoreError::BadArgument(format!(
			"unknown filesystem type: {}",
			fstype
		)));
	}
	if let Some(l) = label {
		if fstype == "vfat" {
			if !l.is_ascii() || l.len() > 11 {
				return Err(CoreError::BadArgument(format!(
					"FAT volume labels are up to 11 ASCII characters: {}",
					l
				)));
			}
		} else if l.len() > 63 {
			return Err(CoreError::BadArgument(format!(
				"filesystem labels are limited to 63 bytes: {}",
				l
			)));
		}
	}
	let mut cmd = Command::new(format!("mkfs.{}", fstype));
	if let Some(l) = label {
		cmd.arg(if fstype == "vfat" { "-n" } else { "-L" });
		cmd.arg(l);
	}
	cmd.arg("--");
	cmd.arg(node);
	Ok(cmd)
}

/// Create a filesystem on the named device.
pub fn make_filesystem(
	g: &mut GraphState,
	name: &str,
	fstype: &str,
	label: Option<&str>,
) -> CoreResult<()> {
	let idx = g.lookup_device(name)?;
	let d = g.device(idx).unwrap();
	if d.mnt.mounted_p() {
		return Err(CoreError::BusyMounted(format!(
			"{} ({})",
			name, d.mnt.paths[0]
		)));
	}
	if d.swapprio.active() {
		return Err(CoreError::BusySwap(name.to_owned()));
	}
	if g.slave_p(name) {
		return Err(CoreError::BusySlave(name.to_owned()));
	}
	if d.pttable().is_some() {
		return Err(CoreError::BadArgument(format!(
			"{} carries a partition table; wipe it first",
			name
		)));
	}
	let mut cmd = mkfs_cmdline(&g.dev_node(name), fstype, label)?;
	exec::drain(&mut cmd)?;
	let d = g.device_mut(idx).unwrap();
	d.mnttype = Some(fstype.to_owned());
	d.label = label.map(str::to_owned);
	Ok(())
}

/// fsck the filesystem on the named device.
pub fn check_filesystem(g: &GraphState, name: &str) -> CoreResult<()> {
	let idx = g.lookup_device(name)?;
	let d = g.device(idx).unwrap();
	if d.mnt.mounted_p() {
		return Err(CoreError::BusyMounted(format!(
			"{} ({})",
			name, d.mnt.paths[0]
		)));
	}
	let Some(fstype) = &d.mnttype else {
		return Err(CoreError::BadArgument(format!(
			"no filesystem on {}",
			name
		)));
	};
	let mut cmd = Command::new(format!("fsck.{}", fstype));
	// Not every fsck knows -y, but ours do.
	cmd.arg("-y").arg(g.dev_node(name));
	exec::drain(&mut cmd)
}

/// Surface-scan a device with badblocks. Read-only by default; `rw`
/// runs the write test, degraded to the non-destructive variant while
/// anything is mounted.
pub fn badblock_scan(g: &GraphState, name: &str, rw: bool) -> CoreResult<()> {
	let idx = g.lookup_device(name)?;
	let d = g.device(idx).unwrap();
	if !d.is_raw() {
		diag!("Block scans are performed only on raw block devices");
		return Err(CoreError::WrongLayout);
	}
	let mut cmd = Command::new("badblocks");
	cmd.arg("-s");
	if rw {
		cmd.arg(if d.mnt.mounted_p() { "-n" } else { "-w" });
	}
	cmd.arg(g.dev_node(name));
	exec::drain(&mut cmd)
}

/// Discard unused blocks on a mounted filesystem.
pub fn fstrim(g: &GraphState, name: &str) -> CoreResult<()> {
	let idx = g.lookup_device(name)?;
	let d = g.device(idx).unwrap();
	if !d.mnt.mounted_p() {
		return Err(CoreError::BadArgument(format!(
			"{} is not mounted",
			name
		)));
	}
	let mut cmd = Command::new("fstrim");
	cmd.arg(&d.mnt.paths[0]);
	exec::drain(&mut cmd)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::{Device, Layout, NullObserver, RawAttrs};
	use std::path::{Path, PathBuf};

	fn graph_with(names: &[&str]) -> GraphState {
		let mut g = GraphState::with_roots(
			Box::new(NullObserver),
			PathBuf::from("/nonexistent-sysfs"),
			PathBuf::from("/dev"),
		);
		for n in names {
			let mut d = Device::new(n, Layout::Raw(RawAttrs::default()));
			d.bytes = 1 << 30;
			g.adopt_device(d, 0);
		}
		g
	}

	#[test]
	fn test_mkfs_cmdline() {
		let cmd = mkfs_cmdline(Path::new("/dev/sda1"), "ext4", Some("Root")).unwrap();
		assert_eq!(cmd.get_program(), "mkfs.ext4");
		let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy()).collect();
		assert_eq!(args, vec!["-L", "Root", "--", "/dev/sda1"]);
		let cmd = mkfs_cmdline(Path::new("/dev/sda1"), "vfat", Some("EFI")).unwrap();
		let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy()).collect();
		assert_eq!(args[0], "-n");
		assert!(matches!(
			mkfs_cmdline(Path::new("/dev/sda1"), "zfs", None),
			Err(CoreError::BadArgument(_))
		));
		assert!(matches!(
			mkfs_cmdline(Path::new("/dev/sda1"), "vfat", Some("far-too-long-label")),
			Err(CoreError::BadArgument(_))
		));
	}

	#[test]
	fn test_badblock_scan_validations() {
		use crate::device::{PartAttrs, PartRole};
		let mut g = graph_with(&["sdu"]);
		assert!(matches!(
			badblock_scan(&g, "missing", false),
			Err(CoreError::NotFound(_))
		));
		// Block scans only run against raw block devices.
		let p = Device::new(
			"sdu1",
			Layout::Partition(PartAttrs {
				parent: 0,
				pnumber: 1,
				fsector: 2048,
				lsector: 4095,
				code: crate::ptypes::PARTTYPE_LINUX,
				flags: 0,
				pname: None,
				puuid: None,
				role: PartRole::Gpt,
				alignment: 2048 * 512,
			}),
		);
		let idx = g.lookup("sdu").unwrap();
		g.adopt_partition(idx, p);
		assert!(matches!(
			badblock_scan(&g, "sdu1", true),
			Err(CoreError::WrongLayout)
		));
	}

	#[test]
	fn test_make_filesystem_validations() {
		let mut g = graph_with(&["sdv1"]);
		let idx = g.lookup("sdv1").unwrap();
		g.device_mut(idx).unwrap().mnt.add("/somewhere", "rw");
		assert!(matches!(
			make_filesystem(&mut g, "sdv1", "ext4", None),
			Err(CoreError::BusyMounted(_))
		));
		g.device_mut(idx).unwrap().mnt.clear();
		g.device_mut(idx)
			.unwrap()
			.set_pttable(Some("gpt".to_owned()));
		assert!(matches!(
			make_filesystem(&mut g, "sdv1", "ext4", None),
			Err(CoreError::BadArgument(_))
		));
		assert!(matches!(
			check_filesystem(&g, "sdv1"),
			Err(CoreError::BadArgument(_))
		));
	}
}
