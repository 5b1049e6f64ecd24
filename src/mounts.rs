//! Mount registry: ingests the kernel's mount table into the device
//! graph, maps option tokens to mount(2) flags, and performs
//! mount/unmount on behalf of the shell.
use std::fs;
use std::mem::MaybeUninit;
use std::path::Path;

use log::debug;
use sys_mount::{Mount, MountFlags, UnmountFlags};

use crate::context::GraphState;
use crate::diag::diag;
use crate::errors::{CoreError, CoreResult};
use crate::utils;

/// Filesystems that exist without a backing block device; their mounts
/// do not belong to any graph record.
const VIRTUAL_FSTYPES: &[&str] = &[
	"proc",
	"sysfs",
	"devtmpfs",
	"devpts",
	"tmpfs",
	"cgroup",
	"cgroup2",
	"securityfs",
	"pstore",
	"efivarfs",
	"bpf",
	"debugfs",
	"tracefs",
	"configfs",
	"fusectl",
	"mqueue",
	"hugetlbfs",
	"autofs",
	"binfmt_misc",
	"overlay",
	"squashfs",
	"ramfs",
	"rpc_pipefs",
	"nfsd",
];

pub fn fstype_virt_p(fs: &str) -> bool {
	VIRTUAL_FSTYPES.contains(&fs)
}

/// One mount-table row: device, path, filesystem, options, and two
/// numeric fields we ignore.
fn parse_mount_line(line: &str) -> Option<(&str, &str, &str, &str)> {
	let mut it = line.split_whitespace();
	let dev = it.next()?;
	let mnt = it.next()?;
	let fs = it.next()?;
	let ops = it.next()?;
	// The dump/pass numerics terminate a well-formed row.
	it.next()?;
	it.next()?;
	Some((dev, mnt, fs, ops))
}

fn statvfs_bytes(path: &str) -> Option<u64> {
	let c = std::ffi::CString::new(path).ok()?;
	let mut vfs = MaybeUninit::<libc::statvfs>::uninit();
	let r = unsafe { libc::statvfs(c.as_ptr(), vfs.as_mut_ptr()) };
	if r != 0 {
		return None;
	}
	let vfs = unsafe { vfs.assume_init() };
	Some(vfs.f_bsize as u64 * vfs.f_blocks as u64)
}

/// Ingest a mount table (normally /proc/mounts) into the graph.
pub fn parse_mounts(g: &mut GraphState, table: &Path) -> CoreResult<()> {
	let content = fs::read_to_string(table)?;
	for line in content.lines() {
		let Some((dev, mnt, fs, ops)) = parse_mount_line(line) else {
			diag!("Couldn't extract mount info from {}", line);
			continue;
		};
		if !dev.starts_with('/') && fstype_virt_p(fs) {
			continue;
		}
		// The device field may be a symlink farm entry
		// (/dev/disk/by-uuid/...); resolve before shedding /dev/.
		let resolved = fs::canonicalize(dev)
			.map(|p| p.to_string_lossy().into_owned())
			.unwrap_or_else(|_| dev.to_owned());
		let Some(idx) = g.lookup(utils::short_name(&resolved)) else {
			debug!("no device behind {} at {}", dev, mnt);
			continue;
		};
		let target_root = g.target_root.clone();
		let d = g.device_mut(idx).unwrap();
		if let Some(prev) = &d.mnttype {
			if prev != fs {
				// The filesystem was reformatted behind our back;
				// the parsed table is authoritative.
				diag!(
					"Already had mounttype for {}: {} (got {})",
					d.name, prev, fs
				);
				d.mnt.clear();
				d.mnttype = Some(fs.to_owned());
			}
		} else {
			d.mnttype = Some(fs.to_owned());
		}
		d.mnt.add(mnt, ops);
		if let Some(bytes) = statvfs_bytes(mnt) {
			d.mnt.bytes = bytes;
		}
		if let Some(root) = &target_root {
			if Path::new(mnt).starts_with(root) {
				d.target = Some(mnt.to_owned());
			}
		}
	}
	Ok(())
}

/// Token -> mount(2) flag. Unknown tokens carry no flag bits; they
/// belong in the data string.
pub fn flag_for_mountop(op: &str) -> MountFlags {
	match op {
		"ro" => MountFlags::RDONLY,
		"dirsync" => MountFlags::DIRSYNC,
		"mand" => MountFlags::MANDLOCK,
		"noatime" => MountFlags::NOATIME,
		"nodev" => MountFlags::NODEV,
		"nodiratime" => MountFlags::NODIRATIME,
		"noexec" => MountFlags::NOEXEC,
		"nosuid" => MountFlags::NOSUID,
		"relatime" => MountFlags::RELATIME,
		"silent" => MountFlags::SILENT,
		"strictatime" => MountFlags::STRICTATIME,
		"sync" => MountFlags::SYNCHRONOUS,
		_ => MountFlags::empty(),
	}
}

/// Split an option string into the kernel flag mask and the leftover
/// filesystem-specific data tokens.
pub fn parse_mountops(ops: &str) -> (MountFlags, String) {
	let mut flags = MountFlags::empty();
	let mut data = Vec::new();
	for tok in ops.split(',').filter(|t| !t.is_empty() && *t != "defaults") {
		let f = flag_for_mountop(tok);
		if f.is_empty() {
			data.push(tok);
		} else {
			flags |= f;
		}
	}
	(flags, data.join(","))
}

fn make_parent_directories(path: &Path) -> CoreResult<()> {
	fs::create_dir_all(path).map_err(|e| {
		diag!("Couldn't create directory at {} ({})", path.display(), e);
		CoreError::Io(e)
	})
}

/// Mount a device from the graph at `targ`.
pub fn mmount(g: &mut GraphState, name: &str, targ: &str, ops: &str) -> CoreResult<()> {
	let idx = g.lookup_device(name)?;
	let d = g.device(idx).unwrap();
	let Some(fstype) = d.mnttype.clone() else {
		return Err(CoreError::BadArgument(format!(
			"{} does not have a filesystem signature",
			name
		)));
	};
	if fstype == "zfs" {
		// ZFS datasets mount through the zfs utility, not mount(2).
		return crate::zfs::mount_zfs(name, targ);
	}
	if d.mnt.contains(targ) {
		return Err(CoreError::BusyMounted(format!("{} at {}", name, targ)));
	}
	if matches!(fstype.as_str(), "zfs_member" | "linux_raid_member") {
		return Err(CoreError::BadArgument(format!(
			"not a mountable filesystem: {}",
			fstype
		)));
	}
	if let Some(root) = &g.target_root {
		if Path::new(targ).starts_with(root) {
			make_parent_directories(Path::new(targ))?;
		}
	}
	let (flags, data) = parse_mountops(ops);
	let node = g.dev_node(name);
	Mount::builder()
		.fstype(fstype.as_str())
		.flags(flags)
		.data(&data)
		.mount(&node, targ)
		.map_err(|e| {
			diag!("Error mounting {} at {} ({})", node.display(), targ, e);
			CoreError::Io(e)
		})?;
	diag!("Mounted {} at {}", name, targ);
	let d = g.device_mut(idx).unwrap();
	d.mnt.add(targ, ops);
	Ok(())
}

/// Unmount one path of a device, or every path it is mounted on.
pub fn unmount(g: &mut GraphState, name: &str, path: Option<&str>) -> CoreResult<()> {
	let idx = g.lookup_device(name)?;
	let d = g.device(idx).unwrap();
	if !d.mnt.mounted_p() {
		return Err(CoreError::BadArgument(format!("{} is not mounted", name)));
	}
	let victims: Vec<String> = match path {
		Some(p) => {
			if !d.mnt.contains(p) {
				return Err(CoreError::NotFound(format!("{} at {}", name, p)));
			}
			vec![p.to_owned()]
		}
		None => d.mnt.paths.clone(),
	};
	for v in &victims {
		diag!("Unmounting {} from {}", name, v);
		sys_mount::unmount(v, UnmountFlags::empty()).map_err(|e| {
			diag!("Error unmounting {} at {} ({})", name, v, e);
			CoreError::Io(e)
		})?;
	}
	let d = g.device_mut(idx).unwrap();
	for v in &victims {
		if let Some(z) = d.mnt.paths.iter().position(|p| p == v) {
			d.mnt.paths.remove(z);
			d.mnt.ops.remove(z);
		}
	}
	if !d.mnt.mounted_p() {
		d.mnt.bytes = 0;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::{Device, Layout, NullObserver, RawAttrs};
	use std::io::Write;
	use std::path::PathBuf;

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

	fn fixture(tag: &str, content: &str) -> PathBuf {
		let path = std::env::temp_dir().join(format!(
			"diskforge-mounts-{}-{}",
			tag,
			std::process::id()
		));
		let mut f = std::fs::File::create(&path).unwrap();
		f.write_all(content.as_bytes()).unwrap();
		path
	}

	#[test]
	fn test_parse_mounts_into_graph() {
		let mut g = graph_with(&["sdz1"]);
		let tmp = std::env::temp_dir();
		let table = format!(
			"proc /proc proc rw,nosuid 0 0\n\
			 /dev/sdz1 {} ext4 rw,relatime 0 0\n\
			 /dev/sdz1 /other-mount ext4 ro 0 0\n\
			 truncated line\n",
			tmp.display()
		);
		let path = fixture("ingest", &table);
		parse_mounts(&mut g, &path).unwrap();
		let d = g.device(g.lookup("sdz1").unwrap()).unwrap();
		assert_eq!(d.mnttype.as_deref(), Some("ext4"));
		assert_eq!(d.mnt.paths.len(), 2);
		assert_eq!(d.mnt.paths.len(), d.mnt.ops.len());
		// statvfs against a real directory filled in the size.
		assert!(d.mnt.bytes > 0);
		// Idempotent across repeat parses.
		parse_mounts(&mut g, &path).unwrap();
		let d = g.device(g.lookup("sdz1").unwrap()).unwrap();
		assert_eq!(d.mnt.paths.len(), 2);
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_reformat_overwrites_fstype() {
		let mut g = graph_with(&["sdy1"]);
		let idx = g.lookup("sdy1").unwrap();
		g.device_mut(idx).unwrap().mnttype = Some("xfs".to_owned());
		g.device_mut(idx).unwrap().mnt.add("/stale", "rw");
		let tmp = std::env::temp_dir();
		let path = fixture("reformat", &format!("/dev/sdy1 {} btrfs rw 0 0\n", tmp.display()));
		parse_mounts(&mut g, &path).unwrap();
		let d = g.device(idx).unwrap();
		assert_eq!(d.mnttype.as_deref(), Some("btrfs"));
		// The stale mount list was dropped with the old type.
		assert!(!d.mnt.contains("/stale"));
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_target_participant() {
		let mut g = graph_with(&["sdx1"]);
		g.target_root = Some(PathBuf::from("/target"));
		let path = fixture("participant", "/dev/sdx1 /target/boot ext4 rw 0 0\n");
		parse_mounts(&mut g, &path).unwrap();
		let d = g.device(g.lookup("sdx1").unwrap()).unwrap();
		assert_eq!(d.target.as_deref(), Some("/target/boot"));
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_mountop_mapping() {
		assert_eq!(flag_for_mountop("ro"), MountFlags::RDONLY);
		assert_eq!(flag_for_mountop("noexec"), MountFlags::NOEXEC);
		assert_eq!(flag_for_mountop("compress=zstd"), MountFlags::empty());
		let (flags, data) = parse_mountops("ro,noatime,compress=zstd,defaults,subvol=@");
		assert!(flags.contains(MountFlags::RDONLY));
		assert!(flags.contains(MountFlags::NOATIME));
		assert_eq!(data, "compress=zstd,subvol=@");
	}

	#[test]
	fn test_mount_validations() {
		let mut g = graph_with(&["sdw1"]);
		// No filesystem signature.
		assert!(matches!(
			mmount(&mut g, "sdw1", "/mnt", "ro"),
			Err(CoreError::BadArgument(_))
		));
		// Aggregate members don't mount.
		let idx = g.lookup("sdw1").unwrap();
		g.device_mut(idx).unwrap().mnttype = Some("linux_raid_member".to_owned());
		assert!(matches!(
			mmount(&mut g, "sdw1", "/mnt", "ro"),
			Err(CoreError::BadArgument(_))
		));
		// Unmounting something unmounted.
		assert!(matches!(
			unmount(&mut g, "sdw1", None),
			Err(CoreError::BadArgument(_))
		));
		assert!(matches!(
			unmount(&mut g, "missing", None),
			Err(CoreError::NotFound(_))
		));
	}
}
