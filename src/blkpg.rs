//! Kernel re-read bridge: BLKPG single-partition notifications and the
//! whole-disk BLKRRPART rescan.
//!
//! udev can hold a disk open for a moment after we touch it, so each
//! ioctl gets three attempts (0 s / 3 s / 3 s). Callers must have
//! fsync'd the disk before notifying the kernel.
use std::fs::File;
use std::os::fd::AsRawFd;
use std::thread;
use std::time::Duration;

use crate::diag::diag;
use crate::errors::{CoreError, CoreResult};

const BLKPG: libc::c_ulong = 0x1269;
const BLKRRPART: libc::c_ulong = 0x125f;
const BLKPG_ADD_PARTITION: libc::c_int = 1;
const BLKPG_DEL_PARTITION: libc::c_int = 2;
const BLKPG_DEVNAMELTH: usize = 64;

#[repr(C)]
struct BlkpgPartition {
	start: libc::c_longlong,
	length: libc::c_longlong,
	pno: libc::c_int,
	devname: [u8; BLKPG_DEVNAMELTH],
	volname: [u8; BLKPG_DEVNAMELTH],
}

#[repr(C)]
struct BlkpgIoctlArg {
	op: libc::c_int,
	flags: libc::c_int,
	datalen: libc::c_int,
	data: *mut libc::c_void,
}

fn blkpg(f: &File, op: libc::c_int, start: u64, length: u64, pno: u32, name: &str) -> CoreResult<()> {
	if pno == 0 {
		return Err(CoreError::BadArgument(format!(
			"invalid partition number: {}",
			pno
		)));
	}
	if name.len() >= BLKPG_DEVNAMELTH {
		return Err(CoreError::NameTooLong);
	}
	let mut data = BlkpgPartition {
		start: start as libc::c_longlong,
		length: length as libc::c_longlong,
		pno: pno as libc::c_int,
		devname: [0u8; BLKPG_DEVNAMELTH],
		volname: [0u8; BLKPG_DEVNAMELTH],
	};
	data.devname[..name.len()].copy_from_slice(name.as_bytes());
	let mut arg = BlkpgIoctlArg {
		op,
		flags: 0,
		datalen: std::mem::size_of::<BlkpgPartition>() as libc::c_int,
		data: &mut data as *mut _ as *mut libc::c_void,
	};
	for t in 0..3 {
		if t > 0 {
			thread::sleep(Duration::from_secs(3));
		}
		let r = unsafe { libc::ioctl(f.as_raw_fd(), BLKPG, &mut arg) };
		if r == 0 {
			diag!(
				"Informed kernel of partition {}'s {}",
				pno,
				if op == BLKPG_ADD_PARTITION { "creation" } else { "deletion" }
			);
			return Ok(());
		}
		diag!(
			"Error invoking BLKPG ioctl on {} p{} ({}){}",
			name,
			pno,
			errno::errno(),
			if t < 2 { ", retrying in 3s" } else { "" }
		);
	}
	Err(CoreError::KernelRescanFailed)
}

pub fn add_partition(f: &File, start: u64, length: u64, pno: u32, name: &str) -> CoreResult<()> {
	blkpg(f, BLKPG_ADD_PARTITION, start, length, pno, name)
}

pub fn del_partition(f: &File, start: u64, length: u64, pno: u32, name: &str) -> CoreResult<()> {
	blkpg(f, BLKPG_DEL_PARTITION, start, length, pno, name)
}

/// Ask the kernel to reread the whole partition table.
pub fn rescan(f: &File) -> CoreResult<()> {
	let r = unsafe { libc::ioctl(f.as_raw_fd(), BLKRRPART) };
	if r != 0 {
		diag!("BLKRRPART failed ({})", errno::errno());
		return Err(CoreError::KernelRescanFailed);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_name_bound() {
		let f = File::open("/dev/null").unwrap();
		let long = "x".repeat(BLKPG_DEVNAMELTH);
		assert!(matches!(
			add_partition(&f, 0, 512, 1, &long),
			Err(CoreError::NameTooLong)
		));
		assert!(matches!(
			del_partition(&f, 0, 512, 0, "sda"),
			Err(CoreError::BadArgument(_))
		));
	}
}
