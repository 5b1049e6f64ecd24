//! Apple Partition Map: nominal create/zap support only.
//!
//! A zeroed Device Descriptor Block occupies sector 0; 32 entry
//! sectors follow, each carrying the "PM" signature and the map's
//! entry count, with slot 1 spanning the free remainder of the disk.
//! APM is a big-endian format with 512-byte entries; other sector
//! sizes are refused. Partition add/delete is not supported.
use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::errors::{CoreError, CoreResult};
use crate::gpt::DiskGeometry;

const APM_ENTRIES: u32 = 32;
const APM_SIG: [u8; 2] = *b"PM";
const APM_LBA: u64 = 512;

fn check_geometry(geom: &DiskGeometry) -> CoreResult<()> {
	if geom.lsec != APM_LBA {
		return Err(CoreError::Unsupported("APM on non-512-byte sectors"));
	}
	if geom.bytes < geom.lsec || geom.bytes % geom.lsec != 0 {
		return Err(CoreError::BadGeometry(format!(
			"disk size {} unusable for APM",
			geom.bytes
		)));
	}
	if (APM_ENTRIES as u64) + 1 > geom.lbas() {
		return Err(CoreError::BadGeometry(format!(
			"cannot place {} map entries in {} sectors",
			APM_ENTRIES,
			geom.lbas()
		)));
	}
	Ok(())
}

fn entry_sector(count: u32, fsector: u32, sectors: u32, pname: &str, ptype: &str) -> Vec<u8> {
	let mut sec = vec![0u8; APM_LBA as usize];
	sec[0..2].copy_from_slice(&APM_SIG);
	sec[4..8].copy_from_slice(&count.to_be_bytes());
	sec[8..12].copy_from_slice(&fsector.to_be_bytes());
	sec[12..16].copy_from_slice(&sectors.to_be_bytes());
	sec[16..16 + pname.len().min(31)].copy_from_slice(&pname.as_bytes()[..pname.len().min(31)]);
	sec[48..48 + ptype.len().min(31)].copy_from_slice(&ptype.as_bytes()[..ptype.len().min(31)]);
	sec
}

pub fn create(f: &File, geom: &DiskGeometry) -> CoreResult<()> {
	check_geometry(geom)?;
	// Device Descriptor Block, nominally blank.
	f.write_all_at(&vec![0u8; APM_LBA as usize], 0)?;
	let free_first = 1 + APM_ENTRIES;
	let free_count = u32::try_from(geom.lbas() - free_first as u64)
		.map_err(|_| CoreError::CapacityExceeded)?;
	for z in 0..APM_ENTRIES {
		let sec = if z == 0 {
			// Slot 1 spans the rest of the disk.
			entry_sector(APM_ENTRIES, free_first, free_count, "Extra", "Apple_Free")
		} else {
			entry_sector(APM_ENTRIES, 0, 0, "", "Apple_Extra")
		};
		f.write_all_at(&sec, (1 + z as u64) * APM_LBA)?;
	}
	f.sync_all()?;
	Ok(())
}

pub fn zap(f: &File, geom: &DiskGeometry) -> CoreResult<()> {
	check_geometry(geom)?;
	let zones = (APM_ENTRIES as u64 + 1).min(geom.lbas());
	f.write_all_at(&vec![0u8; (zones * APM_LBA) as usize], 0)?;
	f.sync_all()?;
	Ok(())
}

/// Sector 1's entry count defines where data may begin.
pub fn first_usable(f: &File, geom: &DiskGeometry) -> CoreResult<u64> {
	check_geometry(geom)?;
	let mut sec = vec![0u8; APM_LBA as usize];
	f.read_exact_at(&mut sec, APM_LBA)?;
	if sec[0..2] != APM_SIG {
		return Err(CoreError::Corrupt("APM signature"));
	}
	let count = u32::from_be_bytes(sec[4..8].try_into().unwrap());
	Ok(1 + count as u64)
}

pub fn last_usable(geom: &DiskGeometry) -> u64 {
	if geom.lsec == 0 || geom.bytes == 0 {
		return 0;
	}
	geom.lbas() - 1
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utils::create_sparse_file;

	fn scratch(name: &str, lsec: u64) -> (std::path::PathBuf, File, DiskGeometry) {
		let path =
			std::env::temp_dir().join(format!("diskforge-apm-{}-{}", name, std::process::id()));
		let _ = std::fs::remove_file(&path);
		let bytes = 1_048_576;
		create_sparse_file(&path, bytes).unwrap();
		let f = File::options().read(true).write(true).open(&path).unwrap();
		(
			path,
			f,
			DiskGeometry {
				lsec,
				psec: lsec,
				bytes,
			},
		)
	}

	#[test]
	fn test_create_and_usable_range() {
		let (path, f, geom) = scratch("create", 512);
		create(&f, &geom).unwrap();
		assert_eq!(first_usable(&f, &geom).unwrap(), 33);
		assert_eq!(last_usable(&geom), 2047);
		// Slot 1 spans the free remainder.
		let mut sec = vec![0u8; 512];
		f.read_exact_at(&mut sec, 512).unwrap();
		assert_eq!(&sec[0..2], b"PM");
		assert_eq!(u32::from_be_bytes(sec[8..12].try_into().unwrap()), 33);
		assert_eq!(
			u32::from_be_bytes(sec[12..16].try_into().unwrap()),
			2048 - 33
		);
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_zap() {
		let (path, f, geom) = scratch("zap", 512);
		create(&f, &geom).unwrap();
		zap(&f, &geom).unwrap();
		assert!(matches!(
			first_usable(&f, &geom),
			Err(CoreError::Corrupt(_))
		));
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_large_sectors_unsupported() {
		let (path, f, geom) = scratch("4k", 4096);
		assert!(matches!(
			create(&f, &geom),
			Err(CoreError::Unsupported(_))
		));
		std::fs::remove_file(path).unwrap();
	}
}
