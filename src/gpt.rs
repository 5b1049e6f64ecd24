//! GUID Partition Table engine.
//!
//! Owns the primary and backup GPT on a disk: creation, zapping, entry
//! CRUD, and the CRC/mirror maintenance every mutation entails. All
//! functions operate on an open descriptor plus the disk's geometry;
//! the dispatcher (`ptable`) supplies both and sequences the kernel
//! rescan afterwards.
use std::fs::File;
use std::os::unix::fs::FileExt;

use log::debug;

use crate::codec;
use crate::errors::{CoreError, CoreResult};
use crate::ptypes;

pub const MINIMUM_GPT_ENTRIES: u32 = 128;
pub const GPT_ENTRY_SIZE: u32 = 128;
pub const GPT_HEADER_SIZE: usize = 92;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
pub const GPT_NAME_UNITS: usize = 36;
const MBR_OFFSET: u64 = 440;

/// Everything the engines need to know about the disk under the table.
#[derive(Clone, Copy, Debug)]
pub struct DiskGeometry {
	/// Logical sector size in bytes.
	pub lsec: u64,
	/// Physical sector size in bytes.
	pub psec: u64,
	/// Total size in bytes.
	pub bytes: u64,
}

impl DiskGeometry {
	pub fn lbas(&self) -> u64 {
		self.bytes / self.lsec
	}

	/// Sectors occupied by one copy of the GPT (header plus entry
	/// array).
	pub fn table_lbas(&self) -> u64 {
		let array = (MINIMUM_GPT_ENTRIES * GPT_ENTRY_SIZE) as u64;
		1 + array.div_ceil(self.lsec)
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GptHeader {
	pub revision: u32,
	pub headsize: u32,
	pub crc: u32,
	pub this_lba: u64,
	pub alt_lba: u64,
	pub first_usable: u64,
	pub last_usable: u64,
	pub disk_guid: [u8; 16],
	pub part_lba: u64,
	pub partcount: u32,
	pub partsize: u32,
	pub partcrc: u32,
}

impl GptHeader {
	pub fn to_bytes(&self) -> [u8; GPT_HEADER_SIZE] {
		let mut b = [0u8; GPT_HEADER_SIZE];
		b[0..8].copy_from_slice(GPT_SIGNATURE);
		b[8..12].copy_from_slice(&self.revision.to_le_bytes());
		b[12..16].copy_from_slice(&self.headsize.to_le_bytes());
		b[16..20].copy_from_slice(&self.crc.to_le_bytes());
		// bytes 20..24 are reserved, kept zero
		b[24..32].copy_from_slice(&self.this_lba.to_le_bytes());
		b[32..40].copy_from_slice(&self.alt_lba.to_le_bytes());
		b[40..48].copy_from_slice(&self.first_usable.to_le_bytes());
		b[48..56].copy_from_slice(&self.last_usable.to_le_bytes());
		b[56..72].copy_from_slice(&self.disk_guid);
		b[72..80].copy_from_slice(&self.part_lba.to_le_bytes());
		b[80..84].copy_from_slice(&self.partcount.to_le_bytes());
		b[84..88].copy_from_slice(&self.partsize.to_le_bytes());
		b[88..92].copy_from_slice(&self.partcrc.to_le_bytes());
		b
	}

	pub fn from_bytes(b: &[u8]) -> CoreResult<Self> {
		if b.len() < GPT_HEADER_SIZE {
			return Err(CoreError::Corrupt("short GPT header"));
		}
		if &b[0..8] != GPT_SIGNATURE {
			return Err(CoreError::Corrupt("GPT signature"));
		}
		let u32le = |o: usize| u32::from_le_bytes(b[o..o + 4].try_into().unwrap());
		let u64le = |o: usize| u64::from_le_bytes(b[o..o + 8].try_into().unwrap());
		let mut disk_guid = [0u8; 16];
		disk_guid.copy_from_slice(&b[56..72]);
		Ok(GptHeader {
			revision: u32le(8),
			headsize: u32le(12),
			crc: u32le(16),
			this_lba: u64le(24),
			alt_lba: u64le(32),
			first_usable: u64le(40),
			last_usable: u64le(48),
			disk_guid,
			part_lba: u64le(72),
			partcount: u32le(80),
			partsize: u32le(84),
			partcrc: u32le(88),
		})
	}

	/// Recompute both CRCs against the given entry array.
	pub fn update_crc(&mut self, entries: &[u8]) -> CoreResult<()> {
		// Entry size must be a positive multiple of 128 (usually 128).
		if self.partsize == 0 || self.partsize % 128 != 0 {
			return Err(CoreError::Corrupt("GPT entry size"));
		}
		if self.partcount < MINIMUM_GPT_ENTRIES {
			return Err(CoreError::Corrupt("GPT entry count"));
		}
		let span = (self.partcount * self.partsize) as usize;
		if entries.len() < span {
			return Err(CoreError::Corrupt("short GPT entry array"));
		}
		self.partcrc = codec::crc32(&entries[..span]);
		self.crc = 0;
		self.crc = codec::crc32(&self.to_bytes());
		Ok(())
	}

	fn verify(&self, entries: &[u8]) -> CoreResult<()> {
		let mut probe = self.clone();
		probe.crc = 0;
		if codec::crc32(&probe.to_bytes()) != self.crc {
			return Err(CoreError::Corrupt("GPT header CRC"));
		}
		let span = (self.partcount as usize) * (self.partsize as usize);
		if entries.len() < span || codec::crc32(&entries[..span]) != self.partcrc {
			return Err(CoreError::Corrupt("GPT entry array CRC"));
		}
		Ok(())
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GptEntry {
	pub type_guid: [u8; 16],
	pub part_guid: [u8; 16],
	pub first_lba: u64,
	pub last_lba: u64,
	pub flags: u64,
	pub name: [u8; 72],
}

impl GptEntry {
	pub fn empty() -> Self {
		GptEntry {
			name: [0u8; 72],
			..Default::default()
		}
	}

	pub fn is_empty(&self) -> bool {
		self.type_guid == [0u8; 16] && self.part_guid == [0u8; 16]
	}

	pub fn to_bytes(&self) -> [u8; GPT_ENTRY_SIZE as usize] {
		let mut b = [0u8; GPT_ENTRY_SIZE as usize];
		b[0..16].copy_from_slice(&self.type_guid);
		b[16..32].copy_from_slice(&self.part_guid);
		b[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
		b[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
		b[48..56].copy_from_slice(&self.flags.to_le_bytes());
		b[56..128].copy_from_slice(&self.name);
		b
	}

	pub fn from_bytes(b: &[u8]) -> Self {
		let mut e = GptEntry::empty();
		e.type_guid.copy_from_slice(&b[0..16]);
		e.part_guid.copy_from_slice(&b[16..32]);
		e.first_lba = u64::from_le_bytes(b[32..40].try_into().unwrap());
		e.last_lba = u64::from_le_bytes(b[40..48].try_into().unwrap());
		e.flags = u64::from_le_bytes(b[48..56].try_into().unwrap());
		e.name.copy_from_slice(&b[56..128]);
		e
	}
}

fn get_entry(array: &[u8], z: usize) -> GptEntry {
	let off = z * GPT_ENTRY_SIZE as usize;
	GptEntry::from_bytes(&array[off..off + GPT_ENTRY_SIZE as usize])
}

fn put_entry(array: &mut [u8], z: usize, e: &GptEntry) {
	let off = z * GPT_ENTRY_SIZE as usize;
	array[off..off + GPT_ENTRY_SIZE as usize].copy_from_slice(&e.to_bytes());
}

/// Read and verify the primary header and entry array.
pub fn load(f: &File, geom: &DiskGeometry) -> CoreResult<(GptHeader, Vec<u8>)> {
	let mut hsec = vec![0u8; geom.lsec as usize];
	f.read_exact_at(&mut hsec, geom.lsec)?;
	let head = GptHeader::from_bytes(&hsec)?;
	let span = (head.partcount as u64) * (head.partsize as u64);
	if span == 0 || span > (1 << 24) {
		return Err(CoreError::Corrupt("GPT entry array size"));
	}
	let mut array = vec![0u8; span as usize];
	f.read_exact_at(&mut array, head.part_lba * geom.lsec)?;
	head.verify(&array)?;
	Ok((head, array))
}

/// Write both copies: primary header at LBA 1 followed by the array,
/// mirror array ending at LBA N−2 with its header at LBA N−1. The
/// mirror differs from the primary only in the self/alternate/array
/// LBAs and the header CRC. One explicit flush per copy, so power loss
/// leaves at most one half invalid.
fn commit(f: &File, geom: &DiskGeometry, head: &mut GptHeader, array: &[u8]) -> CoreResult<()> {
	let lbas = geom.lbas();
	let table_lbas = geom.table_lbas();
	head.this_lba = 1;
	head.alt_lba = lbas - 1;
	head.part_lba = 2;
	head.update_crc(array)?;
	let mut hsec = vec![0u8; geom.lsec as usize];
	hsec[..GPT_HEADER_SIZE].copy_from_slice(&head.to_bytes());
	f.write_all_at(&hsec, geom.lsec)?;
	f.write_all_at(array, 2 * geom.lsec)?;
	f.sync_all()?;

	let mut backup = head.clone();
	backup.this_lba = lbas - 1;
	backup.alt_lba = 1;
	backup.part_lba = backup.this_lba - (table_lbas - 1);
	backup.update_crc(array)?;
	let mut bsec = vec![0u8; geom.lsec as usize];
	bsec[..GPT_HEADER_SIZE].copy_from_slice(&backup.to_bytes());
	f.write_all_at(array, backup.part_lba * geom.lsec)?;
	f.write_all_at(&bsec, backup.this_lba * geom.lsec)?;
	f.sync_all()?;
	Ok(())
}

/// Protective MBR: one 0xEE partition covering LBAs 1..min(2^32−1, N−1),
/// flagged bootable. Marking it bootable violates the UEFI
/// specification, but some BIOS/MBR *and* UEFI firmware won't boot
/// otherwise.
fn write_protective_mbr(f: &File, geom: &DiskGeometry) -> CoreResult<()> {
	let mut sec = vec![0u8; geom.lsec as usize];
	let e = &mut sec[446..462];
	e[0] = 0x80;
	// CHS of the first absolute sector stays zero
	e[4] = 0xee;
	e[5] = 0xff;
	e[6] = 0xff;
	e[7] = 0xff;
	e[8..12].copy_from_slice(&1u32.to_le_bytes());
	let psects = u32::try_from(geom.lbas() - 1).unwrap_or(u32::MAX);
	e[12..16].copy_from_slice(&psects.to_le_bytes());
	sec[510] = 0x55;
	sec[511] = 0xaa;
	f.write_all_at(&sec, 0)?;
	Ok(())
}

fn check_geometry(geom: &DiskGeometry) -> CoreResult<()> {
	if geom.lsec == 0 || geom.bytes % geom.lsec != 0 {
		return Err(CoreError::BadGeometry(format!(
			"disk size {} is not a multiple of the {}B sector",
			geom.bytes, geom.lsec
		)));
	}
	let array = (MINIMUM_GPT_ENTRIES * GPT_ENTRY_SIZE) as u64;
	if geom.lbas() < 1 + 2 * (1 + array.div_ceil(geom.lsec)) {
		return Err(CoreError::BadGeometry(format!(
			"{} sectors cannot hold two GPT copies",
			geom.lbas()
		)));
	}
	Ok(())
}

/// Create a fresh, empty GPT: protective MBR, primary at LBA 1, mirror
/// at the tail, random disk GUID, both CRCs valid.
pub fn create(f: &File, geom: &DiskGeometry) -> CoreResult<()> {
	check_geometry(geom)?;
	write_protective_mbr(f, geom)?;
	let table_lbas = geom.table_lbas();
	let first_usable = 1 + table_lbas;
	let mut head = GptHeader {
		revision: GPT_REVISION,
		headsize: GPT_HEADER_SIZE as u32,
		crc: 0,
		this_lba: 1,
		alt_lba: geom.lbas() - 1,
		first_usable,
		last_usable: (geom.lbas() - 1) - (first_usable - 1),
		disk_guid: codec::random_guid()?,
		part_lba: 2,
		partcount: MINIMUM_GPT_ENTRIES,
		partsize: GPT_ENTRY_SIZE,
		partcrc: 0,
	};
	let array = vec![0u8; (MINIMUM_GPT_ENTRIES * GPT_ENTRY_SIZE) as usize];
	commit(f, geom, &mut head, &array)
}

/// Overwrite the protective MBR region and both header+array zones
/// with zeros.
pub fn zap(f: &File, geom: &DiskGeometry) -> CoreResult<()> {
	check_geometry(geom)?;
	let zero_mbr = vec![0u8; (geom.lsec - MBR_OFFSET) as usize];
	f.write_all_at(&zero_mbr, MBR_OFFSET)?;
	let table_lbas = geom.table_lbas();
	let zeros = vec![0u8; (table_lbas * geom.lsec) as usize];
	f.write_all_at(&zeros, geom.lsec)?;
	f.write_all_at(&zeros, (geom.lbas() - table_lbas) * geom.lsec)?;
	f.sync_all()?;
	Ok(())
}

pub struct AddedPartition {
	/// 1-based partition number.
	pub pno: u32,
	/// First sector after alignment.
	pub first: u64,
	pub last: u64,
}

/// Add a partition. The first sector is aligned up to the
/// physical/logical sector ratio; the lowest free entry is used; the
/// name is stored as up to 36 UTF-16LE units. The caller is
/// responsible for driving the kernel re-read bridge with the returned
/// partition number.
pub fn add(
	f: &File,
	geom: &DiskGeometry,
	name: Option<&str>,
	fsec: u64,
	lsec: u64,
	code: u16,
) -> CoreResult<AddedPartition> {
	let tguid = ptypes::gpt_guid_of(code)?;
	let (mut head, mut array) = load(f, geom)?;
	// Align to the physical sector boundary.
	let ratio = if geom.psec > geom.lsec { geom.psec / geom.lsec } else { 1 };
	let mut fsec = fsec;
	if fsec % ratio != 0 {
		fsec += ratio - fsec % ratio;
	}
	if lsec < fsec || fsec < head.first_usable || lsec > head.last_usable {
		debug!(
			"bad sector spec ({}:{}) on {} LBA disk",
			fsec,
			lsec,
			geom.lbas()
		);
		return Err(CoreError::OverlapOrMisalign);
	}
	// Find the lowest free entry, and refuse any overlap with a
	// non-empty one.
	let mut slot = None;
	for z in 0..head.partcount as usize {
		let e = get_entry(&array, z);
		if e.is_empty() {
			if slot.is_none() {
				slot = Some(z);
			}
			continue;
		}
		if e.first_lba <= lsec && fsec <= e.last_lba {
			debug!(
				"partition overlap ({}:{}) ([{}]{}:{})",
				fsec, lsec, z, e.first_lba, e.last_lba
			);
			return Err(CoreError::OverlapOrMisalign);
		}
	}
	let Some(z) = slot else {
		return Err(CoreError::NoFreeEntry);
	};
	let mut e = GptEntry::empty();
	e.type_guid = codec::guid_to_disk(&tguid);
	e.part_guid = codec::random_guid()?;
	e.first_lba = fsec;
	e.last_lba = lsec;
	e.flags = 0;
	if let Some(name) = name {
		e.name
			.copy_from_slice(&codec::utf16le_encode(name, GPT_NAME_UNITS));
	}
	put_entry(&mut array, z, &e);
	commit(f, geom, &mut head, &array)?;
	debug!(
		"first sector: {} last sector: {} count: {} size: {}",
		fsec,
		lsec,
		lsec - fsec + 1,
		(lsec - fsec + 1) * geom.lsec
	);
	Ok(AddedPartition {
		pno: z as u32 + 1,
		first: fsec,
		last: lsec,
	})
}

/// Zero the entry for partition `pno`, refresh CRCs, update the
/// mirror. The caller drives the kernel bridge with the same number.
pub fn delete(f: &File, geom: &DiskGeometry, pno: u32) -> CoreResult<()> {
	let (mut head, mut array) = load(f, geom)?;
	let z = slot_of(&head, pno)?;
	put_entry(&mut array, z, &GptEntry::empty());
	commit(f, geom, &mut head, &array)
}

fn slot_of(head: &GptHeader, pno: u32) -> CoreResult<usize> {
	if pno == 0 || pno > head.partcount {
		return Err(CoreError::NotFound(format!("partition {}", pno)));
	}
	Ok(pno as usize - 1)
}

fn edit_entry<F>(f: &File, geom: &DiskGeometry, pno: u32, mutate: F) -> CoreResult<()>
where
	F: FnOnce(&mut GptEntry) -> CoreResult<()>,
{
	let (mut head, mut array) = load(f, geom)?;
	let z = slot_of(&head, pno)?;
	let mut e = get_entry(&array, z);
	if e.is_empty() {
		return Err(CoreError::NotFound(format!("partition {}", pno)));
	}
	mutate(&mut e)?;
	put_entry(&mut array, z, &e);
	commit(f, geom, &mut head, &array)
}

pub fn set_name(f: &File, geom: &DiskGeometry, pno: u32, name: &str) -> CoreResult<()> {
	edit_entry(f, geom, pno, |e| {
		e.name
			.copy_from_slice(&codec::utf16le_encode(name, GPT_NAME_UNITS));
		Ok(())
	})
}

pub fn set_uuid(f: &File, geom: &DiskGeometry, pno: u32, uuid: &uuid::Uuid) -> CoreResult<()> {
	edit_entry(f, geom, pno, |e| {
		e.part_guid = codec::guid_to_disk(uuid);
		Ok(())
	})
}

pub fn set_code(f: &File, geom: &DiskGeometry, pno: u32, code: u16) -> CoreResult<()> {
	let tguid = ptypes::gpt_guid_of(code)?;
	edit_entry(f, geom, pno, |e| {
		e.type_guid = codec::guid_to_disk(&tguid);
		Ok(())
	})
}

pub fn set_flags(f: &File, geom: &DiskGeometry, pno: u32, flags: u64) -> CoreResult<()> {
	edit_entry(f, geom, pno, |e| {
		e.flags = flags;
		Ok(())
	})
}

pub fn set_flag(f: &File, geom: &DiskGeometry, pno: u32, flag: u64, on: bool) -> CoreResult<()> {
	edit_entry(f, geom, pno, |e| {
		if on {
			e.flags |= flag;
		} else {
			e.flags &= !flag;
		}
		Ok(())
	})
}

pub fn first_usable(f: &File, geom: &DiskGeometry) -> CoreResult<u64> {
	let (head, _) = load(f, geom)?;
	Ok(head.first_usable)
}

pub fn last_usable(f: &File, geom: &DiskGeometry) -> CoreResult<u64> {
	let (head, _) = load(f, geom)?;
	Ok(head.last_usable)
}

/// Enumerate non-empty entries as (pno, entry) pairs.
pub fn entries(f: &File, geom: &DiskGeometry) -> CoreResult<Vec<(u32, GptEntry)>> {
	let (head, array) = load(f, geom)?;
	let mut out = Vec::new();
	for z in 0..head.partcount as usize {
		let e = get_entry(&array, z);
		if !e.is_empty() {
			out.push((z as u32 + 1, e));
		}
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ptypes::{PARTTYPE_ESP, PARTTYPE_LINUX};
	use crate::utils::create_sparse_file;
	use uuid::uuid;

	// 2 TiB worth of 512-byte sectors, as a sparse scratch file.
	const LBAS: u64 = 4_194_304;

	fn scratch(name: &str, bytes: u64) -> (std::path::PathBuf, File, DiskGeometry) {
		let _ = env_logger::builder().is_test(true).try_init();
		let path = std::env::temp_dir().join(format!("diskforge-gpt-{}-{}", name, std::process::id()));
		let _ = std::fs::remove_file(&path);
		create_sparse_file(&path, bytes).unwrap();
		let f = File::options().read(true).write(true).open(&path).unwrap();
		let geom = DiskGeometry {
			lsec: 512,
			psec: 512,
			bytes,
		};
		(path, f, geom)
	}

	#[test]
	fn test_create_geometry() {
		let (path, f, geom) = scratch("geom", LBAS * 512);
		create(&f, &geom).unwrap();
		let (head, array) = load(&f, &geom).unwrap();
		assert_eq!(head.revision, 0x00010000);
		assert_eq!(head.headsize, 92);
		assert_eq!(head.this_lba, 1);
		assert_eq!(head.alt_lba, LBAS - 1);
		assert_eq!(head.first_usable, 34);
		assert_eq!(head.last_usable, 4_194_270);
		assert_eq!(head.partcount, 128);
		assert_eq!(head.partsize, 128);
		assert!(array.iter().all(|&b| b == 0));
		// load() verified both CRCs already; cross-check the header
		// CRC by hand.
		let mut probe = head.clone();
		probe.crc = 0;
		assert_eq!(codec::crc32(&probe.to_bytes()), head.crc);
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_create_rejects_bad_geometry() {
		let (path, f, _) = scratch("badgeom", 512 * 66);
		let geom = DiskGeometry {
			lsec: 512,
			psec: 512,
			bytes: 512 * 66,
		};
		// 66 sectors cannot hold two 33-sector copies plus the MBR.
		assert!(matches!(
			create(&f, &geom),
			Err(CoreError::BadGeometry(_))
		));
		let geom = DiskGeometry {
			lsec: 512,
			psec: 512,
			bytes: 512 * 1000 + 13,
		};
		assert!(matches!(
			create(&f, &geom),
			Err(CoreError::BadGeometry(_))
		));
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_protective_mbr() {
		let (path, f, geom) = scratch("pmbr", LBAS * 512);
		create(&f, &geom).unwrap();
		let mut sec = [0u8; 512];
		f.read_exact_at(&mut sec, 0).unwrap();
		assert_eq!(sec[446], 0x80); // bootable, deliberately
		assert_eq!(sec[446 + 4], 0xee);
		assert_eq!(
			u32::from_le_bytes(sec[446 + 8..446 + 12].try_into().unwrap()),
			1
		);
		assert_eq!(
			u32::from_le_bytes(sec[446 + 12..446 + 16].try_into().unwrap()),
			(LBAS - 1) as u32
		);
		assert_eq!(&sec[510..512], &[0x55, 0xaa]);
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_add_spanning_roundtrip() {
		let (path, f, geom) = scratch("span", LBAS * 512);
		create(&f, &geom).unwrap();
		let added = add(&f, &geom, None, 34, 4_194_270, PARTTYPE_LINUX).unwrap();
		assert_eq!(added.pno, 1);
		assert_eq!(added.first, 34);
		let parts = entries(&f, &geom).unwrap();
		assert_eq!(parts.len(), 1);
		let (pno, e) = &parts[0];
		assert_eq!(*pno, 1);
		assert_eq!(
			codec::guid_from_disk(&e.type_guid),
			uuid!("0FC63DAF-8483-4772-8E79-3D69D8477DE4")
		);
		assert_eq!(e.first_lba, 34);
		assert_eq!(e.last_lba, 4_194_270);
		assert_ne!(e.part_guid, [0u8; 16]);
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_mirror_agreement() {
		let (path, f, geom) = scratch("mirror", LBAS * 512);
		create(&f, &geom).unwrap();
		add(&f, &geom, Some("boot"), 2048, 4095, PARTTYPE_ESP).unwrap();
		let (head, array) = load(&f, &geom).unwrap();
		// Backup array sits directly before the backup header.
		let table_lbas = geom.table_lbas();
		let mut barray = vec![0u8; array.len()];
		f.read_exact_at(&mut barray, (geom.lbas() - table_lbas) * 512)
			.unwrap();
		assert_eq!(array, barray);
		let mut bsec = vec![0u8; 512];
		f.read_exact_at(&mut bsec, (geom.lbas() - 1) * 512).unwrap();
		let bhead = GptHeader::from_bytes(&bsec).unwrap();
		assert_eq!(bhead.this_lba, head.alt_lba);
		assert_eq!(bhead.alt_lba, head.this_lba);
		assert_eq!(bhead.part_lba, (geom.lbas() - 1) - (table_lbas - 1));
		// Everything else matches.
		assert_eq!(bhead.first_usable, head.first_usable);
		assert_eq!(bhead.last_usable, head.last_usable);
		assert_eq!(bhead.disk_guid, head.disk_guid);
		assert_eq!(bhead.partcount, head.partcount);
		assert_eq!(bhead.partcrc, head.partcrc);
		let mut probe = bhead.clone();
		probe.crc = 0;
		assert_eq!(codec::crc32(&probe.to_bytes()), bhead.crc);
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_name_truncation() {
		let (path, f, geom) = scratch("longname", LBAS * 512);
		create(&f, &geom).unwrap();
		let long: String = std::iter::repeat('n').take(40).collect();
		add(&f, &geom, Some(&long), 2048, 4095, PARTTYPE_LINUX).unwrap();
		let parts = entries(&f, &geom).unwrap();
		let name = &parts[0].1.name;
		// 36 units stored, and no NUL terminator in-slot.
		assert!(name.chunks_exact(2).all(|c| c != [0, 0]));
		assert_eq!(codec::utf16le_decode(name).chars().count(), 36);
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_overlap_rejected_table_unchanged() {
		let (path, f, geom) = scratch("overlap", LBAS * 512);
		create(&f, &geom).unwrap();
		add(&f, &geom, None, 1000, 2000, PARTTYPE_LINUX).unwrap();
		let before = load(&f, &geom).unwrap();
		assert!(matches!(
			add(&f, &geom, None, 1500, 2500, PARTTYPE_LINUX),
			Err(CoreError::OverlapOrMisalign)
		));
		// Table untouched, CRCs still valid (load verifies them).
		let after = load(&f, &geom).unwrap();
		assert_eq!(before.0, after.0);
		assert_eq!(before.1, after.1);
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_boundaries() {
		let (path, f, geom) = scratch("bounds", LBAS * 512);
		create(&f, &geom).unwrap();
		let (head, _) = load(&f, &geom).unwrap();
		// One sector out on either side fails...
		assert!(add(&f, &geom, None, head.first_usable - 1, 4096, PARTTYPE_LINUX).is_err());
		assert!(add(
			&f,
			&geom,
			None,
			head.first_usable,
			head.last_usable + 1,
			PARTTYPE_LINUX
		)
		.is_err());
		// ...the exact bounds succeed.
		add(
			&f,
			&geom,
			None,
			head.first_usable,
			head.last_usable,
			PARTTYPE_LINUX,
		)
		.unwrap();
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_physical_alignment() {
		let (path, f, _) = scratch("align", LBAS * 512);
		let geom = DiskGeometry {
			lsec: 512,
			psec: 4096,
			bytes: LBAS * 512,
		};
		create(&f, &geom).unwrap();
		// 34 is not a multiple of 8; the engine slides it to 40.
		let added = add(&f, &geom, None, 34, 409_600, PARTTYPE_LINUX).unwrap();
		assert_eq!(added.first, 40);
		assert_eq!(added.first * geom.lsec % geom.psec, 0);
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_delete_and_slot_reuse() {
		let (path, f, geom) = scratch("del", LBAS * 512);
		create(&f, &geom).unwrap();
		add(&f, &geom, None, 2048, 4095, PARTTYPE_LINUX).unwrap();
		add(&f, &geom, None, 4096, 8191, PARTTYPE_LINUX).unwrap();
		delete(&f, &geom, 1).unwrap();
		let parts = entries(&f, &geom).unwrap();
		assert_eq!(parts.len(), 1);
		assert_eq!(parts[0].0, 2);
		// The freed slot is the lowest again.
		let added = add(&f, &geom, None, 8192, 9215, PARTTYPE_LINUX).unwrap();
		assert_eq!(added.pno, 1);
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_entry_edits() {
		let (path, f, geom) = scratch("edit", LBAS * 512);
		create(&f, &geom).unwrap();
		add(&f, &geom, Some("old"), 2048, 4095, PARTTYPE_LINUX).unwrap();
		set_name(&f, &geom, 1, "new").unwrap();
		set_code(&f, &geom, 1, PARTTYPE_ESP).unwrap();
		set_flag(&f, &geom, 1, 0x4, true).unwrap();
		set_flag(&f, &geom, 1, 0x2, true).unwrap();
		set_flag(&f, &geom, 1, 0x4, false).unwrap();
		let u = uuid!("933AC7E1-2EB4-4F13-B844-0E14E2AEF915");
		set_uuid(&f, &geom, 1, &u).unwrap();
		let parts = entries(&f, &geom).unwrap();
		let e = &parts[0].1;
		assert_eq!(codec::utf16le_decode(&e.name), "new");
		assert_eq!(
			codec::guid_from_disk(&e.type_guid),
			uuid!("C12A7328-F81F-11D2-BA4B-00A0C93EC93B")
		);
		assert_eq!(e.flags, 0x2);
		assert_eq!(codec::guid_from_disk(&e.part_guid), u);
		// Editing a nonexistent partition is a lookup failure.
		assert!(matches!(
			set_name(&f, &geom, 5, "x"),
			Err(CoreError::NotFound(_))
		));
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_unsupported_code() {
		let (path, f, geom) = scratch("badcode", LBAS * 512);
		create(&f, &geom).unwrap();
		// DOS extended has no GPT identity.
		assert!(matches!(
			add(&f, &geom, None, 2048, 4095, 0x0005),
			Err(CoreError::CodeUnsupported(_))
		));
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_zap_destroys() {
		let (path, f, geom) = scratch("zap", LBAS * 512);
		create(&f, &geom).unwrap();
		assert!(load(&f, &geom).is_ok());
		zap(&f, &geom).unwrap();
		assert!(matches!(
			load(&f, &geom),
			Err(CoreError::Corrupt("GPT signature"))
		));
		// Backup gone too.
		let mut bsec = vec![0u8; 512];
		f.read_exact_at(&mut bsec, (geom.lbas() - 1) * 512).unwrap();
		assert!(bsec.iter().all(|&b| b == 0));
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_poisoned_primary_reports_corrupt() {
		let (path, f, geom) = scratch("poison", LBAS * 512);
		create(&f, &geom).unwrap();
		// Flip a byte inside the primary header's disk GUID.
		let mut sec = vec![0u8; 512];
		f.read_exact_at(&mut sec, 512).unwrap();
		sec[56] ^= 0xff;
		f.write_all_at(&sec, 512).unwrap();
		assert!(matches!(
			load(&f, &geom),
			Err(CoreError::Corrupt("GPT header CRC"))
		));
		std::fs::remove_file(path).unwrap();
	}

	#[test]
	fn test_usable_range_queries() {
		let (path, f, geom) = scratch("usable", LBAS * 512);
		create(&f, &geom).unwrap();
		assert_eq!(first_usable(&f, &geom).unwrap(), 34);
		assert_eq!(last_usable(&f, &geom).unwrap(), 4_194_270);
		std::fs::remove_file(path).unwrap();
	}
}
