//! DOS/MBR partition-table engine.
//!
//! Four primary slots at offset 446 of LBA 0, 0x55AA signature, 4-byte
//! disk signature at 440. Extended/logical partitions are recognized on
//! read by chasing the EBR chain out of a 0x05/0x0f container, but are
//! never created here. CHS fields are ignored on read and zeroed on
//! write. MBR offers no partition names, a single flag (0x80, the boot
//! flag), and tops out at 2 TB per partition.
use std::fs::File;
use std::os::unix::fs::FileExt;

use log::debug;
use sha1::{Digest, Sha1};

use crate::errors::{CoreError, CoreResult};
use crate::gpt::DiskGeometry;
use crate::ptypes;

pub const MBR_OFFSET: u64 = 440;
pub const MBR_CODE_SIZE: usize = 440;
const MBR_ENTRIES: usize = 4;
const ENTRY_BASE: usize = 446;
pub const MBR_BOOT_FLAG: u8 = 0x80;
const MBR_SIG: [u8; 2] = [0x55, 0xaa];
// Container types whose EBR chain we chase on read.
const EXTENDED_TYPES: [u8; 3] = [0x05, 0x0f, 0x85];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MbrEntry {
	pub flags: u8,
	pub ptype: u8,
	pub first_lba: u32,
	pub sectors: u32,
}

impl MbrEntry {
	pub fn is_empty(&self) -> bool {
		self.ptype == 0 && self.first_lba == 0 && self.sectors == 0
	}

	pub fn last_lba(&self) -> u64 {
		self.first_lba as u64 + self.sectors as u64 - 1
	}

	pub fn is_extended(&self) -> bool {
		EXTENDED_TYPES.contains(&self.ptype)
	}

	fn from_bytes(b: &[u8]) -> Self {
		MbrEntry {
			flags: b[0],
			// bytes 1..4 and 5..8 are CHS, ignored
			ptype: b[4],
			first_lba: u32::from_le_bytes(b[8..12].try_into().unwrap()),
			sectors: u32::from_le_bytes(b[12..16].try_into().unwrap()),
		}
	}

	fn to_bytes(self) -> [u8; 16] {
		let mut b = [0u8; 16];
		b[0] = self.flags;
		b[4] = self.ptype;
		b[8..12].copy_from_slice(&self.first_lba.to_le_bytes());
		b[12..16].copy_from_slice(&self.sectors.to_le_bytes());
		b
	}
}

fn read_sector(f: &File, geom: &DiskGeometry, lba: u64) -> CoreResult<Vec<u8>> {
	let mut sec = vec![0u8; geom.lsec as usize];
	f.read_exact_at(&mut sec, lba * geom.lsec)?;
	Ok(sec)
}

fn load_mbr(f: &File, geom: &DiskGeometry) -> CoreResult<Vec<u8>> {
	let sec = read_sector(f, geom, 0)?;
	if sec[510..512] != MBR_SIG {
		return Err(CoreError::Corrupt("MBR signature"));
	}
	Ok(sec)
}

fn primary(sec: &[u8], z: usize) -> MbrEntry {
	MbrEntry::from_bytes(&sec[ENTRY_BASE + z * 16..ENTRY_BASE + (z + 1) * 16])
}

fn put_primary(sec: &mut [u8], z: usize, e: MbrEntry) {
	sec[ENTRY_BASE + z * 16..ENTRY_BASE + (z + 1) * 16].copy_from_slice(&e.to_bytes());
}

fn check_geometry(geom: &DiskGeometry) -> CoreResult<()> {
	if geom.lsec == 0 || geom.bytes % geom.lsec != 0 {
		return Err(CoreError::BadGeometry(format!(
			"disk size {} is not a multiple of the {}B sector",
			geom.bytes, geom.lsec
		)));
	}
	if geom.bytes < geom.lsec {
		return Err(CoreError::BadGeometry("empty disk".to_owned()));
	}
	Ok(())
}

/// Create a fresh table: random 4-byte disk signature, four empty
/// slots, 0x55AA. The code area is left alone.
pub fn create(f: &File, geom: &DiskGeometry) -> CoreResult<()> {
	check_geometry(geom)?;
	let mut sec = read_sector(f, geom, 0)?;
	let sig: u32 = rand::random();
	sec[440..444].copy_from_slice(&sig.to_le_bytes());
	sec[444..446].fill(0);
	sec[ENTRY_BASE..510].fill(0);
	sec[510..512].copy_from_slice(&MBR_SIG);
	f.write_all_at(&sec, 0)?;
	f.sync_all()?;
	debug!(
		"created MBR, disk signature {:04X}-{:04X}",
		(sig >> 16) as u16,
		(sig & 0xffff) as u16
	);
	Ok(())
}

/// Zero everything from the disk signature through the boot signature.
pub fn zap(f: &File, geom: &DiskGeometry) -> CoreResult<()> {
	check_geometry(geom)?;
	let zeros = vec![0u8; (geom.lsec - MBR_OFFSET) as usize];
	f.write_all_at(&zeros, MBR_OFFSET)?;
	f.sync_all()?;
	Ok(())
}

/// All partitions: primaries numbered 1..=4, then logicals from 5 up,
/// discovered by walking the EBR chain of the first extended container.
pub fn entries(f: &File, geom: &DiskGeometry) -> CoreResult<Vec<(u32, MbrEntry)>> {
	let sec = load_mbr(f, geom)?;
	let mut out = Vec::new();
	let mut extended = None;
	for z in 0..MBR_ENTRIES {
		let e = primary(&sec, z);
		if e.is_empty() {
			continue;
		}
		if e.is_extended() && extended.is_none() {
			extended = Some(e);
		}
		out.push((z as u32 + 1, e));
	}
	if let Some(container) = extended {
		chase_ebrs(f, geom, &container, &mut out)?;
	}
	Ok(out)
}

// Each EBR's first slot is the logical partition (relative to that
// EBR), its second slot links to the next EBR (relative to the
// container start).
fn chase_ebrs(
	f: &File,
	geom: &DiskGeometry,
	container: &MbrEntry,
	out: &mut Vec<(u32, MbrEntry)>,
) -> CoreResult<()> {
	let base = container.first_lba as u64;
	let mut ebr_lba = base;
	let mut pno = 5u32;
	// A cycle in the chain would spin forever; cap the walk.
	for _ in 0..128 {
		let sec = match read_sector(f, geom, ebr_lba) {
			Ok(s) => s,
			Err(_) => break,
		};
		if sec[510..512] != MBR_SIG {
			break;
		}
		let logical = primary(&sec, 0);
		if !logical.is_empty() {
			out.push((
				pno,
				MbrEntry {
					flags: logical.flags,
					ptype: logical.ptype,
					first_lba: (ebr_lba + logical.first_lba as u64) as u32,
					sectors: logical.sectors,
				},
			));
			pno += 1;
		}
		let link = primary(&sec, 1);
		if link.is_empty() {
			break;
		}
		ebr_lba = base + link.first_lba as u64;
	}
	Ok(())
}

pub struct AddedPartition {
	pub pno: u32,
	pub first: u64,
	pub last: u64,
}

/// Add a primary partition. Names are not a thing MBR has; sizes over
/// 2 TB don't fit its 32-bit sector counts.
pub fn add(
	f: &File,
	geom: &DiskGeometry,
	name: Option<&str>,
	fsec: u64,
	lsec: u64,
	code: u16,
) -> CoreResult<AddedPartition> {
	if name.is_some() {
		return Err(CoreError::Unsupported("partition names on dos tables"));
	}
	let mbrcode = ptypes::mbr_code_of(code)?;
	check_geometry(geom)?;
	if (lsec.saturating_sub(fsec) + 1) * geom.lsec > 2_000_000_000_000 {
		return Err(CoreError::CapacityExceeded);
	}
	let ratio = if geom.psec > geom.lsec { geom.psec / geom.lsec } else { 1 };
	let mut fsec = fsec;
	if fsec % ratio != 0 {
		fsec += ratio - fsec % ratio;
	}
	if lsec < fsec || fsec < first_usable(geom) || lsec > last_usable(geom) {
		debug!(
			"bad sector spec ({}:{}) on {} LBA disk",
			fsec,
			lsec,
			geom.lbas()
		);
		return Err(CoreError::OverlapOrMisalign);
	}
	// Overlap against everything we can see, logicals included.
	for (pno, e) in entries(f, geom)? {
		if e.first_lba as u64 <= lsec && fsec <= e.last_lba() {
			debug!(
				"partition overlap ({}:{}) ([{}]{}:{})",
				fsec,
				lsec,
				pno,
				e.first_lba,
				e.last_lba()
			);
			return Err(CoreError::OverlapOrMisalign);
		}
	}
	let mut sec = load_mbr(f, geom)?;
	let mut slot = None;
	for z in 0..MBR_ENTRIES {
		if primary(&sec, z).is_empty() {
			slot = Some(z);
			break;
		}
	}
	let Some(z) = slot else {
		return Err(CoreError::NoFreeEntry);
	};
	let first = u32::try_from(fsec).map_err(|_| CoreError::CapacityExceeded)?;
	let sectors =
		u32::try_from(lsec - fsec + 1).map_err(|_| CoreError::CapacityExceeded)?;
	put_primary(
		&mut sec,
		z,
		MbrEntry {
			flags: 0,
			ptype: mbrcode,
			first_lba: first,
			sectors,
		},
	);
	f.write_all_at(&sec, 0)?;
	f.sync_all()?;
	Ok(AddedPartition {
		pno: z as u32 + 1,
		first: fsec,
		last: lsec,
	})
}

fn primary_slot(pno: u32) -> CoreResult<usize> {
	if pno == 0 || pno > MBR_ENTRIES as u32 {
		return Err(CoreError::Unsupported(
			"mutation of extended/logical partitions",
		));
	}
	Ok(pno as usize - 1)
}

pub fn delete(f: &File, geom: &DiskGeometry, pno: u32) -> CoreResult<()> {
	let z = primary_slot(pno)?;
	let mut sec = load_mbr(f, geom)?;
	put_primary(&mut sec, z, MbrEntry::default());
	f.write_all_at(&sec, 0)?;
	f.sync_all()?;
	Ok(())
}

/// The only flag an MBR entry carries is the boot flag.
pub fn set_flag(f: &File, geom: &DiskGeometry, pno: u32, flag: u64, on: bool) -> CoreResult<()> {
	if flag != MBR_BOOT_FLAG as u64 {
		return Err(CoreError::BadArgument(format!(
			"invalid flag for BIOS/MBR: 0x{:016x}",
			flag
		)));
	}
	let z = primary_slot(pno)?;
	let mut sec = load_mbr(f, geom)?;
	let mut e = primary(&sec, z);
	if e.is_empty() {
		return Err(CoreError::NotFound(format!("partition {}", pno)));
	}
	if on {
		e.flags |= MBR_BOOT_FLAG;
	} else {
		e.flags &= !MBR_BOOT_FLAG;
	}
	put_primary(&mut sec, z, e);
	f.write_all_at(&sec, 0)?;
	f.sync_all()?;
	Ok(())
}

pub fn set_flags(f: &File, geom: &DiskGeometry, pno: u32, flags: u64) -> CoreResult<()> {
	if flags & !(MBR_BOOT_FLAG as u64) != 0 {
		return Err(CoreError::BadArgument(format!(
			"invalid flags for BIOS/MBR: 0x{:016x}",
			flags
		)));
	}
	set_flag(
		f,
		geom,
		pno,
		MBR_BOOT_FLAG as u64,
		flags & MBR_BOOT_FLAG as u64 != 0,
	)
}

pub fn set_code(f: &File, geom: &DiskGeometry, pno: u32, code: u16) -> CoreResult<()> {
	let mbrcode = ptypes::mbr_code_of(code)?;
	let z = primary_slot(pno)?;
	let mut sec = load_mbr(f, geom)?;
	let mut e = primary(&sec, z);
	if e.is_empty() {
		return Err(CoreError::NotFound(format!("partition {}", pno)));
	}
	e.ptype = mbrcode;
	put_primary(&mut sec, z, e);
	f.write_all_at(&sec, 0)?;
	f.sync_all()?;
	Ok(())
}

pub fn first_usable(_geom: &DiskGeometry) -> u64 {
	1
}

pub fn last_usable(geom: &DiskGeometry) -> u64 {
	if geom.lsec == 0 || geom.bytes == 0 {
		return 0;
	}
	geom.lbas() - 1
}

/// SHA-1 over the 440-byte code area, for change detection on the
/// BIOS boot code.
pub fn code_area_sha1(f: &File) -> CoreResult<[u8; 20]> {
	let mut code = [0u8; MBR_CODE_SIZE];
	f.read_exact_at(&mut code, 0)?;
	let mut h = Sha1::new();
	h.update(code);
	Ok(h.finalize().into())
}

pub fn code_area_zero_p(f: &File) -> CoreResult<bool> {
	let mut code = [0u8; MBR_CODE_SIZE];
	f.read_exact_at(&mut code, 0)?;
	Ok(code.iter().all(|&b| b == 0))
}

/// Install boot code into the code area, leaving the signature and
/// table alone.
pub fn write_boot_code(f: &File, code: &[u8]) -> CoreResult<()> {
	if code.len() > MBR_CODE_SIZE {
		return Err(CoreError::BadArgument(format!(
			"boot code of {} bytes exceeds the {}-byte code area",
			code.len(),
			MBR_CODE_SIZE
		)));
	}
	let mut area = [0u8; MBR_CODE_SIZE];
	area[..code.len()].copy_from_slice(code);
	f.write_all_at(&area, 0)?;
	f.sync_all()?;
	Ok(())
}
