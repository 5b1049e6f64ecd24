//! Partition-table dispatch.
//!
//! One [`Ptable`] implementation per table kind, selected by the kind
//! string carried on the device record. Operations a format cannot
//! express default to `Unsupported` so every engine exposes the same
//! uniform surface.
use std::fs::File;

use uuid::Uuid;

use crate::apm;
use crate::errors::{CoreError, CoreResult};
use crate::gpt::{self, DiskGeometry};
use crate::msdos;

/// Outcome of an `add`: which slot was taken and where the partition
/// ended up after alignment.
pub struct Added {
	pub pno: u32,
	pub first: u64,
	pub last: u64,
}

pub trait Ptable: Sync {
	fn name(&self) -> &'static str;
	fn desc(&self) -> &'static str;
	/// Whether this kind can be created from scratch here.
	fn creatable(&self) -> bool {
		true
	}

	fn make(&self, f: &File, geom: &DiskGeometry) -> CoreResult<()>;
	fn zap(&self, f: &File, geom: &DiskGeometry) -> CoreResult<()>;

	fn add(
		&self,
		_f: &File,
		_geom: &DiskGeometry,
		_name: Option<&str>,
		_fsec: u64,
		_lsec: u64,
		_code: u16,
	) -> CoreResult<Added> {
		Err(CoreError::Unsupported("partition creation"))
	}

	fn del(&self, _f: &File, _geom: &DiskGeometry, _pno: u32) -> CoreResult<()> {
		Err(CoreError::Unsupported("partition deletion"))
	}

	fn set_name(&self, _f: &File, _geom: &DiskGeometry, _pno: u32, _name: &str) -> CoreResult<()> {
		Err(CoreError::Unsupported("partition names"))
	}

	fn set_uuid(&self, _f: &File, _geom: &DiskGeometry, _pno: u32, _uuid: &Uuid) -> CoreResult<()> {
		Err(CoreError::Unsupported("partition UUIDs"))
	}

	fn set_flags(&self, _f: &File, _geom: &DiskGeometry, _pno: u32, _flags: u64) -> CoreResult<()> {
		Err(CoreError::Unsupported("partition flags"))
	}

	fn set_flag(
		&self,
		_f: &File,
		_geom: &DiskGeometry,
		_pno: u32,
		_flag: u64,
		_on: bool,
	) -> CoreResult<()> {
		Err(CoreError::Unsupported("partition flags"))
	}

	fn set_code(&self, _f: &File, _geom: &DiskGeometry, _pno: u32, _code: u16) -> CoreResult<()> {
		Err(CoreError::Unsupported("partition type codes"))
	}

	fn first_usable(&self, f: &File, geom: &DiskGeometry) -> CoreResult<u64>;
	fn last_usable(&self, f: &File, geom: &DiskGeometry) -> CoreResult<u64>;
}

struct Gpt;

impl Ptable for Gpt {
	fn name(&self) -> &'static str {
		"gpt"
	}
	fn desc(&self) -> &'static str {
		"GUID Partition Table"
	}
	fn make(&self, f: &File, geom: &DiskGeometry) -> CoreResult<()> {
		gpt::create(f, geom)
	}
	fn zap(&self, f: &File, geom: &DiskGeometry) -> CoreResult<()> {
		gpt::zap(f, geom)
	}
	fn add(
		&self,
		f: &File,
		geom: &DiskGeometry,
		name: Option<&str>,
		fsec: u64,
		lsec: u64,
		code: u16,
	) -> CoreResult<Added> {
		let a = gpt::add(f, geom, name, fsec, lsec, code)?;
		Ok(Added {
			pno: a.pno,
			first: a.first,
			last: a.last,
		})
	}
	fn del(&self, f: &File, geom: &DiskGeometry, pno: u32) -> CoreResult<()> {
		gpt::delete(f, geom, pno)
	}
	fn set_name(&self, f: &File, geom: &DiskGeometry, pno: u32, name: &str) -> CoreResult<()> {
		gpt::set_name(f, geom, pno, name)
	}
	fn set_uuid(&self, f: &File, geom: &DiskGeometry, pno: u32, uuid: &Uuid) -> CoreResult<()> {
		gpt::set_uuid(f, geom, pno, uuid)
	}
	fn set_flags(&self, f: &File, geom: &DiskGeometry, pno: u32, flags: u64) -> CoreResult<()> {
		gpt::set_flags(f, geom, pno, flags)
	}
	fn set_flag(
		&self,
		f: &File,
		geom: &DiskGeometry,
		pno: u32,
		flag: u64,
		on: bool,
	) -> CoreResult<()> {
		gpt::set_flag(f, geom, pno, flag, on)
	}
	fn set_code(&self, f: &File, geom: &DiskGeometry, pno: u32, code: u16) -> CoreResult<()> {
		gpt::set_code(f, geom, pno, code)
	}
	fn first_usable(&self, f: &File, geom: &DiskGeometry) -> CoreResult<u64> {
		gpt::first_usable(f, geom)
	}
	fn last_usable(&self, f: &File, geom: &DiskGeometry) -> CoreResult<u64> {
		gpt::last_usable(f, geom)
	}
}

struct Dos;

impl Ptable for Dos {
	fn name(&self) -> &'static str {
		"dos"
	}
	fn desc(&self) -> &'static str {
		"IBMPC (DOS) / Master Boot Record"
	}
	fn make(&self, f: &File, geom: &DiskGeometry) -> CoreResult<()> {
		msdos::create(f, geom)
	}
	fn zap(&self, f: &File, geom: &DiskGeometry) -> CoreResult<()> {
		msdos::zap(f, geom)
	}
	fn add(
		&self,
		f: &File,
		geom: &DiskGeometry,
		name: Option<&str>,
		fsec: u64,
		lsec: u64,
		code: u16,
	) -> CoreResult<Added> {
		let a = msdos::add(f, geom, name, fsec, lsec, code)?;
		Ok(Added {
			pno: a.pno,
			first: a.first,
			last: a.last,
		})
	}
	fn del(&self, f: &File, geom: &DiskGeometry, pno: u32) -> CoreResult<()> {
		msdos::delete(f, geom, pno)
	}
	fn set_flags(&self, f: &File, geom: &DiskGeometry, pno: u32, flags: u64) -> CoreResult<()> {
		msdos::set_flags(f, geom, pno, flags)
	}
	fn set_flag(
		&self,
		f: &File,
		geom: &DiskGeometry,
		pno: u32,
		flag: u64,
		on: bool,
	) -> CoreResult<()> {
		msdos::set_flag(f, geom, pno, flag, on)
	}
	fn set_code(&self, f: &File, geom: &DiskGeometry, pno: u32, code: u16) -> CoreResult<()> {
		msdos::set_code(f, geom, pno, code)
	}
	fn first_usable(&self, _f: &File, geom: &DiskGeometry) -> CoreResult<u64> {
		Ok(msdos::first_usable(geom))
	}
	fn last_usable(&self, _f: &File, geom: &DiskGeometry) -> CoreResult<u64> {
		Ok(msdos::last_usable(geom))
	}
}

struct Apm;

impl Ptable for Apm {
	fn name(&self) -> &'static str {
		"apm"
	}
	fn desc(&self) -> &'static str {
		"Apple Partition Map"
	}
	fn make(&self, f: &File, geom: &DiskGeometry) -> CoreResult<()> {
		apm::create(f, geom)
	}
	fn zap(&self, f: &File, geom: &DiskGeometry) -> CoreResult<()> {
		apm::zap(f, geom)
	}
	fn first_usable(&self, f: &File, geom: &DiskGeometry) -> CoreResult<u64> {
		apm::first_usable(f, geom)
	}
	fn last_usable(&self, _f: &File, geom: &DiskGeometry) -> CoreResult<u64> {
		Ok(apm::last_usable(geom))
	}
}

struct Mdp;

impl Ptable for Mdp {
	fn name(&self) -> &'static str {
		"mdp"
	}
	fn desc(&self) -> &'static str {
		"Linux MD partitioning"
	}
	fn creatable(&self) -> bool {
		false
	}
	fn make(&self, _f: &File, _geom: &DiskGeometry) -> CoreResult<()> {
		Err(CoreError::Unsupported("creating MD partition tables"))
	}
	fn zap(&self, _f: &File, _geom: &DiskGeometry) -> CoreResult<()> {
		Err(CoreError::Unsupported("zapping MD partition tables"))
	}
	fn first_usable(&self, _f: &File, _geom: &DiskGeometry) -> CoreResult<u64> {
		Err(CoreError::Unsupported("MD partition tables"))
	}
	fn last_usable(&self, _f: &File, _geom: &DiskGeometry) -> CoreResult<u64> {
		Err(CoreError::Unsupported("MD partition tables"))
	}
}

static PTABLES: &[&(dyn Ptable)] = &[&Gpt, &Dos, &Apm, &Mdp];

pub fn table_by_name(kind: &str) -> CoreResult<&'static dyn Ptable> {
	PTABLES
		.iter()
		.find(|pt| pt.name() == kind)
		.copied()
		.ok_or_else(|| CoreError::BadArgument(format!("unsupported partition table: {}", kind)))
}

/// Only the kinds we can create, for listing to the user.
pub fn creatable_kinds() -> Vec<(&'static str, &'static str)> {
	PTABLES
		.iter()
		.filter(|pt| pt.creatable())
		.map(|pt| (pt.name(), pt.desc()))
		.collect()
}
