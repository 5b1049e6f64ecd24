//! Partition-type registry.
//!
//! Every type carries a 16-bit common code (the `gdisk` convention), a
//! human name, the GPT type GUID (nil when the type has no GPT
//! identity), the MBR type byte (0 when the type has no MBR identity),
//! and a flag marking types that may be aggregated into RAID.
use uuid::{uuid, Uuid};

use crate::codec;
use crate::errors::{CoreError, CoreResult};

pub const PARTTYPE_ESP: u16 = 0xef00;
pub const PARTTYPE_LINUX: u16 = 0x8300;
pub const PARTTYPE_SWAP: u16 = 0x8200;
pub const PARTTYPE_MDRAID: u16 = 0xfd00;

#[derive(Clone, Copy, Debug)]
pub struct Ptype {
	pub code: u16,
	pub name: &'static str,
	pub gpt_guid: Uuid,
	pub mbr_code: u8,
	pub aggregable: bool,
}

const NIL: Uuid = Uuid::nil();

macro_rules! ptype {
	($code:expr, $name:expr, $guid:expr, $mbr:expr) => {
		Ptype {
			code: $code,
			name: $name,
			gpt_guid: $guid,
			mbr_code: $mbr,
			aggregable: false,
		}
	};
	($code:expr, $name:expr, $guid:expr, $mbr:expr, aggregable) => {
		Ptype {
			code: $code,
			name: $name,
			gpt_guid: $guid,
			mbr_code: $mbr,
			aggregable: true,
		}
	};
}

pub static PTYPES: &[Ptype] = &[
	ptype!(0x0005, "DOS extended", NIL, 0x05),
	ptype!(0x0006, "FAT16", NIL, 0x06),
	ptype!(0x0008, "AIX", NIL, 0x08),
	ptype!(0x0009, "AIX Bootable", NIL, 0x09),
	ptype!(0x000b, "FAT32", NIL, 0x0b),
	ptype!(0x000c, "FAT32 LBA", NIL, 0x0c),
	ptype!(0x000e, "FAT16 LBA", NIL, 0x0e),
	ptype!(0x0085, "Linux extended", NIL, 0x85),
	ptype!(0x00a6, "OpenBSD", NIL, 0xa6),
	ptype!(0x00ee, "MBR Protective", NIL, 0xee),
	ptype!(0x00ef, "EFI FAT", NIL, 0xef),
	ptype!(
		0x0700,
		"Microsoft basic data",
		uuid!("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7"),
		0
	),
	ptype!(
		0x0c01,
		"Microsoft reserved",
		uuid!("E3C9E316-0B5C-4DB8-817D-F92DF00215AE"),
		0
	),
	ptype!(
		0x2700,
		"Windows Recovery Environment",
		uuid!("DE94BBA4-06D1-4D40-A16A-BFD50179D6AC"),
		0
	),
	ptype!(
		0x4200,
		"Windows Logical Disk Manager data",
		uuid!("AF9B60A0-1431-4F62-BC68-3311714A69AD"),
		0
	),
	ptype!(
		0x4201,
		"Windows Logical Disk Manager metadata",
		uuid!("5808C8AA-7E8F-42E0-85D2-E1E90434CFB3"),
		0
	),
	ptype!(
		0x7501,
		"IBM General Parallel File System",
		uuid!("37AFFC90-EF7D-4E96-91C3-2D7AE055B174"),
		0
	),
	ptype!(
		0x7f00,
		"ChromeOS kernel",
		uuid!("FE3A2A5D-4F32-41A7-B725-ACCC3285A309"),
		0
	),
	ptype!(
		0x7f01,
		"ChromeOS root",
		uuid!("3CB8E202-3B7E-47DD-8A3C-7FF2A13CFCEC"),
		0
	),
	ptype!(
		0x7f02,
		"ChromeOS reserved",
		uuid!("2E0A753D-9E48-43B0-8337-B15192CB1B5E"),
		0
	),
	ptype!(
		PARTTYPE_SWAP,
		"Linux swap",
		uuid!("0657FD6D-A4AB-43C4-84E5-0933C84B4F4F"),
		0x82
	),
	ptype!(
		PARTTYPE_LINUX,
		"Linux filesystem",
		uuid!("0FC63DAF-8483-4772-8E79-3D69D8477DE4"),
		0x83
	),
	ptype!(
		0x8301,
		"Linux reserved",
		uuid!("8DA63339-0007-60C0-C436-083AC8230908"),
		0
	),
	ptype!(
		0x8e00,
		"Linux Logical Volume Manager",
		uuid!("E6D6D379-F507-44C2-A23C-238F2A3DF928"),
		0x8e
	),
	ptype!(
		0xa501,
		"FreeBSD boot",
		uuid!("83BD6B9D-7F41-11DC-BE0B-001560B84F0F"),
		0xa5
	),
	ptype!(
		0xa502,
		"FreeBSD swap",
		uuid!("516E7CB5-6ECF-11D6-8FF8-00022D09712B"),
		0xa5
	),
	ptype!(
		0xa503,
		"FreeBSD UFS",
		uuid!("516E7CB6-6ECF-11D6-8FF8-00022D09712B"),
		0xa5
	),
	ptype!(
		0xa504,
		"FreeBSD/Linux ZFS",
		uuid!("516E7CBA-6ECF-11D6-8FF8-00022D09712B"),
		0xa5,
		aggregable
	),
	ptype!(
		0xa505,
		"FreeBSD Vinum/RAID",
		uuid!("516E7CB8-6ECF-11D6-8FF8-00022D09712B"),
		0xa5,
		aggregable
	),
	ptype!(
		PARTTYPE_ESP,
		"EFI System Partition (ESP)",
		uuid!("C12A7328-F81F-11D2-BA4B-00A0C93EC93B"),
		0
	),
	ptype!(
		0xef01,
		"MBR partition scheme",
		uuid!("024DEE41-33E7-11D3-9D69-0008C781F39F"),
		0
	),
	ptype!(
		0xef02,
		"BIOS boot partition",
		uuid!("21686148-6449-6E6F-744E-656564454649"),
		0
	),
	ptype!(
		PARTTYPE_MDRAID,
		"Linux MDRAID",
		uuid!("A19D880F-05FC-4D3B-A006-743F0F84911E"),
		0xfd,
		aggregable
	),
	ptype!(
		0xa580,
		"Midnight BSD data",
		uuid!("85D5E45A-237C-11E1-B4B3-E89A8F7FC3A7"),
		0
	),
	ptype!(
		0xa581,
		"Midnight BSD boot",
		uuid!("85D5E45E-237C-11E1-B4B3-E89A8F7FC3A7"),
		0
	),
	ptype!(
		0xa582,
		"Midnight BSD swap",
		uuid!("85D5E45B-237C-11E1-B4B3-E89A8F7FC3A7"),
		0
	),
	ptype!(
		0xa583,
		"Midnight BSD UFS",
		uuid!("0394EF8B-237E-11E1-B4B3-E89A8F7FC3A7"),
		0
	),
	ptype!(
		0xa584,
		"Midnight BSD ZFS",
		uuid!("85D5E45D-237C-11E1-B4B3-E89A8F7FC3A7"),
		0,
		aggregable
	),
	ptype!(
		0xa585,
		"Midnight BSD Vinum/RAID",
		uuid!("85D5E45C-237C-11E1-B4B3-E89A8F7FC3A7"),
		0,
		aggregable
	),
	ptype!(
		0xa800,
		"Apple UFS",
		uuid!("55465300-0000-11AA-AA11-00306543ECAC"),
		0xa8
	),
	ptype!(
		0xa901,
		"NetBSD swap",
		uuid!("49F48D32-B10E-11DC-B99B-0019D1879648"),
		0xa9
	),
	ptype!(
		0xa902,
		"NetBSD FFS",
		uuid!("49F48D5A-B10E-11DC-B99B-0019D1879648"),
		0xa9
	),
	ptype!(
		0xa903,
		"NetBSD LFS",
		uuid!("49F48D82-B10E-11DC-B99B-0019D1879648"),
		0xa9
	),
	ptype!(
		0xa904,
		"NetBSD concatenated",
		uuid!("2DB519C4-B10F-11DC-B99B-0019D1879648"),
		0xa9
	),
	ptype!(
		0xa905,
		"NetBSD encrypted filesystem",
		uuid!("2DB519EC-B10F-11DC-B99B-0019D1879648"),
		0xa9
	),
	ptype!(
		0xa906,
		"NetBSD RAID",
		uuid!("49F48DAA-B10E-11DC-B99B-0019D1879648"),
		0xa9,
		aggregable
	),
	ptype!(
		0xab00,
		"Apple boot",
		uuid!("426F6F74-0000-11AA-AA11-00306543ECAC"),
		0xab
	),
	ptype!(
		0xaf00,
		"Apple HFS/HFS+",
		uuid!("48465300-0000-11AA-AA11-00306543ECAC"),
		0
	),
	ptype!(
		0xaf01,
		"Apple RAID",
		uuid!("52414944-0000-11AA-AA11-00306543ECAC"),
		0,
		aggregable
	),
	ptype!(
		0xaf02,
		"Apple RAID offline",
		uuid!("52414944-5F4F-11AA-AA11-00306543ECAC"),
		0,
		aggregable
	),
	ptype!(
		0xaf03,
		"Apple label",
		uuid!("4C616265-6C00-11AA-AA11-00306543ECAC"),
		0
	),
	ptype!(
		0xaf04,
		"AppleTV recovery",
		uuid!("5265636F-7665-11AA-AA11-00306543ECAC"),
		0
	),
	ptype!(
		0xaf05,
		"Apple Core Storage",
		uuid!("53746F72-6167-11AA-AA11-00306543ECAC"),
		0
	),
	ptype!(
		0xbe00,
		"Solaris boot",
		uuid!("6A82CB45-1DD2-11B2-99A6-080020736631"),
		0xbe
	),
	ptype!(
		0xbf00,
		"Solaris root",
		uuid!("6A85CF4D-1DD2-11B2-99A6-080020736631"),
		0xbf
	),
	ptype!(
		0xbf01,
		"Solaris /usr, Mac OS X ZFS",
		uuid!("6A898CC3-1DD2-11B2-99A6-080020736631"),
		0xbf,
		aggregable
	),
	ptype!(
		0xbf02,
		"Solaris swap",
		uuid!("6A87C46F-1DD2-11B2-99A6-080020736631"),
		0xbf
	),
	ptype!(
		0xbf03,
		"Solaris backup",
		uuid!("6A8B642B-1DD2-11B2-99A6-080020736631"),
		0xbf
	),
	ptype!(
		0xbf04,
		"Solaris /var",
		uuid!("6A8EF2E9-1DD2-11B2-99A6-080020736631"),
		0xbf
	),
	ptype!(
		0xbf05,
		"Solaris /home",
		uuid!("6A90BA39-1DD2-11B2-99A6-080020736631"),
		0xbf
	),
	ptype!(
		0xc001,
		"HP/UX data",
		uuid!("75894C1E-3AEB-11D3-B7C1-7B03A0000000"),
		0
	),
	ptype!(
		0xc002,
		"HP/UX service partition",
		uuid!("E2A1E728-32E3-11D6-A682-7B03A0000000"),
		0
	),
];

pub fn lookup(code: u16) -> Option<&'static Ptype> {
	PTYPES.iter().find(|pt| pt.code == code)
}

/// GPT type GUID for a common code. Fails when the type has no GPT
/// identity.
pub fn gpt_guid_of(code: u16) -> CoreResult<Uuid> {
	match lookup(code) {
		Some(pt) if !pt.gpt_guid.is_nil() => Ok(pt.gpt_guid),
		_ => Err(CoreError::CodeUnsupported(code as u32)),
	}
}

/// MBR type byte for a common code. Fails when the type has no MBR
/// identity.
pub fn mbr_code_of(code: u16) -> CoreResult<u8> {
	match lookup(code) {
		Some(pt) if pt.mbr_code != 0 => Ok(pt.mbr_code),
		_ => Err(CoreError::CodeUnsupported(code as u32)),
	}
}

pub fn lookup_by_guid(guid: &Uuid) -> Option<&'static Ptype> {
	if guid.is_nil() {
		return None;
	}
	PTYPES.iter().find(|pt| pt.gpt_guid == *guid)
}

pub fn lookup_by_mbr_code(mbr: u8) -> Option<&'static Ptype> {
	if mbr == 0 {
		return None;
	}
	PTYPES.iter().find(|pt| pt.mbr_code == mbr)
}

/// Whether a common code can be expressed at all under the given table
/// kind.
pub fn supported(pttype: &str, pt: &Ptype) -> bool {
	match pttype {
		"gpt" => !pt.gpt_guid.is_nil(),
		"dos" => pt.mbr_code != 0,
		// MD partitioning carries no type identifiers of its own.
		"mdp" => false,
		_ => false,
	}
}

/// Parse a user-supplied partition type: a common code in hex, a bare
/// MBR type byte, or a formatted GUID.
pub fn parse_code(s: &str) -> CoreResult<u16> {
	let s = s.trim();
	if let Ok(guid) = codec::guid_parse(s) {
		if let Some(pt) = lookup_by_guid(&guid) {
			return Ok(pt.code);
		}
		return Err(CoreError::BadArgument(format!("unknown type GUID {}", s)));
	}
	let hex = s.strip_prefix("0x").unwrap_or(s);
	let n = u32::from_str_radix(hex, 16)
		.map_err(|_| CoreError::BadArgument(format!("not a partition type: {}", s)))?;
	if n <= u16::MAX as u32 {
		if let Some(pt) = lookup(n as u16) {
			return Ok(pt.code);
		}
	}
	if n <= 0xff {
		if let Some(pt) = lookup_by_mbr_code(n as u8) {
			return Ok(pt.code);
		}
	}
	Err(CoreError::BadArgument(format!(
		"not a partition type: {}",
		s
	)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_lookup_linux() {
		let pt = lookup(PARTTYPE_LINUX).unwrap();
		assert_eq!(pt.name, "Linux filesystem");
		assert_eq!(pt.mbr_code, 0x83);
		assert_eq!(
			gpt_guid_of(PARTTYPE_LINUX).unwrap(),
			uuid::uuid!("0FC63DAF-8483-4772-8E79-3D69D8477DE4")
		);
	}

	#[test]
	fn test_gpt_only_and_mbr_only() {
		// ESP has no MBR byte, DOS extended no GPT GUID.
		assert!(mbr_code_of(PARTTYPE_ESP).is_err());
		assert!(gpt_guid_of(0x0005).is_err());
		assert_eq!(mbr_code_of(0x0005).unwrap(), 0x05);
	}

	#[test]
	fn test_supported() {
		let linux = lookup(PARTTYPE_LINUX).unwrap();
		let esp = lookup(PARTTYPE_ESP).unwrap();
		let ext = lookup(0x0005).unwrap();
		assert!(supported("gpt", linux));
		assert!(supported("dos", linux));
		assert!(supported("gpt", esp));
		assert!(!supported("dos", esp));
		assert!(!supported("gpt", ext));
		assert!(!supported("mdp", linux));
		assert!(!supported("apm", linux));
	}

	#[test]
	fn test_parse_code() {
		assert_eq!(parse_code("0x8300").unwrap(), PARTTYPE_LINUX);
		assert_eq!(parse_code("8300").unwrap(), PARTTYPE_LINUX);
		// A bare MBR byte resolves through the MBR column.
		assert_eq!(parse_code("0x83").unwrap(), PARTTYPE_LINUX);
		assert_eq!(
			parse_code("C12A7328-F81F-11D2-BA4B-00A0C93EC93B").unwrap(),
			PARTTYPE_ESP
		);
		assert!(parse_code("zzzz").is_err());
	}

	#[test]
	fn test_aggregable_flags() {
		assert!(lookup(PARTTYPE_MDRAID).unwrap().aggregable);
		assert!(!lookup(PARTTYPE_LINUX).unwrap().aggregable);
	}
}
