//! Byte-level codecs shared by the partition-table engines: CRC-32,
//! GUIDs in their on-disk form, and UTF-16LE partition names.
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};

/// ISO 3309 / IEEE 802.3 reflected CRC-32: polynomial 0xEDB88320,
/// initial value 0xFFFFFFFF, final XOR 0xFFFFFFFF. This is what the UEFI
/// specification demands for both GPT header and entry-array checksums.
pub fn crc32(data: &[u8]) -> u32 {
	const TABLE: [u32; 256] = build_crc_table();
	let mut crc = 0xffff_ffffu32;
	for &b in data {
		crc = (crc >> 8) ^ TABLE[((crc ^ b as u32) & 0xff) as usize];
	}
	crc ^ 0xffff_ffff
}

const fn build_crc_table() -> [u32; 256] {
	let mut table = [0u32; 256];
	let mut n = 0;
	while n < 256 {
		let mut c = n as u32;
		let mut k = 0;
		while k < 8 {
			c = if c & 1 != 0 { 0xedb8_8320 ^ (c >> 1) } else { c >> 1 };
			k += 1;
		}
		table[n] = c;
		n += 1;
	}
	table
}

// GUIDs are stored on disk in Microsoft mixed-endian form: the first
// three fields little-endian, the last two big-endian.
// e.g. 01020304-0506-0708-090A-0B0C0D0E0F10 must be written as:
//            LE       LE    LE
//       vvvvvvvvvvv vvvvv vvvvv
// 0000: 04 03 02 01 06 05 08 07
// 0008: 09 0A 0B 0C 0D 0E 0F 10
//       ^^^^^^^^^^^^^^^^^^^^^^^
//              Big Endian
// Uuid::to_bytes_le() produces exactly that byte array.
pub fn guid_to_disk(u: &Uuid) -> [u8; 16] {
	u.to_bytes_le()
}

pub fn guid_from_disk(b: &[u8; 16]) -> Uuid {
	Uuid::from_bytes_le(*b)
}

/// Uppercase hyphenated form, as partitioning tools print GUIDs.
pub fn guid_format(u: &Uuid) -> String {
	u.hyphenated().to_string().to_uppercase()
}

pub fn guid_parse(s: &str) -> CoreResult<Uuid> {
	Uuid::parse_str(s.trim()).map_err(|_| CoreError::BadArgument(format!("not a GUID: {}", s)))
}

/// Encode a name as little-endian UTF-16 code units, truncated to
/// `units` and padded with U+0000. A name of exactly `units` units is
/// stored without an in-slot terminator.
pub fn utf16le_encode(name: &str, units: usize) -> Vec<u8> {
	let mut out = vec![0u8; units * 2];
	for (z, unit) in name.encode_utf16().take(units).enumerate() {
		out[z * 2..z * 2 + 2].copy_from_slice(&unit.to_le_bytes());
	}
	out
}

/// Decode a padded UTF-16LE name field, stopping at the first NUL.
pub fn utf16le_decode(raw: &[u8]) -> String {
	let units: Vec<u16> = raw
		.chunks_exact(2)
		.map(|c| u16::from_le_bytes([c[0], c[1]]))
		.take_while(|&u| u != 0)
		.collect();
	String::from_utf16_lossy(&units)
}

/// Fill a 16-byte GUID from the kernel CSPRNG. GRND_NONBLOCK: an
/// entropy-starved pool is reported rather than waited on.
pub fn random_guid() -> CoreResult<[u8; 16]> {
	let mut buf = [0u8; 16];
	let r = unsafe {
		libc::getrandom(
			buf.as_mut_ptr() as *mut libc::c_void,
			buf.len(),
			libc::GRND_NONBLOCK,
		)
	};
	if r != buf.len() as isize {
		return Err(CoreError::RngExhausted);
	}
	Ok(buf)
}

#[cfg(test)]
mod tests {
	use super::*;
	use uuid::uuid;

	#[test]
	fn test_crc32_vectors() {
		// The canonical check value for this CRC.
		assert_eq!(crc32(b"123456789"), 0xcbf43926);
		assert_eq!(crc32(b""), 0);
		assert_eq!(crc32(&[0u8; 4]), 0x2144df1c);
	}

	#[test]
	fn test_guid_mixed_endian() {
		let u = uuid!("01020304-0506-0708-090A-0B0C0D0E0F10");
		let disk = guid_to_disk(&u);
		assert_eq!(
			disk,
			[
				0x04, 0x03, 0x02, 0x01, 0x06, 0x05, 0x08, 0x07, 0x09, 0x0a, 0x0b,
				0x0c, 0x0d, 0x0e, 0x0f, 0x10
			]
		);
		assert_eq!(guid_from_disk(&disk), u);
	}

	#[test]
	fn test_guid_format_roundtrip() {
		let u = uuid!("0FC63DAF-8483-4772-8E79-3D69D8477DE4");
		let s = guid_format(&u);
		assert_eq!(s, "0FC63DAF-8483-4772-8E79-3D69D8477DE4");
		assert_eq!(guid_parse(&s).unwrap(), u);
		assert!(guid_parse("certainly-not-a-guid").is_err());
	}

	#[test]
	fn test_utf16le_pad_and_truncate() {
		let enc = utf16le_encode("EFI", 36);
		assert_eq!(enc.len(), 72);
		assert_eq!(&enc[0..6], &[b'E', 0, b'F', 0, b'I', 0]);
		assert!(enc[6..].iter().all(|&b| b == 0));
		assert_eq!(utf16le_decode(&enc), "EFI");

		// 40 units in, 36 units stored, no in-slot terminator.
		let long: String = std::iter::repeat('x').take(40).collect();
		let enc = utf16le_encode(&long, 36);
		assert_eq!(enc.len(), 72);
		assert!(enc.chunks_exact(2).all(|c| c != [0, 0]));
		assert_eq!(utf16le_decode(&enc).chars().count(), 36);
	}

	#[test]
	fn test_random_guid() {
		let a = random_guid().unwrap();
		let b = random_guid().unwrap();
		assert_ne!(a, b);
	}
}
