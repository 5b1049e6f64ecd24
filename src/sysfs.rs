//! sysfs attribute readers: one ASCII value per file, trailing
//! newline.
use std::fs;
use std::io;
use std::path::Path;

pub const SYSFS_BLOCK: &str = "/sys/block";

pub fn get_string(dir: &Path, node: &str) -> io::Result<String> {
	let raw = fs::read_to_string(dir.join(node))?;
	Ok(raw.trim_end_matches('\n').trim().to_owned())
}

/// Missing attribute or unparsable content both surface as None; sysfs
/// trees are full of optional nodes.
pub fn get_string_opt(dir: &Path, node: &str) -> Option<String> {
	get_string(dir, node).ok().filter(|s| !s.is_empty())
}

pub fn get_uint(dir: &Path, node: &str) -> io::Result<u64> {
	let s = get_string(dir, node)?;
	s.parse()
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {:?}", node, s)))
}

pub fn get_bool(dir: &Path, node: &str) -> io::Result<bool> {
	Ok(get_string(dir, node)? != "0")
}

pub fn exists(dir: &Path, node: &str) -> bool {
	dir.join(node).exists()
}

/// Parse a "major:minor" dev node.
pub fn devno(dir: &Path) -> io::Result<(u32, u32)> {
	let s = get_string(dir, "dev")?;
	let (maj, min) = s
		.split_once(':')
		.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("dev: {:?}", s)))?;
	let maj = maj
		.parse()
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("dev: {:?}", s)))?;
	let min = min
		.parse()
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("dev: {:?}", s)))?;
	Ok((maj, min))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs::File;
	use std::io::Write;

	fn scratch_dir(name: &str) -> std::path::PathBuf {
		let dir = std::env::temp_dir().join(format!("diskforge-sysfs-{}-{}", name, std::process::id()));
		let _ = fs::remove_dir_all(&dir);
		fs::create_dir_all(&dir).unwrap();
		dir
	}

	#[test]
	fn test_readers() {
		let dir = scratch_dir("readers");
		let mut f = File::create(dir.join("size")).unwrap();
		writeln!(f, "4194304").unwrap();
		let mut f = File::create(dir.join("model")).unwrap();
		writeln!(f, "Samsung SSD 970").unwrap();
		let mut f = File::create(dir.join("removable")).unwrap();
		writeln!(f, "0").unwrap();
		let mut f = File::create(dir.join("dev")).unwrap();
		writeln!(f, "259:0").unwrap();

		assert_eq!(get_uint(&dir, "size").unwrap(), 4194304);
		assert_eq!(get_string(&dir, "model").unwrap(), "Samsung SSD 970");
		assert!(!get_bool(&dir, "removable").unwrap());
		assert_eq!(devno(&dir).unwrap(), (259, 0));
		assert!(exists(&dir, "size"));
		assert!(!exists(&dir, "queue"));
		assert!(get_string_opt(&dir, "missing").is_none());
		fs::remove_dir_all(dir).unwrap();
	}
}
