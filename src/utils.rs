use std::{
	ffi::{c_int, CString},
	fs::File,
	io::{Seek, Write},
	path::Path,
};

use anyhow::{anyhow, Context, Result};
use libc::{close, open, O_NONBLOCK, O_RDONLY};
use log::debug;

#[link(name = "c")]
extern "C" {
	pub fn geteuid() -> c_int;
	pub fn syncfs(fd: c_int) -> c_int;
}

/// Create a sparse file with specified size in bytes.
pub fn get_sparse_file<P: AsRef<Path>>(path: P, size: u64) -> Result<File> {
	let img_path = path.as_ref();
	let parent = img_path.parent().unwrap_or(Path::new("/"));
	if !parent.exists() {
		return Err(anyhow!(
			"One or more of the parent directories does not exist"
		));
	}
	debug!(
		"Creating sparse file at '{}' with size {} bytes ...",
		&img_path.display(),
		size
	);
	let mut img_file = File::create_new(img_path).context(format!(
		"Error creating scratch file '{}'",
		&img_path.display()
	))?;
	// Seek to the desired size
	img_file.seek(std::io::SeekFrom::Start(size - 1))?;
	// Write zero at the end of file to punch a hole
	img_file.write_all(&[0]).context(
		"Failed to punch hole for sparse file. Does your filesystem support sparse files?",
	)?;
	img_file.sync_all()?;
	Ok(img_file)
}

pub fn create_sparse_file<P: AsRef<Path>>(path: P, size: u64) -> Result<()> {
	get_sparse_file(path, size)?;
	Ok(())
}

/// Strip leading "/dev/"s, "../"s and "./"s. What's left must be an
/// entry in /sys/block.
pub fn short_name(name: &str) -> &str {
	let mut name = name;
	loop {
		let stripped = name
			.strip_prefix("dev/")
			.or_else(|| name.strip_prefix("../"))
			.or_else(|| name.strip_prefix("./"))
			.or_else(|| name.strip_prefix('/'));
		match stripped {
			Some(s) => name = s,
			None => return name,
		}
	}
}

/// Sync the filesystem behind the path.
pub fn sync_filesystem(path: &dyn AsRef<Path>) -> Result<()> {
	let tgt_path = path.as_ref();
	let path = CString::new(tgt_path.as_os_str().as_encoded_bytes())?;
	let path_ptr = path.as_ptr();

	let fd = unsafe { open(path_ptr, O_RDONLY | O_NONBLOCK) };
	if fd < 0 {
		let errno = errno::errno();
		return Err(anyhow!(
			"Failed to open path {}: {}",
			&tgt_path.display(),
			errno
		));
	}
	debug!("open(\"{}\") returned fd {}", &tgt_path.display(), fd);
	let result = unsafe { syncfs(fd) };
	debug!("syncfs({}) returned {}", fd, result);
	if result != 0 {
		let close = unsafe { close(fd) };
		if close != 0 {
			panic!("Failed to close fd {}: {}", fd, errno::errno());
		}
		let errno = errno::errno();
		return Err(anyhow!(
			"Failed to sync filesystem {}: {}",
			tgt_path.display(),
			errno
		));
	}
	let close = unsafe { close(fd) };
	if close != 0 {
		panic!("Failed to close fd {}: {}", fd, errno::errno());
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_short_name() {
		assert_eq!(short_name("/dev/sda"), "sda");
		assert_eq!(short_name("../../dev/md0"), "md0");
		assert_eq!(short_name("./nvme0n1p2"), "nvme0n1p2");
		assert_eq!(short_name("sdb1"), "sdb1");
	}

	#[test]
	fn test_sparse_file() {
		let path = std::env::temp_dir()
			.join(format!("diskforge-sparse-{}", std::process::id()));
		let _ = std::fs::remove_file(&path);
		create_sparse_file(&path, 1 << 20).unwrap();
		let md = std::fs::metadata(&path).unwrap();
		assert_eq!(md.len(), 1 << 20);
		std::fs::remove_file(path).unwrap();
	}
}
