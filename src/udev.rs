//! Kernel hotplug intake: a thread on the NETLINK_KOBJECT_UEVENT
//! socket funneling block-device events into the graph's rescan.
use std::io;
use std::mem;
use std::sync::Arc;
use std::thread;

use log::{debug, warn};

use crate::context::DeviceGraph;
use crate::diag::diag;
use crate::utils;

const UEVENT_BUF: usize = 8192;
// Broadcast group 1 carries the kernel's uevents.
const UEVENT_GROUP: u32 = 1;

/// One uevent datagram: "action@devpath" followed by NUL-separated
/// KEY=VALUE pairs.
#[derive(Debug, PartialEq, Eq)]
pub struct Uevent {
	pub action: String,
	pub subsystem: Option<String>,
	pub devname: Option<String>,
}

pub fn parse_uevent(buf: &[u8]) -> Option<Uevent> {
	let mut fields = buf.split(|&b| b == 0);
	let header = std::str::from_utf8(fields.next()?).ok()?;
	let (action, _devpath) = header.split_once('@')?;
	let mut subsystem = None;
	let mut devname = None;
	for field in fields {
		let Ok(field) = std::str::from_utf8(field) else {
			continue;
		};
		if let Some(v) = field.strip_prefix("SUBSYSTEM=") {
			subsystem = Some(v.to_owned());
		} else if let Some(v) = field.strip_prefix("DEVNAME=") {
			devname = Some(v.to_owned());
		}
	}
	Some(Uevent {
		action: action.to_owned(),
		subsystem,
		devname,
	})
}

fn open_monitor() -> io::Result<i32> {
	let fd = unsafe {
		libc::socket(
			libc::AF_NETLINK,
			libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
			libc::NETLINK_KOBJECT_UEVENT,
		)
	};
	if fd < 0 {
		return Err(io::Error::last_os_error());
	}
	let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
	addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
	addr.nl_groups = UEVENT_GROUP;
	let r = unsafe {
		libc::bind(
			fd,
			&addr as *const libc::sockaddr_nl as *const libc::sockaddr,
			mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
		)
	};
	if r != 0 {
		let e = io::Error::last_os_error();
		unsafe { libc::close(fd) };
		return Err(e);
	}
	Ok(fd)
}

/// Start the reader thread. Events for the block subsystem trigger a
/// single-device rescan; everything else is ignored.
pub fn spawn_monitor(graph: Arc<DeviceGraph>) -> io::Result<thread::JoinHandle<()>> {
	let fd = open_monitor()?;
	Ok(thread::Builder::new()
		.name("uevent".to_owned())
		.spawn(move || {
			let mut buf = [0u8; UEVENT_BUF];
			loop {
				let n = unsafe {
					libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
				};
				if n < 0 {
					let e = io::Error::last_os_error();
					if e.kind() == io::ErrorKind::Interrupted {
						continue;
					}
					warn!("uevent receive failed ({}), stopping monitor", e);
					break;
				}
				let Some(ev) = parse_uevent(&buf[..n as usize]) else {
					continue;
				};
				if ev.subsystem.as_deref() != Some("block") {
					continue;
				}
				let Some(devname) = ev.devname else {
					continue;
				};
				let name = utils::short_name(&devname).to_owned();
				debug!("uevent: {} {}", ev.action, name);
				graph.with(|g| {
					if let Err(e) = g.rescan(&name) {
						diag!("Couldn't rescan {} ({})", name, e);
					}
				});
			}
			unsafe { libc::close(fd) };
		})?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_uevent() {
		let msg = b"add@/devices/pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0/block/sda/sda1\0ACTION=add\0DEVPATH=/block/sda/sda1\0SUBSYSTEM=block\0DEVNAME=sda1\0DEVTYPE=partition\0SEQNUM=4711\0";
		let ev = parse_uevent(msg).unwrap();
		assert_eq!(ev.action, "add");
		assert_eq!(ev.subsystem.as_deref(), Some("block"));
		assert_eq!(ev.devname.as_deref(), Some("sda1"));
	}

	#[test]
	fn test_parse_garbage() {
		assert!(parse_uevent(b"not a uevent").is_none());
		assert!(parse_uevent(b"").is_none());
	}
}
