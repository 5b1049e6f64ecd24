//! Swap registry: ingests the kernel swap table and sequences
//! mkswap/swapon/swapoff through the subprocess surface.
use std::fs;
use std::path::Path;
use std::process::Command;

use crate::context::GraphState;
use crate::device::SwapPrio;
use crate::diag::diag;
use crate::errors::{CoreError, CoreResult};
use crate::exec;
use crate::utils;

const SWAP_LABEL: &str = "DiskforgeSwap";

/// Ingest the swap table (normally /proc/swaps): a legend line, then
/// one row per area: path, "file" | "partition", kilobytes, used,
/// priority.
pub fn parse_swaps(g: &mut GraphState, table: &Path) -> CoreResult<()> {
	let content = fs::read_to_string(table)?;
	for line in content.lines().skip(1) {
		let mut it = line.split_whitespace();
		let (Some(path), Some(kind), Some(kb), _used, prio) =
			(it.next(), it.next(), it.next(), it.next(), it.next())
		else {
			diag!("Couldn't extract swap info from {}", line);
			continue;
		};
		if kind == "file" {
			continue;
		}
		let Some(idx) = g.lookup(utils::short_name(path)) else {
			diag!("Unknown swap device {}", path);
			continue;
		};
		let kb: u64 = kb.parse().map_err(|_| {
			CoreError::BadArgument(format!("bad swap size in {}", line))
		})?;
		let d = g.device_mut(idx).unwrap();
		d.mnt.bytes = kb * 1024;
		if d.swapprio == SwapPrio::INVALID {
			if d.mnttype.as_deref() != Some("swap") {
				if let Some(old) = &d.mnttype {
					diag!("Warning: {} went from {} to swap", d.name, old);
				}
				d.mnttype = Some("swap".to_owned());
			}
			// Negative kernel priorities collapse to the highest
			// representable one.
			let prio: i32 = prio.and_then(|p| p.parse().ok()).unwrap_or(0);
			d.swapprio = SwapPrio(prio.clamp(0, 65535));
		}
	}
	Ok(())
}

/// Write a swap signature. Refused when a non-swap filesystem is
/// present or the device is already swapping.
pub fn mkswap(g: &GraphState, name: &str) -> CoreResult<()> {
	let idx = g.lookup_device(name)?;
	let d = g.device(idx).unwrap();
	if let Some(fs) = &d.mnttype {
		if fs != "swap" {
			return Err(CoreError::BadArgument(format!(
				"won't create swap on {} filesystem at {}",
				fs, name
			)));
		}
	}
	if d.swapprio.active() {
		return Err(CoreError::BusySwap(name.to_owned()));
	}
	let mut cmd = Command::new("mkswap");
	cmd.arg("-L").arg(SWAP_LABEL).arg(g.dev_node(name));
	exec::drain(&mut cmd)
}

/// Create swap on the device, and use it.
pub fn swapon_dev(g: &mut GraphState, name: &str) -> CoreResult<()> {
	mkswap(g, name)?;
	let node = g.dev_node(name);
	let mut cmd = Command::new("swapon");
	cmd.arg(&node);
	exec::drain(&mut cmd)?;
	let idx = g.lookup_device(name)?;
	let d = g.device_mut(idx).unwrap();
	d.mnttype = Some("swap".to_owned());
	d.swapprio = SwapPrio::MAXPRIO;
	Ok(())
}

/// Deactivate the swap on this device (if applicable).
pub fn swapoff_dev(g: &mut GraphState, name: &str) -> CoreResult<()> {
	let idx = g.lookup_device(name)?;
	if !g.device(idx).unwrap().swapprio.active() {
		return Err(CoreError::BadArgument(format!(
			"{} is not an active swap device",
			name
		)));
	}
	let node = g.dev_node(name);
	let mut cmd = Command::new("swapoff");
	cmd.arg(&node);
	exec::drain(&mut cmd)?;
	let d = g.device_mut(idx).unwrap();
	d.swapprio = SwapPrio::INACTIVE;
	Ok(())
}
