//! ZFS as an external collaborator: pool enumeration through the
//! zpool utility, dataset mounting through zfs. Nothing here links
//! against the ZFS libraries.
use std::process::Command;

use crate::context::GraphState;
use crate::device::{Device, Layout, ZpoolAttrs};
use crate::diag::diag;
use crate::errors::{CoreError, CoreResult};
use crate::exec;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolRecord {
	pub name: String,
	pub bytes: u64,
	pub health: String,
	pub version: u64,
}

/// "1.5T" and friends, as zpool prints sizes.
fn parse_size(s: &str) -> Option<u64> {
	let s = s.trim();
	let (num, mult) = match s.chars().last()? {
		'K' => (&s[..s.len() - 1], 1u64 << 10),
		'M' => (&s[..s.len() - 1], 1 << 20),
		'G' => (&s[..s.len() - 1], 1 << 30),
		'T' => (&s[..s.len() - 1], 1 << 40),
		'P' => (&s[..s.len() - 1], 1 << 50),
		_ => (s, 1),
	};
	let v: f64 = num.parse().ok()?;
	Some((v * mult as f64) as u64)
}

fn parse_pool_line(line: &str) -> Option<PoolRecord> {
	let mut it = line.split('\t');
	let name = it.next()?.to_owned();
	let bytes = parse_size(it.next()?)?;
	let health = it.next()?.to_owned();
	// "-" means the pool rides the feature-flag format.
	let version = it.next().and_then(|v| v.parse().ok()).unwrap_or(5000);
	Some(PoolRecord {
		name,
		bytes,
		health,
		version,
	})
}

/// Enumerate imported pools.
pub fn scan_pools() -> CoreResult<Vec<PoolRecord>> {
	let out = exec::drain_output(
		Command::new("zpool").args(["list", "-H", "-o", "name,size,health,version"]),
	)?;
	Ok(out.lines().filter_map(parse_pool_line).collect())
}

/// Fold the scanned pools into the graph as zpool pseudo-devices on
/// the virtual controller.
pub fn scan_zpools(g: &mut GraphState) {
	let pools = match scan_pools() {
		Ok(p) => p,
		Err(e) => {
			diag!("Couldn't scan zpools ({})", e);
			return;
		}
	};
	for pool in pools {
		let idx = match g.lookup(&pool.name) {
			Some(idx) => idx,
			None => {
				let d = Device::new(&pool.name, Layout::Zpool(ZpoolAttrs::default()));
				g.adopt_device(d, 0)
			}
		};
		let d = g.device_mut(idx).unwrap();
		d.bytes = pool.bytes;
		d.mnttype = Some("zfs".to_owned());
		if let Layout::Zpool(z) = &mut d.layout {
			z.version = pool.version;
			z.state = pool.health;
		}
	}
}

/// ZFS datasets mount through the zfs utility rather than mount(2).
pub fn mount_zfs(dataset: &str, targ: &str) -> CoreResult<()> {
	if !targ.starts_with('/') {
		return Err(CoreError::BadArgument(format!(
			"mount point must be absolute: {}",
			targ
		)));
	}
	exec::drain(Command::new("zfs").args(["set", &format!("mountpoint={}", targ), dataset]))?;
	exec::drain(Command::new("zfs").args(["mount", dataset]))
}
