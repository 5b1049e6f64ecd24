//! Aggregate registry: the declarative catalogue of RAID/ZFS/dm
//! levels, component validation, and delegation to the external
//! builders.
use std::process::Command;

use crate::context::GraphState;
use crate::diag::diag;
use crate::errors::{CoreError, CoreResult};
use crate::exec;

type Maker = fn(&GraphState, &str, &[String]) -> CoreResult<()>;

pub struct AggType {
	pub name: &'static str,
	pub desc: &'static str,
	pub mindisks: usize,
	/// −1 = unlimited tolerated failures.
	pub maxfaulted: i32,
	pub defname: Option<&'static str>,
	maker: Option<Maker>,
	/// Striped variants demand equally sized components.
	striped: bool,
}

fn make_md(g: &GraphState, level: &str, name: &str, comps: &[String]) -> CoreResult<()> {
	let mut cmd = Command::new("mdadm");
	cmd.arg("--create")
		.arg(format!("/dev/md/{}", name))
		.arg(format!("--level={}", level))
		.arg(format!("--raid-devices={}", comps.len()));
	for c in comps {
		cmd.arg(g.dev_node(c));
	}
	exec::drain(&mut cmd)
}

macro_rules! md_maker {
	($fn:ident, $level:literal) => {
		fn $fn(g: &GraphState, name: &str, comps: &[String]) -> CoreResult<()> {
			make_md(g, $level, name, comps)
		}
	};
}

md_maker!(make_mdraid0, "0");
md_maker!(make_mdraid1, "1");
md_maker!(make_mdraid4, "4");
md_maker!(make_mdraid5, "5");
md_maker!(make_mdraid6, "6");
md_maker!(make_mdraid10, "10");

fn make_zpool(g: &GraphState, vdev: Option<&str>, name: &str, comps: &[String]) -> CoreResult<()> {
	let mut cmd = Command::new("zpool");
	cmd.arg("create").arg(name);
	if let Some(vdev) = vdev {
		cmd.arg(vdev);
	}
	for c in comps {
		cmd.arg(g.dev_node(c));
	}
	exec::drain(&mut cmd)
}

fn make_zmirror(g: &GraphState, name: &str, comps: &[String]) -> CoreResult<()> {
	make_zpool(g, Some("mirror"), name, comps)
}
fn make_raidz1(g: &GraphState, name: &str, comps: &[String]) -> CoreResult<()> {
	make_zpool(g, Some("raidz"), name, comps)
}
fn make_raidz2(g: &GraphState, name: &str, comps: &[String]) -> CoreResult<()> {
	make_zpool(g, Some("raidz2"), name, comps)
}
fn make_raidz3(g: &GraphState, name: &str, comps: &[String]) -> CoreResult<()> {
	make_zpool(g, Some("raidz3"), name, comps)
}

fn make_crypt(g: &GraphState, _name: &str, comps: &[String]) -> CoreResult<()> {
	if comps.len() != 1 {
		diag!("Wrong number of devices ({} != 1) for LUKS", comps.len());
		return Err(CoreError::BadArgument(
			"LUKS takes exactly one device".to_owned(),
		));
	}
	let mut cmd = Command::new("cryptsetup");
	cmd.arg("luksFormat").arg(g.dev_node(&comps[0]));
	exec::drain(&mut cmd)
}

macro_rules! agg {
	($name:literal, $desc:literal, $min:literal, $fault:literal) => {
		AggType {
			name: $name,
			desc: $desc,
			mindisks: $min,
			maxfaulted: $fault,
			defname: None,
			maker: None,
			striped: false,
		}
	};
	($name:literal, $desc:literal, $min:literal, $fault:literal, $maker:expr, $defname:literal, $striped:literal) => {
		AggType {
			name: $name,
			desc: $desc,
			mindisks: $min,
			maxfaulted: $fault,
			defname: Some($defname),
			maker: Some($maker),
			striped: $striped,
		}
	};
}

pub static AGGREGATES: &[AggType] = &[
	agg!("mdlinear", "Linear disk combination (MD)", 2, -1),
	agg!("mdddf", "SNIA Data Disk Format container", 2, 0),
	agg!("mdimsm", "Intel Matrix Storage Manager container", 2, 0),
	agg!("mdcontain", "Linear disk combination with metadata", 2, 0),
	agg!(
		"mdraid0",
		"Interleaved disk combination (striping) (MD)",
		2,
		0,
		make_mdraid0,
		"ForgeRAID0",
		true
	),
	agg!("mdraid1", "Mirroring (MD)", 2, 1, make_mdraid1, "ForgeRAID1", false),
	agg!(
		"mdraid4",
		"Block striping with dedicated parity",
		3,
		1,
		make_mdraid4,
		"ForgeRAID4",
		true
	),
	agg!(
		"mdraid5",
		"Block striping with distributed parity",
		3,
		1,
		make_mdraid5,
		"ForgeRAID5",
		true
	),
	agg!(
		"mdraid6",
		"Block striping with 2x distributed parity",
		4,
		2,
		make_mdraid6,
		"ForgeRAID6",
		true
	),
	agg!(
		"mdraid10",
		"Interleaved mirror combination",
		4,
		1,
		make_mdraid10,
		"ForgeRAID10",
		true
	),
	agg!(
		"zmirror",
		"Zpool with data replication (mirroring)",
		2,
		0,
		make_zmirror,
		"ForgeZMirror",
		false
	),
	agg!(
		"raidz1",
		"ZFS RAID with distributed parity",
		3,
		0,
		make_raidz1,
		"ForgeZRAID",
		true
	),
	agg!(
		"raidz2",
		"ZFS RAID with 2x distributed parity",
		4,
		0,
		make_raidz2,
		"ForgeZRAID2",
		true
	),
	agg!(
		"raidz3",
		"ZFS RAID with 3x distributed parity",
		5,
		0,
		make_raidz3,
		"ForgeZRAID3",
		true
	),
	agg!("zil", "ZFS Write-Intent Log", 1, 0),
	agg!("l2arc", "ZFS Level 2 Adaptive Replacement Cache", 1, 0),
	agg!("dmlinear", "Linear disk combination (DM)", 2, -1),
	agg!(
		"dmstriped",
		"Interleaved disk combination (striping) (DM)",
		2,
		0
	),
	agg!("dmcrypt", "LUKS block encryption (DM)", 1, 0, make_crypt, "ForgeCrypt", false),
	agg!("dmmirror", "Mirroring (DM)", 2, 1),
];

pub fn get_aggregate(name: &str) -> Option<&'static AggType> {
	AGGREGATES.iter().find(|a| a.name == name)
}

/// Validate and build: component count, per-component aggregability,
/// size homogeneity for striped variants; the heavy lifting then goes
/// to the corresponding external builder.
pub fn make_aggregate(
	g: &GraphState,
	tyname: &str,
	name: Option<&str>,
	components: &[String],
) -> CoreResult<()> {
	let Some(ty) = get_aggregate(tyname) else {
		return Err(CoreError::BadArgument(format!(
			"unknown aggregate type: {}",
			tyname
		)));
	};
	if components.len() < ty.mindisks {
		return Err(CoreError::BadArgument(format!(
			"{} requires at least {} components (got {})",
			ty.name,
			ty.mindisks,
			components.len()
		)));
	}
	let mut sizes = Vec::new();
	for c in components {
		let idx = g.lookup_device(c)?;
		if !g.aggregable_p(idx) {
			if g.slave_p(c) {
				return Err(CoreError::BusySlave(c.clone()));
			}
			return Err(CoreError::BadArgument(format!(
				"{} is not usable as an aggregate component",
				c
			)));
		}
		sizes.push(g.device(idx).unwrap().bytes);
	}
	if ty.striped && sizes.windows(2).any(|w| w[0] != w[1]) {
		return Err(CoreError::BadArgument(format!(
			"{} requires equally sized components",
			ty.name
		)));
	}
	let Some(maker) = ty.maker else {
		return Err(CoreError::Unsupported("construction of this aggregate"));
	};
	let name = name
		.or(ty.defname)
		.ok_or_else(|| CoreError::BadArgument("aggregate needs a name".to_owned()))?;
	maker(g, name, components)
}

/// Kick off assembly of any aggregates whose member signatures are
/// visible but not yet running.
pub fn assemble_aggregates(g: &GraphState) -> CoreResult<()> {
	let mut zpool = false;
	let mut mdraid = false;
	for (_, d) in g.devices_iter() {
		match d.mnttype.as_deref() {
			Some("zfs_member") => zpool = true,
			Some("linux_raid_member") => mdraid = true,
			_ => (),
		}
	}
	if zpool {
		diag!("Scanning for zpools...");
		let _ = exec::drain(Command::new("zpool").args(["import", "-a"]));
	}
	if mdraid {
		diag!("Scanning for MD devices...");
		let _ = exec::drain(Command::new("mdadm").args(["--assemble", "--scan"]));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::{Device, Layout, NullObserver, RawAttrs};
	use std::path::PathBuf;

	fn graph_with(sizes: &[(&str, u64)]) -> GraphState {
		let mut g = GraphState::with_roots(
			Box::new(NullObserver),
			PathBuf::from("/nonexistent-sysfs"),
			PathBuf::from("/dev"),
		);
		for (n, bytes) in sizes {
			let mut d = Device::new(n, Layout::Raw(RawAttrs::default()));
			d.bytes = *bytes;
			g.adopt_device(d, 0);
		}
		g
	}

	#[test]
	fn test_catalogue() {
		let r5 = get_aggregate("mdraid5").unwrap();
		assert_eq!(r5.mindisks, 3);
		assert_eq!(r5.maxfaulted, 1);
		assert!(r5.maker.is_some());
		let linear = get_aggregate("mdlinear").unwrap();
		assert_eq!(linear.maxfaulted, -1);
		assert!(linear.maker.is_none());
		assert!(get_aggregate("raid7").is_none());
		assert_eq!(AGGREGATES.len(), 20);
	}

	#[test]
	fn test_component_count_validation() {
		let g = graph_with(&[("vda", 1 << 30), ("vdb", 1 << 30)]);
		assert!(matches!(
			make_aggregate(
				&g,
				"mdraid5",
				None,
				&["vda".to_owned(), "vdb".to_owned()]
			),
			Err(CoreError::BadArgument(_))
		));
	}

	#[test]
	fn test_striped_size_homogeneity() {
		let g = graph_with(&[("vda", 1 << 30), ("vdb", 1 << 29)]);
		assert!(matches!(
			make_aggregate(
				&g,
				"mdraid0",
				None,
				&["vda".to_owned(), "vdb".to_owned()]
			),
			Err(CoreError::BadArgument(_))
		));
	}

	#[test]
	fn test_unbuildable_kind() {
		let g = graph_with(&[("vda", 1 << 30), ("vdb", 1 << 30)]);
		assert!(matches!(
			make_aggregate(
				&g,
				"dmlinear",
				Some("span"),
				&["vda".to_owned(), "vdb".to_owned()]
			),
			Err(CoreError::Unsupported(_))
		));
	}

	#[test]
	fn test_ineligible_component() {
		let mut g = graph_with(&[("vda", 1 << 30), ("vdb", 1 << 30)]);
		let idx = g.lookup("vda").unwrap();
		g.device_mut(idx).unwrap().mnttype = Some("ext4".to_owned());
		assert!(matches!(
			make_aggregate(
				&g,
				"mdraid1",
				None,
				&["vda".to_owned(), "vdb".to_owned()]
			),
			Err(CoreError::BadArgument(_))
		));
	}
}
