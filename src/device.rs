//! The records making up the device graph: controllers, block
//! devices, and the per-layout attribute variants.
use std::fmt;

use uuid::Uuid;

use crate::gpt::DiskGeometry;
use crate::ptypes;

/// Devices live in an arena owned by the graph; records refer to each
/// other by index. Back-references never own anything.
pub type DevIdx = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Bus {
	Unknown,
	Virtual,
	PCIe,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PcieAddress {
	pub domain: u32,
	pub bus: u32,
	pub dev: u32,
	pub func: u32,
	/// PCIe generation, when the slot advertises it.
	pub gen: Option<u32>,
	/// Negotiated lane count (a card can sit in an incompletely wired
	/// slot).
	pub lanes_neg: Option<u32>,
}

impl PcieAddress {
	/// Theoretical unidirectional bandwidth in MB/s. Gen 1/2 pay the
	/// 8b/10b encoding tax; gen 3 onward uses 128b/130b.
	pub fn bandwidth_mbps(&self) -> Option<u64> {
		let per_lane: u64 = match self.gen? {
			1 => 250,
			2 => 500,
			3 => 985,
			4 => 1969,
			5 => 3938,
			_ => return None,
		};
		Some(per_lane * self.lanes_neg? as u64)
	}
}

/// An upstream I/O bus endpoint. Created on discovery, destroyed only
/// at process shutdown.
#[derive(Clone, Debug)]
pub struct Controller {
	pub name: String,
	pub bus: Bus,
	pub pcie: Option<PcieAddress>,
	pub devices: Vec<DevIdx>,
}

impl Controller {
	pub fn virtual_controller() -> Self {
		Controller {
			name: "virtual".to_owned(),
			bus: Bus::Virtual,
			pcie: None,
			devices: Vec::new(),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Transport {
	Unknown,
	ParallelATA,
	SerialATAUnknown,
	SerialATAI,
	SerialATAII,
	SerialATAIII,
	SerialATA8,
	DirectNVMe,
	Virtual,
}

/// Transport as seen from an aggregate: unknown until the first slave
/// reports, mixed as soon as two disagree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggTransport {
	Unknown,
	Mixed,
	Uniform(Transport),
}

impl AggTransport {
	pub fn absorb(&mut self, t: Transport) {
		*self = match *self {
			AggTransport::Unknown => AggTransport::Uniform(t),
			AggTransport::Uniform(prev) if prev == t => AggTransport::Uniform(t),
			_ => AggTransport::Mixed,
		};
	}
}

impl Default for AggTransport {
	fn default() -> Self {
		AggTransport::Unknown
	}
}

impl fmt::Display for AggTransport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			AggTransport::Unknown => write!(f, "Unknown"),
			AggTransport::Mixed => write!(f, "Mixed"),
			AggTransport::Uniform(t) => write!(f, "{}", t),
		}
	}
}

/// Swap priority: −2 not a swap device, −1 inactive swap, 0..=65535
/// active with 0 the highest priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapPrio(pub i32);

impl SwapPrio {
	pub const INVALID: SwapPrio = SwapPrio(-2);
	pub const INACTIVE: SwapPrio = SwapPrio(-1);
	pub const MAXPRIO: SwapPrio = SwapPrio(0);

	pub fn is_swap(self) -> bool {
		self >= Self::INACTIVE
	}

	pub fn active(self) -> bool {
		self.0 >= 0
	}
}

/// Active mounts of one device: parallel path and option lists, plus
/// the statvfs-derived filesystem size.
#[derive(Clone, Debug, Default)]
pub struct MountSet {
	pub paths: Vec<String>,
	pub ops: Vec<String>,
	pub bytes: u64,
}

impl MountSet {
	/// Idempotent: a path already present is not duplicated.
	pub fn add(&mut self, path: &str, ops: &str) {
		if self.paths.iter().any(|p| p == path) {
			return;
		}
		self.paths.push(path.to_owned());
		self.ops.push(ops.to_owned());
	}

	pub fn contains(&self, path: &str) -> bool {
		self.paths.iter().any(|p| p == path)
	}

	pub fn mounted_p(&self) -> bool {
		!self.paths.is_empty()
	}

	pub fn clear(&mut self) {
		self.paths.clear();
		self.ops.clear();
		self.bytes = 0;
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum PartRole {
	Unknown,
	Primary,
	Extended,
	Logical,
	Esp,
	Gpt,
	Mac,
	Pc98,
}

#[derive(Clone, Debug)]
pub struct RawAttrs {
	pub transport: Transport,
	/// −1 solid-state, 0 unknown, otherwise RPM.
	pub rotation: i32,
	pub removable: bool,
	pub wcache: Option<bool>,
	pub rwverify: Option<bool>,
	/// Non-zero bytes in the MBR code area.
	pub biosboot: bool,
	pub mbr_sha1: Option<[u8; 20]>,
	pub pttable: Option<String>,
	pub smart: Option<String>,
	pub celsius: Option<u32>,
}

impl Default for RawAttrs {
	fn default() -> Self {
		RawAttrs {
			transport: Transport::Unknown,
			rotation: 0,
			removable: false,
			wcache: None,
			rwverify: None,
			biosboot: false,
			mbr_sha1: None,
			pttable: None,
			smart: None,
			celsius: None,
		}
	}
}

#[derive(Clone, Debug)]
pub struct PartAttrs {
	pub parent: DevIdx,
	/// 1-based partition number.
	pub pnumber: u32,
	/// First and last sector, inclusive.
	pub fsector: u64,
	pub lsector: u64,
	pub code: u16,
	pub flags: u64,
	pub pname: Option<String>,
	pub puuid: Option<Uuid>,
	pub role: PartRole,
	/// Largest power of two dividing the starting byte offset.
	pub alignment: u64,
}

#[derive(Clone, Debug)]
pub struct MdSlave {
	pub name: String,
	pub component: Option<DevIdx>,
}

#[derive(Clone, Debug, Default)]
pub struct MdAttrs {
	pub disks: u64,
	pub level: String,
	pub slaves: Vec<MdSlave>,
	pub pttable: Option<String>,
	pub transport: AggTransport,
}

#[derive(Clone, Debug, Default)]
pub struct DmAttrs {
	pub disks: u64,
	pub level: String,
	pub slaves: Vec<MdSlave>,
	pub pttable: Option<String>,
	pub transport: AggTransport,
}

#[derive(Clone, Debug, Default)]
pub struct ZpoolAttrs {
	pub version: u64,
	pub state: String,
	pub transport: AggTransport,
	pub slaves: Vec<MdSlave>,
}

#[derive(Clone, Debug)]
pub enum Layout {
	Raw(RawAttrs),
	Partition(PartAttrs),
	Md(MdAttrs),
	Dm(DmAttrs),
	Zpool(ZpoolAttrs),
}

impl Layout {
	pub fn kind(&self) -> &'static str {
		match self {
			Layout::Raw(_) => "blockdev",
			Layout::Partition(_) => "partition",
			Layout::Md(_) => "mdadm",
			Layout::Dm(_) => "device-mapper",
			Layout::Zpool(_) => "zpool",
		}
	}
}

/// Largest power of two dividing the byte offset.
pub fn alignment_of(offset: u64) -> u64 {
	1u64 << offset.trailing_zeros().min(63)
}

/// Any block-layer object: raw disk, aggregate, or partition.
#[derive(Clone, Debug)]
pub struct Device {
	/// Entry in /dev and /sys/block.
	pub name: String,
	pub model: Option<String>,
	pub revision: Option<String>,
	pub serial: Option<String>,
	pub wwn: Option<String>,
	pub bytes: u64,
	pub logsec: u64,
	pub physsec: u64,
	/// Filesystem UUID and label, not the partition's.
	pub uuid: Option<String>,
	pub label: Option<String>,
	/// If the filesystem is not mounted but was found, only mnttype is
	/// set from among mnt and mnttype.
	pub mnttype: Option<String>,
	pub mnt: MountSet,
	pub swapprio: SwapPrio,
	pub roflag: bool,
	/// Future mount path within the target plan.
	pub target: Option<String>,
	/// Opaque token owned by the UI observer.
	pub uistate: u64,
	pub layout: Layout,
	/// Child partitions, sorted by first sector.
	pub parts: Vec<DevIdx>,
}

impl Device {
	pub fn new(name: &str, layout: Layout) -> Self {
		Device {
			name: name.to_owned(),
			model: None,
			revision: None,
			serial: None,
			wwn: None,
			bytes: 0,
			logsec: 512,
			physsec: 512,
			uuid: None,
			label: None,
			mnttype: None,
			mnt: MountSet::default(),
			swapprio: SwapPrio::INVALID,
			roflag: false,
			target: None,
			uistate: 0,
			layout,
			parts: Vec::new(),
		}
	}

	pub fn geometry(&self) -> DiskGeometry {
		DiskGeometry {
			lsec: self.logsec,
			psec: self.physsec,
			bytes: self.bytes,
		}
	}

	/// Partition-table kind, for the layouts that can carry one.
	pub fn pttable(&self) -> Option<&str> {
		match &self.layout {
			Layout::Raw(b) => b.pttable.as_deref(),
			Layout::Md(m) => m.pttable.as_deref(),
			Layout::Dm(m) => m.pttable.as_deref(),
			_ => None,
		}
	}

	pub fn set_pttable(&mut self, pt: Option<String>) {
		match &mut self.layout {
			Layout::Raw(b) => b.pttable = pt,
			Layout::Md(m) => m.pttable = pt,
			Layout::Dm(m) => m.pttable = pt,
			_ => (),
		}
	}

	pub fn part_attrs(&self) -> Option<&PartAttrs> {
		match &self.layout {
			Layout::Partition(p) => Some(p),
			_ => None,
		}
	}

	pub fn part_attrs_mut(&mut self) -> Option<&mut PartAttrs> {
		match &mut self.layout {
			Layout::Partition(p) => Some(p),
			_ => None,
		}
	}

	pub fn raw_attrs(&self) -> Option<&RawAttrs> {
		match &self.layout {
			Layout::Raw(b) => Some(b),
			_ => None,
		}
	}

	pub fn is_raw(&self) -> bool {
		matches!(self.layout, Layout::Raw(_))
	}

	pub fn is_partition(&self) -> bool {
		matches!(self.layout, Layout::Partition(_))
	}

	/// Filesystem half of the aggregable predicate: nothing, or a
	/// member signature of an assembled aggregate.
	pub fn aggregable_fs_p(&self) -> bool {
		matches!(
			self.mnttype.as_deref(),
			None | Some("zfs_member") | Some("linux_raid_member")
		)
	}

	/// Layout half of the aggregable predicate: a raw device without a
	/// table, a partition whose type is flagged aggregable, or an
	/// existing aggregate.
	pub fn aggregable_layout_p(&self) -> bool {
		match &self.layout {
			Layout::Raw(b) => b.pttable.is_none(),
			Layout::Partition(p) => ptypes::lookup(p.code)
				.map(|t| t.aggregable)
				.unwrap_or(false),
			Layout::Md(_) | Layout::Dm(_) | Layout::Zpool(_) => true,
		}
	}
}

/// UI hook: one callback per changed device, one on destruction. Both
/// run synchronously on the thread that triggered them, while the
/// graph lock is held; they must not perform long I/O.
pub trait BlockObserver: Send {
	/// Returns the new opaque UI token for the device.
	fn block_event(&self, d: &Device, uistate: u64) -> u64;
	fn block_free(&self, d: &Device, uistate: u64);
}

/// Observer for headless operation.
pub struct NullObserver;

impl BlockObserver for NullObserver {
	fn block_event(&self, _d: &Device, uistate: u64) -> u64 {
		uistate
	}
	fn block_free(&self, _d: &Device, _uistate: u64) {}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_alignment() {
		assert_eq!(alignment_of(1_048_576), 1_048_576);
		assert_eq!(alignment_of(512 * 3), 512);
		assert_eq!(alignment_of(34 * 512), 1024);
		assert_eq!(alignment_of(0), 1u64 << 63);
	}

	#[test]
	fn test_swap_prio() {
		assert!(!SwapPrio::INVALID.is_swap());
		assert!(SwapPrio::INACTIVE.is_swap());
		assert!(!SwapPrio::INACTIVE.active());
		assert!(SwapPrio(100).active());
		assert!(SwapPrio::MAXPRIO > SwapPrio::INACTIVE);
	}

	#[test]
	fn test_mount_set_idempotent() {
		let mut m = MountSet::default();
		m.add("/mnt/a", "rw,relatime");
		m.add("/mnt/a", "rw,relatime");
		m.add("/mnt/b", "ro");
		assert_eq!(m.paths.len(), 2);
		assert_eq!(m.ops.len(), 2);
		assert!(m.contains("/mnt/a"));
		assert!(m.mounted_p());
	}

	#[test]
	fn test_agg_transport_absorb() {
		let mut t = AggTransport::Unknown;
		t.absorb(Transport::SerialATAIII);
		assert_eq!(t, AggTransport::Uniform(Transport::SerialATAIII));
		t.absorb(Transport::SerialATAIII);
		assert_eq!(t, AggTransport::Uniform(Transport::SerialATAIII));
		t.absorb(Transport::DirectNVMe);
		assert_eq!(t, AggTransport::Mixed);
	}

	#[test]
	fn test_aggregable_halves() {
		let mut d = Device::new("sda", Layout::Raw(RawAttrs::default()));
		assert!(d.aggregable_fs_p());
		assert!(d.aggregable_layout_p());
		d.mnttype = Some("ext4".to_owned());
		assert!(!d.aggregable_fs_p());
		d.mnttype = Some("linux_raid_member".to_owned());
		assert!(d.aggregable_fs_p());
		d.set_pttable(Some("gpt".to_owned()));
		assert!(!d.aggregable_layout_p());

		let agg_part = Device::new(
			"sda1",
			Layout::Partition(PartAttrs {
				parent: 0,
				pnumber: 1,
				fsector: 2048,
				lsector: 4095,
				code: crate::ptypes::PARTTYPE_MDRAID,
				flags: 0,
				pname: None,
				puuid: None,
				role: PartRole::Gpt,
				alignment: alignment_of(2048 * 512),
			}),
		);
		assert!(agg_part.aggregable_layout_p());

		let plain_part = Device::new(
			"sda2",
			Layout::Partition(PartAttrs {
				parent: 0,
				pnumber: 2,
				fsector: 4096,
				lsector: 8191,
				code: crate::ptypes::PARTTYPE_LINUX,
				flags: 0,
				pname: None,
				puuid: None,
				role: PartRole::Gpt,
				alignment: alignment_of(4096 * 512),
			}),
		);
		assert!(!plain_part.aggregable_layout_p());
	}

	#[test]
	fn test_pcie_bandwidth() {
		let addr = PcieAddress {
			gen: Some(3),
			lanes_neg: Some(4),
			..Default::default()
		};
		assert_eq!(addr.bandwidth_mbps(), Some(3940));
		assert_eq!(PcieAddress::default().bandwidth_mbps(), None);
	}
}
