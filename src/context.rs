//! The device graph: a live, mutable topology of controllers, block
//! devices, partitions, and aggregates, synchronized with the kernel.
//!
//! One process-wide lock guards the whole graph. Observer callbacks
//! run synchronously under that lock, on the thread that triggered
//! them, so UI state and model state cannot diverge. Lookups walk a
//! name index over an arena of device slots; records reference each
//! other by arena index, and destruction cascades from parent to
//! child.
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::codec;
use crate::device::{
	alignment_of, AggTransport, BlockObserver, Bus, Controller, DevIdx, Device, DmAttrs, Layout,
	MdAttrs, MdSlave, PartAttrs, PartRole, PcieAddress, RawAttrs, Transport,
};
use crate::diag::diag;
use crate::errors::{CoreError, CoreResult};
use crate::gpt;
use crate::msdos;
use crate::ptable;
use crate::ptypes;
use crate::sysfs;
use crate::target::TargetPlan;
use crate::{blkpg, utils};

/// The process-wide graph object handed to every entry point.
pub struct DeviceGraph {
	state: Mutex<GraphState>,
}

pub struct GraphState {
	pub controllers: Vec<Controller>,
	devices: Vec<Option<Device>>,
	byname: HashMap<String, DevIdx>,
	observer: Box<dyn BlockObserver>,
	pub target_root: Option<PathBuf>,
	pub targets: TargetPlan,
	sysfs_root: PathBuf,
	dev_root: PathBuf,
}

impl DeviceGraph {
	pub fn new(observer: Box<dyn BlockObserver>) -> Self {
		DeviceGraph {
			state: Mutex::new(GraphState::with_roots(
				observer,
				PathBuf::from(sysfs::SYSFS_BLOCK),
				PathBuf::from("/dev"),
			)),
		}
	}

	/// Run a closure against the locked graph. Every external entry
	/// point funnels through here; the lock is held across observer
	/// callbacks.
	pub fn with<R>(&self, f: impl FnOnce(&mut GraphState) -> R) -> R {
		let mut state = self.state.lock().unwrap();
		f(&mut state)
	}
}

impl GraphState {
	pub fn with_roots(observer: Box<dyn BlockObserver>, sysfs_root: PathBuf, dev_root: PathBuf) -> Self {
		GraphState {
			// The singleton virtual controller owns aggregate
			// pseudo-devices.
			controllers: vec![Controller::virtual_controller()],
			devices: Vec::new(),
			byname: HashMap::new(),
			observer,
			target_root: None,
			targets: TargetPlan::new(),
			sysfs_root,
			dev_root,
		}
	}

	pub fn device(&self, idx: DevIdx) -> Option<&Device> {
		self.devices.get(idx).and_then(|d| d.as_ref())
	}

	pub fn device_mut(&mut self, idx: DevIdx) -> Option<&mut Device> {
		self.devices.get_mut(idx).and_then(|d| d.as_mut())
	}

	/// Lookup by kernel short name; "/dev/", "./" and "../" prefixes
	/// are shed first.
	pub fn lookup(&self, name: &str) -> Option<DevIdx> {
		self.byname.get(utils::short_name(name)).copied()
	}

	pub fn lookup_device(&self, name: &str) -> CoreResult<DevIdx> {
		self.lookup(name)
			.ok_or_else(|| CoreError::NotFound(name.to_owned()))
	}

	pub fn device_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self
			.devices
			.iter()
			.flatten()
			.map(|d| d.name.clone())
			.collect();
		names.sort();
		names
	}

	pub fn devices_iter(&self) -> impl Iterator<Item = (DevIdx, &Device)> {
		self.devices
			.iter()
			.enumerate()
			.filter_map(|(z, d)| d.as_ref().map(|d| (z, d)))
	}

	pub fn dev_node(&self, name: &str) -> PathBuf {
		self.dev_root.join(name)
	}

	fn notify(&mut self, idx: DevIdx) {
		if let Some(d) = self.devices.get_mut(idx).and_then(|d| d.as_mut()) {
			d.uistate = self.observer.block_event(d, d.uistate);
		}
	}

	fn insert_device(&mut self, d: Device, ctrl: usize) -> DevIdx {
		let idx = match self.devices.iter().position(|s| s.is_none()) {
			Some(free) => {
				self.devices[free] = Some(d);
				free
			}
			None => {
				self.devices.push(Some(d));
				self.devices.len() - 1
			}
		};
		let name = self.devices[idx].as_ref().unwrap().name.clone();
		self.byname.insert(name, idx);
		if let Some(c) = self.controllers.get_mut(ctrl) {
			c.devices.push(idx);
		}
		self.notify(idx);
		idx
	}

	/// Destruction cascades from the parent; the observer sees every
	/// child go before the parent.
	fn remove_device(&mut self, idx: DevIdx) {
		let Some(children) = self
			.devices
			.get(idx)
			.and_then(|d| d.as_ref())
			.map(|d| d.parts.clone())
		else {
			return;
		};
		for child in children {
			self.remove_device(child);
		}
		let Some(d) = self.devices[idx].take() else {
			return;
		};
		self.observer.block_free(&d, d.uistate);
		self.byname.remove(&d.name);
		for c in &mut self.controllers {
			c.devices.retain(|&z| z != idx);
		}
		for slot in self.devices.iter_mut().flatten() {
			slot.parts.retain(|&z| z != idx);
		}
	}

	// ---- discovery ----------------------------------------------------

	/// Full startup scan: controllers, then block devices, then child
	/// partitions, then aggregate slave binding.
	pub fn scan_all(&mut self) -> CoreResult<()> {
		let root = self.sysfs_root.clone();
		if !root.is_dir() {
			return Err(CoreError::NotFound(root.display().to_string()));
		}
		let mut names = Vec::new();
		for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
			let entry =
				entry.map_err(|e| CoreError::BadArgument(format!("sysfs walk: {}", e)))?;
			names.push(entry.file_name().to_string_lossy().into_owned());
		}
		names.sort();
		for name in names {
			if let Err(e) = self.scan_blockdev(&name) {
				diag!("Couldn't scan {} ({})", name, e);
			}
		}
		self.bind_slaves();
		info!(
			"Discovered {} devices on {} controllers.",
			self.devices.iter().flatten().count(),
			self.controllers.len()
		);
		Ok(())
	}

	/// Re-read a single device and reconcile the graph: new
	/// partitions appended, removed partitions destroyed, changed
	/// attributes overwritten in place.
	pub fn rescan(&mut self, name: &str) -> CoreResult<()> {
		let name = utils::short_name(name).to_owned();
		let dir = self.sysfs_root.join(&name);
		if !dir.is_dir() {
			if let Some(idx) = self.lookup(&name) {
				debug!("{} went away, dropping it", name);
				self.remove_device(idx);
			}
			return Ok(());
		}
		self.scan_blockdev(&name)?;
		self.bind_slaves();
		Ok(())
	}

	fn scan_blockdev(&mut self, name: &str) -> CoreResult<()> {
		let dir = self.sysfs_root.join(name);
		let layout = if sysfs::exists(&dir, "md") {
			Layout::Md(MdAttrs::default())
		} else if name.starts_with("dm-") {
			Layout::Dm(DmAttrs::default())
		} else {
			Layout::Raw(RawAttrs::default())
		};
		let ctrl = self.controller_for(&dir);
		let idx = match self.lookup(name) {
			Some(idx) => idx,
			None => self.insert_device(Device::new(name, layout.clone()), ctrl),
		};
		{
			let d = self.device_mut(idx).unwrap();
			if std::mem::discriminant(&d.layout) != std::mem::discriminant(&layout) {
				d.layout = layout;
				d.parts.clear();
			}
			// The sysfs size attribute counts 512-byte units
			// regardless of the device's logical sector size.
			d.bytes = sysfs::get_uint(&dir, "size").unwrap_or(0) * 512;
			d.logsec = sysfs::get_uint(&dir, "queue/logical_block_size").unwrap_or(512);
			d.physsec = sysfs::get_uint(&dir, "queue/physical_block_size").unwrap_or(d.logsec);
			d.roflag = sysfs::get_bool(&dir, "ro").unwrap_or(false);
			d.model = sysfs::get_string_opt(&dir, "device/model");
			d.revision = sysfs::get_string_opt(&dir, "device/rev");
			d.serial = sysfs::get_string_opt(&dir, "device/serial");
			d.wwn = sysfs::get_string_opt(&dir, "wwid")
				.or_else(|| sysfs::get_string_opt(&dir, "device/wwid"));
			if let Layout::Raw(b) = &mut d.layout {
				b.removable = sysfs::get_bool(&dir, "removable").unwrap_or(false);
				b.rotation = match sysfs::get_bool(&dir, "queue/rotational") {
					Ok(false) => -1,
					Ok(true) => 0,
					Err(_) => 0,
				};
				b.transport = classify_transport(name, &dir);
			}
		}
		self.probe_signatures(idx);
		self.inspect_mbr(idx);
		if let Layout::Md(_) = self.device(idx).unwrap().layout {
			self.explore_md(idx, &dir)?;
		}
		self.reconcile_partitions(idx, &dir)?;
		self.notify(idx);
		Ok(())
	}

	/// Bus endpoints that are neither virtual nor PCIe-addressable get
	/// pooled on a catch-all controller.
	fn unknown_controller(&mut self) -> usize {
		if let Some(z) = self
			.controllers
			.iter()
			.position(|c| c.bus == Bus::Unknown)
		{
			return z;
		}
		self.controllers.push(Controller {
			name: "unknown".to_owned(),
			bus: Bus::Unknown,
			pcie: None,
			devices: Vec::new(),
		});
		self.controllers.len() - 1
	}

	fn controller_for(&mut self, dir: &Path) -> usize {
		let Ok(real) = fs::canonicalize(dir) else {
			return 0;
		};
		let path = real.to_string_lossy().into_owned();
		if path.contains("/devices/virtual/") {
			return 0;
		}
		// Deepest PCI function on the path is the adapter.
		let Some(addr) = path
			.split('/')
			.rev()
			.find(|seg| parse_pcie_address(seg).is_some())
			.map(|s| s.to_owned())
		else {
			return self.unknown_controller();
		};
		if let Some(z) = self.controllers.iter().position(|c| c.name == addr) {
			return z;
		}
		let mut pcie = parse_pcie_address(&addr).unwrap();
		// Link attributes live in the adapter's own sysfs directory.
		if let Some(pcidir) = path
			.find(&addr)
			.map(|end| PathBuf::from(&path[..end + addr.len()]))
		{
			pcie.gen = sysfs::get_string_opt(&pcidir, "current_link_speed")
				.and_then(|s| pcie_gen_of_speed(&s));
			pcie.lanes_neg = sysfs::get_string_opt(&pcidir, "current_link_width")
				.and_then(|s| s.parse().ok());
		}
		self.controllers.push(Controller {
			name: addr,
			bus: Bus::PCIe,
			pcie: Some(pcie),
			devices: Vec::new(),
		});
		self.controllers.len() - 1
	}

	/// blkid probe for filesystem signatures and the table kind. A
	/// node that cannot be probed (not present, no signature) leaves
	/// the record unenriched.
	fn probe_signatures(&mut self, idx: DevIdx) {
		let name = self.device(idx).unwrap().name.clone();
		let node = self.dev_node(&name);
		if !node.exists() {
			return;
		}
		let Ok(probe) = blkid::prober::Prober::new_from_filename(&node) else {
			return;
		};
		if !matches!(
			probe.do_safe_probe(),
			Ok(blkid::prober::ProbeState::Success)
		) {
			return;
		}
		let Ok(values) = probe.get_values_map() else {
			return;
		};
		let d = self.device_mut(idx).unwrap();
		if let Some(fs) = values.get("TYPE") {
			if d.mnttype.as_deref() != Some(fs.as_str()) {
				d.mnttype = Some(fs.clone());
			}
		}
		d.uuid = values.get("UUID").cloned().or(d.uuid.take());
		d.label = values.get("LABEL").cloned().or(d.label.take());
		if d.is_partition() {
			if let Some(pu) = values.get("PARTUUID") {
				if let Ok(u) = codec::guid_parse(pu) {
					if let Some(p) = d.part_attrs_mut() {
						p.puuid = Some(u);
					}
				}
			}
		} else {
			// blkid says "mac" where the dispatcher speaks "apm".
			let pt = values.get("PTTYPE").cloned().map(|p| {
				if p == "mac" {
					"apm".to_owned()
				} else {
					p
				}
			});
			d.set_pttable(pt);
		}
	}

	/// BIOS-boot state of the MBR code area, for raw disks whose node
	/// we can read.
	fn inspect_mbr(&mut self, idx: DevIdx) {
		let d = self.device(idx).unwrap();
		if !d.is_raw() || d.bytes == 0 {
			return;
		}
		let node = self.dev_node(&d.name);
		let Ok(f) = fs::File::open(&node) else {
			return;
		};
		let zero = msdos::code_area_zero_p(&f).unwrap_or(true);
		let sha = msdos::code_area_sha1(&f).ok();
		if let Some(Layout::Raw(b)) =
			self.device_mut(idx).map(|d| &mut d.layout)
		{
			b.biosboot = !zero;
			b.mbr_sha1 = sha;
		}
	}

	fn explore_md(&mut self, idx: DevIdx, dir: &Path) -> CoreResult<()> {
		let md = dir.join("md");
		let disks = sysfs::get_uint(&md, "raid_disks").unwrap_or(0);
		let level = sysfs::get_string_opt(&md, "level").unwrap_or_default();
		let metadata = sysfs::get_string_opt(&md, "metadata_version");
		let mut slaves = Vec::new();
		for rd in 0..disks {
			// rd<N> is a symlink whose target begins with "dev-".
			let link = md.join(format!("rd{}", rd));
			let Ok(target) = fs::read_link(&link) else {
				// Missing or faulted component.
				continue;
			};
			let tname = target
				.file_name()
				.map(|s| s.to_string_lossy().into_owned())
				.unwrap_or_default();
			let Some(comp) = tname.strip_prefix("dev-") else {
				diag!("Couldn't get device from {}", tname);
				continue;
			};
			slaves.push(comp.to_owned());
		}
		let d = self.device_mut(idx).unwrap();
		d.revision = metadata.or(d.revision.take());
		if d.model.is_none() {
			d.model = Some("Linux mdadm".to_owned());
		}
		if let Layout::Md(m) = &mut d.layout {
			m.disks = disks;
			m.level = level;
			m.slaves = slaves
				.into_iter()
				.map(|name| MdSlave {
					name,
					component: None,
				})
				.collect();
		}
		Ok(())
	}

	/// Bind aggregate slave records to their component devices by
	/// name, and derive the aggregate transport.
	pub fn bind_slaves(&mut self) {
		let idxs: Vec<DevIdx> = self.devices_iter().map(|(z, _)| z).collect();
		for idx in idxs {
			let slaves: Vec<String> = match &self.device(idx).unwrap().layout {
				Layout::Md(m) => m.slaves.iter().map(|s| s.name.clone()).collect(),
				Layout::Dm(m) => m.slaves.iter().map(|s| s.name.clone()).collect(),
				Layout::Zpool(z) => z.slaves.iter().map(|s| s.name.clone()).collect(),
				_ => continue,
			};
			let mut bound = Vec::new();
			let mut transport = AggTransport::Unknown;
			for name in &slaves {
				let comp = self.lookup(name);
				if let Some(cidx) = comp {
					transport.absorb(self.transport_of(cidx));
				}
				bound.push(MdSlave {
					name: name.clone(),
					component: comp,
				});
			}
			match &mut self.device_mut(idx).unwrap().layout {
				Layout::Md(m) => {
					m.slaves = bound;
					m.transport = transport;
				}
				Layout::Dm(m) => {
					m.slaves = bound;
					m.transport = transport;
				}
				Layout::Zpool(z) => {
					z.slaves = bound;
					z.transport = transport;
				}
				_ => (),
			}
		}
	}

	fn transport_of(&self, idx: DevIdx) -> Transport {
		match &self.device(idx).unwrap().layout {
			Layout::Raw(b) => b.transport,
			Layout::Partition(p) => self.transport_of(p.parent),
			Layout::Md(m) => match m.transport {
				AggTransport::Uniform(t) => t,
				_ => Transport::Unknown,
			},
			Layout::Dm(m) => match m.transport {
				AggTransport::Uniform(t) => t,
				_ => Transport::Unknown,
			},
			Layout::Zpool(z) => match z.transport {
				AggTransport::Uniform(t) => t,
				_ => Transport::Unknown,
			},
		}
	}

	fn reconcile_partitions(&mut self, idx: DevIdx, dir: &Path) -> CoreResult<()> {
		let parent_name = self.device(idx).unwrap().name.clone();
		let mut seen = Vec::new();
		for entry in fs::read_dir(dir)? {
			let entry = entry?;
			let pdir = entry.path();
			if !pdir.is_dir() || !sysfs::exists(&pdir, "partition") {
				continue;
			}
			let pname = entry.file_name().to_string_lossy().into_owned();
			seen.push(pname.clone());
			let pnumber = sysfs::get_uint(&pdir, "partition").unwrap_or(0) as u32;
			// start/size count 512-byte units.
			let logsec = self.device(idx).unwrap().logsec.max(512);
			let start = sysfs::get_uint(&pdir, "start").unwrap_or(0) * 512 / logsec;
			let sectors = sysfs::get_uint(&pdir, "size").unwrap_or(0) * 512 / logsec;
			let role = partition_role(self.device(idx).unwrap().pttable(), pnumber);
			let pidx = match self.lookup(&pname) {
				Some(p) => p,
				None => {
					let attrs = PartAttrs {
						parent: idx,
						pnumber,
						fsector: start,
						lsector: start + sectors.saturating_sub(1),
						code: 0,
						flags: 0,
						pname: None,
						puuid: None,
						role,
						alignment: alignment_of(start * logsec),
					};
					let mut pd = Device::new(&pname, Layout::Partition(attrs));
					pd.logsec = logsec;
					let pd_idx = self.insert_device(pd, usize::MAX);
					self.device_mut(idx).unwrap().parts.push(pd_idx);
					pd_idx
				}
			};
			{
				let logsec_parent = logsec;
				let d = self.device_mut(pidx).unwrap();
				d.bytes = sectors * logsec_parent;
				d.logsec = logsec_parent;
				if let Some(p) = d.part_attrs_mut() {
					p.pnumber = pnumber;
					p.fsector = start;
					p.lsector = start + sectors.saturating_sub(1);
					p.role = role;
					p.alignment = alignment_of(start * logsec_parent);
				}
			}
			self.probe_signatures(pidx);
			self.notify(pidx);
		}
		// Anything we knew about but sysfs no longer lists is gone.
		let stale: Vec<DevIdx> = self
			.device(idx)
			.unwrap()
			.parts
			.iter()
			.copied()
			.filter(|&p| {
				self.device(p)
					.map(|d| !seen.contains(&d.name))
					.unwrap_or(true)
			})
			.collect();
		for p in stale {
			self.remove_device(p);
		}
		// Enrich from the on-disk table where we can read it, then
		// restore the sort-by-first-sector invariant.
		self.enrich_from_table(idx, &parent_name);
		let mut parts = self.device(idx).unwrap().parts.clone();
		parts.sort_by_key(|&p| {
			self.device(p)
				.and_then(|d| d.part_attrs())
				.map(|a| a.fsector)
				.unwrap_or(u64::MAX)
		});
		self.device_mut(idx).unwrap().parts = parts;
		Ok(())
	}

	/// Pull type codes, names, UUIDs and flags out of the on-disk
	/// table. Best-effort: a node we cannot read leaves the records
	/// as sysfs described them.
	fn enrich_from_table(&mut self, idx: DevIdx, name: &str) {
		let d = self.device(idx).unwrap();
		let geom = d.geometry();
		let kind = d.pttable().map(str::to_owned);
		let node = self.dev_node(name);
		let Ok(f) = fs::File::open(&node) else {
			return;
		};
		match kind.as_deref() {
			Some("gpt") => {
				let Ok(entries) = gpt::entries(&f, &geom) else {
					return;
				};
				let children = self.device(idx).unwrap().parts.clone();
				for (pno, e) in entries {
					let Some(&pidx) = children.iter().find(|&&c| {
						self.device(c)
							.and_then(|d| d.part_attrs())
							.map(|a| a.pnumber == pno)
							.unwrap_or(false)
					}) else {
						continue;
					};
					let tguid = codec::guid_from_disk(&e.type_guid);
					let code = ptypes::lookup_by_guid(&tguid).map(|t| t.code);
					let pd = self.device_mut(pidx).unwrap();
					if let Some(p) = pd.part_attrs_mut() {
						if let Some(code) = code {
							p.code = code;
						}
						p.flags = e.flags;
						p.puuid = Some(codec::guid_from_disk(&e.part_guid));
						let nm = codec::utf16le_decode(&e.name);
						p.pname = (!nm.is_empty()).then_some(nm);
						if code == Some(ptypes::PARTTYPE_ESP) {
							p.role = PartRole::Esp;
						}
					}
				}
			}
			Some("dos") => {
				let Ok(entries) = msdos::entries(&f, &geom) else {
					return;
				};
				let children = self.device(idx).unwrap().parts.clone();
				for (pno, e) in entries {
					let Some(&pidx) = children.iter().find(|&&c| {
						self.device(c)
							.and_then(|d| d.part_attrs())
							.map(|a| a.pnumber == pno)
							.unwrap_or(false)
					}) else {
						continue;
					};
					let code = ptypes::lookup_by_mbr_code(e.ptype).map(|t| t.code);
					let pd = self.device_mut(pidx).unwrap();
					if let Some(p) = pd.part_attrs_mut() {
						if let Some(code) = code {
							p.code = code;
						}
						p.flags = e.flags as u64;
						p.role = if e.is_extended() {
							PartRole::Extended
						} else if pno > 4 {
							PartRole::Logical
						} else {
							PartRole::Primary
						};
					}
				}
			}
			_ => (),
		}
	}

	// ---- aggregability ------------------------------------------------

	/// Whether the named device is eligible as a component of a new
	/// aggregate.
	pub fn aggregable_p(&self, idx: DevIdx) -> bool {
		let Some(d) = self.device(idx) else {
			return false;
		};
		d.aggregable_fs_p()
			&& !self.slave_p(&d.name)
			&& d.bytes > 0
			&& !d.roflag
			&& d.aggregable_layout_p()
	}

	/// Already a component of some aggregate?
	pub fn slave_p(&self, name: &str) -> bool {
		self.devices_iter().any(|(_, d)| {
			let slaves = match &d.layout {
				Layout::Md(m) => &m.slaves,
				Layout::Dm(m) => &m.slaves,
				Layout::Zpool(z) => &z.slaves,
				_ => return false,
			};
			slaves.iter().any(|s| s.name == name)
		})
	}

	// ---- partition-table entry points ---------------------------------

	fn open_for_table(&self, name: &str) -> CoreResult<fs::File> {
		Ok(fs::File::options()
			.read(true)
			.write(true)
			.open(self.dev_node(name))?)
	}

	/// Kernel notification makes no sense against an image file.
	fn is_block_node(&self, name: &str) -> bool {
		fs::metadata(self.dev_node(name))
			.map(|m| m.file_type().is_block_device())
			.unwrap_or(false)
	}

	fn rescan_after_mutation(&mut self, name: &str, f: &fs::File) -> CoreResult<()> {
		if self.is_block_node(name) {
			blkpg::rescan(f)?;
		}
		self.rescan(name)
	}

	/// Create a partition table. Refused when a filesystem signature
	/// or another table is already present.
	pub fn make_table(&mut self, name: &str, kind: &str) -> CoreResult<()> {
		let idx = self.lookup_device(name)?;
		let d = self.device(idx).unwrap();
		if !d.is_raw() {
			diag!("Will only create a partition table on raw block devices");
			return Err(CoreError::WrongLayout);
		}
		if d.pttable().is_some() {
			return Err(CoreError::BadArgument(format!(
				"partition table already exists on {}",
				name
			)));
		}
		if let Some(fs) = &d.mnttype {
			return Err(CoreError::BadArgument(format!(
				"{} filesystem exists on {}",
				fs, name
			)));
		}
		let geom = d.geometry();
		let pt = ptable::table_by_name(kind)?;
		let f = self.open_for_table(name)?;
		pt.make(&f, &geom)?;
		self.device_mut(idx)
			.unwrap()
			.set_pttable(Some(kind.to_owned()));
		self.rescan_after_mutation(name, &f)
	}

	/// Wipe the table. Refused while the device or any partition is
	/// mounted or swapping. An explicit kind overrides detection when
	/// a stale table is suspected.
	pub fn wipe_table(&mut self, name: &str, kind: Option<&str>) -> CoreResult<()> {
		let idx = self.lookup_device(name)?;
		let d = self.device(idx).unwrap();
		if !d.is_raw() {
			diag!("Will only remove partition tables from raw block devices");
			return Err(CoreError::WrongLayout);
		}
		if d.mnt.mounted_p() {
			return Err(CoreError::BusyMounted(format!(
				"{} ({})",
				name, d.mnt.paths[0]
			)));
		}
		for &p in &d.parts {
			let pd = self.device(p).unwrap();
			if pd.mnt.mounted_p() {
				return Err(CoreError::BusyMounted(format!(
					"{} ({})",
					pd.name, pd.mnt.paths[0]
				)));
			}
			if pd.swapprio.active() {
				return Err(CoreError::BusySwap(pd.name.clone()));
			}
		}
		let kind = match (d.pttable(), kind) {
			(Some(detected), Some(fallback)) if detected != fallback => {
				diag!("Wiping {} table despite {} detection on {}", fallback, detected, name);
				fallback.to_owned()
			}
			(Some(detected), _) => detected.to_owned(),
			(None, Some(fallback)) => {
				diag!("No partition table on {}; wiping anyway", name);
				fallback.to_owned()
			}
			(None, None) => {
				return Err(CoreError::NotFound(format!(
					"partition table on {}",
					name
				)));
			}
		};
		let geom = d.geometry();
		let pt = ptable::table_by_name(&kind)?;
		let f = self.open_for_table(name)?;
		pt.zap(&f, &geom)?;
		self.device_mut(idx).unwrap().set_pttable(None);
		self.rescan_after_mutation(name, &f)
	}

	/// Add a partition to the named disk and tell the kernel about it.
	pub fn add_partition(
		&mut self,
		name: &str,
		pname: Option<&str>,
		fsec: u64,
		lsec: u64,
		code: u16,
	) -> CoreResult<()> {
		let idx = self.lookup_device(name)?;
		let d = self.device(idx).unwrap();
		let kind = d
			.pttable()
			.ok_or_else(|| CoreError::NotFound(format!("partition table on {}", name)))?
			.to_owned();
		let geom = d.geometry();
		let pt = ptable::table_by_name(&kind)?;
		let f = self.open_for_table(name)?;
		let added = pt.add(&f, &geom, pname, fsec, lsec, code)?;
		if self.is_block_node(name) {
			blkpg::add_partition(
				&f,
				added.first * geom.lsec,
				(added.last - added.first + 1) * geom.lsec,
				added.pno,
				pname.unwrap_or(""),
			)?;
		}
		self.rescan(name)
	}

	fn partition_context(&self, partname: &str) -> CoreResult<(DevIdx, DevIdx, String, u32)> {
		let pidx = self.lookup_device(partname)?;
		let pd = self.device(pidx).unwrap();
		let Some(attrs) = pd.part_attrs() else {
			diag!("Will only operate on real partitions");
			return Err(CoreError::WrongLayout);
		};
		let parent = self.device(attrs.parent).unwrap();
		Ok((pidx, attrs.parent, parent.name.clone(), attrs.pnumber))
	}

	/// Delete a partition and tell the kernel about it.
	pub fn wipe_partition(&mut self, partname: &str) -> CoreResult<()> {
		let (pidx, _parent_idx, parent_name, pno) = self.partition_context(partname)?;
		let pd = self.device(pidx).unwrap();
		if pd.mnt.mounted_p() {
			return Err(CoreError::BusyMounted(format!(
				"{} ({})",
				partname, pd.mnt.paths[0]
			)));
		}
		if pd.swapprio.active() {
			return Err(CoreError::BusySwap(partname.to_owned()));
		}
		if self.slave_p(partname) {
			return Err(CoreError::BusySlave(partname.to_owned()));
		}
		let attrs = pd.part_attrs().unwrap();
		let (first, bytes) = (attrs.fsector, pd.bytes);
		let parent = self.device(self.lookup_device(&parent_name)?).unwrap();
		let geom = parent.geometry();
		let kind = parent
			.pttable()
			.ok_or_else(|| CoreError::NotFound(format!("partition table on {}", parent_name)))?
			.to_owned();
		let pt = ptable::table_by_name(&kind)?;
		let f = self.open_for_table(&parent_name)?;
		pt.del(&f, &geom, pno)?;
		if self.is_block_node(&parent_name) {
			blkpg::del_partition(&f, first * geom.lsec, bytes, pno, &parent_name)?;
		}
		self.rescan(&parent_name)
	}

	fn with_partition_table<R>(
		&mut self,
		partname: &str,
		op: impl FnOnce(&'static dyn ptable::Ptable, &fs::File, &gpt::DiskGeometry, u32) -> CoreResult<R>,
	) -> CoreResult<R> {
		let (_pidx, parent_idx, parent_name, pno) = self.partition_context(partname)?;
		let parent = self.device(parent_idx).unwrap();
		let geom = parent.geometry();
		let kind = parent
			.pttable()
			.ok_or_else(|| CoreError::NotFound(format!("partition table on {}", parent_name)))?
			.to_owned();
		let pt = ptable::table_by_name(&kind)?;
		let f = self.open_for_table(&parent_name)?;
		let r = op(pt, &f, &geom, pno)?;
		// Attribute edits don't change the partition count; the graph
		// re-read suffices without a BLKPG cycle.
		self.rescan(&parent_name)?;
		Ok(r)
	}

	pub fn name_partition(&mut self, partname: &str, label: &str) -> CoreResult<()> {
		self.with_partition_table(partname, |pt, f, geom, pno| {
			pt.set_name(f, geom, pno, label)
		})
	}

	pub fn uuid_partition(&mut self, partname: &str, uuid: &Uuid) -> CoreResult<()> {
		self.with_partition_table(partname, |pt, f, geom, pno| {
			pt.set_uuid(f, geom, pno, uuid)
		})
	}

	pub fn partition_set_code(&mut self, partname: &str, code: u16) -> CoreResult<()> {
		self.with_partition_table(partname, |pt, f, geom, pno| {
			pt.set_code(f, geom, pno, code)
		})
	}

	pub fn partition_set_flags(&mut self, partname: &str, flags: u64) -> CoreResult<()> {
		self.with_partition_table(partname, |pt, f, geom, pno| {
			pt.set_flags(f, geom, pno, flags)
		})
	}

	pub fn partition_set_flag(&mut self, partname: &str, flag: u64, on: bool) -> CoreResult<()> {
		self.with_partition_table(partname, |pt, f, geom, pno| {
			pt.set_flag(f, geom, pno, flag, on)
		})
	}

	/// Write BIOS boot code into the MBR code area, leaving the table
	/// alone.
	pub fn install_boot_code(&mut self, name: &str, code: &[u8]) -> CoreResult<()> {
		let idx = self.lookup_device(name)?;
		if !self.device(idx).unwrap().is_raw() {
			return Err(CoreError::WrongLayout);
		}
		let f = self.open_for_table(name)?;
		msdos::write_boot_code(&f, code)?;
		self.inspect_mbr(idx);
		self.notify(idx);
		Ok(())
	}

	pub fn first_usable_sector(&self, name: &str) -> CoreResult<u64> {
		let idx = self.lookup_device(name)?;
		let d = self.device(idx).unwrap();
		match d.pttable() {
			Some(kind) => {
				let pt = ptable::table_by_name(kind)?;
				let f = fs::File::open(self.dev_node(name))?;
				pt.first_usable(&f, &d.geometry())
			}
			None => Ok(if d.logsec > 0 { d.physsec / d.logsec } else { 0 }),
		}
	}

	pub fn last_usable_sector(&self, name: &str) -> CoreResult<u64> {
		let idx = self.lookup_device(name)?;
		let d = self.device(idx).unwrap();
		match d.pttable() {
			Some(kind) => {
				let pt = ptable::table_by_name(kind)?;
				let f = fs::File::open(self.dev_node(name))?;
				pt.last_usable(&f, &d.geometry())
			}
			None => {
				if d.logsec == 0 {
					return Ok(0);
				}
				Ok(d.bytes / d.logsec - 1)
			}
		}
	}

	// ---- synthetic state, for callers that learn of devices outside
	// sysfs (zpool scan) and for exercising graph logic ---------------

	pub fn adopt_device(&mut self, d: Device, ctrl: usize) -> DevIdx {
		let idx = self.insert_device(d, ctrl);
		self.bind_slaves();
		idx
	}

	pub fn adopt_partition(&mut self, parent: DevIdx, d: Device) -> DevIdx {
		let idx = self.insert_device(d, usize::MAX);
		let plist = &mut self.device_mut(parent).unwrap().parts;
		plist.push(idx);
		let mut parts = self.device(parent).unwrap().parts.clone();
		parts.sort_by_key(|&p| {
			self.device(p)
				.and_then(|d| d.part_attrs())
				.map(|a| a.fsector)
				.unwrap_or(u64::MAX)
		});
		self.device_mut(parent).unwrap().parts = parts;
		idx
	}
}

fn classify_transport(name: &str, dir: &Path) -> Transport {
	if name.starts_with("nvme") {
		return Transport::DirectNVMe;
	}
	let Ok(real) = fs::canonicalize(dir) else {
		return Transport::Unknown;
	};
	let path = real.to_string_lossy().into_owned();
	if path.contains("/devices/virtual/") {
		Transport::Virtual
	} else if let Some(port) = ata_port_of(&path) {
		classify_sata(port)
	} else if path.contains("/ide") {
		Transport::ParallelATA
	} else {
		Transport::Unknown
	}
}

fn ata_port_of(path: &str) -> Option<u32> {
	path.split('/').find_map(|seg| {
		seg.strip_prefix("ata")
			.and_then(|n| n.parse().ok())
	})
}

/// Negotiated SATA generation, from the port's link speed.
fn classify_sata(port: u32) -> Transport {
	let link = PathBuf::from(format!("/sys/class/ata_link/link{}", port));
	match sysfs::get_string_opt(&link, "sata_spd").as_deref() {
		Some(s) if s.starts_with("1.5") => Transport::SerialATAI,
		Some(s) if s.starts_with("3.0") => Transport::SerialATAII,
		Some(s) if s.starts_with("6.0") => Transport::SerialATAIII,
		// Anything faster postdates the numbered generations.
		Some(_) => Transport::SerialATA8,
		None => Transport::SerialATAUnknown,
	}
}

fn partition_role(pttable: Option<&str>, pnumber: u32) -> PartRole {
	match pttable {
		Some("gpt") => PartRole::Gpt,
		Some("dos") => {
			if pnumber > 4 {
				PartRole::Logical
			} else {
				PartRole::Primary
			}
		}
		Some("apm") => PartRole::Mac,
		Some("pc98") => PartRole::Pc98,
		_ => PartRole::Unknown,
	}
}

/// "0000:00:17.0" and friends.
fn parse_pcie_address(seg: &str) -> Option<PcieAddress> {
	let (rest, func) = seg.rsplit_once('.')?;
	let mut it = rest.split(':');
	let domain = u32::from_str_radix(it.next()?, 16).ok()?;
	let bus = u32::from_str_radix(it.next()?, 16).ok()?;
	let dev = u32::from_str_radix(it.next()?, 16).ok()?;
	if it.next().is_some() {
		return None;
	}
	let func = u32::from_str_radix(func, 16).ok()?;
	Some(PcieAddress {
		domain,
		bus,
		dev,
		func,
		gen: None,
		lanes_neg: None,
	})
}

fn pcie_gen_of_speed(s: &str) -> Option<u32> {
	if s.starts_with("2.5") {
		Some(1)
	} else if s.starts_with("5.0") || s.starts_with("5 ") {
		Some(2)
	} else if s.starts_with("8.0") {
		Some(3)
	} else if s.starts_with("16.0") {
		Some(4)
	} else if s.starts_with("32.0") {
		Some(5)
	} else {
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::NullObserver;
	use crate::ptypes::PARTTYPE_LINUX;
	use crate::utils::create_sparse_file;
	use std::fs::File;
	use std::io::Write;

	fn fake_roots(tag: &str) -> (PathBuf, PathBuf) {
		let base = std::env::temp_dir().join(format!(
			"diskforge-graph-{}-{}",
			tag,
			std::process::id()
		));
		let _ = fs::remove_dir_all(&base);
		let sysfs = base.join("sys/block");
		let dev = base.join("dev");
		fs::create_dir_all(&sysfs).unwrap();
		fs::create_dir_all(&dev).unwrap();
		(sysfs, dev)
	}

	fn write_attr(dir: &Path, node: &str, val: &str) {
		if let Some(parent) = dir.join(node).parent() {
			fs::create_dir_all(parent).unwrap();
		}
		let mut f = File::create(dir.join(node)).unwrap();
		writeln!(f, "{}", val).unwrap();
	}

	fn fake_disk(sysfs: &Path, dev: &Path, name: &str, sectors: u64) {
		let dir = sysfs.join(name);
		fs::create_dir_all(&dir).unwrap();
		write_attr(&dir, "size", &sectors.to_string());
		write_attr(&dir, "queue/logical_block_size", "512");
		write_attr(&dir, "queue/physical_block_size", "512");
		write_attr(&dir, "queue/rotational", "0");
		write_attr(&dir, "removable", "0");
		write_attr(&dir, "ro", "0");
		write_attr(&dir, "dev", "8:0");
		create_sparse_file(dev.join(name), sectors * 512).unwrap();
	}

	fn fake_partition(sysfs: &Path, disk: &str, pname: &str, pno: u32, start: u64, size: u64) {
		let dir = sysfs.join(disk).join(pname);
		fs::create_dir_all(&dir).unwrap();
		write_attr(&dir, "partition", &pno.to_string());
		write_attr(&dir, "start", &start.to_string());
		write_attr(&dir, "size", &size.to_string());
	}

	fn graph(sysfs: &Path, dev: &Path) -> GraphState {
		let _ = env_logger::builder().is_test(true).try_init();
		GraphState::with_roots(
			Box::new(NullObserver),
			sysfs.to_path_buf(),
			dev.to_path_buf(),
		)
	}

	#[test]
	fn test_scan_and_lookup() {
		let (sysfs, dev) = fake_roots("scan");
		fake_disk(&sysfs, &dev, "sda", 8_388_608);
		fake_partition(&sysfs, "sda", "sda1", 1, 2048, 409_600);
		fake_partition(&sysfs, "sda", "sda2", 2, 411_648, 409_600);
		let mut g = graph(&sysfs, &dev);
		g.scan_all().unwrap();
		let idx = g.lookup("sda").unwrap();
		let d = g.device(idx).unwrap();
		assert_eq!(d.bytes, 8_388_608 * 512);
		assert_eq!(d.parts.len(), 2);
		// Prefix shedding on lookup.
		assert_eq!(g.lookup("/dev/sda"), Some(idx));
		let p1 = g.device(d.parts[0]).unwrap();
		let a = p1.part_attrs().unwrap();
		assert_eq!(a.pnumber, 1);
		assert_eq!(a.fsector, 2048);
		assert_eq!(a.lsector, 2048 + 409_600 - 1);
		assert_eq!(a.alignment, 1_048_576);
		// Partition list is sorted by first sector and disjoint.
		let p2 = g.device(d.parts[1]).unwrap().part_attrs().unwrap().fsector;
		assert!(p1.part_attrs().unwrap().lsector < p2);
	}

	#[test]
	fn test_rescan_reconciles_removed_partition() {
		let (sysfs, dev) = fake_roots("reconcile");
		fake_disk(&sysfs, &dev, "sdb", 2_097_152);
		fake_partition(&sysfs, "sdb", "sdb1", 1, 2048, 20_480);
		let mut g = graph(&sysfs, &dev);
		g.scan_all().unwrap();
		assert!(g.lookup("sdb1").is_some());
		// The partition disappears from sysfs; rescan drops it.
		fs::remove_dir_all(sysfs.join("sdb").join("sdb1")).unwrap();
		g.rescan("sdb").unwrap();
		assert!(g.lookup("sdb1").is_none());
		assert!(g.device(g.lookup("sdb").unwrap()).unwrap().parts.is_empty());
		// The whole disk disappears; rescan drops everything.
		fs::remove_dir_all(sysfs.join("sdb")).unwrap();
		g.rescan("sdb").unwrap();
		assert!(g.lookup("sdb").is_none());
	}

	#[test]
	fn test_make_table_validations() {
		let (sysfs, dev) = fake_roots("maketab");
		fake_disk(&sysfs, &dev, "sdc", 2_097_152);
		let mut g = graph(&sysfs, &dev);
		g.scan_all().unwrap();
		assert!(matches!(
			g.make_table("nope", "gpt"),
			Err(CoreError::NotFound(_))
		));
		// A filesystem signature blocks table creation.
		let idx = g.lookup("sdc").unwrap();
		g.device_mut(idx).unwrap().mnttype = Some("ext4".to_owned());
		assert!(matches!(
			g.make_table("sdc", "gpt"),
			Err(CoreError::BadArgument(_))
		));
		g.device_mut(idx).unwrap().mnttype = None;
		g.make_table("sdc", "gpt").unwrap();
		// A second table is refused.
		assert!(matches!(
			g.make_table("sdc", "dos"),
			Err(CoreError::BadArgument(_))
		));
	}

	#[test]
	fn test_table_lifecycle_on_image() {
		let (sysfs, dev) = fake_roots("lifecycle");
		fake_disk(&sysfs, &dev, "sdd", 2_097_152);
		let mut g = graph(&sysfs, &dev);
		g.scan_all().unwrap();
		g.make_table("sdd", "gpt").unwrap();
		g.add_partition("sdd", Some("root"), 2048, 409_600, PARTTYPE_LINUX)
			.unwrap();
		assert_eq!(g.first_usable_sector("sdd").unwrap(), 34);
		assert_eq!(
			g.last_usable_sector("sdd").unwrap(),
			2_097_152 - 34
		);
		// wipe_table is blocked by a mounted partition. Fake one up
		// the way the mount parser would.
		let idx = g.lookup("sdd").unwrap();
		let node = dev.join("sdd");
		let f = File::options().read(true).write(true).open(&node).unwrap();
		let geom = g.device(idx).unwrap().geometry();
		let parts = gpt::entries(&f, &geom).unwrap();
		assert_eq!(parts.len(), 1);
		let mut fake = Device::new(
			"sdd1",
			Layout::Partition(PartAttrs {
				parent: idx,
				pnumber: 1,
				fsector: 2048,
				lsector: 409_600,
				code: PARTTYPE_LINUX,
				flags: 0,
				pname: None,
				puuid: None,
				role: PartRole::Gpt,
				alignment: alignment_of(2048 * 512),
			}),
		);
		fake.mnt.add("/mnt/scratch", "rw");
		let pidx = g.adopt_partition(idx, fake);
		assert!(matches!(
			g.wipe_table("sdd", None),
			Err(CoreError::BusyMounted(_))
		));
		g.device_mut(pidx).unwrap().mnt.clear();
		g.wipe_table("sdd", None).unwrap();
		// Wiping twice: the second call reports no table.
		assert!(matches!(
			g.wipe_table("sdd", None),
			Err(CoreError::NotFound(_))
		));
		// ...unless an explicit kind forces it.
		g.wipe_table("sdd", Some("gpt")).unwrap();
	}

	#[test]
	fn test_aggregable_predicate_and_slaves() {
		let (sysfs, dev) = fake_roots("agg");
		fake_disk(&sysfs, &dev, "sde", 2_097_152);
		fake_disk(&sysfs, &dev, "sdf", 2_097_152);
		let mut g = graph(&sysfs, &dev);
		g.scan_all().unwrap();
		let e = g.lookup("sde").unwrap();
		assert!(g.aggregable_p(e));
		// Read-only devices are out.
		g.device_mut(e).unwrap().roflag = true;
		assert!(!g.aggregable_p(e));
		g.device_mut(e).unwrap().roflag = false;
		// A raid-member signature stays eligible.
		g.device_mut(e).unwrap().mnttype = Some("linux_raid_member".to_owned());
		assert!(g.aggregable_p(e));
		// Slaving it to an aggregate takes it out.
		let mut md = Device::new("md0", Layout::Md(MdAttrs::default()));
		md.bytes = 2 * 2_097_152 * 512;
		if let Layout::Md(m) = &mut md.layout {
			m.disks = 2;
			m.level = "raid1".to_owned();
			m.slaves = vec![
				MdSlave {
					name: "sde".to_owned(),
					component: None,
				},
				MdSlave {
					name: "sdf".to_owned(),
					component: None,
				},
			];
		}
		let mdidx = g.adopt_device(md, 0);
		assert!(g.slave_p("sde"));
		assert!(!g.aggregable_p(e));
		// Slave binding resolved the component indices and the
		// uniform transport.
		if let Layout::Md(m) = &g.device(mdidx).unwrap().layout {
			assert_eq!(m.slaves[0].component, Some(e));
			assert!(matches!(m.transport, AggTransport::Uniform(_)));
		} else {
			panic!("not md");
		}
		// The aggregate itself is eligible for stacking.
		assert!(g.aggregable_p(mdidx));
	}

	#[test]
	fn test_install_boot_code() {
		let (sysfs, dev) = fake_roots("bootcode");
		fake_disk(&sysfs, &dev, "sdh", 2_097_152);
		let mut g = graph(&sysfs, &dev);
		g.scan_all().unwrap();
		let idx = g.lookup("sdh").unwrap();
		assert!(!g.device(idx).unwrap().raw_attrs().unwrap().biosboot);
		g.install_boot_code("sdh", &[0xeb, 0x63, 0x90]).unwrap();
		let b = g.device(idx).unwrap().raw_attrs().unwrap();
		assert!(b.biosboot);
		assert!(b.mbr_sha1.is_some());
	}

	#[test]
	fn test_partition_edit_paths() {
		let (sysfs, dev) = fake_roots("editpath");
		fake_disk(&sysfs, &dev, "sdg", 2_097_152);
		// sysfs lists the partition the way the kernel would after
		// the BLKPG notification.
		fake_partition(&sysfs, "sdg", "sdg1", 1, 2048, 409_600 - 2048 + 1);
		let mut g = graph(&sysfs, &dev);
		g.scan_all().unwrap();
		g.make_table("sdg", "gpt").unwrap();
		g.add_partition("sdg", Some("data"), 2048, 409_600, PARTTYPE_LINUX)
			.unwrap();
		let idx = g.lookup("sdg").unwrap();
		// The post-mutation rescan enriched the partition record from
		// the on-disk table.
		let pidx = g.lookup("sdg1").unwrap();
		let attrs = g.device(pidx).unwrap().part_attrs().unwrap().clone();
		assert_eq!(attrs.code, PARTTYPE_LINUX);
		assert_eq!(attrs.pname.as_deref(), Some("data"));
		assert!(attrs.puuid.is_some());
		g.name_partition("sdg1", "renamed").unwrap();
		g.partition_set_flag("sdg1", 0x4, true).unwrap();
		let f = File::open(dev.join("sdg")).unwrap();
		let geom = g.device(idx).unwrap().geometry();
		let entries = gpt::entries(&f, &geom).unwrap();
		assert_eq!(codec::utf16le_decode(&entries[0].1.name), "renamed");
		assert_eq!(entries[0].1.flags, 0x4);
		// Deletion shows up on disk.
		g.wipe_partition("sdg1").unwrap();
		assert!(gpt::entries(&f, &geom).unwrap().is_empty());
	}
}
