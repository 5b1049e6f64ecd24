//! Command line and the interactive shell.
//!
//! Each shell verb maps onto one core entry point; the shell itself
//! owns no state beyond the graph handle and the table paths it was
//! started with.
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use log::info;
use owo_colors::OwoColorize;

use crate::aggregate;
use crate::codec;
use crate::context::DeviceGraph;
use crate::device::Bus;
use crate::diag;
use crate::errors::CoreError;
use crate::exec;
use crate::fs as fscmd;
use crate::mounts;
use crate::ptable;
use crate::ptypes;
use crate::stats;
use crate::swap;
use crate::utils;
use crate::zfs;

/// Command line usage
/// ==================
///
/// ```shell
/// diskforge [--debug] [--target DIR] [-c COMMAND]
/// ```
///
/// Without `-c`, an interactive shell starts; type `help` there for
/// the verb list.
#[derive(Parser)]
#[command(version, about = "Inspect, construct and destroy storage stacks", long_about = None)]
pub struct Cmdline {
	/// Turns on debug output.
	#[arg(long, action = ArgAction::SetTrue)]
	pub debug: bool,
	/// Prepare a target root (installer mode) rooted here.
	#[arg(short = 't', long)]
	pub target: Option<PathBuf>,
	/// Mount table to ingest.
	#[arg(long, default_value = "/proc/mounts")]
	pub mounts: PathBuf,
	/// Swap table to ingest.
	#[arg(long, default_value = "/proc/swaps")]
	pub swaps: PathBuf,
	/// Run a single shell command and exit.
	#[arg(short = 'c', long)]
	pub command: Option<String>,
}

const HELP: &[(&str, &str, &str)] = &[
	("adapter", "", "list storage adapters"),
	("blockdev", "[mktable DEV KIND | wipetable DEV [KIND] | rescan DEV | bootcode DEV FILE]", "list or manage block devices"),
	("partition", "[add DISK FIRST LAST CODE [NAME] | del PART | setname PART NAME | setuuid PART UUID | settype PART CODE | setflag PART FLAG on|off]", "list or manage partitions"),
	("fs", "[mkfs DEV TYPE [LABEL] | fsck DEV | trim DEV]", "list filesystem types, create or check filesystems"),
	("swap", "[on DEV | off DEV]", "list or toggle swap devices"),
	("mdadm", "TYPE NAME DEV...", "create an MD aggregate"),
	("dm", "TYPE NAME DEV...", "create a device-mapper aggregate"),
	("zpool", "[TYPE NAME DEV...]", "list pools or create a zpool aggregate"),
	("zfs", "", "list ZFS datasets"),
	("target", "[set DIR | unset | finalize]", "manage the installer target root"),
	("map", "DEV PATH OPS", "map a device into the target plan and mount it"),
	("unmap", "PATH|DEV", "remove a mapping from the target plan"),
	("mounts", "", "show active mounts known to the graph"),
	("stats", "", "show disk I/O statistics"),
	("uefiboot", "DEV", "prepare UEFI boot via GRUB on the device's ESP"),
	("biosboot", "DEV", "install BIOS boot code via GRUB"),
	("grubmap", "", "run grub-mkdevicemap"),
	("benchmark", "DEV", "simple read benchmark (hdparm -t)"),
	("badblocks", "DEV [rw]", "surface-scan a device for bad blocks"),
	("troubleshoot", "", "check the environment for common problems"),
	("diags", "[N]", "dump the diagnostic ring"),
	("version", "", "print the version"),
	("help", "[cmd]", "this list, or help on one verb"),
	("quit", "", "exit"),
];

fn human_bytes(bytes: u64) -> String {
	const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
	let mut v = bytes as f64;
	let mut u = 0;
	while v >= 1024.0 && u + 1 < UNITS.len() {
		v /= 1024.0;
		u += 1;
	}
	if u == 0 {
		format!("{} {}", bytes, UNITS[0])
	} else {
		format!("{:.2} {}", v, UNITS[u])
	}
}

pub struct Shell {
	pub graph: Arc<DeviceGraph>,
	pub target_fstab: Option<PathBuf>,
	/// Last diskstats snapshot, so `stats` shows deltas between calls.
	prev_stats: Vec<stats::DiskStats>,
}

impl Shell {
	pub fn new(graph: Arc<DeviceGraph>) -> Self {
		Shell {
			graph,
			target_fstab: None,
			prev_stats: Vec::new(),
		}
	}

	/// Returns false when the user asked to leave.
	pub fn run_command(&mut self, line: &str) -> Result<bool> {
		let args: Vec<&str> = line.split_whitespace().collect();
		let Some((verb, args)) = args.split_first() else {
			return Ok(true);
		};
		match *verb {
			"adapter" => self.cmd_adapter(),
			"blockdev" => self.cmd_blockdev(args),
			"partition" => self.cmd_partition(args),
			"fs" => self.cmd_fs(args),
			"swap" => self.cmd_swap(args),
			"mdadm" | "dm" => self.cmd_aggregate(args),
			"zpool" => self.cmd_zpool(args),
			"zfs" => {
				let out = exec::drain_output(&mut Command::new("zfs").arg("list"))?;
				print!("{}", out);
				Ok(true)
			}
			"target" => self.cmd_target(args),
			"map" => self.cmd_map(args),
			"unmap" => self.cmd_unmap(args),
			"mounts" => self.cmd_mounts(),
			"stats" => self.cmd_stats(),
			"uefiboot" => self.cmd_grub(args, true),
			"biosboot" => self.cmd_grub(args, false),
			"grubmap" => {
				exec::drain(&mut Command::new("grub-mkdevicemap"))?;
				Ok(true)
			}
			"benchmark" => self.cmd_benchmark(args),
			"badblocks" => self.cmd_badblocks(args),
			"troubleshoot" => self.cmd_troubleshoot(),
			"diags" => self.cmd_diags(args),
			"version" => {
				println!("diskforge {}", env!("CARGO_PKG_VERSION"));
				Ok(true)
			}
			"help" => self.cmd_help(args),
			"quit" | "exit" => Ok(false),
			other => {
				bail!("Unknown command '{}'. Try 'help'.", other);
			}
		}
	}

	fn cmd_adapter(&mut self) -> Result<bool> {
		self.graph.with(|g| {
			for c in &g.controllers {
				let detail = match (&c.bus, &c.pcie) {
					(Bus::PCIe, Some(p)) => {
						let bw = p
							.bandwidth_mbps()
							.map(|b| format!(", {} MB/s", b))
							.unwrap_or_default();
						format!(
							" {:04x}:{:02x}:{:02x}.{:x}{}",
							p.domain, p.bus, p.dev, p.func, bw
						)
					}
					_ => String::new(),
				};
				println!(
					"{} [{}]{} ({} devices)",
					c.name.bold(),
					c.bus,
					detail,
					c.devices.len()
				);
			}
		});
		Ok(true)
	}

	fn cmd_blockdev(&mut self, args: &[&str]) -> Result<bool> {
		match args {
			[] => {
				self.graph.with(|g| {
					for (_, d) in g.devices_iter() {
						if d.is_partition() {
							continue;
						}
						let detail = d
							.raw_attrs()
							.map(|b| {
								let media = match b.rotation {
									-1 => "ssd".to_owned(),
									0 => "?rpm".to_owned(),
									r => format!("{}rpm", r),
								};
								let temp = b
									.celsius
									.map(|c| format!(" {}C", c))
									.unwrap_or_default();
								format!("{} {}{}", b.transport, media, temp)
							})
							.unwrap_or_default();
						println!(
							"{:<12} {:>12} {:<6} {:<8} {} {}",
							d.name.bold(),
							human_bytes(d.bytes),
							d.pttable().unwrap_or("none"),
							d.layout.kind(),
							d.model.as_deref().unwrap_or(""),
							detail
						);
					}
				});
			}
			["mktable", dev, kind] => {
				if !ptable::creatable_kinds().iter().any(|(n, _)| n == kind) {
					let kinds: Vec<&str> = ptable::creatable_kinds()
						.iter()
						.map(|(n, _)| *n)
						.collect();
					bail!("'{}' is not creatable; pick one of {:?}", kind, kinds);
				}
				self.graph.with(|g| g.make_table(dev, kind))?;
				info!("Created {} table on {}.", kind, dev);
			}
			["wipetable", dev] => {
				self.graph.with(|g| g.wipe_table(dev, None))?;
				info!("Wiped partition table on {}.", dev);
			}
			["wipetable", dev, kind] => {
				self.graph.with(|g| g.wipe_table(dev, Some(kind)))?;
				info!("Wiped {} table on {}.", kind, dev);
			}
			["rescan", dev] => {
				self.graph.with(|g| g.rescan(dev))?;
			}
			["bootcode", dev, file] => {
				let code = std::fs::read(file)
					.with_context(|| format!("couldn't read boot code from {}", file))?;
				self.graph.with(|g| g.install_boot_code(dev, &code))?;
				info!("Installed {} bytes of boot code on {}.", code.len(), dev);
			}
			_ => bail!(
				"usage: blockdev [mktable DEV KIND | wipetable DEV [KIND] | rescan DEV | bootcode DEV FILE]"
			),
		}
		Ok(true)
	}

	fn cmd_partition(&mut self, args: &[&str]) -> Result<bool> {
		match args {
			[] => {
				self.graph.with(|g| {
					for (_, d) in g.devices_iter() {
						let Some(p) = d.part_attrs() else {
							continue;
						};
						let ty = ptypes::lookup(p.code)
							.map(|t| t.name)
							.unwrap_or("unknown");
						let puuid = p
							.puuid
							.as_ref()
							.map(|u| codec::guid_format(u))
							.unwrap_or_default();
						println!(
							"{:<12} #{:<3} {:>12} [{} .. {}] {} {} {} {}",
							d.name.bold(),
							p.pnumber,
							human_bytes(d.bytes),
							p.fsector,
							p.lsector,
							ty,
							p.role,
							p.pname.as_deref().unwrap_or(""),
							puuid.dimmed()
						);
					}
				});
			}
			["add", disk, first, last, code, rest @ ..] if rest.len() <= 1 => {
				let first: u64 = first.parse().context("bad first sector")?;
				let last: u64 = last.parse().context("bad last sector")?;
				let code = ptypes::parse_code(code)?;
				let name = rest.first().copied();
				self.graph
					.with(|g| g.add_partition(disk, name, first, last, code))?;
				info!("Added partition on {}.", disk);
			}
			["del", part] => {
				self.graph.with(|g| g.wipe_partition(part))?;
				info!("Deleted {}.", part);
			}
			["setname", part, name] => {
				self.graph.with(|g| g.name_partition(part, name))?;
			}
			["setuuid", part, uuid] => {
				let u = codec::guid_parse(uuid)?;
				self.graph.with(|g| g.uuid_partition(part, &u))?;
			}
			["settype", part, code] => {
				let code = ptypes::parse_code(code)?;
				self.graph.with(|g| g.partition_set_code(part, code))?;
			}
			["setflag", part, flag, state] => {
				let flag = u64::from_str_radix(flag.trim_start_matches("0x"), 16)
					.context("bad flag value")?;
				let on = match *state {
					"on" => true,
					"off" => false,
					_ => bail!("usage: partition setflag PART FLAG on|off"),
				};
				self.graph
					.with(|g| g.partition_set_flag(part, flag, on))?;
			}
			_ => bail!(
				"usage: partition [add DISK FIRST LAST CODE [NAME] | del PART | setname PART NAME | setuuid PART UUID | settype PART CODE | setflag PART FLAG on|off]"
			),
		}
		Ok(true)
	}

	fn cmd_fs(&mut self, args: &[&str]) -> Result<bool> {
		match args {
			[] => {
				println!("Supported filesystems: {}", fscmd::FS_TYPES.join(", "));
			}
			["mkfs", dev, fstype] => {
				self.graph
					.with(|g| fscmd::make_filesystem(g, dev, fstype, None))?;
			}
			["mkfs", dev, fstype, label] => {
				self.graph
					.with(|g| fscmd::make_filesystem(g, dev, fstype, Some(label)))?;
			}
			["fsck", dev] => {
				self.graph.with(|g| fscmd::check_filesystem(g, dev))?;
			}
			["trim", dev] => {
				self.graph.with(|g| fscmd::fstrim(g, dev))?;
			}
			_ => bail!("usage: fs [mkfs DEV TYPE [LABEL] | fsck DEV | trim DEV]"),
		}
		Ok(true)
	}

	fn cmd_swap(&mut self, args: &[&str]) -> Result<bool> {
		match args {
			[] => {
				self.graph.with(|g| {
					for (_, d) in g.devices_iter() {
						if d.swapprio.is_swap() {
							println!(
								"{:<12} {:>12} priority {}",
								d.name.bold(),
								human_bytes(d.mnt.bytes),
								d.swapprio.0
							);
						}
					}
				});
			}
			["on", dev] => {
				self.graph.with(|g| swap::swapon_dev(g, dev))?;
				info!("Swapping on {}.", dev);
			}
			["off", dev] => {
				self.graph.with(|g| swap::swapoff_dev(g, dev))?;
				info!("Stopped swapping on {}.", dev);
			}
			_ => bail!("usage: swap [on DEV | off DEV]"),
		}
		Ok(true)
	}

	fn cmd_aggregate(&mut self, args: &[&str]) -> Result<bool> {
		match args {
			[] => {
				for a in aggregate::AGGREGATES {
					println!(
						"{:<10} min {} disks, {} faults tolerated: {}",
						a.name.bold(),
						a.mindisks,
						if a.maxfaulted < 0 {
							"unlimited".to_owned()
						} else {
							a.maxfaulted.to_string()
						},
						a.desc
					);
				}
			}
			[ty, name, comps @ ..] if !comps.is_empty() => {
				let comps: Vec<String> =
					comps.iter().map(|c| utils::short_name(c).to_owned()).collect();
				self.graph
					.with(|g| aggregate::make_aggregate(g, ty, Some(name), &comps))?;
				info!("Created {} '{}'.", ty, name);
			}
			_ => bail!("usage: mdadm|dm TYPE NAME DEV..."),
		}
		Ok(true)
	}

	fn cmd_zpool(&mut self, args: &[&str]) -> Result<bool> {
		match args {
			[] => {
				for p in zfs::scan_pools()? {
					println!(
						"{:<12} {:>12} v{} {}",
						p.name.bold(),
						human_bytes(p.bytes),
						p.version,
						p.health
					);
				}
			}
			[ty, name, comps @ ..] if !comps.is_empty() => {
				let comps: Vec<String> =
					comps.iter().map(|c| utils::short_name(c).to_owned()).collect();
				self.graph
					.with(|g| aggregate::make_aggregate(g, ty, Some(name), &comps))?;
			}
			_ => bail!("usage: zpool [TYPE NAME DEV...]"),
		}
		Ok(true)
	}

	fn cmd_target(&mut self, args: &[&str]) -> Result<bool> {
		match args {
			[] => {
				self.graph.with(|g| {
					match &g.target_root {
						Some(root) => println!("Target root: {}", root.display()),
						None => println!("No target root set."),
					}
					if g.targets.is_empty() {
						println!("No mounts mapped.");
					} else {
						println!("{} mapped mount(s):", g.targets.len());
						for m in g.targets.iter() {
							println!("  {:<12} {:<24} {} {}", m.dev, m.path, m.fs, m.ops);
						}
					}
				});
			}
			["set", dir] => {
				let dir = PathBuf::from(dir);
				self.target_fstab = Some(dir.join("etc/fstab"));
				self.graph.with(|g| g.target_root = Some(dir.clone()));
				info!("Target root set to {}.", dir.display());
			}
			["unset"] => {
				self.graph.with(|g| {
					g.target_root = None;
					g.targets.clear();
				});
				self.target_fstab = None;
			}
			["finalize"] => {
				let Some(fstab) = self.target_fstab.clone() else {
					bail!("no target root set");
				};
				let content = self.graph.with(|g| {
					let mut out = Vec::new();
					g.targets.finalize(&mut out).map(|_| out)
				})?;
				if let Some(parent) = fstab.parent() {
					std::fs::create_dir_all(parent)?;
				}
				let mut f = std::fs::File::create(&fstab)?;
				f.write_all(&content)?;
				f.sync_all()?;
				if let Some(dir) = fstab.parent() {
					utils::sync_filesystem(&dir)?;
				}
				// An empty plan still finalizes cleanly.
				info!("Wrote {}.", fstab.display());
			}
			_ => bail!("usage: target [set DIR | unset | finalize]"),
		}
		Ok(true)
	}

	fn cmd_map(&mut self, args: &[&str]) -> Result<bool> {
		let [dev, path, ops] = args else {
			bail!("usage: map DEV PATH OPS");
		};
		let dev = utils::short_name(dev).to_owned();
		self.graph.with(|g| -> Result<()> {
			let Some(root) = g.target_root.clone() else {
				bail!("no target root set; use 'target set' first");
			};
			let idx = g.lookup_device(&dev)?;
			let d = g.device(idx).unwrap();
			let Some(fstype) = d.mnttype.clone() else {
				bail!("{} has no filesystem", dev);
			};
			if d.target.is_some() {
				bail!("{} is already mapped", dev);
			}
			if d.swapprio.active() {
				return Err(CoreError::BusySwap(dev.clone()).into());
			}
			g.targets.prepare(&dev, path, &fstype, ops)?;
			let under = root.join(path.trim_start_matches('/'));
			let under = under.to_string_lossy().into_owned();
			if let Err(e) = mounts::mmount(g, &dev, &under, ops) {
				// Roll the plan entry back; the mapping is all or
				// nothing.
				let _ = g.targets.remove(*path);
				return Err(e.into());
			}
			g.device_mut(idx).unwrap().target = Some(path.to_string());
			Ok(())
		})?;
		info!("Mapped {} to {}.", dev, path);
		Ok(true)
	}

	fn cmd_unmap(&mut self, args: &[&str]) -> Result<bool> {
		let [what] = args else {
			bail!("usage: unmap PATH|DEV");
		};
		self.graph.with(|g| -> Result<()> {
			let m = g.targets.remove(what)?;
			let root = g.target_root.clone();
			if let Some(root) = root {
				let under = root.join(m.path.trim_start_matches('/'));
				let _ = mounts::unmount(g, &m.dev, Some(&under.to_string_lossy()));
			}
			if let Some(idx) = g.lookup(&m.dev) {
				g.device_mut(idx).unwrap().target = None;
			}
			Ok(())
		})?;
		Ok(true)
	}

	fn cmd_mounts(&mut self) -> Result<bool> {
		self.graph.with(|g| {
			for (_, d) in g.devices_iter() {
				for (path, ops) in d.mnt.paths.iter().zip(d.mnt.ops.iter()) {
					println!(
						"{:<12} {:<28} {:<8} {}",
						d.name.bold(),
						path,
						d.mnttype.as_deref().unwrap_or("?"),
						ops
					);
				}
			}
		});
		Ok(true)
	}

	fn cmd_stats(&mut self) -> Result<bool> {
		let cur = stats::read_proc_diskstats()?;
		// First call shows totals; later calls show what changed.
		let shown = if self.prev_stats.is_empty() {
			cur.clone()
		} else {
			stats::delta(&self.prev_stats, &cur)
		};
		for s in shown {
			println!(
				"{:<12} {:>10} reads {:>12} sectors {:>10} writes {:>12} sectors",
				s.name.bold(),
				s.reads,
				s.sectors_read,
				s.writes,
				s.sectors_written
			);
		}
		self.prev_stats = cur;
		Ok(true)
	}

	fn cmd_grub(&mut self, args: &[&str], uefi: bool) -> Result<bool> {
		let [dev] = args else {
			bail!("usage: {} DEV", if uefi { "uefiboot" } else { "biosboot" });
		};
		let node = self.graph.with(|g| {
			g.lookup_device(utils::short_name(dev))
				.map(|_| g.dev_node(utils::short_name(dev)))
		})?;
		let mut cmd = Command::new("grub-install");
		if uefi {
			cmd.arg("--target=x86_64-efi");
		} else {
			cmd.arg("--target=i386-pc");
		}
		cmd.arg(node);
		exec::drain(&mut cmd)?;
		Ok(true)
	}

	fn cmd_benchmark(&mut self, args: &[&str]) -> Result<bool> {
		let [dev] = args else {
			bail!("usage: benchmark DEV");
		};
		let node = self.graph.with(|g| {
			g.lookup_device(utils::short_name(dev))
				.map(|_| g.dev_node(utils::short_name(dev)))
		})?;
		exec::drain(Command::new("hdparm").arg("-t").arg(node))?;
		Ok(true)
	}

	fn cmd_badblocks(&mut self, args: &[&str]) -> Result<bool> {
		let (dev, rw) = match args {
			[dev] => (dev, false),
			[dev, "rw"] => (dev, true),
			_ => bail!("usage: badblocks DEV [rw]"),
		};
		self.graph
			.with(|g| fscmd::badblock_scan(g, utils::short_name(dev), rw))?;
		Ok(true)
	}

	fn cmd_troubleshoot(&mut self) -> Result<bool> {
		if unsafe { utils::geteuid() } != 0 {
			println!("{}", "Not running as root; mutations will fail.".red());
		}
		if !std::path::Path::new("/sys/block").is_dir() {
			println!("{}", "/sys/block is missing; is sysfs mounted?".red());
		}
		if !std::path::Path::new("/proc/mounts").exists() {
			println!("{}", "/proc/mounts is missing; is procfs mounted?".red());
		}
		let n = self.graph.with(|g| g.device_names().len());
		println!("Graph holds {} devices; {} diagnostics buffered.", n, diag::len());
		Ok(true)
	}

	fn cmd_diags(&mut self, args: &[&str]) -> Result<bool> {
		let n = match args {
			[] => diag::MAXIMUM_LOG_ENTRIES,
			[n] => n.parse().context("bad entry count")?,
			_ => bail!("usage: diags [N]"),
		};
		for e in diag::tail(n) {
			println!("{} {}", e.stamp.format("%H:%M:%S%.3f").dimmed(), e.msg);
		}
		Ok(true)
	}

	fn cmd_help(&mut self, args: &[&str]) -> Result<bool> {
		match args {
			[] => {
				for (verb, usage, desc) in HELP {
					println!("{:<14} {}", verb.bold(), desc);
					if !usage.is_empty() {
						println!("{:<14}   {} {}", "", verb, usage.dimmed());
					}
				}
			}
			[cmd] => {
				let Some((verb, usage, desc)) =
					HELP.iter().find(|(v, _, _)| v == cmd)
				else {
					bail!("no such command: {}", cmd);
				};
				println!("{} {}\n  {}", verb.bold(), usage, desc);
			}
			_ => bail!("usage: help [cmd]"),
		}
		Ok(true)
	}
}

/// The line-oriented driver: read, dispatch, report, repeat.
pub fn run_shell(shell: &mut Shell) -> Result<()> {
	let stdin = io::stdin();
	let mut lines = stdin.lock().lines();
	loop {
		print!("{} ", "[diskforge]>".bold());
		io::stdout().flush()?;
		let Some(line) = lines.next() else {
			// EOF is a clean quit.
			println!();
			return Ok(());
		};
		let line = line?;
		match shell.run_command(&line) {
			Ok(true) => (),
			Ok(false) => return Ok(()),
			Err(e) => {
				log::error!("{}", e);
				diag::push(e.to_string());
			}
		}
	}
}
