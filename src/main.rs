mod aggregate;
mod apm;
mod blkpg;
mod cli;
mod codec;
mod context;
mod device;
mod diag;
mod errors;
mod exec;
mod fs;
mod gpt;
mod mounts;
mod msdos;
mod ptable;
mod ptypes;
mod stats;
mod swap;
mod sysfs;
mod target;
mod udev;
mod utils;
mod zfs;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cmdline, Shell};
use context::DeviceGraph;
use device::NullObserver;
use log::{debug, error, info, warn};

fn main() -> Result<()> {
	ctrlc::set_handler(move || {
		eprintln!("\nReceived Ctrl-C, exiting.");
		std::process::exit(1);
	})
	.context("Can not register Ctrl-C (SIGTERM) handler.")?;

	// Parse the command line
	let cmdline = Cmdline::try_parse()?;
	let mut logger = colog::basic_builder();
	if cmdline.debug {
		logger.filter(None, log::LevelFilter::Debug);
	} else {
		logger.filter(None, log::LevelFilter::Info);
	}
	logger.init();
	if cmdline.debug {
		debug!("Debug output enabled.");
	}
	if let Err(e) = try_main(cmdline) {
		// Use logger to pretty-print errors
		let mut str_buf = String::new();
		error!("Error encountered!\n{}", e);
		let mut ident = 0;
		e.chain().skip(1).for_each(|cause| {
			let ident_str = "\t".repeat(ident);
			ident += 1;
			str_buf += &format!("{0}- Caused by:\n{0}  {1}", ident_str, cause);
		});
		if !str_buf.is_empty() {
			error!("{}", str_buf);
		}
		error!("Exiting now.");
		std::process::exit(1);
	}
	Ok(())
}

fn try_main(cmdline: Cmdline) -> Result<()> {
	info!("Welcome to diskforge!");
	if unsafe { utils::geteuid() } != 0 {
		warn!("Not running as root; storage mutations will fail.");
	}
	let graph = Arc::new(DeviceGraph::new(Box::new(NullObserver)));
	graph
		.with(|g| {
			g.target_root = cmdline.target.clone();
			g.scan_all()
		})
		.context("Failed to initialize the device graph")?;
	// Read-side state: the running mounts and swaps, then whatever
	// aggregates announce themselves.
	graph.with(|g| -> Result<()> {
		if let Err(e) = mounts::parse_mounts(g, &cmdline.mounts) {
			warn!("Couldn't ingest {} ({})", cmdline.mounts.display(), e);
		}
		if let Err(e) = swap::parse_swaps(g, &cmdline.swaps) {
			warn!("Couldn't ingest {} ({})", cmdline.swaps.display(), e);
		}
		let _ = aggregate::assemble_aggregates(g);
		zfs::scan_zpools(g);
		Ok(())
	})?;
	// Kernel hotplug events keep the graph current from here on.
	match udev::spawn_monitor(Arc::clone(&graph)) {
		Ok(_handle) => debug!("uevent monitor running."),
		Err(e) => warn!("No uevent monitor ({}); hotplug will go unnoticed.", e),
	}
	let mut shell = Shell::new(graph);
	if let Some(target) = &cmdline.target {
		shell.target_fstab = Some(target.join("etc/fstab"));
	}
	match &cmdline.command {
		Some(line) => {
			// One-shot mode for scripting.
			shell.run_command(line)?;
		}
		None => {
			cli::run_shell(&mut shell)?;
		}
	}
	info!("Program finished successfully. Exiting.");
	Ok(())
}
