//! Diagnostic ring buffer.
//!
//! Every core-level diagnostic goes through [`diag!`]: the message lands
//! in the process-wide ring (for the `diags` shell verb) and in the
//! ordinary logger. The ring keeps the newest [`MAXIMUM_LOG_ENTRIES`]
//! messages, oldest evicted first.
use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Local};

pub const MAXIMUM_LOG_ENTRIES: usize = 1024;

#[derive(Clone, Debug)]
pub struct DiagEntry {
	pub stamp: DateTime<Local>,
	pub msg: String,
}

static RING: Mutex<VecDeque<DiagEntry>> = Mutex::new(VecDeque::new());

pub fn push(msg: String) {
	let mut ring = RING.lock().unwrap();
	if ring.len() == MAXIMUM_LOG_ENTRIES {
		ring.pop_front();
	}
	ring.push_back(DiagEntry {
		stamp: Local::now(),
		msg,
	});
}

/// Newest `n` entries, oldest of those first.
pub fn tail(n: usize) -> Vec<DiagEntry> {
	let ring = RING.lock().unwrap();
	let skip = ring.len().saturating_sub(n);
	ring.iter().skip(skip).cloned().collect()
}

pub fn len() -> usize {
	RING.lock().unwrap().len()
}

macro_rules! diag {
	($($arg:tt)*) => {{
		let msg = format!($($arg)*);
		log::warn!("{}", msg);
		$crate::diag::push(msg);
	}};
}
pub(crate) use diag;
