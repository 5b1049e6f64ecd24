//! Error kinds shared by the core.
//!
//! The interactive layer works with [`anyhow`]; the core keeps a typed
//! enum so callers (and tests) can tell a rejected overlap from a busy
//! mount without string matching. `CoreError` implements
//! [`std::error::Error`], so `?` lifts it into `anyhow::Result` at the
//! boundary.
use std::fmt;
use std::io;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug)]
pub enum CoreError {
	/// Parse or validation failure of a user-supplied argument.
	BadArgument(String),
	/// Name lookup failed.
	NotFound(String),
	/// Operation not applicable to this device layout.
	WrongLayout,
	/// Device (or one of its partitions) is mounted.
	BusyMounted(String),
	/// Device is an active swap area.
	BusySwap(String),
	/// Device is a slave of an aggregate.
	BusySlave(String),
	/// Requested sector range overlaps an existing partition or cannot
	/// be aligned into the usable area.
	OverlapOrMisalign,
	/// Requested size exceeds what the table format can express.
	CapacityExceeded,
	/// Partition table has no free entry slot.
	NoFreeEntry,
	/// Partition name exceeds what the table format can store.
	NameTooLong,
	/// Geometry precondition failed (size not a sector multiple, disk
	/// too small for the table, ...).
	BadGeometry(String),
	/// The partition type has no identifier under this table format.
	CodeUnsupported(u32),
	Io(io::Error),
	/// The on-disk mutation succeeded but the kernel rescan did not.
	KernelRescanFailed,
	/// External helper exited non-zero or produced unreadable output.
	SubprocessFailed(String),
	/// Feature not implemented for this table kind.
	Unsupported(&'static str),
	/// getrandom(2) could not supply entropy.
	RngExhausted,
	/// CRC or signature mismatch on read.
	Corrupt(&'static str),
}

impl fmt::Display for CoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::BadArgument(s) => write!(f, "Bad argument: {}", s),
			Self::NotFound(s) => write!(f, "No such device: {}", s),
			Self::WrongLayout => write!(f, "Operation not applicable to this device layout"),
			Self::BusyMounted(s) => write!(f, "{} is mounted", s),
			Self::BusySwap(s) => write!(f, "{} is an active swap device", s),
			Self::BusySlave(s) => write!(f, "{} is in use by an aggregate", s),
			Self::OverlapOrMisalign => write!(f, "Sector range overlaps or cannot be aligned"),
			Self::CapacityExceeded => write!(f, "Size exceeds the partition table's limits"),
			Self::NoFreeEntry => write!(f, "No free entry in the partition table"),
			Self::NameTooLong => write!(f, "Name too long for the partition table"),
			Self::BadGeometry(s) => write!(f, "Bad geometry: {}", s),
			Self::CodeUnsupported(c) => {
				write!(f, "Not a valid typecode for this table: 0x{:04x}", c)
			}
			Self::Io(e) => write!(f, "I/O error: {}", e),
			Self::KernelRescanFailed => write!(f, "Kernel would not reread the partition table"),
			Self::SubprocessFailed(s) => write!(f, "Helper failed: {}", s),
			Self::Unsupported(s) => write!(f, "Not supported: {}", s),
			Self::RngExhausted => write!(f, "Insufficient entropy from getrandom(2)"),
			Self::Corrupt(s) => write!(f, "Corrupt on-disk structure: {}", s),
		}
	}
}

impl std::error::Error for CoreError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for CoreError {
	fn from(e: io::Error) -> Self {
		Self::Io(e)
	}
}
