//! [`ContainerReference`] — the 64-bit ID tracked containers are addressed
//! by (§3).

use std::fmt::{Display, Formatter};

/// A 64-bit container ID. `0` is reserved for null, `u64::MAX` marks a
/// *wild* (not yet registered) container; all other values are live,
/// registry-tracked IDs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ContainerReference(u64);

impl ContainerReference {
	pub const NULL: ContainerReference = ContainerReference(0);
	pub const WILD: ContainerReference = ContainerReference(u64::MAX);

	#[inline]
	pub const fn from_raw(value: u64) -> Self {
		ContainerReference(value)
	}

	#[inline]
	pub const fn raw(self) -> u64 {
		self.0
	}

	#[inline]
	pub const fn is_null(self) -> bool {
		self.0 == 0
	}

	#[inline]
	pub const fn is_wild(self) -> bool {
		self.0 == u64::MAX
	}

	#[inline]
	pub const fn is_tracked(self) -> bool {
		!self.is_null() && !self.is_wild()
	}
}

impl Default for ContainerReference {
	fn default() -> Self {
		ContainerReference::NULL
	}
}

impl Display for ContainerReference {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match *self {
			ContainerReference::NULL => write!(f, "null"),
			ContainerReference::WILD => write!(f, "wild"),
			ContainerReference(id) => write!(f, "#{id}"),
		}
	}
}
