//! Executable code buffers. Emitters produce plain byte vectors; mapping one
//! makes it immutable-and-executable for the rest of its life (W^X).

use memmap2::{Mmap, MmapMut};

use crate::JitError;

pub struct ExecBuffer {
	map: Mmap,
	len: usize,
}

impl ExecBuffer {
	pub fn new(code: &[u8]) -> Result<Self, JitError> {
		assert!(!code.is_empty());

		let mut map = MmapMut::map_anon(code.len()).map_err(|e| JitError::MapFailed(e.to_string()))?;
		map[..code.len()].copy_from_slice(code);
		let map = map.make_exec().map_err(|e| JitError::MapFailed(e.to_string()))?;

		#[cfg(target_arch = "aarch64")]
		flush_icache(map.as_ptr(), code.len());

		Ok(Self { map, len: code.len() })
	}

	pub fn as_ptr(&self) -> *const u8 {
		self.map.as_ptr()
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}
}

// The mapping is read+exec and never written again after construction.
unsafe impl Send for ExecBuffer {}
unsafe impl Sync for ExecBuffer {}

/// The store and fetch sides of the cache hierarchy are not coherent on arm;
/// freshly written code must be cleaned to the point of unification and the
/// instruction side invalidated before the first branch into it.
#[cfg(target_arch = "aarch64")]
fn flush_icache(ptr: *const u8, len: usize) {
	use std::arch::asm;

	const LINE: usize = 64;
	let start = ptr as usize & !(LINE - 1);
	let end = ptr as usize + len;

	unsafe {
		let mut p = start;
		while p < end {
			asm!("dc cvau, {0}", in(reg) p);
			p += LINE;
		}
		asm!("dsb ish");
		let mut p = start;
		while p < end {
			asm!("ic ivau, {0}", in(reg) p);
			p += LINE;
		}
		asm!("dsb ish");
		asm!("isb");
	}
}
