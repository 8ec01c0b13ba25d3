//! Runtime trampoline generation between native C ABIs and the uniform
//! parameter-block convention.
//!
//! Two directions exist. A *callback* is a function with a native signature
//! that packs its arguments into a slot array and hands them to a single
//! generic handler, so the host can expose one `fn(method, data, params,
//! count, ret)` and get called like any C function. A *call* is the mirror:
//! `fn(params, ret)` that unpacks slots into registers and invokes a native
//! target.
//!
//! Arguments are 64-bit slots. Anything wider travels by pointer, which is
//! why the generators reject vector-class parameters outright; vector types
//! only appear in return position, where each ABI has its own lowering.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

#[macro_use]
extern crate log;

mod memory;
mod sig;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64 as arch;
#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64 as arch;

mod call;
mod callback;

pub use call::{CallFn, JitCall, WaitType};
pub use callback::{CallbackHandler, CallbackRef, JitCallback};
pub use memory::ExecBuffer;
pub use sig::{CallConv, FuncSignature, TypeSlot, NO_VAR_ARGS};

#[derive(Debug, thiserror::Error)]
pub enum JitError {
	#[error("parameters wider than 64 bits not supported")]
	WideParameter,
	#[error("return type {0:?} not representable in this convention")]
	BadReturn(TypeSlot),
	#[error("calling convention {0:?} not available on this target")]
	BadConvention(CallConv),
	#[error("executable mapping failed: {0}")]
	MapFailed(String),
	#[error("jit runtime released")]
	RuntimeGone,
	#[error("unsupported target architecture")]
	UnsupportedArch,
}

/// Owns nothing but the books: every live trampoline holds a weak reference
/// here and reports its buffer in and out, so the host can see how much
/// executable memory the bridge is sitting on.
pub struct JitRuntime {
	stats: Mutex<RuntimeStats>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RuntimeStats {
	live: usize,
	bytes: usize,
}

impl JitRuntime {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			stats: Mutex::new(RuntimeStats::default()),
		})
	}

	fn alloc(&self, code: &[u8]) -> Result<ExecBuffer, JitError> {
		let buffer = ExecBuffer::new(code)?;
		let mut stats = self.stats.lock();
		stats.live += 1;
		stats.bytes += buffer.len();
		trace!("Jit alloc: {} live, {} bytes", stats.live, stats.bytes);
		Ok(buffer)
	}

	fn release(&self, buffer: ExecBuffer) {
		let mut stats = self.stats.lock();
		stats.live -= 1;
		stats.bytes -= buffer.len();
		drop(buffer);
	}

	pub fn live_trampolines(&self) -> usize {
		self.stats.lock().live
	}

	pub fn allocated_bytes(&self) -> usize {
		self.stats.lock().bytes
	}
}

fn release_into(rt: &Weak<JitRuntime>, buffer: Option<ExecBuffer>) {
	if let Some(buffer) = buffer {
		if let Some(rt) = rt.upgrade() {
			rt.release(buffer);
		}
		// runtime already gone: the mapping is unmapped on drop regardless
	}
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod arch {
	use crate::{sig::FuncSignature, JitError, WaitType};

	pub fn emit_callback(
		_sig: &FuncSignature,
		_method: usize,
		_handler: usize,
		_data: usize,
		_hidden: bool,
	) -> Result<Vec<u8>, JitError> {
		Err(JitError::UnsupportedArch)
	}

	pub fn emit_call(
		_sig: &FuncSignature,
		_target: usize,
		_wait: WaitType,
		_hidden: bool,
	) -> Result<Vec<u8>, JitError> {
		Err(JitError::UnsupportedArch)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_runtime_books() {
		let rt = JitRuntime::new();
		let buf = rt.alloc(&[0xC3]).unwrap();
		assert_eq!(rt.live_trampolines(), 1);
		assert!(rt.allocated_bytes() > 0);
		rt.release(buf);
		assert_eq!(rt.live_trampolines(), 0);
		assert_eq!(rt.allocated_bytes(), 0);
	}
}
