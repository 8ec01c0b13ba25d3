//! Native-to-uniform trampolines.

use std::os::raw::c_void;
use std::sync::{Arc, Weak};

use crate::memory::ExecBuffer;
use crate::sig::FuncSignature;
use crate::{arch, release_into, JitError, JitRuntime};

/// The one generic entry point a language module implements. `params` is the
/// slot array (already past the hidden slot if the return is by memory),
/// `count` the number of logical arguments, `ret` the return slot (or the
/// final destination for memory returns).
pub type CallbackHandler =
	unsafe extern "C" fn(method: *const c_void, data: *mut c_void, params: *const u64, count: u8, ret: *mut u64);

/// Entry address of a generated trampoline. Transmute to the native
/// function-pointer type it was generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackRef(usize);
impl CallbackRef {
	pub fn as_ptr(&self) -> *const u8 {
		self.0 as *const u8
	}

	pub fn as_usize(&self) -> usize {
		self.0
	}
}

/// Owns one generated callback trampoline. Movable, not clonable; dropping
/// it hands the code buffer back to the runtime.
pub struct JitCallback {
	rt: Weak<JitRuntime>,
	buffer: Option<ExecBuffer>,
	user_data: usize,
	error: Option<String>,
}

impl JitCallback {
	pub fn new(rt: &Arc<JitRuntime>) -> Self {
		Self {
			rt: Arc::downgrade(rt),
			buffer: None,
			user_data: 0,
			error: None,
		}
	}

	/// Generates the trampoline, or returns the existing one. `method` is an
	/// opaque pointer handed through to the handler untouched; `hidden`
	/// marks `sig.args[0]` as the memory-return pointer.
	pub fn generate(
		&mut self,
		sig: &FuncSignature,
		method: usize,
		handler: CallbackHandler,
		data: usize,
		hidden: bool,
	) -> Result<CallbackRef, JitError> {
		if let Some(buffer) = &self.buffer {
			return Ok(CallbackRef(buffer.as_ptr() as usize));
		}

		let rt = self.rt.upgrade().ok_or(JitError::RuntimeGone)?;
		let result = arch::emit_callback(sig, method, handler as usize, data, hidden)
			.and_then(|code| rt.alloc(&code));

		match result {
			Ok(buffer) => {
				trace!("Generated callback trampoline, {} bytes", buffer.len());
				let entry = buffer.as_ptr() as usize;
				self.buffer = Some(buffer);
				self.user_data = data;
				self.error = None;
				Ok(CallbackRef(entry))
			}
			Err(e) => {
				self.error = Some(e.to_string());
				Err(e)
			}
		}
	}

	pub fn function(&self) -> Option<CallbackRef> {
		self.buffer.as_ref().map(|b| CallbackRef(b.as_ptr() as usize))
	}

	pub fn user_data(&self) -> usize {
		self.user_data
	}

	/// Error from the last failed generation, kept until a regeneration
	/// succeeds.
	pub fn error(&self) -> Option<&str> {
		self.error.as_deref()
	}
}

impl Drop for JitCallback {
	fn drop(&mut self) {
		release_into(&self.rt, self.buffer.take());
	}
}
