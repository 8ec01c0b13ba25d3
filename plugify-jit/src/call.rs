//! Uniform-to-native trampolines.

use std::sync::{Arc, Weak};

use crate::memory::ExecBuffer;
use crate::sig::FuncSignature;
use crate::{arch, release_into, JitError, JitRuntime};

/// Shape of a generated call wrapper: slot array in, return slot out.
pub type CallFn = unsafe extern "C" fn(params: *const u64, ret: *mut u64);

/// Debug hooks inserted just before the target is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitType {
	#[default]
	None,
	/// Emit a trap so an attached debugger stops on entry.
	Breakpoint,
	/// Block on a key press, leaving time to attach one.
	Keypress,
}

pub(crate) extern "C" fn wait_keypress() {
	use std::io::Read;
	let _ = std::io::stdin().read(&mut [0u8; 1]);
}

/// Owns one generated call trampoline wrapping a fixed native target.
/// Movable, not clonable.
pub struct JitCall {
	rt: Weak<JitRuntime>,
	buffer: Option<ExecBuffer>,
	target: usize,
	error: Option<String>,
}

impl JitCall {
	pub fn new(rt: &Arc<JitRuntime>) -> Self {
		Self {
			rt: Arc::downgrade(rt),
			buffer: None,
			target: 0,
			error: None,
		}
	}

	/// Generates the wrapper, or returns the existing one. `hidden` marks
	/// `sig.args[0]` as the memory-return pointer travelling in slot 0.
	pub fn generate(
		&mut self,
		sig: &FuncSignature,
		target: usize,
		wait: WaitType,
		hidden: bool,
	) -> Result<CallFn, JitError> {
		if let Some(buffer) = &self.buffer {
			return Ok(unsafe { std::mem::transmute::<*const u8, CallFn>(buffer.as_ptr()) });
		}

		let rt = self.rt.upgrade().ok_or(JitError::RuntimeGone)?;
		let result = arch::emit_call(sig, target, wait, hidden).and_then(|code| rt.alloc(&code));

		match result {
			Ok(buffer) => {
				trace!("Generated call trampoline, {} bytes", buffer.len());
				let f = unsafe { std::mem::transmute::<*const u8, CallFn>(buffer.as_ptr()) };
				self.buffer = Some(buffer);
				self.target = target;
				self.error = None;
				Ok(f)
			}
			Err(e) => {
				self.error = Some(e.to_string());
				Err(e)
			}
		}
	}

	pub fn function(&self) -> Option<CallFn> {
		self.buffer
			.as_ref()
			.map(|b| unsafe { std::mem::transmute::<*const u8, CallFn>(b.as_ptr()) })
	}

	pub fn target(&self) -> usize {
		self.target
	}

	pub fn error(&self) -> Option<&str> {
		self.error.as_deref()
	}
}

impl Drop for JitCall {
	fn drop(&mut self) {
		release_into(&self.rt, self.buffer.take());
	}
}

#[cfg(all(test, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
	use super::*;
	use crate::callback::JitCallback;
	use crate::sig::{CallConv, TypeSlot, NO_VAR_ARGS};

	fn host_sig(ret: TypeSlot, args: &[TypeSlot]) -> FuncSignature {
		let mut sig = FuncSignature::new(CallConv::from_tag(""), NO_VAR_ARGS, ret);
		for &a in args {
			sig.push_arg(a);
		}
		sig
	}

	extern "C" fn mix(a: i32, b: f64, c: u64) -> f64 {
		a as f64 + b * 3.0 + c as f64
	}

	#[test]
	fn test_call_scalar_target() {
		let rt = JitRuntime::new();
		let sig = host_sig(TypeSlot::Double, &[TypeSlot::Int32, TypeSlot::Double, TypeSlot::UInt64]);
		let mut call = JitCall::new(&rt);
		let f = call.generate(&sig, mix as usize, WaitType::None, false).unwrap();

		let params = [7u64, 2.5f64.to_bits(), 40];
		let mut ret = [0u64; 2];
		unsafe { f(params.as_ptr(), ret.as_mut_ptr()) };
		assert_eq!(f64::from_bits(ret[0]), 7.0 + 7.5 + 40.0);
		assert_eq!(call.target(), mix as usize);
	}

	extern "C" fn sum10(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64, g: u64, h: u64, i: u64, j: u64) -> u64 {
		a + b + c + d + e + f + g + h + i + j
	}

	#[test]
	fn test_call_stack_arguments() {
		let rt = JitRuntime::new();
		let sig = host_sig(TypeSlot::UInt64, &[TypeSlot::UInt64; 10]);
		let mut call = JitCall::new(&rt);
		let f = call.generate(&sig, sum10 as usize, WaitType::None, false).unwrap();

		let params: Vec<u64> = (1..=10).collect();
		let mut ret = [0u64; 2];
		unsafe { f(params.as_ptr(), ret.as_mut_ptr()) };
		assert_eq!(ret[0], 55);
	}

	extern "C" fn narrow() -> u8 {
		0xAB
	}

	#[test]
	fn test_narrow_return_is_widened() {
		let rt = JitRuntime::new();
		let sig = host_sig(TypeSlot::UInt8, &[]);
		let mut call = JitCall::new(&rt);
		let f = call.generate(&sig, narrow as usize, WaitType::None, false).unwrap();

		// poison the slot so stale high bits would show
		let mut ret = [0xFFFF_FFFF_FFFF_FFFFu64; 2];
		unsafe { f(std::ptr::null(), ret.as_mut_ptr()) };
		assert_eq!(ret[0], 0xAB);
	}

	extern "C" fn negate(v: i8) -> i8 {
		-v
	}

	#[test]
	fn test_signed_return_is_sign_extended() {
		let rt = JitRuntime::new();
		let mut sig = host_sig(TypeSlot::Int8, &[TypeSlot::Int8]);
		sig.ret = TypeSlot::Int8;
		let mut call = JitCall::new(&rt);
		let f = call.generate(&sig, negate as usize, WaitType::None, false).unwrap();

		let params = [5u64];
		let mut ret = [0u64; 2];
		unsafe { f(params.as_ptr(), ret.as_mut_ptr()) };
		assert_eq!(ret[0] as i64, -5);
	}

	#[test]
	fn test_void_zero_arg_roundtrip() {
		static HIT: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
		extern "C" fn touch() {
			HIT.store(true, std::sync::atomic::Ordering::SeqCst);
		}

		let rt = JitRuntime::new();
		let sig = host_sig(TypeSlot::Void, &[]);
		let mut call = JitCall::new(&rt);
		let f = call.generate(&sig, touch as usize, WaitType::None, false).unwrap();
		unsafe { f(std::ptr::null(), std::ptr::null_mut()) };
		assert!(HIT.load(std::sync::atomic::Ordering::SeqCst));
	}

	unsafe extern "C" fn blend_handler(
		_method: *const std::os::raw::c_void,
		_data: *mut std::os::raw::c_void,
		params: *const u64,
		_count: u8,
		ret: *mut u64,
	) {
		let a = *params as i32;
		let b = f32::from_bits(*params.add(1) as u32);
		let c = *params.add(2) as i64;
		let result = a as f64 + b as f64 * 2.0 + c as f64;
		*ret = result.to_bits();
	}

	/// call(S, callback(S, H)) must agree with H applied directly.
	#[test]
	fn test_two_direction_roundtrip() {
		let rt = JitRuntime::new();
		let sig = host_sig(TypeSlot::Double, &[TypeSlot::Int32, TypeSlot::Float, TypeSlot::Pointer]);

		let mut cb = JitCallback::new(&rt);
		let native = cb.generate(&sig, 0, blend_handler, 0, false).unwrap();

		let mut call = JitCall::new(&rt);
		let f = call.generate(&sig, native.as_usize(), WaitType::None, false).unwrap();

		let params = [3u64, (4.0f32).to_bits() as u64, 0xABCD];
		let mut ret = [0u64; 2];
		unsafe { f(params.as_ptr(), ret.as_mut_ptr()) };

		let mut direct = [0u64; 2];
		unsafe { blend_handler(std::ptr::null(), std::ptr::null_mut(), params.as_ptr(), 3, direct.as_mut_ptr()) };

		assert_eq!(ret[0], direct[0]);
		assert_eq!(f64::from_bits(ret[0]), 11.0 + 0xABCD as f64);
	}

	unsafe extern "C" fn fill_vec4_handler(
		_method: *const std::os::raw::c_void,
		_data: *mut std::os::raw::c_void,
		params: *const u64,
		_count: u8,
		ret: *mut u64,
	) {
		let scale = *params as u32 as f32;
		let out = ret as *mut f32;
		for i in 0..4 {
			*out.add(i) = scale * (i + 1) as f32;
		}
	}

	/// Memory returns travel slot 0 in both directions and meet in the
	/// middle.
	#[test]
	fn test_hidden_roundtrip() {
		let rt = JitRuntime::new();
		let sig = host_sig(TypeSlot::Pointer, &[TypeSlot::Pointer, TypeSlot::UInt32]);

		let mut cb = JitCallback::new(&rt);
		let native = cb.generate(&sig, 0, fill_vec4_handler, 0, true).unwrap();

		let mut call = JitCall::new(&rt);
		let f = call.generate(&sig, native.as_usize(), WaitType::None, true).unwrap();

		let mut out = [0.0f32; 4];
		let params = [&mut out as *mut _ as u64, 2];
		let mut ret = [0u64; 2];
		unsafe { f(params.as_ptr(), ret.as_mut_ptr()) };

		assert_eq!(out, [2.0, 4.0, 6.0, 8.0]);
		// the destination pointer comes back through the return slot
		assert_eq!(ret[0], &mut out as *mut _ as u64);
	}

	#[cfg(unix)]
	#[test]
	fn test_variadic_target() {
		use std::os::raw::{c_char, c_int};
		extern "C" {
			fn snprintf(buf: *mut c_char, n: usize, fmt: *const c_char, ...) -> c_int;
		}

		let rt = JitRuntime::new();
		let mut sig = FuncSignature::new(CallConv::from_tag(""), 3, TypeSlot::Int32);
		sig.push_arg(TypeSlot::Pointer)
			.push_arg(TypeSlot::UInt64)
			.push_arg(TypeSlot::Pointer)
			.push_arg(TypeSlot::Double);

		let mut call = JitCall::new(&rt);
		let f = call.generate(&sig, snprintf as usize, WaitType::None, false).unwrap();

		let mut buf = [0u8; 32];
		let fmt = b"%g\0";
		let params = [
			buf.as_mut_ptr() as u64,
			buf.len() as u64,
			fmt.as_ptr() as u64,
			2.5f64.to_bits(),
		];
		let mut ret = [0u64; 2];
		unsafe { f(params.as_ptr(), ret.as_mut_ptr()) };

		let written = &buf[..ret[0] as usize];
		assert_eq!(written, b"2.5");
	}
}
