//! Signature model consumed by the emitters. Deliberately independent of any
//! richer type system: by the time a call reaches the bridge, every argument
//! is one of these slot classes.

use smallvec::SmallVec;

/// Sentinel for "not variadic".
pub const NO_VAR_ARGS: u8 = u8::MAX;

/// Slot class of one argument or return value.
///
/// Vector classes are only legal in return position; as parameters those
/// values travel by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSlot {
	Void,
	Bool,
	Char8,
	Char16,
	Int8,
	Int16,
	Int32,
	Int64,
	UInt8,
	UInt16,
	UInt32,
	UInt64,
	Pointer,
	Float,
	Double,
	/// Two packed floats, 8 bytes.
	Vec2F,
	/// Three packed floats, 12 bytes in a 16-byte return buffer.
	Vec3F,
	/// Four packed floats, 16 bytes.
	Vec4F,
}

impl TypeSlot {
	/// General-purpose register class.
	pub fn is_int(&self) -> bool {
		matches!(
			self,
			Self::Bool
				| Self::Char8 | Self::Char16
				| Self::Int8 | Self::Int16
				| Self::Int32 | Self::Int64
				| Self::UInt8 | Self::UInt16
				| Self::UInt32 | Self::UInt64
				| Self::Pointer
		)
	}

	/// Scalar floating register class.
	pub fn is_float(&self) -> bool {
		matches!(self, Self::Float | Self::Double)
	}

	pub fn is_vector(&self) -> bool {
		matches!(self, Self::Vec2F | Self::Vec3F | Self::Vec4F)
	}

	/// Whether a return of this class needs the two-slot return buffer.
	pub fn is_wide_return(&self) -> bool {
		matches!(self, Self::Vec3F | Self::Vec4F)
	}
}

/// Calling convention tag. Only the 64-bit conventions generate code; the
/// 32-bit tags exist so manifests naming them get a clean error rather than a
/// parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
	/// Whatever `extern "C"` means on the build target.
	Host,
	SysV64,
	Win64,
	Vectorcall,
	Cdecl,
	Stdcall,
	Fastcall,
	Thiscall,
	SoftFloat,
	HardFloat,
}

impl CallConv {
	/// Maps a manifest convention string to the convention actually used on
	/// the build target. Unknown or empty strings select the host default;
	/// targets that fix their convention ignore the string entirely.
	pub fn from_tag(tag: &str) -> Self {
		if cfg!(all(target_arch = "x86_64", windows)) {
			if tag == "vectorcall" {
				Self::Vectorcall
			} else {
				Self::Win64
			}
		} else if cfg!(target_arch = "x86_64") {
			Self::SysV64
		} else if cfg!(target_arch = "aarch64") {
			Self::Host
		} else {
			// 32-bit style string dispatch; the emitters reject these
			// targets anyway
			match tag {
				"cdecl" => Self::Cdecl,
				"stdcall" => Self::Stdcall,
				"fastcall" => Self::Fastcall,
				"thiscall" => Self::Thiscall,
				"vectorcall" => Self::Vectorcall,
				"soft" => Self::SoftFloat,
				"hard" => Self::HardFloat,
				_ => Self::Host,
			}
		}
	}
}

/// A native function shape: convention, variadic split point, return class
/// and argument classes. When the return is hidden-pointer lowered, the
/// builder has already prepended the pointer argument and rewritten the
/// return class to `Pointer`.
#[derive(Debug, Clone)]
pub struct FuncSignature {
	pub conv: CallConv,
	pub var_index: u8,
	pub ret: TypeSlot,
	pub args: SmallVec<[TypeSlot; 8]>,
}

impl FuncSignature {
	pub fn new(conv: CallConv, var_index: u8, ret: TypeSlot) -> Self {
		Self {
			conv,
			var_index,
			ret,
			args: SmallVec::new(),
		}
	}

	pub fn push_arg(&mut self, slot: TypeSlot) -> &mut Self {
		self.args.push(slot);
		self
	}

	pub fn arg_count(&self) -> usize {
		self.args.len()
	}

	pub fn is_variadic(&self) -> bool {
		self.var_index != NO_VAR_ARGS
	}

	pub fn has_ret(&self) -> bool {
		self.ret != TypeSlot::Void
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_slot_classes() {
		assert!(TypeSlot::Pointer.is_int());
		assert!(TypeSlot::Bool.is_int());
		assert!(!TypeSlot::Float.is_int());
		assert!(TypeSlot::Double.is_float());
		assert!(TypeSlot::Vec3F.is_vector());
		assert!(TypeSlot::Vec3F.is_wide_return());
		assert!(!TypeSlot::Vec2F.is_wide_return());
	}

	#[test]
	fn test_variadic_flag() {
		let mut sig = FuncSignature::new(CallConv::Host, NO_VAR_ARGS, TypeSlot::Void);
		assert!(!sig.is_variadic());
		sig.var_index = 1;
		sig.push_arg(TypeSlot::Pointer).push_arg(TypeSlot::Int32);
		assert!(sig.is_variadic());
		assert_eq!(sig.arg_count(), 2);
	}
}
