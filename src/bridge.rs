//! Glue between the method model and the JIT signature model: slot class
//! selection, the hidden-return predicate, and trampoline construction for
//! exported methods.

use std::sync::Arc;

use plugify_assembly::MemAddr;
use plugify_jit::{CallConv, CallbackHandler, FuncSignature, JitCall, JitCallback, JitRuntime, TypeSlot, WaitType};

use crate::error::Error;
use crate::method::{Method, Property, ValueType};

/// Slot class of a value in parameter position. Everything that does not fit
/// one slot travels as a pointer to caller-allocated storage.
fn param_slot(property: &Property) -> TypeSlot {
	if property.is_reference {
		return TypeSlot::Pointer;
	}
	match property.value_type {
		ValueType::Bool => TypeSlot::Bool,
		ValueType::Char8 => TypeSlot::Char8,
		ValueType::Char16 => TypeSlot::Char16,
		ValueType::Int8 => TypeSlot::Int8,
		ValueType::Int16 => TypeSlot::Int16,
		ValueType::Int32 => TypeSlot::Int32,
		ValueType::Int64 => TypeSlot::Int64,
		ValueType::UInt8 => TypeSlot::UInt8,
		ValueType::UInt16 => TypeSlot::UInt16,
		ValueType::UInt32 => TypeSlot::UInt32,
		ValueType::UInt64 => TypeSlot::UInt64,
		ValueType::Float => TypeSlot::Float,
		ValueType::Double => TypeSlot::Double,
		ValueType::Void | ValueType::Invalid => TypeSlot::Void,
		// pointer, function, string, any, arrays, vectors, matrices
		_ => TypeSlot::Pointer,
	}
}

/// Slot class in return position, before hidden lowering.
fn return_slot(property: &Property) -> TypeSlot {
	if property.is_reference {
		return TypeSlot::Pointer;
	}
	match property.value_type {
		ValueType::Vector2 => TypeSlot::Vec2F,
		ValueType::Vector3 => TypeSlot::Vec3F,
		ValueType::Vector4 => TypeSlot::Vec4F,
		_ => param_slot(property),
	}
}

/// Whether the native ABI returns this type through memory. Strings, arrays,
/// variants and matrices always do; Win64 additionally spills the wide float
/// vectors.
pub fn is_hidden_return(value_type: ValueType) -> bool {
	if value_type.is_object() {
		return true;
	}
	cfg!(all(windows, target_arch = "x86_64"))
		&& matches!(value_type, ValueType::Vector3 | ValueType::Vector4)
}

/// Lowers a method descriptor to the native signature the emitters consume.
/// Returns the signature and whether the return went hidden (in which case
/// the destination pointer has been prepended as argument zero).
pub fn build_signature(method: &Method) -> (FuncSignature, bool) {
	let conv = CallConv::from_tag(&method.calling_convention);
	let hidden = !method.ret.is_reference && is_hidden_return(method.ret.value_type);

	let ret = if hidden {
		TypeSlot::Pointer
	} else {
		return_slot(&method.ret)
	};

	let mut sig = FuncSignature::new(conv, method.var_index, ret);
	if hidden {
		sig.push_arg(TypeSlot::Pointer);
	}
	for param in &method.params {
		sig.push_arg(param_slot(param));
	}
	(sig, hidden)
}

/// Generates a native-ABI entry for one exported method: callers use the
/// method's real C signature, the language module sees its uniform handler
/// with `data` (typically the extension-side target) passed through.
pub fn export_callback(
	rt: &Arc<JitRuntime>,
	method: &Arc<Method>,
	handler: CallbackHandler,
	data: MemAddr,
) -> Result<(JitCallback, MemAddr), Error> {
	let (sig, hidden) = build_signature(method);
	let mut callback = JitCallback::new(rt);
	let entry = callback.generate(&sig, Arc::as_ptr(method) as usize, handler, data.as_usize(), hidden)?;
	Ok((callback, MemAddr::new(entry.as_usize())))
}

/// Generates the reverse direction: a uniform `fn(params, ret)` wrapper
/// around a native target, used by language modules to call host exports.
pub fn import_call(
	rt: &Arc<JitRuntime>,
	method: &Method,
	target: MemAddr,
	wait: WaitType,
) -> Result<JitCall, Error> {
	let (sig, hidden) = build_signature(method);
	let mut call = JitCall::new(rt);
	call.generate(&sig, target.as_usize(), wait, hidden)?;
	Ok(call)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::method::Property;

	fn method_of(params: Vec<Property>, ret: Property) -> Method {
		Method {
			name: "m".into(),
			function_name: String::new(),
			calling_convention: String::new(),
			var_index: Method::NO_VAR_ARGS,
			params,
			ret,
		}
	}

	#[test]
	fn test_objects_become_pointer_params() {
		let m = method_of(
			vec![
				Property::plain(ValueType::String),
				Property::plain(ValueType::Vector4),
				Property::plain(ValueType::ArrayInt32),
				Property::plain(ValueType::Float),
			],
			Property::plain(ValueType::Void),
		);
		let (sig, hidden) = build_signature(&m);
		assert!(!hidden);
		assert_eq!(sig.args[0], TypeSlot::Pointer);
		assert_eq!(sig.args[1], TypeSlot::Pointer);
		assert_eq!(sig.args[2], TypeSlot::Pointer);
		assert_eq!(sig.args[3], TypeSlot::Float);
	}

	#[test]
	fn test_hidden_return_prepends_pointer() {
		let m = method_of(vec![Property::plain(ValueType::Int32)], Property::plain(ValueType::String));
		let (sig, hidden) = build_signature(&m);
		assert!(hidden);
		assert_eq!(sig.ret, TypeSlot::Pointer);
		assert_eq!(sig.args.len(), 2);
		assert_eq!(sig.args[0], TypeSlot::Pointer);
		assert_eq!(sig.args[1], TypeSlot::Int32);
	}

	#[test]
	fn test_reference_return_is_not_hidden() {
		let mut ret = Property::plain(ValueType::String);
		ret.is_reference = true;
		let m = method_of(vec![], ret);
		let (sig, hidden) = build_signature(&m);
		assert!(!hidden);
		assert_eq!(sig.ret, TypeSlot::Pointer);
		assert!(sig.args.is_empty());
	}

	#[test]
	fn test_vector_returns_stay_by_value() {
		let m = method_of(vec![], Property::plain(ValueType::Vector2));
		let (sig, hidden) = build_signature(&m);
		assert!(!hidden);
		assert_eq!(sig.ret, TypeSlot::Vec2F);

		let m = method_of(vec![], Property::plain(ValueType::Vector4));
		let (sig, hidden) = build_signature(&m);
		// hidden only on win64
		if cfg!(all(windows, target_arch = "x86_64")) {
			assert!(hidden);
		} else {
			assert!(!hidden);
			assert_eq!(sig.ret, TypeSlot::Vec4F);
		}
	}

	#[test]
	fn test_matrix_always_hidden() {
		let m = method_of(vec![], Property::plain(ValueType::Matrix4x4));
		let (_, hidden) = build_signature(&m);
		assert!(hidden);
	}
}
