//! The type vocabulary of the bridge: every parameter and return value of
//! every exported method is one [`ValueType`]. Methods and properties form a
//! DAG within one manifest (function-pointer properties reference further
//! method prototypes), hence the shared ownership.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Closed tag set for bridged values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
	Invalid,
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
	Function,
	String,
	Any,
	ArrayBool,
	ArrayChar8,
	ArrayChar16,
	ArrayInt8,
	ArrayInt16,
	ArrayInt32,
	ArrayInt64,
	ArrayUInt8,
	ArrayUInt16,
	ArrayUInt32,
	ArrayUInt64,
	ArrayPointer,
	ArrayFloat,
	ArrayDouble,
	ArrayString,
	ArrayAny,
	Vector2,
	Vector3,
	Vector4,
	Matrix4x4,
}

impl ValueType {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Invalid => "invalid",
			Self::Void => "void",
			Self::Bool => "bool",
			Self::Char8 => "char8",
			Self::Char16 => "char16",
			Self::Int8 => "int8",
			Self::Int16 => "int16",
			Self::Int32 => "int32",
			Self::Int64 => "int64",
			Self::UInt8 => "uint8",
			Self::UInt16 => "uint16",
			Self::UInt32 => "uint32",
			Self::UInt64 => "uint64",
			Self::Pointer => "ptr64",
			Self::Float => "float",
			Self::Double => "double",
			Self::Function => "function",
			Self::String => "string",
			Self::Any => "any",
			Self::ArrayBool => "bool[]",
			Self::ArrayChar8 => "char8[]",
			Self::ArrayChar16 => "char16[]",
			Self::ArrayInt8 => "int8[]",
			Self::ArrayInt16 => "int16[]",
			Self::ArrayInt32 => "int32[]",
			Self::ArrayInt64 => "int64[]",
			Self::ArrayUInt8 => "uint8[]",
			Self::ArrayUInt16 => "uint16[]",
			Self::ArrayUInt32 => "uint32[]",
			Self::ArrayUInt64 => "uint64[]",
			Self::ArrayPointer => "ptr64[]",
			Self::ArrayFloat => "float[]",
			Self::ArrayDouble => "double[]",
			Self::ArrayString => "string[]",
			Self::ArrayAny => "any[]",
			Self::Vector2 => "vec2",
			Self::Vector3 => "vec3",
			Self::Vector4 => "vec4",
			Self::Matrix4x4 => "mat4x4",
		}
	}

	pub fn from_str(s: &str) -> Self {
		match s {
			"void" => Self::Void,
			"bool" => Self::Bool,
			"char8" => Self::Char8,
			"char16" => Self::Char16,
			"int8" => Self::Int8,
			"int16" => Self::Int16,
			"int32" => Self::Int32,
			"int64" => Self::Int64,
			"uint8" => Self::UInt8,
			"uint16" => Self::UInt16,
			"uint32" => Self::UInt32,
			"uint64" => Self::UInt64,
			"ptr64" => Self::Pointer,
			"float" => Self::Float,
			"double" => Self::Double,
			"function" => Self::Function,
			"string" => Self::String,
			"any" => Self::Any,
			"bool[]" => Self::ArrayBool,
			"char8[]" => Self::ArrayChar8,
			"char16[]" => Self::ArrayChar16,
			"int8[]" => Self::ArrayInt8,
			"int16[]" => Self::ArrayInt16,
			"int32[]" => Self::ArrayInt32,
			"int64[]" => Self::ArrayInt64,
			"uint8[]" => Self::ArrayUInt8,
			"uint16[]" => Self::ArrayUInt16,
			"uint32[]" => Self::ArrayUInt32,
			"uint64[]" => Self::ArrayUInt64,
			"ptr64[]" => Self::ArrayPointer,
			"float[]" => Self::ArrayFloat,
			"double[]" => Self::ArrayDouble,
			"string[]" => Self::ArrayString,
			"any[]" => Self::ArrayAny,
			"vec2" => Self::Vector2,
			"vec3" => Self::Vector3,
			"vec4" => Self::Vector4,
			"mat4x4" => Self::Matrix4x4,
			_ => Self::Invalid,
		}
	}

	/// Primitive integer types that may carry an enum annotation.
	pub fn is_integral(&self) -> bool {
		matches!(
			self,
			Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64
				| Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64
		)
	}

	pub fn is_array(&self) -> bool {
		matches!(
			self,
			Self::ArrayBool | Self::ArrayChar8 | Self::ArrayChar16
				| Self::ArrayInt8 | Self::ArrayInt16 | Self::ArrayInt32 | Self::ArrayInt64
				| Self::ArrayUInt8 | Self::ArrayUInt16 | Self::ArrayUInt32 | Self::ArrayUInt64
				| Self::ArrayPointer | Self::ArrayFloat | Self::ArrayDouble
				| Self::ArrayString | Self::ArrayAny
		)
	}

	pub fn is_vector(&self) -> bool {
		matches!(self, Self::Vector2 | Self::Vector3 | Self::Vector4)
	}

	/// Reference types that always cross the bridge as a pointer to
	/// caller-allocated storage.
	pub fn is_object(&self) -> bool {
		self.is_array() || matches!(self, Self::String | Self::Any | Self::Matrix4x4)
	}
}

impl Serialize for ValueType {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}
impl<'de> Deserialize<'de> for ValueType {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		let v = Self::from_str(&s);
		if v == Self::Invalid {
			return Err(serde::de::Error::custom(format!("unknown value type '{}'", s)));
		}
		Ok(v)
	}
}

// POD types matching the bridge's fixed vector layouts.

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
	pub x: f32,
	pub y: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
	pub x: f32,
	pub y: f32,
	pub z: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec4 {
	pub x: f32,
	pub y: f32,
	pub z: f32,
	pub w: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Mat4x4 {
	pub rows: [Vec4; 4],
}

/// One named constant of an [`Enum`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
	pub name: String,
	pub value: i64,
}

/// A named-constant annotation on an integral property. The runtime treats
/// the value as its underlying integer; the names survive for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enum {
	pub name: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub values: Vec<EnumValue>,
}

/// Parameter or return descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
	#[serde(rename = "type")]
	pub value_type: ValueType,
	#[serde(default, rename = "ref", skip_serializing_if = "std::ops::Not::not")]
	pub is_reference: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub prototype: Option<Arc<Method>>,
	#[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
	pub enum_info: Option<Arc<Enum>>,
}

impl Property {
	pub fn plain(value_type: ValueType) -> Self {
		Self {
			value_type,
			is_reference: false,
			prototype: None,
			enum_info: None,
		}
	}
}

fn default_var_index() -> u8 {
	Method::NO_VAR_ARGS
}

fn is_default_var_index(v: &u8) -> bool {
	*v == Method::NO_VAR_ARGS
}

fn void_return() -> Property {
	Property::plain(ValueType::Void)
}

/// A named, typed entry point in an extension's surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
	pub name: String,
	#[serde(default, rename = "funcName", skip_serializing_if = "String::is_empty")]
	pub function_name: String,
	#[serde(default, rename = "callConv", skip_serializing_if = "String::is_empty")]
	pub calling_convention: String,
	#[serde(
		default = "default_var_index",
		rename = "varIndex",
		skip_serializing_if = "is_default_var_index"
	)]
	pub var_index: u8,
	#[serde(default, rename = "paramTypes", skip_serializing_if = "Vec::is_empty")]
	pub params: Vec<Property>,
	#[serde(default = "void_return", rename = "retType")]
	pub ret: Property,
}

impl Method {
	/// Parameters past this index are variadic; the sentinel means none are.
	pub const NO_VAR_ARGS: u8 = u8::MAX;

	pub fn is_variadic(&self) -> bool {
		self.var_index != Self::NO_VAR_ARGS
	}

	/// Recursive search of this method's parameter and return prototypes.
	pub fn find_prototype(&self, name: &str) -> Option<Arc<Method>> {
		let probe = |p: &Property| {
			p.prototype.as_ref().and_then(|proto| {
				if proto.name == name {
					Some(proto.clone())
				} else {
					proto.find_prototype(name)
				}
			})
		};
		self.params.iter().find_map(probe).or_else(|| probe(&self.ret))
	}

	/// Shape check done once at parse time: function-pointer properties must
	/// carry a prototype, enum annotations only sit on integral types.
	pub fn validate(&self) -> Result<(), String> {
		for (i, p) in self.params.iter().chain(std::iter::once(&self.ret)).enumerate() {
			if p.value_type == ValueType::Function && p.prototype.is_none() {
				return Err(format!(
					"method '{}': function parameter {} has no prototype",
					self.name, i
				));
			}
			if p.enum_info.is_some() && !p.value_type.is_integral() && !p.value_type.is_array() {
				return Err(format!(
					"method '{}': enum annotation on non-integral parameter {}",
					self.name, i
				));
			}
			if let Some(proto) = &p.prototype {
				proto.validate()?;
			}
		}
		Ok(())
	}
}

/// Availability of the optional lifecycle entry points, reported by a
/// language module. Crosses the native ABI, hence the layout pin.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodTable {
	pub has_update: bool,
	pub has_start: bool,
	pub has_end: bool,
	pub has_export: bool,
}
