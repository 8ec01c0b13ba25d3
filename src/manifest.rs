//! The on-disk descriptor of an extension. Plugin and module manifests share
//! the common fields; the file extension picks the kind and decides which of
//! the kind-specific fields are required.

use std::path::{Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::method::Method;
use crate::version::{Conflict, Dependency, Obsolete};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageKind {
	Plugin,
	Module,
}

impl PackageKind {
	pub fn file_extension(&self) -> &'static str {
		match self {
			Self::Plugin => "pplugin",
			Self::Module => "pmodule",
		}
	}

	pub fn from_path(path: &Path) -> Option<Self> {
		match path.extension()?.to_str()? {
			"pplugin" => Some(Self::Plugin),
			"pmodule" => Some(Self::Module),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
	pub name: String,
	pub version: Version,
	pub language: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub author: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub website: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub license: Option<String>,

	/// `os_arch` patterns with `*` wildcards; empty means everywhere.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub platforms: Vec<String>,

	// plugin-only entry point
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub entry: Option<String>,

	// module-only native library and extra search paths
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub runtime: Option<PathBuf>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub directories: Vec<PathBuf>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub dependencies: Vec<Dependency>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub conflicts: Vec<Conflict>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub obsoletes: Vec<Obsolete>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub methods: Vec<Method>,
}

impl Manifest {
	/// Kind-aware shape validation, run right after parsing.
	pub fn validate(&self, kind: PackageKind) -> Result<(), String> {
		if self.name.is_empty() {
			return Err("manifest has an empty name".into());
		}
		if self.language.is_empty() {
			return Err(format!("manifest '{}' has an empty language", self.name));
		}
		match kind {
			PackageKind::Plugin => {
				if self.entry.as_deref().unwrap_or("").is_empty() {
					return Err(format!("plugin '{}' declares no entry point", self.name));
				}
				if self.runtime.is_some() {
					return Err(format!("plugin '{}' declares a module runtime", self.name));
				}
			}
			PackageKind::Module => {
				if self.runtime.is_none() {
					return Err(format!("module '{}' declares no runtime library", self.name));
				}
				if self.entry.is_some() || !self.methods.is_empty() {
					return Err(format!("module '{}' declares plugin fields", self.name));
				}
			}
		}
		for method in &self.methods {
			method.validate()?;
		}
		Ok(())
	}

	pub fn supports_platform(&self, platform: &str) -> bool {
		if self.platforms.is_empty() {
			return true;
		}
		self.platforms.iter().any(|p| platform_matches(p, platform))
	}
}

/// The `os_arch` string of the running host.
pub fn current_platform() -> String {
	format!("{}_{}", current_os(), current_arch())
}

fn current_os() -> &'static str {
	#[cfg(target_os = "linux")]
	return "linux";
	#[cfg(target_os = "macos")]
	return "macos";
	#[cfg(target_os = "windows")]
	return "windows";
	#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
	return "unknown";
}

fn current_arch() -> &'static str {
	#[cfg(target_arch = "x86_64")]
	return "x64";
	#[cfg(target_arch = "x86")]
	return "x86";
	#[cfg(target_arch = "aarch64")]
	return "arm64";
	#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
	return "unknown";
}

/// Matches `pattern` (with `*` wildcard segments) against an `os_arch`
/// string. A bare `*` matches everything.
fn platform_matches(pattern: &str, platform: &str) -> bool {
	if pattern == "*" {
		return true;
	}
	let (pos, parch) = match pattern.split_once('_') {
		Some(p) => p,
		None => return false,
	};
	let (os, arch) = match platform.split_once('_') {
		Some(p) => p,
		None => return false,
	};
	(pos == "*" || pos == os) && (parch == "*" || parch == arch)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn plugin_toml() -> &'static str {
		r#"
			name = "hello"
			version = "1.0.0"
			language = "py"
			entry = "hello_main"

			[[dependencies]]
			name = "core"
			constraints = [{ op = "^", version = "1.2.0" }]

			[[methods]]
			name = "greet"
			funcName = "hello_greet"
			paramTypes = [{ type = "string" }]
			retType = { type = "void" }
		"#
	}

	#[test]
	fn test_plugin_manifest_parses() {
		let m: Manifest = toml::from_str(plugin_toml()).unwrap();
		m.validate(PackageKind::Plugin).unwrap();
		assert_eq!(m.name, "hello");
		assert_eq!(m.version, Version::new(1, 0, 0));
		assert_eq!(m.dependencies[0].name, "core");
		assert_eq!(m.methods.len(), 1);
	}

	#[test]
	fn test_parse_serialize_parse_is_identity() {
		let m: Manifest = toml::from_str(plugin_toml()).unwrap();
		let out = toml::to_string(&m).unwrap();
		let again: Manifest = toml::from_str(&out).unwrap();
		assert_eq!(m, again);
	}

	#[test]
	fn test_kind_validation() {
		let m: Manifest = toml::from_str(plugin_toml()).unwrap();
		// a plugin manifest in a module file is a shape error
		assert!(m.validate(PackageKind::Module).is_err());

		let module: Manifest = toml::from_str(
			r#"
				name = "lang"
				version = "0.3.0"
				language = "py"
				runtime = "libpy.so"
			"#,
		)
		.unwrap();
		module.validate(PackageKind::Module).unwrap();
		assert!(module.validate(PackageKind::Plugin).is_err());
	}

	#[test]
	fn test_platform_wildcards() {
		assert!(platform_matches("*", "linux_x64"));
		assert!(platform_matches("linux_*", "linux_x64"));
		assert!(platform_matches("*_x64", "windows_x64"));
		assert!(platform_matches("linux_x64", "linux_x64"));
		assert!(!platform_matches("windows_*", "linux_x64"));
		assert!(!platform_matches("*_arm64", "linux_x64"));
		assert!(!platform_matches("linux", "linux_x64"));
	}

	#[test]
	fn test_kind_from_path() {
		assert_eq!(PackageKind::from_path(Path::new("a/b/hello.pplugin")), Some(PackageKind::Plugin));
		assert_eq!(PackageKind::from_path(Path::new("lang.pmodule")), Some(PackageKind::Module));
		assert_eq!(PackageKind::from_path(Path::new("readme.md")), None);
	}
}
