//! Manifest parser collaborator. The engine only sees the trait; the default
//! implementation reads the TOML form.

use std::path::Path;

use crate::manifest::{Manifest, PackageKind};

pub trait ManifestParser: Send + Sync {
	/// Parses manifest bytes into the model, shape-validating for `kind`.
	/// The origin path is for error messages only.
	fn parse(&self, bytes: &[u8], origin: &Path, kind: PackageKind) -> Result<Manifest, String>;
}

#[derive(Debug, Default)]
pub struct TomlManifestParser;

impl ManifestParser for TomlManifestParser {
	fn parse(&self, bytes: &[u8], origin: &Path, kind: PackageKind) -> Result<Manifest, String> {
		let text = std::str::from_utf8(bytes)
			.map_err(|e| format!("{}: manifest is not utf-8: {}", origin.display(), e))?;
		let manifest: Manifest = toml::from_str(text)
			.map_err(|e| format!("{}: {}", origin.display(), e))?;
		manifest
			.validate(kind)
			.map_err(|e| format!("{}: {}", origin.display(), e))?;
		Ok(manifest)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_reports_origin() {
		let parser = TomlManifestParser;
		let err = parser
			.parse(b"not = [valid", Path::new("exts/broken.pplugin"), PackageKind::Plugin)
			.unwrap_err();
		assert!(err.contains("broken.pplugin"));
	}

	#[test]
	fn test_parse_minimal_module() {
		let parser = TomlManifestParser;
		let m = parser
			.parse(
				b"name = \"lang\"\nversion = \"1.0.0\"\nlanguage = \"py\"\nruntime = \"libpy.so\"\n",
				Path::new("lang.pmodule"),
				PackageKind::Module,
			)
			.unwrap();
		assert_eq!(m.name, "lang");
	}

	#[test]
	fn test_shape_error_is_invalid_manifest() {
		let parser = TomlManifestParser;
		// missing entry makes a plugin manifest invalid even though the toml parses
		let err = parser
			.parse(
				b"name = \"p\"\nversion = \"1.0.0\"\nlanguage = \"py\"\n",
				Path::new("p.pplugin"),
				PackageKind::Plugin,
			)
			.unwrap_err();
		assert!(err.contains("entry"));
	}
}
