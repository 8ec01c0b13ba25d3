//! Runtime configuration: where things live on disk and how native libraries
//! get loaded. Layered; later sources override earlier ones only where they
//! actually set something.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Priority of a configuration layer, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
	Default,
	File,
	Override,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub base_dir: Option<PathBuf>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub extensions_dir: Option<PathBuf>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub configs_dir: Option<PathBuf>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data_dir: Option<PathBuf>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub logs_dir: Option<PathBuf>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadingConfig {
	/// Hint that extensions should resolve their own symbols first
	/// (`DeepBind` on loaders that support it).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub prefer_own_symbols: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub paths: PathsConfig,
	#[serde(default)]
	pub loading: LoadingConfig,
}

impl Config {
	pub fn with_base_dir(base: impl Into<PathBuf>) -> Self {
		Self {
			paths: PathsConfig {
				base_dir: Some(base.into()),
				..Default::default()
			},
			..Default::default()
		}
	}

	pub fn from_toml(text: &str) -> Result<Self, String> {
		toml::from_str(text).map_err(|e| e.to_string())
	}

	pub fn from_file(path: &Path) -> Result<Self, String> {
		let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
		Self::from_toml(&text)
	}

	/// Takes every field `other` actually set. Matches the layering rule:
	/// call in ascending [`ConfigSource`] order.
	pub fn merge_from(&mut self, other: &Config, _source: ConfigSource) {
		macro_rules! take {
			($($field:ident).+) => {
				if other.$($field).+.is_some() {
					self.$($field).+ = other.$($field).+.clone();
				}
			};
		}
		take!(paths.base_dir);
		take!(paths.extensions_dir);
		take!(paths.configs_dir);
		take!(paths.data_dir);
		take!(paths.logs_dir);
		take!(paths.cache_dir);
		take!(loading.prefer_own_symbols);
	}

	pub fn base_dir(&self) -> PathBuf {
		self.paths.base_dir.clone().unwrap_or_else(|| PathBuf::from("."))
	}

	fn dir_or(&self, custom: &Option<PathBuf>, default_name: &str) -> PathBuf {
		match custom {
			Some(p) if p.is_absolute() => p.clone(),
			Some(p) => self.base_dir().join(p),
			None => self.base_dir().join(default_name),
		}
	}

	pub fn extensions_dir(&self) -> PathBuf {
		self.dir_or(&self.paths.extensions_dir, "extensions")
	}

	pub fn configs_dir(&self) -> PathBuf {
		self.dir_or(&self.paths.configs_dir, "configs")
	}

	pub fn data_dir(&self) -> PathBuf {
		self.dir_or(&self.paths.data_dir, "data")
	}

	pub fn logs_dir(&self) -> PathBuf {
		self.dir_or(&self.paths.logs_dir, "logs")
	}

	pub fn cache_dir(&self) -> PathBuf {
		self.dir_or(&self.paths.cache_dir, "cache")
	}

	pub fn prefer_own_symbols(&self) -> bool {
		self.loading.prefer_own_symbols.unwrap_or(false)
	}

	/// Directory layout handed to one extension.
	pub fn dirs_for(&self, extension_name: &str, location: &Path) -> ExtensionDirs {
		ExtensionDirs {
			base: location.to_path_buf(),
			configs: self.configs_dir().join(extension_name),
			data: self.data_dir().join(extension_name),
			logs: self.logs_dir().join(extension_name),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtensionDirs {
	pub base: PathBuf,
	pub configs: PathBuf,
	pub data: PathBuf,
	pub logs: PathBuf,
}
