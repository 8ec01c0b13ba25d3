//! Plugify is a language-polyglot plugin runtime: it discovers extensions on
//! disk, loads them in dependency order under versioned constraints, and
//! bridges calls between languages at native speed through JIT-generated
//! trampolines.
//!
//! The host drives everything through [`Plugify`]: configure paths and a
//! logger, `initialize`, pump `update`, and `terminate`. Language hosts are
//! loadable native libraries (or in-process [`LanguageModule`]
//! implementations) that load and run the user's plugins.

use std::sync::Arc;
use std::time::Duration;

#[macro_use]
extern crate log;

mod bridge;
mod config;
mod error;
mod extension;
mod fs;
mod language_module;
mod logging;
mod manager;
mod manifest;
mod method;
mod parser;
mod provider;
mod registry;
mod services;
mod version;

pub use bridge::{build_signature, export_callback, import_call, is_hidden_return};
pub use config::{Config, ConfigSource, ExtensionDirs, LoadingConfig, PathsConfig};
pub use error::Error;
pub use extension::{MethodData, PackageState, UniqueId};
pub use fs::{DirIterOptions, FileSystem, StandardFileSystem};
pub use language_module::{ExtensionInfo, LanguageModule, LoadData, NativeLanguageModule};
pub use logging::{Logger, Severity, StdLogger};
pub use manager::{Manager, ModuleLoader, NativeModuleLoader};
pub use manifest::{current_platform, Manifest, PackageKind};
pub use method::{Enum, EnumValue, Mat4x4, Method, MethodTable, Property, ValueType, Vec2, Vec3, Vec4};
pub use parser::{ManifestParser, TomlManifestParser};
pub use provider::{Provider, ProviderApi};
pub use registry::ExtensionSnapshot;
pub use services::{ServiceError, ServiceLifetime, ServiceLocator, ServiceScope};
pub use version::{Constraint, ConstraintOp, Dependency, Conflict, Obsolete};

pub use plugify_assembly::{Assembly, AssemblyError, AssemblyLoader, BitFlags, LoadFlag, MemAddr};
pub use plugify_jit::{
	CallConv, CallbackHandler, FuncSignature, JitCall, JitCallback, JitError, JitRuntime, TypeSlot,
	WaitType,
};
pub use semver::Version;

pub mod prelude {
	pub use crate::{
		Config, Error, ExtensionSnapshot, LanguageModule, Manager, Manifest, Method, PackageKind,
		PackageState, Plugify, Provider, Severity, UniqueId, ValueType,
	};
}

/// The runtime context: a [`Manager`] plus the shared services and the bits
/// of configuration the host set up.
pub struct Plugify {
	manager: Manager,
	services: Arc<ServiceLocator>,
	config: Config,
}

impl Plugify {
	pub fn new(config: Config) -> Self {
		Self::with_logger(config, Arc::new(StdLogger))
	}

	pub fn with_logger(config: Config, logger: Arc<dyn Logger>) -> Self {
		let manager = Manager::new(config.clone(), logger);
		Self {
			manager,
			services: Arc::new(ServiceLocator::new()),
			config,
		}
	}

	/// Discovers, resolves, loads and starts every extension. `true` on the
	/// first call, `false` on any later one.
	pub fn initialize(&mut self) -> Result<bool, Error> {
		self.manager.initialize()
	}

	pub fn is_initialized(&self) -> bool {
		self.manager.is_initialized()
	}

	/// One host tick, fanned out to modules then plugins in dependency
	/// order. Engine-thread only.
	pub fn update(&mut self, dt: Duration) {
		self.manager.update(dt);
	}

	/// Reverse-order teardown; safe to call at any time, idempotent.
	pub fn terminate(&mut self) {
		self.manager.terminate();
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn manager(&self) -> &Manager {
		&self.manager
	}

	pub fn manager_mut(&mut self) -> &mut Manager {
		&mut self.manager
	}

	pub fn services(&self) -> &Arc<ServiceLocator> {
		&self.services
	}

	pub fn provider(&self) -> Arc<Provider> {
		self.manager.provider()
	}

	pub fn get_extension(&self, name: &str) -> Option<ExtensionSnapshot> {
		self.manager.get_extension(name)
	}

	pub fn get_extensions(&self) -> Vec<ExtensionSnapshot> {
		self.manager.get_extensions()
	}

	/// The runtime's own version.
	pub fn version() -> Version {
		Version::parse(env!("CARGO_PKG_VERSION")).expect("cargo always hands out semver")
	}
}

impl Drop for Plugify {
	fn drop(&mut self) {
		self.manager.terminate();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_version_is_semver() {
		assert!(Plugify::version().major <= 1);
	}

	#[test]
	fn test_empty_directory_initializes() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("extensions")).unwrap();
		let mut plugify = Plugify::new(Config::with_base_dir(dir.path()));
		assert!(plugify.initialize().unwrap());
		assert!(plugify.get_extensions().is_empty());
		assert!(!plugify.initialize().unwrap());
		plugify.terminate();
		plugify.terminate();
	}
}
