//! The context object handed to language modules: logging, directory layout,
//! loader hints and read-only lookups against the engine. Lookups take the
//! registry read lock and are safe from extension-spawned threads; mutation
//! stays with the engine.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::path::PathBuf;
use std::sync::Weak;

use crate::config::Config;
use crate::extension::UniqueId;
use crate::logging::{Logger, Severity};
use crate::registry::{ExtensionSnapshot, Registry};
use crate::version::Constraint;

pub struct Provider {
	config: Config,
	logger: std::sync::Arc<dyn Logger>,
	registry: Weak<parking_lot::RwLock<Registry>>,
	// stable nul-terminated copies for the native vtable
	c_base: CString,
	c_configs: CString,
	c_data: CString,
	c_logs: CString,
}

impl Provider {
	pub(crate) fn new(
		config: Config,
		logger: std::sync::Arc<dyn Logger>,
		registry: Weak<parking_lot::RwLock<Registry>>,
	) -> Self {
		let c_of = |p: PathBuf| CString::new(p.to_string_lossy().into_owned()).unwrap_or_default();
		Self {
			c_base: c_of(config.base_dir()),
			c_configs: c_of(config.configs_dir()),
			c_data: c_of(config.data_dir()),
			c_logs: c_of(config.logs_dir()),
			config,
			logger,
			registry,
		}
	}

	pub fn log(&self, msg: &str, severity: Severity) {
		self.logger.log(msg, severity);
	}

	pub fn base_dir(&self) -> PathBuf {
		self.config.base_dir()
	}

	pub fn configs_dir(&self) -> PathBuf {
		self.config.configs_dir()
	}

	pub fn data_dir(&self) -> PathBuf {
		self.config.data_dir()
	}

	pub fn logs_dir(&self) -> PathBuf {
		self.config.logs_dir()
	}

	pub fn cache_dir(&self) -> PathBuf {
		self.config.cache_dir()
	}

	/// Hint that extensions should load their native libraries with
	/// deep-bound symbol resolution.
	pub fn prefer_own_symbols(&self) -> bool {
		self.config.prefer_own_symbols()
	}

	pub fn find_extension(&self, name: &str) -> Option<ExtensionSnapshot> {
		let registry = self.registry.upgrade()?;
		let guard = registry.read();
		guard.find_by_name(name).map(|e| guard.snapshot(e.id())).flatten()
	}

	pub fn find_extension_by_id(&self, id: UniqueId) -> Option<ExtensionSnapshot> {
		self.registry.upgrade()?.read().snapshot(id)
	}

	/// Whether a named extension is loaded (or further along), optionally
	/// under a version constraint.
	pub fn is_extension_loaded(&self, name: &str, constraint: Option<&Constraint>) -> bool {
		let Some(registry) = self.registry.upgrade() else {
			return false;
		};
		let guard = registry.read();
		let Some(extension) = guard.find_by_name(name) else {
			return false;
		};
		if !extension.state().is_loaded() {
			return false;
		}
		match (constraint, extension.version()) {
			(Some(c), Some(v)) => c.satisfies(v),
			(Some(_), None) => false,
			(None, _) => true,
		}
	}

	/// The C vtable equivalent of this provider, for native modules.
	pub(crate) fn native_api(self: &std::sync::Arc<Self>) -> ProviderApi {
		ProviderApi {
			ctx: std::sync::Arc::as_ptr(self) as *const c_void,
			log: api_log,
			get_base_dir: api_base_dir,
			get_configs_dir: api_configs_dir,
			get_data_dir: api_data_dir,
			get_logs_dir: api_logs_dir,
			prefer_own_symbols: api_prefer_own_symbols,
			is_extension_loaded: api_is_extension_loaded,
		}
	}
}

/// Function-pointer table handed to native language modules. `ctx` is the
/// provider and must be passed back on every call; strings are owned by the
/// provider and stay valid for its lifetime.
#[repr(C)]
pub struct ProviderApi {
	pub ctx: *const c_void,
	pub log: unsafe extern "C" fn(*const c_void, *const c_char, u8),
	pub get_base_dir: unsafe extern "C" fn(*const c_void) -> *const c_char,
	pub get_configs_dir: unsafe extern "C" fn(*const c_void) -> *const c_char,
	pub get_data_dir: unsafe extern "C" fn(*const c_void) -> *const c_char,
	pub get_logs_dir: unsafe extern "C" fn(*const c_void) -> *const c_char,
	pub prefer_own_symbols: unsafe extern "C" fn(*const c_void) -> bool,
	pub is_extension_loaded: unsafe extern "C" fn(*const c_void, *const c_char) -> bool,
}

unsafe fn provider_of<'a>(ctx: *const c_void) -> &'a Provider {
	&*(ctx as *const Provider)
}

unsafe extern "C" fn api_log(ctx: *const c_void, msg: *const c_char, severity: u8) {
	if msg.is_null() {
		return;
	}
	let severity = match severity {
		1 => Severity::Fatal,
		2 => Severity::Error,
		3 => Severity::Warning,
		4 => Severity::Info,
		5 => Severity::Debug,
		6 => Severity::Verbose,
		_ => Severity::None,
	};
	provider_of(ctx).log(&CStr::from_ptr(msg).to_string_lossy(), severity);
}

unsafe extern "C" fn api_base_dir(ctx: *const c_void) -> *const c_char {
	provider_of(ctx).c_base.as_ptr()
}

unsafe extern "C" fn api_configs_dir(ctx: *const c_void) -> *const c_char {
	provider_of(ctx).c_configs.as_ptr()
}

unsafe extern "C" fn api_data_dir(ctx: *const c_void) -> *const c_char {
	provider_of(ctx).c_data.as_ptr()
}

unsafe extern "C" fn api_logs_dir(ctx: *const c_void) -> *const c_char {
	provider_of(ctx).c_logs.as_ptr()
}

unsafe extern "C" fn api_prefer_own_symbols(ctx: *const c_void) -> bool {
	provider_of(ctx).prefer_own_symbols()
}

unsafe extern "C" fn api_is_extension_loaded(ctx: *const c_void, name: *const c_char) -> bool {
	if name.is_null() {
		return false;
	}
	let name = CStr::from_ptr(name).to_string_lossy();
	provider_of(ctx).is_extension_loaded(&name, None)
}
