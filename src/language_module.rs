//! The seam between the engine and a language host. Internally everything is
//! the [`LanguageModule`] trait; [`NativeLanguageModule`] adapts a loadable
//! library exposing the C entry points to it. Tests (and embedders that link
//! their language host into the process) implement the trait directly.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use plugify_assembly::{Assembly, MemAddr};
use plugify_jit::CallbackHandler;
use semver::Version;

use crate::config::ExtensionDirs;
use crate::error::Error;
use crate::extension::UniqueId;
use crate::method::{Method, MethodTable};
use crate::provider::{Provider, ProviderApi};

/// Read-only description of an extension, passed into module callbacks.
/// Snapshots, not references: callbacks run without any engine lock held.
#[derive(Debug, Clone)]
pub struct ExtensionInfo {
	pub id: UniqueId,
	pub name: String,
	pub version: Version,
	pub language: String,
	pub entry: Option<String>,
	pub location: PathBuf,
	pub dirs: ExtensionDirs,
	pub methods: Vec<Arc<Method>>,
	pub user_data: MemAddr,
}

/// What a module reports back from a successful plugin load.
#[derive(Debug, Default)]
pub struct LoadData {
	/// Exported method name to extension-side address.
	pub methods: Vec<(String, MemAddr)>,
	pub user_data: MemAddr,
	pub table: MethodTable,
}

pub trait LanguageModule: Send {
	fn initialize(&mut self, provider: Arc<Provider>, module: &ExtensionInfo) -> Result<MethodTable, String>;
	fn shutdown(&mut self);
	fn on_update(&mut self, _dt: Duration) {}

	fn on_plugin_load(&mut self, plugin: &ExtensionInfo) -> Result<LoadData, String>;
	fn on_plugin_start(&mut self, _plugin: &ExtensionInfo) {}
	fn on_plugin_update(&mut self, _plugin: &ExtensionInfo, _dt: Duration) {}
	fn on_plugin_end(&mut self, _plugin: &ExtensionInfo) {}
	fn on_method_export(&mut self, _plugin: &ExtensionInfo) {}

	/// The module's uniform dispatch handler. When present, exported method
	/// addresses are treated as handler data and wrapped in callback
	/// trampolines; when absent they are published as native entry points
	/// as-is.
	fn callback_handler(&self) -> Option<CallbackHandler> {
		None
	}

	fn is_debug_build(&self) -> bool {
		false
	}
}

// --- native ABI ---

#[repr(C)]
struct InitResultFfi {
	ok: bool,
	table: MethodTable,
	error: *const c_char,
}

#[repr(C)]
struct MethodExportFfi {
	name: *const c_char,
	addr: *mut c_void,
}

#[repr(C)]
struct LoadResultFfi {
	ok: bool,
	methods: *const MethodExportFfi,
	method_count: usize,
	user_data: *mut c_void,
	table: MethodTable,
	error: *const c_char,
}

/// The plugin view crossing the C boundary. Strings are owned by the caller
/// and valid only for the duration of the call.
#[repr(C)]
struct PluginHandleFfi {
	id: u64,
	name: *const c_char,
	entry: *const c_char,
	user_data: *mut c_void,
}

type InitFn = unsafe extern "C" fn(*const ProviderApi, u64) -> InitResultFfi;
type ShutdownFn = unsafe extern "C" fn();
type UpdateFn = unsafe extern "C" fn(f64);
type PluginLoadFn = unsafe extern "C" fn(*const PluginHandleFfi) -> LoadResultFfi;
type PluginFn = unsafe extern "C" fn(*const PluginHandleFfi);
type PluginUpdateFn = unsafe extern "C" fn(*const PluginHandleFfi, f64);
type IsDebugFn = unsafe extern "C" fn() -> bool;
type GetHandlerFn = unsafe extern "C" fn() -> CallbackHandler;

/// A language host implemented as a loadable native library.
pub struct NativeLanguageModule {
	assembly: Arc<Assembly>,
	// the vtable must keep a stable address for as long as the module lives
	api: Option<Box<ProviderApi>>,
	_provider: Option<Arc<Provider>>,

	initialise: InitFn,
	shutdown_fn: ShutdownFn,
	plugin_load: PluginLoadFn,
	update: Option<UpdateFn>,
	plugin_start: Option<PluginFn>,
	plugin_update: Option<PluginUpdateFn>,
	plugin_end: Option<PluginFn>,
	method_export: Option<PluginFn>,
	is_debug: Option<IsDebugFn>,
	get_handler: Option<GetHandlerFn>,
}

// The entry points are required to be callable from the engine thread; the
// struct only crosses threads as part of engine teardown.
unsafe impl Send for NativeLanguageModule {}

impl NativeLanguageModule {
	/// Resolves the module ABI from a mapped assembly. `initialise`,
	/// `shutdown` and `on_plugin_load` are mandatory, the rest optional.
	pub fn new(assembly: Arc<Assembly>) -> Result<Self, Error> {
		unsafe fn cast<T: Copy>(addr: MemAddr) -> T {
			std::mem::transmute_copy::<usize, T>(&addr.as_usize())
		}

		let required = |name: &str| {
			assembly
				.get_symbol(name)
				.map_err(|e| Error::InitializationFailed(e.to_string()))
		};

		let initialise = unsafe { cast::<InitFn>(required("initialise")?) };
		let shutdown_fn = unsafe { cast::<ShutdownFn>(required("shutdown")?) };
		let plugin_load = unsafe { cast::<PluginLoadFn>(required("on_plugin_load")?) };
		let update = assembly.try_get_symbol("on_update").map(|a| unsafe { cast::<UpdateFn>(a) });
		let plugin_start = assembly.try_get_symbol("on_plugin_start").map(|a| unsafe { cast::<PluginFn>(a) });
		let plugin_update = assembly
			.try_get_symbol("on_plugin_update")
			.map(|a| unsafe { cast::<PluginUpdateFn>(a) });
		let plugin_end = assembly.try_get_symbol("on_plugin_end").map(|a| unsafe { cast::<PluginFn>(a) });
		let method_export = assembly
			.try_get_symbol("on_method_export")
			.map(|a| unsafe { cast::<PluginFn>(a) });
		let is_debug = assembly.try_get_symbol("is_debug_build").map(|a| unsafe { cast::<IsDebugFn>(a) });
		let get_handler = assembly
			.try_get_symbol("get_callback_handler")
			.map(|a| unsafe { cast::<GetHandlerFn>(a) });

		Ok(Self {
			initialise,
			shutdown_fn,
			plugin_load,
			update,
			plugin_start,
			plugin_update,
			plugin_end,
			method_export,
			is_debug,
			get_handler,
			assembly,
			api: None,
			_provider: None,
		})
	}

	pub fn assembly(&self) -> &Arc<Assembly> {
		&self.assembly
	}

	fn plugin_ffi(plugin: &ExtensionInfo, name: &CString, entry: &CString) -> PluginHandleFfi {
		PluginHandleFfi {
			id: plugin.id.0,
			name: name.as_ptr(),
			entry: entry.as_ptr(),
			user_data: plugin.user_data.as_ptr(),
		}
	}

	fn cstrings_of(plugin: &ExtensionInfo) -> (CString, CString) {
		(
			CString::new(plugin.name.as_str()).unwrap_or_default(),
			CString::new(plugin.entry.as_deref().unwrap_or("")).unwrap_or_default(),
		)
	}
}

unsafe fn error_string(ptr: *const c_char) -> String {
	if ptr.is_null() {
		"unknown error".into()
	} else {
		CStr::from_ptr(ptr).to_string_lossy().into_owned()
	}
}

impl LanguageModule for NativeLanguageModule {
	fn initialize(&mut self, provider: Arc<Provider>, module: &ExtensionInfo) -> Result<MethodTable, String> {
		let api = Box::new(provider.native_api());
		let result = unsafe { (self.initialise)(&*api, module.id.0) };
		self.api = Some(api);
		self._provider = Some(provider);

		if result.ok {
			Ok(result.table)
		} else {
			Err(unsafe { error_string(result.error) })
		}
	}

	fn shutdown(&mut self) {
		unsafe { (self.shutdown_fn)() };
		self.api = None;
		self._provider = None;
	}

	fn on_update(&mut self, dt: Duration) {
		if let Some(update) = self.update {
			unsafe { update(dt.as_secs_f64() * 1000.0) };
		}
	}

	fn on_plugin_load(&mut self, plugin: &ExtensionInfo) -> Result<LoadData, String> {
		let (name, entry) = Self::cstrings_of(plugin);
		let ffi = Self::plugin_ffi(plugin, &name, &entry);
		let result = unsafe { (self.plugin_load)(&ffi) };

		if !result.ok {
			return Err(unsafe { error_string(result.error) });
		}

		let mut methods = Vec::with_capacity(result.method_count);
		for i in 0..result.method_count {
			let export = unsafe { &*result.methods.add(i) };
			let method_name = unsafe { CStr::from_ptr(export.name) }.to_string_lossy().into_owned();
			methods.push((method_name, MemAddr::from(export.addr)));
		}

		Ok(LoadData {
			methods,
			user_data: MemAddr::from(result.user_data),
			table: result.table,
		})
	}

	fn on_plugin_start(&mut self, plugin: &ExtensionInfo) {
		if let Some(start) = self.plugin_start {
			let (name, entry) = Self::cstrings_of(plugin);
			unsafe { start(&Self::plugin_ffi(plugin, &name, &entry)) };
		}
	}

	fn on_plugin_update(&mut self, plugin: &ExtensionInfo, dt: Duration) {
		if let Some(update) = self.plugin_update {
			let (name, entry) = Self::cstrings_of(plugin);
			unsafe { update(&Self::plugin_ffi(plugin, &name, &entry), dt.as_secs_f64() * 1000.0) };
		}
	}

	fn on_plugin_end(&mut self, plugin: &ExtensionInfo) {
		if let Some(end) = self.plugin_end {
			let (name, entry) = Self::cstrings_of(plugin);
			unsafe { end(&Self::plugin_ffi(plugin, &name, &entry)) };
		}
	}

	fn on_method_export(&mut self, plugin: &ExtensionInfo) {
		if let Some(export) = self.method_export {
			let (name, entry) = Self::cstrings_of(plugin);
			unsafe { export(&Self::plugin_ffi(plugin, &name, &entry)) };
		}
	}

	fn callback_handler(&self) -> Option<CallbackHandler> {
		self.get_handler.map(|get| unsafe { get() })
	}

	fn is_debug_build(&self) -> bool {
		self.is_debug.map(|f| unsafe { f() }).unwrap_or(false)
	}
}
