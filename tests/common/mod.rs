//! Shared fixtures: an in-process language module recording everything that
//! happens to it, a module loader that hands those out instead of touching
//! the dynamic linker, and manifest writers for on-disk extension trees.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plugify::{
	Assembly, AssemblyLoader, Config, Error, ExtensionInfo, LanguageModule, LoadData, MemAddr,
	MethodTable, ModuleLoader, Plugify,
};

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> EventLog {
	Arc::new(Mutex::new(Vec::new()))
}

pub fn events_of(log: &EventLog) -> Vec<String> {
	log.lock().unwrap().clone()
}

/// A language host living inside the test process.
pub struct TestModule {
	name: String,
	events: EventLog,
	fail_init: bool,
	fail_plugins: Vec<String>,
	export: bool,
}

fn push(log: &EventLog, event: String) {
	log.lock().unwrap().push(event);
}

impl LanguageModule for TestModule {
	fn initialize(&mut self, _provider: Arc<plugify::Provider>, module: &ExtensionInfo) -> Result<MethodTable, String> {
		push(&self.events, format!("init {}", module.name));
		if self.fail_init {
			return Err(format!("module '{}' refused to initialise", module.name));
		}
		Ok(MethodTable { has_update: true, ..Default::default() })
	}

	fn shutdown(&mut self) {
		push(&self.events, format!("shutdown {}", self.name));
	}

	fn on_update(&mut self, _dt: Duration) {
		push(&self.events, format!("update {}", self.name));
	}

	fn on_plugin_load(&mut self, plugin: &ExtensionInfo) -> Result<LoadData, String> {
		push(&self.events, format!("load {}", plugin.name));
		if self.fail_plugins.iter().any(|p| p == &plugin.name) {
			return Err(format!("plugin '{}' rejected", plugin.name));
		}
		Ok(LoadData {
			methods: plugin
				.methods
				.iter()
				.map(|m| (m.name.clone(), MemAddr::new(0x1000 + m.name.len())))
				.collect(),
			user_data: MemAddr::new(0xDA7A),
			table: MethodTable {
				has_update: true,
				has_start: true,
				has_end: true,
				has_export: self.export,
			},
		})
	}

	fn on_plugin_start(&mut self, plugin: &ExtensionInfo) {
		push(&self.events, format!("start {}", plugin.name));
	}

	fn on_plugin_update(&mut self, plugin: &ExtensionInfo, _dt: Duration) {
		push(&self.events, format!("update {}", plugin.name));
	}

	fn on_plugin_end(&mut self, plugin: &ExtensionInfo) {
		push(&self.events, format!("end {}", plugin.name));
	}

	fn on_method_export(&mut self, plugin: &ExtensionInfo) {
		push(&self.events, format!("export {}", plugin.name));
	}

	fn callback_handler(&self) -> Option<plugify::CallbackHandler> {
		self.export.then_some(blend_handler as plugify::CallbackHandler)
	}
}

/// Uniform handler used by export tests: params[0] + params[1] * 2 +
/// params[2], as a double.
pub unsafe extern "C" fn blend_handler(
	_method: *const std::os::raw::c_void,
	_data: *mut std::os::raw::c_void,
	params: *const u64,
	_count: u8,
	ret: *mut u64,
) {
	let a = *params as i32;
	let b = f32::from_bits(*params.add(1) as u32);
	let c = *params.add(2) as i64;
	*ret = (a as f64 + b as f64 * 2.0 + c as f64).to_bits();
}

/// Injectable loader producing [`TestModule`]s instead of dlopening.
#[derive(Default)]
pub struct TestModuleLoader {
	pub events: EventLog,
	pub fail_init: Vec<String>,
	pub fail_plugins: Vec<String>,
	pub export: bool,
}

impl TestModuleLoader {
	pub fn new(events: EventLog) -> Self {
		Self { events, ..Default::default() }
	}
}

impl ModuleLoader for TestModuleLoader {
	fn load(
		&mut self,
		module: &ExtensionInfo,
		_runtime_path: &Path,
		_loader: &Arc<AssemblyLoader>,
		_flags: plugify::BitFlags<plugify::LoadFlag>,
	) -> Result<(Box<dyn LanguageModule>, Option<Arc<Assembly>>), Error> {
		let test_module = TestModule {
			name: module.name.clone(),
			events: self.events.clone(),
			fail_init: self.fail_init.iter().any(|m| m == &module.name),
			fail_plugins: self.fail_plugins.clone(),
			export: self.export,
		};
		Ok((Box::new(test_module), None))
	}
}

// --- on-disk fixtures ---

pub fn write_module_manifest(dir: &Path, name: &str, language: &str) {
	let text = format!(
		"name = \"{}\"\nversion = \"1.0.0\"\nlanguage = \"{}\"\nruntime = \"lib{}.so\"\n",
		name, language, name
	);
	std::fs::write(dir.join(format!("{}.pmodule", name)), text).unwrap();
}

pub fn write_plugin_manifest(dir: &Path, name: &str, language: &str, version: &str, extra: &str) {
	let text = format!(
		"name = \"{}\"\nversion = \"{}\"\nlanguage = \"{}\"\nentry = \"{}_main\"\n{}",
		name, version, language, name, extra
	);
	std::fs::write(dir.join(format!("{}.pplugin", name)), text).unwrap();
}

/// A workspace with an extensions dir and a plugify instance wired to the
/// fake module loader.
pub fn host_with(loader: TestModuleLoader, setup: impl FnOnce(&Path)) -> (tempfile::TempDir, Plugify) {
	let _ = env_logger::builder().is_test(true).try_init();

	let dir = tempfile::tempdir().unwrap();
	let extensions = dir.path().join("extensions");
	std::fs::create_dir_all(&extensions).unwrap();
	setup(&extensions);

	let mut plugify = Plugify::new(Config::with_base_dir(dir.path()));
	plugify.manager_mut().set_module_loader(Box::new(loader));
	(dir, plugify)
}
