//! The lifecycle engine: discovery, parsing, resolution, deterministic
//! ordering, loading, the per-frame fan-out and teardown.
//!
//! Locking rule: the registry write guard is only ever held for short
//! bookkeeping scopes, never across a language-module callback. Callbacks
//! get snapshots ([`ExtensionInfo`]) and their results are committed
//! afterwards, so provider lookups from inside a callback (or from a thread
//! an extension spawned) can always take the read lock.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use enumflags2::BitFlags;
use parking_lot::RwLock;
use plugify_assembly::{Assembly, AssemblyLoader, LoadFlag};
use plugify_jit::JitRuntime;
use rustc_hash::FxHashMap;
use semver::Version;

use crate::bridge;
use crate::config::Config;
use crate::error::Error;
use crate::extension::{Extension, MethodData, PackageState, UniqueId};
use crate::fs::{DirIterOptions, FileSystem, StandardFileSystem};
use crate::language_module::{ExtensionInfo, LanguageModule, NativeLanguageModule};
use crate::logging::Logger;
use crate::manifest::{current_platform, PackageKind};
use crate::parser::{ManifestParser, TomlManifestParser};
use crate::provider::Provider;
use crate::registry::{ExtensionSnapshot, Registry, SharedRegistry};

/// Loads the native host library behind a module manifest. Injectable so
/// tests (or embedders with statically linked hosts) can substitute their
/// own modules.
pub trait ModuleLoader: Send {
	fn load(
		&mut self,
		module: &ExtensionInfo,
		runtime_path: &Path,
		loader: &Arc<AssemblyLoader>,
		flags: BitFlags<LoadFlag>,
	) -> Result<(Box<dyn LanguageModule>, Option<Arc<Assembly>>), Error>;
}

/// The default loader: map the runtime library, resolve the C entry points.
#[derive(Debug, Default)]
pub struct NativeModuleLoader;

impl ModuleLoader for NativeModuleLoader {
	fn load(
		&mut self,
		_module: &ExtensionInfo,
		runtime_path: &Path,
		loader: &Arc<AssemblyLoader>,
		flags: BitFlags<LoadFlag>,
	) -> Result<(Box<dyn LanguageModule>, Option<Arc<Assembly>>), Error> {
		let assembly = loader.load(runtime_path, flags)?;
		let module = NativeLanguageModule::new(assembly.clone())?;
		Ok((Box::new(module), Some(assembly)))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	New,
	Initialized,
	Terminated,
}

pub struct Manager {
	config: Config,
	platform: String,
	fs: Arc<dyn FileSystem>,
	parser: Arc<dyn ManifestParser>,
	assembly_loader: Arc<AssemblyLoader>,
	jit: Arc<JitRuntime>,
	registry: SharedRegistry,
	provider: Arc<Provider>,
	modules: FxHashMap<UniqueId, Box<dyn LanguageModule>>,
	module_loader: Box<dyn ModuleLoader>,
	next_id: u64,
	phase: Phase,
}

impl Manager {
	pub fn new(config: Config, logger: Arc<dyn Logger>) -> Self {
		let registry: SharedRegistry = Arc::new(RwLock::new(Registry::default()));
		let provider = Arc::new(Provider::new(config.clone(), logger, Arc::downgrade(&registry)));
		Self {
			platform: current_platform(),
			fs: Arc::new(StandardFileSystem),
			parser: Arc::new(TomlManifestParser),
			assembly_loader: Arc::new(AssemblyLoader::new()),
			jit: JitRuntime::new(),
			registry,
			provider,
			modules: FxHashMap::default(),
			module_loader: Box::new(NativeModuleLoader),
			next_id: 0,
			config,
			phase: Phase::New,
		}
	}

	// injection seams, effective before `initialize`

	pub fn set_file_system(&mut self, fs: Arc<dyn FileSystem>) {
		self.fs = fs;
	}

	pub fn set_manifest_parser(&mut self, parser: Arc<dyn ManifestParser>) {
		self.parser = parser;
	}

	pub fn set_module_loader(&mut self, loader: Box<dyn ModuleLoader>) {
		self.module_loader = loader;
	}

	/// Overrides the platform string used by the resolution filter.
	pub fn set_platform(&mut self, platform: impl Into<String>) {
		self.platform = platform.into();
	}

	pub fn provider(&self) -> Arc<Provider> {
		self.provider.clone()
	}

	pub fn assembly_loader(&self) -> Arc<AssemblyLoader> {
		self.assembly_loader.clone()
	}

	pub fn jit_runtime(&self) -> Arc<JitRuntime> {
		self.jit.clone()
	}

	pub fn is_initialized(&self) -> bool {
		self.phase == Phase::Initialized
	}

	// --- the driving operations ---

	/// Runs discovery through start. Returns `Ok(true)` on the first call,
	/// `Ok(false)` on any later one. A failure leaves already-loaded
	/// extensions functional; `terminate` is safe regardless.
	pub fn initialize(&mut self) -> Result<bool, Error> {
		if self.phase != Phase::New {
			return Ok(false);
		}

		info!("Initializing for platform '{}'", self.platform);
		self.discover()?;
		self.parse_all();
		self.resolve_all();
		self.load_all();
		self.start_all();
		self.phase = Phase::Initialized;

		let registry = self.registry.read();
		info!(
			"Initialized: {} extensions, {} in load order",
			registry.len(),
			registry.load_order.len()
		);
		Ok(true)
	}

	/// Fans one tick out to every live module, then every live plugin,
	/// dependency order both times.
	pub fn update(&mut self, dt: Duration) {
		if self.phase != Phase::Initialized {
			return;
		}

		let order = self.registry.read().load_order.clone();

		for &id in &order {
			if !self.is_updatable(id, PackageKind::Module) {
				continue;
			}
			if let Some(module) = self.modules.get_mut(&id) {
				self.registry.write().get_mut(id).unwrap().begin_operation(PackageState::Updating);
				let result = catch_unwind(AssertUnwindSafe(|| module.on_update(dt)));
				self.commit_update_result(id, result);
			}
		}

		for &id in &order {
			if !self.is_updatable(id, PackageKind::Plugin) {
				continue;
			}
			let info = self.info_of(id);
			let Some(owner) = self.owner_of(id) else { continue };
			if let Some(module) = self.modules.get_mut(&owner) {
				self.registry.write().get_mut(id).unwrap().begin_operation(PackageState::Updating);
				let result = catch_unwind(AssertUnwindSafe(|| module.on_plugin_update(&info, dt)));
				self.commit_update_result(id, result);
			}
		}
	}

	/// Reverse-order teardown. Idempotent, and legal in any phase.
	pub fn terminate(&mut self) {
		if self.phase == Phase::Terminated {
			return;
		}
		info!("Terminating");

		let order: Vec<UniqueId> = self.registry.read().load_order.iter().rev().copied().collect();

		// plugins first
		for &id in &order {
			let Some(info) = self.plugin_end_info(id) else { continue };
			let has_end = {
				let registry = self.registry.read();
				registry.get(id).map(|e| e.method_table.has_end).unwrap_or(false)
			};
			self.registry.write().get_mut(id).unwrap().begin_operation(PackageState::Ending);
			if has_end {
				if let Some(owner) = self.owner_of(id) {
					if let Some(module) = self.modules.get_mut(&owner) {
						if catch_unwind(AssertUnwindSafe(|| module.on_plugin_end(&info))).is_err() {
							warn!("'{}' panicked in its end callback", info.name);
						}
					}
				}
			}
			let mut registry = self.registry.write();
			let extension = registry.get_mut(id).unwrap();
			extension.end_operation(PackageState::Ended);
		}

		// then the modules that hosted them
		for &id in &order {
			if let Some(mut module) = self.modules.remove(&id) {
				if catch_unwind(AssertUnwindSafe(|| module.shutdown())).is_err() {
					warn!("module {} panicked in shutdown", id);
				}
			}
		}
		self.modules.clear();

		// release native resources and settle every state
		{
			let mut registry = self.registry.write();
			for extension in registry.iter_mut() {
				extension.callbacks.clear();
				extension.method_data.clear();
				extension.assembly = None;
				if extension.state() != PackageState::Terminated {
					extension.transition(PackageState::Terminated);
				}
			}
		}
		self.assembly_loader.prune();
		self.phase = Phase::Terminated;
	}

	// --- queries ---

	pub fn get_extension(&self, name: &str) -> Option<ExtensionSnapshot> {
		let registry = self.registry.read();
		let id = registry.find_by_name(name)?.id();
		registry.snapshot(id)
	}

	pub fn get_extension_by_id(&self, id: UniqueId) -> Option<ExtensionSnapshot> {
		self.registry.read().snapshot(id)
	}

	pub fn get_extensions(&self) -> Vec<ExtensionSnapshot> {
		self.registry.read().snapshots()
	}

	pub fn load_order(&self) -> Vec<UniqueId> {
		self.registry.read().load_order.clone()
	}

	/// Extensions with errors, load order first, the rest in discovery
	/// order, formatted for a diagnostic dump.
	pub fn report(&self) -> String {
		let registry = self.registry.read();
		let mut lines = Vec::new();
		let mut seen = BTreeSet::new();
		let ordered = registry
			.load_order
			.iter()
			.copied()
			.chain(registry.iter().map(|e| e.id()))
			.collect::<Vec<_>>();
		for id in ordered {
			if !seen.insert(id) {
				continue;
			}
			if let Some(extension) = registry.get(id) {
				if extension.has_errors() {
					lines.push(format!(
						"'{}' [{}]: {}",
						extension.name(),
						extension.state().as_str(),
						extension.errors().collect::<Vec<_>>().join("; ")
					));
				}
			}
		}
		lines.join("\n")
	}

	/// Per-extension state timing dump, discovery order.
	pub fn performance_report(&self) -> String {
		let registry = self.registry.read();
		registry
			.iter()
			.map(|e| e.performance_report())
			.collect::<Vec<_>>()
			.join("\n")
	}

	pub fn print_report(&self) {
		let report = self.report();
		if report.is_empty() {
			info!("All extensions healthy");
		} else {
			for line in report.lines() {
				error!("{}", line);
			}
		}
	}

	// --- phases ---

	fn discover(&mut self) -> Result<(), Error> {
		let dir = self.config.extensions_dir();
		if !self.fs.is_directory(&dir) {
			warn!("Extensions directory {:?} does not exist", dir);
			return Ok(());
		}

		let options = DirIterOptions {
			extensions: vec![
				PackageKind::Plugin.file_extension().to_string(),
				PackageKind::Module.file_extension().to_string(),
			],
			..Default::default()
		};
		let manifests = self.fs.iterate_dir(&dir, &options).map_err(Error::ValidationFailed)?;

		let mut registry = self.registry.write();
		for path in manifests {
			let Some(kind) = PackageKind::from_path(&path) else {
				continue;
			};
			let id = UniqueId(self.next_id);
			self.next_id += 1;
			let mut extension = Extension::new(id, kind, path);
			extension.transition(PackageState::Discovered);
			debug!("Discovered {:?} '{}' as {}", kind, extension.name(), id);
			registry.insert(extension);
		}
		Ok(())
	}

	fn parse_all(&mut self) {
		let ids = self.registry.read().ids();
		for id in ids {
			let path = {
				let mut registry = self.registry.write();
				let extension = registry.get_mut(id).unwrap();
				extension.begin_operation(PackageState::Parsing);
				extension.location().to_path_buf()
			};
			let kind = self.registry.read().get(id).unwrap().kind();

			let parsed = self
				.fs
				.read_bytes(&path)
				.and_then(|bytes| self.parser.parse(&bytes, &path, kind));

			let mut registry = self.registry.write();
			let extension = registry.get_mut(id).unwrap();
			match parsed {
				Ok(manifest) => {
					extension.install_manifest(manifest);
					let dirs = self.config.dirs_for(
						&extension.name().to_string(),
						extension.location().parent().unwrap_or(Path::new(".")),
					);
					extension.dirs = dirs;
					extension.end_operation(PackageState::Parsed);
				}
				Err(e) => {
					extension.add_error(Error::InvalidManifest(e).to_string());
					extension.end_operation(PackageState::Corrupted);
				}
			}
		}
	}

	fn resolve_all(&mut self) {
		let outcomes = self.compute_resolution();

		let mut registry = self.registry.write();
		for (id, outcome) in &outcomes.states {
			let extension = registry.get_mut(*id).unwrap();
			extension.begin_operation(PackageState::Resolving);
			for warning in outcomes.warnings.get(id).into_iter().flatten() {
				extension.add_warning(warning.clone());
			}
			match outcome {
				ResolveOutcome::Resolved { module } => {
					extension.language_module = *module;
					extension.end_operation(PackageState::Resolved);
				}
				ResolveOutcome::Skipped => {
					debug!("'{}' skipped on platform {}", extension.name(), self.platform);
					extension.end_operation(PackageState::Skipped);
				}
				ResolveOutcome::Disabled(reason) => {
					extension.add_warning(reason.clone());
					extension.end_operation(PackageState::Disabled);
				}
				ResolveOutcome::Unresolved(errors) => {
					for e in errors {
						extension.add_error(e.clone());
					}
					extension.end_operation(PackageState::Unresolved);
				}
			}
		}
		registry.load_order = outcomes.order;

		debug!(
			"Resolution done, load order: {:?}",
			registry
				.load_order
				.iter()
				.map(|id| registry.get(*id).unwrap().name().to_string())
				.collect::<Vec<_>>()
		);
	}

	fn compute_resolution(&self) -> Resolution {
		let registry = self.registry.read();

		struct Node {
			id: UniqueId,
			kind: PackageKind,
			name: String,
			language: String,
			version: Version,
			platforms_ok: bool,
			dependencies: Vec<crate::version::Dependency>,
			conflicts: Vec<crate::version::Conflict>,
			obsoletes: Vec<crate::version::Obsolete>,
		}

		let nodes: Vec<Node> = registry
			.iter()
			.filter(|e| e.state() == PackageState::Parsed)
			.map(|e| {
				let manifest = e.manifest().unwrap();
				Node {
					id: e.id(),
					kind: e.kind(),
					name: e.name().to_string(),
					language: manifest.language.clone(),
					version: manifest.version.clone(),
					platforms_ok: manifest.supports_platform(&self.platform),
					dependencies: manifest.dependencies.clone(),
					conflicts: manifest.conflicts.clone(),
					obsoletes: manifest.obsoletes.clone(),
				}
			})
			.collect();
		drop(registry);

		let mut resolution = Resolution::default();
		let index_of: FxHashMap<&str, usize> =
			nodes.iter().enumerate().map(|(i, n)| (n.name.as_str(), i)).collect();

		#[derive(Clone, PartialEq)]
		enum Tentative {
			Ok(Option<UniqueId>),
			Skipped,
			Disabled(String),
			Failed(Vec<String>),
		}
		let mut tentative: Vec<Tentative> = nodes
			.iter()
			.map(|n| if n.platforms_ok { Tentative::Ok(None) } else { Tentative::Skipped })
			.collect();

		// settle dependency viability, module bindings and conflicts; each
		// pass only demotes, so this terminates
		let mut obsoletes_applied = false;
		loop {
			let mut changed = false;
			for i in 0..nodes.len() {
				if !matches!(tentative[i], Tentative::Ok(_)) {
					continue;
				}
				let node = &nodes[i];
				let mut errors = Vec::new();
				let mut module_binding = None;
				// repeated passes recompute these from scratch
				resolution.warnings.remove(&node.id);

				if node.kind == PackageKind::Plugin {
					let module = nodes.iter().enumerate().find(|(j, m)| {
						m.kind == PackageKind::Module
							&& m.language == node.language
							&& matches!(tentative[*j], Tentative::Ok(_))
					});
					match module {
						Some((_, m)) => module_binding = Some(m.id),
						None => errors.push(
							Error::MissingDependency(format!(
								"no language module for '{}'",
								node.language
							))
							.to_string(),
						),
					}
				}

				for dep in &node.dependencies {
					let target = index_of.get(dep.name.as_str()).copied();
					let viable = target.filter(|&j| matches!(tentative[j], Tentative::Ok(_)));
					match viable {
						Some(j) => {
							if !dep.satisfied_by(&nodes[j].version) {
								let msg = Error::VersionConflict(format!(
									"'{}' {} does not satisfy {}",
									dep.name,
									nodes[j].version,
									dep.constraints
										.iter()
										.map(|c| c.to_string())
										.collect::<Vec<_>>()
										.join(", ")
								))
								.to_string();
								if dep.optional {
									resolution.warn(node.id, msg);
								} else {
									errors.push(msg);
								}
							}
						}
						None => {
							let msg =
								Error::MissingDependency(format!("'{}' is not available", dep.name))
									.to_string();
							if dep.optional {
								resolution.warn(node.id, msg);
							} else {
								errors.push(msg);
							}
						}
					}
				}

				for conflict in &node.conflicts {
					if let Some(&j) = index_of.get(conflict.name.as_str()) {
						if conflict.triggered_by(&nodes[j].version) {
							errors.push(
								Error::ConflictDetected(format!(
									"conflict with '{}' {}{}",
									conflict.name,
									nodes[j].version,
									conflict
										.reason
										.as_deref()
										.map(|r| format!(" ({})", r))
										.unwrap_or_default()
								))
								.to_string(),
							);
						}
					}
				}

				if !errors.is_empty() {
					tentative[i] = Tentative::Failed(errors);
					changed = true;
				} else if let Tentative::Ok(binding) = &mut tentative[i] {
					if *binding != module_binding {
						*binding = module_binding;
						changed = true;
					}
				}
			}

			if !changed {
				if obsoletes_applied {
					break;
				}
				// survivors may obsolete others, which can in turn undo
				// dependency viability, so go around once more
				obsoletes_applied = true;
				for i in 0..nodes.len() {
					if !matches!(tentative[i], Tentative::Ok(_)) {
						continue;
					}
					for obsolete in &nodes[i].obsoletes {
						if let Some(&j) = index_of.get(obsolete.name.as_str()) {
							if j != i
								&& matches!(tentative[j], Tentative::Ok(_))
								&& obsolete.covers(&nodes[j].version)
							{
								tentative[j] = Tentative::Disabled(
									Error::DisabledByPolicy(format!(
										"obsoleted by '{}'",
										nodes[i].name
									))
									.to_string(),
								);
							}
						}
					}
				}
			}
		}

		// deterministic topological order over the survivors
		let surviving: Vec<usize> = (0..nodes.len())
			.filter(|&i| matches!(tentative[i], Tentative::Ok(_)))
			.collect();
		let mut indegree: FxHashMap<UniqueId, usize> =
			surviving.iter().map(|&i| (nodes[i].id, 0)).collect();
		let mut edges: FxHashMap<UniqueId, Vec<UniqueId>> = FxHashMap::default();
		for &i in &surviving {
			let node = &nodes[i];
			let mut before = Vec::new();
			if let Tentative::Ok(Some(module)) = tentative[i] {
				before.push(module);
			}
			for dep in &node.dependencies {
				if let Some(&j) = index_of.get(dep.name.as_str()) {
					if matches!(tentative[j], Tentative::Ok(_)) {
						before.push(nodes[j].id);
					}
				}
			}
			for b in before {
				if indegree.contains_key(&b) && b != node.id {
					edges.entry(b).or_default().push(node.id);
					*indegree.get_mut(&node.id).unwrap() += 1;
				}
			}
		}

		let mut ready: BTreeSet<UniqueId> = indegree
			.iter()
			.filter(|(_, &d)| d == 0)
			.map(|(&id, _)| id)
			.collect();
		let mut order = Vec::with_capacity(surviving.len());
		while let Some(&id) = ready.iter().next() {
			ready.remove(&id);
			order.push(id);
			for next in edges.remove(&id).unwrap_or_default() {
				let d = indegree.get_mut(&next).unwrap();
				*d -= 1;
				if *d == 0 {
					ready.insert(next);
				}
			}
		}

		if order.len() != surviving.len() {
			// whatever could not be scheduled sits on (or behind) a cycle
			let placed: BTreeSet<UniqueId> = order.iter().copied().collect();
			for &i in &surviving {
				if !placed.contains(&nodes[i].id) {
					tentative[i] = Tentative::Failed(vec![Error::CircularDependency(format!(
						"'{}' participates in a dependency cycle",
						nodes[i].name
					))
					.to_string()]);
				}
			}
		}

		for (i, node) in nodes.iter().enumerate() {
			let outcome = match &tentative[i] {
				Tentative::Ok(module) => ResolveOutcome::Resolved { module: *module },
				Tentative::Skipped => ResolveOutcome::Skipped,
				Tentative::Disabled(reason) => ResolveOutcome::Disabled(reason.clone()),
				Tentative::Failed(errors) => ResolveOutcome::Unresolved(errors.clone()),
			};
			resolution.states.push((node.id, outcome));
		}
		resolution.order = order;
		resolution
	}

	fn load_all(&mut self) {
		let order = self.registry.read().load_order.clone();
		for id in order {
			let (kind, state) = {
				let registry = self.registry.read();
				let e = registry.get(id).unwrap();
				(e.kind(), e.state())
			};
			if state != PackageState::Resolved {
				continue;
			}
			match kind {
				PackageKind::Module => self.load_module(id),
				PackageKind::Plugin => self.load_plugin(id),
			}
		}
	}

	/// Checks that everything `id` sits on top of actually made it to
	/// `Loaded`; returns the first failure description otherwise.
	fn unmet_requirement(&self, id: UniqueId) -> Option<String> {
		let registry = self.registry.read();
		let extension = registry.get(id)?;

		if let Some(module_id) = extension.language_module {
			let module = registry.get(module_id)?;
			if !module.state().is_loaded() {
				return Some(format!("language module '{}' failed to load", module.name()));
			}
		}
		let manifest = extension.manifest()?;
		for dep in &manifest.dependencies {
			if dep.optional {
				continue;
			}
			if let Some(target) = registry.find_by_name(&dep.name) {
				if !target.state().is_loaded() {
					return Some(format!("dependency '{}' failed to load", dep.name));
				}
			}
		}
		None
	}

	fn fail_extension(&self, id: UniqueId, error: String) {
		let mut registry = self.registry.write();
		let extension = registry.get_mut(id).unwrap();
		// native resources go before the state does
		extension.callbacks.clear();
		extension.method_data.clear();
		extension.assembly = None;
		extension.add_error(error);
		extension.end_operation(PackageState::Failed);
	}

	fn load_module(&mut self, id: UniqueId) {
		let info = self.info_of(id);
		self.registry.write().get_mut(id).unwrap().begin_operation(PackageState::Loading);

		let runtime = {
			let registry = self.registry.read();
			let extension = registry.get(id).unwrap();
			let runtime = extension.manifest().and_then(|m| m.runtime.clone()).unwrap_or_default();
			extension
				.location()
				.parent()
				.map(|p| p.join(&runtime))
				.unwrap_or(runtime)
		};

		let mut flags: BitFlags<LoadFlag> = LoadFlag::LazyBinding.into();
		if self.config.prefer_own_symbols() {
			flags |= LoadFlag::DeepBind;
		}

		debug!("Loading module '{}' from {:?}", info.name, runtime);
		let loaded = self.module_loader.load(&info, &runtime, &self.assembly_loader, flags);
		let (mut module, assembly) = match loaded {
			Ok(parts) => parts,
			Err(e) => {
				self.fail_extension(id, e.to_string());
				return;
			}
		};

		// extra linker search paths the manifest asked for
		let dirs = self.registry.read().get(id).unwrap().manifest().map(|m| m.directories.clone());
		for dir in dirs.into_iter().flatten() {
			let dir = info.location.parent().map(|p| p.join(&dir)).unwrap_or(dir);
			if let Err(e) = self.assembly_loader.add_search_path(&dir) {
				trace!("search path {:?}: {}", dir, e);
			}
		}

		let provider = self.provider.clone();
		let initialized = catch_unwind(AssertUnwindSafe(|| module.initialize(provider, &info)));
		match initialized {
			Ok(Ok(table)) => {
				let mut registry = self.registry.write();
				let extension = registry.get_mut(id).unwrap();
				extension.method_table = table;
				extension.assembly = assembly;
				extension.end_operation(PackageState::Loaded);
				drop(registry);
				self.modules.insert(id, module);
			}
			Ok(Err(message)) => {
				self.fail_extension(id, Error::InitializationFailed(message).to_string());
			}
			Err(_) => {
				self.fail_extension(
					id,
					Error::InitializationFailed("panic in module initialise".into()).to_string(),
				);
			}
		}
	}

	fn load_plugin(&mut self, id: UniqueId) {
		if let Some(unmet) = self.unmet_requirement(id) {
			self.registry.write().get_mut(id).unwrap().begin_operation(PackageState::Loading);
			self.fail_extension(id, unmet);
			return;
		}

		let info = self.info_of(id);
		let Some(owner) = self.owner_of(id) else {
			self.registry.write().get_mut(id).unwrap().begin_operation(PackageState::Loading);
			self.fail_extension(id, "plugin has no bound language module".into());
			return;
		};

		self.registry.write().get_mut(id).unwrap().begin_operation(PackageState::Loading);
		debug!("Loading plugin '{}'", info.name);

		let module = self.modules.get_mut(&owner).expect("owner module is loaded");
		let loaded = catch_unwind(AssertUnwindSafe(|| module.on_plugin_load(&info)));
		let load_data = match loaded {
			Ok(Ok(data)) => data,
			Ok(Err(message)) => {
				self.fail_extension(id, Error::InitializationFailed(message).to_string());
				return;
			}
			Err(_) => {
				self.fail_extension(
					id,
					Error::InitializationFailed("panic in plugin load".into()).to_string(),
				);
				return;
			}
		};

		// merge returned addresses with the declared methods
		let mut method_data = Vec::new();
		let mut unknown = Vec::new();
		for (name, addr) in &load_data.methods {
			match info.methods.iter().find(|m| &m.name == name) {
				Some(method) => method_data.push(MethodData { method: method.clone(), addr: *addr }),
				None => unknown.push(name.clone()),
			}
		}

		// wrap exports in callback trampolines so any language can call them
		// through the method's real C signature
		let mut callbacks = Vec::new();
		if load_data.table.has_export {
			if let Some(handler) = self.modules.get(&owner).unwrap().callback_handler() {
				for data in &mut method_data {
					match bridge::export_callback(&self.jit, &data.method, handler, data.addr) {
						Ok((callback, entry)) => {
							callbacks.push(callback);
							data.addr = entry;
						}
						Err(e) => {
							self.fail_extension(id, e.to_string());
							return;
						}
					}
				}
			}
		}

		{
			let mut registry = self.registry.write();
			let extension = registry.get_mut(id).unwrap();
			extension.user_data = load_data.user_data;
			extension.method_table = load_data.table;
			extension.method_data = method_data;
			extension.callbacks = callbacks;
			for name in unknown {
				extension.add_warning(format!("exported method '{}' is not declared", name));
			}
			extension.end_operation(PackageState::Loaded);
		}

		if load_data.table.has_export {
			let info = self.info_of(id);
			let module = self.modules.get_mut(&owner).unwrap();
			if catch_unwind(AssertUnwindSafe(|| module.on_method_export(&info))).is_err() {
				warn!("'{}' panicked in method export", info.name);
			}
		}
	}

	fn start_all(&mut self) {
		let order = self.registry.read().load_order.clone();
		for id in order {
			let (kind, state, has_start) = {
				let registry = self.registry.read();
				let e = registry.get(id).unwrap();
				(e.kind(), e.state(), e.method_table.has_start)
			};
			if state != PackageState::Loaded {
				continue;
			}

			self.registry.write().get_mut(id).unwrap().begin_operation(PackageState::Starting);

			if kind == PackageKind::Plugin && has_start {
				let info = self.info_of(id);
				if let Some(owner) = self.owner_of(id) {
					let module = self.modules.get_mut(&owner).expect("owner module is loaded");
					if catch_unwind(AssertUnwindSafe(|| module.on_plugin_start(&info))).is_err() {
						self.fail_extension(
							id,
							Error::InitializationFailed("panic in plugin start".into()).to_string(),
						);
						continue;
					}
				}
			}

			self.registry.write().get_mut(id).unwrap().end_operation(PackageState::Started);
		}
	}

	// --- helpers ---

	fn info_of(&self, id: UniqueId) -> ExtensionInfo {
		let registry = self.registry.read();
		let extension = registry.get(id).unwrap();
		ExtensionInfo {
			id,
			name: extension.name().to_string(),
			version: extension.version().cloned().unwrap_or_else(|| Version::new(0, 0, 0)),
			language: extension.language().to_string(),
			entry: extension.manifest().and_then(|m| m.entry.clone()),
			location: extension.location().to_path_buf(),
			dirs: extension.dirs.clone(),
			methods: extension.methods.clone(),
			user_data: extension.user_data,
		}
	}

	fn owner_of(&self, id: UniqueId) -> Option<UniqueId> {
		self.registry.read().get(id).and_then(|e| e.language_module)
	}

	fn is_updatable(&self, id: UniqueId, kind: PackageKind) -> bool {
		let registry = self.registry.read();
		registry
			.get(id)
			.map(|e| e.kind() == kind && e.state().is_updatable() && e.method_table.has_update)
			.unwrap_or(false)
	}

	fn commit_update_result(&mut self, id: UniqueId, result: Result<(), Box<dyn std::any::Any + Send>>) {
		match result {
			Ok(()) => {
				self.registry.write().get_mut(id).unwrap().end_operation(PackageState::Updated);
			}
			Err(_) => {
				self.fail_extension(
					id,
					Error::InitializationFailed("panic in update callback".into()).to_string(),
				);
			}
		}
	}

	fn plugin_end_info(&self, id: UniqueId) -> Option<ExtensionInfo> {
		{
			let registry = self.registry.read();
			let extension = registry.get(id)?;
			if !extension.is_plugin() || !extension.state().is_updatable() {
				return None;
			}
		}
		Some(self.info_of(id))
	}
}

#[derive(Debug, Clone)]
enum ResolveOutcome {
	Resolved { module: Option<UniqueId> },
	Skipped,
	Disabled(String),
	Unresolved(Vec<String>),
}

#[derive(Default)]
struct Resolution {
	states: Vec<(UniqueId, ResolveOutcome)>,
	warnings: FxHashMap<UniqueId, Vec<String>>,
	order: Vec<UniqueId>,
}

impl Resolution {
	fn warn(&mut self, id: UniqueId, message: String) {
		self.warnings.entry(id).or_default().push(message);
	}
}
