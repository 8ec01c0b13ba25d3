//! One discovered package and its forward-only lifecycle. The engine owns
//! every `Extension`; cross-references between them are [`UniqueId`]s into
//! the engine's arena, never pointers.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use plugify_assembly::{Assembly, MemAddr};
use semver::Version;

use crate::config::ExtensionDirs;
use crate::manifest::{Manifest, PackageKind};
use crate::method::{Method, MethodTable};

/// Process-lifetime-stable handle for an extension, minted at discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UniqueId(pub u64);

impl std::fmt::Display for UniqueId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "#{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageState {
	Unknown,
	Discovered,
	Parsing,
	Parsed,
	Corrupted,
	Resolving,
	Resolved,
	Unresolved,
	Disabled,
	Skipped,
	Loading,
	Loaded,
	Starting,
	Started,
	Updating,
	Updated,
	Ending,
	Ended,
	Failed,
	Terminated,
}

impl PackageState {
	/// The forward-only transition relation. Failure is reachable from any
	/// point at or past loading, termination from everywhere (teardown).
	pub fn is_valid_transition(from: Self, to: Self) -> bool {
		use PackageState::*;
		match (from, to) {
			(Unknown, Discovered) => true,
			(Discovered, Parsing) => true,
			(Parsing, Parsed | Corrupted) => true,
			(Parsed, Resolving) => true,
			(Resolving, Resolved | Unresolved | Disabled | Skipped) => true,
			(Resolved, Loading) => true,
			(Loading, Loaded) => true,
			(Loaded, Starting) => true,
			(Starting, Started) => true,
			(Started | Updated, Updating) => true,
			(Updating, Updated) => true,
			(Started | Updated, Ending) => true,
			(Ending, Ended) => true,
			(Ended, Terminated) => true,
			(from, Failed) => from.is_load_or_later(),
			(_, Terminated) => true,
			_ => false,
		}
	}

	fn is_load_or_later(&self) -> bool {
		use PackageState::*;
		matches!(
			self,
			Loading | Loaded | Starting | Started | Updating | Updated | Ending | Ended | Failed
		)
	}

	/// At or past `Loaded` and still alive.
	pub fn is_loaded(&self) -> bool {
		use PackageState::*;
		matches!(self, Loaded | Starting | Started | Updating | Updated)
	}

	/// Eligible for the per-frame update fan-out.
	pub fn is_updatable(&self) -> bool {
		matches!(self, Self::Started | Self::Updated)
	}

	/// A settled non-running outcome (nothing further will happen).
	pub fn is_terminal(&self) -> bool {
		use PackageState::*;
		matches!(self, Corrupted | Unresolved | Disabled | Skipped | Failed | Terminated)
	}

	pub fn as_str(&self) -> &'static str {
		use PackageState::*;
		match self {
			Unknown => "Unknown",
			Discovered => "Discovered",
			Parsing => "Parsing",
			Parsed => "Parsed",
			Corrupted => "Corrupted",
			Resolving => "Resolving",
			Resolved => "Resolved",
			Unresolved => "Unresolved",
			Disabled => "Disabled",
			Skipped => "Skipped",
			Loading => "Loading",
			Loaded => "Loaded",
			Starting => "Starting",
			Started => "Started",
			Updating => "Updating",
			Updated => "Updated",
			Ending => "Ending",
			Ended => "Ended",
			Failed => "Failed",
			Terminated => "Terminated",
		}
	}
}

/// A resolved export: the descriptor plus where its code (or its callback
/// trampoline) lives.
#[derive(Debug, Clone)]
pub struct MethodData {
	pub method: Arc<Method>,
	pub addr: MemAddr,
}

pub struct Extension {
	id: UniqueId,
	kind: PackageKind,
	name: String,
	location: PathBuf,
	state: PackageState,
	manifest: Option<Manifest>,

	errors: VecDeque<String>,
	warnings: VecDeque<String>,
	timings: HashMap<PackageState, Duration>,
	op_started: Option<(PackageState, Instant)>,

	pub dirs: ExtensionDirs,
	pub user_data: MemAddr,
	pub method_table: MethodTable,
	/// The owning language module's id, set for plugins during resolution.
	pub language_module: Option<UniqueId>,
	/// Declared methods, shared with handles and published method data.
	pub methods: Vec<Arc<Method>>,
	/// Published exports, filled when a plugin loads.
	pub method_data: Vec<MethodData>,
	/// Callback trampolines backing `method_data` entries, kept alive here.
	pub(crate) callbacks: Vec<plugify_jit::JitCallback>,
	/// The mapped native library, set for modules during load.
	pub assembly: Option<Arc<Assembly>>,
}

impl Extension {
	pub fn new(id: UniqueId, kind: PackageKind, location: PathBuf) -> Self {
		let name = location
			.file_stem()
			.and_then(|s| s.to_str())
			.unwrap_or("unnamed")
			.to_string();
		Self {
			id,
			kind,
			name,
			location,
			state: PackageState::Unknown,
			manifest: None,
			errors: VecDeque::new(),
			warnings: VecDeque::new(),
			timings: HashMap::new(),
			op_started: None,
			dirs: ExtensionDirs::default(),
			user_data: MemAddr::new(0),
			method_table: MethodTable::default(),
			language_module: None,
			methods: Vec::new(),
			method_data: Vec::new(),
			callbacks: Vec::new(),
			assembly: None,
		}
	}

	pub fn id(&self) -> UniqueId {
		self.id
	}

	pub fn kind(&self) -> PackageKind {
		self.kind
	}

	pub fn is_plugin(&self) -> bool {
		self.kind == PackageKind::Plugin
	}

	pub fn is_module(&self) -> bool {
		self.kind == PackageKind::Module
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn location(&self) -> &Path {
		&self.location
	}

	pub fn state(&self) -> PackageState {
		self.state
	}

	pub fn manifest(&self) -> Option<&Manifest> {
		self.manifest.as_ref()
	}

	pub fn version(&self) -> Option<&Version> {
		self.manifest.as_ref().map(|m| &m.version)
	}

	pub fn language(&self) -> &str {
		self.manifest.as_ref().map(|m| m.language.as_str()).unwrap_or("")
	}

	pub fn install_manifest(&mut self, manifest: Manifest) {
		self.name = manifest.name.clone();
		self.methods = manifest.methods.iter().cloned().map(Arc::new).collect();
		self.manifest = Some(manifest);
	}

	// --- state machine ---

	/// Begins a timed operation state. Illegal transitions are programming
	/// errors in the engine and reported as such.
	pub fn begin_operation(&mut self, state: PackageState) {
		self.transition(state);
		self.op_started = Some((state, Instant::now()));
	}

	/// Ends the running operation, accumulating its elapsed time, and moves
	/// to the outcome state.
	pub fn end_operation(&mut self, state: PackageState) {
		if let Some((op, started)) = self.op_started.take() {
			*self.timings.entry(op).or_default() += started.elapsed();
		}
		self.transition(state);
	}

	pub fn transition(&mut self, state: PackageState) {
		assert!(
			PackageState::is_valid_transition(self.state, state),
			"illegal state transition {} -> {} on '{}'",
			self.state.as_str(),
			state.as_str(),
			self.name
		);
		trace!("'{}' {} -> {}", self.name, self.state.as_str(), state.as_str());
		self.state = state;
	}

	// --- diagnostics ---

	pub fn add_error(&mut self, error: impl Into<String>) {
		let error = error.into();
		error!("'{}': {}", self.name, error);
		self.errors.push_back(error);
	}

	pub fn add_warning(&mut self, warning: impl Into<String>) {
		let warning = warning.into();
		warn!("'{}': {}", self.name, warning);
		self.warnings.push_back(warning);
	}

	pub fn errors(&self) -> impl Iterator<Item = &str> {
		self.errors.iter().map(|s| s.as_str())
	}

	pub fn warnings(&self) -> impl Iterator<Item = &str> {
		self.warnings.iter().map(|s| s.as_str())
	}

	pub fn has_errors(&self) -> bool {
		!self.errors.is_empty()
	}

	pub fn clear_errors(&mut self) {
		self.errors.clear();
	}

	// --- timings ---

	pub fn operation_time(&self, state: PackageState) -> Duration {
		self.timings.get(&state).copied().unwrap_or_default()
	}

	pub fn timings(&self) -> impl Iterator<Item = (PackageState, Duration)> + '_ {
		self.timings.iter().map(|(&s, &d)| (s, d))
	}

	pub fn total_time(&self) -> Duration {
		self.timings.values().sum()
	}

	pub fn performance_report(&self) -> String {
		let mut out = format!("'{}' ({}) total {:?}", self.name, self.state.as_str(), self.total_time());
		let mut entries = self.timings.iter().collect::<Vec<_>>();
		entries.sort_by_key(|(s, _)| s.as_str());
		for (state, time) in entries {
			out.push_str(&format!("\n\t{}: {:?}", state.as_str(), time));
		}
		out
	}
}

impl std::fmt::Debug for Extension {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Extension")
			.field("id", &self.id)
			.field("kind", &self.kind)
			.field("name", &self.name)
			.field("state", &self.state)
			.field("errors", &self.errors.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fresh() -> Extension {
		Extension::new(UniqueId(1), PackageKind::Plugin, PathBuf::from("exts/demo.pplugin"))
	}

	#[test]
	fn test_name_from_file_stem() {
		assert_eq!(fresh().name(), "demo");
	}

	#[test]
	fn test_happy_path_transitions() {
		let mut e = fresh();
		e.transition(PackageState::Discovered);
		e.begin_operation(PackageState::Parsing);
		e.end_operation(PackageState::Parsed);
		e.begin_operation(PackageState::Resolving);
		e.end_operation(PackageState::Resolved);
		e.begin_operation(PackageState::Loading);
		e.end_operation(PackageState::Loaded);
		e.begin_operation(PackageState::Starting);
		e.end_operation(PackageState::Started);
		assert!(e.state().is_updatable());
		e.begin_operation(PackageState::Updating);
		e.end_operation(PackageState::Updated);
		e.begin_operation(PackageState::Updating);
		e.end_operation(PackageState::Updated);
		e.begin_operation(PackageState::Ending);
		e.end_operation(PackageState::Ended);
		e.transition(PackageState::Terminated);
	}

	#[test]
	#[should_panic(expected = "illegal state transition")]
	fn test_skipping_states_panics() {
		let mut e = fresh();
		e.transition(PackageState::Loaded);
	}

	#[test]
	fn test_failed_only_from_load_or_later() {
		assert!(!PackageState::is_valid_transition(PackageState::Resolving, PackageState::Failed));
		assert!(PackageState::is_valid_transition(PackageState::Loading, PackageState::Failed));
		assert!(PackageState::is_valid_transition(PackageState::Started, PackageState::Failed));
		// teardown may terminate anything
		assert!(PackageState::is_valid_transition(PackageState::Unresolved, PackageState::Terminated));
	}

	#[test]
	fn test_timings_accumulate() {
		let mut e = fresh();
		e.transition(PackageState::Discovered);
		e.begin_operation(PackageState::Parsing);
		std::thread::sleep(Duration::from_millis(2));
		e.end_operation(PackageState::Parsed);

		assert!(e.operation_time(PackageState::Parsing) >= Duration::from_millis(2));
		assert_eq!(e.operation_time(PackageState::Parsing), e.total_time());
		assert!(e.performance_report().contains("Parsing"));
	}

	#[test]
	fn test_error_queue_order() {
		let mut e = fresh();
		e.add_error("first");
		e.add_error("second");
		e.add_warning("heads up");
		assert_eq!(e.errors().collect::<Vec<_>>(), vec!["first", "second"]);
		assert_eq!(e.warnings().count(), 1);
		assert!(e.has_errors());
	}
}
