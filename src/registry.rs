//! The extension arena. Everything the engine knows about lives here, and
//! the provider reads it under the same lock the engine writes it under. The
//! engine never holds the write guard across an extension callback, which is
//! what makes provider lookups from inside callbacks safe.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use semver::Version;

use crate::extension::{Extension, MethodData, PackageState, UniqueId};
use crate::manifest::PackageKind;

#[derive(Default)]
pub(crate) struct Registry {
	extensions: Vec<Extension>,
	by_id: FxHashMap<UniqueId, usize>,
	/// Topological load order over resolved extensions.
	pub load_order: Vec<UniqueId>,
}

impl Registry {
	pub fn insert(&mut self, extension: Extension) {
		self.by_id.insert(extension.id(), self.extensions.len());
		self.extensions.push(extension);
	}

	pub fn get(&self, id: UniqueId) -> Option<&Extension> {
		self.by_id.get(&id).map(|&i| &self.extensions[i])
	}

	pub fn get_mut(&mut self, id: UniqueId) -> Option<&mut Extension> {
		self.by_id.get(&id).copied().map(move |i| &mut self.extensions[i])
	}

	/// Name lookup. Names are only unique among parsed manifests; the first
	/// match in discovery order wins, like the original.
	pub fn find_by_name(&self, name: &str) -> Option<&Extension> {
		self.extensions.iter().find(|e| e.name() == name)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Extension> {
		self.extensions.iter()
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Extension> {
		self.extensions.iter_mut()
	}

	pub fn ids(&self) -> Vec<UniqueId> {
		self.extensions.iter().map(|e| e.id()).collect()
	}

	pub fn len(&self) -> usize {
		self.extensions.len()
	}

	pub fn snapshot(&self, id: UniqueId) -> Option<ExtensionSnapshot> {
		self.get(id).map(ExtensionSnapshot::of)
	}

	pub fn snapshots(&self) -> Vec<ExtensionSnapshot> {
		self.extensions.iter().map(ExtensionSnapshot::of).collect()
	}
}

/// A point-in-time copy of one extension's externally visible state. Handed
/// out instead of references so nothing outside the engine can sit on the
/// registry lock.
#[derive(Debug, Clone)]
pub struct ExtensionSnapshot {
	pub id: UniqueId,
	pub kind: PackageKind,
	pub name: String,
	pub version: Option<Version>,
	pub language: String,
	pub state: PackageState,
	pub errors: Vec<String>,
	pub warnings: Vec<String>,
	pub method_data: Vec<MethodData>,
	pub timings: Vec<(PackageState, std::time::Duration)>,
	pub total_time: std::time::Duration,
}

impl ExtensionSnapshot {
	fn of(extension: &Extension) -> Self {
		Self {
			id: extension.id(),
			kind: extension.kind(),
			name: extension.name().to_string(),
			version: extension.version().cloned(),
			language: extension.language().to_string(),
			state: extension.state(),
			errors: extension.errors().map(str::to_string).collect(),
			warnings: extension.warnings().map(str::to_string).collect(),
			method_data: extension.method_data.clone(),
			timings: extension.timings().collect(),
			total_time: extension.total_time(),
		}
	}

	/// Looks up one published export by method name.
	pub fn find_export(&self, name: &str) -> Option<&MethodData> {
		self.method_data.iter().find(|d| d.method.name == name)
	}
}

pub(crate) type SharedRegistry = Arc<parking_lot::RwLock<Registry>>;
