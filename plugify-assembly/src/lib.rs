//! Shared-ownership wrappers over the platform dynamic linker.
//!
//! An [`Assembly`] is one mapped library with a symbol cache. The
//! [`AssemblyLoader`] keeps a path-keyed cache of weak references so that a
//! module and its plugins observe the same mapping, and the last strong
//! reference dropping is what actually unloads the file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use enumflags2::bitflags;
pub use enumflags2::BitFlags;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

#[macro_use]
extern crate log;

mod platform;

pub use platform::library_filename;

/// A plain code or data address inside a mapped assembly.
///
/// Stored as an integer so caches of these stay `Send + Sync`; cast at the
/// boundary where it is actually called or dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemAddr(usize);
impl MemAddr {
	pub fn new(addr: usize) -> Self {
		Self(addr)
	}

	pub fn as_usize(&self) -> usize {
		self.0
	}

	pub fn as_ptr<T>(&self) -> *mut T {
		self.0 as *mut T
	}

	pub fn is_null(&self) -> bool {
		self.0 == 0
	}
}
impl<T> From<*mut T> for MemAddr {
	fn from(value: *mut T) -> Self {
		Self(value as usize)
	}
}
impl<T> From<*const T> for MemAddr {
	fn from(value: *const T) -> Self {
		Self(value as usize)
	}
}

/// Requested loader behaviour. Each flag maps to the closest native flag and
/// is ignored where the target has no equivalent (see `platform`).
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFlag {
	/// Delay symbol resolution until first use (`RTLD_LAZY`).
	LazyBinding = 1 << 0,
	/// Make symbols visible to subsequently loaded libraries (`RTLD_GLOBAL`).
	GlobalSymbols = 1 << 1,
	/// Keep the mapping alive for the rest of the process (`RTLD_NODELETE`).
	NoUnload = 1 << 2,
	/// Prefer the library's own symbols over global ones (`RTLD_DEEPBIND`).
	DeepBind = 1 << 3,
	/// Map as a data file, no execution (`LOAD_LIBRARY_AS_DATAFILE`).
	DataOnly = 1 << 4,
	/// Restrict the search to system32, the application dir, user dirs and
	/// the DLL's own dir (`LOAD_LIBRARY_SEARCH_*` combination).
	SecureSearch = 1 << 5,
}

pub fn default_flags() -> BitFlags<LoadFlag> {
	LoadFlag::LazyBinding.into()
}

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
	#[error("assembly not found at '{0}'")]
	FileNotFound(PathBuf),
	#[error("failed to load assembly: {0}")]
	LoadFailed(String),
	#[error("symbol '{0}' not found: {1}")]
	SymbolNotFound(String, String),
	#[error("unsupported on this platform: {0}")]
	Unsupported(&'static str),
}

/// One mapped native library.
///
/// Symbol lookups go through a cache that is populated on first success and
/// only invalidated by dropping the assembly, so the steady-state read path
/// takes a read lock and nothing else.
pub struct Assembly {
	path: PathBuf,
	symbols: RwLock<FxHashMap<String, MemAddr>>,
	lib: Option<platform::Library>,
	no_unload: bool,
}

impl Assembly {
	fn new(path: PathBuf, lib: platform::Library, no_unload: bool) -> Self {
		Self {
			path,
			symbols: RwLock::new(FxHashMap::default()),
			lib: Some(lib),
			no_unload,
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Resolves a symbol, consulting the cache first.
	pub fn get_symbol(&self, name: &str) -> Result<MemAddr, AssemblyError> {
		if let Some(&addr) = self.symbols.read().get(name) {
			return Ok(addr);
		}

		let lib = self.lib.as_ref().expect("assembly already closed");
		let addr = lib.symbol(name)?;
		self.symbols.write().insert(name.to_string(), addr);

		Ok(addr)
	}

	/// Like [`get_symbol`](Self::get_symbol), but missing symbols are just `None`.
	pub fn try_get_symbol(&self, name: &str) -> Option<MemAddr> {
		self.get_symbol(name).ok()
	}

	pub fn cached_symbols(&self) -> usize {
		self.symbols.read().len()
	}
}
impl Drop for Assembly {
	fn drop(&mut self) {
		// Cached addresses dangle once the mapping goes away
		self.symbols.write().clear();
		if let Some(lib) = self.lib.take() {
			if self.no_unload {
				trace!("Leaking assembly {:?} (NoUnload)", self.path);
				std::mem::forget(lib);
			} else {
				trace!("Unloading assembly {:?}", self.path);
			}
		}
	}
}
impl std::fmt::Debug for Assembly {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Assembly")
			.field("path", &self.path)
			.field("cached_symbols", &self.symbols.read().len())
			.finish()
	}
}

/// Loads assemblies and deduplicates them by absolute path.
#[derive(Default)]
pub struct AssemblyLoader {
	search_paths: RwLock<Vec<PathBuf>>,
	cache: RwLock<FxHashMap<PathBuf, Weak<Assembly>>>,
}

impl AssemblyLoader {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a directory used to resolve relative assembly paths. Duplicates
	/// are rejected.
	pub fn add_search_path(&self, path: impl Into<PathBuf>) -> Result<(), AssemblyError> {
		let path = path.into();
		let mut paths = self.search_paths.write();
		if paths.contains(&path) {
			return Err(AssemblyError::LoadFailed(format!("search path {:?} already present", path)));
		}
		debug!("Adding search path {:?}", path);
		paths.push(path);
		Ok(())
	}

	pub fn remove_search_path(&self, path: impl AsRef<Path>) -> Result<(), AssemblyError> {
		let mut paths = self.search_paths.write();
		if let Some(i) = paths.iter().position(|p| p == path.as_ref()) {
			paths.remove(i);
			Ok(())
		} else {
			Err(AssemblyError::FileNotFound(path.as_ref().into()))
		}
	}

	/// Registers a directory with the OS linker itself, so that transitive
	/// library dependencies resolve from it too. POSIX linkers fix their
	/// search list at process start, so this reports `Unsupported` there.
	pub fn link_search_path(&self, path: impl AsRef<Path>) -> Result<(), AssemblyError> {
		platform::link_search_path(path.as_ref())
	}

	pub fn can_link_search_paths(&self) -> bool {
		platform::CAN_LINK_SEARCH_PATHS
	}

	/// Absolute paths pass through; relative ones are checked against each
	/// configured search path in insertion order.
	pub fn resolve_path(&self, path: &Path) -> Result<PathBuf, AssemblyError> {
		if path.is_absolute() {
			if path.exists() {
				return Ok(path.to_path_buf());
			}
			return Err(AssemblyError::FileNotFound(path.into()));
		}
		for dir in self.search_paths.read().iter() {
			let candidate = dir.join(path);
			if candidate.exists() {
				return Ok(candidate);
			}
		}
		// Last resort: let the cwd-relative form through if it exists
		if path.exists() {
			return Ok(path.to_path_buf());
		}
		Err(AssemblyError::FileNotFound(path.into()))
	}

	/// Loads an assembly, or hands back the live instance if some other
	/// extension already mapped the same file.
	pub fn load(&self, path: &Path, flags: BitFlags<LoadFlag>) -> Result<Arc<Assembly>, AssemblyError> {
		let resolved = self.resolve_path(path)?;
		let key = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());

		if let Some(live) = self.cache.read().get(&key).and_then(|w| w.upgrade()) {
			trace!("Assembly cache hit for {:?}", key);
			return Ok(live);
		}

		debug!("Loading assembly {:?} with {:?}", resolved, flags);
		let lib = platform::Library::open(&resolved, flags)?;
		let assembly = Arc::new(Assembly::new(resolved, lib, flags.contains(LoadFlag::NoUnload)));

		let mut cache = self.cache.write();
		// A racing loader may have inserted between our read and write
		if let Some(live) = cache.get(&key).and_then(|w| w.upgrade()) {
			return Ok(live);
		}
		cache.insert(key, Arc::downgrade(&assembly));

		Ok(assembly)
	}

	/// Drops dead weak entries. Called opportunistically by the engine.
	pub fn prune(&self) {
		self.cache.write().retain(|_, w| w.strong_count() > 0);
	}

	pub fn loaded_count(&self) -> usize {
		self.cache.read().values().filter(|w| w.strong_count() > 0).count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_search_paths() {
		let loader = AssemblyLoader::new();
		loader.add_search_path("/tmp/a").unwrap();
		assert!(loader.add_search_path("/tmp/a").is_err());
		loader.add_search_path("/tmp/b").unwrap();
		loader.remove_search_path("/tmp/a").unwrap();
		assert!(loader.remove_search_path("/tmp/a").is_err());
	}

	#[test]
	fn test_resolve_missing() {
		let loader = AssemblyLoader::new();
		let err = loader.resolve_path(Path::new("does_not_exist_anywhere.so")).unwrap_err();
		assert!(matches!(err, AssemblyError::FileNotFound(_)));
	}

	#[test]
	fn test_library_filename() {
		let name = library_filename("thing");
		#[cfg(target_os = "linux")]
		assert_eq!(name, std::path::PathBuf::from("libthing.so"));
		#[cfg(target_os = "windows")]
		assert_eq!(name, std::path::PathBuf::from("thing.dll"));
	}

	#[cfg(unix)]
	#[test]
	fn test_self_symbols_cached() {
		// dlopen(NULL) gives us the main program, which links libc
		let assembly = Assembly::new("self".into(), platform::Library::this(), false);
		let a = assembly.get_symbol("malloc").unwrap();
		assert!(!a.is_null());
		assert_eq!(assembly.cached_symbols(), 1);
		// second hit comes out of the cache
		let b = assembly.get_symbol("malloc").unwrap();
		assert_eq!(a, b);
		assert_eq!(assembly.cached_symbols(), 1);
		assert!(assembly.get_symbol("definitely_not_a_symbol_xyz").is_err());
	}

	#[cfg(unix)]
	#[test]
	fn test_link_search_path_unsupported() {
		let loader = AssemblyLoader::new();
		assert!(!loader.can_link_search_paths());
		assert!(matches!(
			loader.link_search_path("/tmp"),
			Err(AssemblyError::Unsupported(_))
		));
	}
}
