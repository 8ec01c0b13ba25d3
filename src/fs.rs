//! Filesystem collaborator. The engine reads manifests and walks the
//! extensions tree exclusively through this trait so tests can substitute a
//! fake; the standard implementation is a thin layer over std and walkdir.

use std::path::{Path, PathBuf};

/// Options for [`FileSystem::iterate_dir`].
#[derive(Clone)]
pub struct DirIterOptions {
	pub recursive: bool,
	pub follow_symlinks: bool,
	pub max_depth: Option<usize>,
	/// Keep only files with one of these extensions (no dot). Empty keeps all.
	pub extensions: Vec<String>,
	/// Extra predicate applied after the extension filter.
	pub predicate: Option<std::sync::Arc<dyn Fn(&Path) -> bool + Send + Sync>>,
}

impl Default for DirIterOptions {
	fn default() -> Self {
		Self {
			recursive: true,
			follow_symlinks: false,
			max_depth: None,
			extensions: Vec::new(),
			predicate: None,
		}
	}
}

impl std::fmt::Debug for DirIterOptions {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DirIterOptions")
			.field("recursive", &self.recursive)
			.field("follow_symlinks", &self.follow_symlinks)
			.field("max_depth", &self.max_depth)
			.field("extensions", &self.extensions)
			.finish()
	}
}

pub trait FileSystem: Send + Sync {
	fn read_text(&self, path: &Path) -> Result<String, String>;
	fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, String>;
	fn exists(&self, path: &Path) -> bool;
	fn is_file(&self, path: &Path) -> bool;
	fn is_directory(&self, path: &Path) -> bool;
	fn iterate_dir(&self, root: &Path, options: &DirIterOptions) -> Result<Vec<PathBuf>, String>;
	fn create_dir_all(&self, path: &Path) -> Result<(), String>;
	fn remove(&self, path: &Path) -> Result<(), String>;
	fn copy(&self, from: &Path, to: &Path) -> Result<(), String>;
	fn rename(&self, from: &Path, to: &Path) -> Result<(), String>;

	/// Recursively finds files whose names match a `*`-wildcard pattern.
	fn find_by_glob(&self, root: &Path, pattern: &str) -> Result<Vec<PathBuf>, String> {
		let pattern = pattern.to_string();
		let options = DirIterOptions {
			predicate: Some(std::sync::Arc::new(move |p: &Path| {
				p.file_name()
					.and_then(|n| n.to_str())
					.map(|n| wildcard_match(&pattern, n))
					.unwrap_or(false)
			})),
			..Default::default()
		};
		self.iterate_dir(root, &options)
	}
}

/// Glob-lite: `*` matches any run of characters, everything else is literal.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
	let parts: Vec<&str> = pattern.split('*').collect();
	if parts.len() == 1 {
		return pattern == name;
	}
	let mut rest = name;
	for (i, part) in parts.iter().enumerate() {
		if part.is_empty() {
			continue;
		}
		if i == 0 {
			match rest.strip_prefix(part) {
				Some(r) => rest = r,
				None => return false,
			}
		} else if i == parts.len() - 1 {
			return rest.ends_with(part);
		} else {
			match rest.find(part) {
				Some(at) => rest = &rest[at + part.len()..],
				None => return false,
			}
		}
	}
	// pattern ended with a wildcard
	true
}

#[derive(Debug, Default)]
pub struct StandardFileSystem;

impl FileSystem for StandardFileSystem {
	fn read_text(&self, path: &Path) -> Result<String, String> {
		std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))
	}

	fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, String> {
		std::fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))
	}

	fn exists(&self, path: &Path) -> bool {
		path.exists()
	}

	fn is_file(&self, path: &Path) -> bool {
		path.is_file()
	}

	fn is_directory(&self, path: &Path) -> bool {
		path.is_dir()
	}

	fn iterate_dir(&self, root: &Path, options: &DirIterOptions) -> Result<Vec<PathBuf>, String> {
		if !root.is_dir() {
			return Err(format!("{} is not a directory", root.display()));
		}

		let mut walk = walkdir::WalkDir::new(root).follow_links(options.follow_symlinks);
		if !options.recursive {
			walk = walk.max_depth(1);
		} else if let Some(depth) = options.max_depth {
			walk = walk.max_depth(depth);
		}

		let mut found = walk
			.into_iter()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_type().is_file())
			.map(|e| e.into_path())
			.filter(|p| {
				if options.extensions.is_empty() {
					return true;
				}
				p.extension()
					.and_then(|e| e.to_str())
					.map(|e| options.extensions.iter().any(|want| want == e))
					.unwrap_or(false)
			})
			.filter(|p| options.predicate.as_ref().map(|f| f(p)).unwrap_or(true))
			.collect::<Vec<_>>();

		// walkdir order is platform dependent, discovery must not be
		found.sort();
		Ok(found)
	}

	fn create_dir_all(&self, path: &Path) -> Result<(), String> {
		std::fs::create_dir_all(path).map_err(|e| format!("{}: {}", path.display(), e))
	}

	fn remove(&self, path: &Path) -> Result<(), String> {
		let result = if path.is_dir() {
			std::fs::remove_dir_all(path)
		} else {
			std::fs::remove_file(path)
		};
		result.map_err(|e| format!("{}: {}", path.display(), e))
	}

	fn copy(&self, from: &Path, to: &Path) -> Result<(), String> {
		std::fs::copy(from, to)
			.map(|_| ())
			.map_err(|e| format!("{} -> {}: {}", from.display(), to.display(), e))
	}

	fn rename(&self, from: &Path, to: &Path) -> Result<(), String> {
		std::fs::rename(from, to).map_err(|e| format!("{} -> {}: {}", from.display(), to.display(), e))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fixture() -> tempfile::TempDir {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
		std::fs::write(dir.path().join("a.pplugin"), "x").unwrap();
		std::fs::write(dir.path().join("b.txt"), "x").unwrap();
		std::fs::write(dir.path().join("sub/c.pmodule"), "x").unwrap();
		std::fs::write(dir.path().join("sub/deeper/d.pplugin"), "x").unwrap();
		dir
	}

	#[test]
	fn test_extension_filter_and_recursion() {
		let dir = fixture();
		let fs = StandardFileSystem;

		let opts = DirIterOptions {
			extensions: vec!["pplugin".into(), "pmodule".into()],
			..Default::default()
		};
		let found = fs.iterate_dir(dir.path(), &opts).unwrap();
		assert_eq!(found.len(), 3);

		let flat = fs
			.iterate_dir(dir.path(), &DirIterOptions { recursive: false, ..opts.clone() })
			.unwrap();
		assert_eq!(flat.len(), 1);
		assert!(flat[0].ends_with("a.pplugin"));
	}

	#[test]
	fn test_predicate() {
		let dir = fixture();
		let fs = StandardFileSystem;
		let opts = DirIterOptions {
			predicate: Some(std::sync::Arc::new(|p: &Path| {
				p.file_stem().map(|s| s == "d").unwrap_or(false)
			})),
			..Default::default()
		};
		let found = fs.iterate_dir(dir.path(), &opts).unwrap();
		assert_eq!(found.len(), 1);
	}

	#[test]
	fn test_iterate_missing_dir_errors() {
		let fs = StandardFileSystem;
		assert!(fs.iterate_dir(Path::new("/definitely/not/here"), &DirIterOptions::default()).is_err());
	}

	#[test]
	fn test_wildcard_match() {
		assert!(wildcard_match("*", "anything"));
		assert!(wildcard_match("*.pplugin", "hello.pplugin"));
		assert!(!wildcard_match("*.pplugin", "hello.pmodule"));
		assert!(wildcard_match("lib*.so", "libpython.so"));
		assert!(!wildcard_match("lib*.so", "python.so"));
		assert!(wildcard_match("exact", "exact"));
		assert!(!wildcard_match("exact", "exactly"));
	}

	#[test]
	fn test_find_by_glob() {
		let dir = fixture();
		let fs = StandardFileSystem;
		let found = fs.find_by_glob(dir.path(), "*.pplugin").unwrap();
		assert_eq!(found.len(), 2);
		assert!(found.iter().all(|p| p.extension().unwrap() == "pplugin"));
	}
}
