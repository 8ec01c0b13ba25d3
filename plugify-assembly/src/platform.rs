//! Per-platform loader backends. Flags without a native equivalent are
//! silently dropped; the mapping is documented on each backend.

use std::path::{Path, PathBuf};

use enumflags2::BitFlags;

use crate::{AssemblyError, LoadFlag, MemAddr};

/// Platform shared-library file name for a bare module name.
pub fn library_filename(name: &str) -> PathBuf {
	// File name varies by platform
	#[cfg(target_os = "linux")]
	let file = PathBuf::from(format!("lib{}", name)).with_extension("so");
	#[cfg(target_os = "macos")]
	let file = PathBuf::from(format!("lib{}", name)).with_extension("dylib");
	#[cfg(target_os = "windows")]
	let file = PathBuf::from(name).with_extension("dll");

	file
}

#[cfg(unix)]
pub use unix::*;
#[cfg(windows)]
pub use windows::*;

#[cfg(unix)]
mod unix {
	use super::*;
	use libloading::os::unix;

	pub const CAN_LINK_SEARCH_PATHS: bool = false;

	/// `DataOnly` and `SecureSearch` have no dlopen equivalent and are
	/// ignored. `DeepBind` is glibc-only.
	fn native_flags(flags: BitFlags<LoadFlag>) -> std::os::raw::c_int {
		let mut native = if flags.contains(LoadFlag::LazyBinding) {
			unix::RTLD_LAZY
		} else {
			unix::RTLD_NOW
		};
		if flags.contains(LoadFlag::GlobalSymbols) {
			native |= unix::RTLD_GLOBAL;
		} else {
			native |= unix::RTLD_LOCAL;
		}
		if flags.contains(LoadFlag::NoUnload) {
			native |= libc::RTLD_NODELETE;
		}
		#[cfg(all(target_os = "linux", target_env = "gnu"))]
		if flags.contains(LoadFlag::DeepBind) {
			native |= libc::RTLD_DEEPBIND;
		}
		native
	}

	pub struct Library(unix::Library);
	impl Library {
		pub fn open(path: &Path, flags: BitFlags<LoadFlag>) -> Result<Self, AssemblyError> {
			unsafe { unix::Library::open(Some(path), native_flags(flags)) }
				.map(Self)
				.map_err(|e| AssemblyError::LoadFailed(e.to_string()))
		}

		/// Handle for the running program itself (`dlopen(NULL)`).
		#[allow(dead_code)]
		pub fn this() -> Self {
			Self(unix::Library::this())
		}

		pub fn symbol(&self, name: &str) -> Result<MemAddr, AssemblyError> {
			let sym = unsafe { self.0.get::<*mut std::os::raw::c_void>(name.as_bytes()) }
				.map_err(|e| AssemblyError::SymbolNotFound(name.to_string(), e.to_string()))?;
			Ok(MemAddr::new(*sym as usize))
		}
	}

	pub fn link_search_path(_path: &Path) -> Result<(), AssemblyError> {
		Err(AssemblyError::Unsupported("the POSIX linker search path is fixed at process start"))
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn test_native_flags() {
			let lazy = native_flags(LoadFlag::LazyBinding.into());
			assert_eq!(lazy & unix::RTLD_LAZY, unix::RTLD_LAZY);

			let eager = native_flags(BitFlags::empty());
			assert_eq!(eager & unix::RTLD_NOW, unix::RTLD_NOW);

			let global = native_flags(LoadFlag::LazyBinding | LoadFlag::GlobalSymbols);
			assert_eq!(global & unix::RTLD_GLOBAL, unix::RTLD_GLOBAL);

			// windows-only flags must not change anything
			let a = native_flags(LoadFlag::LazyBinding.into());
			let b = native_flags(LoadFlag::LazyBinding | LoadFlag::DataOnly | LoadFlag::SecureSearch);
			assert_eq!(a, b);
		}
	}
}

#[cfg(windows)]
mod windows {
	use super::*;
	use libloading::os::windows;

	pub const CAN_LINK_SEARCH_PATHS: bool = true;

	/// `LazyBinding`, `GlobalSymbols`, `NoUnload` and `DeepBind` have no
	/// LoadLibrary equivalent and are ignored (imports are always eager and
	/// per-module on Windows; pinning is handled by the `Assembly` wrapper).
	fn native_flags(flags: BitFlags<LoadFlag>) -> u32 {
		let mut native = 0;
		if flags.contains(LoadFlag::DataOnly) {
			native |= windows::LOAD_LIBRARY_AS_DATAFILE;
		}
		if flags.contains(LoadFlag::SecureSearch) {
			native |= windows::LOAD_LIBRARY_SEARCH_SYSTEM32
				| windows::LOAD_LIBRARY_SEARCH_APPLICATION_DIR
				| windows::LOAD_LIBRARY_SEARCH_USER_DIRS
				| windows::LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR;
		}
		native
	}

	pub struct Library(windows::Library);
	impl Library {
		pub fn open(path: &Path, flags: BitFlags<LoadFlag>) -> Result<Self, AssemblyError> {
			unsafe { windows::Library::load_with_flags(path, native_flags(flags)) }
				.map(Self)
				.map_err(|e| AssemblyError::LoadFailed(e.to_string()))
		}

		pub fn symbol(&self, name: &str) -> Result<MemAddr, AssemblyError> {
			let sym = unsafe { self.0.get::<*mut std::os::raw::c_void>(name.as_bytes()) }
				.map_err(|e| AssemblyError::SymbolNotFound(name.to_string(), e.to_string()))?;
			Ok(MemAddr::new(*sym as usize))
		}
	}

	pub fn link_search_path(path: &Path) -> Result<(), AssemblyError> {
		use std::os::windows::ffi::OsStrExt;
		let wide: Vec<u16> = path.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
		let cookie = unsafe {
			windows_sys::Win32::System::LibraryLoader::AddDllDirectory(wide.as_ptr())
		};
		if cookie.is_null() {
			Err(AssemblyError::LoadFailed(format!("AddDllDirectory failed for {:?}", path)))
		} else {
			Ok(())
		}
	}
}
