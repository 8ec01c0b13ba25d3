//! Exported methods get wrapped in callback trampolines at load time; a
//! caller from any language gets the method's real C signature and the
//! module sees its uniform handler.

mod common;

use common::*;
use plugify::PackageState;

fn blend_manifest() -> &'static str {
	"[[methods]]\nname = \"blend\"\n\
	 paramTypes = [{ type = \"int32\" }, { type = \"float\" }, { type = \"ptr64\" }]\n\
	 retType = { type = \"double\" }\n"
}

#[test]
fn exported_methods_are_published() {
	let mut loader = TestModuleLoader::new(new_log());
	loader.export = true;
	let (_dir, mut plugify) = host_with(loader, |exts| {
		write_module_manifest(exts, "lang", "py");
		write_plugin_manifest(exts, "mathy", "py", "1.0.0", blend_manifest());
	});

	assert!(plugify.initialize().unwrap());
	let mathy = plugify.get_extension("mathy").unwrap();
	assert_eq!(mathy.state, PackageState::Started);

	let export = mathy.find_export("blend").expect("blend is published");
	assert!(!export.addr.is_null());
	assert_eq!(export.method.name, "blend");
}

#[test]
fn export_events_fire_after_publication() {
	let events = new_log();
	let mut loader = TestModuleLoader::new(events.clone());
	loader.export = true;
	let (_dir, mut plugify) = host_with(loader, |exts| {
		write_module_manifest(exts, "lang", "py");
		write_plugin_manifest(exts, "mathy", "py", "1.0.0", blend_manifest());
	});

	assert!(plugify.initialize().unwrap());
	let seen = events_of(&events);
	assert!(seen.contains(&"export mathy".to_string()), "{:?}", seen);
}

/// Scenario: a caller invokes the published trampoline with the method's
/// native signature and the handler's arithmetic comes back out.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn published_trampoline_round_trips() {
	let mut loader = TestModuleLoader::new(new_log());
	loader.export = true;
	let (_dir, mut plugify) = host_with(loader, |exts| {
		write_module_manifest(exts, "lang", "py");
		write_plugin_manifest(exts, "mathy", "py", "1.0.0", blend_manifest());
	});

	assert!(plugify.initialize().unwrap());
	let mathy = plugify.get_extension("mathy").unwrap();
	let export = mathy.find_export("blend").unwrap();

	let blend: unsafe extern "C" fn(i32, f32, *const u8) -> f64 =
		unsafe { std::mem::transmute(export.addr.as_ptr::<u8>()) };
	let got = unsafe { blend(3, 4.0, 0xABCD as *const u8) };
	assert_eq!(got, 11.0 + 0xABCD as f64);
}

/// The trampolines die with their extension: after terminate the jit
/// runtime holds nothing.
#[test]
fn teardown_releases_trampolines() {
	let mut loader = TestModuleLoader::new(new_log());
	loader.export = true;
	let (_dir, mut plugify) = host_with(loader, |exts| {
		write_module_manifest(exts, "lang", "py");
		write_plugin_manifest(exts, "mathy", "py", "1.0.0", blend_manifest());
	});

	assert!(plugify.initialize().unwrap());
	let jit = plugify.manager().jit_runtime();
	assert_eq!(jit.live_trampolines(), 1);

	plugify.terminate();
	assert_eq!(jit.live_trampolines(), 0);
}
