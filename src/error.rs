//! Error taxonomy. Nothing panics across a component boundary; extension
//! callbacks that do panic are caught at the engine edge and come out as
//! `InitializationFailed`.

use plugify_assembly::AssemblyError;
use plugify_jit::JitError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Assembly(#[from] AssemblyError),

	#[error("invalid manifest: {0}")]
	InvalidManifest(String),

	#[error("missing dependency: {0}")]
	MissingDependency(String),
	#[error("version conflict: {0}")]
	VersionConflict(String),
	#[error("conflict detected: {0}")]
	ConflictDetected(String),
	#[error("circular dependency: {0}")]
	CircularDependency(String),
	#[error("validation failed: {0}")]
	ValidationFailed(String),
	#[error("disabled by policy: {0}")]
	DisabledByPolicy(String),

	#[error("initialization failed: {0}")]
	InitializationFailed(String),
	#[error("jit codegen failed: {0}")]
	JitCodegenFailed(#[from] JitError),
}
