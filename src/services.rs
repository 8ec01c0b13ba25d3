//! Type-keyed service locator with three lifetimes. Read-mostly and shared,
//! so the maps sit behind a read/write lock; resolution is a read unless a
//! scoped or singleton instance has to be materialised.

use std::any::{Any, TypeId};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

type AnyService = Arc<dyn Any + Send + Sync>;
type ServiceFactory = Box<dyn Fn() -> AnyService + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLifetime {
	/// A fresh instance on every resolve.
	Transient,
	/// One instance per open scope.
	Scoped,
	/// One instance for the locator's lifetime.
	Singleton,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
	#[error("service unavailable: {0}")]
	Unavailable(&'static str),
	#[error("no scope is open for a scoped service: {0}")]
	NoScope(&'static str),
}

enum Registration {
	Instance(AnyService),
	Factory {
		factory: ServiceFactory,
		lifetime: ServiceLifetime,
	},
}

#[derive(Default)]
struct Inner {
	registrations: FxHashMap<TypeId, Registration>,
	singletons: FxHashMap<TypeId, AnyService>,
	scopes: Vec<FxHashMap<TypeId, AnyService>>,
}

#[derive(Default)]
pub struct ServiceLocator {
	inner: RwLock<Inner>,
}

impl ServiceLocator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a ready-made instance (singleton lifetime by definition).
	pub fn register_instance<T: Send + Sync + 'static>(&self, instance: Arc<T>) {
		let mut inner = self.inner.write();
		inner.registrations.insert(TypeId::of::<T>(), Registration::Instance(instance));
	}

	/// Registers a factory with the given lifetime.
	pub fn register_factory<T, F>(&self, lifetime: ServiceLifetime, factory: F)
	where
		T: Send + Sync + 'static,
		F: Fn() -> Arc<T> + Send + Sync + 'static,
	{
		let mut inner = self.inner.write();
		inner.singletons.remove(&TypeId::of::<T>());
		inner.registrations.insert(
			TypeId::of::<T>(),
			Registration::Factory {
				factory: Box::new(move || factory() as AnyService),
				lifetime,
			},
		);
	}

	/// Like [`register_instance`](Self::register_instance), keeping an
	/// earlier registration if one exists.
	pub fn register_instance_if_missing<T: Send + Sync + 'static>(&self, instance: Arc<T>) {
		let mut inner = self.inner.write();
		inner
			.registrations
			.entry(TypeId::of::<T>())
			.or_insert(Registration::Instance(instance));
	}

	pub fn is_registered<T: 'static>(&self) -> bool {
		self.inner.read().registrations.contains_key(&TypeId::of::<T>())
	}

	pub fn count(&self) -> usize {
		self.inner.read().registrations.len()
	}

	/// Resolves a service or reports it unavailable.
	pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ServiceError> {
		let key = TypeId::of::<T>();
		let type_name = std::any::type_name::<T>();

		{
			let inner = self.inner.read();
			match inner.registrations.get(&key) {
				None => return Err(ServiceError::Unavailable(type_name)),
				Some(Registration::Instance(instance)) => return Ok(downcast::<T>(instance.clone())),
				Some(Registration::Factory { lifetime, .. }) => {
					match lifetime {
						ServiceLifetime::Singleton => {
							if let Some(live) = inner.singletons.get(&key) {
								return Ok(downcast::<T>(live.clone()));
							}
						}
						ServiceLifetime::Scoped => {
							if let Some(scope) = inner.scopes.last() {
								if let Some(live) = scope.get(&key) {
									return Ok(downcast::<T>(live.clone()));
								}
							} else {
								return Err(ServiceError::NoScope(type_name));
							}
						}
						ServiceLifetime::Transient => {}
					}
				}
			}
		}

		// a cached instance has to be made, retake the lock for writing
		let mut inner = self.inner.write();
		let Some(Registration::Factory { factory, lifetime }) = inner.registrations.get(&key) else {
			return Err(ServiceError::Unavailable(type_name));
		};
		let lifetime = *lifetime;
		let instance = factory();

		match lifetime {
			ServiceLifetime::Transient => {}
			ServiceLifetime::Singleton => {
				inner.singletons.entry(key).or_insert_with(|| instance.clone());
				return Ok(downcast::<T>(inner.singletons[&key].clone()));
			}
			ServiceLifetime::Scoped => match inner.scopes.last_mut() {
				Some(scope) => {
					scope.entry(key).or_insert_with(|| instance.clone());
					return Ok(downcast::<T>(inner.scopes.last().unwrap()[&key].clone()));
				}
				None => return Err(ServiceError::NoScope(type_name)),
			},
		}

		Ok(downcast::<T>(instance))
	}

	pub fn try_resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
		self.resolve::<T>().ok()
	}

	pub fn begin_scope(&self) {
		self.inner.write().scopes.push(FxHashMap::default());
	}

	pub fn end_scope(&self) {
		self.inner.write().scopes.pop();
	}

	/// Opens a scope that ends when the guard drops.
	pub fn scope(&self) -> ServiceScope<'_> {
		self.begin_scope();
		ServiceScope { locator: self }
	}

	pub fn clear(&self) {
		let mut inner = self.inner.write();
		inner.registrations.clear();
		inner.singletons.clear();
		inner.scopes.clear();
	}
}

fn downcast<T: Send + Sync + 'static>(any: AnyService) -> Arc<T> {
	any.downcast::<T>().expect("registration key and stored type always agree")
}

/// RAII scope guard from [`ServiceLocator::scope`].
pub struct ServiceScope<'a> {
	locator: &'a ServiceLocator,
}

impl Drop for ServiceScope<'_> {
	fn drop(&mut self) {
		self.locator.end_scope();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct Counter(usize);

	#[test]
	fn test_instance_registration() {
		let services = ServiceLocator::new();
		assert!(!services.is_registered::<Counter>());
		services.register_instance(Arc::new(Counter(7)));
		assert!(services.is_registered::<Counter>());
		assert_eq!(services.resolve::<Counter>().unwrap().0, 7);
		assert_eq!(services.count(), 1);
	}

	#[test]
	fn test_unregistered_is_unavailable() {
		let services = ServiceLocator::new();
		assert!(matches!(services.resolve::<Counter>(), Err(ServiceError::Unavailable(_))));
		assert!(services.try_resolve::<Counter>().is_none());
	}

	#[test]
	fn test_transient_makes_fresh_instances() {
		static MADE: AtomicUsize = AtomicUsize::new(0);
		let services = ServiceLocator::new();
		services.register_factory(ServiceLifetime::Transient, || {
			Arc::new(Counter(MADE.fetch_add(1, Ordering::SeqCst)))
		});
		let a = services.resolve::<Counter>().unwrap();
		let b = services.resolve::<Counter>().unwrap();
		assert_ne!(a.0, b.0);
	}

	#[test]
	fn test_singleton_is_cached() {
		let services = ServiceLocator::new();
		services.register_factory(ServiceLifetime::Singleton, || Arc::new(Counter(3)));
		let a = services.resolve::<Counter>().unwrap();
		let b = services.resolve::<Counter>().unwrap();
		assert!(Arc::ptr_eq(&a, &b));
	}

	#[test]
	fn test_scoped_lifetime() {
		static MADE: AtomicUsize = AtomicUsize::new(0);
		let services = ServiceLocator::new();
		services.register_factory(ServiceLifetime::Scoped, || {
			Arc::new(Counter(MADE.fetch_add(1, Ordering::SeqCst)))
		});

		// no scope open yet
		assert!(matches!(services.resolve::<Counter>(), Err(ServiceError::NoScope(_))));

		let first = {
			let _scope = services.scope();
			let a = services.resolve::<Counter>().unwrap();
			let b = services.resolve::<Counter>().unwrap();
			assert!(Arc::ptr_eq(&a, &b));
			a.0
		};

		// guard dropped, a new scope gets a new instance
		let _scope = services.scope();
		assert_ne!(services.resolve::<Counter>().unwrap().0, first);
	}

	#[test]
	fn test_reregistration_replaces() {
		let services = ServiceLocator::new();
		services.register_instance(Arc::new(Counter(1)));
		services.register_instance_if_missing(Arc::new(Counter(2)));
		assert_eq!(services.resolve::<Counter>().unwrap().0, 1);
		services.register_instance(Arc::new(Counter(3)));
		assert_eq!(services.resolve::<Counter>().unwrap().0, 3);
	}
}
