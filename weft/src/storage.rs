//! Disposable owner of a tree's root container (§4.6).
//!
//! Grounded on the teacher's `Context` (`structured/context.rs`): a single
//! owning handle around interior-mutable state, constructed once and torn
//! down once. `Storage` narrows that shape to "owns exactly one
//! `ContainerReference` and recursively tears down everything reachable
//! from it".

use crate::builder::ContainerLayout;
use crate::error::Result;
use crate::handles::StorageObject;
use crate::reference::ContainerReference;
use crate::registry::Registry;

/// Owns the root of a container tree. Dropping (or explicitly calling
/// [`Storage::dispose`]) recursively unregisters the whole tree through the
/// registry (§4.5, §4.6). Disposing twice is safe: the second attempt
/// observes a null root and does nothing.
pub struct Storage<'r> {
	registry: &'r Registry,
	root: ContainerReference,
}

impl<'r> Storage<'r> {
	/// Instantiates `layout` as the root and registers it.
	pub fn new(registry: &'r Registry, layout: &ContainerLayout) -> Result<Storage<'r>> {
		Storage::from_image(registry, &layout.instantiate())
	}

	/// Registers an already-built image as the root.
	pub fn from_image(registry: &'r Registry, image: &[u8]) -> Result<Storage<'r>> {
		let mut slot = ContainerReference::NULL;
		registry.create_at(&mut slot, image)?;
		Ok(Storage { registry, root: slot })
	}

	pub fn root_ref(&self) -> ContainerReference {
		self.root
	}

	pub fn object(&self) -> StorageObject<'r> {
		StorageObject::new(self.registry, self.root)
	}

	pub fn registry(&self) -> &'r Registry {
		self.registry
	}

	/// Tears the tree down now rather than waiting for `Drop`.
	pub fn dispose(mut self) {
		self.dispose_once();
	}

	fn dispose_once(&mut self) {
		if self.root.is_tracked() {
			self.registry.unregister(self.root);
			self.root = ContainerReference::NULL;
		}
	}
}

impl Drop for Storage<'_> {
	fn drop(&mut self) {
		self.dispose_once();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::builder::ObjectBuilder;

	#[test]
	fn dispose_tears_down_the_whole_tree_and_is_idempotent() {
		let registry = Registry::new();
		let child_ref = registry.register(registry.create_wild(&ObjectBuilder::new().build())).unwrap();

		let mut root_builder = ObjectBuilder::new();
		root_builder.set_ref("child", child_ref).unwrap();
		let storage = Storage::from_image(&registry, &root_builder.build()).unwrap();
		let root_ref = storage.root_ref();
		registry.set_parent(child_ref, root_ref);

		storage.dispose();

		assert!(!registry.is_tracked(root_ref));
		assert!(!registry.is_tracked(child_ref));
	}

	#[test]
	fn drop_disposes_without_explicit_call() {
		let registry = Registry::new();
		let root_ref = {
			let storage = Storage::from_image(&registry, &ObjectBuilder::new().build()).unwrap();
			let root_ref = storage.root_ref();
			assert!(registry.is_tracked(root_ref));
			root_ref
		};
		assert!(!registry.is_tracked(root_ref));
	}
}
