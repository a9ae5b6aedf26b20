//! Process-wide (or per-instance) table mapping live [`ContainerReference`]s
//! to [`Container`]s, and the recursive teardown that walks ref fields
//! parent-to-child (§4.5).
//!
//! Grounded on the teacher's `structured::Context`: an interior-mutability
//! owner around a bump/table combination, with a single lock guarding the
//! table and short borrows handed back out through closures rather than
//! guard types that would outlive the lock (`structured/context.rs`).
//! `nohash-hasher` is carried from the teacher's own dependency list, reused
//! here for the same reason the teacher pulls it in: the map key is already
//! a well-distributed integer, so re-hashing it is wasted work.

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use derivative::Derivative;
use nohash_hasher::IntMap;

use crate::container::Container;
use crate::error::{Result, StorageError};
use crate::pool::{BufferPool, DefaultPool};
use crate::reference::ContainerReference;

#[derive(Derivative)]
#[derivative(Debug)]
struct RegistryInner {
	#[derivative(Debug = "ignore")]
	containers: IntMap<u64, Container>,
	free_ids: VecDeque<u64>,
	next_id: u64,
	/// `child id → parent id`, maintained by the handles layer whenever a
	/// ref field is written (§4.5's "auxiliary mapping... used only for
	/// event propagation; missing ⇒ no parent").
	parents: IntMap<u64, u64>,
}

impl Default for RegistryInner {
	fn default() -> Self {
		RegistryInner { containers: IntMap::default(), free_ids: VecDeque::new(), next_id: 1, parents: IntMap::default() }
	}
}

/// The registry serializes all ID allocation and disposal on one mutex
/// (§4.5, §5). Traversal during teardown only holds the lock for the map
/// mutation itself; recursing into children happens after the lock is
/// dropped, since the tree-shaped reference discipline guarantees no cycles
/// and therefore no risk of the recursion re-entering a still-held lock.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Registry {
	#[derivative(Debug = "ignore")]
	pool: Box<dyn BufferPool>,
	inner: Mutex<RegistryInner>,
}

static SHARED: OnceLock<Registry> = OnceLock::new();

impl Registry {
	pub fn new() -> Registry {
		Registry::with_pool(DefaultPool::new())
	}

	pub fn with_pool(pool: impl BufferPool + 'static) -> Registry {
		Registry { pool: Box::new(pool), inner: Mutex::new(RegistryInner::default()) }
	}

	/// A process-wide default instance, acceptable per §9 for root
	/// ownership when callers don't want to thread an explicit registry
	/// through their constructors.
	pub fn shared() -> &'static Registry {
		SHARED.get_or_init(Registry::new)
	}

	/// Rents a buffer from the pool and wraps it as a *wild* container
	/// (ID = [`ContainerReference::WILD`]), not yet tracked.
	pub fn create_wild(&self, image: &[u8]) -> Container {
		let mut buffer = self.pool.rent(image.len(), false);
		buffer.clear();
		buffer.extend_from_slice(image);
		Container::from_image(buffer)
	}

	/// Assigns the container its ID and starts tracking it. Requires the
	/// container to currently be wild.
	pub fn register(&self, mut container: Container) -> Result<ContainerReference> {
		if !container.reference().is_wild() {
			return Err(StorageError::InvalidType("register requires a wild container"));
		}
		let mut inner = self.inner.lock().unwrap();
		let recycled = !inner.free_ids.is_empty();
		let id = inner.free_ids.pop_front().unwrap_or_else(|| {
			let id = inner.next_id;
			inner.next_id += 1;
			id
		});
		#[cfg(feature = "tracing")]
		tracing::trace!(id, recycled, "registry assigned container id");
		let reference = ContainerReference::from_raw(id);
		container.set_reference(reference);
		inner.containers.insert(id, container);
		Ok(reference)
	}

	/// If `*slot` already points at a live container, tears it (and its
	/// subtree) down first; then creates and registers a fresh wild
	/// container from `image`, writing the new ID into `*slot` (§4.5).
	pub fn create_at(&self, slot: &mut ContainerReference, image: &[u8]) -> Result<ContainerReference> {
		if slot.is_tracked() {
			self.unregister(*slot);
		}
		let wild = self.create_wild(image);
		let reference = self.register(wild)?;
		*slot = reference;
		Ok(reference)
	}

	/// Idempotent (§7): unregistering a null or already-unregistered
	/// reference is a no-op. Otherwise removes the container from the
	/// table, recursively unregisters every live container reachable
	/// through its `Ref`/`Ref[]` fields (children before the ancestor
	/// finishes disposing, matching §8 scenario 4's ordering), disposes it,
	/// and returns its buffer to the pool.
	pub fn unregister(&self, reference: ContainerReference) {
		if !reference.is_tracked() {
			return;
		}

		let removed = {
			let mut inner = self.inner.lock().unwrap();
			let removed = inner.containers.remove(&reference.raw());
			if removed.is_some() {
				inner.free_ids.push_back(reference.raw());
				inner.parents.remove(&reference.raw());
				#[cfg(feature = "tracing")]
				tracing::trace!(id = reference.raw(), "registry recycled container id");
			}
			removed
		};

		let Some(mut container) = removed else { return };

		for child in collect_ref_children(&container) {
			self.unregister(child);
		}

		container.mark_disposed();
		let buffer = container.take_buffer();
		self.pool.return_buf(buffer);
	}

	/// Runs `f` with shared access to the tracked container, if any.
	pub fn with<R>(&self, reference: ContainerReference, f: impl FnOnce(&Container) -> R) -> Option<R> {
		let inner = self.inner.lock().unwrap();
		inner.containers.get(&reference.raw()).map(f)
	}

	/// Runs `f` with exclusive access to the tracked container, if any.
	pub fn with_mut<R>(&self, reference: ContainerReference, f: impl FnOnce(&mut Container) -> R) -> Option<R> {
		let mut inner = self.inner.lock().unwrap();
		inner.containers.get_mut(&reference.raw()).map(f)
	}

	pub fn is_tracked(&self, reference: ContainerReference) -> bool {
		self.inner.lock().unwrap().containers.contains_key(&reference.raw())
	}

	/// Records `child`'s parent, for upward event propagation (§4.8).
	/// Called by the handles layer whenever a ref field is written through
	/// a registry-aware path.
	pub fn set_parent(&self, child: ContainerReference, parent: ContainerReference) {
		if !child.is_tracked() {
			return;
		}
		let mut inner = self.inner.lock().unwrap();
		if parent.is_tracked() {
			inner.parents.insert(child.raw(), parent.raw());
		} else {
			inner.parents.remove(&child.raw());
		}
	}

	pub fn get_parent(&self, child: ContainerReference) -> Option<ContainerReference> {
		let inner = self.inner.lock().unwrap();
		inner.parents.get(&child.raw()).copied().map(ContainerReference::from_raw)
	}
}

impl Default for Registry {
	fn default() -> Self {
		Registry::new()
	}
}

fn collect_ref_children(container: &Container) -> Vec<ContainerReference> {
	container.ref_values().into_iter().filter(|id| !id.is_null()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::builder::ObjectBuilder;

	fn leaf_image() -> Vec<u8> {
		ObjectBuilder::new().build()
	}

	#[test]
	fn register_assigns_monotonic_ids_and_recycles_on_unregister() {
		let registry = Registry::new();
		let a = registry.register(registry.create_wild(&leaf_image())).unwrap();
		let b = registry.register(registry.create_wild(&leaf_image())).unwrap();
		assert_ne!(a, b);
		registry.unregister(a);
		let c = registry.register(registry.create_wild(&leaf_image())).unwrap();
		assert_eq!(c, a, "freed ids are recycled FIFO");
	}

	#[test]
	fn unregister_is_idempotent_on_null_and_already_freed() {
		let registry = Registry::new();
		registry.unregister(ContainerReference::NULL);
		let a = registry.register(registry.create_wild(&leaf_image())).unwrap();
		registry.unregister(a);
		registry.unregister(a);
	}

	#[test]
	fn recursive_teardown_tears_down_the_whole_subtree() {
		let registry = Registry::new();
		let grand1 = registry.register(registry.create_wild(&leaf_image())).unwrap();
		let grand2 = registry.register(registry.create_wild(&leaf_image())).unwrap();

		let mut child_builder = ObjectBuilder::new();
		child_builder.set_ref_array("grand", &[grand1, grand2]).unwrap();
		let child = registry.register(registry.create_wild(&child_builder.build())).unwrap();

		let mut root_builder = ObjectBuilder::new();
		root_builder.set_ref("child", child).unwrap();
		let root = registry.register(registry.create_wild(&root_builder.build())).unwrap();

		registry.unregister(root);

		assert!(!registry.is_tracked(root));
		assert!(!registry.is_tracked(child));
		assert!(!registry.is_tracked(grand1));
		assert!(!registry.is_tracked(grand2));
	}

	#[test]
	fn parent_lookup_reflects_last_set_parent() {
		let registry = Registry::new();
		let child = registry.register(registry.create_wild(&leaf_image())).unwrap();
		let parent = registry.register(registry.create_wild(&leaf_image())).unwrap();
		assert_eq!(registry.get_parent(child), None);
		registry.set_parent(child, parent);
		assert_eq!(registry.get_parent(child), Some(parent));
	}
}
