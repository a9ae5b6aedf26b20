//! Stable external references into a container's field directory (§4.7).
//!
//! Grounded on the teacher's `Cell`-cached, re-resolved-on-access pattern
//! (`structured/types.rs`'s `Class`/`Interface`, which cache a resolved
//! member lookup behind a `Cell` and refresh it lazily rather than eagerly
//! invalidating on every mutation).
//!
//! The spec describes two handle flavors — "short-lived" (borrowed name)
//! and "persistent" (owned name) — that are "otherwise identical". Rust's
//! `Cow` expresses that as one generic type instead of two near-duplicate
//! structs (documented as an Open Question resolution in `DESIGN.md`).

use std::borrow::Cow;

use crate::container::Container;
use crate::error::{Result, StorageError};
use crate::events;
use crate::reference::ContainerReference;
use crate::registry::Registry;
use crate::value::Scalar;

/// A name-resolved field reference that re-validates itself against a
/// container's `SchemaVersion` on every access (§4.7). `'n` borrows the
/// name for a stack-bound ("short-lived") handle; pass an owned `String`
/// (coerced into `Cow::Owned`) for one that must outlive the borrow
/// ("persistent").
pub struct FieldHandle<'n> {
	name: Cow<'n, str>,
	schema_version: u32,
	cached_index: Option<usize>,
}

impl<'n> FieldHandle<'n> {
	pub fn new(container: &Container, name: impl Into<Cow<'n, str>>) -> FieldHandle<'n> {
		let name = name.into();
		let cached_index = container.try_index_of(&name);
		FieldHandle { name, schema_version: container.schema_version(), cached_index }
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Refreshes the cached index iff the container's schema has moved on
	/// since the last resolve (§4.7).
	fn resolve(&mut self, container: &Container) -> Result<usize> {
		let current_version = container.schema_version();
		if current_version != self.schema_version {
			self.cached_index = container.try_index_of(&self.name);
			self.schema_version = current_version;
		}
		self.cached_index.ok_or_else(|| StorageError::FieldMissing(self.name.to_string()))
	}

	pub fn read<T: Scalar>(&mut self, container: &Container) -> Result<T> {
		let idx = self.resolve(container)?;
		container.read_at(idx, &self.name)
	}

	pub fn try_read<T: Scalar>(&mut self, container: &Container) -> Option<T> {
		self.read(container).ok()
	}

	/// A rescheme (size change) invalidates the cached index via
	/// `SchemaVersion`; the next access re-resolves it lazily.
	pub fn write<T: Scalar>(&mut self, container: &mut Container, value: T, allow_rescheme: bool) -> Result<()> {
		self.resolve(container)?;
		container.write(&self.name, value, allow_rescheme)
	}
}

/// A non-owning view of one tracked container, offering dot-separated
/// nested field access (`"a.b.c"`) that walks `Ref` fields through the
/// registry (§4.7). Every accessor re-checks that the container is still
/// tracked and raises [`StorageError::Disposed`] otherwise.
pub struct StorageObject<'r> {
	registry: &'r Registry,
	reference: ContainerReference,
}

impl<'r> StorageObject<'r> {
	pub fn new(registry: &'r Registry, reference: ContainerReference) -> StorageObject<'r> {
		StorageObject { registry, reference }
	}

	pub fn reference(&self) -> ContainerReference {
		self.reference
	}

	pub fn registry(&self) -> &'r Registry {
		self.registry
	}

	fn require_tracked(&self) -> Result<()> {
		if self.registry.is_tracked(self.reference) {
			Ok(())
		} else {
			Err(StorageError::Disposed)
		}
	}

	/// Walks every `.`-separated segment but the last as a `Ref` field,
	/// stepping into the referenced child each time; the trailing segment
	/// denotes the field on the final container. When `new_child_image` is
	/// `Some`, a null intermediate ref is auto-created from that template
	/// rather than raising `FieldMissing` (the `OrNew` variant, §4.7).
	fn resolve_path(&self, path: &str, new_child_image: Option<&[u8]>) -> Result<(ContainerReference, String)> {
		let mut segments = path.split('.');
		let mut field_name = segments.next().ok_or_else(|| StorageError::FieldMissing(path.to_string()))?.to_string();
		let mut current = self.reference;

		for next_segment in segments {
			let child = self
				.registry
				.with(current, |c| c.get_ref(&field_name))
				.ok_or(StorageError::Disposed)??;

			let child = if child.is_null() {
				let Some(image) = new_child_image else {
					return Err(StorageError::FieldMissing(field_name));
				};
				let new_ref = self.registry.register(self.registry.create_wild(image))?;
				self.registry
					.with_mut(current, |c| c.set_ref(&field_name, new_ref))
					.ok_or(StorageError::Disposed)??;
				new_ref
			} else {
				child
			};

			self.registry.set_parent(child, current);
			current = child;
			field_name = next_segment.to_string();
		}

		Ok((current, field_name))
	}

	pub fn read<T: Scalar>(&self, path: &str) -> Result<T> {
		self.require_tracked()?;
		let (container, field) = self.resolve_path(path, None)?;
		self.registry.with(container, |c| c.read::<T>(&field)).ok_or(StorageError::Disposed)?
	}

	pub fn try_read<T: Scalar>(&self, path: &str) -> Option<T> {
		self.read(path).ok()
	}

	pub fn write<T: Scalar>(&self, path: &str, value: T, allow_rescheme: bool) -> Result<()> {
		self.require_tracked()?;
		let (container, field) = self.resolve_path(path, None)?;
		self.write_resolved(container, &field, value, allow_rescheme)
	}

	/// Like [`StorageObject::write`], but auto-creates any null
	/// intermediate `Ref` on the path from `new_child_layout` instead of
	/// failing (§4.7's `OrNew` variant).
	pub fn write_or_new<T: Scalar>(&self, path: &str, value: T, allow_rescheme: bool, new_child_image: &[u8]) -> Result<()> {
		self.require_tracked()?;
		let (container, field) = self.resolve_path(path, Some(new_child_image))?;
		self.write_resolved(container, &field, value, allow_rescheme)
	}

	fn write_resolved<T: Scalar>(&self, container: ContainerReference, field: &str, value: T, allow_rescheme: bool) -> Result<()> {
		let field_type = self
			.registry
			.with_mut(container, |c| -> Result<_> {
				c.write(field, value, allow_rescheme)?;
				let idx = c.index_of(field).expect("field was just written");
				Ok(c.field_header(idx)?.field_type)
			})
			.ok_or(StorageError::Disposed)??;
		events::notify_field_write(self.registry, container, field, field_type);
		Ok(())
	}

	/// Removes a field from the container the path resolves to and fires
	/// `notifyFieldDelete` (§4.8).
	pub fn remove(&self, path: &str) -> Result<()> {
		self.require_tracked()?;
		let (container, field) = self.resolve_path(path, None)?;
		let removed_type = self.registry.with_mut(container, |c| c.remove_field(&field)).ok_or(StorageError::Disposed)??;
		events::notify_field_delete(self.registry, container, &field, removed_type);
		Ok(())
	}

	/// Resolves `path` once and returns a [`StorageMember`] that can read
	/// and write it repeatedly without re-walking the path.
	pub fn member(&self, path: &str) -> Result<StorageMember<'r>> {
		self.require_tracked()?;
		let (container, field) = self.resolve_path(path, None)?;
		Ok(StorageMember { registry: self.registry, container, field })
	}
}

/// A field on a (possibly nested) container, resolved once by
/// [`StorageObject::member`]. Cheaper than re-walking a dotted path for
/// repeated access, but still re-resolves the field's index by name on
/// every call (use [`FieldHandle`] directly against a borrowed
/// [`Container`] for the fastest path).
pub struct StorageMember<'r> {
	registry: &'r Registry,
	container: ContainerReference,
	field: String,
}

impl<'r> StorageMember<'r> {
	pub fn read<T: Scalar>(&self) -> Result<T> {
		self.registry.with(self.container, |c| c.read::<T>(&self.field)).ok_or(StorageError::Disposed)?
	}

	pub fn try_read<T: Scalar>(&self) -> Option<T> {
		self.read().ok()
	}

	pub fn write<T: Scalar>(&self, value: T, allow_rescheme: bool) -> Result<()> {
		let field_type = self
			.registry
			.with_mut(self.container, |c| -> Result<_> {
				c.write(&self.field, value, allow_rescheme)?;
				let idx = c.index_of(&self.field).expect("field was just written");
				Ok(c.field_header(idx)?.field_type)
			})
			.ok_or(StorageError::Disposed)??;
		events::notify_field_write(self.registry, self.container, &self.field, field_type);
		Ok(())
	}

	pub fn container(&self) -> ContainerReference {
		self.container
	}

	pub fn field_name(&self) -> &str {
		&self.field
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::builder::ObjectBuilder;

	#[test]
	fn field_handle_caches_index_and_refreshes_after_rescheme() {
		let mut builder = ObjectBuilder::new();
		builder.set_scalar("a", 1i32).unwrap();
		builder.set_scalar("b", 2i32).unwrap();
		let mut container = Container::from_image(builder.build());

		let mut handle = FieldHandle::new(&container, "b");
		assert_eq!(handle.read::<i32>(&container).unwrap(), 2);

		// Rescheme "a" (grows it), which bumps SchemaVersion and reshuffles
		// "b"'s DataOffset; the handle must still find the right value.
		handle.write(&mut container, 99i32, true).unwrap();
		container.write("a", 1i64, true).unwrap();
		assert_eq!(handle.read::<i32>(&container).unwrap(), 99);
	}

	#[test]
	fn storage_object_reads_and_writes_nested_path() {
		let registry = Registry::new();

		let grandchild_ref = {
			let mut b = ObjectBuilder::new();
			b.set_container_name("b");
			b.set_scalar("c", 0i32).unwrap();
			registry.register(registry.create_wild(&b.build())).unwrap()
		};
		let child_ref = {
			let mut b = ObjectBuilder::new();
			b.set_container_name("a");
			b.set_ref("b", grandchild_ref).unwrap();
			registry.register(registry.create_wild(&b.build())).unwrap()
		};
		registry.set_parent(grandchild_ref, child_ref);
		let root_ref = {
			let mut b = ObjectBuilder::new();
			b.set_ref("a", child_ref).unwrap();
			registry.register(registry.create_wild(&b.build())).unwrap()
		};
		registry.set_parent(child_ref, root_ref);

		let root = StorageObject::new(&registry, root_ref);
		root.write("a.b.c", 9i32, false).unwrap();
		assert_eq!(root.read::<i32>("a.b.c").unwrap(), 9);
	}

	#[test]
	fn storage_object_or_new_auto_creates_missing_intermediate() {
		let registry = Registry::new();
		let child_layout = {
			let mut b = ObjectBuilder::new();
			b.set_scalar("c", 0i32).unwrap();
			b.build()
		};
		let root_ref = {
			let mut b = ObjectBuilder::new();
			b.set_ref("a", ContainerReference::NULL).unwrap();
			registry.register(registry.create_wild(&b.build())).unwrap()
		};

		let root = StorageObject::new(&registry, root_ref);
		root.write_or_new("a.c", 5i32, false, &child_layout).unwrap();
		assert_eq!(root.read::<i32>("a.c").unwrap(), 5);
	}

	#[test]
	fn disposed_container_reads_fail_with_disposed() {
		let registry = Registry::new();
		let reference = registry.register(registry.create_wild(&ObjectBuilder::new().build())).unwrap();
		let storage = StorageObject::new(&registry, reference);
		registry.unregister(reference);
		assert!(matches!(storage.read::<i32>("anything"), Err(StorageError::Disposed)));
	}

	#[test]
	fn storage_object_remove_fires_a_delete_event_that_propagates_to_the_root() {
		use std::sync::{Arc, Mutex};

		use crate::events::{subscribe_field, EventKind};
		use crate::value::ValueType;

		let registry = Registry::new();

		let grandchild_ref = {
			let mut b = ObjectBuilder::new();
			b.set_container_name("b");
			b.set_scalar("c", 0i32).unwrap();
			registry.register(registry.create_wild(&b.build())).unwrap()
		};
		let child_ref = {
			let mut b = ObjectBuilder::new();
			b.set_container_name("a");
			b.set_ref("b", grandchild_ref).unwrap();
			registry.register(registry.create_wild(&b.build())).unwrap()
		};
		let root_ref = {
			let mut b = ObjectBuilder::new();
			b.set_ref("a", child_ref).unwrap();
			registry.register(registry.create_wild(&b.build())).unwrap()
		};

		let events: Arc<Mutex<Vec<(String, EventKind, ValueType)>>> = Arc::new(Mutex::new(Vec::new()));
		registry.with(root_ref, |c| {
			let events = events.clone();
			subscribe_field(
				c,
				"a.b.c",
				Box::new(move |event| {
					events.lock().unwrap().push((event.path.clone(), event.kind, event.field_type.unwrap().value_type()));
				}),
			);
		});

		let root = StorageObject::new(&registry, root_ref);
		root.remove("a.b.c").unwrap();

		let seen = events.lock().unwrap();
		assert_eq!(seen.len(), 1);
		assert_eq!(seen[0].0, "a.b.c");
		assert_eq!(seen[0].1, EventKind::Delete);
		assert_eq!(seen[0].2, ValueType::Int32);

		assert!(registry.with(grandchild_ref, |c| c.try_index_of("c").is_none()).unwrap());
	}
}
