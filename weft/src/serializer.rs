//! Depth-first, pre-order tree encode/decode with ID rewrite (§4.9).
//!
//! Grounded on the teacher's `Cursor`-based header parsing
//! (`raw/heaps/table.rs`'s `TableHeap::try_from`, which reads a fixed header
//! then walks variable-length rows) and its metadata-token ID packing
//! (`metadata_token.rs`), adapted here to container images and
//! 64-bit [`ContainerReference`]s instead of CLI metadata rows and tokens.
//!
//! Wire format per container, written pre-order: `[id: u64 LE][image
//! bytes]`. `id` is the *source* container's ID at encode time; it is
//! discarded on decode (every container gets a fresh ID from the target
//! registry) and exists only so a caller inspecting the raw bytes can see
//! the original tree shape. A Base64 wrapper (§6) round-trips the same
//! bytes through text.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::container::Container;
use crate::error::{Result, StorageError};
use crate::reference::ContainerReference;
use crate::registry::Registry;

/// Serializes the subtree rooted at `root` depth-first, pre-order. `root`
/// must be tracked by `registry`.
pub fn serialize_tree(registry: &Registry, root: ContainerReference) -> Result<Vec<u8>> {
	let mut out = Vec::new();
	encode_container(registry, root, &mut out)?;
	Ok(out)
}

fn encode_container(registry: &Registry, reference: ContainerReference, out: &mut Vec<u8>) -> Result<()> {
	let (image, children) = registry
		.with(reference, |c| (c.image().to_vec(), c.ref_values()))
		.ok_or(StorageError::Disposed)?;

	out.extend_from_slice(&reference.raw().to_le_bytes());
	out.extend_from_slice(&image);

	for child in children {
		if !child.is_null() {
			encode_container(registry, child, out)?;
		}
	}
	Ok(())
}

/// Parses a stream produced by [`serialize_tree`], registering every
/// container it contains against `registry` under freshly assigned IDs and
/// rewriting every non-null ref slot to point at the new ID of the child
/// that follows it in the stream. Returns the root's new reference.
pub fn deserialize_tree(registry: &Registry, bytes: &[u8]) -> Result<ContainerReference> {
	let mut cursor = 0usize;
	decode_container(registry, bytes, &mut cursor)
}

fn decode_container(registry: &Registry, bytes: &[u8], cursor: &mut usize) -> Result<ContainerReference> {
	const ID_SIZE: usize = 8;
	const LENGTH_FIELD_OFFSET: usize = 0; // ContainerHeader::length is the first field (§3).
	const LENGTH_FIELD_SIZE: usize = 4;

	if bytes.len() < *cursor + ID_SIZE + LENGTH_FIELD_OFFSET + LENGTH_FIELD_SIZE {
		return Err(StorageError::InvalidType("truncated serialized stream: missing container header"));
	}

	let header_start = *cursor + ID_SIZE;
	let length_bytes = &bytes[header_start + LENGTH_FIELD_OFFSET..header_start + LENGTH_FIELD_OFFSET + LENGTH_FIELD_SIZE];
	let image_len = u32::from_le_bytes(length_bytes.try_into().unwrap()) as usize;

	if bytes.len() < header_start + image_len {
		return Err(StorageError::InvalidType("truncated serialized stream: image shorter than its own header.length"));
	}

	let image = bytes[header_start..header_start + image_len].to_vec();
	*cursor = header_start + image_len;

	let container = Container::from_image_checked(image)?;
	let ref_slots = container.ref_slots();

	let reference = registry.register(container)?;

	for (field_index, slot, old_value) in ref_slots {
		if old_value.is_null() {
			continue;
		}
		let child = decode_container(registry, bytes, cursor)?;
		registry
			.with_mut(reference, |c| c.write_ref_slot(field_index, slot, child))
			.ok_or(StorageError::Disposed)??;
		registry.set_parent(child, reference);
	}

	Ok(reference)
}

/// Base64 wrapper around [`serialize_tree`] (§6): the text form is the
/// binary image's bytes, Base64-encoded, byte for byte.
pub fn serialize_tree_base64(registry: &Registry, root: ContainerReference) -> Result<String> {
	Ok(BASE64.encode(serialize_tree(registry, root)?))
}

pub fn deserialize_tree_base64(registry: &Registry, text: &str) -> Result<ContainerReference> {
	let bytes = BASE64.decode(text).map_err(|_| StorageError::InvalidType("invalid base64 in serialized stream"))?;
	deserialize_tree(registry, &bytes)
}
