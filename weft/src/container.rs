//! Packed container image and its field-level operations (§4.3).
//!
//! A [`Container`] owns one contiguous buffer laid out per [`crate::layout`].
//! Field order on disk is stable; callers address fields by name, resolved
//! by comparing a 32-bit ordinal hash and then the raw name bytes.

use std::mem::size_of;
use std::sync::Mutex;

use crate::error::{Result, StorageError};
use crate::events::ContainerSubscriptions;
use crate::layout::{self, ContainerHeader, FieldHeader};
use crate::reference::ContainerReference;
use crate::utilities::{decode_utf16, encode_utf16, hash_name, read_utf16_le, write_utf16_le};
use crate::value::{codec, FieldType, Scalar, ValueType};

/// `Wild → Tracked → Disposed` (§4.3). `Wild` containers have
/// `reference() == ContainerReference::WILD`; `Tracked` containers have a
/// live ID assigned by a [`crate::registry::Registry`]; `Disposed`
/// containers have had their generation advanced and buffer reclaimed.
pub struct Container {
	reference: ContainerReference,
	generation: u32,
	schema_version: u32,
	buffer: Vec<u8>,
	subscriptions: Mutex<Option<ContainerSubscriptions>>,
}

fn ranges_overlap(a: std::ops::Range<usize>, b: std::ops::Range<usize>) -> bool {
	a.start < b.end && b.start < a.end
}

impl Container {
	/// Wraps an already-laid-out image (as produced by
	/// [`crate::builder::ObjectBuilder`]) without validating every
	/// invariant — callers that built the image themselves can skip the
	/// cost; use [`Container::from_image_checked`] for untrusted bytes.
	pub fn from_image(buffer: Vec<u8>) -> Container {
		Container {
			reference: ContainerReference::WILD,
			generation: 0,
			schema_version: 0,
			buffer,
			subscriptions: Mutex::new(None),
		}
	}

	/// Like [`Container::from_image`] but checks the structural invariants
	/// of §8 before accepting the buffer (used by the deserializer, which
	/// does not trust its input).
	pub fn from_image_checked(buffer: Vec<u8>) -> Result<Container> {
		let container = Container::from_image(buffer);
		container.validate()?;
		Ok(container)
	}

	#[inline]
	pub fn reference(&self) -> ContainerReference {
		self.reference
	}

	#[inline]
	pub fn generation(&self) -> u32 {
		self.generation
	}

	#[inline]
	pub fn schema_version(&self) -> u32 {
		self.schema_version
	}

	#[inline]
	pub fn image(&self) -> &[u8] {
		&self.buffer
	}

	pub(crate) fn set_reference(&mut self, reference: ContainerReference) {
		self.reference = reference;
	}

	pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
		std::mem::take(&mut self.buffer)
	}

	pub(crate) fn mark_disposed(&mut self) {
		crate::events::fire_local_dispose(self);
		self.generation = self.generation.checked_add(1).expect("container generation overflowed u32");
		#[cfg(feature = "tracing")]
		tracing::trace!(generation = self.generation, "container generation rolled over on dispose");
		self.reference = ContainerReference::WILD;
	}

	pub(crate) fn subscriptions(&self) -> &Mutex<Option<ContainerSubscriptions>> {
		&self.subscriptions
	}

	pub fn header(&self) -> ContainerHeader {
		ContainerHeader::read(&self.buffer)
	}

	#[inline]
	pub fn field_count(&self) -> usize {
		self.header().field_count as usize
	}

	/// The container's own UTF-16 name, stored right after the field
	/// header array (§3 image layout).
	pub fn name(&self) -> String {
		let header = self.header();
		let start = layout::container_name_offset(header.field_count as usize);
		let len = header.container_name_length as usize;
		decode_utf16(&read_utf16_le(&self.buffer[start..start + len]))
	}

	pub fn field_header(&self, index: usize) -> Result<FieldHeader> {
		let count = self.field_count();
		if index >= count {
			return Err(StorageError::IndexOutOfRange { index, len: count });
		}
		let offset = layout::field_header_offset(index);
		Ok(FieldHeader::read(&self.buffer[offset..offset + layout::FIELD_HEADER_SIZE]))
	}

	fn write_field_header(&mut self, index: usize, header: &FieldHeader) {
		let offset = layout::field_header_offset(index);
		header.write(&mut self.buffer[offset..offset + layout::FIELD_HEADER_SIZE]);
	}

	fn field_name_units(&self, header: &FieldHeader) -> Vec<u16> {
		let start = header.name_offset as usize;
		let len = header.name_length as usize * 2;
		read_utf16_le(&self.buffer[start..start + len])
	}

	/// Linear scan comparing the stored ordinal hash, then the raw name
	/// bytes on a hash match (§4.3).
	pub fn index_of(&self, name: &str) -> Option<usize> {
		let query = encode_utf16(name);
		let hash = hash_name(&query);
		for i in 0..self.field_count() {
			let header = self.field_header(i).ok()?;
			if header.name_hash != hash {
				continue;
			}
			if self.field_name_units(&header) == query {
				return Some(i);
			}
		}
		None
	}

	pub fn field_bytes(&self, index: usize) -> Result<&[u8]> {
		let header = self.field_header(index)?;
		let start = header.data_offset as usize;
		let end = start + header.length as usize;
		Ok(&self.buffer[start..end])
	}

	pub fn field_bytes_mut(&mut self, index: usize) -> Result<&mut [u8]> {
		let header = self.field_header(index)?;
		let start = header.data_offset as usize;
		let end = start + header.length as usize;
		Ok(&mut self.buffer[start..end])
	}

	fn field_index(&self, name: &str) -> Result<usize> {
		self.index_of(name).ok_or_else(|| StorageError::FieldMissing(name.to_string()))
	}

	pub fn try_index_of(&self, name: &str) -> Option<usize> {
		self.index_of(name)
	}

	pub fn read<T: Scalar>(&self, name: &str) -> Result<T> {
		let idx = self.field_index(name)?;
		self.read_at(idx, name)
	}

	/// Reads through an already-resolved index, skipping the name scan —
	/// the whole point of caching a [`crate::handles::FieldHandle`] (§4.7).
	/// `name` is only used to label a `SizeMismatch` error.
	pub(crate) fn read_at<T: Scalar>(&self, idx: usize, name: &str) -> Result<T> {
		let header = self.field_header(idx)?;
		let expected = size_of::<T>() as u32;
		if header.length != expected {
			return Err(StorageError::SizeMismatch { field: name.to_string(), expected: header.length, got: expected });
		}
		Ok(T::from_le_bytes(self.field_bytes(idx)?))
	}

	/// Never raises; reports failure as `None` (§7).
	pub fn try_read<T: Scalar>(&self, name: &str) -> Option<T> {
		self.read(name).ok()
	}

	/// Writes a fresh scalar value. When the field is already a scalar of
	/// the same element size, the bytes (and the type tag, if it changed)
	/// are overwritten in place. Otherwise, unless `allow_rescheme` is set,
	/// this raises [`StorageError::SizeMismatch`]; with `allow_rescheme` the
	/// container is re-laid-out around the new field shape (§4.3).
	pub fn write<T: Scalar>(&mut self, name: &str, value: T, allow_rescheme: bool) -> Result<()> {
		let idx = self.field_index(name)?;
		let header = self.field_header(idx)?;
		let new_elem_size = size_of::<T>() as u16;
		let is_scalar_now = header.length == header.elem_size as u32;

		if is_scalar_now && header.elem_size == new_elem_size {
			let mut bytes = vec![0u8; new_elem_size as usize];
			value.write_le_bytes(&mut bytes);
			self.field_bytes_mut(idx)?.copy_from_slice(&bytes);
			if header.field_type.value_type() != T::VALUE_TYPE {
				let mut h = header;
				h.field_type = FieldType::scalar(T::VALUE_TYPE);
				self.write_field_header(idx, &h);
			}
			return Ok(());
		}

		if !allow_rescheme {
			return Err(StorageError::SizeMismatch { field: name.to_string(), expected: header.length, got: new_elem_size as u32 });
		}

		let mut payload = vec![0u8; new_elem_size as usize];
		value.write_le_bytes(&mut payload);
		self.relayout_field(idx, FieldType::scalar(T::VALUE_TYPE), new_elem_size, payload)
	}

	/// Overwrites a field's payload byte-for-byte; the supplied length must
	/// match the field's current `Length` exactly (no rescheme).
	pub fn write_raw(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
		let idx = self.field_index(name)?;
		let header = self.field_header(idx)?;
		if bytes.len() as u32 != header.length {
			return Err(StorageError::SizeMismatch { field: name.to_string(), expected: header.length, got: bytes.len() as u32 });
		}

		let self_range = self.buffer.as_ptr() as usize..self.buffer.as_ptr() as usize + self.buffer.len();
		let src_range = bytes.as_ptr() as usize..bytes.as_ptr() as usize + bytes.len();
		if ranges_overlap(self_range, src_range) {
			return Err(StorageError::OverlappingBuffer);
		}

		self.field_bytes_mut(idx)?.copy_from_slice(bytes);
		Ok(())
	}

	/// Replaces a field with an array of `count` elements of `ty`.
	/// Existing content survives only when the new field's byte length
	/// equals the old one and the element type is unchanged; otherwise the
	/// new payload is zeroed (§4.4).
	pub fn make_array(&mut self, name: &str, ty: ValueType, count: usize) -> Result<()> {
		let elem_size = ty
			.size()
			.ok_or(StorageError::InvalidType("array element type must carry an intrinsic size (Blob arrays are not supported by make_array)"))?;
		let idx = self.field_index(name)?;
		let header = self.field_header(idx)?;
		let new_length = elem_size as usize * count;

		let payload = if header.length as usize == new_length && header.field_type.value_type() == ty {
			self.field_bytes(idx)?.to_vec()
		} else {
			vec![0u8; new_length]
		};

		self.relayout_field(idx, FieldType::array(ty), elem_size, payload)
	}

	/// Migrates a field's element type (and, optionally, its element
	/// count) through the value codec. When the element size and count are
	/// both unchanged the conversion happens in place; otherwise a full
	/// re-layout is performed (§4.3).
	pub fn change_field_type(&mut self, name: &str, new_type: ValueType, array_len: Option<usize>) -> Result<()> {
		let idx = self.field_index(name)?;
		let header = self.field_header(idx)?;
		let old_type = header.field_type.value_type();
		let new_elem_size = new_type
			.size()
			.ok_or(StorageError::InvalidType("change_field_type requires a type with an intrinsic size; Blob element size must be set via the builder"))?;
		let old_count = header.count();
		let new_count = array_len.unwrap_or(old_count.max(1));
		let is_array = array_len.is_some() || header.field_type.is_array();

		if new_elem_size == header.elem_size && new_count == old_count {
			let old_bytes = self.field_bytes(idx)?.to_vec();
			let mut new_bytes = vec![0u8; old_bytes.len()];
			codec::convert_array(&old_bytes, &mut new_bytes, old_type, new_type);
			self.field_bytes_mut(idx)?.copy_from_slice(&new_bytes);
			let mut h = self.field_header(idx)?;
			h.field_type = FieldType::new(new_type, is_array);
			self.write_field_header(idx, &h);
			return Ok(());
		}

		let old_bytes = self.field_bytes(idx)?.to_vec();
		let mut new_bytes = vec![0u8; new_elem_size as usize * new_count];
		codec::convert_array(&old_bytes, &mut new_bytes, old_type, new_type);
		self.relayout_field(idx, FieldType::new(new_type, is_array), new_elem_size, new_bytes)
	}

	pub fn get_ref(&self, name: &str) -> Result<ContainerReference> {
		let idx = self.field_index(name)?;
		let header = self.field_header(idx)?;
		if header.field_type.value_type() != ValueType::Ref || header.field_type.is_array() {
			return Err(StorageError::TypeMismatch { field: name.to_string() });
		}
		let bytes = self.field_bytes(idx)?;
		Ok(ContainerReference::from_raw(u64::from_le_bytes(bytes[..8].try_into().unwrap())))
	}

	pub fn get_ref_span(&self, name: &str) -> Result<Vec<ContainerReference>> {
		let idx = self.field_index(name)?;
		let header = self.field_header(idx)?;
		if header.field_type.value_type() != ValueType::Ref {
			return Err(StorageError::TypeMismatch { field: name.to_string() });
		}
		let bytes = self.field_bytes(idx)?;
		Ok(bytes.chunks_exact(8).map(|c| ContainerReference::from_raw(u64::from_le_bytes(c.try_into().unwrap()))).collect())
	}

	/// Every `Ref`/`Ref[]` slot, as `(field_index, slot_index, value)`
	/// triples in field-then-array order. Used by the registry's recursive
	/// teardown and by the serializer, which rewrites each non-null slot's
	/// value to a freshly assigned child ID after recursing into it
	/// (§4.5, §4.9).
	pub(crate) fn ref_slots(&self) -> Vec<(usize, usize, ContainerReference)> {
		let mut out = Vec::new();
		for i in 0..self.field_count() {
			let Ok(header) = self.field_header(i) else { continue };
			if header.field_type.value_type() != ValueType::Ref {
				continue;
			}
			let Ok(bytes) = self.field_bytes(i) else { continue };
			for (slot, chunk) in bytes.chunks_exact(8).enumerate() {
				out.push((i, slot, ContainerReference::from_raw(u64::from_le_bytes(chunk.try_into().unwrap()))));
			}
		}
		out
	}

	/// Just the values from [`Container::ref_slots`], dropping position
	/// information.
	pub fn ref_values(&self) -> Vec<ContainerReference> {
		self.ref_slots().into_iter().map(|(_, _, value)| value).collect()
	}

	/// Overwrites one ref slot by its raw field/array position, skipping
	/// the by-name scan (the serializer already knows the position from
	/// [`Container::ref_slots`]).
	pub(crate) fn write_ref_slot(&mut self, field_index: usize, slot: usize, value: ContainerReference) -> Result<()> {
		let bytes = self.field_bytes_mut(field_index)?;
		let start = slot * 8;
		bytes[start..start + 8].copy_from_slice(&value.raw().to_le_bytes());
		Ok(())
	}

	pub fn set_ref(&mut self, name: &str, value: ContainerReference) -> Result<()> {
		let idx = self.field_index(name)?;
		let header = self.field_header(idx)?;
		if header.field_type.value_type() != ValueType::Ref || header.field_type.is_array() {
			return Err(StorageError::TypeMismatch { field: name.to_string() });
		}
		self.field_bytes_mut(idx)?.copy_from_slice(&value.raw().to_le_bytes());
		Ok(())
	}

	pub fn set_ref_at(&mut self, name: &str, slot: usize, value: ContainerReference) -> Result<()> {
		let idx = self.field_index(name)?;
		let header = self.field_header(idx)?;
		if header.field_type.value_type() != ValueType::Ref {
			return Err(StorageError::TypeMismatch { field: name.to_string() });
		}
		let count = header.count();
		if slot >= count {
			return Err(StorageError::IndexOutOfRange { index: slot, len: count });
		}
		let bytes = self.field_bytes_mut(idx)?;
		bytes[slot * 8..slot * 8 + 8].copy_from_slice(&value.raw().to_le_bytes());
		Ok(())
	}

	/// Zeroes the data region only; headers and names are untouched.
	pub fn clear(&mut self) {
		let start = self.header().data_offset as usize;
		self.buffer[start..].fill(0);
	}

	/// Drops a field entirely, re-laying-out the image around the smaller
	/// field set (supplement to §4.3's table: the builder can omit a field
	/// before `build()`, but an already-built container otherwise has no
	/// way to shrink its field set — needed for [`crate::events`]'s
	/// `notifyFieldDelete`). Returns the removed field's type, which the
	/// caller uses as the delete notification's payload.
	pub fn remove_field(&mut self, name: &str) -> Result<FieldType> {
		let idx = self.field_index(name)?;
		let removed_type = self.field_header(idx)?.field_type;
		let mut builder = crate::builder::ObjectBuilder::from_container(self)?;
		builder.remove(name);
		self.buffer = builder.build();
		self.schema_version = self.schema_version.checked_add(1).expect("schema_version overflowed u32");
		Ok(removed_type)
	}

	/// Deep-copies the image into a fresh, wild container with generation 0
	/// (open question resolved in DESIGN.md: a clone starts its own
	/// lifecycle rather than inheriting the source's generation, since it
	/// is not the same tracked identity).
	pub fn deep_clone(&self) -> Container {
		Container {
			reference: ContainerReference::WILD,
			generation: 0,
			schema_version: self.schema_version,
			buffer: self.buffer.clone(),
			subscriptions: Mutex::new(None),
		}
	}

	/// Re-lays-out the whole image around a replacement for field `idx`:
	/// other fields are copied byte-for-byte at their (possibly shifted)
	/// offsets, names and the container name are preserved, and
	/// `SchemaVersion` advances (§4.2, §4.3).
	#[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(self, new_payload)))]
	fn relayout_field(&mut self, idx: usize, new_type: FieldType, new_elem_size: u16, new_payload: Vec<u8>) -> Result<()> {
		#[cfg(feature = "tracing")]
		tracing::trace!(field = idx, new_elem_size, payload_len = new_payload.len(), "relayout_field");

		let old_header = self.header();
		let field_count = old_header.field_count as usize;
		let container_name_length = old_header.container_name_length as usize;

		let mut headers = Vec::with_capacity(field_count);
		let mut names = Vec::with_capacity(field_count);
		let mut payloads = Vec::with_capacity(field_count);
		for i in 0..field_count {
			let h = self.field_header(i)?;
			names.push(self.field_name_units(&h));
			payloads.push(if i == idx { new_payload.clone() } else { self.field_bytes(i)?.to_vec() });
			headers.push(h);
		}

		let container_name = {
			let start = layout::container_name_offset(field_count);
			self.buffer[start..start + container_name_length].to_vec()
		};

		let names_start = layout::names_blob_offset(field_count, container_name_length);
		let names_bytes_total: usize = names.iter().map(|n| n.len() * 2).sum();
		let data_start = names_start + names_bytes_total;
		let total_len = data_start + payloads.iter().map(Vec::len).sum::<usize>();

		let mut new_buf = vec![0u8; total_len];

		let new_header = ContainerHeader {
			length: total_len as u32,
			version: old_header.version,
			field_count: field_count as u32,
			data_offset: data_start as u32,
			container_name_length: container_name_length as u16,
		};
		new_header.write(&mut new_buf[..layout::CONTAINER_HEADER_SIZE]);

		let cn_start = layout::container_name_offset(field_count);
		new_buf[cn_start..cn_start + container_name_length].copy_from_slice(&container_name);

		let mut name_cursor = names_start;
		let mut data_cursor = data_start;
		for i in 0..field_count {
			let name_units = &names[i];
			let name_bytes_len = name_units.len() * 2;
			write_utf16_le(name_units, &mut new_buf[name_cursor..name_cursor + name_bytes_len]);

			let payload = &payloads[i];
			new_buf[data_cursor..data_cursor + payload.len()].copy_from_slice(payload);

			let field_type = if i == idx { new_type } else { headers[i].field_type };
			let elem_size = if i == idx { new_elem_size } else { headers[i].elem_size };

			let header = FieldHeader {
				name_hash: headers[i].name_hash,
				name_offset: name_cursor as u32,
				name_length: headers[i].name_length,
				field_type,
				reserved: 0,
				data_offset: data_cursor as u32,
				elem_size,
				length: payload.len() as u32,
			};
			let offset = layout::field_header_offset(i);
			header.write(&mut new_buf[offset..offset + layout::FIELD_HEADER_SIZE]);

			name_cursor += name_bytes_len;
			data_cursor += payload.len();
		}

		self.buffer = new_buf;
		self.schema_version = self.schema_version.checked_add(1).expect("schema_version overflowed u32");
		Ok(())
	}

	pub fn field_name(&self, index: usize) -> Result<String> {
		let header = self.field_header(index)?;
		Ok(decode_utf16(&self.field_name_units(&header)))
	}

	/// Checks the invariants of §8: image length matches the header, every
	/// field payload range fits inside the buffer, those ranges are
	/// pairwise disjoint, `image.len == DataOffset + Σ field.Length`, every
	/// stored name hash matches its bytes, and no two fields share a name.
	///
	/// This is what stands between an untrusted image (the deserializer's
	/// input, §4.9) and the panics that `field_bytes`/`field_bytes_mut`
	/// would otherwise hit on a corrupted `DataOffset`/`Length` pair — it
	/// must reject any field whose claimed range runs past the buffer's
	/// end before returning `Ok`.
	pub fn validate(&self) -> Result<()> {
		let header = self.header();
		if header.length as usize != self.buffer.len() {
			return Err(StorageError::InvalidType("image length does not match header.length"));
		}

		let mut ranges = Vec::with_capacity(header.field_count as usize);
		let mut seen_names: Vec<Vec<u16>> = Vec::with_capacity(header.field_count as usize);
		let mut payload_total: u64 = 0;
		for i in 0..header.field_count as usize {
			let h = self.field_header(i)?;
			if (h.data_offset as usize) < header.data_offset as usize {
				return Err(StorageError::InvalidType("field data offset precedes the data region"));
			}
			let end = h.data_offset as u64 + h.length as u64;
			if end > self.buffer.len() as u64 {
				return Err(StorageError::InvalidType("field payload range extends past the end of the image"));
			}
			let range = h.data_offset as usize..end as usize;
			for other in &ranges {
				if ranges_overlap(range.clone(), *other) {
					return Err(StorageError::InvalidType("overlapping field payload ranges"));
				}
			}
			ranges.push(range);
			payload_total += h.length as u64;

			let units = self.field_name_units(&h);
			if hash_name(&units) != h.name_hash {
				return Err(StorageError::InvalidType("stored name hash does not match stored name bytes"));
			}
			if seen_names.contains(&units) {
				return Err(StorageError::DuplicateFieldName(decode_utf16(&units)));
			}
			seen_names.push(units);
		}

		if header.data_offset as u64 + payload_total != self.buffer.len() as u64 {
			return Err(StorageError::InvalidType("image length does not equal data_offset plus the sum of field lengths"));
		}

		Ok(())
	}
}
