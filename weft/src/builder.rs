//! Staged field set → packed image, and [`ContainerLayout`], a reusable
//! stamp for containers that all share one shape (§4.4). Grounded on the
//! teacher's string-heap interning idiom (accumulate into a scratch
//! structure, then emit absolute offsets in one pass over the final
//! buffer).

use std::collections::BTreeMap;
use std::mem::size_of;

use crate::container::Container;
use crate::error::{Result, StorageError};
use crate::layout::{self, ContainerHeader, FieldHeader};
use crate::reference::ContainerReference;
use crate::utilities::{decode_utf16, encode_utf16, hash_name, write_utf16_le};
use crate::value::{FieldType, Scalar, ValueType};

struct FieldSpec {
	field_type: FieldType,
	elem_size: u16,
	payload: Vec<u8>,
}

/// Ordered `name → field` staging area. Fields are kept sorted by name
/// ordinal so that builds are deterministic regardless of insertion order
/// (§4.4).
#[derive(Default)]
pub struct ObjectBuilder {
	container_name: String,
	fields: BTreeMap<String, FieldSpec>,
}

impl ObjectBuilder {
	pub fn new() -> ObjectBuilder {
		ObjectBuilder::default()
	}

	pub fn set_container_name(&mut self, name: &str) -> &mut Self {
		self.container_name = name.to_string();
		self
	}

	pub fn set_scalar<T: Scalar>(&mut self, name: &str, value: T) -> Result<&mut Self> {
		let mut payload = vec![0u8; size_of::<T>()];
		value.write_le_bytes(&mut payload);
		self.set_raw(name, FieldType::scalar(T::VALUE_TYPE), size_of::<T>() as u16, payload)
	}

	pub fn set_array<T: Scalar>(&mut self, name: &str, values: &[T]) -> Result<&mut Self> {
		let elem_size = size_of::<T>();
		let mut payload = vec![0u8; elem_size * values.len()];
		for (i, value) in values.iter().enumerate() {
			value.write_le_bytes(&mut payload[i * elem_size..(i + 1) * elem_size]);
		}
		self.set_raw(name, FieldType::array(T::VALUE_TYPE), elem_size as u16, payload)
	}

	pub fn set_ref(&mut self, name: &str, value: ContainerReference) -> Result<&mut Self> {
		self.set_raw(name, FieldType::scalar(ValueType::Ref), 8, value.raw().to_le_bytes().to_vec())
	}

	pub fn set_ref_array(&mut self, name: &str, values: &[ContainerReference]) -> Result<&mut Self> {
		let mut payload = vec![0u8; values.len() * 8];
		for (i, value) in values.iter().enumerate() {
			payload[i * 8..i * 8 + 8].copy_from_slice(&value.raw().to_le_bytes());
		}
		self.set_raw(name, FieldType::array(ValueType::Ref), 8, payload)
	}

	/// `Blob` requires an explicit, non-zero element size (§4.4 edge case).
	pub fn set_blob_array(&mut self, name: &str, elem_size: u16, payload: Vec<u8>) -> Result<&mut Self> {
		if elem_size == 0 {
			return Err(StorageError::InvalidType("Blob fields require a non-zero explicit element size"));
		}
		self.set_raw(name, FieldType::array(ValueType::Blob), elem_size, payload)
	}

	/// An opaque scalar field with no interpreted type (`ValueType::Unknown`).
	pub fn set_bytes(&mut self, name: &str, payload: Vec<u8>) -> Result<&mut Self> {
		let elem_size = payload.len() as u16;
		self.set_raw(name, FieldType::scalar(ValueType::Unknown), elem_size, payload)
	}

	/// Low-level entry point: stage a field directly from its packed type
	/// byte, element size, and payload. Re-staging an existing name
	/// replaces it.
	pub fn set_raw(&mut self, name: &str, field_type: FieldType, elem_size: u16, payload: Vec<u8>) -> Result<&mut Self> {
		if field_type.value_type() == ValueType::Blob && elem_size == 0 {
			return Err(StorageError::InvalidType("Blob fields require a non-zero explicit element size"));
		}
		self.fields.insert(name.to_string(), FieldSpec { field_type, elem_size, payload });
		Ok(self)
	}

	pub fn remove(&mut self, name: &str) -> &mut Self {
		self.fields.remove(name);
		self
	}

	pub fn clear(&mut self) -> &mut Self {
		self.fields.clear();
		self
	}

	/// Stages every field of an existing container verbatim, so that
	/// `ObjectBuilder::from_container(c).build() == c.image()` (§8).
	pub fn from_container(container: &Container) -> Result<ObjectBuilder> {
		let mut builder = ObjectBuilder::new();
		builder.set_container_name(&container.name());
		for i in 0..container.field_count() {
			let header = container.field_header(i)?;
			let name = container.field_name(i)?;
			let payload = container.field_bytes(i)?.to_vec();
			builder.set_raw(&name, header.field_type, header.elem_size, payload)?;
		}
		Ok(builder)
	}

	/// Emits the packed image: `[ContainerHeader][FieldHeader × N]
	/// [ContainerName][Names blob][Data payloads]` (§3, §4.4).
	pub fn build(&self) -> Vec<u8> {
		let field_count = self.fields.len();
		let container_name_units = encode_utf16(&self.container_name);
		let container_name_bytes = container_name_units.len() * 2;

		let names_start = layout::names_blob_offset(field_count, container_name_bytes);

		let mut name_units_per_field = Vec::with_capacity(field_count);
		let mut names_bytes_total = 0usize;
		for name in self.fields.keys() {
			let units = encode_utf16(name);
			names_bytes_total += units.len() * 2;
			name_units_per_field.push(units);
		}

		let data_start = names_start + names_bytes_total;
		let total_payload: usize = self.fields.values().map(|spec| spec.payload.len()).sum();
		let total_len = data_start + total_payload;

		let mut buf = vec![0u8; total_len];

		let header = ContainerHeader {
			length: total_len as u32,
			version: 1,
			field_count: field_count as u32,
			data_offset: data_start as u32,
			container_name_length: container_name_bytes as u16,
		};
		header.write(&mut buf[..layout::CONTAINER_HEADER_SIZE]);

		let cn_start = layout::container_name_offset(field_count);
		write_utf16_le(&container_name_units, &mut buf[cn_start..cn_start + container_name_bytes]);

		let mut name_cursor = names_start;
		let mut data_cursor = data_start;
		for (i, (_, spec)) in self.fields.iter().enumerate() {
			let units = &name_units_per_field[i];
			let name_len_bytes = units.len() * 2;
			write_utf16_le(units, &mut buf[name_cursor..name_cursor + name_len_bytes]);

			let payload_len = spec.payload.len();
			buf[data_cursor..data_cursor + payload_len].copy_from_slice(&spec.payload);

			let field_header = FieldHeader {
				name_hash: hash_name(units),
				name_offset: name_cursor as u32,
				name_length: units.len() as u16,
				field_type: spec.field_type,
				reserved: 0,
				data_offset: data_cursor as u32,
				elem_size: spec.elem_size,
				length: payload_len as u32,
			};
			let offset = layout::field_header_offset(i);
			field_header.write(&mut buf[offset..offset + layout::FIELD_HEADER_SIZE]);

			name_cursor += name_len_bytes;
			data_cursor += payload_len;
		}

		buf
	}

	/// Freezes the staged fields into a reusable template: building many
	/// containers of the same shape clones this image rather than
	/// recomputing the layout each time.
	pub fn build_layout(&self) -> ContainerLayout {
		ContainerLayout { field_names: self.fields.keys().cloned().collect(), template: self.build() }
	}
}

/// A pre-computed container image that can stamp out many identically
/// shaped containers without recomputing offsets each time (§4.4).
#[derive(Clone)]
pub struct ContainerLayout {
	field_names: Vec<String>,
	template: Vec<u8>,
}

impl ContainerLayout {
	pub fn field_names(&self) -> &[String] {
		&self.field_names
	}

	pub fn byte_len(&self) -> usize {
		self.template.len()
	}

	pub fn instantiate(&self) -> Vec<u8> {
		self.template.clone()
	}

	pub fn into_container(self) -> Container {
		Container::from_image(self.template)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn build_is_deterministic_regardless_of_insertion_order() {
		let mut b1 = ObjectBuilder::new();
		b1.set_scalar("b", 1i32).unwrap();
		b1.set_scalar("a", 2i32).unwrap();

		let mut b2 = ObjectBuilder::new();
		b2.set_scalar("a", 2i32).unwrap();
		b2.set_scalar("b", 1i32).unwrap();

		assert_eq!(b1.build(), b2.build());
	}

	#[test]
	fn empty_builder_produces_header_only_image() {
		let builder = ObjectBuilder::new();
		let image = builder.build();
		assert_eq!(image.len(), layout::CONTAINER_HEADER_SIZE);
		let header = ContainerHeader::read(&image);
		assert_eq!(header.data_offset as usize, layout::CONTAINER_HEADER_SIZE);
		assert_eq!(header.length, header.data_offset);
	}

	#[test]
	fn blob_without_elem_size_is_rejected() {
		let mut builder = ObjectBuilder::new();
		let err = builder.set_blob_array("blob", 0, vec![1, 2, 3]).unwrap_err();
		assert!(matches!(err, StorageError::InvalidType(_)));
	}

	#[test]
	fn from_container_round_trips_byte_for_byte() {
		let mut builder = ObjectBuilder::new();
		builder.set_container_name("root");
		builder.set_scalar("a", 7i32).unwrap();
		builder.set_array("xs", &[1i32, 2, 3]).unwrap();
		let image = builder.build();
		let container = Container::from_image(image.clone());

		let rebuilt = ObjectBuilder::from_container(&container).unwrap().build();
		assert_eq!(rebuilt, image);
	}

	#[test]
	fn layout_stamps_identical_containers() {
		let mut builder = ObjectBuilder::new();
		builder.set_scalar("a", 1i32).unwrap();
		let layout = builder.build_layout();

		let one = Container::from_image(layout.instantiate());
		let two = Container::from_image(layout.instantiate());
		assert_eq!(one.image(), two.image());
		assert_eq!(layout.field_names(), &["a".to_string()]);
	}
}
