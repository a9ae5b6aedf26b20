//! The structural invariants of spec §8, exercised directly against
//! `Container::validate` and the builder round-trip rather than through a
//! particular operation's unit test.

use weft::builder::ObjectBuilder;
use weft::container::Container;
use weft::layout::CONTAINER_HEADER_SIZE;

fn sample_tree_container() -> Container {
	let mut builder = ObjectBuilder::new();
	builder.set_container_name("root");
	builder.set_scalar("a", 1i32).unwrap();
	builder.set_scalar("b", 2.5f64).unwrap();
	builder.set_array("xs", &[1i32, 2, 3, 4]).unwrap();
	builder.set_bytes("blob", vec![9, 8, 7]).unwrap();
	Container::from_image_checked(builder.build()).unwrap()
}

#[test]
fn image_length_equals_data_offset_plus_sum_of_field_lengths() {
	let container = sample_tree_container();
	let header = container.header();
	let mut total = header.data_offset as u64;
	for i in 0..container.field_count() {
		total += container.field_header(i).unwrap().length as u64;
	}
	assert_eq!(container.image().len() as u64, total);
}

#[test]
fn field_payload_ranges_are_pairwise_disjoint_and_start_at_or_after_data_offset() {
	let container = sample_tree_container();
	let header = container.header();

	let mut ranges = Vec::new();
	for i in 0..container.field_count() {
		let field = container.field_header(i).unwrap();
		assert!(field.data_offset >= header.data_offset);
		ranges.push(field.data_offset as usize..field.data_offset as usize + field.length as usize);
	}
	for i in 0..ranges.len() {
		for j in (i + 1)..ranges.len() {
			let (a, b) = (&ranges[i], &ranges[j]);
			let overlaps = a.start < b.end && b.start < a.end;
			assert!(!overlaps, "fields {i} and {j} overlap: {a:?} vs {b:?}");
		}
	}
}

#[test]
fn index_of_returns_the_unique_matching_field_or_none() {
	let container = sample_tree_container();
	for (name, expected_present) in [("a", true), ("b", true), ("xs", true), ("blob", true), ("nope", false)] {
		assert_eq!(container.try_index_of(name).is_some(), expected_present);
	}

	// Every present field resolves to a distinct index, and re-resolving
	// by name is stable.
	let mut seen = Vec::new();
	for name in ["a", "b", "xs", "blob"] {
		let idx = container.index_of(name).unwrap();
		assert!(!seen.contains(&idx));
		seen.push(idx);
		assert_eq!(container.index_of(name), Some(idx));
	}
}

#[test]
fn builder_round_trip_from_container_is_byte_for_byte() {
	let container = sample_tree_container();
	let rebuilt = ObjectBuilder::from_container(&container).unwrap().build();
	assert_eq!(rebuilt, container.image());
}

#[test]
fn resizing_to_zero_fields_is_a_minimal_valid_empty_image() {
	let container = Container::from_image_checked(ObjectBuilder::new().build()).unwrap();
	let header = container.header();
	assert_eq!(header.data_offset as usize, CONTAINER_HEADER_SIZE);
	assert_eq!(header.length as usize, CONTAINER_HEADER_SIZE);
	assert_eq!(container.field_count(), 0);
}

#[test]
fn growing_an_array_in_place_zero_fills_the_new_trailing_elements() {
	let mut builder = ObjectBuilder::new();
	builder.set_array("xs", &[0xFFFFFFFFu32]).unwrap();
	let mut container = Container::from_image_checked(builder.build()).unwrap();

	// One source element widened into a three-element destination: the
	// first element converts, the other two are zero-filled (§4.1
	// `convertArray`, §8 boundary behavior).
	container.change_field_type("xs", weft::value::ValueType::UInt32, Some(3)).unwrap();
	let idx = container.index_of("xs").unwrap();
	let bytes = container.field_bytes(idx).unwrap();
	assert_eq!(bytes.len(), 12);
	assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 0xFFFFFFFF);
	assert_eq!(&bytes[4..12], &[0u8; 8]);
}
