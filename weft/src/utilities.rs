//! UTF-16 name encoding and the ordinal name hash used by field resolution
//! (§4.3). Grounded on the teacher's habit of keeping a small
//! stream/encoding grab-bag module separate from the domain types.

/// Ordinal hash of a UTF-16 name, stable across runs (fxhash is a fixed,
/// non-randomized function, unlike `std`'s default `RandomState`).
#[inline]
pub fn hash_name(units: &[u16]) -> u32 {
	fxhash::hash32(&units)
}

#[inline]
pub fn encode_utf16(name: &str) -> Vec<u16> {
	name.encode_utf16().collect()
}

#[inline]
pub fn decode_utf16(units: &[u16]) -> String {
	String::from_utf16_lossy(units)
}

#[inline]
pub fn write_utf16_le(units: &[u16], out: &mut [u8]) {
	debug_assert_eq!(out.len(), units.len() * 2);
	for (i, unit) in units.iter().enumerate() {
		out[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
	}
}

#[inline]
pub fn read_utf16_le(bytes: &[u8]) -> Vec<u16> {
	bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect()
}
