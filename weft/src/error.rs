//! Error kinds (§7). `try_*` accessors never construct these; everything
//! else raises and is expected to propagate via `?`.

use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum StorageError {
	/// Operation on a container whose generation has advanced since the
	/// handle observed it.
	Disposed,
	/// Name lookup failed.
	FieldMissing(String),
	/// Read/write type has a different size than the field and reschema
	/// was not requested.
	SizeMismatch { field: String, expected: u32, got: u32 },
	/// Attempt to use a ref API on a value field or vice versa.
	TypeMismatch { field: String },
	/// Builder rejected a field definition (e.g. `Blob` without an
	/// explicit element size).
	InvalidType(&'static str),
	/// Caller supplied a byte slice that aliases the container's own
	/// buffer.
	OverlappingBuffer,
	/// A layout declared two fields with the same name.
	DuplicateFieldName(String),
	/// Array element access past the field's logical length.
	IndexOutOfRange { index: usize, len: usize },
}

impl Display for StorageError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			StorageError::Disposed => write!(f, "operation on a disposed container"),
			StorageError::FieldMissing(name) => write!(f, "no field named `{name}`"),
			StorageError::SizeMismatch { field, expected, got } => {
				write!(f, "field `{field}` has size {expected}, write supplied {got} bytes without allowing a reschema")
			}
			StorageError::TypeMismatch { field } => write!(f, "field `{field}` is not a reference field"),
			StorageError::InvalidType(reason) => write!(f, "invalid field type: {reason}"),
			StorageError::OverlappingBuffer => write!(f, "supplied buffer overlaps the container's own image"),
			StorageError::DuplicateFieldName(name) => write!(f, "duplicate field name `{name}`"),
			StorageError::IndexOutOfRange { index, len } => write!(f, "index {index} out of range for length {len}"),
		}
	}
}

impl std::error::Error for StorageError {}

pub type Result<T> = std::result::Result<T, StorageError>;
