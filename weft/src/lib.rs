//! A schemaless, in-memory, self-describing binary container store.
//!
//! A [`Container`](container::Container) is a single packed image: a header,
//! a directory of typed fields, and their payloads, laid out so that the
//! whole thing can be read, written, and re-laid-out without ever touching a
//! schema defined outside the image itself. Containers form trees through
//! `Ref`/`Ref[]` fields, owned and torn down through a [`Registry`](registry::Registry),
//! and observed through a small event bus. [`Storage`](storage::Storage) ties
//! a root container's lifetime to a Rust value so the tree is torn down when
//! it's dropped.

pub mod builder;
pub mod container;
pub mod error;
pub mod events;
pub mod handles;
pub mod layout;
pub mod pool;
pub mod reference;
pub mod registry;
pub mod serializer;
pub mod storage;
pub mod utilities;
pub mod value;

pub use builder::{ContainerLayout, ObjectBuilder};
pub use container::Container;
pub use error::{Result, StorageError};
pub use handles::{FieldHandle, StorageMember, StorageObject};
pub use pool::{BufferPool, DefaultPool};
pub use reference::ContainerReference;
pub use registry::Registry;
pub use storage::Storage;
pub use value::{FieldType, Scalar, ValueType};
