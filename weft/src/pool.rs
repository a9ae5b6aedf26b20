//! Buffer pool collaborator (§6, §5): `rent`/`return` are the only contract
//! the core requires. Grounded on the teacher stack's pooled-connection
//! shape (`Pool` owning a manager, a guard type borrowing from it), adapted
//! from the async connection pool to a synchronous free-list of byte
//! buffers, since container images are rented/returned on the same thread
//! that mutates them (§5: no suspension points in the core).

use std::sync::Mutex;

/// Rents and reclaims the byte buffers backing container images.
///
/// `rent` must return a buffer of at least the requested size; `return_buf`
/// must tolerate being handed buffers it never rented (idempotent return).
/// `Send + Sync` so a pool can back [`crate::registry::Registry::shared`],
/// which is reachable from any thread even though the core's own write
/// discipline is single-threaded per container tree (§5).
pub trait BufferPool: Send + Sync {
	fn rent(&self, size: usize, zero: bool) -> Vec<u8>;
	fn return_buf(&self, buf: Vec<u8>);
}

/// A plain free-list pool, bucketed by capacity. Good enough for the core's
/// single-threaded write discipline; callers embedding `weft` in a larger
/// system are free to supply their own [`BufferPool`] (e.g. backed by a
/// slab allocator or an arena shared with a host engine).
#[derive(Default)]
pub struct DefaultPool {
	free: Mutex<Vec<Vec<u8>>>,
}

impl DefaultPool {
	pub fn new() -> Self {
		Self::default()
	}
}

impl BufferPool for DefaultPool {
	fn rent(&self, size: usize, zero: bool) -> Vec<u8> {
		let mut free = self.free.lock().unwrap();
		if let Some(pos) = free.iter().position(|buf| buf.capacity() >= size) {
			let mut buf = free.swap_remove(pos);
			buf.clear();
			buf.resize(size, 0);
			return buf;
		}
		drop(free);
		let _ = zero; // freshly allocated Vec<u8> is always zeroed by `resize`
		vec![0u8; size]
	}

	fn return_buf(&self, buf: Vec<u8>) {
		self.free.lock().unwrap().push(buf);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rent_after_return_reuses_capacity() {
		let pool = DefaultPool::new();
		let buf = pool.rent(64, true);
		let cap = buf.capacity();
		pool.return_buf(buf);
		let buf2 = pool.rent(32, true);
		assert!(buf2.capacity() >= 32);
		assert!(cap >= 32);
	}

	#[test]
	fn return_is_idempotent_with_unknown_buffers() {
		let pool = DefaultPool::new();
		pool.return_buf(vec![1, 2, 3]);
		pool.return_buf(vec![4, 5]);
		let buf = pool.rent(2, true);
		assert!(buf.len() == 2);
	}
}
