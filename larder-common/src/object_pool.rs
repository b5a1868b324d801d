// Copyright 2025 foyer Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use crossbeam::queue::ArrayQueue;

/// A bounded pool of reusable objects, scoped to whoever creates it.
///
/// Objects are handed out wrapped in a [`Pooled`] guard and return to the pool on drop. When the pool is empty a
/// fresh object is created; when it is full a returned object is dropped.
pub struct ObjectPool<T> {
    inner: Arc<ObjectPoolInner<T>>,
}

impl<T> Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("capacity", &self.inner.queue.as_ref().map(|q| q.capacity()).unwrap_or_default())
            .finish()
    }
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ObjectPoolInner<T> {
    queue: Option<ArrayQueue<T>>,
    create: Box<dyn Fn() -> T + Send + Sync + 'static>,
    recycle: Box<dyn Fn(&mut T) + Send + Sync + 'static>,
}

impl<T> ObjectPool<T> {
    /// Create a pool holding at most `capacity` idle objects.
    ///
    /// `recycle` is applied to an object before it goes back to the pool.
    pub fn new(
        capacity: usize,
        create: impl Fn() -> T + Send + Sync + 'static,
        recycle: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        let inner = ObjectPoolInner {
            queue: if capacity == 0 {
                None
            } else {
                Some(ArrayQueue::new(capacity))
            },
            create: Box::new(create),
            recycle: Box::new(recycle),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Take an object from the pool, or create one.
    pub fn acquire(&self) -> Pooled<T> {
        let item = self
            .inner
            .queue
            .as_ref()
            .and_then(|queue| queue.pop())
            .unwrap_or_else(|| (self.inner.create)());
        Pooled {
            item: Some(item),
            pool: self.inner.clone(),
        }
    }

    /// Number of idle objects in the pool.
    pub fn idle(&self) -> usize {
        self.inner.queue.as_ref().map(|q| q.len()).unwrap_or_default()
    }
}

/// An object borrowed from an [`ObjectPool`].
pub struct Pooled<T> {
    item: Option<T>,
    pool: Arc<ObjectPoolInner<T>>,
}

impl<T: Debug> Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // The item is only taken in `drop`.
        match self.item.as_ref() {
            Some(item) => item,
            None => unreachable!(),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.item.as_mut() {
            Some(item) => item,
            None => unreachable!(),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let (Some(mut item), Some(queue)) = (self.item.take(), self.pool.queue.as_ref()) {
            (self.pool.recycle)(&mut item);
            let _ = queue.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_pool(capacity: usize) -> ObjectPool<Vec<u8>> {
        ObjectPool::new(capacity, || Vec::with_capacity(64), |buf| buf.clear())
    }

    #[test]
    fn test_object_pool_reuse() {
        let pool = buffer_pool(2);
        {
            let mut a = pool.acquire();
            a.extend_from_slice(b"hello");
            let _b = pool.acquire();
            let _c = pool.acquire();
        }
        // Only two of the three objects fit back.
        assert_eq!(pool.idle(), 2);
        let a = pool.acquire();
        assert!(a.is_empty());
        assert!(a.capacity() >= 64);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_object_pool_zero() {
        let pool = buffer_pool(0);
        drop(pool.acquire());
        assert_eq!(pool.idle(), 0);
    }
}
