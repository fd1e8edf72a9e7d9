use super::{ImageRange, ImageRegistry};
use spin::Mutex;
use std::ops::ControlFlow;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Node {
    image: ImageRange,
    next: AtomicPtr<Node>,
    // Only touched with the write lock held.
    prev: *mut Node,
}

struct Tail(*mut Node);

// The tail is only dereferenced with the write lock held.
unsafe impl Send for Tail {}

/// An image list whose readers never block.
///
/// Writers serialize on a spin lock and publish nodes with atomic stores.
/// Readers take no lock at all: they bump a reader count and walk the
/// published `next` pointers, so a reader running in a signal handler makes
/// progress even if it interrupted a writer on the same thread. A removed
/// node is unlinked first and freed only once no reader is active.
///
/// Appending and removing allocate and are not async-signal-safe; reading is.
pub struct AsyncImageList {
    head: AtomicPtr<Node>,
    tail: Mutex<Tail>,
    readers: AtomicUsize,
}

unsafe impl Send for AsyncImageList {}
unsafe impl Sync for AsyncImageList {}

impl Default for AsyncImageList {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncImageList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: Mutex::new(Tail(ptr::null_mut())),
            readers: AtomicUsize::new(0),
        }
    }

    /// Append an image to the end of the list.
    pub fn append(&self, image: ImageRange) {
        let node = Box::into_raw(Box::new(Node {
            image,
            next: AtomicPtr::new(ptr::null_mut()),
            prev: ptr::null_mut(),
        }));
        let mut tail = self.tail.lock();
        if tail.0.is_null() {
            self.head.store(node, Ordering::SeqCst);
        } else {
            unsafe {
                (*node).prev = tail.0;
                (*tail.0).next.store(node, Ordering::SeqCst);
            }
        }
        tail.0 = node;
        log::debug!("registered image {:#x}+{:#x}", image.base, image.size);
    }

    /// Remove the first image whose base address is `base`.
    ///
    /// Returns `false` if no such image is registered.
    pub fn remove(&self, base: u64) -> bool {
        let mut tail = self.tail.lock();
        let mut item = self.head.load(Ordering::SeqCst);
        unsafe {
            while !item.is_null() && (*item).image.base != base {
                item = (*item).next.load(Ordering::SeqCst);
            }
            if item.is_null() {
                return false;
            }

            // After this store the node is unreachable for new readers.
            let next = (*item).next.load(Ordering::SeqCst);
            if (*item).prev.is_null() {
                self.head.store(next, Ordering::SeqCst);
            } else {
                (*(*item).prev).next.store(next, Ordering::SeqCst);
            }
            if next.is_null() {
                tail.0 = (*item).prev;
            } else {
                (*next).prev = (*item).prev;
            }

            // Readers that started before the unlink may still hold the node.
            while self.readers.load(Ordering::SeqCst) > 0 {
                std::hint::spin_loop();
            }
            let node = Box::from_raw(item);
            log::debug!("removed image {:#x}+{:#x}", node.image.base, node.image.size);
        }
        true
    }

    /// Number of registered images. Takes the write lock.
    pub fn len(&self) -> usize {
        let _tail = self.tail.lock();
        let mut len = 0;
        let mut item = self.head.load(Ordering::SeqCst);
        while !item.is_null() {
            len += 1;
            item = unsafe { (*item).next.load(Ordering::SeqCst) };
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).is_null()
    }
}

impl ImageRegistry for AsyncImageList {
    #[inline]
    fn begin_read(&self) {
        self.readers.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    fn end_read(&self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }

    fn for_each_image(&self, f: &mut dyn FnMut(ImageRange) -> ControlFlow<()>) {
        let mut item = self.head.load(Ordering::SeqCst);
        while !item.is_null() {
            let node = unsafe { &*item };
            if f(node.image).is_break() {
                return;
            }
            item = node.next.load(Ordering::SeqCst);
        }
    }
}

impl Drop for AsyncImageList {
    fn drop(&mut self) {
        let mut item = *self.head.get_mut();
        while !item.is_null() {
            let node = unsafe { Box::from_raw(item) };
            item = node.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn bases(list: &AsyncImageList) -> Vec<u64> {
        let mut v = vec![];
        list.begin_read();
        list.for_each_image(&mut |image| {
            v.push(image.base);
            ControlFlow::Continue(())
        });
        list.end_read();
        v
    }

    #[test]
    fn test_append_and_remove() {
        let list = AsyncImageList::new();
        assert!(list.is_empty());
        list.append(ImageRange::new(0x1000, 0x10));
        list.append(ImageRange::new(0x2000, 0x10));
        list.append(ImageRange::new(0x3000, 0x10));
        assert_eq!(bases(&list), vec![0x1000, 0x2000, 0x3000]);
        assert_eq!(list.len(), 3);

        assert!(list.remove(0x2000));
        assert_eq!(bases(&list), vec![0x1000, 0x3000]);
        assert!(!list.remove(0x2000));

        // Removing the tail, then appending, must keep the order intact.
        assert!(list.remove(0x3000));
        list.append(ImageRange::new(0x4000, 0x10));
        assert_eq!(bases(&list), vec![0x1000, 0x4000]);

        assert!(list.remove(0x1000));
        assert!(list.remove(0x4000));
        assert!(list.is_empty());
        list.append(ImageRange::new(0x5000, 0x10));
        assert_eq!(bases(&list), vec![0x5000]);
    }

    #[test]
    fn test_read_while_locked_by_writer() {
        let list = AsyncImageList::new();
        list.append(ImageRange::new(0x1000, 0x10));
        // Simulate a writer interrupted while holding the lock.
        let _writer = list.tail.lock();
        assert_eq!(bases(&list), vec![0x1000]);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let list = Arc::new(AsyncImageList::new());
        for n in 0..16 {
            list.append(ImageRange::new(0x10000 * (n + 1), 0x100));
        }
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let list = list.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        for base in bases(&list) {
                            assert_eq!(base % 0x10000, 0);
                        }
                    }
                })
            })
            .collect();
        for n in 0..16 {
            list.remove(0x10000 * (n + 1));
            list.append(ImageRange::new(0x10000 * (n + 17), 0x100));
        }
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(list.len(), 16);
    }
}
