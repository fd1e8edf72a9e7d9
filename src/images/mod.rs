use std::ops::ControlFlow;

mod async_list;
pub use async_list::AsyncImageList;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::*;

/// The code range of one loaded module.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageRange {
    pub base: u64,
    pub size: u64,
}

impl ImageRange {
    #[inline]
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// Determine whether the target address is in the current range.
    ///
    /// The end address `base + size` is accepted as well: a call placed as
    /// the very last instruction of an image returns just past its end.
    #[inline]
    pub fn contains(&self, target: u64) -> bool {
        self.base <= target && target <= self.base.saturating_add(self.size)
    }
}

/// A catalog of loaded images that can be read from any execution context.
///
/// Readers bracket every iteration with [ImageRegistry::begin_read] and
/// [ImageRegistry::end_read]. Implementations must let readers make progress
/// even when a writer was interrupted in the middle of an update, since the
/// reader may be a signal handler running on that very thread.
pub trait ImageRegistry {
    fn begin_read(&self);

    fn end_read(&self);

    /// Calls `f` for every image until it returns [ControlFlow::Break].
    ///
    /// Only valid between `begin_read` and `end_read`.
    fn for_each_image(&self, f: &mut dyn FnMut(ImageRange) -> ControlFlow<()>);
}

/// A fixed set of images. Reading needs no bracketing.
impl ImageRegistry for [ImageRange] {
    #[inline]
    fn begin_read(&self) {}

    #[inline]
    fn end_read(&self) {}

    fn for_each_image(&self, f: &mut dyn FnMut(ImageRange) -> ControlFlow<()>) {
        for image in self {
            if f(*image).is_break() {
                return;
            }
        }
    }
}

/// RAII bracket around a registry read.
pub(crate) struct Reading<'a, I: ImageRegistry + ?Sized>(&'a I);

impl<'a, I: ImageRegistry + ?Sized> Reading<'a, I> {
    #[inline]
    pub(crate) fn begin(images: &'a I) -> Self {
        images.begin_read();
        Self(images)
    }

    #[inline]
    pub(crate) fn for_each_image(&self, f: &mut dyn FnMut(ImageRange) -> ControlFlow<()>) {
        self.0.for_each_image(f)
    }
}

impl<I: ImageRegistry + ?Sized> Drop for Reading<'_, I> {
    #[inline]
    fn drop(&mut self) {
        self.0.end_read();
    }
}
