use crate::images::{ImageRegistry, Reading};
use std::ops::ControlFlow;

/// Addresses with none of these bits set are never code. On x86_64 the
/// lowest 4GB of a 64-bit process are left unmapped.
pub const DEFAULT_INVALID_LOW_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Decide whether `address` could be a return address.
///
/// This is a heuristic: an address is accepted if it falls within any
/// registered image. Symbol tables and unwind info are not consulted, because
/// reading them is not possible without allocating or locking. False
/// positives are expected.
pub fn address_looks_valid<I>(images: &I, address: u64, invalid_low_mask: u64) -> bool
where
    I: ImageRegistry + ?Sized,
{
    if address & invalid_low_mask == 0 {
        return false;
    }
    let reading = Reading::begin(images);
    let mut found = false;
    reading.for_each_image(&mut |image| {
        if image.contains(address) {
            found = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    });
    found
}
