use crate::images::ImageRegistry;
use crate::memory::MemoryReader;
use crate::validate::{address_looks_valid, DEFAULT_INVALID_LOW_MASK};

/// Number of stack words searched before giving up.
pub const DEFAULT_SCAN_WINDOW: usize = 500;

const WORD_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Tuning of the stack scan. These are platform values, not semantics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// How many words to read, starting at the saved stack pointer.
    pub window: usize,
    /// See [DEFAULT_INVALID_LOW_MASK].
    pub invalid_low_mask: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_SCAN_WINDOW,
            invalid_low_mask: DEFAULT_INVALID_LOW_MASK,
        }
    }
}

/// A plausible return address found on the stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScanMatch {
    /// The word that was accepted as a return address.
    pub pc: u64,
    /// Address just past the matched word, where the next scan starts.
    pub next_sp: u64,
}

/// Search the stack upwards from `sp` for something that looks like a
/// return address.
///
/// Returns `None` when the window is exhausted, or as soon as a read fails:
/// an unreadable word means we walked off the end of the stack.
pub fn scan_stack<M, I>(memory: &M, images: &I, config: &ScanConfig, sp: u64) -> Option<ScanMatch>
where
    M: MemoryReader + ?Sized,
    I: ImageRegistry + ?Sized,
{
    for n in 0..config.window as u64 {
        let address = sp.wrapping_add(n * WORD_SIZE);
        let word = memory.read_word(address)?;
        if address_looks_valid(images, word, config.invalid_low_mask) {
            return Some(ScanMatch {
                pc: word,
                next_sp: address.wrapping_add(WORD_SIZE),
            });
        }
    }
    None
}
