//! # cancellable_loops
//!
//! A small utility crate for sequential loops that stop early when an abort
//! flag is raised from another thread.
//!
//! The flag is checked before every item, so an item that has started always
//! runs to completion. This makes it suitable for driving hardware sequences
//! where each step must finish cleanly (move, then acquire) but the sequence
//! as a whole may be interrupted between steps.
//!
//! ## Example
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use cancellable_loops::{try_for_each_cancellable, LoopExit};
//!
//! let abort_flag = AtomicBool::new(false);
//! let mut visited = Vec::new();
//!
//! let exit = try_for_each_cancellable(0..10, &abort_flag, |i| {
//!     visited.push(i);
//!     if i == 3 {
//!         abort_flag.store(true, Ordering::Relaxed);
//!     }
//!     Ok::<(), String>(())
//! });
//!
//! assert_eq!(exit, Ok(LoopExit::Cancelled { processed: 4 }));
//! assert_eq!(visited, vec![0, 1, 2, 3]);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

/// How a cancellable loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Every item was processed.
    Completed { processed: usize },
    /// The abort flag was observed before the next item.
    Cancelled { processed: usize },
}

impl LoopExit {
    /// Number of items that ran to completion.
    pub fn processed(&self) -> usize {
        match self {
            LoopExit::Completed { processed } | LoopExit::Cancelled { processed } => *processed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoopExit::Cancelled { .. })
    }
}

/// Applies a fallible function to each item until the iterator is exhausted,
/// the function fails, or the abort flag is set.
///
/// The abort flag is only read, never reset; clearing it is left to the
/// caller that owns the cancellation request.
///
/// # Errors
///
/// Returns the first error produced by `func`. Items after the failing one
/// are not visited.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::AtomicBool;
/// use cancellable_loops::{try_for_each_cancellable, LoopExit};
///
/// let abort_flag = AtomicBool::new(false);
/// let mut sum = 0;
///
/// let exit = try_for_each_cancellable(1..=4, &abort_flag, |i| {
///     sum += i;
///     Ok::<(), ()>(())
/// });
///
/// assert_eq!(exit, Ok(LoopExit::Completed { processed: 4 }));
/// assert_eq!(sum, 10);
///
/// let failed = try_for_each_cancellable(1..=4, &abort_flag, |i| {
///     if i == 2 { Err(i) } else { Ok(()) }
/// });
/// assert_eq!(failed, Err(2));
/// ```
pub fn try_for_each_cancellable<I, F, T, E>(
    iter: I,
    abort_flag: &AtomicBool,
    mut func: F,
) -> Result<LoopExit, E>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Result<(), E>,
{
    let mut processed = 0;
    for item in iter {
        if abort_flag.load(Ordering::Relaxed) {
            return Ok(LoopExit::Cancelled { processed });
        }
        func(item)?;
        processed += 1;
    }
    Ok(LoopExit::Completed { processed })
}
