//! # cancellable_loops
//!
//! Helpers for loops that honour an abort flag, in both sequential and
//! rayon-parallel form.
//!
//! Long-running numerical pipelines need a way to bail out between work
//! items without poisoning any shared state. These helpers check an
//! [`AtomicBool`] before each item and simply stop handing out work once it
//! is set; items that already started run to completion.
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use cancellable_loops::for_each_cancellable;
//!
//! let abort_flag = AtomicBool::new(false);
//! let mut done = 0;
//! for_each_cancellable(0..100, &abort_flag, |i| {
//!     done += 1;
//!     if i == 9 {
//!         abort_flag.store(true, Ordering::Relaxed);
//!     }
//! });
//! assert_eq!(done, 10);
//! ```

use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs `func` over `iter` sequentially, stopping before the next item once
/// `abort_flag` is set.
///
/// The item during which the flag is raised still completes; nothing is
/// rolled back.
pub fn for_each_cancellable<I, F, T>(iter: I, abort_flag: &AtomicBool, mut func: F)
where
    I: IntoIterator<Item = T>,
    F: FnMut(T),
{
    for item in iter {
        if abort_flag.load(Ordering::Relaxed) {
            break;
        }
        func(item);
    }
}

/// Like [`for_each_cancellable`], but `func` returns a `Result` and the loop
/// also stops at the first error, which is returned to the caller.
///
/// An abort is not an error: if the flag is raised the loop ends with
/// `Ok(())` after the current item.
pub fn try_for_each_cancellable<I, F, T, E>(
    iter: I,
    abort_flag: &AtomicBool,
    mut func: F,
) -> Result<(), E>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Result<(), E>,
{
    for item in iter {
        if abort_flag.load(Ordering::Relaxed) {
            break;
        }
        func(item)?;
    }
    Ok(())
}

/// Runs `func` over a rayon parallel iterator, skipping items not yet
/// started once `abort_flag` is set.
///
/// Because rayon hands out items in an unspecified order, the set of items
/// processed before the abort takes effect is also unspecified; callers must
/// only rely on "no new items after the flag is observed".
pub fn par_for_each_cancellable<I, F>(iter: I, abort_flag: &AtomicBool, func: F)
where
    I: IntoParallelIterator,
    F: Fn(I::Item) + Sync + Send,
    I::Item: Send,
{
    iter.into_par_iter()
        .try_for_each(|item| {
            if abort_flag.load(Ordering::Relaxed) {
                Err(())
            } else {
                func(item);
                Ok(())
            }
        })
        .ok();
}
