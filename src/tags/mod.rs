// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store-backed tag bookkeeping.
//!
//! - [`TagRegistry`]: set of known tag names per mode
//! - [`TagGenerations`]: All-mode generation counters
//! - [`TaggedKeyEnumerator`]: restartable cursor over one tag's keys

mod enumerator;
mod generation;
mod registry;

pub use enumerator::TaggedKeyEnumerator;
pub use generation::TagGenerations;
pub use registry::TagRegistry;
