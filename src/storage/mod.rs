// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store backends for the tag layer.
//!
//! - [`traits`]: the [`TagStore`](traits::TagStore) seam, [`Command`](traits::Command) and errors
//! - [`redis`]: Redis standalone and cluster connections
//! - [`memory`]: in-memory store with Redis semantics (tests, local doctor runs)

pub mod traits;
pub mod redis;
pub mod memory;
