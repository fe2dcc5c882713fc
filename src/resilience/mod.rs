// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection-level resilience. Retries happen only while establishing a
//! connection; flush, scan and prune calls never retry.

pub mod retry;
