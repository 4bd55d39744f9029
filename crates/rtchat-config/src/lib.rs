// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod loader;
mod room;
mod schema;

pub use error::ConfigError;
pub use loader::load;
pub use room::{default_room, derive_room, sanitize_path};
pub use schema::*;
