// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cube_store;
pub mod persistence;

pub use cube_store::{Admission, CubeStore, StoreEvent};
pub use persistence::{CubeDb, PersistenceError};
