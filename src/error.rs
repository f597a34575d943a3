// Copyright (C) 2024 Ryan Daum <ryan.daum@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use crate::address::DbAddress;
use thiserror::Error;

/// The error taxonomy for the whole crate. `NotFound` is deliberately
/// absent here: a missing key is a normal `None` result from `get`, not an
/// error, since it's an expected outcome rather than a genuine failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("out of space: no free pages available (capacity {capacity_pages} pages)")]
    OutOfSpace { capacity_pages: u32 },

    #[error("corrupt page at {address:?}: {detail}")]
    Corruption { address: DbAddress, detail: String },

    #[error("I/O error during {operation}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no committed state found for the requested state hash")]
    ReorgTargetNotFound,
}

pub type Result<T> = std::result::Result<T, Error>;
