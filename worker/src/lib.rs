// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod foreman;
pub mod gpus;
pub mod library;
pub mod mini_task;
pub mod options;
pub mod process;
pub mod resources;
pub mod sandbox;
pub mod serve;
pub mod transfer_server;
pub mod workspace;

pub use crate::serve::{AbortState, Worker};
