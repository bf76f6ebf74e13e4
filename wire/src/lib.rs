// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod auth;
mod link;
#[cfg(test)]
mod link_tests;
pub mod tls;
pub mod transfer;
#[cfg(test)]
mod transfer_tests;
mod urlencode;
#[cfg(test)]
mod urlencode_tests;

pub use crate::link::{tcp_connect, Link, LinkError, LINE_MAX};
pub use crate::urlencode::{url_decode, url_encode};
