// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::{url_decode, url_encode};

#[test]
fn plain_names_pass_through() {
    assert_eq!(url_encode("data/input_01.txt"), "data/input_01.txt");
    assert_eq!(url_decode("data/input_01.txt").unwrap(), "data/input_01.txt");
}

#[test]
fn spaces_and_unprintables_are_escaped() {
    assert_eq!(url_encode("my file"), "my%20file");
    assert_eq!(url_encode("a\nb"), "a%0Ab");
    assert_eq!(url_decode("my%20file").unwrap(), "my file");
}

#[test]
fn round_trip() {
    let name = "dir with spaces/α β.dat";
    assert_eq!(url_decode(&url_encode(name)).unwrap(), name);
}

#[test]
fn truncated_escape_is_rejected() {
    assert!(url_decode("bad%2").is_err());
    assert!(url_decode("bad%zz").is_err());
}
