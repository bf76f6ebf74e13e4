// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Shared-secret challenge/response on a fresh link. The secret never crosses the wire: each
//! side proves possession by hashing the other's nonce together with the secret.
//!
//! The exchange is mutual. The connecting side answers first, then issues its own challenge:
//! a manager that does not know the secret cannot harvest work from a worker, and vice versa.

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::{Link, LinkError};

fn digest(nonce_hex: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce_hex.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

async fn issue_challenge(link: &mut Link, secret: &str, stop: Instant) -> Result<(), LinkError> {
    let nonce: [u8; 16] = rand::rng().random();
    let nonce_hex = hex::encode(nonce);
    link.write_line(&format!("challenge {nonce_hex}"), stop)
        .await?;

    let response = link.read_line(stop).await?;
    if response == digest(&nonce_hex, secret) {
        link.write_line("yes", stop).await?;
        Ok(())
    } else {
        link.write_line("no", stop).await?;
        Err(LinkError::Protocol(
            "peer failed password challenge".to_owned(),
        ))
    }
}

async fn answer_challenge(link: &mut Link, secret: &str, stop: Instant) -> Result<(), LinkError> {
    let line = link.read_line(stop).await?;
    let nonce_hex = line
        .strip_prefix("challenge ")
        .ok_or_else(|| LinkError::Protocol(format!("expected challenge, got: {line}")))?;
    link.write_line(&digest(nonce_hex, secret), stop).await?;

    match link.read_line(stop).await?.as_str() {
        "yes" => Ok(()),
        _ => Err(LinkError::Protocol(
            "peer rejected password response".to_owned(),
        )),
    }
}

/// Run the exchange from the connecting side: answer the listener's challenge, then verify the
/// listener in turn.
pub async fn authenticate_connect(
    link: &mut Link,
    secret: &str,
    stop: Instant,
) -> Result<(), LinkError> {
    answer_challenge(link, secret, stop).await?;
    issue_challenge(link, secret, stop).await
}

/// Run the exchange from the listening side.
pub async fn authenticate_accept(
    link: &mut Link,
    secret: &str,
    stop: Instant,
) -> Result<(), LinkError> {
    issue_challenge(link, secret, stop).await?;
    answer_challenge(link, secret, stop).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::Link;

    fn pair() -> (Link, Link) {
        let (a, b) = tokio::io::duplex(4096);
        (Link::from_stream(a), Link::from_stream(b))
    }

    fn stop() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn matching_secrets_authenticate() {
        let (mut client, mut server) = pair();
        let server_side =
            tokio::spawn(
                async move { super::authenticate_accept(&mut server, "sesame", stop()).await },
            );
        super::authenticate_connect(&mut client, "sesame", stop())
            .await
            .unwrap();
        server_side.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mismatched_secrets_fail_both_sides() {
        let (mut client, mut server) = pair();
        let server_side =
            tokio::spawn(
                async move { super::authenticate_accept(&mut server, "sesame", stop()).await },
            );
        let client_result = super::authenticate_connect(&mut client, "wrong", stop()).await;
        assert!(client_result.is_err());
        assert!(server_side.await.unwrap().is_err());
    }
}
