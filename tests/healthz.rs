//! Test the running forwarder binary.
//!
//! Needs a Node runtime with `nkn-sdk` installed in the test directory's
//! `sidecar/`, so it is ignored by default (like everything else that
//! depends on external services).

use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cli_test_dir::*;
use reqwest::blocking::{Client, Response};

const PORT: u16 = 19771;

#[test]
#[ignore]
fn healthz() -> Result<()> {
    let testdir = TestDir::new("nkn-elev-forwarder", "healthz");

    testdir.create_file(
        ".env",
        format!(
            "FORWARD_BIND=127.0.0.1\n\
             FORWARD_FORCE_LOCAL=1\n\
             FORWARD_PORT={}\n\
             ELEV_BASE=http://localhost:5000\n",
            PORT
        ),
    );

    let mut child = testdir
        .cmd()
        .spawn()
        .context("forwarder failed to start")?;

    // Call our helper to actually make the HTTP request, clean up our
    // server (always!), and check to see if `result` was an error.
    let result = healthz_helper();
    if let Err(err) = child.kill() {
        eprintln!("could not stop forwarder: {}", err);
    }
    let response = result?;

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().context("healthz body was not JSON")?;
    assert_eq!(body["ok"], true);
    assert_eq!(body["dataset"], "mapzen");
    Ok(())
}

/// Helper function for the `healthz` test, so that the test can clean up
/// the server process. This must _not_ use `assert!` or other functions
/// that panic, or we won't clean up.
fn healthz_helper() -> Result<Response> {
    let client = Client::new();
    let url = format!("http://127.0.0.1:{}/healthz", PORT);

    // The server needs a moment to bind; poll for up to 30 seconds.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match client.get(&url).send() {
            Ok(response) => return Ok(response),
            Err(err) if Instant::now() > deadline => {
                return Err(err).context("healthz never came up");
            }
            Err(_) => sleep(Duration::from_millis(250)),
        }
    }
}
