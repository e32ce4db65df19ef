#![allow(dead_code)]

use flyq_bridge::ClientSettings;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .with_test_writer()
        .try_init();
}

/// Writes `properties` to a `client.properties` file in `dir` and points settings at it.
pub fn settings_with(dir: &Path, properties: &str) -> ClientSettings {
    let path = dir.join("client.properties");
    fs::write(&path, properties).expect("failed to write properties file");
    ClientSettings::default().with_properties_path(path)
}

pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
