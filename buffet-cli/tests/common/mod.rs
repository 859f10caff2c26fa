#![allow(dead_code)]

use assert_cmd::Command;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// A `buffet` invocation rooted in its own home with the test catalogue.
///
/// Every test gets a fresh home, so tests never contend for the runtime
/// lock and never see each other's sessions. Nothing here boots QEMU.
pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
}

impl TestContext {
    pub fn new_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_buffet");
        let mut cmd = Command::new(bin_path);
        cmd.timeout(Duration::from_secs(30));
        cmd.env_remove("BUFFET_HOME");
        cmd.env_remove("BUFFET_CONFIG");
        cmd.arg("--home").arg(self.home.path());
        cmd
    }

    pub fn home(&self) -> &Path {
        self.home.path()
    }
}

pub fn buffet() -> TestContext {
    let home = TempDir::new().expect("Failed to create temp home");
    let images = home.path().join("iso");
    std::fs::create_dir_all(&images).expect("Failed to create images dir");
    std::fs::write(images.join("index.json"), buffet_test_utils::CATALOGUE)
        .expect("Failed to write catalogue");

    let bin_path = env!("CARGO_BIN_EXE_buffet");
    let mut cmd = Command::new(bin_path);
    cmd.timeout(Duration::from_secs(30));
    cmd.env_remove("BUFFET_HOME");
    cmd.env_remove("BUFFET_CONFIG");
    cmd.arg("--home").arg(home.path());

    TestContext { cmd, home }
}
