//! Helpers for tests that need a stand-in encoder binary

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ETXTBSY: i32 = 26;

/// Write an executable `/bin/sh` script that plays the encoder.
///
/// `body` sees the encoder arguments as `$@`; `$last` holds the final one
/// (the output path for file-writing invocations).
pub fn fake_encoder(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!(
        "#!/bin/sh\n[ -n \"$FAKE_ENCODER_READY_CHECK\" ] && exit 0\nlast=\nfor last; do :; done\n{}\n",
        body
    );
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    wait_until_executable(&path);
    path
}

/// Another test thread may have forked while our write handle was open;
/// retry until the kernel stops reporting the file busy.
fn wait_until_executable(path: &Path) {
    for _ in 0..100 {
        match std::process::Command::new(path)
            .env("FAKE_ENCODER_READY_CHECK", "1")
            .status()
        {
            Ok(_) => return,
            Err(e) if e.raw_os_error() == Some(ETXTBSY) => {
                std::thread::sleep(Duration::from_millis(10))
            }
            Err(e) => panic!("fake encoder not runnable: {}", e),
        }
    }
    panic!("fake encoder stayed busy: {}", path.display());
}

/// Lines the fake encoder appended to a log file
pub fn read_log(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
