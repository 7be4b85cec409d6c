//! Runs the built library under `LD_PRELOAD` in a child process.
//!
//! The child is this same test binary, re-executed with one of the
//! `child_*` tests selected and `TTU_TEST_CHILD` set; those tests do
//! nothing in a normal run.

#![cfg(target_os = "linux")]

use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const CHILD_ENV: &str = "TTU_TEST_CHILD";
const PATH_ENV: &str = "TTU_TEST_PATH";
const PORT: u16 = 8123;

fn library() -> PathBuf {
    let exe = std::env::current_exe().unwrap();
    let deps = exe.parent().unwrap();
    [deps.join("libttu.so"), deps.parent().unwrap().join("libttu.so")]
        .into_iter()
        .find(|p| p.exists())
        .expect("libttu.so not built next to the test binary")
}

fn preloaded(mut cmd: Command, bind_rules: &str) -> Output {
    cmd.env("LD_PRELOAD", library())
        .env("TTU_LOG", "debug")
        .env("TTU_BIND", bind_rules)
        .output()
        .unwrap()
}

fn run_child(test: &str, path: &Path) -> Output {
    let mut cmd = Command::new(std::env::current_exe().unwrap());
    cmd.args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .env(PATH_ENV, path);
    let rules = format!("127.0.0.1:{PORT}=600:{}", path.display());
    preloaded(cmd, &rules)
}

fn assert_clean_exit(out: &Output) {
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        out.status.success(),
        "child failed with {:?}\nstdout:\n{}\nstderr:\n{stderr}",
        out.status,
        String::from_utf8_lossy(&out.stdout),
    );
    assert!(!stderr.contains("panicked"), "{stderr}");
}

fn is_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

fn child_path() -> PathBuf {
    PathBuf::from(std::env::var_os(PATH_ENV).unwrap())
}

#[test]
fn child_binds_redirected_listener() {
    if !is_child() {
        return;
    }
    let path = child_path();
    let listener = TcpListener::bind(("127.0.0.1", PORT)).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    assert!(UnixStream::connect(&path).is_ok());
    drop(listener);
}

#[test]
fn child_sees_addr_in_use() {
    if !is_child() {
        return;
    }
    let err = TcpListener::bind(("127.0.0.1", PORT)).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
}

#[test]
fn unload_with_debug_logging_exits_cleanly() {
    let out = preloaded(Command::new("true"), "*:*=/nonexistent/ttu.sock");
    assert_clean_exit(&out);
}

#[test]
fn redirected_bind_creates_and_removes_socket_path() {
    if is_child() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.sock");

    let out = run_child("child_binds_redirected_listener", &path);
    assert_clean_exit(&out);
    assert!(!path.exists(), "socket path left behind after unload");
}

#[test]
fn stale_path_is_reclaimed_by_child() {
    if is_child() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.sock");
    drop(UnixListener::bind(&path).unwrap());

    let out = run_child("child_binds_redirected_listener", &path);
    assert_clean_exit(&out);
    assert!(!path.exists());
}

#[test]
fn live_listener_survives_child_bind() {
    if is_child() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let out = run_child("child_sees_addr_in_use", &path);
    assert_clean_exit(&out);
    assert!(path.exists());
    assert!(UnixStream::connect(&path).is_ok());
    drop(listener);
}
