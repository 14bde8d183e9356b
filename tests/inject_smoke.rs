#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use remote_inject::{Attachment, Library, Process};

const LOAD_MESSAGE: &[u8] = b"Let it be green\n";

fn can_trace() -> bool {
    if unsafe { libc::geteuid() } == 0 {
        return true;
    }
    match std::fs::read_to_string("/proc/sys/kernel/yama/ptrace_scope") {
        Ok(scope) => scope.trim() == "0",
        Err(_) => true,
    }
}

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

fn build_fixtures(root: &PathBuf) {
    for package in ["remote-inject-fixture-target", "remote-inject-fixture-agent"] {
        let status = Command::new("cargo")
            .arg("build")
            .arg("-p")
            .arg(package)
            .current_dir(root)
            .status()
            .expect("failed to run cargo build");
        assert!(status.success(), "failed to build {package}");
    }
}

fn spawn_target(root: &PathBuf, stamp: Option<&PathBuf>) -> Child {
    let target_bin = root.join("target/debug/remote-inject-fixture-target");
    let mut command = Command::new(&target_bin);
    command.arg("60000").stdout(Stdio::piped());
    if let Some(stamp) = stamp {
        command.env("REMOTE_INJECT_STAMP", stamp);
    }
    let child = command.spawn().expect("failed to spawn fixture target");
    std::thread::sleep(Duration::from_millis(300));
    child
}

fn agent_mappings(pid: i32) -> Vec<String> {
    let maps = std::fs::read_to_string(format!("/proc/{pid}/maps")).unwrap_or_default();
    maps.lines()
        .filter(|line| line.contains("fixture_agent"))
        .map(str::to_string)
        .collect()
}

#[test]
fn inject_call_uninject_roundtrip() {
    if !can_trace() {
        eprintln!("skipping inject smoke test (ptrace restricted)");
        return;
    }

    let root = workspace_root();
    build_fixtures(&root);
    let agent_lib = root.join("target/debug/libremote_inject_fixture_agent.so");
    let stamp = std::env::temp_dir().join(format!("remote-inject-{}.stamp", std::process::id()));
    let _ = std::fs::remove_file(&stamp);

    let mut child = spawn_target(&root, Some(&stamp));
    let pid = child.id() as i32;
    assert!(
        agent_mappings(pid).is_empty(),
        "agent must not be mapped before injection"
    );

    let process = Process::from_pid(pid).expect("target pid should exist");
    let mut attachment = Attachment::attach(process).expect("attach");
    let library = Library::from_path(&agent_lib).expect("agent library");

    let handle = attachment.inject(&library).expect("injection should succeed");
    assert_ne!(handle.raw(), 0);
    assert!(
        !agent_mappings(pid).is_empty(),
        "agent must be mapped after injection"
    );

    // The constructor output proves the load ran in the target's context,
    // not the injector's.
    let stdout = child.stdout.as_mut().expect("piped stdout");
    let mut message = vec![0u8; LOAD_MESSAGE.len()];
    stdout
        .read_exact(&mut message)
        .expect("read constructor output");
    assert_eq!(message, LOAD_MESSAGE);

    // A nonexistent symbol is a clean failure, never a silent success.
    let err = attachment
        .call(&handle, "definitely_not_exported")
        .expect_err("unknown symbol");
    assert!(err.is_symbol_not_found());

    // call() blocks until the remote call returns, so the stamp is on disk
    // when it comes back.
    attachment.call(&handle, "agent_entry").expect("agent_entry runs");
    let contents = std::fs::read(&stamp).expect("stamp file after agent_entry");
    assert_eq!(contents, b"ok");

    attachment.uninject(handle).expect("uninject");
    assert!(
        agent_mappings(pid).is_empty(),
        "agent must be unmapped after uninject"
    );

    attachment.detach().expect("detach");
    let err = attachment.detach().expect_err("second detach is rejected");
    assert!(err.is_already_detached());

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_file(&stamp);
}

#[test]
fn handles_are_scoped_to_their_attachment() {
    if !can_trace() {
        eprintln!("skipping handle scoping test (ptrace restricted)");
        return;
    }

    let root = workspace_root();
    build_fixtures(&root);
    let agent_lib = root.join("target/debug/libremote_inject_fixture_agent.so");

    let mut first_child = spawn_target(&root, None);
    let mut second_child = spawn_target(&root, None);

    let first = Process::from_pid(first_child.id() as i32).expect("first pid");
    let second = Process::from_pid(second_child.id() as i32).expect("second pid");
    let mut first_attachment = Attachment::attach(first).expect("attach first");
    let mut second_attachment = Attachment::attach(second).expect("attach second");

    let library = Library::from_path(&agent_lib).expect("agent library");
    let handle = first_attachment.inject(&library).expect("inject into first");

    // Only the first target's module list changed.
    assert!(!agent_mappings(first_child.id() as i32).is_empty());
    assert!(agent_mappings(second_child.id() as i32).is_empty());

    let err = second_attachment
        .call(&handle, "agent_entry")
        .expect_err("foreign handle");
    assert!(err.is_invalid_input());
    let err = second_attachment
        .uninject(handle)
        .expect_err("foreign handle");
    assert!(err.is_invalid_input());

    first_attachment.detach().expect("detach first");
    second_attachment.detach().expect("detach second");

    for child in [&mut first_child, &mut second_child] {
        let _ = child.kill();
        let _ = child.wait();
    }
}
