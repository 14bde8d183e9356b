use std::ffi::CString;
use std::path::PathBuf;

use remote_inject::Library;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("remote-inject-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

#[test]
fn from_path_rejects_dir() {
    let err = Library::from_path(std::env::temp_dir()).unwrap_err();
    assert!(err.to_string().contains("library path must be a file"));
}

#[test]
fn from_path_rejects_missing_file() {
    let err = Library::from_path("/definitely/not/here/libagent.so").unwrap_err();
    assert!(err.is_library_not_found());
    assert_eq!(err.code(), -6);
    assert!(err.to_string().contains("libagent.so"));
}

#[test]
fn from_path_accepts_file() {
    let dir = scratch_dir("plain");
    let file = dir.join("libagent.so");
    std::fs::write(&file, b"\x7fELF").expect("write fixture file");

    let library = Library::from_path(&file).expect("existing file is accepted");
    assert_eq!(library.path(), file);
    assert_eq!(library.resolved_path(), file);
    assert!(library.entrypoint().is_none());

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn entrypoint_sets_value() {
    let dir = scratch_dir("entry");
    let file = dir.join("libagent.so");
    std::fs::write(&file, b"\x7fELF").expect("write fixture file");

    let entry = CString::new("agent_entry").expect("cstring");
    let library = Library::from_path(&file)
        .expect("library")
        .with_entrypoint(entry.clone());
    assert_eq!(library.entrypoint().expect("entrypoint set"), entry.as_c_str());

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn from_path_in_root_resolves_through_root() {
    let root = scratch_dir("root");
    std::fs::create_dir_all(root.join("opt")).expect("create root/opt");
    std::fs::write(root.join("opt/agent.so"), b"\x7fELF").expect("write fixture file");

    let library =
        Library::from_path_in_root("/opt/agent.so", &root).expect("target-visible path resolves");
    // The staged path stays target-visible; only the existence check is
    // re-rooted.
    assert_eq!(library.path(), PathBuf::from("/opt/agent.so"));
    assert_eq!(library.resolved_path(), root.join("opt/agent.so"));

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn from_path_in_root_reports_joined_path() {
    let root = scratch_dir("missing-root");
    let err = Library::from_path_in_root("/opt/agent.so", &root).unwrap_err();
    assert!(err.is_library_not_found());
    assert!(err.to_string().contains("opt"));

    let _ = std::fs::remove_dir_all(root);
}
