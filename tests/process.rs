use remote_inject::Process;

#[test]
fn from_pid_rejects_nonpositive() {
    let err = Process::from_pid(0).unwrap_err();
    assert!(err.to_string().contains("pid must be > 0"));
    assert!(Process::from_pid(-4).is_err());
}

#[test]
fn from_pid_rejects_unknown_pid() {
    // Far above any OS pid limit; cannot name a live process.
    let err = Process::from_pid(i32::MAX).unwrap_err();
    assert!(err.is_process_not_found());
    assert_eq!(err.code(), -3);
}

#[test]
fn from_pid_accepts_self() {
    let pid = std::process::id() as i32;
    let process = Process::from_pid(pid).expect("own pid should exist");
    assert_eq!(process.pid(), pid);
}

#[test]
fn try_from_mirrors_from_pid() {
    assert!(Process::try_from(0).is_err());
    let pid = std::process::id() as i32;
    assert_eq!(Process::try_from(pid).expect("own pid").pid(), pid);
}
