use remote_inject::{Library, Process};

#[test]
fn codes_are_stable() {
    assert_eq!(Process::from_pid(0).unwrap_err().code(), -2);
    assert_eq!(Process::from_pid(i32::MAX).unwrap_err().code(), -3);
    assert_eq!(
        Library::from_path("/definitely/not/here/libagent.so")
            .unwrap_err()
            .code(),
        -6
    );
}

#[test]
fn display_is_the_message() {
    let err = Process::from_pid(i32::MAX).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("process not found"));
    assert!(!message.starts_with("Error"));
}

#[test]
fn clone_keeps_kind_and_message() {
    let err = Process::from_pid(i32::MAX).unwrap_err();
    let clone = err.clone();
    assert!(clone.is_process_not_found());
    assert_eq!(clone.to_string(), err.to_string());
    assert_eq!(clone.code(), err.code());
}
