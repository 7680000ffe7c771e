use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Convert an OS process status into shell-style exit code semantics.
///
/// Processes terminated by a signal map to `128 + signal`, so an
/// interrupted child reports 130.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// True when the child exited normally with status zero.
pub fn succeeded(status: ExitStatus) -> bool {
    status.code() == Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_exit_passes_code_through() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
    }

    #[test]
    fn signal_exit_maps_to_128_plus_signal() {
        let status = ExitStatus::from_raw(libc::SIGINT);
        assert_eq!(exit_code(status), 130);
        assert!(!succeeded(status));
    }

    #[test]
    fn only_zero_is_success() {
        assert!(succeeded(ExitStatus::from_raw(0)));
        assert!(!succeeded(ExitStatus::from_raw(1 << 8)));
    }
}
