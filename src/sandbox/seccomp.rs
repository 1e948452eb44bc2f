//! OS-level isolation for predicate evaluation using a seccomp denylist.
//!
//! The closure runs in a forked child that installs the filter first, so a
//! predicate that bypasses [`super::ops`] and calls the OS directly still
//! cannot mutate files or their metadata. Sockets, new processes and signals
//! to other processes are refused as well. Reads stay allowed.
//! The child's result travels back over a pipe as length-prefixed JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::Violation;
use crate::GateError;

#[derive(Debug, Serialize, Deserialize)]
enum IsolatedResponse<T> {
    Ok(T),
    Violation(Violation),
    Unresolvable(String),
    Io {
        raw_os_error: Option<i32>,
        message: String,
    },
    Err(String),
}

impl<T> IsolatedResponse<T> {
    fn from_result(result: Result<T, GateError>) -> Self {
        match result {
            Ok(value) => IsolatedResponse::Ok(value),
            Err(GateError::SandboxViolation(v)) => IsolatedResponse::Violation(v),
            Err(GateError::PredicateUnresolvable(what)) => IsolatedResponse::Unresolvable(what),
            Err(GateError::Io(err)) => IsolatedResponse::Io {
                raw_os_error: err.raw_os_error(),
                message: err.to_string(),
            },
            Err(other) => IsolatedResponse::Err(other.to_string()),
        }
    }

    fn into_result(self) -> Result<T, GateError> {
        match self {
            IsolatedResponse::Ok(value) => Ok(value),
            IsolatedResponse::Violation(v) => Err(GateError::SandboxViolation(v)),
            IsolatedResponse::Unresolvable(what) => Err(GateError::PredicateUnresolvable(what)),
            IsolatedResponse::Io {
                raw_os_error: Some(code),
                ..
            } => Err(GateError::Io(std::io::Error::from_raw_os_error(code))),
            IsolatedResponse::Io { message, .. } => {
                Err(GateError::Io(std::io::Error::other(message)))
            }
            IsolatedResponse::Err(message) => Err(GateError::IsolatedFailure(message)),
        }
    }
}

pub fn available() -> bool {
    cfg!(all(target_os = "linux", target_arch = "x86_64"))
}

pub fn run_isolated<T, F>(f: F) -> Result<T, GateError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T, GateError>,
{
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        linux::run_isolated(f)
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    {
        let _ = f;
        Err(GateError::IsolationUnavailable(
            "seccomp isolation requires linux x86_64".to_string(),
        ))
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux {
    use super::*;
    use libc::{c_int, c_uchar, c_uint, c_ushort, c_void};

    const SECCOMP_SET_MODE_FILTER: c_uint = 1;
    const SECCOMP_RET_ALLOW: c_uint = 0x7fff_0000;
    const SECCOMP_RET_ERRNO: c_uint = 0x0005_0000;
    const SECCOMP_RET_KILL: c_uint = 0x0000_0000;
    const AUDIT_ARCH_X86_64: c_uint = 0xc000_003e;

    const BPF_LD: c_ushort = 0x00;
    const BPF_W: c_ushort = 0x00;
    const BPF_ABS: c_ushort = 0x20;
    const BPF_JMP: c_ushort = 0x05;
    const BPF_JEQ: c_ushort = 0x10;
    const BPF_JGE: c_ushort = 0x30;
    const BPF_JSET: c_ushort = 0x40;
    const BPF_K: c_ushort = 0x00;
    const BPF_RET: c_ushort = 0x06;

    // Offsets into struct seccomp_data (little-endian low words for args).
    const SYSCALL_NR_OFFSET: c_uint = 0;
    const ARCH_OFFSET: c_uint = 4;
    const ARG1_OFFSET: c_uint = 24;
    const ARG2_OFFSET: c_uint = 32;

    const O_WRITE_MASK: c_uint = 0o1 | 0o2 | 0o100 | 0o1000 | 0o2000;

    // Syscall numbers with this bit set use the x32 ABI under the same arch.
    const X32_SYSCALL_BIT: c_uint = 0x4000_0000;

    /// Upper bound on the child's response; a larger length prefix is refused.
    pub(super) const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

    /// Refused outright: filesystem mutation, sockets, process creation,
    /// signalling other processes and io_uring.
    const DENIED_SYSCALLS: &[libc::c_long] = &[
        libc::SYS_openat2,
        libc::SYS_creat,
        libc::SYS_unlink,
        libc::SYS_unlinkat,
        libc::SYS_rename,
        libc::SYS_renameat,
        libc::SYS_renameat2,
        libc::SYS_mkdir,
        libc::SYS_mkdirat,
        libc::SYS_rmdir,
        libc::SYS_link,
        libc::SYS_linkat,
        libc::SYS_symlink,
        libc::SYS_symlinkat,
        libc::SYS_mknod,
        libc::SYS_mknodat,
        libc::SYS_chmod,
        libc::SYS_fchmod,
        libc::SYS_fchmodat,
        libc::SYS_chown,
        libc::SYS_fchown,
        libc::SYS_lchown,
        libc::SYS_fchownat,
        libc::SYS_truncate,
        libc::SYS_ftruncate,
        libc::SYS_fallocate,
        libc::SYS_setxattr,
        libc::SYS_lsetxattr,
        libc::SYS_fsetxattr,
        libc::SYS_removexattr,
        libc::SYS_lremovexattr,
        libc::SYS_fremovexattr,
        libc::SYS_utime,
        libc::SYS_utimes,
        libc::SYS_utimensat,
        libc::SYS_futimesat,
        libc::SYS_open_by_handle_at,
        libc::SYS_socket,
        libc::SYS_connect,
        libc::SYS_accept,
        libc::SYS_accept4,
        libc::SYS_bind,
        libc::SYS_listen,
        libc::SYS_socketpair,
        libc::SYS_setsockopt,
        libc::SYS_fork,
        libc::SYS_vfork,
        libc::SYS_clone,
        libc::SYS_clone3,
        libc::SYS_execve,
        libc::SYS_execveat,
        libc::SYS_ptrace,
        libc::SYS_process_vm_writev,
        libc::SYS_kill,
        libc::SYS_tkill,
        libc::SYS_tgkill,
        libc::SYS_rt_sigqueueinfo,
        libc::SYS_rt_tgsigqueueinfo,
        libc::SYS_pidfd_open,
        libc::SYS_pidfd_send_signal,
        libc::SYS_io_uring_setup,
        libc::SYS_io_uring_enter,
        libc::SYS_io_uring_register,
    ];

    #[repr(C)]
    struct SockFilter {
        code: c_ushort,
        jt: c_uchar,
        jf: c_uchar,
        k: c_uint,
    }

    #[repr(C)]
    struct SockFprog {
        len: c_ushort,
        filter: *const SockFilter,
    }

    fn stmt(code: c_ushort, k: c_uint) -> SockFilter {
        SockFilter {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    fn jump(code: c_ushort, k: c_uint, jt: c_uchar, jf: c_uchar) -> SockFilter {
        SockFilter { code, jt, jf, k }
    }

    fn last_os_error(context: &str) -> GateError {
        let err = std::io::Error::last_os_error();
        GateError::IsolatedFailure(format!("{context}: {err}"))
    }

    /// Denies an open-style syscall when its flags argument asks for writing.
    fn push_write_flag_check(filters: &mut Vec<SockFilter>, syscall: c_uint, flags_offset: c_uint) {
        let deny_errno = SECCOMP_RET_ERRNO | libc::EPERM as c_uint;
        filters.push(jump(BPF_JMP | BPF_JEQ | BPF_K, syscall, 0, 4));
        filters.push(stmt(BPF_LD | BPF_W | BPF_ABS, flags_offset));
        filters.push(jump(BPF_JMP | BPF_JSET | BPF_K, O_WRITE_MASK, 0, 1));
        filters.push(stmt(BPF_RET | BPF_K, deny_errno));
        filters.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    }

    fn install_filter() -> Result<(), GateError> {
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(last_os_error("PR_SET_NO_NEW_PRIVS failed"));
        }

        let deny_errno = SECCOMP_RET_ERRNO | libc::EPERM as c_uint;
        let mut filters = Vec::new();

        filters.push(stmt(BPF_LD | BPF_W | BPF_ABS, ARCH_OFFSET));
        filters.push(jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 1, 0));
        filters.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL));

        filters.push(stmt(BPF_LD | BPF_W | BPF_ABS, SYSCALL_NR_OFFSET));
        filters.push(jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1));
        filters.push(stmt(BPF_RET | BPF_K, deny_errno));

        for &syscall in DENIED_SYSCALLS {
            filters.push(jump(BPF_JMP | BPF_JEQ | BPF_K, syscall as c_uint, 0, 1));
            filters.push(stmt(BPF_RET | BPF_K, deny_errno));
        }

        // These load an argument word, so they must come after every check
        // that expects the syscall number in the accumulator.
        push_write_flag_check(&mut filters, libc::SYS_open as c_uint, ARG1_OFFSET);
        push_write_flag_check(&mut filters, libc::SYS_openat as c_uint, ARG2_OFFSET);

        filters.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));

        let prog = SockFprog {
            len: filters.len() as c_ushort,
            filter: filters.as_ptr(),
        };

        let rc = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                0u32,
                &prog as *const SockFprog,
            )
        };
        if rc != 0 {
            return Err(last_os_error("seccomp syscall failed"));
        }
        Ok(())
    }

    fn read_exact(fd: c_int, buf: &mut [u8]) -> Result<(), GateError> {
        let mut offset = 0;
        while offset < buf.len() {
            let rc = unsafe {
                libc::read(
                    fd,
                    buf[offset..].as_mut_ptr() as *mut c_void,
                    buf.len() - offset,
                )
            };
            if rc <= 0 {
                return Err(GateError::IsolatedFailure(
                    "child exited without a response".to_string(),
                ));
            }
            offset += rc as usize;
        }
        Ok(())
    }

    /// Reads one length-prefixed response from the child's pipe.
    pub(super) fn read_response(fd: c_int) -> Result<Vec<u8>, GateError> {
        let mut len_bytes = [0u8; 8];
        read_exact(fd, &mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        if len > MAX_RESPONSE_BYTES as u64 {
            return Err(GateError::IsolatedFailure(format!(
                "child response of {len} bytes exceeds {MAX_RESPONSE_BYTES}"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        read_exact(fd, &mut payload)?;
        Ok(payload)
    }

    fn write_all(fd: c_int, buf: &[u8]) -> bool {
        let mut offset = 0;
        while offset < buf.len() {
            let rc = unsafe {
                libc::write(
                    fd,
                    buf[offset..].as_ptr() as *const c_void,
                    buf.len() - offset,
                )
            };
            if rc <= 0 {
                return false;
            }
            offset += rc as usize;
        }
        true
    }

    pub(super) fn run_isolated<T, F>(f: F) -> Result<T, GateError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, GateError>,
    {
        let mut fds = [0 as c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(last_os_error("pipe failed"));
        }

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = last_os_error("fork failed");
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }

        if pid == 0 {
            unsafe { libc::close(fds[0]) };
            // A panic must not unwind into the parent's code inside the child.
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                install_filter().and_then(|_| f())
            }))
            .unwrap_or_else(|_| Err(GateError::IsolatedFailure("child panicked".to_string())));
            let response = IsolatedResponse::from_result(outcome);
            let payload = serde_json::to_vec(&response).unwrap_or_else(|err| {
                serde_json::to_vec(&IsolatedResponse::<()>::Err(format!(
                    "response serialization failed: {err}"
                )))
                .unwrap_or_default()
            });
            let len_bytes = (payload.len() as u64).to_le_bytes();
            let _ = write_all(fds[1], &len_bytes) && write_all(fds[1], &payload);
            unsafe {
                libc::close(fds[1]);
                libc::_exit(0);
            }
        }

        unsafe { libc::close(fds[1]) };

        let received = read_response(fds[0]);
        unsafe { libc::close(fds[0]) };

        let mut status = 0;
        let _ = unsafe { libc::waitpid(pid, &mut status as *mut c_int, 0) };

        let payload = received?;
        let response: IsolatedResponse<T> = serde_json::from_slice(&payload)
            .map_err(|err| GateError::IsolatedFailure(format!("response decode failed: {err}")))?;
        response.into_result()
    }
}
