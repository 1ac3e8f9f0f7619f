//! Kernel-level socket options for the listen socket.
//!
//! Applied between `bind` and `listen`. Options are additive and independent:
//! a failing option does not stop the remaining ones from being attempted,
//! but the first failure is the one reported.
//!
//! Platform coverage: Linux supports all three options; other Unix systems
//! support `SO_REUSEPORT` only; everywhere else the applier is a no-op.

use socket2::Socket;

use crate::config::ListenConfig;
use crate::error::ServerError;

/// `TCP_FASTOPEN` queue length used when the config leaves it at 0.
#[cfg(target_os = "linux")]
const DEFAULT_FAST_OPEN_QUEUE: u32 = 1024;

/// Apply the options requested in `config` to the (bound, not yet listening)
/// socket.
#[cfg(unix)]
pub(crate) fn apply(socket: &Socket, config: &ListenConfig) -> Result<(), ServerError> {
    let mut first_err: Option<ServerError> = None;

    if config.reuse_port {
        if let Err(source) = socket.set_reuse_port(true) {
            first_err.get_or_insert(ServerError::SockOpt {
                option: "SO_REUSEPORT",
                source,
            });
        }
    }

    #[cfg(target_os = "linux")]
    {
        if config.fast_open {
            let qlen = if config.fast_open_queue_len == 0 {
                DEFAULT_FAST_OPEN_QUEUE
            } else {
                config.fast_open_queue_len
            };
            if let Err(source) = set_tcp_option(socket, libc::TCP_FASTOPEN, qlen as libc::c_int) {
                first_err.get_or_insert(ServerError::SockOpt {
                    option: "TCP_FASTOPEN",
                    source,
                });
            }
        }

        if config.defer_accept {
            if let Err(source) = set_tcp_option(socket, libc::TCP_DEFER_ACCEPT, 1) {
                first_err.get_or_insert(ServerError::SockOpt {
                    option: "TCP_DEFER_ACCEPT",
                    source,
                });
            }
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
pub(crate) fn apply(_socket: &Socket, _config: &ListenConfig) -> Result<(), ServerError> {
    Ok(())
}

/// Raw `setsockopt` at `IPPROTO_TCP` level for options socket2 does not expose.
#[cfg(target_os = "linux")]
fn set_tcp_option(
    socket: &Socket,
    option: libc::c_int,
    value: libc::c_int,
) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
