pub(crate) fn cerr<Int: Copy + TryInto<libc::c_long>>(res: Int) -> std::io::Result<Int> {
    match res.try_into() {
        Ok(-1) => Err(std::io::Error::last_os_error()),
        _ => Ok(res),
    }
}

pub(crate) fn sysconf(name: libc::c_int) -> Option<libc::c_long> {
    // SAFETY: sysconf cannot cause UB
    cerr(unsafe { libc::sysconf(name) }).ok()
}

/// Rust's standard library IsTerminal just directly calls isatty, which
/// performs IOCTL calls on the descriptor; check that it is a character
/// device first.
pub(crate) fn safe_isatty(fildes: libc::c_int) -> bool {
    let mut maybe_stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: we pass a valid pointer to an uninitialized stat buffer
    if unsafe { libc::fstat(fildes, maybe_stat.as_mut_ptr()) } == 0 {
        // SAFETY: fstat succeeded, so the buffer is initialized
        let mode = unsafe { maybe_stat.assume_init() }.st_mode;

        let is_char_device = (mode & libc::S_IFMT) == libc::S_IFCHR;

        if is_char_device {
            // SAFETY: isatty cannot cause UB
            unsafe { libc::isatty(fildes) != 0 }
        } else {
            false
        }
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::safe_isatty;

    #[test]
    fn regular_file_is_not_a_tty() {
        use std::fs::File;
        use std::os::fd::AsRawFd;
        assert!(!safe_isatty(File::open("/bin/sh").unwrap().as_raw_fd()));
        assert!(!safe_isatty(-1));
    }
}
