use std::{
    os::fd::RawFd,
    sync::Mutex,
};

/// The set of child-owned file descriptors known to the supervisor.
///
/// Every pipe end the parent keeps for an enrolled process is registered
/// here. Before exec, each new child closes every registered descriptor so
/// pipes belonging to sibling pipelines do not leak into unrelated children.
///
/// The registry is mutated under its mutex in the parent only. The child
/// never takes the lock: a plain `Vec` snapshot is taken before fork and
/// iterated lock-free on the other side (forking while another thread holds
/// a mutex leaves that mutex permanently dead in the child).
pub(crate) struct FdRegistry {
    fds: Mutex<Vec<RawFd>>,
}

impl FdRegistry {
    pub(crate) fn new() -> Self {
        Self {
            fds: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, fd: RawFd) {
        self.fds.lock().unwrap().push(fd);
    }

    pub(crate) fn deregister(&self, fd: RawFd) {
        self.fds.lock().unwrap().retain(|&registered| registered != fd);
    }

    /// A point-in-time copy for the child to iterate after fork.
    pub(crate) fn snapshot(&self) -> Vec<RawFd> {
        self.fds.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::FdRegistry;

    #[test]
    fn register_and_deregister() {
        let registry = FdRegistry::new();
        registry.register(10);
        registry.register(11);
        registry.register(12);
        registry.deregister(11);

        assert_eq!(registry.snapshot(), vec![10, 12]);

        // Deregistering an unknown fd is a no-op.
        registry.deregister(99);
        assert_eq!(registry.snapshot(), vec![10, 12]);
    }
}
