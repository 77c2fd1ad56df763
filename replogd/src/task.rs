use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::{fmt, io, thread};

use tracing::{error, warn};

/// A named thread, joined on drop
pub struct AutoJoinHandle {
    name: &'static str,
    join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    /// Spawn a thread running `f`
    ///
    /// If `f` fails, the error is logged and the node is told to shut down.
    pub fn spawn_res<F, E>(
        name: &'static str,
        is_node_shutting_down: Arc<AtomicBool>,
        f: F,
    ) -> io::Result<Self>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        F: Send + 'static,
        E: fmt::Display + 'static,
    {
        let join_handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                if let Err(e) = f() {
                    error!(task = name, %e, "Task failed");
                    is_node_shutting_down.store(true, Ordering::SeqCst);
                }
            })?;

        Ok(Self {
            name,
            join_handle: Some(join_handle),
        })
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                warn!(task = self.name, "Task thread panicked");
            }
        }
    }
}

/// Flags the node as shutting down, unless marked `done` before drop
pub struct PanicGuard {
    name: &'static str,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, flag: Arc<AtomicBool>) -> Self {
        Self {
            name,
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_task_stops_the_node() -> anyhow::Result<()> {
        let flag = Arc::new(AtomicBool::new(false));
        drop(AutoJoinHandle::spawn_res("ok", flag.clone(), || -> Result<(), String> {
            Ok(())
        })?);
        assert!(!flag.load(Ordering::SeqCst));

        drop(AutoJoinHandle::spawn_res("failing", flag.clone(), || -> Result<(), String> {
            Err("boom".into())
        })?);
        assert!(flag.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn panic_guard_flags_unless_done() {
        let flag = Arc::new(AtomicBool::new(false));
        PanicGuard::new("done", flag.clone()).done();
        assert!(!flag.load(Ordering::SeqCst));

        drop(PanicGuard::new("dropped", flag.clone()));
        assert!(flag.load(Ordering::SeqCst));
    }
}
