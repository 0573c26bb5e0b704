//! Thread-scoped network namespace entry.
//!
//! Network-namespace membership is a property of the calling thread,
//! not the process. Every operation that targets a non-default
//! namespace runs on a dedicated, freshly spawned thread that enters
//! the namespace and is discarded when the operation returns; no thread
//! ever switches back, and the caller's membership is never touched.

use vessel_common::error::{EngineError, Result};
use vessel_core::namespace::Namespace;

/// Runs `f` with the network namespace membership of process `pid`.
///
/// With `pid = None` the closure runs inline in the caller's namespace.
/// Otherwise a new thread opens `/proc/<pid>/ns/net`, enters it, and
/// runs the closure; sockets the closure opens belong to the target
/// namespace.
///
/// # Errors
///
/// Returns a process-setup error if the namespace cannot be entered or
/// the worker thread dies; otherwise propagates the closure's result.
pub fn with_net_namespace<T, F>(pid: Option<i32>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let Some(pid) = pid else {
        return f();
    };

    let handle = std::thread::spawn(move || -> Result<T> {
        let path = Namespace::Net.path(pid);
        let file = std::fs::File::open(&path).map_err(|e| EngineError::ProcessSetup {
            message: format!("open {} failed: {e}", path.display()),
            errno: e.raw_os_error(),
        })?;
        vessel_core::namespace::join_namespace(&file, Namespace::Net)?;
        f()
    });

    handle.join().map_err(|_| EngineError::ProcessSetup {
        message: "network namespace worker thread panicked".into(),
        errno: None,
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_execution_without_target() {
        let value = with_net_namespace(None, || Ok(41 + 1)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn closure_errors_propagate() {
        let err = with_net_namespace(None, || -> Result<()> {
            Err(EngineError::Config {
                message: "boom".into(),
            })
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn missing_process_is_reported() {
        // No pid 0 namespace path exists for us to open.
        let err = with_net_namespace(Some(0), || Ok(())).unwrap_err();
        assert!(matches!(err, EngineError::ProcessSetup { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_namespace_can_be_reentered() {
        // setns needs CAP_SYS_ADMIN even for the namespace we are in.
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let pid = std::process::id() as i32;
        let value = with_net_namespace(Some(pid), || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }
}
