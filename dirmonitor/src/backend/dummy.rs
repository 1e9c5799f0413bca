//! No-op backend for platforms without a usable native facility.

use std::io;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use super::{Backend, Emit, ShutdownSignal, WatchId};
use crate::config::{MonitorConfig, WatchMode};

/// Accepts every watch and never reports a change.
#[derive(Debug, Default)]
pub struct DummyBackend {
    next_id: AtomicI32,
    shutdown: ShutdownSignal,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn init(_config: &MonitorConfig) -> io::Result<Arc<dyn Backend>> {
        Ok(Arc::new(Self::new()))
    }
}

impl Backend for DummyBackend {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn mode(&self) -> WatchMode {
        WatchMode::Multiple
    }

    fn add(&self, _path: &Path) -> io::Result<WatchId> {
        Ok(WatchId::new(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn remove(&self, _id: WatchId) {}

    fn get_changes(&self, _buf: &mut [u8]) -> usize {
        self.shutdown.wait();
        0
    }

    fn translate_changes(&self, _buf: &[u8], _emit: &mut Emit<'_>) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn deinit(&self) {
        self.shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dummy_accepts_any_path() {
        let backend = DummyBackend::new();
        let a = backend.add(Path::new("/tmp/x")).unwrap();
        let b = backend.add(Path::new("/does/not/exist")).unwrap();
        assert!(a.is_valid());
        assert_ne!(a, b);
        assert_eq!(backend.mode(), WatchMode::Multiple);
    }

    #[test]
    fn test_dummy_blocks_until_deinit() {
        let backend = Arc::new(DummyBackend::new());
        let reader = {
            let backend = backend.clone();
            std::thread::spawn(move || backend.get_changes(&mut [0u8; 16]))
        };
        backend.deinit();
        assert_eq!(reader.join().unwrap(), 0);
    }
}
