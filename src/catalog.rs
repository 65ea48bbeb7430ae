//! Heap catalog: device handle, protocol detection and heap discovery.
//!
//! The catalog is an explicit context object shared through an `Arc`. Device
//! open, protocol probe and heap query run as one critical section under the
//! catalog mutex, so threads racing on first use observe a single device
//! handle and a fully populated backend.
//!
//! The protocol decision is cached for the catalog's lifetime and survives
//! [`HeapCatalog::close`]; only the device handle is dropped and re-opened.

use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::heap::HeapType;
use crate::kernel::{AllocBackend, HeapInfo, KernelOps, LegacyBackend, ModernBackend, Protocol};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct CatalogState {
    device: Option<Arc<OwnedFd>>,
    backend: Option<Arc<dyn AllocBackend>>,
}

/// Process-wide view of the allocator device and its heaps.
pub struct HeapCatalog {
    kernel: Arc<dyn KernelOps>,
    config: Arc<AllocatorConfig>,
    state: Mutex<CatalogState>,
}

impl HeapCatalog {
    /// Create a catalog. Nothing is opened until first use.
    pub fn new(config: AllocatorConfig, kernel: Arc<dyn KernelOps>) -> Self {
        Self {
            kernel,
            config: Arc::new(config),
            state: Mutex::new(CatalogState::default()),
        }
    }

    /// Configuration the catalog was built with.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CatalogState> {
        // Every mutation is a single assignment, so a poisoned state is still
        // consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the allocator device. Succeeds without reopening if already open.
    pub fn open(&self) -> Result<()> {
        let mut state = self.lock();
        self.open_locked(&mut state).map(|_| ())
    }

    fn open_locked(&self, state: &mut CatalogState) -> Result<Arc<OwnedFd>> {
        if let Some(device) = &state.device {
            return Ok(Arc::clone(device));
        }

        let path = &self.config.device_path;
        let fd = self.kernel.open_device(path).map_err(|e| {
            Error::DeviceUnavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        tracing::info!(path = %path.display(), "opened allocator device");

        let device = Arc::new(fd);
        state.device = Some(Arc::clone(&device));
        Ok(device)
    }

    /// Release the device handle. Later operations re-open it lazily.
    ///
    /// Sessions already handed out keep their own reference to the handle.
    pub fn close(&self) {
        if self.lock().device.take().is_some() {
            tracing::info!("closed allocator device");
        }
    }

    /// Whether the device is currently open.
    pub fn is_open(&self) -> bool {
        self.lock().device.is_some()
    }

    /// Detected protocol generation, if the probe has run.
    pub fn protocol(&self) -> Option<Protocol> {
        self.lock().backend.as_ref().map(|b| b.protocol())
    }

    /// Heaps reported by the kernel. Empty before the probe and under the
    /// legacy protocol.
    pub fn heaps(&self) -> Vec<HeapInfo> {
        self.lock()
            .backend
            .as_ref()
            .map(|b| b.heaps().to_vec())
            .unwrap_or_default()
    }

    /// Open the device and detect the protocol if not done yet, and return a
    /// session usable without further locking.
    pub fn session(&self) -> Result<Session> {
        let mut state = self.lock();
        let device = self.open_locked(&mut state)?;

        let backend = match &state.backend {
            Some(backend) => Arc::clone(backend),
            None => {
                let backend = self.probe(device.as_fd())?;
                state.backend = Some(Arc::clone(&backend));
                backend
            }
        };

        Ok(Session {
            device,
            backend,
            kernel: Arc::clone(&self.kernel),
            config: Arc::clone(&self.config),
        })
    }

    fn probe(&self, device: BorrowedFd<'_>) -> Result<Arc<dyn AllocBackend>> {
        if LegacyBackend::probe(self.kernel.as_ref(), device) {
            tracing::info!("legacy ION protocol detected");
            return Ok(Arc::new(LegacyBackend::new(Arc::clone(&self.kernel))));
        }

        let names = self
            .config
            .platform
            .heaps
            .iter()
            .map(|s| (s.legacy_id, s.name.clone()))
            .collect();
        let backend = ModernBackend::probe(Arc::clone(&self.kernel), device, names)?;
        tracing::info!(heaps = backend.heaps().len(), "modern ION protocol detected");
        Ok(Arc::new(backend))
    }

    /// Translate a legacy heap id into the active protocol's heap mask.
    ///
    /// A zero mask means the heap does not exist and must be treated as a
    /// hard allocation failure.
    pub fn heap_mask_for_legacy_id(&self, legacy_id: u32) -> Result<u32> {
        Ok(self.session()?.backend.heap_mask(legacy_id))
    }
}

impl std::fmt::Debug for HeapCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("HeapCatalog")
            .field("device_path", &self.config.device_path)
            .field("open", &state.device.is_some())
            .field("protocol", &state.backend.as_ref().map(|b| b.protocol()))
            .finish()
    }
}

/// A snapshot of an open catalog: device handle plus protocol backend.
///
/// Cheap to clone. Buffers keep one so cache sync and import release keep
/// working after [`HeapCatalog::close`].
#[derive(Clone)]
pub struct Session {
    device: Arc<OwnedFd>,
    backend: Arc<dyn AllocBackend>,
    kernel: Arc<dyn KernelOps>,
    config: Arc<AllocatorConfig>,
}

impl Session {
    /// Allocator device fd.
    #[inline]
    pub fn device(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }

    /// Protocol backend.
    #[inline]
    pub fn backend(&self) -> &dyn AllocBackend {
        self.backend.as_ref()
    }

    /// Raw kernel operations.
    #[inline]
    pub fn kernel(&self) -> &dyn KernelOps {
        self.kernel.as_ref()
    }

    /// Allocator configuration.
    #[inline]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Protocol generation in effect.
    pub fn protocol(&self) -> Protocol {
        self.backend.protocol()
    }

    /// Heap mask for a logical heap; 0 if the platform or kernel lacks it.
    pub fn heap_mask(&self, heap: HeapType) -> u32 {
        self.config
            .platform
            .legacy_id(heap)
            .map(|id| self.backend.heap_mask(id))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("protocol", &self.backend.protocol())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeIonKernel;
    use std::thread;

    fn catalog(kernel: &Arc<FakeIonKernel>) -> HeapCatalog {
        HeapCatalog::new(AllocatorConfig::default(), kernel.clone())
    }

    #[test]
    fn test_open_is_idempotent() {
        let kernel = Arc::new(FakeIonKernel::modern("cat_open"));
        let catalog = catalog(&kernel);

        assert!(!catalog.is_open());
        catalog.open().unwrap();
        catalog.open().unwrap();
        assert!(catalog.is_open());
        assert_eq!(kernel.opens(), 1);
    }

    #[test]
    fn test_open_failure_is_device_unavailable() {
        let kernel = Arc::new(FakeIonKernel::modern("cat_fail"));
        kernel.fail_open(true);
        let catalog = catalog(&kernel);

        assert!(matches!(catalog.open(), Err(Error::DeviceUnavailable(_))));
        assert!(matches!(catalog.session(), Err(Error::DeviceUnavailable(_))));
        assert!(!catalog.is_open());
    }

    #[test]
    fn test_modern_protocol_queries_heaps_once() {
        let kernel = Arc::new(FakeIonKernel::modern("cat_modern"));
        let catalog = catalog(&kernel);
        assert_eq!(catalog.protocol(), None);

        let session = catalog.session().unwrap();
        assert_eq!(session.protocol(), Protocol::Modern);
        assert_eq!(catalog.protocol(), Some(Protocol::Modern));
        assert!(!catalog.heaps().is_empty());

        let queries = kernel.heap_queries();
        catalog.session().unwrap();
        assert_eq!(kernel.heap_queries(), queries);
    }

    #[test]
    fn test_legacy_protocol_detected() {
        let kernel = Arc::new(FakeIonKernel::legacy("cat_legacy"));
        let catalog = catalog(&kernel);

        let session = catalog.session().unwrap();
        assert_eq!(session.protocol(), Protocol::Legacy);
        assert!(catalog.heaps().is_empty());
        assert_eq!(catalog.heap_mask_for_legacy_id(5).unwrap(), 1 << 5);
        assert_eq!(kernel.heap_queries(), 0);
    }

    #[test]
    fn test_legacy_id_translation_by_name() {
        let kernel = Arc::new(FakeIonKernel::modern("cat_mask"));
        let catalog = catalog(&kernel);

        let system = kernel.heap_id("ion_system_heap").unwrap();
        assert_eq!(catalog.heap_mask_for_legacy_id(0).unwrap(), 1 << system);
        // Legacy id 30 is not in the platform table.
        assert_eq!(catalog.heap_mask_for_legacy_id(30).unwrap(), 0);
    }

    #[test]
    fn test_close_reopens_lazily_without_reprobe() {
        let kernel = Arc::new(FakeIonKernel::modern("cat_close"));
        let catalog = catalog(&kernel);

        let session = catalog.session().unwrap();
        catalog.close();
        assert!(!catalog.is_open());
        // The handed-out session still holds the device.
        assert_eq!(session.heap_mask(HeapType::System).count_ones(), 1);

        let queries = kernel.heap_queries();
        catalog.session().unwrap();
        assert!(catalog.is_open());
        assert_eq!(kernel.opens(), 2);
        assert_eq!(kernel.heap_queries(), queries);
    }

    #[test]
    fn test_concurrent_first_use_opens_once() {
        let kernel = Arc::new(FakeIonKernel::modern("cat_race"));
        let catalog = Arc::new(catalog(&kernel));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || catalog.session().unwrap().protocol())
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), Protocol::Modern);
        }
        assert_eq!(kernel.opens(), 1);
        // One count query plus one fill query.
        assert_eq!(kernel.heap_queries(), 2);
    }
}
