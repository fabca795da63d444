//! Execution provider library lifecycle.
//!
//! A library is the unit of registration. It owns the factories it produced
//! and moves through `Unloaded -> Loading -> Loaded -> Unloading -> Unloaded`.
//! `load` and `unload` on one library are serialized by a per-library mutex;
//! `load` is a no-op on a loaded library and `unload` on an unloaded one.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use libloading::Library;
use ronn_core::{CoreError, Result};
use ronn_ep_abi::{
    CreateEpFactoriesFn, ReleaseEpFactoryFn, RonnEpFactory, RonnStr, CREATE_EP_FACTORIES_SYMBOL,
    MAX_EP_FACTORIES_PER_LIBRARY, RELEASE_EP_FACTORY_SYMBOL,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::factory::{EpFactory, InternalEpFactory, PluginEpFactory};
use crate::host_api::{self, host_api};
use crate::{cpu, gpu};

/// Lifecycle state of a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LibraryState {
    /// No factories exist.
    Unloaded,
    /// `load` is running.
    Loading,
    /// Factories are available.
    Loaded,
    /// `unload` is running.
    Unloading,
}

/// Which kind of library a registration refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LibraryKind {
    /// Providers compiled into the host.
    Internal,
    /// A plugin implementing the execution provider ABI.
    Plugin,
    /// A legacy provider library wrapped by the host.
    ProviderBridge,
}

/// Outcome of unloading a library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadReport {
    /// Factories released during unload.
    pub released: usize,
    /// Factories whose release reported an error.
    pub failed: usize,
    /// Factories still used by live provider instances. They are released
    /// when the last instance is dropped.
    pub deferred: usize,
}

impl UnloadReport {
    /// Whether every factory was released without error.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.deferred == 0
    }
}

/// A registered source of execution provider factories.
pub trait EpLibrary: Send + Sync + fmt::Debug {
    /// Name the library was registered under.
    fn registration_name(&self) -> &str;

    /// Kind of library.
    fn kind(&self) -> LibraryKind;

    /// Current lifecycle state.
    fn state(&self) -> LibraryState;

    /// Create the library's factories. Idempotent.
    fn load(&self) -> Result<()>;

    /// Factories of a loaded library, empty otherwise.
    fn factories(&self) -> Vec<Arc<EpFactory>>;

    /// Release all factories. Idempotent.
    fn unload(&self) -> Result<UnloadReport>;
}

/// Release a library's factories, continuing past failures.
fn release_factories(registration_name: &str, factories: Vec<Arc<EpFactory>>) -> UnloadReport {
    let mut report = UnloadReport::default();

    for factory in factories {
        let name = factory.name().to_string();
        match Arc::into_inner(factory) {
            Some(factory) => match factory.release() {
                Ok(()) => report.released += 1,
                Err(e) => {
                    warn!(
                        "Failed to release execution provider factory '{}' of library '{}': {}",
                        name, registration_name, e
                    );
                    report.failed += 1;
                }
            },
            None => {
                debug!(
                    "Execution provider factory '{}' of library '{}' is still in use, \
                     deferring release",
                    name, registration_name
                );
                report.deferred += 1;
            }
        }
    }

    report
}

#[derive(Debug)]
struct LibraryInner {
    state: LibraryState,
    factories: Vec<Arc<EpFactory>>,
    handle: Option<Arc<Library>>,
}

impl LibraryInner {
    fn new() -> Self {
        Self {
            state: LibraryState::Unloaded,
            factories: Vec::new(),
            handle: None,
        }
    }

    fn unload(&mut self, registration_name: &str) -> UnloadReport {
        if self.state == LibraryState::Unloaded {
            return UnloadReport::default();
        }

        self.state = LibraryState::Unloading;
        let report = release_factories(registration_name, std::mem::take(&mut self.factories));
        self.handle = None;
        self.state = LibraryState::Unloaded;

        report
    }
}

fn lock_inner<'a>(
    inner: &'a Mutex<LibraryInner>,
    registration_name: &str,
) -> Result<MutexGuard<'a, LibraryInner>> {
    inner
        .lock()
        .map_err(|_| CoreError::fail(format!("library '{registration_name}' lock poisoned")))
}

fn state_of(inner: &Mutex<LibraryInner>) -> LibraryState {
    inner
        .lock()
        .map(|inner| inner.state)
        .unwrap_or(LibraryState::Unloaded)
}

fn factories_of(inner: &Mutex<LibraryInner>) -> Vec<Arc<EpFactory>> {
    inner
        .lock()
        .map(|inner| inner.factories.clone())
        .unwrap_or_default()
}

/// Run a factory constructor under the library lock, cleaning up on failure.
fn load_with(
    inner: &Mutex<LibraryInner>,
    registration_name: &str,
    build: impl FnOnce(&mut LibraryInner) -> Result<Vec<EpFactory>>,
) -> Result<()> {
    let mut inner = lock_inner(inner, registration_name)?;
    if inner.state == LibraryState::Loaded {
        return Ok(());
    }

    inner.state = LibraryState::Loading;
    match build(&mut *inner) {
        Ok(factories) => {
            inner.factories = factories.into_iter().map(Arc::new).collect();
            inner.state = LibraryState::Loaded;
            info!(
                "Loaded execution provider library '{}' with {} factories",
                registration_name,
                inner.factories.len()
            );
            Ok(())
        }
        Err(e) => {
            error!(
                "Failed to load execution provider library '{}': {}",
                registration_name, e
            );
            let report = inner.unload(registration_name);
            if !report.is_clean() {
                warn!(
                    "Cleanup after failed load of library '{}' was incomplete: {:?}",
                    registration_name, report
                );
            }
            Err(e)
        }
    }
}

fn unload_with(inner: &Mutex<LibraryInner>, registration_name: &str) -> Result<UnloadReport> {
    let mut inner = lock_inner(inner, registration_name)?;
    if inner.state != LibraryState::Loaded {
        return Ok(UnloadReport::default());
    }

    let report = inner.unload(registration_name);
    info!(
        "Unloaded execution provider library '{}': {} released, {} failed, {} deferred",
        registration_name, report.released, report.failed, report.deferred
    );
    Ok(report)
}

/// Constructor of an internal library's factories.
pub type InternalFactoriesFn = Box<dyn Fn() -> Result<Vec<InternalEpFactory>> + Send + Sync>;

/// Providers compiled into the host.
pub struct EpLibraryInternal {
    registration_name: String,
    build: InternalFactoriesFn,
    inner: Mutex<LibraryInner>,
}

impl EpLibraryInternal {
    /// Create an internal library whose factories are produced by `build`.
    pub fn new(registration_name: impl Into<String>, build: InternalFactoriesFn) -> Self {
        Self {
            registration_name: registration_name.into(),
            build,
            inner: Mutex::new(LibraryInner::new()),
        }
    }

    /// The built-in CPU execution provider.
    pub fn cpu() -> Self {
        Self::new(
            cpu::CPU_EXECUTION_PROVIDER,
            Box::new(|| Ok(vec![cpu::create_cpu_factory()])),
        )
    }
}

impl EpLibrary for EpLibraryInternal {
    fn registration_name(&self) -> &str {
        &self.registration_name
    }

    fn kind(&self) -> LibraryKind {
        LibraryKind::Internal
    }

    fn state(&self) -> LibraryState {
        state_of(&self.inner)
    }

    fn load(&self) -> Result<()> {
        load_with(&self.inner, &self.registration_name, |_| {
            Ok((self.build)()?
                .into_iter()
                .map(EpFactory::Internal)
                .collect())
        })
    }

    fn factories(&self) -> Vec<Arc<EpFactory>> {
        factories_of(&self.inner)
    }

    fn unload(&self) -> Result<UnloadReport> {
        unload_with(&self.inner, &self.registration_name)
    }
}

impl fmt::Debug for EpLibraryInternal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpLibraryInternal")
            .field("registration_name", &self.registration_name)
            .field("state", &self.state())
            .finish()
    }
}

/// Entry points of a plugin that is linked into the process instead of loaded
/// from a file.
#[derive(Debug, Clone, Copy)]
pub struct PluginEntryPoints {
    create: CreateEpFactoriesFn,
    release: ReleaseEpFactoryFn,
}

impl PluginEntryPoints {
    /// Bundle a plugin's entry points.
    ///
    /// # Safety
    /// Both functions must implement the execution provider ABI and belong to
    /// the same plugin.
    pub unsafe fn new(create: CreateEpFactoriesFn, release: ReleaseEpFactoryFn) -> Self {
        Self { create, release }
    }
}

#[derive(Debug, Clone)]
enum PluginOrigin {
    File(PathBuf),
    Linked(PluginEntryPoints),
}

/// A plugin implementing the execution provider ABI.
pub struct EpLibraryPlugin {
    registration_name: String,
    origin: PluginOrigin,
    inner: Mutex<LibraryInner>,
}

impl EpLibraryPlugin {
    /// A plugin loaded from a shared library file.
    pub fn from_path(registration_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::with_origin(registration_name.into(), PluginOrigin::File(path.into()))
    }

    /// A plugin linked into the process.
    pub fn from_entry_points(
        registration_name: impl Into<String>,
        entry_points: PluginEntryPoints,
    ) -> Self {
        Self::with_origin(registration_name.into(), PluginOrigin::Linked(entry_points))
    }

    fn with_origin(registration_name: String, origin: PluginOrigin) -> Self {
        Self {
            registration_name,
            origin,
            inner: Mutex::new(LibraryInner::new()),
        }
    }

    /// Path of the shared library, if loaded from a file.
    pub fn path(&self) -> Option<&Path> {
        match &self.origin {
            PluginOrigin::File(path) => Some(path),
            PluginOrigin::Linked(_) => None,
        }
    }

    /// Whether the shared library is currently mapped by this registration.
    ///
    /// Always false for linked plugins.
    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.handle.is_some())
            .unwrap_or(false)
    }

    fn resolve_entry_points(&self, inner: &mut LibraryInner) -> Result<PluginEntryPoints> {
        let path = match &self.origin {
            PluginOrigin::Linked(entry_points) => return Ok(*entry_points),
            PluginOrigin::File(path) => path,
        };

        debug!("Opening execution provider library {:?}", path);
        // SAFETY: loading a library runs its initializers; plugins are trusted
        // code supplied by the caller.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            CoreError::fail(format!(
                "failed to load execution provider library {path:?}: {e}"
            ))
        })?;
        let library = Arc::new(library);
        inner.handle = Some(Arc::clone(&library));

        let symbol_error = |symbol: &[u8], e: libloading::Error| {
            let symbol = String::from_utf8_lossy(symbol).trim_end_matches('\0').to_string();
            CoreError::fail(format!(
                "execution provider library {path:?} does not export '{symbol}': {e}"
            ))
        };

        // SAFETY: the symbol types are the ones the ABI prescribes.
        unsafe {
            let create = *library
                .get::<CreateEpFactoriesFn>(CREATE_EP_FACTORIES_SYMBOL)
                .map_err(|e| symbol_error(CREATE_EP_FACTORIES_SYMBOL, e))?;
            let release = *library
                .get::<ReleaseEpFactoryFn>(RELEASE_EP_FACTORY_SYMBOL)
                .map_err(|e| symbol_error(RELEASE_EP_FACTORY_SYMBOL, e))?;
            Ok(PluginEntryPoints::new(create, release))
        }
    }

    fn create_factories(&self, inner: &mut LibraryInner) -> Result<Vec<EpFactory>> {
        let entry_points = self.resolve_entry_points(inner)?;

        let mut raw: [*mut RonnEpFactory; MAX_EP_FACTORIES_PER_LIBRARY] =
            [std::ptr::null_mut(); MAX_EP_FACTORIES_PER_LIBRARY];
        let mut count = 0usize;
        let registration_name = RonnStr::new(&self.registration_name);

        // SAFETY: all out-pointers are valid for the duration of the call.
        let status = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            (entry_points.create)(
                registration_name,
                host_api(),
                raw.as_mut_ptr(),
                raw.len(),
                &mut count,
            )
        }))
        .map_err(|_| {
            CoreError::fail(format!(
                "execution provider library '{}' panicked while creating factories",
                self.registration_name
            ))
        })?;
        // SAFETY: plugins only return statuses created through the host API.
        unsafe { host_api::status_to_result(status) }?;

        if count > MAX_EP_FACTORIES_PER_LIBRARY {
            return Err(CoreError::fail(format!(
                "execution provider library '{}' reported {} factories, at most {} are supported",
                self.registration_name, count, MAX_EP_FACTORIES_PER_LIBRARY
            )));
        }

        let mut factories = Vec::with_capacity(count);
        let mut missing = 0;
        for ptr in &raw[..count] {
            match NonNull::new(*ptr) {
                // SAFETY: returned by this plugin's creation entry point.
                Some(ptr) => factories.push(unsafe {
                    PluginEpFactory::from_raw(
                        ptr,
                        entry_points.release,
                        inner.handle.clone(),
                        &self.registration_name,
                    )
                }),
                None => missing += 1,
            }
        }
        if missing > 0 {
            return Err(CoreError::fail(format!(
                "execution provider library '{}' returned {} null factories",
                self.registration_name, missing
            )));
        }

        for factory in &mut factories {
            factory.describe()?;
            debug!(
                "Created execution provider factory '{}' (vendor '{}', API version {})",
                factory.name(),
                factory.vendor(),
                factory.api_version()
            );
        }

        Ok(factories.into_iter().map(EpFactory::Plugin).collect())
    }
}

impl EpLibrary for EpLibraryPlugin {
    fn registration_name(&self) -> &str {
        &self.registration_name
    }

    fn kind(&self) -> LibraryKind {
        LibraryKind::Plugin
    }

    fn state(&self) -> LibraryState {
        state_of(&self.inner)
    }

    fn load(&self) -> Result<()> {
        load_with(&self.inner, &self.registration_name, |inner| {
            self.create_factories(inner)
        })
    }

    fn factories(&self) -> Vec<Arc<EpFactory>> {
        factories_of(&self.inner)
    }

    fn unload(&self) -> Result<UnloadReport> {
        unload_with(&self.inner, &self.registration_name)
    }
}

impl fmt::Debug for EpLibraryPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpLibraryPlugin")
            .field("registration_name", &self.registration_name)
            .field("origin", &self.origin)
            .field("state", &self.state())
            .finish()
    }
}

/// Legacy providers the bridge knows how to wrap, by library file name.
const BRIDGED_PROVIDERS: &[(&str, fn() -> InternalEpFactory)] =
    &[("ronn_providers_cuda", gpu::create_cuda_factory)];

fn bridged_provider(file_name: &str) -> Option<fn() -> InternalEpFactory> {
    BRIDGED_PROVIDERS
        .iter()
        .find(|(marker, _)| file_name.contains(marker))
        .map(|(_, create)| *create)
}

/// A legacy provider library wrapped by the host.
///
/// Legacy providers do not implement the plugin ABI. The bridge recognizes the
/// provider from the library file name and exposes the matching built-in
/// factory.
pub struct EpLibraryProviderBridge {
    registration_name: String,
    path: PathBuf,
    inner: Mutex<LibraryInner>,
}

impl EpLibraryProviderBridge {
    /// Wrap the legacy provider library at `path`.
    pub fn new(registration_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            registration_name: registration_name.into(),
            path: path.into(),
            inner: Mutex::new(LibraryInner::new()),
        }
    }

    /// Path of the wrapped library.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_factories(&self) -> Result<Vec<EpFactory>> {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let create = bridged_provider(&file_name).ok_or_else(|| {
            CoreError::invalid_argument(format!(
                "'{}' is not a known provider library",
                self.path.display()
            ))
        })?;

        if !self.path.is_file() {
            return Err(CoreError::fail(format!(
                "provider library {:?} not found",
                self.path
            )));
        }

        Ok(vec![EpFactory::Internal(create())])
    }
}

impl EpLibrary for EpLibraryProviderBridge {
    fn registration_name(&self) -> &str {
        &self.registration_name
    }

    fn kind(&self) -> LibraryKind {
        LibraryKind::ProviderBridge
    }

    fn state(&self) -> LibraryState {
        state_of(&self.inner)
    }

    fn load(&self) -> Result<()> {
        load_with(&self.inner, &self.registration_name, |_| self.create_factories())
    }

    fn factories(&self) -> Vec<Arc<EpFactory>> {
        factories_of(&self.inner)
    }

    fn unload(&self) -> Result<UnloadReport> {
        unload_with(&self.inner, &self.registration_name)
    }
}

impl fmt::Debug for EpLibraryProviderBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpLibraryProviderBridge")
            .field("registration_name", &self.registration_name)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}

/// Where a library registered by name comes from.
#[derive(Debug, Clone)]
pub enum EpLibrarySource {
    /// A plugin shared library.
    Plugin(PathBuf),
    /// A plugin linked into the process.
    Linked(PluginEntryPoints),
    /// A legacy provider library.
    ProviderBridge(PathBuf),
}

impl EpLibrarySource {
    /// Pick the source kind for a library file.
    ///
    /// Known legacy provider libraries are bridged, anything else is loaded
    /// as a plugin.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let bridged = path
            .file_name()
            .map(|name| bridged_provider(&name.to_string_lossy()).is_some())
            .unwrap_or(false);

        if bridged {
            Self::ProviderBridge(path)
        } else {
            Self::Plugin(path)
        }
    }

    /// Build an (unloaded) library for this source.
    pub fn into_library(self, registration_name: &str) -> Arc<dyn EpLibrary> {
        match self {
            Self::Plugin(path) => Arc::new(EpLibraryPlugin::from_path(registration_name, path)),
            Self::Linked(entry_points) => Arc::new(EpLibraryPlugin::from_entry_points(
                registration_name,
                entry_points,
            )),
            Self::ProviderBridge(path) => {
                Arc::new(EpLibraryProviderBridge::new(registration_name, path))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_library_lifecycle() -> anyhow::Result<()> {
        let library = EpLibraryInternal::cpu();
        assert_eq!(library.state(), LibraryState::Unloaded);
        assert!(library.factories().is_empty());

        library.load()?;
        library.load()?;
        assert_eq!(library.state(), LibraryState::Loaded);
        assert_eq!(library.factories().len(), 1);
        assert_eq!(library.factories()[0].name(), cpu::CPU_EXECUTION_PROVIDER);

        let report = library.unload()?;
        assert_eq!(report, UnloadReport { released: 1, failed: 0, deferred: 0 });
        assert_eq!(library.state(), LibraryState::Unloaded);

        assert_eq!(library.unload()?, UnloadReport::default());
        Ok(())
    }

    #[test]
    fn test_unload_defers_factories_in_use() -> anyhow::Result<()> {
        let library = EpLibraryInternal::cpu();
        library.load()?;

        let held = library.factories();
        let report = library.unload()?;
        assert_eq!(report.deferred, 1);
        assert!(!report.is_clean());
        assert_eq!(held[0].name(), cpu::CPU_EXECUTION_PROVIDER);
        Ok(())
    }

    #[test]
    fn test_failed_internal_load_returns_to_unloaded() {
        let library = EpLibraryInternal::new(
            "broken",
            Box::new(|| -> Result<Vec<InternalEpFactory>> { Err(CoreError::fail("no backend")) }),
        );

        assert!(library.load().is_err());
        assert_eq!(library.state(), LibraryState::Unloaded);
        assert!(library.factories().is_empty());
    }

    #[test]
    fn test_missing_plugin_file_fails() {
        let library = EpLibraryPlugin::from_path("ghost", "/nonexistent/libghost_ep.so");
        let err = library.load().unwrap_err();

        assert!(matches!(err, CoreError::Fail(_)));
        assert_eq!(library.state(), LibraryState::Unloaded);
        assert!(!library.is_open());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_entry_point_closes_library() {
        let library = EpLibraryPlugin::from_path("not_a_plugin", "libc.so.6");
        let err = library.load().unwrap_err();

        assert!(err.to_string().contains("CreateEpFactories"));
        assert!(!library.is_open());
        assert_eq!(library.state(), LibraryState::Unloaded);
        assert!(library.factories().is_empty());
    }

    #[test]
    fn test_bridge_rejects_unknown_library() {
        let library = EpLibraryProviderBridge::new("legacy", "/opt/ronn/libsomething_else.so");
        let err = library.load().unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_bridge_requires_existing_file() {
        let library =
            EpLibraryProviderBridge::new("CUDA", "/nonexistent/libronn_providers_cuda.so");
        let err = library.load().unwrap_err();
        assert!(matches!(err, CoreError::Fail(_)));
        assert_eq!(library.state(), LibraryState::Unloaded);
    }

    #[test]
    fn test_source_from_path() {
        assert!(matches!(
            EpLibrarySource::from_path("/opt/ronn/libronn_providers_cuda.so"),
            EpLibrarySource::ProviderBridge(_)
        ));
        assert!(matches!(
            EpLibrarySource::from_path("/opt/ronn/libvendor_npu_ep.so"),
            EpLibrarySource::Plugin(_)
        ));
    }
}
