//! Module images, the shared image registry, and linkage resolution.
//!
//! Parsing the on-disk object format is a collaborator's concern: a
//! [`ModuleSource`] hands the VM a fully structured [`ModuleImage`].
//! The core's job starts there: caching images by path, instantiating a
//! per-load data segment, and resolving a caller's linkage descriptor
//! against the image's export table — by exact name *and* signature
//! hash, atomically. A single unresolved import means no linkage table
//! and no module handle, never a partial table.
//!
//! The indirection is deliberate: a caller compiled against any subset
//! of a module's exports keeps working when the module grows new
//! entry points, because calls address functions by index into the
//! caller's own resolved table, never by name, after load time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::value::{Instruction, LoadError, ModId, TypeDesc};

/// An exported function: name, signature hash, entry point, and the
/// descriptor index of its call frame.
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub sig: u32,
    pub pc: usize,
    pub frame_desc: usize,
}

/// One entry of a linkage descriptor: a function the calling module
/// expects the loaded module to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub name: String,
    pub sig: u32,
}

/// Initial content of one module data slot.
#[derive(Debug, Clone)]
pub enum DataInit {
    Nil,
    Byte(u8),
    Word(i32),
    Big(i64),
    Real(f64),
    /// Allocated as a heap string block at instantiation time.
    Str(String),
}

/// The entry point a host boots a module at.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub pc: usize,
    pub frame_desc: usize,
}

/// A structured, immutable unit of code as produced by the module
/// source collaborator.
#[derive(Debug)]
pub struct ModuleImage {
    pub name: String,
    pub code: Arc<[Instruction]>,
    /// Type descriptors referenced by frame/allocation instructions.
    pub descs: Vec<TypeDesc>,
    /// Initial values of the module data segment.
    pub data: Vec<DataInit>,
    pub exports: Vec<Export>,
    /// Linkage descriptors referenced by this module's own `load`
    /// instructions, by index.
    pub link_descs: Vec<Vec<Import>>,
    /// Boot entry point, if the module can start a program.
    pub entry: Option<Entry>,
}

impl ModuleImage {
    /// Look up an export by exact name and signature hash.
    pub fn find_export(&self, import: &Import) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == import.name && e.sig == import.sig)
    }
}

/// Resolves a path to raw module content. The loader treats any error
/// as a load failure.
pub trait ModuleSource: Send + Sync {
    fn resolve(&self, path: &str) -> Result<Arc<ModuleImage>, LoadError>;
}

/// In-memory module source for hosts and tests.
#[derive(Default)]
pub struct MapSource {
    images: HashMap<String, Arc<ModuleImage>>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, image: ModuleImage) {
        self.images.insert(path.into(), Arc::new(image));
    }
}

impl ModuleSource for MapSource {
    fn resolve(&self, path: &str) -> Result<Arc<ModuleImage>, LoadError> {
        self.images.get(path).cloned().ok_or_else(|| LoadError::NotFound(path.to_string()))
    }
}

/// Process-wide image cache with load-or-get-cached semantics, shared
/// across VM instances. Images are immutable once published.
#[derive(Default)]
pub struct ImageRegistry {
    images: RwLock<HashMap<String, Arc<ModuleImage>>>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached image for `path`, consulting `source` on a
    /// miss.
    pub fn fetch(
        &self,
        path: &str,
        source: &dyn ModuleSource,
    ) -> Result<Arc<ModuleImage>, LoadError> {
        if let Some(image) = self.images.read().get(path) {
            return Ok(image.clone());
        }
        let image = source.resolve(path)?;
        debug!(path, module = %image.name, "module image cached");
        self.images.write().insert(path.to_string(), image.clone());
        Ok(image)
    }

    /// Number of cached images (diagnostics).
    pub fn cached(&self) -> usize {
        self.images.read().len()
    }
}

/// One resolved entry of a linkage table.
#[derive(Debug, Clone, Copy)]
pub struct LinkEntry {
    /// Module the entry points into.
    pub module: ModId,
    /// Entry program counter.
    pub pc: usize,
    /// Descriptor index (in the target module) of the call frame.
    pub frame_desc: usize,
}

/// A VM-owned linkage table: the caller's descriptor resolved against
/// a loaded module, ordered exactly as the descriptor. Read-only after
/// load.
#[derive(Debug)]
pub struct Linkage {
    pub module: ModId,
    pub entries: Vec<LinkEntry>,
}

impl Linkage {
    /// Bounds-checked entry lookup.
    pub fn entry(&self, index: usize) -> Option<&LinkEntry> {
        self.entries.get(index)
    }
}

/// Resolve every import of `descriptor` against `image`, in order.
/// Fails on the first unmatched entry; the caller must then retain
/// nothing (load atomicity).
pub fn resolve_linkage(
    image: &ModuleImage,
    module: ModId,
    descriptor: &[Import],
) -> Result<Linkage, LoadError> {
    let mut entries = Vec::with_capacity(descriptor.len());
    for import in descriptor {
        let export = image.find_export(import).ok_or_else(|| LoadError::Unresolved {
            name: import.name.clone(),
            sig: import.sig,
        })?;
        if export.pc >= image.code.len() {
            return Err(LoadError::BadImage(format!(
                "export {} points outside code (pc {})",
                export.name, export.pc
            )));
        }
        entries.push(LinkEntry { module, pc: export.pc, frame_desc: export.frame_desc });
    }
    Ok(Linkage { module, entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_exports(exports: Vec<Export>) -> ModuleImage {
        ModuleImage {
            name: "m".into(),
            code: vec![Instruction::Nop; 16].into(),
            descs: vec![TypeDesc::scalar(1)],
            data: Vec::new(),
            exports,
            link_descs: Vec::new(),
            entry: None,
        }
    }

    fn export(name: &str, sig: u32, pc: usize) -> Export {
        Export { name: name.into(), sig, pc, frame_desc: 0 }
    }

    #[test]
    fn test_resolution_orders_as_descriptor() {
        let image = image_with_exports(vec![export("f", 0x11, 3), export("g", 0x22, 7)]);
        let desc = vec![
            Import { name: "g".into(), sig: 0x22 },
            Import { name: "f".into(), sig: 0x11 },
        ];

        let linkage = resolve_linkage(&image, ModId(1), &desc).unwrap();
        assert_eq!(linkage.entries.len(), 2);
        assert_eq!(linkage.entries[0].pc, 7);
        assert_eq!(linkage.entries[1].pc, 3);
    }

    #[test]
    fn test_signature_must_match_exactly() {
        let image = image_with_exports(vec![export("f", 0x11, 3)]);
        let desc = vec![Import { name: "f".into(), sig: 0x99 }];

        let err = resolve_linkage(&image, ModId(0), &desc).unwrap_err();
        assert_eq!(err, LoadError::Unresolved { name: "f".into(), sig: 0x99 });
    }

    #[test]
    fn test_one_miss_fails_the_whole_load() {
        // f matches; x does not exist. No partial table may survive.
        let image = image_with_exports(vec![export("f", 0x11, 3), export("g", 0x22, 7)]);
        let desc = vec![
            Import { name: "f".into(), sig: 0x11 },
            Import { name: "x".into(), sig: 0x33 },
        ];

        assert!(resolve_linkage(&image, ModId(0), &desc).is_err());
    }

    #[test]
    fn test_superset_exports_are_fine() {
        let image = image_with_exports(vec![export("f", 0x11, 3), export("g", 0x22, 7)]);
        let desc = vec![Import { name: "f".into(), sig: 0x11 }];

        let linkage = resolve_linkage(&image, ModId(0), &desc).unwrap();
        assert_eq!(linkage.entries.len(), 1);
    }

    #[test]
    fn test_registry_caches_by_path() {
        let mut source = MapSource::new();
        source.insert("lib/m", image_with_exports(vec![]));

        let registry = ImageRegistry::new();
        let a = registry.fetch("lib/m", &source).unwrap();
        let b = registry.fetch("lib/m", &source).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.cached(), 1);

        let err = registry.fetch("lib/absent", &source).unwrap_err();
        assert_eq!(err, LoadError::NotFound("lib/absent".into()));
    }
}
