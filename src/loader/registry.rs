//! Process-wide list of loaded builtin modules.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::linker::LibraryHandle;
use super::module::{BuiltinModule, FileId, ModuleHandle};

/// Result of [`ModuleRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    New(ModuleHandle),
    /// An entry with the same identity or base address was already present.
    Existing(ModuleHandle),
}

impl Inserted {
    pub fn module(self) -> ModuleHandle {
        match self {
            Inserted::New(m) | Inserted::Existing(m) => m,
        }
    }
}

/// State of a module's native side as seen by [`ModuleRegistry::unix_side`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnixSide {
    /// The module has no native side yet.
    Free,
    /// The module already uses this handle.
    Attached { entry: u64 },
    /// The module has a different native side.
    Conflict,
    /// The handle is the native side of another module.
    OwnedBy(ModuleHandle),
    /// No module at that base.
    Missing,
}

/// Insertion-ordered registry. Lookups are linear scans; at most one entry
/// exists per file identity and per module base.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Mutex<Vec<BuiltinModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<BuiltinModule>> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn modules(&self) -> Vec<ModuleHandle> {
        self.entries().iter().map(|b| b.module).collect()
    }

    pub fn find_by_module(&self, module: ModuleHandle) -> Option<BuiltinModule> {
        self.entries().iter().find(|b| b.module == module).cloned()
    }

    pub fn find_by_identity(&self, id: FileId) -> Option<ModuleHandle> {
        self.entries()
            .iter()
            .find(|b| b.identity == Some(id))
            .map(|b| b.module)
    }

    pub fn find_by_handle(&self, handle: LibraryHandle) -> Option<ModuleHandle> {
        self.entries()
            .iter()
            .find(|b| b.handle == Some(handle))
            .map(|b| b.module)
    }

    /// Publish a fully built module, unless one with the same identity or
    /// base address got there first.
    pub fn insert(&self, entry: BuiltinModule) -> Inserted {
        let mut entries = self.entries();
        let existing = entries.iter().find(|b| {
            b.module == entry.module || (entry.identity.is_some() && b.identity == entry.identity)
        });
        if let Some(b) = existing {
            return Inserted::Existing(b.module);
        }
        let module = entry.module;
        entries.push(entry);
        Inserted::New(module)
    }

    pub fn update<R>(
        &self,
        module: ModuleHandle,
        f: impl FnOnce(&mut BuiltinModule) -> R,
    ) -> Option<R> {
        self.entries().iter_mut().find(|b| b.module == module).map(f)
    }

    /// Returns `Some(true)` the first time it is called for `module`.
    pub fn mark_initialized(&self, module: ModuleHandle) -> Option<bool> {
        self.update(module, |b| !std::mem::replace(&mut b.initialized, true))
    }

    /// Where `handle` stands relative to the native side of `module`.
    pub fn unix_side(&self, module: ModuleHandle, handle: LibraryHandle) -> UnixSide {
        let entries = self.entries();
        if let Some(owner) = entries
            .iter()
            .find(|b| b.module != module && b.unix_handle == Some(handle))
        {
            return UnixSide::OwnedBy(owner.module);
        }
        match entries.iter().find(|b| b.module == module) {
            None => UnixSide::Missing,
            Some(b) => match (b.unix_handle, b.unix_entry) {
                (Some(h), Some(entry)) if h == handle => UnixSide::Attached { entry },
                (Some(_), _) => UnixSide::Conflict,
                (None, _) => UnixSide::Free,
            },
        }
    }

    /// Record the native side of `module`. Fails if it already has one or
    /// the module is gone.
    pub fn attach_unix_side(
        &self,
        module: ModuleHandle,
        handle: LibraryHandle,
        unix_module: ModuleHandle,
        entry: u64,
    ) -> UnixSide {
        let mut entries = self.entries();
        let Some(b) = entries.iter_mut().find(|b| b.module == module) else {
            return UnixSide::Missing;
        };
        if b.unix_handle.is_some() {
            return UnixSide::Conflict;
        }
        b.unix_handle = Some(handle);
        b.unix_module = Some(unix_module);
        b.unix_entry = Some(entry);
        b.regions.push(unix_module.base());
        UnixSide::Attached { entry }
    }

    pub fn remove(&self, module: ModuleHandle) -> Option<BuiltinModule> {
        let mut entries = self.entries();
        let pos = entries.iter().position(|b| b.module == module)?;
        Some(entries.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::module::{ImageInfo, ImageKind};

    fn entry(base: u64, identity: Option<FileId>, handle: Option<u64>) -> BuiltinModule {
        BuiltinModule::new(
            ModuleHandle::new(base),
            identity,
            handle.map(LibraryHandle::new),
            ImageInfo {
                kind: ImageKind::Native,
                machine: 0,
                entry_point: 0,
                size_of_image: 0x1000,
                is_hybrid: false,
            },
            vec![base],
        )
    }

    #[test]
    fn same_identity_is_registered_once() {
        let registry = ModuleRegistry::new();
        let id = FileId { dev: 1, ino: 100 };

        let first = registry.insert(entry(0x10000, Some(id), None));
        let second = registry.insert(entry(0x20000, Some(id), None));

        assert_eq!(first, Inserted::New(ModuleHandle::new(0x10000)));
        assert_eq!(second, Inserted::Existing(ModuleHandle::new(0x10000)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_identity(id), Some(ModuleHandle::new(0x10000)));
    }

    #[test]
    fn entries_without_identity_never_collide_on_it() {
        let registry = ModuleRegistry::new();
        registry.insert(entry(0x10000, None, Some(1)));
        registry.insert(entry(0x20000, None, Some(2)));

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.find_by_handle(LibraryHandle::new(2)),
            Some(ModuleHandle::new(0x20000))
        );
    }

    #[test]
    fn native_side_attaches_once() {
        let registry = ModuleRegistry::new();
        let module = ModuleHandle::new(0x10000);
        let unix = LibraryHandle::new(7);
        registry.insert(entry(0x10000, None, Some(1)));
        registry.insert(entry(0x20000, None, Some(2)));

        assert_eq!(registry.unix_side(module, unix), UnixSide::Free);
        assert_eq!(
            registry.attach_unix_side(module, unix, ModuleHandle::new(0x50000), 0x51000),
            UnixSide::Attached { entry: 0x51000 }
        );
        assert_eq!(
            registry.unix_side(module, unix),
            UnixSide::Attached { entry: 0x51000 }
        );
        assert_eq!(
            registry.unix_side(module, LibraryHandle::new(8)),
            UnixSide::Conflict
        );
        assert_eq!(
            registry.unix_side(ModuleHandle::new(0x20000), unix),
            UnixSide::OwnedBy(module)
        );
        assert_eq!(
            registry.unix_side(ModuleHandle::new(0x90000), LibraryHandle::new(9)),
            UnixSide::Missing
        );
        assert_eq!(
            registry.attach_unix_side(module, LibraryHandle::new(8), module, 0),
            UnixSide::Conflict
        );
    }

    #[test]
    fn keeps_insertion_order_and_removes() {
        let registry = ModuleRegistry::new();
        for base in [0x30000, 0x10000, 0x20000] {
            registry.insert(entry(base, None, None));
        }
        assert_eq!(
            registry.modules(),
            vec![
                ModuleHandle::new(0x30000),
                ModuleHandle::new(0x10000),
                ModuleHandle::new(0x20000)
            ]
        );

        assert_eq!(registry.mark_initialized(ModuleHandle::new(0x10000)), Some(true));
        assert_eq!(registry.mark_initialized(ModuleHandle::new(0x10000)), Some(false));
        assert!(registry.remove(ModuleHandle::new(0x10000)).is_some());
        assert!(registry.remove(ModuleHandle::new(0x10000)).is_none());
        assert!(registry.remove(ModuleHandle::new(0x30000)).is_some());
        assert!(registry.remove(ModuleHandle::new(0x20000)).is_some());
        assert!(registry.is_empty());
    }
}
