//! The core runtime module every builtin resolves its imports against.

use log::error;

use super::linker::LibraryHandle;
use super::module::ModuleHandle;
use crate::image::ExportDirectory;
use crate::memory::Result;

/// Export slot that receives the syscall dispatcher address.
pub const SYSCALL_DISPATCHER_SLOT: &str = "__builtin_syscall_dispatcher";

/// Entry points of the core runtime used to start the first thread and to
/// deliver exceptions and APCs. Missing ones are logged and left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryPoints {
    pub dbg_ui_remote_breakin: Option<u64>,
    pub ki_raise_user_exception_dispatcher: Option<u64>,
    pub ki_user_exception_dispatcher: Option<u64>,
    pub ki_user_apc_dispatcher: Option<u64>,
    pub ldr_initialize_thunk: Option<u64>,
    pub rtl_user_thread_start: Option<u64>,
    pub rtl_find_clear_bits_and_set: Option<u64>,
    /// Heap routines, only looked up for 32-on-64 images.
    pub rtl_allocate_heap: Option<u64>,
    pub rtl_free_heap: Option<u64>,
    pub set_unix_funcs: Option<u64>,
}

impl EntryPoints {
    pub fn resolve(
        hybrid: bool,
        mut lookup: impl FnMut(&str) -> Result<Option<u64>>,
    ) -> Result<Self> {
        let mut get = |name: &str| -> Result<Option<u64>> {
            let addr = lookup(name)?;
            if addr.is_none() {
                error!("{name} not found");
            }
            Ok(addr)
        };

        let mut entry = Self {
            dbg_ui_remote_breakin: get("DbgUiRemoteBreakin")?,
            ki_raise_user_exception_dispatcher: get("KiRaiseUserExceptionDispatcher")?,
            ki_user_exception_dispatcher: get("KiUserExceptionDispatcher")?,
            ki_user_apc_dispatcher: get("KiUserApcDispatcher")?,
            ldr_initialize_thunk: get("LdrInitializeThunk")?,
            rtl_user_thread_start: get("RtlUserThreadStart")?,
            rtl_find_clear_bits_and_set: get("RtlFindClearBitsAndSet")?,
            ..Self::default()
        };
        if hybrid {
            entry.rtl_allocate_heap = get("RtlAllocateHeap")?;
            entry.rtl_free_heap = get("RtlFreeHeap")?;
        }
        entry.set_unix_funcs = get("__builtin_set_unix_funcs")?;
        Ok(entry)
    }
}

/// The loaded core runtime.
#[derive(Debug, Clone)]
pub struct CoreRuntime {
    pub module: ModuleHandle,
    pub exports: ExportDirectory,
    pub entry_points: EntryPoints,
    /// Shared object backing the runtime, used for native-side lookups.
    pub library: Option<LibraryHandle>,
}
