pub mod exports;
pub mod load;
pub mod run;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use pebridge::bootstrap;
use pebridge::loader::{ElfLinker, HostFileSystem, Loader, LoaderConfig, CORE_MODULE};
use pebridge::paths::{SearchPaths, DLL_PATH_ENV};
use pebridge::{AddressSpace, TargetProfile};

pub type HostLoader = Loader<ElfLinker, HostFileSystem>;

/// Options shared by every command.
#[derive(Args)]
pub struct LoaderOpts {
    /// Directory holding the core runtime [default: next to the executable]
    #[arg(long, env = "PEBRIDGE_DLL_DIR", global = true)]
    pub dll_dir: Option<PathBuf>,

    /// Extra builtin search directories
    #[arg(long, env = DLL_PATH_ENV, value_delimiter = ':', global = true)]
    pub dll_path: Vec<PathBuf>,

    /// Target profile: x86, x86_64, arm, arm64 or x86on64 [default: host]
    #[arg(long, global = true)]
    pub profile: Option<TargetProfile>,

    /// Name of the core runtime module
    #[arg(long, default_value = CORE_MODULE, global = true)]
    pub core_module: String,
}

impl LoaderOpts {
    pub fn profile(&self) -> TargetProfile {
        match self.profile {
            Some(profile) => profile,
            None if TargetProfile::host() == TargetProfile::X86
                && bootstrap::host_needs_32on64() =>
            {
                TargetProfile::X86On64
            }
            None => TargetProfile::host(),
        }
    }

    fn dll_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dll_dir {
            return dir.clone();
        }
        std::env::current_exe()
            .and_then(|exe| exe.canonicalize())
            .ok()
            .and_then(|exe| exe.parent().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn search_paths(&self) -> SearchPaths {
        let stem = self
            .core_module
            .strip_suffix(".dll")
            .unwrap_or(&self.core_module);
        let mut paths = SearchPaths::from_dll_dir(self.dll_dir(), stem, None);
        paths.dll_paths.extend(self.dll_path.iter().cloned());
        paths
    }

    pub fn loader(&self) -> HostLoader {
        let mut config = LoaderConfig::new(self.profile(), self.search_paths());
        config.core_module = self.core_module.clone();

        let space = Arc::new(AddressSpace::new());
        let linker = ElfLinker::new(space.clone());
        Loader::new(space, linker, HostFileSystem, config)
    }
}
