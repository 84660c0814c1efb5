//! Process start: the optional re-exec through a preloader, resource limits
//! and the hand-off to the first thread.

use std::ffi::{CStr, OsStr, OsString};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, warn};

use crate::loader::{CoreRuntime, DynamicLinker, FileSystem, Loader, Result};
use crate::paths::SearchPaths;
use crate::profile::TargetProfile;

/// Explicit loader binary, tried after the one next to the executable.
pub const LOADER_ENV: &str = "PEBRIDGE_LOADER";
/// Set in the environment of a re-executed loader so it does not re-exec
/// again.
pub const NOEXEC_ENV: &str = "PEBRIDGE_LOADER_NOEXEC";
/// Forces the 32-on-64 profile on macOS hosts.
pub const USE_32ON64_ENV: &str = "PEBRIDGE_USE_32ON64";

const LOADER_NAME: &str = "pebridge";
const INSTALL_BIN_DIR: &str = match option_env!("PEBRIDGE_BINDIR") {
    Some(dir) => dir,
    None => "/usr/local/bin",
};
/// Installed layout: `<prefix>/lib/pebridge` holds the DLLs.
const DLL_TO_BIN_DIR: &str = "../../bin";

/// macOS release (Darwin major) from which 32-bit processes are gone.
const DARWIN_WITHOUT_32BIT: u32 = 19;
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
const BSD_DATA_LIMIT: libc::rlim_t = 0x0200_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    Android,
    MacOs,
    FreeBsd,
    DragonFly,
    Other,
}

impl HostOs {
    pub const fn current() -> Self {
        if cfg!(target_os = "android") {
            HostOs::Android
        } else if cfg!(target_os = "linux") {
            HostOs::Linux
        } else if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else if cfg!(target_os = "freebsd") {
            HostOs::FreeBsd
        } else if cfg!(target_os = "dragonfly") {
            HostOs::DragonFly
        } else {
            HostOs::Other
        }
    }

    /// Whether loaders on this OS are started through a preloader.
    pub const fn uses_preloader(self) -> bool {
        matches!(self, HostOs::Linux | HostOs::Android | HostOs::MacOs)
    }
}

/// Whether the process must be replaced before the loader can run.
pub fn needs_reexec(os: HostOs, profile: TargetProfile) -> bool {
    use TargetProfile::*;

    match os {
        HostOs::Android | HostOs::MacOs => matches!(profile, X86 | X86_64 | X86On64),
        HostOs::Linux => matches!(profile, X86 | X86_64 | X86On64 | Arm64),
        HostOs::FreeBsd | HostOs::DragonFly => true,
        HostOs::Other => false,
    }
}

/// Whether 32-bit images have to run in a 64-bit process. Only macOS from
/// release 19 on, or when forced.
pub fn needs_32on64(os: HostOs, forced: bool, release: &str) -> bool {
    if os != HostOs::MacOs {
        return false;
    }
    if forced {
        return true;
    }
    let mut parts = release.split('.');
    let major = parts.next().and_then(|m| m.parse::<u32>().ok());
    let minor = parts.next().and_then(|m| m.parse::<u32>().ok());
    matches!((major, minor), (Some(major), Some(_)) if major >= DARWIN_WITHOUT_32BIT)
}

/// [`needs_32on64`] for the running host.
pub fn host_needs_32on64() -> bool {
    let os = HostOs::current();
    if os != HostOs::MacOs {
        return false;
    }
    let forced = std::env::var_os(USE_32ON64_ENV).is_some();
    needs_32on64(os, forced, &os_release().unwrap_or_default())
}

fn os_release() -> Option<String> {
    // SAFETY: utsname is plain data and uname only writes into it.
    let mut name: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut name) } != 0 {
        return None;
    }
    // SAFETY: uname NUL-terminates every field.
    let release = unsafe { CStr::from_ptr(name.release.as_ptr()) };
    Some(release.to_string_lossy().into_owned())
}

/// Preloader that goes with the loader at `loader`: same directory, name
/// picked by the loader's suffix.
pub fn preloader_name(loader: &Path) -> PathBuf {
    let name = loader
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let preloader = if name.len() > 6 && name.ends_with("32on64") {
        "pebridge32on64-preloader"
    } else if name.len() > 2 && name.ends_with("64") {
        "pebridge64-preloader"
    } else {
        "pebridge-preloader"
    };
    loader.with_file_name(preloader)
}

/// Ordered argument vectors to exec, first one that works wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPlan {
    pub attempts: Vec<Vec<OsString>>,
}

impl ExecPlan {
    /// Replace the process with the first attempt that can be executed.
    /// Only returns when all of them failed.
    pub fn exec(&self) -> io::Error {
        let mut last = io::Error::new(io::ErrorKind::NotFound, "no loader candidates");
        for argv in &self.attempts {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            debug!("trying to exec {}", Path::new(program).display());
            last = Command::new(program).args(args).env(NOEXEC_ENV, "1").exec();
        }
        last
    }
}

/// What to do at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Reexec(ExecPlan),
    Continue,
}

/// Environment the start-up decision depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootEnv {
    pub noexec: bool,
    pub loader: Option<OsString>,
    pub path: Option<OsString>,
}

impl BootEnv {
    pub fn from_process() -> Self {
        Self {
            noexec: std::env::var_os(NOEXEC_ENV).is_some(),
            loader: std::env::var_os(LOADER_ENV),
            path: std::env::var_os("PATH"),
        }
    }
}

pub struct Bootstrap {
    pub os: HostOs,
    pub profile: TargetProfile,
    pub paths: SearchPaths,
    /// Directory of the running loader in an installed layout.
    pub bin_dir: Option<PathBuf>,
    pub env: BootEnv,
}

impl Bootstrap {
    pub fn new(os: HostOs, profile: TargetProfile, paths: SearchPaths, env: BootEnv) -> Self {
        let bin_dir = match paths.build_dir {
            Some(_) => None,
            None => std::env::current_exe()
                .and_then(|exe| exe.canonicalize())
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
                .or_else(|| Some(paths.dll_dir.join(DLL_TO_BIN_DIR))),
        };
        Self {
            os,
            profile,
            paths,
            bin_dir,
            env,
        }
    }

    pub fn decide(&self, args: &[OsString]) -> Decision {
        if self.env.noexec || !needs_reexec(self.os, self.profile) {
            return Decision::Continue;
        }
        Decision::Reexec(self.plan(args))
    }

    /// Loader candidates for re-executing with `args` (`args[0]` is the
    /// current program and gets replaced by the loader).
    pub fn plan(&self, args: &[OsString]) -> ExecPlan {
        let rest = args.get(1..).unwrap_or_default();
        let mut loaders = Vec::new();

        if let Some(build) = &self.paths.build_dir {
            let name = format!("{LOADER_NAME}{}", self.profile.loader_suffix());
            loaders.push(build.join("loader").join(name));
        } else {
            let name = args
                .first()
                .and_then(|argv0| Path::new(argv0).file_name())
                .unwrap_or(OsStr::new(LOADER_NAME))
                .to_os_string();
            if let Some(bin) = &self.bin_dir {
                loaders.push(bin.join(&name));
            }
            if let Some(loader) = &self.env.loader {
                loaders.push(PathBuf::from(loader));
            }
            if let Some(path) = &self.env.path {
                loaders.extend(
                    std::env::split_paths(path)
                        .filter(|dir| !dir.as_os_str().is_empty())
                        .map(|dir| dir.join(&name)),
                );
            }
            loaders.push(Path::new(INSTALL_BIN_DIR).join(&name));
        }

        let mut attempts = Vec::new();
        for loader in loaders {
            let direct: Vec<OsString> = std::iter::once(loader.clone().into_os_string())
                .chain(rest.iter().cloned())
                .collect();
            if self.os.uses_preloader() {
                let mut preloaded = vec![preloader_name(&loader).into_os_string()];
                preloaded.extend(direct.iter().cloned());
                attempts.push(preloaded);
            }
            attempts.push(direct);
        }
        ExecPlan { attempts }
    }

    /// Raise limits, load the core runtime and hand it to `starter`, which
    /// runs the first thread.
    pub fn start<L, F, T>(
        &self,
        loader: &Loader<L, F>,
        starter: impl FnOnce(&CoreRuntime) -> T,
    ) -> Result<T>
    where
        L: DynamicLinker,
        F: FileSystem,
    {
        raise_limits();
        let core = loader.load_core_runtime()?;
        Ok(starter(&core))
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

fn set_max_limit(resource: Resource) -> io::Result<()> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid rlimit to write into.
    if unsafe { libc::getrlimit(resource, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    limit.rlim_cur = limit.rlim_max;
    // SAFETY: `limit` is a valid rlimit.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Raise the soft file-descriptor and address-space limits to their hard
/// limits. BSDs also get a fixed data segment limit.
pub fn raise_limits() {
    for (name, resource) in [("NOFILE", libc::RLIMIT_NOFILE), ("AS", libc::RLIMIT_AS)] {
        if let Err(e) = set_max_limit(resource) {
            warn!("could not raise RLIMIT_{name}: {e}");
        }
    }

    #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
    {
        let limit = libc::rlimit {
            rlim_cur: BSD_DATA_LIMIT,
            rlim_max: BSD_DATA_LIMIT,
        };
        // SAFETY: `limit` is a valid rlimit.
        if unsafe { libc::setrlimit(libc::RLIMIT_DATA, &limit) } != 0 {
            warn!("could not set RLIMIT_DATA: {}", io::Error::last_os_error());
        }
    }
}

/// Print a diagnostic and terminate the process.
pub fn fatal(message: impl std::fmt::Display) -> ! {
    eprintln!("pebridge: {message}");
    std::process::exit(1)
}
