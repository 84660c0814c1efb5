//! Where builtin modules are looked for.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Colon-separated list of extra builtin directories.
pub const DLL_PATH_ENV: &str = "PEBRIDGE_DLL_PATH";

/// Which part of the search produced a candidate path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// `<build>/dlls/...` or `<build>/programs/...`; any outcome but
    /// "not found" ends the search.
    BuildTree,
    /// A search directory; architecture mismatches keep the search going.
    SearchPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub origin: Origin,
}

/// Directories derived from the location of the core runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPaths {
    /// Directory holding the core runtime.
    pub dll_dir: PathBuf,
    /// Root of a build tree when running uninstalled.
    pub build_dir: Option<PathBuf>,
    /// Ordered builtin search directories.
    pub dll_paths: Vec<PathBuf>,
}

impl SearchPaths {
    /// `dll_dir` is a build tree when it ends in `dlls/<core_stem>`. The
    /// search list is `dll_dir` (installed layout only) followed by every
    /// entry of `env_dll_path`.
    pub fn from_dll_dir(
        dll_dir: impl Into<PathBuf>,
        core_stem: &str,
        env_dll_path: Option<&OsStr>,
    ) -> Self {
        let dll_dir = dll_dir.into();
        let build_dir = remove_tail(&dll_dir, &Path::new("dlls").join(core_stem));

        let mut dll_paths = Vec::new();
        if build_dir.is_none() {
            dll_paths.push(dll_dir.clone());
        }
        if let Some(list) = env_dll_path {
            dll_paths.extend(std::env::split_paths(list).filter(|p| !p.as_os_str().is_empty()));
        }

        Self {
            dll_dir,
            build_dir,
            dll_paths,
        }
    }

    /// A plain list of search directories, with `dll_dir` set to the first.
    pub fn with_dirs(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        let dll_paths: Vec<PathBuf> = dirs.into_iter().collect();
        Self {
            dll_dir: dll_paths.first().cloned().unwrap_or_default(),
            build_dir: None,
            dll_paths,
        }
    }

    /// Paths to try, in order, for a lowercased builtin `name`.
    pub fn candidates(&self, name: &str) -> Vec<Candidate> {
        let mut out = Vec::new();

        if let Some(build) = &self.build_dir {
            for (dir, ext) in [("dlls", ".dll"), ("programs", ".exe")] {
                let stem = name.strip_suffix(ext).unwrap_or(name);
                out.push(Candidate {
                    path: build.join(dir).join(stem).join(name),
                    origin: Origin::BuildTree,
                });
            }
        }

        out.extend(self.dll_paths.iter().map(|dir| Candidate {
            path: dir.join(name),
            origin: Origin::SearchPath,
        }));
        out
    }
}

/// Native-side library matching a builtin found at `path`: the extension of
/// `name` replaced with `.so`, in the same directory. `None` when the name
/// has no extension.
pub fn unix_side_path(path: &Path, name: &str) -> Option<PathBuf> {
    let (stem, _) = name.rsplit_once('.')?;
    Some(path.with_file_name(format!("{stem}.so")))
}

/// `dir` without `tail`, when it ends with it.
fn remove_tail(dir: &Path, tail: &Path) -> Option<PathBuf> {
    if !dir.ends_with(tail) {
        return None;
    }
    let mut root = dir.to_path_buf();
    for _ in tail.components() {
        root.pop();
    }
    Some(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installed_layout_searches_dll_dir_first() {
        let paths = SearchPaths::from_dll_dir(
            "/usr/lib/pebridge",
            "ntdll",
            Some(OsStr::new("/opt/a:/opt/b")),
        );
        assert_eq!(paths.build_dir, None);
        assert_eq!(
            paths.dll_paths,
            vec![
                PathBuf::from("/usr/lib/pebridge"),
                PathBuf::from("/opt/a"),
                PathBuf::from("/opt/b")
            ]
        );
    }

    #[test]
    fn build_tree_is_detected_and_not_searched() {
        let paths =
            SearchPaths::from_dll_dir("/src/build/dlls/ntdll", "ntdll", Some(OsStr::new("/x")));
        assert_eq!(paths.build_dir, Some(PathBuf::from("/src/build")));
        assert_eq!(paths.dll_paths, vec![PathBuf::from("/x")]);

        let candidates = paths.candidates("kernel32.dll");
        assert_eq!(
            candidates,
            vec![
                Candidate {
                    path: "/src/build/dlls/kernel32/kernel32.dll".into(),
                    origin: Origin::BuildTree,
                },
                Candidate {
                    path: "/src/build/programs/kernel32.dll/kernel32.dll".into(),
                    origin: Origin::BuildTree,
                },
                Candidate {
                    path: "/x/kernel32.dll".into(),
                    origin: Origin::SearchPath,
                },
            ]
        );
    }

    #[test]
    fn programs_strip_exe() {
        let paths = SearchPaths::from_dll_dir("/b/dlls/ntdll", "ntdll", None);
        let candidates = paths.candidates("notepad.exe");
        assert_eq!(candidates[0].path, PathBuf::from("/b/dlls/notepad.exe/notepad.exe"));
        assert_eq!(candidates[1].path, PathBuf::from("/b/programs/notepad/notepad.exe"));
    }

    #[test]
    fn empty_env_entries_are_skipped() {
        let paths = SearchPaths::from_dll_dir("/lib", "ntdll", Some(OsStr::new("::/y:")));
        assert_eq!(paths.dll_paths, vec![PathBuf::from("/lib"), PathBuf::from("/y")]);
    }

    #[test]
    fn unix_side_replaces_the_extension() {
        assert_eq!(
            unix_side_path(Path::new("/lib/kernel32.dll"), "kernel32.dll"),
            Some(PathBuf::from("/lib/kernel32.so"))
        );
        assert_eq!(
            unix_side_path(Path::new("/lib/kernel32.dll.so"), "kernel32.dll"),
            Some(PathBuf::from("/lib/kernel32.so"))
        );
        assert_eq!(unix_side_path(Path::new("/lib/noext"), "noext"), None);
    }
}
