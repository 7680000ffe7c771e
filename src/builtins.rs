use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ExecError, Result};

/// Which "current directory" an invocation resolves against.
#[derive(Debug)]
pub enum DirContext<'a> {
    /// The process-wide working directory; `cd` goes through the OS.
    Global,
    /// A tab-owned directory; `cd` only rewrites this reference.
    Scoped(&'a mut PathBuf),
}

impl DirContext<'_> {
    /// Directory children should start in, or `None` to inherit the
    /// process-wide one.
    ///
    /// A scoped directory is made absolute first, so relative entries are
    /// never reinterpreted against the OS working directory at spawn time.
    pub fn spawn_dir(&mut self) -> Option<PathBuf> {
        match self {
            DirContext::Global => None,
            DirContext::Scoped(cwd) => {
                let absolute = absolutize(cwd);
                if absolute != **cwd {
                    **cwd = absolute.clone();
                }
                Some(absolute)
            }
        }
    }
}

/// Home directory from `HOME` (or `USERPROFILE`), falling back to `/`.
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Resolve a `cd` argument: empty or `~` is home, `~/x` is under home,
/// absolute paths are taken verbatim and anything else is joined to `base`.
pub fn resolve_target(arg: &str, base: &Path) -> PathBuf {
    if arg.is_empty() || arg == "~" {
        return home_dir();
    }
    if let Some(rest) = arg.strip_prefix("~/") {
        return home_dir().join(rest);
    }

    let path = Path::new(arg);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Run the `cd` builtin against `ctx`.
///
/// Scoped contexts are canonicalised and must name a directory; the global
/// context is handed to the OS, which performs the same checks.
pub fn change_dir(arg: &str, ctx: &mut DirContext<'_>) -> Result<()> {
    match ctx {
        DirContext::Global => {
            let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            let target = resolve_target(arg, &base);
            std::env::set_current_dir(&target).map_err(|e| {
                debug!(target = %target.display(), error = %e, "global cd failed");
                unreachable_dir(arg, &target)
            })?;
            debug!(cwd = %target.display(), "changed process working directory");
            Ok(())
        }
        DirContext::Scoped(cwd) => {
            let base = absolutize(cwd);
            let target = resolve_target(arg, &base);
            let resolved = target
                .canonicalize()
                .ok()
                .filter(|path| path.is_dir())
                .ok_or_else(|| unreachable_dir(arg, &target))?;
            debug!(cwd = %resolved.display(), "changed tab working directory");
            **cwd = resolved;
            Ok(())
        }
    }
}

fn unreachable_dir(arg: &str, target: &Path) -> ExecError {
    let path = if arg.is_empty() {
        target.display().to_string()
    } else {
        arg.to_string()
    };
    ExecError::Builtin { path }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        return std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    }
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_target_is_verbatim() {
        let target = resolve_target("/usr/bin", Path::new("/home/someone"));
        assert_eq!(target, PathBuf::from("/usr/bin"));
    }

    #[test]
    fn relative_target_joins_base() {
        let target = resolve_target("src/bin", Path::new("/work"));
        assert_eq!(target, PathBuf::from("/work/src/bin"));
    }

    #[test]
    fn tilde_and_empty_go_home() {
        assert_eq!(resolve_target("", Path::new("/x")), home_dir());
        assert_eq!(resolve_target("~", Path::new("/x")), home_dir());
        assert_eq!(resolve_target("~/docs", Path::new("/x")), home_dir().join("docs"));
    }

    #[test]
    fn scoped_cd_updates_only_the_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("inner")).unwrap();
        let before = std::env::current_dir().unwrap();

        let mut cwd = dir.path().to_path_buf();
        change_dir("inner", &mut DirContext::Scoped(&mut cwd)).unwrap();

        assert_eq!(cwd, dir.path().join("inner").canonicalize().unwrap());
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn scoped_cd_dotdot_is_normalised() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("inner")).unwrap();

        let mut cwd = dir.path().join("inner");
        change_dir("..", &mut DirContext::Scoped(&mut cwd)).unwrap();

        assert_eq!(cwd, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn scoped_cd_to_missing_dir_names_the_argument() {
        let dir = tempfile::tempdir().unwrap();
        let mut cwd = dir.path().to_path_buf();

        let err = change_dir("nope-xyz", &mut DirContext::Scoped(&mut cwd)).unwrap_err();

        assert_eq!(err.to_string(), "cd: no such file or directory: nope-xyz");
        assert_eq!(cwd, dir.path());
    }

    #[test]
    fn scoped_cd_to_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain.txt"), "x").unwrap();
        let mut cwd = dir.path().to_path_buf();

        assert!(change_dir("plain.txt", &mut DirContext::Scoped(&mut cwd)).is_err());
        assert_eq!(cwd, dir.path());
    }

    #[test]
    fn spawn_dir_is_absolute() {
        let mut cwd = PathBuf::from("relative/dir");
        let dir = DirContext::Scoped(&mut cwd).spawn_dir().unwrap();
        assert!(dir.is_absolute());
        assert!(cwd.is_absolute());
        assert!(DirContext::Global.spawn_dir().is_none());
    }
}
