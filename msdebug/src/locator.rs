//! Finding debug files (.DBG, .PDB) on disk and mapping them into memory.


use std::env;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, instrument};

use crate::error::Error;


pub const SYMBOL_PATH_VARIABLE: &str = "_NT_SYMBOL_PATH";
pub const ALT_SYMBOL_PATH_VARIABLE: &str = "_NT_ALT_SYMBOL_PATH";


/// The directories searched for debug files, in order of preference.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SearchPathConfig {
    pub alternate: Vec<PathBuf>,
    pub primary: Vec<PathBuf>,
    pub defaults: Vec<PathBuf>,
}
impl SearchPathConfig {
    pub fn new(alternate: Vec<PathBuf>, primary: Vec<PathBuf>, defaults: Vec<PathBuf>) -> Self {
        Self {
            alternate,
            primary,
            defaults,
        }
    }

    /// Builds a configuration from the values of the symbol path variables.
    ///
    /// The default directories are the current directory followed by the entries of `PATH`.
    pub fn from_vars(symbol_path: Option<&str>, alt_symbol_path: Option<&str>) -> Self {
        let mut defaults = vec![PathBuf::from(".")];
        if let Some(path) = env::var_os("PATH") {
            defaults.extend(env::split_paths(&path));
        }

        Self {
            alternate: alt_symbol_path.map(split_search_path).unwrap_or_default(),
            primary: symbol_path.map(split_search_path).unwrap_or_default(),
            defaults,
        }
    }

    /// Reads `_NT_SYMBOL_PATH` and `_NT_ALT_SYMBOL_PATH`.
    pub fn from_env() -> Self {
        let symbol_path = env::var(SYMBOL_PATH_VARIABLE).ok();
        let alt_symbol_path = env::var(ALT_SYMBOL_PATH_VARIABLE).ok();
        Self::from_vars(symbol_path.as_deref(), alt_symbol_path.as_deref())
    }

    /// All directories in search order.
    pub fn directories(&self) -> impl Iterator<Item = &Path> {
        self.alternate.iter()
            .chain(self.primary.iter())
            .chain(self.defaults.iter())
            .map(|p| p.as_path())
    }
}

/// Splits a `;`-separated symbol path, dropping empty and symbol-server elements.
pub fn split_search_path(path: &str) -> Vec<PathBuf> {
    path.split(';')
        .map(|element| element.trim())
        .filter(|element| !element.is_empty())
        .filter(|element| {
            let lower = element.to_ascii_lowercase();
            !lower.starts_with("srv*") && !lower.starts_with("cache*")
        })
        .map(PathBuf::from)
        .collect()
}


/// A read-only memory mapping of a debug file; unmapped when dropped.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    map: Mmap,
}
impl MappedFile {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            // nothing to map
            return Err(Error::NotFound { name: path.display().to_string() });
        }
        let map = unsafe { Mmap::map(&file) }?;
        Ok(Self {
            path: path.to_owned(),
            map,
        })
    }

    pub fn path(&self) -> &Path { &self.path }
    pub fn bytes(&self) -> &[u8] { &self.map }
}
impl Deref for MappedFile {
    type Target = [u8];
    fn deref(&self) -> &Self::Target { &self.map }
}


/// The file name without any directory components; both `\` and `/` separate directories.
pub fn bare_file_name(name: &str) -> &str {
    match name.rfind(['\\', '/']) {
        Some(index) => &name[index+1..],
        None => name,
    }
}

/// The name of the .DBG file belonging to an image: the image's bare name with its extension
/// replaced.
pub fn dbg_file_name(image_name: &str) -> String {
    let bare = bare_file_name(image_name);
    let stem = match bare.rfind('.') {
        Some(index) => &bare[..index],
        None => bare,
    };
    format!("{}.dbg", stem)
}

/// Finds the debug file `name` and maps it.
///
/// `explicit_path` is tried first if it exists. Then every search directory is combined with the
/// bare file name, and finally `name` itself is tried.
#[instrument(skip(config))]
pub fn locate_and_map(name: &str, explicit_path: Option<&Path>, config: &SearchPathConfig) -> Result<MappedFile, Error> {
    let candidate = locate(name, explicit_path, config)
        .ok_or_else(|| Error::NotFound { name: name.to_owned() })?;
    debug!("found {:?} at {}", name, candidate.display());
    MappedFile::open(&candidate)
}

/// Finds the debug file `name` without mapping it.
pub fn locate(name: &str, explicit_path: Option<&Path>, config: &SearchPathConfig) -> Option<PathBuf> {
    if let Some(explicit) = explicit_path {
        if is_mappable(explicit) {
            return Some(explicit.to_owned());
        }
    }

    let bare = bare_file_name(name);
    if !bare.is_empty() {
        for directory in config.directories() {
            let candidate = directory.join(bare);
            if is_mappable(&candidate) {
                return Some(candidate);
            }
            debug!("{} does not exist", candidate.display());
        }
    }

    let verbatim = PathBuf::from(name);
    if is_mappable(&verbatim) {
        Some(verbatim)
    } else {
        None
    }
}

/// A non-empty regular file; empty files cannot be mapped.
fn is_mappable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}


#[cfg(test)]
mod tests {
    use super::{bare_file_name, dbg_file_name, locate_and_map, split_search_path, SearchPathConfig};
    use crate::error::Error;
    use std::fs;
    use std::path::PathBuf;

    #[test]
    fn test_split_search_path() {
        let dirs = split_search_path(r"C:\symbols;;srv*C:\cache*http://example.invalid;CACHE*D:\c; D:\more ");
        assert_eq!(dirs, vec![PathBuf::from(r"C:\symbols"), PathBuf::from(r"D:\more")]);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(bare_file_name(r"C:\build\release\app.pdb"), "app.pdb");
        assert_eq!(bare_file_name("out/lib.pdb"), "lib.pdb");
        assert_eq!(bare_file_name("plain.pdb"), "plain.pdb");
        assert_eq!(dbg_file_name(r"C:\WINNT\system32\KERNEL32.DLL"), "KERNEL32.dbg");
        assert_eq!(dbg_file_name("noext"), "noext.dbg");
    }

    #[test]
    fn test_alternate_path_wins() {
        let alternate = tempfile::tempdir().unwrap();
        let primary = tempfile::tempdir().unwrap();
        fs::write(alternate.path().join("app.pdb"), b"alternate").unwrap();
        fs::write(primary.path().join("app.pdb"), b"primary").unwrap();

        let config = SearchPathConfig::new(
            vec![alternate.path().to_owned()],
            vec![primary.path().to_owned()],
            Vec::new(),
        );
        let mapped = locate_and_map(r"D:\build\app.pdb", None, &config).expect("not found");
        assert_eq!(mapped.bytes(), b"alternate");
        assert_eq!(mapped.path(), alternate.path().join("app.pdb"));
    }

    #[test]
    fn test_explicit_path_and_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.dbg");
        fs::write(&explicit, b"explicit").unwrap();
        let primary_only = dir.path().join("other.dbg");
        fs::write(&primary_only, b"verbatim").unwrap();

        let config = SearchPathConfig::default();
        let mapped = locate_and_map("whatever.dbg", Some(&explicit), &config).expect("not found");
        assert_eq!(&*mapped, b"explicit");

        // nonexistent explicit path falls through to the verbatim name
        let missing = dir.path().join("missing.dbg");
        let name = primary_only.to_str().unwrap();
        let mapped = locate_and_map(name, Some(&missing), &config).expect("not found");
        assert_eq!(&*mapped, b"verbatim");
    }

    #[test]
    fn test_empty_file_does_not_stop_search() {
        let alternate = tempfile::tempdir().unwrap();
        let primary = tempfile::tempdir().unwrap();
        fs::write(alternate.path().join("app.dbg"), b"").unwrap();
        fs::write(primary.path().join("app.dbg"), b"primary").unwrap();

        let config = SearchPathConfig::new(
            vec![alternate.path().to_owned()],
            vec![primary.path().to_owned()],
            Vec::new(),
        );
        let mapped = locate_and_map("app.dbg", None, &config).expect("not found");
        assert_eq!(mapped.bytes(), b"primary");
        assert_eq!(mapped.path(), primary.path().join("app.dbg"));
    }

    #[test]
    fn test_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("empty.pdb"), b"").unwrap();
        let config = SearchPathConfig::new(Vec::new(), vec![dir.path().to_owned()], Vec::new());

        assert!(matches!(locate_and_map("absent.pdb", None, &config), Err(Error::NotFound { .. })));
        assert!(matches!(locate_and_map("empty.pdb", None, &config), Err(Error::NotFound { .. })));
    }
}
