use std::fs;

use super::*;

/// Filesystem backing store.
///
/// Paths are resolved by joining them onto the store root.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    #[inline]
    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl BackingStore for FsStore {
    /// A path exists when it names a regular file that can be opened for reading.
    fn exists(&self, path: &Path) -> bool {
        fs::File::open(self.resolve(path))
            .and_then(|file| file.metadata())
            .is_ok_and(|metadata| metadata.is_file())
    }

    fn read(&self, path: &Path) -> io::Result<Bytes> {
        let path = self.resolve(path);

        tracing::trace!("Reading from local storage: `{}`", path.display());

        fs::read(path).map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let store = FsStore::new("assets");

        assert!(store.resolve(Path::new("textures/tex.png")).iter().eq(["assets", "textures", "tex.png"]));
        assert_eq!(store.root(), Path::new("assets"));
    }

    #[test]
    fn test_exists() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tex.png"), b"png").unwrap();
        fs::create_dir(dir.path().join("textures")).unwrap();

        let store = FsStore::new(dir.path());

        assert!(store.exists(Path::new("tex.png")));
        assert!(!store.exists(Path::new("missing.png")));
        assert!(!store.exists(Path::new("textures")));
    }

    #[test]
    fn test_read() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shader.vert"), b"void main() {}").unwrap();

        let store = FsStore::new(dir.path());

        assert_eq!(store.read(Path::new("shader.vert")).unwrap(), &b"void main() {}"[..]);
        assert_eq!(store.read(Path::new("missing.vert")).unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
