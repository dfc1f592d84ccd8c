//! Optional on-disk copies of rendered pages, for serving by a static host

use crate::config::PersistConfig;
use crate::encoder::{EncodedVariants, Encoding};
use hyper::Uri;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("unable to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid fetch url {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone)]
pub struct PersistenceWriter {
    dir: PathBuf,
    file_ext: String,
    mode: Option<u32>,
}

impl PersistenceWriter {
    pub fn new(dir: impl Into<PathBuf>, file_ext: impl Into<String>, mode: Option<u32>) -> Self {
        Self {
            dir: dir.into(),
            file_ext: file_ext.into(),
            mode,
        }
    }

    /// Build a writer when a target directory is configured
    pub fn from_config(config: &PersistConfig) -> Option<Self> {
        config
            .dir
            .as_ref()
            .map(|dir| Self::new(dir, config.file_ext.clone(), config.parsed_mode()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Base file path (without extension) for a fetch URL.
    ///
    /// The root maps to `index`; so does any path ending in `/`.
    /// `.` and `..` segments are dropped so nothing lands outside `dir`.
    pub fn base_path(&self, fetch_url: &str) -> Result<PathBuf, PersistError> {
        let uri: Uri = fetch_url
            .parse()
            .map_err(|_| PersistError::InvalidUrl(fetch_url.to_string()))?;

        let mut path = self.dir.clone();
        let mut segments: Vec<&str> = uri
            .path()
            .split('/')
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
            .collect();
        if uri.path().ends_with('/') || segments.is_empty() {
            segments.push("index");
        }
        for segment in segments {
            path.push(segment);
        }
        Ok(path)
    }

    /// Write `<base><ext>`, `<base><ext>.gz` and `<base><ext>.br`.
    ///
    /// A variant missing from the render is skipped.
    pub async fn write(&self, fetch_url: &str, variants: &EncodedVariants) -> Result<(), PersistError> {
        let base = self.base_path(fetch_url)?;
        let plain = PathBuf::from(format!("{}{}", base.display(), self.file_ext));

        if let Some(parent) = plain.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PersistError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        for (encoding, suffix) in [
            (Encoding::Identity, ""),
            (Encoding::Gzip, ".gz"),
            (Encoding::Brotli, ".br"),
        ] {
            let path = PathBuf::from(format!("{}{}", plain.display(), suffix));
            match variants.get(encoding) {
                Some(bytes) => self.write_file(&path, bytes).await?,
                None => warn!(path = %path.display(), encoding = encoding.as_header_value(), "Variant missing, not persisted"),
            }
        }

        info!(url = %fetch_url, path = %plain.display(), "Persisted rendered page");
        Ok(())
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
        let io_err = |source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        };

        // Earlier copies may be read-only
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Replacing persisted file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        if let Some(mode) = self.mode {
            options.mode(mode);
        }

        let mut file = options.open(path).await.map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Bytes;
    use tempfile::TempDir;

    fn variants(brotli: bool) -> EncodedVariants {
        EncodedVariants {
            identity: Bytes::from_static(b"<html>hi</html>"),
            gzip: Some(Bytes::from_static(b"gz")),
            brotli: brotli.then(|| Bytes::from_static(b"br")),
        }
    }

    #[test]
    fn test_base_path_mapping() {
        let writer = PersistenceWriter::new("/srv/out", ".html", None);

        assert_eq!(
            writer.base_path("http://origin/?headless=true").unwrap(),
            PathBuf::from("/srv/out/index")
        );
        assert_eq!(
            writer.base_path("http://origin/blog/post?headless=true").unwrap(),
            PathBuf::from("/srv/out/blog/post")
        );
        assert_eq!(
            writer.base_path("http://origin/blog/").unwrap(),
            PathBuf::from("/srv/out/blog/index")
        );
        assert_eq!(
            writer.base_path("http://origin/../../etc/passwd").unwrap(),
            PathBuf::from("/srv/out/etc/passwd")
        );
    }

    #[tokio::test]
    async fn test_writes_three_files() {
        let dir = TempDir::new().unwrap();
        let writer = PersistenceWriter::new(dir.path(), ".html", None);

        writer
            .write("http://origin/docs/intro?headless=true", &variants(true))
            .await
            .unwrap();

        let base = dir.path().join("docs");
        assert_eq!(std::fs::read(base.join("intro.html")).unwrap(), b"<html>hi</html>");
        assert_eq!(std::fs::read(base.join("intro.html.gz")).unwrap(), b"gz");
        assert_eq!(std::fs::read(base.join("intro.html.br")).unwrap(), b"br");
    }

    #[tokio::test]
    async fn test_missing_variant_skipped() {
        let dir = TempDir::new().unwrap();
        let writer = PersistenceWriter::new(dir.path(), ".html", None);

        writer.write("http://origin/", &variants(false)).await.unwrap();

        assert!(dir.path().join("index.html").exists());
        assert!(dir.path().join("index.html.gz").exists());
        assert!(!dir.path().join("index.html.br").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mode_applied_and_rewrite_succeeds() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let writer = PersistenceWriter::new(dir.path(), ".html", Some(0o444));

        writer.write("http://origin/a", &variants(true)).await.unwrap();
        let mode = std::fs::metadata(dir.path().join("a.html")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);

        writer.write("http://origin/a", &variants(true)).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("a.html")).unwrap(), b"<html>hi</html>");
    }

    #[test]
    fn test_from_config() {
        let config = PersistConfig::default();
        assert!(PersistenceWriter::from_config(&config).is_none());

        let config = PersistConfig {
            dir: Some("/srv/out".to_string()),
            ..PersistConfig::default()
        };
        let writer = PersistenceWriter::from_config(&config).unwrap();
        assert_eq!(writer.dir(), Path::new("/srv/out"));
    }
}
