use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tracing::debug;

/// One item produced while reading a location.
#[derive(Debug)]
pub enum RawItem {
    Document(Vec<u8>),
    Error(ReadError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("unsupported location type: {0}")]
    UnsupportedType(String),
    #[error("location target not found: {0}")]
    NotFound(String),
    #[error("reading {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {target}: {source}")]
    Yaml {
        target: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// Fetches raw documents for one location.
///
/// The outer `Err` means the location as a whole could not be read; errors
/// for individual documents travel inside the stream as [`RawItem::Error`].
#[async_trait::async_trait]
pub trait LocationReader: Send + Sync {
    async fn read(&self, kind: &str, target: &str) -> Result<BoxStream<'static, RawItem>, ReadError>;
}

/// Reader for `file` locations: a single YAML file or a directory of them.
#[derive(Debug, Clone, Default)]
pub struct FileReader;

impl FileReader {
    pub const TYPE: &'static str = "file";

    pub fn new() -> Self { Self }
}

#[async_trait::async_trait]
impl LocationReader for FileReader {
    async fn read(&self, kind: &str, target: &str) -> Result<BoxStream<'static, RawItem>, ReadError> {
        if kind != Self::TYPE {
            return Err(ReadError::UnsupportedType(kind.to_string()));
        }
        let path = PathBuf::from(target);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ReadError::NotFound(target.to_string())),
            Err(e) => return Err(ReadError::Io { target: target.to_string(), source: e }),
        };
        if meta.is_file() {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| ReadError::Io { target: target.to_string(), source: e })?;
            let items = yaml_documents(target, &bytes);
            debug!(target = %target, items = items.len(), "read descriptor file");
            return Ok(stream::iter(items).boxed());
        }

        let files = list_yaml_files(&path).await.map_err(|e| ReadError::Io { target: target.to_string(), source: e })?;
        debug!(target = %target, files = files.len(), "reading descriptor directory");
        // Files are opened lazily, one at a time, as the consumer pulls.
        let items = stream::iter(files)
            .then(|file| async move {
                let target = file.display().to_string();
                match tokio::fs::read(&file).await {
                    Ok(bytes) => yaml_documents(&target, &bytes),
                    Err(e) => vec![RawItem::Error(ReadError::Io { target, source: e })],
                }
            })
            .flat_map(stream::iter);
        Ok(items.boxed())
    }
}

async fn list_yaml_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let p = entry.path();
        let is_yaml = matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
        // Symlinks are resolved when read; a dangling one becomes an error item.
        let ft = entry.file_type().await?;
        if is_yaml && (ft.is_file() || ft.is_symlink()) {
            out.push(p);
        }
    }
    out.sort();
    Ok(out)
}

/// One item per YAML document in `bytes`, split by the YAML parser itself so
/// directives and `...` end markers are honored. Empty documents are dropped.
/// The first document that fails to deserialize becomes an error item and
/// ends the file, since the parser cannot resynchronize past it.
fn yaml_documents(target: &str, bytes: &[u8]) -> Vec<RawItem> {
    let mut items = Vec::new();
    for doc in serde_yaml::Deserializer::from_slice(bytes) {
        let value = match serde_yaml::Value::deserialize(doc) {
            Ok(serde_yaml::Value::Null) => continue,
            Ok(value) => value,
            Err(e) => {
                items.push(RawItem::Error(ReadError::Yaml { target: target.to_string(), source: e }));
                break;
            }
        };
        match serde_yaml::to_string(&value) {
            Ok(text) => items.push(RawItem::Document(text.into_bytes())),
            Err(e) => items.push(RawItem::Error(ReadError::Yaml { target: target.to_string(), source: e })),
        }
    }
    items
}

/// Dispatches to a reader by location type.
#[derive(Clone, Default)]
pub struct LocationReaders {
    readers: HashMap<String, Arc<dyn LocationReader>>,
}

impl LocationReaders {
    pub fn new() -> Self { Self::default() }

    /// Registry with the built-in readers.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register(FileReader::TYPE, Arc::new(FileReader::new()));
        r
    }

    pub fn register(&mut self, kind: &str, reader: Arc<dyn LocationReader>) {
        self.readers.insert(kind.to_string(), reader);
    }

    pub fn types(&self) -> Vec<&str> {
        let mut v: Vec<_> = self.readers.keys().map(String::as_str).collect();
        v.sort_unstable();
        v
    }
}

#[async_trait::async_trait]
impl LocationReader for LocationReaders {
    async fn read(&self, kind: &str, target: &str) -> Result<BoxStream<'static, RawItem>, ReadError> {
        match self.readers.get(kind) {
            Some(reader) => reader.read(kind, target).await,
            None => Err(ReadError::UnsupportedType(kind.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let p = std::env::temp_dir().join(format!("cairn-{}-{}", tag, nanos));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    async fn collect(s: BoxStream<'static, RawItem>) -> (Vec<String>, usize) {
        let items: Vec<RawItem> = s.collect().await;
        let mut docs = Vec::new();
        let mut errs = 0;
        for it in items {
            match it {
                RawItem::Document(d) => docs.push(String::from_utf8(d).unwrap()),
                RawItem::Error(_) => errs += 1,
            }
        }
        (docs, errs)
    }

    fn docs(items: Vec<RawItem>) -> Vec<String> {
        items
            .into_iter()
            .map(|it| match it {
                RawItem::Document(d) => String::from_utf8(d).unwrap(),
                RawItem::Error(e) => panic!("unexpected error item: {}", e),
            })
            .collect()
    }

    #[test]
    fn splits_multi_document_yaml() {
        let items = yaml_documents("t", b"# header\n---\na: 1\n---\n\n---\nb: 2\n...\n---\nc: 3\n");
        assert_eq!(docs(items), vec!["a: 1\n", "b: 2\n", "c: 3\n"]);
    }

    #[test]
    fn single_document_without_separator() {
        assert_eq!(docs(yaml_documents("t", b"a: 1\n")).len(), 1);
        assert!(yaml_documents("t", b"\n# only a comment\n").is_empty());
    }

    #[test]
    fn directive_does_not_become_a_document() {
        let items = yaml_documents("t", b"%YAML 1.2\n---\nkind: Component\nmetadata:\n  name: web\n");
        let docs = docs(items);
        assert_eq!(docs.len(), 1);
        assert!(docs[0].contains("name: web"));
    }

    #[test]
    fn invalid_utf8_is_an_error_item() {
        let items = yaml_documents("t", b"metadata:\n  description: caf\xff\xfe\n");
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], RawItem::Error(ReadError::Yaml { target, .. }) if target == "t"));
    }

    #[test]
    fn malformed_document_ends_the_file() {
        let items = yaml_documents("t", b"a: 1\n---\nb: [unclosed\n---\nc: 3\n");
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], RawItem::Document(d) if d.as_slice() == b"a: 1\n"));
        assert!(matches!(&items[1], RawItem::Error(ReadError::Yaml { .. })));
    }

    #[tokio::test]
    async fn reads_file_target() {
        let dir = temp_dir("file");
        let f = dir.join("catalog-info.yaml");
        std::fs::write(&f, "a: 1\n---\nb: 2\n").unwrap();
        let s = FileReader::new().read("file", f.to_str().unwrap()).await.unwrap();
        let (docs, errs) = collect(s).await;
        assert_eq!(docs.len(), 2);
        assert_eq!(errs, 0);
    }

    #[tokio::test]
    async fn reads_directory_sorted_yaml_only() {
        let dir = temp_dir("dir");
        std::fs::write(dir.join("b.yaml"), "b: 1\n").unwrap();
        std::fs::write(dir.join("a.yml"), "a: 1\n").unwrap();
        std::fs::write(dir.join("notes.txt"), "skip: me\n").unwrap();
        let s = FileReader::new().read("file", dir.to_str().unwrap()).await.unwrap();
        let (docs, _) = collect(s).await;
        assert_eq!(docs, vec!["a: 1\n", "b: 1\n"]);
    }

    #[tokio::test]
    async fn unreadable_file_in_directory_is_an_error_item() {
        let dir = temp_dir("unreadable");
        std::fs::write(dir.join("a.yaml"), "a: 1\n").unwrap();
        std::fs::write(dir.join("b.yaml"), b"bad: caf\xff\n").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.join("gone.yaml"), dir.join("c.yaml")).unwrap();
        std::fs::write(dir.join("d.yaml"), "d: 1\n").unwrap();
        let s = FileReader::new().read("file", dir.to_str().unwrap()).await.unwrap();
        let (docs, errs) = collect(s).await;
        assert_eq!(docs, vec!["a: 1\n", "d: 1\n"]);
        assert_eq!(errs, if cfg!(unix) { 2 } else { 1 });
    }

    #[tokio::test]
    async fn missing_target_is_location_error() {
        let dir = temp_dir("missing");
        let err = FileReader::new().read("file", dir.join("nope.yaml").to_str().unwrap()).await.err().unwrap();
        assert!(matches!(err, ReadError::NotFound(_)));
    }

    #[tokio::test]
    async fn registry_rejects_unknown_type() {
        let readers = LocationReaders::with_defaults();
        assert_eq!(readers.types(), vec!["file"]);
        let err = readers.read("github", "https://example.com/x.yaml").await.err().unwrap();
        assert!(matches!(err, ReadError::UnsupportedType(t) if t == "github"));
    }
}
