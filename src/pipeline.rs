//! Translation pipeline: fetch disassembly for every class a source
//! provides, parse and normalize it, and read or write the resulting
//! manifest as JSON.
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, ParseFormatError, Result};
use crate::ir::ClassIR;
use crate::jvm::JavapParser;
use crate::normalize::normalize_class;

/// Extension of disassembly files read by `DirectorySource`.
pub const LISTING_EXTENSION: &str = "javap";

/// Provider of class names and their disassembly text.
pub trait ClassSource {
    fn list_classes(&self) -> Result<Vec<String>>;

    fn disassemble(&self, class: &str) -> Result<String>;
}

/// In-memory listings, keyed by class name.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    listings: BTreeMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, class: &str, listing: impl Into<String>) -> Self {
        self.insert(class, listing);
        self
    }

    pub fn insert(&mut self, class: &str, listing: impl Into<String>) {
        self.listings.insert(class.to_string(), listing.into());
    }
}

impl ClassSource for MemorySource {
    fn list_classes(&self) -> Result<Vec<String>> {
        Ok(self.listings.keys().cloned().collect())
    }

    fn disassemble(&self, class: &str) -> Result<String> {
        self.listings.get(class).cloned().ok_or_else(|| Error::Source {
            class: class.to_string(),
            reason: "no listing registered".to_string(),
        })
    }
}

/// Directory of `<Class>.javap` files, one listing per class.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn listing_path(&self, class: &str) -> PathBuf {
        self.root.join(format!("{class}.{LISTING_EXTENSION}"))
    }
}

impl ClassSource for DirectorySource {
    fn list_classes(&self) -> Result<Vec<String>> {
        let mut classes = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LISTING_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                classes.push(stem.to_string());
            }
        }
        classes.sort();
        debug!(root = %self.root.display(), classes = classes.len(), "listed classes");
        Ok(classes)
    }

    fn disassemble(&self, class: &str) -> Result<String> {
        let path = self.listing_path(class);
        fs::read_to_string(&path).map_err(|err| Error::Source {
            class: class.to_string(),
            reason: format!("{}: {err}", path.display()),
        })
    }
}

/// Parse and normalize one listing.
pub fn translate_listing(text: &str) -> std::result::Result<ClassIR, ParseFormatError> {
    normalize_class(JavapParser::parse(text)?)
}

/// Translate every class of `source`. The first class that fails aborts
/// the run and no IR is returned.
pub fn translate(source: &impl ClassSource) -> Result<Vec<ClassIR>> {
    let mut classes = Vec::new();
    for class in source.list_classes()? {
        let text = source.disassemble(&class)?;
        let ir = translate_listing(&text).map_err(|source| Error::Translate {
            class: class.clone(),
            source,
        })?;
        debug!(class = %class, methods = ir.methods.len(), "translated class");
        classes.push(ir);
    }
    info!(classes = classes.len(), "translation finished");
    Ok(classes)
}

/// Write normalized classes as a JSON manifest.
pub fn emit_manifest(classes: &[ClassIR], writer: impl Write) -> Result<()> {
    serde_json::to_writer_pretty(writer, classes)?;
    Ok(())
}

pub fn read_manifest(reader: impl Read) -> Result<Vec<ClassIR>> {
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
public class Good
{
  public static int one();
    descriptor: ()I
    flags: (0x0009) ACC_PUBLIC, ACC_STATIC
    Code:
      stack=1, locals=0, args_size=0
         0: iconst_1
         1: ireturn
}
"#;

    const BAD_BRANCH: &str = r#"
public class Bad
{
  public static int jump();
    descriptor: ()I
    flags: (0x0009) ACC_PUBLIC, ACC_STATIC
    Code:
      stack=1, locals=0, args_size=0
         0: goto          2
         3: iconst_1
         4: ireturn
}
"#;

    #[test]
    fn translates_every_class() {
        let source = MemorySource::new()
            .with_class("Good", GOOD)
            .with_class("Other", GOOD.replace("class Good", "class Other"));
        let classes = translate(&source).unwrap();
        let names: Vec<&str> = classes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Good", "Other"]);
    }

    #[test]
    fn failing_class_aborts_the_run() {
        let source = MemorySource::new()
            .with_class("Bad", BAD_BRANCH)
            .with_class("Good", GOOD);
        let err = translate(&source).unwrap_err();
        match err {
            Error::Translate { class, source } => {
                assert_eq!(class, "Bad");
                assert!(matches!(source, ParseFormatError::UnresolvedBranch { target: 2, .. }));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn missing_listing_is_a_source_error() {
        let err = MemorySource::new().disassemble("Nope").unwrap_err();
        assert!(matches!(err, Error::Source { .. }));
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let classes = translate(&MemorySource::new().with_class("Good", GOOD)).unwrap();
        let mut buffer = Vec::new();
        emit_manifest(&classes, &mut buffer).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.contains(r#""superName": "java/lang/Object""#));
        assert!(text.contains(r#""opcode": "ICONST""#));
        let back = read_manifest(buffer.as_slice()).unwrap();
        assert_eq!(back, classes);
    }

    #[test]
    fn reads_listings_from_a_directory() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("support");
        let source = DirectorySource::new(&root);
        let classes = source.list_classes().unwrap();
        assert!(classes.contains(&"Sample".to_string()));
        assert!(matches!(
            source.disassemble("Missing"),
            Err(Error::Source { .. })
        ));
    }
}
