//! LFS pointer file format.
//!
//! LFS pointer files are small text files that replace large files in the Git repository.
//! They contain metadata about the actual file stored in LFS.

use std::io::Read;

use crate::{Error, Oid, Result};

/// Pointer version line written by current git-lfs.
pub const LFS_SPEC_V1: &str = "https://git-lfs.github.com/spec/v1";

/// Pre-release version URL still found in old repositories.
pub const HAWSER_SPEC_V1: &str = "https://hawser.github.com/spec/v1";

/// Maximum size of an LFS pointer file (1KB).
pub const MAX_POINTER_SIZE: usize = 1024;

/// An LFS pointer representing a file stored in LFS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    /// The version URL the pointer was written against.
    version: String,
    /// `ext-<n>-<name>` lines, in the order they appeared.
    extensions: Vec<Extension>,
    /// The SHA256 hash of the file content.
    oid: Oid,
    /// The size of the file in bytes.
    size: u64,
}

impl Pointer {
    /// Create a new v1 pointer with the given OID and size.
    pub fn new(oid: Oid, size: u64) -> Self {
        Pointer {
            version: LFS_SPEC_V1.to_string(),
            extensions: Vec::new(),
            oid,
            size,
        }
    }

    /// Create a pointer from file content.
    ///
    /// This computes the SHA256 hash of the content.
    pub fn from_content(content: &[u8]) -> Self {
        Pointer::new(Oid::from_content(content), content.len() as u64)
    }

    /// Create a pointer by streaming content from a reader.
    ///
    /// This computes the SHA256 hash while reading, avoiding loading
    /// the entire content into memory at once.
    pub fn from_reader<R: Read>(reader: R) -> std::io::Result<Self> {
        let (oid, size) = Oid::from_reader(reader)?;
        Ok(Pointer::new(oid, size))
    }

    /// Parse a pointer from its text representation.
    ///
    /// Extension lines are kept so that re-encoding reproduces them. Unknown
    /// keys and upper-case oids are rejected.
    pub fn parse(content: &[u8]) -> Result<Self> {
        if content.len() > MAX_POINTER_SIZE {
            return Err(Error::MalformedPointer(
                "content too large to be a pointer".into(),
            ));
        }

        let text = std::str::from_utf8(content)
            .map_err(|_| Error::MalformedPointer("invalid UTF-8".into()))?;

        let mut version: Option<String> = None;
        let mut extensions: Vec<Extension> = Vec::new();
        let mut oid: Option<Oid> = None;
        let mut size: Option<u64> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(ver) = line.strip_prefix("version ") {
                let ver = ver.trim();
                if ver != LFS_SPEC_V1 && ver != HAWSER_SPEC_V1 {
                    return Err(Error::UnsupportedPointerVersion(ver.to_string()));
                }
                version = Some(ver.to_string());
            } else if let Some(rest) = line.strip_prefix("ext-") {
                let extension = Extension::parse(rest)?;
                if extensions.iter().any(|e| e.priority == extension.priority) {
                    return Err(Error::MalformedPointer(format!(
                        "duplicate extension priority {}",
                        extension.priority
                    )));
                }
                extensions.push(extension);
            } else if let Some(rest) = line.strip_prefix("oid ") {
                oid = Some(parse_sha256(rest.trim())?);
            } else if let Some(rest) = line.strip_prefix("size ") {
                let rest = rest.trim();
                if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::MalformedPointer(format!("invalid size: {}", rest)));
                }
                size = Some(
                    rest.parse()
                        .map_err(|_| Error::MalformedPointer("size out of range".into()))?,
                );
            } else {
                return Err(Error::MalformedPointer(format!("unexpected line: {}", line)));
            }
        }

        let version = version.ok_or_else(|| Error::MalformedPointer("missing version".into()))?;

        match (oid, size) {
            (Some(oid), Some(size)) => Ok(Pointer {
                version,
                extensions,
                oid,
                size,
            }),
            (None, _) => Err(Error::MalformedPointer("missing oid".into())),
            (_, None) => Err(Error::MalformedPointer("missing size".into())),
        }
    }

    /// Cheap test used while scanning trees.
    ///
    /// Accepts any version line so that pointers in unknown versions are
    /// reported instead of silently ignored.
    pub fn looks_like_pointer(content: &[u8]) -> bool {
        content.len() <= MAX_POINTER_SIZE
            && content.starts_with(b"version ")
            && content.windows(5).any(|w| w == b"\noid ")
    }

    /// Get the version URL.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get the OID of this pointer.
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Get the size of the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Same pointer, different content identity.
    pub fn with_oid(&self, oid: Oid) -> Self {
        Pointer {
            version: self.version.clone(),
            extensions: self.extensions.clone(),
            oid,
            size: self.size,
        }
    }

    /// Encode the pointer to its text representation.
    pub fn encode(&self) -> String {
        let mut out = format!("version {}\n", self.version);
        for extension in &self.extensions {
            out.push_str(&format!(
                "ext-{}-{} sha256:{}\n",
                extension.priority,
                extension.name,
                extension.oid.to_hex()
            ));
        }
        out.push_str(&format!("oid sha256:{}\nsize {}\n", self.oid.to_hex(), self.size));
        out
    }

    /// Encode the pointer to bytes.
    pub fn encode_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }
}

/// A pointer extension line: `ext-<priority>-<name> sha256:<oid>`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Extension {
    priority: u8,
    name: String,
    oid: Oid,
}

impl Extension {
    /// Parse what follows `ext-` on the line.
    fn parse(rest: &str) -> Result<Self> {
        let invalid = || Error::MalformedPointer(format!("invalid extension: ext-{}", rest));
        let (key, value) = rest.split_once(' ').ok_or_else(invalid)?;
        let (priority, name) = key.split_once('-').ok_or_else(invalid)?;
        if priority.len() != 1 || name.is_empty() {
            return Err(invalid());
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid());
        }
        Ok(Extension {
            priority: priority.parse().map_err(|_| invalid())?,
            name: name.to_string(),
            oid: parse_sha256(value.trim())?,
        })
    }
}

/// `sha256:<64 lower-case hex>`, as git-lfs writes it.
fn parse_sha256(value: &str) -> Result<Oid> {
    let hex = value.strip_prefix("sha256:").ok_or_else(|| {
        Error::MalformedPointer(format!("unsupported oid algorithm: {}", value))
    })?;
    if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(Error::MalformedPointer(format!("oid is not lower-case hex: {}", hex)));
    }
    Oid::from_hex(hex).map_err(|e| Error::MalformedPointer(e.to_string()))
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"version https://git-lfs.github.com/spec/v1\n\
        oid sha256:4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393\n\
        size 12345\n";

    #[test]
    fn test_pointer_from_content() {
        let content = b"Hello, World!";
        let pointer = Pointer::from_content(content);
        assert_eq!(pointer.size(), 13);
        assert_eq!(pointer.version(), LFS_SPEC_V1);
        assert_eq!(
            pointer.oid().to_hex(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_pointer_parse_valid() {
        let pointer = Pointer::parse(SAMPLE).unwrap();
        assert_eq!(pointer.size(), 12345);
        assert_eq!(
            pointer.oid().to_hex(),
            "4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393"
        );
    }

    #[test]
    fn test_pointer_reencodes_byte_identically() {
        let pointer = Pointer::parse(SAMPLE).unwrap();
        assert_eq!(pointer.encode_bytes(), SAMPLE);
    }

    #[test]
    fn test_hawser_version_survives_roundtrip() {
        let text = b"version https://hawser.github.com/spec/v1\n\
            oid sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\n\
            size 0\n";
        let pointer = Pointer::parse(text).unwrap();
        assert_eq!(pointer.version(), HAWSER_SPEC_V1);
        assert_eq!(pointer.encode_bytes(), text);
    }

    #[test]
    fn test_pointer_parse_malformed() {
        // Not a pointer
        assert!(matches!(
            Pointer::parse(b"Hello, World!"),
            Err(Error::MalformedPointer(_))
        ));

        // Missing oid
        assert!(matches!(
            Pointer::parse(b"version https://git-lfs.github.com/spec/v1\nsize 123\n"),
            Err(Error::MalformedPointer(_))
        ));

        // Short oid
        assert!(matches!(
            Pointer::parse(b"version https://git-lfs.github.com/spec/v1\noid sha256:abc\nsize 1\n"),
            Err(Error::MalformedPointer(_))
        ));

        // Negative and signed sizes
        let oid = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        for size in ["-1", "+5", "12a", ""] {
            let text = format!("version {}\noid sha256:{}\nsize {}\n", LFS_SPEC_V1, oid, size);
            assert!(
                matches!(Pointer::parse(text.as_bytes()), Err(Error::MalformedPointer(_))),
                "size {:?} should be rejected",
                size
            );
        }

        // Other hash algorithms
        let text = format!("version {}\noid sha1:{}\nsize 1\n", LFS_SPEC_V1, oid);
        assert!(matches!(
            Pointer::parse(text.as_bytes()),
            Err(Error::MalformedPointer(_))
        ));
    }

    #[test]
    fn test_pointer_parse_unsupported_version() {
        let text = b"version https://git-lfs.github.com/spec/v2\n\
            oid sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\n\
            size 1\n";
        assert!(matches!(
            Pointer::parse(text),
            Err(Error::UnsupportedPointerVersion(v)) if v.ends_with("/v2")
        ));
    }

    #[test]
    fn test_extensions_survive_roundtrip() {
        let text = b"version https://git-lfs.github.com/spec/v1\n\
            ext-0-foo sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\n\
            ext-1-bar sha256:4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393\n\
            oid sha256:dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f\n\
            size 13\n";
        let pointer = Pointer::parse(text).unwrap();
        assert_eq!(pointer.encode_bytes(), text);

        let moved = pointer.with_oid(Oid::from_content(b"other"));
        assert!(moved.encode().contains("\next-0-foo sha256:e3b0"));
        assert!(moved.encode().contains("\next-1-bar sha256:4d7a"));
    }

    #[test]
    fn test_lines_that_would_not_reencode_are_rejected() {
        let oid = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";

        let upper = format!(
            "version {}\noid sha256:{}\nsize 13\n",
            LFS_SPEC_V1,
            oid.to_uppercase()
        );
        assert!(matches!(
            Pointer::parse(upper.as_bytes()),
            Err(Error::MalformedPointer(_))
        ));

        let unknown_key = format!("version {}\noid sha256:{}\nsize 13\nmtime 5\n", LFS_SPEC_V1, oid);
        assert!(matches!(
            Pointer::parse(unknown_key.as_bytes()),
            Err(Error::MalformedPointer(_))
        ));

        for ext in ["ext-x-foo sha256:", "ext-0- sha256:", "ext-0-foo md5:", "ext-00-foo sha256:"] {
            let text = format!(
                "version {}\n{}{}\noid sha256:{}\nsize 13\n",
                LFS_SPEC_V1, ext, oid, oid
            );
            assert!(
                matches!(Pointer::parse(text.as_bytes()), Err(Error::MalformedPointer(_))),
                "{:?} should be rejected",
                ext
            );
        }

        let duplicate = format!(
            "version {0}\next-0-a sha256:{1}\next-0-b sha256:{1}\noid sha256:{1}\nsize 13\n",
            LFS_SPEC_V1, oid
        );
        assert!(matches!(
            Pointer::parse(duplicate.as_bytes()),
            Err(Error::MalformedPointer(_))
        ));
    }

    #[test]
    fn test_looks_like_pointer_accepts_unknown_versions() {
        assert!(Pointer::looks_like_pointer(SAMPLE));
        assert!(Pointer::looks_like_pointer(
            b"version https://example.com/spec/v9\noid sha256:00\nsize 1\n"
        ));
        assert!(!Pointer::looks_like_pointer(b"version 1.2.3\n"));
    }
}
