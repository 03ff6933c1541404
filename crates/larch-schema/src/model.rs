//! The typed schema blob model.
//!
//! Every schema kind decodes from the same JSON "superset" shape keyed by
//! `camliType`. Here that is a tagged enum with the common header lifted
//! out: `camliVersion`, the signature pair, and the optional unix
//! metadata live on [`Schema`], everything kind-specific lives in
//! [`SchemaKind`].
//!
//! Names that may not be valid UTF-8 (`fileName`/`fileNameBytes`,
//! `symlinkTarget`/`symlinkTargetBytes`) are a single [`MaybeUtf8`] value
//! with a codec that accepts either JSON representation and writes
//! whichever fits.

use std::borrow::Cow;
use std::fmt;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use larch_core::BlobRef;
use larch_core::Error;
use larch_core::Result;

/// Current schema version written by all constructors.
pub const SCHEMA_VERSION: u32 = 1;

/// Share auth type granting access to whoever holds the share blob ref.
pub const SHARE_HAVE_REF: &str = "haveref";

// ============================================================================
// Byte strings with dual JSON representation
// ============================================================================

/// A byte string that is usually, but not necessarily, valid UTF-8.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaybeUtf8(Vec<u8>);

impl MaybeUtf8 {
    pub fn new(bytes: Vec<u8>) -> MaybeUtf8 {
        MaybeUtf8(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The value as a str, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The final path component, for constructors fed whole paths.
    fn base_name(&self) -> MaybeUtf8 {
        match self.0.iter().rposition(|&b| b == b'/') {
            Some(slash) => MaybeUtf8(self.0[slash + 1..].to_vec()),
            None => self.clone(),
        }
    }
}

impl From<&str> for MaybeUtf8 {
    fn from(s: &str) -> MaybeUtf8 {
        MaybeUtf8(s.as_bytes().to_vec())
    }
}

impl From<String> for MaybeUtf8 {
    fn from(s: String) -> MaybeUtf8 {
        MaybeUtf8(s.into_bytes())
    }
}

impl From<Vec<u8>> for MaybeUtf8 {
    fn from(bytes: Vec<u8>) -> MaybeUtf8 {
        MaybeUtf8(bytes)
    }
}

impl fmt::Display for MaybeUtf8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

/// One element of a `*Bytes` mixed array: a UTF-8 substring or a raw byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum MixedPart {
    Text(String),
    Byte(u8),
}

fn mixed_to_bytes(parts: Vec<MixedPart>) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        match part {
            MixedPart::Text(s) => out.extend_from_slice(s.as_bytes()),
            MixedPart::Byte(b) => out.push(b),
        }
    }
    out
}

fn bytes_to_mixed(bytes: &[u8]) -> Vec<MixedPart> {
    let mut out = Vec::new();
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                if !s.is_empty() {
                    out.push(MixedPart::Text(s.to_string()));
                }
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                if valid > 0 {
                    out.push(MixedPart::Text(
                        String::from_utf8_lossy(&rest[..valid]).into_owned(),
                    ));
                }
                out.push(MixedPart::Byte(rest[valid]));
                rest = &rest[valid + 1..];
            }
        }
    }
}

macro_rules! dual_name_codec {
    ($name:ident, $raw:ident, $raw_str:literal, $utf8_key:literal, $bytes_key:literal) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(from = $raw_str, into = $raw_str)]
        pub struct $name(pub MaybeUtf8);

        #[derive(Serialize, Deserialize, Default)]
        struct $raw {
            #[serde(rename = $utf8_key, default, skip_serializing_if = "Option::is_none")]
            utf8: Option<String>,
            #[serde(rename = $bytes_key, default, skip_serializing_if = "Option::is_none")]
            bytes: Option<Vec<MixedPart>>,
        }

        impl From<$raw> for $name {
            fn from(raw: $raw) -> $name {
                // The UTF-8 field wins when both are present.
                match (raw.utf8, raw.bytes) {
                    (Some(s), _) if !s.is_empty() => $name(MaybeUtf8::from(s)),
                    (_, Some(parts)) => $name(MaybeUtf8::new(mixed_to_bytes(parts))),
                    _ => $name::default(),
                }
            }
        }

        impl From<$name> for $raw {
            fn from(name: $name) -> $raw {
                if name.0.is_empty() {
                    return $raw::default();
                }
                match name.0.as_str() {
                    Some(s) => $raw {
                        utf8: Some(s.to_string()),
                        bytes: None,
                    },
                    None => $raw {
                        utf8: None,
                        bytes: Some(bytes_to_mixed(name.0.as_bytes())),
                    },
                }
            }
        }

    };
}

dual_name_codec!(FileName, RawFileName, "RawFileName", "fileName", "fileNameBytes");
dual_name_codec!(
    SymlinkTarget,
    RawSymlinkTarget,
    "RawSymlinkTarget",
    "symlinkTarget",
    "symlinkTargetBytes"
);

// ============================================================================
// Common header and kinds
// ============================================================================

/// Optional unix metadata carried by file, directory, and symlink blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnixMeta {
    #[serde(rename = "unixPermission", default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    #[serde(rename = "unixOwnerId", default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<u32>,
    #[serde(rename = "unixOwner", default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(rename = "unixGroupId", default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u32>,
    #[serde(rename = "unixGroup", default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(rename = "unixMtime", default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<String>,
    #[serde(rename = "unixCtime", default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<String>,
    #[serde(rename = "unixAtime", default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<String>,
}

/// One segment of a file's linear content: a leaf blob, a reference into
/// another (sub-)file schema, or — with neither reference set — a
/// zero-filled span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "blobRef", default, skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<BlobRef>,
    #[serde(rename = "subFileBlobRef", default, skip_serializing_if = "Option::is_none")]
    pub sub_file_blob_ref: Option<BlobRef>,
    /// Bytes this part contributes to the file.
    pub size: u64,
    /// Starting byte within the referenced blob's logical content.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl ContentPart {
    /// Part covering `size` bytes of a leaf chunk blob.
    pub fn leaf(blob_ref: BlobRef, size: u64) -> ContentPart {
        ContentPart {
            blob_ref: Some(blob_ref),
            sub_file_blob_ref: None,
            size,
            offset: 0,
        }
    }

    /// Part covering `size` bytes of another file/fragment schema blob.
    pub fn sub_file(sub_ref: BlobRef, size: u64) -> ContentPart {
        ContentPart {
            blob_ref: None,
            sub_file_blob_ref: Some(sub_ref),
            size,
            offset: 0,
        }
    }

    /// Part denoting `size` zero bytes.
    pub fn zero(size: u64) -> ContentPart {
        ContentPart {
            blob_ref: None,
            sub_file_blob_ref: None,
            size,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSchema {
    #[serde(flatten)]
    pub file_name: FileName,
    pub size: u64,
    #[serde(rename = "contentParts", default)]
    pub content_parts: Vec<ContentPart>,
    /// Set on the intermediate schema blobs the rolling writer emits to
    /// compose its hash tree.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fragment: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorySchema {
    #[serde(flatten)]
    pub file_name: FileName,
    /// Reference to the static-set listing this directory's children.
    /// Required: an empty directory points at a static-set with empty
    /// members.
    pub entries: BlobRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymlinkSchema {
    #[serde(flatten)]
    pub file_name: FileName,
    #[serde(flatten)]
    pub target: SymlinkTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticSetSchema {
    #[serde(default)]
    pub members: Vec<BlobRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermanodeSchema {
    /// Entropy seed making the blobref unique; the blob's identity is
    /// this randomness, claims give it meaning.
    pub random: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimType {
    #[serde(rename = "set-attribute")]
    SetAttribute,
    #[serde(rename = "add-attribute")]
    AddAttribute,
    #[serde(rename = "del-attribute")]
    DelAttribute,
}

impl fmt::Display for ClaimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClaimType::SetAttribute => "set-attribute",
            ClaimType::AddAttribute => "add-attribute",
            ClaimType::DelAttribute => "del-attribute",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSchema {
    #[serde(rename = "permaNode")]
    pub permanode: BlobRef,
    #[serde(rename = "claimType")]
    pub claim_type: ClaimType,
    #[serde(rename = "claimDate", with = "claim_date")]
    pub claim_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareSchema {
    #[serde(rename = "authType")]
    pub auth_type: String,
    pub target: BlobRef,
    pub transitive: bool,
}

/// Kind-specific schema content, dispatched on `camliType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "camliType")]
pub enum SchemaKind {
    #[serde(rename = "file")]
    File(FileSchema),
    #[serde(rename = "directory")]
    Directory(DirectorySchema),
    #[serde(rename = "symlink")]
    Symlink(SymlinkSchema),
    #[serde(rename = "static-set")]
    StaticSet(StaticSetSchema),
    #[serde(rename = "permanode")]
    Permanode(PermanodeSchema),
    #[serde(rename = "claim")]
    Claim(ClaimSchema),
    #[serde(rename = "share")]
    Share(ShareSchema),
}

/// A decoded schema blob: the common header plus the kind-specific body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "camliVersion")]
    pub version: u32,
    #[serde(rename = "camliSigner", default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<BlobRef>,
    #[serde(rename = "camliSig", default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(flatten)]
    pub unix: UnixMeta,
    #[serde(flatten)]
    pub kind: SchemaKind,
}

impl Schema {
    fn with_kind(kind: SchemaKind) -> Schema {
        Schema {
            version: SCHEMA_VERSION,
            signer: None,
            sig: None,
            unix: UnixMeta::default(),
            kind,
        }
    }

    /// Decode a schema blob, `Malformed` if the bytes are not a schema.
    pub fn parse_bytes(data: &[u8]) -> Result<Schema> {
        Ok(serde_json::from_slice(data)?)
    }

    /// The `camliType` value for this schema's kind.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            SchemaKind::File(_) => "file",
            SchemaKind::Directory(_) => "directory",
            SchemaKind::Symlink(_) => "symlink",
            SchemaKind::StaticSet(_) => "static-set",
            SchemaKind::Permanode(_) => "permanode",
            SchemaKind::Claim(_) => "claim",
            SchemaKind::Share(_) => "share",
        }
    }

    /// The name carried by file, directory, and symlink blobs.
    pub fn file_name(&self) -> Option<&MaybeUtf8> {
        match &self.kind {
            SchemaKind::File(f) => Some(&f.file_name.0),
            SchemaKind::Directory(d) => Some(&d.file_name.0),
            SchemaKind::Symlink(s) => Some(&s.file_name.0),
            _ => None,
        }
    }

    /// Whether this blob names the given file.
    pub fn has_file_name(&self, name: &str) -> bool {
        self.file_name().is_some_and(|f| f.as_bytes() == name.as_bytes())
    }

    /// Unix mode bits: the octal `unixPermission` combined with the file
    /// type bit implied by the schema kind.
    pub fn unix_mode(&self) -> u32 {
        let mut mode = self
            .unix
            .permission
            .as_deref()
            .and_then(|p| u32::from_str_radix(p, 8).ok())
            .unwrap_or(0);
        mode |= match &self.kind {
            SchemaKind::Directory(_) => libc::S_IFDIR as u32,
            SchemaKind::File(_) => libc::S_IFREG as u32,
            SchemaKind::Symlink(_) => libc::S_IFLNK as u32,
            _ => 0,
        };
        mode
    }

    /// File schema over the given content parts. The declared size must
    /// equal the sum of the part sizes.
    pub fn file(file_name: impl Into<MaybeUtf8>, size: u64, parts: Vec<ContentPart>) -> Result<Schema> {
        Schema::file_inner(file_name.into(), size, parts, false)
    }

    /// Intermediate fragment schema emitted by the rolling writer.
    pub fn fragment(size: u64, parts: Vec<ContentPart>) -> Result<Schema> {
        Schema::file_inner(MaybeUtf8::default(), size, parts, true)
    }

    fn file_inner(file_name: MaybeUtf8, size: u64, parts: Vec<ContentPart>, fragment: bool) -> Result<Schema> {
        let sum: u64 = parts.iter().map(|p| p.size).sum();
        if sum != size {
            return Err(Error::malformed(format!(
                "file size is {size} but sum of content parts is {sum}"
            )));
        }
        Ok(Schema::with_kind(SchemaKind::File(FileSchema {
            file_name: FileName(file_name.base_name()),
            size,
            content_parts: parts,
            fragment,
        })))
    }

    pub fn directory(file_name: impl Into<MaybeUtf8>, entries: BlobRef) -> Schema {
        Schema::with_kind(SchemaKind::Directory(DirectorySchema {
            file_name: FileName(file_name.into().base_name()),
            entries,
        }))
    }

    pub fn symlink(file_name: impl Into<MaybeUtf8>, target: impl Into<MaybeUtf8>) -> Schema {
        Schema::with_kind(SchemaKind::Symlink(SymlinkSchema {
            file_name: FileName(file_name.into().base_name()),
            target: SymlinkTarget(target.into()),
        }))
    }

    /// Static-set over the members. Duplicates on input collapse to a set.
    pub fn static_set(members: Vec<BlobRef>) -> Schema {
        let mut seen = std::collections::HashSet::new();
        let members = members.into_iter().filter(|m| seen.insert(m.clone())).collect();
        Schema::with_kind(SchemaKind::StaticSet(StaticSetSchema { members }))
    }

    /// Unsigned permanode with a fresh entropy seed. Not cryptographically
    /// random; the blob is expected to be signed by an external signer.
    pub fn unsigned_permanode() -> Schema {
        let mut rng = rand::thread_rng();
        let random: String = (0..20).map(|_| rng.gen_range(32u8..126) as char).collect();
        Schema::with_kind(SchemaKind::Permanode(PermanodeSchema { random }))
    }

    pub fn set_attribute_claim(
        permanode: BlobRef,
        attr: impl Into<String>,
        value: impl Into<String>,
        date: DateTime<Utc>,
    ) -> Schema {
        Schema::attr_claim(permanode, ClaimType::SetAttribute, attr.into(), Some(value.into()), date)
    }

    pub fn add_attribute_claim(
        permanode: BlobRef,
        attr: impl Into<String>,
        value: impl Into<String>,
        date: DateTime<Utc>,
    ) -> Schema {
        Schema::attr_claim(permanode, ClaimType::AddAttribute, attr.into(), Some(value.into()), date)
    }

    /// Delete claim: with a value, removes that value from the attribute;
    /// with `None`, deletes the attribute entirely.
    pub fn del_attribute_claim(
        permanode: BlobRef,
        attr: impl Into<String>,
        value: Option<String>,
        date: DateTime<Utc>,
    ) -> Schema {
        Schema::attr_claim(permanode, ClaimType::DelAttribute, attr.into(), value, date)
    }

    fn attr_claim(
        permanode: BlobRef,
        claim_type: ClaimType,
        attribute: String,
        value: Option<String>,
        date: DateTime<Utc>,
    ) -> Schema {
        Schema::with_kind(SchemaKind::Claim(ClaimSchema {
            permanode,
            claim_type,
            claim_date: date,
            attribute: Some(attribute),
            value,
        }))
    }

    pub fn share(auth_type: impl Into<String>, target: BlobRef, transitive: bool) -> Schema {
        Schema::with_kind(SchemaKind::Share(ShareSchema {
            auth_type: auth_type.into(),
            target,
            transitive,
        }))
    }
}

/// Whether a blob's bytes look like a schema blob: a JSON object carrying
/// both `camliVersion` and `camliType`.
pub fn is_schema_blob(data: &[u8]) -> bool {
    match serde_json::from_slice::<serde_json::Value>(data) {
        Ok(serde_json::Value::Object(map)) => {
            map.contains_key("camliVersion")
                && map.get("camliType").map(|t| t.is_string()).unwrap_or(false)
        }
        _ => false,
    }
}

// ============================================================================
// Claim dates
// ============================================================================

/// Format a claim date as RFC3339 UTC with trailing-zero-trimmed
/// nanoseconds, e.g. `2011-05-27T17:20:57.123Z`.
pub fn format_claim_date(dt: &DateTime<Utc>) -> String {
    let nanos = dt.timestamp_subsec_nanos();
    if nanos == 0 {
        return dt.to_rfc3339_opts(SecondsFormat::Secs, true);
    }
    let secs = dt.format("%Y-%m-%dT%H:%M:%S").to_string();
    let mut frac = format!("{nanos:09}");
    while frac.ends_with('0') {
        frac.pop();
    }
    format!("{secs}.{frac}Z")
}

/// Parse an RFC3339 claim date, with or without fractional seconds.
pub fn parse_claim_date(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::malformed(format!("invalid claim date {s:?}: {e}")))
}

mod claim_date {
    use chrono::DateTime;
    use chrono::Utc;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_claim_date(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_claim_date(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn file_schema_round_trips() {
        let br = BlobRef::must_parse("sha1-0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33");
        let schema = Schema::file("dir/photo.jpg", 5, vec![ContentPart::leaf(br.clone(), 5)])
            .expect("sizes agree");
        assert_eq!(schema.kind_name(), "file");
        // Constructors keep only the base name.
        assert!(schema.has_file_name("photo.jpg"));

        let json = serde_json::to_string(&schema).expect("encode");
        let back: Schema = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, schema);
        match back.kind {
            SchemaKind::File(f) => {
                assert_eq!(f.size, 5);
                assert_eq!(f.content_parts[0].blob_ref.as_ref(), Some(&br));
                assert!(!f.fragment);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn file_constructor_rejects_bad_size() {
        let br = BlobRef::must_parse("sha1-00ff");
        let err = Schema::file("x", 10, vec![ContentPart::leaf(br, 5)]).expect_err("mismatch");
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn superset_decodes_mixed_filename_bytes() {
        let json = r#"{
            "camliVersion": 1,
            "camliType": "file",
            "fileNameBytes": ["good", 255, "name"],
            "size": 0,
            "contentParts": []
        }"#;
        let schema = Schema::parse_bytes(json.as_bytes()).expect("decode");
        let name = schema.file_name().expect("has name");
        let mut want = b"good".to_vec();
        want.push(255);
        want.extend_from_slice(b"name");
        assert_eq!(name.as_bytes(), &want[..]);
        assert!(name.as_str().is_none(), "byte 255 is not valid UTF-8");
    }

    #[test]
    fn non_utf8_name_encodes_as_mixed_bytes() {
        let mut raw = b"bad".to_vec();
        raw.push(0xfe);
        let schema = Schema::file(raw.clone(), 0, vec![]).expect("empty file");
        let value = serde_json::to_value(&schema).expect("encode");
        assert!(value.get("fileName").is_none());
        let parts = value.get("fileNameBytes").expect("mixed array").as_array().expect("array");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], serde_json::json!("bad"));
        assert_eq!(parts[1], serde_json::json!(254));

        let back = Schema::parse_bytes(value.to_string().as_bytes()).expect("decode");
        assert_eq!(back.file_name().expect("name").as_bytes(), &raw[..]);
    }

    #[test]
    fn utf8_filename_wins_over_bytes() {
        let json = r#"{
            "camliVersion": 1,
            "camliType": "file",
            "fileName": "clean",
            "fileNameBytes": ["stale"],
            "size": 0,
            "contentParts": []
        }"#;
        let schema = Schema::parse_bytes(json.as_bytes()).expect("decode");
        assert!(schema.has_file_name("clean"));
    }

    #[test]
    fn missing_camli_type_is_malformed() {
        let err = Schema::parse_bytes(br#"{"camliVersion": 1, "size": 3}"#).expect_err("no type");
        assert!(matches!(err, Error::Malformed { .. }));
        let err = Schema::parse_bytes(b"not json at all").expect_err("not json");
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn unix_mode_combines_permission_and_type() {
        let br = BlobRef::must_parse("sha1-00ff");
        let mut schema = Schema::file("f", 0, vec![]).expect("file");
        schema.unix.permission = Some("0644".to_string());
        assert_eq!(schema.unix_mode(), libc::S_IFREG as u32 | 0o644);

        let mut dir = Schema::directory("d", br);
        dir.unix.permission = Some("0755".to_string());
        assert_eq!(dir.unix_mode(), libc::S_IFDIR as u32 | 0o755);

        let link = Schema::symlink("l", "target");
        assert_eq!(link.unix_mode(), libc::S_IFLNK as u32);
    }

    #[test]
    fn static_set_collapses_duplicates() {
        let a = BlobRef::must_parse("sha1-aa");
        let b = BlobRef::must_parse("sha1-bb");
        let schema = Schema::static_set(vec![a.clone(), b.clone(), a.clone()]);
        match schema.kind {
            SchemaKind::StaticSet(s) => assert_eq!(s.members, vec![a, b]),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn permanode_randomness_differs() {
        let a = Schema::unsigned_permanode();
        let b = Schema::unsigned_permanode();
        let (SchemaKind::Permanode(pa), SchemaKind::Permanode(pb)) = (&a.kind, &b.kind) else {
            panic!("wrong kinds");
        };
        assert_eq!(pa.random.len(), 20);
        assert_ne!(pa.random, pb.random);
    }

    #[test]
    fn claim_date_format_trims_trailing_zeros() {
        let dt = Utc.with_ymd_and_hms(2011, 5, 27, 17, 20, 57).unwrap();
        assert_eq!(format_claim_date(&dt), "2011-05-27T17:20:57Z");

        let dt = dt + chrono::Duration::nanoseconds(123_000_000);
        assert_eq!(format_claim_date(&dt), "2011-05-27T17:20:57.123Z");
        assert_eq!(parse_claim_date("2011-05-27T17:20:57.123Z").expect("parse"), dt);
    }

    #[test]
    fn claim_round_trips() {
        let pn = BlobRef::must_parse("sha1-00aa");
        let date = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        let claim = Schema::set_attribute_claim(pn.clone(), "tag", "blue", date);
        let json = serde_json::to_string(&claim).expect("encode");
        let back = Schema::parse_bytes(json.as_bytes()).expect("decode");
        match back.kind {
            SchemaKind::Claim(c) => {
                assert_eq!(c.permanode, pn);
                assert_eq!(c.claim_type, ClaimType::SetAttribute);
                assert_eq!(c.claim_date, date);
                assert_eq!(c.attribute.as_deref(), Some("tag"));
                assert_eq!(c.value.as_deref(), Some("blue"));
            }
            other => panic!("wrong kind: {other:?}"),
        }

        // Attribute-wide deletes carry no value key at all.
        let del = Schema::del_attribute_claim(pn, "tag", None, date);
        let value = serde_json::to_value(&del).expect("encode");
        assert!(value.get("value").is_none());
    }

    #[test]
    fn is_schema_blob_checks_both_keys() {
        assert!(is_schema_blob(br#"{"camliVersion": 1, "camliType": "permanode"}"#));
        assert!(!is_schema_blob(br#"{"camliVersion": 1}"#));
        assert!(!is_schema_blob(b"plain bytes"));
        assert!(!is_schema_blob(br#"[1, 2, 3]"#));
    }
}
