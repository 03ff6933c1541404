//! Schema blobs and the file DAG.
//!
//! A schema blob is a UTF-8 JSON object describing a logical object —
//! a file, directory, symlink, static-set, permanode, claim, or share —
//! stored like any other blob and addressed by its hash. This crate holds:
//!
//! - the typed [`Schema`] model and its JSON (de)serialization contract,
//!   including the canonical [`to_camli_json`] writer
//! - the rolling-checksum chunker ([`rollsum`])
//! - the file writer, turning byte streams into deduplicated blob DAGs
//! - the seekable [`FileReader`] reconstructing the stream from the DAG
//! - directory resolution over static-sets

pub mod camli_json;
pub mod dir;
pub mod file_reader;
pub mod file_writer;
pub mod model;
pub mod rollsum;

pub use camli_json::map_to_camli_json;
pub use camli_json::to_camli_json;
pub use file_reader::FileReader;
pub use file_writer::write_file_from_reader;
pub use file_writer::write_file_from_reader_rolling;
pub use model::ClaimType;
pub use model::ContentPart;
pub use model::FileSchema;
pub use model::MaybeUtf8;
pub use model::Schema;
pub use model::SchemaKind;
pub use rollsum::RollSum;
