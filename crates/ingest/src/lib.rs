//! Cairn ingest: location readers and descriptor parsers.
//!
//! Readers turn a `(type, target)` location into a lazy stream of raw
//! documents; parsers turn one raw document into an entity envelope.

#![forbid(unsafe_code)]

mod parser;
mod reader;

pub use parser::{DescriptorParser, ParserError, ParserOutput, YamlDescriptorParser};
pub use reader::{FileReader, LocationReader, LocationReaders, RawItem, ReadError};
