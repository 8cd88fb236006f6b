//! Shared types for the affinity-audit workspace.
//!
//! This crate holds the vocabulary every other crate speaks:
//!
//! - [`unit`] - the compiled unit model (types, fields, methods, instructions)
//! - [`descriptor`] - method/field descriptor parsing
//! - [`key`] - field storage identities ([`FieldKey`]) and thread [`Category`]
//! - [`encoding`] - BCS/JSON unit codecs and version digests
//! - [`builder`] - fluent unit construction
//! - [`env_utils`] - environment variable parsing for configuration overrides

pub mod builder;
pub mod descriptor;
pub mod encoding;
pub mod env_utils;
pub mod key;
pub mod unit;

pub use encoding::{decode_unit, decode_unit_auto, encode_unit, unit_digest, DecodeError, UnitFormat};
pub use key::{Category, FieldKey, ReceiverId};
pub use unit::{
    markers, CompiledUnit, FieldAccessKind, FieldDef, FieldRef, Instruction, MethodDef, MethodRef,
};
