// src/protocol/mod.rs

//! Event protocol: the typed event model, its line-delimited wire form and a
//! streaming decoder that drives [`Visitor`]s.

pub mod decode;
pub mod events;
pub mod visitor;
pub mod wire;

pub use decode::{Decoder, decode};
pub use events::{
    Case, Dependencies, Exception, FileDigest, FilePath, LoadedFile, ResultTally, Status,
    SuiteBegin, SuiteFinish, TestBegin, TestFilter, TestFinish, TraceEvent,
};
pub use visitor::{Callbacks, MultiVisitor, Visitor};
pub use wire::Record;
