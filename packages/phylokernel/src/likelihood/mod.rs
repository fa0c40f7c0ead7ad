pub mod ascertainment;
pub mod branch;
pub mod buffer;
pub mod context;
pub mod derivative;
pub mod diagnostics;
pub mod engine;
pub mod partial;
pub mod scratch;
pub mod shape;
pub mod tip;
