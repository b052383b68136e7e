//! Declared task outputs: how they are specified, how a specification is
//! turned into patterns relative to the work directory, and how those
//! patterns are matched against the files a task produced.

mod collect;
mod resolve;
mod spec;

pub use collect::{collect_outputs, collect_pattern, ResolvedOutput};
pub use resolve::{escape_glob, relativize_path, relativize_str, resolve};
pub use spec::{OutputOptions, OutputQualifier, OutputSpec, OutputTarget, OutputType};
