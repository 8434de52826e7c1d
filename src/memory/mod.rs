//! Hierarchical memory: raw turns (L1), pair summaries (L2), block
//! micro-summaries (L3), and the compaction cascade that keeps each layer
//! under its budget cap (spec §3, §4.4-§4.8).

mod assembler;
mod compactor;
pub mod sanitize;
mod store;
mod summarizer;

pub use assembler::{AssembleInput, AssembledContext, AssemblyDiagnostics, Includes, assemble_context};
pub use compactor::{CompactionReport, run_post_reply, run_preflight};
pub use store::MemoryStore;
pub use summarizer::{DefaultSummarizer, Summarizer};
