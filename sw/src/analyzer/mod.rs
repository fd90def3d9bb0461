//! Task analysis: plan parsing, prompt decomposition, and file prediction
//!
//! The analyzer turns a devplan or a free-text prompt into the initial task
//! set of a run. It holds no state of its own; everything it produces is
//! written into the coordination store at run initialization.

mod decompose;
mod digest;
mod plan;
mod predict;

pub use decompose::{DecomposedTask, decompose_prompt};
pub use digest::keyword_digest;
pub use plan::{ChecklistState, PlanDocument, PlanTask, parse_plan, update_plan};
pub use predict::{PredictionCache, predict_files, predict_files_cached, tree_digest, tree_listing};
