pub mod emit;
pub mod forge;
pub mod git;
pub mod listfile;
pub mod logging;
pub mod pipeline;
pub mod planner;
pub mod reconciler;
