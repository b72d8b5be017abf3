mod finalization;
mod run;
mod step;
mod task;

pub use finalization::*;
pub use run::*;
pub use step::*;
pub use task::*;
