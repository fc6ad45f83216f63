//! The railyard run pipeline.
//!
//! The CLI layer resolves configuration and selection flags, then hands a
//! [`BuildContext`] to [`run::run_build`]: package discovery, scope
//! resolution, graph construction, the incremental check, execution, and the
//! final summary all happen here.

mod context;
mod error;
pub mod run;
pub mod summary;
mod visitor;
pub mod worker_pool;

pub use crate::{
    context::{BuildContext, BuildOptions},
    error::{Error, ExitStatus},
    run::{run_build, run_build_with, BuildResult},
};
