//! 実行エンジン

mod executor;
mod run;
mod state;

pub use executor::ExecutionEngine;
pub use run::{
    Artifact, ArtifactKind, Run, RunControl, RunError, RunId, TwoFactorSignal,
};
pub use state::RunState;
