//! Domain models for the agent.
//!
//! - `RunId`, `RunPhase`, `RunReport`: one orchestration cycle
//! - `ProbeSample`, `Incident`: connectivity observations
//! - `Artifact`, `ArtifactBundle`: unit output and the exported set

pub mod artifact;
pub mod error;
pub mod probe;
pub mod run;

pub use artifact::{normalize_local_name, Artifact, ArtifactBundle, NAMESPACE_SEPARATOR};
pub use error::{CoreError, Result, UnitError, UnitResult};
pub use probe::{Incident, ProbeSample};
pub use run::{RunId, RunPhase, RunReport, UnitSummary};
