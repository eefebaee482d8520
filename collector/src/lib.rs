#[macro_use]
extern crate tracing;

pub mod catalog;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod node;
pub mod orchestrator;
pub mod outcome;
pub mod policy;
pub mod target;
pub mod template;
pub mod writer;

pub use catalog::{
    Catalog,
    CapabilityKind,
    QueryDefinition,
};
pub use error::{
    AttemptError,
    CatalogError,
    RunError,
    SshError,
};
pub use orchestrator::Orchestrator;
pub use outcome::{
    CallOutcome,
    CallStatus,
    NodeResult,
    NodeStatus,
    RunManifest,
    RunStatus,
};
pub use target::{
    Target,
    TargetKey,
};
pub use writer::{
    OutputWriter,
    MANIFEST_FILE,
};
