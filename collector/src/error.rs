use crate::outcome::RunManifest;
use std::path::PathBuf;

/// A malformed query catalog. Raised while loading, never while collecting.
#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("Cannot read the query catalog at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("The query catalog is not valid YAML: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Component {component:?}: query name {name:?} is declared more than once")]
    DuplicateName { component: String, name: String },
    #[error("Component {component:?}: output file {output:?} is used by both {first:?} and {second:?}")]
    DuplicateOutput {
        component: String,
        output: String,
        first: String,
        second: String,
    },
    #[error("Component {component:?}: query {name:?} has an unparseable version range {range:?}: {source}")]
    VersionRange {
        component: String,
        name: String,
        range: String,
        source: semver::Error,
    },
    #[error("Component {component:?}: output {first:?} and output {second:?} cannot both exist, one is a directory of the other")]
    OutputClash {
        component: String,
        first: String,
        second: String,
    },
    #[error("Component {component:?}: query {name:?} declares `{field}`, which only applies to {allowed}")]
    MisplacedField {
        component: String,
        name: String,
        field: &'static str,
        allowed: &'static str,
    },
    #[error("Component {component:?}: query {name:?} has an invalid output file name {output:?}")]
    OutputPath {
        component: String,
        name: String,
        output: String,
    },
    #[error("Component {component:?}: query {name:?} must declare {expected}")]
    MissingRequest {
        component: String,
        name: String,
        expected: &'static str,
    },
    #[error("Component {component:?}: query {name:?} uses an unknown placeholder {{{{{placeholder}}}}}")]
    UnknownPlaceholder {
        component: String,
        name: String,
        placeholder: String,
    },
    #[error("Component {component:?}: query {name:?} has an unterminated placeholder")]
    UnterminatedPlaceholder { component: String, name: String },
    #[error("Component {component:?}: the bootstrap query must be an HTTP query")]
    BootstrapKind { component: String },
    #[error("Component {component:?} is not declared in the query catalog")]
    UnknownComponent { component: String },
}

/// Why a single call attempt produced no response at all.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AttemptError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),
    #[error("{0}")]
    Request(String),
    /// The capability itself could not be set up, e.g. no SSH session.
    #[error("{0}")]
    Unavailable(String),
}

impl AttemptError {
    /// Transport failures and timeouts may succeed on a second attempt. A malformed
    /// request never will.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SshError {
    #[error("No ssh client binary found on this machine: {0}")]
    Binary(#[from] which::Error),
    #[error("Cannot start ssh: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("SSH session to {host} could not be established: {detail}")]
    Connect { host: String, detail: String },
    #[error("SSH session to {host} was not established within {timeout:?}")]
    ConnectTimeout {
        host: String,
        timeout: std::time::Duration,
    },
    #[error("Cannot create the SSH control directory: {0}")]
    ControlDir(String),
}

/// Failures that stop a run. Everything below this level is recorded in the manifest.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("No target could be reached, nothing was collected: {reason}")]
    Fatal {
        reason: String,
        manifest: Box<RunManifest>,
    },
    #[error("Cannot set up the HTTP client: {0}")]
    Client(eyre::Report),
    #[error("Cannot write the output tree: {0}")]
    Output(eyre::Report),
}
