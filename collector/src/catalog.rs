//! Declarative query definitions, validated eagerly when the catalog is loaded.

use crate::{
    error::CatalogError,
    target::Platform,
    template::{
        self,
        TemplateError,
        BUILTIN_PLACEHOLDERS,
    },
};
use cluster_diag_config::FULL_MODE;
use semver::{
    BuildMetadata,
    Prerelease,
    Version,
    VersionReq,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::{
        BTreeMap,
        HashSet,
    },
    path::{
        Component,
        Path,
    },
    time::Duration,
};
use strum::Display;

const DEFAULT_CATALOG: &str = include_str!("default-catalog.yaml");
const DEFAULT_VERSION_POINTER: &str = "/version/number";

#[derive(Debug, Clone, Copy, Default, Display, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CapabilityKind {
    #[default]
    Http,
    Ssh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Http(HttpRequest),
    Ssh { command: String },
}

impl Request {
    /// The text that carries placeholders.
    pub fn template(&self) -> &str {
        match self {
            Request::Http(request) => &request.path,
            Request::Ssh { command } => command,
        }
    }
}

/// One declared call. Immutable once the catalog is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDefinition {
    pub name: String,
    pub component: String,
    pub request: Request,
    /// Relative file name inside the target's directory, normalised to `/`-separated segments.
    pub output: String,
    pub versions: VersionReq,
    /// Empty means every platform.
    pub platforms: Vec<Platform>,
    pub tags: Vec<String>,
    pub critical: bool,
    /// Whether a failed transport may be retried without side effects.
    pub idempotent: bool,
    /// SSH only: a non-zero exit status still counts as success.
    pub expect_nonzero: bool,
    pub timeout: Option<Duration>,
}

impl QueryDefinition {
    pub fn kind(&self) -> CapabilityKind {
        match self.request {
            Request::Http(_) => CapabilityKind::Http,
            Request::Ssh { .. } => CapabilityKind::Ssh,
        }
    }

    /// Pre-release builds are matched as their release, `8.12.0-SNAPSHOT` satisfies `>=8.12.0`.
    pub fn applies_to(&self, version: &Version) -> bool {
        let mut release = version.clone();
        release.pre = Prerelease::EMPTY;
        release.build = BuildMetadata::EMPTY;
        self.versions.matches(&release)
    }

    pub fn runs_in_mode(&self, mode: &str) -> bool {
        mode == FULL_MODE || self.tags.iter().any(|tag| tag == mode)
    }

    pub fn runs_on(&self, platform: Platform) -> bool {
        self.platforms.is_empty() || self.platforms.contains(&platform)
    }

    /// Whether some host could run both queries.
    fn shares_platform_with(&self, other: &QueryDefinition) -> bool {
        self.platforms.is_empty()
            || other.platforms.is_empty()
            || self.platforms.iter().any(|platform| other.platforms.contains(platform))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bootstrap {
    pub query: QueryDefinition,
    /// JSON pointer to the version string in the bootstrap response.
    pub version_pointer: String,
    /// JSON pointer to the operating system name, when the response carries one.
    pub platform_pointer: Option<String>,
    /// Placeholder name to JSON pointer, read from the bootstrap response.
    pub facts: BTreeMap<String, String>,
}

/// Cluster topology query: lists every member reachable from one seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDefinition {
    pub path: String,
    /// JSON pointer to the object or array holding one entry per node.
    pub nodes_pointer: String,
    /// JSON pointer, relative to a node entry, to its `host:port` publish address.
    pub address_pointer: String,
    #[serde(default = "default_name_pointer")]
    pub name_pointer: String,
    /// JSON pointer, relative to a node entry, to its operating system name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_pointer: Option<String>,
    /// Placeholder name to JSON pointer, relative to a node entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub facts: BTreeMap<String, String>,
}

fn default_name_pointer() -> String {
    "/name".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentCatalog {
    pub name: String,
    pub bootstrap: Bootstrap,
    pub discovery: Option<DiscoveryDefinition>,
    /// In declaration order, bootstrap excluded.
    pub queries: Vec<QueryDefinition>,
}

impl ComponentCatalog {
    /// Queries whose version range admits `version`, in declaration order.
    pub fn applicable_queries(&self, version: &Version) -> Vec<&QueryDefinition> {
        self.queries.iter().filter(|q| q.applies_to(version)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    variables: BTreeMap<String, String>,
    components: BTreeMap<String, ComponentCatalog>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    variables: BTreeMap<String, String>,
    components: BTreeMap<String, ComponentFile>,
}

#[derive(Debug, Deserialize)]
struct ComponentFile {
    bootstrap: QueryEntry,
    #[serde(default)]
    discovery: Option<DiscoveryDefinition>,
    #[serde(default)]
    queries: Vec<QueryEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryEntry {
    name: String,
    #[serde(default)]
    kind: CapabilityKind,
    #[serde(default)]
    request: Option<HttpRequest>,
    #[serde(default)]
    command: Option<String>,
    output: String,
    #[serde(default)]
    versions: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    platforms: Vec<Platform>,
    #[serde(default)]
    critical: bool,
    #[serde(default)]
    idempotent: Option<bool>,
    #[serde(default)]
    expect_nonzero: bool,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    version_pointer: Option<String>,
    #[serde(default)]
    platform_pointer: Option<String>,
    #[serde(default)]
    facts: BTreeMap<String, String>,
}

impl Catalog {
    /// The catalog shipped with the binary.
    pub fn builtin(overrides: &BTreeMap<String, String>) -> Result<Self, CatalogError> {
        Self::parse(DEFAULT_CATALOG, overrides)
    }

    pub fn load(path: impl AsRef<Path>, overrides: &BTreeMap<String, String>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, overrides)
    }

    /// `overrides` win over the catalog's own `variables` and may introduce new names.
    pub fn parse(yaml: &str, overrides: &BTreeMap<String, String>) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_yml::from_str(yaml)?;
        let mut variables = file.variables;
        variables.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut components = BTreeMap::new();
        for (name, component) in file.components {
            let component = build_component(&name, component, &variables)?;
            components.insert(name, component);
        }

        debug!(components = components.len(), "query catalog loaded");
        Ok(Self { variables, components })
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn component(&self, name: &str) -> Result<&ComponentCatalog, CatalogError> {
        self.components.get(name).ok_or_else(|| CatalogError::UnknownComponent {
            component: name.to_string(),
        })
    }

    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }
}

fn build_component(
    component: &str,
    mut file: ComponentFile,
    variables: &BTreeMap<String, String>,
) -> Result<ComponentCatalog, CatalogError> {
    let mut known: HashSet<&str> = BUILTIN_PLACEHOLDERS.iter().copied().collect();
    known.extend(variables.keys().map(String::as_str));
    if let Some(discovery) = &file.discovery {
        known.extend(discovery.facts.keys().map(String::as_str));
    }

    let version_pointer = file
        .bootstrap
        .version_pointer
        .take()
        .unwrap_or_else(|| DEFAULT_VERSION_POINTER.to_string());
    let platform_pointer = file.bootstrap.platform_pointer.take();
    let facts = std::mem::take(&mut file.bootstrap.facts);

    let mut bootstrap = build_query(component, file.bootstrap, &known)?;
    if bootstrap.kind() != CapabilityKind::Http {
        return Err(CatalogError::BootstrapKind {
            component: component.to_string(),
        });
    }
    bootstrap.critical = true;

    known.extend(facts.keys().map(String::as_str));
    let queries = file
        .queries
        .into_iter()
        .map(|entry| {
            reject_bootstrap_fields(component, &entry)?;
            build_query(component, entry, &known)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let all: Vec<&QueryDefinition> = std::iter::once(&bootstrap).chain(queries.iter()).collect();
    let mut names = HashSet::new();
    for (index, query) in all.iter().enumerate() {
        if !names.insert(query.name.as_str()) {
            return Err(CatalogError::DuplicateName {
                component: component.to_string(),
                name: query.name.clone(),
            });
        }
        for earlier in all[..index].iter().filter(|earlier| earlier.shares_platform_with(query)) {
            check_outputs(component, earlier, query)?;
        }
    }

    Ok(ComponentCatalog {
        name: component.to_string(),
        bootstrap: Bootstrap {
            query: bootstrap,
            version_pointer,
            platform_pointer,
            facts,
        },
        discovery: file.discovery,
        queries,
    })
}

/// Two outputs of the same component must not name the same file, nor a file and a directory
/// holding the other.
fn check_outputs(component: &str, first: &QueryDefinition, second: &QueryDefinition) -> Result<(), CatalogError> {
    if first.output == second.output {
        return Err(CatalogError::DuplicateOutput {
            component: component.to_string(),
            output: second.output.clone(),
            first: first.name.clone(),
            second: second.name.clone(),
        });
    }
    let nested = |outer: &str, inner: &str| inner.starts_with(outer) && inner[outer.len()..].starts_with('/');
    if nested(&first.output, &second.output) || nested(&second.output, &first.output) {
        return Err(CatalogError::OutputClash {
            component: component.to_string(),
            first: first.output.clone(),
            second: second.output.clone(),
        });
    }
    Ok(())
}

fn reject_bootstrap_fields(component: &str, entry: &QueryEntry) -> Result<(), CatalogError> {
    let field = if entry.version_pointer.is_some() {
        "version_pointer"
    } else if entry.platform_pointer.is_some() {
        "platform_pointer"
    } else if !entry.facts.is_empty() {
        "facts"
    } else {
        return Ok(());
    };
    Err(CatalogError::MisplacedField {
        component: component.to_string(),
        name: entry.name.clone(),
        field,
        allowed: "the bootstrap query",
    })
}

fn build_query(component: &str, entry: QueryEntry, known: &HashSet<&str>) -> Result<QueryDefinition, CatalogError> {
    let name = entry.name;
    let request = match (entry.kind, entry.request, entry.command) {
        (CapabilityKind::Http, Some(request), None) => Request::Http(request),
        (CapabilityKind::Ssh, None, Some(command)) => Request::Ssh { command },
        (CapabilityKind::Http, _, _) => {
            return Err(CatalogError::MissingRequest {
                component: component.to_string(),
                name,
                expected: "a `request` and no `command`",
            })
        }
        (CapabilityKind::Ssh, _, _) => {
            return Err(CatalogError::MissingRequest {
                component: component.to_string(),
                name,
                expected: "a `command` and no `request`",
            })
        }
    };
    if entry.expect_nonzero && entry.kind == CapabilityKind::Http {
        return Err(CatalogError::MisplacedField {
            component: component.to_string(),
            name,
            field: "expect_nonzero",
            allowed: "remote commands",
        });
    }

    for placeholder in template::placeholders(request.template()).map_err(|err| match err {
        TemplateError::Unterminated | TemplateError::Unknown(_) => CatalogError::UnterminatedPlaceholder {
            component: component.to_string(),
            name: name.clone(),
        },
    })? {
        if !known.contains(placeholder) {
            return Err(CatalogError::UnknownPlaceholder {
                component: component.to_string(),
                name,
                placeholder: placeholder.to_string(),
            });
        }
    }

    let Some(output) = normalize_output(&entry.output) else {
        return Err(CatalogError::OutputPath {
            component: component.to_string(),
            name,
            output: entry.output,
        });
    };

    let versions = match entry.versions.as_deref() {
        None => VersionReq::STAR,
        Some(range) => VersionReq::parse(range).map_err(|source| CatalogError::VersionRange {
            component: component.to_string(),
            name: name.clone(),
            range: range.to_string(),
            source,
        })?,
    };

    let idempotent = entry.idempotent.unwrap_or(matches!(request, Request::Http(_)));

    Ok(QueryDefinition {
        name,
        component: component.to_string(),
        request,
        output,
        versions,
        platforms: entry.platforms,
        tags: entry.tags,
        critical: entry.critical,
        idempotent,
        expect_nonzero: entry.expect_nonzero,
        timeout: entry.timeout_secs.filter(|secs| *secs > 0).map(Duration::from_secs),
    })
}

/// Relative, without `..`, and no segment starting with a dot. `a//b` and `a/./b` become `a/b`.
fn normalize_output(output: &str) -> Option<String> {
    let mut segments = Vec::new();
    for component in Path::new(output).components() {
        match component {
            Component::Normal(segment) => {
                let segment = segment.to_str()?;
                if segment.starts_with('.') {
                    return None;
                }
                segments.push(segment);
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!segments.is_empty()).then(|| segments.join("/"))
}

/// Lenient version parsing for what products report: `v8.1.0`, `7.17`, `8.12.0-SNAPSHOT`.
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let (core, pre) = match raw.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (raw, None),
    };
    let mut parts = core.split('.').map(|part| part.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    if parts.next().is_some() {
        return None;
    }
    let mut version = Version::new(major, minor, patch);
    if let Some(pre) = pre {
        version.pre = Prerelease::new(pre).ok()?;
    }
    Some(version)
}
