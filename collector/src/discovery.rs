use crate::{
    catalog::{
        ComponentCatalog,
        DiscoveryDefinition,
    },
    executor::{
        Capability as _,
        HttpBackend,
    },
    policy::RetryPolicy,
    target::{
        Platform,
        Target,
    },
    template,
};
use serde_json::Value;
use std::{
    collections::{
        BTreeMap,
        HashSet,
    },
    time::Duration,
};
use url::Url;

/// Resolves the targets of a run from the seeds.
pub struct Discovery<'a> {
    component: &'a ComponentCatalog,
    http: &'a HttpBackend,
    variables: &'a BTreeMap<String, String>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl<'a> Discovery<'a> {
    pub fn new(
        component: &'a ComponentCatalog,
        http: &'a HttpBackend,
        variables: &'a BTreeMap<String, String>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            component,
            http,
            variables,
            policy,
            timeout,
        }
    }

    /// With a topology query the first seed that answers it defines the member list. Otherwise,
    /// or when no seed answers it, every seed that answers the bootstrap query is a target.
    /// No target at all is an error carrying the reasons.
    pub async fn run(&self, seeds: &[Url]) -> Result<Vec<Target>, String> {
        let mut reasons = Vec::new();

        if let Some(definition) = &self.component.discovery {
            for seed in seeds {
                match self.topology(seed, definition).await {
                    Ok(targets) if !targets.is_empty() => {
                        info!(%seed, targets = targets.len(), "cluster members discovered");
                        return Ok(targets);
                    }
                    Ok(_) => reasons.push(format!("{seed}: topology lists no usable node")),
                    Err(reason) => reasons.push(format!("{seed}: {reason}")),
                }
            }
            warn!("Topology query failed on every seed, falling back to the seeds themselves");
        }

        let mut keys = HashSet::new();
        let mut targets = Vec::new();
        for seed in seeds {
            let Some(target) = Target::from_url(&self.component.name, seed.clone(), None) else {
                reasons.push(format!("{seed}: no host in address"));
                continue;
            };
            match self.answers_bootstrap(&target).await {
                Ok(()) if keys.insert(target.key.clone()) => targets.push(target),
                Ok(()) => {}
                Err(reason) => reasons.push(format!("{seed}: {reason}")),
            }
        }

        if targets.is_empty() {
            return Err(reasons.join("; "));
        }
        info!(targets = targets.len(), "seed targets reachable");
        Ok(targets)
    }

    async fn topology(&self, seed: &Url, definition: &DiscoveryDefinition) -> Result<Vec<Target>, String> {
        let seed_target = Target::from_url(&self.component.name, seed.clone(), None)
            .ok_or_else(|| "no host in address".to_string())?;
        let url = seed_target.endpoint(&definition.path).map_err(|err| err.to_string())?;
        let json = self
            .policy
            .run(true, self.timeout, || self.http.get_json(url.clone()))
            .await
            .result
            .map_err(|err| err.to_string())?;
        Ok(parse_topology(&self.component.name, seed, &json, definition))
    }

    /// Sends the bootstrap query as declared, placeholders and method included.
    async fn answers_bootstrap(&self, target: &Target) -> Result<(), String> {
        let query = &self.component.bootstrap.query;
        let mut vars = self.variables.clone();
        vars.extend(target.variables(None));
        let rendered = template::render(query.request.template(), &vars)
            .map_err(|err| format!("cannot render the bootstrap request: {err:?}"))?;
        let capture = self
            .policy
            .run(query.idempotent, query.timeout.unwrap_or(self.timeout), || {
                self.http.attempt(query, &rendered, target)
            })
            .await
            .result
            .map_err(|err| err.to_string())?;
        if capture.success {
            Ok(())
        } else {
            Err(capture.detail.unwrap_or_else(|| "bootstrap query failed".to_string()))
        }
    }
}

/// Targets listed by a topology response, in response order, without duplicates. Nodes are
/// addressed with the seed's scheme.
pub fn parse_topology(component: &str, seed: &Url, json: &Value, definition: &DiscoveryDefinition) -> Vec<Target> {
    let nodes: Vec<&Value> = match json.pointer(&definition.nodes_pointer) {
        Some(Value::Object(map)) => map.values().collect(),
        Some(Value::Array(list)) => list.iter().collect(),
        _ => return Vec::new(),
    };

    let mut keys = HashSet::new();
    let mut targets = Vec::new();
    for node in nodes {
        let Some(address) = node.pointer(&definition.address_pointer).and_then(Value::as_str) else {
            debug!("node without publish address in topology");
            continue;
        };
        // Publish addresses may carry the host name: `es-1/10.0.0.1:9200`.
        let address = address.rsplit('/').next().unwrap_or(address);
        let Ok(url) = Url::parse(&format!("{}://{address}", seed.scheme())) else {
            debug!(address, "unparseable publish address");
            continue;
        };
        let name = node
            .pointer(&definition.name_pointer)
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(mut target) = Target::from_url(component, url, name) {
            target.platform = definition
                .platform_pointer
                .as_deref()
                .and_then(|pointer| node.pointer(pointer))
                .and_then(Value::as_str)
                .map(Platform::from_os_name);
            target.facts = facts_from(node, &definition.facts);
            if keys.insert(target.key.clone()) {
                targets.push(target);
            }
        }
    }
    targets
}

/// String values found under the given pointers. Missing or non-string values are left out.
pub fn facts_from(json: &Value, pointers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    pointers
        .iter()
        .filter_map(|(name, pointer)| {
            let value = json.pointer(pointer)?.as_str()?;
            Some((name.clone(), value.to_string()))
        })
        .collect()
}
