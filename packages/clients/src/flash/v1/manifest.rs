//! The deployment manifest for Flash (pre-deployed) endpoints.
//!
//! The manifest maps function names to the module that defines them and the
//! resource (endpoint) that hosts them. A freshly built manifest carries no
//! `endpoint_url`s; those are populated when the manifest is refreshed from
//! the state manager.

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::bail};
use serde::{Deserialize, Serialize};

/// A single deployable function within a resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionEntry {
    pub name: String,

    /// Import path of the module defining the function.
    pub module: String,

    #[serde(default)]
    pub is_async: bool,

    #[serde(default)]
    pub is_class: bool,
}

/// A deployed resource: one logical endpoint and the functions it serves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_type: String,

    /// Absent in a freshly built manifest; populated by state-manager
    /// refresh once the endpoint has been provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,

    #[serde(default)]
    pub functions: Vec<FunctionEntry>,
}

/// The deployment manifest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub resources: BTreeMap<String, Resource>,

    /// Function name to resource name.
    #[serde(default)]
    pub function_registry: BTreeMap<String, String>,
}

impl Manifest {
    /// Look up the resource that hosts `function_name`.
    pub fn resource_for(&self, function_name: &str) -> Option<(&str, &Resource)> {
        let resource_name = self.function_registry.get(function_name)?;
        let resource = self.resources.get(resource_name)?;
        Some((resource_name.as_str(), resource))
    }

    /// Look up the function entry for `function_name` within its resource.
    pub fn function_entry(&self, function_name: &str) -> Option<&FunctionEntry> {
        let (_, resource) = self.resource_for(function_name)?;
        resource.functions.iter().find(|f| f.name == function_name)
    }

    /// Check the registry invariant: the set of function names in
    /// `function_registry` equals the union of function names across all
    /// resources.
    pub fn validate(&self) -> Result<()> {
        for (name, resource_name) in &self.function_registry {
            let Some(resource) = self.resources.get(resource_name) else {
                bail!("registry maps '{name}' to unknown resource '{resource_name}'");
            };
            if !resource.functions.iter().any(|f| &f.name == name) {
                bail!("function '{name}' registered to resource '{resource_name}' but not listed in it");
            }
        }
        for (resource_name, resource) in &self.resources {
            for function in &resource.functions {
                if self.function_registry.get(&function.name) != Some(resource_name) {
                    bail!(
                        "function '{}' listed in resource '{resource_name}' but not registered to it",
                        function.name,
                    );
                }
            }
        }
        Ok(())
    }
}
