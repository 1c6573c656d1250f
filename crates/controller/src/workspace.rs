//! The Workspace custom resource, reduced to the fields this controller
//! reads and writes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "portgate.dev",
    version = "v1alpha1",
    kind = "Workspace",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Declared port exposures; at most one rule per name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkRule>,
}

/// One named, user-declared exposure of a workspace port.
///
/// Private rules (`public == false`) get their advertised target port
/// rewritten to an authenticating proxy's local port; public rules are
/// left pointing at the real workload port.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRule {
    pub name: String,
    /// Real workload port.
    pub port_number: i32,
    /// Advertised port downstream Services and Ingresses route to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port_number: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub public: bool,
}

impl NetworkRule {
    /// Effective target port: the real port for public rules and for
    /// rules with no (or a zero) target set.
    pub fn target_port_number(&self) -> i32 {
        if self.public {
            return self.port_number;
        }
        match self.target_port_number {
            Some(port) if port != 0 => port,
            _ => self.port_number,
        }
    }

    pub fn http_path(&self) -> &str {
        self.http_path
            .as_deref()
            .filter(|path| !path.is_empty())
            .unwrap_or("/")
    }

    pub fn group(&self) -> &str {
        self.group
            .as_deref()
            .filter(|group| !group.is_empty())
            .unwrap_or(&self.name)
    }
}
