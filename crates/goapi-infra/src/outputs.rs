//! Operational Outputs

use crate::error::{InfraError, InfraResult};
use crate::graph::{ResourceGraph, ResourceId, Token};
use serde::Serialize;

/// One value surfaced after provisioning
#[derive(Debug, Clone, Serialize)]
pub struct Output {
    pub name: String,
    pub description: String,
    pub value: Token,
}

/// Outputs in declaration order
#[derive(Debug, Clone, Default, Serialize)]
pub struct StackOutputs {
    outputs: Vec<Output>,
}

impl StackOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an output. Every resource its value references must be declared.
    pub fn add(
        &mut self,
        graph: &ResourceGraph,
        name: &str,
        description: &str,
        value: Token,
    ) -> InfraResult<()> {
        if let Some(missing) = value.references().into_iter().find(|id| !graph.contains(id)) {
            return Err(InfraError::UnknownReference {
                resource: ResourceId::new(name),
                target: missing.clone(),
            });
        }
        if self.get(name).is_some() {
            return Err(InfraError::DuplicateResource(ResourceId::new(name)));
        }
        self.outputs.push(Output {
            name: name.to_string(),
            description: description.to_string(),
            value,
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Output> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Output> {
        self.outputs.iter()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentConfig;
    use crate::stack;

    #[test]
    fn test_rejects_undeclared_target() {
        let graph = ResourceGraph::new();
        let mut outputs = StackOutputs::new();
        let err = outputs
            .add(&graph, "Missing", "nothing", Token::Ref(ResourceId::new("Ghost")))
            .unwrap_err();
        assert!(matches!(err, InfraError::UnknownReference { .. }));
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_service_url_scheme_follows_tls() {
        let deployment = stack::build(&DeploymentConfig::staging()).unwrap();
        let url = deployment.outputs.get("ServiceURL").unwrap();
        assert_eq!(url.value.pattern().unwrap(), "http://${LoadBalancer.DNSName}");

        let mut config = DeploymentConfig::staging();
        config.exposure.certificate_arn =
            Some("arn:aws:acm:us-east-1:069597727371:certificate/abc".into());
        let deployment = stack::build(&config).unwrap();
        let url = deployment.outputs.get("ServiceURL").unwrap();
        assert!(url.value.pattern().unwrap().starts_with("https://"));
    }

    #[test]
    fn test_all_outputs_present() {
        let deployment = stack::build(&DeploymentConfig::production()).unwrap();
        for name in [
            "LoadBalancerDNS",
            "ServiceURL",
            "FunctionName",
            "DatastoreEndpoint",
            "DatastoreSecretArn",
            "BastionInstanceId",
        ] {
            assert!(deployment.outputs.get(name).is_some(), "missing {}", name);
        }
    }
}
