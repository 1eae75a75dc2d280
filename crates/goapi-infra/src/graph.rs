//! Resource Graph
//!
//! Append-only dependency graph of declared resources. Each node is an
//! immutable value; edges are derived from the reference tokens embedded in
//! its properties plus any explicit ordering dependencies. A node can only
//! reference nodes declared before it, so declaration order is always a
//! valid topological order and cycles cannot be expressed.

use crate::error::{InfraError, InfraResult};
use crate::resources::ResourceKind;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Logical resource identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A property value: either a literal or a reference resolved by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Literal(String),
    /// Primary identifier of a resource
    Ref(ResourceId),
    /// Named attribute of a resource
    GetAtt(ResourceId, String),
    /// Concatenation of parts
    Join(Vec<Token>),
}

impl Token {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn join(parts: impl IntoIterator<Item = Token>) -> Self {
        Self::Join(parts.into_iter().collect())
    }

    /// Resources this token points at
    pub fn references(&self) -> Vec<&ResourceId> {
        match self {
            Self::Literal(_) => Vec::new(),
            Self::Ref(id) | Self::GetAtt(id, _) => vec![id],
            Self::Join(parts) => parts.iter().flat_map(Token::references).collect(),
        }
    }

    /// String shape of the token with references rendered as `${id}`.
    ///
    /// Returns `None` for a bare reference, whose shape is only known to the
    /// engine.
    pub fn pattern(&self) -> Option<String> {
        match self {
            Self::Literal(s) => Some(s.clone()),
            Self::Ref(_) | Self::GetAtt(..) => None,
            Self::Join(parts) => Some(
                parts
                    .iter()
                    .map(|p| match p {
                        Self::Ref(id) => format!("${{{}}}", id),
                        Self::GetAtt(id, attr) => format!("${{{}.{}}}", id, attr),
                        other => other.pattern().unwrap_or_default(),
                    })
                    .collect(),
            ),
        }
    }

    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Self::Literal(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Literal(s) => serializer.serialize_str(s),
            Self::Ref(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Ref", id.as_str())?;
                map.end()
            }
            Self::GetAtt(id, attr) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Fn::GetAtt", &[id.as_str(), attr.as_str()])?;
                map.end()
            }
            Self::Join(parts) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Fn::Join", &("", parts))?;
                map.end()
            }
        }
    }
}

/// Handle to a declared resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    id: ResourceId,
}

impl ResourceRef {
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// `Ref` token for this resource
    pub fn token(&self) -> Token {
        Token::Ref(self.id.clone())
    }

    /// `GetAtt` token for one of this resource's attributes
    pub fn attr(&self, name: &str) -> Token {
        Token::GetAtt(self.id.clone(), name.to_string())
    }
}

/// What the engine does with a resource's data when it is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    Delete,
    Retain,
    Snapshot,
}

/// A resource waiting to be added to the graph
#[derive(Debug, Clone)]
pub struct Declaration {
    id: ResourceId,
    kind: ResourceKind,
    depends_on: Vec<ResourceId>,
    deletion_policy: Option<DeletionPolicy>,
}

impl Declaration {
    pub fn new(id: impl Into<String>, kind: impl Into<ResourceKind>) -> Self {
        Self {
            id: ResourceId::new(id),
            kind: kind.into(),
            depends_on: Vec::new(),
            deletion_policy: None,
        }
    }

    /// Add an ordering-only dependency
    pub fn depends_on(mut self, resource: &ResourceRef) -> Self {
        self.depends_on.push(resource.id.clone());
        self
    }

    pub fn deletion_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self
    }
}

/// Declared resource node
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    /// Rendered properties
    pub properties: serde_json::Value,
    /// Resources referenced from the properties
    pub references: BTreeSet<ResourceId>,
    /// Ordering-only dependencies
    pub depends_on: BTreeSet<ResourceId>,
    pub deletion_policy: Option<DeletionPolicy>,
}

impl Resource {
    /// Every resource this node must be created after
    pub fn dependencies(&self) -> BTreeSet<&ResourceId> {
        self.references.iter().chain(self.depends_on.iter()).collect()
    }
}

/// Append-only resource graph
#[derive(Debug, Default)]
pub struct ResourceGraph {
    resources: Vec<Resource>,
    index: HashMap<ResourceId, usize>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource. Every referenced resource must already be declared.
    pub fn declare(&mut self, declaration: Declaration) -> InfraResult<ResourceRef> {
        let Declaration {
            id,
            kind,
            depends_on,
            deletion_policy,
        } = declaration;

        if self.index.contains_key(&id) {
            return Err(InfraError::DuplicateResource(id));
        }

        let properties = kind.properties()?;
        let mut references = BTreeSet::new();
        collect_references(&properties, &mut references);

        for target in references.iter().chain(depends_on.iter()) {
            if !self.index.contains_key(target) {
                return Err(InfraError::UnknownReference {
                    resource: id,
                    target: target.clone(),
                });
            }
        }

        tracing::debug!(
            resource = %id,
            kind = kind.type_name(),
            edges = references.len() + depends_on.len(),
            "declared resource"
        );

        self.index.insert(id.clone(), self.resources.len());
        self.resources.push(Resource {
            id: id.clone(),
            kind,
            properties,
            references,
            depends_on: depends_on.into_iter().collect(),
            deletion_policy,
        });

        Ok(ResourceRef { id })
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Resources in declaration order (a valid creation order)
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources whose type matches `type_name`
    pub fn of_type<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources
            .iter()
            .filter(move |r| r.kind.type_name() == type_name)
    }

    /// Resources that directly depend on `id`
    pub fn dependents(&self, id: &ResourceId) -> Vec<&Resource> {
        self.resources
            .iter()
            .filter(|r| r.dependencies().contains(id))
            .collect()
    }

    /// Whether `to` is reachable from `from` along dependency edges
    pub fn depends_transitively(&self, from: &ResourceId, to: &ResourceId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(resource) = self.get(current) else {
                continue;
            };
            for dep in resource.dependencies() {
                if dep == to {
                    return true;
                }
                stack.push(dep);
            }
        }
        false
    }
}

fn collect_references(value: &serde_json::Value, out: &mut BTreeSet<ResourceId>) {
    match value {
        serde_json::Value::Object(map) => {
            if map.len() == 1 {
                if let Some(serde_json::Value::String(id)) = map.get("Ref") {
                    out.insert(ResourceId::new(id.as_str()));
                    return;
                }
                if let Some(serde_json::Value::Array(parts)) = map.get("Fn::GetAtt") {
                    if let Some(serde_json::Value::String(id)) = parts.first() {
                        out.insert(ResourceId::new(id.as_str()));
                    }
                    return;
                }
            }
            for v in map.values() {
                collect_references(v, out);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                collect_references(v, out);
            }
        }
        _ => {}
    }
}
