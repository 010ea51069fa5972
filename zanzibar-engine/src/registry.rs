use crate::{
    error::{Result, ZanzibarError},
    models::{RelationTuple, UserRef},
    rewrite::UsersetExpression,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Stored configuration of a namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    pub relations: Vec<RelationConfig>,
}

/// Stored configuration of a relation; `rewrite_rules` is the JSON payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationConfig {
    pub name: String,
    #[serde(default)]
    pub rewrite_rules: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RelationConfig {
    pub fn new(name: &str, rewrite_rules: &str) -> Self {
        Self {
            name: name.to_string(),
            rewrite_rules: rewrite_rules.to_string(),
            description: None,
        }
    }
}

const THIS: &str = r#"{"union": {"child": [{"_this": {}}]}}"#;

impl NamespaceConfig {
    pub fn new(name: &str, relations: Vec<RelationConfig>) -> Self {
        Self {
            name: name.to_string(),
            relations,
        }
    }

    /// Seed namespaces: documents, folders, groups and organizations
    pub fn default_namespaces() -> Vec<NamespaceConfig> {
        vec![
            NamespaceConfig::new(
                "documents",
                vec![
                    RelationConfig::new("owner", THIS),
                    RelationConfig::new(
                        "editor",
                        r#"{"union": {"child": [{"_this": {}}, {"computed_userset": {"relation": "owner"}}]}}"#,
                    ),
                    RelationConfig::new(
                        "viewer",
                        r#"{"union": {"child": [{"_this": {}}, {"computed_userset": {"relation": "editor"}}]}}"#,
                    ),
                    RelationConfig::new("parent", THIS),
                ],
            ),
            NamespaceConfig::new(
                "folders",
                vec![
                    RelationConfig::new("owner", THIS),
                    RelationConfig::new(
                        "editor",
                        r#"{"union": {"child": [{"_this": {}}, {"computed_userset": {"relation": "owner"}}]}}"#,
                    ),
                    RelationConfig::new(
                        "viewer",
                        r#"{"union": {"child": [{"_this": {}}, {"computed_userset": {"relation": "editor"}}, {"tuple_to_userset": {"tupleset": {"relation": "parent"}, "computed_userset": {"relation": "viewer"}}}]}}"#,
                    ),
                    RelationConfig::new("parent", THIS),
                ],
            ),
            NamespaceConfig::new(
                "groups",
                vec![
                    RelationConfig::new(
                        "member",
                        r#"{"union": {"child": [{"_this": {}}, {"tuple_to_userset": {"tupleset": {"relation": "parent"}, "computed_userset": {"relation": "member"}}}]}}"#,
                    ),
                    RelationConfig::new("admin", THIS),
                    RelationConfig::new("parent", THIS),
                ],
            ),
            NamespaceConfig::new(
                "organizations",
                vec![
                    RelationConfig::new("member", THIS),
                    RelationConfig::new(
                        "admin",
                        r#"{"union": {"child": [{"_this": {}}, {"computed_userset": {"relation": "owner"}}]}}"#,
                    ),
                    RelationConfig::new("owner", THIS),
                ],
            ),
        ]
    }
}

/// Source of namespace configurations
#[async_trait]
pub trait NamespaceConfigStore: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<NamespaceConfig>;

    async fn list_namespaces(&self) -> Result<Vec<String>>;
}

/// In-memory namespace configuration store for testing and development
#[derive(Default)]
pub struct InMemoryNamespaceStore {
    namespaces: DashMap<String, NamespaceConfig>,
}

impl InMemoryNamespaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespaces(configs: Vec<NamespaceConfig>) -> Self {
        let store = Self::new();
        for config in configs {
            store.put(config);
        }
        store
    }

    pub fn put(&self, config: NamespaceConfig) {
        self.namespaces.insert(config.name.clone(), config);
    }
}

#[async_trait]
impl NamespaceConfigStore for InMemoryNamespaceStore {
    async fn get_namespace(&self, name: &str) -> Result<NamespaceConfig> {
        self.namespaces
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ZanzibarError::NamespaceNotFound(name.to_string()))
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }
}

/// A namespace with every rewrite rule parsed
#[derive(Debug, Clone)]
pub struct CompiledNamespace {
    pub name: String,
    relations: Vec<(String, UsersetExpression)>,
}

impl CompiledNamespace {
    fn compile(config: &NamespaceConfig) -> Result<Self> {
        if config.name.is_empty() || config.name.contains([':', '#', '@']) {
            return Err(ZanzibarError::Configuration(format!(
                "invalid namespace name '{}'",
                config.name
            )));
        }

        let names: Vec<&str> = config.relations.iter().map(|r| r.name.as_str()).collect();
        let mut relations = Vec::with_capacity(config.relations.len());

        for (index, relation) in config.relations.iter().enumerate() {
            if names.iter().take(index).any(|n| *n == relation.name) {
                return Err(ZanzibarError::invalid_rule(
                    &config.name,
                    &relation.name,
                    "duplicate relation",
                ));
            }
            let expression = UsersetExpression::parse(
                &config.name,
                &relation.name,
                &relation.rewrite_rules,
                &names,
            )?;
            relations.push((relation.name.clone(), expression));
        }

        Ok(Self {
            name: config.name.clone(),
            relations,
        })
    }

    pub fn relation(&self, relation: &str) -> Option<&UsersetExpression> {
        self.relations
            .iter()
            .find(|(name, _)| name == relation)
            .map(|(_, expression)| expression)
    }

    /// Relation names in declaration order.
    pub fn relation_names(&self) -> impl Iterator<Item = &str> {
        self.relations.iter().map(|(name, _)| name.as_str())
    }
}

/// One immutable version of every namespace
#[derive(Debug)]
pub struct RegistrySnapshot {
    version: u64,
    namespaces: HashMap<String, CompiledNamespace>,
}

impl RegistrySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn namespace(&self, namespace: &str) -> Result<&CompiledNamespace> {
        self.namespaces
            .get(namespace)
            .ok_or_else(|| ZanzibarError::NamespaceNotFound(namespace.to_string()))
    }

    /// Rewrite rule of `namespace#relation`
    pub fn resolve(&self, namespace: &str, relation: &str) -> Result<&UsersetExpression> {
        self.namespace(namespace)?
            .relation(relation)
            .ok_or_else(|| ZanzibarError::relation_not_found(namespace, relation))
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &CompiledNamespace> {
        self.namespaces.values()
    }

    /// Checks that a tuple names a configured namespace and relation
    pub fn validate_tuple(&self, tuple: &RelationTuple) -> Result<()> {
        let namespace = self.namespaces.get(&tuple.namespace).ok_or_else(|| {
            ZanzibarError::InvalidTuple(format!("Unknown namespace: {}", tuple.namespace))
        })?;

        if namespace.relation(&tuple.relation).is_none() {
            return Err(ZanzibarError::InvalidTuple(format!(
                "Unknown relation '{}' for namespace '{}'",
                tuple.relation, tuple.namespace
            )));
        }

        match &tuple.user {
            UserRef::User(_) => {}
            UserRef::Object(object) => {
                if !self.namespaces.contains_key(&object.namespace) {
                    return Err(ZanzibarError::InvalidTuple(format!(
                        "Object '{}' names unknown namespace",
                        tuple.user
                    )));
                }
            }
            UserRef::Userset { object, relation } => {
                let known = self
                    .namespaces
                    .get(&object.namespace)
                    .is_some_and(|target| target.relation(relation).is_some());
                if !known {
                    return Err(ZanzibarError::InvalidTuple(format!(
                        "Userset '{}' names unknown namespace or relation",
                        tuple.user
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Holds the current namespace configuration and swaps it as a whole on
/// reload. Readers take an `Arc` snapshot and keep using it for the rest
/// of their request.
pub struct NamespaceRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl NamespaceRegistry {
    pub fn new(configs: &[NamespaceConfig]) -> Result<Self> {
        let snapshot = Self::compile(configs, 1)?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Registry holding the seed namespaces
    pub fn with_defaults() -> Result<Self> {
        Self::new(&NamespaceConfig::default_namespaces())
    }

    pub async fn load_from_store(store: &dyn NamespaceConfigStore) -> Result<Self> {
        let configs = Self::fetch_all(store).await?;
        Self::new(&configs)
    }

    fn compile(configs: &[NamespaceConfig], version: u64) -> Result<RegistrySnapshot> {
        let mut namespaces = HashMap::with_capacity(configs.len());
        for config in configs {
            let compiled = CompiledNamespace::compile(config)?;
            if namespaces.insert(config.name.clone(), compiled).is_some() {
                return Err(ZanzibarError::Configuration(format!(
                    "namespace '{}' configured twice",
                    config.name
                )));
            }
        }
        Ok(RegistrySnapshot {
            version,
            namespaces,
        })
    }

    async fn fetch_all(store: &dyn NamespaceConfigStore) -> Result<Vec<NamespaceConfig>> {
        let mut configs = Vec::new();
        for name in store.list_namespaces().await? {
            configs.push(store.get_namespace(&name).await?);
        }
        Ok(configs)
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    pub fn resolve(&self, namespace: &str, relation: &str) -> Result<UsersetExpression> {
        self.snapshot().resolve(namespace, relation).cloned()
    }

    /// Replaces every namespace at once. A malformed config leaves the
    /// current version in place and consumes no version number.
    pub fn reload(&self, configs: &[NamespaceConfig]) -> Result<u64> {
        let mut snapshot = Self::compile(configs, 0)?;
        let version = {
            let mut current = self.current.write();
            snapshot.version = current.version + 1;
            let version = snapshot.version;
            *current = Arc::new(snapshot);
            version
        };
        info!(version, namespaces = configs.len(), "Namespace registry reloaded");
        Ok(version)
    }

    pub async fn reload_from_store(&self, store: &dyn NamespaceConfigStore) -> Result<u64> {
        let configs = Self::fetch_all(store).await?;
        self.reload(&configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_namespaces_compile() {
        let registry = NamespaceRegistry::with_defaults().unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.version(), 1);
        assert!(snapshot.resolve("folders", "viewer").is_ok());
        assert_eq!(
            snapshot.resolve("documents", "owner").unwrap(),
            &UsersetExpression::Union(vec![UsersetExpression::This])
        );
    }

    #[test]
    fn test_resolve_errors() {
        let registry = NamespaceRegistry::with_defaults().unwrap();
        assert!(matches!(
            registry.resolve("patients", "viewer"),
            Err(ZanzibarError::NamespaceNotFound(_))
        ));
        assert!(matches!(
            registry.resolve("documents", "approver"),
            Err(ZanzibarError::RelationNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_config_fails_at_load() {
        let configs = vec![NamespaceConfig::new(
            "documents",
            vec![RelationConfig::new(
                "viewer",
                r#"{"computed_userset": {"relation": "editor"}}"#,
            )],
        )];
        assert!(matches!(
            NamespaceRegistry::new(&configs),
            Err(ZanzibarError::InvalidRewriteRule { .. })
        ));

        let duplicated = vec![NamespaceConfig::new(
            "documents",
            vec![RelationConfig::new("owner", ""), RelationConfig::new("owner", "")],
        )];
        assert!(NamespaceRegistry::new(&duplicated).is_err());
    }

    #[test]
    fn test_reload_swaps_whole_snapshot() {
        let registry = NamespaceRegistry::with_defaults().unwrap();
        let before = registry.snapshot();

        let version = registry
            .reload(&[NamespaceConfig::new(
                "projects",
                vec![RelationConfig::new("member", "")],
            )])
            .unwrap();
        assert_eq!(version, 2);

        // The old snapshot is still intact for in-flight readers.
        assert!(before.resolve("documents", "viewer").is_ok());
        assert!(registry.resolve("documents", "viewer").is_err());
        assert!(registry.resolve("projects", "member").is_ok());

        // A failing reload keeps the current version.
        let bad = NamespaceConfig::new("broken", vec![RelationConfig::new("x", "{")]);
        assert!(registry.reload(&[bad]).is_err());
        assert_eq!(registry.snapshot().version(), 2);

        let version = registry
            .reload(&NamespaceConfig::default_namespaces())
            .unwrap();
        assert_eq!(version, 3);
        assert_eq!(registry.snapshot().version(), 3);
    }

    #[test]
    fn test_concurrent_reloads_publish_in_version_order() {
        let registry = Arc::new(NamespaceRegistry::with_defaults().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| registry.reload(&NamespaceConfig::default_namespaces()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut versions: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        versions.sort_unstable();
        assert_eq!(versions, (2..=201).collect::<Vec<u64>>());
        assert_eq!(registry.snapshot().version(), 201);
    }

    #[test]
    fn test_validate_tuple() {
        let snapshot = NamespaceRegistry::with_defaults().unwrap().snapshot();
        let tuple = RelationTuple::new("documents", "doc1", "owner", UserRef::user("alice"));
        assert!(snapshot.validate_tuple(&tuple).is_ok());

        let invalid = RelationTuple::new("documents", "doc1", "approver", UserRef::user("alice"));
        assert!(snapshot.validate_tuple(&invalid).is_err());

        let bad_userset = RelationTuple::new(
            "documents",
            "doc1",
            "viewer",
            UserRef::userset("groups", "eng", "lead"),
        );
        assert!(snapshot.validate_tuple(&bad_userset).is_err());

        let foreign_userset = RelationTuple::new(
            "documents",
            "doc1",
            "viewer",
            UserRef::userset("teams", "core", "member"),
        );
        assert!(snapshot.validate_tuple(&foreign_userset).is_err());

        let foreign_parent =
            RelationTuple::new("folders", "child", "parent", UserRef::object("drives", "d1"));
        assert!(snapshot.validate_tuple(&foreign_parent).is_err());

        let parent = RelationTuple::new("folders", "child", "parent", UserRef::object("folders", "root"));
        assert!(snapshot.validate_tuple(&parent).is_ok());
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = InMemoryNamespaceStore::with_namespaces(NamespaceConfig::default_namespaces());
        let registry = NamespaceRegistry::load_from_store(&store).await.unwrap();
        assert!(registry.resolve("groups", "member").is_ok());

        store.put(NamespaceConfig::new(
            "projects",
            vec![RelationConfig::new("member", "")],
        ));
        registry.reload_from_store(&store).await.unwrap();
        assert!(registry.resolve("projects", "member").is_ok());
        assert!(registry.resolve("groups", "member").is_ok());
    }
}
