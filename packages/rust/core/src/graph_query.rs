//! Read-side graph views for display: the paginated full graph, the local
//! graph around one article, and the relations of one entity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use pedia_shared::{CacheConfig, Entity, EntityRelation, EntityType, Result};
use pedia_storage::Storage;

use crate::cache::{FULL_GRAPH_PREFIX, GraphCache, LOCAL_GRAPH_PREFIX};

pub const DEFAULT_FULL_GRAPH_LIMIT: u32 = 100;
pub const DEFAULT_LOCAL_GRAPH_DEPTH: u32 = 2;

const MENTIONS: &str = "mentions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Page,
    Entity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, rename = "entityType", skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
}

impl GraphNode {
    fn page(id: &str, title: &str, slug: &str) -> Self {
        Self {
            id: id.to_string(),
            label: title.to_string(),
            kind: NodeKind::Page,
            slug: Some(slug.to_string()),
            entity_type: None,
        }
    }

    fn entity(entity: &Entity) -> Self {
        Self {
            id: entity.id.clone(),
            label: entity.name.clone(),
            kind: NodeKind::Entity,
            slug: None,
            entity_type: Some(entity.entity_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphLink {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub link_type: String,
}

impl GraphLink {
    fn mentions(article_id: &str, entity_id: &str) -> Self {
        Self {
            source: article_id.to_string(),
            target: entity_id.to_string(),
            link_type: MENTIONS.to_string(),
        }
    }

    fn relation(rel: &EntityRelation) -> Self {
        Self {
            source: rel.from_entity_id.clone(),
            target: rel.to_entity_id.clone(),
            link_type: rel.relation_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
}

/// A page of the full graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullGraph {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
    /// Published articles plus entities, across all pages.
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The entity is the source of the relation.
    From,
    /// The entity is the target of the relation.
    To,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelatedEntity {
    pub direction: Direction,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub strength: f64,
    pub entity: Entity,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityRelations {
    pub entity: Option<Entity>,
    pub relations: Vec<RelatedEntity>,
}

/// Graph views over [`Storage`], cached in a [`GraphCache`].
pub struct GraphService {
    storage: Arc<Storage>,
    cache: Arc<dyn GraphCache>,
    ttl: Duration,
}

impl GraphService {
    pub fn new(storage: Arc<Storage>, cache: Arc<dyn GraphCache>, config: &CacheConfig) -> Self {
        Self {
            storage,
            cache,
            ttl: Duration::from_secs(config.graph_ttl_secs),
        }
    }

    /// One page of published articles and one page of entities, with every
    /// link whose two ends are both on the page.
    #[instrument(skip(self))]
    pub async fn full_graph(&self, limit: u32, offset: u32) -> Result<FullGraph> {
        let key = format!("{FULL_GRAPH_PREFIX}{limit}:{offset}");
        if let Some(cached) = self.cached::<FullGraph>(&key) {
            return Ok(cached);
        }

        let articles = self.storage.list_published(limit, offset).await?;
        let entities = self.storage.list_entities(limit, offset).await?;
        let pairs = self.storage.all_article_entity_pairs().await?;
        let relations = self.storage.all_relations().await?;
        let total = self.storage.count_published().await? + self.storage.count_entities().await?;

        let mut nodes: Vec<GraphNode> = articles
            .iter()
            .map(|a| GraphNode::page(&a.id, &a.title, &a.slug))
            .collect();
        nodes.extend(entities.iter().map(GraphNode::entity));

        let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let mut links: Vec<GraphLink> = pairs
            .iter()
            .filter(|(article_id, entity_id)| {
                ids.contains(article_id.as_str()) && ids.contains(entity_id.as_str())
            })
            .map(|(article_id, entity_id)| GraphLink::mentions(article_id, entity_id))
            .collect();
        links.extend(
            relations
                .iter()
                .filter(|r| {
                    ids.contains(r.from_entity_id.as_str()) && ids.contains(r.to_entity_id.as_str())
                })
                .map(GraphLink::relation),
        );

        let graph = FullGraph {
            nodes,
            links,
            total,
        };
        self.store(&key, &graph);
        Ok(graph)
    }

    /// An article, its entities and, for `depth > 1`, every relation
    /// touching those entities. Unknown articles yield an empty graph.
    #[instrument(skip(self))]
    pub async fn local_graph(&self, article_id: &str, depth: u32) -> Result<GraphData> {
        let key = format!("{LOCAL_GRAPH_PREFIX}{article_id}:{depth}");
        if let Some(cached) = self.cached::<GraphData>(&key) {
            return Ok(cached);
        }

        let Some(article) = self.storage.get_article(article_id).await? else {
            return Ok(GraphData::default());
        };

        let mentioned = self.storage.article_entities(article_id).await?;
        let entity_ids: Vec<String> = mentioned.iter().map(|ae| ae.entity.id.clone()).collect();
        let relations = if depth > 1 {
            self.storage.relations_touching(&entity_ids).await?
        } else {
            Vec::new()
        };

        let mut nodes = vec![GraphNode::page(&article.id, &article.title, &article.slug)];
        let mut seen: HashSet<String> = HashSet::from([article.id.clone()]);
        for ae in &mentioned {
            if seen.insert(ae.entity.id.clone()) {
                nodes.push(GraphNode::entity(&ae.entity));
            }
        }
        for rel in &relations {
            for endpoint in [&rel.from_entity_id, &rel.to_entity_id] {
                if seen.contains(endpoint) {
                    continue;
                }
                if let Some(entity) = self.storage.get_entity(endpoint).await? {
                    nodes.push(GraphNode::entity(&entity));
                }
                seen.insert(endpoint.clone());
            }
        }

        let mut links: Vec<GraphLink> = entity_ids
            .iter()
            .map(|entity_id| GraphLink::mentions(&article.id, entity_id))
            .collect();
        links.extend(relations.iter().map(GraphLink::relation));

        let graph = GraphData { nodes, links };
        self.store(&key, &graph);
        Ok(graph)
    }

    /// Outgoing (`from`) then incoming (`to`) relations of one entity.
    #[instrument(skip(self))]
    pub async fn entity_relations(&self, entity_id: &str) -> Result<EntityRelations> {
        let Some(entity) = self.storage.get_entity(entity_id).await? else {
            return Ok(EntityRelations {
                entity: None,
                relations: Vec::new(),
            });
        };

        let relations = self
            .storage
            .relations_touching(std::slice::from_ref(&entity.id))
            .await?;

        let mut others: HashMap<String, Entity> = HashMap::new();
        let mut outgoing = Vec::new();
        let mut incoming = Vec::new();
        for rel in relations {
            let (direction, other_id) = if rel.from_entity_id == entity.id {
                (Direction::From, rel.to_entity_id.clone())
            } else {
                (Direction::To, rel.from_entity_id.clone())
            };
            let other = match others.get(&other_id) {
                Some(e) => e.clone(),
                None => match self.storage.get_entity(&other_id).await? {
                    Some(e) => {
                        others.insert(other_id, e.clone());
                        e
                    }
                    None => continue,
                },
            };
            let related = RelatedEntity {
                direction,
                relation_type: rel.relation_type,
                strength: rel.strength,
                entity: other,
            };
            match direction {
                Direction::From => outgoing.push(related),
                Direction::To => incoming.push(related),
            }
        }
        outgoing.extend(incoming);

        Ok(EntityRelations {
            entity: Some(entity),
            relations: outgoing,
        })
    }

    fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.cache.get(key)?;
        match serde_json::from_value(value) {
            Ok(hit) => {
                debug!(%key, "graph cache hit");
                Some(hit)
            }
            Err(_) => None,
        }
    }

    fn store<T: Serialize>(&self, key: &str, value: &T) {
        if let Ok(json) = serde_json::to_value(value) {
            self.cache.set(key, json, self.ttl);
        }
    }
}
