//! Variant lineage: creation and ancestry queries over the parent forest.
//!
//! Parent links never change after a variant is stored, so the adjacency
//! cache kept here never goes stale; it only saves repository round trips on
//! repeated walks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use evo_state::{
    CampaignId, InsertOutcome, MutationDescriptor, NewVariant, Repository, RoundId, StorageError,
    VariantId, VariantRecord, VariantStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{EngineError, EngineResult};
use crate::metrics::METRICS;

/// How two variants relate in the forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Same,
    /// The first variant is an ancestor of the second.
    Ancestor,
    /// The first variant descends from the second.
    Descendant,
    /// Same parent.
    Sibling,
    /// Common ancestor further up.
    Cousin,
    Unrelated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationKind,
    /// Lowest common ancestor, if any.
    pub common_ancestor: Option<VariantId>,
    /// Edges between the two through the common ancestor.
    pub generation_distance: Option<u32>,
}

/// Ancestry plus summary, as served by the lineage endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageView {
    pub variant_id: VariantId,
    /// Founder first.
    pub ancestry: Vec<VariantRecord>,
    pub generation_count: u32,
    pub founder_id: VariantId,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    parent_id: Option<VariantId>,
    generation: u32,
}

impl From<&VariantRecord> for Node {
    fn from(v: &VariantRecord) -> Self {
        Node {
            parent_id: v.parent_id,
            generation: v.generation,
        }
    }
}

/// Follow parent links from `id` up to the founder; returns founder first.
///
/// Takes at most `generation + 1` steps and checks the generation invariant
/// on every edge, so a corrupted store surfaces as an error instead of a loop.
pub async fn walk_ancestry<R: VariantStore + ?Sized>(
    repo: &R,
    id: &VariantId,
) -> EngineResult<Vec<VariantRecord>> {
    let start = repo.get_variant(id).await?;
    let max_steps = start.generation as usize + 1;
    let mut chain = Vec::with_capacity(max_steps);
    let mut current = start;
    loop {
        let parent_id = current.parent_id;
        let generation = current.generation;
        chain.push(current);
        match parent_id {
            None if generation == 0 => break,
            None => {
                return Err(EngineError::Invariant(format!(
                    "variant {} has no parent but generation {generation}",
                    chain[chain.len() - 1].id
                )))
            }
            Some(pid) => {
                if chain.len() >= max_steps {
                    return Err(EngineError::Invariant(format!(
                        "ancestry of {id} exceeds {max_steps} steps"
                    )));
                }
                let parent = repo.get_variant(&pid).await.map_err(|e| match e {
                    StorageError::VariantNotFound { .. } => {
                        EngineError::Invariant(format!("parent {pid} missing: {e}"))
                    }
                    other => other.into(),
                })?;
                if parent.generation + 1 != generation {
                    return Err(EngineError::Invariant(format!(
                        "variant generation {generation} does not follow parent {pid} generation {}",
                        parent.generation
                    )));
                }
                current = parent;
            }
        }
    }
    chain.reverse();
    Ok(chain)
}

/// Lineage service over a repository.
pub struct Lineage {
    repo: Arc<dyn Repository>,
    nodes: RwLock<HashMap<VariantId, Node>>,
}

impl Lineage {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    fn remember(&self, v: &VariantRecord) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert(v.id, Node::from(v));
    }

    fn cached(&self, id: &VariantId) -> Option<Node> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(id).copied()
    }

    /// Create a variant under `parent` (or a founder), deduplicating by
    /// fingerprint within the round.
    #[instrument(skip(self, parent, content, mutation), fields(round_id = %round_id))]
    pub async fn create_variant(
        &self,
        campaign_id: CampaignId,
        round_id: RoundId,
        parent: Option<&VariantRecord>,
        content: impl Into<String>,
        mutation: Option<MutationDescriptor>,
    ) -> EngineResult<InsertOutcome> {
        let new = match parent {
            Some(p) => NewVariant::child(p, round_id, content, mutation),
            None => NewVariant::founder(campaign_id, round_id, content, mutation),
        };
        let outcome = self.repo.insert_variant(new).await?;
        self.remember(&outcome.variant);
        if outcome.created {
            METRICS.inc_variants_created();
        } else {
            METRICS.inc_variants_deduplicated();
            debug!(variant_id = %outcome.variant.id, "duplicate content, reusing variant");
        }
        Ok(outcome)
    }

    /// Founder-first chain ending at `id`.
    pub async fn get_ancestry(&self, id: &VariantId) -> EngineResult<Vec<VariantRecord>> {
        let chain = walk_ancestry(self.repo.as_ref(), id).await?;
        for v in &chain {
            self.remember(v);
        }
        Ok(chain)
    }

    pub async fn lineage_view(&self, id: &VariantId) -> EngineResult<LineageView> {
        let ancestry = self.get_ancestry(id).await?;
        let founder_id = ancestry
            .first()
            .map(|v| v.id)
            .ok_or_else(|| EngineError::Invariant(format!("empty ancestry for {id}")))?;
        Ok(LineageView {
            variant_id: *id,
            generation_count: ancestry.len() as u32,
            founder_id,
            ancestry,
        })
    }

    /// Every variant whose ancestry includes `id`, shallowest first.
    pub async fn get_descendants(&self, id: &VariantId) -> EngineResult<Vec<VariantRecord>> {
        // Existence check so unknown ids are NotFound, not an empty set.
        self.repo.get_variant(id).await?;
        let mut seen: HashSet<VariantId> = HashSet::new();
        let mut queue: VecDeque<VariantId> = VecDeque::from([*id]);
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            for child in self.repo.children_of(&next).await? {
                if !seen.insert(child.id) {
                    return Err(EngineError::Invariant(format!(
                        "variant {} reached twice below {id}",
                        child.id
                    )));
                }
                self.remember(&child);
                queue.push_back(child.id);
                out.push(child);
            }
        }
        out.sort_by(|a, b| {
            a.generation
                .cmp(&b.generation)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(out)
    }

    /// Ids from `id` up to its founder, nearest first, via the cache.
    async fn chain_ids(&self, id: &VariantId) -> EngineResult<Vec<(VariantId, u32)>> {
        let mut out = Vec::new();
        let mut cursor = Some(*id);
        while let Some(cur) = cursor {
            let node = match self.cached(&cur) {
                Some(n) => n,
                None => {
                    let v = self.repo.get_variant(&cur).await?;
                    self.remember(&v);
                    Node::from(&v)
                }
            };
            if let Some((_, prev_gen)) = out.last() {
                if node.generation + 1 != *prev_gen {
                    return Err(EngineError::Invariant(format!(
                        "generation gap above {cur} while walking {id}"
                    )));
                }
            }
            out.push((cur, node.generation));
            cursor = node.parent_id;
        }
        Ok(out)
    }

    /// Relationship of `a` to `b` via their lowest common ancestor.
    pub async fn compare(&self, a: &VariantId, b: &VariantId) -> EngineResult<Relationship> {
        let chain_a = self.chain_ids(a).await?;
        let chain_b = self.chain_ids(b).await?;
        if a == b {
            return Ok(Relationship {
                kind: RelationKind::Same,
                common_ancestor: Some(*a),
                generation_distance: Some(0),
            });
        }

        let in_b: HashMap<VariantId, u32> = chain_b.iter().copied().collect();
        let gen_a = chain_a[0].1;
        let gen_b = chain_b[0].1;
        // chain_a is nearest first, so the first hit is the lowest one.
        let lca = chain_a.iter().find(|(id, _)| in_b.contains_key(id)).copied();

        let Some((lca_id, lca_gen)) = lca else {
            return Ok(Relationship {
                kind: RelationKind::Unrelated,
                common_ancestor: None,
                generation_distance: None,
            });
        };
        let distance = (gen_a - lca_gen) + (gen_b - lca_gen);
        let kind = if lca_id == *a {
            RelationKind::Ancestor
        } else if lca_id == *b {
            RelationKind::Descendant
        } else if gen_a == lca_gen + 1 && gen_b == lca_gen + 1 {
            RelationKind::Sibling
        } else {
            RelationKind::Cousin
        };
        Ok(Relationship {
            kind,
            common_ancestor: Some(lca_id),
            generation_distance: Some(distance),
        })
    }
}
