//! Campaign lifecycle and statistics.

use std::sync::Arc;

use evo_state::{
    CampaignConfig, CampaignFilter, CampaignId, CampaignRecord, CampaignStatus, CampaignStore,
    EvaluationRecord, EvaluationStatus, EvaluationStore, NewCampaign, PolicyRecord, PolicyStore,
    Repository, RoundId, RoundRecord, RoundStatus, RoundStore, SelectionConfig, VariantId,
    VariantRecord, VariantStore, SELECTION_POLICY,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::selection;

/// Filters for listing one round's variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct VariantQuery {
    #[serde(default)]
    pub selected_only: bool,
    pub generation: Option<u32>,
}

impl VariantQuery {
    fn matches(&self, v: &VariantRecord) -> bool {
        (!self.selected_only || v.selected)
            && self.generation.map_or(true, |g| v.generation == g)
    }
}

/// Counts over one round's population and evaluations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStats {
    pub population: usize,
    /// Variants with at least one completed evaluation.
    pub evaluated: usize,
    pub selected: usize,
    pub evaluations_completed: usize,
    pub evaluations_failed: usize,
    /// Pending or running.
    pub evaluations_open: usize,
    pub best_fitness: Option<f64>,
    pub mean_fitness: Option<f64>,
}

/// A round with the policy it selected under and live stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundDetail {
    pub round: RoundRecord,
    pub policy: Option<PolicyRecord>,
    pub stats: RoundStats,
}

/// Aggregate counts over a campaign's rounds and variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub campaign_id: CampaignId,
    pub status: CampaignStatus,
    pub total_rounds: usize,
    pub completed_rounds: usize,
    pub total_variants: usize,
    pub total_selected: usize,
    pub max_generation: u32,
    /// `total_selected / total_variants`, 0 for an empty campaign.
    pub selection_rate: f64,
    pub best_fitness: Option<f64>,
}

/// Caller-facing campaign operations.
#[derive(Clone)]
pub struct CampaignService {
    repo: Arc<dyn Repository>,
}

impl CampaignService {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Create a draft campaign and store its selection policy as version 1.
    pub async fn create(
        &self,
        name: impl Into<String>,
        description: Option<String>,
        config: CampaignConfig,
    ) -> EngineResult<CampaignRecord> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EngineError::InvalidConfig("campaign name is empty".into()));
        }
        config.validate().map_err(EngineError::InvalidConfig)?;
        let selection = config.selection.clone();
        let campaign = self
            .repo
            .create_campaign(NewCampaign {
                name,
                description,
                config,
            })
            .await?;
        self.repo
            .append_policy(&campaign.id, SELECTION_POLICY, selection)
            .await?;
        info!(campaign_id = %campaign.id, name = %campaign.name, "campaign created");
        Ok(campaign)
    }

    pub async fn get(&self, id: &CampaignId) -> EngineResult<CampaignRecord> {
        Ok(self.repo.get_campaign(id).await?)
    }

    pub async fn list(&self, filter: CampaignFilter) -> EngineResult<Vec<CampaignRecord>> {
        Ok(self.repo.list_campaigns(filter).await?)
    }

    pub async fn start(&self, id: &CampaignId) -> EngineResult<CampaignRecord> {
        self.transition(id, CampaignStatus::Draft, CampaignStatus::Active)
            .await
    }

    pub async fn pause(&self, id: &CampaignId) -> EngineResult<CampaignRecord> {
        self.transition(id, CampaignStatus::Active, CampaignStatus::Paused)
            .await
    }

    pub async fn resume(&self, id: &CampaignId) -> EngineResult<CampaignRecord> {
        self.transition(id, CampaignStatus::Paused, CampaignStatus::Active)
            .await
    }

    pub async fn complete(&self, id: &CampaignId) -> EngineResult<CampaignRecord> {
        let current = self.repo.get_campaign(id).await?;
        self.transition(id, current.status, CampaignStatus::Completed)
            .await
    }

    pub async fn fail(&self, id: &CampaignId) -> EngineResult<CampaignRecord> {
        let current = self.repo.get_campaign(id).await?;
        self.transition(id, current.status, CampaignStatus::Failed)
            .await
    }

    /// Soft delete; the campaign and its history stay queryable by id.
    pub async fn delete(&self, id: &CampaignId) -> EngineResult<()> {
        self.repo.soft_delete_campaign(id).await?;
        info!(campaign_id = %id, "campaign deleted");
        Ok(())
    }

    async fn transition(
        &self,
        id: &CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> EngineResult<CampaignRecord> {
        let record = self.repo.transition_campaign(id, from, to).await?;
        info!(campaign_id = %id, %from, %to, "campaign status changed");
        Ok(record)
    }

    /// Append a new selection policy version, used from the next selection
    /// stage on.
    pub async fn update_selection_policy(
        &self,
        id: &CampaignId,
        config: SelectionConfig,
    ) -> EngineResult<PolicyRecord> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        let campaign = self.repo.get_campaign(id).await?;
        if campaign.status.is_terminal() {
            return Err(EngineError::InvalidConfig(format!(
                "campaign {id} is {}; its policy is frozen",
                campaign.status
            )));
        }
        let policy = self.repo.append_policy(id, SELECTION_POLICY, config).await?;
        info!(campaign_id = %id, version = policy.version, "selection policy updated");
        Ok(policy)
    }

    pub async fn policy_history(&self, id: &CampaignId) -> EngineResult<Vec<PolicyRecord>> {
        Ok(self.repo.policy_history(id, SELECTION_POLICY).await?)
    }

    /// Round `round_number` of a campaign with stats computed from what is
    /// stored now, so a round still running reports partial counts.
    pub async fn round_detail(
        &self,
        id: &CampaignId,
        round_number: u32,
    ) -> EngineResult<RoundDetail> {
        let campaign = self.repo.get_campaign_including_deleted(id).await?;
        let round = self
            .repo
            .find_round(id, round_number)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "round",
                id: format!("{id}/{round_number}"),
            })?;
        let variants = self.repo.list_variants(&round.id).await?;
        let evaluations = self.repo.list_evaluations(&round.id).await?;
        let scored = selection::aggregate(&variants, &evaluations, &campaign.config.evaluators);
        let (best_fitness, mean_fitness) = selection::fitness_summary(&scored);
        let count = |status: EvaluationStatus| {
            evaluations.iter().filter(|e| e.status == status).count()
        };
        let evaluations_completed = count(EvaluationStatus::Completed);
        let evaluations_failed = count(EvaluationStatus::Failed);

        let policy = match round.policy_id {
            Some(policy_id) => Some(self.repo.get_policy(&policy_id).await?),
            None => None,
        };

        Ok(RoundDetail {
            stats: RoundStats {
                population: variants.len(),
                evaluated: scored.iter().filter(|v| v.eligible).count(),
                selected: variants.iter().filter(|v| v.selected).count(),
                evaluations_completed,
                evaluations_failed,
                evaluations_open: evaluations.len() - evaluations_completed - evaluations_failed,
                best_fitness,
                mean_fitness,
            },
            policy,
            round,
        })
    }

    /// Variants of a round in creation order.
    pub async fn round_variants(
        &self,
        round_id: &RoundId,
        query: VariantQuery,
    ) -> EngineResult<Vec<VariantRecord>> {
        self.repo.get_round(round_id).await?;
        let mut variants = self.repo.list_variants(round_id).await?;
        variants.retain(|v| query.matches(v));
        Ok(variants)
    }

    /// Every evaluation recorded for a variant.
    pub async fn variant_evaluations(
        &self,
        variant_id: &VariantId,
    ) -> EngineResult<Vec<EvaluationRecord>> {
        self.repo.get_variant(variant_id).await?;
        Ok(self.repo.evaluations_for_variant(variant_id).await?)
    }

    pub async fn stats(&self, id: &CampaignId) -> EngineResult<CampaignStats> {
        let campaign = self.repo.get_campaign_including_deleted(id).await?;
        let rounds = self.repo.list_rounds(id).await?;
        let variants = self.repo.list_campaign_variants(id).await?;

        let total_selected = variants.iter().filter(|v| v.selected).count();
        let best_fitness = rounds
            .iter()
            .filter_map(|r| r.result.as_ref().and_then(|res| res.best_fitness))
            .fold(None, |best: Option<f64>, f| Some(best.map_or(f, |b| b.max(f))));

        Ok(CampaignStats {
            campaign_id: campaign.id,
            status: campaign.status,
            total_rounds: rounds.len(),
            completed_rounds: rounds
                .iter()
                .filter(|r| r.status == RoundStatus::Completed)
                .count(),
            total_variants: variants.len(),
            total_selected,
            max_generation: variants.iter().map(|v| v.generation).max().unwrap_or(0),
            selection_rate: if variants.is_empty() {
                0.0
            } else {
                total_selected as f64 / variants.len() as f64
            },
            best_fitness,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use evo_state::{EvaluatorSpec, MemoryRepository, SelectionStrategy};

    fn config() -> CampaignConfig {
        CampaignConfig {
            max_rounds: 2,
            variants_per_round: 3,
            evaluators: vec![EvaluatorSpec::new("quality")],
            selection: SelectionConfig::top_k(2),
            seed: Some(1),
            initial_population: vec![],
            mutation_hint: None,
        }
    }

    fn service() -> CampaignService {
        CampaignService::new(Arc::new(MemoryRepository::new()))
    }

    #[tokio::test]
    async fn create_stores_policy_version_one() {
        let svc = service();
        let c = svc.create("tune", None, config()).await.unwrap();
        assert_eq!(c.status, CampaignStatus::Draft);
        let history = svc.policy_history(&c.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].config, SelectionConfig::top_k(2));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let svc = service();
        let mut bad = config();
        bad.evaluators.clear();
        let err = svc.create("tune", None, bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(svc.list(CampaignFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_pauses_and_resumes() {
        let svc = service();
        let c = svc.create("tune", None, config()).await.unwrap();
        svc.start(&c.id).await.unwrap();
        svc.pause(&c.id).await.unwrap();
        assert_eq!(svc.get(&c.id).await.unwrap().status, CampaignStatus::Paused);
        svc.resume(&c.id).await.unwrap();
        svc.complete(&c.id).await.unwrap();

        let err = svc.resume(&c.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Ordering);
    }

    #[tokio::test]
    async fn policy_updates_append_versions() {
        let svc = service();
        let c = svc.create("tune", None, config()).await.unwrap();
        let p = svc
            .update_selection_policy(
                &c.id,
                SelectionConfig::with_strategy(SelectionStrategy::Diversity, 2),
            )
            .await
            .unwrap();
        assert_eq!(p.version, 2);
        assert_eq!(svc.policy_history(&c.id).await.unwrap().len(), 2);

        let bad = SelectionConfig::top_k(0);
        assert!(svc.update_selection_policy(&c.id, bad).await.is_err());
    }

    #[tokio::test]
    async fn stats_of_empty_campaign() {
        let svc = service();
        let c = svc.create("tune", None, config()).await.unwrap();
        let stats = svc.stats(&c.id).await.unwrap();
        assert_eq!(stats.total_rounds, 0);
        assert_eq!(stats.total_variants, 0);
        assert_eq!(stats.selection_rate, 0.0);
        assert_eq!(stats.best_fitness, None);
    }

    #[tokio::test]
    async fn round_detail_and_variant_queries() {
        use crate::capabilities::demo;
        use crate::{EngineConfig, Orchestrator, RunControl};

        let repo = Arc::new(MemoryRepository::new());
        let svc = CampaignService::new(repo.clone());
        let c = svc.create("tune", None, config()).await.unwrap();
        svc.start(&c.id).await.unwrap();
        let orch = Orchestrator::new(repo.clone(), demo::capabilities(), EngineConfig::fast());
        let result = orch
            .execute_round(&c.id, 0, RunControl::default())
            .await
            .unwrap();

        let detail = svc.round_detail(&c.id, 0).await.unwrap();
        assert_eq!(detail.round.id, result.round_id);
        assert_eq!(detail.stats.population, 3);
        assert_eq!(detail.stats.selected, 2);
        assert_eq!(detail.stats.evaluations_completed, 3);
        assert_eq!(detail.stats.evaluations_open, 0);
        assert_eq!(detail.stats.best_fitness, result.best_fitness);
        assert_eq!(detail.policy.unwrap().version, 1);

        let err = svc.round_detail(&c.id, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let all = svc
            .round_variants(&result.round_id, VariantQuery::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        let selected = svc
            .round_variants(
                &result.round_id,
                VariantQuery {
                    selected_only: true,
                    generation: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|v| v.selected));
        let later = svc
            .round_variants(
                &result.round_id,
                VariantQuery {
                    selected_only: false,
                    generation: Some(1),
                },
            )
            .await
            .unwrap();
        assert!(later.is_empty());

        let evals = svc.variant_evaluations(&selected[0].id).await.unwrap();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].evaluator_kind, "quality");
        let err = svc.variant_evaluations(&VariantId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn deleted_campaign_is_hidden_from_get() {
        let svc = service();
        let c = svc.create("tune", None, config()).await.unwrap();
        svc.delete(&c.id).await.unwrap();
        let err = svc.get(&c.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
