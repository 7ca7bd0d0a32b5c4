//! In-memory storage implementation for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{Result, StoreError, TransitionError};
use crate::traits::store::{CatalogueStore, ContentStore, CrawlStore, DatasetStore, ExtractionStore};
use crate::types::{
    catalogue::Catalogue,
    extraction::{CompletionStats, CrawlPage, CrawlStep, Extraction, TokenUsage},
    item::{DataItem, Dataset},
    page::PageContent,
    recipe::Recipe,
    status::{ExtractionStatus, Lifecycle},
};

#[derive(Default)]
struct MemoryState {
    catalogues: HashMap<Uuid, Catalogue>,
    recipes: HashMap<Uuid, Recipe>,
    extractions: HashMap<Uuid, Extraction>,
    steps: HashMap<Uuid, CrawlStep>,
    pages: HashMap<Uuid, CrawlPage>,
    /// (extraction_id, url) -> page_id
    page_urls: HashMap<(Uuid, String), Uuid>,
    contents: HashMap<Uuid, PageContent>,
    datasets: HashMap<Uuid, Dataset>,
    items: HashMap<Uuid, DataItem>,
}

/// In-memory storage for the whole catalogue model.
///
/// One lock guards every table, so the check-and-insert operations
/// (`insert_page_if_absent`, `get_or_insert_child_step`,
/// `get_or_create_dataset`, `set_default_recipe`) are atomic. Data is lost
/// on restart.
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Clear all stored data.
    pub fn clear(&self) {
        *self.write() = MemoryState::default();
    }

    /// Number of crawl pages across all extractions.
    pub fn page_count(&self) -> usize {
        self.read().pages.len()
    }

    /// Number of data items across all datasets.
    pub fn item_count(&self) -> usize {
        self.read().items.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CatalogueStore for MemoryStore {
    async fn insert_catalogue(&self, catalogue: &Catalogue) -> Result<()> {
        self.write().catalogues.insert(catalogue.id, catalogue.clone());
        Ok(())
    }

    async fn get_catalogue(&self, id: Uuid) -> Result<Catalogue> {
        self.read()
            .catalogues
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("catalogue", id).into())
    }

    async fn insert_recipe(&self, recipe: &Recipe) -> Result<()> {
        let mut state = self.write();
        if !state.catalogues.contains_key(&recipe.catalogue_id) {
            return Err(StoreError::not_found("catalogue", recipe.catalogue_id).into());
        }
        let mut recipe = recipe.clone();
        // A catalogue's first recipe becomes its default
        recipe.is_default = !state
            .recipes
            .values()
            .any(|r| r.catalogue_id == recipe.catalogue_id && r.is_default);
        state.recipes.insert(recipe.id, recipe);
        Ok(())
    }

    async fn get_recipe(&self, id: Uuid) -> Result<Recipe> {
        self.read()
            .recipes
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("recipe", id).into())
    }

    async fn update_recipe(&self, recipe: &Recipe) -> Result<()> {
        let mut state = self.write();
        let stored = state
            .recipes
            .get_mut(&recipe.id)
            .ok_or_else(|| StoreError::not_found("recipe", recipe.id))?;
        let is_default = stored.is_default;
        *stored = recipe.clone();
        stored.is_default = is_default;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn list_recipes(&self, catalogue_id: Uuid) -> Result<Vec<Recipe>> {
        let mut recipes: Vec<Recipe> = self
            .read()
            .recipes
            .values()
            .filter(|r| r.catalogue_id == catalogue_id)
            .cloned()
            .collect();
        recipes.sort_by_key(|r| r.created_at);
        Ok(recipes)
    }

    async fn set_default_recipe(&self, recipe_id: Uuid) -> Result<Recipe> {
        let mut state = self.write();
        let catalogue_id = state
            .recipes
            .get(&recipe_id)
            .map(|r| r.catalogue_id)
            .ok_or_else(|| StoreError::not_found("recipe", recipe_id))?;

        let now = Utc::now();
        for recipe in state.recipes.values_mut() {
            if recipe.catalogue_id == catalogue_id {
                let is_default = recipe.id == recipe_id;
                if recipe.is_default != is_default {
                    recipe.is_default = is_default;
                    recipe.updated_at = now;
                }
            }
        }
        state
            .recipes
            .get(&recipe_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("recipe", recipe_id).into())
    }
}

#[async_trait]
impl ExtractionStore for MemoryStore {
    async fn insert_extraction(&self, extraction: &Extraction) -> Result<()> {
        let mut state = self.write();
        if !state.recipes.contains_key(&extraction.recipe_id) {
            return Err(StoreError::not_found("recipe", extraction.recipe_id).into());
        }
        state.extractions.insert(extraction.id, extraction.clone());
        Ok(())
    }

    async fn get_extraction(&self, id: Uuid) -> Result<Extraction> {
        self.read()
            .extractions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("extraction", id).into())
    }

    async fn transition_extraction(
        &self,
        id: Uuid,
        from: ExtractionStatus,
        to: ExtractionStatus,
    ) -> Result<Extraction> {
        let mut state = self.write();
        let stored = state
            .extractions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("extraction", id))?;
        if stored.status != from {
            return Err(TransitionError {
                entity: ExtractionStatus::ENTITY,
                from: format!("{:?}", stored.status),
                to: format!("{to:?}"),
            }
            .into());
        }
        stored.status = from.transition(to)?;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn set_completion_stats(&self, id: Uuid, stats: &CompletionStats) -> Result<()> {
        let mut state = self.write();
        let stored = state
            .extractions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("extraction", id))?;
        stored.completion_stats = stats.clone();
        Ok(())
    }

    async fn list_extractions(&self, status: Option<ExtractionStatus>) -> Result<Vec<Extraction>> {
        let mut extractions: Vec<Extraction> = self
            .read()
            .extractions
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        extractions.sort_by_key(|e| e.created_at);
        Ok(extractions)
    }

    async fn add_token_usage(&self, id: Uuid, usage: TokenUsage) -> Result<()> {
        let mut state = self.write();
        let extraction = state
            .extractions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("extraction", id))?;
        extraction.token_usage += usage;
        Ok(())
    }

    async fn touch_extraction(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.write();
        let extraction = state
            .extractions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("extraction", id))?;
        extraction.updated_at = extraction.updated_at.max(at);
        Ok(())
    }

    async fn delete_extraction(&self, id: Uuid) -> Result<()> {
        let mut state = self.write();
        if state.extractions.remove(&id).is_none() {
            return Err(StoreError::not_found("extraction", id).into());
        }

        let page_ids: Vec<Uuid> = state
            .pages
            .values()
            .filter(|p| p.extraction_id == id)
            .map(|p| p.id)
            .collect();
        for page_id in &page_ids {
            state.pages.remove(page_id);
            state.contents.remove(page_id);
        }
        state.page_urls.retain(|(extraction_id, _), _| *extraction_id != id);
        state.steps.retain(|_, s| s.extraction_id != id);

        let dataset_ids: Vec<Uuid> = state
            .datasets
            .values()
            .filter(|d| d.extraction_id == id)
            .map(|d| d.id)
            .collect();
        state.items.retain(|_, item| !dataset_ids.contains(&item.dataset_id));
        state.datasets.retain(|_, d| d.extraction_id != id);
        Ok(())
    }
}

#[async_trait]
impl CrawlStore for MemoryStore {
    async fn insert_step(&self, step: &CrawlStep) -> Result<()> {
        self.write().steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<CrawlStep> {
        self.read()
            .steps
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("crawl step", id).into())
    }

    async fn get_or_insert_child_step(&self, step: &CrawlStep) -> Result<CrawlStep> {
        let mut state = self.write();
        let existing = state
            .steps
            .values()
            .find(|s| {
                s.extraction_id == step.extraction_id
                    && s.parent_step_id.is_some()
                    && s.parent_step_id == step.parent_step_id
                    && s.step == step.step
            })
            .cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }
        state.steps.insert(step.id, step.clone());
        Ok(step.clone())
    }

    async fn list_steps(&self, extraction_id: Uuid) -> Result<Vec<CrawlStep>> {
        let mut steps: Vec<CrawlStep> = self
            .read()
            .steps
            .values()
            .filter(|s| s.extraction_id == extraction_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| (s.depth, s.created_at));
        Ok(steps)
    }

    async fn insert_page_if_absent(&self, page: &CrawlPage) -> Result<bool> {
        let mut state = self.write();
        let key = (page.extraction_id, page.url.clone());
        if state.page_urls.contains_key(&key) {
            return Ok(false);
        }
        state.page_urls.insert(key, page.id);
        state.pages.insert(page.id, page.clone());
        Ok(true)
    }

    async fn get_page(&self, id: Uuid) -> Result<CrawlPage> {
        self.read()
            .pages
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("crawl page", id).into())
    }

    async fn update_page(&self, page: &CrawlPage) -> Result<()> {
        let mut state = self.write();
        let stored = state
            .pages
            .get_mut(&page.id)
            .ok_or_else(|| StoreError::not_found("crawl page", page.id))?;
        if stored.url != page.url {
            return Err(StoreError::Constraint(format!("page {} URL is immutable", page.id)).into());
        }
        *stored = page.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn list_pages(&self, extraction_id: Uuid) -> Result<Vec<CrawlPage>> {
        let mut pages: Vec<CrawlPage> = self
            .read()
            .pages
            .values()
            .filter(|p| p.extraction_id == extraction_id)
            .cloned()
            .collect();
        pages.sort_by_key(|p| p.created_at);
        Ok(pages)
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put_content(&self, page_id: Uuid, content: &PageContent) -> Result<()> {
        let mut state = self.write();
        if !state.pages.contains_key(&page_id) {
            return Err(StoreError::not_found("crawl page", page_id).into());
        }
        state.contents.insert(page_id, content.clone());
        Ok(())
    }

    async fn get_content(&self, page_id: Uuid) -> Result<Option<PageContent>> {
        Ok(self.read().contents.get(&page_id).cloned())
    }
}

#[async_trait]
impl DatasetStore for MemoryStore {
    async fn get_or_create_dataset(&self, catalogue_id: Uuid, extraction_id: Uuid) -> Result<Dataset> {
        let mut state = self.write();
        if let Some(dataset) = state
            .datasets
            .values()
            .find(|d| d.extraction_id == extraction_id)
        {
            return Ok(dataset.clone());
        }
        let dataset = Dataset::new(catalogue_id, extraction_id);
        state.datasets.insert(dataset.id, dataset.clone());
        Ok(dataset)
    }

    async fn replace_items(&self, page_id: Uuid, items: &[DataItem]) -> Result<()> {
        let mut state = self.write();
        if let Some(item) = items.iter().find(|item| item.crawl_page_id != page_id) {
            return Err(StoreError::Constraint(format!(
                "item {} belongs to page {}, not {page_id}",
                item.id, item.crawl_page_id
            ))
            .into());
        }
        state.items.retain(|_, item| item.crawl_page_id != page_id);
        for item in items {
            state.items.insert(item.id, item.clone());
        }
        Ok(())
    }

    async fn list_items(&self, dataset_id: Uuid) -> Result<Vec<DataItem>> {
        let mut items: Vec<DataItem> = self
            .read()
            .items
            .values()
            .filter(|item| item.dataset_id == dataset_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::catalogue::CatalogueType;
    use crate::types::extraction::StepKind;
    use crate::types::recipe::RecipeConfiguration;

    async fn seeded() -> (MemoryStore, Catalogue, Recipe) {
        let store = MemoryStore::new();
        let catalogue = Catalogue::new("State", "https://a.edu", CatalogueType::Courses);
        store.insert_catalogue(&catalogue).await.unwrap();
        let recipe = Recipe::new(catalogue.id, "https://a.edu/courses");
        store.insert_recipe(&recipe).await.unwrap();
        (store, catalogue, recipe)
    }

    #[tokio::test]
    async fn test_first_recipe_is_default_and_default_is_exclusive() {
        let (store, catalogue, first) = seeded().await;
        let second = Recipe::new(catalogue.id, "https://a.edu/catalog");
        store.insert_recipe(&second).await.unwrap();

        assert!(store.get_recipe(first.id).await.unwrap().is_default);
        assert!(!store.get_recipe(second.id).await.unwrap().is_default);

        store.set_default_recipe(second.id).await.unwrap();
        let defaults: Vec<Uuid> = store
            .list_recipes(catalogue.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.is_default)
            .map(|r| r.id)
            .collect();
        assert_eq!(defaults, vec![second.id]);
    }

    #[tokio::test]
    async fn test_update_recipe_keeps_default_flag() {
        let (store, _, mut recipe) = seeded().await;
        recipe.is_default = false;
        recipe.failure_reason = Some("boom".to_string());
        store.update_recipe(&recipe).await.unwrap();

        let stored = store.get_recipe(recipe.id).await.unwrap();
        assert!(stored.is_default);
        assert_eq!(stored.failure_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_page_urls_are_unique_per_extraction() {
        let (store, catalogue, recipe) = seeded().await;
        let extraction = Extraction::new(catalogue.id, recipe.id);
        store.insert_extraction(&extraction).await.unwrap();
        let root = CrawlStep::root(extraction.id, RecipeConfiguration::detail());
        store.insert_step(&root).await.unwrap();

        assert!(store
            .insert_page_if_absent(&CrawlPage::new(&root, "https://a.edu/1"))
            .await
            .unwrap());
        assert!(!store
            .insert_page_if_absent(&CrawlPage::new(&root, "https://a.edu/1"))
            .await
            .unwrap());

        let other = Extraction::new(catalogue.id, recipe.id);
        store.insert_extraction(&other).await.unwrap();
        let other_root = CrawlStep::root(other.id, RecipeConfiguration::detail());
        assert!(store
            .insert_page_if_absent(&CrawlPage::new(&other_root, "https://a.edu/1"))
            .await
            .unwrap());
        assert_eq!(store.page_count(), 2);
    }

    #[tokio::test]
    async fn test_child_step_is_shared_per_parent_and_kind() {
        let store = MemoryStore::new();
        let root = CrawlStep::root(Uuid::new_v4(), RecipeConfiguration::detail());
        store.insert_step(&root).await.unwrap();

        let first = store
            .get_or_insert_child_step(&root.child(StepKind::FetchLinks, RecipeConfiguration::detail()))
            .await
            .unwrap();
        let again = store
            .get_or_insert_child_step(&root.child(StepKind::FetchLinks, RecipeConfiguration::detail()))
            .await
            .unwrap();
        let paginated = store
            .get_or_insert_child_step(&root.child(StepKind::FetchPaginated, RecipeConfiguration::detail()))
            .await
            .unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, paginated.id);
        assert_eq!(store.list_steps(root.extraction_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_token_usage_accumulates_and_survives_transitions() {
        let (store, catalogue, recipe) = seeded().await;
        let extraction = Extraction::new(catalogue.id, recipe.id);
        store.insert_extraction(&extraction).await.unwrap();

        store.add_token_usage(extraction.id, TokenUsage::new(10, 2)).await.unwrap();
        store.add_token_usage(extraction.id, TokenUsage::new(5, 1)).await.unwrap();
        store
            .transition_extraction(extraction.id, ExtractionStatus::Waiting, ExtractionStatus::InProgress)
            .await
            .unwrap();

        let stored = store.get_extraction(extraction.id).await.unwrap();
        assert_eq!(stored.token_usage, TokenUsage::new(15, 3));
        assert_eq!(stored.status, ExtractionStatus::InProgress);
    }

    #[tokio::test]
    async fn test_transition_checks_the_stored_status() {
        let (store, catalogue, recipe) = seeded().await;
        let extraction = Extraction::new(catalogue.id, recipe.id);
        store.insert_extraction(&extraction).await.unwrap();

        let started = store
            .transition_extraction(extraction.id, ExtractionStatus::Waiting, ExtractionStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(started.status, ExtractionStatus::InProgress);
        store
            .transition_extraction(extraction.id, ExtractionStatus::InProgress, ExtractionStatus::Cancelled)
            .await
            .unwrap();

        // A caller still holding InProgress loses
        let err = store
            .transition_extraction(extraction.id, ExtractionStatus::InProgress, ExtractionStatus::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Transition(_)));
        // Illegal even when the stored status matches
        assert!(store
            .transition_extraction(extraction.id, ExtractionStatus::Cancelled, ExtractionStatus::Complete)
            .await
            .is_err());
        assert_eq!(
            store.get_extraction(extraction.id).await.unwrap().status,
            ExtractionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_completion_stats_leave_status_alone() {
        let (store, catalogue, recipe) = seeded().await;
        let extraction = Extraction::new(catalogue.id, recipe.id);
        store.insert_extraction(&extraction).await.unwrap();
        let root = CrawlStep::root(extraction.id, RecipeConfiguration::detail());
        let stats = CompletionStats::compute(&[root], &[]);

        store
            .transition_extraction(extraction.id, ExtractionStatus::Waiting, ExtractionStatus::InProgress)
            .await
            .unwrap();
        store.set_completion_stats(extraction.id, &stats).await.unwrap();

        let stored = store.get_extraction(extraction.id).await.unwrap();
        assert_eq!(stored.status, ExtractionStatus::InProgress);
        assert_eq!(stored.completion_stats.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_extraction_cascades() {
        let (store, catalogue, recipe) = seeded().await;
        let extraction = Extraction::new(catalogue.id, recipe.id);
        store.insert_extraction(&extraction).await.unwrap();
        let root = CrawlStep::root(extraction.id, RecipeConfiguration::detail());
        store.insert_step(&root).await.unwrap();
        let page = CrawlPage::new(&root, "https://a.edu/1");
        store.insert_page_if_absent(&page).await.unwrap();
        store
            .put_content(page.id, &PageContent::new(&page.url, "# Course"))
            .await
            .unwrap();
        let dataset = store.get_or_create_dataset(catalogue.id, extraction.id).await.unwrap();
        let item = DataItem {
            id: Uuid::new_v4(),
            dataset_id: dataset.id,
            crawl_page_id: page.id,
            entity_type: "Course".to_string(),
            fields: Default::default(),
            text_inclusion: Default::default(),
            verified: true,
            created_at: Utc::now(),
        };
        store.replace_items(page.id, &[item]).await.unwrap();
        assert_eq!(store.item_count(), 1);

        store.delete_extraction(extraction.id).await.unwrap();

        assert_eq!(store.page_count(), 0);
        assert_eq!(store.item_count(), 0);
        assert!(store.get_content(page.id).await.unwrap().is_none());
        assert!(store.list_steps(extraction.id).await.unwrap().is_empty());
        assert!(store.get_extraction(extraction.id).await.is_err());
        assert!(store.insert_page_if_absent(&page).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_items_swaps_a_pages_items() {
        let store = MemoryStore::new();
        let dataset = store
            .get_or_create_dataset(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        let page_id = Uuid::new_v4();
        let item = |name: &str| DataItem {
            id: Uuid::new_v4(),
            dataset_id: dataset.id,
            crawl_page_id: page_id,
            entity_type: "Course".to_string(),
            fields: serde_json::json!({ "name": name })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            text_inclusion: Default::default(),
            verified: true,
            created_at: Utc::now(),
        };

        store.replace_items(page_id, &[item("a"), item("b")]).await.unwrap();
        store.replace_items(page_id, &[item("c")]).await.unwrap();

        let items = store.list_items(dataset.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].fields["name"], "c");
    }
}
