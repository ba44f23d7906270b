// Candidate lookup through the site's search page.
//
// Opens one pooled context, searches for the target's key, expands the result
// list with the ContentLoader and reads listings from the DOM. Acceptance is
// applied here so the planner only ever sees usable candidates.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::info;

use placecrawl_common::file_config::SearchConfig;
use placecrawl_common::{Candidate, Target};

use crate::browser::{BrowsingContext, ContextPool};
use crate::extractor::ListingRules;
use crate::loader::{ContentLoader, PageList};
use crate::orchestrator::PhaseSettings;
use crate::planner::{Acceptance, CandidateSource};

pub struct BrowserCandidateSource {
    pool: ContextPool,
    loader: ContentLoader,
    search: SearchConfig,
    rules: ListingRules,
    settings: PhaseSettings,
}

impl BrowserCandidateSource {
    pub fn new(
        pool: ContextPool,
        loader: ContentLoader,
        search: SearchConfig,
        settings: PhaseSettings,
    ) -> Result<Self> {
        let rules = ListingRules::compile(&search.list.item, &search.fields)?;
        Ok(Self {
            pool,
            loader,
            search,
            rules,
            settings,
        })
    }

    pub fn search_url(&self, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        self.search.url.replace("{query}", &encoded)
    }

    async fn read_listings(
        &self,
        context: &dyn BrowsingContext,
        target: &Target,
        max_count: usize,
    ) -> Result<Vec<Candidate>> {
        if !self.settings.block.is_empty() {
            context.block_resources(&self.settings.block).await?;
        }
        context.navigate(&self.search_url(&target.search_key)).await?;
        if let Some(ready) = &self.search.ready {
            if !context.wait_for(ready, self.settings.ready_timeout).await? {
                return Err(anyhow!("search results never rendered ({ready:?})"));
            }
        }

        let list = &self.search.list;
        let wanted = list.target_count.unwrap_or(max_count);
        let outcome = self
            .loader
            .expand(&PageList::new(context, list), list.max_rounds, Some(wanted))
            .await?;

        let html = context.html().await?;
        let listings = self.rules.read(&html);
        info!(
            target_id = %target.id,
            rendered = outcome.items,
            parsed = listings.len(),
            rounds = outcome.rounds,
            "Search results loaded"
        );
        Ok(listings)
    }
}

#[async_trait]
impl CandidateSource for BrowserCandidateSource {
    async fn search(
        &self,
        target: &Target,
        max_count: usize,
        acceptance: &Acceptance,
    ) -> Result<Vec<Candidate>> {
        let pooled = self.pool.acquire().await?;
        let listings = tokio::time::timeout(
            self.settings.phase_timeout,
            self.read_listings(pooled.context(), target, max_count),
        )
        .await;
        pooled.close().await;

        let listings = listings.map_err(|_| anyhow!("search timed out for {}", target.search_key))??;
        let total = listings.len();
        let accepted: Vec<Candidate> = listings
            .into_iter()
            .filter(|c| acceptance.accepts(c))
            .take(max_count)
            .collect();
        info!(
            target_id = %target.id,
            total,
            accepted = accepted.len(),
            "Candidates filtered"
        );
        Ok(accepted)
    }
}
