//! The resolver façade (component C6): the public entry point. Owns
//! the agent registry, the cache, and a 16-bit transaction-ID
//! allocator with collision avoidance against the active-query table;
//! exposes both an asynchronous `resolve` and a blocking
//! `resolve_sync` built on top of it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dns_types::protocol::types::{Message, Question};

use crate::agent::{AgentParams, Strategy, Transport};
use crate::cache::{Cache, CacheConfig};
use crate::error::ResolverResult;
use crate::query;

/// Builds a [`Resolver`] from a set of upstream agents and a cache
/// configuration. Server-selection strategy and initial transport are
/// not configured here - §4.5 makes the strategy "mode chosen per
/// query," so they are arguments to `resolve`/`resolve_with_callback`
/// instead of being frozen at build time.
#[derive(Debug, Default)]
pub struct ResolverBuilder {
    agents: Vec<AgentParams>,
    cache_config: CacheConfig,
}

impl ResolverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn agent(mut self, agent: AgentParams) -> Self {
        self.agents.push(agent);
        self
    }

    #[must_use]
    pub fn agents(mut self, agents: impl IntoIterator<Item = AgentParams>) -> Self {
        self.agents.extend(agents);
        self
    }

    #[must_use]
    pub fn cache_config(mut self, cache_config: CacheConfig) -> Self {
        self.cache_config = cache_config;
        self
    }

    pub fn build(self) -> Resolver {
        Resolver {
            agents: self.agents,
            cache: Cache::new(self.cache_config),
            next_id: AtomicU16::new(0),
            active_ids: Arc::new(Mutex::new(HashSet::new())),
            round_robin_counter: AtomicU64::new(0),
        }
    }
}

/// Resolves questions against a configured set of upstream agents (or,
/// under `Strategy::Iterative`, by walking the delegation chain from
/// those agents as roots), consulting and populating a shared cache.
pub struct Resolver {
    agents: Vec<AgentParams>,
    cache: Cache,
    next_id: AtomicU16,
    active_ids: Arc<Mutex<HashSet<u16>>>,
    round_robin_counter: AtomicU64,
}

impl Resolver {
    pub fn builder() -> ResolverBuilder {
        ResolverBuilder::new()
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Resolve `question` using `strategy` to pick the agent(s) to
    /// ask (for `Strategy::Named`, this is where a caller supplies the
    /// optional named agent), starting each agent attempt on
    /// `initial_transport`. Consults the cache first (the default
    /// cache-first policy) and falls back to a live query, caching
    /// every learned record from a successful response before
    /// returning it. Matches §6's resolve signature `(question,
    /// completion-callback, initial-transport, strategy,
    /// optional-named-agent)`: this `async fn`'s own completion *is*
    /// the completion-callback for this entry point, with
    /// `resolve_with_callback` below providing an explicit callback
    /// for non-async callers.
    pub async fn resolve(
        &self,
        question: Question,
        strategy: Strategy,
        initial_transport: Transport,
    ) -> ResolverResult<Message> {
        let _span = tracing::error_span!("resolve", name = %question.name, qtype = %question.qtype).entered();

        if let Some(cached) = self.answer_from_cache(&question) {
            tracing::trace!("cache HIT");
            return Ok(cached);
        }
        tracing::trace!("cache MISS");

        let id = self.allocate_id();
        let round_robin_counter = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);

        let result = if matches!(strategy, Strategy::Iterative) {
            query::iterative::resolve_iteratively(&question, &self.agents).await
        } else {
            query::resolve_via_agents(
                id,
                &question,
                true,
                &self.agents,
                &strategy,
                round_robin_counter,
                initial_transport,
            )
            .await
        };

        self.release_id(id);

        match &result {
            Ok(response) => {
                tracing::trace!("got answer");
                self.cache.insert_all(response.answers.iter().cloned());
                self.cache.insert_all(response.authority.iter().cloned());
                self.cache.insert_all(response.additional.iter().cloned());
            }
            Err(error) => tracing::debug!(%error, "resolution failed"),
        }

        result
    }

    /// Blocking variant of [`Resolver::resolve`], for callers outside
    /// an async runtime. Do not call this from within a `tokio`
    /// task — it will deadlock the runtime it would otherwise yield
    /// to.
    pub fn resolve_sync(
        &self,
        question: Question,
        strategy: Strategy,
        initial_transport: Transport,
    ) -> ResolverResult<Message> {
        futures::executor::block_on(self.resolve(question, strategy, initial_transport))
    }

    /// Asynchronous entry point: spawns the resolution as a
    /// background task and invokes `callback` with its result once
    /// complete. Requires a `tokio` runtime to be active.
    pub fn resolve_with_callback<F>(
        self: Arc<Self>,
        question: Question,
        strategy: Strategy,
        initial_transport: Transport,
        callback: F,
    ) where
        F: FnOnce(ResolverResult<Message>) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.resolve(question, strategy, initial_transport).await;
            callback(result);
        });
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn answer_from_cache(&self, question: &Question) -> Option<Message> {
        if self.cache.is_empty() {
            return None;
        }

        let candidates = self.cache.get(&question.name);
        let matching: Vec<_> = candidates.into_iter().filter(|rr| rr.matches(question)).collect();
        if matching.is_empty() {
            return None;
        }

        let mut response = Message::from_question(0, question.clone());
        response.header.is_response = true;
        response.header.recursion_available = true;
        response.answers = matching;
        Some(response)
    }

    /// Allocate the next transaction ID, skipping any already active,
    /// per the façade's uniqueness invariant.
    fn allocate_id(&self) -> u16 {
        let mut active = self.active_ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if active.insert(id) {
                return id;
            }
        }
    }

    fn release_id(&self, id: u16) {
        let mut active = self.active_ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&id);
    }
}
