//! Process-wide clients, built once at startup and passed by reference.

use std::sync::Arc;

use tracing::info;

use crate::agent::AgentFactory;
use crate::config::{Config, IndexBackend, LlmProvider};
use crate::database::{DatabaseRegistry, PoolSettings};
use crate::embedding::{Embedder, GeminiEmbedder};
use crate::error::Result;
use crate::llm::{ChatSettings, GeminiClient, LlmClient, OpenAiClient};
use crate::vector_index::{MemoryIndex, PineconeIndex, VectorIndex};

pub struct AppContext {
    pub config: Config,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub llm: Arc<dyn LlmClient>,
    pub databases: DatabaseRegistry,
    pub agents: Arc<AgentFactory>,
}

impl AppContext {
    /// Wire up the real service clients selected by `config`.
    ///
    /// Database pools are lazy, so an unreachable database only fails when it
    /// is first used.
    pub fn from_config(config: Config) -> Result<Self> {
        let gemini_key = Config::require(&config.gemini_api_key, "GEMINI_API_KEY")?;
        let embedder: Arc<dyn Embedder> = Arc::new(GeminiEmbedder::new(gemini_key.to_string()));

        let index: Arc<dyn VectorIndex> = match config.index_backend {
            IndexBackend::Pinecone => {
                let key = Config::require(&config.pinecone_api_key, "PINECONE_API_KEY")?;
                let host = Config::require(&config.pinecone_host, "PINECONE_INDEX_HOST")?;
                Arc::new(PineconeIndex::new(key.to_string(), host))
            }
            IndexBackend::Memory => Arc::new(MemoryIndex::new()),
        };

        let llm: Arc<dyn LlmClient> = match config.llm_provider {
            LlmProvider::OpenAi => {
                let key = Config::require(&config.openai_api_key, "OPENAI_API_KEY")?;
                let settings = chat_settings(
                    config.llm_model.as_deref(),
                    OpenAiClient::DEFAULT_MODEL,
                    OpenAiClient::DEFAULT_BASE_URL,
                );
                Arc::new(OpenAiClient::new(key.to_string(), settings))
            }
            LlmProvider::Gemini => {
                let settings = chat_settings(
                    config.llm_model.as_deref(),
                    GeminiClient::DEFAULT_MODEL,
                    GeminiClient::DEFAULT_BASE_URL,
                );
                Arc::new(GeminiClient::new(gemini_key.to_string(), settings))
            }
        };

        let databases = DatabaseRegistry::connect_lazy(&config.databases, &PoolSettings::default())?;
        info!(
            databases = databases.ids().len(),
            provider = ?config.llm_provider,
            index = ?config.index_backend,
            "Application context ready"
        );

        Ok(Self::new(config, embedder, index, llm, databases))
    }

    /// Assemble a context from already-built parts.
    pub fn new(
        config: Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn LlmClient>,
        databases: DatabaseRegistry,
    ) -> Self {
        let agents = Arc::new(AgentFactory::new(
            databases.clone(),
            llm.clone(),
            config.router.agent_max_steps,
            config.router.agent_cache_capacity,
        ));
        Self {
            config,
            embedder,
            index,
            llm,
            databases,
            agents,
        }
    }
}

fn chat_settings(model: Option<&str>, default_model: &str, base_url: &str) -> ChatSettings {
    ChatSettings {
        model: model.unwrap_or(default_model).to_string(),
        temperature: 0.0,
        max_tokens: 2048,
        base_url: base_url.to_string(),
    }
}

// ============================================================================
// Test Context
// ============================================================================
