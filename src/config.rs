//! Runtime configuration read from the environment (and an optional `.env`).

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Result, RouterError};

/// Vendor databases known to the deployment, in display order.
pub const VENDOR_DATABASES: [&str; 4] = ["blinkit_db", "zepto_db", "instamart_db", "bigbasket_db"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackend {
    Pinecone,
    Memory,
}

/// Knobs for routing and the agent loop.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub top_k: usize,
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub deadline: Duration,
    pub agent_cache_capacity: usize,
    pub agent_max_steps: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            concurrency: 4,
            call_timeout: Duration::from_secs(60),
            deadline: Duration::from_secs(120),
            agent_cache_capacity: 32,
            agent_max_steps: 10,
        }
    }
}

/// Everything needed to build an [`AppContext`](crate::context::AppContext).
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string per database id.
    pub databases: BTreeMap<String, String>,
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub pinecone_api_key: Option<String>,
    pub pinecone_host: Option<String>,
    pub llm_provider: LlmProvider,
    pub llm_model: Option<String>,
    pub index_backend: IndexBackend,
    pub router: RouterSettings,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut databases = BTreeMap::new();
        for db in VENDOR_DATABASES {
            let var = format!("{db}_url");
            if let Some(url) = get(&var).or_else(|| get(&var.to_uppercase())) {
                databases.insert(db.to_string(), url);
            }
        }
        if databases.is_empty() {
            return Err(RouterError::Config(
                "no database configured; set at least one of blinkit_db_url, zepto_db_url, \
                 instamart_db_url, bigbasket_db_url"
                    .to_string(),
            ));
        }

        let llm_provider = match get("QCR_LLM_PROVIDER").as_deref().map(str::to_lowercase) {
            None => LlmProvider::OpenAi,
            Some(p) if p == "openai" => LlmProvider::OpenAi,
            Some(p) if p == "gemini" => LlmProvider::Gemini,
            Some(other) => {
                return Err(RouterError::Config(format!(
                    "QCR_LLM_PROVIDER must be 'openai' or 'gemini', got '{other}'"
                )));
            }
        };

        let index_backend = match get("QCR_VECTOR_INDEX").as_deref().map(str::to_lowercase) {
            None => IndexBackend::Pinecone,
            Some(b) if b == "pinecone" => IndexBackend::Pinecone,
            Some(b) if b == "memory" => IndexBackend::Memory,
            Some(other) => {
                return Err(RouterError::Config(format!(
                    "QCR_VECTOR_INDEX must be 'pinecone' or 'memory', got '{other}'"
                )));
            }
        };

        let defaults = RouterSettings::default();
        let router = RouterSettings {
            top_k: parse_or(&get, "QCR_TOP_K", defaults.top_k)?,
            concurrency: parse_or(&get, "QCR_CONCURRENCY", defaults.concurrency)?.max(1),
            call_timeout: Duration::from_secs(parse_or(
                &get,
                "QCR_CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )?
            .max(1)),
            deadline: Duration::from_secs(parse_or(
                &get,
                "QCR_DEADLINE_SECS",
                defaults.deadline.as_secs(),
            )?
            .max(1)),
            agent_cache_capacity: parse_or(&get, "QCR_AGENT_CACHE", defaults.agent_cache_capacity)?
                .max(1),
            agent_max_steps: parse_or(&get, "QCR_AGENT_MAX_STEPS", defaults.agent_max_steps)?
                .max(1),
        };

        Ok(Self {
            databases,
            gemini_api_key: get("GEMINI_API_KEY"),
            openai_api_key: get("OPENAI_API_KEY"),
            pinecone_api_key: get("PINECONE_API_KEY"),
            pinecone_host: get("PINECONE_INDEX_HOST"),
            llm_provider,
            llm_model: get("QCR_LLM_MODEL"),
            index_backend,
            router,
        })
    }

    /// Return a required secret or a config error naming the variable.
    pub fn require<'a>(value: &'a Option<String>, var: &str) -> Result<&'a str> {
        value
            .as_deref()
            .ok_or_else(|| RouterError::Config(format!("{var} environment variable not set")))
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RouterError::Config(format!("{key} must be a number, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_lookup(lookup(&[("blinkit_db_url", "postgres://localhost/blinkit_db")]))
            .unwrap();
        assert_eq!(cfg.databases.len(), 1);
        assert_eq!(cfg.llm_provider, LlmProvider::OpenAi);
        assert_eq!(cfg.index_backend, IndexBackend::Pinecone);
        assert_eq!(cfg.router.top_k, 5);
        assert_eq!(cfg.router.concurrency, 4);
        assert_eq!(cfg.router.call_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_uppercase_database_vars_accepted() {
        let cfg = Config::from_lookup(lookup(&[
            ("ZEPTO_DB_URL", "postgres://z"),
            ("instamart_db_url", "postgres://i"),
            ("bigbasket_db_url", ""),
        ]))
        .unwrap();
        let ids: Vec<&str> = cfg.databases.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["instamart_db", "zepto_db"]);
    }

    #[test]
    fn test_no_databases_is_error() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, RouterError::Config(_)));
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let cfg = Config::from_lookup(lookup(&[
            ("blinkit_db_url", "postgres://b"),
            ("QCR_LLM_PROVIDER", "Gemini"),
            ("QCR_VECTOR_INDEX", "memory"),
            ("QCR_TOP_K", "8"),
            ("QCR_CONCURRENCY", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.llm_provider, LlmProvider::Gemini);
        assert_eq!(cfg.index_backend, IndexBackend::Memory);
        assert_eq!(cfg.router.top_k, 8);
        assert_eq!(cfg.router.concurrency, 1);

        let err = Config::from_lookup(lookup(&[
            ("blinkit_db_url", "postgres://b"),
            ("QCR_TOP_K", "five"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("QCR_TOP_K"));
    }

    #[test]
    fn test_zero_timeouts_clamped() {
        let cfg = Config::from_lookup(lookup(&[
            ("blinkit_db_url", "postgres://b"),
            ("QCR_CALL_TIMEOUT_SECS", "0"),
            ("QCR_DEADLINE_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.router.call_timeout, Duration::from_secs(1));
        assert_eq!(cfg.router.deadline, Duration::from_secs(1));
    }

    #[test]
    fn test_require_names_variable() {
        let err = Config::require(&None, "PINECONE_API_KEY").unwrap_err();
        assert!(err.to_string().contains("PINECONE_API_KEY"));
    }
}
