//! Fan a query out to one scoped agent per matched database.
//!
//! Agents run concurrently on a [`JoinSet`], at most `concurrency` at a time.
//! Each call has its own timeout and the whole pass has a deadline; whatever
//! is still running at the deadline is aborted and reported as a timeout.
//! One database failing never affects the others.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexSet;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent::AgentProvider;
use crate::config::RouterSettings;
use crate::error::{Result, RouterError};
use crate::resolver::RelevanceMatch;

/// What one database had to say. `output` is either the agent's answer or
/// `"Error: <message>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseResult {
    pub database: String,
    pub output: String,
}

fn error_output(err: &RouterError) -> String {
    format!("Error: {err}")
}

/// Group matches by database, keeping first-seen table order and dropping
/// repeated `(database, table)` pairs.
pub fn partition_matches(matches: &[RelevanceMatch]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, IndexSet<String>> = BTreeMap::new();
    for m in matches {
        groups
            .entry(m.database.clone())
            .or_default()
            .insert(m.table.clone());
    }
    groups
        .into_iter()
        .map(|(db, tables)| (db, tables.into_iter().collect()))
        .collect()
}

pub struct Router {
    provider: Arc<dyn AgentProvider>,
    concurrency: usize,
    call_timeout: Duration,
    deadline: Duration,
}

impl Router {
    pub fn new(provider: Arc<dyn AgentProvider>, settings: &RouterSettings) -> Self {
        Self {
            provider,
            concurrency: settings.concurrency.max(1),
            call_timeout: settings.call_timeout,
            deadline: settings.deadline,
        }
    }

    /// One result per database that has at least one match, sorted by
    /// database id. Empty `matches` returns immediately.
    pub async fn route(&self, query: &str, matches: &[RelevanceMatch]) -> Vec<DatabaseResult> {
        if matches.is_empty() {
            info!("No relevant tables, nothing to route");
            return Vec::new();
        }

        let groups = partition_matches(matches);
        let query: Arc<str> = Arc::from(query);
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut task_dbs = HashMap::new();

        for (database, tables) in &groups {
            info!(db = %database, tables = ?tables, "Dispatching query");
            let provider = self.provider.clone();
            let permits = permits.clone();
            let query = query.clone();
            let task_db = database.clone();
            let tables = tables.clone();
            let call_timeout = self.call_timeout;

            let handle = tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        invoke(provider.as_ref(), &task_db, &tables, &query, call_timeout).await
                    }
                    Err(e) => Err(RouterError::AgentExecution(e.to_string())),
                };
                (task_db, outcome)
            });
            task_dbs.insert(handle.id(), database.clone());
        }

        let mut results: BTreeMap<String, String> = BTreeMap::new();
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        loop {
            // Finished agents win over the deadline when both are ready.
            tokio::select! {
                biased;
                joined = tasks.join_next_with_id() => match joined {
                    None => break,
                    Some(Ok((_, (database, Ok(answer))))) => {
                        debug!(db = %database, "Agent finished");
                        results.insert(database, answer);
                    }
                    Some(Ok((_, (database, Err(e))))) => {
                        warn!(db = %database, "Agent failed: {e}");
                        results.insert(database, error_output(&e));
                    }
                    Some(Err(join_err)) => {
                        if let Some(database) = task_dbs.get(&join_err.id()) {
                            warn!(db = %database, "Agent task aborted: {join_err}");
                            let err = RouterError::AgentExecution(join_err.to_string());
                            results.insert(database.clone(), error_output(&err));
                        }
                    }
                },
                _ = &mut deadline => {
                    warn!(
                        pending = tasks.len(),
                        "Routing deadline of {:?} passed, aborting outstanding agents",
                        self.deadline
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        groups
            .keys()
            .map(|database| DatabaseResult {
                database: database.clone(),
                output: results
                    .remove(database)
                    .unwrap_or_else(|| error_output(&RouterError::Timeout)),
            })
            .collect()
    }
}

async fn invoke(
    provider: &dyn AgentProvider,
    database: &str,
    tables: &[String],
    query: &str,
    call_timeout: Duration,
) -> Result<String> {
    let call = async {
        let agent = provider.agent_for(database, tables).await?;
        agent.run(query).await
    };
    match tokio::time::timeout(call_timeout, call).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RouterError::Timeout),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::QueryAgent;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Behavior {
        Answer(&'static str),
        Fail,
        Sleep(Duration, &'static str),
        Panic,
    }

    struct StubAgent {
        behavior: Behavior,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueryAgent for StubAgent {
        async fn run(&self, _question: &str) -> Result<String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let out = match &self.behavior {
                Behavior::Answer(a) => Ok(a.to_string()),
                Behavior::Fail => Err(RouterError::Sql("relation \"price\" does not exist".into())),
                Behavior::Sleep(d, a) => {
                    tokio::time::sleep(*d).await;
                    Ok(a.to_string())
                }
                Behavior::Panic => panic!("agent blew up"),
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    struct StubProvider {
        behaviors: HashMap<&'static str, Behavior>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl StubProvider {
        fn new(behaviors: &[(&'static str, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: behaviors.iter().cloned().collect(),
                calls: Mutex::new(Vec::new()),
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn calls(&self) -> Vec<(String, Vec<String>)> {
            let mut calls = self.calls.lock().unwrap().clone();
            calls.sort();
            calls
        }
    }

    #[async_trait]
    impl AgentProvider for StubProvider {
        async fn agent_for(&self, database: &str, tables: &[String]) -> Result<Arc<dyn QueryAgent>> {
            self.calls
                .lock()
                .unwrap()
                .push((database.to_string(), tables.to_vec()));
            match self.behaviors.get(database) {
                None => Err(RouterError::UnknownDatabase(database.into())),
                Some(behavior) => Ok(Arc::new(StubAgent {
                    behavior: behavior.clone(),
                    active: self.active.clone(),
                    peak: self.peak.clone(),
                })),
            }
        }
    }

    fn settings() -> RouterSettings {
        RouterSettings::default()
    }

    fn m(db: &str, table: &str, score: f32) -> RelevanceMatch {
        RelevanceMatch::new(db, table, score)
    }

    fn result(db: &str, output: &str) -> DatabaseResult {
        DatabaseResult {
            database: db.into(),
            output: output.into(),
        }
    }

    #[test]
    fn test_partition_dedups_pairs() {
        let groups = partition_matches(&[
            m("zepto_db", "price", 0.8),
            m("blinkit_db", "price", 0.9),
            m("blinkit_db", "product", 0.7),
            m("blinkit_db", "price", 0.6),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["blinkit_db"], vec!["price", "product"]);
        assert_eq!(groups["zepto_db"], vec!["price"]);
    }

    #[tokio::test]
    async fn test_empty_matches_contacts_nothing() {
        let provider = StubProvider::new(&[("blinkit_db", Behavior::Answer("x"))]);
        let router = Router::new(provider.clone(), &settings());
        assert!(router.route("cheapest milk", &[]).await.is_empty());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_two_databases_two_invocations() {
        let provider = StubProvider::new(&[
            ("blinkit_db", Behavior::Answer("Amul Taaza Milk, Rs 28")),
            ("zepto_db", Behavior::Answer("Mother Dairy Milk, Rs 27")),
            ("instamart_db", Behavior::Answer("never asked")),
        ]);
        let router = Router::new(provider.clone(), &settings());

        let results = router
            .route(
                "cheapest milk",
                &[m("blinkit_db", "price", 0.9), m("zepto_db", "price", 0.8)],
            )
            .await;

        assert_eq!(
            results,
            vec![
                result("blinkit_db", "Amul Taaza Milk, Rs 28"),
                result("zepto_db", "Mother Dairy Milk, Rs 27"),
            ]
        );
        assert_eq!(
            provider.calls(),
            vec![
                ("blinkit_db".to_string(), vec!["price".to_string()]),
                ("zepto_db".to_string(), vec!["price".to_string()]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_isolated() {
        let provider = StubProvider::new(&[
            ("blinkit_db", Behavior::Answer("Rs 28")),
            ("zepto_db", Behavior::Sleep(Duration::from_secs(90), "too late")),
        ]);
        let router = Router::new(provider, &settings());

        let results = router
            .route(
                "cheapest milk",
                &[m("zepto_db", "price", 0.8), m("blinkit_db", "price", 0.9)],
            )
            .await;

        assert_eq!(
            results,
            vec![result("blinkit_db", "Rs 28"), result("zepto_db", "Error: timeout")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_outstanding() {
        let provider = StubProvider::new(&[
            ("blinkit_db", Behavior::Sleep(Duration::from_secs(5), "Rs 28")),
            ("zepto_db", Behavior::Sleep(Duration::from_secs(500), "too late")),
        ]);
        let router = Router::new(
            provider,
            &RouterSettings {
                call_timeout: Duration::from_secs(1000),
                deadline: Duration::from_secs(30),
                ..settings()
            },
        );

        let started = tokio::time::Instant::now();
        let results = router
            .route(
                "cheapest milk",
                &[m("blinkit_db", "price", 0.9), m("zepto_db", "price", 0.8)],
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(
            results,
            vec![result("blinkit_db", "Rs 28"), result("zepto_db", "Error: timeout")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_just_inside_deadline_is_kept() {
        let provider = StubProvider::new(&[
            ("blinkit_db", Behavior::Sleep(Duration::from_millis(29_999), "Rs 28")),
            ("zepto_db", Behavior::Answer("Rs 27")),
        ]);
        let router = Router::new(
            provider,
            &RouterSettings {
                call_timeout: Duration::from_secs(1000),
                deadline: Duration::from_secs(30),
                ..settings()
            },
        );

        let results = router
            .route(
                "cheapest milk",
                &[m("blinkit_db", "price", 0.9), m("zepto_db", "price", 0.8)],
            )
            .await;

        assert_eq!(
            results,
            vec![result("blinkit_db", "Rs 28"), result("zepto_db", "Rs 27")]
        );
    }

    #[tokio::test]
    async fn test_failures_do_not_affect_others() {
        let provider = StubProvider::new(&[
            ("bigbasket_db", Behavior::Fail),
            ("blinkit_db", Behavior::Answer("Rs 28")),
            ("instamart_db", Behavior::Panic),
        ]);
        let router = Router::new(provider, &settings());

        let results = router
            .route(
                "cheapest milk",
                &[
                    m("instamart_db", "price", 0.95),
                    m("bigbasket_db", "price", 0.9),
                    m("blinkit_db", "price", 0.85),
                    m("dunzo_db", "price", 0.8),
                ],
            )
            .await;

        let dbs: Vec<&str> = results.iter().map(|r| r.database.as_str()).collect();
        assert_eq!(dbs, vec!["bigbasket_db", "blinkit_db", "dunzo_db", "instamart_db"]);
        assert_eq!(results[0].output, "Error: SQL error: relation \"price\" does not exist");
        assert_eq!(results[1].output, "Rs 28");
        assert_eq!(results[2].output, "Error: Unknown database: dunzo_db");
        assert!(results[3].output.starts_with("Error: Agent execution error"));
        assert_ne!(results[3].output, "Error: timeout");
    }

    #[tokio::test]
    async fn test_order_is_stable_across_runs() {
        let provider = StubProvider::new(&[
            ("blinkit_db", Behavior::Answer("a")),
            ("zepto_db", Behavior::Answer("b")),
            ("instamart_db", Behavior::Answer("c")),
        ]);
        let router = Router::new(provider, &settings());
        let matches = [
            m("zepto_db", "price", 0.9),
            m("instamart_db", "price", 0.8),
            m("blinkit_db", "price", 0.7),
        ];

        let first = router.route("q", &matches).await;
        for _ in 0..5 {
            assert_eq!(router.route("q", &matches).await, first);
        }
        assert_eq!(first[0].database, "blinkit_db");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let sleepy = Behavior::Sleep(Duration::from_secs(1), "ok");
        let provider = StubProvider::new(&[
            ("bigbasket_db", sleepy.clone()),
            ("blinkit_db", sleepy.clone()),
            ("instamart_db", sleepy.clone()),
            ("zepto_db", sleepy),
        ]);
        let router = Router::new(
            provider.clone(),
            &RouterSettings {
                concurrency: 2,
                ..settings()
            },
        );

        let results = router
            .route(
                "q",
                &[
                    m("bigbasket_db", "t", 0.9),
                    m("blinkit_db", "t", 0.9),
                    m("instamart_db", "t", 0.9),
                    m("zepto_db", "t", 0.9),
                ],
            )
            .await;

        assert!(results.iter().all(|r| r.output == "ok"));
        assert_eq!(provider.peak.load(Ordering::SeqCst), 2);
    }
}
