//! Session state: the code a caller is working on and its recent results.
//!
//! The manager owns every session. Each session sits behind its own lock so
//! appends to one session are serialized while different sessions proceed
//! independently. History is a fixed-size ring: once full, the oldest result
//! is dropped for every new one.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Serialize, Serializer};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core_types::{ExecutionResult, Language};
use crate::errors::ExecutionError;

pub const MAX_TAG_LENGTH: usize = 32;

/// Bounded FIFO of execution results.
#[derive(Debug, Clone)]
pub struct ResultHistory {
    results: VecDeque<ExecutionResult>,
    max_results: usize,
}

impl ResultHistory {
    pub fn new(max_results: usize) -> Self {
        let max_results = max_results.max(1);
        Self {
            results: VecDeque::with_capacity(max_results),
            max_results,
        }
    }

    pub fn push(&mut self, result: ExecutionResult) {
        if self.results.len() >= self.max_results {
            self.results.pop_front();
        }
        self.results.push_back(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_results
    }

    pub fn latest(&self) -> Option<&ExecutionResult> {
        self.results.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter()
    }
}

impl Serialize for ResultHistory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.results.iter())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub owner: Option<String>,
    pub language: Option<Language>,
    pub code: String,
    pub results: ResultHistory,
    pub created_at: DateTime<Utc>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub is_public: bool,
    pub tags: Vec<String>,
}

impl Session {
    fn new(id: String, owner: Option<String>, language: Option<Language>, history_limit: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            language,
            code: String::new(),
            results: ResultHistory::new(history_limit),
            created_at: now,
            last_executed_at: None,
            last_activity: now,
            is_public: false,
            tags: Vec::new(),
        }
    }

    fn check_owner(&self, caller: Option<&str>) -> Result<(), ExecutionError> {
        match self.owner.as_deref() {
            Some(owner) if caller != Some(owner) => Err(ExecutionError::NotSessionOwner(self.id.clone())),
            _ => Ok(()),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// A finished execution waiting to be written into its session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub caller: Option<String>,
    pub code: String,
    pub language: Language,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionChange {
    Created,
    CodeUpdated,
    ResultAppended,
    VisibilityChanged,
    TagsChanged,
}

/// Notified after every session mutation, e.g. to persist snapshots.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn session_changed(&self, session: &Session, change: SessionChange);

    async fn session_ended(&self, session_id: &str);
}

pub struct NoopSessionObserver;

#[async_trait]
impl SessionObserver for NoopSessionObserver {
    async fn session_changed(&self, _session: &Session, _change: SessionChange) {}

    async fn session_ended(&self, _session_id: &str) {}
}

type SessionHandle = Arc<Mutex<Session>>;

pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    config: SessionConfig,
    observer: Arc<dyn SessionObserver>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            observer: Arc::new(NoopSessionObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn history_limit(&self) -> usize {
        self.config.history_limit
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn create_session(&self, owner: Option<&str>, language: Option<Language>) -> Session {
        let id = Uuid::new_v4().to_string();
        let session = Session::new(
            id.clone(),
            owner.map(str::to_string),
            language,
            self.config.history_limit,
        );
        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(session.clone())));
        log::debug!("Created session {}", id);
        self.observer.session_changed(&session, SessionChange::Created).await;
        session
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, ExecutionError> {
        let handle = self.handle(session_id).await?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    pub async fn update_code(
        &self,
        session_id: &str,
        caller: Option<&str>,
        code: &str,
    ) -> Result<(), ExecutionError> {
        self.mutate(session_id, caller, SessionChange::CodeUpdated, |session| {
            session.code = code.to_string();
        })
        .await
    }

    pub async fn append_result(
        &self,
        session_id: &str,
        caller: Option<&str>,
        result: ExecutionResult,
    ) -> Result<(), ExecutionError> {
        self.mutate(session_id, caller, SessionChange::ResultAppended, |session| {
            session.results.push(result);
            session.last_executed_at = Some(Utc::now());
        })
        .await
    }

    pub async fn set_visibility(
        &self,
        session_id: &str,
        caller: Option<&str>,
        is_public: bool,
    ) -> Result<(), ExecutionError> {
        self.mutate(session_id, caller, SessionChange::VisibilityChanged, |session| {
            session.is_public = is_public;
        })
        .await
    }

    /// Add tags after normalizing them. Returns the session's tags afterwards.
    ///
    /// Tags are trimmed and lower-cased, cut to [`MAX_TAG_LENGTH`] characters
    /// and de-duplicated. Empty tags and tags past the per-session limit are
    /// dropped.
    pub async fn add_tags<I, S>(
        &self,
        session_id: &str,
        caller: Option<&str>,
        tags: I,
    ) -> Result<Vec<String>, ExecutionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let max_tags = self.config.max_tags;
        let normalized: Vec<String> = tags.into_iter().filter_map(|tag| normalize_tag(tag.as_ref())).collect();
        let mut current = Vec::new();
        self.mutate(session_id, caller, SessionChange::TagsChanged, |session| {
            for tag in normalized {
                if session.tags.len() >= max_tags {
                    log::debug!("Session {} reached the tag limit", session.id);
                    break;
                }
                if !session.tags.contains(&tag) {
                    session.tags.push(tag);
                }
            }
            current = session.tags.clone();
        })
        .await?;
        Ok(current)
    }

    /// Sessions owned by `owner`, most recently active first.
    pub async fn get_user_sessions(&self, owner: &str) -> Vec<Session> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut owned = Vec::new();
        for handle in handles {
            let session = handle.lock().await;
            if session.owner.as_deref() == Some(owner) {
                owned.push(session.clone());
            }
        }
        owned.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        owned
    }

    pub async fn end_session(&self, session_id: &str, caller: Option<&str>) -> Result<(), ExecutionError> {
        let handle = self.handle(session_id).await?;
        handle.lock().await.check_owner(caller)?;
        self.sessions.write().await.remove(session_id);
        log::debug!("Ended session {}", session_id);
        self.observer.session_ended(session_id).await;
        Ok(())
    }

    /// Record a dispatcher execution. Unknown ids get a fresh session owned
    /// by the caller; an owned session only accepts its owner's executions.
    pub async fn record_execution(&self, record: SessionRecord) -> Result<(), ExecutionError> {
        let SessionRecord {
            session_id,
            caller,
            code,
            language,
            result,
        } = record;
        let handle = {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(session_id.clone())
                .or_insert_with(|| {
                    log::debug!("Created session {} for execution", session_id);
                    Arc::new(Mutex::new(Session::new(
                        session_id.clone(),
                        caller.clone(),
                        Some(language),
                        self.config.history_limit,
                    )))
                })
                .clone()
        };

        let snapshot = {
            let mut session = handle.lock().await;
            session.check_owner(caller.as_deref())?;
            session.code = code;
            session.language = Some(language);
            session.results.push(result);
            let now = Utc::now();
            session.last_executed_at = Some(now);
            session.last_activity = now;
            session.clone()
        };
        self.observer
            .session_changed(&snapshot, SessionChange::ResultAppended)
            .await;
        Ok(())
    }

    /// Drop anonymous sessions idle longer than the configured TTL. Returns
    /// the ids removed.
    pub async fn cleanup_expired(&self) -> Vec<String> {
        self.cleanup_expired_at(Utc::now()).await
    }

    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let ttl = i64::try_from(self.config.anonymous_ttl_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .unwrap_or(ChronoDuration::MAX);
        let handles: Vec<(String, SessionHandle)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, handle) in handles {
            let session = handle.lock().await;
            let idle = now.signed_duration_since(session.last_activity);
            if session.owner.is_none() && idle >= ttl {
                expired.push(id);
            }
        }

        if !expired.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &expired {
                sessions.remove(id);
            }
            log::info!("Expired {} idle anonymous session(s)", expired.len());
        }
        for id in &expired {
            self.observer.session_ended(id).await;
        }
        expired
    }

    async fn handle(&self, session_id: &str) -> Result<SessionHandle, ExecutionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ExecutionError::SessionNotFound(session_id.to_string()))
    }

    async fn mutate<F>(
        &self,
        session_id: &str,
        caller: Option<&str>,
        change: SessionChange,
        apply: F,
    ) -> Result<(), ExecutionError>
    where
        F: FnOnce(&mut Session),
    {
        let handle = self.handle(session_id).await?;
        let snapshot = {
            let mut session = handle.lock().await;
            session.check_owner(caller)?;
            apply(&mut session);
            session.touch();
            session.clone()
        };
        self.observer.session_changed(&snapshot, change).await;
        Ok(())
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

fn normalize_tag(raw: &str) -> Option<String> {
    let tag: String = raw.trim().to_lowercase().chars().take(MAX_TAG_LENGTH).collect();
    let tag = tag.trim_end().to_string();
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}
