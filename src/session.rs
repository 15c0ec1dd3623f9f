//! The orchestration session and its on-disk snapshot.
//!
//! A `Session` owns everything the engine needs to pick up where it left
//! off: the phase machine, the task graph, gate history, the checkpoint log
//! and the swarm settings. `SessionStore` persists it atomically under
//! `<project>/.cadence/state/` and archives finished sessions to `history/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::approval::Question;
use crate::checkpoint::CheckpointLog;
use crate::config::Config;
use crate::core::TaskGraph;
use crate::gates::{PipelineReport, PipelineStage};
use crate::orchestration::{TieBreak, WorkerId};
use crate::planner::Classification;
use crate::util::blocking;
use crate::workflow::{Phase, PhaseMachine, SessionId, SessionStatus};
use crate::{clog, clog_debug, Error, Result};

/// Current version of the session snapshot format.
pub const STATE_VERSION: u32 = 1;

const SESSION_FILE: &str = "session.json";

/// Pipeline reports kept in a session snapshot.
pub const GATE_HISTORY_LIMIT: usize = 256;

/// Swarm configuration and the registry of the last swarm run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmSettings {
    pub worker_count: usize,
    pub threshold: u32,
    pub tie_break: TieBreak,
    /// Workers registered during the current Execute phase.
    #[serde(default)]
    pub active_workers: Vec<WorkerId>,
}

impl SwarmSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_count: config.worker_count,
            threshold: config.swarm_threshold,
            tie_break: config.tie_break,
            active_workers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub version: u32,
    pub id: SessionId,
    pub prompt: String,
    #[serde(default)]
    pub profile: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub machine: PhaseMachine,
    pub graph: TaskGraph,
    #[serde(default)]
    pub gate_history: Vec<PipelineReport>,
    #[serde(default)]
    pub checkpoints: CheckpointLog,
    pub swarm: SwarmSettings,
    #[serde(default)]
    pub classification: Option<Classification>,
    /// Every path changed by a completed task during the session.
    #[serde(default)]
    pub changed_files: BTreeSet<PathBuf>,
    /// Paths changed since the last Commit phase.
    #[serde(default)]
    pub uncommitted: BTreeSet<PathBuf>,
    /// Paths already dirty when the session started. Never checkpointed.
    #[serde(default)]
    pub baseline_dirty: BTreeSet<PathBuf>,
    /// Tasks whose immediate checkpoint was deferred to Commit.
    #[serde(default)]
    pub deferred_checkpoints: Vec<crate::core::TaskId>,
    /// The question the session is suspended on, if any.
    #[serde(default)]
    pub pending_question: Option<Question>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Session {
    pub fn new(prompt: &str, config: &Config) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            id: SessionId::new(),
            prompt: prompt.to_string(),
            profile: config.profile.clone(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::Running,
            machine: PhaseMachine::new(),
            graph: TaskGraph::new(),
            gate_history: Vec::new(),
            checkpoints: CheckpointLog::new(),
            swarm: SwarmSettings::from_config(config),
            classification: None,
            changed_files: BTreeSet::new(),
            uncommitted: BTreeSet::new(),
            baseline_dirty: BTreeSet::new(),
            deferred_checkpoints: Vec::new(),
            pending_question: None,
            last_error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.machine.current_phase()
    }

    pub fn iteration(&self) -> u32 {
        self.machine.iteration()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Append a pipeline report. A task report replaces earlier task reports
    /// for the same tasks, and the oldest entries fall off past
    /// [`GATE_HISTORY_LIMIT`].
    pub fn record_report(&mut self, report: PipelineReport) {
        if report.stage == PipelineStage::Task {
            self.gate_history
                .retain(|r| r.stage != PipelineStage::Task || r.task_ids != report.task_ids);
        }
        self.gate_history.push(report);
        if self.gate_history.len() > GATE_HISTORY_LIMIT {
            let excess = self.gate_history.len() - GATE_HISTORY_LIMIT;
            self.gate_history.drain(..excess);
        }
    }

    pub fn record_changes(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        for path in paths {
            self.changed_files.insert(path.clone());
            self.uncommitted.insert(path);
        }
    }

    /// The two most recent Quality runs both passed.
    pub fn quality_streak_passed(&self) -> bool {
        let recent: Vec<&PipelineReport> = self
            .gate_history
            .iter()
            .rev()
            .filter(|r| r.stage == PipelineStage::Quality)
            .take(2)
            .collect();
        recent.len() == 2 && recent.iter().all(|r| r.passed)
    }

    pub fn last_report(&self, stage: PipelineStage) -> Option<&PipelineReport> {
        self.gate_history.iter().rev().find(|r| r.stage == stage)
    }
}

/// One archived session, for `cadence history`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: SessionId,
    pub prompt: String,
    pub status: SessionStatus,
    pub phase: Phase,
    pub tasks: usize,
    pub completed: usize,
    pub checkpoints: usize,
    pub updated_at: DateTime<Utc>,
}

impl HistoryEntry {
    fn from_session(session: &Session) -> Self {
        Self {
            id: session.id,
            prompt: session.prompt.clone(),
            status: session.status,
            phase: session.phase(),
            tasks: session.graph.len(),
            completed: session.graph.tasks().filter(|t| t.status.is_complete()).count(),
            checkpoints: session.checkpoints.len(),
            updated_at: session.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: Config::project_dir(root).join("state"),
        }
    }

    pub fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.dir.join("history")
    }

    pub fn exists(&self) -> bool {
        self.session_path().exists()
    }

    /// Load the current session.
    ///
    /// # Errors
    /// `NoSession` if none is saved, `UnsupportedStateVersion` for a
    /// snapshot from another format version, `CorruptState` if it cannot be
    /// parsed or its graph is invalid.
    pub fn load(&self) -> Result<Session> {
        let path = self.session_path();
        clog_debug!("SessionStore::load path={}", path.display());
        if !path.exists() {
            return Err(Error::NoSession(self.dir.clone()));
        }
        Self::parse(&fs::read_to_string(&path)?)
    }

    fn parse(contents: &str) -> Result<Session> {
        let value: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| Error::CorruptState(format!("unreadable snapshot: {}", e)))?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::CorruptState("snapshot has no version".to_string()))?;
        if version != u64::from(STATE_VERSION) {
            return Err(Error::UnsupportedStateVersion {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                expected: STATE_VERSION,
            });
        }
        let session: Session =
            serde_json::from_value(value).map_err(|e| Error::CorruptState(e.to_string()))?;
        clog_debug!(
            "Session {} loaded: phase={}, {} tasks",
            session.id.short(),
            session.phase(),
            session.graph.len()
        );
        Ok(session)
    }

    /// Write the snapshot atomically, keeping the previous one as `.json.bak`.
    pub async fn save(&self, session: &Session) -> Result<()> {
        let contents = serde_json::to_string_pretty(session)?;
        let dir = self.dir.clone();
        let path = self.session_path();
        let phase = session.phase();
        blocking(move || {
            if !dir.exists() {
                clog_debug!("Creating state directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
            if path.exists() {
                let backup_path = path.with_extension("json.bak");
                fs::copy(&path, &backup_path)?;
            }
            let temp_path = path.with_extension("json.tmp");
            fs::write(&temp_path, &contents)?;
            fs::rename(&temp_path, &path)?;
            clog_debug!("Session saved at phase {}: {}", phase, path.display());
            Ok(())
        })
        .await
    }

    /// Move the current session into the history archive.
    pub async fn archive(&self, session: &Session) -> Result<PathBuf> {
        let contents = serde_json::to_string_pretty(session)?;
        let history = self.history_dir();
        let target = history.join(format!("{}.json", session.id));
        let current = self.session_path();
        let archived = target.clone();
        blocking(move || {
            fs::create_dir_all(&history)?;
            fs::write(&target, &contents)?;
            if current.exists() {
                fs::remove_file(&current)?;
            }
            Ok(())
        })
        .await?;
        clog!("Session {} archived to {}", session.id.short(), archived.display());
        Ok(archived)
    }

    /// Archive whatever session is saved, if any.
    pub async fn clear(&self) -> Result<Option<PathBuf>> {
        match self.load() {
            Ok(session) => Ok(Some(self.archive(&session).await?)),
            Err(Error::NoSession(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Archived sessions, newest first. Unreadable entries are skipped.
    pub fn list_history(&self) -> Result<Vec<HistoryEntry>> {
        let dir = self.history_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).map_err(Error::from).and_then(|c| Self::parse(&c)) {
                Ok(session) => entries.push(HistoryEntry::from_session(&session)),
                Err(e) => clog_debug!("Skipping {}: {}", path.display(), e),
            }
        }
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(entries)
    }
}
