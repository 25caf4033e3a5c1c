#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use session_log_core::{
    apply_plan, apply_updates, apply_window, count, decode_best_effort, decode_strict,
    file_reads, mutate::find_entry, now_utc, plan_redactions, plan_restorations,
    plan_summary_insertion, project, repair_all, replace, search, DeleteTargets, EditPlan, Entry,
    FileRead, LogError, LogLine, ProjectionOptions, RedactOptions, RepairReport, SummaryContext,
    SummaryInsertion, Window,
};
use tracing::{debug, info, warn};
use ulid::Ulid;
use uuid::Uuid;

const CONFIG_DIR: &str = ".claude";
const CONFIG_FILE_NAME: &str = "session-config.json";
const CURRENT_SESSION_FILE: &str = "current-session.jsonl";
const LOG_EXTENSION: &str = "jsonl";
const DEFAULT_PACKAGE_VERSION: &str = "1.0.0";

/// Whole-text storage for one transcript.
pub trait TranscriptStore {
    /// Human-readable location for logs and error messages.
    fn location(&self) -> String;
    fn read_text(&self) -> Result<String>;
    fn write_text(&mut self, text: &str) -> Result<()>;
}

/// A transcript file on disk, replaced atomically on write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTranscript {
    path: PathBuf,
}

impl FileTranscript {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TranscriptStore for FileTranscript {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn read_text(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read transcript {}", self.path.display()))
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| anyhow!("transcript path has no file name: {}", self.path.display()))?
            .to_string_lossy()
            .into_owned();
        let staging = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", Ulid::new()));

        fs::write(&staging, text)
            .with_context(|| format!("failed to write staging file {}", staging.display()))?;
        if let Ok(metadata) = fs::metadata(&self.path) {
            if let Err(err) = fs::set_permissions(&staging, metadata.permissions()) {
                let _ = fs::remove_file(&staging);
                return Err(err).with_context(|| {
                    format!("failed to copy permissions onto {}", staging.display())
                });
            }
        }
        if let Err(err) = fs::rename(&staging, &self.path) {
            let _ = fs::remove_file(&staging);
            return Err(err).with_context(|| {
                format!("failed to replace transcript {}", self.path.display())
            });
        }
        Ok(())
    }
}

/// An in-memory transcript, for embedding and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTranscript {
    text: String,
}

impl MemoryTranscript {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl TranscriptStore for MemoryTranscript {
    fn location(&self) -> String {
        "<memory>".to_string()
    }

    fn read_text(&self) -> Result<String> {
        Ok(self.text.clone())
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        self.text = text.to_string();
        Ok(())
    }
}

/// Per-project session selection stored in `.claude/session-config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<PathBuf>,
}

impl SessionConfig {
    #[must_use]
    pub fn config_path(cwd: &Path) -> PathBuf {
        cwd.join(CONFIG_DIR).join(CONFIG_FILE_NAME)
    }

    /// Loads the config file; a missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read session config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("invalid session config {}", path.display()))?;
        Ok(Some(config))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let body = serde_json::to_string_pretty(self).context("failed to encode session config")?;
        fs::write(path, body)
            .with_context(|| format!("failed to write session config {}", path.display()))
    }

    /// Fields set in `overrides` win.
    #[must_use]
    pub fn merged(self, overrides: Self) -> Self {
        Self {
            session_id: overrides.session_id.or(self.session_id),
            transcript_path: overrides.transcript_path.or(self.transcript_path),
        }
    }

    /// The explicit session id, else the transcript file's stem when it is
    /// UUID-shaped.
    #[must_use]
    pub fn effective_session_id(&self) -> Option<String> {
        if let Some(id) = self.session_id.as_deref().filter(|id| !id.is_empty()) {
            return Some(id.to_string());
        }
        let stem = self.transcript_path.as_deref()?.file_stem()?.to_str()?;
        (stem.len() == 36 && Uuid::parse_str(stem).is_ok()).then(|| stem.to_string())
    }
}

/// Finds the transcript a working directory refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResolver {
    cwd: PathBuf,
    projects_root: PathBuf,
    config: SessionConfig,
}

impl SessionResolver {
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>, projects_root: impl Into<PathBuf>, config: SessionConfig) -> Self {
        Self {
            cwd: cwd.into(),
            projects_root: projects_root.into(),
            config,
        }
    }

    /// `~/.claude/projects`.
    pub fn default_projects_root() -> Result<PathBuf> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(home.join(".claude").join("projects"))
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Directory holding this project's session logs.
    #[must_use]
    pub fn project_dir(&self) -> PathBuf {
        if let Some(dir) = self
            .config
            .transcript_path
            .as_deref()
            .and_then(Path::parent)
        {
            return dir.to_path_buf();
        }
        let encoded = self.cwd.to_string_lossy().replace('/', "-");
        self.projects_root.join(encoded)
    }

    #[must_use]
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.project_dir()
            .join(format!("{session_id}.{LOG_EXTENSION}"))
    }

    /// Resolves the current log, creating it when it is named but absent.
    ///
    /// `Ok(None)` means there is no current log.
    pub fn resolve_current(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.config.transcript_path {
            debug!(path = %path.display(), "using configured transcript path");
            ensure_log_file(path)?;
            return Ok(Some(path.clone()));
        }

        let project_dir = self.project_dir();
        if !project_dir.is_dir() {
            debug!(dir = %project_dir.display(), "project directory does not exist");
            return Ok(None);
        }

        if let Some(session_id) = self.config.effective_session_id() {
            let path = self.session_path(&session_id);
            debug!(session_id = %session_id, path = %path.display(), "using configured session");
            ensure_log_file(&path)?;
            return Ok(Some(path));
        }

        let current = project_dir.join(CURRENT_SESSION_FILE);
        if current.is_file() {
            debug!(path = %current.display(), "using current-session log");
            return Ok(Some(current));
        }

        let latest = latest_log(&project_dir)?;
        match &latest {
            Some(path) => debug!(path = %path.display(), "using latest log in project directory"),
            None => debug!(dir = %project_dir.display(), "no session logs found"),
        }
        Ok(latest)
    }

    /// Builds the metadata stamped on a synthetic summary record.
    #[must_use]
    pub fn summary_context(&self) -> SummaryContext {
        SummaryContext {
            cwd: self.cwd.to_string_lossy().into_owned(),
            session_id: self.config.effective_session_id().unwrap_or_default(),
            version: package_version(&self.cwd),
            git_branch: git_branch(&self.cwd),
            now: now_utc(),
            record_id: Uuid::new_v4(),
        }
    }
}

fn ensure_log_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    fs::write(path, "").with_context(|| format!("failed to create log {}", path.display()))?;
    info!(path = %path.display(), "created empty session log");
    Ok(())
}

fn latest_log(dir: &Path) -> Result<Option<PathBuf>> {
    let listing =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    let mut latest: Option<PathBuf> = None;
    for item in listing {
        let path = item
            .with_context(|| format!("failed to list {}", dir.display()))?
            .path();
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION)
        {
            continue;
        }
        if latest
            .as_ref()
            .map_or(true, |best| path.file_name() > best.file_name())
        {
            latest = Some(path);
        }
    }
    Ok(latest)
}

fn package_version(cwd: &Path) -> String {
    let manifest = cwd.join("package.json");
    fs::read_to_string(&manifest)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|parsed| {
            parsed
                .get("version")
                .and_then(Value::as_str)
                .filter(|version| !version.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_PACKAGE_VERSION.to_string())
}

fn git_branch(cwd: &Path) -> String {
    match Command::new("git")
        .args(["branch", "--show-current"])
        .current_dir(cwd)
        .output()
    {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        Ok(_) | Err(_) => String::new(),
    }
}

/// Result of a best-effort repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    pub report: RepairReport,
    /// Lines left untouched because they did not parse.
    pub skipped_lines: usize,
}

/// Runs engine operations against one transcript.
///
/// Every write is read, decode, plan, re-encode, then a single
/// [`TranscriptStore::write_text`]; nothing is written when the plan is empty.
#[derive(Debug)]
pub struct SessionEditor<S> {
    store: S,
}

impl<S: TranscriptStore> SessionEditor<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn load(&self) -> Result<(String, Vec<Entry>)> {
        let text = self.store.read_text()?;
        let entries = decode_strict(&text)
            .with_context(|| format!("failed to decode {}", self.store.location()))?;
        Ok((text, entries))
    }

    fn commit(&mut self, text: &str, operation: &str, affected: usize) -> Result<()> {
        self.store.write_text(text)?;
        info!(
            location = %self.store.location(),
            operation,
            affected,
            "transcript updated"
        );
        Ok(())
    }

    pub fn log(&self, options: &ProjectionOptions, window: &Window) -> Result<Vec<LogLine>> {
        let (_, entries) = self.load()?;
        Ok(apply_window(project(&entries, options), window))
    }

    pub fn search(&self, keyword: &str, options: &ProjectionOptions) -> Result<Vec<LogLine>> {
        let (_, entries) = self.load()?;
        Ok(search(&entries, keyword, options))
    }

    pub fn count(&self, include_deleted: bool) -> Result<usize> {
        let (_, entries) = self.load()?;
        Ok(count(&entries, include_deleted))
    }

    pub fn file_reads(&self, include_deleted: bool, window: &Window) -> Result<Vec<FileRead>> {
        let (_, entries) = self.load()?;
        Ok(apply_window(file_reads(&entries, include_deleted), window))
    }

    /// Redacts the targeted records; returns how many changed.
    pub fn delete(&mut self, targets: &DeleteTargets, options: RedactOptions) -> Result<usize> {
        let (text, entries) = self.load()?;
        let updates = plan_redactions(&entries, targets, options)?;
        if updates.is_empty() {
            debug!(location = %self.store.location(), "delete changed nothing");
            return Ok(0);
        }
        let affected = updates.len();
        self.commit(&apply_updates(&text, &updates), "delete", affected)?;
        Ok(affected)
    }

    /// Restores the targeted records from their backups; returns how many changed.
    pub fn restore(&mut self, lines: &[usize]) -> Result<usize> {
        let (text, entries) = self.load()?;
        let updates = plan_restorations(&entries, lines);
        if updates.is_empty() {
            debug!(location = %self.store.location(), "restore changed nothing");
            return Ok(0);
        }
        let affected = updates.len();
        self.commit(&apply_updates(&text, &updates), "restore", affected)?;
        Ok(affected)
    }

    /// Rewrites one record's content; `false` when the record refused the
    /// rewrite.
    pub fn replace(&mut self, line: usize, new_text: &str) -> Result<bool> {
        let (text, entries) = self.load()?;
        let entry = find_entry(&entries, line).ok_or(LogError::RecordNotFound(line))?;
        let Some(updated) = replace(&entry.record, new_text) else {
            debug!(line, "replace refused; record left unchanged");
            return Ok(false);
        };
        let plan = EditPlan::from_updates([(line, updated)].into_iter().collect());
        self.commit(&apply_plan(&text, &plan), "replace", 1)?;
        Ok(true)
    }

    /// Inserts a synthetic summary record.
    pub fn add_compact_entry(
        &mut self,
        summary: &str,
        ctx: &SummaryContext,
    ) -> Result<SummaryInsertion> {
        let (text, entries) = self.load()?;
        let insertion = plan_summary_insertion(&entries, summary, ctx);
        self.commit(&apply_plan(&text, &insertion.plan), "compact", 1)?;
        Ok(insertion)
    }

    /// Repairs timestamp order and parent links, skipping unparseable lines.
    pub fn repair(&mut self) -> Result<RepairOutcome> {
        let text = self.store.read_text()?;
        let mut decoded = decode_best_effort(&text);
        for skipped in &decoded.skipped {
            warn!(
                location = %self.store.location(),
                line = skipped.line,
                error = %skipped.message,
                "skipping unparseable line"
            );
        }

        let report = repair_all(&mut decoded.entries);
        if !report.converged {
            warn!(
                passes = report.passes,
                "timestamp repair stopped with an inversion left"
            );
        }

        let updates = report
            .changed
            .iter()
            .filter_map(|index| find_entry(&decoded.entries, *index))
            .map(|entry| (entry.index, entry.record.clone()))
            .collect::<std::collections::BTreeMap<_, _>>();
        if !updates.is_empty() {
            self.commit(&apply_updates(&text, &updates), "repair", updates.len())?;
        }

        Ok(RepairOutcome {
            report,
            skipped_lines: decoded.skipped.len(),
        })
    }
}

/// Reads another session of the same project, read-only.
///
/// Deleted records are shown with their placeholder text. Window bounds are
/// required by mode; see [`Window::build`] in strict mode.
pub fn read_session(
    resolver: &SessionResolver,
    session_id: &str,
    max_field_size: Option<usize>,
    window: &Window,
) -> Result<Vec<LogLine>> {
    let path = resolver.session_path(session_id);
    if !path.is_file() {
        return Err(anyhow!("session {session_id} not found at {}", path.display()));
    }
    let options = ProjectionOptions {
        include_deleted: true,
        max_field_size,
    };
    SessionEditor::new(FileTranscript::new(path)).log(&options, window)
}
