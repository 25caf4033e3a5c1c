use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use session_log_core::{
    DeleteTargets, LogError, Placement, ProjectionOptions, RedactOptions, Window, WindowMode,
    WindowParams,
};
use session_log_store::{
    read_session, FileTranscript, SessionConfig, SessionEditor, SessionResolver,
};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "session-log")]
#[command(about = "Inspect and edit conversation session transcripts")]
pub struct Cli {
    /// Project working directory; defaults to the process cwd.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Root holding per-project log directories; defaults to `~/.claude/projects`.
    #[arg(long, global = true)]
    projects_dir: Option<PathBuf>,

    /// Explicit transcript file; overrides the config file.
    #[arg(long, global = true)]
    transcript: Option<PathBuf>,

    /// Session id; overrides the config file.
    #[arg(long, global = true)]
    session_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the current log's conversational records.
    Log(LogArgs),
    /// Case-insensitive keyword search in the current log.
    Search(SearchArgs),
    /// Count records in the current log.
    Count(CountArgs),
    /// List file reads and edits recorded in the current log.
    FileReads(FileReadsArgs),
    /// Show another session of the same project, read-only.
    ReadSession(ReadSessionArgs),
    /// Redact records; restorable with `restore`.
    Delete(DeleteArgs),
    /// Restore redacted or replaced records from their backups.
    Restore(RestoreArgs),
    /// Rewrite one record's content.
    Replace(ReplaceArgs),
    /// Insert a summary record.
    Compact(CompactArgs),
    /// Repair timestamp order and parent links.
    Repair,
    /// Select the session used by later commands.
    SetSession(SetSessionArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    All,
    Tail,
    Slice,
    Around,
}

impl From<ModeArg> for WindowMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::All => Self::All,
            ModeArg::Tail => Self::Tail,
            ModeArg::Slice => Self::Slice,
            ModeArg::Around => Self::Around,
        }
    }
}

#[derive(Debug, Args)]
pub struct WindowArgs {
    #[arg(long, value_enum, default_value_t = ModeArg::All)]
    mode: ModeArg,
    #[arg(long)]
    count: Option<usize>,
    #[arg(long)]
    start: Option<usize>,
    #[arg(long)]
    end: Option<usize>,
    #[arg(long)]
    target: Option<usize>,
    #[arg(long, default_value_t = 10)]
    radius: usize,
}

impl WindowArgs {
    fn window(&self, strict: bool) -> Result<Window> {
        let params = WindowParams {
            count: self.count,
            start: self.start,
            end: self.end,
            target: self.target,
            radius: Some(self.radius),
        };
        Ok(Window::build(self.mode.into(), &params, strict)?)
    }
}

#[derive(Debug, Args)]
pub struct ProjectionArgs {
    #[arg(long)]
    include_deleted: bool,
    /// Characters kept per record; 0 keeps everything.
    #[arg(long, default_value_t = 1000)]
    max_field_size: usize,
}

impl ProjectionArgs {
    fn options(&self) -> ProjectionOptions {
        ProjectionOptions {
            include_deleted: self.include_deleted,
            max_field_size: Some(self.max_field_size),
        }
    }
}

#[derive(Debug, Args)]
pub struct LogArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[command(flatten)]
    projection: ProjectionArgs,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    keyword: String,
    #[command(flatten)]
    projection: ProjectionArgs,
}

#[derive(Debug, Args)]
pub struct CountArgs {
    /// Leave deleted records out of the count.
    #[arg(long)]
    exclude_deleted: bool,
}

#[derive(Debug, Args)]
pub struct FileReadsArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[arg(long)]
    include_deleted: bool,
}

#[derive(Debug, Args)]
pub struct ReadSessionArgs {
    /// Id of the session to read.
    session: String,
    #[command(flatten)]
    window: WindowArgs,
    /// Characters kept per record; 0 keeps everything.
    #[arg(long, default_value_t = 1000)]
    max_field_size: usize,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    #[arg(long, value_delimiter = ',')]
    lines: Option<Vec<usize>>,
    #[arg(long)]
    from_line: Option<usize>,
    #[arg(long)]
    skip_imported: bool,
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    lines: Vec<usize>,
}

#[derive(Debug, Args)]
pub struct ReplaceArgs {
    #[arg(long)]
    line: usize,
    #[arg(long)]
    content: String,
}

#[derive(Debug, Args)]
pub struct CompactArgs {
    #[arg(long)]
    content: String,
}

#[derive(Debug, Args)]
pub struct SetSessionArgs {
    session: String,
}

/// Executes a parsed CLI invocation and prints its JSON result.
///
/// # Errors
/// Returns an error when session resolution, decoding, validation or the
/// transcript write fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let output = execute(cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes a parsed CLI invocation and returns its JSON result.
///
/// # Errors
/// See [`run_cli`].
pub fn execute(cli: Cli) -> Result<Value> {
    let cwd = match cli.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("failed to determine working directory")?,
    };
    let target = Target {
        cwd,
        projects_dir: cli.projects_dir,
        overrides: SessionConfig {
            session_id: cli.session_id,
            transcript_path: cli.transcript,
        },
    };

    match cli.command {
        Command::Log(args) => {
            let window = args.window.window(false)?;
            let lines = match target.current_editor()? {
                Some(editor) => editor.log(&args.projection.options(), &window)?,
                None => Vec::new(),
            };
            Ok(serde_json::to_value(lines)?)
        }
        Command::Search(args) => {
            let lines = match target.current_editor()? {
                Some(editor) => editor.search(&args.keyword, &args.projection.options())?,
                None => Vec::new(),
            };
            Ok(serde_json::to_value(lines)?)
        }
        Command::Count(args) => {
            let count = match target.current_editor()? {
                Some(editor) => editor.count(!args.exclude_deleted)?,
                None => 0,
            };
            Ok(json!({ "count": count }))
        }
        Command::FileReads(args) => {
            let window = args.window.window(false)?;
            let reads = match target.current_editor()? {
                Some(editor) => editor.file_reads(args.include_deleted, &window)?,
                None => Vec::new(),
            };
            Ok(serde_json::to_value(reads)?)
        }
        Command::ReadSession(args) => {
            let window = args.window.window(true)?;
            let lines = read_session(
                &target.resolver()?,
                &args.session,
                Some(args.max_field_size),
                &window,
            )?;
            Ok(serde_json::to_value(lines)?)
        }
        Command::Delete(args) => {
            let targets = DeleteTargets {
                lines: args.lines,
                from_line: args.from_line,
            };
            let options = RedactOptions {
                skip_imported: args.skip_imported,
            };
            let affected = target.required_editor()?.delete(&targets, options)?;
            Ok(json!({ "affected": affected }))
        }
        Command::Restore(args) => {
            let affected = target.required_editor()?.restore(&args.lines)?;
            Ok(json!({ "affected": affected }))
        }
        Command::Replace(args) => {
            let replaced = target.required_editor()?.replace(args.line, &args.content)?;
            Ok(json!({ "affected": usize::from(replaced) }))
        }
        Command::Compact(args) => {
            let resolver = target.resolver()?;
            let mut editor = target.required_editor()?;
            let insertion = editor.add_compact_entry(&args.content, &resolver.summary_context())?;
            let (placement, index) = match insertion.placement {
                Placement::BeforeToolUse { index } => ("before_tool_use", index),
                Placement::Appended { index } => ("appended", index),
            };
            Ok(json!({
                "uuid": insertion.record.uuid(),
                "placement": placement,
                "line": index,
            }))
        }
        Command::Repair => {
            let outcome = target.required_editor()?.repair()?;
            Ok(json!({
                "changed": outcome.report.changed,
                "passes": outcome.report.passes,
                "converged": outcome.report.converged,
                "skippedLines": outcome.skipped_lines,
            }))
        }
        Command::SetSession(args) => {
            let path = SessionConfig::config_path(&target.cwd);
            let config = SessionConfig {
                session_id: Some(args.session.clone()),
                transcript_path: None,
            };
            config.save(&path)?;
            Ok(json!({
                "sessionId": args.session,
                "configPath": path.display().to_string(),
            }))
        }
    }
}

/// Where the current log is looked up; resolved per command so `set-session`
/// never reads the config it is about to replace.
struct Target {
    cwd: PathBuf,
    projects_dir: Option<PathBuf>,
    overrides: SessionConfig,
}

impl Target {
    fn resolver(&self) -> Result<SessionResolver> {
        let projects_root = match &self.projects_dir {
            Some(root) => root.clone(),
            None => SessionResolver::default_projects_root()?,
        };
        let file_config =
            SessionConfig::load(&SessionConfig::config_path(&self.cwd))?.unwrap_or_default();
        let config = file_config.merged(self.overrides.clone());
        Ok(SessionResolver::new(self.cwd.clone(), projects_root, config))
    }

    fn current_editor(&self) -> Result<Option<SessionEditor<FileTranscript>>> {
        let current = self.resolver()?.resolve_current()?;
        if current.is_none() {
            debug!(cwd = %self.cwd.display(), "no current session log");
        }
        Ok(current.map(|path| SessionEditor::new(FileTranscript::new(path))))
    }

    /// Writes need a log; read views answer empty instead.
    fn required_editor(&self) -> Result<SessionEditor<FileTranscript>> {
        self.current_editor()?
            .ok_or_else(|| LogError::NoCurrentLog.into())
    }
}
