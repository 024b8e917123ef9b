use crate::config::{Settings, ToolConfig};
use crate::errors::{AppError, AppResult};
use crate::models::{ToolParameters, ToolRunReport, ToolRunSnapshot, ToolRunStatus};
use crate::registry::CaseRegistry;
use crate::tools::command::{build_command, is_tool_missing_line, ValidatedCommand};
use crate::tools::line_buffer::LineBuffer;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const MAX_BUFFERED_OUTPUT_LINES: usize = 2_000;
const MAX_BUFFERED_OUTPUT_BYTES: usize = 1024 * 1024;
const MAX_PENDING_LINE_BYTES: usize = 64 * 1024;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct OutputBuffer {
    lines: VecDeque<String>,
    total_bytes: usize,
}

impl OutputBuffer {
    fn push(&mut self, line: String) {
        self.total_bytes = self.total_bytes.saturating_add(line.len());
        self.lines.push_back(line);

        while self.lines.len() > MAX_BUFFERED_OUTPUT_LINES
            || self.total_bytes > MAX_BUFFERED_OUTPUT_BYTES
        {
            match self.lines.pop_front() {
                Some(removed) => self.total_bytes = self.total_bytes.saturating_sub(removed.len()),
                None => break,
            }
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// State shared between a running task, its handle and the active-run table.
struct RunState {
    status: watch::Sender<ToolRunStatus>,
    output: StdMutex<OutputBuffer>,
    error: StdMutex<Option<String>>,
    canceled: AtomicBool,
    cancel_notify: Notify,
}

impl RunState {
    fn new() -> Self {
        let (status, _) = watch::channel(ToolRunStatus::Pending);
        Self {
            status,
            output: StdMutex::new(OutputBuffer::default()),
            error: StdMutex::new(None),
            canceled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn push_line(&self, line: String) {
        if let Ok(mut output) = self.output.lock() {
            output.push(line);
        }
    }

    fn output_lines(&self) -> Vec<String> {
        self.output.lock().map(|output| output.snapshot()).unwrap_or_default()
    }

    fn error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|error| error.clone())
    }

    fn finish(&self, result: &AppResult<ToolRunReport>) {
        match result {
            Ok(_) => {
                self.status.send_replace(ToolRunStatus::Succeeded);
            }
            Err(error) => {
                if let Ok(mut slot) = self.error.lock() {
                    *slot = Some(error.to_string());
                }
                self.status.send_replace(ToolRunStatus::Failed);
            }
        }
    }
}

#[derive(Clone)]
struct ActiveRun {
    tool_name: String,
    case_id: String,
    started_at: DateTime<Utc>,
    state: Arc<RunState>,
}

impl ActiveRun {
    fn snapshot(&self, run_id: &str) -> ToolRunSnapshot {
        ToolRunSnapshot {
            run_id: run_id.to_string(),
            tool_name: self.tool_name.clone(),
            case_id: self.case_id.clone(),
            status: *self.state.status.borrow(),
            started_at: self.started_at,
            error: self.state.error(),
        }
    }
}

/// Returned by [`ToolRunner::run_tool`]. Poll it, read output, cancel it, or
/// await the final report.
pub struct ToolRunHandle {
    run_id: String,
    run: ActiveRun,
    status_rx: watch::Receiver<ToolRunStatus>,
    task: JoinHandle<AppResult<ToolRunReport>>,
}

impl ToolRunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn tool_name(&self) -> &str {
        &self.run.tool_name
    }

    pub fn case_id(&self) -> &str {
        &self.run.case_id
    }

    pub fn status(&self) -> ToolRunStatus {
        *self.status_rx.borrow()
    }

    pub fn snapshot(&self) -> ToolRunSnapshot {
        self.run.snapshot(&self.run_id)
    }

    pub fn output_lines(&self) -> Vec<String> {
        self.run.state.output_lines()
    }

    /// Requests termination. A canceled run always ends `failed` and imports
    /// nothing.
    pub fn cancel(&self) {
        self.run.state.cancel();
    }

    /// Resolves once the status leaves `pending`/`running`.
    pub async fn finished(&mut self) -> ToolRunStatus {
        let reached = self
            .status_rx
            .wait_for(|status| status.is_terminal())
            .await
            .map(|status| *status);
        match reached {
            Ok(status) => status,
            Err(_) => *self.status_rx.borrow(),
        }
    }

    pub async fn wait(self) -> AppResult<ToolRunReport> {
        self.task
            .await
            .map_err(|error| AppError::Internal(format!("tool run task failed: {}", error)))?
    }
}

/// Removes the run's staging directory whichever way the run ends.
struct StagingGuard {
    path: PathBuf,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_dir_all(&self.path) {
            if error.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %error,
                    "failed to remove tool staging directory"
                );
            }
        }
    }
}

#[derive(Clone)]
pub struct ToolRunner {
    registry: Arc<CaseRegistry>,
    settings: Arc<Settings>,
    active: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl ToolRunner {
    pub fn new(registry: Arc<CaseRegistry>, settings: Arc<Settings>) -> Self {
        Self {
            registry,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validates the request and starts the tool in the background. Errors
    /// returned here mean nothing was started; failures after that point are
    /// reported through the handle.
    pub async fn run_tool(
        &self,
        tool_name: &str,
        case_id: &str,
        parameters: ToolParameters,
    ) -> AppResult<ToolRunHandle> {
        let tool = self
            .settings
            .tool(tool_name)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("no configuration for tool '{}'", tool_name))
            })?;
        let registry = self.registry.clone();
        let lookup_id = case_id.to_string();
        let known = tokio::task::spawn_blocking(move || registry.get_case(&lookup_id))
            .await
            .map_err(|error| AppError::Internal(format!("case lookup task failed: {}", error)))??;
        if known.is_none() {
            return Err(AppError::NotFound(format!("case {}", case_id)));
        }

        let run_id = Uuid::new_v4().to_string();
        let staging_dir = self.settings.paths.staging.join(&run_id);
        let command = build_command(&tool, &staging_dir, &parameters)?;

        let state = Arc::new(RunState::new());
        let run = ActiveRun {
            tool_name: tool_name.to_string(),
            case_id: case_id.to_string(),
            started_at: Utc::now(),
            state: state.clone(),
        };
        let status_rx = state.status.subscribe();
        self.active.lock().await.insert(run_id.clone(), run.clone());

        tracing::info!(run_id = %run_id, tool = %tool_name, case_id = %case_id, "tool run queued");

        let task = tokio::spawn({
            let runner = self.clone();
            let run_id = run_id.clone();
            let run = run.clone();
            async move {
                let result = runner.execute(&run_id, &run, &tool, command, staging_dir).await;
                run.state.finish(&result);
                runner.active.lock().await.remove(&run_id);
                match &result {
                    Ok(report) => tracing::info!(
                        run_id = %run_id,
                        case_id = %run.case_id,
                        imported = report.output_paths.len(),
                        "tool run succeeded"
                    ),
                    Err(error) => tracing::warn!(
                        run_id = %run_id,
                        case_id = %run.case_id,
                        error = %error,
                        "tool run failed"
                    ),
                }
                result
            }
        });

        Ok(ToolRunHandle {
            run_id,
            run,
            status_rx,
            task,
        })
    }

    pub async fn cancel_run(&self, run_id: &str) -> bool {
        match self.active.lock().await.get(run_id) {
            Some(run) => {
                run.state.cancel();
                tracing::info!(run_id = %run_id, "tool run cancel requested");
                true
            }
            None => false,
        }
    }

    pub async fn active_runs(&self) -> Vec<ToolRunSnapshot> {
        let active = self.active.lock().await;
        let mut runs: Vec<ToolRunSnapshot> = active
            .iter()
            .map(|(run_id, run)| run.snapshot(run_id))
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    async fn execute(
        &self,
        run_id: &str,
        run: &ActiveRun,
        tool: &ToolConfig,
        command: ValidatedCommand,
        staging_dir: PathBuf,
    ) -> AppResult<ToolRunReport> {
        let state = &run.state;
        if state.is_canceled() {
            return Err(AppError::ToolExecution("tool run canceled before start".to_string()));
        }

        fs::create_dir_all(&staging_dir).map_err(|error| {
            AppError::Filesystem(format!("failed to create staging directory: {}", error))
        })?;
        let _staging = StagingGuard {
            path: staging_dir.clone(),
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    AppError::ToolExecution(format!(
                        "tool executable '{}' not found",
                        command.program
                    ))
                } else {
                    AppError::ToolExecution(format!(
                        "failed to spawn '{}': {}",
                        command.program, error
                    ))
                }
            })?;
        state.status.send_replace(ToolRunStatus::Running);
        tracing::info!(
            run_id = %run_id,
            pid = ?child.id(),
            program = %command.program,
            "tool process started"
        );

        let readers: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|stream| spawn_line_reader(run_id, "stdout", stream, state.clone())),
            child
                .stderr
                .take()
                .map(|stream| spawn_line_reader(run_id, "stderr", stream, state.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = state.cancel_notify.notified() => None,
        };

        let exit_status = match exit {
            Some(status) => status.map_err(|error| {
                AppError::ToolExecution(format!("failed to wait for tool: {}", error))
            })?,
            None => {
                terminate_then_kill(&mut child).await;
                drain_readers(readers).await;
                return Err(AppError::ToolExecution("tool run canceled".to_string()));
            }
        };
        drain_readers(readers).await;

        if state.is_canceled() {
            return Err(AppError::ToolExecution("tool run canceled".to_string()));
        }
        if !exit_status.success() {
            let hint = state
                .output_lines()
                .into_iter()
                .rev()
                .find(|line| is_tool_missing_line(line))
                .map(|line| format!(" ({})", line))
                .unwrap_or_default();
            return Err(AppError::ToolExecution(format!(
                "'{}' exited with {}{}",
                run.tool_name, exit_status, hint
            )));
        }

        let artifacts = collect_artifacts(&staging_dir, &tool.output_extensions)?;
        if artifacts.is_empty() {
            return Err(AppError::ToolExecution(format!(
                "'{}' finished but produced no {} output",
                run.tool_name,
                describe_extensions(&tool.output_extensions)
            )));
        }

        let registry = self.registry.clone();
        let case_id = run.case_id.clone();
        let subfolder = tool.output_subfolder.clone();
        let state_for_import = state.clone();
        let output_paths = tokio::task::spawn_blocking(move || {
            registry.with_existing_case(&case_id, |case_folder| {
                if state_for_import.is_canceled() {
                    return Err(AppError::ToolExecution("tool run canceled".to_string()));
                }
                import_artifacts(case_folder, &subfolder, &artifacts)
            })
        })
        .await
        .map_err(|error| AppError::Internal(format!("import task failed: {}", error)))??;

        tracing::info!(
            run_id = %run_id,
            case_id = %run.case_id,
            files = output_paths.len(),
            "tool output imported"
        );
        Ok(ToolRunReport {
            run_id: run_id.to_string(),
            tool_name: run.tool_name.clone(),
            case_id: run.case_id.clone(),
            status: ToolRunStatus::Succeeded,
            exit_code: exit_status.code(),
            output_paths,
            started_at: run.started_at,
            ended_at: Utc::now(),
        })
    }
}

fn spawn_line_reader<R>(
    run_id: &str,
    stream_name: &'static str,
    stream: R,
    state: Arc<RunState>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let run_id = run_id.to_string();
    tokio::spawn(async move {
        let mut stream = stream;
        let mut chunk = vec![0_u8; 4096];
        let mut lines = LineBuffer::new(Some(MAX_PENDING_LINE_BYTES));
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(size) => {
                    let text = String::from_utf8_lossy(&chunk[..size]).to_string();
                    for line in lines.push(&text) {
                        record_line(&run_id, stream_name, line, &state);
                    }
                    let dropped = lines.take_dropped_bytes();
                    if dropped > 0 {
                        tracing::warn!(
                            run_id = %run_id,
                            stream = stream_name,
                            bytes = dropped,
                            "overlong output line trimmed"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        run_id = %run_id,
                        stream = stream_name,
                        error = %error,
                        "tool output read failed"
                    );
                    break;
                }
            }
        }
        if let Some(rest) = lines.finish() {
            record_line(&run_id, stream_name, rest, &state);
        }
    })
}

fn record_line(run_id: &str, stream_name: &str, line: String, state: &RunState) {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return;
    }
    tracing::debug!(run_id = %run_id, stream = stream_name, line = %trimmed, "tool output");
    state.push_line(trimmed.to_string());
}

async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let abort = reader.abort_handle();
        if timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            abort.abort();
        }
    }
}

async fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(windows)]
    {
        if let Some(pid) = child.id() {
            let _ = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .spawn();
        }
    }

    if timeout(Duration::from_millis(1500), child.wait()).await.is_ok() {
        return;
    }

    let _ = child.start_kill();
    let _ = timeout(Duration::from_secs(2), child.wait()).await;
}

/// Files under `dir` whose extension is in `extensions` (any file when the
/// list is empty), sorted for stable import order.
fn collect_artifacts(dir: &Path, extensions: &[String]) -> AppResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && matches_extension(&path, extensions) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

fn describe_extensions(extensions: &[String]) -> String {
    if extensions.is_empty() {
        "file".to_string()
    } else {
        extensions.join("/")
    }
}

/// Moves artifacts into `<case_folder>/<subfolder>`. Either every file lands
/// or the case folder is put back the way it was.
fn import_artifacts(
    case_folder: &Path,
    subfolder: &str,
    artifacts: &[PathBuf],
) -> AppResult<Vec<PathBuf>> {
    let destination = case_folder.join(subfolder);
    let created_destination = !destination.exists();
    fs::create_dir_all(&destination)?;

    let mut imported: Vec<PathBuf> = Vec::new();
    for artifact in artifacts {
        let result = artifact
            .file_name()
            .ok_or_else(|| {
                AppError::Filesystem(format!("artifact {} has no file name", artifact.display()))
            })
            .and_then(|name| {
                let target = unique_destination(&destination, Path::new(name));
                move_file(artifact, &target).map(|()| target)
            });
        match result {
            Ok(target) => imported.push(target),
            Err(error) => {
                let leftovers = undo_import(&imported, &destination, created_destination);
                if leftovers.is_empty() {
                    return Err(error);
                }
                tracing::error!(
                    case_folder = %case_folder.display(),
                    error = %error,
                    leftovers = ?leftovers,
                    "import failed and could not be undone"
                );
                return Err(AppError::PartialFailure(format!(
                    "import into {} failed ({}) and these could not be removed: {}",
                    destination.display(),
                    error,
                    leftovers.join(", ")
                )));
            }
        }
    }
    Ok(imported)
}

/// Removes files moved in by a failed import. Returns what is still there.
fn undo_import(imported: &[PathBuf], destination: &Path, created_destination: bool) -> Vec<String> {
    let mut leftovers = Vec::new();
    for path in imported {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => leftovers.push(format!("{} ({})", path.display(), error)),
        }
    }
    if created_destination && leftovers.is_empty() {
        match fs::remove_dir(destination) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => leftovers.push(format!("{} ({})", destination.display(), error)),
        }
    }
    leftovers
}

fn unique_destination(dir: &Path, file_name: &Path) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = file_name
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = file_name
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let mut counter = 1_u32;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

fn move_file(from: &Path, to: &Path) -> AppResult<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|error| {
        AppError::Filesystem(format!(
            "failed to copy {} to {}: {}",
            from.display(),
            to.display(),
            error
        ))
    })?;
    if let Err(error) = fs::remove_file(from) {
        tracing::debug!(path = %from.display(), error = %error, "staged artifact left after copy");
    }
    Ok(())
}
