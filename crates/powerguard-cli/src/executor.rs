use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use powerguard_core::action::{ActionExecutor, ActionParams};
use powerguard_core::error::ActionError;
use powerguard_core::types::ActionKind;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_ALARM_SOUND: &str = "/usr/share/sounds/freedesktop/stereo/alarm-clock-elapsed.oga";
const SOUND_PLAYERS: &[&str] = &["paplay", "aplay"];

/// Why a helper command did not succeed.
#[derive(Debug)]
enum CommandFailure {
    NotInstalled(String),
    Denied(String),
    Exit { code: i32, stderr: String },
    Io(String),
}

impl CommandFailure {
    fn message(&self) -> String {
        match self {
            CommandFailure::NotInstalled(p) => format!("'{p}' is not installed"),
            CommandFailure::Denied(m) => m.clone(),
            CommandFailure::Exit { code, stderr } if stderr.is_empty() => {
                format!("exited with status {code}")
            }
            CommandFailure::Exit { code, stderr } => format!("exited with status {code}: {stderr}"),
            CommandFailure::Io(m) => m.clone(),
        }
    }

    fn into_action_error(self, kind: ActionKind) -> ActionError {
        if let CommandFailure::Denied(m) = self {
            return ActionError::PermissionDenied(m);
        }
        if let CommandFailure::Exit { stderr, .. } = &self {
            let lower = stderr.to_lowercase();
            if lower.contains("access denied") || lower.contains("permission denied") {
                return ActionError::PermissionDenied(stderr.clone());
            }
        }
        let msg = self.message();
        match kind {
            ActionKind::LockSession => ActionError::LockFailed(msg),
            ActionKind::SoundAlarm | ActionKind::StopAlarm => ActionError::AlarmFailed(msg),
            ActionKind::ForceLogout => ActionError::LogoutFailed(msg),
            ActionKind::ScheduleShutdown => ActionError::ShutdownFailed(msg),
            ActionKind::RunCustomScript => ActionError::Unavailable(msg),
        }
    }
}

/// Performs actions on a Linux desktop session through the usual system
/// tools. With `dry_run` every action is only logged.
pub struct SystemExecutor {
    dry_run: bool,
    alarm: Mutex<Option<JoinHandle<()>>>,
}

impl SystemExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            alarm: Mutex::new(None),
        }
    }

    async fn lock_session(&self) -> Result<(), ActionError> {
        run_command("loginctl", &["lock-session"])
            .await
            .map_err(|f| f.into_action_error(ActionKind::LockSession))
    }

    async fn force_logout(&self) -> Result<(), ActionError> {
        let user = std::env::var("USER")
            .map_err(|_| ActionError::LogoutFailed("USER is not set".into()))?;
        run_command("loginctl", &["terminate-user", &user])
            .await
            .map_err(|f| f.into_action_error(ActionKind::ForceLogout))
    }

    async fn schedule_shutdown(&self, delay_seconds: u64) -> Result<(), ActionError> {
        // shutdown(8) only takes whole minutes.
        let when = match delay_seconds.div_ceil(60) {
            0 => "now".to_string(),
            minutes => format!("+{minutes}"),
        };
        run_command("shutdown", &["-h", &when])
            .await
            .map_err(|f| f.into_action_error(ActionKind::ScheduleShutdown))
    }

    fn sound_alarm(&self, volume: u8, sound: Option<&Path>) -> Result<(), ActionError> {
        let sound = sound
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ALARM_SOUND));
        if !sound.exists() {
            return Err(ActionError::AlarmFailed(format!(
                "sound file not found: {}",
                sound.display()
            )));
        }
        let player = SOUND_PLAYERS
            .iter()
            .find(|p| which::which(p).is_ok())
            .ok_or_else(|| {
                ActionError::AlarmFailed(format!(
                    "no sound player found ({})",
                    SOUND_PLAYERS.join(", ")
                ))
            })?;

        let mut args = Vec::new();
        if *player == "paplay" {
            args.push(format!("--volume={}", u32::from(volume.min(100)) * 65536 / 100));
        }
        args.push(sound.to_string_lossy().into_owned());

        let handle = tokio::spawn(loop_sound(player.to_string(), args));
        if let Some(previous) = self.alarm_slot().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_alarm(&self) {
        match self.alarm_slot().take() {
            Some(handle) => {
                handle.abort();
                info!("alarm stopped");
            }
            None => debug!("no alarm playing"),
        }
    }

    fn alarm_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.alarm
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for SystemExecutor {
    fn drop(&mut self) {
        if let Some(handle) = self.alarm_slot().take() {
            handle.abort();
        }
    }
}

impl ActionExecutor for SystemExecutor {
    fn perform<'a>(
        &'a self,
        kind: ActionKind,
        params: &'a ActionParams,
    ) -> BoxFuture<'a, Result<(), ActionError>> {
        Box::pin(async move {
            if self.dry_run {
                info!(action = %kind, ?params, "dry run: action skipped");
                return Ok(());
            }
            match params {
                ActionParams::LockSession => self.lock_session().await,
                ActionParams::SoundAlarm { volume, sound } => {
                    self.sound_alarm(*volume, sound.as_deref())
                }
                ActionParams::StopAlarm => {
                    self.stop_alarm();
                    Ok(())
                }
                ActionParams::ForceLogout => self.force_logout().await,
                ActionParams::ScheduleShutdown { delay_seconds } => {
                    self.schedule_shutdown(*delay_seconds).await
                }
                ActionParams::RunCustomScript {
                    path,
                    args,
                    timeout_seconds,
                } => run_script(path, args, Duration::from_secs(*timeout_seconds)).await,
            }
        })
    }
}

/// Replays the sound until the task is aborted. The player is killed with
/// the task.
async fn loop_sound(player: String, args: Vec<String>) {
    loop {
        let status = Command::new(&player)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                warn!(%player, status = %s, "sound player failed; alarm stopped");
                return;
            }
            Err(e) => {
                warn!(%player, error = %e, "sound player could not start; alarm stopped");
                return;
            }
        }
    }
}

async fn run_command(program: &str, args: &[&str]) -> Result<(), CommandFailure> {
    if which::which(program).is_err() {
        return Err(CommandFailure::NotInstalled(program.to_string()));
    }
    debug!(program, ?args, "running");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CommandFailure::Denied(format!("{program}: {e}"))
            }
            _ => CommandFailure::Io(format!("failed to spawn '{program}': {e}")),
        })?;
    if output.status.success() {
        return Ok(());
    }
    Err(CommandFailure::Exit {
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Bare names are looked up on `PATH`; anything with a separator is used
/// as given.
fn resolve_script(path: &Path) -> Result<PathBuf, ActionError> {
    if path.components().count() == 1 && !path.is_absolute() {
        return which::which(path).map_err(|_| ActionError::ScriptNotFound(path.to_path_buf()));
    }
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(ActionError::ScriptNotFound(path.to_path_buf()))
    }
}

async fn run_script(path: &Path, args: &[String], timeout: Duration) -> Result<(), ActionError> {
    let script = resolve_script(path)?;
    let child = Command::new(&script)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true)
        .status();

    let status = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ActionError::PermissionDenied(format!(
                "{}: {e}",
                script.display()
            )));
        }
        Ok(Err(e)) => {
            return Err(ActionError::Unavailable(format!(
                "failed to spawn '{}': {e}",
                script.display()
            )));
        }
        Err(_) => {
            warn!(script = %script.display(), seconds = timeout.as_secs(), "custom script timed out");
            return Err(ActionError::ScriptFailed(-1));
        }
    };
    if status.success() {
        Ok(())
    } else {
        Err(ActionError::ScriptFailed(status.code().unwrap_or(-1)))
    }
}
