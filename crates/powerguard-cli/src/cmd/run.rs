use crate::challenge::PassphraseChallenge;
use crate::executor::SystemExecutor;
use crate::output::{print_event, print_json_line};
use anyhow::Context;
use powerguard_core::auto_arm::AutoArmCoordinator;
use powerguard_core::config::Config;
use powerguard_core::error::{AuthError, Confirmation, CoordinationError, GuardError};
use powerguard_core::signal::{
    AutoArmSignal, LatestPower, LocationTracker, PowerStatus, TrustedNetworks,
};
use powerguard_core::Guard;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};

const HELP: &str = "\
commands:
  arm [--confirm] [PASSPHRASE]      arm protection (--confirm when on battery)
  disarm [--force] [PASSPHRASE]     disarm (--force while actions run)
  cancel [PASSPHRASE]               cancel a running grace period
  silence [PASSPHRASE]              stop a sounding alarm
  power connected|disconnected      report external power
  signal location-exit LABEL        report leaving a trusted location
  signal location LAT LON           report a position fix
  signal network [SSID]             report a Wi-Fi change (no SSID = lost)
  suspend SECONDS | resume          pause or resume auto-arm
  state                             show current state
  wait SECONDS                      pause command input
  quit";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Arm {
        confirm: bool,
        passphrase: Option<String>,
    },
    Disarm {
        force: bool,
        passphrase: Option<String>,
    },
    Cancel {
        passphrase: Option<String>,
    },
    Silence {
        passphrase: Option<String>,
    },
    Power(PowerStatus),
    LocationExit(String),
    Location {
        latitude: f64,
        longitude: f64,
    },
    Network(Option<String>),
    Suspend(u64),
    Resume,
    State,
    Wait(u64),
    Help,
    Quit,
}

impl Command {
    /// `Ok(None)` for blank lines and comments.
    fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        if verb.starts_with('#') {
            return Ok(None);
        }
        let rest: Vec<&str> = words.collect();

        let cmd = match verb {
            "arm" => {
                let (confirm, passphrase) = split_flag(&rest, "--confirm");
                Command::Arm {
                    confirm,
                    passphrase,
                }
            }
            "disarm" => {
                let (force, passphrase) = split_flag(&rest, "--force");
                Command::Disarm { force, passphrase }
            }
            "cancel" => Command::Cancel {
                passphrase: joined(&rest),
            },
            "silence" => Command::Silence {
                passphrase: joined(&rest),
            },
            "power" => match rest.as_slice() {
                ["connected"] => Command::Power(PowerStatus::Connected),
                ["disconnected"] => Command::Power(PowerStatus::Disconnected),
                _ => return Err("usage: power connected|disconnected".into()),
            },
            "signal" => parse_signal(&rest)?,
            "suspend" => Command::Suspend(parse_seconds(&rest, "suspend")?),
            "resume" => Command::Resume,
            "state" => Command::State,
            "wait" => Command::Wait(parse_seconds(&rest, "wait")?),
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("unknown command '{other}' (try `help`)")),
        };
        Ok(Some(cmd))
    }
}

fn split_flag(words: &[&str], flag: &str) -> (bool, Option<String>) {
    let set = words.contains(&flag);
    let rest: Vec<&str> = words.iter().copied().filter(|w| *w != flag).collect();
    (set, joined(&rest))
}

fn joined(words: &[&str]) -> Option<String> {
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

fn parse_seconds(words: &[&str], verb: &str) -> Result<u64, String> {
    match words {
        [n] => n
            .parse()
            .map_err(|_| format!("{verb}: '{n}' is not a number of seconds")),
        _ => Err(format!("usage: {verb} SECONDS")),
    }
}

fn parse_signal(words: &[&str]) -> Result<Command, String> {
    match words {
        ["location-exit", label @ ..] if !label.is_empty() => {
            Ok(Command::LocationExit(label.join(" ")))
        }
        ["location", lat, lon] => {
            let latitude = lat.parse().map_err(|_| format!("bad latitude '{lat}'"))?;
            let longitude = lon.parse().map_err(|_| format!("bad longitude '{lon}'"))?;
            Ok(Command::Location {
                latitude,
                longitude,
            })
        }
        ["network"] => Ok(Command::Network(None)),
        ["network", ssid @ ..] => Ok(Command::Network(Some(ssid.join(" ")))),
        _ => Err("usage: signal location-exit LABEL | location LAT LON | network [SSID]".into()),
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "reply", content = "message", rename_all = "snake_case")]
enum Reply {
    Ok(String),
    Error(String),
}

fn print_reply(reply: &Reply, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json_line(reply);
    }
    match reply {
        Reply::Ok(m) => println!("ok: {m}"),
        Reply::Error(m) => println!("error: {m}"),
    }
    Ok(())
}

/// Error text with the follow-up the user can take.
fn explain(err: &GuardError) -> String {
    match err {
        GuardError::Coordination(CoordinationError::ConfirmationRequired(Confirmation::NoPower)) => {
            format!("{err}; repeat with `arm --confirm`")
        }
        GuardError::Coordination(CoordinationError::ConfirmationRequired(
            Confirmation::ForceDisarm,
        )) => format!("{err}; repeat with `disarm --force`"),
        GuardError::Auth(AuthError::UserCancelled) => {
            format!("{err}; pass the passphrase after the command")
        }
        GuardError::Auth(AuthError::NoPasscode) => {
            format!("{err}; set one with `powerguard config passphrase`")
        }
        _ => err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session {
    guard: Guard,
    coordinator: AutoArmCoordinator,
    challenge: Arc<PassphraseChallenge>,
    power: Arc<LatestPower>,
    power_tx: mpsc::Sender<PowerStatus>,
    signal_tx: mpsc::Sender<AutoArmSignal>,
    tracker: LocationTracker,
    trusted: TrustedNetworks,
}

impl Session {
    async fn execute(&mut self, cmd: Command) -> anyhow::Result<Reply> {
        let reply = match cmd {
            Command::Arm {
                confirm,
                passphrase,
            } => {
                self.challenge.offer(passphrase);
                self.outcome(self.guard.request_arm(confirm).await, "armed")
            }
            Command::Disarm { force, passphrase } => {
                self.challenge.offer(passphrase);
                self.outcome(self.guard.request_disarm(force).await, "disarmed")
            }
            Command::Cancel { passphrase } => {
                self.challenge.offer(passphrase);
                self.outcome(
                    self.guard.cancel_pending_trigger().await,
                    "pending trigger cancelled",
                )
            }
            Command::Silence { passphrase } => {
                self.challenge.offer(passphrase);
                self.outcome(self.guard.stop_alarm().await, "alarm stopped")
            }
            Command::Power(status) => {
                self.power.set(status);
                self.power_tx
                    .send(status)
                    .await
                    .context("power channel closed")?;
                Reply::Ok(format!("power {status}"))
            }
            Command::LocationExit(label) => {
                self.send_signal(AutoArmSignal::left_location(label)).await?
            }
            Command::Location {
                latitude,
                longitude,
            } => match self.tracker.update(latitude, longitude) {
                Some(signal) => self.send_signal(signal).await?,
                None => Reply::Ok("no boundary crossed".into()),
            },
            Command::Network(ssid) => {
                let signal = self.trusted.classify(ssid.as_deref());
                self.send_signal(signal).await?
            }
            Command::Suspend(secs) => {
                self.coordinator.suspend(Duration::from_secs(secs));
                Reply::Ok(format!("auto-arm suspended for {secs}s"))
            }
            Command::Resume => {
                self.coordinator.resume();
                Reply::Ok("auto-arm resumed".into())
            }
            Command::State => Reply::Ok(self.describe_state()),
            Command::Wait(secs) => {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Reply::Ok(format!("waited {secs}s"))
            }
            Command::Help => Reply::Ok(HELP.into()),
            Command::Quit => Reply::Ok("bye".into()),
        };
        Ok(reply)
    }

    fn outcome(&self, result: powerguard_core::Result<()>, done: &str) -> Reply {
        // Consumed by the challenge when prompted; drop it otherwise.
        self.challenge.offer(None);
        match result {
            Ok(()) => Reply::Ok(done.into()),
            Err(e) => Reply::Error(explain(&e)),
        }
    }

    async fn send_signal(&self, signal: AutoArmSignal) -> anyhow::Result<Reply> {
        let description = signal.describe();
        self.signal_tx
            .send(signal)
            .await
            .context("signal channel closed")?;
        Ok(Reply::Ok(format!("signal: {description}")))
    }

    fn describe_state(&self) -> String {
        let mut parts = vec![self.guard.state().to_string()];
        if let Some(deadline) = self.guard.grace_deadline() {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            parts.push(format!("{}s until trigger", left.as_secs()));
        }
        if let Some(lockout) = self.guard.auth().lockout_remaining() {
            parts.push(format!("auth locked for {}s", lockout.as_secs().max(1)));
        }
        if self.coordinator.is_suspended() {
            parts.push("auto-arm suspended".into());
        } else if self.coordinator.has_pending() {
            parts.push("auto-arm pending".into());
        }
        parts.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(path: &Path, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let warnings = config.validate();
    for w in &warnings {
        warn!(level = ?w.level, "config: {}", w.message);
    }
    if Config::has_errors(&warnings) {
        anyhow::bail!("config has errors; run `powerguard config validate`");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(config, dry_run, json))
}

async fn serve(config: Config, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let challenge = Arc::new(PassphraseChallenge::new(
        config.auth.passphrase_sha256.clone(),
    ));
    let power = Arc::new(LatestPower::new(PowerStatus::Connected));
    let guard = Guard::from_config(
        &config,
        challenge.clone(),
        Arc::new(SystemExecutor::new(dry_run)),
        power.clone(),
    );
    let coordinator = AutoArmCoordinator::new(Arc::new(guard.clone()), config.auto_arm.clone());

    let (power_tx, power_rx) = mpsc::channel(16);
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let power_task = guard.attach_power(power_rx);
    let signal_task = coordinator.attach(signal_rx);

    let mut events = guard.subscribe();
    let mut session = Session {
        guard,
        coordinator,
        challenge,
        power,
        power_tx,
        signal_tx,
        tracker: LocationTracker::new(config.auto_arm.trusted_locations.clone()),
        trusted: config.auto_arm.trusted_networks.clone(),
    };

    info!(
        grace_period = config.grace_period_seconds,
        dry_run, "powerguard running; type `help` for commands"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match Command::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(cmd)) => {
                        let reply = session.execute(cmd).await?;
                        print_reply(&reply, json)?;
                    }
                    Err(msg) => print_reply(&Reply::Error(msg), json)?,
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event, json)?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let Session {
        power_tx,
        signal_tx,
        coordinator,
        ..
    } = session;
    drop(power_tx);
    drop(signal_tx);
    let _ = power_task.await;
    let _ = signal_task.await;
    if coordinator.cancel_pending() {
        info!("pending auto-arm dropped on exit");
    }

    while let Ok(event) = events.try_recv() {
        print_event(&event, json)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
