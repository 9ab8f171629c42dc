use crate::output::{print_json, print_table};
use anyhow::Context;
use powerguard_core::action::ActionParams;
use powerguard_core::config::Config;
use std::path::Path;

/// Print the ordered plan a trigger would run.
pub fn run(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let actions = &config.actions;
    let plan = actions.plan();

    if json {
        return print_json(&serde_json::json!({
            "mode": actions.mode,
            "pre_delay_seconds": actions.pre_delay_seconds,
            "grace_period_seconds": config.grace_period_seconds,
            "plan": plan,
        }));
    }

    println!(
        "Grace period {}s, {} mode, pre-delay {}s",
        config.grace_period_seconds, actions.mode, actions.pre_delay_seconds
    );
    if plan.is_empty() {
        println!("No enabled actions.");
        return Ok(());
    }

    let rows = plan
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            vec![
                (i + 1).to_string(),
                spec.kind().to_string(),
                spec.priority.to_string(),
                detail(&spec.params),
            ]
        })
        .collect();
    print_table(&["#", "ACTION", "PRIORITY", "DETAIL"], rows);
    Ok(())
}

fn detail(params: &ActionParams) -> String {
    match params {
        ActionParams::SoundAlarm { volume, sound } => match sound {
            Some(s) => format!("volume {volume}%, {}", s.display()),
            None => format!("volume {volume}%"),
        },
        ActionParams::ScheduleShutdown { delay_seconds } => format!("in {delay_seconds}s"),
        ActionParams::RunCustomScript {
            path,
            args,
            timeout_seconds,
        } => {
            let mut cmd = path.display().to_string();
            for a in args {
                cmd.push(' ');
                cmd.push_str(a);
            }
            format!("{cmd} (timeout {timeout_seconds}s)")
        }
        ActionParams::LockSession | ActionParams::StopAlarm | ActionParams::ForceLogout => {
            String::new()
        }
    }
}
