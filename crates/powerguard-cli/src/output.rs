use powerguard_core::event::{GuardEvent, TransitionCause};
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// One JSON object per line, for streaming output.
pub fn print_json_line<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string(value)?;
    println!("{}", json);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header_row: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_row.join("  ").trim_end());

    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", sep.join("  "));

    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = w)
            })
            .collect();
        println!("{}", cells.join("  ").trim_end());
    }
}

pub fn print_event(event: &GuardEvent, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json_line(event);
    }
    match event {
        GuardEvent::StateChanged { from, to, cause } => {
            println!("state: {from} -> {to} ({})", describe_cause(cause));
        }
        GuardEvent::GracePeriodTick { remaining_seconds } => {
            println!("grace period: {remaining_seconds}s left (send `cancel` to abort)");
        }
        GuardEvent::ExecutionFinished { result } => {
            let executed: Vec<&str> = result.executed.iter().map(|k| k.as_str()).collect();
            println!("actions executed: [{}]", executed.join(", "));
            for failed in &result.failed {
                println!("action failed: {} ({})", failed.kind, failed.error);
            }
        }
    }
    Ok(())
}

fn describe_cause(cause: &TransitionCause) -> String {
    match cause {
        TransitionCause::Arm => "armed by user".into(),
        TransitionCause::AutoArm { reason } => format!("auto-armed: {reason}"),
        TransitionCause::PowerLoss => "power lost".into(),
        TransitionCause::GraceCancelled => "cancelled".into(),
        TransitionCause::GraceExpired => "grace period expired".into(),
        TransitionCause::ExecutionFinished => "actions finished".into(),
        TransitionCause::Disarm => "disarmed by user".into(),
        TransitionCause::ForceDisarm => "force disarmed".into(),
    }
}
