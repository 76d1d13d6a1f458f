//! Feature flags, rollback and journal export.

use anyhow::{Result, anyhow, bail};
use serde_json::json;

use tandem::config::Project;
use tandem::migration::{EventKind, FlagKey, RollbackEvent, Scope};

use super::super::{ExportCommands, FlagsCommands, OnOff, RollbackCommands};
use super::{open_migration, print_json};

pub fn cmd_flags(project: &Project, command: FlagsCommands, json: bool) -> Result<()> {
    let migration = open_migration(project)?;

    let doc = match command {
        FlagsCommands::Status => migration.flags.snapshot(),
        FlagsCommands::EnablePhase { number } => migration.flags.enable_phase(number)?,
        FlagsCommands::EnableRole { role } => migration.flags.enable_role(&role)?,
        FlagsCommands::Set { key, value } => {
            let key: FlagKey = key.parse().map_err(|e: String| anyhow!(e))?;
            migration.flags.set(&key, matches!(value, OnOff::On))?
        }
    };

    if json {
        return print_json(&*doc);
    }

    println!();
    println!("Flags v{} (updated {})", doc.version, doc.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if doc.roles.is_empty() {
        println!();
        println!("No roles configured. Add [migration.roles.<name>] to tandem.toml.");
        println!();
        return Ok(());
    }
    for phase in &doc.phases {
        println!("  phase {} {}: {}", phase.number, phase.name, phase.roles.join(", "));
    }
    println!();
    for (role, flags) in &doc.roles {
        println!("{} {}", on_off(flags.enabled), console::style(role).bold());
        for (op, on) in &flags.operations {
            let effective = doc.is_enabled(role, Some(op));
            let note = if *on && !effective { " (role off)" } else { "" };
            println!("    {} {}{}", on_off(*on), op, note);
        }
        if !flags.depends_on.is_empty() {
            println!("    depends on: {}", flags.depends_on.join(", "));
        }
    }
    println!();
    Ok(())
}

fn on_off(on: bool) -> console::StyledObject<&'static str> {
    if on {
        console::style("[on] ").green()
    } else {
        console::style("[off]").dim()
    }
}

pub fn cmd_rollback(project: &Project, command: RollbackCommands, json: bool) -> Result<()> {
    let migration = open_migration(project)?;
    let rollback = &migration.rollback;

    let event = match command {
        RollbackCommands::Role { role, reason } => rollback.rollback_role(&role, &reason)?,
        RollbackCommands::Phase { number, reason } => rollback.rollback_phase(number, &reason)?,
        RollbackCommands::All { reason } => rollback.rollback_all(&reason)?,
        RollbackCommands::History => {
            let history = rollback.history()?;
            if json {
                return print_json(&history);
            }
            println!();
            if history.is_empty() {
                println!("No rollback events.");
            }
            for event in &history {
                print_event(event);
            }
            println!();
            return Ok(());
        }
    };

    if json {
        return print_json(&event);
    }
    print_event(&event);
    Ok(())
}

pub fn cmd_re_enable(
    project: &Project,
    role: Option<String>,
    phase: Option<u32>,
    all: bool,
    reason: &str,
    json: bool,
) -> Result<()> {
    let scope = match (role, phase, all) {
        (Some(role), None, false) => Scope::Role(role),
        (None, Some(n), false) => Scope::Phase(n),
        (None, None, true) => Scope::System,
        _ => bail!("Specify exactly one of --role, --phase or --all"),
    };
    let migration = open_migration(project)?;
    let event = migration.rollback.re_enable(scope, reason)?;
    if json {
        return print_json(&event);
    }
    print_event(&event);
    Ok(())
}

fn print_event(event: &RollbackEvent) {
    let kind = match event.kind {
        EventKind::Rollback => console::style("rollback ").red(),
        EventKind::ReEnable => console::style("re-enable").green(),
    };
    let flags: Vec<String> = event.flags.iter().map(ToString::to_string).collect();
    println!(
        "{} {} {} \"{}\": {}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        kind,
        event.scope,
        event.reason,
        if flags.is_empty() { "(nothing changed)".to_string() } else { flags.join(", ") }
    );
}

pub fn cmd_export(project: &Project, command: ExportCommands, json: bool) -> Result<()> {
    let migration = open_migration(project)?;

    let (what, count, output) = match command {
        ExportCommands::Comparisons { output } => {
            ("comparison records", migration.wrapper.journal().export_to(&output)?, output)
        }
        ExportCommands::Rollbacks { output } => {
            ("rollback events", migration.rollback.journal().export_to(&output)?, output)
        }
        ExportCommands::Report => {
            let report = migration.wrapper.report_from_journal()?;
            if json {
                return print_json(&report);
            }
            println!();
            println!(
                "{:<24} {:<8} {:<8} {:<12} {:<12} Ratio",
                "Operation", "Calls", "Diverged", "Legacy ms", "New ms"
            );
            for r in &report {
                println!(
                    "{:<24} {:<8} {:<8} {:<12.2} {:<12.2} {}",
                    format!("{}.{}", r.role, r.operation),
                    r.comparisons,
                    r.mismatches,
                    r.mean_legacy_ms,
                    r.mean_new_ms,
                    r.latency_ratio.map(|x| format!("{:.2}", x)).unwrap_or_else(|| "-".into())
                );
            }
            println!();
            return Ok(());
        }
    };

    if json {
        return print_json(&json!({ "exported": count, "output": output }));
    }
    println!("Exported {} {} to {}", count, what, output.display());
    Ok(())
}
