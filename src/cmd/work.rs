//! Manual work-unit operations, `tandem work`.

use anyhow::{Result, anyhow};
use std::time::Duration;

use tandem::config::Project;
use tandem::work::{NewWorkUnit, ReviewStatus, UnitFilter, WorkStatus, WorkUnit};

use super::super::WorkCommands;
use super::{open_work, print_json};

pub async fn cmd_work(project: &Project, command: WorkCommands, json: bool) -> Result<()> {
    let work = open_work(project)?;

    match command {
        WorkCommands::Add {
            priority,
            order,
            group,
            id,
            scope,
            files,
        } => {
            let mut new = NewWorkUnit::new(priority, order)
                .with_scope(scope)
                .with_files(files);
            if let Some(group) = group {
                new = new.in_group(group);
            }
            if let Some(id) = id {
                new = new.with_id(id);
            }
            let unit = work.create_unit(new).await?;
            emit_unit(&unit, json)?;
        }
        WorkCommands::List {
            status,
            group,
            priority,
        } => {
            let status = status
                .map(|s| s.parse::<WorkStatus>())
                .transpose()
                .map_err(|e| anyhow!(e))?;
            let units = work
                .list_units(UnitFilter {
                    status,
                    related_works_id: group,
                    priority_number: priority,
                })
                .await?;
            if json {
                return print_json(&units);
            }
            print_table(&units);
        }
        WorkCommands::Show { id } => {
            let unit = work.get_unit(&id).await?;
            let commits = work.commits_for(&id).await?;
            if json {
                return print_json(&serde_json::json!({ "unit": unit, "commits": commits }));
            }
            print_unit(&unit);
            if !commits.is_empty() {
                println!("Commits:");
                for c in &commits {
                    let review = c
                        .review_status
                        .map(|s| format!(" [{} by {}]", s.as_str(), c.reviewed_by.as_deref().unwrap_or("?")))
                        .unwrap_or_default();
                    println!("  #{} {} {}{}", c.id, c.commit_reference, c.message, review);
                }
                println!();
            }
        }
        WorkCommands::Next { priority } => match work.query_next_for_priority(priority).await? {
            Some(unit) => emit_unit(&unit, json)?,
            None if json => print_json(&serde_json::Value::Null)?,
            None => println!("No claimable unit for priority {}", priority),
        },
        WorkCommands::Claim { worker, group } => {
            let unit = work.claim_next(&worker, group.as_deref()).await?;
            emit_unit(&unit, json)?;
        }
        WorkCommands::Start { id } => emit_unit(&work.mark_started(&id).await?, json)?,
        WorkCommands::Complete { id } => emit_unit(&work.mark_completed(&id).await?, json)?,
        WorkCommands::Fail { id, reason } => emit_unit(&work.mark_failed(&id, &reason).await?, json)?,
        WorkCommands::Release { id } => emit_unit(&work.release_claim(&id).await?, json)?,
        WorkCommands::Reset { id } => emit_unit(&work.reset_failed(&id).await?, json)?,
        WorkCommands::Commit {
            id,
            reference,
            message,
        } => {
            let commit = work.record_commit(&id, &reference, &message).await?;
            if json {
                return print_json(&commit);
            }
            println!("Recorded commit #{} ({}) for {}", commit.id, commit.commit_reference, id);
        }
        WorkCommands::Review {
            commit_id,
            reviewer,
            status,
            notes,
        } => {
            let status: ReviewStatus = status.parse().map_err(|e: String| anyhow!(e))?;
            let commit = work
                .attach_review(commit_id, &reviewer, status, notes.as_deref())
                .await?;
            if json {
                return print_json(&commit);
            }
            println!("Commit #{} marked {} by {}", commit.id, status.as_str(), reviewer);
        }
        WorkCommands::Reclaim { older_than_secs } => {
            let units = work.reclaim_stale(Duration::from_secs(older_than_secs)).await?;
            if json {
                return print_json(&units);
            }
            println!("Reclaimed {} stale claim(s)", units.len());
        }
    }

    Ok(())
}

fn emit_unit(unit: &WorkUnit, json: bool) -> Result<()> {
    if json {
        return print_json(unit);
    }
    print_unit(unit);
    Ok(())
}

fn styled_status(status: WorkStatus) -> console::StyledObject<&'static str> {
    let s = console::style(status.as_str());
    match status {
        WorkStatus::Completed => s.green(),
        WorkStatus::Failed => s.red(),
        WorkStatus::Claimed | WorkStatus::InProgress => s.yellow(),
        WorkStatus::Pending => s.dim(),
    }
}

fn print_unit(unit: &WorkUnit) {
    println!();
    println!("{} [{}]", console::style(&unit.id).bold(), styled_status(unit.status));
    println!("  priority:  {} / order {}", unit.priority_number, unit.priority_order);
    if let Some(group) = &unit.related_works_id {
        println!("  group:     {}", group);
    }
    if !unit.scope_description.is_empty() {
        println!("  scope:     {}", unit.scope_description);
    }
    if !unit.assigned_files.is_empty() {
        let files: Vec<&str> = unit.assigned_files.iter().map(String::as_str).collect();
        println!("  files:     {}", files.join(", "));
    }
    if let Some(worker) = &unit.claimed_by {
        println!("  worker:    {}", worker);
    }
    println!("  attempts:  {}", unit.attempts);
    if let Some(reason) = &unit.failure_reason {
        println!("  failure:   {}", reason);
    }
    println!();
}

fn print_table(units: &[WorkUnit]) {
    println!();
    if units.is_empty() {
        println!("No work units.");
        println!();
        return;
    }
    println!(
        "{:<38} {:<8} {:<16} {:<6} {:<12} Scope",
        "Unit", "Priority", "Group", "Order", "Status"
    );
    println!(
        "{:<38} {:<8} {:<16} {:<6} {:<12} -----",
        "-".repeat(38),
        "--------",
        "----------------",
        "------",
        "------------"
    );
    for unit in units {
        println!(
            "{:<38} {:<8} {:<16} {:<6} {:<12} {}",
            unit.id,
            unit.priority_number,
            unit.related_works_id.as_deref().unwrap_or("-"),
            unit.priority_order,
            unit.status.as_str(),
            unit.scope_description
        );
    }
    println!();
}
