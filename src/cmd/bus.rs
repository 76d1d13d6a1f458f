//! Message bus access, `tandem bus`.

use anyhow::{Context, Result};

use tandem::bus::Delivery;
use tandem::config::Project;

use super::super::BusCommands;
use super::{open_bus, print_json};

pub async fn cmd_bus(project: &Project, command: BusCommands, json: bool) -> Result<()> {
    let bus = open_bus(project)?;

    match command {
        BusCommands::Register { identity } => {
            bus.register(&identity).await?;
            if !json {
                println!("Registered {}", identity);
            }
        }
        BusCommands::Unregister { identity } => {
            bus.unregister(&identity).await?;
            if !json {
                println!("Unregistered {}", identity);
            }
        }
        BusCommands::Send { from, to, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload must be valid JSON")?;
            let delivery = bus.send(&from, &to, payload).await?;
            if json {
                return print_json(&delivery);
            }
            match delivery {
                Delivery::Queued(id) => println!("Queued message {} for {}", id, to),
                Delivery::DeadLettered(id) => println!(
                    "{}",
                    console::style(format!("{} is not registered; dead letter {}", to, id)).yellow()
                ),
            }
        }
        BusCommands::Recv { identity, limit } => {
            let messages = bus.receive(&identity, limit).await?;
            if json {
                return print_json(&messages);
            }
            if messages.is_empty() {
                println!("No messages for {}", identity);
            }
            for m in &messages {
                println!(
                    "#{} from {} (attempt {}): {}",
                    m.id, m.sender, m.delivery_attempts, m.payload
                );
            }
        }
        BusCommands::Ack { identity, id } => {
            bus.ack(&identity, id).await?;
            if !json {
                println!("Acknowledged message {}", id);
            }
        }
        BusCommands::DeadLetters => {
            let letters = bus.dead_letters().await?;
            if json {
                return print_json(&letters);
            }
            if letters.is_empty() {
                println!("No dead letters.");
            }
            for d in &letters {
                println!(
                    "#{} {} -> {} ({}): {}",
                    d.id, d.sender, d.recipient, d.reason, d.payload
                );
            }
        }
    }

    Ok(())
}
