//! Configuration view and validation, `tandem config`.

use anyhow::Result;

use tandem::config::Project;

use super::super::ConfigCommands;
use super::print_json;

pub fn cmd_config(project: &Project, command: Option<ConfigCommands>, json: bool) -> Result<()> {
    let config_path = project.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            if json {
                return print_json(&project.config);
            }
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No tandem.toml at {}; showing defaults.", config_path.display());
            }
            println!("Effective values (file, then environment):");
            println!();
            print!("{}", toml::to_string_pretty(&project.config)?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = project.validate();
            if json {
                return print_json(&warnings);
            }
            println!();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}
