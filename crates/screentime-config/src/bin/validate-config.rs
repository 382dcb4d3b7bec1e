//! Config validation CLI tool
//!
//! Validates a screentimed configuration file and reports any errors.

use screentime_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a screentimed configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            eprintln!("  validate-config config.example.toml");
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match screentime_config::load_config(&config_path) {
        Ok(policy) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", screentime_config::CURRENT_CONFIG_VERSION);
            println!("  Apps: {}", policy.apps.len());
            println!("  Reward basis: {:?}", policy.goals.reward_basis);

            if !policy.apps.is_empty() {
                println!();
                println!("Apps:");
                for app in &policy.apps {
                    let schedule = match &app.schedule {
                        None => "unrestricted".to_string(),
                        Some(s) if !s.is_enabled => "schedule disabled".to_string(),
                        Some(s) if s.has_goal() => {
                            format!("{} linked learning app(s)", s.linked_learning_apps.len())
                        }
                        Some(_) => "scheduled".to_string(),
                    };
                    println!(
                        "  - {} [{}]: {} ({} token(s), {})",
                        app.id.as_str(),
                        app.category,
                        app.label,
                        app.tokens.len(),
                        schedule
                    );
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                screentime_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                screentime_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                screentime_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                screentime_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        screentime_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
