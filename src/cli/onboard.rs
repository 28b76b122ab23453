use crate::auth::Auth;
use crate::config::{Config, StreakPolicy};
use crate::db::Database;
use anyhow::{Context, Result};
use dialoguer::{Input, Select, theme::ColorfulTheme};

pub fn run_onboarding() -> Result<Config> {
    println!("──────────────────────────────────────────");
    println!("  Welcome to Habitory onboarding.");
    println!("──────────────────────────────────────────");

    let theme = ColorfulTheme::default();

    println!("\n[1/3] Who are you?");
    let user_id: String = Input::with_theme(&theme)
        .with_prompt("  User id to sign in with")
        .validate_with(|input: &String| -> std::result::Result<(), &str> {
            if input.trim().is_empty() {
                Err("User id must not be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()
        .context("Failed to read user id")?;
    let user_id = user_id.trim().to_string();

    println!("\n[2/3] Local API port");
    let defaults = Config::default();
    let api_port: u16 = Input::with_theme(&theme)
        .with_prompt("  Port for `Habitory serve`")
        .default(defaults.api_port)
        .interact_text()
        .context("Failed to read API port")?;

    println!("\n[3/3] Streak policy");
    let policies = [StreakPolicy::Counter, StreakPolicy::History];
    let labels = [
        "counter  - +1 on completion, -1 on undo",
        "history  - recompute from completion dates",
    ];
    let selected = Select::with_theme(&theme)
        .with_prompt("  How should streaks be maintained?")
        .default(0)
        .items(&labels)
        .interact()
        .context("Failed to select streak policy")?;
    let streak_policy = policies.get(selected).copied().unwrap_or_default();

    let config = Config {
        api_port,
        streak_policy,
        ..defaults
    };

    config.ensure_bootstrap_files()?;
    config.save()?;
    let _ = Database::open(&config.db_path)?;

    let auth = Auth::load(&config.session_path)?;
    auth.sign_in(&user_id)?;

    println!("\n──────────────────────────────────────────");
    println!("  Onboarding complete!");
    println!("  Signed in as {user_id} ({streak_policy} streaks).");
    println!("  Run Habitory habits add \"<title>\" to get started.");
    println!("──────────────────────────────────────────");

    Ok(config)
}
