mod api;
mod auth;
mod board;
mod cli;
mod config;
mod db;
mod habits;
mod notify;
mod stats;

use crate::auth::Auth;
use crate::board::{FeedEvent, FrequencyFilter, HabitBoard, StatusFilter};
use crate::cli::onboard::run_onboarding;
use crate::cli::{Cli, Commands, ConfigCommands, HabitCommands};
use crate::config::Config;
use crate::db::Database;
use crate::habits::model::{HabitPatch, NewHabit};
use crate::habits::service::HabitService;
use crate::habits::streak;
use crate::notify::{Notice, NoticeAction, NoticeLevel, Notifier};
use crate::stats::Timeframe;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Other processes write the same database, so `habits watch` also polls.
const WATCH_POLL_SECONDS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Onboard => {
            let _ = run_onboarding()?;
            Ok(())
        }
        Commands::Config { command } => handle_config_command(command),
        Commands::Login { user_id } => handle_login(&user_id),
        Commands::Logout => handle_logout(),
        Commands::Whoami => handle_whoami(),
        Commands::Status => handle_status(),
        Commands::Doctor => handle_doctor(),
        Commands::Serve { port } => handle_serve(port).await,
        Commands::Habits { command } => handle_habit_command(command).await,
        Commands::Stats { timeframe, json } => handle_stats(&timeframe, json),
        Commands::Reconcile => handle_reconcile(),
    }
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Set { key, value } => {
            let mut config = load_or_default_config()?;
            config.set_value(&key, &value)?;
            config.ensure_bootstrap_files()?;
            config.save()?;

            println!("Config saved: {key} = {value}");
            Ok(())
        }
        ConfigCommands::Get { key } => {
            let config = load_config()?;
            let value = config
                .get_value(&key)
                .with_context(|| format!("Unsupported config key: {key}"))?;

            println!("{value}");
            Ok(())
        }
    }
}

fn handle_login(user_id: &str) -> Result<()> {
    let config = load_or_default_config()?;
    let auth = Auth::load(&config.session_path)?;
    let session = auth.sign_in(user_id)?;

    println!("Signed in as {}", session.user_id);
    Ok(())
}

fn handle_logout() -> Result<()> {
    let config = load_or_default_config()?;
    let auth = Auth::load(&config.session_path)?;
    auth.sign_out()?;

    println!("Signed out");
    Ok(())
}

fn handle_whoami() -> Result<()> {
    let config = load_or_default_config()?;
    let auth = Auth::load(&config.session_path)?;

    match auth.session() {
        Some(session) => println!(
            "{} (since {})",
            session.user_id,
            session.signed_in_at.format("%Y-%m-%d %H:%M")
        ),
        None => println!("not signed in"),
    }

    Ok(())
}

fn handle_status() -> Result<()> {
    let config = load_config()?;
    let database = Database::open(&config.db_path)?;
    let auth = Auth::load(&config.session_path)?;

    println!("Habitory status");
    println!(
        "- signed_in_user: {}",
        auth.session()
            .map(|session| session.user_id)
            .unwrap_or_else(|| "none".to_string())
    );
    println!("- db_path: {}", config.db_path.display());
    println!("- habits_stored: {}", database.habit_count(None)?);
    println!(
        "- last_completed_on: {}",
        database
            .latest_completion_date(None)?
            .map(|date| date.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("- streak_policy: {}", config.streak_policy);
    println!("- api_port: {}", config.api_port);

    Ok(())
}

fn handle_doctor() -> Result<()> {
    let config_path = Config::config_path()?;
    let mut issues = Vec::new();

    if config_path.exists() {
        println!("[OK] config.json found: {}", config_path.display());
    } else {
        println!("[WARN] config.json not found: {}", config_path.display());
        issues.push("config missing".to_string());
    }

    let config = load_or_default_config()?;

    match Database::open(&config.db_path) {
        Ok(_) => println!("[OK] SQLite reachable: {}", config.db_path.display()),
        Err(error) => {
            println!("[WARN] SQLite check failed: {error}");
            issues.push("db unreachable".to_string());
        }
    }

    match Auth::load(&config.session_path) {
        Ok(auth) if auth.session().is_some() => {
            println!("[OK] session found: {}", config.session_path.display());
        }
        Ok(_) => {
            println!("[WARN] not signed in. Run Habitory login <user-id>");
            issues.push("no session".to_string());
        }
        Err(error) => {
            println!("[WARN] session file unreadable: {error}");
            issues.push("session unreadable".to_string());
        }
    }

    if issues.is_empty() {
        println!("doctor result: no issues");
    } else {
        println!("doctor result: {} warning(s)", issues.len());
    }

    Ok(())
}

async fn handle_serve(port: Option<u16>) -> Result<()> {
    let mut config = load_or_default_config()?;
    if let Some(port) = port {
        config.api_port = port;
    }
    config.ensure_bootstrap_files()?;

    let store = Arc::new(Database::open(&config.db_path)?);
    let auth = Arc::new(Auth::load(&config.session_path)?);
    let shared_config = Arc::new(config);

    info!("Habitory service started");

    tokio::select! {
        api_result = api::run_server(shared_config, store, auth) => {
            api_result?;
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn handle_habit_command(command: HabitCommands) -> Result<()> {
    let (service, mut notices) = open_service()?;

    match command {
        HabitCommands::List { frequency, status } => {
            let mut board = HabitBoard::new(service);
            board.refresh();
            board.set_frequency_filter(frequency.parse()?);
            board.set_status_filter(status.parse()?);

            print_board(&board);
            finish(true, &mut notices)
        }
        HabitCommands::Add {
            title,
            description,
            frequency,
            color,
        } => {
            let input = NewHabit {
                title,
                description,
                frequency: frequency.parse()?,
                color,
            };
            let created = service.create_habit(&input);
            if let Some(habit) = &created {
                println!("{}  {}", habit.id, habit.title);
            }
            finish(created.is_some(), &mut notices)
        }
        HabitCommands::Edit {
            id,
            title,
            description,
            frequency,
            color,
        } => {
            let patch = HabitPatch {
                title,
                description,
                frequency: frequency.as_deref().map(str::parse).transpose()?,
                color,
                streak: None,
            };
            let updated = service.update_habit(&id, &patch);
            finish(updated.is_some(), &mut notices)
        }
        HabitCommands::Delete { id } => {
            let deleted = service.delete_habit(&id);
            finish(deleted, &mut notices)
        }
        HabitCommands::Toggle { id } => {
            let toggled = service
                .find_habit(&id)
                .is_some_and(|habit| service.toggle_habit_completion(&habit));
            finish(toggled, &mut notices)
        }
        HabitCommands::Check { ids } => {
            let status = service.check_habit_completion_status(&ids);
            for id in &ids {
                let done = status.get(id).copied().unwrap_or(false);
                println!("{} {id}", if done { "[x]" } else { "[ ]" });
            }
            finish(true, &mut notices)
        }
        HabitCommands::History { id } => {
            let Some(habit) = service.find_habit(&id) else {
                return finish(false, &mut notices);
            };
            let dates = service.completion_history(&habit.id);
            let today = service.today();

            println!("{} ({})", habit.title, habit.frequency);
            println!(
                "- current_streak: {}",
                streak::current_streak(habit.frequency, &dates, today)
            );
            println!(
                "- longest_streak: {}",
                streak::longest_streak(habit.frequency, &dates, today)
            );
            println!("- stored_streak: {}", habit.streak);
            for date in dates.iter().rev() {
                println!("  {date}");
            }
            finish(true, &mut notices)
        }
        HabitCommands::Watch { frequency, status } => {
            let frequency: FrequencyFilter = frequency.parse()?;
            let status: StatusFilter = status.parse()?;
            watch_board(service, frequency, status, &mut notices).await
        }
    }
}

async fn watch_board(
    service: HabitService<Database>,
    frequency: FrequencyFilter,
    status: StatusFilter,
    notices: &mut broadcast::Receiver<Notice>,
) -> Result<()> {
    let mut board = HabitBoard::new(service);
    board.set_frequency_filter(frequency);
    board.set_status_filter(status);
    board.refresh();
    print_board(&board);
    print_notices(notices);

    let mut subscription = board.subscribe();
    let mut poll = tokio::time::interval(Duration::from_secs(WATCH_POLL_SECONDS));
    poll.tick().await;

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = subscription.next() => match event {
                Some(FeedEvent::Change(change)) => board.apply_change(&change),
                Some(FeedEvent::Resync) => board.refresh(),
                None => break,
            },
            _ = poll.tick() => board.refresh(),
            _ = &mut shutdown => {
                info!("watch stopped");
                break;
            }
        }

        println!();
        print_board(&board);
        print_notices(notices);
    }

    subscription.unsubscribe();
    Ok(())
}

fn handle_stats(timeframe: &str, json: bool) -> Result<()> {
    let timeframe: Timeframe = timeframe.parse()?;
    let (service, mut notices) = open_service()?;

    let report = service.statistics(timeframe);
    if let Some(report) = &report {
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(report).context("Failed to serialize statistics")?
            );
        } else {
            print!("{}", stats::render_text(report));
        }
    }

    finish(report.is_some(), &mut notices)
}

fn handle_reconcile() -> Result<()> {
    let (service, mut notices) = open_service()?;
    let signed_in = service.current_user().is_some();
    service.reconcile_streaks();

    finish(signed_in, &mut notices)
}

fn print_board(board: &HabitBoard<Database>) {
    println!(
        "{} of {} habit(s) [frequency: {}, status: {}]",
        board.filtered_habits().len(),
        board.habits().len(),
        board.frequency_filter(),
        board.status_filter()
    );

    for habit in board.filtered_habits() {
        let mark = if board.is_completed(&habit.id) {
            "[x]"
        } else {
            "[ ]"
        };
        println!(
            "{mark} {:<32} {:<8} streak {:>3}  {}",
            habit.title,
            habit.frequency.as_str(),
            habit.streak,
            habit.id
        );
    }
}

fn print_notices(notices: &mut broadcast::Receiver<Notice>) {
    for notice in notify::drain(notices) {
        match notice.level {
            NoticeLevel::Success => println!("✓ {}", notice.message),
            NoticeLevel::Error => eprintln!("! {}", notice.message),
        }
        if let Some(description) = &notice.description {
            eprintln!("  {description}");
        }
        if let Some(NoticeAction::UndoToggle { habit_id }) = &notice.action {
            println!("  undo: Habitory habits toggle {habit_id}");
        }
    }
}

fn finish(succeeded: bool, notices: &mut broadcast::Receiver<Notice>) -> Result<()> {
    print_notices(notices);
    if !succeeded {
        bail!("operation did not complete");
    }
    Ok(())
}

fn open_service() -> Result<(HabitService<Database>, broadcast::Receiver<Notice>)> {
    let config = load_config()?;
    let store = Arc::new(Database::open(&config.db_path)?);
    let auth = Arc::new(Auth::load(&config.session_path)?);

    let notifier = Notifier::new();
    let notices = notifier.subscribe();
    let service = HabitService::new(store, auth, notifier)
        .with_streak_policy(config.streak_policy)
        .with_default_color(&config.default_color);

    Ok((service, notices))
}

fn load_or_default_config() -> Result<Config> {
    Config::load().or_else(|_| {
        let config = Config::default();
        config.ensure_bootstrap_files()?;
        config.save()?;
        Ok(config)
    })
}

fn load_config() -> Result<Config> {
    Config::load().context("Config not found. Run Habitory onboard or Habitory config set first")
}
