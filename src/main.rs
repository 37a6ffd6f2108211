//! Pushover Open Client CLI - receives Pushover notifications on this machine.
//!
//! This is the main binary entry point. See the `pushover_open_client`
//! library for the core functionality.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use pushover_open_client::{
    connection, ApiOutcome, Config, Credentials, CredentialsError, Dispatcher, Endpoints,
    HttpTransport, LoginOutcome, Registry, Session,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "pushover-open-client")]
#[command(version)]
#[command(about = "Receive Pushover notifications and dispatch them to local handlers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap the device if needed, then listen for notifications
    Run,
    /// Log in and store the device secret
    Login {
        /// Account email (defaults to the credentials file)
        #[arg(long)]
        email: Option<String>,
        /// Account password (defaults to the credentials file)
        #[arg(long)]
        password: Option<String>,
        /// Two-factor code; prompted for when required and omitted
        #[arg(long)]
        twofa: Option<String>,
    },
    /// Register this machine as a new device
    Register {
        /// Device name (letters, digits, `_` and `-`, 25 characters max)
        #[arg(long)]
        name: Option<String>,
    },
    /// Download pending messages and print them as JSON
    Download,
    /// Acknowledge messages up to an id (default: the highest pending one)
    Delete {
        /// Highest message id to acknowledge
        #[arg(long)]
        last_id: Option<i64>,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Ok(path) = std::env::var("PUSHOVER_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

/// HTTP session for `config`; a missing credentials file is not an error here.
fn open_session(config: &Config) -> Result<Session> {
    let mut session = Session::new(
        Box::new(HttpTransport::new()?),
        Endpoints::new(&config.api_url),
        Credentials::default(),
    )
    .with_credentials_path(&config.credentials_file);

    if let Err(e) = session.load_credentials() {
        match e.downcast_ref::<CredentialsError>() {
            Some(CredentialsError::FileNotFound(_)) => {
                log::debug!("No credentials file yet at {}", config.credentials_file.display());
            }
            _ => return Err(e),
        }
    }
    Ok(session)
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_string())
}

fn login(
    config: &Config,
    email: Option<String>,
    password: Option<String>,
    twofa: Option<String>,
) -> Result<()> {
    let mut session = open_session(config)?;
    if let (Some(email), Some(password)) = (email.as_deref(), password.as_deref()) {
        session.load_from_email_and_password(email, password)?;
    }
    if let Some(code) = twofa.as_deref() {
        session.set_twofa(code);
    }

    let mut outcome = session.login(email.as_deref(), password.as_deref(), None)?;
    if matches!(outcome, LoginOutcome::NeedsTwofa) && twofa.is_none() {
        let code = prompt("Two-factor code")?;
        session.set_twofa(&code);
        outcome = session.login(email.as_deref(), password.as_deref(), None)?;
    }

    match outcome {
        LoginOutcome::Secret(_) => {
            println!(
                "Logged in. Credentials saved to {}",
                config.credentials_file.display()
            );
            Ok(())
        }
        LoginOutcome::NeedsTwofa => anyhow::bail!("Login requires a valid two-factor code"),
        LoginOutcome::Rejected(errors) => anyhow::bail!("Login failed: {errors}"),
    }
}

fn run(config: &Config) -> Result<()> {
    let mut session = Session::from_config(config)?;
    let credentials = session.credentials();
    let ready = credentials.secret.is_some() && credentials.device_id.is_some();

    if !ready {
        log::info!("No registered device yet, bootstrapping");
        session.bootstrap(config.device_name.as_deref())?;
    }

    let registry = Registry::from_config(config);
    let mut dispatcher =
        Dispatcher::new(session, registry).with_device_name(config.device_name.clone());

    // Pick up anything queued while we were offline.
    if ready {
        dispatcher.sync()?;
    }

    connection::run(&mut dispatcher, &config.websocket_url)
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Run => run(&config)?,
        Commands::Login {
            email,
            password,
            twofa,
        } => login(&config, email, password, twofa)?,
        Commands::Register { name } => {
            let mut session = Session::from_config(&config)?;
            let name = name.or_else(|| config.device_name.clone());
            let device_id = session
                .register_device(name.as_deref(), None)?
                .into_result("Device registration")?;
            println!("Registered device {device_id}");
        }
        Commands::Download => {
            let mut session = Session::from_config(&config)?;
            let messages = session
                .download_messages(None, None)?
                .into_result("Message download")?;
            let values: Vec<_> = messages.iter().map(|m| m.to_value()).collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        Commands::Delete { last_id } => {
            let mut session = Session::from_config(&config)?;
            let last_id = match last_id {
                Some(id) => Some(id),
                None => session.highest_message_id(true)?,
            };
            match session.delete_all_messages(None, None, last_id)? {
                ApiOutcome::Success(Some(id)) => println!("Acknowledged messages through {id}"),
                ApiOutcome::Success(None) => println!("No messages to acknowledge"),
                ApiOutcome::Rejected(errors) => anyhow::bail!("Acknowledgement failed: {errors}"),
            }
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("Saved to {}", Config::config_path()?.display());
            }
        }
    }

    Ok(())
}
