//! Pavlok CLI
//!
//! Sign in to Pavlok and send stimuli from the command line.

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use pavlok::{
    Config, LocalOptions, Mode, PavlokClient, StepsQuery, Stimulus, StimulusRequest, VERSION,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pavlok")]
#[command(version = VERSION)]
#[command(about = "Send stimuli to a Pavlok device", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// OAuth client ID
    #[arg(long, env = "PAVLOK_CLIENT_ID", global = true)]
    client_id: Option<String>,

    /// OAuth client secret
    #[arg(long, env = "PAVLOK_CLIENT_SECRET", hide_env_values = true, global = true)]
    client_secret: Option<String>,

    /// Pavlok API base URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Port for the local login callback server
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Token file location
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,

    /// Don't keep the token between runs
    #[arg(long, global = true)]
    no_save: bool,

    /// Give up on login after this many seconds
    #[arg(long, global = true)]
    login_timeout: Option<u64>,

    /// Verbose logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in through the browser
    Login,

    /// Forget the saved token
    Logout,

    /// Beep the device
    Beep {
        /// Intensity 1-255 (1-4 with --tone)
        #[arg(default_value = "127")]
        intensity: u32,

        /// Use the legacy four-tone beep
        #[arg(long)]
        tone: bool,

        #[arg(long, short)]
        message: Option<String>,
    },

    /// Vibrate the device
    Vibrate {
        /// Intensity 1-255
        #[arg(default_value = "127")]
        intensity: u32,

        #[arg(long, short)]
        message: Option<String>,
    },

    /// Shock the device
    Zap {
        /// Intensity 1-255
        #[arg(default_value = "127")]
        intensity: u32,

        #[arg(long, short)]
        message: Option<String>,
    },

    /// Play a pattern of stimuli
    Pattern {
        /// Comma-separated stimuli (beep, vibrate, shock/zap)
        #[arg(value_delimiter = ',')]
        stimuli: Vec<String>,

        /// Intensity 1-255
        #[arg(long, default_value = "127")]
        intensity: u32,

        /// Number of repetitions
        #[arg(long, default_value = "1")]
        count: u32,

        #[arg(long, short)]
        message: Option<String>,
    },

    /// Show the user's profile
    Me,

    /// Show step counts
    Steps {
        /// First day (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last day (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// Show configuration, or save the given credentials
    Config {
        /// Save the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let saved = Config::load().context("could not read config file")?;
    let config = build_config(&cli.global, saved)?;
    init_logging(config.verbose);

    let client = PavlokClient::new(config).context("invalid Pavlok configuration")?;

    match cli.command {
        Commands::Login => {
            let token = client.login().await?;
            println!("Signed in (token {}...)", token.chars().take(8).collect::<String>());
        }
        Commands::Logout => {
            client.logout()?;
            println!("Signed out.");
        }
        Commands::Beep {
            intensity,
            tone,
            message,
        } => {
            let stimulus = if tone {
                Stimulus::BeepTone
            } else {
                Stimulus::Beep
            };
            send(&client, stimulus, request(intensity, message)).await?;
        }
        Commands::Vibrate { intensity, message } => {
            send(&client, Stimulus::Vibration, request(intensity, message)).await?;
        }
        Commands::Zap { intensity, message } => {
            send(&client, Stimulus::Shock, request(intensity, message)).await?;
        }
        Commands::Pattern {
            stimuli,
            intensity,
            count,
            message,
        } => {
            let request = request(intensity, message)
                .with_pattern(stimuli)
                .with_count(count);
            send(&client, Stimulus::Pattern, request).await?;
        }
        Commands::Me => {
            ensure_login(&client).await?;
            println!("{}", client.me(None).await?);
        }
        Commands::Steps { from, to } => {
            ensure_login(&client).await?;
            println!("{}", client.steps(StepsQuery { from, to }, None).await?);
        }
        Commands::Config { save } => {
            cmd_config(client.config(), save)?;
        }
    }

    Ok(())
}

/// Default log filter when `RUST_LOG` is unset.
fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "pavlok=debug,info"
    } else {
        "warn"
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Merge the saved config file with command line overrides.
fn build_config(args: &GlobalArgs, saved: Option<Config>) -> anyhow::Result<Config> {
    let mut config = match (saved, &args.client_id, &args.client_secret) {
        (_, Some(id), Some(secret)) => Config::new(id.clone(), secret.clone()),
        (Some(saved), _, _) => saved,
        (None, _, _) => bail!(
            "no credentials: pass --client-id/--client-secret, set PAVLOK_CLIENT_ID/PAVLOK_CLIENT_SECRET, or run `pavlok config --save`"
        ),
    };

    if let Some(url) = &args.api_url {
        config.base_url = url.clone();
    }
    config.verbose |= args.verbose;

    let mut local = match config.mode {
        Mode::Client(local) => local,
        Mode::Server(_) => LocalOptions::default(),
    };
    if let Some(port) = args.port {
        local.port = port;
    }
    if let Some(path) = &args.token_file {
        local.token_path = path.clone();
    }
    if args.no_save {
        local.save = false;
    }
    if let Some(secs) = args.login_timeout {
        local.login_timeout = Some(Duration::from_secs(secs));
    }
    config.mode = Mode::Client(local);

    Ok(config)
}

fn request(intensity: u32, message: Option<String>) -> StimulusRequest {
    let request = StimulusRequest::new(intensity);
    match message {
        Some(message) => request.with_message(message),
        None => request,
    }
}

async fn ensure_login(client: &PavlokClient) -> anyhow::Result<()> {
    if !client.is_logged_in() {
        println!("Signing in to Pavlok...");
        client.login().await?;
    }
    Ok(())
}

async fn send(
    client: &PavlokClient,
    stimulus: Stimulus,
    request: StimulusRequest,
) -> anyhow::Result<()> {
    ensure_login(client).await?;
    let message = client.send(stimulus, request).await?;
    println!("{message}");
    Ok(())
}

fn cmd_config(config: &Config, save: bool) -> anyhow::Result<()> {
    config.validate()?;

    if save {
        config.save()?;
        println!("Saved to {:?}", Config::config_path());
        return Ok(());
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();

    let mut shown = serde_json::to_value(config)?;
    shown["credentials"]["client_secret"] = serde_json::Value::from("<redacted>");
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}
