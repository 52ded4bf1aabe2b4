use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use std::time::Duration;
use stashpoint::client::{Credentials, DeviceLoginClient};
use stashpoint::{settings, storage, web};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "stashpoint",
    version,
    about = "Device-flow login service for the stashpoint CLI"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,

    /// Sign this machine in through a browser and store an API key
    Login {
        /// Base URL of the stashpoint server
        #[arg(long)]
        server: String,

        /// Where to write the credentials file
        #[arg(long)]
        credentials: Option<PathBuf>,

        /// Give up waiting for approval after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },

    /// Manage user accounts
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Create a user. The password is read from STASHPOINT_PASSWORD or stdin.
    Add {
        username: String,

        #[arg(long)]
        email: Option<String>,

        #[arg(long, env = "STASHPOINT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let settings = settings::Settings::load(&cli.config)?;
            tracing::info!(?settings, "Loaded configuration");

            let db = storage::init(&settings.database).await?;
            web::serve(settings, db).await?;
        }
        Command::Login {
            server,
            credentials,
            timeout_secs,
        } => login(server, credentials, Duration::from_secs(timeout_secs)).await?,
        Command::User {
            command:
                UserCommand::Add {
                    username,
                    email,
                    password,
                },
        } => {
            let settings = settings::Settings::load(&cli.config)?;
            let db = storage::init(&settings.database).await?;
            add_user(&db, &username, email, password).await?;
        }
    }

    Ok(())
}

async fn login(server: String, credentials: Option<PathBuf>, timeout: Duration) -> Result<()> {
    let path = match credentials.or_else(Credentials::default_path) {
        Some(path) => path,
        None => miette::bail!("no config directory found; pass --credentials"),
    };

    let client = DeviceLoginClient::new(&server).into_diagnostic()?;
    let authorization = client.start().await.into_diagnostic()?;

    eprintln!("To sign in, open:\n\n    {}\n", authorization.verify_url);
    eprintln!("and confirm the code {}", authorization.user_code);
    eprintln!("Waiting for approval...");

    let api_key = client
        .wait_for_approval(&authorization, timeout)
        .await
        .into_diagnostic()?;

    Credentials { server, api_key }
        .save(&path)
        .into_diagnostic()?;

    eprintln!("Logged in. Credentials saved to {}", path.display());
    Ok(())
}

async fn add_user(
    db: &sea_orm::DatabaseConnection,
    username: &str,
    email: Option<String>,
    password: Option<String>,
) -> Result<()> {
    if storage::get_user_by_username(db, username)
        .await
        .into_diagnostic()?
        .is_some()
    {
        miette::bail!("user {} already exists", username);
    }

    let password = match password {
        Some(password) => password,
        None => {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).into_diagnostic()?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    if password.is_empty() {
        miette::bail!("password must not be empty");
    }

    let user = storage::create_user(db, username, &password, email)
        .await
        .into_diagnostic()?;
    tracing::info!(username = %user.username, subject = %user.subject, "Created user");
    Ok(())
}
