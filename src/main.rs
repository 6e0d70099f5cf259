//! Huddle CLI - terminal client for the Huddle chat service
//!
//! Direct messages, image sharing, presence and 1:1 calls from the
//! command line.

mod api;
mod auth;
mod calling;
mod config;
mod models;
mod realtime;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "huddle-cli")]
#[command(about = "Terminal client for the Huddle chat service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password
    Login {
        /// Account email
        email: String,

        /// Password (prompted when omitted)
        password: Option<String>,
    },

    /// Create an account
    Signup {
        /// Account email
        email: String,

        /// Password (prompted when omitted)
        password: Option<String>,

        /// Username for your profile
        #[arg(long)]
        username: Option<String>,

        /// First name for your profile
        #[arg(long)]
        first_name: Option<String>,

        /// Last name for your profile
        #[arg(long)]
        last_name: Option<String>,
    },

    /// Log out and clear the stored session
    Logout,

    /// Show current authentication status
    Status,

    /// Show current user info
    Whoami,

    /// Fill in your profile (username and display name)
    CompleteProfile {
        /// Unique username
        username: String,

        /// First name
        first_name: String,

        /// Last name
        last_name: String,
    },

    /// List users with online markers
    Users,

    /// Read recent messages exchanged with a user
    Read {
        /// Username of the other participant
        username: String,

        /// Maximum number of messages to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Send a message
    Send {
        /// Username of the recipient
        username: String,

        /// Message content
        message: String,
    },

    /// Send an image file
    SendImage {
        /// Username of the recipient
        username: String,

        /// Path to the image file
        path: String,
    },

    /// Stream new messages exchanged with a user
    Listen {
        /// Username of the other participant
        username: String,
    },

    /// Call a user
    Call {
        /// Username of the callee
        username: String,

        /// Audio-only call (no video track)
        #[arg(long)]
        audio_only: bool,
    },

    /// Place a loopback call to yourself (no network)
    CallTest {
        /// Duration in seconds to keep the call active
        #[arg(short, long, default_value = "5")]
        duration: u64,

        /// Audio-only call (no video track)
        #[arg(long)]
        audio_only: bool,
    },
}

/// Read a line from stdin with a label. Used when the password argument
/// is omitted.
fn prompt(label: &str) -> Result<String> {
    use std::io::Write;

    print!("{}: ", label);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt("Password")?,
            };
            auth::login(&email, &password).await?;
        }
        Commands::Signup {
            email,
            password,
            username,
            first_name,
            last_name,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt("Password")?,
            };
            auth::signup(
                &email,
                &password,
                username.as_deref(),
                first_name.as_deref(),
                last_name.as_deref(),
            )
            .await?;
        }
        Commands::Logout => {
            auth::logout().await?;
        }
        Commands::Status => {
            auth::status().await?;
        }
        Commands::Whoami => {
            api::whoami().await?;
        }
        Commands::CompleteProfile {
            username,
            first_name,
            last_name,
        } => {
            api::complete_profile(&username, &first_name, &last_name).await?;
        }
        Commands::Users => {
            api::list_users().await?;
        }
        Commands::Read { username, limit } => {
            api::read_messages(&username, limit).await?;
        }
        Commands::Send { username, message } => {
            api::send_message(&username, &message).await?;
        }
        Commands::SendImage { username, path } => {
            api::send_image(&username, &path).await?;
        }
        Commands::Listen { username } => {
            api::listen(&username).await?;
        }
        Commands::Call {
            username,
            audio_only,
        } => {
            calling::call_user(&username, audio_only).await?;
        }
        Commands::CallTest {
            duration,
            audio_only,
        } => {
            let result = calling::call_test::run_call_test(duration, audio_only).await?;
            if !result.passed() {
                anyhow::bail!("Call test failed");
            }
        }
    }

    Ok(())
}
