mod server;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use depeche_meta::MetaStore;
use depeche_user::config::{read_config, Config, LogOutput};
use depeche_user::login::hash_password;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, env = "DEPECHE_CONFIG", default_value = "depeche.toml")]
    /// Path to the main Dépêche configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the mail server daemon
    Daemon,

    /// Manage accounts in the metadata database
    #[clap(subcommand)]
    Account(AccountManagement),

    /// Specific tooling, should not be part of a normal workflow, for debug & experimentation only
    #[clap(subcommand)]
    Tools(ToolsCommand),
}

#[derive(Subcommand, Debug)]
enum AccountManagement {
    /// Add an account
    Add {
        #[clap(short, long)]
        address: String,
        #[clap(env = "DEPECHE_PASSWORD")]
        maybe_password: Option<String>,
    },
    /// Delete an account and everything it owns
    Delete {
        #[clap(short, long)]
        address: String,
    },
    /// Change password for a given account
    ChangePassword {
        #[clap(short, long)]
        address: String,
        #[clap(env = "DEPECHE_NEW_PASSWORD")]
        maybe_password: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ToolsCommand {
    /// Hash a password the way the accounts table stores it
    PasswordHash {
        #[clap(env = "DEPECHE_PASSWORD")]
        maybe_password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "depeche=info")
    }

    // Abort on panic instead of unwinding through half-written state.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{}", panic_info);
        eprintln!("{:?}", backtrace::Backtrace::new());
        std::process::abort();
    }));

    let args = Args::parse();
    let config = read_config(args.config_file.clone())
        .with_context(|| format!("unable to read {:?}", args.config_file))?;
    tracer(&config);

    match args.command {
        Command::Daemon => server::run(config).await,
        Command::Account(cmd) => account_management(&config, cmd).await,
        Command::Tools(ToolsCommand::PasswordHash { maybe_password }) => {
            let password = prompt_or(maybe_password, "Enter password: ")?;
            println!("{}", hash_password(&password)?);
            Ok(())
        }
    }
}

fn tracer(config: &Config) {
    if config.log_output == LogOutput::Syslog {
        eprintln!("warning: log_output = \"syslog\" is not wired yet, logging to stderr");
    }
    let filter = match config.debug {
        true => tracing_subscriber::EnvFilter::new("debug"),
        false => tracing_subscriber::EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn account_management(config: &Config, cmd: AccountManagement) -> Result<()> {
    let meta = MetaStore::connect(&config.database)
        .await
        .context("database must be reachable for account management")?;

    match cmd {
        AccountManagement::Add {
            address,
            maybe_password,
        } => {
            tracing::debug!(user = %address, "will-create");
            let password = prompt_confirmed(maybe_password)?;
            let hash = hash_password(&password).context("unable to hash password")?;
            meta.create_account(&address, &hash).await?;
            println!("created account {}", address);
        }
        AccountManagement::Delete { address } => {
            tracing::debug!(user = %address, "will-delete");
            meta.delete_account(&address).await?;
            println!("deleted account {}", address);
        }
        AccountManagement::ChangePassword {
            address,
            maybe_password,
        } => {
            let password = prompt_confirmed(maybe_password)?;
            let hash = hash_password(&password).context("unable to hash password")?;
            meta.set_password(&address, &hash).await?;
            println!("password changed for {}", address);
        }
    }
    Ok(())
}

fn prompt_or(maybe_password: Option<String>, prompt: &str) -> Result<String> {
    match maybe_password {
        Some(pwd) => Ok(pwd),
        None => Ok(rpassword::prompt_password(prompt)?),
    }
}

fn prompt_confirmed(maybe_password: Option<String>) -> Result<String> {
    match maybe_password {
        Some(pwd) => Ok(pwd),
        None => {
            let password = rpassword::prompt_password("Enter password: ")?;
            let password_confirm = rpassword::prompt_password("Confirm password: ")?;
            if password != password_confirm {
                bail!("Passwords don't match.");
            }
            Ok(password)
        }
    }
}
