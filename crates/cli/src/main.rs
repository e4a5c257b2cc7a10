use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cmsdesk_auth::{AuthService, BrowserOrPrint, LoginRequest, PrintUrl, SqliteCredentialStore};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Parser)]
#[command(name = "cmsdesk", about = "Sign in to content servers and manage credentials", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in to a server through its identity provider
    Login {
        /// Local name for the server
        server: String,
        /// Base URL of the content server
        #[arg(long)]
        url: String,
        /// Identity provider host (e.g. https://sso.example.com)
        #[arg(long)]
        provider: String,
        #[arg(long)]
        realm: String,
        #[arg(long)]
        client_id: String,
        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
    },
    /// Register a server with username and password
    Add {
        server: String,
        #[arg(long)]
        url: String,
        #[arg(short, long)]
        username: String,
        /// Read from stdin when omitted
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Check username and password against a server without storing them
    Validate {
        url: String,
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Show the user the stored credential authenticates as
    Whoami { server: String },
    /// List registered servers
    Servers,
    /// Forget a server and its credential
    Remove { server: String },
    /// Delete the stored credential but keep the server
    Logout { server: String },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cmsdesk=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cmsdesk_config::Config::load()?;

    if let Commands::Config = cli.command {
        let path = cmsdesk_config::Config::config_path();
        println!("Config path: {}", path.display());
        println!("Database: {}", config.database_path().display());
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    cmsdesk_config::Config::ensure_dirs()?;
    let db_path = config.database_path();
    let store = Arc::new(
        SqliteCredentialStore::open(&db_path)
            .with_context(|| format!("opening credential store at {}", db_path.display()))?,
    );
    let service = AuthService::start(&config.auth, store)
        .await
        .context("starting callback listener")?;

    match cli.command {
        Commands::Login {
            server,
            url,
            provider,
            realm,
            client_id,
            no_browser,
        } => {
            let request = LoginRequest {
                provider_host: provider,
                realm,
                client_id,
                remote_base_url: url,
            };
            let print = |url: &Url| eprintln!("Open this URL to sign in:\n\n  {url}\n");
            let surface: Box<dyn cmsdesk_auth::InteractiveSurface> = if no_browser {
                Box::new(PrintUrl::new(print))
            } else {
                Box::new(BrowserOrPrint::new(print))
            };

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_ctrl_c.cancel();
                }
            });

            eprintln!("Waiting for the browser redirect on {}", service.redirect_uri());
            match service.login(&server, &request, surface, &cancel).await {
                Ok(credential) => {
                    println!("Logged in to '{server}'.");
                    if let Some(expiry) = credential.token_expiry {
                        println!("Access token expires at {}", expiry.to_rfc3339());
                    }
                }
                Err(e) if e.is_user_cancelled() => {
                    eprintln!("Login cancelled.");
                }
                Err(e) => return Err(e).context("login failed"),
            }
        }
        Commands::Add {
            server,
            url,
            username,
            password,
        } => {
            let password = password_or_prompt(password)?;
            let report = service
                .register_basic(&server, &url, &username, &password)
                .await?;
            if report.valid {
                println!("Added '{server}' (admin: {}).", report.is_admin);
            } else {
                anyhow::bail!(
                    "credentials rejected: {}",
                    report.error.unwrap_or_default()
                );
            }
        }
        Commands::Validate {
            url,
            username,
            password,
        } => {
            let password = password_or_prompt(password)?;
            let report = service.validate(&url, &username, &password).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Whoami { server } => {
            let client = service.authenticate(&server).await?;
            let me = client.current_user().await?;
            println!("{}", me.display_name.as_deref().unwrap_or(&me.id));
            if let Some(email) = me.email.as_deref() {
                println!("  email: {email}");
            }
            println!("  admin: {}", me.capabilities.is_admin);
            println!("  auth:  {}", if client.is_bearer() { "oauth2" } else { "basic" });
        }
        Commands::Servers => {
            let servers = service.store().list_servers()?;
            if servers.is_empty() {
                println!("No servers registered.");
            }
            for (server, auth_type) in servers {
                let auth = auth_type.map_or("none".to_string(), |t| t.to_string());
                println!("{:<20} {:<8} {}", server.server_id, auth, server.base_url);
            }
        }
        Commands::Remove { server } => {
            if service.remove_server(&server)? {
                println!("Removed '{server}'.");
            } else {
                println!("No server named '{server}'.");
            }
        }
        Commands::Logout { server } => {
            if service.logout(&server)? {
                println!("Logged out of '{server}'.");
            } else {
                println!("No credential stored for '{server}'.");
            }
        }
        Commands::Config => unreachable!("handled above"),
    }

    service.shutdown();
    Ok(())
}

fn password_or_prompt(password: Option<String>) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    eprint!("Password: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
