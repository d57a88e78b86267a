#[macro_use]
extern crate prettytable;

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{crate_version, value_parser, Arg, ArgMatches, Command};
use dotenv::dotenv;
use prettytable::Table;
use tokio::io::{AsyncBufReadExt, BufReader};

use timecard::client::state::{FilePersistence, Session, SharedState};
use timecard::client::{
    content_type_for, format_progress, format_seconds, ApiClient, ClientError, LiveTimer,
    DEFAULT_BASE_URL,
};

const RECONCILE_EVERY: Duration = Duration::from_secs(30);
const SESSION_FILE: &str = ".timecard_session.json";

fn cli() -> Command {
    Command::new("timecard")
        .version(crate_version!())
        .author("Samuel Vanderwaal")
        .about("A time-tracking command line program.")
        .subcommand_required(true)
        .subcommand(
            Command::new("register")
                .about("Create an account. The password is read from stdin.")
                .arg(Arg::new("email").required(true))
                .arg(Arg::new("name").required(true).help("Full name")),
        )
        .subcommand(
            Command::new("login")
                .about("Log in and remember the session. The password is read from stdin.")
                .arg(Arg::new("email").required(true)),
        )
        .subcommand(Command::new("logout").about("Forget the stored session."))
        .subcommand(Command::new("start").about("Clock in."))
        .subcommand(Command::new("stop").about("Clock out."))
        .subcommand(Command::new("today").about("Time worked today."))
        .subcommand(
            Command::new("history")
                .about("Daily totals, newest first.")
                .arg(
                    Arg::new("days")
                        .short('d')
                        .long("days")
                        .value_parser(value_parser!(i64))
                        .help("Number of days to show, today included."),
                ),
        )
        .subcommand(Command::new("watch").about("Live timer for today. Ctrl-C to quit."))
        .subcommand(
            Command::new("logo")
                .about("Show the current logo URL, or upload a new logo.")
                .arg(
                    Arg::new("set")
                        .long("set")
                        .value_name("file")
                        .value_parser(value_parser!(PathBuf))
                        .help("Image to upload (png, jpeg, webp or svg, max 3MB)."),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let base_url = env::var("BASE_URL").unwrap_or_else(|_| String::from(DEFAULT_BASE_URL));

    let session: SharedState<Session> =
        SharedState::load(Arc::new(FilePersistence::new(session_path()?)))?;
    let client = ApiClient::new(&base_url).with_token(session.get().token);

    let matches = cli().get_matches();
    let (command, args) = matches
        .subcommand()
        .ok_or_else(|| anyhow!("No command given"))?;

    match run(command, args, &client, &session).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<ClientError>() {
            Some(ClientError::Unauthorized(message)) if command == "login" => {
                eprintln!("{}", message);
                std::process::exit(1);
            }
            Some(ClientError::Unauthorized(_)) => {
                session.update(|s| s.token = None)?;
                eprintln!("Session expired. Please log in again.");
                std::process::exit(1);
            }
            Some(ClientError::Api { message, .. }) => {
                eprintln!("Error: {}", message);
                std::process::exit(1);
            }
            _ => Err(e),
        },
    }
}

async fn run(
    command: &str,
    args: &ArgMatches,
    client: &ApiClient,
    session: &SharedState<Session>,
) -> Result<()> {
    match command {
        "register" => {
            let email = required(args, "email")?;
            let name = required(args, "name")?;
            let password = read_password().await?;
            let res = client.register(email, &password, name).await?;
            println!("{}. Run `timecard login {}` to start tracking.", res.message, email);
        }
        "login" => {
            let email = required(args, "email")?;
            let password = read_password().await?;
            let token = client.login(email, &password).await?;
            session.update(|s| s.token = Some(token))?;
            println!("Logged in as {}.", email);
        }
        "logout" => {
            session.update(|s| s.token = None)?;
            println!("Logged out.");
        }
        "logo" => match args.get_one::<PathBuf>("set") {
            Some(path) => {
                require_login(client)?;
                let url = upload_logo(client, path).await?;
                session.update(|s| s.logo_url = Some(url.clone()))?;
                println!("Logo updated: {}", url);
            }
            None => {
                let url = client.logo_url().await?;
                session.update(|s| s.logo_url = Some(url.clone()))?;
                println!("{}", url);
            }
        },
        _ => {
            require_login(client)?;
            match command {
                "start" => {
                    let res = client.start().await?;
                    println!("{}.", res.message);
                }
                "stop" => {
                    let res = client.stop().await?;
                    println!("{}. Worked {}.", res.message, format_seconds(res.seconds));
                }
                "today" => {
                    let today = client.today().await?;
                    let status = if today.running { "running" } else { "stopped" };
                    println!("{} ({})", format_seconds(today.total_seconds), status);
                }
                "history" => {
                    let days = args.get_one::<i64>("days").copied();
                    print_history(client, days).await?;
                }
                "watch" => watch(client, session).await?,
                other => bail!("Unknown command: {}", other),
            }
        }
    }

    Ok(())
}

fn require_login(client: &ApiClient) -> Result<(), ClientError> {
    if client.has_token() {
        Ok(())
    } else {
        Err(ClientError::NotLoggedIn)
    }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("Missing <{}>", name))
}

fn session_path() -> Result<PathBuf> {
    if let Ok(path) = env::var("TIMECARD_SESSION") {
        return Ok(PathBuf::from(path));
    }
    let home = env::var("HOME").context("HOME env var must be set, or TIMECARD_SESSION")?;
    Ok(Path::new(&home).join(SESSION_FILE))
}

async fn read_password() -> Result<String> {
    eprint!("Password: ");
    std::io::stderr().flush()?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read password")?;

    let password = line.trim_end_matches(&['\r', '\n'][..]).to_string();
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(password)
}

async fn upload_logo(client: &ApiClient, path: &Path) -> Result<String> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("logo.png");

    Ok(client
        .upload_logo(filename, content_type_for(filename), data)
        .await?)
}

async fn print_history(client: &ApiClient, days: Option<i64>) -> Result<()> {
    let history = client.history(days).await?;
    if history.is_empty() {
        println!("No time tracked in this period.");
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(row![Fb => "Day", "Worked", "Of 8h workday"]);
    for day in &history {
        table.add_row(row![
            day.day.format("%a %Y-%m-%d"),
            format_seconds(day.total_seconds),
            format_progress(day.total_seconds)
        ]);
    }
    table.printstd();

    Ok(())
}

async fn watch(client: &ApiClient, session: &SharedState<Session>) -> Result<()> {
    let today = client.today().await?;
    let mut timer = LiveTimer::new(&today, Instant::now());
    let mut logo_changes = session.subscribe();

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut reconcile = tokio::time::interval(RECONCILE_EVERY);
    // The first reconcile tick fires immediately; the initial fetch covers it.
    reconcile.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let status = if timer.running() { "running" } else { "stopped" };
                print!("\rToday {} ({})   ", format_seconds(timer.elapsed(Instant::now())), status);
                std::io::stdout().flush()?;
            }
            _ = reconcile.tick() => {
                let today = client.today().await?;
                timer.reconcile(&today, Instant::now());

                let logo_url = client.logo_url().await?;
                session.update(|s| s.logo_url = Some(logo_url))?;
            }
            Ok(()) = logo_changes.changed() => {
                if let Some(url) = logo_changes.borrow_and_update().logo_url.as_deref() {
                    println!("\nLogo: {}", url);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    Ok(())
}
