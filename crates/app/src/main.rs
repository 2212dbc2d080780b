use std::fmt;
use std::sync::Arc;

use exam_core::model::{AttemptError, AttemptId, QuestionId, SessionSettings, TestAttemptSession, TestId, UserId};
use services::{ApiConfig, AppServices, Clock, InMemoryAttemptApi};
use storage::repository::Storage;
use tracing_subscriber::EnvFilter;

mod console;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    MissingAttempt { command: &'static str },
    MissingUser,
    MissingApi,
    UnknownArg(String),
    InvalidUserId { raw: String },
    InvalidAttemptId { raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingAttempt { command } => write!(f, "{command} requires an attempt id"),
            ArgsError::MissingUser => write!(f, "list requires --user or EXAM_USER_ID"),
            ArgsError::MissingApi => write!(f, "no backend configured: pass --api or set EXAM_API_BASE_URL"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidUserId { raw } => write!(f, "invalid --user value: {raw}"),
            ArgsError::InvalidAttemptId { raw } => write!(f, "invalid attempt id: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- list    [--user <id>] [--include-expired] [common]");
    eprintln!("  cargo run -p app -- resume  <attempt-id> [common]");
    eprintln!("  cargo run -p app -- pause   <attempt-id> [common]");
    eprintln!("  cargo run -p app -- abandon <attempt-id> [common]");
    eprintln!("  cargo run -p app -- take    <attempt-id> [common]");
    eprintln!("  cargo run -p app -- demo                 # in-memory backend, sample attempt");
    eprintln!();
    eprintln!("Common flags:");
    eprintln!("  --db <sqlite_url>   local snapshot cache (default sqlite:exam-cache.sqlite3)");
    eprintln!("  --api <url>         attempt backend base url");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  EXAM_DB_URL, EXAM_USER_ID, EXAM_API_BASE_URL, EXAM_API_TOKEN,");
    eprintln!("  EXAM_API_TIMEOUT_SECS, EXAM_AUTOSAVE_SECS, EXAM_STALENESS_HOURS,");
    eprintln!("  EXAM_WARNING_MINUTES, EXAM_LIST_CACHE_SECS, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    List,
    Resume,
    Pause,
    Abandon,
    Take,
    Demo,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "list" => Some(Self::List),
            "resume" => Some(Self::Resume),
            "pause" => Some(Self::Pause),
            "abandon" => Some(Self::Abandon),
            "take" => Some(Self::Take),
            "demo" => Some(Self::Demo),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Command::List => "list",
            Command::Resume => "resume",
            Command::Pause => "pause",
            Command::Abandon => "abandon",
            Command::Take => "take",
            Command::Demo => "demo",
        }
    }
}

struct Args {
    db_url: String,
    api_url: Option<String>,
    user_id: Option<UserId>,
    include_expired: bool,
    attempt_id: Option<AttemptId>,
}

impl Args {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = std::env::var("EXAM_DB_URL")
            .ok()
            .map_or_else(|| "sqlite://exam-cache.sqlite3".into(), normalize_sqlite_url);
        let mut user_id = match std::env::var("EXAM_USER_ID") {
            Ok(raw) => Some(parse_user(raw)?),
            Err(_) => None,
        };
        let mut api_url = None;
        let mut include_expired = false;
        let mut attempt_id = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--api" => api_url = Some(require_value(args, "--api")?),
                "--user" => user_id = Some(parse_user(require_value(args, "--user")?)?),
                "--include-expired" => include_expired = true,
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ if !arg.starts_with("--") && attempt_id.is_none() => {
                    let parsed = arg
                        .parse::<AttemptId>()
                        .map_err(|_| ArgsError::InvalidAttemptId { raw: arg.clone() })?;
                    attempt_id = Some(parsed);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            api_url,
            user_id,
            include_expired,
            attempt_id,
        })
    }

    fn attempt(&self, command: Command) -> Result<AttemptId, ArgsError> {
        self.attempt_id.ok_or(ArgsError::MissingAttempt {
            command: command.as_str(),
        })
    }
}

fn parse_user(raw: String) -> Result<UserId, ArgsError> {
    raw.trim()
        .parse::<UserId>()
        .map_err(|_| ArgsError::InvalidUserId { raw })
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

fn api_config(args: &Args) -> Result<ApiConfig, Box<dyn std::error::Error>> {
    let from_env = ApiConfig::from_env()?;
    let config = match (&args.api_url, from_env) {
        (Some(url), env) => {
            let mut config = ApiConfig::new(url)?;
            if let Some(env) = env {
                config = config.with_timeout(env.timeout());
                if let Some(token) = env.token() {
                    config = config.with_token(token);
                }
            }
            config
        }
        (None, Some(env)) => env,
        (None, None) => return Err(ArgsError::MissingApi.into()),
    };
    Ok(config)
}

/// Seeds an in-memory backend with one short attempt.
fn demo_services(
    clock: Clock,
    settings: SessionSettings,
) -> Result<(AppServices, AttemptId), AttemptError> {
    let api = InMemoryAttemptApi::new(clock);
    let session = TestAttemptSession::start(
        AttemptId::random(),
        TestId::new(1),
        UserId::new(1),
        (1..=5).map(QuestionId::new).collect(),
        180,
        clock.now(),
    )?;
    api.insert(&session);
    let services = AppServices::new(clock, settings, Storage::in_memory(), Arc::new(api));
    Ok((services, session.id()))
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let argv: Vec<String> = std::env::args().skip(1).collect();

    let cmd = match argv.first().map(String::as_str) {
        None | Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some(first) => Command::from_arg(first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };

    let mut iter = argv.into_iter().skip(1);
    let parsed = Args::parse(&mut iter).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let clock = Clock::system();
    let settings = SessionSettings::from_env()?;

    if cmd == Command::Demo {
        let (services, attempt_id) = demo_services(clock, settings)?;
        println!("demo attempt {attempt_id}");
        let coordinator = services.open_attempt(attempt_id).await?;
        return console::drive(coordinator).await;
    }

    // Open + migrate SQLite at startup. Keep this in the binary glue so core/services stay pure.
    prepare_sqlite_file(&parsed.db_url)?;
    let services =
        AppServices::new_sqlite(&parsed.db_url, clock, settings, api_config(&parsed)?).await?;
    let registry = services.registry();

    match cmd {
        Command::List => {
            let user_id = parsed.user_id.ok_or(ArgsError::MissingUser)?;
            let items = registry.list(user_id, parsed.include_expired).await?;
            if items.is_empty() {
                println!("no attempts");
            }
            for item in items {
                println!(
                    "{}  test {}  {:<11}  {:>3}/{:<3} answered ({:.0}%)  {}s left  last active {}",
                    item.attempt_id,
                    item.test_id,
                    item.status,
                    item.answered,
                    item.total_questions,
                    item.progress_percentage,
                    item.time_remaining,
                    item.last_activity.format("%Y-%m-%d %H:%M"),
                );
            }
            Ok(())
        }
        Command::Resume => {
            let target = registry.resume(parsed.attempt(cmd)?).await?;
            println!(
                "resume test {} at question {}",
                target.test_id,
                target.question_index + 1
            );
            Ok(())
        }
        Command::Pause => {
            let status = registry.pause(parsed.attempt(cmd)?).await?;
            println!("attempt is now {status}");
            Ok(())
        }
        Command::Abandon => {
            let attempt_id = parsed.attempt(cmd)?;
            registry.abandon(attempt_id).await?;
            println!("abandoned {attempt_id}");
            Ok(())
        }
        Command::Take => {
            let coordinator = services.open_attempt(parsed.attempt(cmd)?).await?;
            console::drive(coordinator).await
        }
        Command::Demo => Ok(()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        // At this layer (binary glue), printing once is fine.
        eprintln!("{err}");
        std::process::exit(2);
    }
}
