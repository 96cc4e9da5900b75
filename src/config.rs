use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub part_store: PartStoreKind,
    /// Open sequences untouched for this long are dropped with their parts.
    pub sequence_idle_secs: u64,
    /// How often the idle-sequence sweep runs.
    pub sweep_interval_secs: u64,
    /// Longest gap between chunks of a part upload; 0 disables the limit.
    pub part_read_timeout_secs: u64,
}

/// Where uploaded parts are kept until their sequence is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PartStoreKind {
    /// Files under `{storage_dir}/parts`.
    Fs,
    /// Process memory; parts are lost on restart.
    Memory,
}

/// One-shot admin actions; the server exits after running them.
#[derive(Debug, Clone, Default)]
pub struct AdminTasks {
    pub migrate: bool,
    /// `email\password\display name` entries.
    pub add_users: Vec<String>,
    /// `email\group name` entries.
    pub add_groups: Vec<String>,
    /// `email\group name` entries.
    pub remove_groups: Vec<String>,
    /// `email\contact email` entries.
    pub add_contacts: Vec<String>,
    /// Search text for enabled users.
    pub find_users: Option<String>,
}

impl AdminTasks {
    pub fn is_empty(&self) -> bool {
        !self.migrate
            && self.add_users.is_empty()
            && self.add_groups.is_empty()
            && self.remove_groups.is_empty()
            && self.add_contacts.is_empty()
            && self.find_users.is_none()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Moteve server for mobile video upload")]
pub struct Args {
    /// Host to bind to (overrides MOTEVE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MOTEVE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where video parts and finished videos are stored (overrides MOTEVE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MOTEVE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Part store backend (overrides MOTEVE_PART_STORE)
    #[arg(long, value_enum)]
    pub part_store: Option<PartStoreKind>,

    /// Seconds an open upload sequence may stay idle (overrides MOTEVE_SEQUENCE_IDLE_SECS)
    #[arg(long)]
    pub sequence_idle_secs: Option<u64>,

    /// Seconds between idle-sequence sweeps (overrides MOTEVE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Seconds to wait for the next chunk of a part upload, 0 for no limit
    /// (overrides MOTEVE_PART_READ_TIMEOUT_SECS)
    #[arg(long)]
    pub part_read_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Create a user (`email\password\display name`) and exit; repeatable
    #[arg(long = "add-user", value_name = "EMAIL\\PASSWORD\\NAME")]
    pub add_users: Vec<String>,

    /// Create a group for a user (`email\group`) and exit; repeatable
    #[arg(long = "add-group", value_name = "EMAIL\\GROUP")]
    pub add_groups: Vec<String>,

    /// Remove a user's group (`email\group`) and exit; repeatable
    #[arg(long = "remove-group", value_name = "EMAIL\\GROUP")]
    pub remove_groups: Vec<String>,

    /// Add a contact (`email\contact email`) and exit; repeatable
    #[arg(long = "add-contact", value_name = "EMAIL\\CONTACT")]
    pub add_contacts: Vec<String>,

    /// List enabled users whose e-mail or name contains the text, then exit
    #[arg(long, value_name = "TEXT")]
    pub find_users: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and admin tasks.
    pub fn from_env_and_args() -> Result<(Self, AdminTasks)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("MOTEVE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_number("MOTEVE_PORT", 8080u16)?;
        let env_storage =
            env::var("MOTEVE_STORAGE_DIR").unwrap_or_else(|_| "./data/videos".into());
        let env_db = env::var("MOTEVE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/moteve.db".into());
        let env_part_store = match env::var("MOTEVE_PART_STORE") {
            Ok(value) => <PartStoreKind as ValueEnum>::from_str(&value, true)
                .map_err(|err| anyhow::anyhow!("parsing MOTEVE_PART_STORE: {}", err))?,
            Err(_) => PartStoreKind::Fs,
        };
        let env_idle = env_number("MOTEVE_SEQUENCE_IDLE_SECS", 3600u64)?;
        let env_sweep = env_number("MOTEVE_SWEEP_INTERVAL_SECS", 60u64)?;
        let env_read_timeout = env_number("MOTEVE_PART_READ_TIMEOUT_SECS", 30u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            part_store: args.part_store.unwrap_or(env_part_store),
            sequence_idle_secs: args.sequence_idle_secs.unwrap_or(env_idle),
            sweep_interval_secs: args.sweep_interval_secs.unwrap_or(env_sweep),
            part_read_timeout_secs: args.part_read_timeout_secs.unwrap_or(env_read_timeout),
        };

        let admin = AdminTasks {
            migrate: args.migrate,
            add_users: args.add_users,
            add_groups: args.add_groups,
            remove_groups: args.remove_groups,
            add_contacts: args.add_contacts,
            find_users: args.find_users,
        };

        Ok((cfg, admin))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sequence_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.sequence_idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn part_read_timeout(&self) -> Duration {
        Duration::from_secs(self.part_read_timeout_secs)
    }
}

/// Read a numeric environment variable, falling back to `default` when unset.
fn env_number<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
