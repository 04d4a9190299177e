use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Args;
use config::builder::DefaultState;
use config::Config as CConfig;
use config::{ConfigBuilder, Environment, File};

use crate::record::DEFAULT_ID_PREFIX;
use crate::store::TargetConfig;
use crate::submission::{Plan, MAX_WORKERS};

pub const CONFIG_FILE: &str = "solr-load.toml";
const ENV_PREFIX: &str = "SOLR_LOAD";

#[derive(Args, Clone, Debug, Default)]
pub struct LoadArgs {
    /// Path to the TOML config file. Missing files are ignored.
    #[arg(long, default_value = CONFIG_FILE, env = "SOLR_LOAD_CONFIG")]
    pub config: String,

    /// Total records to submit
    #[arg(long)]
    pub rows: Option<u64>,

    /// Submission attempts per record before it is given up
    #[arg(long)]
    pub max_attempts: Option<u64>,

    /// Store connection string: host and root path of a cluster node
    #[arg(long)]
    pub target: Option<String>,

    /// Collection to write into
    #[arg(long)]
    pub collection: Option<String>,

    /// Records in flight at once (0 = one per CPU)
    #[arg(long)]
    pub workers: Option<u64>,

    /// Base delay between attempts, multiplied by the attempt number
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    /// Seed for record tokens, for reproducible runs
    #[arg(long)]
    pub seed: Option<u64>,

    /// Count the run's documents afterwards and compare with what was stored
    #[arg(long)]
    pub verify: bool,

    /// Skip the commit issued after the last record
    #[arg(long)]
    pub no_commit: bool,

    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub rows: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub workers: usize,
    pub target: String,
    pub collection: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub id_prefix: String,
    pub seed: Option<u64>,
    pub commit: bool,
    pub verify: bool,
}

impl Config {
    // Defaults, then the config file, then SOLR_LOAD_* variables, then flags.
    pub fn new(args: &LoadArgs) -> anyhow::Result<Self> {
        let file = CConfig::builder()
            .add_source(File::with_name(&args.config).required(false))
            .build()
            .with_context(|| format!("Config file {}", args.config))?;
        Self::layered(file, Environment::with_prefix(ENV_PREFIX), args)
    }

    // Environment values stay strings until deserialization, which converts the numeric
    // and boolean keys and leaves text like a `007` password untouched.
    fn layered(file: CConfig, env: Environment, args: &LoadArgs) -> anyhow::Result<Self> {
        let builder = CConfig::builder().add_source(file).add_source(env);
        Self::build(builder, args)
    }

    fn build(builder: ConfigBuilder<DefaultState>, args: &LoadArgs) -> anyhow::Result<Self> {
        let config: Self = builder
            .set_override_option("rows", args.rows)?
            .set_override_option("max_attempts", args.max_attempts)?
            .set_override_option("target", args.target.clone())?
            .set_override_option("collection", args.collection.clone())?
            .set_override_option("workers", args.workers)?
            .set_override_option("retry_backoff_ms", args.retry_backoff_ms)?
            .set_override_option("seed", args.seed)?
            .set_override_option("verify", args.verify.then_some(true))?
            .set_override_option("commit", args.no_commit.then_some(false))?
            .set_override_option("log_level", args.log_level.clone())?
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.max_attempts >= 1, "max_attempts must be at least 1");
        ensure!(
            self.workers <= MAX_WORKERS,
            "workers must be at most {}",
            MAX_WORKERS
        );
        ensure!(!self.collection.is_empty(), "collection must not be empty");
        reqwest::Url::parse(&self.target)
            .with_context(|| format!("target {} is not a URL", self.target))?;
        Ok(())
    }

    pub fn target(&self) -> TargetConfig {
        TargetConfig {
            url: self.target.clone(),
            collection: self.collection.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn plan(&self) -> Plan {
        Plan {
            rows: self.rows,
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
            workers: match self.workers {
                0 => num_cpus::get(),
                n => n,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            rows: 20_000,
            max_attempts: 20,
            retry_backoff_ms: 0,
            workers: 1,
            target: "http://localhost:8983/solr".to_string(),
            collection: "solrtest".to_string(),
            user: None,
            password: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 60_000,
            id_prefix: DEFAULT_ID_PREFIX.to_string(),
            seed: None,
            commit: true,
            verify: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str, args: &LoadArgs) -> anyhow::Result<Config> {
        let builder = CConfig::builder().add_source(File::from_str(toml, FileFormat::Toml));
        Config::build(builder, args)
    }

    #[test]
    fn defaults() {
        let config = from_toml("", &LoadArgs::default()).unwrap();
        assert_eq!(config.rows, 20_000);
        assert_eq!(config.max_attempts, 20);
        assert_eq!(config.collection, "solrtest");
        assert!(config.commit);
        assert!(!config.verify);

        let plan = config.plan();
        assert_eq!(plan.workers, 1);
        assert!(plan.backoff.is_zero());
    }

    #[test]
    fn file_then_flags() {
        let toml = r#"
            rows = 500
            max_attempts = 3
            target = "http://solr-1:8983/solr"
            user = "solr"
            password = "admin"
            retry_backoff_ms = 50
        "#;
        let config = from_toml(toml, &LoadArgs::default()).unwrap();
        assert_eq!(config.rows, 500);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.user.as_deref(), Some("solr"));
        assert_eq!(config.target().url, "http://solr-1:8983/solr");
        assert_eq!(config.plan().backoff, Duration::from_millis(50));

        let args = LoadArgs {
            rows: Some(7),
            target: Some("http://other:8983/solr".to_string()),
            workers: Some(4),
            verify: true,
            no_commit: true,
            ..Default::default()
        };
        let config = from_toml(toml, &args).unwrap();
        assert_eq!(config.rows, 7);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.target, "http://other:8983/solr");
        assert_eq!(config.plan().workers, 4);
        assert!(config.verify);
        assert!(!config.commit);
    }

    #[test]
    fn zero_workers_means_one_per_cpu() {
        let config = from_toml("workers = 0", &LoadArgs::default()).unwrap();
        assert_eq!(config.plan().workers, num_cpus::get());
    }

    fn env(vars: &[(&str, &str)]) -> Environment {
        let source: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(source))
    }

    fn file(toml: &str) -> CConfig {
        CConfig::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
    }

    #[test]
    fn environment_layer() {
        let vars = env(&[
            ("SOLR_LOAD_PASSWORD", "007"),
            ("SOLR_LOAD_USER", "1e3"),
            ("SOLR_LOAD_ID_PREFIX", "1e3"),
            ("SOLR_LOAD_ROWS", "250"),
            ("SOLR_LOAD_VERIFY", "true"),
            ("SOLR_LOAD_SEED", "0042"),
        ]);
        let config = Config::layered(file("rows = 10\nmax_attempts = 4"), vars, &LoadArgs::default())
            .unwrap();
        assert_eq!(config.password.as_deref(), Some("007"));
        assert_eq!(config.user.as_deref(), Some("1e3"));
        assert_eq!(config.id_prefix, "1e3");
        assert_eq!(config.rows, 250);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.seed, Some(42));
        assert!(config.verify);
        assert_eq!(config.target().password.as_deref(), Some("007"));

        // Flags still win over the environment.
        let args = LoadArgs {
            rows: Some(3),
            ..Default::default()
        };
        let vars = env(&[("SOLR_LOAD_ROWS", "250")]);
        let config = Config::layered(file(""), vars, &args).unwrap();
        assert_eq!(config.rows, 3);
    }

    #[test]
    fn flag_errors_do_not_blame_the_file() {
        let args = LoadArgs {
            config: "missing-solr-load.toml".to_string(),
            max_attempts: Some(0),
            ..Default::default()
        };
        let err = format!("{:#}", Config::new(&args).unwrap_err());
        assert!(err.contains("max_attempts"), "{err}");
        assert!(!err.contains("missing-solr-load.toml"), "{err}");

        let err = format!("{:#}", Config::new(&LoadArgs {
            config: "missing-solr-load.toml".to_string(),
            workers: Some(MAX_WORKERS as u64 + 1),
            ..Default::default()
        })
        .unwrap_err());
        assert!(err.contains("workers"), "{err}");
    }

    #[test]
    fn validation() {
        assert!(from_toml("workers = 1000000000", &LoadArgs::default()).is_err());
        assert!(from_toml(&format!("workers = {MAX_WORKERS}"), &LoadArgs::default()).is_ok());
        assert!(from_toml("max_attempts = 0", &LoadArgs::default()).is_err());
        assert!(from_toml("collection = \"\"", &LoadArgs::default()).is_err());
        assert!(from_toml("target = \"solr-1/solr\"", &LoadArgs::default()).is_err());
        let args = LoadArgs {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(from_toml("", &args).is_err());
    }
}
