//! Configuration for the conveyor application.
//!
//! Configuration is loaded from environment variables via figment. Duration
//! fields accept both numeric values (seconds) and duration strings with
//! units; queue and crontab fields accept compact string forms suitable for
//! a single environment variable as well as structured maps.

use std::collections::BTreeMap;
use std::time::Duration;

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::cron::Cron;

/// Main application configuration.
#[derive(Deserialize)]
pub struct Config {
    /// Log level for this application's target specifically.
    ///
    /// Valid values are: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database connection URL
    pub database_url: String,

    /// Identity of this node, recorded on leased jobs and in gossip and
    /// leadership announcements. Defaults to the hostname.
    #[serde(default = "default_node")]
    pub node: String,

    /// Instance name, namespacing notifications and leadership so multiple
    /// conveyor instances can share one database.
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Schema prefix for all conveyor tables (default: "public")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Queue topology: queue name to limit/options.
    ///
    /// String form: `"default=10,media=5,reports=1:paused"`
    #[serde(default = "default_queues", deserialize_with = "deserialize_queues")]
    pub queues: BTreeMap<String, QueueConfig>,

    /// Cron entries, inserted by the leader when their expression matches.
    ///
    /// String form: `"*/5 * * * * cache.refresh; @daily reports.daily"`
    #[serde(default, deserialize_with = "deserialize_crontab")]
    pub crontab: Vec<CronEntry>,

    /// Plugins to run (default: all of stager, cron, lifeline)
    #[serde(default = "default_plugins", deserialize_with = "deserialize_plugins")]
    pub plugins: Vec<PluginKind>,

    /// Storage backend selector
    #[serde(default)]
    pub engine: EngineKind,

    /// Notifier backend selector
    #[serde(default)]
    pub notifier: NotifierKind,

    /// Peer (leader election) backend selector
    #[serde(default)]
    pub peer: PeerKind,

    /// Test-mode behavior for inserts
    #[serde(default)]
    pub testing: TestingMode,

    /// Max wait for running jobs when a queue shuts down
    #[serde(
        default = "default_shutdown_grace_period",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_grace_period: Duration,

    /// Minimum interval between dispatch rounds in a producer
    #[serde(
        default = "default_dispatch_cooldown",
        deserialize_with = "deserialize_duration"
    )]
    pub dispatch_cooldown: Duration,

    /// Baseline poll period for producers
    #[serde(
        default = "default_refresh_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub refresh_interval: Duration,

    /// How often the stager moves due jobs to `available`
    #[serde(
        default = "default_stage_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub stage_interval: Duration,

    /// Age past which an `executing` job is considered orphaned
    #[serde(
        default = "default_rescue_after",
        deserialize_with = "deserialize_duration"
    )]
    pub rescue_after: Duration,

    /// Retention for `completed` jobs before pruning
    #[serde(
        default = "default_completed_retention",
        deserialize_with = "deserialize_duration"
    )]
    pub completed_retention: Duration,

    /// Retention for `cancelled` and `discarded` jobs before pruning
    #[serde(
        default = "default_failed_retention",
        deserialize_with = "deserialize_duration"
    )]
    pub failed_retention: Duration,

    /// Max rows deleted per prune sweep
    #[serde(default = "default_prune_limit")]
    pub prune_limit: i64,

    /// Interval between lifeline sweeps (rescue + prune)
    #[serde(
        default = "default_lifeline_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub lifeline_interval: Duration,

    /// Leadership lease TTL; holders refresh at half this value
    #[serde(
        default = "default_leader_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub leader_ttl: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Config, figment::Error> {
        use figment::{Figment, providers::Env};

        Figment::new().merge(Env::raw()).extract()
    }
}

/// Per-queue options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueConfig {
    /// Maximum concurrent executions on this node
    pub limit: usize,
    /// Start the queue paused (jobs accumulate until resumed)
    #[serde(default)]
    pub paused: bool,
    /// Per-queue dispatch cooldown override
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub dispatch_cooldown: Option<Duration>,
}

impl QueueConfig {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            paused: false,
            dispatch_cooldown: None,
        }
    }
}

/// One crontab entry bound to a worker.
#[derive(Debug, Clone)]
pub struct CronEntry {
    pub cron: Cron,
    pub worker: String,
    pub queue: String,
    pub args: Value,
}

impl CronEntry {
    pub fn new(cron: Cron, worker: impl Into<String>) -> Self {
        Self {
            cron,
            worker: worker.into(),
            queue: "default".to_owned(),
            args: Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Stager,
    Cron,
    Lifeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Postgres,
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    #[default]
    Postgres,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    /// Lease-based election through the database
    #[default]
    Postgres,
    /// Single-node deployments: always leader
    Global,
    /// Never leader; leader-gated plugins become no-ops
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestingMode {
    #[default]
    Disabled,
    /// Jobs are inserted but never dispatched
    Manual,
    /// Jobs execute synchronously on insert, without persistence
    Inline,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_instance() -> String {
    "conveyor".to_string()
}

fn default_prefix() -> String {
    "public".to_string()
}

fn default_queues() -> BTreeMap<String, QueueConfig> {
    BTreeMap::from([("default".to_owned(), QueueConfig::with_limit(10))])
}

fn default_plugins() -> Vec<PluginKind> {
    vec![PluginKind::Stager, PluginKind::Cron, PluginKind::Lifeline]
}

/// Default shutdown grace of 15 seconds
fn default_shutdown_grace_period() -> Duration {
    Duration::from_secs(15)
}

/// Default dispatch cooldown of 5 milliseconds
fn default_dispatch_cooldown() -> Duration {
    Duration::from_millis(5)
}

/// Default producer refresh of 1 second
fn default_refresh_interval() -> Duration {
    Duration::from_secs(1)
}

/// Default staging interval of 1 second
fn default_stage_interval() -> Duration {
    Duration::from_secs(1)
}

/// Default rescue threshold of 60 minutes
fn default_rescue_after() -> Duration {
    Duration::from_secs(60 * 60)
}

/// Completed jobs are kept for 60 seconds by default
fn default_completed_retention() -> Duration {
    Duration::from_secs(60)
}

/// Cancelled/discarded jobs are kept for 24 hours by default
fn default_failed_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_prune_limit() -> i64 {
    10_000
}

/// Default lifeline sweep interval of 30 seconds
fn default_lifeline_interval() -> Duration {
    Duration::from_secs(30)
}

/// Default leadership TTL of 30 seconds
fn default_leader_ttl() -> Duration {
    Duration::from_secs(30)
}

/// Duration parser handling seconds (default unit), milliseconds, minutes
/// and hours, with optional whitespace between number and unit.
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Deserialize a duration from either a bare number (seconds) or a string
/// with units ("250ms", "30s", "2m", "1h").
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "invalid duration '{value}': {e}. Examples: '5' (seconds), '250ms', '2m'"
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("duration conversion error: {e}")))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration(deserializer).map(Some)
}

/// Deserialize the queue topology from either a structured map or the
/// compact `"name=limit[:paused],..."` string form.
fn deserialize_queues<'de, D>(deserializer: D) -> Result<BTreeMap<String, QueueConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{MapAccess, Visitor};

    struct QueuesVisitor;

    impl<'de> Visitor<'de> for QueuesVisitor {
        type Value = BTreeMap<String, QueueConfig>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a queue map or a \"name=limit,...\" string")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_queue_list(value).map_err(serde::de::Error::custom)
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut queues = BTreeMap::new();
            while let Some((name, config)) = access.next_entry::<String, LimitOrConfig>()? {
                let config = match config {
                    LimitOrConfig::Limit(limit) => QueueConfig::with_limit(limit),
                    LimitOrConfig::Config(config) => config,
                };
                queues.insert(name, config);
            }
            Ok(queues)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LimitOrConfig {
        Limit(usize),
        Config(QueueConfig),
    }

    deserializer.deserialize_any(QueuesVisitor)
}

/// Parse `"default=10,media=5,reports=1:paused"` into queue configs.
fn parse_queue_list(input: &str) -> Result<BTreeMap<String, QueueConfig>, String> {
    let mut queues = BTreeMap::new();

    for entry in input.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (name, rest) = entry
            .split_once('=')
            .ok_or_else(|| format!("queue entry '{entry}' is missing '=limit'"))?;

        let (limit_str, paused) = match rest.split_once(':') {
            Some((limit, "paused")) => (limit, true),
            Some((_, modifier)) => {
                return Err(format!("unknown queue modifier '{modifier}' in '{entry}'"));
            }
            None => (rest, false),
        };

        let limit: usize = limit_str
            .trim()
            .parse()
            .map_err(|_| format!("invalid limit '{limit_str}' for queue '{name}'"))?;

        queues.insert(
            name.trim().to_owned(),
            QueueConfig {
                limit,
                paused,
                dispatch_cooldown: None,
            },
        );
    }

    if queues.is_empty() {
        return Err("queue list is empty".to_owned());
    }

    Ok(queues)
}

/// Deserialize crontab entries from either a structured list or the compact
/// `"expr worker; expr worker"` string form, where the worker name is the
/// last whitespace-separated token of each entry.
fn deserialize_crontab<'de, D>(deserializer: D) -> Result<Vec<CronEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{SeqAccess, Visitor};

    struct CrontabVisitor;

    #[derive(Deserialize)]
    struct RawEntry {
        expression: String,
        worker: String,
        #[serde(default)]
        queue: Option<String>,
        #[serde(default)]
        args: Option<Value>,
    }

    impl<'de> Visitor<'de> for CrontabVisitor {
        type Value = Vec<CronEntry>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a crontab list or a \"expr worker; ...\" string")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_crontab_list(value).map_err(serde::de::Error::custom)
        }

        fn visit_seq<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut entries = Vec::new();
            while let Some(raw) = access.next_element::<RawEntry>()? {
                let cron = Cron::parse(&raw.expression).map_err(serde::de::Error::custom)?;
                let mut entry = CronEntry::new(cron, raw.worker);
                if let Some(queue) = raw.queue {
                    entry.queue = queue;
                }
                if let Some(args) = raw.args {
                    entry.args = args;
                }
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_any(CrontabVisitor)
}

/// Parse `"*/5 * * * * cache.refresh; @daily reports.daily"`.
fn parse_crontab_list(input: &str) -> Result<Vec<CronEntry>, String> {
    let mut entries = Vec::new();

    for item in input.split(';') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        let (expression, worker) = item
            .rsplit_once(char::is_whitespace)
            .ok_or_else(|| format!("crontab entry '{item}' is missing a worker name"))?;

        let cron =
            Cron::parse(expression).map_err(|e| format!("crontab entry '{item}': {e}"))?;

        entries.push(CronEntry::new(cron, worker.trim()));
    }

    Ok(entries)
}

/// Deserialize the plugin list from a structured list or `"stager,cron"`.
fn deserialize_plugins<'de, D>(deserializer: D) -> Result<Vec<PluginKind>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{SeqAccess, Visitor};

    struct PluginsVisitor;

    impl<'de> Visitor<'de> for PluginsVisitor {
        type Value = Vec<PluginKind>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a plugin list or a \"stager,cron,lifeline\" string")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|name| match name {
                    "stager" => Ok(PluginKind::Stager),
                    "cron" => Ok(PluginKind::Cron),
                    "lifeline" => Ok(PluginKind::Lifeline),
                    other => Err(serde::de::Error::custom(format!("unknown plugin '{other}'"))),
                })
                .collect()
        }

        fn visit_seq<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut plugins = Vec::new();
            while let Some(plugin) = access.next_element()? {
                plugins.push(plugin);
            }
            Ok(plugins)
        }
    }

    deserializer.deserialize_any(PluginsVisitor)
}
