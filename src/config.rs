use crate::error::Result;
use std::collections::BTreeMap;
use std::time::Duration;

/// Environment variable holding the configuration source handed to the
/// [`ConfigLoader`] when a domain starts.
pub const CONFIG_URI_ENV: &str = "DDS_LIFECYCLE_URI";

/// Default liveliness monitoring interval.
pub(crate) const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Scheduling properties for a named internal thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadProperties {
    pub stack_size: Option<usize>,
    pub priority: Option<i32>,
}

/// Parsed configuration of one domain.
///
/// Produced by a [`ConfigLoader`]; the lifecycle reconciles `domain_id` with
/// the id that was requested.
///
/// 单个域的已解析配置。由 [`ConfigLoader`] 生成；生命周期流程会将
/// `domain_id` 与请求的 id 进行核对。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Configured domain id, `None` when the configuration leaves it unspecified.
    pub domain_id: Option<u32>,
    pub liveliness_monitoring: bool,
    pub liveliness_monitoring_interval: Duration,
    pub noprogress_log_stacktraces: bool,
    /// Initial write-batching mode for writers created in the domain.
    pub write_batch: bool,
    pub threads: BTreeMap<String, ThreadProperties>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain_id: None,
            liveliness_monitoring: false,
            liveliness_monitoring_interval: DEFAULT_MONITOR_INTERVAL,
            noprogress_log_stacktraces: true,
            write_batch: false,
            threads: BTreeMap::new(),
        }
    }
}

impl Config {
    #[inline]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Properties configured for the thread called `name`, or defaults.
    pub fn thread_properties(&self, name: &str) -> ThreadProperties {
        self.threads.get(name).cloned().unwrap_or_default()
    }
}

/// Builder for [`Config`].
///
/// # Example
/// ```
/// use dds_lifecycle::Config;
///
/// let config = Config::builder()
///     .domain_id(3)
///     .liveliness_monitoring(true)
///     .build();
/// assert_eq!(config.domain_id, Some(3));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn domain_id(mut self, id: impl Into<Option<u32>>) -> Self {
        self.config.domain_id = id.into();
        self
    }

    #[inline]
    pub fn liveliness_monitoring(mut self, enabled: bool) -> Self {
        self.config.liveliness_monitoring = enabled;
        self
    }

    #[inline]
    pub fn liveliness_monitoring_interval(mut self, interval: Duration) -> Self {
        self.config.liveliness_monitoring_interval = interval;
        self
    }

    #[inline]
    pub fn noprogress_log_stacktraces(mut self, enabled: bool) -> Self {
        self.config.noprogress_log_stacktraces = enabled;
        self
    }

    #[inline]
    pub fn write_batch(mut self, enabled: bool) -> Self {
        self.config.write_batch = enabled;
        self
    }

    pub fn thread(mut self, name: impl Into<String>, props: ThreadProperties) -> Self {
        self.config.threads.insert(name.into(), props);
        self
    }

    #[inline]
    pub fn build(self) -> Config {
        self.config
    }
}

/// Configuration source collaborator.
///
/// Parsing the configuration file format is not this crate's concern; the
/// runtime only asks for a parsed [`Config`] and hands it back when the domain
/// is torn down.
///
/// 配置源协作者。本 crate 不负责解析配置文件格式；运行时只请求已解析的
/// [`Config`]，并在域拆除时交还。
pub trait ConfigLoader: Send + Sync {
    /// `source` is the value of [`CONFIG_URI_ENV`], if set.
    fn parse(&self, source: Option<&str>) -> Result<Config>;

    fn release(&self, _config: Config) {}
}

/// Hands out clones of a fixed configuration, ignoring the source.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn parse(&self, _source: Option<&str>) -> Result<Config> {
        Ok(self.config.clone())
    }
}
