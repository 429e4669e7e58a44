use std::collections::HashMap;
use std::sync::LazyLock;

use pipeplan_error::{PlanError, Result};

use super::execution::{ExecutionConfig, OptimizerConfig};
use crate::execution::scalar::ScalarValue;
use crate::partition::PartitionPolicyKind;

/// Default threshold below which join inputs are broadcast, 50 MB.
pub const DEFAULT_BROADCAST_THRESHOLD: u64 = 50 * 1024 * 1024;

pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// Configuration for planning and executing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub job_id: String,
    pub broadcast_threshold: u64,
    pub partitions: u64,
    pub threads: u64,
    pub batch_size: u64,
    pub tolerate_record_errors: bool,
    pub ingestion_policy: PartitionPolicyKind,
    pub seed: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    /// Create a config with defaults. The job id is freshly generated.
    pub fn new() -> Self {
        let cpus = num_cpus::get() as u64;
        SessionConfig {
            job_id: format!("job_{}", uuid::Uuid::new_v4().simple()),
            broadcast_threshold: DEFAULT_BROADCAST_THRESHOLD,
            partitions: cpus,
            threads: cpus,
            batch_size: DEFAULT_BATCH_SIZE as u64,
            tolerate_record_errors: false,
            ingestion_policy: PartitionPolicyKind::Default,
            seed: 0,
        }
    }

    pub fn set_from_scalar(&mut self, name: &str, value: ScalarValue) -> Result<()> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| PlanError::InvalidSetting(format!("Missing setting for '{name}'")))?;

        (func.set)(value, self)
    }

    pub fn get_as_scalar(&self, name: &str) -> Result<ScalarValue> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| PlanError::InvalidSetting(format!("Missing setting for '{name}'")))?;

        let val = (func.get)(self);
        Ok(val)
    }

    /// Reset a setting to its default. Resetting the job id generates a new
    /// one.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        let def_conf = Self::new();

        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| PlanError::InvalidSetting(format!("Missing setting for '{name}'")))?;

        let scalar = (func.get)(&def_conf);
        (func.set)(scalar, self)
    }

    /// Names and descriptions of all settings, sorted by name.
    pub fn settings() -> Vec<(&'static str, &'static str)> {
        let mut settings: Vec<_> = GET_SET_FUNCTIONS
            .iter()
            .map(|(name, func)| (*name, func.description))
            .collect();
        settings.sort_unstable();
        settings
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            job_id: self.job_id.clone(),
            broadcast_threshold: self.broadcast_threshold,
        }
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            partitions: self.partitions as usize,
            threads: self.threads as usize,
            batch_size: self.batch_size as usize,
            tolerate_record_errors: self.tolerate_record_errors,
            ingestion_policy: self.ingestion_policy,
            seed: self.seed,
        }
    }
}

struct SettingFunctions {
    description: &'static str,
    set: fn(scalar: ScalarValue, conf: &mut SessionConfig) -> Result<()>,
    get: fn(conf: &SessionConfig) -> ScalarValue,
}

impl SettingFunctions {
    const fn new<S: SessionSetting>() -> Self {
        SettingFunctions {
            description: S::DESCRIPTION,
            set: S::set_from_scalar as _,
            get: S::get_as_scalar as _,
        }
    }
}

fn insert_setting<S: SessionSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<JobId>(&mut map);
    insert_setting::<BroadcastThreshold>(&mut map);
    insert_setting::<Partitions>(&mut map);
    insert_setting::<Threads>(&mut map);
    insert_setting::<BatchSize>(&mut map);
    insert_setting::<TolerateRecordErrors>(&mut map);
    insert_setting::<IngestionPolicy>(&mut map);
    insert_setting::<Seed>(&mut map);

    map
});

pub trait SessionSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_scalar(scalar: ScalarValue, conf: &mut SessionConfig) -> Result<()>;
    fn get_as_scalar(conf: &SessionConfig) -> ScalarValue;
}

pub struct JobId;

impl SessionSetting for JobId {
    const NAME: &'static str = "job_id";
    const DESCRIPTION: &'static str = "Job that intermediate sets are named within";

    fn set_from_scalar(scalar: ScalarValue, conf: &mut SessionConfig) -> Result<()> {
        let val = scalar.try_as_str()?;
        if val.is_empty() {
            return Err(PlanError::InvalidSetting(
                "Job id cannot be empty".to_string(),
            ));
        }
        conf.job_id = val.to_string();
        Ok(())
    }

    fn get_as_scalar(conf: &SessionConfig) -> ScalarValue {
        conf.job_id.clone().into()
    }
}

pub struct BroadcastThreshold;

impl SessionSetting for BroadcastThreshold {
    const NAME: &'static str = "broadcast_threshold";
    const DESCRIPTION: &'static str = "Join inputs estimated below this many bytes are broadcast";

    fn set_from_scalar(scalar: ScalarValue, conf: &mut SessionConfig) -> Result<()> {
        conf.broadcast_threshold = scalar.try_as_u64()?;
        Ok(())
    }

    fn get_as_scalar(conf: &SessionConfig) -> ScalarValue {
        conf.broadcast_threshold.into()
    }
}

const MIN_PARTITION_COUNT: usize = 1;
const MAX_PARTITION_COUNT: usize = 512;

pub struct Partitions;

impl Partitions {
    pub fn validate_value(val: usize) -> Result<()> {
        if val < MIN_PARTITION_COUNT {
            return Err(PlanError::InvalidSetting(format!(
                "Partition count cannot be less than {MIN_PARTITION_COUNT}"
            )));
        }

        if val > MAX_PARTITION_COUNT {
            return Err(PlanError::InvalidSetting(format!(
                "Partition count cannot be greater than {MAX_PARTITION_COUNT}"
            )));
        }

        Ok(())
    }
}

impl SessionSetting for Partitions {
    const NAME: &'static str = "partitions";
    const DESCRIPTION: &'static str = "Number of workers, each owning one partition of every set";

    fn set_from_scalar(scalar: ScalarValue, conf: &mut SessionConfig) -> Result<()> {
        let val = scalar.try_as_usize()?;
        Self::validate_value(val)?;

        conf.partitions = val as u64;
        Ok(())
    }

    fn get_as_scalar(conf: &SessionConfig) -> ScalarValue {
        conf.partitions.into()
    }
}

pub struct Threads;

impl SessionSetting for Threads {
    const NAME: &'static str = "threads";
    const DESCRIPTION: &'static str = "Number of threads in the worker pool";

    fn set_from_scalar(scalar: ScalarValue, conf: &mut SessionConfig) -> Result<()> {
        let val = scalar.try_as_usize()?;
        if val == 0 {
            return Err(PlanError::InvalidSetting(
                "Thread count cannot be zero".to_string(),
            ));
        }
        conf.threads = val as u64;
        Ok(())
    }

    fn get_as_scalar(conf: &SessionConfig) -> ScalarValue {
        conf.threads.into()
    }
}

const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 65536;

pub struct BatchSize;

impl SessionSetting for BatchSize {
    const NAME: &'static str = "batch_size";
    const DESCRIPTION: &'static str = "Maximum number of rows in a batch";

    fn set_from_scalar(scalar: ScalarValue, conf: &mut SessionConfig) -> Result<()> {
        let val = scalar.try_as_usize()?;

        if val < MIN_BATCH_SIZE {
            return Err(PlanError::InvalidSetting(format!(
                "Batch size cannot be less than {MIN_BATCH_SIZE}"
            )));
        }

        if val > MAX_BATCH_SIZE {
            return Err(PlanError::InvalidSetting(format!(
                "Batch size cannot be greater than {MAX_BATCH_SIZE}"
            )));
        }

        conf.batch_size = val as u64;
        Ok(())
    }

    fn get_as_scalar(conf: &SessionConfig) -> ScalarValue {
        conf.batch_size.into()
    }
}

pub struct TolerateRecordErrors;

impl SessionSetting for TolerateRecordErrors {
    const NAME: &'static str = "tolerate_record_errors";
    const DESCRIPTION: &'static str =
        "Count failing records and report a degraded stage instead of failing it";

    fn set_from_scalar(scalar: ScalarValue, conf: &mut SessionConfig) -> Result<()> {
        conf.tolerate_record_errors = scalar.try_as_bool()?;
        Ok(())
    }

    fn get_as_scalar(conf: &SessionConfig) -> ScalarValue {
        conf.tolerate_record_errors.into()
    }
}

pub struct IngestionPolicy;

impl SessionSetting for IngestionPolicy {
    const NAME: &'static str = "ingestion_policy";
    const DESCRIPTION: &'static str = "Partition policy used when loading sets";

    fn set_from_scalar(scalar: ScalarValue, conf: &mut SessionConfig) -> Result<()> {
        let policy: PartitionPolicyKind = scalar.try_as_str()?.parse()?;
        if policy.resolve() == PartitionPolicyKind::Fair {
            return Err(PlanError::UnsupportedPolicy {
                policy: policy.to_string(),
            });
        }
        conf.ingestion_policy = policy;
        Ok(())
    }

    fn get_as_scalar(conf: &SessionConfig) -> ScalarValue {
        conf.ingestion_policy.name().into()
    }
}

pub struct Seed;

impl SessionSetting for Seed {
    const NAME: &'static str = "seed";
    const DESCRIPTION: &'static str = "Seed for the random ingestion policy";

    fn set_from_scalar(scalar: ScalarValue, conf: &mut SessionConfig) -> Result<()> {
        conf.seed = scalar.try_as_u64()?;
        Ok(())
    }

    fn get_as_scalar(conf: &SessionConfig) -> ScalarValue {
        conf.seed.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_config() -> SessionConfig {
        SessionConfig {
            job_id: "test".to_string(),
            broadcast_threshold: 100,
            partitions: 4,
            threads: 2,
            batch_size: 1024,
            tolerate_record_errors: false,
            ingestion_policy: PartitionPolicyKind::RoundRobin,
            seed: 0,
        }
    }

    #[test]
    fn set_setting_exists() {
        let mut conf = new_test_config();
        conf.set_from_scalar("job_id", "q1".into()).unwrap();

        let val = conf.get_as_scalar("job_id").unwrap();
        assert_eq!("q1", val.try_as_str().unwrap());
    }

    #[test]
    fn set_setting_not_exists() {
        let mut conf = new_test_config();
        conf.set_from_scalar("hello_world", 58_i64.into()).unwrap_err();
        conf.get_as_scalar("hello_world").unwrap_err();
    }

    #[test]
    fn partitions_bounds() {
        let mut conf = new_test_config();
        conf.set_from_scalar("partitions", 0_i64.into()).unwrap_err();
        conf.set_from_scalar("partitions", 513_i64.into()).unwrap_err();
        conf.set_from_scalar("partitions", 13_i64.into()).unwrap();
        assert_eq!(ScalarValue::Int64(13), conf.get_as_scalar("partitions").unwrap());
    }

    #[test]
    fn set_policy() {
        let mut conf = new_test_config();
        conf.set_from_scalar("ingestion_policy", "random".into())
            .unwrap();
        assert_eq!(PartitionPolicyKind::Random, conf.ingestion_policy);

        let err = conf
            .set_from_scalar("ingestion_policy", "fair".into())
            .unwrap_err();
        assert!(matches!(err, PlanError::UnsupportedPolicy { .. }));
    }

    #[test]
    fn reset_threshold() {
        let mut conf = new_test_config();
        conf.reset("broadcast_threshold").unwrap();
        assert_eq!(DEFAULT_BROADCAST_THRESHOLD, conf.broadcast_threshold);
    }

    #[test]
    fn derived_configs() {
        let conf = new_test_config();
        assert_eq!(100, conf.optimizer_config().broadcast_threshold);
        let exec = conf.execution_config();
        assert_eq!(4, exec.partitions);
        assert_eq!(1024, exec.batch_size);
    }

    #[test]
    fn settings_listed() {
        let settings = SessionConfig::settings();
        assert_eq!(8, settings.len());
        assert!(settings.iter().any(|(name, _)| *name == "broadcast_threshold"));
    }
}
