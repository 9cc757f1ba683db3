//! Provisioning settings and where they come from.

use std::collections::HashMap;
use std::path::Path;

use config::{Config, File, FileFormat};
use thiserror::Error;

pub const DEFAULT_SECTION: &str = "EC2";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("section [{0}] not found in config")]
    MissingSection(String),

    #[error("missing config key `{key}` in section [{section}]")]
    MissingKey { section: String, key: String },

    #[error("invalid value `{value}` for config key `{key}`: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Read-only key/value settings under a single named section.
pub trait ConfigSource {
    fn section(&self) -> &str;

    /// Missing keys are an error, never defaulted.
    fn get(&self, key: &str) -> Result<String, ConfigError>;
}

/// One section of an INI file.
#[derive(Debug, Clone)]
pub struct IniConfig {
    section: String,
    values: HashMap<String, String>,
}

impl IniConfig {
    /// Section names match case-insensitively.
    pub fn load(path: &Path, section: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::new(&path.to_string_lossy(), FileFormat::Ini))
            .build()?;
        let root = settings.try_deserialize::<HashMap<String, config::Value>>()?;

        let table = root
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(section))
            .map(|(_, value)| value.into_table())
            .transpose()?
            .ok_or_else(|| ConfigError::MissingSection(section.to_string()))?;

        let mut values = HashMap::with_capacity(table.len());
        for (key, value) in table {
            values.insert(key.to_lowercase(), value.into_string()?);
        }
        tracing::debug!(path = %path.display(), section, keys = values.len(), "loaded config");
        Ok(IniConfig {
            section: section.to_string(),
            values,
        })
    }
}

impl ConfigSource for IniConfig {
    fn section(&self) -> &str {
        &self.section
    }

    fn get(&self, key: &str) -> Result<String, ConfigError> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::MissingKey {
                section: self.section.clone(),
                key: key.to_string(),
            })
    }
}

impl ConfigSource for HashMap<String, String> {
    fn section(&self) -> &str {
        DEFAULT_SECTION
    }

    fn get(&self, key: &str) -> Result<String, ConfigError> {
        HashMap::get(self, key)
            .cloned()
            .ok_or_else(|| ConfigError::MissingKey {
                section: DEFAULT_SECTION.to_string(),
                key: key.to_string(),
            })
    }
}

/// Everything a create needs, validated once at load.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningConfig {
    pub instance_type: String,
    pub product_description: String,
    pub security_group: String,
    pub ami: String,
    pub key_pair: String,
    pub availability_zone: String,
    pub subnet_id: String,
    pub iam_role: String,
    /// Bid ceiling in USD per hour.
    pub max_bid: f64,
    /// Elastic IP to attach once the instance is up. Empty to skip.
    pub public_ip_address: String,
    pub tag: String,
    pub created_by: String,
    pub team: String,
    pub application: String,
}

impl ProvisioningConfig {
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let max_bid_raw = source.get("max_bid")?;
        let max_bid = parse_bid(&max_bid_raw)?;

        Ok(ProvisioningConfig {
            instance_type: source.get("type")?,
            product_description: source.get("product_description")?,
            security_group: source.get("security_group")?,
            ami: source.get("ami")?,
            key_pair: source.get("key_pair")?,
            availability_zone: source.get("availability_zone")?,
            subnet_id: source.get("subnet_id")?,
            iam_role: source.get("iam_role")?,
            max_bid,
            public_ip_address: source.get("public_ip_address")?,
            tag: source.get("tag")?,
            created_by: source.get("created_by")?,
            team: source.get("team")?,
            application: source.get("application")?,
        })
    }
}

fn parse_bid(raw: &str) -> Result<f64, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: "max_bid".to_string(),
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    let bid: f64 = raw.trim().parse().map_err(|_| invalid("not a number"))?;
    if !bid.is_finite() || bid < 0.0 {
        return Err(invalid("must be a non-negative price"));
    }
    Ok(bid)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn sample() -> HashMap<String, String> {
        [
            ("type", "t3.large"),
            ("product_description", "Linux/UNIX"),
            ("security_group", "default"),
            ("ami", "ami-0abc"),
            ("key_pair", "ops"),
            ("availability_zone", "us-east-1a"),
            ("subnet_id", "subnet-123"),
            ("iam_role", "arn:aws:iam::123456789012:instance-profile/worker"),
            ("max_bid", "0.10"),
            ("public_ip_address", "203.0.113.7"),
            ("tag", "worker"),
            ("created_by", "ops"),
            ("team", "data"),
            ("application", "etl"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn loads_every_field() {
        let cfg = ProvisioningConfig::from_source(&sample()).unwrap();
        assert_eq!(cfg.instance_type, "t3.large");
        assert_eq!(cfg.max_bid, 0.10);
        assert_eq!(cfg.public_ip_address, "203.0.113.7");
        assert_eq!(cfg.application, "etl");
    }

    #[test]
    fn missing_key_is_fatal() {
        let mut source = sample();
        source.remove("team");
        match ProvisioningConfig::from_source(&source) {
            Err(ConfigError::MissingKey { key, section }) => {
                assert_eq!(key, "team");
                assert_eq!(section, "EC2");
            }
            other => panic!("expected missing key, got {other:?}"),
        }
    }

    #[test]
    fn bid_must_be_numeric() {
        let mut source = sample();
        source.insert("max_bid".to_string(), "cheap".to_string());
        assert!(matches!(
            ProvisioningConfig::from_source(&source),
            Err(ConfigError::InvalidValue { .. })
        ));

        source.insert("max_bid".to_string(), "-1".to_string());
        assert!(ProvisioningConfig::from_source(&source).is_err());
    }

    #[test]
    fn empty_public_ip_is_allowed() {
        let mut source = sample();
        source.insert("public_ip_address".to_string(), String::new());
        let cfg = ProvisioningConfig::from_source(&source).unwrap();
        assert!(cfg.public_ip_address.is_empty());
    }

    #[test]
    fn reads_ini_section() {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        writeln!(file, "[EC2]").unwrap();
        for (key, value) in sample() {
            writeln!(file, "{key} = {value}").unwrap();
        }
        writeln!(file, "[Other]").unwrap();
        writeln!(file, "type = m5.large").unwrap();
        file.flush().unwrap();

        let ini = IniConfig::load(file.path(), "EC2").unwrap();
        assert_eq!(ini.section(), "EC2");
        let cfg = ProvisioningConfig::from_source(&ini).unwrap();
        assert_eq!(cfg.instance_type, "t3.large");
        assert_eq!(cfg.subnet_id, "subnet-123");

        let other = IniConfig::load(file.path(), "other").unwrap();
        assert_eq!(other.get("type").unwrap(), "m5.large");
        assert!(matches!(other.get("ami"), Err(ConfigError::MissingKey { .. })));
    }

    #[test]
    fn unknown_section_is_reported() {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        writeln!(file, "[EC2]\ntype = t3.micro").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            IniConfig::load(file.path(), "GCE"),
            Err(ConfigError::MissingSection(_))
        ));
    }
}
