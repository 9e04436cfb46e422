//! Raw, deserialisable configuration and its validation. Every raw config
//! is checked - attribute names against the schema, base DNs for syntax,
//! intervals for sign - before the component it describes is constructed.
//! A bad configuration is a [`ConfigError`] at startup, never a runtime
//! fault.

use serde::Deserialize;

use crate::be::{BackendConfig, IdxKey, Writability};
use crate::plugins::attrunique::AttrUniqueConfig;
use crate::plugins::refint::RefintConfig;
use crate::prelude::*;
use crate::value::norm_attr;

fn validate_attrs(
    names: &[String],
    schema: &dyn SchemaTransaction,
) -> Result<Vec<AttrString>, ConfigError> {
    if names.is_empty() {
        return Err(ConfigError::EmptyAttributeList);
    }
    names
        .iter()
        .map(|n| {
            if schema.attribute_type(n).is_some() {
                Ok(norm_attr(n))
            } else {
                Err(ConfigError::UnknownAttributeType(n.clone()))
            }
        })
        .collect()
}

fn validate_scopes(
    raw: &[String],
    default_scopes: &[Dn],
) -> Result<Vec<Dn>, ConfigError> {
    let scopes: Vec<Dn> = if raw.is_empty() {
        // Unscoped instances cover all public naming contexts.
        default_scopes.to_vec()
    } else {
        raw.iter()
            .map(|s| Dn::parse(s).map_err(|_| ConfigError::InvalidBaseDn(s.clone())))
            .collect::<Result<_, _>>()?
    };
    if scopes.is_empty() {
        return Err(ConfigError::EmptyBaseDnList);
    }
    Ok(scopes)
}

/// Referential integrity plugin instance configuration as written by an
/// administrator.
#[derive(Debug, Clone, Deserialize)]
pub struct RefintRawConfig {
    pub attribute_types: Vec<String>,
    #[serde(default)]
    pub base_dns: Vec<String>,
    /// Seconds between background repair passes. Zero means repairs run
    /// synchronously in post-operation processing.
    #[serde(default)]
    pub update_interval: i64,
}

impl RefintRawConfig {
    pub fn validate(
        &self,
        schema: &dyn SchemaTransaction,
        default_scopes: &[Dn],
    ) -> Result<RefintConfig, ConfigError> {
        let attrs = validate_attrs(&self.attribute_types, schema)?;
        let scopes = validate_scopes(&self.base_dns, default_scopes)?;
        if self.update_interval < 0 {
            return Err(ConfigError::NegativeInterval(self.update_interval));
        }
        Ok(RefintConfig {
            attrs,
            scopes,
            update_interval: Duration::from_secs(self.update_interval as u64),
        })
    }
}

/// Unique attribute plugin instance configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AttrUniqueRawConfig {
    pub attribute_types: Vec<String>,
    #[serde(default)]
    pub base_dns: Vec<String>,
}

impl AttrUniqueRawConfig {
    pub fn validate(
        &self,
        schema: &dyn SchemaTransaction,
        default_scopes: &[Dn],
    ) -> Result<AttrUniqueConfig, ConfigError> {
        let attrs = validate_attrs(&self.attribute_types, schema)?;
        let scopes = validate_scopes(&self.base_dns, default_scopes)?;
        Ok(AttrUniqueConfig { attrs, scopes })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexRawConfig {
    pub attr: String,
    pub types: Vec<String>,
}

/// Backend configuration as written by an administrator.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendRawConfig {
    pub name: String,
    pub base_dns: Vec<String>,
    #[serde(default = "default_writability")]
    pub writability: Writability,
    #[serde(default)]
    pub indexes: Vec<IndexRawConfig>,
}

fn default_writability() -> Writability {
    Writability::Enabled
}

impl BackendRawConfig {
    pub fn validate(&self, schema: &dyn SchemaTransaction) -> Result<BackendConfig, ConfigError> {
        let base_dns: Vec<Dn> = self
            .base_dns
            .iter()
            .map(|s| Dn::parse(s).map_err(|_| ConfigError::InvalidBaseDn(s.clone())))
            .collect::<Result<_, _>>()?;
        if base_dns.is_empty() {
            return Err(ConfigError::EmptyBaseDnList);
        }

        let mut idxkeys = Vec::new();
        for idx in &self.indexes {
            if schema.attribute_type(&idx.attr).is_none() {
                return Err(ConfigError::UnknownAttributeType(idx.attr.clone()));
            }
            for t in &idx.types {
                let itype = IndexType::try_from(t.as_str())
                    .map_err(|_| ConfigError::UnknownAttributeType(format!("{}:{t}", idx.attr)))?;
                idxkeys.push(IdxKey::new(&idx.attr, itype));
            }
        }

        Ok(BackendConfig {
            name: self.name.clone(),
            base_dns,
            writability: self.writability,
            idxkeys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    #[test]
    fn test_refint_config_validation() {
        let schema = Schema::core();
        let s = schema.read();
        let defaults = vec![dn!("dc=example,dc=com")];

        let raw = RefintRawConfig {
            attribute_types: vec!["member".to_string(), "seeAlso".to_string()],
            base_dns: vec![],
            update_interval: 0,
        };
        let cfg = raw.validate(&s, &defaults).expect("valid config");
        assert_eq!(cfg.attrs, vec![AttrString::from("member"), AttrString::from("seealso")]);
        assert_eq!(cfg.scopes, defaults);
        assert!(cfg.update_interval.is_zero());

        // Unknown attribute is a config error, raised before construction.
        let raw = RefintRawConfig {
            attribute_types: vec!["nosuchattr".to_string()],
            base_dns: vec![],
            update_interval: 0,
        };
        assert_eq!(
            raw.validate(&s, &defaults),
            Err(ConfigError::UnknownAttributeType("nosuchattr".to_string()))
        );

        // Malformed base dn.
        let raw = RefintRawConfig {
            attribute_types: vec!["member".to_string()],
            base_dns: vec!["not a dn".to_string()],
            update_interval: 0,
        };
        assert_eq!(
            raw.validate(&s, &defaults),
            Err(ConfigError::InvalidBaseDn("not a dn".to_string()))
        );

        // Negative interval.
        let raw = RefintRawConfig {
            attribute_types: vec!["member".to_string()],
            base_dns: vec![],
            update_interval: -5,
        };
        assert_eq!(raw.validate(&s, &defaults), Err(ConfigError::NegativeInterval(-5)));

        // Empty monitored attribute list.
        let raw = RefintRawConfig {
            attribute_types: vec![],
            base_dns: vec![],
            update_interval: 0,
        };
        assert_eq!(raw.validate(&s, &defaults), Err(ConfigError::EmptyAttributeList));
    }

    #[test]
    fn test_backend_config_validation() {
        let schema = Schema::core();
        let s = schema.read();

        let raw = BackendRawConfig {
            name: "example".to_string(),
            base_dns: vec!["dc=example,dc=com".to_string()],
            writability: Writability::Enabled,
            indexes: vec![IndexRawConfig {
                attr: "mail".to_string(),
                types: vec!["eq".to_string(), "presence".to_string()],
            }],
        };
        let cfg = raw.validate(&s).expect("valid config");
        assert_eq!(cfg.idxkeys.len(), 2);

        let raw = BackendRawConfig {
            name: "example".to_string(),
            base_dns: vec!["dc=example,dc=com".to_string()],
            writability: Writability::Enabled,
            indexes: vec![IndexRawConfig {
                attr: "mail".to_string(),
                types: vec!["ordering".to_string()],
            }],
        };
        assert!(raw.validate(&s).is_err());
    }
}
