use crate::error::AutopinError;
use crate::prelude::*;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

/// Options declared by a policy or a monitor, in declaration order, with their current values.
pub type ConfigOpts = Vec<(String, Vec<String>)>;

/// Flat view over the configuration: every key maps to a list of string values.
///
/// Loaded from a YAML file where a value is either a scalar or a list of scalars. Nested
/// mappings are flattened with dotted keys, so the two documents below are equivalent:
///
/// ```yaml
/// scatter.interval: 500
/// ---
/// scatter:
///   interval: 500
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigView {
    values: BTreeMap<String, Vec<String>>,
}

impl ConfigView {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let document: Value = serde_yaml::from_str(yaml).context("Invalid YAML configuration")?;
        let mut view = ConfigView::default();
        match document {
            Value::Null => {}
            Value::Mapping(mapping) => view.flatten_into(None, mapping)?,
            _ => bail!("The configuration must be a mapping of options"),
        }
        Ok(view)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration at {}", path.display()))?;
        let view = Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse configuration at {}", path.display()))?;
        debug!("Configuration loaded from {}", path.display());
        Ok(view)
    }

    fn flatten_into(&mut self, prefix: Option<&str>, mapping: serde_yaml::Mapping) -> Result<()> {
        for (key, value) in mapping {
            let key = scalar_to_string(&key).context("Configuration keys must be scalars")?;
            let key = match prefix {
                Some(prefix) => format!("{prefix}.{key}"),
                None => key,
            };

            match value {
                Value::Mapping(nested) => self.flatten_into(Some(&key), nested)?,
                Value::Sequence(items) => {
                    let items = items
                        .iter()
                        .map(scalar_to_string)
                        .collect::<Result<Vec<_>>>()
                        .with_context(|| format!("Invalid list for `{key}`"))?;
                    self.values.insert(key, items);
                }
                Value::Null => {
                    self.values.insert(key, Vec::new());
                }
                scalar => {
                    let item = scalar_to_string(&scalar)
                        .with_context(|| format!("Invalid value for `{key}`"))?;
                    self.values.insert(key, vec![item]);
                }
            }
        }
        Ok(())
    }

    /// Apply `key=value` overrides. The first override of a key replaces the values loaded from
    /// the file, later ones for the same key are appended.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, overrides: &[S]) -> Result<()> {
        let mut replaced = std::collections::BTreeSet::new();
        for raw in overrides {
            let raw = raw.as_ref();
            let Some((key, value)) = raw.split_once('=') else {
                bail!("Invalid option `{raw}`, expected KEY=VALUE");
            };
            let key = key.trim();
            ensure!(!key.is_empty(), "Invalid option `{raw}`, the key is empty");

            let values = self.values.entry(key.to_string()).or_default();
            if replaced.insert(key.to_string()) {
                values.clear();
            }
            values.push(value.trim().to_string());
        }
        Ok(())
    }

    pub fn set<I, S>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values
            .insert(key.to_string(), values.into_iter().map(Into::into).collect());
    }

    pub fn count(&self, key: &str) -> usize {
        self.values.get(key).map_or(0, Vec::len)
    }

    pub fn list(&self, key: &str) -> &[String] {
        self.values.get(key).map_or(&[], Vec::as_slice)
    }

    /// The value of an option that may be set at most once.
    pub fn single(&self, key: &str) -> Result<Option<&str>, AutopinError> {
        match self.list(key) {
            [] => Ok(None),
            [value] => Ok(Some(value.as_str())),
            values => Err(AutopinError::bad_config(
                key,
                format!("expected a single value, got {}", values.len()),
            )),
        }
    }

    /// The value of an option that must be set exactly once.
    pub fn required(&self, key: &str) -> Result<&str, AutopinError> {
        self.single(key)?
            .ok_or_else(|| AutopinError::bad_config(key, "option is missing"))
    }

    /// Parse an optional single-valued option.
    pub fn parse_single<T>(&self, key: &str) -> Result<Option<T>, AutopinError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.single(key)?
            .map(|raw| {
                raw.parse::<T>().map_err(|e| {
                    AutopinError::bad_config(key, format!("invalid value `{raw}`: {e}"))
                })
            })
            .transpose()
    }
}

fn scalar_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => bail!("expected a scalar, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
ControlStrategy: scatter
PerformanceMonitors: [cycles, misses]
cycles.type: perf
cycles:
  event_type: PERF_COUNT_HW_CPU_CYCLES
  scale: 0.5
scatter.interval: 500
"#;

    #[test]
    fn test_load_flat_and_nested_keys() {
        let view = ConfigView::from_yaml_str(CONFIG).unwrap();
        assert_eq!(view.required("ControlStrategy").unwrap(), "scatter");
        assert_eq!(view.list("PerformanceMonitors"), ["cycles", "misses"]);
        assert_eq!(view.required("cycles.type").unwrap(), "perf");
        assert_eq!(
            view.required("cycles.event_type").unwrap(),
            "PERF_COUNT_HW_CPU_CYCLES"
        );
        assert_eq!(view.parse_single::<f64>("cycles.scale").unwrap(), Some(0.5));
        assert_eq!(view.list("scatter.interval"), ["500"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autopin.yaml");
        std::fs::write(&path, CONFIG).unwrap();

        let view = ConfigView::load(&path).unwrap();
        assert_eq!(view.count("PerformanceMonitors"), 2);

        let missing = ConfigView::load(&dir.path().join("missing.yaml"));
        assert!(missing.unwrap_err().to_string().contains("Failed to read"));
    }

    #[test]
    fn test_single_rejects_multiple_values() {
        let view = ConfigView::from_yaml_str(CONFIG).unwrap();
        let err = view.single("PerformanceMonitors").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(view.single("unknown").unwrap(), None);
        assert!(view.required("unknown").is_err());
    }

    #[test]
    fn test_parse_single_reports_format() {
        let mut view = ConfigView::default();
        view.set("scatter.interval", ["soon"]);
        let err = view.parse_single::<u64>("scatter.interval").unwrap_err();
        assert!(err.to_string().contains("invalid value `soon`"));
    }

    #[test]
    fn test_overrides_replace_then_append() {
        let mut view = ConfigView::from_yaml_str(CONFIG).unwrap();
        view.apply_overrides(&[
            "PerformanceMonitors=misses",
            "scatter.interval = 250",
            "PerformanceMonitors=stalls",
        ])
        .unwrap();

        assert_eq!(view.list("PerformanceMonitors"), ["misses", "stalls"]);
        assert_eq!(view.list("scatter.interval"), ["250"]);
        assert!(view.apply_overrides(&["novalue"]).is_err());
        assert!(view.apply_overrides(&["=1"]).is_err());
    }

    #[test]
    fn test_rejects_non_mapping_document() {
        assert!(ConfigView::from_yaml_str("- a\n- b\n").is_err());
        assert_eq!(ConfigView::from_yaml_str("").unwrap(), ConfigView::default());
    }
}
