//! Semantic pipeline configuration.
//!
//! Built once at startup (from defaults or a YAML file) and read-only once the
//! workers run. The segmentation scheme decides which label ids count as
//! dynamic; it is resolved to a [`DynamicClasses`] table when the pipeline
//! starts.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{SemanticError, SemanticResult};

/// Supported segmentation models, each with its own label numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationScheme {
    /// Mask R-CNN instance labels (person = 1).
    MaskRcnn,
    /// SegNet / PASCAL VOC labels (person = 15).
    SegNet,
    /// Class table taken from `custom_classes`.
    Custom,
}

impl SegmentationScheme {
    /// Built-in class table of the scheme. Empty for `Custom`.
    fn builtin_classes(self) -> BTreeMap<String, u8> {
        let mut classes = BTreeMap::new();
        match self {
            SegmentationScheme::MaskRcnn => {
                classes.insert("person".to_string(), 1);
            }
            SegmentationScheme::SegNet => {
                classes.insert("person".to_string(), 15);
            }
            SegmentationScheme::Custom => {}
        }
        classes
    }
}

impl FromStr for SegmentationScheme {
    type Err = SemanticError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "maskrcnn" | "mask_rcnn" => Ok(SegmentationScheme::MaskRcnn),
            "segnet" => Ok(SegmentationScheme::SegNet),
            "custom" => Ok(SegmentationScheme::Custom),
            other => Err(SemanticError::Config(format!(
                "unknown segmentation method '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SegmentationScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SegmentationScheme::MaskRcnn => "maskrcnn",
            SegmentationScheme::SegNet => "segnet",
            SegmentationScheme::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Resolved class-name → label-id table of the dynamic classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicClasses {
    classes: BTreeMap<String, u8>,
}

impl DynamicClasses {
    pub fn new(classes: BTreeMap<String, u8>) -> SemanticResult<Self> {
        if classes.is_empty() {
            return Err(SemanticError::Config(
                "no dynamic classes configured".to_string(),
            ));
        }
        Ok(Self { classes })
    }

    /// Label ids considered dynamic, ascending and deduplicated.
    pub fn label_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.classes.values().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.classes.iter().map(|(name, &id)| (name.as_str(), id))
    }
}

/// Moving probability update rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbabilityModel {
    Bayesian,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbabilityUpdateConfig {
    pub model: ProbabilityModel,
    /// P(pixel labeled dynamic | point is moving), Bayesian model only.
    pub dynamic_likelihood: f32,
    /// Blend factor of new evidence, exponential model only.
    pub alpha: f32,
}

impl Default for ProbabilityUpdateConfig {
    fn default() -> Self {
        Self {
            model: ProbabilityModel::Bayesian,
            dynamic_likelihood: 0.7,
            alpha: 0.3,
        }
    }
}

/// Opt-in semantic bundle adjustment worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SemanticBAConfig {
    pub enabled: bool,
    /// The worker only pops once more than this many keyframes are queued.
    pub min_queue_len: usize,
    /// KeyFrames with an id at or below this value are not optimized.
    pub warmup_keyframes: u64,
}

impl Default for SemanticBAConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_queue_len: 5,
            warmup_keyframes: 3,
        }
    }
}

/// Configuration of the semantic pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    /// Initial state of the enable switch.
    pub enabled: bool,
    pub scheme: SegmentationScheme,
    /// Class table used when `scheme` is `custom`.
    pub custom_classes: BTreeMap<String, u8>,
    /// Minimum queued keyframes before a segmentation call.
    pub batch_size: usize,
    pub dilate: bool,
    /// Radius of the elliptical structuring element, in pixels.
    pub dilation_radius: u8,
    /// Points with a moving probability strictly above this are dynamic.
    pub dynamic_threshold: f32,
    /// KeyFrames with an id at or below this value are not re-optimized.
    pub warmup_keyframes: u64,
    pub weight_by_moving_probability: bool,
    pub probability_update: ProbabilityUpdateConfig,
    pub semantic_ba: SemanticBAConfig,
    /// Upper bound of a single idle wait on an empty queue.
    pub idle_wait_ms: u64,
    /// How long `request_finish` waits for workers to report quiescence.
    pub finish_timeout_ms: u64,
    /// Where labels and masks are written; None disables the diagnostics.
    pub diagnostics_dir: Option<PathBuf>,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scheme: SegmentationScheme::MaskRcnn,
            custom_classes: BTreeMap::new(),
            batch_size: 2,
            dilate: true,
            dilation_radius: 15,
            dynamic_threshold: 0.5,
            warmup_keyframes: 2,
            weight_by_moving_probability: true,
            probability_update: ProbabilityUpdateConfig::default(),
            semantic_ba: SemanticBAConfig::default(),
            idle_wait_ms: 100,
            finish_timeout_ms: 300,
            diagnostics_dir: None,
        }
    }
}

impl SemanticConfig {
    /// Load a configuration from a YAML file. Missing keys take defaults.
    pub fn load(path: impl AsRef<Path>) -> SemanticResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            SemanticError::Config(format!("failed to open {:?}: {}", path, e))
        })?;
        let config: SemanticConfig = serde_yaml::from_reader(file).map_err(|e| {
            SemanticError::Config(format!("failed to parse {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> SemanticResult<Self> {
        let config: SemanticConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SemanticError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the dynamic class table of the configured scheme.
    pub fn dynamic_classes(&self) -> SemanticResult<DynamicClasses> {
        let classes = match self.scheme {
            SegmentationScheme::Custom => self.custom_classes.clone(),
            builtin => builtin.builtin_classes(),
        };
        DynamicClasses::new(classes)
    }

    /// Check every field, failing on the first invalid one.
    pub fn validate(&self) -> SemanticResult<()> {
        self.dynamic_classes()?;
        if self.batch_size == 0 {
            return Err(SemanticError::Config("batch_size must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.dynamic_threshold) {
            return Err(SemanticError::Config(format!(
                "dynamic_threshold {} outside [0, 1]",
                self.dynamic_threshold
            )));
        }
        match self.probability_update.model {
            ProbabilityModel::Bayesian => {
                let l = self.probability_update.dynamic_likelihood;
                if !(l > 0.5 && l < 1.0) {
                    return Err(SemanticError::Config(format!(
                        "dynamic_likelihood {} outside (0.5, 1)",
                        l
                    )));
                }
            }
            ProbabilityModel::Exponential => {
                let a = self.probability_update.alpha;
                if !(a > 0.0 && a <= 1.0) {
                    return Err(SemanticError::Config(format!("alpha {} outside (0, 1]", a)));
                }
            }
        }
        if self.dilate && self.dilation_radius == 0 {
            return Err(SemanticError::Config(
                "dilation_radius must be positive when dilation is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SemanticConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.dynamic_threshold, 0.5);
        assert!(!config.semantic_ba.enabled);
    }

    #[test]
    fn test_builtin_schemes() {
        let mut config = SemanticConfig::default();
        assert_eq!(config.dynamic_classes().unwrap().label_ids(), vec![1]);

        config.scheme = "segnet".parse().unwrap();
        assert_eq!(config.dynamic_classes().unwrap().label_ids(), vec![15]);
    }

    #[test]
    fn test_unknown_method_is_config_error() {
        let err = "yolo".parse::<SegmentationScheme>().unwrap_err();
        assert!(matches!(err, SemanticError::Config(_)));
    }

    #[test]
    fn test_custom_scheme_requires_classes() {
        let mut config = SemanticConfig::default();
        config.scheme = SegmentationScheme::Custom;
        assert!(matches!(config.validate(), Err(SemanticError::Config(_))));

        config.custom_classes.insert("car".to_string(), 7);
        config.custom_classes.insert("person".to_string(), 3);
        let classes = config.dynamic_classes().unwrap();
        assert_eq!(classes.label_ids(), vec![3, 7]);
        assert_eq!(classes.iter().count(), 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = SemanticConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = SemanticConfig::default();
        config.dynamic_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = SemanticConfig::default();
        config.probability_update.dynamic_likelihood = 0.4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
scheme: custom
custom_classes:
  person: 4
batch_size: 3
probability_update:
  model: exponential
  alpha: 0.5
semantic_ba:
  enabled: true
"#;
        let config = SemanticConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.scheme, SegmentationScheme::Custom);
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.probability_update.model, ProbabilityModel::Exponential);
        assert!(config.semantic_ba.enabled);
        // Untouched keys keep their defaults
        assert_eq!(config.dilation_radius, 15);
        assert_eq!(config.semantic_ba.min_queue_len, 5);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scheme: segnet\ndynamic_threshold: 0.6").unwrap();
        let config = SemanticConfig::load(file.path()).unwrap();
        assert_eq!(config.scheme, SegmentationScheme::SegNet);
        assert_eq!(config.dynamic_threshold, 0.6);

        assert!(SemanticConfig::load("/nonexistent/semantic.yaml").is_err());
    }
}
