//! Detection module discovery
//!
//! Every `*.onnx` file in the model directory is a module, named by its file
//! name. A `<stem>.yaml` next to it may carry the class list under `names:`,
//! either as a sequence or as an index map; without one the COCO classes apply.

use crate::{
    DetectionCapability, DetectionError, DetectionResult, DetectorConfig, DetectorFactory,
    IouTracker, TrackedDetector, YoloDetector, COCO_CLASSES,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MODEL_EXTENSION: &str = "onnx";

/// Largest class index an index map may use
const MAX_CLASS_INDEX: usize = 4095;

#[derive(Debug, Deserialize)]
struct ClassFile {
    names: ClassNames,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClassNames {
    List(Vec<String>),
    Map(BTreeMap<usize, String>),
}

impl ClassNames {
    fn into_vec(self) -> Result<Vec<String>, String> {
        match self {
            Self::List(names) => Ok(names),
            Self::Map(map) => {
                let last = map.keys().next_back().copied();
                if let Some(last) = last.filter(|last| *last > MAX_CLASS_INDEX) {
                    return Err(format!("class index {last} exceeds {MAX_CLASS_INDEX}"));
                }
                let len = last.map_or(0, |last| last + 1);
                let mut names: Vec<String> = (0..len).map(|i| format!("class_{i}")).collect();
                for (index, name) in map {
                    names[index] = name;
                }
                Ok(names)
            }
        }
    }
}

/// Factory over the ONNX models of a directory
pub struct OnnxModelFactory {
    config: DetectorConfig,
}

impl OnnxModelFactory {
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn model_dir(&self) -> &Path {
        &self.config.model_dir
    }

    fn model_path(&self, module: &str) -> PathBuf {
        self.config.model_dir.join(module)
    }

    /// `logo` and `logo.onnx` name the same module
    fn file_name(module: &str) -> String {
        if Path::new(module)
            .extension()
            .is_some_and(|ext| ext == MODEL_EXTENSION)
        {
            module.to_string()
        } else {
            format!("{module}.{MODEL_EXTENSION}")
        }
    }

    fn load_class_names(&self, module: &str) -> DetectionResult<Vec<String>> {
        let sidecar = self.model_path(module).with_extension("yaml");
        if !sidecar.exists() {
            return Ok(COCO_CLASSES.iter().map(|s| (*s).to_string()).collect());
        }

        let raw = std::fs::read_to_string(&sidecar)?;
        let file: ClassFile = serde_yaml::from_str(&raw)
            .map_err(|e| DetectionError::ClassList(format!("{}: {e}", sidecar.display())))?;
        file.names
            .into_vec()
            .map_err(|e| DetectionError::ClassList(format!("{}: {e}", sidecar.display())))
    }
}

impl DetectorFactory for OnnxModelFactory {
    fn modules(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.config.model_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Cannot read model directory {}: {}",
                    self.config.model_dir.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut modules: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| {
                Path::new(name)
                    .extension()
                    .is_some_and(|ext| ext == MODEL_EXTENSION)
            })
            .collect();
        modules.sort();
        modules
    }

    fn resolve(&self, module_name: Option<&str>) -> Option<String> {
        let requested = module_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .or(self.config.default_module.as_deref());

        match requested {
            // Only listed modules, so a name can never reach outside the model directory
            Some(name) => {
                let file_name = Self::file_name(name);
                self.modules().into_iter().find(|module| *module == file_name)
            }
            None => self.modules().into_iter().next(),
        }
    }

    fn class_names(&self, module: &str) -> Option<Vec<String>> {
        let module = self.resolve(Some(module))?;
        match self.load_class_names(&module) {
            Ok(names) if !names.is_empty() => Some(names),
            Ok(_) => None,
            Err(e) => {
                warn!("Cannot read class names for {}: {}", module, e);
                None
            }
        }
    }

    fn create(&self, module: &str) -> DetectionResult<Box<dyn DetectionCapability>> {
        let module = self
            .resolve(Some(module))
            .ok_or_else(|| DetectionError::UnknownModule(module.to_string()))?;

        let class_names = self.load_class_names(&module)?;
        info!("Creating detector {} with {} classes", module, class_names.len());

        let detector = YoloDetector::new(
            self.model_path(&module),
            class_names,
            self.config.yolo.clone(),
        )?;
        let tracker = IouTracker::new(self.config.tracker.clone());
        Ok(Box::new(TrackedDetector::new(detector, tracker)))
    }
}
