//! Loading and validating prediction and dataset files.
//!
//! Both accept a JSON array or JSON Lines. Predictions are keyed by instance
//! id; an id the dataset does not know is a hard configuration error, not a
//! silent skip.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::ConfigurationError;
use crate::specs::{Prediction, TaskInstance};

/// Model name used for gold predictions synthesized from the dataset.
pub const GOLD_MODEL: &str = "gold";

fn parse_records<T: serde::de::DeserializeOwned>(
    path: &Path,
    contents: &str,
) -> Result<Vec<T>, ConfigurationError> {
    let invalid = |reason: String| ConfigurationError::InvalidPredictions {
        path: path.to_path_buf(),
        reason,
    };

    if contents.trim_start().starts_with('[') {
        return serde_json::from_str(contents).map_err(|e| invalid(e.to_string()));
    }

    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record =
            serde_json::from_str(line).map_err(|e| invalid(format!("line {}: {e}", idx + 1)))?;
        records.push(record);
    }
    Ok(records)
}

/// Loads the task dataset from a JSON array or JSONL file.
pub fn load_dataset(path: &Path) -> Result<Vec<TaskInstance>, ConfigurationError> {
    let contents = std::fs::read_to_string(path)?;
    parse_records(path, &contents)
}

/// Loads predictions keyed by instance id, rejecting duplicates.
pub fn load_predictions(path: &Path) -> Result<HashMap<String, Prediction>, ConfigurationError> {
    let contents = std::fs::read_to_string(path)?;
    let records: Vec<Prediction> = parse_records(path, &contents)?;

    let mut predictions = HashMap::with_capacity(records.len());
    for prediction in records {
        let id = prediction.instance_id.clone();
        if predictions.insert(id.clone(), prediction).is_some() {
            return Err(ConfigurationError::InvalidPredictions {
                path: path.to_path_buf(),
                reason: format!("duplicate instance id '{id}'"),
            });
        }
    }
    Ok(predictions)
}

/// Synthesizes gold predictions from the dataset's own patches.
pub fn gold_predictions(dataset: &[TaskInstance]) -> HashMap<String, Prediction> {
    dataset
        .iter()
        .map(|instance| {
            (
                instance.instance_id.clone(),
                Prediction {
                    instance_id: instance.instance_id.clone(),
                    model_name_or_path: GOLD_MODEL.to_string(),
                    model_patch: Some(instance.patch.clone()),
                },
            )
        })
        .collect()
}

/// Selects the dataset instances to evaluate: those with a prediction,
/// optionally narrowed by an explicit instance-id filter.
///
/// Fails when a prediction or a filter id names an instance the dataset does
/// not contain.
pub fn select_instances(
    dataset: &[TaskInstance],
    predictions: &HashMap<String, Prediction>,
    instance_ids: &[String],
) -> Result<Vec<TaskInstance>, ConfigurationError> {
    let known: HashSet<&str> = dataset.iter().map(|i| i.instance_id.as_str()).collect();

    let mut unknown_predictions: Vec<&str> = predictions
        .keys()
        .map(String::as_str)
        .filter(|id| !known.contains(id))
        .collect();
    if !unknown_predictions.is_empty() {
        unknown_predictions.sort_unstable();
        return Err(ConfigurationError::UnknownPredictions(
            unknown_predictions.join(", "),
        ));
    }

    let mut missing_filter: Vec<&str> = instance_ids
        .iter()
        .map(String::as_str)
        .filter(|id| !known.contains(id))
        .collect();
    if !missing_filter.is_empty() {
        missing_filter.sort_unstable();
        return Err(ConfigurationError::MissingInstances(
            missing_filter.join(", "),
        ));
    }

    let filter: HashSet<&str> = instance_ids.iter().map(String::as_str).collect();
    Ok(dataset
        .iter()
        .filter(|instance| predictions.contains_key(&instance.instance_id))
        .filter(|instance| filter.is_empty() || filter.contains(instance.instance_id.as_str()))
        .cloned()
        .collect())
}
