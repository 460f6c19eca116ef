use std::{
    borrow::Cow,
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};
use ndarray::{ArrayD, IxDyn};
use parameters::ParameterSet;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use super::{CheckpointIndex, CheckpointMetadata};
use crate::CheckpointErr;

/// The name prefix of every snapshot directory, followed by `-<step>`.
pub const CHECKPOINT_PREFIX: &str = "latest_model.ckpt";

const INDEX_FILE: &str = "checkpoint";
const TENSORS_FILE: &str = "tensors.safetensors";
const METADATA_FILE: &str = "metadata.json";
const TMP_SUFFIX: &str = ".tmp";
const OLD_SUFFIX: &str = ".old";

const PARAMS_KEY: &str = "params/";
const SHADOWS_KEY: &str = "shadows/";
const OPTIMIZER_KEY: &str = "optimizer/";

type Result<T> = std::result::Result<T, CheckpointErr>;

/// Everything read back from a snapshot directory.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub metadata: CheckpointMetadata,
    pub params: ParameterSet,
    pub shadows: ParameterSet,
    /// Optimizer slots keyed by `<parameter>/<slot>`.
    pub optimizer: BTreeMap<String, Vec<f32>>,
}

/// Writes snapshots of the training state into a training directory and reads them back.
///
/// A snapshot is first written to a `.tmp` directory and renamed into place once complete,
/// and the index file is only rewritten after that, so the index never points at a partial
/// snapshot. Snapshots are never deleted.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    train_dir: PathBuf,
}

impl CheckpointManager {
    /// Creates a new `CheckpointManager`, the directory is created on the first save.
    pub fn new(train_dir: impl Into<PathBuf>) -> Self {
        Self {
            train_dir: train_dir.into(),
        }
    }

    pub fn train_dir(&self) -> &Path {
        &self.train_dir
    }

    /// The directory name of the snapshot taken after `step`.
    pub fn snapshot_name(step: u64) -> String {
        format!("{CHECKPOINT_PREFIX}-{step}")
    }

    /// Writes a snapshot and makes it the latest one.
    ///
    /// # Arguments
    /// * `step` - The training step the snapshot is taken after.
    /// * `global_step` - The global step of `params`.
    /// * `params` - The parameter values.
    /// * `shadows` - The moving averages of the parameters.
    /// * `optimizer` - The optimizer slots, keyed by `<parameter>/<slot>`.
    ///
    /// # Returns
    /// The path of the new snapshot directory.
    pub fn save(
        &self,
        step: u64,
        global_step: u64,
        params: &ParameterSet,
        shadows: &ParameterSet,
        optimizer: &BTreeMap<String, Vec<f32>>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.train_dir).map_err(CheckpointErr::io(&self.train_dir))?;

        let name = Self::snapshot_name(step);
        let final_dir = self.train_dir.join(&name);
        let tmp_dir = self.train_dir.join(format!("{name}{TMP_SUFFIX}"));

        if tmp_dir.is_dir() {
            fs::remove_dir_all(&tmp_dir).map_err(CheckpointErr::io(&tmp_dir))?;
        }
        fs::create_dir_all(&tmp_dir).map_err(CheckpointErr::io(&tmp_dir))?;

        write_tensors(&tmp_dir.join(TENSORS_FILE), params, shadows, optimizer)?;

        let metadata = CheckpointMetadata {
            step,
            global_step,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            num_params: params.len(),
            num_shadows: shadows.len(),
            num_optimizer_slots: optimizer.len(),
        };
        write_json(&tmp_dir.join(METADATA_FILE), &metadata)?;

        // The snapshot being replaced is only deleted once the new one is published.
        let old_dir = self.train_dir.join(format!("{name}{OLD_SUFFIX}"));
        let replacing = final_dir.exists();
        if replacing {
            if old_dir.exists() {
                fs::remove_dir_all(&old_dir).map_err(CheckpointErr::io(&old_dir))?;
            }
            fs::rename(&final_dir, &old_dir).map_err(CheckpointErr::io(&final_dir))?;
        }

        if let Err(source) = fs::rename(&tmp_dir, &final_dir) {
            if replacing {
                if let Err(e) = fs::rename(&old_dir, &final_dir) {
                    warn!("failed to put back {}: {e}", final_dir.display());
                }
            }
            return Err(CheckpointErr::io(&final_dir)(source));
        }

        self.update_index(&name, step, global_step)?;
        if replacing {
            if let Err(e) = fs::remove_dir_all(&old_dir) {
                warn!("failed to remove the replaced snapshot {}: {e}", old_dir.display());
            }
        }
        debug!(step = step, global_step = global_step; "wrote checkpoint {}", final_dir.display());

        Ok(final_dir)
    }

    /// Reads the index file, `None` if there's none or it can't be parsed.
    pub fn index(&self) -> Option<CheckpointIndex> {
        read_index(&self.train_dir)
    }

    /// Lists the snapshot directories by ascending step.
    pub fn list(&self) -> Result<Vec<(u64, PathBuf)>> {
        list_snapshots(&self.train_dir)
    }

    fn update_index(&self, name: &str, step: u64, global_step: u64) -> Result<()> {
        let mut index = self.index().unwrap_or_default();

        index.model_checkpoint_path = name.to_string();
        index.step = step;
        index.global_step = global_step;
        if !index.all_model_checkpoint_paths.iter().any(|path| path == name) {
            index.all_model_checkpoint_paths.push(name.to_string());
        }

        let tmp = self.train_dir.join(format!("{INDEX_FILE}{TMP_SUFFIX}"));
        let path = self.train_dir.join(INDEX_FILE);
        write_json(&tmp, &index)?;
        fs::rename(&tmp, &path).map_err(CheckpointErr::io(&path))
    }

    /// Finds and loads a snapshot.
    ///
    /// # Arguments
    /// * `path` - A training directory or a snapshot directory.
    /// * `name` - A snapshot directory name inside `path`. When `None` and `path` is a
    ///   training directory, the snapshot named by its index is tried first and then every
    ///   other snapshot from newest to oldest.
    ///
    /// # Returns
    /// The snapshot, or `None` if there's nothing to restore from.
    pub fn restore(path: &Path, name: Option<&str>) -> Result<Option<Snapshot>> {
        if !path.exists() {
            return Ok(None);
        }

        if let Some(name) = name {
            let dir = path.join(name);
            if !dir.join(TENSORS_FILE).exists() {
                return Ok(None);
            }
            return load_snapshot(&dir).map(Some);
        }

        if path.join(TENSORS_FILE).exists() {
            return load_snapshot(path).map(Some);
        }

        let indexed = read_index(path).map(|index| path.join(index.model_checkpoint_path));
        let newest_first = list_snapshots(path)?
            .into_iter()
            .rev()
            .map(|(_, dir)| dir)
            .filter(|dir| indexed.as_ref() != Some(dir));
        let candidates: Vec<_> = indexed.clone().into_iter().chain(newest_first).collect();

        for dir in candidates {
            match load_snapshot(&dir) {
                Ok(snapshot) => {
                    info!(
                        step = snapshot.metadata.step, global_step = snapshot.metadata.global_step;
                        "restoring checkpoint {}", dir.display()
                    );
                    return Ok(Some(snapshot));
                }
                Err(e) => warn!("skipping unreadable checkpoint: {e}"),
            }
        }

        Ok(None)
    }
}

fn read_index(train_dir: &Path) -> Option<CheckpointIndex> {
    let path = train_dir.join(INDEX_FILE);
    let raw = fs::read_to_string(&path).ok()?;

    match serde_json::from_str(&raw) {
        Ok(index) => Some(index),
        Err(e) => {
            warn!("ignoring malformed checkpoint index {}: {e}", path.display());
            None
        }
    }
}

fn list_snapshots(train_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    if !train_dir.exists() {
        return Ok(Vec::new());
    }

    let prefix = format!("{CHECKPOINT_PREFIX}-");
    let mut snapshots = Vec::new();

    for entry in fs::read_dir(train_dir).map_err(CheckpointErr::io(train_dir))? {
        let entry = entry.map_err(CheckpointErr::io(train_dir))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let file_name = entry.file_name();
        let Some(step) = file_name
            .to_str()
            .and_then(|name| name.strip_prefix(&prefix))
            .and_then(|step| step.parse().ok())
        else {
            continue;
        };

        snapshots.push((step, path));
    }

    snapshots.sort_by_key(|(step, _)| *step);
    Ok(snapshots)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(CheckpointErr::metadata(path))?;
    fs::write(path, json).map_err(CheckpointErr::io(path))
}

/// Borrows the scalars of a tensor in logical order, copying only non-standard layouts.
fn scalars(tensor: &ArrayD<f32>) -> Cow<'_, [f32]> {
    match tensor.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(tensor.iter().copied().collect()),
    }
}

fn write_tensors(
    path: &Path,
    params: &ParameterSet,
    shadows: &ParameterSet,
    optimizer: &BTreeMap<String, Vec<f32>>,
) -> Result<()> {
    let mut entries: Vec<(String, Vec<usize>, Cow<'_, [f32]>)> = Vec::new();

    for (prefix, set) in [(PARAMS_KEY, params), (SHADOWS_KEY, shadows)] {
        for (name, tensor) in set {
            entries.push((format!("{prefix}{name}"), tensor.shape().to_vec(), scalars(tensor)));
        }
    }

    for (key, values) in optimizer {
        let shape = vec![values.len()];
        let values = Cow::Borrowed(values.as_slice());
        entries.push((format!("{OPTIMIZER_KEY}{key}"), shape, values));
    }

    let mut views = BTreeMap::new();
    for (key, shape, values) in &entries {
        let values: &[f32] = values;
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .map_err(|e| CheckpointErr::tensors(path, format!("{e:?}")))?;
        views.insert(key.clone(), view);
    }

    safetensors::serialize_to_file(&views, &None, path)
        .map_err(|e| CheckpointErr::tensors(path, format!("{e:?}")))
}

fn load_snapshot(dir: &Path) -> Result<Snapshot> {
    let metadata_path = dir.join(METADATA_FILE);
    let raw = fs::read_to_string(&metadata_path).map_err(CheckpointErr::io(&metadata_path))?;
    let metadata: CheckpointMetadata =
        serde_json::from_str(&raw).map_err(CheckpointErr::metadata(&metadata_path))?;

    let tensors_path = dir.join(TENSORS_FILE);
    let bytes = fs::read(&tensors_path).map_err(CheckpointErr::io(&tensors_path))?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| CheckpointErr::tensors(&tensors_path, format!("{e:?}")))?;

    let mut params = ParameterSet::new();
    let mut shadows = ParameterSet::new();
    let mut optimizer = BTreeMap::new();

    for (key, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(CheckpointErr::tensors(
                &tensors_path,
                format!("`{key}` is {:?}, expected F32", view.dtype()),
            ));
        }

        let values: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        if let Some(name) = key.strip_prefix(OPTIMIZER_KEY) {
            optimizer.insert(name.to_string(), values);
            continue;
        }

        let tensor = ArrayD::from_shape_vec(IxDyn(view.shape()), values)
            .map_err(|e| CheckpointErr::tensors(&tensors_path, format!("`{key}`: {e}")))?;

        if let Some(name) = key.strip_prefix(PARAMS_KEY) {
            params.insert(name, tensor);
        } else if let Some(name) = key.strip_prefix(SHADOWS_KEY) {
            shadows.insert(name, tensor);
        } else {
            warn!("ignoring unknown checkpoint tensor `{key}`");
        }
    }

    if params.len() != metadata.num_params {
        return Err(CheckpointErr::tensors(
            &tensors_path,
            format!("found {} parameters, expected {}", params.len(), metadata.num_params),
        ));
    }

    Ok(Snapshot {
        path: dir.to_path_buf(),
        metadata,
        params,
        shadows,
        optimizer,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn sample_params() -> ParameterSet {
        let mut params = ParameterSet::new();
        params.insert("dense/kernel", array![[0.1f32, -2.5], [3.25, f32::MIN_POSITIVE]].into_dyn());
        params.insert("dense/bias", array![1e-7f32, -0.0].into_dyn());
        params
    }

    fn sample_optimizer() -> BTreeMap<String, Vec<f32>> {
        BTreeMap::from([
            ("dense/bias/v".to_string(), vec![0.5, 0.25]),
            ("dense/bias/beta_powers".to_string(), vec![0.9, 0.999]),
        ])
    }

    #[test]
    fn test_round_trip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let params = sample_params();
        let mut shadows = sample_params();
        shadows.insert("dense/bias", array![7.0f32, 8.0].into_dyn());

        let path = manager.save(41, 42, &params, &shadows, &sample_optimizer()).unwrap();
        assert_eq!(path, dir.path().join("latest_model.ckpt-41"));

        let snapshot = CheckpointManager::restore(dir.path(), None).unwrap().unwrap();
        assert_eq!(snapshot.metadata.step, 41);
        assert_eq!(snapshot.metadata.global_step, 42);
        assert_eq!(snapshot.optimizer, sample_optimizer());
        assert_eq!(snapshot.shadows, shadows);

        for (name, tensor) in &params {
            let restored = snapshot.params.get(name).unwrap();
            assert_eq!(restored.shape(), tensor.shape());
            let same_bits = restored
                .iter()
                .zip(tensor.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits());
            assert!(same_bits, "{name}");
        }
    }

    #[test]
    fn test_not_found_on_empty_or_missing_dir() {
        let dir = tempfile::tempdir().unwrap();

        assert!(CheckpointManager::restore(dir.path(), None).unwrap().is_none());
        let missing = dir.path().join("nope");
        assert!(CheckpointManager::restore(&missing, None).unwrap().is_none());
        let named = CheckpointManager::restore(dir.path(), Some("latest_model.ckpt-3")).unwrap();
        assert!(named.is_none());
    }

    #[test]
    fn test_index_tracks_latest_and_all() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let params = sample_params();

        for step in [0, 1000, 1999] {
            manager.save(step, step + 1, &params, &params, &BTreeMap::new()).unwrap();
        }

        let index = manager.index().unwrap();
        assert_eq!(index.model_checkpoint_path, "latest_model.ckpt-1999");
        assert_eq!(index.global_step, 2000);
        assert_eq!(index.all_model_checkpoint_paths.len(), 3);

        let steps: Vec<_> = manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, [0, 1000, 1999]);
        assert!(!dir.path().join("latest_model.ckpt-1999.tmp").exists());
    }

    #[test]
    fn test_named_and_direct_restore() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let params = sample_params();

        manager.save(0, 1, &params, &params, &BTreeMap::new()).unwrap();
        let latest = manager.save(5, 6, &params, &params, &BTreeMap::new()).unwrap();

        let named = CheckpointManager::restore(dir.path(), Some("latest_model.ckpt-0"))
            .unwrap()
            .unwrap();
        assert_eq!(named.metadata.step, 0);

        let direct = CheckpointManager::restore(&latest, None).unwrap().unwrap();
        assert_eq!(direct.metadata.step, 5);
        assert_eq!(direct.path, latest);
    }

    #[test]
    fn test_corrupt_latest_falls_back_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let params = sample_params();

        manager.save(0, 1, &params, &params, &BTreeMap::new()).unwrap();
        let latest = manager.save(10, 11, &params, &params, &BTreeMap::new()).unwrap();
        fs::write(latest.join(TENSORS_FILE), b"garbage").unwrap();

        let snapshot = CheckpointManager::restore(dir.path(), None).unwrap().unwrap();
        assert_eq!(snapshot.metadata.step, 0);
    }

    #[test]
    fn test_failed_save_keeps_previous_latest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let params = sample_params();

        manager.save(0, 1, &params, &params, &BTreeMap::new()).unwrap();
        fs::write(dir.path().join("latest_model.ckpt-5.tmp"), b"in the way").unwrap();

        let err = manager.save(5, 6, &params, &params, &BTreeMap::new());
        assert!(matches!(err, Err(CheckpointErr::Io { .. })));

        let index = manager.index().unwrap();
        assert_eq!(index.model_checkpoint_path, "latest_model.ckpt-0");
        assert_eq!(index.step, 0);
        assert_eq!(index.all_model_checkpoint_paths, ["latest_model.ckpt-0"]);

        let steps: Vec<_> = manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, [0]);
        let snapshot = CheckpointManager::restore(dir.path(), None).unwrap().unwrap();
        assert_eq!(snapshot.metadata.step, 0);
    }

    #[test]
    fn test_resave_replaces_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let params = sample_params();
        let mut shadows = sample_params();
        shadows.insert("dense/bias", array![7.0f32, 8.0].into_dyn());

        manager.save(5, 6, &params, &params, &BTreeMap::new()).unwrap();
        fs::create_dir_all(dir.path().join("latest_model.ckpt-5.old")).unwrap();
        let path = manager.save(5, 6, &params, &shadows, &sample_optimizer()).unwrap();

        let snapshot = CheckpointManager::restore(&path, None).unwrap().unwrap();
        assert_eq!(snapshot.shadows, shadows);
        assert_eq!(snapshot.optimizer, sample_optimizer());

        assert!(!dir.path().join("latest_model.ckpt-5.old").exists());
        assert_eq!(manager.index().unwrap().all_model_checkpoint_paths.len(), 1);
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[test]
    fn test_leftover_tmp_dirs_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let params = sample_params();

        manager.save(3, 4, &params, &params, &BTreeMap::new()).unwrap();
        fs::create_dir_all(dir.path().join("latest_model.ckpt-9.tmp")).unwrap();

        assert_eq!(manager.list().unwrap().len(), 1);
        let snapshot = CheckpointManager::restore(dir.path(), None).unwrap().unwrap();
        assert_eq!(snapshot.metadata.step, 3);
    }
}
