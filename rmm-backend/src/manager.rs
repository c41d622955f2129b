//! Model lifecycle manager.
//!
//! Owns every loaded model instance and the most recent catalog scan.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::catalog::{self, ModelDescriptor};
use crate::engine::{LoadParams, ModelHandle, ModelRuntime};
use crate::error::{Error, Result};

/// An instantiated model.
pub struct LoadedModel {
    pub name: String,
    pub context_size: u32,
    pub gpu_layers: i32,
    pub loaded_at: DateTime<Utc>,
    pub(crate) handle: Box<dyn ModelHandle>,
    /// Serializes generations against this instance.
    pub(crate) generation_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("context_size", &self.context_size)
            .field("gpu_layers", &self.gpu_layers)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

/// Result of a successful `load` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// The model was already loaded; its settings were left untouched.
    AlreadyLoaded,
}

/// Owns the catalog and the set of loaded models.
pub struct ModelManager {
    models_dir: PathBuf,
    runtime: Arc<dyn ModelRuntime>,
    catalog: RwLock<HashMap<String, ModelDescriptor>>,
    loaded: RwLock<HashMap<String, Arc<LoadedModel>>>,
    load_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelManager {
    pub fn new(models_dir: impl Into<PathBuf>, runtime: Arc<dyn ModelRuntime>) -> Self {
        Self {
            models_dir: models_dir.into(),
            runtime,
            catalog: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
            load_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn models_dir(&self) -> &std::path::Path {
        &self.models_dir
    }

    /// Rescan the models directory and replace the catalog.
    pub async fn refresh_catalog(&self) -> Vec<ModelDescriptor> {
        let scanned = catalog::scan(&self.models_dir);
        tracing::info!(
            "Found {} models in {}",
            scanned.len(),
            self.models_dir.display()
        );

        {
            let mut catalog = self.catalog.write().await;
            *catalog = scanned
                .into_iter()
                .map(|descriptor| (descriptor.name.clone(), descriptor))
                .collect();
        }

        self.catalog().await
    }

    /// Descriptors from the most recent scan, with `loaded` filled in.
    pub async fn catalog(&self) -> Vec<ModelDescriptor> {
        let catalog = self.catalog.read().await;
        let loaded = self.loaded.read().await;

        let mut descriptors: Vec<ModelDescriptor> = catalog
            .values()
            .map(|descriptor| ModelDescriptor {
                loaded: loaded.contains_key(&descriptor.name),
                ..descriptor.clone()
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Load `name` with `params`.
    ///
    /// Concurrent loads of the same name instantiate the engine once.
    pub async fn load(&self, name: &str, params: LoadParams) -> Result<LoadOutcome> {
        if self.is_loaded(name).await {
            tracing::info!("Model {} already loaded", name);
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        let descriptor = self
            .catalog
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;

        let name_lock = {
            let mut locks = self.load_locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _guard = name_lock.lock().await;
            self.load_exclusive(descriptor, params).await
        };

        // Drop the per-name lock once no other load is waiting on it.
        let mut locks = self.load_locks.lock().await;
        if Arc::strong_count(&name_lock) == 2 {
            locks.remove(name);
        }

        result
    }

    async fn load_exclusive(
        &self,
        descriptor: ModelDescriptor,
        params: LoadParams,
    ) -> Result<LoadOutcome> {
        let name = descriptor.name.clone();

        // Another load of the same name may have finished while we waited.
        if self.is_loaded(&name).await {
            tracing::info!("Model {} already loaded", name);
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        tracing::info!(
            "Loading model {} from {} (ctx: {}, gpu layers: {}, runtime: {})",
            name,
            descriptor.path.display(),
            params.context_size,
            params.gpu_layers,
            self.runtime.runtime_type()
        );

        let handle = self
            .runtime
            .instantiate(&descriptor, &params)
            .await
            .map_err(|e| Error::EngineInit(e.message()))?;

        let model = Arc::new(LoadedModel {
            name: name.clone(),
            context_size: params.context_size,
            gpu_layers: params.gpu_layers,
            loaded_at: Utc::now(),
            handle,
            generation_lock: Arc::new(Mutex::new(())),
        });

        self.loaded.write().await.insert(name.clone(), model);
        tracing::info!("Model {} loaded", name);

        Ok(LoadOutcome::Loaded)
    }

    /// Unload `name`. Returns false if it was not loaded.
    pub async fn unload(&self, name: &str) -> bool {
        let removed = self.loaded.write().await.remove(name);
        match removed {
            Some(model) => {
                model.handle.release().await;
                tracing::info!("Model {} unloaded", name);
                true
            }
            None => false,
        }
    }

    /// Unload every loaded model.
    pub async fn unload_all(&self) {
        let drained: Vec<Arc<LoadedModel>> = {
            let mut loaded = self.loaded.write().await;
            loaded.drain().map(|(_, model)| model).collect()
        };

        for model in drained {
            model.handle.release().await;
            tracing::info!("Model {} unloaded", model.name);
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<LoadedModel>> {
        self.loaded.read().await.get(name).cloned()
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.loaded.read().await.contains_key(name)
    }

    /// Names of loaded models, sorted.
    pub async fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn loaded_count(&self) -> usize {
        self.loaded.read().await.len()
    }

    /// Resident memory of this process, in bytes.
    pub fn memory_usage_bytes(&self) -> u64 {
        crate::system::process_memory_bytes()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::testing::{models_dir, ScriptedRuntime};
    use super::*;

    async fn manager_with(
        runtime: ScriptedRuntime,
        names: &[&str],
    ) -> (ModelManager, tempfile::TempDir, Arc<ScriptedRuntime>) {
        let dir = models_dir(names);
        let runtime = Arc::new(runtime);
        let manager = ModelManager::new(dir.path(), runtime.clone());
        manager.refresh_catalog().await;
        (manager, dir, runtime)
    }

    #[tokio::test]
    async fn test_load_then_unload_restores_loaded_set() {
        let (manager, _dir, runtime) =
            manager_with(ScriptedRuntime::new(&["hi"]), &["alpha", "beta"]).await;

        manager.load("beta", LoadParams::default()).await.unwrap();
        let before = manager.loaded_names().await;

        assert_eq!(
            manager.load("alpha", LoadParams::default()).await.unwrap(),
            LoadOutcome::Loaded
        );
        assert_eq!(manager.loaded_names().await, vec!["alpha", "beta"]);

        assert!(manager.unload("alpha").await);
        assert_eq!(manager.loaded_names().await, before);
        assert_eq!(runtime.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let (manager, _dir, runtime) =
            manager_with(ScriptedRuntime::new(&[]), &["alpha"]).await;

        let first = LoadParams {
            context_size: 2048,
            gpu_layers: 10,
        };
        manager.load("alpha", first).await.unwrap();

        let outcome = manager
            .load("alpha", LoadParams::default())
            .await
            .unwrap();
        assert_eq!(outcome, LoadOutcome::AlreadyLoaded);
        assert_eq!(manager.loaded_count().await, 1);
        assert_eq!(runtime.instantiations.load(Ordering::SeqCst), 1);

        let model = manager.get("alpha").await.unwrap();
        assert_eq!(model.context_size, 2048);
        assert_eq!(model.gpu_layers, 10);
    }

    #[tokio::test]
    async fn test_unload_never_loaded_returns_false() {
        let (manager, _dir, runtime) =
            manager_with(ScriptedRuntime::new(&[]), &["alpha"]).await;

        assert!(!manager.unload("alpha").await);
        assert!(!manager.unload("missing").await);
        assert_eq!(runtime.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_load_unknown_model() {
        let (manager, _dir, _runtime) =
            manager_with(ScriptedRuntime::new(&[]), &["alpha"]).await;

        let err = manager
            .load("missing", LoadParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(name) if name == "missing"));
        assert!(manager.loaded_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_engine_failure_leaves_state_unchanged() {
        let mut runtime = ScriptedRuntime::new(&[]);
        runtime.fail_instantiate = Some("out of memory".to_string());
        let (manager, _dir, _runtime) = manager_with(runtime, &["alpha"]).await;

        let err = manager
            .load("alpha", LoadParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EngineInit(msg) if msg == "out of memory"));
        assert!(!manager.is_loaded("alpha").await);
    }

    #[tokio::test]
    async fn test_unload_all_on_empty_set_is_noop() {
        let (manager, _dir, runtime) = manager_with(ScriptedRuntime::new(&[]), &[]).await;
        manager.unload_all().await;
        assert_eq!(manager.loaded_count().await, 0);
        assert_eq!(runtime.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unload_all_releases_everything() {
        let (manager, _dir, runtime) =
            manager_with(ScriptedRuntime::new(&[]), &["alpha", "beta"]).await;
        manager.load("alpha", LoadParams::default()).await.unwrap();
        manager.load("beta", LoadParams::default()).await.unwrap();

        manager.unload_all().await;
        assert!(manager.loaded_names().await.is_empty());
        assert_eq!(runtime.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_loads_instantiate_once() {
        let mut runtime = ScriptedRuntime::new(&[]);
        runtime.instantiate_delay = Duration::from_millis(50);
        let (manager, _dir, runtime) = manager_with(runtime, &["alpha"]).await;
        let manager = Arc::new(manager);

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.load("alpha", LoadParams::default()).await }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.load("alpha", LoadParams::default()).await }
        });

        let mut outcomes = vec![a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        outcomes.sort_by_key(|o| *o == LoadOutcome::AlreadyLoaded);
        assert_eq!(outcomes, vec![LoadOutcome::Loaded, LoadOutcome::AlreadyLoaded]);
        assert_eq!(runtime.instantiations.load(Ordering::SeqCst), 1);
        assert!(manager.load_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_locks_do_not_accumulate() {
        let mut runtime = ScriptedRuntime::new(&[]);
        runtime.fail_instantiate = Some("bad file".to_string());
        let (manager, _dir, _runtime) = manager_with(runtime, &["alpha"]).await;

        for i in 0..100 {
            let result = manager.load(&format!("nope-{i}"), LoadParams::default()).await;
            assert!(matches!(result, Err(Error::ModelNotFound(_))));
        }
        assert!(manager.load("alpha", LoadParams::default()).await.is_err());

        assert!(manager.load_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_catalog_reports_loaded_flag() {
        let (manager, _dir, _runtime) =
            manager_with(ScriptedRuntime::new(&[]), &["alpha", "beta"]).await;
        manager.load("beta", LoadParams::default()).await.unwrap();

        let catalog = manager.catalog().await;
        assert_eq!(catalog.len(), 2);
        assert!(!catalog[0].loaded);
        assert!(catalog[1].loaded);

        let rescanned = manager.refresh_catalog().await;
        assert!(rescanned[1].loaded);

        assert!(manager.unload("beta").await);
        assert!(manager.catalog().await.iter().all(|d| !d.loaded));
        assert!(manager.refresh_catalog().await.iter().all(|d| !d.loaded));
    }

    #[tokio::test]
    async fn test_refresh_catalog_picks_up_new_files() {
        let (manager, dir, _runtime) = manager_with(ScriptedRuntime::new(&[]), &[]).await;
        assert!(manager.catalog().await.is_empty());

        std::fs::write(dir.path().join("fresh.gguf"), b"GGUF").unwrap();
        let catalog = manager.refresh_catalog().await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "fresh");
    }
}
