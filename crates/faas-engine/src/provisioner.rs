//! Runtime image provisioning.
//!
//! Each (language, backend) pair needs its image before any container of
//! that pair can start. Builds are single-flight: concurrent callers for the
//! same pair await one shared build, and the build itself runs in a spawned
//! task so it completes even if every waiter goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use sandbox::{Backend, Language, PoolKey, SandboxFactory};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{EngineError, EngineResult};

type SharedBuild = Shared<BoxFuture<'static, Result<(), String>>>;

#[derive(Clone)]
enum ImageState {
    Building(SharedBuild),
    Ready,
    Failed(String),
}

/// Outcome of provisioning every enabled pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImageReport {
    pub ready: Vec<PoolKey>,
    pub failed: Vec<FailedImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedImage {
    pub key: PoolKey,
    pub reason: String,
}

impl ImageReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// `Err` naming the first failed pair, if any.
    pub fn into_result(self) -> EngineResult<()> {
        match self.failed.into_iter().next() {
            None => Ok(()),
            Some(FailedImage { key, reason }) => Err(EngineError::ImageBuild { key, reason }),
        }
    }
}

pub struct ImageProvisioner {
    factories: HashMap<Backend, Arc<dyn SandboxFactory>>,
    languages: Vec<Language>,
    states: Mutex<HashMap<PoolKey, ImageState>>,
}

impl ImageProvisioner {
    pub fn new(factories: HashMap<Backend, Arc<dyn SandboxFactory>>, languages: Vec<Language>) -> Self {
        Self {
            factories,
            languages,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Every pair this provisioner serves, in stable order.
    pub fn keys(&self) -> Vec<PoolKey> {
        PoolKey::all()
            .filter(|k| self.languages.contains(&k.language) && self.factories.contains_key(&k.backend))
            .collect()
    }

    pub fn is_ready(&self, key: PoolKey) -> bool {
        matches!(self.lock().get(&key), Some(ImageState::Ready))
    }

    /// Make sure the image for `key` exists, building it at most once.
    ///
    /// A pair whose build failed stays refused (the cached error is
    /// returned) until [`ensure_images`](Self::ensure_images) retries it.
    pub async fn ensure(&self, key: PoolKey) -> EngineResult<()> {
        self.provision(key, false).await
    }

    /// Provision every pair, retrying previously failed ones.
    pub async fn ensure_images(&self) -> ImageReport {
        let keys = self.keys();
        let results = join_all(keys.iter().map(|&key| self.provision(key, true))).await;

        let mut report = ImageReport::default();
        for (key, result) in keys.into_iter().zip(results) {
            match result {
                Ok(()) => report.ready.push(key),
                Err(EngineError::ImageBuild { reason, .. }) => {
                    report.failed.push(FailedImage { key, reason })
                }
                Err(e) => report.failed.push(FailedImage {
                    key,
                    reason: e.to_string(),
                }),
            }
        }
        report
    }

    async fn provision(&self, key: PoolKey, retry_failed: bool) -> EngineResult<()> {
        let build = {
            let mut states = self.lock();
            match states.get(&key).cloned() {
                Some(ImageState::Ready) => return Ok(()),
                Some(ImageState::Failed(reason)) if !retry_failed => {
                    return Err(EngineError::ImageBuild { key, reason });
                }
                Some(ImageState::Building(build)) => build,
                Some(ImageState::Failed(_)) | None => {
                    let factory = self
                        .factories
                        .get(&key.backend)
                        .cloned()
                        .ok_or(EngineError::BackendDisabled(key.backend))?;
                    if !self.languages.contains(&key.language) {
                        return Err(EngineError::Config(format!("language {} is not enabled", key.language)));
                    }
                    let build = spawn_build(factory, key);
                    states.insert(key, ImageState::Building(build.clone()));
                    build
                }
            }
        };

        let result = build.clone().await;

        // Only the build that is still current may settle the state.
        let mut states = self.lock();
        if let Some(ImageState::Building(current)) = states.get(&key)
            && current.ptr_eq(&build)
        {
            let settled = match &result {
                Ok(()) => ImageState::Ready,
                Err(reason) => ImageState::Failed(reason.clone()),
            };
            states.insert(key, settled);
        }
        result.map_err(|reason| EngineError::ImageBuild { key, reason })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PoolKey, ImageState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn spawn_build(factory: Arc<dyn SandboxFactory>, key: PoolKey) -> SharedBuild {
    let task = tokio::spawn(async move { check_or_build(factory.as_ref(), key).await });
    async move {
        match task.await {
            Ok(result) => result,
            Err(e) => Err(format!("build task failed: {e}")),
        }
    }
    .boxed()
    .shared()
}

async fn check_or_build(factory: &dyn SandboxFactory, key: PoolKey) -> Result<(), String> {
    match factory.image_exists(key.language).await {
        Ok(true) => {
            debug!(key = %key, "runtime image present");
            return Ok(());
        }
        Ok(false) => info!(key = %key, "runtime image missing, building"),
        Err(e) => return Err(e.to_string()),
    }
    match factory.build_image(key.language).await {
        Ok(()) => {
            info!(key = %key, "runtime image ready");
            Ok(())
        }
        Err(e) => {
            error!(key = %key, error = %e, "runtime image build failed");
            Err(e.to_string())
        }
    }
}
