//! Load admission and request routing.
//!
//! Admission is strictly serialized by a one-permit semaphore held across
//! the whole load, including the slow `Engine::load` call, so eviction
//! decisions always see a settled instance list. The instance list mutex
//! is never held across slow work: inference checks out an instance under
//! the lock, marks it busy, and releases the lock before forwarding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};

use lmn_domain::config::LimitsConfig;
use lmn_domain::model::{ModelEntry, ModelType, Recipe};
use lmn_domain::options::RecipeOptions;
use lmn_domain::{Error, Result};
use lmn_engines::adapter::supports;
use lmn_engines::{ByteStream, Engine, LoadContext, Operation};

use crate::instance::{BusyGuard, EngineInstance, InstanceStats};

/// Builds one adapter per admitted load. The gateway wires this to the
/// real engine factory; tests substitute fakes.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, entry: &ModelEntry) -> Result<Box<dyn Engine>>;
}

/// Message substrings that identify a missing-file load failure. These
/// bypass the nuclear retry: retrying cannot conjure the file. The list
/// is deliberately literal.
const FILE_NOT_FOUND_MARKERS: &[&str] = &["No such file", "file not found"];

pub struct Scheduler {
    instances: Mutex<Vec<Arc<EngineInstance>>>,
    /// One permit: at most one load admitted at a time. Waiters queue in
    /// arbitrary order.
    load_gate: Arc<Semaphore>,
    limits: LimitsConfig,
    /// Server-wide default options per recipe, lowest merge precedence.
    defaults: HashMap<Recipe, RecipeOptions>,
    factory: Arc<dyn AdapterFactory>,
}

impl Scheduler {
    pub fn new(
        limits: LimitsConfig,
        defaults: HashMap<Recipe, RecipeOptions>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            instances: Mutex::new(Vec::new()),
            load_gate: Arc::new(Semaphore::new(1)),
            limits,
            defaults,
            factory,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Load / unload
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Idempotent load admission. See the module docs for the locking
    /// discipline; the semantics are:
    /// already loaded → touch and return; NPU exclusivity eviction;
    /// per-type LRU eviction; adapter load outside the list lock; on
    /// generic failure evict everything and retry exactly once.
    pub async fn load(
        &self,
        name: &str,
        entry: &ModelEntry,
        options: RecipeOptions,
        do_not_upgrade: bool,
    ) -> Result<()> {
        let effective = options
            .sanitize(entry.recipe)
            .merged_over(&entry.recipe_options)
            .merged_over(self.defaults.get(&entry.recipe).unwrap_or(&RecipeOptions::default()));

        let _admission = self
            .load_gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Engine("scheduler is shutting down".into()))?;

        if let Some(existing) = self.find(name).await {
            existing.touch();
            tracing::debug!(model = name, "already loaded, refreshed last access");
            return Ok(());
        }

        // NPU exclusivity is unconditional: an incoming NPU load evicts
        // whatever currently holds the NPU, regardless of type or LRU.
        if entry.device_class.has_npu() {
            let npu_holder = {
                let instances = self.instances.lock().await;
                instances
                    .iter()
                    .find(|i| i.device_class().has_npu())
                    .cloned()
            };
            if let Some(victim) = npu_holder {
                tracing::info!(
                    incoming = name,
                    evicting = victim.name(),
                    "NPU exclusivity eviction"
                );
                self.evict(&victim).await;
            }
        }

        // Per-type slot limit, oldest last_access first. A limit of zero
        // clears the type entirely before loading.
        let limit = self.limits.limit_for(entry.model_type);
        if limit >= 0 {
            loop {
                let victim = {
                    let instances = self.instances.lock().await;
                    let of_type: Vec<_> = instances
                        .iter()
                        .filter(|i| i.model_type() == entry.model_type)
                        .collect();
                    if of_type.is_empty() || (of_type.len() as i64) < limit {
                        None
                    } else {
                        of_type
                            .into_iter()
                            .min_by_key(|i| i.last_access())
                            .cloned()
                    }
                };
                match victim {
                    Some(victim) => {
                        tracing::info!(
                            incoming = name,
                            evicting = victim.name(),
                            model_type = %entry.model_type,
                            "slot limit eviction"
                        );
                        self.evict(&victim).await;
                    }
                    None => break,
                }
            }
        }

        match self.load_once(name, entry, &effective, do_not_upgrade).await {
            Ok(()) => Ok(()),
            Err(e) if is_file_not_found(&e) => Err(e),
            Err(Error::ModelInvalidated(msg)) => Err(Error::ModelInvalidated(msg)),
            // Adapter construction failures (unsupported host) are not the
            // other instances' fault.
            Err(e @ Error::ModelNotSupported { .. }) => Err(e),
            Err(first) => {
                // Nuclear policy: a generic load failure may mean the
                // device is wedged by some other instance. Clear the deck
                // and retry exactly once.
                tracing::warn!(
                    model = name,
                    error = %first,
                    "load failed, evicting all instances and retrying once"
                );
                self.evict_all().await;
                self.load_once(name, entry, &effective, do_not_upgrade)
                    .await
                    .map_err(|second| match second {
                        Error::ModelLoadError(msg) => Error::ModelLoadError(msg),
                        other => Error::ModelLoadError(other.to_string()),
                    })
            }
        }
    }

    async fn load_once(
        &self,
        name: &str,
        entry: &ModelEntry,
        options: &RecipeOptions,
        do_not_upgrade: bool,
    ) -> Result<()> {
        let engine = self.factory.create(entry)?;
        let instance = Arc::new(EngineInstance::new(entry, options.clone(), engine));
        let ctx = LoadContext {
            model_name: name.to_string(),
            entry: entry.clone(),
            options: options.clone(),
            do_not_upgrade,
        };

        instance.touch();
        let started = Instant::now();
        instance.engine().load(&ctx).await?;
        instance.touch();

        tracing::info!(
            model = name,
            recipe = %entry.recipe,
            device = %entry.device_class,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );
        self.instances.lock().await.push(instance);
        Ok(())
    }

    /// Unload by name; an empty name unloads everything. Unknown names
    /// raise `ModelNotLoaded`.
    pub async fn unload(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            self.evict_all().await;
            return Ok(());
        }
        let instance = self
            .find(name)
            .await
            .ok_or_else(|| Error::ModelNotLoaded(name.to_string()))?;
        self.evict(&instance).await;
        Ok(())
    }

    async fn find(&self, name: &str) -> Option<Arc<EngineInstance>> {
        self.instances
            .lock()
            .await
            .iter()
            .find(|i| i.name() == name)
            .cloned()
    }

    /// Unload every instance in sequence (shutdown path).
    pub async fn evict_all(&self) {
        loop {
            let next = self.instances.lock().await.first().cloned();
            match next {
                Some(instance) => self.evict(&instance).await,
                None => break,
            }
        }
    }

    /// Remove from dispatch, wait for in-flight calls, tear down the
    /// subprocess. Unload errors are logged, never propagated.
    async fn evict(&self, instance: &Arc<EngineInstance>) {
        {
            let mut instances = self.instances.lock().await;
            instances.retain(|i| !Arc::ptr_eq(i, instance));
        }
        instance.wait_idle().await;
        if let Err(e) = instance.engine().unload().await {
            tracing::warn!(model = instance.name(), error = %e, "engine unload failed");
        }
        tracing::info!(model = instance.name(), "instance evicted");
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Dispatch
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Route a non-streaming JSON operation to the instance serving the
    /// request's `model`.
    pub async fn forward_json(&self, op: Operation, body: Value) -> Result<Value> {
        let model = required_model(&body)?;
        let (instance, _guard) = self.checkout(&model, op).await?;

        let started = Instant::now();
        let result = instance.engine().forward_json(op, body).await;
        instance.record_request(started.elapsed(), result.is_ok());
        instance.touch();
        result
    }

    /// Route a streaming operation. The busy guard rides inside the
    /// returned stream and releases when the stream is dropped or
    /// exhausted.
    pub async fn forward_stream(&self, op: Operation, body: Vec<u8>) -> Result<ByteStream> {
        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|e| Error::InvalidRequest(format!("request body is not JSON: {e}")))?;
        let model = required_model(&parsed)?;
        let (instance, guard) = self.checkout(&model, op).await?;

        let started = Instant::now();
        let inner = match instance.engine().forward_stream(op, body).await {
            Ok(stream) => stream,
            Err(e) => {
                instance.record_request(started.elapsed(), false);
                return Err(e);
            }
        };

        let wrapped = async_stream::stream! {
            let _guard = guard;
            let mut inner = inner;
            while let Some(item) = inner.next().await {
                yield item;
            }
            instance.record_request(started.elapsed(), true);
            instance.touch();
        };
        Ok(Box::pin(wrapped))
    }

    /// Route a staged audio transcription.
    pub async fn transcribe(
        &self,
        model: &str,
        audio: &std::path::Path,
        fields: &HashMap<String, String>,
    ) -> Result<Value> {
        let (instance, _guard) = self.checkout(model, Operation::AudioTranscriptions).await?;
        let started = Instant::now();
        let result = instance.engine().transcribe(audio, fields).await;
        instance.record_request(started.elapsed(), result.is_ok());
        instance.touch();
        result
    }

    /// Find the instance, verify the capability, mark it busy, and bump
    /// `last_access`, all under the list lock.
    async fn checkout(
        &self,
        model: &str,
        op: Operation,
    ) -> Result<(Arc<EngineInstance>, BusyGuard)> {
        let instances = self.instances.lock().await;
        let instance = instances
            .iter()
            .find(|i| i.name() == model)
            .cloned()
            .ok_or_else(|| Error::ModelNotLoaded(model.to_string()))?;

        if !supports(instance.engine(), op) {
            return Err(Error::UnsupportedOperation {
                op: op.name().to_string(),
                device: instance.device_class().to_string(),
            });
        }

        let guard = instance.begin_work();
        instance.touch();
        Ok((instance, guard))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Introspection
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Most recently used instance name, if any.
    pub async fn get_loaded_model(&self) -> Option<String> {
        let instances = self.instances.lock().await;
        instances
            .iter()
            .max_by_key(|i| i.last_access())
            .map(|i| i.name().to_string())
    }

    pub async fn get_all_loaded_models(&self) -> Vec<String> {
        let instances = self.instances.lock().await;
        instances.iter().map(|i| i.name().to_string()).collect()
    }

    /// Telemetry for the most recently used instance.
    pub async fn mru_stats(&self) -> Option<(String, InstanceStats, std::time::Duration)> {
        let instances = self.instances.lock().await;
        instances
            .iter()
            .max_by_key(|i| i.last_access())
            .map(|i| (i.name().to_string(), i.stats(), i.uptime()))
    }

    pub async fn count_of_type(&self, t: ModelType) -> usize {
        let instances = self.instances.lock().await;
        instances.iter().filter(|i| i.model_type() == t).count()
    }

    pub fn limits(&self) -> LimitsConfig {
        self.limits
    }
}

fn required_model(body: &Value) -> Result<String> {
    body.get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .ok_or_else(|| Error::InvalidRequest("the model field is required".into()))
}

fn is_file_not_found(error: &Error) -> bool {
    if matches!(error, Error::FileNotFound(_)) {
        return true;
    }
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    FILE_NOT_FOUND_MARKERS
        .iter()
        .any(|m| message.contains(m) || lower.contains(&m.to_ascii_lowercase()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
