//! In-memory cluster for end-to-end reconcile tests
//!
//! Implements all three collaborator traits over one shared state so a test
//! can apply a spec, run passes, and finish Jobs the way the kubelet would.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use crate::controller::jobs::{JobPhase, JobRecord, JobSubstrate, CACHE_UID_LABEL};
use crate::controller::nodes::{matches_selector, NodeDirectory, NodeInfo};
use crate::controller::reconcile::{ResourceKey, ResourceStore};
use crate::crd::{ImageCache, ImageCacheSpec, ImageCacheStatus};
use crate::Error;

#[derive(Default)]
struct State {
    caches: BTreeMap<ResourceKey, ImageCache>,
    nodes: BTreeMap<String, NodeInfo>,
    jobs: BTreeMap<String, Job>,
    created: usize,
    next_id: usize,
    fail_creates: bool,
    fail_deletes: bool,
}

/// Shared fake of the resource store, node directory and Job substrate
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_node(&self, name: &str, labels: &[(&str, &str)]) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state()
            .nodes
            .insert(name.to_string(), NodeInfo::new(name, labels));
    }

    pub fn remove_node(&self, name: &str) {
        self.state().nodes.remove(name);
    }

    /// Create or update an ImageCache, bumping generation on spec change
    pub fn apply(&self, key: &ResourceKey, spec: ImageCacheSpec) {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        match state.caches.get_mut(key) {
            Some(cache) => {
                if cache.spec != spec {
                    cache.spec = spec;
                    cache.metadata.generation = Some(cache.metadata.generation.unwrap_or(0) + 1);
                }
            }
            None => {
                let mut cache = ImageCache::new(&key.name, spec);
                cache.metadata.namespace = Some(key.namespace.clone());
                cache.metadata.uid = Some(format!("cache-uid-{}", id));
                cache.metadata.generation = Some(1);
                state.caches.insert(key.clone(), cache);
            }
        }
    }

    pub fn annotate(&self, key: &ResourceKey, name: &str, value: &str) {
        if let Some(cache) = self.state().caches.get_mut(key) {
            cache
                .annotations_mut()
                .insert(name.to_string(), value.to_string());
        }
    }

    /// Delete like the API server: finalizers hold the object with a deletion timestamp
    pub fn delete(&self, key: &ResourceKey) {
        let mut state = self.state();
        let held = state
            .caches
            .get(key)
            .map(|c| !c.finalizers().is_empty())
            .unwrap_or(false);
        if held {
            if let Some(cache) = state.caches.get_mut(key) {
                cache.metadata.deletion_timestamp = Some(Time(Utc::now()));
            }
        } else {
            state.caches.remove(key);
        }
    }

    pub fn cache(&self, key: &ResourceKey) -> Option<ImageCache> {
        self.state().caches.get(key).cloned()
    }

    pub fn status(&self, key: &ResourceKey) -> Option<ImageCacheStatus> {
        self.cache(key).and_then(|c| c.status)
    }

    pub fn has_finalizer(&self, key: &ResourceKey, finalizer: &str) -> bool {
        self.cache(key)
            .map(|c| c.finalizers().iter().any(|f| f == finalizer))
            .unwrap_or(false)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state().fail_creates = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state().fail_deletes = fail;
    }

    /// Every Job that currently exists
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.state()
            .jobs
            .values()
            .filter_map(JobRecord::from_job)
            .collect()
    }

    /// Jobs created over the cluster's lifetime
    pub fn jobs_created(&self) -> usize {
        self.state().created
    }

    /// Finish every running Job
    pub fn finish_all(&self, phase: JobPhase) {
        self.finish_matching(|_| true, phase);
    }

    /// Finish every running Job pinned to `node`
    pub fn finish_on(&self, node: &str, phase: JobPhase) {
        self.finish_matching(|record| record.node == node, phase);
    }

    fn finish_matching(&self, pred: impl Fn(&JobRecord) -> bool, phase: JobPhase) {
        let (type_, reason, message) = match &phase {
            JobPhase::Running => return,
            JobPhase::Succeeded => ("Complete", None, None),
            JobPhase::Failed { message } => (
                "Failed",
                Some("BackoffLimitExceeded".to_string()),
                Some(message.clone()),
            ),
            JobPhase::TimedOut => (
                "Failed",
                Some("DeadlineExceeded".to_string()),
                Some("Job was active longer than specified deadline".to_string()),
            ),
        };

        let mut state = self.state();
        for job in state.jobs.values_mut() {
            let running = JobRecord::from_job(job)
                .map(|r| r.phase == JobPhase::Running && pred(&r))
                .unwrap_or(false);
            if running {
                job.status = Some(JobStatus {
                    conditions: Some(vec![JobCondition {
                        type_: type_.to_string(),
                        status: "True".to_string(),
                        reason: reason.clone(),
                        message: message.clone(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
            }
        }
    }
}

#[async_trait]
impl NodeDirectory for FakeCluster {
    async fn list(&self, selector: &BTreeMap<String, String>) -> Result<Vec<NodeInfo>, Error> {
        Ok(self
            .state()
            .nodes
            .values()
            .filter(|n| matches_selector(selector, &n.labels))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobSubstrate for FakeCluster {
    async fn list(&self, namespace: &str, owner_uid: &str) -> Result<Vec<JobRecord>, Error> {
        Ok(self
            .state()
            .jobs
            .values()
            .filter(|job| {
                job.namespace().as_deref() == Some(namespace)
                    && job.labels().get(CACHE_UID_LABEL).map(String::as_str) == Some(owner_uid)
            })
            .filter_map(JobRecord::from_job)
            .collect())
    }

    async fn create(&self, mut job: Job) -> Result<JobRecord, Error> {
        let mut state = self.state();
        if state.fail_creates {
            return Err(Error::substrate("admission webhook denied the request"));
        }
        state.next_id += 1;
        state.created += 1;
        let id = state.next_id;
        let name = format!(
            "{}{:05}",
            job.metadata.generate_name.clone().unwrap_or_default(),
            id
        );
        job.metadata.name = Some(name.clone());
        job.metadata.uid = Some(format!("job-uid-{}", id));
        let record = JobRecord::from_job(&job)
            .ok_or_else(|| Error::internal("job missing fledge metadata"))?;
        state.jobs.insert(name, job);
        Ok(record)
    }

    async fn delete(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state();
        if state.fail_deletes {
            return Err(Error::substrate("etcdserver: request timed out"));
        }
        state.jobs.remove(name);
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for FakeCluster {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ImageCache>, Error> {
        Ok(self.cache(key))
    }

    async fn list(&self) -> Result<Vec<ResourceKey>, Error> {
        Ok(self.state().caches.keys().cloned().collect())
    }

    async fn patch_status(&self, key: &ResourceKey, status: &ImageCacheStatus) -> Result<(), Error> {
        match self.state().caches.get_mut(key) {
            Some(cache) => {
                cache.status = Some(status.clone());
                Ok(())
            }
            None => Err(Error::store(format!("{} not found", key))),
        }
    }

    async fn add_finalizer(&self, key: &ResourceKey, finalizer: &str) -> Result<(), Error> {
        if let Some(cache) = self.state().caches.get_mut(key) {
            let finalizers = cache.finalizers_mut();
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        }
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ResourceKey, finalizer: &str) -> Result<(), Error> {
        let mut state = self.state();
        let release = match state.caches.get_mut(key) {
            Some(cache) => {
                cache.finalizers_mut().retain(|f| f != finalizer);
                cache.finalizers().is_empty() && cache.metadata.deletion_timestamp.is_some()
            }
            None => false,
        };
        if release {
            state.caches.remove(key);
        }
        Ok(())
    }
}
