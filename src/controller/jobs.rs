//! Image Jobs: construction, inspection and the execution substrate
//!
//! One Job carries every image of a single (node, action) bucket. Pull Jobs
//! run one container per image pinned to the node, which makes the kubelet
//! fetch the image. The containers exit immediately by running a static
//! `echo` that an init container copies into a shared `emptyDir`, so images
//! without a shell (distroless, scratch) still complete. Purge Jobs run
//! `crictl rmi` against the node's container runtime socket.
//!
//! Jobs are found again by label (owner UID plus the managed-by marker); the
//! node and image list travel as annotations because label values cannot
//! hold them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::config::ControllerConfig;
use crate::crd::{ImageAction, ImageCache};
use crate::Error;

/// Label marking objects managed by this controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "fledge";
/// Label holding the owning ImageCache's UID
pub const CACHE_UID_LABEL: &str = "fledge.dev/image-cache-uid";
/// Label holding the Job's action (`pull` or `purge`)
pub const ACTION_LABEL: &str = "fledge.dev/action";
/// Annotation holding the target node name
pub const NODE_ANNOTATION: &str = "fledge.dev/node";
/// Annotation holding the JSON array of images the Job handles
pub const IMAGES_ANNOTATION: &str = "fledge.dev/images";

/// Backstop TTL for finished Jobs the controller never got to delete
const FINISHED_JOB_TTL_SECONDS: i32 = 3600;
/// Job condition reason Kubernetes sets when activeDeadlineSeconds is hit
const DEADLINE_EXCEEDED_REASON: &str = "DeadlineExceeded";
/// Longest cache-name fragment kept in a generated Job name
const MAX_NAME_FRAGMENT: usize = 30;
/// Hex characters of the node hash kept in a generated Job name
const NAME_HASH_LEN: usize = 16;
/// Volume shared between the echo installer and the pull containers
const ECHO_VOLUME: &str = "fledge-bin";
/// Where the echo installer leaves its binary
const ECHO_MOUNT_PATH: &str = "/fledge-bin";

/// The ImageCache a Job is created on behalf of
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOwner {
    /// Namespace the Jobs are created in
    pub namespace: String,
    /// ImageCache name
    pub name: String,
    /// ImageCache UID (owner reference and selection label)
    pub uid: String,
}

impl JobOwner {
    /// Extract owner identity from a stored ImageCache
    pub fn from_cache(cache: &ImageCache) -> Result<Self, Error> {
        let namespace = cache
            .namespace()
            .ok_or_else(|| Error::internal("ImageCache has no namespace"))?;
        let uid = cache
            .uid()
            .ok_or_else(|| Error::internal("ImageCache has no uid"))?;
        Ok(Self {
            namespace,
            name: cache.name_any(),
            uid,
        })
    }
}

/// Observed outcome of a Job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobPhase {
    /// Still running (or not yet scheduled)
    Running,
    /// Completed successfully
    Succeeded,
    /// Ran and failed
    Failed {
        /// Failure detail from the Job condition
        message: String,
    },
    /// Killed for exceeding its deadline
    TimedOut,
}

impl JobPhase {
    /// Whether the Job has finished either way
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// What the controller knows about one of its Jobs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    /// Job name
    pub name: String,
    /// Job UID
    pub uid: String,
    /// Node the Job is pinned to
    pub node: String,
    /// Pull or purge
    pub action: ImageAction,
    /// Images the Job handles
    pub images: Vec<String>,
    /// Observed outcome
    pub phase: JobPhase,
}

impl JobRecord {
    /// Read a record back from a Job built by [`build_job`].
    ///
    /// Returns `None` for Jobs missing the controller's labels or annotations.
    pub fn from_job(job: &Job) -> Option<Self> {
        let action = ImageAction::from_label(job.labels().get(ACTION_LABEL)?)?;
        let annotations = job.annotations();
        let node = annotations.get(NODE_ANNOTATION)?.clone();
        let images: Vec<String> =
            serde_json::from_str(annotations.get(IMAGES_ANNOTATION)?).ok()?;

        Some(Self {
            name: job.metadata.name.clone()?,
            uid: job.metadata.uid.clone()?,
            node,
            action,
            images,
            phase: job_phase(job),
        })
    }

    /// The error this Job's failure maps to, if it failed
    pub fn failure(&self) -> Option<Error> {
        match &self.phase {
            JobPhase::Failed { message } => Some(Error::JobExecution {
                job: self.name.clone(),
                message: message.clone(),
            }),
            JobPhase::TimedOut => Some(Error::JobTimeout {
                job: self.name.clone(),
            }),
            JobPhase::Running | JobPhase::Succeeded => None,
        }
    }
}

/// Creates, lists and deletes image Jobs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobSubstrate: Send + Sync {
    /// List every Job owned by the ImageCache with `owner_uid` in `namespace`
    async fn list(&self, namespace: &str, owner_uid: &str) -> Result<Vec<JobRecord>, Error>;

    /// Submit a Job and return its record (with the server-assigned name and UID)
    async fn create(&self, job: Job) -> Result<JobRecord, Error>;

    /// Delete a Job; deleting a Job that is already gone succeeds
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Job substrate backed by the Kubernetes batch API
pub struct KubeJobSubstrate {
    client: Client,
}

impl KubeJobSubstrate {
    /// Create a substrate over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobSubstrate for KubeJobSubstrate {
    async fn list(&self, namespace: &str, owner_uid: &str) -> Result<Vec<JobRecord>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!(
            "{}={},{}={}",
            MANAGED_BY_LABEL, MANAGED_BY_VALUE, CACHE_UID_LABEL, owner_uid
        );
        let jobs = api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| Error::substrate(format!("listing jobs: {}", e)))?;

        Ok(jobs.items.iter().filter_map(JobRecord::from_job).collect())
    }

    async fn create(&self, job: Job) -> Result<JobRecord, Error> {
        let namespace = job
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::internal("job has no namespace"))?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        let created = api
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| Error::substrate(format!("creating job: {}", e)))?;

        JobRecord::from_job(&created)
            .ok_or_else(|| Error::internal("created job is missing fledge metadata"))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(job = %name, "deleted job");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::substrate(format!("deleting job {}: {}", name, e))),
        }
    }
}

/// Hex SHA-256 of `input`, truncated to `len` characters
fn short_digest(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex: String = digest.iter().map(|byte| format!("{:02x}", byte)).collect();
    hex.truncate(len);
    hex
}

/// Name prefix for a bucket's Jobs; the API server appends a random suffix.
///
/// `<cache>-<action>-<sha256 of namespace/cache/node>-`, short enough that the
/// generated name stays a valid 63-character label value.
pub fn job_name_prefix(owner: &JobOwner, node: &str, action: ImageAction) -> String {
    let hash = short_digest(
        &format!("{}/{}/{}", owner.namespace, owner.name, node),
        NAME_HASH_LEN,
    );
    let mut fragment: String = owner.name.chars().take(MAX_NAME_FRAGMENT).collect();
    while fragment.ends_with(|c| c == '-' || c == '.') {
        fragment.pop();
    }
    format!("{}-{}-{}-", fragment, action, hash)
}

/// Pull policy for an image: untagged and `latest` images are always refreshed
pub fn pull_policy(image: &str) -> &'static str {
    if image.contains('@') {
        return "IfNotPresent";
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.split_once(':') {
        Some((_, "latest")) | None => "Always",
        Some(_) => "IfNotPresent",
    }
}

fn echo_mount() -> VolumeMount {
    VolumeMount {
        name: ECHO_VOLUME.to_string(),
        mount_path: ECHO_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

/// Init container, one container per image, and the volume they share
fn pull_containers(
    images: &[String],
    config: &ControllerConfig,
) -> (Container, Vec<Container>, Volume) {
    let installer = Container {
        name: "echo-installer".to_string(),
        image: Some(config.busybox_image.clone()),
        command: Some(vec![
            "cp".to_string(),
            "/bin/echo".to_string(),
            format!("{}/echo", ECHO_MOUNT_PATH),
        ]),
        volume_mounts: Some(vec![echo_mount()]),
        ..Default::default()
    };

    let containers = images
        .iter()
        .enumerate()
        .map(|(i, image)| Container {
            name: format!("image-{}", i),
            image: Some(image.clone()),
            image_pull_policy: Some(pull_policy(image).to_string()),
            command: Some(vec![
                format!("{}/echo", ECHO_MOUNT_PATH),
                "Image pulled successfully!".to_string(),
            ]),
            volume_mounts: Some(vec![echo_mount()]),
            ..Default::default()
        })
        .collect();

    let volume = Volume {
        name: ECHO_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };

    (installer, containers, volume)
}

fn purge_container(images: &[String], config: &ControllerConfig) -> (Container, Volume) {
    let mut command = vec!["crictl".to_string(), "rmi".to_string()];
    command.extend(images.iter().cloned());

    let container = Container {
        name: "image-manager".to_string(),
        image: Some(config.image_manager_image.clone()),
        command: Some(command),
        env: Some(vec![EnvVar {
            name: "CONTAINER_RUNTIME_ENDPOINT".to_string(),
            value: Some(format!("unix://{}", config.cri_socket_path)),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: "cri-socket".to_string(),
            mount_path: config.cri_socket_path.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let volume = Volume {
        name: "cri-socket".to_string(),
        host_path: Some(HostPathVolumeSource {
            path: config.cri_socket_path.clone(),
            type_: Some("Socket".to_string()),
        }),
        ..Default::default()
    };

    (container, volume)
}

/// Build the Job for one (node, action) bucket.
///
/// The Job:
/// - Is pinned to `node` via `nodeName` and tolerates every taint
/// - Never restarts or retries (`backoffLimit: 0`); retries are the
///   controller's decision
/// - Is killed after the configured deadline
/// - Is owned by the ImageCache so it is garbage collected with it
pub fn build_job(
    owner: &JobOwner,
    node: &str,
    action: ImageAction,
    images: &[String],
    config: &ControllerConfig,
) -> Result<Job, Error> {
    let images_json =
        serde_json::to_string(images).map_err(|e| Error::serialization(e.to_string()))?;

    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (CACHE_UID_LABEL.to_string(), owner.uid.clone()),
        (ACTION_LABEL.to_string(), action.as_str().to_string()),
    ]);
    let annotations = BTreeMap::from([
        (NODE_ANNOTATION.to_string(), node.to_string()),
        (IMAGES_ANNOTATION.to_string(), images_json),
    ]);

    let (init_containers, containers, volumes) = match action {
        ImageAction::Pull => {
            let (installer, containers, volume) = pull_containers(images, config);
            (Some(vec![installer]), containers, vec![volume])
        }
        ImageAction::Purge => {
            let (container, volume) = purge_container(images, config);
            (None, vec![container], vec![volume])
        }
    };

    Ok(Job {
        metadata: ObjectMeta {
            generate_name: Some(job_name_prefix(owner, node, action)),
            namespace: Some(owner.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            owner_references: Some(vec![OwnerReference {
                api_version: "fledge.dev/v1alpha1".to_string(),
                kind: "ImageCache".to_string(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(config.job_deadline.as_secs() as i64),
            ttl_seconds_after_finished: Some(FINISHED_JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_name: Some(node.to_string()),
                    init_containers,
                    containers,
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Check if a Job has completed successfully
pub fn is_job_complete(job: &Job) -> bool {
    has_true_condition(job, "Complete")
}

/// Check if a Job has failed
pub fn is_job_failed(job: &Job) -> bool {
    has_true_condition(job, "Failed")
}

fn has_true_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
        .unwrap_or(false)
}

/// Classify a Job from its conditions
pub fn job_phase(job: &Job) -> JobPhase {
    if is_job_complete(job) {
        return JobPhase::Succeeded;
    }
    if !is_job_failed(job) {
        return JobPhase::Running;
    }

    let failed = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
        });

    match failed {
        Some(c) if c.reason.as_deref() == Some(DEADLINE_EXCEEDED_REASON) => JobPhase::TimedOut,
        Some(c) => JobPhase::Failed {
            message: c
                .message
                .clone()
                .or_else(|| c.reason.clone())
                .unwrap_or_else(|| "job failed".to_string()),
        },
        None => JobPhase::Failed {
            message: "job failed".to_string(),
        },
    }
}
