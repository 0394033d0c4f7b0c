// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Canary-style rollout of StatefulSet template changes.
//!
//! The clustering reconciler pins a StatefulSet's rolling-update partition
//! to `replicas` whenever it changes the pod template, so Kubernetes itself
//! restarts nothing. This controller then walks the partition down one
//! ordinal at a time, each step gated on the whole fleet being settled: the
//! pod about to restart must be the only one in flux, every other pod must
//! have been ready for a minimum window, and the cluster as a whole must be
//! healthy (with one exception: an unhealthy pod that is itself the next
//! restart target does not block, since restarting it may be the cure).
//!
//! The partition only ever moves down. Rolling back a bad template is a
//! user-initiated re-apply, which resets the partition to `replicas` and
//! starts a fresh walk.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::EventType;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use silo_cluster_resources::crd::mysqlcluster::v1alpha1::{
    MySqlCluster, CLUSTER_LABEL, COMPONENT_LABEL, FORCE_ROLLING_UPDATE_ANNOTATION,
    MYSQL_COMPONENT, RESOURCE_PREFIX,
};

use crate::k8s::{get_resource, publish_event};
use crate::metrics::Metrics;
use crate::Error;

const REVISION_LABEL: &str = "controller-revision-hash";

#[derive(clap::Parser)]
pub struct Args {
    /// Minimum spacing between two partition decrements of one
    /// StatefulSet.
    #[clap(long, default_value = "30")]
    partition_update_interval_secs: u64,
    /// How long a pod must have been ready before it counts as available.
    #[clap(long, default_value = "10")]
    pod_min_ready_secs: u64,
    #[clap(long, default_value = "15")]
    rollout_requeue_secs: u64,
}

pub struct Context {
    client: Client,
    metrics: Arc<Metrics>,
    limiter: RateLimiter,
    min_ready: Duration,
    requeue: Duration,
}

/// Watches StatefulSets (and their pods) carrying the cluster labels and
/// drives their partitions down. Runs until shutdown.
pub async fn run(client: Client, args: Args, metrics: Arc<Metrics>) {
    let context = Arc::new(Context {
        client: client.clone(),
        metrics,
        limiter: RateLimiter::new(Duration::from_secs(args.partition_update_interval_secs)),
        min_ready: Duration::from_secs(args.pod_min_ready_secs),
        requeue: Duration::from_secs(args.rollout_requeue_secs),
    });
    let selector = format!("{CLUSTER_LABEL},{COMPONENT_LABEL}={MYSQL_COMPONENT}");
    let sts_api = Api::<StatefulSet>::all(client.clone());
    let pod_api = Api::<Pod>::all(client);
    Controller::new(sts_api, watcher::Config::default().labels(&selector))
        .owns(pod_api, watcher::Config::default().labels(&selector))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(statefulset = %object.name, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;
}

async fn reconcile(sts: Arc<StatefulSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = sts.name_unchecked();
    let Some(namespace) = sts.namespace() else {
        return Ok(Action::await_change());
    };
    // the label selector alone can match objects we do not manage
    let Some(cluster_name) = name.strip_prefix(RESOURCE_PREFIX).and_then(|rest| rest.strip_prefix('-')) else {
        return Ok(Action::await_change());
    };

    if let Some(remaining) = ctx.limiter.check(&name) {
        ctx.metrics
            .partition_update_retries
            .with_label_values(&[cluster_name])
            .inc();
        return Ok(Action::requeue(remaining));
    }

    if sts.metadata.deletion_timestamp.is_some() {
        ctx.limiter.forget(&name);
        return Ok(Action::await_change());
    }

    let Some(owner) = sts
        .owner_references()
        .iter()
        .find(|reference| reference.kind == MySqlCluster::kind(&()))
    else {
        return Ok(Action::await_change());
    };
    let cluster_api: Api<MySqlCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(cluster) = get_resource(&cluster_api, &owner.name).await? else {
        return Ok(Action::await_change());
    };
    let cluster_name = cluster.name_unchecked();

    let status = sts.status.clone().unwrap_or_default();
    ctx.metrics
        .statefulset_replicas
        .with_label_values(&[&cluster_name])
        .set(status.replicas.into());
    ctx.metrics
        .statefulset_updated_replicas
        .with_label_values(&[&cluster_name])
        .set(status.updated_replicas.unwrap_or(0).into());

    let pod_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let selector = format!("{CLUSTER_LABEL}={cluster_name},{COMPONENT_LABEL}={MYSQL_COMPONENT}");
    let pods = pod_api
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    match evaluate(&cluster, &sts, &pods, ctx.min_ready, Utc::now()) {
        RolloutStep::NotInEffect => Ok(Action::await_change()),
        RolloutStep::Complete => {
            ctx.limiter.forget(&name);
            Ok(Action::await_change())
        }
        RolloutStep::Hold(reason) => {
            debug!(statefulset = %name, %reason, "rollout is not ready to advance");
            Ok(Action::requeue(ctx.requeue))
        }
        RolloutStep::Advance { from, to } => {
            let patch = serde_json::json!({
                "spec": {
                    "updateStrategy": {
                        "rollingUpdate": {
                            "partition": to,
                        }
                    }
                }
            });
            let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
            sts_api
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            ctx.limiter.mark(&name);
            ctx.metrics
                .last_partition_update
                .with_label_values(&[&cluster_name])
                .set(Utc::now().timestamp());
            publish_event(
                ctx.client.clone(),
                &cluster,
                EventType::Normal,
                "PartitionUpdate",
                "advance-partition",
                format!("advanced the rolling-update partition of {name} from {from} to {to}"),
            )
            .await?;
            info!(statefulset = %name, from, to, "advanced rolling-update partition");
            Ok(Action::requeue(ctx.requeue))
        }
    }
}

fn error_policy(_sts: Arc<StatefulSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "statefulset reconcile failed; requeueing");
    Action::requeue(Duration::from_secs(60))
}

enum RolloutStep {
    /// Partitioned rollout is not in effect for this StatefulSet.
    NotInEffect,
    /// Every replica already runs the updated revision.
    Complete,
    /// Advancing is not safe yet, for the contained reason.
    Hold(String),
    /// Decrement the partition cursor.
    Advance { from: i32, to: i32 },
}

/// Decides what one reconcile pass should do to the partition. Pure so the
/// gate order is testable without an apiserver.
fn evaluate(
    cluster: &MySqlCluster,
    sts: &StatefulSet,
    pods: &[Pod],
    min_ready: Duration,
    now: DateTime<Utc>,
) -> RolloutStep {
    let spec = sts.spec.clone().unwrap_or_default();
    let status = sts.status.clone().unwrap_or_default();

    // never race an in-flight template change: both the cluster and the
    // StatefulSet must have caught up with their own specs first
    if cluster.status().reconciled_generation != cluster.meta().generation {
        return RolloutStep::Hold("the cluster's latest generation is not reconciled yet".into());
    }
    if sts.metadata.generation != status.observed_generation {
        return RolloutStep::Hold(
            "the StatefulSet has not observed its latest generation".into(),
        );
    }

    if sts
        .annotations()
        .contains_key(FORCE_ROLLING_UPDATE_ANNOTATION)
    {
        return RolloutStep::NotInEffect;
    }
    let Some(partition) = spec
        .update_strategy
        .as_ref()
        .and_then(|strategy| strategy.rolling_update.as_ref())
        .and_then(|rolling| rolling.partition)
    else {
        return RolloutStep::NotInEffect;
    };
    if partition == 0 {
        return RolloutStep::Complete;
    }

    let desired = spec.replicas.unwrap_or(1);
    if status.updated_replicas.unwrap_or(0) == desired {
        return RolloutStep::Complete;
    }

    let sts_name = sts.name_unchecked();
    let mut members: Vec<(i32, &Pod)> = pods
        .iter()
        .filter_map(|pod| pod_ordinal(&sts_name, pod).map(|ordinal| (ordinal, pod)))
        .collect();
    members.sort_by_key(|(ordinal, _)| *ordinal);
    if members.len() as i32 != desired {
        return RolloutStep::Hold(format!(
            "{} pods exist but {desired} are desired; a scaling operation is in progress",
            members.len()
        ));
    }

    let Some(update_revision) = status.update_revision.as_deref() else {
        return RolloutStep::Hold("the StatefulSet has not published an update revision".into());
    };

    let from = partition;
    let to = from - 1;
    let Some((_, next)) = members.iter().find(|(ordinal, _)| *ordinal == to) else {
        return RolloutStep::Hold(format!("pod with ordinal {to} does not exist"));
    };

    // the cursor can trail the actual state, e.g. after a crash between
    // the pod flipping and our patch; nothing is restarted by catching up
    if pod_revision(next) == Some(update_revision) {
        return RolloutStep::Advance { from, to };
    }

    if !cluster.is_healthy() && pod_is_ready(next) {
        return RolloutStep::Hold(
            "the cluster is unhealthy; not restarting another pod".into(),
        );
    }

    for (ordinal, pod) in &members {
        if *ordinal == to {
            continue;
        }
        if !pod_available(pod, min_ready, now) {
            return RolloutStep::Hold(format!(
                "pod {} has not been ready for {}s yet",
                pod.name_unchecked(),
                min_ready.as_secs()
            ));
        }
        if !all_containers_ready(pod) {
            return RolloutStep::Hold(format!(
                "pod {} has containers that are not ready",
                pod.name_unchecked()
            ));
        }
    }

    RolloutStep::Advance { from, to }
}

fn pod_ordinal(sts_name: &str, pod: &Pod) -> Option<i32> {
    let name = pod.name_unchecked();
    name.strip_prefix(sts_name)?.strip_prefix('-')?.parse().ok()
}

fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()?
        .get(REVISION_LABEL)
        .map(String::as_str)
}

fn ready_condition(pod: &Pod) -> Option<&PodCondition> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|condition| condition.type_ == "Ready")
}

fn pod_is_ready(pod: &Pod) -> bool {
    ready_condition(pod).is_some_and(|condition| condition.status == "True")
}

fn pod_available(pod: &Pod, min_ready: Duration, now: DateTime<Utc>) -> bool {
    let Some(condition) = ready_condition(pod) else {
        return false;
    };
    if condition.status != "True" {
        return false;
    }
    match &condition.last_transition_time {
        Some(transition) => {
            now.signed_duration_since(transition.0).num_seconds() >= min_ready.as_secs() as i64
        }
        None => false,
    }
}

fn all_containers_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .is_some_and(|statuses| statuses.iter().all(|status| status.ready))
}

/// Spaces out partition decrements per StatefulSet. A slot opens `interval`
/// after the previous decrement was recorded.
struct RateLimiter {
    interval: Duration,
    marks: Mutex<BTreeMap<String, Instant>>,
}

impl RateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            marks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Time until the next decrement is allowed, if any.
    fn check(&self, name: &str) -> Option<Duration> {
        let marks = self.marks.lock().unwrap();
        let mark = marks.get(name)?;
        self.interval.checked_sub(mark.elapsed())
    }

    fn mark(&self, name: &str) {
        self.marks
            .lock()
            .unwrap()
            .insert(name.to_owned(), Instant::now());
    }

    fn forget(&self, name: &str) {
        self.marks.lock().unwrap().remove(name);
    }
}
