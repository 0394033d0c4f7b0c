// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reconciliation of `MySqlCluster` resources.
//!
//! Each apply pass makes sure the cluster's credential secrets exist and are
//! distributed, then hands control to the rotation coordinator, which owns
//! every mutation of the persisted rotation status. Pod topology, failover,
//! and StatefulSet templating belong to the clustering reconciler; this
//! controller only consumes the status it produces.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::instrument;

use silo_cluster_resources::crd::mysqlcluster::v1alpha1::{
    MySqlCluster, RotationPhase, RotationStatus,
};
use silo_mysql_util::{
    InstanceConfig, InstanceConnector, InstanceOps, MySqlError, MySqlInstance, SYSTEM_USERS,
};

use crate::k8s::{get_resource, publish_event};
use crate::metrics::Metrics;
use crate::secrets::{
    distribute_credentials, generate_credentials, ClusterSecrets, CredentialSecret, SecretStore,
};
use crate::Error;

mod rotation;

use rotation::RotationCoordinator;

#[derive(clap::Parser)]
pub struct Args {
    /// Port the managed MySQL instances serve on.
    #[clap(long, default_value = "3306")]
    mysql_port: u16,
    #[clap(long, default_value = "5")]
    mysql_connect_timeout_secs: u64,
    #[clap(long, default_value = "30")]
    mysql_statement_timeout_secs: u64,
    /// How long to wait before re-checking a rotation that is blocked on
    /// the fleet converging.
    #[clap(long, default_value = "30")]
    rotation_requeue_secs: u64,
}

pub struct Context {
    config: Args,
    metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(config: Args, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }

    fn connector(&self, cluster: &MySqlCluster) -> PodConnector {
        PodConnector {
            cluster: cluster.clone(),
            port: self.config.mysql_port,
            connect_timeout: Duration::from_secs(self.config.mysql_connect_timeout_secs),
            statement_timeout: Duration::from_secs(self.config.mysql_statement_timeout_secs),
        }
    }

    /// Fetches the authoritative credential set, generating it on the
    /// cluster's first reconcile.
    async fn ensure_system_users_secret(
        &self,
        handle: &KubeClusterHandle,
        secrets: &dyn SecretStore,
        cluster: &MySqlCluster,
    ) -> Result<CredentialSecret, Error> {
        let name = cluster.system_users_secret_name();
        if let Some(current) = secrets.get(&name).await? {
            return Ok(current);
        }
        let credentials = generate_credentials(None);
        secrets.apply(&name, &credentials).await?;
        handle
            .publish(
                EventType::Normal,
                "CredentialsInitialized",
                "provision-credentials",
                format!(
                    "generated initial passwords for the {} system users",
                    SYSTEM_USERS.len()
                ),
            )
            .await?;
        Ok(credentials)
    }

    /// Applies the consumer-facing secrets. Consumers follow the pending
    /// credential set only once every instance has confirmed it
    /// (`Phase=Rotated`); before that, a crash could still strand them on
    /// passwords no instance accepts.
    async fn sync_consumer_secrets(
        &self,
        secrets: &dyn SecretStore,
        cluster: &MySqlCluster,
        current: CredentialSecret,
    ) -> Result<(), Error> {
        let rotation = cluster.status().rotation;
        let mut source = current;
        if rotation.phase == RotationPhase::Rotated {
            if let Some(pending) = secrets
                .get(&cluster.pending_system_users_secret_name())
                .await?
            {
                if pending.rotation_id.as_deref() == Some(rotation.rotation_id.as_str()) {
                    source = pending;
                }
            }
        }
        distribute_credentials(secrets, cluster, &source, self.config.mysql_port).await
    }
}

#[async_trait]
impl k8s_controller::Context for Context {
    type Resource = MySqlCluster;
    type Error = Error;

    const FINALIZER_NAME: &'static str = "operatord.silo.dev/mysqlcluster";

    #[instrument(skip_all, fields(cluster = %cluster.name_unchecked()))]
    async fn apply(
        &self,
        client: Client,
        cluster: &Self::Resource,
    ) -> Result<Option<Action>, Self::Error> {
        let cluster_api: Api<MySqlCluster> = Api::namespaced(client.clone(), &cluster.namespace());

        // a brand new cluster gets a default status written first; the
        // resulting watch event brings us right back here
        if cluster.status.is_none() {
            let mut new_cluster = cluster.clone();
            new_cluster.status = Some(cluster.status());
            cluster_api
                .replace_status(
                    &cluster.name_unchecked(),
                    &PostParams::default(),
                    serde_json::to_vec(&new_cluster).unwrap(),
                )
                .await?;
            return Ok(None);
        }

        let handle = KubeClusterHandle::new(&client, cluster);
        let secrets = ClusterSecrets::new(&client, cluster);

        let current = self
            .ensure_system_users_secret(&handle, &secrets, cluster)
            .await?;
        self.sync_consumer_secrets(&secrets, cluster, current)
            .await?;

        let connector = self.connector(cluster);
        let coordinator = RotationCoordinator::new(
            cluster,
            &handle,
            &secrets,
            &connector,
            self.config.mysql_port,
            Duration::from_secs(self.config.rotation_requeue_secs),
        );
        let action = coordinator.reconcile().await?;

        self.metrics
            .rotation_in_progress
            .with_label_values(&[&cluster.name_unchecked()])
            .set(match handle.latest().status().rotation.phase {
                RotationPhase::Idle => 0,
                RotationPhase::Rotating | RotationPhase::Rotated => 1,
            });

        handle.persist_reconciled_generation().await?;

        Ok(action)
    }

    #[instrument(skip_all, fields(cluster = %cluster.name_unchecked()))]
    async fn cleanup(
        &self,
        _client: Client,
        cluster: &Self::Resource,
    ) -> Result<Option<Action>, Self::Error> {
        // owned secrets are garbage collected through their owner
        // references; only the in-process state needs dropping
        self.metrics.forget_cluster(&cluster.name_unchecked());

        Ok(None)
    }
}

/// The rotation coordinator's view of the cluster resource: persist status,
/// consume triggers, surface events, and inspect the backing StatefulSet.
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    async fn persist_rotation(&self, rotation: RotationStatus) -> Result<(), Error>;
    async fn remove_annotation(&self, key: &str) -> Result<(), Error>;
    async fn publish(
        &self,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) -> Result<(), Error>;
    async fn get_statefulset(&self) -> Result<Option<StatefulSet>, Error>;
}

/// [`ClusterHandle`] backed by the Kubernetes API. Every response replaces
/// the held copy of the cluster so successive status writes carry the
/// freshest resourceVersion.
pub struct KubeClusterHandle {
    client: Client,
    cluster_api: Api<MySqlCluster>,
    sts_api: Api<StatefulSet>,
    cluster: Mutex<MySqlCluster>,
}

impl KubeClusterHandle {
    pub fn new(client: &Client, cluster: &MySqlCluster) -> Self {
        let namespace = cluster.namespace();
        Self {
            client: client.clone(),
            cluster_api: Api::namespaced(client.clone(), &namespace),
            sts_api: Api::namespaced(client.clone(), &namespace),
            cluster: Mutex::new(cluster.clone()),
        }
    }

    pub fn latest(&self) -> MySqlCluster {
        self.cluster.lock().unwrap().clone()
    }

    pub async fn persist_reconciled_generation(&self) -> Result<(), Error> {
        let mut cluster = self.latest();
        let generation = cluster.meta().generation;
        let mut status = cluster.status();
        if status.reconciled_generation == generation {
            return Ok(());
        }
        status.reconciled_generation = generation;
        cluster.status = Some(status);
        self.replace_status(cluster).await
    }

    async fn replace_status(&self, cluster: MySqlCluster) -> Result<(), Error> {
        let updated = self
            .cluster_api
            .replace_status(
                &cluster.name_unchecked(),
                &PostParams::default(),
                serde_json::to_vec(&cluster).unwrap(),
            )
            .await?;
        *self.cluster.lock().unwrap() = updated;
        Ok(())
    }
}

#[async_trait]
impl ClusterHandle for KubeClusterHandle {
    async fn persist_rotation(&self, rotation: RotationStatus) -> Result<(), Error> {
        let mut cluster = self.latest();
        let mut status = cluster.status();
        status.rotation = rotation;
        cluster.status = Some(status);
        self.replace_status(cluster).await
    }

    async fn remove_annotation(&self, key: &str) -> Result<(), Error> {
        let name = self.latest().name_unchecked();
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    key: null,
                }
            }
        });
        let updated = self
            .cluster_api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        *self.cluster.lock().unwrap() = updated;
        Ok(())
    }

    async fn publish(
        &self,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) -> Result<(), Error> {
        let cluster = self.latest();
        publish_event(self.client.clone(), &cluster, type_, reason, action, note).await?;
        Ok(())
    }

    async fn get_statefulset(&self) -> Result<Option<StatefulSet>, Error> {
        let name = self.latest().statefulset_name();
        Ok(get_resource(&self.sts_api, &name).await?)
    }
}

/// Connects to instances through their per-pod DNS names.
struct PodConnector {
    cluster: MySqlCluster,
    port: u16,
    connect_timeout: Duration,
    statement_timeout: Duration,
}

#[async_trait]
impl InstanceConnector for PodConnector {
    async fn connect(
        &self,
        ordinal: i32,
        user: &str,
        password: &str,
    ) -> Result<Box<dyn InstanceOps>, MySqlError> {
        let instance = MySqlInstance::connect(InstanceConfig {
            host: self.cluster.pod_fqdn(ordinal),
            port: self.port,
            user: user.to_owned(),
            password: password.to_owned(),
            connect_timeout: self.connect_timeout,
            statement_timeout: self.statement_timeout,
        })
        .await?;
        Ok(Box::new(instance))
    }
}
