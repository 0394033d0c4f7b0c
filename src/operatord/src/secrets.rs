// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Credential secrets for managed system users.
//!
//! Three kinds of secret exist per cluster: the authoritative
//! `silo-system-users-<cluster>` secret the operator itself reads, a
//! `silo-system-users-pending-<cluster>` secret holding not-yet-promoted
//! passwords while a rotation is in flight, and one consumer-facing secret
//! per system user (agent, exporter, backup) that pods mount. Secrets
//! produced by a rotation carry the rotation id as an annotation so later
//! steps can tell whether they have propagated.

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::{Client, ResourceExt};
use maplit::btreemap;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use silo_cluster_resources::crd::mysqlcluster::v1alpha1::{
    MySqlCluster, ROTATION_ID_ANNOTATION,
};
use silo_mysql_util::{AGENT_USER, BACKUP_USER, EXPORTER_USER, SYSTEM_USERS};

use crate::k8s::{apply_resource, delete_resource, get_resource};
use crate::Error;

/// Consumer-facing secrets: which system user each one carries. The full
/// secret name is `<prefix>-<cluster>`.
pub const CONSUMER_SECRETS: &[(&str, &str)] = &[
    (AGENT_USER, "silo-agent-credentials"),
    (EXPORTER_USER, "silo-exporter-credentials"),
    (BACKUP_USER, "silo-backup-credentials"),
];

pub fn consumer_secret_name(prefix: &str, cluster: &MySqlCluster) -> String {
    format!("{}-{}", prefix, cluster.name_unchecked())
}

/// One credential set: a password per system user, plus the id of the
/// rotation that produced it (if any).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CredentialSecret {
    pub rotation_id: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl CredentialSecret {
    pub fn password(&self, user: &str) -> Result<&str, Error> {
        self.data
            .get(user)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("credential set has no entry for {user}").into())
    }
}

/// Generates a fresh password for every managed system user.
pub fn generate_credentials(rotation_id: Option<String>) -> CredentialSecret {
    let data = SYSTEM_USERS
        .iter()
        .map(|user| (user.to_string(), generate_password()))
        .collect();
    CredentialSecret { rotation_id, data }
}

fn generate_password() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Durable storage for credential sets. The Kubernetes-backed
/// implementation is [`ClusterSecrets`]; tests swap in an in-memory one.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<CredentialSecret>, Error>;
    async fn apply(&self, name: &str, credentials: &CredentialSecret) -> Result<(), Error>;
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

/// Credential sets stored as `Secret` objects owned by the cluster.
pub struct ClusterSecrets {
    api: Api<Secret>,
    cluster: MySqlCluster,
}

impl ClusterSecrets {
    pub fn new(client: &Client, cluster: &MySqlCluster) -> Self {
        Self {
            api: Api::namespaced(client.clone(), &cluster.namespace()),
            cluster: cluster.clone(),
        }
    }
}

#[async_trait]
impl SecretStore for ClusterSecrets {
    async fn get(&self, name: &str) -> Result<Option<CredentialSecret>, Error> {
        let Some(secret) = get_resource(&self.api, name).await? else {
            return Ok(None);
        };
        let rotation_id = secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ROTATION_ID_ANNOTATION))
            .cloned();
        let mut data = BTreeMap::new();
        for (key, value) in secret.data.unwrap_or_default() {
            let value = String::from_utf8(value.0)
                .map_err(|_| anyhow!("secret {name} key {key} is not utf-8"))?;
            data.insert(key, value);
        }
        Ok(Some(CredentialSecret { rotation_id, data }))
    }

    async fn apply(&self, name: &str, credentials: &CredentialSecret) -> Result<(), Error> {
        let mut meta = self.cluster.managed_resource_meta(name.to_string());
        if let Some(rotation_id) = &credentials.rotation_id {
            meta.annotations
                .get_or_insert_with(Default::default)
                .insert(ROTATION_ID_ANNOTATION.to_string(), rotation_id.clone());
        }
        let secret = Secret {
            metadata: meta,
            string_data: Some(credentials.data.clone()),
            ..Default::default()
        };
        Ok(apply_resource(&self.api, &secret).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        Ok(delete_resource(&self.api, name).await?)
    }
}

/// Applies every consumer-facing secret from `credentials`. Server-side
/// apply makes re-running this a no-op when nothing changed.
pub async fn distribute_credentials(
    store: &dyn SecretStore,
    cluster: &MySqlCluster,
    credentials: &CredentialSecret,
    mysql_port: u16,
) -> Result<(), Error> {
    for (user, prefix) in CONSUMER_SECRETS {
        let password = credentials.password(user)?;
        let dsn = format!(
            "mysql://{}:{}@{}:{}",
            user,
            urlencoding::encode(password),
            cluster.primary_fqdn(),
            mysql_port,
        );
        let data = btreemap! {
            "USER".to_string() => user.to_string(),
            "PASSWORD".to_string() => password.to_string(),
            "DSN".to_string() => dsn,
        };
        let secret = CredentialSecret {
            rotation_id: credentials.rotation_id.clone(),
            data,
        };
        store
            .apply(&consumer_secret_name(prefix, cluster), &secret)
            .await?;
    }
    Ok(())
}
