// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The credential-rotation state machine.
//!
//! Rotation happens in two user-confirmed halves so that at no point does a
//! consumer hold a password that no instance accepts:
//!
//! ```text
//! Idle --(rotate trigger)--> Rotating --(all instances hold both
//!     passwords, new ones distributed)--> Rotated --(discard trigger,
//!     fleet rolled)--> Idle
//! ```
//!
//! The rotate half installs a freshly generated password for every system
//! user on every instance with `RETAIN CURRENT PASSWORD`, leaving both the
//! old and the new password valid, then distributes the new ones. The
//! discard half waits until every pod has restarted onto the distributed
//! credentials, then drops the retained passwords and re-hashes each user
//! under the server's default auth plugin.
//!
//! Crash recovery rests on two rules. First, `RotationStatus` is persisted
//! before the step it unblocks and again after the step it guards has
//! succeeded on every instance, so a restarted controller re-enters the
//! machine exactly where it stopped. Second, every per-instance step is
//! guarded by a probe of durable MySQL state (does the user retain a second
//! password?) rather than a loop index, so replaying a half-finished pass
//! touches only the instances that still need it.

use std::time::Duration;

use anyhow::anyhow;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{debug, warn};

use silo_cluster_resources::crd::mysqlcluster::v1alpha1::{
    MySqlCluster, RotationPhase, RotationStatus, DISCARD_OLD_PASSWORDS_ANNOTATION,
    ROTATE_USERS_ANNOTATION, ROTATION_ID_ANNOTATION,
};
use silo_mysql_util::{InstanceConnector, InstanceOps, ADMIN_USER, SYSTEM_USERS};

use crate::secrets::{
    consumer_secret_name, distribute_credentials, generate_credentials, CredentialSecret,
    SecretStore, CONSUMER_SECRETS,
};
use crate::Error;

use super::ClusterHandle;

pub(super) struct RotationCoordinator<'a> {
    cluster: &'a MySqlCluster,
    handle: &'a dyn ClusterHandle,
    secrets: &'a dyn SecretStore,
    connector: &'a dyn InstanceConnector,
    mysql_port: u16,
    requeue: Duration,
}

impl<'a> RotationCoordinator<'a> {
    pub(super) fn new(
        cluster: &'a MySqlCluster,
        handle: &'a dyn ClusterHandle,
        secrets: &'a dyn SecretStore,
        connector: &'a dyn InstanceConnector,
        mysql_port: u16,
        requeue: Duration,
    ) -> Self {
        Self {
            cluster,
            handle,
            secrets,
            connector,
            mysql_port,
            requeue,
        }
    }

    /// Advances the machine by at most one step. Returns a requeue action
    /// when progress is blocked on something external (fleet convergence,
    /// scale-up).
    pub(super) async fn reconcile(&self) -> Result<Option<Action>, Error> {
        let rotation = self.cluster.status().rotation;
        match rotation.phase {
            RotationPhase::Idle => self.reconcile_idle(rotation).await,
            RotationPhase::Rotating => self.resume_rotating(rotation).await,
            RotationPhase::Rotated => self.reconcile_rotated(rotation).await,
        }
    }

    async fn reconcile_idle(&self, rotation: RotationStatus) -> Result<Option<Action>, Error> {
        // a discard while idle is either a leftover from a completed
        // rotation whose best-effort trigger removal failed, or a request
        // that will never become actionable; consume it either way so the
        // requester finds out instead of waiting forever
        if let Some(id) = self.cluster.discard_requested() {
            self.handle
                .remove_annotation(DISCARD_OLD_PASSWORDS_ANNOTATION)
                .await?;
            if !id.is_empty() && id == rotation.last_rotation_id {
                self.handle
                    .publish(
                        EventType::Normal,
                        "StaleRotationTrigger",
                        "discard-old-passwords",
                        format!(
                            "discard of rotation '{id}' already completed; removed the \
                             leftover trigger"
                        ),
                    )
                    .await?;
            } else {
                self.handle
                    .publish(
                        EventType::Warning,
                        "DiscardRefused",
                        "discard-old-passwords",
                        format!(
                            "discard of rotation '{id}' refused: no rotation is in flight; \
                             rotate first, then confirm the discard"
                        ),
                    )
                    .await?;
            }
        }

        let Some(id) = self.cluster.rotation_requested() else {
            return Ok(None);
        };

        if id.is_empty() {
            self.handle.remove_annotation(ROTATE_USERS_ANNOTATION).await?;
            self.handle
                .publish(
                    EventType::Warning,
                    "RotationRefused",
                    "rotate-system-users",
                    format!(
                        "rotation refused: the {ROTATE_USERS_ANNOTATION} annotation must \
                         carry a non-empty rotation id"
                    ),
                )
                .await?;
            return Ok(None);
        }

        // leftover from a completed rotation whose best-effort trigger
        // removal failed
        if id == rotation.last_rotation_id {
            self.handle.remove_annotation(ROTATE_USERS_ANNOTATION).await?;
            self.handle
                .publish(
                    EventType::Normal,
                    "StaleRotationTrigger",
                    "rotate-system-users",
                    format!("rotation '{id}' already completed; removed the leftover trigger"),
                )
                .await?;
            return Ok(None);
        }

        let replicas = self.cluster.spec.replicas;
        if replicas == 0 {
            self.handle.remove_annotation(ROTATE_USERS_ANNOTATION).await?;
            self.handle
                .publish(
                    EventType::Warning,
                    "RotationRefused",
                    "rotate-system-users",
                    format!(
                        "rotation '{id}' refused: the cluster has zero replicas; scale up \
                         and request the rotation again"
                    ),
                )
                .await?;
            return Ok(None);
        }

        // an instance that already retains a second password is debris from
        // a rotation that was never discarded; starting another rotation on
        // top of it would hand out passwords the eventual discard drops
        let current = self
            .load_credentials(&self.cluster.system_users_secret_name())
            .await?;
        let admin_password = current.password(ADMIN_USER)?;
        for ordinal in 0..replicas {
            let mut instance = self
                .connector
                .connect(ordinal, ADMIN_USER, admin_password)
                .await?;
            for user in SYSTEM_USERS {
                if instance.has_dual_password(user).await? {
                    self.handle.remove_annotation(ROTATE_USERS_ANNOTATION).await?;
                    self.handle
                        .publish(
                            EventType::Warning,
                            "RotationRefused",
                            "rotate-system-users",
                            format!(
                                "rotation '{id}' refused: instance {ordinal} already \
                                 retains a second password for {user}; discard it \
                                 manually, then request a new rotation"
                            ),
                        )
                        .await?;
                    return Ok(None);
                }
            }
        }

        // intent goes durable before the first ALTER USER
        let rotation = RotationStatus {
            phase: RotationPhase::Rotating,
            rotation_id: id.clone(),
            last_rotation_id: rotation.last_rotation_id,
            rotate_applied: false,
            discard_applied: false,
        };
        self.handle.persist_rotation(rotation.clone()).await?;
        self.handle
            .publish(
                EventType::Normal,
                "RotationStarted",
                "rotate-system-users",
                format!("installing new passwords for rotation '{id}' on {replicas} instances"),
            )
            .await?;

        self.run_rotate(rotation).await
    }

    async fn resume_rotating(&self, rotation: RotationStatus) -> Result<Option<Action>, Error> {
        if let Some(id) = self.cluster.rotation_requested() {
            if id != rotation.rotation_id {
                debug!(
                    requested = %id,
                    in_flight = %rotation.rotation_id,
                    "ignoring rotate trigger that does not match the rotation in flight",
                );
            }
        }
        // a discard cannot be honored until every instance has confirmed
        // the new passwords; consume it so the requester is told to retry
        // rather than left waiting on a trigger that no longer exists
        if let Some(id) = self.cluster.discard_requested() {
            self.handle
                .remove_annotation(DISCARD_OLD_PASSWORDS_ANNOTATION)
                .await?;
            self.handle
                .publish(
                    EventType::Warning,
                    "DiscardRefused",
                    "discard-old-passwords",
                    format!(
                        "discard of rotation '{id}' refused: rotation '{}' is still \
                         applying; wait for it to finish, then request the discard again",
                        rotation.rotation_id
                    ),
                )
                .await?;
        }
        self.run_rotate(rotation).await
    }

    async fn run_rotate(&self, rotation: RotationStatus) -> Result<Option<Action>, Error> {
        let mut rotation = rotation;
        let pending = self.ensure_pending_credentials(&rotation).await?;

        if !rotation.rotate_applied {
            let current = self
                .load_credentials(&self.cluster.system_users_secret_name())
                .await?;
            let admin_password = current.password(ADMIN_USER)?.to_owned();
            let primary = self.cluster.current_primary_index();
            // ascending ordinals; a crash resumes here and the per-user
            // dual-password probe skips whatever already happened
            for ordinal in 0..self.cluster.spec.replicas {
                self.rotate_instance(ordinal, ordinal != primary, &admin_password, &pending)
                    .await?;
            }
            rotation.rotate_applied = true;
            self.handle.persist_rotation(rotation.clone()).await?;
        }

        distribute_credentials(self.secrets, self.cluster, &pending, self.mysql_port).await?;

        // once consumers have seen the new passwords, the sync path must
        // never fall back to the old ones, so the phase flips only after a
        // successful distribution
        rotation.phase = RotationPhase::Rotated;
        self.handle.persist_rotation(rotation.clone()).await?;
        self.handle
            .publish(
                EventType::Normal,
                "CredentialsRotated",
                "rotate-system-users",
                format!(
                    "new credentials for rotation '{}' are installed on every instance and \
                     distributed; confirm with the {DISCARD_OLD_PASSWORDS_ANNOTATION} \
                     annotation once the fleet has rolled",
                    rotation.rotation_id
                ),
            )
            .await?;

        if self.cluster.rotation_requested().as_deref() == Some(rotation.rotation_id.as_str()) {
            self.remove_trigger_best_effort(ROTATE_USERS_ANNOTATION).await;
        }

        Ok(None)
    }

    async fn reconcile_rotated(&self, rotation: RotationStatus) -> Result<Option<Action>, Error> {
        // the rotate trigger may have survived a failed best-effort removal
        if self.cluster.rotation_requested().as_deref() == Some(rotation.rotation_id.as_str()) {
            self.remove_trigger_best_effort(ROTATE_USERS_ANNOTATION).await;
        }

        if rotation.discard_applied {
            // crashed between dropping the old passwords and promoting the
            // pending credentials; finish the job
            return self.finish_discard(rotation).await;
        }

        let Some(id) = self.cluster.discard_requested() else {
            return Ok(None);
        };

        if id != rotation.rotation_id || !rotation.rotate_applied {
            self.handle
                .remove_annotation(DISCARD_OLD_PASSWORDS_ANNOTATION)
                .await?;
            self.handle
                .publish(
                    EventType::Warning,
                    "DiscardRefused",
                    "discard-old-passwords",
                    format!(
                        "discard of rotation '{id}' refused: no confirmed rotation with \
                         that id is awaiting discard; re-request with the id reported by \
                         the CredentialsRotated event"
                    ),
                )
                .await?;
            return Ok(None);
        }

        self.run_discard(rotation).await
    }

    async fn run_discard(&self, rotation: RotationStatus) -> Result<Option<Action>, Error> {
        let mut rotation = rotation;
        let replicas = self.cluster.spec.replicas;

        if replicas == 0 {
            self.handle
                .publish(
                    EventType::Warning,
                    "DiscardBlocked",
                    "discard-old-passwords",
                    format!(
                        "cannot discard the old passwords of rotation '{}' with zero \
                         replicas; scale the cluster up to let the discard proceed",
                        rotation.rotation_id
                    ),
                )
                .await?;
            return Ok(Some(Action::requeue(self.requeue)));
        }

        if let Some(gap) = self.discard_convergence_gap(&rotation).await? {
            debug!(rotation = %rotation.rotation_id, %gap, "holding discard until the fleet converges");
            return Ok(Some(Action::requeue(self.requeue)));
        }

        let pending = self.load_pending_for(&rotation).await?;
        // the new admin password is valid on every instance once
        // RotateApplied is set; the old one is about to disappear
        let admin_password = pending.password(ADMIN_USER)?.to_owned();
        let primary = self.cluster.current_primary_index();

        // the auth plugin is a cluster-global setting; read it once from
        // the primary
        let plugin = {
            let mut instance = self
                .connector
                .connect(primary, ADMIN_USER, &admin_password)
                .await?;
            instance.default_auth_plugin().await?
        };

        for ordinal in 0..replicas {
            self.discard_instance(ordinal, ordinal != primary, &admin_password, &pending, &plugin)
                .await?;
        }

        rotation.discard_applied = true;
        self.handle.persist_rotation(rotation.clone()).await?;

        self.finish_discard(rotation).await
    }

    /// Promotes the pending credentials to current and resets the machine
    /// to idle. Every part is idempotent, so replaying after a crash is a
    /// no-op for whatever already happened.
    async fn finish_discard(&self, rotation: RotationStatus) -> Result<Option<Action>, Error> {
        let pending_name = self.cluster.pending_system_users_secret_name();
        if let Some(pending) = self.secrets.get(&pending_name).await? {
            if pending.rotation_id.as_deref() == Some(rotation.rotation_id.as_str()) {
                self.secrets
                    .apply(&self.cluster.system_users_secret_name(), &pending)
                    .await?;
            }
            self.secrets.delete(&pending_name).await?;
        }

        let completed = rotation.rotation_id;
        self.handle
            .persist_rotation(RotationStatus {
                phase: RotationPhase::Idle,
                rotation_id: String::new(),
                last_rotation_id: completed.clone(),
                rotate_applied: false,
                discard_applied: false,
            })
            .await?;

        // only the triggers of this rotation; one carrying a different id
        // is a fresh request the next idle pass must evaluate
        if self.cluster.rotation_requested().as_deref() == Some(completed.as_str()) {
            self.remove_trigger_best_effort(ROTATE_USERS_ANNOTATION).await;
        }
        if self.cluster.discard_requested().as_deref() == Some(completed.as_str()) {
            self.remove_trigger_best_effort(DISCARD_OLD_PASSWORDS_ANNOTATION)
                .await;
        }

        self.handle
            .publish(
                EventType::Normal,
                "RotationCompleted",
                "discard-old-passwords",
                format!(
                    "rotation '{completed}' is complete; every instance dropped its old \
                     passwords"
                ),
            )
            .await?;

        Ok(None)
    }

    /// Why the old passwords cannot be dropped yet, if anything. Discarding
    /// is only safe once every running process has picked up the new
    /// credentials through its restart, which is what the revision,
    /// generation, replica-count, and rotation-marker checks add up to.
    async fn discard_convergence_gap(
        &self,
        rotation: &RotationStatus,
    ) -> Result<Option<String>, Error> {
        let Some(sts) = self.handle.get_statefulset().await? else {
            return Ok(Some("the StatefulSet does not exist yet".into()));
        };
        let spec = sts.spec.clone().unwrap_or_default();
        let status = sts.status.clone().unwrap_or_default();
        let desired = spec.replicas.unwrap_or(0);

        if desired != self.cluster.spec.replicas {
            return Ok(Some(format!(
                "the StatefulSet wants {desired} replicas but the cluster wants {}",
                self.cluster.spec.replicas
            )));
        }
        if sts.metadata.generation != status.observed_generation {
            return Ok(Some(
                "the StatefulSet has not observed its latest generation".into(),
            ));
        }
        if status.current_revision != status.update_revision {
            return Ok(Some("the StatefulSet revisions have not converged".into()));
        }
        let updated = status.updated_replicas.unwrap_or(0);
        let ready = status.ready_replicas.unwrap_or(0);
        if updated != desired || ready != desired || status.replicas != desired {
            return Ok(Some(format!(
                "{updated}/{desired} replicas updated, {ready}/{desired} ready"
            )));
        }

        let template_rotation_id = spec
            .template
            .metadata
            .as_ref()
            .and_then(|meta| meta.annotations.as_ref())
            .and_then(|annotations| annotations.get(ROTATION_ID_ANNOTATION));
        if template_rotation_id != Some(&rotation.rotation_id) {
            return Ok(Some(
                "the pod template does not carry the rotation id yet".into(),
            ));
        }

        for (_, prefix) in CONSUMER_SECRETS {
            let name = consumer_secret_name(prefix, self.cluster);
            let distributed = self.secrets.get(&name).await?;
            if distributed.and_then(|secret| secret.rotation_id).as_deref()
                != Some(rotation.rotation_id.as_str())
            {
                return Ok(Some(format!(
                    "secret {name} does not carry the rotation id yet"
                )));
            }
        }

        Ok(None)
    }

    async fn rotate_instance(
        &self,
        ordinal: i32,
        is_replica: bool,
        admin_password: &str,
        pending: &CredentialSecret,
    ) -> Result<(), Error> {
        let mut instance = self
            .connector
            .connect(ordinal, ADMIN_USER, admin_password)
            .await?;
        if is_replica {
            instance.set_super_read_only(false).await?;
        }
        let result = self.rotate_users(instance.as_mut(), pending).await;
        if is_replica {
            // restore even on failure; the first error wins
            let restore = instance.set_super_read_only(true).await;
            result?;
            restore?;
            return Ok(());
        }
        result
    }

    async fn rotate_users(
        &self,
        instance: &mut dyn InstanceOps,
        pending: &CredentialSecret,
    ) -> Result<(), Error> {
        for user in SYSTEM_USERS {
            if instance.has_dual_password(user).await? {
                continue;
            }
            instance
                .rotate_user_password(user, pending.password(user)?)
                .await?;
        }
        Ok(())
    }

    async fn discard_instance(
        &self,
        ordinal: i32,
        is_replica: bool,
        admin_password: &str,
        pending: &CredentialSecret,
        plugin: &str,
    ) -> Result<(), Error> {
        let mut instance = self
            .connector
            .connect(ordinal, ADMIN_USER, admin_password)
            .await?;
        if is_replica {
            instance.set_super_read_only(false).await?;
        }
        let result = self.discard_users(instance.as_mut(), pending, plugin).await;
        if is_replica {
            let restore = instance.set_super_read_only(true).await;
            result?;
            restore?;
            return Ok(());
        }
        result
    }

    async fn discard_users(
        &self,
        instance: &mut dyn InstanceOps,
        pending: &CredentialSecret,
        plugin: &str,
    ) -> Result<(), Error> {
        for user in SYSTEM_USERS {
            if instance.has_dual_password(user).await? {
                instance.discard_old_password(user).await?;
            }
            // servers refuse to change the auth method of a user that
            // retains two passwords, so this runs strictly after the
            // discard
            instance
                .migrate_auth_plugin(user, pending.password(user)?, plugin)
                .await?;
        }
        Ok(())
    }

    /// Generates the pending credential set, reusing it if an earlier pass
    /// already did.
    async fn ensure_pending_credentials(
        &self,
        rotation: &RotationStatus,
    ) -> Result<CredentialSecret, Error> {
        let name = self.cluster.pending_system_users_secret_name();
        if let Some(pending) = self.secrets.get(&name).await? {
            if pending.rotation_id.as_deref() == Some(rotation.rotation_id.as_str()) {
                return Ok(pending);
            }
            return Err(anyhow!(
                "pending credentials in secret {name} belong to rotation '{}', not the \
                 in-flight rotation '{}'; manual recovery is required",
                pending.rotation_id.as_deref().unwrap_or(""),
                rotation.rotation_id,
            )
            .into());
        }
        let pending = generate_credentials(Some(rotation.rotation_id.clone()));
        self.secrets.apply(&name, &pending).await?;
        Ok(pending)
    }

    async fn load_pending_for(
        &self,
        rotation: &RotationStatus,
    ) -> Result<CredentialSecret, Error> {
        let name = self.cluster.pending_system_users_secret_name();
        let pending = self.secrets.get(&name).await?.ok_or_else(|| {
            anyhow!(
                "the pending credentials of rotation '{}' are gone; secret {name} must be \
                 recovered manually before the old passwords can be discarded",
                rotation.rotation_id,
            )
        })?;
        if pending.rotation_id.as_deref() != Some(rotation.rotation_id.as_str()) {
            return Err(anyhow!(
                "pending credentials in secret {name} belong to rotation '{}', not the \
                 in-flight rotation '{}'; manual recovery is required",
                pending.rotation_id.as_deref().unwrap_or(""),
                rotation.rotation_id,
            )
            .into());
        }
        Ok(pending)
    }

    async fn load_credentials(&self, name: &str) -> Result<CredentialSecret, Error> {
        Ok(self
            .secrets
            .get(name)
            .await?
            .ok_or_else(|| anyhow!("secret {name} does not exist"))?)
    }

    async fn remove_trigger_best_effort(&self, key: &str) {
        if let Err(e) = self.handle.remove_annotation(key).await {
            warn!(
                annotation = key,
                error = %e,
                "failed to remove trigger annotation; retrying on the next reconcile",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use kube::api::ObjectMeta;
    use kube::ResourceExt;

    use silo_cluster_resources::crd::mysqlcluster::v1alpha1::MySqlClusterSpec;
    use silo_mysql_util::{MySqlError, AGENT_USER};

    use crate::secrets::testutil::MemorySecretStore;

    use super::*;

    /// One simulated MySQL fleet, shared by every connection the
    /// coordinator opens. Dual-password presence is keyed by
    /// (ordinal, user) so crash-resume tests can seed partial progress.
    #[derive(Default)]
    struct FleetState {
        dual_passwords: BTreeSet<(i32, String)>,
        rotated: Vec<(i32, String)>,
        discarded: Vec<(i32, String)>,
        migrated: Vec<(i32, String, String)>,
        read_only_log: Vec<(i32, bool)>,
        connections: Vec<(i32, String, String)>,
        default_plugin: String,
    }

    struct FakeConnector {
        state: Arc<Mutex<FleetState>>,
    }

    struct FakeInstance {
        ordinal: i32,
        state: Arc<Mutex<FleetState>>,
    }

    #[async_trait]
    impl InstanceConnector for FakeConnector {
        async fn connect(
            &self,
            ordinal: i32,
            user: &str,
            password: &str,
        ) -> Result<Box<dyn InstanceOps>, MySqlError> {
            self.state
                .lock()
                .unwrap()
                .connections
                .push((ordinal, user.to_owned(), password.to_owned()));
            Ok(Box::new(FakeInstance {
                ordinal,
                state: Arc::clone(&self.state),
            }))
        }
    }

    #[async_trait]
    impl InstanceOps for FakeInstance {
        async fn has_dual_password(&mut self, user: &str) -> Result<bool, MySqlError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .dual_passwords
                .contains(&(self.ordinal, user.to_owned())))
        }

        async fn rotate_user_password(
            &mut self,
            user: &str,
            _password: &str,
        ) -> Result<(), MySqlError> {
            let mut state = self.state.lock().unwrap();
            state.rotated.push((self.ordinal, user.to_owned()));
            state.dual_passwords.insert((self.ordinal, user.to_owned()));
            Ok(())
        }

        async fn discard_old_password(&mut self, user: &str) -> Result<(), MySqlError> {
            let mut state = self.state.lock().unwrap();
            state.discarded.push((self.ordinal, user.to_owned()));
            state.dual_passwords.remove(&(self.ordinal, user.to_owned()));
            Ok(())
        }

        async fn migrate_auth_plugin(
            &mut self,
            user: &str,
            _password: &str,
            plugin: &str,
        ) -> Result<(), MySqlError> {
            let mut state = self.state.lock().unwrap();
            // mirrors the server: the auth method cannot change while a
            // second password is retained
            if state
                .dual_passwords
                .contains(&(self.ordinal, user.to_owned()))
            {
                return Err(MySqlError::Generic(anyhow!(
                    "{user} still retains a second password"
                )));
            }
            state
                .migrated
                .push((self.ordinal, user.to_owned(), plugin.to_owned()));
            Ok(())
        }

        async fn set_super_read_only(&mut self, enabled: bool) -> Result<(), MySqlError> {
            self.state
                .lock()
                .unwrap()
                .read_only_log
                .push((self.ordinal, enabled));
            Ok(())
        }

        async fn default_auth_plugin(&mut self) -> Result<String, MySqlError> {
            Ok(self.state.lock().unwrap().default_plugin.clone())
        }
    }

    #[derive(Default)]
    struct FakeHandle {
        persisted: Mutex<Vec<RotationStatus>>,
        removed: Mutex<Vec<String>>,
        events: Mutex<Vec<(String, String)>>,
        statefulset: Mutex<Option<StatefulSet>>,
    }

    impl FakeHandle {
        fn persisted(&self) -> Vec<RotationStatus> {
            self.persisted.lock().unwrap().clone()
        }

        fn removed(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }

        fn reasons(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(reason, _)| reason.clone())
                .collect()
        }

        fn note_for(&self, reason: &str) -> String {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|(r, _)| r == reason)
                .map(|(_, note)| note.clone())
                .unwrap_or_else(|| panic!("no {reason} event"))
        }
    }

    #[async_trait]
    impl ClusterHandle for FakeHandle {
        async fn persist_rotation(&self, rotation: RotationStatus) -> Result<(), Error> {
            self.persisted.lock().unwrap().push(rotation);
            Ok(())
        }

        async fn remove_annotation(&self, key: &str) -> Result<(), Error> {
            self.removed.lock().unwrap().push(key.to_owned());
            Ok(())
        }

        async fn publish(
            &self,
            _type_: EventType,
            reason: &str,
            _action: &str,
            note: String,
        ) -> Result<(), Error> {
            self.events.lock().unwrap().push((reason.to_owned(), note));
            Ok(())
        }

        async fn get_statefulset(&self) -> Result<Option<StatefulSet>, Error> {
            Ok(self.statefulset.lock().unwrap().clone())
        }
    }

    fn cluster(replicas: i32) -> MySqlCluster {
        let mut cluster = MySqlCluster::new(
            "shop",
            MySqlClusterSpec {
                replicas,
                image: None,
            },
        );
        cluster.metadata.namespace = Some("db".to_owned());
        cluster
    }

    fn annotate(cluster: &mut MySqlCluster, key: &str, value: &str) {
        cluster
            .annotations_mut()
            .insert(key.to_owned(), value.to_owned());
    }

    fn set_rotation(cluster: &mut MySqlCluster, rotation: RotationStatus) {
        let mut status = cluster.status();
        status.rotation = rotation;
        cluster.status = Some(status);
    }

    fn rotating(id: &str, rotate_applied: bool) -> RotationStatus {
        RotationStatus {
            phase: RotationPhase::Rotating,
            rotation_id: id.to_owned(),
            rotate_applied,
            ..Default::default()
        }
    }

    fn rotated(id: &str) -> RotationStatus {
        RotationStatus {
            phase: RotationPhase::Rotated,
            rotation_id: id.to_owned(),
            rotate_applied: true,
            ..Default::default()
        }
    }

    fn seed_current(secrets: &MemorySecretStore, cluster: &MySqlCluster) -> CredentialSecret {
        let credentials = generate_credentials(None);
        secrets.insert(&cluster.system_users_secret_name(), credentials.clone());
        credentials
    }

    fn seed_pending(secrets: &MemorySecretStore, cluster: &MySqlCluster, id: &str) -> CredentialSecret {
        let credentials = generate_credentials(Some(id.to_owned()));
        secrets.insert(
            &cluster.pending_system_users_secret_name(),
            credentials.clone(),
        );
        credentials
    }

    fn seed_consumer_secrets(secrets: &MemorySecretStore, cluster: &MySqlCluster, id: &str) {
        for (_, prefix) in CONSUMER_SECRETS {
            secrets.insert(
                &consumer_secret_name(prefix, cluster),
                CredentialSecret {
                    rotation_id: Some(id.to_owned()),
                    data: BTreeMap::new(),
                },
            );
        }
    }

    fn converged_statefulset(cluster: &MySqlCluster, rotation_id: &str) -> StatefulSet {
        let replicas = cluster.spec.replicas;
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(cluster.statefulset_name()),
                namespace: Some(cluster.namespace()),
                generation: Some(4),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        annotations: Some(BTreeMap::from([(
                            ROTATION_ID_ANNOTATION.to_owned(),
                            rotation_id.to_owned(),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(4),
                current_revision: Some("rev-2".into()),
                update_revision: Some("rev-2".into()),
                replicas,
                updated_replicas: Some(replicas),
                ready_replicas: Some(replicas),
                ..Default::default()
            }),
        }
    }

    async fn run(
        cluster: &MySqlCluster,
        handle: &FakeHandle,
        secrets: &MemorySecretStore,
        state: &Arc<Mutex<FleetState>>,
    ) -> Result<Option<Action>, Error> {
        let connector = FakeConnector {
            state: Arc::clone(state),
        };
        RotationCoordinator::new(
            cluster,
            handle,
            secrets,
            &connector,
            3306,
            Duration::from_secs(5),
        )
        .reconcile()
        .await
    }

    #[tokio::test]
    async fn rotation_refused_with_zero_replicas() {
        let mut cluster = cluster(0);
        annotate(&mut cluster, ROTATE_USERS_ANNOTATION, "r1");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        seed_current(&secrets, &cluster);
        let state = Arc::new(Mutex::new(FleetState::default()));

        let action = run(&cluster, &handle, &secrets, &state).await.unwrap();

        assert!(action.is_none());
        assert!(handle.persisted().is_empty());
        assert_eq!(handle.removed(), vec![ROTATE_USERS_ANNOTATION]);
        assert!(handle.note_for("RotationRefused").contains("zero replicas"));
        assert!(state.lock().unwrap().connections.is_empty());
    }

    #[tokio::test]
    async fn discard_refused_while_idle() {
        let mut cluster = cluster(3);
        annotate(&mut cluster, DISCARD_OLD_PASSWORDS_ANNOTATION, "r9");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        let state = Arc::new(Mutex::new(FleetState::default()));

        run(&cluster, &handle, &secrets, &state).await.unwrap();

        assert!(handle.persisted().is_empty());
        assert_eq!(handle.removed(), vec![DISCARD_OLD_PASSWORDS_ANNOTATION]);
        assert!(handle.note_for("DiscardRefused").contains("rotate first"));
    }

    #[tokio::test]
    async fn rotate_installs_dual_passwords_everywhere() {
        let mut cluster = cluster(3);
        annotate(&mut cluster, ROTATE_USERS_ANNOTATION, "r1");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        let current = seed_current(&secrets, &cluster);
        let state = Arc::new(Mutex::new(FleetState::default()));

        let action = run(&cluster, &handle, &secrets, &state).await.unwrap();
        assert!(action.is_none());

        // status writes sandwich the instance work
        let persisted = handle.persisted();
        assert_eq!(persisted.len(), 3);
        assert_eq!(persisted[0].phase, RotationPhase::Rotating);
        assert!(!persisted[0].rotate_applied);
        assert_eq!(persisted[1].phase, RotationPhase::Rotating);
        assert!(persisted[1].rotate_applied);
        assert_eq!(persisted[2].phase, RotationPhase::Rotated);
        assert!(persisted.iter().all(|r| r.rotation_id == "r1"));

        let state = state.lock().unwrap();
        // every (instance, user) pair rotated once, in ascending ordinal
        // order
        let ordinals: Vec<i32> = state.rotated.iter().map(|(o, _)| *o).collect();
        let mut sorted = ordinals.clone();
        sorted.sort();
        assert_eq!(ordinals, sorted);
        assert_eq!(state.rotated.len(), 3 * SYSTEM_USERS.len());
        assert_eq!(state.dual_passwords.len(), 3 * SYSTEM_USERS.len());
        // replicas get the read-only sandwich, the primary does not
        assert_eq!(
            state.read_only_log,
            vec![(1, false), (1, true), (2, false), (2, true)]
        );
        // everything ran as admin with the old password
        let old_admin = current.password(ADMIN_USER).unwrap();
        assert!(state
            .connections
            .iter()
            .all(|(_, user, password)| user == ADMIN_USER && password == old_admin));

        let pending = secrets
            .get_sync(&cluster.pending_system_users_secret_name())
            .unwrap();
        assert_eq!(pending.rotation_id.as_deref(), Some("r1"));
        for (_, prefix) in CONSUMER_SECRETS {
            let distributed = secrets
                .get_sync(&consumer_secret_name(prefix, &cluster))
                .unwrap();
            assert_eq!(distributed.rotation_id.as_deref(), Some("r1"));
        }

        assert_eq!(
            handle.reasons(),
            vec!["RotationStarted", "CredentialsRotated"]
        );
        assert_eq!(handle.removed(), vec![ROTATE_USERS_ANNOTATION]);
    }

    #[tokio::test]
    async fn rotate_resumes_after_crash_mid_loop() {
        let mut cluster = cluster(3);
        set_rotation(&mut cluster, rotating("r1", false));
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        seed_current(&secrets, &cluster);
        let pending = seed_pending(&secrets, &cluster, "r1");
        let state = Arc::new(Mutex::new(FleetState::default()));
        // the previous pass finished instance 0 and the admin user of
        // instance 1 before dying
        {
            let mut state = state.lock().unwrap();
            for user in SYSTEM_USERS {
                state.dual_passwords.insert((0, user.to_string()));
            }
            state.dual_passwords.insert((1, ADMIN_USER.to_owned()));
        }

        run(&cluster, &handle, &secrets, &state).await.unwrap();

        let fleet = state.lock().unwrap();
        // only the not-yet-rotated pairs were touched
        assert!(fleet.rotated.iter().all(|(o, _)| *o != 0));
        assert!(!fleet.rotated.contains(&(1, ADMIN_USER.to_owned())));
        assert_eq!(
            fleet.rotated.len(),
            2 * SYSTEM_USERS.len() - 1,
            "{:?}",
            fleet.rotated
        );
        assert_eq!(fleet.dual_passwords.len(), 3 * SYSTEM_USERS.len());

        // the pending credentials were reused, not regenerated
        let kept = secrets
            .get_sync(&cluster.pending_system_users_secret_name())
            .unwrap();
        assert_eq!(kept, pending);

        let persisted = handle.persisted();
        assert_eq!(persisted.len(), 2);
        assert!(persisted[0].rotate_applied);
        assert_eq!(persisted[1].phase, RotationPhase::Rotated);
    }

    #[tokio::test]
    async fn rotate_step_skipped_once_applied() {
        let mut cluster = cluster(3);
        set_rotation(&mut cluster, rotating("r1", true));
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        seed_current(&secrets, &cluster);
        seed_pending(&secrets, &cluster, "r1");
        let state = Arc::new(Mutex::new(FleetState::default()));

        run(&cluster, &handle, &secrets, &state).await.unwrap();

        // no connection is even opened once the guard flag is set
        assert!(state.lock().unwrap().connections.is_empty());
        for (_, prefix) in CONSUMER_SECRETS {
            let distributed = secrets
                .get_sync(&consumer_secret_name(prefix, &cluster))
                .unwrap();
            assert_eq!(distributed.rotation_id.as_deref(), Some("r1"));
        }
        let persisted = handle.persisted();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].phase, RotationPhase::Rotated);
    }

    #[tokio::test]
    async fn rotation_refused_when_dual_password_already_present() {
        let mut cluster = cluster(2);
        annotate(&mut cluster, ROTATE_USERS_ANNOTATION, "r1");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        seed_current(&secrets, &cluster);
        let state = Arc::new(Mutex::new(FleetState::default()));
        state
            .lock()
            .unwrap()
            .dual_passwords
            .insert((1, AGENT_USER.to_owned()));

        run(&cluster, &handle, &secrets, &state).await.unwrap();

        assert!(handle.persisted().is_empty());
        assert_eq!(handle.removed(), vec![ROTATE_USERS_ANNOTATION]);
        let note = handle.note_for("RotationRefused");
        assert!(note.contains("instance 1"), "{note}");
        assert!(note.contains(AGENT_USER), "{note}");
        assert!(state.lock().unwrap().rotated.is_empty());
    }

    #[tokio::test]
    async fn stale_rotate_trigger_is_removed() {
        let mut cluster = cluster(3);
        set_rotation(
            &mut cluster,
            RotationStatus {
                last_rotation_id: "r0".to_owned(),
                ..Default::default()
            },
        );
        annotate(&mut cluster, ROTATE_USERS_ANNOTATION, "r0");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        let state = Arc::new(Mutex::new(FleetState::default()));

        run(&cluster, &handle, &secrets, &state).await.unwrap();

        assert!(handle.persisted().is_empty());
        assert_eq!(handle.removed(), vec![ROTATE_USERS_ANNOTATION]);
        assert_eq!(handle.reasons(), vec!["StaleRotationTrigger"]);
        assert!(state.lock().unwrap().connections.is_empty());
    }

    #[tokio::test]
    async fn stale_discard_trigger_is_removed() {
        // a failed best-effort removal at completion leaves the confirmed
        // discard trigger behind; the next pass cleans it up without
        // telling the operator to rotate again
        let mut cluster = cluster(3);
        set_rotation(
            &mut cluster,
            RotationStatus {
                last_rotation_id: "r0".to_owned(),
                ..Default::default()
            },
        );
        annotate(&mut cluster, DISCARD_OLD_PASSWORDS_ANNOTATION, "r0");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        let state = Arc::new(Mutex::new(FleetState::default()));

        run(&cluster, &handle, &secrets, &state).await.unwrap();

        assert!(handle.persisted().is_empty());
        assert_eq!(handle.removed(), vec![DISCARD_OLD_PASSWORDS_ANNOTATION]);
        assert_eq!(handle.reasons(), vec!["StaleRotationTrigger"]);
        assert!(handle
            .note_for("StaleRotationTrigger")
            .contains("already completed"));
        assert!(state.lock().unwrap().connections.is_empty());
    }

    #[tokio::test]
    async fn mid_flight_trigger_with_new_id_is_ignored() {
        let mut cluster = cluster(3);
        set_rotation(&mut cluster, rotating("r1", false));
        annotate(&mut cluster, ROTATE_USERS_ANNOTATION, "r2");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        seed_current(&secrets, &cluster);
        let state = Arc::new(Mutex::new(FleetState::default()));

        run(&cluster, &handle, &secrets, &state).await.unwrap();

        // the machine finished r1 and left the r2 trigger for the next
        // idle pass
        assert!(handle.persisted().iter().all(|r| r.rotation_id == "r1"));
        assert!(handle.removed().is_empty());
        let pending = secrets
            .get_sync(&cluster.pending_system_users_secret_name())
            .unwrap();
        assert_eq!(pending.rotation_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn discard_trigger_while_rotating_is_consumed() {
        let mut cluster = cluster(3);
        set_rotation(&mut cluster, rotating("r1", false));
        annotate(&mut cluster, DISCARD_OLD_PASSWORDS_ANNOTATION, "r1");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        seed_current(&secrets, &cluster);
        let state = Arc::new(Mutex::new(FleetState::default()));

        run(&cluster, &handle, &secrets, &state).await.unwrap();

        // the premature confirmation is consumed with a warning; the
        // rotation itself still runs to completion
        assert_eq!(handle.removed(), vec![DISCARD_OLD_PASSWORDS_ANNOTATION]);
        assert_eq!(
            handle.reasons(),
            vec!["DiscardRefused", "CredentialsRotated"]
        );
        assert!(handle.note_for("DiscardRefused").contains("still applying"));
        let persisted = handle.persisted();
        assert_eq!(persisted.last().unwrap().phase, RotationPhase::Rotated);
        assert!(persisted.iter().all(|r| r.rotation_id == "r1"));
    }

    #[tokio::test]
    async fn pending_credentials_of_another_rotation_are_an_error() {
        let mut cluster = cluster(3);
        set_rotation(&mut cluster, rotating("r2", false));
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        seed_current(&secrets, &cluster);
        seed_pending(&secrets, &cluster, "r1");
        let state = Arc::new(Mutex::new(FleetState::default()));

        let result = run(&cluster, &handle, &secrets, &state).await;

        assert!(result.is_err());
        assert!(state.lock().unwrap().connections.is_empty());
    }

    #[tokio::test]
    async fn discard_holds_until_fleet_converges() {
        let mut cluster = cluster(3);
        set_rotation(&mut cluster, rotated("r1"));
        annotate(&mut cluster, DISCARD_OLD_PASSWORDS_ANNOTATION, "r1");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        seed_current(&secrets, &cluster);
        seed_pending(&secrets, &cluster, "r1");
        seed_consumer_secrets(&secrets, &cluster, "r1");
        let state = Arc::new(Mutex::new(FleetState::default()));

        // the roll is still in flight: one replica remains on the old
        // revision
        let mut sts = converged_statefulset(&cluster, "r1");
        sts.status.as_mut().unwrap().current_revision = Some("rev-1".into());
        sts.status.as_mut().unwrap().updated_replicas = Some(2);
        *handle.statefulset.lock().unwrap() = Some(sts);

        let action = run(&cluster, &handle, &secrets, &state).await.unwrap();

        assert!(action.is_some());
        assert!(handle.persisted().is_empty());
        assert!(handle.removed().is_empty());
        assert!(state.lock().unwrap().connections.is_empty());
    }

    #[tokio::test]
    async fn discard_holds_until_markers_propagate() {
        let mut cluster = cluster(3);
        set_rotation(&mut cluster, rotated("r1"));
        annotate(&mut cluster, DISCARD_OLD_PASSWORDS_ANNOTATION, "r1");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        seed_current(&secrets, &cluster);
        seed_pending(&secrets, &cluster, "r1");
        let state = Arc::new(Mutex::new(FleetState::default()));

        // fleet converged, but the pod template still carries the previous
        // rotation's marker
        *handle.statefulset.lock().unwrap() = Some(converged_statefulset(&cluster, "r0"));
        let action = run(&cluster, &handle, &secrets, &state).await.unwrap();
        assert!(action.is_some());
        assert!(state.lock().unwrap().connections.is_empty());

        // template fixed, but one distributed secret is stale
        *handle.statefulset.lock().unwrap() = Some(converged_statefulset(&cluster, "r1"));
        seed_consumer_secrets(&secrets, &cluster, "r1");
        let (_, prefix) = CONSUMER_SECRETS[1];
        secrets.insert(
            &consumer_secret_name(prefix, &cluster),
            CredentialSecret {
                rotation_id: Some("r0".to_owned()),
                data: BTreeMap::new(),
            },
        );
        let action = run(&cluster, &handle, &secrets, &state).await.unwrap();
        assert!(action.is_some());
        assert!(state.lock().unwrap().connections.is_empty());
        assert!(handle.persisted().is_empty());
    }

    #[tokio::test]
    async fn discard_drops_old_passwords_and_migrates() {
        let mut cluster = cluster(3);
        set_rotation(&mut cluster, rotated("r1"));
        annotate(&mut cluster, DISCARD_OLD_PASSWORDS_ANNOTATION, "r1");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        seed_current(&secrets, &cluster);
        let pending = seed_pending(&secrets, &cluster, "r1");
        seed_consumer_secrets(&secrets, &cluster, "r1");
        *handle.statefulset.lock().unwrap() = Some(converged_statefulset(&cluster, "r1"));
        let state = Arc::new(Mutex::new(FleetState::default()));
        {
            let mut state = state.lock().unwrap();
            state.default_plugin = "caching_sha2_password".to_owned();
            for ordinal in 0..3 {
                for user in SYSTEM_USERS {
                    state.dual_passwords.insert((ordinal, user.to_string()));
                }
            }
        }

        let action = run(&cluster, &handle, &secrets, &state).await.unwrap();
        assert!(action.is_none());

        let fleet = state.lock().unwrap();
        assert_eq!(fleet.discarded.len(), 3 * SYSTEM_USERS.len());
        assert!(fleet.dual_passwords.is_empty());
        // migration happened for every user, under the primary's plugin;
        // the fake rejects it unless the discard came first
        assert_eq!(fleet.migrated.len(), 3 * SYSTEM_USERS.len());
        assert!(fleet
            .migrated
            .iter()
            .all(|(_, _, plugin)| plugin == "caching_sha2_password"));
        assert_eq!(
            fleet.read_only_log,
            vec![(1, false), (1, true), (2, false), (2, true)]
        );
        // everything ran with the pending admin password, the only one
        // guaranteed to survive the discard
        let new_admin = pending.password(ADMIN_USER).unwrap();
        assert!(fleet
            .connections
            .iter()
            .all(|(_, user, password)| user == ADMIN_USER && password == new_admin));
        drop(fleet);

        // pending was promoted to current and deleted
        let current = secrets
            .get_sync(&cluster.system_users_secret_name())
            .unwrap();
        assert_eq!(current.data, pending.data);
        assert!(secrets
            .get_sync(&cluster.pending_system_users_secret_name())
            .is_none());

        let persisted = handle.persisted();
        assert_eq!(persisted.len(), 2);
        assert!(persisted[0].discard_applied);
        assert_eq!(persisted[1].phase, RotationPhase::Idle);
        assert_eq!(persisted[1].rotation_id, "");
        assert_eq!(persisted[1].last_rotation_id, "r1");
        assert!(!persisted[1].rotate_applied);
        assert!(!persisted[1].discard_applied);

        assert!(handle.reasons().contains(&"RotationCompleted".to_owned()));
        assert_eq!(handle.removed(), vec![DISCARD_OLD_PASSWORDS_ANNOTATION]);
    }

    #[tokio::test]
    async fn discard_trigger_with_wrong_id_is_consumed() {
        let mut cluster = cluster(3);
        set_rotation(&mut cluster, rotated("r1"));
        annotate(&mut cluster, DISCARD_OLD_PASSWORDS_ANNOTATION, "r2");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        let state = Arc::new(Mutex::new(FleetState::default()));

        run(&cluster, &handle, &secrets, &state).await.unwrap();

        assert!(handle.persisted().is_empty());
        assert_eq!(handle.removed(), vec![DISCARD_OLD_PASSWORDS_ANNOTATION]);
        assert_eq!(handle.reasons(), vec!["DiscardRefused"]);
        assert!(state.lock().unwrap().discarded.is_empty());
    }

    #[tokio::test]
    async fn discard_blocked_at_zero_replicas_keeps_trigger() {
        let mut cluster = cluster(0);
        set_rotation(&mut cluster, rotated("r1"));
        annotate(&mut cluster, DISCARD_OLD_PASSWORDS_ANNOTATION, "r1");
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        let state = Arc::new(Mutex::new(FleetState::default()));

        let action = run(&cluster, &handle, &secrets, &state).await.unwrap();

        assert!(action.is_some());
        assert!(handle.removed().is_empty());
        assert!(handle.persisted().is_empty());
        assert_eq!(handle.reasons(), vec!["DiscardBlocked"]);
    }

    #[tokio::test]
    async fn discard_confirmation_replays_as_noop() {
        // a crash landed after DiscardApplied was persisted and the
        // pending secret was already promoted and deleted
        let mut cluster = cluster(3);
        let mut rotation = rotated("r1");
        rotation.discard_applied = true;
        set_rotation(&mut cluster, rotation);
        let handle = FakeHandle::default();
        let secrets = MemorySecretStore::default();
        let current = seed_current(&secrets, &cluster);
        let state = Arc::new(Mutex::new(FleetState::default()));

        let action = run(&cluster, &handle, &secrets, &state).await.unwrap();

        assert!(action.is_none());
        // no instance was touched; the machine just reset itself
        assert!(state.lock().unwrap().connections.is_empty());
        assert!(handle.removed().is_empty());
        assert_eq!(
            secrets.get_sync(&cluster.system_users_secret_name()).unwrap(),
            current
        );
        let persisted = handle.persisted();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].phase, RotationPhase::Idle);
        assert_eq!(persisted[0].last_rotation_id, "r1");
        assert!(handle.reasons().contains(&"RotationCompleted".to_owned()));
    }
}
