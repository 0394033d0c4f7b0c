// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `MySqlCluster` custom resource.
//!
//! A `MySqlCluster` describes one replicated MySQL fleet: a StatefulSet of
//! `spec.replicas` instances with one primary and N-1 read-only replicas.
//! The operator stores everything it must remember across restarts in
//! `status`; trigger annotations on the resource request one-shot
//! operations such as credential rotations.

pub mod v1alpha1 {
    use std::collections::BTreeMap;
    use std::fmt;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
    use kube::api::ObjectMeta;
    use kube::{CustomResource, Resource, ResourceExt};
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    /// Prefix of every Kubernetes object the operator creates for a cluster.
    pub const RESOURCE_PREFIX: &str = "silo";

    /// Annotation requesting a credential rotation. The value is an
    /// operator-chosen rotation id; re-requesting with the id of the last
    /// completed rotation is recognized as stale and cleaned up.
    pub const ROTATE_USERS_ANNOTATION: &str = "silo.dev/rotate-system-users";

    /// Annotation confirming that old passwords may be discarded. The value
    /// must be the id of the rotation awaiting confirmation.
    pub const DISCARD_OLD_PASSWORDS_ANNOTATION: &str = "silo.dev/discard-old-passwords";

    /// Annotation recording which rotation produced a secret or pod
    /// template. The discard step refuses to run until this marker has
    /// propagated to the pod template and the distributed secrets.
    pub const ROTATION_ID_ANNOTATION: &str = "silo.dev/rotation-id";

    /// Annotation on a StatefulSet that suspends partitioned rollouts.
    pub const FORCE_ROLLING_UPDATE_ANNOTATION: &str = "silo.dev/force-rolling-update";

    /// Label carrying the owning cluster's name.
    pub const CLUSTER_LABEL: &str = "silo.dev/cluster";

    /// Label carrying the component type of a managed object.
    pub const COMPONENT_LABEL: &str = "silo.dev/component";

    /// Component label value for the MySQL StatefulSet and its pods.
    pub const MYSQL_COMPONENT: &str = "mysql";

    /// Status condition type reporting overall cluster health.
    pub const HEALTHY_CONDITION: &str = "Healthy";

    #[derive(
        CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize,
    )]
    #[serde(rename_all = "camelCase")]
    #[kube(
        namespaced,
        group = "silo.dev",
        version = "v1alpha1",
        kind = "MySqlCluster",
        singular = "mysqlcluster",
        plural = "mysqlclusters",
        shortname = "msc",
        status = "MySqlClusterStatus",
        printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicas"}"#,
        printcolumn = r#"{"name": "Rotation", "type": "string", "jsonPath": ".status.rotation.phase"}"#,
        printcolumn = r#"{"name": "Primary", "type": "integer", "jsonPath": ".status.currentPrimaryIndex"}"#
    )]
    pub struct MySqlClusterSpec {
        /// Number of MySQL instances. One is elected primary, the rest run
        /// as read-only replicas.
        pub replicas: i32,
        /// Container image for the MySQL server.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub image: Option<String>,
    }

    #[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MySqlClusterStatus {
        /// Conditions reported by the clustering reconciler, most notably
        /// `Healthy`.
        #[serde(default)]
        pub conditions: Vec<Condition>,
        /// The generation of `spec` that the operator most recently
        /// finished reconciling.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub reconciled_generation: Option<i64>,
        /// Ordinal of the instance currently acting as primary.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub current_primary_index: Option<i32>,
        /// Durable state of the credential-rotation machine.
        #[serde(default)]
        pub rotation: RotationStatus,
    }

    /// Where a credential rotation stands. Persisted before and after every
    /// mutating step so an interrupted rotation resumes exactly where it
    /// stopped.
    #[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RotationStatus {
        #[serde(default)]
        pub phase: RotationPhase,
        /// Id of the rotation in flight. Empty while idle.
        #[serde(default)]
        pub rotation_id: String,
        /// Id of the most recently completed rotation.
        #[serde(default)]
        pub last_rotation_id: String,
        /// True once every instance holds the new password alongside the
        /// old one.
        #[serde(default)]
        pub rotate_applied: bool,
        /// True once every instance has dropped the old password.
        #[serde(default)]
        pub discard_applied: bool,
    }

    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
    pub enum RotationPhase {
        /// No rotation in flight.
        #[default]
        Idle,
        /// New passwords are being installed alongside the old ones.
        Rotating,
        /// New passwords are distributed; waiting for the fleet to roll and
        /// for a discard confirmation.
        Rotated,
    }

    impl fmt::Display for RotationPhase {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(
                f,
                "{}",
                match self {
                    Self::Idle => "Idle",
                    Self::Rotating => "Rotating",
                    Self::Rotated => "Rotated",
                }
            )
        }
    }

    impl MySqlCluster {
        pub fn namespace(&self) -> String {
            // `MySqlCluster` is namespaced, so this is infallible.
            self.meta().namespace.clone().unwrap()
        }

        pub fn status(&self) -> MySqlClusterStatus {
            self.status.clone().unwrap_or_default()
        }

        pub fn statefulset_name(&self) -> String {
            format!("{}-{}", RESOURCE_PREFIX, self.name_unchecked())
        }

        /// The headless service governing the StatefulSet's pod DNS.
        pub fn headless_service_name(&self) -> String {
            self.statefulset_name()
        }

        /// The service that always points at the current primary.
        pub fn primary_service_name(&self) -> String {
            format!("{}-primary", self.statefulset_name())
        }

        pub fn pod_name(&self, ordinal: i32) -> String {
            format!("{}-{}", self.statefulset_name(), ordinal)
        }

        pub fn pod_fqdn(&self, ordinal: i32) -> String {
            format!(
                "{}.{}.{}.svc",
                self.pod_name(ordinal),
                self.headless_service_name(),
                self.namespace()
            )
        }

        pub fn primary_fqdn(&self) -> String {
            format!("{}.{}.svc", self.primary_service_name(), self.namespace())
        }

        /// The secret holding the authoritative system-user passwords.
        pub fn system_users_secret_name(&self) -> String {
            format!("{}-system-users-{}", RESOURCE_PREFIX, self.name_unchecked())
        }

        /// The secret holding not-yet-promoted passwords during a rotation.
        pub fn pending_system_users_secret_name(&self) -> String {
            format!(
                "{}-system-users-pending-{}",
                RESOURCE_PREFIX,
                self.name_unchecked()
            )
        }

        /// The rotation id requested via annotation, if any.
        pub fn rotation_requested(&self) -> Option<String> {
            self.annotations().get(ROTATE_USERS_ANNOTATION).cloned()
        }

        /// The rotation id whose discard is confirmed via annotation, if
        /// any.
        pub fn discard_requested(&self) -> Option<String> {
            self.annotations()
                .get(DISCARD_OLD_PASSWORDS_ANNOTATION)
                .cloned()
        }

        pub fn current_primary_index(&self) -> i32 {
            self.status
                .as_ref()
                .and_then(|status| status.current_primary_index)
                .unwrap_or(0)
        }

        pub fn is_healthy(&self) -> bool {
            self.status
                .as_ref()
                .map(|status| &status.conditions)
                .into_iter()
                .flatten()
                .any(|condition| condition.type_ == HEALTHY_CONDITION && condition.status == "True")
        }

        pub fn default_labels(&self) -> BTreeMap<String, String> {
            BTreeMap::from([
                (CLUSTER_LABEL.to_owned(), self.name_unchecked()),
                (COMPONENT_LABEL.to_owned(), MYSQL_COMPONENT.to_owned()),
            ])
        }

        /// Metadata for an object owned by this cluster: same namespace,
        /// the standard labels, and an owner reference so deletion cascades.
        pub fn managed_resource_meta(&self, name: String) -> ObjectMeta {
            ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace()),
                labels: Some(self.default_labels()),
                owner_references: self.controller_owner_ref(&()).map(|meta| vec![meta]),
                ..Default::default()
            }
        }
    }

}
