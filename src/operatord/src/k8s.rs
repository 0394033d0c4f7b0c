// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Small wrappers over the Kubernetes API: 404-tolerant reads and deletes,
//! server-side apply under a fixed field manager, and event publishing.

use std::fmt::Debug;

use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The field manager the operator applies objects under.
pub const FIELD_MANAGER: &str = "silo-operatord";

pub async fn get_resource<K>(api: &Api<K>, name: &str) -> Result<Option<K>, kube::Error>
where
    K: Clone + Debug + DeserializeOwned,
{
    match api.get(name).await {
        Ok(resource) => Ok(Some(resource)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn apply_resource<K>(api: &Api<K>, resource: &K) -> Result<(), kube::Error>
where
    K: Clone + Debug + DeserializeOwned + Resource + Serialize,
{
    api.patch(
        &resource.name_unchecked(),
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(resource),
    )
    .await?;
    Ok(())
}

pub async fn delete_resource<K>(api: &Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: Clone + Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

/// Publishes an Event attached to `object`. The note should always tell the
/// operator what happens next (or what they must do) rather than just what
/// went wrong.
pub async fn publish_event<K>(
    client: Client,
    object: &K,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) -> Result<(), kube::Error>
where
    K: Resource<DynamicType = ()>,
{
    let recorder = Recorder::new(
        client,
        Reporter {
            controller: FIELD_MANAGER.into(),
            instance: None,
        },
        object.object_ref(&()),
    );
    recorder
        .publish(Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: action.into(),
            secondary: None,
        })
        .await
}
