// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Silo operator daemon: reconciles `MySqlCluster` resources (system
//! user credentials and their rotation) and drives partitioned StatefulSet
//! rollouts one pod at a time.

use std::fmt::{self, Display};

pub mod controller;
pub mod k8s;
pub mod metrics;
pub mod secrets;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Anyhow(#[from] anyhow::Error),
    Kube(#[from] kube::Error),
    MySql(#[from] silo_mysql_util::MySqlError),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anyhow(e) => write!(f, "{e}"),
            Self::Kube(e) => write!(f, "{e}"),
            Self::MySql(e) => write!(f, "{e}"),
        }
    }
}
