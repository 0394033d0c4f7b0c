// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prints the `MySqlCluster` custom resource definition as JSON, for
//! registration with a cluster or for generating docs.

use kube::CustomResourceExt;

use silo_cluster_resources::crd::mysqlcluster::v1alpha1::MySqlCluster;

fn main() {
    let crd = MySqlCluster::crd();
    println!("{}", serde_json::to_string_pretty(&crd).unwrap());
}
