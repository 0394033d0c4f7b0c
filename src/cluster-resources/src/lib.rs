// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Kubernetes custom resource definitions for Silo MySQL clusters, plus the
//! naming and metadata conventions shared by everything the operator
//! manages.

pub mod crd;
