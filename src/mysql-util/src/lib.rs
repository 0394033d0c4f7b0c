// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! MySQL utility library for the Silo operator: GTID-set bookkeeping, the
//! per-instance administration interface, and the managed system-user
//! roster.

use std::time::Duration;

pub mod gtid;
pub mod instance;

pub use gtid::{Gtid, GtidError, GtidInterval, GtidSet, GtidSetRelation};
pub use instance::{InstanceConfig, InstanceConnector, InstanceOps, MySqlInstance};

/// The user the operator itself connects as.
pub const ADMIN_USER: &str = "silo-admin";
/// The user the in-pod agent sidecar connects as.
pub const AGENT_USER: &str = "silo-agent";
/// The user the metrics exporter connects as.
pub const EXPORTER_USER: &str = "silo-exporter";
/// The user backup jobs connect as.
pub const BACKUP_USER: &str = "silo-backup";

/// Every system user whose password the operator owns. Rotations walk this
/// list in order on each instance.
pub const SYSTEM_USERS: &[&str] = &[ADMIN_USER, AGENT_USER, EXPORTER_USER, BACKUP_USER];

#[derive(Debug, thiserror::Error)]
pub enum MySqlError {
    #[error("connection to {host} timed out after {timeout:?}")]
    ConnectionTimeout { host: String, timeout: Duration },
    #[error("statement on {host} timed out after {timeout:?}")]
    StatementTimeout { host: String, timeout: Duration },
    /// Any other error we bail on.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
    /// A mysql_async error.
    #[error(transparent)]
    MySql(#[from] mysql_async::Error),
}

/// Quotes MySQL identifiers. [See MySQL quote_identifier()](https://github.com/mysql/mysql-sys/blob/master/functions/quote_identifier.sql)
pub fn quote_identifier(identifier: &str) -> String {
    let mut escaped = identifier.replace("`", "``");
    escaped.insert(0, '`');
    escaped.push('`');
    escaped
}

/// Quotes a MySQL string literal for interpolation into a statement that
/// does not accept placeholders, like `ALTER USER`.
pub fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\\', r"\\").replace('\'', "''"))
}
