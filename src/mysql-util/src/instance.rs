// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Administrative access to a single MySQL instance.
//!
//! Credential rotation relies on MySQL 8 dual passwords: `ALTER USER ...
//! RETAIN CURRENT PASSWORD` installs a new primary password while keeping
//! the old one valid, and `ALTER USER ... DISCARD OLD PASSWORD` drops the
//! old one once every consumer has moved. Every statement here runs with
//! `sql_log_bin = 0`: rotations are applied to each instance directly and
//! must never travel through replication.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder};
use tracing::{debug, info};

use crate::{quote_identifier, quote_literal, MySqlError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE_MS: u32 = 60_000;

/// The host all managed system users are defined for.
const SYSTEM_USER_HOST: &str = "%";

/// Administrative statements issued to one MySQL instance.
///
/// Handles are built per (instance, credential) pair: while a rotation is in
/// flight, callers decide whether to authenticate with the old or the new
/// admin password depending on which one is known to be valid everywhere.
#[async_trait]
pub trait InstanceOps: Send {
    /// Reports whether `user` currently retains a secondary password.
    async fn has_dual_password(&mut self, user: &str) -> Result<bool, MySqlError>;

    /// Installs `password` as `user`'s primary password, retaining the
    /// current one as the secondary.
    async fn rotate_user_password(&mut self, user: &str, password: &str)
        -> Result<(), MySqlError>;

    /// Drops `user`'s retained secondary password.
    async fn discard_old_password(&mut self, user: &str) -> Result<(), MySqlError>;

    /// Re-hashes `user`'s password under `plugin`.
    async fn migrate_auth_plugin(
        &mut self,
        user: &str,
        password: &str,
        plugin: &str,
    ) -> Result<(), MySqlError>;

    /// Toggles `super_read_only`. Replicas keep it enabled; it must be
    /// lifted for the duration of an `ALTER USER` and restored afterwards.
    async fn set_super_read_only(&mut self, enabled: bool) -> Result<(), MySqlError>;

    /// The instance's default authentication plugin, the target for
    /// re-hashing after a rotation.
    async fn default_auth_plugin(&mut self) -> Result<String, MySqlError>;
}

/// Builds [`InstanceOps`] handles for the instances of one cluster. The
/// rotation machine names instances by StatefulSet ordinal; implementations
/// decide how an ordinal maps to an address.
#[async_trait]
pub trait InstanceConnector: Send + Sync {
    async fn connect(
        &self,
        ordinal: i32,
        user: &str,
        password: &str,
    ) -> Result<Box<dyn InstanceOps>, MySqlError>;
}

#[derive(Clone, Debug)]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
}

/// A live administrative connection to one MySQL instance.
pub struct MySqlInstance {
    conn: Conn,
    host: String,
    statement_timeout: Duration,
}

impl MySqlInstance {
    pub async fn connect(config: InstanceConfig) -> Result<Self, MySqlError> {
        info!(host = %config.host, user = %config.user, "connecting to mysql instance");
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user))
            .pass(Some(config.password))
            .tcp_keepalive(Some(TCP_KEEPALIVE_MS))
            .into();
        let conn = match tokio::time::timeout(config.connect_timeout, Conn::new(opts)).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(MySqlError::ConnectionTimeout {
                    host: config.host,
                    timeout: config.connect_timeout,
                })
            }
        };
        let mut instance = Self {
            conn,
            host: config.host,
            statement_timeout: config.statement_timeout,
        };
        instance
            .conn
            .query_drop("SET SESSION sql_log_bin = 0")
            .await?;
        Ok(instance)
    }
}

#[async_trait]
impl InstanceOps for MySqlInstance {
    async fn has_dual_password(&mut self, user: &str) -> Result<bool, MySqlError> {
        let retained: Option<bool> = timed(
            &self.host,
            self.statement_timeout,
            self.conn.exec_first(DUAL_PASSWORD_QUERY, (user,)),
        )
        .await?;
        Ok(retained.unwrap_or(false))
    }

    async fn rotate_user_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<(), MySqlError> {
        debug!(host = %self.host, user, "rotating password");
        let stmt = rotate_password_stmt(user, password);
        timed(&self.host, self.statement_timeout, self.conn.query_drop(stmt)).await
    }

    async fn discard_old_password(&mut self, user: &str) -> Result<(), MySqlError> {
        debug!(host = %self.host, user, "discarding old password");
        let stmt = discard_old_password_stmt(user);
        timed(&self.host, self.statement_timeout, self.conn.query_drop(stmt)).await
    }

    async fn migrate_auth_plugin(
        &mut self,
        user: &str,
        password: &str,
        plugin: &str,
    ) -> Result<(), MySqlError> {
        debug!(host = %self.host, user, plugin, "migrating auth plugin");
        let stmt = migrate_auth_plugin_stmt(user, plugin, password);
        timed(&self.host, self.statement_timeout, self.conn.query_drop(stmt)).await
    }

    async fn set_super_read_only(&mut self, enabled: bool) -> Result<(), MySqlError> {
        debug!(host = %self.host, enabled, "setting super_read_only");
        let stmt = set_super_read_only_stmt(enabled);
        timed(&self.host, self.statement_timeout, self.conn.query_drop(stmt)).await
    }

    async fn default_auth_plugin(&mut self) -> Result<String, MySqlError> {
        timed(
            &self.host,
            self.statement_timeout,
            query_sys_var(&mut self.conn, "default_authentication_plugin"),
        )
        .await
    }
}

/// Query a MySQL System Variable
pub async fn query_sys_var(conn: &mut Conn, name: &str) -> Result<String, MySqlError> {
    let value: String = conn
        .query_first(format!("SELECT @@{}", name))
        .await?
        .unwrap();
    Ok(value)
}

async fn timed<T, E>(
    host: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, MySqlError>
where
    MySqlError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(MySqlError::StatementTimeout {
            host: host.to_string(),
            timeout: limit,
        }),
    }
}

const DUAL_PASSWORD_QUERY: &str = "SELECT User_attributes->>'$.additional_password' IS NOT NULL \
     FROM mysql.user WHERE User = ? AND Host = '%'";

fn rotate_password_stmt(user: &str, password: &str) -> String {
    format!(
        "ALTER USER {}@'{}' IDENTIFIED BY {} RETAIN CURRENT PASSWORD",
        quote_literal(user),
        SYSTEM_USER_HOST,
        quote_literal(password),
    )
}

fn discard_old_password_stmt(user: &str) -> String {
    format!(
        "ALTER USER {}@'{}' DISCARD OLD PASSWORD",
        quote_literal(user),
        SYSTEM_USER_HOST,
    )
}

fn migrate_auth_plugin_stmt(user: &str, plugin: &str, password: &str) -> String {
    format!(
        "ALTER USER {}@'{}' IDENTIFIED WITH {} BY {}",
        quote_literal(user),
        SYSTEM_USER_HOST,
        quote_identifier(plugin),
        quote_literal(password),
    )
}

fn set_super_read_only_stmt(enabled: bool) -> &'static str {
    if enabled {
        "SET GLOBAL super_read_only = ON"
    } else {
        "SET GLOBAL super_read_only = OFF"
    }
}
