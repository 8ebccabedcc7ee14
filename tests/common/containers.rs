// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for the Postgres and MySQL replicas.
//!
//! Each helper starts a container, waits for the server, connects a pool
//! and creates the `orders`/`payments` schema.

use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

const PASSWORD: &str = "replica";
const DATABASE: &str = "orders";

const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS orders (
        order_id BIGINT PRIMARY KEY,
        customer_id INT NOT NULL,
        order_date TIMESTAMP NOT NULL,
        total_amount NUMERIC(12, 2) NOT NULL,
        state VARCHAR(32) NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS payments (
        payment_id BIGINT PRIMARY KEY,
        order_id BIGINT NOT NULL,
        payment_date TIMESTAMP NULL,
        payment_amount NUMERIC(12, 2) NULL,
        payment_method VARCHAR(32) NULL,
        state VARCHAR(32) NULL
    )",
];

const MYSQL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS orders (
        order_id BIGINT PRIMARY KEY,
        customer_id INT NOT NULL,
        order_date DATETIME(6) NOT NULL,
        total_amount DECIMAL(12, 2) NOT NULL,
        state VARCHAR(32) NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS payments (
        payment_id BIGINT PRIMARY KEY,
        order_id BIGINT NOT NULL,
        payment_date DATETIME(6) NULL,
        payment_amount DECIMAL(12, 2) NULL,
        payment_method VARCHAR(32) NULL,
        state VARCHAR(32) NULL
    )",
];

/// Postgres 16. Waits for the second "ready" line (after the init restart).
pub fn postgres_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_env_var("POSTGRES_PASSWORD", PASSWORD)
        .with_env_var("POSTGRES_DB", DATABASE)
        .with_exposed_port(5432)
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ));
    docker.run(image)
}

pub fn postgres_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(5432);
    format!("postgres://postgres:{}@127.0.0.1:{}/{}", PASSWORD, port, DATABASE)
}

/// MySQL 8.0.
pub fn mysql_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("mysql", "8.0")
        .with_env_var("MYSQL_ROOT_PASSWORD", PASSWORD)
        .with_env_var("MYSQL_DATABASE", DATABASE)
        .with_exposed_port(3306)
        .with_wait_for(WaitFor::message_on_stderr("port: 3306  MySQL Community Server"));
    docker.run(image)
}

pub fn mysql_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(3306);
    format!("mysql://root:{}@127.0.0.1:{}/{}", PASSWORD, port, DATABASE)
}

/// Connect to a fresh Postgres container and create the schema.
///
/// The server can still refuse connections right after the log line, so
/// connecting is retried for a few seconds.
pub async fn postgres_pool(url: &str) -> PgPool {
    let mut last_error = None;
    for _ in 0..30 {
        match PgPoolOptions::new().max_connections(5).connect(url).await {
            Ok(pool) => {
                for statement in POSTGRES_SCHEMA {
                    sqlx::query(statement).execute(&pool).await.unwrap();
                }
                return pool;
            }
            Err(e) => {
                last_error = Some(e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
    panic!("Postgres never accepted connections: {:?}", last_error);
}

/// Connect to a fresh MySQL container and create the schema.
pub async fn mysql_pool(url: &str) -> MySqlPool {
    let mut last_error = None;
    for _ in 0..60 {
        match MySqlPoolOptions::new().max_connections(5).connect(url).await {
            Ok(pool) => {
                for statement in MYSQL_SCHEMA {
                    sqlx::query(statement).execute(&pool).await.unwrap();
                }
                return pool;
            }
            Err(e) => {
                last_error = Some(e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
    panic!("MySQL never accepted connections: {:?}", last_error);
}

/// A running replica pair, kept alive for the test's lifetime.
pub struct TestReplicas<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    postgres: Container<'a, GenericImage>,
    #[allow(dead_code)]
    mysql: Container<'a, GenericImage>,
    pub postgres_url: String,
    pub mysql_url: String,
    pub pg_pool: PgPool,
    pub mysql_pool: MySqlPool,
}

impl<'a> TestReplicas<'a> {
    pub async fn start(docker: &'a Cli) -> TestReplicas<'a> {
        let postgres = postgres_container(docker);
        let mysql = mysql_container(docker);
        let postgres_url = postgres_url(&postgres);
        let mysql_url = mysql_url(&mysql);
        let pg_pool = postgres_pool(&postgres_url).await;
        let mysql_pool = mysql_pool(&mysql_url).await;
        Self {
            postgres,
            mysql,
            postgres_url,
            mysql_url,
            pg_pool,
            mysql_pool,
        }
    }
}
