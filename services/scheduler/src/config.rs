//! Scheduler configuration, read from `KFLEET_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Mesos master base URL.
    pub master_url: String,

    pub framework_name: String,
    pub framework_user: String,

    /// Listen address for the artifact/admin HTTP server.
    pub listen_addr: SocketAddr,

    /// Base URL executors use to fetch artifacts; must be reachable from
    /// the agents.
    pub advertised_url: String,

    /// Cluster snapshot location.
    pub storage_path: PathBuf,

    /// Directory holding the executor jar and the Kafka distribution.
    pub artifact_dir: PathBuf,

    pub executor_jar: String,
    pub kafka_dist: String,

    /// `zookeeper.connect` injected into every broker's properties.
    pub zookeeper_connect: String,

    /// Attach a JDWP agent to launched executors.
    pub jvm_debug: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let master_url =
            std::env::var("KFLEET_MASTER_URL").unwrap_or_else(|_| "http://127.0.0.1:5050".into());

        let framework_name =
            std::env::var("KFLEET_FRAMEWORK_NAME").unwrap_or_else(|_| "kfleet".into());
        let framework_user =
            std::env::var("KFLEET_FRAMEWORK_USER").unwrap_or_else(|_| "root".into());

        let listen_addr = std::env::var("KFLEET_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:7000".into())
            .parse()
            .context("invalid KFLEET_LISTEN_ADDR")?;

        let advertised_url = std::env::var("KFLEET_ADVERTISED_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:7000".into());

        let storage_path = std::env::var("KFLEET_STORAGE_PATH")
            .unwrap_or_else(|_| "kfleet-cluster.json".into())
            .into();
        let artifact_dir = std::env::var("KFLEET_ARTIFACT_DIR")
            .unwrap_or_else(|_| ".".into())
            .into();

        let executor_jar = std::env::var("KFLEET_EXECUTOR_JAR")
            .unwrap_or_else(|_| "kfleet-executor.jar".into());
        let kafka_dist = std::env::var("KFLEET_KAFKA_DIST").unwrap_or_else(|_| "kafka.tgz".into());

        let zookeeper_connect =
            std::env::var("KFLEET_ZK_CONNECT").unwrap_or_else(|_| "127.0.0.1:2181".into());

        let jvm_debug = std::env::var("KFLEET_JVM_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            master_url,
            framework_name,
            framework_user,
            listen_addr,
            advertised_url,
            storage_path,
            artifact_dir,
            executor_jar,
            kafka_dist,
            zookeeper_connect,
            jvm_debug,
        })
    }
}
