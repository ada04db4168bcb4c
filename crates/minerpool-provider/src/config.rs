//! Provider, provisioning and remote-shell configuration

use std::path::PathBuf;
use std::time::Duration;

use minerpool_state::OpenPort;
use serde::{Deserialize, Serialize};

/// VM provider API configuration
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Provider API base URL
    pub api_url: String,
    /// Bearer token for the provider API
    pub api_key: Option<String>,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            api_url: std::env::var("MINERPOOL_PROVIDER_URL")
                .unwrap_or_else(|_| "https://api.fluence.dev".to_string()),
            api_key: std::env::var("MINERPOOL_PROVIDER_API_KEY")
                .or_else(|_| std::env::var("FLUENCE_API_KEY"))
                .ok(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ProviderConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Create config for a specific endpoint
    pub fn new(api_url: &str) -> Self {
        ProviderConfig {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Set authentication token
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Credentials and limits for the remote shell
#[derive(Debug, Clone)]
pub struct SshCredentials {
    /// Login user on the VM
    pub user: String,
    /// Private key file
    pub key_path: PathBuf,
    /// SSH port
    pub port: u16,
    /// Time allowed to establish the connection
    pub connect_timeout: Duration,
    /// Wall-clock limit for a single remote command
    pub command_timeout: Duration,
}

impl Default for SshCredentials {
    fn default() -> Self {
        SshCredentials {
            user: std::env::var("MINERPOOL_SSH_USER").unwrap_or_else(|_| "ubuntu".to_string()),
            key_path: std::env::var("MINERPOOL_SSH_KEY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("keys/fluence")),
            port: 22,
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(90),
        }
    }
}

impl SshCredentials {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn new(user: &str, key_path: impl Into<PathBuf>) -> Self {
        SshCredentials {
            user: user.to_string(),
            key_path: key_path.into(),
            ..Self::default()
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Machine shape requested when the pool has to provision a new VM
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionSpec {
    pub basic_configuration: String,
    pub max_total_price_per_epoch_usd: String,
    pub instances: u32,
    pub os_image: String,
    pub open_ports: Vec<OpenPort>,
    pub ssh_keys: Vec<String>,
}

impl Default for ProvisionSpec {
    fn default() -> Self {
        ProvisionSpec {
            basic_configuration: "cpu-4-ram-8gb-storage-25gb".to_string(),
            max_total_price_per_epoch_usd: "1.5".to_string(),
            instances: 1,
            os_image:
                "https://cloud-images.ubuntu.com/focal/current/focal-server-cloudimg-amd64.img"
                    .to_string(),
            open_ports: vec![OpenPort::tcp(22), OpenPort::tcp(3000)],
            ssh_keys: std::env::var("MINERPOOL_SSH_PUBLIC_KEYS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

impl ProvisionSpec {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Render the provider's create-VM request body for a VM named `name`.
    pub fn request_body(&self, name: &str) -> serde_json::Value {
        let name = if name.trim().is_empty() {
            "default-vm"
        } else {
            name
        };
        serde_json::json!({
            "constraints": {
                "basicConfiguration": self.basic_configuration,
                "additionalResources": {},
                "hardware": null,
                "datacenter": null,
                "maxTotalPricePerEpochUsd": self.max_total_price_per_epoch_usd,
            },
            "instances": self.instances,
            "vmConfiguration": {
                "name": name,
                "openPorts": self.open_ports,
                "hostname": null,
                "osImage": self.os_image,
                "sshKeys": self.ssh_keys,
            },
        })
    }
}
