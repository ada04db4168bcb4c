//! REST implementation of [`VmProvider`]
//!
//! Lifecycle calls go to `{api_url}/vms/v3` with a bearer key. Remote
//! commands resolve the VM's public address from the list endpoint and run
//! over [`SshShell`].

use async_trait::async_trait;
use minerpool_state::VmId;
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::{
    extract_provisioned, parse_vm_list, CommandOutput, ProvisionedVm, ProviderVm, VmPatch,
    VmProvider,
};
use crate::config::{ProviderConfig, ProvisionSpec, SshCredentials};
use crate::error::ProviderError;
use crate::ssh::SshShell;
use crate::Result;

/// Provider client speaking the `/vms/v3` REST API
pub struct RestVmProvider {
    config: ProviderConfig,
    http_client: reqwest::Client,
}

impl RestVmProvider {
    /// Create a new client
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("minerpool/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;
        Ok(RestVmProvider {
            config,
            http_client,
        })
    }

    /// Create client from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ProviderConfig::from_env())
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/vms/v3", self.config.api_url.trim_end_matches('/'))
    }

    fn request(&self, method: Method) -> Result<RequestBuilder> {
        let key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(ProviderError::MissingApiKey)?;
        Ok(self
            .http_client
            .request(method, self.endpoint())
            .bearer_auth(key))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        // Some endpoints answer 2xx with a plain-text acknowledgement.
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    async fn resolve_host(&self, vm_id: &VmId) -> Result<String> {
        let vm = self
            .list()
            .await?
            .into_iter()
            .find(|vm| &vm.vm_id == vm_id)
            .ok_or_else(|| ProviderError::VmNotFound(vm_id.to_string()))?;
        vm.public_ip
            .ok_or_else(|| ProviderError::NoAddress(vm_id.to_string()))
    }
}

#[async_trait]
impl VmProvider for RestVmProvider {
    async fn create(&self, spec: &ProvisionSpec, name: &str) -> Result<Vec<ProvisionedVm>> {
        let body = spec.request_body(name);
        debug!(name, instances = spec.instances, "provider create");
        let value = self.send(self.request(Method::POST)?.json(&body)).await?;
        let vms = extract_provisioned(&value);
        if vms.is_empty() {
            return Err(ProviderError::Decode(format!(
                "create response carried no vm id: {value}"
            )));
        }
        info!(count = vms.len(), "provider created vms");
        Ok(vms)
    }

    async fn list(&self) -> Result<Vec<ProviderVm>> {
        let value = self.send(self.request(Method::GET)?).await?;
        if !(value.is_array() || value.is_object()) {
            return Err(ProviderError::Decode(format!(
                "list response is not JSON: {value}"
            )));
        }
        Ok(parse_vm_list(&value))
    }

    async fn update(&self, patches: &[VmPatch]) -> Result<()> {
        if patches.is_empty() {
            return Ok(());
        }
        self.send(
            self.request(Method::PATCH)?
                .json(&json!({ "updates": patches })),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, vm_ids: &[VmId]) -> Result<()> {
        if vm_ids.is_empty() {
            return Ok(());
        }
        self.send(
            self.request(Method::DELETE)?
                .json(&json!({ "vmIds": vm_ids })),
        )
        .await?;
        info!(count = vm_ids.len(), "provider deleted vms");
        Ok(())
    }

    async fn exec(
        &self,
        vm_id: &VmId,
        command: &str,
        credentials: &SshCredentials,
    ) -> Result<CommandOutput> {
        let host = self.resolve_host(vm_id).await?;
        SshShell::new(host, credentials.clone()).exec(command).await
    }

    async fn upload(
        &self,
        vm_id: &VmId,
        bytes: &[u8],
        remote_path: &str,
        credentials: &SshCredentials,
    ) -> Result<CommandOutput> {
        let host = self.resolve_host(vm_id).await?;
        SshShell::new(host, credentials.clone())
            .upload(bytes, remote_path)
            .await
    }
}
