// @zen-component: BKD-BackendConfig
//
//! Connection settings for the managed identity backend.

use std::env;

use url::Url;

use crate::auth::AuthError;

/// Default RPC that returns profile, role and permissions for a user.
pub const DEFAULT_DETAILS_RPC: &str = "get_user_details";

/// Where the backend lives and how to address it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Project root, always ending in `/` so relative joins append.
    pub base_url: Url,
    /// Public (anonymous) API key sent as `apikey` on every request.
    pub anon_key: String,
    /// Name of the extended-details RPC under `/rest/v1/rpc/`.
    pub details_rpc: String,
}

impl BackendConfig {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, AuthError> {
        Ok(Self {
            base_url: normalize_base(base_url)?,
            anon_key: anon_key.into(),
            details_rpc: DEFAULT_DETAILS_RPC.to_string(),
        })
    }

    /// Load from environment variables.
    ///
    /// | Variable               | Required | Default            |
    /// |------------------------|----------|--------------------|
    /// | `OPSDASH_BACKEND_URL`  | yes      |                    |
    /// | `OPSDASH_ANON_KEY`     | yes      |                    |
    /// | `OPSDASH_DETAILS_RPC`  | no       | `get_user_details` |
    pub fn from_env() -> Result<Self, AuthError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AuthError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base_url = present("OPSDASH_BACKEND_URL")
            .ok_or_else(|| AuthError::Config("OPSDASH_BACKEND_URL is required".to_string()))?;
        let anon_key = present("OPSDASH_ANON_KEY")
            .ok_or_else(|| AuthError::Config("OPSDASH_ANON_KEY is required".to_string()))?;

        let mut config = Self::new(base_url.trim(), anon_key.trim())?;
        if let Some(rpc) = present("OPSDASH_DETAILS_RPC") {
            config.details_rpc = rpc.trim().to_string();
        }
        Ok(config)
    }

    /// Resolve a path relative to the project root.
    pub fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }
}

fn normalize_base(raw: &str) -> Result<Url, AuthError> {
    let mut url = Url::parse(raw)?;
    if url.cannot_be_a_base() {
        return Err(AuthError::Config(format!(
            "OPSDASH_BACKEND_URL cannot be used as a base: {raw}"
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
