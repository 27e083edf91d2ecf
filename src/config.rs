use crate::asset::ApiCredentials;
use crate::discovery::DEFAULT_MAX_DEPTH;
use crate::history;
use crate::publish::DEFAULT_STAGGER_SECS;
use crate::types::AnnotationField;
use anyhow::{anyhow, bail, Context};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    /// Base URL of the asset system, e.g. `https://assets.example.com`.
    pub asset_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub verify_tls: bool,
    pub tenant: String,
    pub frequency_secs: u64,
    pub annotations: Vec<AnnotationField>,
    pub vcenter_url: String,
    pub vcenter_user: String,
    pub vcenter_password: String,
    pub publish_stagger_secs: u64,
    pub max_depth: usize,
    pub history_capacity: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            asset_url: String::new(),
            credentials_file: None,
            api_key: None,
            api_secret: None,
            verify_tls: false,
            tenant: String::new(),
            frequency_secs: 300,
            annotations: AnnotationField::defaults(),
            vcenter_url: String::new(),
            vcenter_user: String::new(),
            vcenter_password: String::new(),
            publish_stagger_secs: DEFAULT_STAGGER_SECS,
            max_depth: DEFAULT_MAX_DEPTH,
            history_capacity: history::DEFAULT_CAPACITY,
            shutdown_timeout_secs: 10,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("asset_url", &self.asset_url)
            .field("credentials_file", &self.credentials_file)
            .field("api_key", &self.api_key)
            .field("verify_tls", &self.verify_tls)
            .field("tenant", &self.tenant)
            .field("frequency_secs", &self.frequency_secs)
            .field("annotations", &self.annotations)
            .field("vcenter_url", &self.vcenter_url)
            .field("vcenter_user", &self.vcenter_user)
            .field("publish_stagger_secs", &self.publish_stagger_secs)
            .field("max_depth", &self.max_depth)
            .field("history_capacity", &self.history_capacity)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("annotator.toml"))
            .merge(Json::file("annotator.json"))
            .merge(Env::prefixed("ANNOTATOR_"));
        let mut config = Self::from_figment(figment)?;

        // Support Docker-style secrets
        if let Ok(file) = std::env::var("ANNOTATOR_VCENTER_PASSWORD_FILE") {
            config.vcenter_password = read_secret(&file)?;
        }
        if let Ok(file) = std::env::var("ANNOTATOR_API_SECRET_FILE") {
            config.api_secret = Some(read_secret(&file)?);
        }

        config.validate()?;
        Ok(config)
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        figment
            .extract()
            .map_err(|e| anyhow!("Failed to load configuration: {}", e))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("asset_url", &self.asset_url),
            ("tenant", &self.tenant),
            ("vcenter_url", &self.vcenter_url),
            ("vcenter_user", &self.vcenter_user),
        ] {
            if value.trim().is_empty() {
                bail!("Missing required setting `{}`", name);
            }
        }
        if self.frequency_secs == 0 {
            bail!("`frequency_secs` must be greater than zero");
        }
        if self.annotations.is_empty() {
            bail!("`annotations` must name at least one field");
        }
        match (&self.credentials_file, &self.api_key, &self.api_secret) {
            (Some(_), None, None) | (None, Some(_), Some(_)) => Ok(()),
            (Some(_), _, _) => {
                bail!("Set either `credentials_file` or `api_key`/`api_secret`, not both")
            }
            _ => bail!(
                "Asset credentials required: `credentials_file` or `api_key` and `api_secret`"
            ),
        }
    }

    /// Resolves the asset-system API key pair.
    pub fn api_credentials(&self) -> anyhow::Result<ApiCredentials> {
        if let Some(path) = &self.credentials_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
            return serde_json::from_str(&raw)
                .with_context(|| format!("Invalid credentials file {}", path.display()));
        }
        match (&self.api_key, &self.api_secret) {
            (Some(api_key), Some(api_secret)) => Ok(ApiCredentials {
                api_key: api_key.clone(),
                api_secret: api_secret.clone(),
            }),
            _ => bail!("Asset credentials are not configured"),
        }
    }
}

fn read_secret(path: &str) -> anyhow::Result<String> {
    Ok(std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read secret file {}", path))?
        .trim()
        .to_string())
}
