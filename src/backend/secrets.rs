//! Secrets Manager lookups.

use async_trait::async_trait;
use aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueError;
use aws_sdk_secretsmanager::Client;

use super::{load_sdk_config, map_sdk_error};
use crate::config::{AwsConfig, AwsService};
use crate::connection::{Connector, Refreshing};
use crate::error::{require, Result, TetherError};

/// Builds Secrets Manager clients.
pub struct SecretsConnector {
    config: AwsConfig,
}

#[async_trait]
impl Connector for SecretsConnector {
    type Handle = Client;

    fn name(&self) -> &str {
        "secretsmanager"
    }

    async fn connect(&self) -> Result<Client> {
        let sdk_config = load_sdk_config(&self.config).await;
        let mut builder = aws_sdk_secretsmanager::config::Builder::from(&sdk_config);
        if let Some(endpoint) = self.config.endpoint_for(AwsService::SecretsManager) {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(Client::from_conf(builder.build()))
    }
}

/// A stored secret value.
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    /// A string secret.
    Text(String),
    /// A binary secret.
    Binary(Vec<u8>),
}

impl Secret {
    /// The text value, if this is a string secret.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }
}

// never print secret material
impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(_) => f.write_str("Secret::Text(***)"),
            Self::Binary(b) => write!(f, "Secret::Binary({} bytes)", b.len()),
        }
    }
}

/// Secrets Manager operations over a refreshing client.
#[derive(Clone)]
pub struct SecretStore {
    clients: Refreshing<SecretsConnector>,
}

impl SecretStore {
    /// Create a secret store.
    pub fn new(config: AwsConfig) -> Self {
        let expiry = config.expiry;
        Self {
            clients: Refreshing::new(SecretsConnector { config }, expiry),
        }
    }

    /// The client provider.
    pub fn clients(&self) -> &Refreshing<SecretsConnector> {
        &self.clients
    }

    /// Fetch the current value of a secret, or `None` if it does not exist.
    pub async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        require("secret", name)?;
        self.clients
            .with_handle(|client| async move {
                let response = match client.get_secret_value().secret_id(name).send().await {
                    Ok(response) => response,
                    Err(err) => {
                        if matches!(
                            err.as_service_error(),
                            Some(GetSecretValueError::ResourceNotFoundException(_))
                        ) {
                            return Ok(None);
                        }
                        return Err(map_sdk_error(&err, TetherError::Storage));
                    }
                };

                if let Some(text) = response.secret_string() {
                    return Ok(Some(Secret::Text(text.to_string())));
                }
                Ok(response
                    .secret_binary()
                    .map(|blob| Secret::Binary(blob.as_ref().to_vec())))
            })
            .await
    }
}
