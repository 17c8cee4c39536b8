//! Process configuration read from the environment.

use std::env;

use crate::error::{Error, Result};

/// Root directory for all persisted state; the data layout lives under
/// `$ROOT_PATH/data`.
pub fn root_path() -> String {
    env::var("ROOT_PATH").unwrap_or_else(|_| ".".to_string())
}

/// Absolute path of a location inside the data directory.
pub fn data_path(relative: &str) -> String {
    format!("{}/data/{}", root_path(), relative)
}

/// One Copernicus OAuth credential pair.
#[derive(Debug, Clone)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: String,
}

/// Credential pairs from the comma-separated `COPERNICUS_CLIENT_ID` /
/// `COPERNICUS_CLIENT_SECRET` variables, tried in order per request.
pub fn copernicus_credentials() -> Result<Vec<Credential>> {
    let ids = env::var("COPERNICUS_CLIENT_ID").unwrap_or_default();
    let secrets = env::var("COPERNICUS_CLIENT_SECRET").unwrap_or_default();
    if ids.is_empty() || secrets.is_empty() {
        return Err(Error::Auth(
            "missing COPERNICUS_CLIENT_ID or COPERNICUS_CLIENT_SECRET".to_string(),
        ));
    }

    let id_list: Vec<&str> = ids.split(',').collect();
    let secret_list: Vec<&str> = secrets.split(',').collect();
    if id_list.len() != secret_list.len() {
        return Err(Error::Auth(
            "mismatched number of client IDs and secrets".to_string(),
        ));
    }

    Ok(id_list
        .into_iter()
        .zip(secret_list)
        .map(|(id, secret)| Credential {
            client_id: id.trim().to_string(),
            client_secret: secret.trim().to_string(),
        })
        .collect())
}

pub fn copernicus_token_url() -> Result<String> {
    env::var("COPERNICUS_TOKEN_URL")
        .map_err(|_| Error::Auth("missing COPERNICUS_TOKEN_URL".to_string()))
}

pub fn discord_error_notification_url() -> String {
    env::var("DISCORD_ERROR_NOTIFICATION_URL").unwrap_or_default()
}

pub fn discord_success_notification_url() -> String {
    env::var("DISCORD_SUCCESS_NOTIFICATION_URL").unwrap_or_default()
}
