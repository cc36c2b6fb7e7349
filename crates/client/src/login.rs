//! HTTP login: exchanges credentials for a channel token.

use blockwire_protocol::{LoginError, LoginRequest, LoginResponse};
use tracing::{debug, warn};

use crate::ClientError;
use crate::config::ClientConfig;
use crate::tls;

/// Posts the configured credentials to `/login` and returns the token.
pub async fn login(config: &ClientConfig) -> Result<String, ClientError> {
    let mut builder = reqwest::Client::builder().timeout(config.handshake_timeout);
    if config.tls {
        builder = builder.use_preconfigured_tls(tls::client_config(config)?);
    }
    let http = builder.build()?;

    let url = config.login_url();
    debug!(%url, user = %config.username, "logging in");
    let resp = http
        .post(&url)
        .json(&LoginRequest {
            username: config.username.clone(),
            password: config.password.clone(),
        })
        .send()
        .await?;
    let status = resp.status();

    if !status.is_success() {
        let message = match resp.json::<LoginError>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        warn!(status = status.as_u16(), "login rejected: {message}");
        return Err(ClientError::Login {
            status: status.as_u16(),
            message,
        });
    }

    let body: LoginResponse = resp.json().await?;
    Ok(body.token)
}
