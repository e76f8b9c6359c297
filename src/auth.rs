//! OAuth2 installed-flow authentication for the Gmail API

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use std::path::Path;

use crate::error::{JanitorError, Result};
use crate::gmail::{GmailConnector, LABELS_SCOPE, MODIFY_SCOPE};

/// Scopes the janitor needs: read and relabel messages, manage labels.
/// Nothing is ever deleted, so full mail access is not requested.
pub const REQUIRED_SCOPES: &[&str] = &[MODIFY_SCOPE, LABELS_SCOPE];

pub type GmailHub = Gmail<GmailConnector>;

/// Build an authenticated Gmail hub.
///
/// The first call opens a browser for consent; the token is cached at
/// `token_cache_path` and refreshed automatically afterwards.
pub async fn initialize_gmail_hub(
    credentials_path: &Path,
    token_cache_path: &Path,
) -> Result<GmailHub> {
    if !credentials_path.exists() {
        return Err(JanitorError::AuthError(format!(
            "Credentials file not found at {:?}. Download an OAuth client (desktop app) from the Google Cloud console.",
            credentials_path
        )));
    }

    let secret = yup_oauth2::read_application_secret(credentials_path)
        .await
        .map_err(|e| JanitorError::AuthError(format!("Failed to read credentials: {}", e)))?;

    if let Some(parent) = token_cache_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| JanitorError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    // Fetch once up front so the cached token carries every scope
    auth.token(REQUIRED_SCOPES)
        .await
        .map_err(|e| JanitorError::AuthError(format!("Failed to obtain token: {}", e)))?;

    secure_token_file(token_cache_path).await?;

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| JanitorError::AuthError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, auth))
}

/// Restrict the token cache to the owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if !path.exists() {
        return Ok(());
    }
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}
