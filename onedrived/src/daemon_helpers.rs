async fn resolve_token_state(
    config: &DaemonConfig,
    storage: &TokenStorage,
) -> anyhow::Result<OAuthState> {
    if let Some(token) = config.access_token.as_deref() {
        return Ok(OAuthState::from_access_token(token));
    }
    match storage.get_oauth_state().await {
        Ok(state) => Ok(state),
        Err(StorageError::TokenNotFound) => anyhow::bail!(
            "no token found at {}; set ONEDRIVED_TOKEN or provide a token file",
            storage.path().display()
        ),
        Err(err) => Err(err).context("failed to read token file"),
    }
}

fn oauth_client_from_settings(
    settings: Option<&OAuthSettings>,
) -> anyhow::Result<Option<OAuthClient>> {
    let Some(settings) = settings else {
        return Ok(None);
    };
    let mut client = match settings.base_url.as_deref() {
        Some(url) => OAuthClient::with_base_url(url, settings.client_id.clone()),
        None => OAuthClient::new(settings.client_id.clone()),
    }
    .context("invalid oauth configuration")?;
    if let Some(secret) = &settings.client_secret {
        client = client.with_client_secret(secret.clone());
    }
    if let Some(redirect_uri) = &settings.redirect_uri {
        client = client.with_redirect_uri(redirect_uri.clone());
    }
    Ok(Some(client))
}

fn log_quota(drive: &Drive) {
    match &drive.quota {
        Some(quota) => tracing::info!(
            drive_id = %drive.id,
            drive_type = drive.drive_type.as_deref().unwrap_or("unknown"),
            used = quota.used,
            remaining = quota.remaining,
            total = quota.total,
            state = quota.state.as_deref().unwrap_or("normal"),
            "drive ready"
        ),
        None => tracing::info!(drive_id = %drive.id, "drive ready, quota unavailable"),
    }
}
