//! Authorization session: cached tokens, three-step handshake, silent re-auth

use super::{token_prefix, AuthTokens, Credential, TokenCache};
use crate::api::CloudApi;
use crate::error::SydpowerResult;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

/// Everything an API-dependent operation needs to make its call
#[derive(Debug, Clone)]
pub struct CallContext {
    pub tokens: AuthTokens,
    /// Only known after a live handshake, never cached
    pub authorize_token: Option<String>,
}

impl CallContext {
    pub fn authorize_token(&self) -> Option<&str> {
        self.authorize_token.as_deref()
    }
}

pub struct AuthSession {
    credential: Credential,
    api: Arc<dyn CloudApi>,
    cache: TokenCache,
    tokens: Option<AuthTokens>,
    authorize_token: Option<String>,
}

impl AuthSession {
    pub fn new(credential: Credential, api: Arc<dyn CloudApi>, cache: TokenCache) -> Self {
        Self {
            credential,
            api,
            cache,
            tokens: None,
            authorize_token: None,
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn api(&self) -> Arc<dyn CloudApi> {
        Arc::clone(&self.api)
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    pub fn tokens(&self) -> Option<&AuthTokens> {
        self.tokens.as_ref()
    }

    /// Adopt tokens obtained elsewhere, e.g. from the pool's token cache
    pub fn set_tokens(&mut self, tokens: AuthTokens) {
        self.tokens = Some(tokens);
    }

    pub fn context(&self) -> Option<CallContext> {
        self.tokens.clone().map(|tokens| CallContext {
            tokens,
            authorize_token: self.authorize_token.clone(),
        })
    }

    /// Cached tokens if still valid, otherwise the full signed handshake.
    ///
    /// A cache hit makes no network calls.
    pub async fn authenticate(&mut self) -> SydpowerResult<AuthTokens> {
        self.credential.validate()?;

        if let Some(tokens) = self.cache.get_valid_tokens() {
            info!(account = %self.credential.masked_username(), "Using cached tokens");
            self.tokens = Some(tokens.clone());
            return Ok(tokens);
        }

        let span = crate::auth_span!(account = %self.credential.masked_username());
        let (authorize_token, tokens) = Self::handshake(self.api.as_ref(), &self.credential, &self.cache)
            .instrument(span)
            .await?;

        self.authorize_token = Some(authorize_token);
        self.tokens = Some(tokens.clone());
        Ok(tokens)
    }

    async fn handshake(
        api: &dyn CloudApi,
        credential: &Credential,
        cache: &TokenCache,
    ) -> SydpowerResult<(String, AuthTokens)> {
        let authorize_token = api.anonymous_authorize().await?;
        let access_token = api.login(&authorize_token, credential).await?;
        let mqtt_token = api
            .mqtt_token(Some(&authorize_token), &access_token)
            .await?;

        info!(mqtt_token = %token_prefix(&mqtt_token), "Handshake complete");
        let tokens = match cache.save_tokens(&access_token, &mqtt_token) {
            Ok(tokens) => tokens,
            Err(e) => {
                // The session still works without persistence
                warn!(error = %e, "Could not persist tokens");
                AuthTokens::new(access_token, mqtt_token)
            }
        };

        Ok((authorize_token, tokens))
    }

    /// Drop cached and in-memory tokens
    pub fn clear_cache(&mut self) -> SydpowerResult<()> {
        self.tokens = None;
        self.authorize_token = None;
        self.cache.clear()?;
        Ok(())
    }

    /// Forget everything and run the handshake again
    pub async fn reauthenticate(&mut self) -> SydpowerResult<AuthTokens> {
        warn!(account = %self.credential.masked_username(), "Authorization rejected, re-authenticating");
        self.clear_cache()?;
        self.authenticate().await
    }

    /// Run `op`, re-authenticating once and retrying once if it fails with an
    /// authorization error. Any other error, or a second failure, propagates.
    pub async fn api_call_with_retry<T, F, Fut>(&mut self, op: F) -> SydpowerResult<T>
    where
        F: Fn(Arc<dyn CloudApi>, CallContext) -> Fut,
        Fut: Future<Output = SydpowerResult<T>>,
    {
        let context = match self.context() {
            Some(context) => context,
            None => {
                self.authenticate().await?;
                self.context().ok_or_else(|| {
                    crate::error::SydpowerError::internal_error("authenticate left no tokens")
                })?
            }
        };

        match op(self.api(), context).await {
            Err(e) if e.is_auth_failure() => {
                warn!(error = %e.sanitized_message(), "Retrying after re-authentication");
                self.reauthenticate().await?;
                let context = self.context().ok_or_else(|| {
                    crate::error::SydpowerError::internal_error("re-authentication left no tokens")
                })?;
                op(self.api(), context).await
            }
            other => other,
        }
    }
}
