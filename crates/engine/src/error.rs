use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Vault error: {0}")]
    Vault(#[from] vault::VaultError),

    #[error("API client error: {0}")]
    ApiClient(#[from] api_client::ApiError),
}
