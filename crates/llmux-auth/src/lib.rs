//! Credential lifecycle for llmux: typed account storage, the in-memory pool
//! the executors draw from, and per-provider token refresh.

pub mod account;
pub mod constants;
pub mod error;
pub mod manager;
pub mod refresh;
pub mod store;

pub use account::{
    Account, AccountStatus, ApiKeyCredential, AuthMethod, Credential, KiroCredential,
    OAuthTokenCredential, ProviderKind,
};
pub use constants::KiroConstants;
pub use error::AuthError;
pub use manager::{AuthManager, SchedulerConfig};
pub use refresh::{refresh_http_client, KiroRefreshDriver, OAuthRefreshDriver, RefreshDriver};
pub use store::CredentialStore;
