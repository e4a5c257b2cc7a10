pub mod callback;
pub mod client;
pub mod credentials;
pub mod delivery;
pub mod exchange;
pub mod flow;
pub mod pkce;
pub mod provider;
pub mod service;
pub mod session;
pub mod store;
pub mod surface;
pub mod validate;

mod error;

pub use callback::CallbackServer;
pub use client::{AuthenticatedClient, ClientFactory, RefreshOutcome};
pub use credentials::{AuthType, BasicCredential, CredentialPatch, OAuth2Credential, ServerCredential};
pub use delivery::{CodeSlot, DeliveredCode};
pub use error::AuthError;
pub use exchange::TokenExchanger;
pub use flow::{AuthorizationFlow, FlowTiming, LoginAttempt, LoginRequest};
pub use provider::{ProviderEndpoints, TokenClient, TokenSet};
pub use service::AuthService;
pub use session::{AuthorizationSessions, PendingAuthorization};
pub use store::{CredentialStore, ServerRecord, SqliteCredentialStore};
pub use surface::{BrowserOrPrint, InteractiveSurface, PrintUrl, SystemBrowser};
pub use validate::{CredentialValidator, ValidationReport};
