pub mod auth;
pub mod chats;
pub mod config;
pub mod conversation;
pub mod documents;
pub mod error;
pub mod fault;
pub mod operation;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use auth::{AuthHeaders, AuthState, CredentialInjector, CredentialProvider, SessionCredentials};
pub use chats::ChatDirectory;
pub use config::{BackendKind, ClientSettings, ConfigError, Endpoints};
pub use conversation::{ConversationState, Message, MessageRole, Phase};
pub use documents::ChatSummary;
pub use error::{ClientError, GraphQlError};
pub use fault::FaultInterceptor;
pub use operation::{ChannelKind, Operation, OperationKind};
pub use router::{ChannelRouter, Routed};
pub use session::{ChatSession, SessionUpdate};
pub use transport::{GraphQlResponse, MockBackend};
