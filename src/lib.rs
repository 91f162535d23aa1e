#![forbid(unsafe_code)]

pub mod ast;
pub mod cache;
pub mod config;
pub mod deps;
pub mod error;
pub mod minimize;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod walk;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the public vocabulary at crate root for convenience
pub use crate::ast::{
    Argument, AstValue, Document, DocumentError, DocumentSource, Field, FragmentDefinition,
    FragmentSpread, InlineFragment, Operation, OperationKind, Selection, StaticSource, TypeRef,
    VariableDefinition,
};
pub use crate::cache::{
    Cache, CacheBuilder, CachedResponse, ContractError, HandlerContext, HandlerOutcome,
    MutateOptions, MutationHandler, PatchError, PatchOp, QueryOptions, SubscribeOptions,
    SubscriptionDriver, SubscriptionHandle, SubscriptionPatch, SubscriptionRequest, VariableBag,
    VariableValue,
};
pub use crate::config::{CacheConfig, ConfigError, LogFormat, LoggingConfig, PaginationWords};
pub use crate::deps::DependencyIndex;
pub use crate::schema::{FieldDefinition, Schema, TypeDefinition, TypeKind};
pub use crate::store::{CacheAction, CacheState, MemoryStore, StateStore, reduce};
pub use crate::transport::{QueryRequest, ResponsePayload, Transport, TransportError, TransportPhase};
pub use crate::walk::{CallerKey, Denormalized, EntityKey, EntityMap, JsonMap, NormalizedResponse};
