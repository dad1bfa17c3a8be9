#![forbid(unsafe_code)]

//! Security tokens, resolvers, authenticators and derived-key handling.

pub mod authenticator;
pub mod derived;
pub mod nonce;
pub mod resolver;
pub mod timestamp;
pub mod token;

pub use authenticator::TokenAuthenticator;
pub use derived::DerivedKeyStub;
pub use nonce::NonceCache;
pub use resolver::{
    AggregateTokenResolver, HeaderTokenResolver, KeyIdentifier, KeyIdentifierClause, KeyUnwrap,
    ReferenceStyle, TokenResolver,
};
pub use timestamp::SecurityTimestamp;
pub use token::{AuthorizationPolicies, AuthorizationPolicy, SecurityToken, TokenKind};
